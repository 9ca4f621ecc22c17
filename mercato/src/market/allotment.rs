use crate::market::PRIORITY_LEVELS;
use crate::market::demand::DemandState;

// The proportional-share engine. Must run under the arenas-list lock; it
// reads the priority lists and demand totals and publishes per-client
// allotments through each client's arena exchange.
impl DemandState {
    /// Divide a worker budget across the priority lists, highest priority
    /// first, and within a level proportionally to each client's demand.
    ///
    /// The integer `carry` keeps the per-level sums exact without floating
    /// point: within one fully funded level the allotments add up to
    /// exactly the level's share, and the split is deterministic given the
    /// list iteration order.
    ///
    /// When the soft limit is zero the budget is at most one permit and it
    /// goes to clients in global concurrency mode only.
    ///
    /// Returns the number of permits handed out.
    pub(crate) fn update_allotment(&self, max_workers: i64, soft_limit_is_zero: bool) -> i64 {
        let max_workers = self.total_demand.min(max_workers).max(0);
        let mut unassigned = max_workers;
        let mut assigned: i64 = 0;
        let mut carry: i64 = 0;
        let mut top_level: Option<usize> = None;

        for level in 0..PRIORITY_LEVELS {
            let per_priority = self.priority_demand[level].min(unassigned);
            unassigned -= per_priority;

            for client in self.arenas[level].iter() {
                let demand = client.num_workers_requested();
                debug_assert!(demand >= 0, "client demand can never go negative");
                if demand == 0 {
                    client.set_allotment(0);
                    client.set_top_priority(false);
                    client.update_allotment();
                    continue;
                }

                if top_level.is_none() {
                    top_level = Some(level);
                }

                let allotted = if soft_limit_is_zero {
                    debug_assert!(max_workers <= 1, "zero soft limit caps the budget at one");
                    i64::from(client.global_concurrency_mode() && assigned < max_workers)
                } else {
                    let tmp = demand * per_priority + carry;
                    let allotted = tmp / self.priority_demand[level];
                    carry = tmp % self.priority_demand[level];
                    debug_assert!(allotted <= demand, "allotment can never exceed demand");
                    allotted
                };

                client.set_allotment(allotted as usize);
                client.set_top_priority(top_level == Some(level));
                client.update_allotment();
                assigned += allotted;
            }
        }

        debug_assert!(
            (0..=max_workers).contains(&assigned),
            "assigned permits exceed the budget"
        );
        assigned
    }
}
