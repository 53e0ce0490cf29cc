//! Property coverage for `EmulationLoopScheduler`'s fire-order invariant
//! (spec.md P5: "events fire in non-decreasing `scheduled_time` order, ties
//! broken by insertion order"), complementing the fixed-case units already
//! in `cfg-core::scheduler`'s own `#[cfg(test)]` module.

use cfg_core::EmulationLoopScheduler;
use proptest::prelude::*;

proptest! {
    #[test]
    fn fires_in_nondecreasing_scheduled_time_order_regardless_of_insertion_order(
        times in prop::collection::vec(0.0f64..1000.0, 1..64),
    ) {
        let mut sched = EmulationLoopScheduler::new(times.len() + 1, 1_000);
        for (handler_id, t) in times.iter().enumerate() {
            sched.schedule(*t, handler_id as u32, 0, 0, 0.0).unwrap();
        }

        let time_now_ms = times.iter().cloned().fold(0.0, f64::max) + 1.0;
        let fired = sched.process_events(0, time_now_ms);
        prop_assert_eq!(fired.len(), times.len());

        for pair in fired.windows(2) {
            prop_assert!(pair[0].scheduled_time <= pair[1].scheduled_time);
        }

        // Ties preserve insertion order: among entries sharing a
        // `scheduled_time`, `handler_id` (== insertion index here) must
        // come out ascending.
        let mut i = 0;
        while i < fired.len() {
            let mut j = i + 1;
            while j < fired.len() && fired[j].scheduled_time == fired[i].scheduled_time {
                j += 1;
            }
            for pair in fired[i..j].windows(2) {
                prop_assert!(pair[0].handler_id < pair[1].handler_id);
            }
            i = j;
        }
    }
}
