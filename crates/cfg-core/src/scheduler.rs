use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::CfgError;

/// One entry in the priority queue (spec.md §4.H). `sequence` is the
/// insertion order, used only to break ties between equal `scheduled_time`s
/// (P5: "if equal, insertion order is preserved").
#[derive(Clone, Copy, Debug)]
struct HeapEntry {
    scheduled_time: f64,
    sequence: u64,
    handler_id: u32,
    value: u32,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.scheduled_time == other.scheduled_time && self.sequence == other.sequence
    }
}

impl Eq for HeapEntry {}

// `BinaryHeap` is a max-heap; reversing the comparison here makes `pop()`
// return the smallest `scheduled_time` (ties broken by the smallest, i.e.
// earliest, `sequence`) without needing a `Reverse<_>` wrapper at call sites.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .scheduled_time
            .total_cmp(&self.scheduled_time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What kind of handler a `FiredEvent` names (spec.md §4.H D3: tick handlers
/// are a separate list from the scheduled-time queue).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiredKind {
    Timed,
    Tick,
}

/// A due event, returned from `process_events` for the loop (or a device
/// collaborator) to act on. The scheduler never calls back into a closure
/// (§9 Design Notes: "never a closure") — `handler_id` is the only identity
/// the caller needs to dispatch on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FiredEvent {
    pub kind: FiredKind,
    pub handler_id: u32,
    pub value: u32,
    pub scheduled_time: f64,
}

/// spec.md §4.H. Drives the cycle-gated hot path: `due()` is the single
/// integer compare the loop performs every executed instruction; the
/// (comparatively expensive) heap drain only runs once that compare trips.
pub struct EmulationLoopScheduler {
    queue: BinaryHeap<HeapEntry>,
    capacity: usize,
    next_sequence: u64,
    next_check_cycles: u64,
    cycles_per_ms: u64,
    tick_handlers: Vec<u32>,
    last_tick_ms: u64,
}

impl EmulationLoopScheduler {
    /// `cycles_per_ms` converts wall/guest milliseconds to the `state.cycles`
    /// unit the hot path compares against, so `due()` never has to touch
    /// floating point.
    pub fn new(capacity: usize, cycles_per_ms: u64) -> Self {
        Self {
            queue: BinaryHeap::new(),
            capacity,
            next_sequence: 0,
            next_check_cycles: u64::MAX,
            cycles_per_ms: cycles_per_ms.max(1),
            tick_handlers: Vec::new(),
            last_tick_ms: 0,
        }
    }

    /// The loop's hot-path gate: `state.cycles < next_check_cycles` inverted,
    /// so a `true` return means `process_events` has work to do.
    pub fn due(&self, cycles: u64) -> bool {
        cycles >= self.next_check_cycles
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn register_tick_handler(&mut self, handler_id: u32) {
        self.tick_handlers.push(handler_id);
    }

    pub fn cycles_per_ms(&self) -> u64 {
        self.cycles_per_ms
    }

    /// Enqueues `(scheduled_time, handler_id, value)` (spec.md §4.H). D1:
    /// callers computing `scheduled_time` for a reschedule fired from inside
    /// `process_events` must derive it from the firing `FiredEvent`'s own
    /// `scheduled_time`, never from wall time — this method has no opinion
    /// on where `scheduled_time` came from, it only enforces capacity (D4).
    pub fn schedule(&mut self, scheduled_time: f64, handler_id: u32, value: u32, cycles_now: u64, time_now_ms: f64) -> Result<(), CfgError> {
        if self.queue.len() >= self.capacity {
            tracing::debug!(capacity = self.capacity, "scheduler queue full, dropping event");
            return Err(CfgError::SchedulerQueueFull { capacity: self.capacity });
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.push(HeapEntry {
            scheduled_time,
            sequence,
            handler_id,
            value,
        });
        self.recompute_threshold(cycles_now, time_now_ms);
        Ok(())
    }

    /// D2: cancels every pending entry for `handler_id` atomically and
    /// recomputes the threshold, returning how many were removed.
    pub fn remove_events(&mut self, handler_id: u32, cycles_now: u64, time_now_ms: f64) -> usize {
        let before = self.queue.len();
        let remaining: Vec<HeapEntry> = self.queue.drain().filter(|e| e.handler_id != handler_id).collect();
        self.queue = BinaryHeap::from(remaining);
        self.recompute_threshold(cycles_now, time_now_ms);
        before - self.queue.len()
    }

    /// Drains every queued entry with `scheduled_time <= time_now_ms`, in
    /// ascending `(scheduled_time, sequence)` order (P5), then fires any
    /// integer-millisecond tick boundaries crossed since the last call (D3).
    /// Recomputes the cycle threshold before returning.
    pub fn process_events(&mut self, cycles_now: u64, time_now_ms: f64) -> Vec<FiredEvent> {
        let mut fired = Vec::new();
        while let Some(top) = self.queue.peek() {
            if top.scheduled_time > time_now_ms {
                break;
            }
            let entry = self.queue.pop().expect("peek just confirmed an entry");
            fired.push(FiredEvent {
                kind: FiredKind::Timed,
                handler_id: entry.handler_id,
                value: entry.value,
                scheduled_time: entry.scheduled_time,
            });
        }

        let elapsed_ms = time_now_ms.max(0.0) as u64;
        while self.last_tick_ms < elapsed_ms {
            self.last_tick_ms += 1;
            for &handler_id in &self.tick_handlers {
                fired.push(FiredEvent {
                    kind: FiredKind::Tick,
                    handler_id,
                    value: 0,
                    scheduled_time: self.last_tick_ms as f64,
                });
            }
        }

        self.recompute_threshold(cycles_now, time_now_ms);
        fired
    }

    fn recompute_threshold(&mut self, cycles_now: u64, time_now_ms: f64) {
        self.next_check_cycles = match self.queue.peek() {
            Some(top) => {
                let delta_ms = (top.scheduled_time - time_now_ms).max(0.0);
                cycles_now.saturating_add((delta_ms * self.cycles_per_ms as f64).ceil() as u64)
            }
            None => u64::MAX,
        };
    }
}
