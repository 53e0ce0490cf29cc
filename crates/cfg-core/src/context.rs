use std::collections::HashMap;

use cfg_types::SegmentedAddress;

use crate::graph::Node;

/// Handle into the `ExecutionContextManager`'s own arena (spec.md §9 Design
/// Notes: "store contexts in an arena; the return-stack holds handles").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextHandle(u32);

/// spec.md §3 `ExecutionContext`. `function_handler` is realized as a plain
/// call-stack tracker rather than a full telemetry subsystem (SPEC_FULL.md
/// Module F) — good enough for a debugger's "current call stack" view.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub entry_point: SegmentedAddress,
    pub depth: u32,
    pub last_executed: Option<Node>,
    pub next_according_to_graph: Option<Node>,
    pub function_handler: Vec<SegmentedAddress>,
}

impl ExecutionContext {
    fn new(entry_point: SegmentedAddress, depth: u32) -> Self {
        Self {
            entry_point,
            depth,
            last_executed: None,
            next_according_to_graph: None,
            function_handler: Vec::new(),
        }
    }
}

/// spec.md §4.E. Owns every `ExecutionContext` ever created; `current` names
/// the live one. `entry_points` lets a repeated entry (e.g. the same ISR
/// firing again) find its existing context instead of allocating a fresh one
/// each time.
pub struct ExecutionContextManager {
    contexts: Vec<ExecutionContext>,
    current: ContextHandle,
    entry_points: HashMap<SegmentedAddress, ContextHandle>,
    returns: HashMap<SegmentedAddress, Vec<ContextHandle>>,
}

impl ExecutionContextManager {
    /// Starts with a single root context at `entry`, matching the guest's
    /// initial CS:IP (spec.md §6 `signal_entry`).
    pub fn new(entry: SegmentedAddress) -> Self {
        let root = ExecutionContext::new(entry, 0);
        let mut entry_points = HashMap::new();
        entry_points.insert(entry, ContextHandle(0));
        Self {
            contexts: vec![root],
            current: ContextHandle(0),
            entry_points,
            returns: HashMap::new(),
        }
    }

    pub fn current_handle(&self) -> ContextHandle {
        self.current
    }

    pub fn current(&self) -> &ExecutionContext {
        &self.contexts[self.current.0 as usize]
    }

    pub fn current_mut(&mut self) -> &mut ExecutionContext {
        &mut self.contexts[self.current.0 as usize]
    }

    pub fn get(&self, handle: ContextHandle) -> &ExecutionContext {
        &self.contexts[handle.0 as usize]
    }

    /// spec.md §4.E `signal_new_context`. `expected_return` is the address
    /// the pushed (previous) context resumes at, e.g. the pre-interrupt
    /// CS:IP for an ISR; `None` is used only for the very first call.
    pub fn signal_new_context(&mut self, entry: SegmentedAddress, expected_return: Option<SegmentedAddress>) -> ContextHandle {
        let previous = self.current;
        let depth = self.current().depth + 1;

        let handle = match self.entry_points.get(&entry).copied() {
            Some(handle) => {
                let ctx = &mut self.contexts[handle.0 as usize];
                ctx.last_executed = None;
                ctx.next_according_to_graph = None;
                handle
            }
            None => {
                let handle = ContextHandle(self.contexts.len() as u32);
                self.contexts.push(ExecutionContext::new(entry, depth));
                self.entry_points.insert(entry, handle);
                handle
            }
        };

        if let Some(expected_return) = expected_return {
            tracing::debug!(%expected_return, depth, "pushing execution context");
            self.returns.entry(expected_return).or_default().push(previous);
        }

        self.current = handle;
        handle
    }

    /// spec.md §4.E `maybe_restore_at`. Pops the most recently pushed
    /// context waiting on `ip`, if any — last in, first out, so nested
    /// reentrant ISRs unwind in reverse order (I6-like discipline, P6).
    pub fn maybe_restore_at(&mut self, ip: SegmentedAddress) -> bool {
        match self.returns.get_mut(&ip).and_then(Vec::pop) {
            Some(restored) => {
                tracing::debug!(%ip, "restoring execution context");
                self.current = restored;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_and_restore_round_trips_to_the_caller_context() {
        let entry = SegmentedAddress::new(0x0000, 0x0100);
        let mut mgr = ExecutionContextManager::new(entry);
        let root = mgr.current_handle();

        let isr_entry = SegmentedAddress::new(0x0000, 0x0020);
        let return_addr = SegmentedAddress::new(0x0000, 0x0103);
        mgr.signal_new_context(isr_entry, Some(return_addr));
        assert_ne!(mgr.current_handle(), root);

        assert!(mgr.maybe_restore_at(return_addr));
        assert_eq!(mgr.current_handle(), root);
    }

    #[test]
    fn nested_contexts_restore_in_reverse_order() {
        // P6: C1, C2, C3 pushed with the same expected_return restore as
        // C3, C2, C1.
        let entry = SegmentedAddress::new(0x0000, 0x0100);
        let mut mgr = ExecutionContextManager::new(entry);
        let c1 = mgr.current_handle();

        let r = SegmentedAddress::new(0x0000, 0x0200);
        mgr.signal_new_context(SegmentedAddress::new(0x0000, 0x0020), Some(r));
        let c2 = mgr.current_handle();
        mgr.signal_new_context(SegmentedAddress::new(0x0000, 0x0030), Some(r));
        let c3 = mgr.current_handle();
        mgr.signal_new_context(SegmentedAddress::new(0x0000, 0x0040), Some(r));
        let c4 = mgr.current_handle();

        assert_eq!(mgr.current_handle(), c4);
        assert!(mgr.maybe_restore_at(r));
        assert_eq!(mgr.current_handle(), c3);
        assert!(mgr.maybe_restore_at(r));
        assert_eq!(mgr.current_handle(), c2);
        assert!(mgr.maybe_restore_at(r));
        assert_eq!(mgr.current_handle(), c1);
        assert!(!mgr.maybe_restore_at(r));
    }

    #[test]
    fn restore_with_no_pending_return_is_a_no_op() {
        let entry = SegmentedAddress::new(0x0000, 0x0100);
        let mut mgr = ExecutionContextManager::new(entry);
        let root = mgr.current_handle();
        assert!(!mgr.maybe_restore_at(SegmentedAddress::new(0x0000, 0x9999)));
        assert_eq!(mgr.current_handle(), root);
    }
}
