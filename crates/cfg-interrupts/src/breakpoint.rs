/// What a breakpoint's `key` is matched against (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    Execution,
    MemoryRead,
    MemoryWrite,
    CycleCount,
}

/// `(kind, key, one_shot, callback_id)` — spec.md §6 breakpoint model.
/// `key` is a linear address for `Execution`/`MemoryRead`/`MemoryWrite`, or a
/// target cycle count for `CycleCount`. One-shot breakpoints (used by
/// `ExecutionContextManager` to restore a context on its expected return
/// address) are removed by the caller once hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub kind: BreakpointKind,
    pub key: u64,
    pub one_shot: bool,
    pub callback_id: u32,
}

impl Breakpoint {
    pub fn new(kind: BreakpointKind, key: u64, one_shot: bool, callback_id: u32) -> Self {
        Self {
            kind,
            key,
            one_shot,
            callback_id,
        }
    }
}

/// A small table of active breakpoints, consulted once per emulation step
/// (spec.md §4.I). Kept here (rather than in `cfg-core`) since it is a pure
/// collaborator-facing model with no dependency on `Memory`/`Registers`.
#[derive(Clone, Debug, Default)]
pub struct BreakpointTable {
    entries: Vec<Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, bp: Breakpoint) {
        self.entries.push(bp);
    }

    /// Returns every breakpoint matching `kind`/`key`, removing the one-shot
    /// ones from the table.
    pub fn take_hits(&mut self, kind: BreakpointKind, key: u64) -> Vec<Breakpoint> {
        let mut hits = Vec::new();
        self.entries.retain(|bp| {
            let matches = bp.kind == kind && bp.key == key;
            if matches {
                hits.push(*bp);
            }
            !(matches && bp.one_shot)
        });
        hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_breakpoint_is_removed_after_hit() {
        let mut table = BreakpointTable::new();
        table.insert(Breakpoint::new(BreakpointKind::Execution, 0x100, true, 7));
        let hits = table.take_hits(BreakpointKind::Execution, 0x100);
        assert_eq!(hits.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn persistent_breakpoint_survives_a_hit() {
        let mut table = BreakpointTable::new();
        table.insert(Breakpoint::new(BreakpointKind::MemoryWrite, 0xB8000, false, 1));
        table.take_hits(BreakpointKind::MemoryWrite, 0xB8000);
        assert_eq!(table.len(), 1);
    }
}
