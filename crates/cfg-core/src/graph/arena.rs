use std::collections::{HashMap, HashSet};

use cfg_decoder::CfgInstruction;
use cfg_types::{Discriminator, SegmentedAddress};

/// A handle into the `NodeArena` (spec.md §9 Design Notes: "addresses them
/// by small integer handles" instead of reference-counted back-pointers).
/// Handles are never reused, so a stale handle held by a debugger view is
/// simply a dangling reference to a slot that is still present but marked
/// `not_live`, never silently repointed at an unrelated node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle(u32);

/// The typed successor relation an edge carries (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SuccessorType {
    Normal,
    CallToReturn,
    CallToMisalignedReturn,
    CpuFault,
}

/// A parsed instruction plus its graph bookkeeping (spec.md §3
/// `CfgInstruction`'s `predecessors`/`successors`/.../`is_live`, split out
/// of the graph-independent `cfg_decoder::CfgInstruction` per Design Notes).
#[derive(Clone, Debug)]
pub struct InstructionNode {
    pub instruction: CfgInstruction,
    pub is_live: bool,
    pub predecessors: HashSet<NodeHandle>,
    pub successors: HashSet<NodeHandle>,
    pub successors_per_address: HashMap<SegmentedAddress, NodeHandle>,
    pub successors_per_type: HashMap<SuccessorType, HashSet<NodeHandle>>,
}

impl InstructionNode {
    fn new(instruction: CfgInstruction) -> Self {
        Self {
            instruction,
            is_live: true,
            predecessors: HashSet::new(),
            successors: HashSet::new(),
            successors_per_address: HashMap::new(),
            successors_per_type: HashMap::new(),
        }
    }
}

/// A polymorphic node discriminating between multiple historical byte
/// patterns seen at one address (spec.md §3 `SelectorNode`). The map is kept
/// as an ordered `Vec` rather than a `HashMap<Discriminator, _>` because
/// `Discriminator`'s comparison is not transitive and must never back a hash
/// map (spec.md §9 Design Notes) — lookups scan this list and match with
/// `Discriminator::matches_concrete_bytes` against live memory.
#[derive(Clone, Debug)]
pub struct SelectorNode {
    pub address: SegmentedAddress,
    pub successors_per_discriminator: Vec<(Discriminator, NodeHandle)>,
    pub predecessors: HashSet<NodeHandle>,
}

impl SelectorNode {
    fn new(address: SegmentedAddress) -> Self {
        Self {
            address,
            successors_per_discriminator: Vec::new(),
            predecessors: HashSet::new(),
        }
    }

    pub fn resolve(&self, live_bytes: &[u8]) -> Option<NodeHandle> {
        self.successors_per_discriminator
            .iter()
            .find(|(disc, _)| disc.matches_concrete_bytes(live_bytes))
            .map(|(_, handle)| *handle)
    }
}

enum Slot {
    Instruction(InstructionNode),
    Selector(SelectorNode),
}

/// Owns every node ever created (spec.md §9 Design Notes arena). Replacement
/// never frees or repoints a handle: the old instruction's handle is marked
/// `not_live` and a fresh handle is allocated for its replacement, so every
/// handle any predecessor/successor set holds stays valid for the arena's
/// whole lifetime (spec.md §5 "marked not-live but not immediately freed").
#[derive(Default)]
pub struct NodeArena {
    slots: Vec<Slot>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn alloc_instruction(&mut self, instruction: CfgInstruction) -> NodeHandle {
        let handle = NodeHandle(self.slots.len() as u32);
        self.slots.push(Slot::Instruction(InstructionNode::new(instruction)));
        handle
    }

    pub fn alloc_selector(&mut self, address: SegmentedAddress) -> NodeHandle {
        let handle = NodeHandle(self.slots.len() as u32);
        self.slots.push(Slot::Selector(SelectorNode::new(address)));
        handle
    }

    pub fn instruction(&self, handle: NodeHandle) -> Option<&InstructionNode> {
        match &self.slots[handle.0 as usize] {
            Slot::Instruction(n) => Some(n),
            Slot::Selector(_) => None,
        }
    }

    pub fn instruction_mut(&mut self, handle: NodeHandle) -> Option<&mut InstructionNode> {
        match &mut self.slots[handle.0 as usize] {
            Slot::Instruction(n) => Some(n),
            Slot::Selector(_) => None,
        }
    }

    pub fn selector(&self, handle: NodeHandle) -> Option<&SelectorNode> {
        match &self.slots[handle.0 as usize] {
            Slot::Selector(n) => Some(n),
            Slot::Instruction(_) => None,
        }
    }

    pub fn selector_mut(&mut self, handle: NodeHandle) -> Option<&mut SelectorNode> {
        match &mut self.slots[handle.0 as usize] {
            Slot::Selector(n) => Some(n),
            Slot::Instruction(_) => None,
        }
    }

    pub fn is_selector(&self, handle: NodeHandle) -> bool {
        matches!(self.slots[handle.0 as usize], Slot::Selector(_))
    }

    pub fn address_of(&self, handle: NodeHandle) -> SegmentedAddress {
        match &self.slots[handle.0 as usize] {
            Slot::Instruction(n) => n.instruction.address,
            Slot::Selector(n) => n.address,
        }
    }

    /// Records `to` as a typed successor of `from` and `from` as a
    /// predecessor of `to` in the same call, keeping I2/I3 in lockstep.
    pub fn link(&mut self, from: NodeHandle, to: NodeHandle, kind: SuccessorType) {
        let to_address = self.address_of(to);
        if let Slot::Instruction(n) = &mut self.slots[from.0 as usize] {
            n.successors.insert(to);
            n.successors_per_address.insert(to_address, to);
            n.successors_per_type.entry(kind).or_default().insert(to);
        }
        match &mut self.slots[to.0 as usize] {
            Slot::Instruction(n) => {
                n.predecessors.insert(from);
            }
            Slot::Selector(n) => {
                n.predecessors.insert(from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfg_decoder::{InstructionShape, Width};

    fn dummy_instruction(address: SegmentedAddress) -> CfgInstruction {
        CfgInstruction::new(address, Vec::new(), InstructionShape::MovRegImm { reg: 0, width: Width::Word })
    }

    #[test]
    fn link_keeps_predecessor_and_successor_in_sync() {
        let mut arena = NodeArena::new();
        let a = arena.alloc_instruction(dummy_instruction(SegmentedAddress::new(0, 0)));
        let b = arena.alloc_instruction(dummy_instruction(SegmentedAddress::new(0, 3)));
        arena.link(a, b, SuccessorType::Normal);
        assert!(arena.instruction(a).unwrap().successors.contains(&b));
        assert!(arena.instruction(b).unwrap().predecessors.contains(&a));
        assert_eq!(arena.instruction(a).unwrap().successors_per_address[&SegmentedAddress::new(0, 3)], b);
    }

    #[test]
    fn selector_resolves_by_matching_discriminator() {
        let mut arena = NodeArena::new();
        let addr = SegmentedAddress::new(0, 0);
        let nop = arena.alloc_instruction(dummy_instruction(addr));
        let selector = arena.alloc_selector(addr);
        let disc = Discriminator::new(vec![Some(0x90)]);
        arena.selector_mut(selector).unwrap().successors_per_discriminator.push((disc, nop));
        assert_eq!(arena.selector(selector).unwrap().resolve(&[0x90]), Some(nop));
        assert_eq!(arena.selector(selector).unwrap().resolve(&[0xF4]), None);
    }
}
