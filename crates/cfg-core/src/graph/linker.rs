use cfg_decoder::InstructionShape;

use crate::error::CfgError;
use crate::graph::arena::{NodeArena, NodeHandle, SuccessorType};

fn is_return_shape(shape: &InstructionShape) -> bool {
    matches!(shape, InstructionShape::RetNear { .. } | InstructionShape::RetFar { .. } | InstructionShape::IRet)
}

fn is_call_shape(shape: &InstructionShape) -> bool {
    matches!(
        shape,
        InstructionShape::CallNear { .. } | InstructionShape::CallFar { .. } | InstructionShape::CallFarIndirect { .. }
    )
}

/// Whether `prev`'s existing successor-at-address (`occupant`) is consistent
/// with linking to `next` instead of strictly identical to it. `occupant` is
/// accepted either by handle equality or, when `occupant` is itself a
/// `SelectorNode` a self-modification event installed over the address,
/// because `next` is one of its known candidates — a predecessor whose
/// bookkeeping still names the selector (set by `insert_intermediate_
/// predecessor` at the moment the selector replaced a plain instruction)
/// must not be treated as pointing at "a different node".
fn occupant_accepts(arena: &NodeArena, occupant: NodeHandle, next: NodeHandle) -> bool {
    if occupant == next {
        return true;
    }
    let Some(selector) = arena.selector(occupant) else {
        return false;
    };
    selector.successors_per_discriminator.iter().any(|(_, handle)| *handle == next)
}

/// Attaches the just-executed node to the previous one with a typed
/// successor, and pairs `CALL`/`RET` edges (spec.md §4.D). `current_call`
/// remembers the most recently linked `CALL` instruction so the matching
/// `RET`, whenever it is reached, can attach a `CallToReturn` (or
/// `CallToMisalignedReturn`) edge directly from the call site — spec.md's
/// own wording ("clear the 'current call' marker") models this as a single
/// slot rather than a full call stack, which the `ExecutionContextManager`
/// tracks separately for debugger purposes.
#[derive(Default)]
pub struct NodeLinker {
    current_call: Option<NodeHandle>,
}

impl NodeLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, arena: &mut NodeArena, prev: Option<NodeHandle>, next: NodeHandle) -> Result<(), CfgError> {
        let Some(prev) = prev else {
            return Ok(());
        };

        if arena.is_selector(prev) {
            let next_disc = arena
                .instruction(next)
                .map(|n| n.instruction.discriminator())
                .ok_or_else(|| CfgError::discrepancy("NodeLinker::link", "selector's successor must be an instruction node"))?;
            let selector = arena.selector(prev).expect("checked is_selector above");
            if let Some((_, existing)) = selector
                .successors_per_discriminator
                .iter()
                .find(|(d, _)| d.compatible_with(&next_disc))
            {
                if *existing != next {
                    return Err(CfgError::discrepancy(
                        "NodeLinker::link",
                        "selector's discriminator already mapped to a different instruction",
                    ));
                }
            }
            arena.link(prev, next, SuccessorType::Normal);
            return Ok(());
        }

        let next_address = arena.address_of(next);
        if let Some(&existing) = arena.instruction(prev).and_then(|n| n.successors_per_address.get(&next_address)) {
            if !occupant_accepts(arena, existing, next) {
                return Err(CfgError::discrepancy(
                    "NodeLinker::link",
                    format!("slot for address {next_address} already occupied by a different node"),
                ));
            }
        }

        let prev_is_return = arena.instruction(prev).map(|n| is_return_shape(&n.instruction.shape)).unwrap_or(false);
        let prev_is_call = arena.instruction(prev).map(|n| is_call_shape(&n.instruction.shape)).unwrap_or(false);

        arena.link(prev, next, SuccessorType::Normal);

        if prev_is_return {
            if let Some(call) = self.current_call.take() {
                let call_node = arena.instruction(call).expect("current_call always names an instruction node");
                let fallthrough = call_node.instruction.address.wrapping_add_offset(u16::from(call_node.instruction.length));
                let kind = if fallthrough == next_address {
                    SuccessorType::CallToReturn
                } else {
                    SuccessorType::CallToMisalignedReturn
                };
                arena.link(call, next, kind);
            }
        }
        if prev_is_call {
            self.current_call = Some(prev);
        }

        Ok(())
    }

    /// Rewires every predecessor of `current` to `new_pred` instead, then
    /// links `new_pred -> current` (spec.md §4.D) — used when a
    /// `SelectorNode` takes over an address previously held by a plain
    /// instruction. An associated function rather than a method: it touches
    /// no `NodeLinker` state, so the feeder can call it without holding a
    /// `NodeLinker` instance of its own.
    pub fn insert_intermediate_predecessor(arena: &mut NodeArena, current: NodeHandle, new_pred: NodeHandle) {
        let preds: Vec<NodeHandle> = match arena.instruction(current) {
            Some(n) => n.predecessors.iter().copied().collect(),
            None => arena.selector(current).map(|n| n.predecessors.iter().copied().collect()).unwrap_or_default(),
        };
        let current_address = arena.address_of(current);
        for pred in preds {
            if let Some(pn) = arena.instruction_mut(pred) {
                pn.successors.remove(&current);
                pn.successors_per_address.remove(&current_address);
                for set in pn.successors_per_type.values_mut() {
                    set.remove(&current);
                }
            }
            arena.link(pred, new_pred, SuccessorType::Normal);
        }
        arena.link(new_pred, current, SuccessorType::Normal);
    }

    /// Re-homes every edge (predecessor and successor) from `old` to `new`,
    /// merging `old`'s `successors_per_type` into `new`'s (spec.md §4.D). A
    /// general graph-surgery primitive for host tooling (e.g. a debugger
    /// command that merges two candidates under one selector) — the core
    /// `get_or_parse`/`link` algorithm never needs a full supersession like
    /// this, since a `SelectorNode` only ever gets installed once per
    /// address (`insert_intermediate_predecessor` handles that transition).
    pub fn replace_instruction(arena: &mut NodeArena, old: NodeHandle, new: NodeHandle) {
        let (old_preds, old_succs, old_types): (Vec<_>, Vec<_>, Vec<_>) = match arena.instruction(old) {
            Some(n) => (
                n.predecessors.iter().copied().collect(),
                n.successors.iter().copied().collect(),
                n.successors_per_type
                    .iter()
                    .flat_map(|(k, set)| set.iter().map(move |h| (*k, *h)))
                    .collect(),
            ),
            None => return,
        };

        for pred in &old_preds {
            if let Some(pn) = arena.instruction_mut(*pred) {
                pn.successors.remove(&old);
            }
            arena.link(*pred, new, SuccessorType::Normal);
        }
        for succ in &old_succs {
            arena.link(new, *succ, SuccessorType::Normal);
        }
        for (kind, handle) in old_types {
            arena.link(new, handle, kind);
        }
        if let Some(old_node) = arena.instruction_mut(old) {
            old_node.is_live = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfg_decoder::{CfgInstruction, Width};
    use cfg_types::{Discriminator, InstructionField, SegmentedAddress};

    fn addr(offset: u16) -> SegmentedAddress {
        SegmentedAddress::new(0x0100, offset)
    }

    fn instruction_with_len(address: SegmentedAddress, shape: InstructionShape, len: u8) -> CfgInstruction {
        let fields = vec![InstructionField::new(0u8, address, 0, len, vec![None; len as usize], false, false)];
        CfgInstruction::new(address, fields, shape)
    }

    fn instruction_with_discriminator(address: SegmentedAddress, shape: InstructionShape, byte: u8) -> CfgInstruction {
        let field = InstructionField::new(byte, address, 0, 1, vec![Some(byte)], true, true);
        CfgInstruction::new(address, vec![field], shape)
    }

    fn nop(address: SegmentedAddress) -> CfgInstruction {
        instruction_with_len(address, InstructionShape::Nop, 1)
    }

    #[test]
    fn normal_edge_links_predecessor_and_successor() {
        let mut arena = NodeArena::new();
        let mut linker = NodeLinker::new();
        let a = arena.alloc_instruction(nop(addr(0)));
        let b = arena.alloc_instruction(nop(addr(1)));
        linker.link(&mut arena, Some(a), b).unwrap();
        assert!(arena.instruction(a).unwrap().successors.contains(&b));
        assert!(arena.instruction(b).unwrap().predecessors.contains(&a));
        assert!(arena.instruction(a).unwrap().successors_per_type[&SuccessorType::Normal].contains(&b));
    }

    #[test]
    fn link_with_no_predecessor_is_a_no_op() {
        let mut arena = NodeArena::new();
        let mut linker = NodeLinker::new();
        let b = arena.alloc_instruction(nop(addr(0)));
        linker.link(&mut arena, None, b).unwrap();
        assert!(arena.instruction(b).unwrap().predecessors.is_empty());
    }

    #[test]
    fn call_then_aligned_return_produces_call_to_return_edge() {
        let mut arena = NodeArena::new();
        let mut linker = NodeLinker::new();
        // CALL NEAR rel16 at offset 0, 3 bytes long, falls through to offset 3.
        let call = arena.alloc_instruction(instruction_with_len(addr(0), InstructionShape::CallNear { width: Width::Word }, 3));
        let callee = arena.alloc_instruction(nop(addr(0x50)));
        linker.link(&mut arena, Some(call), callee).unwrap();

        let ret = arena.alloc_instruction(instruction_with_len(addr(0x50), InstructionShape::RetNear { pop_bytes: 0 }, 1));
        linker.link(&mut arena, Some(callee), ret).unwrap();

        // Execution resumes exactly at the call's fallthrough address.
        let after_call = arena.alloc_instruction(nop(addr(3)));
        linker.link(&mut arena, Some(ret), after_call).unwrap();

        let call_node = arena.instruction(call).unwrap();
        assert!(call_node.successors_per_type[&SuccessorType::CallToReturn].contains(&after_call));
    }

    #[test]
    fn call_then_misaligned_return_produces_call_to_misaligned_return_edge() {
        let mut arena = NodeArena::new();
        let mut linker = NodeLinker::new();
        let call = arena.alloc_instruction(instruction_with_len(addr(0), InstructionShape::CallNear { width: Width::Word }, 3));
        let callee = arena.alloc_instruction(nop(addr(0x50)));
        linker.link(&mut arena, Some(call), callee).unwrap();

        let ret = arena.alloc_instruction(instruction_with_len(addr(0x50), InstructionShape::RetNear { pop_bytes: 0 }, 1));
        linker.link(&mut arena, Some(callee), ret).unwrap();

        // Lands somewhere other than the call's fallthrough address.
        let elsewhere = arena.alloc_instruction(nop(addr(9)));
        linker.link(&mut arena, Some(ret), elsewhere).unwrap();

        let call_node = arena.instruction(call).unwrap();
        assert!(call_node.successors_per_type[&SuccessorType::CallToMisalignedReturn].contains(&elsewhere));
    }

    #[test]
    fn selector_predecessor_accepts_a_known_compatible_discriminator() {
        let mut arena = NodeArena::new();
        let mut linker = NodeLinker::new();
        let selector_addr = addr(0);
        let nop_handle = arena.alloc_instruction(instruction_with_discriminator(selector_addr, InstructionShape::Nop, 0x90));
        let hlt_handle = arena.alloc_instruction(instruction_with_discriminator(selector_addr, InstructionShape::Hlt, 0xF4));
        let selector = arena.alloc_selector(selector_addr);
        arena
            .selector_mut(selector)
            .unwrap()
            .successors_per_discriminator
            .push((Discriminator::new(vec![Some(0x90)]), nop_handle));
        arena
            .selector_mut(selector)
            .unwrap()
            .successors_per_discriminator
            .push((Discriminator::new(vec![Some(0xF4)]), hlt_handle));

        linker.link(&mut arena, Some(selector), hlt_handle).unwrap();
        assert!(arena.instruction(hlt_handle).unwrap().predecessors.contains(&selector));
    }

    #[test]
    fn selector_predecessor_raises_a_discrepancy_on_a_conflicting_discriminator() {
        let mut arena = NodeArena::new();
        let mut linker = NodeLinker::new();
        let selector_addr = addr(0);
        let nop_handle = arena.alloc_instruction(instruction_with_discriminator(selector_addr, InstructionShape::Nop, 0x90));
        let other_handle = arena.alloc_instruction(instruction_with_discriminator(selector_addr, InstructionShape::Nop, 0x90));
        let selector = arena.alloc_selector(selector_addr);
        arena
            .selector_mut(selector)
            .unwrap()
            .successors_per_discriminator
            .push((Discriminator::new(vec![Some(0x90)]), nop_handle));

        // `other_handle` shares the same discriminator byte as `nop_handle`
        // but is a different node: a host-level bug, not reachable from a
        // correctly-behaving guest.
        let err = linker.link(&mut arena, Some(selector), other_handle).unwrap_err();
        match err {
            CfgError::UnhandledCfgDiscrepancy { .. } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn occupied_slot_with_an_unrelated_node_raises_a_discrepancy() {
        let mut arena = NodeArena::new();
        let mut linker = NodeLinker::new();
        let a = arena.alloc_instruction(nop(addr(0)));
        let b = arena.alloc_instruction(nop(addr(1)));
        let c = arena.alloc_instruction(nop(addr(1)));
        linker.link(&mut arena, Some(a), b).unwrap();

        let err = linker.link(&mut arena, Some(a), c).unwrap_err();
        match err {
            CfgError::UnhandledCfgDiscrepancy { .. } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn insert_intermediate_predecessor_rewires_existing_predecessors() {
        let mut arena = NodeArena::new();
        let mut linker = NodeLinker::new();
        let pred = arena.alloc_instruction(nop(addr(0)));
        let current = arena.alloc_instruction(nop(addr(1)));
        linker.link(&mut arena, Some(pred), current).unwrap();

        let selector = arena.alloc_selector(addr(1));
        NodeLinker::insert_intermediate_predecessor(&mut arena, current, selector);

        assert!(!arena.instruction(pred).unwrap().successors.contains(&current));
        assert_eq!(arena.instruction(pred).unwrap().successors_per_address[&addr(1)], selector);
        assert!(arena.selector(selector).unwrap().predecessors.contains(&pred));
        assert!(arena.instruction(current).unwrap().predecessors.contains(&selector));
    }

    #[test]
    fn replace_instruction_rehomes_every_edge_and_marks_the_old_node_dead() {
        let mut arena = NodeArena::new();
        let mut linker = NodeLinker::new();
        let pred = arena.alloc_instruction(nop(addr(0)));
        let old = arena.alloc_instruction(nop(addr(1)));
        let succ = arena.alloc_instruction(nop(addr(2)));
        linker.link(&mut arena, Some(pred), old).unwrap();
        linker.link(&mut arena, Some(old), succ).unwrap();

        let new = arena.alloc_instruction(nop(addr(1)));
        NodeLinker::replace_instruction(&mut arena, old, new);

        assert!(!arena.instruction(pred).unwrap().successors.contains(&old));
        assert!(arena.instruction(pred).unwrap().successors.contains(&new));
        assert!(arena.instruction(new).unwrap().successors.contains(&succ));
        assert!(arena.instruction(succ).unwrap().predecessors.contains(&new));
        assert!(!arena.instruction(old).unwrap().is_live);
    }
}
