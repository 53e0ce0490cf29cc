use std::collections::HashMap;

use cfg_decoder::{DecodeError, InstructionBytes, Parser};
use cfg_types::{Discriminator, SegmentedAddress};

use crate::graph::{Node, NodeArena, NodeHandle, NodeLinker};

fn read_span<B: InstructionBytes>(bytes: &B, addr: SegmentedAddress, len: u8) -> Vec<u8> {
    (0..len).map(|i| bytes.read_u8(addr.wrapping_add_offset(u16::from(i)))).collect()
}

/// Address -> live node cache, plus a per-address history of every
/// discriminator this address has ever parsed under, used to resurrect a
/// previously-seen instruction instead of re-parsing it (spec.md §4.C).
#[derive(Default)]
pub struct InstructionsFeeder {
    live: HashMap<SegmentedAddress, Node>,
    history: HashMap<SegmentedAddress, Vec<(Discriminator, NodeHandle)>>,
}

impl InstructionsFeeder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_node_at(&self, addr: SegmentedAddress) -> Option<Node> {
        self.live.get(&addr).copied()
    }

    /// spec.md §4.C `get_or_parse`.
    pub fn get_or_parse<B: InstructionBytes>(
        &mut self,
        arena: &mut NodeArena,
        bytes: &B,
        addr: SegmentedAddress,
    ) -> Result<NodeHandle, DecodeError> {
        match self.live.get(&addr).copied() {
            Some(Node::Instruction(handle)) => {
                let (len, disc_final) = {
                    let node = arena.instruction(handle).expect("live map only names instruction nodes here");
                    (node.instruction.length, node.instruction.discriminator_final())
                };
                let live_bytes = read_span(bytes, addr, len);
                if disc_final.matches_concrete_bytes(&live_bytes) {
                    return Ok(handle);
                }

                tracing::warn!(%addr, "self-modification detected, installing selector node");
                arena.instruction_mut(handle).unwrap().is_live = false;
                let selector = arena.alloc_selector(addr);
                arena
                    .selector_mut(selector)
                    .unwrap()
                    .successors_per_discriminator
                    .push((disc_final, handle));
                // `handle` may already have predecessors linked from before this
                // address turned out to be self-modifying; rehome them onto the
                // selector now so their bookkeeping doesn't keep pointing at a
                // dead instruction node (spec.md §4.D).
                NodeLinker::insert_intermediate_predecessor(arena, handle, selector);
                self.live.insert(addr, Node::Selector(selector));

                let new_handle = self.obtain_instruction(arena, bytes, addr)?;
                let new_disc = arena.instruction(new_handle).unwrap().instruction.discriminator_final();
                arena
                    .selector_mut(selector)
                    .unwrap()
                    .successors_per_discriminator
                    .push((new_disc, new_handle));
                Ok(new_handle)
            }
            Some(Node::Selector(selector)) => {
                let candidates = arena.selector(selector).unwrap().successors_per_discriminator.clone();
                for (disc, handle) in &candidates {
                    let live_bytes = read_span(bytes, addr, disc.len() as u8);
                    if disc.matches_concrete_bytes(&live_bytes) {
                        return Ok(*handle);
                    }
                }
                let new_handle = self.obtain_instruction(arena, bytes, addr)?;
                let new_disc = arena.instruction(new_handle).unwrap().instruction.discriminator_final();
                arena
                    .selector_mut(selector)
                    .unwrap()
                    .successors_per_discriminator
                    .push((new_disc, new_handle));
                Ok(new_handle)
            }
            None => {
                let handle = self.obtain_instruction(arena, bytes, addr)?;
                self.live.insert(addr, Node::Instruction(handle));
                Ok(handle)
            }
        }
    }

    /// Resurrects a previously-seen instruction at `addr` whose discriminator
    /// matches the live bytes, or parses a fresh one; records it in the
    /// history map either way. Does not touch the live map — callers decide
    /// whether the result becomes a direct live entry or a selector's newest
    /// candidate.
    fn obtain_instruction<B: InstructionBytes>(
        &mut self,
        arena: &mut NodeArena,
        bytes: &B,
        addr: SegmentedAddress,
    ) -> Result<NodeHandle, DecodeError> {
        if let Some(bucket) = self.history.get(&addr) {
            for (disc, handle) in bucket {
                let live_bytes = read_span(bytes, addr, disc.len() as u8);
                if disc.matches_concrete_bytes(&live_bytes) {
                    let handle = *handle;
                    arena.instruction_mut(handle).unwrap().is_live = true;
                    return Ok(handle);
                }
            }
        }
        let instruction = Parser::parse(bytes, addr)?;
        let disc_final = instruction.discriminator_final();
        let handle = arena.alloc_instruction(instruction);
        self.history.entry(addr).or_default().push((disc_final, handle));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfg_decoder::SliceBytes;

    #[test]
    fn first_parse_then_cache_hit_returns_same_handle() {
        let mut arena = NodeArena::new();
        let mut feeder = InstructionsFeeder::new();
        let addr = SegmentedAddress::new(0x0100, 0x0000);
        let code = [0xB8u8, 0x34, 0x12]; // MOV AX, 0x1234
        let src = SliceBytes::new(addr, &code);
        let a = feeder.get_or_parse(&mut arena, &src, addr).unwrap();
        let b = feeder.get_or_parse(&mut arena, &src, addr).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_final_byte_patch_reuses_the_same_node() {
        // Scenario S3: patching the immediate does not invalidate the node.
        let mut arena = NodeArena::new();
        let mut feeder = InstructionsFeeder::new();
        let addr = SegmentedAddress::new(0x0100, 0x0000);
        let mut code = [0xB8u8, 0x34, 0x12];
        let a = {
            let src = SliceBytes::new(addr, &code);
            feeder.get_or_parse(&mut arena, &src, addr).unwrap()
        };
        code[1] = 0x78;
        code[2] = 0x56;
        let b = {
            let src = SliceBytes::new(addr, &code);
            feeder.get_or_parse(&mut arena, &src, addr).unwrap()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn predecessor_relinking_a_self_modified_address_does_not_raise_a_discrepancy() {
        // An established predecessor edge survives a selector-node takeover:
        // once `pred` has linked to the original instruction at `addr`, a
        // second link after self-modification must land on the selector
        // through the rewired edge rather than raising
        // `UnhandledCfgDiscrepancy` against the now-dead handle.
        let mut arena = NodeArena::new();
        let mut feeder = InstructionsFeeder::new();
        let mut linker = NodeLinker::new();

        let pred_addr = SegmentedAddress::new(0x0100, 0x0000);
        let addr = SegmentedAddress::new(0x0100, 0x0001);
        let pred_code = [0x90u8]; // NOP, falls through to `addr`
        let pred = {
            let src = SliceBytes::new(pred_addr, &pred_code);
            feeder.get_or_parse(&mut arena, &src, pred_addr).unwrap()
        };

        let mut code = [0x90u8]; // NOP at `addr`
        let nop = {
            let src = SliceBytes::new(addr, &code);
            feeder.get_or_parse(&mut arena, &src, addr).unwrap()
        };
        linker.link(&mut arena, Some(pred), nop).unwrap();

        code[0] = 0xF4; // HLT: self-modification installs a selector at `addr`
        let hlt = {
            let src = SliceBytes::new(addr, &code);
            feeder.get_or_parse(&mut arena, &src, addr).unwrap()
        };
        assert_ne!(nop, hlt);

        // `pred` re-executes and re-links to the address it already knows,
        // now resolved to the replacement instruction behind the selector.
        linker.link(&mut arena, Some(pred), hlt).expect("must not raise a discrepancy");
        assert_eq!(arena.instruction(pred).unwrap().successors_per_address[&addr], hlt);
    }

    #[test]
    fn opcode_patch_installs_a_selector_node() {
        // Scenario S4.
        let mut arena = NodeArena::new();
        let mut feeder = InstructionsFeeder::new();
        let addr = SegmentedAddress::new(0x0100, 0x0000);
        let mut code = [0x90u8]; // NOP
        let nop = {
            let src = SliceBytes::new(addr, &code);
            feeder.get_or_parse(&mut arena, &src, addr).unwrap()
        };
        code[0] = 0xF4; // HLT
        let hlt = {
            let src = SliceBytes::new(addr, &code);
            feeder.get_or_parse(&mut arena, &src, addr).unwrap()
        };
        assert_ne!(nop, hlt);
        assert!(!arena.instruction(nop).unwrap().is_live);
        match feeder.live_node_at(addr) {
            Some(Node::Selector(_)) => {}
            other => panic!("expected a selector node, got {other:?}"),
        }
    }
}
