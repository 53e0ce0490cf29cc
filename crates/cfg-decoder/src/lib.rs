//! Parses raw x86 real-mode bytes into a [`CfgInstruction`] (spec.md §4.B,
//! §4.F opcode coverage). Graph/arena bookkeeping is `cfg-core`'s job; this
//! crate only turns bytes into a typed, re-playable instruction value.

pub mod builders;
pub mod bytes;
pub mod cursor;
pub mod error;
pub mod instruction;
pub mod modrm;
pub mod prefix;
pub mod shape;

pub use bytes::{InstructionBytes, SliceBytes};
pub use error::DecodeError;
pub use instruction::CfgInstruction;
pub use modrm::{MemoryOperand, ModRm, RmOperand};
pub use prefix::{Prefixes, RepPrefix, SegmentOverride};
pub use shape::*;

use cfg_types::SegmentedAddress;

/// Entry point: decode one instruction at `address` (spec.md §4.B).
pub struct Parser;

impl Parser {
    pub fn parse<B: InstructionBytes>(
        bytes: &B,
        address: SegmentedAddress,
    ) -> Result<CfgInstruction, DecodeError> {
        builders::parse(bytes, address)
    }
}
