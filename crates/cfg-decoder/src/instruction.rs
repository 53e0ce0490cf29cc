use cfg_types::{discriminator_final_of, discriminator_of, Discriminator, InstructionField, SegmentedAddress};

use crate::shape::InstructionShape;

/// A fully parsed instruction (spec.md §3 `CfgInstruction`), independent of
/// its place in the graph. Predecessor/successor bookkeeping is deliberately
/// not stored here: spec.md §9 Design Notes call for an arena of nodes
/// addressed by handle rather than a struct holding its own back-links, so
/// `cfg-core::graph` wraps this value inside an arena-owned record that adds
/// `predecessors`/`successors`/`successors_per_address`/`successors_per_type`/
/// `is_live`.
#[derive(Clone, Debug, PartialEq)]
pub struct CfgInstruction {
    pub address: SegmentedAddress,
    pub length: u8,
    pub fields: Vec<InstructionField>,
    pub shape: InstructionShape,
}

impl CfgInstruction {
    pub fn new(address: SegmentedAddress, fields: Vec<InstructionField>, shape: InstructionShape) -> Self {
        let length = fields.iter().map(|f| u32::from(f.length_bytes)).sum::<u32>() as u8;
        Self {
            address,
            length,
            fields,
            shape,
        }
    }

    /// Concatenation of every field's discriminator bytes, in field order.
    pub fn discriminator(&self) -> Discriminator {
        discriminator_of(&self.fields)
    }

    /// Concatenation of only the `is_final` fields' discriminator bytes —
    /// the concrete byte signature self-modification detection (I4) checks
    /// live memory against.
    pub fn discriminator_final(&self) -> Discriminator {
        discriminator_final_of(&self.fields)
    }
}
