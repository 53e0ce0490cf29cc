//! Shared, dependency-free primitives for the CFG CPU core: segmented
//! addresses, per-byte discriminators, and the parsed-field value model.
//!
//! This crate sits at the bottom of the workspace's dependency graph:
//! `cfg-decoder` and `cfg-core` both build on it, and depend on nothing
//! else in the workspace themselves.

mod address;
mod discriminator;
mod field;

pub use address::{SegmentedAddress, LINEAR_ADDRESS_BITS, LINEAR_ADDRESS_MASK};
pub use discriminator::{Discriminator, DiscriminatorByte};
pub use field::{discriminator_final_of, discriminator_of, FieldValue, InstructionField};

/// Architectural maximum encoded instruction length (spec.md I5 / §4.B
/// step 1). Exceeding it while parsing raises `#UD`.
pub const MAX_INSTRUCTION_LEN: usize = 15;
