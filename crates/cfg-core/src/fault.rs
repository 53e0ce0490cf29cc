use thiserror::Error;

/// Faults raised during `execute()` (spec.md §4.G, §7). Never propagated to
/// the host: the loop catches these and dispatches the matching interrupt
/// vector through the normal IVT path, so the guest sees them as ordinary
/// interrupts.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CpuFault {
    #[error("division error (#DE)")]
    DivisionError,
    #[error("invalid opcode (#UD)")]
    InvalidOpcode,
    #[error("general protection fault (#GP)")]
    GeneralProtection,
    #[error("bound range exceeded (#BR)")]
    BoundRange,
}

impl CpuFault {
    /// The interrupt vector the loop dispatches this fault through.
    pub fn vector(self) -> u8 {
        match self {
            CpuFault::DivisionError => 0,
            CpuFault::BoundRange => 5,
            CpuFault::InvalidOpcode => 6,
            CpuFault::GeneralProtection => 13,
        }
    }
}
