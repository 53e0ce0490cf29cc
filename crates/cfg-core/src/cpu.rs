use crate::registers::Registers;

/// Everything the executor needs beyond memory (SPEC_FULL.md Module A: "a
/// `CpuState`/`CpuCore` split"). `halted` models `HLT` (SPEC_FULL.md Open
/// Question 3: halting only skips fetch/execute, never the scheduler or PIC
/// poll, so it lives alongside `cycles` rather than stopping the loop).
#[derive(Clone, Debug, Default)]
pub struct Cpu {
    pub regs: Registers,
    pub cycles: u64,
    pub halted: bool,
}

impl Cpu {
    pub fn new() -> Self {
        Self::default()
    }
}
