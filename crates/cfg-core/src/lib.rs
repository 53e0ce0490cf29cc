//! Memory/registers, the CFG node graph, the self-modification-aware
//! instruction feeder, nested execution contexts, per-opcode execution, the
//! event scheduler, and the main emulation loop (spec.md §4.A-I).
//!
//! This crate is the one place in the workspace that owns mutable guest
//! state; `cfg-decoder` only turns bytes into instruction shapes, and
//! `cfg-interrupts` only defines the narrow collaborator traits the loop
//! consumes (PIC, callbacks, breakpoints).

pub mod breakpoint_expr;
pub mod bus;
pub mod context;
pub mod cpu;
pub mod emu_loop;
pub mod error;
pub mod executor;
pub mod fault;
pub mod feeder;
pub mod flags;
pub mod graph;
pub mod registers;
pub mod scheduler;

pub use bus::{Bus, Memory, DEFAULT_MEMORY_SIZE};
pub use context::{ContextHandle, ExecutionContext, ExecutionContextManager};
pub use cpu::Cpu;
pub use emu_loop::{EmulationLoop, StepOutcome};
pub use error::CfgError;
pub use executor::{ExecuteOutcome, InstructionExecutor, InterruptFrame};
pub use fault::CpuFault;
pub use feeder::InstructionsFeeder;
pub use flags::Flags;
pub use graph::{InstructionNode, Node, NodeArena, NodeHandle, NodeLinker, SelectorNode, SuccessorType};
pub use registers::{Registers, SegmentRegister};
pub use scheduler::{EmulationLoopScheduler, FiredEvent, FiredKind};
