//! Collaborator traits and small models the CPU core consumes through narrow
//! interfaces (spec.md §6): the PIC, host callback dispatch, and the
//! breakpoint table. No `Memory`/`Registers`/graph types live here.

pub mod breakpoint;
pub mod dispatcher;
pub mod error;
pub mod pic;

pub use breakpoint::{Breakpoint, BreakpointKind, BreakpointTable};
pub use dispatcher::{CallbackHandler, IndexBasedDispatcher};
pub use error::UnhandledOperation;
pub use pic::{NoInterruptsPending, ProgrammableInterruptController};
