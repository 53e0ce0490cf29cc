pub mod arena;
pub mod linker;

pub use arena::{InstructionNode, NodeArena, NodeHandle, SelectorNode, SuccessorType};
pub use linker::NodeLinker;

/// The two kinds of thing a live address slot can hold (spec.md §9 Design
/// Notes: `Node = { Instruction(InstructionHandle) | Selector(SelectorHandle) }`).
/// Both variants wrap the same `NodeHandle` space; `NodeArena::is_selector`
/// distinguishes them, so this enum exists purely as a match-friendly view
/// for callers that already know which handle they have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Node {
    Instruction(NodeHandle),
    Selector(NodeHandle),
}

impl Node {
    pub fn handle(self) -> NodeHandle {
        match self {
            Node::Instruction(h) => h,
            Node::Selector(h) => h,
        }
    }
}
