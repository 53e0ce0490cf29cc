use thiserror::Error;

/// Parse-time failures (spec.md §7). A `DecodeError` never escapes the
/// parser as a host-visible exception: `Parser::parse` converts every
/// variant into an `InstructionShape::Invalid` `CfgInstruction` so the node
/// still anchors the graph at that address (spec.md §4.B step 5, §7 "Parse
/// errors become `InvalidInstruction` nodes that self-raise `#UD` on
/// execute").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Combined prefixes + opcode + operands would exceed the architectural
    /// 15-byte limit (I5).
    #[error("instruction exceeds the {0}-byte architectural length limit")]
    TooLong(usize),
    /// The opcode (after prefixes) is not one this parser recognises.
    #[error("unrecognised opcode")]
    InvalidOpcode,
}
