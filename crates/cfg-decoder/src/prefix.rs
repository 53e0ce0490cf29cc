use cfg_types::{FieldValue, InstructionField};

use crate::bytes::InstructionBytes;
use crate::cursor::Cursor;
use crate::error::DecodeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentOverride {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepPrefix {
    /// `0xF3` — REP/REPE/REPZ.
    Rep,
    /// `0xF2` — REPNE/REPNZ.
    Repne,
}

/// The prefix bytes consumed before the opcode (spec.md §4.B step 1, §6
/// instruction layout). Any order, repeatable; the last occurrence of a
/// given prefix class wins, matching real x86 decode behavior.
#[derive(Clone, Debug, Default)]
pub struct Prefixes {
    pub segment_override: Option<SegmentOverride>,
    pub operand_size_32: bool,
    pub address_size_32: bool,
    pub rep: Option<RepPrefix>,
    pub lock: bool,
    pub fields: Vec<InstructionField>,
}

impl Prefixes {
    /// Consumes prefix bytes until it finds one that is not a recognised
    /// prefix. Returns the accumulated prefixes plus the first non-prefix
    /// byte read (the cursor has no "unread", so the opcode stage is handed
    /// that byte directly instead of re-reading it).
    pub fn parse<B: InstructionBytes>(
        cursor: &mut Cursor<B>,
    ) -> Result<(Self, InstructionField), DecodeError> {
        let mut prefixes = Prefixes::default();
        loop {
            let index = cursor.consumed();
            let probe_field = cursor.read_field_u8(index, true)?;
            let byte = match probe_field.value {
                FieldValue::U8(b) => b,
                _ => unreachable!("read_field_u8 always yields FieldValue::U8"),
            };
            let recognised = match byte {
                0x26 => {
                    prefixes.segment_override = Some(SegmentOverride::Es);
                    true
                }
                0x2E => {
                    prefixes.segment_override = Some(SegmentOverride::Cs);
                    true
                }
                0x36 => {
                    prefixes.segment_override = Some(SegmentOverride::Ss);
                    true
                }
                0x3E => {
                    prefixes.segment_override = Some(SegmentOverride::Ds);
                    true
                }
                0x64 => {
                    prefixes.segment_override = Some(SegmentOverride::Fs);
                    true
                }
                0x65 => {
                    prefixes.segment_override = Some(SegmentOverride::Gs);
                    true
                }
                0x66 => {
                    prefixes.operand_size_32 = true;
                    true
                }
                0x67 => {
                    prefixes.address_size_32 = true;
                    true
                }
                0xF0 => {
                    prefixes.lock = true;
                    true
                }
                0xF2 => {
                    prefixes.rep = Some(RepPrefix::Repne);
                    true
                }
                0xF3 => {
                    prefixes.rep = Some(RepPrefix::Rep);
                    true
                }
                _ => false,
            };
            if !recognised {
                return Ok((prefixes, probe_field));
            }
            prefixes.fields.push(probe_field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfg_types::SegmentedAddress;

    use crate::bytes::SliceBytes;

    #[test]
    fn repeated_segment_overrides_keep_the_last_one() {
        let base = SegmentedAddress::new(0, 0);
        let bytes = [0x2E, 0x3E, 0x66, 0x90];
        let src = SliceBytes::new(base, &bytes);
        let mut cursor = Cursor::new(&src, base);
        let (prefixes, opcode_byte) = Prefixes::parse(&mut cursor).unwrap();
        assert_eq!(prefixes.segment_override, Some(SegmentOverride::Ds));
        assert!(prefixes.operand_size_32);
        assert_eq!(opcode_byte.value, FieldValue::U8(0x90));
    }
}
