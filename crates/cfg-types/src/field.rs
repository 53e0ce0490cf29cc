use crate::address::SegmentedAddress;
use crate::discriminator::{Discriminator, DiscriminatorByte};

/// The value carried by a parsed field (spec.md §3: `T ∈ {u8, u16, u32, i8,
/// i16, i32, SegmentedAddress}`). A closed sum type rather than a generic
/// `InstructionField<T>` so that a `CfgInstruction` variant can hold a
/// `Vec<InstructionField>` of mixed-width fields in declaration order
/// without boxing or `dyn` dispatch (spec.md §9: "prefer a tagged variant
/// (sum type) ... this yields the fastest hot path without virtual-call
/// overhead").
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    Addr(SegmentedAddress),
}

impl FieldValue {
    pub fn as_u32(self) -> u32 {
        match self {
            FieldValue::U8(v) => u32::from(v),
            FieldValue::U16(v) => u32::from(v),
            FieldValue::U32(v) => v,
            FieldValue::I8(v) => v as u32,
            FieldValue::I16(v) => v as u32,
            FieldValue::I32(v) => v as u32,
            FieldValue::Addr(a) => a.linear(),
        }
    }

    pub fn as_i32(self) -> i32 {
        self.as_u32() as i32
    }
}

macro_rules! impl_from_for_field_value {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for FieldValue {
            fn from(v: $ty) -> Self {
                FieldValue::$variant(v)
            }
        }
    };
}

impl_from_for_field_value!(U8, u8);
impl_from_for_field_value!(U16, u16);
impl_from_for_field_value!(U32, u32);
impl_from_for_field_value!(I8, i8);
impl_from_for_field_value!(I16, i16);
impl_from_for_field_value!(I32, i32);
impl_from_for_field_value!(Addr, SegmentedAddress);

/// A single parsed field of an instruction (spec.md §3).
///
/// `is_final` decides whether a live-byte change at this field invalidates
/// the cached instruction (I4): opcode bytes and the ModR/M mode byte are
/// final; immediates and displacements are not, since self-modifying code
/// commonly patches only an immediate operand (spec.md §4.B step 4, scenario
/// S3).
#[derive(Clone, Debug, PartialEq)]
pub struct InstructionField {
    pub value: FieldValue,
    pub physical_address: SegmentedAddress,
    pub index_in_instruction: u8,
    pub length_bytes: u8,
    pub discriminator_bytes: Discriminator,
    pub is_final: bool,
    pub use_value: bool,
}

impl InstructionField {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        value: impl Into<FieldValue>,
        physical_address: SegmentedAddress,
        index_in_instruction: u8,
        length_bytes: u8,
        discriminator_bytes: Vec<DiscriminatorByte>,
        is_final: bool,
        use_value: bool,
    ) -> Self {
        Self {
            value: value.into(),
            physical_address,
            index_in_instruction,
            length_bytes,
            discriminator_bytes: Discriminator::new(discriminator_bytes),
            is_final,
            use_value,
        }
    }
}

/// Concatenation of every field's discriminator bytes, in field order
/// (spec.md §3: `CfgInstruction.discriminator`).
pub fn discriminator_of<'a>(fields: impl IntoIterator<Item = &'a InstructionField>) -> Discriminator {
    fields
        .into_iter()
        .flat_map(|f| f.discriminator_bytes.bytes().iter().copied())
        .collect()
}

/// Concatenation of only the `is_final` fields' discriminator bytes, in
/// field order (spec.md §3: `CfgInstruction.discriminator_final`). This is
/// the concrete (wildcard-free for opcode/ModRM bytes) signature used to key
/// the live/history maps in `InstructionsFeeder`.
pub fn discriminator_final_of<'a>(
    fields: impl IntoIterator<Item = &'a InstructionField>,
) -> Discriminator {
    fields
        .into_iter()
        .filter(|f| f.is_final)
        .flat_map(|f| f.discriminator_bytes.bytes().iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(value: u8, is_final: bool) -> InstructionField {
        InstructionField::new(
            value,
            SegmentedAddress::new(0, 0),
            0,
            1,
            vec![Some(value)],
            is_final,
            true,
        )
    }

    #[test]
    fn discriminator_final_excludes_non_final_fields() {
        let fields = vec![field(0xB8, true), field(0x34, false), field(0x12, false)];
        let full = discriminator_of(&fields);
        let fin = discriminator_final_of(&fields);
        assert_eq!(full.len(), 3);
        assert_eq!(fin.len(), 1);
        assert!(fin.matches_concrete_bytes(&[0xB8]));
    }
}
