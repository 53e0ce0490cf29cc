use cfg_types::{DiscriminatorByte, FieldValue, InstructionField, SegmentedAddress, MAX_INSTRUCTION_LEN};

use crate::bytes::InstructionBytes;
use crate::error::DecodeError;

/// Walks memory one byte at a time from a fixed start address, building the
/// `InstructionField`s of the instruction under construction and enforcing
/// the architectural 15-byte bound (I5) as it goes.
pub struct Cursor<'a, B: InstructionBytes> {
    bytes: &'a B,
    start: SegmentedAddress,
    consumed: u8,
}

impl<'a, B: InstructionBytes> Cursor<'a, B> {
    pub fn new(bytes: &'a B, start: SegmentedAddress) -> Self {
        Self {
            bytes,
            start,
            consumed: 0,
        }
    }

    pub fn consumed(&self) -> u8 {
        self.consumed
    }

    pub fn current_address(&self) -> SegmentedAddress {
        self.start.wrapping_add_offset(u16::from(self.consumed))
    }

    /// Reads and consumes one raw byte, without recording it as a field.
    /// Used for lookahead (prefix scanning) and for bytes that are recorded
    /// as part of a multi-byte field (`read_field_*` calls this in a loop).
    fn read_raw_u8(&mut self) -> Result<u8, DecodeError> {
        if usize::from(self.consumed) >= MAX_INSTRUCTION_LEN {
            return Err(DecodeError::TooLong(MAX_INSTRUCTION_LEN));
        }
        let addr = self.current_address();
        let byte = self.bytes.read_u8(addr);
        self.consumed += 1;
        Ok(byte)
    }

    /// Records a field of `len` bytes (little-endian for multi-byte values)
    /// starting at the cursor's current position, advancing the cursor by
    /// `len` bytes.
    #[allow(clippy::too_many_arguments)]
    fn read_field_bytes(
        &mut self,
        len: u8,
        is_final: bool,
        use_value: bool,
    ) -> Result<(SegmentedAddress, Vec<u8>, Vec<DiscriminatorByte>), DecodeError> {
        let physical_address = self.current_address();
        let mut raw = Vec::with_capacity(usize::from(len));
        for _ in 0..len {
            raw.push(self.read_raw_u8()?);
        }
        let discriminator: Vec<DiscriminatorByte> = if is_final {
            raw.iter().map(|b| Some(*b)).collect()
        } else {
            vec![None; raw.len()]
        };
        Ok((physical_address, raw, discriminator))
    }

    pub fn read_field_u8(&mut self, index_in_instruction: u8, is_final: bool) -> Result<InstructionField, DecodeError> {
        let (addr, raw, disc) = self.read_field_bytes(1, is_final, is_final)?;
        Ok(InstructionField::new(raw[0], addr, index_in_instruction, 1, disc, is_final, is_final))
    }

    pub fn read_field_i8(&mut self, index_in_instruction: u8, is_final: bool) -> Result<InstructionField, DecodeError> {
        let (addr, raw, disc) = self.read_field_bytes(1, is_final, is_final)?;
        Ok(InstructionField::new(raw[0] as i8, addr, index_in_instruction, 1, disc, is_final, is_final))
    }

    pub fn read_field_u16(&mut self, index_in_instruction: u8, is_final: bool) -> Result<InstructionField, DecodeError> {
        let (addr, raw, disc) = self.read_field_bytes(2, is_final, is_final)?;
        let value = u16::from_le_bytes([raw[0], raw[1]]);
        Ok(InstructionField::new(value, addr, index_in_instruction, 2, disc, is_final, is_final))
    }

    pub fn read_field_i16(&mut self, index_in_instruction: u8, is_final: bool) -> Result<InstructionField, DecodeError> {
        let (addr, raw, disc) = self.read_field_bytes(2, is_final, is_final)?;
        let value = i16::from_le_bytes([raw[0], raw[1]]);
        Ok(InstructionField::new(value, addr, index_in_instruction, 2, disc, is_final, is_final))
    }

    pub fn read_field_u32(&mut self, index_in_instruction: u8, is_final: bool) -> Result<InstructionField, DecodeError> {
        let (addr, raw, disc) = self.read_field_bytes(4, is_final, is_final)?;
        let value = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        Ok(InstructionField::new(value, addr, index_in_instruction, 4, disc, is_final, is_final))
    }

    pub fn read_field_i32(&mut self, index_in_instruction: u8, is_final: bool) -> Result<InstructionField, DecodeError> {
        let (addr, raw, disc) = self.read_field_bytes(4, is_final, is_final)?;
        let value = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        Ok(InstructionField::new(value, addr, index_in_instruction, 4, disc, is_final, is_final))
    }

    /// Reads a field whose value is an immediate-sized far pointer
    /// `(offset16, segment16)`, used by `CALL FAR` (spec.md §4.B: "CALL FAR
    /// uses a 4-byte (real-mode) operand `(offset16, segment16)`").
    pub fn read_field_far_ptr16(
        &mut self,
        index_in_instruction: u8,
    ) -> Result<InstructionField, DecodeError> {
        let (addr, raw, disc) = self.read_field_bytes(4, false, false)?;
        let offset = u16::from_le_bytes([raw[0], raw[1]]);
        let segment = u16::from_le_bytes([raw[2], raw[3]]);
        Ok(InstructionField::new(
            FieldValue::Addr(SegmentedAddress::new(segment, offset)),
            addr,
            index_in_instruction,
            4,
            disc,
            false,
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::SliceBytes;

    #[test]
    fn length_bound_is_enforced() {
        let base = SegmentedAddress::new(0, 0);
        let bytes = [0x66u8; MAX_INSTRUCTION_LEN + 4];
        let src = SliceBytes::new(base, &bytes);
        let mut cursor = Cursor::new(&src, base);
        for _ in 0..MAX_INSTRUCTION_LEN {
            cursor.read_field_u8(0, false).expect("within bound");
        }
        assert_eq!(
            cursor.read_field_u8(0, false).unwrap_err(),
            DecodeError::TooLong(MAX_INSTRUCTION_LEN)
        );
    }

    #[test]
    fn non_final_field_has_wildcard_discriminator() {
        let base = SegmentedAddress::new(0x0100, 0x0000);
        let bytes = [0x34, 0x12];
        let src = SliceBytes::new(base, &bytes);
        let mut cursor = Cursor::new(&src, base);
        let field = cursor.read_field_u16(1, false).unwrap();
        assert_eq!(field.discriminator_bytes.bytes(), &[None, None]);
        assert!(!field.is_final);
    }
}
