use cfg_types::{FieldValue, InstructionField};

use crate::bytes::InstructionBytes;
use crate::cursor::Cursor;
use crate::error::DecodeError;
use crate::prefix::SegmentOverride;

/// A decoded effective-address operand. Registers are identified only by
/// their 0-7 encoding; resolving that to a concrete `GpRegister` at a given
/// operand width is the executor's job (spec.md §4.F: "ModR/M computer ...
/// producing ... an `RM`/`R` accessor at chosen width"), since the same
/// ModR/M byte means different things for an 8-, 16- or 32-bit instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum RmOperand {
    Register(u8),
    Memory(MemoryOperand),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemoryOperand {
    pub segment_override: Option<SegmentOverride>,
    /// Base register encoding (0-7), absent for `mod=00,rm=110` (16-bit
    /// direct) or `mod=00,rm=101` with no SIB base (32-bit direct/disp32).
    pub base: Option<u8>,
    /// `(index register encoding, scale)` — only ever present for 32-bit
    /// SIB addressing.
    pub index: Option<(u8, u8)>,
    /// The displacement's value *as parsed*. Displacement bytes are
    /// non-final (spec.md §4.B step 4): self-modifying code may patch them
    /// without changing the instruction's identity, so the executor must
    /// re-read `displacement_field`'s bytes from memory at execute time
    /// rather than trust this snapshot (spec.md §3 `use_value`).
    pub displacement: i32,
    pub displacement_field: Option<InstructionField>,
    pub address_size32: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
    pub modrm_field: InstructionField,
    pub sib_field: Option<InstructionField>,
    pub displacement_field: Option<InstructionField>,
    pub operand: RmOperand,
}

/// 16-bit mod=00/01/10 base-register table (SDM Table 2-1), indexed by `rm`.
/// `rm=6` is special-cased by the caller (no base, disp16 direct address).
const ADDR16_BASE_PAIRS: [(Option<u8>, Option<u8>); 8] = [
    (Some(REG_BX), Some(REG_SI)),
    (Some(REG_BX), Some(REG_DI)),
    (Some(REG_BP), Some(REG_SI)),
    (Some(REG_BP), Some(REG_DI)),
    (Some(REG_SI), None),
    (Some(REG_DI), None),
    (Some(REG_BP), None),
    (Some(REG_BX), None),
];

// 16-bit addressing-mode pseudo register encodings (not the general-purpose
// register encoding space — the executor maps these back to SI/DI/BP/BX
// when it resolves a `MemoryOperand`).
const REG_BX: u8 = 100;
const REG_BP: u8 = 101;
const REG_SI: u8 = 102;
const REG_DI: u8 = 103;

pub fn decode_modrm<B: InstructionBytes>(
    cursor: &mut Cursor<B>,
    index_in_instruction: u8,
    address_size32: bool,
    segment_override: Option<SegmentOverride>,
) -> Result<ModRm, DecodeError> {
    let modrm_field = cursor.read_field_u8(index_in_instruction, true)?;
    let byte = match modrm_field.value {
        FieldValue::U8(b) => b,
        _ => unreachable!(),
    };
    let md = (byte >> 6) & 0b11;
    let reg = (byte >> 3) & 0b111;
    let rm = byte & 0b111;

    if md == 0b11 {
        return Ok(ModRm {
            md,
            reg,
            rm,
            modrm_field,
            sib_field: None,
            displacement_field: None,
            operand: RmOperand::Register(rm),
        });
    }

    if address_size32 {
        decode_modrm_32(cursor, index_in_instruction, md, reg, rm, modrm_field, segment_override)
    } else {
        decode_modrm_16(cursor, index_in_instruction, md, reg, rm, modrm_field, segment_override)
    }
}

fn decode_modrm_16<B: InstructionBytes>(
    cursor: &mut Cursor<B>,
    index_in_instruction: u8,
    md: u8,
    reg: u8,
    rm: u8,
    modrm_field: InstructionField,
    segment_override: Option<SegmentOverride>,
) -> Result<ModRm, DecodeError> {
    let mut displacement_field = None;
    let (base, index, displacement) = if md == 0b00 && rm == 0b110 {
        // Direct disp16 address, no base register.
        let field = cursor.read_field_i16(index_in_instruction + 1, false)?;
        let disp = match field.value {
            FieldValue::I16(v) => i32::from(v),
            _ => unreachable!(),
        };
        displacement_field = Some(field);
        (None, None, disp)
    } else {
        let (base, index) = ADDR16_BASE_PAIRS[rm as usize];
        let disp = match md {
            0b00 => 0,
            0b01 => {
                let field = cursor.read_field_i8(index_in_instruction + 1, false)?;
                let v = match field.value {
                    FieldValue::I8(v) => i32::from(v),
                    _ => unreachable!(),
                };
                displacement_field = Some(field);
                v
            }
            0b10 => {
                let field = cursor.read_field_i16(index_in_instruction + 1, false)?;
                let v = match field.value {
                    FieldValue::I16(v) => i32::from(v),
                    _ => unreachable!(),
                };
                displacement_field = Some(field);
                v
            }
            _ => unreachable!("mod=11 handled by caller"),
        };
        (base, index.map(|i| (i, 1u8)), disp)
    };

    Ok(ModRm {
        md,
        reg,
        rm,
        modrm_field,
        sib_field: None,
        displacement_field: displacement_field.clone(),
        operand: RmOperand::Memory(MemoryOperand {
            segment_override,
            base,
            index,
            displacement,
            displacement_field,
            address_size32: false,
        }),
    })
}

fn decode_modrm_32<B: InstructionBytes>(
    cursor: &mut Cursor<B>,
    index_in_instruction: u8,
    md: u8,
    reg: u8,
    rm: u8,
    modrm_field: InstructionField,
    segment_override: Option<SegmentOverride>,
) -> Result<ModRm, DecodeError> {
    let mut sib_field = None;
    let mut displacement_field = None;
    let base;
    let mut index = None;

    if rm == 0b100 {
        let field = cursor.read_field_u8(index_in_instruction + 1, true)?;
        let sib = match field.value {
            FieldValue::U8(b) => b,
            _ => unreachable!(),
        };
        let scale = 1u8 << ((sib >> 6) & 0b11);
        let idx = (sib >> 3) & 0b111;
        let bse = sib & 0b111;
        sib_field = Some(field);
        index = if idx == 0b100 { None } else { Some((idx, scale)) };
        base = if bse == 0b101 && md == 0b00 { None } else { Some(bse) };
    } else if rm == 0b101 && md == 0b00 {
        base = None;
    } else {
        base = Some(rm);
    }

    // A disp32-no-base operand only arises when `mod=00` and the base
    // computation above left no base register (direct `[disp32]`, or SIB
    // with base=101 and no displacement-bearing base).
    let disp_index = if sib_field.is_some() {
        index_in_instruction + 2
    } else {
        index_in_instruction + 1
    };
    let displacement = match md {
        0b00 if base.is_none() => {
            let field = cursor.read_field_i32(disp_index, false)?;
            let v = match field.value {
                FieldValue::I32(v) => v,
                _ => unreachable!(),
            };
            displacement_field = Some(field);
            v
        }
        0b00 => 0,
        0b01 => {
            let field = cursor.read_field_i8(disp_index, false)?;
            let v = match field.value {
                FieldValue::I8(v) => i32::from(v),
                _ => unreachable!(),
            };
            displacement_field = Some(field);
            v
        }
        0b10 => {
            let field = cursor.read_field_i32(disp_index, false)?;
            let v = match field.value {
                FieldValue::I32(v) => v,
                _ => unreachable!(),
            };
            displacement_field = Some(field);
            v
        }
        _ => unreachable!("mod=11 handled by caller"),
    };

    Ok(ModRm {
        md,
        reg,
        rm,
        modrm_field,
        sib_field,
        displacement_field: displacement_field.clone(),
        operand: RmOperand::Memory(MemoryOperand {
            segment_override,
            base,
            index,
            displacement,
            displacement_field,
            address_size32: true,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::SliceBytes;
    use cfg_types::SegmentedAddress;

    #[test]
    fn mod_11_is_register_direct() {
        let base = SegmentedAddress::new(0, 0);
        let bytes = [0xC0u8]; // mod=11 reg=000 rm=000
        let src = SliceBytes::new(base, &bytes);
        let mut cursor = Cursor::new(&src, base);
        let modrm = decode_modrm(&mut cursor, 0, false, None).unwrap();
        assert_eq!(modrm.operand, RmOperand::Register(0));
    }

    #[test]
    fn addr16_mod00_rm110_is_direct_disp16() {
        let base = SegmentedAddress::new(0, 0);
        let bytes = [0x06u8, 0x34, 0x12]; // mod=00 reg=000 rm=110, disp16=0x1234
        let src = SliceBytes::new(base, &bytes);
        let mut cursor = Cursor::new(&src, base);
        let modrm = decode_modrm(&mut cursor, 0, false, None).unwrap();
        match modrm.operand {
            RmOperand::Memory(mem) => {
                assert!(mem.base.is_none());
                assert_eq!(mem.displacement, 0x1234);
            }
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn addr32_sib_scaled_index() {
        // mod=10 reg=000 rm=100 (SIB), SIB=scale4,index=RCX(001),base=RBX(011), disp32
        let base = SegmentedAddress::new(0, 0);
        let bytes = [0x84u8, 0x8B, 0x78, 0x56, 0x34, 0x12];
        let src = SliceBytes::new(base, &bytes);
        let mut cursor = Cursor::new(&src, base);
        let modrm = decode_modrm(&mut cursor, 0, true, None).unwrap();
        match modrm.operand {
            RmOperand::Memory(mem) => {
                assert_eq!(mem.base, Some(0b011));
                assert_eq!(mem.index, Some((0b001, 4)));
                assert_eq!(mem.displacement, 0x1234_5678u32 as i32);
            }
            _ => panic!("expected memory operand"),
        }
    }
}
