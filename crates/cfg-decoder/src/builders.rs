use cfg_types::{FieldValue, InstructionField, SegmentedAddress};

use crate::bytes::InstructionBytes;
use crate::cursor::Cursor;
use crate::error::DecodeError;
use crate::instruction::CfgInstruction;
use crate::modrm::{decode_modrm, RmOperand};
use crate::prefix::Prefixes;
use crate::shape::{
    AluOp, Condition, Direction, InstructionShape, LoopKind, ShiftCount, ShiftOp, StackOp,
    StringOpKind, UnaryOp, Width,
};

/// The 8 `add/or/adc/sbb/and/sub/xor/cmp` families share one opcode layout:
/// `base+0` = `Eb,Gb`, `+1` = `Ev,Gv`, `+2` = `Gb,Eb`, `+3` = `Gv,Ev`, `+4` =
/// `AL,Ib`, `+5` = `eAX,Iz` (Intel SDM Table A-6 / spec.md §4.F ALU list).
const ALU_BASES: [(u8, AluOp); 8] = [
    (0x00, AluOp::Add),
    (0x08, AluOp::Or),
    (0x10, AluOp::Adc),
    (0x18, AluOp::Sbb),
    (0x20, AluOp::And),
    (0x28, AluOp::Sub),
    (0x30, AluOp::Xor),
    (0x38, AluOp::Cmp),
];

fn alu_family(opcode: u8) -> Option<(AluOp, u8)> {
    ALU_BASES
        .iter()
        .find(|(base, _)| opcode >= *base && opcode <= base + 5)
        .map(|(base, op)| (*op, opcode - base))
}

/// Parses one instruction starting at `address` (spec.md §4.B steps 1-5):
/// prefixes, then a 1- or 2-byte opcode, then an opcode-specific builder that
/// consumes ModR/M, immediate and displacement fields in a fixed order.
pub fn parse<B: InstructionBytes>(
    bytes: &B,
    address: SegmentedAddress,
) -> Result<CfgInstruction, DecodeError> {
    let mut cursor = Cursor::new(bytes, address);
    let (prefixes, opcode_field) = Prefixes::parse(&mut cursor)?;
    let mut fields = prefixes.fields.clone();
    let opcode = match opcode_field.value {
        FieldValue::U8(b) => b,
        _ => unreachable!(),
    };
    fields.push(opcode_field);

    if opcode == 0x0F {
        let idx = fields.len() as u8;
        let second = cursor.read_field_u8(idx, true)?;
        let second_opcode = match second.value {
            FieldValue::U8(b) => b,
            _ => unreachable!(),
        };
        fields.push(second);
        return build_0f(&mut cursor, &prefixes, fields, second_opcode, address);
    }

    build_one_byte(&mut cursor, &prefixes, fields, opcode, address)
}

fn build_one_byte<B: InstructionBytes>(
    cursor: &mut Cursor<B>,
    prefixes: &Prefixes,
    mut fields: Vec<InstructionField>,
    opcode: u8,
    address: SegmentedAddress,
) -> Result<CfgInstruction, DecodeError> {
    let width32 = prefixes.operand_size_32;
    let addr32 = prefixes.address_size32;
    let seg = prefixes.segment_override;

    if let Some((op, variant)) = alu_family(opcode) {
        return build_alu(cursor, fields, op, variant, width32, addr32, seg, address);
    }

    match opcode {
        // PUSH r16/32 (0x50-0x57), POP r16/32 (0x58-0x5F).
        0x50..=0x57 => {
            let reg = opcode - 0x50;
            finish(address, fields, InstructionShape::Stack {
                op: StackOp::Push,
                rm: RmOperand::Register(reg),
                width: if width32 { Width::Dword } else { Width::Word },
            })
        }
        0x58..=0x5F => {
            let reg = opcode - 0x58;
            finish(address, fields, InstructionShape::Stack {
                op: StackOp::Pop,
                rm: RmOperand::Register(reg),
                width: if width32 { Width::Dword } else { Width::Word },
            })
        }
        // PUSH imm16/32 (0x68), PUSH imm8 sign-extended (0x6A).
        0x68 => {
            let idx = fields.len() as u8;
            let field = if width32 {
                cursor.read_field_i32(idx, false)?
            } else {
                cursor.read_field_i16(idx, false)?
            };
            fields.push(field);
            finish(address, fields, InstructionShape::PushImm {
                width: if width32 { Width::Dword } else { Width::Word },
            })
        }
        0x6A => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_i8(idx, false)?;
            fields.push(field);
            finish(address, fields, InstructionShape::PushImm {
                width: if width32 { Width::Dword } else { Width::Word },
            })
        }
        // Jcc short (0x70-0x7F), rel8.
        0x70..=0x7F => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_i8(idx, false)?;
            fields.push(field);
            finish(address, fields, InstructionShape::Jcc {
                condition: Condition::from_low_nibble(opcode),
                width: Width::Byte,
            })
        }
        // Group 1: ALU Eb/Ev,Ib/Iz/Ib(sign-ext) with ModR/M reg field selecting the op.
        0x80 | 0x81 | 0x83 => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let width = if opcode == 0x80 { Width::Byte } else if width32 { Width::Dword } else { Width::Word };
            let imm_idx = fields.len() as u8;
            let imm_field = match opcode {
                0x80 => cursor.read_field_i8(imm_idx, false)?,
                0x83 => cursor.read_field_i8(imm_idx, false)?,
                _ if width32 => cursor.read_field_i32(imm_idx, false)?,
                _ => cursor.read_field_i16(imm_idx, false)?,
            };
            fields.push(imm_field);
            finish(address, fields, InstructionShape::AluRmImm {
                op: AluOp::from_modrm_reg(modrm.reg),
                rm: modrm.operand,
                width,
            })
        }
        // TEST Eb,Gb (0x84) / Ev,Gv (0x85).
        0x84 | 0x85 => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let width = if opcode == 0x84 { Width::Byte } else if width32 { Width::Dword } else { Width::Word };
            finish(address, fields, InstructionShape::Unary {
                op: UnaryOp::Test,
                rm: modrm.operand,
                width,
            })
        }
        // MOV Eb,Gb/Ev,Gv (0x88/0x89) and Gb,Eb/Gv,Ev (0x8A/0x8B).
        0x88..=0x8B => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let width = if opcode == 0x88 || opcode == 0x8A {
                Width::Byte
            } else if width32 {
                Width::Dword
            } else {
                Width::Word
            };
            let direction = if opcode == 0x88 || opcode == 0x89 {
                Direction::RmFromReg
            } else {
                Direction::RegFromRm
            };
            finish(address, fields, InstructionShape::MovRmReg {
                rm: modrm.operand,
                reg: modrm.reg,
                width,
                direction,
            })
        }
        // POP Ev (0x8F), group 1A.
        0x8F => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            finish(address, fields, InstructionShape::Stack {
                op: StackOp::Pop,
                rm: modrm.operand,
                width: if width32 { Width::Dword } else { Width::Word },
            })
        }
        0x90 => finish(address, fields, InstructionShape::Nop),
        0x9C => finish(address, fields, InstructionShape::Pushf),
        0x9D => finish(address, fields, InstructionShape::Popf),
        // String ops: MOVS (0xA4/0xA5), CMPS (0xA6/0xA7), STOS (0xAA/0xAB),
        // LODS (0xAC/0xAD), SCAS (0xAE/0xAF).
        0xA4 | 0xA5 | 0xA6 | 0xA7 | 0xAA | 0xAB | 0xAC | 0xAD | 0xAE | 0xAF => {
            let (kind, byte_form) = match opcode {
                0xA4 | 0xA5 => (StringOpKind::Movs, opcode == 0xA4),
                0xA6 | 0xA7 => (StringOpKind::Cmps, opcode == 0xA6),
                0xAA | 0xAB => (StringOpKind::Stos, opcode == 0xAA),
                0xAC | 0xAD => (StringOpKind::Lods, opcode == 0xAC),
                _ => (StringOpKind::Scas, opcode == 0xAE),
            };
            finish(address, fields, InstructionShape::StringOp {
                op: kind,
                rep: prefixes.rep,
                width: if byte_form { Width::Byte } else if width32 { Width::Dword } else { Width::Word },
            })
        }
        // MOV r,imm (0xB0-0xB7 byte, 0xB8-0xBF word/dword).
        0xB0..=0xB7 => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_u8(idx, false)?;
            fields.push(field);
            finish(address, fields, InstructionShape::MovRegImm {
                reg: opcode - 0xB0,
                width: Width::Byte,
            })
        }
        0xB8..=0xBF => {
            let idx = fields.len() as u8;
            let field = if width32 {
                cursor.read_field_u32(idx, false)?
            } else {
                cursor.read_field_u16(idx, false)?
            };
            fields.push(field);
            finish(address, fields, InstructionShape::MovRegImm {
                reg: opcode - 0xB8,
                width: if width32 { Width::Dword } else { Width::Word },
            })
        }
        // Group 2: shift/rotate, various count sources.
        0xC0 | 0xC1 | 0xD0 | 0xD1 | 0xD2 | 0xD3 => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let width = if matches!(opcode, 0xC0 | 0xD0 | 0xD2) {
                Width::Byte
            } else if width32 {
                Width::Dword
            } else {
                Width::Word
            };
            let count = match opcode {
                0xC0 | 0xC1 => {
                    let imm_idx = fields.len() as u8;
                    let field = cursor.read_field_u8(imm_idx, false)?;
                    fields.push(field);
                    ShiftCount::Imm8
                }
                0xD0 | 0xD1 => ShiftCount::One,
                _ => ShiftCount::Cl,
            };
            finish(address, fields, InstructionShape::ShiftRotate {
                op: ShiftOp::from_modrm_reg(modrm.reg),
                rm: modrm.operand,
                count,
                width,
            })
        }
        // RET near (0xC3), RET near + imm16 (0xC2).
        0xC2 => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_u16(idx, false)?;
            let pop_bytes = match field.value {
                FieldValue::U16(v) => v,
                _ => unreachable!(),
            };
            fields.push(field);
            finish(address, fields, InstructionShape::RetNear { pop_bytes })
        }
        0xC3 => finish(address, fields, InstructionShape::RetNear { pop_bytes: 0 }),
        // Group 11: MOV Eb,Ib (0xC6) / Ev,Iz (0xC7).
        0xC6 | 0xC7 => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let width = if opcode == 0xC6 { Width::Byte } else if width32 { Width::Dword } else { Width::Word };
            let imm_idx = fields.len() as u8;
            let imm_field = match width {
                Width::Byte => cursor.read_field_u8(imm_idx, false)?,
                Width::Dword => cursor.read_field_u32(imm_idx, false)?,
                Width::Word => cursor.read_field_u16(imm_idx, false)?,
            };
            fields.push(imm_field);
            finish(address, fields, InstructionShape::MovRmImm {
                rm: modrm.operand,
                width,
            })
        }
        // RET far (0xCB), RET far + imm16 (0xCA).
        0xCA => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_u16(idx, false)?;
            let pop_bytes = match field.value {
                FieldValue::U16(v) => v,
                _ => unreachable!(),
            };
            fields.push(field);
            finish(address, fields, InstructionShape::RetFar { pop_bytes })
        }
        0xCB => finish(address, fields, InstructionShape::RetFar { pop_bytes: 0 }),
        // INT3 (0xCC), INT imm8 (0xCD), INTO (0xCE), IRET (0xCF).
        0xCC => finish(address, fields, InstructionShape::IntN { vector: 3 }),
        0xCD => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_u8(idx, true)?;
            let vector = match field.value {
                FieldValue::U8(v) => v,
                _ => unreachable!(),
            };
            fields.push(field);
            finish(address, fields, InstructionShape::IntN { vector })
        }
        0xCE => finish(address, fields, InstructionShape::IntO),
        0xCF => finish(address, fields, InstructionShape::IRet),
        // LOOPNE/LOOPNZ (0xE0), LOOPE/LOOPZ (0xE1), LOOP (0xE2), JCXZ (0xE3).
        0xE0..=0xE3 => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_i8(idx, false)?;
            fields.push(field);
            let kind = match opcode {
                0xE0 => LoopKind::Loopne,
                0xE1 => LoopKind::Loope,
                0xE2 => LoopKind::Loop,
                _ => LoopKind::Jcxz,
            };
            finish(address, fields, InstructionShape::Loop { kind })
        }
        // CALL near rel16/32 (0xE8), JMP near rel16/32 (0xE9), JMP short rel8 (0xEB).
        0xE8 => {
            let idx = fields.len() as u8;
            let field = if width32 {
                cursor.read_field_i32(idx, false)?
            } else {
                cursor.read_field_i16(idx, false)?
            };
            fields.push(field);
            finish(address, fields, InstructionShape::CallNear {
                width: if width32 { Width::Dword } else { Width::Word },
            })
        }
        0xE9 => {
            let idx = fields.len() as u8;
            let field = if width32 {
                cursor.read_field_i32(idx, false)?
            } else {
                cursor.read_field_i16(idx, false)?
            };
            fields.push(field);
            finish(address, fields, InstructionShape::JmpNear {
                width: if width32 { Width::Dword } else { Width::Word },
            })
        }
        0xEB => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_i8(idx, false)?;
            fields.push(field);
            finish(address, fields, InstructionShape::JmpShort)
        }
        // CALL FAR ptr16:16 (0x9A).
        0x9A => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_far_ptr16(idx)?;
            let target = match field.value {
                FieldValue::Addr(a) => a,
                _ => unreachable!(),
            };
            fields.push(field);
            finish(address, fields, InstructionShape::CallFar { target })
        }
        0xF4 => finish(address, fields, InstructionShape::Hlt),
        // Group 3: unary Eb/Ev (test has its own imm, others don't).
        0xF6 | 0xF7 => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let width = if opcode == 0xF6 { Width::Byte } else if width32 { Width::Dword } else { Width::Word };
            let op = match modrm.reg & 0b111 {
                0 | 1 => UnaryOp::Test,
                2 => UnaryOp::Not,
                3 => UnaryOp::Neg,
                4 => UnaryOp::Mul,
                5 => UnaryOp::Imul,
                6 => UnaryOp::Div,
                _ => UnaryOp::Idiv,
            };
            if op == UnaryOp::Test {
                let imm_idx = fields.len() as u8;
                let imm_field = match width {
                    Width::Byte => cursor.read_field_u8(imm_idx, false)?,
                    Width::Dword => cursor.read_field_u32(imm_idx, false)?,
                    Width::Word => cursor.read_field_u16(imm_idx, false)?,
                };
                fields.push(imm_field);
            }
            finish(address, fields, InstructionShape::Unary {
                op,
                rm: modrm.operand,
                width,
            })
        }
        0xF8 => finish(address, fields, InstructionShape::ClcStc { set: false }),
        0xF9 => finish(address, fields, InstructionShape::ClcStc { set: true }),
        0xFA => finish(address, fields, InstructionShape::Cli),
        0xFB => finish(address, fields, InstructionShape::Sti),
        0xFC => finish(address, fields, InstructionShape::Cld),
        0xFD => finish(address, fields, InstructionShape::Std),
        // Group 4/5: INC/DEC Eb (0xFE), INC/DEC/CALL/JMP/PUSH Ev (0xFF).
        0xFE => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let op = if modrm.reg & 1 == 0 { UnaryOp::Inc } else { UnaryOp::Dec };
            finish(address, fields, InstructionShape::Unary {
                op,
                rm: modrm.operand,
                width: Width::Byte,
            })
        }
        0xFF => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let width = if width32 { Width::Dword } else { Width::Word };
            match modrm.reg & 0b111 {
                0 => finish(address, fields, InstructionShape::Unary { op: UnaryOp::Inc, rm: modrm.operand, width }),
                1 => finish(address, fields, InstructionShape::Unary { op: UnaryOp::Dec, rm: modrm.operand, width }),
                2 => finish(address, fields, InstructionShape::CallNear { width }),
                3 => finish(address, fields, InstructionShape::CallFarIndirect { rm: modrm.operand }),
                4 => finish(address, fields, InstructionShape::JmpNear { width }),
                5 => finish(address, fields, InstructionShape::JmpFarIndirect { rm: modrm.operand }),
                _ => finish(address, fields, InstructionShape::Stack { op: StackOp::Push, rm: modrm.operand, width }),
            }
        }
        _ => finish(address, fields, InstructionShape::Invalid),
    }
}

/// Two-byte (`0x0F`-prefixed) opcode map: only the `Jcc near rel32/16`
/// family (`0x80-0x8F`) is supported, matching spec.md's representative
/// opcode set rather than the full two-byte map.
fn build_0f<B: InstructionBytes>(
    cursor: &mut Cursor<B>,
    prefixes: &Prefixes,
    mut fields: Vec<InstructionField>,
    second_opcode: u8,
    address: SegmentedAddress,
) -> Result<CfgInstruction, DecodeError> {
    match second_opcode {
        0x80..=0x8F => {
            let idx = fields.len() as u8;
            let field = if prefixes.operand_size_32 {
                cursor.read_field_i32(idx, false)?
            } else {
                cursor.read_field_i16(idx, false)?
            };
            fields.push(field);
            finish(address, fields, InstructionShape::Jcc {
                condition: Condition::from_low_nibble(second_opcode),
                width: if prefixes.operand_size_32 { Width::Dword } else { Width::Word },
            })
        }
        _ => finish(address, fields, InstructionShape::Invalid),
    }
}

fn build_alu<B: InstructionBytes>(
    cursor: &mut Cursor<B>,
    mut fields: Vec<InstructionField>,
    op: AluOp,
    variant: u8,
    width32: bool,
    addr32: bool,
    seg: Option<crate::prefix::SegmentOverride>,
    address: SegmentedAddress,
) -> Result<CfgInstruction, DecodeError> {
    match variant {
        0 | 1 => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let width = if variant == 0 { Width::Byte } else if width32 { Width::Dword } else { Width::Word };
            finish(address, fields, InstructionShape::AluRmReg {
                op,
                rm: modrm.operand,
                reg: modrm.reg,
                width,
                direction: Direction::RmFromReg,
            })
        }
        2 | 3 => {
            let idx = fields.len() as u8;
            let modrm = decode_modrm(cursor, idx, addr32, seg)?;
            push_modrm_fields(&mut fields, &modrm);
            let width = if variant == 2 { Width::Byte } else if width32 { Width::Dword } else { Width::Word };
            finish(address, fields, InstructionShape::AluRmReg {
                op,
                rm: modrm.operand,
                reg: modrm.reg,
                width,
                direction: Direction::RegFromRm,
            })
        }
        4 => {
            let idx = fields.len() as u8;
            let field = cursor.read_field_u8(idx, false)?;
            fields.push(field);
            finish(address, fields, InstructionShape::AluAccImm { op, width: Width::Byte })
        }
        _ => {
            let idx = fields.len() as u8;
            let field = if width32 {
                cursor.read_field_u32(idx, false)?
            } else {
                cursor.read_field_u16(idx, false)?
            };
            fields.push(field);
            finish(address, fields, InstructionShape::AluAccImm {
                op,
                width: if width32 { Width::Dword } else { Width::Word },
            })
        }
    }
}

/// ModR/M parsing may append up to three fields (modrm, sib, displacement);
/// pushed in that fixed order so `fields`' index order matches the bytes on
/// the wire.
fn push_modrm_fields(fields: &mut Vec<InstructionField>, modrm: &crate::modrm::ModRm) {
    fields.push(modrm.modrm_field.clone());
    if let Some(sib) = &modrm.sib_field {
        fields.push(sib.clone());
    }
    if let Some(disp) = &modrm.displacement_field {
        fields.push(disp.clone());
    }
}

fn finish(
    address: SegmentedAddress,
    fields: Vec<InstructionField>,
    shape: InstructionShape,
) -> Result<CfgInstruction, DecodeError> {
    Ok(CfgInstruction::new(address, fields, shape))
}
