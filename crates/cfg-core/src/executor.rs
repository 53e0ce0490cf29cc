use cfg_decoder::{
    AluOp, CfgInstruction, Condition, Direction, InstructionShape, LoopKind, MemoryOperand, RmOperand, SegmentOverride, ShiftCount,
    ShiftOp, StackOp, StringOpKind, UnaryOp, Width,
};
use cfg_types::{FieldValue, InstructionField, SegmentedAddress};

use crate::bus::Bus;
use crate::cpu::Cpu;
use crate::fault::CpuFault;
use crate::feeder::InstructionsFeeder;
use crate::flags::Flags;
use crate::graph::{NodeArena, NodeHandle};
use crate::registers::{Registers, SegmentRegister, REG_BP, REG_BX, REG_DI, REG_SI, REG_SP};

/// spec.md §9 Design Notes: "Model execute as returning a `Result<NextIpHint,
/// CpuFault>`". `next_node_hint` is set only for branches whose target is
/// known without a data-dependent read (an immediate-relative jump/call/loop
/// that is taken); the loop falls back to `feeder.get_or_parse` otherwise
/// (spec.md §4.F).
pub struct ExecuteOutcome {
    pub next_ip: SegmentedAddress,
    pub next_node_hint: Option<NodeHandle>,
    pub can_cause_context_restore: bool,
    pub halts: bool,
}

/// The result of `dispatch_interrupt` (spec.md §4.F): the handler's target
/// and the address execution should resume at once the handler returns,
/// handed to `ExecutionContextManager::signal_new_context`.
pub struct InterruptFrame {
    pub target: SegmentedAddress,
    pub expected_return: SegmentedAddress,
}

fn width_bits(width: Width) -> u32 {
    match width {
        Width::Byte => 8,
        Width::Word => 16,
        Width::Dword => 32,
    }
}

fn width_mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

fn sign_bit(bits: u32) -> u32 {
    1u32 << (bits - 1)
}

/// Re-reads a field's live bytes from the bus when it is not a trusted
/// (`use_value`) field, instead of the snapshot taken at parse time —
/// exactly the mechanism scenario S3 depends on: immediates and
/// displacements are non-final, so a patch to them must be observed without
/// invalidating the cached node.
fn read_field_live<B: Bus>(field: &InstructionField, bus: &B) -> FieldValue {
    if field.use_value {
        return field.value;
    }
    let addr = field.physical_address;
    match field.value {
        FieldValue::U8(_) => FieldValue::U8(bus.read_u8(addr)),
        FieldValue::I8(_) => FieldValue::I8(bus.read_i8(addr)),
        FieldValue::U16(_) => FieldValue::U16(bus.read_u16(addr)),
        FieldValue::I16(_) => FieldValue::I16(bus.read_i16(addr)),
        FieldValue::U32(_) => FieldValue::U32(bus.read_u32(addr)),
        FieldValue::I32(_) => FieldValue::I32(bus.read_i32(addr)),
        FieldValue::Addr(_) => {
            let offset = bus.read_u16(addr);
            let segment = bus.read_u16(addr.wrapping_add_offset(2));
            FieldValue::Addr(SegmentedAddress::new(segment, offset))
        }
    }
}

fn last_field_live<B: Bus>(instr: &CfgInstruction, bus: &B) -> FieldValue {
    let field = instr.fields.last().expect("this shape always carries a trailing operand field");
    read_field_live(field, bus)
}

fn segment_register_for(ov: SegmentOverride) -> SegmentRegister {
    match ov {
        SegmentOverride::Es => SegmentRegister::Es,
        SegmentOverride::Cs => SegmentRegister::Cs,
        SegmentOverride::Ss => SegmentRegister::Ss,
        SegmentOverride::Ds => SegmentRegister::Ds,
        SegmentOverride::Fs => SegmentRegister::Fs,
        SegmentOverride::Gs => SegmentRegister::Gs,
    }
}

/// 16-bit addressing uses `cfg_decoder::modrm`'s private pseudo-encodings
/// (100-103) for BX/BP/SI/DI instead of the general register space; 32-bit
/// SIB addressing uses the ordinary 0-7 register encoding.
fn resolve_addr_component(code: u8, regs: &Registers, address_size32: bool) -> u32 {
    if address_size32 {
        regs.read_reg(code, Width::Dword)
    } else {
        match code {
            100 => regs.read_reg(REG_BX, Width::Word),
            101 => regs.read_reg(REG_BP, Width::Word),
            102 => regs.read_reg(REG_SI, Width::Word),
            103 => regs.read_reg(REG_DI, Width::Word),
            reg => regs.read_reg(reg, Width::Word),
        }
    }
}

fn segment_for_memory(mem: &MemoryOperand, regs: &Registers) -> u16 {
    if let Some(ov) = mem.segment_override {
        return regs.segment(segment_register_for(ov));
    }
    let uses_bp = match mem.base {
        Some(101) if !mem.address_size32 => true,
        Some(5) if mem.address_size32 => true,
        _ => false,
    };
    regs.segment(if uses_bp { SegmentRegister::Ss } else { SegmentRegister::Ds })
}

fn resolve_memory_operand<B: Bus>(mem: &MemoryOperand, regs: &Registers, bus: &B) -> SegmentedAddress {
    let disp = match &mem.displacement_field {
        Some(field) => read_field_live(field, bus).as_i32(),
        None => mem.displacement,
    };
    let mut offset: i64 = i64::from(disp);
    if let Some(base) = mem.base {
        offset += i64::from(resolve_addr_component(base, regs, mem.address_size32));
    }
    if let Some((index, scale)) = mem.index {
        offset += i64::from(resolve_addr_component(index, regs, mem.address_size32)) * i64::from(scale);
    }
    let seg = segment_for_memory(mem, regs);
    SegmentedAddress::new(seg, offset as u32 as u16)
}

fn read_rm<B: Bus>(rm: &RmOperand, width: Width, regs: &Registers, bus: &B) -> u32 {
    match rm {
        RmOperand::Register(r) => regs.read_reg(*r, width),
        RmOperand::Memory(mem) => {
            let addr = resolve_memory_operand(mem, regs, bus);
            match width {
                Width::Byte => u32::from(bus.read_u8(addr)),
                Width::Word => u32::from(bus.read_u16(addr)),
                Width::Dword => bus.read_u32(addr),
            }
        }
    }
}

fn write_rm<B: Bus>(rm: &RmOperand, width: Width, value: u32, regs: &mut Registers, bus: &mut B) {
    match rm {
        RmOperand::Register(r) => regs.write_reg(*r, width, value),
        RmOperand::Memory(mem) => {
            let addr = resolve_memory_operand(mem, regs, bus);
            match width {
                Width::Byte => bus.write_u8(addr, value as u8),
                Width::Word => bus.write_u16(addr, value as u16),
                Width::Dword => bus.write_u32(addr, value),
            }
        }
    }
}

fn add_with_carry(a: u32, b: u32, cin: u32, bits: u32) -> (u32, bool, bool, bool) {
    let mask = width_mask(bits);
    let full = u64::from(a & mask) + u64::from(b & mask) + u64::from(cin);
    let result = (full & u64::from(mask)) as u32;
    let cf = full > u64::from(mask);
    let af = ((a & 0xF) + (b & 0xF) + cin) > 0xF;
    let sb = sign_bit(bits);
    let of = (a ^ b) & sb == 0 && (a ^ result) & sb != 0;
    (result, cf, of, af)
}

fn sub_with_borrow(a: u32, b: u32, bin: u32, bits: u32) -> (u32, bool, bool, bool) {
    let mask = width_mask(bits);
    let full = i64::from(a & mask) - i64::from(b & mask) - i64::from(bin);
    let result = (full & i64::from(mask)) as u32;
    let cf = full < 0;
    let af = (i64::from(a & 0xF) - i64::from(b & 0xF) - i64::from(bin)) < 0;
    let sb = sign_bit(bits);
    let of = (a ^ b) & sb != 0 && (result ^ a) & sb != 0;
    (result, cf, of, af)
}

fn push_value<B: Bus>(cpu: &mut Cpu, bus: &mut B, width: Width, value: u32) {
    let size: u16 = if width == Width::Dword { 4 } else { 2 };
    let sp = cpu.regs.read_reg(crate::registers::REG_SP, Width::Word) as u16;
    let new_sp = sp.wrapping_sub(size);
    cpu.regs.write_reg(crate::registers::REG_SP, Width::Word, u32::from(new_sp));
    let addr = SegmentedAddress::new(cpu.regs.segment(SegmentRegister::Ss), new_sp);
    match width {
        Width::Dword => bus.write_u32(addr, value),
        _ => bus.write_u16(addr, value as u16),
    }
}

fn pop_value<B: Bus>(cpu: &mut Cpu, bus: &mut B, width: Width) -> u32 {
    let size: u16 = if width == Width::Dword { 4 } else { 2 };
    let sp = cpu.regs.read_reg(REG_SP, Width::Word) as u16;
    let addr = SegmentedAddress::new(cpu.regs.segment(SegmentRegister::Ss), sp);
    let value = match width {
        Width::Dword => bus.read_u32(addr),
        _ => u32::from(bus.read_u16(addr)),
    };
    cpu.regs.write_reg(REG_SP, Width::Word, u32::from(sp.wrapping_add(size)));
    value
}

fn condition_holds(cond: Condition, flags: Flags) -> bool {
    match cond {
        Condition::O => flags.contains(Flags::OF),
        Condition::No => !flags.contains(Flags::OF),
        Condition::B => flags.contains(Flags::CF),
        Condition::Ae => !flags.contains(Flags::CF),
        Condition::E => flags.contains(Flags::ZF),
        Condition::Ne => !flags.contains(Flags::ZF),
        Condition::Be => flags.contains(Flags::CF) || flags.contains(Flags::ZF),
        Condition::A => !flags.contains(Flags::CF) && !flags.contains(Flags::ZF),
        Condition::S => flags.contains(Flags::SF),
        Condition::Ns => !flags.contains(Flags::SF),
        Condition::P => flags.contains(Flags::PF),
        Condition::Np => !flags.contains(Flags::PF),
        Condition::L => flags.contains(Flags::SF) != flags.contains(Flags::OF),
        Condition::Ge => flags.contains(Flags::SF) == flags.contains(Flags::OF),
        Condition::Le => flags.contains(Flags::ZF) || (flags.contains(Flags::SF) != flags.contains(Flags::OF)),
        Condition::G => !flags.contains(Flags::ZF) && (flags.contains(Flags::SF) == flags.contains(Flags::OF)),
    }
}

fn alu_compute(op: AluOp, width: Width, dest: u32, src: u32, flags: &mut Flags) -> u32 {
    let bits = width_bits(width);
    let mask = width_mask(bits);
    match op {
        AluOp::Add => {
            let (r, cf, of, af) = add_with_carry(dest, src, 0, bits);
            flags.set_arith(cf, of, af, r, bits);
            r & mask
        }
        AluOp::Adc => {
            let cin = u32::from(flags.contains(Flags::CF));
            let (r, cf, of, af) = add_with_carry(dest, src, cin, bits);
            flags.set_arith(cf, of, af, r, bits);
            r & mask
        }
        AluOp::Sub | AluOp::Cmp => {
            let (r, cf, of, af) = sub_with_borrow(dest, src, 0, bits);
            flags.set_arith(cf, of, af, r, bits);
            r & mask
        }
        AluOp::Sbb => {
            let bin = u32::from(flags.contains(Flags::CF));
            let (r, cf, of, af) = sub_with_borrow(dest, src, bin, bits);
            flags.set_arith(cf, of, af, r, bits);
            r & mask
        }
        AluOp::And => {
            let r = dest & src & mask;
            flags.set_logical(r, bits);
            r
        }
        AluOp::Or => {
            let r = (dest | src) & mask;
            flags.set_logical(r, bits);
            r
        }
        AluOp::Xor => {
            let r = (dest ^ src) & mask;
            flags.set_logical(r, bits);
            r
        }
    }
}

/// `INC`/`DEC` affect OF/SF/ZF/AF/PF but leave CF untouched (Intel SDM).
fn inc_dec(op: UnaryOp, width: Width, value: u32, flags: &mut Flags) -> u32 {
    let bits = width_bits(width);
    let cf_before = flags.contains(Flags::CF);
    let (r, _, of, af) = if op == UnaryOp::Inc {
        add_with_carry(value, 1, 0, bits)
    } else {
        sub_with_borrow(value, 1, 0, bits)
    };
    flags.set_arith(cf_before, of, af, r, bits);
    r & width_mask(bits)
}

/// spec.md §4.F: per-opcode execution, shared ALU/ModR/M/stack/string
/// services, interrupt dispatch, division faults.
pub struct InstructionExecutor;

impl Default for InstructionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn execute<B: Bus + cfg_decoder::InstructionBytes>(
        &self,
        instr: &CfgInstruction,
        cpu: &mut Cpu,
        bus: &mut B,
        feeder: &mut InstructionsFeeder,
        arena: &mut NodeArena,
    ) -> Result<ExecuteOutcome, CpuFault> {
        let fallthrough = instr.address.wrapping_add_offset(u16::from(instr.length));
        let mut outcome = ExecuteOutcome {
            next_ip: fallthrough,
            next_node_hint: None,
            can_cause_context_restore: false,
            halts: false,
        };

        match &instr.shape {
            InstructionShape::MovRegImm { reg, width } => {
                let value = last_field_live(instr, bus).as_u32();
                cpu.regs.write_reg(*reg, *width, value);
            }
            InstructionShape::MovRmReg { rm, reg, width, direction } => match direction {
                Direction::RmFromReg => {
                    let value = cpu.regs.read_reg(*reg, *width);
                    write_rm(rm, *width, value, &mut cpu.regs, bus);
                }
                Direction::RegFromRm => {
                    let value = read_rm(rm, *width, &cpu.regs, bus);
                    cpu.regs.write_reg(*reg, *width, value);
                }
            },
            InstructionShape::MovRmImm { rm, width } => {
                let value = last_field_live(instr, bus).as_u32();
                write_rm(rm, *width, value, &mut cpu.regs, bus);
            }
            InstructionShape::AluRmImm { op, rm, width } => {
                let imm = last_field_live(instr, bus).as_u32();
                let dest = read_rm(rm, *width, &cpu.regs, bus);
                let result = alu_compute(*op, *width, dest, imm, &mut cpu.regs.flags);
                if *op != AluOp::Cmp {
                    write_rm(rm, *width, result, &mut cpu.regs, bus);
                }
            }
            InstructionShape::AluAccImm { op, width } => {
                let imm = last_field_live(instr, bus).as_u32();
                let dest = cpu.regs.read_reg(crate::registers::REG_AX, *width);
                let result = alu_compute(*op, *width, dest, imm, &mut cpu.regs.flags);
                if *op != AluOp::Cmp {
                    cpu.regs.write_reg(crate::registers::REG_AX, *width, result);
                }
            }
            InstructionShape::AluRmReg { op, rm, reg, width, direction } => {
                let reg_value = cpu.regs.read_reg(*reg, *width);
                match direction {
                    Direction::RmFromReg => {
                        let dest = read_rm(rm, *width, &cpu.regs, bus);
                        let result = alu_compute(*op, *width, dest, reg_value, &mut cpu.regs.flags);
                        if *op != AluOp::Cmp {
                            write_rm(rm, *width, result, &mut cpu.regs, bus);
                        }
                    }
                    Direction::RegFromRm => {
                        let src = read_rm(rm, *width, &cpu.regs, bus);
                        let result = alu_compute(*op, *width, reg_value, src, &mut cpu.regs.flags);
                        if *op != AluOp::Cmp {
                            cpu.regs.write_reg(*reg, *width, result);
                        }
                    }
                }
            }
            InstructionShape::Unary { op, rm, width } => {
                self.execute_unary(*op, rm, *width, instr, cpu, bus)?;
            }
            InstructionShape::ShiftRotate { op, rm, count, width } => {
                let amount = match count {
                    ShiftCount::One => 1u32,
                    ShiftCount::Cl => cpu.regs.read_reg(crate::registers::REG_CX, Width::Byte) & 0x1F,
                    ShiftCount::Imm8 => last_field_live(instr, bus).as_u32() & 0x1F,
                };
                let value = read_rm(rm, *width, &cpu.regs, bus);
                let result = shift_rotate(*op, *width, value, amount, &mut cpu.regs.flags);
                write_rm(rm, *width, result, &mut cpu.regs, bus);
            }
            InstructionShape::Stack { op, rm, width } => match op {
                StackOp::Push => {
                    let value = read_rm(rm, *width, &cpu.regs, bus);
                    push_value(cpu, bus, *width, value);
                }
                StackOp::Pop => {
                    let value = pop_value(cpu, bus, *width);
                    write_rm(rm, *width, value, &mut cpu.regs, bus);
                }
            },
            InstructionShape::PushImm { width } => {
                let value = last_field_live(instr, bus).as_u32();
                push_value(cpu, bus, *width, value);
            }
            InstructionShape::Pushf => {
                push_value(cpu, bus, Width::Word, u32::from(cpu.regs.flags.bits()));
            }
            InstructionShape::Popf => {
                let value = pop_value(cpu, bus, Width::Word) as u16;
                cpu.regs.flags = Flags::from_bits_truncate(value);
            }
            InstructionShape::JmpShort => {
                let rel = last_field_live(instr, bus).as_i32();
                outcome.next_ip = fallthrough.wrapping_add_offset(rel as i16 as u16);
                self.hint_at(outcome.next_ip, bus, feeder, arena, &mut outcome)?;
            }
            InstructionShape::JmpNear { .. } => {
                let rel = last_field_live(instr, bus).as_i32();
                outcome.next_ip = fallthrough.wrapping_add_offset(rel as u16);
                self.hint_at(outcome.next_ip, bus, feeder, arena, &mut outcome)?;
            }
            InstructionShape::JmpFarIndirect { rm } => {
                outcome.next_ip = self.read_far_pointer(rm, cpu, bus)?;
                let target = outcome.next_ip;
                cpu.regs.set_segment(SegmentRegister::Cs, target.segment);
            }
            InstructionShape::Jcc { condition, .. } => {
                if condition_holds(*condition, cpu.regs.flags) {
                    let rel = last_field_live(instr, bus).as_i32();
                    outcome.next_ip = fallthrough.wrapping_add_offset(rel as u16);
                    self.hint_at(outcome.next_ip, bus, feeder, arena, &mut outcome)?;
                }
            }
            InstructionShape::CallNear { .. } => {
                let rel = last_field_live(instr, bus).as_i32();
                push_value(cpu, bus, Width::Word, u32::from(fallthrough.offset));
                outcome.next_ip = fallthrough.wrapping_add_offset(rel as u16);
                self.hint_at(outcome.next_ip, bus, feeder, arena, &mut outcome)?;
            }
            InstructionShape::CallFar { target } => {
                push_value(cpu, bus, Width::Word, u32::from(cpu.regs.segment(SegmentRegister::Cs)));
                push_value(cpu, bus, Width::Word, u32::from(fallthrough.offset));
                cpu.regs.set_segment(SegmentRegister::Cs, target.segment);
                outcome.next_ip = *target;
            }
            InstructionShape::CallFarIndirect { rm } => {
                let target = self.read_far_pointer(rm, cpu, bus)?;
                push_value(cpu, bus, Width::Word, u32::from(cpu.regs.segment(SegmentRegister::Cs)));
                push_value(cpu, bus, Width::Word, u32::from(fallthrough.offset));
                cpu.regs.set_segment(SegmentRegister::Cs, target.segment);
                outcome.next_ip = target;
            }
            InstructionShape::RetNear { pop_bytes } => {
                let ip = pop_value(cpu, bus, Width::Word) as u16;
                if *pop_bytes > 0 {
                    let sp = cpu.regs.read_reg(REG_SP, Width::Word) as u16;
                    cpu.regs.write_reg(REG_SP, Width::Word, u32::from(sp.wrapping_add(*pop_bytes)));
                }
                outcome.next_ip = SegmentedAddress::new(cpu.regs.segment(SegmentRegister::Cs), ip);
            }
            InstructionShape::RetFar { pop_bytes } => {
                let ip = pop_value(cpu, bus, Width::Word) as u16;
                let cs = pop_value(cpu, bus, Width::Word) as u16;
                if *pop_bytes > 0 {
                    let sp = cpu.regs.read_reg(REG_SP, Width::Word) as u16;
                    cpu.regs.write_reg(REG_SP, Width::Word, u32::from(sp.wrapping_add(*pop_bytes)));
                }
                cpu.regs.set_segment(SegmentRegister::Cs, cs);
                outcome.next_ip = SegmentedAddress::new(cs, ip);
            }
            InstructionShape::Loop { kind } => {
                let rel = last_field_live(instr, bus).as_i32();
                let cx = cpu.regs.read_reg(crate::registers::REG_CX, Width::Word) as u16;
                let taken = match kind {
                    LoopKind::Jcxz => cx == 0,
                    LoopKind::Loop => {
                        let new_cx = cx.wrapping_sub(1);
                        cpu.regs.write_reg(crate::registers::REG_CX, Width::Word, u32::from(new_cx));
                        new_cx != 0
                    }
                    LoopKind::Loope => {
                        let new_cx = cx.wrapping_sub(1);
                        cpu.regs.write_reg(crate::registers::REG_CX, Width::Word, u32::from(new_cx));
                        new_cx != 0 && cpu.regs.flags.contains(Flags::ZF)
                    }
                    LoopKind::Loopne => {
                        let new_cx = cx.wrapping_sub(1);
                        cpu.regs.write_reg(crate::registers::REG_CX, Width::Word, u32::from(new_cx));
                        new_cx != 0 && !cpu.regs.flags.contains(Flags::ZF)
                    }
                };
                if taken {
                    outcome.next_ip = fallthrough.wrapping_add_offset(rel as i16 as u16);
                    self.hint_at(outcome.next_ip, bus, feeder, arena, &mut outcome)?;
                }
            }
            InstructionShape::StringOp { op, rep, width } => {
                self.execute_string_op(*op, *rep, *width, instr, cpu, bus, &mut outcome);
            }
            InstructionShape::IntN { vector } => {
                let frame = self.dispatch_interrupt(*vector, fallthrough, cpu, bus);
                outcome.next_ip = frame.target;
            }
            InstructionShape::IntO => {
                if cpu.regs.flags.contains(Flags::OF) {
                    let frame = self.dispatch_interrupt(4, fallthrough, cpu, bus);
                    outcome.next_ip = frame.target;
                }
            }
            InstructionShape::IRet => {
                let ip = pop_value(cpu, bus, Width::Word) as u16;
                let cs = pop_value(cpu, bus, Width::Word) as u16;
                let flags = pop_value(cpu, bus, Width::Word) as u16;
                cpu.regs.set_segment(SegmentRegister::Cs, cs);
                cpu.regs.flags = Flags::from_bits_truncate(flags);
                outcome.next_ip = SegmentedAddress::new(cs, ip);
                outcome.can_cause_context_restore = true;
            }
            InstructionShape::Hlt => {
                cpu.halted = true;
                outcome.halts = true;
                outcome.next_ip = instr.address;
            }
            InstructionShape::Nop => {}
            InstructionShape::Cli => {
                cpu.regs.flags.remove(Flags::IF);
            }
            InstructionShape::Sti => {
                cpu.regs.flags.insert(Flags::IF);
            }
            InstructionShape::Cld => {
                cpu.regs.flags.remove(Flags::DF);
            }
            InstructionShape::Std => {
                cpu.regs.flags.insert(Flags::DF);
            }
            InstructionShape::ClcStc { set } => {
                cpu.regs.flags.set(Flags::CF, *set);
            }
            InstructionShape::Invalid => return Err(CpuFault::InvalidOpcode),
        }

        cpu.cycles += 1;
        Ok(outcome)
    }

    fn hint_at<B: Bus + cfg_decoder::InstructionBytes>(
        &self,
        target: SegmentedAddress,
        bus: &B,
        feeder: &mut InstructionsFeeder,
        arena: &mut NodeArena,
        outcome: &mut ExecuteOutcome,
    ) -> Result<(), CpuFault> {
        match feeder.get_or_parse(arena, bus, target) {
            Ok(handle) => {
                outcome.next_node_hint = Some(handle);
                Ok(())
            }
            Err(_) => Err(CpuFault::InvalidOpcode),
        }
    }

    fn read_far_pointer<B: Bus>(&self, rm: &RmOperand, cpu: &Cpu, bus: &B) -> Result<SegmentedAddress, CpuFault> {
        match rm {
            RmOperand::Memory(mem) => {
                let addr = resolve_memory_operand(mem, &cpu.regs, bus);
                let offset = bus.read_u16(addr);
                let segment = bus.read_u16(addr.wrapping_add_offset(2));
                Ok(SegmentedAddress::new(segment, offset))
            }
            RmOperand::Register(_) => Err(CpuFault::InvalidOpcode),
        }
    }

    fn execute_unary<B: Bus>(
        &self,
        op: UnaryOp,
        rm: &RmOperand,
        width: Width,
        instr: &CfgInstruction,
        cpu: &mut Cpu,
        bus: &mut B,
    ) -> Result<(), CpuFault> {
        let bits = width_bits(width);
        let mask = width_mask(bits);
        match op {
            UnaryOp::Not => {
                let v = read_rm(rm, width, &cpu.regs, bus);
                write_rm(rm, width, !v & mask, &mut cpu.regs, bus);
            }
            UnaryOp::Neg => {
                let v = read_rm(rm, width, &cpu.regs, bus);
                let (r, cf, of, af) = sub_with_borrow(0, v, 0, bits);
                cpu.regs.flags.set_arith(cf, of, af, r, bits);
                cpu.regs.flags.set(Flags::CF, v != 0);
                write_rm(rm, width, r & mask, &mut cpu.regs, bus);
            }
            UnaryOp::Inc => {
                let v = read_rm(rm, width, &cpu.regs, bus);
                let r = inc_dec(UnaryOp::Inc, width, v, &mut cpu.regs.flags);
                write_rm(rm, width, r, &mut cpu.regs, bus);
            }
            UnaryOp::Dec => {
                let v = read_rm(rm, width, &cpu.regs, bus);
                let r = inc_dec(UnaryOp::Dec, width, v, &mut cpu.regs.flags);
                write_rm(rm, width, r, &mut cpu.regs, bus);
            }
            UnaryOp::Test => {
                let v = read_rm(rm, width, &cpu.regs, bus);
                let imm = last_field_live(instr, bus).as_u32();
                let r = v & imm & mask;
                cpu.regs.flags.set_logical(r, bits);
            }
            UnaryOp::Mul => {
                let v = read_rm(rm, width, &cpu.regs, bus);
                let acc = cpu.regs.read_reg(crate::registers::REG_AX, width);
                let full = u64::from(acc) * u64::from(v);
                let (lo, hi_nonzero) = match width {
                    Width::Byte => {
                        cpu.regs.write_reg(crate::registers::REG_AX, Width::Word, full as u32);
                        (full as u32, (full >> 8) != 0)
                    }
                    Width::Word => {
                        cpu.regs.write_reg(crate::registers::REG_AX, Width::Word, full as u32 & 0xFFFF);
                        cpu.regs
                            .write_reg(crate::registers::REG_DX, Width::Word, (full >> 16) as u32 & 0xFFFF);
                        (full as u32, (full >> 16) != 0)
                    }
                    Width::Dword => {
                        cpu.regs.write_reg(crate::registers::REG_AX, Width::Dword, full as u32);
                        cpu.regs.write_reg(crate::registers::REG_DX, Width::Dword, (full >> 32) as u32);
                        (full as u32, (full >> 32) != 0)
                    }
                };
                let _ = lo;
                cpu.regs.flags.set(Flags::CF, hi_nonzero);
                cpu.regs.flags.set(Flags::OF, hi_nonzero);
            }
            UnaryOp::Imul => {
                let v = read_rm(rm, width, &cpu.regs, bus) as i32 as i64;
                let acc = cpu.regs.read_reg(crate::registers::REG_AX, width) as i32 as i64;
                let full = acc * v;
                let (overflows, full_u) = match width {
                    Width::Byte => {
                        cpu.regs.write_reg(crate::registers::REG_AX, Width::Word, full as u32 & 0xFFFF);
                        (full != (full as i8 as i64), full as u32)
                    }
                    Width::Word => {
                        cpu.regs.write_reg(crate::registers::REG_AX, Width::Word, full as u32 & 0xFFFF);
                        cpu.regs
                            .write_reg(crate::registers::REG_DX, Width::Word, (full >> 16) as u32 & 0xFFFF);
                        (full != (full as i16 as i64), full as u32)
                    }
                    Width::Dword => {
                        cpu.regs.write_reg(crate::registers::REG_AX, Width::Dword, full as u32);
                        cpu.regs.write_reg(crate::registers::REG_DX, Width::Dword, (full >> 32) as u32);
                        (full != (full as i32 as i64), full as u32)
                    }
                };
                let _ = full_u;
                cpu.regs.flags.set(Flags::CF, overflows);
                cpu.regs.flags.set(Flags::OF, overflows);
            }
            UnaryOp::Div => {
                let divisor = read_rm(rm, width, &cpu.regs, bus);
                if divisor == 0 {
                    return Err(CpuFault::DivisionError);
                }
                let (dividend, quot_bits) = match width {
                    Width::Byte => (cpu.regs.read_reg(crate::registers::REG_AX, Width::Word) as u64, 8),
                    Width::Word => {
                        let dx = cpu.regs.read_reg(crate::registers::REG_DX, Width::Word) as u64;
                        let ax = cpu.regs.read_reg(crate::registers::REG_AX, Width::Word) as u64;
                        ((dx << 16) | ax, 16)
                    }
                    Width::Dword => {
                        let edx = cpu.regs.read_reg(crate::registers::REG_DX, Width::Dword) as u64;
                        let eax = cpu.regs.read_reg(crate::registers::REG_AX, Width::Dword) as u64;
                        ((edx << 32) | eax, 32)
                    }
                };
                let quotient = dividend / u64::from(divisor);
                let remainder = dividend % u64::from(divisor);
                if quot_bits < 64 && quotient >= (1u64 << quot_bits) {
                    return Err(CpuFault::DivisionError);
                }
                match width {
                    Width::Byte => {
                        cpu.regs
                            .write_reg(crate::registers::REG_AX, Width::Word, (remainder as u32) << 8 | (quotient as u32 & 0xFF));
                    }
                    Width::Word => {
                        cpu.regs.write_reg(crate::registers::REG_AX, Width::Word, quotient as u32 & 0xFFFF);
                        cpu.regs.write_reg(crate::registers::REG_DX, Width::Word, remainder as u32 & 0xFFFF);
                    }
                    Width::Dword => {
                        cpu.regs.write_reg(crate::registers::REG_AX, Width::Dword, quotient as u32);
                        cpu.regs.write_reg(crate::registers::REG_DX, Width::Dword, remainder as u32);
                    }
                }
            }
            UnaryOp::Idiv => {
                let divisor = read_rm(rm, width, &cpu.regs, bus) as i32;
                if divisor == 0 {
                    return Err(CpuFault::DivisionError);
                }
                let (dividend, quot_bits): (i64, u32) = match width {
                    Width::Byte => (cpu.regs.read_reg(crate::registers::REG_AX, Width::Word) as i16 as i64, 8),
                    Width::Word => {
                        let dx = cpu.regs.read_reg(crate::registers::REG_DX, Width::Word) as u32;
                        let ax = cpu.regs.read_reg(crate::registers::REG_AX, Width::Word) as u32;
                        (((dx << 16 | ax) as i32) as i64, 16)
                    }
                    Width::Dword => {
                        let edx = cpu.regs.read_reg(crate::registers::REG_DX, Width::Dword) as u64;
                        let eax = cpu.regs.read_reg(crate::registers::REG_AX, Width::Dword) as u64;
                        (((edx << 32 | eax) as i64), 32)
                    }
                };
                let quotient = dividend / i64::from(divisor);
                let remainder = dividend % i64::from(divisor);
                let half = 1i64 << (quot_bits - 1);
                if quotient >= half || quotient < -half {
                    return Err(CpuFault::DivisionError);
                }
                match width {
                    Width::Byte => {
                        let q = quotient as i8 as u8;
                        let r = remainder as i8 as u8;
                        cpu.regs
                            .write_reg(crate::registers::REG_AX, Width::Word, (u32::from(r) << 8) | u32::from(q));
                    }
                    Width::Word => {
                        cpu.regs
                            .write_reg(crate::registers::REG_AX, Width::Word, quotient as i16 as u16 as u32);
                        cpu.regs
                            .write_reg(crate::registers::REG_DX, Width::Word, remainder as i16 as u16 as u32);
                    }
                    Width::Dword => {
                        cpu.regs.write_reg(crate::registers::REG_AX, Width::Dword, quotient as i32 as u32);
                        cpu.regs.write_reg(crate::registers::REG_DX, Width::Dword, remainder as i32 as u32);
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_string_op<B: Bus>(
        &self,
        op: StringOpKind,
        rep: Option<cfg_decoder::RepPrefix>,
        width: Width,
        instr: &CfgInstruction,
        cpu: &mut Cpu,
        bus: &mut B,
        outcome: &mut ExecuteOutcome,
    ) {
        use crate::registers::{REG_AX, REG_CX, REG_DI, REG_SI};

        if rep.is_some() {
            let cx = cpu.regs.read_reg(REG_CX, Width::Word) as u16;
            if cx == 0 {
                return;
            }
        }

        let step: i32 = match width {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
        };
        let dir = if cpu.regs.flags.contains(Flags::DF) { -step } else { step };

        // `StringOp` does not carry the prefix's segment override (the
        // decoder's shape has no slot for it), so SI always reads through DS
        // here; ES:DI is fixed per the architecture regardless.
        let si_addr = SegmentedAddress::new(cpu.regs.segment(SegmentRegister::Ds), cpu.regs.read_reg(REG_SI, Width::Word) as u16);
        let di_addr = SegmentedAddress::new(cpu.regs.segment(SegmentRegister::Es), cpu.regs.read_reg(REG_DI, Width::Word) as u16);

        let mut stop_due_to_flags = false;
        match op {
            StringOpKind::Movs => {
                let value = read_width(bus, si_addr, width);
                write_width(bus, di_addr, width, value);
            }
            StringOpKind::Stos => {
                let value = cpu.regs.read_reg(REG_AX, width);
                write_width(bus, di_addr, width, value);
            }
            StringOpKind::Lods => {
                let value = read_width(bus, si_addr, width);
                cpu.regs.write_reg(REG_AX, width, value);
            }
            StringOpKind::Scas => {
                let acc = cpu.regs.read_reg(REG_AX, width);
                let mem = read_width(bus, di_addr, width);
                alu_compute(AluOp::Cmp, width, acc, mem, &mut cpu.regs.flags);
                stop_due_to_flags = true;
            }
            StringOpKind::Cmps => {
                let a = read_width(bus, si_addr, width);
                let b = read_width(bus, di_addr, width);
                alu_compute(AluOp::Cmp, width, a, b, &mut cpu.regs.flags);
                stop_due_to_flags = true;
            }
        }

        if matches!(op, StringOpKind::Movs | StringOpKind::Lods | StringOpKind::Cmps) {
            let si = cpu.regs.read_reg(REG_SI, Width::Word) as i32;
            cpu.regs.write_reg(REG_SI, Width::Word, (si + dir) as u32 & 0xFFFF);
        }
        if matches!(op, StringOpKind::Movs | StringOpKind::Stos | StringOpKind::Scas | StringOpKind::Cmps) {
            let di = cpu.regs.read_reg(REG_DI, Width::Word) as i32;
            cpu.regs.write_reg(REG_DI, Width::Word, (di + dir) as u32 & 0xFFFF);
        }

        let done = match rep {
            None => true,
            Some(prefix) => {
                let cx = cpu.regs.read_reg(REG_CX, Width::Word) as u16;
                let new_cx = cx.wrapping_sub(1);
                cpu.regs.write_reg(REG_CX, Width::Word, u32::from(new_cx));
                let cx_exhausted = new_cx == 0;
                let flags_say_stop = stop_due_to_flags
                    && match prefix {
                        cfg_decoder::RepPrefix::Rep => !cpu.regs.flags.contains(Flags::ZF),
                        cfg_decoder::RepPrefix::Repne => cpu.regs.flags.contains(Flags::ZF),
                    };
                cx_exhausted || flags_say_stop
            }
        };

        if !done {
            outcome.next_ip = instr.address;
        }
    }

    /// spec.md §4.F "Interrupt dispatch": reads the IVT, pushes
    /// FLAGS/CS/IP, clears IF and TF, loads the handler's CS:IP.
    /// `return_address` is the address execution resumes at once the
    /// handler issues `IRET` — the faulting/trapping instruction's
    /// fallthrough for `INT n`/`INTO`, or the next instruction the loop was
    /// about to execute for an external interrupt.
    pub fn dispatch_interrupt<B: Bus>(
        &self,
        vector: u8,
        return_address: SegmentedAddress,
        cpu: &mut Cpu,
        bus: &mut B,
    ) -> InterruptFrame {
        let ivt_addr = SegmentedAddress::new(0, u16::from(vector) * 4);
        let offset = bus.read_u16(ivt_addr);
        let segment = bus.read_u16(ivt_addr.wrapping_add_offset(2));

        push_value(cpu, bus, Width::Word, u32::from(cpu.regs.flags.bits()));
        cpu.regs.flags.remove(Flags::IF | Flags::TF);
        push_value(cpu, bus, Width::Word, u32::from(cpu.regs.segment(SegmentRegister::Cs)));
        push_value(cpu, bus, Width::Word, u32::from(return_address.offset));

        cpu.regs.set_segment(SegmentRegister::Cs, segment);
        cpu.regs.ip = offset;

        InterruptFrame {
            target: SegmentedAddress::new(segment, offset),
            expected_return: return_address,
        }
    }
}

fn read_width<B: Bus>(bus: &B, addr: SegmentedAddress, width: Width) -> u32 {
    match width {
        Width::Byte => u32::from(bus.read_u8(addr)),
        Width::Word => u32::from(bus.read_u16(addr)),
        Width::Dword => bus.read_u32(addr),
    }
}

fn write_width<B: Bus>(bus: &mut B, addr: SegmentedAddress, width: Width, value: u32) {
    match width {
        Width::Byte => bus.write_u8(addr, value as u8),
        Width::Word => bus.write_u16(addr, value as u16),
        Width::Dword => bus.write_u32(addr, value),
    }
}

fn shift_rotate(op: ShiftOp, width: Width, value: u32, amount: u32, flags: &mut Flags) -> u32 {
    if amount == 0 {
        return value;
    }
    let bits = width_bits(width);
    let mask = width_mask(bits);
    let v = value & mask;
    match op {
        ShiftOp::Shl => {
            let full = u64::from(v) << amount;
            let result = (full as u32) & mask;
            let cf = amount <= bits && (full & (1u64 << bits)) != 0;
            flags.set(Flags::CF, cf);
            let of = amount == 1 && (cf != (result & sign_bit(bits) != 0));
            flags.set(Flags::OF, of);
            flags.set_arith(cf, of, false, result, bits);
            result
        }
        ShiftOp::Shr => {
            let amt = amount.min(bits + 1);
            let cf = amt > 0 && amt <= bits && (v >> (amt - 1)) & 1 != 0;
            let result = if amt >= bits { 0 } else { v >> amt };
            flags.set(Flags::CF, cf);
            let of = amount == 1 && (v & sign_bit(bits)) != 0;
            flags.set(Flags::OF, of);
            flags.set_arith(cf, of, false, result, bits);
            result
        }
        ShiftOp::Sar => {
            let signed = sign_extend(v, bits);
            let amt = amount.min(63);
            let cf = amt > 0 && ((signed >> (amt.saturating_sub(1))) & 1) != 0;
            let result = ((signed >> amt) as u32) & mask;
            flags.set(Flags::CF, cf);
            flags.set(Flags::OF, false);
            flags.set_arith(cf, false, false, result, bits);
            result
        }
        ShiftOp::Rol => {
            let amt = amount % bits;
            let result = if amt == 0 { v } else { ((v << amt) | (v >> (bits - amt))) & mask };
            let cf = result & 1 != 0;
            flags.set(Flags::CF, cf);
            if amount == 1 {
                flags.set(Flags::OF, cf != (result & sign_bit(bits) != 0));
            }
            result
        }
        ShiftOp::Ror => {
            let amt = amount % bits;
            let result = if amt == 0 { v } else { (v >> amt) | (v << (bits - amt)) & mask };
            let cf = result & sign_bit(bits) != 0;
            flags.set(Flags::CF, cf);
            if amount == 1 {
                let second_msb = (result << 1) & sign_bit(bits) != 0;
                flags.set(Flags::OF, cf != second_msb);
            }
            result
        }
        ShiftOp::Rcl | ShiftOp::Rcr => {
            // 9/17/33-bit rotate through carry; implemented bit-by-bit since
            // the carry folds into the rotated width.
            let mut result = v;
            let mut cf = flags.contains(Flags::CF);
            for _ in 0..(amount % (bits + 1)) {
                if op == ShiftOp::Rcl {
                    let new_cf = result & sign_bit(bits) != 0;
                    result = ((result << 1) | u32::from(cf)) & mask;
                    cf = new_cf;
                } else {
                    let new_cf = result & 1 != 0;
                    result = (result >> 1) | (u32::from(cf) << (bits - 1));
                    cf = new_cf;
                }
            }
            flags.set(Flags::CF, cf);
            result
        }
    }
}

fn sign_extend(v: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((v as u64) << shift) as i64 >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Memory;
    use crate::graph::NodeArena;
    use cfg_decoder::Parser;
    use cfg_types::SegmentedAddress;

    fn setup() -> (Cpu, Memory, InstructionsFeeder, NodeArena, InstructionExecutor) {
        (Cpu::new(), Memory::new(0x10000), InstructionsFeeder::new(), NodeArena::new(), InstructionExecutor::new())
    }

    #[test]
    fn mov_ax_imm16_sets_register_and_advances_ip() {
        // S1.
        let (mut cpu, mut mem, mut feeder, mut arena, exec) = setup();
        let addr = SegmentedAddress::new(0x0000, 0x0000);
        mem.write_u8(addr, 0xB8);
        mem.write_u8(addr.wrapping_add_offset(1), 0x34);
        mem.write_u8(addr.wrapping_add_offset(2), 0x12);
        cpu.regs.ip = 0;
        let instr = Parser::parse(&mem, addr).unwrap();
        let outcome = exec.execute(&instr, &mut cpu, &mut mem, &mut feeder, &mut arena).unwrap();
        assert_eq!(cpu.regs.read_reg(crate::registers::REG_AX, Width::Word), 0x1234);
        assert_eq!(outcome.next_ip.offset, 3);
    }

    #[test]
    fn add_al_al_with_0x80_sets_carry_zero_sign_overflow_parity() {
        // S2.
        let (mut cpu, mut mem, mut feeder, mut arena, exec) = setup();
        let addr = SegmentedAddress::new(0x0000, 0x0000);
        mem.write_u8(addr, 0x00); // ADD Eb,Gb
        mem.write_u8(addr.wrapping_add_offset(1), 0xC0); // modrm: AL,AL
        cpu.regs.write_reg(crate::registers::REG_AX, Width::Byte, 0x80);
        let instr = Parser::parse(&mem, addr).unwrap();
        exec.execute(&instr, &mut cpu, &mut mem, &mut feeder, &mut arena).unwrap();
        assert_eq!(cpu.regs.read_reg(crate::registers::REG_AX, Width::Byte), 0);
        assert!(cpu.regs.flags.contains(Flags::CF));
        assert!(cpu.regs.flags.contains(Flags::ZF));
        assert!(!cpu.regs.flags.contains(Flags::SF));
        assert!(cpu.regs.flags.contains(Flags::OF));
        assert!(!cpu.regs.flags.contains(Flags::AF));
        assert!(cpu.regs.flags.contains(Flags::PF));
    }

    #[test]
    fn nop_leaves_registers_and_flags_untouched_but_advances_ip() {
        // P8.
        let (mut cpu, mut mem, mut feeder, mut arena, exec) = setup();
        let addr = SegmentedAddress::new(0x0000, 0x0000);
        mem.write_u8(addr, 0x90);
        cpu.regs.write_reg(crate::registers::REG_AX, Width::Word, 0x1234);
        cpu.regs.flags = Flags::ZF | Flags::CF;
        let before = cpu.regs.clone();
        let instr = Parser::parse(&mem, addr).unwrap();
        let outcome = exec.execute(&instr, &mut cpu, &mut mem, &mut feeder, &mut arena).unwrap();
        assert_eq!(outcome.next_ip.offset, 1);
        assert_eq!(before, cpu.regs);
    }

    #[test]
    fn call_then_ret_produces_matching_fallthrough_address() {
        // S5.
        let (mut cpu, mut mem, mut feeder, mut arena, exec) = setup();
        let call_addr = SegmentedAddress::new(0x0100, 0x0100);
        mem.write_u8(call_addr, 0xE8);
        mem.write_u8(call_addr.wrapping_add_offset(1), 0xFD);
        mem.write_u8(call_addr.wrapping_add_offset(2), 0xFF);
        cpu.regs.set_segment(SegmentRegister::Cs, 0x0100);
        cpu.regs.set_segment(SegmentRegister::Ss, 0x0100);
        cpu.regs.write_reg(REG_SP, Width::Word, 0x0200);
        cpu.regs.ip = 0x0100;
        let call = Parser::parse(&mem, call_addr).unwrap();
        let call_outcome = exec.execute(&call, &mut cpu, &mut mem, &mut feeder, &mut arena).unwrap();
        assert_eq!(call_outcome.next_ip.offset, 0x0100);
        let pushed_return = mem.read_u16(SegmentedAddress::new(0x0100, 0x01FE));
        assert_eq!(pushed_return, 0x0103);

        let ret_addr = SegmentedAddress::new(0x0100, 0x0100);
        mem.write_u8(ret_addr, 0xC3);
        cpu.regs.ip = 0x0100;
        let ret = Parser::parse(&mem, ret_addr).unwrap();
        let ret_outcome = exec.execute(&ret, &mut cpu, &mut mem, &mut feeder, &mut arena).unwrap();
        assert_eq!(ret_outcome.next_ip.offset, 0x0103);
        assert_eq!(cpu.regs.read_reg(REG_SP, Width::Word), 0x0200);
    }

    #[test]
    fn interrupt_dispatch_pushes_flags_cs_ip_and_jumps_through_the_ivt() {
        // S6.
        let (mut cpu, mut mem, _feeder, _arena, exec) = setup();
        mem.write_u16(SegmentedAddress::new(0, 0x0020), 0x0050); // offset
        mem.write_u16(SegmentedAddress::new(0, 0x0022), 0x0000); // segment
        cpu.regs.set_segment(SegmentRegister::Cs, 0x0000);
        cpu.regs.set_segment(SegmentRegister::Ss, 0x0000);
        cpu.regs.write_reg(REG_SP, Width::Word, 0x1000);
        cpu.regs.ip = 0x0100;
        cpu.regs.flags.insert(Flags::IF);

        let frame = exec.dispatch_interrupt(0x08, SegmentedAddress::new(0x0000, 0x0100), &mut cpu, &mut mem);
        assert_eq!(frame.target, SegmentedAddress::new(0x0000, 0x0050));
        assert_eq!(frame.expected_return, SegmentedAddress::new(0x0000, 0x0100));
        assert!(!cpu.regs.flags.contains(Flags::IF));
        assert_eq!(cpu.regs.ip, 0x0050);

        let ip = mem.read_u16(SegmentedAddress::new(0x0000, 0x0FFA));
        let cs = mem.read_u16(SegmentedAddress::new(0x0000, 0x0FFC));
        assert_eq!(ip, 0x0100);
        assert_eq!(cs, 0x0000);
    }

    #[test]
    fn div_by_zero_raises_division_error() {
        let (mut cpu, mut mem, mut feeder, mut arena, exec) = setup();
        let addr = SegmentedAddress::new(0x0000, 0x0000);
        mem.write_u8(addr, 0xF6);
        mem.write_u8(addr.wrapping_add_offset(1), 0xF0); // modrm: DIV AL (reg=110, rm=000 -> AX mod=11)
        cpu.regs.write_reg(crate::registers::REG_AX, Width::Word, 0x0100);
        let instr = Parser::parse(&mem, addr).unwrap();
        let err = exec.execute(&instr, &mut cpu, &mut mem, &mut feeder, &mut arena).unwrap_err();
        assert_eq!(err, CpuFault::DivisionError);
    }
}
