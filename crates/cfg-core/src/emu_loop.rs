//! The main `step()` loop (spec.md §4.I): fetch-or-reuse, link, execute,
//! advance, drain the scheduler, and poll for interrupts — the one place
//! that ties the feeder, linker, context manager, executor and scheduler
//! together over a concrete `Bus`.

use cfg_decoder::InstructionBytes;
use cfg_interrupts::{Breakpoint, BreakpointKind, BreakpointTable, ProgrammableInterruptController};
use cfg_types::SegmentedAddress;

use crate::bus::Bus;
use crate::context::ExecutionContextManager;
use crate::cpu::Cpu;
use crate::error::CfgError;
use crate::executor::InstructionExecutor;
use crate::fault::CpuFault;
use crate::flags::Flags;
use crate::graph::{Node, NodeArena, NodeHandle, NodeLinker, SuccessorType};
use crate::registers::SegmentRegister;
use crate::scheduler::{EmulationLoopScheduler, FiredEvent};

/// What a single `step()` call observed (spec.md §4.I plus breakpoints).
/// `fatal` being `Some` means a CFG invariant was violated (spec.md §7:
/// "callers are expected to stop and dump the offending neighbourhood") —
/// once set, every later `step()` call returns the same error and does
/// nothing else; there is no way to resume a loop in this state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepOutcome {
    pub halted: bool,
    pub breakpoint_hit: Option<Breakpoint>,
    pub fired_events: Vec<FiredEvent>,
    pub fatal: Option<CfgError>,
}

/// Owns every piece of mutable core state except `Cpu` and the `Bus`
/// (spec.md §9 Design Notes: "pass a `CoreServices` struct explicitly" —
/// here the loop itself plays that role, taking `Cpu`/`Bus` as `step`
/// parameters so a host can snapshot/restore them independently).
pub struct EmulationLoop<P: ProgrammableInterruptController> {
    arena: NodeArena,
    feeder: crate::feeder::InstructionsFeeder,
    linker: NodeLinker,
    context_manager: ExecutionContextManager,
    executor: InstructionExecutor,
    scheduler: EmulationLoopScheduler,
    breakpoints: BreakpointTable,
    pic: P,
    fatal: Option<CfgError>,
}

impl<P: ProgrammableInterruptController> EmulationLoop<P> {
    pub fn new(entry: SegmentedAddress, scheduler_capacity: usize, cycles_per_ms: u64, pic: P) -> Self {
        Self {
            arena: NodeArena::new(),
            feeder: crate::feeder::InstructionsFeeder::new(),
            linker: NodeLinker::new(),
            context_manager: ExecutionContextManager::new(entry),
            executor: InstructionExecutor::new(),
            scheduler: EmulationLoopScheduler::new(scheduler_capacity, cycles_per_ms),
            breakpoints: BreakpointTable::new(),
            pic,
            fatal: None,
        }
    }

    pub fn context_manager(&self) -> &ExecutionContextManager {
        &self.context_manager
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn scheduler_mut(&mut self) -> &mut EmulationLoopScheduler {
        &mut self.scheduler
    }

    pub fn breakpoints_mut(&mut self) -> &mut BreakpointTable {
        &mut self.breakpoints
    }

    /// `Some` once a CFG invariant violation has halted the loop for good.
    pub fn fatal_error(&self) -> Option<&CfgError> {
        self.fatal.as_ref()
    }

    fn time_now_ms(&self, cpu: &Cpu) -> f64 {
        cpu.cycles as f64 / self.scheduler.cycles_per_ms() as f64
    }

    /// Runs exactly one step of spec.md §4.I's 8-point algorithm.
    pub fn step<B: Bus + InstructionBytes>(&mut self, cpu: &mut Cpu, bus: &mut B) -> StepOutcome {
        if let Some(err) = self.fatal.clone() {
            return StepOutcome {
                halted: true,
                breakpoint_hit: None,
                fired_events: Vec::new(),
                fatal: Some(err),
            };
        }

        let current_ip = cpu.regs.cs_ip();

        if !cpu.halted {
            if let Some(bp) = self.breakpoints.take_hits(BreakpointKind::Execution, u64::from(current_ip.linear())).into_iter().next() {
                return StepOutcome {
                    halted: cpu.halted,
                    breakpoint_hit: Some(bp),
                    fired_events: Vec::new(),
                    fatal: None,
                };
            }

            self.execute_one(cpu, bus, current_ip);

            if let Some(err) = self.fatal.clone() {
                return StepOutcome {
                    halted: true,
                    breakpoint_hit: None,
                    fired_events: Vec::new(),
                    fatal: Some(err),
                };
            }
        }

        let mut fired_events = Vec::new();
        if self.scheduler.due(cpu.cycles) {
            let time_now_ms = self.time_now_ms(cpu);
            fired_events = self.scheduler.process_events(cpu.cycles, time_now_ms);
        }

        if cpu.regs.flags.contains(Flags::IF) {
            if let Some(vector) = self.pic.compute_vector_number() {
                self.dispatch_and_track(vector, cpu.regs.cs_ip(), cpu, bus);
                cpu.halted = false;
            }
        }

        StepOutcome {
            halted: cpu.halted,
            breakpoint_hit: None,
            fired_events,
            fatal: None,
        }
    }

    /// Steps 1-4 and 6-8 of spec.md §4.I (everything gated on "not halted").
    /// Stops short and records `self.fatal` instead of executing if linking
    /// the just-fetched node hits an unresolvable CFG discrepancy (spec.md
    /// §7): callers are expected to stop, not paper over a corrupted graph.
    fn execute_one<B: Bus + InstructionBytes>(&mut self, cpu: &mut Cpu, bus: &mut B, current_ip: SegmentedAddress) {
        let current = self.context_manager.current();
        let last_executed = current.last_executed;
        let to_execute = match current.next_according_to_graph {
            Some(node) => node.handle(),
            None => match self.feeder.get_or_parse(&mut self.arena, bus, current_ip) {
                Ok(handle) => handle,
                Err(_) => {
                    self.raise_fault(CpuFault::InvalidOpcode, None, cpu, bus);
                    return;
                }
            },
        };

        if let Some(prev) = last_executed {
            if let Err(err) = self.linker.link(&mut self.arena, Some(prev.handle()), to_execute) {
                tracing::error!(%err, "halting: unresolvable CFG discrepancy");
                cpu.halted = true;
                self.fatal = Some(err);
                return;
            }
        }

        let instr = self
            .arena
            .instruction(to_execute)
            .expect("to_execute always names a live instruction node")
            .instruction
            .clone();

        match self.executor.execute(&instr, cpu, bus, &mut self.feeder, &mut self.arena) {
            Ok(outcome) => {
                cpu.regs.set_segment(SegmentRegister::Cs, outcome.next_ip.segment);
                cpu.regs.ip = outcome.next_ip.offset;
                cpu.cycles += 1;

                if outcome.can_cause_context_restore {
                    self.context_manager.maybe_restore_at(outcome.next_ip);
                }

                let ctx = self.context_manager.current_mut();
                ctx.last_executed = Some(Node::Instruction(to_execute));
                ctx.next_according_to_graph = outcome.next_node_hint.map(Node::Instruction);

                if outcome.halts {
                    cpu.halted = true;
                }
            }
            Err(fault) => {
                cpu.cycles += 1;
                self.raise_fault(fault, Some(to_execute), cpu, bus);
            }
        }
    }

    /// spec.md §4.G: on a CPU fault, link the faulting node to the ISR
    /// entry with `SuccessorType::CpuFault`, then dispatch the fault's
    /// vector through the ordinary IVT path. `fault_node` is `None` only for
    /// a parse failure (spec.md P7 instruction-too-long case), which never
    /// had a graph node to anchor in the first place.
    fn raise_fault<B: Bus + InstructionBytes>(&mut self, fault: CpuFault, fault_node: Option<NodeHandle>, cpu: &mut Cpu, bus: &mut B) {
        let return_address = cpu.regs.cs_ip();
        let isr_node = self.dispatch_and_track(fault.vector(), return_address, cpu, bus);
        if let (Some(fault_node), Some(isr_node)) = (fault_node, isr_node) {
            self.arena.link(fault_node, isr_node, SuccessorType::CpuFault);
        }
    }

    /// Runs `dispatch_interrupt`, pushes a new execution context expecting
    /// to return to `return_address`, and resolves the handler's entry into
    /// a graph node (best-effort: a decode failure at the IVT target just
    /// means no node is linked, dispatch still proceeds). Shared by the
    /// fault path and the external-interrupt poll (spec.md §4.I step 7).
    fn dispatch_and_track<B: Bus + InstructionBytes>(&mut self, vector: u8, return_address: SegmentedAddress, cpu: &mut Cpu, bus: &mut B) -> Option<NodeHandle> {
        let frame = self.executor.dispatch_interrupt(vector, return_address, cpu, bus);
        self.context_manager.signal_new_context(frame.target, Some(frame.expected_return));
        let ctx = self.context_manager.current_mut();
        ctx.last_executed = None;
        ctx.next_according_to_graph = None;
        self.feeder.get_or_parse(&mut self.arena, bus, frame.target).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Memory;
    use cfg_interrupts::NoInterruptsPending;

    fn write_ivt_entry(mem: &mut Memory, vector: u8, target: SegmentedAddress) {
        let ivt = SegmentedAddress::new(0, u16::from(vector) * 4);
        mem.write_u16(ivt, target.offset);
        mem.write_u16(ivt.wrapping_add_offset(2), target.segment);
    }

    #[test]
    fn nop_then_hlt_stops_fetching_but_keeps_stepping() {
        let entry = SegmentedAddress::new(0x0100, 0x0000);
        let mut mem = Memory::new(0x10000);
        mem.write_u8(entry, 0x90); // NOP
        mem.write_u8(entry.wrapping_add_offset(1), 0xF4); // HLT

        let mut cpu = Cpu::new();
        cpu.regs.set_segment(SegmentRegister::Cs, entry.segment);
        cpu.regs.ip = entry.offset;

        let mut emu = EmulationLoop::new(entry, 8, 1000, NoInterruptsPending);
        let out1 = emu.step(&mut cpu, &mut mem);
        assert!(!out1.halted);
        assert_eq!(cpu.regs.ip, 1);

        let out2 = emu.step(&mut cpu, &mut mem);
        assert!(out2.halted);
        assert_eq!(cpu.regs.ip, 1); // HLT's own address, not advanced past it

        // A further step while halted does not re-execute or move IP.
        let out3 = emu.step(&mut cpu, &mut mem);
        assert!(out3.halted);
        assert_eq!(cpu.regs.ip, 1);
    }

    #[test]
    fn division_by_zero_dispatches_through_the_ivt() {
        let entry = SegmentedAddress::new(0x0100, 0x0000);
        let handler = SegmentedAddress::new(0x0200, 0x0000);
        let mut mem = Memory::new(0x10000);
        // DIV AL with AL=0: F6 /6, modrm 0xF0 selects reg=110=DIV on AL.
        mem.write_u8(entry, 0xF6);
        mem.write_u8(entry.wrapping_add_offset(1), 0xF0);
        write_ivt_entry(&mut mem, 0, handler);

        let mut cpu = Cpu::new();
        cpu.regs.set_segment(SegmentRegister::Cs, entry.segment);
        cpu.regs.ip = entry.offset;
        cpu.regs.set_segment(SegmentRegister::Ss, 0x0050);
        cpu.regs.write_reg(crate::registers::REG_SP, cfg_decoder::Width::Word, 0x0100);

        let mut emu = EmulationLoop::new(entry, 8, 1000, NoInterruptsPending);
        let root = emu.context_manager().current_handle();
        emu.step(&mut cpu, &mut mem);

        assert_eq!(cpu.regs.segment(SegmentRegister::Cs), handler.segment);
        assert_eq!(cpu.regs.ip, handler.offset);
        assert_ne!(emu.context_manager().current_handle(), root);
    }

    /// A PIC that offers one fixed vector exactly once, then goes quiet.
    struct OneShotPic {
        vector: Option<u8>,
    }

    impl ProgrammableInterruptController for OneShotPic {
        fn compute_vector_number(&mut self) -> Option<u8> {
            self.vector.take()
        }
    }

    #[test]
    fn external_interrupt_is_delivered_when_if_is_set_and_ignored_when_clear() {
        // S6.
        let entry = SegmentedAddress::new(0x0100, 0x0000);
        let handler = SegmentedAddress::new(0x0300, 0x0000);
        let mut mem = Memory::new(0x10000);
        mem.write_u8(entry, 0x90); // NOP
        write_ivt_entry(&mut mem, 0x20, handler);

        let mut cpu = Cpu::new();
        cpu.regs.set_segment(SegmentRegister::Cs, entry.segment);
        cpu.regs.ip = entry.offset;
        cpu.regs.set_segment(SegmentRegister::Ss, 0x0050);
        cpu.regs.write_reg(crate::registers::REG_SP, cfg_decoder::Width::Word, 0x0100);

        let mut emu = EmulationLoop::new(entry, 8, 1000, OneShotPic { vector: Some(0x20) });

        // IF is clear: the pending vector is not consumed, NOP just runs.
        emu.step(&mut cpu, &mut mem);
        assert_eq!(cpu.regs.ip, 1);
        assert_eq!(cpu.regs.segment(SegmentRegister::Cs), entry.segment);

        // IF set: the next step both executes HLT's slot (there is none left,
        // so this step only polls) and takes the now-pending vector.
        cpu.regs.flags.insert(Flags::IF);
        let root = emu.context_manager().current_handle();
        emu.step(&mut cpu, &mut mem);

        assert_eq!(cpu.regs.segment(SegmentRegister::Cs), handler.segment);
        assert_eq!(cpu.regs.ip, handler.offset);
        assert_ne!(emu.context_manager().current_handle(), root);
    }

    #[test]
    fn cfg_discrepancy_halts_the_loop_and_later_steps_return_the_same_fatal_error() {
        let entry = SegmentedAddress::new(0x0100, 0x0000);
        let mut mem = Memory::new(0x10000);
        mem.write_u8(entry, 0x90); // NOP

        let mut cpu = Cpu::new();
        cpu.regs.set_segment(SegmentRegister::Cs, entry.segment);
        cpu.regs.ip = entry.offset;

        let mut emu = EmulationLoop::new(entry, 8, 1000, NoInterruptsPending);

        // Fabricate a corrupted I1-I4 state directly: a predecessor that
        // already claims a different node at `entry` than the one the
        // feeder is about to resolve to. This never happens through the
        // feeder/linker's own API (that is the whole point of the
        // discrepancy check) — it models a host-level bug.
        let conflicting = emu.arena.alloc_instruction(cfg_decoder::CfgInstruction::new(entry, Vec::new(), cfg_decoder::InstructionShape::Hlt));
        let pred = emu
            .arena
            .alloc_instruction(cfg_decoder::CfgInstruction::new(SegmentedAddress::new(0x0100, 0x0010), Vec::new(), cfg_decoder::InstructionShape::Nop));
        emu.arena.link(pred, conflicting, SuccessorType::Normal);
        emu.context_manager.current_mut().last_executed = Some(Node::Instruction(pred));

        let out = emu.step(&mut cpu, &mut mem);
        assert!(out.halted);
        assert!(matches!(out.fatal, Some(CfgError::UnhandledCfgDiscrepancy { .. })));

        let out2 = emu.step(&mut cpu, &mut mem);
        assert!(out2.halted);
        assert_eq!(out2.fatal, out.fatal);
    }
}
