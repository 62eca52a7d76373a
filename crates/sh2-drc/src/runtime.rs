//! The recompiler context.
//!
//! [`Jit`] owns every piece of mutable engine state: the translation cache, the SMC index, the
//! register cache used while translating and the host machine running the generated code. It is
//! single-threaded; the embedder drives it through [`Jit::execute`] and reports guest writes it
//! performs itself through [`Jit::on_write`].

use tracing::{debug, trace, warn};

use crate::bus::{EventOutcome, GuestBus, GuestEvent};
use crate::config::{CodeRegion, JitConfig};
use crate::error::{JitError, TranslateError};
use crate::guest::{CpuState, GuestReg};
use crate::host::machine::{HostMachine, Step};
use crate::host::{Helper, HostReg};
use crate::regcache::{RegCache, ARG_REGS, CYCLES_REG};
use crate::scan::{scan_block, ScanLimits};
use crate::smc::SmcIndex;
use crate::tcache::{BufferState, CodeAddr, LinkOutcome, NewBlock, TranslationCache};
use crate::translate::{emit_stubs, translate_block, Stubs, TranslateOptions};

/// Bytes reserved at the start of the code arena for the utility stubs.
const STUB_BYTES: u32 = 64;

/// Cycles charged for accepting an interrupt.
pub const INTERRUPT_CYCLES: i32 = 13;

/// Largest exception frame the default entry sequence pushes.
const EXCEPTION_FRAME_BYTES: u32 = 8;

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStats {
    pub blocks_translated: u64,
    pub lookups_hit: u64,
    pub lookups_missed: u64,
    pub flushes: u64,
    pub blocks_invalidated: u64,
    pub links_resolved: u64,
    pub unimplemented_opcodes: u64,
    pub entries_traced: u64,
    pub interrupts_taken: u64,
}

pub struct Jit {
    config: JitConfig,
    limits: ScanLimits,
    tcache: TranslationCache,
    smc: SmcIndex,
    stubs: Stubs,
    rc: RegCache,
    machine: HostMachine,
    stats: JitStats,
}

impl Jit {
    /// Validate `config`, allocate the cache buffers and generate the utility stubs.
    pub fn init(config: JitConfig) -> Result<Self, JitError> {
        config.validate()?;
        let mut tcache = TranslationCache::new(&config, STUB_BYTES);
        let stubs = {
            let mut e = tcache.stub_emitter();
            let stubs = emit_stubs(&mut e);
            debug_assert!(!e.overflowed(), "utility stubs exceed their reserved window");
            stubs
        };
        debug!(
            buffers = config.buffers.len(),
            arena_bytes = tcache.arena().len(),
            "recompiler initialized"
        );
        Ok(Self {
            limits: ScanLimits::from(&config),
            smc: SmcIndex::new(&config),
            rc: RegCache::new(config.propagate_constants),
            machine: HostMachine::new(),
            stats: JitStats::default(),
            config,
            tcache,
            stubs,
        })
    }

    /// Release every buffer and table. Returns the final counters.
    pub fn shutdown(self) -> JitStats {
        debug!(
            blocks = self.block_count(),
            translated = self.stats.blocks_translated,
            "recompiler shut down"
        );
        self.stats
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn stubs(&self) -> Stubs {
        self.stubs
    }

    pub fn tcache(&self) -> &TranslationCache {
        &self.tcache
    }

    /// Direct access to the translation cache. Blocks added here are not tracked for SMC.
    pub fn tcache_mut(&mut self) -> &mut TranslationCache {
        &mut self.tcache
    }

    pub fn buffer_state(&self, tcache: usize) -> BufferState {
        self.tcache.buffer(tcache).state()
    }

    /// Live blocks across all buffers.
    pub fn block_count(&self) -> usize {
        (0..self.tcache.buffer_count())
            .map(|t| self.tcache.buffer(t).live_blocks())
            .sum()
    }

    /// Host code for guest `pc`, if a live block has an entry there.
    pub fn lookup(&self, pc: u32) -> Option<CodeAddr> {
        let (_, region) = self.config.region_of(pc)?;
        self.tcache.lookup(region.tcache, pc)
    }

    /// Whether a write to `addr` would hit translated code.
    pub fn has_code_at(&self, addr: u32) -> bool {
        match self.config.region_of(addr) {
            Some((index, region)) if region.smc => self.smc.has_code(index, region.offset(addr)),
            _ => false,
        }
    }

    /// Invalidate every block covering the guest halfword at `addr`. Must be called for guest
    /// writes that do not go through translated code. Returns the number of blocks dropped.
    pub fn on_write(&mut self, addr: u32) -> usize {
        let Some((index, region)) = self.config.region_of(addr) else {
            return 0;
        };
        if !region.smc {
            return 0;
        }
        let hit = self
            .smc
            .on_write(index, region.offset(addr) & !1, self.config.literal_cooldown);
        for &block in &hit.blocks {
            self.tcache.invalidate_block(block, self.stubs.dispatcher);
        }
        if !hit.blocks.is_empty() {
            debug!(
                addr = format_args!("{addr:#010x}"),
                region = region.name,
                blocks = hit.blocks.len(),
                literal = hit.literal,
                "guest write hit translated code"
            );
            self.stats.blocks_invalidated += hit.blocks.len() as u64;
        }
        hit.blocks.len()
    }

    /// Drop every translation.
    pub fn flush_all(&mut self) {
        for tcache in 0..self.tcache.buffer_count() {
            self.tcache.flush(tcache);
        }
        self.smc.clear();
        self.stats.flushes += self.tcache.buffer_count() as u64;
    }

    fn flush_buffer(&mut self, tcache: usize) {
        self.tcache.flush(tcache);
        self.smc.forget_buffer(tcache);
        self.stats.flushes += 1;
    }

    /// Translate the block at `pc`. A capacity failure flushes the target buffer and retries
    /// once.
    pub fn translate<B: GuestBus + ?Sized>(&mut self, bus: &B, pc: u32) -> Result<CodeAddr, JitError> {
        let Some((index, region)) = self.config.region_of(pc) else {
            return Err(JitError::NoCode { pc });
        };
        let region = *region;
        let fail = |source: TranslateError| match source {
            TranslateError::InvalidPc { pc } => JitError::NoCode { pc },
            source => JitError::TranslationFailed {
                pc,
                tcache: region.tcache,
                source,
            },
        };
        match self.try_translate(bus, pc, index, &region) {
            Ok(code) => Ok(code),
            Err(TranslateError::InvalidPc { pc }) => Err(JitError::NoCode { pc }),
            Err(err) => {
                debug!(
                    pc = format_args!("{pc:#010x}"),
                    tcache = region.tcache,
                    %err,
                    "translation failed; flushing buffer"
                );
                self.flush_buffer(region.tcache);
                self.try_translate(bus, pc, index, &region).map_err(fail)
            }
        }
    }

    fn try_translate<B: GuestBus + ?Sized>(
        &mut self,
        bus: &B,
        pc: u32,
        region_index: usize,
        region: &CodeRegion,
    ) -> Result<CodeAddr, TranslateError> {
        let tcache = region.tcache;
        if self.tcache.buffer(tcache).state() == BufferState::Overflowing {
            self.flush_buffer(tcache);
        }
        let literals = self.smc.literals_enabled(region_index);
        let scan = scan_block(|addr| bus.fetch16(addr), pc, &self.limits, literals)?;
        if !self.tcache.buffer(tcache).can_add_block() {
            return Err(TranslateError::DescriptorTableFull { tcache });
        }

        let opts = TranslateOptions {
            max_block_entries: self.config.max_block_entries,
            trace_block_entries: self.config.trace_block_entries,
        };
        let (translation, overflowed) = {
            let mut e = self.tcache.emitter(tcache);
            let translation = translate_block(&mut e, &mut self.rc, &scan, self.stubs, opts);
            (translation, e.overflowed())
        };
        if overflowed {
            self.tcache.mark_overflowing(tcache);
            return Err(TranslateError::CodeBufferFull { tcache });
        }

        let block = self.tcache.add_block(
            tcache,
            &NewBlock {
                pc,
                end_pc: scan.end_pc,
                end_literals: scan.end_literals,
                code: translation.code_start..translation.code_end,
            },
        )?;
        self.tcache.commit_code(tcache, translation.code_end);
        for &(entry_pc, code) in translation.entries.iter().skip(1) {
            if !self.tcache.add_entry(block, entry_pc, code) {
                warn!(
                    pc = format_args!("{entry_pc:#010x}"),
                    "block entry table full; entry left unhashed"
                );
            }
        }
        for branch in &translation.ext_branches {
            let same_buffer = self
                .config
                .region_of(branch.target_pc)
                .is_some_and(|(_, r)| r.tcache == tcache);
            if self.config.link_branches
                && same_buffer
                && self.tcache.link_branch(block, branch.site, branch.target_pc)
                    == LinkOutcome::Linked
            {
                self.stats.links_resolved += 1;
            }
        }
        self.smc
            .track(region_index, region, block, pc, scan.end_pc, scan.end_literals);

        self.stats.blocks_translated += 1;
        self.stats.unimplemented_opcodes += u64::from(translation.unhandled);
        debug!(
            pc = format_args!("{pc:#010x}"),
            tcache,
            slot = block.slot,
            insns = scan.ops.len(),
            entries = translation.entries.len(),
            code_bytes = translation.code_end - translation.code_start,
            literals = scan.literals_inlined,
            "translated block"
        );
        Ok(translation.code_start)
    }

    /// Run guest code starting at `cpu.pc()` until `budget` cycles are used up or control
    /// reaches code that cannot be translated. Returns the cycles consumed, which may exceed the
    /// budget by the cost of the last block.
    pub fn execute<B: GuestBus + ?Sized>(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut B,
        budget: u32,
    ) -> Result<u32, JitError> {
        let budget = budget.min(i32::MAX as u32) as i32;
        cpu.set_cycles(budget);
        self.machine.reset_stacks();

        if self.check_interrupt(cpu, bus) == Some(EventOutcome::ExitToInterpreter) {
            return Ok(consumed(budget, cpu.cycles()));
        }
        self.machine.set_reg(CYCLES_REG, cpu.cycles() as u32);
        self.machine.jump(self.stubs.dispatcher);

        loop {
            match self.machine.step(self.tcache.arena().bytes(), cpu)? {
                Step::Continue => {}
                Step::Call(helper) => self.run_helper(helper, cpu, bus)?,
                Step::Exit => break,
            }
        }
        Ok(consumed(budget, cpu.cycles()))
    }

    #[inline]
    fn arg(&self, index: usize) -> u32 {
        self.machine.reg(ARG_REGS[index])
    }

    /// Leave translated code through the exit stub.
    fn leave(&mut self, cpu: &CpuState) {
        self.machine.set_reg(CYCLES_REG, cpu.cycles() as u32);
        self.machine.jump(self.stubs.exit);
    }

    fn run_helper<B: GuestBus + ?Sized>(
        &mut self,
        helper: Helper,
        cpu: &mut CpuState,
        bus: &mut B,
    ) -> Result<(), JitError> {
        match helper {
            Helper::Dispatch => self.dispatch(cpu, bus)?,
            Helper::Read8 => {
                let value = bus.read8(self.arg(0));
                self.machine.set_reg(HostReg::RET, u32::from(value));
            }
            Helper::Read16 => {
                let value = bus.read16(self.arg(0));
                self.machine.set_reg(HostReg::RET, u32::from(value));
            }
            Helper::Read32 => {
                let value = bus.read32(self.arg(0));
                self.machine.set_reg(HostReg::RET, value);
            }
            Helper::Write8 => {
                let (addr, value) = (self.arg(0), self.arg(1));
                bus.write8(addr, value as u8);
                self.on_write(addr);
            }
            Helper::Write16 => {
                let (addr, value) = (self.arg(0), self.arg(1));
                bus.write16(addr, value as u16);
                self.on_write(addr);
            }
            Helper::Write32 => {
                let (addr, value) = (self.arg(0), self.arg(1));
                bus.write32(addr, value);
                self.on_write(addr);
                self.on_write(addr.wrapping_add(2));
            }
            Helper::TestAndSet => {
                let addr = self.arg(0);
                let old = bus.read8(addr);
                bus.write8(addr, old | 0x80);
                self.on_write(addr);
                self.machine.set_reg(HostReg::RET, u32::from(old));
            }
            Helper::InterruptCheck => {
                let outcome = self.check_interrupt(cpu, bus);
                self.machine
                    .set_reg(HostReg::RET, u32::from(outcome.is_some()));
                if outcome == Some(EventOutcome::ExitToInterpreter) {
                    self.leave(cpu);
                }
            }
            Helper::IllegalInstruction => {
                let pc = cpu.pc();
                self.raise(cpu, bus, GuestEvent::IllegalInstruction { pc });
            }
            Helper::SlotIllegalInstruction => {
                let pc = cpu.pc();
                self.raise(cpu, bus, GuestEvent::SlotIllegalInstruction { pc });
            }
            Helper::Trap => {
                let event = GuestEvent::Trap {
                    vector: self.arg(0) as u8,
                    return_pc: cpu.pc(),
                };
                self.raise(cpu, bus, event);
            }
            Helper::Sleep => cpu.set_cycles(cpu.cycles().min(0)),
            Helper::TraceEntry => {
                trace!(pc = format_args!("{:#010x}", self.arg(0)), "block entry");
                self.stats.entries_traced += 1;
            }
        }
        Ok(())
    }

    /// Transfer control to the block at `cpu.pc()`, translating it on a miss.
    fn dispatch<B: GuestBus + ?Sized>(&mut self, cpu: &mut CpuState, bus: &mut B) -> Result<(), JitError> {
        self.machine.reset_stacks();
        let pc = cpu.pc();
        let code = match self.lookup(pc) {
            Some(code) => {
                self.stats.lookups_hit += 1;
                code
            }
            None => {
                self.stats.lookups_missed += 1;
                match self.translate(bus, pc) {
                    Ok(code) => code,
                    Err(JitError::NoCode { pc }) => {
                        debug!(pc = format_args!("{pc:#010x}"), "no code to run; leaving");
                        self.leave(cpu);
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
            }
        };
        trace!(
            pc = format_args!("{pc:#010x}"),
            code = format_args!("{code:#x}"),
            "dispatch"
        );
        self.machine.jump(code);
        Ok(())
    }

    /// Accept a pending interrupt if its level is above the SR mask.
    /// Accept the pending interrupt if SR allows it. `None` when nothing was accepted.
    fn check_interrupt<B: GuestBus + ?Sized>(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut B,
    ) -> Option<EventOutcome> {
        let (level, vector) = bus.pending_interrupt()?;
        if level <= cpu.imask() {
            return None;
        }
        self.stats.interrupts_taken += 1;
        cpu.set_cycles(cpu.cycles().wrapping_sub(INTERRUPT_CYCLES));
        debug!(level, vector, pc = format_args!("{:#010x}", cpu.pc()), "interrupt");
        Some(self.deliver(cpu, bus, GuestEvent::Interrupt { level, vector }))
    }

    fn raise<B: GuestBus + ?Sized>(&mut self, cpu: &mut CpuState, bus: &mut B, event: GuestEvent) {
        if self.deliver(cpu, bus, event) == EventOutcome::ExitToInterpreter {
            self.leave(cpu);
        }
    }

    /// Hand `event` to the bus. The exception frame pushed below the stack pointer is checked
    /// against translated code like any other guest write.
    fn deliver<B: GuestBus + ?Sized>(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut B,
        event: GuestEvent,
    ) -> EventOutcome {
        let old_sp = cpu.get(GuestReg::SP);
        let outcome = bus.deliver_event(cpu, event);
        let new_sp = cpu.get(GuestReg::SP);
        let pushed = old_sp.wrapping_sub(new_sp);
        if pushed > 0 && pushed <= EXCEPTION_FRAME_BYTES {
            let mut addr = new_sp & !1;
            while addr.wrapping_sub(new_sp & !1) < pushed {
                self.on_write(addr);
                addr = addr.wrapping_add(2);
            }
        }
        outcome
    }
}

fn consumed(budget: i32, remaining: i32) -> u32 {
    (i64::from(budget) - i64::from(remaining)).max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumed_counts_overrun() {
        assert_eq!(consumed(100, 40), 60);
        assert_eq!(consumed(100, -3), 103);
        assert_eq!(consumed(100, 120), 0);
    }

    #[test]
    fn init_rejects_invalid_config() {
        let config = JitConfig {
            buffers: Vec::new(),
            ..JitConfig::default()
        };
        assert!(matches!(Jit::init(config), Err(JitError::Config(_))));
    }

    struct IrqBus {
        pending: Option<(u8, u8)>,
    }

    impl GuestBus for IrqBus {
        fn fetch16(&self, _addr: u32) -> Option<u16> {
            None
        }
        fn read8(&mut self, _addr: u32) -> u8 {
            0
        }
        fn read16(&mut self, _addr: u32) -> u16 {
            0
        }
        fn read32(&mut self, _addr: u32) -> u32 {
            0
        }
        fn write8(&mut self, _addr: u32, _value: u8) {}
        fn write16(&mut self, _addr: u32, _value: u16) {}
        fn write32(&mut self, _addr: u32, _value: u32) {}
        fn pending_interrupt(&mut self) -> Option<(u8, u8)> {
            self.pending
        }
    }

    #[test]
    fn interrupt_check_returns_acceptance() {
        let mut jit = Jit::init(JitConfig::default()).unwrap();
        let mut cpu = CpuState::new();
        cpu.set_imask(3);
        let mut bus = IrqBus {
            pending: Some((3, 70)),
        };
        jit.machine.set_reg(HostReg::RET, 0xdead);
        jit.run_helper(Helper::InterruptCheck, &mut cpu, &mut bus).unwrap();
        assert_eq!(jit.machine.reg(HostReg::RET), 0);

        bus.pending = Some((5, 70));
        jit.run_helper(Helper::InterruptCheck, &mut cpu, &mut bus).unwrap();
        assert_eq!(jit.machine.reg(HostReg::RET), 1);
        assert_eq!(jit.stats.interrupts_taken, 1);
        assert_eq!(cpu.imask(), 5);
    }

    #[test]
    fn stubs_sit_before_the_buffers() {
        let jit = Jit::init(JitConfig::default()).unwrap();
        let stubs = jit.stubs();
        let first = jit.tcache().buffer(0).code_range();
        assert!(stubs.exit < first.start);
        assert!(stubs.dispatcher < first.start);
        assert!(stubs.test_irq < first.start);
        assert_eq!(jit.buffer_state(0), BufferState::Empty);
    }
}
