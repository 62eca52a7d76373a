#![allow(dead_code)]

use std::ops::Range;

use sh2_drc::bus::{enter_exception, vector};
use sh2_drc::{CpuState, EventOutcome, GuestBus, GuestEvent};

pub const SDRAM_BASE: u32 = 0x0600_0000;
pub const SDRAM_SIZE: usize = 0x4_0000;

/// Log through the test harness. `RUST_LOG=sh2_drc=debug` shows translation activity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Write {
    pub addr: u32,
    pub value: u32,
    pub size: u8,
}

/// Flat big-endian SDRAM with explicitly loaded code ranges. Fetches outside loaded code return
/// `None`, which ends scanning and makes the dispatcher return to the caller.
pub struct TestBus {
    pub sdram: Vec<u8>,
    code: Vec<Range<u32>>,
    pub writes: Vec<Write>,
    pub events: Vec<GuestEvent>,
    /// Pending interrupt as `(level, vector)`; cleared once accepted.
    pub irq: Option<(u8, u8)>,
    pub exit_on_event: bool,
}

impl Default for TestBus {
    fn default() -> Self {
        Self {
            sdram: vec![0; SDRAM_SIZE],
            code: Vec::new(),
            writes: Vec::new(),
            events: Vec::new(),
            irq: None,
            exit_on_event: false,
        }
    }
}

fn sdram_offset(addr: u32) -> Option<usize> {
    (addr & 0xc600_0000 == SDRAM_BASE).then_some((addr & 0x3_ffff) as usize)
}

impl TestBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `code` at `addr` and make it fetchable.
    pub fn load(&mut self, addr: u32, code: &[u16]) {
        for (i, op) in code.iter().enumerate() {
            self.poke16(addr + 2 * i as u32, *op);
        }
        let start = addr & 0x3_ffff;
        self.code.push(start..start + 2 * code.len() as u32);
    }

    /// Store data without marking it fetchable.
    pub fn poke16(&mut self, addr: u32, value: u16) {
        let at = sdram_offset(addr).expect("poke outside sdram");
        self.sdram[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn poke32(&mut self, addr: u32, value: u32) {
        let at = sdram_offset(addr).expect("poke outside sdram");
        self.sdram[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn peek32(&self, addr: u32) -> u32 {
        let at = sdram_offset(addr).expect("peek outside sdram");
        u32::from_be_bytes(self.sdram[at..at + 4].try_into().unwrap())
    }

    fn bytes(&self, addr: u32, len: usize) -> Option<&[u8]> {
        let at = sdram_offset(addr)?;
        self.sdram.get(at..at + len)
    }

    fn store(&mut self, addr: u32, value: u32, size: u8) {
        self.writes.push(Write { addr, value, size });
        let Some(at) = sdram_offset(addr) else {
            return;
        };
        let bytes = value.to_be_bytes();
        let len = usize::from(size);
        if let Some(dst) = self.sdram.get_mut(at..at + len) {
            dst.copy_from_slice(&bytes[4 - len..]);
        }
    }
}

impl GuestBus for TestBus {
    fn fetch16(&self, addr: u32) -> Option<u16> {
        let offset = sdram_offset(addr)? as u32;
        if !self.code.iter().any(|r| r.contains(&offset)) {
            return None;
        }
        let b = self.bytes(addr, 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read8(&mut self, addr: u32) -> u8 {
        self.bytes(addr, 1).map_or(0, |b| b[0])
    }

    fn read16(&mut self, addr: u32) -> u16 {
        self.bytes(addr, 2)
            .map_or(0, |b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn read32(&mut self, addr: u32) -> u32 {
        self.bytes(addr, 4)
            .map_or(0, |b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write8(&mut self, addr: u32, value: u8) {
        self.store(addr, u32::from(value), 1);
    }

    fn write16(&mut self, addr: u32, value: u16) {
        self.store(addr, u32::from(value), 2);
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.store(addr, value, 4);
    }

    fn pending_interrupt(&mut self) -> Option<(u8, u8)> {
        self.irq
    }

    fn deliver_event(&mut self, cpu: &mut CpuState, event: GuestEvent) -> EventOutcome {
        self.events.push(event);
        if self.exit_on_event {
            return EventOutcome::ExitToInterpreter;
        }
        match event {
            GuestEvent::IllegalInstruction { pc } => {
                enter_exception(self, cpu, vector::GENERAL_ILLEGAL, pc)
            }
            GuestEvent::SlotIllegalInstruction { pc } => {
                enter_exception(self, cpu, vector::SLOT_ILLEGAL, pc)
            }
            GuestEvent::Trap { vector, return_pc } => {
                enter_exception(self, cpu, u32::from(vector), return_pc)
            }
            GuestEvent::Interrupt { level, vector } => {
                let pc = cpu.pc();
                enter_exception(self, cpu, u32::from(vector), pc);
                cpu.set_imask(level);
                self.irq = None;
            }
        }
        EventOutcome::Handled
    }
}

/// Guest CPU at `pc` with interrupts unmasked and a stack at the top of SDRAM.
pub fn cpu_at(pc: u32) -> CpuState {
    let mut cpu = CpuState::new();
    cpu.set_pc(pc);
    cpu.set_imask(0);
    cpu.set_r(15, SDRAM_BASE + SDRAM_SIZE as u32 - 0x100);
    cpu
}

/// SH-2 opcodes used by the tests.
pub mod op {
    pub const NOP: u16 = 0x0009;
    pub const RTS: u16 = 0x000b;
    pub const SLEEP: u16 = 0x001b;
    pub const RTE: u16 = 0x002b;
    pub const CLRT: u16 = 0x0008;
    pub const SETT: u16 = 0x0018;
    pub const CLRMAC: u16 = 0x0028;
    pub const DIV0U: u16 = 0x0019;

    pub const fn mov_imm(n: u16, imm: i8) -> u16 {
        0xe000 | n << 8 | (imm as u8) as u16
    }
    pub const fn add_imm(n: u16, imm: i8) -> u16 {
        0x7000 | n << 8 | (imm as u8) as u16
    }
    pub const fn add(n: u16, m: u16) -> u16 {
        0x300c | n << 8 | m << 4
    }
    pub const fn mov(n: u16, m: u16) -> u16 {
        0x6003 | n << 8 | m << 4
    }
    /// `mov.l Rm,@Rn`
    pub const fn store_l(n: u16, m: u16) -> u16 {
        0x2002 | n << 8 | m << 4
    }
    /// `mov.l @Rm,Rn`
    pub const fn load_l(n: u16, m: u16) -> u16 {
        0x6002 | n << 8 | m << 4
    }
    /// `mov.l @(disp*4,PC),Rn`
    pub const fn load_pool_l(n: u16, disp: u8) -> u16 {
        0xd000 | n << 8 | disp as u16
    }
    /// `cmp/eq #imm,R0`
    pub const fn cmp_eq_imm(imm: i8) -> u16 {
        0x8800 | (imm as u8) as u16
    }
    pub const fn dt(n: u16) -> u16 {
        0x4010 | n << 8
    }
    pub const fn tst(n: u16, m: u16) -> u16 {
        0x2008 | n << 8 | m << 4
    }
    pub const fn ldc_sr(m: u16) -> u16 {
        0x400e | m << 8
    }
    pub const fn jmp(m: u16) -> u16 {
        0x402b | m << 8
    }
    pub const fn jsr(m: u16) -> u16 {
        0x400b | m << 8
    }
    pub const fn sts_mach(n: u16) -> u16 {
        0x000a | n << 8
    }
    pub const fn sts_macl(n: u16) -> u16 {
        0x001a | n << 8
    }
    pub const fn sts_pr(n: u16) -> u16 {
        0x002a | n << 8
    }
    /// `mac.l @Rm+,@Rn+`
    pub const fn mac_l(n: u16, m: u16) -> u16 {
        0x000f | n << 8 | m << 4
    }
    /// `tas.b @Rn`
    pub const fn tas_b(n: u16) -> u16 {
        0x401b | n << 8
    }
    pub const fn movt(n: u16) -> u16 {
        0x0029 | n << 8
    }
    pub const fn trapa(imm: u8) -> u16 {
        0xc300 | imm as u16
    }

    /// Displacement field of a branch at `pc` targeting `target`.
    const fn disp(pc: u32, target: u32) -> i32 {
        (target.wrapping_sub(pc.wrapping_add(4)) as i32) / 2
    }
    pub const fn bt(pc: u32, target: u32) -> u16 {
        0x8900 | (disp(pc, target) as u8) as u16
    }
    pub const fn bf(pc: u32, target: u32) -> u16 {
        0x8b00 | (disp(pc, target) as u8) as u16
    }
    pub const fn bt_s(pc: u32, target: u32) -> u16 {
        0x8d00 | (disp(pc, target) as u8) as u16
    }
    pub const fn bra(pc: u32, target: u32) -> u16 {
        0xa000 | (disp(pc, target) as u16 & 0xfff)
    }
    pub const fn bsr(pc: u32, target: u32) -> u16 {
        0xb000 | (disp(pc, target) as u16 & 0xfff)
    }
}
