//! Guest register file.
//!
//! Translated code reads and writes guest registers through their canonical slots in
//! [`CpuState`]. Besides the architectural SH-2 registers the file carries one pseudo register,
//! [`GuestReg::CYCLES`], holding the signed remaining cycle budget of the current `execute` call.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use bitflags::bitflags;

/// Index of a guest register in [`CpuState`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestReg(u8);

impl GuestReg {
    pub const R0: GuestReg = GuestReg(0);
    /// Stack pointer (`R15`).
    pub const SP: GuestReg = GuestReg(15);
    pub const PC: GuestReg = GuestReg(16);
    pub const PR: GuestReg = GuestReg(17);
    pub const SR: GuestReg = GuestReg(18);
    pub const GBR: GuestReg = GuestReg(19);
    pub const VBR: GuestReg = GuestReg(20);
    pub const MACH: GuestReg = GuestReg(21);
    pub const MACL: GuestReg = GuestReg(22);
    pub const CYCLES: GuestReg = GuestReg(23);

    pub const COUNT: usize = 24;

    /// General purpose register `Rn`.
    #[inline]
    pub const fn gpr(n: u8) -> GuestReg {
        assert!(n < 16);
        GuestReg(n)
    }

    #[inline]
    pub const fn from_index(index: usize) -> Option<GuestReg> {
        if index < Self::COUNT {
            Some(GuestReg(index as u8))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_gpr(self) -> bool {
        self.0 < 16
    }

    pub fn all() -> impl Iterator<Item = GuestReg> {
        (0..Self::COUNT as u8).map(GuestReg)
    }
}

impl fmt::Debug for GuestReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            r if r.is_gpr() => write!(f, "r{}", r.0),
            GuestReg::PC => f.write_str("pc"),
            GuestReg::PR => f.write_str("pr"),
            GuestReg::SR => f.write_str("sr"),
            GuestReg::GBR => f.write_str("gbr"),
            GuestReg::VBR => f.write_str("vbr"),
            GuestReg::MACH => f.write_str("mach"),
            GuestReg::MACL => f.write_str("macl"),
            GuestReg::CYCLES => f.write_str("cycles"),
            GuestReg(other) => write!(f, "reg{other}"),
        }
    }
}

/// Set of guest registers touched by one instruction.
///
/// Bit `n` stands for the register with index `n`; [`RegMask::T`] tracks the SR.T flag separately
/// from the rest of SR so delay-slot hazards on T can be told apart from full SR writes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegMask(u32);

impl RegMask {
    pub const EMPTY: RegMask = RegMask(0);
    pub const T: RegMask = RegMask(1 << 31);

    #[inline]
    pub const fn of(reg: GuestReg) -> RegMask {
        RegMask(1 << reg.0)
    }

    #[inline]
    pub const fn with(self, reg: GuestReg) -> RegMask {
        RegMask(self.0 | (1 << reg.0))
    }

    #[inline]
    pub const fn contains(self, reg: GuestReg) -> bool {
        self.0 & (1 << reg.0) != 0
    }

    #[inline]
    pub const fn has_t(self) -> bool {
        self.0 & Self::T.0 != 0
    }

    #[inline]
    pub const fn intersects(self, other: RegMask) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn without_t(self) -> RegMask {
        RegMask(self.0 & !Self::T.0)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Registers in the set, excluding the T pseudo bit.
    pub fn regs(self) -> impl Iterator<Item = GuestReg> {
        GuestReg::all().filter(move |r| self.contains(*r))
    }
}

impl BitOr for RegMask {
    type Output = RegMask;

    fn bitor(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for RegMask {
    fn bitor_assign(&mut self, rhs: RegMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RegMask {
    type Output = RegMask;

    fn bitand(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 & rhs.0)
    }
}

impl fmt::Debug for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for reg in self.regs() {
            set.entry(&reg);
        }
        if self.has_t() {
            set.entry(&format_args!("T"));
        }
        set.finish()
    }
}

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sr: u32 {
        const T = 1 << 0;
        const S = 1 << 1;
        const IMASK = 0xf << 4;
        const Q = 1 << 8;
        const M = 1 << 9;
        /// Reserved bit used by translated code to keep a branch condition alive across a delay
        /// slot that overwrites T. Never visible to the guest.
        const T_SAVE = 1 << 11;
    }
}

impl Sr {
    /// Bits the guest can observe through `STC SR` or an exception frame.
    pub const GUEST_MASK: u32 = 0x3f3;
}

/// Canonical guest CPU state shared between the dispatcher, helpers and translated code.
#[derive(Clone, PartialEq, Eq)]
pub struct CpuState {
    regs: [u32; GuestReg::COUNT],
}

impl Default for CpuState {
    fn default() -> Self {
        let mut regs = [0; GuestReg::COUNT];
        // Reset state: all interrupts masked.
        regs[GuestReg::SR.index()] = Sr::IMASK.bits();
        Self { regs }
    }
}

impl CpuState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, reg: GuestReg) -> u32 {
        self.regs[reg.index()]
    }

    #[inline]
    pub fn set(&mut self, reg: GuestReg, value: u32) {
        self.regs[reg.index()] = value;
    }

    #[inline]
    pub fn r(&self, n: u8) -> u32 {
        self.get(GuestReg::gpr(n))
    }

    #[inline]
    pub fn set_r(&mut self, n: u8, value: u32) {
        self.set(GuestReg::gpr(n), value);
    }

    #[inline]
    pub fn pc(&self) -> u32 {
        self.get(GuestReg::PC)
    }

    #[inline]
    pub fn set_pc(&mut self, pc: u32) {
        self.set(GuestReg::PC, pc);
    }

    #[inline]
    pub fn sr(&self) -> Sr {
        Sr::from_bits_retain(self.get(GuestReg::SR))
    }

    #[inline]
    pub fn set_sr(&mut self, sr: Sr) {
        self.set(GuestReg::SR, sr.bits());
    }

    #[inline]
    pub fn t(&self) -> bool {
        self.sr().contains(Sr::T)
    }

    pub fn set_t(&mut self, t: bool) {
        let mut sr = self.sr();
        sr.set(Sr::T, t);
        self.set_sr(sr);
    }

    /// Current interrupt mask level (SR.I3-I0).
    #[inline]
    pub fn imask(&self) -> u8 {
        ((self.get(GuestReg::SR) >> 4) & 0xf) as u8
    }

    pub fn set_imask(&mut self, level: u8) {
        let sr = (self.get(GuestReg::SR) & !Sr::IMASK.bits()) | (u32::from(level & 0xf) << 4);
        self.set(GuestReg::SR, sr);
    }

    /// Remaining cycle budget. Negative once a block overran the budget.
    #[inline]
    pub fn cycles(&self) -> i32 {
        self.get(GuestReg::CYCLES) as i32
    }

    #[inline]
    pub fn set_cycles(&mut self, cycles: i32) {
        self.set(GuestReg::CYCLES, cycles as u32);
    }
}

impl fmt::Debug for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for reg in GuestReg::all() {
            map.entry(&reg, &format_args!("{:#010x}", self.get(reg)));
        }
        map.finish()
    }
}
