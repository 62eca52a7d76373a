//! Block scanner.
//!
//! Turns a linear run of guest opcodes into the annotated instruction list consumed by the
//! translator. Two passes are made over the block:
//!
//! 1. decode, classify and compute register dependencies until the block ends (branch, sleep,
//!    SR write, trap) or a scan limit truncates it. An undefined opcode does not end the block:
//!    it becomes an inline trap and the code after it stays reachable through in-block branches;
//! 2. mark in-block branch targets, propagate statically known T values through the block
//!    (resolving conditional branches whose outcome is already decided), and work out how much
//!    of the trailing literal pool the block covers.

use bitflags::bitflags;

use crate::config::JitConfig;
use crate::decode::{decode, Addr, CarryKind, Insn, MulKind, Size};
use crate::error::TranslateError;
use crate::guest::{GuestReg, RegMask};

/// Instruction class, the single dispatch key of the translator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
    Plain,
    Move,
    /// PC-relative literal load.
    LoadPool,
    Mova,
    /// `CLRT` / `SETT`.
    SetClrT,
    /// Unconditional direct branch (`BRA`, `BSR`, resolved conditionals).
    Branch,
    /// Direct branch taken when T is set.
    BranchCt,
    /// Direct branch taken when T is clear.
    BranchCf,
    /// Register-indirect branch (`JMP`, `JSR`, `RTS`).
    BranchR,
    /// PC-relative register branch (`BRAF`, `BSRF`).
    BranchRf,
    Rte,
    Sleep,
    Trap,
    /// Privileged SR write (`LDC Rm,SR`, `LDC.L @Rm+,SR`); may unmask interrupts.
    SrWrite,
    /// Undefined opcode. Trapped inline; scanning continues past it.
    Illegal,
    /// Branch or undefined opcode placed in a delay slot.
    SlotIllegal,
}

impl OpClass {
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            OpClass::Branch
                | OpClass::BranchCt
                | OpClass::BranchCf
                | OpClass::BranchR
                | OpClass::BranchRf
        )
    }

    pub fn ends_block(self) -> bool {
        self.is_branch()
            || matches!(
                self,
                OpClass::Rte
                    | OpClass::Sleep
                    | OpClass::Trap
                    | OpClass::SrWrite
                    | OpClass::SlotIllegal
            )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u8 {
        /// Executes in the delay slot of the preceding branch.
        const DELAY_SLOT = 1 << 0;
        /// Target of a branch inside the block.
        const BRANCH_TARGET = 1 << 1;
        /// T is known to be set when this instruction starts.
        const T_SET = 1 << 2;
        /// T is known to be clear when this instruction starts.
        const T_CLEAR = 1 << 3;
    }
}

/// One scanned guest instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstrRecord {
    pub pc: u32,
    pub opcode: u16,
    pub insn: Insn,
    pub class: OpClass,
    pub cycles: u8,
    /// Memory operand size in bytes, 0 when the instruction does not access memory.
    pub size: u8,
    pub source: RegMask,
    pub dest: RegMask,
    /// Branch target, literal or MOVA address, trap number or immediate, depending on class.
    pub imm: u32,
    pub flags: OpFlags,
    /// Literal value read at scan time when the literal lies inside the covered range.
    pub inline_value: Option<u32>,
}

impl InstrRecord {
    pub fn next_pc(&self) -> u32 {
        self.pc.wrapping_add(2)
    }

    /// Extra cycles a conditional branch costs when taken.
    pub fn taken_penalty(&self) -> u8 {
        match self.insn {
            Insn::Bt { delayed: true, .. } | Insn::Bf { delayed: true, .. } => 1,
            Insn::Bt { .. } | Insn::Bf { .. } => 2,
            _ => 0,
        }
    }
}

/// Per-block scan limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanLimits {
    pub max_insns: usize,
    pub max_literals: usize,
    pub max_local_branches: usize,
    pub max_literal_offset: u32,
}

impl From<&JitConfig> for ScanLimits {
    fn from(cfg: &JitConfig) -> Self {
        Self {
            max_insns: cfg.max_block_insns,
            max_literals: cfg.max_literals,
            max_local_branches: cfg.max_local_branches,
            max_literal_offset: cfg.max_literal_offset,
        }
    }
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self::from(&JitConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanResult {
    pub base_pc: u32,
    pub ops: Vec<InstrRecord>,
    /// First address past the last scanned instruction.
    pub end_pc: u32,
    /// End of the guest range the block covers, including any trailing literal pool.
    pub end_literals: u32,
    /// Distinct in-block branch targets, ascending.
    pub local_targets: Vec<u32>,
    /// Literal inlining was active for this scan.
    pub literals_inlined: bool,
}

impl ScanResult {
    /// Sum of the recorded per-instruction cycle costs.
    pub fn cycles(&self) -> u32 {
        self.ops.iter().map(|op| u32::from(op.cycles)).sum()
    }
}

fn classify(insn: Insn) -> OpClass {
    match insn {
        Insn::Mov { .. } => OpClass::Move,
        Insn::LoadPool { .. } => OpClass::LoadPool,
        Insn::Mova { .. } => OpClass::Mova,
        Insn::Clrt | Insn::Sett => OpClass::SetClrT,
        Insn::Bra { .. } | Insn::Bsr { .. } => OpClass::Branch,
        Insn::Bt { .. } => OpClass::BranchCt,
        Insn::Bf { .. } => OpClass::BranchCf,
        Insn::Jmp { .. } | Insn::Jsr { .. } | Insn::Rts => OpClass::BranchR,
        Insn::Braf { .. } | Insn::Bsrf { .. } => OpClass::BranchRf,
        Insn::Rte => OpClass::Rte,
        Insn::Sleep => OpClass::Sleep,
        Insn::Trapa { .. } => OpClass::Trap,
        Insn::LoadSys { reg, .. } | Insn::PopSys { reg, .. } if reg == GuestReg::SR => {
            OpClass::SrWrite
        }
        Insn::Illegal => OpClass::Illegal,
        _ => OpClass::Plain,
    }
}

fn r(n: u8) -> RegMask {
    RegMask::of(GuestReg::gpr(n))
}

fn sys(reg: GuestReg) -> RegMask {
    if reg == GuestReg::SR {
        RegMask::of(reg) | RegMask::T
    } else {
        RegMask::of(reg)
    }
}

fn addr_source(addr: Addr) -> RegMask {
    match addr {
        Addr::Indexed(n) => r(n) | r(0),
        other => RegMask::of(other.base()),
    }
}

fn addr_dest(addr: Addr) -> RegMask {
    match addr {
        Addr::PostInc(n) | Addr::PreDec(n) => r(n),
        _ => RegMask::EMPTY,
    }
}

/// Source and destination registers of `insn`.
fn dependencies(insn: Insn) -> (RegMask, RegMask) {
    let t = RegMask::T;
    let none = RegMask::EMPTY;
    let mac = RegMask::of(GuestReg::MACH) | RegMask::of(GuestReg::MACL);
    match insn {
        Insn::Nop | Insn::Bra { .. } | Insn::Sleep | Insn::Illegal => (none, none),
        Insn::MovImm { n, .. } | Insn::LoadPool { n, .. } => (none, r(n)),
        Insn::Mova { .. } => (none, r(0)),
        Insn::Mov { n, m }
        | Insn::Neg { n, m }
        | Insn::Not { n, m }
        | Insn::Ext { n, m, .. }
        | Insn::Swap { n, m, .. } => (r(m), r(n)),
        Insn::Load { addr, n, .. } => (addr_source(addr), r(n) | addr_dest(addr)),
        Insn::Store { addr, m, .. } => (addr_source(addr) | r(m), addr_dest(addr)),
        Insn::Alu { n, m, .. } | Insn::Xtrct { n, m } => (r(n) | r(m), r(n)),
        Insn::AddImm { n, .. } | Insn::ShiftBy { n, .. } => (r(n), r(n)),
        Insn::AluImm { .. } => (r(0), r(0)),
        Insn::TstImm { .. } | Insn::CmpEqImm { .. } => (r(0), t),
        Insn::Cmp { n, m, .. } | Insn::Tst { n, m } => (r(n) | r(m), t),
        Insn::CmpPz { n } | Insn::CmpPl { n } => (r(n), t),
        Insn::Mul { n, m, .. } => (r(n) | r(m), RegMask::of(GuestReg::MACL)),
        Insn::Dmul { n, m, .. } => (r(n) | r(m), mac),
        Insn::Mac { n, m, .. } => (
            r(n) | r(m) | mac | RegMask::of(GuestReg::SR),
            r(n) | r(m) | mac,
        ),
        Insn::Carry {
            kind: CarryKind::Div0s,
            n,
            m,
        } => (r(n) | r(m), sys(GuestReg::SR)),
        Insn::Carry {
            kind: CarryKind::Div1,
            n,
            m,
        } => (r(n) | r(m) | sys(GuestReg::SR), r(n) | sys(GuestReg::SR)),
        Insn::Carry { kind: CarryKind::Negc, n, m } => (r(m) | t, r(n) | t),
        Insn::Carry { n, m, .. } => (r(n) | r(m) | t, r(n) | t),
        Insn::Rotc { n, .. } => (r(n) | t, r(n) | t),
        Insn::Div0u => (none, sys(GuestReg::SR)),
        Insn::Dt { n } | Insn::Shift { n, .. } => (r(n), r(n) | t),
        Insn::Clrt | Insn::Sett => (none, t),
        Insn::Movt { n } => (t, r(n)),
        Insn::Clrmac => (none, RegMask::of(GuestReg::MACH) | RegMask::of(GuestReg::MACL)),
        Insn::LoadSys { reg, m } => (r(m), sys(reg)),
        Insn::StoreSys { reg, n } => (sys(reg), r(n)),
        Insn::PopSys { reg, m } => (r(m), sys(reg) | r(m)),
        Insn::PushSys { reg, n } => (sys(reg) | r(n), r(n)),
        Insn::TasB { n } => (r(n), t),
        Insn::Bsr { .. } => (none, RegMask::of(GuestReg::PR)),
        Insn::Bt { .. } | Insn::Bf { .. } => (t, none),
        Insn::Braf { m } | Insn::Jmp { m } => (r(m), none),
        Insn::Bsrf { m } | Insn::Jsr { m } => (r(m), RegMask::of(GuestReg::PR)),
        Insn::Rts => (RegMask::of(GuestReg::PR), none),
        Insn::Rte => (
            RegMask::of(GuestReg::SP),
            RegMask::of(GuestReg::SP) | sys(GuestReg::SR),
        ),
        Insn::Trapa { .. } => (
            RegMask::of(GuestReg::SP) | sys(GuestReg::SR) | RegMask::of(GuestReg::VBR),
            RegMask::of(GuestReg::SP),
        ),
    }
}

fn cycles(insn: Insn) -> u8 {
    match insn {
        Insn::Bra { .. }
        | Insn::Bsr { .. }
        | Insn::Braf { .. }
        | Insn::Bsrf { .. }
        | Insn::Jmp { .. }
        | Insn::Jsr { .. }
        | Insn::Rts => 2,
        Insn::Mul {
            kind: MulKind::Long,
            ..
        }
        | Insn::Dmul { .. } => 2,
        Insn::Mac { .. } => 3,
        Insn::PushSys { reg, .. } if !matches!(reg, GuestReg::MACH | GuestReg::MACL | GuestReg::PR) => 2,
        Insn::PopSys { reg, .. } if !matches!(reg, GuestReg::MACH | GuestReg::MACL | GuestReg::PR) => 3,
        Insn::Sleep => 3,
        Insn::Rte | Insn::TasB { .. } => 4,
        Insn::Trapa { .. } => 8,
        _ => 1,
    }
}

fn record(pc: u32, opcode: u16, insn: Insn) -> InstrRecord {
    let (source, dest) = dependencies(insn);
    let (size, imm) = match insn {
        Insn::LoadPool { size, addr, .. } => (size.bytes(), addr),
        Insn::Load { size, .. } | Insn::Store { size, .. } => (size.bytes(), 0),
        Insn::PushSys { .. } | Insn::PopSys { .. } => (4, 0),
        Insn::TasB { .. } => (1, 0),
        Insn::Mac { size, .. } => (size.bytes(), 0),
        Insn::Mova { addr } => (0, addr),
        Insn::Bra { target }
        | Insn::Bsr { target }
        | Insn::Bt { target, .. }
        | Insn::Bf { target, .. } => (0, target),
        Insn::Trapa { imm } => (0, u32::from(imm)),
        Insn::MovImm { imm, .. } | Insn::AddImm { imm, .. } | Insn::CmpEqImm { imm } => {
            (0, imm as i32 as u32)
        }
        Insn::AluImm { imm, .. } | Insn::TstImm { imm } => (0, u32::from(imm)),
        _ => (0, 0),
    };
    InstrRecord {
        pc,
        opcode,
        insn,
        class: classify(insn),
        cycles: cycles(insn),
        size: size as u8,
        source,
        dest,
        imm,
        flags: OpFlags::empty(),
        inline_value: None,
    }
}

/// Direct branch target that may resolve inside the block scanned so far.
fn local_candidate(insn: Insn) -> Option<u32> {
    match insn {
        Insn::Bra { target }
        | Insn::Bsr { target }
        | Insn::Bt { target, .. }
        | Insn::Bf { target, .. } => Some(target),
        _ => None,
    }
}

/// Scan the block starting at `base_pc`.
///
/// `fetch` returns the instruction halfword at an address or `None` for unmapped memory. Fails
/// only when nothing can be fetched at `base_pc` itself.
pub fn scan_block<F>(
    fetch: F,
    base_pc: u32,
    limits: &ScanLimits,
    literals_enabled: bool,
) -> Result<ScanResult, TranslateError>
where
    F: Fn(u32) -> Option<u16>,
{
    if base_pc & 1 != 0 {
        return Err(TranslateError::InvalidPc { pc: base_pc });
    }

    let mut ops: Vec<InstrRecord> = Vec::new();
    let mut literals: Vec<(u32, u32)> = Vec::new();
    let mut local_targets: Vec<u32> = Vec::new();
    let mut insns = 0usize;
    let mut pc = base_pc;

    loop {
        let in_slot = ops
            .last()
            .is_some_and(|prev| prev.insn.has_delay_slot() && !prev.flags.contains(OpFlags::DELAY_SLOT));

        if !in_slot && insns >= limits.max_insns {
            break;
        }

        let Some(opcode) = fetch(pc) else {
            if ops.is_empty() {
                return Err(TranslateError::InvalidPc { pc });
            }
            if in_slot {
                // The delay slot is unreachable; leave the branch to the next block.
                ops.pop();
                pc = pc.wrapping_sub(2);
            }
            break;
        };

        let mut rec = record(pc, opcode, decode(pc, opcode));

        if in_slot {
            rec.flags |= OpFlags::DELAY_SLOT;
            if rec.insn.is_branch() || rec.insn == Insn::Illegal {
                rec.class = OpClass::SlotIllegal;
                rec.imm = pc.wrapping_sub(2);
            }
        }

        if let Insn::LoadPool { addr, size, .. } = rec.insn {
            if literals.len() >= limits.max_literals {
                if in_slot {
                    ops.pop();
                    pc = pc.wrapping_sub(2);
                }
                break;
            }
            literals.push((addr, size.bytes()));
        }

        if rec.class != OpClass::SlotIllegal {
            if let Some(target) = local_candidate(rec.insn) {
                let is_local = target >= base_pc
                    && target <= pc
                    && target & 1 == 0
                    && ops
                        .get(((target - base_pc) / 2) as usize)
                        .map_or(true, |op| !op.flags.contains(OpFlags::DELAY_SLOT));
                if is_local && !local_targets.contains(&target) {
                    if local_targets.len() >= limits.max_local_branches {
                        break;
                    }
                    local_targets.push(target);
                }
            }
        }

        let ends = rec.class.ends_block();
        let delayed = rec.insn.has_delay_slot() && !in_slot;
        ops.push(rec);
        pc = pc.wrapping_add(2);
        if !in_slot {
            insns += 1;
        }

        if in_slot || (ends && !delayed) {
            break;
        }
    }

    let end_pc = pc;
    local_targets.sort_unstable();

    // Branch targets and T propagation.
    let mut t: Option<bool> = None;
    for rec in ops.iter_mut() {
        if local_targets.binary_search(&rec.pc).is_ok() {
            rec.flags |= OpFlags::BRANCH_TARGET;
            t = None;
        }
        match t {
            Some(true) => rec.flags |= OpFlags::T_SET,
            Some(false) => rec.flags |= OpFlags::T_CLEAR,
            None => {}
        }

        if let (Some(t), OpClass::BranchCt | OpClass::BranchCf) = (t, rec.class) {
            let taken = (rec.class == OpClass::BranchCt) == t;
            if taken {
                let penalty = rec.taken_penalty();
                rec.cycles += penalty;
                rec.class = OpClass::Branch;
            } else {
                rec.class = OpClass::Plain;
            }
            rec.source = rec.source.without_t();
        }

        t = match rec.insn {
            Insn::Clrt => Some(false),
            Insn::Sett => Some(true),
            _ if rec.dest.has_t() => None,
            _ => t,
        };
    }

    // Literal pool coverage.
    let mut literals_inlined = literals_enabled;
    let mut end_literals = end_pc;
    if literals_inlined {
        let limit = end_pc.saturating_add(limits.max_literal_offset);
        for &(addr, len) in &literals {
            let end = addr.wrapping_add(len);
            if addr >= base_pc && end <= limit && end > end_literals {
                end_literals = end;
            }
        }
        // A MOVA into the pool means it is addressed as data.
        let mova_into_pool = ops.iter().any(|rec| {
            rec.class == OpClass::Mova && rec.imm >= end_pc && rec.imm < end_literals
        });
        if mova_into_pool {
            end_literals = end_pc;
            literals_inlined = false;
        }
    }

    if literals_inlined {
        for rec in ops.iter_mut() {
            if let Insn::LoadPool { addr, size, .. } = rec.insn {
                let end = addr.wrapping_add(size.bytes());
                if addr >= base_pc && end <= end_literals {
                    rec.inline_value = read_literal(&fetch, addr, size);
                }
            }
        }
    }

    Ok(ScanResult {
        base_pc,
        ops,
        end_pc,
        end_literals,
        local_targets,
        literals_inlined,
    })
}

fn read_literal<F>(fetch: &F, addr: u32, size: Size) -> Option<u32>
where
    F: Fn(u32) -> Option<u16>,
{
    match size {
        Size::Word => fetch(addr).map(|v| v as i16 as i32 as u32),
        Size::Long => {
            let hi = fetch(addr)?;
            let lo = fetch(addr.wrapping_add(2))?;
            Some((u32::from(hi) << 16) | u32::from(lo))
        }
        Size::Byte => None,
    }
}
