//! Portable host instruction set.
//!
//! Translated blocks are stored in the code arena as a compact byte encoding of [`HostOp`] and
//! run by [`machine::HostMachine`]. The encoding has the properties the recompiler relies on from
//! a native backend:
//!
//! - jumps carry an absolute 32-bit target at a fixed offset, so they can be patched in place
//!   once the target block exists;
//! - every instruction has a fixed length per opcode, so an entry prologue can be overwritten
//!   with a shorter stub without disturbing the bytes after it;
//! - only [`HostOp::Cmp`], [`HostOp::CmpImm`], [`HostOp::Tst`] and [`HostOp::TstImm`] update the
//!   flags. Register moves, context loads and stores, and ALU operations leave them intact, which
//!   lets the register cache spill between a compare and the branch consuming it.

pub mod machine;

use std::fmt;

use crate::error::HostDecodeError;
use crate::guest::{GuestReg, Sr};
use crate::tcache::CodeAddr;

/// One of the eight host registers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostReg(u8);

impl HostReg {
    pub const COUNT: usize = 8;

    /// Helper return value.
    pub const RET: HostReg = HostReg(0);

    #[inline]
    pub const fn new(index: u8) -> HostReg {
        assert!((index as usize) < Self::COUNT);
        HostReg(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for HostReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Bit set of host registers, used by [`HostOp::Push`] and [`HostOp::Pop`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostRegSet(pub u8);

impl HostRegSet {
    pub fn of(regs: &[HostReg]) -> HostRegSet {
        HostRegSet(regs.iter().fold(0, |acc, r| acc | (1 << r.0)))
    }

    pub fn iter(self) -> impl DoubleEndedIterator<Item = HostReg> {
        (0..HostReg::COUNT as u8)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(HostReg)
    }
}

/// Branch condition evaluated against the flags of the last compare or test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne,
    /// Signed less-than.
    Lt,
    Ge,
    Gt,
    Le,
    /// Unsigned below.
    Ltu,
    Geu,
    Gtu,
    Leu,
}

impl Cond {
    const ALL: [Cond; 10] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Lt,
        Cond::Ge,
        Cond::Gt,
        Cond::Le,
        Cond::Ltu,
        Cond::Geu,
        Cond::Gtu,
        Cond::Leu,
    ];

    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Ltu => Cond::Geu,
            Cond::Geu => Cond::Ltu,
            Cond::Gtu => Cond::Leu,
            Cond::Leu => Cond::Gtu,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Mul,
}

impl AluOp {
    const ALL: [AluOp; 11] = [
        AluOp::Add,
        AluOp::Sub,
        AluOp::And,
        AluOp::Or,
        AluOp::Xor,
        AluOp::Shl,
        AluOp::Shr,
        AluOp::Sar,
        AluOp::Rol,
        AluOp::Ror,
        AluOp::Mul,
    ];

    pub fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Shl => a.wrapping_shl(b),
            AluOp::Shr => a.wrapping_shr(b),
            AluOp::Sar => (a as i32).wrapping_shr(b) as u32,
            AluOp::Rol => a.rotate_left(b),
            AluOp::Ror => a.rotate_right(b),
            AluOp::Mul => a.wrapping_mul(b),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UnaryOp {
    Neg = 0,
    Not,
    ExtU8,
    ExtU16,
    ExtS8,
    ExtS16,
    /// Swap the two low bytes, keep the high half.
    SwapBytes,
    /// Swap the two halves.
    SwapWords,
}

impl UnaryOp {
    const ALL: [UnaryOp; 8] = [
        UnaryOp::Neg,
        UnaryOp::Not,
        UnaryOp::ExtU8,
        UnaryOp::ExtU16,
        UnaryOp::ExtS8,
        UnaryOp::ExtS16,
        UnaryOp::SwapBytes,
        UnaryOp::SwapWords,
    ];

    pub fn apply(self, v: u32) -> u32 {
        match self {
            UnaryOp::Neg => v.wrapping_neg(),
            UnaryOp::Not => !v,
            UnaryOp::ExtU8 => v & 0xff,
            UnaryOp::ExtU16 => v & 0xffff,
            UnaryOp::ExtS8 => v as u8 as i8 as i32 as u32,
            UnaryOp::ExtS16 => v as u16 as i16 as i32 as u32,
            UnaryOp::SwapBytes => (v & 0xffff_0000) | ((v & 0xff) << 8) | ((v >> 8) & 0xff),
            UnaryOp::SwapWords => v.rotate_left(16),
        }
    }
}

/// Arithmetic that consumes and produces SR bits. `dst` is the first operand and the result,
/// `src` the second; the SR operand supplies T (and Q, M for division) and receives the new bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CarryOp {
    /// `dst + src + T`, carry to T.
    Addc = 0,
    /// `dst - src - T`, borrow to T.
    Subc,
    /// Signed overflow to T.
    Addv,
    Subv,
    /// `0 - src - T`, borrow to T.
    Negc,
    Rotcl,
    Rotcr,
    /// Set Q and M from the sign bits of `dst` and `src`, T to `Q ^ M`. `dst` is unchanged.
    Div0s,
    /// One non-restoring division step.
    Div1,
}

impl CarryOp {
    const ALL: [CarryOp; 9] = [
        CarryOp::Addc,
        CarryOp::Subc,
        CarryOp::Addv,
        CarryOp::Subv,
        CarryOp::Negc,
        CarryOp::Rotcl,
        CarryOp::Rotcr,
        CarryOp::Div0s,
        CarryOp::Div1,
    ];

    /// Returns the new `dst` and the new SR.
    pub fn apply(self, a: u32, b: u32, sr: u32) -> (u32, u32) {
        let t = sr & Sr::T.bits();
        let with_t = |value: u32, bit: bool| (value, (sr & !Sr::T.bits()) | u32::from(bit));
        match self {
            CarryOp::Addc => {
                let (sum, c1) = a.overflowing_add(b);
                let (sum, c2) = sum.overflowing_add(t);
                with_t(sum, c1 || c2)
            }
            CarryOp::Subc => {
                let (diff, b1) = a.overflowing_sub(b);
                let (diff, b2) = diff.overflowing_sub(t);
                with_t(diff, b1 || b2)
            }
            CarryOp::Addv => {
                let (sum, overflow) = (a as i32).overflowing_add(b as i32);
                with_t(sum as u32, overflow)
            }
            CarryOp::Subv => {
                let (diff, overflow) = (a as i32).overflowing_sub(b as i32);
                with_t(diff as u32, overflow)
            }
            CarryOp::Negc => with_t(b.wrapping_neg().wrapping_sub(t), b != 0 || t != 0),
            CarryOp::Rotcl => with_t((a << 1) | t, a >> 31 != 0),
            CarryOp::Rotcr => with_t((a >> 1) | (t << 31), a & 1 != 0),
            CarryOp::Div0s => {
                let q = a >> 31 != 0;
                let m = b >> 31 != 0;
                let mut bits = Sr::from_bits_retain(sr);
                bits.set(Sr::Q, q);
                bits.set(Sr::M, m);
                bits.set(Sr::T, q != m);
                (a, bits.bits())
            }
            CarryOp::Div1 => {
                let mut bits = Sr::from_bits_retain(sr);
                let old_q = bits.contains(Sr::Q);
                let m = bits.contains(Sr::M);
                let q1 = a >> 31 != 0;
                let shifted = (a << 1) | t;
                let (value, carry) = if old_q == m {
                    shifted.overflowing_sub(b)
                } else {
                    shifted.overflowing_add(b)
                };
                let q = q1 ^ carry ^ m;
                bits.set(Sr::Q, q);
                bits.set(Sr::T, q == m);
                (value, bits.bits())
            }
        }
    }
}

/// `MAC.L` / `MAC.W` accumulation into `(mach, macl)`. With SR.S set the long form saturates to
/// 48 bits (kept sign-extended in MACH) and the word form saturates MACL to 32 bits, leaving MACH
/// alone.
pub fn multiply_accumulate(
    word: bool,
    mach: u32,
    macl: u32,
    a: u32,
    b: u32,
    sr: u32,
) -> (u32, u32) {
    let saturate = sr & Sr::S.bits() != 0;
    if word {
        let product = i32::from(a as u16 as i16) * i32::from(b as u16 as i16);
        if saturate {
            let sum = (macl as i32).saturating_add(product);
            return (mach, sum as u32);
        }
        let acc = ((u64::from(mach) << 32) | u64::from(macl)) as i64;
        let sum = acc.wrapping_add(i64::from(product)) as u64;
        return ((sum >> 32) as u32, sum as u32);
    }

    let product = i64::from(a as i32) * i64::from(b as i32);
    let acc = ((u64::from(mach) << 32) | u64::from(macl)) as i64;
    let sum: i64 = if saturate {
        const MAX48: i64 = (1 << 47) - 1;
        // Only the low 48 bits of the accumulator take part.
        let acc48 = (acc << 16) >> 16;
        (acc48 + product).clamp(-MAX48 - 1, MAX48)
    } else {
        acc.wrapping_add(product)
    };
    ((sum as u64 >> 32) as u32, sum as u32)
}

/// Runtime services reachable from translated code through [`HostOp::CallHelper`].
///
/// Helpers take their arguments in `h0..h3`, may clobber all four, and return a value in `h0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Helper {
    /// Look up (or translate) the block at guest PC and jump to it.
    Dispatch = 0,
    Read8,
    Read16,
    Read32,
    Write8,
    Write16,
    Write32,
    /// `TAS.B`: returns the old byte, stores it with bit 7 set.
    TestAndSet,
    /// Returns 1 in `h0` when an interrupt was accepted, 0 otherwise.
    InterruptCheck,
    IllegalInstruction,
    SlotIllegalInstruction,
    /// Vector number in `h0`; return PC in guest PC.
    Trap,
    Sleep,
    /// Guest PC of the entry in `h0`.
    TraceEntry,
}

impl Helper {
    const ALL: [Helper; 14] = [
        Helper::Dispatch,
        Helper::Read8,
        Helper::Read16,
        Helper::Read32,
        Helper::Write8,
        Helper::Write16,
        Helper::Write32,
        Helper::TestAndSet,
        Helper::InterruptCheck,
        Helper::IllegalInstruction,
        Helper::SlotIllegalInstruction,
        Helper::Trap,
        Helper::Sleep,
        Helper::TraceEntry,
    ];
}

/// A single host operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostOp {
    MovImm { dst: HostReg, imm: u32 },
    Mov { dst: HostReg, src: HostReg },
    Alu { op: AluOp, dst: HostReg, src: HostReg },
    AluImm { op: AluOp, dst: HostReg, imm: u32 },
    /// `dst = dst op imm` when `cond` holds.
    AluImmCond { cond: Cond, op: AluOp, dst: HostReg, imm: u32 },
    Unary { op: UnaryOp, dst: HostReg, src: HostReg },
    Cmp { a: HostReg, b: HostReg },
    CmpImm { a: HostReg, imm: u32 },
    /// Sets `Eq` when `a & b == 0`.
    Tst { a: HostReg, b: HostReg },
    TstImm { a: HostReg, imm: u32 },
    /// Copy `cond` into bit 0 (SR.T) of `sr`.
    SetT { sr: HostReg, cond: Cond },
    LoadCtx { dst: HostReg, reg: GuestReg },
    StoreCtx { reg: GuestReg, src: HostReg },
    StoreCtxImm { reg: GuestReg, imm: u32 },
    Jump { target: CodeAddr },
    JumpCond { cond: Cond, target: CodeAddr },
    CallHelper { helper: Helper },
    /// Call a subroutine in the code arena.
    CallCode { target: CodeAddr },
    Ret,
    Push { regs: HostRegSet },
    Pop { regs: HostRegSet },
    /// `(dst, sr) = op(dst, src, sr)`.
    Carry { op: CarryOp, dst: HostReg, src: HostReg, sr: HostReg },
    /// 64-bit product of `a` and `b` into `hi:lo`.
    MulWide { signed: bool, lo: HostReg, hi: HostReg, a: HostReg, b: HostReg },
    /// See [`multiply_accumulate`]. `sr` is only read.
    MulAcc { word: bool, lo: HostReg, hi: HostReg, a: HostReg, b: HostReg, sr: HostReg },
    /// Leave translated code and return to `execute`.
    Exit,
}

mod opcode {
    pub const MOV_IMM: u8 = 0x01;
    pub const MOV: u8 = 0x02;
    pub const ALU: u8 = 0x03;
    pub const ALU_IMM: u8 = 0x04;
    pub const ALU_IMM_COND: u8 = 0x05;
    pub const UNARY: u8 = 0x06;
    pub const CMP: u8 = 0x07;
    pub const CMP_IMM: u8 = 0x08;
    pub const TST: u8 = 0x09;
    pub const TST_IMM: u8 = 0x0a;
    pub const SET_T: u8 = 0x0b;
    pub const LOAD_CTX: u8 = 0x0c;
    pub const STORE_CTX: u8 = 0x0d;
    pub const STORE_CTX_IMM: u8 = 0x0e;
    pub const JUMP: u8 = 0x0f;
    pub const JUMP_COND: u8 = 0x10;
    pub const CALL_HELPER: u8 = 0x11;
    pub const CALL_CODE: u8 = 0x12;
    pub const RET: u8 = 0x13;
    pub const PUSH: u8 = 0x14;
    pub const POP: u8 = 0x15;
    pub const EXIT: u8 = 0x16;
    pub const CARRY: u8 = 0x17;
    pub const MUL_WIDE: u8 = 0x18;
    pub const MUL_ACC: u8 = 0x19;
}

/// Encoded length of every host instruction, indexed by opcode.
const fn encoded_len(op: u8) -> usize {
    match op {
        opcode::MOV_IMM => 6,
        opcode::MOV => 3,
        opcode::ALU => 4,
        opcode::ALU_IMM => 7,
        opcode::ALU_IMM_COND => 8,
        opcode::UNARY => 4,
        opcode::CMP => 3,
        opcode::CMP_IMM => 6,
        opcode::TST => 3,
        opcode::TST_IMM => 6,
        opcode::SET_T => 3,
        opcode::LOAD_CTX => 3,
        opcode::STORE_CTX => 3,
        opcode::STORE_CTX_IMM => 6,
        opcode::JUMP => 5,
        opcode::JUMP_COND => 6,
        opcode::CALL_HELPER => 2,
        opcode::CALL_CODE => 5,
        opcode::RET => 1,
        opcode::PUSH => 2,
        opcode::POP => 2,
        opcode::EXIT => 1,
        opcode::CARRY => 5,
        opcode::MUL_WIDE => 6,
        opcode::MUL_ACC => 7,
        _ => 0,
    }
}

/// Longest encoded host instruction.
pub const MAX_OP_LEN: usize = 8;

pub const JUMP_LEN: usize = encoded_len(opcode::JUMP);
pub const STORE_CTX_IMM_LEN: usize = encoded_len(opcode::STORE_CTX_IMM);
pub const CMP_IMM_LEN: usize = encoded_len(opcode::CMP_IMM);
pub const JUMP_COND_LEN: usize = encoded_len(opcode::JUMP_COND);

impl HostOp {
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.opcode())
    }

    fn opcode(&self) -> u8 {
        match self {
            HostOp::MovImm { .. } => opcode::MOV_IMM,
            HostOp::Mov { .. } => opcode::MOV,
            HostOp::Alu { .. } => opcode::ALU,
            HostOp::AluImm { .. } => opcode::ALU_IMM,
            HostOp::AluImmCond { .. } => opcode::ALU_IMM_COND,
            HostOp::Unary { .. } => opcode::UNARY,
            HostOp::Cmp { .. } => opcode::CMP,
            HostOp::CmpImm { .. } => opcode::CMP_IMM,
            HostOp::Tst { .. } => opcode::TST,
            HostOp::TstImm { .. } => opcode::TST_IMM,
            HostOp::SetT { .. } => opcode::SET_T,
            HostOp::LoadCtx { .. } => opcode::LOAD_CTX,
            HostOp::StoreCtx { .. } => opcode::STORE_CTX,
            HostOp::StoreCtxImm { .. } => opcode::STORE_CTX_IMM,
            HostOp::Jump { .. } => opcode::JUMP,
            HostOp::JumpCond { .. } => opcode::JUMP_COND,
            HostOp::CallHelper { .. } => opcode::CALL_HELPER,
            HostOp::CallCode { .. } => opcode::CALL_CODE,
            HostOp::Ret => opcode::RET,
            HostOp::Push { .. } => opcode::PUSH,
            HostOp::Pop { .. } => opcode::POP,
            HostOp::Carry { .. } => opcode::CARRY,
            HostOp::MulWide { .. } => opcode::MUL_WIDE,
            HostOp::MulAcc { .. } => opcode::MUL_ACC,
            HostOp::Exit => opcode::EXIT,
        }
    }

    /// Append the encoding of `self` to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.push(self.opcode());
        match *self {
            HostOp::MovImm { dst, imm } => {
                out.push(dst.0);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            HostOp::Mov { dst, src } => out.extend_from_slice(&[dst.0, src.0]),
            HostOp::Alu { op, dst, src } => out.extend_from_slice(&[op as u8, dst.0, src.0]),
            HostOp::AluImm { op, dst, imm } => {
                out.extend_from_slice(&[op as u8, dst.0]);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            HostOp::AluImmCond { cond, op, dst, imm } => {
                out.extend_from_slice(&[cond as u8, op as u8, dst.0]);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            HostOp::Unary { op, dst, src } => out.extend_from_slice(&[op as u8, dst.0, src.0]),
            HostOp::Cmp { a, b } | HostOp::Tst { a, b } => out.extend_from_slice(&[a.0, b.0]),
            HostOp::CmpImm { a, imm } | HostOp::TstImm { a, imm } => {
                out.push(a.0);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            HostOp::SetT { sr, cond } => out.extend_from_slice(&[sr.0, cond as u8]),
            HostOp::LoadCtx { dst, reg } => out.extend_from_slice(&[dst.0, reg.index() as u8]),
            HostOp::StoreCtx { reg, src } => out.extend_from_slice(&[reg.index() as u8, src.0]),
            HostOp::StoreCtxImm { reg, imm } => {
                out.push(reg.index() as u8);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            HostOp::Jump { target } | HostOp::CallCode { target } => {
                out.extend_from_slice(&target.to_le_bytes());
            }
            HostOp::JumpCond { cond, target } => {
                out.push(cond as u8);
                out.extend_from_slice(&target.to_le_bytes());
            }
            HostOp::CallHelper { helper } => out.push(helper as u8),
            HostOp::Push { regs } | HostOp::Pop { regs } => out.push(regs.0),
            HostOp::Carry { op, dst, src, sr } => {
                out.extend_from_slice(&[op as u8, dst.0, src.0, sr.0]);
            }
            HostOp::MulWide { signed, lo, hi, a, b } => {
                out.extend_from_slice(&[u8::from(signed), lo.0, hi.0, a.0, b.0]);
            }
            HostOp::MulAcc { word, lo, hi, a, b, sr } => {
                out.extend_from_slice(&[u8::from(word), lo.0, hi.0, a.0, b.0, sr.0]);
            }
            HostOp::Ret | HostOp::Exit => {}
        }
        debug_assert_eq!(out.len() - start, self.encoded_len());
    }

    /// Decode the instruction at `at`. Returns the instruction and its length.
    pub fn decode(code: &[u8], at: CodeAddr) -> Result<(HostOp, usize), HostDecodeError> {
        let start = at as usize;
        let op = *code.get(start).ok_or(HostDecodeError::Truncated { at })?;
        let len = encoded_len(op);
        if len == 0 {
            return Err(HostDecodeError::InvalidOpcode { at, opcode: op });
        }
        let bytes = code
            .get(start + 1..start + len)
            .ok_or(HostDecodeError::Truncated { at })?;

        let reg = |i: usize| -> Result<HostReg, HostDecodeError> {
            let value = bytes[i];
            if usize::from(value) < HostReg::COUNT {
                Ok(HostReg(value))
            } else {
                Err(HostDecodeError::InvalidOperand { at, value })
            }
        };
        let guest = |i: usize| {
            let value = bytes[i];
            GuestReg::from_index(usize::from(value))
                .ok_or(HostDecodeError::InvalidOperand { at, value })
        };
        let imm = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let table = |i: usize, len: usize| {
            let value = bytes[i];
            if usize::from(value) < len {
                Ok(usize::from(value))
            } else {
                Err(HostDecodeError::InvalidOperand { at, value })
            }
        };
        let cond = |i: usize| table(i, Cond::ALL.len()).map(|c| Cond::ALL[c]);
        let alu = |i: usize| table(i, AluOp::ALL.len()).map(|c| AluOp::ALL[c]);
        let flag = |i: usize| table(i, 2).map(|v| v != 0);

        let decoded = match op {
            opcode::MOV_IMM => HostOp::MovImm {
                dst: reg(0)?,
                imm: imm(1),
            },
            opcode::MOV => HostOp::Mov {
                dst: reg(0)?,
                src: reg(1)?,
            },
            opcode::ALU => HostOp::Alu {
                op: alu(0)?,
                dst: reg(1)?,
                src: reg(2)?,
            },
            opcode::ALU_IMM => HostOp::AluImm {
                op: alu(0)?,
                dst: reg(1)?,
                imm: imm(2),
            },
            opcode::ALU_IMM_COND => HostOp::AluImmCond {
                cond: cond(0)?,
                op: alu(1)?,
                dst: reg(2)?,
                imm: imm(3),
            },
            opcode::UNARY => HostOp::Unary {
                op: table(0, UnaryOp::ALL.len()).map(|c| UnaryOp::ALL[c])?,
                dst: reg(1)?,
                src: reg(2)?,
            },
            opcode::CMP => HostOp::Cmp {
                a: reg(0)?,
                b: reg(1)?,
            },
            opcode::CMP_IMM => HostOp::CmpImm {
                a: reg(0)?,
                imm: imm(1),
            },
            opcode::TST => HostOp::Tst {
                a: reg(0)?,
                b: reg(1)?,
            },
            opcode::TST_IMM => HostOp::TstImm {
                a: reg(0)?,
                imm: imm(1),
            },
            opcode::SET_T => HostOp::SetT {
                sr: reg(0)?,
                cond: cond(1)?,
            },
            opcode::LOAD_CTX => HostOp::LoadCtx {
                dst: reg(0)?,
                reg: guest(1)?,
            },
            opcode::STORE_CTX => HostOp::StoreCtx {
                reg: guest(0)?,
                src: reg(1)?,
            },
            opcode::STORE_CTX_IMM => HostOp::StoreCtxImm {
                reg: guest(0)?,
                imm: imm(1),
            },
            opcode::JUMP => HostOp::Jump { target: imm(0) },
            opcode::JUMP_COND => HostOp::JumpCond {
                cond: cond(0)?,
                target: imm(1),
            },
            opcode::CALL_HELPER => HostOp::CallHelper {
                helper: table(0, Helper::ALL.len()).map(|c| Helper::ALL[c])?,
            },
            opcode::CALL_CODE => HostOp::CallCode { target: imm(0) },
            opcode::RET => HostOp::Ret,
            opcode::PUSH => HostOp::Push {
                regs: HostRegSet(bytes[0]),
            },
            opcode::POP => HostOp::Pop {
                regs: HostRegSet(bytes[0]),
            },
            opcode::CARRY => HostOp::Carry {
                op: table(0, CarryOp::ALL.len()).map(|c| CarryOp::ALL[c])?,
                dst: reg(1)?,
                src: reg(2)?,
                sr: reg(3)?,
            },
            opcode::MUL_WIDE => HostOp::MulWide {
                signed: flag(0)?,
                lo: reg(1)?,
                hi: reg(2)?,
                a: reg(3)?,
                b: reg(4)?,
            },
            opcode::MUL_ACC => HostOp::MulAcc {
                word: flag(0)?,
                lo: reg(1)?,
                hi: reg(2)?,
                a: reg(3)?,
                b: reg(4)?,
                sr: reg(5)?,
            },
            opcode::EXIT => HostOp::Exit,
            _ => return Err(HostDecodeError::InvalidOpcode { at, opcode: op }),
        };
        Ok((decoded, len))
    }

    /// Byte offset of the patchable target inside a jump encoding.
    pub(crate) fn jump_target_offset(opcode_byte: u8) -> Option<usize> {
        match opcode_byte {
            opcode::JUMP => Some(1),
            opcode::JUMP_COND => Some(2),
            _ => None,
        }
    }
}

const _: () = {
    assert!(JUMP_LEN == 5);
    assert!(encoded_len(opcode::ALU_IMM_COND) == MAX_OP_LEN);
};
