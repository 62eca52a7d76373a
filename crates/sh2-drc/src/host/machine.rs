//! Executes host code from the code arena.

use crate::error::HostDecodeError;
use crate::guest::CpuState;
use crate::host::{multiply_accumulate, Cond, Helper, HostOp, HostReg};
use crate::tcache::CodeAddr;

/// Result of executing one host instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Translated code requested a runtime service. The machine has already advanced past the
    /// call; the runtime may redirect it with [`HostMachine::jump`].
    Call(Helper),
    Exit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    eq: bool,
    lt: bool,
    ltu: bool,
}

impl Flags {
    fn compare(a: u32, b: u32) -> Flags {
        Flags {
            eq: a == b,
            lt: (a as i32) < (b as i32),
            ltu: a < b,
        }
    }

    fn test(a: u32, b: u32) -> Flags {
        Flags {
            eq: a & b == 0,
            lt: false,
            ltu: false,
        }
    }

    fn holds(self, cond: Cond) -> bool {
        match cond {
            Cond::Eq => self.eq,
            Cond::Ne => !self.eq,
            Cond::Lt => self.lt,
            Cond::Ge => !self.lt,
            Cond::Gt => !self.lt && !self.eq,
            Cond::Le => self.lt || self.eq,
            Cond::Ltu => self.ltu,
            Cond::Geu => !self.ltu,
            Cond::Gtu => !self.ltu && !self.eq,
            Cond::Leu => self.ltu || self.eq,
        }
    }
}

/// Bound on nested [`HostOp::CallCode`] frames and saved registers.
const STACK_LIMIT: usize = 64;

/// Register file, flags and stacks of the host CPU.
#[derive(Debug, Clone, Default)]
pub struct HostMachine {
    regs: [u32; HostReg::COUNT],
    flags: Flags,
    pc: CodeAddr,
    calls: Vec<CodeAddr>,
    saved: Vec<u32>,
}

impl HostMachine {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn reg(&self, reg: HostReg) -> u32 {
        self.regs[reg.index()]
    }

    #[inline]
    pub fn set_reg(&mut self, reg: HostReg, value: u32) {
        self.regs[reg.index()] = value;
    }

    #[inline]
    pub fn pc(&self) -> CodeAddr {
        self.pc
    }

    #[inline]
    pub fn jump(&mut self, target: CodeAddr) {
        self.pc = target;
    }

    /// Drop every call frame and saved register. Used when control re-enters the dispatcher.
    pub fn reset_stacks(&mut self) {
        self.calls.clear();
        self.saved.clear();
    }

    /// Fetch, decode and execute the instruction at the current PC.
    pub fn step(&mut self, code: &[u8], cpu: &mut CpuState) -> Result<Step, HostDecodeError> {
        let at = self.pc;
        let (op, len) = HostOp::decode(code, at)?;
        self.pc = at.wrapping_add(len as CodeAddr);
        self.execute(op, cpu, at)
    }

    /// Execute a decoded instruction. `at` is its address, used for diagnostics and call frames.
    pub fn execute(
        &mut self,
        op: HostOp,
        cpu: &mut CpuState,
        at: CodeAddr,
    ) -> Result<Step, HostDecodeError> {
        match op {
            HostOp::MovImm { dst, imm } => self.set_reg(dst, imm),
            HostOp::Mov { dst, src } => self.set_reg(dst, self.reg(src)),
            HostOp::Alu { op, dst, src } => {
                let value = op.apply(self.reg(dst), self.reg(src));
                self.set_reg(dst, value);
            }
            HostOp::AluImm { op, dst, imm } => self.set_reg(dst, op.apply(self.reg(dst), imm)),
            HostOp::AluImmCond { cond, op, dst, imm } => {
                if self.flags.holds(cond) {
                    self.set_reg(dst, op.apply(self.reg(dst), imm));
                }
            }
            HostOp::Unary { op, dst, src } => self.set_reg(dst, op.apply(self.reg(src))),
            HostOp::Cmp { a, b } => self.flags = Flags::compare(self.reg(a), self.reg(b)),
            HostOp::CmpImm { a, imm } => self.flags = Flags::compare(self.reg(a), imm),
            HostOp::Tst { a, b } => self.flags = Flags::test(self.reg(a), self.reg(b)),
            HostOp::TstImm { a, imm } => self.flags = Flags::test(self.reg(a), imm),
            HostOp::SetT { sr, cond } => {
                let t = u32::from(self.flags.holds(cond));
                self.set_reg(sr, (self.reg(sr) & !1) | t);
            }
            HostOp::LoadCtx { dst, reg } => self.set_reg(dst, cpu.get(reg)),
            HostOp::StoreCtx { reg, src } => cpu.set(reg, self.reg(src)),
            HostOp::StoreCtxImm { reg, imm } => cpu.set(reg, imm),
            HostOp::Jump { target } => self.pc = target,
            HostOp::JumpCond { cond, target } => {
                if self.flags.holds(cond) {
                    self.pc = target;
                }
            }
            HostOp::CallHelper { helper } => return Ok(Step::Call(helper)),
            HostOp::CallCode { target } => {
                if self.calls.len() >= STACK_LIMIT {
                    return Err(HostDecodeError::StackFault { at });
                }
                self.calls.push(self.pc);
                self.pc = target;
            }
            HostOp::Ret => {
                self.pc = self
                    .calls
                    .pop()
                    .ok_or(HostDecodeError::StackFault { at })?;
            }
            HostOp::Push { regs } => {
                for reg in regs.iter() {
                    if self.saved.len() >= STACK_LIMIT {
                        return Err(HostDecodeError::StackFault { at });
                    }
                    self.saved.push(self.reg(reg));
                }
            }
            HostOp::Pop { regs } => {
                for reg in regs.iter().rev() {
                    let value = self
                        .saved
                        .pop()
                        .ok_or(HostDecodeError::StackFault { at })?;
                    self.set_reg(reg, value);
                }
            }
            HostOp::Carry { op, dst, src, sr } => {
                let (value, bits) = op.apply(self.reg(dst), self.reg(src), self.reg(sr));
                self.set_reg(sr, bits);
                self.set_reg(dst, value);
            }
            HostOp::MulWide { signed, lo, hi, a, b } => {
                let (a, b) = (self.reg(a), self.reg(b));
                let product = if signed {
                    (i64::from(a as i32) * i64::from(b as i32)) as u64
                } else {
                    u64::from(a) * u64::from(b)
                };
                self.set_reg(hi, (product >> 32) as u32);
                self.set_reg(lo, product as u32);
            }
            HostOp::MulAcc { word, lo, hi, a, b, sr } => {
                let (mach, macl) = multiply_accumulate(
                    word,
                    self.reg(hi),
                    self.reg(lo),
                    self.reg(a),
                    self.reg(b),
                    self.reg(sr),
                );
                self.set_reg(hi, mach);
                self.set_reg(lo, macl);
            }
            HostOp::Exit => return Ok(Step::Exit),
        }
        Ok(Step::Continue)
    }
}
