//! Host code emission.
//!
//! [`Emitter`] is the capability the register cache and the translator generate code through.
//! It only describes *what* operation is wanted; the concrete encoding is up to the
//! implementation. Two implementations live here: [`CodeEmitter`], which appends to a window of
//! the translation cache arena, and [`Assembler`], a growable standalone buffer used for tests and
//! tooling.

use crate::guest::GuestReg;
use crate::host::{
    AluOp, CarryOp, Cond, Helper, HostOp, HostReg, HostRegSet, UnaryOp, MAX_OP_LEN,
};
use crate::tcache::{CodeAddr, CodeArena};

pub trait Emitter {
    /// Address the next operation will be placed at.
    fn position(&self) -> CodeAddr;

    fn emit(&mut self, op: HostOp);

    /// Retarget the jump at `site` (as returned by [`Emitter::jump`] or
    /// [`Emitter::jump_cond`]).
    fn patch_jump(&mut self, site: CodeAddr, target: CodeAddr);

    fn mov_imm(&mut self, dst: HostReg, imm: u32) {
        self.emit(HostOp::MovImm { dst, imm });
    }

    fn mov(&mut self, dst: HostReg, src: HostReg) {
        if dst != src {
            self.emit(HostOp::Mov { dst, src });
        }
    }

    fn alu(&mut self, op: AluOp, dst: HostReg, src: HostReg) {
        self.emit(HostOp::Alu { op, dst, src });
    }

    fn alu_imm(&mut self, op: AluOp, dst: HostReg, imm: u32) {
        self.emit(HostOp::AluImm { op, dst, imm });
    }

    fn alu_imm_cond(&mut self, cond: Cond, op: AluOp, dst: HostReg, imm: u32) {
        self.emit(HostOp::AluImmCond { cond, op, dst, imm });
    }

    fn unary(&mut self, op: UnaryOp, dst: HostReg, src: HostReg) {
        self.emit(HostOp::Unary { op, dst, src });
    }

    fn cmp(&mut self, a: HostReg, b: HostReg) {
        self.emit(HostOp::Cmp { a, b });
    }

    fn cmp_imm(&mut self, a: HostReg, imm: u32) {
        self.emit(HostOp::CmpImm { a, imm });
    }

    fn tst(&mut self, a: HostReg, b: HostReg) {
        self.emit(HostOp::Tst { a, b });
    }

    fn tst_imm(&mut self, a: HostReg, imm: u32) {
        self.emit(HostOp::TstImm { a, imm });
    }

    fn set_t(&mut self, sr: HostReg, cond: Cond) {
        self.emit(HostOp::SetT { sr, cond });
    }

    fn carry(&mut self, op: CarryOp, dst: HostReg, src: HostReg, sr: HostReg) {
        self.emit(HostOp::Carry { op, dst, src, sr });
    }

    fn mul_wide(&mut self, signed: bool, lo: HostReg, hi: HostReg, a: HostReg, b: HostReg) {
        self.emit(HostOp::MulWide { signed, lo, hi, a, b });
    }

    fn mul_acc(
        &mut self,
        word: bool,
        lo: HostReg,
        hi: HostReg,
        a: HostReg,
        b: HostReg,
        sr: HostReg,
    ) {
        self.emit(HostOp::MulAcc { word, lo, hi, a, b, sr });
    }

    fn load_ctx(&mut self, dst: HostReg, reg: GuestReg) {
        self.emit(HostOp::LoadCtx { dst, reg });
    }

    fn store_ctx(&mut self, reg: GuestReg, src: HostReg) {
        self.emit(HostOp::StoreCtx { reg, src });
    }

    fn store_ctx_imm(&mut self, reg: GuestReg, imm: u32) {
        self.emit(HostOp::StoreCtxImm { reg, imm });
    }

    /// Emit a patchable jump and return its site.
    fn jump(&mut self, target: CodeAddr) -> CodeAddr {
        let site = self.position();
        self.emit(HostOp::Jump { target });
        site
    }

    /// Emit a patchable conditional jump and return its site.
    fn jump_cond(&mut self, cond: Cond, target: CodeAddr) -> CodeAddr {
        let site = self.position();
        self.emit(HostOp::JumpCond { cond, target });
        site
    }

    fn call_helper(&mut self, helper: Helper) {
        self.emit(HostOp::CallHelper { helper });
    }

    fn call_code(&mut self, target: CodeAddr) {
        self.emit(HostOp::CallCode { target });
    }

    fn ret(&mut self) {
        self.emit(HostOp::Ret);
    }

    fn save_regs(&mut self, regs: HostRegSet) {
        self.emit(HostOp::Push { regs });
    }

    fn restore_regs(&mut self, regs: HostRegSet) {
        self.emit(HostOp::Pop { regs });
    }

    fn exit(&mut self) {
        self.emit(HostOp::Exit);
    }
}

/// Rewrite the target of the jump encoded at `site`.
///
/// # Panics
///
/// Panics if `site` does not hold a jump; patching anything else would corrupt code.
pub(crate) fn patch_jump_bytes(code: &mut [u8], site: CodeAddr, target: CodeAddr) {
    let at = site as usize;
    let offset = code
        .get(at)
        .and_then(|&op| HostOp::jump_target_offset(op))
        .unwrap_or_else(|| panic!("no patchable jump at {site:#x}"));
    code[at + offset..at + offset + 4].copy_from_slice(&target.to_le_bytes());
}

/// Emits into `[start, limit)` of the code arena.
///
/// Running out of room is sticky: further operations are dropped and
/// [`CodeEmitter::overflowed`] reports the failure once the caller is done.
pub struct CodeEmitter<'a> {
    arena: &'a mut CodeArena,
    pos: CodeAddr,
    limit: CodeAddr,
    overflowed: bool,
    scratch: Vec<u8>,
}

impl<'a> CodeEmitter<'a> {
    pub fn new(arena: &'a mut CodeArena, start: CodeAddr, limit: CodeAddr) -> Self {
        debug_assert!(start <= limit && limit as usize <= arena.len());
        Self {
            arena,
            pos: start,
            limit,
            overflowed: false,
            scratch: Vec::with_capacity(MAX_OP_LEN),
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }
}

impl Emitter for CodeEmitter<'_> {
    fn position(&self) -> CodeAddr {
        self.pos
    }

    fn emit(&mut self, op: HostOp) {
        if self.overflowed {
            return;
        }
        let len = op.encoded_len() as CodeAddr;
        if self.limit - self.pos < len {
            self.overflowed = true;
            return;
        }
        self.scratch.clear();
        op.encode(&mut self.scratch);
        self.arena.write(self.pos, &self.scratch);
        self.pos += len;
    }

    fn patch_jump(&mut self, site: CodeAddr, target: CodeAddr) {
        if self.overflowed {
            return;
        }
        self.arena.patch_jump(site, target);
    }
}

/// Growable standalone code buffer starting at address 0.
#[derive(Debug, Default, Clone)]
pub struct Assembler {
    code: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Decode the buffer back into host operations.
    pub fn ops(&self) -> Vec<HostOp> {
        let mut out = Vec::new();
        let mut at = 0usize;
        while at < self.code.len() {
            match HostOp::decode(&self.code, at as CodeAddr) {
                Ok((op, len)) => {
                    out.push(op);
                    at += len;
                }
                Err(_) => break,
            }
        }
        out
    }
}

impl Emitter for Assembler {
    fn position(&self) -> CodeAddr {
        self.code.len() as CodeAddr
    }

    fn emit(&mut self, op: HostOp) {
        op.encode(&mut self.code);
    }

    fn patch_jump(&mut self, site: CodeAddr, target: CodeAddr) {
        patch_jump_bytes(&mut self.code, site, target);
    }
}
