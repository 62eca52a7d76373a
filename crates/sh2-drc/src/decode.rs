//! SH-2 opcode decoding.
//!
//! Only the shape of each instruction is decoded here; register dependencies, cycle costs and
//! branch classification are derived by [`crate::scan`].

use crate::guest::GuestReg;

/// Memory operand width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Size {
    Byte,
    Word,
    Long,
}

impl Size {
    #[inline]
    pub const fn bytes(self) -> u32 {
        match self {
            Size::Byte => 1,
            Size::Word => 2,
            Size::Long => 4,
        }
    }

    const fn from_bits(bits: u16) -> Option<Size> {
        match bits {
            0 => Some(Size::Byte),
            1 => Some(Size::Word),
            2 => Some(Size::Long),
            _ => None,
        }
    }
}

/// Memory addressing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Addr {
    /// `@Rn`
    Indirect(u8),
    /// `@Rn+`
    PostInc(u8),
    /// `@-Rn`
    PreDec(u8),
    /// `@(disp,Rn)`, displacement already scaled to bytes.
    Disp(u8, u32),
    /// `@(R0,Rn)`
    Indexed(u8),
    /// `@(disp,GBR)`, displacement already scaled to bytes.
    Gbr(u32),
}

impl Addr {
    /// Base register read to form the address.
    pub fn base(self) -> GuestReg {
        match self {
            Addr::Indirect(n) | Addr::PostInc(n) | Addr::PreDec(n) | Addr::Disp(n, _) | Addr::Indexed(n) => {
                GuestReg::gpr(n)
            }
            Addr::Gbr(_) => GuestReg::GBR,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AluKind {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

/// `CMP/xx Rm,Rn` comparison, always `Rn ? Rm`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpKind {
    Eq,
    /// Unsigned `>=`.
    Hs,
    /// Signed `>=`.
    Ge,
    /// Unsigned `>`.
    Hi,
    /// Signed `>`.
    Gt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtKind {
    U8,
    U16,
    S8,
    S16,
}

/// One-bit shifts and rotates that move the shifted-out bit into T.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShiftKind {
    /// `SHLL` / `SHAL`
    Shll,
    Shlr,
    Shar,
    Rotl,
    Rotr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MulKind {
    /// `MUL.L`: 32x32 -> low 32 bits.
    Long,
    /// `MULU.W`
    UnsignedWord,
    /// `MULS.W`
    SignedWord,
}

/// Two-operand arithmetic that reads or writes SR bits beyond a plain compare result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CarryKind {
    Addc,
    Subc,
    Addv,
    Subv,
    Negc,
    Div0s,
    Div1,
}

/// Decoded SH-2 instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Insn {
    Nop,
    /// `MOV #imm,Rn` (sign-extended 8-bit immediate).
    MovImm { n: u8, imm: i8 },
    /// `MOV Rm,Rn`
    Mov { n: u8, m: u8 },
    /// `MOV.W @(disp,PC),Rn` / `MOV.L @(disp,PC),Rn`; `addr` is the absolute literal address.
    LoadPool { n: u8, size: Size, addr: u32 },
    /// `MOVA @(disp,PC),R0`; `addr` is the computed address.
    Mova { addr: u32 },
    Load { size: Size, addr: Addr, n: u8 },
    Store { size: Size, addr: Addr, m: u8 },
    Alu { kind: AluKind, n: u8, m: u8 },
    AddImm { n: u8, imm: i8 },
    /// `AND/OR/XOR #imm,R0`
    AluImm { kind: AluKind, imm: u8 },
    /// `TST #imm,R0`
    TstImm { imm: u8 },
    /// `CMP/EQ #imm,R0`
    CmpEqImm { imm: i8 },
    Cmp { kind: CmpKind, n: u8, m: u8 },
    /// `CMP/PZ Rn` (`Rn >= 0`)
    CmpPz { n: u8 },
    /// `CMP/PL Rn` (`Rn > 0`)
    CmpPl { n: u8 },
    Tst { n: u8, m: u8 },
    Neg { n: u8, m: u8 },
    Not { n: u8, m: u8 },
    Ext { kind: ExtKind, n: u8, m: u8 },
    /// `SWAP.B` (`word == false`) / `SWAP.W`
    Swap { word: bool, n: u8, m: u8 },
    Xtrct { n: u8, m: u8 },
    Mul { kind: MulKind, n: u8, m: u8 },
    /// `DMULS.L` / `DMULU.L`: 32x32 -> MACH:MACL.
    Dmul { signed: bool, n: u8, m: u8 },
    /// `MAC.W` / `MAC.L @Rm+,@Rn+`
    Mac { size: Size, n: u8, m: u8 },
    Carry { kind: CarryKind, n: u8, m: u8 },
    Div0u,
    /// `ROTCL` / `ROTCR`: rotate through T.
    Rotc { left: bool, n: u8 },
    Dt { n: u8 },
    Shift { kind: ShiftKind, n: u8 },
    /// `SHLLn` / `SHLRn` for n in {2, 8, 16}.
    ShiftBy { left: bool, amount: u8, n: u8 },
    Clrt,
    Sett,
    Movt { n: u8 },
    Clrmac,
    /// `LDC Rm,{SR,GBR,VBR}` and `LDS Rm,{MACH,MACL,PR}`
    LoadSys { reg: GuestReg, m: u8 },
    /// `STC {SR,GBR,VBR},Rn` and `STS {MACH,MACL,PR},Rn`
    StoreSys { reg: GuestReg, n: u8 },
    /// `LDC.L @Rm+,...` and `LDS.L @Rm+,...`
    PopSys { reg: GuestReg, m: u8 },
    /// `STC.L ...,@-Rn` and `STS.L ...,@-Rn`
    PushSys { reg: GuestReg, n: u8 },
    TasB { n: u8 },
    Bra { target: u32 },
    Bsr { target: u32 },
    Bt { target: u32, delayed: bool },
    Bf { target: u32, delayed: bool },
    Braf { m: u8 },
    Bsrf { m: u8 },
    Jmp { m: u8 },
    Jsr { m: u8 },
    Rts,
    Rte,
    Sleep,
    Trapa { imm: u8 },
    /// Undefined or unimplemented opcode.
    Illegal,
}

impl Insn {
    /// Branches whose following instruction executes in a delay slot.
    pub fn has_delay_slot(self) -> bool {
        matches!(
            self,
            Insn::Bra { .. }
                | Insn::Bsr { .. }
                | Insn::Braf { .. }
                | Insn::Bsrf { .. }
                | Insn::Jmp { .. }
                | Insn::Jsr { .. }
                | Insn::Rts
                | Insn::Rte
                | Insn::Bt { delayed: true, .. }
                | Insn::Bf { delayed: true, .. }
        )
    }

    /// Instructions that may not be placed in a delay slot.
    pub fn is_branch(self) -> bool {
        self.has_delay_slot()
            || matches!(
                self,
                Insn::Bt { .. } | Insn::Bf { .. } | Insn::Trapa { .. }
            )
    }
}

const fn sys_reg(sel: u16) -> Option<GuestReg> {
    match sel {
        0 => Some(GuestReg::MACH),
        1 => Some(GuestReg::MACL),
        2 => Some(GuestReg::PR),
        _ => None,
    }
}

const fn ctl_reg(sel: u16) -> Option<GuestReg> {
    match sel {
        0 => Some(GuestReg::SR),
        1 => Some(GuestReg::GBR),
        2 => Some(GuestReg::VBR),
        _ => None,
    }
}

/// Decode the opcode fetched from `pc`.
pub fn decode(pc: u32, op: u16) -> Insn {
    let n = ((op >> 8) & 0xf) as u8;
    let m = ((op >> 4) & 0xf) as u8;
    let low4 = op & 0xf;
    let imm8 = (op & 0xff) as u8;
    let disp8 = u32::from(imm8);
    let bcond_target = pc
        .wrapping_add(4)
        .wrapping_add(((imm8 as i8 as i32) * 2) as u32);

    match op >> 12 {
        0x0 => match low4 {
            0x2 => ctl_reg(u16::from(m)).map_or(Insn::Illegal, |reg| Insn::StoreSys { reg, n }),
            0x3 => match m {
                0 => Insn::Bsrf { m: n },
                2 => Insn::Braf { m: n },
                _ => Insn::Illegal,
            },
            0x4..=0x6 => Size::from_bits(low4 - 4).map_or(Insn::Illegal, |size| Insn::Store {
                size,
                addr: Addr::Indexed(n),
                m,
            }),
            0x7 => Insn::Mul {
                kind: MulKind::Long,
                n,
                m,
            },
            0x8 if n == 0 => match m {
                0 => Insn::Clrt,
                1 => Insn::Sett,
                2 => Insn::Clrmac,
                _ => Insn::Illegal,
            },
            0x9 => match (n, m) {
                (0, 0) => Insn::Nop,
                (0, 1) => Insn::Div0u,
                (_, 2) => Insn::Movt { n },
                _ => Insn::Illegal,
            },
            0xa => sys_reg(u16::from(m)).map_or(Insn::Illegal, |reg| Insn::StoreSys { reg, n }),
            0xb if n == 0 => match m {
                0 => Insn::Rts,
                1 => Insn::Sleep,
                2 => Insn::Rte,
                _ => Insn::Illegal,
            },
            0xc..=0xe => Size::from_bits(low4 - 0xc).map_or(Insn::Illegal, |size| Insn::Load {
                size,
                addr: Addr::Indexed(m),
                n,
            }),
            0xf => Insn::Mac {
                size: Size::Long,
                n,
                m,
            },
            _ => Insn::Illegal,
        },
        0x1 => Insn::Store {
            size: Size::Long,
            addr: Addr::Disp(n, u32::from(low4) * 4),
            m,
        },
        0x2 => match low4 {
            0x0..=0x2 => Size::from_bits(low4).map_or(Insn::Illegal, |size| Insn::Store {
                size,
                addr: Addr::Indirect(n),
                m,
            }),
            0x4..=0x6 => Size::from_bits(low4 - 4).map_or(Insn::Illegal, |size| Insn::Store {
                size,
                addr: Addr::PreDec(n),
                m,
            }),
            0x7 => Insn::Carry {
                kind: CarryKind::Div0s,
                n,
                m,
            },
            0x8 => Insn::Tst { n, m },
            0x9 => Insn::Alu {
                kind: AluKind::And,
                n,
                m,
            },
            0xa => Insn::Alu {
                kind: AluKind::Xor,
                n,
                m,
            },
            0xb => Insn::Alu {
                kind: AluKind::Or,
                n,
                m,
            },
            0xd => Insn::Xtrct { n, m },
            0xe => Insn::Mul {
                kind: MulKind::UnsignedWord,
                n,
                m,
            },
            0xf => Insn::Mul {
                kind: MulKind::SignedWord,
                n,
                m,
            },
            _ => Insn::Illegal,
        },
        0x3 => match low4 {
            0x0 => Insn::Cmp { kind: CmpKind::Eq, n, m },
            0x2 => Insn::Cmp { kind: CmpKind::Hs, n, m },
            0x3 => Insn::Cmp { kind: CmpKind::Ge, n, m },
            0x4 => Insn::Carry {
                kind: CarryKind::Div1,
                n,
                m,
            },
            0x5 => Insn::Dmul {
                signed: false,
                n,
                m,
            },
            0x6 => Insn::Cmp { kind: CmpKind::Hi, n, m },
            0x7 => Insn::Cmp { kind: CmpKind::Gt, n, m },
            0x8 => Insn::Alu {
                kind: AluKind::Sub,
                n,
                m,
            },
            0xa => Insn::Carry {
                kind: CarryKind::Subc,
                n,
                m,
            },
            0xb => Insn::Carry {
                kind: CarryKind::Subv,
                n,
                m,
            },
            0xc => Insn::Alu {
                kind: AluKind::Add,
                n,
                m,
            },
            0xd => Insn::Dmul { signed: true, n, m },
            0xe => Insn::Carry {
                kind: CarryKind::Addc,
                n,
                m,
            },
            0xf => Insn::Carry {
                kind: CarryKind::Addv,
                n,
                m,
            },
            _ => Insn::Illegal,
        },
        0x4 => decode_group4(n, m, low4),
        0x5 => Insn::Load {
            size: Size::Long,
            addr: Addr::Disp(m, u32::from(low4) * 4),
            n,
        },
        0x6 => match low4 {
            0x0..=0x2 => Size::from_bits(low4).map_or(Insn::Illegal, |size| Insn::Load {
                size,
                addr: Addr::Indirect(m),
                n,
            }),
            0x3 => Insn::Mov { n, m },
            0x4..=0x6 => Size::from_bits(low4 - 4).map_or(Insn::Illegal, |size| Insn::Load {
                size,
                addr: Addr::PostInc(m),
                n,
            }),
            0x7 => Insn::Not { n, m },
            0x8 => Insn::Swap { word: false, n, m },
            0x9 => Insn::Swap { word: true, n, m },
            0xa => Insn::Carry {
                kind: CarryKind::Negc,
                n,
                m,
            },
            0xb => Insn::Neg { n, m },
            0xc => Insn::Ext { kind: ExtKind::U8, n, m },
            0xd => Insn::Ext { kind: ExtKind::U16, n, m },
            0xe => Insn::Ext { kind: ExtKind::S8, n, m },
            0xf => Insn::Ext { kind: ExtKind::S16, n, m },
            _ => Insn::Illegal,
        },
        0x7 => Insn::AddImm { n, imm: imm8 as i8 },
        0x8 => match n {
            0x0 => Insn::Store {
                size: Size::Byte,
                addr: Addr::Disp(m, u32::from(low4)),
                m: 0,
            },
            0x1 => Insn::Store {
                size: Size::Word,
                addr: Addr::Disp(m, u32::from(low4) * 2),
                m: 0,
            },
            0x4 => Insn::Load {
                size: Size::Byte,
                addr: Addr::Disp(m, u32::from(low4)),
                n: 0,
            },
            0x5 => Insn::Load {
                size: Size::Word,
                addr: Addr::Disp(m, u32::from(low4) * 2),
                n: 0,
            },
            0x8 => Insn::CmpEqImm { imm: imm8 as i8 },
            0x9 => Insn::Bt {
                target: bcond_target,
                delayed: false,
            },
            0xb => Insn::Bf {
                target: bcond_target,
                delayed: false,
            },
            0xd => Insn::Bt {
                target: bcond_target,
                delayed: true,
            },
            0xf => Insn::Bf {
                target: bcond_target,
                delayed: true,
            },
            _ => Insn::Illegal,
        },
        0x9 => Insn::LoadPool {
            n,
            size: Size::Word,
            addr: pc.wrapping_add(4).wrapping_add(disp8 * 2),
        },
        0xa | 0xb => {
            // 12-bit signed displacement.
            let disp = (((op & 0xfff) as i32) << 20) >> 19;
            let target = pc.wrapping_add(4).wrapping_add(disp as u32);
            if op >> 12 == 0xa {
                Insn::Bra { target }
            } else {
                Insn::Bsr { target }
            }
        }
        0xc => match n {
            0x0..=0x2 => Size::from_bits(u16::from(n)).map_or(Insn::Illegal, |size| Insn::Store {
                size,
                addr: Addr::Gbr(disp8 * size.bytes()),
                m: 0,
            }),
            0x3 => Insn::Trapa { imm: imm8 },
            0x4..=0x6 => {
                Size::from_bits(u16::from(n) - 4).map_or(Insn::Illegal, |size| Insn::Load {
                    size,
                    addr: Addr::Gbr(disp8 * size.bytes()),
                    n: 0,
                })
            }
            0x7 => Insn::Mova {
                addr: (pc.wrapping_add(4) & !3).wrapping_add(disp8 * 4),
            },
            0x8 => Insn::TstImm { imm: imm8 },
            0x9 => Insn::AluImm {
                kind: AluKind::And,
                imm: imm8,
            },
            0xa => Insn::AluImm {
                kind: AluKind::Xor,
                imm: imm8,
            },
            0xb => Insn::AluImm {
                kind: AluKind::Or,
                imm: imm8,
            },
            _ => Insn::Illegal,
        },
        0xd => Insn::LoadPool {
            n,
            size: Size::Long,
            addr: (pc.wrapping_add(4) & !3).wrapping_add(disp8 * 4),
        },
        0xe => Insn::MovImm { n, imm: imm8 as i8 },
        _ => Insn::Illegal,
    }
}

fn decode_group4(n: u8, m: u8, low4: u16) -> Insn {
    let sel = u16::from(m);
    match (low4, m) {
        (0x0, 0) => Insn::Shift {
            kind: ShiftKind::Shll,
            n,
        },
        (0x0, 1) => Insn::Dt { n },
        (0x0, 2) => Insn::Shift {
            kind: ShiftKind::Shll,
            n,
        },
        (0x1, 0) => Insn::Shift {
            kind: ShiftKind::Shlr,
            n,
        },
        (0x1, 1) => Insn::CmpPz { n },
        (0x1, 2) => Insn::Shift {
            kind: ShiftKind::Shar,
            n,
        },
        (0x2, _) => sys_reg(sel).map_or(Insn::Illegal, |reg| Insn::PushSys { reg, n }),
        (0x3, _) => ctl_reg(sel).map_or(Insn::Illegal, |reg| Insn::PushSys { reg, n }),
        (0x4, 0) => Insn::Shift {
            kind: ShiftKind::Rotl,
            n,
        },
        (0x4, 2) => Insn::Rotc { left: true, n },
        (0x5, 0) => Insn::Shift {
            kind: ShiftKind::Rotr,
            n,
        },
        (0x5, 1) => Insn::CmpPl { n },
        (0x5, 2) => Insn::Rotc { left: false, n },
        (0x6, _) => sys_reg(sel).map_or(Insn::Illegal, |reg| Insn::PopSys { reg, m: n }),
        (0x7, _) => ctl_reg(sel).map_or(Insn::Illegal, |reg| Insn::PopSys { reg, m: n }),
        (0x8 | 0x9, 0..=2) => {
            let amount = [2, 8, 16][usize::from(m)];
            Insn::ShiftBy {
                left: low4 == 0x8,
                amount,
                n,
            }
        }
        (0xa, _) => sys_reg(sel).map_or(Insn::Illegal, |reg| Insn::LoadSys { reg, m: n }),
        (0xb, 0) => Insn::Jsr { m: n },
        (0xb, 1) => Insn::TasB { n },
        (0xb, 2) => Insn::Jmp { m: n },
        (0xe, _) => ctl_reg(sel).map_or(Insn::Illegal, |reg| Insn::LoadSys { reg, m: n }),
        (0xf, _) => Insn::Mac {
            size: Size::Word,
            n,
            m,
        },
        _ => Insn::Illegal,
    }
}
