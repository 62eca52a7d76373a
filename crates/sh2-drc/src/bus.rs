//! Guest memory and exception delivery, as seen by the recompiler.
//!
//! The embedder owns the memory map and device emulation; the recompiler only needs instruction
//! fetches for scanning, data accesses for translated loads and stores, and a hook to raise guest
//! exceptions and interrupts.

use crate::guest::{CpuState, GuestReg, Sr};

/// Exception vector numbers used by the default exception entry.
pub mod vector {
    pub const GENERAL_ILLEGAL: u32 = 4;
    pub const SLOT_ILLEGAL: u32 = 6;
}

/// Why translated code handed control to the exception hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    /// Undefined or unimplemented opcode at `pc`.
    IllegalInstruction { pc: u32 },
    /// Branch or undefined opcode placed in the delay slot of the branch at `pc`.
    SlotIllegalInstruction { pc: u32 },
    /// `TRAPA #imm`; `return_pc` is the address of the following instruction.
    Trap { vector: u8, return_pc: u32 },
    /// Accepted interrupt at `level` (above the current SR mask).
    Interrupt { level: u8, vector: u8 },
}

/// What the exception hook did with a [`GuestEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Exception entered; guest PC now points at the handler.
    Handled,
    /// Stop running translated code and return from `execute` so the embedder can run the
    /// interpreter at the current guest PC.
    ExitToInterpreter,
}

/// Guest bus consumed by the recompiler.
///
/// Loads of byte and word width return the raw zero-extended value; sign extension is applied by
/// translated code. Accesses outside mapped memory should behave the way the embedder's bus
/// behaves for the interpreter (open bus, bus error, ...).
pub trait GuestBus {
    /// Fetch an instruction halfword. `None` marks unmapped or non-executable memory.
    fn fetch16(&self, addr: u32) -> Option<u16>;

    fn read8(&mut self, addr: u32) -> u8;
    fn read16(&mut self, addr: u32) -> u16;
    fn read32(&mut self, addr: u32) -> u32;

    fn write8(&mut self, addr: u32, value: u8);
    fn write16(&mut self, addr: u32, value: u16);
    fn write32(&mut self, addr: u32, value: u32);

    /// Highest-priority pending interrupt as `(level, vector)`, if any.
    fn pending_interrupt(&mut self) -> Option<(u8, u8)> {
        None
    }

    /// Raise `event` on the guest CPU.
    ///
    /// The default performs the SH-2 exception entry sequence.
    fn deliver_event(&mut self, cpu: &mut CpuState, event: GuestEvent) -> EventOutcome {
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
                let return_pc = cpu.pc();
                enter_exception(self, cpu, u32::from(vector), return_pc);
                cpu.set_imask(level);
            }
        }
        EventOutcome::Handled
    }
}

/// SH-2 exception entry: push SR and the return PC on the stack, then load PC from the vector
/// table at VBR.
pub fn enter_exception<B: GuestBus + ?Sized>(
    bus: &mut B,
    cpu: &mut CpuState,
    vector: u32,
    return_pc: u32,
) {
    let mut sp = cpu.get(GuestReg::SP);
    sp = sp.wrapping_sub(4);
    bus.write32(sp, cpu.get(GuestReg::SR) & Sr::GUEST_MASK);
    sp = sp.wrapping_sub(4);
    bus.write32(sp, return_pc);
    cpu.set(GuestReg::SP, sp);

    let handler = bus.read32(cpu.get(GuestReg::VBR).wrapping_add(vector.wrapping_mul(4)));
    cpu.set_pc(handler);
}
