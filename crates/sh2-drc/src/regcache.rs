//! Host register cache and guest constant propagation.
//!
//! During translation every guest register lives in exactly one of three places: its canonical
//! slot in [`crate::CpuState`], a host register slot of this cache, or the constant cache (a
//! value known at translation time that has not been materialized yet). The cache emits the
//! loads, stores and immediate moves needed to move values between those places.
//!
//! Slot selection prefers an existing mapping, then a free slot, then evicts the least recently
//! used unlocked slot. Acquired registers stay locked until [`RegCache::unlock_all`] is called at
//! the next instruction boundary, so one instruction's operands can never evict each other.

use crate::emit::Emitter;
use crate::guest::GuestReg;
use crate::host::HostReg;

/// Fixed argument registers of helper calls. `ARG_REGS[0]` also carries the return value.
pub const ARG_REGS: [HostReg; 4] = [
    HostReg::new(0),
    HostReg::new(1),
    HostReg::new(2),
    HostReg::new(3),
];

/// Host register permanently holding the cycle budget.
pub const CYCLES_REG: HostReg = HostReg::new(7);

/// Guest registers pinned to a host register for the lifetime of the engine.
pub const STATIC_MAP: [(GuestReg, HostReg); 1] = [(GuestReg::CYCLES, CYCLES_REG)];

/// Allocation order of the cache slots. Argument registers come last so a helper call rarely
/// has to evict a live value.
const SLOT_REGS: [HostReg; 7] = [
    HostReg::new(4),
    HostReg::new(5),
    HostReg::new(6),
    HostReg::new(3),
    HostReg::new(2),
    HostReg::new(1),
    HostReg::new(0),
];

const _: () = {
    let mut i = 0;
    while i < SLOT_REGS.len() {
        assert!(SLOT_REGS[i].index() != CYCLES_REG.index());
        i += 1;
    }
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn reads(self) -> bool {
        self != Access::Write
    }

    fn writes(self) -> bool {
        self != Access::Read
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotUse {
    Free,
    Cached(GuestReg),
    Temp,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    host: HostReg,
    usage: SlotUse,
    dirty: bool,
    locked: bool,
    stamp: u32,
}

/// Snapshot of one cache slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotView {
    pub host: HostReg,
    pub guest: Option<GuestReg>,
    pub temp: bool,
    pub dirty: bool,
    pub locked: bool,
}

#[derive(Clone, Debug)]
struct ConstCache {
    known: u32,
    dirty: u32,
    values: [u32; GuestReg::COUNT],
}

impl ConstCache {
    const fn new() -> Self {
        Self {
            known: 0,
            dirty: 0,
            values: [0; GuestReg::COUNT],
        }
    }

    fn get(&self, reg: GuestReg) -> Option<u32> {
        (self.known & bit(reg) != 0).then(|| self.values[reg.index()])
    }

    fn kill(&mut self, reg: GuestReg) {
        self.known &= !bit(reg);
        self.dirty &= !bit(reg);
    }
}

#[inline]
fn bit(reg: GuestReg) -> u32 {
    1 << reg.index()
}

#[derive(Clone, Debug)]
pub struct RegCache {
    slots: [Slot; SLOT_REGS.len()],
    consts: ConstCache,
    stamp: u32,
    propagate: bool,
}

impl RegCache {
    pub fn new(propagate_constants: bool) -> Self {
        let slots = SLOT_REGS.map(|host| Slot {
            host,
            usage: SlotUse::Free,
            dirty: false,
            locked: false,
            stamp: 0,
        });
        Self {
            slots,
            consts: ConstCache::new(),
            stamp: 0,
            propagate: propagate_constants,
        }
    }

    /// Forget every mapping and constant without emitting code.
    ///
    /// Only valid where canonical storage is already up to date: at the start of a block and
    /// right after a [`RegCache::flush`] at an entry point.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.usage = SlotUse::Free;
            slot.dirty = false;
            slot.locked = false;
        }
        self.consts = ConstCache::new();
    }

    #[inline]
    pub fn pinned(reg: GuestReg) -> Option<HostReg> {
        STATIC_MAP
            .iter()
            .find(|(guest, _)| *guest == reg)
            .map(|(_, host)| *host)
    }

    fn next_stamp(&mut self) -> u32 {
        self.stamp = self.stamp.wrapping_add(1);
        self.stamp
    }

    fn find_cached(&self, reg: GuestReg) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.usage == SlotUse::Cached(reg))
    }

    fn slot_of(&self, host: HostReg) -> usize {
        self.slots
            .iter()
            .position(|slot| slot.host == host)
            .unwrap_or_else(|| panic!("{host:?} is not managed by the register cache"))
    }

    fn evict<E: Emitter + ?Sized>(&mut self, e: &mut E, i: usize) {
        let slot = &mut self.slots[i];
        if let SlotUse::Cached(reg) = slot.usage {
            if slot.dirty {
                e.store_ctx(reg, slot.host);
            }
        }
        slot.usage = SlotUse::Free;
        slot.dirty = false;
        slot.locked = false;
    }

    fn alloc_slot<E: Emitter + ?Sized>(&mut self, e: &mut E) -> usize {
        if let Some(i) = self
            .slots
            .iter()
            .position(|slot| slot.usage == SlotUse::Free)
        {
            return i;
        }
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.locked)
            .min_by_key(|(_, slot)| slot.stamp)
            .map(|(i, _)| i)
            .unwrap_or_else(|| panic!("register cache: every slot is locked, nothing to evict"));
        self.evict(e, victim);
        victim
    }

    /// Map `reg` to a host register for `access` and lock it until the next
    /// [`RegCache::unlock_all`].
    pub fn acquire<E: Emitter + ?Sized>(&mut self, e: &mut E, reg: GuestReg, access: Access) -> HostReg {
        if let Some(host) = Self::pinned(reg) {
            return host;
        }

        let i = match self.find_cached(reg) {
            Some(i) => i,
            None => {
                let i = self.alloc_slot(e);
                let host = self.slots[i].host;
                self.slots[i].usage = SlotUse::Cached(reg);
                self.slots[i].dirty = false;
                if access.reads() {
                    if let Some(value) = self.consts.get(reg) {
                        e.mov_imm(host, value);
                        // The slot now owns the pending write-back.
                        self.slots[i].dirty = self.consts.dirty & bit(reg) != 0;
                        self.consts.dirty &= !bit(reg);
                    } else {
                        e.load_ctx(host, reg);
                    }
                }
                i
            }
        };

        if access.writes() {
            self.slots[i].dirty = true;
            self.consts.kill(reg);
        }
        let stamp = self.next_stamp();
        let slot = &mut self.slots[i];
        slot.locked = true;
        slot.stamp = stamp;
        slot.host
    }

    /// Lock a scratch register with no guest association.
    pub fn acquire_temporary<E: Emitter + ?Sized>(&mut self, e: &mut E) -> HostReg {
        let i = self.alloc_slot(e);
        let stamp = self.next_stamp();
        let slot = &mut self.slots[i];
        slot.usage = SlotUse::Temp;
        slot.dirty = false;
        slot.locked = true;
        slot.stamp = stamp;
        slot.host
    }

    /// Claim helper argument register `index` as a temporary, evicting its current occupant.
    ///
    /// Arguments must be claimed before the operands used to compute them are acquired.
    pub fn acquire_arg<E: Emitter + ?Sized>(&mut self, e: &mut E, index: usize) -> HostReg {
        let host = ARG_REGS[index];
        let i = self.slot_of(host);
        match self.slots[i].usage {
            SlotUse::Temp if self.slots[i].locked => {
                panic!("argument register {host:?} is already held as a temporary")
            }
            SlotUse::Cached(reg) if self.slots[i].locked => {
                panic!("argument register {host:?} holds locked guest register {reg:?}")
            }
            _ => self.evict(e, i),
        }
        let stamp = self.next_stamp();
        let slot = &mut self.slots[i];
        slot.usage = SlotUse::Temp;
        slot.locked = true;
        slot.stamp = stamp;
        host
    }

    /// Claim argument register `index` and load the current value of `reg` into it.
    pub fn acquire_arg_from<E: Emitter + ?Sized>(
        &mut self,
        e: &mut E,
        index: usize,
        reg: GuestReg,
    ) -> HostReg {
        let host = self.acquire_arg(e, index);
        if let Some(pinned) = Self::pinned(reg) {
            e.mov(host, pinned);
        } else if let Some(j) = self.find_cached(reg) {
            e.mov(host, self.slots[j].host);
        } else if let Some(value) = self.consts.get(reg) {
            e.mov_imm(host, value);
        } else {
            e.load_ctx(host, reg);
        }
        host
    }

    /// Claim the helper return register after a call.
    pub fn claim_return<E: Emitter + ?Sized>(&mut self, e: &mut E) -> HostReg {
        self.acquire_arg(e, 0)
    }

    /// Return a temporary to the free pool.
    pub fn release(&mut self, host: HostReg) {
        let i = self.slot_of(host);
        let slot = &mut self.slots[i];
        assert!(
            slot.usage == SlotUse::Temp,
            "releasing {host:?}, which is not a temporary ({:?})",
            slot.usage
        );
        slot.usage = SlotUse::Free;
        slot.locked = false;
    }

    /// Instruction boundary: drop all locks and free leftover temporaries.
    pub fn unlock_all(&mut self) {
        for slot in &mut self.slots {
            slot.locked = false;
            if slot.usage == SlotUse::Temp {
                slot.usage = SlotUse::Free;
            }
        }
    }

    /// Write every dirty cached register and pending constant back to canonical storage.
    /// Mappings stay valid and become clean.
    pub fn flush<E: Emitter + ?Sized>(&mut self, e: &mut E) {
        for slot in &mut self.slots {
            if let SlotUse::Cached(reg) = slot.usage {
                if slot.dirty {
                    e.store_ctx(reg, slot.host);
                    slot.dirty = false;
                }
            }
        }
        for reg in GuestReg::all() {
            if self.consts.dirty & bit(reg) != 0 {
                e.store_ctx_imm(reg, self.consts.values[reg.index()]);
            }
        }
        self.consts.dirty = 0;
        for (reg, host) in STATIC_MAP {
            e.store_ctx(reg, host);
        }
    }

    /// Drop every mapping, temporary and constant without write-back, then reload pinned
    /// registers. Used after control returns from code that may have changed guest state.
    pub fn invalidate_all<E: Emitter + ?Sized>(&mut self, e: &mut E) {
        self.reset();
        for (reg, host) in STATIC_MAP {
            e.load_ctx(host, reg);
        }
    }

    /// Record that `reg` now holds `value`, known at translation time.
    ///
    /// Any cached copy of `reg` is dropped. Without constant propagation the value is
    /// materialized immediately instead.
    pub fn set_const<E: Emitter + ?Sized>(&mut self, e: &mut E, reg: GuestReg, value: u32) {
        assert!(
            Self::pinned(reg).is_none(),
            "constant assigned to pinned register {reg:?}"
        );
        if !self.propagate {
            let host = self.acquire(e, reg, Access::Write);
            e.mov_imm(host, value);
            return;
        }
        if let Some(i) = self.find_cached(reg) {
            assert!(
                !self.slots[i].locked,
                "constant assigned to {reg:?} while its host register is locked"
            );
            let slot = &mut self.slots[i];
            slot.usage = SlotUse::Free;
            slot.dirty = false;
        }
        self.consts.known |= bit(reg);
        self.consts.dirty |= bit(reg);
        self.consts.values[reg.index()] = value;
    }

    pub fn get_const(&self, reg: GuestReg) -> Option<u32> {
        self.consts.get(reg)
    }

    /// Whether the constant for `reg` still has to be written to canonical storage.
    pub fn const_is_dirty(&self, reg: GuestReg) -> bool {
        self.consts.dirty & bit(reg) != 0
    }

    /// Host register currently caching `reg`, if any.
    pub fn cached(&self, reg: GuestReg) -> Option<HostReg> {
        Self::pinned(reg).or_else(|| self.find_cached(reg).map(|i| self.slots[i].host))
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotView> + '_ {
        self.slots.iter().map(|slot| SlotView {
            host: slot.host,
            guest: match slot.usage {
                SlotUse::Cached(reg) => Some(reg),
                _ => None,
            },
            temp: slot.usage == SlotUse::Temp,
            dirty: slot.dirty,
            locked: slot.locked,
        })
    }
}
