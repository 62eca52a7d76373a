//! Translation cache.
//!
//! All host code lives in one [`CodeArena`]. The utility stubs sit at the start of the arena and
//! each configured buffer owns a fixed window after them. A buffer is filled with a bump pointer
//! and only ever emptied as a whole ([`TranslationCache::flush`]); invalidating a single block
//! releases its bookkeeping and neutralizes its entry points but does not reclaim code bytes.
//!
//! Per buffer the cache keeps:
//!
//! - a fixed table of block descriptors with a free-slot list,
//! - a PC hash table whose chains thread through the block entries,
//! - a pool of branch links. A link records a jump site in some block that targets a guest PC.
//!   Resolved links hang off the entry they jump to; unresolved ones wait on a per-buffer list
//!   until an entry for their target appears.
//!
//! Links never cross buffers, so flushing one buffer cannot leave a dangling jump in another.

use std::ops::Range;

use tracing::{debug, warn};

use crate::config::{JitConfig, TcacheConfig};
use crate::emit::{patch_jump_bytes, CodeEmitter};
use crate::error::TranslateError;
use crate::guest::GuestReg;
use crate::host::HostOp;
use crate::translate::ENTRY_STUB_LEN;

/// Byte offset into the code arena.
pub type CodeAddr = u32;

/// Backing store for all translated code.
#[derive(Debug, Clone)]
pub struct CodeArena {
    bytes: Vec<u8>,
}

impl CodeArena {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn write(&mut self, at: CodeAddr, data: &[u8]) {
        let at = at as usize;
        self.bytes[at..at + data.len()].copy_from_slice(data);
    }

    /// Retarget the jump at `site`.
    pub fn patch_jump(&mut self, site: CodeAddr, target: CodeAddr) {
        patch_jump_bytes(&mut self.bytes, site, target);
    }

    /// Overwrite the entry prologue at `at` with a stub that stores `pc` and jumps to
    /// `dispatcher`.
    ///
    /// Only entry points may be overwritten: the stub fits inside the prologue, so code that is
    /// still executing further into the block is left intact.
    pub(crate) fn overwrite_entry(&mut self, at: CodeAddr, pc: u32, dispatcher: CodeAddr) {
        let mut stub = Vec::with_capacity(ENTRY_STUB_LEN);
        HostOp::StoreCtxImm {
            reg: GuestReg::PC,
            imm: pc,
        }
        .encode(&mut stub);
        HostOp::Jump { target: dispatcher }.encode(&mut stub);
        debug_assert_eq!(stub.len(), ENTRY_STUB_LEN);
        self.write(at, &stub);
    }
}

/// Identifies a block descriptor: buffer index and slot in its descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub tcache: usize,
    pub slot: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct EntryRef {
    slot: u32,
    index: u32,
}

type LinkId = u32;

#[derive(Clone, Debug, Default)]
struct BlockEntry {
    pc: u32,
    code: CodeAddr,
    hash_next: Option<EntryRef>,
    /// Head of the resolved links jumping here.
    links: Option<LinkId>,
    hashed: bool,
}

/// Descriptor of a translated block.
#[derive(Clone, Debug, Default)]
pub struct BlockDesc {
    /// Guest address of the first instruction.
    pub pc: u32,
    /// Guest bytes covered by instructions.
    pub size_nolit: u32,
    /// Guest bytes covered by instructions and the inlined literal pool.
    pub size: u32,
    pub code: Range<CodeAddr>,
    entries: Vec<BlockEntry>,
    out_links: Vec<LinkId>,
    live: bool,
}

impl BlockDesc {
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr.wrapping_sub(self.pc) < self.size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkOwner {
    Free,
    Unresolved,
    Entry(EntryRef),
}

#[derive(Clone, Copy, Debug)]
struct BlockLink {
    target_pc: u32,
    site: CodeAddr,
    owner: LinkOwner,
    prev: Option<LinkId>,
    next: Option<LinkId>,
}

/// Outcome of [`TranslationCache::link_branch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The site now jumps straight to the target block.
    Linked,
    /// No block for the target yet; the site is patched when one is added.
    Pending,
    /// The site keeps going through the dispatcher.
    Dispatcher,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Populated,
    /// A translation did not fit; the buffer is flushed before the next one.
    Overflowing,
}

/// Guest range and descriptor of a block that was just invalidated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemovedBlock {
    pub pc: u32,
    pub size: u32,
}

/// Geometry of a block about to be registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewBlock {
    pub pc: u32,
    pub end_pc: u32,
    pub end_literals: u32,
    pub code: Range<CodeAddr>,
}

/// One translation cache buffer.
#[derive(Debug)]
pub struct CacheBuffer {
    config: TcacheConfig,
    max_block_entries: usize,
    code: Range<CodeAddr>,
    used: CodeAddr,
    blocks: Vec<BlockDesc>,
    free_blocks: Vec<u32>,
    hash: Vec<Option<EntryRef>>,
    links: Vec<BlockLink>,
    free_links: Option<LinkId>,
    unresolved: Option<LinkId>,
    overflowing: bool,
}

impl CacheBuffer {
    fn new(config: TcacheConfig, max_block_entries: usize, code: Range<CodeAddr>) -> Self {
        let mut buf = Self {
            config,
            max_block_entries,
            used: code.start,
            code,
            blocks: vec![BlockDesc::default(); config.max_blocks],
            free_blocks: Vec::with_capacity(config.max_blocks),
            hash: vec![None; config.hash_size],
            links: Vec::with_capacity(config.max_links),
            free_links: None,
            unresolved: None,
            overflowing: false,
        };
        buf.reset();
        buf
    }

    fn reset(&mut self) {
        self.used = self.code.start;
        self.blocks.fill(BlockDesc::default());
        self.free_blocks.clear();
        self.free_blocks.extend((0..self.config.max_blocks as u32).rev());
        self.hash.fill(None);
        self.links.clear();
        self.free_links = None;
        self.unresolved = None;
        for id in 0..self.config.max_links as LinkId {
            self.links.push(BlockLink {
                target_pc: 0,
                site: 0,
                owner: LinkOwner::Free,
                prev: None,
                next: None,
            });
            self.link_push(id, LinkOwner::Free);
        }
        self.overflowing = false;
    }

    pub fn state(&self) -> BufferState {
        if self.overflowing {
            BufferState::Overflowing
        } else if self.used == self.code.start && self.live_blocks() == 0 {
            BufferState::Empty
        } else {
            BufferState::Populated
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.config.max_blocks - self.free_blocks.len()
    }

    /// Code bytes still available.
    pub fn free_bytes(&self) -> u32 {
        self.code.end - self.used
    }

    pub fn code_range(&self) -> Range<CodeAddr> {
        self.code.clone()
    }

    pub fn can_add_block(&self) -> bool {
        !self.free_blocks.is_empty()
    }

    #[inline]
    fn bucket(&self, pc: u32) -> usize {
        (((pc >> 20) ^ (pc >> 2)) as usize) & (self.hash.len() - 1)
    }

    fn entry(&self, r: EntryRef) -> &BlockEntry {
        &self.blocks[r.slot as usize].entries[r.index as usize]
    }

    fn entry_mut(&mut self, r: EntryRef) -> &mut BlockEntry {
        &mut self.blocks[r.slot as usize].entries[r.index as usize]
    }

    fn find_entry(&self, pc: u32) -> Option<EntryRef> {
        let mut cur = self.hash[self.bucket(pc)];
        while let Some(r) = cur {
            let entry = self.entry(r);
            if entry.pc == pc {
                return Some(r);
            }
            cur = entry.hash_next;
        }
        None
    }

    pub fn lookup(&self, pc: u32) -> Option<CodeAddr> {
        self.find_entry(pc).map(|r| self.entry(r).code)
    }

    pub fn block(&self, slot: usize) -> Option<&BlockDesc> {
        self.blocks.get(slot).filter(|b| b.live)
    }

    fn unhash(&mut self, r: EntryRef) {
        let bucket = self.bucket(self.entry(r).pc);
        let next = self.entry(r).hash_next;
        if self.hash[bucket] == Some(r) {
            self.hash[bucket] = next;
        } else {
            let mut cur = self.hash[bucket];
            while let Some(c) = cur {
                let after = self.entry(c).hash_next;
                if after == Some(r) {
                    self.entry_mut(c).hash_next = next;
                    break;
                }
                cur = after;
            }
        }
        let entry = self.entry_mut(r);
        entry.hash_next = None;
        entry.hashed = false;
    }

    fn head_mut(&mut self, owner: LinkOwner) -> &mut Option<LinkId> {
        match owner {
            LinkOwner::Free => &mut self.free_links,
            LinkOwner::Unresolved => &mut self.unresolved,
            LinkOwner::Entry(r) => &mut self.entry_mut(r).links,
        }
    }

    fn link_push(&mut self, id: LinkId, owner: LinkOwner) {
        let head = *self.head_mut(owner);
        let link = &mut self.links[id as usize];
        link.owner = owner;
        link.prev = None;
        link.next = head;
        if let Some(h) = head {
            self.links[h as usize].prev = Some(id);
        }
        *self.head_mut(owner) = Some(id);
    }

    fn link_detach(&mut self, id: LinkId) {
        let BlockLink {
            owner, prev, next, ..
        } = self.links[id as usize];
        match prev {
            Some(p) => self.links[p as usize].next = next,
            None => *self.head_mut(owner) = next,
        }
        if let Some(n) = next {
            self.links[n as usize].prev = prev;
        }
    }

    fn link_alloc(&mut self) -> Option<LinkId> {
        let id = self.free_links?;
        self.link_detach(id);
        Some(id)
    }

    /// Move every link on `from` to `to`, patching the jump sites when `to` is an entry.
    fn move_links(&mut self, arena: &mut CodeArena, from: LinkOwner, to: LinkOwner) {
        let target = match to {
            LinkOwner::Entry(r) => Some(self.entry(r).code),
            _ => None,
        };
        while let Some(id) = *self.head_mut(from) {
            self.link_detach(id);
            self.link_push(id, to);
            if let Some(code) = target {
                arena.patch_jump(self.links[id as usize].site, code);
            }
        }
    }

    fn add_block(&mut self, block: &NewBlock) -> Option<usize> {
        let slot = self.free_blocks.pop()? as usize;
        let desc = &mut self.blocks[slot];
        desc.pc = block.pc;
        desc.size_nolit = block.end_pc.wrapping_sub(block.pc);
        desc.size = block.end_literals.wrapping_sub(block.pc);
        desc.code = block.code.clone();
        desc.entries.clear();
        desc.out_links.clear();
        desc.live = true;
        Some(slot)
    }

    fn add_entry(&mut self, arena: &mut CodeArena, slot: usize, pc: u32, code: CodeAddr) -> bool {
        let desc = &mut self.blocks[slot];
        if desc.entries.len() >= self.max_block_entries {
            return false;
        }
        let r = EntryRef {
            slot: slot as u32,
            index: desc.entries.len() as u32,
        };
        desc.entries.push(BlockEntry {
            pc,
            code,
            hash_next: None,
            links: None,
            hashed: true,
        });

        // A newer translation of the same PC takes over lookups and incoming links.
        if let Some(old) = self.find_entry(pc) {
            self.unhash(old);
            self.move_links(arena, LinkOwner::Entry(old), LinkOwner::Entry(r));
        }
        let bucket = self.bucket(pc);
        self.entry_mut(r).hash_next = self.hash[bucket];
        self.hash[bucket] = Some(r);

        let mut cur = self.unresolved;
        while let Some(id) = cur {
            let link = self.links[id as usize];
            cur = link.next;
            if link.target_pc == pc {
                self.link_detach(id);
                self.link_push(id, LinkOwner::Entry(r));
                arena.patch_jump(link.site, code);
            }
        }
        true
    }

    fn link_branch(
        &mut self,
        arena: &mut CodeArena,
        slot: usize,
        site: CodeAddr,
        target_pc: u32,
    ) -> LinkOutcome {
        let Some(id) = self.link_alloc() else {
            warn!(
                target_pc = format_args!("{target_pc:#010x}"),
                "block link pool exhausted; branch stays on the dispatcher"
            );
            return LinkOutcome::Dispatcher;
        };
        let link = &mut self.links[id as usize];
        link.target_pc = target_pc;
        link.site = site;
        self.blocks[slot].out_links.push(id);
        match self.find_entry(target_pc) {
            Some(r) => {
                self.link_push(id, LinkOwner::Entry(r));
                arena.patch_jump(site, self.entry(r).code);
                LinkOutcome::Linked
            }
            None => {
                self.link_push(id, LinkOwner::Unresolved);
                LinkOutcome::Pending
            }
        }
    }

    fn invalidate_block(
        &mut self,
        arena: &mut CodeArena,
        slot: usize,
        dispatcher: CodeAddr,
    ) -> Option<RemovedBlock> {
        if !self.blocks.get(slot)?.live {
            return None;
        }
        for index in 0..self.blocks[slot].entries.len() {
            let r = EntryRef {
                slot: slot as u32,
                index: index as u32,
            };
            let BlockEntry {
                pc, code, hashed, ..
            } = *self.entry(r);
            if hashed {
                self.unhash(r);
            }
            // Sites jumping here now land on the stub and go through the dispatcher; they are
            // re-linked if the PC gets translated again.
            arena.overwrite_entry(code, pc, dispatcher);
            self.move_links(arena, LinkOwner::Entry(r), LinkOwner::Unresolved);
        }
        for id in std::mem::take(&mut self.blocks[slot].out_links) {
            self.link_detach(id);
            self.link_push(id, LinkOwner::Free);
        }
        let desc = std::mem::take(&mut self.blocks[slot]);
        self.free_blocks.push(slot as u32);
        Some(RemovedBlock {
            pc: desc.pc,
            size: desc.size,
        })
    }
}

/// The code arena and every buffer carved out of it.
#[derive(Debug)]
pub struct TranslationCache {
    arena: CodeArena,
    stubs: Range<CodeAddr>,
    buffers: Vec<CacheBuffer>,
}

impl TranslationCache {
    /// Lay out `stub_bytes` of utility code followed by every configured buffer.
    pub fn new(config: &JitConfig, stub_bytes: u32) -> Self {
        let mut at = stub_bytes;
        let buffers = config
            .buffers
            .iter()
            .map(|cfg| {
                let range = at..at + cfg.code_bytes;
                at = range.end;
                CacheBuffer::new(*cfg, config.max_block_entries, range)
            })
            .collect();
        Self {
            arena: CodeArena::new(at as usize),
            stubs: 0..stub_bytes,
            buffers,
        }
    }

    pub fn arena(&self) -> &CodeArena {
        &self.arena
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, tcache: usize) -> &CacheBuffer {
        &self.buffers[tcache]
    }

    /// Emitter over the utility-stub window.
    pub fn stub_emitter(&mut self) -> CodeEmitter<'_> {
        CodeEmitter::new(&mut self.arena, self.stubs.start, self.stubs.end)
    }

    /// Emitter over the unused tail of buffer `tcache`. Nothing is reserved until
    /// [`TranslationCache::commit_code`].
    pub fn emitter(&mut self, tcache: usize) -> CodeEmitter<'_> {
        let buf = &self.buffers[tcache];
        CodeEmitter::new(&mut self.arena, buf.used, buf.code.end)
    }

    pub fn commit_code(&mut self, tcache: usize, end: CodeAddr) {
        let buf = &mut self.buffers[tcache];
        debug_assert!(buf.used <= end && end <= buf.code.end);
        buf.used = end;
    }

    pub fn mark_overflowing(&mut self, tcache: usize) {
        self.buffers[tcache].overflowing = true;
    }

    pub fn lookup(&self, tcache: usize, pc: u32) -> Option<CodeAddr> {
        self.buffers.get(tcache)?.lookup(pc)
    }

    pub fn block(&self, block: BlockRef) -> Option<&BlockDesc> {
        self.buffers.get(block.tcache)?.block(block.slot)
    }

    /// Register a block and its first entry point at `block.code.start`.
    pub fn add_block(&mut self, tcache: usize, block: &NewBlock) -> Result<BlockRef, TranslateError> {
        let Self { arena, buffers, .. } = self;
        let buf = &mut buffers[tcache];
        let slot = buf
            .add_block(block)
            .ok_or(TranslateError::DescriptorTableFull { tcache })?;
        buf.add_entry(arena, slot, block.pc, block.code.start);
        Ok(BlockRef { tcache, slot })
    }

    /// Add a further entry point to `block`. Returns false when the block has no entry slot
    /// left.
    pub fn add_entry(&mut self, block: BlockRef, pc: u32, code: CodeAddr) -> bool {
        let Self { arena, buffers, .. } = self;
        buffers[block.tcache].add_entry(arena, block.slot, pc, code)
    }

    /// Record the branch at `site` in `block` towards guest `target_pc`.
    pub fn link_branch(&mut self, block: BlockRef, site: CodeAddr, target_pc: u32) -> LinkOutcome {
        let Self { arena, buffers, .. } = self;
        buffers[block.tcache].link_branch(arena, block.slot, site, target_pc)
    }

    /// Drop `block` from lookups and unlink it. Its entry points are rewritten to go through
    /// `dispatcher`.
    pub fn invalidate_block(&mut self, block: BlockRef, dispatcher: CodeAddr) -> Option<RemovedBlock> {
        let Self { arena, buffers, .. } = self;
        let removed = buffers
            .get_mut(block.tcache)?
            .invalidate_block(arena, block.slot, dispatcher)?;
        debug!(
            tcache = block.tcache,
            pc = format_args!("{:#010x}", removed.pc),
            "invalidated block"
        );
        Some(removed)
    }

    /// Empty buffer `tcache`.
    pub fn flush(&mut self, tcache: usize) {
        let buf = &mut self.buffers[tcache];
        debug!(tcache, blocks = buf.live_blocks(), "flushing translation cache buffer");
        buf.reset();
    }

    pub fn flush_all(&mut self) {
        for tcache in 0..self.buffers.len() {
            self.flush(tcache);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::Emitter;
    use crate::host::Cond;

    fn config() -> JitConfig {
        JitConfig {
            buffers: vec![TcacheConfig {
                code_bytes: 1024,
                max_blocks: 4,
                max_links: 4,
                hash_size: 4,
            }],
            ..JitConfig::default()
        }
    }

    /// Emit a fake block: a prologue-sized entry followed by one external jump. Returns the
    /// block geometry and the jump site.
    fn emit_block(tc: &mut TranslationCache, pc: u32, dispatcher: CodeAddr) -> (NewBlock, CodeAddr) {
        let mut e = tc.emitter(0);
        let start = e.position();
        e.store_ctx_imm(GuestReg::PC, pc);
        e.cmp_imm(crate::regcache::CYCLES_REG, 0);
        e.jump_cond(Cond::Le, 0);
        e.store_ctx_imm(GuestReg::PC, pc + 0x100);
        let site = e.jump(dispatcher);
        let end = e.position();
        tc.commit_code(0, end);
        (
            NewBlock {
                pc,
                end_pc: pc + 8,
                end_literals: pc + 8,
                code: start..end,
            },
            site,
        )
    }

    fn jump_target(tc: &TranslationCache, site: CodeAddr) -> CodeAddr {
        match HostOp::decode(tc.arena().bytes(), site) {
            Ok((HostOp::Jump { target }, _)) => target,
            other => panic!("expected a jump at {site:#x}, got {other:?}"),
        }
    }

    #[test]
    fn lookup_finds_added_block() {
        let mut tc = TranslationCache::new(&config(), 16);
        assert_eq!(tc.buffer(0).state(), BufferState::Empty);
        let (nb, _) = emit_block(&mut tc, 0x0600_0000, 0);
        let b = tc.add_block(0, &nb).unwrap();
        assert_eq!(tc.lookup(0, 0x0600_0000), Some(nb.code.start));
        assert_eq!(tc.lookup(0, 0x0600_0002), None);
        assert_eq!(tc.block(b).unwrap().size, 8);
        assert_eq!(tc.buffer(0).state(), BufferState::Populated);
    }

    #[test]
    fn descriptor_table_full() {
        let mut tc = TranslationCache::new(&config(), 16);
        for i in 0..4 {
            let (nb, _) = emit_block(&mut tc, 0x1000 + i * 0x10, 0);
            tc.add_block(0, &nb).unwrap();
        }
        let (nb, _) = emit_block(&mut tc, 0x2000, 0);
        assert_eq!(
            tc.add_block(0, &nb),
            Err(TranslateError::DescriptorTableFull { tcache: 0 })
        );
    }

    #[test]
    fn pending_link_resolves_when_target_appears() {
        let mut tc = TranslationCache::new(&config(), 16);
        let (a, site) = emit_block(&mut tc, 0x1000, 0);
        let ba = tc.add_block(0, &a).unwrap();
        assert_eq!(tc.link_branch(ba, site, 0x1100), LinkOutcome::Pending);
        assert_eq!(jump_target(&tc, site), 0);

        let (b, _) = emit_block(&mut tc, 0x1100, 0);
        tc.add_block(0, &b).unwrap();
        assert_eq!(jump_target(&tc, site), b.code.start);
    }

    #[test]
    fn invalidation_unlinks_and_stubs_entries() {
        let mut tc = TranslationCache::new(&config(), 16);
        let (b, _) = emit_block(&mut tc, 0x1100, 0);
        let bb = tc.add_block(0, &b).unwrap();
        let (a, site) = emit_block(&mut tc, 0x1000, 0);
        let ba = tc.add_block(0, &a).unwrap();
        assert_eq!(tc.link_branch(ba, site, 0x1100), LinkOutcome::Linked);
        assert_eq!(jump_target(&tc, site), b.code.start);

        let removed = tc.invalidate_block(bb, 0).unwrap();
        assert_eq!(removed.pc, 0x1100);
        assert_eq!(tc.lookup(0, 0x1100), None);
        assert!(tc.block(bb).is_none());
        let (op, len) = HostOp::decode(tc.arena().bytes(), b.code.start).unwrap();
        assert_eq!(
            op,
            HostOp::StoreCtxImm {
                reg: GuestReg::PC,
                imm: 0x1100
            }
        );
        assert_eq!(jump_target(&tc, b.code.start + len as CodeAddr), 0);

        // Retranslating re-links the waiting site.
        let (b2, _) = emit_block(&mut tc, 0x1100, 0);
        tc.add_block(0, &b2).unwrap();
        assert_eq!(jump_target(&tc, site), b2.code.start);
    }

    #[test]
    fn exhausted_link_pool_keeps_dispatcher() {
        let mut tc = TranslationCache::new(&config(), 16);
        let (a, site) = emit_block(&mut tc, 0x1000, 0);
        let ba = tc.add_block(0, &a).unwrap();
        for i in 0..4 {
            assert_eq!(tc.link_branch(ba, site, 0x3000 + i * 2), LinkOutcome::Pending);
        }
        assert_eq!(tc.link_branch(ba, site, 0x4000), LinkOutcome::Dispatcher);
        // Freeing the block returns its links to the pool.
        tc.invalidate_block(ba, 0).unwrap();
        let (a, site) = emit_block(&mut tc, 0x1000, 0);
        let ba = tc.add_block(0, &a).unwrap();
        assert_eq!(tc.link_branch(ba, site, 0x4000), LinkOutcome::Pending);
    }

    #[test]
    fn newer_entry_overrides_older_one() {
        let mut tc = TranslationCache::new(&config(), 16);
        let (a, _) = emit_block(&mut tc, 0x1000, 0);
        let ba = tc.add_block(0, &a).unwrap();
        let (b, _) = emit_block(&mut tc, 0x0ff0, 0);
        let bb = tc.add_block(0, &b).unwrap();
        assert!(tc.add_entry(bb, 0x1000, b.code.start + 18));
        assert_eq!(tc.lookup(0, 0x1000), Some(b.code.start + 18));

        // Dropping the older block must not disturb the newer entry.
        tc.invalidate_block(ba, 0).unwrap();
        assert_eq!(tc.lookup(0, 0x1000), Some(b.code.start + 18));
    }

    #[test]
    fn flush_empties_buffer() {
        let mut tc = TranslationCache::new(&config(), 16);
        let (a, _) = emit_block(&mut tc, 0x1000, 0);
        tc.add_block(0, &a).unwrap();
        tc.mark_overflowing(0);
        assert_eq!(tc.buffer(0).state(), BufferState::Overflowing);
        tc.flush(0);
        assert_eq!(tc.buffer(0).state(), BufferState::Empty);
        assert_eq!(tc.lookup(0, 0x1000), None);
        assert_eq!(tc.buffer(0).free_bytes(), 1024);
    }
}
