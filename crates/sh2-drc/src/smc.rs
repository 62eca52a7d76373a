//! Self-modifying code tracking.
//!
//! Every writable code region keeps a bitmap with one bit per guest halfword that is covered by
//! some live block (instructions or inlined literals), and a page index mapping each
//! `inval_page_size` page to the blocks overlapping it. Guest stores test the bitmap first, so a
//! write to plain data costs one bit test.

use crate::config::{CodeRegion, JitConfig};
use crate::tcache::BlockRef;

/// A tracked block, in region offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackedBlock {
    pub block: BlockRef,
    pub start: u32,
    /// End of the instructions.
    pub end_nolit: u32,
    /// End of the covered range, literals included.
    pub end: u32,
}

impl TrackedBlock {
    fn overlaps(&self, from: u32, to: u32) -> bool {
        self.start < to && from < self.end
    }
}

/// Blocks hit by a guest write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteHit {
    pub blocks: Vec<BlockRef>,
    /// The write landed in the literal pool of at least one block.
    pub literal: bool,
}

#[derive(Debug)]
struct RegionIndex {
    size: u32,
    marks: Vec<u64>,
    pages: Vec<Vec<TrackedBlock>>,
    literal_cooldown: u32,
}

impl RegionIndex {
    fn new(size: u32, page_shift: u32) -> Self {
        let halfwords = (size as usize).div_ceil(2);
        let pages = (size as usize).div_ceil(1 << page_shift);
        Self {
            size,
            marks: vec![0; halfwords.div_ceil(64)],
            pages: vec![Vec::new(); pages],
            literal_cooldown: 0,
        }
    }

    #[inline]
    fn marked(&self, offset: u32) -> bool {
        let hw = (offset >> 1) as usize;
        self.marks
            .get(hw / 64)
            .is_some_and(|word| word & (1 << (hw % 64)) != 0)
    }

    fn set_marks(&mut self, from: u32, to: u32, on: bool) {
        for hw in (from >> 1)..to.div_ceil(2) {
            let (word, bit) = ((hw / 64) as usize, hw % 64);
            if on {
                self.marks[word] |= 1 << bit;
            } else {
                self.marks[word] &= !(1 << bit);
            }
        }
    }

    fn page_range(&self, from: u32, to: u32, shift: u32) -> std::ops::RangeInclusive<usize> {
        (from >> shift) as usize..=((to - 1) >> shift) as usize
    }
}

/// Per-region halfword marks and page-to-block index.
#[derive(Debug)]
pub struct SmcIndex {
    page_shift: u32,
    regions: Vec<Option<RegionIndex>>,
}

impl SmcIndex {
    pub fn new(config: &JitConfig) -> Self {
        let page_shift = config.inval_page_size.trailing_zeros();
        let regions = config
            .regions
            .iter()
            .map(|r| r.smc.then(|| RegionIndex::new(region_size(r), page_shift)))
            .collect();
        Self {
            page_shift,
            regions,
        }
    }

    /// Start tracking `block`, covering guest `[pc, end_literals)` of `region`.
    pub fn track(
        &mut self,
        region_index: usize,
        region: &CodeRegion,
        block: BlockRef,
        pc: u32,
        end_pc: u32,
        end_literals: u32,
    ) {
        let shift = self.page_shift;
        let Some(Some(index)) = self.regions.get_mut(region_index) else {
            return;
        };
        let start = region.offset(pc);
        let end = start
            .saturating_add(end_literals.wrapping_sub(pc))
            .min(index.size);
        let end_nolit = start.saturating_add(end_pc.wrapping_sub(pc)).min(end);
        if end <= start {
            return;
        }
        let tracked = TrackedBlock {
            block,
            start,
            end_nolit,
            end,
        };
        for page in index.page_range(start, end, shift) {
            index.pages[page].push(tracked);
        }
        index.set_marks(start, end, true);
    }

    /// Whether translated code covers `offset` of region `region_index`.
    pub fn has_code(&self, region_index: usize, offset: u32) -> bool {
        matches!(self.regions.get(region_index), Some(Some(index)) if index.marked(offset))
    }

    /// Handle a guest write to `offset` of region `region_index`: untrack every block covering
    /// it and return them for invalidation. A hit in a literal pool starts the region's literal
    /// cooldown.
    pub fn on_write(&mut self, region_index: usize, offset: u32, literal_cooldown: u32) -> WriteHit {
        let shift = self.page_shift;
        let mut hit = WriteHit::default();
        let Some(Some(index)) = self.regions.get_mut(region_index) else {
            return hit;
        };
        if !index.marked(offset) {
            return hit;
        }

        let page = (offset >> shift) as usize;
        let victims: Vec<TrackedBlock> = index.pages[page]
            .iter()
            .filter(|t| t.start <= offset && offset < t.end)
            .copied()
            .collect();
        if victims.is_empty() {
            return hit;
        }

        let mut from = u32::MAX;
        let mut to = 0;
        for victim in &victims {
            for p in index.page_range(victim.start, victim.end, shift) {
                index.pages[p].retain(|t| t.block != victim.block);
            }
            if offset >= victim.end_nolit {
                hit.literal = true;
            }
            from = from.min(victim.start);
            to = to.max(victim.end);
            hit.blocks.push(victim.block);
        }
        if hit.literal {
            index.literal_cooldown = literal_cooldown;
        }

        // Clear the victims' marks, then restore those of neighbours that overlap them.
        index.set_marks(from, to, false);
        let mut survivors = Vec::new();
        for p in index.page_range(from, to, shift) {
            survivors.extend(index.pages[p].iter().filter(|t| t.overlaps(from, to)).copied());
        }
        for t in survivors {
            index.set_marks(t.start.max(from), t.end.min(to), true);
        }
        hit
    }

    /// Consume one translation pass of the literal cooldown. Returns whether literals may be
    /// inlined for a block in region `region_index`.
    pub fn literals_enabled(&mut self, region_index: usize) -> bool {
        match self.regions.get_mut(region_index) {
            Some(Some(index)) if index.literal_cooldown > 0 => {
                index.literal_cooldown -= 1;
                false
            }
            _ => true,
        }
    }

    /// Stop tracking every block of buffer `tcache`.
    pub fn forget_buffer(&mut self, tcache: usize) {
        for index in self.regions.iter_mut().flatten() {
            index.marks.fill(0);
            let mut kept = Vec::new();
            for page in &mut index.pages {
                page.retain(|t| t.block.tcache != tcache);
                kept.extend(page.iter().copied());
            }
            for t in kept {
                index.set_marks(t.start, t.end, true);
            }
        }
    }

    pub fn clear(&mut self) {
        for index in self.regions.iter_mut().flatten() {
            index.marks.fill(0);
            index.pages.iter_mut().for_each(Vec::clear);
            index.literal_cooldown = 0;
        }
    }
}

/// Tracked bytes of a region. Regions wider than the 32-bit offset space are clamped.
fn region_size(region: &CodeRegion) -> u32 {
    u32::try_from(region.size()).unwrap_or(u32::MAX)
}
