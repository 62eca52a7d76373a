use crate::error::ConfigError;

/// Size and table capacities of one translation cache buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcacheConfig {
    /// Bytes of host code the buffer can hold before it must be flushed.
    pub code_bytes: u32,
    /// Maximum number of live block descriptors.
    pub max_blocks: usize,
    /// Size of the block-link pool shared by every block in the buffer.
    pub max_links: usize,
    /// Number of PC hash buckets. Must be a power of two.
    pub hash_size: usize,
}

/// A window of the guest address space backed by one kind of memory.
///
/// An address `a` belongs to the region when `a & match_mask == match_value`. `offset_mask`
/// strips mirror and cache-through bits so that every alias of a location maps to the same
/// offset for SMC tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeRegion {
    pub name: &'static str,
    pub match_mask: u32,
    pub match_value: u32,
    pub offset_mask: u32,
    /// Index into [`JitConfig::buffers`] receiving blocks translated from this region.
    pub tcache: usize,
    /// Writable memory: guest stores must be checked against translated code.
    pub smc: bool,
}

impl CodeRegion {
    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        addr & self.match_mask == self.match_value
    }

    #[inline]
    pub fn offset(&self, addr: u32) -> u32 {
        addr & self.offset_mask
    }

    /// Bytes covered by the region once mirrors are folded.
    #[inline]
    pub fn size(&self) -> u64 {
        u64::from(self.offset_mask) + 1
    }
}

/// Recompiler configuration.
#[derive(Clone, Debug)]
pub struct JitConfig {
    /// Maximum guest instructions scanned into one block (delay slots excluded).
    pub max_block_insns: usize,
    /// Maximum PC-relative literal loads tracked per block.
    pub max_literals: usize,
    /// Maximum distinct in-block branch targets per block.
    pub max_local_branches: usize,
    /// Maximum entry points per block, including the block start.
    pub max_block_entries: usize,
    /// How far past the last instruction a literal pool may extend and still be covered by the
    /// block (and therefore inlined as a constant).
    pub max_literal_offset: u32,

    /// Fold immediates and inlined literals at translation time.
    pub propagate_constants: bool,
    /// Patch branches between blocks of the same buffer into direct jumps.
    pub link_branches: bool,
    /// Emit a tracing hook at every block entry.
    pub trace_block_entries: bool,

    /// Translation passes in a region during which literal inlining stays disabled after a
    /// write hit a literal pool in that region.
    pub literal_cooldown: u32,
    /// Granularity of the page-to-blocks index used for SMC invalidation. Power of two.
    pub inval_page_size: u32,

    pub buffers: Vec<TcacheConfig>,
    /// Searched in order; the first matching region wins.
    pub regions: Vec<CodeRegion>,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_block_insns: 128,
            max_literals: 32,
            max_local_branches: 32,
            max_block_entries: 16,
            max_literal_offset: 64,
            propagate_constants: true,
            link_branches: true,
            trace_block_entries: false,
            literal_cooldown: 3,
            inval_page_size: 0x100,
            buffers: vec![
                // ROM and SDRAM.
                TcacheConfig {
                    code_bytes: 3 << 20,
                    max_blocks: 4096,
                    max_links: 4096,
                    hash_size: 0x1000,
                },
                // Boot ROM and on-chip data array.
                TcacheConfig {
                    code_bytes: 256 << 10,
                    max_blocks: 256,
                    max_links: 256,
                    hash_size: 0x100,
                },
            ],
            regions: default_regions(),
        }
    }
}

fn default_regions() -> Vec<CodeRegion> {
    vec![
        CodeRegion {
            name: "bios",
            match_mask: !0x7ff,
            match_value: 0,
            offset_mask: 0x7ff,
            tcache: 1,
            smc: false,
        },
        CodeRegion {
            name: "data-array",
            match_mask: 0xffff_f000,
            match_value: 0xc000_0000,
            offset_mask: 0xfff,
            tcache: 1,
            smc: true,
        },
        CodeRegion {
            name: "sdram",
            match_mask: 0xc600_0000,
            match_value: 0x0600_0000,
            offset_mask: 0x3_ffff,
            tcache: 0,
            smc: true,
        },
        CodeRegion {
            name: "rom",
            match_mask: 0xc600_0000,
            match_value: 0x0200_0000,
            offset_mask: 0x3f_ffff,
            tcache: 0,
            smc: false,
        },
    ]
}

/// Smallest buffer that still fits a worst-case block.
pub const MIN_CODE_BYTES: u32 = 1024;

impl JitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn limit(name: &'static str, ok: bool, reason: &'static str) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Limit { name, reason })
            }
        }

        limit("max_block_insns", self.max_block_insns > 0, "must be non-zero")?;
        limit(
            "max_block_entries",
            self.max_block_entries > 0,
            "must allow the block start",
        )?;
        limit(
            "inval_page_size",
            self.inval_page_size.is_power_of_two(),
            "must be a power of two",
        )?;
        limit(
            "max_literal_offset",
            self.max_literal_offset % 2 == 0,
            "must be halfword aligned",
        )?;

        if self.buffers.is_empty() {
            return Err(ConfigError::NoBuffers);
        }
        for (index, buf) in self.buffers.iter().enumerate() {
            let fail = |reason| Err(ConfigError::Buffer { index, reason });
            if buf.code_bytes < MIN_CODE_BYTES {
                return fail("code buffer too small");
            }
            if buf.max_blocks == 0 || buf.max_blocks > usize::from(u16::MAX) {
                return fail("max_blocks must be in 1..=65535");
            }
            if !buf.hash_size.is_power_of_two() {
                return fail("hash_size must be a power of two");
            }
        }

        for (index, region) in self.regions.iter().enumerate() {
            let fail = |reason| Err(ConfigError::Region { index, reason });
            if region.tcache >= self.buffers.len() {
                return fail("refers to a missing translation cache buffer");
            }
            if region.match_value & !region.match_mask != 0 {
                return fail("match_value has bits outside match_mask");
            }
            if region.offset_mask & region.offset_mask.wrapping_add(1) != 0 {
                return fail("offset_mask must be of the form 2^n - 1");
            }
            if region.smc && region.size() < u64::from(self.inval_page_size) {
                return fail("tracked region is smaller than one invalidation page");
            }
        }
        Ok(())
    }

    /// First region containing `addr`.
    pub fn region_of(&self, addr: u32) -> Option<(usize, &CodeRegion)> {
        self.regions
            .iter()
            .enumerate()
            .find(|(_, region)| region.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        JitConfig::default().validate().unwrap();
    }

    #[test]
    fn default_regions_route_aliases() {
        let cfg = JitConfig::default();
        assert_eq!(cfg.region_of(0x0000_0100).unwrap().1.name, "bios");
        assert_eq!(cfg.region_of(0x0600_1000).unwrap().1.name, "sdram");
        assert_eq!(cfg.region_of(0x2600_1000).unwrap().1.name, "sdram");
        assert_eq!(cfg.region_of(0x2200_0400).unwrap().1.name, "rom");
        assert_eq!(cfg.region_of(0xc000_0010).unwrap().1.name, "data-array");
        assert!(cfg.region_of(0x4000_0000).is_none());
    }

    #[test]
    fn rejects_bad_hash_size() {
        let mut cfg = JitConfig::default();
        cfg.buffers[0].hash_size = 1000;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Buffer {
                index: 0,
                reason: "hash_size must be a power of two"
            })
        );
    }

    #[test]
    fn rejects_region_without_buffer() {
        let mut cfg = JitConfig::default();
        cfg.regions[0].tcache = 7;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Region { index: 0, .. })
        ));
    }
}
