use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sh2_drc::emit::Emitter;
use sh2_drc::host::Cond;
use sh2_drc::regcache::CYCLES_REG;
use sh2_drc::tcache::{BlockRef, NewBlock, TranslationCache};
use sh2_drc::{CpuState, GuestBus, GuestReg, Jit, JitConfig, TcacheConfig};

fn criterion_config() -> Criterion {
    match std::env::var("SH2_DRC_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

/// Deterministic RNG for input generation.
#[derive(Clone)]
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        (self.next_u64() as usize) % upper_exclusive
    }
}

const CACHE_BLOCKS: usize = 4_000;
const QUERY_COUNT: usize = 8_192; // power of two for cheap wrapping
const RNG_SEED: u64 = 0x5D2C_0DE5_1A7E_B10C;

fn pc_for_index(idx: usize) -> u32 {
    0x0600_0000 + ((idx as u32) << 4)
}

fn cache_config() -> JitConfig {
    JitConfig {
        buffers: vec![TcacheConfig {
            code_bytes: 1 << 20,
            max_blocks: 4096,
            max_links: 4096,
            hash_size: 0x1000,
        }],
        ..JitConfig::default()
    }
}

fn add_block(tc: &mut TranslationCache, pc: u32) -> BlockRef {
    let mut e = tc.emitter(0);
    let start = e.position();
    e.store_ctx_imm(GuestReg::PC, pc);
    e.cmp_imm(CYCLES_REG, 0);
    e.jump_cond(Cond::Le, 0);
    e.store_ctx_imm(GuestReg::PC, pc + 0x10);
    let site = e.jump(0);
    let end = e.position();
    tc.commit_code(0, end);
    let block = tc
        .add_block(
            0,
            &NewBlock {
                pc,
                end_pc: pc + 0x10,
                end_literals: pc + 0x10,
                code: start..end,
            },
        )
        .unwrap();
    tc.link_branch(block, site, pc + 0x10);
    block
}

fn build_cache_near_capacity() -> (TranslationCache, Vec<BlockRef>) {
    let mut tc = TranslationCache::new(&cache_config(), 64);
    let blocks = (0..CACHE_BLOCKS)
        .map(|i| add_block(&mut tc, pc_for_index(i)))
        .collect();
    (tc, blocks)
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("tcache_lookup");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hit_100pct", |b| {
        let (tc, _) = build_cache_near_capacity();
        let mut rng = SplitMix64::new(RNG_SEED);
        let queries: Vec<u32> = (0..QUERY_COUNT)
            .map(|_| pc_for_index(rng.next_usize(CACHE_BLOCKS)))
            .collect();

        let mut idx = 0usize;
        b.iter(|| {
            let pc = queries[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            black_box(tc.lookup(0, black_box(pc)));
        });
    });

    group.bench_function("miss_100pct", |b| {
        let (tc, _) = build_cache_near_capacity();
        let mut rng = SplitMix64::new(RNG_SEED ^ 0x5A5A_5A5A_5A5A_5A5A);
        let queries: Vec<u32> = (0..QUERY_COUNT)
            .map(|_| pc_for_index(CACHE_BLOCKS + rng.next_usize(CACHE_BLOCKS)))
            .collect();

        let mut idx = 0usize;
        b.iter(|| {
            let pc = queries[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            black_box(tc.lookup(0, black_box(pc)));
        });
    });

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("tcache_churn");

    const CHURN_OPS: usize = 256;
    group.throughput(Throughput::Elements(CHURN_OPS as u64));
    group.bench_function("invalidate_and_readd", |b| {
        let (mut tc, mut blocks) = build_cache_near_capacity();
        let mut rng = SplitMix64::new(RNG_SEED ^ 0x0F0F_0F0F_0F0F_0F0F);
        b.iter(|| {
            for _ in 0..CHURN_OPS {
                if tc.buffer(0).free_bytes() < 0x100 {
                    tc.flush(0);
                    blocks = (0..CACHE_BLOCKS)
                        .map(|i| add_block(&mut tc, pc_for_index(i)))
                        .collect();
                }
                let i = rng.next_usize(blocks.len());
                let removed = tc.invalidate_block(blocks[i], 0);
                black_box(removed);
                blocks[i] = add_block(&mut tc, pc_for_index(i));
            }
        });
    });

    group.finish();
}

/// Flat SDRAM holding one counting loop.
struct LoopBus {
    sdram: Vec<u8>,
}

impl LoopBus {
    const BASE: u32 = 0x0600_0000;

    fn new() -> Self {
        let mut sdram = vec![0; 0x1_0000];
        // mov #0,r2 ; loop: add #1,r2 ; bra loop ; nop
        for (i, op) in [0xe200u16, 0x7201, 0xaffd, 0x0009].iter().enumerate() {
            sdram[2 * i..2 * i + 2].copy_from_slice(&op.to_be_bytes());
        }
        Self { sdram }
    }

    fn at(&self, addr: u32, len: usize) -> Option<&[u8]> {
        let offset = addr.checked_sub(Self::BASE)? as usize;
        self.sdram.get(offset..offset + len)
    }
}

impl GuestBus for LoopBus {
    fn fetch16(&self, addr: u32) -> Option<u16> {
        self.at(addr, 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn read8(&mut self, addr: u32) -> u8 {
        self.at(addr, 1).map_or(0, |b| b[0])
    }

    fn read16(&mut self, addr: u32) -> u16 {
        self.fetch16(addr).unwrap_or(0)
    }

    fn read32(&mut self, addr: u32) -> u32 {
        self.at(addr, 4)
            .map_or(0, |b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write8(&mut self, _addr: u32, _value: u8) {}
    fn write16(&mut self, _addr: u32, _value: u16) {}
    fn write32(&mut self, _addr: u32, _value: u32) {}
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("jit_execute");

    const BUDGET: u32 = 10_000;
    group.throughput(Throughput::Elements(u64::from(BUDGET)));
    group.bench_function("warm_loop", |b| {
        let mut jit = Jit::init(JitConfig::default()).unwrap();
        let mut bus = LoopBus::new();
        let mut cpu = CpuState::new();
        cpu.set_pc(LoopBus::BASE);
        jit.execute(&mut cpu, &mut bus, BUDGET).unwrap();

        b.iter(|| {
            black_box(jit.execute(&mut cpu, &mut bus, BUDGET).unwrap());
        });
    });

    group.bench_function("cold_translate", |b| {
        let mut jit = Jit::init(JitConfig::default()).unwrap();
        let bus = LoopBus::new();
        b.iter(|| {
            jit.flush_all();
            black_box(jit.translate(&bus, LoopBus::BASE).unwrap());
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_lookup, bench_churn, bench_execute
}
criterion_main!(benches);
