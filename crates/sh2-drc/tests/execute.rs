mod common;

use common::{cpu_at, init_tracing, op, TestBus, SDRAM_BASE};
use sh2_drc::{BufferState, GuestEvent, GuestReg, Jit, JitConfig, JitError};

const fn at(offset: u32) -> u32 {
    SDRAM_BASE + offset
}

fn jit() -> Jit {
    init_tracing();
    Jit::init(JitConfig::default()).unwrap()
}

#[test]
fn straight_line_block_consumes_its_cost() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.load(
        at(0x1000),
        &[op::mov_imm(0, 1), op::add_imm(0, 2), op::mov(1, 0), op::add(1, 1)],
    );

    let mut cpu = cpu_at(at(0x1000));
    let consumed = jit.execute(&mut cpu, &mut bus, 100).unwrap();

    assert_eq!(consumed, 4);
    assert_eq!(cpu.r(0), 3);
    assert_eq!(cpu.r(1), 6);
    assert_eq!(cpu.pc(), at(0x1008));
    assert!(jit.lookup(at(0x1000)).is_some());
    assert_eq!(jit.stats().blocks_translated, 1);
    assert_eq!(jit.buffer_state(0), BufferState::Populated);
}

#[test]
fn traced_block_entries_are_counted() {
    init_tracing();
    let mut jit = Jit::init(JitConfig {
        trace_block_entries: true,
        ..JitConfig::default()
    })
    .unwrap();
    let mut bus = TestBus::new();
    bus.load(at(0x1400), &[op::mov_imm(0, 5), op::mov(4, 0), op::add(4, 4)]);

    let mut cpu = cpu_at(at(0x1400));
    cpu.set_r(4, 0xdead);
    let consumed = jit.execute(&mut cpu, &mut bus, 100).unwrap();

    assert_eq!(consumed, 3);
    assert_eq!(cpu.r(0), 5);
    assert_eq!(cpu.r(4), 10);
    assert_eq!(jit.stats().entries_traced, 1);
}

#[test]
fn conditional_branch_takes_both_sides_without_retranslation() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.load(at(0x2000), &[op::cmp_eq_imm(0), op::bt(at(0x2002), at(0x2100))]);
    bus.load(at(0x2100), &[op::mov_imm(2, 7)]);
    bus.load(at(0x2004), &[op::mov_imm(3, 9)]);

    // Taken: 2 cycles for the block, 2 for the taken branch, 1 for the target.
    let mut cpu = cpu_at(at(0x2000));
    cpu.set_r(0, 0);
    assert_eq!(jit.execute(&mut cpu, &mut bus, 100).unwrap(), 5);
    assert_eq!(cpu.r(2), 7);
    assert_eq!(cpu.pc(), at(0x2102));
    let first = jit.lookup(at(0x2000)).unwrap();

    // Not taken.
    let mut cpu = cpu_at(at(0x2000));
    cpu.set_r(0, 5);
    assert_eq!(jit.execute(&mut cpu, &mut bus, 100).unwrap(), 3);
    assert_eq!(cpu.r(3), 9);
    assert!(!cpu.t());
    assert_eq!(cpu.pc(), at(0x2006));

    // Taken again: the branch is now linked straight to the target block.
    let mut cpu = cpu_at(at(0x2000));
    cpu.set_r(0, 0);
    assert_eq!(jit.execute(&mut cpu, &mut bus, 100).unwrap(), 5);
    assert_eq!(cpu.r(2), 7);

    assert_eq!(jit.lookup(at(0x2000)), Some(first));
    let stats = jit.stats();
    assert_eq!(stats.blocks_translated, 3);
    assert_eq!(stats.lookups_hit, 2);
}

#[test]
fn write_into_block_invalidates_it() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    let x = at(0x3000);
    bus.load(x, &[op::NOP; 8]);

    jit.translate(&bus, x).unwrap();
    assert!(jit.lookup(x).is_some());
    assert!(jit.has_code_at(x + 4));
    assert!(!jit.has_code_at(x + 16));

    assert_eq!(jit.on_write(x + 4), 1);
    assert_eq!(jit.lookup(x), None);
    assert!(!jit.has_code_at(x));
    assert_eq!(jit.block_count(), 0);

    jit.translate(&bus, x).unwrap();
    assert!(jit.lookup(x).is_some());
    assert_eq!(jit.block_count(), 1);
    assert_eq!(jit.stats().blocks_invalidated, 1);
}

#[test]
fn write_outside_code_invalidates_nothing() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    let x = at(0x3000);
    bus.load(x, &[op::NOP; 4]);
    jit.translate(&bus, x).unwrap();

    assert_eq!(jit.on_write(x + 8), 0);
    assert_eq!(jit.on_write(x - 2), 0);
    assert!(jit.lookup(x).is_some());
}

#[test]
fn guest_store_rewrites_linked_block() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    // 0x3400: mov.l @(8,pc),r2 ; mov.l r1,@r2 ; bra 0x3500 ; nop ; .align ; .long 0x06003500
    bus.load(
        at(0x3400),
        &[
            op::load_pool_l(2, 2),
            op::store_l(2, 1),
            op::bra(at(0x3404), at(0x3500)),
            op::NOP,
            op::NOP,
            op::NOP,
            (at(0x3500) >> 16) as u16,
            at(0x3500) as u16,
        ],
    );
    bus.load(at(0x3500), &[op::mov_imm(3, 1), op::NOP]);

    let mut cpu = cpu_at(at(0x3500));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.r(3), 1);

    // Overwrite the first two instructions of the target with "mov #5,r3 ; nop".
    let mut cpu = cpu_at(at(0x3400));
    cpu.set_r(1, u32::from(op::mov_imm(3, 5)) << 16 | u32::from(op::NOP));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();

    assert_eq!(bus.peek32(at(0x3500)), cpu.r(1));
    assert_eq!(cpu.r(3), 5);
    assert_eq!(jit.stats().blocks_invalidated, 1);
    assert_eq!(jit.stats().links_resolved, 1);
}

#[test]
fn loop_runs_inside_one_block() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    // mov #5,r1 ; loop: dt r1 ; bf loop
    bus.load(
        at(0x4000),
        &[op::mov_imm(1, 5), op::dt(1), op::bf(at(0x4004), at(0x4002))],
    );

    let mut cpu = cpu_at(at(0x4000));
    let consumed = jit.execute(&mut cpu, &mut bus, 1000).unwrap();

    assert_eq!(cpu.r(1), 0);
    assert!(cpu.t());
    assert_eq!(cpu.pc(), at(0x4006));
    // mov + five (dt, bf) pairs + four taken-branch penalties.
    assert_eq!(consumed, 1 + 5 * 2 + 4 * 2);
    assert_eq!(jit.stats().blocks_translated, 1);
}

#[test]
fn budget_exhaustion_stops_at_block_entry_and_resumes() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.load(
        at(0x4100),
        &[op::mov_imm(1, 100), op::dt(1), op::bf(at(0x4104), at(0x4102))],
    );

    let mut cpu = cpu_at(at(0x4100));
    let consumed = jit.execute(&mut cpu, &mut bus, 20).unwrap();
    assert!((20..24).contains(&consumed), "consumed {consumed}");
    assert_eq!(cpu.pc(), at(0x4102));
    let left = cpu.r(1);
    assert!(left > 0 && left < 100);

    let consumed = jit.execute(&mut cpu, &mut bus, 10_000).unwrap();
    assert_eq!(cpu.r(1), 0);
    assert_eq!(cpu.pc(), at(0x4106));
    assert_eq!(consumed, left * 2 + (left - 1) * 2);
}

#[test]
fn delay_slot_runs_before_branch_and_keeps_condition() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    // cmp/eq #0,r0 ; bt/s 0x4300 ; clrt
    bus.load(
        at(0x4200),
        &[op::cmp_eq_imm(0), op::bt_s(at(0x4202), at(0x4300)), op::CLRT],
    );
    bus.load(at(0x4300), &[op::NOP]);

    let mut cpu = cpu_at(at(0x4200));
    cpu.set_r(0, 0);
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.pc(), at(0x4302));
    assert!(!cpu.t());

    let mut cpu = cpu_at(at(0x4200));
    cpu.set_r(0, 1);
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.pc(), at(0x4206));
}

#[test]
fn subroutine_call_and_return() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    // bsr 0x4500 ; mov #1,r5 (slot) ; then at return: mov #2,r6
    bus.load(
        at(0x4400),
        &[op::bsr(at(0x4400), at(0x4500)), op::mov_imm(5, 1), op::mov_imm(6, 2)],
    );
    // add #3,r5 ; rts ; nop
    bus.load(at(0x4500), &[op::add_imm(5, 3), op::RTS, op::NOP]);

    let mut cpu = cpu_at(at(0x4400));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.r(5), 4);
    assert_eq!(cpu.r(6), 2);
    assert_eq!(cpu.get(GuestReg::PR), at(0x4404));
    assert_eq!(cpu.pc(), at(0x4406));
}

#[test]
fn interrupt_is_taken_before_running() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.poke32(at(0x40 * 4), at(0x5800));
    bus.load(at(0x5800), &[op::mov_imm(4, 3)]);
    bus.load(at(0x5000), &[op::NOP]);
    bus.irq = Some((5, 0x40));

    let mut cpu = cpu_at(at(0x5000));
    cpu.set(GuestReg::VBR, SDRAM_BASE);
    let sp = cpu.r(15);
    let consumed = jit.execute(&mut cpu, &mut bus, 100).unwrap();

    assert_eq!(consumed, 13 + 1);
    assert_eq!(cpu.r(4), 3);
    assert_eq!(cpu.imask(), 5);
    assert_eq!(cpu.r(15), sp - 8);
    assert_eq!(bus.peek32(sp - 8), at(0x5000));
    assert_eq!(bus.events, vec![GuestEvent::Interrupt { level: 5, vector: 0x40 }]);
    assert_eq!(jit.stats().interrupts_taken, 1);
}

#[test]
fn unmasking_sr_accepts_pending_interrupt() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.poke32(at(0x40 * 4), at(0x5800));
    bus.load(at(0x5800), &[op::mov_imm(4, 3)]);
    // mov #0,r0 ; ldc r0,sr ; nop
    bus.load(at(0x5100), &[op::mov_imm(0, 0), op::ldc_sr(0), op::NOP]);
    bus.irq = Some((5, 0x40));

    let mut cpu = cpu_at(at(0x5100));
    cpu.set_imask(15);
    cpu.set(GuestReg::VBR, SDRAM_BASE);
    let sp = cpu.r(15);
    let consumed = jit.execute(&mut cpu, &mut bus, 100).unwrap();

    assert_eq!(consumed, 2 + 13 + 1);
    assert_eq!(cpu.r(4), 3);
    // Return address is the instruction after LDC.
    assert_eq!(bus.peek32(sp - 8), at(0x5104));
    assert_eq!(bus.peek32(sp - 4), 0);
}

#[test]
fn rte_restores_pc_and_sr() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    let mut cpu = cpu_at(at(0x5200));
    let sp = cpu.r(15) - 8;
    cpu.set_r(15, sp);
    bus.poke32(sp, at(0x5300));
    bus.poke32(sp + 4, 0x0000_00f1);
    // rte ; nop
    bus.load(at(0x5200), &[op::RTE, op::NOP]);
    bus.load(at(0x5300), &[op::NOP]);

    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.pc(), at(0x5302));
    assert_eq!(cpu.r(15), sp + 8);
    assert_eq!(cpu.imask(), 15);
    assert!(cpu.t());
}

#[test]
fn test_and_set_marks_the_byte_once() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.poke32(at(0x7200), 0x0012_3456);
    bus.load(
        at(0x5400),
        &[op::tas_b(1), op::movt(2), op::tas_b(1), op::movt(3), op::NOP],
    );

    let mut cpu = cpu_at(at(0x5400));
    cpu.set_r(1, at(0x7200));
    jit.execute(&mut cpu, &mut bus, 40).unwrap();

    assert_eq!(cpu.r(2), 1);
    assert_eq!(cpu.r(3), 0);
    assert_eq!(cpu.r(1), at(0x7200));
    assert_eq!(bus.peek32(at(0x7200)), 0x8012_3456);
}

#[test]
fn trapa_enters_handler() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.poke32(at(0x20 * 4), at(0x5800));
    bus.load(at(0x5800), &[op::mov_imm(4, 3)]);
    bus.load(at(0x6000), &[op::trapa(0x20)]);

    let mut cpu = cpu_at(at(0x6000));
    cpu.set(GuestReg::VBR, SDRAM_BASE);
    let sp = cpu.r(15);
    let consumed = jit.execute(&mut cpu, &mut bus, 100).unwrap();

    assert_eq!(consumed, 8 + 1);
    assert_eq!(cpu.r(4), 3);
    assert_eq!(bus.peek32(sp - 8), at(0x6002));
    assert_eq!(
        bus.events,
        vec![GuestEvent::Trap {
            vector: 0x20,
            return_pc: at(0x6002)
        }]
    );
}

#[test]
fn illegal_opcode_is_reported_to_the_bus() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.exit_on_event = true;
    bus.load(at(0x6100), &[op::NOP, 0xffff]);

    let mut cpu = cpu_at(at(0x6100));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();

    assert_eq!(cpu.pc(), at(0x6102));
    assert_eq!(bus.events, vec![GuestEvent::IllegalInstruction { pc: at(0x6102) }]);
    assert_eq!(jit.stats().unimplemented_opcodes, 1);
}

#[test]
fn branch_in_delay_slot_is_slot_illegal() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.exit_on_event = true;
    bus.load(
        at(0x6200),
        &[op::bra(at(0x6200), at(0x6300)), op::bra(at(0x6202), at(0x6400))],
    );

    let mut cpu = cpu_at(at(0x6200));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(
        bus.events,
        vec![GuestEvent::SlotIllegalInstruction { pc: at(0x6200) }]
    );
}

#[test]
fn undefined_opcode_in_delay_slot_is_slot_illegal() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.exit_on_event = true;
    // bra +0x100 ; .word 0xfffd
    bus.load(at(0x3000), &[op::bra(at(0x3000), at(0x3100)), 0xfffd]);
    bus.load(at(0x3100), &[op::mov_imm(2, 7)]);

    let mut cpu = cpu_at(at(0x3000));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();

    assert_eq!(
        bus.events,
        vec![GuestEvent::SlotIllegalInstruction { pc: at(0x3000) }]
    );
    assert_eq!(cpu.pc(), at(0x3000));
    assert_ne!(cpu.r(2), 7);
    assert_eq!(jit.stats().unimplemented_opcodes, 1);
}

#[test]
fn illegal_opcode_does_not_cut_off_the_rest_of_the_block() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.exit_on_event = true;
    // .word 0xffff ; loop: dt r1 ; bf loop
    bus.load(
        at(0x6500),
        &[0xffff, op::dt(1), op::bf(at(0x6504), at(0x6502))],
    );

    let mut cpu = cpu_at(at(0x6500));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(bus.events, vec![GuestEvent::IllegalInstruction { pc: at(0x6500) }]);
    assert!(jit.lookup(at(0x6502)).is_some());

    // The loop after the trap is an entry of the same block.
    let mut cpu = cpu_at(at(0x6502));
    cpu.set_r(1, 3);
    let consumed = jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.r(1), 0);
    assert_eq!(cpu.pc(), at(0x6506));
    assert_eq!(consumed, 3 * 2 + 2 * 2);
    assert_eq!(jit.stats().blocks_translated, 1);
    assert_eq!(jit.stats().unimplemented_opcodes, 1);
}

#[test]
fn link_register_is_written_before_the_delay_slot() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    // bsr +0x100 ; sts pr,r1
    bus.load(at(0x3400), &[op::bsr(at(0x3400), at(0x3500)), op::sts_pr(1)]);
    bus.load(at(0x3500), &[op::NOP]);

    let mut cpu = cpu_at(at(0x3400));
    cpu.set(GuestReg::PR, 0x1111_1111);
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.r(1), at(0x3404));
    assert_eq!(cpu.get(GuestReg::PR), at(0x3404));
    assert_eq!(cpu.pc(), at(0x3502));

    // jsr @r3 ; sts pr,r3: the target is read before the slot overwrites r3.
    bus.load(at(0x3540), &[op::jsr(3), op::sts_pr(3)]);
    bus.load(at(0x3600), &[op::NOP]);
    let mut cpu = cpu_at(at(0x3540));
    cpu.set(GuestReg::PR, 0x1111_1111);
    cpu.set_r(3, at(0x3600));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.r(3), at(0x3544));
    assert_eq!(cpu.pc(), at(0x3602));
}

#[test]
fn multiply_accumulate_walks_both_operands() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.poke32(at(0x7000), 3);
    bus.poke32(at(0x7004), 0xffff_fffe);
    bus.poke32(at(0x7100), 5);
    bus.poke32(at(0x7104), 7);
    // clrmac ; mac.l @r2+,@r1+ ; mac.l @r2+,@r1+ ; sts macl,r4 ; sts mach,r5
    bus.load(
        at(0x6600),
        &[op::CLRMAC, op::mac_l(1, 2), op::mac_l(1, 2), op::sts_macl(4), op::sts_mach(5)],
    );

    let mut cpu = cpu_at(at(0x6600));
    cpu.set_r(1, at(0x7000));
    cpu.set_r(2, at(0x7100));
    let consumed = jit.execute(&mut cpu, &mut bus, 100).unwrap();

    // 3 * 5 + -2 * 7
    assert_eq!(cpu.r(4), 1);
    assert_eq!(cpu.r(5), 0);
    assert_eq!(cpu.r(1), at(0x7008));
    assert_eq!(cpu.r(2), at(0x7108));
    assert_eq!(consumed, 1 + 3 + 3 + 1 + 1);
}

#[test]
fn sleep_burns_the_budget() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.load(at(0x6500), &[op::SLEEP]);

    let mut cpu = cpu_at(at(0x6500));
    let consumed = jit.execute(&mut cpu, &mut bus, 500).unwrap();
    assert_eq!(consumed, 500 + 3);
    assert_eq!(cpu.pc(), at(0x6500));
}

#[test]
fn unmapped_pc_returns_immediately() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    let mut cpu = cpu_at(0x4000_0000);
    assert_eq!(jit.execute(&mut cpu, &mut bus, 100).unwrap(), 0);
    assert_eq!(cpu.pc(), 0x4000_0000);
    assert!(matches!(
        jit.translate(&bus, 0x4000_0000),
        Err(JitError::NoCode { pc: 0x4000_0000 })
    ));
}

#[test]
fn full_buffer_is_flushed_and_translation_retried() {
    init_tracing();
    let mut config = JitConfig::default();
    config.buffers[0].max_blocks = 2;
    let mut jit = Jit::init(config).unwrap();
    let mut bus = TestBus::new();
    for i in 0..3 {
        bus.load(at(0x7000 + i * 0x10), &[op::NOP]);
    }

    jit.translate(&bus, at(0x7000)).unwrap();
    jit.translate(&bus, at(0x7010)).unwrap();
    jit.translate(&bus, at(0x7020)).unwrap();

    assert_eq!(jit.stats().flushes, 1);
    assert_eq!(jit.lookup(at(0x7000)), None);
    assert!(jit.lookup(at(0x7020)).is_some());
    assert!(!jit.has_code_at(at(0x7000)));
}

#[test]
fn flush_all_drops_everything() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    bus.load(at(0x7100), &[op::NOP]);
    let mut cpu = cpu_at(at(0x7100));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(jit.block_count(), 1);

    jit.flush_all();
    assert_eq!(jit.block_count(), 0);
    assert_eq!(jit.lookup(at(0x7100)), None);
    assert_eq!(jit.buffer_state(0), BufferState::Empty);

    let stats = jit.shutdown();
    assert_eq!(stats.blocks_translated, 1);
}

#[test]
fn literal_pool_write_disables_inlining_for_a_while() {
    let mut jit = jit();
    let mut bus = TestBus::new();
    // mov.l @(8,pc),r2 ; bra 0x7300 ; nop ; .align ; .long 0x12345678
    bus.load(
        at(0x7200),
        &[
            op::load_pool_l(2, 1),
            op::bra(at(0x7202), at(0x7300)),
            op::NOP,
            op::NOP,
            0x1234,
            0x5678,
        ],
    );

    let mut cpu = cpu_at(at(0x7200));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.r(2), 0x1234_5678);
    assert!(jit.has_code_at(at(0x7208)));

    // Data write into the pool.
    bus.poke32(at(0x7208), 0xcafe_f00d);
    assert_eq!(jit.on_write(at(0x7208)), 1);

    let mut cpu = cpu_at(at(0x7200));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.r(2), 0xcafe_f00d);

    // The block no longer covers its pool, so a second pool write is not a code hit.
    bus.poke32(at(0x7208), 0x0bad_beef);
    assert_eq!(jit.on_write(at(0x7208)), 0);
    let mut cpu = cpu_at(at(0x7200));
    jit.execute(&mut cpu, &mut bus, 100).unwrap();
    assert_eq!(cpu.r(2), 0x0bad_beef);
}
