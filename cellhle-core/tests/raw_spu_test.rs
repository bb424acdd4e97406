//! Raw SPU behaviour observed through the guest address space.

mod utils;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cellhle_core::error::{MemoryError, SpuFault};
use cellhle_core::runtime::memory::MemoryRegion;
use cellhle_core::runtime::spu::decoder::encode;
use cellhle_core::runtime::spu::interrupt::class2;
use cellhle_core::runtime::spu::regs::*;
use cellhle_core::runtime::spu::{RawSpuThread, RunState, SpuContext, SpuDecoder, Step};
use cellhle_core::EmulationSession;
use utils::{fill_with_nops, load_program, reg, session, wait_until, TIMEOUT};

/// Point the unit at `npc` and let it run.
fn start(session: &EmulationSession, spu: &RawSpuThread, npc: u32) {
    session.write32(reg(spu, SPU_NPC), npc).unwrap();
    session.write32(reg(spu, SPU_RUN_CNTL), SPU_RUNCNTL_RUNNABLE).unwrap();
}

#[test]
fn test_apertures_route_to_their_unit() {
    let session = session();
    let first = session.create_raw_spu(0).unwrap();
    let second = session.create_raw_spu(1).unwrap();

    session.write32(reg(&second, SPU_NPC), 0x400).unwrap();
    assert_eq!(session.read32(reg(&second, SPU_NPC)).unwrap(), 0x400);
    assert_eq!(session.read32(reg(&first, SPU_NPC)).unwrap(), 0);

    session
        .memory()
        .copy_in(raw_spu_ls_addr(1) + 0x10, &[0xAA, 0xBB])
        .unwrap();
    let mut buf = [0u8; 2];
    second.local_store().read(0x10, &mut buf).unwrap();
    assert_eq!(buf, [0xAA, 0xBB]);
    first.local_store().read(0x10, &mut buf).unwrap();
    assert_eq!(buf, [0, 0]);
}

#[test]
fn test_aperture_edges() {
    let session = session();
    let first = session.create_raw_spu(0).unwrap();
    let second = session.create_raw_spu(1).unwrap();
    let base = first.mmio_base();

    // Both ends of the window trap into the first unit.
    for addr in [base, base + APERTURE_SIZE - 4] {
        assert!(session.memory().is_mmio(addr));
        assert_eq!(
            first.read32(addr).unwrap_err(),
            MemoryError::UnhandledRegister { addr }
        );
        assert_eq!(
            session.read32(addr).unwrap_err(),
            MemoryError::UnhandledRegister { addr }
        );
    }

    // The last local store word below the window is plain memory.
    session.write32(base - 4, 0x1111_2222).unwrap();
    assert_eq!(first.local_store().read_u32(LS_SIZE - 4).unwrap(), 0x1111_2222);

    // One past the window is the next unit's local store.
    let next = base + APERTURE_SIZE;
    assert_eq!(next, raw_spu_ls_addr(1));
    assert!(!session.memory().is_mmio(next));
    session.write32(next, 0xCAFE_F00D).unwrap();
    assert_eq!(second.local_store().read_u32(0).unwrap(), 0xCAFE_F00D);
    assert!(matches!(
        first.read32(next),
        Err(MemoryError::Misrouted { .. })
    ));
}

#[test]
fn test_unhandled_register_is_reported() {
    let session = session();
    let spu = session.create_raw_spu(2).unwrap();
    let addr = reg(&spu, 0x5000);
    assert_eq!(
        session.read32(addr).unwrap_err(),
        MemoryError::UnhandledRegister { addr }
    );
    assert_eq!(spu.state(), RunState::Created);
}

#[test]
fn test_run_until_stop_and_signal() {
    let session = session();
    let spu = session.create_raw_spu(0).unwrap();
    load_program(&spu, &[encode::NOP, encode::LNOP, encode::stop(0x42)]);

    start(&session, &spu, 0);
    assert_eq!(spu.wait_while_running(TIMEOUT), RunState::Paused);

    let status = session.read32(reg(&spu, SPU_STATUS)).unwrap();
    assert_eq!(status, (0x42 << 16) | SPU_STATUS_STOPPED_BY_STOP);
    assert_eq!(session.read32(reg(&spu, SPU_NPC)).unwrap(), 12);
    assert_ne!(spu.interrupt_status() & class2::STOP, 0);

    spu.acknowledge_interrupts(class2::STOP);
    assert_eq!(spu.interrupt_status() & class2::STOP, 0);
}

#[test]
fn test_pause_keeps_state_and_resume_continues() {
    let session = session();
    let spu = session.create_raw_spu(1).unwrap();
    fill_with_nops(&spu);

    start(&session, &spu, 0);
    assert!(wait_until(|| spu.context().retired > 0));
    assert_eq!(session.read32(reg(&spu, SPU_STATUS)).unwrap(), SPU_STATUS_RUNNING);

    session.write32(reg(&spu, SPU_RUN_CNTL), SPU_RUNCNTL_STOP).unwrap();
    assert_eq!(spu.state(), RunState::Paused);
    let paused = spu.context();
    assert_eq!(paused.pc % 4, 0);

    thread::sleep(Duration::from_millis(20));
    let later = spu.context();
    assert_eq!(later.pc, paused.pc);
    assert_eq!(later.retired, paused.retired);
    assert_eq!(session.read32(reg(&spu, SPU_NPC)).unwrap(), paused.pc);

    session.write32(reg(&spu, SPU_RUN_CNTL), SPU_RUNCNTL_RUNNABLE).unwrap();
    assert!(wait_until(|| spu.context().retired > paused.retired));
    session.write32(reg(&spu, SPU_RUN_CNTL), SPU_RUNCNTL_STOP).unwrap();
    assert_eq!(spu.state(), RunState::Paused);
}

#[test]
fn test_fault_stops_unit_for_good() {
    let session = session();
    let spu = session.create_raw_spu(3).unwrap();
    load_program(&spu, &[encode::NOP, 0xDEAD_BEEF]);

    start(&session, &spu, 0);
    assert_eq!(spu.wait_while_running(TIMEOUT), RunState::Stopped);
    assert_eq!(
        session.read32(reg(&spu, SPU_STATUS)).unwrap(),
        SPU_STATUS_STOPPED_BY_HALT
    );
    assert_ne!(spu.interrupt_status() & class2::HALT, 0);
    assert_eq!(spu.context().pc, 4);

    // Stopped is terminal.
    session.write32(reg(&spu, SPU_RUN_CNTL), SPU_RUNCNTL_RUNNABLE).unwrap();
    assert_eq!(spu.state(), RunState::Stopped);
    spu.init_regs();
    assert_eq!(spu.state(), RunState::Stopped);
}

#[test]
fn test_init_regs_after_stop() {
    let session = session();
    let spu = session.create_raw_spu(0).unwrap();
    load_program(&spu, &[encode::stop(7)]);
    start(&session, &spu, 0);
    assert_eq!(spu.wait_while_running(TIMEOUT), RunState::Paused);

    spu.init_regs();
    assert_eq!(session.read32(reg(&spu, SPU_STATUS)).unwrap(), SPU_STATUS_STOPPED);
    assert_eq!(session.read32(reg(&spu, SPU_NPC)).unwrap(), 0);
    assert_eq!(spu.interrupt_status(), 0);

    // Local store survives a register reset; the unit can run again.
    start(&session, &spu, 0);
    assert_eq!(spu.wait_while_running(TIMEOUT), RunState::Paused);
    assert_eq!(spu.status() >> 16, 7);
}

#[test]
fn test_proxy_dma_put_and_get() {
    let session = session();
    let spu = session.create_raw_spu(0).unwrap();
    let ea = 0x0002_0000;
    let pattern: Vec<u8> = (0..0x80u32).map(|i| i as u8).collect();
    spu.local_store().write(0x100, &pattern).unwrap();

    let issue = |lsa: u32, ea: u32, size: u32, cmd: u32| -> u32 {
        session.write32(reg(&spu, MFC_LSA), lsa).unwrap();
        session.write32(reg(&spu, MFC_EAH), 0).unwrap();
        session.write32(reg(&spu, MFC_EAL), ea).unwrap();
        session.write32(reg(&spu, MFC_SIZE_TAG), (size << 16) | 3).unwrap();
        session.write32(reg(&spu, MFC_CLASS_CMD), cmd).unwrap();
        session.read32(reg(&spu, MFC_CLASS_CMD)).unwrap()
    };

    assert_eq!(issue(0x100, ea, 0x80, MFC_PUT_CMD), 0);
    assert_eq!(session.memory().read_bytes(ea, 0x80).unwrap(), pattern);
    assert_ne!(spu.interrupt_status() & class2::DMA_TAG, 0);

    assert_eq!(issue(0x2000, ea, 0x80, MFC_GET_CMD), 0);
    let mut back = vec![0u8; 0x80];
    spu.local_store().read(0x2000, &mut back).unwrap();
    assert_eq!(back, pattern);

    assert_eq!(
        session.read32(reg(&spu, MFC_QSTATUS)).unwrap(),
        MFC_PROXY_QUEUE_EMPTY
    );
}

#[test]
fn test_proxy_dma_failures_set_error_status() {
    let session = session();
    let spu = session.create_raw_spu(4).unwrap();

    let issue = |lsa: u32, ea: u32, size: u32| -> u32 {
        session.write32(reg(&spu, MFC_LSA), lsa).unwrap();
        session.write32(reg(&spu, MFC_EAL), ea).unwrap();
        session.write32(reg(&spu, MFC_SIZE_TAG), size << 16).unwrap();
        session.write32(reg(&spu, MFC_CLASS_CMD), MFC_GET_CMD).unwrap();
        session.read32(reg(&spu, MFC_CLASS_CMD)).unwrap()
    };

    // Unmapped effective address.
    assert_eq!(issue(0, 0x5000_0000, 0x10), 1);
    // Larger than one transfer.
    assert_eq!(issue(0, 0x0002_0000, 0x8000), 1);
    // Runs past the end of local store.
    assert_eq!(issue(LS_SIZE - 0x10, 0x0002_0000, 0x20), 1);
    assert_eq!(spu.interrupt_status() & class2::DMA_TAG, 0);

    session.write32(reg(&spu, MFC_EAH), 1).unwrap();
    assert_eq!(issue(0, 0x0002_0000, 0x10), 1);
}

/// Echoes each inbound mail plus one to the outbound mailbox, then stops.
struct EchoDecoder;

impl SpuDecoder for EchoDecoder {
    fn step(&self, ctx: &mut SpuContext, _ls: &MemoryRegion) -> Result<Step, SpuFault> {
        let mail = ctx.read_in_mbox().unwrap_or(0);
        ctx.write_out_mbox(mail + 1);
        ctx.write_out_intr_mbox(mail);
        ctx.advance();
        Ok(Step::Stop(1))
    }
}

#[test]
fn test_mailboxes_through_custom_decoder() {
    let session = session();
    let spu = session
        .create_raw_spu_with(2, Arc::new(EchoDecoder))
        .unwrap();

    session.write32(reg(&spu, SPU_IN_MBOX), 41).unwrap();
    assert_eq!(session.read32(reg(&spu, SPU_MBOX_STATUS)).unwrap(), 3 << 8);

    start(&session, &spu, 0);
    assert_eq!(spu.wait_while_running(TIMEOUT), RunState::Paused);

    assert_eq!(
        session.read32(reg(&spu, SPU_MBOX_STATUS)).unwrap(),
        1 | (4 << 8) | (1 << 16)
    );
    assert_ne!(spu.interrupt_status() & class2::MAILBOX, 0);
    assert_eq!(session.read32(reg(&spu, SPU_OUT_MBOX)).unwrap(), 42);
    // Empty mailbox reads as zero.
    assert_eq!(session.read32(reg(&spu, SPU_OUT_MBOX)).unwrap(), 0);
}

#[test]
fn test_draining_in_mbox_raises_threshold() {
    let session = session();
    let spu = session
        .create_raw_spu_with(3, Arc::new(EchoDecoder))
        .unwrap();
    spu.set_interrupt_mask(class2::IN_MBOX_THRESHOLD | class2::MAILBOX);

    session.write32(reg(&spu, SPU_IN_MBOX), 7).unwrap();
    start(&session, &spu, 0);
    assert_eq!(spu.wait_while_running(TIMEOUT), RunState::Paused);

    let pending = spu.interrupt_status();
    assert_ne!(pending & class2::IN_MBOX_THRESHOLD, 0);
    assert_ne!(pending & class2::STOP, 0);
    assert_eq!(
        spu.masked_interrupt_status(),
        class2::IN_MBOX_THRESHOLD | class2::MAILBOX
    );

    // Nothing left to drain on the next run.
    spu.acknowledge_interrupts(class2::ALL);
    session.read32(reg(&spu, SPU_OUT_MBOX)).unwrap();
    start(&session, &spu, 4);
    assert_eq!(spu.wait_while_running(TIMEOUT), RunState::Paused);
    assert_eq!(spu.interrupt_status() & class2::IN_MBOX_THRESHOLD, 0);
    assert_eq!(spu.masked_interrupt_status(), 0);
}

#[test]
fn test_signal_notification_registers() {
    let session = session();
    let spu = session.create_raw_spu(0).unwrap();
    session.write32(reg(&spu, SPU_RD_SIG_NOTIFY1), 0x11).unwrap();
    session.write32(reg(&spu, SPU_RD_SIG_NOTIFY1), 0x22).unwrap();
    session.write32(reg(&spu, SPU_RD_SIG_NOTIFY2), 0x33).unwrap();
    assert_eq!(session.read32(reg(&spu, SPU_RD_SIG_NOTIFY1)).unwrap(), 0x22);
    assert_eq!(session.read32(reg(&spu, SPU_RD_SIG_NOTIFY2)).unwrap(), 0x33);
}

#[test]
fn test_concurrent_mmio_while_running() {
    let session = Arc::new(session());
    let spu = session.create_raw_spu(0).unwrap();
    fill_with_nops(&spu);
    start(&session, &spu, 0);

    let status_addr = reg(&spu, SPU_STATUS);
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let session = session.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let status = session.read32(status_addr).unwrap();
                    assert_eq!(status, SPU_STATUS_RUNNING);
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }

    session.write32(reg(&spu, SPU_RUN_CNTL), SPU_RUNCNTL_STOP).unwrap();
    assert_eq!(spu.state(), RunState::Paused);
}

#[test]
fn test_concurrent_run_control_keeps_status_consistent() {
    let session = Arc::new(session());
    let spu = session.create_raw_spu(2).unwrap();
    fill_with_nops(&spu);
    let run_cntl = reg(&spu, SPU_RUN_CNTL);

    let writers: Vec<_> = (0..4)
        .map(|n| {
            let session = session.clone();
            thread::spawn(move || {
                for i in 0..2000u32 {
                    session.write32(run_cntl, (i + n) & 1).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let status = session.read32(reg(&spu, SPU_STATUS)).unwrap();
    match spu.state() {
        RunState::Running => assert_eq!(status, SPU_STATUS_RUNNING),
        RunState::Paused => assert_eq!(status, SPU_STATUS_STOPPED),
        other => panic!("unexpected state {:?}", other),
    }

    session.write32(run_cntl, SPU_RUNCNTL_STOP).unwrap();
    assert_eq!(spu.state(), RunState::Paused);
    assert_eq!(session.read32(reg(&spu, SPU_STATUS)).unwrap(), SPU_STATUS_STOPPED);
    session.write32(run_cntl, SPU_RUNCNTL_RUNNABLE).unwrap();
    assert!(wait_until(|| spu.context().retired > 0));
}

#[test]
fn test_destroy_stops_unit_held_by_caller() {
    let session = session();
    let spu = session.create_raw_spu(1).unwrap();
    fill_with_nops(&spu);
    start(&session, &spu, 0);
    assert!(wait_until(|| spu.context().retired > 0));

    assert!(session.destroy_raw_spu(1));
    assert_eq!(spu.state(), RunState::Stopped);
    let retired = spu.context().retired;
    thread::sleep(Duration::from_millis(20));
    assert_eq!(spu.context().retired, retired);

    let npc = reg(&spu, SPU_NPC);
    assert!(!session.memory().is_mmio(npc));
    assert!(!session.memory().is_mapped(raw_spu_ls_addr(1), 4));
    assert!(!session.objects().check_id(spu.id()));

    let again = session.create_raw_spu(1).unwrap();
    session.write32(npc, 0x80).unwrap();
    assert_eq!(again.context().npc(), 0x80);
    drop(spu);
    assert_eq!(session.read32(npc).unwrap(), 0x80);
}

#[test]
fn test_session_drop_stops_running_units() {
    let session = session();
    let spu = session.create_raw_spu(1).unwrap();
    fill_with_nops(&spu);
    start(&session, &spu, 0);
    assert!(wait_until(|| spu.context().retired > 0));

    let memory = session.memory().clone();
    let objects = session.objects().clone();
    let id = spu.id();
    drop(session);

    assert!(spu.is_shut_down());
    assert_eq!(spu.state(), RunState::Stopped);
    let retired = spu.context().retired;
    thread::sleep(Duration::from_millis(20));
    assert_eq!(spu.context().retired, retired);
    assert!(!objects.check_id(id));
    assert!(objects.is_empty());
    assert!(!memory.is_mmio(reg(&spu, SPU_STATUS)));
    assert!(!memory.is_mapped(raw_spu_ls_addr(1), 4));
}
