//! Raw SPU memory map and problem-state register offsets.

/// Base of the raw SPU window.
pub const RAW_SPU_BASE_ADDR: u32 = 0xE000_0000;
/// Address stride between consecutive raw SPU units.
pub const RAW_SPU_OFFSET: u32 = 0x0010_0000;
/// Local store offset inside a unit's window.
pub const RAW_SPU_LS_OFFSET: u32 = 0x0000_0000;
/// Problem-state area offset inside a unit's window.
pub const RAW_SPU_PROB_OFFSET: u32 = 0x0004_0000;

/// Maximum number of raw SPUs a session can create.
pub const MAX_RAW_SPU: u32 = 5;

/// Local store size (256KB).
pub const LS_SIZE: u32 = 0x0004_0000;
/// Instruction addresses are word aligned and wrap inside the local store.
pub const LS_ADDR_MASK: u32 = LS_SIZE - 4;

/// Length of the problem-state aperture.
pub const APERTURE_SIZE: u32 = RAW_SPU_OFFSET - RAW_SPU_PROB_OFFSET;

/// Absolute address of problem-state register `offset` of unit `index`.
#[inline]
pub const fn raw_spu_reg_addr(index: u32, offset: u32) -> u32 {
    RAW_SPU_OFFSET * index + RAW_SPU_BASE_ADDR + RAW_SPU_PROB_OFFSET + offset
}

/// Absolute local store base of unit `index`.
#[inline]
pub const fn raw_spu_ls_addr(index: u32) -> u32 {
    RAW_SPU_OFFSET * index + RAW_SPU_BASE_ADDR + RAW_SPU_LS_OFFSET
}

pub const MFC_LSA: u32 = 0x3004;
pub const MFC_EAH: u32 = 0x3008;
pub const MFC_EAL: u32 = 0x300C;
pub const MFC_SIZE_TAG: u32 = 0x3010;
/// Write: enqueue command. Read: command status.
pub const MFC_CLASS_CMD: u32 = 0x3014;
pub const MFC_QSTATUS: u32 = 0x3104;
pub const PRXY_QUERY_TYPE: u32 = 0x3204;
pub const PRXY_QUERY_MASK: u32 = 0x321C;
pub const PRXY_TAG_STATUS: u32 = 0x322C;
pub const SPU_OUT_MBOX: u32 = 0x4004;
pub const SPU_IN_MBOX: u32 = 0x400C;
pub const SPU_MBOX_STATUS: u32 = 0x4014;
pub const SPU_RUN_CNTL: u32 = 0x401C;
pub const SPU_STATUS: u32 = 0x4024;
pub const SPU_NPC: u32 = 0x4034;
pub const SPU_RD_SIG_NOTIFY1: u32 = 0x1_400C;
pub const SPU_RD_SIG_NOTIFY2: u32 = 0x1_C00C;

/// `SPU_RunCntl` values.
pub const SPU_RUNCNTL_STOP: u32 = 0;
pub const SPU_RUNCNTL_RUNNABLE: u32 = 1;

/// `SPU_Status` bits.
pub const SPU_STATUS_STOPPED: u32 = 0x0;
pub const SPU_STATUS_RUNNING: u32 = 0x1;
pub const SPU_STATUS_STOPPED_BY_STOP: u32 = 0x2;
pub const SPU_STATUS_STOPPED_BY_HALT: u32 = 0x4;

/// MFC command opcodes (low byte of `MFC_Class_CMD`).
pub const MFC_PUT_CMD: u32 = 0x20;
pub const MFC_GET_CMD: u32 = 0x40;
/// Largest single DMA transfer.
pub const MFC_MAX_TRANSFER: u32 = 0x4000;
/// `MFC_QStatus`: queue empty with all proxy slots free.
pub const MFC_PROXY_QUEUE_EMPTY: u32 = 0x8000_0000 | 8;

/// Inbound mailbox depth.
pub const SPU_IN_MBOX_DEPTH: usize = 4;
