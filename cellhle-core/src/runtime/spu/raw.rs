//! Raw SPU Thread
//!
//! A raw SPU is a coprocessor driven directly by the PPU through its
//! problem-state register window instead of through the OS thread-group API.
//! Each unit owns its local store (mapped as ordinary guest memory) and a
//! control block (reachable only through the MMIO aperture), and runs its
//! instruction loop on a dedicated host thread.
//!
//! # State Machine
//! `Created -> Running <-> Paused -> Stopped`
//! - `SPU_RunCntl = 1` starts or resumes at the current NPC.
//! - `SPU_RunCntl = 0` pauses at the next instruction boundary.
//! - A stop-and-signal instruction pauses with the signal in `SPU_Status`.
//! - A decoder fault stops the unit for good and sets the halt bit.
//! - `shutdown` (or dropping the last handle) stops the unit for good, joins
//!   its thread and removes its mappings and ID.
//!
//! # Locking
//! The control block sits behind one mutex. The execution thread holds it
//! while it executes an instruction and yields it between instructions
//! whenever an MMIO accessor is waiting, so every register access observes
//! the unit at an instruction boundary.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use super::context::SpuContext;
use super::decoder::{BasicDecoder, SpuDecoder, Step};
use super::interrupt::{class2, SpuInterrupts};
use super::regs::*;
use crate::error::{MemoryError, SpuError};
use crate::runtime::id::ObjectRegistry;
use crate::runtime::memory::{AddressSpace, MemoryRegion, MmioHandler};

/// Object registry tag for raw SPU threads.
pub const RAW_SPU_TAG: &str = "RawSPU";

/// Execution state of a raw SPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Constructed, never started.
    Created,
    Running,
    /// Halted at an instruction boundary; can be resumed.
    Paused,
    /// Faulted or shut down. Terminal.
    Stopped,
}

/// MFC proxy and run-control registers.
#[derive(Debug, Clone, Copy, Default)]
struct ProblemState {
    mfc_lsa: u32,
    mfc_eah: u32,
    mfc_eal: u32,
    mfc_size_tag: u32,
    mfc_cmd_status: u32,
    prxy_query_type: u32,
    prxy_query_mask: u32,
    run_cntl: u32,
}

struct Control {
    state: RunState,
    status: u32,
    ctx: SpuContext,
    prob: ProblemState,
    interrupts: SpuInterrupts,
    exit: bool,
}

impl Control {
    fn new() -> Self {
        Self {
            state: RunState::Created,
            status: SPU_STATUS_STOPPED,
            ctx: SpuContext::new(),
            prob: ProblemState::default(),
            interrupts: SpuInterrupts::new(),
            exit: false,
        }
    }
}

/// State shared between the MMIO side and the execution thread.
struct SpuCore {
    index: u32,
    prob_base: u32,
    ls: Arc<MemoryRegion>,
    memory: Weak<AddressSpace>,
    decoder: Arc<dyn SpuDecoder>,
    control: Mutex<Control>,
    changed: Condvar,
    waiters: AtomicUsize,
}

impl SpuCore {
    /// Lock the control block, announcing the wait to the execution thread.
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let guard = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        guard
    }

    /// Latch a class-2 interrupt source.
    fn raise(&self, control: &mut Control, source: u32) {
        if control.interrupts.raise(source) {
            trace!(target: "raw_spu", "RawSPU[{}]: class 2 interrupt 0x{:X}", self.index, source);
        }
    }

    /// Offset of `addr` inside this unit's aperture.
    fn offset(&self, addr: u32) -> Result<u32, MemoryError> {
        if !MmioHandler::contains(self, addr) {
            error!(
                target: "raw_spu",
                "RawSPU[{}]: access 0x{:08X} outside aperture 0x{:08X}",
                self.index, addr, self.prob_base
            );
            return Err(MemoryError::Misrouted {
                addr,
                base: self.prob_base,
            });
        }
        Ok(addr - self.prob_base)
    }

    fn read_reg(&self, addr: u32) -> Result<u32, MemoryError> {
        let offset = self.offset(addr)?;
        let mut control = self.lock();
        let value = match offset {
            MFC_LSA => control.prob.mfc_lsa,
            MFC_EAH => control.prob.mfc_eah,
            MFC_EAL => control.prob.mfc_eal,
            MFC_SIZE_TAG => control.prob.mfc_size_tag,
            MFC_CLASS_CMD => control.prob.mfc_cmd_status,
            MFC_QSTATUS => MFC_PROXY_QUEUE_EMPTY,
            PRXY_QUERY_TYPE => control.prob.prxy_query_type,
            PRXY_QUERY_MASK => control.prob.prxy_query_mask,
            // Proxy commands complete synchronously.
            PRXY_TAG_STATUS => control.prob.prxy_query_mask,
            SPU_OUT_MBOX => match control.ctx.out_mbox.take() {
                Some(value) => value,
                None => {
                    warn!(target: "raw_spu", "RawSPU[{}]: read from empty SPU_Out_MBox", self.index);
                    0
                }
            },
            SPU_MBOX_STATUS => control.ctx.mbox_status(),
            SPU_RUN_CNTL => control.prob.run_cntl,
            SPU_STATUS => control.status,
            SPU_NPC => control.ctx.npc(),
            SPU_RD_SIG_NOTIFY1 => control.ctx.signal1,
            SPU_RD_SIG_NOTIFY2 => control.ctx.signal2,
            _ => {
                error!(target: "raw_spu", "RawSPU[{}]: read32(0x{:08X}): unknown register", self.index, addr);
                return Err(MemoryError::UnhandledRegister { addr });
            }
        };
        trace!(target: "raw_spu", "RawSPU[{}]: read32(0x{:05X}) = 0x{:08X}", self.index, offset, value);
        Ok(value)
    }

    fn write_reg(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        let offset = self.offset(addr)?;
        let mut control = self.lock();
        trace!(target: "raw_spu", "RawSPU[{}]: write32(0x{:05X}, 0x{:08X})", self.index, offset, value);
        match offset {
            MFC_LSA => control.prob.mfc_lsa = value,
            MFC_EAH => control.prob.mfc_eah = value,
            MFC_EAL => control.prob.mfc_eal = value,
            MFC_SIZE_TAG => control.prob.mfc_size_tag = value,
            MFC_CLASS_CMD => self.proxy_command(&mut control, value),
            PRXY_QUERY_TYPE => control.prob.prxy_query_type = value,
            PRXY_QUERY_MASK => control.prob.prxy_query_mask = value,
            SPU_IN_MBOX => {
                let in_mbox = &mut control.ctx.in_mbox;
                if in_mbox.len() < SPU_IN_MBOX_DEPTH {
                    in_mbox.push(value);
                } else {
                    warn!(target: "raw_spu", "RawSPU[{}]: SPU_In_MBox full, overwriting newest entry", self.index);
                    if let Some(last) = in_mbox.last_mut() {
                        *last = value;
                    }
                }
            }
            SPU_RUN_CNTL => self.run_control(&mut control, value),
            SPU_NPC => control.ctx.set_npc(value),
            SPU_RD_SIG_NOTIFY1 => control.ctx.signal1 = value,
            SPU_RD_SIG_NOTIFY2 => control.ctx.signal2 = value,
            _ => {
                error!(target: "raw_spu", "RawSPU[{}]: write32(0x{:08X}, 0x{:08X}): unknown register", self.index, addr, value);
                return Err(MemoryError::UnhandledRegister { addr });
            }
        }
        Ok(())
    }

    fn run_control(&self, control: &mut Control, value: u32) {
        control.prob.run_cntl = value;
        match (value, control.state) {
            (_, RunState::Stopped) => {
                warn!(target: "raw_spu", "RawSPU[{}]: SPU_RunCntl = {} ignored, unit is stopped", self.index, value);
            }
            (SPU_RUNCNTL_RUNNABLE, RunState::Created | RunState::Paused) => {
                debug!(target: "raw_spu", "RawSPU[{}]: run at 0x{:05X}", self.index, control.ctx.pc);
                control.state = RunState::Running;
                control.status = SPU_STATUS_RUNNING;
                self.changed.notify_all();
            }
            (SPU_RUNCNTL_STOP, RunState::Running) => {
                debug!(target: "raw_spu", "RawSPU[{}]: paused at 0x{:05X}", self.index, control.ctx.pc);
                control.state = RunState::Paused;
                control.status = SPU_STATUS_STOPPED;
                self.changed.notify_all();
            }
            (SPU_RUNCNTL_RUNNABLE | SPU_RUNCNTL_STOP, _) => {}
            _ => {
                warn!(target: "raw_spu", "RawSPU[{}]: unknown SPU_RunCntl value 0x{:X}", self.index, value);
            }
        }
    }

    /// Execute a proxy DMA command synchronously.
    fn proxy_command(&self, control: &mut Control, value: u32) {
        let cmd = value & 0xFF;
        let ok = match cmd & !0x7 {
            MFC_PUT_CMD | MFC_GET_CMD => self.proxy_dma(&control.prob, cmd),
            _ => {
                warn!(target: "raw_spu", "RawSPU[{}]: unsupported MFC command 0x{:X}", self.index, value);
                false
            }
        };
        if ok {
            control.prob.mfc_cmd_status = 0;
            self.raise(control, class2::DMA_TAG);
        } else {
            control.prob.mfc_cmd_status = 1;
        }
    }

    fn proxy_dma(&self, prob: &ProblemState, cmd: u32) -> bool {
        let size = prob.mfc_size_tag >> 16;
        let lsa = prob.mfc_lsa & (LS_SIZE - 1);
        let ea = prob.mfc_eal;

        if prob.mfc_eah != 0 {
            warn!(target: "raw_spu", "RawSPU[{}]: DMA to 64-bit EA 0x{:08X}{:08X}", self.index, prob.mfc_eah, ea);
            return false;
        }
        if size > MFC_MAX_TRANSFER || lsa + size > LS_SIZE {
            warn!(target: "raw_spu", "RawSPU[{}]: DMA size 0x{:X} at LSA 0x{:05X} out of range", self.index, size, lsa);
            return false;
        }
        let Some(memory) = self.memory.upgrade() else {
            return false;
        };

        let mut buf = vec![0u8; size as usize];
        let result = if cmd & !0x7 == MFC_PUT_CMD {
            self.ls
                .read(lsa, &mut buf)
                .and_then(|()| memory.copy_in(ea, &buf))
        } else {
            memory
                .copy_out(&mut buf, ea)
                .and_then(|()| self.ls.write(lsa, &buf))
        };
        match result {
            Ok(()) => {
                trace!(
                    target: "raw_spu",
                    "RawSPU[{}]: DMA 0x{:02X} lsa=0x{:05X} ea=0x{:08X} size=0x{:X} tag={}",
                    self.index, cmd, lsa, ea, size, prob.mfc_size_tag & 0x1F
                );
                true
            }
            Err(err) => {
                warn!(target: "raw_spu", "RawSPU[{}]: DMA failed: {}", self.index, err);
                false
            }
        }
    }

    /// Instruction loop of the execution thread.
    fn run(&self) {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if control.exit {
                break;
            }
            if control.state != RunState::Running {
                control = self
                    .changed
                    .wait(control)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            let had_intr_mail = control.ctx.out_intr_mbox.is_some();
            let had_in_mail = !control.ctx.in_mbox.is_empty();
            match self.decoder.step(&mut control.ctx, &self.ls) {
                Ok(Step::Continue) => {}
                Ok(Step::Stop(signal)) => {
                    debug!(target: "raw_spu", "RawSPU[{}]: stop 0x{:X}", self.index, signal);
                    control.state = RunState::Paused;
                    control.status = (signal << 16) | SPU_STATUS_STOPPED_BY_STOP;
                    self.raise(&mut control, class2::STOP);
                    self.changed.notify_all();
                }
                Err(fault) => {
                    error!(target: "raw_spu", "RawSPU[{}]: {}; unit halted", self.index, fault);
                    control.state = RunState::Stopped;
                    control.status = SPU_STATUS_STOPPED_BY_HALT;
                    self.raise(&mut control, class2::HALT);
                    self.changed.notify_all();
                }
            }
            if !had_intr_mail && control.ctx.out_intr_mbox.is_some() {
                self.raise(&mut control, class2::MAILBOX);
            }
            if had_in_mail && control.ctx.in_mbox.is_empty() {
                self.raise(&mut control, class2::IN_MBOX_THRESHOLD);
            }

            while self.waiters.load(Ordering::Acquire) > 0 {
                drop(control);
                thread::yield_now();
                control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            }
        }
        trace!(target: "raw_spu", "RawSPU[{}]: thread exit", self.index);
    }
}

impl MmioHandler for SpuCore {
    fn base(&self) -> u32 {
        self.prob_base
    }

    fn size(&self) -> u32 {
        APERTURE_SIZE
    }

    fn read32(&self, addr: u32) -> Result<u32, MemoryError> {
        self.read_reg(addr)
    }

    fn write32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_reg(addr, value)
    }
}

/// A raw SPU: local store, problem-state window and execution thread.
pub struct RawSpuThread {
    index: u32,
    id: u32,
    core: Arc<SpuCore>,
    objects: Arc<ObjectRegistry>,
    memory: Weak<AddressSpace>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl RawSpuThread {
    /// Create unit `index` with the bundled decoder.
    pub fn new(
        index: u32,
        memory: &Arc<AddressSpace>,
        objects: &Arc<ObjectRegistry>,
    ) -> Result<Arc<Self>, SpuError> {
        Self::with_decoder(index, memory, objects, Arc::new(BasicDecoder))
    }

    /// Create unit `index`, mapping its local store and aperture into
    /// `memory` and registering it in `objects`.
    pub fn with_decoder(
        index: u32,
        memory: &Arc<AddressSpace>,
        objects: &Arc<ObjectRegistry>,
        decoder: Arc<dyn SpuDecoder>,
    ) -> Result<Arc<Self>, SpuError> {
        if index >= MAX_RAW_SPU {
            return Err(SpuError::InvalidIndex(index));
        }

        let ls = Arc::new(MemoryRegion::new(raw_spu_ls_addr(index), LS_SIZE));
        let core = Arc::new(SpuCore {
            index,
            prob_base: raw_spu_reg_addr(index, 0),
            ls: ls.clone(),
            memory: Arc::downgrade(memory),
            decoder,
            control: Mutex::new(Control::new()),
            changed: Condvar::new(),
            waiters: AtomicUsize::new(0),
        });

        memory.map_region(ls.clone())?;
        if let Err(err) = memory.register_mmio(core.clone()) {
            let _ = memory.unmap(ls.base());
            return Err(err.into());
        }

        let thread = Arc::new_cyclic(|weak| Self {
            index,
            id: objects.register_weak(weak.clone(), RAW_SPU_TAG),
            core: core.clone(),
            objects: objects.clone(),
            memory: Arc::downgrade(memory),
            worker: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let handle = thread::Builder::new()
            .name(format!("RawSPU[{}]", index))
            .spawn(move || core.run())?;
        *thread
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(target: "raw_spu", "RawSPU[{}] created (id {})", index, thread.id);
        Ok(thread)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Object registry ID of this thread.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// First address of the problem-state aperture.
    pub fn mmio_base(&self) -> u32 {
        self.core.prob_base
    }

    pub fn local_store(&self) -> &Arc<MemoryRegion> {
        &self.core.ls
    }

    /// Reset the register window to power-on defaults.
    ///
    /// A running unit is paused first. Local store contents are kept, and a
    /// stopped unit stays stopped.
    pub fn init_regs(&self) {
        let mut control = self.core.lock();
        if control.state == RunState::Running {
            control.state = RunState::Paused;
        }
        control.ctx.reset();
        control.prob = ProblemState::default();
        control.interrupts.reset();
        if control.state != RunState::Stopped {
            control.status = SPU_STATUS_STOPPED;
        }
        self.core.changed.notify_all();
    }

    /// MMIO read trap. `addr` must lie inside this unit's aperture.
    pub fn read32(&self, addr: u32) -> Result<u32, MemoryError> {
        self.core.read_reg(addr)
    }

    /// MMIO write trap. `addr` must lie inside this unit's aperture.
    pub fn write32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.core.write_reg(addr, value)
    }

    pub fn state(&self) -> RunState {
        self.core.lock().state
    }

    /// Current `SPU_Status` value.
    pub fn status(&self) -> u32 {
        self.core.lock().status
    }

    /// Snapshot of the architectural state.
    pub fn context(&self) -> SpuContext {
        self.core.lock().ctx.clone()
    }

    /// Latched class-2 interrupt sources.
    pub fn interrupt_status(&self) -> u32 {
        self.core.lock().interrupts.pending()
    }

    /// Latched sources that are also unmasked.
    pub fn masked_interrupt_status(&self) -> u32 {
        self.core.lock().interrupts.pending_masked()
    }

    pub fn set_interrupt_mask(&self, mask: u32) {
        self.core.lock().interrupts.set_mask(mask);
    }

    pub fn acknowledge_interrupts(&self, bits: u32) {
        self.core.lock().interrupts.acknowledge(bits);
    }

    /// Block until the unit leaves `Running` or `timeout` elapses.
    pub fn wait_while_running(&self, timeout: Duration) -> RunState {
        let control = self.core.lock();
        let (control, _) = self
            .core
            .changed
            .wait_timeout_while(control, timeout, |c| c.state == RunState::Running)
            .unwrap_or_else(PoisonError::into_inner);
        control.state
    }

    /// Stop the unit for good and release everything it holds.
    ///
    /// Joins the execution thread, releases the object ID and removes the
    /// local store and aperture from the address space. Safe to call more
    /// than once; only the first call does anything. Handles that outlive
    /// the shutdown still answer MMIO traps, but the unit never runs again.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut control = self.core.lock();
            control.exit = true;
            if control.state == RunState::Running {
                control.status = SPU_STATUS_STOPPED;
            }
            control.state = RunState::Stopped;
        }
        self.core.changed.notify_all();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.thread().id() == thread::current().id() {
                warn!(target: "raw_spu", "RawSPU[{}]: shut down from its own thread", self.index);
            } else if handle.join().is_err() {
                error!(target: "raw_spu", "RawSPU[{}]: thread panicked", self.index);
            }
        }

        if let Err(err) = self.objects.release(self.id) {
            debug!(target: "raw_spu", "RawSPU[{}]: {}", self.index, err);
        }
        if let Some(memory) = self.memory.upgrade() {
            if let Err(err) = memory.unregister_mmio(self.core.prob_base) {
                debug!(target: "raw_spu", "RawSPU[{}]: {}", self.index, err);
            }
            if let Err(err) = memory.unmap(self.core.ls.base()) {
                debug!(target: "raw_spu", "RawSPU[{}]: {}", self.index, err);
            }
        }
        info!(target: "raw_spu", "RawSPU[{}] destroyed", self.index);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for RawSpuThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
