//! Simulated VT-d unit used by the unit tests.
//!
//! The register file is a map of offsets to values with a write log. The
//! model consumes queued-invalidation descriptors when the tail is written,
//! honours wait descriptors after a configurable number of FSTS reads, latches
//! IQE on demand, and implements the write-1-to-clear fault registers. Wait
//! descriptors still outstanding at the next doorbell retire first, in ring
//! order.
//!
//! Physical addresses are identity-mapped: descriptor and status addresses
//! handed to the unit are plain heap pointers.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::read_volatile;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, MutexGuard};
use x86_64::PhysAddr;

use crate::qi::QiDescriptor;
use crate::regs::*;
use crate::{IsrHandler, Platform};

/// FRO = 0x22 (records at 0x220), NFR = 3 (four records).
pub const SIM_CAP: u64 = (0x22u64 << 24) | (3u64 << 40);

/// Byte offset of the first simulated fault record.
pub const SIM_FRCD_BASE: usize = 0x220;

/// Number of simulated fault records.
pub const SIM_FRCD_COUNT: usize = 4;

const QI_WAIT_TYPE: u64 = 5;
const QI_WAIT_SW: u64 = 1 << 5;
const FRCD_F: u64 = 1 << 63;

/// Mutable state of the simulated unit.
pub struct SimState {
    regs: BTreeMap<usize, u64>,
    /// Every register write, in order.
    pub log: Vec<(usize, u64)>,
    /// GSTS bits that never acknowledge.
    pub stuck_status: u32,
    /// FSTS reads after a doorbell before the wait status is written.
    /// `None` drops wait descriptors on the floor.
    pub completion_delay: Option<u32>,
    /// Latch IQE on this FSTS read after a doorbell (`Some(0)` at the doorbell).
    pub queue_error_after: Option<u32>,
    /// Descriptors consumed from the ring.
    pub consumed: Vec<QiDescriptor>,
    /// Total FSTS reads.
    pub fsts_reads: u32,
    reads_since_doorbell: u32,
    pending_status: Vec<(usize, u32)>,
    head: u64,
}

impl SimState {
    fn new() -> Self {
        let mut regs = BTreeMap::new();
        regs.insert(VTD_REG_CAP, SIM_CAP);
        regs.insert(
            VTD_REG_ECAP,
            (ExtendedCapability::QUEUED_INVALIDATION | ExtendedCapability::INTERRUPT_REMAPPING)
                .bits(),
        );
        regs.insert(VTD_REG_FECTL, FaultEventControl::IM.bits() as u64);
        Self {
            regs,
            log: Vec::new(),
            stuck_status: 0,
            completion_delay: Some(0),
            queue_error_after: None,
            consumed: Vec::new(),
            fsts_reads: 0,
            reads_since_doorbell: 0,
            pending_status: Vec::new(),
            head: 0,
        }
    }

    /// Raw register value, bypassing read side effects.
    pub fn reg(&self, offset: usize) -> u64 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    /// Set a register value without logging it.
    pub fn set_reg(&mut self, offset: usize, value: u64) {
        self.regs.insert(offset, value);
    }

    /// Values written to one register, in order.
    pub fn writes_to(&self, offset: usize) -> Vec<u64> {
        self.log
            .iter()
            .filter(|(off, _)| *off == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Offsets written, in order.
    pub fn write_offsets(&self) -> Vec<usize> {
        self.log.iter().map(|(off, _)| *off).collect()
    }

    /// Record a pending fault in slot `index`.
    pub fn inject_fault(&mut self, index: usize, lo: u64, hi: u64) {
        let off = SIM_FRCD_BASE + index * 16;
        self.regs.insert(off, lo);
        self.regs.insert(off + 8, hi | FRCD_F);
    }

    /// Latch FSTS status bits.
    pub fn latch(&mut self, bits: FaultStatus) {
        let current = self.reg(VTD_REG_FSTS);
        self.regs.insert(VTD_REG_FSTS, current | bits.bits() as u64);
    }

    /// Whether fault record `index` still has F set.
    pub fn fault_pending(&self, index: usize) -> bool {
        self.reg(SIM_FRCD_BASE + index * 16 + 8) & FRCD_F != 0
    }

    fn fault_status(&self) -> u32 {
        let mut status = self.reg(VTD_REG_FSTS) as u32;
        if let Some(first) = (0..SIM_FRCD_COUNT).find(|&i| self.fault_pending(i)) {
            status |= FaultStatus::PPF.bits() | ((first as u32) << 8);
        }
        status
    }

    fn read_fsts(&mut self) -> u32 {
        self.fsts_reads += 1;
        self.reads_since_doorbell += 1;
        if self.queue_error_after == Some(self.reads_since_doorbell) {
            self.latch(FaultStatus::IQE);
        }
        if let Some(delay) = self.completion_delay {
            if delay == self.reads_since_doorbell {
                self.post_status();
            }
        }
        self.fault_status()
    }

    fn post_status(&mut self) {
        for (addr, data) in self.pending_status.drain(..) {
            // SAFETY: status addresses come from a live `Box<AtomicU32>`.
            unsafe { (*(addr as *const AtomicU32)).store(data, Ordering::Release) };
        }
    }

    fn doorbell(&mut self, tail: u64) {
        self.post_status();

        let base = (self.reg(VTD_REG_IQA) & !0xFFF) as usize;
        while self.head != tail {
            let addr = base + self.head as usize;
            // SAFETY: IQA points at the live ring page of the `QiRing` under test.
            let desc = unsafe { read_volatile(addr as *const QiDescriptor) };
            self.consumed.push(desc);
            let is_wait = desc.lo & 0xF == QI_WAIT_TYPE && desc.lo & QI_WAIT_SW != 0;
            if is_wait && self.completion_delay.is_some() {
                let status_addr = (desc.hi & !3) as usize;
                self.pending_status.push((status_addr, (desc.lo >> 32) as u32));
            }
            self.head = (self.head + 16) % 4096;
        }
        self.regs.insert(VTD_REG_IQH, self.head);

        self.reads_since_doorbell = 0;
        if self.queue_error_after == Some(0) {
            self.latch(FaultStatus::IQE);
        }
        if self.completion_delay == Some(0) {
            self.post_status();
        }
    }

    fn write(&mut self, offset: usize, value: u64) {
        self.log.push((offset, value));
        match offset {
            VTD_REG_GCMD => {
                let status = value as u32 & !self.stuck_status;
                self.regs.insert(VTD_REG_GCMD, value);
                self.regs.insert(VTD_REG_GSTS, status as u64);
            }
            VTD_REG_FSTS => {
                let clear = value & FaultStatus::LATCHED.bits() as u64;
                let current = self.reg(VTD_REG_FSTS);
                self.regs.insert(VTD_REG_FSTS, current & !clear);
            }
            VTD_REG_IQT => {
                self.regs.insert(VTD_REG_IQT, value);
                self.doorbell(value);
            }
            VTD_REG_IQA => {
                self.head = 0;
                self.regs.insert(VTD_REG_IQH, 0);
                self.regs.insert(VTD_REG_IQA, value);
            }
            off if (SIM_FRCD_BASE..SIM_FRCD_BASE + SIM_FRCD_COUNT * 16).contains(&off) => {
                // Only F is writable (W1C); the rest of the record is RO.
                if (off - SIM_FRCD_BASE) % 16 == 8 && value & FRCD_F != 0 {
                    let current = self.reg(off);
                    self.regs.insert(off, current & !FRCD_F);
                }
            }
            VTD_REG_GSTS | VTD_REG_CAP | VTD_REG_ECAP | VTD_REG_IQH => {}
            _ => {
                self.regs.insert(offset, value);
            }
        }
    }

    fn read(&mut self, offset: usize) -> u64 {
        match offset {
            VTD_REG_FSTS => self.read_fsts() as u64,
            _ => self.reg(offset),
        }
    }
}

/// Shared handle to the simulated register file.
#[derive(Clone)]
pub struct SimRegisters {
    state: Arc<Mutex<SimState>>,
}

impl SimRegisters {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Lock the model for inspection or fault injection.
    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock()
    }
}

impl RegisterWindow for SimRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.state.lock().read(offset) as u32
    }

    fn read64(&self, offset: usize) -> u64 {
        self.state.lock().read(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.state.lock().write(offset, value as u64);
    }

    fn write64(&self, offset: usize, value: u64) {
        self.state.lock().write(offset, value);
    }
}

/// Platform side of the simulation.
pub struct SimPlatform {
    pub regs: SimRegisters,
    pub mappable: bool,
    pub irqs_available: bool,
    pub logical_id: Option<u32>,
    pub next_irq: Mutex<u32>,
    pub next_vector: Mutex<u8>,
    pub isrs: Mutex<Vec<(u32, u8, IsrHandler)>>,
    pub flushes: Mutex<Vec<(usize, usize)>>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            regs: SimRegisters::new(),
            mappable: true,
            irqs_available: true,
            logical_id: None,
            next_irq: Mutex::new(40),
            next_vector: Mutex::new(0x30),
            isrs: Mutex::new(Vec::new()),
            flushes: Mutex::new(Vec::new()),
        }
    }

    /// Run every connected fault handler.
    pub fn fire_isrs(&self) {
        for (_, _, handler) in self.isrs.lock().iter() {
            handler();
        }
    }
}

impl Platform for SimPlatform {
    type Window = SimRegisters;

    fn map_registers(&self) -> Option<SimRegisters> {
        self.mappable.then(|| self.regs.clone())
    }

    fn allocate_irq(&self) -> Option<u32> {
        if !self.irqs_available {
            return None;
        }
        let mut next = self.next_irq.lock();
        let irq = *next;
        *next += 1;
        Some(irq)
    }

    fn allocate_vector(&self) -> Option<u8> {
        if !self.irqs_available {
            return None;
        }
        let mut next = self.next_vector.lock();
        let vector = *next;
        *next += 1;
        Some(vector)
    }

    fn connect_isr(&self, irq: u32, vector: u8, handler: IsrHandler) {
        self.isrs.lock().push((irq, vector, handler));
    }

    fn msi_address(&self, irq: u32) -> u32 {
        0xFEE0_0000 | (irq << 12)
    }

    fn logical_destination(&self) -> Option<u32> {
        self.logical_id
    }

    fn flush_dcache(&self, addr: usize, len: usize) {
        self.flushes.lock().push((addr, len));
    }

    fn virt_to_phys(&self, virt: usize) -> PhysAddr {
        PhysAddr::new(virt as u64)
    }
}

