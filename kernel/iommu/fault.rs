//! VT-d Fault Reporting
//!
//! The unit reports faults through the Fault Status Register and an array of
//! Fault Recording Registers, and raises a fault event interrupt programmed
//! through FEDATA/FEADDR.
//!
//! ```text
//!   FSTS  [15:8] FRI ---+
//!         [1]    PPF    |
//!                       v
//!   FRCD  +--------+--------+--------+--------+
//!         | rec 0  | rec 1  |  ...   | rec N  |   N = CAP.NFR
//!         +--------+--------+--------+--------+
//!         ^
//!         +-- CAP.FRO * 16 from the register base
//! ```
//!
//! Draining runs in interrupt context. It only touches fault registers, so
//! [`FaultChannel`] is a detachable handle that never borrows the controller.
//!
//! # References
//!
//! - Intel VT-d Specification, Chapter 7 (Fault Logging)
//! - Intel VT-d Specification, Section 10.4.14 (Fault Recording Registers)
//! - Intel VT-d Specification, Appendix A (Fault Reason Encodings)

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, error, warn};

use crate::regs::{
    Capability, FaultEventControl, FaultStatus, RegisterWindow, VTD_REG_CAP, VTD_REG_FEADDR,
    VTD_REG_FECTL, VTD_REG_FEDATA, VTD_REG_FEUADDR, VTD_REG_FSTS,
};

// ============================================================================
// Constants
// ============================================================================

/// Fault Recording entry size (128 bits = 16 bytes).
const FRCD_ENTRY_SIZE: usize = 16;

/// F (Fault) bit, bit 63 of the high qword.
const FRCD_HI_F: u64 = 1 << 63;

/// T (Type) bit, bit 62 of the high qword: 1 = read request.
const FRCD_HI_T: u64 = 1 << 62;

/// FR (Fault Reason), bits 39:32 of the high qword.
const FRCD_HI_FR_SHIFT: u64 = 32;
const FRCD_HI_FR_MASK: u64 = 0xFF;

const FRCD_HI_SID_MASK: u64 = 0xFFFF;

/// FI (Fault Info), bits 63:12 of the low qword.
const FRCD_LO_FI_MASK: u64 = !0xFFF;

// ============================================================================
// Fault Conditions
// ============================================================================

/// One condition latched in the Fault Status Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCondition {
    /// A primary fault was dropped because every record was in use.
    PrimaryOverflow,
    /// At least one primary fault record is pending.
    PrimaryPending,
    /// Advanced fault log overflowed.
    AdvancedOverflow,
    /// Advanced fault log has entries.
    AdvancedPending,
    /// The unit rejected a queued invalidation descriptor.
    InvalidationQueueError,
    /// A device-TLB invalidation completion was invalid.
    InvalidationCompletionError,
    /// A device-TLB invalidation timed out.
    InvalidationTimeout,
}

const CONDITIONS: [(FaultStatus, FaultCondition); 7] = [
    (FaultStatus::PFO, FaultCondition::PrimaryOverflow),
    (FaultStatus::PPF, FaultCondition::PrimaryPending),
    (FaultStatus::AFO, FaultCondition::AdvancedOverflow),
    (FaultStatus::APF, FaultCondition::AdvancedPending),
    (FaultStatus::IQE, FaultCondition::InvalidationQueueError),
    (FaultStatus::ICE, FaultCondition::InvalidationCompletionError),
    (FaultStatus::ITE, FaultCondition::InvalidationTimeout),
];

impl FaultCondition {
    /// Conditions set in `status`, in bit order.
    pub fn from_status(status: FaultStatus) -> impl Iterator<Item = FaultCondition> {
        CONDITIONS
            .into_iter()
            .filter(move |(bit, _)| status.contains(*bit))
            .map(|(_, condition)| condition)
    }

    /// Whether the condition reports an invalidation failure.
    pub fn is_invalidation_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidationQueueError
                | Self::InvalidationCompletionError
                | Self::InvalidationTimeout
        )
    }

    /// Whether faults were lost.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::PrimaryOverflow | Self::AdvancedOverflow)
    }
}

// ============================================================================
// Fault Records
// ============================================================================

/// VT-d fault reason codes.
///
/// These correspond to the FR (Fault Reason) field in fault recording registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// Root table entry not present.
    RootEntryNotPresent,
    /// Context entry not present.
    ContextEntryNotPresent,
    /// Context entry invalid.
    ContextEntryInvalid,
    /// Address beyond MGAW (Maximum Guest Address Width).
    AddressBeyondMgaw,
    /// Write request to read-only page.
    WriteToReadOnly,
    /// Read request to no-read page.
    ReadNotPermitted,
    /// Interrupt request with a reserved field set.
    InterruptRequestReserved,
    /// Interrupt index beyond the table size programmed in IRTA.
    InterruptIndexBeyondTable,
    /// IRTE not present.
    IrteNotPresent,
    /// The unit could not read the IRTE.
    IrteAccessError,
    /// IRTE with a reserved field set.
    IrteReserved,
    /// Compatibility-format interrupt blocked (CFI clear).
    CompatibilityBlocked,
    /// Requester ID failed IRTE source validation.
    SourceIdMismatch,
    /// Unknown fault reason.
    Unknown(u8),
}

impl FaultReason {
    /// Decode fault reason from hardware code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x1 => Self::RootEntryNotPresent,
            0x2 => Self::ContextEntryNotPresent,
            0x3 => Self::ContextEntryInvalid,
            0x4 => Self::AddressBeyondMgaw,
            0x5 => Self::WriteToReadOnly,
            0x6 => Self::ReadNotPermitted,
            0x20 => Self::InterruptRequestReserved,
            0x21 => Self::InterruptIndexBeyondTable,
            0x22 => Self::IrteNotPresent,
            0x23 => Self::IrteAccessError,
            0x24 => Self::IrteReserved,
            0x25 => Self::CompatibilityBlocked,
            0x26 => Self::SourceIdMismatch,
            other => Self::Unknown(other),
        }
    }

    /// Whether the fault was raised by interrupt remapping.
    pub fn is_remapping_fault(&self) -> bool {
        matches!(
            self,
            Self::InterruptRequestReserved
                | Self::InterruptIndexBeyondTable
                | Self::IrteNotPresent
                | Self::IrteAccessError
                | Self::IrteReserved
                | Self::CompatibilityBlocked
                | Self::SourceIdMismatch
        )
    }

    /// Check if this fault indicates a potential security issue.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::SourceIdMismatch
                | Self::CompatibilityBlocked
                | Self::InterruptIndexBeyondTable
                | Self::WriteToReadOnly
                | Self::ReadNotPermitted
        )
    }
}

/// Request kind recorded with a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
}

/// Parsed fault record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Slot the record was read from.
    pub index: usize,
    /// PCI Source ID (bus << 8 | device << 3 | function).
    pub source_id: u16,
    pub reason: FaultReason,
    pub access: FaultAccess,
    /// Faulting address for DMA faults, interrupt index in bits 63:48 for
    /// remapping faults.
    pub fault_info: u64,
}

impl FaultRecord {
    /// Decode one recording register pair. The F bit is not checked.
    pub fn decode(index: usize, lo: u64, hi: u64) -> Self {
        Self {
            index,
            source_id: (hi & FRCD_HI_SID_MASK) as u16,
            reason: FaultReason::from_code(((hi >> FRCD_HI_FR_SHIFT) & FRCD_HI_FR_MASK) as u8),
            access: if hi & FRCD_HI_T != 0 {
                FaultAccess::Read
            } else {
                FaultAccess::Write
            },
            fault_info: lo & FRCD_LO_FI_MASK,
        }
    }

    /// Get the PCI bus number from source ID.
    #[inline]
    pub fn bus(&self) -> u8 {
        (self.source_id >> 8) as u8
    }

    /// Get the PCI device number from source ID.
    #[inline]
    pub fn device(&self) -> u8 {
        ((self.source_id >> 3) & 0x1F) as u8
    }

    /// Get the PCI function number from source ID.
    #[inline]
    pub fn function(&self) -> u8 {
        (self.source_id & 0x7) as u8
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {}: {:02x}:{:02x}.{} {:?} {:?} info={:#x}{}",
            self.index,
            self.bus(),
            self.device(),
            self.function(),
            self.access,
            self.reason,
            self.fault_info,
            if self.reason.is_security_relevant() {
                " [SECURITY]"
            } else {
                ""
            }
        )
    }
}

// ============================================================================
// Fault Channel
// ============================================================================

/// Location of the fault recording registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultGeometry {
    /// Byte offset of record 0 from the register base.
    pub record_offset: usize,
    /// Number of records.
    pub record_count: usize,
}

impl FaultGeometry {
    /// Read the geometry from the capability register.
    pub fn discover<W: RegisterWindow>(regs: &W) -> Self {
        let cap = Capability(regs.read64(VTD_REG_CAP));
        Self {
            record_offset: cap.fault_record_offset(),
            record_count: cap.fault_record_count(),
        }
    }

    fn record(&self, index: usize) -> usize {
        self.record_offset + index * FRCD_ENTRY_SIZE
    }
}

/// Result of one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSummary {
    /// FSTS as read at the start of the drain.
    pub status: FaultStatus,
    /// Records reported and acknowledged.
    pub records: usize,
}

impl FaultSummary {
    /// Nothing was latched and no record was processed.
    pub fn is_empty(&self) -> bool {
        self.status.is_empty() && self.records == 0
    }
}

/// Running fault counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub drains: u64,
    pub records: u64,
    pub overflows: u64,
    pub invalidation_errors: u64,
}

#[derive(Default)]
struct FaultCounters {
    drains: AtomicU64,
    records: AtomicU64,
    overflows: AtomicU64,
    invalidation_errors: AtomicU64,
}

/// Handle on the unit's fault registers.
///
/// Clones share counters; the geometry is fixed at discovery.
#[derive(Clone)]
pub struct FaultChannel<W: RegisterWindow> {
    regs: W,
    geometry: FaultGeometry,
    counters: Arc<FaultCounters>,
    log_records: bool,
}

impl<W: RegisterWindow> FaultChannel<W> {
    /// Discover the fault record geometry.
    pub fn discover(regs: W, log_records: bool) -> Self {
        let geometry = FaultGeometry::discover(&regs);
        debug!(
            "VT-d: {} fault records at {:#x}",
            geometry.record_count, geometry.record_offset
        );
        Self {
            regs,
            geometry,
            counters: Arc::new(FaultCounters::default()),
            log_records,
        }
    }

    pub fn geometry(&self) -> FaultGeometry {
        self.geometry
    }

    /// Program the fault event message.
    pub fn program_event(&self, vector: u8, address: u32) {
        self.regs.write32(VTD_REG_FEDATA, vector as u32);
        self.regs.write32(VTD_REG_FEADDR, address);
        self.regs.write32(VTD_REG_FEUADDR, 0);
    }

    /// Acknowledge every latched status bit.
    pub fn clear_status(&self) {
        let status = FaultStatus::from_bits_retain(self.regs.read32(VTD_REG_FSTS));
        self.regs.write32(VTD_REG_FSTS, (status & FaultStatus::LATCHED).bits());
    }

    /// Allow fault events to interrupt the CPU.
    pub fn unmask(&self) {
        let ctl = FaultEventControl::from_bits_retain(self.regs.read32(VTD_REG_FECTL));
        self.regs
            .write32(VTD_REG_FECTL, (ctl - FaultEventControl::IM).bits());
    }

    /// Hold fault events pending.
    pub fn mask(&self) {
        let ctl = FaultEventControl::from_bits_retain(self.regs.read32(VTD_REG_FECTL));
        self.regs
            .write32(VTD_REG_FECTL, (ctl | FaultEventControl::IM).bits());
    }

    /// Drain pending faults, logging each record.
    pub fn drain(&self) -> FaultSummary {
        self.drain_with(|_| {})
    }

    /// Drain pending faults and pass each record to `report`.
    ///
    /// Records are walked from FRI to the last slot without wrapping. Each
    /// record with F set is acknowledged by writing it back; FSTS is written
    /// last with the latched bits that were observed.
    pub fn drain_with<F: FnMut(&FaultRecord)>(&self, mut report: F) -> FaultSummary {
        let status = FaultStatus::from_bits_retain(self.regs.read32(VTD_REG_FSTS));
        self.counters.drains.fetch_add(1, Ordering::Relaxed);

        for condition in FaultCondition::from_status(status) {
            if condition.is_invalidation_error() {
                self.counters.invalidation_errors.fetch_add(1, Ordering::Relaxed);
                error!("VT-d: {:?}", condition);
            } else if condition.is_overflow() {
                self.counters.overflows.fetch_add(1, Ordering::Relaxed);
                warn!("VT-d: {:?}, faults were lost", condition);
            } else {
                debug!("VT-d: {:?}", condition);
            }
        }

        let mut records = 0;
        if status.contains(FaultStatus::PPF) {
            let first = status.fault_record_index() as usize;
            for index in first..self.geometry.record_count {
                let offset = self.geometry.record(index);
                let lo = self.regs.read64(offset);
                let hi = self.regs.read64(offset + 8);
                if hi & FRCD_HI_F == 0 {
                    continue;
                }

                let record = FaultRecord::decode(index, lo, hi);
                if self.log_records {
                    warn!("VT-d: fault {}", record);
                }
                report(&record);

                // Writing the record back clears F (W1C).
                self.regs.write64(offset, lo);
                self.regs.write64(offset + 8, hi);
                records += 1;
            }
        }
        self.counters
            .records
            .fetch_add(records as u64, Ordering::Relaxed);

        self.regs
            .write32(VTD_REG_FSTS, (status & FaultStatus::LATCHED).bits());

        FaultSummary { status, records }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> FaultStats {
        FaultStats {
            drains: self.counters.drains.load(Ordering::Relaxed),
            records: self.counters.records.load(Ordering::Relaxed),
            overflows: self.counters.overflows.load(Ordering::Relaxed),
            invalidation_errors: self.counters.invalidation_errors.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
