//! VT-d register window.
//!
//! Register offsets from the unit's base (VT-d Chapter 10):
//! - 0x08: Capability Register
//! - 0x10: Extended Capability Register
//! - 0x18: Global Command Register
//! - 0x1C: Global Status Register
//! - 0x34: Fault Status Register
//! - 0x38..0x44: Fault Event Control/Data/Address Registers
//! - 0x80..0x90: Invalidation Queue Head/Tail/Address Registers
//! - 0xB8: Interrupt Remapping Table Address Register

use bitflags::bitflags;
use core::ptr::{read_volatile, write_volatile};
use log::trace;

use crate::{PollPause, RemapError, RemapResult};

// ============================================================================
// Register Offsets
// ============================================================================

/// Capability Register (64-bit, RO).
pub const VTD_REG_CAP: usize = 0x08;

/// Extended Capability Register (64-bit, RO).
pub const VTD_REG_ECAP: usize = 0x10;

/// Global Command Register (32-bit, WO).
pub const VTD_REG_GCMD: usize = 0x18;

/// Global Status Register (32-bit, RO).
pub const VTD_REG_GSTS: usize = 0x1C;

/// Fault Status Register (32-bit, R/W1C).
pub const VTD_REG_FSTS: usize = 0x34;

/// Fault Event Control Register (32-bit, R/W).
pub const VTD_REG_FECTL: usize = 0x38;

/// Fault Event Data Register (32-bit, R/W).
pub const VTD_REG_FEDATA: usize = 0x3C;

/// Fault Event Address Register (32-bit, R/W).
pub const VTD_REG_FEADDR: usize = 0x40;

/// Fault Event Upper Address Register (32-bit, R/W).
pub const VTD_REG_FEUADDR: usize = 0x44;

/// Invalidation Queue Head Register (64-bit, RO).
pub const VTD_REG_IQH: usize = 0x80;

/// Invalidation Queue Tail Register (64-bit, R/W).
pub const VTD_REG_IQT: usize = 0x88;

/// Invalidation Queue Address Register (64-bit, R/W).
pub const VTD_REG_IQA: usize = 0x90;

/// Invalidation Completion Status Register (32-bit, R/W1C).
pub const VTD_REG_ICS: usize = 0x9C;

/// Interrupt Remapping Table Address Register (64-bit, R/W).
pub const VTD_REG_IRTA: usize = 0xB8;

// ============================================================================
// Capability Fields
// ============================================================================

/// Fault Recording Register offset (CAP.FRO) - bits 33:24, in 16-byte units.
const CAP_FRO_SHIFT: u64 = 24;
const CAP_FRO_MASK: u64 = 0x3FF;

/// Number of Fault Recording Registers (CAP.NFR) - bits 47:40, zero-based.
const CAP_NFR_SHIFT: u64 = 40;
const CAP_NFR_MASK: u64 = 0xFF;

/// Capability register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability(pub u64);

impl Capability {
    /// Byte offset of the fault recording registers from the unit base.
    pub const fn fault_record_offset(&self) -> usize {
        (((self.0 >> CAP_FRO_SHIFT) & CAP_FRO_MASK) as usize) * 16
    }

    /// Number of fault recording registers.
    pub const fn fault_record_count(&self) -> usize {
        (((self.0 >> CAP_NFR_SHIFT) & CAP_NFR_MASK) as usize) + 1
    }
}

bitflags! {
    /// Extended capability bits used by interrupt remapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtendedCapability: u64 {
        /// Page-walk coherency: hardware snoops CPU caches when reading
        /// remapping structures.
        const PAGE_WALK_COHERENCY = 1 << 0;
        /// Queued invalidation support.
        const QUEUED_INVALIDATION = 1 << 1;
        /// Interrupt remapping support.
        const INTERRUPT_REMAPPING = 1 << 3;
        /// Extended interrupt mode (32-bit x2APIC destination IDs).
        const EXTENDED_INTERRUPT_MODE = 1 << 4;
    }
}

// ============================================================================
// Global Command/Status Bits
// ============================================================================

bitflags! {
    /// Global Command Register bits. Every command has a status bit at the
    /// same position in the Global Status Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalCommand: u32 {
        /// Translation Enable.
        const TE = 1 << 31;
        /// Set Root Table Pointer (one-shot).
        const SRTP = 1 << 30;
        /// Set Fault Log (one-shot).
        const SFL = 1 << 29;
        /// Enable Advanced Fault Logging.
        const EAFL = 1 << 28;
        /// Write Buffer Flush (one-shot).
        const WBF = 1 << 27;
        /// Queued Invalidation Enable.
        const QIE = 1 << 26;
        /// Interrupt Remapping Enable.
        const IRE = 1 << 25;
        /// Set Interrupt Remap Table Pointer (one-shot).
        const SIRTP = 1 << 24;
        /// Compatibility Format Interrupt passthrough.
        const CFI = 1 << 23;
    }
}

bitflags! {
    /// Global Status Register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalStatus: u32 {
        /// Translation Enable Status.
        const TES = 1 << 31;
        /// Root Table Pointer Status.
        const RTPS = 1 << 30;
        /// Fault Log Status.
        const FLS = 1 << 29;
        /// Advanced Fault Logging Status.
        const AFLS = 1 << 28;
        /// Write Buffer Flush Status.
        const WBFS = 1 << 27;
        /// Queued Invalidation Enable Status.
        const QIES = 1 << 26;
        /// Interrupt Remapping Enable Status.
        const IRES = 1 << 25;
        /// Interrupt Remapping Table Pointer Status.
        const IRTPS = 1 << 24;
        /// Compatibility Format Interrupt Status.
        const CFIS = 1 << 23;
    }
}

impl GlobalStatus {
    /// Status bits that mirror a persistent enable and must be carried into
    /// every GCMD write. One-shot bits are dropped so they are not re-issued.
    pub fn persistent_commands(self) -> GlobalCommand {
        let keep = Self::TES | Self::AFLS | Self::QIES | Self::IRES | Self::CFIS;
        GlobalCommand::from_bits_truncate((self & keep).bits())
    }
}

// ============================================================================
// Fault Status Bits
// ============================================================================

bitflags! {
    /// Fault Status Register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultStatus: u32 {
        /// Primary Fault Overflow.
        const PFO = 1 << 0;
        /// Primary Pending Fault.
        const PPF = 1 << 1;
        /// Advanced Fault Overflow.
        const AFO = 1 << 2;
        /// Advanced Pending Fault.
        const APF = 1 << 3;
        /// Invalidation Queue Error.
        const IQE = 1 << 4;
        /// Invalidation Completion Error.
        const ICE = 1 << 5;
        /// Invalidation Time-out Error.
        const ITE = 1 << 6;
    }
}

/// Fault Record Index (FSTS bits 15:8).
const FSTS_FRI_SHIFT: u32 = 8;
const FSTS_FRI_MASK: u32 = 0xFF;

impl FaultStatus {
    /// Bits software acknowledges by writing them back.
    pub const LATCHED: Self = Self::PFO
        .union(Self::AFO)
        .union(Self::APF)
        .union(Self::IQE)
        .union(Self::ICE)
        .union(Self::ITE);

    /// Index of the first pending fault record.
    pub const fn fault_record_index(&self) -> u8 {
        ((self.bits() >> FSTS_FRI_SHIFT) & FSTS_FRI_MASK) as u8
    }
}

bitflags! {
    /// Fault Event Control Register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultEventControl: u32 {
        /// Interrupt Mask.
        const IM = 1 << 31;
        /// Interrupt Pending.
        const IP = 1 << 30;
    }
}

// ============================================================================
// Register Access
// ============================================================================

/// Typed access to a VT-d register window.
///
/// Every call touches exactly one register. Implementations are cheap
/// handles: the fault channel keeps its own copy for interrupt context.
pub trait RegisterWindow: Clone + Send + Sync + 'static {
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;
    /// Read a 64-bit register.
    fn read64(&self, offset: usize) -> u64;
    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);
    /// Write a 64-bit register.
    fn write64(&self, offset: usize, value: u64);
}

/// Memory-mapped register window.
#[derive(Debug, Clone, Copy)]
pub struct MmioWindow {
    base: usize,
    len: usize,
}

impl MmioWindow {
    /// Create a window over `[base, base + len)`.
    ///
    /// # Safety
    ///
    /// The range must stay mapped uncached to a VT-d register block for as
    /// long as any copy of the window exists.
    pub const unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Window base virtual address.
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Address of a naturally aligned `width`-byte register inside the window.
    fn register(&self, offset: usize, width: usize) -> Option<usize> {
        if offset % width != 0 || offset.checked_add(width)? > self.len {
            return None;
        }
        self.base.checked_add(offset)
    }
}

impl RegisterWindow for MmioWindow {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        match self.register(offset, 4) {
            Some(addr) => unsafe { read_volatile(addr as *const u32) },
            None => {
                debug_assert!(false, "VT-d register {:#x} outside window", offset);
                0
            }
        }
    }

    #[inline]
    fn read64(&self, offset: usize) -> u64 {
        match self.register(offset, 8) {
            Some(addr) => unsafe { read_volatile(addr as *const u64) },
            None => {
                debug_assert!(false, "VT-d register {:#x} outside window", offset);
                0
            }
        }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        match self.register(offset, 4) {
            Some(addr) => unsafe { write_volatile(addr as *mut u32, value) },
            None => debug_assert!(false, "VT-d register {:#x} outside window", offset),
        }
    }

    #[inline]
    fn write64(&self, offset: usize, value: u64) {
        match self.register(offset, 8) {
            Some(addr) => unsafe { write_volatile(addr as *mut u64, value) },
            None => debug_assert!(false, "VT-d register {:#x} outside window", offset),
        }
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Iteration budget and pause shared by every busy-wait in the driver.
///
/// No wall-clock timeouts: the unit is brought up before timekeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum number of iterations.
    pub budget: u32,
    /// What happens between two iterations.
    pub pause: PollPause,
}

/// Issue a global command and wait for its status bit.
///
/// GCMD is write-only, so the current enables are rebuilt from GSTS before
/// the new command bit is OR'ed in.
pub fn send_command<W: RegisterWindow>(
    regs: &W,
    command: GlobalCommand,
    poll: PollPolicy,
) -> RemapResult<()> {
    let status = GlobalStatus::from_bits_retain(regs.read32(VTD_REG_GSTS));
    let value = status.persistent_commands() | command;
    trace!("VT-d: GCMD <- {:#010x}", value.bits());
    regs.write32(VTD_REG_GCMD, value.bits());

    let expected = GlobalStatus::from_bits_truncate(command.bits());
    for _ in 0..poll.budget {
        let status = GlobalStatus::from_bits_retain(regs.read32(VTD_REG_GSTS));
        if status.contains(expected) {
            return Ok(());
        }
        poll.pause.pause();
    }
    Err(RemapError::Timeout)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRegisters;

    const POLL: PollPolicy = PollPolicy {
        budget: 8,
        pause: PollPause::Reread,
    };

    #[test]
    fn test_capability_fault_geometry() {
        // FRO = 0x22 (offset 0x220), NFR = 7 (8 records)
        let cap = Capability((0x22u64 << 24) | (7u64 << 40));
        assert_eq!(cap.fault_record_offset(), 0x220);
        assert_eq!(cap.fault_record_count(), 8);
    }

    #[test]
    fn test_fault_record_index() {
        let status = FaultStatus::from_bits_retain(FaultStatus::PPF.bits() | (5 << 8));
        assert_eq!(status.fault_record_index(), 5);
        assert!(status.contains(FaultStatus::PPF));
    }

    #[test]
    fn test_persistent_commands_drop_one_shot_bits() {
        let status = GlobalStatus::QIES | GlobalStatus::IRTPS | GlobalStatus::RTPS;
        assert_eq!(status.persistent_commands(), GlobalCommand::QIE);
    }

    #[test]
    fn test_mmio_window_bounds() {
        let window = unsafe { MmioWindow::new(0x1000, 0x100) };
        assert_eq!(window.register(0xF8, 8), Some(0x10F8));
        assert_eq!(window.register(0xFC, 8), None);
        assert_eq!(window.register(0x100, 4), None);
        assert_eq!(window.register(0x3, 4), None);
    }

    #[test]
    fn test_window_write_read_back() {
        let regs = SimRegisters::new();
        regs.write64(VTD_REG_IRTA, 0x1234_5000);
        regs.write32(VTD_REG_FEDATA, 0x41);
        assert_eq!(regs.read64(VTD_REG_IRTA), 0x1234_5000);
        assert_eq!(regs.read32(VTD_REG_FEDATA), 0x41);
    }

    #[test]
    fn test_send_command_preserves_enables() {
        let regs = SimRegisters::new();
        send_command(&regs, GlobalCommand::QIE, POLL).unwrap();
        send_command(&regs, GlobalCommand::IRE, POLL).unwrap();

        let gcmd = regs.state().writes_to(VTD_REG_GCMD);
        let both = (GlobalCommand::QIE | GlobalCommand::IRE).bits() as u64;
        assert_eq!(gcmd.last().copied(), Some(both));
    }

    #[test]
    fn test_send_command_times_out() {
        let regs = SimRegisters::new();
        regs.state().stuck_status = GlobalStatus::IRES.bits();
        assert_eq!(
            send_command(&regs, GlobalCommand::IRE, POLL),
            Err(RemapError::Timeout)
        );
    }
}
