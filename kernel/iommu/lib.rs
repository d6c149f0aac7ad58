//! VT-d Interrupt Remapping for Zero-OS
//!
//! This crate drives the interrupt-remapping half of an Intel VT-d unit:
//! the Interrupt Remapping Table (IRT), the Queued Invalidation (QI) command
//! ring used to flush the hardware's interrupt-entry and context caches, and
//! the asynchronous fault-reporting channel.
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +------------------+     +------------------+
//! | PCI Device       |     | IOAPIC pin       |     | PCI Device       |
//! | (MSI, remapped)  |     | (remapped)       |     | (MSI, remapped)  |
//! +--------+---------+     +--------+---------+     +--------+---------+
//!          |                        |                        |
//!          v                        v                        v
//!    +-----------------------------------------------------------+
//!    |          Interrupt Remapping Table (256 IRTEs)            |
//!    |  written by `Controller::remap`, invalidated through QI   |
//!    +----------------------------+------------------------------+
//!                                 |
//!                                 v
//!    +-----------------------------------------------------------+
//!    |                LAPIC / x2APIC delivery                    |
//!    +-----------------------------------------------------------+
//! ```
//!
//! # Usage
//!
//! 1. Implement [`Platform`] for the board: register mapping, IRQ/vector
//!    allocation, ISR wiring, MSI addressing, cache maintenance.
//! 2. Call [`Controller::init`] once during early boot, before legacy
//!    interrupt controllers route anything through the unit.
//! 3. Reserve IRTE indexes with [`Controller::allocate_entries`] and program
//!    them with [`Controller::remap`]; hand [`encode_msi_address`] results to
//!    devices.
//!
//! # Concurrency
//!
//! Table and ring mutators take `&mut self` and are not internally
//! synchronized. Wrap the controller in a [`SharedController`] when more than
//! one CPU configures interrupts. The fault channel runs on its own vector and
//! only touches fault registers.
//!
//! # References
//!
//! - Intel VT-d Specification, Chapter 5 (Interrupt Remapping)
//! - Intel VT-d Specification, Section 6.5 (Queued Invalidation)
//! - Intel VT-d Specification, Chapter 7 (Fault Logging)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fault;
pub mod interrupt;
pub mod qi;
pub mod regs;
pub mod vtd;

#[cfg(test)]
mod sim;

use alloc::boxed::Box;
use core::fmt;
use x86_64::PhysAddr;

// Re-export key types
pub use fault::{FaultChannel, FaultCondition, FaultReason, FaultRecord, FaultSummary};
pub use interrupt::{
    encode_msi_address, DeliveryMode, InterruptFlags, Irte, IrteTable, TriggerMode, IRTE_COUNT,
};
pub use qi::{QiCommand, QiRing, QI_POLL_BUDGET};
pub use regs::{MmioWindow, RegisterWindow};
pub use vtd::{Controller, ControllerState, MsiGroup, MsiVector, SharedController};

// ============================================================================
// Errors
// ============================================================================

/// Interrupt remapping errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapError {
    /// Not enough free IRTE indexes for the requested allocation.
    Exhausted,
    /// A QI submission did not complete within the poll budget, or a
    /// command/status handshake never acknowledged.
    Timeout,
    /// Hardware latched an invalidation queue error while a submission was
    /// outstanding.
    QueueFault,
    /// The register window could not be mapped.
    MmioUnavailable,
    /// The IRTE index was never handed out by the allocator.
    Unallocated,
    /// The platform had no IRQ number or vector left for the fault event.
    NoInterruptLine,
    /// The QI ring is not armed yet.
    NotReady,
}

impl RemapError {
    /// Negative errno value reported by the init entry point.
    pub const fn errno(&self) -> i32 {
        match self {
            Self::Exhausted => -16,       // EBUSY
            Self::Timeout => -62,         // ETIME
            Self::QueueFault => -5,       // EIO
            Self::MmioUnavailable => -19, // ENODEV
            Self::Unallocated => -22,     // EINVAL
            Self::NoInterruptLine => -28, // ENOSPC
            Self::NotReady => -11,        // EAGAIN
        }
    }
}

impl fmt::Display for RemapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Exhausted => "interrupt remapping table exhausted",
            Self::Timeout => "invalidation did not complete in time",
            Self::QueueFault => "invalidation queue error",
            Self::MmioUnavailable => "register window unavailable",
            Self::Unallocated => "IRTE index not allocated",
            Self::NoInterruptLine => "no interrupt line for fault events",
            Self::NotReady => "invalidation queue not armed",
        };
        f.write_str(msg)
    }
}

/// Result type for interrupt remapping operations.
pub type RemapResult<T> = Result<T, RemapError>;

// ============================================================================
// Configuration
// ============================================================================

/// What one QI poll iteration does between two reads of the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPause {
    /// Re-read immediately.
    Reread,
    /// Issue this many CPU spin-loop hints before the next read.
    Spin(u32),
}

impl PollPause {
    /// Run one pause.
    #[inline]
    pub fn pause(self) {
        if let Self::Spin(n) = self {
            for _ in 0..n {
                core::hint::spin_loop();
            }
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone, Copy)]
pub struct RemapConfig {
    /// Bind IRTEs to the requester's source ID when the caller provides one.
    pub source_id_check: bool,
    /// Let compatibility-format interrupts bypass remapping on xAPIC systems.
    pub xapic_passthrough: bool,
    /// Maximum poll iterations for QI completion and command handshakes.
    /// The wall-clock bound is `poll_budget` times one register read plus
    /// `poll_pause`; the defaults give about 1 to 5 ms.
    pub poll_budget: u32,
    /// Pause between poll iterations.
    pub poll_pause: PollPause,
    /// Log every drained fault record.
    pub log_fault_records: bool,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            source_id_check: !cfg!(feature = "no_src_id_check"),
            xapic_passthrough: false,
            poll_budget: QI_POLL_BUDGET,
            poll_pause: PollPause::Spin(1024),
            log_fault_records: true,
        }
    }
}

// ============================================================================
// Platform Services
// ============================================================================

/// Fault event handler installed on the fault vector.
pub type IsrHandler = Box<dyn Fn() + Send + Sync>;

/// Services the remapping unit needs from the rest of the kernel.
pub trait Platform {
    /// Register window type produced by [`Platform::map_registers`].
    type Window: RegisterWindow;

    /// Map the unit's register window (uncached).
    fn map_registers(&self) -> Option<Self::Window>;

    /// Allocate a raw IRQ number.
    fn allocate_irq(&self) -> Option<u32>;

    /// Allocate a CPU interrupt vector.
    fn allocate_vector(&self) -> Option<u8>;

    /// Install `handler` on `vector`, bypassing remapping.
    fn connect_isr(&self, irq: u32, vector: u8, handler: IsrHandler);

    /// Compatibility-format MSI address targeting `irq`.
    fn msi_address(&self, irq: u32) -> u32;

    /// This CPU's logical destination ID when x2APIC-style wide addressing is
    /// in use, `None` on xAPIC systems.
    fn logical_destination(&self) -> Option<u32>;

    /// Write back the data cache lines covering `[addr, addr + len)`.
    fn flush_dcache(&self, addr: usize, len: usize);

    /// Translate a kernel virtual address to the address the unit sees.
    fn virt_to_phys(&self, virt: usize) -> PhysAddr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RemapConfig::default();
        assert_eq!(config.poll_budget, QI_POLL_BUDGET);
        assert_eq!(config.poll_pause, PollPause::Spin(1024));
        assert_eq!(config.source_id_check, !cfg!(feature = "no_src_id_check"));
        assert!(!config.xapic_passthrough);
    }

    #[test]
    fn test_errno_codes() {
        assert_eq!(RemapError::Timeout.errno(), -62);
        assert_eq!(RemapError::QueueFault.errno(), -5);
        assert_eq!(RemapError::MmioUnavailable.errno(), -19);
    }
}
