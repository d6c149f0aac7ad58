//! Queued Invalidation
//!
//! Invalidation requests reach the unit through a ring of 128-bit
//! descriptors in memory. Software writes descriptors at the tail and moves
//! the tail register; hardware consumes them at the head.
//!
//! ```text
//!   IQA -> +---------------------+ slot 0
//!          | command             |
//!          | wait (status write) |
//!          | ...                 |
//!   IQH -> | consumed up to here |
//!          | ...                 |
//!   IQT -> | next free slot      |
//!          +---------------------+ slot 255
//! ```
//!
//! Every submission is a command followed by a wait descriptor that stores
//! a per-submission token into a software-owned status word. The submitter
//! busy-polls that word for its own token, so a late write from a submission
//! that already timed out cannot complete the next one.
//!
//! # References
//!
//! - Intel VT-d Specification, Section 6.5.2 (Queued Invalidation Interface)
//! - Intel VT-d Specification, Section 6.5.2.7 (Invalidation Wait Descriptor)

use alloc::boxed::Box;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, AtomicU32, Ordering};
use log::{error, trace};
use x86_64::PhysAddr;

use crate::regs::{
    send_command, FaultStatus, GlobalCommand, PollPolicy, RegisterWindow, VTD_REG_FSTS,
    VTD_REG_IQA, VTD_REG_IQH, VTD_REG_IQT,
};
use crate::{RemapError, RemapResult};

// ============================================================================
// Constants
// ============================================================================

/// Descriptor slots in the ring (QS = 0, one 4 KiB page).
pub const QI_RING_SLOTS: usize = 256;

/// Size of one legacy (128-bit) descriptor.
pub const QI_DESCRIPTOR_SIZE: usize = 16;

/// Ring size in bytes; the tail wraps modulo this value.
pub const QI_RING_BYTES: usize = QI_RING_SLOTS * QI_DESCRIPTOR_SIZE;

/// Default number of status-word polls before a submission times out.
///
/// Each poll is one uncached FSTS read plus the configured pause. With the
/// default `PollPause::Spin(1024)` a poll costs roughly 10 to 50 us, so a
/// submission gives up after about 1 to 5 ms.
pub const QI_POLL_BUDGET: u32 = 100;

/// Value software stores into the status word before a submission. Never
/// used as a completion token.
pub const QI_STATUS_INCOMPLETE: u32 = 0;

const QI_TYPE_MASK: u64 = 0xF;
const QI_TYPE_CONTEXT_CACHE: u64 = 0x1;
const QI_TYPE_INTERRUPT_ENTRY: u64 = 0x4;
const QI_TYPE_WAIT: u64 = 0x5;

/// Context-cache invalidation granularity (bits 5:4), 1 = global.
const QI_CC_GRANULARITY_SHIFT: u64 = 4;
const QI_CC_GLOBAL: u64 = 1 << QI_CC_GRANULARITY_SHIFT;

/// Interrupt-entry-cache granularity (bit 4), 1 = index-selective.
const QI_IEC_INDEXED: u64 = 1 << 4;
const QI_IEC_MASK_SHIFT: u64 = 27;
const QI_IEC_MASK_BITS: u64 = 0x1F;
const QI_IEC_INDEX_SHIFT: u64 = 32;

/// Wait descriptor: Interrupt Flag.
pub const QI_WAIT_IF: u64 = 1 << 4;
/// Wait descriptor: Status Write.
pub const QI_WAIT_SW: u64 = 1 << 5;
/// Wait descriptor: Fence.
pub const QI_WAIT_FN: u64 = 1 << 6;
const QI_WAIT_DATA_SHIFT: u64 = 32;

// ============================================================================
// Descriptors
// ============================================================================

/// Raw 128-bit invalidation descriptor.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QiDescriptor {
    pub lo: u64,
    pub hi: u64,
}

/// Commands the driver issues through the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QiCommand {
    /// Flush every context-cache entry.
    ContextCacheGlobal,
    /// Flush every interrupt-entry-cache entry.
    InterruptEntryGlobal,
    /// Flush `2^mask` interrupt-entry-cache entries starting at `index`.
    InterruptEntryIndex { index: u16, mask: u8 },
    /// Store `status_data` at `status_addr` once every earlier descriptor
    /// has completed.
    Wait { status_addr: PhysAddr, status_data: u32 },
}

impl QiCommand {
    /// Encode into the hardware descriptor format.
    pub fn encode(&self) -> QiDescriptor {
        match *self {
            Self::ContextCacheGlobal => QiDescriptor {
                lo: QI_TYPE_CONTEXT_CACHE | QI_CC_GLOBAL,
                hi: 0,
            },
            Self::InterruptEntryGlobal => QiDescriptor {
                lo: QI_TYPE_INTERRUPT_ENTRY,
                hi: 0,
            },
            Self::InterruptEntryIndex { index, mask } => QiDescriptor {
                lo: QI_TYPE_INTERRUPT_ENTRY
                    | QI_IEC_INDEXED
                    | ((mask as u64 & QI_IEC_MASK_BITS) << QI_IEC_MASK_SHIFT)
                    | ((index as u64) << QI_IEC_INDEX_SHIFT),
                hi: 0,
            },
            Self::Wait {
                status_addr,
                status_data,
            } => QiDescriptor {
                lo: QI_TYPE_WAIT | QI_WAIT_SW | ((status_data as u64) << QI_WAIT_DATA_SHIFT),
                hi: status_addr.as_u64() & !0x3,
            },
        }
    }

    /// Decode a descriptor this driver could have produced.
    pub fn decode(desc: &QiDescriptor) -> Option<Self> {
        match desc.lo & QI_TYPE_MASK {
            QI_TYPE_CONTEXT_CACHE if desc.lo & (0x3 << QI_CC_GRANULARITY_SHIFT) == QI_CC_GLOBAL => {
                Some(Self::ContextCacheGlobal)
            }
            QI_TYPE_INTERRUPT_ENTRY if desc.lo & QI_IEC_INDEXED == 0 => {
                Some(Self::InterruptEntryGlobal)
            }
            QI_TYPE_INTERRUPT_ENTRY => Some(Self::InterruptEntryIndex {
                index: (desc.lo >> QI_IEC_INDEX_SHIFT) as u16,
                mask: ((desc.lo >> QI_IEC_MASK_SHIFT) & QI_IEC_MASK_BITS) as u8,
            }),
            QI_TYPE_WAIT if desc.lo & QI_WAIT_SW != 0 => Some(Self::Wait {
                status_addr: PhysAddr::new_truncate(desc.hi & !0x3),
                status_data: (desc.lo >> QI_WAIT_DATA_SHIFT) as u32,
            }),
            _ => None,
        }
    }
}

// ============================================================================
// Ring
// ============================================================================

#[repr(C, align(4096))]
struct QiPage([QiDescriptor; QI_RING_SLOTS]);

/// Invalidation queue owned by one controller.
///
/// The descriptor page and the status word are separate heap allocations so
/// their addresses survive moves of the ring value itself.
pub struct QiRing<W: RegisterWindow> {
    regs: W,
    page: Box<QiPage>,
    status: Box<AtomicU32>,
    /// Byte offset of the next free slot.
    tail: usize,
    poll: PollPolicy,
    status_phys: Option<PhysAddr>,
    /// Token of the most recent submission.
    token: u32,
}

impl<W: RegisterWindow> QiRing<W> {
    /// Allocate an unarmed ring.
    pub fn new(regs: W, poll: PollPolicy) -> Self {
        Self {
            regs,
            page: Box::new(QiPage([QiDescriptor::default(); QI_RING_SLOTS])),
            status: Box::new(AtomicU32::new(QI_STATUS_INCOMPLETE)),
            tail: 0,
            poll,
            status_phys: None,
            token: QI_STATUS_INCOMPLETE,
        }
    }

    /// Virtual address of the descriptor page.
    pub fn ring_address(&self) -> usize {
        self.page.0.as_ptr() as usize
    }

    /// Virtual address of the completion status word.
    pub fn status_address(&self) -> usize {
        &*self.status as *const AtomicU32 as usize
    }

    /// Software tail, in bytes.
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Hardware head, in bytes.
    pub fn hardware_head(&self) -> usize {
        self.regs.read64(VTD_REG_IQH) as usize
    }

    /// Completion token written by the most recent submission's wait
    /// descriptor.
    pub fn last_token(&self) -> u32 {
        self.token
    }

    /// Whether [`QiRing::arm`] has succeeded.
    pub fn is_armed(&self) -> bool {
        self.status_phys.is_some()
    }

    /// Descriptor currently stored in `slot`.
    pub fn descriptor(&self, slot: usize) -> QiDescriptor {
        // SAFETY: the slot is in bounds (indexing panics otherwise) and the
        // page is only written through `&mut self`.
        unsafe { read_volatile(&self.page.0[slot % QI_RING_SLOTS]) }
    }

    /// Program the queue registers and enable queued invalidation.
    ///
    /// `ring_phys` and `status_phys` are the unit-visible addresses of
    /// [`QiRing::ring_address`] and [`QiRing::status_address`].
    pub fn arm(&mut self, ring_phys: PhysAddr, status_phys: PhysAddr) -> RemapResult<()> {
        self.regs.write64(VTD_REG_IQT, 0);
        self.tail = 0;

        // DW = 0 (128-bit descriptors), QS = 0 (256 slots)
        self.regs.write64(VTD_REG_IQA, ring_phys.as_u64() & !0xFFF);
        send_command(&self.regs, GlobalCommand::QIE, self.poll)?;

        self.status_phys = Some(status_phys);
        trace!("VT-d: invalidation queue at {:#x}", ring_phys.as_u64());
        Ok(())
    }

    /// Submit one command and wait for the unit to retire it.
    ///
    /// Returns `QueueFault` when the unit latches an invalidation queue error
    /// while polling and `Timeout` when the poll budget runs out first. The
    /// ring stays usable after either error.
    pub fn submit(&mut self, command: QiCommand) -> RemapResult<()> {
        let status_addr = self.status_phys.ok_or(RemapError::NotReady)?;
        let token = self.next_token();

        self.status.store(QI_STATUS_INCOMPLETE, Ordering::Release);
        self.push(command.encode());
        self.push(
            QiCommand::Wait {
                status_addr,
                status_data: token,
            }
            .encode(),
        );

        // Descriptors must be visible before the doorbell.
        fence(Ordering::SeqCst);
        self.regs.write64(VTD_REG_IQT, self.tail as u64);

        self.wait_completion(token).map_err(|e| {
            error!("VT-d: {:?} failed: {}", command, e);
            e
        })
    }

    fn next_token(&mut self) -> u32 {
        self.token = self.token.wrapping_add(1);
        if self.token == QI_STATUS_INCOMPLETE {
            self.token = 1;
        }
        self.token
    }

    fn push(&mut self, desc: QiDescriptor) {
        let slot = self.tail / QI_DESCRIPTOR_SIZE;
        // SAFETY: `slot` < QI_RING_SLOTS because `tail` wraps at QI_RING_BYTES.
        unsafe { write_volatile(&mut self.page.0[slot], desc) };
        self.tail = (self.tail + QI_DESCRIPTOR_SIZE) % QI_RING_BYTES;
    }

    fn wait_completion(&self, token: u32) -> RemapResult<()> {
        for _ in 0..self.poll.budget {
            if self.status.load(Ordering::Acquire) == token {
                return Ok(());
            }
            let fsts = FaultStatus::from_bits_retain(self.regs.read32(VTD_REG_FSTS));
            if fsts.contains(FaultStatus::IQE) {
                return Err(RemapError::QueueFault);
            }
            self.poll.pause.pause();
        }
        Err(RemapError::Timeout)
    }
}

// ============================================================================
// Tests
// ============================================================================
