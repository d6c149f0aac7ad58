//! Interrupt Remapping Table
//!
//! Remappable interrupts carry a table index instead of a destination. The
//! unit looks the index up in the Interrupt Remapping Table (IRT) and
//! delivers the vector, destination and mode stored in that entry.
//!
//! ```text
//!   MSI address (remappable format)          IRT (one 4 KiB page)
//!   +--------+-------------+---+---+       +--------+
//!   | 0xFEE  | handle[14:0]|FMT|SHV| ----> | IRTE 0 |
//!   +--------+-------------+---+---+       | IRTE 1 |
//!                                          |  ...   |
//!                                          | IRTE 255
//!                                          +--------+
//! ```
//!
//! Indexes are handed out by a bump allocator and never reclaimed: the table
//! holds exactly [`IRTE_COUNT`] entries for the lifetime of the controller.
//!
//! # References
//!
//! - Intel VT-d Specification, Section 5.1.4 (Interrupt Remapping Table Entry)
//! - Intel VT-d Specification, Section 5.1.5.2 (MSI Address in Remappable Format)
//! - Intel VT-d Specification, Section 10.4.29 (IRTA Register)

use alloc::boxed::Box;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};
use x86_64::PhysAddr;

use crate::{RemapError, RemapResult};

// ============================================================================
// Constants
// ============================================================================

/// Entries in the table (one page of 128-bit entries).
pub const IRTE_COUNT: usize = 256;

/// Size of one IRTE.
pub const IRTE_SIZE: usize = 16;

/// IRTA.S encoding for 256 entries (2^(S+1)).
const IRTA_SIZE_256: u64 = 7;

/// IRTA Extended Interrupt Mode Enable: 32-bit x2APIC destination IDs.
pub const IRTA_EIME: u64 = 1 << 11;

/// xAPIC destination field for "all CPUs" in logical mode (DST[15:8] = 0xFF).
pub const XAPIC_BROADCAST_DESTINATION: u32 = 0xFF << 8;

const MSI_ADDRESS_BASE: u32 = 0xFEE0_0000;
const MSI_ADDRESS_SHV: u32 = 1 << 3;
const MSI_ADDRESS_FORMAT: u32 = 1 << 4;
const MSI_ADDRESS_HANDLE_SHIFT: u32 = 5;

/// IOAPIC redirection entry: trigger mode bit.
const IOAPIC_TRIGGER_LEVEL: u32 = 1 << 15;
/// IOAPIC redirection entry: delivery mode bits 10:8.
const IOAPIC_DELIVERY_SHIFT: u32 = 8;
const IOAPIC_DELIVERY_MASK: u32 = 0x7;

// ============================================================================
// IRTE Fields
// ============================================================================

const IRTE_PRESENT: u64 = 1 << 0;
const IRTE_FPD: u64 = 1 << 1;
const IRTE_DM_LOGICAL: u64 = 1 << 2;
const IRTE_RH: u64 = 1 << 3;
const IRTE_TM_LEVEL: u64 = 1 << 4;
const IRTE_DLM_SHIFT: u64 = 5;
const IRTE_DLM_MASK: u64 = 0x7;
const IRTE_VECTOR_SHIFT: u64 = 16;
const IRTE_DST_SHIFT: u64 = 32;

const IRTE_SID_MASK: u64 = 0xFFFF;
const IRTE_SQ_SHIFT: u64 = 16;
const IRTE_SQ_MASK: u64 = 0x3;
const IRTE_SVT_SHIFT: u64 = 18;
const IRTE_SVT_MASK: u64 = 0x3;

/// Trigger mode of the remapped interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    #[default]
    Edge,
    Level,
}

/// APIC delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeliveryMode {
    #[default]
    Fixed = 0,
    LowestPriority = 1,
    Smi = 2,
    Nmi = 4,
    Init = 5,
    ExtInt = 7,
}

impl DeliveryMode {
    /// Decode a 3-bit delivery mode. Reserved encodings fall back to fixed.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            1 => Self::LowestPriority,
            2 => Self::Smi,
            4 => Self::Nmi,
            5 => Self::Init,
            7 => Self::ExtInt,
            _ => Self::Fixed,
        }
    }
}

/// How the destination field is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
    Physical,
    Logical,
}

/// Source-ID validation performed by the unit before honouring the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceValidation {
    /// Any requester may use the entry.
    None = 0,
    /// Requester ID must match `source_id` under `source_qualifier`.
    VerifySid = 1,
    /// Requester bus must fall in the range encoded in `source_id`.
    VerifyBus = 2,
}

impl SourceValidation {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::VerifySid,
            2 => Self::VerifyBus,
            _ => Self::None,
        }
    }
}

/// Trigger and delivery mode requested by the caller of `remap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptFlags {
    pub trigger: TriggerMode,
    pub delivery: DeliveryMode,
}

impl InterruptFlags {
    /// Edge-triggered, fixed delivery.
    pub const fn edge() -> Self {
        Self {
            trigger: TriggerMode::Edge,
            delivery: DeliveryMode::Fixed,
        }
    }

    /// Decode the flag word of an IOAPIC redirection entry.
    pub fn from_ioapic(flags: u32) -> Self {
        let trigger = if flags & IOAPIC_TRIGGER_LEVEL != 0 {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        };
        let delivery = ((flags >> IOAPIC_DELIVERY_SHIFT) & IOAPIC_DELIVERY_MASK) as u8;
        Self {
            trigger,
            delivery: DeliveryMode::from_bits(delivery),
        }
    }
}

/// Decoded view of an IRTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrteFields {
    pub present: bool,
    pub fault_processing_disable: bool,
    pub destination_mode: DestinationMode,
    pub redirection_hint: bool,
    pub trigger: TriggerMode,
    pub delivery: DeliveryMode,
    pub vector: u8,
    pub destination: u32,
    pub source_id: u16,
    pub source_qualifier: u8,
    pub source_validation: SourceValidation,
}

// ============================================================================
// IRTE
// ============================================================================

/// Interrupt Remapping Table Entry (128-bit).
///
/// # Layout
///
/// Low 64 bits:
/// - [0]: Present
/// - [1]: Fault Processing Disable
/// - [2]: Destination Mode (1 = logical)
/// - [3]: Redirection Hint
/// - [4]: Trigger Mode (1 = level)
/// - [7:5]: Delivery Mode
/// - [23:16]: Vector
/// - [63:32]: Destination ID
///
/// High 64 bits:
/// - [15:0]: Source ID
/// - [17:16]: Source ID Qualifier
/// - [19:18]: Source Validation Type
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Irte {
    pub lo: u64,
    pub hi: u64,
}

impl Irte {
    /// Entry with every bit clear (not present).
    pub const fn empty() -> Self {
        Self { lo: 0, hi: 0 }
    }

    /// Check if the entry is present.
    #[inline]
    pub fn is_present(&self) -> bool {
        self.lo & IRTE_PRESENT != 0
    }

    /// Build a present, logical-mode entry with redirection hint set.
    ///
    /// A `source_id` binds the entry to that exact requester.
    pub fn remappable(
        vector: u8,
        destination: u32,
        flags: InterruptFlags,
        source_id: Option<u16>,
    ) -> Self {
        Self::from_fields(&IrteFields {
            present: true,
            fault_processing_disable: false,
            destination_mode: DestinationMode::Logical,
            redirection_hint: true,
            trigger: flags.trigger,
            delivery: flags.delivery,
            vector,
            destination,
            source_id: source_id.unwrap_or(0),
            source_qualifier: 0,
            source_validation: match source_id {
                Some(_) => SourceValidation::VerifySid,
                None => SourceValidation::None,
            },
        })
    }

    /// Pack a field view into the raw layout.
    pub fn from_fields(f: &IrteFields) -> Self {
        let mut lo = ((f.delivery as u64) & IRTE_DLM_MASK) << IRTE_DLM_SHIFT;
        lo |= (f.vector as u64) << IRTE_VECTOR_SHIFT;
        lo |= (f.destination as u64) << IRTE_DST_SHIFT;
        if f.present {
            lo |= IRTE_PRESENT;
        }
        if f.fault_processing_disable {
            lo |= IRTE_FPD;
        }
        if f.destination_mode == DestinationMode::Logical {
            lo |= IRTE_DM_LOGICAL;
        }
        if f.redirection_hint {
            lo |= IRTE_RH;
        }
        if f.trigger == TriggerMode::Level {
            lo |= IRTE_TM_LEVEL;
        }

        let hi = (f.source_id as u64)
            | ((f.source_qualifier as u64 & IRTE_SQ_MASK) << IRTE_SQ_SHIFT)
            | ((f.source_validation as u64 & IRTE_SVT_MASK) << IRTE_SVT_SHIFT);

        Self { lo, hi }
    }

    /// Unpack the raw layout.
    pub fn fields(&self) -> IrteFields {
        IrteFields {
            present: self.lo & IRTE_PRESENT != 0,
            fault_processing_disable: self.lo & IRTE_FPD != 0,
            destination_mode: if self.lo & IRTE_DM_LOGICAL != 0 {
                DestinationMode::Logical
            } else {
                DestinationMode::Physical
            },
            redirection_hint: self.lo & IRTE_RH != 0,
            trigger: if self.lo & IRTE_TM_LEVEL != 0 {
                TriggerMode::Level
            } else {
                TriggerMode::Edge
            },
            delivery: DeliveryMode::from_bits(((self.lo >> IRTE_DLM_SHIFT) & IRTE_DLM_MASK) as u8),
            vector: (self.lo >> IRTE_VECTOR_SHIFT) as u8,
            destination: (self.lo >> IRTE_DST_SHIFT) as u32,
            source_id: (self.hi & IRTE_SID_MASK) as u16,
            source_qualifier: ((self.hi >> IRTE_SQ_SHIFT) & IRTE_SQ_MASK) as u8,
            source_validation: SourceValidation::from_bits(
                ((self.hi >> IRTE_SVT_SHIFT) & IRTE_SVT_MASK) as u8,
            ),
        }
    }
}

// ============================================================================
// Table
// ============================================================================

#[repr(C, align(4096))]
struct IrtPage([Irte; IRTE_COUNT]);

/// The remapping table plus the software bookkeeping kept per index.
pub struct IrteTable {
    page: Box<IrtPage>,
    /// Indexes `[0, used)` have been handed out.
    used: usize,
    vectors: [Option<u8>; IRTE_COUNT],
    irqs: [Option<u32>; IRTE_COUNT],
    msi: [bool; IRTE_COUNT],
}

impl IrteTable {
    /// Allocate a zeroed table.
    pub fn new() -> Self {
        Self {
            page: Box::new(IrtPage([Irte::empty(); IRTE_COUNT])),
            used: 0,
            vectors: [None; IRTE_COUNT],
            irqs: [None; IRTE_COUNT],
            msi: [false; IRTE_COUNT],
        }
    }

    /// Virtual address of entry 0.
    pub fn base_address(&self) -> usize {
        self.page.0.as_ptr() as usize
    }

    /// Virtual address of entry `index`.
    pub fn slot_address(&self, index: u8) -> usize {
        self.base_address() + index as usize * IRTE_SIZE
    }

    /// Number of indexes handed out so far.
    pub fn entries_used(&self) -> usize {
        self.used
    }

    /// Whether `index` has been handed out.
    #[inline]
    pub fn is_allocated(&self, index: u8) -> bool {
        (index as usize) < self.used
    }

    /// Reserve `count` consecutive indexes and return the first one.
    ///
    /// `count == 0` reports the next free index without reserving it.
    pub fn allocate(&mut self, count: u8) -> RemapResult<u8> {
        let start = self.used;
        if start >= IRTE_COUNT || start + count as usize > IRTE_COUNT {
            return Err(RemapError::Exhausted);
        }
        self.used += count as usize;
        Ok(start as u8)
    }

    /// Store an entry, high half first so the present bit lands last.
    pub fn write(&mut self, index: u8, irte: Irte) -> RemapResult<()> {
        if !self.is_allocated(index) {
            return Err(RemapError::Unallocated);
        }
        let slot = &mut self.page.0[index as usize];
        // SAFETY: `slot` is a valid, aligned reference into the table page.
        unsafe {
            write_volatile(&mut slot.hi, irte.hi);
            fence(Ordering::Release);
            write_volatile(&mut slot.lo, irte.lo);
        }
        Ok(())
    }

    /// Read back entry `index`.
    pub fn entry(&self, index: u8) -> Irte {
        // SAFETY: in-bounds reference into the table page.
        unsafe { read_volatile(&self.page.0[index as usize]) }
    }

    /// Record the CPU vector delivered through allocated entry `index`.
    pub fn set_vector(&mut self, index: u8, vector: u8) -> RemapResult<()> {
        if !self.is_allocated(index) {
            return Err(RemapError::Unallocated);
        }
        self.vectors[index as usize] = Some(vector);
        Ok(())
    }

    /// CPU vector recorded for `index`, if any.
    pub fn vector_of(&self, index: u8) -> Option<u8> {
        self.vectors[index as usize]
    }

    /// Record the platform IRQ bound to allocated entry `index`.
    pub fn set_irq(&mut self, index: u8, irq: u32) -> RemapResult<()> {
        if !self.is_allocated(index) {
            return Err(RemapError::Unallocated);
        }
        self.irqs[index as usize] = Some(irq);
        Ok(())
    }

    /// Platform IRQ recorded for `index`, if any.
    pub fn irq_of(&self, index: u8) -> Option<u32> {
        self.irqs[index as usize]
    }

    /// Mark allocated entry `index` as serving an MSI source.
    pub fn set_is_msi(&mut self, index: u8, msi: bool) -> RemapResult<()> {
        if !self.is_allocated(index) {
            return Err(RemapError::Unallocated);
        }
        self.msi[index as usize] = msi;
        Ok(())
    }

    /// Whether `index` serves an MSI source.
    pub fn is_msi(&self, index: u8) -> bool {
        self.msi[index as usize]
    }

    /// First allocated index recorded with `vector`.
    pub fn index_of_vector(&self, vector: u8) -> Option<u8> {
        self.vectors[..self.used]
            .iter()
            .position(|v| *v == Some(vector))
            .map(|i| i as u8)
    }

    /// First allocated index recorded with `irq`.
    pub fn index_of_irq(&self, irq: u32) -> Option<u8> {
        self.irqs[..self.used]
            .iter()
            .position(|v| *v == Some(irq))
            .map(|i| i as u8)
    }
}

impl Default for IrteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Value for the IRTA register: table base, EIME and S = 7 (256 entries).
pub fn irta_value(base: PhysAddr, extended: bool) -> u64 {
    let mut value = (base.as_u64() & !0xFFF) | IRTA_SIZE_256;
    if extended {
        value |= IRTA_EIME;
    }
    value
}

/// Remappable-format MSI address for a block of `vector_count` entries
/// starting at `index`.
///
/// SHV is set for multi-vector blocks so the device's data bits select the
/// entry within the block.
pub fn encode_msi_address(index: u8, vector_count: u8) -> u32 {
    let mut addr =
        MSI_ADDRESS_BASE | ((index as u32) << MSI_ADDRESS_HANDLE_SHIFT) | MSI_ADDRESS_FORMAT;
    if vector_count > 1 {
        addr |= MSI_ADDRESS_SHV;
    }
    addr
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irte_empty() {
        let irte = Irte::empty();
        assert!(!irte.is_present());
        assert_eq!(irte.fields().vector, 0);
    }

    #[test]
    fn test_irte_remappable_layout() {
        let irte = Irte::remappable(
            0x41,
            XAPIC_BROADCAST_DESTINATION,
            InterruptFlags::edge(),
            Some(0x00F8),
        );
        assert!(irte.is_present());
        // P | DM | RH, vector 0x41, DST 0xFF00
        assert_eq!(irte.lo, 0x1 | 0x4 | 0x8 | (0x41 << 16) | (0xFF00u64 << 32));
        // SID 0x00F8, SVT = verify SID
        assert_eq!(irte.hi, 0x00F8 | (1 << 18));
    }

    #[test]
    fn test_irte_fields_level_nmi() {
        let flags = InterruptFlags {
            trigger: TriggerMode::Level,
            delivery: DeliveryMode::Nmi,
        };
        let f = Irte::remappable(0x22, 3, flags, None).fields();
        assert_eq!(f.trigger, TriggerMode::Level);
        assert_eq!(f.delivery, DeliveryMode::Nmi);
        assert_eq!(f.destination, 3);
        assert_eq!(f.destination_mode, DestinationMode::Logical);
        assert!(f.redirection_hint);
        assert_eq!(f.source_validation, SourceValidation::None);
        assert_eq!(f.source_id, 0);
    }

    #[test]
    fn test_from_ioapic_flags() {
        let level = InterruptFlags::from_ioapic(0x8000);
        assert_eq!(level.trigger, TriggerMode::Level);
        assert_eq!(level.delivery, DeliveryMode::Fixed);

        let lowest = InterruptFlags::from_ioapic(1 << 8);
        assert_eq!(lowest.trigger, TriggerMode::Edge);
        assert_eq!(lowest.delivery, DeliveryMode::LowestPriority);

        let extint = InterruptFlags::from_ioapic(0x8000 | (7 << 8));
        assert_eq!(extint.delivery, DeliveryMode::ExtInt);

        // 3 and 6 are reserved encodings
        assert_eq!(InterruptFlags::from_ioapic(3 << 8).delivery, DeliveryMode::Fixed);
        assert_eq!(InterruptFlags::from_ioapic(6 << 8).delivery, DeliveryMode::Fixed);
    }

    #[test]
    fn test_allocate_exhaustion() {
        let mut table = IrteTable::new();
        assert_eq!(table.allocate(250), Ok(0));
        assert_eq!(table.allocate(6), Ok(250));
        assert_eq!(table.entries_used(), 256);
        assert_eq!(table.allocate(1), Err(RemapError::Exhausted));
        assert_eq!(table.allocate(0), Err(RemapError::Exhausted));
        assert_eq!(table.entries_used(), 256);
    }

    #[test]
    fn test_failed_allocation_leaves_state() {
        let mut table = IrteTable::new();
        assert_eq!(table.allocate(200), Ok(0));
        assert_eq!(table.allocate(57), Err(RemapError::Exhausted));
        assert_eq!(table.entries_used(), 200);
        assert_eq!(table.allocate(0), Ok(200));
        assert_eq!(table.allocate(56), Ok(200));
    }

    #[test]
    fn test_write_requires_allocation() {
        let mut table = IrteTable::new();
        let irte = Irte::remappable(0x30, 0, InterruptFlags::edge(), None);
        assert_eq!(table.write(0, irte), Err(RemapError::Unallocated));
        assert_eq!(table.entry(0), Irte::empty());

        table.allocate(1).unwrap();
        table.write(0, irte).unwrap();
        assert_eq!(table.entry(0), irte);
    }

    #[test]
    fn test_side_tables() {
        let mut table = IrteTable::new();
        assert_eq!(table.set_vector(0, 0x40), Err(RemapError::Unallocated));

        table.allocate(3).unwrap();
        table.set_vector(2, 0x40).unwrap();
        table.set_irq(2, 17).unwrap();
        table.set_is_msi(2, true).unwrap();

        assert_eq!(table.vector_of(2), Some(0x40));
        assert_eq!(table.irq_of(2), Some(17));
        assert!(table.is_msi(2));
        assert!(!table.is_msi(1));
        assert_eq!(table.index_of_vector(0x40), Some(2));
        assert_eq!(table.index_of_irq(17), Some(2));
        assert_eq!(table.index_of_irq(18), None);
        assert_eq!(table.vector_of(0), None);
    }

    #[test]
    fn test_table_alignment() {
        let table = IrteTable::new();
        assert_eq!(table.base_address() % 4096, 0);
        assert_eq!(table.slot_address(3) - table.base_address(), 48);
    }

    #[test]
    fn test_irta_value() {
        let base = PhysAddr::new(0x1_2345_6000);
        assert_eq!(irta_value(base, false), 0x1_2345_6007);
        assert_eq!(irta_value(base, true), 0x1_2345_6807);
    }

    #[test]
    fn test_msi_address_encoding() {
        assert_eq!(encode_msi_address(3, 1), 0xFEE0_0070);
        assert_eq!(encode_msi_address(3, 4), 0xFEE0_0078);
        assert_eq!(encode_msi_address(0, 1), 0xFEE0_0010);
    }
}
