//! Intel VT-d Interrupt Remapping Controller
//!
//! Brings one remapping unit from reset to "remapping enabled" and serves
//! runtime table updates.
//!
//! # Bring-up
//!
//! ```text
//! Unmapped
//!    | map registers, read ECAP.C
//!    v
//! RegistersMapped
//!    | fault geometry, IRQ + vector, FEDATA/FEADDR, ISR, clear FSTS, unmask
//!    v
//! FaultChannelArmed
//!    | IQT = 0, IQA, QIE handshake
//!    v
//! QiRingArmed
//!    | context-cache flush, IRTA, interrupt-entry-cache flush
//!    v
//! TableInstalled
//!    | [CFI handshake], SIRTP handshake, IRE handshake
//!    v
//! RemappingEnabled
//! ```
//!
//! A failing step aborts bring-up where it stands; nothing is rolled back and
//! [`Controller::state`] reports how far the unit got.
//!
//! # References
//!
//! - Intel VT-d Specification, Section 5.1 (Interrupt Remapping)
//! - Intel VT-d Specification, Section 10.4.4 (Global Command Register)

use alloc::boxed::Box;
use log::{debug, error, info, trace};
use spin::{Mutex, MutexGuard};

use crate::fault::FaultChannel;
use crate::interrupt::{
    encode_msi_address, irta_value, InterruptFlags, Irte, IrteTable, IRTE_COUNT, IRTE_SIZE,
    XAPIC_BROADCAST_DESTINATION,
};
use crate::qi::{QiCommand, QiRing};
use crate::regs::{
    send_command, ExtendedCapability, GlobalCommand, PollPolicy, RegisterWindow, VTD_REG_ECAP,
    VTD_REG_IRTA,
};
use crate::{Platform, RemapConfig, RemapError, RemapResult};

// ============================================================================
// Lifecycle
// ============================================================================

/// How far bring-up has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerState {
    Unmapped,
    RegistersMapped,
    FaultChannelArmed,
    QiRingArmed,
    TableInstalled,
    RemappingEnabled,
}

/// One vector of a multi-vector MSI group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiVector {
    pub irq: u32,
    pub vector: u8,
}

/// Remapped MSI group ready to be programmed into a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiGroup {
    /// IRTE index of the first vector.
    pub first_index: u8,
    pub count: u8,
    /// Remappable-format MSI address.
    pub address: u32,
}

/// Interrupt remapping unit.
pub struct Controller<P: Platform> {
    platform: P,
    config: RemapConfig,
    state: ControllerState,
    page_walk_coherent: bool,
    fault: Option<FaultChannel<P::Window>>,
    fault_irq: Option<u32>,
    fault_vector: Option<u8>,
    ring: Option<QiRing<P::Window>>,
    table: IrteTable,
}

impl<P: Platform> Controller<P> {
    /// Create an unmapped controller. The table is allocated here so its
    /// address is fixed before the unit learns it.
    pub fn new(platform: P, config: RemapConfig) -> Self {
        Self {
            platform,
            config,
            state: ControllerState::Unmapped,
            page_walk_coherent: false,
            fault: None,
            fault_irq: None,
            fault_vector: None,
            ring: None,
            table: IrteTable::new(),
        }
    }

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            budget: self.config.poll_budget,
            pause: self.config.poll_pause,
        }
    }

    /// Bring the unit up to [`ControllerState::RemappingEnabled`].
    ///
    /// Must be called once. On error the unit is left as far as it got;
    /// use [`RemapError::errno`] for the integer init code.
    pub fn init(&mut self) -> RemapResult<()> {
        let regs = self
            .platform
            .map_registers()
            .ok_or(RemapError::MmioUnavailable)?;

        let ecap = ExtendedCapability::from_bits_retain(regs.read64(VTD_REG_ECAP));
        self.page_walk_coherent = ecap.contains(ExtendedCapability::PAGE_WALK_COHERENCY);
        self.state = ControllerState::RegistersMapped;
        debug!(
            "VT-d: ecap={:?} coherent={}",
            ecap, self.page_walk_coherent
        );

        self.arm_fault_channel(&regs)?;
        self.state = ControllerState::FaultChannelArmed;

        let poll = self.poll_policy();
        let ring = self.ring.insert(QiRing::new(regs.clone(), poll));
        let ring_phys = self.platform.virt_to_phys(ring.ring_address());
        let status_phys = self.platform.virt_to_phys(ring.status_address());
        ring.arm(ring_phys, status_phys)?;
        self.state = ControllerState::QiRingArmed;

        self.invalidate(QiCommand::ContextCacheGlobal)?;

        let extended = self.platform.logical_destination().is_some();
        if !self.page_walk_coherent {
            self.platform
                .flush_dcache(self.table.base_address(), IRTE_COUNT * IRTE_SIZE);
        }
        let table_phys = self.platform.virt_to_phys(self.table.base_address());
        regs.write64(VTD_REG_IRTA, irta_value(table_phys, extended));

        self.invalidate(QiCommand::InterruptEntryGlobal)?;
        self.state = ControllerState::TableInstalled;

        if !extended && self.config.xapic_passthrough {
            send_command(&regs, GlobalCommand::CFI, poll)?;
        }
        send_command(&regs, GlobalCommand::SIRTP, poll)?;
        send_command(&regs, GlobalCommand::IRE, poll)?;
        self.state = ControllerState::RemappingEnabled;

        info!(
            "VT-d: interrupt remapping enabled (table {:#x}, {} mode)",
            table_phys.as_u64(),
            if extended { "x2APIC" } else { "xAPIC" }
        );
        Ok(())
    }

    fn arm_fault_channel(&mut self, regs: &P::Window) -> RemapResult<()> {
        let channel = FaultChannel::discover(regs.clone(), self.config.log_fault_records);

        let irq = self
            .platform
            .allocate_irq()
            .ok_or(RemapError::NoInterruptLine)?;
        let vector = self
            .platform
            .allocate_vector()
            .ok_or(RemapError::NoInterruptLine)?;

        channel.program_event(vector, self.platform.msi_address(irq));
        let isr = channel.clone();
        self.platform.connect_isr(
            irq,
            vector,
            Box::new(move || {
                isr.drain();
            }),
        );

        channel.clear_status();
        channel.unmask();

        debug!("VT-d: fault events on irq {} vector {:#x}", irq, vector);
        self.fault = Some(channel);
        self.fault_irq = Some(irq);
        self.fault_vector = Some(vector);
        Ok(())
    }

    /// Submit one invalidation through the queue.
    pub fn invalidate(&mut self, command: QiCommand) -> RemapResult<()> {
        self.ring
            .as_mut()
            .ok_or(RemapError::NotReady)?
            .submit(command)
    }

    // ========================================================================
    // Runtime
    // ========================================================================

    /// Reserve `count` consecutive IRTE indexes.
    ///
    /// Indexes are never returned to the allocator.
    pub fn allocate_entries(&mut self, count: u8) -> RemapResult<u8> {
        let index = self.table.allocate(count).map_err(|e| {
            error!(
                "VT-d: cannot allocate {} IRTEs ({} of {} used)",
                count,
                self.table.entries_used(),
                IRTE_COUNT
            );
            e
        })?;
        trace!("VT-d: allocated IRTEs {}..{}", index, index as usize + count as usize);
        Ok(index)
    }

    /// Program entry `index` and invalidate its cached copy.
    ///
    /// The entry is written even if the invalidation then fails; the
    /// returned error is the invalidation result.
    pub fn remap(
        &mut self,
        index: u8,
        vector: u8,
        flags: InterruptFlags,
        source_id: Option<u16>,
    ) -> RemapResult<()> {
        if !self.table.is_allocated(index) {
            return Err(RemapError::Unallocated);
        }
        let Some(ring) = self.ring.as_mut() else {
            return Err(RemapError::NotReady);
        };

        let destination = self
            .platform
            .logical_destination()
            .unwrap_or(XAPIC_BROADCAST_DESTINATION);
        let source_id = source_id.filter(|_| self.config.source_id_check);
        let irte = Irte::remappable(vector, destination, flags, source_id);
        self.table.write(index, irte)?;

        let result = ring.submit(QiCommand::InterruptEntryIndex {
            index: index as u16,
            mask: 0,
        });

        if !self.page_walk_coherent {
            self.platform
                .flush_dcache(self.table.slot_address(index), IRTE_SIZE);
        }

        trace!(
            "VT-d: IRTE {} -> vector {:#x} dest {:#x} sid {:?}",
            index,
            vector,
            destination,
            source_id
        );
        result
    }

    /// Allocate, record and remap a multi-vector MSI group.
    ///
    /// Stops at the first failing entry; earlier entries stay programmed.
    pub fn setup_msi_group(
        &mut self,
        vectors: &[MsiVector],
        flags: InterruptFlags,
        source_id: Option<u16>,
    ) -> RemapResult<MsiGroup> {
        let count = u8::try_from(vectors.len()).map_err(|_| RemapError::Exhausted)?;
        if count == 0 {
            return Err(RemapError::Unallocated);
        }
        let first_index = self.allocate_entries(count)?;

        for (offset, msi) in vectors.iter().enumerate() {
            // first_index + count - 1 <= 255 after a successful allocation
            let index = first_index + offset as u8;
            self.table.set_vector(index, msi.vector)?;
            self.table.set_irq(index, msi.irq)?;
            self.table.set_is_msi(index, true)?;
            self.remap(index, msi.vector, flags, source_id)?;
        }

        Ok(MsiGroup {
            first_index,
            count,
            address: encode_msi_address(first_index, count),
        })
    }

    /// Record the CPU vector for entry `index`.
    pub fn set_vector(&mut self, index: u8, vector: u8) -> RemapResult<()> {
        self.table.set_vector(index, vector)
    }

    /// CPU vector recorded for entry `index`.
    pub fn vector_of(&self, index: u8) -> Option<u8> {
        self.table.vector_of(index)
    }

    /// First entry recorded with `vector`.
    pub fn index_of_vector(&self, vector: u8) -> Option<u8> {
        self.table.index_of_vector(vector)
    }

    /// Record the platform IRQ for entry `index`.
    pub fn set_irq(&mut self, index: u8, irq: u32) -> RemapResult<()> {
        self.table.set_irq(index, irq)
    }

    /// Platform IRQ recorded for entry `index`.
    pub fn irq_of(&self, index: u8) -> Option<u32> {
        self.table.irq_of(index)
    }

    /// First entry recorded with `irq`.
    pub fn index_of_irq(&self, irq: u32) -> Option<u8> {
        self.table.index_of_irq(irq)
    }

    /// Mark entry `index` as an MSI source.
    pub fn set_is_msi(&mut self, index: u8, msi: bool) -> RemapResult<()> {
        self.table.set_is_msi(index, msi)
    }

    /// Whether entry `index` serves an MSI source.
    pub fn is_msi(&self, index: u8) -> bool {
        self.table.is_msi(index)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Lifecycle state.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Whether the unit snoops CPU caches when reading the table.
    pub fn page_walk_coherent(&self) -> bool {
        self.page_walk_coherent
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &RemapConfig {
        &self.config
    }

    /// Fault channel, once armed.
    pub fn fault_channel(&self) -> Option<&FaultChannel<P::Window>> {
        self.fault.as_ref()
    }

    /// IRQ and vector carrying fault events, once armed.
    pub fn fault_interrupt(&self) -> Option<(u32, u8)> {
        self.fault_irq.zip(self.fault_vector)
    }

    /// Remapping table and its side tables.
    pub fn table(&self) -> &IrteTable {
        &self.table
    }

    /// Invalidation queue, once enabled.
    pub fn ring(&self) -> Option<&QiRing<P::Window>> {
        self.ring.as_ref()
    }
}

// ============================================================================
// Shared Access
// ============================================================================

/// Controller behind a spinlock for multi-CPU interrupt setup.
pub struct SharedController<P: Platform> {
    inner: Mutex<Controller<P>>,
}

impl<P: Platform> SharedController<P> {
    pub fn new(controller: Controller<P>) -> Self {
        Self {
            inner: Mutex::new(controller),
        }
    }

    /// Lock the controller.
    pub fn lock(&self) -> MutexGuard<'_, Controller<P>> {
        self.inner.lock()
    }

    /// Run [`Controller::init`] under the lock.
    pub fn init(&self) -> RemapResult<()> {
        self.inner.lock().init()
    }

    /// Allocate one entry, record its vector and IRQ, and remap it under a
    /// single lock acquisition.
    pub fn allocate_and_remap(
        &self,
        vector: u8,
        irq: u32,
        flags: InterruptFlags,
        source_id: Option<u16>,
    ) -> RemapResult<u8> {
        let mut controller = self.inner.lock();
        let index = controller.allocate_entries(1)?;
        controller.set_vector(index, vector)?;
        controller.set_irq(index, irq)?;
        controller.remap(index, vector, flags, source_id)?;
        Ok(index)
    }

    pub fn setup_msi_group(
        &self,
        vectors: &[MsiVector],
        flags: InterruptFlags,
        source_id: Option<u16>,
    ) -> RemapResult<MsiGroup> {
        self.inner.lock().setup_msi_group(vectors, flags, source_id)
    }

    /// Detached fault channel for use outside the lock.
    pub fn fault_channel(&self) -> Option<FaultChannel<P::Window>> {
        self.inner.lock().fault_channel().cloned()
    }
}

// ============================================================================
// Tests
// ============================================================================
