//! Legacy (virtio 0.9.5) I/O-port transport.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::backend::{Backend, BackendError, DeviceStatus, IsrStatus, Result, WaitError};
use crate::pci::{
    enable_bus_master, BarKind, BarRegion, InterruptMode, InterruptSource, PciHandle,
};

// Legacy virtio-pci (0.9) I/O port register layout (BAR0 I/O space).
const VIRTIO_PCI_LEGACY_HOST_FEATURES: u64 = 0x00; // u32 (low 32 bits)
const VIRTIO_PCI_LEGACY_GUEST_FEATURES: u64 = 0x04; // u32 (low 32 bits)
const VIRTIO_PCI_LEGACY_QUEUE_PFN: u64 = 0x08; // u32
const VIRTIO_PCI_LEGACY_QUEUE_NUM: u64 = 0x0c; // u16 (max size)
const VIRTIO_PCI_LEGACY_QUEUE_SEL: u64 = 0x0e; // u16
const VIRTIO_PCI_LEGACY_QUEUE_NOTIFY: u64 = 0x10; // u16
const VIRTIO_PCI_LEGACY_STATUS: u64 = 0x12; // u8
const VIRTIO_PCI_LEGACY_ISR: u64 = 0x13; // u8 (read clears)

// Device-specific config space follows the standard header. This is the
// non-MSI-X offset: with MSI-X enabled the window moves to 0x18, which this
// backend does not support (bind refuses MSI-X instead of reading the wrong
// registers).
const VIRTIO_PCI_LEGACY_DEVICE_CFG: u64 = 0x14;

const LEGACY_QUEUE_ALIGN_SHIFT: u64 = 12;

/// [`Backend`] over the legacy fixed I/O-port register block.
pub struct LegacyBackend {
    io: Arc<dyn BarRegion>,
    interrupt: Arc<dyn InterruptSource>,
    /// Serializes QUEUE_SEL + dependent-register sequences.
    sel: Mutex<()>,
}

impl LegacyBackend {
    /// Transport setup: bus mastering, the BAR0 I/O window, and the
    /// interrupt object.
    pub fn bind(pci: Arc<dyn PciHandle>) -> Result<Self> {
        if pci.interrupt_mode() == InterruptMode::Msix {
            warn!("legacy virtio transport bound with MSI-X; config layout unsupported");
            return Err(BackendError::MsixUnsupported);
        }

        enable_bus_master(pci.as_ref());

        let io = pci.bar(0)?;
        if io.kind() != BarKind::Io {
            return Err(BackendError::WrongBarType {
                bar: 0,
                expected: "i/o",
            });
        }

        let interrupt = pci.interrupt();
        Ok(Self {
            io,
            interrupt,
            sel: Mutex::new(()),
        })
    }

    fn select_queue(&self, index: u16) -> MutexGuard<'_, ()> {
        let guard = self
            .sel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.io.write_u16(VIRTIO_PCI_LEGACY_QUEUE_SEL, index);
        guard
    }

    fn status(&self) -> u8 {
        self.io.read_u8(VIRTIO_PCI_LEGACY_STATUS)
    }

    fn set_status_bits(&self, bits: u8) {
        let status = self.status();
        self.io.write_u8(VIRTIO_PCI_LEGACY_STATUS, status | bits);
    }
}

impl Backend for LegacyBackend {
    fn read_feature(&self, bit: u32) -> bool {
        // The legacy transport only exposes the low 32 feature bits.
        if bit >= 32 {
            return false;
        }
        let features = self.io.read_u32(VIRTIO_PCI_LEGACY_HOST_FEATURES);
        features & (1 << bit) != 0
    }

    fn set_feature(&self, bit: u32) {
        if bit >= 32 {
            warn!(bit, "ignoring feature bit beyond the legacy 32-bit space");
            return;
        }
        let features = self.io.read_u32(VIRTIO_PCI_LEGACY_GUEST_FEATURES);
        self.io
            .write_u32(VIRTIO_PCI_LEGACY_GUEST_FEATURES, features | (1 << bit));
    }

    fn confirm_features(&self) -> Result<()> {
        // No negotiation protocol exists pre-1.0; the device takes whatever
        // the driver wrote to GUEST_FEATURES.
        Ok(())
    }

    fn device_reset(&self) {
        self.io.write_u8(VIRTIO_PCI_LEGACY_STATUS, 0);
    }

    fn driver_status_ack(&self) {
        self.set_status_bits((DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER).bits());
    }

    fn driver_status_ok(&self) {
        self.set_status_bits(DeviceStatus::DRIVER_OK.bits());
    }

    fn device_config_read_u8(&self, offset: u64) -> u8 {
        self.io.read_u8(VIRTIO_PCI_LEGACY_DEVICE_CFG + offset)
    }

    fn device_config_read_u16(&self, offset: u64) -> u16 {
        self.io.read_u16(VIRTIO_PCI_LEGACY_DEVICE_CFG + offset)
    }

    fn device_config_read_u32(&self, offset: u64) -> u32 {
        self.io.read_u32(VIRTIO_PCI_LEGACY_DEVICE_CFG + offset)
    }

    fn device_config_read_u64(&self, offset: u64) -> u64 {
        // No 64-bit port access; low half first, as two 32-bit reads.
        let lo = u64::from(self.device_config_read_u32(offset));
        let hi = u64::from(self.device_config_read_u32(offset + 4));
        lo | (hi << 32)
    }

    fn device_config_write_u8(&self, offset: u64, value: u8) {
        self.io.write_u8(VIRTIO_PCI_LEGACY_DEVICE_CFG + offset, value);
    }

    fn device_config_write_u16(&self, offset: u64, value: u16) {
        self.io
            .write_u16(VIRTIO_PCI_LEGACY_DEVICE_CFG + offset, value);
    }

    fn device_config_write_u32(&self, offset: u64, value: u32) {
        self.io
            .write_u32(VIRTIO_PCI_LEGACY_DEVICE_CFG + offset, value);
    }

    fn device_config_write_u64(&self, offset: u64, value: u64) {
        self.device_config_write_u32(offset, value as u32);
        self.device_config_write_u32(offset + 4, (value >> 32) as u32);
    }

    fn ring_size(&self, index: u16) -> u16 {
        let _sel = self.select_queue(index);
        self.io.read_u16(VIRTIO_PCI_LEGACY_QUEUE_NUM)
    }

    fn set_ring(&self, index: u16, _count: u16, desc: u64, _avail: u64, _used: u64) -> Result<()> {
        // The legacy transport takes a single page frame number; the device
        // derives the avail/used addresses from the fixed vring layout, which
        // is why Ring always allocates with legacy alignment.
        let _sel = self.select_queue(index);
        self.io.write_u32(
            VIRTIO_PCI_LEGACY_QUEUE_PFN,
            (desc >> LEGACY_QUEUE_ALIGN_SHIFT) as u32,
        );
        Ok(())
    }

    fn ring_kick(&self, index: u16) {
        self.io.write_u16(VIRTIO_PCI_LEGACY_QUEUE_NOTIFY, index);
    }

    fn isr_status(&self) -> IsrStatus {
        // Reading the ISR register deasserts the level-triggered interrupt.
        let isr = self.io.read_u8(VIRTIO_PCI_LEGACY_ISR);
        IsrStatus::from_bits_truncate(u32::from(isr))
    }

    fn interrupt_valid(&self) -> bool {
        self.interrupt.is_valid()
    }

    fn wait_for_interrupt(&self) -> std::result::Result<(), WaitError> {
        self.interrupt.wait()
    }

    fn interrupt_complete(&self) {
        self.interrupt.complete();
    }

    fn teardown_interrupt(&self) {
        self.interrupt.teardown();
    }
}
