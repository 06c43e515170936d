//! PCI transport backends and the platform seam they sit on.
//!
//! The platform (kernel, DDK shim, or a test fake) supplies a [`PciHandle`]
//! for one PCI function: config-space access, typed BAR register windows, and
//! the blocking interrupt object. The two [`Backend`] implementations here
//! translate the virtio register protocol onto that handle:
//!
//! - [`LegacyBackend`]: the virtio 0.9.5 fixed I/O-port layout in BAR0.
//! - [`ModernBackend`]: virtio 1.0 vendor capabilities locating MMIO regions.
//!
//! [`bind_backend`] picks the variant the way a bind rule would: modern if
//! the vendor capability list is present, legacy otherwise.

mod legacy;
mod modern;

pub use legacy::LegacyBackend;
pub use modern::ModernBackend;

use std::sync::Arc;

use crate::backend::{Backend, BackendError, Result, WaitError};
use crate::wire;

pub const PCI_VENDOR_ID_VIRTIO: u16 = 0x1af4;

/// Modern virtio-pci device IDs: `0x1040 + <virtio device id>`.
pub const VIRTIO_PCI_DEVICE_ID_BASE: u16 = 0x1040;

/// Transitional virtio-pci device IDs: `0x1000 + (<virtio device id> - 1)`.
pub const VIRTIO_PCI_DEVICE_ID_TRANSITIONAL_BASE: u16 = 0x1000;

pub const PCI_CFG_COMMAND: u16 = 0x04;
pub const PCI_CFG_STATUS: u16 = 0x06;
pub const PCI_CFG_CAPABILITIES_PTR: u16 = 0x34;

pub const PCI_COMMAND_IO_SPACE: u16 = 1 << 0;
pub const PCI_COMMAND_MEM_SPACE: u16 = 1 << 1;
pub const PCI_COMMAND_BUS_MASTER: u16 = 1 << 2;

pub const PCI_STATUS_CAP_LIST: u16 = 1 << 4;

pub const PCI_CAP_ID_VENDOR_SPECIFIC: u8 = 0x09;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Memory,
    Io,
}

/// One mapped BAR: a typed register window.
///
/// Implementations perform the actual volatile MMIO loads/stores or port
/// I/O; this crate never does. Register access is infallible (see
/// [`Backend`]); a platform that can fail a mapping fails it in
/// [`PciHandle::bar`].
pub trait BarRegion: Send + Sync {
    fn kind(&self) -> BarKind;
    fn size(&self) -> u64;
    fn read_u8(&self, offset: u64) -> u8;
    fn read_u16(&self, offset: u64) -> u16;
    fn read_u32(&self, offset: u64) -> u32;
    fn write_u8(&self, offset: u64, value: u8);
    fn write_u16(&self, offset: u64, value: u16);
    fn write_u32(&self, offset: u64, value: u32);
}

/// Blocking interrupt object for one PCI function.
pub trait InterruptSource: Send + Sync {
    fn wait(&self) -> std::result::Result<(), WaitError>;
    /// Transport-specific end-of-interrupt acknowledgement.
    fn complete(&self) {}
    fn is_valid(&self) -> bool;
    /// Unblocks current and future waiters with [`WaitError::Shutdown`].
    fn teardown(&self);
}

/// Interrupt delivery mode the platform negotiated for the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// Level-triggered legacy INTx.
    Legacy,
    Msi,
    Msix,
}

/// Access to one PCI function, supplied by the host platform.
pub trait PciHandle: Send + Sync {
    fn config_read_u8(&self, offset: u16) -> u8;
    fn config_read_u16(&self, offset: u16) -> u16;
    fn config_read_u32(&self, offset: u16) -> u32;
    fn config_write_u16(&self, offset: u16, value: u16);

    /// The mapped register window for one BAR. Mapping may be expensive; the
    /// backends cache the result per BAR index.
    fn bar(&self, index: u8) -> Result<Arc<dyn BarRegion>>;

    fn interrupt_mode(&self) -> InterruptMode;
    fn interrupt(&self) -> Arc<dyn InterruptSource>;
}

/// A parsed `virtio_pci_cap` entry from the vendor capability list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VendorCapability {
    pub cfg_type: u8,
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
    /// Only meaningful when `cfg_type` is `VIRTIO_PCI_CAP_NOTIFY_CFG`.
    pub notify_off_multiplier: u32,
}

/// Walk the PCI capability list and collect the virtio vendor capabilities.
pub(crate) fn vendor_capabilities(pci: &dyn PciHandle) -> Vec<VendorCapability> {
    let mut caps = Vec::new();
    if pci.config_read_u16(PCI_CFG_STATUS) & PCI_STATUS_CAP_LIST == 0 {
        return caps;
    }

    let mut ptr = pci.config_read_u8(PCI_CFG_CAPABILITIES_PTR) & 0xfc;
    // A config space holds at most 48 capabilities; treat longer chains as
    // malformed rather than looping forever.
    let mut remaining = 48;
    while ptr != 0 && remaining > 0 {
        remaining -= 1;
        let id = pci.config_read_u8(ptr as u16);
        let next = pci.config_read_u8(ptr as u16 + 1) & 0xfc;
        if id == PCI_CAP_ID_VENDOR_SPECIFIC {
            let cfg_type = pci.config_read_u8(ptr as u16 + 3);
            let bar = pci.config_read_u8(ptr as u16 + 4);
            let offset = pci.config_read_u32(ptr as u16 + 8);
            let length = pci.config_read_u32(ptr as u16 + 12);
            let notify_off_multiplier = if cfg_type == wire::VIRTIO_PCI_CAP_NOTIFY_CFG {
                pci.config_read_u32(ptr as u16 + 16)
            } else {
                0
            };
            caps.push(VendorCapability {
                cfg_type,
                bar,
                offset,
                length,
                notify_off_multiplier,
            });
        }
        ptr = next;
    }
    caps
}

/// Set bus-master (plus I/O and memory decode) in the PCI command register.
pub(crate) fn enable_bus_master(pci: &dyn PciHandle) {
    let command = pci.config_read_u16(PCI_CFG_COMMAND);
    pci.config_write_u16(
        PCI_CFG_COMMAND,
        command | PCI_COMMAND_BUS_MASTER | PCI_COMMAND_IO_SPACE | PCI_COMMAND_MEM_SPACE,
    );
}

/// Bind the right transport for the function: modern if virtio vendor
/// capabilities are present, legacy otherwise.
pub fn bind_backend(pci: Arc<dyn PciHandle>) -> Result<Arc<dyn Backend>> {
    if vendor_capabilities(pci.as_ref()).is_empty() {
        Ok(Arc::new(LegacyBackend::bind(pci)?))
    } else {
        Ok(Arc::new(ModernBackend::bind(pci)?))
    }
}

/// A register window carved out of a mapped BAR by a vendor capability.
#[derive(Clone)]
pub(crate) struct BarSlice {
    bar: Arc<dyn BarRegion>,
    offset: u64,
    len: u64,
}

impl BarSlice {
    pub(crate) fn new(bar: Arc<dyn BarRegion>, cap: &VendorCapability) -> Self {
        Self {
            bar,
            offset: u64::from(cap.offset),
            len: u64::from(cap.length),
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn read_u8(&self, offset: u64) -> u8 {
        self.bar.read_u8(self.offset + offset)
    }

    pub(crate) fn read_u16(&self, offset: u64) -> u16 {
        self.bar.read_u16(self.offset + offset)
    }

    pub(crate) fn read_u32(&self, offset: u64) -> u32 {
        self.bar.read_u32(self.offset + offset)
    }

    pub(crate) fn write_u8(&self, offset: u64, value: u8) {
        self.bar.write_u8(self.offset + offset, value);
    }

    pub(crate) fn write_u16(&self, offset: u64, value: u16) {
        self.bar.write_u16(self.offset + offset, value);
    }

    pub(crate) fn write_u32(&self, offset: u64, value: u32) {
        self.bar.write_u32(self.offset + offset, value);
    }

    /// 64-bit access as two 32-bit accesses, low half first, per the virtio
    /// 1.0 alignment rule for the device-config and queue-address registers.
    pub(crate) fn read_u64(&self, offset: u64) -> u64 {
        let lo = u64::from(self.read_u32(offset));
        let hi = u64::from(self.read_u32(offset + 4));
        lo | (hi << 32)
    }

    pub(crate) fn write_u64(&self, offset: u64, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }
}

/// Lazily-mapped BAR cache shared by the capability handlers, so re-mapping
/// an already-mapped BAR is a no-op.
pub(crate) struct BarCache {
    pci: Arc<dyn PciHandle>,
    mapped: [Option<Arc<dyn BarRegion>>; 6],
}

impl BarCache {
    pub(crate) fn new(pci: Arc<dyn PciHandle>) -> Self {
        Self {
            pci,
            mapped: Default::default(),
        }
    }

    pub(crate) fn map(&mut self, index: u8) -> Result<Arc<dyn BarRegion>> {
        if index >= 6 {
            return Err(BackendError::BarMissing { bar: index });
        }
        if let Some(bar) = &self.mapped[index as usize] {
            return Ok(Arc::clone(bar));
        }
        let bar = self.pci.bar(index)?;
        if bar.kind() != BarKind::Memory {
            return Err(BackendError::WrongBarType {
                bar: index,
                expected: "memory",
            });
        }
        self.mapped[index as usize] = Some(Arc::clone(&bar));
        Ok(bar)
    }

    pub(crate) fn mapped_count(&self) -> usize {
        self.mapped.iter().filter(|slot| slot.is_some()).count()
    }
}
