//! Modern (virtio 1.0) capability-located MMIO transport.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::backend::{Backend, BackendError, DeviceStatus, IsrStatus, Result, WaitError};
use crate::pci::{
    enable_bus_master, vendor_capabilities, BarCache, BarSlice, InterruptSource, PciHandle,
};
use crate::wire;

// Field offsets into `struct virtio_pci_common_cfg` (see `wire`, layout-locked
// by its unit tests).
const COMMON_DEVICE_FEATURE_SELECT: u64 = 0x00;
const COMMON_DEVICE_FEATURE: u64 = 0x04;
const COMMON_DRIVER_FEATURE_SELECT: u64 = 0x08;
const COMMON_DRIVER_FEATURE: u64 = 0x0c;
const COMMON_DEVICE_STATUS: u64 = 0x14;
const COMMON_QUEUE_SELECT: u64 = 0x16;
const COMMON_QUEUE_SIZE: u64 = 0x18;
const COMMON_QUEUE_ENABLE: u64 = 0x1c;
const COMMON_QUEUE_NOTIFY_OFF: u64 = 0x1e;
const COMMON_QUEUE_DESC: u64 = 0x20;
const COMMON_QUEUE_AVAIL: u64 = 0x28;
const COMMON_QUEUE_USED: u64 = 0x30;

/// [`Backend`] over the modern capability-located register regions.
pub struct ModernBackend {
    common: BarSlice,
    notify: BarSlice,
    notify_off_multiplier: u32,
    isr: BarSlice,
    device_cfg: BarSlice,
    interrupt: Arc<dyn InterruptSource>,
    /// Serializes every select-window sequence (feature select and queue
    /// select share the common-config region).
    sel: Mutex<()>,
}

impl std::fmt::Debug for ModernBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModernBackend")
            .field("notify_off_multiplier", &self.notify_off_multiplier)
            .finish_non_exhaustive()
    }
}

impl ModernBackend {
    /// Transport setup: walks the vendor capability list once, mapping each
    /// referenced BAR (idempotently) and recording the four required regions.
    pub fn bind(pci: Arc<dyn PciHandle>) -> Result<Self> {
        enable_bus_master(pci.as_ref());

        let caps = vendor_capabilities(pci.as_ref());
        let mut bars = BarCache::new(Arc::clone(&pci));

        let mut common = None;
        let mut notify = None;
        let mut notify_off_multiplier = 0;
        let mut isr = None;
        let mut device_cfg = None;

        for cap in &caps {
            match cap.cfg_type {
                wire::VIRTIO_PCI_CAP_COMMON_CFG => {
                    let bar = bars.map(cap.bar)?;
                    common.get_or_insert_with(|| BarSlice::new(bar, cap));
                }
                wire::VIRTIO_PCI_CAP_NOTIFY_CFG => {
                    let bar = bars.map(cap.bar)?;
                    if notify.is_none() {
                        notify = Some(BarSlice::new(bar, cap));
                        notify_off_multiplier = cap.notify_off_multiplier;
                    }
                }
                wire::VIRTIO_PCI_CAP_ISR_CFG => {
                    let bar = bars.map(cap.bar)?;
                    isr.get_or_insert_with(|| BarSlice::new(bar, cap));
                }
                wire::VIRTIO_PCI_CAP_DEVICE_CFG => {
                    let bar = bars.map(cap.bar)?;
                    device_cfg.get_or_insert_with(|| BarSlice::new(bar, cap));
                }
                wire::VIRTIO_PCI_CAP_PCI_CFG => {
                    // Alternative config-space access window; unused, the
                    // BARs are mapped directly.
                }
                other => {
                    debug!(cfg_type = other, "skipping unknown virtio capability");
                }
            }
        }

        let common = common.ok_or(BackendError::CapabilityMissing("common config"))?;
        let notify = notify.ok_or(BackendError::CapabilityMissing("notify config"))?;
        let isr = isr.ok_or(BackendError::CapabilityMissing("isr config"))?;
        let device_cfg = device_cfg.ok_or(BackendError::CapabilityMissing("device config"))?;

        debug!(
            bars = bars.mapped_count(),
            notify_off_multiplier, "modern virtio transport bound"
        );

        let interrupt = pci.interrupt();
        Ok(Self {
            common,
            notify,
            notify_off_multiplier,
            isr,
            device_cfg,
            interrupt,
            sel: Mutex::new(()),
        })
    }

    fn select_window(&self) -> MutexGuard<'_, ()> {
        self.sel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.common.read_u8(COMMON_DEVICE_STATUS))
    }

    fn set_status_bits(&self, bits: DeviceStatus) {
        let status = self.status();
        self.common
            .write_u8(COMMON_DEVICE_STATUS, (status | bits).bits());
    }
}

impl Backend for ModernBackend {
    fn read_feature(&self, bit: u32) -> bool {
        let _sel = self.select_window();
        self.common
            .write_u32(COMMON_DEVICE_FEATURE_SELECT, bit / 32);
        let word = self.common.read_u32(COMMON_DEVICE_FEATURE);
        word & (1 << (bit % 32)) != 0
    }

    fn set_feature(&self, bit: u32) {
        let _sel = self.select_window();
        self.common
            .write_u32(COMMON_DRIVER_FEATURE_SELECT, bit / 32);
        let word = self.common.read_u32(COMMON_DRIVER_FEATURE);
        self.common
            .write_u32(COMMON_DRIVER_FEATURE, word | (1 << (bit % 32)));
    }

    fn confirm_features(&self) -> Result<()> {
        self.set_status_bits(DeviceStatus::FEATURES_OK);
        // The device clears FEATURES_OK if it cannot operate with the chosen
        // feature set.
        if !self.status().contains(DeviceStatus::FEATURES_OK) {
            return Err(BackendError::FeaturesRejected);
        }
        Ok(())
    }

    fn device_reset(&self) {
        self.common.write_u8(COMMON_DEVICE_STATUS, 0);
    }

    fn driver_status_ack(&self) {
        self.set_status_bits(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER);
    }

    fn driver_status_ok(&self) {
        self.set_status_bits(DeviceStatus::DRIVER_OK);
    }

    fn device_config_read_u8(&self, offset: u64) -> u8 {
        self.device_cfg.read_u8(offset)
    }

    fn device_config_read_u16(&self, offset: u64) -> u16 {
        self.device_cfg.read_u16(offset)
    }

    fn device_config_read_u32(&self, offset: u64) -> u32 {
        self.device_cfg.read_u32(offset)
    }

    fn device_config_read_u64(&self, offset: u64) -> u64 {
        self.device_cfg.read_u64(offset)
    }

    fn device_config_write_u8(&self, offset: u64, value: u8) {
        self.device_cfg.write_u8(offset, value);
    }

    fn device_config_write_u16(&self, offset: u64, value: u16) {
        self.device_cfg.write_u16(offset, value);
    }

    fn device_config_write_u32(&self, offset: u64, value: u32) {
        self.device_cfg.write_u32(offset, value);
    }

    fn device_config_write_u64(&self, offset: u64, value: u64) {
        self.device_cfg.write_u64(offset, value);
    }

    fn ring_size(&self, index: u16) -> u16 {
        let _sel = self.select_window();
        self.common.write_u16(COMMON_QUEUE_SELECT, index);
        self.common.read_u16(COMMON_QUEUE_SIZE)
    }

    fn set_ring(&self, index: u16, count: u16, desc: u64, avail: u64, used: u64) -> Result<()> {
        let _sel = self.select_window();
        self.common.write_u16(COMMON_QUEUE_SELECT, index);

        // The kick path assumes notify offset == queue index so it can write
        // the doorbell without a per-kick register read. Checked once here;
        // a device that numbers its notify slots differently fails loudly
        // instead of kicking the wrong queue.
        let notify_off = self.common.read_u16(COMMON_QUEUE_NOTIFY_OFF);
        if notify_off != index {
            return Err(BackendError::NotifyOffsetMismatch { index, notify_off });
        }

        self.common.write_u16(COMMON_QUEUE_SIZE, count);
        self.common.write_u64(COMMON_QUEUE_DESC, desc);
        self.common.write_u64(COMMON_QUEUE_AVAIL, avail);
        self.common.write_u64(COMMON_QUEUE_USED, used);
        self.common.write_u16(COMMON_QUEUE_ENABLE, 1);
        Ok(())
    }

    fn ring_kick(&self, index: u16) {
        let offset = u64::from(self.notify_off_multiplier) * u64::from(index);
        if offset + 2 > self.notify.len() {
            warn!(index, "notify offset outside the notify region; kick dropped");
            return;
        }
        self.notify.write_u16(offset, index);
    }

    fn isr_status(&self) -> IsrStatus {
        let isr = self.isr.read_u8(0);
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
