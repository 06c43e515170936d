//! The transport-independent register interface every device is driven through.
//!
//! Two PCI transports implement [`Backend`]: the legacy I/O-port layout
//! ([`crate::pci::LegacyBackend`]) and the modern capability-located MMIO
//! layout ([`crate::pci::ModernBackend`]). The variant is resolved once at
//! bind time and stored as a trait object; nothing re-dispatches on the
//! transport per register access after that.

use bitflags::bitflags;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

bitflags! {
    /// The virtio device status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const FAILED = 0x80;
    }
}

bitflags! {
    /// Interrupt cause bits, as read from the ISR status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IsrStatus: u32 {
        /// A used ring has new entries.
        const QUEUE = 1;
        /// The device configuration space changed.
        const CONFIG = 2;
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("required virtio capability not found: {0}")]
    CapabilityMissing(&'static str),

    #[error("BAR {bar} has the wrong type (expected {expected})")]
    WrongBarType { bar: u8, expected: &'static str },

    #[error("BAR {bar} is not present")]
    BarMissing { bar: u8 },

    #[error("queue {index} reports notify offset {notify_off}, expected the queue index")]
    NotifyOffsetMismatch { index: u16, notify_off: u16 },

    #[error("device rejected the negotiated feature set")]
    FeaturesRejected,

    #[error("legacy transport does not support the MSI-X config layout")]
    MsixUnsupported,

    #[error("failed to enable PCI bus mastering")]
    BusMasterFailed,
}

/// Why a blocking interrupt wait returned without an interrupt.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The interrupt handle was torn down; the IRQ loop should exit.
    #[error("interrupt handle invalidated")]
    Shutdown,

    /// Transient failure; the IRQ loop logs and keeps waiting.
    #[error("interrupt wait failed: {0}")]
    Failed(&'static str),
}

/// Uniform register access over one virtio transport.
///
/// All register accesses are infallible by construction: transport problems
/// (missing capability, wrong BAR type) surface from the backend constructors,
/// never from individual reads or writes. Status lifecycle calls must follow
/// the virtio bring-up order (`device_reset` -> `driver_status_ack` ->
/// feature negotiation -> `driver_status_ok`); that ordering is the caller's
/// responsibility and is asserted by the fake backend used in tests.
pub trait Backend: Send + Sync {
    /// Whether the device offers the given feature bit.
    fn read_feature(&self, bit: u32) -> bool;

    /// Acknowledge the given feature bit as driver-supported.
    fn set_feature(&self, bit: u32);

    /// Finish feature negotiation. Fails if the device rejects the set.
    fn confirm_features(&self) -> Result<()>;

    fn device_reset(&self);
    fn driver_status_ack(&self);
    fn driver_status_ok(&self);

    fn device_config_read_u8(&self, offset: u64) -> u8;
    fn device_config_read_u16(&self, offset: u64) -> u16;
    fn device_config_read_u32(&self, offset: u64) -> u32;
    fn device_config_read_u64(&self, offset: u64) -> u64;
    fn device_config_write_u8(&self, offset: u64, value: u8);
    fn device_config_write_u16(&self, offset: u64, value: u16);
    fn device_config_write_u32(&self, offset: u64, value: u32);
    fn device_config_write_u64(&self, offset: u64, value: u64);

    /// Maximum ring size the device supports for the given queue.
    fn ring_size(&self, index: u16) -> u16;

    /// Hand the device the physical addresses of one configured vring.
    fn set_ring(&self, index: u16, count: u16, desc: u64, avail: u64, used: u64) -> Result<()>;

    /// Notify the device that the given queue has new available entries.
    fn ring_kick(&self, index: u16);

    /// Read (and thereby acknowledge) the pending interrupt cause bits.
    fn isr_status(&self) -> IsrStatus;

    fn interrupt_valid(&self) -> bool;

    /// Block until the device raises an interrupt or the handle is torn down.
    fn wait_for_interrupt(&self) -> std::result::Result<(), WaitError>;

    /// Transport-specific end-of-interrupt, called after `isr_status`.
    fn interrupt_complete(&self) {}

    /// Invalidate the interrupt handle, unblocking any waiter with
    /// [`WaitError::Shutdown`].
    fn teardown_interrupt(&self);
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Widths the device configuration space can be accessed at.
pub trait ConfigValue: sealed::Sealed + Copy {
    fn read_config(backend: &dyn Backend, offset: u64) -> Self;
    fn write_config(backend: &dyn Backend, offset: u64, value: Self);
}

macro_rules! impl_config_value {
    ($ty:ty, $read:ident, $write:ident) => {
        impl ConfigValue for $ty {
            fn read_config(backend: &dyn Backend, offset: u64) -> Self {
                backend.$read(offset)
            }

            fn write_config(backend: &dyn Backend, offset: u64, value: Self) {
                backend.$write(offset, value);
            }
        }
    };
}

impl_config_value!(u8, device_config_read_u8, device_config_write_u8);
impl_config_value!(u16, device_config_read_u16, device_config_write_u16);
impl_config_value!(u32, device_config_read_u32, device_config_write_u32);
impl_config_value!(u64, device_config_read_u64, device_config_write_u64);
