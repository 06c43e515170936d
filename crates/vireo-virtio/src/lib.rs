//! Guest-side virtio transport core.
//!
//! Device personalities (block, entropy, ...) are state machines layered on
//! three pieces that live here:
//!
//! - [`Ring`]: one split virtqueue, with the driver-side free-list/cursor
//!   bookkeeping behind its own lock
//! - [`Backend`]: uniform register access over the two PCI transports
//!   ([`pci::LegacyBackend`] I/O ports, [`pci::ModernBackend`]
//!   capability-located MMIO), resolved once at bind time
//! - [`Device`]: the status lifecycle plus the one interrupt-service thread
//!   each device gets, dispatching to the personality's [`DeviceOps`] hooks
//!
//! The platform underneath is reached only through traits
//! ([`pci::PciHandle`], [`mem::DmaAllocator`]), so the whole stack runs
//! against the in-process fakes in [`fake`] for tests.

#![forbid(unsafe_code)]

pub mod backend;
pub mod device;
pub mod fake;
pub mod mem;
pub mod pci;
pub mod ring;
pub mod wire;

pub use backend::{Backend, BackendError, ConfigValue, DeviceStatus, IsrStatus, WaitError};
pub use device::{Device, DeviceOps};
pub use mem::{DmaAllocator, DmaError, DmaMemory, HeapDma};
pub use ring::{DescFlags, Descriptor, Ring, RingError, RingOptions, UsedElem};
