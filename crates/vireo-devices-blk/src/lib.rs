//! virtio-blk device personality.
//!
//! Requests are the classic header/data/status descriptor chains, executed
//! synchronously: the submitting thread blocks on a completion signalled
//! from the IRQ path. One request is outstanding at a time (serialized by an
//! internal lock), which also makes completion attribution trivial.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use vireo_virtio::mem::{write_u32_le, write_u64_le};
use vireo_virtio::{
    Backend, BackendError, DescFlags, Device, DeviceOps, DmaAllocator, DmaError, DmaMemory, Ring,
    RingError, RingOptions,
};

pub const SECTOR_SIZE: u64 = 512;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// `capacity` is the first field of `struct virtio_blk_config`.
const CONFIG_CAPACITY_OFFSET: u64 = 0;

const QUEUE_INDEX: u16 = 0;

/// Request header (`struct virtio_blk_req` header portion).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioBlkReqHeader {
    pub req_type: u32,
    pub reserved: u32,
    pub sector: u64,
}

const REQ_HEADER_LEN: usize = 16;
const STATUS_LEN: usize = 1;

/// Sentinel written to the status buffer before submission, so a completion
/// that never touched it maps to [`BlkError::BadStatus`] instead of
/// accidentally reading as success.
const STATUS_UNWRITTEN: u8 = 0xff;

pub type Result<T> = std::result::Result<T, BlkError>;

#[derive(Debug, Error)]
pub enum BlkError {
    #[error("transfer of {sectors} sectors at {sector} exceeds capacity {capacity}")]
    OutOfRange {
        sector: u64,
        sectors: u64,
        capacity: u64,
    },

    #[error("transfer length {len} is not a multiple of the {SECTOR_SIZE}-byte sector size")]
    UnalignedLength { len: usize },

    #[error("transfer length {len} exceeds the device limit {max}")]
    TransferTooLarge { len: usize, max: usize },

    #[error("no free descriptors for the request")]
    QueueFull,

    #[error("device reported an i/o error")]
    Io,

    #[error("device does not support the request")]
    Unsupported,

    #[error("device returned unknown status {0:#x}")]
    BadStatus(u8),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Dma(#[from] DmaError),
}

/// Construction knobs for a [`BlkDevice`].
#[derive(Debug, Clone, Copy)]
pub struct BlkOptions {
    pub queue_size: u16,
    /// Largest single transfer, in bytes. Sizes the bounce buffer.
    pub max_transfer: usize,
}

impl Default for BlkOptions {
    fn default() -> Self {
        Self {
            queue_size: 16,
            max_transfer: 64 * 1024,
        }
    }
}

struct BlkShared {
    backend: Arc<dyn Backend>,
    ring: Arc<Ring>,
    header: Arc<dyn DmaMemory>,
    data: Arc<dyn DmaMemory>,
    status: Arc<dyn DmaMemory>,
    capacity: AtomicU64,
    done: AtomicBool,
    wait: Mutex<()>,
    cv: Condvar,
}

struct BlkOps {
    shared: Arc<BlkShared>,
}

impl DeviceOps for BlkOps {
    fn irq_ring_update(&mut self) {
        let ring = Arc::clone(&self.shared.ring);
        let mut completed = false;
        ring.irq_ring_update(|elem| {
            ring.free_chain(elem.id as u16);
            completed = true;
        });
        if completed {
            self.shared.done.store(true, Ordering::Release);
            let _wait = lock(&self.shared.wait);
            self.shared.cv.notify_all();
        }
    }

    fn irq_config_change(&mut self) {
        // Capacity is the only config field this personality consumes; pick
        // up live resizes.
        let capacity = self
            .shared
            .backend
            .device_config_read_u64(CONFIG_CAPACITY_OFFSET);
        self.shared.capacity.store(capacity, Ordering::Release);
        debug!(capacity, "block device capacity changed");
    }
}

/// A bound virtio-blk device with synchronous request execution.
pub struct BlkDevice {
    device: Device<BlkOps>,
    shared: Arc<BlkShared>,
    /// One outstanding request at a time.
    io: Mutex<()>,
    max_transfer: usize,
}

impl BlkDevice {
    pub fn new(
        backend: Arc<dyn Backend>,
        dma: &dyn DmaAllocator,
        options: BlkOptions,
    ) -> Result<Self> {
        backend.device_reset();
        backend.driver_status_ack();
        // Reads, writes, and flushes need no feature bits.
        backend.confirm_features()?;

        let ring = Arc::new(Ring::new(
            Arc::clone(&backend),
            dma,
            QUEUE_INDEX,
            options.queue_size,
            RingOptions::default(),
        )?);

        let shared = Arc::new(BlkShared {
            backend: Arc::clone(&backend),
            ring,
            header: dma.alloc(REQ_HEADER_LEN)?,
            data: dma.alloc(options.max_transfer)?,
            status: dma.alloc(STATUS_LEN)?,
            capacity: AtomicU64::new(backend.device_config_read_u64(CONFIG_CAPACITY_OFFSET)),
            done: AtomicBool::new(false),
            wait: Mutex::new(()),
            cv: Condvar::new(),
        });

        let mut device = Device::new(
            Arc::clone(&backend),
            BlkOps {
                shared: Arc::clone(&shared),
            },
        );
        device.start_irq_thread();
        backend.driver_status_ok();

        Ok(Self {
            device,
            shared,
            io: Mutex::new(()),
            max_transfer: options.max_transfer,
        })
    }

    /// Device capacity in 512-byte sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.shared.capacity.load(Ordering::Acquire)
    }

    /// Read whole sectors starting at `sector`, blocking until the device
    /// completes the request.
    pub fn read_sync(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_transfer(sector, buf.len())?;
        let _io = lock(&self.io);
        self.submit_and_wait(VIRTIO_BLK_T_IN, sector, buf.len())?;
        self.shared.data.read(0, buf);
        Ok(())
    }

    /// Write whole sectors starting at `sector`, blocking until the device
    /// completes the request.
    pub fn write_sync(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.check_transfer(sector, buf.len())?;
        let _io = lock(&self.io);
        self.shared.data.write(0, buf);
        self.submit_and_wait(VIRTIO_BLK_T_OUT, sector, buf.len())
    }

    /// Flush the device's write cache.
    pub fn flush_sync(&self) -> Result<()> {
        let _io = lock(&self.io);
        self.submit_and_wait(VIRTIO_BLK_T_FLUSH, 0, 0)
    }

    /// The request ring, for device-side test harnesses.
    pub fn ring(&self) -> Arc<Ring> {
        Arc::clone(&self.shared.ring)
    }

    pub fn shutdown(&mut self) {
        self.device.shutdown();
    }

    fn check_transfer(&self, sector: u64, len: usize) -> Result<()> {
        if len == 0 || len % SECTOR_SIZE as usize != 0 {
            return Err(BlkError::UnalignedLength { len });
        }
        if len > self.max_transfer {
            return Err(BlkError::TransferTooLarge {
                len,
                max: self.max_transfer,
            });
        }
        let sectors = len as u64 / SECTOR_SIZE;
        let capacity = self.capacity_sectors();
        if sector.checked_add(sectors).map_or(true, |end| end > capacity) {
            return Err(BlkError::OutOfRange {
                sector,
                sectors,
                capacity,
            });
        }
        Ok(())
    }

    /// Build the header/data/status chain, publish it, and block until the
    /// IRQ path signals completion. Caller holds the io lock.
    fn submit_and_wait(&self, req_type: u32, sector: u64, data_len: usize) -> Result<()> {
        let sh = &self.shared;

        write_u32_le(&*sh.header, 0, req_type);
        write_u32_le(&*sh.header, 4, 0);
        write_u64_le(&*sh.header, 8, sector);
        sh.status.write(0, &[STATUS_UNWRITTEN]);

        let desc_count = if data_len > 0 { 3 } else { 2 };
        let head = sh
            .ring
            .alloc_desc_chain(desc_count)
            .ok_or(BlkError::QueueFull)?;

        let mut desc = sh.ring.desc(head);
        desc.addr = sh.header.phys_addr();
        desc.len = REQ_HEADER_LEN as u32;
        sh.ring.write_desc(head, desc);
        let mut next = desc.next;

        if data_len > 0 {
            let mut data_desc = sh.ring.desc(next);
            data_desc.addr = sh.data.phys_addr();
            data_desc.len = data_len as u32;
            if req_type == VIRTIO_BLK_T_IN {
                data_desc.flags |= DescFlags::WRITE;
            }
            sh.ring.write_desc(next, data_desc);
            next = data_desc.next;
        }

        let mut status_desc = sh.ring.desc(next);
        status_desc.addr = sh.status.phys_addr();
        status_desc.len = STATUS_LEN as u32;
        status_desc.flags |= DescFlags::WRITE;
        sh.ring.write_desc(next, status_desc);

        sh.done.store(false, Ordering::Release);
        sh.ring.submit_chain(head);
        sh.ring.kick();

        // Bounded waits in a loop rather than a timeout: a submitted chain
        // cannot be withdrawn, so there is nothing useful to do but keep
        // waiting and say so.
        let mut wait = lock(&sh.wait);
        while !sh.done.load(Ordering::Acquire) {
            let (guard, timeout) = sh
                .cv
                .wait_timeout(wait, Duration::from_millis(100))
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            wait = guard;
            if timeout.timed_out() {
                trace!(req_type, sector, "block request still pending");
            }
        }
        drop(wait);

        let mut status = [0u8; STATUS_LEN];
        sh.status.read(0, &mut status);
        match status[0] {
            VIRTIO_BLK_S_OK => Ok(()),
            VIRTIO_BLK_S_IOERR => Err(BlkError::Io),
            VIRTIO_BLK_S_UNSUPP => Err(BlkError::Unsupported),
            other => Err(BlkError::BadStatus(other)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn request_header_layout() {
        assert_eq!(size_of::<VirtioBlkReqHeader>(), 16);
        assert_eq!(offset_of!(VirtioBlkReqHeader, req_type), 0);
        assert_eq!(offset_of!(VirtioBlkReqHeader, reserved), 4);
        assert_eq!(offset_of!(VirtioBlkReqHeader, sector), 8);
    }
}
