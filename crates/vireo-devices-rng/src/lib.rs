//! virtio-entropy device personality.
//!
//! The simplest personality there is: one ring, one device-writable buffer.
//! Each completion drains the buffer into an in-memory pool and, while the
//! pool is below its target, immediately re-queues the buffer so the well
//! stays topped up. [`RngDevice::fill`] hands pooled bytes out.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use vireo_virtio::{
    Backend, BackendError, DescFlags, Device, DeviceOps, DmaAllocator, DmaError, DmaMemory, Ring,
    RingError, RingOptions,
};

const QUEUE_INDEX: u16 = 0;
const QUEUE_SIZE: u16 = 8;

/// Bytes requested from the device per chain.
const ENTROPY_BUFFER_LEN: usize = 64;

/// Pool level at which refilling stops.
const POOL_TARGET: usize = 256;

pub type Result<T> = std::result::Result<T, RngError>;

#[derive(Debug, Error)]
pub enum RngError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Dma(#[from] DmaError),
}

struct RngOps {
    ring: Arc<Ring>,
    buffer: Arc<dyn DmaMemory>,
    pool: VecDeque<u8>,
    in_flight: bool,
}

impl RngOps {
    /// Queue the entropy buffer if it is not already with the device.
    fn queue_request(&mut self) {
        if self.in_flight {
            return;
        }
        // Backpressure from the ring just defers to the next completion.
        let Some(head) = self.ring.alloc_desc_chain(1) else {
            return;
        };
        let mut desc = self.ring.desc(head);
        desc.addr = self.buffer.phys_addr();
        desc.len = ENTROPY_BUFFER_LEN as u32;
        desc.flags |= DescFlags::WRITE;
        self.ring.write_desc(head, desc);
        self.ring.submit_chain(head);
        self.ring.kick();
        self.in_flight = true;
    }
}

impl DeviceOps for RngOps {
    fn irq_ring_update(&mut self) {
        let ring = Arc::clone(&self.ring);
        let mut harvested = 0usize;
        ring.irq_ring_update(|elem| {
            let len = (elem.len as usize).min(self.buffer.len());
            let mut bytes = vec![0u8; len];
            self.buffer.read(0, &mut bytes);
            self.pool.extend(bytes);
            harvested += len;
            ring.free_chain(elem.id as u16);
            self.in_flight = false;
        });
        debug!(harvested, pooled = self.pool.len(), "harvested entropy");
        if self.pool.len() < POOL_TARGET {
            self.queue_request();
        }
    }

    fn irq_config_change(&mut self) {
        // The entropy device has no configuration space.
    }
}

/// A bound virtio-entropy device.
pub struct RngDevice {
    device: Device<RngOps>,
}

impl RngDevice {
    /// Bring the device up and queue the first entropy request.
    pub fn new(backend: Arc<dyn Backend>, dma: &dyn DmaAllocator) -> Result<Self> {
        backend.device_reset();
        backend.driver_status_ack();
        // The entropy device defines no feature bits worth negotiating.
        backend.confirm_features()?;

        let ring = Arc::new(Ring::new(
            Arc::clone(&backend),
            dma,
            QUEUE_INDEX,
            QUEUE_SIZE,
            RingOptions::default(),
        )?);
        let buffer = dma.alloc(ENTROPY_BUFFER_LEN)?;

        let ops = RngOps {
            ring,
            buffer,
            pool: VecDeque::new(),
            in_flight: false,
        };
        let mut device = Device::new(Arc::clone(&backend), ops);
        device.start_irq_thread();
        backend.driver_status_ok();
        device.ops().queue_request();

        Ok(Self { device })
    }

    /// Copy pooled entropy into `dst`, returning how many bytes were
    /// available. Draining below the target re-queues the device buffer.
    pub fn fill(&self, dst: &mut [u8]) -> usize {
        let mut ops = self.device.ops();
        let n = dst.len().min(ops.pool.len());
        for (slot, byte) in dst.iter_mut().zip(ops.pool.drain(..n)) {
            *slot = byte;
        }
        if ops.pool.len() < POOL_TARGET {
            ops.queue_request();
        }
        n
    }

    /// Bytes currently pooled.
    pub fn pooled(&self) -> usize {
        self.device.ops().pool.len()
    }

    /// The entropy ring, for device-side test harnesses.
    pub fn ring(&self) -> Arc<Ring> {
        Arc::clone(&self.device.ops().ring)
    }

    pub fn shutdown(&mut self) {
        self.device.shutdown();
    }
}
