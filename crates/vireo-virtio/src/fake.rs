//! In-process fakes for driving the transport core in tests.
//!
//! [`FakeBackend`] stands in for a virtio device behind either PCI
//! transport. It records everything the driver does (status transitions,
//! feature bits, ring registrations, kicks) and *asserts the status
//! lifecycle ordering*, making it the oracle for bring-up bugs: calling
//! `driver_status_ok` before `driver_status_ack` panics the test.
//!
//! [`DeviceSideRing`] reads and writes a [`Ring`]'s shared memory the way
//! the device would: popping available entries, walking descriptors, and
//! publishing used entries.

use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::backend::{Backend, BackendError, DeviceStatus, IsrStatus, Result, WaitError};
use crate::mem::{read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le, DmaMemory};
use crate::ring::{DescFlags, Descriptor, Ring};

/// What the driver registered for one queue via `set_ring`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRegistration {
    pub count: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Void,
    Reset,
    Acked,
    Ready,
}

struct FakeState {
    lifecycle: Lifecycle,
    status: DeviceStatus,
    device_features: u64,
    driver_features: u64,
    reject_features: bool,
    queue_max: Vec<u16>,
    rings: Vec<Option<RingRegistration>>,
    kicks: Vec<u32>,
    isr: IsrStatus,
    config: Vec<u8>,
}

struct FakeInterrupt {
    state: Mutex<InterruptState>,
    cv: Condvar,
}

struct InterruptState {
    pending: bool,
    valid: bool,
}

/// A scriptable virtio device for tests.
pub struct FakeBackend {
    state: Mutex<FakeState>,
    irq: FakeInterrupt,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    /// One queue with a maximum ring size of 128, no feature bits, no
    /// device config.
    pub fn new() -> Self {
        Self::with_queues(&[128])
    }

    /// One entry per queue, giving that queue's maximum ring size.
    pub fn with_queues(queue_max: &[u16]) -> Self {
        Self {
            state: Mutex::new(FakeState {
                lifecycle: Lifecycle::Void,
                status: DeviceStatus::empty(),
                device_features: 0,
                driver_features: 0,
                reject_features: false,
                queue_max: queue_max.to_vec(),
                rings: vec![None; queue_max.len()],
                kicks: vec![0; queue_max.len()],
                isr: IsrStatus::empty(),
                config: Vec::new(),
            }),
            irq: FakeInterrupt {
                state: Mutex::new(InterruptState {
                    pending: false,
                    valid: true,
                }),
                cv: Condvar::new(),
            },
        }
    }

    pub fn set_device_features(&self, features: u64) {
        self.lock().device_features = features;
    }

    /// Make `confirm_features` fail the way a device that cannot operate
    /// with the negotiated set would.
    pub fn set_reject_features(&self, reject: bool) {
        self.lock().reject_features = reject;
    }

    /// Backing bytes for the device-specific configuration structure.
    pub fn set_config(&self, config: Vec<u8>) {
        self.lock().config = config;
    }

    pub fn status(&self) -> DeviceStatus {
        self.lock().status
    }

    pub fn driver_features(&self) -> u64 {
        self.lock().driver_features
    }

    pub fn ring(&self, index: u16) -> Option<RingRegistration> {
        self.lock().rings.get(index as usize).copied().flatten()
    }

    pub fn kicks(&self, index: u16) -> u32 {
        self.lock()
            .kicks
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn config_bytes(&self) -> Vec<u8> {
        self.lock().config.clone()
    }

    /// Latch interrupt cause bits and wake the IRQ thread.
    pub fn trigger_interrupt(&self, cause: IsrStatus) {
        self.lock().isr |= cause;
        let mut irq = self.lock_irq();
        irq.pending = true;
        self.irq.cv.notify_all();
    }

    /// Invalidate the interrupt handle, as `teardown_interrupt` would.
    pub fn invalidate_interrupt(&self) {
        let mut irq = self.lock_irq();
        irq.valid = false;
        self.irq.cv.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_irq(&self) -> MutexGuard<'_, InterruptState> {
        self.irq
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn config_read(&self, offset: u64, width: usize) -> u64 {
        let state = self.lock();
        let mut buf = [0u8; 8];
        for (i, byte) in buf.iter_mut().take(width).enumerate() {
            *byte = state
                .config
                .get(offset as usize + i)
                .copied()
                .unwrap_or(0);
        }
        u64::from_le_bytes(buf)
    }

    fn config_write(&self, offset: u64, value: u64, width: usize) {
        let mut state = self.lock();
        let end = offset as usize + width;
        if state.config.len() < end {
            state.config.resize(end, 0);
        }
        state.config[offset as usize..end].copy_from_slice(&value.to_le_bytes()[..width]);
    }
}

impl Backend for FakeBackend {
    fn read_feature(&self, bit: u32) -> bool {
        let state = self.lock();
        bit < 64 && state.device_features & (1u64 << bit) != 0
    }

    fn set_feature(&self, bit: u32) {
        assert!(bit < 64, "feature bit {bit} out of range");
        self.lock().driver_features |= 1u64 << bit;
    }

    fn confirm_features(&self) -> Result<()> {
        let mut state = self.lock();
        assert!(
            state.lifecycle == Lifecycle::Acked,
            "confirm_features outside feature negotiation (lifecycle {:?})",
            state.lifecycle
        );
        if state.reject_features {
            return Err(BackendError::FeaturesRejected);
        }
        state.status |= DeviceStatus::FEATURES_OK;
        Ok(())
    }

    fn device_reset(&self) {
        let mut state = self.lock();
        state.lifecycle = Lifecycle::Reset;
        state.status = DeviceStatus::empty();
        state.driver_features = 0;
        state.isr = IsrStatus::empty();
        for ring in &mut state.rings {
            *ring = None;
        }
    }

    fn driver_status_ack(&self) {
        let mut state = self.lock();
        assert!(
            state.lifecycle == Lifecycle::Reset,
            "driver_status_ack before device_reset (lifecycle {:?})",
            state.lifecycle
        );
        state.lifecycle = Lifecycle::Acked;
        state.status |= DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER;
    }

    fn driver_status_ok(&self) {
        let mut state = self.lock();
        assert!(
            state.lifecycle == Lifecycle::Acked,
            "driver_status_ok before driver_status_ack (lifecycle {:?})",
            state.lifecycle
        );
        state.lifecycle = Lifecycle::Ready;
        state.status |= DeviceStatus::DRIVER_OK;
    }

    fn device_config_read_u8(&self, offset: u64) -> u8 {
        self.config_read(offset, 1) as u8
    }

    fn device_config_read_u16(&self, offset: u64) -> u16 {
        self.config_read(offset, 2) as u16
    }

    fn device_config_read_u32(&self, offset: u64) -> u32 {
        self.config_read(offset, 4) as u32
    }

    fn device_config_read_u64(&self, offset: u64) -> u64 {
        self.config_read(offset, 8)
    }

    fn device_config_write_u8(&self, offset: u64, value: u8) {
        self.config_write(offset, u64::from(value), 1);
    }

    fn device_config_write_u16(&self, offset: u64, value: u16) {
        self.config_write(offset, u64::from(value), 2);
    }

    fn device_config_write_u32(&self, offset: u64, value: u32) {
        self.config_write(offset, u64::from(value), 4);
    }

    fn device_config_write_u64(&self, offset: u64, value: u64) {
        self.config_write(offset, value, 8);
    }

    fn ring_size(&self, index: u16) -> u16 {
        self.lock()
            .queue_max
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }

    fn set_ring(&self, index: u16, count: u16, desc: u64, avail: u64, used: u64) -> Result<()> {
        let mut state = self.lock();
        let max = state.queue_max.get(index as usize).copied().unwrap_or(0);
        assert!(
            count <= max,
            "set_ring({index}) with count {count} above device maximum {max}"
        );
        state.rings[index as usize] = Some(RingRegistration {
            count,
            desc,
            avail,
            used,
        });
        Ok(())
    }

    fn ring_kick(&self, index: u16) {
        let mut state = self.lock();
        if let Some(kicks) = state.kicks.get_mut(index as usize) {
            *kicks += 1;
        }
    }

    fn isr_status(&self) -> IsrStatus {
        let mut state = self.lock();
        std::mem::take(&mut state.isr)
    }

    fn interrupt_valid(&self) -> bool {
        self.lock_irq().valid
    }

    fn wait_for_interrupt(&self) -> std::result::Result<(), WaitError> {
        let mut irq = self.lock_irq();
        loop {
            if !irq.valid {
                return Err(WaitError::Shutdown);
            }
            if irq.pending {
                irq.pending = false;
                return Ok(());
            }
            irq = self
                .irq
                .cv
                .wait(irq)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn teardown_interrupt(&self) {
        self.invalidate_interrupt();
    }
}

/// Reads and writes a [`Ring`]'s shared memory from the device's side.
pub struct DeviceSideRing {
    mem: Arc<dyn DmaMemory>,
    count: u16,
    mask: u16,
    avail_off: usize,
    used_off: usize,
    next_avail: u16,
}

impl DeviceSideRing {
    pub fn new(ring: &Ring) -> Self {
        let (avail_off, used_off) = ring.layout();
        Self {
            mem: ring.dma(),
            count: ring.count(),
            mask: ring.count() - 1,
            avail_off,
            used_off,
            next_avail: 0,
        }
    }

    pub fn avail_idx(&self) -> u16 {
        read_u16_le(&*self.mem, self.avail_off + 2)
    }

    /// Next chain head the driver made available, if any.
    pub fn pop_avail(&mut self) -> Option<u16> {
        if self.next_avail == self.avail_idx() {
            return None;
        }
        fence(Ordering::Acquire);
        let slot = self.next_avail & self.mask;
        let head = read_u16_le(&*self.mem, self.avail_off + 4 + 2 * slot as usize);
        self.next_avail = self.next_avail.wrapping_add(1);
        Some(head)
    }

    pub fn desc(&self, index: u16) -> Descriptor {
        assert!(index < self.count);
        let off = 16 * index as usize;
        Descriptor {
            addr: read_u64_le(&*self.mem, off),
            len: read_u32_le(&*self.mem, off + 8),
            flags: DescFlags::from_bits_truncate(read_u16_le(&*self.mem, off + 12)),
            next: read_u16_le(&*self.mem, off + 14),
        }
    }

    /// Collect a whole chain, head first.
    pub fn chain(&self, head: u16) -> Vec<(u16, Descriptor)> {
        let mut chain = Vec::new();
        let mut index = head;
        loop {
            let desc = self.desc(index);
            let next = desc.next;
            let chained = desc.flags.contains(DescFlags::NEXT);
            chain.push((index, desc));
            if !chained {
                break;
            }
            index = next;
        }
        chain
    }

    pub fn used_idx(&self) -> u16 {
        read_u16_le(&*self.mem, self.used_off + 2)
    }

    /// Publish one completion: write the used element, then advance
    /// `used.idx` behind a release fence, like a conforming device.
    pub fn push_used(&self, id: u16, len: u32) {
        let idx = self.used_idx();
        let slot = idx & self.mask;
        let off = self.used_off + 4 + 8 * slot as usize;
        write_u32_le(&*self.mem, off, u32::from(id));
        write_u32_le(&*self.mem, off + 4, len);
        fence(Ordering::Release);
        write_u16_le(&*self.mem, self.used_off + 2, idx.wrapping_add(1));
    }
}
