//! The per-device lifecycle and interrupt-dispatch core.
//!
//! A device personality (block, entropy, ...) implements [`DeviceOps`] and
//! hands itself to a [`Device`], which owns the one interrupt-service thread
//! the transport gets. All IRQ handling is serialized through that thread,
//! and both callbacks run under the ops lock, so a personality that routes
//! its submission paths through the same lock gets whole-device mutual
//! exclusion for free.
//!
//! Bring-up order is the personality's job and follows the virtio spec:
//! `device_reset` -> `driver_status_ack` -> feature negotiation ->
//! ring/buffer allocation -> `start_irq_thread` -> `driver_status_ok`.
//! This layer does not re-check that ordering; the fake backend asserts it
//! in tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{trace, warn};

use crate::backend::{Backend, ConfigValue, IsrStatus, Result, WaitError};

/// The two hooks the IRQ thread dispatches to.
pub trait DeviceOps: Send + 'static {
    /// A used ring has new entries; drain it and free completed chains.
    fn irq_ring_update(&mut self);

    /// The device configuration space changed.
    fn irq_config_change(&mut self);
}

pub struct Device<O: DeviceOps> {
    backend: Arc<dyn Backend>,
    ops: Arc<Mutex<O>>,
    irq_thread: Option<thread::JoinHandle<()>>,
}

impl<O: DeviceOps> Device<O> {
    pub fn new(backend: Arc<dyn Backend>, ops: O) -> Self {
        Self {
            backend,
            ops: Arc::new(Mutex::new(ops)),
            irq_thread: None,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The per-device lock. Submission paths should acquire it so they
    /// exclude the IRQ callbacks.
    pub fn ops(&self) -> MutexGuard<'_, O> {
        lock(&self.ops)
    }

    pub fn device_reset(&self) {
        self.backend.device_reset();
    }

    pub fn driver_status_ack(&self) {
        self.backend.driver_status_ack();
    }

    pub fn driver_status_ok(&self) {
        self.backend.driver_status_ok();
    }

    pub fn confirm_features(&self) -> Result<()> {
        self.backend.confirm_features()
    }

    pub fn ring_size(&self, index: u16) -> u16 {
        self.backend.ring_size(index)
    }

    pub fn ring_kick(&self, index: u16) {
        self.backend.ring_kick(index);
    }

    pub fn read_device_config<T: ConfigValue>(&self, offset: u64) -> T {
        T::read_config(self.backend.as_ref(), offset)
    }

    pub fn write_device_config<T: ConfigValue>(&self, offset: u64, value: T) {
        T::write_config(self.backend.as_ref(), offset, value);
    }

    /// Spawn the interrupt-service thread. One per device; calling twice is
    /// a no-op.
    pub fn start_irq_thread(&mut self) {
        if self.irq_thread.is_some() {
            debug_assert!(false, "irq thread already running");
            return;
        }
        let backend = Arc::clone(&self.backend);
        let ops = Arc::clone(&self.ops);
        self.irq_thread = Some(thread::spawn(move || irq_loop(backend, ops)));
    }

    /// Tear down the interrupt handle and join the IRQ thread.
    pub fn shutdown(&mut self) {
        self.backend.teardown_interrupt();
        if let Some(handle) = self.irq_thread.take() {
            if handle.join().is_err() {
                warn!("irq thread panicked during shutdown");
            }
        }
    }
}

impl<O: DeviceOps> Drop for Device<O> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn irq_loop<O: DeviceOps>(backend: Arc<dyn Backend>, ops: Arc<Mutex<O>>) {
    loop {
        match backend.wait_for_interrupt() {
            Ok(()) => {}
            Err(WaitError::Shutdown) => break,
            Err(err) => {
                warn!(%err, "interrupt wait failed");
                continue;
            }
        }

        let isr = backend.isr_status();
        backend.interrupt_complete();
        if isr.is_empty() {
            trace!("spurious interrupt");
            continue;
        }

        let mut ops = lock(&ops);
        if isr.contains(IsrStatus::QUEUE) {
            ops.irq_ring_update();
        }
        if isr.contains(IsrStatus::CONFIG) {
            ops.irq_config_change();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
