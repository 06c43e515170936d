use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vireo_virtio::fake::{DeviceSideRing, FakeBackend};
use vireo_virtio::{Backend, Device, DeviceOps, HeapDma, IsrStatus, Ring, RingOptions};

struct CountingOps {
    ring_updates: Arc<AtomicU32>,
    config_changes: Arc<AtomicU32>,
}

impl DeviceOps for CountingOps {
    fn irq_ring_update(&mut self) {
        self.ring_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn irq_config_change(&mut self) {
        self.config_changes.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_for(counter: &AtomicU32, expected: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) < expected {
        assert!(Instant::now() < deadline, "irq thread made no progress");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn counting_device(backend: Arc<FakeBackend>) -> (Device<CountingOps>, Arc<AtomicU32>, Arc<AtomicU32>) {
    let ring_updates = Arc::new(AtomicU32::new(0));
    let config_changes = Arc::new(AtomicU32::new(0));
    let device = Device::new(
        backend,
        CountingOps {
            ring_updates: Arc::clone(&ring_updates),
            config_changes: Arc::clone(&config_changes),
        },
    );
    (device, ring_updates, config_changes)
}

#[test]
fn queue_interrupt_dispatches_ring_update() {
    let backend = Arc::new(FakeBackend::new());
    let (mut device, ring_updates, config_changes) = counting_device(Arc::clone(&backend));
    device.start_irq_thread();

    backend.trigger_interrupt(IsrStatus::QUEUE);
    wait_for(&ring_updates, 1);
    assert_eq!(config_changes.load(Ordering::SeqCst), 0);

    device.shutdown();
}

#[test]
fn config_interrupt_dispatches_config_change() {
    let backend = Arc::new(FakeBackend::new());
    let (mut device, ring_updates, config_changes) = counting_device(Arc::clone(&backend));
    device.start_irq_thread();

    backend.trigger_interrupt(IsrStatus::CONFIG);
    wait_for(&config_changes, 1);
    assert_eq!(ring_updates.load(Ordering::SeqCst), 0);

    backend.trigger_interrupt(IsrStatus::QUEUE | IsrStatus::CONFIG);
    wait_for(&ring_updates, 1);
    wait_for(&config_changes, 2);

    device.shutdown();
}

#[test]
fn shutdown_joins_the_irq_thread() {
    let backend = Arc::new(FakeBackend::new());
    let (mut device, ring_updates, _) = counting_device(Arc::clone(&backend));
    device.start_irq_thread();

    backend.trigger_interrupt(IsrStatus::QUEUE);
    wait_for(&ring_updates, 1);

    // Returns only once the thread observed Shutdown and exited.
    device.shutdown();
    assert!(!backend.interrupt_valid());

    // Further triggers go nowhere.
    backend.trigger_interrupt(IsrStatus::QUEUE);
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(ring_updates.load(Ordering::SeqCst), 1);
}

#[test]
fn device_config_accessors_reach_the_backend() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_config(vec![0u8; 16]);
    let (device, _, _) = counting_device(Arc::clone(&backend));

    device.write_device_config::<u64>(0, 0x0011_2233_4455_6677);
    assert_eq!(device.read_device_config::<u64>(0), 0x0011_2233_4455_6677);
    device.write_device_config::<u8>(8, 0x5a);
    assert_eq!(device.read_device_config::<u8>(8), 0x5a);
}

// A personality whose ring-update hook drains its ring and frees chains,
// driven end to end: submit -> device completes -> IRQ thread frees.
struct EchoOps {
    ring: Arc<Ring>,
    completions: Arc<AtomicU32>,
}

impl DeviceOps for EchoOps {
    fn irq_ring_update(&mut self) {
        let ring = Arc::clone(&self.ring);
        ring.irq_ring_update(|elem| {
            ring.free_chain(elem.id as u16);
            self.completions.fetch_add(1, Ordering::SeqCst);
        });
    }

    fn irq_config_change(&mut self) {}
}

#[test]
fn end_to_end_completion_through_irq_thread() {
    let backend = Arc::new(FakeBackend::with_queues(&[16]));
    backend.device_reset();
    backend.driver_status_ack();
    backend.confirm_features().unwrap();

    let dma = HeapDma::new(1 << 20);
    let ring = Arc::new(
        Ring::new(
            Arc::clone(&backend) as Arc<dyn vireo_virtio::Backend>,
            &dma,
            0,
            16,
            RingOptions::default(),
        )
        .unwrap(),
    );

    let completions = Arc::new(AtomicU32::new(0));
    let mut device = Device::new(
        Arc::clone(&backend) as Arc<dyn vireo_virtio::Backend>,
        EchoOps {
            ring: Arc::clone(&ring),
            completions: Arc::clone(&completions),
        },
    );
    device.start_irq_thread();
    backend.driver_status_ok();

    let head = ring.alloc_desc_chain(2).unwrap();
    ring.submit_chain(head);
    ring.kick();
    assert_eq!(backend.kicks(0), 1);

    // Device thread: complete the chain and raise the interrupt.
    let mut device_side = DeviceSideRing::new(&ring);
    let popped = device_side.pop_avail().unwrap();
    assert_eq!(popped, head);
    device_side.push_used(popped, 0);
    backend.trigger_interrupt(IsrStatus::QUEUE);

    wait_for(&completions, 1);
    assert_eq!(ring.free_count(), 16);

    device.shutdown();
}
