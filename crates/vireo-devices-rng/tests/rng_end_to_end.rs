use std::sync::Arc;
use std::time::{Duration, Instant};

use vireo_devices_rng::RngDevice;
use vireo_virtio::fake::{DeviceSideRing, FakeBackend};
use vireo_virtio::{Backend, DescFlags, DeviceStatus, HeapDma, IsrStatus};

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn bring_up_queues_an_entropy_request() {
    let backend = Arc::new(FakeBackend::new());
    let dma = HeapDma::new(1 << 20);
    let device = RngDevice::new(Arc::clone(&backend) as Arc<dyn Backend>, &dma).unwrap();

    assert!(backend.status().contains(DeviceStatus::DRIVER_OK));
    assert_eq!(backend.kicks(0), 1);

    let mut device_side = DeviceSideRing::new(&device.ring());
    let head = device_side.pop_avail().expect("request submitted");
    let chain = device_side.chain(head);
    assert_eq!(chain.len(), 1);
    assert!(chain[0].1.flags.contains(DescFlags::WRITE));
    assert_eq!(chain[0].1.len, 64);
}

#[test]
fn completions_fill_the_pool_and_requeue() {
    let backend = Arc::new(FakeBackend::new());
    let dma = HeapDma::new(1 << 20);
    let ram = dma.ram();
    let device = RngDevice::new(Arc::clone(&backend) as Arc<dyn Backend>, &dma).unwrap();

    let mut device_side = DeviceSideRing::new(&device.ring());

    // Service the first request with a recognizable byte pattern.
    let head = device_side.pop_avail().unwrap();
    let desc = device_side.desc(head);
    let pattern: Vec<u8> = (0..desc.len as usize).map(|i| i as u8).collect();
    ram.write(desc.addr as usize, &pattern);
    device_side.push_used(head, desc.len);
    backend.trigger_interrupt(IsrStatus::QUEUE);

    wait_until(|| device.pooled() >= 64);

    // The pool is still below target, so the buffer went straight back out.
    assert_eq!(backend.kicks(0), 2);

    let mut out = [0u8; 32];
    assert_eq!(device.fill(&mut out), 32);
    assert_eq!(&out[..], &pattern[..32]);
    assert_eq!(device.pooled(), 32);

    // Short reads drain what is there.
    let mut rest = [0u8; 64];
    assert_eq!(device.fill(&mut rest), 32);
    assert_eq!(&rest[..32], &pattern[32..]);
    assert_eq!(device.pooled(), 0);
}

#[test]
fn shutdown_stops_the_irq_thread() {
    let backend = Arc::new(FakeBackend::new());
    let dma = HeapDma::new(1 << 20);
    let mut device = RngDevice::new(Arc::clone(&backend) as Arc<dyn Backend>, &dma).unwrap();
    device.shutdown();
    assert!(!backend.interrupt_valid());
}
