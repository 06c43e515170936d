use std::sync::Arc;

use proptest::prelude::*;

use vireo_virtio::fake::{DeviceSideRing, FakeBackend};
use vireo_virtio::{Backend, DescFlags, HeapDma, Ring, RingError, RingOptions};

fn ready_backend(queue_max: &[u16]) -> Arc<FakeBackend> {
    let backend = Arc::new(FakeBackend::with_queues(queue_max));
    backend.device_reset();
    backend.driver_status_ack();
    backend
}

fn ring_with_max(count: u16, max: u16) -> Result<Ring, RingError> {
    let backend = ready_backend(&[max]);
    let dma = HeapDma::new(1 << 22);
    Ring::new(backend, &dma, 0, count, RingOptions::default())
}

#[test]
fn init_within_device_maximum_succeeds() {
    let ring = ring_with_max(128, 128).unwrap();
    assert_eq!(ring.count(), 128);
    assert_eq!(ring.free_count(), 128);
}

#[test]
fn init_beyond_device_maximum_fails() {
    match ring_with_max(256, 128) {
        Err(RingError::TooLarge { requested, max }) => {
            assert_eq!(requested, 256);
            assert_eq!(max, 128);
        }
        other => panic!("expected TooLarge, got {other:?}"),
    }
}

#[test]
fn init_rejects_non_power_of_two() {
    assert!(matches!(ring_with_max(24, 128), Err(RingError::BadCount(24))));
    assert!(matches!(ring_with_max(0, 128), Err(RingError::BadCount(0))));
}

#[test]
fn init_registers_physical_addresses() {
    let backend = ready_backend(&[64]);
    let dma = HeapDma::new(1 << 20);
    let ring = Ring::new(backend.clone(), &dma, 0, 64, RingOptions::default()).unwrap();

    let reg = backend.ring(0).expect("ring registered");
    assert_eq!(reg.count, 64);
    assert_eq!(reg.desc, ring.dma().phys_addr());
    assert_eq!(reg.avail, reg.desc + 16 * 64);
    // Legacy alignment puts the used ring on the next page boundary.
    assert_eq!(reg.used % 4096, 0);
    assert!(reg.used > reg.avail);
}

#[test]
fn alloc_chain_of_each_valid_length() {
    let ring = ring_with_max(16, 16).unwrap();
    for count in 1..=16u16 {
        let head = ring.alloc_desc_chain(count).expect("free list is full");
        assert_eq!(ring.free_count(), 16 - count);

        // Exactly `count` linked descriptors, every non-terminal with NEXT.
        let mut seen = 1;
        let mut desc = ring.desc(head);
        while desc.flags.contains(DescFlags::NEXT) {
            desc = ring.desc(desc.next);
            seen += 1;
        }
        assert_eq!(seen, count);

        ring.free_chain(head);
        assert_eq!(ring.free_count(), 16);
    }
}

#[test]
fn alloc_backpressure_leaves_free_count_unchanged() {
    let ring = ring_with_max(8, 8).unwrap();
    let _held = ring.alloc_desc_chain(5).unwrap();
    assert!(ring.alloc_desc_chain(4).is_none());
    assert_eq!(ring.free_count(), 3);
}

#[test]
fn free_then_alloc_returns_same_descriptor() {
    let ring = ring_with_max(8, 8).unwrap();
    let a = ring.alloc_desc_chain(1).unwrap();
    let b = ring.alloc_desc_chain(1).unwrap();
    ring.free_desc(b);
    ring.free_desc(a);
    // LIFO: the most recently freed comes back first.
    assert_eq!(ring.alloc_desc_chain(1), Some(a));
    assert_eq!(ring.alloc_desc_chain(1), Some(b));
}

#[test]
fn submit_complete_roundtrip_restores_free_count() {
    let backend = ready_backend(&[8]);
    let dma = HeapDma::new(1 << 20);
    let ring = Ring::new(backend.clone(), &dma, 0, 8, RingOptions::default()).unwrap();

    let head = ring.alloc_desc_chain(3).unwrap();
    assert_eq!(ring.free_count(), 5);
    ring.submit_chain(head);
    ring.kick();
    assert_eq!(backend.kicks(0), 1);

    // Play the device: consume the chain, publish a completion.
    let mut device = DeviceSideRing::new(&ring);
    let popped = device.pop_avail().expect("chain available");
    assert_eq!(popped, head);
    assert_eq!(device.chain(popped).len(), 3);
    device.push_used(popped, 64);

    let mut completions = Vec::new();
    ring.irq_ring_update(|elem| {
        completions.push(elem);
        ring.free_chain(elem.id as u16);
    });

    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].id, u32::from(head));
    assert_eq!(completions[0].len, 64);
    assert_eq!(ring.free_count(), 8);
    assert_eq!(device.used_idx(), 1);

    // The cursor advanced: nothing new to drain.
    ring.irq_ring_update(|_| panic!("no further completions expected"));
}

#[test]
fn one_callback_per_submitted_chain() {
    let ring = ring_with_max(16, 16).unwrap();
    let mut device = DeviceSideRing::new(&ring);

    let mut heads = Vec::new();
    for _ in 0..4 {
        let head = ring.alloc_desc_chain(2).unwrap();
        ring.submit_chain(head);
        heads.push(head);
    }
    while let Some(head) = device.pop_avail() {
        device.push_used(head, 0);
    }

    let mut completed = Vec::new();
    ring.irq_ring_update(|elem| {
        completed.push(elem.id as u16);
        ring.free_chain(elem.id as u16);
    });
    assert_eq!(completed, heads);
    assert_eq!(ring.free_count(), 16);
}

proptest! {
    // Random interleavings of chain allocation and completion keep the free
    // list consistent: free_count matches, and no descriptor is ever in two
    // places at once.
    #[test]
    fn free_list_stays_consistent(ops in proptest::collection::vec(0u8..=8, 1..64)) {
        let ring = ring_with_max(32, 32).unwrap();
        let mut live: Vec<(u16, u16)> = Vec::new(); // (head, len)

        for op in ops {
            if op == 0 {
                if let Some((head, _len)) = live.pop() {
                    ring.free_chain(head);
                }
            } else {
                let len = u16::from(op);
                if let Some(head) = ring.alloc_desc_chain(len) {
                    live.push((head, len));
                }
            }

            let live_total: u16 = live.iter().map(|(_, len)| len).sum();
            prop_assert_eq!(ring.free_count(), 32 - live_total);

            // Walk every live chain; indices must be unique across chains.
            let mut seen = std::collections::HashSet::new();
            for &(head, len) in &live {
                let mut index = head;
                for hop in 0..len {
                    prop_assert!(seen.insert(index), "descriptor {} in two chains", index);
                    let desc = ring.desc(index);
                    if hop + 1 < len {
                        prop_assert!(desc.flags.contains(DescFlags::NEXT));
                        index = desc.next;
                    } else {
                        prop_assert!(!desc.flags.contains(DescFlags::NEXT));
                    }
                }
            }
        }
    }
}
