//! One split virtqueue: descriptor table, available ring, used ring, and the
//! driver-side bookkeeping that feeds them.
//!
//! The descriptor table is an arena addressed by index. A descriptor is
//! always in exactly one place: on the free list (threaded through the
//! `next` fields) or in one in-flight chain. Chains are built tail-first by
//! LIFO free-list pops, so the returned head's `next` links thread forward
//! through to the tail, and callers walk `next` to fill buffer segments.
//!
//! The free list, avail cursor, and used cursor live behind the ring's own
//! mutex: the submission path and the IRQ path touch the same bookkeeping
//! from different threads, and that discipline belongs here rather than in
//! every driver.

use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use thiserror::Error;

use crate::backend::{Backend, BackendError};
use crate::mem::{
    read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le, write_u64_le, DmaAllocator,
    DmaError, DmaMemory,
};
use crate::wire;

/// Sentinel index marking the end of the free list.
const NO_DESC: u16 = 0xffff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescFlags: u16 {
        /// Chained to the descriptor named by `next`.
        const NEXT = wire::VIRTQ_DESC_F_NEXT;
        /// Device-writable (a device -> driver buffer).
        const WRITE = wire::VIRTQ_DESC_F_WRITE;
        const INDIRECT = wire::VIRTQ_DESC_F_INDIRECT;
    }
}

/// Typed copy of one descriptor table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: DescFlags,
    pub next: u16,
}

/// One entry drained from the used ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedElem {
    /// Head index of the completed descriptor chain.
    pub id: u32,
    /// Bytes the device wrote into the chain's device-writable buffers.
    pub len: u32,
}

#[derive(Debug, Error)]
pub enum RingError {
    #[error("requested ring size {requested} exceeds device maximum {max}")]
    TooLarge { requested: u16, max: u16 },

    #[error("ring size {0} is not a nonzero power of two")]
    BadCount(u16),

    #[error(transparent)]
    Dma(#[from] DmaError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Construction knobs for a [`Ring`].
#[derive(Debug, Clone, Copy)]
pub struct RingOptions {
    /// Alignment between the avail and used sections. The default is the
    /// legacy 4096-byte layout, which modern devices also accept.
    pub align: u64,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            align: wire::VRING_ALIGN,
        }
    }
}

struct RingState {
    free_head: u16,
    free_count: u16,
    /// Driver-side copy of `avail.idx` (the device owns the shared one).
    avail_shadow: u16,
    /// First used-ring slot the driver has not consumed yet.
    last_used: u16,
}

pub struct Ring {
    index: u16,
    count: u16,
    mask: u16,
    backend: Arc<dyn Backend>,
    mem: Arc<dyn DmaMemory>,
    avail_off: usize,
    used_off: usize,
    state: Mutex<RingState>,
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("index", &self.index)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl Ring {
    /// Allocate and register one virtqueue.
    ///
    /// `count` must be a nonzero power of two no larger than what the device
    /// reports for this queue index.
    pub fn new(
        backend: Arc<dyn Backend>,
        allocator: &dyn DmaAllocator,
        index: u16,
        count: u16,
        options: RingOptions,
    ) -> Result<Self, RingError> {
        if count == 0 || !count.is_power_of_two() {
            return Err(RingError::BadCount(count));
        }
        let max = backend.ring_size(index);
        if count > max {
            return Err(RingError::TooLarge {
                requested: count,
                max,
            });
        }

        let mem = allocator.alloc(wire::vring_size(count, options.align))?;
        let avail_off = wire::vring_avail_offset(count);
        let used_off = wire::vring_used_offset(count, options.align);

        let ring = Self {
            index,
            count,
            mask: count - 1,
            backend,
            mem,
            avail_off,
            used_off,
            state: Mutex::new(RingState {
                free_head: 0,
                free_count: count,
                avail_shadow: 0,
                last_used: 0,
            }),
        };

        // Thread the free list through the descriptor table in index order.
        for i in 0..count {
            ring.write_desc(
                i,
                Descriptor {
                    addr: 0,
                    len: 0,
                    flags: DescFlags::empty(),
                    next: if i + 1 == count { NO_DESC } else { i + 1 },
                },
            );
        }

        let desc_pa = ring.mem.phys_addr();
        ring.backend.set_ring(
            index,
            count,
            desc_pa,
            desc_pa + avail_off as u64,
            desc_pa + used_off as u64,
        )?;
        Ok(ring)
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn free_count(&self) -> u16 {
        self.lock_state().free_count
    }

    /// The backing vring allocation. Exposed so tests (and fake devices) can
    /// observe the rings the way a real device would.
    pub fn dma(&self) -> Arc<dyn DmaMemory> {
        Arc::clone(&self.mem)
    }

    pub(crate) fn layout(&self) -> (usize, usize) {
        (self.avail_off, self.used_off)
    }

    /// Read one descriptor table entry.
    pub fn desc(&self, index: u16) -> Descriptor {
        assert!(index < self.count, "descriptor index out of range");
        let off = 16 * index as usize;
        Descriptor {
            addr: read_u64_le(&*self.mem, off),
            len: read_u32_le(&*self.mem, off + 8),
            flags: DescFlags::from_bits_truncate(read_u16_le(&*self.mem, off + 12)),
            next: read_u16_le(&*self.mem, off + 14),
        }
    }

    /// Write one descriptor table entry. The caller owns `index` (it came
    /// from [`alloc_desc_chain`]) and normally preserves `flags`/`next` while
    /// filling in `addr`/`len`.
    ///
    /// [`alloc_desc_chain`]: Ring::alloc_desc_chain
    pub fn write_desc(&self, index: u16, desc: Descriptor) {
        assert!(index < self.count, "descriptor index out of range");
        let off = 16 * index as usize;
        write_u64_le(&*self.mem, off, desc.addr);
        write_u32_le(&*self.mem, off + 8, desc.len);
        write_u16_le(&*self.mem, off + 12, desc.flags.bits());
        write_u16_le(&*self.mem, off + 14, desc.next);
    }

    /// Pop `count` descriptors off the free list and link them into a chain.
    ///
    /// Returns the head index, or `None` when fewer than `count` descriptors
    /// are free. `None` is backpressure, not a fault: retry once completions
    /// have freed descriptors. Every descriptor but the tail carries
    /// [`DescFlags::NEXT`].
    pub fn alloc_desc_chain(&self, count: u16) -> Option<u16> {
        debug_assert!(count > 0, "zero-length descriptor chain");
        if count == 0 {
            return None;
        }
        let mut state = self.lock_state();
        if state.free_count < count {
            return None;
        }

        // Tail-first: each pop becomes the new head, pointing at the
        // previous one. The first pop ends up as the (unchained) tail.
        let mut last = NO_DESC;
        for _ in 0..count {
            let i = state.free_head;
            let mut desc = self.desc(i);
            state.free_head = desc.next;
            if last == NO_DESC {
                desc.flags = DescFlags::empty();
                desc.next = 0;
            } else {
                desc.flags = DescFlags::NEXT;
                desc.next = last;
            }
            self.write_desc(i, desc);
            last = i;
        }
        state.free_count -= count;
        Some(last)
    }

    /// Push one descriptor back onto the free list (LIFO).
    pub fn free_desc(&self, index: u16) {
        assert!(index < self.count, "descriptor index out of range");
        let mut state = self.lock_state();
        let mut desc = self.desc(index);
        desc.flags = DescFlags::empty();
        desc.next = state.free_head;
        self.write_desc(index, desc);
        state.free_head = index;
        state.free_count += 1;
    }

    /// Free every descriptor of a chain by walking its `NEXT` links.
    pub fn free_chain(&self, head: u16) {
        let mut index = head;
        loop {
            let desc = self.desc(index);
            self.free_desc(index);
            if !desc.flags.contains(DescFlags::NEXT) {
                break;
            }
            index = desc.next;
        }
    }

    /// Publish a filled chain on the available ring.
    ///
    /// The ring entry is written before the index: the release fence keeps
    /// the device from observing the new `avail.idx` ahead of the slot it
    /// covers on weakly-ordered hosts.
    pub fn submit_chain(&self, head: u16) {
        assert!(head < self.count, "descriptor index out of range");
        let mut state = self.lock_state();
        let slot = state.avail_shadow & self.mask;
        write_u16_le(&*self.mem, self.avail_off + 4 + 2 * slot as usize, head);
        fence(Ordering::Release);
        state.avail_shadow = state.avail_shadow.wrapping_add(1);
        write_u16_le(&*self.mem, self.avail_off + 2, state.avail_shadow);
    }

    /// Notify the device that this queue has new available entries.
    pub fn kick(&self) {
        self.backend.ring_kick(self.index);
    }

    /// Drain every used-ring entry the device has published since the last
    /// call, invoking `f` once per entry.
    ///
    /// The callback interprets `UsedElem::id` as a chain head and is
    /// responsible for returning the chain's descriptors to the free list
    /// (typically via [`free_chain`]); the ring itself does not know chain
    /// boundaries. Entries are snapshotted before `f` runs, so the callback
    /// may call any `Ring` method.
    ///
    /// [`free_chain`]: Ring::free_chain
    pub fn irq_ring_update<F: FnMut(UsedElem)>(&self, mut f: F) {
        let elems: Vec<UsedElem> = {
            let mut state = self.lock_state();
            let device_idx = read_u16_le(&*self.mem, self.used_off + 2);
            fence(Ordering::Acquire);
            let mut elems = Vec::new();
            while state.last_used != device_idx {
                let slot = state.last_used & self.mask;
                let off = self.used_off + 4 + 8 * slot as usize;
                elems.push(UsedElem {
                    id: read_u32_le(&*self.mem, off),
                    len: read_u32_le(&*self.mem, off + 4),
                });
                state.last_used = state.last_used.wrapping_add(1);
            }
            elems
        };
        for elem in elems {
            f(elem);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RingState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeBackend;
    use crate::mem::HeapDma;

    fn test_ring(count: u16) -> Ring {
        let backend = Arc::new(FakeBackend::new());
        backend.device_reset();
        backend.driver_status_ack();
        let dma = HeapDma::new(1 << 20);
        Ring::new(backend, &dma, 0, count, RingOptions::default()).unwrap()
    }

    #[test]
    fn chain_links_thread_head_to_tail() {
        let ring = test_ring(8);
        let head = ring.alloc_desc_chain(3).unwrap();
        assert_eq!(ring.free_count(), 5);

        let first = ring.desc(head);
        assert!(first.flags.contains(DescFlags::NEXT));
        let second = ring.desc(first.next);
        assert!(second.flags.contains(DescFlags::NEXT));
        let third = ring.desc(second.next);
        assert!(!third.flags.contains(DescFlags::NEXT));
    }

    #[test]
    fn alloc_rejects_when_free_list_short() {
        let ring = test_ring(8);
        assert!(ring.alloc_desc_chain(9).is_none());
        assert_eq!(ring.free_count(), 8);

        let _head = ring.alloc_desc_chain(6).unwrap();
        assert!(ring.alloc_desc_chain(3).is_none());
        assert_eq!(ring.free_count(), 2);
    }

    #[test]
    fn free_list_is_lifo() {
        let ring = test_ring(8);
        let head = ring.alloc_desc_chain(1).unwrap();
        ring.free_desc(head);
        assert_eq!(ring.alloc_desc_chain(1), Some(head));
    }

    #[test]
    fn submit_writes_slot_before_idx() {
        let ring = test_ring(8);
        let mem = ring.dma();
        let head = ring.alloc_desc_chain(2).unwrap();
        ring.submit_chain(head);

        let avail_off = wire::vring_avail_offset(8);
        assert_eq!(read_u16_le(&*mem, avail_off + 2), 1);
        assert_eq!(read_u16_le(&*mem, avail_off + 4), head);
    }
}
