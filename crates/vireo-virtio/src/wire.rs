//! On-the-wire structures shared with the device side.
//!
//! These are the split-virtqueue layout (`virtq_desc` / avail ring / used
//! ring) and the virtio-pci capability structures from the virtio 1.0 spec.
//! The device behind the transport is an external hypervisor/VMM, so the
//! layouts here must be bit-exact; the unit tests below lock them down with
//! `size_of`/`offset_of` checks.

/// Virtqueue descriptor table entry (`struct virtq_desc`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Virtqueue available ring header (does not include the variable-length ring array).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtqAvailHeader {
    pub flags: u16,
    pub idx: u16,
}

pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Virtqueue used ring header (does not include the variable-length ring array).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtqUsedHeader {
    pub flags: u16,
    pub idx: u16,
}

pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

/// Virtqueue used ring element (`struct virtq_used_elem`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

/// PCI capability header for virtio-pci (`struct virtio_pci_cap`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioPciCap {
    pub cap_vndr: u8,
    pub cap_next: u8,
    pub cap_len: u8,
    pub cfg_type: u8,
    pub bar: u8,
    pub padding: [u8; 3],
    pub offset: u32,
    pub length: u32,
}

/// Notification capability (`struct virtio_pci_notify_cap`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioPciNotifyCap {
    pub cap: VirtioPciCap,
    pub notify_off_multiplier: u32,
}

/// Common configuration structure (`struct virtio_pci_common_cfg`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioPciCommonCfg {
    pub device_feature_select: u32,
    pub device_feature: u32,
    pub driver_feature_select: u32,
    pub driver_feature: u32,
    pub msix_config: u16,
    pub num_queues: u16,
    pub device_status: u8,
    pub config_generation: u8,
    pub queue_select: u16,
    pub queue_size: u16,
    pub queue_msix_vector: u16,
    pub queue_enable: u16,
    pub queue_notify_off: u16,
    pub queue_desc: u64,
    pub queue_avail: u64,
    pub queue_used: u64,
}

pub const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 1;
pub const VIRTIO_PCI_CAP_NOTIFY_CFG: u8 = 2;
pub const VIRTIO_PCI_CAP_ISR_CFG: u8 = 3;
pub const VIRTIO_PCI_CAP_DEVICE_CFG: u8 = 4;
pub const VIRTIO_PCI_CAP_PCI_CFG: u8 = 5;

/// Alignment required between the avail and used sections of a legacy vring.
/// Modern devices accept arbitrary addresses, so one layout serves both.
pub const VRING_ALIGN: u64 = 4096;

pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Byte offset of the descriptor table inside a vring allocation.
pub const fn vring_desc_offset() -> usize {
    0
}

/// Byte offset of the available ring inside a vring allocation.
pub const fn vring_avail_offset(count: u16) -> usize {
    16 * count as usize
}

/// Byte offset of the used ring inside a vring allocation.
pub fn vring_used_offset(count: u16, align: u64) -> usize {
    // avail: flags + idx + ring[count] + used_event
    let avail_end = vring_avail_offset(count) as u64 + 4 + 2 * count as u64 + 2;
    align_up(avail_end, align) as usize
}

/// Total size in bytes of a vring allocation (the `vring_size` formula).
pub fn vring_size(count: u16, align: u64) -> usize {
    // used: flags + idx + ring[count] of {id, len} + avail_event
    vring_used_offset(count, align) + 4 + 8 * count as usize + 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn virtq_desc_layout() {
        assert_eq!(size_of::<VirtqDesc>(), 16);
        assert_eq!(offset_of!(VirtqDesc, addr), 0);
        assert_eq!(offset_of!(VirtqDesc, len), 8);
        assert_eq!(offset_of!(VirtqDesc, flags), 12);
        assert_eq!(offset_of!(VirtqDesc, next), 14);
    }

    #[test]
    fn virtq_ring_header_layout() {
        assert_eq!(size_of::<VirtqAvailHeader>(), 4);
        assert_eq!(offset_of!(VirtqAvailHeader, idx), 2);
        assert_eq!(size_of::<VirtqUsedHeader>(), 4);
        assert_eq!(size_of::<VirtqUsedElem>(), 8);
        assert_eq!(offset_of!(VirtqUsedElem, id), 0);
        assert_eq!(offset_of!(VirtqUsedElem, len), 4);
    }

    #[test]
    fn virtio_pci_cap_layout() {
        assert_eq!(size_of::<VirtioPciCap>(), 16);
        assert_eq!(offset_of!(VirtioPciCap, cfg_type), 3);
        assert_eq!(offset_of!(VirtioPciCap, bar), 4);
        assert_eq!(offset_of!(VirtioPciCap, offset), 8);
        assert_eq!(offset_of!(VirtioPciCap, length), 12);
        assert_eq!(size_of::<VirtioPciNotifyCap>(), 20);
        assert_eq!(offset_of!(VirtioPciNotifyCap, notify_off_multiplier), 16);
    }

    #[test]
    fn virtio_pci_common_cfg_layout() {
        assert_eq!(size_of::<VirtioPciCommonCfg>(), 56);
        assert_eq!(offset_of!(VirtioPciCommonCfg, device_feature_select), 0);
        assert_eq!(offset_of!(VirtioPciCommonCfg, driver_feature), 12);
        assert_eq!(offset_of!(VirtioPciCommonCfg, num_queues), 18);
        assert_eq!(offset_of!(VirtioPciCommonCfg, device_status), 20);
        assert_eq!(offset_of!(VirtioPciCommonCfg, queue_select), 22);
        assert_eq!(offset_of!(VirtioPciCommonCfg, queue_size), 24);
        assert_eq!(offset_of!(VirtioPciCommonCfg, queue_notify_off), 30);
        assert_eq!(offset_of!(VirtioPciCommonCfg, queue_desc), 32);
        assert_eq!(offset_of!(VirtioPciCommonCfg, queue_avail), 40);
        assert_eq!(offset_of!(VirtioPciCommonCfg, queue_used), 48);
    }

    #[test]
    fn vring_size_matches_spec_formula() {
        // Size-8 ring, page alignment: desc 128, avail 22 -> used starts at 4096.
        assert_eq!(vring_avail_offset(8), 128);
        assert_eq!(vring_used_offset(8, 4096), 4096);
        assert_eq!(vring_size(8, 4096), 4096 + 4 + 64 + 2);

        // Size-128 ring: desc 2048, avail ends at 2048 + 262 -> used at 4096.
        assert_eq!(vring_used_offset(128, 4096), 4096);
        assert_eq!(vring_size(128, 4096), 4096 + 4 + 1024 + 2);

        // Size-256 ring: desc 4096, avail ends at 4096 + 518 -> used at 8192.
        assert_eq!(vring_used_offset(256, 4096), 8192);
        assert_eq!(vring_size(256, 4096), 8192 + 4 + 2048 + 2);
    }
}
