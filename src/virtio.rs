//! # VirtIO transport + split-queue virtqueue engine
//!
//! A paravirtualised NIC's control surface: device bring-up per the
//! modern (1.x) status/feature negotiation sequence, and the split-ring
//! virtqueue that carries every packet in and out. The transport itself
//! (how `common cfg` / `notify` / `ISR` / `device cfg` registers are
//! discovered — PCI capabilities, or a flattened-device-tree MMIO window)
//! is an external collaborator: this module only needs a mapped register
//! window handed to it by [`VirtioTransport`].

use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::collab::Allocator;
use crate::error::{NetError, Reason};
use crate::ethernet::MacAddress;

pub mod status {
    pub const RESET: u8 = 0;
    pub const ACKNOWLEDGE: u8 = 1;
    pub const DRIVER: u8 = 2;
    pub const DRIVER_OK: u8 = 4;
    pub const FEATURES_OK: u8 = 8;
    pub const DEVICE_NEEDS_RESET: u8 = 64;
    pub const FAILED: u8 = 128;
}

pub mod features {
    /// VirtIO-net: device has a MAC address.
    pub const NET_F_MAC: u64 = 1 << 5;
    /// VirtIO-net: device reports its MTU.
    pub const NET_F_MTU: u64 = 1 << 3;
    /// Transitional-vs-modern negotiation: device understands virtio 1.0.
    pub const VERSION_1: u64 = 1 << 32;
}

pub mod descriptor_flags {
    pub const NEXT: u16 = 1;
    pub const WRITE: u16 = 2;
}

/// Register-level access to one VirtIO device's common configuration,
/// notify region, ISR status, and device-specific configuration space.
/// Implemented by whichever bus-enumeration code (PCI, MMIO-over-FDT)
/// mapped the device; the core never assumes which.
pub trait VirtioTransport: Send + Sync {
    fn reset(&self);
    fn set_status(&self, status: u8);
    fn read_status(&self) -> u8;
    fn read_device_features(&self) -> u64;
    fn write_driver_features(&self, features: u64);
    /// Selects queue `idx` and returns its device-reported size (0 = absent).
    fn queue_size(&self, idx: u16) -> u16;
    /// Publishes the physical addresses of a queue's three regions and
    /// enables it.
    fn set_queue_addrs(&self, idx: u16, desc_phys: u64, avail_phys: u64, used_phys: u64);
    fn queue_enable(&self, idx: u16);
    /// Address written to notify the device that queue `idx` has new work.
    fn notify_addr(&self, idx: u16) -> *mut u8;
    /// Device-specific configuration space (MAC, MTU, ...), read as raw bytes.
    fn read_device_config(&self, offset: usize, buf: &mut [u8]);
}

#[repr(C)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct VirtqAvailHeader {
    flags: u16,
    idx: u16,
}

#[repr(C)]
struct VirtqUsedHeader {
    flags: u16,
    idx: u16,
}

#[repr(C)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

/// A single buffer handed into [`Virtqueue::add_bufs`].
pub struct Buf {
    pub addr: u64,
    pub len: u32,
    /// True when the device writes into this buffer (an RX descriptor).
    pub device_writable: bool,
}

/// Split-ring virtqueue: descriptor table, available ring, used ring, all
/// inside one physically-contiguous, page-aligned allocation.
pub struct Virtqueue {
    size: u16,
    region: *mut u8,
    region_phys: u64,
    desc_table: *mut VirtqDesc,
    avail: *mut u8,
    used: *mut u8,
    desc_phys: u64,
    avail_phys: u64,
    used_phys: u64,
    free_head: u16,
    free_count: u16,
    last_used: u16,
    /// Buffers currently posted to the device, indexed by descriptor id,
    /// so `get_used` can hand ownership back to the caller.
    pending: Vec<Option<Vec<u8>>>,
}

const AVAIL_HEADER_SIZE: usize = core::mem::size_of::<VirtqAvailHeader>();
const USED_HEADER_SIZE: usize = core::mem::size_of::<VirtqUsedHeader>();

fn page_align(n: usize) -> usize {
    (n + 4095) & !4095
}

impl Virtqueue {
    /// Allocates and lays out a queue of `size` descriptors (must be a
    /// power of two in a real device; we accept any positive size).
    pub fn setup(size: u16, allocator: &dyn Allocator) -> Result<Self, NetError> {
        let n = size as usize;
        let desc_table_size = n * core::mem::size_of::<VirtqDesc>();
        let avail_size = AVAIL_HEADER_SIZE + n * 2 + 2; // + used_event
        let used_size = USED_HEADER_SIZE + n * core::mem::size_of::<VirtqUsedElem>() + 2;

        let desc_off = 0;
        let avail_off = desc_table_size;
        let used_off = page_align(avail_off + avail_size);
        let total = page_align(used_off + used_size);
        let pages = total / 4096;

        let (region, region_phys) = allocator
            .alloc_contig_pages(pages.max(1))
            .ok_or(NetError::Resource(Reason::NoBuffer))?;

        unsafe {
            ptr::write_bytes(region, 0, total);
        }

        let desc_table = unsafe { region.add(desc_off) as *mut VirtqDesc };
        let avail = unsafe { region.add(avail_off) };
        let used = unsafe { region.add(used_off) };

        // Build the free-descriptor singly-linked chain through `next`.
        for i in 0..n {
            unsafe {
                (*desc_table.add(i)).next = if i + 1 < n { (i + 1) as u16 } else { 0 };
            }
        }

        let mut pending = Vec::with_capacity(n);
        pending.resize_with(n, || None);

        Ok(Self {
            size,
            region,
            region_phys,
            desc_table,
            avail,
            used,
            desc_phys: region_phys + desc_off as u64,
            avail_phys: region_phys + avail_off as u64,
            used_phys: region_phys + used_off as u64,
            free_head: 0,
            free_count: size,
            last_used: 0,
            pending,
        })
    }

    pub fn desc_phys(&self) -> u64 {
        self.desc_phys
    }
    pub fn avail_phys(&self) -> u64 {
        self.avail_phys
    }
    pub fn used_phys(&self) -> u64 {
        self.used_phys
    }

    fn avail_header(&self) -> *mut VirtqAvailHeader {
        self.avail as *mut VirtqAvailHeader
    }
    fn avail_ring(&self) -> *mut u16 {
        unsafe { self.avail.add(AVAIL_HEADER_SIZE) as *mut u16 }
    }
    fn used_header(&self) -> *mut VirtqUsedHeader {
        self.used as *mut VirtqUsedHeader
    }
    fn used_ring(&self) -> *mut VirtqUsedElem {
        unsafe { self.used.add(USED_HEADER_SIZE) as *mut VirtqUsedElem }
    }

    /// Posts a chain of `k` buffers as one descriptor chain; fails with
    /// `Resource` if fewer than `k` descriptors are free.
    pub fn add_bufs(&mut self, bufs: &[Buf], owned: Vec<u8>) -> Result<u16, NetError> {
        let k = bufs.len();
        if k == 0 || k as u16 > self.free_count {
            return Err(NetError::Resource(Reason::NoBuffer));
        }

        let head = self.free_head;
        let mut cur = head;
        for (i, b) in bufs.iter().enumerate() {
            let mut flags = 0u16;
            if b.device_writable {
                flags |= descriptor_flags::WRITE;
            }
            let is_last = i + 1 == k;
            if !is_last {
                flags |= descriptor_flags::NEXT;
            }
            let next_cur = unsafe { (*self.desc_table.add(cur as usize)).next };
            unsafe {
                let d = self.desc_table.add(cur as usize);
                (*d).addr = b.addr;
                (*d).len = b.len;
                (*d).flags = flags;
                if is_last {
                    // restore the chain: free_head becomes whatever followed
                    // the last descriptor we consumed.
                    self.free_head = next_cur;
                } else {
                    (*d).next = next_cur;
                }
            }
            if !is_last {
                cur = next_cur;
            }
        }
        self.free_count -= k as u16;
        self.pending[head as usize] = Some(owned);

        let n = self.size;
        let avail_idx = unsafe { ptr::read_volatile(&(*self.avail_header()).idx) };
        unsafe {
            ptr::write_volatile(self.avail_ring().add((avail_idx % n) as usize), head);
        }
        fence(Ordering::SeqCst);
        unsafe {
            ptr::write_volatile(&mut (*self.avail_header()).idx, avail_idx.wrapping_add(1));
        }

        Ok(head)
    }

    /// Emits a store barrier, then writes to the device's notify address
    /// for this queue.
    pub fn kick(&self, notify_addr: *mut u8, queue_idx: u16) {
        fence(Ordering::SeqCst);
        unsafe {
            ptr::write_volatile(notify_addr as *mut u16, queue_idx);
        }
    }

    pub fn has_used(&self) -> bool {
        let idx = unsafe { ptr::read_volatile(&(*self.used_header()).idx) };
        idx != self.last_used
    }

    /// Pops the oldest used entry, returning the descriptor chain to the
    /// free list and handing back the buffer that was posted with it,
    /// along with the byte count the device actually wrote.
    pub fn get_used(&mut self) -> Result<(Vec<u8>, u32), NetError> {
        if !self.has_used() {
            return Err(NetError::Resource(Reason::NoBuffer));
        }
        let n = self.size;
        let slot = (self.last_used % n) as usize;
        let elem = unsafe { ptr::read_volatile(self.used_ring().add(slot)) };
        self.last_used = self.last_used.wrapping_add(1);

        if elem.id >= n as u32 {
            return Err(NetError::BadPacket(Reason::InvalidUsedId));
        }

        // Walk the chain, returning every descriptor to the free list.
        let mut id = elem.id as u16;
        let mut count = 0u16;
        loop {
            count += 1;
            let flags = unsafe { (*self.desc_table.add(id as usize)).flags };
            unsafe {
                (*self.desc_table.add(id as usize)).flags = 0;
            }
            if flags & descriptor_flags::NEXT != 0 {
                id = unsafe { (*self.desc_table.add(id as usize)).next };
            } else {
                unsafe {
                    (*self.desc_table.add(id as usize)).next = self.free_head;
                }
                self.free_head = elem.id as u16;
                break;
            }
        }
        self.free_count += count;

        let buf = self.pending[elem.id as usize].take().unwrap_or_default();
        Ok((buf, elem.len))
    }

    pub fn free_count(&self) -> u16 {
        self.free_count
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn region_phys(&self) -> u64 {
        self.region_phys
    }
}

unsafe impl Send for Virtqueue {}

/// Queue index conventions for virtio-net: RX is queue 0, TX is queue 1.
pub const RX_QUEUE: u16 = 0;
pub const TX_QUEUE: u16 = 1;

/// The 10-byte virtio-net header that precedes every frame on the wire
/// between driver and device (no offload is negotiated, so every field
/// but `num_buffers` stays zero).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtioNetHeader {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub checksum_start: u16,
    pub checksum_offset: u16,
    pub num_buffers: u16,
}

impl VirtioNetHeader {
    pub const SIZE: usize = 10;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.flags;
        out[1] = self.gso_type;
        out[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        out[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        out[6..8].copy_from_slice(&self.checksum_start.to_le_bytes());
        out[8..10].copy_from_slice(&self.checksum_offset.to_le_bytes());
        out
    }
}

/// A bound, negotiated virtio-net device: one RX and one TX virtqueue.
pub struct VirtioNetDevice {
    pub mac: MacAddress,
    pub rx: spin::Mutex<Virtqueue>,
    pub tx: spin::Mutex<Virtqueue>,
}

impl VirtioNetDevice {
    /// Runs the modern bring-up sequence (§4.2) against `transport` and
    /// returns a device with its RX/TX queues posted and enabled.
    pub fn bring_up(transport: &dyn VirtioTransport, allocator: &dyn Allocator, queue_size: u16) -> Result<Self, NetError> {
        transport.set_status(status::RESET);
        let _ = transport.read_status();

        transport.set_status(status::ACKNOWLEDGE);
        transport.set_status(status::ACKNOWLEDGE | status::DRIVER);

        let device_features = transport.read_device_features();
        let mut driver_features = device_features & (features::NET_F_MAC | features::NET_F_MTU);
        if device_features & features::VERSION_1 != 0 {
            driver_features |= features::VERSION_1;
        }
        transport.write_driver_features(driver_features);

        if driver_features & features::VERSION_1 != 0 {
            transport.set_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK);
            let confirmed = transport.read_status();
            if confirmed & status::FEATURES_OK == 0 {
                transport.set_status(status::FAILED);
                return Err(NetError::Protocol(Reason::FeaturesRejected));
            }
        }

        let rx_size = transport.queue_size(RX_QUEUE).min(queue_size).max(1);
        let tx_size = transport.queue_size(TX_QUEUE).min(queue_size).max(1);

        let rx = Virtqueue::setup(rx_size, allocator)?;
        transport.set_queue_addrs(RX_QUEUE, rx.desc_phys(), rx.avail_phys(), rx.used_phys());
        transport.queue_enable(RX_QUEUE);

        let tx = Virtqueue::setup(tx_size, allocator)?;
        transport.set_queue_addrs(TX_QUEUE, tx.desc_phys(), tx.avail_phys(), tx.used_phys());
        transport.queue_enable(TX_QUEUE);

        let mut mac = [0u8; 6];
        transport.read_device_config(0, &mut mac);

        transport.set_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK);

        Ok(Self {
            mac: MacAddress::new(mac),
            rx: spin::Mutex::new(rx),
            tx: spin::Mutex::new(tx),
        })
    }

    /// Posts `frame` (a complete Ethernet frame, header already prepended
    /// separately as the virtio-net header) for transmission and kicks
    /// the TX queue.
    pub fn transmit(&self, frame: Vec<u8>, notify_addr: *mut u8) -> Result<(), NetError> {
        let mut header = VirtioNetHeader::default().to_bytes().to_vec();
        header.extend_from_slice(&frame);
        let len = header.len() as u32;
        let addr = header.as_ptr() as u64;
        let mut tx = self.tx.lock();
        let bufs = [Buf { addr, len, device_writable: false }];
        let head = tx.add_bufs(&bufs, header)?;
        tx.kick(notify_addr, TX_QUEUE);
        let _ = head;
        Ok(())
    }

    /// Drains completed TX descriptors (their backing buffers can be
    /// dropped once the device is done with them).
    pub fn reclaim_tx(&self) {
        let mut tx = self.tx.lock();
        while tx.has_used() {
            if tx.get_used().is_err() {
                break;
            }
        }
    }

    /// Pulls one received Ethernet frame (virtio-net header stripped), if
    /// the device has completed a buffer.
    pub fn poll_rx(&self) -> Option<Vec<u8>> {
        let mut rx = self.rx.lock();
        if !rx.has_used() {
            return None;
        }
        let (buf, len) = rx.get_used().ok()?;
        let len = len as usize;
        if len <= VirtioNetHeader::SIZE || len > buf.len() {
            return None;
        }
        Some(buf[VirtioNetHeader::SIZE..len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestAllocator;

    impl Allocator for TestAllocator {
        fn alloc(&self, nbytes: usize, _tag: &'static str) -> *mut u8 {
            let layout = alloc::alloc::Layout::from_size_align(nbytes, 8).unwrap();
            unsafe { alloc::alloc::alloc_zeroed(layout) }
        }
        unsafe fn free(&self, _ptr: *mut u8) {}
        fn alloc_map_pages(&self, n: usize, out_phys: &mut u64) -> *mut u8 {
            let (v, p) = self.alloc_contig_pages(n).unwrap();
            *out_phys = p;
            v
        }
        fn alloc_contig_pages(&self, n: usize) -> Option<(*mut u8, u64)> {
            let layout = alloc::alloc::Layout::from_size_align(n * 4096, 4096).ok()?;
            let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                return None;
            }
            Some((ptr, ptr as u64))
        }
    }

    #[test]
    fn free_list_conserves_descriptor_count() {
        let allocator = TestAllocator;
        let mut vq = Virtqueue::setup(8, &allocator).unwrap();
        assert_eq!(vq.free_count(), 8);

        let bufs = [Buf { addr: 0x1000, len: 64, device_writable: false }];
        let head = vq.add_bufs(&bufs, Vec::new()).unwrap();
        assert_eq!(vq.free_count(), 7);

        // Simulate the device consuming the descriptor.
        unsafe {
            let used_header = vq.used as *mut VirtqUsedHeader;
            let used_ring = vq.used.add(USED_HEADER_SIZE) as *mut VirtqUsedElem;
            *used_ring.add(0) = VirtqUsedElem { id: head as u32, len: 64 };
            (*used_header).idx = 1;
        }

        assert!(vq.has_used());
        let (_buf, len) = vq.get_used().unwrap();
        assert_eq!(len, 64);
        assert_eq!(vq.free_count(), 8);
    }
}
