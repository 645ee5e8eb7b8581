//! Split virtqueue (spec.md §3 "Virtqueue", §4.3 "Both transports share the
//! virtqueue data structures"). Layout is the standard split-ring: a single
//! page-aligned coherent block holding the descriptor table and available
//! ring back to back, padded out to the next page boundary, then the used
//! ring. `N` must be a power of two (the ring index wraps by masking, not
//! modulo).

use snafu::Snafu;

use crate::memory::dma::{self, CoherentAlloc};
use crate::memory::layout::{align_up, PAGE_SIZE};

pub const DESC_F_NEXT: u16 = 1;
pub const DESC_F_WRITE: u16 = 2;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

#[repr(C)]
struct AvailHeader {
    flags: u16,
    idx: u16,
}

#[repr(C)]
struct UsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct UsedHeader {
    flags: u16,
    idx: u16,
}

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("virtqueue descriptor pool exhausted ({need} needed, {free} free)"))]
    DescExhausted { need: usize, free: usize },
    #[snafu(display("queue size {size} is not a power of two"))]
    BadSize { size: usize },
    #[snafu(display("no memory for virtqueue backing"))]
    NoMemory,
}

pub struct VirtQueue {
    alloc: CoherentAlloc,
    size: u16,
    desc: *mut Desc,
    avail_hdr: *mut AvailHeader,
    avail_ring: *mut u16,
    used_hdr: *mut UsedHeader,
    used_ring: *mut UsedElem,
    free_head: Option<u16>,
    free_count: u16,
    last_used_idx: u16,
    avail_idx_shadow: u16,
    pub queue_index: u16,
}

unsafe impl Send for VirtQueue {}

fn layout_offsets(size: u16) -> (usize, usize, usize) {
    let n = size as usize;
    let desc_bytes = n * core::mem::size_of::<Desc>();
    let avail_bytes = 4 + 2 * n; // flags+idx, then ring of u16 (no used_event)
    let avail_off = desc_bytes;
    let used_off = align_up(avail_off + avail_bytes, PAGE_SIZE);
    (desc_bytes, avail_off, used_off)
}

fn total_size(size: u16) -> usize {
    let (_, _, used_off) = layout_offsets(size);
    let used_bytes = 4 + size as usize * core::mem::size_of::<UsedElem>();
    align_up(used_off + used_bytes, PAGE_SIZE)
}

impl VirtQueue {
    /// Allocates the backing pages and threads the initial free list
    /// (spec.md §4.3 init sequence's "allocate the contiguous virtqueue
    /// block").
    pub fn new(queue_index: u16, size: u16) -> Result<Self, QueueError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(QueueError::BadSize { size: size as usize });
        }
        let bytes = total_size(size);
        let alloc = dma::alloc_coherent(bytes).map_err(|_| QueueError::NoMemory)?;
        let (_, avail_off, used_off) = layout_offsets(size);

        let base = alloc.virt;
        let desc = base as *mut Desc;
        let avail_hdr = (base + avail_off) as *mut AvailHeader;
        let avail_ring = (base + avail_off + 4) as *mut u16;
        let used_hdr = (base + used_off) as *mut UsedHeader;
        let used_ring = (base + used_off + 4) as *mut UsedElem;

        unsafe {
            for i in 0..size {
                desc.add(i as usize).write(Desc {
                    addr: 0,
                    len: 0,
                    flags: 0,
                    next: if i + 1 < size { i + 1 } else { 0xffff },
                });
            }
            avail_hdr.write(AvailHeader { flags: 0, idx: 0 });
            used_hdr.write(UsedHeader { flags: 0, idx: 0 });
        }

        Ok(VirtQueue {
            alloc,
            size,
            desc,
            avail_hdr,
            avail_ring,
            used_hdr,
            used_ring,
            free_head: Some(0),
            free_count: size,
            last_used_idx: 0,
            avail_idx_shadow: 0,
            queue_index,
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn desc_table_addr(&self) -> u64 {
        dma::map_single(self.alloc.virt, self.alloc.size, crate::memory::dma::Direction::Bidirectional)
    }

    pub fn avail_addr(&self) -> u64 {
        self.desc_table_addr() + (self.size as u64) * core::mem::size_of::<Desc>() as u64
    }

    pub fn used_addr(&self) -> u64 {
        let (_, _, used_off) = layout_offsets(self.size);
        self.desc_table_addr() + used_off as u64
    }

    /// Allocates `n` chained descriptors (header/data/status), writing
    /// nothing into them beyond the `next` links threaded by the free list.
    /// Returns the descriptor indices in chain order.
    pub fn alloc_chain(&mut self, n: usize) -> Result<arrayvec::ArrayVec<u16, 8>, QueueError> {
        if self.free_count as usize < n {
            return Err(QueueError::DescExhausted {
                need: n,
                free: self.free_count as usize,
            });
        }
        let mut out = arrayvec::ArrayVec::new();
        for i in 0..n {
            let idx = self.free_head.expect("free_count tracked consistently");
            self.free_head = unsafe {
                let next = (*self.desc.add(idx as usize)).next;
                if next == 0xffff {
                    None
                } else {
                    Some(next)
                }
            };
            self.free_count -= 1;
            let is_last = i + 1 == n;
            unsafe {
                (*self.desc.add(idx as usize)).flags = if is_last { 0 } else { DESC_F_NEXT };
            }
            let _ = out.try_push(idx);
        }
        // Link the chain in order.
        for w in 0..out.len().saturating_sub(1) {
            let cur = out[w];
            let nxt = out[w + 1];
            unsafe {
                (*self.desc.add(cur as usize)).next = nxt;
                (*self.desc.add(cur as usize)).flags |= DESC_F_NEXT;
            }
        }
        Ok(out)
    }

    pub fn set_desc(&mut self, idx: u16, addr: u64, len: u32, write: bool) {
        unsafe {
            let d = &mut *self.desc.add(idx as usize);
            d.addr = addr;
            d.len = len;
            if write {
                d.flags |= DESC_F_WRITE;
            } else {
                d.flags &= !DESC_F_WRITE;
            }
        }
    }

    /// Returns every descriptor in the chain starting at `head` back to the
    /// free list (spec.md §8 property 3: "all three descriptors in the
    /// chain are back in the free-list").
    pub fn free_chain(&mut self, head: u16) {
        let mut cur = head;
        let mut count = 0u16;
        let tail = loop {
            count += 1;
            let (flags, next) = unsafe {
                let d = &*self.desc.add(cur as usize);
                (d.flags, d.next)
            };
            if flags & DESC_F_NEXT == 0 {
                break cur;
            }
            cur = next;
        };
        unsafe {
            (*self.desc.add(tail as usize)).next = self.free_head.unwrap_or(0xffff);
        }
        self.free_head = Some(head);
        self.free_count += count;
    }

    /// Publishes `head` into the available ring and bumps the available
    /// index, with the write barrier spec.md §4.3 calls for before
    /// notifying the device.
    pub fn publish_avail(&mut self, head: u16) {
        let slot = self.avail_idx_shadow % self.size;
        unsafe {
            self.avail_ring.add(slot as usize).write(head);
        }
        self.avail_idx_shadow = self.avail_idx_shadow.wrapping_add(1);
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        unsafe {
            (*self.avail_hdr).idx = self.avail_idx_shadow;
        }
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    /// Polls the used ring once. A read barrier precedes the index load, as
    /// spec.md §4.3 requires.
    pub fn poll_used(&mut self) -> Option<(u16, u32)> {
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
        let used_idx = unsafe { (*self.used_hdr).idx };
        if used_idx == self.last_used_idx {
            return None;
        }
        let slot = self.last_used_idx % self.size;
        let elem = unsafe { self.used_ring.add(slot as usize).read() };
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        Some((elem.id as u16, elem.len))
    }

    pub fn free_descriptors(&self) -> u16 {
        self.free_count
    }
}

impl Drop for VirtQueue {
    fn drop(&mut self) {
        dma::free_coherent(self.alloc);
    }
}
