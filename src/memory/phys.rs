//! Physical page-frame allocator (spec.md §4.2 "Physical allocator").
//!
//! Grain is a 4 KiB page. Ownership is flat: a bitmap with one bit per
//! frame, backed by static storage so it can be brought up before the
//! kernel heap exists (the heap is itself backed by pages from here).
//! A free-frame cursor gives allocation an amortized fast path; a full
//! bitmap scan is only the fallback once the cursor region fills up.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use super::layout::PAGE_SIZE;

/// Frames tracked: enough for 4 GiB of physical memory at 4 KiB pages.
/// Real hardware with more RAM simply leaves the tail of the bitmap
/// permanently marked used until a larger backing is wired up.
const MAX_FRAMES: usize = 1 << 20;
const WORDS: usize = MAX_FRAMES / 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame(pub u64);

impl Frame {
    pub fn addr(&self) -> u64 {
        self.0
    }
}

pub struct PhysRegion {
    pub start: u64,
    pub len: u64,
}

struct Bitmap {
    words: [AtomicU64; WORDS],
}

static BITMAP: Bitmap = Bitmap {
    words: [const { AtomicU64::new(u64::MAX) }; WORDS],
};

static BASE: AtomicU64 = AtomicU64::new(0);
static TOTAL_FRAMES: AtomicUsize = AtomicUsize::new(0);
static FREE_FRAMES: AtomicUsize = AtomicUsize::new(0);
static CURSOR: AtomicUsize = AtomicUsize::new(0);
static SCAN_LOCK: Mutex<()> = Mutex::new(());

fn bit_set(idx: usize) -> bool {
    let word = idx / 64;
    let bit = idx % 64;
    BITMAP.words[word].fetch_or(1 << bit, Ordering::AcqRel) & (1 << bit) != 0
}

fn bit_clear(idx: usize) -> bool {
    let word = idx / 64;
    let bit = idx % 64;
    BITMAP.words[word].fetch_and(!(1 << bit), Ordering::AcqRel) & (1 << bit) != 0
}

fn bit_test(idx: usize) -> bool {
    let word = idx / 64;
    let bit = idx % 64;
    BITMAP.words[word].load(Ordering::Acquire) & (1 << bit) != 0
}

/// Marks `regions` (physical address ranges reported usable by the
/// bootloader) free for allocation; everything else stays marked used.
/// `base` is the physical address frame 0 of the bitmap represents.
pub fn init(base: u64, regions: &[PhysRegion]) {
    BASE.store(base, Ordering::SeqCst);
    let mut total = 0usize;
    for r in regions {
        let start_frame = ((r.start.saturating_sub(base)) / PAGE_SIZE as u64) as usize;
        let nframes = (r.len / PAGE_SIZE as u64) as usize;
        for i in 0..nframes {
            let idx = start_frame + i;
            if idx >= MAX_FRAMES {
                break;
            }
            bit_clear(idx);
            total += 1;
        }
    }
    TOTAL_FRAMES.store(total, Ordering::SeqCst);
    FREE_FRAMES.store(total, Ordering::SeqCst);
}

fn idx_to_addr(idx: usize) -> u64 {
    BASE.load(Ordering::Relaxed) + (idx as u64) * PAGE_SIZE as u64
}

/// Allocate a single page. Returns `None` (the NULL of spec.md) on
/// exhaustion.
pub fn alloc() -> Option<Frame> {
    let start = CURSOR.load(Ordering::Relaxed);
    for probe in 0..MAX_FRAMES {
        let idx = (start + probe) % MAX_FRAMES;
        if !bit_test(idx) && !bit_set(idx) {
            CURSOR.store((idx + 1) % MAX_FRAMES, Ordering::Relaxed);
            FREE_FRAMES.fetch_sub(1, Ordering::Relaxed);
            return Some(Frame(idx_to_addr(idx)));
        }
    }
    None
}

/// Allocate `n` physically-contiguous pages (needed by the heap's initial
/// backing and by virtqueue/DMA callers that require one contiguous span).
pub fn alloc_contig(n: usize) -> Option<Frame> {
    if n == 0 {
        return None;
    }
    if n == 1 {
        return alloc();
    }
    let _guard = SCAN_LOCK.lock();
    let mut run_start = 0usize;
    let mut run_len = 0usize;
    for idx in 0..MAX_FRAMES {
        if !bit_test(idx) {
            if run_len == 0 {
                run_start = idx;
            }
            run_len += 1;
            if run_len == n {
                for i in run_start..run_start + n {
                    bit_set(i);
                }
                FREE_FRAMES.fetch_sub(n, Ordering::Relaxed);
                return Some(Frame(idx_to_addr(run_start)));
            }
        } else {
            run_len = 0;
        }
    }
    None
}

/// Free one page previously returned by `alloc`/`alloc_contig`.
pub fn free(frame: Frame) {
    let base = BASE.load(Ordering::Relaxed);
    if frame.0 < base {
        return;
    }
    let idx = ((frame.0 - base) / PAGE_SIZE as u64) as usize;
    if idx >= MAX_FRAMES {
        return;
    }
    if bit_clear(idx) {
        FREE_FRAMES.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn free_contig(frame: Frame, n: usize) {
    let base = BASE.load(Ordering::Relaxed);
    let idx = ((frame.0.saturating_sub(base)) / PAGE_SIZE as u64) as usize;
    for i in idx..(idx + n).min(MAX_FRAMES) {
        if bit_clear(i) {
            FREE_FRAMES.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub fn bytes_available() -> u64 {
    FREE_FRAMES.load(Ordering::Relaxed) as u64 * PAGE_SIZE as u64
}

pub fn total_bytes() -> u64 {
    TOTAL_FRAMES.load(Ordering::Relaxed) as u64 * PAGE_SIZE as u64
}

/// Serializes every test, in this module or elsewhere in the crate (see
/// `sched::mod::tests`), that touches the allocator's shared global
/// bitmap. Without this, two tests reaching `init`/`alloc` concurrently on
/// different threads (the default test runner) can interleave and corrupt
/// each other's frame counts.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        for w in BITMAP.words.iter() {
            w.store(u64::MAX, Ordering::SeqCst);
        }
        BASE.store(0, Ordering::SeqCst);
        TOTAL_FRAMES.store(0, Ordering::SeqCst);
        FREE_FRAMES.store(0, Ordering::SeqCst);
        CURSOR.store(0, Ordering::SeqCst);
    }

    #[test]
    fn alloc_then_exhaust() {
        let _guard = TEST_LOCK.lock();
        reset();
        init(0, &[PhysRegion { start: 0, len: (PAGE_SIZE * 2) as u64 }]);
        assert_eq!(bytes_available(), (PAGE_SIZE * 2) as u64);
        let a = alloc().unwrap();
        let b = alloc().unwrap();
        assert_ne!(a, b);
        assert!(alloc().is_none());
        free(a);
        assert_eq!(bytes_available(), PAGE_SIZE as u64);
        assert!(alloc().is_some());
    }

    #[test]
    fn contig_allocation() {
        let _guard = TEST_LOCK.lock();
        reset();
        init(0, &[PhysRegion { start: 0, len: (PAGE_SIZE * 8) as u64 }]);
        let f = alloc_contig(4).unwrap();
        assert_eq!(f.0 % (PAGE_SIZE as u64), 0);
        assert_eq!(bytes_available(), (PAGE_SIZE * 4) as u64);
        free_contig(f, 4);
        assert_eq!(bytes_available(), (PAGE_SIZE * 8) as u64);
    }
}
