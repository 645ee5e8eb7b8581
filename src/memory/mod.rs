//! Two-tier memory subsystem (spec.md §4.2): a page-granular physical
//! allocator feeding a coalescing heap, plus the DMA facade virtio sits on
//! top of. Brought up in that order — `phys` has no dependency on the heap,
//! `heap` depends on `phys` for its backing pages, `dma` depends on `phys`
//! directly (coherent allocations are whole pages, not heap objects).

pub mod dma;
pub mod heap;
pub mod layout;
pub mod phys;

pub use phys::PhysRegion;

/// Brings the subsystem up given the usable RAM ranges reported at boot and
/// the base physical address those ranges are expressed relative to.
pub fn init(base: u64, regions: &[PhysRegion]) {
    phys::init(base, regions);
    let ram_bytes = phys::total_bytes();
    heap::init(ram_bytes).expect("heap backing allocation failed");
    if let Some(logger) = crate::log::logger::try_get_logger() {
        logger.log("[MEM] physical allocator + heap online");
    }
}
