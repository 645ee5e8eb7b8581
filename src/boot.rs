//! Freestanding entry point and boot sequence (spec.md §2 "Leaves-first
//! dependency order: Scheduler → Memory → DMA → Virtio → Block → Weight
//! Store → Inference") plus the boot-parameter parser (spec.md §6 "Boot
//! parameter surface").
//!
//! Bootloader handoff itself — multiboot, UEFI, or a raw BIOS stage — is an
//! external collaborator (spec.md §1 Non-goals); what lives here is the
//! stack trampoline into `kernel_main` and the staged bring-up of every
//! subsystem this crate does own.

#[cfg(not(test))]
use alloc::vec::Vec;

#[cfg(not(test))]
use crate::arch::x86_64 as arch;
#[cfg(not(test))]
use crate::block::BlockClient;
#[cfg(not(test))]
use crate::fixed::simd;
#[cfg(not(test))]
use crate::fixed::transformer::{KvCache, Model, TransformerConfig};
#[cfg(not(test))]
use crate::memory::{self, PhysRegion};
#[cfg(not(test))]
use crate::virtio::transport::Transport;
#[cfg(not(test))]
use crate::virtio::VirtioBlock;
#[cfg(not(test))]
use crate::{log, sched, weights};

const BOOT_STACK_SIZE: usize = 0x4000;

/// Gated on `cfg(not(test))`: under `cargo test` this crate is linked into a
/// host test binary whose C runtime already owns the `_start` symbol, so
/// this freestanding entry point only exists in the real no_std build.
#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn _start() -> ! {
    static mut BOOT_STACK: [u8; BOOT_STACK_SIZE] = [0; BOOT_STACK_SIZE];
    let stack_top = core::ptr::addr_of!(BOOT_STACK[BOOT_STACK_SIZE - 1]) as *const u8;

    core::arch::asm!(
        "mov rsp, {0}",
        "mov rbp, rsp",
        "call {1}",
        in(reg) stack_top,
        sym kernel_main,
        options(noreturn),
    );
}

#[cfg(not(test))]
#[no_mangle]
unsafe extern "C" fn kernel_main() -> ! {
    arch::vga::clear();
    arch::vga::print("[BOOT] EMBODIOS kernel\n");

    log::init_logger();
    log::log_info("[BOOT] logger online");

    arch::init();
    log::log_info("[BOOT] gdt/idt online");

    // The usable-RAM map belongs to whatever boot protocol handed control
    // here (spec.md §1 Non-goals). A bring-up environment that boots this
    // image directly (e.g. QEMU `-m 256M`, kernel loaded at 1 MiB) satisfies
    // this single region; a real bootloader integration would replace it
    // with the map it passes in.
    let regions = [PhysRegion {
        start: 0x0010_0000,
        len: 0x0F00_0000,
    }];
    memory::init(0, &regions);

    sched::init();
    log::log_info("[BOOT] scheduler online");

    let params = parse_boot_params("embodios.model=default");
    if params.verbose {
        log::log_info("[BOOT] verbose boot requested");
    }

    bring_up_model(&params);

    loop {
        core::arch::asm!("sti; hlt", options(nomem, nostack));
    }
}

/// Parsed contents of the boot-parameter string (spec.md §6): a single
/// space-separated line recognizing `embodios.model=<name>` and
/// `embodios.verbose`. Unknown keys are ignored, not rejected.
pub struct BootParams {
    pub model_name: Option<heapless::String<64>>,
    pub verbose: bool,
}

pub fn parse_boot_params(cmdline: &str) -> BootParams {
    let mut params = BootParams {
        model_name: None,
        verbose: false,
    };
    for token in cmdline.split_whitespace() {
        if let Some(name) = token.strip_prefix("embodios.model=") {
            params.model_name = heapless::String::try_from(name).ok();
        } else if token == "embodios.verbose" {
            params.verbose = true;
        }
        // everything else: ignored per spec.md §6.
    }
    params
}

/// Topology a model file's tensors are interpreted against. Spec.md §4.4
/// describes tensor *shapes* in the descriptor table but no metadata format
/// this kernel maps to a [`TransformerConfig`] yet; a fixed placeholder
/// stands in until a model-packaging convention supplies one (see
/// DESIGN.md's open question on this).
#[cfg(not(test))]
const PLACEHOLDER_CONFIG: TransformerConfig = TransformerConfig {
    vocab_size: 32_000,
    hidden_size: 256,
    n_layers: 4,
    n_heads: 8,
    head_dim: 32,
    ffn_hidden: 688,
};

/// Caps how much of the block device gets pulled into the heap for a model
/// image (spec.md §4.2 Non-goals: no virtual memory, so a model has to fit
/// inside the heap outright).
#[cfg(not(test))]
const MAX_MODEL_BYTES: usize = 64 * 1024 * 1024;

#[cfg(not(test))]
fn probe_transport() -> Option<Transport> {
    #[cfg(feature = "embodios-virtio-mmio")]
    {
        use crate::virtio::transport::mmio::MmioTransport;
        // Matches QEMU's `virt`/`microvm` machine MMIO window; discovering
        // this address from a device tree or ACPI table is out of scope
        // (spec.md §1 Non-goals: "bus enumeration").
        const QEMU_VIRT_MMIO_BASE: usize = 0xfeb0_0000;
        let magic = unsafe { core::ptr::read_volatile(QEMU_VIRT_MMIO_BASE as *const u32) };
        if magic == 0x7472_6976 {
            return Some(Transport::Mmio(MmioTransport::new(QEMU_VIRT_MMIO_BASE)));
        }
    }
    #[cfg(feature = "embodios-virtio-pci")]
    {
        use crate::virtio::transport::pci::PciTransport;
        // PCI bus/BAR discovery is out of scope (spec.md §1 Non-goals); this
        // is the legacy I/O base QEMU's `pc`/`q35` machines assign the first
        // virtio-blk device at under default BIOS enumeration.
        const LEGACY_IO_BASE: u16 = 0xc000;
        return Some(Transport::Pci(PciTransport::new(LEGACY_IO_BASE)));
    }
    #[allow(unreachable_code)]
    None
}

/// Brings up the virtio-block device, reads a model image off it, and loads
/// it into the Q16.16 inference engine (spec.md §2's dependency chain:
/// Virtio → Block → Weight Store → Inference).
#[cfg(not(test))]
fn bring_up_model(params: &BootParams) {
    let Some(transport) = probe_transport() else {
        log::log_warn("[BOOT] no virtio block transport compiled in, skipping model load");
        return;
    };

    let device = match VirtioBlock::init(transport) {
        Ok(d) => d,
        Err(_) => {
            log::log_err("[BOOT] virtio-block initialization failed");
            return;
        }
    };
    log::log_info("[BOOT] virtio-block online");

    let mut client = BlockClient::new(device);
    let model_name = params.model_name.as_deref().unwrap_or("default");
    let _ = model_name; // selecting among multiple on-disk images is external to this crate.

    let len = (client.capacity_bytes() as usize).min(MAX_MODEL_BYTES);
    let mut image_bytes: Vec<u8> = Vec::new();
    if image_bytes.try_reserve_exact(len).is_err() {
        log::log_err("[BOOT] out of memory reading model image");
        return;
    }
    image_bytes.resize(len, 0);
    if client.read_bytes(0, &mut image_bytes).is_err() {
        log::log_err("[BOOT] failed reading model image off block device");
        return;
    }

    let image = match weights::load(&image_bytes) {
        Ok(img) => img,
        Err(_) => {
            log::log_err("[BOOT] model image failed validation");
            return;
        }
    };
    log::log_info("[BOOT] model image validated");

    let model = match Model::load(&image, PLACEHOLDER_CONFIG) {
        Ok(m) => m,
        Err(_) => {
            log::log_err("[BOOT] model tensor load failed");
            return;
        }
    };
    log::log_info("[BOOT] model loaded, ready for inference");

    let backend = simd::detect();
    let mut cache = KvCache::new(PLACEHOLDER_CONFIG.n_layers);
    if crate::fixed::transformer::step(&backend, &model, &mut cache, 0).is_ok() {
        log::log_info("[BOOT] first inference step completed");
    } else {
        log::log_err("[BOOT] first inference step failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_model_and_verbose_keys() {
        let params = parse_boot_params("embodios.model=tinyllama embodios.verbose");
        assert_eq!(params.model_name.as_deref(), Some("tinyllama"));
        assert!(params.verbose);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let params = parse_boot_params("foo.bar=baz embodios.verbose quux");
        assert!(params.verbose);
        assert_eq!(params.model_name, None);
    }

    #[test]
    fn empty_cmdline_yields_defaults() {
        let params = parse_boot_params("");
        assert_eq!(params.model_name, None);
        assert!(!params.verbose);
    }
}
