//! Transport adaptation layer (spec.md §4.3 "Transport adaptations").
//!
//! Per spec.md §9 "function-pointer vtables... represent as a closed set of
//! variants where the variant list is known (virtio-PCI, virtio-MMIO)": the
//! driver matches on [`Transport`] rather than dispatching through a trait
//! object, since the set of transports this kernel speaks is fixed at
//! compile time by Cargo feature (`embodios-virtio-pci`,
//! `embodios-virtio-mmio`).

pub mod mmio;
pub mod pci;

pub const STATUS_ACKNOWLEDGE: u8 = 1;
pub const STATUS_DRIVER: u8 = 2;
pub const STATUS_DRIVER_OK: u8 = 4;
pub const STATUS_FEATURES_OK: u8 = 8;
pub const STATUS_FAILED: u8 = 128;

pub const BLK_F_RO: u64 = 1 << 5;
pub const BLK_F_BLK_SIZE: u64 = 1 << 6;
pub const BLK_F_FLUSH: u64 = 1 << 9;
pub const VERSION_1: u64 = 1 << 32; // VIRTIO_F_VERSION_1

pub enum Transport {
    #[cfg(feature = "embodios-virtio-pci")]
    Pci(pci::PciTransport),
    #[cfg(feature = "embodios-virtio-mmio")]
    Mmio(mmio::MmioTransport),
}

impl Transport {
    pub fn reset(&mut self) {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(t) => t.reset(),
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.reset(),
        }
    }

    pub fn set_status(&mut self, status: u8) {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(t) => t.set_status(status),
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.set_status(status),
        }
    }

    pub fn get_status(&self) -> u8 {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(t) => t.get_status(),
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.get_status(),
        }
    }

    pub fn device_features(&self) -> u64 {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(t) => t.device_features(),
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.device_features(),
        }
    }

    pub fn set_driver_features(&mut self, features: u64) {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(t) => t.set_driver_features(features),
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.set_driver_features(features),
        }
    }

    pub fn queue_max_size(&self, queue: u16) -> u16 {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(t) => t.queue_max_size(queue),
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.queue_max_size(queue),
        }
    }

    pub fn set_queue(&mut self, queue: u16, size: u16, desc: u64, avail: u64, used: u64) {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(t) => t.set_queue(queue, size, desc, avail, used),
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.set_queue(queue, size, desc, avail, used),
        }
    }

    pub fn notify(&mut self, queue: u16) {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(t) => t.notify(queue),
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.notify(queue),
        }
    }

    pub fn read_config_u64(&self, offset: u16) -> u64 {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(t) => t.read_config_u64(offset),
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.read_config_u64(offset),
        }
    }

    /// `true` for MMIO v2+ (separate 64-bit queue addresses); `false` for
    /// PCI legacy and MMIO v1 (PFN-based).
    pub fn uses_split_addresses(&self) -> bool {
        match self {
            #[cfg(feature = "embodios-virtio-pci")]
            Transport::Pci(_) => false,
            #[cfg(feature = "embodios-virtio-mmio")]
            Transport::Mmio(t) => t.is_modern(),
        }
    }
}
