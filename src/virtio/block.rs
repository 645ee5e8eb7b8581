//! virtio-block driver (spec.md §4.3): device init handshake, request
//! submission as a 3-descriptor chain (header, data, status), and polled
//! completion.

use snafu::Snafu;

use super::queue::VirtQueue;
use super::transport::{self, Transport};
use crate::memory::dma::{self, Direction};
use crate::memory::layout::PAGE_SIZE;

const QUEUE_INDEX: u16 = 0;
const QUEUE_SIZE: u16 = 128;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

const STATUS_OK: u8 = 0;
const STATUS_IOERR: u8 = 1;
const STATUS_UNSUPP: u8 = 2;

/// Completion polling gives up after this many spin iterations (spec.md
/// §4.3 "bounded by a ~1s timeout budget"); there is no timer dependency
/// inside the driver itself, so the budget is expressed as a loop count
/// calibrated against the legacy PIT tick in practice.
pub(crate) const POLL_SPIN_BUDGET: u32 = 50_000_000;

#[derive(Debug, Snafu)]
pub enum VirtioError {
    /// kind: FeatureNegotiationFailed
    #[snafu(display("device did not accept feature negotiation (status {status:#x})"))]
    FeatureNegotiationFailed { status: u8 },
    /// kind: DeviceError
    #[snafu(display("device set FAILED during init (status {status:#x})"))]
    DeviceFailed { status: u8 },
    /// kind: QueueFull
    #[snafu(display("virtqueue setup or descriptor allocation failed: {source}"))]
    QueueFull { source: super::queue::QueueError },
    /// kind: Timeout
    #[snafu(display("request timed out waiting for completion"))]
    Timeout,
    /// kind: DeviceError
    #[snafu(display("device reported I/O error"))]
    DeviceError,
    /// kind: Unsupported
    #[snafu(display("device does not support this request type"))]
    Unsupported,
    /// kind: AllocFailed (memory::DmaError)
    #[snafu(display("DMA mapping failed: {source}"))]
    Dma { source: dma::DmaError },
}

#[repr(C)]
struct ReqHeader {
    kind: u32,
    reserved: u32,
    sector: u64,
}

pub struct VirtioBlock {
    transport: Transport,
    queue: VirtQueue,
    capacity_sectors: u64,
    block_size: u32,
    read_only: bool,
}

impl VirtioBlock {
    pub const SECTOR_SIZE: u32 = 512;

    /// Runs the full negotiation sequence from spec.md §4.3: reset,
    /// ACKNOWLEDGE, DRIVER, feature negotiation, [FEATURES_OK for modern
    /// transports], queue 0 setup, DRIVER_OK, then reads capacity out of
    /// device config space.
    pub fn init(mut transport: Transport) -> Result<Self, VirtioError> {
        transport.reset();
        transport.set_status(transport::STATUS_ACKNOWLEDGE);
        transport.set_status(transport::STATUS_ACKNOWLEDGE | transport::STATUS_DRIVER);

        let device_features = transport.device_features();
        let modern = device_features & transport::VERSION_1 != 0;
        let mut wanted = device_features & (transport::BLK_F_RO | transport::BLK_F_BLK_SIZE | transport::BLK_F_FLUSH);
        if modern {
            wanted |= transport::VERSION_1;
        }
        transport.set_driver_features(wanted);

        if modern {
            transport.set_status(
                transport::STATUS_ACKNOWLEDGE | transport::STATUS_DRIVER | transport::STATUS_FEATURES_OK,
            );
            let status = transport.get_status();
            if status & transport::STATUS_FEATURES_OK == 0 {
                return Err(VirtioError::FeatureNegotiationFailed { status });
            }
        }

        let max_size = transport.queue_max_size(QUEUE_INDEX).min(QUEUE_SIZE);
        let mut queue = VirtQueue::new(QUEUE_INDEX, max_size).map_err(|source| VirtioError::QueueFull { source })?;
        transport.set_queue(
            QUEUE_INDEX,
            queue.size(),
            queue.desc_table_addr(),
            queue.avail_addr(),
            queue.used_addr(),
        );

        let status_before_ok = transport.get_status();
        transport.set_status(status_before_ok | transport::STATUS_DRIVER_OK);
        let status = transport.get_status();
        if status & transport::STATUS_FAILED != 0 {
            return Err(VirtioError::DeviceFailed { status });
        }

        let capacity_sectors = transport.read_config_u64(0x00);
        let block_size = if wanted & transport::BLK_F_BLK_SIZE != 0 {
            transport.read_config_u64(0x14) as u32
        } else {
            Self::SECTOR_SIZE
        };
        let read_only = wanted & transport::BLK_F_RO != 0;

        let _ = &mut queue; // queue is moved into the struct below.
        Ok(VirtioBlock {
            transport,
            queue,
            capacity_sectors,
            block_size,
            read_only,
        })
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * Self::SECTOR_SIZE as u64
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn submit(&mut self, kind: u32, sector: u64, data: &mut [u8], data_write_by_device: bool) -> Result<(), VirtioError> {
        let hdr_alloc = dma::alloc_coherent(PAGE_SIZE).map_err(|source| VirtioError::Dma { source })?;
        let status_alloc = dma::alloc_coherent(PAGE_SIZE).map_err(|source| VirtioError::Dma { source })?;

        unsafe {
            let hdr = hdr_alloc.virt as *mut ReqHeader;
            hdr.write(ReqHeader {
                kind,
                reserved: 0,
                sector,
            });
            (status_alloc.virt as *mut u8).write(0xff);
        }

        let chain = self
            .queue
            .alloc_chain(3)
            .map_err(|source| VirtioError::QueueFull { source })?;
        let (hdr_idx, data_idx, status_idx) = (chain[0], chain[1], chain[2]);

        let hdr_bus = dma::map_single(hdr_alloc.virt, core::mem::size_of::<ReqHeader>(), Direction::ToDevice);
        self.queue
            .set_desc(hdr_idx, hdr_bus, core::mem::size_of::<ReqHeader>() as u32, false);

        let data_dir = if data_write_by_device {
            Direction::FromDevice
        } else {
            Direction::ToDevice
        };
        let data_bus = dma::map_single(data.as_mut_ptr() as usize, data.len(), data_dir);
        self.queue.set_desc(data_idx, data_bus, data.len() as u32, data_write_by_device);

        let status_bus = dma::map_single(status_alloc.virt, 1, Direction::FromDevice);
        self.queue.set_desc(status_idx, status_bus, 1, true);

        self.queue.publish_avail(hdr_idx);
        self.transport.notify(QUEUE_INDEX);

        let mut spins = 0u32;
        let completed = loop {
            if let Some((id, _len)) = self.queue.poll_used() {
                break id == hdr_idx;
            }
            spins += 1;
            if spins >= POLL_SPIN_BUDGET {
                break false;
            }
            core::hint::spin_loop();
        };

        let status_byte = unsafe { (status_alloc.virt as *const u8).read() };

        dma::unmap_single(hdr_bus, core::mem::size_of::<ReqHeader>(), Direction::ToDevice);
        dma::unmap_single(data_bus, data.len(), data_dir);
        dma::unmap_single(status_bus, 1, Direction::FromDevice);
        self.queue.free_chain(hdr_idx);
        dma::free_coherent(hdr_alloc);
        dma::free_coherent(status_alloc);

        if !completed {
            return Err(VirtioError::Timeout);
        }
        match status_byte {
            STATUS_OK => Ok(()),
            STATUS_IOERR => Err(VirtioError::DeviceError),
            STATUS_UNSUPP => Err(VirtioError::Unsupported),
            _ => Err(VirtioError::DeviceError),
        }
    }

    /// Reads exactly one sector-aligned `buf.len()` worth of data starting
    /// at `sector`.
    pub fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), VirtioError> {
        self.submit(VIRTIO_BLK_T_IN, sector, buf, true)
    }

    pub fn write_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), VirtioError> {
        if self.read_only {
            return Err(VirtioError::Unsupported);
        }
        self.submit(VIRTIO_BLK_T_OUT, sector, buf, false)
    }

    pub fn flush(&mut self) -> Result<(), VirtioError> {
        let mut empty = [];
        self.submit(VIRTIO_BLK_T_FLUSH, 0, &mut empty, false)
    }
}
