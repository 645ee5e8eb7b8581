//! virtio block driver stack (spec.md §4.3): split virtqueues, PCI-legacy
//! and MMIO transports, and the virtio-block device protocol built on top
//! of them.

pub mod block;
pub mod queue;
pub mod transport;

pub use block::{VirtioBlock, VirtioError};
pub use transport::Transport;
