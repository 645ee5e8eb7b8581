//! Ambient configuration surface (spec.md §9 open questions, resolved as
//! compile-time feature selections rather than runtime-parsed config — this
//! kernel boots from a flat image with no filesystem to read a config file
//! from, so "configuration" means the Cargo feature set baked into the
//! binary, per `[package.metadata.embodios]` in Cargo.toml).

/// Whether a mismatched EMB checksum aborts the load or is logged and
/// ignored (spec.md §9 "Checksum policy"). Selected by the
/// `embodios-checksum-reject` / `embodios-checksum-warn` features; reject
/// is the default posture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumPolicy {
    Reject,
    Warn,
}

pub const fn checksum_policy() -> ChecksumPolicy {
    if cfg!(feature = "embodios-checksum-warn") {
        ChecksumPolicy::Warn
    } else {
        ChecksumPolicy::Reject
    }
}

/// Rounding applied when narrowing an `f32` model weight to Q16.16 (spec.md
/// §4.5, §9). This kernel only implements round-nearest ([`Fixed::from_f32`]
/// per spec.md §9's explicit rejection of the teacher's stub-to-zero
/// behavior); the enum exists so the policy is named and checked in one
/// place rather than assumed at each call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundingMode {
    Nearest,
}

pub const F32_TO_FIXED_ROUNDING: RoundingMode = RoundingMode::Nearest;

/// Which virtio transports this build will probe, in probe order (spec.md
/// §5 "Transport"). Selected by the `embodios-virtio-pci` /
/// `embodios-virtio-mmio` features; both are on by default.
pub const fn virtio_pci_enabled() -> bool {
    cfg!(feature = "embodios-virtio-pci")
}

pub const fn virtio_mmio_enabled() -> bool {
    cfg!(feature = "embodios-virtio-mmio")
}

/// Re-exported so callers needing "the heap bounds" or "the virtio poll
/// timeout" have one obvious place to look rather than reaching into
/// `memory::layout` or `virtio::block` directly. The values themselves stay
/// defined where they're used, not duplicated here.
pub use crate::memory::layout::{HEAP_MAX, HEAP_MIN};
pub use crate::virtio::block::POLL_SPIN_BUDGET as VIRTIO_POLL_SPIN_BUDGET;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_checksum_policy_is_reject() {
        if !cfg!(feature = "embodios-checksum-warn") {
            assert_eq!(checksum_policy(), ChecksumPolicy::Reject);
        }
    }
}
