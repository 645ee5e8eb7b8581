//! Q16.16 fixed-point tensor primitives and the inference kernel built on
//! top of them (spec.md §4.5).

pub mod ops;
pub mod simd;
pub mod transformer;
pub mod types;

pub use ops::FixedError;
pub use simd::{Backend, TensorBackend};
pub use types::Fixed;
pub use transformer::{KvCache, Model, TransformerConfig};
