//! Quantized-tensor weight loader (spec.md §4.4, §6 "Model file" wire
//! formats). Two on-disk formats are accepted — GGUF and the compact
//! native EMB format — both parsed into the same [`tensor::ModelImage`] so
//! the fixed-point inference kernel (`fixed::transformer`) never needs to
//! know which one backed a given model.
//!
//! Brought up after the block device (models are read off a [`BlockDevice`]
//! into a heap buffer by the boot-param model loader) and before inference.

pub mod dequant;
pub mod emb;
pub mod gguf;
pub mod tensor;

use snafu::Snafu;

pub use tensor::{DType, ModelImage, TensorDesc};

#[derive(Debug, Snafu)]
pub enum WeightError {
    /// kind: Protocol violation
    #[snafu(display("bad magic number in model file"))]
    BadMagic,
    /// kind: Protocol violation
    #[snafu(display("unsupported format version {version}"))]
    BadVersion { version: u32 },
    /// kind: Protocol violation
    #[snafu(display("offset/size {offset}+{size} lies outside the {file_len}-byte file"))]
    OutOfBounds { offset: u64, size: u64, file_len: u64 },
    /// kind: Protocol violation
    #[snafu(display("checksum mismatch: expected {expected:#x}, computed {computed:#x}"))]
    ChecksumMismatch { expected: u32, computed: u32 },
    /// kind: Invalid argument
    #[snafu(display("unknown or unsupported quantization type {tag}"))]
    UnknownQuantization { tag: u32 },
    /// kind: Resource exhausted
    #[snafu(display("allocation failed while materializing a dequantized tensor"))]
    Alloc,
    /// kind: Protocol violation
    #[snafu(display("model declares {ndim} dimensions, more than the {max} this kernel tracks"))]
    TooManyDims { ndim: u32, max: u32 },
    /// kind: Resource exhausted
    #[snafu(display("tensor table is full (capacity {capacity})"))]
    TooManyTensors { capacity: usize },
    /// kind: Invalid argument
    #[snafu(display("no tensor named {name:?}"))]
    NoSuchTensor { name: alloc::string::String },
}

const GGUF_MAGIC: [u8; 4] = *b"GGUF";
const EMB_MAGIC: [u8; 4] = *b"EMBO";

/// Detects the format by magic and parses into a [`ModelImage`]. Mirrors
/// spec.md §4.4 "Two formats are accepted."
pub fn load(bytes: &[u8]) -> Result<ModelImage<'_>, WeightError> {
    if bytes.len() < 4 {
        return Err(WeightError::BadMagic);
    }
    match &bytes[0..4] {
        m if *m == GGUF_MAGIC => gguf::parse(bytes),
        m if *m == EMB_MAGIC => emb::parse(bytes),
        _ => Err(WeightError::BadMagic),
    }
}
