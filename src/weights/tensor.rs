//! Tensor descriptor table and the parsed-model handle both formats
//! produce (spec.md §3 "Tensor descriptor" / "Model image").

use arrayvec::ArrayVec;

use super::WeightError;

/// Maximum tensor rank this kernel tracks (spec.md §3: "up to four
/// dimension sizes"). GGUF permits more; a model that declares a higher
/// rank is rejected at load rather than silently truncated.
pub const MAX_DIMS: usize = 4;

/// Upper bound on the tensor table, sized for the small MLP/transformer
/// topologies spec.md §1 scopes this kernel to (static graphs only).
pub const MAX_TENSORS: usize = 512;

/// Element type tag, shared between GGUF's per-tensor `type` field and
/// EMB's per-tensor `dtype` field (spec.md §3). Numeric values follow the
/// `ggml_type` ordering GGUF files are written against, so a tag read out
/// of either file format can be matched directly without translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q4_K,
    Q5_K,
    Q6_K,
    Unknown(u32),
}

impl DType {
    pub fn from_tag(tag: u32) -> DType {
        match tag {
            0 => DType::F32,
            1 => DType::F16,
            2 => DType::Q4_0,
            3 => DType::Q4_1,
            6 => DType::Q5_0,
            7 => DType::Q5_1,
            8 => DType::Q8_0,
            9 => DType::Q8_1,
            12 => DType::Q4_K,
            13 => DType::Q5_K,
            14 => DType::Q6_K,
            other => DType::Unknown(other),
        }
    }

    /// Bytes needed to store `n_elements` of this type, accounting for
    /// block quantization. Used to bound-check a tensor's declared size
    /// (and to compute it outright for GGUF, which stores only an offset).
    /// Block layouts beyond Q8_0/Q4_K (spec.md §4.4's two fully specified
    /// codecs) follow the well-known ggml block sizes; dequantizing them is
    /// still unsupported (spec.md §4.4 "Unknown quantization type returns
    /// an error"), but the byte accounting has to be right regardless so a
    /// mixed-quantization model's tensor table still validates.
    pub fn size_bytes(&self, n_elements: u64) -> Option<u64> {
        let (block_elems, block_bytes): (u64, u64) = match self {
            DType::F32 => (1, 4),
            DType::F16 => (1, 2),
            DType::Q4_0 => (32, 18),
            DType::Q4_1 => (32, 20),
            DType::Q5_0 => (32, 22),
            DType::Q5_1 => (32, 24),
            DType::Q8_0 => (32, 34),
            DType::Q8_1 => (32, 36),
            DType::Q4_K => (256, 144),
            DType::Q5_K => (256, 176),
            DType::Q6_K => (256, 210),
            DType::Unknown(_) => return None,
        };
        let blocks = n_elements.div_ceil(block_elems);
        Some(blocks * block_bytes)
    }
}

/// One tensor's location and shape (spec.md §3 "Tensor descriptor").
#[derive(Clone, Debug)]
pub struct TensorDesc {
    pub name: heapless::String<64>,
    pub dtype: DType,
    pub ndim: u32,
    pub dims: [u64; MAX_DIMS],
    /// Absolute byte offset into the file.
    pub offset: u64,
    pub size: u64,
}

impl TensorDesc {
    pub fn element_count(&self) -> u64 {
        self.dims[..self.ndim as usize].iter().product()
    }
}

/// A parsed model: the file's bytes, the tensor table, and the span those
/// byte offsets are relative to (spec.md §3 "Model image").
pub struct ModelImage<'a> {
    pub(super) bytes: &'a [u8],
    pub(super) tensors: ArrayVec<TensorDesc, MAX_TENSORS>,
    pub(super) weights_offset: u64,
    pub(super) weights_size: u64,
}

impl<'a> ModelImage<'a> {
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensors(&self) -> &[TensorDesc] {
        &self.tensors
    }

    /// Linear-scan lookup by name (spec.md §4.4 "Tensor lookup"), returning
    /// the descriptor plus a byte slice into the weights region.
    pub fn get_tensor(&self, name: &str) -> Option<(&TensorDesc, &'a [u8])> {
        let desc = self.tensors.iter().find(|t| t.name.as_str() == name)?;
        let start = desc.offset as usize;
        let end = start + desc.size as usize;
        self.bytes.get(start..end).map(|slice| (desc, slice))
    }

    /// `sum(tensor.size) <= weights_size` and every tensor fits inside the
    /// weights region (spec.md §8 invariant 4).
    pub(super) fn validate(&self) -> Result<(), WeightError> {
        let file_len = self.bytes.len() as u64;
        let mut total = 0u64;
        for t in &self.tensors {
            let end = t
                .offset
                .checked_add(t.size)
                .ok_or(WeightError::OutOfBounds { offset: t.offset, size: t.size, file_len })?;
            if end > file_len {
                return Err(WeightError::OutOfBounds { offset: t.offset, size: t.size, file_len });
            }
            if t.offset < self.weights_offset || end > self.weights_offset + self.weights_size {
                return Err(WeightError::OutOfBounds { offset: t.offset, size: t.size, file_len });
            }
            total = total.saturating_add(t.size);
        }
        if total > self.weights_size {
            return Err(WeightError::OutOfBounds {
                offset: self.weights_offset,
                size: total,
                file_len: self.weights_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q8_0_block_size_is_34_bytes_per_32_elements() {
        assert_eq!(DType::Q8_0.size_bytes(32), Some(34));
        assert_eq!(DType::Q8_0.size_bytes(33), Some(68)); // rounds up to 2 blocks
    }

    #[test]
    fn q4_k_block_size_is_144_bytes_per_256_elements() {
        assert_eq!(DType::Q4_K.size_bytes(256), Some(144));
    }

    #[test]
    fn unknown_dtype_has_no_computable_size() {
        assert_eq!(DType::from_tag(999).size_bytes(32), None);
    }
}
