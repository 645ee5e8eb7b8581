//! GGUF parser (spec.md §4.4, §6 "Model file – GGUF").
//!
//! Layout: a 24-byte fixed header (magic, version, tensor count, kv count),
//! a sequence of length-prefixed key/value metadata pairs, a tensor
//! descriptor table, then the weights region starting at the next
//! 256-byte-aligned file offset.

use arrayvec::ArrayVec;

use super::tensor::{DType, ModelImage, TensorDesc, MAX_DIMS, MAX_TENSORS};
use super::WeightError;

const SUPPORTED_VERSIONS: [u32; 3] = [1, 2, 3];
const DATA_ALIGN: u64 = 256;

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WeightError> {
        let end = self.pos.checked_add(n).ok_or(WeightError::OutOfBounds {
            offset: self.pos as u64,
            size: n as u64,
            file_len: self.bytes.len() as u64,
        })?;
        let slice = self.bytes.get(self.pos..end).ok_or(WeightError::OutOfBounds {
            offset: self.pos as u64,
            size: n as u64,
            file_len: self.bytes.len() as u64,
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, WeightError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, WeightError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn gguf_string(&mut self) -> Result<&'a str, WeightError> {
        let len = self.u64()? as usize;
        let bytes = self.take(len)?;
        core::str::from_utf8(bytes).map_err(|_| WeightError::BadMagic)
    }
}

/// GGUF metadata value-type tags (the standard `gguf_metadata_value_type`
/// numbering: primitives 0-7 and 10-12, 8 = string, 9 = array).
fn skip_value(cur: &mut Cursor, type_tag: u32) -> Result<(), WeightError> {
    match type_tag {
        0 | 1 | 7 => {
            cur.take(1)?;
        } // UINT8, INT8, BOOL
        2 | 3 => {
            cur.take(2)?;
        } // UINT16, INT16
        4 | 5 | 6 => {
            cur.take(4)?;
        } // UINT32, INT32, FLOAT32
        10 | 11 | 12 => {
            cur.take(8)?;
        } // UINT64, INT64, FLOAT64
        8 => {
            cur.gguf_string()?;
        } // STRING
        9 => {
            // ARRAY: element type tag, element count, then that many values.
            let elem_type = cur.u32()?;
            let count = cur.u64()?;
            for _ in 0..count {
                skip_value(cur, elem_type)?;
            }
        }
        _ => return Err(WeightError::BadMagic),
    }
    Ok(())
}

pub fn parse(bytes: &[u8]) -> Result<ModelImage<'_>, WeightError> {
    let mut cur = Cursor::new(bytes);
    let magic = cur.take(4)?;
    if magic != b"GGUF" {
        return Err(WeightError::BadMagic);
    }
    let version = cur.u32()?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(WeightError::BadVersion { version });
    }
    let tensor_count = cur.u64()?;
    let kv_count = cur.u64()?;

    for _ in 0..kv_count {
        cur.gguf_string()?; // key
        let type_tag = cur.u32()?;
        skip_value(&mut cur, type_tag)?;
    }

    if tensor_count as usize > MAX_TENSORS {
        return Err(WeightError::TooManyTensors { capacity: MAX_TENSORS });
    }

    let mut tensors: ArrayVec<TensorDesc, MAX_TENSORS> = ArrayVec::new();
    let mut rel_offsets: ArrayVec<u64, MAX_TENSORS> = ArrayVec::new();
    for _ in 0..tensor_count {
        let name = cur.gguf_string()?;
        let ndim = cur.u32()?;
        if ndim as usize > MAX_DIMS {
            return Err(WeightError::TooManyDims { ndim, max: MAX_DIMS as u32 });
        }
        let mut dims = [1u64; MAX_DIMS];
        for d in dims.iter_mut().take(ndim as usize) {
            *d = cur.u64()?;
        }
        let type_tag = cur.u32()?;
        let rel_offset = cur.u64()?;

        let dtype = DType::from_tag(type_tag);
        let n_elements: u64 = dims[..ndim as usize].iter().product();
        let size = dtype
            .size_bytes(n_elements)
            .ok_or(WeightError::UnknownQuantization { tag: type_tag })?;

        let desc_name = heapless::String::try_from(name).map_err(|_| WeightError::BadMagic)?;
        tensors
            .try_push(TensorDesc {
                name: desc_name,
                dtype,
                ndim,
                dims,
                offset: 0, // patched below once the data region's base is known
                size,
            })
            .map_err(|_| WeightError::TooManyTensors { capacity: MAX_TENSORS })?;
        rel_offsets
            .try_push(rel_offset)
            .map_err(|_| WeightError::TooManyTensors { capacity: MAX_TENSORS })?;
    }

    let data_offset = cur.pos as u64;
    let weights_offset = data_offset.div_ceil(DATA_ALIGN) * DATA_ALIGN;
    if weights_offset as usize > bytes.len() {
        return Err(WeightError::OutOfBounds {
            offset: weights_offset,
            size: 0,
            file_len: bytes.len() as u64,
        });
    }

    for (t, rel) in tensors.iter_mut().zip(rel_offsets.iter()) {
        t.offset = weights_offset + rel;
    }

    let weights_size = bytes.len() as u64 - weights_offset;
    let image = ModelImage {
        bytes,
        tensors,
        weights_offset,
        weights_size,
    };
    image.validate()?;
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Builds a minimal one-tensor GGUF file: no metadata, one F32 tensor
    /// named "w" of shape [4].
    fn build_minimal_gguf(values: &[f32]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"GGUF");
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&1u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&0u64.to_le_bytes()); // kv_count

        let name = b"w";
        buf.extend_from_slice(&(name.len() as u64).to_le_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&1u32.to_le_bytes()); // ndim
        buf.extend_from_slice(&(values.len() as u64).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // type = F32
        buf.extend_from_slice(&0u64.to_le_bytes()); // rel offset

        while buf.len() % 256 != 0 {
            buf.push(0);
        }
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; 32];
        assert!(matches!(parse(&buf), Err(WeightError::BadMagic)));
    }

    #[test]
    fn parses_single_f32_tensor() {
        let buf = build_minimal_gguf(&[1.0, 2.0, 3.0, 4.0]);
        let image = parse(&buf).unwrap();
        assert_eq!(image.tensor_count(), 1);
        let (desc, data) = image.get_tensor("w").unwrap();
        assert_eq!(desc.dtype, DType::F32);
        assert_eq!(data.len(), 16);
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut buf = build_minimal_gguf(&[1.0]);
        buf[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(parse(&buf), Err(WeightError::BadVersion { version: 99 })));
    }
}
