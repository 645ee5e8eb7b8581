//! EMB parser (spec.md §4.4, §6 "Model file – EMB format (bit-exact)").
//!
//! Fixed 256-byte header, little-endian. The fields the spec enumerates sum
//! to 40 bytes; the remaining 216 bytes of the stated 256-byte header are
//! reserved padding (spec.md's "60 reserved bytes" undercounts against its
//! own "fixed 256-byte header" — see DESIGN.md for this call).

use arrayvec::ArrayVec;
use zerocopy::{FromBytes, FromZeroes};

use super::tensor::{DType, ModelImage, TensorDesc, MAX_DIMS, MAX_TENSORS};
use super::WeightError;
use crate::config::{self, ChecksumPolicy};

pub const HEADER_LEN: usize = 256;
const RESERVED_LEN: usize = HEADER_LEN - 40;
const TENSOR_DESC_LEN: usize = 152;

const MAGIC: u32 = 0x454D_424F; // "EMBO"
const VERSION: u32 = 0x0100;

/// Plain `u32` fields read as native endianness: this kernel only targets
/// little-endian hardware (x86_64, aarch64-LE), matching the wire format
/// directly without a byte-order newtype wrapper.
#[derive(FromZeroes, FromBytes)]
#[repr(C)]
struct RawHeader {
    magic: u32,
    version: u32,
    compression_type: u32,
    quantization_type: u32,
    tensor_count: u32,
    metadata_offset: u32,
    metadata_size: u32,
    weights_offset: u32,
    weights_size: u32,
    checksum: u32,
    _reserved: [u8; RESERVED_LEN],
}

const _: () = assert!(core::mem::size_of::<RawHeader>() == HEADER_LEN);

/// Rolling-XOR checksum over everything after the 256-byte header (spec.md
/// §6). `fold`s each byte into a running accumulator that is itself rotated
/// one bit per byte, which is what "rolling" means here as distinct from a
/// plain XOR-reduce (a plain XOR would be blind to byte transpositions).
fn rolling_xor(bytes: &[u8]) -> u32 {
    let mut acc: u32 = 0;
    for &b in bytes {
        acc = acc.rotate_left(1) ^ (b as u32);
    }
    acc
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, WeightError> {
    let slice = bytes.get(offset..offset + 4).ok_or(WeightError::OutOfBounds {
        offset: offset as u64,
        size: 4,
        file_len: bytes.len() as u64,
    })?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u64_field(bytes: &[u8], offset: usize) -> Result<u64, WeightError> {
    let slice = bytes.get(offset..offset + 8).ok_or(WeightError::OutOfBounds {
        offset: offset as u64,
        size: 8,
        file_len: bytes.len() as u64,
    })?;
    Ok(u64::from_le_bytes(slice.try_into().unwrap()))
}

pub fn parse(bytes: &[u8]) -> Result<ModelImage<'_>, WeightError> {
    if bytes.len() < HEADER_LEN {
        return Err(WeightError::OutOfBounds {
            offset: 0,
            size: HEADER_LEN as u64,
            file_len: bytes.len() as u64,
        });
    }
    let header = RawHeader::ref_from(&bytes[..HEADER_LEN]).ok_or(WeightError::BadMagic)?;

    if header.magic != MAGIC {
        return Err(WeightError::BadMagic);
    }
    if header.version != VERSION {
        return Err(WeightError::BadVersion { version: header.version });
    }

    let checksum_expected = header.checksum;
    let checksum_computed = rolling_xor(&bytes[HEADER_LEN..]);
    if checksum_expected != checksum_computed {
        if config::checksum_policy() == ChecksumPolicy::Reject {
            return Err(WeightError::ChecksumMismatch {
                expected: checksum_expected,
                computed: checksum_computed,
            });
        }
        if let Some(l) = crate::log::logger::try_get_logger() {
            l.log_at(crate::log::logger::Severity::Warn, "EMB checksum mismatch (policy: warn)");
        }
    }

    let tensor_count = header.tensor_count as usize;
    if tensor_count > MAX_TENSORS {
        return Err(WeightError::TooManyTensors { capacity: MAX_TENSORS });
    }
    let weights_offset = header.weights_offset as u64;
    let weights_size = header.weights_size as u64;
    let metadata_offset = header.metadata_offset as u64;
    let metadata_size = header.metadata_size as u64;

    // Tensor descriptor table sits directly after the metadata blob.
    let table_start = (metadata_offset + metadata_size) as usize;
    let mut tensors: ArrayVec<TensorDesc, MAX_TENSORS> = ArrayVec::new();
    for i in 0..tensor_count {
        let base = table_start + i * TENSOR_DESC_LEN;
        let raw = bytes.get(base..base + TENSOR_DESC_LEN).ok_or(WeightError::OutOfBounds {
            offset: base as u64,
            size: TENSOR_DESC_LEN as u64,
            file_len: bytes.len() as u64,
        })?;

        let name_bytes = &raw[0..64];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(64);
        let name_str = core::str::from_utf8(&name_bytes[..name_len]).map_err(|_| WeightError::BadMagic)?;
        let name = heapless::String::try_from(name_str).map_err(|_| WeightError::BadMagic)?;

        let dtype_tag = read_u32(raw, 64)?;
        let ndim = read_u32(raw, 68)?;
        if ndim as usize > MAX_DIMS {
            return Err(WeightError::TooManyDims { ndim, max: MAX_DIMS as u32 });
        }
        let mut dims = [1u64; MAX_DIMS];
        for (d, slot) in dims.iter_mut().take(ndim as usize).enumerate() {
            *slot = read_u64_field(raw, 72 + d * 8)?;
        }
        let offset = read_u32(raw, 136)? as u64;
        let size = read_u32(raw, 140)? as u64;

        tensors
            .try_push(TensorDesc {
                name,
                dtype: DType::from_tag(dtype_tag),
                ndim,
                dims,
                offset: weights_offset + offset,
                size,
            })
            .map_err(|_| WeightError::TooManyTensors { capacity: MAX_TENSORS })?;
    }

    let image = ModelImage { bytes, tensors, weights_offset, weights_size };
    image.validate()?;
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn build_minimal_emb(tensor_data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        // compression=0, quantization=0
        buf[16..20].copy_from_slice(&1u32.to_le_bytes()); // tensor_count
        buf[20..24].copy_from_slice(&(HEADER_LEN as u32).to_le_bytes()); // metadata_offset
        buf[24..28].copy_from_slice(&0u32.to_le_bytes()); // metadata_size = 0

        let table_start = HEADER_LEN;
        let weights_offset = table_start + TENSOR_DESC_LEN;
        buf[28..32].copy_from_slice(&(weights_offset as u32).to_le_bytes());
        buf[32..36].copy_from_slice(&(tensor_data.len() as u32).to_le_bytes());

        let mut descriptor = vec![0u8; TENSOR_DESC_LEN];
        descriptor[0..1].copy_from_slice(b"w");
        descriptor[64..68].copy_from_slice(&0u32.to_le_bytes()); // F32
        descriptor[68..72].copy_from_slice(&1u32.to_le_bytes()); // ndim
        descriptor[72..80].copy_from_slice(&((tensor_data.len() / 4) as u64).to_le_bytes());
        descriptor[136..140].copy_from_slice(&0u32.to_le_bytes()); // rel offset
        descriptor[140..144].copy_from_slice(&(tensor_data.len() as u32).to_le_bytes());

        buf.extend_from_slice(&descriptor);
        buf.extend_from_slice(tensor_data);

        let checksum = rolling_xor(&buf[HEADER_LEN..]);
        buf[36..40].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    #[test]
    fn parses_single_tensor_with_matching_checksum() {
        let data: [u8; 16] = [0; 16];
        let buf = build_minimal_emb(&data);
        let image = parse(&buf).unwrap();
        let (desc, slice) = image.get_tensor("w").unwrap();
        assert_eq!(desc.dtype, DType::F32);
        assert_eq!(slice.len(), 16);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = build_minimal_emb(&[0u8; 4]);
        buf[0] = 0;
        assert!(matches!(parse(&buf), Err(WeightError::BadMagic)));
    }
}
