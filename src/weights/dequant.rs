//! Dequantization to Q16.16 (spec.md §4.4 "Dequantization"). Each supported
//! codec has a deterministic, bit-reproducible decode; anything else is
//! rejected rather than guessed at (spec.md §4.4 "Unknown quantization type
//! returns an error").

use alloc::vec::Vec;

use super::tensor::{DType, TensorDesc};
use super::WeightError;
use crate::fixed::types::Fixed;

/// Produces a Q16.16 buffer for `desc` from its raw on-disk bytes (spec.md
/// §4.4). `raw` must be exactly `desc.size` bytes, as returned by
/// [`super::tensor::ModelImage::get_tensor`].
pub fn dequantize(desc: &TensorDesc, raw: &[u8]) -> Result<Vec<Fixed>, WeightError> {
    let n = desc.element_count() as usize;
    match desc.dtype {
        DType::F32 => dequant_f32(raw, n),
        DType::Q8_0 => dequant_q8_0(raw, n),
        DType::Q4_K => dequant_q4_k(raw, n),
        other => Err(WeightError::UnknownQuantization { tag: dtype_tag(other) }),
    }
}

fn dtype_tag(dtype: DType) -> u32 {
    match dtype {
        DType::F32 => 0,
        DType::F16 => 1,
        DType::Q4_0 => 2,
        DType::Q4_1 => 3,
        DType::Q5_0 => 6,
        DType::Q5_1 => 7,
        DType::Q8_0 => 8,
        DType::Q8_1 => 9,
        DType::Q4_K => 12,
        DType::Q5_K => 13,
        DType::Q6_K => 14,
        DType::Unknown(tag) => tag,
    }
}

/// Reinterpret-and-scale F32 conversion (spec.md §4.4, §9: "implementations
/// must perform a real conversion (e.g. round-nearest, saturate)" — the
/// teacher's stub-to-zero is explicitly not the behavior to reproduce).
fn dequant_f32(raw: &[u8], n: usize) -> Result<Vec<Fixed>, WeightError> {
    let mut out = Vec::new();
    out.try_reserve(n).map_err(|_| WeightError::Alloc)?;
    for chunk in raw.chunks_exact(4).take(n) {
        let bits = u32::from_le_bytes(chunk.try_into().unwrap());
        out.push(Fixed::from_f32(f32::from_bits(bits)));
    }
    Ok(out)
}

/// Q8_0: 32-value blocks, each a Q8.8 `i16` scale followed by 32 signed
/// 8-bit samples. Q16.16 output is `sample * scale` (spec.md §4.4).
fn dequant_q8_0(raw: &[u8], n: usize) -> Result<Vec<Fixed>, WeightError> {
    const BLOCK_ELEMS: usize = 32;
    const BLOCK_BYTES: usize = 34; // 2-byte scale + 32 samples
    let mut out = Vec::new();
    out.try_reserve(n).map_err(|_| WeightError::Alloc)?;
    let mut produced = 0;
    for block in raw.chunks_exact(BLOCK_BYTES) {
        if produced >= n {
            break;
        }
        let scale_q8_8 = i16::from_le_bytes([block[0], block[1]]) as i32;
        // Q8.8 -> Q16.16: shift the fractional point from 8 bits to 16.
        let scale = Fixed::from_raw(scale_q8_8 << 8);
        let take = BLOCK_ELEMS.min(n - produced);
        for &sample in &block[2..2 + take] {
            let s = Fixed::from_i32(sample as i8 as i32);
            out.push(s.mul(scale));
        }
        produced += take;
    }
    Ok(out)
}

/// Q4_K: 256-value blocks. Layout per spec.md §4.4: "12-byte scale block +
/// 128 packed 4-bit nibbles + two Q8.8 global scales (`d`, `dmin`)". The
/// reference decode (matching the ggml Q4_K layout this codec is named
/// after): each block splits into 8 sub-groups of 32 values; every
/// sub-group has its own 6-bit scale and 6-bit min packed into the 12-byte
/// scale block, and `value = d * scale_i * nibble - dmin * min_i`.
fn dequant_q4_k(raw: &[u8], n: usize) -> Result<Vec<Fixed>, WeightError> {
    const BLOCK_ELEMS: usize = 256;
    const BLOCK_BYTES: usize = 144; // 2(d) + 2(dmin) + 12(scales) + 128(qs)
    const SUBGROUPS: usize = 8;
    const SUBGROUP_ELEMS: usize = 32;

    let mut out = Vec::new();
    out.try_reserve(n).map_err(|_| WeightError::Alloc)?;
    let mut produced = 0;
    for block in raw.chunks_exact(BLOCK_BYTES) {
        if produced >= n {
            break;
        }
        let d = Fixed::from_raw((i16::from_le_bytes([block[0], block[1]]) as i32) << 8);
        let dmin = Fixed::from_raw((i16::from_le_bytes([block[2], block[3]]) as i32) << 8);
        let scales = &block[4..16];
        let qs = &block[16..144];

        let take = BLOCK_ELEMS.min(n - produced);
        for sub in 0..SUBGROUPS {
            if produced >= n {
                break;
            }
            // 6-bit scale and 6-bit min packed two-per-byte across the
            // 12-byte scale block, low nibble/high nibble split at sub==4.
            let (scale_bits, min_bits) = unpack_6bit_scale_min(scales, sub);
            let scale = Fixed::from_raw((scale_bits as i32) << (16 - 6));
            let min = Fixed::from_raw((min_bits as i32) << (16 - 6));
            let sub_scale = d.mul(scale);
            let sub_min = dmin.mul(min);

            let nibble_base = sub * SUBGROUP_ELEMS / 2;
            for j in 0..SUBGROUP_ELEMS {
                if produced >= n || (sub * SUBGROUP_ELEMS + j) >= take {
                    break;
                }
                let byte = qs[nibble_base + j / 2];
                let nibble = if j % 2 == 0 { byte & 0x0f } else { byte >> 4 };
                let value = Fixed::from_i32(nibble as i32).mul(sub_scale).sub(sub_min);
                out.push(value);
                produced += 1;
            }
        }
    }
    Ok(out)
}

/// Splits the 12-byte Q4_K scale block into a (scale, min) pair of 6-bit
/// fields for sub-group `sub` (0..8), following the packed layout where the
/// first 4 sub-groups' scales/mins occupy the low 6 bits of bytes 0..8 and
/// the last 4 reuse the high bits combined with bytes 8..12.
fn unpack_6bit_scale_min(scales: &[u8], sub: usize) -> (u8, u8) {
    if sub < 4 {
        let scale = scales[sub] & 0x3f;
        let min = scales[sub + 4] & 0x3f;
        (scale, min)
    } else {
        let lo = sub - 4;
        let scale = (scales[lo + 8] & 0x0f) | ((scales[lo] >> 6) << 4);
        let min = (scales[lo + 8] >> 4) | ((scales[lo + 4] >> 6) << 4);
        (scale & 0x3f, min & 0x3f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::tensor::MAX_DIMS;

    fn desc(dtype: DType, n: u64) -> TensorDesc {
        TensorDesc {
            name: heapless::String::try_from("t").unwrap(),
            dtype,
            ndim: 1,
            dims: {
                let mut d = [1u64; MAX_DIMS];
                d[0] = n;
                d
            },
            offset: 0,
            size: 0,
        }
    }

    #[test]
    fn f32_round_trips_simple_values() {
        let values: [f32; 4] = [1.0, -2.5, 0.0, 100.0];
        let mut raw = Vec::new();
        for v in values {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let d = desc(DType::F32, 4);
        let out = dequantize(&d, &raw).unwrap();
        for (o, v) in out.iter().zip(values.iter()) {
            assert!((o.to_f32() - v).abs() < 0.01);
        }
    }

    #[test]
    fn q8_0_scales_samples_by_block_scale() {
        // scale = 1.0 in Q8.8 (0x0100), samples [1, 2, 3, 4], rest zero.
        let mut raw = Vec::new();
        raw.extend_from_slice(&0x0100i16.to_le_bytes());
        let mut samples = [0i8; 32];
        samples[0] = 1;
        samples[1] = 2;
        samples[2] = 3;
        samples[3] = 4;
        for s in samples {
            raw.push(s as u8);
        }
        let d = desc(DType::Q8_0, 4);
        let out = dequantize(&d, &raw).unwrap();
        assert_eq!(out[0].raw(), 0x10000);
        assert_eq!(out[1].raw(), 0x20000);
        assert_eq!(out[2].raw(), 0x30000);
        assert_eq!(out[3].raw(), 0x40000);
    }

    #[test]
    fn unsupported_dtype_is_rejected() {
        let d = desc(DType::Q5_K, 4);
        assert!(matches!(dequantize(&d, &[]), Err(WeightError::UnknownQuantization { .. })));
    }
}
