//! Backend selection for the fixed-point primitives (spec.md §9 "SIMD
//! backend selection"): one `TensorBackend` trait, a scalar reference
//! implementation always present, and vector implementations selected once
//! at startup by feature detection rather than scattered `#[cfg]`
//! branches at every call site.

use super::types::Fixed;

/// Implemented by every backend. `vec_dot` is the one primitive whose inner
/// loop actually benefits from vectorization; `matvec`/`matmul` are built on
/// top of it generically and need no per-backend override.
pub trait TensorBackend {
    fn vec_dot(&self, a: &[Fixed], b: &[Fixed]) -> Fixed;
    fn name(&self) -> &'static str;
}

/// Reference implementation: sum of `(i64) a[i] * (i64) b[i]`, shifted right
/// by 16 once at the end (spec.md §4.5). Used as both the correctness
/// oracle for vector backends and the fallback when no vector extension is
/// detected.
pub struct ScalarBackend;

impl TensorBackend for ScalarBackend {
    fn vec_dot(&self, a: &[Fixed], b: &[Fixed]) -> Fixed {
        let mut acc: i64 = 0;
        for i in 0..a.len().min(b.len()) {
            acc += a[i].raw() as i64 * b[i].raw() as i64;
        }
        Fixed::from_raw((acc >> super::types::FRAC_BITS) as i32)
    }

    fn name(&self) -> &'static str {
        "scalar"
    }
}

/// Recovers the exact signed 64-bit product `a * b` from the unsigned
/// 64-bit product of their bit patterns. `_mm_mul_epu32`/`_mm256_mul_epu32`
/// only multiply unsigned 32-bit halves; this correction is the standard
/// two's-complement widening trick: reinterpreting a negative `x` as
/// unsigned adds `2^32`, so the unsigned product overcounts by `2^32 * b`
/// when `a` is negative, by `2^32 * a` when `b` is negative (mod `2^64`,
/// which is exact here since `|a*b| < 2^62`).
#[cfg(target_arch = "x86_64")]
#[inline]
fn sign_correct(a: i32, b: i32, unsigned_product: u64) -> i64 {
    let mut p = unsigned_product;
    if a < 0 {
        p = p.wrapping_sub((b as u32 as u64) << 32);
    }
    if b < 0 {
        p = p.wrapping_sub((a as u32 as u64) << 32);
    }
    p as i64
}

#[cfg(target_arch = "x86_64")]
pub struct Sse2Backend;

#[cfg(target_arch = "x86_64")]
impl TensorBackend for Sse2Backend {
    /// Numerically identical to [`ScalarBackend`] for add/mul (spec.md §9:
    /// "exact for adds and muls"); the only change from the scalar form is
    /// the per-lane accumulation order, which a 64-bit accumulator absorbs
    /// without rounding difference.
    fn vec_dot(&self, a: &[Fixed], b: &[Fixed]) -> Fixed {
        // SAFETY: SSE2 is part of the x86_64 baseline ISA (guaranteed by
        // `target_arch = "x86_64"`), so it's always available here.
        let acc = unsafe { dot_sse2(a, b) };
        Fixed::from_raw((acc >> super::types::FRAC_BITS) as i32)
    }

    fn name(&self) -> &'static str {
        "sse2"
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn dot_sse2(a: &[Fixed], b: &[Fixed]) -> i64 {
    use core::arch::x86_64::{_mm_loadu_si128, _mm_mul_epu32, _mm_srli_si128, _mm_storeu_si128, __m128i};

    let n = a.len().min(b.len());
    let mut acc: i64 = 0;
    let chunks = n / 4;
    for c in 0..chunks {
        let base = c * 4;
        let av = _mm_loadu_si128(a.as_ptr().add(base) as *const __m128i);
        let bv = _mm_loadu_si128(b.as_ptr().add(base) as *const __m128i);
        // Even lanes (0, 2): two genuine 32x32->64 unsigned multiplies.
        let even = _mm_mul_epu32(av, bv);
        // Odd lanes (1, 3): shift them into the even slots and repeat.
        let odd = _mm_mul_epu32(_mm_srli_si128(av, 4), _mm_srli_si128(bv, 4));
        let mut even_parts = [0u64; 2];
        let mut odd_parts = [0u64; 2];
        _mm_storeu_si128(even_parts.as_mut_ptr() as *mut __m128i, even);
        _mm_storeu_si128(odd_parts.as_mut_ptr() as *mut __m128i, odd);
        for (lane, unsigned_prod) in [
            (0usize, even_parts[0]),
            (2usize, even_parts[1]),
            (1usize, odd_parts[0]),
            (3usize, odd_parts[1]),
        ] {
            acc = acc.wrapping_add(sign_correct(
                a[base + lane].raw(),
                b[base + lane].raw(),
                unsigned_prod,
            ));
        }
    }
    for i in chunks * 4..n {
        acc += a[i].raw() as i64 * b[i].raw() as i64;
    }
    acc
}

#[cfg(target_arch = "x86_64")]
pub struct Avx2Backend;

#[cfg(target_arch = "x86_64")]
impl TensorBackend for Avx2Backend {
    fn vec_dot(&self, a: &[Fixed], b: &[Fixed]) -> Fixed {
        // SAFETY: callers only reach `Backend::Avx2` via `detect`, which
        // checked CPUID leaf 7's AVX2 bit before constructing it.
        let acc = unsafe { dot_avx2(a, b) };
        Fixed::from_raw((acc >> super::types::FRAC_BITS) as i32)
    }

    fn name(&self) -> &'static str {
        "avx2"
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_avx2(a: &[Fixed], b: &[Fixed]) -> i64 {
    use core::arch::x86_64::{
        _mm256_loadu_si256, _mm256_mul_epu32, _mm256_srli_si256, _mm256_storeu_si256, __m256i,
    };

    let n = a.len().min(b.len());
    let mut acc: i64 = 0;
    let chunks = n / 8;
    for c in 0..chunks {
        let base = c * 8;
        let av = _mm256_loadu_si256(a.as_ptr().add(base) as *const __m256i);
        let bv = _mm256_loadu_si256(b.as_ptr().add(base) as *const __m256i);
        // Lanes 0,2,4,6 within each 128-bit half.
        let even = _mm256_mul_epu32(av, bv);
        // Lanes 1,3,5,7: `_mm256_srli_si256` shifts each 128-bit half
        // independently, which lines up exactly with the even-lane pairing.
        let odd = _mm256_mul_epu32(_mm256_srli_si256(av, 4), _mm256_srli_si256(bv, 4));
        let mut even_parts = [0u64; 4];
        let mut odd_parts = [0u64; 4];
        _mm256_storeu_si256(even_parts.as_mut_ptr() as *mut __m256i, even);
        _mm256_storeu_si256(odd_parts.as_mut_ptr() as *mut __m256i, odd);
        for (lane, unsigned_prod) in [
            (0usize, even_parts[0]),
            (2usize, even_parts[1]),
            (4usize, even_parts[2]),
            (6usize, even_parts[3]),
            (1usize, odd_parts[0]),
            (3usize, odd_parts[1]),
            (5usize, odd_parts[2]),
            (7usize, odd_parts[3]),
        ] {
            acc = acc.wrapping_add(sign_correct(
                a[base + lane].raw(),
                b[base + lane].raw(),
                unsigned_prod,
            ));
        }
    }
    for i in chunks * 8..n {
        acc += a[i].raw() as i64 * b[i].raw() as i64;
    }
    acc
}

#[cfg(target_arch = "aarch64")]
pub struct NeonBackend;

#[cfg(target_arch = "aarch64")]
impl TensorBackend for NeonBackend {
    fn vec_dot(&self, a: &[Fixed], b: &[Fixed]) -> Fixed {
        // SAFETY: NEON is mandatory on aarch64 (it's part of the base
        // architecture profile this kernel targets), so it's always
        // available here.
        let acc = unsafe { dot_neon(a, b) };
        Fixed::from_raw((acc >> super::types::FRAC_BITS) as i32)
    }

    fn name(&self) -> &'static str {
        "neon"
    }
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_neon(a: &[Fixed], b: &[Fixed]) -> i64 {
    use core::arch::aarch64::{vget_high_s32, vget_low_s32, vld1q_s32, vmull_s32, vst1q_s64};

    let n = a.len().min(b.len());
    let mut acc: i64 = 0;
    let chunks = n / 4;
    for c in 0..chunks {
        let base = c * 4;
        // SAFETY: `Fixed` is `#[repr(transparent)]` over `i32`, and `base`
        // was checked to leave 4 elements in bounds.
        let av = vld1q_s32(a.as_ptr().add(base) as *const i32);
        let bv = vld1q_s32(b.as_ptr().add(base) as *const i32);
        // NEON has a genuine signed 32x32->64 widening multiply, no
        // unsigned-product correction needed.
        let lo = vmull_s32(vget_low_s32(av), vget_low_s32(bv));
        let hi = vmull_s32(vget_high_s32(av), vget_high_s32(bv));
        let mut parts = [0i64; 4];
        vst1q_s64(parts.as_mut_ptr(), lo);
        vst1q_s64(parts.as_mut_ptr().add(2), hi);
        acc = acc
            .wrapping_add(parts[0])
            .wrapping_add(parts[1])
            .wrapping_add(parts[2])
            .wrapping_add(parts[3]);
    }
    for i in chunks * 4..n {
        acc += a[i].raw() as i64 * b[i].raw() as i64;
    }
    acc
}

pub enum Backend {
    Scalar(ScalarBackend),
    #[cfg(target_arch = "x86_64")]
    Sse2(Sse2Backend),
    #[cfg(target_arch = "x86_64")]
    Avx2(Avx2Backend),
    #[cfg(target_arch = "aarch64")]
    Neon(NeonBackend),
}

impl TensorBackend for Backend {
    fn vec_dot(&self, a: &[Fixed], b: &[Fixed]) -> Fixed {
        match self {
            Backend::Scalar(b_) => b_.vec_dot(a, b),
            #[cfg(target_arch = "x86_64")]
            Backend::Sse2(b_) => b_.vec_dot(a, b),
            #[cfg(target_arch = "x86_64")]
            Backend::Avx2(b_) => b_.vec_dot(a, b),
            #[cfg(target_arch = "aarch64")]
            Backend::Neon(b_) => b_.vec_dot(a, b),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Backend::Scalar(b) => b.name(),
            #[cfg(target_arch = "x86_64")]
            Backend::Sse2(b) => b.name(),
            #[cfg(target_arch = "x86_64")]
            Backend::Avx2(b) => b.name(),
            #[cfg(target_arch = "aarch64")]
            Backend::Neon(b) => b.name(),
        }
    }
}

/// Picks the best backend available on this CPU, once, at startup. Uses
/// `core::arch::x86_64::__cpuid` directly rather than `is_x86_feature_detected!`,
/// which depends on `std`.
#[cfg(target_arch = "x86_64")]
pub fn detect() -> Backend {
    // SAFETY: CPUID leaf 1 and 7 are available on every x86_64 CPU this
    // kernel targets (long mode implies at least CPUID support).
    unsafe {
        let leaf1 = core::arch::x86_64::__cpuid(1);
        let has_sse2 = leaf1.edx & (1 << 26) != 0;
        let leaf7 = core::arch::x86_64::__cpuid_count(7, 0);
        let has_avx2 = leaf7.ebx & (1 << 5) != 0;
        if has_avx2 {
            Backend::Avx2(Avx2Backend)
        } else if has_sse2 {
            Backend::Sse2(Sse2Backend)
        } else {
            Backend::Scalar(ScalarBackend)
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub fn detect() -> Backend {
    Backend::Neon(NeonBackend)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn detect() -> Backend {
    Backend::Scalar(ScalarBackend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_backends_agree_with_scalar_reference() {
        let a: [Fixed; 8] = core::array::from_fn(|i| Fixed::from_i32(i as i32 + 1));
        let b: [Fixed; 8] = core::array::from_fn(|i| Fixed::from_i32((8 - i) as i32));
        let reference = ScalarBackend.vec_dot(&a, &b);
        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(Sse2Backend.vec_dot(&a, &b), reference);
            assert_eq!(Avx2Backend.vec_dot(&a, &b), reference);
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert_eq!(NeonBackend.vec_dot(&a, &b), reference);
        }
        let _ = reference;
    }

    /// The widening multiply takes a different path depending on the sign
    /// of each operand (spec.md §9 "exact for adds and muls"); exercise all
    /// four sign combinations, not just the all-positive case above.
    #[test]
    fn vector_backends_agree_on_mixed_signs() {
        let a: [Fixed; 8] = core::array::from_fn(|i| Fixed::from_i32(if i % 2 == 0 { -(i as i32) - 1 } else { i as i32 + 1 }));
        let b: [Fixed; 8] = core::array::from_fn(|i| Fixed::from_i32(if i % 3 == 0 { -(i as i32) - 5 } else { i as i32 + 2 }));
        let reference = ScalarBackend.vec_dot(&a, &b);
        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(Sse2Backend.vec_dot(&a, &b), reference);
            assert_eq!(Avx2Backend.vec_dot(&a, &b), reference);
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert_eq!(NeonBackend.vec_dot(&a, &b), reference);
        }
        let _ = reference;
    }

    /// Lengths that aren't a multiple of the vector width exercise each
    /// backend's scalar remainder tail.
    #[test]
    fn vector_backends_agree_on_non_multiple_length() {
        let a: [Fixed; 11] = core::array::from_fn(|i| Fixed::from_i32(i as i32 - 5));
        let b: [Fixed; 11] = core::array::from_fn(|i| Fixed::from_i32(11 - i as i32));
        let reference = ScalarBackend.vec_dot(&a, &b);
        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(Sse2Backend.vec_dot(&a, &b), reference);
            assert_eq!(Avx2Backend.vec_dot(&a, &b), reference);
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert_eq!(NeonBackend.vec_dot(&a, &b), reference);
        }
        let _ = reference;
    }
}
