//! Tensor primitives over [`Fixed`] (spec.md §4.5). `vec_dot` dispatches
//! through the detected [`TensorBackend`]; everything else is built on top
//! of it generically so there is exactly one place backend selection
//! happens.

use snafu::Snafu;

use super::simd::{Backend, TensorBackend};
use super::types::{Fixed, EPSILON};

#[derive(Debug, Snafu)]
pub enum FixedError {
    #[snafu(display("dimension mismatch: expected {expected}, got {got}"))]
    DimensionMismatch { expected: usize, got: usize },
    #[snafu(display("buffer argument was empty/null where data was required"))]
    NullBuffer,
    #[snafu(display("vector argument was empty"))]
    EmptyVector,
}

pub fn vec_dot(backend: &Backend, a: &[Fixed], b: &[Fixed]) -> Result<Fixed, FixedError> {
    if a.is_empty() || b.is_empty() {
        return Err(FixedError::EmptyVector);
    }
    if a.len() != b.len() {
        return Err(FixedError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }
    Ok(backend.vec_dot(a, b))
}

/// One `vec_dot` per row: `mat` is `rows * cols` in row-major order.
pub fn matvec(
    backend: &Backend,
    mat: &[Fixed],
    rows: usize,
    cols: usize,
    vec: &[Fixed],
    out: &mut [Fixed],
) -> Result<(), FixedError> {
    if vec.len() != cols {
        return Err(FixedError::DimensionMismatch {
            expected: cols,
            got: vec.len(),
        });
    }
    if out.len() != rows || mat.len() != rows * cols {
        return Err(FixedError::DimensionMismatch {
            expected: rows,
            got: out.len(),
        });
    }
    for r in 0..rows {
        out[r] = backend.vec_dot(&mat[r * cols..r * cols + cols], vec);
    }
    Ok(())
}

/// Classic triple loop: `a` is `m*k`, `b` is `k*n`, `out` is `m*n`. Column
/// access into `b` is strided (spec.md §4.5 notes this explicitly), so each
/// column is gathered into a small on-stack scratch buffer before calling
/// `vec_dot` on it, rather than threading a stride through the backend.
pub fn matmul(
    backend: &Backend,
    a: &[Fixed],
    m: usize,
    k: usize,
    b: &[Fixed],
    n: usize,
    out: &mut [Fixed],
) -> Result<(), FixedError> {
    if a.len() != m * k || b.len() != k * n || out.len() != m * n {
        return Err(FixedError::DimensionMismatch {
            expected: m * n,
            got: out.len(),
        });
    }
    const MAX_K: usize = 4096;
    if k > MAX_K {
        return Err(FixedError::DimensionMismatch { expected: MAX_K, got: k });
    }
    let mut col = [Fixed::ZERO; MAX_K];
    for col_idx in 0..n {
        for row_idx in 0..k {
            col[row_idx] = b[row_idx * n + col_idx];
        }
        for row in 0..m {
            let a_row = &a[row * k..row * k + k];
            out[row * n + col_idx] = backend.vec_dot(a_row, &col[..k]);
        }
    }
    Ok(())
}

pub fn elem_add(a: &[Fixed], b: &[Fixed], out: &mut [Fixed]) -> Result<(), FixedError> {
    if a.len() != b.len() || a.len() != out.len() {
        return Err(FixedError::DimensionMismatch {
            expected: a.len(),
            got: out.len(),
        });
    }
    for i in 0..a.len() {
        out[i] = a[i].add(b[i]);
    }
    Ok(())
}

pub fn elem_mul(a: &[Fixed], b: &[Fixed], out: &mut [Fixed]) -> Result<(), FixedError> {
    if a.len() != b.len() || a.len() != out.len() {
        return Err(FixedError::DimensionMismatch {
            expected: a.len(),
            got: out.len(),
        });
    }
    for i in 0..a.len() {
        out[i] = a[i].mul(b[i]);
    }
    Ok(())
}

/// Two-pass RMS normalization (spec.md §4.5). `ε` is folded into the
/// divisor so an all-zero `x` yields an all-zero `out` rather than a
/// division by zero.
pub fn rms_norm(out: &mut [Fixed], x: &[Fixed], weight: &[Fixed], n: usize) -> Result<(), FixedError> {
    if x.len() != n || weight.len() != n || out.len() != n {
        return Err(FixedError::DimensionMismatch { expected: n, got: x.len() });
    }
    if n == 0 {
        return Err(FixedError::EmptyVector);
    }
    let mut sum_sq: i64 = 0;
    for &xi in x {
        sum_sq += (xi.raw() as i64 * xi.raw() as i64) >> 16;
    }
    let mean_sq = sum_sq / n as i64;
    let rms = Fixed::from_raw(mean_sq.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
    let denom = rms.add(Fixed::from_raw(EPSILON));
    for i in 0..n {
        out[i] = x[i].div(denom).mul(weight[i]);
    }
    Ok(())
}

/// `1 + y + y² / 2^17`, the low-order approximation spec.md §4.5 names.
/// `mul` already divides by `2^16`; one further halving gives the `2^17`
/// denominator.
fn exp_approx(y: Fixed) -> Fixed {
    let y_sq_over_2 = Fixed::from_raw(y.mul(y).raw() >> 1);
    Fixed::ONE.add(y).add(y_sq_over_2)
}

/// Three-pass softmax (spec.md §4.5): find max, exponentiate the
/// max-subtracted input via [`exp_approx`], normalize by the sum.
pub fn softmax(x: &[Fixed], out: &mut [Fixed], n: usize) -> Result<(), FixedError> {
    if x.len() != n || out.len() != n {
        return Err(FixedError::DimensionMismatch { expected: n, got: x.len() });
    }
    if n == 0 {
        return Err(FixedError::EmptyVector);
    }
    let mut max = x[0];
    for &xi in &x[1..] {
        if xi > max {
            max = xi;
        }
    }
    let mut sum = Fixed::ZERO;
    for i in 0..n {
        let y = x[i].sub(max);
        out[i] = exp_approx(y);
        sum = sum.add(out[i]);
    }
    let denom = sum.add(Fixed::from_raw(EPSILON));
    for v in out.iter_mut().take(n) {
        *v = v.div(denom);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::simd::ScalarBackend;

    fn backend() -> Backend {
        Backend::Scalar(ScalarBackend)
    }

    #[test]
    fn vec_dot_rejects_mismatched_lengths() {
        let a = [Fixed::ONE; 3];
        let b = [Fixed::ONE; 2];
        assert!(vec_dot(&backend(), &a, &b).is_err());
    }

    #[test]
    fn matvec_one_dot_per_row() {
        let backend = backend();
        let mat = [Fixed::from_i32(1), Fixed::from_i32(2), Fixed::from_i32(3), Fixed::from_i32(4)];
        let vec = [Fixed::from_i32(1), Fixed::from_i32(1)];
        let mut out = [Fixed::ZERO; 2];
        matvec(&backend, &mat, 2, 2, &vec, &mut out).unwrap();
        assert_eq!(out[0].raw() / super::super::types::ONE, 3);
        assert_eq!(out[1].raw() / super::super::types::ONE, 7);
    }

    #[test]
    fn rms_norm_zero_input_yields_zero_output() {
        let x = [Fixed::ZERO; 4];
        let w = [Fixed::ONE; 4];
        let mut out = [Fixed::ZERO; 4];
        rms_norm(&mut out, &x, &w, 4).unwrap();
        for v in out {
            assert_eq!(v, Fixed::ZERO);
        }
    }

    #[test]
    fn softmax_largest_input_wins_and_sums_to_one() {
        let x = [Fixed::ONE, Fixed::ZERO, Fixed::ZERO, Fixed::ZERO];
        let mut out = [Fixed::ZERO; 4];
        softmax(&x, &mut out, 4).unwrap();
        let sum: i64 = out.iter().map(|v| v.raw() as i64).sum();
        let one = super::super::types::ONE as i64;
        assert!((sum - one).abs() < one / 100);
        assert!(out[0] > out[1]);
    }
}
