//! Plane rotations.
//!
//! Every rotation in this crate follows one convention: for a pair of rows
//! (or entries) `i`, `j` and a rotation `(c, s)`,
//!
//! ```text
//! x_i <- c * x_i + s * x_j
//! x_j <- c * x_j - s * x_i
//! ```
//!
//! so `givens(a, b)` applied to `(a, b)` yields `(norm, 0)`.

/// Compute `(c, s, norm)` with `c * a + s * b == norm` and `c * b - s * a == 0`.
///
/// `b == 0` returns `(1, 0, a)`, leaving the sign of `a` untouched. Otherwise
/// `norm` is the (overflow safe) positive hypotenuse.
#[inline]
pub fn givens(a: f64, b: f64) -> (f64, f64, f64) {
    if b == 0.0 {
        return (1.0, 0.0, a);
    }
    let norm = a.hypot(b);
    (a / norm, b / norm, norm)
}

/// Rotate `len` consecutive entries starting at offsets `i` and `j` of `buf`.
#[inline]
pub fn rotate_rows(buf: &mut [f64], len: usize, i: usize, j: usize, c: f64, s: f64) {
    for t in 0..len {
        let x_i = buf[i + t];
        let x_j = buf[j + t];
        buf[i + t] = c * x_i + s * x_j;
        buf[j + t] = c * x_j - s * x_i;
    }
}

/// Rotate two columns `i`, `j` of a row-major matrix over the rows `rows`.
#[inline]
pub fn rotate_cols(
    buf: &mut [f64],
    stride: usize,
    rows: core::ops::Range<usize>,
    i: usize,
    j: usize,
    c: f64,
    s: f64,
) {
    for r in rows {
        let x_i = buf[stride * r + i];
        let x_j = buf[stride * r + j];
        buf[stride * r + i] = c * x_i + s * x_j;
        buf[stride * r + j] = c * x_j - s * x_i;
    }
}

/// Rotate two equally long slices living in different buffers.
#[inline]
pub fn rotate_pair(x: &mut [f64], y: &mut [f64], c: f64, s: f64) {
    debug_assert_eq!(x.len(), y.len());
    for (x_i, x_j) in x.iter_mut().zip(y.iter_mut()) {
        let a = *x_i;
        let b = *x_j;
        *x_i = c * a + s * b;
        *x_j = c * b - s * a;
    }
}
