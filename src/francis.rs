//! Implicit double-shift (Francis) QR iteration on upper Hessenberg matrices.
//!
//! The iteration works on an active window `[start, end)` of `H`. Negligible
//! subdiagonal entries deflate the window from either end; an interior
//! negligible entry splits off the smaller part, which is solved by a nested
//! call on that sub-block with its own small orthogonal accumulator. The
//! accumulator is applied to the rest of `H` and to the outer accumulator once
//! the nested call returns, so auxiliary memory stays proportional to the
//! size of the split-off block.
//!
//! The accumulator is stored transposed (`Q^T`): every rotation applied to
//! `H` from the left is applied to rows of `Q^T`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::givens::{givens, rotate_cols, rotate_rows};
use crate::schur::{SchurError, SchurOptions};

/// Deflation tolerance relative to the two neighbouring diagonal entries.
const TOL: f64 = f64::EPSILON;

/// Non-deflating iterations between two exceptional shifts.
const EXCEPTIONAL_SHIFT_PERIOD: u64 = 16;

/// A square sub-block of `H` (row stride `stride`, first entry at `off`)
/// together with the transposed accumulator `qt` of the same size.
struct Window<'a> {
    h: &'a mut [f64],
    stride: usize,
    off: usize,
    qt: &'a mut [f64],
    n: usize,
}

impl Window<'_> {
    #[inline]
    fn h(&self, i: usize, j: usize) -> f64 {
        self.h[self.off + self.stride * i + j]
    }

    #[inline]
    fn h_mut(&mut self, i: usize, j: usize) -> &mut f64 {
        &mut self.h[self.off + self.stride * i + j]
    }

    /// Absolute row index of the window's first row in the full matrix.
    fn base(&self) -> usize {
        self.off / (self.stride + 1)
    }

    /// Tests `H[i, i-1]` for deflation and flushes it when negligible.
    ///
    /// Anything that small is cancellation noise; NaN falls through to the
    /// flush branch as well.
    fn is_zero(&mut self, i: usize) -> bool {
        let sub = self.h(i, i - 1);
        if sub.abs() > TOL * (self.h(i - 1, i - 1).abs() + self.h(i, i).abs()) {
            return false;
        }
        *self.h_mut(i, i - 1) *= 0.0;
        true
    }

    /// Two-sided rotation of rows/columns `i < j` of `H`, accumulated into `Q^T`.
    fn rotate(&mut self, i: usize, j: usize, c: f64, s: f64) {
        debug_assert!(i < j);
        let (n, stride) = (self.n, self.stride);
        let lo = i.saturating_sub(1);
        let h = &mut self.h[self.off..];
        rotate_rows(h, n - lo, stride * i + lo, stride * j + lo, c, s);
        rotate_cols(h, stride, 0..n.min(j + 2), i, j, c, s);
        rotate_rows(self.qt, n, n * i, n * j, c, s);
    }

    /// Solves the sub-block `[s, e)` with a nested iteration and a local
    /// accumulator, then applies that accumulator to everything outside the
    /// sub-block.
    fn recurse(&mut self, s: usize, e: usize, options: &SchurOptions) -> Result<(), SchurError> {
        let n = e - s;
        debug_assert!(n <= self.n / 2, "nested block must be the smaller half");
        debug_assert!(n >= 3);
        log::debug!(
            "francis: nested decomposition of [{}, {})",
            self.base() + s,
            self.base() + e
        );

        let mut q = vec![0.0; n * n];
        for i in 0..n {
            q[n * i + i] = 1.0;
        }
        {
            let mut inner = Window {
                h: &mut *self.h,
                stride: self.stride,
                off: self.off + self.stride * s + s,
                qt: &mut q,
                n,
            };
            inner.run(options)?;
        }

        // Rows [s, e) of Q^T, and of H right of the block, get q from the left.
        let outer_n = self.n;
        let mut tmp = vec![0.0; n];
        for col in 0..outer_n {
            for k in 0..n {
                let mut sum = 0.0;
                for j in 0..n {
                    sum += q[n * k + j] * self.qt[outer_n * (s + j) + col];
                }
                tmp[k] = sum;
            }
            for k in 0..n {
                self.qt[outer_n * (s + k) + col] = tmp[k];
            }
        }
        for col in e..outer_n {
            for k in 0..n {
                let mut sum = 0.0;
                for j in 0..n {
                    sum += q[n * k + j] * self.h(s + j, col);
                }
                tmp[k] = sum;
            }
            for k in 0..n {
                *self.h_mut(s + k, col) = tmp[k];
            }
        }
        // Columns [s, e) of H above the block get q^T from the right.
        for row in 0..s {
            for k in 0..n {
                let mut sum = 0.0;
                for j in 0..n {
                    sum += q[n * k + j] * self.h(row, s + j);
                }
                tmp[k] = sum;
            }
            for k in 0..n {
                *self.h_mut(row, s + k) = tmp[k];
            }
        }
        Ok(())
    }

    fn run(&mut self, options: &SchurOptions) -> Result<(), SchurError> {
        let n = self.n;
        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut stuck: u64 = 0;
        let mut start = 0;
        let mut end = n;

        loop {
            let mut done = false;
            while !done {
                if end - start < 3 {
                    return Ok(());
                }
                if end - start < n >> 4 {
                    return self.recurse(start, end, options);
                }

                if self.is_zero(start + 1) {
                    start += 1;
                } else if self.is_zero(end - 1) {
                    end -= 1;
                } else if self.is_zero(start + 2) {
                    start += 2;
                } else if self.is_zero(end - 2) {
                    end -= 2;
                } else {
                    done = true;
                }

                let mid = (start + end) / 2;
                let mut i = start + 2;
                while done {
                    i += 1;
                    if i + 2 >= end {
                        break;
                    }
                    if self.is_zero(i) {
                        done = false;
                        if i > mid {
                            self.recurse(i, end, options)?;
                            end = i;
                        } else {
                            self.recurse(start, i, options)?;
                            start = i;
                        }
                    }
                }

                if !done {
                    stuck = 0;
                }
            }
            stuck += 1;

            let (tr, det) = self.shift(start, end, stuck, &mut rng, options)?;
            self.double_shift_step(start, end, tr, det);
        }
    }

    /// Trace and determinant of the double shift for the current window.
    fn shift(
        &self,
        start: usize,
        end: usize,
        stuck: u64,
        rng: &mut StdRng,
        options: &SchurOptions,
    ) -> Result<(f64, f64), SchurError> {
        let i = end - 2;
        let j = end - 1;
        let mut tr = self.h(i, i) + self.h(j, j);
        let mut det = self.h(i, i) * self.h(j, j) - self.h(i, j) * self.h(j, i);

        // Real pair: use the eigenvalue closer to H[j, j] twice.
        if tr * tr > 4.0 * det {
            let sign = if tr >= 0.0 { 1.0 } else { -1.0 };
            let root = tr + sign * (tr * tr - 4.0 * det).sqrt();
            let mut ev = 0.5 * root;
            let ev2 = det * 2.0 / root;
            if (self.h(j, j) - ev).abs() > (self.h(j, j) - ev2).abs() {
                ev = ev2;
            }
            tr = ev * 2.0;
            det = ev * ev;
        }

        if stuck % EXCEPTIONAL_SHIFT_PERIOD == 0 {
            if stuck > options.max_iterations {
                return Err(SchurError::TooManyIterations {
                    start: self.base() + start,
                    end: self.base() + end,
                });
            }
            tr = self.h(j, i).abs() + self.h(i, end - 3).abs();
            det = tr * tr;
            tr *= rng.gen_range(1.25..1.75);
            log::trace!(
                "francis: exceptional shift after {stuck} iterations on [{}, {})",
                self.base() + start,
                self.base() + end
            );
        }
        Ok((tr, det))
    }

    /// Introduces the bulge from the first column of `H² - tr·H + det·I` and
    /// chases it out of the window.
    fn double_shift_step(&mut self, start: usize, end: usize, tr: f64, det: f64) {
        let i = start;
        let mut j = start + 1;
        let k = start + 2;
        let mut a1 =
            self.h(i, i) * self.h(i, i) + self.h(i, j) * self.h(j, i) - tr * self.h(i, i) + det;
        let mut a2 = self.h(j, i) * (self.h(i, i) + self.h(j, j) - tr);
        let a3 = self.h(j, i) * self.h(k, j);

        for _ in 0..2 {
            if a2 != 0.0 {
                let (c, s, norm) = givens(a1, a2);
                self.rotate(i, j, c, s);
                a1 = norm;
            }
            j = k;
            a2 = a3;
        }

        for col in start..end - 2 {
            let i = col + 1;
            for j in col + 2..end.min(col + 4) {
                let h_i = self.h(i, col);
                let h_j = self.h(j, col);
                if h_j == 0.0 {
                    continue;
                }
                let (c, s, _) = givens(h_i, h_j);
                self.rotate(i, j, c, s);
                *self.h_mut(j, col) *= 0.0;
            }
        }
    }
}

/// Runs the Francis iteration on the `n x n` Hessenberg matrix `h` and
/// accumulates into the transposed orthogonal factor `qt`, then splits every
/// remaining 2x2 block with real eigenvalues.
pub(crate) fn francis_in_place(
    n: usize,
    h: &mut [f64],
    qt: &mut [f64],
    options: &SchurOptions,
) -> Result<(), SchurError> {
    debug_assert_eq!(h.len(), n * n);
    debug_assert_eq!(qt.len(), n * n);
    {
        let mut window = Window {
            h: &mut *h,
            stride: n,
            off: 0,
            qt: &mut *qt,
            n,
        };
        window.run(options)?;
    }
    resolve_real_blocks(n, h, qt);
    Ok(())
}

/// Turns each 2x2 diagonal block with a non-negative discriminant into two
/// 1x1 blocks.
///
/// The rotation angle solves `A·sin(2α) + B·cos(2α) = C` with
/// `A = Hjj - Hii`, `B = Hij + Hji`, `C = Hij - Hji`, in closed form
/// `α = atan2(A ± sqrt(A² + 4·Hij·Hji), 2·Hij)`.
fn resolve_real_blocks(n: usize, h: &mut [f64], qt: &mut [f64]) {
    for j in 1..n {
        let i = j - 1;
        if h[n * j + i] == 0.0 {
            continue;
        }
        let h_ii = h[n * i + i];
        let h_ij = h[n * i + j];
        let h_ji = h[n * j + i];
        let h_jj = h[n * j + j];

        let a = h_jj - h_ii;
        let disc = a * a + 4.0 * h_ij * h_ji;
        if disc < 0.0 {
            continue;
        }

        let (c, s) = if h_ij == 0.0 {
            (0.0, 1.0)
        } else {
            let t = a + if a < 0.0 { -1.0 } else { 1.0 } * disc.sqrt();
            let r = 2.0 * h_ij;
            let tr = t.hypot(r);
            let s = if r < 0.0 { -t } else { t } / tr;
            (r.abs() / tr, s)
        };

        for k in i..n {
            let x_i = h[n * i + k];
            let x_j = h[n * j + k];
            h[n * i + k] = s * x_j + c * x_i;
            h[n * j + k] = c * x_j - s * x_i;
        }
        for k in 0..=j {
            let x_i = h[n * k + i];
            let x_j = h[n * k + j];
            h[n * k + i] = s * x_j + c * x_i;
            h[n * k + j] = c * x_j - s * x_i;
        }
        for k in 0..n {
            let q_i = qt[n * i + k];
            let q_j = qt[n * j + k];
            qt[n * i + k] = s * q_j + c * q_i;
            qt[n * j + k] = c * q_j - s * q_i;
        }
        h[n * j + i] *= 0.0;
    }
}
