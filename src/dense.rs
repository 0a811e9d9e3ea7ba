//! Dense building blocks: scaled norms, (rank revealing) QR and triangular solves.
//!
//! Matrices are row-major slices with an explicit row stride. Only the
//! leading `rows x cols` part is touched. The factorizations run through faer
//! on a column-major copy.

use dyn_stack::{GlobalPodBuffer, PodStack, ReborrowMut};
use faer_core::householder::{
    apply_block_householder_sequence_transpose_on_the_left_in_place_req,
    apply_block_householder_sequence_transpose_on_the_left_in_place_with_conj,
};
use faer_core::{mat, solve, Conj, Mat, MatRef, Parallelism};
use faer_qr::{col_pivoting, no_pivoting};

/// Frobenius / 2-norm accumulator that rescales on the fly to avoid overflow.
#[derive(Debug, Clone, Copy)]
pub struct FrobeniusNorm {
    max: f64,
    sum: f64,
}

impl FrobeniusNorm {
    pub fn new() -> Self {
        Self { max: 0.0, sum: 0.0 }
    }

    pub fn reset(&mut self) {
        self.max = 0.0;
        self.sum = 0.0;
    }

    pub fn include(&mut self, x: f64) {
        let x = x.abs();
        if x.is_nan() {
            self.sum = f64::NAN;
            return;
        }
        if x > self.max {
            if self.max > 0.0 && self.max.is_finite() {
                let ratio = self.max / x;
                self.sum *= ratio * ratio;
            }
            self.max = x;
        }
        if self.max > 0.0 && self.max.is_finite() {
            let ratio = x / self.max;
            self.sum += ratio * ratio;
        }
    }

    pub fn result(&self) -> f64 {
        if self.sum.is_nan() {
            f64::NAN
        } else if self.max.is_finite() {
            self.max * self.sum.sqrt()
        } else {
            self.max
        }
    }
}

impl Default for FrobeniusNorm {
    fn default() -> Self {
        Self::new()
    }
}

/// Scratch memory for a [`DenseQr`] could not be provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    Overflow,
    Alloc,
}

/// Householder QR of a dense `rows x cols` block, with or without column pivoting.
///
/// The block is passed row-major with row stride `cols`. On return it holds
/// `R` with every entry below the diagonal set to zero, and `Q^T` has been
/// applied to the right-hand side. Factors and scratch memory are allocated
/// once and reused across calls.
pub(crate) struct DenseQr {
    rows: usize,
    cols: usize,
    factors: Mat<f64>,
    householder: Mat<f64>,
    perm_inv: Vec<usize>,
    stack: GlobalPodBuffer,
}

impl DenseQr {
    pub fn new(rows: usize, cols: usize) -> Result<Self, StackError> {
        let size = rows.min(cols);
        let blocksize = no_pivoting::compute::recommended_blocksize::<f64>(rows, cols)
            .min(size)
            .max(1);

        let plain = no_pivoting::compute::qr_in_place_req::<f64>(
            rows,
            cols,
            blocksize,
            Parallelism::None,
            Default::default(),
        )
        .map_err(|_| StackError::Overflow)?;
        let pivoted = col_pivoting::compute::qr_in_place_req::<usize, f64>(
            rows,
            cols,
            blocksize,
            Parallelism::None,
            Default::default(),
        )
        .map_err(|_| StackError::Overflow)?;
        let apply =
            apply_block_householder_sequence_transpose_on_the_left_in_place_req::<f64>(rows, blocksize, 1)
                .map_err(|_| StackError::Overflow)?;
        let req = plain
            .try_or(pivoted)
            .and_then(|req| req.try_or(apply))
            .map_err(|_| StackError::Overflow)?;

        Ok(Self {
            rows,
            cols,
            factors: Mat::zeros(rows, cols),
            householder: Mat::zeros(blocksize, size),
            perm_inv: vec![0; cols],
            stack: GlobalPodBuffer::try_new(req).map_err(|_| StackError::Alloc)?,
        })
    }

    /// Unpivoted factorization of `a` with `rhs[..rows] <- Q^T rhs[..rows]`.
    pub fn factor(&mut self, a: &mut [f64], rhs: &mut [f64]) {
        if self.rows == 0 || self.cols == 0 {
            return;
        }
        self.load(a);
        let mut stack = PodStack::new(&mut self.stack);
        no_pivoting::compute::qr_in_place(
            self.factors.as_mut(),
            self.householder.as_mut(),
            Parallelism::None,
            stack.rb_mut(),
            Default::default(),
        );
        self.apply_qt(rhs);
        self.store(a);
    }

    /// Column-pivoted factorization of `a`; returns the numerical rank.
    ///
    /// `perm[k]` receives the original column placed at position `k`. The rank
    /// counts leading diagonal entries above `|R_00| * max(rows, cols) * 128 * eps`.
    pub fn factor_pivoted(&mut self, a: &mut [f64], rhs: &mut [f64], perm: &mut [usize]) -> usize {
        const RANK_EPS: f64 = 128.0 * f64::EPSILON;

        let perm = &mut perm[..self.cols];
        for (i, p) in perm.iter_mut().enumerate() {
            *p = i;
        }
        if self.rows == 0 || self.cols == 0 {
            return 0;
        }
        self.load(a);
        let mut stack = PodStack::new(&mut self.stack);
        col_pivoting::compute::qr_in_place(
            self.factors.as_mut(),
            self.householder.as_mut(),
            &mut *perm,
            &mut self.perm_inv,
            Parallelism::None,
            stack.rb_mut(),
            Default::default(),
        );
        self.apply_qt(rhs);
        self.store(a);

        let size = self.rows.min(self.cols);
        let tol = self.factors.read(0, 0).abs() * self.rows.max(self.cols) as f64 * RANK_EPS;
        (0..size)
            .position(|k| !(self.factors.read(k, k).abs() > tol))
            .unwrap_or(size)
    }

    fn load(&mut self, a: &[f64]) {
        let cols = self.cols;
        for i in 0..self.rows {
            for j in 0..cols {
                self.factors.write(i, j, a[cols * i + j]);
            }
        }
    }

    fn store(&self, a: &mut [f64]) {
        let cols = self.cols;
        for i in 0..self.rows {
            for j in 0..cols {
                a[cols * i + j] = if j >= i { self.factors.read(i, j) } else { 0.0 };
            }
        }
    }

    fn apply_qt(&mut self, rhs: &mut [f64]) {
        let (rows, size) = (self.rows, self.rows.min(self.cols));
        let mut stack = PodStack::new(&mut self.stack);
        apply_block_householder_sequence_transpose_on_the_left_in_place_with_conj(
            self.factors.as_ref().submatrix(0, 0, rows, size),
            self.householder.as_ref(),
            Conj::Yes,
            mat::from_column_major_slice_mut::<f64>(&mut rhs[..rows], rows, 1),
            Parallelism::None,
            stack.rb_mut(),
        );
    }
}

/// Solve `R[..n, ..n] z = x[..n]` in place for upper triangular `R` with row stride `stride`.
pub fn triu_solve(n: usize, stride: usize, r: &[f64], x: &mut [f64]) {
    if n == 0 {
        return;
    }
    solve::solve_upper_triangular_in_place(
        leading_block(n, stride, r),
        mat::from_column_major_slice_mut::<f64>(&mut x[..n], n, 1),
        Parallelism::None,
    );
}

/// Solve `R[..n, ..n]^T z = x[..n]` in place for upper triangular `R`.
pub fn triu_t_solve(n: usize, stride: usize, r: &[f64], x: &mut [f64]) {
    if n == 0 {
        return;
    }
    solve::solve_lower_triangular_in_place(
        leading_block(n, stride, r).transpose(),
        mat::from_column_major_slice_mut::<f64>(&mut x[..n], n, 1),
        Parallelism::None,
    );
}

fn leading_block(n: usize, stride: usize, r: &[f64]) -> MatRef<'_, f64> {
    mat::from_row_major_slice::<f64>(&r[..stride * n], n, stride).submatrix(0, 0, n, n)
}
