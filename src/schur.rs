use core::fmt;

use faer_core::{Mat, MatRef};

use crate::dense::StackError;
use crate::francis::francis_in_place;
use crate::hessenberg;

/// Default seed of the generator behind the exceptional shifts.
///
/// Decompositions are bit-reproducible for a fixed seed.
pub const SHIFT_SEED: u64 = 0x6e64_2e6c_612e_7363;

/// Errors raised by the Schur decomposition and eigen extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum SchurError {
    /// The input matrix is not square.
    NotSquare { nrows: usize, ncols: usize },
    /// Two inputs that must share a shape do not.
    DimensionMismatch {
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    /// A 2x2 diagonal block has real eigenvalues, so the input is not in real Schur form.
    InvalidSchurForm { index: usize },
    /// A 2x2 block of the back-substitution became singular (repeated complex pair).
    SingularBlock { index: usize },
    /// The window `[start, end)` did not deflate within the iteration budget.
    TooManyIterations { start: usize, end: usize },
    WorkspaceOverflow,
    WorkspaceAlloc,
}

impl fmt::Display for SchurError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSquare { nrows, ncols } => {
                write!(f, "matrix is not square: {nrows}x{ncols}")
            }
            Self::DimensionMismatch {
                what,
                expected,
                actual,
            } => write!(
                f,
                "{what} has shape {}x{}, expected {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            Self::InvalidSchurForm { index } => write!(
                f,
                "2x2 block at {index} has real eigenvalues; not a real Schur form"
            ),
            Self::SingularBlock { index } => {
                write!(f, "singular 2x2 block at {index} during back-substitution")
            }
            Self::TooManyIterations { start, end } => {
                write!(f, "too many iterations for window [{start}, {end})")
            }
            Self::WorkspaceOverflow => write!(f, "workspace size overflow"),
            Self::WorkspaceAlloc => write!(f, "workspace allocation failed"),
        }
    }
}

impl std::error::Error for SchurError {}

impl From<StackError> for SchurError {
    fn from(err: StackError) -> Self {
        match err {
            StackError::Overflow => Self::WorkspaceOverflow,
            StackError::Alloc => Self::WorkspaceAlloc,
        }
    }
}

/// Options controlling the Francis QR iteration.
#[derive(Debug, Clone)]
pub struct SchurOptions {
    /// Seed for the exceptional-shift generator.
    pub seed: u64,
    /// Abort once a single window needs more non-deflating iterations than this.
    pub max_iterations: u64,
}

impl Default for SchurOptions {
    fn default() -> Self {
        Self {
            seed: SHIFT_SEED,
            max_iterations: 1_000_000_000,
        }
    }
}

/// Real Schur decomposition `A = Q * T * Q^T`.
#[derive(Debug, Clone)]
pub struct Schur {
    /// Orthogonal factor.
    pub q: Mat<f64>,
    /// Quasi upper triangular factor.
    pub t: Mat<f64>,
}

/// Real Schur decomposition with default options.
pub fn schur_decompose(a: MatRef<'_, f64>) -> Result<Schur, SchurError> {
    schur_decompose_with(a, &SchurOptions::default())
}

/// Real Schur decomposition: Hessenberg reduction followed by Francis QR.
///
/// The input is not modified. Real eigenvalues end up on the diagonal of `T`;
/// complex conjugate pairs stay as 2x2 blocks with a negative discriminant.
pub fn schur_decompose_with(a: MatRef<'_, f64>, options: &SchurOptions) -> Result<Schur, SchurError> {
    let n = square_dim(a)?;
    let (q, h) = hessenberg::reduce(a)?;
    let mut h = to_row_major(h.as_ref());
    let mut qt = to_row_major(q.as_ref().transpose());
    francis_in_place(n, &mut h, &mut qt, options)?;
    Ok(Schur {
        q: Mat::from_fn(n, n, |i, j| qt[n * j + i]),
        t: from_row_major(n, &h),
    })
}

/// Decomposes every matrix of a batch independently.
pub fn schur_decompose_batch<'a, I>(batch: I, options: &SchurOptions) -> Result<Vec<Schur>, SchurError>
where
    I: IntoIterator<Item = MatRef<'a, f64>>,
{
    batch
        .into_iter()
        .map(|a| schur_decompose_with(a, options))
        .collect()
}

/// Householder reduction `A = Q * H * Q^T` with `H` upper Hessenberg.
pub fn hessenberg_decompose(a: MatRef<'_, f64>) -> Result<(Mat<f64>, Mat<f64>), SchurError> {
    square_dim(a)?;
    Ok(hessenberg::reduce(a)?)
}

/// Francis QR on a Hessenberg matrix `h`, accumulating into `q`.
///
/// `q` normally holds the Hessenberg reduction's orthogonal factor, so that
/// on return `A = Q * T * Q^T` still holds. The Hessenberg property of `h`
/// is not checked. On error both matrices are left untouched.
pub fn francis_qr_in_place(
    q: &mut Mat<f64>,
    h: &mut Mat<f64>,
    options: &SchurOptions,
) -> Result<(), SchurError> {
    let n = square_dim(h.as_ref())?;
    if q.nrows() != n || q.ncols() != n {
        return Err(SchurError::DimensionMismatch {
            what: "q",
            expected: (n, n),
            actual: (q.nrows(), q.ncols()),
        });
    }
    let mut hh = to_row_major(h.as_ref());
    let mut qt = to_row_major(q.as_ref().transpose());
    francis_in_place(n, &mut hh, &mut qt, options)?;
    for i in 0..n {
        for j in 0..n {
            h.write(i, j, hh[n * i + j]);
            q.write(i, j, qt[n * j + i]);
        }
    }
    Ok(())
}

pub(crate) fn square_dim(a: MatRef<'_, f64>) -> Result<usize, SchurError> {
    if a.nrows() != a.ncols() {
        return Err(SchurError::NotSquare {
            nrows: a.nrows(),
            ncols: a.ncols(),
        });
    }
    Ok(a.nrows())
}

pub(crate) fn to_row_major(a: MatRef<'_, f64>) -> Vec<f64> {
    let (m, n) = (a.nrows(), a.ncols());
    let mut out = Vec::with_capacity(m * n);
    for i in 0..m {
        for j in 0..n {
            out.push(a.read(i, j));
        }
    }
    out
}

pub(crate) fn from_row_major(n: usize, data: &[f64]) -> Mat<f64> {
    Mat::from_fn(n, n, |i, j| data[n * i + j])
}
