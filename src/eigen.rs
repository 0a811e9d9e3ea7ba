//! Eigenvalues and eigenvectors from a real Schur decomposition.

use faer_core::{Mat, MatRef};
use num_complex::Complex64;

use crate::dense::FrobeniusNorm;
use crate::schur::{square_dim, to_row_major, Schur, SchurError};

/// Complex eigenvectors split into real and imaginary parts, one per column.
#[derive(Debug, Clone)]
pub struct EigenVectors {
    pub re: Mat<f64>,
    pub im: Mat<f64>,
}

impl EigenVectors {
    pub fn get(&self, row: usize, col: usize) -> Complex64 {
        Complex64::new(self.re.read(row, col), self.im.read(row, col))
    }

    /// Column `col` as a complex vector.
    pub fn column(&self, col: usize) -> Vec<Complex64> {
        (0..self.re.nrows()).map(|row| self.get(row, col)).collect()
    }
}

/// Eigenvalues and (unit norm) eigenvectors of the original matrix.
#[derive(Debug, Clone)]
pub struct Eigen {
    pub values: Vec<Complex64>,
    pub vectors: EigenVectors,
}

/// Eigenvalues of a quasi upper triangular matrix.
///
/// A 2x2 block `{i, i+1}` yields `tr/2 ± sqrt(disc)/2` with `i` taking the
/// `+` root. Blocks with a non-negative discriminant are rejected.
pub fn schur_eigenvalues(t: MatRef<'_, f64>) -> Result<Vec<Complex64>, SchurError> {
    let n = square_dim(t)?;
    let t = to_row_major(t);
    eigenvalues(n, &t)
}

/// Eigenvalues of every quasi triangular factor of a batch.
pub fn schur_eigenvalues_batch<'a, I>(batch: I) -> Result<Vec<Vec<Complex64>>, SchurError>
where
    I: IntoIterator<Item = MatRef<'a, f64>>,
{
    batch.into_iter().map(schur_eigenvalues).collect()
}

/// Eigenvalues and eigenvectors of `A = Q * T * Q^T`.
pub fn schur_eigen(q: MatRef<'_, f64>, t: MatRef<'_, f64>) -> Result<Eigen, SchurError> {
    let n = square_dim(t)?;
    if q.nrows() != n || q.ncols() != n {
        return Err(SchurError::DimensionMismatch {
            what: "q",
            expected: (n, n),
            actual: (q.nrows(), q.ncols()),
        });
    }
    let t = to_row_major(t);
    let values = eigenvalues(n, &t)?;
    let v = eigenvectors(n, &t, &values)?;

    // V <- Q * V
    let mut re = Mat::<f64>::zeros(n, n);
    let mut im = Mat::<f64>::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            let mut sum = Complex64::new(0.0, 0.0);
            for k in 0..n {
                sum += v[n * k + j] * q.read(i, k);
            }
            re.write(i, j, sum.re);
            im.write(i, j, sum.im);
        }
    }
    Ok(Eigen {
        values,
        vectors: EigenVectors { re, im },
    })
}

/// Applies [`schur_eigen`] to every decomposition of a batch.
pub fn schur_eigen_batch<'a, I>(batch: I) -> Result<Vec<Eigen>, SchurError>
where
    I: IntoIterator<Item = &'a Schur>,
{
    batch
        .into_iter()
        .map(|s| schur_eigen(s.q.as_ref(), s.t.as_ref()))
        .collect()
}

fn eigenvalues(n: usize, t: &[f64]) -> Result<Vec<Complex64>, SchurError> {
    let mut values = vec![Complex64::new(0.0, 0.0); n];
    let mut j = n;
    while j > 0 {
        j -= 1;
        if j == 0 || t[n * j + j - 1] == 0.0 {
            values[j] = Complex64::new(t[n * j + j], 0.0);
            continue;
        }
        let i = j - 1;
        let (pos, neg) = block_eigenvalues(n, t, i).ok_or(SchurError::InvalidSchurForm { index: i })?;
        values[i] = pos;
        values[j] = neg;
        j = i;
    }
    Ok(values)
}

/// Conjugate pair of the 2x2 block at `(i, i+1)`, `None` for a real pair.
fn block_eigenvalues(n: usize, t: &[f64], i: usize) -> Option<(Complex64, Complex64)> {
    let j = i + 1;
    let (t_ii, t_ij, t_ji, t_jj) = (t[n * i + i], t[n * i + j], t[n * j + i], t[n * j + j]);
    let diff = t_ii - t_jj;
    let disc = diff * diff + 4.0 * t_ij * t_ji;
    if disc >= 0.0 {
        return None;
    }
    let half = 0.5 * (t_ii + t_jj);
    let root = 0.5 * (-disc).sqrt();
    Some((Complex64::new(half, root), Complex64::new(half, -root)))
}

/// Columns of `T`'s eigenvectors (row-major, unit norm), before mapping through `Q`.
fn eigenvectors(n: usize, t: &[f64], values: &[Complex64]) -> Result<Vec<Complex64>, SchurError> {
    let tol = {
        let mut acc = FrobeniusNorm::new();
        for &x in t {
            acc.include(x);
        }
        f64::EPSILON.sqrt() * acc.result()
    };
    let solver = BackSubstitution { n, t, tol };

    let zero = Complex64::new(0.0, 0.0);
    let mut v = vec![zero; n * n];
    let mut v1 = vec![zero; n];
    let mut v2 = vec![zero; n];

    let mut j = n;
    while j > 0 {
        j -= 1;
        if j == 0 || t[n * j + j - 1] == 0.0 {
            let len = n.min(j + 2);
            v1[..len].fill(zero);
            v1[j] = Complex64::new(1.0, 0.0);
            solver.solve(values[j], &mut v1, j)?;
            for k in 0..len {
                v[n * k + j] = v1[k];
            }
            continue;
        }

        let i = j - 1;
        let (l1, l2) = (values[i], values[j]);
        let (t_ii, t_ij, t_ji, t_jj) = (t[n * i + i], t[n * i + j], t[n * j + i], t[n * j + j]);
        v1[..=j].fill(zero);
        v2[..=j].fill(zero);
        if t_ij.abs() >= t_ji.abs() {
            v1[i] = Complex64::new(t_ij, 0.0);
            v2[i] = Complex64::new(t_ij, 0.0);
            v1[j] = l1 - t_ii;
            v2[j] = l2 - t_ii;
        } else {
            v1[j] = Complex64::new(t_ji, 0.0);
            v2[j] = Complex64::new(t_ji, 0.0);
            v1[i] = l1 - t_jj;
            v2[i] = l2 - t_jj;
        }
        solver.solve(l1, &mut v1, i)?;
        solver.solve(l2, &mut v2, i)?;
        for k in 0..=j {
            v[n * k + i] = v1[k];
            v[n * k + j] = v2[k];
        }
        j = i;
    }

    normalize_columns(n, &mut v);
    Ok(v)
}

/// Backward substitution for `(T - λI) v = 0` above a seeded block.
struct BackSubstitution<'a> {
    n: usize,
    t: &'a [f64],
    tol: f64,
}

impl BackSubstitution<'_> {
    #[inline]
    fn t(&self, i: usize, j: usize) -> f64 {
        self.t[self.n * i + j]
    }

    /// Fills rows `[0, row)` of `v`, whose entries from `row` on are already set.
    fn solve(&self, lambda: Complex64, v: &mut [Complex64], row: usize) -> Result<(), SchurError> {
        let len = self.n.min(row + 2);
        let mut j = row;
        while j > 0 {
            j -= 1;
            for k in (j + 1..len).rev() {
                v[j] -= v[k] * self.t(j, k);
            }

            if j == 0 || self.t(j, j - 1) == 0.0 {
                let pivot = Complex64::new(self.t(j, j), 0.0) - lambda;
                if pivot.norm() <= self.tol {
                    if v[j].norm() <= self.tol {
                        // already solves the equation
                        v[j] = Complex64::new(0.0, 0.0);
                    } else {
                        // repeated eigenvalue without a second eigenvector
                        v[j] = Complex64::new(1.0, 0.0);
                        v[j + 1..len].fill(Complex64::new(0.0, 0.0));
                    }
                } else {
                    v[j] /= pivot;
                }
                continue;
            }

            let i = j - 1;
            for k in (j + 1..len).rev() {
                v[i] -= v[k] * self.t(i, k);
            }
            let t_ii = Complex64::new(self.t(i, i), 0.0) - lambda;
            let t_jj = Complex64::new(self.t(j, j), 0.0) - lambda;
            let t_ij = self.t(i, j);
            let t_ji = self.t(j, i);
            let det = t_ii * t_jj - t_ij * t_ji;
            if det.norm() == 0.0 {
                return Err(SchurError::SingularBlock { index: i });
            }
            let v_j = (t_ii * v[j] - v[i] * t_ji) / det;
            let v_i = (t_jj * v[i] - v[j] * t_ij) / det;
            v[j] = v_j;
            v[i] = v_i;
            j = i;
        }
        Ok(())
    }
}

/// Scales every column of the row-major complex `n x n` matrix to unit 2-norm.
fn normalize_columns(n: usize, v: &mut [Complex64]) {
    for j in 0..n {
        let mut acc = FrobeniusNorm::new();
        for i in 0..n {
            acc.include(v[n * i + j].re);
            acc.include(v[n * i + j].im);
        }
        let norm = acc.result();
        if norm == 0.0 {
            continue;
        }
        for i in 0..n {
            v[n * i + j] /= norm;
        }
    }
}
