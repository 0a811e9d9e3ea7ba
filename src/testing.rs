//! Oracles and synthetic models shared by the unit tests.

use dyn_stack::{GlobalPodBuffer, PodStack};
use faer_core::{mat, Mat, Parallelism};
use faer_svd::ComputeVectors;
use ndarray::{ArrayD, ArrayView1, ArrayViewD, IxDyn};
use rand::rngs::StdRng;
use rand::Rng;

use crate::trust_region::{Dims, Evaluation, Linearization, Model};

/// Minimum norm least squares solution of `A x = b` for the row-major
/// `rows x cols` matrix `a`, via a thin SVD.
pub fn lstsq(rows: usize, cols: usize, a: &[f64], b: &[f64]) -> Vec<f64> {
    let size = rows.min(cols);
    let mut x = vec![0.0; cols];
    if size == 0 {
        return x;
    }

    let a = mat::from_row_major_slice::<f64>(a, rows, cols);
    let mut s = Mat::<f64>::zeros(size, 1);
    let mut u = Mat::<f64>::zeros(rows, size);
    let mut v = Mat::<f64>::zeros(cols, size);
    let par = Parallelism::None;
    let req = faer_svd::compute_svd_req::<f64>(
        rows,
        cols,
        ComputeVectors::Thin,
        ComputeVectors::Thin,
        par,
        Default::default(),
    )
    .unwrap();
    let mut mem = GlobalPodBuffer::new(req);
    faer_svd::compute_svd(
        a,
        s.as_mut(),
        Some(u.as_mut()),
        Some(v.as_mut()),
        par,
        PodStack::new(&mut mem),
        Default::default(),
    );

    let cutoff = (0..size).map(|j| s.read(j, 0)).fold(0.0, f64::max) * rows.max(cols) as f64 * 1e-13;
    for j in 0..size {
        let sigma = s.read(j, 0);
        if sigma <= cutoff {
            continue;
        }
        let coef = (0..rows).map(|i| u.read(i, j) * b[i]).sum::<f64>() / sigma;
        for (i, xi) in x.iter_mut().enumerate() {
            *xi += v.read(i, j) * coef;
        }
    }
    x
}

/// Random `rows x cols` matrix of rank at most `rank`.
pub fn rank_deficient(rng: &mut StdRng, rows: usize, cols: usize, rank: usize) -> Vec<f64> {
    let a: Vec<f64> = (0..rows * rank).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let b: Vec<f64> = (0..rank * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let mut out = vec![0.0; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[cols * i + j] = (0..rank).map(|t| a[rank * i + t] * b[cols * t + j]).sum();
        }
    }
    out
}

/// Dense row-major copy of the committed Jacobian.
pub(crate) fn dense_jacobian<M: Model>(lin: &Linearization<M>) -> Vec<f64> {
    let (m, n) = (lin.dims.rows(), lin.dims.unknowns());
    let mut j = vec![0.0; m * n];
    for r in 0..m {
        for c in 0..n {
            j[n * r + c] = lin.jacobian_entry(r, c);
        }
    }
    j
}

/// Expected `D·X` of the Newton step, `-lstsq(J·D⁻¹, F0)`, zero entries of `D` taken as 1.
pub(crate) fn newton_oracle<M: Model>(lin: &Linearization<M>) -> Vec<f64> {
    let (m, n) = (lin.dims.rows(), lin.dims.unknowns());
    let d: Vec<f64> = lin.d.iter().map(|&d| if d == 0.0 { 1.0 } else { d }).collect();
    let mut j = dense_jacobian(lin);
    for r in 0..m {
        for c in 0..n {
            j[n * r + c] /= d[c];
        }
    }
    lstsq(m, n, &j, &lin.f0).iter().map(|x| -x).collect()
}

/// `D·x` with zero entries of `D` taken as 1.
pub(crate) fn scaled<M: Model>(lin: &Linearization<M>, x: &[f64]) -> Vec<f64> {
    x.iter()
        .zip(&lin.d)
        .map(|(x, &d)| if d == 0.0 { *x } else { x * d })
        .collect()
}

/// Expected regularized step, `-lstsq([J; D·√λ], [F0; 0])`.
pub(crate) fn regularized_oracle<M: Model>(lin: &Linearization<M>, lambda: f64) -> Vec<f64> {
    let (m, n) = (lin.dims.rows(), lin.dims.unknowns());
    let mut a = dense_jacobian(lin);
    let mut b = lin.f0.clone();
    for (c, &d) in lin.d.iter().enumerate() {
        let mut row = vec![0.0; n];
        row[c] = d * lambda.sqrt();
        a.extend(row);
        b.push(0.0);
    }
    lstsq(m + n, n, &a, &b).iter().map(|x| -x).collect()
}

pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

fn shape(mx: usize, n: usize, flat: bool) -> Vec<usize> {
    if flat {
        vec![mx]
    } else {
        vec![mx, n]
    }
}

/// Model that is affine in `(p, Δx)`, with fixed random Jacobian blocks.
pub struct Affine {
    pub dims: Dims,
    pub flat_x: bool,
    pub flat_y: bool,
    pub r0: Vec<f64>,
    pub j21: Vec<f64>,
    pub j22: Vec<f64>,
}

impl Affine {
    /// `rank` limits the rank of the dense block, `sparse` toggles the coupling to `Δx`.
    pub fn random(rng: &mut StdRng, dims: Dims, rank: Option<usize>, sparse: bool) -> Self {
        let Dims { mx, nx, ny, np } = dims;
        let rows = mx * ny;
        let j22 = match rank {
            Some(rank) => rank_deficient(rng, rows, np, rank),
            None => (0..rows * np).map(|_| rng.gen_range(-1.0..1.0)).collect(),
        };
        let j21 = (0..rows * nx)
            .map(|_| if sparse { rng.gen_range(-1.0..1.0) } else { 0.0 })
            .collect();
        Self {
            dims,
            flat_x: nx == 1,
            flat_y: ny == 1,
            r0: (0..rows).map(|_| rng.gen_range(-1.0..1.0)).collect(),
            j21,
            j22,
        }
    }

    pub fn dx_shape(&self) -> Vec<usize> {
        shape(self.dims.mx, self.dims.nx, self.flat_x)
    }
}

impl Model for Affine {
    fn evaluate(&mut self, p: ArrayView1<'_, f64>, dx: ArrayViewD<'_, f64>) -> Evaluation {
        let Dims { mx, nx, ny, np } = self.dims;
        let dx: Vec<f64> = dx.iter().copied().collect();
        let mut residual = self.r0.clone();
        for i in 0..mx {
            for j in 0..ny {
                let row = ny * i + j;
                for k in 0..nx {
                    residual[row] += self.j21[nx * row + k] * dx[nx * i + k];
                }
                for k in 0..np {
                    residual[row] += self.j22[np * row + k] * p[k];
                }
            }
        }
        let y = shape(mx, ny, self.flat_y);
        let mut jp = y.clone();
        jp.push(np);
        let mut jx = y.clone();
        if !self.flat_x {
            jx.push(nx);
        }
        Evaluation {
            residual: ArrayD::from_shape_vec(IxDyn(&y), residual).unwrap(),
            jacobian_p: ArrayD::from_shape_vec(IxDyn(&jp), self.j22.clone()).unwrap(),
            jacobian_dx: ArrayD::from_shape_vec(IxDyn(&jx), self.j21.clone()).unwrap(),
        }
    }
}

/// Nonlinear model: `f_ij = Σ_k sin(p_a * x'_ik) + p_b * x'_i0² - y_ij` with
/// `x' = x + Δx`, `a = (j + k) % NP` and `b = j % NP`.
pub struct Wavy {
    pub dims: Dims,
    pub flat_x: bool,
    pub flat_y: bool,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Wavy {
    pub fn random(rng: &mut StdRng, dims: Dims) -> Self {
        let Dims { mx, nx, ny, .. } = dims;
        Self {
            dims,
            flat_x: nx == 1,
            flat_y: ny == 1,
            x: (0..mx * nx).map(|_| rng.gen_range(-1.0..1.0)).collect(),
            y: (0..mx * ny).map(|_| rng.gen_range(-1.0..1.0)).collect(),
        }
    }

    pub fn dx_shape(&self) -> Vec<usize> {
        shape(self.dims.mx, self.dims.nx, self.flat_x)
    }
}

impl Model for Wavy {
    fn evaluate(&mut self, p: ArrayView1<'_, f64>, dx: ArrayViewD<'_, f64>) -> Evaluation {
        let Dims { mx, nx, ny, np } = self.dims;
        let xs: Vec<f64> = dx.iter().zip(&self.x).map(|(d, x)| x + d).collect();
        let mut residual = vec![0.0; mx * ny];
        let mut jp = vec![0.0; mx * ny * np];
        let mut jx = vec![0.0; mx * ny * nx];
        for i in 0..mx {
            for j in 0..ny {
                let row = ny * i + j;
                let b = j % np;
                let x0 = xs[nx * i];
                let mut f = p[b] * x0 * x0 - self.y[row];
                jp[np * row + b] += x0 * x0;
                jx[nx * row] += 2.0 * p[b] * x0;
                for k in 0..nx {
                    let a = (j + k) % np;
                    let xk = xs[nx * i + k];
                    f += (p[a] * xk).sin();
                    jp[np * row + a] += (p[a] * xk).cos() * xk;
                    jx[nx * row + k] += (p[a] * xk).cos() * p[a];
                }
                residual[row] = f;
            }
        }
        let y = shape(mx, ny, self.flat_y);
        let mut jp_shape = y.clone();
        jp_shape.push(np);
        let mut jx_shape = y.clone();
        if !self.flat_x {
            jx_shape.push(nx);
        }
        Evaluation {
            residual: ArrayD::from_shape_vec(IxDyn(&y), residual).unwrap(),
            jacobian_p: ArrayD::from_shape_vec(IxDyn(&jp_shape), jp).unwrap(),
            jacobian_dx: ArrayD::from_shape_vec(IxDyn(&jx_shape), jx).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn lstsq_matches_normal_equations() {
        let mut rng = StdRng::seed_from_u64(3);
        let (rows, cols) = (7, 3);
        let a: Vec<f64> = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let b: Vec<f64> = (0..rows).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let x = lstsq(rows, cols, &a, &b);
        // residual orthogonal to the columns
        for j in 0..cols {
            let mut dot = 0.0;
            for i in 0..rows {
                let r: f64 = (0..cols).map(|k| a[cols * i + k] * x[k]).sum::<f64>() - b[i];
                dot += a[cols * i + j] * r;
            }
            assert!(dot.abs() < 1e-12);
        }
    }

    #[test]
    fn lstsq_returns_the_minimum_norm_solution() {
        let mut rng = StdRng::seed_from_u64(5);
        let (rows, cols, rank) = (6, 4, 2);
        let u: Vec<f64> = (0..rows * rank).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let w: Vec<f64> = (0..rank * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut a = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                a[cols * i + j] = (0..rank).map(|t| u[rank * i + t] * w[cols * t + j]).sum();
            }
        }
        let b: Vec<f64> = (0..rows).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let x = lstsq(rows, cols, &a, &b);

        // x lies in the row space of A, spanned by the rows of w
        let mut wt = vec![0.0; cols * rank];
        for t in 0..rank {
            for j in 0..cols {
                wt[rank * j + t] = w[cols * t + j];
            }
        }
        let c = lstsq(cols, rank, &wt, &x);
        for j in 0..cols {
            let back: f64 = (0..rank).map(|t| wt[rank * j + t] * c[t]).sum();
            assert!((back - x[j]).abs() < 1e-10);
        }
        for j in 0..cols {
            let mut dot = 0.0;
            for i in 0..rows {
                let r: f64 = (0..cols).map(|k| a[cols * i + k] * x[k]).sum::<f64>() - b[i];
                dot += a[cols * i + j] * r;
            }
            assert!(dot.abs() < 1e-10);
        }
    }
}
