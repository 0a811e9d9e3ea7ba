//! Structured QR factorization of the block-sparse ODR/TLS Jacobian.
//!
//! ```text
//!     [ J11    0  ]        J11: diagonal, MX*NX x MX*NX
//! J = [           ]        J21: block diagonal, one L x NX block per sample
//!     [ J21   J22 ]        J22: dense, K x NP
//! ```
//!
//! Rows of `J21`/`J22` are grouped per sample (`L` rows each); `J22` may carry
//! additional dense rows below the `MX*L` sample rows. The factorization is
//!
//! ```text
//! J = Q * [ R11  R12 ] * V * D
//!         [  0   R22 ]
//! ```
//!
//! with `R11` block upper triangular. Only the diagonal of `R11` is stored;
//! its off-diagonal entries and `R12` are linear combinations of `J21` and
//! `J22` rows whose coefficients are kept in `R21`. `R22` comes from a rank
//! revealing QR with permutation `P`. When `R22` is rank deficient, its
//! dependent columns are eliminated with extra rotations (`V`), whose sines
//! are stored in the otherwise unused upper right part of `R22`, in the
//! `D`-scaled coordinates.

use crate::dense::{triu_solve, triu_t_solve, DenseQr, FrobeniusNorm};
use crate::givens::{givens, rotate_rows};
use crate::trust_region::{Dims, SolverError};

/// Read-only view of the blocks to be factored.
#[derive(Clone, Copy)]
pub(crate) struct Blocks<'a> {
    pub mx: usize,
    pub nx: usize,
    pub np: usize,
    /// Rows per sample in `j21`/`j22`.
    pub l: usize,
    /// Rows of the dense part, `MX*L` plus any extra rows.
    pub k: usize,
    pub j11: &'a [f64],
    /// `j21[NX*(L*i + j) + k]`
    pub j21: &'a [f64],
    /// `j22[NP*row + k]`
    pub j22: &'a [f64],
    /// Residuals of the perturbation rows (first `MX*NX` entries used).
    pub f0: &'a [f64],
    /// Right-hand side of the `k` dense rows.
    pub f1: &'a [f64],
    /// Column scaling.
    pub d: &'a [f64],
}

impl Blocks<'_> {
    fn off(&self) -> usize {
        self.mx * self.nx
    }

    fn n(&self) -> usize {
        self.mx * self.nx + self.np
    }
}

/// Factors and solution of one (regularized) solve.
#[derive(Debug, Clone)]
struct Factorization {
    r11: Vec<f64>,
    r21: Vec<f64>,
    r22: Vec<f64>,
    perm: Vec<usize>,
    /// Numerical rank of `R22` once factored.
    rank: Option<usize>,
    dx: Vec<f64>,
}

impl Factorization {
    fn new(mx: usize, nx: usize, np: usize, l: usize, k: usize) -> Self {
        Self {
            r11: vec![0.0; mx * nx],
            r21: vec![0.0; mx * l * nx],
            r22: vec![0.0; k.max(np + 1) * np],
            perm: (0..np).collect(),
            rank: None,
            dx: vec![0.0; mx * nx + np],
        }
    }
}

/// Scratch buffers shared by the factorization and both solves.
struct Workspace {
    /// `Q^T * F`, plus one scratch row for the regularization.
    qf: Vec<f64>,
    /// Right-hand side of the transposed solve.
    y: Vec<f64>,
    /// Block rotation tracker, `L*(L+3)/2` entries.
    q: Vec<f64>,
    /// Pivoted QR of the reduced `K x NP` dense block.
    dense: DenseQr,
    tmp: Vec<f64>,
}

impl Workspace {
    fn new(mx: usize, nx: usize, np: usize, l: usize, k: usize) -> Result<Self, SolverError> {
        let n = mx * nx + np;
        Ok(Self {
            qf: vec![0.0; (mx * nx + k).max(n + 1)],
            y: vec![0.0; n],
            q: vec![0.0; l * (l + 3) / 2],
            dense: DenseQr::new(k, np)?,
            tmp: vec![0.0; np],
        })
    }
}

/// Newton and regularized factorizations of one committed Jacobian.
///
/// The two live in disjoint buffers, so trying several damping values never
/// invalidates the cached Newton step.
pub(crate) struct Steps {
    newton: Factorization,
    regularized: Factorization,
    has_regularized: bool,
    workspace: Workspace,
}

impl Steps {
    pub fn new(dims: Dims, l: usize, k: usize) -> Result<Self, SolverError> {
        let Dims { mx, nx, np, .. } = dims;
        Ok(Self {
            newton: Factorization::new(mx, nx, np, l, k),
            regularized: Factorization::new(mx, nx, np, l, k),
            has_regularized: false,
            workspace: Workspace::new(mx, nx, np, l, k)?,
        })
    }

    /// Forget both factorizations after a commit.
    pub fn reset(&mut self) {
        self.newton.rank = None;
        self.has_regularized = false;
    }

    pub fn newton(&mut self, b: &Blocks<'_>) -> Result<(), SolverError> {
        if self.newton.rank.is_some() {
            return Ok(());
        }
        newton(b, &mut self.newton, &mut self.workspace)
    }

    pub fn regularized(&mut self, b: &Blocks<'_>, lambda: f64) -> Result<(f64, f64), SolverError> {
        if lambda.is_nan() || lambda < 0.0 {
            return Err(SolverError::InvalidDamping(lambda));
        }
        if lambda == 0.0 {
            self.newton(b)?;
        }
        self.has_regularized = false;
        let out = regularized(b, &self.newton, &mut self.regularized, lambda, &mut self.workspace)?;
        self.has_regularized = true;
        Ok(out)
    }

    pub fn newton_step(&self) -> Option<&[f64]> {
        self.newton.rank.map(|_| self.newton.dx.as_slice())
    }

    /// Rank of the full Jacobian, `MX*NX` plus the rank of `R22`.
    pub fn rank(&self, off: usize) -> Option<usize> {
        self.newton.rank.map(|rank| off + rank)
    }

    pub fn regularized_step(&self) -> Option<&[f64]> {
        self.has_regularized.then_some(self.regularized.dx.as_slice())
    }
}

/// Eliminates `J21` against the diagonal of `R11` sample by sample, then
/// RRQR-factors the reduced dense block. `f.r11` must hold the diagonal to
/// eliminate against and `qf` the right-hand side. Returns the rank of `R22`.
fn decompose(b: &Blocks<'_>, f: &mut Factorization, ws: &mut Workspace) -> Result<usize, SolverError> {
    let Blocks { mx, nx, np, l, k, .. } = *b;
    let off = b.off();
    let q = &mut ws.q;
    let qf = &mut ws.qf;

    for i in 0..mx {
        // q[..l]: coefficients of the current R11 row in terms of the sample's J21 rows.
        // q[l..]: lower triangular coefficients of the sample's residual rows.
        q[l..].fill(0.0);
        for t in 1..=l {
            q[l - 1 + t * (t + 1) / 2] = 1.0;
        }

        for col in 0..nx {
            q[..l].fill(0.0);
            let mut r1 = f.r11[nx * i + col];
            for j in 0..l {
                let q_off = l + j * (j + 1) / 2;
                let mut r2 = 0.0;
                for t in 0..=j {
                    r2 += q[q_off + t] * b.j21[nx * (l * i + t) + col];
                }
                if r2 == 0.0 {
                    continue;
                }
                let (c, s, nrm) = givens(r1, r2);
                r1 = nrm;
                if s == 0.0 {
                    continue;
                }
                rotate_rows(q, j + 1, 0, q_off, c, s);
                rotate_rows(qf, 1, nx * i + col, off + l * i + j, c, s);
            }
            if r1 == 0.0 {
                return Err(SolverError::SingularSparseBlock { sample: i, column: col });
            }
            f.r11[nx * i + col] = r1;
            for j in 0..l {
                f.r21[nx * (l * i + j) + col] = q[j];
            }
        }

        let rows = &mut f.r22[np * l * i..np * l * (i + 1)];
        rows.fill(0.0);
        for j in 0..l {
            let q_off = l + j * (j + 1) / 2;
            for t in 0..=j {
                let coef = q[q_off + t];
                if coef == 0.0 {
                    continue;
                }
                let src = &b.j22[np * (l * i + t)..np * (l * i + t + 1)];
                for (dst, &x) in rows[np * j..np * (j + 1)].iter_mut().zip(src) {
                    *dst += coef * x;
                }
            }
        }
    }
    f.r22[mx * l * np..k * np].copy_from_slice(&b.j22[mx * l * np..k * np]);

    let rank = ws
        .dense
        .factor_pivoted(&mut f.r22[..k * np], &mut qf[off..off + k], &mut f.perm);
    f.r22[np * rank..np * k.min(np)].fill(0.0);
    Ok(rank)
}

/// Solves `R * V * D * x = x` in place for the factors of `f` (rank `rnk` of `R22`).
fn solve(b: &Blocks<'_>, f: &Factorization, rnk: usize, x: &mut [f64], ws: &mut Workspace) {
    let Blocks { mx, nx, np, l, .. } = *b;
    let off = b.off();

    triu_solve(rnk, np, &f.r22, &mut x[off..]);

    if rnk != np {
        for i in 0..rnk {
            for j in rnk..np {
                let s = f.r22[np * i + j];
                if s == 0.0 {
                    continue;
                }
                let c = (1.0 - s * s).sqrt();
                rotate_rows(x, 1, off + j, off + i, c, s);
            }
        }
    }

    let tmp = &mut ws.tmp;
    for i in 0..np {
        tmp[f.perm[i]] = x[off + i];
    }
    x[off..off + np].copy_from_slice(tmp);

    if rnk != np {
        for i in 0..np {
            let d = b.d[off + i];
            if d != 0.0 {
                x[off + i] /= d;
            }
        }
    }

    // R12 rows are combinations of J22 rows: move the parameter part right.
    for i in (0..mx).rev() {
        for j in (0..l).rev() {
            let row = l * i + j;
            let mut xj = 0.0;
            for t in 0..np {
                xj += b.j22[np * row + t] * x[off + t];
            }
            for t in 0..nx {
                x[nx * i + t] -= xj * f.r21[nx * row + t];
            }
        }
    }

    let jx = &mut ws.q[..l];
    for i in (0..mx).rev() {
        jx.fill(0.0);
        for t in (0..nx).rev() {
            let it = nx * i + t;
            for j in 0..l {
                x[it] -= f.r21[nx * (l * i + j) + t] * jx[j];
            }
            x[it] /= f.r11[it];
            for j in 0..l {
                jx[j] += b.j21[nx * (l * i + j) + t] * x[it];
            }
        }
    }
}

/// Solves the transposed system `(R * V)^T y = y` in place (first `MX*NX + rnk` entries).
fn rt_solve(b: &Blocks<'_>, f: &Factorization, rnk: usize, y: &mut [f64], ws: &mut Workspace) {
    let Blocks { mx, nx, np, l, .. } = *b;
    let off = b.off();
    let tmp = &mut ws.tmp;
    let sx = &mut ws.q[..l];

    tmp.fill(0.0);
    for i in 0..mx {
        sx.fill(0.0);
        for t in 0..nx {
            let it = nx * i + t;
            for j in 0..l {
                y[it] -= b.j21[nx * (l * i + j) + t] * sx[j];
            }
            y[it] /= f.r11[it];
            for j in 0..l {
                sx[j] += f.r21[nx * (l * i + j) + t] * y[it];
            }
        }
        for j in 0..l {
            for t in 0..np {
                tmp[t] += sx[j] * b.j22[np * (l * i + j) + f.perm[t]];
            }
        }
    }

    if rnk < np {
        for i in 0..np {
            let d = b.d[off + f.perm[i]];
            if d != 0.0 {
                tmp[i] /= d;
            }
        }
        for i in (0..rnk).rev() {
            for j in (rnk..np).rev() {
                let s = f.r22[np * i + j];
                if s == 0.0 {
                    continue;
                }
                let c = (1.0 - s * s).sqrt();
                rotate_rows(tmp, 1, i, j, c, s);
            }
        }
    }

    for j in 0..rnk {
        y[off + j] -= tmp[j];
    }
    triu_t_solve(rnk, np, &f.r22, &mut y[off..]);
}

fn load_rhs(b: &Blocks<'_>, ws: &mut Workspace) {
    let off = b.off();
    ws.qf[..off].copy_from_slice(&b.f0[..off]);
    ws.qf[off..off + b.k].copy_from_slice(&b.f1[..b.k]);
}

/// Gauss-Newton step: the minimum `‖D·x‖` solution of `min ‖J·x + F‖`.
fn newton(b: &Blocks<'_>, f: &mut Factorization, ws: &mut Workspace) -> Result<(), SolverError> {
    let np = b.np;
    let off = b.off();

    f.r11.copy_from_slice(b.j11);
    load_rhs(b, ws);
    let rnk = decompose(b, f, ws)?;

    for i in 0..off + rnk {
        f.dx[i] = -ws.qf[i];
    }

    if rnk != np {
        log::debug!("trust region: dense block is rank deficient ({rnk} of {np})");
        f.dx[off + rnk..off + np].fill(0.0);

        // scale the factor, then rotate the dependent columns away
        for j in 0..np {
            let d = b.d[off + f.perm[j]];
            if d != 0.0 {
                for i in 0..rnk {
                    f.r22[np * i + j] /= d;
                }
            }
        }
        for i in (0..rnk).rev() {
            let ii = np * i + i;
            for j in (rnk..np).rev() {
                let ij = np * i + j;
                let r_ij = f.r22[ij];
                if r_ij == 0.0 {
                    continue;
                }
                let (mut c, mut s, mut nrm) = givens(f.r22[ii], r_ij);
                if s != 0.0 {
                    // stored sines are decoded with c = sqrt(1 - s²)
                    if c < 0.0 {
                        c = -c;
                        s = -s;
                        nrm = -nrm;
                    }
                    for k in 0..i {
                        let r_ki = f.r22[np * k + i];
                        let r_kj = f.r22[np * k + j];
                        f.r22[np * k + i] = r_kj * s + c * r_ki;
                        f.r22[np * k + j] = r_kj * c - s * r_ki;
                    }
                    f.r22[ii] = nrm;
                }
                f.r22[ij] = s;
            }
        }
    }

    let mut dx = std::mem::take(&mut f.dx);
    solve(b, f, rnk, &mut dx, ws);
    f.dx = dx;
    f.rank = Some(rnk);
    Ok(())
}

/// Scaled norm `‖D·x‖`.
pub(crate) fn scaled_norm(d: &[f64], x: &[f64]) -> f64 {
    let mut acc = FrobeniusNorm::new();
    for (&di, &xi) in d.iter().zip(x) {
        acc.include(di * xi);
    }
    acc.result()
}

/// Levenberg-Marquardt step for damping `lambda`, returning `(r, dr/dλ)` with
/// `r = ‖D·x‖`.
///
/// `lambda == 0` reuses the factors of `newton` (which must be computed);
/// otherwise `reg` is refactored from scratch with `diag(D·√λ)` rows
/// appended, `1` standing in where `D` is zero.
fn regularized(
    b: &Blocks<'_>,
    newton: &Factorization,
    reg: &mut Factorization,
    lambda: f64,
    ws: &mut Workspace,
) -> Result<(f64, f64), SolverError> {
    let np = b.np;
    let n = b.n();
    let off = b.off();

    if lambda == 0.0 {
        let rnk = newton.rank.unwrap_or(np);
        reg.dx.copy_from_slice(&newton.dx);
        let r = scaled_norm(b.d, &reg.dx);
        if r == 0.0 {
            return Ok((0.0, 0.0));
        }

        let mut y = std::mem::take(&mut ws.y);
        if rnk < np {
            for i in 0..np {
                let j = off + newton.perm[i];
                y[off + i] = reg.dx[j] * b.d[j];
            }
            for i in (0..rnk).rev() {
                for j in (rnk..np).rev() {
                    let s = newton.r22[np * i + j];
                    if s == 0.0 {
                        continue;
                    }
                    let c = (1.0 - s * s).sqrt();
                    rotate_rows(&mut y, 1, off + i, off + j, c, s);
                }
            }
        } else {
            for i in 0..np {
                let j = off + newton.perm[i];
                y[off + i] = reg.dx[j] * b.d[j] * b.d[j];
            }
        }
        for i in 0..off {
            y[i] = reg.dx[i] * b.d[i] * b.d[i];
        }
        rt_solve(b, newton, rnk, &mut y, ws);

        let dr = -y[..off + rnk].iter().map(|v| v * v).sum::<f64>() / r;
        ws.y = y;
        return Ok((r, dr));
    }

    let sqrt_lambda = lambda.sqrt();
    reg.r11.copy_from_slice(b.j11);
    load_rhs(b, ws);

    // The perturbation columns are regularized in closed form.
    for i in 0..off {
        let d = b.d[i] * sqrt_lambda;
        if d.is_nan() || d <= 0.0 {
            return Err(SolverError::NonPositiveScale { index: i });
        }
        let (c, _, nrm) = givens(reg.r11[i], d);
        reg.r11[i] = nrm;
        ws.qf[i] *= c;
    }

    let rnk = decompose(b, reg, ws)?;
    let tail = np * np;
    for row in b.k..=np {
        reg.r22[np * row..np * (row + 1)].fill(0.0);
    }

    for i in (0..np).rev() {
        let d = b.d[off + reg.perm[i]];
        let d = if d == 0.0 { 1.0 } else { d * sqrt_lambda };
        if d.is_nan() || d <= 0.0 {
            return Err(SolverError::NonPositiveScale { index: off + reg.perm[i] });
        }

        if rnk <= i {
            reg.r22[np * i + i] = d;
            ws.qf[off + i] = 0.0;
            continue;
        }

        // eliminate the appended row, kept in row NP of R22 and entry N of qf
        reg.r22[tail + i] = d;
        ws.qf[n] = 0.0;
        for j in i..np {
            let jj = np * j + j;
            let ij = tail + j;
            let (c, s, nrm) = givens(reg.r22[jj], reg.r22[ij]);
            reg.r22[ij] = 0.0;
            if s == 0.0 {
                continue;
            }
            reg.r22[jj] = nrm;
            rotate_rows(&mut reg.r22, np - j - 1, jj + 1, ij + 1, c, s);
            rotate_rows(&mut ws.qf, 1, off + j, n, c, s);
        }
    }

    let mut dx = std::mem::take(&mut reg.dx);
    for i in 0..n {
        dx[i] = -ws.qf[i];
    }
    solve(b, reg, np, &mut dx, ws);
    reg.dx = dx;
    reg.rank = Some(np);

    let r = scaled_norm(b.d, &reg.dx);
    if r == 0.0 {
        return Ok((0.0, 0.0));
    }

    let mut y = std::mem::take(&mut ws.y);
    for i in 0..np {
        let j = off + reg.perm[i];
        y[off + i] = reg.dx[j] * b.d[j] * b.d[j];
    }
    for i in 0..off {
        y[i] = reg.dx[i] * b.d[i] * b.d[i];
    }
    rt_solve(b, reg, np, &mut y, ws);
    let dr = -y.iter().map(|v| v * v).sum::<f64>() / r;
    ws.y = y;
    Ok((r, dr))
}
