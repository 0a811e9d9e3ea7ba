//! Total least squares: `NY` residuals per sample.
//!
//! When a sample carries more residual rows than input dimensions, its
//! perturbation block is pre-triangularized before the factorization
//! proper. Only `NX` rows per sample then reach the block QR, and every
//! surplus row is folded into a dense `NP x NP` tail.

use ndarray::{Array1, ArrayD};

use crate::block_qr::{Blocks, Steps};
use crate::dense::DenseQr;
use crate::givens::{givens, rotate_pair, rotate_rows};
use crate::trust_region::{Dims, Linearization, Model, Report, SolverError, TrustRegionSolver};

/// Pre-triangularized copy of the committed Jacobian, used when `NY > NX`.
struct Prepared {
    /// One upper triangular `NX x NX` block per sample.
    j21: Vec<f64>,
    row: Vec<f64>,
    /// `MX*NX` sample rows followed by up to `NP + 1` tail rows.
    j22: Vec<f64>,
    qf: Vec<f64>,
    /// Dense rows handed to the factorization.
    k: usize,
    /// Retriangularizes the tail once `NP` surplus rows have piled up.
    tail: DenseQr,
}

impl Prepared {
    fn new(dims: Dims) -> Result<Self, SolverError> {
        let Dims { mx, nx, ny, np } = dims;
        let off = mx * nx;
        let rows = (mx * ny).min(off + np + 1);
        Ok(Self {
            j21: vec![0.0; mx * nx * nx],
            row: vec![0.0; nx],
            j22: vec![0.0; rows * np],
            qf: vec![0.0; rows],
            k: (mx * ny).min(off + np),
            tail: DenseQr::new(np, np)?,
        })
    }

    /// Rotates each sample's rows so that its `J21` block becomes triangular,
    /// accumulating the surplus rows into a triangular tail.
    fn prepare(&mut self, dims: Dims, j21: &[f64], j22: &[f64], f0: &[f64]) {
        let Dims { mx, nx, ny, np } = dims;
        let off = mx * nx;
        let mut tail = 0;

        for i in 0..mx {
            let bo = nx * nx * i;
            self.j21[bo..bo + nx * nx].copy_from_slice(&j21[nx * ny * i..nx * (ny * i + nx)]);
            self.j22[np * nx * i..np * nx * (i + 1)].copy_from_slice(&j22[np * ny * i..np * (ny * i + nx)]);
            self.qf[nx * i..nx * (i + 1)].copy_from_slice(&f0[off + ny * i..off + ny * i + nx]);

            // square part
            for j in 1..nx {
                for k in 0..j {
                    let jk = bo + nx * j + k;
                    let r = self.j21[jk];
                    if r == 0.0 {
                        continue;
                    }
                    let kk = bo + nx * k + k;
                    let (c, s, nrm) = givens(self.j21[kk], r);
                    self.j21[jk] = 0.0;
                    if s == 0.0 {
                        continue;
                    }
                    self.j21[kk] = nrm;
                    rotate_rows(&mut self.j21, nx - 1 - k, kk + 1, jk + 1, c, s);
                    rotate_rows(&mut self.j22, np, np * (nx * i + k), np * (nx * i + j), c, s);
                    rotate_rows(&mut self.qf, 1, nx * i + k, nx * i + j, c, s);
                }
            }

            // surplus rows
            for j in nx..ny {
                if tail == np {
                    self.tail.factor(&mut self.j22[off * np..], &mut self.qf[off..]);
                }
                let l = tail.min(np);
                tail += 1;

                let src = ny * i + j;
                self.row.copy_from_slice(&j21[nx * src..nx * (src + 1)]);
                self.j22[np * (off + l)..np * (off + l + 1)].copy_from_slice(&j22[np * src..np * (src + 1)]);
                self.qf[off + l] = f0[off + src];

                for k in 0..nx {
                    let r = self.row[k];
                    if r == 0.0 {
                        continue;
                    }
                    let kk = bo + nx * k + k;
                    let (c, s, nrm) = givens(self.j21[kk], r);
                    self.row[k] = 0.0;
                    if s == 0.0 {
                        continue;
                    }
                    self.j21[kk] = nrm;
                    rotate_pair(&mut self.j21[kk + 1..bo + nx * (k + 1)], &mut self.row[k + 1..], c, s);
                    rotate_rows(&mut self.j22, np, np * (nx * i + k), np * (off + l), c, s);
                    rotate_rows(&mut self.qf, 1, nx * i + k, off + l, c, s);
                }

                if l == np {
                    // fold the new row into the triangular tail
                    for k in 0..np {
                        let lk = np * (off + np) + k;
                        let r = self.j22[lk];
                        if r == 0.0 {
                            continue;
                        }
                        let kk = np * (off + k) + k;
                        let (c, s, nrm) = givens(self.j22[kk], r);
                        self.j22[lk] = 0.0;
                        if s == 0.0 {
                            continue;
                        }
                        self.j22[kk] = nrm;
                        rotate_rows(&mut self.j22, np - 1 - k, kk + 1, lk + 1, c, s);
                        rotate_rows(&mut self.qf, 1, off + k, off + np, c, s);
                    }
                }
            }
        }
    }
}

/// Trust-region solver for TLS problems with any number of residuals per sample.
pub struct TlsSolver<M> {
    lin: Linearization<M>,
    steps: Steps,
    prepared: Option<Prepared>,
    is_prepared: bool,
}

impl<M: Model> TlsSolver<M> {
    /// Evaluate `model` at `(p0, dx0)` and commit that point.
    pub fn new(model: M, p0: Array1<f64>, dx0: ArrayD<f64>) -> Result<Self, SolverError> {
        let lin = Linearization::new(model, p0, dx0)?;
        let dims = lin.dims;
        let (prepared, steps) = if dims.ny > dims.nx {
            let prepared = Prepared::new(dims)?;
            let steps = Steps::new(dims, dims.nx, prepared.k)?;
            (Some(prepared), steps)
        } else {
            (None, Steps::new(dims, dims.ny, dims.mx * dims.ny)?)
        };
        Ok(Self {
            lin,
            steps,
            prepared,
            is_prepared: false,
        })
    }

    /// Pre-triangularizes the sample blocks of the committed Jacobian.
    ///
    /// A no-op when `NY <= NX` or when already done for this point.
    pub fn prepare(&mut self) {
        if self.is_prepared {
            return;
        }
        if let Some(prepared) = self.prepared.as_mut() {
            log::trace!("tls: preparing {} samples", self.lin.dims.mx);
            prepared.prepare(self.lin.dims, &self.lin.j21, &self.lin.j22, &self.lin.f0);
        }
        self.is_prepared = true;
    }
}

/// Blocks to factor: the prepared copy when there is one, the raw Jacobian otherwise.
fn blocks<'a, M: Model>(lin: &'a Linearization<M>, prepared: Option<&'a Prepared>) -> Blocks<'a> {
    match prepared {
        Some(pre) => {
            let Dims { mx, nx, np, .. } = lin.dims;
            Blocks {
                mx,
                nx,
                np,
                l: nx,
                k: pre.k,
                j11: &lin.j11,
                j21: &pre.j21,
                j22: &pre.j22,
                f0: &lin.f0,
                f1: &pre.qf,
                d: &lin.d,
            }
        }
        None => lin.blocks(),
    }
}

impl<M: Model> TrustRegionSolver for TlsSolver<M> {
    fn dims(&self) -> Dims {
        self.lin.dims
    }

    fn loss(&self) -> f64 {
        self.lin.loss
    }

    fn position(&self) -> &[f64] {
        &self.lin.x0
    }

    fn gradient(&self) -> &[f64] {
        &self.lin.g0
    }

    fn scale(&self) -> &[f64] {
        &self.lin.d
    }

    fn scaled_norm(&self, x: &[f64]) -> Result<f64, SolverError> {
        self.lin.scaled_norm(x)
    }

    fn consider_move(&mut self, step: &[f64]) -> Result<(f64, f64), SolverError> {
        self.lin.consider(step)
    }

    fn make_considered_move(&mut self) -> Result<(), SolverError> {
        self.lin.commit()?;
        self.steps.reset();
        self.is_prepared = false;
        Ok(())
    }

    fn report(&mut self) -> Result<Report, SolverError> {
        self.lin.take_report()
    }

    fn cauchy_travel(&self) -> f64 {
        self.lin.cauchy_travel()
    }

    fn compute_newton(&mut self) -> Result<(), SolverError> {
        self.prepare();
        self.steps.newton(&blocks(&self.lin, self.prepared.as_ref()))
    }

    fn newton_step(&self) -> Option<&[f64]> {
        self.steps.newton_step()
    }

    fn rank(&self) -> Option<usize> {
        self.steps.rank(self.lin.dims.off())
    }

    fn compute_newton_regularized(&mut self, lambda: f64) -> Result<(f64, f64), SolverError> {
        self.prepare();
        self.steps.regularized(&blocks(&self.lin, self.prepared.as_ref()), lambda)
    }

    fn regularized_step(&self) -> Option<&[f64]> {
        self.steps.regularized_step()
    }
}
