//! Shared state of the orthogonal distance regression (ODR) and total least
//! squares (TLS) trust-region solvers.
//!
//! Both minimize the mean squared error over the parameters `p` and the
//! per-sample input perturbations `Δx`:
//!
//! ```text
//! loss(p, Δx) = (Σ Δx² + Σ f(p, Δx)²) / M,    M = MX*NX + MX*NY
//! ```
//!
//! The unknowns are stacked as `X = [Δx; p]` and the residuals as
//! `F = [Δx; f(p, Δx)]`, so the Jacobian has the block structure described in
//! the `block_qr` module.

use core::fmt;

use ndarray::{Array1, ArrayD, ArrayView1, ArrayViewD, IxDyn};

use crate::block_qr::{self, Blocks};
use crate::dense::{FrobeniusNorm, StackError};

/// Errors raised by the trust-region solvers.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverError {
    /// An input or a model output has an inconsistent shape.
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// A step (or vector to measure) does not have one entry per unknown.
    StepLength { expected: usize, actual: usize },
    /// The perturbation block of the Jacobian is singular.
    SingularSparseBlock { sample: usize, column: usize },
    /// A protocol method was called in the wrong report state.
    OutOfSequence {
        operation: &'static str,
        state: ReportState,
    },
    /// The damping parameter is negative or NaN.
    InvalidDamping(f64),
    /// A scale entry needed for damping is not positive.
    NonPositiveScale { index: usize },
    /// Too many consecutive trial steps failed to decrease the loss.
    NoProgress { rejected: usize },
    WorkspaceOverflow,
    WorkspaceAlloc,
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch {
                what,
                expected,
                actual,
            } => write!(f, "{what} has shape {actual:?}, expected {expected:?}"),
            Self::StepLength { expected, actual } => {
                write!(f, "step length {actual} does not match expected {expected}")
            }
            Self::SingularSparseBlock { sample, column } => write!(
                f,
                "perturbation block is singular at sample {sample}, column {column}"
            ),
            Self::OutOfSequence { operation, state } => {
                write!(f, "{operation} called out of sequence (report state: {state})")
            }
            Self::InvalidDamping(lambda) => write!(f, "invalid damping parameter: {lambda}"),
            Self::NonPositiveScale { index } => {
                write!(f, "scale entry {index} is not positive")
            }
            Self::NoProgress { rejected } => {
                write!(f, "too many unsuccessful iterations ({rejected} in a row)")
            }
            Self::WorkspaceOverflow => write!(f, "workspace size overflow"),
            Self::WorkspaceAlloc => write!(f, "workspace allocation failed"),
        }
    }
}

impl std::error::Error for SolverError {}

impl From<StackError> for SolverError {
    fn from(err: StackError) -> Self {
        match err {
            StackError::Overflow => Self::WorkspaceOverflow,
            StackError::Alloc => Self::WorkspaceAlloc,
        }
    }
}

/// Lifecycle of the evaluation report.
///
/// `Empty -> consider_move -> Considering -> make_considered_move -> Ready -> report -> Empty`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    Empty,
    Considering,
    Ready,
}

impl fmt::Display for ReportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Considering => "considering",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Evaluation of the model at one point, as drained by `report()`.
#[derive(Debug, Clone)]
pub struct Report {
    pub p: Array1<f64>,
    pub dx: ArrayD<f64>,
    /// Mean squared error.
    pub loss: f64,
    pub dloss_dp: Array1<f64>,
    pub dloss_ddx: ArrayD<f64>,
    pub residual: ArrayD<f64>,
}

/// Output of a [`Model`] evaluation.
///
/// With `residual` of shape `[MX]` or `[MX, NY]`, `jacobian_p` has shape
/// `residual.shape + [NP]` and `jacobian_dx` has shape `residual.shape`
/// (1-D `Δx`) or `residual.shape + [NX]` (2-D `Δx`).
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub residual: ArrayD<f64>,
    pub jacobian_p: ArrayD<f64>,
    pub jacobian_dx: ArrayD<f64>,
}

/// Residuals and derivatives of the fitted model.
pub trait Model {
    /// Evaluate the residuals and their derivatives w.r.t. `p` and `Δx`.
    fn evaluate(&mut self, p: ArrayView1<'_, f64>, dx: ArrayViewD<'_, f64>) -> Evaluation;
}

impl<F> Model for F
where
    F: FnMut(ArrayView1<'_, f64>, ArrayViewD<'_, f64>) -> Evaluation,
{
    fn evaluate(&mut self, p: ArrayView1<'_, f64>, dx: ArrayViewD<'_, f64>) -> Evaluation {
        self(p, dx)
    }
}

/// Problem dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    /// Number of samples.
    pub mx: usize,
    /// Input dimensions per sample.
    pub nx: usize,
    /// Residuals per sample.
    pub ny: usize,
    /// Number of parameters.
    pub np: usize,
}

impl Dims {
    /// Number of residual rows, `MX*NX + MX*NY`.
    pub fn rows(&self) -> usize {
        self.mx * (self.nx + self.ny)
    }

    /// Number of unknowns, `MX*NX + NP`.
    pub fn unknowns(&self) -> usize {
        self.mx * self.nx + self.np
    }

    /// Offset of the parameters within `X`.
    pub(crate) fn off(&self) -> usize {
        self.mx * self.nx
    }
}

/// Interface shared by [`crate::OdrSolver`] and [`crate::TlsSolver`].
///
/// Steps are full length vectors over `X = [Δx; p]`. The
/// [`fit`](crate::fit()) driver only talks to solvers through this trait.
pub trait TrustRegionSolver {
    fn dims(&self) -> Dims;

    /// Loss at the committed point.
    fn loss(&self) -> f64;

    /// Committed point `X0 = [Δx; p]`.
    fn position(&self) -> &[f64];

    /// Gradient of half the squared error at `X0`, `G0 = J^T F0`.
    fn gradient(&self) -> &[f64];

    /// Column scaling `D`, never decreasing between commits.
    fn scale(&self) -> &[f64];

    /// `‖D·x‖`.
    fn scaled_norm(&self, x: &[f64]) -> Result<f64, SolverError>;

    /// Evaluate the model at `X0 + step` without committing.
    ///
    /// Returns `(predicted_loss, loss)` where the prediction uses the
    /// committed linearization.
    fn consider_move(&mut self, step: &[f64]) -> Result<(f64, f64), SolverError>;

    /// Commit the last considered evaluation.
    fn make_considered_move(&mut self) -> Result<(), SolverError>;

    /// Drain the committed evaluation. Only valid once per commit.
    fn report(&mut self) -> Result<Report, SolverError>;

    /// Step length `t` along `G0` minimizing the quadratic model at `X0 + t·G0`.
    ///
    /// `0` for a zero gradient, `-∞` if the model is flat along the gradient.
    fn cauchy_travel(&self) -> f64;

    /// Gauss-Newton step for the committed point. Idempotent until the next commit.
    fn compute_newton(&mut self) -> Result<(), SolverError>;

    /// Result of [`compute_newton`](Self::compute_newton).
    fn newton_step(&self) -> Option<&[f64]>;

    /// Numerical rank of `J` found by [`compute_newton`](Self::compute_newton).
    fn rank(&self) -> Option<usize>;

    /// Levenberg-Marquardt step for damping `lambda >= 0`.
    ///
    /// Returns `(r, dr)` with `r = ‖D·step‖` and `dr = dr/dλ`. The Newton
    /// factorization is never invalidated by this call.
    fn compute_newton_regularized(&mut self, lambda: f64) -> Result<(f64, f64), SolverError>;

    /// Result of the last [`compute_newton_regularized`](Self::compute_newton_regularized).
    fn regularized_step(&self) -> Option<&[f64]>;

    /// Called by the driver after `rejected` consecutive trial steps failed to
    /// decrease the loss.
    ///
    /// Returning `Ok` lets the driver carry on from the committed point with a
    /// fresh count. The default gives up.
    fn wiggle(&mut self, rejected: usize) -> Result<(), SolverError> {
        Err(SolverError::NoProgress { rejected })
    }
}

/// Expected shapes of inputs and model outputs.
#[derive(Debug, Clone)]
struct Shapes {
    x: Vec<usize>,
    residual: Vec<usize>,
    jacobian_p: Vec<usize>,
    jacobian_dx: Vec<usize>,
}

impl Shapes {
    /// Derive the dimensions from `p0`, `dx0` and the first evaluation.
    fn infer(p0: &Array1<f64>, dx0: &ArrayD<f64>, eval: &Evaluation) -> Result<(Dims, Self), SolverError> {
        let x = dx0.shape().to_vec();
        if x.is_empty() || x.len() > 2 {
            return Err(SolverError::ShapeMismatch {
                what: "dx0",
                expected: x.iter().copied().take(2).collect(),
                actual: x,
            });
        }
        let mx = x[0];
        let nx = x.get(1).copied().unwrap_or(1);
        let np = p0.len();

        let y = eval.residual.shape();
        if y.is_empty() || y.len() > 2 || y[0] != mx {
            let mut expected = vec![mx];
            expected.extend(y.get(1).copied());
            return Err(SolverError::ShapeMismatch {
                what: "residual",
                expected,
                actual: y.to_vec(),
            });
        }
        let ny = y.get(1).copied().unwrap_or(1);

        let residual = y.to_vec();
        let mut jacobian_p = residual.clone();
        jacobian_p.push(np);
        let mut jacobian_dx = residual.clone();
        if x.len() == 2 {
            jacobian_dx.push(nx);
        }
        let shapes = Self {
            x,
            residual,
            jacobian_p,
            jacobian_dx,
        };
        shapes.check(eval)?;
        Ok((Dims { mx, nx, ny, np }, shapes))
    }

    fn check(&self, eval: &Evaluation) -> Result<(), SolverError> {
        let pairs = [
            ("residual", &self.residual, eval.residual.shape()),
            ("jacobian_p", &self.jacobian_p, eval.jacobian_p.shape()),
            ("jacobian_dx", &self.jacobian_dx, eval.jacobian_dx.shape()),
        ];
        for (what, expected, actual) in pairs {
            if expected.as_slice() != actual {
                return Err(SolverError::ShapeMismatch {
                    what,
                    expected: expected.clone(),
                    actual: actual.to_vec(),
                });
            }
        }
        Ok(())
    }
}

fn shaped(what: &'static str, shape: &[usize], data: Vec<f64>) -> Result<ArrayD<f64>, SolverError> {
    let len = data.len();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| SolverError::ShapeMismatch {
        what,
        expected: shape.to_vec(),
        actual: vec![len],
    })
}

fn copy_into(dst: &mut [f64], src: &ArrayD<f64>) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d = s;
    }
}

/// Model, committed linearization and the pending evaluation.
///
/// Layout of the flat buffers:
/// `j21[NX*(NY*i + j) + k]`, `j22[NP*(NY*i + j) + k]`, `x0 = [Δx; p]`,
/// `f0 = [Δx; residual]`.
pub(crate) struct Linearization<M> {
    model: M,
    pub dims: Dims,
    shapes: Shapes,
    state: ReportState,
    report: Option<Report>,
    pub loss: f64,

    pub j11: Vec<f64>,
    pub j21: Vec<f64>,
    pub j22: Vec<f64>,
    pub x0: Vec<f64>,
    pub f0: Vec<f64>,
    pub g0: Vec<f64>,
    pub d: Vec<f64>,

    consider_j11: Vec<f64>,
    consider_j21: Vec<f64>,
    consider_j22: Vec<f64>,
}

impl<M: Model> Linearization<M> {
    /// Evaluate at `(p0, dx0)` and commit.
    pub fn new(mut model: M, p0: Array1<f64>, dx0: ArrayD<f64>) -> Result<Self, SolverError> {
        let eval = model.evaluate(p0.view(), dx0.view());
        let (dims, shapes) = Shapes::infer(&p0, &dx0, &eval)?;
        let Dims { mx, nx, ny, np } = dims;
        let n = dims.unknowns();

        let mut lin = Self {
            model,
            dims,
            shapes,
            state: ReportState::Empty,
            report: None,
            loss: f64::NAN,
            j11: vec![1.0; mx * nx],
            j21: vec![0.0; mx * ny * nx],
            j22: vec![0.0; mx * ny * np],
            x0: vec![0.0; n],
            f0: vec![0.0; dims.rows()],
            g0: vec![0.0; n],
            d: vec![0.0; n],
            consider_j11: vec![1.0; mx * nx],
            consider_j21: vec![0.0; mx * ny * nx],
            consider_j22: vec![0.0; mx * ny * np],
        };
        lin.stage(p0, dx0, eval)?;
        lin.commit()?;
        Ok(lin)
    }

    /// Store `eval` as the pending report, computing its loss and gradients
    /// with the consider buffers.
    fn stage(&mut self, p: Array1<f64>, dx: ArrayD<f64>, eval: Evaluation) -> Result<(), SolverError> {
        let Dims { mx, nx, ny, np } = self.dims;
        let m = self.dims.rows() as f64;

        copy_into(&mut self.consider_j21, &eval.jacobian_dx);
        copy_into(&mut self.consider_j22, &eval.jacobian_p);
        self.consider_j11.fill(1.0);

        let dy: Vec<f64> = eval.residual.iter().copied().collect();
        let dx_flat: Vec<f64> = dx.iter().copied().collect();

        let mut dloss_dp = Array1::<f64>::zeros(np);
        for (i, &dy_i) in dy.iter().enumerate() {
            for (j, g) in dloss_dp.iter_mut().enumerate() {
                *g += dy_i * self.consider_j22[np * i + j] / m * 2.0;
            }
        }

        let mut dloss_ddx = vec![0.0; mx * nx];
        for (i, g) in dloss_ddx.iter_mut().enumerate() {
            *g = self.consider_j11[i] * dx_flat[i] / m * 2.0;
        }
        for i in 0..mx {
            for j in 0..ny {
                for k in 0..nx {
                    dloss_ddx[nx * i + k] += self.consider_j21[nx * (ny * i + j) + k] * dy[ny * i + j] / m * 2.0;
                }
            }
        }

        let mut loss = 0.0;
        for &s in dx_flat.iter().chain(dy.iter()) {
            loss += s * s / m;
        }

        let dloss_ddx = shaped("dloss_ddx", &self.shapes.x, dloss_ddx)?;
        self.report = Some(Report {
            p,
            dx,
            loss,
            dloss_dp,
            dloss_ddx,
            residual: eval.residual,
        });
        self.state = ReportState::Considering;
        Ok(())
    }

    /// Evaluate the model at `X0 + step` and stage the result.
    pub fn consider(&mut self, step: &[f64]) -> Result<(f64, f64), SolverError> {
        let Dims { mx, nx, ny, np } = self.dims;
        let n = self.dims.unknowns();
        let off = self.dims.off();
        if step.len() != n {
            return Err(SolverError::StepLength {
                expected: n,
                actual: step.len(),
            });
        }

        let p: Array1<f64> = (0..np).map(|i| self.x0[off + i] + step[off + i]).collect();
        let dx_flat: Vec<f64> = (0..off).map(|i| self.x0[i] + step[i]).collect();
        let dx = shaped("dx", &self.shapes.x, dx_flat)?;

        let eval = self.model.evaluate(p.view(), dx.view());
        self.shapes.check(&eval)?;

        let mut predicted = 0.0;
        let m = self.dims.rows() as f64;
        for i in 0..off {
            let f = self.f0[i] + self.j11[i] * step[i];
            predicted += f * f / m;
        }
        for i in 0..mx {
            for j in 0..ny {
                let row = ny * i + j;
                let mut f = self.f0[off + row];
                for k in 0..nx {
                    f += self.j21[nx * row + k] * step[nx * i + k];
                }
                for k in 0..np {
                    f += self.j22[np * row + k] * step[off + k];
                }
                predicted += f * f / m;
            }
        }

        self.stage(p, dx, eval)?;
        let loss = self.report.as_ref().map_or(f64::NAN, |r| r.loss);
        Ok((predicted, loss))
    }

    /// Make the staged evaluation the committed linearization.
    pub fn commit(&mut self) -> Result<(), SolverError> {
        if self.state != ReportState::Considering {
            return Err(SolverError::OutOfSequence {
                operation: "make_considered_move",
                state: self.state,
            });
        }
        let Some(report) = self.report.as_ref() else {
            return Err(SolverError::OutOfSequence {
                operation: "make_considered_move",
                state: self.state,
            });
        };
        let Dims { mx, nx, ny, np } = self.dims;
        let off = self.dims.off();

        std::mem::swap(&mut self.j11, &mut self.consider_j11);
        std::mem::swap(&mut self.j21, &mut self.consider_j21);
        std::mem::swap(&mut self.j22, &mut self.consider_j22);
        self.loss = report.loss;

        for (x, &p) in self.x0[off..].iter_mut().zip(report.p.iter()) {
            *x = p;
        }
        for (x, &dx) in self.x0[..off].iter_mut().zip(report.dx.iter()) {
            *x = dx;
        }
        self.f0[..off].copy_from_slice(&self.x0[..off]);
        copy_into(&mut self.f0[off..], &report.residual);

        // gradient of half the squared error
        for i in 0..off {
            self.g0[i] = self.j11[i] * self.f0[i];
        }
        for i in 0..mx {
            for j in 0..ny {
                let row = ny * i + j;
                for k in 0..nx {
                    self.g0[nx * i + k] += self.j21[nx * row + k] * self.f0[off + row];
                }
            }
        }
        self.g0[off..].fill(0.0);
        for row in 0..mx * ny {
            for j in 0..np {
                self.g0[off + j] += self.j22[np * row + j] * self.f0[off + row];
            }
        }

        let mut norm = FrobeniusNorm::new();
        for i in 0..mx {
            for k in 0..nx {
                norm.reset();
                norm.include(self.j11[nx * i + k]);
                for j in 0..ny {
                    norm.include(self.j21[nx * (ny * i + j) + k]);
                }
                let idx = nx * i + k;
                self.d[idx] = self.d[idx].max(norm.result());
            }
        }
        for j in 0..np {
            norm.reset();
            for row in 0..mx * ny {
                norm.include(self.j22[np * row + j]);
            }
            self.d[off + j] = self.d[off + j].max(norm.result());
        }

        self.state = ReportState::Ready;
        Ok(())
    }

    pub fn take_report(&mut self) -> Result<Report, SolverError> {
        let out_of_sequence = SolverError::OutOfSequence {
            operation: "report",
            state: self.state,
        };
        if self.state != ReportState::Ready {
            return Err(out_of_sequence);
        }
        let report = self.report.take().ok_or(out_of_sequence)?;
        self.state = ReportState::Empty;
        Ok(report)
    }

    pub fn cauchy_travel(&self) -> f64 {
        let Dims { mx, nx, ny, np } = self.dims;
        let off = self.dims.off();
        let g = &self.g0;

        // loss along the gradient: const + 2at + bt²
        let a: f64 = g.iter().map(|v| v * v).sum();
        let mut b = 0.0;
        for i in 0..mx {
            for j in 0..ny {
                let row = ny * i + j;
                let mut jg = 0.0;
                for k in 0..np {
                    jg += self.j22[np * row + k] * g[off + k];
                }
                for k in 0..nx {
                    jg += self.j21[nx * row + k] * g[nx * i + k];
                }
                b += jg * jg;
            }
        }
        for i in 0..off {
            let jg = self.j11[i] * g[i];
            b += jg * jg;
        }

        if a == 0.0 {
            0.0
        } else if b == 0.0 {
            f64::NEG_INFINITY
        } else {
            -a / b
        }
    }

    pub fn scaled_norm(&self, x: &[f64]) -> Result<f64, SolverError> {
        if x.len() != self.d.len() {
            return Err(SolverError::StepLength {
                expected: self.d.len(),
                actual: x.len(),
            });
        }
        Ok(block_qr::scaled_norm(&self.d, x))
    }

    /// Block view over the committed, unprepared Jacobian (`L = NY`).
    pub fn blocks(&self) -> Blocks<'_> {
        let Dims { mx, nx, ny, np } = self.dims;
        let off = self.dims.off();
        Blocks {
            mx,
            nx,
            np,
            l: ny,
            k: mx * ny,
            j11: &self.j11,
            j21: &self.j21,
            j22: &self.j22,
            f0: &self.f0,
            f1: &self.f0[off..],
            d: &self.d,
        }
    }

    /// Entry `(i, j)` of the dense committed Jacobian.
    #[cfg(test)]
    pub fn jacobian_entry(&self, i: usize, j: usize) -> f64 {
        let Dims { nx, ny, np, .. } = self.dims;
        let off = self.dims.off();
        if i < off {
            return if i == j { self.j11[i] } else { 0.0 };
        }
        let row = i - off;
        if j < off {
            if row / ny != j / nx {
                return 0.0;
            }
            return self.j21[nx * row + j % nx];
        }
        self.j22[np * row + j - off]
    }

    #[cfg(test)]
    pub fn d_mut(&mut self) -> &mut [f64] {
        &mut self.d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2};

    /// y = a + b*x with NY = 1.
    struct Line {
        x: Vec<f64>,
        y: Vec<f64>,
    }

    impl Model for Line {
        fn evaluate(&mut self, p: ArrayView1<'_, f64>, dx: ArrayViewD<'_, f64>) -> Evaluation {
            let mx = self.x.len();
            let mut residual = ArrayD::zeros(IxDyn(&[mx]));
            let mut jacobian_p = ArrayD::zeros(IxDyn(&[mx, 2]));
            let mut jacobian_dx = ArrayD::zeros(IxDyn(&[mx]));
            for i in 0..mx {
                let xi = self.x[i] + dx[[i]];
                residual[[i]] = p[0] + p[1] * xi - self.y[i];
                jacobian_p[[i, 0]] = 1.0;
                jacobian_p[[i, 1]] = xi;
                jacobian_dx[[i]] = p[1];
            }
            Evaluation {
                residual,
                jacobian_p,
                jacobian_dx,
            }
        }
    }

    /// y = p0 * (x0 + x1) with NX = 2.
    struct Sum {
        x: Array2<f64>,
    }

    impl Model for Sum {
        fn evaluate(&mut self, p: ArrayView1<'_, f64>, dx: ArrayViewD<'_, f64>) -> Evaluation {
            let mx = self.x.nrows();
            let mut residual = ArrayD::zeros(IxDyn(&[mx]));
            let mut jacobian_p = ArrayD::zeros(IxDyn(&[mx, 1]));
            let mut jacobian_dx = ArrayD::zeros(IxDyn(&[mx, 2]));
            for i in 0..mx {
                let s = self.x[[i, 0]] + dx[[i, 0]] + self.x[[i, 1]] + dx[[i, 1]];
                residual[[i]] = p[0] * s;
                jacobian_p[[i, 0]] = s;
                jacobian_dx[[i, 0]] = p[0];
                jacobian_dx[[i, 1]] = p[0];
            }
            Evaluation {
                residual,
                jacobian_p,
                jacobian_dx,
            }
        }
    }

    fn line(x: &[f64], y: &[f64]) -> Line {
        Line {
            x: x.to_vec(),
            y: y.to_vec(),
        }
    }

    #[test]
    fn infers_dims_and_commits() {
        let model = line(&[0.0, 1.0, 2.0], &[1.0, 2.0, 4.0]);
        let mut lin = Linearization::new(model, arr1(&[1.0, 1.0]), ArrayD::zeros(IxDyn(&[3]))).unwrap();
        assert_eq!(lin.dims, Dims { mx: 3, nx: 1, ny: 1, np: 2 });
        assert_eq!(lin.f0, vec![0.0, 0.0, 0.0, 0.0, 0.0, -1.0]);
        assert!((lin.loss - 1.0 / 6.0).abs() < 1e-15);

        let report = lin.take_report().unwrap();
        assert_eq!(report.residual.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, -1.0]);
        assert!(matches!(
            lin.take_report(),
            Err(SolverError::OutOfSequence {
                operation: "report",
                state: ReportState::Empty
            })
        ));
        assert!(matches!(lin.commit(), Err(SolverError::OutOfSequence { .. })));
    }

    #[test]
    fn rejects_inconsistent_shapes() {
        let model = |p: ArrayView1<'_, f64>, _dx: ArrayViewD<'_, f64>| Evaluation {
            residual: ArrayD::zeros(IxDyn(&[4])),
            jacobian_p: ArrayD::zeros(IxDyn(&[4, p.len() + 1])),
            jacobian_dx: ArrayD::zeros(IxDyn(&[4])),
        };
        let err = Linearization::new(model, arr1(&[0.0]), ArrayD::zeros(IxDyn(&[4])))
            .err()
            .unwrap();
        assert_eq!(
            err,
            SolverError::ShapeMismatch {
                what: "jacobian_p",
                expected: vec![4, 1],
                actual: vec![4, 2],
            }
        );

        let model = line(&[0.0, 1.0], &[0.0, 1.0]);
        let err = Linearization::new(model, arr1(&[0.0, 1.0]), ArrayD::zeros(IxDyn(&[3])))
            .err()
            .unwrap();
        assert!(matches!(err, SolverError::ShapeMismatch { what: "residual", .. }));
    }

    #[test]
    fn consider_leaves_committed_state_alone() {
        let model = line(&[0.0, 1.0, 2.0], &[1.0, 2.0, 4.0]);
        let mut lin = Linearization::new(model, arr1(&[1.0, 1.0]), ArrayD::zeros(IxDyn(&[3]))).unwrap();
        let x0 = lin.x0.clone();
        let g0 = lin.g0.clone();

        assert!(matches!(
            lin.consider(&[0.0; 4]),
            Err(SolverError::StepLength { expected: 5, actual: 4 })
        ));
        let (predicted, loss) = lin.consider(&[0.1, 0.0, -0.1, 0.5, 0.25]).unwrap();
        assert!(predicted.is_finite() && loss.is_finite());
        assert_eq!(lin.x0, x0);
        assert_eq!(lin.g0, g0);

        lin.commit().unwrap();
        assert_eq!(lin.x0, vec![0.1, 0.0, -0.1, 1.5, 1.25]);
        let report = lin.take_report().unwrap();
        assert_eq!(report.p.to_vec(), vec![1.5, 1.25]);
    }

    #[test]
    fn scale_never_shrinks() {
        let model = line(&[0.0, 1.0, 2.0, 3.0], &[0.0; 4]);
        let mut lin = Linearization::new(model, arr1(&[0.0, 3.0]), ArrayD::zeros(IxDyn(&[4]))).unwrap();
        let d0 = lin.d.clone();
        assert!((d0[0] - 10f64.sqrt()).abs() < 1e-14);

        // smaller slope: the Δx columns alone would shrink
        lin.consider(&[0.0, 0.0, 0.0, 0.0, 0.0, -2.5]).unwrap();
        lin.commit().unwrap();
        for (new, old) in lin.d.iter().zip(&d0) {
            assert!(new >= old);
        }
        assert_eq!(lin.d[0], d0[0]);
    }

    #[test]
    fn two_dimensional_inputs_keep_their_shape() {
        let x = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut lin = Linearization::new(Sum { x }, arr1(&[2.0]), ArrayD::zeros(IxDyn(&[2, 2]))).unwrap();
        assert_eq!(lin.dims, Dims { mx: 2, nx: 2, ny: 1, np: 1 });
        let report = lin.take_report().unwrap();
        assert_eq!(report.dx.shape(), &[2, 2]);
        assert_eq!(report.dloss_ddx.shape(), &[2, 2]);
        assert_eq!(lin.jacobian_entry(4, 1), 2.0);
        assert_eq!(lin.jacobian_entry(4, 2), 0.0);
        assert_eq!(lin.jacobian_entry(5, 4), 7.0);
    }
}
