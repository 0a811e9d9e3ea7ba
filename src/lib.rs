//! Real Schur decompositions and structured trust-region solvers for
//! orthogonal distance regression (ODR) and total least squares (TLS).
//!
//! Two independent halves live in this crate:
//!
//! - `schur_decompose` computes `A = Q * T * Q^T` with `T` quasi upper
//!   triangular, by Householder reduction to Hessenberg form followed by the
//!   implicit double-shift Francis QR iteration. `schur_eigenvalues` and
//!   `schur_eigen` read eigenvalues and eigenvectors off the result.
//! - `OdrSolver` and `TlsSolver` linearize a model around the current
//!   parameters `p` and input perturbations `Δx` and compute Gauss-Newton and
//!   Levenberg-Marquardt steps through a Givens QR that exploits the
//!   block-diagonal structure of the Jacobian. `fit` drives either of them with
//!   a trust-region method; `odr_fit` wraps a per-sample model.
//!
//! Example:
//! ```rust,no_run
//! use ndarray::{Array1, ArrayD, ArrayView1, ArrayViewMut1, ArrayViewMut2, IxDyn};
//! use schur_odr::{odr_fit, FitOptions, SampleModel};
//!
//! /// y = a + b*x
//! struct Line;
//! impl SampleModel for Line {
//!     fn eval(
//!         &mut self,
//!         p: ArrayView1<'_, f64>,
//!         x: ArrayView1<'_, f64>,
//!         mut y: ArrayViewMut1<'_, f64>,
//!         mut dy_dp: ArrayViewMut2<'_, f64>,
//!         mut dy_dx: ArrayViewMut2<'_, f64>,
//!     ) {
//!         y[0] = p[0] + p[1] * x[0];
//!         dy_dp[[0, 0]] = 1.0;
//!         dy_dp[[0, 1]] = x[0];
//!         dy_dx[[0, 0]] = p[1];
//!     }
//! }
//!
//! let x = ArrayD::from_shape_vec(IxDyn(&[4]), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
//! let y = ArrayD::from_shape_vec(IxDyn(&[4]), vec![1.0, 3.1, 4.9, 7.0]).unwrap();
//! let result = odr_fit(x, y, Line, Array1::from(vec![1.0, 1.0]), &FitOptions::default()).unwrap();
//! assert!(result.loss.is_finite());
//! ```

mod block_qr;
mod dense;
mod eigen;
mod fit;
mod francis;
mod givens;
mod hessenberg;
mod odr;
mod report;
mod schur;
mod tls;
mod trust_region;

#[cfg(test)]
mod testing;

pub use eigen::{schur_eigen, schur_eigen_batch, schur_eigenvalues, schur_eigenvalues_batch, Eigen, EigenVectors};
pub use fit::{fit, odr_fit, FitOptions, FitResult, SampleModel};
pub use odr::OdrSolver;
pub use report::{IterationReport, Reporter, SolveStatus, StdoutReporter};
pub use schur::{
    francis_qr_in_place, hessenberg_decompose, schur_decompose, schur_decompose_batch, schur_decompose_with, Schur,
    SchurError, SchurOptions, SHIFT_SEED,
};
pub use tls::TlsSolver;
pub use trust_region::{Dims, Evaluation, Model, Report, ReportState, SolverError, TrustRegionSolver};
