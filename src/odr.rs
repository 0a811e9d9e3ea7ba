//! Orthogonal distance regression: one residual per sample.

use ndarray::{Array1, ArrayD};

use crate::block_qr::Steps;
use crate::trust_region::{Dims, Linearization, Model, Report, SolverError, TrustRegionSolver};

/// Trust-region solver for ODR problems (`NY = 1`).
///
/// Each sample contributes a single row to the dense block, so the sparse
/// elimination is a single rotation per input dimension.
pub struct OdrSolver<M> {
    lin: Linearization<M>,
    steps: Steps,
}

impl<M: Model> OdrSolver<M> {
    /// Evaluate `model` at `(p0, dx0)` and commit that point.
    ///
    /// The residual must have shape `[MX]` or `[MX, 1]`.
    pub fn new(model: M, p0: Array1<f64>, dx0: ArrayD<f64>) -> Result<Self, SolverError> {
        let lin = Linearization::new(model, p0, dx0)?;
        let dims = lin.dims;
        if dims.ny != 1 {
            return Err(SolverError::ShapeMismatch {
                what: "residual",
                expected: vec![dims.mx, 1],
                actual: vec![dims.mx, dims.ny],
            });
        }
        let steps = Steps::new(dims, 1, dims.mx)?;
        Ok(Self { lin, steps })
    }
}

impl<M: Model> TrustRegionSolver for OdrSolver<M> {
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
        Ok(())
    }

    fn report(&mut self) -> Result<Report, SolverError> {
        self.lin.take_report()
    }

    fn cauchy_travel(&self) -> f64 {
        self.lin.cauchy_travel()
    }

    fn compute_newton(&mut self) -> Result<(), SolverError> {
        self.steps.newton(&self.lin.blocks())
    }

    fn newton_step(&self) -> Option<&[f64]> {
        self.steps.newton_step()
    }

    fn rank(&self) -> Option<usize> {
        self.steps.rank(self.lin.dims.off())
    }

    fn compute_newton_regularized(&mut self, lambda: f64) -> Result<(f64, f64), SolverError> {
        self.steps.regularized(&self.lin.blocks(), lambda)
    }

    fn regularized_step(&self) -> Option<&[f64]> {
        self.steps.regularized_step()
    }
}
