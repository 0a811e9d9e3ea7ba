//! Trust-region driver and the sample-wise fitting entry point.

use std::time::{Duration, Instant};

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayViewD, ArrayViewMut1, ArrayViewMut2, IxDyn};

use crate::odr::OdrSolver;
use crate::report::{emit_line, IterationReport, Reporter, SolveStatus, StdoutReporter};
use crate::tls::TlsSolver;
use crate::trust_region::{Evaluation, Model, Report, SolverError, TrustRegionSolver};

/// Options controlling [`fit`].
#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Maximum number of trust-region iterations, rejected steps included.
    pub max_iters: usize,
    /// Converge when ||∂loss/∂X||_inf <= grad_tol.
    pub grad_tol: f64,
    /// Converge when loss <= loss_tol.
    pub loss_tol: f64,
    /// Converge when ||D·step|| <= step_tol * (||D·X|| + step_tol).
    pub step_tol: f64,
    /// Damping updates per trust radius search.
    pub max_lambda_iters: usize,
    /// Consecutive rejected steps before the solver's
    /// [`wiggle`](TrustRegionSolver::wiggle) hook is called.
    pub max_rejections: usize,
    /// Print an iteration table when no reporter is passed.
    pub verbose: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iters: 100,
            grad_tol: 1e-10,
            loss_tol: 1e-20,
            step_tol: 1e-10,
            max_lambda_iters: 16,
            max_rejections: 10,
            verbose: false,
        }
    }
}

/// Outcome of [`fit`].
#[derive(Debug, Clone)]
pub struct FitResult {
    pub status: SolveStatus,
    pub iterations: usize,
    /// Number of committed steps.
    pub accepted: usize,
    pub loss: f64,
    pub grad_inf: f64,
    /// Scaled length of the last step.
    pub step_norm: f64,
    pub lambda: f64,
    /// Evaluation at the final committed point.
    pub report: Report,
}

enum ReporterSlot<'a> {
    External(&'a mut dyn Reporter),
    Local(StdoutReporter),
    None,
}

impl<'a> ReporterSlot<'a> {
    fn new(reporter: Option<&'a mut dyn Reporter>, verbose: bool) -> Self {
        match reporter {
            Some(r) => Self::External(r),
            None if verbose => Self::Local(StdoutReporter::new()),
            None => Self::None,
        }
    }

    fn as_mut(&mut self) -> Option<&mut dyn Reporter> {
        match self {
            Self::External(r) => Some(*r),
            Self::Local(r) => Some(r),
            Self::None => None,
        }
    }
}

/// Minimize the loss of `solver` with a Levenberg-Marquardt trust-region method.
///
/// The solver must hold an undrained report, i.e. be freshly constructed or
/// have just committed a move. The first iteration takes the full Newton
/// step; later steps are confined to a trust radius in the `D`-scaled norm,
/// found by adjusting the damping parameter.
///
/// Returns [`SolverError::NoProgress`] once `max_rejections` trial steps in a
/// row failed to decrease the loss and the solver's `wiggle` hook gave up.
pub fn fit<S>(
    solver: &mut S,
    options: &FitOptions,
    reporter: Option<&mut dyn Reporter>,
) -> Result<FitResult, SolverError>
where
    S: TrustRegionSolver + ?Sized,
{
    let start_time = options.verbose.then(Instant::now);
    let mut reporter = ReporterSlot::new(reporter, options.verbose);

    let mut report = solver.report()?;
    let mut step = vec![0.0; solver.dims().unknowns()];
    let mut radius = f64::INFINITY;
    let mut lambda = 0.0;
    let mut step_norm = 0.0;
    let mut grad_inf;
    let mut accepted_steps = 0;
    let mut rejected_in_row = 0;
    let mut iter = 0;

    let status = loop {
        let loss = solver.loss();
        grad_inf = max_abs(&report);
        if !loss.is_finite() {
            break SolveStatus::NumericalFailure;
        }
        if grad_inf <= options.grad_tol {
            break SolveStatus::ConvergedGradient;
        }
        if loss <= options.loss_tol {
            break SolveStatus::ConvergedCost;
        }
        if iter == options.max_iters {
            break SolveStatus::MaxIterations;
        }

        solver.compute_newton()?;
        let (mut r, mut dr) = solver.compute_newton_regularized(0.0)?;
        lambda = 0.0;

        // Hebden/Moré update on 1/r(λ) - 1/radius
        if r > radius {
            for _ in 0..options.max_lambda_iters {
                if (r - radius).abs() <= 0.1 * radius {
                    break;
                }
                let next = lambda - (r - radius) / radius * r / dr;
                if !next.is_finite() || next <= 0.0 {
                    break;
                }
                lambda = next;
                (r, dr) = solver.compute_newton_regularized(lambda)?;
            }
        }

        let source = if lambda == 0.0 {
            solver.newton_step()
        } else {
            solver.regularized_step()
        };
        let Some(source) = source else {
            break SolveStatus::NumericalFailure;
        };
        step.copy_from_slice(source);
        if r > radius {
            // the search stopped short of the radius: truncate the step
            let shrink = radius / r;
            step.iter_mut().for_each(|v| *v *= shrink);
            r = radius;
        }
        if !r.is_finite() {
            break SolveStatus::NumericalFailure;
        }
        step_norm = r;

        let x_norm = solver.scaled_norm(solver.position())?;
        if r <= options.step_tol * (x_norm + options.step_tol) {
            break SolveStatus::ConvergedStep;
        }

        let (predicted, trial_loss) = solver.consider_move(&step)?;
        let predicted_decrease = loss - predicted;
        let actual_decrease = loss - trial_loss;
        let mut rho = if predicted_decrease > 0.0 {
            actual_decrease / predicted_decrease
        } else {
            0.0
        };
        if !rho.is_finite() {
            rho = 0.0;
        }
        let accepted = trial_loss.is_finite() && trial_loss < loss;

        if let Some(reporter) = reporter.as_mut() {
            reporter.on_iteration(&IterationReport {
                iteration: iter,
                loss,
                trial_loss,
                rho,
                lambda,
                radius,
                step_norm: r,
                grad_inf,
                accepted,
            });
        }
        log::debug!(
            "fit: iteration {iter}: loss {loss:.6e} -> {trial_loss:.6e}, rho {rho:.3}, lambda {lambda:.2e}"
        );

        let current = if radius.is_finite() { radius } else { r };
        radius = if rho < 0.25 {
            r / 4.0
        } else if rho > 0.75 {
            current.max(2.0 * r)
        } else {
            current
        };

        iter += 1;
        if accepted {
            solver.make_considered_move()?;
            report = solver.report()?;
            accepted_steps += 1;
            rejected_in_row = 0;
            continue;
        }

        rejected_in_row += 1;
        if rejected_in_row >= options.max_rejections {
            log::debug!("fit: {rejected_in_row} rejected steps in a row");
            if let Err(err) = solver.wiggle(rejected_in_row) {
                if let Some(reporter) = reporter.as_mut() {
                    reporter.on_finish();
                }
                return Err(err);
            }
            rejected_in_row = 0;
        }
    };

    if let Some(reporter) = reporter.as_mut() {
        reporter.on_finish();
    }
    if let Some(start) = start_time {
        let elapsed = format_duration(start.elapsed());
        emit_line(&format!("time: {elapsed}"));
    }

    Ok(FitResult {
        status,
        iterations: iter,
        accepted: accepted_steps,
        loss: solver.loss(),
        grad_inf,
        step_norm,
        lambda,
        report,
    })
}

fn max_abs(report: &Report) -> f64 {
    report
        .dloss_dp
        .iter()
        .chain(report.dloss_ddx.iter())
        .fold(0.0, |m: f64, v| m.max(v.abs()))
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}

/// A model `y = f(p, x)` evaluated one sample at a time.
pub trait SampleModel {
    /// Write `f(p, x)` into `y` (`NY` entries) and its derivatives into
    /// `dy_dp` (`NY x NP`) and `dy_dx` (`NY x NX`). The derivative buffers
    /// are zeroed before each call.
    fn eval(
        &mut self,
        p: ArrayView1<'_, f64>,
        x: ArrayView1<'_, f64>,
        y: ArrayViewMut1<'_, f64>,
        dy_dp: ArrayViewMut2<'_, f64>,
        dy_dx: ArrayViewMut2<'_, f64>,
    );
}

/// Adapts a [`SampleModel`] and observations to the [`Model`] residual callback.
struct Samples<S> {
    model: S,
    x: Vec<f64>,
    y: Vec<f64>,
    nx: usize,
    ny: usize,
    residual_shape: Vec<usize>,
    jacobian_p_shape: Vec<usize>,
    jacobian_dx_shape: Vec<usize>,
    xi: Array1<f64>,
    fi: Array1<f64>,
    df_dp: Array2<f64>,
    df_dx: Array2<f64>,
}

impl<S: SampleModel> Samples<S> {
    fn new(model: S, x: &ArrayD<f64>, y: &ArrayD<f64>, np: usize) -> Result<Self, SolverError> {
        let (xs, ys) = (x.shape(), y.shape());
        if xs.is_empty() || xs.len() > 2 {
            return Err(SolverError::ShapeMismatch {
                what: "x",
                expected: xs.iter().copied().take(2).collect(),
                actual: xs.to_vec(),
            });
        }
        if ys.is_empty() || ys.len() > 2 || ys[0] != xs[0] {
            let mut expected = vec![xs[0]];
            expected.extend(ys.get(1).copied());
            return Err(SolverError::ShapeMismatch {
                what: "y",
                expected,
                actual: ys.to_vec(),
            });
        }
        let nx = xs.get(1).copied().unwrap_or(1);
        let ny = ys.get(1).copied().unwrap_or(1);

        let residual_shape = ys.to_vec();
        let mut jacobian_p_shape = residual_shape.clone();
        jacobian_p_shape.push(np);
        let mut jacobian_dx_shape = residual_shape.clone();
        if xs.len() == 2 {
            jacobian_dx_shape.push(nx);
        }
        Ok(Self {
            model,
            x: x.iter().copied().collect(),
            y: y.iter().copied().collect(),
            nx,
            ny,
            residual_shape,
            jacobian_p_shape,
            jacobian_dx_shape,
            xi: Array1::zeros(nx),
            fi: Array1::zeros(ny),
            df_dp: Array2::zeros((ny, np)),
            df_dx: Array2::zeros((ny, nx)),
        })
    }
}

impl<S: SampleModel> Model for Samples<S> {
    fn evaluate(&mut self, p: ArrayView1<'_, f64>, dx: ArrayViewD<'_, f64>) -> Evaluation {
        let (nx, ny, np) = (self.nx, self.ny, p.len());
        let mx = self.y.len() / ny;
        let dx: Vec<f64> = dx.iter().copied().collect();

        let mut residual = Vec::with_capacity(mx * ny);
        let mut jacobian_p = Vec::with_capacity(mx * ny * np);
        let mut jacobian_dx = Vec::with_capacity(mx * ny * nx);
        for i in 0..mx {
            for k in 0..nx {
                self.xi[k] = self.x[nx * i + k] + dx[nx * i + k];
            }
            self.fi.fill(0.0);
            self.df_dp.fill(0.0);
            self.df_dx.fill(0.0);
            self.model.eval(
                p,
                self.xi.view(),
                self.fi.view_mut(),
                self.df_dp.view_mut(),
                self.df_dx.view_mut(),
            );
            for j in 0..ny {
                residual.push(self.fi[j] - self.y[ny * i + j]);
                jacobian_p.extend(self.df_dp.row(j).iter().copied());
                jacobian_dx.extend(self.df_dx.row(j).iter().copied());
            }
        }

        Evaluation {
            residual: filled(&self.residual_shape, residual),
            jacobian_p: filled(&self.jacobian_p_shape, jacobian_p),
            jacobian_dx: filled(&self.jacobian_dx_shape, jacobian_dx),
        }
    }
}

/// Row-major array of the given shape holding `values`.
fn filled(shape: &[usize], values: Vec<f64>) -> ArrayD<f64> {
    let mut out = ArrayD::zeros(IxDyn(shape));
    for (dst, v) in out.iter_mut().zip(values) {
        *dst = v;
    }
    out
}

/// Fit `y ≈ f(p, x + Δx)` in the orthogonal distance sense, starting from `p0`
/// and `Δx = 0`.
///
/// `x` has shape `[MX]` or `[MX, NX]`, `y` has shape `[MX]` or `[MX, NY]`.
/// One-dimensional `y` is solved as an ODR problem, anything else as TLS.
pub fn odr_fit<S: SampleModel>(
    x: ArrayD<f64>,
    y: ArrayD<f64>,
    model: S,
    p0: Array1<f64>,
    options: &FitOptions,
) -> Result<FitResult, SolverError> {
    let samples = Samples::new(model, &x, &y, p0.len())?;
    let dx0 = ArrayD::zeros(x.raw_dim());
    if y.ndim() == 1 {
        let mut solver = OdrSolver::new(samples, p0, dx0)?;
        fit(&mut solver, options, None)
    } else {
        let mut solver = TlsSolver::new(samples, p0, dx0)?;
        fit(&mut solver, options, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Affine;
    use crate::trust_region::Dims;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[derive(Default)]
    struct Recorder {
        rows: Vec<IterationReport>,
        finished: bool,
    }

    impl Reporter for Recorder {
        fn on_iteration(&mut self, report: &IterationReport) {
            self.rows.push(report.clone());
        }

        fn on_finish(&mut self) {
            self.finished = true;
        }
    }

    fn affine_solver(rng: &mut StdRng, dims: Dims) -> TlsSolver<Affine> {
        let model = Affine::random(rng, dims, None, true);
        let dx0 = ArrayD::from_shape_fn(IxDyn(&model.dx_shape()), |_| rng.gen_range(-0.1..0.1));
        let p0: Array1<f64> = (0..dims.np).map(|_| rng.gen_range(-1.0..1.0)).collect();
        TlsSolver::new(model, p0, dx0).unwrap()
    }

    #[test]
    fn affine_model_converges_in_one_step() {
        let mut rng = StdRng::seed_from_u64(53);
        for dims in [
            Dims { mx: 6, nx: 1, ny: 1, np: 2 },
            Dims { mx: 5, nx: 2, ny: 3, np: 3 },
        ] {
            let mut solver = affine_solver(&mut rng, dims);
            let mut recorder = Recorder::default();
            let result = fit(&mut solver, &FitOptions::default(), Some(&mut recorder)).unwrap();
            assert!(matches!(
                result.status,
                SolveStatus::ConvergedGradient | SolveStatus::ConvergedCost
            ));
            assert_eq!(result.accepted, 1);
            assert_eq!(recorder.rows.len(), 1);
            assert!(recorder.rows[0].radius.is_infinite());
            assert_eq!(recorder.rows[0].lambda, 0.0);
            assert!(recorder.finished);
        }
    }

    #[test]
    fn zero_iterations_reports_the_start() {
        let mut rng = StdRng::seed_from_u64(59);
        let mut solver = affine_solver(&mut rng, Dims { mx: 4, nx: 1, ny: 2, np: 2 });
        let loss = solver.loss();
        let options = FitOptions {
            max_iters: 0,
            ..FitOptions::default()
        };
        let result = fit(&mut solver, &options, None).unwrap();
        assert_eq!(result.status, SolveStatus::MaxIterations);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.loss, loss);
        assert_eq!(result.report.loss, loss);
    }

    #[test]
    fn drained_solver_is_rejected() {
        let mut rng = StdRng::seed_from_u64(61);
        let mut solver = affine_solver(&mut rng, Dims { mx: 3, nx: 1, ny: 1, np: 1 });
        solver.report().unwrap();
        assert!(matches!(
            fit(&mut solver, &FitOptions::default(), None),
            Err(SolverError::OutOfSequence { operation: "report", .. })
        ));
    }

    /// `y = p0 * sin(p1 * x)`.
    struct Sine;

    impl SampleModel for Sine {
        fn eval(
            &mut self,
            p: ArrayView1<'_, f64>,
            x: ArrayView1<'_, f64>,
            mut y: ArrayViewMut1<'_, f64>,
            mut dy_dp: ArrayViewMut2<'_, f64>,
            mut dy_dx: ArrayViewMut2<'_, f64>,
        ) {
            let (s, c) = (p[1] * x[0]).sin_cos();
            y[0] = p[0] * s;
            dy_dp[[0, 0]] = s;
            dy_dp[[0, 1]] = p[0] * c * x[0];
            dy_dx[[0, 0]] = p[0] * c * p[1];
        }
    }

    #[test]
    fn sample_adapter_matches_finite_differences() {
        let x = ArrayD::from_shape_vec(IxDyn(&[4]), vec![0.1, 0.4, -0.3, 0.8]).unwrap();
        let y = ArrayD::from_shape_vec(IxDyn(&[4]), vec![0.2, 0.5, -0.1, 0.3]).unwrap();
        let mut samples = Samples::new(Sine, &x, &y, 2).unwrap();
        let p = Array1::from(vec![1.3, 0.7]);
        let dx = ArrayD::from_shape_vec(IxDyn(&[4]), vec![0.01, -0.02, 0.03, 0.0]).unwrap();
        let eval = samples.evaluate(p.view(), dx.view());
        assert_eq!(eval.residual.shape(), &[4]);
        assert_eq!(eval.jacobian_p.shape(), &[4, 2]);
        assert_eq!(eval.jacobian_dx.shape(), &[4]);

        let h = 1e-7;
        for k in 0..2 {
            let mut up = p.clone();
            up[k] += h;
            let moved = samples.evaluate(up.view(), dx.view());
            for i in 0..4 {
                let fd = (moved.residual[[i]] - eval.residual[[i]]) / h;
                assert!((fd - eval.jacobian_p[[i, k]]).abs() < 1e-6);
            }
        }
        let mut moved_dx = dx.clone();
        moved_dx.iter_mut().for_each(|v| *v += h);
        let moved = samples.evaluate(p.view(), moved_dx.view());
        for i in 0..4 {
            let fd = (moved.residual[[i]] - eval.residual[[i]]) / h;
            assert!((fd - eval.jacobian_dx[[i]]).abs() < 1e-6);
        }
    }

    fn sine_data() -> (ArrayD<f64>, ArrayD<f64>) {
        let xs: Vec<f64> = (1..11).map(|i| 0.3 * i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 1.5 * (0.8 * x).sin()).collect();
        (
            ArrayD::from_shape_vec(IxDyn(&[10]), xs).unwrap(),
            ArrayD::from_shape_vec(IxDyn(&[10]), ys).unwrap(),
        )
    }

    #[test]
    fn steps_never_leave_the_trust_region() {
        let (x, y) = sine_data();
        let samples = Samples::new(Sine, &x, &y, 2).unwrap();
        let mut solver = OdrSolver::new(samples, Array1::from(vec![0.5, 1.6]), ArrayD::zeros(x.raw_dim())).unwrap();
        // a single damping update rarely lands within 10% of the radius
        let options = FitOptions {
            max_lambda_iters: 1,
            max_rejections: usize::MAX,
            ..FitOptions::default()
        };
        let mut recorder = Recorder::default();
        fit(&mut solver, &options, Some(&mut recorder)).unwrap();

        assert!(recorder.rows.iter().any(|row| !row.accepted));
        assert!(recorder.rows.iter().any(|row| row.lambda > 0.0));
        for row in &recorder.rows {
            assert!(
                row.step_norm <= row.radius * (1.0 + 1e-12),
                "step {} outside radius {}",
                row.step_norm,
                row.radius
            );
        }
    }

    /// `y = p0 + x`, drifting upwards with every evaluation.
    struct Drifting {
        offset: f64,
    }

    impl SampleModel for Drifting {
        fn eval(
            &mut self,
            p: ArrayView1<'_, f64>,
            x: ArrayView1<'_, f64>,
            mut y: ArrayViewMut1<'_, f64>,
            mut dy_dp: ArrayViewMut2<'_, f64>,
            mut dy_dx: ArrayViewMut2<'_, f64>,
        ) {
            y[0] = p[0] + x[0] + self.offset;
            self.offset += 1.0;
            dy_dp[[0, 0]] = 1.0;
            dy_dx[[0, 0]] = 1.0;
        }
    }

    #[test]
    fn gives_up_when_no_step_decreases_the_loss() {
        let x = ArrayD::from_shape_vec(IxDyn(&[4]), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let y = x.clone();
        let samples = Samples::new(Drifting { offset: 0.0 }, &x, &y, 1).unwrap();
        let mut solver = OdrSolver::new(samples, Array1::from(vec![0.5]), ArrayD::zeros(x.raw_dim())).unwrap();
        let start = solver.loss();

        let options = FitOptions {
            max_rejections: 5,
            ..FitOptions::default()
        };
        let mut recorder = Recorder::default();
        let err = fit(&mut solver, &options, Some(&mut recorder)).unwrap_err();
        assert_eq!(err, SolverError::NoProgress { rejected: 5 });
        assert_eq!(recorder.rows.len(), 5);
        assert!(recorder.rows.iter().all(|row| !row.accepted && row.trial_loss > start));
        assert!(recorder.finished);
        assert_eq!(solver.loss(), start);

        let err = odr_fit(x.clone(), y, Drifting { offset: 0.0 }, Array1::from(vec![0.5]), &FitOptions::default())
            .unwrap_err();
        assert_eq!(err, SolverError::NoProgress { rejected: 10 });
        assert_eq!(err.to_string(), "too many unsuccessful iterations (10 in a row)");
    }

    #[test]
    fn mismatched_observations_are_rejected() {
        let x = ArrayD::zeros(IxDyn(&[4]));
        let y = ArrayD::zeros(IxDyn(&[5]));
        let err = odr_fit(x, y, Sine, Array1::ones(2), &FitOptions::default()).unwrap_err();
        assert!(matches!(err, SolverError::ShapeMismatch { what: "y", .. }));
    }
}
