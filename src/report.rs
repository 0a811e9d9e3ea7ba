use comfy_table::{presets, Cell, CellAlignment, ContentArrangement, Table};

/// Why [`crate::fit`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    ConvergedGradient,
    ConvergedStep,
    ConvergedCost,
    MaxIterations,
    NumericalFailure,
}

/// One trust-region iteration, accepted or not.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub loss: f64,
    pub trial_loss: f64,
    /// Ratio of actual to predicted loss decrease.
    pub rho: f64,
    pub lambda: f64,
    /// Trust radius the step was computed for, infinite when unbounded.
    pub radius: f64,
    /// Scaled step length `‖D·step‖`.
    pub step_norm: f64,
    pub grad_inf: f64,
    pub accepted: bool,
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

pub trait Reporter {
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self) {}
}

/// Collects iterations and prints them as a table when the fit finishes.
pub struct StdoutReporter {
    rows: Vec<IterationReport>,
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn right(text: String) -> Cell {
    Cell::new(text).set_alignment(CellAlignment::Right)
}

impl Reporter for StdoutReporter {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        if !log::log_enabled!(log::Level::Info) {
            println!();
        }
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            right("iter".into()),
            right("loss".into()),
            right("trial".into()),
            right("rho".into()),
            right("lambda".into()),
            right("radius".into()),
            right("step".into()),
            right("grad".into()),
            Cell::new("accepted"),
        ]);
        for row in &self.rows {
            table.add_row(vec![
                right(row.iteration.to_string()),
                right(format!("{:.4e}", row.loss)),
                right(format!("{:.4e}", row.trial_loss)),
                right(format!("{:.3}", row.rho)),
                right(format!("{:.1e}", row.lambda)),
                right(format!("{:.1e}", row.radius)),
                right(format!("{:.1e}", row.step_norm)),
                right(format!("{:.1e}", row.grad_inf)),
                Cell::new(if row.accepted { "yes" } else { "no" }),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        self.rows.clear();
    }
}
