//! Human-readable result lines.

use allocutil_core::Utilization;

use crate::evaluator::EvalError;

/// `tracefile: <name padded to 35> utilization: NN.NN%` (or `invalid`).
#[must_use]
pub fn result_line(trace_file: &str, utilization: Utilization) -> String {
    format!("tracefile: {trace_file:<35} utilization: {utilization}")
}

/// One-line stderr diagnostic for a trace that could not be measured.
#[must_use]
pub fn failure_line(trace_file: &str, step: &str, error: &dyn std::fmt::Display) -> String {
    format!("allocutil: {trace_file}: {step} failed: {error}")
}

/// [`failure_line`] for an evaluation error, naming the stage it came from.
#[must_use]
pub fn eval_failure_line(trace_file: &str, error: &EvalError) -> String {
    failure_line(trace_file, error.step(), error)
}
