//! Space-utilization evaluation of one trace against a traced serving process.
//!
//! For each trace the evaluator starts the serving binary on one end of a
//! socket pair, then runs two activities side by side: a scoped worker
//! thread replays the trace over the socket while the spawning thread
//! follows the process with the configured [`FootprintTracer`]. They never
//! share state; the driver dropping its socket end is what lets the process
//! exit and the tracer finish.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use allocutil_core::{
    HeapFootprint, ProtocolError, ReplayOutcome, ReplayStep, Trace, Utilization,
    UtilizationSample, replay,
};
use thiserror::Error;

use crate::config::{EvalConfig, Verbosity};
use crate::process::ServerProcess;
use crate::structured_log::{Diagnostics, LogLevel, Outcome};
use crate::tracer::{ExitKind, FootprintTracer, SyscallTracer, TracerError};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("starting serving process {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("replay: {0}")]
    Replay(#[from] ProtocolError),
    #[error("tracing: {0}")]
    Trace(#[from] TracerError),
    #[error("serving process {exit}{}", at_op(.cause))]
    ServerExited {
        exit: ExitKind,
        #[source]
        cause: Option<ProtocolError>,
    },
    #[error("replay thread panicked")]
    DriverPanicked,
}

fn at_op(cause: &Option<ProtocolError>) -> String {
    cause
        .as_ref()
        .and_then(ProtocolError::op_index)
        .map(|i| format!(" during operation {i}"))
        .unwrap_or_default()
}

impl EvalError {
    /// Short name of the stage that failed.
    #[must_use]
    pub fn step(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::Replay(_) | Self::DriverPanicked => "replay",
            Self::Trace(_) => "trace",
            Self::ServerExited { .. } => "server",
        }
    }
}

/// Everything measured for one trace.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub trace_name: String,
    pub replay: ReplayOutcome,
    pub footprint: HeapFootprint,
    pub sample: UtilizationSample,
    pub utilization: Utilization,
    pub exit: ExitKind,
    pub elapsed: Duration,
}

/// Runs traces against the configured serving binary.
pub struct Evaluator<T: FootprintTracer = SyscallTracer> {
    config: EvalConfig,
    tracer: T,
}

impl Evaluator<SyscallTracer> {
    #[must_use]
    pub fn new(config: EvalConfig) -> Self {
        Self::with_tracer(config, SyscallTracer)
    }
}

impl<T: FootprintTracer> Evaluator<T> {
    #[must_use]
    pub fn with_tracer(config: EvalConfig, tracer: T) -> Self {
        Self { config, tracer }
    }

    fn diagnostics(&self, trace: &Trace, component: &'static str) -> Diagnostics {
        Diagnostics::stdout(
            self.config.verbosity,
            &self.config.run_id,
            &trace.name,
            component,
        )
    }

    /// Replay `trace` once and measure its utilization.
    ///
    /// The serving process is reaped before this returns, whatever happens.
    pub fn evaluate(&mut self, trace: &mut Trace) -> Result<Evaluation, EvalError> {
        let started = Instant::now();
        trace.reset();

        let mut tracer_diag = self.diagnostics(trace, "tracer");
        let mut driver_diag = self.diagnostics(trace, "driver");
        let mut eval_diag = self.diagnostics(trace, "evaluator");

        let (mut server, mut stream) =
            ServerProcess::spawn(&self.config.server, &self.config.server_env).map_err(
                |source| EvalError::Spawn {
                    path: self.config.server.clone(),
                    source,
                },
            )?;
        let pid = server.pid();
        let tracer = &mut self.tracer;
        let driven = &mut *trace;

        let (traced, replayed) = std::thread::scope(|s| {
            let driver = s.spawn(move || {
                let result = replay(driven, &mut stream, |step| log_step(&mut driver_diag, step));
                drop(stream);
                result
            });
            let traced = tracer.trace(pid, &mut tracer_diag);
            match &traced {
                Err(err) if err.child_reaped() => server.mark_reaped(),
                Err(_) => {
                    server.kill();
                }
                Ok(_) => {}
            }
            (traced, driver.join())
        });

        let run = traced?;
        server.mark_reaped();
        if !run.exit.is_clean() {
            return Err(EvalError::ServerExited {
                exit: run.exit,
                cause: replayed.ok().and_then(Result::err),
            });
        }
        let outcome = replayed.map_err(|_| EvalError::DriverPanicked)??;

        let sample = UtilizationSample {
            peak_live_bytes: outcome.peak_live_bytes,
            peak_consumed_bytes: run.footprint.peak_consumed(),
        };
        let utilization = sample.utilization();

        if outcome.peak_live_bytes != trace.declared_peak_bytes {
            eval_diag.log(
                Verbosity::SYSCALLS,
                Diagnostics::entry(LogLevel::Warn, "peak_hint_mismatch")
                    .with_size(outcome.peak_live_bytes)
                    .with_details(serde_json::json!({ "declared": trace.declared_peak_bytes })),
            );
        }
        eval_diag.log(
            Verbosity::SYSCALLS,
            Diagnostics::entry(LogLevel::Info, "heap_summary")
                .with_size(sample.peak_consumed_bytes)
                .with_outcome(if utilization.is_valid() {
                    Outcome::Pass
                } else {
                    Outcome::Invalid
                })
                .with_details(serde_json::json!({
                    "peak_live_bytes": sample.peak_live_bytes,
                    "footprint": run.footprint,
                    "syscalls": run.syscalls,
                })),
        );

        Ok(Evaluation {
            trace_name: trace.name.clone(),
            replay: outcome,
            footprint: run.footprint,
            sample,
            utilization,
            exit: run.exit,
            elapsed: started.elapsed(),
        })
    }
}

fn log_step(diag: &mut Diagnostics, step: &ReplayStep) {
    if !diag.enabled(Verbosity::ALL) {
        return;
    }
    let mut entry = Diagnostics::entry(LogLevel::Debug, "replay_step")
        .with_op_index(step.op_index)
        .with_size(step.op.size)
        .with_details(serde_json::json!({
            "op": step.op.kind,
            "block": step.op.block,
            "live_bytes": step.live_bytes,
        }));
    if let Some(address) = step.address {
        entry = entry.with_address(address.raw());
    }
    diag.log(Verbosity::ALL, entry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_server_is_a_spawn_error() {
        let config = EvalConfig::default().with_server("/nonexistent/runtrace");
        let mut evaluator = Evaluator::new(config);
        let mut trace: Trace = "1\n1\n1\n10\na 0 10\n".parse().unwrap();
        let err = evaluator.evaluate(&mut trace).unwrap_err();
        assert!(matches!(err, EvalError::Spawn { .. }), "{err}");
        assert_eq!(err.step(), "spawn");
    }

    #[test]
    fn server_gone_before_stopping_is_not_signalled() {
        let config = EvalConfig::default().with_server("true");
        let mut evaluator = Evaluator::new(config);
        let mut trace: Trace = "1\n1\n1\n10\na 0 10\n".parse().unwrap();
        match evaluator.evaluate(&mut trace) {
            Err(EvalError::Trace(err)) => {
                assert!(err.child_reaped(), "{err}");
                assert!(matches!(err, TracerError::NotStopped(ExitKind::Exited(0))), "{err}");
            }
            other => panic!("expected a trace failure, got {other:?}"),
        }
    }

    #[test]
    fn server_exit_names_the_operation() {
        let err = EvalError::ServerExited {
            exit: ExitKind::Signaled(9),
            cause: Some(ProtocolError::UnexpectedEof { op_index: 7 }),
        };
        assert_eq!(
            err.to_string(),
            "serving process was killed by signal 9 during operation 7"
        );
    }
}
