//! CLI entrypoint: measure allocator space utilization over a set of traces.

use std::path::{Path, PathBuf};

use allocutil_core::load_trace;
use allocutil_harness::config::{EvalConfig, TraceSelection, Verbosity};
use allocutil_harness::evaluator::Evaluator;
use allocutil_harness::report;
use allocutil_harness::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, sha256_hex};
use clap::{ArgAction, Parser};

/// Replays allocation traces against a traced serving process and reports
/// peak live bytes over peak consumed address space.
#[derive(Debug, Parser)]
#[command(name = "allocutil", disable_version_flag = true)]
struct Cli {
    /// Run only this trace file, relative to the current directory.
    #[arg(short = 'f', value_name = "FILE")]
    file: Option<String>,
    /// Directory holding the default trace set.
    #[arg(short = 't', value_name = "DIR")]
    trace_dir: Option<PathBuf>,
    /// Serving binary hosting the allocator under test.
    #[arg(short = 's', value_name = "PATH")]
    server: Option<PathBuf>,
    /// Print diagnostics as JSONL on stdout (repeat for more).
    #[arg(short = 'v', short_alias = 'V', action = ArgAction::Count)]
    verbose: u8,
    /// Write run-level structured events to this JSONL file.
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,
}

struct RunLog(Option<LogEmitter>);

impl RunLog {
    fn open(path: Option<&Path>, run_id: &str) -> std::io::Result<Self> {
        path.map(|p| LogEmitter::to_file(p, run_id, "run"))
            .transpose()
            .map(Self)
    }

    fn emit(&mut self, entry: LogEntry) -> std::io::Result<()> {
        match self.0.as_mut() {
            Some(emitter) => emitter.emit_entry(entry),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.as_mut() {
            Some(emitter) => emitter.flush(),
            None => Ok(()),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = EvalConfig::from_env().with_verbosity(Verbosity::new(cli.verbose));
    if let Some(server) = cli.server {
        config = config.with_server(server);
    }
    let selection = TraceSelection::resolve(cli.file, cli.trace_dir);
    let mut log = RunLog::open(cli.log.as_deref(), &config.run_id)?;
    let mut evaluator = Evaluator::new(config);

    let mut failed = 0usize;
    for name in &selection.files {
        let path = selection.dir().join(name);
        let display = name.clone();

        let mut trace = match load_trace(selection.dir(), name) {
            Ok(trace) => trace,
            Err(err) => {
                eprintln!("{}", report::failure_line(&display, "load", &err));
                log.emit(
                    LogEntry::new("", LogLevel::Error, "trace_load_failed")
                        .with_trace_file(display.as_str())
                        .with_outcome(Outcome::Fail)
                        .with_details(serde_json::json!({ "error": err.to_string() })),
                )?;
                failed += 1;
                continue;
            }
        };

        let mut loaded = LogEntry::new("", LogLevel::Info, "trace_loaded")
            .with_trace_file(display.as_str())
            .with_details(serde_json::json!({
                "operations": trace.operations().len(),
                "blocks": trace.block_count(),
                "declared_peak_bytes": trace.declared_peak_bytes,
            }));
        if let Ok(bytes) = std::fs::read(&path) {
            loaded = loaded.with_sha256(sha256_hex(&bytes));
        }
        log.emit(loaded)?;

        match evaluator.evaluate(&mut trace) {
            Ok(eval) => {
                println!("{}", report::result_line(&display, eval.utilization));
                log.emit(
                    LogEntry::new("", LogLevel::Info, "evaluation_complete")
                        .with_trace_file(display.as_str())
                        .with_size(eval.sample.peak_live_bytes)
                        .with_outcome(if eval.utilization.is_valid() {
                            Outcome::Pass
                        } else {
                            Outcome::Invalid
                        })
                        .with_exit_code(eval.exit.code())
                        .with_duration_ms(eval.elapsed.as_millis() as u64)
                        .with_details(serde_json::json!({
                            "peak_consumed_bytes": eval.sample.peak_consumed_bytes,
                            "utilization": eval.utilization,
                            "requests_sent": eval.replay.requests_sent,
                        })),
                )?;
            }
            Err(err) => {
                eprintln!("{}", report::eval_failure_line(&display, &err));
                log.emit(
                    LogEntry::new("", LogLevel::Error, "evaluation_failed")
                        .with_trace_file(display.as_str())
                        .with_outcome(Outcome::Fail)
                        .with_details(serde_json::json!({
                            "step": err.step(),
                            "error": err.to_string(),
                        })),
                )?;
                failed += 1;
            }
        }
    }
    log.flush()?;

    if failed > 0 {
        return Err(format!("{failed} of {} trace(s) failed", selection.files.len()).into());
    }
    Ok(())
}
