//! Evaluation configuration.
//!
//! Everything the evaluator needs is carried in an explicit [`EvalConfig`]
//! value; there is no process-wide state. Defaults can be overridden by
//! environment variables, and CLI flags override both:
//! - `ALLOCUTIL_RUNTRACE`: path of the serving binary (default `./runtrace`)
//! - `ALLOCUTIL_TRACE_DIR`: directory of the default trace set (default `./traces/`)
//!
//! The serving binary itself reads:
//! - `ALLOCUTIL_ALLOCATOR`: `libc` (default) or `pool`
//! - `ALLOCUTIL_POOL_BYTES`: pool capacity when `pool` is selected

use std::path::{Path, PathBuf};

use thiserror::Error;

pub const SERVER_ENV: &str = "ALLOCUTIL_RUNTRACE";
pub const TRACE_DIR_ENV: &str = "ALLOCUTIL_TRACE_DIR";
pub const ALLOCATOR_ENV: &str = "ALLOCUTIL_ALLOCATOR";
pub const POOL_BYTES_ENV: &str = "ALLOCUTIL_POOL_BYTES";

pub const DEFAULT_SERVER: &str = "./runtrace";
pub const DEFAULT_TRACE_DIR: &str = "./traces/";
pub const DEFAULT_POOL_BYTES: usize = 64 << 20;

/// Trace files evaluated when no `-f` is given, relative to the trace dir.
pub const DEFAULT_TRACEFILES: &[&str] = &[
    "short-alloc-free.rep",
    "short-realloc.rep",
    "mixed-sizes.rep",
    "realloc-grow.rep",
    "large-blocks.rep",
];

/// How much diagnostic output the evaluator prints to stdout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Verbosity(u8);

impl Verbosity {
    /// Results only.
    pub const QUIET: Self = Self(0);
    /// Memory-growth syscalls, heap summary, hint mismatches.
    pub const SYSCALLS: Self = Self(1);
    /// Every syscall and every replayed operation.
    pub const ALL: Self = Self(2);

    #[must_use]
    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    #[must_use]
    pub const fn level(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn includes(self, at: Self) -> bool {
        at != Self::QUIET && self >= at
    }
}

/// Settings threaded into the evaluator at construction time.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Serving binary that hosts the allocator under test.
    pub server: PathBuf,
    /// Extra environment for the serving binary (allocator selection).
    pub server_env: Vec<(String, String)>,
    pub verbosity: Verbosity,
    /// Prefix of structured log trace ids for this process.
    pub run_id: String,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            server: PathBuf::from(DEFAULT_SERVER),
            server_env: Vec::new(),
            verbosity: Verbosity::QUIET,
            run_id: default_run_id(),
        }
    }
}

impl EvalConfig {
    /// Defaults, with `ALLOCUTIL_RUNTRACE` applied when set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(server) = std::env::var_os(SERVER_ENV).filter(|v| !v.is_empty()) {
            cfg.server = PathBuf::from(server);
        }
        cfg
    }

    #[must_use]
    pub fn with_server(mut self, server: impl Into<PathBuf>) -> Self {
        self.server = server.into();
        self
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_server_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.server_env.push((key.into(), value.into()));
        self
    }

    /// Run the serving binary with a fixed pool of `bytes` instead of libc malloc.
    #[must_use]
    pub fn with_pool_allocator(self, bytes: usize) -> Self {
        self.with_server_env(ALLOCATOR_ENV, "pool")
            .with_server_env(POOL_BYTES_ENV, bytes.to_string())
    }
}

fn default_run_id() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("allocutil-{}-{secs}", std::process::id())
}

/// Which trace files to run and where they live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSelection {
    pub dir: PathBuf,
    pub files: Vec<String>,
}

impl TraceSelection {
    /// A single named file relative to the current directory (`-f`), or
    /// the default set under `dir`, `ALLOCUTIL_TRACE_DIR`, or `./traces/`.
    #[must_use]
    pub fn resolve(file: Option<String>, dir: Option<PathBuf>) -> Self {
        if let Some(file) = file {
            return Self {
                dir: PathBuf::from("./"),
                files: vec![file],
            };
        }
        let dir = dir
            .or_else(|| std::env::var_os(TRACE_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TRACE_DIR));
        Self {
            dir,
            files: DEFAULT_TRACEFILES.iter().map(|f| (*f).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown allocator '{0}', expected libc|pool")]
    UnknownAllocator(String),
    #[error("bad pool size '{0}'")]
    BadPoolSize(String),
}

/// Allocator the serving binary hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorChoice {
    /// The process's own `malloc`/`realloc`/`free`.
    Libc,
    /// A fixed anonymous mapping of the given size, carved without padding.
    Pool(usize),
}

impl AllocatorChoice {
    /// Interpret the raw `ALLOCUTIL_ALLOCATOR` / `ALLOCUTIL_POOL_BYTES` values.
    ///
    /// Does not allocate on success; the serving binary calls this before
    /// it is traced and must not disturb the heap.
    pub fn parse(kind: Option<&str>, pool_bytes: Option<&str>) -> Result<Self, ConfigError> {
        match kind.map(str::trim) {
            None | Some("") | Some("libc") | Some("malloc") => Ok(Self::Libc),
            Some("pool") => {
                let bytes = match pool_bytes.map(str::trim) {
                    None | Some("") => DEFAULT_POOL_BYTES,
                    Some(raw) => raw
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| ConfigError::BadPoolSize(raw.to_string()))?,
                };
                Ok(Self::Pool(bytes))
            }
            Some(other) => Err(ConfigError::UnknownAllocator(other.to_string())),
        }
    }
}
