//! Footprint tracing strategies.
//!
//! [`SyscallTracer`] follows the serving process with ptrace and folds
//! every completed `brk` and `mmap` into a [`HeapFootprint`].
//! [`NoopTracer`] releases the process untraced and reports nothing.

use std::io;

use allocutil_core::HeapFootprint;
use libc::pid_t;
use serde::Serialize;
use thiserror::Error;

use crate::config::Verbosity;
use crate::process::{self, SyscallRegs, WaitEvent};
use crate::structured_log::{Diagnostics, LogLevel};

#[derive(Debug, Error)]
pub enum TracerError {
    #[error("{step} on pid {pid}: {source}")]
    Os {
        step: &'static str,
        pid: pid_t,
        #[source]
        source: io::Error,
    },
    #[error("serving process {0} before stopping for the tracer")]
    NotStopped(ExitKind),
    #[error("expected the serving process to stop with SIGSTOP, got {0:?}")]
    UnexpectedStop(WaitEvent),
    #[error("syscall stops out of step: entered {entered}, exited {exited}")]
    Desync { entered: i64, exited: i64 },
}

impl TracerError {
    /// Whether the tracer already collected the exit status of the process
    /// it was following. The pid must not be signalled after that.
    #[must_use]
    pub fn child_reaped(&self) -> bool {
        matches!(self, Self::NotStopped(_))
    }
}

fn os_err(step: &'static str, pid: pid_t) -> impl FnOnce(io::Error) -> TracerError {
    move |source| TracerError::Os { step, pid, source }
}

/// How the serving process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
}

impl ExitKind {
    #[must_use]
    pub fn is_clean(self) -> bool {
        self == Self::Exited(0)
    }

    /// Exit status, or `128 + signal` for a signal death.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => 128 + sig,
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(sig) => write!(f, "was killed by signal {sig}"),
        }
    }
}

/// Result of following one serving process to its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracedRun {
    pub footprint: HeapFootprint,
    pub exit: ExitKind,
    /// Completed syscalls observed (entry and exit both seen).
    pub syscalls: u64,
}

/// A way of measuring what the serving process took from the OS.
///
/// `trace` is called on the thread that spawned `pid`, right after the
/// spawn. It must not return before the process has been reaped, unless it
/// fails. A failure that did reap it must report so through
/// [`TracerError::child_reaped`].
pub trait FootprintTracer {
    fn trace(&mut self, pid: pid_t, diag: &mut Diagnostics) -> Result<TracedRun, TracerError>;
}

/// Wait for the serving process's self-inflicted `SIGSTOP`.
fn wait_for_initial_stop(pid: pid_t) -> Result<(), TracerError> {
    match process::wait_event(pid).map_err(os_err("waitpid", pid))? {
        WaitEvent::SignalStop(libc::SIGSTOP) => Ok(()),
        WaitEvent::Exited(code) => Err(TracerError::NotStopped(ExitKind::Exited(code))),
        WaitEvent::Signaled(sig) => Err(TracerError::NotStopped(ExitKind::Signaled(sig))),
        other => Err(TracerError::UnexpectedStop(other)),
    }
}

/// ptrace-based footprint measurement.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallTracer;

impl FootprintTracer for SyscallTracer {
    fn trace(&mut self, pid: pid_t, diag: &mut Diagnostics) -> Result<TracedRun, TracerError> {
        wait_for_initial_stop(pid)?;
        process::set_trace_options(pid).map_err(os_err("PTRACE_SETOPTIONS", pid))?;
        process::resume_to_syscall(pid, 0).map_err(os_err("PTRACE_SYSCALL", pid))?;

        let mut footprint = HeapFootprint::new();
        let mut syscalls = 0u64;
        let mut entry: Option<SyscallRegs> = None;

        loop {
            let signal = match process::wait_event(pid).map_err(os_err("waitpid", pid))? {
                WaitEvent::Exited(code) => {
                    return Ok(TracedRun {
                        footprint,
                        exit: ExitKind::Exited(code),
                        syscalls,
                    });
                }
                WaitEvent::Signaled(sig) => {
                    return Ok(TracedRun {
                        footprint,
                        exit: ExitKind::Signaled(sig),
                        syscalls,
                    });
                }
                WaitEvent::SyscallStop => {
                    let regs = process::syscall_regs(pid).map_err(os_err("read registers", pid))?;
                    match entry.take() {
                        None => entry = Some(regs),
                        Some(entered) => {
                            if entered.number != regs.number {
                                return Err(TracerError::Desync {
                                    entered: entered.number,
                                    exited: regs.number,
                                });
                            }
                            syscalls += 1;
                            record_syscall(&mut footprint, &entered, regs.ret, diag);
                        }
                    }
                    0
                }
                WaitEvent::SignalStop(sig) => sig,
                WaitEvent::Other(_) => 0,
            };
            process::resume_to_syscall(pid, signal).map_err(os_err("PTRACE_SYSCALL", pid))?;
        }
    }
}

/// A failed `mmap` returns `-errno`.
fn is_error_return(ret: i64) -> bool {
    (-4095..0).contains(&ret)
}

/// Fold one completed syscall into `footprint`.
fn record_syscall(
    footprint: &mut HeapFootprint,
    entered: &SyscallRegs,
    ret: i64,
    diag: &mut Diagnostics,
) {
    let number = entered.number;
    if number == libc::SYS_brk as i64 {
        let requested = entered.args[0] as usize;
        let returned = ret as usize;
        footprint.observe_brk(requested, returned);
        diag.log(
            Verbosity::SYSCALLS,
            Diagnostics::entry(LogLevel::Info, "syscall")
                .with_syscall("brk")
                .with_address(returned)
                .with_details(serde_json::json!({ "requested": format!("{requested:#x}") })),
        );
    } else if number == libc::SYS_mmap as i64 {
        let length = entered.args[1] as usize;
        let anonymous = entered.args[3] & libc::MAP_ANONYMOUS as u64 != 0;
        if is_error_return(ret) {
            diag.log(
                Verbosity::SYSCALLS,
                Diagnostics::entry(LogLevel::Warn, "syscall_failed")
                    .with_syscall("mmap")
                    .with_size(length)
                    .with_details(serde_json::json!({ "errno": -ret })),
            );
            return;
        }
        footprint.observe_mmap(length, anonymous);
        diag.log(
            Verbosity::SYSCALLS,
            Diagnostics::entry(LogLevel::Info, "syscall")
                .with_syscall("mmap")
                .with_address(ret as usize)
                .with_size(length)
                .with_details(serde_json::json!({ "anonymous": anonymous })),
        );
    } else {
        diag.log(
            Verbosity::ALL,
            Diagnostics::entry(LogLevel::Debug, "syscall").with_syscall(format!("syscall_{number}")),
        );
    }
}

/// Lets the serving process run without measuring anything.
///
/// Every run it follows reports a zero footprint, so the resulting
/// utilization is always invalid.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl FootprintTracer for NoopTracer {
    fn trace(&mut self, pid: pid_t, _diag: &mut Diagnostics) -> Result<TracedRun, TracerError> {
        wait_for_initial_stop(pid)?;
        process::detach(pid, 0).map_err(os_err("PTRACE_DETACH", pid))?;
        loop {
            let exit = match process::wait_event(pid).map_err(os_err("waitpid", pid))? {
                WaitEvent::Exited(code) => ExitKind::Exited(code),
                WaitEvent::Signaled(sig) => ExitKind::Signaled(sig),
                _ => continue,
            };
            return Ok(TracedRun {
                footprint: HeapFootprint::new(),
                exit,
                syscalls: 0,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs(number: i64, args: [u64; 6]) -> SyscallRegs {
        SyscallRegs {
            number,
            args,
            ret: 0,
        }
    }

    #[test]
    fn brk_calls_move_the_break() {
        let mut fp = HeapFootprint::new();
        let mut diag = Diagnostics::disabled();
        record_syscall(&mut fp, &regs(libc::SYS_brk as i64, [0; 6]), 0x1000, &mut diag);
        record_syscall(
            &mut fp,
            &regs(libc::SYS_brk as i64, [0x22000, 0, 0, 0, 0, 0]),
            0x22000,
            &mut diag,
        );
        assert_eq!(fp.brk_calls, 2);
        assert_eq!(fp.peak_consumed(), 0x21000);
    }

    #[test]
    fn anonymous_mmaps_count_and_file_mmaps_do_not() {
        let mut fp = HeapFootprint::new();
        let mut diag = Diagnostics::disabled();
        let anon = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
        let file = libc::MAP_PRIVATE as u64;
        record_syscall(
            &mut fp,
            &regs(libc::SYS_mmap as i64, [0, 8192, 3, anon, u64::MAX, 0]),
            0x7f00_0000_0000,
            &mut diag,
        );
        record_syscall(
            &mut fp,
            &regs(libc::SYS_mmap as i64, [0, 1 << 20, 1, file, 3, 0]),
            0x7f00_1000_0000,
            &mut diag,
        );
        assert_eq!(fp.mmap_calls, 2);
        assert_eq!(fp.peak_consumed(), 8192);
    }

    #[test]
    fn failed_mmaps_are_skipped() {
        let mut fp = HeapFootprint::new();
        let mut diag = Diagnostics::disabled();
        let anon = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
        record_syscall(
            &mut fp,
            &regs(libc::SYS_mmap as i64, [0, 1 << 40, 3, anon, u64::MAX, 0]),
            -i64::from(libc::ENOMEM),
            &mut diag,
        );
        assert_eq!(fp.peak_consumed(), 0);
    }

    #[test]
    fn other_syscalls_contribute_nothing() {
        let mut fp = HeapFootprint::new();
        let mut diag = Diagnostics::disabled();
        record_syscall(&mut fp, &regs(libc::SYS_write as i64, [1, 0, 5, 0, 0, 0]), 5, &mut diag);
        assert_eq!(fp, HeapFootprint::new());
    }

    #[test]
    fn exit_kind_rendering() {
        assert!(ExitKind::Exited(0).is_clean());
        assert!(!ExitKind::Exited(1).is_clean());
        assert_eq!(ExitKind::Signaled(9).code(), 137);
        assert_eq!(ExitKind::Signaled(9).to_string(), "was killed by signal 9");
    }
}
