//! Serving-process control: spawning, ptrace requests, wait-status decoding.
//!
//! Every `unsafe` block in the harness library lives here or in
//! [`crate::allocators`].

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use libc::{c_long, c_uint, c_void, pid_t};

/// A running serving process that is killed and reaped on drop.
#[derive(Debug)]
pub struct ServerProcess {
    pid: pid_t,
    reaped: bool,
}

impl ServerProcess {
    /// Start `server <fd>` with one end of a fresh socket pair.
    ///
    /// The child's end is inheritable only in the child; stdin is null.
    /// Returns the process guard and the parent's end of the socket.
    pub fn spawn(server: &Path, env: &[(String, String)]) -> io::Result<(Self, UnixStream)> {
        let (ours, theirs) = UnixStream::pair()?;
        let child_fd = theirs.as_raw_fd();

        let mut cmd = Command::new(server);
        cmd.arg(child_fd.to_string())
            .stdin(Stdio::null())
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        // SAFETY: fcntl is async-signal-safe and touches only the inherited fd.
        unsafe {
            cmd.pre_exec(move || {
                if libc::fcntl(child_fd, libc::F_SETFD, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        drop(theirs);

        let pid = pid_t::try_from(child.id()).map_err(io::Error::other)?;
        Ok((Self { pid, reaped: false }, ours))
    }

    #[must_use]
    pub fn pid(&self) -> pid_t {
        self.pid
    }

    /// Send `SIGKILL` unless the exit status was already collected.
    /// Returns whether a signal went out.
    pub fn kill(&self) -> bool {
        if self.reaped {
            return false;
        }
        // SAFETY: plain kill(2) on a pid we own and have not reaped.
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
        true
    }

    /// Record that the exit status was already collected.
    pub fn mark_reaped(&mut self) {
        self.reaped = true;
    }

    #[must_use]
    pub fn is_reaped(&self) -> bool {
        self.reaped
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let _ = self.kill();
        loop {
            match wait_event(self.pid) {
                Ok(WaitEvent::Exited(_) | WaitEvent::Signaled(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.reaped = true;
    }
}

// ---------------------------------------------------------------------------
// ptrace
// ---------------------------------------------------------------------------

fn ptrace_raw(request: c_uint, pid: pid_t, addr: usize, data: usize) -> io::Result<c_long> {
    // SAFETY: none of the requests issued here read or write tracer memory
    // except GETREGS/GETREGSET, whose buffers are supplied by the callers
    // below with the size the kernel expects.
    let ret = unsafe { libc::ptrace(request, pid, addr as *mut c_void, data as *mut c_void) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// Called in the serving process: ask to be traced by the parent, then stop
/// until the tracer is ready. Does not allocate.
pub fn stop_for_tracer() -> io::Result<()> {
    ptrace_raw(libc::PTRACE_TRACEME, 0, 0, 0)?;
    // SAFETY: raise(3) with a valid signal number.
    if unsafe { libc::raise(libc::SIGSTOP) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Mark syscall stops with `SIGTRAP | 0x80` and kill the tracee if we exit.
pub fn set_trace_options(pid: pid_t) -> io::Result<()> {
    let options = (libc::PTRACE_O_TRACESYSGOOD | libc::PTRACE_O_EXITKILL) as usize;
    ptrace_raw(libc::PTRACE_SETOPTIONS, pid, 0, options).map(drop)
}

/// Resume until the next syscall entry or exit, delivering `signal` (0 for none).
pub fn resume_to_syscall(pid: pid_t, signal: i32) -> io::Result<()> {
    ptrace_raw(libc::PTRACE_SYSCALL, pid, 0, signal as usize).map(drop)
}

/// Stop tracing and let the process run freely.
pub fn detach(pid: pid_t, signal: i32) -> io::Result<()> {
    ptrace_raw(libc::PTRACE_DETACH, pid, 0, signal as usize).map(drop)
}

/// Register snapshot at a syscall stop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRegs {
    pub number: i64,
    pub args: [u64; 6],
    /// Meaningful only at syscall exit.
    pub ret: i64,
}

#[cfg(target_arch = "x86_64")]
pub fn syscall_regs(pid: pid_t) -> io::Result<SyscallRegs> {
    let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::zeroed();
    ptrace_raw(libc::PTRACE_GETREGS, pid, 0, regs.as_mut_ptr() as usize)?;
    // SAFETY: zero-initialised plain-old-data, filled in by the kernel.
    let regs = unsafe { regs.assume_init() };
    Ok(SyscallRegs {
        number: regs.orig_rax as i64,
        args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
        ret: regs.rax as i64,
    })
}

#[cfg(target_arch = "aarch64")]
pub fn syscall_regs(pid: pid_t) -> io::Result<SyscallRegs> {
    const NT_PRSTATUS: usize = 1;
    let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::zeroed();
    let mut iov = libc::iovec {
        iov_base: regs.as_mut_ptr().cast::<c_void>(),
        iov_len: size_of::<libc::user_regs_struct>(),
    };
    ptrace_raw(
        libc::PTRACE_GETREGSET,
        pid,
        NT_PRSTATUS,
        (&raw mut iov) as usize,
    )?;
    // SAFETY: zero-initialised plain-old-data, filled in by the kernel.
    let regs = unsafe { regs.assume_init() };
    Ok(SyscallRegs {
        number: regs.regs[8] as i64,
        args: [
            regs.regs[0],
            regs.regs[1],
            regs.regs[2],
            regs.regs[3],
            regs.regs[4],
            regs.regs[5],
        ],
        ret: regs.regs[0] as i64,
    })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn syscall_regs(_pid: pid_t) -> io::Result<SyscallRegs> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "syscall register access is implemented for x86_64 and aarch64 only",
    ))
}

// ---------------------------------------------------------------------------
// waitpid
// ---------------------------------------------------------------------------

/// What a `waitpid` on the serving process reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// Syscall entry or exit (`SIGTRAP | 0x80` with `PTRACE_O_TRACESYSGOOD`).
    SyscallStop,
    /// Signal-delivery stop carrying this signal.
    SignalStop(i32),
    Exited(i32),
    Signaled(i32),
    /// Any other status word.
    Other(i32),
}

/// Block until `pid` changes state. `EINTR` is retried.
pub fn wait_event(pid: pid_t) -> io::Result<WaitEvent> {
    let mut status = 0;
    loop {
        // SAFETY: status points to a live c_int.
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r != -1 {
            return Ok(decode_status(status));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[must_use]
pub fn decode_status(status: i32) -> WaitEvent {
    if libc::WIFEXITED(status) {
        WaitEvent::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        WaitEvent::Signaled(libc::WTERMSIG(status))
    } else if libc::WIFSTOPPED(status) {
        match libc::WSTOPSIG(status) {
            sig if sig == libc::SIGTRAP | 0x80 => WaitEvent::SyscallStop,
            sig => WaitEvent::SignalStop(sig),
        }
    } else {
        WaitEvent::Other(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped(sig: i32) -> i32 {
        (sig << 8) | 0x7f
    }

    #[test]
    fn decodes_exit_and_signal_statuses() {
        assert_eq!(decode_status(3 << 8), WaitEvent::Exited(3));
        assert_eq!(decode_status(0), WaitEvent::Exited(0));
        assert_eq!(decode_status(libc::SIGKILL), WaitEvent::Signaled(libc::SIGKILL));
    }

    #[test]
    fn syscall_stops_are_distinguished_from_signal_stops() {
        assert_eq!(decode_status(stopped(libc::SIGTRAP | 0x80)), WaitEvent::SyscallStop);
        assert_eq!(decode_status(stopped(libc::SIGTRAP)), WaitEvent::SignalStop(libc::SIGTRAP));
        assert_eq!(decode_status(stopped(libc::SIGSTOP)), WaitEvent::SignalStop(libc::SIGSTOP));
    }

    #[test]
    fn missing_server_binary_fails_to_spawn() {
        let err = ServerProcess::spawn(Path::new("/nonexistent/runtrace"), &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn dropped_guard_kills_and_reaps() {
        let (server, _stream) = ServerProcess::spawn(Path::new("sleep"), &[]).unwrap();
        let pid = server.pid();
        drop(server);
        // SAFETY: probing with signal 0 only.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "child {pid} should be gone after drop");
    }

    #[test]
    fn reaped_guard_sends_no_signal() {
        let (mut server, _stream) = ServerProcess::spawn(Path::new("true"), &[]).unwrap();
        assert_eq!(wait_event(server.pid()).unwrap(), WaitEvent::Exited(0));
        server.mark_reaped();
        assert!(server.is_reaped());
        assert!(!server.kill());
        drop(server);
    }
}
