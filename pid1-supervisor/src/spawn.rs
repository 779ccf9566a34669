//! Fork/exec of supervised commands.
//!
//! Every command (pre, main, post) goes through the same path: fork, isolate
//! the child, undo the supervisor's signal configuration, exec. Between fork
//! and exec the child never returns into shared code; any failure ends in
//! `_exit` with a shell-style status.

use std::ffi::{CString, OsStr};
use std::fmt;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::unistd::{ForkResult, Pid, fork};
use tracing::{debug, info};

use crate::error::{Result, SupervisorError};
use crate::exit_status::{ExitCodeRemap, RawStatus, exit_code};
use crate::isolate::{IsolateError, isolate_child};
use crate::signals::SignalConfiguration;

/// Exit status when the program could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit status when the program is not executable.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Exit status for any other failure between fork and exec.
pub const EXIT_CHILD_SETUP: i32 = 1;

/// Longest diagnostic line the forked child writes.
const FATAL_LINE_MAX: usize = 512;

/// Argument vector for one command, converted to C strings up front so the
/// child does not have to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecArgs {
    program: CString,
    argv: Vec<CString>,
}

impl ExecArgs {
    pub fn new<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv = args
            .into_iter()
            .map(|arg| {
                let arg = arg.as_ref();
                CString::new(arg.as_bytes())
                    .map_err(|_| SupervisorError::InvalidArgument(arg.to_string_lossy().into_owned()))
            })
            .collect::<Result<Vec<_>>>()?;
        let program = argv.first().cloned().ok_or(SupervisorError::EmptyCommand)?;
        Ok(Self { program, argv })
    }

    /// Split a command line on whitespace. No quoting rules apply.
    pub fn from_command_line(line: &str) -> Result<Self> {
        Self::new(line.split_whitespace())
    }

    pub fn program(&self) -> &CString {
        &self.program
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }
}

impl fmt::Display for ExecArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Which phase a child belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Pre,
    Main,
    Post,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pre => "pre",
            Self::Main => "main",
            Self::Post => "post",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Spawned,
    Running,
    Reaped,
}

/// A child started by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildProcess {
    pub pid: Pid,
    pub role: Role,
    pub state: ChildState,
}

impl ChildProcess {
    pub fn mark_running(&mut self) {
        self.state = ChildState::Running;
    }

    pub fn mark_reaped(&mut self) {
        self.state = ChildState::Reaped;
    }
}

/// Status a child exits with when exec fails with `errno`.
///
/// See <http://www.tldp.org/LDP/abs/html/exitcodes.html>.
pub fn exec_failure_status(errno: Errno) -> i32 {
    match errno {
        Errno::ENOENT => EXIT_NOT_FOUND,
        Errno::EACCES => EXIT_NOT_EXECUTABLE,
        _ => EXIT_CHILD_SETUP,
    }
}

/// Spawns commands with the supervisor's signal configuration undone.
pub struct Spawner<'a> {
    signals: &'a SignalConfiguration,
}

impl<'a> Spawner<'a> {
    pub fn new(signals: &'a SignalConfiguration) -> Self {
        Self { signals }
    }

    /// Fork and exec `args`; returns as soon as the child exists.
    pub fn spawn(&self, role: Role, args: &ExecArgs) -> Result<ChildProcess> {
        // The child must not allocate: build the NULL terminated pointer
        // array here.
        let argv: Vec<*const libc::c_char> = args
            .argv()
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        // SAFETY: the child never returns into the caller; it either execs or
        // leaves through _exit. Arguments were converted before the fork.
        match unsafe { fork() } {
            Err(errno) => Err(SupervisorError::Fork(errno)),
            Ok(ForkResult::Child) => {
                let status = self.exec_child(args, &argv);
                // SAFETY: _exit skips atexit handlers and stdio flushing that
                // belong to the parent.
                unsafe { libc::_exit(status) }
            }
            Ok(ForkResult::Parent { child }) => {
                info!(pid = child.as_raw(), %role, "spawned child process '{args}'");
                Ok(ChildProcess {
                    pid: child,
                    role,
                    state: ChildState::Spawned,
                })
            }
        }
    }

    /// Spawn `args` and block until that child exits. Other children are
    /// left alone.
    pub fn spawn_and_wait(&self, role: Role, args: &ExecArgs) -> Result<u8> {
        let mut child = self.spawn(role, args)?;
        child.mark_running();
        let status = wait_blocking(child.pid)?;
        child.mark_reaped();
        let code = exit_code(child.pid.as_raw(), status, &ExitCodeRemap::new())?;
        debug!(pid = child.pid.as_raw(), %role, code, "child finished");
        Ok(code)
    }

    fn exec_child(&self, args: &ExecArgs, argv: &[*const libc::c_char]) -> i32 {
        if let Err(e) = isolate_child() {
            let (what, errno) = match e {
                IsolateError::SetPgid(errno) => ("setpgid", errno),
                IsolateError::TcSetPgrp(errno) => ("tcsetpgrp", errno),
            };
            child_fatal(&[what.as_bytes(), b" failed: ", errno.desc().as_bytes()]);
            return EXIT_CHILD_SETUP;
        }
        if let Err(e) = self.signals.restore() {
            match e {
                SupervisorError::SignalSetup { op, source } => {
                    child_fatal(&[op.as_bytes(), b" failed: ", source.desc().as_bytes()]);
                }
                _ => child_fatal(&[b"restoring signals failed"]),
            }
            return EXIT_CHILD_SETUP;
        }

        // SAFETY: argv points into args' CStrings and ends with NULL; both
        // outlive the call.
        unsafe { libc::execvp(args.program().as_ptr(), argv.as_ptr()) };
        let errno = Errno::last();
        child_fatal(&[
            b"exec ",
            args.program().to_bytes(),
            b" failed: ",
            errno.desc().as_bytes(),
        ]);
        exec_failure_status(errno)
    }
}

/// Block until `pid` exits, retrying on EINTR.
pub fn wait_blocking(pid: Pid) -> Result<RawStatus> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status is written by the kernel on success.
        let result = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        if result == pid.as_raw() {
            return Ok(RawStatus(status));
        }
        match Errno::last() {
            Errno::EINTR => continue,
            errno => return Err(SupervisorError::Wait(errno)),
        }
    }
}

/// Report a failure from the forked child straight to fd 2, bypassing the
/// tracing subscriber and the allocator, whose locks may be held by another
/// thread. Overlong lines are truncated.
fn child_fatal(parts: &[&[u8]]) {
    let mut line = [0u8; FATAL_LINE_MAX];
    let len = fatal_line(&mut line, parts);
    // SAFETY: the buffer is valid for len bytes. Short writes are ignored.
    unsafe {
        libc::write(libc::STDERR_FILENO, line.as_ptr().cast(), len);
    }
}

/// Assemble `[FATAL pid1] <parts>\n` into `buf`, returning its length.
fn fatal_line(buf: &mut [u8], parts: &[&[u8]]) -> usize {
    // The last byte is kept for the newline.
    let Some((_, body)) = buf.split_last_mut() else {
        return 0;
    };
    let room = body.len();
    let mut rest: &mut [u8] = body;
    for part in std::iter::once(&b"[FATAL pid1] "[..]).chain(parts.iter().copied()) {
        if rest.write_all(part).is_err() {
            break;
        }
    }
    let written = room - rest.len();
    if let Some(end) = buf.get_mut(written) {
        *end = b'\n';
    }
    written + 1
}
