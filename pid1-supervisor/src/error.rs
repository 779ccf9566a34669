//! Error types for the supervisor.

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Failures that end a supervisor run.
///
/// Recoverable conditions (a dead child on forward, an orphan reaped, a
/// failing post command) are logged where they happen and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("signal setup failed: {op}: {source}")]
    SignalSetup {
        op: &'static str,
        #[source]
        source: Errno,
    },

    #[error("failed to set parent death signal: {0}")]
    ParentDeathSignal(#[source] Errno),

    #[error("fork failed: {0}")]
    Fork(#[source] Errno),

    #[error("unexpected error in sigtimedwait: {0}")]
    SignalWait(#[source] Errno),

    #[error("unexpected error when forwarding signal {signal} to {target}: {source}")]
    Forward {
        signal: libc::c_int,
        target: libc::pid_t,
        #[source]
        source: Errno,
    },

    #[error("error while waiting for pids: {0}")]
    Wait(#[source] Errno),

    #[error("child {pid} exited for unknown reason (raw status {status:#x})")]
    UnknownStatus { pid: libc::pid_t, status: libc::c_int },

    #[error("exit code {0} is outside 0-255 and cannot be remapped")]
    RemapOutOfRange(i64),

    #[error("argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),

    #[error("empty command")]
    EmptyCommand,
}
