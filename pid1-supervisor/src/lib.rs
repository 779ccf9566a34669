//! Signal forwarding, zombie reaping and exit status propagation for a
//! process running as PID 1 (or as a child subreaper).
//!
//! The supervisor spawns one main command, forwards every signal it receives
//! to it and reaps every child that gets reparented to it. When the main
//! command terminates, its status is translated into a shell-style exit code.

pub mod error;
pub mod exit_status;
pub mod isolate;
pub mod reap;
pub mod signals;
pub mod spawn;
pub mod subreaper;
pub mod supervisor;

pub use error::{Result, SupervisorError};
pub use exit_status::{ExitCodeRemap, RawStatus, Termination, exit_code};
pub use reap::{ForwardMode, Kernel, ProcessTable};
pub use signals::{SignalConfiguration, SignalSet, SignalSource};
pub use spawn::{ExecArgs, Role};
pub use supervisor::{DEFAULT_WAIT_TIMEOUT, Phase, Supervisor, SupervisorConfig};
