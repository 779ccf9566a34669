//! Child isolation: own process group, terminal foreground if there is one.
//!
//! Runs in the forked child. Doing it there rather than in the parent avoids
//! the race where a nested supervisor's parent hands the foreground to the
//! wrong group. The child can take the terminal because SIGTTOU is still
//! ignored at this point (restored only afterwards).

use nix::errno::Errno;
use nix::unistd::{Pid, getpgrp, setpgid};

#[derive(Debug, thiserror::Error)]
pub enum IsolateError {
    #[error("setpgid failed: {0}")]
    SetPgid(#[source] Errno),

    #[error("tcsetpgrp failed: {0}")]
    TcSetPgrp(#[source] Errno),
}

/// Whether a `tcsetpgrp` failure just means there is no usable terminal.
pub fn is_missing_terminal(errno: Errno) -> bool {
    // ENXIO shows up on lx-branded zones.
    matches!(errno, Errno::ENOTTY | Errno::ENXIO)
}

/// Put the calling process into a new process group and, if stdin is a
/// terminal, make that group the foreground group.
pub fn isolate_child() -> Result<(), IsolateError> {
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(IsolateError::SetPgid)?;

    // SAFETY: tcsetpgrp only reads its arguments.
    let ret = unsafe { libc::tcsetpgrp(libc::STDIN_FILENO, getpgrp().as_raw()) };
    match Errno::result(ret) {
        Ok(_) => Ok(()),
        Err(errno) if is_missing_terminal(errno) => Ok(()),
        Err(errno) => Err(IsolateError::TcSetPgrp(errno)),
    }
}
