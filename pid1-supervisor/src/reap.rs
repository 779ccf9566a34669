//! Signal forwarding and zombie reaping.
//!
//! As PID 1 (or a subreaper) every orphan in the container ends up as our
//! child, so a sweep always drains *all* reapable children, not just the main
//! one. Orphans are reaped and discarded.

use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::error::{Result, SupervisorError};
use crate::exit_status::RawStatus;
use crate::signals::signal_name;

/// Kernel-facing operations of the main loop, behind a trait so the loop can
/// be driven by a scripted table in tests.
pub trait ProcessTable {
    /// `kill(2)`; `target` may be a negated process group id.
    fn kill(&mut self, target: libc::pid_t, signo: libc::c_int) -> std::result::Result<(), Errno>;

    /// Non-blocking `waitpid(-1)`. `Ok(None)` when nothing is reapable,
    /// including when there are no children at all.
    fn try_reap(&mut self) -> std::result::Result<Option<(Pid, RawStatus)>, Errno>;
}

/// The real process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

impl ProcessTable for Kernel {
    fn kill(&mut self, target: libc::pid_t, signo: libc::c_int) -> std::result::Result<(), Errno> {
        // SAFETY: kill only reads its arguments.
        Errno::result(unsafe { libc::kill(target, signo) }).map(drop)
    }

    fn try_reap(&mut self) -> std::result::Result<Option<(Pid, RawStatus)>, Errno> {
        let mut status: libc::c_int = 0;
        // SAFETY: status is written by the kernel on success.
        let result = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        match result {
            0 => Ok(None),
            pid if pid > 0 => Ok(Some((Pid::from_raw(pid), RawStatus(status)))),
            _ => match Errno::last() {
                Errno::ECHILD => Ok(None),
                errno => Err(errno),
            },
        }
    }
}

/// Where forwarded signals go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardMode {
    /// The main child only.
    #[default]
    Process,
    /// The main child's whole process group.
    ProcessGroup,
}

impl ForwardMode {
    pub fn target(self, main: Pid) -> libc::pid_t {
        match self {
            Self::Process => main.as_raw(),
            Self::ProcessGroup => -main.as_raw(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered,
    /// The target no longer exists (ESRCH).
    ChildGone,
}

/// Forward `signo` verbatim to the main child (or its group).
pub fn forward_signal<P: ProcessTable>(
    table: &mut P,
    main: Pid,
    mode: ForwardMode,
    signo: libc::c_int,
) -> Result<Forwarded> {
    let target = mode.target(main);
    debug!(target, "passing signal: {}", signal_name(signo));
    match table.kill(target, signo) {
        Ok(()) => Ok(Forwarded::Delivered),
        Err(Errno::ESRCH) => {
            warn!(target, "child was dead when forwarding signal");
            Ok(Forwarded::ChildGone)
        }
        Err(source) => Err(SupervisorError::Forward {
            signal: signo,
            target,
            source,
        }),
    }
}

/// Outcome of one reap sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sweep {
    /// Number of children reaped, main included.
    pub reaped: usize,
    /// Raw status of the main child if it was reaped in this sweep.
    pub main_status: Option<RawStatus>,
}

impl Sweep {
    pub fn is_empty(&self) -> bool {
        self.reaped == 0
    }
}

/// Reap every currently reapable child without blocking.
///
/// Keeps going after the main child is found so siblings that died in the
/// same window are drained before the caller reports the exit.
pub fn reap_zombies<P: ProcessTable>(table: &mut P, main: Pid, warn_on_reap: bool) -> Result<Sweep> {
    let mut sweep = Sweep::default();
    loop {
        let Some((pid, status)) = table.try_reap().map_err(SupervisorError::Wait)? else {
            trace!("no child to reap");
            return Ok(sweep);
        };
        sweep.reaped += 1;
        if pid == main {
            debug!(pid = pid.as_raw(), "reaped main child");
            sweep.main_status = Some(status);
        } else if warn_on_reap {
            warn!(pid = pid.as_raw(), "reaped zombie process");
        } else {
            debug!(pid = pid.as_raw(), "reaped zombie process");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::*;

    /// Scripted process table. `reaps` is consumed one entry per `try_reap`
    /// call; `None` ends a sweep.
    #[derive(Debug, Default)]
    pub struct ScriptedTable {
        pub reaps: VecDeque<Option<(Pid, RawStatus)>>,
        pub kills: Vec<(libc::pid_t, libc::c_int)>,
        pub kill_result: Option<Errno>,
    }

    impl ScriptedTable {
        pub fn with_reaps<I>(reaps: I) -> Self
        where
            I: IntoIterator<Item = Option<(i32, i32)>>,
        {
            Self {
                reaps: reaps
                    .into_iter()
                    .map(|r| r.map(|(pid, status)| (Pid::from_raw(pid), RawStatus(status))))
                    .collect(),
                ..Self::default()
            }
        }
    }

    impl ProcessTable for ScriptedTable {
        fn kill(&mut self, target: libc::pid_t, signo: libc::c_int) -> std::result::Result<(), Errno> {
            self.kills.push((target, signo));
            match self.kill_result {
                Some(errno) => Err(errno),
                None => Ok(()),
            }
        }

        fn try_reap(&mut self) -> std::result::Result<Option<(Pid, RawStatus)>, Errno> {
            Ok(self.reaps.pop_front().flatten())
        }
    }
}
