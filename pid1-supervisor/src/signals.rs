//! Signal configuration for the supervisor and its children.
//!
//! Based on the tini approach: every signal meant for the main loop is
//! blocked and collected synchronously with `sigtimedwait`, never through an
//! async handler. Program error signals stay unblocked so a bug in the
//! supervisor still kills it. SIGTTIN/SIGTTOU are ignored rather than blocked:
//! once the child owns the terminal foreground, writing diagnostics would
//! otherwise stop us when TOSTOP is set.
//!
//! The previous mask and the previous SIGTTIN/SIGTTOU actions are captured
//! exactly once and restored in every spawned child before exec.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction};

use crate::error::{Result, SupervisorError};

/// Signals that must keep their default (fatal) behavior in the supervisor.
pub const PROGRAM_ERROR_SIGNALS: [Signal; 7] = [
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGABRT,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

/// Terminal control signals, ignored in the supervisor and restored in children.
pub const TERMINAL_SIGNALS: [Signal; 2] = [Signal::SIGTTIN, Signal::SIGTTOU];

/// Human readable name for a raw signal number, including realtime signals.
pub fn signal_name(signo: libc::c_int) -> String {
    match Signal::try_from(signo) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {signo}"),
    }
}

/// A set of signals with the handful of set operations the supervisor needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSet(SigSet);

impl SignalSet {
    pub fn all() -> Self {
        Self(SigSet::all())
    }

    pub fn empty() -> Self {
        Self(SigSet::empty())
    }

    pub fn insert(&mut self, signal: Signal) {
        self.0.add(signal);
    }

    pub fn remove(&mut self, signal: Signal) {
        self.0.remove(signal);
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.0.contains(signal)
    }

    /// Membership test for raw numbers, realtime signals included.
    pub fn contains_raw(&self, signo: libc::c_int) -> bool {
        // SAFETY: the sigset_t is owned and initialized by SigSet.
        unsafe { libc::sigismember(self.0.as_ref(), signo) == 1 }
    }

    /// Members of either set. Walks raw numbers up to SIGRTMAX, since
    /// `SigSet::iter` only yields the named signals.
    pub fn union(self, other: &Self) -> Self {
        let mut raw = *self.0.as_ref();
        for signo in 1..=libc::SIGRTMAX() {
            if other.contains_raw(signo) {
                // SAFETY: raw is an initialized sigset_t; invalid numbers are
                // rejected with EINVAL and leave it untouched.
                unsafe { libc::sigaddset(&mut raw, signo) };
            }
        }
        // SAFETY: raw was copied from a valid SigSet and only grown.
        Self(unsafe { SigSet::from_sigset_t_unchecked(raw) })
    }

    pub fn as_sigset(&self) -> &SigSet {
        &self.0
    }
}

/// The set blocked in the supervisor: everything except program error
/// signals and the terminal control pair.
pub fn supervisor_blocked_set() -> SignalSet {
    let mut set = SignalSet::all();
    for signal in PROGRAM_ERROR_SIGNALS.iter().chain(TERMINAL_SIGNALS.iter()) {
        set.remove(*signal);
    }
    set
}

/// What was changed at startup, and how to undo it in a child.
pub struct SignalConfiguration {
    blocked: SignalSet,
    child_mask: SigSet,
    saved_ttin: SigAction,
    saved_ttou: SigAction,
}

impl SignalConfiguration {
    /// Block the supervisor set and ignore SIGTTIN/SIGTTOU.
    ///
    /// Must run before any child or thread exists. Any failure is fatal.
    pub fn configure() -> Result<Self> {
        let blocked = supervisor_blocked_set();

        let mut child_mask = SigSet::empty();
        nix::sys::signal::sigprocmask(
            SigmaskHow::SIG_SETMASK,
            Some(blocked.as_sigset()),
            Some(&mut child_mask),
        )
        .map_err(|source| SupervisorError::SignalSetup {
            op: "sigprocmask",
            source,
        })?;

        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: SIG_IGN installs no handler code.
        let saved_ttin = unsafe { sigaction(Signal::SIGTTIN, &ignore) }.map_err(|source| {
            SupervisorError::SignalSetup {
                op: "ignore SIGTTIN",
                source,
            }
        })?;
        // SAFETY: as above.
        let saved_ttou = unsafe { sigaction(Signal::SIGTTOU, &ignore) }.map_err(|source| {
            SupervisorError::SignalSetup {
                op: "ignore SIGTTOU",
                source,
            }
        })?;

        tracing::trace!("signals configured");

        Ok(Self {
            blocked,
            child_mask,
            saved_ttin,
            saved_ttou,
        })
    }

    pub fn blocked(&self) -> &SignalSet {
        &self.blocked
    }

    /// Undo [`configure`](Self::configure). Called in the forked child
    /// right before exec, so it must not log or allocate.
    pub fn restore(&self) -> Result<()> {
        nix::sys::signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.child_mask), None)
            .map_err(|source| SupervisorError::SignalSetup {
                op: "restore signal mask",
                source,
            })?;
        // SAFETY: restoring actions previously returned by sigaction.
        unsafe { sigaction(Signal::SIGTTIN, &self.saved_ttin) }.map_err(|source| {
            SupervisorError::SignalSetup {
                op: "restore SIGTTIN",
                source,
            }
        })?;
        // SAFETY: as above.
        unsafe { sigaction(Signal::SIGTTOU, &self.saved_ttou) }.map_err(|source| {
            SupervisorError::SignalSetup {
                op: "restore SIGTTOU",
                source,
            }
        })?;
        Ok(())
    }
}

/// Source of pending signals for the main loop.
pub trait SignalSource {
    /// Wait up to `timeout` for exactly one signal.
    ///
    /// Returns `Ok(None)` when the timeout expires or the wait is interrupted.
    fn next_signal(&mut self, timeout: Duration) -> std::result::Result<Option<libc::c_int>, Errno>;
}

/// `sigtimedwait(2)` over the supervisor's blocked set.
#[derive(Debug, Clone, Copy)]
pub struct SigTimedWait {
    set: SignalSet,
}

impl SigTimedWait {
    pub fn new(set: SignalSet) -> Self {
        Self { set }
    }
}

impl SignalSource for SigTimedWait {
    fn next_signal(&mut self, timeout: Duration) -> std::result::Result<Option<libc::c_int>, Errno> {
        // SAFETY: timespec and siginfo_t are plain C structs.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = timeout.as_secs() as libc::time_t;
        ts.tv_nsec = timeout.subsec_nanos() as libc::c_long;
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };

        // SAFETY: all pointers reference live, initialized values.
        let ret = unsafe { libc::sigtimedwait(self.set.as_sigset().as_ref(), &mut info, &ts) };
        if ret >= 0 {
            return Ok(Some(ret));
        }
        match Errno::last() {
            Errno::EAGAIN | Errno::EINTR => Ok(None),
            e => Err(e),
        }
    }
}
