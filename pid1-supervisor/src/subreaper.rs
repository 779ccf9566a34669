//! Child subreaper registration.
//!
//! When not running as PID 1, orphans are reparented to us only if we are
//! marked as a child subreaper (`PR_SET_CHILD_SUBREAPER`, Linux 3.4+).

use nix::errno::Errno;
use nix::sys::prctl;
use nix::unistd::getpid;
use tracing::{debug, warn};

/// Mark the calling process as a child subreaper.
///
/// Best effort: on failure a warning is logged and `false` is returned.
pub fn register_subreaper() -> bool {
    match prctl::set_child_subreaper(true) {
        Ok(()) => {
            debug!("registered as a child subreaper");
            true
        }
        Err(Errno::EINVAL) => {
            warn!(
                "PR_SET_CHILD_SUBREAPER is unavailable on this platform. \
                 Are you using Linux >= 3.4?"
            );
            false
        }
        Err(e) => {
            warn!("failed to register as child subreaper: {e}");
            false
        }
    }
}

/// Whether orphaned descendants will be reparented to us.
pub fn can_reap_orphans() -> bool {
    if getpid().as_raw() == 1 {
        return true;
    }
    prctl::get_child_subreaper().unwrap_or(false)
}

/// Warn when zombies would escape us.
pub fn check_reaper() {
    if !can_reap_orphans() {
        warn!(
            "pid1 is not running as PID 1 and isn't registered as a child subreaper. \
             Zombie processes will not be re-parented to pid1, so zombie reaping \
             won't work. To fix the problem, use the -s option or set the \
             environment variable PID1_SUBREAPER to register pid1 as a child subreaper, \
             or run pid1 as PID 1."
        );
    }
}
