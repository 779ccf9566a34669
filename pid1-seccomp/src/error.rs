use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, NotifyError>;

/// Seccomp handoff failures. None of these stop the supervisor; the caller
/// logs them and runs without the notification feature.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("unable to connect on unix socket ({path}) for seccomp handoff: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("couldn't prctl to no new privs: {0}")]
    NoNewPrivs(#[source] Errno),

    #[error("seccomp filter install failed: {0}")]
    Install(#[source] Errno),

    #[error("a seccomp notification listener is already installed")]
    ListenerBusy,

    #[error("SECCOMP_GET_NOTIF_SIZES failed: {0}")]
    NotifSizes(#[source] Errno),

    #[error("epoll failed: {0}")]
    Epoll(#[source] Errno),

    #[error("failed to receive seccomp notification: {0}")]
    Receive(#[source] Errno),

    #[error("failed to respond to seccomp notification {id}: {source}")]
    Respond {
        id: u64,
        #[source]
        source: Errno,
    },

    #[error("failed to open {what}: {source}")]
    ProcessDescriptor {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("couldn't send fds to the socket at {path}: {source}")]
    SendDescriptors {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("failed to start the notification responder: {0}")]
    SpawnResponder(#[source] io::Error),

    #[error("notification responder exited before receiving its descriptor")]
    ResponderGone,
}
