//! In-process notification responder.
//!
//! Answers every notification with "continue" until the listener hangs up
//! (no filtered task is left) or, when a sentinel syscall is configured,
//! until that syscall has been answered once.

use std::os::fd::{AsFd, OwnedFd};
use std::sync::mpsc;
use std::thread;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{debug, trace, warn};

use crate::error::{NotifyError, Result};
use crate::notif::{NotifBuffers, NotifSizes};

const THREAD_NAME: &str = "seccomp-responder";

/// Why the responder stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderExit {
    HangUp,
    Sentinel,
}

pub struct Responder {
    listener: OwnedFd,
    buffers: NotifBuffers,
    sentinel: Option<libc::c_long>,
}

impl Responder {
    pub fn new(listener: OwnedFd, sentinel: Option<libc::c_long>) -> Result<Self> {
        let sizes = NotifSizes::query().map_err(NotifyError::NotifSizes)?;
        trace!(?sizes, "seccomp notification sizes");
        Ok(Self {
            listener,
            buffers: NotifBuffers::new(sizes),
            sentinel,
        })
    }

    /// Serve notifications until hang-up or the sentinel.
    pub fn run(mut self) -> Result<ResponderExit> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(NotifyError::Epoll)?;
        epoll
            .add(self.listener.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 0))
            .map_err(NotifyError::Epoll)?;

        let mut events = [EpollEvent::empty(); 1];
        loop {
            let ready = match epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(NotifyError::Epoll(e)),
            };
            for event in events.iter().take(ready) {
                let flags = event.events();
                if flags.contains(EpollFlags::EPOLLIN) && self.handle_one()? {
                    debug!("sentinel syscall answered, responder done");
                    return Ok(ResponderExit::Sentinel);
                }
                if flags.contains(EpollFlags::EPOLLHUP) {
                    debug!("seccomp listener hung up");
                    return Ok(ResponderExit::HangUp);
                }
            }
        }
    }

    /// Receive and answer one notification. Returns true when it was the
    /// sentinel.
    fn handle_one(&mut self) -> Result<bool> {
        let notif = match self.buffers.receive(self.listener.as_fd()) {
            Ok(notif) => notif,
            // The target died, or another reader took the notification.
            Err(Errno::ENOENT) => {
                debug!("notification vanished before it was received");
                return Ok(false);
            }
            Err(e) => return Err(NotifyError::Receive(e)),
        };
        trace!(
            id = notif.id,
            pid = notif.pid,
            nr = notif.data.nr,
            "seccomp notification"
        );

        match self.buffers.respond_continue(self.listener.as_fd(), notif.id) {
            Ok(()) => {}
            Err(Errno::ENOENT) => debug!(id = notif.id, "notification no longer valid"),
            Err(source) => {
                return Err(NotifyError::Respond {
                    id: notif.id,
                    source,
                });
            }
        }

        Ok(self.sentinel == Some(libc::c_long::from(notif.data.nr)))
    }
}

/// A responder thread waiting for its listener.
pub struct ResponderHandle {
    listener_tx: mpsc::Sender<OwnedFd>,
    thread: thread::JoinHandle<()>,
}

impl ResponderHandle {
    /// Start the thread. It blocks until [`start`](Self::start) hands it a
    /// listener, and exits quietly if the handle is dropped first.
    ///
    /// Spawn it before the filter is installed: filters apply per thread, so
    /// the responder stays unfiltered.
    pub fn spawn(sentinel: Option<libc::c_long>) -> Result<Self> {
        let (listener_tx, listener_rx) = mpsc::channel::<OwnedFd>();
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let Ok(listener) = listener_rx.recv() else {
                    trace!("responder cancelled");
                    return;
                };
                match Responder::new(listener, sentinel).and_then(Responder::run) {
                    Ok(exit) => debug!(?exit, "notification responder stopped"),
                    Err(e) => warn!("notification responder failed: {e}"),
                }
            })
            .map_err(NotifyError::SpawnResponder)?;
        Ok(Self {
            listener_tx,
            thread,
        })
    }

    /// Hand the listener to the thread.
    pub fn start(self, listener: OwnedFd) -> Result<thread::JoinHandle<()>> {
        self.listener_tx
            .send(listener)
            .map_err(|_| NotifyError::ResponderGone)?;
        Ok(self.thread)
    }
}
