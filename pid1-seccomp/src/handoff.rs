//! Descriptor handoff to an external seccomp agent.
//!
//! The agent listens on a Unix stream socket. We connect, install the
//! notification filter on the calling thread and send the listener (plus,
//! optionally, `/proc/self/mem` and a pidfd for ourselves) in a single
//! `SCM_RIGHTS` message with a one byte payload.
//!
//! Once the filter is installed every trapped syscall blocks until somebody
//! answers it. If the listener cannot be delivered, a local responder keeps
//! answering "continue" so this process and its children run unprotected.

use std::fs::OpenOptions;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;

use nix::errno::Errno;
use nix::sys::prctl;
use tracing::{debug, error, info, warn};

use crate::error::{NotifyError, Result};
use crate::filter::FilterProgram;
use crate::notif::NotifSizes;
use crate::responder::ResponderHandle;

/// Payload byte accompanying the descriptors.
pub const HANDOFF_PAYLOAD: u8 = b'c';

/// Most descriptors a bundle carries.
pub const MAX_DESCRIPTORS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffConfig {
    /// Agent socket. `None` disables the handoff.
    pub socket_path: Option<PathBuf>,
    /// Also notify on `connect`, `sendto` and `sendmsg`.
    pub intercept_network: bool,
    /// Send `/proc/self/mem` and a pidfd along with the listener.
    pub send_process_fds: bool,
}

/// `/proc/self/mem` and a pidfd for this process.
#[derive(Debug)]
pub struct ProcessFds {
    memory: OwnedFd,
    pidfd: OwnedFd,
}

impl ProcessFds {
    pub fn open() -> Result<Self> {
        let memory = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/proc/self/mem")
            .map_err(|source| NotifyError::ProcessDescriptor {
                what: "/proc/self/mem",
                source,
            })?;
        Ok(Self {
            memory: memory.into(),
            pidfd: open_own_pidfd()?,
        })
    }
}

/// Descriptors sent to the agent, in wire order.
#[derive(Debug)]
pub struct DescriptorBundle {
    notify: OwnedFd,
    process: Option<ProcessFds>,
}

impl DescriptorBundle {
    pub fn new(notify: OwnedFd) -> Self {
        Self {
            notify,
            process: None,
        }
    }

    pub fn with_process_fds(mut self, process: ProcessFds) -> Self {
        self.process = Some(process);
        self
    }

    /// Number of descriptors, between 1 and [`MAX_DESCRIPTORS`].
    pub fn count(&self) -> usize {
        if self.process.is_some() { 3 } else { 1 }
    }

    /// Give up the bundle, keeping only the listener.
    pub fn into_listener(self) -> OwnedFd {
        self.notify
    }

    fn raw_fds(&self) -> Vec<RawFd> {
        let process = self
            .process
            .iter()
            .flat_map(|p| [p.memory.as_raw_fd(), p.pidfd.as_raw_fd()]);
        std::iter::once(self.notify.as_raw_fd()).chain(process).collect()
    }

    /// Send every descriptor in one message.
    pub fn send(&self, socket: BorrowedFd<'_>) -> std::result::Result<(), Errno> {
        send_descriptors(socket, &self.raw_fds())
    }
}

fn open_own_pidfd() -> Result<OwnedFd> {
    // SAFETY: pidfd_open takes a pid and flags and returns a new descriptor.
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, libc::getpid(), 0) };
    if ret < 0 {
        return Err(NotifyError::ProcessDescriptor {
            what: "pidfd",
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: fresh descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

/// What a successful handoff left running.
#[derive(Debug)]
pub struct Handoff {
    pub descriptors: usize,
    pub responder: Option<thread::JoinHandle<()>>,
}

/// Run the handoff described by `config`.
///
/// Returns `Ok(None)` when no socket is configured. Must be called from the
/// thread that will spawn children: the filter is installed on the calling
/// thread only and is inherited across fork.
pub fn hand_off(config: &HandoffConfig) -> Result<Option<Handoff>> {
    let Some(path) = &config.socket_path else {
        return Ok(None);
    };

    let socket = UnixStream::connect(path).map_err(|source| NotifyError::Connect {
        path: path.clone(),
        source,
    })?;
    debug!(path = %path.display(), "connected to seccomp agent");

    hand_off_over(&socket, config).map(Some)
}

/// Install the filter and send the bundle over an already connected socket.
///
/// Every error before the install leaves the process unfiltered. After the
/// install an error means the agent never got the listener; it is then
/// handed to a local responder before the error is returned.
pub fn hand_off_over(socket: &UnixStream, config: &HandoffConfig) -> Result<Handoff> {
    NotifSizes::query().map_err(NotifyError::NotifSizes)?;
    let process = if config.send_process_fds {
        Some(ProcessFds::open()?)
    } else {
        None
    };

    // Filters apply to the installing thread and to threads it creates
    // later, so both responders are started now. With network interception
    // our own sendmsg below is trapped and the network responder lets it
    // through.
    let fallback = ResponderHandle::spawn(None)?;
    let network = if config.intercept_network {
        Some(ResponderHandle::spawn(Some(libc::SYS_sendmsg))?)
    } else {
        None
    };

    prctl::set_no_new_privs().map_err(NotifyError::NoNewPrivs)?;
    let notify = FilterProgram::build(config.intercept_network).install()?;

    let mut bundle = DescriptorBundle::new(notify);
    if let Some(process) = process {
        bundle = bundle.with_process_fds(process);
    }

    match deliver(socket, &bundle, network) {
        Ok(responder) => {
            info!(
                descriptors = bundle.count(),
                "sent the notify fd to the seccomp agent socket at {}",
                socket_path(socket).display()
            );
            Ok(Handoff {
                descriptors: bundle.count(),
                responder,
            })
        }
        Err(e) => {
            warn!("seccomp listener not delivered, answering notifications locally");
            if fallback.start(bundle.into_listener()).is_err() {
                error!("local notification responder is gone; filtered syscalls will fail");
            }
            Err(e)
        }
    }
}

/// Start the network responder, if any, and send the bundle.
fn deliver(
    socket: &UnixStream,
    bundle: &DescriptorBundle,
    network: Option<ResponderHandle>,
) -> Result<Option<thread::JoinHandle<()>>> {
    let responder = match network {
        Some(handle) => {
            let listener = bundle.notify.try_clone().map_err(|source| {
                NotifyError::ProcessDescriptor {
                    what: "listener duplicate",
                    source,
                }
            })?;
            Some(handle.start(listener)?)
        }
        None => None,
    };

    bundle
        .send(socket.as_fd())
        .map_err(|source| NotifyError::SendDescriptors {
            path: socket_path(socket),
            source,
        })?;
    Ok(responder)
}

fn socket_path(socket: &UnixStream) -> PathBuf {
    socket
        .peer_addr()
        .ok()
        .and_then(|addr| addr.as_pathname().map(PathBuf::from))
        .unwrap_or_default()
}

/// Send `fds` with the one byte payload over a connected Unix socket.
pub fn send_descriptors(socket: BorrowedFd<'_>, fds: &[RawFd]) -> std::result::Result<(), Errno> {
    let payload = [HANDOFF_PAYLOAD];
    let iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let fds_len = size_of::<RawFd>() * fds.len();
    // SAFETY: CMSG_SPACE is pure arithmetic.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fds_len as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    // SAFETY: msghdr is a plain C struct; zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: msg_control points at a buffer of CMSG_SPACE(fds_len) bytes,
    // large enough for one header and the descriptor array.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(Errno::EINVAL);
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fds_len as u32) as _;
        std::ptr::copy_nonoverlapping(fds.as_ptr().cast::<u8>(), libc::CMSG_DATA(cmsg), fds_len);
    }

    // SAFETY: every pointer in msg references live local buffers.
    let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    Errno::result(ret).map(drop)
}

/// Agent side of [`send_descriptors`]: receive up to [`MAX_DESCRIPTORS`]
/// descriptors from one message.
pub fn recv_descriptors(socket: BorrowedFd<'_>) -> std::result::Result<Vec<OwnedFd>, Errno> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    // SAFETY: CMSG_SPACE is pure arithmetic.
    let cmsg_space =
        unsafe { libc::CMSG_SPACE((size_of::<RawFd>() * MAX_DESCRIPTORS) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    // SAFETY: as in send_descriptors.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: buffers outlive the call.
    let ret = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    Errno::result(ret)?;

    let mut fds = Vec::new();
    // SAFETY: the kernel filled msg_control; the CMSG macros walk it within
    // msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..data_len / size_of::<RawFd>() {
                    fds.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    if fds.is_empty() {
        return Err(Errno::EBADMSG);
    }
    Ok(fds)
}
