//! Seccomp user notification handoff.
//!
//! Installs a filter that turns `bpf`, `perf_event_open`, `ioctl` (and
//! optionally `connect`, `sendto`, `sendmsg`) into user notifications, then
//! passes the listener to an external agent over a Unix socket. Children
//! spawned afterwards inherit the filter.
//!
//! Supported on Linux x86_64 and aarch64.

pub mod error;
pub mod filter;
pub mod handoff;
pub mod notif;
pub mod responder;

pub use error::{NotifyError, Result};
pub use filter::FilterProgram;
pub use notif::NotifSizes;
pub use handoff::{
    DescriptorBundle, Handoff, HandoffConfig, ProcessFds, hand_off, hand_off_over,
    recv_descriptors, send_descriptors,
};
pub use responder::{Responder, ResponderExit, ResponderHandle};
