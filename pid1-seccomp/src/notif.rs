//! Kernel notification structures and the receive/respond ioctls.
//!
//! The kernel may grow `struct seccomp_notif` over time, so requests are read
//! into owned byte buffers sized from `SECCOMP_GET_NOTIF_SIZES` rather than
//! into a fixed struct.

use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;

const SECCOMP_GET_NOTIF_SIZES: libc::c_uint = 3;

/// Let the syscall proceed as-is.
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

// SECCOMP_IOWR(0, struct seccomp_notif) / SECCOMP_IOWR(1, struct seccomp_notif_resp)
const SECCOMP_IOCTL_NOTIF_RECV: libc::c_ulong = 0xc050_2100;
const SECCOMP_IOCTL_NOTIF_SEND: libc::c_ulong = 0xc018_2101;

/// `struct seccomp_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// `struct seccomp_notif`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotif {
    pub id: u64,
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

/// `struct seccomp_notif_resp`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    pub error: i32,
    pub flags: u32,
}

/// `struct seccomp_notif_sizes`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifSizes {
    pub seccomp_notif: u16,
    pub seccomp_notif_resp: u16,
    pub seccomp_data: u16,
}

impl NotifSizes {
    pub fn query() -> Result<Self, Errno> {
        let mut sizes = Self::default();
        // SAFETY: the kernel writes exactly one seccomp_notif_sizes.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_GET_NOTIF_SIZES,
                0,
                &mut sizes as *mut Self,
            )
        };
        Errno::result(ret).map(|_| sizes)
    }
}

/// Request and response buffers, allocated once.
#[derive(Debug)]
pub struct NotifBuffers {
    request: Vec<u8>,
    response: Vec<u8>,
}

impl NotifBuffers {
    /// Buffers at least as large as both the kernel's and our view of the
    /// structures.
    pub fn new(sizes: NotifSizes) -> Self {
        let request = usize::from(sizes.seccomp_notif).max(size_of::<SeccompNotif>());
        let response = usize::from(sizes.seccomp_notif_resp).max(size_of::<SeccompNotifResp>());
        Self {
            request: vec![0; request],
            response: vec![0; response],
        }
    }

    pub fn request_len(&self) -> usize {
        self.request.len()
    }

    pub fn response_len(&self) -> usize {
        self.response.len()
    }

    /// Receive one pending notification. The kernel requires a zeroed buffer.
    pub fn receive(&mut self, listener: BorrowedFd<'_>) -> Result<SeccompNotif, Errno> {
        self.request.fill(0);
        // SAFETY: the buffer is at least as large as the kernel's struct.
        let ret = unsafe {
            libc::ioctl(
                listener.as_raw_fd(),
                SECCOMP_IOCTL_NOTIF_RECV as _,
                self.request.as_mut_ptr(),
            )
        };
        Errno::result(ret)?;
        // SAFETY: the buffer holds at least size_of::<SeccompNotif>() bytes
        // and every bit pattern is valid for the struct.
        Ok(unsafe { self.request.as_ptr().cast::<SeccompNotif>().read_unaligned() })
    }

    /// Let the notified syscall run unmodified.
    pub fn respond_continue(&mut self, listener: BorrowedFd<'_>, id: u64) -> Result<(), Errno> {
        let resp = SeccompNotifResp {
            id,
            val: 0,
            error: 0,
            flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE,
        };
        self.response.fill(0);
        // SAFETY: the buffer holds at least size_of::<SeccompNotifResp>() bytes.
        unsafe {
            self.response
                .as_mut_ptr()
                .cast::<SeccompNotifResp>()
                .write_unaligned(resp);
        }
        // SAFETY: as above, for the kernel's view of the struct.
        let ret = unsafe {
            libc::ioctl(
                listener.as_raw_fd(),
                SECCOMP_IOCTL_NOTIF_SEND as _,
                self.response.as_ptr(),
            )
        };
        Errno::result(ret).map(drop)
    }
}
