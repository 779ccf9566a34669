//! Classic BPF filter that turns a fixed set of syscalls into user
//! notifications.
//!
//! ## Program layout
//!
//! ```text
//! 0  ld  [arch]
//! 1  jeq NATIVE_ARCH, 0, 2     ; foreign arch -> allow
//! 2  ld  [nr]
//! 3  jge X32_SYSCALL_BIT, 0, 1 ; x32 ABI -> allow
//! 4  ret ALLOW
//! 5  jeq SYS_bpf, 0, 1
//! 6  ret USER_NOTIF
//!    ... one pair per intercepted syscall ...
//! n  ret ALLOW
//! ```
//!
//! Installing with `SECCOMP_FILTER_FLAG_NEW_LISTENER` returns the listener
//! descriptor. Only one listener can exist per filter chain; a second install
//! fails with EBUSY.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use tracing::debug;

use crate::error::{NotifyError, Result};

const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
const SECCOMP_FILTER_FLAG_NEW_LISTENER: libc::c_uint = 1 << 3;

pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// BPF instruction classes and fields
pub const BPF_LD: u16 = 0x00;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_K: u16 = 0x00;

// struct seccomp_data offsets
pub const OFFSET_NR: u32 = 0;
pub const OFFSET_ARCH: u32 = 4;

/// x32 syscall numbers have bit 30 set.
pub const X32_SYSCALL_BIT: u32 = 0x4000_0000;

#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH_NATIVE: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH_NATIVE: u32 = 0xc000_00b7;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("seccomp notification is only supported on x86_64 and aarch64");

/// Syscalls always routed to the agent.
pub const BASE_SYSCALLS: [libc::c_long; 3] =
    [libc::SYS_bpf, libc::SYS_perf_event_open, libc::SYS_ioctl];

/// Additional syscalls routed to the agent with network interception.
pub const NETWORK_SYSCALLS: [libc::c_long; 3] =
    [libc::SYS_connect, libc::SYS_sendto, libc::SYS_sendmsg];

/// One classic BPF instruction (`struct sock_filter`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
struct SockFprog {
    len: libc::c_ushort,
    filter: *const SockFilter,
}

/// The syscalls a filter built with `intercept_network` routes to the agent.
pub fn intercepted_syscalls(intercept_network: bool) -> Vec<libc::c_long> {
    let mut syscalls = BASE_SYSCALLS.to_vec();
    if intercept_network {
        syscalls.extend(NETWORK_SYSCALLS);
    }
    syscalls
}

/// An immutable, ready to install filter program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterProgram {
    instructions: Vec<SockFilter>,
}

impl FilterProgram {
    pub fn build(intercept_network: bool) -> Self {
        let mut instructions = vec![
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_NATIVE, 0, 2),
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR),
            SockFilter::jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        ];
        for nr in intercepted_syscalls(intercept_network) {
            instructions.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, 0, 1));
            instructions.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_USER_NOTIF));
        }
        instructions.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        Self { instructions }
    }

    pub fn instructions(&self) -> &[SockFilter] {
        &self.instructions
    }

    /// Install the program on the calling thread and return the listener.
    ///
    /// No-new-privs must already be set, or the caller needs CAP_SYS_ADMIN.
    pub fn install(&self) -> Result<OwnedFd> {
        let len = libc::c_ushort::try_from(self.instructions.len())
            .map_err(|_| NotifyError::Install(Errno::E2BIG))?;
        let prog = SockFprog {
            len,
            filter: self.instructions.as_ptr(),
        };

        // SAFETY: prog points at a live instruction vector for the duration
        // of the call; the kernel copies it.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                SECCOMP_FILTER_FLAG_NEW_LISTENER,
                &prog as *const SockFprog,
            )
        };
        if ret < 0 {
            return Err(match Errno::last() {
                Errno::EBUSY => NotifyError::ListenerBusy,
                errno => NotifyError::Install(errno),
            });
        }

        debug!(instructions = len, "seccomp notification filter installed");
        // SAFETY: on success the syscall returns a fresh listener descriptor
        // that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal classic BPF interpreter covering the opcodes the program uses.
    fn run(program: &FilterProgram, arch: u32, nr: u32) -> u32 {
        let insns = program.instructions();
        let mut acc = 0u32;
        let mut pc = 0usize;
        loop {
            let insn = insns[pc];
            match insn.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    acc = match insn.k {
                        OFFSET_NR => nr,
                        OFFSET_ARCH => arch,
                        other => panic!("unexpected load offset {other}"),
                    };
                    pc += 1;
                }
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    let off = if acc == insn.k { insn.jt } else { insn.jf };
                    pc += 1 + usize::from(off);
                }
                c if c == BPF_JMP | BPF_JGE | BPF_K => {
                    let off = if acc >= insn.k { insn.jt } else { insn.jf };
                    pc += 1 + usize::from(off);
                }
                c if c == BPF_RET | BPF_K => return insn.k,
                other => panic!("unexpected opcode {other:#x}"),
            }
        }
    }

    fn nr(syscall: libc::c_long) -> u32 {
        syscall as u32
    }

    #[test]
    fn base_syscalls_notify() {
        let program = FilterProgram::build(false);
        for syscall in BASE_SYSCALLS {
            assert_eq!(
                run(&program, AUDIT_ARCH_NATIVE, nr(syscall)),
                SECCOMP_RET_USER_NOTIF
            );
        }
        for syscall in [libc::SYS_read, libc::SYS_write, libc::SYS_openat] {
            assert_eq!(run(&program, AUDIT_ARCH_NATIVE, nr(syscall)), SECCOMP_RET_ALLOW);
        }
    }

    #[test]
    fn network_syscalls_only_with_interception() {
        let plain = FilterProgram::build(false);
        let net = FilterProgram::build(true);
        for syscall in NETWORK_SYSCALLS {
            assert_eq!(run(&plain, AUDIT_ARCH_NATIVE, nr(syscall)), SECCOMP_RET_ALLOW);
            assert_eq!(run(&net, AUDIT_ARCH_NATIVE, nr(syscall)), SECCOMP_RET_USER_NOTIF);
        }
        assert_eq!(
            run(&net, AUDIT_ARCH_NATIVE, nr(libc::SYS_ioctl)),
            SECCOMP_RET_USER_NOTIF
        );
        assert_eq!(net.instructions().len(), plain.instructions().len() + 6);
    }

    #[test]
    fn foreign_arch_and_x32_are_allowed() {
        let program = FilterProgram::build(true);
        let foreign = 0x4000_0003; // AUDIT_ARCH_I386
        assert_eq!(run(&program, foreign, nr(libc::SYS_ioctl)), SECCOMP_RET_ALLOW);
        assert_eq!(
            run(&program, AUDIT_ARCH_NATIVE, X32_SYSCALL_BIT | nr(libc::SYS_ioctl)),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn layout() {
        let program = FilterProgram::build(false);
        let insns = program.instructions();
        assert_eq!(insns.len(), 5 + 2 * BASE_SYSCALLS.len() + 1);
        assert_eq!(insns[0], SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
        assert_eq!(
            insns.last(),
            Some(&SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW))
        );
        assert_eq!(std::mem::size_of::<SockFilter>(), 8);
    }
}
