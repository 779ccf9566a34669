//! Wait status translation and exit code remapping.
//!
//! Emulates what `sh`/`bash` report for a finished child: the exit code for a
//! normal exit, `128 + signal` for a signal death.

use std::fmt;

use crate::error::{Result, SupervisorError};

const STATUS_MIN: i64 = 0;
const STATUS_MAX: i64 = 255;

/// Raw status word as written by `waitpid(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStatus(pub libc::c_int);

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(u8),
    Signaled(libc::c_int),
}

impl Termination {
    /// Decode a raw status. Stopped/continued statuses and garbage are
    /// rejected: there is no correct exit code for them.
    pub fn from_raw(pid: libc::pid_t, status: RawStatus) -> Result<Self> {
        let raw = status.0;
        if libc::WIFEXITED(raw) {
            // WEXITSTATUS masks to the low 8 bits.
            Ok(Self::Exited((libc::WEXITSTATUS(raw) & 0xff) as u8))
        } else if libc::WIFSIGNALED(raw) {
            Ok(Self::Signaled(libc::WTERMSIG(raw)))
        } else {
            Err(SupervisorError::UnknownStatus { pid, status: raw })
        }
    }

    /// Shell-style code, reduced modulo 256.
    pub fn code(self) -> u8 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => ((128 + i64::from(sig)) % (STATUS_MAX + 1)) as u8,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(sig) => write!(f, "killed by {}", crate::signals::signal_name(*sig)),
        }
    }
}

/// Set of exit codes that are reported as success.
///
/// Backed by a 256-bit bitfield; only direct exit codes are looked up, signal
/// deaths always keep their `128 + N` code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitCodeRemap {
    bits: [u32; 8],
}

impl ExitCodeRemap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configured codes, rejecting anything outside 0-255.
    pub fn from_codes<I>(codes: I) -> Result<Self>
    where
        I: IntoIterator<Item = i64>,
    {
        let mut table = Self::new();
        for code in codes {
            table.insert(code)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, code: i64) -> Result<()> {
        if !(STATUS_MIN..=STATUS_MAX).contains(&code) {
            return Err(SupervisorError::RemapOutOfRange(code));
        }
        let code = code as usize;
        if let Some(word) = self.bits.get_mut(code / 32) {
            *word |= 1 << (code % 32);
        }
        Ok(())
    }

    pub fn contains(&self, code: u8) -> bool {
        let code = usize::from(code);
        self.bits
            .get(code / 32)
            .is_some_and(|word| word & (1 << (code % 32)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    /// Final reported code for a termination.
    pub fn apply(&self, termination: Termination) -> u8 {
        match termination {
            Termination::Exited(code) if self.contains(code) => 0,
            other => other.code(),
        }
    }
}

/// Translate a raw status of a tracked child into the code to report upward.
pub fn exit_code(pid: libc::pid_t, status: RawStatus, remap: &ExitCodeRemap) -> Result<u8> {
    let termination = Termination::from_raw(pid, status)?;
    Ok(remap.apply(termination))
}
