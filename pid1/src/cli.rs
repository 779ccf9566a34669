use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use nix::sys::signal::Signal;
use pid1_seccomp::HandoffConfig;
use pid1_supervisor::{ExecArgs, ExitCodeRemap, ForwardMode, SupervisorConfig, SupervisorError};

/// Verbosity when neither `-v` nor `--verbosity` is given: warnings and errors.
pub const DEFAULT_VERBOSITY: u8 = 1;

#[derive(Debug, Parser)]
#[command(
    name = "pid1",
    version,
    about = "Reap zombies, forward signals and propagate the exit code of PROGRAM"
)]
pub struct Cli {
    /// Register as a process subreaper (requires Linux >= 3.4)
    #[arg(short = 's', long, env = "PID1_SUBREAPER", value_parser = FalseyValueParser::new())]
    pub subreaper: bool,

    /// Send signals to the child's process group instead of the child only
    #[arg(
        short = 'g',
        long,
        env = "PID1_KILL_PROCESS_GROUP",
        value_parser = FalseyValueParser::new()
    )]
    pub kill_process_group: bool,

    /// Generate more verbose output. Repeat up to 3 times
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Absolute verbosity (0 errors only, 4 trace); overrides -v
    #[arg(long, env = "PID1_VERBOSITY", value_name = "N")]
    pub verbosity: Option<u8>,

    /// Print a warning when processes are getting reaped
    #[arg(short = 'w', long, env = "PID1_WARN_ON_REAP", value_parser = FalseyValueParser::new())]
    pub warn_on_reap: bool,

    /// Remap exit code (0-255) to 0. Repeatable, accepts comma separated lists
    #[arg(
        short = 'e',
        long = "remap-exit",
        env = "PID1_REMAP_EXIT",
        value_name = "CODE",
        value_delimiter = ','
    )]
    pub remap_exit: Vec<i64>,

    /// Signal to receive when the parent process dies (name or number)
    #[arg(
        short = 'p',
        long = "pdeath-signal",
        env = "PID1_PDEATH_SIGNAL",
        value_name = "SIGNAL",
        value_parser = parse_signal
    )]
    pub pdeath_signal: Option<Signal>,

    /// Command run before PROGRAM; a non-zero exit skips PROGRAM
    #[arg(long, env = "PID1_PRE", value_name = "CMD")]
    pub pre: Option<String>,

    /// Command run after PROGRAM; its exit code is ignored
    #[arg(long, env = "PID1_POST", value_name = "CMD")]
    pub post: Option<String>,

    /// Unix socket of the seccomp agent to hand the notification fd to
    #[arg(long, env = "PID1_SECCOMP_NOTIFY_SOCK_PATH", value_name = "PATH")]
    pub seccomp_socket: Option<PathBuf>,

    /// Also intercept connect, sendto and sendmsg
    #[arg(
        long,
        env = "PID1_SECCOMP_INTERCEPT_NET",
        value_parser = FalseyValueParser::new()
    )]
    pub seccomp_intercept_net: bool,

    /// Send /proc/self/mem and a pidfd along with the notification fd
    #[arg(
        long,
        env = "PID1_SECCOMP_SEND_PROCESS_FDS",
        value_parser = FalseyValueParser::new()
    )]
    pub seccomp_send_process_fds: bool,

    /// Exit code used when pid1 itself fails
    #[arg(long, env = "PID1_INTERNAL_ERROR_CODE", value_name = "N", default_value_t = 1)]
    pub internal_error_code: u8,

    /// Program to run, followed by its arguments
    #[arg(value_name = "PROGRAM", required = true, trailing_var_arg = true)]
    pub command: Vec<OsString>,
}

impl Cli {
    /// `--verbosity` wins; otherwise each `-v` raises the default by one.
    pub fn verbosity(&self) -> u8 {
        self.verbosity
            .unwrap_or_else(|| DEFAULT_VERBOSITY.saturating_add(self.verbose))
    }

    pub fn supervisor_config(&self) -> Result<SupervisorConfig, SupervisorError> {
        let mut config = SupervisorConfig::new(ExecArgs::new(&self.command)?);
        config.subreaper = self.subreaper;
        config.forward_mode = if self.kill_process_group {
            ForwardMode::ProcessGroup
        } else {
            ForwardMode::Process
        };
        config.warn_on_reap = self.warn_on_reap;
        config.parent_death_signal = self.pdeath_signal;
        config.remap = ExitCodeRemap::from_codes(self.remap_exit.iter().copied())?;
        config.pre = self.pre.as_deref().map(ExecArgs::from_command_line).transpose()?;
        config.post = self.post.as_deref().map(ExecArgs::from_command_line).transpose()?;
        Ok(config)
    }

    pub fn handoff_config(&self) -> HandoffConfig {
        HandoffConfig {
            socket_path: self.seccomp_socket.clone(),
            intercept_network: self.seccomp_intercept_net,
            send_process_fds: self.seccomp_send_process_fds,
        }
    }
}

/// Accepts `SIGTERM`, `TERM` or `15`.
fn parse_signal(s: &str) -> Result<Signal, String> {
    if let Ok(n) = s.parse::<i32>() {
        return Signal::try_from(n).map_err(|e| format!("invalid signal number {n}: {e}"));
    }
    let upper = s.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| format!("unknown signal {s:?}"))
}
