//! The supervisor state machine.
//!
//! ```text
//! Init -> Configured -> Spawned -> Running -> Draining -> Terminated
//! ```
//!
//! `configure` covers `Init -> Configured` and must run before any other
//! thread exists. `run` covers the rest: optional pre command, main command,
//! the signal/reap loop and the optional post command.

use std::fmt;
use std::time::Duration;

use nix::sys::prctl;
use nix::sys::signal::Signal;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SupervisorError};
use crate::exit_status::{ExitCodeRemap, Termination};
use crate::reap::{ForwardMode, Kernel, ProcessTable, forward_signal, reap_zombies};
use crate::signals::{SigTimedWait, SignalConfiguration, SignalSource, signal_name};
use crate::spawn::{ChildProcess, ExecArgs, Role, Spawner};
use crate::subreaper::{check_reaper, register_subreaper};

/// Upper bound on a single signal wait. Expiry is silent; it only bounds how
/// long a reapable child can go unnoticed.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the supervisor needs for one run. Built once by the caller.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub subreaper: bool,
    pub forward_mode: ForwardMode,
    pub warn_on_reap: bool,
    pub parent_death_signal: Option<Signal>,
    pub remap: ExitCodeRemap,
    pub pre: Option<ExecArgs>,
    pub main: ExecArgs,
    pub post: Option<ExecArgs>,
    pub wait_timeout: Duration,
}

impl SupervisorConfig {
    /// Defaults for everything but the main command.
    pub fn new(main: ExecArgs) -> Self {
        Self {
            subreaper: false,
            forward_mode: ForwardMode::Process,
            warn_on_reap: false,
            parent_death_signal: None,
            remap: ExitCodeRemap::new(),
            pre: None,
            main,
            post: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Configured,
    Spawned,
    Running,
    Draining,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Configured => "configured",
            Self::Spawned => "spawned",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        })
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    signals: SignalConfiguration,
    phase: Phase,
}

impl Supervisor {
    /// Block signals, then apply the parent death signal and subreaper
    /// settings.
    pub fn configure(config: SupervisorConfig) -> Result<Self> {
        let signals = SignalConfiguration::configure()?;

        if let Some(signal) = config.parent_death_signal {
            prctl::set_pdeathsig(signal).map_err(SupervisorError::ParentDeathSignal)?;
            debug!("parent death signal set to {signal}");
        }

        if config.subreaper {
            register_subreaper();
        }
        check_reaper();

        let mut phase = Phase::Init;
        transition(&mut phase, Phase::Configured);
        Ok(Self {
            config,
            signals,
            phase,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run pre, main and post and return the code to exit with.
    pub fn run(&mut self) -> Result<u8> {
        let spawner = Spawner::new(&self.signals);

        if let Some(pre) = &self.config.pre {
            let code = spawner.spawn_and_wait(Role::Pre, pre)?;
            if code != 0 {
                warn!(code, "pre command '{pre}' failed, skipping main command");
                run_post(&spawner, self.config.post.as_ref());
                transition(&mut self.phase, Phase::Terminated);
                return Ok(code);
            }
        }

        let mut main = spawner.spawn(Role::Main, &self.config.main)?;
        transition(&mut self.phase, Phase::Spawned);

        main.mark_running();
        transition(&mut self.phase, Phase::Running);
        let settings = LoopSettings {
            forward_mode: self.config.forward_mode,
            warn_on_reap: self.config.warn_on_reap,
            remap: &self.config.remap,
            wait_timeout: self.config.wait_timeout,
        };
        let mut source = SigTimedWait::new(*self.signals.blocked());
        let code = supervise(&mut source, &mut Kernel, &mut main, &settings)?;

        transition(&mut self.phase, Phase::Draining);
        run_post(&spawner, self.config.post.as_ref());

        transition(&mut self.phase, Phase::Terminated);
        Ok(code)
    }
}

fn transition(phase: &mut Phase, to: Phase) {
    trace!(from = %phase, %to, "phase transition");
    *phase = to;
}

/// The post command's outcome is reported and otherwise ignored.
fn run_post(spawner: &Spawner<'_>, post: Option<&ExecArgs>) {
    let Some(post) = post else {
        return;
    };
    match spawner.spawn_and_wait(Role::Post, post) {
        Ok(0) => debug!("post command '{post}' succeeded"),
        Ok(code) => warn!(code, "post command '{post}' failed"),
        Err(e) => warn!("post command '{post}' could not run: {e}"),
    }
}

/// Knobs of the main loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings<'a> {
    pub forward_mode: ForwardMode,
    pub warn_on_reap: bool,
    pub remap: &'a ExitCodeRemap,
    pub wait_timeout: Duration,
}

/// Forward signals and reap children until `main` has been reaped, then
/// return its translated exit code.
pub fn supervise<S, P>(
    source: &mut S,
    table: &mut P,
    main: &mut ChildProcess,
    settings: &LoopSettings<'_>,
) -> Result<u8>
where
    S: SignalSource,
    P: ProcessTable,
{
    loop {
        match source
            .next_signal(settings.wait_timeout)
            .map_err(SupervisorError::SignalWait)?
        {
            None => {}
            Some(libc::SIGCHLD) => trace!("received SIGCHLD"),
            Some(signo) => {
                trace!("received {}", signal_name(signo));
                forward_signal(table, main.pid, settings.forward_mode, signo)?;
            }
        }

        let sweep = reap_zombies(table, main.pid, settings.warn_on_reap)?;
        if let Some(status) = sweep.main_status {
            main.mark_reaped();
            let termination = Termination::from_raw(main.pid.as_raw(), status)?;
            let code = settings.remap.apply(termination);
            info!(pid = main.pid.as_raw(), code, "main child {termination}");
            return Ok(code);
        }
    }
}
