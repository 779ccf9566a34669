mod cli;
mod logging;

use std::process::ExitCode;

use clap::Parser;
use pid1_supervisor::{Supervisor, SupervisorError};
use tracing::{debug, error, warn};

use crate::cli::Cli;

fn run(cli: &Cli) -> Result<u8, SupervisorError> {
    let config = cli.supervisor_config()?;

    // Signals are blocked before the handoff so a responder thread inherits
    // the mask.
    let mut supervisor = Supervisor::configure(config)?;

    match pid1_seccomp::hand_off(&cli.handoff_config()) {
        Ok(Some(handoff)) => debug!(
            descriptors = handoff.descriptors,
            responder = handoff.responder.is_some(),
            "seccomp handoff complete"
        ),
        Ok(None) => {}
        Err(e) => warn!("seccomp notification disabled: {e}"),
    }

    let code = supervisor.run()?;
    debug!(phase = %supervisor.phase(), code, "supervisor finished");
    Ok(code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbosity());

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            ExitCode::from(cli.internal_error_code)
        }
    }
}
