mod config;
mod daemon;
mod dsp;
mod stats;

use std::process::ExitCode;

use structopt::StructOpt;
use thiserror::Error;

use fxd_protocol::types::ResultCode;
use fxd_transport::control::ControlError;

#[derive(StructOpt)]
enum Opt {
    /// Run the effect daemon
    Daemon(daemon::DaemonOpt),
    /// Query a session on a running daemon
    Stats(stats::StatsOpt),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("control socket: {0}")]
    Control(#[from] ControlError),
    #[error("installing signal handlers: {0}")]
    Signals(nix::Error),
    #[error("daemon replied {0:?}")]
    Daemon(ResultCode),
    #[error("malformed reply from daemon")]
    MalformedReply,
}

fn main() -> Result<(), ExitCode> {
    env_logger::init();
    config::apply();

    let opt = Opt::from_args();

    let result = match opt {
        Opt::Daemon(opt) => daemon::run(opt),
        Opt::Stats(opt) => stats::run(opt),
    };

    result.map_err(|err| {
        eprintln!("error: {err}");
        ExitCode::FAILURE
    })
}
