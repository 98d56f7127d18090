use std::path::PathBuf;

use structopt::StructOpt;

use fxd_protocol::message::{Reply, SessionRequest};
use fxd_protocol::types::{Magic, SessionState};
use fxd_transport::control::Channel;

use crate::daemon::control_roundtrip;
use crate::RunError;

#[derive(StructOpt)]
pub struct StatsOpt {
    /// Control socket path
    #[structopt(long, env = "FXD_SOCKET", default_value = "/run/fxd/control.sock")]
    pub socket: PathBuf,

    /// Session id to query
    #[structopt(long)]
    pub session: u32,
}

pub fn run(opt: StatsOpt) -> Result<(), RunError> {
    let channel = Channel::connect(&opt.socket)?;

    let request = SessionRequest::new(Magic::QUERY_STATE, opt.session);
    let reply = control_roundtrip(&channel, bytemuck::bytes_of(&request))?;
    let Reply::State(state) = reply else {
        return Err(RunError::MalformedReply);
    };
    if !state.result.is_ok() {
        return Err(RunError::Daemon(state.result));
    }

    let request = SessionRequest::new(Magic::QUERY_STATS, opt.session);
    let reply = control_roundtrip(&channel, bytemuck::bytes_of(&request))?;
    let Reply::Stats(stats) = reply else {
        return Err(RunError::MalformedReply);
    };
    if !stats.result.is_ok() {
        return Err(RunError::Daemon(stats.result));
    }

    let state = SessionState::from_wire(state.state)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("unknown ({})", state.state));
    let stats = stats.stats;

    println!("session {}: {state}", opt.session);
    println!("  processed frames: {}", stats.processed_frames);
    println!("  dropped frames:   {}", stats.dropped_frames);
    println!("  avg latency:      {} us", stats.avg_latency_us);
    println!("  p95 latency:      {} us", stats.p95_latency_us);
    println!("  max latency:      {} us", stats.max_latency_us);
    println!("  timeouts:         {}", stats.timeout_count);
    println!("  xruns:            {}", stats.xrun_count);

    Ok(())
}
