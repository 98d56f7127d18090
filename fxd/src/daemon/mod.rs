pub mod manager;
pub mod session;
pub mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::Zeroable;
use structopt::StructOpt;

use fxd_protocol::message::{
    self, MessageHeader, OpenReply, Reply, Request, SimpleReply, StateReply, StatsReply,
};
use fxd_protocol::types::stats::SessionStats;
use fxd_protocol::types::{Magic, ResultCode, SessionState, TransportDescriptor};
use fxd_protocol::MAX_MESSAGE_SIZE;
use fxd_transport::control::{Channel, ControlError, Listener};

use crate::RunError;

use self::manager::SessionManager;

/// Accept poll interval; bounds shutdown latency.
const ACCEPT_POLL_MS: i32 = 500;

#[derive(StructOpt)]
pub struct DaemonOpt {
    /// Control socket path
    #[structopt(long, env = "FXD_SOCKET", default_value = "/run/fxd/control.sock")]
    pub socket: PathBuf,

    /// Ring buffer capacity per direction, in bytes
    #[structopt(long, env = "FXD_RING_CAPACITY", default_value = "1048576")]
    pub ring_capacity: u32,

    /// Bypass effect processing and echo audio unchanged
    #[structopt(long)]
    pub passthrough: bool,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> nix::Result<()> {
    use nix::sys::signal::{sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
        // a dying client surfaces as a closed socket, not a signal
        signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }

    Ok(())
}

pub fn run(opt: DaemonOpt) -> Result<(), RunError> {
    install_signal_handlers().map_err(RunError::Signals)?;

    if let Some(parent) = opt.socket.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let listener = Listener::bind(&opt.socket)?;

    log::info!("fxd listening on {}", opt.socket.display());
    if opt.passthrough {
        log::warn!("running in forced passthrough mode");
    }

    let manager = Arc::new(SessionManager::new(opt.ring_capacity, opt.passthrough));
    serve(&listener, &manager, &SHUTDOWN);

    log::info!("shutting down");
    manager.shutdown();
    Ok(())
}

/// Accepts control connections until `shutdown` is set, spawning one
/// handler thread per connection.
pub fn serve(listener: &Listener, manager: &Arc<SessionManager>, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.poll_accept(ACCEPT_POLL_MS) {
            Ok(Some(channel)) => {
                let manager = Arc::clone(manager);
                std::thread::spawn(move || handle_connection(channel, manager));
            }
            Ok(None) => continue,
            Err(e) => {
                log::warn!("accepting control connection: {e}");
            }
        }
    }
}

fn handle_connection(channel: Channel, manager: Arc<SessionManager>) {
    log::debug!("control connection up");

    // sessions created here die with the connection
    let mut owned = Vec::new();
    let mut buf = [0u8; MAX_MESSAGE_SIZE];

    loop {
        let (n, _fds) = match channel.recv(&mut buf) {
            Ok(received) => received,
            Err(ControlError::Closed) => break,
            Err(e) => {
                log::warn!("control receive failed: {e}");
                break;
            }
        };

        let Some(request) = message::parse_request(&buf[..n]) else {
            log::warn!("dropping malformed control message ({n} bytes)");
            continue;
        };

        match request {
            Request::Open(request) => {
                let (result, session_id, descriptor, fds) = match manager.open(&request) {
                    Ok((id, descriptor, fds)) => {
                        owned.push(id);
                        (ResultCode::OK, id, descriptor, Some(fds))
                    }
                    Err(code) => (code, 0, TransportDescriptor::zeroed(), None),
                };

                let reply = OpenReply {
                    header: MessageHeader::new(Magic::OPEN_REPLY),
                    result,
                    session_id,
                    descriptor,
                };
                let send = match &fds {
                    Some(fds) => channel.send(bytemuck::bytes_of(&reply), fds),
                    None => channel.send(bytemuck::bytes_of(&reply), &[]),
                };
                if send.is_err() {
                    break;
                }
            }
            Request::Start(request) => {
                reply_simple(&channel, manager.start(request.session_id));
            }
            Request::Stop(request) => {
                reply_simple(&channel, manager.stop(request.session_id));
            }
            Request::Close(request) => {
                owned.retain(|id| *id != request.session_id);
                reply_simple(&channel, manager.close(request.session_id));
            }
            Request::SetParam(request) => {
                let result =
                    manager.set_param(request.session_id, request.key, request.value());
                reply_simple(&channel, result);
            }
            Request::QueryState(request) => {
                let (result, state) = match manager.state(request.session_id) {
                    Ok(state) => (ResultCode::OK, state),
                    Err(code) => (code, SessionState::Error),
                };
                let reply = StateReply {
                    header: MessageHeader::new(Magic::STATE_REPLY),
                    result,
                    state: state.to_wire(),
                };
                let _ = channel.send(bytemuck::bytes_of(&reply), &[]);
            }
            Request::QueryStats(request) => {
                let (result, stats) = match manager.stats(request.session_id) {
                    Ok(stats) => (ResultCode::OK, stats),
                    Err(code) => (code, SessionStats::new()),
                };
                let reply = StatsReply {
                    header: MessageHeader::new(Magic::STATS_REPLY),
                    result,
                    padding: 0,
                    stats,
                };
                let _ = channel.send(bytemuck::bytes_of(&reply), &[]);
            }
        }
    }

    for id in owned {
        if manager.close(id).is_ok() {
            log::info!("session {id}: reclaimed from dropped connection");
        }
    }

    log::debug!("control connection closed");
}

fn reply_simple(channel: &Channel, result: Result<(), ResultCode>) {
    let code = match result {
        Ok(()) => ResultCode::OK,
        Err(code) => code,
    };
    let reply = SimpleReply::new(code);
    let _ = channel.send(bytemuck::bytes_of(&reply), &[]);
}

/// Sends one request and decodes the reply; shared by the stats CLI.
pub fn control_roundtrip(channel: &Channel, bytes: &[u8]) -> Result<Reply, RunError> {
    channel.send(bytes, &[])?;

    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    let (n, _fds) = channel.recv_timeout(&mut buf, 5000)?;

    message::parse_reply(&buf[..n]).ok_or(RunError::MalformedReply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxd_client::{
        AudioConfig, EffectKind, Error, ProcessStatus, Session, SessionOptions,
    };

    fn test_socket() -> PathBuf {
        static SEQ: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "fxd-test-{}-{}.sock",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 48000,
            channels: 2,
            format: 16,
            frames_per_buffer: 480,
        }
    }

    fn sine_s16(frames: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(frames * 4);
        for frame in 0..frames {
            let t = frame as f32 / 48000.0;
            let sample = ((t * 1000.0 * 2.0 * std::f32::consts::PI).sin() * 20000.0) as i16;
            bytes.extend_from_slice(&sample.to_le_bytes());
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    fn with_daemon<T>(
        passthrough: bool,
        test: impl FnOnce(&PathBuf) -> T,
    ) -> T {
        let socket = test_socket();
        let listener = Listener::bind(&socket).unwrap();
        let manager = Arc::new(SessionManager::new(1 << 20, passthrough));
        let shutdown = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| serve(&listener, &manager, &shutdown));
            let result = test(&socket);
            shutdown.store(true, Ordering::Relaxed);
            result
        })
    }

    fn options(socket: &PathBuf) -> SessionOptions {
        SessionOptions {
            socket: socket.clone(),
            fallback_threshold: 100,
        }
    }

    #[test]
    fn end_to_end_passthrough_round_trip() {
        with_daemon(true, |socket| {
            let session =
                Session::open(EffectKind::NoiseReduction, config(), options(socket)).unwrap();
            session.start().unwrap();

            let input = sine_s16(480);
            let mut output = vec![0u8; input.len()];

            // the worker may need a moment to come up; retry until one
            // buffer makes the round trip
            let mut processed = false;
            for _ in 0..50 {
                let status = session.process(&input, &mut output, 480).unwrap();
                if status == ProcessStatus::Processed {
                    processed = true;
                    break;
                }
            }

            assert!(processed, "no buffer made it through the daemon");
            assert_eq!(output, input);

            let stats = session.query_stats();
            assert!(stats.processed_frames >= 480);

            session.stop().unwrap();
            session.close().unwrap();
        });
    }

    #[test]
    fn karaoke_session_changes_the_audio() {
        with_daemon(false, |socket| {
            let session =
                Session::open(EffectKind::Karaoke, config(), options(socket)).unwrap();
            session.start().unwrap();

            // center-panned content should be cancelled
            let input = sine_s16(480);
            let mut output = vec![0u8; input.len()];

            let mut processed = false;
            for _ in 0..50 {
                if session.process(&input, &mut output, 480).unwrap()
                    == ProcessStatus::Processed
                {
                    processed = true;
                    break;
                }
            }

            assert!(processed);
            let peak = output
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]).unsigned_abs())
                .max()
                .unwrap();
            assert!(peak < 100, "center content survived: peak {peak}");

            session.close().unwrap();
        });
    }

    #[test]
    fn set_param_reaches_the_effect() {
        with_daemon(false, |socket| {
            let session =
                Session::open(EffectKind::Karaoke, config(), options(socket)).unwrap();

            session
                .set_param(crate::dsp::karaoke::PARAM_STRENGTH, &0.0f32.to_le_bytes())
                .unwrap();

            // bad key is refused by the daemon
            assert_eq!(
                session.set_param(9999, &[0; 4]),
                Err(Error::InvalidArguments)
            );

            session.close().unwrap();
        });
    }

    #[test]
    fn daemon_refuses_bad_open_requests() {
        with_daemon(false, |socket| {
            // unknown format, rejected before the daemon is contacted
            let mut bad = config();
            bad.format = 24;
            let result = Session::open(EffectKind::Karaoke, bad, options(socket));
            assert!(matches!(result, Err(Error::NotSupported)));

            // unknown effect type, rejected by the daemon itself
            let channel = Channel::connect(socket).unwrap();
            let request = fxd_protocol::message::OpenRequest {
                header: MessageHeader::new(Magic::OPEN),
                effect_type: 99,
                padding: 0,
                config: config(),
            };
            let reply = control_roundtrip(&channel, bytemuck::bytes_of(&request)).unwrap();
            let Reply::Open(reply) = reply else {
                panic!("expected open reply");
            };
            assert_eq!(reply.result, ResultCode::NOT_SUPPORTED);
        });
    }

    #[test]
    fn cli_default_matches_the_normative_ring_capacity() {
        use structopt::StructOpt;

        let opt = DaemonOpt::from_iter(["fxd"]);
        assert_eq!(opt.ring_capacity, fxd_protocol::DEFAULT_RING_CAPACITY);
    }

    #[test]
    fn dropped_connection_reclaims_its_sessions() {
        with_daemon(true, |socket| {
            let session =
                Session::open(EffectKind::NoiseReduction, config(), options(socket)).unwrap();
            session.start().unwrap();
            let id = session.id();
            drop(session);

            // a fresh connection sees the session gone
            let channel = Channel::connect(socket).unwrap();
            let request =
                fxd_protocol::message::SessionRequest::new(Magic::QUERY_STATE, id);

            // the reclaim runs on the handler thread; poll briefly
            let mut gone = false;
            for _ in 0..50 {
                let reply =
                    control_roundtrip(&channel, bytemuck::bytes_of(&request)).unwrap();
                if let Reply::State(reply) = reply {
                    if reply.result == ResultCode::DEAD_OBJECT {
                        gone = true;
                        break;
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            assert!(gone, "session survived its connection");
        });
    }

    #[test]
    fn query_state_and_stats_over_the_wire() {
        with_daemon(true, |socket| {
            let session =
                Session::open(EffectKind::NoiseReduction, config(), options(socket)).unwrap();
            let id = session.id();

            let channel = Channel::connect(socket).unwrap();

            let request = fxd_protocol::message::SessionRequest::new(Magic::QUERY_STATE, id);
            let reply = control_roundtrip(&channel, bytemuck::bytes_of(&request)).unwrap();
            let Reply::State(reply) = reply else {
                panic!("expected state reply");
            };
            assert!(reply.result.is_ok());
            assert_eq!(SessionState::from_wire(reply.state), Some(SessionState::Opened));

            let request = fxd_protocol::message::SessionRequest::new(Magic::QUERY_STATS, id);
            let reply = control_roundtrip(&channel, bytemuck::bytes_of(&request)).unwrap();
            let Reply::Stats(reply) = reply else {
                panic!("expected stats reply");
            };
            assert!(reply.result.is_ok());
            assert_eq!(reply.stats.processed_frames, 0);

            session.close().unwrap();
        });
    }
}
