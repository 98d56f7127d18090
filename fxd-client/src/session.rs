use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use fxd_protocol::message::{self, MessageHeader, OpenRequest, Reply, SessionRequest, SetParamRequest};
use fxd_protocol::types::stats::{LatencyAccumulator, SessionStats};
use fxd_protocol::types::{AudioConfig, EffectKind, Magic, ResultCode, SessionState};
use fxd_protocol::{MAX_MESSAGE_SIZE, PROCESS_TIMEOUT_MS};
use fxd_transport::control::Channel;
use fxd_transport::event::Wait;
use fxd_transport::pair::TransportPair;
use fxd_transport::time;

use crate::Error;

/// Bound on any single control round trip, so a wedged daemon cannot hang
/// a non-RT control thread indefinitely.
const CONTROL_REPLY_TIMEOUT_MS: i32 = 1000;

/// Internal state marker for a session whose close message was sent.
const STATE_CLOSED: u32 = u32::MAX;

pub struct SessionOptions {
    /// Path of the daemon's control socket.
    pub socket: PathBuf,
    /// Consecutive fallbacks before the session degrades to permanent
    /// passthrough. Each successful round trip decrements the streak.
    pub fallback_threshold: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        let socket = env::var_os("FXD_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/run/fxd/control.sock"));

        SessionOptions {
            socket,
            fallback_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The daemon processed this buffer; `output` holds effect audio.
    Processed,
    /// `output` holds a passthrough copy of `input`.
    Fallback(FallbackReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The input ring had no room for the whole buffer.
    RingFull,
    /// The daemon did not signal within the deadline.
    DeadlineExpired,
    /// The daemon signalled but produced less than a full buffer.
    ShortRead,
    /// The session hit its fallback threshold and stays in passthrough.
    Degraded,
}

impl ProcessStatus {
    /// The stable wire-level code for this outcome. Every fallback reports
    /// TIMEOUT, matching the control surface contract.
    pub fn code(self) -> ResultCode {
        match self {
            ProcessStatus::Processed => ResultCode::OK,
            ProcessStatus::Fallback(_) => ResultCode::TIMEOUT,
        }
    }
}

pub struct Session {
    id: u32,
    effect: EffectKind,
    config: AudioConfig,
    bytes_per_frame: u32,
    state: AtomicU32,
    transport: TransportPair,
    control: Option<Mutex<Channel>>,
    stats: Mutex<LatencyAccumulator>,
    fallback_streak: AtomicU32,
    degraded: AtomicBool,
    fallback_threshold: u32,
}

impl Session {
    /// Connects to the daemon, requests a session and maps its transport.
    /// Non-RT.
    pub fn open(
        effect: EffectKind,
        config: AudioConfig,
        options: SessionOptions,
    ) -> Result<Session, Error> {
        if !config.is_valid() {
            return Err(Error::InvalidArguments);
        }
        if !config.is_supported_format() {
            return Err(Error::NotSupported);
        }

        let channel = Channel::connect(&options.socket).map_err(|e| {
            log::error!("connecting to effect daemon at {}: {e}", options.socket.display());
            Error::DeadObject
        })?;

        let request = OpenRequest {
            header: MessageHeader::new(Magic::OPEN),
            effect_type: effect.to_wire(),
            padding: 0,
            config,
        };
        channel
            .send(bytemuck::bytes_of(&request), &[])
            .map_err(|_| Error::DeadObject)?;

        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let (n, mut fds) = channel
            .recv_timeout(&mut buf, CONTROL_REPLY_TIMEOUT_MS)
            .map_err(|_| Error::DeadObject)?;

        let Some(Reply::Open(reply)) = message::parse_reply(&buf[..n]) else {
            log::error!("malformed open reply from effect daemon");
            return Err(Error::DeadObject);
        };
        if !reply.result.is_ok() {
            return Err(Error::from_code(reply.result));
        }
        if fds.len() != 3 {
            log::error!("open reply carried {} fds, expected 3", fds.len());
            return Err(Error::DeadObject);
        }

        let event_out = fds.pop().expect("fd count checked");
        let event_in = fds.pop().expect("fd count checked");
        let shm = fds.pop().expect("fd count checked");

        let transport = TransportPair::from_descriptor(reply.descriptor, shm, event_in, event_out)
            .map_err(|e| {
                log::error!("mapping session transport: {e}");
                Error::NoMemory
            })?;

        log::info!(
            "opened {effect} session {} ({} Hz, {} ch, s{}le, {} frames/buffer)",
            reply.session_id,
            config.sample_rate,
            config.channels,
            config.format,
            config.frames_per_buffer,
        );

        Ok(Session::from_parts(
            reply.session_id,
            effect,
            config,
            transport,
            Some(channel),
            options.fallback_threshold,
        ))
    }

    fn from_parts(
        id: u32,
        effect: EffectKind,
        config: AudioConfig,
        transport: TransportPair,
        control: Option<Channel>,
        fallback_threshold: u32,
    ) -> Session {
        Session {
            id,
            effect,
            config,
            bytes_per_frame: config.bytes_per_frame(),
            state: AtomicU32::new(SessionState::Opened.to_wire()),
            transport,
            control: control.map(Mutex::new),
            stats: Mutex::new(LatencyAccumulator::new()),
            fallback_streak: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            fallback_threshold,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn effect(&self) -> EffectKind {
        self.effect
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_wire(self.state.load(Ordering::Acquire))
            .unwrap_or(SessionState::Stopped)
    }

    /// Whether the aging fallback has latched this session into permanent
    /// passthrough.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Asks the daemon to launch the session worker. Non-RT.
    pub fn start(&self) -> Result<(), Error> {
        self.expect_state(SessionState::Opened)?;
        self.simple_request(Magic::START)?;
        self.state
            .store(SessionState::Started.to_wire(), Ordering::Release);
        Ok(())
    }

    /// Halts the session worker. Non-RT.
    pub fn stop(&self) -> Result<(), Error> {
        self.expect_state(SessionState::Started)?;
        self.simple_request(Magic::STOP)?;
        self.state
            .store(SessionState::Stopped.to_wire(), Ordering::Release);
        Ok(())
    }

    /// Releases the daemon-side session. The transport unmaps when the
    /// session drops.
    pub fn close(self) -> Result<(), Error> {
        let result = self.simple_request(Magic::CLOSE);
        self.state.store(STATE_CLOSED, Ordering::Release);
        result
    }

    /// Forwards an opaque parameter to the effect. Non-RT.
    pub fn set_param(&self, key: u32, value: &[u8]) -> Result<(), Error> {
        let state = self.state();
        if state != SessionState::Opened && state != SessionState::Started {
            return Err(Error::InvalidState);
        }

        let request =
            SetParamRequest::new(self.id, key, value).ok_or(Error::InvalidArguments)?;
        self.roundtrip(bytemuck::bytes_of(&request))
    }

    /// Snapshot of the client-side counters. Any thread.
    pub fn query_stats(&self) -> SessionStats {
        self.stats().snapshot()
    }

    /// Pushes one buffer through the effect, falling back to a passthrough
    /// copy on any shortfall. Real-time safe: no allocation, no logging,
    /// no control traffic; the only suspension is the bounded output wait.
    ///
    /// Must be called by a single thread at a time, conventionally the
    /// HAL's real-time callback.
    pub fn process(
        &self,
        input: &[u8],
        output: &mut [u8],
        frames: u32,
    ) -> Result<ProcessStatus, Error> {
        if frames == 0 {
            return Err(Error::InvalidArguments);
        }
        let total = frames as usize * self.bytes_per_frame as usize;
        if input.len() < total || output.len() < total {
            return Err(Error::InvalidArguments);
        }
        if self.state.load(Ordering::Acquire) != SessionState::Started.to_wire() {
            return Err(Error::InvalidState);
        }

        if self.degraded.load(Ordering::Relaxed) {
            output[..total].copy_from_slice(&input[..total]);
            return Ok(ProcessStatus::Fallback(FallbackReason::Degraded));
        }

        let t0 = time::now();

        let written = self.transport.input_producer().write(&input[..total]);
        if written < total {
            self.stats().record_xrun();
            return self.fall_back(input, output, total, FallbackReason::RingFull);
        }

        self.transport.event_in.signal();

        match self.transport.event_out.wait(PROCESS_TIMEOUT_MS) {
            Ok(Wait::Signalled) => {}
            Ok(Wait::TimedOut) | Err(_) => {
                self.stats().record_timeout();
                return self.fall_back(input, output, total, FallbackReason::DeadlineExpired);
            }
        }

        let read = self.transport.output_consumer().read(&mut output[..total]);
        if read < total {
            self.stats().record_dropped(frames);
            return self.fall_back(input, output, total, FallbackReason::ShortRead);
        }

        let latency = time::now().micros_since(t0);
        let latency = u32::try_from(latency).unwrap_or(u32::MAX);
        self.stats().record(latency, frames);

        // success ages the fallback streak back down
        let streak = self.fallback_streak.load(Ordering::Relaxed);
        if streak > 0 {
            self.fallback_streak.store(streak - 1, Ordering::Relaxed);
        }

        Ok(ProcessStatus::Processed)
    }

    fn fall_back(
        &self,
        input: &[u8],
        output: &mut [u8],
        total: usize,
        reason: FallbackReason,
    ) -> Result<ProcessStatus, Error> {
        output[..total].copy_from_slice(&input[..total]);

        let streak = self.fallback_streak.load(Ordering::Relaxed) + 1;
        self.fallback_streak.store(streak, Ordering::Relaxed);
        if streak >= self.fallback_threshold {
            self.degraded.store(true, Ordering::Relaxed);
        }

        Ok(ProcessStatus::Fallback(reason))
    }

    fn stats(&self) -> MutexGuard<'_, LatencyAccumulator> {
        // leaf lock, held only for counter updates
        self.stats.lock().expect("stats mutex poisoned")
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), Error> {
        if self.state.load(Ordering::Acquire) != expected.to_wire() {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    fn simple_request(&self, magic: Magic) -> Result<(), Error> {
        let request = SessionRequest::new(magic, self.id);
        self.roundtrip(bytemuck::bytes_of(&request))
    }

    fn roundtrip(&self, bytes: &[u8]) -> Result<(), Error> {
        let Some(control) = &self.control else {
            return Err(Error::DeadObject);
        };
        let control = control.lock().expect("control mutex poisoned");

        control.send(bytes, &[]).map_err(|_| Error::DeadObject)?;

        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let (n, _fds) = control
            .recv_timeout(&mut buf, CONTROL_REPLY_TIMEOUT_MS)
            .map_err(|_| Error::DeadObject)?;

        match message::parse_reply(&buf[..n]) {
            Some(Reply::Simple(reply)) if reply.result.is_ok() => Ok(()),
            Some(Reply::Simple(reply)) => Err(Error::from_code(reply.result)),
            _ => Err(Error::DeadObject),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) != STATE_CLOSED {
            let _ = self.simple_request(Magic::CLOSE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
    use std::time::Instant;

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 48000,
            channels: 2,
            format: 16,
            frames_per_buffer: 480,
        }
    }

    fn dup(fd: RawFd) -> OwnedFd {
        unsafe { BorrowedFd::borrow_raw(fd) }
            .try_clone_to_owned()
            .unwrap()
    }

    /// A started session plus the daemon-side view of its transport.
    fn started_session(
        config: AudioConfig,
        ring_capacity: u32,
        fallback_threshold: u32,
    ) -> (Session, TransportPair) {
        let daemon = TransportPair::allocate(ring_capacity, ring_capacity).unwrap();
        let [shm, event_in, event_out] = daemon.fds();
        let client = TransportPair::from_descriptor(
            daemon.descriptor(),
            dup(shm),
            dup(event_in),
            dup(event_out),
        )
        .unwrap();

        let session =
            Session::from_parts(1, EffectKind::NoiseReduction, config, client, None, fallback_threshold);
        session
            .state
            .store(SessionState::Started.to_wire(), Ordering::Release);

        (session, daemon)
    }

    fn sine_s16(frames: usize, channels: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(frames * channels * 2);
        for frame in 0..frames {
            let t = frame as f32 / 48000.0;
            let sample = ((t * 1000.0 * 2.0 * std::f32::consts::PI).sin() * 20000.0) as i16;
            for _ in 0..channels {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
        }
        bytes
    }

    /// Drains the input ring, echoes it to the output ring and signals,
    /// like a passthrough daemon worker.
    fn echo_once(daemon: &TransportPair, block: usize) {
        assert_eq!(daemon.event_in.wait(1000).unwrap(), Wait::Signalled);

        let mut buf = vec![0u8; block];
        let read = daemon.input_consumer().read(&mut buf);
        assert_eq!(read, block);
        assert_eq!(daemon.output_producer().write(&buf), block);
        daemon.event_out.signal();
    }

    #[test]
    fn process_happy_path_is_a_round_trip() {
        let config = config();
        let (session, daemon) = started_session(config, 1 << 20, 100);

        let input = sine_s16(480, 2);
        let block = input.len();
        let mut output = vec![0u8; block];

        std::thread::scope(|scope| {
            scope.spawn(|| echo_once(&daemon, block));

            let status = session.process(&input, &mut output, 480).unwrap();
            assert_eq!(status, ProcessStatus::Processed);
        });

        assert_eq!(output, input);

        let stats = session.query_stats();
        assert_eq!(stats.processed_frames, 480);
        assert_eq!(stats.timeout_count, 0);
        assert!(stats.max_latency_us > 0);
    }

    #[test]
    fn stalled_daemon_yields_passthrough_within_the_deadline() {
        let config = config();
        let (session, _daemon) = started_session(config, 1 << 20, 100);

        let input = sine_s16(480, 2);
        let mut output = vec![0u8; input.len()];

        let start = Instant::now();
        let status = session.process(&input, &mut output, 480).unwrap();
        let elapsed = start.elapsed().as_millis();

        assert_eq!(
            status,
            ProcessStatus::Fallback(FallbackReason::DeadlineExpired)
        );
        assert_eq!(status.code(), ResultCode::TIMEOUT);
        assert!(elapsed < 100, "process took {elapsed}ms");
        assert_eq!(output, input);
        assert_eq!(session.query_stats().timeout_count, 1);
    }

    #[test]
    fn full_input_ring_is_an_xrun_passthrough() {
        let config = config();
        let (session, daemon) = started_session(config, 256, 100);

        // leave the ring with no room at all
        let filler = vec![0x55u8; 256];
        assert_eq!(session.transport.input_producer().write(&filler), 256);

        let input = sine_s16(480, 2);
        let mut output = vec![0u8; input.len()];

        let status = session.process(&input, &mut output, 480).unwrap();
        assert_eq!(status, ProcessStatus::Fallback(FallbackReason::RingFull));
        assert_eq!(output, input);

        let stats = session.query_stats();
        assert_eq!(stats.xrun_count, 1);
        assert_eq!(stats.timeout_count, 0);

        // nothing beyond the filler made it in
        let mut queued = vec![0u8; 256];
        assert_eq!(daemon.input_consumer().read(&mut queued), 256);
        assert_eq!(queued, filler);
        assert_eq!(daemon.input_consumer().available(), 0);
    }

    #[test]
    fn partial_ring_room_queues_what_fits_and_falls_back() {
        let config = config();
        // room for 256 of the block's 1920 bytes
        let (session, daemon) = started_session(config, 256, 100);

        let input = sine_s16(480, 2);
        let mut output = vec![0u8; input.len()];

        let status = session.process(&input, &mut output, 480).unwrap();
        assert_eq!(status, ProcessStatus::Fallback(FallbackReason::RingFull));
        assert_eq!(output, input);
        assert_eq!(session.query_stats().xrun_count, 1);

        // the short write still queued the prefix that fit
        let mut queued = vec![0u8; 256];
        assert_eq!(daemon.input_consumer().read(&mut queued), 256);
        assert_eq!(queued, &input[..256]);
    }

    #[test]
    fn short_daemon_output_is_dropped_and_passed_through() {
        let config = config();
        let (session, daemon) = started_session(config, 1 << 20, 100);

        let input = sine_s16(480, 2);
        let block = input.len();
        let mut output = vec![0u8; block];

        std::thread::scope(|scope| {
            scope.spawn(|| {
                assert_eq!(daemon.event_in.wait(1000).unwrap(), Wait::Signalled);
                let mut buf = vec![0u8; block];
                daemon.input_consumer().read(&mut buf);
                // only half a block comes back
                daemon.output_producer().write(&buf[..block / 2]);
                daemon.event_out.signal();
            });

            let status = session.process(&input, &mut output, 480).unwrap();
            assert_eq!(status, ProcessStatus::Fallback(FallbackReason::ShortRead));
        });

        assert_eq!(output, input);
        assert_eq!(session.query_stats().dropped_frames, 480);
    }

    #[test]
    fn sustained_fallbacks_degrade_the_session() {
        let config = config();
        let (session, _daemon) = started_session(config, 1 << 20, 3);

        let input = sine_s16(480, 2);
        let mut output = vec![0u8; input.len()];

        for _ in 0..3 {
            let status = session.process(&input, &mut output, 480).unwrap();
            assert_eq!(
                status,
                ProcessStatus::Fallback(FallbackReason::DeadlineExpired)
            );
        }
        assert!(session.is_degraded());

        // degraded sessions skip the transport entirely
        let start = Instant::now();
        let status = session.process(&input, &mut output, 480).unwrap();
        assert_eq!(status, ProcessStatus::Fallback(FallbackReason::Degraded));
        assert!(start.elapsed().as_millis() < 10);
        assert_eq!(output, input);
    }

    #[test]
    fn success_ages_the_fallback_streak_down() {
        let config = config();
        let (session, daemon) = started_session(config, 1 << 20, 3);

        let input = sine_s16(480, 2);
        let block = input.len();
        let mut output = vec![0u8; block];

        // two fallbacks, then a success, then one more fallback: the
        // streak never reaches three
        for _ in 0..2 {
            session.process(&input, &mut output, 480).unwrap();
        }
        std::thread::scope(|scope| {
            scope.spawn(|| echo_once(&daemon, block));
            let status = session.process(&input, &mut output, 480).unwrap();
            assert_eq!(status, ProcessStatus::Processed);
        });
        session.process(&input, &mut output, 480).unwrap();

        assert!(!session.is_degraded());
    }

    #[test]
    fn process_rejects_bad_arguments_and_state() {
        let config = config();
        let (session, _daemon) = started_session(config, 1 << 20, 100);

        let input = sine_s16(480, 2);
        let mut output = vec![0u8; input.len()];

        assert_eq!(
            session.process(&input, &mut output, 0),
            Err(Error::InvalidArguments)
        );

        let mut short = vec![0u8; 16];
        assert_eq!(
            session.process(&input, &mut short, 480),
            Err(Error::InvalidArguments)
        );

        session
            .state
            .store(SessionState::Opened.to_wire(), Ordering::Release);
        assert_eq!(
            session.process(&input, &mut output, 480),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn control_ops_without_a_daemon_report_dead_object() {
        let config = config();
        let (session, _daemon) = started_session(config, 1 << 20, 100);

        session
            .state
            .store(SessionState::Opened.to_wire(), Ordering::Release);
        assert_eq!(session.start(), Err(Error::DeadObject));
        assert_eq!(session.set_param(1, &[0; 4]), Err(Error::DeadObject));
    }
}
