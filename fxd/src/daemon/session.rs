//! Daemon-side session: owns the transport pair, the effect instance and
//! the worker thread, and enforces the lifecycle state machine.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use fxd_protocol::types::stats::{LatencyAccumulator, SessionStats};
use fxd_protocol::types::{
    AudioConfig, EffectKind, ResultCode, SessionState, TransportDescriptor,
};
use fxd_protocol::MIN_RING_BLOCKS;
use fxd_transport::pair::TransportPair;

use crate::dsp::{self, Effect};

use super::worker::{self, Worker};

pub struct Session {
    id: u32,
    effect_kind: EffectKind,
    config: AudioConfig,
    state: SessionState,
    transport: Option<Arc<TransportPair>>,
    effect: Option<Arc<Mutex<Box<dyn Effect>>>>,
    worker: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<LatencyAccumulator>>,
}

impl Session {
    pub fn new(id: u32, effect_kind: EffectKind, config: AudioConfig) -> Session {
        Session {
            id,
            effect_kind,
            config,
            state: SessionState::Idle,
            transport: None,
            effect: None,
            worker: None,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(LatencyAccumulator::new())),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().expect("stats mutex poisoned").snapshot()
    }

    /// Allocates the transport and instantiates the effect.
    pub fn open(
        &mut self,
        ring_capacity: u32,
        passthrough: bool,
    ) -> Result<(), ResultCode> {
        if self.state != SessionState::Idle {
            return Err(ResultCode::INVALID_STATE);
        }

        // every ring holds at least a few blocks of audio
        let floor = (self.config.block_size() as u64 * MIN_RING_BLOCKS as u64)
            .min(u32::MAX as u64) as u32;
        let capacity = ring_capacity.max(floor);

        let transport = TransportPair::allocate(capacity, capacity).map_err(|e| {
            log::error!("session {}: transport allocation failed: {e}", self.id);
            self.state = SessionState::Error;
            ResultCode::NO_MEMORY
        })?;

        let effect = dsp::create(self.effect_kind, &self.config, passthrough);
        log::info!("session {}: instantiated effect: {}", self.id, effect);

        self.transport = Some(Arc::new(transport));
        self.effect = Some(Arc::new(Mutex::new(effect)));
        self.state = SessionState::Opened;
        Ok(())
    }

    /// Spawns the worker thread.
    pub fn start(&mut self) -> Result<(), ResultCode> {
        if self.state != SessionState::Opened {
            return Err(ResultCode::INVALID_STATE);
        }

        let transport = self.transport.clone().ok_or(ResultCode::INVALID_STATE)?;
        let effect = self.effect.clone().ok_or(ResultCode::INVALID_STATE)?;

        // drop anything buffered from before this start
        transport.reset();
        self.running.store(true, Ordering::Release);

        let worker = Worker {
            session_id: self.id,
            config: self.config,
            transport,
            effect,
            stats: Arc::clone(&self.stats),
            running: Arc::clone(&self.running),
        };
        let thread = std::thread::Builder::new()
            .name(format!("fxd-worker-{}", self.id))
            .spawn(move || worker::run(worker))
            .map_err(|e| {
                log::error!("session {}: spawning worker failed: {e}", self.id);
                self.running.store(false, Ordering::Release);
                ResultCode::NO_MEMORY
            })?;
        self.worker = Some(thread);

        self.state = SessionState::Started;
        log::info!("session {}: started", self.id);
        Ok(())
    }

    /// Halts and joins the worker. Returns within one heartbeat interval.
    pub fn stop(&mut self) -> Result<(), ResultCode> {
        if self.state != SessionState::Started {
            return Err(ResultCode::INVALID_STATE);
        }

        self.halt_worker();
        if self.state != SessionState::Error {
            self.state = SessionState::Stopped;
        }
        log::info!("session {}: stopped", self.id);
        Ok(())
    }

    pub fn set_param(&mut self, key: u32, value: &[u8]) -> Result<(), ResultCode> {
        let Some(effect) = &self.effect else {
            return Err(ResultCode::INVALID_STATE);
        };

        effect
            .lock()
            .expect("effect mutex poisoned")
            .set_param(key, value)
            .map_err(|e| {
                log::warn!("session {}: setParam rejected: {e}", self.id);
                ResultCode::INVALID_ARGUMENTS
            })
    }

    pub fn descriptor(&self) -> Option<TransportDescriptor> {
        self.transport.as_ref().map(|t| t.descriptor())
    }

    pub fn fds(&self) -> Option<[RawFd; 3]> {
        self.transport.as_ref().map(|t| t.fds())
    }

    /// Close is legal from any state; a running worker is halted first.
    pub fn destroy(&mut self) {
        self.halt_worker();
        self.transport = None;
        self.effect = None;
    }

    fn halt_worker(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("session {}: worker panicked", self.id);
                self.state = SessionState::Error;
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 48000,
            channels: 2,
            format: 16,
            frames_per_buffer: 480,
        }
    }

    #[test]
    fn lifecycle_follows_the_state_machine() {
        let mut session = Session::new(1, EffectKind::Karaoke, config());
        assert_eq!(session.state(), SessionState::Idle);

        session.open(1 << 16, false).unwrap();
        assert_eq!(session.state(), SessionState::Opened);

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Started);

        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut session = Session::new(1, EffectKind::Karaoke, config());

        assert_eq!(session.start(), Err(ResultCode::INVALID_STATE));
        assert_eq!(session.stop(), Err(ResultCode::INVALID_STATE));

        session.open(1 << 16, false).unwrap();
        assert_eq!(session.open(1 << 16, false), Err(ResultCode::INVALID_STATE));
        assert_eq!(session.stop(), Err(ResultCode::INVALID_STATE));

        session.start().unwrap();
        assert_eq!(session.start(), Err(ResultCode::INVALID_STATE));

        session.stop().unwrap();
        // no restart after stop
        assert_eq!(session.start(), Err(ResultCode::INVALID_STATE));
    }

    #[test]
    fn ring_capacity_is_floored_to_hold_blocks() {
        let mut session = Session::new(1, EffectKind::Karaoke, config());
        session.open(16, false).unwrap();

        let descriptor = session.descriptor().unwrap();
        let block = config().block_size() as u32;
        assert!(descriptor.input_ring_capacity >= block * MIN_RING_BLOCKS);
    }

    #[test]
    fn set_param_requires_an_open_session() {
        let mut session = Session::new(1, EffectKind::Karaoke, config());
        assert_eq!(
            session.set_param(1, &[0; 4]),
            Err(ResultCode::INVALID_STATE)
        );

        session.open(1 << 16, false).unwrap();
        session.set_param(1, &0.5f32.to_le_bytes()).unwrap();
    }

    #[test]
    fn destroy_from_started_joins_the_worker() {
        let mut session = Session::new(1, EffectKind::Karaoke, config());
        session.open(1 << 16, false).unwrap();
        session.start().unwrap();

        let start = std::time::Instant::now();
        session.destroy();
        assert!(start.elapsed().as_millis() < 250);
    }
}
