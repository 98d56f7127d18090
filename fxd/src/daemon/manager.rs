//! Process-wide session table. Sessions are the unit of lifecycle: the
//! daemon outlives them, and a dropped control connection tears down the
//! sessions it created.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use fxd_protocol::message::OpenRequest;
use fxd_protocol::types::stats::SessionStats;
use fxd_protocol::types::{
    EffectKind, ResultCode, SessionState, TransportDescriptor,
};

use super::session::Session;

pub struct SessionManager {
    sessions: Mutex<HashMap<u32, Session>>,
    next_id: AtomicU32,
    ring_capacity: u32,
    passthrough: bool,
}

impl SessionManager {
    pub fn new(ring_capacity: u32, passthrough: bool) -> SessionManager {
        SessionManager {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            ring_capacity,
            passthrough,
        }
    }

    /// Creates and opens a session, returning what the open reply needs.
    /// The returned fds stay owned by the session.
    pub fn open(
        &self,
        request: &OpenRequest,
    ) -> Result<(u32, TransportDescriptor, [RawFd; 3]), ResultCode> {
        let effect = EffectKind::from_wire(request.effect_type)
            .ok_or(ResultCode::NOT_SUPPORTED)?;

        let config = request.config;
        if !config.is_valid() {
            return Err(ResultCode::INVALID_ARGUMENTS);
        }
        if !config.is_supported_format() {
            return Err(ResultCode::NOT_SUPPORTED);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut session = Session::new(id, effect, config);
        session.open(self.ring_capacity, self.passthrough)?;

        let descriptor = session.descriptor().ok_or(ResultCode::NO_MEMORY)?;
        let fds = session.fds().ok_or(ResultCode::NO_MEMORY)?;

        self.sessions().insert(id, session);
        Ok((id, descriptor, fds))
    }

    pub fn start(&self, id: u32) -> Result<(), ResultCode> {
        self.with_session(id, |session| session.start())
    }

    pub fn stop(&self, id: u32) -> Result<(), ResultCode> {
        self.with_session(id, |session| session.stop())
    }

    pub fn set_param(&self, id: u32, key: u32, value: &[u8]) -> Result<(), ResultCode> {
        self.with_session(id, |session| session.set_param(key, value))
    }

    pub fn state(&self, id: u32) -> Result<SessionState, ResultCode> {
        self.with_session(id, |session| Ok(session.state()))
    }

    pub fn stats(&self, id: u32) -> Result<SessionStats, ResultCode> {
        self.with_session(id, |session| Ok(session.stats()))
    }

    pub fn close(&self, id: u32) -> Result<(), ResultCode> {
        let mut session = self
            .sessions()
            .remove(&id)
            .ok_or(ResultCode::DEAD_OBJECT)?;
        session.destroy();
        log::info!("session {id}: closed");
        Ok(())
    }

    /// Drains every session; used on daemon shutdown.
    pub fn shutdown(&self) {
        let mut sessions = self.sessions();
        let count = sessions.len();
        for (_, mut session) in sessions.drain() {
            session.destroy();
        }
        if count > 0 {
            log::info!("drained {count} session(s)");
        }
    }

    fn with_session<T>(
        &self,
        id: u32,
        f: impl FnOnce(&mut Session) -> Result<T, ResultCode>,
    ) -> Result<T, ResultCode> {
        let mut sessions = self.sessions();
        let session = sessions.get_mut(&id).ok_or(ResultCode::DEAD_OBJECT)?;
        f(session)
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Session>> {
        self.sessions.lock().expect("session table poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxd_protocol::message::MessageHeader;
    use fxd_protocol::types::{AudioConfig, Magic};

    fn open_request(effect_type: u32, format: u32) -> OpenRequest {
        OpenRequest {
            header: MessageHeader::new(Magic::OPEN),
            effect_type,
            padding: 0,
            config: AudioConfig {
                sample_rate: 48000,
                channels: 2,
                format,
                frames_per_buffer: 480,
            },
        }
    }

    #[test]
    fn sessions_get_distinct_ids() {
        let manager = SessionManager::new(1 << 16, true);

        let (first, ..) = manager.open(&open_request(0, 16)).unwrap();
        let (second, ..) = manager.open(&open_request(1, 16)).unwrap();
        assert_ne!(first, second);

        manager.close(first).unwrap();
        manager.close(second).unwrap();
    }

    #[test]
    fn unknown_effects_and_formats_are_refused() {
        let manager = SessionManager::new(1 << 16, true);

        assert_eq!(
            manager.open(&open_request(99, 16)).unwrap_err(),
            ResultCode::NOT_SUPPORTED
        );
        assert_eq!(
            manager.open(&open_request(0, 24)).unwrap_err(),
            ResultCode::NOT_SUPPORTED
        );

        let mut request = open_request(0, 16);
        request.config.channels = 0;
        assert_eq!(
            manager.open(&request).unwrap_err(),
            ResultCode::INVALID_ARGUMENTS
        );
    }

    #[test]
    fn operations_on_missing_sessions_report_dead_object() {
        let manager = SessionManager::new(1 << 16, true);

        assert_eq!(manager.start(7), Err(ResultCode::DEAD_OBJECT));
        assert_eq!(manager.stop(7), Err(ResultCode::DEAD_OBJECT));
        assert_eq!(manager.close(7), Err(ResultCode::DEAD_OBJECT));
        assert!(manager.state(7).is_err());
    }

    #[test]
    fn full_lifecycle_through_the_manager() {
        let manager = SessionManager::new(1 << 16, true);

        let (id, descriptor, fds) = manager.open(&open_request(1, 16)).unwrap();
        assert!(descriptor.input_ring_capacity > 0);
        assert!(fds.iter().all(|fd| *fd >= 0));
        assert_eq!(manager.state(id).unwrap(), SessionState::Opened);

        manager.start(id).unwrap();
        assert_eq!(manager.state(id).unwrap(), SessionState::Started);

        manager.stop(id).unwrap();
        assert_eq!(manager.state(id).unwrap(), SessionState::Stopped);

        manager.close(id).unwrap();
        assert_eq!(manager.state(id), Err(ResultCode::DEAD_OBJECT));
    }

    #[test]
    fn shutdown_drains_running_sessions() {
        let manager = SessionManager::new(1 << 16, true);

        let (id, ..) = manager.open(&open_request(0, 16)).unwrap();
        manager.start(id).unwrap();

        manager.shutdown();
        assert_eq!(manager.state(id), Err(ResultCode::DEAD_OBJECT));
    }
}
