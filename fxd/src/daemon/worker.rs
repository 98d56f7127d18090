//! Per-session processing thread. Woken by the client's input signal, it
//! moves exactly one block per iteration through the effect and signals
//! the output event after each block, so a client that submitted several
//! blocks in one call collects one wake per block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fxd_protocol::types::stats::LatencyAccumulator;
use fxd_protocol::types::AudioConfig;
use fxd_protocol::WORKER_POLL_MS;
use fxd_transport::event::Wait;
use fxd_transport::pair::TransportPair;
use fxd_transport::time;

use crate::dsp::Effect;

/// SCHED_FIFO priority for session workers. The audio callback itself
/// runs in the client process, not here.
const WORKER_PRIORITY: libc::c_int = 10;

pub struct Worker {
    pub session_id: u32,
    pub config: AudioConfig,
    pub transport: Arc<TransportPair>,
    pub effect: Arc<Mutex<Box<dyn Effect>>>,
    pub stats: Arc<Mutex<LatencyAccumulator>>,
    pub running: Arc<AtomicBool>,
}

pub fn run(worker: Worker) {
    raise_priority(worker.session_id);

    let block = worker.config.block_size();
    let frames = worker.config.frames_per_buffer;
    let bytes_per_frame = worker.config.bytes_per_frame();

    let mut input = vec![0u8; block];
    let mut output = vec![0u8; block];

    log::debug!(
        "session {}: worker running, {} byte blocks",
        worker.session_id,
        block,
    );

    while worker.running.load(Ordering::Acquire) {
        match worker.transport.event_in.wait(WORKER_POLL_MS) {
            Ok(Wait::Signalled) => {}
            // heartbeat: recheck `running`
            Ok(Wait::TimedOut) => continue,
            Err(e) => {
                log::warn!("session {}: input wait failed: {e}", worker.session_id);
                break;
            }
        }

        loop {
            let mut consumer = worker.transport.input_consumer();
            if consumer.available() < block {
                // partial block, wait for the rest
                break;
            }

            let t0 = time::now();

            let read = consumer.read(&mut input);
            if read < block {
                worker.stats().record_xrun();
                break;
            }

            worker
                .effect
                .lock()
                .expect("effect mutex poisoned")
                .process(&input, &mut output, frames, bytes_per_frame);

            let written = worker.transport.output_producer().write(&output);
            if written < block {
                // the client is not draining; drop this block, keep the
                // output signal unsent
                worker.stats().record_dropped(frames);
                continue;
            }

            worker.transport.event_out.signal();

            let latency = time::now().micros_since(t0);
            worker
                .stats()
                .record(u32::try_from(latency).unwrap_or(u32::MAX), frames);
        }
    }

    log::debug!("session {}: worker exiting", worker.session_id);
}

impl Worker {
    fn stats(&self) -> std::sync::MutexGuard<'_, LatencyAccumulator> {
        self.stats.lock().expect("stats mutex poisoned")
    }
}

/// Best effort; a refusal is survivable, the worker just competes at the
/// default policy.
fn raise_priority(session_id: u32) {
    let param = libc::sched_param {
        sched_priority: WORKER_PRIORITY,
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == 0 {
        return;
    }

    let err = std::io::Error::last_os_error();
    log::warn!("session {session_id}: worker stays at default priority: {err}");
    if err.raw_os_error() == Some(libc::EPERM) {
        log::warn!("session {session_id}: grant the daemon CAP_SYS_NICE to allow SCHED_FIFO");
    }
}
