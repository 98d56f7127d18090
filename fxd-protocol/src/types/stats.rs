use bytemuck::{Pod, Zeroable};

/// Latency buckets are 250us wide; the last bucket catches everything past
/// 31.75ms, well beyond the process deadline.
const BUCKET_WIDTH_US: u32 = 250;
const BUCKET_COUNT: usize = 128;

/// Per-session counters, as reported over the wire and by the client API.
/// All latencies are microseconds.
#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(C)]
pub struct SessionStats {
    pub processed_frames: u64,
    pub dropped_frames: u64,
    pub avg_latency_us: u32,
    pub p95_latency_us: u32,
    pub max_latency_us: u32,
    pub timeout_count: u32,
    pub xrun_count: u32,
    pub padding: u32,
}

impl SessionStats {
    pub fn new() -> Self {
        SessionStats::zeroed()
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        SessionStats::new()
    }
}

/// Accumulates round-trip latencies and failure counters for one session.
///
/// The average is an exponential moving average with weight 1/10; the first
/// sample initializes it directly. p95 comes from a fixed bucket histogram,
/// so recording is allocation-free and bounded. Counters saturate rather
/// than wrap.
pub struct LatencyAccumulator {
    stats: SessionStats,
    buckets: [u32; BUCKET_COUNT],
    samples: u64,
}

impl LatencyAccumulator {
    pub fn new() -> Self {
        LatencyAccumulator {
            stats: SessionStats::new(),
            buckets: [0; BUCKET_COUNT],
            samples: 0,
        }
    }

    pub fn record(&mut self, latency_us: u32, frames: u32) {
        self.stats.processed_frames =
            self.stats.processed_frames.saturating_add(frames as u64);

        if self.samples == 0 {
            self.stats.avg_latency_us = latency_us;
        } else {
            let avg = self.stats.avg_latency_us as u64;
            self.stats.avg_latency_us = ((avg * 9 + latency_us as u64) / 10) as u32;
        }
        self.samples = self.samples.saturating_add(1);

        if latency_us > self.stats.max_latency_us {
            self.stats.max_latency_us = latency_us;
        }

        let bucket = ((latency_us / BUCKET_WIDTH_US) as usize).min(BUCKET_COUNT - 1);
        self.buckets[bucket] = self.buckets[bucket].saturating_add(1);
        self.stats.p95_latency_us = self.percentile_95();
    }

    pub fn record_dropped(&mut self, frames: u32) {
        self.stats.dropped_frames =
            self.stats.dropped_frames.saturating_add(frames as u64);
    }

    pub fn record_timeout(&mut self) {
        self.stats.timeout_count = self.stats.timeout_count.saturating_add(1);
    }

    pub fn record_xrun(&mut self) {
        self.stats.xrun_count = self.stats.xrun_count.saturating_add(1);
    }

    pub fn snapshot(&self) -> SessionStats {
        self.stats
    }

    fn percentile_95(&self) -> u32 {
        let target = ((self.samples * 95 + 99) / 100).max(1);
        let mut seen = 0u64;
        for (index, count) in self.buckets.iter().enumerate() {
            seen += *count as u64;
            if seen >= target {
                let upper = (index as u32 + 1) * BUCKET_WIDTH_US;
                return upper.min(self.stats.max_latency_us);
            }
        }
        self.stats.max_latency_us
    }
}

impl Default for LatencyAccumulator {
    fn default() -> Self {
        LatencyAccumulator::new()
    }
}
