//! Per-generation timing and stop bookkeeping.
//!
//! Each generation fills one [`PerfStats`] and leaves it on the context for
//! callers to inspect after the call returns.

use std::fmt;
use std::time::{Duration, Instant};

/// Why the talker loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// End-of-sequence code sampled
    Eos,
    /// Token budget reached
    #[default]
    MaxTokens,
    /// A streaming callback asked to stop
    Aborted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::Eos => "eos",
            StopReason::MaxTokens => "max_tokens",
            StopReason::Aborted => "aborted",
        })
    }
}

/// Wall-clock breakdown of one generation, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerfStats {
    pub prefill_ms: f64,
    pub talker_ms: f64,
    pub subtalker_ms: f64,
    pub codec_ms: f64,
    pub total_ms: f64,
    pub frames: usize,
    pub stop_reason: StopReason,
}

impl PerfStats {
    /// Milliseconds per generated frame across talker and sub-talker.
    pub fn ms_per_frame(&self) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        (self.talker_ms + self.subtalker_ms) / self.frames as f64
    }

    pub fn log(&self) {
        tracing::info!(
            frames = self.frames,
            stop = %self.stop_reason,
            prefill_ms = format!("{:.1}", self.prefill_ms),
            talker_ms = format!("{:.1}", self.talker_ms),
            subtalker_ms = format!("{:.1}", self.subtalker_ms),
            codec_ms = format!("{:.1}", self.codec_ms),
            total_ms = format!("{:.1}", self.total_ms),
            ms_per_frame = format!("{:.1}", self.ms_per_frame()),
            "generation finished"
        );
    }
}

/// Start/stop timer accumulating into a millisecond counter.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch(Instant);

impl Stopwatch {
    #[inline]
    pub fn start() -> Self {
        Self(Instant::now())
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    #[inline]
    pub fn elapsed_ms(&self) -> f64 {
        self.0.elapsed().as_secs_f64() * 1000.0
    }

    /// Add the elapsed time to `acc` and restart.
    #[inline]
    pub fn lap_into(&mut self, acc: &mut f64) {
        let now = Instant::now();
        *acc += (now - self.0).as_secs_f64() * 1000.0;
        self.0 = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_per_frame_handles_zero_frames() {
        let stats = PerfStats::default();
        assert_eq!(stats.ms_per_frame(), 0.0);
        let stats = PerfStats {
            talker_ms: 30.0,
            subtalker_ms: 10.0,
            frames: 4,
            ..Default::default()
        };
        assert_eq!(stats.ms_per_frame(), 10.0);
    }

    #[test]
    fn test_lap_accumulates() {
        let mut sw = Stopwatch::start();
        let mut acc = 0.0;
        std::thread::sleep(Duration::from_millis(2));
        sw.lap_into(&mut acc);
        assert!(acc >= 1.0);
        assert!(sw.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stop_reason_names() {
        assert_eq!(StopReason::Eos.to_string(), "eos");
        assert_eq!(StopReason::Aborted.to_string(), "aborted");
    }
}
