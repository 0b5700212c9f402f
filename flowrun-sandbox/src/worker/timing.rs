//! Per-phase wall-clock timings for one worker run

use std::time::{Duration, Instant};

/// Timestamps for the phases of a run, passed explicitly through the worker.
#[derive(Debug, Clone)]
pub struct PhaseTimer {
    started: Instant,
    last: Instant,
    phases: Vec<(&'static str, Duration)>,
}

impl PhaseTimer {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            phases: Vec::new(),
        }
    }

    /// Close the current phase under `name` and start the next one.
    pub fn mark(&mut self, name: &'static str) -> Duration {
        let now = Instant::now();
        let spent = now.duration_since(self.last);
        self.last = now;
        self.phases.push((name, spent));
        spent
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whole milliseconds since start, never reported as zero.
    pub fn elapsed_ms(&self) -> u64 {
        (self.elapsed().as_millis() as u64).max(1)
    }

    pub fn phases(&self) -> &[(&'static str, Duration)] {
        &self.phases
    }

    pub fn log(&self) {
        for (name, spent) in &self.phases {
            tracing::debug!(phase = name, elapsed_us = spent.as_micros() as u64, "Worker phase");
        }
        tracing::debug!(total_ms = self.elapsed_ms(), "Worker run finished");
    }
}
