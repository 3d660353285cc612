//! Read pacing.
//!
//! Two per-mille rates throttle how fast the ingest loop consumes stdin: a
//! fill rate while the ring still has empty slots, then the steady rate.
//! Switching rebases the clock so the new rate applies from "now" instead
//! of replaying the whole backlog.

use std::time::Instant;

/// Sleep quantum while over budget.
pub const PACE_SLEEP_MSEC: u64 = 10;

/// Two-rate ingest pacer.
pub struct ReadPacer {
    base: Instant,
    entire_duration_msec: u64,
    rate_permille: u32,
    steady_rate_permille: u32,
}

impl ReadPacer {
    /// Create a pacer starting at the fill rate.
    pub fn new(fill_rate_permille: u32, steady_rate_permille: u32) -> Self {
        Self {
            base: Instant::now(),
            entire_duration_msec: 0,
            rate_permille: fill_rate_permille,
            steady_rate_permille,
        }
    }

    /// Switch from the fill rate to the steady rate once the ring is full,
    /// rebasing the elapsed-time accounting.
    pub fn maybe_switch(&mut self, ring_filled: bool) {
        if self.rate_permille != self.steady_rate_permille && ring_filled {
            self.rate_permille = self.steady_rate_permille;
            self.base = Instant::now();
            self.entire_duration_msec = 0;
        }
    }

    /// Account a completed segment's duration.
    pub fn on_segment(&mut self, duration_msec: u32) {
        self.entire_duration_msec += duration_msec as u64;
    }

    /// Whether ingest is ahead of the configured rate and should sleep.
    ///
    /// `pending_msec` is the presentation time accumulated since the last
    /// segment cut.
    pub fn over_budget(&self, pending_msec: u64) -> bool {
        if self.rate_permille == 0 {
            return false;
        }
        let elapsed_msec = self.base.elapsed().as_millis() as u64;
        self.entire_duration_msec + pending_msec > elapsed_msec * self.rate_permille as u64 / 1000
    }
}
