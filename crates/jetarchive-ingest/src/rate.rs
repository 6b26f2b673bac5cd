//! Throughput monitor.
//!
//! Counts kept records in one-second buckets over a sliding minute and
//! reports records/minute plus a per-day estimate. Purely observational:
//! nothing here feeds back into classification or writing.

use jetarchive_core::metrics::set_gauge;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const WINDOW_SECS: u64 = 60;

/// Sliding one-minute record counter.
#[derive(Debug)]
pub struct RateMonitor {
    unit: &'static str,
    started: Instant,
    counts: [u64; WINDOW_SECS as usize],
    seconds: [u64; WINDOW_SECS as usize],
    total: u64,
    report_every: Duration,
    last_report: Option<Instant>,
}

impl RateMonitor {
    /// `unit` names what is counted in log lines ("posts" or "records").
    pub fn new(unit: &'static str, started: Instant) -> Self {
        Self {
            unit,
            started,
            counts: [0; WINDOW_SECS as usize],
            seconds: [u64::MAX; WINDOW_SECS as usize],
            total: 0,
            report_every: Duration::from_secs(10),
            last_report: None,
        }
    }

    /// How often [`RateMonitor::maybe_report`] logs.
    pub fn report_interval(&self) -> Duration {
        self.report_every
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started).as_secs()
    }

    /// Count `n` records arriving at `now`.
    pub fn record(&mut self, n: u64, now: Instant) {
        let second = self.second(now);
        let idx = (second % WINDOW_SECS) as usize;
        if self.seconds[idx] != second {
            self.seconds[idx] = second;
            self.counts[idx] = 0;
        }
        self.counts[idx] += n;
        self.total += n;
    }

    /// Records per minute over the last minute (or since start, if younger).
    pub fn rate_per_minute(&self, now: Instant) -> f64 {
        let current = self.second(now);
        let in_window: u64 = self
            .seconds
            .iter()
            .zip(self.counts.iter())
            .filter(|(second, _)| **second <= current && current - **second < WINDOW_SECS)
            .map(|(_, count)| *count)
            .sum();

        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let window = elapsed.clamp(1.0, WINDOW_SECS as f64);
        in_window as f64 * 60.0 / window
    }

    /// Records counted since start.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Log the current rate if the report interval has passed.
    pub fn maybe_report(&mut self, now: Instant) -> Option<f64> {
        if let Some(last) = self.last_report
            && now.saturating_duration_since(last) < self.report_every
        {
            return None;
        }
        self.last_report = Some(now);

        let rate = self.rate_per_minute(now);
        set_gauge("archive_records_per_minute", rate);
        info!(
            "Current rate: {:.1} {}/minute (est. {} {}/day)",
            rate,
            self.unit,
            per_day(rate),
            self.unit
        );
        Some(rate)
    }

    /// Average rate over the whole run.
    pub fn average_per_minute(&self, now: Instant) -> f64 {
        let minutes = now.saturating_duration_since(self.started).as_secs_f64() / 60.0;
        if minutes > 0.0 {
            self.total as f64 / minutes
        } else {
            0.0
        }
    }

    /// Shutdown summary. Warns when fewer records were saved than collected.
    pub fn final_report(&self, saved: u64, now: Instant) {
        let rate = self.average_per_minute(now);
        info!("Final rate: {:.1} {}/minute", rate, self.unit);
        info!("Estimated daily volume: {} {}/day", per_day(rate), self.unit);
        info!(
            "Total {} collected: {}, saved: {}",
            self.unit, self.total, saved
        );
        if saved != self.total {
            warn!(
                collected = self.total,
                saved,
                "Discrepancy between collected and saved {}",
                self.unit
            );
        }
    }
}

fn per_day(rate_per_minute: f64) -> u64 {
    (rate_per_minute * 60.0 * 24.0) as u64
}
