//! Playout clock and drift corrector
//!
//! Target playout instant of a packet, in local session time:
//!
//! ```text
//! due = send_timestamp + offset + nominal_delay + delay_compensation + correction
//! ```
//!
//! `offset` maps the sender's clock onto the local one. Endpoints sharing the
//! sender's session clock use zero; remote receivers use the baseline, the
//! floor of `arrival - send` over the first packets. The corrector then
//! watches that floor over successive windows. When it moves away from the
//! baseline by more than the threshold (the two clocks run at different
//! rates) `correction` is slewed toward it at a bounded rate, never stepped.

use crate::config::PlayoutConfig;

/// Maps a send timestamp to its local playout instant (session ns)
pub trait Schedule {
    fn due_at(&self, send_timestamp: u64) -> i64;
}

impl<F: Fn(u64) -> i64> Schedule for F {
    fn due_at(&self, send_timestamp: u64) -> i64 {
        self(send_timestamp)
    }
}

/// Arrival samples used to fix the initial offset
const BASELINE_SAMPLES: usize = 16;

/// Arrival samples per drift measurement window
const DRIFT_WINDOW: usize = 100;

/// Smoothing applied to successive window floors
const DRIFT_ALPHA: f64 = 0.25;

/// How a released packet relates to its target instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    OnTime,
    /// Target passed by more than one packet duration; played immediately
    Late,
}

pub struct PlayoutClock {
    shared_epoch: bool,
    nominal_ns: i64,
    delay_ns: i64,
    max_delay_ns: i64,
    offset_ns: Option<i64>,
    baseline_ns: Option<i64>,
    baseline_seen: usize,
    window_min: Option<i64>,
    window_seen: usize,
    drift_ns: f64,
    target_correction_ns: f64,
    correction_ns: f64,
    threshold_ns: f64,
    slew_ns_per_sec: f64,
    last_advance: Option<u64>,
    drift_recoveries: u64,
}

impl PlayoutClock {
    /// Clock for an endpoint whose local session clock is the sender's
    pub fn shared(config: &PlayoutConfig) -> Self {
        let mut clock = Self::remote(config);
        clock.shared_epoch = true;
        clock.offset_ns = Some(0);
        clock
    }

    /// Clock for an endpoint that must learn the sender's epoch
    pub fn remote(config: &PlayoutConfig) -> Self {
        Self {
            shared_epoch: false,
            nominal_ns: config.nominal_delay().as_nanos() as i64,
            delay_ns: 0,
            max_delay_ns: (config.max_delay_ms as i64).saturating_mul(1_000_000),
            offset_ns: None,
            baseline_ns: None,
            baseline_seen: 0,
            window_min: None,
            window_seen: 0,
            drift_ns: 0.0,
            target_correction_ns: 0.0,
            correction_ns: 0.0,
            threshold_ns: config.drift_threshold_us as f64 * 1_000.0,
            slew_ns_per_sec: config.slew_us_per_sec as f64 * 1_000.0,
            last_advance: None,
            drift_recoveries: 0,
        }
    }

    /// Forget the learned offset and corrections (new stream)
    pub fn reset(&mut self) {
        self.offset_ns = if self.shared_epoch { Some(0) } else { None };
        self.baseline_ns = None;
        self.baseline_seen = 0;
        self.window_min = None;
        self.window_seen = 0;
        self.drift_ns = 0.0;
        self.target_correction_ns = 0.0;
        self.correction_ns = 0.0;
        self.last_advance = None;
    }

    /// Delay compensation, clamped to `±max_delay_ms`
    pub fn set_delay(&mut self, delay_ns: i64) {
        self.delay_ns = delay_ns.clamp(-self.max_delay_ns, self.max_delay_ns);
    }

    pub fn delay_ns(&self) -> i64 {
        self.delay_ns
    }

    /// Measured drift of the sender clock relative to the baseline
    pub fn drift_ns(&self) -> i64 {
        self.drift_ns as i64
    }

    /// Correction currently applied to target instants
    pub fn correction_ns(&self) -> i64 {
        self.correction_ns as i64
    }

    pub fn drift_recoveries(&self) -> u64 {
        self.drift_recoveries
    }

    /// Feed one accepted packet's send timestamp and local arrival time
    pub fn observe(&mut self, send_ns: u64, arrival_ns: u64) {
        let transit = arrival_ns as i64 - send_ns as i64;

        if self.baseline_seen < BASELINE_SAMPLES {
            self.baseline_seen += 1;
            self.baseline_ns = Some(self.baseline_ns.map_or(transit, |b| b.min(transit)));
            if !self.shared_epoch {
                self.offset_ns = self.baseline_ns;
            }
            return;
        }

        self.window_min = Some(self.window_min.map_or(transit, |m| m.min(transit)));
        self.window_seen += 1;
        if self.window_seen < DRIFT_WINDOW {
            return;
        }

        let floor = self.window_min.take().unwrap_or(transit);
        self.window_seen = 0;
        let measured = (floor - self.baseline_ns.unwrap_or(floor)) as f64;
        self.drift_ns += DRIFT_ALPHA * (measured - self.drift_ns);

        if (self.drift_ns - self.target_correction_ns).abs() > self.threshold_ns {
            tracing::debug!(
                "Drift {:.2} ms exceeds threshold, slewing correction",
                self.drift_ns / 1e6
            );
            self.target_correction_ns = self.drift_ns;
        }
    }

    /// Move the applied correction toward its target, bounded by the slew rate
    pub fn advance(&mut self, now_ns: u64) {
        let elapsed = match self.last_advance {
            Some(last) => now_ns.saturating_sub(last) as f64 / 1e9,
            None => 0.0,
        };
        self.last_advance = Some(now_ns);

        let step = self.slew_ns_per_sec * elapsed;
        let remaining = self.target_correction_ns - self.correction_ns;
        self.correction_ns += remaining.clamp(-step, step);
    }

    /// Decide whether a just-released packet is on time. Late packets are
    /// still rendered immediately and counted as drift recoveries.
    pub fn classify(&mut self, now_ns: u64, send_ns: u64, packet_ns: u64) -> Release {
        let lateness = (now_ns as i64).saturating_sub(self.due_at(send_ns));
        if lateness > packet_ns as i64 {
            self.drift_recoveries += 1;
            tracing::trace!("Packet {:.1} ms past its target", lateness as f64 / 1e6);
            Release::Late
        } else {
            Release::OnTime
        }
    }
}

impl Schedule for PlayoutClock {
    fn due_at(&self, send_timestamp: u64) -> i64 {
        (send_timestamp.min(i64::MAX as u64) as i64)
            .saturating_add(self.offset_ns.unwrap_or(0))
            .saturating_add(self.nominal_ns)
            .saturating_add(self.delay_ns)
            .saturating_add(self.correction_ns as i64)
    }
}
