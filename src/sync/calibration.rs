//! Auto-calibration engine
//!
//! A run measures one endpoint's output latency:
//!
//! 1. `Probing`: a probe request is armed. The send lane replaces the next
//!    frame going to that endpoint's address with a tone and reports the
//!    sequence number it used.
//! 2. `Measuring`: the endpoint's playout lane reports when it handed the
//!    probe to its render collaborator and the instant the render says the
//!    audio actually left. Each pair is one [`CalibrationSample`].
//! 3. The median of the measured latencies, clamped to the configured range,
//!    becomes the endpoint's output latency (`Calibrated`), or the run fails
//!    and the previous value stays (`Failed`). The session turns latencies
//!    into delay compensation by holding faster endpoints back.
//!
//! Only one run is in flight per session, so probes can never overlap.

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::CalibrationConfig;
use crate::endpoints::EndpointId;
use crate::error::CalibrationError;

/// Engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CalibrationPhase {
    Idle,
    Probing,
    Measuring,
    Calibrated,
    Failed,
}

/// One probe measurement
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSample {
    pub endpoint_id: EndpointId,
    pub probe_id: u32,
    /// Session ns at which the probe was handed to the render collaborator.
    /// Injection happens earlier, on the send lane; transport and buffering
    /// time are already covered by the playout schedule.
    pub handed_timestamp: u64,
    /// Session ns at which the render reports the probe left the device
    pub observed_playout_timestamp: u64,
}

impl CalibrationSample {
    /// Render output latency: hand-off to audible
    pub fn measured_latency(&self) -> i64 {
        self.observed_playout_timestamp as i64 - self.handed_timestamp as i64
    }
}

/// Robust delay estimate from a sample set, in nanoseconds
pub fn estimate_delay(
    samples: &[CalibrationSample],
    config: &CalibrationConfig,
) -> Result<i64, CalibrationError> {
    if samples.len() < config.min_quorum {
        return Err(CalibrationError::InsufficientSamples {
            got: samples.len(),
            needed: config.min_quorum,
        });
    }

    let mut latencies: Vec<i64> = samples.iter().map(|s| s.measured_latency()).collect();
    latencies.sort_unstable();

    let spread = latencies[latencies.len() - 1] - latencies[0];
    if spread > config.max_spread_ms as i64 * 1_000_000 {
        return Err(CalibrationError::TooNoisy {
            spread_ms: spread as f64 / 1e6,
        });
    }

    let mid = latencies.len() / 2;
    let median = if latencies.len() % 2 == 0 {
        (latencies[mid - 1] + latencies[mid]) / 2
    } else {
        latencies[mid]
    };

    let min = config.min_delay_ms as i64 * 1_000_000;
    let max = config.max_delay_ms as i64 * 1_000_000;
    Ok(median.clamp(min, max))
}

/// Probe waiting for the send lane
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub endpoint_id: EndpointId,
    pub destination: SocketAddr,
    pub probe_id: u32,
}

/// Single-slot handoff between the calibrator and the send lane
#[derive(Debug, Default)]
pub struct ProbeSlot {
    armed: Mutex<Option<ProbeRequest>>,
}

impl ProbeSlot {
    pub fn arm(&self, request: ProbeRequest) {
        *self.armed.lock() = Some(request);
    }

    pub fn take(&self) -> Option<ProbeRequest> {
        self.armed.lock().take()
    }

    pub fn disarm(&self) {
        self.armed.lock().take();
    }
}

/// Reported by the send lane once a probe is on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeEmission {
    pub probe_id: u32,
    pub sequence: u32,
    /// Send timestamp of the probe packet
    pub emitted_ns: u64,
}

/// Reported by a playout lane (or an acoustic detector) for a probe packet
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeObservation {
    pub endpoint_id: EndpointId,
    pub sequence: u32,
    pub handed_ns: u64,
    /// `None` when the render cannot tell when audio leaves the device
    pub observed_ns: Option<u64>,
}

struct RunState {
    endpoint_id: EndpointId,
    phase: CalibrationPhase,
}

/// Session-wide calibration engine
pub struct Calibrator {
    config: CalibrationConfig,
    run: Mutex<Option<RunState>>,
    last: Mutex<Option<(EndpointId, CalibrationPhase)>>,
    slot: ProbeSlot,
    emission_tx: Sender<ProbeEmission>,
    emission_rx: Receiver<ProbeEmission>,
    observation_tx: Sender<ProbeObservation>,
    observation_rx: Receiver<ProbeObservation>,
    cancel_tx: Sender<EndpointId>,
    cancel_rx: Receiver<EndpointId>,
}

/// Releases the in-flight slot however the run ends
struct RunGuard<'a> {
    calibrator: &'a Calibrator,
    outcome: CalibrationPhase,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.calibrator.slot.disarm();
        if let Some(run) = self.calibrator.run.lock().take() {
            *self.calibrator.last.lock() = Some((run.endpoint_id, self.outcome));
        }
    }
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        let (emission_tx, emission_rx) = unbounded();
        let (observation_tx, observation_rx) = unbounded();
        let (cancel_tx, cancel_rx) = bounded(4);
        Self {
            config,
            run: Mutex::new(None),
            last: Mutex::new(None),
            slot: ProbeSlot::default(),
            emission_tx,
            emission_rx,
            observation_tx,
            observation_rx,
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn slot(&self) -> &ProbeSlot {
        &self.slot
    }

    /// Channel for the send lane
    pub fn emission_sender(&self) -> Sender<ProbeEmission> {
        self.emission_tx.clone()
    }

    /// Channel for playout lanes and external detectors
    pub fn observation_sender(&self) -> Sender<ProbeObservation> {
        self.observation_tx.clone()
    }

    /// Feed an observation from outside the playout path, e.g. a microphone
    /// detector built on [`detect_onset`]
    pub fn report(&self, observation: ProbeObservation) {
        let _ = self.observation_tx.send(observation);
    }

    /// Endpoint being calibrated and its phase, if a run is in flight
    pub fn current(&self) -> Option<(EndpointId, CalibrationPhase)> {
        self.run
            .lock()
            .as_ref()
            .map(|run| (run.endpoint_id.clone(), run.phase))
    }

    /// Phase of `endpoint_id`: its live run, the outcome of its last run, or Idle
    pub fn phase(&self, endpoint_id: &EndpointId) -> CalibrationPhase {
        if let Some((id, phase)) = self.current() {
            if &id == endpoint_id {
                return phase;
            }
        }
        match &*self.last.lock() {
            Some((id, phase)) if id == endpoint_id => *phase,
            _ => CalibrationPhase::Idle,
        }
    }

    /// Abort the run for `endpoint_id`, if it is the one in flight
    pub fn cancel(&self, endpoint_id: &EndpointId) {
        let running = matches!(&*self.run.lock(), Some(run) if &run.endpoint_id == endpoint_id);
        if running {
            let _ = self.cancel_tx.try_send(endpoint_id.clone());
        }
    }

    /// Abort whatever run is in flight
    pub fn cancel_all(&self) {
        if let Some((id, _)) = self.current() {
            let _ = self.cancel_tx.try_send(id);
        }
    }

    fn set_phase(&self, phase: CalibrationPhase) {
        if let Some(run) = self.run.lock().as_mut() {
            run.phase = phase;
        }
    }

    /// Run a full calibration against the endpoint reachable at
    /// `destination`. Blocks the calling thread for the duration of the run
    /// and returns the measured output latency in nanoseconds.
    pub fn run(&self, endpoint_id: &EndpointId, destination: SocketAddr) -> Result<i64, CalibrationError> {
        {
            let mut run = self.run.lock();
            if run.is_some() {
                return Err(CalibrationError::Busy);
            }
            // Leftovers from an earlier run must not be attributed to this one
            while self.emission_rx.try_recv().is_ok() {}
            while self.observation_rx.try_recv().is_ok() {}
            while self.cancel_rx.try_recv().is_ok() {}

            *run = Some(RunState {
                endpoint_id: endpoint_id.clone(),
                phase: CalibrationPhase::Probing,
            });
        }
        let mut guard = RunGuard {
            calibrator: self,
            outcome: CalibrationPhase::Failed,
        };

        tracing::info!("Calibrating {} ({} probes)", endpoint_id, self.config.probe_count);

        let mut samples = Vec::with_capacity(self.config.probe_count);
        for probe_id in 0..self.config.probe_count as u32 {
            self.set_phase(CalibrationPhase::Probing);
            self.slot.arm(ProbeRequest {
                endpoint_id: endpoint_id.clone(),
                destination,
                probe_id,
            });

            let deadline = Instant::now() + self.config.probe_timeout();
            let Some(emission) = self.wait_emission(endpoint_id, probe_id, deadline)? else {
                self.slot.disarm();
                tracing::debug!("Probe {} for {} was never sent", probe_id, endpoint_id);
                continue;
            };

            self.set_phase(CalibrationPhase::Measuring);
            match self.wait_observation(endpoint_id, emission.sequence, deadline)? {
                Some(observation) => {
                    let observed = observation.observed_ns.ok_or(CalibrationError::NoFeedback)?;
                    let sample = CalibrationSample {
                        endpoint_id: endpoint_id.clone(),
                        probe_id,
                        handed_timestamp: observation.handed_ns,
                        observed_playout_timestamp: observed,
                    };
                    tracing::debug!(
                        "Probe {} on {}: {:.1} ms output latency, handed {:.1} ms after injection",
                        probe_id,
                        endpoint_id,
                        sample.measured_latency() as f64 / 1e6,
                        (observation.handed_ns as i64 - emission.emitted_ns as i64) as f64 / 1e6
                    );
                    samples.push(sample);
                }
                None => tracing::debug!("Probe {} on {} timed out", probe_id, endpoint_id),
            }

            self.pause(endpoint_id, self.config.probe_interval())?;
        }

        let delay = estimate_delay(&samples, &self.config)?;
        guard.outcome = CalibrationPhase::Calibrated;
        tracing::info!(
            "Calibrated {}: {:.1} ms from {} samples",
            endpoint_id,
            delay as f64 / 1e6,
            samples.len()
        );
        Ok(delay)
    }

    fn check_cancel(&self, endpoint_id: &EndpointId, cancelled: EndpointId) -> Result<(), CalibrationError> {
        if &cancelled == endpoint_id {
            tracing::info!("Calibration of {} cancelled", endpoint_id);
            Err(CalibrationError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn wait_emission(
        &self,
        endpoint_id: &EndpointId,
        probe_id: u32,
        deadline: Instant,
    ) -> Result<Option<ProbeEmission>, CalibrationError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(self.emission_rx) -> msg => match msg {
                    Ok(emission) if emission.probe_id == probe_id => return Ok(Some(emission)),
                    Ok(_) => {}
                    Err(_) => return Ok(None),
                },
                recv(self.cancel_rx) -> msg => {
                    if let Ok(id) = msg {
                        self.check_cancel(endpoint_id, id)?;
                    }
                },
                default(remaining) => return Ok(None),
            }
        }
    }

    fn wait_observation(
        &self,
        endpoint_id: &EndpointId,
        sequence: u32,
        deadline: Instant,
    ) -> Result<Option<ProbeObservation>, CalibrationError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(self.observation_rx) -> msg => match msg {
                    Ok(obs) if &obs.endpoint_id == endpoint_id && obs.sequence == sequence => {
                        return Ok(Some(obs));
                    }
                    Ok(_) => {}
                    Err(_) => return Ok(None),
                },
                recv(self.cancel_rx) -> msg => {
                    if let Ok(id) = msg {
                        self.check_cancel(endpoint_id, id)?;
                    }
                },
                default(remaining) => return Ok(None),
            }
        }
    }

    /// Interruptible sleep between probes
    fn pause(&self, endpoint_id: &EndpointId, duration: Duration) -> Result<(), CalibrationError> {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match self.cancel_rx.recv_timeout(remaining) {
                Ok(id) => self.check_cancel(endpoint_id, id)?,
                Err(_) => return Ok(()),
            }
        }
    }
}

/// Cross-correlate `reference` against `recording` for non-negative lags.
/// Returns the best lag in samples and its normalized correlation (0..=1).
pub fn correlate(reference: &[f32], recording: &[f32]) -> Option<(usize, f32)> {
    if reference.is_empty() || recording.len() < reference.len() {
        return None;
    }
    let ref_energy: f32 = reference.iter().map(|s| s * s).sum();
    if ref_energy <= f32::EPSILON {
        return None;
    }

    let mut best: Option<(usize, f32)> = None;
    for lag in 0..=recording.len() - reference.len() {
        let window = &recording[lag..lag + reference.len()];
        let dot: f32 = reference.iter().zip(window).map(|(a, b)| a * b).sum();
        let win_energy: f32 = window.iter().map(|s| s * s).sum();
        if win_energy <= f32::EPSILON {
            continue;
        }
        let strength = dot / (ref_energy * win_energy).sqrt();
        if best.map_or(true, |(_, s)| strength > s) {
            best = Some((lag, strength));
        }
    }
    best.map(|(lag, s)| (lag, s.clamp(0.0, 1.0)))
}

/// Locate a probe tone in a mono recording. Returns the offset from the
/// start of the recording and the correlation strength.
pub fn detect_onset(reference: &[f32], recording: &[f32], sample_rate: u32) -> Option<(Duration, f32)> {
    let (lag, strength) = correlate(reference, recording)?;
    let offset = Duration::from_nanos(lag as u64 * 1_000_000_000 / sample_rate.max(1) as u64);
    Some((offset, strength))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm;
    use std::sync::Arc;

    const MS: u64 = 1_000_000;

    fn sample(probe_id: u32, latency_ms: u64) -> CalibrationSample {
        CalibrationSample {
            endpoint_id: EndpointId::new("bt"),
            probe_id,
            handed_timestamp: 1_000 * MS,
            observed_playout_timestamp: 1_000 * MS + latency_ms * MS,
        }
    }

    fn fast_config() -> CalibrationConfig {
        CalibrationConfig {
            probe_timeout_ms: 200,
            probe_interval_ms: 5,
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn test_median_rejects_outlier() {
        let samples: Vec<_> = [48, 50, 49, 51, 200]
            .iter()
            .enumerate()
            .map(|(i, &ms)| sample(i as u32, ms))
            .collect();
        let delay = estimate_delay(&samples, &CalibrationConfig::default()).unwrap();
        assert_eq!(delay, 50 * MS as i64);
    }

    #[test]
    fn test_even_sample_count_averages_middle() {
        let samples: Vec<_> = [40, 50, 60, 70].iter().map(|&ms| sample(0, ms)).collect();
        let delay = estimate_delay(&samples, &CalibrationConfig::default()).unwrap();
        assert_eq!(delay, 55 * MS as i64);
    }

    #[test]
    fn test_quorum_and_spread() {
        let config = CalibrationConfig::default();
        assert_eq!(
            estimate_delay(&[sample(0, 50), sample(1, 50)], &config),
            Err(CalibrationError::InsufficientSamples { got: 2, needed: 3 })
        );

        let noisy = [sample(0, 10), sample(1, 50), sample(2, 900)];
        assert!(matches!(
            estimate_delay(&noisy, &config),
            Err(CalibrationError::TooNoisy { .. })
        ));
    }

    #[test]
    fn test_estimate_clamped() {
        let config = CalibrationConfig {
            max_delay_ms: 100,
            ..CalibrationConfig::default()
        };
        let samples = [sample(0, 150), sample(1, 160), sample(2, 170)];
        assert_eq!(estimate_delay(&samples, &config), Ok(100 * MS as i64));
    }

    /// Plays the send lane and the playout lane for a calibrator under test
    fn fake_lanes(calibrator: Arc<Calibrator>, latency_ms: Option<u64>) -> std::thread::JoinHandle<()> {
        let emissions = calibrator.emission_sender();
        let observations = calibrator.observation_sender();
        std::thread::spawn(move || {
            let start = Instant::now();
            let mut sequence = 0u32;
            while start.elapsed() < Duration::from_secs(3) {
                if let Some(request) = calibrator.slot().take() {
                    sequence += 1;
                    let _ = emissions.send(ProbeEmission {
                        probe_id: request.probe_id,
                        sequence,
                        emitted_ns: 0,
                    });
                    let _ = observations.send(ProbeObservation {
                        endpoint_id: request.endpoint_id,
                        sequence,
                        handed_ns: 500 * MS,
                        observed_ns: latency_ms.map(|ms| 500 * MS + ms * MS),
                    });
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    }

    #[test]
    fn test_run_calibrates() {
        let calibrator = Arc::new(Calibrator::new(fast_config()));
        let _lanes = fake_lanes(calibrator.clone(), Some(42));
        let id = EndpointId::new("local");

        let delay = calibrator.run(&id, "127.0.0.1:9".parse().unwrap()).unwrap();
        assert_eq!(delay, 42 * MS as i64);
        assert_eq!(calibrator.phase(&id), CalibrationPhase::Calibrated);
        assert!(calibrator.current().is_none());
    }

    #[test]
    fn test_run_without_feedback_fails() {
        let calibrator = Arc::new(Calibrator::new(fast_config()));
        let _lanes = fake_lanes(calibrator.clone(), None);
        let id = EndpointId::new("local");

        assert_eq!(
            calibrator.run(&id, "127.0.0.1:9".parse().unwrap()),
            Err(CalibrationError::NoFeedback)
        );
        assert_eq!(calibrator.phase(&id), CalibrationPhase::Failed);
    }

    #[test]
    fn test_run_without_send_lane_fails_quorum() {
        let calibrator = Calibrator::new(CalibrationConfig {
            probe_count: 3,
            probe_timeout_ms: 20,
            probe_interval_ms: 1,
            ..CalibrationConfig::default()
        });
        let result = calibrator.run(&EndpointId::new("x"), "127.0.0.1:9".parse().unwrap());
        assert_eq!(
            result,
            Err(CalibrationError::InsufficientSamples { got: 0, needed: 3 })
        );
    }

    #[test]
    fn test_one_run_at_a_time_and_cancel() {
        let calibrator = Arc::new(Calibrator::new(CalibrationConfig {
            probe_timeout_ms: 5_000,
            ..CalibrationConfig::default()
        }));
        let id = EndpointId::new("a");

        let runner = {
            let calibrator = calibrator.clone();
            let id = id.clone();
            std::thread::spawn(move || calibrator.run(&id, "127.0.0.1:9".parse().unwrap()))
        };
        while calibrator.current().is_none() {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(
            calibrator.run(&EndpointId::new("b"), "127.0.0.1:9".parse().unwrap()),
            Err(CalibrationError::Busy)
        );

        calibrator.cancel(&id);
        assert_eq!(runner.join().unwrap(), Err(CalibrationError::Cancelled));
        assert!(calibrator.slot().take().is_none());
    }

    #[test]
    fn test_detect_onset_finds_tone() {
        let tone = pcm::tone(48000, 480, 1000.0, 0.5);
        let mut recording = vec![0.0f32; 4800];
        let offset = 1234;
        for (i, s) in tone.iter().enumerate() {
            recording[offset + i] += s * 0.8;
        }

        let (at, strength) = detect_onset(&tone, &recording, 48000).unwrap();
        assert_eq!(at, Duration::from_nanos(1234 * 1_000_000_000 / 48000));
        assert!(strength > 0.99);
    }
}
