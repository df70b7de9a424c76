//! Broadcast session manager
//!
//! Owns the endpoint set and the session lifecycle. `start` spawns the send
//! lane (capture -> packetize -> fan-out); local endpoints get their own
//! receive and playout lanes over a loopback socket as soon as they are
//! added. `stop` may be called from any thread, including the send lane
//! after a capture fault.

use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

use crate::audio::buffer::AudioFrame;
use crate::audio::pcm;
use crate::audio::source::FrameSource;
use crate::clock::SessionClock;
use crate::config::AppConfig;
use crate::error::{CalibrationError, CaptureError, EndpointError, Result, SessionError};
use crate::network::receiver::UdpReceiver;
use crate::network::sender::{FanoutSender, SenderStats};
use crate::protocol::{ControlMessage, PacketKind, StreamFormat};
use crate::sync::calibration::{CalibrationPhase, Calibrator, ProbeEmission, ProbeRequest};
use crate::sync::packetizer::Packetizer;

use super::discovery::Discovery;
use super::endpoint::{
    CalibrationStatus, EndpointAddress, EndpointId, EndpointSnapshot, EndpointState,
    EndpointTarget,
};
use super::lane::{EndpointLanes, LaneContext};

struct Endpoint {
    state: Arc<EndpointState>,
    /// Only local endpoints run lanes in this process
    lanes: Option<EndpointLanes>,
}

struct SessionInner {
    id: Uuid,
    config: AppConfig,
    clock: SessionClock,
    sender: FanoutSender,
    calibrator: Calibrator,
    endpoints: DashMap<EndpointId, Endpoint>,
    destinations: RwLock<Vec<SocketAddr>>,
    running: AtomicBool,
    stream_id: AtomicU32,
    frames_sent: AtomicU64,
    format: Mutex<Option<StreamFormat>>,
    fatal: Mutex<Option<CaptureError>>,
    source: Mutex<Option<FrameSource>>,
    send_lane: Mutex<Option<JoinHandle<FrameSource>>>,
    send_shutdown: Mutex<Option<Sender<()>>>,
    /// Serializes start and teardown
    lifecycle: Mutex<()>,
    /// Serializes alignment updates
    alignment: Mutex<()>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub taken_at: DateTime<Utc>,
    pub running: bool,
    pub stream_id: Option<u16>,
    pub format: Option<String>,
    pub frames_sent: u64,
    pub fatal: Option<String>,
    pub calibrating: Option<(EndpointId, CalibrationPhase)>,
    pub transport: SenderStats,
    pub endpoints: Vec<EndpointSnapshot>,
}

/// One live stream broadcast to many endpoints
pub struct BroadcastSession {
    inner: Arc<SessionInner>,
}

impl BroadcastSession {
    /// Create a session pulling frames from `source`. The source must use
    /// `clock`, which becomes the session epoch.
    pub fn new(config: AppConfig, clock: SessionClock, source: FrameSource) -> Result<Self> {
        config.validate()?;
        let sender = FanoutSender::new(&config.network)?;
        let calibrator = Calibrator::new(config.calibration.clone());
        let id = Uuid::new_v4();
        tracing::info!("Session {} created", id);

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                config,
                clock,
                sender,
                calibrator,
                endpoints: DashMap::new(),
                destinations: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
                stream_id: AtomicU32::new(0),
                frames_sent: AtomicU64::new(0),
                format: Mutex::new(None),
                fatal: Mutex::new(None),
                source: Mutex::new(Some(source)),
                send_lane: Mutex::new(None),
                send_shutdown: Mutex::new(None),
                lifecycle: Mutex::new(()),
                alignment: Mutex::new(()),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn clock(&self) -> SessionClock {
        self.inner.clock
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Capture fault that ended the last run, if any
    pub fn fatal_error(&self) -> Option<CaptureError> {
        self.inner.fatal.lock().clone()
    }

    /// Start capturing and fanning out. Capture is opened synchronously so
    /// an unavailable device is reported here.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock();
        if inner.running.load(Ordering::SeqCst) {
            return Err(SessionError::AlreadyRunning.into());
        }
        inner.reclaim_send_lane();

        let mut source = inner.source.lock().take().ok_or_else(|| {
            SessionError::Fatal(CaptureError::Unavailable("capture source lost".into()))
        })?;
        let first = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                source.close();
                *inner.source.lock() = Some(source);
                return Err(SessionError::Fatal(e).into());
            }
        };

        let packetizer = Packetizer::with_random_stream_id(inner.config.network.max_payload);
        let stream_id = packetizer.stream_id();
        inner.stream_id.store(stream_id as u32, Ordering::SeqCst);
        *inner.fatal.lock() = None;
        *inner.format.lock() = Some(first.format);

        for entry in inner.endpoints.iter() {
            inner.greet(&entry.state, stream_id);
        }

        let (shutdown_tx, shutdown_rx) = bounded(1);
        *inner.send_shutdown.lock() = Some(shutdown_tx);
        inner.running.store(true, Ordering::SeqCst);

        let lane = inner.clone();
        let spawned = thread::Builder::new()
            .name("send-lane".into())
            .spawn(move || lane.run_send_lane(source, packetizer, first, shutdown_rx));
        match spawned {
            Ok(handle) => {
                *inner.send_lane.lock() = Some(handle);
                tracing::info!("Session {} started (stream {:#06x})", inner.id, stream_id);
                Ok(())
            }
            Err(e) => {
                inner.running.store(false, Ordering::SeqCst);
                inner.send_shutdown.lock().take();
                Err(e.into())
            }
        }
    }

    /// Stop the session: signal and join every lane, destroy all endpoints
    /// and release the capture device. Safe to call repeatedly and from any
    /// thread.
    pub fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        self.inner.teardown();
    }

    /// Add an endpoint. Local endpoints start their lanes immediately;
    /// remote ones receive from the next packet on.
    pub fn add_endpoint(&self, id: EndpointId, target: EndpointTarget) -> Result<()> {
        let inner = &self.inner;
        if inner.endpoints.contains_key(&id) {
            return Err(EndpointError::AlreadyExists(id).into());
        }

        let endpoint = match target {
            EndpointTarget::Remote(addr) => {
                let state = Arc::new(EndpointState::new(
                    id.clone(),
                    EndpointAddress::Remote(addr),
                    addr,
                    &inner.config.jitter,
                ));
                Endpoint { state, lanes: None }
            }
            EndpointTarget::Local { device, render } => {
                let (shutdown_tx, shutdown_rx) = bounded(1);
                let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
                let receiver =
                    UdpReceiver::bind(loopback, &inner.config.network, shutdown_rx.clone())?;
                let destination = receiver.local_addr()?;
                let state = Arc::new(EndpointState::new(
                    id.clone(),
                    EndpointAddress::Local(device.clone()),
                    destination,
                    &inner.config.jitter,
                ));
                let ctx = LaneContext {
                    clock: inner.clock,
                    playout: inner.config.playout.clone(),
                    shared_epoch: true,
                    accept_control: false,
                    observations: Some(inner.calibrator.observation_sender()),
                };
                let lanes = EndpointLanes::spawn(
                    state.clone(),
                    receiver,
                    shutdown_tx,
                    shutdown_rx,
                    render,
                    device,
                    ctx,
                )?;
                Endpoint {
                    state,
                    lanes: Some(lanes),
                }
            }
        };

        let state = endpoint.state.clone();
        match inner.endpoints.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EndpointError::AlreadyExists(id).into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(endpoint);
            }
        }
        inner.realign();
        if inner.running.load(Ordering::SeqCst) {
            inner.greet(&state, inner.current_stream());
        }
        inner.destinations.write().push(state.destination());

        tracing::info!("Endpoint {} added ({})", id, state.address());
        Ok(())
    }

    /// Remove an endpoint, cancelling its calibration and tearing down its
    /// lanes and jitter buffer
    pub fn remove_endpoint(&self, id: &EndpointId) -> Result<()> {
        let inner = &self.inner;
        let (_, mut endpoint) = inner
            .endpoints
            .remove(id)
            .ok_or_else(|| EndpointError::NotFound(id.clone()))?;

        let destination = endpoint.state.destination();
        inner.destinations.write().retain(|d| *d != destination);
        inner.calibrator.cancel(id);
        if let Some(lanes) = endpoint.lanes.as_mut() {
            lanes.stop();
        }
        if endpoint.state.is_remote() && inner.running.load(Ordering::SeqCst) {
            inner.control(
                &endpoint.state,
                &ControlMessage::Goodbye {
                    stream_id: inner.current_stream(),
                },
            );
        }
        inner.realign();

        tracing::info!("Endpoint {} removed", id);
        Ok(())
    }

    /// Set an endpoint's gain, `0.0..=1.0`
    pub fn set_volume(&self, id: &EndpointId, volume: f32) -> Result<()> {
        let state = self.inner.endpoint(id)?;
        state.set_volume(volume)?;
        if state.is_remote() {
            self.inner.control(&state, &ControlMessage::SetVolume { volume });
        }
        Ok(())
    }

    /// Set an endpoint's manual delay, on top of any calibrated alignment.
    /// Positive values play later; the magnitude is bounded by
    /// `playout.max_delay_ms`.
    pub fn set_delay(&self, id: &EndpointId, delay: TimeDelta) -> Result<()> {
        let state = self.inner.endpoint(id)?;
        let delay_ns = delay.num_nanoseconds().unwrap_or(if delay < TimeDelta::zero() {
            i64::MIN
        } else {
            i64::MAX
        });
        state.set_delay_ns(delay_ns, self.inner.config.playout.max_delay_ns())?;
        if state.is_remote() {
            self.inner.send_delay(&state);
        }
        tracing::debug!("Endpoint {} delay {:.1} ms", id, delay_ns as f64 / 1e6);
        Ok(())
    }

    /// Measure an endpoint's output latency. Every endpoint is then delayed
    /// by how much faster it is than the slowest calibrated one, so all of
    /// them become audible together. Blocks for the duration of the run;
    /// playback continues meanwhile. On failure the previous latency is
    /// kept.
    pub fn calibrate(&self, id: &EndpointId) -> Result<TimeDelta> {
        let inner = &self.inner;
        let state = inner.endpoint(id)?;
        if state.is_remote() {
            return Err(CalibrationError::NotCalibratable(id.clone()).into());
        }
        if !inner.running.load(Ordering::SeqCst) {
            return Err(SessionError::NotRunning.into());
        }

        let previous = state.calibration_status();
        state.set_calibration_status(CalibrationStatus::Calibrating);
        match inner.calibrator.run(id, state.destination()) {
            Ok(latency_ns) => {
                state.set_latency_ns(latency_ns);
                state.set_calibration_status(CalibrationStatus::Calibrated);
                inner.realign();
                Ok(TimeDelta::nanoseconds(latency_ns))
            }
            Err(CalibrationError::Busy) => {
                state.set_calibration_status(previous);
                Err(CalibrationError::Busy.into())
            }
            Err(e) => {
                tracing::warn!("Calibration of {} failed: {}", id, e);
                state.set_calibration_status(CalibrationStatus::Failed);
                Err(e.into())
            }
        }
    }

    /// Abort an in-flight calibration of `id`
    pub fn cancel_calibration(&self, id: &EndpointId) {
        self.inner.calibrator.cancel(id);
    }

    /// Hook for an acoustic detector reporting probe playouts
    pub fn calibrator(&self) -> &Calibrator {
        &self.inner.calibrator
    }

    /// Add every address a discovery collaborator offers as a remote
    /// endpoint. Already known addresses are skipped.
    pub fn add_discovered(&self, discovery: &dyn Discovery) -> Result<Vec<EndpointId>> {
        let mut added = Vec::new();
        for addr in discovery.candidates() {
            let id = EndpointId::new(addr.to_string());
            let known = self.inner.destinations.read().contains(&addr);
            if known || self.inner.endpoints.contains_key(&id) {
                continue;
            }
            self.add_endpoint(id.clone(), EndpointTarget::Remote(addr))?;
            added.push(id);
        }
        Ok(added)
    }

    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self.inner.endpoints.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn endpoint_snapshot(&self, id: &EndpointId) -> Result<EndpointSnapshot> {
        Ok(self.inner.endpoint(id)?.snapshot())
    }

    /// Eventually consistent view for presentation layers. Never blocks on
    /// audio work.
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = &self.inner;
        let running = inner.running.load(Ordering::SeqCst);
        let mut endpoints: Vec<_> = inner.endpoints.iter().map(|e| e.state.snapshot()).collect();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));

        SessionSnapshot {
            session_id: inner.id,
            taken_at: Utc::now(),
            running,
            stream_id: running.then(|| inner.current_stream()),
            format: inner.format.lock().map(|f| f.to_string()),
            frames_sent: inner.frames_sent.load(Ordering::Relaxed),
            fatal: inner.fatal.lock().as_ref().map(|e| e.to_string()),
            calibrating: inner.calibrator.current(),
            transport: inner.sender.stats(),
            endpoints,
        }
    }
}

impl Drop for BroadcastSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SessionInner {
    fn current_stream(&self) -> u16 {
        self.stream_id.load(Ordering::SeqCst) as u16
    }

    fn endpoint(&self, id: &EndpointId) -> Result<Arc<EndpointState>> {
        self.endpoints
            .get(id)
            .map(|e| e.state.clone())
            .ok_or_else(|| EndpointError::NotFound(id.clone()).into())
    }

    /// Tell an endpoint which stream to follow
    fn greet(&self, state: &EndpointState, stream_id: u16) {
        if state.is_remote() {
            self.control(
                state,
                &ControlMessage::Hello {
                    session: self.id.to_string(),
                    stream_id,
                },
            );
            if state.compensation_ns() != 0 {
                self.send_delay(state);
            }
        } else {
            state.follow_stream(Some(stream_id));
        }
    }

    /// Delay every endpoint by its latency deficit against the slowest one.
    /// Uncalibrated endpoints count as zero latency.
    fn realign(&self) {
        let _alignment = self.alignment.lock();
        let slowest = self
            .endpoints
            .iter()
            .map(|e| e.state.latency_ns())
            .max()
            .unwrap_or(0);
        let running = self.running.load(Ordering::SeqCst);

        for entry in self.endpoints.iter() {
            let state = &entry.state;
            let alignment = slowest.saturating_sub(state.latency_ns());
            if state.alignment_ns() == alignment {
                continue;
            }
            state.set_alignment_ns(alignment);
            tracing::debug!(
                "Endpoint {} aligned {:.1} ms behind its output",
                state.id(),
                alignment as f64 / 1e6
            );
            if state.is_remote() && running {
                self.send_delay(state);
            }
        }
    }

    /// Push a remote endpoint's full compensation, within what it accepts
    fn send_delay(&self, state: &EndpointState) {
        let limit = self.config.playout.max_delay_ns();
        let delay_ns = state.compensation_ns().clamp(-limit, limit);
        self.control(state, &ControlMessage::SetDelay { delay_ns });
    }

    fn control(&self, state: &EndpointState, message: &ControlMessage) {
        if let Err(e) = self.sender.send_control(message, state.destination()) {
            tracing::warn!("Control message to {} failed: {}", state.id(), e);
        }
    }

    /// Join a send lane that already exited on its own and take the capture
    /// source back
    fn reclaim_send_lane(&self) {
        let handle = self.send_lane.lock().take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(source) => *self.source.lock() = Some(source),
                Err(_) => tracing::error!("Send lane panicked"),
            }
        }
    }

    /// Must be called with the lifecycle lock held
    fn teardown(&self) {
        let was_running = self.running.load(Ordering::SeqCst);
        self.calibrator.cancel_all();
        self.calibrator.slot().disarm();
        self.send_shutdown.lock().take();

        let current = thread::current().id();
        let handle = self.send_lane.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == current {
                // The send lane is stopping the session itself; it is joined
                // by the next start
                *self.send_lane.lock() = Some(handle);
            } else {
                match handle.join() {
                    Ok(source) => *self.source.lock() = Some(source),
                    Err(_) => tracing::error!("Send lane panicked"),
                }
            }
        }

        self.destinations.write().clear();
        let ids: Vec<EndpointId> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, mut endpoint)) = self.endpoints.remove(&id) {
                if let Some(lanes) = endpoint.lanes.as_mut() {
                    lanes.stop();
                }
                if endpoint.state.is_remote() && was_running {
                    self.control(
                        &endpoint.state,
                        &ControlMessage::Goodbye {
                            stream_id: self.current_stream(),
                        },
                    );
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        if was_running {
            tracing::info!("Session {} stopped", self.id);
        }
    }

    fn run_send_lane(
        self: Arc<Self>,
        mut source: FrameSource,
        mut packetizer: Packetizer,
        first: AudioFrame,
        shutdown: Receiver<()>,
    ) -> FrameSource {
        let emissions = self.calibrator.emission_sender();
        let mut frame = Some(first);

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            let next = match frame.take() {
                Some(frame) => Ok(frame),
                None => source.next_frame(),
            };
            match next {
                Ok(frame) => self.fan_out(&mut packetizer, &frame, &emissions),
                Err(e) => {
                    tracing::error!("Capture failed, stopping session: {}", e);
                    *self.fatal.lock() = Some(e);
                    source.close();
                    // Another thread may already be tearing down
                    if let Some(_lifecycle) = self.lifecycle.try_lock() {
                        self.teardown();
                    } else {
                        self.running.store(false, Ordering::SeqCst);
                    }
                    break;
                }
            }
        }

        source.close();
        source
    }

    fn fan_out(&self, packetizer: &mut Packetizer, frame: &AudioFrame, emissions: &Sender<ProbeEmission>) {
        let packets = packetizer.packetize(frame);
        let Some(first) = packets.first() else {
            return;
        };
        let probe = self.calibrator.slot().take();
        let destinations = self.destinations.read();

        match probe {
            None => {
                for packet in &packets {
                    if let Err(e) = self.sender.send(packet, destinations.iter()) {
                        tracing::warn!("Packet {} not sent: {}", packet.sequence, e);
                    }
                }
            }
            Some(ProbeRequest {
                destination,
                probe_id,
                ..
            }) => {
                let cal = self.calibrator.config();
                let format = frame.format;
                let tone = pcm::probe_tone(format, frame.samples.len(), cal.tone_hz, cal.tone_amplitude);
                let others: Vec<SocketAddr> = destinations
                    .iter()
                    .copied()
                    .filter(|d| *d != destination)
                    .collect();
                let targeted = destinations.contains(&destination);

                let mut offset = 0;
                for (i, packet) in packets.iter().enumerate() {
                    if let Err(e) = self.sender.send(packet, others.iter()) {
                        tracing::warn!("Packet {} not sent: {}", packet.sequence, e);
                    }
                    let len = packet.payload.len();
                    if targeted {
                        let kind = if i == 0 { PacketKind::Probe } else { PacketKind::Audio };
                        let probe_packet = packet.substitute(kind, tone.slice(offset..offset + len));
                        if let Err(e) = self.sender.send_to(&probe_packet, destination) {
                            tracing::warn!("Probe packet not sent: {}", e);
                        }
                    }
                    offset += len;
                }

                if targeted {
                    let _ = emissions.try_send(ProbeEmission {
                        probe_id,
                        sequence: first.sequence,
                        emitted_ns: first.send_timestamp,
                    });
                }
            }
        }

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}
