//! Receive and playout lanes of one endpoint
//!
//! The receive lane blocks on the endpoint's socket and feeds the jitter
//! buffer. The playout lane owns the render collaborator and the playout
//! clock; it sleeps until the head packet is due or new data arrives.

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::DeviceHandle;
use crate::audio::pcm;
use crate::audio::playback::RenderSink;
use crate::clock::SessionClock;
use crate::config::PlayoutConfig;
use crate::error::NetworkError;
use crate::network::receiver::{Received, UdpReceiver};
use crate::protocol::{ControlMessage, Datagram, Packet, StreamFormat};
use crate::sync::calibration::ProbeObservation;
use crate::sync::jitter::PushOutcome;
use crate::sync::playout::{PlayoutClock, Release};

use super::endpoint::EndpointState;

/// How the lanes of one endpoint are wired
#[derive(Clone)]
pub struct LaneContext {
    pub clock: SessionClock,
    pub playout: PlayoutConfig,
    /// The endpoint reads the sender's session clock directly
    pub shared_epoch: bool,
    /// Apply control messages arriving on the data socket. Delays beyond
    /// `playout.max_delay_ms` are refused.
    pub accept_control: bool,
    /// Where probe playouts are reported, if anyone listens
    pub observations: Option<Sender<ProbeObservation>>,
}

/// Running lanes of one endpoint. Dropping signals and joins them.
pub struct EndpointLanes {
    shutdown: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl EndpointLanes {
    /// Spawn both lanes. `shutdown_tx` must be the sender whose receiver was
    /// handed to `receiver`.
    pub fn spawn(
        state: Arc<EndpointState>,
        receiver: UdpReceiver,
        shutdown_tx: Sender<()>,
        shutdown_rx: Receiver<()>,
        render: Box<dyn RenderSink>,
        device: DeviceHandle,
        ctx: LaneContext,
    ) -> std::io::Result<Self> {
        let (wake_tx, wake_rx) = bounded(1);
        let mut lanes = Self {
            shutdown: Some(shutdown_tx),
            handles: Vec::with_capacity(2),
        };

        let recv_state = state.clone();
        let receiver = receiver.count_invalid_into(state.metrics.invalid_datagrams.clone());
        let session = ctx.clock;
        let control = ctx.accept_control.then(|| ctx.playout.max_delay_ns());
        lanes.handles.push(
            thread::Builder::new()
                .name(format!("recv-{}", state.id()))
                .spawn(move || {
                    receive_lane(recv_state, receiver, session, wake_tx, control)
                })?,
        );

        let playout = PlayoutLane {
            clock: if ctx.shared_epoch {
                PlayoutClock::shared(&ctx.playout)
            } else {
                PlayoutClock::remote(&ctx.playout)
            },
            session: ctx.clock,
            idle_poll: ctx.playout.idle_poll(),
            state: state.clone(),
            render,
            device,
            format: None,
            observations: ctx.observations,
            epoch_seen: state.stream_epoch(),
        };
        lanes.handles.push(
            thread::Builder::new()
                .name(format!("playout-{}", state.id()))
                .spawn(move || playout.run(shutdown_rx, wake_rx))?,
        );

        Ok(lanes)
    }

    /// Ask both lanes to exit at their next suspension point
    pub fn signal(&mut self) {
        self.shutdown.take();
    }

    /// Signal and wait for the lanes. A lane stopping its own endpoint is
    /// not joined.
    pub fn stop(&mut self) {
        self.signal();
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Endpoint lane panicked");
            }
        }
    }
}

impl Drop for EndpointLanes {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_lane(
    state: Arc<EndpointState>,
    mut receiver: UdpReceiver,
    session: SessionClock,
    wake: Sender<()>,
    delay_limit_ns: Option<i64>,
) {
    tracing::debug!("Receive lane for {} started", state.id());

    loop {
        match receiver.recv() {
            Ok(Received {
                datagram: Datagram::Audio(packet),
                arrived,
                ..
            }) => {
                let m = &state.metrics;
                m.packets_received.fetch_add(1, Ordering::Relaxed);
                if m.stale.swap(false, Ordering::Relaxed) {
                    tracing::info!("Endpoint {} receiving again", state.id());
                }
                let outcome = state.jitter.lock().push(packet, session.to_ns(arrived));
                match outcome {
                    PushOutcome::Buffered => {}
                    PushOutcome::Overrun { evicted } => {
                        tracing::warn!("Endpoint {} overrun, evicted {} packets", state.id(), evicted)
                    }
                    other => tracing::trace!("Endpoint {}: {:?}", state.id(), other),
                }
                let _ = wake.try_send(());
            }
            Ok(Received {
                datagram: Datagram::Control(message),
                from,
                ..
            }) => {
                state.metrics.control_messages.fetch_add(1, Ordering::Relaxed);
                if let Some(limit_ns) = delay_limit_ns {
                    apply_control(&state, message, limit_ns);
                } else {
                    tracing::debug!("Ignoring control message from {}", from);
                }
            }
            Err(NetworkError::Timeout) => {
                state.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                if !state.metrics.stale.swap(true, Ordering::Relaxed) {
                    tracing::warn!("Endpoint {} is not receiving packets", state.id());
                }
            }
            Err(NetworkError::Closed) => break,
            Err(e) => {
                tracing::warn!("Endpoint {} receive error: {}", state.id(), e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    tracing::debug!("Receive lane for {} stopped", state.id());
}

fn apply_control(state: &EndpointState, message: ControlMessage, delay_limit_ns: i64) {
    match message {
        ControlMessage::Hello { session, stream_id } => {
            tracing::info!(
                "Endpoint {} joined session {} (stream {:#06x})",
                state.id(),
                session,
                stream_id
            );
            state.follow_stream(Some(stream_id));
        }
        ControlMessage::SetVolume { volume } => {
            if let Err(e) = state.set_volume(volume) {
                tracing::warn!("Endpoint {}: {}", state.id(), e);
            }
        }
        ControlMessage::SetDelay { delay_ns } => match state.set_delay_ns(delay_ns, delay_limit_ns) {
            Ok(()) => {
                tracing::info!("Endpoint {} delay set to {:.1} ms", state.id(), delay_ns as f64 / 1e6)
            }
            Err(e) => tracing::warn!("Endpoint {}: {}", state.id(), e),
        },
        ControlMessage::Goodbye { stream_id } => {
            if state.jitter.lock().stream_id() == Some(stream_id) {
                tracing::info!("Stream {:#06x} ended", stream_id);
                state.follow_stream(None);
            }
        }
    }
}

struct PlayoutLane {
    clock: PlayoutClock,
    session: SessionClock,
    idle_poll: Duration,
    state: Arc<EndpointState>,
    render: Box<dyn RenderSink>,
    device: DeviceHandle,
    format: Option<StreamFormat>,
    observations: Option<Sender<ProbeObservation>>,
    epoch_seen: u64,
}

impl PlayoutLane {
    fn run(mut self, shutdown: Receiver<()>, wake: Receiver<()>) {
        tracing::debug!("Playout lane for {} started", self.state.id());

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            let epoch = self.state.stream_epoch();
            if epoch != self.epoch_seen {
                self.epoch_seen = epoch;
                self.clock.reset();
            }
            self.clock.set_delay(self.state.compensation_ns());

            let now = self.session.now_ns();
            let (released, next_wake) = {
                let mut jitter = self.state.jitter.lock();
                for (send, arrival) in jitter.take_arrival_samples() {
                    self.clock.observe(send, arrival);
                }
                self.clock.advance(now);
                let released = jitter.pop_ready(now, &self.clock);
                (released, jitter.next_wake(&self.clock))
            };

            let m = &self.state.metrics;
            m.drift_ns.store(self.clock.drift_ns(), Ordering::Relaxed);
            m.correction_ns.store(self.clock.correction_ns(), Ordering::Relaxed);

            if let Some(packet) = released {
                self.render_packet(now, packet);
                continue;
            }

            let sleep = match next_wake {
                Some(at) => Duration::from_nanos(at.saturating_sub(now as i64).max(0) as u64)
                    .min(self.idle_poll),
                None => self.idle_poll,
            };
            select! {
                recv(shutdown) -> _ => break,
                recv(wake) -> _ => {}
                default(sleep) => {}
            }
        }

        self.close_render();
        tracing::debug!("Playout lane for {} stopped", self.state.id());
    }

    fn render_packet(&mut self, now: u64, packet: Packet) {
        let state = self.state.clone();
        let m = &state.metrics;
        let format = packet.format();
        if self.format != Some(format) {
            self.close_render();
            if let Err(e) = self.render.open(format, &self.device) {
                m.render_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Endpoint {} render open failed: {}", self.state.id(), e);
                return;
            }
            tracing::info!("Endpoint {} rendering {}", self.state.id(), format);
            self.format = Some(format);
        }

        let packet_ns = packet.duration().as_nanos() as u64;
        if self.clock.classify(now, packet.send_timestamp, packet_ns) == Release::Late {
            m.drift_recoveries
                .store(self.clock.drift_recoveries(), Ordering::Relaxed);
        }

        let pcm = pcm::apply_gain(&packet.payload, format.sample_format, self.state.volume());
        let handed = self.session.now_ns();
        match self.render.write_frame(&pcm) {
            Ok(observed) => {
                m.frames_rendered.fetch_add(1, Ordering::Relaxed);
                if packet.is_probe() {
                    m.probes_rendered.fetch_add(1, Ordering::Relaxed);
                    if let Some(tx) = &self.observations {
                        let _ = tx.try_send(ProbeObservation {
                            endpoint_id: self.state.id().clone(),
                            sequence: packet.sequence,
                            handed_ns: handed,
                            observed_ns: observed.map(|at| self.session.to_ns(at)),
                        });
                    }
                }
            }
            Err(e) => {
                if m.render_errors.fetch_add(1, Ordering::Relaxed) == 0 {
                    tracing::warn!("Endpoint {} render write failed: {}", self.state.id(), e);
                }
            }
        }
    }

    fn close_render(&mut self) {
        if self.format.take().is_some() {
            self.render.close();
        }
    }
}
