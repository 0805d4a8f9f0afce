//! Prober: the active per-peer client of the timestamp-exchange protocol.
//!
//! Each Prober alternates between sending a probe and waiting (with a deadline)
//! for its reflection. Completed exchanges feed the peer's sample window; when
//! the window is full the median forward delay is published to the peer's slot
//! in the shared [`DelayTable`](crate::estimator::DelayTable).

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::ValueEnum;
use tokio::{net::UdpSocket, time::Instant};

use crate::{
    estimator::{DerivedSample, ProbeSample, SampleWindow, SlotWriter},
    packets::{ProbeReply, ProbeRequest},
    peers::PeerDescriptor,
    time::Timestamp,
};

/// Default time to wait for a reflected probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default pause between two windows in continuous mode.
pub const DEFAULT_ROUND_INTERVAL: Duration = Duration::from_secs(10);

/// What a Prober does once its window is full.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, ValueEnum)]
pub enum ProbeMode {
    /// Publish the estimate and stop.
    Bounded,
    /// Publish the estimate, start a new window and keep going.
    #[default]
    Continuous,
}

#[derive(Debug, Clone, Copy)]
pub struct ProberConfig {
    /// Deadline for a reply to arrive after a probe is sent.
    pub timeout: Duration,
    pub mode: ProbeMode,
    /// Pause after each completed window in continuous mode.
    pub round_interval: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        ProberConfig {
            timeout: DEFAULT_PROBE_TIMEOUT,
            mode: ProbeMode::default(),
            round_interval: DEFAULT_ROUND_INTERVAL,
        }
    }
}

/// Per-peer packet counters, readable while the Prober runs.
#[derive(Debug, Default)]
pub struct ProbeCounters {
    pub probes_sent: AtomicU64,
    pub replies_received: AtomicU64,
    pub replies_discarded: AtomicU64,
    pub timeouts: AtomicU64,
    pub io_errors: AtomicU64,
    pub windows_completed: AtomicU64,
}

enum ProbeState {
    Send,
    Recv { sent_at: Timestamp },
}

enum RecvOutcome {
    Sample(ProbeSample),
    TimedOut,
    Failed,
}

pub struct Prober {
    peer: PeerDescriptor,
    socket: UdpSocket,
    config: ProberConfig,
    window: SampleWindow,
    slot: SlotWriter,
    counters: Arc<ProbeCounters>,
}

impl Prober {
    /// Opens a UDP socket on `local_addr` and connects it to the peer's Responder.
    pub async fn connect(
        peer: PeerDescriptor,
        local_addr: IpAddr,
        slot: SlotWriter,
        config: ProberConfig,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(local_addr, 0)).await?;
        socket.connect(peer.address).await?;

        Ok(Prober {
            peer,
            socket,
            config,
            window: SampleWindow::new(),
            slot,
            counters: Arc::new(ProbeCounters::default()),
        })
    }

    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    pub fn counters(&self) -> Arc<ProbeCounters> {
        Arc::clone(&self.counters)
    }

    /// Runs the send/receive cycle.
    ///
    /// In bounded mode this returns the published estimate after the first full
    /// window. In continuous mode it never returns.
    pub async fn run(mut self) -> Option<f64> {
        log::info!(
            "Probing {} at {} ({:?} mode)",
            self.peer.name,
            self.peer.address,
            self.config.mode
        );

        let mut recv_buf = [0u8; 1024];
        let mut state = ProbeState::Send;

        loop {
            state = match state {
                ProbeState::Send => match self.send_probe().await {
                    Some(sent_at) => ProbeState::Recv { sent_at },
                    None => {
                        // Abandon the cycle without spinning on a persistent error.
                        tokio::time::sleep(self.config.timeout).await;
                        ProbeState::Send
                    }
                },
                ProbeState::Recv { sent_at } => {
                    match self.await_reply(sent_at, &mut recv_buf).await {
                        RecvOutcome::Sample(sample) => {
                            if let Some(estimate) = self.record(&sample) {
                                if self.config.mode == ProbeMode::Bounded {
                                    log::info!("{} finished", self.peer.name);
                                    return Some(estimate);
                                }
                                if !self.config.round_interval.is_zero() {
                                    tokio::time::sleep(self.config.round_interval).await;
                                }
                            }
                        }
                        RecvOutcome::TimedOut => {
                            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                            log::debug!("Probe to {} timed out", self.peer.name);
                        }
                        RecvOutcome::Failed => {}
                    }
                    ProbeState::Send
                }
            };
        }
    }

    async fn send_probe(&self) -> Option<Timestamp> {
        let request = ProbeRequest {
            sent_at: Timestamp::now(),
        };

        match self.socket.send(&request.to_bytes()).await {
            Ok(_) => {
                self.counters.probes_sent.fetch_add(1, Ordering::Relaxed);
                Some(request.sent_at)
            }
            Err(e) => {
                self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Failed to send probe to {}: {}", self.peer.name, e);
                None
            }
        }
    }

    /// Waits until the deadline for the reply that echoes `sent_at`.
    ///
    /// Malformed datagrams and late replies to abandoned probes are discarded
    /// without resetting the deadline.
    async fn await_reply(&self, sent_at: Timestamp, buf: &mut [u8]) -> RecvOutcome {
        let deadline = Instant::now() + self.config.timeout;

        loop {
            let len = match tokio::time::timeout_at(deadline, self.socket.recv(buf)).await {
                Err(_) => return RecvOutcome::TimedOut,
                Ok(Err(e)) => {
                    self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Receive error from {}: {}", self.peer.name, e);
                    tokio::time::sleep_until(deadline).await;
                    return RecvOutcome::Failed;
                }
                Ok(Ok(len)) => len,
            };
            let client_arrival_at = Timestamp::now();

            match ProbeReply::from_bytes(&buf[..len]) {
                Ok(reply) if reply.sent_at == sent_at => {
                    return RecvOutcome::Sample(ProbeSample {
                        sent_at,
                        server_arrival_at: reply.arrived_at,
                        client_arrival_at,
                    });
                }
                Ok(reply) => {
                    self.counters.replies_discarded.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Discarding stale reply from {} (echo {}, expected {})",
                        self.peer.name,
                        reply.sent_at,
                        sent_at
                    );
                }
                Err(e) => {
                    self.counters.replies_discarded.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Malformed reply from {}: {}", self.peer.name, e);
                }
            }
        }
    }

    /// Adds one sample to the window, publishing and resetting it when full.
    fn record(&mut self, sample: &ProbeSample) -> Option<f64> {
        let derived = DerivedSample::from_probe(sample);
        self.counters.replies_received.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "{} rtt/forward/reverse: {:.3} / {:.3} / {:.3} ms",
            self.peer.name,
            derived.round_trip_ms,
            derived.forward_ms,
            derived.reverse_ms
        );

        if !self.window.push(derived.forward_ms) {
            return None;
        }

        let estimate = self.window.estimate()?;
        self.slot.publish(estimate);
        self.window.reset();
        self.counters.windows_completed.fetch_add(1, Ordering::Relaxed);
        log::info!("{} delay estimate {:.3} ms", self.peer.name, estimate);
        Some(estimate)
    }
}
