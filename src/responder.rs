//! Responder: the passive per-host endpoint that timestamps and reflects probes.
//!
//! Any source is answered. There is no per-peer state, so one Responder serves
//! every Prober that targets this host.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::{
    packets::{PacketError, ProbeReply, ProbeRequest},
    time::Timestamp,
};

/// Default UDP port of the Responder.
pub const DEFAULT_RESPONDER_PORT: u16 = 32000;

#[derive(Error, Debug)]
pub enum ResponderError {
    /// The listening socket could not be created or bound.
    #[error("Cannot bind responder to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Aggregate packet counters for the Responder.
#[derive(Debug, Default)]
pub struct ResponderCounters {
    pub packets_received: AtomicU64,
    pub packets_reflected: AtomicU64,
    pub packets_dropped: AtomicU64,
}

impl ResponderCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Builds the reply for one inbound datagram.
///
/// The sender's timestamp is echoed unchanged and `arrived_at` is appended.
pub fn assemble_reply(datagram: &[u8], arrived_at: Timestamp) -> Result<ProbeReply, PacketError> {
    let request = ProbeRequest::from_bytes(datagram)?;
    Ok(ProbeReply {
        sent_at: request.sent_at,
        arrived_at,
    })
}

pub struct Responder {
    socket: UdpSocket,
    counters: Arc<ResponderCounters>,
}

impl Responder {
    /// Binds the listening socket.
    ///
    /// Failure here is fatal for the host: without a Responder no peer can
    /// measure towards it.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ResponderError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ResponderError::Bind { addr, source })?;
        Ok(Responder {
            socket,
            counters: Arc::new(ResponderCounters::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Shared handle to the packet counters, readable while the Responder runs.
    pub fn counters(&self) -> Arc<ResponderCounters> {
        Arc::clone(&self.counters)
    }

    /// Reflects probes until the task is dropped.
    pub async fn run(self) {
        if let Ok(addr) = self.socket.local_addr() {
            log::info!("Responder listening on {}", addr);
        }

        let mut buf = [0u8; 1024];

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("Responder receive error: {}", e);
                    continue;
                }
            };
            let arrived_at = Timestamp::now();
            self.counters.packets_received.fetch_add(1, Ordering::Relaxed);

            let reply = match assemble_reply(&buf[..len], arrived_at) {
                Ok(reply) => reply,
                Err(e) => {
                    log::warn!("Dropping probe from {}: {}", src, e);
                    self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            match self.socket.send_to(&reply.to_bytes(), src).await {
                Ok(_) => {
                    self.counters.packets_reflected.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Reflected probe from {} (sent {})", src, reply.sent_at);
                }
                Err(e) => {
                    self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Failed to send reply to {}: {}", src, e);
                }
            }
        }
    }
}
