//! Outbound peer connections.
//!
//! Each peer gets a dedicated writer task that owns the socket. Sends
//! from the rest of the node are a channel push and never block on the
//! network. Writers connect lazily on the first queued message,
//! reconnect with exponential backoff, and stop dialing entirely while
//! the circuit to a persistently dead peer is open.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::metrics::Metrics;
use crate::transport::codec;
use crate::transport::message::Envelope;

struct PeerHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    connected: Arc<AtomicBool>,
}

pub struct PeerConnector {
    config: TransportConfig,
    metrics: Arc<Metrics>,
    peers: DashMap<String, PeerHandle>,
}

impl PeerConnector {
    pub fn new(config: TransportConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            metrics,
            peers: DashMap::new(),
        }
    }

    /// Queues an envelope for `address`, spinning up a writer task for
    /// the peer on first use. Never blocks; delivery is best effort.
    pub fn send(&self, address: &str, envelope: Envelope) {
        let entry = self.peers.entry(address.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let connected = Arc::new(AtomicBool::new(false));
            let writer = PeerWriter {
                address: address.to_string(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
                connected: connected.clone(),
                stream: None,
                buffer: VecDeque::new(),
                failures: 0,
                backoff: self.config.reconnect_base_delay,
                last_attempt: None,
                circuit_open_until: None,
            };
            tokio::spawn(writer.run(rx));
            PeerHandle { tx, connected }
        });
        let queued = entry.value().tx.send(envelope).is_ok();
        drop(entry);
        if !queued {
            // Writer already exited; forget it so the next send starts fresh.
            self.peers.remove(address);
        }
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.peers
            .get(address)
            .map(|handle| handle.connected.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Drops every writer channel; tasks drain their queue and exit.
    pub fn shutdown(&self) {
        self.peers.clear();
    }
}

struct PeerWriter {
    address: String,
    config: TransportConfig,
    metrics: Arc<Metrics>,
    connected: Arc<AtomicBool>,
    stream: Option<TcpStream>,
    buffer: VecDeque<Envelope>,
    failures: u32,
    backoff: Duration,
    last_attempt: Option<Instant>,
    circuit_open_until: Option<Instant>,
}

impl PeerWriter {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            self.buffer_message(envelope);
            // Drain whatever queued up behind it before touching the socket.
            while let Ok(more) = rx.try_recv() {
                self.buffer_message(more);
            }
            self.flush().await;
        }
        debug!(address = %self.address, "peer writer exiting");
    }

    fn buffer_message(&mut self, envelope: Envelope) {
        if self.buffer.len() >= self.config.max_buffered_messages {
            self.buffer.pop_front();
            self.metrics.incr("transport_dropped_messages");
            warn!(
                address = %self.address,
                "send buffer full, dropping oldest message"
            );
        }
        self.buffer.push_back(envelope);
    }

    async fn flush(&mut self) {
        if self.stream.is_none() && !self.try_connect().await {
            return;
        }
        while let Some(envelope) = self.buffer.front() {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return,
            };
            match codec::write_frame(stream, envelope).await {
                Ok(()) => {
                    self.buffer.pop_front();
                    self.metrics.incr("transport_sent_messages");
                }
                Err(err) => {
                    warn!(
                        address = %self.address,
                        error = %err,
                        "write failed, dropping connection"
                    );
                    self.note_failure();
                    return;
                }
            }
        }
    }

    /// One connection attempt, gated by the backoff window and the
    /// circuit breaker. Returns whether a live socket is now held.
    async fn try_connect(&mut self) -> bool {
        let now = Instant::now();
        if let Some(until) = self.circuit_open_until {
            if now < until {
                return false;
            }
            // Cooldown over: allow a single probe.
            self.circuit_open_until = None;
        }
        if let Some(last) = self.last_attempt {
            if now < last + self.backoff {
                return false;
            }
        }
        self.last_attempt = Some(now);

        let attempt =
            tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.address))
                .await;
        match attempt {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                info!(address = %self.address, "connected to peer");
                self.stream = Some(stream);
                self.connected.store(true, Ordering::Relaxed);
                self.failures = 0;
                self.backoff = self.config.reconnect_base_delay;
                true
            }
            Ok(Err(err)) => {
                debug!(address = %self.address, error = %err, "connect failed");
                self.metrics.incr("transport_connect_failures");
                self.note_failure();
                false
            }
            Err(_) => {
                debug!(address = %self.address, "connect timed out");
                self.metrics.incr("transport_connect_failures");
                self.note_failure();
                false
            }
        }
    }

    fn note_failure(&mut self) {
        self.stream = None;
        self.connected.store(false, Ordering::Relaxed);
        self.failures += 1;
        self.backoff = (self.backoff * 2).min(self.config.reconnect_max_delay);
        if self.failures >= self.config.circuit_failure_threshold
            && self.circuit_open_until.is_none()
        {
            warn!(
                address = %self.address,
                failures = self.failures,
                "opening circuit to unreachable peer"
            );
            self.metrics.incr("transport_circuit_opened");
            self.circuit_open_until = Some(Instant::now() + self.config.circuit_cooldown);
        }
    }
}
