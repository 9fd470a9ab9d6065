//! Inbound connection handling.
//!
//! The accept loop hands every connection to a reader task that frames
//! and decodes envelopes onto the node's incoming channel. A frame that
//! fails to decode is logged and skipped; the connection stays up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{VardeError, VardeResult};
use crate::metrics::Metrics;
use crate::transport::codec;
use crate::transport::message::Envelope;

pub async fn bind(address: &str) -> VardeResult<TcpListener> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| VardeError::Io {
            operation: format!("bind {address}"),
            source: e,
        })?;
    Ok(listener)
}

pub fn spawn_accept_loop(
    listener: TcpListener,
    incoming: mpsc::UnboundedSender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(address) = listener.local_addr() {
            info!(%address, "transport listening");
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(read_connection(
                            stream,
                            peer,
                            incoming.clone(),
                            shutdown.clone(),
                            metrics.clone(),
                        ));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("accept loop shutting down");
                        break;
                    }
                }
            }
        }
    })
}

async fn read_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    incoming: mpsc::UnboundedSender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
) {
    debug!(%peer, "connection accepted");
    loop {
        tokio::select! {
            frame = codec::read_frame(&mut stream) => match frame {
                Ok(Some(body)) => match codec::decode(&body) {
                    Ok(envelope) => {
                        metrics.incr("transport_received_messages");
                        if incoming.send(envelope).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        // Skip the frame, keep the connection.
                        metrics.incr("transport_decode_errors");
                        warn!(%peer, error = %err, "dropping undecodable frame");
                    }
                },
                Ok(None) => {
                    debug!(%peer, "peer closed connection");
                    return;
                }
                Err(err) => {
                    debug!(%peer, error = %err, "read failed, closing connection");
                    return;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
