//! Peer links: persistent TCP connections carrying length-delimited JSON
//! envelopes. Outbound links dial and write; inbound links are accepted and
//! read. Delivery is best-effort; a full outbound queue drops the envelope.
use crate::{ClusterError, ClusterResult, Envelope};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

const OUTBOUND_QUEUE: usize = 4096;
const MAX_ENVELOPE_BYTES: usize = 4 * 1024 * 1024;
const RECONNECT_BASE: Duration = Duration::from_millis(200);
const RECONNECT_CAP: Duration = Duration::from_secs(10);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_ENVELOPE_BYTES)
        .new_codec()
}

/// Sending handle for one peer. Dropping it stops the link task.
#[derive(Clone)]
pub struct PeerHandle {
    addr: String,
    sender: mpsc::Sender<Envelope>,
}

impl PeerHandle {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Queue an envelope; best-effort, dropped when the link is saturated.
    pub fn send(&self, envelope: Envelope) {
        if self.sender.try_send(envelope).is_err() {
            metrics::counter!("sluice_cluster_dropped_envelopes_total").increment(1);
        }
    }
}

/// Spawn the writer task for a peer address. The task dials with backoff,
/// replays the standing `hello`, and forwards queued envelopes until
/// cancelled.
pub fn spawn_link(addr: String, hello: Envelope, shutdown: CancellationToken) -> PeerHandle {
    let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE);
    let handle = PeerHandle {
        addr: addr.clone(),
        sender,
    };
    tokio::spawn(run_link(addr, hello, receiver, shutdown));
    handle
}

async fn run_link(
    addr: String,
    hello: Envelope,
    mut receiver: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
) {
    let mut delay = RECONNECT_BASE;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            connected = TcpStream::connect(&addr) => connected,
        };
        let stream = match stream {
            Ok(stream) => {
                delay = RECONNECT_BASE;
                stream
            }
            Err(err) => {
                tracing::debug!(peer = %addr, error = %err, "peer dial failed");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(RECONNECT_CAP);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, codec());

        // Announce ourselves so the receiver can fold us into its ring even
        // when its own DNS view lags.
        if write_envelope(&mut framed, &hello).await.is_err() {
            continue;
        }
        tracing::info!(peer = %addr, "peer link established");
        metrics::counter!("sluice_cluster_links_total").increment(1);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                envelope = receiver.recv() => {
                    let Some(envelope) = envelope else { return };
                    if write_envelope(&mut framed, &envelope).await.is_err() {
                        tracing::warn!(peer = %addr, "peer link lost, redialing");
                        break;
                    }
                }
            }
        }
    }
}

async fn write_envelope(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    envelope: &Envelope,
) -> ClusterResult<()> {
    let bytes = serde_json::to_vec(envelope).map_err(|err| ClusterError::Codec(err.to_string()))?;
    framed
        .send(bytes.into())
        .await
        .map_err(|err| ClusterError::Io(err.to_string()))
}

/// Read envelopes from one accepted connection, forwarding each to `sink`
/// until the peer hangs up or shutdown fires.
pub async fn serve_inbound(
    stream: TcpStream,
    remote: SocketAddr,
    sink: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, codec());
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = framed.next() => frame,
        };
        match frame {
            Some(Ok(bytes)) => match serde_json::from_slice::<Envelope>(&bytes) {
                Ok(envelope) => {
                    if sink.send(envelope).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(peer = %remote, error = %err, "bad envelope from peer");
                    metrics::counter!("sluice_cluster_bad_envelopes_total").increment(1);
                }
            },
            Some(Err(err)) => {
                tracing::debug!(peer = %remote, error = %err, "peer read failed");
                return;
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn link_delivers_hello_then_envelopes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let shutdown = CancellationToken::new();
        let (sink, mut received) = mpsc::channel(16);

        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.expect("accept");
            serve_inbound(stream, remote, sink, accept_shutdown).await;
        });

        let hello = Envelope::Hello {
            node: "n1:7000".to_string(),
        };
        let handle = spawn_link(addr.to_string(), hello, shutdown.clone());
        handle.send(Envelope::TenantInvalidate {
            tenant: "acme".to_string(),
        });

        let first = received.recv().await.expect("hello");
        assert!(matches!(first, Envelope::Hello { node } if node == "n1:7000"));
        let second = received.recv().await.expect("envelope");
        assert!(matches!(second, Envelope::TenantInvalidate { tenant } if tenant == "acme"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn bad_frames_are_skipped_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let shutdown = CancellationToken::new();
        let (sink, mut received) = mpsc::channel(16);

        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.expect("accept");
            serve_inbound(stream, remote, sink, accept_shutdown).await;
        });

        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut framed = Framed::new(stream, codec());
        framed
            .send(bytes::Bytes::from_static(b"not json"))
            .await
            .expect("send garbage");
        let good = serde_json::to_vec(&json!({
            "kind": "tenant_invalidate",
            "tenant": "acme"
        }))
        .unwrap();
        framed.send(good.into()).await.expect("send good");

        let envelope = received.recv().await.expect("good envelope");
        assert!(matches!(envelope, Envelope::TenantInvalidate { tenant } if tenant == "acme"));
        shutdown.cancel();
    }
}
