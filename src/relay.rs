//! Bidirectional relay bound to exactly one client-facing connection. One
//! instance per remote connection: it writes forwarded requests out and
//! relays decoded responses back into the client connection's submission
//! queue, rewriting the persistence headers on the way.

use crate::codec::{ClientCodec, HttpFrame, RequestHead};
use crate::dispatch::RemoteDispatch;
use crate::idle::IdleMonitor;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::{HeaderValue, CONNECTION, HOST};
use http::Uri;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Non-standard persistence marker some user agents still send and expect.
pub const PROXY_CONNECTION: &str = "proxy-connection";

/// Events submitted into a client connection's queue from outside its own
/// task. Cross-connection effects travel only through this channel.
#[derive(Debug)]
pub enum ClientEvent {
    /// A response frame to write to the user agent, already transformed.
    /// Tagged with its pairing generation so frames a replaced remote had
    /// already queued are dropped instead of corrupting the new exchange.
    Forward { remote_id: u64, frame: HttpFrame },
    /// The remote side of the identified pairing generation disconnected.
    RemoteClosed { remote_id: u64 },
    /// The remote attempt never got off the ground.
    RemoteConnectFailed { remote_id: u64, error: String },
}

pub struct RelayHandler {
    remote_id: u64,
    client: mpsc::Sender<ClientEvent>,
    notified: bool,
}

impl RelayHandler {
    pub fn new(remote_id: u64, client: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            remote_id,
            client,
            notified: false,
        }
    }

    /// Per-message transformation before a frame crosses to the client
    /// connection. Response heads get persistence forced for both sides of
    /// the pairing; body chunks are duplicated so the client write queue
    /// never holds buffers whose lifetime the remote connection controls.
    pub fn transform(frame: HttpFrame) -> HttpFrame {
        match frame {
            HttpFrame::ResponseHead(mut head) => {
                head.headers
                    .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
                head.headers
                    .insert(PROXY_CONNECTION, HeaderValue::from_static("keep-alive"));
                HttpFrame::ResponseHead(head)
            }
            HttpFrame::Chunk(data) => HttpFrame::Chunk(Bytes::copy_from_slice(&data)),
            other => other,
        }
    }

    /// Drive the remote connection until either side goes away. Every exit
    /// path funnels through the same one-shot disconnect notification.
    pub async fn run<S>(
        mut self,
        framed: Framed<S, ClientCodec>,
        mut requests: mpsc::Receiver<HttpFrame>,
        idle: IdleMonitor,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = framed.split();

        loop {
            tokio::select! {
                frame = requests.recv() => match frame {
                    Some(frame) => {
                        idle.touch();
                        // A write stalled by a peer that stopped reading must
                        // not pin this task past the idle budget.
                        let written = tokio::select! {
                            result = sink.send(frame) => match result {
                                Ok(()) => true,
                                Err(e) => {
                                    log::warn!("remote #{}: write failed: {}", self.remote_id, e);
                                    false
                                }
                            },
                            _ = idle.expired() => {
                                log::info!("remote #{}: write stalled past idle budget", self.remote_id);
                                false
                            }
                        };
                        if !written {
                            break;
                        }
                    }
                    // Client side dropped the binding.
                    None => break,
                },
                item = stream.next() => match item {
                    Some(Ok(frame)) => {
                        idle.touch();
                        let event = ClientEvent::Forward {
                            remote_id: self.remote_id,
                            frame: Self::transform(frame),
                        };
                        let delivered = tokio::select! {
                            result = self.client.send(event) => result.is_ok(),
                            _ = idle.expired() => false,
                        };
                        if !delivered {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("remote #{}: protocol error: {}", self.remote_id, e);
                        break;
                    }
                    None => {
                        log::debug!("remote #{}: closed by peer", self.remote_id);
                        break;
                    }
                },
                _ = idle.expired() => {
                    log::info!("remote #{}: idle timeout, closing", self.remote_id);
                    break;
                }
            }
        }

        self.fire_disconnect().await;
    }

    /// Deliver the disconnect notification at most once, even if called
    /// again on another exit path.
    pub async fn fire_disconnect(&mut self) {
        if self.notified {
            return;
        }
        self.notified = true;
        let _ = self
            .client
            .send(ClientEvent::RemoteClosed {
                remote_id: self.remote_id,
            })
            .await;
    }
}

/// Rewrites a client request head for the wire toward the chosen remote.
/// Direct origins expect origin-form URIs; a TLS-tunneled hop is itself a
/// proxy and keeps the absolute form.
pub fn prepare_forward_request(mut head: RequestHead, dispatch: &RemoteDispatch) -> RequestHead {
    if matches!(dispatch, RemoteDispatch::Direct { .. }) && head.uri.scheme().is_some() {
        if head.headers.get(HOST).is_none() {
            if let Some(authority) = head.uri.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    head.headers.insert(HOST, value);
                }
            }
        }
        let origin_form = head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        head.uri = origin_form
            .parse()
            .unwrap_or_else(|_| Uri::from_static("/"));
    }
    head.headers
        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    head.headers.remove(PROXY_CONNECTION);
    head
}
