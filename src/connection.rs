//! Client-connection driver: owns the client-facing socket, runs the
//! pre-filter on every inbound request, pairs the connection with at most
//! one remote at a time and applies every cross-connection effect that
//! other tasks submit through its event queue.

use crate::codec::{HttpFrame, RequestHead, ServerCodec};
use crate::config::Config;
use crate::dispatch::{self, RemoteDispatch};
use crate::error::ProxyError;
use crate::filter::{self, FilterVerdict};
use crate::idle::IdleMonitor;
use crate::relay::{self, ClientEvent};
use crate::remote::{self, RemoteBinding, RemoteSettings, RemoteStream};
use crate::tls::SessionFactory;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use http::header::{HeaderValue, CONTENT_LENGTH};
use http::{Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Shared, read-only state every connection task works against.
pub struct ProxyContext {
    pub config: Config,
    pub tls: Arc<SessionFactory>,
}

impl ProxyContext {
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        Ok(Self {
            tls: Arc::new(SessionFactory::new()?),
            config,
        })
    }

    fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings {
            connect_timeout: Duration::from_secs(self.config.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
        }
    }
}

/// Association between one client connection and its current remote.
/// Bindings carry a generation id so an event from an old remote can never
/// touch a newer pairing.
struct ConnectionPair {
    remote: Option<RemoteBinding>,
    /// Valid for the current exchange only; reset on every request head.
    pac_exchange: bool,
    next_remote_id: u64,
}

impl ConnectionPair {
    fn new() -> Self {
        Self {
            remote: None,
            pac_exchange: false,
            next_remote_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_remote_id += 1;
        self.next_remote_id
    }

    fn current_id(&self) -> Option<u64> {
        self.remote.as_ref().map(|b| b.id)
    }
}

type ClientSink<S> = SplitSink<Framed<S, ServerCodec>, HttpFrame>;

/// One client-bound write, bounded by the connection's idle budget. A user
/// agent that stops reading must not pin this task forever.
async fn write_frame<S>(
    sink: &mut ClientSink<S>,
    frame: HttpFrame,
    idle: &IdleMonitor,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = sink.send(frame) => result,
        _ = idle.expired() => Err(ProxyError::IdleTimeout),
    }
}

async fn write_frames<S>(
    sink: &mut ClientSink<S>,
    frames: Vec<HttpFrame>,
    idle: &IdleMonitor,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for frame in frames {
        write_frame(sink, frame, idle).await?;
    }
    Ok(())
}

/// Apply one event from the connection's submission queue. Every event is
/// checked against the current pairing generation first; anything from a
/// replaced remote is dropped.
async fn apply_event<S>(
    pair: &mut ConnectionPair,
    sink: &mut ClientSink<S>,
    idle: &IdleMonitor,
    peer: SocketAddr,
    event: ClientEvent,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match event {
        ClientEvent::Forward { remote_id, frame } => {
            if pair.current_id() == Some(remote_id) {
                write_frame(sink, frame, idle).await?;
                idle.touch();
            }
        }
        ClientEvent::RemoteClosed { remote_id } => {
            if pair.current_id() == Some(remote_id) {
                log::debug!("client {}: remote #{} detached", peer, remote_id);
                pair.remote = None;
            }
        }
        ClientEvent::RemoteConnectFailed { remote_id, error } => {
            if pair.current_id() == Some(remote_id) {
                pair.remote = None;
                let message = format!("Proxy Error: {}", error);
                write_frames(
                    sink,
                    filter::error_response(StatusCode::BAD_GATEWAY, &message),
                    idle,
                )
                .await?;
            }
        }
    }
    Ok(())
}

/// Queue one frame on the current remote. While the queue is full this
/// keeps draining the event queue (the remote may be blocked delivering
/// into it) and stays bounded by the idle budget; a frame whose remote
/// detaches mid-wait is discarded, never redelivered.
async fn submit_to_remote<S>(
    pair: &mut ConnectionPair,
    sink: &mut ClientSink<S>,
    events_rx: &mut mpsc::Receiver<ClientEvent>,
    idle: &IdleMonitor,
    peer: SocketAddr,
    frame: HttpFrame,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Some(binding) = &pair.remote else {
            return Ok(());
        };
        let requests = binding.requests.clone();
        tokio::select! {
            permit = requests.reserve() => {
                if let Ok(permit) = permit {
                    permit.send(frame);
                }
                // A failed reserve means the remote died; its closure
                // event is already on its way here.
                return Ok(());
            }
            event = events_rx.recv() => match event {
                Some(event) => apply_event(pair, sink, idle, peer, event).await?,
                None => return Ok(()),
            },
            _ = idle.expired() => return Err(ProxyError::IdleTimeout),
        }
    }
}

/// Ensure the pairing has a live remote for this dispatch and rewrite the
/// request head for the wire toward it.
fn ensure_remote(
    pair: &mut ConnectionPair,
    ctx: &Arc<ProxyContext>,
    events_tx: &mpsc::Sender<ClientEvent>,
    dispatch: RemoteDispatch,
    head: RequestHead,
) -> RequestHead {
    let reusable = pair
        .remote
        .as_ref()
        .map(|b| b.dispatch == dispatch)
        .unwrap_or(false);
    if !reusable {
        // Dropping the old binding detaches its task.
        pair.remote = None;
        let id = pair.next_id();
        pair.remote = Some(remote::initialize(
            id,
            dispatch.clone(),
            ctx.tls.clone(),
            events_tx.clone(),
            ctx.remote_settings(),
        ));
    }
    relay::prepare_forward_request(head, &dispatch)
}

/// Drive one accepted client connection to completion. The pair dies with
/// this function; any remote task it spawned notices its closed channels
/// and unwinds on its own.
pub async fn serve_client<S>(
    stream: S,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let framed = Framed::new(stream, ServerCodec::new());
    let (mut sink, mut frames) = framed.split();
    let (events_tx, mut events_rx) = mpsc::channel::<ClientEvent>(32);
    let idle = IdleMonitor::new(Duration::from_secs(ctx.config.idle_timeout_secs));
    idle.touch();
    let mut pair = ConnectionPair::new();

    loop {
        tokio::select! {
            item = frames.next() => match item {
                Some(Ok(HttpFrame::RequestHead(head))) => {
                    idle.touch();
                    pair.pac_exchange = false;
                    match filter::precheck(&ctx.config, &head, peer) {
                        FilterVerdict::Pac(response) => {
                            pair.pac_exchange = true;
                            write_frames(&mut sink, response, &idle).await?;
                        }
                        FilterVerdict::Reject(response) => {
                            write_frames(&mut sink, response, &idle).await?;
                        }
                        FilterVerdict::Allow { host, port } => {
                            if head.method == Method::CONNECT {
                                let framed = sink
                                    .reunite(frames)
                                    .map_err(|_| ProxyError::Http("reunite failed".to_string()))?;
                                return serve_connect(framed, host, port, peer, ctx, idle).await;
                            }
                            let dispatch = dispatch::resolve(&ctx.config, &host, port);
                            let head = ensure_remote(&mut pair, &ctx, &events_tx, dispatch, head);
                            submit_to_remote(
                                &mut pair,
                                &mut sink,
                                &mut events_rx,
                                &idle,
                                peer,
                                HttpFrame::RequestHead(head),
                            )
                            .await?;
                        }
                    }
                }
                Some(Ok(body @ (HttpFrame::Chunk(_) | HttpFrame::End))) => {
                    idle.touch();
                    if pair.pac_exchange {
                        // Body frames of a PAC exchange are never forwarded.
                    } else {
                        submit_to_remote(&mut pair, &mut sink, &mut events_rx, &idle, peer, body)
                            .await?;
                    }
                }
                Some(Ok(HttpFrame::ResponseHead(_))) => {
                    log::debug!("client {}: ignoring response frame on request path", peer);
                }
                Some(Err(e)) => {
                    log::warn!("client {}: protocol error: {}", peer, e);
                    return Err(e);
                }
                None => {
                    log::debug!("client {}: closed", peer);
                    return Ok(());
                }
            },
            event = events_rx.recv() => match event {
                Some(event) => apply_event(&mut pair, &mut sink, &idle, peer, event).await?,
                // This task holds a sender, so the channel cannot drain.
                None => return Ok(()),
            },
            _ = idle.expired() => {
                log::info!("client {}: idle timeout, closing", peer);
                return Ok(());
            }
        }
    }
}

async fn send_framed<S>(
    framed: &mut Framed<S, ServerCodec>,
    frame: HttpFrame,
    idle: &IdleMonitor,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = framed.send(frame) => result,
        _ = idle.expired() => Err(ProxyError::IdleTimeout),
    }
}

/// CONNECT handling: open the remote per dispatch, answer 200 and turn the
/// rest of the connection into a raw byte tunnel with idle accounting.
async fn serve_connect<S>(
    mut framed: Framed<S, ServerCodec>,
    host: String,
    port: u16,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
    idle: IdleMonitor,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let dispatch = dispatch::resolve(&ctx.config, &host, port);
    let connect_timeout = Duration::from_secs(ctx.config.connect_timeout_secs);

    let mut remote = match remote::open_stream(&dispatch, &ctx.tls, connect_timeout).await {
        Ok(remote) => remote,
        Err(e) => {
            log::warn!("client {}: CONNECT {}:{} failed: {}", peer, host, port, e);
            let message = format!("Proxy Error: {}", e);
            for frame in filter::error_response(StatusCode::BAD_GATEWAY, &message) {
                send_framed(&mut framed, frame, &idle).await?;
            }
            return Ok(());
        }
    };

    // A TLS-tunneled dispatch is a proxy hop: ask it to extend the tunnel
    // to the real target before handing bytes over.
    if dispatch.is_tls() {
        if let Err(e) =
            timeout(connect_timeout, establish_hop_tunnel(&mut remote, &host, port)).await
                .unwrap_or_else(|_| Err(ProxyError::Connection("hop CONNECT timed out".to_string())))
        {
            log::warn!("client {}: hop CONNECT for {}:{} failed: {}", peer, host, port, e);
            let message = format!("Proxy Error: {}", e);
            for frame in filter::error_response(StatusCode::BAD_GATEWAY, &message) {
                send_framed(&mut framed, frame, &idle).await?;
            }
            return Ok(());
        }
    }

    let mut established = crate::codec::ResponseHead::new(StatusCode::OK);
    established
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    send_framed(&mut framed, HttpFrame::ResponseHead(established), &idle).await?;
    send_framed(&mut framed, HttpFrame::End, &idle).await?;

    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        remote.write_all(&parts.read_buf).await?;
    }
    log::debug!("client {}: tunnel to {}:{} established", peer, host, port);
    tunnel(parts.io, remote, idle).await
}

/// Issue a CONNECT through an already-established hop connection and wait
/// for its 200.
async fn establish_hop_tunnel(
    remote: &mut RemoteStream,
    host: &str,
    port: u16,
) -> Result<(), ProxyError> {
    let request = format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n\r\n",
        host, port, host, port
    );
    remote.write_all(request.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 4096 {
            return Err(ProxyError::Connection(
                "oversized hop CONNECT response".to_string(),
            ));
        }
        let n = remote.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::Connection(
                "hop closed during CONNECT".to_string(),
            ));
        }
        response.push(byte[0]);
    }

    let status_line = String::from_utf8_lossy(&response);
    if status_line.starts_with("HTTP/1.1 200") || status_line.starts_with("HTTP/1.0 200") {
        Ok(())
    } else {
        Err(ProxyError::Connection(format!(
            "hop rejected CONNECT: {}",
            status_line.lines().next().unwrap_or("unknown")
        )))
    }
}

/// Raw bidirectional copy with the idle budget refreshed on any traffic.
/// Writes race the budget too, so a jammed side cannot pin the tunnel.
async fn tunnel<C>(client: C, remote: RemoteStream, idle: IdleMonitor) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let mut client_buf = vec![0u8; 16 * 1024];
    let mut remote_buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            n = client_read.read(&mut client_buf) => match n {
                Ok(0) => break,
                Ok(n) => {
                    idle.touch();
                    let written = tokio::select! {
                        result = remote_write.write_all(&client_buf[..n]) => result.is_ok(),
                        _ = idle.expired() => false,
                    };
                    if !written {
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            },
            n = remote_read.read(&mut remote_buf) => match n {
                Ok(0) => break,
                Ok(n) => {
                    idle.touch();
                    let written = tokio::select! {
                        result = client_write.write_all(&remote_buf[..n]) => result.is_ok(),
                        _ = idle.expired() => false,
                    };
                    if !written {
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            },
            _ = idle.expired() => {
                log::info!("tunnel idle timeout, closing");
                break;
            }
        }
    }
    Ok(())
}
