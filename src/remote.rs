//! Outbound connection initializer: opens the remote-facing connection and
//! assembles its pipeline in order: idle monitor, optional TLS session,
//! HTTP client codec, relay handler bound to the client's submission queue.

use crate::codec::{ClientCodec, HttpFrame};
use crate::dispatch::RemoteDispatch;
use crate::error::ProxyError;
use crate::idle::IdleMonitor;
use crate::relay::{ClientEvent, RelayHandler};
use crate::tls::SessionFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

pub trait RemoteIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RemoteIo for T {}

/// Plain TCP or an established TLS session, behind one interface so the
/// HTTP codec always operates on decrypted bytes.
pub type RemoteStream = Box<dyn RemoteIo>;

#[derive(Debug, Clone, Copy)]
pub struct RemoteSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Handle the client connection keeps for its currently active remote.
/// Dropping it detaches the remote task, which then tears itself down.
pub struct RemoteBinding {
    pub id: u64,
    pub dispatch: RemoteDispatch,
    pub requests: mpsc::Sender<HttpFrame>,
}

/// Open the outbound socket for a dispatch descriptor, wrapping it in a
/// client-mode TLS session when the descriptor calls for one. Also used by
/// CONNECT tunneling, which bypasses HTTP framing entirely.
pub async fn open_stream(
    dispatch: &RemoteDispatch,
    tls: &SessionFactory,
    connect_timeout: Duration,
) -> Result<RemoteStream, ProxyError> {
    let (host, port) = dispatch.dial_addr();
    let tcp = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ProxyError::Connection(format!("connect to {}:{} timed out", host, port)))?
        .map_err(|e| ProxyError::Connection(format!("connect to {}:{} failed: {}", host, port, e)))?;

    if dispatch.is_tls() {
        let session = tls.create_client_session(host, port, tcp).await?;
        Ok(Box::new(session))
    } else {
        Ok(Box::new(tcp))
    }
}

/// Spawn the remote pipeline task and hand back its binding immediately.
/// Request frames queue in the binding while the connection is still being
/// established. Connect and handshake failures are reported through the
/// client's event queue; they never close the client connection.
pub fn initialize(
    id: u64,
    dispatch: RemoteDispatch,
    tls: Arc<SessionFactory>,
    client: mpsc::Sender<ClientEvent>,
    settings: RemoteSettings,
) -> RemoteBinding {
    let (requests_tx, requests_rx) = mpsc::channel(32);
    let binding = RemoteBinding {
        id,
        dispatch: dispatch.clone(),
        requests: requests_tx,
    };

    tokio::spawn(async move {
        let stream = match open_stream(&dispatch, &tls, settings.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("remote #{} ({}): {}", id, dispatch, e);
                let _ = client
                    .send(ClientEvent::RemoteConnectFailed {
                        remote_id: id,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        log::debug!("remote #{} ({}): connected", id, dispatch);

        let idle = IdleMonitor::new(settings.idle_timeout);
        idle.touch();
        let framed = Framed::new(stream, ClientCodec::new());
        RelayHandler::new(id, client).run(framed, requests_rx, idle).await;
        log::debug!("remote #{} ({}): finished", id, dispatch);
    });

    binding
}
