//! Listener front-end: binds the configured address, optionally wraps
//! accepted sockets in TLS and hands each connection to its own task.

use crate::config::{Config, ListenType};
use crate::connection::{self, ProxyContext};
use crate::error::ProxyError;
use crate::tls;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        Ok(Self {
            ctx: Arc::new(ProxyContext::new(config)?),
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.ctx.config.listen_addr).await?;
        log::info!(
            "APN proxy listening on {} ({:?})",
            self.ctx.config.listen_addr,
            self.ctx.config.listen_type
        );
        self.run_on(listener).await
    }

    /// Accept loop over an already-bound listener. Tests bind their own
    /// listener on an ephemeral port and pass it in here.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let acceptor = match self.ctx.config.listen_type {
            ListenType::Plain => None,
            ListenType::Tls => {
                let key = self.ctx.config.private_key.as_deref().ok_or_else(|| {
                    ProxyError::Config("TLS listener requires private_key".to_string())
                })?;
                let cert = self.ctx.config.certificate.as_deref().ok_or_else(|| {
                    ProxyError::Config("TLS listener requires certificate".to_string())
                })?;
                Some(TlsAcceptor::from(Arc::new(tls::create_server_config(
                    key, cert,
                )?)))
            }
        };

        loop {
            let (stream, peer) = listener.accept().await?;
            let ctx = self.ctx.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => connection::serve_client(tls_stream, peer, ctx).await,
                        Err(e) => {
                            log::warn!("client {}: TLS handshake failed: {}", peer, e);
                            return;
                        }
                    },
                    None => connection::serve_client(stream, peer, ctx).await,
                };
                if let Err(e) = result {
                    log::debug!("client {}: connection ended with error: {}", peer, e);
                }
            });
        }
    }
}
