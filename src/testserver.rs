//! Small origin server used by the integration tests and by the
//! `--test-server` mode of the binary. Echoes back the request line and
//! headers so a test can see exactly what the proxy forwarded.

use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use tokio::net::TcpListener;

pub struct TestOriginServer {
    listener: TcpListener,
}

impl TestOriginServer {
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        log::info!(
            "Test origin listening on http://{}",
            self.listener.local_addr()?
        );

        loop {
            let (stream, remote_addr) = self.listener.accept().await?;

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(err) = ServerBuilder::new()
                    .serve_connection(
                        io,
                        service_fn(|req| async move {
                            Ok::<_, Infallible>(echo(req).await)
                        }),
                    )
                    .await
                {
                    log::debug!("Origin connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

/// Plain-text echo of the request line, headers and body length.
async fn echo(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let mut lines = format!(
        "{} {} {:?}\n",
        req.method(),
        req.uri(),
        req.version()
    );
    for (name, value) in req.headers() {
        lines.push_str(name.as_str());
        lines.push_str(": ");
        lines.push_str(value.to_str().unwrap_or("<binary>"));
        lines.push('\n');
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from(format!("body error: {}", e))))
                .expect("static response")
        }
    };
    lines.push_str(&format!("body-bytes: {}\n", body.len()));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain")
        .header("x-echo", "1")
        .body(Full::new(Bytes::from(lines)))
        .expect("static response")
}
