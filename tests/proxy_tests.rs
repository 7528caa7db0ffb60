//! Live-socket tests: a real proxy on an ephemeral port, a real origin on
//! the 127.0.0.2 loopback alias, plain TCP clients speaking HTTP/1.1.

use apn_proxy::config::{Config, RemoteEndpoint, RemoteRule};
use apn_proxy::proxy::ProxyServer;
use apn_proxy::testserver::TestOriginServer;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn base_config() -> Config {
    let mut config = Config::default();
    config.pac_host = "proxy.test".to_string();
    config.pac_port = Some(8080);
    config.rules = vec![RemoteRule {
        hosts: vec!["example.com".to_string()],
        remote: RemoteEndpoint::Direct,
    }];
    config
}

async fn start_proxy(config: Config) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(config).unwrap();
    tokio::spawn(async move {
        let _ = server.run_on(listener).await;
    });
    addr
}

async fn start_origin() -> SocketAddr {
    let origin = TestOriginServer::bind("127.0.0.2:0").await.unwrap();
    let addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = origin.run().await;
    });
    addr
}

/// Read one Content-Length framed response off the stream.
async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8(raw[..header_end].to_vec()).unwrap();
    let content_length: usize = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse().ok())
        .expect("content-length framed response");
    let mut body = raw[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed mid body");
        body.extend_from_slice(&buf[..n]);
    }
    (head, body)
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    let prefix = format!("{}:", name);
    head.lines()
        .find(|l| l.to_ascii_lowercase().starts_with(&prefix))
        .and_then(|l| l.split_once(':'))
        .map(|(_, v)| v.trim())
}

#[tokio::test]
async fn test_pac_script_served_over_the_wire() {
    let proxy_addr = start_proxy(base_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client
        .write_all(b"GET http://proxy.test/proxy.pac HTTP/1.1\r\nHost: proxy.test\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(header_value(&head, "x-apn-proxy-pac"), Some("OK"));
    assert_eq!(
        header_value(&head, "x-apn-proxy-url"),
        Some("https://github.com/apn-proxy/apn-proxy")
    );

    let script = String::from_utf8(body).unwrap();
    assert!(script.contains("function FindProxyForURL(url, host)"));
    assert!(script.contains("\"example.com\""));
    assert!(script.contains("PROXY proxy.test:8080"));
    assert!(script.contains("var DEFAULT = \"DIRECT\";"));
    assert!(script.ends_with("return DEFAULT;}"));
}

#[tokio::test]
async fn test_forbidden_targets_rejected_without_dialing() {
    let proxy_addr = start_proxy(base_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client
        .write_all(b"GET http://192.168.1.10/admin HTTP/1.1\r\nHost: 192.168.1.10\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 403"));
    assert_eq!(body, b"Forbidden");

    // Rejections keep the connection alive for the next request.
    client
        .write_all(b"GET http://example.com:21/ HTTP/1.1\r\nHost: example.com:21\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 403"));
    assert_eq!(body, b"Forbidden Port");

    client
        .write_all(b"GET http://localhost/ HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 403"));
    assert_eq!(body, b"Forbidden Host");
}

#[tokio::test]
async fn test_forward_get_and_connection_reuse() {
    let origin_addr = start_origin().await;
    let proxy_addr = start_proxy(base_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let request = format!(
        "GET http://{}/hello HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
        origin_addr, origin_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(header_value(&head, "x-echo"), Some("1"));
    // The proxy forces keep-alive toward the client.
    assert!(header_value(&head, "connection")
        .unwrap()
        .eq_ignore_ascii_case("keep-alive"));

    let echo = String::from_utf8(body).unwrap();
    // Absolute-form URI was rewritten to origin-form before forwarding.
    assert!(echo.starts_with("GET /hello HTTP/1.1"));
    // Proxy-Connection never reaches the origin.
    assert!(!echo.to_ascii_lowercase().contains("proxy-connection"));

    // Second request down the same client connection reuses the pairing.
    let request = format!(
        "GET http://{}/again HTTP/1.1\r\nHost: {}\r\n\r\n",
        origin_addr, origin_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let echo = String::from_utf8(body).unwrap();
    assert!(echo.starts_with("GET /again HTTP/1.1"));
}

#[tokio::test]
async fn test_forward_post_body() {
    let origin_addr = start_origin().await;
    let proxy_addr = start_proxy(base_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let payload = b"name=apn&mode=proxy";
    let request = format!(
        "POST http://{}/submit HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n\r\n",
        origin_addr,
        origin_addr,
        payload.len()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    client.write_all(payload).await.unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let echo = String::from_utf8(body).unwrap();
    assert!(echo.starts_with("POST /submit HTTP/1.1"));
    assert!(echo.contains(&format!("body-bytes: {}", payload.len())));
}

#[tokio::test]
async fn test_unreachable_origin_yields_502() {
    // Reserve a port nobody listens on.
    let unused = TcpListener::bind("127.0.0.2:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let proxy_addr = start_proxy(base_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let request = format!(
        "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
        dead_addr, dead_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 502"));
    assert!(String::from_utf8(body).unwrap().starts_with("Proxy Error:"));
}

#[tokio::test]
async fn test_connect_tunnel_to_origin() {
    let origin_addr = start_origin().await;
    let proxy_addr = start_proxy(base_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        origin_addr, origin_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));

    // The connection is now a raw pipe to the origin; speak plain HTTP
    // through it.
    client
        .write_all(b"GET /tunneled HTTP/1.1\r\nHost: tunnel.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let echo = String::from_utf8(body).unwrap();
    assert!(echo.starts_with("GET /tunneled HTTP/1.1"));
}

#[tokio::test]
async fn test_backpressured_connection_reclaimed_by_idle_monitor() {
    // Origin that accepts connections and then never reads a byte, so the
    // whole forwarding path backs up behind its receive window.
    let listener = TcpListener::bind("127.0.0.2:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            held.push(socket);
        }
    });

    let mut config = base_config();
    config.idle_timeout_secs = 1;
    let proxy_addr = start_proxy(config).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let request = format!(
        "POST http://{}/upload HTTP/1.1\r\nHost: {}\r\nContent-Length: 16777216\r\n\r\n",
        origin_addr, origin_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    // Pump body bytes until every buffer between here and the origin is
    // full and our own writes stall.
    let chunk = vec![0u8; 64 * 1024];
    loop {
        match tokio::time::timeout(Duration::from_millis(500), client.write_all(&chunk)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }

    // The proxy must notice the stalled transfer and close within the
    // idle budget rather than sit on the jammed connection forever.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        let mut buf = [0u8; 4096];
        loop {
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "stalled connection was never reclaimed");
}

#[tokio::test]
async fn test_idle_client_disconnected() {
    let mut config = base_config();
    config.idle_timeout_secs = 1;
    let proxy_addr = start_proxy(config).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    // Say nothing and wait past the idle budget.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("proxy should close the idle connection")
        .unwrap();
    assert_eq!(n, 0);
}
