//! Inbound request pre-filter: the first stage on every client-facing
//! connection. Decides, before any outbound work happens, whether a request
//! is answered locally (PAC script, policy rejection) or forwarded.

use crate::codec::{HttpFrame, RequestHead, ResponseHead};
use crate::config::{Config, ListenType};
use crate::logging::AUDIT_TARGET;
use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, DATE, HOST, USER_AGENT};
use http::{Method, StatusCode};
use std::net::SocketAddr;
use std::time::SystemTime;

/// Hosts under these prefixes belong to the proxy's own network and are
/// never dialed on behalf of a user agent. String prefixes on purpose: the
/// check applies to whatever the request names as host, resolved or not.
pub const FORBIDDEN_HOST_PREFIXES: [&str; 18] = [
    "10.", "172.16.", "172.17.", "172.18.", "172.19.", "172.20.", "172.21.", "172.22.", "172.23.",
    "172.24.", "172.25.", "172.26.", "172.27.", "172.28.", "172.29.", "172.30.", "172.31.",
    "192.168.",
];

/// File-transfer and remote-shell ports are off-limits.
pub const FORBIDDEN_PORTS: [u16; 3] = [20, 21, 22];

const PAC_URL_HEADER: &str = "https://github.com/apn-proxy/apn-proxy";
const PAC_MSG_HEADER: &str = "We need more commiters!";

#[derive(Debug)]
pub enum FilterVerdict {
    /// Forward to the resolved target.
    Allow { host: String, port: u16 },
    /// Locally answered; frames form the complete response.
    Pac(Vec<HttpFrame>),
    Reject(Vec<HttpFrame>),
}

/// Target host named by the request, from the absolute URI, the CONNECT
/// authority or the Host header.
pub fn target_host(head: &RequestHead) -> Option<String> {
    if let Some(host) = head.uri.host() {
        return Some(host.to_string());
    }
    head.headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or("").to_string())
        .filter(|s| !s.is_empty())
}

/// Target port: explicit wins, then scheme default, then the proxy-form
/// defaults (443 for CONNECT, 80 otherwise).
pub fn target_port(head: &RequestHead) -> u16 {
    if let Some(port) = head.uri.port_u16() {
        return port;
    }
    if head.method == Method::CONNECT {
        return 443;
    }
    if head.uri.scheme_str() == Some("https") {
        return 443;
    }
    if let Some(port) = head
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.rsplit_once(':'))
        .and_then(|(_, p)| p.parse::<u16>().ok())
    {
        return port;
    }
    80
}

/// Evaluate the access policy for one request head. Emits the audit line as
/// a side effect; logging never influences the verdict.
pub fn precheck(config: &Config, head: &RequestHead, peer: SocketAddr) -> FilterVerdict {
    let user_agent = head
        .headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    log::info!(
        target: AUDIT_TARGET,
        "{} \"{} {} {:?}\" \"{}\"",
        peer,
        head.method,
        head.uri,
        head.version,
        user_agent
    );

    let Some(host) = target_host(head) else {
        return FilterVerdict::Reject(error_response(
            StatusCode::BAD_REQUEST,
            "Bad Request: no target host",
        ));
    };

    if host == config.pac_host {
        return FilterVerdict::Pac(pac_response(config));
    }

    for prefix in FORBIDDEN_HOST_PREFIXES {
        if host.starts_with(prefix) {
            return FilterVerdict::Reject(error_response(StatusCode::FORBIDDEN, "Forbidden"));
        }
    }

    if host == "127.0.0.1" || host == "localhost" {
        return FilterVerdict::Reject(error_response(StatusCode::FORBIDDEN, "Forbidden Host"));
    }

    let port = target_port(head);
    if FORBIDDEN_PORTS.contains(&port) {
        return FilterVerdict::Reject(error_response(StatusCode::FORBIDDEN, "Forbidden Port"));
    }

    FilterVerdict::Allow { host, port }
}

/// Complete synthesized response; the connection stays open afterwards.
pub fn error_response(status: StatusCode, message: &str) -> Vec<HttpFrame> {
    let body = Bytes::copy_from_slice(message.as_bytes());
    let mut head = ResponseHead::new(status);
    head.headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    head.headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&body.len().to_string()).expect("length header"),
    );
    head.headers
        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
        head.headers.insert(DATE, date);
    }
    vec![
        HttpFrame::ResponseHead(head),
        HttpFrame::Chunk(body),
        HttpFrame::End,
    ]
}

fn pac_response(config: &Config) -> Vec<HttpFrame> {
    let script = match config.listen_type {
        ListenType::Plain => build_pac_plain(config),
        ListenType::Tls => build_pac_tls(config),
    };
    let body = Bytes::from(script);

    let mut head = ResponseHead::new(StatusCode::OK);
    head.headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&body.len().to_string()).expect("length header"),
    );
    head.headers
        .insert("x-apn-proxy-pac", HeaderValue::from_static("OK"));
    head.headers
        .insert("x-apn-proxy-url", HeaderValue::from_static(PAC_URL_HEADER));
    head.headers
        .insert("x-apn-proxy-msg", HeaderValue::from_static(PAC_MSG_HEADER));
    vec![
        HttpFrame::ResponseHead(head),
        HttpFrame::Chunk(body),
        HttpFrame::End,
    ]
}

/// PAC for a plaintext listener: proxy only the domains the rule table
/// names, everything else goes direct.
pub fn build_pac_plain(config: &Config) -> String {
    let domains = config
        .rules
        .iter()
        .flat_map(|rule| rule.hosts.iter())
        .map(|host| format!("\"{}\"", host))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "function FindProxyForURL(url, host){{\
         var PROXY = \"PROXY {}:{}\";\
         var DEFAULT = \"DIRECT\";\
         var domains = [{}];\
         for (var i = 0; i < domains.length; i++) {{\
         if (dnsDomainIs(host, domains[i])) {{return PROXY}};}}\
         return DEFAULT;}}",
        config.pac_host,
        config.pac_port(),
        domains
    )
}

/// PAC for a TLS listener: every URL goes through the proxy.
pub fn build_pac_tls(config: &Config) -> String {
    format!(
        "function FindProxyForURL(url, host){{\
         var PROXY = \"HTTPS {}:{}\";\
         return PROXY;}}",
        config.pac_host,
        config.pac_port()
    )
}
