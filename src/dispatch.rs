//! Rule-table lookup: turns a request's target host into the routing
//! decision for this exchange. First matching rule wins; an unmatched host
//! is dialed directly.

use crate::config::{Config, RemoteEndpoint};

/// Resolved routing decision for one exchange. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteDispatch {
    /// Plain TCP straight to the origin.
    Direct { host: String, port: u16 },
    /// Through a TLS-terminating proxy hop.
    TlsTunnel { host: String, port: u16 },
}

impl RemoteDispatch {
    /// Host and port the outbound socket actually dials.
    pub fn dial_addr(&self) -> (&str, u16) {
        match self {
            RemoteDispatch::Direct { host, port } => (host, *port),
            RemoteDispatch::TlsTunnel { host, port } => (host, *port),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, RemoteDispatch::TlsTunnel { .. })
    }
}

impl std::fmt::Display for RemoteDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteDispatch::Direct { host, port } => write!(f, "direct://{}:{}", host, port),
            RemoteDispatch::TlsTunnel { host, port } => write!(f, "tls://{}:{}", host, port),
        }
    }
}

/// Same matching the generated PAC applies with `dnsDomainIs`: exact host or
/// any subdomain of the pattern.
fn host_matches(pattern: &str, host: &str) -> bool {
    host == pattern || (host.len() > pattern.len() && {
        let tail = &host[host.len() - pattern.len()..];
        tail == pattern && host.as_bytes()[host.len() - pattern.len() - 1] == b'.'
    })
}

pub fn resolve(config: &Config, host: &str, port: u16) -> RemoteDispatch {
    for rule in &config.rules {
        if rule.hosts.iter().any(|p| host_matches(p, host)) {
            return match &rule.remote {
                RemoteEndpoint::Direct => RemoteDispatch::Direct {
                    host: host.to_string(),
                    port,
                },
                RemoteEndpoint::Tls { host: hop, port: hop_port } => RemoteDispatch::TlsTunnel {
                    host: hop.clone(),
                    port: *hop_port,
                },
            };
        }
    }
    RemoteDispatch::Direct {
        host: host.to_string(),
        port,
    }
}
