pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod idle;
pub mod logging;
pub mod proxy;
pub mod relay;
pub mod remote;
pub mod testserver;
pub mod tls;

pub use config::{Config, ListenType, RemoteEndpoint, RemoteRule};
pub use error::ProxyError;
pub use proxy::ProxyServer;
