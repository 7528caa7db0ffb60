use crate::config::{LogFormat, LoggingConfig};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::io::Write;

/// Log target carrying one audit line per proxied request. Kept separate from
/// the module logs so it can be routed or filtered independently
/// (`RUST_LOG=http_audit=off` silences it).
pub const AUDIT_TARGET: &str = "http_audit";

pub fn init(config: Option<&LoggingConfig>) {
    let level = config
        .and_then(|c| c.level.as_deref())
        .unwrap_or("info")
        .to_string();
    let format = config
        .and_then(|c| c.format.clone())
        .unwrap_or_default();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    match format {
        LogFormat::Json => {
            builder.format(|buf, record| {
                let timestamp: DateTime<Utc> = Utc::now();
                let entry = json!({
                    "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", entry)
            });
        }
        LogFormat::Text => {
            builder.format(|buf, record| {
                let timestamp: DateTime<Utc> = Utc::now();
                writeln!(
                    buf,
                    "{} [{}] [{}] {}",
                    timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
    }

    // Tests and embedders may have installed a logger already.
    let _ = builder.try_init();
}
