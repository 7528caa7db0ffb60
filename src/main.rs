use apn_proxy::config::{Config, ListenType, LogFormat, LoggingConfig, RemoteEndpoint, RemoteRule};
use apn_proxy::proxy::ProxyServer;
use apn_proxy::testserver::TestOriginServer;
use apn_proxy::{logging, ProxyError};
use clap::Parser;
use log::info;
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version = "0.1.0",
    about = "APN proxy: a PAC-driven forwarding HTTP/HTTPS proxy"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(long, value_name = "HOST", help = "Hostname that serves the PAC script")]
    pac_host: Option<String>,

    #[clap(long, value_name = "PORT", help = "Proxy port advertised inside the PAC script")]
    pac_port: Option<u16>,

    #[clap(long, value_name = "SECONDS", help = "Remote connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Idle timeout in seconds")]
    idle_timeout: Option<u64>,

    #[clap(long, help = "Accept client connections over TLS")]
    tls: bool,

    #[clap(long, value_name = "FILE", help = "Private key file path for the TLS listener")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for the TLS listener")]
    certificate: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level (error, warn, info, debug, trace)")]
    log_level: Option<String>,

    #[clap(long, help = "Emit logs as JSON lines")]
    log_json: bool,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file and exit")]
    generate_config: Option<String>,

    #[clap(long, value_name = "ADDR", help = "Run the plain-text echo origin instead of the proxy")]
    test_server: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = args.generate_config {
        generate_sample_config(&config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    if let Some(addr) = &args.test_server {
        logging::init(Some(&cli_logging(&args, None)));
        let origin = TestOriginServer::bind(addr).await?;
        return Ok(origin.run().await?);
    }

    let config = load_config(&args)?;
    config.validate()?;
    logging::init(Some(&cli_logging(&args, config.logging.as_ref())));

    info!("Starting APN proxy...");
    let server = ProxyServer::new(config)?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            eprintln!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server_handle => {
            if let Err(e) = result {
                eprintln!("Server task error: {}", e);
            }
        }
    }

    info!("APN proxy stopped");
    Ok(())
}

/// Command-line logging flags win over the configuration file.
fn cli_logging(args: &Args, from_file: Option<&LoggingConfig>) -> LoggingConfig {
    LoggingConfig {
        level: args
            .log_level
            .clone()
            .or_else(|| from_file.and_then(|c| c.level.clone())),
        format: args
            .log_json
            .then_some(LogFormat::Json)
            .or_else(|| from_file.and_then(|c| c.format.clone())),
    }
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };

    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid listen address: {}", e)))?;
    }
    if let Some(pac_host) = &args.pac_host {
        config.pac_host = pac_host.clone();
    }
    if let Some(pac_port) = args.pac_port {
        config.pac_port = Some(pac_port);
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = secs;
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = secs;
    }
    if args.tls {
        config.listen_type = ListenType::Tls;
    }
    if args.private_key.is_some() {
        config.private_key = args.private_key.clone();
    }
    if args.certificate.is_some() {
        config.certificate = args.certificate.clone();
    }

    Ok(config)
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut sample = Config::default();
    sample.pac_host = "proxy.example.com".to_string();
    sample.rules = vec![
        RemoteRule {
            hosts: vec!["example.com".to_string(), "example.org".to_string()],
            remote: RemoteEndpoint::Direct,
        },
        RemoteRule {
            hosts: vec!["internal.example.net".to_string()],
            remote: RemoteEndpoint::Tls {
                host: "hop.example.net".to_string(),
                port: 443,
            },
        },
    ];
    sample.to_file(file_path)?;
    Ok(())
}
