//! seriallinkd - Serial Link Daemon
//!
//! Opens a serial port through the connection manager, prints inbound data
//! and link events as JSON lines on stdout and sends each stdin line to the
//! device.
//!
//! Usage:
//!   seriallinkd [OPTIONS] [config.toml]
//!
//! Stdin lines that parse as hex are sent as raw bytes; anything else is
//! sent as text followed by a newline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use seriallink::config::MockConfig;
use seriallink::{
    ConnectionManager, ConnectionOptions, LinkConfig, LinkEvent, PortConfig, TransportConfig,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parsed command-line arguments
struct Args {
    /// Link config file (TOML)
    config_path: Option<String>,
    /// Only list available ports
    list: bool,
    /// Port path, overrides the config file
    port: Option<String>,
    /// Bitrate, overrides the config file
    baud: Option<u32>,
    /// Use the in-memory transport
    mock: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut result = Args {
        config_path: None,
        list: false,
        port: None,
        baud: None,
        mock: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--list" | "-l" => {
                result.list = true;
                i += 1;
            }
            "--mock" => {
                result.mock = true;
                i += 1;
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    result.port = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    tracing::error!("Missing argument for --port");
                    i += 1;
                }
            }
            "--baud" | "-b" => {
                match args.get(i + 1).map(|v| v.parse::<u32>()) {
                    Some(Ok(baud)) => result.baud = Some(baud),
                    Some(Err(_)) => tracing::error!("Invalid bitrate: {}", args[i + 1]),
                    None => tracing::error!("Missing argument for --baud"),
                }
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                // Positional argument = config file
                result.config_path = Some(arg.to_string());
                i += 1;
            }
            _ => {
                tracing::warn!("Unknown argument: {}", args[i]);
                i += 1;
            }
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"seriallinkd - Serial Link Daemon

Usage: seriallinkd [OPTIONS] [config.toml]

Options:
  -l, --list           List available serial ports and exit
  -p, --port <path>    Port to open (overrides [port] in the config)
  -b, --baud <rate>    Bitrate (overrides the config, default 9600)
      --mock           Use the in-memory transport
  -h, --help           Print this help message

Examples:
  # List ports
  seriallinkd --list

  # Open a port at 115200 baud
  seriallinkd --port /dev/ttyUSB0 --baud 115200

  # Run with config file
  seriallinkd link.toml
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout carries data, so logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seriallinkd=info,seriallink=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = parse_args();

    let mut config = match args.config_path {
        Some(ref path) => {
            tracing::info!("Loading config from: {}", path);
            LinkConfig::load(path)?
        }
        None => LinkConfig::default(),
    };
    if args.mock {
        config.transport = TransportConfig::Mock(MockConfig::default());
    }

    let port = resolve_port(&config, &args);
    let auto_reconnect = config.recovery.auto_reconnect;

    let wants_connection = Arc::new(AtomicBool::new(true));
    let host_flag = wants_connection.clone();
    let manager =
        ConnectionManager::from_config(config)?.with_host(move || host_flag.load(Ordering::SeqCst));

    if args.list {
        for device in manager.list_devices().await? {
            println!("{}", serde_json::to_string(&device)?);
        }
        return Ok(());
    }

    let Some(port) = port else {
        anyhow::bail!("No port given; use --port or a [port] section in the config");
    };

    let stdout: LineSink = Arc::new(|line: String| println!("{}", line));
    tokio::spawn(print_events(
        manager.subscribe_events(),
        manager.clone(),
        auto_reconnect,
        stdout,
    ));

    tracing::info!(path = %port.path, bitrate = port.options.bitrate, "Connecting");
    let info = manager.connect(&port.path, port.options.clone()).await?;
    tracing::info!(id = %info.id, "Link ready, reading stdin");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => manager.send(encode_line(&line), None),
                None => break,
            },
        }
    }

    wants_connection.store(false, Ordering::SeqCst);
    let closed = manager.disconnect().await;
    tracing::info!(closed, "Shutting down");
    Ok(())
}

fn resolve_port(config: &LinkConfig, args: &Args) -> Option<PortConfig> {
    let mut port = match (&args.port, &config.port) {
        (Some(path), Some(configured)) => PortConfig {
            path: path.clone(),
            options: configured.options.clone(),
        },
        (Some(path), None) => PortConfig {
            path: path.clone(),
            options: ConnectionOptions::default(),
        },
        (None, configured) => configured.clone()?,
    };
    if let Some(baud) = args.baud {
        port.options.bitrate = baud;
    }
    Some(port)
}

/// Destination of the JSON lines the daemon prints
type LineSink = Arc<dyn Fn(String) + Send + Sync>;

/// Print inbound data as JSON lines
fn attach_printer(manager: &ConnectionManager, sink: LineSink) {
    manager.add_data_listener(move |data| {
        sink(serde_json::json!({ "data": hex::encode(&data.data), "id": data.id }).to_string());
    });
}

/// Print link events and keep the data printer attached across reconnects
///
/// `disconnect` drops every listener, so the printer is attached again each
/// time a connection opens, whether the daemon or the manager reconnected.
async fn print_events(
    mut events: broadcast::Receiver<LinkEvent>,
    manager: ConnectionManager,
    auto_reconnect: bool,
    sink: LineSink,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match serde_json::to_string(&event) {
            Ok(json) => sink(json),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
        }

        match event {
            LinkEvent::Opened { .. } => attach_printer(&manager, sink.clone()),
            LinkEvent::ReconnectRequested { path, options } if !auto_reconnect => {
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.connect(&path, options).await {
                        tracing::error!(path = %path, error = %e, "Reconnect failed");
                    }
                });
            }
            _ => {}
        }
    }
}

fn encode_line(line: &str) -> Vec<u8> {
    let compact: String = line.split_whitespace().collect();
    match hex::decode(&compact) {
        Ok(bytes) if !compact.is_empty() => bytes,
        _ => {
            let mut bytes = line.as_bytes().to_vec();
            bytes.push(b'\n');
            bytes
        }
    }
}
