use clap::Parser;
use peerlink::config::{self, parse_peer_entry, Config};
use peerlink::network::connection_manager::{ConnectionManager, ManagerEvent};
use peerlink::network::transport::WebSocketTransport;
use peerlink::shutdown::ShutdownManager;
use peerlink::types::IdGenerator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;

/// Lock id held on every bootstrap peer for the lifetime of the daemon
const BOOTSTRAP_LOCK_ID: &str = "bootstrap";

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(about = "Peer connection daemon", long_about = None)]
struct Args {
    /// Config file (defaults to ~/.peerlink/peerlink.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the websocket listen port (0 picks a free port)
    #[arg(long)]
    listen_port: Option<u16>,

    /// Extra peers to lock, as `<node-id-hex>@ws://host:port`
    #[arg(long = "connect")]
    connect: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    /// Write a default config file and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);

    if args.generate_config {
        if config_path.exists() {
            eprintln!("❌ Config already exists at: {}", config_path.display());
            std::process::exit(1);
        }
        match Config::load_or_create(&config_path) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", config_path.display());
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&config_path) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", config_path.display());
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = args.listen_port {
        config.network.websocket_port = Some(port);
    }

    let _log_guard = setup_logging(&config.logging, args.verbose);

    let mut bootstrap = match config.bootstrap_peer_descriptors() {
        Ok(peers) => peers,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };
    for entry in &args.connect {
        match parse_peer_entry(entry) {
            Ok(peer) => bootstrap.push(peer),
            Err(e) => {
                eprintln!("❌ {}", e);
                std::process::exit(1);
            }
        }
    }

    let local = match config.local_peer_descriptor() {
        Ok(local) => local,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    println!("\n🚀 peerlink v{} ({})", version, git_hash);
    println!("═══════════════════════════════════════════════════════");
    println!("  └─ Name: {}", config.node.name);
    println!("  └─ Node id: {}", local.address());
    match &local.websocket {
        Some(ws) => println!("  └─ Advertised: {}", ws.url()),
        None => println!("  └─ Advertised: (client only)"),
    }
    println!();

    let ids = Arc::new(IdGenerator::new());
    let transport = WebSocketTransport::new(local, ids.clone());
    let manager = ConnectionManager::new(config.connection_manager_config(), transport, ids);

    // Connect and disconnect are logged by the manager itself
    manager.events().on(|event: &ManagerEvent| {
        if let ManagerEvent::Message(message) = event {
            tracing::debug!(
                "📨 {} on {} from {}",
                message.message_type(),
                message.service_id,
                message
                    .source
                    .as_ref()
                    .map(|s| s.address().to_string())
                    .unwrap_or_else(|| "?".into())
            );
        }
    });

    if let Err(e) = manager.start().await {
        tracing::error!("❌ Failed to start connection manager: {}", e);
        std::process::exit(1);
    }

    let mut shutdown_manager = ShutdownManager::new();

    for peer in bootstrap {
        let manager = manager.clone();
        let token = shutdown_manager.token();
        shutdown_manager.register_task(tokio::spawn(async move {
            tokio::select! {
                _ = manager.lock_connection(&peer, BOOTSTRAP_LOCK_ID) => {}
                _ = token.cancelled() => {}
            }
        }));
    }

    let status_manager = manager.clone();
    let token = shutdown_manager.token();
    shutdown_manager.register_task(tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tracing::info!(
                        "📊 {} connections ({} local locks, {} remote locks, {} weak locks)",
                        status_manager.get_connection_count(),
                        status_manager.get_local_locked_connection_count(),
                        status_manager.get_remote_locked_connection_count(),
                        status_manager.get_weak_locked_connection_count()
                    );
                }
                _ = token.cancelled() => break,
            }
        }
    }));

    shutdown_manager.wait_for_signal().await;
    shutdown_manager.shutdown(&manager).await;
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    if config.output == "file" {
        let path = if config.file_path.is_empty() {
            config::get_data_dir().join("peerlink.log")
        } else {
            PathBuf::from(&config.file_path)
        };
        let dir = path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "peerlink.log".into());
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        if config.format == "json" {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        } else {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .with_writer(writer)
                .compact()
                .init();
        }
        return Some(guard);
    }

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd {
                // journald already adds timestamp and hostname
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
    None
}

// UTC time plus hostname, e.g. "2025-12-10 18:09:43.150 [server1]"
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
