use clap::{Parser, Subcommand, ValueEnum};
use natpmpd::client::Client;
use natpmpd::config::{self, Config};
use natpmpd::firewall::{Firewall, MemoryFirewall, NftFirewall};
use natpmpd::protocol::{MapRequest, Request, Response, Transport, SERVER_PORT};
use natpmpd::server::Daemon;
use natpmpd::telemetry::{init_logging, LogConfig, MetricsRegistry};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "natpmpd")]
#[command(about = "NAT-PMP responder driving nftables port forwards")]
struct Cli {
    /// Log at debug level regardless of the config file
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the NAT-PMP daemon
    Run {
        /// Path to the config file
        #[arg(short, long, default_value = "natpmpd.toml")]
        config: PathBuf,

        /// Record firewall changes in memory instead of calling nft
        #[arg(long)]
        dry_run: bool,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Send a single request to a NAT-PMP gateway
    Probe {
        /// Gateway address
        #[arg(short, long, default_value = "127.0.0.1")]
        gateway: Ipv4Addr,

        /// Gateway port
        #[arg(short, long, default_value_t = SERVER_PORT)]
        port: u16,

        /// Config file supplying the default lifetime
        #[arg(short, long, default_value = "natpmpd.toml")]
        config: PathBuf,

        #[command(subcommand)]
        request: ProbeRequest,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate a config file
    Validate {
        #[arg(short, long, default_value = "natpmpd.toml")]
        config: PathBuf,
    },
    /// Print the effective configuration, defaults included
    Show {
        #[arg(short, long, default_value = "natpmpd.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ProbeRequest {
    /// Ask for the external address
    Info,
    /// Create, refresh or (with --lifetime 0) delete a mapping
    Map {
        #[arg(long, value_enum, default_value_t = ProtocolArg::Tcp)]
        protocol: ProtocolArg,

        #[arg(long)]
        internal_port: u16,

        /// Defaults to the internal port
        #[arg(long, default_value_t = 0)]
        external_port: u16,

        /// Defaults to default_lifetime from the config file
        #[arg(long)]
        lifetime: Option<u32>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Udp,
    Tcp,
}

impl From<ProtocolArg> for Transport {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Udp => Transport::Udp,
            ProtocolArg::Tcp => Transport::Tcp,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Run { config, dry_run }) => cmd_run(&config, dry_run, cli.verbose),
        Some(Commands::Config { action }) => match action {
            ConfigAction::Validate { config } => cmd_config_validate(&config),
            ConfigAction::Show { config } => cmd_config_show(&config),
        },
        Some(Commands::Probe {
            gateway,
            port,
            config,
            request,
        }) => cmd_probe(SocketAddr::from((gateway, port)), &config, request, cli.verbose),
        None => cmd_run(Path::new("natpmpd.toml"), false, cli.verbose),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        return Ok(Config::default());
    }
    config::load(path).map_err(|e| format!("Failed to load {}: {}", path.display(), e))
}

fn cmd_run(config_path: &Path, dry_run: bool, verbose: bool) -> Result<(), String> {
    let mut cfg = load_config(config_path)?;
    cfg.dry_run |= dry_run;

    let log = if verbose { cfg.log.verbose() } else { cfg.log.clone() };
    init_logging(Some(&log));

    if !config_path.exists() {
        warn!("{} not found, using defaults", config_path.display());
    }
    let validation = config::validate(&cfg);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if validation.has_errors() {
        validation.print_diagnostics();
        return Err("Invalid configuration".to_string());
    }

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;
    rt.block_on(async move {
        let metrics = Arc::new(MetricsRegistry::new());
        if cfg.dry_run {
            info!("Dry run: firewall changes stay in memory");
            serve(cfg, MemoryFirewall::new(), metrics).await
        } else {
            let firewall = NftFirewall::new(&cfg, metrics.clone());
            serve(cfg, firewall, metrics).await
        }
    })
}

async fn serve<F: Firewall>(
    cfg: Config,
    firewall: F,
    metrics: Arc<MetricsRegistry>,
) -> Result<(), String> {
    let daemon = Daemon::start(cfg, firewall, metrics.clone())
        .await
        .map_err(|e| format!("Failed to start: {}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    daemon
        .run(shutdown_rx)
        .await
        .map_err(|e| format!("Server error: {}", e))?;

    info!("Final metrics:\n{}", metrics.render());
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn cmd_config_validate(config_path: &Path) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}

fn cmd_config_show(config_path: &Path) -> Result<(), String> {
    let cfg = load_config(config_path)?;
    let rendered = config::render(&cfg).map_err(|e| e.to_string())?;
    print!("{}", rendered);
    Ok(())
}

fn cmd_probe(
    gateway: SocketAddr,
    config_path: &Path,
    request: ProbeRequest,
    verbose: bool,
) -> Result<(), String> {
    let log = if verbose { LogConfig::new().verbose() } else { LogConfig::new() };
    init_logging(Some(&log));
    let cfg = load_config(config_path)?;

    let request = match request {
        ProbeRequest::Info => Request::Info,
        ProbeRequest::Map {
            protocol,
            internal_port,
            external_port,
            lifetime,
        } => Request::Map(MapRequest {
            transport: protocol.into(),
            internal_port,
            external_port,
            lifetime: lifetime.unwrap_or(cfg.default_lifetime),
        }),
    };

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;
    let response = rt.block_on(async {
        let client = Client::connect(gateway).await?;
        client.request(&request).await
    });
    let response = response.map_err(|e| format!("Probe failed: {}", e))?;

    match response {
        Response::Info {
            epoch,
            external_address,
        } => println!("external address {} (epoch {})", external_address, epoch),
        Response::Map {
            transport,
            epoch,
            internal_port,
            external_port,
            lifetime,
        } => println!(
            "{} external :{} -> internal :{} lifetime {}s (epoch {})",
            transport, external_port, internal_port, lifetime, epoch
        ),
        Response::Error { result, epoch, .. } => {
            return Err(format!("gateway answered {} (epoch {})", result, epoch));
        }
    }
    Ok(())
}
