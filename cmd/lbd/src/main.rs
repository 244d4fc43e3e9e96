use clap::{Parser, Subcommand};
use pkg_constants::network::DEFAULT_LINK_PREFIX;
use pkg_constants::paths::{DEFAULT_DAEMON_CONFIG, DEFAULT_DATA_DIR};
use pkg_controllers::Reconciler;
use pkg_proxy::{EndpointController, Forwarder, Ipvsadm, MemoryForwarder, MemoryLink, Proxy};
use pkg_state::Registry;
use pkg_state::client::StateStore;
use pkg_types::config::{DaemonConfigFile, ProxyMode, load_config_file};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lbd", about = "Cluster state reconciler and IPVS load balancer")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_DAEMON_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Name prefix of the link VIPs are bound to
    #[arg(long)]
    link_prefix: Option<String>,

    /// Forwarder backend: ipvs or memory
    #[arg(long)]
    proxy: Option<ProxyMode>,

    /// Apply endpoint manifests stored in the registry
    #[arg(long)]
    endpoints: Option<bool>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: Option<bool>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore state and reconcile until interrupted (default)
    Run,
    /// Print the live forwarder inventory as JSON and exit
    Info,
}

/// Effective settings: CLI args > config file > defaults.
#[derive(Debug)]
struct Settings {
    data_dir: String,
    link_prefix: String,
    proxy: ProxyMode,
    endpoints: bool,
    log_json: bool,
}

impl Settings {
    fn merge(cli: &Cli, file: DaemonConfigFile) -> Self {
        Self {
            data_dir: cli
                .data_dir
                .clone()
                .or(file.data_dir)
                .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            link_prefix: cli
                .link_prefix
                .clone()
                .or(file.link_prefix)
                .unwrap_or_else(|| DEFAULT_LINK_PREFIX.to_string()),
            proxy: cli.proxy.or(file.proxy).unwrap_or_default(),
            endpoints: cli.endpoints.or(file.endpoints).unwrap_or(true),
            log_json: cli.log_json.or(file.log_json).unwrap_or(false),
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn build_proxy(settings: &Settings) -> anyhow::Result<Proxy> {
    match settings.proxy {
        ProxyMode::Ipvs => {
            let forwarder: Arc<dyn Forwarder> = Arc::new(Ipvsadm::default());
            Ok(Proxy::discover(forwarder, &settings.link_prefix).await?)
        }
        ProxyMode::Memory => {
            let link = format!("{}0", settings.link_prefix);
            Ok(Proxy::new(
                Arc::new(MemoryForwarder::new()),
                Some(Arc::new(MemoryLink::new(link))),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: DaemonConfigFile = load_config_file(&cli.config)?;
    let settings = Settings::merge(&cli, file_cfg);
    init_logging(settings.log_json);
    info!("Config file: {}", cli.config);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::Info => {
            let proxy = build_proxy(&settings).await?;
            let inventory = proxy.info().await?;
            println!("{}", serde_json::to_string_pretty(&inventory)?);
            Ok(())
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!("Starting lbd");
    info!("  Data dir:    {}", settings.data_dir);
    info!("  Proxy:       {:?}", settings.proxy);
    info!("  Link prefix: {}", settings.link_prefix);
    info!("  Endpoints:   {}", settings.endpoints);

    let store = StateStore::new(&settings.data_dir).await?;
    let registry = Registry::new(store.clone());
    let cancel = CancellationToken::new();

    let state = Reconciler::new(registry.clone()).restore(cancel.clone()).await?;
    info!(
        "Restored {} services",
        state.handle().services().await?.len()
    );

    let endpoints = if settings.endpoints {
        let proxy = Arc::new(build_proxy(&settings).await?);
        let controller = EndpointController::new(registry.clone(), proxy);
        let token = cancel.child_token();
        Some(tokio::spawn(async move {
            if let Err(e) = controller.run(token).await {
                error!("EndpointController failed: {:#}", e);
            }
        }))
    } else {
        None
    };

    // Block until Ctrl-C
    info!("lbd is running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down lbd");

    cancel.cancel();
    state.shutdown().await;
    if let Some(task) = endpoints {
        task.await?;
    }
    store.close().await?;

    Ok(())
}
