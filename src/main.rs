use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vpa_graceful_drain::controller::{
    self, leader, resolve_config, ConfigSource, ControllerState, KubeCluster,
};
use vpa_graceful_drain::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version information
    Version,
    /// Fetch and validate the configuration ConfigMap once
    CheckConfig(ConfigArgs),
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Name of the configuration ConfigMap
    #[arg(long, env = "CONFIG_MAP_NAME", default_value = "vpa-graceful-drain-config")]
    config_map_name: String,

    /// Namespace of the configuration ConfigMap
    #[arg(
        long,
        env = "CONFIG_MAP_NAMESPACE",
        default_value = "vpa-graceful-drain-system"
    )]
    config_map_namespace: String,

    /// Deadline for each Kubernetes API call, in seconds
    #[arg(long, env = "API_TIMEOUT_SECS", default_value_t = 10)]
    api_timeout_secs: u64,
}

impl ConfigArgs {
    fn source(&self) -> ConfigSource {
        ConfigSource {
            namespace: self.config_map_namespace.clone(),
            name: self.config_map_name.clone(),
        }
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Only act while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Listen address for /healthz, /readyz and /metrics
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("vpa-graceful-drain v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::CheckConfig(config_args) => run_check_config(config_args).await,
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn run_check_config(args: ConfigArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    let cluster = KubeCluster::new(client, Duration::from_secs(args.api_timeout_secs));

    let config = resolve_config(&cluster, &args.source()).await?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);

    info!(
        "Starting vpa-graceful-drain controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let cluster = Arc::new(KubeCluster::new(
        client.clone(),
        Duration::from_secs(args.config.api_timeout_secs),
    ));
    let mut state = ControllerState::new(cluster, args.config.source());

    if args.leader_elect {
        let lease_namespace = std::env::var("POD_NAMESPACE")
            .unwrap_or_else(|_| args.config.config_map_namespace.clone());
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });

        let is_leader = Arc::new(AtomicBool::new(false));
        tokio::spawn(leader::run_leader_election(
            client.clone(),
            lease_namespace,
            holder_identity,
            Arc::clone(&is_leader),
        ));
        state = state.with_leader_flag(is_leader);
    }

    #[cfg(feature = "rest-api")]
    let probe_state = {
        use vpa_graceful_drain::rest_api::{run_server, ProbeState};

        let probe_state = Arc::new(ProbeState::default());
        let server_state = Arc::clone(&probe_state);
        let addr = args.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_server(addr, server_state).await {
                tracing::error!("Health server error: {:?}", e);
            }
        });
        probe_state
    };
    #[cfg(not(feature = "rest-api"))]
    let _ = args.health_addr;

    #[cfg(feature = "rest-api")]
    probe_state.set_ready(true);

    controller::run_controller(client, Arc::new(state)).await
}
