use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use one_cloud_provider::{
    config::Config,
    controller::{self, ControllerState},
    provider::{ProviderRegistry, OPENNEBULA},
    Error,
};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the LoadBalancer controller
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the cloud configuration YAML
    #[arg(long, env = "CLOUD_CONFIG")]
    cloud_config: PathBuf,

    /// Cluster name used to derive router and reservation names
    #[arg(long, env = "CLUSTER_NAME", default_value = "kubernetes")]
    cluster_name: String,

    /// Load-balancer provider to build from the registry
    #[arg(long, env = "LB_PROVIDER", default_value = OPENNEBULA)]
    provider: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("one-cloud-controller v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run(run_args).await,
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn run(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);

    info!(
        "Starting one-cloud-controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_path(&args.cloud_config)?;
    let registry = ProviderRegistry::with_defaults();
    let provider = registry.build(&args.provider, &config)?;

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let state = Arc::new(ControllerState::new(client, provider, args.cluster_name));
    controller::run_controller(state).await
}
