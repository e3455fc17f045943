use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fleetwire_server::config::Config;
use fleetwire_server::rpc::{RpcService, SignalService};
use fleetwire_server::runner::{Runner, Service};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Fleet registration server for wireguard meshes")]
struct Args {
    /// Address to serve the registrar on, overriding the environment
    #[arg(short, long)]
    listen: Option<String>,

    /// Store namespace to operate in, overriding the environment
    #[arg(short, long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let mut config = Config::from_env().expect("failed to load configuration");
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }

    info!(addr = %config.listen_addr, namespace = %config.namespace, "starting fleetwire-server");

    let services: Vec<Arc<dyn Service>> = vec![
        Arc::new(RpcService::new(config)),
        Arc::new(SignalService::new()),
    ];

    if let Err(e) = Runner::new(services).run(CancellationToken::new()).await {
        error!(error = %e, "server stopped");
        return Err(e.into());
    }
    Ok(())
}
