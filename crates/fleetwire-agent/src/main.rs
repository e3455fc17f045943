mod client;
mod identity;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use fleetwire_types::{PrivateKey, PublicKey};
use fleetwire_wg::{ClientConfig, CurrentWg, start_client};

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
#[command(about = "Registers this device with a fleetwire server and joins the mesh")]
struct Args {
    /// Registrar to register with, as host:port
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    server: String,

    /// Fleet auth token; read from FLEETWIRE_TOKEN when omitted
    #[arg(short, long)]
    token: Option<String>,

    /// Talk to the registrar over TLS
    #[arg(long)]
    enable_tls: bool,

    /// Directory holding the device id and join environment
    #[arg(long, default_value = "/etc/fleetwire")]
    state_dir: PathBuf,

    /// Wireguard endpoint to dial, host:port; derived from the registrar
    /// host when omitted
    #[arg(long)]
    wg_endpoint: Option<String>,

    /// Cluster URL recorded in the join environment
    #[arg(long)]
    cluster_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let token = match args.token {
        Some(token) => token,
        None => std::env::var("FLEETWIRE_TOKEN")
            .map_err(|_| "no auth token: pass --token or set FLEETWIRE_TOKEN")?,
    };

    let id = identity::load_id(&args.state_dir).await?.unwrap_or_default();
    if id.is_empty() {
        info!("no persisted device id, the server will assign one");
    }

    let response = client::register(&args.server, args.enable_tls, id, token).await?;
    identity::save_id(&args.state_dir, &response.id).await?;
    info!(device = %response.id, ip = %response.ip_address, "registered");

    let config = ClientConfig {
        private_key: PrivateKey::from_base64(&response.key)?,
        address: response.ip_address.parse()?,
        server_public_key: PublicKey::from_base64(&response.server_public_key)?,
        server_endpoint: client::wg_endpoint(&args.server, args.wg_endpoint.as_deref())
            .await?,
    };
    let interface = start_client(&CurrentWg::default(), &config).await?;
    info!(interface = %interface, "mesh tunnel up");

    let env_path = identity::write_join_env(
        &args.state_dir,
        args.cluster_url.as_deref(),
        &response.cluster_token,
    )
    .await?;
    info!(path = %env_path.display(), "cluster join parameters written");

    Ok(())
}
