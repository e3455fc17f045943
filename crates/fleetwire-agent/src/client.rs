//! Client side of the registration rpc.

use std::net::SocketAddr;

use thiserror::Error;
use tonic::transport::{ClientTlsConfig, Endpoint};
use tracing::info;

use fleetwire_proto::registrar_client::RegistrarClient;
use fleetwire_proto::{RegisterRequest, RegisterResponse};
use fleetwire_wg::LISTEN_PORT;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to reach registrar: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("registration rejected: {0}")]
    Rejected(#[from] tonic::Status),

    #[error("cannot resolve wireguard endpoint {target:?}: {reason}")]
    Endpoint { target: String, reason: String },
}

/// Call `Register` on the registrar at `server` (a `host:port` pair),
/// presenting the persisted device id (empty on first boot) and the fleet
/// auth token.
pub async fn register(
    server: &str,
    enable_tls: bool,
    id: String,
    auth_token: String,
) -> Result<RegisterResponse, ClientError> {
    let scheme = if enable_tls { "https" } else { "http" };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{server}"))?;
    if enable_tls {
        endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
    }

    info!(server, tls = enable_tls, "registering with registrar");
    let channel = endpoint.connect().await?;
    let response = RegistrarClient::new(channel)
        .register(RegisterRequest { id, auth_token })
        .await?;

    Ok(response.into_inner())
}

/// The wireguard endpoint to dial: an explicit override when one was given,
/// otherwise the registrar's host on the standard wireguard port.
pub async fn wg_endpoint(
    server: &str,
    override_endpoint: Option<&str>,
) -> Result<SocketAddr, ClientError> {
    let target = match override_endpoint {
        Some(endpoint) => endpoint.to_string(),
        None => {
            let host = server.rsplit_once(':').map_or(server, |(host, _)| host);
            format!("{host}:{LISTEN_PORT}")
        }
    };

    let mut addrs = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|e| ClientError::Endpoint {
            target: target.clone(),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| ClientError::Endpoint {
        target,
        reason: "resolved to no addresses".to_string(),
    })
}
