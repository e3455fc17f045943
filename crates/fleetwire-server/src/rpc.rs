//! The gRPC surface and the services the process runs.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use fleetwire_proto::registrar_server::{Registrar, RegistrarServer};
use fleetwire_proto::{RegisterRequest, RegisterResponse};
use fleetwire_wg::{CurrentWg, WgApi};

use crate::config::Config;
use crate::registry::{Registry, RegistryError};
use crate::runner::{Service, ServiceError};
use crate::store::{KubeStore, ObjectStore};
use crate::tokens::{JoinApiClient, TokenIssuer};

impl From<RegistryError> for Status {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::AuthenticationFailed => Status::unauthenticated(err.to_string()),
            RegistryError::NoActivePool | RegistryError::NoRegistrationToken => {
                Status::failed_precondition(err.to_string())
            }
            RegistryError::StorageUnavailable(_)
            | RegistryError::AllocationConflict(_)
            | RegistryError::IssuerUnavailable(_) => {
                error!(error = %err, "registration dependency unavailable");
                Status::unavailable(err.to_string())
            }
            RegistryError::PartialRegistration { .. } => {
                error!(error = %err, "registration left partial state");
                Status::internal(err.to_string())
            }
            _ => {
                error!(error = %err, "registration failed");
                Status::internal(err.to_string())
            }
        }
    }
}

/// Grpc handler delegating to the [`Registry`].
pub struct RegistrarRpc<S, W, T> {
    registry: Arc<Registry<S, W, T>>,
}

impl<S, W, T> RegistrarRpc<S, W, T> {
    pub fn new(registry: Arc<Registry<S, W, T>>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl<S, W, T> Registrar for RegistrarRpc<S, W, T>
where
    S: ObjectStore + 'static,
    W: WgApi + 'static,
    T: TokenIssuer + 'static,
{
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let response = self.registry.register(request.into_inner()).await?;
        Ok(Response::new(response))
    }
}

/// The registrar endpoint as a runnable service: bootstraps the mesh from
/// the store, then serves [`Registrar`] until closed.
pub struct RpcService {
    config: Config,
    shutdown: CancellationToken,
}

impl RpcService {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    async fn tls_config(&self) -> Result<Option<ServerTlsConfig>, ServiceError> {
        let Some(tls) = &self.config.tls else {
            warn!("TLS disabled, serving registration traffic in the clear");
            return Ok(None);
        };
        let cert = tokio::fs::read(&tls.cert_file).await?;
        let key = tokio::fs::read(&tls.key_file).await?;
        Ok(Some(
            ServerTlsConfig::new().identity(Identity::from_pem(cert, key)),
        ))
    }
}

#[async_trait]
impl Service for RpcService {
    fn name(&self) -> &'static str {
        "registrar-rpc"
    }

    async fn run(&self) -> Result<(), ServiceError> {
        let addr: SocketAddr = self.config.listen_addr.parse()?;

        let client = kube::Client::try_default().await?;
        let store = KubeStore::new(client, self.config.namespace.as_str());
        let issuer = JoinApiClient::new(self.config.join_api.clone());
        let registry = Registry::bootstrap(
            store,
            CurrentWg::default(),
            issuer,
            self.config.auth_token.clone(),
        )
        .await?;

        let mut builder = Server::builder();
        if let Some(tls) = self.tls_config().await? {
            builder = builder.tls_config(tls)?;
        }

        info!(%addr, "registrar listening");
        builder
            .add_service(RegistrarServer::new(RegistrarRpc::new(Arc::new(registry))))
            .serve_with_shutdown(addr, self.shutdown.cancelled())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ServiceError> {
        self.shutdown.cancel();
        Ok(())
    }
}

/// Turns SIGINT/SIGTERM/SIGHUP into an orderly shutdown by failing, which
/// makes the runner close everything else.
pub struct SignalService {
    stop: CancellationToken,
}

impl SignalService {
    pub fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
        }
    }
}

impl Default for SignalService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service for SignalService {
    fn name(&self) -> &'static str {
        "signal-handler"
    }

    async fn run(&self) -> Result<(), ServiceError> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;

        tokio::select! {
            _ = interrupt.recv() => Err("received SIGINT".into()),
            _ = terminate.recv() => Err("received SIGTERM".into()),
            _ = hangup.recv() => Err("received SIGHUP".into()),
            _ = self.stop.cancelled() => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), ServiceError> {
        self.stop.cancel();
        Ok(())
    }
}
