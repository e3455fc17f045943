//! Small supervisor for the process' long-running services.
//!
//! Each [`Service`] runs on its own task. The first failure closes every
//! other service so the process can exit instead of limping along with half
//! its parts down.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

/// One long-running part of the process.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run until finished, failed, or closed.
    async fn run(&self) -> Result<(), ServiceError>;

    /// Ask a running service to stop. `run` returns shortly after.
    async fn close(&self) -> Result<(), ServiceError>;
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("shutdown requested")]
    Cancelled,

    #[error("service {name} failed: {source}")]
    Service {
        name: &'static str,
        #[source]
        source: ServiceError,
    },
}

pub struct Runner {
    services: Vec<Arc<dyn Service>>,
}

impl Runner {
    pub fn new(services: Vec<Arc<dyn Service>>) -> Self {
        Self { services }
    }

    /// Run every service to completion.
    ///
    /// Returns when all services finish on their own, when one fails (the
    /// rest are closed first), or when `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RunnerError> {
        let (tx, mut rx) = mpsc::channel(self.services.len().max(1));

        for service in &self.services {
            let service = Arc::clone(service);
            let tx = tx.clone();
            tokio::spawn(async move {
                info!(service = service.name(), "service starting");
                let result = service.run().await;
                // The receiver dropping mid-shutdown is fine.
                let _ = tx.send((service.name(), result)).await;
            });
        }
        drop(tx);

        let mut finished = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.close_all().await;
                    return Err(RunnerError::Cancelled);
                }
                completion = rx.recv() => match completion {
                    Some((name, Ok(()))) => {
                        info!(service = name, "service finished");
                        finished += 1;
                        if finished == self.services.len() {
                            return Ok(());
                        }
                    }
                    Some((name, Err(source))) => {
                        error!(service = name, error = %source, "service failed, closing the rest");
                        self.close_all().await;
                        return Err(RunnerError::Service { name, source });
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    async fn close_all(&self) {
        for service in &self.services {
            if let Err(e) = service.close().await {
                error!(service = service.name(), error = %e, "error closing service");
            }
        }
    }
}
