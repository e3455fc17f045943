//! Client for the external join-token issuer.
//!
//! Registration responses hand each device a cluster join token. Tokens are
//! minted by a separate service; this module fetches them over its REST API.

use serde::Deserialize;
use thiserror::Error;

use crate::config::JoinApiConfig;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to reach token issuer: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token issuer returned {status}: {body}")]
    IssuerError {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// One join token as the issuer returns it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinToken {
    pub cluster_id: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct JoinTokenList {
    data: Vec<JoinToken>,
}

/// Source of cluster join tokens.
pub trait TokenIssuer: Send + Sync {
    fn fetch_tokens(&self) -> impl Future<Output = Result<Vec<JoinToken>, TokenError>> + Send;
}

/// [`TokenIssuer`] backed by the issuer's HTTP API.
pub struct JoinApiClient {
    client: reqwest::Client,
    config: JoinApiConfig,
}

impl JoinApiClient {
    pub fn new(config: JoinApiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

impl TokenIssuer for JoinApiClient {
    #[tracing::instrument(skip(self))]
    async fn fetch_tokens(&self) -> Result<Vec<JoinToken>, TokenError> {
        let url = format!("{}/v1/registration-tokens", self.config.url);
        let mut req = self.client.get(url).bearer_auth(&self.config.token);
        if let Some(cluster) = &self.config.cluster_id {
            req = req.query(&[("cluster", cluster)]);
        }

        let resp = req.send().await?;
        match resp.status() {
            reqwest::StatusCode::OK => {
                let list: JoinTokenList = resp.json().await?;
                Ok(list.data)
            }
            status => Err(TokenError::IssuerError {
                status,
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Pick the first usable token out of an issuer response.
pub fn first_token(tokens: &[JoinToken]) -> Option<&str> {
    tokens
        .iter()
        .map(|t| t.token.as_str())
        .find(|t| !t.is_empty())
}
