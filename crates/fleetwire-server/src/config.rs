use std::env;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub auth_token: String,
    pub namespace: String,
    pub listen_addr: String,
    pub tls: Option<TlsConfig>,
    pub join_api: JoinApiConfig,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone)]
pub struct JoinApiConfig {
    pub url: String,
    pub token: String,
    pub cluster_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },
}

fn require_env(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingEnvVar { var })
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let tls = if env::var("FLEETWIRE_ENABLE_TLS").is_ok_and(|v| parse_flag(&v)) {
            Some(TlsConfig {
                cert_file: require_env("FLEETWIRE_TLS_CERT")?,
                key_file: require_env("FLEETWIRE_TLS_KEY")?,
            })
        } else {
            None
        };

        Ok(Self {
            auth_token: require_env("FLEETWIRE_TOKEN")?,
            namespace: env::var("FLEETWIRE_NAMESPACE")
                .unwrap_or_else(|_| "fleetwire".to_string()),
            listen_addr: env::var("FLEETWIRE_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            tls,
            join_api: JoinApiConfig {
                url: require_env("JOIN_API_URL")?,
                token: require_env("JOIN_API_TOKEN")?,
                cluster_id: env::var("JOIN_CLUSTER_ID").ok(),
            },
        })
    }
}
