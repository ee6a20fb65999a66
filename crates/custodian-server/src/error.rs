//! Custodian service startup errors

use coalition_tdf::config::ConfigError;
use coalition_tdf::credential::CredentialError;
use coalition_tdf::federation::{ChannelError, RegistryError};
use thiserror::Error;

/// Errors that stop the service from starting
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("trust registry: {0}")]
    Registry(#[from] RegistryError),

    /// Issuer key source could not be built
    #[error("issuer keys: {0}")]
    IssuerKeys(#[from] CredentialError),

    #[error("peer channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("peer signing key: {0}")]
    SigningKey(String),

    /// No issuer key file or URL configured
    #[error("no credential issuer keys configured; set issuerKeysPath or credential.issuerKeysUrl")]
    NoIssuerKeys,

    #[error("metrics exporter: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::Config(e) => e.error_code(),
            ServerError::Registry(e) => e.error_code(),
            ServerError::IssuerKeys(e) => e.error_code(),
            ServerError::Channel(e) => e.error_code(),
            ServerError::SigningKey(_) => "CTDF_E_SERVER_SIGNING_KEY",
            ServerError::NoIssuerKeys => "CTDF_E_SERVER_NO_ISSUER_KEYS",
            ServerError::Metrics(_) => "CTDF_E_SERVER_METRICS",
            ServerError::Io(_) => "CTDF_E_SERVER_IO",
        }
    }
}
