//! Crate-level error type
//!
//! Each subsystem has its own error enum; [`BridgeError`] wraps them for the
//! composition root. Broker and relay operations that cannot fail the caller
//! log instead of returning errors, so only construction, init and bind paths
//! produce these.

use crate::config::ConfigError;
use crate::relay::RelayError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("No configuration file found (tried {tried})")]
    ConfigNotFound { tried: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the process should exit with a configuration failure code
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Config(_) | BridgeError::ConfigNotFound { .. }
        )
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_errors_keep_their_message() {
        let error: BridgeError = MqttError::AmbiguousTransport.into();
        assert_eq!(
            error.to_string(),
            "MQTT error: TCP and WebSocket connections cannot be enabled together"
        );
        assert!(!error.is_configuration_error());

        let error: BridgeError =
            ConfigError::InvalidConfig("monitors.interval_secs must be greater than zero".into())
                .into();
        assert!(error.is_configuration_error());
    }

    #[test]
    fn test_internal_constructor() {
        let error = BridgeError::internal("unexpected state");
        assert_eq!(error.to_string(), "Internal error: unexpected state");
    }

    #[test]
    fn test_config_not_found() {
        let error = BridgeError::ConfigNotFound {
            tried: "iotlink.toml, config/iotlink.toml".to_string(),
        };
        assert!(error.is_configuration_error());
        assert!(error.to_string().contains("config/iotlink.toml"));
    }
}
