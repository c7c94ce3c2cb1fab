use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure reason persisted on a failed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    /// The provider was reached but rejected the credentials or the model.
    ConfigError,
    /// Provider settings failed local validation before any network call.
    ConfigInvalid,
    Unknown,
}

impl ErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigError => "CONFIG_ERROR",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider '{provider}' settings invalid: {problem}")]
pub struct ConfigInvalid {
    pub provider: String,
    pub problem: String,
}

impl ConfigInvalid {
    pub fn new(provider: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            problem: problem.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorCode {
    NotFound,
    InvalidParameter,
    Error,
}

impl ServiceErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidParameter => "invalid_parameter",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ServiceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous rejection of a chat or message operation.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: ServiceErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: ServiceErrorCode::NotFound,
            message: message.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self {
            code: ServiceErrorCode::InvalidParameter,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ServiceErrorCode::Error,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::error(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ConfigInvalid, ErrorReason, ServiceError, ServiceErrorCode};

    #[test]
    fn error_reason_serializes_as_wire_code() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_value(ErrorReason::ConfigError)?, json!("CONFIG_ERROR"));
        assert_eq!(
            serde_json::from_value::<ErrorReason>(json!("CONFIG_INVALID"))?,
            ErrorReason::ConfigInvalid
        );
        assert_eq!(ErrorReason::Unknown.to_string(), "UNKNOWN");
        Ok(())
    }

    #[test]
    fn config_invalid_survives_anyhow_round_trip() {
        let err = anyhow::Error::new(ConfigInvalid::new("fal", "missing required key 'apiKey'"))
            .context("fal generation failed");
        let found = err.chain().find_map(|cause| cause.downcast_ref::<ConfigInvalid>());
        assert_eq!(found.map(|value| value.provider.as_str()), Some("fal"));
    }

    #[test]
    fn internal_failures_map_to_error_code() {
        let err: ServiceError = anyhow::anyhow!("store offline").into();
        assert_eq!(err.code, ServiceErrorCode::Error);
        assert_eq!(err.to_string(), "error: store offline");
    }
}
