//! Error taxonomy for the monitoring engine.
//!
//! Every variant is scoped to a single trip or a single subscriber; none of
//! them is allowed to stop the scheduler loop.

use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq)]
pub enum MonitorError {
    /// The route has no usable geometry. Deviation checks are skipped.
    #[error("code: invalid_route, description: {0}")]
    InvalidRoute(String),

    /// The sample is not newer than the last evaluated one.
    #[error("code: stale_position, description: {0}")]
    StalePosition(String),

    /// The sample itself is malformed (coordinates or speed out of range).
    #[error("code: invalid_position, description: {0}")]
    InvalidPosition(String),

    /// Position, route or trip list could not be fetched.
    #[error("code: upstream_fetch_failure, description: {0}")]
    UpstreamFetchFailure(String),

    /// A subscriber could not accept an event.
    #[error("code: publish_failure, description: {0}")]
    PublishFailure(String),

    /// Alert sink or state repository write failed.
    #[error("code: persistence, description: {0}")]
    Persistence(String),

    #[error("code: config, description: {0}")]
    Config(String),
}

impl MonitorError {
    /// Returns the error code.
    #[must_use]
    pub const fn code(&self) -> &str {
        match self {
            Self::InvalidRoute(_) => "invalid_route",
            Self::StalePosition(_) => "stale_position",
            Self::InvalidPosition(_) => "invalid_position",
            Self::UpstreamFetchFailure(_) => "upstream_fetch_failure",
            Self::PublishFailure(_) => "publish_failure",
            Self::Persistence(_) => "persistence",
            Self::Config(_) => "config",
        }
    }
}

impl From<anyhow::Error> for MonitorError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(inner) = err.downcast_ref::<Self>() {
            return inner.clone();
        }
        let stack = err.chain().fold(String::new(), |cause, e| format!("{cause} -> {e}"));
        Self::UpstreamFetchFailure(stack.trim_start_matches(" -> ").to_string())
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        Self::UpstreamFetchFailure(err.to_string())
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use anyhow::{Context, anyhow};

    use super::*;

    #[test]
    fn test_code_matches_display_prefix() {
        let err = MonitorError::StalePosition("older than last".to_string());
        assert_eq!(err.code(), "stale_position");
        assert_eq!(err.to_string(), "code: stale_position, description: older than last");
    }

    #[test]
    fn test_anyhow_chain_becomes_upstream_failure() {
        let result =
            Err::<(), anyhow::Error>(anyhow!("connection reset")).context("fetching trips");
        let err: MonitorError = result.unwrap_err().into();

        assert_eq!(
            err.to_string(),
            "code: upstream_fetch_failure, description: fetching trips -> connection reset"
        );
    }

    #[test]
    fn test_anyhow_wrapping_monitor_error_is_preserved() {
        let err: MonitorError =
            anyhow::Error::new(MonitorError::InvalidRoute("one waypoint".to_string())).into();
        assert_eq!(err, MonitorError::InvalidRoute("one waypoint".to_string()));
    }
}
