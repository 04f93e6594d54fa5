//! Runtime configuration.

use serde::{Deserialize, Serialize};

use crate::error::SignalError;

/// Tunables of a [`Runtime`](crate::reactive::Runtime).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust,ignore
/// let config = SignalConfig::from_json(r#"{ "max_update_attempts": 5 }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Check structural invariants of every installed revision and log
    /// violations. On by default in debug builds.
    pub validate_revisions: bool,

    /// Give up a retrying update after this many rejected attempts.
    /// `None` retries until it succeeds or is cancelled.
    pub max_update_attempts: Option<usize>,

    /// Log rejected commands at debug level instead of trace.
    pub log_rejections: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            validate_revisions: cfg!(debug_assertions),
            max_update_attempts: None,
            log_rejections: false,
        }
    }
}

impl SignalConfig {
    pub fn from_json(json: &str) -> Result<Self, SignalError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SignalConfig::from_json(r#"{ "max_update_attempts": 5 }"#).unwrap();

        assert_eq!(config.max_update_attempts, Some(5));
        assert!(!config.log_rejections);
        assert_eq!(config.validate_revisions, cfg!(debug_assertions));
    }

    #[test]
    fn malformed_json_is_a_codec_error() {
        assert!(matches!(SignalConfig::from_json("{"), Err(SignalError::Codec(_))));
    }
}
