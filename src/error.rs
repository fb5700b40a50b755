use thiserror::Error;

use crate::rules::ParseError;

/// Core error types for lanlock
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lan-access rule string failed validation
    #[error("lan-access rule {index} ({rule:?}): {source}")]
    Rule {
        index: usize,
        rule: String,
        source: ParseError,
    },

    /// External command exited non-zero; carries captured combined output
    /// because an exit code alone is rarely actionable.
    #[error("{program} failed: {output}")]
    Command {
        program: String,
        output: String,
        code: Option<i32>,
    },

    /// Privilege escalation failed
    #[error("elevation error: {0}")]
    Elevation(#[from] crate::exec::ElevationError),

    /// The VM network helper container is required but not running
    #[error("network helper container is not running; install the network helper first")]
    HelperNotInstalled,

    /// Internal logic error
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_error_mentions_index_and_raw() {
        let err = Error::Rule {
            index: 3,
            rule: "tcp://bogus".to_string(),
            source: ParseError::InvalidIp("bogus".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains("tcp://bogus"));
        assert!(msg.contains("bogus"));
    }

    #[test]
    fn test_command_error_carries_output() {
        let err = Error::Command {
            program: "nft".to_string(),
            output: "Error: syntax error".to_string(),
            code: Some(1),
        };
        assert!(err.to_string().contains("syntax error"));
    }
}
