//! Error types for the fleet command layer.

use thiserror::Error;

use crate::session::AgentId;

/// Failures while turning a command into bytes (or, for the simulated agent,
/// bytes back into a command).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// A numeric argument was NaN or infinite.
    #[error("non-finite argument `{field}` ({value})")]
    NonFinite { field: &'static str, value: f64 },

    /// A vector argument had the wrong number of components.
    #[error("expected {expected} components, got {actual}")]
    WrongArity { expected: usize, actual: usize },

    /// The first byte does not name a known command.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    /// The frame ended before all arguments were read.
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

/// Failures reported by the byte transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link is closed or the radio is gone.
    #[error("link down")]
    LinkDown,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Formation planning failures. Always recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormationError {
    #[error("unsupported formation `{0}` (available: line, circle, triangle)")]
    Unsupported(String),

    #[error("formation `{pattern}` needs at least {need} agents, have {have}")]
    TooFewAgents {
        pattern: &'static str,
        need: usize,
        have: usize,
    },
}

/// Top-level error for fleet operations.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The target agent has no open session.
    #[error("Not connected")]
    NotConnected(AgentId),

    /// The request was missing fields or carried invalid values.
    #[error("{0}")]
    Malformed(String),

    #[error("encode error: {0}")]
    Encode(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Formation(#[from] FormationError),
}

impl FleetError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// True for faults that belong to a single agent and must not abort the
    /// rest of a batch.
    pub fn is_per_agent(&self) -> bool {
        matches!(
            self,
            Self::NotConnected(_) | Self::Encode(_) | Self::Transport(_)
        )
    }
}

/// Result type alias for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_renders_protocol_text() {
        let err = FleetError::NotConnected(AgentId::new(7).unwrap());
        assert_eq!(err.to_string(), "Not connected");
        assert!(err.is_per_agent());
    }

    #[test]
    fn malformed_is_not_per_agent() {
        let err = FleetError::malformed("missing field `id`");
        assert!(!err.is_per_agent());
        assert_eq!(err.to_string(), "missing field `id`");
    }

    #[test]
    fn formation_failure_keeps_planner_text() {
        let err = FleetError::from(FormationError::Unsupported("star".into()));
        assert!(!err.is_per_agent());
        assert!(err.to_string().starts_with("unsupported formation `star`"));
    }
}
