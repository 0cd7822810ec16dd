//! Error types for lspipe

use thiserror::Error;

pub type LspipeResult<T> = std::result::Result<T, LspipeError>;

#[derive(Debug, Error)]
pub enum LspipeError {
    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Malformed header block. Fatal to the decoder that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),

    #[error("Header block is not valid ASCII")]
    InvalidHeader,

    #[error("Payload of {length} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { length: usize, limit: usize },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Process has already exited")]
    ProcessExited,

    #[error("Stdin pipe is closed")]
    PipeClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Write failed: {0}")]
    Write(#[from] WriteError),

    #[error("Process exited unexpectedly (code: {code:?}, signal: {signal:?})")]
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("Transport was stopped")]
    Cancelled,

    #[error("Transport has not been started")]
    NotStarted,

    #[error("Transport is already started")]
    AlreadyStarted,
}

impl TransportError {
    /// True when the failure is permanent for this transport instance.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::AlreadyStarted)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("'{method}' timed out. The server may be busy or unresponsive")]
    Timeout { method: String },

    #[error("Server error [{code}]: {message}")]
    Server { code: i32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    pub fn error_code(&self) -> i32 {
        use crate::infra::lsp::protocol::error_codes;

        match self {
            Self::Server { code, .. } => *code,
            Self::Transport(TransportError::Cancelled) => error_codes::REQUEST_CANCELLED,
            Self::Transport(_) => error_codes::SERVER_TERMINATED,
            Self::Timeout { .. } => error_codes::REQUEST_TIMEOUT,
            Self::Protocol(_) | Self::Json(_) => error_codes::PARSE_ERROR,
        }
    }

    /// True when the underlying connection is gone and no further request can succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_terminal())
    }
}

impl From<crate::infra::lsp::protocol::ResponseError> for ClientError {
    fn from(err: crate::infra::lsp::protocol::ResponseError) -> Self {
        Self::Server {
            code: err.code,
            message: err.message,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_exit_is_terminal() {
        let err = ClientError::Transport(TransportError::UnexpectedExit {
            code: Some(1),
            signal: None,
        });
        assert!(err.is_terminal());
        assert_eq!(err.error_code(), -32099);
    }

    #[test]
    fn test_not_started_is_not_terminal() {
        let err = ClientError::Transport(TransportError::NotStarted);
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_cancelled_error_code() {
        let err = ClientError::Transport(TransportError::Cancelled);
        assert_eq!(err.error_code(), -32800);
    }

    #[test]
    fn test_timeout_and_protocol_error_codes() {
        let timeout = ClientError::Timeout {
            method: "textDocument/hover".to_string(),
        };
        assert_eq!(timeout.error_code(), -32001);
        assert_eq!(ClientError::Protocol("bad".into()).error_code(), -32700);
    }

    #[test]
    fn test_server_error_from_response() {
        let err: ClientError = crate::infra::lsp::protocol::ResponseError {
            code: -32601,
            message: "Method not found".to_string(),
            data: None,
        }
        .into();
        assert_eq!(err.error_code(), -32601);
        assert!(!err.is_terminal());
        assert_eq!(err.to_string(), "Server error [-32601]: Method not found");
    }

    #[test]
    fn test_framing_error_message() {
        let err = TransportError::from(FramingError::InvalidContentLength("abc".into()));
        assert_eq!(err.to_string(), "Framing error: Invalid Content-Length value: \"abc\"");
    }
}
