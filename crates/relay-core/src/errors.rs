/// Provider-independent category of an upstream rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AuthFailure,
    QuotaExhausted,
    RateLimited,
    Malformed,
    Unavailable,
    Unknown,
}

impl ErrorCategory {
    /// Stable snake_case name used on the client wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailure => "auth_failure",
            Self::QuotaExhausted => "quota_exhausted",
            Self::RateLimited => "rate_limited",
            Self::Malformed => "malformed",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a relay session, sent as the single error event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayFailure {
    /// Request fields were missing or invalid; no upstream call was made.
    #[error("invalid request: {message}")]
    ClientInput { message: String },
    /// Relay configuration is incomplete (for example a missing credential).
    #[error("configuration error: {message}")]
    Configuration { message: String },
    /// Upstream rejected the request or the session ran out of time.
    #[error("upstream {category}: {message}")]
    Upstream {
        category: ErrorCategory,
        message: String,
    },
    /// Network failure while opening or reading the upstream stream.
    #[error("transport error: {message}")]
    Transport { message: String },
}

impl RelayFailure {
    pub fn client_input(message: impl Into<String>) -> Self {
        Self::ClientInput {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn upstream(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Upstream {
            category,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Category string carried by the wire error event.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ClientInput { .. } => "client_input",
            Self::Configuration { .. } => "configuration",
            Self::Upstream { category, .. } => category.as_str(),
            Self::Transport { .. } => "transport",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::ClientInput { message }
            | Self::Configuration { message }
            | Self::Upstream { message, .. }
            | Self::Transport { message } => message,
        }
    }
}

/// Frame decoder failures. Only buffer overflow is fatal; malformed lines are
/// skipped by the extractor instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("upstream line exceeded {limit} bytes without a line break")]
    LineTooLong { limit: usize },
}

impl From<DecodeError> for RelayFailure {
    fn from(value: DecodeError) -> Self {
        RelayFailure::transport(value.to_string())
    }
}

/// Top-level error type for the public relay API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Invalid relay configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Authentication rejected the presented token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Session ended with a terminal error event.
    #[error(transparent)]
    Failed(RelayFailure),
    /// Session was cancelled (client disconnect or abort) before a terminal event.
    #[error("cancelled")]
    Cancelled,
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<RelayFailure> for RelayError {
    fn from(value: RelayFailure) -> Self {
        RelayError::Failed(value)
    }
}
