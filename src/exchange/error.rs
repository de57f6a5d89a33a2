//! Exchange error taxonomy
//!
//! Every failure mode of the client terminates as a value of this type.
//! The trading loop iterates over many accounts per tick; a single bad
//! response must never unwind past the operation that produced it.

use thiserror::Error;

/// Structured exchange client errors
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// API secret does not decode to a valid 32-byte Ed25519 seed.
    /// Fatal at client construction, never retried.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Connection reset/refused/timeout-class failure. The only retryable
    /// kind; triggers proxy rotation.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Retry budget exhausted on transport failures.
    #[error("proxy failure after {attempts} attempts: {message}")]
    ProxyFailure { attempts: u32, message: String },

    /// Response body is not parseable JSON.
    #[error("invalid json in response: {0}")]
    InvalidJson(String),

    /// JSON parsed but does not match the expected response shape.
    #[error("unexpected response shape: {0}")]
    InvalidResponseShape(String),

    /// The exchange reported a business error. A normal outcome the
    /// caller branches on, not an exceptional one.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Directory has no free proxy to rotate to. Non-fatal.
    #[error("no free proxy available for account {account_id}")]
    NoFreeProxy { account_id: i64 },

    /// Anything else, caught once and converted.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ExchangeError {
    /// Classify a reqwest error. Connect failures and timeouts are
    /// transport-class: a dead or black-holing proxy looks like either.
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Transport("request timed out".to_string())
        } else if err.is_connect() {
            ExchangeError::Transport(format!("connection failed: {err}"))
        } else if err.is_request() || err.is_body() {
            ExchangeError::Transport(format!("request aborted: {err}"))
        } else {
            ExchangeError::Unexpected(err.to_string())
        }
    }

    /// Whether the retry policy may re-attempt after rotating the proxy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transport(_))
    }
}
