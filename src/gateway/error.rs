// =============================================================================
// Broker error taxonomy
// =============================================================================
//
// The gateway facade's only error type. Callers branch on the kind: rate
// limits and retryable transport failures may be retried (never order
// placement), auth failures trigger a token refresh or engine error, and
// business rejections surface to the originating component as "no action
// taken".
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Socket/TLS/HTTP-level failure before a broker response was read.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// Token grant or token validation failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The broker throttled us; back off before retrying the specific call.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The broker understood the request and said no (rejected order,
    /// insufficient funds, venue closed).
    #[error("broker rejected request (code {code}): {message}")]
    Business { code: i64, message: String },

    /// The response arrived but could not be interpreted.
    #[error("malformed broker payload: {0}")]
    DataQuality(String),
}

impl BrokerError {
    /// True when retrying the same call after a backoff is reasonable.
    /// Order placement is never auto-retried regardless of this flag.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transport(_))
    }
}
