use thiserror::Error;

/// Errors surfaced by a telephony provider implementation
///
/// Providers are external systems, so every variant here is something the
/// coordination layer must expect during normal operation and either retry,
/// compensate for, or ignore.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider could not be reached or refused the request outright.
    ///
    /// Callers retry with bounded backoff, then surface the failure and
    /// compensate.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The provider reached the destination but the request was rejected
    /// (busy destination, invalid target, policy refusal).
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    /// The referenced call leg no longer exists on the provider side.
    ///
    /// The call may have been resolved through another path already;
    /// callers treat this as a recoverable no-op.
    #[error("Call leg not found: {0}")]
    LegNotFound(String),
}

impl ProviderError {
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn rejected<S: Into<String>>(msg: S) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn leg_not_found<S: Into<String>>(msg: S) -> Self {
        Self::LegNotFound(msg.into())
    }

    /// Whether a retry against the provider can possibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;
