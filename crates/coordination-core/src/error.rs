use thiserror::Error;

/// Error types for call coordination operations
///
/// The first five variants are the coordination taxonomy proper: every one
/// of them is an expected outcome of concurrent operation, not a bug, and
/// callers are expected to match on them and recover. The remaining
/// variants cover the ambient failure modes (storage, configuration,
/// validation, internal invariants).
///
/// # Examples
///
/// ```
/// use parkline_coordination_core::{CoordinationError, Result};
///
/// fn retrieve() -> Result<()> {
///     Err(CoordinationError::not_found("parked call already taken"))
/// }
///
/// match retrieve() {
///     Ok(_) => println!("retrieved"),
///     Err(CoordinationError::NotFound(msg)) => println!("gone: {}", msg),
///     Err(e) => println!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Another agent already owns the call.
    ///
    /// Recoverable: the caller tears down any speculative call leg it
    /// already established and retracts its local view.
    #[error("Claim conflict: {0}")]
    ClaimConflict(String),

    /// The call, parked call, or agent record is missing or was already
    /// resolved by a concurrent actor. Recoverable no-op.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A provider alert or redirect failed after bounded retries.
    ///
    /// The caller surfaces the failure and compensates; application state
    /// has already been restored when this is returned.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A local optimistic update was superseded by an authoritative event.
    /// The caller discards its local state.
    #[error("Stale state: {0}")]
    StaleState(String),

    /// The shared datastore is unavailable.
    ///
    /// New transitions are refused rather than risking divergence; on
    /// ambiguity agents are reported busy rather than available.
    #[error("Datastore unreachable: {0}")]
    Unreachable(String),

    /// Database operation errors
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// User-provided input failed validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A system capacity limit is exhausted
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Unexpected internal errors that indicate bugs or broken invariants
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for CoordinationError {
    fn from(err: anyhow::Error) -> Self {
        // Errors crossing the database boundary arrive as anyhow; by the
        // time they reach a caller they mean the store could not complete
        // a write, which is the Unreachable contract.
        Self::Unreachable(err.to_string())
    }
}

impl From<parkline_provider_core::ProviderError> for CoordinationError {
    fn from(err: parkline_provider_core::ProviderError) -> Self {
        use parkline_provider_core::ProviderError;
        match err {
            ProviderError::Unavailable(msg) => Self::ProviderUnavailable(msg),
            ProviderError::Rejected(msg) => Self::ProviderUnavailable(msg),
            ProviderError::LegNotFound(msg) => Self::NotFound(msg),
        }
    }
}

impl CoordinationError {
    /// Create a new ClaimConflict error with the provided message
    pub fn claim_conflict<S: Into<String>>(msg: S) -> Self {
        Self::ClaimConflict(msg.into())
    }

    /// Create a new NotFound error with the provided message
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new ProviderUnavailable error with the provided message
    pub fn provider_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    /// Create a new StaleState error with the provided message
    pub fn stale<S: Into<String>>(msg: S) -> Self {
        Self::StaleState(msg.into())
    }

    /// Create a new Unreachable error with the provided message
    pub fn unreachable<S: Into<String>>(msg: S) -> Self {
        Self::Unreachable(msg.into())
    }

    /// Create a new Database error with the provided message
    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new Configuration error with the provided message
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new InvalidInput error with the provided message
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new ResourceUnavailable error with the provided message
    pub fn resource_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ResourceUnavailable(msg.into())
    }

    /// Create a new Internal error with the provided message
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same operation can possibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Database(_))
    }
}

/// Result type for coordination operations
pub type Result<T> = std::result::Result<T, CoordinationError>;
