//! # Parkline Provider Core
//!
//! The capability surface the coordination layer expects from an external
//! telephony provider. The coordination engine never touches SIP, RTP, or
//! media directly; everything it needs from the telephony side is expressed
//! through the three operations defined here:
//!
//! 1. [`TelephonyProvider::alert`] - offer a call to a set of destinations
//!    simultaneously,
//! 2. [`TelephonyProvider::redirect`] - move an existing call leg to a new
//!    target (an agent, or a holding construct),
//! 3. an asynchronous status stream, delivered to the engine as
//!    [`ProviderStatusEvent`] values.
//!
//! ## Overview
//!
//! Providers are expected to be *optimistic*: they may connect audio to
//! every alerted destination before ownership of the call is resolved. The
//! coordination layer reconciles afterwards, so implementations of this
//! trait must tolerate redundant teardown and redirect requests for legs
//! that have already gone away.
//!
//! ## Examples
//!
//! ```rust
//! use parkline_provider_core::{CallRef, ProviderCallStatus, ProviderStatusEvent};
//! use chrono::Utc;
//!
//! let event = ProviderStatusEvent {
//!     call: CallRef::from("PX-1234"),
//!     status: ProviderCallStatus::Completed,
//!     at: Utc::now(),
//! };
//!
//! assert!(event.status.is_terminal());
//! ```

pub mod error;
pub mod types;

pub use error::{ProviderError, ProviderResult};
pub use types::{CallRef, ProviderCallStatus, ProviderStatusEvent};

use async_trait::async_trait;

/// The three-operation telephony capability the coordination layer consumes.
///
/// Implementations wrap whatever the actual provider speaks (SIP trunks,
/// a CPaaS REST API, a test double). The engine holds the provider as
/// `Arc<dyn TelephonyProvider>` and calls into it from short-lived handler
/// tasks, so implementations must be `Send + Sync`.
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Alert all `destinations` for `call` simultaneously.
    ///
    /// Each destination is an opaque provider-side address (for SIP-backed
    /// providers, a URI). Per-destination accept/reject outcomes arrive
    /// later on the status stream; this method only confirms the alert was
    /// dispatched.
    async fn alert(&self, call: &CallRef, destinations: &[String]) -> ProviderResult<()>;

    /// Redirect an existing leg of `call` to `target`.
    ///
    /// `target` may be an agent address or a holding construct reference
    /// generated by the caller. Redirecting a leg that has already
    /// terminated returns [`ProviderError::LegNotFound`]; callers treat
    /// that as a recoverable no-op.
    async fn redirect(&self, call: &CallRef, target: &str) -> ProviderResult<()>;
}
