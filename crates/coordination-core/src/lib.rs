//! # Parkline Coordination Core
//!
//! The call coordination layer for the parkline stack: the logic that
//! decides, among several concurrently-connected agents, exactly one owner
//! for a call at any moment, and that keeps every agent's view of "who is
//! ringing / active / parked" consistent despite concurrent actions and an
//! eventually-observed provider event stream.
//!
//! ## Overview
//!
//! This is a distributed race-condition problem, not a scheduling problem.
//! Multiple independent clients react to the same external signal and must
//! converge on a single winner without a central in-memory arbiter. The
//! crate therefore keeps all cross-actor state in a shared store and
//! reduces correctness to exactly two atomic conditional writes:
//!
//! - the **claim** insert, which grants exclusive ownership of a ringing
//!   call to the first agent whose write lands, and
//! - the **parked-call delete**, which grants a parked call to the first
//!   retriever whose delete lands.
//!
//! Everything else - presence toggles, ring assignments, the event log -
//! is idempotent or commutative and tolerates re-delivery and out-of-order
//! arrival.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              CoordinationEngine                  │
//! ├──────────┬──────────┬───────────┬───────────────┤
//! │ Presence │  Claim   │   Ring    │ Park/Transfer │
//! │ Registry │  Ledger  │Broadcaster│  Coordinator  │
//! ├──────────┴──────────┴───────────┴───────────────┤
//! │        Shared store (sqlx / SQLite)             │
//! ├─────────────────────────────────────────────────┤
//! │   Change stream ──► per-client AgentView fold   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! The telephony side (alerting, redirecting, the status callback stream)
//! is consumed through the three-operation surface in
//! `parkline-provider-core`; this crate never touches SIP or media.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parkline_coordination_core::prelude::*;
//! use parkline_provider_core::{CallRef, TelephonyProvider};
//!
//! # async fn example(provider: Arc<dyn TelephonyProvider>) -> Result<()> {
//! let engine = CoordinationEngine::new(CoordinationConfig::default(), provider, None).await?;
//! engine.start().await?;
//!
//! let alice = AgentId::from("alice");
//! engine.register_agent(&alice, "sip:alice@parkline.local").await?;
//! engine.set_available(&alice, true).await?;
//!
//! let call = engine
//!     .on_inbound_call(&CallRef::from("PX-7"), "+15550100", "+15550199")
//!     .await?;
//!
//! if engine.claim(&call, &alice).await?.won {
//!     let parked = engine.park(&call, &alice).await?;
//!     println!("call {} waiting as {}", call, parked);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Modules
//!
//! - [`orchestrator`]: the engine and the claim/ring/park coordinators
//! - [`agent`]: agent identity and the presence registry
//! - [`events`]: the change stream clients fold
//! - [`reconcile`]: the per-client `{incoming, active, parked}` fold
//! - [`database`]: the shared store and its two arbitration writes
//! - [`config`]: configuration management and validation
//! - [`error`]: the coordination error taxonomy

// Core modules
pub mod config;
pub mod error;

// Coordination functionality modules
pub mod agent;
pub mod events;
pub mod orchestrator;
pub mod reconcile;

// Shared store integration
pub mod database;

// Re-exports for convenience
pub use config::CoordinationConfig;
pub use error::{CoordinationError, Result};
pub use orchestrator::engine::CoordinationEngine;

/// Aggregate coordination statistics
///
/// A point-in-time snapshot of the store's counters; individual numbers
/// may be mutually inconsistent under heavy concurrent write load.
#[derive(Debug, Clone)]
pub struct CoordinationStats {
    /// Calls currently being offered to agents
    pub ringing_calls: usize,
    /// Calls with an owning agent
    pub active_calls: usize,
    /// Calls suspended in the provider's holding construct
    pub parked_calls: usize,
    /// Agents eligible for a new ring right now
    pub available_agents: usize,
}

/// Prelude module for convenient imports
///
/// ```
/// use parkline_coordination_core::prelude::*;
/// ```
pub mod prelude {
    //! Commonly used types for coordination-layer applications

    pub use crate::{CoordinationConfig, CoordinationError, CoordinationStats, Result};

    pub use crate::config::{DatabaseConfig, GeneralConfig, ParkConfig, RingConfig};

    pub use crate::orchestrator::{
        CallDirection, CallId, CallInfo, CallStatus, ClaimOutcome, CoordinationEngine,
        ParkedCallId,
    };

    pub use crate::agent::{AgentId, Availability, PresenceRegistry};

    pub use crate::events::{ChangeEvent, EventBus, RingEvent, RingEventKind};

    pub use crate::reconcile::{AgentView, ParkedSummary};

    pub use crate::database::DatabaseManager;

    // Provider surface types
    pub use parkline_provider_core::{
        CallRef, ProviderCallStatus, ProviderStatusEvent, TelephonyProvider,
    };

    // Common external types
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}
