//! # Call Coordination Orchestration
//!
//! The orchestrator decides, among several concurrently-connected agents,
//! exactly one owner for a call at any moment. There is no central
//! in-process arbiter: every unit of coordination logic here is a
//! short-lived, stateless handler triggered by an external event (inbound
//! signal, agent action, provider callback), and every race is resolved by
//! one of the two atomic writes in the shared store.
//!
//! ## Module Organization
//!
//! - **[`engine`]**: [`CoordinationEngine`], the entry point tying the
//!   pieces together and receiving provider callbacks
//! - **[`claims`]**: the claim ledger - exclusive call ownership
//! - **[`ring`]**: ring fan-out, timeout, retraction, per-agent decline
//! - **[`park`]**: park, retrieval (transfer), compensation, cleanup sweep
//! - **[`types`]**: shared identifiers and call state definitions
//!
//! ## Control Flow
//!
//! An inbound signal creates a call and triggers the ring broadcaster,
//! which snapshots the eligible agent set and alerts all of them
//! simultaneously. The first agent whose client reaches the claim ledger
//! wins; everyone else observes a retraction. A winning agent may park the
//! call, freeing itself while the caller waits in the provider's holding
//! construct; any eligible agent may later retrieve it through a scoped,
//! single-recipient transfer rather than a broadcast.

pub mod claims;
pub mod engine;
pub mod park;
pub mod ring;
pub mod types;

pub use claims::ClaimLedger;
pub use engine::CoordinationEngine;
pub use park::ParkCoordinator;
pub use ring::RingBroadcaster;
pub use types::{CallDirection, CallId, CallInfo, CallStatus, ClaimOutcome, ParkedCallId};

use chrono::Utc;

use crate::agent::AgentId;
use crate::database::DatabaseManager;
use crate::error::Result;
use crate::events::{ChangeEvent, EventBus, RingEvent, RingEventKind};

/// Append a ring signal to the store's log and fan it out on the bus.
///
/// The append assigns the log sequence number; the bus delivery reuses it
/// so subscribers and late readers of the log fold identical sequences.
pub(crate) async fn emit_ring_event(
    db: &DatabaseManager,
    events: &EventBus,
    call_id: &CallId,
    agent_id: Option<&AgentId>,
    kind: RingEventKind,
) -> Result<()> {
    let row = db
        .append_ring_event(
            call_id.as_ref(),
            agent_id.map(|a| a.as_ref()),
            kind.as_str(),
            Utc::now(),
        )
        .await?;

    events.publish(ChangeEvent::Ring(RingEvent {
        id: row.id,
        call_id: call_id.clone(),
        agent_id: agent_id.cloned(),
        kind,
        created_at: row.created_at,
    }));
    Ok(())
}
