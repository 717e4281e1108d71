//! # Presence Registry
//!
//! Tracks each agent's availability and current call ownership. This is
//! the only source the ring broadcaster trusts when computing the eligible
//! set, and eligibility is a point-in-time snapshot: an agent flipping to
//! unavailable a moment after being included in a ring computation is
//! tolerated, not prevented - the claim ledger resolves whatever races
//! result.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::agent::types::{AgentId, Availability};
use crate::database::DatabaseManager;
use crate::error::{CoordinationError, Result};
use crate::events::{ChangeEvent, EventBus};
use crate::orchestrator::types::CallId;

/// One agent's presence record
#[derive(Debug, Clone)]
pub struct AgentPresence {
    pub agent_id: AgentId,
    pub availability: Availability,
    pub contact_uri: Option<String>,
    pub current_call_id: Option<CallId>,
}

impl AgentPresence {
    /// Eligible for a new ring: available and owning no call.
    pub fn is_eligible(&self) -> bool {
        self.availability == Availability::Available && self.current_call_id.is_none()
    }
}

/// Availability and ownership tracking over the shared store
#[derive(Clone)]
pub struct PresenceRegistry {
    db: DatabaseManager,
    events: Arc<EventBus>,
}

impl PresenceRegistry {
    pub fn new(db: DatabaseManager, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Record an agent's provider contact address (where alerts for this
    /// agent are directed). Leaves availability and ownership untouched.
    pub async fn register(&self, agent_id: &AgentId, contact_uri: &str) -> Result<()> {
        self.db
            .set_agent_contact(agent_id.as_ref(), contact_uri, Utc::now())
            .await
            .map_err(CoordinationError::from)?;
        info!("👤 Agent {} registered contact {}", agent_id, contact_uri);
        Ok(())
    }

    /// Toggle an agent's availability.
    ///
    /// Has no effect on the agent's current call: an agent going offline
    /// mid-call stays the owner until the call resolves.
    pub async fn set_available(&self, agent_id: &AgentId, available: bool) -> Result<()> {
        let availability = if available {
            Availability::Available
        } else {
            Availability::Offline
        };

        self.db
            .upsert_agent(agent_id.as_ref(), None, availability, Utc::now())
            .await
            .map_err(CoordinationError::from)?;

        self.events.publish(ChangeEvent::PresenceChanged {
            agent_id: agent_id.clone(),
            available,
        });
        Ok(())
    }

    /// Fetch one agent's presence.
    pub async fn get(&self, agent_id: &AgentId) -> Result<Option<AgentPresence>> {
        let row = self
            .db
            .get_agent(agent_id.as_ref())
            .await
            .map_err(CoordinationError::from)?;

        Ok(row.and_then(|row| {
            let availability = match row.get_availability() {
                Some(a) => a,
                None => {
                    warn!(
                        "Agent {} has unrecognized availability '{}'",
                        row.agent_id, row.availability
                    );
                    return None;
                }
            };
            Some(AgentPresence {
                agent_id: AgentId(row.agent_id),
                availability,
                contact_uri: row.contact_uri,
                current_call_id: row.current_call_id.map(CallId::from),
            })
        }))
    }

    /// Point-in-time snapshot of every eligible agent.
    ///
    /// This is the only read the ring broadcaster trusts. When the store
    /// cannot answer, the error propagates as Unreachable and no ring is
    /// attempted: on ambiguity agents are treated as busy, never as
    /// available.
    pub async fn eligible_agents(&self) -> Result<Vec<AgentPresence>> {
        let rows = self
            .db
            .eligible_agents()
            .await
            .map_err(|e| CoordinationError::unreachable(e.to_string()))?;

        let mut agents = Vec::with_capacity(rows.len());
        for row in rows {
            // A row we cannot interpret is treated as busy rather than
            // eligible.
            let Some(availability) = row.get_availability() else {
                warn!(
                    "Skipping agent {} with unrecognized availability '{}'",
                    row.agent_id, row.availability
                );
                continue;
            };
            agents.push(AgentPresence {
                agent_id: AgentId(row.agent_id),
                availability,
                contact_uri: row.contact_uri,
                current_call_id: row.current_call_id.map(CallId::from),
            });
        }
        Ok(agents)
    }
}
