//! # Ring Broadcaster
//!
//! Fans an inbound call out to all eligible agents and retracts it once
//! resolved. Eligibility is a point-in-time snapshot of the presence
//! registry: agents flipping availability after the snapshot keep their
//! ring assignment, and the claim ledger resolves whatever follows.
//!
//! Every ring is bounded: a timer resolves an unclaimed call to missed,
//! with the missed transition decided by a conditional write so the timer,
//! caller abandonment, and decline-exhaustion paths commit it exactly once
//! between them.

use std::sync::Arc;

use chrono::Utc;
use parkline_provider_core::{CallRef, TelephonyProvider};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::presence::{AgentPresence, PresenceRegistry};
use crate::agent::AgentId;
use crate::config::RingConfig;
use crate::database::DatabaseManager;
use crate::error::{CoordinationError, Result};
use crate::events::{ChangeEvent, EventBus, RingEventKind};
use crate::orchestrator::emit_ring_event;
use crate::orchestrator::types::{CallId, CallStatus};

/// Ring fan-out and retraction
#[derive(Clone)]
pub struct RingBroadcaster {
    db: DatabaseManager,
    events: Arc<EventBus>,
    provider: Arc<dyn TelephonyProvider>,
    presence: PresenceRegistry,
    config: RingConfig,
}

impl RingBroadcaster {
    pub fn new(
        db: DatabaseManager,
        events: Arc<EventBus>,
        provider: Arc<dyn TelephonyProvider>,
        presence: PresenceRegistry,
        config: RingConfig,
    ) -> Self {
        Self {
            db,
            events,
            provider,
            presence,
            config,
        }
    }

    /// Offer a freshly-created ringing call to every eligible agent.
    ///
    /// Snapshots eligibility, records one ring assignment per agent,
    /// appends a scoped ring-start signal for each, and instructs the
    /// provider to alert all of them simultaneously. Returns the agents
    /// that were assigned.
    pub async fn start_ring(
        &self,
        call_id: &CallId,
        provider_ref: &CallRef,
    ) -> Result<Vec<AgentPresence>> {
        let eligible = self.presence.eligible_agents().await?;

        if eligible.is_empty() {
            warn!(
                "📵 No eligible agents for call {}; it will ring out to missed",
                call_id
            );
        }

        let agent_ids: Vec<String> = eligible
            .iter()
            .map(|agent| agent.agent_id.0.clone())
            .collect();
        self.db
            .insert_ring_assignments(call_id.as_ref(), &agent_ids, Utc::now())
            .await?;

        for agent in &eligible {
            emit_ring_event(
                &self.db,
                &self.events,
                call_id,
                Some(&agent.agent_id),
                RingEventKind::RingStart,
            )
            .await?;
        }

        if !eligible.is_empty() {
            let destinations: Vec<String> = eligible
                .iter()
                .map(|agent| {
                    agent
                        .contact_uri
                        .clone()
                        .unwrap_or_else(|| agent.agent_id.0.clone())
                })
                .collect();

            if let Err(e) = self.provider.alert(provider_ref, &destinations).await {
                // Nobody will ever hear this ring; resolve it now instead
                // of letting the caller wait out the timeout.
                warn!("📵 Provider alert failed for call {}: {}", call_id, e);
                self.resolve_missed(call_id).await?;
                return Err(CoordinationError::from(e));
            }

            info!(
                "🔔 Call {} ringing {} agents simultaneously",
                call_id,
                eligible.len()
            );
        }

        let _ = self.spawn_ring_timeout(call_id.clone());
        Ok(eligible)
    }

    /// One agent turning the offer down.
    ///
    /// Removes only that agent's assignment; every other assigned agent
    /// keeps ringing. Distinct from caller-initiated cancellation, which
    /// retracts the ring for everyone. Calling this twice for the same
    /// pair is a no-op, not an error.
    pub async fn decline(&self, call_id: &CallId, agent_id: &AgentId) -> Result<()> {
        let call = self
            .db
            .get_call(call_id.as_ref())
            .await?
            .ok_or_else(|| {
                CoordinationError::not_found(format!("call {} does not exist", call_id))
            })?;

        if CallStatus::from_str(&call.status) != Some(CallStatus::Ringing) {
            debug!(
                "Decline for call {} ignored; call is {}",
                call_id, call.status
            );
            return Ok(());
        }

        let removed = self
            .db
            .remove_ring_assignment(call_id.as_ref(), agent_id.as_ref())
            .await?;
        if !removed {
            return Ok(());
        }

        emit_ring_event(
            &self.db,
            &self.events,
            call_id,
            Some(agent_id),
            RingEventKind::Declined,
        )
        .await?;

        // The last decline resolves the ring early rather than letting the
        // caller ring into an empty room until the timeout.
        let remaining = self.db.count_ring_assignments(call_id.as_ref()).await?;
        if remaining == 0 {
            info!(
                "📵 Every assigned agent declined call {}; resolving as missed",
                call_id
            );
            self.resolve_missed(call_id).await?;
        }
        Ok(())
    }

    /// Resolve a still-ringing call to missed and retract every
    /// outstanding offer. Safe to race: only the caller whose conditional
    /// write lands emits the retraction signals.
    pub(crate) async fn resolve_missed(&self, call_id: &CallId) -> Result<()> {
        if !self.db.mark_call_missed(call_id.as_ref(), Utc::now()).await? {
            return Ok(());
        }

        emit_ring_event(&self.db, &self.events, call_id, None, RingEventKind::RingCancel).await?;

        self.events.publish(ChangeEvent::CallChanged {
            call_id: call_id.clone(),
            status: CallStatus::Missed,
            owner: None,
        });
        Ok(())
    }

    /// Arm the bounded ring timeout for a call.
    fn spawn_ring_timeout(&self, call_id: CallId) -> JoinHandle<()> {
        let broadcaster = self.clone();
        let timeout = self.config.ring_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(e) = broadcaster.resolve_missed(&call_id).await {
                warn!("Ring timeout for call {} failed to resolve: {}", call_id, e);
            }
        })
    }
}
