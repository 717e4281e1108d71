//! # Claim Ledger
//!
//! Grants exclusive ownership of one call to one agent, atomically. The
//! arbiter is a single insert-if-absent into a table keyed uniquely by
//! call id - never a read-then-write - because two agents routinely claim
//! within the same instant.
//!
//! Losing is an outcome, not an error: the provider may have connected
//! audio optimistically to every ringing agent before ownership resolved
//! (accept-then-reconcile, kept deliberately for latency), so a losing
//! client tears down its speculative leg on seeing `won: false`, and that
//! teardown must stay safe to invoke any number of times.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::AgentId;
use crate::config::RingConfig;
use crate::database::{ClaimWrite, DatabaseManager};
use crate::error::{CoordinationError, Result};
use crate::events::{ChangeEvent, EventBus, RingEventKind};
use crate::orchestrator::emit_ring_event;
use crate::orchestrator::types::{CallId, CallStatus, ClaimOutcome};

/// Exclusive call ownership arbitration
#[derive(Clone)]
pub struct ClaimLedger {
    db: DatabaseManager,
    events: Arc<EventBus>,
    config: RingConfig,
}

impl ClaimLedger {
    pub fn new(db: DatabaseManager, events: Arc<EventBus>, config: RingConfig) -> Self {
        Self { db, events, config }
    }

    /// Attempt to take ownership of a ringing call.
    ///
    /// Returns `won: true` for exactly one caller per call. A duplicate
    /// claim on an already-claimed call returns `won: false`. A claim on
    /// a nonexistent or already-resolved call returns [`CoordinationError::NotFound`].
    ///
    /// Transient store failures are retried with exponential backoff; the
    /// whole attempt is bounded by the ring timeout, since a claim that
    /// cannot land before the ring resolves has already lost.
    pub async fn claim(&self, call_id: &CallId, agent_id: &AgentId) -> Result<ClaimOutcome> {
        let call = self
            .db
            .get_call(call_id.as_ref())
            .await
            .map_err(CoordinationError::from)?
            .ok_or_else(|| {
                CoordinationError::not_found(format!("call {} does not exist", call_id))
            })?;

        if let Some(status) = CallStatus::from_str(&call.status) {
            if status.is_terminal() {
                return Err(CoordinationError::not_found(format!(
                    "call {} already resolved as {}",
                    call_id, status
                )));
            }
        }

        let write = self.claim_with_backoff(call_id, agent_id).await?;

        match write {
            ClaimWrite::Won => {
                info!("✅ Agent {} won claim for call {}", agent_id, call_id);

                // Losers use this to retract their local incoming entry;
                // for everyone but the winner it is equivalent to a cancel.
                emit_ring_event(&self.db, &self.events, call_id, None, RingEventKind::Answered)
                    .await?;

                self.events.publish(ChangeEvent::CallChanged {
                    call_id: call_id.clone(),
                    status: CallStatus::Active,
                    owner: Some(agent_id.clone()),
                });

                Ok(ClaimOutcome { won: true })
            }
            ClaimWrite::AlreadyClaimed { owner } => {
                debug!(
                    "Agent {} lost claim for call {} to {}",
                    agent_id, call_id, owner
                );
                Ok(ClaimOutcome { won: false })
            }
            ClaimWrite::NotRinging => Err(CoordinationError::not_found(format!(
                "call {} is no longer ringing",
                call_id
            ))),
        }
    }

    /// Run the atomic claim write, retrying transient store failures with
    /// doubling backoff until the ring timeout budget is exhausted.
    async fn claim_with_backoff(
        &self,
        call_id: &CallId,
        agent_id: &AgentId,
    ) -> Result<ClaimWrite> {
        let started = Instant::now();
        let mut delay = self.config.claim_retry_base;

        loop {
            match self
                .db
                .try_claim_call(call_id.as_ref(), agent_id.as_ref(), Utc::now())
                .await
            {
                Ok(write) => return Ok(write),
                Err(e) => {
                    if started.elapsed() + delay >= self.config.ring_timeout {
                        return Err(CoordinationError::unreachable(format!(
                            "claim for call {} abandoned after {:?}: {}",
                            call_id,
                            started.elapsed(),
                            e
                        )));
                    }
                    warn!(
                        "Claim write for call {} failed, retrying in {:?}: {}",
                        call_id, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}
