//! # Park / Transfer Coordinator
//!
//! Moves an owned call into a suspended parked state and back to a
//! (possibly different) owner. While parked, the caller's leg lives
//! entirely in the provider's holding construct - no application process
//! holds it - and the parked-call row is the only token of its existence.
//!
//! Retrieval is the second of the system's two true mutual-exclusion
//! points: whichever client's conditional delete lands first owns the
//! transfer, and the loser must not touch the provider leg. A transfer is
//! a scoped, single-recipient re-ring, never a broadcast, and needs no
//! second claim arbitration: the delete already arbitrated.

use std::sync::Arc;

use chrono::Utc;
use parkline_provider_core::{CallRef, TelephonyProvider};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::config::ParkConfig;
use crate::database::{DatabaseManager, DbParkedCall, UnparkWrite};
use crate::error::{CoordinationError, Result};
use crate::events::{ChangeEvent, EventBus, RingEventKind};
use crate::orchestrator::emit_ring_event;
use crate::orchestrator::types::{CallId, CallStatus, ParkedCallId};

/// Park and retrieval coordination
#[derive(Clone)]
pub struct ParkCoordinator {
    db: DatabaseManager,
    events: Arc<EventBus>,
    provider: Arc<dyn TelephonyProvider>,
    config: ParkConfig,
}

impl ParkCoordinator {
    pub fn new(
        db: DatabaseManager,
        events: Arc<EventBus>,
        provider: Arc<dyn TelephonyProvider>,
        config: ParkConfig,
    ) -> Self {
        Self {
            db,
            events,
            provider,
            config,
        }
    }

    /// Suspend an active call owned by `agent_id`.
    ///
    /// Redirects the caller leg into a holding construct, records the
    /// parked row, and frees the agent. A failure at any step before the
    /// record commits leaves the call exactly as it was.
    pub async fn park(&self, call_id: &CallId, agent_id: &AgentId) -> Result<ParkedCallId> {
        let call = self
            .db
            .get_call(call_id.as_ref())
            .await?
            .ok_or_else(|| {
                CoordinationError::not_found(format!("call {} does not exist", call_id))
            })?;

        if call.owner_agent_id.as_deref() != Some(agent_id.as_ref()) {
            return Err(CoordinationError::claim_conflict(format!(
                "call {} is not owned by agent {}",
                call_id, agent_id
            )));
        }
        if CallStatus::from_str(&call.status) != Some(CallStatus::Active) {
            return Err(CoordinationError::stale(format!(
                "call {} is {} and cannot be parked",
                call_id, call.status
            )));
        }

        // The caller's leg moves into provider infrastructure first; the
        // record follows. A redirect failure here leaves no trace.
        let hold_ref = format!("hold:{}", Uuid::new_v4());
        self.provider
            .redirect(&CallRef(call.provider_ref.clone()), &hold_ref)
            .await?;

        let parked_call_id = ParkedCallId::new();
        let parked = self
            .db
            .park_call(
                parked_call_id.as_ref(),
                call_id.as_ref(),
                agent_id.as_ref(),
                &hold_ref,
                Utc::now(),
            )
            .await?;

        if !parked {
            // The call resolved (provider-reported termination) between
            // our ownership check and the write; the termination signal is
            // authoritative and the hold redirect is moot.
            return Err(CoordinationError::stale(format!(
                "call {} resolved while being parked",
                call_id
            )));
        }

        info!(
            "📍 Call {} parked by agent {} as {}",
            call_id, agent_id, parked_call_id
        );

        self.events.publish(ChangeEvent::ParkedCallAdded {
            parked_call_id: parked_call_id.clone(),
            call_id: call_id.clone(),
            parked_by: agent_id.clone(),
        });
        self.events.publish(ChangeEvent::CallChanged {
            call_id: call_id.clone(),
            status: CallStatus::Parked,
            owner: None,
        });

        Ok(parked_call_id)
    }

    /// Retrieve a parked call for `target_agent_id`.
    ///
    /// The conditional delete decides between racing retrievers; the
    /// loser gets [`CoordinationError::NotFound`] and must not redirect
    /// the provider leg. On success a transfer-start signal goes to the
    /// target only, and the held leg is redirected to them. If that
    /// redirect fails the parked row is re-inserted and the transfer
    /// intent rolled back - a compensating action, since the delete
    /// already committed.
    pub async fn unpark(
        &self,
        parked_call_id: &ParkedCallId,
        target_agent_id: &AgentId,
    ) -> Result<()> {
        let write = self
            .db
            .take_parked_call(parked_call_id.as_ref(), target_agent_id.as_ref(), Utc::now())
            .await?;

        let row = match write {
            UnparkWrite::Taken(row) => row,
            UnparkWrite::NotFound => {
                return Err(CoordinationError::not_found(format!(
                    "parked call {} does not exist or was already retrieved",
                    parked_call_id
                )));
            }
            UnparkWrite::NotEligible => {
                return Err(CoordinationError::invalid_input(format!(
                    "agent {} is not eligible to retrieve a call",
                    target_agent_id
                )));
            }
            UnparkWrite::NotParked => {
                return Err(CoordinationError::stale(format!(
                    "call behind parked id {} already resolved",
                    parked_call_id
                )));
            }
        };

        let call_id = CallId::from(row.call_id.clone());

        // Scoped to the target only - this is what distinguishes a
        // transfer from an initial multi-agent ring.
        emit_ring_event(
            &self.db,
            &self.events,
            &call_id,
            Some(target_agent_id),
            RingEventKind::TransferStart,
        )
        .await?;

        self.events.publish(ChangeEvent::ParkedCallRemoved {
            parked_call_id: parked_call_id.clone(),
            call_id: call_id.clone(),
        });

        let target_contact = match self.db.get_agent(target_agent_id.as_ref()).await? {
            Some(agent) => agent
                .contact_uri
                .unwrap_or_else(|| target_agent_id.0.clone()),
            None => target_agent_id.0.clone(),
        };

        let call = self.db.get_call(call_id.as_ref()).await?.ok_or_else(|| {
            CoordinationError::internal(format!("parked row referenced missing call {}", call_id))
        })?;

        if let Err(e) = self
            .provider
            .redirect(&CallRef(call.provider_ref.clone()), &target_contact)
            .await
        {
            error!(
                "🔄 Redirect of call {} to agent {} failed, restoring parked record: {}",
                call_id, target_agent_id, e
            );
            self.db
                .restore_parked_call(&row, target_agent_id.as_ref(), Utc::now())
                .await?;

            self.events.publish(ChangeEvent::ParkedCallAdded {
                parked_call_id: parked_call_id.clone(),
                call_id: call_id.clone(),
                parked_by: AgentId(row.parked_by.clone()),
            });
            self.events.publish(ChangeEvent::CallChanged {
                call_id,
                status: CallStatus::Parked,
                owner: None,
            });
            return Err(CoordinationError::from(e));
        }

        info!(
            "↪️ Parked call {} transferring to agent {}",
            parked_call_id, target_agent_id
        );
        Ok(())
    }

    /// One pass of the server-side cleanup sweep.
    ///
    /// Deletes every parked call older than the configured bound and
    /// marks the underlying calls abandoned. Runs regardless of whether
    /// any agent client is connected.
    pub async fn sweep_once(&self) -> Result<usize> {
        let max_age = chrono::Duration::from_std(self.config.max_park_duration)
            .map_err(|e| CoordinationError::internal(e.to_string()))?;
        let cutoff = Utc::now() - max_age;

        let expired = self.db.sweep_parked_calls(cutoff).await?;
        for row in &expired {
            self.abandon_swept(row).await?;
        }
        Ok(expired.len())
    }

    async fn abandon_swept(&self, row: &DbParkedCall) -> Result<()> {
        warn!(
            "🧹 Parked call {} exceeded hold bound; abandoning call {}",
            row.parked_call_id, row.call_id
        );

        let call_id = CallId::from(row.call_id.clone());
        self.events.publish(ChangeEvent::ParkedCallRemoved {
            parked_call_id: ParkedCallId::from(row.parked_call_id.clone()),
            call_id: call_id.clone(),
        });

        let terminated = self
            .db
            .terminate_call(
                row.call_id.as_str(),
                CallStatus::Parked.as_str(),
                CallStatus::Abandoned.as_str(),
                Utc::now(),
            )
            .await?;

        if terminated {
            self.events.publish(ChangeEvent::CallChanged {
                call_id,
                status: CallStatus::Abandoned,
                owner: None,
            });
        } else {
            debug!(
                "Swept parked row {} whose call {} had already resolved",
                row.parked_call_id, row.call_id
            );
        }
        Ok(())
    }

    /// Start the periodic cleanup sweep.
    pub fn spawn_sweep(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so a fresh engine
            // does not sweep before anything can possibly be over-age.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match coordinator.sweep_once().await {
                    Ok(0) => {}
                    Ok(n) => info!("🧹 Cleanup sweep abandoned {} parked calls", n),
                    Err(e) => warn!("Cleanup sweep failed: {}", e),
                }
            }
        })
    }
}
