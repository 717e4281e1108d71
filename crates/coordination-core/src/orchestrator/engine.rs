//! # Coordination Engine
//!
//! The entry point tying presence, claims, ring fan-out, and park/transfer
//! together, and the landing spot for the provider's asynchronous status
//! stream. The engine owns no call state of its own: every decision it
//! makes is a conditional write against the shared store, so any number of
//! engine instances may serve the same store concurrently.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parkline_coordination_core::prelude::*;
//! use parkline_provider_core::{CallRef, TelephonyProvider};
//!
//! # async fn example(provider: Arc<dyn TelephonyProvider>) -> Result<()> {
//! let config = CoordinationConfig::default();
//! let engine = CoordinationEngine::new(config, provider, None).await?;
//! engine.start().await?;
//!
//! // Agents come online
//! engine.register_agent(&AgentId::from("alice"), "sip:alice@parkline.local").await?;
//! engine.set_available(&AgentId::from("alice"), true).await?;
//!
//! // An inbound signal starts a ring
//! let call_id = engine
//!     .on_inbound_call(&CallRef::from("PX-1001"), "+15550100", "+15550199")
//!     .await?;
//!
//! // The first client to claim wins
//! let outcome = engine.claim(&call_id, &AgentId::from("alice")).await?;
//! assert!(outcome.won);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parkline_provider_core::{CallRef, ProviderStatusEvent, TelephonyProvider};

use crate::agent::presence::PresenceRegistry;
use crate::agent::AgentId;
use crate::config::CoordinationConfig;
use crate::database::{DatabaseManager, DbCall};
use crate::error::{CoordinationError, Result};
use crate::events::{ChangeEvent, EventBus, RingEventKind};
use crate::orchestrator::claims::ClaimLedger;
use crate::orchestrator::park::ParkCoordinator;
use crate::orchestrator::ring::RingBroadcaster;
use crate::orchestrator::types::{
    CallDirection, CallId, CallInfo, CallStatus, ClaimOutcome, ParkedCallId,
};
use crate::reconcile::AgentView;
use crate::CoordinationStats;

/// The call coordination engine
///
/// Cheap to share: hold it as `Arc<CoordinationEngine>` and call it from
/// any number of tasks.
pub struct CoordinationEngine {
    config: CoordinationConfig,
    db: DatabaseManager,
    events: Arc<EventBus>,
    presence: PresenceRegistry,
    ring: RingBroadcaster,
    claims: ClaimLedger,
    park: ParkCoordinator,

    /// Server-side mirror of each registered client's reconciled view,
    /// maintained by folding the same stream the clients fold.
    views: Arc<DashMap<AgentId, AgentView>>,

    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    view_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationEngine {
    /// Create an engine over the configured store.
    ///
    /// `db_url` overrides the configured database URL; pass `None` to use
    /// the configuration (tests pass an in-memory URL here).
    pub async fn new(
        config: CoordinationConfig,
        provider: Arc<dyn TelephonyProvider>,
        db_url: Option<String>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let url = db_url.unwrap_or_else(|| config.database.database_url.clone());
        let db = DatabaseManager::new(&url)
            .await
            .map_err(|e| CoordinationError::database(e.to_string()))?;

        let events = Arc::new(EventBus::new(1024));
        let presence = PresenceRegistry::new(db.clone(), events.clone());
        let ring = RingBroadcaster::new(
            db.clone(),
            events.clone(),
            provider.clone(),
            presence.clone(),
            config.ring.clone(),
        );
        let claims = ClaimLedger::new(db.clone(), events.clone(), config.ring.clone());
        let park = ParkCoordinator::new(
            db.clone(),
            events.clone(),
            provider,
            config.park.clone(),
        );

        info!("🎛️ Coordination engine initialized for domain {}", config.general.domain);

        Ok(Arc::new(Self {
            config,
            db,
            events,
            presence,
            ring,
            claims,
            park,
            views: Arc::new(DashMap::new()),
            sweep_handle: Mutex::new(None),
            view_handle: Mutex::new(None),
        }))
    }

    /// Start background processing: the parked-call cleanup sweep and the
    /// server-side view maintainer.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut sweep = self.sweep_handle.lock();
        if sweep.is_none() {
            *sweep = Some(self.park.spawn_sweep());
            info!("✅ Cleanup sweep started (every {:?})", self.config.park.sweep_interval);
        }
        drop(sweep);

        let mut view = self.view_handle.lock();
        if view.is_none() {
            *view = Some(self.spawn_view_maintainer());
            info!("✅ View maintainer started");
        }
        Ok(())
    }

    /// Stop background processing. In-flight client operations finish
    /// normally; only the periodic tasks are cancelled.
    pub async fn stop(&self) {
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.view_handle.lock().take() {
            handle.abort();
        }
        info!("🛑 Coordination engine background tasks stopped");
    }

    fn spawn_view_maintainer(self: &Arc<Self>) -> JoinHandle<()> {
        let views = self.views.clone();
        let mut rx = self.events.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        for mut entry in views.iter_mut() {
                            entry.value_mut().apply(&event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Views fold idempotently, so a gap only means the
                        // mirrors may be behind until the next snapshot.
                        warn!("View maintainer lagged; dropped {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn ensure_view(&self, agent_id: &AgentId) {
        self.views
            .entry(agent_id.clone())
            .or_insert_with(|| AgentView::new(agent_id.clone()));
    }

    // ========================================================================
    // Client-facing operations
    // ========================================================================

    /// Record where the provider should direct alerts for this agent.
    pub async fn register_agent(&self, agent_id: &AgentId, contact_uri: &str) -> Result<()> {
        self.presence.register(agent_id, contact_uri).await?;
        self.ensure_view(agent_id);
        Ok(())
    }

    /// Toggle an agent's availability. Never touches call ownership.
    pub async fn set_available(&self, agent_id: &AgentId, available: bool) -> Result<()> {
        self.presence.set_available(agent_id, available).await?;
        self.ensure_view(agent_id);
        Ok(())
    }

    /// Attempt to take ownership of a ringing call. Exactly one concurrent
    /// caller per call receives `won: true`.
    pub async fn claim(&self, call_id: &CallId, agent_id: &AgentId) -> Result<ClaimOutcome> {
        self.claims.claim(call_id, agent_id).await
    }

    /// Turn down a ring offer for one agent only.
    pub async fn decline(&self, call_id: &CallId, agent_id: &AgentId) -> Result<()> {
        self.ring.decline(call_id, agent_id).await
    }

    /// Suspend an active call owned by `agent_id`, freeing the agent.
    pub async fn park(&self, call_id: &CallId, agent_id: &AgentId) -> Result<ParkedCallId> {
        self.park.park(call_id, agent_id).await
    }

    /// Retrieve a parked call for an eligible target agent.
    pub async fn unpark(
        &self,
        parked_call_id: &ParkedCallId,
        target_agent_id: &AgentId,
    ) -> Result<()> {
        self.park.unpark(parked_call_id, target_agent_id).await
    }

    /// Record an agent-placed outbound call: active and owned from the
    /// start, with no ring phase. Presence and park/transfer treat it
    /// exactly like a claimed inbound call afterwards.
    pub async fn place_outbound_call(
        &self,
        agent_id: &AgentId,
        provider_ref: &CallRef,
        to_address: &str,
    ) -> Result<CallId> {
        self.check_capacity().await?;

        let from_address = match self.db.get_agent(agent_id.as_ref()).await? {
            Some(agent) => agent.contact_uri.unwrap_or_else(|| agent_id.0.clone()),
            None => {
                return Err(CoordinationError::not_found(format!(
                    "agent {} is not registered",
                    agent_id
                )));
            }
        };

        let call_id = CallId::new();
        let inserted = self
            .db
            .insert_outbound_call(
                call_id.as_ref(),
                provider_ref.as_ref(),
                agent_id.as_ref(),
                &from_address,
                to_address,
                Utc::now(),
            )
            .await?;

        if !inserted {
            return Err(CoordinationError::claim_conflict(format!(
                "agent {} is not eligible to place a call",
                agent_id
            )));
        }

        info!("📞 Outbound call {} placed by agent {}", call_id, agent_id);
        self.events.publish(ChangeEvent::CallChanged {
            call_id: call_id.clone(),
            status: CallStatus::Active,
            owner: Some(agent_id.clone()),
        });
        Ok(call_id)
    }

    // ========================================================================
    // External signal entry points
    // ========================================================================

    /// Handle a new inbound call signal from the provider: create the call
    /// and fan the ring out to every eligible agent.
    pub async fn on_inbound_call(
        &self,
        provider_ref: &CallRef,
        from_address: &str,
        to_address: &str,
    ) -> Result<CallId> {
        self.check_capacity().await?;

        let call_id = CallId::new();
        self.db
            .insert_ringing_call(
                call_id.as_ref(),
                provider_ref.as_ref(),
                from_address,
                to_address,
                Utc::now(),
            )
            .await?;

        info!(
            "📞 Inbound call {} ({} -> {}) entering ring",
            call_id, from_address, to_address
        );
        self.events.publish(ChangeEvent::CallChanged {
            call_id: call_id.clone(),
            status: CallStatus::Ringing,
            owner: None,
        });

        self.ring.start_ring(&call_id, provider_ref).await?;
        Ok(call_id)
    }

    /// Fold one provider status callback into the coordination state.
    ///
    /// Provider-reported termination is authoritative for every
    /// non-terminal status and is processed even when no agent client is
    /// connected. Callbacks that find no matching record are logged and
    /// ignored: the call may already be resolved via another path.
    pub async fn on_provider_status(&self, event: ProviderStatusEvent) -> Result<()> {
        let Some(call) = self
            .db
            .get_call_by_provider_ref(event.call.as_ref())
            .await?
        else {
            debug!(
                "Provider status {} for unknown call ref {}; ignoring",
                event.status, event.call
            );
            return Ok(());
        };

        let call_id = CallId::from(call.call_id.clone());
        let status = CallStatus::from_str(&call.status).ok_or_else(|| {
            CoordinationError::internal(format!(
                "call {} has unrecognized status '{}'",
                call_id, call.status
            ))
        })?;

        if event.status.is_terminal() {
            return self.on_provider_termination(&call, call_id, status).await;
        }

        match (event.status, status) {
            (parkline_provider_core::ProviderCallStatus::InProgress, CallStatus::Transferring) => {
                // The redirected leg reached the transfer target; resolve
                // ownership without a second claim arbitration.
                if let Some(owner) = self.db.finalize_transfer(call_id.as_ref(), Utc::now()).await?
                {
                    let owner = AgentId::from(owner);
                    info!("↪️ Transfer of call {} completed to agent {}", call_id, owner);
                    self.events.publish(ChangeEvent::CallChanged {
                        call_id,
                        status: CallStatus::Active,
                        owner: Some(owner),
                    });
                }
            }
            (reported, current) => {
                // Includes the provider's optimistic in-progress while the
                // call is still ringing: ownership is decided by the claim
                // ledger, not by audio.
                debug!(
                    "Provider status {} for call {} in state {}; no-op",
                    reported, call_id, current
                );
            }
        }
        Ok(())
    }

    /// Apply an authoritative provider termination to whatever state the
    /// call is in. Each arm is a conditional write, so racing paths (ring
    /// timeout, sweep, concurrent callbacks) resolve the call exactly once.
    async fn on_provider_termination(
        &self,
        call: &DbCall,
        call_id: CallId,
        status: CallStatus,
    ) -> Result<()> {
        match status {
            CallStatus::Ringing => {
                // Caller abandonment: retract the ring for everyone, even
                // with a claim in flight - the claim transaction fails
                // against the resolved call.
                info!("📵 Caller abandoned ringing call {}", call_id);
                self.ring.resolve_missed(&call_id).await?;
            }
            CallStatus::Active => {
                let terminated = self
                    .db
                    .terminate_call(
                        call_id.as_ref(),
                        CallStatus::Active.as_str(),
                        CallStatus::Completed.as_str(),
                        Utc::now(),
                    )
                    .await?;
                if terminated {
                    if let Some(owner) = &call.owner_agent_id {
                        self.db.clear_agent_call(owner, call_id.as_ref()).await?;
                    }
                    info!("✅ Call {} completed", call_id);
                    self.events.publish(ChangeEvent::CallChanged {
                        call_id,
                        status: CallStatus::Completed,
                        owner: None,
                    });
                }
            }
            CallStatus::Parked => {
                // Caller hung up while on hold. The parked row goes away
                // through the same conditional delete the retrievers use,
                // so an in-flight unpark loses cleanly.
                if let Some(row) = self.db.remove_parked_by_call(call_id.as_ref()).await? {
                    self.events.publish(ChangeEvent::ParkedCallRemoved {
                        parked_call_id: ParkedCallId::from(row.parked_call_id),
                        call_id: call_id.clone(),
                    });
                }
                let terminated = self
                    .db
                    .terminate_call(
                        call_id.as_ref(),
                        CallStatus::Parked.as_str(),
                        CallStatus::Abandoned.as_str(),
                        Utc::now(),
                    )
                    .await?;
                if terminated {
                    info!("🧹 Parked call {} abandoned by caller", call_id);
                    self.events.publish(ChangeEvent::CallChanged {
                        call_id,
                        status: CallStatus::Abandoned,
                        owner: None,
                    });
                }
            }
            CallStatus::Transferring => {
                let target = call.transfer_target.clone();
                let terminated = self
                    .db
                    .terminate_call(
                        call_id.as_ref(),
                        CallStatus::Transferring.as_str(),
                        CallStatus::Completed.as_str(),
                        Utc::now(),
                    )
                    .await?;
                if terminated {
                    if let Some(target) = target {
                        // Release the reserved transfer target.
                        self.db.clear_agent_call(&target, call_id.as_ref()).await?;
                    }
                    info!("✅ Call {} ended during transfer", call_id);
                    self.events.publish(ChangeEvent::CallChanged {
                        call_id,
                        status: CallStatus::Completed,
                        owner: None,
                    });
                }
            }
            CallStatus::Completed | CallStatus::Missed | CallStatus::Abandoned => {
                debug!("Termination for already-resolved call {}; no-op", call_id);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Views, lookups, statistics
    // ========================================================================

    /// Subscribe to the change stream clients fold.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// The server-side mirror of one agent's reconciled view, if that
    /// agent has registered in this process.
    pub fn agent_view(&self, agent_id: &AgentId) -> Option<AgentView> {
        self.views.get(agent_id).map(|entry| entry.value().clone())
    }

    /// Build an agent's view directly from the store, expressed as a fold
    /// over synthetic change events so snapshot and live paths reduce
    /// through the same code.
    pub async fn snapshot_view(&self, agent_id: &AgentId) -> Result<AgentView> {
        let mut view = AgentView::new(agent_id.clone());

        for row in self.db.list_parked_calls().await? {
            view.apply(&ChangeEvent::ParkedCallAdded {
                parked_call_id: ParkedCallId::from(row.parked_call_id),
                call_id: CallId::from(row.call_id),
                parked_by: AgentId::from(row.parked_by),
            });
        }

        if let Some(agent) = self.db.get_agent(agent_id.as_ref()).await? {
            if let Some(current) = agent.current_call_id {
                if let Some(call) = self.db.get_call(&current).await? {
                    if CallStatus::from_str(&call.status) == Some(CallStatus::Active)
                        && call.owner_agent_id.as_deref() == Some(agent_id.as_ref())
                    {
                        view.apply(&ChangeEvent::CallChanged {
                            call_id: CallId::from(call.call_id),
                            status: CallStatus::Active,
                            owner: Some(agent_id.clone()),
                        });
                    }
                }
            }
        }

        for offered in self.db.offered_call_ids_for_agent(agent_id.as_ref()).await? {
            view.apply(&ChangeEvent::Ring(crate::events::RingEvent {
                id: 0,
                call_id: CallId::from(offered),
                agent_id: Some(agent_id.clone()),
                kind: RingEventKind::RingStart,
                created_at: Utc::now(),
            }));
        }

        Ok(view)
    }

    /// Look up one call's current record.
    pub async fn call_info(&self, call_id: &CallId) -> Result<Option<CallInfo>> {
        match self.db.get_call(call_id.as_ref()).await? {
            Some(row) => Ok(Some(to_call_info(row)?)),
            None => Ok(None),
        }
    }

    /// Current aggregate statistics.
    pub async fn get_stats(&self) -> Result<CoordinationStats> {
        let stats = self.db.stats().await?;
        Ok(CoordinationStats {
            ringing_calls: stats.ringing_calls as usize,
            active_calls: stats.active_calls as usize,
            parked_calls: stats.parked_calls as usize,
            available_agents: stats.available_agents as usize,
        })
    }

    /// Run one cleanup-sweep pass immediately, returning how many parked
    /// calls were abandoned. The periodic sweep runs this on its own; the
    /// method exists for administration and tests.
    pub async fn sweep_parked_calls(&self) -> Result<usize> {
        self.park.sweep_once().await
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Direct store access, for administration and tests.
    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    async fn check_capacity(&self) -> Result<()> {
        let live = self.db.count_live_calls().await?;
        if live as usize >= self.config.general.max_concurrent_calls {
            warn!("🚨 Refusing new call; {} live calls at capacity", live);
            return Err(CoordinationError::resource_unavailable(
                "maximum concurrent call capacity reached",
            ));
        }
        Ok(())
    }
}

fn to_call_info(row: DbCall) -> Result<CallInfo> {
    let status = CallStatus::from_str(&row.status).ok_or_else(|| {
        CoordinationError::internal(format!("unrecognized call status '{}'", row.status))
    })?;
    let direction = CallDirection::from_str(&row.direction).ok_or_else(|| {
        CoordinationError::internal(format!("unrecognized call direction '{}'", row.direction))
    })?;

    Ok(CallInfo {
        call_id: CallId::from(row.call_id),
        provider_ref: CallRef::from(row.provider_ref),
        direction,
        status,
        from_address: row.from_address,
        to_address: row.to_address,
        owner: row.owner_agent_id.map(AgentId::from),
        transfer_target: row.transfer_target.map(AgentId::from),
        created_at: row.created_at,
        answered_at: row.answered_at,
        ended_at: row.ended_at,
    })
}
