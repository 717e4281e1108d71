//! Shared fixtures for coordination integration tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use parkline_coordination_core::prelude::*;
use parkline_provider_core::{ProviderError, ProviderResult};

/// Scripted telephony provider double.
///
/// Records every alert and redirect, and can be told to fail redirects to
/// exercise the compensation paths.
pub struct MockProvider {
    alerts: Mutex<Vec<(String, Vec<String>)>>,
    redirects: Mutex<Vec<(String, String)>>,
    fail_redirects: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alerts: Mutex::new(Vec::new()),
            redirects: Mutex::new(Vec::new()),
            fail_redirects: AtomicBool::new(false),
        })
    }

    pub fn fail_redirects(&self, fail: bool) {
        self.fail_redirects.store(fail, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<(String, Vec<String>)> {
        self.alerts.lock().clone()
    }

    pub fn redirects(&self) -> Vec<(String, String)> {
        self.redirects.lock().clone()
    }
}

#[async_trait]
impl TelephonyProvider for MockProvider {
    async fn alert(&self, call: &CallRef, destinations: &[String]) -> ProviderResult<()> {
        self.alerts
            .lock()
            .push((call.to_string(), destinations.to_vec()));
        Ok(())
    }

    async fn redirect(&self, call: &CallRef, target: &str) -> ProviderResult<()> {
        if self.fail_redirects.load(Ordering::SeqCst) {
            return Err(ProviderError::unavailable("scripted redirect failure"));
        }
        self.redirects
            .lock()
            .push((call.to_string(), target.to_string()));
        Ok(())
    }
}

/// Engine over an in-memory store with test-friendly timing.
pub async fn create_test_engine() -> (Arc<CoordinationEngine>, Arc<MockProvider>) {
    create_test_engine_with(|_| {}).await
}

/// Same as [`create_test_engine`] but lets the test adjust configuration.
pub async fn create_test_engine_with(
    tweak: impl FnOnce(&mut CoordinationConfig),
) -> (Arc<CoordinationEngine>, Arc<MockProvider>) {
    let mut config = CoordinationConfig::default();
    config.ring.ring_timeout = Duration::from_secs(1);
    config.ring.claim_retry_base = Duration::from_millis(10);
    tweak(&mut config);

    let provider = MockProvider::new();
    let engine = CoordinationEngine::new(config, provider.clone(), Some("sqlite::memory:".into()))
        .await
        .expect("engine creation failed");

    (engine, provider)
}

/// Register and sign in a set of agents.
pub async fn sign_in_agents(engine: &CoordinationEngine, names: &[&str]) {
    for name in names {
        let agent = AgentId::from(*name);
        engine
            .register_agent(&agent, &format!("sip:{}@parkline.local", name))
            .await
            .expect("agent registration failed");
        engine
            .set_available(&agent, true)
            .await
            .expect("agent sign-in failed");
    }
}

/// Assert the presence/ownership invariant for every agent: an agent's
/// current call id is non-null exactly when it owns a live call.
pub async fn assert_presence_consistent(engine: &CoordinationEngine, agents: &[&str]) {
    let db = engine.database();
    for name in agents {
        let agent = db
            .get_agent(name)
            .await
            .expect("agent query failed")
            .expect("agent should exist");

        match agent.current_call_id {
            Some(call_id) => {
                let call = db
                    .get_call(&call_id)
                    .await
                    .expect("call query failed")
                    .expect("owned call should exist");
                assert!(
                    matches!(call.status.as_str(), "ACTIVE" | "TRANSFERRING"),
                    "agent {} holds call {} in unexpected status {}",
                    name,
                    call_id,
                    call.status
                );
            }
            None => {
                // No live call may list this agent as its owner.
                for status in ["ACTIVE", "TRANSFERRING"] {
                    let owned: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM calls WHERE owner_agent_id = ? AND status = ?",
                    )
                    .bind(name)
                    .bind(status)
                    .fetch_one(db.pool())
                    .await
                    .expect("ownership query failed");
                    assert_eq!(
                        owned, 0,
                        "agent {} has no current call but owns a {} call",
                        name, status
                    );
                }
            }
        }
    }
}
