//! # Shared Datastore Access (sqlx + SQLite)
//!
//! Every piece of cross-actor state lives here. Correctness of the whole
//! coordination layer reduces to this module's write atomicity: exactly two
//! operations require true mutual exclusion across actors - the claim
//! insert ([`DatabaseManager::try_claim_call`]) and the parked-call delete
//! ([`DatabaseManager::take_parked_call`]) - and both are implemented as
//! single conditional writes whose outcome is read from `rows_affected()`
//! (or a `RETURNING` clause), never from a prior read.
//!
//! All other writes are idempotent or commutative and tolerate re-delivery
//! and out-of-order arrival.
//!
//! ## Quick Start
//!
//! ```rust
//! use parkline_coordination_core::database::DatabaseManager;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let db = DatabaseManager::new_in_memory().await?;
//!
//! // All operations are Send-safe and can be used in tokio::spawn
//! tokio::spawn(async move {
//!     let agents = db.eligible_agents().await?;
//!     println!("Found {} eligible agents", agents.len());
//!     anyhow::Ok(())
//! });
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::agent::Availability;

/// Schema, applied at startup. `IF NOT EXISTS` keeps reconnection
/// idempotent; there is no separate migration history for this store.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS calls (
        call_id TEXT PRIMARY KEY,
        provider_ref TEXT NOT NULL UNIQUE,
        direction TEXT NOT NULL,
        status TEXT NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT NOT NULL,
        owner_agent_id TEXT,
        transfer_target TEXT,
        created_at TIMESTAMP NOT NULL,
        answered_at TIMESTAMP,
        ended_at TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS agents (
        agent_id TEXT PRIMARY KEY,
        availability TEXT NOT NULL DEFAULT 'OFFLINE',
        contact_uri TEXT,
        current_call_id TEXT,
        updated_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ring_assignments (
        call_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL,
        PRIMARY KEY (call_id, agent_id)
    )",
    "CREATE TABLE IF NOT EXISTS claims (
        call_id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        claimed_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS parked_calls (
        parked_call_id TEXT PRIMARY KEY,
        call_id TEXT NOT NULL UNIQUE,
        parked_by TEXT NOT NULL,
        hold_ref TEXT NOT NULL,
        parked_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ring_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        call_id TEXT NOT NULL,
        agent_id TEXT,
        kind TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ring_events_call ON ring_events (call_id)",
    "CREATE INDEX IF NOT EXISTS idx_calls_status ON calls (status)",
];

/// Async store manager over a sqlx connection pool
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Connect and initialize the schema.
    pub async fn new(database_url: &str) -> Result<Self> {
        use std::str::FromStr;
        info!("🗄️ Initializing datastore: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        // An in-memory database is per-connection; cap the pool at one
        // connection so every handle sees the same store.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
        } else {
            SqlitePool::connect_with(options).await
        }
        .map_err(|e| anyhow!("Failed to connect to datastore: {}", e))?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("✅ Datastore initialized (WAL mode enabled)");
        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn new_in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Call row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DbCall {
    pub call_id: String,
    pub provider_ref: String,
    pub direction: String,
    pub status: String,
    pub from_address: String,
    pub to_address: String,
    pub owner_agent_id: Option<String>,
    pub transfer_target: Option<String>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Agent presence row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DbAgent {
    pub agent_id: String,
    pub availability: String,
    pub contact_uri: Option<String>,
    pub current_call_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DbAgent {
    /// Typed availability, if the stored string is recognized.
    pub fn get_availability(&self) -> Option<Availability> {
        Availability::from_str(&self.availability)
    }
}

/// Ring assignment row: one per agent considered eligible at ring time
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DbRingAssignment {
    pub call_id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
}

/// Parked call row; exists only while a call is suspended
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DbParkedCall {
    pub parked_call_id: String,
    pub call_id: String,
    pub parked_by: String,
    pub hold_ref: String,
    pub parked_at: DateTime<Utc>,
}

/// Ring event log row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DbRingEvent {
    pub id: i64,
    pub call_id: String,
    pub agent_id: Option<String>,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the atomic claim write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimWrite {
    /// The conditional insert landed; the caller owns the call.
    Won,
    /// Some other agent's insert landed first.
    AlreadyClaimed { owner: String },
    /// The claim row inserted but the call had already left ringing
    /// (timeout or caller abandonment); the insert was rolled back.
    NotRinging,
}

/// Outcome of the atomic parked-call delete
#[derive(Debug, Clone)]
pub enum UnparkWrite {
    /// The delete landed; the row's contents are returned and the target
    /// agent now holds the call id in its presence record.
    Taken(DbParkedCall),
    /// No such parked-call row; a concurrent retrieval or sweep got there
    /// first.
    NotFound,
    /// The target agent is not eligible (offline or already on a call).
    NotEligible,
    /// The underlying call had already left the parked status; the delete
    /// was rolled back.
    NotParked,
}

/// Aggregate counts for engine statistics
#[derive(Debug, Clone, Default)]
pub struct DbStats {
    pub ringing_calls: i64,
    pub active_calls: i64,
    pub parked_calls: i64,
    pub available_agents: i64,
}

// Agent presence operations
impl DatabaseManager {
    /// Register or update an agent's availability.
    ///
    /// Never touches `current_call_id`: availability and ownership have
    /// separate writers and only the atomic claim/park/unpark writes may
    /// change ownership.
    pub async fn upsert_agent(
        &self,
        agent_id: &str,
        contact_uri: Option<&str>,
        availability: Availability,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents (agent_id, availability, contact_uri, current_call_id, updated_at)
             VALUES (?, ?, ?, NULL, ?)
             ON CONFLICT(agent_id) DO UPDATE SET
                availability = excluded.availability,
                contact_uri = COALESCE(excluded.contact_uri, agents.contact_uri),
                updated_at = excluded.updated_at",
        )
        .bind(agent_id)
        .bind(availability.as_str())
        .bind(contact_uri)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!("Agent {} availability set to {}", agent_id, availability);
        Ok(())
    }

    /// Record or refresh an agent's provider contact without touching
    /// availability or ownership.
    pub async fn set_agent_contact(
        &self,
        agent_id: &str,
        contact_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents (agent_id, availability, contact_uri, current_call_id, updated_at)
             VALUES (?, 'OFFLINE', ?, NULL, ?)
             ON CONFLICT(agent_id) DO UPDATE SET
                contact_uri = excluded.contact_uri,
                updated_at = excluded.updated_at",
        )
        .bind(agent_id)
        .bind(contact_uri)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<DbAgent>> {
        let agent = sqlx::query_as::<_, DbAgent>("SELECT * FROM agents WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(agent)
    }

    /// Point-in-time snapshot of agents eligible for a new ring:
    /// available and owning no call. Longest-idle first.
    pub async fn eligible_agents(&self) -> Result<Vec<DbAgent>> {
        let agents = sqlx::query_as::<_, DbAgent>(
            "SELECT * FROM agents
             WHERE availability = 'AVAILABLE' AND current_call_id IS NULL
             ORDER BY updated_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(agents)
    }

    /// Clear an agent's ownership, conditional on it still pointing at
    /// `call_id`. Idempotent: re-clearing returns false.
    pub async fn clear_agent_call(&self, agent_id: &str, call_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agents SET current_call_id = NULL
             WHERE agent_id = ? AND current_call_id = ?",
        )
        .bind(agent_id)
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// Call lifecycle operations
impl DatabaseManager {
    /// Record a new inbound call in the ringing state.
    pub async fn insert_ringing_call(
        &self,
        call_id: &str,
        provider_ref: &str,
        from_address: &str,
        to_address: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO calls (call_id, provider_ref, direction, status, from_address,
                                to_address, owner_agent_id, transfer_target, created_at)
             VALUES (?, ?, 'INBOUND', 'RINGING', ?, ?, NULL, NULL, ?)",
        )
        .bind(call_id)
        .bind(provider_ref)
        .bind(from_address)
        .bind(to_address)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record an outbound call, active and owned by the placing agent from
    /// the start (no ring phase). The agent reservation and call insert
    /// commit together; returns false if the agent was not eligible.
    pub async fn insert_outbound_call(
        &self,
        call_id: &str,
        provider_ref: &str,
        agent_id: &str,
        from_address: &str,
        to_address: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let reserved = sqlx::query(
            "UPDATE agents SET current_call_id = ?, updated_at = ?
             WHERE agent_id = ? AND availability = 'AVAILABLE' AND current_call_id IS NULL",
        )
        .bind(call_id)
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO calls (call_id, provider_ref, direction, status, from_address,
                                to_address, owner_agent_id, transfer_target, created_at, answered_at)
             VALUES (?, ?, 'OUTBOUND', 'ACTIVE', ?, ?, ?, NULL, ?, ?)",
        )
        .bind(call_id)
        .bind(provider_ref)
        .bind(from_address)
        .bind(to_address)
        .bind(agent_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_call(&self, call_id: &str) -> Result<Option<DbCall>> {
        let call = sqlx::query_as::<_, DbCall>("SELECT * FROM calls WHERE call_id = ?")
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(call)
    }

    pub async fn get_call_by_provider_ref(&self, provider_ref: &str) -> Result<Option<DbCall>> {
        let call = sqlx::query_as::<_, DbCall>("SELECT * FROM calls WHERE provider_ref = ?")
            .bind(provider_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(call)
    }

    /// Calls in any non-terminal status.
    pub async fn count_live_calls(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM calls
             WHERE status IN ('RINGING', 'ACTIVE', 'PARKED', 'TRANSFERRING')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Resolve a ringing call as missed.
    ///
    /// Conditional on the call still ringing, so when the ring timeout
    /// races caller abandonment (or a decline exhausting the ring set)
    /// exactly one path observes `true` and emits the cancel signals.
    pub async fn mark_call_missed(&self, call_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE calls SET status = 'MISSED', ended_at = ?
             WHERE call_id = ? AND status = 'RINGING'",
        )
        .bind(now)
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a call to a terminal status, conditional on the status the
    /// caller observed. Clears any pending transfer intent.
    pub async fn terminate_call(
        &self,
        call_id: &str,
        expected: &str,
        terminal: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE calls SET status = ?, transfer_target = NULL, owner_agent_id = NULL, ended_at = ?
             WHERE call_id = ? AND status = ?",
        )
        .bind(terminal)
        .bind(now)
        .bind(call_id)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn stats(&self) -> Result<DbStats> {
        let ringing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM calls WHERE status = 'RINGING'")
                .fetch_one(&self.pool)
                .await?;
        let active: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM calls WHERE status = 'ACTIVE'")
            .fetch_one(&self.pool)
            .await?;
        let parked: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parked_calls")
            .fetch_one(&self.pool)
            .await?;
        let available: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM agents
             WHERE availability = 'AVAILABLE' AND current_call_id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DbStats {
            ringing_calls: ringing,
            active_calls: active,
            parked_calls: parked,
            available_agents: available,
        })
    }
}

// Claim ledger operations
impl DatabaseManager {
    /// The claim arbitration write.
    ///
    /// A single `INSERT OR IGNORE` into a table keyed uniquely by call id
    /// decides the race; two agents claiming within the same instant both
    /// reach this statement and exactly one insert lands. The winner's
    /// call and presence updates commit in the same transaction, with the
    /// claim insert as the sole gate.
    pub async fn try_claim_call(
        &self,
        call_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimWrite> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO claims (call_id, agent_id, claimed_at) VALUES (?, ?, ?)",
        )
        .bind(call_id)
        .bind(agent_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let owner: Option<String> =
                sqlx::query_scalar("SELECT agent_id FROM claims WHERE call_id = ?")
                    .bind(call_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(ClaimWrite::AlreadyClaimed {
                owner: owner.unwrap_or_default(),
            });
        }

        // The claim landed, but a caller abandonment racing us may already
        // have resolved the call. Rolling back discards the claim row so
        // the store never records a winner for a dead ring.
        let updated = sqlx::query(
            "UPDATE calls SET status = 'ACTIVE', owner_agent_id = ?, answered_at = ?
             WHERE call_id = ? AND status = 'RINGING'",
        )
        .bind(agent_id)
        .bind(now)
        .bind(call_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ClaimWrite::NotRinging);
        }

        sqlx::query("UPDATE agents SET current_call_id = ?, updated_at = ? WHERE agent_id = ?")
            .bind(call_id)
            .bind(now)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Claim for call {} won by agent {}", call_id, agent_id);
        Ok(ClaimWrite::Won)
    }
}

// Ring assignment and event log operations
impl DatabaseManager {
    /// Record the eligibility snapshot taken at ring time.
    pub async fn insert_ring_assignments(
        &self,
        call_id: &str,
        agent_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for agent_id in agent_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO ring_assignments (call_id, agent_id, created_at)
                 VALUES (?, ?, ?)",
            )
            .bind(call_id)
            .bind(agent_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Invalidate one agent's assignment (per-agent decline). Idempotent.
    pub async fn remove_ring_assignment(&self, call_id: &str, agent_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM ring_assignments WHERE call_id = ? AND agent_id = ?")
                .bind(call_id)
                .bind(agent_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn assignments_for_call(&self, call_id: &str) -> Result<Vec<DbRingAssignment>> {
        let rows = sqlx::query_as::<_, DbRingAssignment>(
            "SELECT * FROM ring_assignments WHERE call_id = ? ORDER BY agent_id",
        )
        .bind(call_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_ring_assignments(&self, call_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ring_assignments WHERE call_id = ?")
                .bind(call_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Append to the ring event log. The log is append-only; consumers
    /// fold it and treat entries for already-resolved calls as no-ops.
    pub async fn append_ring_event(
        &self,
        call_id: &str,
        agent_id: Option<&str>,
        kind: &str,
        now: DateTime<Utc>,
    ) -> Result<DbRingEvent> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO ring_events (call_id, agent_id, kind, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(call_id)
        .bind(agent_id)
        .bind(kind)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(DbRingEvent {
            id,
            call_id: call_id.to_string(),
            agent_id: agent_id.map(|s| s.to_string()),
            kind: kind.to_string(),
            created_at: now,
        })
    }

    /// Calls currently being offered to one agent: its ring assignments
    /// restricted to calls still ringing, plus any transfer directed at it.
    pub async fn offered_call_ids_for_agent(&self, agent_id: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = sqlx::query_scalar(
            "SELECT ra.call_id FROM ring_assignments ra
             JOIN calls c ON c.call_id = ra.call_id
             WHERE ra.agent_id = ? AND c.status = 'RINGING'
             ORDER BY ra.call_id",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        let transfers: Vec<String> = sqlx::query_scalar(
            "SELECT call_id FROM calls
             WHERE transfer_target = ? AND status = 'TRANSFERRING'",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        ids.extend(transfers);
        Ok(ids)
    }

    pub async fn ring_events_for_call(&self, call_id: &str) -> Result<Vec<DbRingEvent>> {
        let rows = sqlx::query_as::<_, DbRingEvent>(
            "SELECT * FROM ring_events WHERE call_id = ? ORDER BY id ASC",
        )
        .bind(call_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// Park and transfer operations
impl DatabaseManager {
    /// Suspend an active call.
    ///
    /// One transaction moves the call to parked (conditional on the caller
    /// still owning it and it being active), records the parked row, and
    /// frees the parking agent. Returns false without side effects when
    /// the condition fails.
    pub async fn park_call(
        &self,
        parked_call_id: &str,
        call_id: &str,
        agent_id: &str,
        hold_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE calls SET status = 'PARKED', owner_agent_id = NULL
             WHERE call_id = ? AND owner_agent_id = ? AND status = 'ACTIVE'",
        )
        .bind(call_id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO parked_calls (parked_call_id, call_id, parked_by, hold_ref, parked_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(parked_call_id)
        .bind(call_id)
        .bind(agent_id)
        .bind(hold_ref)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE agents SET current_call_id = NULL, updated_at = ?
             WHERE agent_id = ? AND current_call_id = ?",
        )
        .bind(now)
        .bind(agent_id)
        .bind(call_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// The retrieval arbitration write.
    ///
    /// The conditional delete (with its row count) decides which of two
    /// racing retrievers wins; the loser observes zero rows and must not
    /// touch the provider leg. The target's reservation and the call's
    /// move to transferring commit in the same transaction, so any
    /// failure rolls the parked row back into existence.
    pub async fn take_parked_call(
        &self,
        parked_call_id: &str,
        target_agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UnparkWrite> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DbParkedCall>(
            "DELETE FROM parked_calls WHERE parked_call_id = ?
             RETURNING parked_call_id, call_id, parked_by, hold_ref, parked_at",
        )
        .bind(parked_call_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(UnparkWrite::NotFound);
        };

        let reserved = sqlx::query(
            "UPDATE agents SET current_call_id = ?, updated_at = ?
             WHERE agent_id = ? AND availability = 'AVAILABLE' AND current_call_id IS NULL",
        )
        .bind(&row.call_id)
        .bind(now)
        .bind(target_agent_id)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(UnparkWrite::NotEligible);
        }

        let updated = sqlx::query(
            "UPDATE calls SET status = 'TRANSFERRING', transfer_target = ?
             WHERE call_id = ? AND status = 'PARKED'",
        )
        .bind(target_agent_id)
        .bind(&row.call_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(UnparkWrite::NotParked);
        }

        tx.commit().await?;
        Ok(UnparkWrite::Taken(row))
    }

    /// Compensating re-insert after a provider redirect failure.
    ///
    /// Not a rollback - the delete already committed - so this restores
    /// the parked row, returns the call to parked, and releases the
    /// reserved target.
    pub async fn restore_parked_call(
        &self,
        row: &DbParkedCall,
        target_agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO parked_calls
                (parked_call_id, call_id, parked_by, hold_ref, parked_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.parked_call_id)
        .bind(&row.call_id)
        .bind(&row.parked_by)
        .bind(&row.hold_ref)
        .bind(row.parked_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE calls SET status = 'PARKED', transfer_target = NULL
             WHERE call_id = ? AND status = 'TRANSFERRING'",
        )
        .bind(&row.call_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE agents SET current_call_id = NULL, updated_at = ?
             WHERE agent_id = ? AND current_call_id = ?",
        )
        .bind(now)
        .bind(target_agent_id)
        .bind(&row.call_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete a parked row because its underlying call terminated
    /// (caller hung up on hold). Returns the row when this caller won the
    /// delete.
    pub async fn remove_parked_by_call(&self, call_id: &str) -> Result<Option<DbParkedCall>> {
        let row = sqlx::query_as::<_, DbParkedCall>(
            "DELETE FROM parked_calls WHERE call_id = ?
             RETURNING parked_call_id, call_id, parked_by, hold_ref, parked_at",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Delete every parked row older than `cutoff`, returning the deleted
    /// rows so the caller can mark the calls abandoned.
    pub async fn sweep_parked_calls(&self, cutoff: DateTime<Utc>) -> Result<Vec<DbParkedCall>> {
        let rows = sqlx::query_as::<_, DbParkedCall>(
            "DELETE FROM parked_calls WHERE parked_at <= ?
             RETURNING parked_call_id, call_id, parked_by, hold_ref, parked_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_parked_call(&self, parked_call_id: &str) -> Result<Option<DbParkedCall>> {
        let row = sqlx::query_as::<_, DbParkedCall>(
            "SELECT * FROM parked_calls WHERE parked_call_id = ?",
        )
        .bind(parked_call_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_parked_calls(&self) -> Result<Vec<DbParkedCall>> {
        let rows =
            sqlx::query_as::<_, DbParkedCall>("SELECT * FROM parked_calls ORDER BY parked_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Resolve a transferring call to active ownership by its recorded
    /// transfer target. Returns the new owner when this call finalized the
    /// transfer.
    pub async fn finalize_transfer(
        &self,
        call_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let owner: Option<String> = sqlx::query_scalar(
            "UPDATE calls SET status = 'ACTIVE', owner_agent_id = transfer_target,
                    transfer_target = NULL, answered_at = COALESCE(answered_at, ?)
             WHERE call_id = ? AND status = 'TRANSFERRING' AND transfer_target IS NOT NULL
             RETURNING owner_agent_id",
        )
        .bind(now)
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner)
    }
}
