//! # Coordination Event Stream
//!
//! Row-level change notifications fanned out to every subscribed client.
//! This is the stream the reconciliation layer folds: an ordered sequence
//! of ring events and record changes, delivered at-least-once, that each
//! client reduces into its own `{incoming, active, parked}` view.
//!
//! The bus never carries authority. The shared store decides every race;
//! events only report what the store already committed, so consumers must
//! treat re-delivery and late arrival as normal (folding any event twice
//! leaves the view unchanged).
//!
//! ## Examples
//!
//! ```rust
//! use parkline_coordination_core::events::{ChangeEvent, EventBus, RingEventKind};
//!
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! // Publishers fire and forget; subscribers fold.
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         println!("change: {:?}", event);
//!     }
//! });
//! # }
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::agent::AgentId;
use crate::orchestrator::types::{CallId, CallStatus, ParkedCallId};

/// Ring signal kinds, mirroring the append-only `ring_events` log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingEventKind {
    /// The call is being offered to the scoped agent
    RingStart,
    /// The offer is withdrawn (timeout or caller abandonment)
    RingCancel,
    /// Some agent won the claim; losers retract their incoming entry
    Answered,
    /// The scoped agent declined; only that agent's offer is withdrawn
    Declined,
    /// A parked call is being directed at the scoped agent only
    TransferStart,
}

impl RingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RingEventKind::RingStart => "RING_START",
            RingEventKind::RingCancel => "RING_CANCEL",
            RingEventKind::Answered => "ANSWERED",
            RingEventKind::Declined => "DECLINED",
            RingEventKind::TransferStart => "TRANSFER_START",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RING_START" => Some(RingEventKind::RingStart),
            "RING_CANCEL" => Some(RingEventKind::RingCancel),
            "ANSWERED" => Some(RingEventKind::Answered),
            "DECLINED" => Some(RingEventKind::Declined),
            "TRANSFER_START" => Some(RingEventKind::TransferStart),
            _ => None,
        }
    }
}

/// One entry of the append-only ring event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingEvent {
    /// Log sequence number assigned by the store
    pub id: i64,

    /// The call the signal belongs to
    pub call_id: CallId,

    /// Scoped recipient; `None` addresses every assigned agent
    pub agent_id: Option<AgentId>,

    /// Signal kind
    pub kind: RingEventKind,

    /// When the signal was appended
    pub created_at: DateTime<Utc>,
}

/// Row-level change notification delivered to subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// An entry was appended to the ring event log
    Ring(RingEvent),

    /// A call row changed status or owner
    CallChanged {
        call_id: CallId,
        status: CallStatus,
        owner: Option<AgentId>,
    },

    /// A parked-call row was inserted
    ParkedCallAdded {
        parked_call_id: ParkedCallId,
        call_id: CallId,
        parked_by: AgentId,
    },

    /// A parked-call row was deleted (retrieved, abandoned, or swept)
    ParkedCallRemoved {
        parked_call_id: ParkedCallId,
        call_id: CallId,
    },

    /// An agent row changed availability
    PresenceChanged { agent_id: AgentId, available: bool },
}

/// Broadcast fan-out of [`ChangeEvent`]s with a bounded replay buffer
///
/// Built on `tokio::sync::broadcast`: slow subscribers may observe
/// `Lagged` and should resynchronize from a snapshot, which the
/// reconciliation fold supports by construction.
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,

    /// Recent events, capped; lets a reconnecting client catch up without
    /// a full snapshot when its gap is small.
    history: Mutex<VecDeque<ChangeEvent>>,

    history_cap: usize,
}

impl EventBus {
    /// Create a bus whose broadcast channel and history hold `capacity`
    /// events each.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            history_cap: capacity,
        }
    }

    /// Subscribe to the live stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// The live stream as a `Stream`, for clients folding with stream
    /// combinators rather than a recv loop. Lag shows up as an `Err` item.
    pub fn stream(&self) -> BroadcastStream<ChangeEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Publish a change to every subscriber.
    ///
    /// Publishing with zero subscribers is not an error; server-side
    /// logic (sweeps, timeouts) publishes unconditionally.
    pub fn publish(&self, event: ChangeEvent) {
        {
            let mut history = self.history.lock();
            if history.len() == self.history_cap {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        match self.sender.send(event) {
            Ok(receivers) => debug!("📢 Change event delivered to {} subscribers", receivers),
            Err(_) => debug!("📢 Change event recorded with no subscribers"),
        }
    }

    /// Copy of the retained history, oldest first.
    pub fn recent(&self) -> Vec<ChangeEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(ChangeEvent::PresenceChanged {
            agent_id: AgentId::from("alice"),
            available: true,
        });

        match rx.recv().await.unwrap() {
            ChangeEvent::PresenceChanged { agent_id, available } => {
                assert_eq!(agent_id, AgentId::from("alice"));
                assert!(available);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = EventBus::new(4);
        for i in 0..10 {
            bus.publish(ChangeEvent::PresenceChanged {
                agent_id: AgentId::from(format!("agent-{}", i)),
                available: true,
            });
        }
        assert_eq!(bus.recent().len(), 4);
    }

    #[tokio::test]
    async fn stream_surface_delivers_events() {
        use tokio_stream::StreamExt;

        let bus = EventBus::new(16);
        let mut stream = bus.stream();

        bus.publish(ChangeEvent::PresenceChanged {
            agent_id: AgentId::from("bob"),
            available: false,
        });

        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, ChangeEvent::PresenceChanged { .. }));
    }

    #[test]
    fn change_events_cross_the_wire_as_json() {
        let event = ChangeEvent::Ring(RingEvent {
            id: 7,
            call_id: CallId::from("c1"),
            agent_id: Some(AgentId::from("alice")),
            kind: RingEventKind::RingStart,
            created_at: Utc::now(),
        });

        let json = serde_json::to_string(&event).unwrap();
        let back: ChangeEvent = serde_json::from_str(&json).unwrap();
        match back {
            ChangeEvent::Ring(ring) => {
                assert_eq!(ring.id, 7);
                assert_eq!(ring.kind, RingEventKind::RingStart);
                assert_eq!(ring.agent_id, Some(AgentId::from("alice")));
            }
            other => panic!("unexpected event after round trip: {:?}", other),
        }
    }

    #[test]
    fn ring_event_kind_round_trips() {
        for kind in [
            RingEventKind::RingStart,
            RingEventKind::RingCancel,
            RingEventKind::Answered,
            RingEventKind::Declined,
            RingEventKind::TransferStart,
        ] {
            assert_eq!(RingEventKind::from_str(kind.as_str()), Some(kind));
        }
    }
}
