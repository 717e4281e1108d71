//! # Client Reconciliation Layer
//!
//! Each connected client folds the ordered change stream into a local view
//! of `{incoming, active, parked}` for its agent. The fold is pure and
//! idempotent: applying any event twice leaves the view identical, which
//! is what lets the stream be delivered at-least-once and lets a client's
//! own optimistic actions echo back without double-rendering - there are
//! no "already processed" flags, the reduction itself absorbs duplicates.
//!
//! Late-arriving ring signals for calls the view has already seen resolve
//! are no-ops by construction: resolution marks the call and subsequent
//! ring-start entries for it are ignored. A directed transfer reopens the
//! call for its target, since a transfer is a deliberate re-offer.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::events::{ChangeEvent, RingEvent, RingEventKind};
use crate::orchestrator::types::{CallId, CallStatus, ParkedCallId};

/// Entries the fold retains for resolved calls, to absorb late ring
/// signals. Oldest entries are dropped beyond this bound.
const RESOLVED_CAP: usize = 1024;

/// One parked call as the view presents it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedSummary {
    pub parked_call_id: ParkedCallId,
    pub call_id: CallId,
    pub parked_by: AgentId,
}

/// One agent's reconciled view of the coordination state
///
/// Built exclusively by folding [`ChangeEvent`]s; nothing else mutates it.
#[derive(Debug, Clone)]
pub struct AgentView {
    agent_id: AgentId,

    /// Calls currently being offered to this agent
    incoming: BTreeSet<CallId>,

    /// The call this agent owns, if any
    active: Option<CallId>,

    /// Every parked call; parked calls are unowned and visible to all
    parked: BTreeMap<ParkedCallId, ParkedSummary>,

    /// Calls whose ring this view has seen resolve
    resolved: BTreeSet<CallId>,
}

impl AgentView {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            incoming: BTreeSet::new(),
            active: None,
            parked: BTreeMap::new(),
            resolved: BTreeSet::new(),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn incoming(&self) -> &BTreeSet<CallId> {
        &self.incoming
    }

    pub fn active(&self) -> Option<&CallId> {
        self.active.as_ref()
    }

    pub fn parked(&self) -> impl Iterator<Item = &ParkedSummary> {
        self.parked.values()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Fold one change into the view.
    pub fn apply(&mut self, event: &ChangeEvent) {
        match event {
            ChangeEvent::Ring(ring) => self.apply_ring(ring),
            ChangeEvent::CallChanged {
                call_id,
                status,
                owner,
            } => self.apply_call_changed(call_id, *status, owner.as_ref()),
            ChangeEvent::ParkedCallAdded {
                parked_call_id,
                call_id,
                parked_by,
            } => {
                // Insertion by key also deduplicates the echo of this
                // client's own park action.
                self.parked.insert(
                    parked_call_id.clone(),
                    ParkedSummary {
                        parked_call_id: parked_call_id.clone(),
                        call_id: call_id.clone(),
                        parked_by: parked_by.clone(),
                    },
                );
            }
            ChangeEvent::ParkedCallRemoved { parked_call_id, .. } => {
                self.parked.remove(parked_call_id);
            }
            ChangeEvent::PresenceChanged { .. } => {}
        }
    }

    /// Fold a whole ordered sequence, oldest first.
    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a ChangeEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    fn addressed_to_me(&self, ring: &RingEvent) -> bool {
        match &ring.agent_id {
            Some(agent) => *agent == self.agent_id,
            None => true,
        }
    }

    fn apply_ring(&mut self, ring: &RingEvent) {
        match ring.kind {
            RingEventKind::RingStart => {
                if !self.addressed_to_me(ring) {
                    return;
                }
                // A ring signal arriving after the call resolved is stale.
                if self.resolved.contains(&ring.call_id) {
                    return;
                }
                if self.active.as_ref() == Some(&ring.call_id) {
                    return;
                }
                self.incoming.insert(ring.call_id.clone());
            }
            RingEventKind::RingCancel => {
                if self.addressed_to_me(ring) {
                    self.incoming.remove(&ring.call_id);
                }
                self.mark_resolved(ring.call_id.clone());
            }
            RingEventKind::Answered => {
                // Equivalent to a cancel for everyone except the winner;
                // the winner's ownership arrives as a call change.
                if self.addressed_to_me(ring) {
                    self.incoming.remove(&ring.call_id);
                }
                self.mark_resolved(ring.call_id.clone());
            }
            RingEventKind::Declined => {
                if !self.addressed_to_me(ring) {
                    return;
                }
                self.incoming.remove(&ring.call_id);
                self.mark_resolved(ring.call_id.clone());
            }
            RingEventKind::TransferStart => {
                if !self.addressed_to_me(ring) {
                    return;
                }
                // A transfer deliberately re-offers a previously resolved
                // call to this one agent.
                self.resolved.remove(&ring.call_id);
                self.incoming.insert(ring.call_id.clone());
            }
        }
    }

    fn apply_call_changed(
        &mut self,
        call_id: &CallId,
        status: CallStatus,
        owner: Option<&AgentId>,
    ) {
        match status {
            CallStatus::Ringing => {}
            CallStatus::Active => {
                self.incoming.remove(call_id);
                if owner == Some(&self.agent_id) {
                    self.active = Some(call_id.clone());
                } else if self.active.as_ref() == Some(call_id) {
                    // Authoritative supersession of whatever this client
                    // optimistically believed.
                    self.active = None;
                }
                self.mark_resolved(call_id.clone());
            }
            CallStatus::Parked => {
                if self.active.as_ref() == Some(call_id) {
                    self.active = None;
                }
                self.incoming.remove(call_id);
            }
            CallStatus::Transferring => {
                if self.active.as_ref() == Some(call_id) {
                    self.active = None;
                }
            }
            CallStatus::Completed | CallStatus::Missed | CallStatus::Abandoned => {
                self.incoming.remove(call_id);
                if self.active.as_ref() == Some(call_id) {
                    self.active = None;
                }
                self.parked.retain(|_, summary| summary.call_id != *call_id);
                self.mark_resolved(call_id.clone());
            }
        }
    }

    fn mark_resolved(&mut self, call_id: CallId) {
        self.resolved.insert(call_id);
        while self.resolved.len() > RESOLVED_CAP {
            let oldest = self.resolved.iter().next().cloned();
            if let Some(oldest) = oldest {
                self.resolved.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ring(call: &str, agent: Option<&str>, kind: RingEventKind, id: i64) -> ChangeEvent {
        ChangeEvent::Ring(RingEvent {
            id,
            call_id: CallId::from(call),
            agent_id: agent.map(AgentId::from),
            kind,
            created_at: Utc::now(),
        })
    }

    #[test]
    fn ring_start_populates_incoming() {
        let mut view = AgentView::new(AgentId::from("alice"));
        view.apply(&ring("c1", Some("alice"), RingEventKind::RingStart, 1));
        assert!(view.incoming().contains(&CallId::from("c1")));

        // Scoped to someone else: invisible here.
        view.apply(&ring("c2", Some("bob"), RingEventKind::RingStart, 2));
        assert!(!view.incoming().contains(&CallId::from("c2")));
    }

    #[test]
    fn fold_is_idempotent() {
        let events = vec![
            ring("c1", Some("alice"), RingEventKind::RingStart, 1),
            ChangeEvent::CallChanged {
                call_id: CallId::from("c1"),
                status: CallStatus::Active,
                owner: Some(AgentId::from("alice")),
            },
            ChangeEvent::ParkedCallAdded {
                parked_call_id: ParkedCallId::from("p1"),
                call_id: CallId::from("c1"),
                parked_by: AgentId::from("alice"),
            },
            ChangeEvent::CallChanged {
                call_id: CallId::from("c1"),
                status: CallStatus::Parked,
                owner: None,
            },
        ];

        let mut once = AgentView::new(AgentId::from("alice"));
        once.apply_all(&events);

        let mut twice = AgentView::new(AgentId::from("alice"));
        for event in &events {
            twice.apply(event);
            twice.apply(event);
        }

        assert_eq!(once.incoming(), twice.incoming());
        assert_eq!(once.active(), twice.active());
        assert_eq!(once.parked_count(), twice.parked_count());
    }

    #[test]
    fn answered_retracts_losers_but_not_winner() {
        let mut loser = AgentView::new(AgentId::from("bob"));
        loser.apply(&ring("c1", Some("bob"), RingEventKind::RingStart, 1));
        loser.apply(&ring("c1", None, RingEventKind::Answered, 2));
        assert!(loser.incoming().is_empty());
        assert_eq!(loser.active(), None);

        let mut winner = AgentView::new(AgentId::from("alice"));
        winner.apply(&ring("c1", Some("alice"), RingEventKind::RingStart, 1));
        winner.apply(&ring("c1", None, RingEventKind::Answered, 2));
        winner.apply(&ChangeEvent::CallChanged {
            call_id: CallId::from("c1"),
            status: CallStatus::Active,
            owner: Some(AgentId::from("alice")),
        });
        assert_eq!(winner.active(), Some(&CallId::from("c1")));
    }

    #[test]
    fn late_ring_start_after_resolution_is_noop() {
        let mut view = AgentView::new(AgentId::from("alice"));
        view.apply(&ring("c1", Some("alice"), RingEventKind::RingStart, 1));
        view.apply(&ring("c1", None, RingEventKind::RingCancel, 2));
        assert!(view.incoming().is_empty());

        // Redelivery of the original offer must not resurrect it.
        view.apply(&ring("c1", Some("alice"), RingEventKind::RingStart, 1));
        assert!(view.incoming().is_empty());
    }

    #[test]
    fn double_cancel_matches_single_cancel() {
        let mut single = AgentView::new(AgentId::from("alice"));
        single.apply(&ring("c1", Some("alice"), RingEventKind::RingStart, 1));
        single.apply(&ring("c1", None, RingEventKind::RingCancel, 2));

        let mut double = AgentView::new(AgentId::from("alice"));
        double.apply(&ring("c1", Some("alice"), RingEventKind::RingStart, 1));
        double.apply(&ring("c1", None, RingEventKind::RingCancel, 2));
        double.apply(&ring("c1", None, RingEventKind::RingCancel, 2));

        assert_eq!(single.incoming(), double.incoming());
        assert_eq!(single.active(), double.active());
    }

    #[test]
    fn transfer_reoffers_resolved_call_to_target_only() {
        let mut target = AgentView::new(AgentId::from("bob"));
        target.apply(&ring("c1", None, RingEventKind::Answered, 1));
        target.apply(&ring("c1", Some("bob"), RingEventKind::TransferStart, 2));
        assert!(target.incoming().contains(&CallId::from("c1")));

        let mut bystander = AgentView::new(AgentId::from("carol"));
        bystander.apply(&ring("c1", None, RingEventKind::Answered, 1));
        bystander.apply(&ring("c1", Some("bob"), RingEventKind::TransferStart, 2));
        assert!(bystander.incoming().is_empty());
    }

    #[test]
    fn own_park_echo_does_not_double_render() {
        let mut view = AgentView::new(AgentId::from("alice"));
        let added = ChangeEvent::ParkedCallAdded {
            parked_call_id: ParkedCallId::from("p1"),
            call_id: CallId::from("c1"),
            parked_by: AgentId::from("alice"),
        };
        // The client applies its own optimistic insert, then the store
        // echoes the same change back.
        view.apply(&added);
        view.apply(&added);
        assert_eq!(view.parked_count(), 1);
    }
}
