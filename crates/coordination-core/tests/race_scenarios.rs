//! Race and failure-path scenarios
//!
//! The properties that make the coordination layer worth having: a single
//! claim winner under concurrency, no double retrieval of a parked call,
//! authoritative provider termination, compensation after redirect
//! failures, and view convergence for every connected client.

mod common;

use common::{assert_presence_consistent, create_test_engine, create_test_engine_with, sign_in_agents};
use serial_test::serial;
use std::time::Duration;

use parkline_coordination_core::prelude::*;

#[tokio::test]
#[serial]
async fn test_concurrent_claims_have_exactly_one_winner() {
    let (engine, _provider) = create_test_engine().await;
    sign_in_agents(&engine, &["alice", "bob"]).await;

    // Repeat the race; a single lucky interleaving proves nothing.
    for round in 0..5 {
        let call_id = engine
            .on_inbound_call(
                &CallRef::from(format!("PX-race-{}", round)),
                "+15550100",
                "+15550199",
            )
            .await
            .expect("inbound signal failed");

        let alice = AgentId::from("alice");
        let bob = AgentId::from("bob");
        let (a, b) = tokio::join!(
            engine.claim(&call_id, &alice),
            engine.claim(&call_id, &bob),
        );
        let a = a.expect("claim must not error");
        let b = b.expect("claim must not error");

        assert!(
            a.won ^ b.won,
            "round {}: expected exactly one winner, got alice={} bob={}",
            round,
            a.won,
            b.won
        );

        let info = engine
            .call_info(&call_id)
            .await
            .expect("call query failed")
            .expect("call should exist");
        let winner = if a.won { "alice" } else { "bob" };
        assert_eq!(info.owner, Some(AgentId::from(winner)));

        // Reset for the next round.
        engine
            .on_provider_status(ProviderStatusEvent {
                call: CallRef::from(format!("PX-race-{}", round)),
                status: ProviderCallStatus::Completed,
                at: Utc::now(),
            })
            .await
            .expect("status callback failed");
    }
}

#[tokio::test]
#[serial]
async fn test_claim_race_with_bystander_retraction() {
    let (engine, _provider) = create_test_engine().await;
    sign_in_agents(&engine, &["alice", "bob", "carol"]).await;

    let mut rx = engine.subscribe();

    let call_id = engine
        .on_inbound_call(&CallRef::from("PX-1"), "+15550100", "+15550199")
        .await
        .expect("inbound signal failed");

    // Two clients react to the same ring within the same instant.
    let alice = AgentId::from("alice");
    let bob = AgentId::from("bob");
    let (a, b) = tokio::join!(
        engine.claim(&call_id, &alice),
        engine.claim(&call_id, &bob),
    );
    let a = a.expect("claim must not error");
    let b = b.expect("claim must not error");
    assert!(a.won ^ b.won);

    // Carol never claimed; her fold of the stream retracts the offer.
    let mut carol = AgentView::new(AgentId::from("carol"));
    while let Ok(event) = rx.try_recv() {
        carol.apply(&event);
    }
    assert!(carol.incoming().is_empty());
    assert_eq!(carol.active(), None);

    assert_presence_consistent(&engine, &["alice", "bob", "carol"]).await;
}

#[tokio::test]
#[serial]
async fn test_concurrent_unpark_no_double_retrieval() {
    let (engine, provider) = create_test_engine().await;
    sign_in_agents(&engine, &["alice", "bob", "carol"]).await;

    let call_id = engine
        .on_inbound_call(&CallRef::from("PX-1"), "+15550100", "+15550199")
        .await
        .expect("inbound signal failed");
    assert!(engine
        .claim(&call_id, &AgentId::from("alice"))
        .await
        .expect("claim failed")
        .won);
    let parked_id = engine
        .park(&call_id, &AgentId::from("alice"))
        .await
        .expect("park failed");

    let bob = AgentId::from("bob");
    let carol = AgentId::from("carol");
    let (b, c) = tokio::join!(
        engine.unpark(&parked_id, &bob),
        engine.unpark(&parked_id, &carol),
    );

    let winners = [("bob", &b), ("carol", &c)]
        .into_iter()
        .filter(|(_, outcome)| outcome.is_ok())
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
    assert_eq!(winners.len(), 1, "exactly one retrieval may succeed");

    for outcome in [&b, &c] {
        if let Err(e) = outcome {
            assert!(
                matches!(e, CoordinationError::NotFound(_)),
                "loser must observe NotFound, got {}",
                e
            );
        }
    }

    // The losing client never touched the provider leg: one redirect into
    // hold plus exactly one out of it.
    assert_eq!(provider.redirects().len(), 2);

    let winner = engine
        .database()
        .get_agent(winners[0])
        .await
        .expect("agent query failed")
        .expect("winner should exist");
    assert_eq!(winner.current_call_id, Some(call_id.0.clone()));

    assert_presence_consistent(&engine, &["alice", "bob", "carol"]).await;
}

#[tokio::test]
#[serial]
async fn test_caller_abandonment_during_ring() {
    let (engine, _provider) = create_test_engine().await;
    sign_in_agents(&engine, &["alice", "bob"]).await;

    let call_id = engine
        .on_inbound_call(&CallRef::from("PX-1"), "+15550100", "+15550199")
        .await
        .expect("inbound signal failed");

    // Caller hangs up before anyone answers.
    engine
        .on_provider_status(ProviderStatusEvent {
            call: CallRef::from("PX-1"),
            status: ProviderCallStatus::Failed,
            at: Utc::now(),
        })
        .await
        .expect("status callback failed");

    let info = engine
        .call_info(&call_id)
        .await
        .expect("call query failed")
        .expect("call should exist");
    assert_eq!(info.status, CallStatus::Missed);

    // A claim racing the abandonment fails; it must never resurrect the
    // call or leave a claim behind.
    let late = engine.claim(&call_id, &AgentId::from("alice")).await;
    assert!(matches!(late, Err(CoordinationError::NotFound(_))));

    let claims: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM claims WHERE call_id = ?")
        .bind(call_id.as_ref())
        .fetch_one(engine.database().pool())
        .await
        .expect("claims query failed");
    assert_eq!(claims, 0);
}

#[tokio::test]
#[serial]
async fn test_redirect_failure_restores_parked_record() {
    let (engine, provider) = create_test_engine().await;
    sign_in_agents(&engine, &["alice", "bob"]).await;

    let call_id = engine
        .on_inbound_call(&CallRef::from("PX-1"), "+15550100", "+15550199")
        .await
        .expect("inbound signal failed");
    assert!(engine
        .claim(&call_id, &AgentId::from("alice"))
        .await
        .expect("claim failed")
        .won);
    let parked_id = engine
        .park(&call_id, &AgentId::from("alice"))
        .await
        .expect("park failed");

    provider.fail_redirects(true);
    let failed = engine.unpark(&parked_id, &AgentId::from("bob")).await;
    assert!(matches!(
        failed,
        Err(CoordinationError::ProviderUnavailable(_))
    ));

    // Compensation: the parked record is back, the call is parked, and
    // the would-be target holds nothing.
    let parked = engine
        .database()
        .get_parked_call(parked_id.as_ref())
        .await
        .expect("parked query failed");
    assert!(parked.is_some());

    let info = engine
        .call_info(&call_id)
        .await
        .expect("call query failed")
        .expect("call should exist");
    assert_eq!(info.status, CallStatus::Parked);
    assert_eq!(info.transfer_target, None);

    let bob = engine
        .database()
        .get_agent("bob")
        .await
        .expect("agent query failed")
        .expect("bob should exist");
    assert_eq!(bob.current_call_id, None);

    // Once the provider recovers, the same retrieval goes through.
    provider.fail_redirects(false);
    engine
        .unpark(&parked_id, &AgentId::from("bob"))
        .await
        .expect("retry unpark failed");

    assert_presence_consistent(&engine, &["alice", "bob"]).await;
}

#[tokio::test]
#[serial]
async fn test_caller_hangup_while_parked_overrides_retrieval() {
    let (engine, _provider) = create_test_engine().await;
    sign_in_agents(&engine, &["alice", "bob"]).await;

    let call_id = engine
        .on_inbound_call(&CallRef::from("PX-1"), "+15550100", "+15550199")
        .await
        .expect("inbound signal failed");
    assert!(engine
        .claim(&call_id, &AgentId::from("alice"))
        .await
        .expect("claim failed")
        .won);
    let parked_id = engine
        .park(&call_id, &AgentId::from("alice"))
        .await
        .expect("park failed");

    // The held leg dies inside the provider while nobody is watching.
    engine
        .on_provider_status(ProviderStatusEvent {
            call: CallRef::from("PX-1"),
            status: ProviderCallStatus::Completed,
            at: Utc::now(),
        })
        .await
        .expect("status callback failed");

    let info = engine
        .call_info(&call_id)
        .await
        .expect("call query failed")
        .expect("call should exist");
    assert_eq!(info.status, CallStatus::Abandoned);

    // The termination already consumed the parked row; a late retrieval
    // loses cleanly.
    let late = engine.unpark(&parked_id, &AgentId::from("bob")).await;
    assert!(matches!(late, Err(CoordinationError::NotFound(_))));
}

#[tokio::test]
#[serial]
async fn test_sweep_abandons_overaged_parked_calls() {
    let (engine, _provider) = create_test_engine_with(|config| {
        config.park.max_park_duration = Duration::from_millis(50);
    })
    .await;
    sign_in_agents(&engine, &["alice"]).await;

    let call_id = engine
        .on_inbound_call(&CallRef::from("PX-1"), "+15550100", "+15550199")
        .await
        .expect("inbound signal failed");
    assert!(engine
        .claim(&call_id, &AgentId::from("alice"))
        .await
        .expect("claim failed")
        .won);
    engine
        .park(&call_id, &AgentId::from("alice"))
        .await
        .expect("park failed");

    tokio::time::sleep(Duration::from_millis(120)).await;

    // The sweep runs server-side, with no agent client involved.
    let swept = engine.sweep_parked_calls().await.expect("sweep failed");
    assert_eq!(swept, 1);

    let info = engine
        .call_info(&call_id)
        .await
        .expect("call query failed")
        .expect("call should exist");
    assert_eq!(info.status, CallStatus::Abandoned);

    let again = engine.sweep_parked_calls().await.expect("sweep failed");
    assert_eq!(again, 0);
}

#[tokio::test]
#[serial]
async fn test_views_converge_through_full_lifecycle() {
    let (engine, _provider) = create_test_engine().await;
    sign_in_agents(&engine, &["alice", "bob", "carol"]).await;

    let mut rx = engine.subscribe();

    // Ring -> alice answers -> alice parks -> bob retrieves -> connected.
    let call_id = engine
        .on_inbound_call(&CallRef::from("PX-1"), "+15550100", "+15550199")
        .await
        .expect("inbound signal failed");
    assert!(engine
        .claim(&call_id, &AgentId::from("alice"))
        .await
        .expect("claim failed")
        .won);
    let parked_id = engine
        .park(&call_id, &AgentId::from("alice"))
        .await
        .expect("park failed");
    engine
        .unpark(&parked_id, &AgentId::from("bob"))
        .await
        .expect("unpark failed");
    engine
        .on_provider_status(ProviderStatusEvent {
            call: CallRef::from("PX-1"),
            status: ProviderCallStatus::InProgress,
            at: Utc::now(),
        })
        .await
        .expect("status callback failed");

    let mut alice = AgentView::new(AgentId::from("alice"));
    let mut bob = AgentView::new(AgentId::from("bob"));
    let mut carol = AgentView::new(AgentId::from("carol"));
    while let Ok(event) = rx.try_recv() {
        alice.apply(&event);
        bob.apply(&event);
        carol.apply(&event);
    }

    // Every client ends on the same truth: bob owns the call, nothing is
    // ringing, nothing is parked.
    assert_eq!(bob.active(), Some(&call_id));
    assert!(bob.incoming().is_empty());

    for view in [&alice, &carol] {
        assert!(view.incoming().is_empty());
        assert_eq!(view.active(), None);
        assert_eq!(view.parked_count(), 0);
    }
}
