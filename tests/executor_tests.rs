mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use alphaflow::db::{IntentRepo, MemoryStore, PositionRepo, SettlementRepo};
use alphaflow::errors::PipelineError;
use alphaflow::execution::{ExecutionOutcome, ReconcileOutcome};
use alphaflow::ingestion::NormalizeOutcome;
use alphaflow::models::{AgentDeployment, IntentState, IntentUpdate, TradeIntent, Venue};
use alphaflow::services::Pipeline;
use alphaflow::venues::{VenueError, VenueRegistry};

use common::{ScriptedVenue, StatusScript};

async fn routed_intent(
    store: &MemoryStore,
    pipeline: &Pipeline,
    deployment: &AgentDeployment,
    event: &str,
) -> TradeIntent {
    let c = common::candidate("inst:desk-1", event, "BTC", "LONG", 0.9);
    let signal = match pipeline.normalizer.normalize(&c).await.unwrap() {
        NormalizeOutcome::Accepted(s) => s,
        other => panic!("expected accepted signal, got {other:?}"),
    };
    pipeline.router.fan_out(&signal).await.unwrap();
    store
        .intent_for(signal.id, deployment.id)
        .await
        .unwrap()
        .expect("intent created")
}

fn registry(venues: &[&Arc<ScriptedVenue>]) -> VenueRegistry {
    venues
        .iter()
        .fold(VenueRegistry::new(), |r, v| r.with((*v).clone()))
}

#[tokio::test]
async fn executes_once_and_opens_position() {
    let store = Arc::new(MemoryStore::new());
    let (source, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    let config = common::test_config(&[]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    assert_eq!(intent.state, IntentState::Routed);

    let position = match pipeline.executor.execute(intent.id).await.unwrap() {
        ExecutionOutcome::Opened(p) => p,
        other => panic!("expected open, got {other:?}"),
    };
    assert_eq!(position.entry_price, Decimal::from(100));
    assert_eq!(position.qty, Decimal::from(2));
    assert_eq!(position.venue, Venue::Hyperliquid);

    // A second attempt finds nothing to claim.
    assert!(matches!(
        pipeline.executor.execute(intent.id).await.unwrap(),
        ExecutionOutcome::NotClaimed
    ));
    assert_eq!(hl.submit_count(), 1);

    let submitted = hl.submissions().await;
    assert_eq!(submitted[0].client_ref, intent.id.to_string());

    let intent = store.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(intent.state, IntentState::Open);
    assert!(intent.tx_ref.is_some());

    let records = store.impact_records_for_position(position.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].alpha_source_id, source.id);
    assert_eq!(records[0].weight, Decimal::ONE);
    assert!(records[0].in_flight);
}

#[tokio::test]
async fn restart_after_position_write_never_resubmits() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    let config = common::test_config(&[]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    assert!(matches!(
        pipeline.executor.execute(intent.id).await.unwrap(),
        ExecutionOutcome::Opened(_)
    ));

    // Simulate a crash between the position insert and the OPEN transition.
    store
        .transition_intent(intent.id, IntentState::Open, IntentState::Preparing, &IntentUpdate::default())
        .await
        .unwrap()
        .unwrap();
    store.age_intent(intent.id, Utc::now() - Duration::hours(1)).await;

    let report = pipeline.executor.sweep_stale().await.unwrap();
    assert_eq!(report.released, 1);

    assert!(matches!(
        pipeline.executor.execute(intent.id).await.unwrap(),
        ExecutionOutcome::AlreadyOpen(_)
    ));
    assert_eq!(hl.submit_count(), 1);
    assert_eq!(store.list_positions(false, 10).await.unwrap().len(), 1);
    assert_eq!(
        store.get_intent(intent.id).await.unwrap().unwrap().state,
        IntentState::Open
    );
}

#[tokio::test]
async fn rejected_venue_reroutes_to_next_priority() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid, Venue::Ostium]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    let ostium = Arc::new(ScriptedVenue::new(Venue::Ostium, &["BTC"]));
    hl.script_submits(vec![Err(VenueError::Rejected("market halted".into()))])
        .await;
    let config = common::test_config(&[]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl, &ostium]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    assert_eq!(intent.venue, Some(Venue::Hyperliquid));

    let position = match pipeline.executor.execute(intent.id).await.unwrap() {
        ExecutionOutcome::Opened(p) => p,
        other => panic!("expected open, got {other:?}"),
    };
    assert_eq!(position.venue, Venue::Ostium);
    assert_eq!(ostium.submit_count(), 1);

    let intent = store.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(intent.venue, Some(Venue::Ostium));
    assert_eq!(intent.excluded_venues, vec![Venue::Hyperliquid]);
    let rationale = intent.rationale.unwrap();
    assert_eq!(rationale.selected, Some(Venue::Ostium));
    assert!(rationale.note.unwrap().contains("market halted"));
}

#[tokio::test]
async fn rejection_with_no_alternative_is_unroutable() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    hl.script_submits(vec![Err(VenueError::Rejected("leverage not allowed".into()))])
        .await;
    let config = common::test_config(&[]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    assert!(matches!(
        pipeline.executor.execute(intent.id).await.unwrap(),
        ExecutionOutcome::Unroutable
    ));

    let intent = store.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(intent.state, IntentState::Unroutable);
    assert_eq!(intent.excluded_venues, vec![Venue::Hyperliquid]);
    assert!(store.list_positions(false, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn insufficient_balance_fails_without_submitting() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    hl.set_balance(Decimal::ONE).await;
    let config = common::test_config(&[]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    match pipeline.executor.execute(intent.id).await.unwrap() {
        ExecutionOutcome::Failed(reason) => {
            assert!(reason.starts_with("user permanent"));
            assert!(reason.contains("insufficient funds"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(hl.submit_count(), 0);
    assert_eq!(
        store.get_intent(intent.id).await.unwrap().unwrap().state,
        IntentState::Failed
    );
}

#[tokio::test]
async fn transient_exhaustion_fails_intent() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    hl.script_submits(vec![
        Err(VenueError::Transient("503".into())),
        Err(VenueError::Transient("503".into())),
        Err(VenueError::Transient("503".into())),
    ])
    .await;
    let config = common::test_config(&[("SUBMIT_MAX_ATTEMPTS", "3")]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    assert!(matches!(
        pipeline.executor.execute(intent.id).await.unwrap(),
        ExecutionOutcome::Failed(_)
    ));
    assert_eq!(hl.submit_count(), 3);
    assert!(store.list_positions(false, 10).await.unwrap().is_empty());
    let intent = store.get_intent(intent.id).await.unwrap().unwrap();
    assert!(intent.last_error.unwrap().starts_with("transient"));
}

#[tokio::test]
async fn submit_timeouts_are_ambiguous_and_found_by_client_ref() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    hl.script_submits(vec![
        Err(VenueError::Timeout("no answer".into())),
        Err(VenueError::Timeout("no answer".into())),
        Err(VenueError::Timeout("no answer".into())),
    ])
    .await;
    let config = common::test_config(&[("SUBMIT_MAX_ATTEMPTS", "3")]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    assert!(matches!(
        pipeline.executor.execute(intent.id).await.unwrap(),
        ExecutionOutcome::Ambiguous
    ));
    assert_eq!(hl.submit_count(), 3);
    let flagged = store.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(flagged.state, IntentState::Ambiguous);
    assert!(flagged.tx_ref.is_none());
    assert!(flagged.last_error.unwrap().starts_with("ambiguous"));

    // The venue has no order under the client reference yet.
    assert!(matches!(
        pipeline.executor.reconcile(intent.id).await,
        Err(PipelineError::StateConflict(_))
    ));
    assert!(store.list_positions(false, 10).await.unwrap().is_empty());

    // One of the timed-out requests did land.
    hl.land_order(&intent.id.to_string()).await;
    let position_id = match pipeline.executor.reconcile(intent.id).await.unwrap() {
        ReconcileOutcome::Opened(id) => id,
        other => panic!("expected open, got {other:?}"),
    };
    let intent = store.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(intent.state, IntentState::Open);
    assert_eq!(intent.tx_ref, Some(format!("{}-{}", Venue::Hyperliquid, intent.id)));
    assert_eq!(
        store.get_position(position_id).await.unwrap().unwrap().intent_id,
        Some(intent.id)
    );
    // Nothing was resubmitted.
    assert_eq!(hl.submit_count(), 3);
}

#[tokio::test]
async fn transient_then_success_opens_once() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    hl.script_submits(vec![Err(VenueError::Timeout("slow".into()))]).await;
    let config = common::test_config(&[]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    assert!(matches!(
        pipeline.executor.execute(intent.id).await.unwrap(),
        ExecutionOutcome::Opened(_)
    ));
    assert_eq!(hl.submit_count(), 2);
    // Both attempts carried the same client reference.
    assert!(hl
        .submissions()
        .await
        .iter()
        .all(|p| p.client_ref == intent.id.to_string()));
}

#[tokio::test]
async fn unconfirmed_order_is_ambiguous_until_reconciled() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    hl.set_status(StatusScript::NeverConfirm).await;
    let config = common::test_config(&[]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    assert!(matches!(
        pipeline.executor.execute(intent.id).await.unwrap(),
        ExecutionOutcome::Ambiguous
    ));
    assert_eq!(
        store.get_intent(intent.id).await.unwrap().unwrap().state,
        IntentState::Ambiguous
    );

    // Ambiguous intents are never retried by the execution worker.
    assert_eq!(pipeline.execution_cycle(10, 2).await.unwrap(), 0);
    assert_eq!(hl.submit_count(), 1);

    assert_eq!(
        pipeline.executor.reconcile(intent.id).await.unwrap(),
        ReconcileOutcome::StillPending
    );

    hl.set_status(StatusScript::FillAt {
        entry_price: Decimal::from(101),
    })
    .await;
    let position_id = match pipeline.executor.reconcile(intent.id).await.unwrap() {
        ReconcileOutcome::Opened(id) => id,
        other => panic!("expected open, got {other:?}"),
    };
    let position = store.get_position(position_id).await.unwrap().unwrap();
    assert_eq!(position.entry_price, Decimal::from(101));
    assert_eq!(
        store.get_intent(intent.id).await.unwrap().unwrap().state,
        IntentState::Open
    );

    // Reconciling again is a state conflict, not a second position.
    assert!(matches!(
        pipeline.executor.reconcile(intent.id).await,
        Err(PipelineError::StateConflict(_))
    ));
    assert_eq!(store.list_positions(false, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn venue_failure_during_confirmation_fails_intent() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    hl.set_status(StatusScript::FailWith("liquidity".into())).await;
    let config = common::test_config(&[]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    assert!(matches!(
        pipeline.executor.execute(intent.id).await.unwrap(),
        ExecutionOutcome::Failed(_)
    ));
    let intent = store.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(intent.state, IntentState::Failed);
    assert!(intent.last_error.unwrap().contains("liquidity"));
}

#[tokio::test]
async fn stalled_submission_is_flagged_for_review() {
    let store = Arc::new(MemoryStore::new());
    let (_, deployment) = common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let hl = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    let config = common::test_config(&[]);
    let pipeline = common::build_pipeline(store.clone(), registry(&[&hl]), &config);

    let intent = routed_intent(&store, &pipeline, &deployment, "e1").await;
    for (from, to) in [
        (IntentState::Routed, IntentState::Preparing),
        (IntentState::Preparing, IntentState::Submitting),
    ] {
        store
            .transition_intent(intent.id, from, to, &IntentUpdate::default())
            .await
            .unwrap()
            .unwrap();
    }
    store.age_intent(intent.id, Utc::now() - Duration::hours(1)).await;

    let report = pipeline.executor.sweep_stale().await.unwrap();
    assert_eq!(report.ambiguous, 1);
    assert_eq!(report.released, 0);
    assert_eq!(
        store.get_intent(intent.id).await.unwrap().unwrap().state,
        IntentState::Ambiguous
    );

    // No venue reference was recorded, so only an operator can resolve it.
    assert!(matches!(
        pipeline.executor.reconcile(intent.id).await,
        Err(PipelineError::StateConflict(_))
    ));
}
