//! End-to-end behaviour of the coordinator against a simulated remote.

use expensync_core::{Expense, ExpensePatch, LocalStore, Record, Schema, EXPENSES};
use expensync_sync::{
    CallKind, ConnectivityState, MemoryRemote, OperationKind, RetryConfig, SyncConfig,
    SyncCoordinator, SyncError, SyncEvent,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::{broadcast, watch};

fn rec(value: serde_json::Value) -> Record {
    Record::from_value(value).unwrap()
}

fn setup(online: bool) -> (Arc<SyncCoordinator>, Arc<MemoryRemote>) {
    setup_with(online, SyncConfig::default())
}

fn setup_with(online: bool, config: SyncConfig) -> (Arc<SyncCoordinator>, Arc<MemoryRemote>) {
    let store = Arc::new(LocalStore::open_in_memory(Schema::expense_tracker()).unwrap());
    let remote = Arc::new(MemoryRemote::new());
    let sync = SyncCoordinator::with_config(store, remote.clone(), online, config).unwrap();
    (Arc::new(sync), remote)
}

async fn wait_for(
    events: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn offline_insert_is_readable_immediately() {
    let (sync, _) = setup(false);
    let lunch = Expense::new("u1", 14.0, "2024-07-01");

    let stored = sync.insert(&lunch).await.unwrap();
    assert_eq!(stored, lunch);

    let mine: Vec<Expense> = sync.get_all(Some("u1")).await.unwrap();
    assert_eq!(mine, vec![lunch]);
    assert_eq!(sync.pending_count().unwrap(), 1);
}

#[tokio::test]
async fn queued_insert_survives_online_refresh() {
    let (sync, remote) = setup(true);
    remote.seed(EXPENSES, rec(json!({"id": "old", "user_id": "u1", "amount": 1})));
    remote.fail_next(1);

    sync.insert_record(EXPENSES, rec(json!({"id": "new", "user_id": "u1", "amount": 2})))
        .await
        .unwrap();
    assert_eq!(sync.pending_count().unwrap(), 1);

    let mut events = sync.subscribe();
    let rows = sync.get_all_records(EXPENSES, Some("u1")).await.unwrap();
    let ids: Vec<&str> = rows.iter().filter_map(Record::id).collect();
    assert_eq!(ids, vec!["old", "new"]);
    assert_eq!(sync.store().count(EXPENSES).unwrap(), 2);
    assert!(matches!(
        events.try_recv(),
        Ok(SyncEvent::CacheRefreshed { count: 2, .. })
    ));
}

#[tokio::test]
async fn queued_update_overlays_remote_rows() {
    let (sync, remote) = setup(true);
    remote.seed(EXPENSES, rec(json!({"id": "e1", "user_id": "u1", "amount": 1, "note": "x"})));
    sync.store()
        .put(EXPENSES, rec(json!({"id": "e1", "user_id": "u1", "amount": 1, "note": "x"})))
        .unwrap();

    remote.fail_next(1);
    sync.update_record(EXPENSES, "e1", rec(json!({"amount": 5})))
        .await
        .unwrap();

    let rows = sync.get_all_records(EXPENSES, None).await.unwrap();
    assert_eq!(rows, vec![rec(json!({"id": "e1", "user_id": "u1", "amount": 5, "note": "x"}))]);
    assert_eq!(
        sync.store().get(EXPENSES, "e1").unwrap().unwrap().get("amount"),
        Some(&json!(5))
    );
}

#[tokio::test]
async fn insert_replay_does_not_duplicate() {
    let (sync, remote) = setup(false);
    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "user_id": "u1", "amount": 100})))
        .await
        .unwrap();
    // Another path already delivered the row.
    remote.seed(EXPENSES, rec(json!({"id": "e1", "user_id": "u1", "amount": 100})));

    let report = sync.set_online(true).await.unwrap().unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(remote.rows(EXPENSES).len(), 1);
    assert_eq!(sync.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn duplicate_rejection_counts_as_acknowledged() {
    let (sync, remote) = setup(false);
    remote.reject_duplicates(true);
    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 7})))
        .await
        .unwrap();
    remote.seed(EXPENSES, rec(json!({"id": "e1", "amount": 7})));

    let report = sync.set_online(true).await.unwrap().unwrap();
    assert_eq!((report.succeeded, report.failed), (1, 0));
    assert!(sync.pending().unwrap().is_empty());
    assert!(sync.dead_letters().unwrap().is_empty());
}

#[tokio::test]
async fn third_failure_moves_operation_to_dead_letters() {
    let (sync, remote) = setup(false);
    let mut events = sync.subscribe();
    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 3})))
        .await
        .unwrap();
    remote.fail_collection(EXPENSES);

    let first = sync.set_online(true).await.unwrap().unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(sync.pending().unwrap()[0].retry_count, 1);

    let second = sync.replay().await.unwrap();
    assert_eq!(second.failed, 1);
    assert_eq!(sync.pending().unwrap()[0].retry_count, 2);

    let third = sync.replay().await.unwrap();
    assert_eq!((third.failed, third.abandoned, third.remaining), (1, 1, 0));
    assert_eq!(sync.pending_count().unwrap(), 0);

    let letters = sync.dead_letters().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].operation.retry_count, 3);
    assert!(letters[0].reason.contains("unavailable"));

    let abandoned = wait_for(&mut events, |e| matches!(e, SyncEvent::OperationAbandoned(_))).await;
    match abandoned {
        SyncEvent::OperationAbandoned(letter) => assert_eq!(letter.operation_id(), letters[0].operation_id()),
        other => panic!("unexpected event {other:?}"),
    }

    let fourth = sync.replay().await.unwrap();
    assert!(!fourth.started);
    let inserts = remote
        .calls()
        .iter()
        .filter(|c| c.kind == CallKind::Insert)
        .count();
    assert_eq!(inserts, 3);
}

#[tokio::test]
async fn dead_letter_can_be_requeued() {
    let (sync, remote) = setup(false);
    sync.delete_record(EXPENSES, "gone").await.unwrap();
    remote.fail_collection(EXPENSES);
    sync.set_online(true).await.unwrap();
    sync.replay().await.unwrap();
    sync.replay().await.unwrap();
    let letter = sync.dead_letters().unwrap().remove(0);

    remote.heal_collection(EXPENSES);
    let requeued = sync.requeue_dead_letter(letter.operation_id()).unwrap().unwrap();
    assert_eq!(requeued.kind, OperationKind::Delete);
    assert_eq!(requeued.retry_count, 0);
    assert!(sync.dead_letters().unwrap().is_empty());

    let report = sync.replay().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(sync.requeue_dead_letter(letter.operation_id()).unwrap().is_none());
}

#[tokio::test]
async fn remote_failure_falls_back_to_local() {
    let (sync, remote) = setup(false);
    for (id, owner) in [("a", "u1"), ("b", "u2"), ("c", "u1")] {
        sync.insert_record(EXPENSES, rec(json!({"id": id, "user_id": owner})))
            .await
            .unwrap();
    }
    remote.set_online(false);
    sync.set_online(true).await.unwrap();

    let rows = sync.get_all_records(EXPENSES, Some("u1")).await.unwrap();
    assert_eq!(rows, sync.store().get_all(EXPENSES, Some("u1")).unwrap());
    assert_eq!(rows.len(), 2);
    assert_eq!(sync.stats().fallback_reads, 1);
}

#[tokio::test]
async fn update_merges_fields() {
    let (sync, remote) = setup(true);
    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 10, "note": "x"})))
        .await
        .unwrap();

    let merged = sync
        .update_record(EXPENSES, "e1", rec(json!({"amount": 50})))
        .await
        .unwrap();
    assert_eq!(merged, rec(json!({"id": "e1", "amount": 50, "note": "x"})));
    assert_eq!(sync.store().get(EXPENSES, "e1").unwrap(), Some(merged.clone()));
    assert_eq!(remote.row(EXPENSES, "e1"), Some(merged));
}

#[tokio::test]
async fn typed_update_uses_patch_struct() {
    let (sync, _) = setup(false);
    let coffee = Expense::new("u1", 3.0, "2024-08-08").with_note("flat white");
    sync.insert(&coffee).await.unwrap();

    let patch = ExpensePatch {
        amount: Some(3.5),
        ..ExpensePatch::default()
    };
    let updated: Expense = sync.update(&coffee.id, &patch).await.unwrap();
    assert_eq!(updated.amount, 3.5);
    assert_eq!(updated.note.as_deref(), Some("flat white"));

    let queued = sync.pending().unwrap();
    assert_eq!(queued[1].payload, Some(rec(json!({"amount": 3.5}))));
    assert_eq!(queued[1].record_id.as_deref(), Some(coffee.id.as_str()));
}

#[tokio::test]
async fn offline_then_online_delivers_queued_insert() {
    let (sync, remote) = setup(false);
    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 100})))
        .await
        .unwrap();
    assert_eq!(sync.pending_count().unwrap(), 1);

    sync.set_online(true).await.unwrap();
    sync.replay().await.unwrap();

    assert_eq!(sync.pending_count().unwrap(), 0);
    assert_eq!(
        remote.row(EXPENSES, "e1").unwrap().get("amount"),
        Some(&json!(100))
    );
    assert_eq!(sync.status(), ConnectivityState::Online);
}

#[tokio::test]
async fn transient_failure_is_queued_then_replayed() {
    let (sync, remote) = setup(true);
    remote.fail_next(1);

    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 1})))
        .await
        .unwrap();
    let queued = sync.pending().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 0);
    assert!(queued[0].last_error.is_some());

    let report = sync.replay().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(sync.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn failed_record_defers_its_later_operations() {
    let (sync, remote) = setup(false);
    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 1})))
        .await
        .unwrap();
    sync.update_record(EXPENSES, "e1", rec(json!({"amount": 2})))
        .await
        .unwrap();
    sync.insert_record(EXPENSES, rec(json!({"id": "e2", "amount": 3})))
        .await
        .unwrap();

    remote.fail_next(1);
    let report = sync.set_online(true).await.unwrap().unwrap();
    assert_eq!(
        (report.attempted, report.succeeded, report.failed, report.deferred, report.remaining),
        (2, 1, 1, 1, 2)
    );

    let queued = sync.pending().unwrap();
    assert_eq!(queued[0].retry_count, 1);
    assert_eq!(queued[1].retry_count, 0);
    assert!(remote.row(EXPENSES, "e2").is_some());

    sync.replay().await.unwrap();
    assert_eq!(
        remote.row(EXPENSES, "e1").unwrap().get("amount"),
        Some(&json!(2))
    );
}

#[tokio::test]
async fn status_events_follow_connectivity() {
    let (sync, _) = setup(true);
    let mut events = sync.subscribe();

    assert!(sync.set_online(false).await.unwrap().is_none());
    assert_eq!(sync.status(), ConnectivityState::Offline);
    assert!(matches!(
        events.try_recv(),
        Ok(SyncEvent::StatusChanged(ConnectivityState::Offline))
    ));

    sync.set_online(false).await.unwrap();
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let store = Arc::new(LocalStore::open(dir.path(), Schema::expense_tracker()).unwrap());
        let sync = SyncCoordinator::new(store, Arc::new(MemoryRemote::new()), false).unwrap();
        sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 1})))
            .await
            .unwrap();
        sync.store().close().unwrap();
    }

    let store = Arc::new(LocalStore::open(dir.path(), Schema::expense_tracker()).unwrap());
    let remote = Arc::new(MemoryRemote::new());
    let sync = SyncCoordinator::new(store, remote.clone(), false).unwrap();
    assert_eq!(sync.pending_count().unwrap(), 1);

    sync.set_online(true).await.unwrap();
    assert!(remote.row(EXPENSES, "e1").is_some());
    assert_eq!(sync.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn driver_replays_when_signal_goes_online() {
    let (sync, remote) = setup(false);
    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 1})))
        .await
        .unwrap();

    let mut events = sync.subscribe();
    let (tx, rx) = watch::channel(false);
    let driver = sync.spawn_driver(rx);

    tx.send(true).unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::ReplayFinished(r) if r.is_drained())).await;
    assert!(remote.row(EXPENSES, "e1").is_some());
    assert!(sync.is_online());

    tx.send(false).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::StatusChanged(ConnectivityState::Offline))
    })
    .await;

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver did not stop")
        .unwrap();
}

#[tokio::test]
async fn driver_backs_off_and_retries() {
    let retry = RetryConfig::new(3)
        .with_initial_delay(Duration::from_millis(20))
        .with_jitter(false);
    let (sync, remote) = setup_with(false, SyncConfig::new().with_retry(retry));
    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 1})))
        .await
        .unwrap();
    remote.fail_next(1);

    let mut events = sync.subscribe();
    let (tx, rx) = watch::channel(true);
    let driver = sync.spawn_driver(rx);

    let first = wait_for(&mut events, |e| matches!(e, SyncEvent::ReplayFinished(_))).await;
    assert!(matches!(first, SyncEvent::ReplayFinished(r) if r.failed == 1));
    wait_for(&mut events, |e| matches!(e, SyncEvent::ReplayFinished(r) if r.is_drained())).await;

    let stats = sync.stats();
    assert_eq!(stats.passes_completed, 2);
    assert_eq!(stats.consecutive_failed_passes, 0);
    assert!(remote.row(EXPENSES, "e1").is_some());

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver did not stop")
        .unwrap();
}

#[tokio::test]
async fn driver_retries_write_that_failed_while_online() {
    let retry = RetryConfig::new(3)
        .with_initial_delay(Duration::from_millis(20))
        .with_jitter(false);
    let (sync, remote) = setup_with(true, SyncConfig::new().with_retry(retry));
    let mut events = sync.subscribe();
    let (tx, rx) = watch::channel(true);
    let driver = sync.spawn_driver(rx);
    // Let the driver settle with nothing queued.
    tokio::time::sleep(Duration::from_millis(50)).await;

    remote.fail_next(1);
    sync.insert_record(EXPENSES, rec(json!({"id": "e1", "amount": 1})))
        .await
        .unwrap();
    assert_eq!(sync.stats().operations_queued, 1);

    wait_for(&mut events, |e| matches!(e, SyncEvent::ReplayFinished(r) if r.is_drained())).await;
    assert!(remote.row(EXPENSES, "e1").is_some());
    assert_eq!(sync.pending_count().unwrap(), 0);
    assert_eq!(sync.stats().passes_completed, 1);

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver did not stop")
        .unwrap();
}

#[tokio::test]
async fn concurrent_replay_runs_one_pass() {
    let (sync, remote) = setup(true);
    remote.fail_next(2);
    for id in ["e1", "e2"] {
        sync.insert_record(EXPENSES, rec(json!({"id": id, "amount": 1})))
            .await
            .unwrap();
    }
    assert_eq!(sync.pending_count().unwrap(), 2);
    remote.clear_calls();
    remote.set_latency(Some(Duration::from_millis(100)));

    let mut events = sync.subscribe();
    let first = tokio::spawn({
        let sync = Arc::clone(&sync);
        async move { sync.replay().await }
    });

    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::StatusChanged(ConnectivityState::Syncing))
    })
    .await;
    assert_eq!(sync.status(), ConnectivityState::Syncing);

    let second = sync.replay().await.unwrap();
    assert!(!second.started);
    assert_eq!(second.attempted, 0);

    let first = first.await.unwrap().unwrap();
    assert!(first.started);
    assert_eq!(first.succeeded, 2);
    assert_eq!(sync.status(), ConnectivityState::Online);
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::StatusChanged(ConnectivityState::Online))
    })
    .await;

    let inserts = remote.calls().iter().filter(|c| c.kind == CallKind::Insert).count();
    assert_eq!(inserts, 2);
    assert_eq!(sync.stats().passes_completed, 1);
}

#[tokio::test]
async fn invalid_records_are_rejected() {
    let (sync, _) = setup(false);
    let err = sync
        .insert_record(EXPENSES, rec(json!({"id": 12})))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert_eq!(sync.pending_count().unwrap(), 0);
}

#[derive(Debug, Clone)]
enum Step {
    Insert(usize),
    Update(usize, u32),
    Delete(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..3usize).prop_map(Step::Insert),
        (0..3usize, 0..1000u32).prop_map(|(r, amount)| Step::Update(r, amount)),
        (0..3usize).prop_map(Step::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn replay_preserves_queue_order(steps in prop::collection::vec(step(), 1..16)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (sync, remote) = setup(false);
            for step in &steps {
                match step {
                    Step::Insert(r) => {
                        sync.insert_record(EXPENSES, rec(json!({"id": format!("r{r}"), "amount": 0})))
                            .await
                            .unwrap();
                    }
                    Step::Update(r, amount) => {
                        sync.update_record(EXPENSES, &format!("r{r}"), rec(json!({"amount": amount})))
                            .await
                            .unwrap();
                    }
                    Step::Delete(r) => {
                        sync.delete_record(EXPENSES, &format!("r{r}")).await.unwrap();
                    }
                }
            }

            let queued: Vec<(OperationKind, String)> = sync
                .pending()
                .unwrap()
                .iter()
                .map(|op| (op.kind, op.target_id().unwrap().to_string()))
                .collect();
            assert_eq!(queued.len(), steps.len());

            sync.set_online(true).await.unwrap();
            let sent: Vec<(OperationKind, String)> = remote
                .calls()
                .iter()
                .map(|c| {
                    let kind = match c.kind {
                        CallKind::Insert => OperationKind::Insert,
                        CallKind::Update => OperationKind::Update,
                        CallKind::Delete => OperationKind::Delete,
                        CallKind::Select => unreachable!("replay never reads"),
                    };
                    (kind, c.id.clone().unwrap())
                })
                .collect();
            assert_eq!(sent, queued);
            assert_eq!(sync.pending_count().unwrap(), 0);
        });
    }
}
