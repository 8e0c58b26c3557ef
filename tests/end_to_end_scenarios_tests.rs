/// End-to-end scenarios
///
/// Optimistic create/update/delete against the in-memory backend with the
/// realtime pump running.
/// Run with: cargo test --test end_to_end_scenarios_tests

mod common;

use common::{names, numbered, tools_and_parts, wait_until};
use livecollection::{
    CollectionError, EngineConfig, EntityDraft, EntityId, InMemoryRemote, LiveCollection,
    MutationKind, RemoteError, RemoteOp, ViewEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

async fn open(remote: &InMemoryRemote) -> LiveCollection {
    livecollection::open(EngineConfig::default(), Arc::new(remote.clone()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sorted_by_name_ascending() {
    let remote = tools_and_parts();
    let collection = open(&remote).await;

    let page = collection.get_visible_rows().unwrap();
    assert_eq!(names(&page), vec!["Parts", "Tools"]);
    assert_eq!(page.rows[0].entity.id, EntityId::from("B"));
}

#[tokio::test]
async fn test_offline_create_rolls_back_and_notifies() {
    let remote = tools_and_parts();
    let collection = open(&remote).await;
    let before = collection.snapshot().unwrap();
    let mut events = collection.subscribe_events();

    remote.set_offline(true);
    let err = assert_err!(
        collection
            .create_entity(EntityDraft::named("Bolts").build())
            .await
    );
    assert!(err.is_network_failure());
    assert_eq!(collection.snapshot().unwrap(), before);
    assert_eq!(collection.pending_count().unwrap(), 0);

    let mut saw_temp_row = false;
    loop {
        match events.recv().await.unwrap() {
            ViewEvent::RowsChanged { .. } => saw_temp_row = true,
            ViewEvent::MutationFailed { kind, error, .. } => {
                assert_eq!(kind, MutationKind::Create);
                assert!(error.is_network_failure());
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(saw_temp_row, "optimistic row was never shown");
}

#[tokio::test]
async fn test_remote_delete_during_pending_update_is_stale_write() {
    let remote = tools_and_parts();
    let collection = Arc::new(open(&remote).await);
    let mut events = collection.subscribe_events();
    remote.set_latency(Duration::from_millis(150));

    let update = {
        let collection = Arc::clone(&collection);
        tokio::spawn(async move {
            collection
                .update_entity(&"B".into(), EntityDraft::named("Fasteners").build())
                .await
        })
    };

    wait_until("optimistic update", || {
        collection.pending_count().unwrap() == 1
    })
    .await;
    assert!(remote.external_delete(&"B".into()));
    wait_until("remote delete ingested", || {
        collection.entity(&"B".into()).unwrap().is_none()
    })
    .await;

    let err = assert_err!(update.await.unwrap());
    match err {
        CollectionError::StaleWrite { id, current } => {
            assert_eq!(id, EntityId::from("B"));
            assert!(current.is_none());
        }
        other => panic!("expected stale write, got {:?}", other),
    }
    assert!(collection.entity(&"B".into()).unwrap().is_none());
    assert_eq!(collection.pending_count().unwrap(), 0);

    let mut notified = false;
    while let Ok(event) = events.try_recv() {
        if event == (ViewEvent::ChangedElsewhere { id: "B".into() }) {
            notified = true;
        }
    }
    assert!(notified);
}

#[tokio::test]
async fn test_page_size_change_keeps_row_visible() {
    let remote = numbered(30);
    let collection = open(&remote).await;

    collection.set_page_index(1).unwrap();
    let before = collection.get_visible_rows().unwrap();
    assert_eq!(before.rows[0].entity.text("name"), Some("Item 010"));

    let after = collection.set_page_size(25).unwrap();
    assert_eq!(after.page_index, 0);
    assert_eq!(after.rows.len(), 25);
    assert!(names(&after).contains(&"Item 010".to_string()));
}

#[tokio::test]
async fn test_duplicate_temporary_id_is_rejected_before_network() {
    let remote = tools_and_parts();
    let collection = open(&remote).await;
    remote.set_latency(Duration::from_millis(30));
    let temp_id = EntityId::from("tmp-same");

    let (first, second) = tokio::join!(
        collection.create_entity_with_temp_id(temp_id.clone(), EntityDraft::named("Bolts").build()),
        collection.create_entity_with_temp_id(temp_id.clone(), EntityDraft::named("Nuts").build())
    );

    let created = assert_ok!(first);
    assert_eq!(
        assert_err!(second),
        CollectionError::ConflictingMutation(temp_id.clone())
    );
    assert_eq!(remote.calls(RemoteOp::Create), 1);

    let page = collection.get_visible_rows().unwrap();
    assert_eq!(page.filtered_count, 3);
    let row = page
        .rows
        .iter()
        .find(|row| row.entity.id == created.id)
        .unwrap();
    assert_eq!(row.render_key.as_str(), "tmp-same");
}

#[tokio::test]
async fn test_failed_update_restores_exact_prior_value() {
    let remote = tools_and_parts();
    let collection = open(&remote).await;
    let original = collection.entity(&"A".into()).unwrap().unwrap();

    remote.set_offline(true);
    let patch = EntityDraft::named("Hardware")
        .description(Some("new"))
        .color("#ff0000")
        .build();
    let err = assert_err!(collection.update_entity(&"A".into(), patch).await);

    assert!(err.is_network_failure());
    assert_eq!(collection.entity(&"A".into()).unwrap(), Some(original));
}

#[tokio::test]
async fn test_failed_delete_brings_row_back() {
    let remote = tools_and_parts();
    let collection = open(&remote).await;
    let mut events = collection.subscribe_events();

    remote.set_offline(true);
    assert_err!(collection.delete_entity(&"A".into()).await);

    assert_eq!(collection.get_visible_rows().unwrap().filtered_count, 2);
    let failure = loop {
        if let ViewEvent::MutationFailed { id, kind, .. } = events.recv().await.unwrap() {
            break (id, kind);
        }
    };
    assert_eq!(failure, (EntityId::from("A"), MutationKind::Delete));
}

#[tokio::test]
async fn test_timeout_is_a_network_failure() {
    let remote = tools_and_parts();
    let config = EngineConfig::default().mutation_timeout(Duration::from_millis(30));
    let collection = livecollection::open(config, Arc::new(remote.clone()))
        .await
        .unwrap();
    remote.set_latency(Duration::from_millis(300));

    let err = assert_err!(
        collection
            .update_entity(&"A".into(), EntityDraft::named("Slow").build())
            .await
    );
    assert!(err.is_network_failure());
    assert_eq!(collection.entity(&"A".into()).unwrap().unwrap().text("name"), Some("Tools"));
    assert_eq!(collection.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_validation_never_reaches_backend() {
    let remote = tools_and_parts();
    let collection = open(&remote).await;

    let err = assert_err!(collection.create_entity(EntityDraft::named(" \t ").build()).await);
    assert!(matches!(err, CollectionError::Validation(_)));
    let err = assert_err!(
        collection
            .update_entity(&"A".into(), EntityDraft::named("").build())
            .await
    );
    assert!(matches!(err, CollectionError::Validation(_)));
    let err = assert_err!(collection.delete_entity(&"ghost".into()).await);
    assert_eq!(err, CollectionError::NotFound("ghost".into()));

    assert_eq!(remote.calls(RemoteOp::Create), 0);
    assert_eq!(remote.calls(RemoteOp::Update), 0);
    assert_eq!(remote.calls(RemoteOp::Delete), 0);
}

#[tokio::test]
async fn test_concurrent_creates_never_duplicate_rows() {
    let remote = InMemoryRemote::new("categories");
    let collection = open(&remote).await;

    let creates = (0..8).map(|i| collection.create_entity(EntityDraft::named(&format!("Bin {i}")).build()));
    let created = futures::future::join_all(creates).await;
    assert!(created.iter().all(Result::is_ok));

    // Let the pump drain the insert echoes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = collection.snapshot().unwrap();
    assert_eq!(snapshot.len(), 8);
    assert!(snapshot.keys().all(|id| !id.as_str().starts_with("tmp-")));
    assert_eq!(remote.rows().len(), 8);
}

#[tokio::test]
async fn test_pending_flag_clears_after_stale_write() {
    let remote = tools_and_parts();
    let collection = Arc::new(open(&remote).await);
    remote.set_latency(Duration::from_millis(120));
    remote.fail_next(RemoteOp::Update, RemoteError::StaleWrite("B".into()));

    let update = {
        let collection = Arc::clone(&collection);
        tokio::spawn(async move {
            collection
                .update_entity(&"B".into(), EntityDraft::named("Fasteners").build())
                .await
        })
    };
    wait_until("optimistic update", || collection.pending_count().unwrap() == 1).await;

    remote.external_update(&"B".into(), EntityDraft::named("Widgets").build());
    wait_until("concurrent edit applied", || {
        collection.entity(&"B".into()).unwrap().unwrap().text("name") == Some("Widgets")
    })
    .await;
    let pending_of_b = |page: &livecollection::ProjectedPage| {
        page.rows
            .iter()
            .find(|row| row.entity.id == EntityId::from("B"))
            .map(|row| row.pending)
    };
    assert_eq!(pending_of_b(&collection.get_visible_rows().unwrap()), Some(true));

    let err = assert_err!(update.await.unwrap());
    assert!(err.is_stale_write());
    assert_eq!(collection.pending_count().unwrap(), 0);

    let page = collection.get_visible_rows().unwrap();
    assert_eq!(pending_of_b(&page), Some(false));
    assert_eq!(
        page.rows.iter().find(|r| r.entity.id == EntityId::from("B")).unwrap().entity.text("name"),
        Some("Widgets")
    );
}
