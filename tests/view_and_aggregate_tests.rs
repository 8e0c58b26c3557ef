/// View state, server paging and secondary aggregate tests
///
/// Run with: cargo test --test view_and_aggregate_tests

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{category, names, numbered, tools_and_parts};
use livecollection::{
    CollectionError, EngineConfig, EntityId, InMemoryRemote, LiveCollection, ManualClock,
    RemoteError, RemoteOp, SortDirection, SortKey,
};
use std::collections::HashMap;
use std::sync::Arc;

async fn loaded(remote: &InMemoryRemote) -> LiveCollection {
    let collection = LiveCollection::new(EngineConfig::default(), Arc::new(remote.clone())).unwrap();
    collection.load().await.unwrap();
    collection
}

#[tokio::test]
async fn test_search_and_sort_reset_page() {
    let remote = numbered(30);
    let collection = loaded(&remote).await;

    assert_eq!(collection.set_page_index(2).unwrap().page_index, 2);
    let page = collection.set_search_text("item 01").unwrap();
    assert_eq!(page.page_index, 0);
    assert_eq!(page.filtered_count, 10);

    // Only one page matches: out-of-range requests clamp.
    assert_eq!(collection.set_page_index(7).unwrap().page_index, 0);

    collection.set_search_text("").unwrap();
    collection.set_page_index(2).unwrap();
    let page = collection.set_sort(SortKey::field("name")).unwrap();
    assert_eq!(page.page_index, 0);
    assert_eq!(collection.get_view_state().unwrap().sort_direction, SortDirection::Descending);
    assert_eq!(page.rows[0].entity.text("name"), Some("Item 029"));

    collection.set_page_index(1).unwrap();
    let page = collection.set_sort(SortKey::field("display_order")).unwrap();
    assert_eq!(page.page_index, 0);
    assert_eq!(collection.get_view_state().unwrap().sort_direction, SortDirection::Ascending);
    assert_eq!(page.rows[0].entity.text("name"), Some("Item 000"));
}

#[tokio::test]
async fn test_page_size_only_resets_when_index_becomes_invalid() {
    let remote = numbered(30);
    let collection = loaded(&remote).await;

    collection.set_page_index(2).unwrap();
    let page = collection.set_page_size(5).unwrap();
    assert_eq!(page.page_index, 4);
    assert_eq!(page.rows[0].entity.text("name"), Some("Item 020"));

    let page = collection.set_page_size(50).unwrap();
    assert_eq!(page.page_index, 0);
    assert_eq!(page.total_pages, 1);

    let err = collection.set_page_size(0).unwrap_err();
    assert!(matches!(err, CollectionError::Validation(_)));
    assert_eq!(collection.get_view_state().unwrap().page_size, 50);
}

#[tokio::test]
async fn test_recompute_is_deterministic() {
    let remote = InMemoryRemote::new("categories");
    remote.seed(vec![
        category("c", "Same", None, 0),
        category("a", "Same", None, 0),
        category("b", "same", None, 0),
    ]);
    let collection = loaded(&remote).await;

    let first = collection.get_visible_rows().unwrap();
    let second = collection.get_visible_rows().unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    let ids: Vec<&str> = first.rows.iter().map(|row| row.entity.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c", "b"]);
}

#[tokio::test]
async fn test_server_page_follows_view_state() {
    let remote = numbered(30);
    let collection = loaded(&remote).await;

    collection.set_search_text("Item 02").unwrap();
    collection.set_sort(SortKey::field("name")).unwrap();
    let page = collection.fetch_server_page().await.unwrap().unwrap();

    assert_eq!(page.total_count, 10);
    assert_eq!(page.total_pages, 1);
    assert_eq!(page.rows[0].text("name"), Some("Item 029"));
}

#[tokio::test]
async fn test_aggregate_sort_and_refresh_cadence() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let remote = InMemoryRemote::with_clock("categories", clock.clone());
    remote.seed(vec![
        category("A", "Tools", None, 0),
        category("B", "Parts", None, 1),
        category("C", "Cables", None, 2),
    ]);
    remote.set_aggregate(HashMap::from([
        (EntityId::from("A"), 5),
        (EntityId::from("B"), 1),
    ]));

    let collection = LiveCollection::builder(EngineConfig::default(), Arc::new(remote.clone()))
        .aggregate_source(Arc::new(remote.clone()))
        .clock(clock.clone())
        .build()
        .unwrap();
    collection.load().await.unwrap();

    assert!(collection.refresh_aggregate_if_stale().await.unwrap());
    assert!(!collection.refresh_aggregate_if_stale().await.unwrap());

    // Missing aggregate entries count as zero.
    let page = collection.set_sort(SortKey::Aggregate).unwrap();
    assert_eq!(names(&page), vec!["Cables", "Parts", "Tools"]);
    assert_eq!(page.rows[0].aggregate, 0);

    remote.set_aggregate(HashMap::from([
        (EntityId::from("A"), 5),
        (EntityId::from("B"), 9),
    ]));
    clock.advance(ChronoDuration::seconds(60));
    assert!(!collection.refresh_aggregate_if_stale().await.unwrap());
    clock.advance(ChronoDuration::seconds(60));
    assert!(collection.refresh_aggregate_if_stale().await.unwrap());
    assert_eq!(
        names(&collection.get_visible_rows().unwrap()),
        vec!["Cables", "Tools", "Parts"]
    );
    assert_eq!(remote.calls(RemoteOp::FetchAggregate), 2);
}

#[tokio::test]
async fn test_delete_invalidates_aggregate() {
    let remote = tools_and_parts();
    let collection = LiveCollection::builder(EngineConfig::default(), Arc::new(remote.clone()))
        .aggregate_source(Arc::new(remote.clone()))
        .build()
        .unwrap();
    collection.load().await.unwrap();
    assert!(collection.refresh_aggregate_if_stale().await.unwrap());
    assert!(!collection.refresh_aggregate_if_stale().await.unwrap());

    collection.delete_entity(&"A".into()).await.unwrap();
    assert!(collection.refresh_aggregate_if_stale().await.unwrap());
}

#[tokio::test]
async fn test_aggregate_failure_keeps_previous_values() {
    let remote = tools_and_parts();
    remote.set_aggregate(HashMap::from([(EntityId::from("A"), 3)]));
    let collection = LiveCollection::builder(EngineConfig::default(), Arc::new(remote.clone()))
        .aggregate_source(Arc::new(remote.clone()))
        .build()
        .unwrap();
    collection.load().await.unwrap();
    collection.refresh_aggregate_if_stale().await.unwrap();
    collection.delete_entity(&"B".into()).await.unwrap();

    remote.fail_next(RemoteOp::FetchAggregate, RemoteError::Network("down".into()));
    assert!(collection.refresh_aggregate_if_stale().await.is_err());

    let page = collection.get_visible_rows().unwrap();
    assert_eq!(page.rows[0].aggregate, 3);
}

#[tokio::test]
async fn test_without_aggregate_source_nothing_is_fetched() {
    let remote = tools_and_parts();
    let collection = loaded(&remote).await;
    assert!(!collection.refresh_aggregate_if_stale().await.unwrap());
    assert_eq!(remote.calls(RemoteOp::FetchAggregate), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let remote = tools_and_parts();
    let config = EngineConfig::default().default_page_size(0);
    let err = LiveCollection::new(config, Arc::new(remote)).err().unwrap();
    assert!(matches!(err, CollectionError::Config(_)));

    let config = EngineConfig::from_url("livecollection://categories?page_size=3").unwrap();
    let collection = LiveCollection::new(config, Arc::new(numbered(7))).unwrap();
    collection.load().await.unwrap();
    assert_eq!(collection.get_visible_rows().unwrap().total_pages, 3);
}
