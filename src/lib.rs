// ============================================================================
// LiveCollection Library
// ============================================================================

pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod facade;
pub mod paging;
pub mod projection;
pub mod realtime;
pub mod remote;
pub mod store;
pub mod view;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use core::{
    Clock, CollectionError, Entity, EntityDraft, EntityId, Fields, ManualClock, RenderKey,
    Result, SystemClock, Value,
};
pub use facade::{LiveCollection, LiveCollectionBuilder, ViewEvent};
pub use projection::{ProjectedPage, ProjectedRow, SortDirection, SortKey};
pub use realtime::IngestOutcome;
pub use remote::{
    AggregateSource, ChangeEvent, ChangeOp, InMemoryRemote, PageQuery, PageResult,
    RemoteCollectionSource, RemoteError, RemoteOp, SubscriptionMessage,
};
pub use store::{CollectionSnapshot, CollectionStore, MutationId, MutationKind, PendingMutation};
pub use view::ViewState;

// ============================================================================
// Quick start
// ============================================================================

/// Open a live collection over `remote`, load it and start listening for
/// pushed changes.
///
/// # Examples
///
/// ```
/// use livecollection::{EngineConfig, EntityDraft, InMemoryRemote, SortKey};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let remote = InMemoryRemote::new("categories");
/// let collection = livecollection::open(EngineConfig::default(), Arc::new(remote)).await?;
///
/// collection.create_entity(EntityDraft::named("Tools").build()).await?;
/// collection.create_entity(EntityDraft::named("Parts").build()).await?;
///
/// let page = collection.set_sort(SortKey::field("name"))?;
/// assert_eq!(page.filtered_count, 2);
/// # Ok(())
/// # }
/// ```
pub async fn open(
    config: EngineConfig,
    remote: std::sync::Arc<dyn RemoteCollectionSource>,
) -> Result<LiveCollection> {
    let collection = LiveCollection::new(config, remote)?;
    collection.load().await?;
    collection.start()?;
    Ok(collection)
}
