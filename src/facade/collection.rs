use super::events::ViewEvent;
use crate::aggregate::AggregateCache;
use crate::config::EngineConfig;
use crate::coordinator::MutationCoordinator;
use crate::core::{Clock, CollectionError, Entity, EntityId, Fields, Result, SystemClock};
use crate::paging::{ServerPage, ServerPager};
use crate::projection::{ProjectedPage, ProjectionEngine, SortDirection, SortKey};
use crate::realtime::{IngestOutcome, RealtimeChannel};
use crate::remote::{
    AggregateSource, ChangeEvent, PageQuery, RemoteCollectionSource, Subscription,
    SubscriptionHandle, SubscriptionMessage,
};
use crate::store::{CollectionSnapshot, CollectionStore, MutationKind, SharedStore};
use crate::view::{ViewController, ViewState};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

struct ViewSide {
    controller: ViewController,
    engine: ProjectionEngine,
}

struct RealtimeTask {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

struct Shared {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    remote: Arc<dyn RemoteCollectionSource>,
    aggregate_source: Option<Arc<dyn AggregateSource>>,
    store: SharedStore,
    view: Mutex<ViewSide>,
    aggregate: Mutex<AggregateCache>,
    coordinator: MutationCoordinator,
    channel: RealtimeChannel,
    pager: ServerPager,
    events: broadcast::Sender<ViewEvent>,
    realtime: Mutex<Option<RealtimeTask>>,
}

impl Shared {
    fn emit(&self, event: ViewEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn ingest(&self, event: &ChangeEvent) -> Result<IngestOutcome> {
        let outcome = {
            let mut store = self.store.lock()?;
            self.channel.ingest(&mut store, event)
        };
        if outcome == IngestOutcome::Aborted {
            if let Some(id) = event.target_id() {
                self.emit(ViewEvent::ChangedElsewhere { id: id.clone() });
            }
        }
        Ok(outcome)
    }

    async fn resync(&self) -> Result<usize> {
        let rows = self
            .channel
            .resync(self.remote.as_ref(), self.config.resync_page_size)
            .await?;
        let count = rows.len();
        self.store.lock()?.replace_all(rows);
        self.emit(ViewEvent::Resynced { count });
        Ok(count)
    }

    async fn pump(self: Arc<Self>, mut messages: mpsc::UnboundedReceiver<SubscriptionMessage>) {
        while let Some(message) = messages.recv().await {
            match message {
                SubscriptionMessage::Event(event) => {
                    if let Err(err) = self.ingest(&event) {
                        warn!("realtime event dropped: {}", err);
                    }
                }
                SubscriptionMessage::Disconnected => {
                    warn!("realtime connection to '{}' lost", self.config.topic);
                }
                SubscriptionMessage::Reconnected => {
                    info!("realtime connection to '{}' restored, re-fetching", self.config.topic);
                    if let Err(err) = self.resync().await {
                        warn!("resync after reconnect failed: {}", err);
                    }
                }
            }
        }
        debug!("realtime pump for '{}' finished", self.config.topic);
    }

    fn report<T>(&self, id: &EntityId, kind: MutationKind, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            self.emit(ViewEvent::MutationFailed {
                id: id.clone(),
                kind,
                error: error.clone(),
            });
        }
        result
    }

    fn filtered_count(&self, side: &ViewSide) -> Result<usize> {
        let snapshot = self.store.lock()?.snapshot();
        Ok(side
            .engine
            .filtered_count(&snapshot, &side.controller.state().search_text))
    }

    fn project(&self, side: &mut ViewSide) -> Result<ProjectedPage> {
        let aggregate = self.aggregate.lock()?;
        let store = self.store.lock()?;
        let ViewSide { controller, engine } = side;
        let page = controller.recompute(|state| {
            engine.project_cached(&store, aggregate.aggregate(), aggregate.revision(), state)
        });
        controller.clamp_to(page.filtered_count);
        Ok(page)
    }
}

/// Builder for [`LiveCollection`].
pub struct LiveCollectionBuilder {
    config: EngineConfig,
    remote: Arc<dyn RemoteCollectionSource>,
    aggregate_source: Option<Arc<dyn AggregateSource>>,
    clock: Arc<dyn Clock>,
}

impl LiveCollectionBuilder {
    pub fn aggregate_source(mut self, source: Arc<dyn AggregateSource>) -> Self {
        self.aggregate_source = Some(source);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<LiveCollection> {
        self.config.validate().map_err(CollectionError::Config)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut store = CollectionStore::new();
        let rows_changed = events.clone();
        store.subscribe(move |change| {
            let _ = rows_changed.send(ViewEvent::RowsChanged {
                revision: change.revision,
            });
        });
        let store: SharedStore = Arc::new(Mutex::new(store));

        let coordinator = MutationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&self.remote),
            Arc::clone(&self.clock),
            &self.config,
        );
        let view = ViewSide {
            controller: ViewController::new(ViewState::new(
                SortKey::field(&self.config.name_field),
                self.config.default_page_size,
            )),
            engine: ProjectionEngine::new(&self.config.name_field),
        };

        Ok(LiveCollection {
            inner: Arc::new(Shared {
                channel: RealtimeChannel::new(&self.config.topic),
                pager: ServerPager::new(Arc::clone(&self.remote)),
                aggregate: Mutex::new(AggregateCache::new(self.config.aggregate_stale_after)),
                view: Mutex::new(view),
                realtime: Mutex::new(None),
                config: self.config,
                clock: self.clock,
                remote: self.remote,
                aggregate_source: self.aggregate_source,
                store,
                coordinator,
                events,
            }),
        })
    }
}

/// Live, optimistically-updated view over a remote collection.
///
/// Entry point for the view layer: visible rows and view state, mutations
/// resolving on confirmation, and a stream of [`ViewEvent`]s.
pub struct LiveCollection {
    inner: Arc<Shared>,
}

impl LiveCollection {
    pub fn builder(config: EngineConfig, remote: Arc<dyn RemoteCollectionSource>) -> LiveCollectionBuilder {
        LiveCollectionBuilder {
            config,
            remote,
            aggregate_source: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new(config: EngineConfig, remote: Arc<dyn RemoteCollectionSource>) -> Result<Self> {
        Self::builder(config, remote).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ViewEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Result<CollectionSnapshot> {
        Ok(self.inner.store.lock()?.snapshot())
    }

    pub fn entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        Ok(self.inner.store.lock()?.get(id).cloned())
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.inner.store.lock()?.pending_count())
    }

    /// Initial population: full fetch of the collection.
    pub async fn load(&self) -> Result<usize> {
        self.inner.resync().await
    }

    // ------------------------------------------------------------------
    // View
    // ------------------------------------------------------------------

    pub fn get_visible_rows(&self) -> Result<ProjectedPage> {
        let mut side = self.inner.view.lock()?;
        self.inner.project(&mut side)
    }

    pub fn get_view_state(&self) -> Result<ViewState> {
        Ok(self.inner.view.lock()?.controller.state().clone())
    }

    pub fn set_search_text(&self, text: &str) -> Result<ProjectedPage> {
        let mut side = self.inner.view.lock()?;
        side.controller.set_search_text(text);
        self.inner.project(&mut side)
    }

    /// Same key flips the direction; a new key sorts ascending.
    pub fn set_sort(&self, key: SortKey) -> Result<ProjectedPage> {
        let mut side = self.inner.view.lock()?;
        side.controller.set_sort(key);
        self.inner.project(&mut side)
    }

    pub fn set_sort_direction(&self, direction: SortDirection) -> Result<ProjectedPage> {
        let mut side = self.inner.view.lock()?;
        side.controller.set_sort_direction(direction);
        self.inner.project(&mut side)
    }

    pub fn set_page_index(&self, page_index: usize) -> Result<ProjectedPage> {
        let mut side = self.inner.view.lock()?;
        let filtered = self.inner.filtered_count(&side)?;
        side.controller.set_page_index(page_index, filtered);
        self.inner.project(&mut side)
    }

    pub fn set_page_size(&self, page_size: usize) -> Result<ProjectedPage> {
        let mut side = self.inner.view.lock()?;
        let filtered = self.inner.filtered_count(&side)?;
        side.controller.set_page_size(page_size, filtered)?;
        self.inner.project(&mut side)
    }

    /// Fetch the current view's page from the backend instead of projecting
    /// locally. `Ok(None)` when a newer fetch superseded this one.
    pub async fn fetch_server_page(&self) -> Result<Option<ServerPage>> {
        let query = PageQuery::from_view(&self.get_view_state()?);
        self.inner.pager.fetch(query).await
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub async fn create_entity(&self, fields: Fields) -> Result<Entity> {
        let temp_id = EntityId::temporary(&self.inner.config.temp_id_prefix);
        self.create_entity_with_temp_id(temp_id, fields).await
    }

    pub async fn create_entity_with_temp_id(&self, temp_id: EntityId, fields: Fields) -> Result<Entity> {
        let result = self
            .inner
            .coordinator
            .create_with_temp_id(temp_id.clone(), fields)
            .await;
        self.inner.report(&temp_id, MutationKind::Create, result)
    }

    pub async fn update_entity(&self, id: &EntityId, fields: Fields) -> Result<Entity> {
        let result = self.inner.coordinator.update(id, fields).await;
        self.inner.report(id, MutationKind::Update, result)
    }

    /// The aggregate is invalidated after a confirmed delete: the backend
    /// reassigns dependents, so counts change.
    pub async fn delete_entity(&self, id: &EntityId) -> Result<()> {
        let result = self.inner.coordinator.delete(id).await;
        if result.is_ok() {
            self.inner.aggregate.lock()?.invalidate();
        }
        self.inner.report(id, MutationKind::Delete, result)
    }

    // ------------------------------------------------------------------
    // Secondary aggregate
    // ------------------------------------------------------------------

    /// Re-fetch the aggregate when it is older than the stale time or was
    /// invalidated. Returns whether a fetch happened.
    pub async fn refresh_aggregate_if_stale(&self) -> Result<bool> {
        let Some(source) = &self.inner.aggregate_source else {
            return Ok(false);
        };
        if !self.inner.aggregate.lock()?.is_stale(self.inner.clock.now()) {
            return Ok(false);
        }
        let values = source.fetch_aggregate().await?;
        debug!("aggregate refreshed with {} values", values.len());
        self.inner
            .aggregate
            .lock()?
            .install(values, self.inner.clock.now());
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Realtime
    // ------------------------------------------------------------------

    /// Feed one push event through the ingestion channel.
    pub fn ingest(&self, event: &ChangeEvent) -> Result<IngestOutcome> {
        self.inner.ingest(event)
    }

    /// Full re-fetch, replacing the store contents.
    pub async fn resync(&self) -> Result<usize> {
        self.inner.resync().await
    }

    /// Subscribe to the backend topic and pump its events into the store.
    /// Calling it while already listening is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut realtime = self.inner.realtime.lock()?;
        if realtime.is_some() {
            return Ok(());
        }
        let Subscription { messages, handle } = self.inner.remote.subscribe(&self.inner.config.topic)?;
        let task = tokio::spawn(Arc::clone(&self.inner).pump(messages));
        *realtime = Some(RealtimeTask { handle, task });
        info!("listening on '{}'", self.inner.config.topic);
        Ok(())
    }

    /// Tear down the subscription. Returns false if none was active.
    pub fn stop(&self) -> Result<bool> {
        let Some(RealtimeTask { handle, task }) = self.inner.realtime.lock()?.take() else {
            return Ok(false);
        };
        handle.unsubscribe();
        task.abort();
        info!("stopped listening on '{}'", self.inner.config.topic);
        Ok(true)
    }

    pub fn is_listening(&self) -> bool {
        self.inner
            .realtime
            .lock()
            .map(|realtime| realtime.is_some())
            .unwrap_or(false)
    }
}

impl Drop for LiveCollection {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("failed to stop realtime pump: {}", err);
        }
    }
}
