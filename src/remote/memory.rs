use super::{
    AggregateSource, ChangeEvent, PageQuery, PageResult, RemoteCollectionSource, RemoteError,
    Subscription, SubscriptionHandle, SubscriptionMessage,
};
use crate::aggregate::SecondaryAggregate;
use crate::core::{Clock, Entity, EntityId, Fields, ORDER_FIELD, PARENT_FIELD, SystemClock, Value};
use crate::projection::ProjectionEngine;
use crate::store::CollectionSnapshot;
use crate::view::ViewState;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Operations of the in-memory backend, for failure injection and call
/// counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    FetchPage,
    Create,
    Update,
    Delete,
    FetchAggregate,
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<EntityId, Entity>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<SubscriptionMessage>)>,
    next_subscriber: u64,
    next_id: u64,
    offline: bool,
    latency: Duration,
    injected: VecDeque<(RemoteOp, RemoteError)>,
    calls: HashMap<RemoteOp, usize>,
    aggregate: HashMap<EntityId, i64>,
}

impl MemoryState {
    fn broadcast(&mut self, message: SubscriptionMessage) {
        self.subscribers
            .retain(|(_, sender)| sender.send(message.clone()).is_ok());
    }

    /// Count the call and report whether it must fail.
    fn enter(&mut self, op: RemoteOp) -> Result<(), RemoteError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.offline {
            return Err(RemoteError::Network("backend unreachable".to_string()));
        }
        if let Some(position) = self.injected.iter().position(|(target, _)| *target == op) {
            if let Some((_, err)) = self.injected.remove(position) {
                return Err(err);
            }
        }
        Ok(())
    }
}

struct Inner {
    topic: String,
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

/// In-process backend with realtime push.
///
/// Mirrors the hosted backend's category semantics: server-assigned ids,
/// `updated_at` stamping, change events on every write (sent before the
/// reply), and re-parenting of children on delete. Failures, latency and
/// connection drops can be switched on for tests.
#[derive(Clone)]
pub struct InMemoryRemote {
    inner: Arc<Inner>,
}

impl InMemoryRemote {
    pub fn new(topic: &str) -> Self {
        Self::with_clock(topic, Arc::new(SystemClock))
    }

    pub fn with_clock(topic: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                topic: topic.to_string(),
                clock,
                state: Mutex::new(MemoryState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn next_id(&self, state: &mut MemoryState) -> EntityId {
        state.next_id += 1;
        EntityId::new(format!("{}-{}", self.inner.topic, state.next_id))
    }

    // ------------------------------------------------------------------
    // Test controls
    // ------------------------------------------------------------------

    /// Insert rows directly, without events.
    pub fn seed(&self, entities: Vec<Entity>) {
        let mut state = self.state();
        for entity in entities {
            state.rows.insert(entity.id.clone(), entity);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// The next call of `op` fails with `err`.
    pub fn fail_next(&self, op: RemoteOp, err: RemoteError) {
        self.state().injected.push_back((op, err));
    }

    pub fn calls(&self, op: RemoteOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn set_aggregate(&self, values: HashMap<EntityId, i64>) {
        self.state().aggregate = values;
    }

    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.state().rows.get(id).cloned()
    }

    pub fn rows(&self) -> Vec<Entity> {
        self.state().rows.values().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    /// Another actor creates an entity.
    pub fn external_insert(&self, fields: Fields) -> Entity {
        let mut state = self.state();
        let id = self.next_id(&mut state);
        let now = self.inner.clock.now();
        let entity = Entity::new(id, fields, now);
        state.rows.insert(entity.id.clone(), entity.clone());
        state.broadcast(SubscriptionMessage::Event(ChangeEvent::insert(
            &self.inner.topic,
            entity.clone(),
            now,
        )));
        entity
    }

    /// Another actor edits an entity.
    pub fn external_update(&self, id: &EntityId, fields: Fields) -> Option<Entity> {
        let mut state = self.state();
        let now = self.inner.clock.now();
        let updated = state.rows.get(id)?.merged(&fields, now);
        state.rows.insert(id.clone(), updated.clone());
        state.broadcast(SubscriptionMessage::Event(ChangeEvent::update(
            &self.inner.topic,
            updated.clone(),
            now,
        )));
        Some(updated)
    }

    /// Another actor deletes an entity.
    pub fn external_delete(&self, id: &EntityId) -> bool {
        let mut state = self.state();
        self.delete_locked(&mut state, id).is_ok()
    }

    /// Push a raw message to every subscriber.
    pub fn push(&self, message: SubscriptionMessage) {
        self.state().broadcast(message);
    }

    /// Change a row without notifying anyone, as if the event was lost.
    pub fn silent_update(&self, id: &EntityId, fields: Fields) -> Option<Entity> {
        let mut state = self.state();
        let now = self.inner.clock.now();
        let updated = state.rows.get(id)?.merged(&fields, now);
        state.rows.insert(id.clone(), updated.clone());
        Some(updated)
    }

    fn delete_locked(&self, state: &mut MemoryState, id: &EntityId) -> Result<(), RemoteError> {
        let removed = state
            .rows
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.clone()))?;
        let now = self.inner.clock.now();
        let new_parent = removed
            .field(PARENT_FIELD)
            .cloned()
            .unwrap_or(Value::Null);

        // Children move to the deleted entity's parent, appended after the
        // existing siblings there.
        let parent_key = Value::from(id.as_str());
        let children: Vec<EntityId> = state
            .rows
            .values()
            .filter(|row| row.field(PARENT_FIELD) == Some(&parent_key))
            .map(|row| row.id.clone())
            .collect();
        let mut next_order = state
            .rows
            .values()
            .filter(|row| row.id != *id)
            .filter(|row| row.field(PARENT_FIELD).unwrap_or(&Value::Null) == &new_parent)
            .filter_map(|row| row.field(ORDER_FIELD).and_then(Value::as_i64))
            .max()
            .map_or(0, |max| max + 1);

        let mut reparented = Vec::with_capacity(children.len());
        for child_id in children {
            if let Some(child) = state.rows.get(&child_id) {
                let mut patch = Fields::new();
                patch.insert(PARENT_FIELD.to_string(), new_parent.clone());
                patch.insert(ORDER_FIELD.to_string(), Value::Integer(next_order));
                next_order += 1;
                let moved = child.merged(&patch, now);
                state.rows.insert(child_id, moved.clone());
                reparented.push(moved);
            }
        }

        state.rows.remove(id);
        for moved in reparented {
            state.broadcast(SubscriptionMessage::Event(ChangeEvent::update(
                &self.inner.topic,
                moved,
                now,
            )));
        }
        state.broadcast(SubscriptionMessage::Event(ChangeEvent::delete(
            &self.inner.topic,
            id.clone(),
            now,
        )));
        Ok(())
    }
}

#[async_trait]
impl RemoteCollectionSource for InMemoryRemote {
    async fn fetch_page(&self, query: &PageQuery) -> Result<PageResult, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.enter(RemoteOp::FetchPage)?;
        if query.page_size == 0 {
            return Err(RemoteError::Rejected("page size must be > 0".to_string()));
        }

        let snapshot: CollectionSnapshot = state
            .rows
            .iter()
            .filter(|(id, _)| query.after.as_ref().is_none_or(|after| *id > after))
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect();
        let aggregate = SecondaryAggregate::from_values(state.aggregate.clone());
        let view = ViewState {
            search_text: query.search_text.clone(),
            sort_key: query.sort_key.clone(),
            sort_direction: query.sort_direction,
            page_index: query.page_index,
            page_size: query.page_size,
        };
        let page = ProjectionEngine::new("name").project(&snapshot, &aggregate, &view);

        // Past-the-end pages are empty here rather than clamped.
        let rows = if page.page_index == query.page_index {
            page.rows.into_iter().map(|row| row.entity).collect()
        } else {
            Vec::new()
        };

        Ok(PageResult {
            rows,
            total_count: page.filtered_count,
        })
    }

    async fn create(&self, fields: Fields) -> Result<Entity, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.enter(RemoteOp::Create)?;

        let id = self.next_id(&mut state);
        let now = self.inner.clock.now();
        let entity = Entity::new(id, fields, now);
        state.rows.insert(entity.id.clone(), entity.clone());
        state.broadcast(SubscriptionMessage::Event(ChangeEvent::insert(
            &self.inner.topic,
            entity.clone(),
            now,
        )));
        Ok(entity)
    }

    async fn update(&self, id: &EntityId, fields: Fields) -> Result<Entity, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.enter(RemoteOp::Update)?;

        let now = self.inner.clock.now();
        let updated = state
            .rows
            .get(id)
            .ok_or_else(|| RemoteError::NotFound(id.clone()))?
            .merged(&fields, now);
        state.rows.insert(id.clone(), updated.clone());
        state.broadcast(SubscriptionMessage::Event(ChangeEvent::update(
            &self.inner.topic,
            updated.clone(),
            now,
        )));
        Ok(updated)
    }

    async fn delete(&self, id: &EntityId) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.enter(RemoteOp::Delete)?;
        self.delete_locked(&mut state, id)
    }

    fn subscribe(&self, topic: &str) -> Result<Subscription, RemoteError> {
        if topic != self.inner.topic {
            return Err(RemoteError::Rejected(format!("unknown topic '{}'", topic)));
        }

        let (sender, messages) = mpsc::unbounded_channel();
        let subscriber_id = {
            let mut state = self.state();
            state.next_subscriber += 1;
            let subscriber_id = state.next_subscriber;
            state.subscribers.push((subscriber_id, sender));
            subscriber_id
        };

        let inner = Arc::downgrade(&self.inner);
        let handle = SubscriptionHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut state = inner
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state.subscribers.retain(|(id, _)| *id != subscriber_id);
            }
        });

        Ok(Subscription { messages, handle })
    }
}

#[async_trait]
impl AggregateSource for InMemoryRemote {
    async fn fetch_aggregate(&self) -> Result<HashMap<EntityId, i64>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.enter(RemoteOp::FetchAggregate)?;
        Ok(state.aggregate.clone())
    }
}
