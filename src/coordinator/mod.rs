// ============================================================================
// Mutation Coordinator
// ============================================================================
//
// Turns a user intent into optimistic local state plus one remote call:
//
//   validate -> apply_optimistic -> remote call (bounded by the timeout)
//            -> confirm           on success
//            -> rollback + error  on failure (rollback always comes first)
//
// The store lock is taken for each synchronous step and released before
// the remote call is awaited.
//
// ============================================================================

use crate::config::EngineConfig;
use crate::core::{
    ACTIVE_FIELD, Clock, CollectionError, Entity, EntityId, Fields, ORDER_FIELD, PARENT_FIELD,
    Result, Value,
};
use crate::remote::{RemoteCollectionSource, RemoteError};
use crate::store::{CollectionStore, ConfirmOutcome, MutationId, PendingMutation, SharedStore};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

pub struct MutationCoordinator {
    store: SharedStore,
    remote: Arc<dyn RemoteCollectionSource>,
    clock: Arc<dyn Clock>,
    required_fields: Vec<String>,
    temp_id_prefix: String,
    timeout: Duration,
}

impl MutationCoordinator {
    pub fn new(
        store: SharedStore,
        remote: Arc<dyn RemoteCollectionSource>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            required_fields: config.required_fields.clone(),
            temp_id_prefix: config.temp_id_prefix.clone(),
            timeout: config.mutation_timeout,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Create under a fresh temporary id. Resolves to the server-canonical
    /// entity, which carries the real id.
    pub async fn create(&self, fields: Fields) -> Result<Entity> {
        let temp_id = EntityId::temporary(&self.temp_id_prefix);
        self.create_with_temp_id(temp_id, fields).await
    }

    /// Create under a caller-chosen temporary id. A second create with the
    /// same id while the first is pending fails with `ConflictingMutation`
    /// before any remote call.
    pub async fn create_with_temp_id(&self, temp_id: EntityId, fields: Fields) -> Result<Entity> {
        let span = info_span!("coordinator.create", entity_id = %temp_id);
        async move {
            let fields = self.checked_required(fields, true)?;
            let (mutation_id, fields) = {
                let mut store = self.store.lock()?;
                let fields = with_create_defaults(&store, fields);
                let now = self.clock.now();
                let local = Entity::new(temp_id.clone(), fields.clone(), now);
                let mutation = PendingMutation::create(local, now);
                let mutation_id = mutation.mutation_id;
                store.apply_optimistic(mutation)?;
                (mutation_id, fields)
            };
            event!(Level::DEBUG, mutation_id = %mutation_id, "optimistic create applied");

            match self.bounded(self.remote.create(fields)).await {
                Ok(server) => {
                    let confirmed = self.settle(mutation_id, &temp_id, Some(server))?;
                    let entity = confirmed.ok_or_else(|| CollectionError::NotFound(temp_id.clone()))?;
                    event!(Level::INFO, server_id = %entity.id, "create confirmed");
                    Ok(entity)
                }
                Err(err) => Err(self.roll_back(mutation_id, &temp_id, err)),
            }
        }
        .instrument(span)
        .await
    }

    /// Partial update of an entity present in the store.
    pub async fn update(&self, id: &EntityId, patch: Fields) -> Result<Entity> {
        let span = info_span!("coordinator.update", entity_id = %id);
        async move {
            let patch = self.checked_required(patch, false)?;
            let mutation_id = {
                let mut store = self.store.lock()?;
                let current = store
                    .get(id)
                    .ok_or_else(|| CollectionError::NotFound(id.clone()))?;
                validate_parent_move(&store, id, &patch)?;
                let now = self.clock.now();
                let mutation = PendingMutation::update(current.merged(&patch, now), now);
                let mutation_id = mutation.mutation_id;
                store.apply_optimistic(mutation)?;
                mutation_id
            };
            event!(Level::DEBUG, mutation_id = %mutation_id, "optimistic update applied");

            match self.bounded(self.remote.update(id, patch)).await {
                Ok(server) => {
                    let confirmed = self.settle(mutation_id, id, Some(server))?;
                    event!(Level::INFO, "update confirmed");
                    match confirmed {
                        Some(entity) => Ok(entity),
                        None => self
                            .store
                            .lock()?
                            .get(id)
                            .cloned()
                            .ok_or_else(|| CollectionError::NotFound(id.clone())),
                    }
                }
                Err(err) => Err(self.roll_back(mutation_id, id, err)),
            }
        }
        .instrument(span)
        .await
    }

    /// Remove an entity present in the store.
    ///
    /// Dependents are not cascaded: the backend re-parents children, and the
    /// secondary aggregate is refreshed independently.
    pub async fn delete(&self, id: &EntityId) -> Result<()> {
        let span = info_span!("coordinator.delete", entity_id = %id);
        async move {
            let mutation_id = {
                let mut store = self.store.lock()?;
                if !store.contains(id) {
                    return Err(CollectionError::NotFound(id.clone()));
                }
                let mutation = PendingMutation::delete(id.clone(), self.clock.now());
                let mutation_id = mutation.mutation_id;
                store.apply_optimistic(mutation)?;
                mutation_id
            };
            event!(Level::DEBUG, mutation_id = %mutation_id, "optimistic delete applied");

            match self.bounded(self.remote.delete(id)).await {
                Ok(()) => {
                    self.settle(mutation_id, id, None)?;
                    event!(Level::INFO, "delete confirmed");
                    Ok(())
                }
                // Already gone on the server: the goal state is reached.
                Err(RemoteError::NotFound(_)) => {
                    event!(Level::WARN, "delete target already absent on the server");
                    self.settle(mutation_id, id, None)?;
                    Ok(())
                }
                Err(err) => Err(self.roll_back(mutation_id, id, err)),
            }
        }
        .instrument(span)
        .await
    }

    async fn bounded<T, F>(&self, request: F) -> std::result::Result<T, RemoteError>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Network(format!(
                "no response within {} ms",
                self.timeout.as_millis()
            ))),
        }
    }

    fn settle(
        &self,
        mutation_id: MutationId,
        id: &EntityId,
        server: Option<Entity>,
    ) -> Result<Option<Entity>> {
        let mut store = self.store.lock()?;
        match store.confirm(mutation_id, server)? {
            ConfirmOutcome::Applied(entity) => Ok(entity),
            ConfirmOutcome::Superseded { current } => {
                event!(Level::WARN, "confirmation superseded by a concurrent edit");
                Err(CollectionError::StaleWrite {
                    id: id.clone(),
                    current: current.map(Box::new),
                })
            }
        }
    }

    /// Roll back, then translate the failure. Mutations aborted by a
    /// concurrent edit, and backend stale-write rejections, become
    /// `StaleWrite` carrying the re-read current value.
    fn roll_back(&self, mutation_id: MutationId, id: &EntityId, err: RemoteError) -> CollectionError {
        let mut store = match self.store.lock() {
            Ok(store) => store,
            Err(poisoned) => return poisoned.into(),
        };
        let mutation = match store.rollback(mutation_id) {
            Ok(mutation) => mutation,
            Err(rollback_err) => return rollback_err,
        };
        event!(Level::ERROR, error = %err, kind = %mutation.kind, "remote call failed, rolled back");

        if mutation.is_aborted() || err.is_stale_write() {
            return CollectionError::StaleWrite {
                id: id.clone(),
                current: store.get(id).cloned().map(Box::new),
            };
        }
        err.into()
    }

    /// Required fields must be non-empty after trimming; text values are
    /// stored trimmed. On update only the fields present are checked.
    fn checked_required(&self, mut fields: Fields, creating: bool) -> Result<Fields> {
        for name in &self.required_fields {
            let trimmed = match fields.get(name) {
                None if !creating => continue,
                Some(Value::Text(text)) => text.trim().to_string(),
                Some(value) if !value.is_blank() => continue,
                _ => return Err(CollectionError::Validation(format!("'{}' is required", name))),
            };
            if trimmed.is_empty() {
                return Err(CollectionError::Validation(format!(
                    "'{}' must not be empty",
                    name
                )));
            }
            fields.insert(name.clone(), Value::Text(trimmed));
        }
        Ok(fields)
    }
}

/// New entities are active and appended after their siblings unless the
/// caller says otherwise.
fn with_create_defaults(store: &CollectionStore, mut fields: Fields) -> Fields {
    fields
        .entry(ACTIVE_FIELD.to_string())
        .or_insert(Value::Boolean(true));

    if !fields.contains_key(ORDER_FIELD) {
        let parent = fields.get(PARENT_FIELD).cloned().unwrap_or(Value::Null);
        let next = store
            .entities()
            .filter(|entity| entity.field(PARENT_FIELD).unwrap_or(&Value::Null) == &parent)
            .filter_map(|entity| entity.field(ORDER_FIELD).and_then(Value::as_i64))
            .max()
            .map_or(0, |max| max + 1);
        fields.insert(ORDER_FIELD.to_string(), Value::Integer(next));
    }
    fields
}

/// A new parent must exist and must not be the entity or one of its
/// descendants.
fn validate_parent_move(store: &CollectionStore, id: &EntityId, patch: &Fields) -> Result<()> {
    let parent_id = match patch.get(PARENT_FIELD) {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Text(parent)) => EntityId::from(parent.as_str()),
        Some(other) => {
            return Err(CollectionError::Validation(format!(
                "'{}' must be text, got {}",
                PARENT_FIELD,
                other.type_name()
            )));
        }
    };

    if parent_id == *id {
        return Err(CollectionError::Validation(format!(
            "'{}' cannot be its own parent",
            id
        )));
    }
    if !store.contains(&parent_id) {
        return Err(CollectionError::Validation(format!(
            "parent '{}' does not exist",
            parent_id
        )));
    }

    let mut visited = HashSet::new();
    let mut cursor = Some(parent_id);
    while let Some(ancestor) = cursor {
        if ancestor == *id {
            return Err(CollectionError::Validation(format!(
                "moving '{}' under its own descendant would create a cycle",
                id
            )));
        }
        if !visited.insert(ancestor.clone()) {
            break;
        }
        cursor = store
            .get(&ancestor)
            .and_then(|entity| entity.text(PARENT_FIELD))
            .map(EntityId::from);
    }
    Ok(())
}
