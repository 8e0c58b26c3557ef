// ============================================================================
// Collection Store
// ============================================================================
//
// Single source of truth for "what entities exist, with what values" from
// this client's point of view. Optimistic writes and remote push events are
// merged here; the projection is derived from the snapshot and never stored.
//
// ============================================================================

mod pending;

pub use pending::{ConfirmOutcome, MutationId, MutationKind, MutationStatus, PendingMutation};
pub(crate) use pending::PendingEntry;

use crate::core::{CollectionError, Entity, EntityId, RenderKey, Result, Value};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Materialized store contents. Cheap to clone (structural sharing).
pub type CollectionSnapshot = im::OrdMap<EntityId, Entity>;

/// The store as shared between the coordinator, the realtime pump and the
/// view. The lock is never held across an `.await`.
pub type SharedStore = Arc<Mutex<CollectionStore>>;

/// Handle returned by [`CollectionStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Passed to listeners after every snapshot change.
#[derive(Debug)]
pub struct StoreChange<'a> {
    pub revision: u64,
    pub affected: &'a [EntityId],
    pub snapshot: &'a CollectionSnapshot,
}

type Listener = Box<dyn Fn(&StoreChange<'_>) + Send + Sync>;

#[derive(Default)]
pub struct CollectionStore {
    entities: CollectionSnapshot,
    pending: HashMap<EntityId, PendingEntry>,
    by_mutation: HashMap<MutationId, EntityId>,
    render_keys: HashMap<EntityId, RenderKey>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    revision: u64,
}

impl fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionStore")
            .field("entities", &self.entities.len())
            .field("pending", &self.pending.len())
            .field("listeners", &self.listeners.len())
            .field("revision", &self.revision)
            .finish()
    }
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn snapshot(&self) -> CollectionSnapshot {
        self.entities.clone()
    }

    /// Incremented on every snapshot change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn render_key(&self, id: &EntityId) -> RenderKey {
        self.render_keys
            .get(id)
            .cloned()
            .unwrap_or_else(|| RenderKey::from(id))
    }

    pub fn pending_for(&self, id: &EntityId) -> Option<&PendingMutation> {
        self.pending.get(id).map(|entry| &entry.mutation)
    }

    pub fn pending_mutation(&self, mutation_id: MutationId) -> Option<&PendingMutation> {
        self.by_mutation
            .get(&mutation_id)
            .and_then(|id| self.pending_for(id))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ------------------------------------------------------------------
    // Plain writes
    // ------------------------------------------------------------------

    /// Insert or replace. The last call wins for a given id.
    pub fn upsert(&mut self, entity: Entity) {
        let id = entity.id.clone();
        self.entities.insert(id.clone(), entity);
        self.notify(&[id]);
    }

    /// Idempotent delete.
    pub fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        let removed = self.entities.remove(id);
        if removed.is_some() {
            self.render_keys.remove(id);
            self.notify(std::slice::from_ref(id));
        }
        removed
    }

    /// Replace the whole contents with a freshly fetched server state.
    ///
    /// Ids with an outstanding mutation keep their optimistic value (or stay
    /// absent for a pending delete) until that mutation resolves.
    pub fn replace_all(&mut self, entities: Vec<Entity>) {
        let mut next = CollectionSnapshot::new();
        for entity in entities {
            next.insert(entity.id.clone(), entity);
        }

        for (id, entry) in &mut self.pending {
            match entry.mutation.kind {
                MutationKind::Delete => {
                    if let Some(server) = next.remove(id) {
                        entry.prior = Some(server);
                    }
                }
                MutationKind::Create | MutationKind::Update => {
                    if let Some(server) = next.get(id) {
                        entry.prior = Some(server.clone());
                    }
                    if let Some(current) = self.entities.get(id) {
                        next.insert(id.clone(), current.clone());
                    }
                }
            }
        }

        let affected: Vec<EntityId> = self
            .entities
            .keys()
            .chain(next.keys())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        self.render_keys.retain(|id, _| next.contains_key(id));
        self.entities = next;
        debug!("store replaced with {} entities", self.entities.len());
        self.notify(&affected);
    }

    // ------------------------------------------------------------------
    // Optimistic writes
    // ------------------------------------------------------------------

    /// Record `mutation` as pending and apply it to the snapshot.
    ///
    /// Fails with `ConflictingMutation` if the id already has a pending
    /// mutation; in that case nothing is touched.
    pub fn apply_optimistic(&mut self, mutation: PendingMutation) -> Result<()> {
        let id = mutation.entity_id.clone();
        if self.pending.contains_key(&id) {
            return Err(CollectionError::ConflictingMutation(id));
        }

        let prior = self.entities.get(&id).cloned();
        match mutation.kind {
            MutationKind::Create | MutationKind::Update => {
                let entity = mutation.local_entity.clone().ok_or_else(|| {
                    CollectionError::Validation(format!(
                        "{} mutation for '{}' carries no entity",
                        mutation.kind, id
                    ))
                })?;
                if mutation.kind == MutationKind::Create && prior.is_some() {
                    return Err(CollectionError::ConflictingMutation(id));
                }
                self.entities.insert(id.clone(), entity);
            }
            MutationKind::Delete => {
                self.entities.remove(&id);
            }
        }

        self.by_mutation.insert(mutation.mutation_id, id.clone());
        self.pending.insert(
            id.clone(),
            PendingEntry {
                mutation,
                prior,
                aborted_by: None,
                adopted_as: None,
            },
        );
        self.notify(&[id]);
        Ok(())
    }

    /// Clear the pending tag of a mutation, installing the server-canonical
    /// entity when one is returned.
    ///
    /// For a create, the server entity carries the real id: the temporary
    /// entity is dropped and the render key moves to the real id.
    pub fn confirm(
        &mut self,
        mutation_id: MutationId,
        server_entity: Option<Entity>,
    ) -> Result<ConfirmOutcome> {
        let (id, entry) = self.take_pending(mutation_id)?;

        if let Some(aborted_at) = entry.aborted_by {
            // A confirmed delete landed after whatever aborted it.
            if entry.mutation.kind == MutationKind::Delete {
                self.entities.remove(&id);
                self.render_keys.remove(&id);
                self.notify(std::slice::from_ref(&id));
                return Ok(ConfirmOutcome::Applied(None));
            }
            match server_entity {
                // The server accepted our write after the concurrent edit.
                Some(server) if server.updated_at > aborted_at => {
                    let current = self.install(&id, server);
                    return Ok(ConfirmOutcome::Applied(Some(current)));
                }
                _ => {
                    // Only the pending flag changes.
                    self.notify(std::slice::from_ref(&id));
                    return Ok(ConfirmOutcome::Superseded {
                        current: self.entities.get(&id).cloned(),
                    });
                }
            }
        }

        let confirmed = match (entry.mutation.kind, server_entity) {
            (MutationKind::Delete, _) => {
                self.notify(&[id]);
                None
            }
            (MutationKind::Create, Some(server)) => {
                let render_key = self.render_key(&id);
                if entry.adopted_as.as_ref() != Some(&server.id) {
                    self.entities.remove(&id);
                    self.render_keys.remove(&id);
                }
                let server_id = server.id.clone();
                self.entities.insert(server_id.clone(), server.clone());
                if server_id != id {
                    self.render_keys.entry(server_id.clone()).or_insert(render_key);
                }
                self.notify(&[id, server_id]);
                Some(server)
            }
            (MutationKind::Update, Some(server)) => Some(self.install(&id, server)),
            (_, None) => {
                self.notify(std::slice::from_ref(&id));
                self.entities.get(&id).cloned()
            }
        };

        Ok(ConfirmOutcome::Applied(confirmed))
    }

    /// Revert the snapshot to its value before the mutation.
    ///
    /// An aborted mutation is only untagged: the remote edit that aborted it
    /// is already the current value.
    pub fn rollback(&mut self, mutation_id: MutationId) -> Result<PendingMutation> {
        let (id, mut entry) = self.take_pending(mutation_id)?;

        if entry.aborted_by.is_some() {
            entry.mutation.status = MutationStatus::Aborted;
            self.notify(&[id]);
            return Ok(entry.mutation);
        }

        entry.mutation.status = MutationStatus::Failed;
        match (entry.mutation.kind, entry.prior) {
            (MutationKind::Create, _) => {
                if entry.adopted_as.is_none() {
                    self.entities.remove(&id);
                }
                self.render_keys.remove(&id);
            }
            (_, Some(prior)) => {
                self.entities.insert(id.clone(), prior);
            }
            (_, None) => {
                self.entities.remove(&id);
            }
        }
        self.notify(&[id]);
        Ok(entry.mutation)
    }

    /// Mark the pending mutation on `id` as aborted by a newer remote edit
    /// stamped `server_timestamp`.
    pub fn abort_pending(&mut self, id: &EntityId, server_timestamp: DateTime<Utc>) -> bool {
        match self.pending.get_mut(id) {
            Some(entry) => {
                entry.mutation.status = MutationStatus::Aborted;
                entry.aborted_by = Some(server_timestamp);
                true
            }
            None => false,
        }
    }

    /// Find a pending create whose optimistic fields all appear, unchanged,
    /// in `server`. Used to recognise the realtime echo of our own create.
    pub fn matching_pending_create(&self, server: &Entity) -> Option<MutationId> {
        self.pending
            .values()
            .filter(|entry| {
                entry.mutation.kind == MutationKind::Create
                    && entry.adopted_as.is_none()
                    && entry.mutation.status == MutationStatus::Pending
            })
            .filter(|entry| {
                entry.mutation.local_entity.as_ref().is_some_and(|local| {
                    local.fields.iter().all(|(name, value)| {
                        server.fields.get(name).unwrap_or(&Value::Null) == value
                    })
                })
            })
            .min_by_key(|entry| entry.mutation.submitted_at)
            .map(|entry| entry.mutation.mutation_id)
    }

    /// Swap the temporary row of a pending create for its server echo, so the
    /// row is never shown twice.
    pub fn adopt_create(&mut self, mutation_id: MutationId, server: Entity) -> Result<()> {
        let temp_id = self
            .by_mutation
            .get(&mutation_id)
            .cloned()
            .ok_or_else(|| CollectionError::UnknownMutation(mutation_id.to_string()))?;
        let render_key = self.render_key(&temp_id);
        let server_id = server.id.clone();

        if let Some(entry) = self.pending.get_mut(&temp_id) {
            entry.adopted_as = Some(server_id.clone());
        }
        self.entities.remove(&temp_id);
        self.entities.insert(server_id.clone(), server);
        self.render_keys.insert(server_id.clone(), render_key);
        self.notify(&[temp_id, server_id]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Register a callback run synchronously after every snapshot change.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&StoreChange<'_>) + Send + Sync + 'static,
    {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        before != self.listeners.len()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn take_pending(&mut self, mutation_id: MutationId) -> Result<(EntityId, PendingEntry)> {
        let id = self
            .by_mutation
            .remove(&mutation_id)
            .ok_or_else(|| CollectionError::UnknownMutation(mutation_id.to_string()))?;
        let entry = self
            .pending
            .remove(&id)
            .ok_or_else(|| CollectionError::UnknownMutation(mutation_id.to_string()))?;
        Ok((id, entry))
    }

    fn install(&mut self, id: &EntityId, server: Entity) -> Entity {
        if server.id != *id {
            self.entities.remove(id);
        }
        let server_id = server.id.clone();
        self.entities.insert(server_id.clone(), server.clone());
        self.notify(&[id.clone(), server_id]);
        server
    }

    fn notify(&mut self, affected: &[EntityId]) {
        self.revision += 1;
        let change = StoreChange {
            revision: self.revision,
            affected,
            snapshot: &self.entities,
        };
        for (_, listener) in &self.listeners {
            listener(&change);
        }
    }
}
