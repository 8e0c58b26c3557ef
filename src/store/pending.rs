use crate::core::{Entity, EntityId};
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Identity of one optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationId(Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{label}")
    }
}

/// A confirmed mutation leaves the store, so there is no confirmed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Failed,
    /// A newer concurrent edit from another actor was applied over the
    /// optimistic value while the remote call was still in flight.
    Aborted,
}

/// An in-flight optimistic operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub mutation_id: MutationId,
    pub entity_id: EntityId,
    pub kind: MutationKind,
    /// Optimistic value written to the store. `None` for deletes.
    pub local_entity: Option<Entity>,
    pub submitted_at: DateTime<Utc>,
    pub status: MutationStatus,
}

impl PendingMutation {
    pub fn create(entity: Entity, submitted_at: DateTime<Utc>) -> Self {
        Self::build(entity.id.clone(), MutationKind::Create, Some(entity), submitted_at)
    }

    pub fn update(entity: Entity, submitted_at: DateTime<Utc>) -> Self {
        Self::build(entity.id.clone(), MutationKind::Update, Some(entity), submitted_at)
    }

    pub fn delete(entity_id: EntityId, submitted_at: DateTime<Utc>) -> Self {
        Self::build(entity_id, MutationKind::Delete, None, submitted_at)
    }

    fn build(
        entity_id: EntityId,
        kind: MutationKind,
        local_entity: Option<Entity>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            mutation_id: MutationId::new(),
            entity_id,
            kind,
            local_entity,
            submitted_at,
            status: MutationStatus::Pending,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.status == MutationStatus::Aborted
    }
}

/// Bookkeeping kept by the store while a mutation is outstanding.
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry {
    pub(crate) mutation: PendingMutation,
    /// Value of the id before the optimistic apply; restored on rollback.
    pub(crate) prior: Option<Entity>,
    /// Server timestamp of the remote event that aborted the mutation.
    pub(crate) aborted_by: Option<DateTime<Utc>>,
    /// Server id of a create whose realtime echo arrived before the reply.
    pub(crate) adopted_as: Option<EntityId>,
}

/// Result of confirming a pending mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// The store now holds the confirmed value (`None` after a delete).
    Applied(Option<Entity>),
    /// The mutation had been aborted by a newer remote edit; the store keeps
    /// that edit and `current` is what it holds now.
    Superseded { current: Option<Entity> },
}
