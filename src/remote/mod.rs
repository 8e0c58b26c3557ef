//! Contract of the backend the engine talks to.
//!
//! Transport is not modelled: implementations may sit on HTTP, WebSocket or
//! anything else. [`InMemoryRemote`] is a complete in-process backend used by
//! the tests and the demo binary.

mod memory;

pub use memory::{InMemoryRemote, RemoteOp};

use crate::core::{CollectionError, Entity, EntityId, Fields};
use crate::projection::{SortDirection, SortKey};
use crate::view::ViewState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("entity '{0}' not found")]
    NotFound(EntityId),

    /// The write lost against a concurrent modification.
    #[error("stale write on '{0}'")]
    StaleWrite(EntityId),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::StaleWrite(_))
    }
}

impl From<RemoteError> for CollectionError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(message) => Self::NetworkFailure(message),
            RemoteError::NotFound(id) => Self::NotFound(id),
            RemoteError::StaleWrite(id) => Self::StaleWrite { id, current: None },
            RemoteError::Rejected(message) => Self::Backend(message),
        }
    }
}

// ============================================================================
// Paging
// ============================================================================

/// Server-side filter/sort/paginate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub search_text: String,
    pub sort_key: SortKey,
    pub sort_direction: SortDirection,
    pub page_index: usize,
    pub page_size: usize,
    /// Key-set cursor: only rows whose id sorts after it are considered.
    /// Unlike `page_index`, it does not shift when earlier rows change.
    #[serde(default)]
    pub after: Option<EntityId>,
}

impl PageQuery {
    pub fn from_view(view: &ViewState) -> Self {
        Self {
            search_text: view.search_text.clone(),
            sort_key: view.sort_key.clone(),
            sort_direction: view.sort_direction,
            page_index: view.page_index,
            page_size: view.page_size,
            after: None,
        }
    }

    /// Unfiltered, id-ordered page; used by the full re-fetch.
    pub fn all(page_index: usize, page_size: usize) -> Self {
        Self {
            search_text: String::new(),
            sort_key: SortKey::field("id"),
            sort_direction: SortDirection::Ascending,
            page_index,
            page_size,
            after: None,
        }
    }

    /// Unfiltered, id-ordered rows after `cursor`; used by the full
    /// re-fetch. `total_count` then counts the rows left after the cursor.
    pub fn after(cursor: Option<EntityId>, page_size: usize) -> Self {
        Self {
            after: cursor,
            ..Self::all(0, page_size)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub rows: Vec<Entity>,
    /// Number of rows matching the query's filter, over all pages.
    pub total_count: usize,
}

// ============================================================================
// Push events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{label}")
    }
}

/// A change pushed by the backend. Shape is not trusted: an insert/update
/// without an entity, or a delete without an id, is malformed and skipped
/// by the ingestion channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Originating table/topic.
    pub topic: String,
    pub op: ChangeOp,
    #[serde(default)]
    pub id: Option<EntityId>,
    /// Full entity for inserts; full or partial for updates.
    #[serde(default)]
    pub entity: Option<Entity>,
    pub server_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn insert(topic: &str, entity: Entity, server_timestamp: DateTime<Utc>) -> Self {
        Self {
            topic: topic.to_string(),
            op: ChangeOp::Insert,
            id: Some(entity.id.clone()),
            entity: Some(entity),
            server_timestamp,
        }
    }

    pub fn update(topic: &str, entity: Entity, server_timestamp: DateTime<Utc>) -> Self {
        Self {
            op: ChangeOp::Update,
            ..Self::insert(topic, entity, server_timestamp)
        }
    }

    pub fn delete(topic: &str, id: EntityId, server_timestamp: DateTime<Utc>) -> Self {
        Self {
            topic: topic.to_string(),
            op: ChangeOp::Delete,
            id: Some(id),
            entity: None,
            server_timestamp,
        }
    }

    /// Id named by the event, falling back to the entity's id.
    pub fn target_id(&self) -> Option<&EntityId> {
        self.id
            .as_ref()
            .or_else(|| self.entity.as_ref().map(|entity| &entity.id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    Event(ChangeEvent),
    /// Connection dropped; events may be lost until `Reconnected`.
    Disconnected,
    Reconnected,
}

/// Tear-down handle of a live subscription. Dropping it unsubscribes too.
pub struct SubscriptionHandle {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// A live push channel: messages plus the handle that closes it.
#[derive(Debug)]
pub struct Subscription {
    pub messages: mpsc::UnboundedReceiver<SubscriptionMessage>,
    pub handle: SubscriptionHandle,
}

// ============================================================================
// Contracts
// ============================================================================

#[async_trait]
pub trait RemoteCollectionSource: Send + Sync {
    /// Server-side filtered, sorted, paginated read.
    async fn fetch_page(&self, query: &PageQuery) -> Result<PageResult, RemoteError>;

    /// Returns the canonical entity, carrying the server-assigned id.
    async fn create(&self, fields: Fields) -> Result<Entity, RemoteError>;

    /// Partial update; returns the canonical entity.
    async fn update(&self, id: &EntityId, fields: Fields) -> Result<Entity, RemoteError>;

    async fn delete(&self, id: &EntityId) -> Result<(), RemoteError>;

    /// Open a push channel for changes on `topic`.
    fn subscribe(&self, topic: &str) -> Result<Subscription, RemoteError>;
}

/// Independent source of the secondary aggregate.
#[async_trait]
pub trait AggregateSource: Send + Sync {
    async fn fetch_aggregate(&self) -> Result<HashMap<EntityId, i64>, RemoteError>;
}
