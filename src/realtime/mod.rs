// ============================================================================
// Realtime Ingestion Channel
// ============================================================================
//
// Turns backend push events into store operations without letting stale
// data undo an in-flight optimistic change:
//
//   no pending mutation on the id        -> apply
//   pending, event not newer than submit -> discard
//   pending, event is our own echo       -> leave it to the confirmation
//   pending, event newer                 -> apply and abort the mutation
//
// After a reconnect the store is rebuilt from a full re-fetch; push delivery
// is not gap-free across a reconnect.
//
// ============================================================================

use crate::core::{Entity, EntityId, Result, Value};
use crate::remote::{ChangeEvent, ChangeOp, PageQuery, RemoteCollectionSource};
use crate::store::{CollectionStore, MutationKind, PendingMutation};
use log::{debug, warn};

/// What the channel did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Applied to the store; no local mutation involved.
    Applied,
    /// Older than the pending local mutation on the same id.
    Discarded,
    /// Echo of a pending local mutation; the confirmation will settle it.
    Echo,
    /// Newer than a pending local mutation: applied, mutation aborted.
    Aborted,
    /// Server echo of a pending create, swapped in for the temporary row.
    Adopted,
    /// Malformed, foreign topic, unknown id, or already consistent.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct RealtimeChannel {
    topic: String,
}

impl RealtimeChannel {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn ingest(&self, store: &mut CollectionStore, event: &ChangeEvent) -> IngestOutcome {
        if event.topic != self.topic {
            debug!("ignoring event for topic '{}'", event.topic);
            return IngestOutcome::Skipped;
        }
        let Some(id) = event.target_id().cloned() else {
            warn!("skipping {} event without an id", event.op);
            return IngestOutcome::Skipped;
        };
        if event.op != ChangeOp::Delete && event.entity.is_none() {
            warn!("skipping {} event for '{}' without an entity", event.op, id);
            return IngestOutcome::Skipped;
        }

        if let Some(pending) = store.pending_for(&id) {
            if event.server_timestamp <= pending.submitted_at {
                debug!(
                    "discarding {} event for '{}': older than pending {} mutation",
                    event.op, id, pending.kind
                );
                return IngestOutcome::Discarded;
            }
            if is_own_echo(pending, event) {
                debug!("{} event for '{}' echoes the pending mutation", event.op, id);
                return IngestOutcome::Echo;
            }

            debug!(
                "{} event for '{}' supersedes pending {} mutation",
                event.op, id, pending.kind
            );
            store.abort_pending(&id, event.server_timestamp);
            apply_concurrent(store, &id, event);
            return IngestOutcome::Aborted;
        }

        match (event.op, &event.entity) {
            (ChangeOp::Insert, Some(entity)) => {
                if !store.contains(&id) {
                    if let Some(mutation_id) = store.matching_pending_create(entity) {
                        if store.adopt_create(mutation_id, entity.clone()).is_ok() {
                            debug!("adopted '{}' for pending create {}", id, mutation_id);
                            return IngestOutcome::Adopted;
                        }
                    }
                }
                store.upsert(entity.clone());
                IngestOutcome::Applied
            }
            (ChangeOp::Update, Some(entity)) => match store.get(&id) {
                Some(current) => {
                    let merged = current.merged(&entity.fields, entity.updated_at);
                    store.upsert(merged);
                    IngestOutcome::Applied
                }
                None => {
                    warn!("skipping update event for unknown id '{}'", id);
                    IngestOutcome::Skipped
                }
            },
            (ChangeOp::Delete, _) => match store.remove(&id) {
                Some(_) => IngestOutcome::Applied,
                None => {
                    debug!("delete event for '{}': already absent", id);
                    IngestOutcome::Skipped
                }
            },
            (_, None) => IngestOutcome::Skipped,
        }
    }

    /// Fetch the whole collection page by page.
    ///
    /// Pages follow an id cursor, so rows changing behind the cursor never
    /// shift later pages. A walk is only accepted when the backend still
    /// reports as many rows as were collected; otherwise it starts over, up
    /// to [`RESYNC_ATTEMPTS`] times. Changes that still slip through arrive
    /// as push events once the subscription is live.
    ///
    /// The caller installs the result with [`CollectionStore::replace_all`].
    pub async fn resync(
        &self,
        remote: &dyn RemoteCollectionSource,
        page_size: usize,
    ) -> Result<Vec<Entity>> {
        let mut rows = Vec::new();
        for attempt in 1..=RESYNC_ATTEMPTS {
            rows = walk(remote, page_size).await?;
            let total = remote.fetch_page(&PageQuery::after(None, 1)).await?.total_count;
            if rows.len() == total {
                debug!("resync of '{}' fetched {} entities", self.topic, rows.len());
                return Ok(rows);
            }
            debug!(
                "resync of '{}' attempt {}: collected {} rows but backend holds {}",
                self.topic,
                attempt,
                rows.len(),
                total
            );
        }
        warn!(
            "resync of '{}' did not settle after {} attempts, keeping {} rows",
            self.topic,
            RESYNC_ATTEMPTS,
            rows.len()
        );
        Ok(rows)
    }
}

/// Walks of a full re-fetch before giving up on a consistent result.
pub const RESYNC_ATTEMPTS: usize = 3;

async fn walk(remote: &dyn RemoteCollectionSource, page_size: usize) -> Result<Vec<Entity>> {
    let mut rows: Vec<Entity> = Vec::new();
    let mut cursor = None;
    loop {
        let page = remote.fetch_page(&PageQuery::after(cursor, page_size)).await?;
        let fetched = page.rows.len();
        let Some(last) = page.rows.last() else {
            break;
        };
        cursor = Some(last.id.clone());
        rows.extend(page.rows);
        if fetched >= page.total_count {
            break;
        }
    }
    Ok(rows)
}

/// A push carrying exactly what the pending mutation wrote.
fn is_own_echo(pending: &PendingMutation, event: &ChangeEvent) -> bool {
    match (pending.kind, event.op) {
        (MutationKind::Delete, ChangeOp::Delete) => true,
        (MutationKind::Update, ChangeOp::Update) => {
            match (&pending.local_entity, &event.entity) {
                (Some(local), Some(server)) => local.fields.iter().all(|(name, value)| {
                    server.fields.get(name).unwrap_or(&Value::Null) == value
                }),
                _ => false,
            }
        }
        _ => false,
    }
}

fn apply_concurrent(store: &mut CollectionStore, id: &EntityId, event: &ChangeEvent) {
    match (event.op, &event.entity) {
        (ChangeOp::Delete, _) => {
            store.remove(id);
        }
        (_, Some(entity)) => {
            let next = match store.get(id) {
                Some(current) => current.merged(&entity.fields, entity.updated_at),
                None => entity.clone(),
            };
            store.upsert(next);
        }
        (_, None) => {}
    }
}
