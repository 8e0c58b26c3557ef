use crate::core::{CollectionError, EntityId};
use crate::store::MutationKind;

/// Notifications for the view layer, fanned out on a broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    /// The store changed; visible rows may differ.
    RowsChanged { revision: u64 },
    /// A mutation failed. Its optimistic state has already been rolled back.
    MutationFailed {
        id: EntityId,
        kind: MutationKind,
        error: CollectionError,
    },
    /// Another actor changed a row while a local mutation on it was pending.
    ChangedElsewhere { id: EntityId },
    /// The store was rebuilt from a full re-fetch.
    Resynced { count: usize },
}
