// ============================================================================
// src/projection/sort.rs - Row ordering for the projection
// ============================================================================
//
// - Textual keys: case-folded comparison first, raw text second
// - Aggregate key: joined numeric value, missing entries count as zero
// - Direction is applied by reversing the key comparison
// - Ties always fall back to the entity id (ascending) so the order is total
//   and identical across recomputes
//
// ============================================================================

use crate::aggregate::SecondaryAggregate;
use crate::core::{Entity, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// SORT KEY / DIRECTION
// ============================================================================

/// Column the projection is ordered by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortKey {
    /// An entity field, compared with [`Value::sort_cmp`]. Missing fields
    /// are null and sort after every value when ascending.
    Field(String),
    /// The value joined from the secondary aggregate.
    Aggregate,
}

impl SortKey {
    pub fn field(name: &str) -> Self {
        Self::Field(name.to_string())
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, "{name}"),
            Self::Aggregate => write!(f, "<aggregate>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn toggled(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Ascending => ordering,
            Self::Descending => ordering.reverse(),
        }
    }
}

// ============================================================================
// ROW COMPARATOR
// ============================================================================

/// Compares two entities for one sort key and direction.
pub struct RowComparator<'a> {
    key: &'a SortKey,
    direction: SortDirection,
    aggregate: &'a SecondaryAggregate,
}

impl<'a> RowComparator<'a> {
    pub fn new(key: &'a SortKey, direction: SortDirection, aggregate: &'a SecondaryAggregate) -> Self {
        Self {
            key,
            direction,
            aggregate,
        }
    }

    pub fn compare(&self, left: &Entity, right: &Entity) -> Ordering {
        let ordering = match self.key {
            SortKey::Field(name) => {
                let left_value = left.field(name).unwrap_or(&Value::Null);
                let right_value = right.field(name).unwrap_or(&Value::Null);
                left_value.sort_cmp(right_value)
            }
            SortKey::Aggregate => self
                .aggregate
                .value_or_zero(&left.id)
                .cmp(&self.aggregate.value_or_zero(&right.id)),
        };

        self.direction
            .apply(ordering)
            .then_with(|| left.id.cmp(&right.id))
    }
}

// ============================================================================
// SORT EXECUTOR
// ============================================================================

pub struct SortExecutor;

impl SortExecutor {
    /// Sort in place. The comparator is total, so stability does not matter
    /// for the result; `sort_unstable_by` is used for speed.
    pub fn sort(
        rows: &mut [&Entity],
        key: &SortKey,
        direction: SortDirection,
        aggregate: &SecondaryAggregate,
    ) {
        if rows.len() < 2 {
            return;
        }
        let comparator = RowComparator::new(key, direction, aggregate);
        rows.sort_unstable_by(|left, right| comparator.compare(left, right));
    }
}

// ============================================================================
// TESTS
// ============================================================================
