//! Secondary aggregate: a per-entity number (e.g. product count per
//! category) fetched independently and joined into the projection.
//!
//! It is outside the store's consistency domain. Staleness is tolerated up
//! to the configured stale time, and a delete only invalidates it.

use crate::core::EntityId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecondaryAggregate {
    values: HashMap<EntityId, i64>,
}

impl SecondaryAggregate {
    pub fn from_values(values: HashMap<EntityId, i64>) -> Self {
        Self { values }
    }

    pub fn get(&self, id: &EntityId) -> Option<i64> {
        self.values.get(id).copied()
    }

    pub fn value_or_zero(&self, id: &EntityId) -> i64 {
        self.get(id).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Cached aggregate plus its refresh bookkeeping.
#[derive(Debug, Clone)]
pub struct AggregateCache {
    aggregate: SecondaryAggregate,
    fetched_at: Option<DateTime<Utc>>,
    stale_after: Duration,
    invalidated: bool,
    revision: u64,
}

impl AggregateCache {
    pub fn new(stale_after: std::time::Duration) -> Self {
        Self {
            aggregate: SecondaryAggregate::default(),
            fetched_at: None,
            stale_after: Duration::from_std(stale_after).unwrap_or_else(|_| Duration::days(36_500)),
            invalidated: false,
            revision: 0,
        }
    }

    pub fn aggregate(&self) -> &SecondaryAggregate {
        &self.aggregate
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    /// Incremented whenever new values are installed.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Never fetched, explicitly invalidated, or older than the stale time.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.fetched_at {
            None => true,
            Some(_) if self.invalidated => true,
            Some(fetched_at) => now - fetched_at >= self.stale_after,
        }
    }

    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn install(&mut self, values: HashMap<EntityId, i64>, now: DateTime<Utc>) {
        self.aggregate = SecondaryAggregate::from_values(values);
        self.fetched_at = Some(now);
        self.invalidated = false;
        self.revision += 1;
    }
}
