use crate::projection::{SortDirection, SortKey};
use serde::{Deserialize, Serialize};

/// Ephemeral view inputs. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewState {
    pub search_text: String,
    pub sort_key: SortKey,
    pub sort_direction: SortDirection,
    pub page_index: usize,
    pub page_size: usize,
}

impl ViewState {
    pub fn new(sort_key: SortKey, page_size: usize) -> Self {
        Self {
            search_text: String::new(),
            sort_key,
            sort_direction: SortDirection::Ascending,
            page_index: 0,
            page_size,
        }
    }
}
