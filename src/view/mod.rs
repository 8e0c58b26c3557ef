//! View controller: owns the view state and its reset rules.
//!
//! - search text, sort key or sort direction change: back to page 0
//! - page size change: keep the first visible row on screen
//! - sorting the current column again flips direction, a new column starts
//!   ascending

mod state;

pub use state::ViewState;

use crate::core::{CollectionError, Result};
use crate::projection::{SortDirection, SortKey, clamp_page_index};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    Idle,
    Recomputing,
}

#[derive(Debug, Clone)]
pub struct ViewController {
    state: ViewState,
    phase: ViewPhase,
}

impl ViewController {
    pub fn new(state: ViewState) -> Self {
        Self {
            state,
            phase: ViewPhase::Idle,
        }
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn phase(&self) -> ViewPhase {
        self.phase
    }

    /// Returns true when the text actually changed.
    pub fn set_search_text(&mut self, text: &str) -> bool {
        if self.state.search_text == text {
            return false;
        }
        self.state.search_text = text.to_string();
        self.state.page_index = 0;
        true
    }

    /// Sorting the current column flips direction; a new column starts
    /// ascending. Either way the view returns to page 0.
    pub fn set_sort(&mut self, key: SortKey) {
        if self.state.sort_key == key {
            self.state.sort_direction = self.state.sort_direction.toggled();
        } else {
            self.state.sort_key = key;
            self.state.sort_direction = SortDirection::Ascending;
        }
        self.state.page_index = 0;
    }

    pub fn set_sort_direction(&mut self, direction: SortDirection) {
        if self.state.sort_direction != direction {
            self.state.sort_direction = direction;
            self.state.page_index = 0;
        }
    }

    /// Out-of-range indices are clamped, never rejected.
    pub fn set_page_index(&mut self, page_index: usize, filtered_count: usize) {
        self.state.page_index = clamp_page_index(page_index, filtered_count, self.state.page_size);
    }

    /// Keeps the first visible row on screen:
    /// `new_index = floor(first_visible / new_size)`, clamped.
    pub fn set_page_size(&mut self, page_size: usize, filtered_count: usize) -> Result<()> {
        if page_size == 0 {
            return Err(CollectionError::Validation("page size must be > 0".to_string()));
        }
        let current = clamp_page_index(self.state.page_index, filtered_count, self.state.page_size);
        let first_visible = current * self.state.page_size;

        self.state.page_size = page_size;
        self.state.page_index = clamp_page_index(first_visible / page_size, filtered_count, page_size);
        Ok(())
    }

    /// Keep the stored index inside the range the projection clamps to.
    pub fn clamp_to(&mut self, filtered_count: usize) {
        self.state.page_index =
            clamp_page_index(self.state.page_index, filtered_count, self.state.page_size);
    }

    /// Run a projection with the phase set to `Recomputing`.
    pub fn recompute<T>(&mut self, project: impl FnOnce(&ViewState) -> T) -> T {
        self.phase = ViewPhase::Recomputing;
        let output = project(&self.state);
        self.phase = ViewPhase::Idle;
        output
    }
}
