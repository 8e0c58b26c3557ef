//! Derived projection: filter, sort and paginate the store's snapshot.

mod engine;
pub mod sort;

pub use engine::{
    ProjectedPage, ProjectedRow, ProjectionEngine, clamp_page_index, total_pages,
};
pub use sort::{RowComparator, SortDirection, SortExecutor, SortKey};
