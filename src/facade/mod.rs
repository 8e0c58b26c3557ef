//! `LiveCollection`: the engine as seen from the view layer.

mod collection;
mod events;

pub use collection::{LiveCollection, LiveCollectionBuilder};
pub use events::ViewEvent;
