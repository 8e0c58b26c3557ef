pub mod clock;
pub mod error;
pub mod types;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CollectionError, Result};
pub use types::{
    ACTIVE_FIELD, Entity, EntityDraft, EntityId, Fields, ORDER_FIELD, PARENT_FIELD, RenderKey,
};
pub use value::Value;
