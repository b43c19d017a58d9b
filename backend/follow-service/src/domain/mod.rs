pub mod edge;
pub mod profile;

pub use edge::{CursorError, Edge, EdgeCursor, EdgePage, PageRequest};
pub use profile::{CounterApplication, CounterDelta, CounterField, Profile, UserCounters};
