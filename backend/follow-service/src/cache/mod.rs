pub mod counter_cache;

pub use counter_cache::{CounterCache, CounterLookup};
