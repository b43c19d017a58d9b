mod memory;
mod postgres_repository;
mod r#trait;
mod user_directory;

pub use memory::{InMemoryRelationStore, InMemoryUserDirectory};
pub use postgres_repository::PostgresRelationStore;
pub use r#trait::{CounterStore, RelationStore, UserDirectory};
pub use user_directory::PostgresUserDirectory;

#[cfg(test)]
pub use r#trait::{MockCounterStore, MockRelationStore, MockUserDirectory};
