//! Storage collaborators of the activity feed.
//!
//! The core only depends on the traits in this module. Backends:
//! - in-memory (always available)
//! - Redis cursor store (feature `redis`)
//! - PostgreSQL document sources (feature `postgres`)

mod memory;
mod traits;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
mod redis_cursor;

pub use memory::{InMemoryCollection, InMemoryCursorStore, InMemoryStores};
pub use traits::{CursorKey, CursorStore, DocumentSource, StorageError, WritableSource};

#[cfg(feature = "postgres")]
pub use postgres::PgDocumentSource;
#[cfg(feature = "redis")]
pub use redis_cursor::RedisCursorStore;
