//! # activity-feed
//!
//! Polling change capture over a set of document collections (bookmarks,
//! reviews, ratings), merged into one live activity stream per subscriber.
//!
//! ## Core Concepts
//!
//! - **Cursor**: the highest sequence number of a source already delivered,
//!   persisted per source in a key/value store
//! - **Source Poller**: fetches records past the cursor, advances the cursor,
//!   and emits activities
//! - **Fan-In**: one bounded queue that every poller of a session feeds
//! - **Session**: the pollers and queue owned by one subscriber connection
//!
//! ## Usage
//!
//! ```rust,ignore
//! use activity_feed::{ActivityFeed, FeedConfig, InMemoryStores};
//!
//! let stores = InMemoryStores::new();
//! let feed = ActivityFeed::from_memory(&stores, FeedConfig::default())?;
//! let mut session = feed.open_session().await?;
//! while let Some(event) = session.next().await {
//!     println!("{:?}", event?);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod activity;
pub mod config;
pub mod error;
pub mod logging;
pub mod record;
pub mod transform;

// Storage and write path
pub mod storage;
pub mod writer;

// Streaming
pub mod fanin;
pub mod feed;
pub mod poller;
pub mod session;

#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use activity::{ActivityEvent, ActivityPayload, ActivityType};
pub use config::FeedConfig;
pub use error::{FeedError, FeedResult, RecordError};
pub use feed::{ActivityFeed, SourceSet};
pub use poller::{BatchOutcome, PollerConfig, PollerStats, SourcePoller};
pub use record::{Document, MonotonicSeq, SourceKind, SourceRecord};
pub use session::{SessionId, SessionState, ShutdownReport, StreamSession};
pub use storage::{
    CursorKey, CursorStore, DocumentSource, InMemoryCollection, InMemoryCursorStore, InMemoryStores, StorageError,
    WritableSource,
};
pub use writer::SequencedWriter;
