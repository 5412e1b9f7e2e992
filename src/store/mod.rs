//! In-memory document collections with a Mongo-style query subset and
//! pluggable durable backends.

mod backend;
mod collection;
pub mod pipeline;
pub mod query;
pub mod update;

pub use backend::{MemoryBackend, SledBackend, StorageBackend};
pub use collection::{Collection, ReturnDocument};
pub use pipeline::{FindOptions, SortOrder, SortSpec};
