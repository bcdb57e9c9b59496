//! Persistent ledger of tracked media items.
//!
//! One record per logical file path, stored in a tantivy index with a
//! revision used for optimistic concurrency. [`TrackedItems::upsert`] is the
//! safe read-modify-write entry point; [`TrackedItems::put`] is the raw
//! revision-checked write.

mod error;
mod item;
mod schema;
mod store;

pub use error::{LedgerError, LedgerResult};
pub use item::{ItemFilter, Revision, TrackedMediaItem};
pub use schema::LedgerSchema;
pub use store::{DEFAULT_WRITER_HEAP_BYTES, TrackedItems};
