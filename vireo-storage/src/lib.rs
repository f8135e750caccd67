//! # Vireo Storage
//!
//! Persistent block store for broker destinations.
//!
//! Every destination owns two files: an allocation table describing each
//! fixed-size block, and a data file holding block contents. Variable-length
//! entries span a chain of blocks. Writes go straight to the files, or,
//! with journaling enabled, through a write-ahead journal that a background
//! flusher commits in group waves and replays after a crash.
//!
//! - [`block`]: allocation table, files, locks and the [`BlockStore`] facade
//! - [`journal`]: journal records, files, flusher and recovery
//! - [`message_store`]: message queue semantics over a block store
//!
//! ```no_run
//! use vireo_core::DestinationDescriptor;
//! use vireo_storage::BlockStore;
//!
//! let store = BlockStore::open(DestinationDescriptor::new("orders", "/var/lib/vireo")).unwrap();
//! let handle = store.store(b"payload").unwrap();
//! store.commit_changes().unwrap();
//! assert_eq!(&store.retrieve(handle).unwrap()[..], b"payload");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod error;
pub mod journal;
pub mod message_store;

pub use block::{BlockStore, IntegrityReport};
pub use error::{StorageError, StorageResult};
pub use journal::{JournalStats, RecoveryReport};
pub use message_store::{MessageStore, StoredMessage};
