//! Block-based entry storage.
//!
//! - [`allocation`]: in-memory allocation table and its on-disk encoding
//! - [`files`]: allocation table and data file handles
//! - [`dirty`]: cache of block contents not yet applied from the journal
//! - [`integrity`]: consistency check run on open
//! - [`locks`]: per-block lock bits
//! - [`store`]: the [`BlockStore`] facade

pub mod allocation;
pub mod dirty;
pub mod files;
pub mod integrity;
pub mod locks;
mod sink;
pub mod store;

pub use allocation::{AllocationTable, AtRecord, BlockFlags, MetadataWrite, NO_BLOCK};
pub use dirty::DirtyBlockTable;
pub use files::StoreFiles;
pub use integrity::{check_integrity, IntegrityReport};
pub use locks::BlockLocks;
pub use store::BlockStore;
