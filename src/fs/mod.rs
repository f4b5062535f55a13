//! Filesystem abstraction for the backup engine.
//!
//! All repository and cluster I/O goes through the [`Storage`](storage::Storage)
//! trait so a future remote transport can slot in behind the same surface.

pub mod local;
pub mod storage;

pub use local::LocalStorage;
pub use storage::{CopyOptions, CopyOutcome, NodeInfo, NodeKind, PathRoot, SortOrder, Storage};
