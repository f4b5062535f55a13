//! The injected filesystem primitive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::utils::errors::Result;

/// Logical roots the engine addresses paths against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// The cluster data directory
    DbAbsolute,
    /// The backup repository root
    BackupAbsolute,
    /// `<repository>/<cluster>`, where published backups live
    BackupCluster,
    /// `<repository>/<cluster>/backup.tmp`, the in-progress backup
    BackupTmp,
    /// `<repository>/<cluster>/archive`, the WAL archive
    BackupArchive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Link,
    /// Sockets, fifos and other special files the engine refuses to back up
    Other,
}

/// Stat result for one tree entry.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub user: String,
    pub group: String,
    /// Octal mode string, e.g. `0600`
    pub permission: String,
    pub size: u64,
    pub inode: u64,
    /// Seconds since the Unix epoch
    pub modification_time: i64,
    pub link_destination: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Source is compressed and must be decompressed while reading
    pub src_compressed: bool,
    /// Compress the destination (the compress extension is appended)
    pub dst_compress: bool,
    /// A missing source is reported as [`CopyOutcome::SourceMissing`]
    /// instead of an error
    pub ignore_missing: bool,
    /// Octal mode to apply to the destination
    pub permission: Option<String>,
    /// Modification time to apply to the destination
    pub modification_time: Option<i64>,
    /// Create missing parent directories of the destination
    pub create_dirs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    SourceMissing,
}

/// Filesystem operations the engine needs.
///
/// Workers receive their own instance via [`Storage::clone_for_worker`]; the
/// trait holds no shared mutable state across clones.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Resolve a relative path against a logical root.
    fn path(&self, root: PathRoot, rel: &str) -> PathBuf;

    /// Extension appended to compressed files (without the dot).
    fn compress_extension(&self) -> &str;

    /// List the entry names of a directory, optionally filtered by an
    /// anchored regex, in the requested order.
    fn list(&self, path: &Path, filter: Option<&Regex>, order: SortOrder) -> Result<Vec<String>>;

    /// Stat a single path.
    fn stat(&self, path: &Path) -> Result<NodeInfo>;

    /// Recursively stat a directory tree. Keys are slash-separated paths
    /// relative to `path`, sorted by name; the root itself is not included.
    /// Symbolic links are reported, never followed.
    fn manifest(&self, path: &Path) -> Result<BTreeMap<String, NodeInfo>>;

    /// Copy `src` to `dst`, honoring the compression, permission and
    /// timestamp options. `dst` is named without the compress extension;
    /// it is appended when `dst_compress` is set.
    fn copy(&self, src: &Path, dst: &Path, options: &CopyOptions) -> Result<CopyOutcome>;

    /// SHA-256 of the (decompressed, when `compressed`) content at `path`.
    fn hash(&self, path: &Path, compressed: bool) -> Result<String>;

    /// Compress a file in place, replacing it with `<path>.<ext>`.
    fn compress_file(&self, path: &Path) -> Result<()>;

    /// Create a hard or symbolic link at `dst` pointing to `src`.
    fn link_create(&self, src: &Path, dst: &Path, hard: bool, ignore_existing: bool)
        -> Result<()>;

    /// Create a directory (and parents), optionally with an octal mode.
    fn path_create(&self, path: &Path, permission: Option<&str>) -> Result<()>;

    /// Rename `src` to `dst` (atomic within a filesystem).
    fn rename(&self, src: &Path, dst: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> Result<bool>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Remove a directory; `recursive` removes contents first.
    fn remove_path(&self, path: &Path, recursive: bool) -> Result<()>;

    fn read_to_string(&self, path: &Path) -> Result<String>;

    fn write_string(&self, path: &Path, contents: &str) -> Result<()>;

    /// An independent instance for worker `worker`; no state is shared with
    /// the original.
    fn clone_for_worker(&self, worker: usize) -> Self;
}
