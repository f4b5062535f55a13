//! Retention enforcement over backups and the WAL archive.
//!
//! Applied after a backup is published. Full retention cascades onto derived
//! backups; deletions run in reverse label order so an interrupted pass never
//! leaves a diff or incr without its full ancestor. WAL retention prunes the
//! archive back to the `archive-start` of an anchor backup.

use regex::Regex;

use tracing::{info, warn};

use crate::config::{BackupType, RetentionConfig};
use crate::fs::{PathRoot, SortOrder, Storage};
use crate::label;
use crate::manifest::store::{self, MANIFEST_FILE};
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Default)]
pub struct ExpireSummary {
    pub backups_removed: Vec<String>,
    pub archive_dirs_removed: usize,
    pub archive_files_removed: usize,
}

/// Standalone retention invocation, for callers that expire outside of a
/// backup run.
pub struct ExpireCommand<S> {
    storage: S,
    retention: RetentionConfig,
}

impl<S: Storage> ExpireCommand<S> {
    pub fn new(storage: S, retention: RetentionConfig) -> Self {
        Self { storage, retention }
    }

    pub fn run(&self) -> Result<ExpireSummary> {
        expire(&self.storage, &self.retention)
    }
}

/// Apply full, differential and WAL archive retention.
pub fn expire<S: Storage>(storage: &S, retention: &RetentionConfig) -> Result<ExpireSummary> {
    retention.validate()?;

    let mut summary = ExpireSummary::default();
    expire_full(storage, retention, &mut summary)?;
    expire_diff(storage, retention, &mut summary)?;
    expire_archive(storage, retention, &mut summary)?;
    Ok(summary)
}

fn list_backups<S: Storage>(
    storage: &S,
    include_full: bool,
    include_diff: bool,
    include_incr: bool,
) -> Result<Vec<String>> {
    let cluster = storage.path(PathRoot::BackupCluster, "");
    if !storage.exists(&cluster)? {
        return Ok(Vec::new());
    }
    let pattern = label::predicate(include_full, include_diff, include_incr)?;
    storage.list(&cluster, Some(&pattern), SortOrder::Reverse)
}

/// Remove one backup. The manifest goes first so a half-deleted tree is
/// never mistaken for a valid backup.
fn remove_backup<S: Storage>(
    storage: &S,
    label: &str,
    summary: &mut ExpireSummary,
) -> Result<()> {
    info!(backup = label, "expiring backup");
    let path = storage.path(PathRoot::BackupCluster, label);
    let manifest_path = path.join(MANIFEST_FILE);
    if storage.exists(&manifest_path)? {
        storage.remove_file(&manifest_path)?;
    }
    storage.remove_path(&path, true)?;
    summary.backups_removed.push(label.to_string());
    Ok(())
}

/// Keep the most recent `retention.full` full backups; every older full is
/// deleted together with all backups derived from it, newest first.
fn expire_full<S: Storage>(
    storage: &S,
    retention: &RetentionConfig,
    summary: &mut ExpireSummary,
) -> Result<()> {
    let Some(keep) = retention.full else {
        return Ok(());
    };

    let fulls = list_backups(storage, true, false, false)?;
    let all = list_backups(storage, true, true, true)?;

    for full in fulls.iter().skip(keep as usize) {
        // derived backups share the full's 16-char prefix and sort above it,
        // so the reverse-ordered walk deletes them before their ancestor
        for derived in all.iter().filter(|b| {
            *b != full && label::full_prefix(b) == full.as_str()
        }) {
            remove_backup(storage, derived, summary)?;
        }
        remove_backup(storage, full, summary)?;
    }

    Ok(())
}

/// Keep the most recent `retention.diff` differentials; every diff or incr
/// older than the oldest kept differential is deleted.
fn expire_diff<S: Storage>(
    storage: &S,
    retention: &RetentionConfig,
    summary: &mut ExpireSummary,
) -> Result<()> {
    let Some(keep) = retention.diff else {
        return Ok(());
    };

    let diffs = list_backups(storage, false, true, false)?;
    let Some(boundary) = diffs.get(keep as usize - 1) else {
        return Ok(());
    };

    for derived in list_backups(storage, false, true, true)? {
        if derived.as_str() < boundary.as_str() {
            remove_backup(storage, &derived, summary)?;
        }
    }

    Ok(())
}

/// Prune the WAL archive back to the `archive-start` of the anchor backup:
/// the `retention.archive_count`-th most recent backup of the configured
/// type, falling back to the oldest full.
fn expire_archive<S: Storage>(
    storage: &S,
    retention: &RetentionConfig,
    summary: &mut ExpireSummary,
) -> Result<()> {
    let Some(archive_type) = retention.archive_type else {
        info!("option 'retention.archive_type' not set - the WAL archive will not be pruned");
        return Ok(());
    };
    let count = retention
        .archive_count
        .ok_or_else(|| EngineError::Config("retention.archive_count not set".to_string()))?;

    let candidates = match archive_type {
        BackupType::Full => list_backups(storage, true, false, false)?,
        BackupType::Diff => list_backups(storage, false, true, false)?,
        BackupType::Incr => list_backups(storage, false, false, true)?,
    };

    let mut anchor = candidates.get(count as usize - 1).cloned();
    if anchor.is_none() && archive_type == BackupType::Full {
        anchor = candidates.last().cloned();
    }
    let Some(anchor) = anchor else {
        info!("no backup found to anchor WAL retention - keeping all archive");
        return Ok(());
    };

    let manifest_path = storage
        .path(PathRoot::BackupCluster, &anchor)
        .join(MANIFEST_FILE);
    let manifest = store::load(&manifest_path)?;
    let Some(archive_start) = manifest.archive_start().map(str::to_string) else {
        warn!(
            backup = %anchor,
            "anchor backup has no archive-start - keeping all archive"
        );
        return Ok(());
    };
    if archive_start.len() < 24 {
        return Err(EngineError::Assert(format!(
            "invalid archive-start '{archive_start}' on backup '{anchor}'"
        )));
    }

    info!(anchor = %anchor, archive_start = %archive_start, "pruning WAL archive");

    let boundary_dir = &archive_start[..16];
    let archive_root = storage.path(PathRoot::BackupArchive, "");
    if !storage.exists(&archive_root)? {
        return Ok(());
    }

    let major_pattern = Regex::new("^[0-9A-F]{16}$").expect("archive dir regex");
    for dir in storage.list(&archive_root, Some(&major_pattern), SortOrder::Forward)? {
        if dir.as_str() < boundary_dir {
            storage.remove_path(&archive_root.join(&dir), true)?;
            summary.archive_dirs_removed += 1;
        } else if dir == boundary_dir {
            let dir_path = archive_root.join(&dir);
            for file in storage.list(&dir_path, None, SortOrder::Forward)? {
                let Some(prefix) = file.get(..24) else {
                    continue;
                };
                if prefix < &archive_start[..24] {
                    storage.remove_file(&dir_path.join(&file))?;
                    summary.archive_files_removed += 1;
                }
            }
        }
    }

    Ok(())
}
