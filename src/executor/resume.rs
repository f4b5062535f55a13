//! Resume of aborted backups.
//!
//! A fatal error leaves `backup.tmp` on disk. When the next backup is
//! compatible with what the aborted one was producing, its already-copied
//! files are kept and marked so the planner can skip them; everything else in
//! the temp tree is deleted.

use std::path::Path;

use tracing::{info, warn};

use crate::config::BackupType;
use crate::fs::{NodeKind, PathRoot, Storage};
use crate::manifest::store::{self, MANIFEST_FILE};
use crate::manifest::{
    file_section, link_section, path_section, Manifest, Value, ATTR_COMPRESS,
    ATTR_LINK_DESTINATION, ATTR_MODIFICATION_TIME, ATTR_REFERENCE, ATTR_SIZE,
    SECTION_BACKUP_OPTION,
};
use crate::utils::errors::Result;

/// Engine version marker file inside a backup directory.
pub const VERSION_FILE: &str = "version";

#[derive(Debug, Default)]
pub struct ResumeReport {
    /// An aborted backup was found and its temp tree reused
    pub resumed: bool,
    /// Temp files kept and marked for the planner
    pub kept: usize,
    /// Temp entries deleted
    pub removed: usize,
}

/// Inspect `backup.tmp`, reuse it when safe, and leave it empty but present
/// otherwise.
pub fn check<S: Storage>(storage: &S, manifest: &mut Manifest) -> Result<ResumeReport> {
    let tmp = storage.path(PathRoot::BackupTmp, "");

    if !storage.exists(&tmp)? {
        storage.path_create(&tmp, None)?;
        return Ok(ResumeReport::default());
    }

    let usable = match store::load(&tmp.join(MANIFEST_FILE)) {
        Ok(aborted) => is_usable(&aborted, manifest),
        Err(e) => {
            warn!(error = %e, "aborted backup manifest could not be read");
            false
        }
    };

    if !usable {
        warn!(
            "aborted backup in '{}' cannot be reused, removing",
            tmp.display()
        );
        storage.remove_path(&tmp, true)?;
        storage.path_create(&tmp, None)?;
        return Ok(ResumeReport::default());
    }

    info!("resuming aborted backup found in '{}'", tmp.display());
    clean(storage, manifest, &tmp)
}

/// An aborted backup is usable iff it was produced by the same engine
/// version and is of the same shape: both full, or same type with the same
/// prior. Attributes are read as real values; a missing attribute matches
/// nothing but another missing attribute.
fn is_usable(aborted: &Manifest, current: &Manifest) -> bool {
    if aborted.version() != current.version() || aborted.version().is_none() {
        return false;
    }

    let full = Some(BackupType::Full.as_str());
    if aborted.backup_type() == full && current.backup_type() == full {
        return true;
    }

    aborted.backup_type().is_some()
        && aborted.backup_type() == current.backup_type()
        && aborted.prior() == current.prior()
}

fn clean<S: Storage>(storage: &S, manifest: &mut Manifest, tmp: &Path) -> Result<ResumeReport> {
    // WAL and the tablespace link farm are always rebuilt
    for rel in ["base/pg_xlog", "base/pg_tblspc"] {
        let path = tmp.join(rel);
        if storage.exists(&path)? {
            storage.remove_path(&path, true)?;
        }
    }

    let compress = manifest
        .scalar(SECTION_BACKUP_OPTION, ATTR_COMPRESS)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let ext_suffix = format!(".{}", storage.compress_extension());

    let mut report = ResumeReport {
        resumed: true,
        ..Default::default()
    };

    let tree = storage.manifest(tmp)?;

    // Reverse-lexicographic: children drain before their directories
    for (name, info) in tree.iter().rev() {
        if name == MANIFEST_FILE || name == VERSION_FILE {
            continue;
        }

        let keep = match info.kind {
            NodeKind::Dir => keep_dir(manifest, name),
            NodeKind::Link => keep_link(manifest, name, info.link_destination.as_deref()),
            NodeKind::File | NodeKind::Other => {
                match keep_file(manifest, name, info, compress, &ext_suffix) {
                    Some((section, key)) => {
                        manifest.mark_exists(&section, &key);
                        true
                    }
                    None => false,
                }
            }
        };

        if keep {
            if info.kind == NodeKind::File {
                report.kept += 1;
            }
        } else {
            match info.kind {
                NodeKind::Dir => storage.remove_path(&tmp.join(name), false)?,
                _ => storage.remove_file(&tmp.join(name))?,
            }
            report.removed += 1;
        }
    }

    info!(
        kept = report.kept,
        removed = report.removed,
        "temp backup cleaned"
    );
    Ok(report)
}

/// Split a temp-relative name into its manifest level and key.
/// `None` for level roots and anything that does not belong to a level.
fn address(name: &str) -> Option<(String, String)> {
    if let Some(key) = name.strip_prefix("base/") {
        return Some(("base".to_string(), key.to_string()));
    }
    let rest = name.strip_prefix("tablespace/")?;
    let (ts_name, key) = rest.split_once('/')?;
    Some((format!("tablespace:{ts_name}"), key.to_string()))
}

fn keep_dir(manifest: &Manifest, name: &str) -> bool {
    // level roots
    if name == "base" {
        return true;
    }
    if name == "tablespace" {
        return manifest.levels().iter().any(|l| l.starts_with("tablespace:"));
    }
    if let Some(ts_name) = name.strip_prefix("tablespace/") {
        if !ts_name.contains('/') {
            return manifest.levels().contains(&format!("tablespace:{ts_name}"));
        }
    }

    match address(name) {
        Some((level, key)) => manifest.has_key(&path_section(&level), &key),
        None => false,
    }
}

fn keep_link(manifest: &Manifest, name: &str, destination: Option<&str>) -> bool {
    let Some((level, key)) = address(name) else {
        return false;
    };
    manifest.get_text(&link_section(&level), &key, ATTR_LINK_DESTINATION) == destination
        && destination.is_some()
}

/// A temp file is kept when the manifest wants this exact file copied and the
/// aborted run already produced it: same modification time and, for
/// uncompressed files, same size. Entries carrying a reference are never kept
/// as physical files (they will be skipped or hard-linked).
fn keep_file(
    manifest: &Manifest,
    name: &str,
    info: &crate::fs::NodeInfo,
    compress: bool,
    ext_suffix: &str,
) -> Option<(String, String)> {
    if info.kind != NodeKind::File {
        return None;
    }

    let (level, key) = address(name)?;
    let key = if compress {
        key.strip_suffix(ext_suffix)?.to_string()
    } else {
        key
    };

    let section = file_section(&level);
    let attrs = manifest.attrs(&section, &key)?;
    if attrs.contains_key(ATTR_REFERENCE) {
        return None;
    }

    let mtime = attrs.get(ATTR_MODIFICATION_TIME).and_then(Value::as_int)?;
    if mtime != info.modification_time {
        return None;
    }
    if !compress {
        let size = attrs.get(ATTR_SIZE).and_then(Value::as_int)?;
        if size != info.size as i64 {
            return None;
        }
    }

    Some((section, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{CopyOptions, LocalStorage};
    use crate::manifest::{ATTR_PATH, ATTR_VERSION, SECTION_BACKUP, SECTION_BACKUP_PATH, ATTR_TYPE, ATTR_PRIOR, LEVEL_BASE};
    use std::fs;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> LocalStorage {
        LocalStorage::new(dir.path().join("db"), dir.path().join("repo"), "main")
    }

    fn base_manifest(backup_type: &str, prior: Option<&str>) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.set_scalar(SECTION_BACKUP, ATTR_VERSION, "0.4.0");
        manifest.set_scalar(SECTION_BACKUP, ATTR_TYPE, backup_type);
        if let Some(prior) = prior {
            manifest.set_scalar(SECTION_BACKUP, ATTR_PRIOR, prior);
        }
        manifest.set_scalar(SECTION_BACKUP_OPTION, ATTR_COMPRESS, false);
        manifest.set(SECTION_BACKUP_PATH, LEVEL_BASE, ATTR_PATH, "/db");
        manifest
    }

    #[test]
    fn test_usability_rules() {
        let current = base_manifest("full", None);
        assert!(is_usable(&base_manifest("full", None), &current));

        // version mismatch
        let mut old = base_manifest("full", None);
        old.set_scalar(SECTION_BACKUP, ATTR_VERSION, "0.3.0");
        assert!(!is_usable(&old, &current));

        // missing version never matches
        let mut blank = base_manifest("full", None);
        blank.remove_key(SECTION_BACKUP, "");
        assert!(!is_usable(&blank, &current));

        // derived backups need identical type and prior
        let current = base_manifest("incr", Some("20240101-000000F"));
        assert!(is_usable(
            &base_manifest("incr", Some("20240101-000000F")),
            &current
        ));
        assert!(!is_usable(
            &base_manifest("incr", Some("20240102-000000F")),
            &current
        ));
        assert!(!is_usable(
            &base_manifest("diff", Some("20240101-000000F")),
            &current
        ));
        assert!(!is_usable(&base_manifest("incr", None), &current));
    }

    #[test]
    fn test_unusable_temp_is_recreated_empty() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        let tmp = s.path(PathRoot::BackupTmp, "");
        fs::create_dir_all(tmp.join("base")).unwrap();
        fs::write(tmp.join("base/junk.dat"), b"junk").unwrap();
        // no manifest at all -> unusable

        let mut manifest = base_manifest("full", None);
        let report = check(&s, &mut manifest).unwrap();

        assert!(!report.resumed);
        assert!(tmp.exists());
        assert!(!tmp.join("base").exists());
    }

    #[test]
    fn test_clean_keeps_matching_files() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        let db = dir.path().join("db");
        fs::create_dir_all(&db).unwrap();
        fs::write(db.join("good.dat"), b"good data").unwrap();

        // manifest wants good.dat (size 9, mtime from copy) and nothing else
        let mut manifest = base_manifest("full", None);
        let info = s.stat(&db.join("good.dat")).unwrap();
        manifest.set("base:file", "good.dat", ATTR_SIZE, info.size);
        manifest.set(
            "base:file",
            "good.dat",
            ATTR_MODIFICATION_TIME,
            info.modification_time,
        );

        // temp tree: the aborted run copied good.dat (mtime preserved),
        // plus stale junk and a stale pg_xlog
        let tmp = s.path(PathRoot::BackupTmp, "");
        fs::create_dir_all(tmp.join("base/pg_xlog")).unwrap();
        fs::write(tmp.join("base/pg_xlog/000000010000000000000001"), b"wal").unwrap();
        s.copy(
            &db.join("good.dat"),
            &tmp.join("base/good.dat"),
            &CopyOptions {
                modification_time: Some(info.modification_time),
                create_dirs: true,
                ..Default::default()
            },
        )
        .unwrap();
        fs::write(tmp.join("base/stale.dat"), b"stale").unwrap();
        store::save(&tmp.join(MANIFEST_FILE), &base_manifest("full", None)).unwrap();

        let report = check(&s, &mut manifest).unwrap();

        assert!(report.resumed);
        assert_eq!(report.kept, 1);
        assert!(tmp.join("base/good.dat").exists());
        assert!(!tmp.join("base/stale.dat").exists());
        assert!(!tmp.join("base/pg_xlog").exists());
        assert!(manifest.is_marked_exists("base:file", "good.dat"));
    }

    #[test]
    fn test_clean_removes_referenced_temp_copies() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);

        let mut manifest = base_manifest("incr", Some("20240101-000000F"));
        manifest.set("base:file", "same.dat", ATTR_SIZE, 4u64);
        manifest.set("base:file", "same.dat", ATTR_MODIFICATION_TIME, 1000i64);
        manifest.set("base:file", "same.dat", ATTR_REFERENCE, "20240101-000000F");

        let tmp = s.path(PathRoot::BackupTmp, "");
        fs::create_dir_all(tmp.join("base")).unwrap();
        fs::write(tmp.join("base/same.dat"), b"data").unwrap();
        store::save(
            &tmp.join(MANIFEST_FILE),
            &base_manifest("incr", Some("20240101-000000F")),
        )
        .unwrap();

        let report = check(&s, &mut manifest).unwrap();

        assert!(report.resumed);
        // the stale physical copy must not shadow the reference
        assert!(!tmp.join("base/same.dat").exists());
        assert!(!manifest.is_marked_exists("base:file", "same.dat"));
        assert_eq!(report.kept, 0);
    }
}
