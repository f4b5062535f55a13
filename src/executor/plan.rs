//! Copy planning.
//!
//! Classifies every file entry of the manifest and emits a deterministic,
//! size-aware job list for the executor. Entries referencing a prior backup
//! need no copy at all (or a hard link when hard-link mode is on); entries
//! whose temp file survived a resume clean need at most a fresh checksum.

use std::path::PathBuf;

use crate::fs::{PathRoot, Storage};
use crate::manifest::{
    file_section, level_root, Manifest, ATTR_MODIFICATION_TIME, ATTR_PERMISSION, ATTR_REFERENCE,
    ATTR_SIZE, SECTION_BACKUP_PATH, ATTR_PATH,
};
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyClass {
    /// Content is reachable through a reference or already present in temp
    Skip,
    /// Hard-link from the referenced backup
    Link,
    /// Re-hash the file already present in temp
    ChecksumOnly,
    /// Copy from the cluster
    Copy,
}

/// One unit of executor work. Paths are named without the compress
/// extension; it is applied at execution time.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub class: CopyClass,
    pub section: String,
    pub key: String,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub size: u64,
    pub permission: Option<String>,
    pub modification_time: Option<i64>,
    pub tablespace_idx: usize,
    pub seq: usize,
}

#[derive(Debug, Clone)]
pub struct LinkJob {
    pub source: PathBuf,
    pub dest: PathBuf,
}

#[derive(Debug, Default)]
pub struct CopyPlan {
    /// Copy and ChecksumOnly jobs, ordered by (tablespace, size, sequence)
    pub jobs: Vec<CopyJob>,
    pub links: Vec<LinkJob>,
    pub skipped: usize,
    /// Total source bytes the copy jobs will move
    pub copy_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    pub compress: bool,
    pub checksum: bool,
    pub hardlink: bool,
}

pub fn build_plan<S: Storage>(
    storage: &S,
    manifest: &Manifest,
    options: &PlanOptions,
) -> Result<CopyPlan> {
    let mut plan = CopyPlan::default();

    for (tablespace_idx, level) in manifest.levels().into_iter().enumerate() {
        let section = file_section(&level);
        let root = level_root(&level);
        let source_root = manifest
            .get_text(SECTION_BACKUP_PATH, &level, ATTR_PATH)
            .map(PathBuf::from)
            .ok_or_else(|| {
                EngineError::Assert(format!("level '{level}' has no source path"))
            })?;

        for (seq, (key, attrs)) in manifest.entries(&section).enumerate() {
            let size = attrs.get(ATTR_SIZE).and_then(|v| v.as_int()).unwrap_or(0) as u64;
            let reference = attrs.get(ATTR_REFERENCE).and_then(|v| v.as_text());
            let exists = manifest.is_marked_exists(&section, key);
            let dest_rel = format!("{root}/{key}");

            if let Some(reference) = reference {
                if options.hardlink {
                    plan.links.push(LinkJob {
                        source: storage
                            .path(PathRoot::BackupCluster, &format!("{reference}/{dest_rel}")),
                        dest: storage.path(PathRoot::BackupTmp, &dest_rel),
                    });
                } else {
                    plan.skipped += 1;
                }
                continue;
            }

            if exists && !(options.checksum && options.hardlink) {
                plan.skipped += 1;
                continue;
            }

            let class = if exists {
                CopyClass::ChecksumOnly
            } else {
                CopyClass::Copy
            };
            if class == CopyClass::Copy {
                plan.copy_bytes += size;
            }

            plan.jobs.push(CopyJob {
                class,
                section: section.clone(),
                key: key.clone(),
                source: source_root.join(key),
                dest: storage.path(PathRoot::BackupTmp, &dest_rel),
                size,
                permission: attrs
                    .get(ATTR_PERMISSION)
                    .and_then(|v| v.as_text())
                    .map(str::to_string),
                modification_time: attrs.get(ATTR_MODIFICATION_TIME).and_then(|v| v.as_int()),
                tablespace_idx,
                seq,
            });
        }
    }

    // deterministic, size-aware iteration order
    plan.jobs
        .sort_by(|a, b| {
            (a.tablespace_idx, a.size, a.seq).cmp(&(b.tablespace_idx, b.size, b.seq))
        });

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalStorage;
    use crate::manifest::{LEVEL_BASE, SECTION_BACKUP_PATH};
    use tempfile::TempDir;

    fn manifest_with_files(files: &[(&str, u64, Option<&str>)]) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.set(SECTION_BACKUP_PATH, LEVEL_BASE, ATTR_PATH, "/db");
        for (key, size, reference) in files {
            manifest.set("base:file", key, ATTR_SIZE, *size);
            manifest.set("base:file", key, ATTR_MODIFICATION_TIME, 1000i64);
            manifest.set("base:file", key, ATTR_PERMISSION, "0600");
            if let Some(r) = reference {
                manifest.set("base:file", key, ATTR_REFERENCE, *r);
            }
        }
        manifest
    }

    fn test_storage(dir: &TempDir) -> LocalStorage {
        LocalStorage::new(dir.path().join("db"), dir.path().join("repo"), "main")
    }

    #[test]
    fn test_reference_classification() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        let manifest = manifest_with_files(&[
            ("changed.dat", 10, None),
            ("same.dat", 20, Some("20240101-000000F")),
        ]);

        // hard-link off: referenced entries are skipped outright
        let plan = build_plan(
            &storage,
            &manifest,
            &PlanOptions { compress: false, checksum: false, hardlink: false },
        )
        .unwrap();
        assert_eq!(plan.jobs.len(), 1);
        assert_eq!(plan.jobs[0].key, "changed.dat");
        assert_eq!(plan.skipped, 1);
        assert!(plan.links.is_empty());
        assert_eq!(plan.copy_bytes, 10);

        // hard-link on: referenced entries become link jobs, zero new bytes
        let plan = build_plan(
            &storage,
            &manifest,
            &PlanOptions { compress: false, checksum: false, hardlink: true },
        )
        .unwrap();
        assert_eq!(plan.links.len(), 1);
        assert!(plan.links[0]
            .source
            .ends_with("main/20240101-000000F/base/same.dat"));
        assert_eq!(plan.skipped, 0);
        assert_eq!(plan.copy_bytes, 10);
    }

    #[test]
    fn test_exists_classification() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        let mut manifest = manifest_with_files(&[("kept.dat", 10, None)]);
        manifest.mark_exists("base:file", "kept.dat");

        // resume payoff: already-present files need no work
        let plan = build_plan(
            &storage,
            &manifest,
            &PlanOptions { compress: false, checksum: true, hardlink: false },
        )
        .unwrap();
        assert!(plan.jobs.is_empty());
        assert_eq!(plan.skipped, 1);

        // unless a hard-link backup wants its checksum recomputed
        let plan = build_plan(
            &storage,
            &manifest,
            &PlanOptions { compress: false, checksum: true, hardlink: true },
        )
        .unwrap();
        assert_eq!(plan.jobs.len(), 1);
        assert_eq!(plan.jobs[0].class, CopyClass::ChecksumOnly);
        assert_eq!(plan.copy_bytes, 0);
    }

    #[test]
    fn test_job_order_is_size_aware_and_stable() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        let manifest = manifest_with_files(&[
            ("big.dat", 1_000_000, None),
            ("mid.dat", 500, None),
            ("tiny.dat", 5, None),
        ]);

        let plan = build_plan(
            &storage,
            &manifest,
            &PlanOptions { compress: false, checksum: false, hardlink: false },
        )
        .unwrap();
        let keys: Vec<_> = plan.jobs.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(keys, vec!["tiny.dat", "mid.dat", "big.dat"]);
        assert_eq!(plan.copy_bytes, 1_000_505);
    }
}
