//! Backup coordination.
//!
//! Drives one backup end to end: prior discovery and type selection, manifest
//! build, resume of an aborted temp, backup-start against the database, copy
//! planning and execution, backup-stop, WAL collection, and the atomic rename
//! that publishes the backup. Everything except the copy workers runs here,
//! on the coordinator.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{BackupType, Config};
use crate::db::ClusterController;
use crate::executor::plan::{self, PlanOptions};
use crate::executor::resume::{self, VERSION_FILE};
use crate::executor::{self, ExecuteOptions};
use crate::fs::{PathRoot, Storage};
use crate::label;
use crate::manifest::builder::{self, TablespaceMap};
use crate::manifest::store::{self, MANIFEST_FILE};
use crate::manifest::{
    level_root, link_section, path_section, Manifest, Value, ATTR_ARCHIVE_START,
    ATTR_ARCHIVE_STOP, ATTR_CHECKSUM_OPTION, ATTR_COMPRESS, ATTR_HARDLINK, ATTR_LABEL,
    ATTR_LINK, ATTR_LINK_DESTINATION, ATTR_PATH, ATTR_PERMISSION, ATTR_PRIOR,
    ATTR_TIMESTAMP_START, ATTR_TIMESTAMP_STOP, ATTR_TYPE, ATTR_VERSION, LEVEL_BASE,
    SECTION_BACKUP, SECTION_BACKUP_OPTION, SECTION_BACKUP_PATH, SECTION_BACKUP_TABLESPACE,
};
use crate::retention::{self, ExpireSummary};
use crate::utils::errors::{EngineError, Result};
use crate::wal;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result of one backup run.
#[derive(Debug)]
pub struct BackupSummary {
    pub label: String,
    pub backup_type: BackupType,
    pub prior: Option<String>,
    pub resumed: bool,
    pub copied_files: usize,
    pub copied_bytes: u64,
    pub linked_files: usize,
    pub skipped_files: usize,
    pub removed_files: usize,
    pub wal_segments: usize,
    pub expired: ExpireSummary,
}

/// One backup invocation against a cluster.
pub struct BackupCommand<S, C> {
    config: Config,
    storage: S,
    db: C,
}

impl<S: Storage, C: ClusterController> BackupCommand<S, C> {
    pub fn new(config: Config, storage: S, db: C) -> Self {
        Self {
            config,
            storage,
            db,
        }
    }

    /// Run a backup labelled from `now`.
    pub async fn run(&mut self, now: DateTime<Utc>) -> Result<BackupSummary> {
        let options = self.config.backup.clone();

        let (backup_type, prior_label) = self.select_type()?;
        info!(
            backup_type = %backup_type,
            prior = prior_label.as_deref().unwrap_or("none"),
            "starting backup"
        );

        if !options.online {
            let pid = self.storage.path(PathRoot::DbAbsolute, "postmaster.pid");
            if self.storage.exists(&pid)? {
                return Err(EngineError::PostmasterRunning(format!(
                    "'{}' exists - stop the cluster before an offline backup",
                    pid.display()
                )));
            }
        }

        let label = label::new_label(prior_label.as_deref(), backup_type, now)?;
        let final_path = self.storage.path(PathRoot::BackupCluster, &label);
        if self.storage.exists(&final_path)? {
            return Err(EngineError::PathNotEmpty(format!(
                "backup '{label}' already exists"
            )));
        }
        self.storage
            .path_create(&self.storage.path(PathRoot::BackupCluster, ""), None)?;

        let prior_manifest = match &prior_label {
            Some(prior) => Some(store::load(
                &self
                    .storage
                    .path(PathRoot::BackupCluster, prior)
                    .join(MANIFEST_FILE),
            )?),
            None => None,
        };

        let tablespaces = if options.online {
            self.db.tablespace_map()?
        } else {
            TablespaceMap::new()
        };

        let mut manifest = Manifest::new();
        manifest.set_scalar(SECTION_BACKUP, ATTR_LABEL, label.as_str());
        manifest.set_scalar(SECTION_BACKUP, ATTR_TYPE, backup_type.as_str());
        manifest.set_scalar(SECTION_BACKUP, ATTR_VERSION, ENGINE_VERSION);
        manifest.set_scalar(SECTION_BACKUP, ATTR_TIMESTAMP_START, now.timestamp());
        if let Some(prior) = &prior_label {
            manifest.set_scalar(SECTION_BACKUP, ATTR_PRIOR, prior.as_str());
        }
        manifest.set_scalar(SECTION_BACKUP_OPTION, ATTR_COMPRESS, options.compress);
        manifest.set_scalar(SECTION_BACKUP_OPTION, ATTR_CHECKSUM_OPTION, options.checksum);
        manifest.set_scalar(SECTION_BACKUP_OPTION, ATTR_HARDLINK, options.hardlink);
        manifest.set(
            SECTION_BACKUP_PATH,
            LEVEL_BASE,
            ATTR_PATH,
            self.config.cluster.db_path.to_string_lossy().to_string(),
        );

        // walk the cluster off the coordinator thread
        let mut manifest = {
            let storage = self.storage.clone();
            let db_path = self.config.cluster.db_path.clone();
            tokio::task::spawn_blocking(move || -> Result<Manifest> {
                builder::build(
                    &storage,
                    &mut manifest,
                    prior_manifest.as_ref(),
                    &db_path,
                    &tablespaces,
                    LEVEL_BASE,
                )?;
                Ok(manifest)
            })
            .await
            .map_err(|e| EngineError::Assert(format!("manifest build task failed: {e}")))??
        };

        // reuse an aborted backup when safe
        let (mut manifest, resume_report) = {
            let storage = self.storage.clone();
            tokio::task::spawn_blocking(move || -> Result<(Manifest, resume::ResumeReport)> {
                let report = resume::check(&storage, &mut manifest)?;
                Ok((manifest, report))
            })
            .await
            .map_err(|e| EngineError::Assert(format!("resume task failed: {e}")))??
        };

        let archive_start = if options.online {
            let start = self.db.backup_start(&label, options.start_fast)?;
            info!(archive_start = %start, "backup mode started");
            manifest.set_scalar(SECTION_BACKUP, ATTR_ARCHIVE_START, start.as_str());
            Some(start)
        } else {
            None
        };

        self.create_topology(&manifest)?;

        let plan = plan::build_plan(
            &self.storage,
            &manifest,
            &PlanOptions {
                compress: options.compress,
                checksum: options.checksum,
                hardlink: options.hardlink,
            },
        )?;

        // persist before the copy so a crash from here on can resume
        let tmp = self.storage.path(PathRoot::BackupTmp, "");
        store::save(&tmp.join(MANIFEST_FILE), &manifest)?;
        self.storage
            .write_string(&tmp.join(VERSION_FILE), ENGINE_VERSION)?;

        let stats = executor::execute(
            &self.storage,
            &mut manifest,
            plan,
            &ExecuteOptions {
                process_max: options.process_max,
                compress: options.compress,
                checksum: options.checksum,
                timeout: options.copy_timeout.map(Duration::from_secs),
            },
        )
        .await?;

        let mut wal_segments = 0;
        if let Some(start) = &archive_start {
            let stop = self.db.backup_stop()?;
            info!(archive_stop = %stop, "backup mode stopped");
            manifest.set_scalar(SECTION_BACKUP, ATTR_ARCHIVE_STOP, stop.as_str());

            let skip_ff = self.db.version()? < wal::SKIP_FF_BEFORE_VERSION;
            wal_segments = wal::collect(
                &self.storage,
                &mut manifest,
                start,
                &stop,
                skip_ff,
                options.compress,
                options.checksum,
                options.archive_timeout,
            )
            .await?;
        }

        manifest.set_scalar(SECTION_BACKUP, ATTR_TIMESTAMP_STOP, Utc::now().timestamp());
        manifest.validate()?;
        store::save(&tmp.join(MANIFEST_FILE), &manifest)?;

        // the rename is the linearization point that publishes the backup
        self.storage.rename(&tmp, &final_path)?;
        info!(backup = %label, "backup complete");

        let expired = {
            let storage = self.storage.clone();
            let retention_config = self.config.retention.clone();
            tokio::task::spawn_blocking(move || retention::expire(&storage, &retention_config))
                .await
                .map_err(|e| EngineError::Assert(format!("retention task failed: {e}")))??
        };

        Ok(BackupSummary {
            label,
            backup_type,
            prior: prior_label,
            resumed: resume_report.resumed,
            copied_files: stats.copied_files,
            copied_bytes: stats.copied_bytes,
            linked_files: stats.linked_files,
            skipped_files: stats.skipped_files,
            removed_files: stats.removed_files,
            wal_segments,
            expired,
        })
    }

    /// Requested type with its prior backup; derived types without a prior
    /// coerce to full.
    fn select_type(&self) -> Result<(BackupType, Option<String>)> {
        let requested = self.config.backup.backup_type;
        if requested == BackupType::Full {
            return Ok((BackupType::Full, None));
        }

        match label::find_prior(&self.storage, requested)? {
            Some(prior) => Ok((requested, Some(prior))),
            None => {
                warn!("no prior backup exists, {requested} backup has been changed to full");
                Ok((BackupType::Full, None))
            }
        }
    }

    /// Create the directory and symlink topology of the backup inside temp.
    /// Workers only ever write leaf files into these directories.
    fn create_topology(&self, manifest: &Manifest) -> Result<()> {
        let tmp = self.storage.path(PathRoot::BackupTmp, "");

        for level in manifest.levels() {
            let root = tmp.join(level_root(&level));
            self.storage.path_create(&root, None)?;

            for (key, attrs) in manifest.entries(&path_section(&level)) {
                let permission = attrs.get(ATTR_PERMISSION).and_then(Value::as_text);
                self.storage.path_create(&root.join(key), permission)?;
            }

            for (key, attrs) in manifest.entries(&link_section(&level)) {
                // tablespace mounts are recreated below, pointing into the
                // backup's own tablespace trees
                if level == LEVEL_BASE && key.starts_with("pg_tblspc/") {
                    continue;
                }
                let Some(destination) =
                    attrs.get(ATTR_LINK_DESTINATION).and_then(Value::as_text)
                else {
                    continue;
                };
                self.storage
                    .link_create(Path::new(destination), &root.join(key), false, true)?;
            }
        }

        for (name, attrs) in manifest.entries(SECTION_BACKUP_TABLESPACE) {
            let Some(oid) = attrs.get(ATTR_LINK).and_then(Value::as_text) else {
                continue;
            };
            let target = format!("../../tablespace/{name}");
            self.storage.link_create(
                Path::new(&target),
                &tmp.join("base/pg_tblspc").join(oid),
                false,
                true,
            )?;
        }

        Ok(())
    }
}
