//! Shared fixtures for the integration tests: a throwaway cluster with a
//! backup repository, and a scripted database client.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use backup_engine::config::{ClusterConfig, Config, LogConfig, RetentionConfig};
use backup_engine::db::ClusterController;
use backup_engine::fs::LocalStorage;
use backup_engine::label;
use backup_engine::manifest::{
    store, Manifest, ATTR_ARCHIVE_START, ATTR_LABEL, ATTR_TYPE, SECTION_BACKUP,
};

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

pub fn set_mtime(path: &Path, secs: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_times(
        FileTimes::new().set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
    )
    .unwrap();
}

pub struct Fixture {
    pub dir: TempDir,
    pub db_path: PathBuf,
    pub repo: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("db");
        let repo = dir.path().join("repo");
        fs::create_dir_all(db_path.join("pg_xlog")).unwrap();
        fs::create_dir_all(db_path.join("pg_tblspc")).unwrap();
        fs::create_dir_all(&repo).unwrap();
        Self { dir, db_path, repo }
    }

    pub fn write_db_file(&self, rel: &str, contents: &[u8], mtime: u64) {
        let path = self.db_path.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        set_mtime(&path, mtime);
    }

    /// Drop a segment file into the archive under its major directory.
    pub fn place_segment(&self, name: &str) {
        let dir = self.repo.join("main/archive").join(&name[..16]);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), vec![0u8; 64]).unwrap();
    }

    pub fn storage(&self) -> LocalStorage {
        LocalStorage::new(self.db_path.clone(), self.repo.clone(), "main")
    }

    pub fn config(&self) -> Config {
        Config {
            cluster: ClusterConfig {
                name: "main".to_string(),
                db_path: self.db_path.clone(),
                backup_path: self.repo.clone(),
            },
            backup: Default::default(),
            retention: RetentionConfig::default(),
            log: LogConfig::default(),
        }
    }

    pub fn backup_dir(&self, label: &str) -> PathBuf {
        self.repo.join("main").join(label)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.repo.join("main/backup.tmp")
    }

    pub fn load_manifest(&self, label: &str) -> Manifest {
        store::load(&self.backup_dir(label).join("backup.manifest")).unwrap()
    }
}

/// Fabricate a published backup directory with a minimal manifest, for
/// retention tests that do not need a real backup run.
pub fn fabricate_backup(repo: &Path, label: &str, archive_start: Option<&str>) {
    let dir = repo.join("main").join(label);
    fs::create_dir_all(dir.join("base")).unwrap();
    fs::write(dir.join("base/data.dat"), label.as_bytes()).unwrap();

    let mut manifest = Manifest::new();
    manifest.set_scalar(SECTION_BACKUP, ATTR_LABEL, label);
    manifest.set_scalar(
        SECTION_BACKUP,
        ATTR_TYPE,
        label::label_type(label).unwrap().as_str(),
    );
    if let Some(start) = archive_start {
        manifest.set_scalar(SECTION_BACKUP, ATTR_ARCHIVE_START, start);
    }
    store::save(&dir.join("backup.manifest"), &manifest).unwrap();
}

/// A database client that replays scripted answers.
pub struct ScriptedCluster {
    pub start: String,
    pub stop: String,
    pub db_version: f64,
    pub tablespaces: BTreeMap<String, String>,
    pub on_start: Option<Box<dyn FnMut() + Send>>,
}

impl ScriptedCluster {
    pub fn new(start: &str, stop: &str) -> Self {
        Self {
            start: start.to_string(),
            stop: stop.to_string(),
            db_version: 9.4,
            tablespaces: BTreeMap::new(),
            on_start: None,
        }
    }

    pub fn with_on_start(mut self, hook: Box<dyn FnMut() + Send>) -> Self {
        self.on_start = Some(hook);
        self
    }

    pub fn with_version(mut self, version: f64) -> Self {
        self.db_version = version;
        self
    }

    pub fn with_tablespace(mut self, oid: &str, name: &str) -> Self {
        self.tablespaces.insert(oid.to_string(), name.to_string());
        self
    }
}

impl ClusterController for ScriptedCluster {
    fn backup_start(&mut self, _label: &str, _fast: bool) -> backup_engine::Result<String> {
        if let Some(hook) = self.on_start.as_mut() {
            hook();
        }
        Ok(self.start.clone())
    }

    fn backup_stop(&mut self) -> backup_engine::Result<String> {
        Ok(self.stop.clone())
    }

    fn tablespace_map(&mut self) -> backup_engine::Result<BTreeMap<String, String>> {
        Ok(self.tablespaces.clone())
    }

    fn version(&mut self) -> backup_engine::Result<f64> {
        Ok(self.db_version)
    }
}
