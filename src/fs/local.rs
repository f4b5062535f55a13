//! Local filesystem implementation of the [`Storage`] trait.

use std::collections::BTreeMap;
use std::fs::{self, File, FileTimes, OpenOptions, Permissions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::Regex;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::fs::storage::{
    CopyOptions, CopyOutcome, NodeInfo, NodeKind, PathRoot, SortOrder, Storage,
};
use crate::utils::errors::{EngineError, Result};

const COMPRESS_EXTENSION: &str = "zst";

/// Storage rooted at a local data directory and backup repository.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    db_path: PathBuf,
    backup_path: PathBuf,
    cluster: String,
    compress_level: i32,
    worker: Option<usize>,
}

impl LocalStorage {
    pub fn new(db_path: PathBuf, backup_path: PathBuf, cluster: impl Into<String>) -> Self {
        Self {
            db_path,
            backup_path,
            cluster: cluster.into(),
            compress_level: 3,
            worker: None,
        }
    }

    pub fn with_compress_level(mut self, level: i32) -> Self {
        self.compress_level = level;
        self
    }

    fn node_info(path: &Path, metadata: &fs::Metadata) -> NodeInfo {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            NodeKind::Link
        } else if file_type.is_dir() {
            NodeKind::Dir
        } else if file_type.is_file() {
            NodeKind::File
        } else {
            NodeKind::Other
        };

        let link_destination = if kind == NodeKind::Link {
            fs::read_link(path)
                .ok()
                .map(|p| p.to_string_lossy().to_string())
        } else {
            None
        };

        NodeInfo {
            kind,
            user: metadata.uid().to_string(),
            group: metadata.gid().to_string(),
            permission: format!("{:04o}", metadata.mode() & 0o7777),
            size: metadata.len(),
            inode: metadata.ino(),
            modification_time: metadata.mtime(),
            link_destination,
        }
    }

    fn apply_permission(path: &Path, permission: Option<&str>) -> Result<()> {
        if let Some(mode) = permission {
            let mode = u32::from_str_radix(mode, 8)
                .map_err(|_| EngineError::Param(format!("invalid permission '{mode}'")))?;
            fs::set_permissions(path, Permissions::from_mode(mode))?;
        }
        Ok(())
    }
}

impl Storage for LocalStorage {
    fn path(&self, root: PathRoot, rel: &str) -> PathBuf {
        let base = match root {
            PathRoot::DbAbsolute => self.db_path.clone(),
            PathRoot::BackupAbsolute => self.backup_path.clone(),
            PathRoot::BackupCluster => self.backup_path.join(&self.cluster),
            PathRoot::BackupTmp => self.backup_path.join(&self.cluster).join("backup.tmp"),
            PathRoot::BackupArchive => self.backup_path.join(&self.cluster).join("archive"),
        };
        if rel.is_empty() {
            base
        } else {
            base.join(rel)
        }
    }

    fn compress_extension(&self) -> &str {
        COMPRESS_EXTENSION
    }

    fn list(&self, path: &Path, filter: Option<&Regex>, order: SortOrder) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if filter.map_or(true, |re| re.is_match(&name)) {
                names.push(name);
            }
        }
        names.sort();
        if order == SortOrder::Reverse {
            names.reverse();
        }
        Ok(names)
    }

    fn stat(&self, path: &Path) -> Result<NodeInfo> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(Self::node_info(path, &metadata))
    }

    fn manifest(&self, path: &Path) -> Result<BTreeMap<String, NodeInfo>> {
        let mut tree = BTreeMap::new();

        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| {
                EngineError::Io(e.into_io_error().unwrap_or_else(|| {
                    io::Error::new(ErrorKind::Other, "walk error without io cause")
                }))
            })?;
            if entry.depth() == 0 {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            let metadata = entry.metadata().map_err(|e| {
                EngineError::Io(e.into_io_error().unwrap_or_else(|| {
                    io::Error::new(ErrorKind::Other, "stat error without io cause")
                }))
            })?;

            tree.insert(rel, Self::node_info(entry.path(), &metadata));
        }

        Ok(tree)
    }

    fn copy(&self, src: &Path, dst: &Path, options: &CopyOptions) -> Result<CopyOutcome> {
        let src_file = match File::open(src) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound && options.ignore_missing => {
                return Ok(CopyOutcome::SourceMissing);
            }
            Err(e) => return Err(e.into()),
        };

        let dst = if options.dst_compress {
            compressed_name(dst, COMPRESS_EXTENSION)
        } else {
            dst.to_path_buf()
        };

        if options.create_dirs {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut dst_file = File::create(&dst)?;
        match (options.src_compressed, options.dst_compress) {
            // Same representation on both sides: plain byte copy
            (s, d) if s == d => {
                let mut reader = src_file;
                io::copy(&mut reader, &mut dst_file)?;
            }
            (false, true) => {
                zstd::stream::copy_encode(src_file, &mut dst_file, self.compress_level)
                    .map_err(EngineError::Io)?;
            }
            (true, false) => {
                zstd::stream::copy_decode(src_file, &mut dst_file).map_err(EngineError::Io)?;
            }
            _ => unreachable!(),
        }
        dst_file.flush()?;

        if let Some(mtime) = options.modification_time {
            let times = FileTimes::new()
                .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64));
            dst_file.set_times(times)?;
        }
        drop(dst_file);

        Self::apply_permission(&dst, options.permission.as_deref())?;

        Ok(CopyOutcome::Copied)
    }

    fn hash(&self, path: &Path, compressed: bool) -> Result<String> {
        let file = File::open(path)?;
        let mut hasher = Sha256::new();

        if compressed {
            let mut decoder = zstd::stream::read::Decoder::new(file).map_err(EngineError::Io)?;
            io::copy(&mut decoder, &mut hasher)?;
        } else {
            let mut reader = file;
            io::copy(&mut reader, &mut hasher)?;
        }

        Ok(hex::encode(hasher.finalize()))
    }

    fn compress_file(&self, path: &Path) -> Result<()> {
        let dst = compressed_name(path, COMPRESS_EXTENSION);
        let src_file = File::open(path)?;
        let mut dst_file = File::create(&dst)?;
        zstd::stream::copy_encode(src_file, &mut dst_file, self.compress_level)
            .map_err(EngineError::Io)?;
        dst_file.flush()?;
        drop(dst_file);
        fs::remove_file(path)?;
        Ok(())
    }

    fn link_create(
        &self,
        src: &Path,
        dst: &Path,
        hard: bool,
        ignore_existing: bool,
    ) -> Result<()> {
        if ignore_existing && fs::symlink_metadata(dst).is_ok() {
            return Ok(());
        }
        if hard {
            fs::hard_link(src, dst)?;
        } else {
            symlink(src, dst)?;
        }
        Ok(())
    }

    fn path_create(&self, path: &Path, permission: Option<&str>) -> Result<()> {
        fs::create_dir_all(path)?;
        Self::apply_permission(path, permission)
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        fs::rename(src, dst)?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::symlink_metadata(path).is_ok())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn remove_path(&self, path: &Path, recursive: bool) -> Result<()> {
        if recursive {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_dir(path)?;
        }
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        Ok(fs::read_to_string(path)?)
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    fn clone_for_worker(&self, worker: usize) -> Self {
        let mut clone = self.clone();
        clone.worker = Some(worker);
        clone
    }
}

fn compressed_name(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
