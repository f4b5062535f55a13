//! In-memory backup manifest.
//!
//! A manifest declares the complete contents of a backup and its relationship
//! to prior backups. It is a tree: section name → key → attribute → typed
//! value. Scalar sections (`backup`, `backup:option`) hold their attributes
//! under the empty key. The on-disk form lives in [`store`].

pub mod builder;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};

use crate::config::BackupType;
use crate::utils::errors::{EngineError, Result};

pub const SECTION_BACKUP: &str = "backup";
pub const SECTION_BACKUP_OPTION: &str = "backup:option";
pub const SECTION_BACKUP_PATH: &str = "backup:path";
pub const SECTION_BACKUP_TABLESPACE: &str = "backup:tablespace";

pub const ATTR_LABEL: &str = "label";
pub const ATTR_TYPE: &str = "type";
pub const ATTR_PRIOR: &str = "prior";
pub const ATTR_VERSION: &str = "version";
pub const ATTR_TIMESTAMP_START: &str = "timestamp-start";
pub const ATTR_TIMESTAMP_STOP: &str = "timestamp-stop";
pub const ATTR_ARCHIVE_START: &str = "archive-start";
pub const ATTR_ARCHIVE_STOP: &str = "archive-stop";
pub const ATTR_REFERENCE: &str = "reference";

pub const ATTR_COMPRESS: &str = "compress";
pub const ATTR_CHECKSUM_OPTION: &str = "checksum";
pub const ATTR_HARDLINK: &str = "hardlink";

pub const ATTR_USER: &str = "user";
pub const ATTR_GROUP: &str = "group";
pub const ATTR_PERMISSION: &str = "permission";
pub const ATTR_MODIFICATION_TIME: &str = "modification_time";
pub const ATTR_SIZE: &str = "size";
pub const ATTR_INODE: &str = "inode";
pub const ATTR_CHECKSUM: &str = "checksum";
pub const ATTR_LINK: &str = "link";
pub const ATTR_PATH: &str = "path";
pub const ATTR_LINK_DESTINATION: &str = "link_destination";

/// The `base` level; tablespace levels are named `tablespace:<NAME>`.
pub const LEVEL_BASE: &str = "base";

/// Section holding the file entries of a level.
pub fn file_section(level: &str) -> String {
    format!("{level}:file")
}

/// Section holding the directory entries of a level.
pub fn path_section(level: &str) -> String {
    format!("{level}:path")
}

/// Section holding the symlink entries of a level.
pub fn link_section(level: &str) -> String {
    format!("{level}:link")
}

/// Destination directory of a level inside a backup tree
/// (`base` or `tablespace/<NAME>`).
pub fn level_root(level: &str) -> String {
    match level.strip_prefix("tablespace:") {
        Some(name) => format!("tablespace/{name}"),
        None => level.to_string(),
    }
}

/// A typed leaf value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Int(i as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

pub type Attrs = BTreeMap<String, Value>;

/// The manifest tree plus the transient resume markers.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    sections: BTreeMap<String, BTreeMap<String, Attrs>>,
    /// (section, key) pairs whose temp file survived a resume clean.
    /// Never serialized.
    exists: BTreeSet<(String, String)>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        section: &str,
        key: &str,
        attr: &str,
        value: impl Into<Value>,
    ) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(attr.to_string(), value.into());
    }

    pub fn get(&self, section: &str, key: &str, attr: &str) -> Option<&Value> {
        self.sections.get(section)?.get(key)?.get(attr)
    }

    pub fn get_text(&self, section: &str, key: &str, attr: &str) -> Option<&str> {
        self.get(section, key, attr)?.as_text()
    }

    pub fn get_int(&self, section: &str, key: &str, attr: &str) -> Option<i64> {
        self.get(section, key, attr)?.as_int()
    }

    pub fn set_scalar(&mut self, section: &str, attr: &str, value: impl Into<Value>) {
        self.set(section, "", attr, value);
    }

    pub fn scalar(&self, section: &str, attr: &str) -> Option<&Value> {
        self.get(section, "", attr)
    }

    pub fn scalar_text(&self, section: &str, attr: &str) -> Option<&str> {
        self.scalar(section, attr)?.as_text()
    }

    pub fn attrs(&self, section: &str, key: &str) -> Option<&Attrs> {
        self.sections.get(section)?.get(key)
    }

    pub fn has_key(&self, section: &str, key: &str) -> bool {
        self.attrs(section, key).is_some()
    }

    /// Iterate `(key, attrs)` pairs of a section in key order.
    pub fn entries(&self, section: &str) -> impl Iterator<Item = (&String, &Attrs)> {
        self.sections.get(section).into_iter().flat_map(|m| m.iter())
    }

    /// Iterate `(section, keys)` pairs in section order.
    pub fn sections(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Attrs>)> {
        self.sections.iter()
    }

    pub fn remove_key(&mut self, section: &str, key: &str) -> bool {
        self.sections
            .get_mut(section)
            .map(|m| m.remove(key).is_some())
            .unwrap_or(false)
    }

    // --- backup section helpers -------------------------------------------

    pub fn label(&self) -> Option<&str> {
        self.scalar_text(SECTION_BACKUP, ATTR_LABEL)
    }

    pub fn backup_type(&self) -> Option<&str> {
        self.scalar_text(SECTION_BACKUP, ATTR_TYPE)
    }

    pub fn prior(&self) -> Option<&str> {
        self.scalar_text(SECTION_BACKUP, ATTR_PRIOR)
    }

    pub fn version(&self) -> Option<&str> {
        self.scalar_text(SECTION_BACKUP, ATTR_VERSION)
    }

    pub fn archive_start(&self) -> Option<&str> {
        self.scalar_text(SECTION_BACKUP, ATTR_ARCHIVE_START)
    }

    /// Prior labels whose content this backup reuses, from the comma-joined
    /// `backup.reference` attribute.
    pub fn references(&self) -> Vec<String> {
        self.scalar_text(SECTION_BACKUP, ATTR_REFERENCE)
            .map(|joined| joined.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Record a referenced label unless already present.
    pub fn add_reference(&mut self, label: &str) {
        let mut refs = self.references();
        if refs.iter().any(|r| r == label) {
            return;
        }
        refs.push(label.to_string());
        self.set_scalar(SECTION_BACKUP, ATTR_REFERENCE, refs.join(","));
    }

    /// Logical level names derived from the `backup:path` section
    /// (`base` first, tablespaces in name order).
    pub fn levels(&self) -> Vec<String> {
        self.entries(SECTION_BACKUP_PATH)
            .map(|(key, _)| key.clone())
            .collect()
    }

    // --- transient resume markers -----------------------------------------

    pub fn mark_exists(&mut self, section: &str, key: &str) {
        self.exists.insert((section.to_string(), key.to_string()));
    }

    pub fn is_marked_exists(&self, section: &str, key: &str) -> bool {
        self.exists.contains(&(section.to_string(), key.to_string()))
    }

    // --- validation -------------------------------------------------------

    /// Check the reference invariants before the final save: a full backup
    /// carries no references, and every per-file reference appears in
    /// `backup.reference`.
    pub fn validate(&self) -> Result<()> {
        let is_full = self.backup_type() == Some(BackupType::Full.as_str());
        let references: BTreeSet<String> = self.references().into_iter().collect();

        for level in self.levels() {
            let section = file_section(&level);
            for (key, attrs) in self.entries(&section) {
                if let Some(value) = attrs.get(ATTR_REFERENCE) {
                    if is_full {
                        return Err(EngineError::Assert(format!(
                            "full backup contains reference on '{section}:{key}'"
                        )));
                    }
                    let reference = value.as_text().unwrap_or_default();
                    if !references.contains(reference) {
                        return Err(EngineError::Assert(format!(
                            "reference '{reference}' on '{section}:{key}' missing from backup.reference"
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
