//! Manifest construction.
//!
//! Walks a cluster directory (recursing through tablespace links) and fills a
//! manifest, diffing each file against the prior backup's manifest. A file
//! whose size, inode and modification time all match the prior entry is
//! recorded with a `reference` instead of being scheduled for copy; the
//! reference chain is flattened so it always names the backup that physically
//! holds the bytes.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::fs::{NodeKind, Storage};
use crate::manifest::{
    file_section, link_section, path_section, Manifest, ATTR_CHECKSUM, ATTR_GROUP, ATTR_INODE,
    ATTR_LINK, ATTR_LINK_DESTINATION, ATTR_MODIFICATION_TIME, ATTR_PATH, ATTR_PERMISSION,
    ATTR_REFERENCE, ATTR_SIZE, ATTR_USER, LEVEL_BASE, SECTION_BACKUP_PATH,
    SECTION_BACKUP_TABLESPACE,
};
use crate::utils::errors::{EngineError, Result};

/// Entries never captured from a live cluster: the WAL directory is rebuilt
/// from the archive, and the postmaster pid is meaningless in a backup.
const EXCLUDE_PREFIX: &str = "pg_xlog/";
const EXCLUDE_PID: &str = "postmaster.pid";

const TABLESPACE_DIR: &str = "pg_tblspc";

/// Map of tablespace oid to name, as reported by the database.
pub type TablespaceMap = BTreeMap<String, String>;

/// Fill `manifest` with the tree rooted at `source`, at the given level.
///
/// The caller records the level's `backup:path` entry; this function records
/// everything beneath it and recurses into tablespaces when `level` is
/// `base`.
pub fn build<S: Storage>(
    storage: &S,
    manifest: &mut Manifest,
    prior: Option<&Manifest>,
    source: &Path,
    tablespaces: &TablespaceMap,
    level: &str,
) -> Result<()> {
    let tree = storage.manifest(source)?;
    let prior_label = prior.and_then(|p| p.label()).map(str::to_string);

    for (name, info) in &tree {
        if level == LEVEL_BASE && (name.starts_with(EXCLUDE_PREFIX) || name == EXCLUDE_PID) {
            continue;
        }

        match info.kind {
            NodeKind::Dir => {
                let section = path_section(level);
                manifest.set(&section, name, ATTR_USER, info.user.as_str());
                manifest.set(&section, name, ATTR_GROUP, info.group.as_str());
                manifest.set(&section, name, ATTR_PERMISSION, info.permission.as_str());
            }
            NodeKind::File => {
                let section = file_section(level);
                manifest.set(&section, name, ATTR_USER, info.user.as_str());
                manifest.set(&section, name, ATTR_GROUP, info.group.as_str());
                manifest.set(&section, name, ATTR_PERMISSION, info.permission.as_str());
                manifest.set(&section, name, ATTR_SIZE, info.size);
                manifest.set(&section, name, ATTR_INODE, info.inode);
                manifest.set(&section, name, ATTR_MODIFICATION_TIME, info.modification_time);

                if let Some(prior) = prior {
                    diff_against_prior(manifest, prior, prior_label.as_deref(), &section, name, info);
                }
            }
            NodeKind::Link => {
                let destination = info.link_destination.clone().ok_or_else(|| {
                    EngineError::Assert(format!("link '{name}' has no destination"))
                })?;

                let section = link_section(level);
                manifest.set(&section, name, ATTR_USER, info.user.as_str());
                manifest.set(&section, name, ATTR_GROUP, info.group.as_str());
                manifest.set(&section, name, ATTR_LINK_DESTINATION, destination.as_str());

                if level == LEVEL_BASE {
                    if let Some(oid) = tablespace_oid(name) {
                        record_tablespace(
                            storage,
                            manifest,
                            prior,
                            tablespaces,
                            oid,
                            &destination,
                        )?;
                    }
                }
            }
            NodeKind::Other => {
                return Err(EngineError::Assert(format!(
                    "unsupported file type at '{name}'"
                )));
            }
        }
    }

    Ok(())
}

/// Attach a `reference` when (size, inode, modification_time) all match the
/// prior manifest's entry, carrying the prior checksum forward.
fn diff_against_prior(
    manifest: &mut Manifest,
    prior: &Manifest,
    prior_label: Option<&str>,
    section: &str,
    name: &str,
    info: &crate::fs::NodeInfo,
) {
    let Some(prior_attrs) = prior.attrs(section, name) else {
        return;
    };

    let unchanged = prior_attrs.get(ATTR_SIZE).and_then(|v| v.as_int()) == Some(info.size as i64)
        && prior_attrs.get(ATTR_INODE).and_then(|v| v.as_int()) == Some(info.inode as i64)
        && prior_attrs.get(ATTR_MODIFICATION_TIME).and_then(|v| v.as_int())
            == Some(info.modification_time);
    if !unchanged {
        return;
    }

    // The referenced backup is whichever one physically holds the bytes:
    // the prior's own reference if it had one, else the prior itself.
    let reference = prior_attrs
        .get(ATTR_REFERENCE)
        .and_then(|v| v.as_text())
        .or(prior_label)
        .map(str::to_string);
    let Some(reference) = reference else {
        return;
    };

    debug!(entry = %name, reference = %reference, "unchanged since prior backup");
    manifest.set(section, name, ATTR_REFERENCE, reference.as_str());
    if let Some(checksum) = prior_attrs.get(ATTR_CHECKSUM).and_then(|v| v.as_text()) {
        manifest.set(section, name, ATTR_CHECKSUM, checksum);
    }
    manifest.add_reference(&reference);
}

/// `pg_tblspc/<OID>` at depth one is a tablespace mount.
fn tablespace_oid(name: &str) -> Option<&str> {
    let oid = name.strip_prefix(TABLESPACE_DIR)?.strip_prefix('/')?;
    (!oid.is_empty() && !oid.contains('/')).then_some(oid)
}

fn record_tablespace<S: Storage>(
    storage: &S,
    manifest: &mut Manifest,
    prior: Option<&Manifest>,
    tablespaces: &TablespaceMap,
    oid: &str,
    destination: &str,
) -> Result<()> {
    // An oid the database did not report keeps the oid as its name so the
    // backup still completes.
    let name = tablespaces.get(oid).cloned().unwrap_or_else(|| oid.to_string());
    let level = format!("tablespace:{name}");

    manifest.set(SECTION_BACKUP_TABLESPACE, &name, ATTR_LINK, oid);
    manifest.set(SECTION_BACKUP_TABLESPACE, &name, ATTR_PATH, destination);
    manifest.set(SECTION_BACKUP_PATH, &level, ATTR_PATH, destination);

    build(
        storage,
        manifest,
        prior,
        Path::new(destination),
        tablespaces,
        &level,
    )
}
