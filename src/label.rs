//! Backup labels.
//!
//! A full backup is labelled `YYYYMMDD-HHMMSSF`; a derived (differential or
//! incremental) backup is labelled `<full label>_YYYYMMDD-HHMMSS{D,I}` where
//! the first 16 characters are the label of its ancestor full backup.
//! Lexicographic order of labels therefore agrees with chronological order
//! within a single full-backup chain, and a reverse name sort yields the most
//! recent backup first.

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::BackupType;
use crate::fs::{PathRoot, SortOrder, Storage};
use crate::utils::errors::{EngineError, Result};

/// Length of a full backup label (and of the full prefix of a derived one).
pub const FULL_LABEL_LEN: usize = 16;

const TIMESTAMP_PATTERN: &str = "[0-9]{8}-[0-9]{6}";

/// Anchored regex matching labels of the requested kinds.
pub fn predicate(include_full: bool, include_diff: bool, include_incr: bool) -> Result<Regex> {
    if !include_full && !include_diff && !include_incr {
        return Err(EngineError::Assert(
            "label predicate requires at least one backup type".to_string(),
        ));
    }

    let derived_suffix = match (include_diff, include_incr) {
        (true, true) => Some("[DI]"),
        (true, false) => Some("D"),
        (false, true) => Some("I"),
        (false, false) => None,
    };

    let pattern = match (include_full, derived_suffix) {
        (true, Some(suffix)) => format!(
            "^{TIMESTAMP_PATTERN}F(_{TIMESTAMP_PATTERN}{suffix})?$"
        ),
        (true, None) => format!("^{TIMESTAMP_PATTERN}F$"),
        (false, Some(suffix)) => format!("^{TIMESTAMP_PATTERN}F_{TIMESTAMP_PATTERN}{suffix}$"),
        (false, None) => unreachable!(),
    };

    Regex::new(&pattern).map_err(|e| EngineError::Assert(format!("label regex: {e}")))
}

/// Compose a new label. Derived types require the prior backup's label, whose
/// full prefix becomes the new label's prefix.
pub fn new_label(
    prior: Option<&str>,
    backup_type: BackupType,
    now: DateTime<Utc>,
) -> Result<String> {
    let stamp = now.format("%Y%m%d-%H%M%S");

    match backup_type {
        BackupType::Full => Ok(format!("{stamp}F")),
        BackupType::Diff | BackupType::Incr => {
            let prior = prior.ok_or_else(|| {
                EngineError::Assert(format!(
                    "{backup_type} backup requires a prior label"
                ))
            })?;
            if prior.len() < FULL_LABEL_LEN {
                return Err(EngineError::Assert(format!(
                    "prior label '{prior}' is too short"
                )));
            }
            let suffix = if backup_type == BackupType::Diff { "D" } else { "I" };
            Ok(format!("{}_{stamp}{suffix}", &prior[..FULL_LABEL_LEN]))
        }
    }
}

/// Label of the most recent backup the given type can derive from, if any.
///
/// Incremental backups derive from the most recent backup of any type;
/// differential (and, degenerately, full) fall back to the most recent full.
pub fn find_prior<S: Storage>(storage: &S, backup_type: BackupType) -> Result<Option<String>> {
    let cluster = storage.path(PathRoot::BackupCluster, "");
    if !storage.exists(&cluster)? {
        return Ok(None);
    }

    if backup_type == BackupType::Incr {
        let any = predicate(true, true, true)?;
        if let Some(label) = storage
            .list(&cluster, Some(&any), SortOrder::Reverse)?
            .into_iter()
            .next()
        {
            return Ok(Some(label));
        }
    }

    let fulls = predicate(true, false, false)?;
    Ok(storage
        .list(&cluster, Some(&fulls), SortOrder::Reverse)?
        .into_iter()
        .next())
}

/// The label of the ancestor full backup (the label itself for a full).
pub fn full_prefix(label: &str) -> &str {
    &label[..FULL_LABEL_LEN.min(label.len())]
}

/// Backup type encoded in a label's final character.
pub fn label_type(label: &str) -> Result<BackupType> {
    match label.chars().last() {
        Some('F') => Ok(BackupType::Full),
        Some('D') => Ok(BackupType::Diff),
        Some('I') => Ok(BackupType::Incr),
        _ => Err(EngineError::Assert(format!("unrecognized label '{label}'"))),
    }
}
