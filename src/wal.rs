//! WAL segment math and archive collection.
//!
//! A segment name is 24 hex characters: timeline, major and minor, 8 each.
//! [`range`] derives the ordered segment list between a backup's start and
//! stop positions; [`collect`] waits for each segment to land in the archive
//! and copies it into the backup's `base/pg_xlog`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::fs::{CopyOptions, PathRoot, SortOrder, Storage};
use crate::manifest::{
    file_section, Manifest, ATTR_CHECKSUM, ATTR_GROUP, ATTR_INODE, ATTR_MODIFICATION_TIME,
    ATTR_PERMISSION, ATTR_SIZE, ATTR_USER, LEVEL_BASE,
};
use crate::utils::errors::{EngineError, Result};

pub const SEGMENT_NAME_LEN: usize = 24;

/// Databases older than this never write the minor value `0xFF`.
pub const SKIP_FF_BEFORE_VERSION: f64 = 9.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WalSegment {
    pub timeline: u32,
    pub major: u32,
    pub minor: u32,
}

impl WalSegment {
    /// Name of the archive directory holding this segment.
    pub fn major_dir(&self) -> String {
        format!("{:08X}{:08X}", self.timeline, self.major)
    }
}

impl fmt::Display for WalSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}", self.timeline, self.major, self.minor)
    }
}

impl FromStr for WalSegment {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != SEGMENT_NAME_LEN || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::Param(format!("invalid WAL segment name '{s}'")));
        }
        Ok(WalSegment {
            timeline: u32::from_str_radix(&s[0..8], 16).expect("hex checked"),
            major: u32::from_str_radix(&s[8..16], 16).expect("hex checked"),
            minor: u32::from_str_radix(&s[16..24], 16).expect("hex checked"),
        })
    }
}

/// Ordered segment list from `start` to `stop` inclusive.
///
/// The minor value wraps into the next major at 256, or at 255 when
/// `skip_ff` is set (old database versions never wrote `0xFF`); the reset
/// happens before the next emission, so no `…FF` segment appears in a
/// skip_ff range.
pub fn range(start: &WalSegment, stop: &WalSegment, skip_ff: bool) -> Result<Vec<WalSegment>> {
    if start.timeline != stop.timeline {
        return Err(EngineError::Assert(format!(
            "timelines differ between start segment {start} and stop segment {stop}"
        )));
    }
    if (start.major, start.minor) > (stop.major, stop.minor) {
        return Err(EngineError::Param(format!(
            "start segment {start} is after stop segment {stop}"
        )));
    }
    if start.minor > 0xFF || stop.minor > 0xFF {
        return Err(EngineError::Param(format!(
            "segment minor out of range in {start}..{stop}"
        )));
    }

    let boundary = if skip_ff { 0xFF } else { 0x100 };
    if skip_ff && (start.minor == 0xFF || stop.minor == 0xFF) {
        return Err(EngineError::Param(format!(
            "segment range {start}..{stop} contains a 0xFF minor but skip_ff is set"
        )));
    }

    let mut segments = Vec::new();
    let mut major = start.major;
    let mut minor = start.minor;

    loop {
        segments.push(WalSegment {
            timeline: start.timeline,
            major,
            minor,
        });
        if major == stop.major && minor == stop.minor {
            break;
        }
        minor += 1;
        if minor == boundary {
            major += 1;
            minor = 0;
        }
    }

    Ok(segments)
}

/// Wait for each segment of the range to appear in the archive and copy it
/// into `base/pg_xlog` of the temp backup, recording a manifest entry from
/// the written file. The archive may hold segments under a hash-suffixed,
/// optionally compressed name; exactly one match per segment is required.
pub async fn collect<S: Storage>(
    storage: &S,
    manifest: &mut Manifest,
    start: &str,
    stop: &str,
    skip_ff: bool,
    compress: bool,
    checksum: bool,
    timeout_secs: u64,
) -> Result<usize> {
    let start: WalSegment = start.parse()?;
    let stop: WalSegment = stop.parse()?;
    let segments = range(&start, &stop, skip_ff)?;

    info!(
        start = %start,
        stop = %stop,
        count = segments.len(),
        "collecting WAL segments"
    );

    let ext = storage.compress_extension().to_string();
    let file_sec = file_section(LEVEL_BASE);

    for segment in &segments {
        let archive_dir = storage.path(PathRoot::BackupArchive, &segment.major_dir());
        let pattern = Regex::new(&format!("^{segment}(-[0-9a-f]+)?(\\.{ext})?$"))
            .map_err(|e| EngineError::Assert(format!("segment regex: {e}")))?;

        let name = wait_for_segment(storage, &archive_dir, &pattern, segment, timeout_secs).await?;
        let src_compressed = name.ends_with(&format!(".{ext}"));

        let key = format!("pg_xlog/{segment}");
        let dest = storage.path(PathRoot::BackupTmp, &format!("base/{key}"));
        storage.copy(
            &archive_dir.join(&name),
            &dest,
            &CopyOptions {
                src_compressed,
                dst_compress: compress,
                ignore_missing: false,
                permission: None,
                modification_time: None,
                create_dirs: true,
            },
        )?;

        // pg_xlog entries are reconstructed from what was actually written
        let written = if compress {
            storage.path(PathRoot::BackupTmp, &format!("base/{key}.{ext}"))
        } else {
            dest.clone()
        };
        let info = storage.stat(&written)?;
        manifest.set(&file_sec, &key, ATTR_USER, info.user.as_str());
        manifest.set(&file_sec, &key, ATTR_GROUP, info.group.as_str());
        manifest.set(&file_sec, &key, ATTR_PERMISSION, info.permission.as_str());
        manifest.set(&file_sec, &key, ATTR_SIZE, info.size);
        manifest.set(&file_sec, &key, ATTR_INODE, info.inode);
        manifest.set(&file_sec, &key, ATTR_MODIFICATION_TIME, info.modification_time);
        if checksum {
            let digest = storage.hash(&written, compress)?;
            manifest.set(&file_sec, &key, ATTR_CHECKSUM, digest);
        }

        debug!(segment = %segment, archive = %name, "WAL segment collected");
    }

    Ok(segments.len())
}

/// Poll the archive directory once a second until exactly one name matches.
async fn wait_for_segment<S: Storage>(
    storage: &S,
    archive_dir: &std::path::Path,
    pattern: &Regex,
    segment: &WalSegment,
    timeout_secs: u64,
) -> Result<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        if storage.exists(archive_dir)? {
            let mut matches = storage.list(archive_dir, Some(pattern), SortOrder::Forward)?;
            match matches.len() {
                0 => {}
                1 => return Ok(matches.remove(0)),
                _ => {
                    return Err(EngineError::Assert(format!(
                        "duplicate WAL segment {segment} in archive: {}",
                        matches.join(", ")
                    )));
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::ArchiveTimeout(format!(
                "WAL segment {segment} did not reach the archive within {timeout_secs}s"
            )));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
