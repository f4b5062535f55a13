//! On-disk manifest format.
//!
//! Sectioned text, one value per line:
//!
//! ```text
//! [backup]
//! label="20240101-000000F"
//! timestamp-start=1704067200
//!
//! [base:file]
//! global/pg_control:size=8192
//! global/pg_control:user="1000"
//! ```
//!
//! Entry lines are `key:attr=value` (split at the last `:` before the `=`);
//! scalar lines are `attr=value`. Strings are JSON-quoted so every scalar
//! round-trips exactly; integers are bare; booleans are `y`/`n`. Unknown
//! sections, keys and attributes survive a load/save cycle untouched.

use std::fs;
use std::path::Path;

use crate::manifest::{Manifest, Value};
use crate::utils::errors::{EngineError, Result};

/// Name of the manifest file inside a backup directory.
pub const MANIFEST_FILE: &str = "backup.manifest";

pub fn load(path: &Path) -> Result<Manifest> {
    let content = fs::read_to_string(path)?;
    parse(&content).map_err(|msg| {
        EngineError::MalformedManifest(format!("{}: {msg}", path.display()))
    })
}

/// Serialize and atomically replace `path` (write-then-rename); saving over
/// an existing manifest is allowed.
pub fn save(path: &Path, manifest: &Manifest) -> Result<()> {
    let tmp = path.with_extension("manifest.tmp");
    fs::write(&tmp, render(manifest))?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn render(manifest: &Manifest) -> String {
    let mut out = String::new();

    for (section, keys) in manifest.sections() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push('[');
        out.push_str(section);
        out.push_str("]\n");

        for (key, attrs) in keys {
            for (attr, value) in attrs {
                if key.is_empty() {
                    out.push_str(&format!("{attr}={}\n", render_value(value)));
                } else {
                    out.push_str(&format!("{key}:{attr}={}\n", render_value(value)));
                }
            }
        }
    }

    out
}

fn render_value(value: &Value) -> String {
    match value {
        // serde_json handles quoting and escaping
        Value::Text(s) => serde_json::to_string(s).expect("string serialization"),
        Value::Int(i) => i.to_string(),
        Value::Bool(true) => "y".to_string(),
        Value::Bool(false) => "n".to_string(),
    }
}

fn parse_value(raw: &str) -> std::result::Result<Value, String> {
    if raw.starts_with('"') {
        let s: String =
            serde_json::from_str(raw).map_err(|e| format!("bad string value {raw}: {e}"))?;
        return Ok(Value::Text(s));
    }
    match raw {
        "y" => Ok(Value::Bool(true)),
        "n" => Ok(Value::Bool(false)),
        _ => raw
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("unrecognized value '{raw}'")),
    }
}

fn parse(content: &str) -> std::result::Result<Manifest, String> {
    let mut manifest = Manifest::new();
    let mut section: Option<String> = None;

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if name.is_empty() {
                return Err(format!("empty section name at line {}", idx + 1));
            }
            section = Some(name.to_string());
            continue;
        }

        let section = section
            .as_deref()
            .ok_or_else(|| format!("value outside any section at line {}", idx + 1))?;

        let (left, raw) = line
            .split_once('=')
            .ok_or_else(|| format!("missing '=' at line {}", idx + 1))?;
        let value = parse_value(raw).map_err(|e| format!("line {}: {e}", idx + 1))?;

        match left.rsplit_once(':') {
            Some((key, attr)) => manifest.set(section, key, attr, value),
            None => manifest.set(section, "", left, value),
        }
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{
        ATTR_LABEL, ATTR_SIZE, ATTR_USER, SECTION_BACKUP, SECTION_BACKUP_OPTION,
    };
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        let mut manifest = Manifest::new();
        manifest.set_scalar(SECTION_BACKUP, ATTR_LABEL, "20240101-000000F");
        manifest.set_scalar(SECTION_BACKUP, "timestamp-start", 1_704_067_200i64);
        manifest.set_scalar(SECTION_BACKUP_OPTION, "compress", true);
        manifest.set_scalar(SECTION_BACKUP_OPTION, "hardlink", false);
        manifest.set("base:file", "global/pg_control", ATTR_SIZE, 8192u64);
        manifest.set("base:file", "global/pg_control", ATTR_USER, "1000");
        // a key containing a colon-joined name
        manifest.set("backup:path", "tablespace:ts1", "path", "/mnt/ts1");
        // values with characters that need escaping
        manifest.set("base:link", "weird", "link_destination", "a=b\nc\"d");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.manifest");
        save(&path, &manifest).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.label(), Some("20240101-000000F"));
        assert_eq!(
            loaded.scalar(SECTION_BACKUP, "timestamp-start"),
            Some(&Value::Int(1_704_067_200))
        );
        assert_eq!(
            loaded.scalar(SECTION_BACKUP_OPTION, "compress"),
            Some(&Value::Bool(true))
        );
        assert_eq!(
            loaded.scalar(SECTION_BACKUP_OPTION, "hardlink"),
            Some(&Value::Bool(false))
        );
        assert_eq!(
            loaded.get_int("base:file", "global/pg_control", ATTR_SIZE),
            Some(8192)
        );
        assert_eq!(
            loaded.get_text("backup:path", "tablespace:ts1", "path"),
            Some("/mnt/ts1")
        );
        assert_eq!(
            loaded.get_text("base:link", "weird", "link_destination"),
            Some("a=b\nc\"d")
        );

        // saving again over the existing file works
        save(&path, &loaded).unwrap();
        let reloaded = load(&path).unwrap();
        assert_eq!(render(&loaded), render(&reloaded));
    }

    #[test]
    fn test_unknown_sections_preserved() {
        let text = "[future:section]\nsome/key:mystery=\"kept\"\nplain=42\n";
        let manifest = parse(text).unwrap();

        assert_eq!(
            manifest.get_text("future:section", "some/key", "mystery"),
            Some("kept")
        );
        assert_eq!(
            manifest.scalar("future:section", "plain"),
            Some(&Value::Int(42))
        );

        let rendered = render(&manifest);
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(render(&reparsed), rendered);
    }

    #[test]
    fn test_malformed_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.manifest");

        for bad in ["no section\n", "[s]\nno equals\n", "[s]\nkey=not_a_value\n"] {
            fs::write(&path, bad).unwrap();
            assert!(matches!(
                load(&path),
                Err(EngineError::MalformedManifest(_))
            ));
        }
    }

    #[test]
    fn test_bool_text_distinct_from_bool() {
        // the string "y" must not collapse into the boolean
        let mut manifest = Manifest::new();
        manifest.set_scalar("s", "text", "y");
        manifest.set_scalar("s", "flag", true);

        let rendered = render(&manifest);
        let parsed = parse(&rendered).unwrap();
        assert_eq!(parsed.scalar("s", "text"), Some(&Value::Text("y".into())));
        assert_eq!(parsed.scalar("s", "flag"), Some(&Value::Bool(true)));
    }
}
