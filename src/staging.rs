//! Atomic placement of finished artifacts.
//!
//! Files are copied to a hidden `.<name>.tmp` sibling and renamed into place,
//! so a reader of the destination directory sees either nothing or the whole
//! file.
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const QUARANTINE_SUFFIX: &str = ".bad";

fn tmp_sibling(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("staged");
    dest.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{file_name}.tmp"))
}

/// Copy `source` to `dest` through a temporary sibling and rename.
pub fn place_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp_path = tmp_sibling(dest);
    if let Err(err) = fs::copy(source, &tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("place {}", dest.display()));
    }
    fs::rename(&tmp_path, dest).with_context(|| format!("place {}", dest.display()))?;
    Ok(())
}

pub fn write_bytes_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp_path = tmp_sibling(dest);
    fs::write(&tmp_path, bytes).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, dest).with_context(|| format!("write {}", dest.display()))?;
    Ok(())
}

pub fn write_json_atomic<T: serde::Serialize>(dest: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).context("serialize JSON")?;
    bytes.push(b'\n');
    write_bytes_atomic(dest, &bytes)
}

/// Move a broken artifact aside as `<name>.bad`.
pub fn quarantine(path: &Path) -> Result<PathBuf> {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(QUARANTINE_SUFFIX);
    let target = PathBuf::from(raw);
    fs::rename(path, &target).with_context(|| format!("quarantine {}", path.display()))?;
    Ok(target)
}
