//! Archive membership: which canonical file names a bundle carries.
//!
//! Membership comes from a manifest, either a sidecar file next to the bundle
//! or an `.ndjson` entry inside it. A bundle without a manifest has empty
//! membership; duplicate detection then has nothing to say about it.
use crate::filename::{bare_file_name, normalize_member_path};
use anyhow::{Context, Result};
use serde_json::Value;
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Object keys that may carry a member name, in priority order after
/// `logical_name`.
pub const NAME_KEYS: [&str; 6] = ["file", "filename", "name", "path", "member", "archive_member"];

const MANIFEST_EXTENSION: &str = "ndjson";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Sidecar(PathBuf),
    Embedded(String),
    Missing,
}

impl fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestSource::Sidecar(path) => write!(f, "{}", path.display()),
            ManifestSource::Embedded(entry) => write!(f, "embedded:{entry}"),
            ManifestSource::Missing => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// Bare file names, in manifest order.
    pub members: Vec<String>,
    pub source: ManifestSource,
}

pub fn list_members(bundle: &Path) -> Result<Membership> {
    if let Some(sidecar) = find_sidecar(bundle)? {
        let text = fs::read_to_string(&sidecar)
            .with_context(|| format!("read {}", sidecar.display()))?;
        return Ok(Membership {
            members: parse_member_names(&text),
            source: ManifestSource::Sidecar(sidecar),
        });
    }
    if bundle.is_file() {
        match read_embedded(bundle) {
            Ok(Some((entry, text))) => {
                return Ok(Membership {
                    members: parse_member_names(&text),
                    source: ManifestSource::Embedded(entry),
                })
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(bundle = %bundle.display(), error = %format!("{err:#}"), "cannot read archive manifest");
            }
        }
    }
    Ok(Membership {
        members: Vec::new(),
        source: ManifestSource::Missing,
    })
}

/// `<stem>.ndjson`, then `<file name>.ndjson`, then the first `<stem>*.ndjson`.
fn find_sidecar(bundle: &Path) -> Result<Option<PathBuf>> {
    let Some(dir) = bundle.parent() else {
        return Ok(None);
    };
    let Some(stem) = bundle.file_stem().and_then(|s| s.to_str()) else {
        return Ok(None);
    };
    let Some(name) = bundle.file_name().and_then(|s| s.to_str()) else {
        return Ok(None);
    };
    for candidate in [
        dir.join(format!("{stem}.{MANIFEST_EXTENSION}")),
        dir.join(format!("{name}.{MANIFEST_EXTENSION}")),
    ] {
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }
    let pattern = dir.join(format!(
        "{}*.{MANIFEST_EXTENSION}",
        glob::Pattern::escape(stem)
    ));
    let pattern = pattern.to_string_lossy().into_owned();
    let mut matches = glob::glob(&pattern)
        .with_context(|| format!("glob {pattern}"))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    matches.sort();
    Ok(matches.into_iter().next())
}

fn read_embedded(bundle: &Path) -> Result<Option<(String, String)>> {
    let file = File::open(bundle).with_context(|| format!("open {}", bundle.display()))?;
    let mut archive =
        zip::ZipArchive::new(file).with_context(|| format!("read zip {}", bundle.display()))?;
    let mut entries = archive
        .file_names()
        .filter(|entry| entry.ends_with(&format!(".{MANIFEST_EXTENSION}")))
        .map(str::to_string)
        .collect::<Vec<_>>();
    entries.sort();
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };
    let mut text = String::new();
    archive
        .by_name(&entry)
        .with_context(|| format!("open entry {entry}"))?
        .read_to_string(&mut text)
        .with_context(|| format!("read entry {entry}"))?;
    Ok(Some((entry, text)))
}

/// Member name carried by one manifest value.
pub fn entry_name(value: &Value) -> Option<String> {
    match value {
        Value::String(name) => Some(name.clone()),
        Value::Object(map) => std::iter::once("logical_name")
            .chain(NAME_KEYS)
            .find_map(|key| map.get(key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// Manifest entries as JSON values: a single JSON array document, or one
/// value per line. A line that is not JSON becomes a string value.
pub fn parse_manifest_values(text: &str) -> Vec<Value> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
        return items;
    }
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<Value>(line).unwrap_or_else(|_| Value::String(line.to_string()))
        })
        .collect()
}

/// Canonical bare file names listed in a manifest document.
pub fn parse_member_names(text: &str) -> Vec<String> {
    parse_manifest_values(text)
        .iter()
        .filter_map(entry_name)
        .map(|raw| normalize_member_path(&raw))
        .map(|path| bare_file_name(&path).to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
