//! Filename conventions for detector data files.
//!
//! Names are matched against a fixed, ordered list of pattern variants. Each
//! variant yields a structured `(run_number, file_number)` key or the caller
//! gets an [`UnparsableName`]; nothing is guessed.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Natural primary key of a physics data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct FileKey {
    pub run_number: u64,
    pub file_number: u64,
}

impl From<(u64, u64)> for FileKey {
    fn from((run_number, file_number): (u64, u64)) -> Self {
        FileKey {
            run_number,
            file_number,
        }
    }
}

impl From<FileKey> for (u64, u64) {
    fn from(key: FileKey) -> Self {
        (key.run_number, key.file_number)
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Run {:06}, File {:07}", self.run_number, self.file_number)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot extract run number from {name:?}")]
pub struct UnparsableName {
    pub name: String,
}

/// Recognized filename shapes, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenamePattern {
    /// `ukey_<uuid>_<Kind>_<Stream>_Run<run>_Subrun<sub>_<file>...`
    UkeyPrefixed,
    /// `<Kind>_<Stream>_Run<run>_Subrun<sub>_<file>...`
    Plain,
    /// `...Run<run>_Subrun<sub>_<file>...` anywhere in the name.
    Embedded,
}

impl FilenamePattern {
    /// Shapes a bundle member may take.
    pub const MEMBER_ORDER: [FilenamePattern; 2] =
        [FilenamePattern::UkeyPrefixed, FilenamePattern::Plain];

    /// Number of leading `_` segments replaced by the output prefix.
    fn leading_segments(self) -> usize {
        match self {
            FilenamePattern::UkeyPrefixed => 3,
            FilenamePattern::Plain => 1,
            FilenamePattern::Embedded => 0,
        }
    }

    fn regex(self) -> Option<&'static Regex> {
        static UKEY: OnceLock<Option<Regex>> = OnceLock::new();
        static PLAIN: OnceLock<Option<Regex>> = OnceLock::new();
        static EMBEDDED: OnceLock<Option<Regex>> = OnceLock::new();
        let (cell, pattern) = match self {
            FilenamePattern::UkeyPrefixed => (
                &UKEY,
                r"^ukey_[^_]+_[^_]+_[^_]+_Run(\d+)_Subrun(\d+)_(\d+)",
            ),
            FilenamePattern::Plain => (&PLAIN, r"^[^_]+_[^_]+_Run(\d+)_Subrun(\d+)_(\d+)"),
            FilenamePattern::Embedded => (&EMBEDDED, r"Run(\d+)_Subrun(\d+)_(\d+)"),
        };
        cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
    }

    fn key(self, file_name: &str) -> Option<FileKey> {
        let caps = self.regex()?.captures(file_name)?;
        let run_number = caps.get(1)?.as_str().parse().ok()?;
        let file_number = caps.get(3)?.as_str().parse().ok()?;
        Some(FileKey {
            run_number,
            file_number,
        })
    }
}

/// A bundle member name parsed with one of the member shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberName {
    pub file_name: String,
    pub pattern: FilenamePattern,
    pub key: FileKey,
    rest: String,
}

impl MemberName {
    pub fn parse(member: &str) -> Result<Self, UnparsableName> {
        let file_name = bare_file_name(member).to_string();
        for pattern in FilenamePattern::MEMBER_ORDER {
            let Some(key) = pattern.key(&file_name) else {
                continue;
            };
            let stem = strip_all_extensions(&file_name);
            let rest = stem
                .split('_')
                .skip(pattern.leading_segments())
                .collect::<Vec<_>>()
                .join("_");
            return Ok(MemberName {
                file_name,
                pattern,
                key,
                rest,
            });
        }
        Err(UnparsableName {
            name: member.to_string(),
        })
    }

    pub fn run_number(&self) -> u64 {
        self.key.run_number
    }

    /// `<prefix>_<remaining segments><extension>`.
    pub fn output_file_name(&self, prefix: &str, extension: &str) -> String {
        format!("{prefix}_{}{extension}", self.rest)
    }

    /// stdout/stderr transcript names for this member.
    pub fn log_file_names(&self, prefix: &str) -> (String, String) {
        let base = format!("LOG_{prefix}_{}", self.rest);
        (format!("{base}.out"), format!("{base}.err"))
    }
}

/// Key search used by accounting, where names carry arbitrary prefixes.
pub fn search_key(name: &str) -> Option<FileKey> {
    FilenamePattern::Embedded.key(bare_file_name(name))
}

/// Final path component of a `/`-separated logical or archive path.
pub fn bare_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Strip leading `./` and `/` from an archive or manifest path.
pub fn normalize_member_path(raw: &str) -> String {
    let mut value = raw.trim();
    loop {
        if let Some(stripped) = value.strip_prefix("./") {
            value = stripped;
        } else if let Some(stripped) = value.strip_prefix('/') {
            value = stripped;
        } else {
            break;
        }
    }
    value.to_string()
}

/// `name.tar.gz` -> `name`; a leading dot is not treated as an extension.
pub fn strip_all_extensions(file_name: &str) -> &str {
    let offset = usize::from(file_name.starts_with('.'));
    match file_name[offset..].find('.') {
        Some(idx) => &file_name[..idx + offset],
        None => file_name,
    }
}
