//! Plain-text batch inputs: checksum ledger, good-run list, bad-files list.
use crate::filename::bare_file_name;
use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// `"<hex-digest> <archive-absolute-path>"` per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumLedger {
    entries: BTreeMap<String, String>,
}

impl ChecksumLedger {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse ledger {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let digest = parts.next().unwrap_or_default();
            let bundle = parts.next().map(str::trim).unwrap_or_default();
            if digest.is_empty() || bundle.is_empty() {
                return Err(anyhow!("line {}: expected \"<digest> <path>\"", idx + 1));
            }
            entries.insert(bundle.to_string(), digest.to_ascii_lowercase());
        }
        Ok(Self { entries })
    }

    /// Archive paths in lexicographic order.
    pub fn bundles(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn checksum(&self, bundle: &str) -> Option<&str> {
        if let Some(value) = self.entries.get(bundle) {
            return Some(value.as_str());
        }
        // Fall back to a unique file-name match.
        let name = bare_file_name(bundle);
        let mut hits = self
            .entries
            .iter()
            .filter(|(path, _)| bare_file_name(path) == name);
        match (hits.next(), hits.next()) {
            (Some((_, value)), None) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One run number per line; blank lines ignored.
pub fn load_good_runs(path: &Path) -> Result<BTreeSet<u64>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_good_runs(&text).with_context(|| format!("parse good-run list {}", path.display()))
}

pub fn parse_good_runs(text: &str) -> Result<BTreeSet<u64>> {
    let mut runs = BTreeSet::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let run = line
            .parse::<u64>()
            .with_context(|| format!("line {}: invalid run number {line:?}", idx + 1))?;
        runs.insert(run);
    }
    Ok(runs)
}

/// Known-bad input names; `#` starts a comment line.
#[derive(Debug, Clone, Default)]
pub struct BadFiles {
    names: BTreeSet<String>,
}

impl BadFiles {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let names = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self { names }
    }

    /// Matches on the member path as listed or on its bare file name.
    pub fn contains(&self, member: &str) -> bool {
        self.names.contains(member) || self.names.contains(bare_file_name(member))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Run-status CSV export to good-run list: keep rows whose third-from-last
/// column is `GOOD`, emit the first column.
pub fn convert_run_status_csv(csv_text: &str) -> Result<Vec<u64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(csv_text.as_bytes());
    let mut runs = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("csv row {}", idx + 1))?;
        if record.len() < 3 {
            continue;
        }
        if record.get(record.len() - 3).map(str::trim) != Some("GOOD") {
            continue;
        }
        let first = record.get(0).unwrap_or_default().trim();
        let run = first
            .parse::<u64>()
            .with_context(|| format!("csv row {}: invalid run number {first:?}", idx + 1))?;
        runs.push(run);
    }
    Ok(runs)
}

pub fn write_good_runs(path: &Path, runs: &[u64]) -> Result<()> {
    let mut text = String::new();
    for run in runs {
        text.push_str(&run.to_string());
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("write {}", path.display()))
}
