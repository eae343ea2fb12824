//! Input/output accounting reconciliation.
//!
//! Both sides are reduced to maps keyed by `(run_number, file_number)`. The
//! mapping is valid only when the key sets are equal and no common key
//! carries conflicting identity. Conflicts are listed, never resolved.
use crate::filename::{bare_file_name, search_key, FileKey};
use crate::manifest::entry_name;
use crate::staging::write_json_atomic;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const UNKNOWN_UUID: &str = "unknown";
pub const COMPARISON_SUFFIX: &str = ".filecount.comparison.json";

/// One file on either side of the comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub logical_name: String,
    pub uuid: Option<String>,
    /// Algorithm name to lowercase hex digest.
    pub checksums: BTreeMap<String, String>,
}

/// A side of the comparison keyed by file identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accounting {
    pub files: BTreeMap<FileKey, FileRecord>,
    pub duplicates: Vec<FileKey>,
    /// 1-based line numbers that were not JSON.
    pub unparsable_lines: Vec<usize>,
}

impl Accounting {
    fn insert(&mut self, key: FileKey, record: FileRecord, side: &str) {
        if self.files.insert(key, record).is_some() {
            tracing::warn!(side, key = %key, "duplicate (run, file) key");
            self.duplicates.push(key);
        }
    }
}

fn parse_checksums(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    match value {
        Some(Value::String(hex)) if !hex.is_empty() => {
            out.insert("sha512".to_string(), hex.to_ascii_lowercase());
        }
        Some(Value::Object(map)) => {
            for (algorithm, digest) in map {
                if let Some(hex) = digest.as_str() {
                    out.insert(algorithm.to_ascii_lowercase(), hex.to_ascii_lowercase());
                }
            }
        }
        _ => {}
    }
    out
}

fn file_record(name: String, record: &Map<String, Value>, uuid: Option<String>) -> FileRecord {
    FileRecord {
        logical_name: name,
        uuid,
        checksums: parse_checksums(record.get("checksum")),
    }
}

/// `{bundle_path: [record, ...]}` where a record names its file with
/// `logical_name` or `file`. The output UUID is the bundle path stem.
pub fn parse_output_accounting(text: &str) -> Result<Accounting> {
    let data: BTreeMap<String, Vec<Value>> =
        serde_json::from_str(text).context("parse output accounting JSON")?;
    let mut accounting = Accounting::default();
    for (bundle, records) in data {
        let bundle_uuid = Path::new(&bundle)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .filter(|stem| !stem.is_empty());
        for record in records {
            let Some(name) = entry_name(&record) else {
                continue;
            };
            let Some(key) = search_key(&name) else {
                continue;
            };
            let fields = record.as_object().cloned().unwrap_or_default();
            accounting.insert(key, file_record(name, &fields, bundle_uuid.clone()), "output");
        }
    }
    Ok(accounting)
}

/// NDJSON (one record per line) or a single JSON array of records. Lines
/// that are not JSON are reported and skipped.
pub fn parse_input_accounting(text: &str) -> Accounting {
    let mut accounting = Accounting::default();
    let records: Vec<Value> = match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items,
        _ => {
            let mut records = Vec::new();
            for (idx, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(value) => records.push(value),
                    Err(err) => {
                        tracing::error!(line = idx + 1, error = %err, "unparsable input accounting line");
                        accounting.unparsable_lines.push(idx + 1);
                    }
                }
            }
            records
        }
    };
    for record in records {
        let Some(name) = entry_name(&record) else {
            continue;
        };
        let Some(key) = search_key(&name) else {
            continue;
        };
        let fields = record.as_object().cloned().unwrap_or_default();
        let uuid = fields
            .get("uuid")
            .and_then(Value::as_str)
            .filter(|uuid| !uuid.is_empty())
            .map(str::to_string);
        accounting.insert(key, file_record(name, &fields, uuid), "input");
    }
    accounting
}

pub fn load_output_accounting(path: &Path) -> Result<Accounting> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_output_accounting(&text).with_context(|| format!("load {}", path.display()))
}

pub fn load_input_accounting(path: &Path) -> Result<Accounting> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse_input_accounting(&text))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidMismatch {
    pub run_number: u64,
    pub file_number: u64,
    pub input_uuid: Option<String>,
    pub output_uuid: Option<String>,
    pub input_logical_name: String,
    pub output_logical_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumMismatch {
    pub run_number: u64,
    pub file_number: u64,
    pub algorithm: String,
    pub input_checksum: String,
    pub output_checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidGroup {
    pub count: usize,
    pub mismatches: usize,
    pub files: Vec<FileKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub is_valid: bool,
    pub total_input_files: usize,
    pub total_output_files: usize,
    pub run_numbers: Vec<u64>,
    pub max_file_number_per_run: BTreeMap<u64, u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_only_in_input: Vec<FileKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_only_in_output: Vec<FileKey>,
    pub uuid_mismatches: Vec<UuidMismatch>,
    pub checksum_mismatches: Vec<ChecksumMismatch>,
    pub duplicates_in_input: Vec<FileKey>,
    pub duplicates_in_output: Vec<FileKey>,
    pub unparsable_input_lines: Vec<usize>,
    pub files_by_uuid: BTreeMap<String, UuidGroup>,
}

impl ReconciliationSummary {
    /// Count of findings that make the mapping invalid.
    pub fn problem_count(&self) -> usize {
        self.files_only_in_input.len()
            + self.files_only_in_output.len()
            + self.uuid_mismatches.len()
            + self.checksum_mismatches.len()
    }
}

/// Per-UUID comparison artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidComparison {
    pub uuid: String,
    pub file_count: usize,
    pub uuid_mismatches: usize,
    pub files: Vec<FileKey>,
    pub is_valid: bool,
}

pub fn reconcile(output: &Accounting, input: &Accounting) -> (bool, ReconciliationSummary) {
    let output_keys = output.files.keys().copied().collect::<BTreeSet<_>>();
    let input_keys = input.files.keys().copied().collect::<BTreeSet<_>>();
    let all_keys = output_keys.union(&input_keys).copied().collect::<BTreeSet<_>>();

    let mut max_file_number_per_run = BTreeMap::new();
    for key in &all_keys {
        let max = max_file_number_per_run.entry(key.run_number).or_insert(key.file_number);
        *max = (*max).max(key.file_number);
    }
    let run_numbers = max_file_number_per_run.keys().copied().collect();

    let files_only_in_input = input_keys.difference(&output_keys).copied().collect::<Vec<_>>();
    let files_only_in_output = output_keys.difference(&input_keys).copied().collect::<Vec<_>>();
    for key in &files_only_in_input {
        let record = &input.files[key];
        tracing::error!(
            key = %key,
            uuid = record.uuid.as_deref().unwrap_or("N/A"),
            logical_name = %record.logical_name,
            "file only in input"
        );
    }
    for key in &files_only_in_output {
        let record = &output.files[key];
        tracing::error!(
            key = %key,
            uuid = record.uuid.as_deref().unwrap_or("N/A"),
            logical_name = %record.logical_name,
            "file only in output"
        );
    }

    let mut uuid_mismatches = Vec::new();
    let mut checksum_mismatches = Vec::new();
    let mut files_by_uuid: BTreeMap<String, UuidGroup> = BTreeMap::new();
    for key in input_keys.intersection(&output_keys) {
        let input_record = &input.files[key];
        let output_record = &output.files[key];
        let group_uuid = input_record
            .uuid
            .clone()
            .or_else(|| output_record.uuid.clone())
            .unwrap_or_else(|| UNKNOWN_UUID.to_string());
        let group = files_by_uuid.entry(group_uuid).or_default();
        group.count += 1;
        group.files.push(*key);

        if input_record.uuid != output_record.uuid {
            tracing::error!(
                key = %key,
                input = input_record.uuid.as_deref().unwrap_or("none"),
                output = output_record.uuid.as_deref().unwrap_or("none"),
                "UUID mismatch"
            );
            group.mismatches += 1;
            uuid_mismatches.push(UuidMismatch {
                run_number: key.run_number,
                file_number: key.file_number,
                input_uuid: input_record.uuid.clone(),
                output_uuid: output_record.uuid.clone(),
                input_logical_name: input_record.logical_name.clone(),
                output_logical_name: output_record.logical_name.clone(),
            });
        }

        // Digests only describe the same bytes when both records name the
        // same file.
        if bare_file_name(&input_record.logical_name) != bare_file_name(&output_record.logical_name)
        {
            continue;
        }
        for (algorithm, input_digest) in &input_record.checksums {
            let Some(output_digest) = output_record.checksums.get(algorithm) else {
                continue;
            };
            if input_digest != output_digest {
                tracing::error!(key = %key, algorithm = %algorithm, "checksum mismatch");
                checksum_mismatches.push(ChecksumMismatch {
                    run_number: key.run_number,
                    file_number: key.file_number,
                    algorithm: algorithm.clone(),
                    input_checksum: input_digest.clone(),
                    output_checksum: output_digest.clone(),
                });
            }
        }
    }

    let mut summary = ReconciliationSummary {
        is_valid: false,
        total_input_files: input_keys.len(),
        total_output_files: output_keys.len(),
        run_numbers,
        max_file_number_per_run,
        files_only_in_input,
        files_only_in_output,
        uuid_mismatches,
        checksum_mismatches,
        duplicates_in_input: input.duplicates.clone(),
        duplicates_in_output: output.duplicates.clone(),
        unparsable_input_lines: input.unparsable_lines.clone(),
        files_by_uuid,
    };
    summary.is_valid = summary.problem_count() == 0;
    tracing::info!(
        valid = summary.is_valid,
        input_files = summary.total_input_files,
        output_files = summary.total_output_files,
        only_in_input = summary.files_only_in_input.len(),
        only_in_output = summary.files_only_in_output.len(),
        uuid_mismatches = summary.uuid_mismatches.len(),
        checksum_mismatches = summary.checksum_mismatches.len(),
        "reconciliation finished"
    );
    (summary.is_valid, summary)
}

pub fn uuid_comparisons(summary: &ReconciliationSummary) -> Vec<UuidComparison> {
    summary
        .files_by_uuid
        .iter()
        .map(|(uuid, group)| {
            let mut files = group.files.clone();
            files.sort();
            UuidComparison {
                uuid: uuid.clone(),
                file_count: group.count,
                uuid_mismatches: group.mismatches,
                files,
                is_valid: group.mismatches == 0,
            }
        })
        .collect()
}

/// Write `<uuid>.filecount.comparison.json` per UUID group into `dir`.
pub fn write_uuid_comparisons(dir: &Path, summary: &ReconciliationSummary) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for comparison in uuid_comparisons(summary) {
        if comparison.uuid.contains('/') || comparison.uuid.starts_with('.') {
            return Err(anyhow!("refusing UUID {:?} as a file name", comparison.uuid));
        }
        let path = dir.join(format!("{}{COMPARISON_SUFFIX}", comparison.uuid));
        write_json_atomic(&path, &comparison)?;
        tracing::info!(artifact = %path.display(), "wrote UUID comparison");
        written.push(path);
    }
    Ok(written)
}
