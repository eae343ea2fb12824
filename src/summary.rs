//! Per-run summaries gathered from accounting files in a dated directory
//! window.
use crate::error::PipelineError;
use crate::filename::search_key;
use crate::manifest::entry_name;
use crate::staging::write_json_atomic;
use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// JSON names containing any of these are derived artifacts, not accounting.
const DERIVED_MARKERS: [&str; 4] = ["summary", "comparison", "contents", "skip"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_number: u64,
    pub file_type: String,
    pub total_files: usize,
    pub files: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryPaths {
    pub inputs: PathBuf,
    pub outputs: PathBuf,
    pub input_count: usize,
    pub output_count: usize,
}

/// `base` and its `YYYY/MMDD` siblings within `days` of its own date, for
/// those that exist. A path without a date pair is searched alone.
pub fn search_dirs(base: &Path, days: u32) -> Vec<PathBuf> {
    let parts = base.components().collect::<Vec<_>>();
    let Some((year_idx, date)) = find_date(&parts) else {
        return vec![base.to_path_buf()];
    };
    let mut dirs = Vec::new();
    let days = i64::from(days);
    for delta in -days..=days {
        let Some(target) = date.checked_add_signed(Duration::days(delta)) else {
            continue;
        };
        let mut candidate = PathBuf::new();
        for (idx, part) in parts.iter().enumerate() {
            if idx == year_idx {
                candidate.push(target.year().to_string());
            } else if idx == year_idx + 1 {
                candidate.push(format!("{:02}{:02}", target.month(), target.day()));
            } else {
                candidate.push(part.as_os_str());
            }
        }
        if candidate.is_dir() {
            dirs.push(candidate);
        }
    }
    if dirs.is_empty() {
        dirs.push(base.to_path_buf());
    }
    dirs
}

fn find_date(parts: &[Component<'_>]) -> Option<(usize, NaiveDate)> {
    parts.windows(2).enumerate().find_map(|(idx, pair)| {
        let year = pair[0].as_os_str().to_str()?.parse::<i32>().ok()?;
        if !(2000..=2100).contains(&year) {
            return None;
        }
        let month_day = pair[1].as_os_str().to_str()?;
        if month_day.len() != 4 {
            return None;
        }
        let month = month_day[..2].parse::<u32>().ok()?;
        let day = month_day[2..].parse::<u32>().ok()?;
        NaiveDate::from_ymd_opt(year, month, day).map(|date| (idx, date))
    })
}

fn glob_sorted(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = Path::new(&glob::Pattern::escape(&dir.to_string_lossy()))
        .join(pattern)
        .to_string_lossy()
        .into_owned();
    let mut paths = glob::glob(&pattern)
        .with_context(|| format!("glob {pattern}"))?
        .filter_map(|entry| entry.ok())
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

/// `(output accounting JSON files, input NDJSON manifests)` in `dirs`.
pub fn find_accounting_files(dirs: &[PathBuf]) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut json_files = Vec::new();
    let mut ndjson_files = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        for path in glob_sorted(dir, "*.json")? {
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            if DERIVED_MARKERS.iter().any(|marker| name.contains(marker)) {
                continue;
            }
            json_files.push(path);
        }
        ndjson_files.extend(glob_sorted(dir, "*.ndjson")?);
    }
    Ok((json_files, ndjson_files))
}

fn run_of(record: &Value) -> Option<u64> {
    entry_name(record)
        .and_then(|name| search_key(&name))
        .map(|key| key.run_number)
}

fn file_number_of(record: &Value) -> u64 {
    entry_name(record)
        .and_then(|name| search_key(&name))
        .map_or(0, |key| key.file_number)
}

/// Input records for `run` from NDJSON manifests, tagged with their source.
pub fn collect_input_files(manifests: &[PathBuf], run: u64) -> Vec<Value> {
    let mut files = Vec::new();
    for manifest in manifests {
        let text = match fs::read_to_string(manifest) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(manifest = %manifest.display(), error = %err, "cannot read manifest");
                continue;
            }
        };
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut record = match serde_json::from_str::<Value>(line) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(
                        manifest = %manifest.display(),
                        line = idx + 1,
                        error = %err,
                        "unparsable manifest line"
                    );
                    continue;
                }
            };
            if run_of(&record) != Some(run) {
                continue;
            }
            if let Some(fields) = record.as_object_mut() {
                fields.insert(
                    "_source_manifest".to_string(),
                    Value::String(manifest.display().to_string()),
                );
            }
            files.push(record);
        }
    }
    files
}

/// Output records for `run` from run accounting files.
pub fn collect_output_files(accounting_files: &[PathBuf], run: u64) -> Vec<Value> {
    let mut files = Vec::new();
    for path in accounting_files {
        let data = fs::read(path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| {
                serde_json::from_slice::<serde_json::Map<String, Value>>(&bytes)
                    .map_err(anyhow::Error::from)
            });
        let data = match data {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(accounting = %path.display(), error = %err, "cannot read accounting file");
                continue;
            }
        };
        for (bundle, records) in data {
            let Value::Array(records) = records else {
                continue;
            };
            for mut record in records {
                if run_of(&record) != Some(run) {
                    continue;
                }
                if let Some(fields) = record.as_object_mut() {
                    fields.insert(
                        "_source_accounting".to_string(),
                        Value::String(path.display().to_string()),
                    );
                    fields.insert("_bundle_path".to_string(), Value::String(bundle.clone()));
                }
                files.push(record);
            }
        }
    }
    files
}

pub fn run_summary(run: u64, file_type: &str, mut files: Vec<Value>) -> RunSummary {
    files.sort_by_key(file_number_of);
    RunSummary {
        run_number: run,
        file_type: file_type.to_string(),
        total_files: files.len(),
        files,
    }
}

/// Write `Run<run>_PFRaw_summary.json` and `Run<run>_Pass3_summary.json`.
pub fn summarize_run(
    run: u64,
    search_dir: &Path,
    days: u32,
    output_dir: Option<&Path>,
) -> Result<SummaryPaths> {
    if !search_dir.is_dir() {
        return Err(PipelineError::not_found("search directory", search_dir).into());
    }
    let output_dir = output_dir.unwrap_or(search_dir);
    fs::create_dir_all(output_dir).with_context(|| format!("create {}", output_dir.display()))?;

    let dirs = search_dirs(search_dir, days);
    let (json_files, ndjson_files) = find_accounting_files(&dirs)?;
    tracing::info!(
        run,
        dirs = dirs.len(),
        accounting_files = json_files.len(),
        manifests = ndjson_files.len(),
        "summarizing run"
    );
    let inputs = run_summary(run, "PFRaw", collect_input_files(&ndjson_files, run));
    let outputs = run_summary(run, "Pass3_Step1", collect_output_files(&json_files, run));

    let paths = SummaryPaths {
        inputs: output_dir.join(format!("Run{run:06}_PFRaw_summary.json")),
        outputs: output_dir.join(format!("Run{run:06}_Pass3_summary.json")),
        input_count: inputs.total_files,
        output_count: outputs.total_files,
    };
    write_json_atomic(&paths.inputs, &inputs)?;
    write_json_atomic(&paths.outputs, &outputs)?;
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(run: u64, file: u64) -> String {
        format!("PFRaw_PhysicsFiltering_Run{run:08}_Subrun00000000_{file:08}.tar.gz")
    }

    #[test]
    fn search_window_spans_month_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        for date in ["2022/0131", "2022/0201", "2022/0130"] {
            fs::create_dir_all(dir.path().join(date).join("accounting")).expect("mkdir");
        }
        let base = dir.path().join("2022/0131/accounting");
        let dirs = search_dirs(&base, 1);
        assert_eq!(
            dirs,
            vec![
                dir.path().join("2022/0130/accounting"),
                dir.path().join("2022/0131/accounting"),
                dir.path().join("2022/0201/accounting"),
            ]
        );
        let plain = dir.path().join("flat");
        assert_eq!(search_dirs(&plain, 3), vec![plain.clone()]);
    }

    #[test]
    fn summarizes_inputs_and_outputs_for_one_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest = format!(
            "{}\n{}\nnot json\n{}\n",
            serde_json::json!({"logical_name": format!("/d/{}", name(133910, 12)), "uuid": "u1"}),
            serde_json::json!({"logical_name": format!("/d/{}", name(133910, 3)), "uuid": "u1"}),
            serde_json::json!({"logical_name": format!("/d/{}", name(133911, 1)), "uuid": "u1"}),
        );
        fs::write(dir.path().join("u1.ndjson"), manifest).expect("manifest");
        let accounting = serde_json::json!({
            "/archive/u1.zip": [
                {"file": "/o/Pass3_Step1_PhysicsFiltering_Run00133910_Subrun00000000_00000003.i3.zst", "checksum": "aa"}
            ]
        });
        fs::write(dir.path().join("u1.zip.json"), accounting.to_string()).expect("accounting");
        fs::write(dir.path().join("u1.zip.0123456789ab.skip.json"), "{}").expect("skip list");
        fs::write(dir.path().join("x.filecount.comparison.json"), "{}").expect("comparison");

        let paths = summarize_run(133910, dir.path(), 1, None).expect("summarize");
        assert_eq!(paths.input_count, 2);
        assert_eq!(paths.output_count, 1);
        assert_eq!(paths.inputs, dir.path().join("Run133910_PFRaw_summary.json"));

        let inputs: RunSummary =
            serde_json::from_slice(&fs::read(&paths.inputs).expect("read")).expect("parse");
        assert_eq!(file_number_of(&inputs.files[0]), 3);
        assert_eq!(file_number_of(&inputs.files[1]), 12);
        assert!(inputs.files[0]["_source_manifest"]
            .as_str()
            .expect("source")
            .ends_with("u1.ndjson"));

        let outputs: RunSummary =
            serde_json::from_slice(&fs::read(&paths.outputs).expect("read")).expect("parse");
        assert_eq!(outputs.file_type, "Pass3_Step1");
        assert_eq!(outputs.files[0]["_bundle_path"], "/archive/u1.zip");
    }

    #[test]
    fn missing_search_dir_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = summarize_run(1, &dir.path().join("absent"), 1, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NotFound { .. })
        ));
    }
}
