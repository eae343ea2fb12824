//! Fan-out of per-file jobs over one bundle, and the run accounting record
//! they produce.
use crate::catalog::CatalogSink;
use crate::config::PipelineConfig;
use crate::dedup::SkipRecord;
use crate::error::PipelineError;
use crate::filename::{bare_file_name, MemberName};
use crate::job::{self, JobOutcome, JobSpec, JobStatus};
use crate::lists::BadFiles;
use crate::retrieval::BundleRetrieval;
use crate::staging::write_json_atomic;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Instant;

/// `{bundle_path: [{file, checksum}, ...]}`
pub type RunAccountingRecord = BTreeMap<String, Vec<AccountingEntry>>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountingEntry {
    pub file: String,
    pub checksum: String,
}

/// Inputs for preparing one bundle's jobs.
pub struct BatchRequest<'a> {
    pub calibration_dir: &'a Path,
    /// Archive path as given on the command line; keys the accounting record.
    pub bundle: &'a Path,
    pub checksum: &'a str,
    pub out_dir: &'a Path,
    pub scratch_dir: &'a Path,
    pub good_runs: &'a BTreeSet<u64>,
    pub bad_files: &'a BadFiles,
    pub skip: Option<&'a SkipRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub unparsable: usize,
    pub not_good_run: usize,
    pub bad_file: usize,
    pub duplicate: usize,
}

#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub bundle_key: String,
    pub local_bundle: PathBuf,
    pub out_dir: PathBuf,
    pub jobs: Vec<JobSpec>,
    pub excluded: Exclusions,
}

/// Archive entries whose name contains `member_pattern`.
pub fn list_inputs(local_bundle: &Path, member_pattern: &str) -> Result<Vec<String>> {
    let file =
        File::open(local_bundle).with_context(|| format!("open {}", local_bundle.display()))?;
    let archive = zip::ZipArchive::new(file)
        .with_context(|| format!("read zip {}", local_bundle.display()))?;
    let mut names = archive
        .file_names()
        .filter(|name| name.contains(member_pattern))
        .map(str::to_string)
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

/// Resolve the bundle and select the members to process.
pub fn prepare_inputs(
    request: &BatchRequest<'_>,
    retrieval: &BundleRetrieval<'_>,
    config: &PipelineConfig,
) -> Result<PreparedBatch> {
    fs::create_dir_all(request.out_dir)
        .with_context(|| format!("create {}", request.out_dir.display()))?;
    fs::create_dir_all(request.scratch_dir)
        .with_context(|| format!("create {}", request.scratch_dir.display()))?;
    let local_bundle = retrieval.ensure_local(request.bundle, request.checksum)?;
    let candidates = list_inputs(&local_bundle, &config.member_pattern)?;
    if candidates.is_empty() {
        return Err(PipelineError::not_found(
            format!("input files matching {:?}", config.member_pattern),
            &local_bundle,
        )
        .into());
    }
    if let Some(skip) = request.skip {
        if bare_file_name(&skip.bundle) != bare_file_name(&request.bundle.to_string_lossy()) {
            tracing::warn!(
                skip_list_bundle = %skip.bundle,
                bundle = %request.bundle.display(),
                "skip list was built for a different bundle"
            );
        }
    }

    let mut excluded = Exclusions::default();
    let mut jobs = Vec::new();
    for member in candidates {
        let Ok(name) = MemberName::parse(&member) else {
            excluded.unparsable += 1;
            continue;
        };
        if !request.good_runs.contains(&name.run_number()) {
            excluded.not_good_run += 1;
            continue;
        }
        if request.bad_files.contains(&member) {
            excluded.bad_file += 1;
            continue;
        }
        if request.skip.is_some_and(|skip| skip.skips(&name.file_name)) {
            excluded.duplicate += 1;
            continue;
        }
        jobs.push(JobSpec {
            calibration_dir: request.calibration_dir.to_path_buf(),
            bundle: local_bundle.clone(),
            member,
            output_dir: request.out_dir.to_path_buf(),
            work_dir: request.scratch_dir.to_path_buf(),
        });
    }
    tracing::info!(
        bundle = %request.bundle.display(),
        jobs = jobs.len(),
        unparsable = excluded.unparsable,
        not_good_run = excluded.not_good_run,
        bad_file = excluded.bad_file,
        duplicate = excluded.duplicate,
        "inputs prepared"
    );
    Ok(PreparedBatch {
        bundle_key: request.bundle.display().to_string(),
        local_bundle,
        out_dir: request.out_dir.to_path_buf(),
        jobs,
        excluded,
    })
}

/// `<out_dir>/<bundle file name>.json`
pub fn accounting_path(out_dir: &Path, bundle_key: &str) -> Result<PathBuf> {
    let name = Path::new(bundle_key)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("bundle path has no file name: {bundle_key}"))?;
    Ok(out_dir.join(format!("{name}.json")))
}

/// Run every job on a bounded pool and persist the accounting record.
///
/// The record is written even when the batch fails. A fatal job error is
/// raised first, then any input without a completed outcome is reported as
/// [`PipelineError::BatchIncomplete`].
pub fn run_batch(
    batch: &PreparedBatch,
    config: Arc<PipelineConfig>,
    catalog: Option<Arc<dyn CatalogSink>>,
    max_workers: usize,
) -> Result<RunAccountingRecord> {
    let started = Instant::now();
    let workers = if max_workers == 0 {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        max_workers
    };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|index| format!("brp-worker-{index}"))
        .panic_handler(|_| tracing::error!("job worker panicked"))
        .build()
        .context("build worker pool")?;

    let (tx, rx) = mpsc::channel::<(String, Result<JobOutcome>)>();
    for spec in &batch.jobs {
        let tx = tx.clone();
        let spec = spec.clone();
        let config = Arc::clone(&config);
        pool.spawn(move || {
            let result = job::run_job(&spec, &config);
            let _ = tx.send((spec.member, result));
        });
    }
    drop(tx);

    let mut pending = batch
        .jobs
        .iter()
        .map(|spec| spec.member.clone())
        .collect::<BTreeSet<_>>();
    let mut entries = Vec::new();
    let mut fatal = None;
    let mut counts = BTreeMap::<&'static str, usize>::new();
    for (member, result) in rx {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(infile = %member, error = %format!("{err:#}"), "job aborted");
                *counts.entry("FATAL").or_default() += 1;
                if fatal.is_none() {
                    fatal = Some(err);
                }
                continue;
            }
        };
        let label = match outcome.status {
            JobStatus::Success => "SUCCESS",
            JobStatus::Warning => "WARNING",
            JobStatus::Error => "ERROR",
        };
        *counts.entry(label).or_default() += 1;
        let completed = match outcome.status {
            JobStatus::Success => true,
            JobStatus::Warning => config.accept_existing_outputs,
            JobStatus::Error => false,
        };
        if !completed {
            continue;
        }
        let Some(record) = &outcome.outfile else {
            continue;
        };
        if outcome.status == JobStatus::Success {
            if let Some(catalog) = &catalog {
                if let Err(err) = catalog.register(record) {
                    tracing::warn!(
                        output = %record.path.display(),
                        error = %format!("{err:#}"),
                        "file catalog registration failed"
                    );
                }
            }
        }
        entries.push(AccountingEntry {
            file: record.path.display().to_string(),
            checksum: record.checksum.clone(),
        });
        pending.remove(&member);
    }
    entries.sort();

    let mut accounting = RunAccountingRecord::new();
    accounting.insert(batch.bundle_key.clone(), entries);
    let path = accounting_path(&batch.out_dir, &batch.bundle_key)?;
    write_json_atomic(&path, &accounting)?;
    tracing::info!(
        record = %path.display(),
        jobs = batch.jobs.len(),
        success = counts.get("SUCCESS").copied().unwrap_or(0),
        warning = counts.get("WARNING").copied().unwrap_or(0),
        error = counts.get("ERROR").copied().unwrap_or(0),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch finished"
    );

    if let Some(err) = fatal {
        return Err(err);
    }
    if !pending.is_empty() {
        return Err(PipelineError::BatchIncomplete {
            missing: pending.into_iter().collect(),
        }
        .into());
    }
    Ok(accounting)
}
