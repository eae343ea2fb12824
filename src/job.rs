//! One input file through the external transform.
//!
//! A job never mutates its bundle and never leaves a partial output at the
//! final destination. Per-file failures come back as `ERROR` outcomes; only an
//! ambiguous calibration lookup escapes as an error, because it means the
//! calibration directory itself is wrong for the whole batch.
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::exec::{exit_status_string, format_command_line, run_captured, run_logged};
use crate::filename::{bare_file_name, MemberName};
use crate::integrity;
use crate::retrieval::resolve_calibration_for_run;
use crate::staging;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub path: PathBuf,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub infile: String,
    pub bundle: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outfile: Option<OutputRecord>,
    pub message: String,
}

/// Everything one job needs; owned so it can move onto a worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub calibration_dir: PathBuf,
    /// Verified local bundle.
    pub bundle: PathBuf,
    /// Archive entry name of the input.
    pub member: String,
    pub output_dir: PathBuf,
    /// Parent of the per-job scratch directory.
    pub work_dir: PathBuf,
}

impl JobStatus {
    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Success => "SUCCESS",
            JobStatus::Warning => "WARNING",
            JobStatus::Error => "ERROR",
        }
    }
}

impl JobOutcome {
    fn error(spec: &JobSpec, message: impl Into<String>) -> Self {
        JobOutcome {
            status: JobStatus::Error,
            infile: spec.member.clone(),
            bundle: spec.bundle.clone(),
            outfile: None,
            message: message.into(),
        }
    }
}

/// True for failures that must stop the batch rather than one file.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PipelineError>(),
            Some(PipelineError::AmbiguousResolution { .. })
        )
    })
}

pub fn run_job(spec: &JobSpec, config: &PipelineConfig) -> Result<JobOutcome> {
    let started = Instant::now();
    tracing::info!(infile = %spec.member, bundle = %spec.bundle.display(), "job start");
    let outcome = run_stages(spec, config)?;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome.status {
        JobStatus::Error => tracing::error!(
            infile = %outcome.infile,
            elapsed_ms,
            message = %outcome.message,
            "job failed"
        ),
        status => tracing::info!(
            infile = %outcome.infile,
            elapsed_ms,
            status = ?status,
            message = %outcome.message,
            "job finished"
        ),
    }
    Ok(outcome)
}

fn run_stages(spec: &JobSpec, config: &PipelineConfig) -> Result<JobOutcome> {
    let member = match MemberName::parse(&spec.member) {
        Ok(member) => member,
        Err(err) => return Ok(JobOutcome::error(spec, err.to_string())),
    };
    if let Err(err) = fs::create_dir_all(&spec.output_dir) {
        return Ok(JobOutcome::error(
            spec,
            format!("create {}: {err}", spec.output_dir.display()),
        ));
    }
    let scratch = match tempfile::Builder::new()
        .prefix("brp-job-")
        .tempdir_in(&spec.work_dir)
    {
        Ok(dir) => dir,
        Err(err) => {
            return Ok(JobOutcome::error(
                spec,
                format!("create scratch dir in {}: {err}", spec.work_dir.display()),
            ))
        }
    };
    let (stdout_name, stderr_name) = member.log_file_names(&config.output_prefix);
    let mut transcript = match Transcript::create(scratch.path(), &stdout_name, &stderr_name) {
        Ok(transcript) => transcript,
        Err(err) => return Ok(JobOutcome::error(spec, format!("{err:#}"))),
    };
    transcript.note(&format!("Start Time: {}", timestamp()));
    transcript.note(&format!("Hostname: {}", hostname()));
    transcript.note(&format!("Input: {} from {}", spec.member, spec.bundle.display()));

    let result = stage_outcome(spec, config, &member, scratch.path(), &mut transcript);
    match &result {
        Ok(outcome) if outcome.status == JobStatus::Success => transcript.note("Status: SUCCESS"),
        Ok(outcome) => transcript.note(&format!(
            "Status: {} {}",
            outcome.status.label(),
            outcome.message
        )),
        Err(err) => transcript.note(&format!("Status: ERROR {err:#}")),
    }
    if let Err(err) = transcript.publish(&spec.output_dir) {
        tracing::warn!(infile = %spec.member, error = %format!("{err:#}"), "could not copy job logs");
    }
    drop(transcript);
    if let Err(err) = scratch.close() {
        tracing::warn!(infile = %spec.member, error = %err, "could not remove scratch dir");
    }
    result
}

/// Everything after the transcript is open. Only fatal errors escape.
fn stage_outcome(
    spec: &JobSpec,
    config: &PipelineConfig,
    member: &MemberName,
    scratch: &Path,
    transcript: &mut Transcript,
) -> Result<JobOutcome> {
    let calibration = match resolve_calibration_for_run(member.run_number(), &spec.calibration_dir)
    {
        Ok(path) => path,
        Err(err) if is_fatal(&err) => return Err(err),
        Err(err) => return Ok(JobOutcome::error(spec, format!("{err:#}"))),
    };
    let output_name = member.output_file_name(&config.output_prefix, &config.output_extension);
    let final_output = spec.output_dir.join(&output_name);
    if final_output.exists() {
        return Ok(check_existing(spec, config, &final_output));
    }

    let work = StageContext {
        spec,
        config,
        calibration: &calibration,
        scratch,
        output_name: &output_name,
        final_output: &final_output,
    };
    match work.process(transcript) {
        Ok(record) => Ok(JobOutcome {
            status: JobStatus::Success,
            infile: spec.member.clone(),
            bundle: spec.bundle.clone(),
            message: format!("processed into {}", record.path.display()),
            outfile: Some(record),
        }),
        Err(err) if is_fatal(&err) => Err(err),
        Err(err) => Ok(JobOutcome::error(spec, format!("{err:#}"))),
    }
}

fn quarantined(spec: &JobSpec, output: &Path, problem: &str) -> JobOutcome {
    let message = match staging::quarantine(output) {
        Ok(moved) => format!(
            "existing output {} {problem}; moved to {}",
            output.display(),
            moved.display()
        ),
        Err(err) => format!("existing output {} {problem}: {err:#}", output.display()),
    };
    JobOutcome::error(spec, message)
}

/// An output already sits at the destination from an earlier run.
fn check_existing(spec: &JobSpec, config: &PipelineConfig, output: &Path) -> JobOutcome {
    match validate_output(config, output) {
        Ok(true) => {}
        Ok(false) => return quarantined(spec, output, "is not valid"),
        Err(err) => return JobOutcome::error(spec, format!("{err:#}")),
    }
    let checksum = match integrity::digest(output) {
        Ok(checksum) => checksum,
        Err(err) => return JobOutcome::error(spec, format!("{err:#}")),
    };
    match integrity::read_sidecar(output) {
        Ok(Some(recorded)) if !recorded.eq_ignore_ascii_case(&checksum) => {
            return quarantined(spec, output, "does not match its recorded checksum");
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(
            output = %output.display(),
            error = %format!("{err:#}"),
            "unreadable checksum sidecar; using computed digest"
        ),
    }
    JobOutcome {
        status: JobStatus::Warning,
        infile: spec.member.clone(),
        bundle: spec.bundle.clone(),
        outfile: Some(OutputRecord {
            path: output.to_path_buf(),
            checksum,
        }),
        message: format!(
            "already processed: output {} from bundle {} exists",
            output.display(),
            spec.bundle.display()
        ),
    }
}

/// Copy `source` to `dest` and check the copy against `expected`. A
/// mismatching copy is removed.
fn place_verified(source: &Path, dest: &Path, expected: &str) -> Result<()> {
    staging::place_file(source, dest)?;
    let placed = integrity::digest(dest)?;
    if placed != expected {
        let _ = fs::remove_file(dest);
        return Err(PipelineError::Integrity {
            path: dest.to_path_buf(),
            expected: expected.to_string(),
            actual: placed,
        }
        .into());
    }
    Ok(())
}

/// Structural validity check of a finished output.
pub fn validate_output(config: &PipelineConfig, output: &Path) -> Result<bool> {
    let mut vars = BTreeMap::new();
    vars.insert("output", output.display().to_string());
    let argv = config.output_validate.render(&vars)?;
    let result = run_captured(&argv, None)?;
    if !result.status.success() {
        tracing::warn!(
            output = %output.display(),
            status = %exit_status_string(&result.status),
            stderr = %String::from_utf8_lossy(&result.stderr).trim(),
            "output validation failed"
        );
    }
    Ok(result.status.success())
}

struct StageContext<'a> {
    spec: &'a JobSpec,
    config: &'a PipelineConfig,
    calibration: &'a Path,
    scratch: &'a Path,
    output_name: &'a str,
    final_output: &'a Path,
}

impl StageContext<'_> {
    fn process(&self, transcript: &mut Transcript) -> Result<OutputRecord> {
        let calibration_name = self
            .calibration
            .file_name()
            .ok_or_else(|| anyhow!("calibration path has no file name"))?;
        let local_calibration = self.scratch.join(calibration_name);
        if let Some(template) = &self.config.calibration_check {
            let mut vars = BTreeMap::new();
            vars.insert("calibration", self.calibration.display().to_string());
            self.run_stage("calibration check", &template.render(&vars)?, transcript)?;
        }
        fs::copy(self.calibration, &local_calibration)
            .with_context(|| format!("copy {}", self.calibration.display()))?;

        let local_input = extract_member(&self.spec.bundle, &self.spec.member, self.scratch)?;
        let local_output = self.scratch.join(self.output_name);
        let vars = self.vars(&local_input, &local_calibration, &local_output);

        self.run_stage("transform", &self.config.transform.render(&vars)?, transcript)?;
        transcript.note(&format!("End Time PFRAW: {}", timestamp()));
        if let Some(template) = &self.config.output_check {
            self.run_stage("output check", &template.render(&vars)?, transcript)?;
        }
        transcript.note(&format!("End Time: {}", timestamp()));

        if !local_output.is_file() {
            return Err(PipelineError::validation(
                "transform",
                format!("no output produced at {}", local_output.display()),
            )
            .into());
        }
        let checksum = integrity::digest(&local_output)?;
        place_verified(&local_output, self.final_output, &checksum)?;
        integrity::write_sidecar(self.final_output, &checksum)?;
        transcript.note(&format!("Checksum: {checksum}"));

        if !validate_output(self.config, self.final_output)? {
            let moved = staging::quarantine(self.final_output)?;
            return Err(PipelineError::validation(
                "output validation",
                format!("{} is not valid; moved to {}", self.final_output.display(), moved.display()),
            )
            .into());
        }
        self.copy_auxiliary(&local_output);
        Ok(OutputRecord {
            path: self.final_output.to_path_buf(),
            checksum,
        })
    }

    fn vars(&self, input: &Path, calibration: &Path, output: &Path) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("input", input.display().to_string());
        vars.insert("calibration", calibration.display().to_string());
        vars.insert("output", output.display().to_string());
        vars
    }

    fn run_stage(&self, stage: &str, argv: &[String], transcript: &mut Transcript) -> Result<()> {
        transcript.note(&format!("Stage: {stage}: {}", format_command_line(argv)));
        let status = run_logged(argv, &transcript.stdout, &transcript.stderr)
            .with_context(|| format!("{stage} for {}", self.spec.member))?;
        if !status.success() {
            return Err(PipelineError::validation(
                stage,
                format!(
                    "{} in {} exited {}",
                    self.spec.member,
                    self.spec.bundle.display(),
                    exit_status_string(&status)
                ),
            )
            .into());
        }
        Ok(())
    }

    fn copy_auxiliary(&self, local_output: &Path) {
        for suffix in &self.config.auxiliary_suffixes {
            let source = with_suffix(local_output, suffix);
            let dest = with_suffix(self.final_output, suffix);
            if let Err(err) = staging::place_file(&source, &dest) {
                tracing::warn!(
                    artifact = %source.display(),
                    error = %format!("{err:#}"),
                    "monitoring artifact not copied"
                );
            }
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Extract one archive entry into `dest_dir` under its bare file name.
pub fn extract_member(bundle: &Path, member: &str, dest_dir: &Path) -> Result<PathBuf> {
    let file = File::open(bundle).with_context(|| format!("open {}", bundle.display()))?;
    let mut archive =
        zip::ZipArchive::new(file).with_context(|| format!("read zip {}", bundle.display()))?;
    let mut entry = match archive.by_name(member) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(PipelineError::not_found(
                format!("member {member} in bundle"),
                bundle,
            )
            .into())
        }
        Err(err) => return Err(err).with_context(|| format!("open entry {member}")),
    };
    let dest = dest_dir.join(bare_file_name(member));
    let mut out = File::create(&dest).with_context(|| format!("create {}", dest.display()))?;
    io::copy(&mut entry, &mut out).with_context(|| format!("extract {member}"))?;
    Ok(dest)
}

fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f+00:00").to_string()
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(|| {
            fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|value| value.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Per-file stdout/stderr logs, written in scratch and copied out at the end.
struct Transcript {
    stdout: File,
    stderr: File,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl Transcript {
    fn create(dir: &Path, stdout_name: &str, stderr_name: &str) -> Result<Self> {
        let stdout_path = dir.join(stdout_name);
        let stderr_path = dir.join(stderr_name);
        let stdout = File::create(&stdout_path)
            .with_context(|| format!("create {}", stdout_path.display()))?;
        let stderr = File::create(&stderr_path)
            .with_context(|| format!("create {}", stderr_path.display()))?;
        Ok(Transcript {
            stdout,
            stderr,
            stdout_path,
            stderr_path,
        })
    }

    fn note(&mut self, line: &str) {
        if let Err(err) = writeln!(self.stdout, "{line}") {
            tracing::warn!(log = %self.stdout_path.display(), error = %err, "log write failed");
        }
    }

    fn publish(&mut self, output_dir: &Path) -> Result<()> {
        self.stdout.flush().context("flush stdout log")?;
        self.stderr.flush().context("flush stderr log")?;
        for path in [&self.stdout_path, &self.stderr_path] {
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("log path has no file name"))?;
            staging::place_file(path, &output_dir.join(name))?;
        }
        Ok(())
    }
}
