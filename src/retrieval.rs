//! Getting verified bundle bytes onto local disk, and finding the calibration
//! file for a run.
use crate::config::RetrievalSettings;
use crate::error::PipelineError;
use crate::exec::{exit_status_string, format_command_line, run_captured, CommandTemplate};
use crate::filename::MemberName;
use crate::integrity;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Copies a named remote object into a local directory.
pub trait RemoteFetch: Send + Sync {
    fn fetch(&self, remote: &Path, dest_dir: &Path) -> Result<()>;
}

/// Remote fetch through an external transfer command.
pub struct CommandFetch {
    template: CommandTemplate,
}

impl CommandFetch {
    pub fn new(template: CommandTemplate) -> Self {
        CommandFetch { template }
    }
}

impl RemoteFetch for CommandFetch {
    fn fetch(&self, remote: &Path, dest_dir: &Path) -> Result<()> {
        let mut vars = BTreeMap::new();
        vars.insert("remote", remote.display().to_string());
        vars.insert("dest_dir", dest_dir.display().to_string());
        let argv = self.template.render(&vars)?;
        tracing::debug!(command = %format_command_line(&argv), "remote fetch");
        let output = run_captured(&argv, None)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "fetch command exited {}: {}",
                exit_status_string(&output.status),
                stderr.trim()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl From<&RetrievalSettings> for RetryPolicy {
    fn from(settings: &RetrievalSettings) -> Self {
        RetryPolicy {
            attempts: settings.attempts.max(1),
            delay: Duration::from_secs(settings.delay_seconds),
        }
    }
}

pub struct BundleRetrieval<'a> {
    pub scratch_dir: &'a Path,
    /// `None` when remote transfer is not permitted.
    pub remote: Option<&'a dyn RemoteFetch>,
    pub policy: RetryPolicy,
}

impl BundleRetrieval<'_> {
    /// Local, verified path for `archive`.
    ///
    /// A local copy that exists but fails verification is an integrity error;
    /// it is never replaced by a fresh transfer.
    pub fn ensure_local(&self, archive: &Path, expected: &str) -> Result<PathBuf> {
        if let Some(local) = self.locate(archive) {
            let started = Instant::now();
            integrity::require(&local, expected)?;
            tracing::info!(
                bundle = %local.display(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "bundle verified"
            );
            return Ok(local);
        }
        let Some(remote) = self.remote else {
            return Err(PipelineError::not_found("bundle", archive).into());
        };
        self.fetch_with_retry(remote, archive, expected)
    }

    /// First existing local candidate, unverified.
    pub fn locate(&self, archive: &Path) -> Option<PathBuf> {
        local_candidates(archive, self.scratch_dir)
            .into_iter()
            .find(|path| path.is_file())
    }

    fn fetch_with_retry(
        &self,
        remote: &dyn RemoteFetch,
        archive: &Path,
        expected: &str,
    ) -> Result<PathBuf> {
        let name = archive
            .file_name()
            .ok_or_else(|| anyhow!("bundle path has no file name: {}", archive.display()))?;
        fs::create_dir_all(self.scratch_dir)
            .with_context(|| format!("create {}", self.scratch_dir.display()))?;
        let dest = self.scratch_dir.join(name);
        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            tracing::info!(bundle = %archive.display(), attempt, attempts, "fetching bundle");
            match self.attempt(remote, archive, &dest, expected) {
                Ok(()) => {
                    tracing::info!(bundle = %dest.display(), attempt, "bundle retrieved");
                    return Ok(dest);
                }
                Err(err) => {
                    last_error = format!("{err:#}");
                    tracing::warn!(
                        bundle = %archive.display(),
                        attempt,
                        attempts,
                        error = %last_error,
                        "bundle fetch failed"
                    );
                }
            }
            if attempt < attempts && !self.policy.delay.is_zero() {
                thread::sleep(self.policy.delay);
            }
        }
        Err(PipelineError::RetrievalFailed {
            remote: archive.to_path_buf(),
            attempts,
            last_error,
        }
        .into())
    }

    fn attempt(
        &self,
        remote: &dyn RemoteFetch,
        archive: &Path,
        dest: &Path,
        expected: &str,
    ) -> Result<()> {
        let result = remote
            .fetch(archive, self.scratch_dir)
            .and_then(|()| {
                if dest.is_file() {
                    Ok(())
                } else {
                    Err(anyhow!("fetch produced no file at {}", dest.display()))
                }
            })
            .and_then(|()| integrity::require(dest, expected).map(|_| ()));
        if result.is_err() && dest.exists() {
            if let Err(err) = fs::remove_file(dest) {
                tracing::warn!(bundle = %dest.display(), error = %err, "could not remove partial download");
            }
        }
        result
    }
}

/// Local places a bundle may already sit, in lookup order: the scratch root,
/// the dated scratch caches, then the archive path itself.
pub fn local_candidates(archive: &Path, scratch_dir: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let Some(name) = archive.file_name() else {
        return candidates;
    };
    candidates.push(scratch_dir.join(name));
    let (year, month_day) = archive_date(archive);
    if let Some(month_day) = &month_day {
        candidates.push(scratch_dir.join(month_day).join(name));
        if let Some(year) = &year {
            candidates.push(scratch_dir.join(year).join(month_day).join(name));
        }
    }
    candidates.push(archive.to_path_buf());
    candidates
}

/// `(YYYY, MMDD)` from an archive path such as
/// `.../IceCube/2022/unbiased/PFRaw/0131/bundle.zip`.
pub fn archive_date(archive: &Path) -> (Option<String>, Option<String>) {
    let dirs = archive
        .parent()
        .map(|parent| {
            parent
                .components()
                .filter_map(|component| match component {
                    Component::Normal(part) => part.to_str(),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let Some((last, ancestors)) = dirs.split_last() else {
        return (None, None);
    };
    if !is_month_day(last) {
        return (None, None);
    }
    let year = ancestors
        .iter()
        .rev()
        .find(|part| is_year(part))
        .map(|part| part.to_string());
    (year, Some(last.to_string()))
}

fn is_month_day(value: &str) -> bool {
    if value.len() != 4 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let month = value[..2].parse::<u32>().unwrap_or(0);
    let day = value[2..].parse::<u32>().unwrap_or(0);
    (1..=12).contains(&month) && (1..=31).contains(&day)
}

fn is_year(value: &str) -> bool {
    value.len() == 4
        && value.bytes().all(|b| b.is_ascii_digit())
        && value.parse::<u32>().is_ok_and(|year| (1990..=2199).contains(&year))
}

/// The single calibration file whose name contains the run number of
/// `input_file`.
pub fn resolve_calibration(input_file: &str, calibration_dir: &Path) -> Result<PathBuf> {
    let name = MemberName::parse(input_file)?;
    resolve_calibration_for_run(name.run_number(), calibration_dir)
}

pub fn resolve_calibration_for_run(run: u64, calibration_dir: &Path) -> Result<PathBuf> {
    if !calibration_dir.is_dir() {
        return Err(PipelineError::not_found("calibration directory", calibration_dir).into());
    }
    let pattern = Path::new(&glob::Pattern::escape(&calibration_dir.to_string_lossy()))
        .join(format!("*{run}*"))
        .to_string_lossy()
        .into_owned();
    let mut matches = glob::glob(&pattern)
        .with_context(|| format!("glob {pattern}"))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    matches.sort();
    match matches.len() {
        0 => Err(PipelineError::not_found(
            format!("calibration file for run {run}"),
            calibration_dir,
        )
        .into()),
        1 => Ok(matches.remove(0)),
        _ => Err(PipelineError::AmbiguousResolution {
            run,
            candidates: matches,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MEMBER: &str = "PFRaw_PhysicsFiltering_Run00133910_Subrun00000000_00000090.tar.gz";

    /// Writes `payloads[n]` on the n-th call, failing once they run out.
    struct ScriptedFetch {
        payloads: Vec<Option<&'static [u8]>>,
        calls: AtomicU32,
    }

    impl RemoteFetch for ScriptedFetch {
        fn fetch(&self, remote: &Path, dest_dir: &Path) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.payloads.get(call).copied().flatten() {
                Some(bytes) => {
                    let name = remote.file_name().ok_or_else(|| anyhow!("no name"))?;
                    fs::write(dest_dir.join(name), bytes)?;
                    Ok(())
                }
                None => Err(anyhow!("connection reset")),
            }
        }
    }

    /// Leaves a truncated file behind and reports a transfer error.
    struct TruncatingFetch;

    impl RemoteFetch for TruncatingFetch {
        fn fetch(&self, remote: &Path, dest_dir: &Path) -> Result<()> {
            let name = remote.file_name().ok_or_else(|| anyhow!("no name"))?;
            fs::write(dest_dir.join(name), b"bund")?;
            Err(anyhow!("transfer interrupted"))
        }
    }

    fn digest_of(bytes: &[u8]) -> String {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        fs::write(&path, bytes).expect("write");
        integrity::digest(&path).expect("digest")
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn prefers_scratch_copy_and_verifies_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).expect("mkdir");
        fs::write(scratch.join("bundleA.zip"), b"good").expect("write");
        let retrieval = BundleRetrieval {
            scratch_dir: &scratch,
            remote: None,
            policy: policy(1),
        };
        let archive = Path::new("/archive/2020/0420/bundleA.zip");
        let local = retrieval
            .ensure_local(archive, &digest_of(b"good"))
            .expect("ensure local");
        assert_eq!(local, scratch.join("bundleA.zip"));

        let err = retrieval.ensure_local(archive, &digest_of(b"other")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Integrity { .. })
        ));
    }

    #[test]
    fn finds_dated_cache_copies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().to_path_buf();
        let dated = scratch.join("2022").join("0131");
        fs::create_dir_all(&dated).expect("mkdir");
        fs::write(dated.join("b.zip"), b"cached").expect("write");
        let retrieval = BundleRetrieval {
            scratch_dir: &scratch,
            remote: None,
            policy: policy(1),
        };
        let archive = Path::new("/ranch/data/exp/IceCube/2022/unbiased/PFRaw/0131/b.zip");
        assert_eq!(retrieval.locate(archive), Some(dated.join("b.zip")));
        assert_eq!(
            archive_date(archive),
            (Some("2022".to_string()), Some("0131".to_string()))
        );
    }

    #[test]
    fn missing_without_transfer_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let retrieval = BundleRetrieval {
            scratch_dir: dir.path(),
            remote: None,
            policy: policy(3),
        };
        let err = retrieval
            .ensure_local(&dir.path().join("nowhere/x.zip"), "00")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NotFound { .. })
        ));
    }

    #[test]
    fn retries_until_a_verified_copy_arrives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch");
        let fetch = ScriptedFetch {
            payloads: vec![None, Some(b"corrupt"), Some(b"bundle bytes")],
            calls: AtomicU32::new(0),
        };
        let retrieval = BundleRetrieval {
            scratch_dir: &scratch,
            remote: Some(&fetch),
            policy: policy(5),
        };
        let local = retrieval
            .ensure_local(Path::new("/remote/0420/bundle.zip"), &digest_of(b"bundle bytes"))
            .expect("retrieve");
        assert_eq!(fs::read(&local).expect("read"), b"bundle bytes");
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_retries_are_retrieval_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetch = ScriptedFetch {
            payloads: Vec::new(),
            calls: AtomicU32::new(0),
        };
        let retrieval = BundleRetrieval {
            scratch_dir: dir.path(),
            remote: Some(&fetch),
            policy: policy(2),
        };
        let err = retrieval
            .ensure_local(Path::new("/remote/bundle.zip"), "00")
            .unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::RetrievalFailed {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(*attempts, 2);
                assert!(last_error.contains("connection reset"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn interrupted_transfer_leaves_no_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch");
        let retrieval = BundleRetrieval {
            scratch_dir: &scratch,
            remote: Some(&TruncatingFetch),
            policy: policy(2),
        };
        let archive = Path::new("/remote/0420/bundle.zip");
        let err = retrieval
            .ensure_local(archive, &digest_of(b"bundle bytes"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::RetrievalFailed { .. })
        ));
        assert!(!scratch.join("bundle.zip").exists());
        assert_eq!(retrieval.locate(archive), None);
    }

    #[test]
    fn command_fetch_renders_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("remote");
        fs::create_dir_all(&source).expect("mkdir");
        fs::write(source.join("b.zip"), b"zip").expect("write");
        let dest = dir.path().join("scratch");
        fs::create_dir_all(&dest).expect("mkdir");
        let fetch = CommandFetch::new(CommandTemplate::new(["cp", "{remote}", "{dest_dir}/"]));
        fetch.fetch(&source.join("b.zip"), &dest).expect("fetch");
        assert!(dest.join("b.zip").is_file());
        assert!(fetch.fetch(&source.join("absent.zip"), &dest).is_err());
    }

    #[test]
    fn calibration_resolution_counts_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = resolve_calibration(MEMBER, &dir.path().join("absent")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NotFound { .. })
        ));

        let err = resolve_calibration(MEMBER, dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NotFound { .. })
        ));

        fs::write(dir.path().join("GCD_Run133910.i3.gz"), b"gcd").expect("write");
        assert_eq!(
            resolve_calibration(MEMBER, dir.path()).expect("resolve"),
            dir.path().join("GCD_Run133910.i3.gz")
        );

        fs::write(dir.path().join("GCD_Run133910_v2.i3.gz"), b"gcd").expect("write");
        let err = resolve_calibration(MEMBER, dir.path()).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::AmbiguousResolution { run, candidates }) => {
                assert_eq!(*run, 133910);
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn calibration_dir_with_glob_characters_resolves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gcd = dir.path().join("gcd[pass3]");
        fs::create_dir_all(&gcd).expect("mkdir");
        fs::write(gcd.join("GCD_Run133910.i3.gz"), b"gcd").expect("write");
        assert_eq!(
            resolve_calibration(MEMBER, &gcd).expect("resolve"),
            gcd.join("GCD_Run133910.i3.gz")
        );
    }
}
