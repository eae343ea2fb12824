//! SHA-512 content digests for bundles and produced outputs.
use crate::error::PipelineError;
use anyhow::{Context, Result};
use sha2::{Digest, Sha512};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Fixed read buffer; files are streamed, never loaded whole.
pub const READ_BUFFER_BYTES: usize = 128 * 1024;

pub const SIDECAR_SUFFIX: &str = ".sha512sum";

/// Hex SHA-512 of the file at `path`.
pub fn digest(path: &Path) -> Result<String> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(PipelineError::not_found("file", path).into());
        }
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex SHA-512 of an in-memory value.
pub fn digest_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha512::digest(bytes))
}

/// True when the file digest equals `expected` (hex, case-insensitive).
pub fn verify(path: &Path, expected: &str) -> Result<bool> {
    let actual = digest(path)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

/// Like [`verify`] but a mismatch is an [`PipelineError::Integrity`] error.
/// Returns the computed digest.
pub fn require(path: &Path, expected: &str) -> Result<String> {
    let actual = digest(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(PipelineError::Integrity {
            path: path.to_path_buf(),
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        }
        .into());
    }
    Ok(actual)
}

pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(SIDECAR_SUFFIX);
    PathBuf::from(raw)
}

/// Write `<path>.sha512sum` as `"<path> <digest>"`.
pub fn write_sidecar(path: &Path, digest: &str) -> Result<PathBuf> {
    let sidecar = sidecar_path(path);
    fs::write(&sidecar, format!("{} {}", path.display(), digest))
        .with_context(|| format!("write {}", sidecar.display()))?;
    Ok(sidecar)
}

/// Digest recorded in the sidecar next to `path`, if one exists.
pub fn read_sidecar(path: &Path) -> Result<Option<String>> {
    let sidecar = sidecar_path(path);
    if !sidecar.is_file() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(&sidecar).with_context(|| format!("read {}", sidecar.display()))?;
    Ok(text
        .split_whitespace()
        .last()
        .map(|value| value.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_byte_sensitive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, b"detector payload").expect("write a");
        fs::write(&b, b"detector payloae").expect("write b");

        let first = digest(&a).expect("digest a");
        assert_eq!(first, digest(&a).expect("digest a again"));
        assert_eq!(first.len(), 128);
        assert_ne!(first, digest(&b).expect("digest b"));
    }

    #[test]
    fn verify_accepts_own_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("file.i3.zst");
        // Larger than one read buffer so the streaming loop runs more than once.
        fs::write(&path, vec![7u8; READ_BUFFER_BYTES * 2 + 13]).expect("write");
        let value = digest(&path).expect("digest");
        assert!(verify(&path, &value).expect("verify"));
        assert!(verify(&path, &value.to_ascii_uppercase()).expect("verify upper"));
    }

    #[test]
    fn missing_file_is_not_found_and_mismatch_is_integrity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.zip");
        let err = digest(&missing).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NotFound { .. })
        ));

        let path = dir.path().join("present.zip");
        fs::write(&path, b"bytes").expect("write");
        let err = require(&path, "00").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Integrity { .. })
        ));
    }

    #[test]
    fn sidecar_round_trips_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.i3.zst");
        fs::write(&path, b"out").expect("write");
        let value = digest(&path).expect("digest");
        let sidecar = write_sidecar(&path, &value).expect("sidecar");
        assert!(sidecar.to_string_lossy().ends_with(".i3.zst.sha512sum"));
        assert_eq!(read_sidecar(&path).expect("read"), Some(value));
    }
}
