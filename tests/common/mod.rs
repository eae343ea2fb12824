//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use sha2::{Digest, Sha512};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub const RUN: u64 = 133910;

/// `PFRaw_PhysicsFiltering_Run00133910_Subrun00000000_<file>.tar.gz`
pub fn member(file: u32) -> String {
    format!("PFRaw_PhysicsFiltering_Run{RUN:08}_Subrun00000000_{file:08}.tar.gz")
}

pub fn output_name(file: u32) -> String {
    format!("Pass3_Step1_PhysicsFiltering_Run{RUN:08}_Subrun00000000_{file:08}.i3.zst")
}

pub fn sha512_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn brp() -> Command {
    Command::new(env!("CARGO_BIN_EXE_brp"))
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Write a zip whose entries each hold their own name as payload.
pub fn write_bundle(path: &Path, entries: &[String]) -> String {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create bundle dir");
    }
    let mut zip = zip::ZipWriter::new(File::create(path).expect("create bundle"));
    for name in entries {
        zip.start_file(name.as_str(), zip::write::FileOptions::default())
            .expect("start entry");
        zip.write_all(name.as_bytes()).expect("write entry");
    }
    zip.finish().expect("finish bundle");
    sha512_hex(&fs::read(path).expect("read bundle"))
}

/// Temp layout with calibration, output, and scratch dirs plus run lists.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        for sub in ["gcd", "out", "scratch"] {
            fs::create_dir_all(dir.path().join(sub)).expect("mkdir");
        }
        fs::write(
            dir.path().join(format!("gcd/Level2_IC86.2022_data_Run{RUN:08}_GCD.i3.zst")),
            b"gcd",
        )
        .expect("write gcd");
        fs::write(dir.path().join("grl.txt"), format!("{RUN}\n")).expect("write grl");
        fs::write(dir.path().join("bad.txt"), "# none\n").expect("write bad files");
        Workspace { dir }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Config with shell stand-ins for the external tools.
    pub fn write_config(&self, transform: &str) -> PathBuf {
        let config = serde_json::json!({
            "transform": ["sh", "-c", transform, "transform", "{input}", "{output}"],
            "output_check": null,
            "calibration_check": null,
            "output_validate": ["test", "-s", "{output}"],
            "remote_fetch": ["cp", "{remote}", "{dest_dir}/"],
            "auxiliary_suffixes": [],
            "retrieval": {"attempts": 2, "delay_seconds": 0}
        });
        let path = self.path("config.json");
        fs::write(&path, serde_json::to_string_pretty(&config).expect("config json"))
            .expect("write config");
        path
    }

    /// `brp run` against `bundle` with the usual list and dir flags.
    pub fn run_command(&self, bundle: &Path, checksum: &str, config: &Path) -> Command {
        let mut cmd = brp();
        cmd.arg("run")
            .arg("--gcd-dir")
            .arg(self.path("gcd"))
            .arg("--bundle")
            .arg(bundle)
            .arg("--checksum")
            .arg(checksum)
            .arg("--out-dir")
            .arg(self.path("out"))
            .arg("--scratch-dir")
            .arg(self.path("scratch"))
            .arg("--grl")
            .arg(self.path("grl.txt"))
            .arg("--bad-files")
            .arg(self.path("bad.txt"))
            .arg("--workers")
            .arg("2")
            .arg("--config")
            .arg(config);
        cmd
    }
}
