//! Smaller subcommands: dedup, summarize-run, convert-grl, digest, init-config.

mod common;

use common::{brp, member, sha512_hex, stderr, stdout, write_bundle};
use serde_json::Value;
use std::fs;

#[test]
fn dedup_assigns_shared_member_to_first_bundle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundle_a = dir.path().join("archive/bundleA.zip");
    let bundle_b = dir.path().join("archive/bundleB.zip");
    let sum_a = write_bundle(&bundle_a, &[member(1), member(2)]);
    let sum_b = write_bundle(&bundle_b, &[member(2), member(3)]);
    for (name, files) in [("bundleA", [1, 2]), ("bundleB", [2, 3])] {
        let manifest = files
            .iter()
            .map(|file| {
                serde_json::json!({"logical_name": format!("/data/exp/PFRaw/{}", member(*file))})
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(dir.path().join(format!("archive/{name}.ndjson")), manifest)
            .expect("write manifest");
    }
    let ledger = dir.path().join("ledger.txt");
    fs::write(
        &ledger,
        format!(
            "{sum_b} {}\n{sum_a} {}\n",
            bundle_b.display(),
            bundle_a.display()
        ),
    )
    .expect("write ledger");

    let out = dir.path().join("skip");
    let output = brp()
        .arg("dedup")
        .arg("--ledger")
        .arg(&ledger)
        .arg("--scratch-dir")
        .arg(dir.path().join("scratch"))
        .arg("--out-dir")
        .arg(&out)
        .output()
        .expect("run brp");
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let written = stdout(&output)
        .lines()
        .map(std::path::PathBuf::from)
        .collect::<Vec<_>>();
    assert_eq!(written.len(), 2);
    let read = |prefix: &str| -> Value {
        let path = written
            .iter()
            .find(|path| {
                let name = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();
                name.starts_with(prefix) && name.ends_with(".skip.json")
            })
            .expect("skip list path");
        assert_eq!(path.parent(), Some(out.as_path()));
        serde_json::from_slice(&fs::read(path).expect("skip list")).expect("parse")
    };
    let a = read("bundleA.zip.");
    let b = read("bundleB.zip.");
    assert_eq!(a["skip_members"], Value::Array(Vec::new()));
    assert_eq!(b["skip_members"], serde_json::json!([member(2)]));
    assert_eq!(b["winners"][member(2)], bundle_a.display().to_string());
}

#[test]
fn summarize_run_writes_both_summaries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let day = dir.path().join("2022/0131");
    fs::create_dir_all(&day).expect("mkdir");
    let manifest = [1, 2]
        .iter()
        .map(|file| serde_json::json!({"logical_name": member(*file), "uuid": "u1"}).to_string())
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(day.join("u1.ndjson"), manifest).expect("manifest");

    let output = brp()
        .arg("summarize-run")
        .arg("133910")
        .arg(&day)
        .arg("--search-days")
        .arg("0")
        .output()
        .expect("run brp");
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let inputs: Value = serde_json::from_slice(
        &fs::read(day.join("Run133910_PFRaw_summary.json")).expect("inputs"),
    )
    .expect("parse");
    assert_eq!(inputs["total_files"], 2);
    assert_eq!(inputs["file_type"], "PFRaw");
    let outputs: Value = serde_json::from_slice(
        &fs::read(day.join("Run133910_Pass3_summary.json")).expect("outputs"),
    )
    .expect("parse");
    assert_eq!(outputs["total_files"], 0);
}

#[test]
fn convert_grl_keeps_good_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let csv = dir.path().join("runs.csv");
    fs::write(
        &csv,
        "133910,2020-01-01,x,GOOD,a,b\n133911,2020-01-01,x,BAD,a,b\n133912,2020-01-02,y,GOOD,a,b\n",
    )
    .expect("write csv");
    let grl = dir.path().join("grl.txt");

    let output = brp()
        .arg("convert-grl")
        .arg("--infile")
        .arg(&csv)
        .arg("--outfile")
        .arg(&grl)
        .output()
        .expect("run brp");
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(fs::read_to_string(grl).expect("grl"), "133910\n133912\n");
}

#[test]
fn digest_prints_and_verifies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("payload.bin");
    fs::write(&file, b"payload").expect("write");
    let expected = sha512_hex(b"payload");

    let printed = brp().arg("digest").arg(&file).output().expect("run brp");
    assert!(printed.status.success());
    assert!(stdout(&printed).starts_with(&expected));

    let ok = brp()
        .arg("digest")
        .arg(&file)
        .arg("--expect")
        .arg(&expected)
        .output()
        .expect("run brp");
    assert!(ok.status.success());

    let bad = brp()
        .arg("digest")
        .arg(&file)
        .arg("--expect")
        .arg(sha512_hex(b"other"))
        .output()
        .expect("run brp");
    assert_eq!(bad.status.code(), Some(1));
}

#[test]
fn init_config_refuses_to_overwrite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("brp.json");

    let first = brp()
        .arg("init-config")
        .arg("--out")
        .arg(&path)
        .output()
        .expect("run brp");
    assert!(first.status.success(), "stderr: {}", stderr(&first));
    let config: Value =
        serde_json::from_slice(&fs::read(&path).expect("config")).expect("parse");
    assert_eq!(config["schema_version"], 1);

    let second = brp()
        .arg("init-config")
        .arg("--out")
        .arg(&path)
        .output()
        .expect("run brp");
    assert!(!second.status.success());
    assert!(stderr(&second).contains("--force"));
}
