//! Duplicate resolution across bundles with overlapping membership.
//!
//! Bundles are walked in lexicographic path order and the first bundle to list
//! a file name owns it. Every later bundle listing the same name gets it in
//! its skip list. The assignment needs the whole batch up front, so it runs
//! once before any job is dispatched.
use crate::error::PipelineError;
use crate::integrity;
use crate::lists::ChecksumLedger;
use crate::manifest::{self, Membership};
use crate::retrieval::BundleRetrieval;
use crate::staging::write_json_atomic;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const SKIP_LIST_SUFFIX: &str = ".skip.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub bundle: String,
    pub local_bundle: String,
    pub created_timestamp: String,
    pub manifest_source: String,
    /// Member names another bundle already owns.
    pub skip_members: Vec<String>,
    /// Owning bundle for each skipped member.
    pub winners: BTreeMap<String, String>,
}

impl SkipRecord {
    pub fn skips(&self, member_file_name: &str) -> bool {
        self.winners.contains_key(member_file_name)
    }
}

/// Assign every member name to exactly one bundle.
///
/// Membership is read from `local_path_by_bundle[bundle]` when present, else
/// from the bundle path itself.
pub fn resolve(
    bundles: &[String],
    local_path_by_bundle: &BTreeMap<String, PathBuf>,
) -> Result<BTreeMap<String, SkipRecord>> {
    resolve_with(bundles, local_path_by_bundle, manifest::list_members)
}

fn resolve_with<F>(
    bundles: &[String],
    local_path_by_bundle: &BTreeMap<String, PathBuf>,
    list_members: F,
) -> Result<BTreeMap<String, SkipRecord>>
where
    F: Fn(&Path) -> Result<Membership>,
{
    let ordered = bundles.iter().collect::<BTreeSet<_>>();
    let created_timestamp = chrono::Utc::now().to_rfc3339();
    let mut owner_by_member: BTreeMap<String, String> = BTreeMap::new();
    let mut records = BTreeMap::new();
    for bundle in ordered {
        let local = local_path_by_bundle
            .get(bundle)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(bundle));
        let membership = list_members(&local)
            .with_context(|| format!("list members of {}", local.display()))?;
        let mut skip_members = Vec::new();
        let mut winners = BTreeMap::new();
        for member in membership.members {
            match owner_by_member.get(&member) {
                None => {
                    owner_by_member.insert(member, bundle.clone());
                }
                Some(owner) if owner == bundle => {}
                Some(owner) => {
                    if winners.insert(member.clone(), owner.clone()).is_none() {
                        skip_members.push(member);
                    }
                }
            }
        }
        tracing::info!(
            bundle = %bundle,
            manifest = %membership.source,
            skipped = skip_members.len(),
            "duplicate resolution"
        );
        records.insert(
            bundle.clone(),
            SkipRecord {
                bundle: bundle.clone(),
                local_bundle: local.display().to_string(),
                created_timestamp: created_timestamp.clone(),
                manifest_source: membership.source.to_string(),
                skip_members,
                winners,
            },
        );
    }
    Ok(records)
}

/// Hex digits of the archive-path hash that keep same-named bundles apart.
const PATH_HASH_LEN: usize = 12;

/// `<out_dir>/<bundle file name>.<path hash>.skip.json`
pub fn skip_list_path(out_dir: &Path, bundle: &str) -> Result<PathBuf> {
    let name = Path::new(bundle)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("bundle path has no file name: {bundle}"))?;
    let hash = integrity::digest_bytes(bundle.as_bytes());
    Ok(out_dir.join(format!(
        "{name}.{}{SKIP_LIST_SUFFIX}",
        &hash[..PATH_HASH_LEN]
    )))
}

/// Persist one skip list per bundle. Two bundles mapping to the same file is
/// a validation error rather than a silent overwrite.
pub fn write_skip_lists(
    out_dir: &Path,
    records: &BTreeMap<String, SkipRecord>,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    let mut owner_by_path: BTreeMap<PathBuf, &str> = BTreeMap::new();
    for bundle in records.keys() {
        let path = skip_list_path(out_dir, bundle)?;
        if let Some(previous) = owner_by_path.insert(path.clone(), bundle) {
            return Err(PipelineError::validation(
                "skip list",
                format!("{previous} and {bundle} both map to {}", path.display()),
            )
            .into());
        }
    }
    let mut written = Vec::with_capacity(records.len());
    for (bundle, record) in records {
        let path = skip_list_path(out_dir, bundle)?;
        write_json_atomic(&path, record)?;
        written.push(path);
    }
    Ok(written)
}

pub fn load_skip_list(path: &Path) -> Result<SkipRecord> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut record: SkipRecord =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    // Older lists may carry names without owners.
    for member in &record.skip_members {
        record
            .winners
            .entry(member.clone())
            .or_insert_with(String::new);
    }
    Ok(record)
}

/// Local path to read membership from for every ledger bundle.
///
/// A bundle that is nowhere local (and cannot be fetched) falls back to its
/// archive path; its membership may then be empty. Integrity and retrieval
/// failures abort the batch.
pub fn locate_bundles(
    ledger: &ChecksumLedger,
    retrieval: &BundleRetrieval<'_>,
) -> Result<BTreeMap<String, PathBuf>> {
    let mut locals = BTreeMap::new();
    for bundle in ledger.bundles() {
        let archive = PathBuf::from(&bundle);
        let expected = ledger.checksum(&bundle).unwrap_or_default();
        let local = match retrieval.ensure_local(&archive, expected) {
            Ok(local) => local,
            Err(err)
                if matches!(
                    err.downcast_ref::<PipelineError>(),
                    Some(PipelineError::NotFound { .. })
                ) =>
            {
                tracing::warn!(bundle = %bundle, "bundle not available locally; membership from archive path");
                archive
            }
            Err(err) => return Err(err),
        };
        locals.insert(bundle, local);
    }
    Ok(locals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestSource;

    const SHARED: &str = "Run00133910_Subrun00000000_00000090.tar.gz";

    fn membership(names: &[&str]) -> Membership {
        Membership {
            members: names.iter().map(|name| name.to_string()).collect(),
            source: ManifestSource::Missing,
        }
    }

    fn fixed_lister(path: &Path) -> Result<Membership> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        Ok(match name {
            "bundleA.zip" => membership(&[SHARED, "a_only.tar.gz"]),
            "bundleB.zip" => membership(&["b_only.tar.gz", SHARED]),
            "bundleC.zip" => membership(&[SHARED, "b_only.tar.gz", SHARED]),
            _ => membership(&[]),
        })
    }

    fn bundles(names: &[&str]) -> Vec<String> {
        names
            .iter()
            .map(|name| format!("/archive/2020/0420/{name}"))
            .collect()
    }

    #[test]
    fn earlier_bundle_wins_shared_member() {
        let records = resolve_with(
            &bundles(&["bundleB.zip", "bundleA.zip"]),
            &BTreeMap::new(),
            fixed_lister,
        )
        .expect("resolve");
        let a = &records["/archive/2020/0420/bundleA.zip"];
        let b = &records["/archive/2020/0420/bundleB.zip"];
        assert!(a.skip_members.is_empty());
        assert_eq!(b.skip_members, vec![SHARED.to_string()]);
        assert_eq!(b.winners[SHARED], "/archive/2020/0420/bundleA.zip");
        assert!(b.skips(SHARED));
        assert!(!b.skips("b_only.tar.gz"));
    }

    #[test]
    fn every_member_has_exactly_one_owner() {
        let all = bundles(&["bundleC.zip", "bundleA.zip", "bundleB.zip"]);
        let records = resolve_with(&all, &BTreeMap::new(), fixed_lister).expect("resolve");
        let mut owners: BTreeMap<String, usize> = BTreeMap::new();
        for bundle in &all {
            let listed = fixed_lister(Path::new(bundle)).expect("list").members;
            let record = &records[bundle];
            for member in listed.into_iter().collect::<BTreeSet<_>>() {
                if !record.skips(&member) {
                    *owners.entry(member).or_default() += 1;
                }
            }
        }
        assert!(owners.values().all(|count| *count == 1), "{owners:?}");
        let c = &records["/archive/2020/0420/bundleC.zip"];
        assert_eq!(c.skip_members, vec![SHARED.to_string(), "b_only.tar.gz".to_string()]);
    }

    #[test]
    fn resolution_is_deterministic_across_input_orders() {
        let forward = resolve_with(
            &bundles(&["bundleA.zip", "bundleB.zip", "bundleC.zip"]),
            &BTreeMap::new(),
            fixed_lister,
        )
        .expect("forward");
        let reverse = resolve_with(
            &bundles(&["bundleC.zip", "bundleB.zip", "bundleA.zip"]),
            &BTreeMap::new(),
            fixed_lister,
        )
        .expect("reverse");
        for (bundle, record) in &forward {
            assert_eq!(record.skip_members, reverse[bundle].skip_members);
            assert_eq!(record.winners, reverse[bundle].winners);
        }
    }

    #[test]
    fn skip_lists_persist_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("bundleA.ndjson"), format!("\"{SHARED}\"\n")).expect("write");
        fs::write(
            dir.path().join("bundleB.ndjson"),
            format!("{{\"logical_name\": \"/data/{SHARED}\"}}\n"),
        )
        .expect("write");
        let names = vec![
            dir.path().join("bundleA.zip").display().to_string(),
            dir.path().join("bundleB.zip").display().to_string(),
        ];
        let records = resolve(&names, &BTreeMap::new()).expect("resolve");
        let out = dir.path().join("out");
        let written = write_skip_lists(&out, &records).expect("write");
        assert_eq!(written.len(), 2);
        let b = load_skip_list(&skip_list_path(&out, &names[1]).expect("path")).expect("load");
        assert_eq!(b.skip_members, vec![SHARED.to_string()]);
        assert!(b.manifest_source.ends_with("bundleB.ndjson"));
    }

    #[test]
    fn same_named_bundles_keep_separate_skip_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("a/0420/bundle.zip");
        let second = dir.path().join("b/0421/bundle.zip");
        for bundle in [&first, &second] {
            let parent = bundle.parent().expect("parent");
            fs::create_dir_all(parent).expect("mkdir");
            fs::write(parent.join("bundle.ndjson"), format!("\"{SHARED}\"\n")).expect("write");
        }
        let names = vec![first.display().to_string(), second.display().to_string()];
        let records = resolve(&names, &BTreeMap::new()).expect("resolve");
        let out = dir.path().join("out");
        let written = write_skip_lists(&out, &records).expect("write");
        assert_eq!(written.len(), 2);
        assert_ne!(written[0], written[1]);

        let winner = load_skip_list(&skip_list_path(&out, &names[0]).expect("path")).expect("load");
        assert_eq!(winner.bundle, names[0]);
        assert!(winner.skip_members.is_empty());
        let loser = load_skip_list(&skip_list_path(&out, &names[1]).expect("path")).expect("load");
        assert_eq!(loser.skip_members, vec![SHARED.to_string()]);
        assert_eq!(loser.winners[SHARED], names[0]);
    }
}
