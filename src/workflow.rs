use crate::catalog::{CatalogSink, HttpCatalog};
use crate::cli::{
    ConvertGrlArgs, DedupArgs, DigestArgs, InitConfigArgs, ReconcileArgs, RunArgs,
    SummarizeRunArgs,
};
use crate::config::{self, PipelineConfig};
use crate::dedup;
use crate::error::PipelineError;
use crate::integrity;
use crate::lists::{self, BadFiles, ChecksumLedger};
use crate::orchestrator::{self, BatchRequest};
use crate::reconcile;
use crate::retrieval::{BundleRetrieval, CommandFetch, RemoteFetch, RetryPolicy};
use crate::summary;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub fn run_bundle(args: RunArgs) -> Result<()> {
    let config = config::resolve_config(args.config.as_deref())?;
    check_required_paths(&config)?;
    let checksum = match (&args.checksum.checksum, &args.checksum.ledger) {
        (Some(checksum), _) => checksum.trim().to_string(),
        (None, Some(ledger)) => ledger_checksum(ledger, &args.bundle)?,
        (None, None) => return Err(anyhow!("one of --checksum or --ledger is required")),
    };
    let good_runs = lists::load_good_runs(&args.grl)?;
    let bad_files = BadFiles::load(&args.bad_files)?;
    let skip = args
        .skip_list
        .as_deref()
        .map(dedup::load_skip_list)
        .transpose()?;
    tracing::info!(
        bundle = %args.bundle.display(),
        good_runs = good_runs.len(),
        bad_files = bad_files.len(),
        skip_members = skip.as_ref().map_or(0, |skip| skip.skip_members.len()),
        "starting run"
    );

    let fetch = args
        .transfer_bundle
        .then(|| CommandFetch::new(config.remote_fetch.clone()));
    let retrieval = BundleRetrieval {
        scratch_dir: &args.scratch_dir,
        remote: fetch.as_ref().map(|fetch| fetch as &dyn RemoteFetch),
        policy: RetryPolicy::from(&config.retrieval),
    };
    let request = BatchRequest {
        calibration_dir: &args.gcd_dir,
        bundle: &args.bundle,
        checksum: &checksum,
        out_dir: &args.out_dir,
        scratch_dir: &args.scratch_dir,
        good_runs: &good_runs,
        bad_files: &bad_files,
        skip: skip.as_ref(),
    };
    let batch = orchestrator::prepare_inputs(&request, &retrieval, &config)?;

    let catalog = match (&args.catalog_url, &args.catalog_token) {
        (Some(url), Some(token)) => Some(
            Arc::new(HttpCatalog::new(url, token, &config.catalog)) as Arc<dyn CatalogSink>
        ),
        _ => None,
    };
    orchestrator::run_batch(&batch, Arc::new(config), catalog, args.workers)?;
    let record = orchestrator::accounting_path(&batch.out_dir, &batch.bundle_key)?;
    println!("{}", record.display());
    Ok(())
}

fn ledger_checksum(ledger_path: &Path, bundle: &Path) -> Result<String> {
    let ledger = ChecksumLedger::load(ledger_path)?;
    ledger
        .checksum(&bundle.display().to_string())
        .map(str::to_string)
        .ok_or_else(|| {
            PipelineError::not_found(
                format!("checksum ledger entry in {}", ledger_path.display()),
                bundle,
            )
            .into()
        })
}

fn check_required_paths(config: &PipelineConfig) -> Result<()> {
    match config.required_paths.iter().find(|path| !path.exists()) {
        Some(missing) => Err(PipelineError::not_found("required path", missing).into()),
        None => Ok(()),
    }
}

pub fn run_dedup(args: DedupArgs) -> Result<()> {
    let config = config::resolve_config(args.config.as_deref())?;
    let ledger = ChecksumLedger::load(&args.ledger)?;
    if ledger.is_empty() {
        return Err(PipelineError::not_found("bundles in checksum ledger", &args.ledger).into());
    }
    tracing::info!(bundles = ledger.len(), "resolving duplicates");
    let fetch = args
        .transfer_bundle
        .then(|| CommandFetch::new(config.remote_fetch.clone()));
    let retrieval = BundleRetrieval {
        scratch_dir: &args.scratch_dir,
        remote: fetch.as_ref().map(|fetch| fetch as &dyn RemoteFetch),
        policy: RetryPolicy::from(&config.retrieval),
    };
    let locals = dedup::locate_bundles(&ledger, &retrieval)?;
    let records = dedup::resolve(&ledger.bundles(), &locals)?;
    let written = dedup::write_skip_lists(&args.out_dir, &records)?;
    let skipped = records
        .values()
        .map(|record| record.skip_members.len())
        .sum::<usize>();
    tracing::info!(
        bundles = records.len(),
        skipped,
        out_dir = %args.out_dir.display(),
        "skip lists written"
    );
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

pub fn run_reconcile(args: ReconcileArgs) -> Result<()> {
    let output = reconcile::load_output_accounting(&args.output)?;
    let input = reconcile::load_input_accounting(&args.input)?;
    let (is_valid, summary) = reconcile::reconcile(&output, &input);

    let comparison_dir = match &args.comparison_dir {
        Some(dir) => dir.clone(),
        None => args
            .output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    let written = reconcile::write_uuid_comparisons(&comparison_dir, &summary)?;
    tracing::info!(
        comparisons = written.len(),
        dir = %comparison_dir.display(),
        "comparison artifacts written"
    );
    let text = serde_json::to_string_pretty(&summary).context("serialize summary")?;
    println!("{text}");
    if is_valid {
        Ok(())
    } else {
        Err(PipelineError::ReconciliationMismatch {
            problems: summary.problem_count(),
        }
        .into())
    }
}

pub fn run_summarize(args: SummarizeRunArgs) -> Result<()> {
    let paths = summary::summarize_run(
        args.run,
        &args.search_dir,
        args.search_days,
        args.output_dir.as_deref(),
    )?;
    println!(
        "{} ({} files)\n{} ({} files)",
        paths.inputs.display(),
        paths.input_count,
        paths.outputs.display(),
        paths.output_count
    );
    Ok(())
}

pub fn run_convert_grl(args: ConvertGrlArgs) -> Result<()> {
    let text = fs::read_to_string(&args.infile)
        .with_context(|| format!("read {}", args.infile.display()))?;
    let runs = lists::convert_run_status_csv(&text)?;
    lists::write_good_runs(&args.outfile, &runs)?;
    tracing::info!(runs = runs.len(), outfile = %args.outfile.display(), "good-run list written");
    Ok(())
}

pub fn run_digest(args: DigestArgs) -> Result<()> {
    let Some(expected) = args.expect else {
        println!("{}  {}", integrity::digest(&args.file)?, args.file.display());
        return Ok(());
    };
    if !integrity::verify(&args.file, &expected)? {
        return Err(anyhow!(
            "digest mismatch for {}: expected {}",
            args.file.display(),
            expected.trim()
        ));
    }
    println!("{}: OK", args.file.display());
    Ok(())
}

pub fn run_init_config(args: InitConfigArgs) -> Result<()> {
    let Some(out) = args.out else {
        println!("{}", config::config_stub()?);
        return Ok(());
    };
    if out.is_file() && !args.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            out.display()
        ));
    }
    config::write_config(&out, &config::default_config())?;
    println!("{}", out.display());
    Ok(())
}
