//! CLI argument parsing for the bundle reprocessing pipeline.
//!
//! Every subcommand maps onto one workflow entry point; policy lives in the
//! pipeline config, not in flags.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "brp",
    version,
    about = "Reprocess archived detector-data bundles and reconcile their accounting",
    after_help = "Commands:\n  run --bundle <zip> ...                  Reprocess one bundle (writes <bundle>.json)\n  dedup --ledger <file> ...               Write per-bundle skip lists for shared members\n  reconcile <output> <input>              Compare output vs input accounting\n  summarize-run <run> <dir>               Per-run input/output summaries\n  convert-grl --infile <csv> --outfile <txt>\n  digest <file> [--expect <hex>]\n  init-config --out <file>\n\nExamples:\n  brp run --gcd-dir /gcd --bundle /archive/2022/0131/u1.zip --checksum <hex> \\\n      --out-dir /out/2022/0131 --scratch-dir /scratch --grl grl.txt --bad-files bad.txt --workers 8\n  brp reconcile /out/2022/0131/u1.zip.json /archive/2022/0131/u1.ndjson",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Dedup(DedupArgs),
    Reconcile(ReconcileArgs),
    SummarizeRun(SummarizeRunArgs),
    ConvertGrl(ConvertGrlArgs),
    Digest(DigestArgs),
    InitConfig(InitConfigArgs),
}

/// Where the bundle's expected digest comes from.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct ChecksumSource {
    /// Expected SHA-512 of the bundle (hex)
    #[arg(long, value_name = "HEX")]
    pub checksum: Option<String>,

    /// Checksum ledger of `<hex> <archive path>` lines to look the bundle up in
    #[arg(long, value_name = "FILE")]
    pub ledger: Option<PathBuf>,
}

/// Run command inputs for one bundle.
#[derive(Parser, Debug)]
#[command(about = "Reprocess every eligible member of one bundle")]
pub struct RunArgs {
    /// Directory holding per-run calibration (GCD) files
    #[arg(long, value_name = "DIR")]
    pub gcd_dir: PathBuf,

    /// Archive path of the bundle; keys the accounting record
    #[arg(long, value_name = "ZIP")]
    pub bundle: PathBuf,

    /// Directory that receives outputs, logs, and the accounting record
    #[arg(long, value_name = "DIR")]
    pub out_dir: PathBuf,

    /// Scratch space for bundle copies and per-job work dirs
    #[arg(long, value_name = "DIR")]
    pub scratch_dir: PathBuf,

    #[command(flatten)]
    pub checksum: ChecksumSource,

    /// Good-run list, one run number per line
    #[arg(long, value_name = "FILE")]
    pub grl: PathBuf,

    /// Bad-files list, one file name per line
    #[arg(long, value_name = "FILE")]
    pub bad_files: PathBuf,

    /// Maximum concurrent jobs (0 = CPU count)
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub workers: usize,

    /// Allow fetching the bundle from remote storage when no local copy exists
    #[arg(long)]
    pub transfer_bundle: bool,

    /// Skip list written by `dedup` for this bundle
    #[arg(long, value_name = "FILE")]
    pub skip_list: Option<PathBuf>,

    /// Pipeline config JSON (defaults reproduce the production commands)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// File catalog base URL for registering successful outputs
    #[arg(long, value_name = "URL", requires = "catalog_token")]
    pub catalog_url: Option<String>,

    /// Bearer token for the file catalog
    #[arg(long, value_name = "TOKEN", requires = "catalog_url")]
    pub catalog_token: Option<String>,
}

/// Dedup command inputs covering every bundle in a ledger.
#[derive(Parser, Debug)]
#[command(about = "Assign members shared between bundles to exactly one bundle")]
pub struct DedupArgs {
    /// Checksum ledger listing the bundles to consider
    #[arg(long, value_name = "FILE")]
    pub ledger: PathBuf,

    /// Scratch space searched for local bundle copies
    #[arg(long, value_name = "DIR")]
    pub scratch_dir: PathBuf,

    /// Directory that receives `<bundle>.<path hash>.skip.json` files
    #[arg(long, value_name = "DIR")]
    pub out_dir: PathBuf,

    /// Allow fetching bundles from remote storage
    #[arg(long)]
    pub transfer_bundle: bool,

    /// Pipeline config JSON
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Compare an output accounting record against its input manifest")]
pub struct ReconcileArgs {
    /// Run accounting record written by `run`
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Input manifest (NDJSON or JSON array)
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Directory for per-UUID comparison files (default: next to OUTPUT)
    #[arg(long, value_name = "DIR")]
    pub comparison_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Summarize a run's inputs and outputs across nearby dates")]
pub struct SummarizeRunArgs {
    /// Run number
    #[arg(value_name = "RUN")]
    pub run: u64,

    /// Directory holding manifests and accounting records
    #[arg(value_name = "SEARCH_DIR")]
    pub search_dir: PathBuf,

    /// Also search YYYY/MMDD siblings this many days either side
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub search_days: u32,

    /// Where to write the summaries (default: SEARCH_DIR)
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Convert a run-status CSV export into a good-run list")]
pub struct ConvertGrlArgs {
    #[arg(long, value_name = "CSV")]
    pub infile: PathBuf,

    #[arg(long, value_name = "FILE")]
    pub outfile: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "Print or verify the SHA-512 of a file")]
pub struct DigestArgs {
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Expected digest; exit non-zero on mismatch
    #[arg(long, value_name = "HEX")]
    pub expect: Option<String>,
}

#[derive(Parser, Debug)]
#[command(about = "Write a pipeline config with every default spelled out")]
pub struct InitConfigArgs {
    /// Destination (stdout when omitted)
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Overwrite an existing file
    #[arg(long, requires = "out")]
    pub force: bool,
}
