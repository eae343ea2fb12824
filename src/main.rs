use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod catalog;
mod cli;
mod config;
mod dedup;
mod error;
mod exec;
mod filename;
mod integrity;
mod job;
mod lists;
mod manifest;
mod orchestrator;
mod reconcile;
mod retrieval;
mod staging;
mod summary;
mod workflow;

use cli::{Command, RootArgs};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = RootArgs::parse();
    let result = match args.command {
        Command::Run(args) => workflow::run_bundle(args),
        Command::Dedup(args) => workflow::run_dedup(args),
        Command::Reconcile(args) => workflow::run_reconcile(args),
        Command::SummarizeRun(args) => workflow::run_summarize(args),
        Command::ConvertGrl(args) => workflow::run_convert_grl(args),
        Command::Digest(args) => workflow::run_digest(args),
        Command::InitConfig(args) => workflow::run_init_config(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(error::exit_code_for(&err))
        }
    }
}
