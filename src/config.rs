//! Pipeline configuration.
//!
//! An optional JSON file supplies the external stage commands and naming
//! conventions. Every field has a default that reproduces the production
//! reprocessing setup, so a config file only needs the fields it changes.
use crate::exec::CommandTemplate;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub schema_version: u32,
    /// `{input}`, `{calibration}`, `{output}`.
    pub transform: CommandTemplate,
    /// Post-transform monitoring check: `{output}`, `{calibration}`.
    pub output_check: Option<CommandTemplate>,
    /// Structural validity check of a finished output: `{output}`.
    pub output_validate: CommandTemplate,
    /// Calibration sanity check: `{calibration}`.
    pub calibration_check: Option<CommandTemplate>,
    /// Remote fetch: `{remote}`, `{dest_dir}`.
    pub remote_fetch: CommandTemplate,
    pub output_prefix: String,
    pub output_extension: String,
    /// Substring an archive entry must contain to be a job input.
    pub member_pattern: String,
    /// Monitoring artifacts written next to the output as `<output><suffix>`.
    pub auxiliary_suffixes: Vec<String>,
    /// Paths that must exist before a batch starts.
    pub required_paths: Vec<PathBuf>,
    /// Count a valid output left by an earlier run (a WARNING outcome) as
    /// completed. Off: only SUCCESS completes an input.
    pub accept_existing_outputs: bool,
    pub retrieval: RetrievalSettings,
    pub catalog: CatalogSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalSettings {
    pub attempts: u32,
    pub delay_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogSettings {
    pub site: String,
    pub logical_root: String,
    pub timeout_seconds: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        RetrievalSettings {
            attempts: 5,
            delay_seconds: 10,
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        CatalogSettings {
            site: "TACC".to_string(),
            logical_root: "/data/exp/IceCube".to_string(),
            timeout_seconds: 60,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        default_config()
    }
}

const STEP1_SCRIPTS: &str = "/opt/pass3/scripts/icetray/step1";

pub fn default_config() -> PipelineConfig {
    PipelineConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        transform: CommandTemplate::new([
            "python3".to_string(),
            format!("{STEP1_SCRIPTS}/pass3_reprocess_PFRaw.py"),
            "-i".to_string(),
            "{input}".to_string(),
            "-g".to_string(),
            "{calibration}".to_string(),
            "-o".to_string(),
            "{output}".to_string(),
            "--qify".to_string(),
        ]),
        output_check: Some(CommandTemplate::new([
            "python3".to_string(),
            format!("{STEP1_SCRIPTS}/pass3_check_charge_filter.py"),
            "-i".to_string(),
            "{output}".to_string(),
            "-g".to_string(),
            "{calibration}".to_string(),
            "-o".to_string(),
            "{output}".to_string(),
        ])),
        output_validate: CommandTemplate::new([
            "sh",
            "-c",
            "exec python3 \"$I3_BUILD/dataio/resources/examples/scan.py\" -c \"$1\"",
            "scan",
            "{output}",
        ]),
        calibration_check: Some(CommandTemplate::new([
            "python3".to_string(),
            format!("{STEP1_SCRIPTS}/pass3_check_gcd.py"),
            "-g".to_string(),
            "{calibration}".to_string(),
            "--corrections".to_string(),
            "/opt/pass3/data/average_FADC_gain_bias_corrections.json".to_string(),
        ])),
        remote_fetch: CommandTemplate::new(["scp", "ranch.tacc.utexas.edu:{remote}", "{dest_dir}/"]),
        output_prefix: "Pass3_Step1".to_string(),
        output_extension: ".i3.zst".to_string(),
        member_pattern: ".tar.gz".to_string(),
        auxiliary_suffixes: [
            ".npz",
            ".fadc_atwd_charge.npz",
            ".fadc_atwd_charge.npz.comparison",
            ".txt",
        ]
        .into_iter()
        .map(str::to_string)
        .collect(),
        required_paths: Vec::new(),
        accept_existing_outputs: false,
        retrieval: RetrievalSettings::default(),
        catalog: CatalogSettings::default(),
    }
}

/// Render a pretty JSON config stub with every default spelled out.
pub fn config_stub() -> Result<String> {
    serde_json::to_string_pretty(&default_config()).context("serialize config stub")
}

pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: PipelineConfig =
        serde_json::from_slice(&bytes).context("parse pipeline config JSON")?;
    Ok(config)
}

/// Load `path` when given, else the defaults; validated either way.
pub fn resolve_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    validate_config(&config)?;
    for warning in program_warnings(&config) {
        tracing::warn!("{warning}");
    }
    Ok(config)
}

pub fn write_config(path: &Path, config: &PipelineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create config dir")?;
    }
    let text = serde_json::to_string_pretty(config).context("serialize pipeline config")?;
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported pipeline config schema_version {}",
            config.schema_version
        ));
    }
    validate_template("transform", &config.transform, &["input", "output"])?;
    if let Some(template) = &config.output_check {
        validate_template("output_check", template, &["output"])?;
    }
    validate_template("output_validate", &config.output_validate, &["output"])?;
    if let Some(template) = &config.calibration_check {
        validate_template("calibration_check", template, &["calibration"])?;
    }
    validate_template("remote_fetch", &config.remote_fetch, &["remote"])?;
    if config.output_prefix.trim().is_empty() {
        return Err(anyhow!("output_prefix must be non-empty"));
    }
    if !config.output_extension.starts_with('.') {
        return Err(anyhow!(
            "output_extension must start with '.' (got {:?})",
            config.output_extension
        ));
    }
    if config.member_pattern.is_empty() {
        return Err(anyhow!("member_pattern must be non-empty"));
    }
    if let Some(suffix) = config.auxiliary_suffixes.iter().find(|s| s.is_empty()) {
        return Err(anyhow!("auxiliary_suffixes entries must be non-empty (got {suffix:?})"));
    }
    if config.retrieval.attempts == 0 {
        return Err(anyhow!("retrieval.attempts must be at least 1"));
    }
    Ok(())
}

fn validate_template(label: &str, template: &CommandTemplate, required: &[&str]) -> Result<()> {
    match template.program() {
        Some(program) if !program.trim().is_empty() => {}
        _ => return Err(anyhow!("{label} command must be non-empty")),
    }
    for placeholder in required {
        if !template.mentions(placeholder) {
            return Err(anyhow!("{label} command must reference {{{placeholder}}}"));
        }
    }
    Ok(())
}

/// Programs named by the configured commands that are not on PATH.
pub fn program_warnings(config: &PipelineConfig) -> Vec<String> {
    let mut templates = vec![
        ("transform", &config.transform),
        ("output_validate", &config.output_validate),
        ("remote_fetch", &config.remote_fetch),
    ];
    if let Some(template) = &config.output_check {
        templates.push(("output_check", template));
    }
    if let Some(template) = &config.calibration_check {
        templates.push(("calibration_check", template));
    }
    templates
        .into_iter()
        .filter_map(|(label, template)| {
            let program = template.program()?;
            which::which(program)
                .err()
                .map(|_| format!("{label} program {program:?} not found on PATH"))
        })
        .collect()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
