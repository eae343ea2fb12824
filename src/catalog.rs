//! Best-effort registration of finished outputs with a file catalog.
use crate::config::CatalogSettings;
use crate::job::OutputRecord;
use crate::retrieval::archive_date;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Receives successful outputs. Failures are reported to the caller, which
/// only logs them.
pub trait CatalogSink: Send + Sync {
    fn register(&self, output: &OutputRecord) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub logical_name: String,
    pub checksum: CatalogChecksum,
    pub file_size: u64,
    pub locations: Vec<CatalogLocation>,
    pub create_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogChecksum {
    pub sha512: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogLocation {
    pub site: String,
    pub path: String,
}

/// `<logical_root>/<YYYY>/unbiased/PFDST/<MMDD>/<file name>`, with the date
/// taken from the output's own directory layout.
pub fn logical_name(output: &Path, logical_root: &str) -> Result<String> {
    let name = output
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("output path has no file name: {}", output.display()))?;
    match archive_date(output) {
        (Some(year), Some(month_day)) => Ok(format!(
            "{}/{year}/unbiased/PFDST/{month_day}/{name}",
            logical_root.trim_end_matches('/')
        )),
        _ => Err(anyhow!(
            "cannot derive YYYY/MMDD from {}",
            output.display()
        )),
    }
}

pub fn catalog_entry(output: &OutputRecord, settings: &CatalogSettings) -> Result<CatalogEntry> {
    let meta = fs::metadata(&output.path)
        .with_context(|| format!("stat {}", output.path.display()))?;
    let modified = meta
        .modified()
        .with_context(|| format!("mtime {}", output.path.display()))?;
    let create_date = chrono::DateTime::<chrono::Utc>::from(modified)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    Ok(CatalogEntry {
        logical_name: logical_name(&output.path, &settings.logical_root)?,
        checksum: CatalogChecksum {
            sha512: output.checksum.clone(),
        },
        file_size: meta.len(),
        locations: vec![CatalogLocation {
            site: settings.site.clone(),
            path: output.path.display().to_string(),
        }],
        create_date,
    })
}

/// POSTs entries to `<base_url>/api/files` with a bearer token.
pub struct HttpCatalog {
    agent: ureq::Agent,
    endpoint: String,
    token: String,
    settings: CatalogSettings,
}

impl HttpCatalog {
    pub fn new(base_url: &str, token: &str, settings: &CatalogSettings) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(settings.timeout_seconds)))
            .build()
            .into();
        HttpCatalog {
            agent,
            endpoint: format!("{}/api/files", base_url.trim_end_matches('/')),
            token: token.to_string(),
            settings: settings.clone(),
        }
    }
}

impl CatalogSink for HttpCatalog {
    fn register(&self, output: &OutputRecord) -> Result<()> {
        let entry = catalog_entry(output, &self.settings)?;
        self.agent
            .post(&self.endpoint)
            .header("Authorization", &format!("Bearer {}", self.token))
            .send_json(&entry)
            .with_context(|| format!("POST {} for {}", self.endpoint, entry.logical_name))?;
        tracing::info!(logical_name = %entry.logical_name, "registered with file catalog");
        Ok(())
    }
}
