//! TOML configuration for the harvester.
//!
//! The whole option surface is parsed once at startup into [`Config`] and
//! handed to every component by reference. See `config/harvest.example.toml`
//! for a complete file.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub identity_db: PathBuf,
    #[serde(default)]
    pub identity_updates: Option<PathBuf>,
    #[serde(default)]
    pub ledger_db: Option<PathBuf>,
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Completion ledger location, defaulting to a file in the output root.
    pub fn ledger_db(&self) -> PathBuf {
        self.ledger_db
            .clone()
            .unwrap_or_else(|| self.output_root.join("CompletedFiles.sqlite"))
    }

    /// Private scratch area for in-flight jobs.
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.output_root.join("Processing"))
    }
}

/// Recording system the source files come from. Selects the decoder's
/// parsing mode.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SystemKind {
    #[serde(rename = "u")]
    Unity,
    #[serde(rename = "p")]
    PhilipsClassic,
    #[serde(rename = "cs")]
    Carescape,
    #[serde(rename = "pix")]
    PhilipsPiicix,
}

impl SystemKind {
    /// Decoder flag for this system, e.g. `-cs`.
    pub fn flag(&self) -> &'static str {
        match self {
            SystemKind::Unity => "-u",
            SystemKind::PhilipsClassic => "-p",
            SystemKind::Carescape => "-cs",
            SystemKind::PhilipsPiicix => "-pix",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_decoder")]
    pub decoder: PathBuf,
    #[serde(default = "default_encoder")]
    pub encoder: PathBuf,
    #[serde(default = "default_system")]
    pub system: SystemKind,
    #[serde(default)]
    pub wave_data: bool,
    #[serde(default)]
    pub single_output_file: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decoder: default_decoder(),
            encoder: default_encoder(),
            system: default_system(),
            wave_data: false,
            single_output_file: false,
        }
    }
}

fn default_decoder() -> PathBuf {
    PathBuf::from("StpToolkit")
}
fn default_encoder() -> PathBuf {
    PathBuf::from("formatconverter")
}
fn default_system() -> SystemKind {
    SystemKind::Carescape
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub delete_source_on_success: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            job_timeout_secs: default_job_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            delete_source_on_success: false,
        }
    }
}

impl PipelineConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_workers() -> usize {
    6
}
fn default_job_timeout_secs() -> u64 {
    10 * 60 * 60
}
fn default_poll_interval_secs() -> u64 {
    10 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct NamingConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_date_width")]
    pub date_width: usize,
    #[serde(default = "default_epoch_anchor")]
    pub epoch_anchor: NaiveDate,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            date_width: default_date_width(),
            epoch_anchor: default_epoch_anchor(),
        }
    }
}

fn default_prefix() -> String {
    "UVA".to_string()
}
fn default_date_width() -> usize {
    5
}
fn default_epoch_anchor() -> NaiveDate {
    NaiveDate::from_ymd_opt(1969, 12, 31).unwrap_or_default()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration text. Does not touch the filesystem.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.pipeline.workers == 0 {
        bail!("pipeline.workers must be >= 1");
    }
    if config.pipeline.job_timeout_secs == 0 {
        bail!("pipeline.job_timeout_secs must be >= 1");
    }
    if config.pipeline.poll_interval_secs == 0 {
        bail!("pipeline.poll_interval_secs must be >= 1");
    }
    if !(1..=9).contains(&config.naming.date_width) {
        bail!("naming.date_width must be in [1, 9]");
    }
    if config.naming.prefix.is_empty() || config.naming.prefix.contains(['/', '\\']) {
        bail!("naming.prefix must be a non-empty file name fragment");
    }

    Ok(config)
}

impl Config {
    /// Fatal startup checks. Runs before the control loop starts.
    pub fn check_paths(&self) -> Result<()> {
        let mut dirs = vec![
            ("paths.input_root", &self.paths.input_root),
            ("paths.output_root", &self.paths.output_root),
        ];
        if let Some(updates) = &self.paths.identity_updates {
            dirs.push(("paths.identity_updates", updates));
        }
        for (key, dir) in dirs {
            if !dir.is_dir() {
                bail!("{} does not exist or is not a directory: {}", key, dir.display());
            }
        }

        if !self.paths.identity_db.is_file() {
            bail!(
                "paths.identity_db does not exist: {}",
                self.paths.identity_db.display()
            );
        }

        // The input walk is recursive; it must not reach routed files
        let input = resolve(&self.paths.input_root);
        for (key, dir) in [
            ("paths.output_root", self.paths.output_root.clone()),
            ("paths.scratch_dir", self.paths.scratch_dir()),
        ] {
            if resolve(&dir).starts_with(&input) {
                bail!(
                    "{} must not be inside paths.input_root: {}",
                    key,
                    dir.display()
                );
            }
        }

        Ok(())
    }
}

/// Canonical form of `path`, resolving through its nearest existing
/// ancestor when the path itself does not exist yet.
fn resolve(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}
