//! Layered configuration for wattbill: built-in defaults, `default.toml`, an optional
//! per-environment file, then `WATTBILL__SECTION__KEY` environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub billing: BillingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// How long a writer waits for a competing transaction before failing.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/wattbill.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Accepted distance between truncated claimed and computed totals.
    pub total_tolerance: i64,
    /// Decimal places kept on allocated costs.
    pub money_scale: u32,
    /// Decimal places kept on allocated power.
    pub power_scale: u32,
    pub summer_months: Vec<u32>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            total_tolerance: 1,
            money_scale: 4,
            power_scale: 4,
            summer_months: (4..=10).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Directory for a daily rolling log file; stderr only when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Render the effective configuration as TOML.
    pub fn render(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.billing.total_tolerance < 0 {
            bail!("billing.total_tolerance must not be negative");
        }
        if let Some(month) = self
            .billing
            .summer_months
            .iter()
            .find(|month| !(1..=12).contains(*month))
        {
            bail!("billing.summer_months contains invalid month {month}");
        }
        if self.billing.money_scale > 12 || self.billing.power_scale > 12 {
            bail!("billing scales above 12 decimal places are not supported");
        }
        Ok(())
    }
}

/// Load configuration from `config_dir` (default `config/`) for the named environment.
pub fn load_config(config_dir: Option<&Path>, env: Option<&str>) -> Result<AppConfig> {
    let dir = config_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("config"));
    let mut builder =
        Config::builder().add_source(File::from(dir.join("default.toml")).required(false));
    if let Some(env) = env {
        builder = builder.add_source(File::from(dir.join(format!("{env}.toml"))).required(false));
    }
    builder = builder.add_source(
        Environment::with_prefix("WATTBILL")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("billing.summer_months"),
    );
    let cfg: AppConfig = builder
        .build()
        .context("failed to assemble configuration sources")?
        .try_deserialize()
        .context("invalid configuration")?;
    cfg.validate()?;
    Ok(cfg)
}
