use crate::analysis::MatchConfidence;
use anyhow::{anyhow, bail, Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tray_root: Option<PathBuf>,
    pub mods_root: Option<PathBuf>,
    pub export_root: Option<PathBuf>,
    pub min_match_count: usize,
    pub min_confidence: MatchConfidence,
    pub top_n: usize,
    pub max_package_count: usize,
    pub write_unused_report: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tray_root: None,
            mods_root: None,
            export_root: None,
            min_match_count: 1,
            min_confidence: MatchConfidence::Low,
            top_n: 0,
            max_package_count: 0,
            write_unused_report: false,
        }
    }
}

pub const CONFIG_FIELDS: [&str; 8] = [
    "tray_root",
    "mods_root",
    "export_root",
    "min_match_count",
    "min_confidence",
    "top_n",
    "max_package_count",
    "write_unused_report",
];

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        Self::load_or_create_in(&base_data_dir()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_in(&base_data_dir()?)
    }

    pub fn path() -> Result<PathBuf> {
        Ok(base_data_dir()?.join(CONFIG_FILE))
    }

    fn load_or_create_in(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join(CONFIG_FILE);
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save_in(base_dir)?;
        Ok(config)
    }

    fn save_in(&self, base_dir: &Path) -> Result<()> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(base_dir.join(CONFIG_FILE), raw).context("write app config")?;
        Ok(())
    }

    /// Sets one field from its text form. An empty value clears a path.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match field {
            "tray_root" => self.tray_root = optional_path(value),
            "mods_root" => self.mods_root = optional_path(value),
            "export_root" => self.export_root = optional_path(value),
            "min_match_count" => self.min_match_count = parse_count(field, value)?,
            "min_confidence" => {
                self.min_confidence = value.parse().map_err(|err: String| anyhow!(err))?;
            }
            "top_n" => self.top_n = parse_count(field, value)?,
            "max_package_count" => self.max_package_count = parse_count(field, value)?,
            "write_unused_report" => {
                self.write_unused_report = match value.to_ascii_lowercase().as_str() {
                    "true" | "yes" | "on" | "1" => true,
                    "false" | "no" | "off" | "0" => false,
                    _ => bail!("write_unused_report expects true or false, got {value:?}"),
                };
            }
            _ => bail!(
                "Unknown config field: {field} (use one of: {})",
                CONFIG_FIELDS.join(", ")
            ),
        }
        Ok(())
    }
}

fn optional_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn parse_count(field: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .with_context(|| format!("{field} expects a non-negative number, got {value:?}"))
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve base dirs")?;
    Ok(base.data_local_dir().join("traysmith"))
}
