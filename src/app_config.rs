//! File configuration for CLI defaults.
//!
//! The file uses flat `key = value` lines with `#` comments:
//!
//! ```text
//! data_dir = "/var/lib/offline"
//! wifi_only = true
//! max_concurrent_transfers = 4   # per process
//! retention_days = 30
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use offline_content::OfflineSettings;
use offline_content::db::DatabaseOptions;

/// Values read from the config file. Unset keys keep library defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Storage root (database, tiers, staging).
    pub data_dir: Option<PathBuf>,
    pub wifi_only: Option<bool>,
    pub max_concurrent_transfers: Option<usize>,
    pub max_retries: Option<u32>,
    pub retention_days: Option<u32>,
    pub auto_download_next_units: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub ephemeral_cache_limit_bytes: Option<u64>,
    /// Database pool max connections (1..=20).
    pub db_max_connections: Option<u32>,
    /// Database busy timeout in milliseconds.
    pub db_busy_timeout_ms: Option<u32>,
}

impl FileConfig {
    /// Validates values against library and database constraints.
    pub fn validate(&self) -> Result<()> {
        let mut settings = OfflineSettings::default();
        self.apply(&mut settings);
        settings.validate()?;
        validate_db_max_connections(self.db_max_connections)?;
        validate_db_busy_timeout_ms(self.db_busy_timeout_ms)?;
        Ok(())
    }

    /// Overlays the configured values onto `settings`.
    pub fn apply(&self, settings: &mut OfflineSettings) {
        if let Some(wifi_only) = self.wifi_only {
            settings.wifi_only = wifi_only;
        }
        if let Some(cap) = self.max_concurrent_transfers {
            settings.max_concurrent_transfers = cap;
        }
        if let Some(retries) = self.max_retries {
            settings.max_retries = retries;
        }
        if self.retention_days.is_some() {
            settings.retention_days = self.retention_days;
        }
        if let Some(next) = self.auto_download_next_units {
            settings.auto_download_next_units = next;
        }
        if let Some(secs) = self.connect_timeout_secs {
            settings.connect_timeout_secs = secs;
        }
        if let Some(secs) = self.read_timeout_secs {
            settings.read_timeout_secs = secs;
        }
        if self.ephemeral_cache_limit_bytes.is_some() {
            settings.ephemeral_cache_limit_bytes = self.ephemeral_cache_limit_bytes;
        }
    }

    /// Pool options with configured overrides.
    #[must_use]
    pub fn database_options(&self) -> DatabaseOptions {
        let mut options = DatabaseOptions::default();
        if let Some(max) = self.db_max_connections {
            options.max_connections = max;
        }
        if let Some(ms) = self.db_busy_timeout_ms {
            options.busy_timeout_ms = ms;
        }
        options
    }
}

fn validate_db_max_connections(value: Option<u32>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=20).contains(&value) {
        bail!("Invalid config value for `db_max_connections`: {value}. Expected range: 1..=20");
    }
    Ok(())
}

fn validate_db_busy_timeout_ms(value: Option<u32>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if value > 120_000 {
        bail!("Invalid config value for `db_busy_timeout_ms`: {value}. Expected range: 0..=120000");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/offline-content/config.toml`
/// 2. `$HOME/.config/offline-content/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("offline-content")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("offline-content")
            .join("config.toml"),
    )
}

/// Default storage root: `$XDG_DATA_HOME/offline-content`, then
/// `$HOME/.local/share/offline-content`, then `./offline-content`.
#[must_use]
pub fn resolve_default_data_dir() -> PathBuf {
    if let Some(xdg_data_home) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data_home).join("offline-content");
    }
    if let Some(home) = env_var_non_empty_os("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("offline-content");
    }
    PathBuf::from("offline-content")
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from an explicit path, or from the default path if present.
pub fn load_file_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(read_file_config(path)?),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path) if path.exists() => Some(read_file_config(path)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "data_dir" => {
                cfg.data_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "wifi_only" => cfg.wifi_only = Some(parse_boolean(value).with_context(context)?),
            "max_concurrent_transfers" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.max_concurrent_transfers = Some(
                    usize::try_from(parsed).with_context(context)?,
                );
            }
            "max_retries" => cfg.max_retries = Some(parse_integer_u32(value).with_context(context)?),
            "retention_days" => {
                cfg.retention_days = Some(parse_integer_u32(value).with_context(context)?);
            }
            "auto_download_next_units" => {
                cfg.auto_download_next_units =
                    Some(parse_integer_u32(value).with_context(context)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "ephemeral_cache_limit_bytes" => {
                cfg.ephemeral_cache_limit_bytes =
                    Some(parse_integer_u64(value).with_context(context)?);
            }
            "db_max_connections" => {
                cfg.db_max_connections = Some(parse_integer_u32(value).with_context(context)?);
            }
            "db_busy_timeout_ms" => {
                cfg.db_busy_timeout_ms = Some(parse_integer_u32(value).with_context(context)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u32(raw_value: &str) -> Result<u32> {
    let value = parse_integer_u64(raw_value)?;
    u32::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u32"))
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
