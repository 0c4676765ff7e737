#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_RINGPING_PORT: u16 = 8080;
pub const DEFAULT_RINGPING_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_INFO_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_TRIM_BUFFER_SECS: f64 = 5.0;

pub const DATABASE_FILE: &str = "ringping.db";
const DOWNLOADS_SUBDIR: &str = "downloads";

/// Everything the server and the maintenance binaries need to know about
/// their surroundings, resolved once at startup and then passed down.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_root: PathBuf,
    pub downloads_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub info_timeout: Duration,
    pub tool_timeout: Duration,
    pub precise_trim: bool,
    pub trim_buffer_secs: f64,
}

impl RuntimeConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_root.join(DATABASE_FILE)
    }
}

/// Values passed on the command line. They win over both the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub downloads_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_root = overrides
        .data_root
        .or_else(|| lookup("RINGPING_DATA_ROOT").map(PathBuf::from))
        .ok_or_else(|| anyhow!("RINGPING_DATA_ROOT not set"))?;
    let downloads_root = overrides
        .downloads_root
        .or_else(|| lookup("RINGPING_DOWNLOADS_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| data_root.join(DOWNLOADS_SUBDIR));
    let port = overrides
        .port
        .or_else(|| lookup("RINGPING_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_RINGPING_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("RINGPING_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_RINGPING_HOST.to_string());
    let base_url = lookup("RINGPING_BASE_URL")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{host}:{port}"));

    let ytdlp_bin = lookup("RINGPING_YTDLP_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let ffmpeg_bin = lookup("RINGPING_FFMPEG_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_BIN));

    let info_timeout = lookup("RINGPING_INFO_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_INFO_TIMEOUT_SECS);
    let tool_timeout = lookup("RINGPING_TOOL_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS);
    let precise_trim = lookup("RINGPING_PRECISE_TRIM")
        .map(|value| parse_bool(&value).with_context(|| "parsing RINGPING_PRECISE_TRIM"))
        .transpose()?
        .unwrap_or(false);
    let trim_buffer_secs = lookup("RINGPING_TRIM_BUFFER_SECS")
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .unwrap_or(DEFAULT_TRIM_BUFFER_SECS);

    Ok(RuntimeConfig {
        data_root,
        downloads_root,
        host,
        port,
        base_url,
        ytdlp_bin,
        ffmpeg_bin,
        info_timeout: Duration::from_secs(info_timeout),
        tool_timeout: Duration::from_secs(tool_timeout),
        precise_trim,
        trim_buffer_secs,
    })
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got {other:?}")),
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
