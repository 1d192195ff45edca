#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_YTDLP_PROGRAM: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_PROGRAM: &str = "ffmpeg";
pub const CACHE_DIR_NAME: &str = "tubereel";

pub const CACHE_DIR_KEY: &str = "TUBEREEL_CACHE_DIR";
pub const YTDLP_KEY: &str = "TUBEREEL_YTDLP";
pub const FFMPEG_KEY: &str = "TUBEREEL_FFMPEG";

/// Where the cache lives and which external programs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub cache_root: PathBuf,
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
}

/// Values given on the command line; these beat the environment, which
/// beats the env file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub cache_root: Option<PathBuf>,
    pub yt_dlp: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_paths(
        &file_vars,
        env_var_string,
        overrides,
        default_cache_root(),
    ))
}

fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
    default_cache_root: PathBuf,
) -> RuntimePaths {
    let pick = |explicit: Option<PathBuf>, key: &str| {
        explicit
            .filter(|path| !path.as_os_str().is_empty())
            .or_else(|| lookup_value(key, file_vars, &env_lookup).map(PathBuf::from))
    };

    RuntimePaths {
        cache_root: pick(overrides.cache_root, CACHE_DIR_KEY).unwrap_or(default_cache_root),
        yt_dlp: pick(overrides.yt_dlp, YTDLP_KEY)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_PROGRAM)),
        ffmpeg: pick(overrides.ffmpeg, FFMPEG_KEY)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_PROGRAM)),
    }
}

/// Platform cache dir (`~/.cache/tubereel` on Linux), falling back to the
/// temp dir on systems without one.
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join(CACHE_DIR_NAME)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| non_blank(&value))
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).and_then(|value| non_blank(value)))
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
