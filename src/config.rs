use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

pub const APP_DIR_NAME: &str = "rwkv-assistant";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Master switch for the completion side. Chat and commit-msg stay
    /// available when this is off.
    pub enabled: bool,
    pub completion: CompletionConfig,
    pub chat: ChatConfig,
    pub git: GitConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            completion: CompletionConfig::default(),
            chat: ChatConfig::default(),
            git: GitConfig::default(),
        }
    }
}

/// Inline-completion endpoint and tuning. The defaults are deliberately
/// conservative: few tokens, near-greedy sampling, short output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub password: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub alpha_presence: f64,
    pub alpha_frequency: f64,
    pub debounce_delay_ms: u64,
    pub num_choices: usize,
    pub mode: CompletionMode,
    /// Cap on non-empty suggestion lines.
    pub max_lines: usize,
    /// Prefix tail (chars) scanned for echo overlap.
    pub overlap_window: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/v3/chat/completions".to_string(),
            password: "rwkv7_7.2b_webgen".to_string(),
            max_tokens: 16,
            temperature: 0.1,
            top_p: 0.95,
            top_k: 1,
            alpha_presence: 0.5,
            alpha_frequency: 0.5,
            debounce_delay_ms: 300,
            num_choices: 1,
            mode: CompletionMode::Inline,
            max_lines: 3,
            overlap_window: 80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    Inline,
    Standard,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub endpoint: String,
    pub password: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8001/v2/chat/completions".to_string(),
            password: "rwkv7_7.2b".to_string(),
            max_tokens: 8192,
            temperature: 1.0,
            top_p: 0.3,
            top_k: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub commit_types: Vec<String>,
    pub use_emoji: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_types: ["feat", "fix", "docs", "style", "refactor", "perf", "test", "chore"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            use_emoji: false,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let base = config_dir().context("unable to resolve OS config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

pub fn ensure_config_parent_exists(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config dir: {}", parent.display()))?;
    }
    Ok(())
}

pub fn load_config_if_exists(path: &PathBuf) -> Result<Option<AppConfig>> {
    if path.exists() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file: {}", path.display()))?;
        let cfg: AppConfig = toml::from_str(&text).context("parsing config TOML")?;
        Ok(Some(cfg))
    } else {
        Ok(None)
    }
}

/// Effective configuration: the file when present, defaults otherwise.
pub fn load_or_default() -> Result<AppConfig> {
    let path = default_config_path()?;
    Ok(load_config_if_exists(&path)?.unwrap_or_default())
}

pub fn write_config(path: &PathBuf, cfg: &AppConfig) -> Result<()> {
    ensure_config_parent_exists(path)?;
    let text = toml::to_string_pretty(cfg).context("serializing config to TOML")?;
    fs::write(path, text).with_context(|| format!("writing config file: {}", path.display()))?;
    Ok(())
}

/// Update one dotted key (e.g. `completion.temperature`) in the config,
/// validate that the result still deserializes, and persist it.
pub fn set_value(path: &PathBuf, key: &str, raw_value: &str) -> Result<AppConfig> {
    let current = load_config_if_exists(path)?.unwrap_or_default();
    let mut doc = toml::Value::try_from(&current).context("serializing current config")?;

    let parts: Vec<&str> = key.split('.').collect();
    let (last, sections) = parts.split_last().context("empty config key")?;
    let mut node = &mut doc;
    for part in sections {
        node = node
            .as_table_mut()
            .with_context(|| format!("config key `{}` does not name a table", key))?
            .get_mut(*part)
            .with_context(|| format!("unknown config section: {}", part))?;
    }
    let table = node
        .as_table_mut()
        .with_context(|| format!("config key `{}` does not name a table", key))?;
    if !table.contains_key(*last) {
        bail!("unknown config key: {}", key);
    }
    table.insert(last.to_string(), parse_scalar(raw_value));

    let cfg: AppConfig = doc
        .try_into()
        .with_context(|| format!("invalid value for {}: {}", key, raw_value))?;
    write_config(path, &cfg)?;
    Ok(cfg)
}

fn parse_scalar(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml() {
        let cfg = AppConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert!(back.enabled);
        assert_eq!(back.completion.max_tokens, 16);
        assert_eq!(back.completion.mode, CompletionMode::Inline);
        assert_eq!(back.chat.max_tokens, 8192);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: AppConfig = toml::from_str("[completion]\nmax_tokens = 64\n").unwrap();
        assert_eq!(cfg.completion.max_tokens, 64);
        assert_eq!(cfg.completion.debounce_delay_ms, 300);
        assert!(cfg.enabled);
    }

    #[test]
    fn set_value_updates_nested_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = set_value(&path, "completion.temperature", "0.3").unwrap();
        assert!((cfg.completion.temperature - 0.3).abs() < 1e-9);
        let reloaded = load_config_if_exists(&path).unwrap().unwrap();
        assert!((reloaded.completion.temperature - 0.3).abs() < 1e-9);
    }

    #[test]
    fn set_value_rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert!(set_value(&path, "completion.no_such_knob", "1").is_err());
        assert!(set_value(&path, "nowhere.at_all", "1").is_err());
    }

    #[test]
    fn set_value_rejects_type_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert!(set_value(&path, "completion.max_tokens", "not-a-number").is_err());
    }

    #[test]
    fn mode_parses_lowercase_names() {
        let cfg: AppConfig = toml::from_str("[completion]\nmode = \"both\"\n").unwrap();
        assert_eq!(cfg.completion.mode, CompletionMode::Both);
    }
}
