use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::candidate::UnitCandidate;

/// Directory name under the XDG config home
pub const CONFIG_DIR_NAME: &str = "systemd-tray";
pub const CONFIG_FILE_NAME: &str = "services.yaml";

const DEFAULT_LOG_LINES: u32 = 200;
const DEFAULT_FOLLOW: bool = true;

/// Journal viewer options for one service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LogOptions {
    pub follow: bool,
    pub lines: u32,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: DEFAULT_FOLLOW,
            lines: DEFAULT_LOG_LINES,
        }
    }
}

// Hand-edited files get `lines: lots` or `follow: "yes"`; fall back instead of
// refusing the whole file.
impl<'de> Deserialize<'de> for LogOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Some(map) = value.as_mapping() else {
            return Ok(LogOptions::default());
        };
        let follow = map.get("follow").map(lenient_bool).unwrap_or(DEFAULT_FOLLOW);
        let lines = map.get("lines").map(lenient_lines).unwrap_or(DEFAULT_LOG_LINES);
        Ok(LogOptions { follow, lines })
    }
}

/// Recognised true/false spellings; anything else keeps the default
fn lenient_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => DEFAULT_FOLLOW,
        },
        Value::Number(n) => match n.as_i64() {
            Some(1) => true,
            Some(0) => false,
            _ => DEFAULT_FOLLOW,
        },
        _ => DEFAULT_FOLLOW,
    }
}

fn lenient_lines(value: &Value) -> u32 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(DEFAULT_LOG_LINES),
        Value::String(s) => s.trim().parse().unwrap_or(DEFAULT_LOG_LINES),
        _ => DEFAULT_LOG_LINES,
    }
}

/// A user-defined shortcut attached to a service
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OpenAction {
    Url { label: String, url: String },
    Command { label: String, command: OpenCommand },
}

impl OpenAction {
    pub fn label(&self) -> &str {
        match self {
            OpenAction::Url { label, .. } | OpenAction::Command { label, .. } => label,
        }
    }
}

/// A command given either as one shell string or as an argv list
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OpenCommand {
    Shell(String),
    Argv(Vec<String>),
}

impl OpenCommand {
    /// Program and arguments to spawn
    pub fn argv(&self) -> Vec<String> {
        match self {
            OpenCommand::Shell(cmd) => vec!["sh".into(), "-c".into(), cmd.clone()],
            OpenCommand::Argv(argv) => argv.clone(),
        }
    }
}

/// Normalize the free-form `open` value of a service entry
pub fn parse_open_actions(raw: Option<&Value>) -> Vec<OpenAction> {
    match raw {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(items)) => items.iter().filter_map(parse_open_entry).collect(),
        Some(other) => parse_open_entry(other).into_iter().collect(),
    }
}

fn parse_open_entry(value: &Value) -> Option<OpenAction> {
    let label_of = |map: &serde_yaml::Mapping, default: &str| {
        map.get("label")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
            .to_string()
    };

    match value {
        Value::String(url) => {
            let url = url.trim();
            (!url.is_empty()).then(|| OpenAction::Url {
                label: "Open".into(),
                url: url.to_string(),
            })
        }
        Value::Mapping(map) => {
            if let Some(url) = map.get("url") {
                let url = url.as_str()?.trim();
                if url.is_empty() {
                    return None;
                }
                return Some(OpenAction::Url {
                    label: label_of(map, "Open URL"),
                    url: url.to_string(),
                });
            }
            let command = match map.get("command")? {
                Value::String(s) if !s.trim().is_empty() => OpenCommand::Shell(s.clone()),
                Value::Sequence(items) => {
                    let argv: Vec<String> = items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                    if argv.is_empty() {
                        return None;
                    }
                    OpenCommand::Argv(argv)
                }
                _ => return None,
            };
            Some(OpenAction::Command {
                label: label_of(map, "Run command"),
                command,
            })
        }
        _ => None,
    }
}

/// A service entry in the saved configuration
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ManagedService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Unit identifier; entries without one are not tracked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default)]
    pub logs: LogOptions,

    /// Shortcut actions, kept verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<Value>,

    /// Keys this version does not know about
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ManagedService {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: Some(unit.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The unit, if it is non-empty
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    /// Label shown in the panel
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.unit())
            .unwrap_or("")
    }

    pub fn open_actions(&self) -> Vec<OpenAction> {
        parse_open_actions(self.open.as_ref())
    }
}

/// Root of `services.yaml`
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct TrayConfig {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub services: Vec<ManagedService>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<ManagedService>, D::Error> {
    Ok(Option::<Vec<ManagedService>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("cannot locate a config directory (neither XDG_CONFIG_HOME nor HOME is set)")]
    NoHomeDir,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `$XDG_CONFIG_HOME/systemd-tray/services.yaml`, or under `~/.config`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let base = match std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => {
            let home = std::env::var_os("HOME")
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::NoHomeDir)?;
            PathBuf::from(home).join(".config")
        }
    };
    Ok(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

impl TrayConfig {
    /// The configuration written on first run
    pub fn example() -> Self {
        Self {
            services: vec![ManagedService::new("comfyui.service").with_name("ComfyUI")],
        }
    }

    /// Parse from a string; an empty document is an empty config
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Option<TrayConfig> = serde_yaml::from_str(content)?;
        Ok(config.unwrap_or_default())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(io_error(path))?;
        let config = Self::from_str(&content)?;
        debug!(path = %path.display(), services = config.services.len(), "loaded config");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(io_error(path))?;
        info!(path = %path.display(), services = self.services.len(), "saved config");
        Ok(())
    }

    /// Units that take part in status tracking
    pub fn active_units(&self) -> BTreeSet<String> {
        self.tracked().map(|(unit, _)| unit.to_string()).collect()
    }

    /// Services with a usable unit, in file order
    pub fn tracked(&self) -> impl Iterator<Item = (&str, &ManagedService)> {
        self.services.iter().filter_map(|s| s.unit().map(|u| (u, s)))
    }

    pub fn find(&self, unit: &str) -> Option<&ManagedService> {
        self.tracked().find(|(u, _)| *u == unit).map(|(_, s)| s)
    }

    /// Add a service; returns false if the unit is already configured
    pub fn add_service(&mut self, service: ManagedService) -> bool {
        match service.unit() {
            Some(unit) if self.find(unit).is_none() => {
                self.services.push(service);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry for `unit`; returns whether anything was removed
    pub fn remove_service(&mut self, unit: &str) -> bool {
        let before = self.services.len();
        self.services.retain(|s| s.unit() != Some(unit));
        self.services.len() != before
    }

    /// Rebuild the service list from the candidates the user picked.
    ///
    /// Existing entries keep their name, log options and extra keys; new
    /// ones are named after the description, or the unit.
    pub fn apply_selection<'a>(
        &self,
        chosen: impl IntoIterator<Item = &'a UnitCandidate>,
    ) -> TrayConfig {
        let services = chosen
            .into_iter()
            .map(|candidate| {
                let mut entry = self.find(&candidate.unit).cloned().unwrap_or_default();
                if entry.name.as_deref().is_none_or(str::is_empty) {
                    let fallback = if candidate.description.is_empty() {
                        &candidate.unit
                    } else {
                        &candidate.description
                    };
                    entry.name = Some(fallback.clone());
                }
                entry.unit = Some(candidate.unit.clone());
                entry
            })
            .collect();
        TrayConfig { services }
    }
}

/// Load the config at `path`, writing the example first if it does not exist
pub fn ensure_config(path: &Path) -> Result<TrayConfig, ConfigError> {
    if !path.exists() {
        info!(path = %path.display(), "writing default config");
        TrayConfig::example().save(path)?;
    }
    TrayConfig::load(path)
}
