//! Daemon configuration.
//!
//! One TOML file describes the engine knobs and every sync instance.
//! Configuration errors are fatal at startup: unknown keys, duplicate
//! instance names, duplicate PTP domains on one interface and missing
//! interfaces all abort before any thread is spawned.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use toml::Value;

use crate::adapters::ntp_client::WireMode;
use crate::bic::Rule;
use crate::domain::timespec::Timespec;
use crate::sync::ModuleKind;
use crate::sync::ptp::PtpMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub message_pool_size: usize,
    pub selection_interval: Timespec,
    pub selection_holdoff: Timespec,
    pub stats_interval: Timespec,
    pub save_interval: Timespec,
    pub state_path: Option<PathBuf>,
    pub policy: Vec<Rule>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            message_pool_size: 256,
            selection_interval: Timespec::from_secs(1),
            selection_holdoff: Timespec::from_secs(2),
            stats_interval: Timespec::from_secs(60),
            save_interval: Timespec::from_secs(60),
            state_path: None,
            policy: crate::bic::DEFAULT_POLICY.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub kind: ModuleKind,
    pub interface: Option<String>,
    pub priority: u8,
    pub tick_interval: Timespec,
    pub hw_timestamps: bool,
    pub ptp_domain: u8,
    pub ptp_mode: PtpMode,
    pub tod_available: bool,
    pub ntp_host: String,
    pub ntp_port: u16,
    pub wire_mode: WireMode,
    pub key_id: Option<u32>,
    pub key_value: Option<String>,
}

impl InstanceConfig {
    fn new(name: String, kind: ModuleKind) -> Self {
        InstanceConfig {
            name,
            kind,
            interface: None,
            priority: 128,
            tick_interval: Timespec::from_secs(1),
            hw_timestamps: false,
            ptp_domain: 0,
            ptp_mode: PtpMode::Slave,
            tod_available: kind == ModuleKind::Gps,
            ntp_host: "127.0.0.1".into(),
            ntp_port: if kind == ModuleKind::Crny { 323 } else { 123 },
            wire_mode: WireMode::Control,
            key_id: None,
            key_value: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    pub instances: Vec<InstanceConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Config, ConfigError> {
        let root: Value = content.parse::<Value>()?;
        let table = root
            .as_table()
            .ok_or_else(|| invalid("top level must be a table"))?;

        let mut config = Config {
            general: GeneralConfig::default(),
            instances: Vec::new(),
        };
        for (key, value) in table {
            match key.as_str() {
                "general" => parse_general(&mut config.general, value)?,
                "instance" => parse_instances(&mut config.instances, value)?,
                other => return Err(invalid(format!("unknown section '{other}'"))),
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.instances.is_empty() {
            return Err(invalid("at least one [[instance]] is required"));
        }
        let mut names = HashSet::new();
        let mut ptp_bindings = HashSet::new();
        for inst in &self.instances {
            if !names.insert(inst.name.clone()) {
                return Err(invalid(format!("duplicate instance name '{}'", inst.name)));
            }
            match inst.kind {
                ModuleKind::Ptp => {
                    let interface = inst.interface.as_ref().ok_or_else(|| {
                        invalid(format!("instance '{}' requires an interface", inst.name))
                    })?;
                    if !ptp_bindings.insert((interface.clone(), inst.ptp_domain)) {
                        return Err(invalid(format!(
                            "duplicate ptp domain {} on interface '{}'",
                            inst.ptp_domain, interface
                        )));
                    }
                }
                ModuleKind::Pps | ModuleKind::Gps => {
                    if inst.interface.is_none() {
                        return Err(invalid(format!(
                            "instance '{}' requires an interface",
                            inst.name
                        )));
                    }
                }
                _ => {}
            }
            if inst.key_id.is_some() != inst.key_value.is_some() {
                return Err(invalid(format!(
                    "instance '{}': key_id and key_value go together",
                    inst.name
                )));
            }
        }
        if let Some(first) = self.general.policy.first()
            && self.general.policy.contains(&Rule::Manual)
            && *first != Rule::Manual
        {
            return Err(invalid("selection policy must list 'manual' first"));
        }
        Ok(())
    }
}

fn parse_general(general: &mut GeneralConfig, value: &Value) -> Result<(), ConfigError> {
    let table = value
        .as_table()
        .ok_or_else(|| invalid("[general] must be a table"))?;
    for (key, value) in table {
        match key.as_str() {
            "message_pool_size" => {
                general.message_pool_size = as_usize(key, value)?;
            }
            "selection_interval" => general.selection_interval = as_interval(key, value)?,
            "selection_holdoff" => general.selection_holdoff = as_interval(key, value)?,
            "stats_interval" => general.stats_interval = as_interval(key, value)?,
            "save_interval" => general.save_interval = as_interval(key, value)?,
            "state_path" => {
                general.state_path = Some(PathBuf::from(as_str(key, value)?));
            }
            "policy" => general.policy = parse_policy(value)?,
            other => return Err(invalid(format!("unknown [general] key '{other}'"))),
        }
    }
    Ok(())
}

fn parse_instances(instances: &mut Vec<InstanceConfig>, value: &Value) -> Result<(), ConfigError> {
    let entries = value
        .as_array()
        .ok_or_else(|| invalid("instance must be an array of tables ([[instance]])"))?;
    for entry in entries {
        let table = entry
            .as_table()
            .ok_or_else(|| invalid("[[instance]] must be a table"))?;
        let name = table
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("[[instance]] requires a name"))?
            .to_string();
        let kind = table
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(format!("instance '{name}' requires a kind")))?;
        let kind = parse_kind(kind)
            .ok_or_else(|| invalid(format!("instance '{name}': unknown kind '{kind}'")))?;
        let mut inst = InstanceConfig::new(name.clone(), kind);
        for (key, value) in table {
            match key.as_str() {
                "name" | "kind" => {}
                "interface" => inst.interface = Some(as_str(key, value)?.to_string()),
                "priority" => {
                    let raw = as_usize(key, value)?;
                    if raw > u8::MAX as usize {
                        return Err(invalid(format!(
                            "instance '{name}': priority out of range [0..255]: {raw}"
                        )));
                    }
                    inst.priority = raw as u8;
                }
                "tick_interval" => inst.tick_interval = as_interval(key, value)?,
                "hw_timestamps" => inst.hw_timestamps = as_bool(key, value)?,
                "domain" => {
                    let raw = as_usize(key, value)?;
                    if raw > u8::MAX as usize {
                        return Err(invalid(format!(
                            "instance '{name}': domain out of range [0..255]: {raw}"
                        )));
                    }
                    inst.ptp_domain = raw as u8;
                }
                "mode" => {
                    let raw = as_str(key, value)?;
                    inst.ptp_mode = parse_ptp_mode(raw).ok_or_else(|| {
                        invalid(format!("instance '{name}': unknown mode '{raw}'"))
                    })?;
                }
                "tod" => inst.tod_available = as_bool(key, value)?,
                "host" => inst.ntp_host = as_str(key, value)?.to_string(),
                "port" => {
                    let raw = as_usize(key, value)?;
                    if raw == 0 || raw > u16::MAX as usize {
                        return Err(invalid(format!(
                            "instance '{name}': port out of range [1..65535]: {raw}"
                        )));
                    }
                    inst.ntp_port = raw as u16;
                }
                "wire_mode" => {
                    inst.wire_mode = match as_str(key, value)? {
                        "control" => WireMode::Control,
                        "private" => WireMode::Private,
                        other => {
                            return Err(invalid(format!(
                                "instance '{name}': unknown wire_mode '{other}'"
                            )));
                        }
                    };
                }
                "key_id" => inst.key_id = Some(as_usize(key, value)? as u32),
                "key_value" => inst.key_value = Some(as_str(key, value)?.to_string()),
                other => {
                    return Err(invalid(format!(
                        "instance '{name}': unknown key '{other}'"
                    )));
                }
            }
        }
        instances.push(inst);
    }
    Ok(())
}

fn parse_kind(s: &str) -> Option<ModuleKind> {
    match s {
        "freerun" => Some(ModuleKind::Freerun),
        "ptp" => Some(ModuleKind::Ptp),
        "pps" => Some(ModuleKind::Pps),
        "ntp" => Some(ModuleKind::Ntp),
        "crny" => Some(ModuleKind::Crny),
        "gps" => Some(ModuleKind::Gps),
        _ => None,
    }
}

fn parse_ptp_mode(s: &str) -> Option<PtpMode> {
    match s {
        "slave" => Some(PtpMode::Slave),
        "master" => Some(PtpMode::Master),
        "passive" => Some(PtpMode::Passive),
        "monitor" => Some(PtpMode::Monitor),
        _ => None,
    }
}

fn parse_policy(value: &Value) -> Result<Vec<Rule>, ConfigError> {
    let entries = value
        .as_array()
        .ok_or_else(|| invalid("policy must be an array of rule names"))?;
    let mut policy = Vec::new();
    for entry in entries {
        let name = entry
            .as_str()
            .ok_or_else(|| invalid("policy entries must be strings"))?;
        let rule = match name {
            "manual" => Rule::Manual,
            "ext-constraints" => Rule::ExtConstraints,
            "state" => Rule::State,
            "no-alarms" => Rule::NoAlarms,
            "user-priority" => Rule::UserPriority,
            "clustering" => Rule::Clustering,
            "clock-class" => Rule::ClockClass,
            "total-accuracy" => Rule::TotalAccuracy,
            "allan-variance" => Rule::AllanVariance,
            "steps-removed" => Rule::StepsRemoved,
            "end" => Rule::End,
            other => return Err(invalid(format!("unknown policy rule '{other}'"))),
        };
        policy.push(rule);
    }
    if !policy.contains(&Rule::End) {
        policy.push(Rule::End);
    }
    Ok(policy)
}

fn as_str<'v>(key: &str, value: &'v Value) -> Result<&'v str, ConfigError> {
    value
        .as_str()
        .ok_or_else(|| invalid(format!("'{key}' must be a string")))
}

fn as_bool(key: &str, value: &Value) -> Result<bool, ConfigError> {
    value
        .as_bool()
        .ok_or_else(|| invalid(format!("'{key}' must be a boolean")))
}

fn as_usize(key: &str, value: &Value) -> Result<usize, ConfigError> {
    value
        .as_integer()
        .filter(|v| *v >= 0)
        .map(|v| v as usize)
        .ok_or_else(|| invalid(format!("'{key}' must be a non-negative integer")))
}

/// Interval in seconds, integer or float.
fn as_interval(key: &str, value: &Value) -> Result<Timespec, ConfigError> {
    let seconds = if let Some(f) = value.as_float() {
        f
    } else if let Some(i) = value.as_integer() {
        i as f64
    } else {
        return Err(invalid(format!("'{key}' must be a number of seconds")));
    };
    if !(seconds > 0.0) || seconds > 86_400.0 {
        return Err(invalid(format!("'{key}' out of range (0, 86400]: {seconds}")));
    }
    Ok(Timespec::from_secs_f64(seconds))
}
