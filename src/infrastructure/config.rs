use crate::domain::models::{
    parse_day_name, ManagedGroup, ScheduleAction, ScheduleEntry, WeeklySchedule,
};
use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const GROUPS_JSON: &str = "groups.json";
const REDACTED: &str = "********";
pub const DEFAULT_RECOMPUTE_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    pub url: String,
    #[serde(default = "default_site")]
    pub site: String,
    #[serde(default)]
    pub username: String,
    /// Discouraged; prefer the environment or the OS keyring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: "https://192.168.1.1:443".to_string(),
            site: default_site(),
            username: "admin".to_string(),
            password: None,
            insecure: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilterApplianceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Program that receives the SQL on stdin and prints `|`-separated rows.
    #[serde(default = "default_filter_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default)]
    pub dump_schedule_seconds: Option<u64>,
    #[serde(default)]
    pub dump_status_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_recompute_interval")]
    pub recompute_interval_seconds: u64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub managed_ssids: Vec<String>,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub filter_appliance: FilterApplianceConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    pub fn time_zone(&self) -> Result<Tz, InfraError> {
        parse_timezone(self.timezone.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub app: AppConfig,
    pub groups: Vec<ManagedGroup>,
}

impl ConfigBundle {
    pub fn group(&self, name: &str) -> Option<&ManagedGroup> {
        self.groups.iter().find(|group| group.name == name)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|group| group.name.clone()).collect()
    }
}

fn default_site() -> String {
    "default".to_string()
}

fn default_filter_command() -> String {
    "sqlite3".to_string()
}

fn default_recompute_interval() -> u64 {
    DEFAULT_RECOMPUTE_INTERVAL_SECONDS
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "timezone": "UTC",
                "recomputeIntervalSeconds": DEFAULT_RECOMPUTE_INTERVAL_SECONDS,
                "dryRun": true,
                "managedSsids": [],
                "controller": {
                    "url": "https://192.168.1.1:443",
                    "site": "default",
                    "username": "admin",
                    "insecure": true
                },
                "filterAppliance": {
                    "enabled": false,
                    "command": "ssh",
                    "args": ["pi.hole", "sqlite3", "-separator", "|", "/etc/pihole/gravity.db"]
                },
                "log": {
                    "dumpScheduleSeconds": null,
                    "dumpStatusSeconds": null
                }
            }),
        ),
        (
            GROUPS_JSON,
            serde_json::json!({
                "schema": 1,
                "managedGroups": {
                    "kids": {
                        "enforceSchedule": true,
                        "harsh": false,
                        "schedule": {
                            "sunday": [{ "block": "00:00" }, { "unblock": "09:00" }, { "block": "22:30" }],
                            "monday": [{ "block": "00:00" }, { "unblock": "07:30" }, { "block": "22:30" }],
                            "tuesday": [{ "block": "00:00" }, { "unblock": "07:30" }, { "block": "22:30" }],
                            "wednesday": [{ "block": "00:00" }, { "unblock": "07:30" }, { "block": "22:30" }],
                            "thursday": [{ "block": "00:00" }, { "unblock": "07:30" }, { "block": "22:30" }],
                            "friday": [{ "block": "00:00" }, { "unblock": "07:30" }, { "block": "22:30" }],
                            "saturday": [{ "block": "00:00" }, { "unblock": "09:00" }, { "block": "22:30" }]
                        }
                    },
                    "guest": {
                        "enforceSchedule": false
                    },
                    "NOGROUP": {
                        "enforceSchedule": false
                    }
                }
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    let app_path = config_dir.join(APP_JSON);
    let app: AppConfig = serde_json::from_value(read_config(&app_path)?).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid {}: {error}", app_path.display()))
    })?;
    app.time_zone()?;
    if app.recompute_interval_seconds == 0 {
        return Err(InfraError::InvalidConfig(
            "recomputeIntervalSeconds must be > 0".to_string(),
        ));
    }

    let groups = parse_groups(&read_config(&config_dir.join(GROUPS_JSON))?)?;
    Ok(ConfigBundle { app, groups })
}

pub fn parse_timezone(value: Option<&str>) -> Result<Tz, InfraError> {
    let Some(name) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(Tz::UTC);
    };
    name.parse::<Tz>()
        .map_err(|error| InfraError::InvalidConfig(format!("unknown timezone '{name}': {error}")))
}

/// Parses the `managedGroups` object. Groups come back sorted by name.
pub fn parse_groups(document: &serde_json::Value) -> Result<Vec<ManagedGroup>, InfraError> {
    let managed = document
        .get("managedGroups")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| InfraError::InvalidConfig("managedGroups must be an object".to_string()))?;

    let mut groups = Vec::with_capacity(managed.len());
    for (name, definition) in managed {
        let group = parse_group(name, definition)?;
        group.validate().map_err(InfraError::InvalidConfig)?;
        groups.push(group);
    }
    groups.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(groups)
}

fn parse_group(name: &str, definition: &serde_json::Value) -> Result<ManagedGroup, InfraError> {
    let enforce_schedule = definition
        .get("enforceSchedule")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| {
            InfraError::InvalidConfig(format!("group {name}: enforceSchedule must be a boolean"))
        })?;
    let harsh = definition
        .get("harsh")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let mut schedule = WeeklySchedule::new();
    if let Some(days) = definition.get("schedule") {
        let days = days.as_object().ok_or_else(|| {
            InfraError::InvalidConfig(format!("group {name}: schedule must be an object"))
        })?;
        for (day_name, entries) in days {
            let day = parse_day_name(day_name).ok_or_else(|| {
                InfraError::InvalidConfig(format!("group {name}: unknown day '{day_name}'"))
            })?;
            let entries = entries.as_array().ok_or_else(|| {
                InfraError::InvalidConfig(format!("group {name}: {day_name} must be a list"))
            })?;
            for entry in entries {
                schedule.push(day, parse_entry(name, day_name, entry)?);
            }
        }
    }

    Ok(ManagedGroup {
        name: name.to_string(),
        enforce_schedule,
        harsh,
        schedule,
    })
}

fn parse_entry(
    group: &str,
    day: &str,
    entry: &serde_json::Value,
) -> Result<ScheduleEntry, InfraError> {
    let invalid = |detail: &str| InfraError::InvalidConfig(format!("group {group}: {day}: {detail}"));
    let object = entry
        .as_object()
        .ok_or_else(|| invalid("entry must be an object"))?;

    if let Some(time) = object.get("filter") {
        let time = time
            .as_str()
            .ok_or_else(|| invalid("filter time must be a string"))?;
        let groups = object
            .get("groups")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| invalid("filter entry requires a groups list"))?
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .map(|name| name.trim().to_string())
                    .ok_or_else(|| invalid("filter group names must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(ScheduleEntry::new(time, ScheduleAction::FilterSet(groups)));
    }

    let mut fields = object.iter();
    let (Some((kind, time)), None) = (fields.next(), fields.next()) else {
        return Err(invalid("entry must have exactly one action"));
    };
    let time = time
        .as_str()
        .ok_or_else(|| invalid(&format!("{kind} time must be a string")))?;
    let action = match kind.as_str() {
        "block" => ScheduleAction::Block,
        "unblock" => ScheduleAction::Unblock,
        other => return Err(invalid(&format!("unknown action kind '{other}'"))),
    };
    Ok(ScheduleEntry::new(time, action))
}

/// Configuration as shown to administrators, with credentials masked.
pub fn redacted_config(bundle: &ConfigBundle) -> Result<serde_json::Value, InfraError> {
    let mut app = serde_json::to_value(&bundle.app)?;
    if let Some(controller) = app
        .get_mut("controller")
        .and_then(serde_json::Value::as_object_mut)
    {
        if controller.contains_key("password") {
            controller.insert("password".to_string(), REDACTED.into());
        }
        controller.insert("username".to_string(), REDACTED.into());
    }
    Ok(serde_json::json!({
        "app": app,
        "managedGroups": bundle.groups,
    }))
}
