use crate::application::bootstrap::bootstrap_workspace;
use crate::application::device_index::fetch_managed_devices;
use crate::application::engine::{device_status, DeviceStatus, Engine, EngineParts, EngineSettings};
use crate::application::executor::ActionExecutor;
use crate::application::override_manager::{OverrideManager, OverrideRequest};
use crate::domain::models::{Override, OverrideCommand, WeekInstant};
use crate::domain::schedule::compile_schedule;
use crate::infrastructure::config::{redacted_config, ConfigBundle};
use crate::infrastructure::controller_client::{
    spawn_connection_watcher, DeviceListing, GroupDirectory, ReqwestControllerClient,
};
use crate::infrastructure::credential_store::{
    resolve_password, CredentialStore, KeyringCredentialStore, PASSWORD_ENV,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::filter_appliance::{FilterAppliance, SqlFilterAppliance, TokioCommandRunner};
use crate::infrastructure::state_store::{
    read_bool, read_u64, SqliteStateStore, StateStore, DRY_RUN_KEY, RECOMPUTE_INTERVAL_KEY,
};
use crate::infrastructure::trigger_timer::TokioTriggerTimer;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const CONNECTION_POLL_SECONDS: u64 = 15;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const PLACEHOLDER_MAC: &str = "00:00:00:00:00:00";

pub struct AppState {
    workspace_root: PathBuf,
    config_dir: PathBuf,
    logs_dir: PathBuf,
    database_path: PathBuf,
    config: ConfigBundle,
    store: Arc<dyn StateStore>,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        Ok(Self {
            workspace_root: bootstrap.workspace_root,
            config_dir: bootstrap.config_dir,
            logs_dir: bootstrap.logs_dir,
            store: Arc::new(SqliteStateStore::new(&bootstrap.database_path)),
            database_path: bootstrap.database_path,
            config: bootstrap.config,
            log_guard: Mutex::new(()),
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn config(&self) -> &ConfigBundle {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    pub fn time_zone(&self) -> Result<Tz, InfraError> {
        self.config.app.time_zone()
    }

    /// Dry-run flag; a value in the state store wins over the config file.
    pub fn dry_run(&self) -> Result<bool, InfraError> {
        Ok(read_bool(self.store.as_ref(), DRY_RUN_KEY)?.unwrap_or(self.config.app.dry_run))
    }

    pub fn recompute_interval(&self) -> Result<Duration, InfraError> {
        let seconds = read_u64(self.store.as_ref(), RECOMPUTE_INTERVAL_KEY)?
            .filter(|seconds| *seconds > 0)
            .unwrap_or(self.config.app.recompute_interval_seconds);
        Ok(Duration::from_secs(seconds))
    }

    pub fn override_manager(&self) -> Result<OverrideManager, InfraError> {
        OverrideManager::load(self.store(), self.config.group_names())
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SetOverrideResponse {
    pub group: String,
    #[serde(rename = "override")]
    pub active: Option<Override>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TunablesResponse {
    pub dry_run: bool,
    pub recompute_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupCheck {
    pub name: String,
    pub enforced: bool,
    pub harsh: bool,
    pub triggers_per_device: usize,
}

pub fn set_override_impl(
    state: &AppState,
    group: String,
    action: String,
    until_next_trigger: bool,
    filter_groups: Option<Vec<String>>,
) -> Result<SetOverrideResponse, InfraError> {
    let command = OverrideCommand::parse(&action).map_err(InfraError::Validation)?;
    let manager = state.override_manager()?;
    let active = manager.set_override(OverrideRequest {
        group: group.clone(),
        command,
        until_next_trigger,
        filter_groups,
    })?;

    state.log_info(
        "set_override",
        &format!("group={group} action={action} until_next_trigger={until_next_trigger}"),
    );
    Ok(SetOverrideResponse { group, active })
}

pub fn set_tunables_impl(
    state: &AppState,
    dry_run: Option<bool>,
    recompute_interval_seconds: Option<u64>,
) -> Result<TunablesResponse, InfraError> {
    if recompute_interval_seconds == Some(0) {
        return Err(InfraError::Validation(
            "recompute interval must be at least one second".to_string(),
        ));
    }
    if let Some(dry_run) = dry_run {
        state.store.set(DRY_RUN_KEY, &dry_run.to_string())?;
    }
    if let Some(seconds) = recompute_interval_seconds {
        state.store.set(RECOMPUTE_INTERVAL_KEY, &seconds.to_string())?;
    }

    let response = TunablesResponse {
        dry_run: state.dry_run()?,
        recompute_interval_seconds: state.recompute_interval()?.as_secs(),
    };
    state.log_info(
        "set_tunables",
        &format!(
            "dry_run={} recompute_interval_seconds={}",
            response.dry_run, response.recompute_interval_seconds
        ),
    );
    Ok(response)
}

pub fn config_view_impl(state: &AppState) -> Result<serde_json::Value, InfraError> {
    let mut view = redacted_config(state.config())?;
    view["overrides"] = serde_json::to_value(state.override_manager()?.snapshot()?)?;
    view["tunables"] = serde_json::json!({
        "dryRun": state.dry_run()?,
        "recomputeIntervalSeconds": state.recompute_interval()?.as_secs(),
    });
    Ok(view)
}

/// Compiles every group's schedule once to surface configuration errors.
pub fn check_impl(state: &AppState) -> Result<Vec<GroupCheck>, InfraError> {
    state.time_zone()?;
    state
        .config()
        .groups
        .iter()
        .map(|group| {
            let compiled = compile_schedule(group, PLACEHOLDER_MAC)?;
            Ok::<_, InfraError>(GroupCheck {
                name: group.name.clone(),
                enforced: group.enforce_schedule,
                harsh: group.harsh,
                triggers_per_device: compiled.len(),
            })
        })
        .collect()
}

/// Status of every managed device as of `now`, using live controller data.
pub async fn status_impl(
    state: &AppState,
    listing: &dyn DeviceListing,
    directory: &dyn GroupDirectory,
    now: DateTime<Utc>,
) -> Result<Vec<DeviceStatus>, InfraError> {
    let config = state.config();
    let managed = config.group_names().into_iter().collect::<HashSet<_>>();
    let devices =
        fetch_managed_devices(listing, directory, &managed, &config.app.managed_ssids).await?;
    let overrides = state.override_manager()?.snapshot()?;
    let now = WeekInstant::from_datetime(&now.with_timezone(&state.time_zone()?));

    devices
        .iter()
        .filter_map(|entry| {
            config
                .group(&entry.group)
                .map(|group| device_status(now, entry, group, overrides.get(&entry.group)))
        })
        .collect()
}

pub fn save_password_impl(
    state: &AppState,
    credentials: &dyn CredentialStore,
    password: &str,
) -> Result<(), InfraError> {
    if password.trim().is_empty() {
        return Err(InfraError::Validation("password must not be empty".to_string()));
    }
    credentials.save_password(password)?;
    state.log_info("save_password", "controller password stored");
    Ok(())
}

pub fn controller_credentials(state: &AppState) -> KeyringCredentialStore {
    KeyringCredentialStore::for_controller(&state.config().app.controller.username)
}

pub fn connect_controller(
    state: &AppState,
    credentials: &dyn CredentialStore,
) -> Result<Arc<ReqwestControllerClient>, InfraError> {
    let controller = &state.config().app.controller;
    let password = resolve_password(
        controller.password.as_deref(),
        std::env::var(PASSWORD_ENV).ok(),
        credentials,
    )?;
    Ok(Arc::new(ReqwestControllerClient::new(controller, password)?))
}

fn filter_appliance(state: &AppState) -> Option<Arc<dyn FilterAppliance>> {
    let config = &state.config().app.filter_appliance;
    if !config.enabled {
        return None;
    }
    Some(Arc::new(SqlFilterAppliance::new(TokioCommandRunner::from_config(
        config,
    ))))
}

fn engine_settings(state: &AppState) -> Result<EngineSettings, InfraError> {
    let log = &state.config().app.log;
    let seconds = |value: Option<u64>| value.filter(|value| *value > 0).map(Duration::from_secs);
    Ok(EngineSettings {
        time_zone: state.time_zone()?,
        managed_ssids: state.config().app.managed_ssids.clone(),
        recompute_interval: state.recompute_interval()?,
        dump_schedule_every: seconds(log.dump_schedule_seconds),
        dump_status_every: seconds(log.dump_status_seconds),
    })
}

/// Runs the scheduling daemon until `shutdown` resolves.
pub async fn run_impl(
    state: &AppState,
    shutdown: impl Future<Output = ()>,
) -> Result<(), InfraError> {
    let settings = engine_settings(state)?;
    let controller = connect_controller(state, &controller_credentials(state))?;
    let executor = Arc::new(
        ActionExecutor::new(controller.clone(), filter_appliance(state))
            .with_dry_run(state.dry_run()?),
    );
    let timer = Arc::new(TokioTriggerTimer::new(
        settings.time_zone,
        tokio::runtime::Handle::current(),
    ));

    let engine = Engine::new(EngineParts {
        groups: state.config().groups.clone(),
        settings,
        listing: controller.clone(),
        directory: controller.clone(),
        timer,
        overrides: Arc::new(state.override_manager()?),
        executor,
        tunables: state.store(),
    });

    let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let watcher = spawn_connection_watcher(
        controller,
        Duration::from_secs(CONNECTION_POLL_SECONDS),
        sender,
    );

    state.log_info("run", "engine starting");
    let result = engine.run(receiver, shutdown).await;
    watcher.abort();
    match &result {
        Ok(()) => state.log_info("run", "engine stopped"),
        Err(error) => state.log_error("run", &error.to_string()),
    }
    result
}
