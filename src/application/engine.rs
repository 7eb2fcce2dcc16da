//! Recalculation pass orchestration and trigger firing.
//!
//! A pass refreshes group membership, reconciles each device's installed triggers against
//! its compiled schedule, and applies the action that should already be in force for any
//! device whose triggers, group or override changed. Passes never overlap; requests that
//! arrive while one is running collapse into a single follow-up pass.

use crate::application::device_index::{fetch_managed_devices, DeviceGroupIndex, IndexedDevice};
use crate::application::executor::ActionExecutor;
use crate::application::override_manager::OverrideManager;
use crate::application::reconciler::{InstalledTriggerSet, ReconcileReport, TriggerSetReconciler};
use crate::domain::models::{ManagedGroup, Override, TriggerDescriptor, TriggerKey, WeekInstant};
use crate::domain::resolver::{
    apply_override, last_trigger, next_trigger, planned_action, resolve_current, PlannedAction,
    Resolution,
};
use crate::domain::schedule::compile_schedule;
use crate::infrastructure::controller_client::{
    matches_ssid_filter, DeviceEvent, DeviceListing, GroupDirectory,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::state_store::{
    read_bool, read_u64, StateStore, DRY_RUN_KEY, RECOMPUTE_INTERVAL_KEY,
};
use crate::infrastructure::trigger_timer::{NowProvider, TriggerCallback, TriggerTimer};
use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub time_zone: Tz,
    pub managed_ssids: Vec<String>,
    pub recompute_interval: Duration,
    pub dump_schedule_every: Option<Duration>,
    pub dump_status_every: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            time_zone: Tz::UTC,
            managed_ssids: Vec::new(),
            recompute_interval: Duration::from_secs(60),
            dump_schedule_every: None,
            dump_status_every: None,
        }
    }
}

pub struct EngineParts {
    pub groups: Vec<ManagedGroup>,
    pub settings: EngineSettings,
    pub listing: Arc<dyn DeviceListing>,
    pub directory: Arc<dyn GroupDirectory>,
    pub timer: Arc<dyn TriggerTimer>,
    pub overrides: Arc<OverrideManager>,
    pub executor: Arc<ActionExecutor>,
    /// Runtime tunables written by the admin CLI, re-read while running.
    pub tunables: Arc<dyn StateStore>,
}

#[derive(Debug, Default)]
pub struct PassReport {
    pub devices: usize,
    pub added: Vec<String>,
    pub regrouped: Vec<String>,
    pub removed: Vec<String>,
    pub triggers: ReconcileReport,
    /// Devices whose in-force action was applied immediately, with what was applied.
    pub catch_up: Vec<(String, Resolution)>,
    tasks: Vec<JoinHandle<()>>,
}

impl PassReport {
    pub fn resolution_for(&self, mac: &str) -> Option<&Resolution> {
        self.catch_up
            .iter()
            .find(|(candidate, _)| candidate == mac)
            .map(|(_, resolution)| resolution)
    }

    /// Waits for the actions dispatched by this pass to finish.
    pub async fn settle(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                tracing::error!(%error, "dispatched action task failed");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub mac: String,
    pub ip: Option<String>,
    pub group: String,
    pub enforced: bool,
    pub resolution: Resolution,
    pub last_trigger: Option<TriggerKey>,
    pub next_trigger: Option<TriggerKey>,
    #[serde(rename = "override")]
    pub active_override: Option<Override>,
}

/// Status of one device at `now`, computed from its group's schedule and override.
pub fn device_status(
    now: WeekInstant,
    entry: &IndexedDevice,
    group: &ManagedGroup,
    active: Option<&Override>,
) -> Result<DeviceStatus, InfraError> {
    let desired = compile_schedule(group, &entry.device.mac)?;
    let resolution = if group.enforce_schedule {
        apply_override(resolve_current(now, &desired), active)
    } else {
        Resolution::unenforced()
    };
    Ok(DeviceStatus {
        id: entry.device.id.clone(),
        mac: entry.device.mac.clone(),
        ip: entry.device.ip.clone(),
        group: entry.group.clone(),
        enforced: group.enforce_schedule,
        resolution,
        last_trigger: last_trigger(now, &desired).map(|descriptor| descriptor.key.clone()),
        next_trigger: next_trigger(now, &desired).map(|descriptor| descriptor.key.clone()),
        active_override: active.cloned(),
    })
}

pub struct Engine {
    groups: BTreeMap<String, ManagedGroup>,
    managed_names: HashSet<String>,
    settings: EngineSettings,
    listing: Arc<dyn DeviceListing>,
    directory: Arc<dyn GroupDirectory>,
    reconciler: TriggerSetReconciler,
    overrides: Arc<OverrideManager>,
    executor: Arc<ActionExecutor>,
    tunables: Arc<dyn StateStore>,
    installed: Mutex<InstalledTriggerSet>,
    index: Mutex<DeviceGroupIndex>,
    applied_overrides: Mutex<BTreeMap<String, Override>>,
    pass_lock: tokio::sync::Mutex<()>,
    rerun_requested: AtomicBool,
    callback: TriggerCallback,
    now_provider: NowProvider,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Arc<Self> {
        Self::with_now_provider(parts, Arc::new(Utc::now))
    }

    pub fn with_now_provider(parts: EngineParts, now_provider: NowProvider) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Engine>| {
            let weak = weak.clone();
            let callback: TriggerCallback = Arc::new(move |descriptor: &TriggerDescriptor| {
                if let Some(engine) = weak.upgrade() {
                    engine.fire_trigger(descriptor);
                }
            });

            let groups = parts
                .groups
                .into_iter()
                .map(|group| (group.name.clone(), group))
                .collect::<BTreeMap<_, _>>();
            Engine {
                managed_names: groups.keys().cloned().collect(),
                groups,
                settings: parts.settings,
                listing: parts.listing,
                directory: parts.directory,
                reconciler: TriggerSetReconciler::new(parts.timer),
                overrides: parts.overrides,
                executor: parts.executor,
                tunables: parts.tunables,
                installed: Mutex::new(InstalledTriggerSet::new()),
                index: Mutex::new(DeviceGroupIndex::new()),
                applied_overrides: Mutex::new(BTreeMap::new()),
                pass_lock: tokio::sync::Mutex::new(()),
                rerun_requested: AtomicBool::new(false),
                callback,
                now_provider,
            }
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn group(&self, name: &str) -> Option<&ManagedGroup> {
        self.groups.get(name)
    }

    pub fn overrides(&self) -> &Arc<OverrideManager> {
        &self.overrides
    }

    pub fn now_instant(&self) -> WeekInstant {
        let now = (self.now_provider)().with_timezone(&self.settings.time_zone);
        WeekInstant::from_datetime(&now)
    }

    fn lock_installed(&self) -> Result<MutexGuard<'_, InstalledTriggerSet>, InfraError> {
        self.installed
            .lock()
            .map_err(|error| InfraError::lock_poisoned("installed triggers", error))
    }

    fn lock_index(&self) -> Result<MutexGuard<'_, DeviceGroupIndex>, InfraError> {
        self.index
            .lock()
            .map_err(|error| InfraError::lock_poisoned("device index", error))
    }

    pub fn installed_keys(&self) -> Result<Vec<TriggerKey>, InfraError> {
        let installed = self.lock_installed()?;
        Ok(installed
            .macs()
            .iter()
            .flat_map(|mac| installed.descriptors_for(mac))
            .map(|descriptor| descriptor.key)
            .collect())
    }

    pub fn indexed_devices(&self) -> Result<Vec<IndexedDevice>, InfraError> {
        Ok(self.lock_index()?.devices().cloned().collect())
    }

    /// Runs a pass, or marks a follow-up when one is already running.
    ///
    /// The request flag is raised before the pass lock is tried, and the lock holder
    /// checks the flag again after releasing the lock, so a request that loses the race
    /// for the lock is always served by the holder. Returns `None` when the request was
    /// folded into a pass run by another caller; otherwise the report of the last pass
    /// run, carrying the dispatched tasks of every pass this call ran.
    pub async fn request_pass(&self) -> Result<Option<PassReport>, InfraError> {
        self.rerun_requested.store(true, Ordering::SeqCst);
        let mut outcome: Result<Option<PassReport>, InfraError> = Ok(None);

        loop {
            {
                let Ok(_guard) = self.pass_lock.try_lock() else {
                    tracing::debug!("pass in progress; follow-up queued");
                    return outcome;
                };
                if self.rerun_requested.swap(false, Ordering::SeqCst) {
                    match self.run_pass().await {
                        Ok(mut report) => {
                            if let Ok(Some(previous)) = &mut outcome {
                                report.tasks.append(&mut previous.tasks);
                            }
                            outcome = Ok(Some(report));
                        }
                        Err(error) => outcome = Err(error),
                    }
                }
            }
            if !self.rerun_requested.load(Ordering::SeqCst) {
                return outcome;
            }
            if let Err(error) = &outcome {
                tracing::warn!(%error, "pass aborted before follow-up");
            }
        }
    }

    /// Applies a dry-run flag changed in the state store since the last pass.
    fn refresh_dry_run(&self) {
        match read_bool(self.tunables.as_ref(), DRY_RUN_KEY) {
            Ok(Some(dry_run)) if dry_run != self.executor.is_dry_run() => {
                self.executor.set_dry_run(dry_run);
                tracing::info!(dry_run, "dry-run mode changed");
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "tunables unreadable; keeping dry-run mode"),
        }
    }

    /// Recompute interval from the state store when it differs from `current`.
    fn changed_interval(&self, current: Duration) -> Option<Duration> {
        match read_u64(self.tunables.as_ref(), RECOMPUTE_INTERVAL_KEY) {
            Ok(Some(seconds)) if seconds > 0 && Duration::from_secs(seconds) != current => {
                Some(Duration::from_secs(seconds))
            }
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(%error, "tunables unreadable; keeping recompute interval");
                None
            }
        }
    }

    async fn run_pass(&self) -> Result<PassReport, InfraError> {
        self.refresh_dry_run();
        if let Err(error) = self.overrides.reload() {
            tracing::warn!(%error, "override store unreadable; keeping in-memory overrides");
        }
        let overrides = self.overrides.snapshot()?;

        let devices = match fetch_managed_devices(
            self.listing.as_ref(),
            self.directory.as_ref(),
            &self.managed_names,
            &self.settings.managed_ssids,
        )
        .await
        {
            Ok(devices) => devices,
            Err(error) => {
                tracing::warn!(%error, "recalculation pass aborted; retrying next tick");
                return Err(error);
            }
        };

        let now = self.now_instant();
        let mut report = PassReport::default();
        let mut catch_up = Vec::new();
        {
            let previous_overrides = self
                .applied_overrides
                .lock()
                .map_err(|error| InfraError::lock_poisoned("applied overrides", error))?
                .clone();
            let mut index = self.lock_index()?;
            let mut installed = self.lock_installed()?;

            let diff = index.refresh(devices);
            if !diff.is_empty() {
                tracing::info!(
                    added = diff.added.len(),
                    regrouped = diff.regrouped.len(),
                    removed = diff.removed.len(),
                    "managed device set changed"
                );
            }
            for gone in &diff.removed {
                report.removed.push(gone.device.mac.clone());
                report
                    .triggers
                    .merge(self.reconciler.remove_device(&mut installed, &gone.device.mac));
                tracing::info!(mac = %gone.device.mac, group = %gone.group, "device left managed set");
            }

            let moved = diff
                .added
                .iter()
                .map(|entry| entry.device.mac.clone())
                .chain(diff.regrouped.iter().map(|(entry, _)| entry.device.mac.clone()))
                .collect::<HashSet<_>>();
            report.added = diff.added.iter().map(|entry| entry.device.mac.clone()).collect();
            report.regrouped = diff
                .regrouped
                .iter()
                .map(|(entry, _)| entry.device.mac.clone())
                .collect();
            report.devices = index.len();

            for entry in index.devices() {
                let Some(group) = self.groups.get(&entry.group) else {
                    continue;
                };
                let desired = match compile_schedule(group, &entry.device.mac) {
                    Ok(desired) => desired,
                    Err(error) => {
                        tracing::error!(mac = %entry.device.mac, %error, "schedule did not compile");
                        continue;
                    }
                };
                let changed = self.reconciler.reconcile(
                    &mut installed,
                    &entry.device.mac,
                    &desired,
                    &self.callback,
                )?;

                let override_changed =
                    overrides.get(&entry.group) != previous_overrides.get(&entry.group);
                let needs_catch_up = changed.changed()
                    || moved.contains(&entry.device.mac)
                    || (group.enforce_schedule && override_changed);
                report.triggers.merge(changed);
                if !needs_catch_up {
                    continue;
                }

                let resolution = if group.enforce_schedule {
                    apply_override(resolve_current(now, &desired), overrides.get(&entry.group))
                } else {
                    Resolution::unenforced()
                };
                tracing::info!(
                    mac = %entry.device.mac,
                    group = %entry.group,
                    action = resolution.access.as_str(),
                    overridden = resolution.overridden,
                    "applying in-force action"
                );
                catch_up.push((entry.clone(), resolution));
            }
        }

        for (entry, resolution) in catch_up {
            let mac = entry.device.mac.clone();
            report.tasks.push(self.executor.dispatch(
                mac.clone(),
                entry.device.ip.clone(),
                PlannedAction::Access(resolution.access),
            ));
            if let Some(groups) = &resolution.filter_groups {
                report.tasks.push(self.executor.dispatch(
                    mac.clone(),
                    entry.device.ip.clone(),
                    PlannedAction::FilterGroups(groups.clone()),
                ));
            }
            report.catch_up.push((mac, resolution));
        }

        *self
            .applied_overrides
            .lock()
            .map_err(|error| InfraError::lock_poisoned("applied overrides", error))? = overrides;

        tracing::debug!(
            devices = report.devices,
            installed = report.triggers.installed.len(),
            cancelled = report.triggers.cancelled.len(),
            "recalculation pass finished"
        );
        Ok(report)
    }

    /// Handles a trigger firing: consumes a one-shot override, applies precedence, and
    /// dispatches the resulting action.
    pub fn fire_trigger(&self, descriptor: &TriggerDescriptor) -> Option<JoinHandle<()>> {
        let mac = &descriptor.key.mac;
        let entry = match self.lock_index() {
            Ok(index) => index.get(mac).cloned(),
            Err(error) => {
                tracing::error!(%mac, %error, "trigger skipped");
                return None;
            }
        };
        let Some(entry) = entry else {
            tracing::warn!(key = %descriptor.key, "trigger fired for unindexed device");
            return None;
        };
        if !self
            .groups
            .get(&entry.group)
            .is_some_and(|group| group.enforce_schedule)
        {
            return None;
        }

        let active = match self.overrides.take_for_trigger(&entry.group) {
            Ok(active) => active,
            Err(error) => {
                tracing::error!(%mac, group = %entry.group, %error, "override lookup failed");
                return None;
            }
        };
        let planned = planned_action(&descriptor.key.action, active.as_ref());
        tracing::info!(
            key = %descriptor.key,
            group = %entry.group,
            overridden = active.is_some(),
            action = ?planned,
            "trigger fired"
        );
        Some(self.executor.dispatch(mac.clone(), entry.device.ip, planned))
    }

    /// Cancels every installed trigger.
    pub fn shutdown(&self) -> Result<(), InfraError> {
        let mut installed = self.lock_installed()?;
        for mac in installed.macs() {
            self.reconciler.remove_device(&mut installed, &mac);
        }
        tracing::info!("all triggers cancelled");
        Ok(())
    }

    pub fn dump_schedule(&self) -> Result<(), InfraError> {
        let keys = self.installed_keys()?;
        tracing::info!(count = keys.len(), "installed triggers");
        for key in keys {
            tracing::info!(%key, "installed trigger");
        }
        Ok(())
    }

    pub fn status(&self) -> Result<Vec<DeviceStatus>, InfraError> {
        let now = self.now_instant();
        let overrides = self.overrides.snapshot()?;
        let devices = self.indexed_devices()?;
        devices
            .iter()
            .filter_map(|entry| {
                self.groups
                    .get(&entry.group)
                    .map(|group| device_status(now, entry, group, overrides.get(&entry.group)))
            })
            .collect()
    }

    pub fn dump_status(&self) -> Result<(), InfraError> {
        for status in self.status()? {
            tracing::info!(
                mac = %status.mac,
                group = %status.group,
                action = status.resolution.access.as_str(),
                last = ?status.last_trigger.as_ref().map(ToString::to_string),
                next = ?status.next_trigger.as_ref().map(ToString::to_string),
                overridden = status.resolution.overridden,
                "device status"
            );
        }
        Ok(())
    }

    fn spawn_pass(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.request_pass().await {
                Err(error) if error.is_transient() => tracing::debug!(%error, "pass failed"),
                Err(error) => tracing::error!(%error, "pass failed"),
                Ok(_) => {}
            }
        });
    }

    /// Drives periodic passes, event-driven passes and diagnostics until `shutdown` resolves.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<DeviceEvent>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), InfraError> {
        let mut period = self.settings.recompute_interval;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut schedule_dump = self.settings.dump_schedule_every.map(interval);
        let mut status_dump = self.settings.dump_status_every.map(interval);
        let mut events_open = true;
        tokio::pin!(shutdown);

        tracing::info!(
            groups = self.groups.len(),
            interval_seconds = self.settings.recompute_interval.as_secs(),
            dry_run = self.executor.is_dry_run(),
            "engine started"
        );

        loop {
            let mut retune = None;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    retune = self.changed_interval(period);
                    self.spawn_pass();
                }
                event = events.recv(), if events_open => match event {
                    Some(event) if matches_ssid_filter(event.ssid(), &self.settings.managed_ssids) => {
                        tracing::debug!(?event, "device event; recalculating");
                        self.spawn_pass();
                    }
                    Some(_) => {}
                    None => events_open = false,
                },
                _ = tick_optional(&mut schedule_dump) => {
                    if let Err(error) = self.dump_schedule() {
                        tracing::warn!(%error, "schedule dump failed");
                    }
                }
                _ = tick_optional(&mut status_dump) => {
                    if let Err(error) = self.dump_status() {
                        tracing::warn!(%error, "status dump failed");
                    }
                }
            }

            if let Some(next) = retune {
                tracing::info!(interval_seconds = next.as_secs(), "recompute interval changed");
                period = next;
                ticker = interval_at(Instant::now() + next, next);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }

        self.shutdown()
    }
}

async fn tick_optional(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::override_manager::OverrideRequest;
    use crate::domain::models::{
        AccessAction, OverrideCommand, ScheduleAction, ScheduleEntry, WeeklySchedule, NO_GROUP,
    };
    use crate::infrastructure::controller_client::{DirectoryGroup, InMemoryController, ListedDevice};
    use crate::infrastructure::filter_appliance::InMemoryFilterAppliance;
    use crate::infrastructure::state_store::InMemoryStateStore;
    use crate::infrastructure::trigger_timer::ManualTriggerTimer;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    const KID: &str = "aa:00:00:00:00:01";
    const GUEST: &str = "aa:00:00:00:00:02";

    struct Harness {
        engine: Arc<Engine>,
        controller: Arc<InMemoryController>,
        appliance: Arc<InMemoryFilterAppliance>,
        timer: ManualTriggerTimer,
        clock: Arc<Mutex<DateTime<Utc>>>,
        store: Arc<dyn StateStore>,
    }

    impl Harness {
        fn new(groups: Vec<ManagedGroup>) -> Self {
            let controller = Arc::new(InMemoryController::default());
            controller
                .set_groups(vec![
                    DirectoryGroup { id: "g-kids".to_string(), name: "kids".to_string() },
                    DirectoryGroup { id: "g-guest".to_string(), name: "guest".to_string() },
                ])
                .expect("groups");
            controller
                .set_connected(vec![device(KID, Some("g-kids")), device(GUEST, Some("g-guest"))])
                .expect("connected");

            let appliance = Arc::new(InMemoryFilterAppliance::with_groups(&[
                (0, "default"),
                (3, "homework"),
            ]));
            appliance.register_client("10.0.0.1", 1).expect("register");
            let timer = ManualTriggerTimer::default();
            let names = groups.iter().map(|group| group.name.clone()).collect::<Vec<_>>();
            let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
            let overrides =
                Arc::new(OverrideManager::load(Arc::clone(&store), names).expect("overrides"));
            let executor = Arc::new(ActionExecutor::new(controller.clone(), Some(appliance.clone())));
            let clock = Arc::new(Mutex::new(wednesday(10, 0)));
            let now = Arc::clone(&clock);

            let engine = Engine::with_now_provider(
                EngineParts {
                    groups,
                    settings: EngineSettings::default(),
                    listing: controller.clone(),
                    directory: controller.clone(),
                    timer: Arc::new(timer.clone()),
                    overrides,
                    executor,
                    tunables: Arc::clone(&store),
                },
                Arc::new(move || *now.lock().expect("clock")),
            );
            Self { engine, controller, appliance, timer, clock, store }
        }

        fn set_time(&self, value: DateTime<Utc>) {
            *self.clock.lock().expect("clock") = value;
        }

        async fn pass(&self) -> PassReport {
            let mut report = self
                .engine
                .request_pass()
                .await
                .expect("pass")
                .expect("not coalesced");
            report.settle().await;
            report
        }

        fn key(&self, day: u8, hour: u8, minute: u8, action: ScheduleAction) -> TriggerKey {
            TriggerKey { mac: KID.to_string(), minute, hour, day, action }
        }

        async fn fire(&self, key: &TriggerKey) {
            let descriptor = TriggerDescriptor { key: key.clone(), order: 0 };
            if let Some(task) = self.engine.fire_trigger(&descriptor) {
                task.await.expect("dispatch");
            }
        }

        fn set_override(&self, command: OverrideCommand, until_next_trigger: bool) {
            self.engine
                .overrides()
                .set_override(OverrideRequest {
                    group: "kids".to_string(),
                    command,
                    until_next_trigger,
                    filter_groups: None,
                })
                .expect("override");
        }
    }

    fn device(mac: &str, group_id: Option<&str>) -> ListedDevice {
        ListedDevice {
            id: format!("id-{mac}"),
            mac: mac.to_string(),
            ip: Some("10.0.0.1".to_string()),
            group_id: group_id.map(ToOwned::to_owned),
            ssid: Some("Home".to_string()),
        }
    }

    // 2024-05-15 is a Wednesday.
    fn wednesday(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, hour, minute, 0)
            .single()
            .expect("valid time")
    }

    fn kids_group() -> ManagedGroup {
        ManagedGroup {
            name: "kids".to_string(),
            enforce_schedule: true,
            harsh: false,
            schedule: WeeklySchedule::every_day(&[
                ScheduleEntry::new("00:00", ScheduleAction::Block),
                ScheduleEntry::new("09:00", ScheduleAction::Unblock),
                ScheduleEntry::new("22:30", ScheduleAction::Block),
            ]),
        }
    }

    fn guest_group() -> ManagedGroup {
        ManagedGroup {
            name: "guest".to_string(),
            enforce_schedule: false,
            harsh: false,
            schedule: WeeklySchedule::every_day(&[ScheduleEntry::new(
                "00:00",
                ScheduleAction::Block,
            )]),
        }
    }

    #[tokio::test]
    async fn first_pass_installs_triggers_and_catches_up() {
        let harness = Harness::new(vec![kids_group(), guest_group()]);
        let report = harness.pass().await;

        assert_eq!(report.triggers.installed.len(), 21);
        assert_eq!(harness.timer.installed_keys().expect("keys").len(), 21);
        assert_eq!(
            report.resolution_for(KID).map(|resolution| resolution.access),
            Some(AccessAction::Unblock)
        );
        assert_eq!(harness.controller.last_blocked(KID).expect("calls"), Some(false));
        assert_eq!(harness.controller.last_blocked(GUEST).expect("calls"), Some(false));
    }

    #[tokio::test]
    async fn unchanged_pass_applies_nothing() {
        let harness = Harness::new(vec![kids_group(), guest_group()]);
        harness.pass().await;
        let calls = harness.controller.blocked_calls().expect("calls").len();

        let report = harness.pass().await;
        assert!(!report.triggers.changed());
        assert!(report.catch_up.is_empty());
        assert_eq!(harness.controller.blocked_calls().expect("calls").len(), calls);
    }

    #[tokio::test]
    async fn unreachable_controller_aborts_without_touching_state() {
        let harness = Harness::new(vec![kids_group()]);
        harness.pass().await;
        let before = harness.engine.installed_keys().expect("keys");

        harness.controller.set_unavailable(true).expect("offline");
        let result = harness.engine.request_pass().await;
        assert!(matches!(result, Err(InfraError::CollaboratorUnavailable(_))));
        assert_eq!(harness.engine.installed_keys().expect("keys"), before);
        assert_eq!(harness.engine.indexed_devices().expect("devices").len(), 1);
    }

    #[tokio::test]
    async fn device_leaving_managed_groups_loses_its_triggers() {
        let harness = Harness::new(vec![kids_group()]);
        harness.pass().await;

        harness
            .controller
            .set_connected(vec![device(KID, Some("g-parents"))])
            .expect("regroup");
        let report = harness.pass().await;
        assert_eq!(report.removed, vec![KID.to_string()]);
        assert!(harness.timer.installed_keys().expect("keys").is_empty());
    }

    #[tokio::test]
    async fn override_beats_the_schedule_at_catch_up_and_firing() {
        let harness = Harness::new(vec![kids_group()]);
        harness.pass().await;
        harness.set_override(OverrideCommand::Block, false);

        let report = harness.pass().await;
        let resolution = report.resolution_for(KID).expect("catch up");
        assert_eq!(resolution.access, AccessAction::Block);
        assert!(resolution.overridden);

        harness.fire(&harness.key(3, 9, 0, ScheduleAction::Unblock)).await;
        assert_eq!(harness.controller.last_blocked(KID).expect("calls"), Some(true));
        assert!(harness.engine.overrides().get("kids").expect("get").is_some());
    }

    #[tokio::test]
    async fn until_next_trigger_override_is_consumed_by_the_next_firing() {
        let harness = Harness::new(vec![kids_group()]);
        harness.pass().await;
        harness.set_override(OverrideCommand::Unblock, true);
        harness.set_time(wednesday(22, 0));
        harness.pass().await;
        assert_eq!(harness.controller.last_blocked(KID).expect("calls"), Some(false));

        // The consuming trigger runs its own schedule action.
        harness.set_time(wednesday(22, 30));
        harness.fire(&harness.key(3, 22, 30, ScheduleAction::Block)).await;
        assert_eq!(harness.engine.overrides().get("kids").expect("get"), None);
        assert_eq!(harness.controller.last_blocked(KID).expect("calls"), Some(true));

        harness.fire(&harness.key(4, 9, 0, ScheduleAction::Unblock)).await;
        assert_eq!(harness.controller.last_blocked(KID).expect("calls"), Some(false));
    }

    #[tokio::test]
    async fn unenforced_group_ignores_overrides() {
        let harness = Harness::new(vec![kids_group(), guest_group()]);
        harness.pass().await;
        harness
            .engine
            .overrides()
            .set_override(OverrideRequest {
                group: "guest".to_string(),
                command: OverrideCommand::Block,
                until_next_trigger: false,
                filter_groups: None,
            })
            .expect("override");

        let report = harness.pass().await;
        assert!(report.resolution_for(GUEST).is_none());
        let status = harness.engine.status().expect("status");
        let guest = status.iter().find(|entry| entry.mac == GUEST).expect("guest");
        assert_eq!(guest.resolution.access, AccessAction::Unblock);
        assert!(!guest.resolution.overridden);
        assert_eq!(harness.controller.last_blocked(GUEST).expect("calls"), Some(false));
    }

    #[tokio::test]
    async fn filter_triggers_apply_filter_groups() {
        let mut group = kids_group();
        group.schedule.push(
            3,
            ScheduleEntry::new("16:00", ScheduleAction::FilterSet(vec!["homework".to_string()])),
        );
        let harness = Harness::new(vec![group]);
        harness.set_time(wednesday(17, 0));
        let report = harness.pass().await;

        assert_eq!(
            report.resolution_for(KID).and_then(|resolution| resolution.filter_groups.clone()),
            Some(vec!["homework".to_string()])
        );
        assert_eq!(harness.appliance.memberships_of(1).expect("read"), Some(vec![3]));
    }

    #[tokio::test]
    async fn groupless_devices_follow_the_nogroup_entry() {
        let mut nogroup = guest_group();
        nogroup.name = NO_GROUP.to_string();
        nogroup.enforce_schedule = true;
        let harness = Harness::new(vec![nogroup]);
        harness
            .controller
            .set_connected(vec![device(KID, None)])
            .expect("connected");

        let report = harness.pass().await;
        assert_eq!(
            report.resolution_for(KID).map(|resolution| resolution.access),
            Some(AccessAction::Block)
        );
    }

    #[tokio::test]
    async fn manual_timer_firing_reaches_the_controller() {
        let harness = Harness::new(vec![kids_group()]);
        harness.pass().await;
        let key = harness.key(3, 22, 30, ScheduleAction::Block);

        assert!(harness.timer.fire(&key).expect("fire"));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(harness.controller.last_blocked(KID).expect("calls"), Some(true));
    }

    #[tokio::test]
    async fn shutdown_cancels_all_triggers() {
        let harness = Harness::new(vec![kids_group()]);
        harness.pass().await;
        harness.engine.shutdown().expect("shutdown");
        assert!(harness.timer.installed_keys().expect("keys").is_empty());
        assert!(harness.engine.installed_keys().expect("keys").is_empty());
    }

    /// Listing whose first call blocks until released.
    struct GatedListing {
        inner: Arc<InMemoryController>,
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl DeviceListing for GatedListing {
        async fn list_connected_devices(
            &self,
            ssid_filter: &[String],
        ) -> Result<Vec<ListedDevice>, InfraError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.release.notified().await;
            }
            self.inner.list_connected_devices(ssid_filter).await
        }

        async fn list_known_devices(&self) -> Result<Vec<ListedDevice>, InfraError> {
            self.inner.list_known_devices().await
        }
    }

    #[tokio::test]
    async fn requests_during_a_pass_collapse_into_one_follow_up() {
        let harness = Harness::new(vec![kids_group()]);
        let listing = Arc::new(GatedListing {
            inner: harness.controller.clone(),
            calls: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let engine = Engine::with_now_provider(
            EngineParts {
                groups: vec![kids_group()],
                settings: EngineSettings::default(),
                listing: listing.clone(),
                directory: harness.controller.clone(),
                timer: Arc::new(ManualTriggerTimer::default()),
                overrides: Arc::clone(harness.engine.overrides()),
                executor: Arc::new(ActionExecutor::new(harness.controller.clone(), None)),
                tunables: Arc::clone(&harness.store),
            },
            Arc::new(|| wednesday(10, 0)),
        );

        let running = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.request_pass().await }
        });
        while listing.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..3 {
            assert!(engine.request_pass().await.expect("queued").is_none());
        }
        listing.release.notify_one();

        let mut report = running
            .await
            .expect("join")
            .expect("pass")
            .expect("ran");
        report.settle().await;
        assert_eq!(listing.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.devices, 1);
        assert_eq!(harness.controller.last_blocked(KID).expect("calls"), Some(false));
    }

    #[tokio::test]
    async fn dry_run_written_to_the_store_applies_on_the_next_pass() {
        let harness = Harness::new(vec![kids_group()]);
        harness.store.set(DRY_RUN_KEY, "true").expect("set");
        let report = harness.pass().await;
        assert_eq!(report.catch_up.len(), 1);
        assert!(harness.engine.executor.is_dry_run());
        assert!(harness.controller.blocked_calls().expect("calls").is_empty());

        harness.store.set(DRY_RUN_KEY, "false").expect("set");
        harness.set_override(OverrideCommand::Block, false);
        harness.pass().await;
        assert!(!harness.engine.executor.is_dry_run());
        assert_eq!(harness.controller.last_blocked(KID).expect("calls"), Some(true));
    }

    #[tokio::test]
    async fn recompute_interval_follows_the_store() {
        let harness = Harness::new(vec![kids_group()]);
        let current = Duration::from_secs(60);
        assert_eq!(harness.engine.changed_interval(current), None);

        harness.store.set(RECOMPUTE_INTERVAL_KEY, "15").expect("set");
        assert_eq!(
            harness.engine.changed_interval(current),
            Some(Duration::from_secs(15))
        );
        assert_eq!(harness.engine.changed_interval(Duration::from_secs(15)), None);

        harness.store.set(RECOMPUTE_INTERVAL_KEY, "0").expect("set");
        assert_eq!(harness.engine.changed_interval(current), None);
    }
}
