use crate::domain::models::{TriggerDescriptor, TriggerKey};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::trigger_timer::{TimerHandle, TriggerCallback, TriggerTimer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug)]
struct InstalledTrigger {
    descriptor: TriggerDescriptor,
    handle: TimerHandle,
}

/// Live timers, grouped by device MAC.
#[derive(Debug, Default)]
pub struct InstalledTriggerSet {
    by_mac: BTreeMap<String, HashMap<TriggerKey, InstalledTrigger>>,
}

impl InstalledTriggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys_for(&self, mac: &str) -> HashSet<TriggerKey> {
        self.by_mac
            .get(mac)
            .map(|installed| installed.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Installed descriptors of one device, in schedule order.
    pub fn descriptors_for(&self, mac: &str) -> Vec<TriggerDescriptor> {
        let mut descriptors = self
            .by_mac
            .get(mac)
            .map(|installed| {
                installed
                    .values()
                    .map(|trigger| trigger.descriptor.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        descriptors.sort_by_key(|descriptor| (descriptor.sort_key(), descriptor.order));
        descriptors
    }

    pub fn macs(&self) -> Vec<String> {
        self.by_mac.keys().cloned().collect()
    }

    pub fn contains(&self, key: &TriggerKey) -> bool {
        self.by_mac
            .get(&key.mac)
            .is_some_and(|installed| installed.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.by_mac.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, descriptor: TriggerDescriptor, handle: TimerHandle) {
        self.by_mac
            .entry(descriptor.key.mac.clone())
            .or_default()
            .insert(descriptor.key.clone(), InstalledTrigger { descriptor, handle });
    }

    fn remove(&mut self, key: &TriggerKey) -> Option<TimerHandle> {
        let installed = self.by_mac.get_mut(&key.mac)?;
        let removed = installed.remove(key).map(|trigger| trigger.handle);
        if installed.is_empty() {
            self.by_mac.remove(&key.mac);
        }
        removed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub cancelled: Vec<TriggerKey>,
    pub installed: Vec<TriggerKey>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.cancelled.is_empty() || !self.installed.is_empty()
    }

    pub fn merge(&mut self, other: ReconcileReport) {
        self.cancelled.extend(other.cancelled);
        self.installed.extend(other.installed);
    }
}

/// Set difference by key: what to cancel and what to install.
pub fn diff_triggers(
    installed: &HashSet<TriggerKey>,
    desired: &[TriggerDescriptor],
) -> (Vec<TriggerKey>, Vec<TriggerDescriptor>) {
    let desired_keys = desired
        .iter()
        .map(|descriptor| &descriptor.key)
        .collect::<HashSet<_>>();
    let mut to_cancel = installed
        .iter()
        .filter(|key| !desired_keys.contains(key))
        .cloned()
        .collect::<Vec<_>>();
    to_cancel.sort_by_key(TriggerKey::minute_of_week);

    let mut queued = HashSet::new();
    let to_install = desired
        .iter()
        .filter(|descriptor| !installed.contains(&descriptor.key))
        .filter(|descriptor| queued.insert(descriptor.key.clone()))
        .cloned()
        .collect();
    (to_cancel, to_install)
}

pub struct TriggerSetReconciler {
    timer: Arc<dyn TriggerTimer>,
}

impl TriggerSetReconciler {
    pub fn new(timer: Arc<dyn TriggerTimer>) -> Self {
        Self { timer }
    }

    /// Brings the device's installed triggers in line with `desired`.
    ///
    /// Unchanged keys keep their running timers. Every newly installed timer runs `callback`.
    pub fn reconcile(
        &self,
        installed: &mut InstalledTriggerSet,
        mac: &str,
        desired: &[TriggerDescriptor],
        callback: &TriggerCallback,
    ) -> Result<ReconcileReport, InfraError> {
        let (to_cancel, to_install) = diff_triggers(&installed.keys_for(mac), desired);
        let mut report = ReconcileReport::default();

        for key in to_cancel {
            if let Some(handle) = installed.remove(&key) {
                handle.cancel();
            }
            tracing::info!(%key, "trigger cancelled");
            report.cancelled.push(key);
        }

        for descriptor in to_install {
            let key = descriptor.key.clone();
            let handle = self.timer.schedule(descriptor.clone(), Arc::clone(callback))?;
            installed.insert(descriptor, handle);
            tracing::info!(%key, "trigger installed");
            report.installed.push(key);
        }

        Ok(report)
    }

    /// Cancels every trigger of a device that left the managed set.
    pub fn remove_device(&self, installed: &mut InstalledTriggerSet, mac: &str) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for key in installed.keys_for(mac) {
            if let Some(handle) = installed.remove(&key) {
                handle.cancel();
            }
            tracing::info!(%key, "trigger cancelled");
            report.cancelled.push(key);
        }
        report
    }
}
