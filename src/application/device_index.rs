use crate::domain::models::{Device, NO_GROUP};
use crate::infrastructure::controller_client::{DeviceListing, GroupDirectory, ListedDevice};
use crate::infrastructure::error::InfraError;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A device whose controller group maps to a configured managed group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDevice {
    pub device: Device,
    /// Managed group name the device's schedule comes from.
    pub group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    pub added: Vec<IndexedDevice>,
    /// Devices whose managed group changed; carries the previous group name.
    pub regrouped: Vec<(IndexedDevice, String)>,
    pub removed: Vec<IndexedDevice>,
}

impl IndexDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.regrouped.is_empty() && self.removed.is_empty()
    }
}

/// Cache of MAC -> managed group membership, replaced wholesale on every refresh.
#[derive(Debug, Default)]
pub struct DeviceGroupIndex {
    devices: BTreeMap<String, IndexedDevice>,
}

impl DeviceGroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mac: &str) -> Option<&IndexedDevice> {
        self.devices.get(mac)
    }

    pub fn devices(&self) -> impl Iterator<Item = &IndexedDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Replaces the index with `listing` and reports what changed.
    pub fn refresh(&mut self, listing: Vec<IndexedDevice>) -> IndexDiff {
        let mut diff = IndexDiff::default();
        let mut next = BTreeMap::new();

        for entry in listing {
            let mac = entry.device.mac.clone();
            if next.contains_key(&mac) {
                continue;
            }
            match self.devices.get(&mac) {
                None => diff.added.push(entry.clone()),
                Some(previous) if previous.group != entry.group => {
                    diff.regrouped.push((entry.clone(), previous.group.clone()));
                }
                Some(_) => {}
            }
            next.insert(mac, entry);
        }

        for (mac, previous) in &self.devices {
            if !next.contains_key(mac) {
                diff.removed.push(previous.clone());
            }
        }

        self.devices = next;
        diff
    }
}

/// Maps controller group ids to names, keeping only configured managed groups.
pub fn managed_group_names(
    directory: &[(String, String)],
    managed: &HashSet<String>,
) -> HashMap<String, String> {
    directory
        .iter()
        .filter(|(_, name)| managed.contains(name))
        .cloned()
        .collect()
}

/// Fetches the devices that fall under managed groups.
///
/// Connected devices on the managed SSIDs are taken first; a device without a group uses
/// the `NOGROUP` entry when it is configured. Known but offline devices are added only when
/// they belong to a named managed group. Devices of unmanaged groups are left out.
pub async fn fetch_managed_devices(
    listing: &dyn DeviceListing,
    directory: &dyn GroupDirectory,
    managed: &HashSet<String>,
    ssid_filter: &[String],
) -> Result<Vec<IndexedDevice>, InfraError> {
    let groups = directory
        .list_groups()
        .await?
        .into_iter()
        .map(|group| (group.id, group.name))
        .collect::<Vec<_>>();
    let id_to_name = managed_group_names(&groups, managed);

    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    for listed in listing.list_connected_devices(ssid_filter).await? {
        let Some(group) = membership(&listed, &id_to_name, managed, true) else {
            tracing::trace!(mac = %listed.mac, "connected device not in a managed group");
            continue;
        };
        if let Some(entry) = index_entry(listed, group) {
            if seen.insert(entry.device.mac.clone()) {
                devices.push(entry);
            }
        }
    }

    for listed in listing.list_known_devices().await? {
        let Some(group) = membership(&listed, &id_to_name, managed, false) else {
            continue;
        };
        if let Some(entry) = index_entry(listed, group) {
            if seen.insert(entry.device.mac.clone()) {
                devices.push(entry);
            }
        }
    }

    Ok(devices)
}

fn membership(
    listed: &ListedDevice,
    id_to_name: &HashMap<String, String>,
    managed: &HashSet<String>,
    allow_no_group: bool,
) -> Option<String> {
    match listed.group_id.as_deref() {
        Some(id) => id_to_name.get(id).cloned(),
        None if allow_no_group && managed.contains(NO_GROUP) => Some(NO_GROUP.to_string()),
        None => None,
    }
}

fn index_entry(listed: ListedDevice, group: String) -> Option<IndexedDevice> {
    let device = Device::new(listed.id, &listed.mac, listed.ip, listed.group_id);
    if let Err(error) = device.validate() {
        tracing::warn!(mac = %listed.mac, %error, "skipping device with invalid identity");
        return None;
    }
    Some(IndexedDevice { device, group })
}
