use crate::domain::models::normalize_mac;
use crate::infrastructure::config::ControllerConfig;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// A device as reported by the controller, before any group mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedDevice {
    pub id: String,
    pub mac: String,
    pub ip: Option<String>,
    pub group_id: Option<String>,
    pub ssid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected { mac: String, ssid: Option<String> },
    Disconnected { mac: String, ssid: Option<String> },
}

impl DeviceEvent {
    pub fn ssid(&self) -> Option<&str> {
        match self {
            DeviceEvent::Connected { ssid, .. } | DeviceEvent::Disconnected { ssid, .. } => {
                ssid.as_deref()
            }
        }
    }
}

#[async_trait]
pub trait DeviceListing: Send + Sync {
    /// Connected devices; an empty filter means every SSID.
    async fn list_connected_devices(
        &self,
        ssid_filter: &[String],
    ) -> Result<Vec<ListedDevice>, InfraError>;

    async fn list_known_devices(&self) -> Result<Vec<ListedDevice>, InfraError>;
}

#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<DirectoryGroup>, InfraError>;
}

#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn set_blocked(&self, mac: &str, blocked: bool) -> Result<(), InfraError>;
}

pub fn matches_ssid_filter(ssid: Option<&str>, ssid_filter: &[String]) -> bool {
    if ssid_filter.is_empty() {
        return true;
    }
    ssid.is_some_and(|ssid| ssid_filter.iter().any(|allowed| allowed == ssid))
}

/// Controller speaking the UniFi-style REST API with a cookie session.
#[derive(Debug)]
pub struct ReqwestControllerClient {
    client: Client,
    base_url: Url,
    site: String,
    username: String,
    password: String,
    logged_in: tokio::sync::Mutex<bool>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    meta: EnvelopeMeta,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeMeta {
    rc: String,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StationRecord {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(rename = "user_id", default)]
    user_id: Option<String>,
    mac: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    usergroup_id: Option<String>,
    #[serde(default)]
    essid: Option<String>,
}

impl StationRecord {
    fn into_listed(self) -> ListedDevice {
        let mac = normalize_mac(&self.mac);
        ListedDevice {
            id: self.user_id.or(self.id).unwrap_or_else(|| mac.clone()),
            mac,
            ip: self.ip.filter(|ip| !ip.trim().is_empty()),
            group_id: self.usergroup_id.filter(|id| !id.trim().is_empty()),
            ssid: self.essid,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserGroupRecord {
    #[serde(rename = "_id")]
    id: String,
    name: String,
}

impl ReqwestControllerClient {
    pub fn new(config: &ControllerConfig, password: String) -> Result<Self, InfraError> {
        let mut base_url = Url::parse(&config.url).map_err(|error| {
            InfraError::InvalidConfig(format!("invalid controller url '{}': {error}", config.url))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|error| {
                InfraError::CollaboratorUnavailable(format!("failed building http client: {error}"))
            })?;

        Ok(Self {
            client,
            base_url,
            site: config.site.clone(),
            username: config.username.clone(),
            password,
            logged_in: tokio::sync::Mutex::new(false),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("controller URL cannot be a base".to_string())
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    fn site_endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut full = vec!["api", "s", self.site.as_str()];
        full.extend_from_slice(segments);
        self.endpoint(&full)
    }

    fn unavailable_http_error(action: &str, status: StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("controller {action} failed: http {}", status.as_u16())
        } else {
            format!("controller {action} failed: http {}; body={body}", status.as_u16())
        };
        InfraError::CollaboratorUnavailable(message)
    }

    async fn login(&self) -> Result<(), InfraError> {
        let response = self
            .client
            .post(self.endpoint(&["api", "login"])?)
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(|error| {
                InfraError::CollaboratorUnavailable(format!("network error during login: {error}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::unavailable_http_error("login", status, &body));
        }
        tracing::debug!(site = %self.site, "controller session established");
        Ok(())
    }

    async fn ensure_session(&self) -> Result<(), InfraError> {
        let mut logged_in = self.logged_in.lock().await;
        if !*logged_in {
            self.login().await?;
            *logged_in = true;
        }
        Ok(())
    }

    async fn invalidate_session(&self) {
        *self.logged_in.lock().await = false;
    }

    async fn get_records<T: DeserializeOwned>(
        &self,
        segments: &[&str],
    ) -> Result<Vec<T>, InfraError> {
        let url = self.site_endpoint(segments)?;
        let action = segments.join("/");

        for attempt in 0..2 {
            self.ensure_session().await?;
            let response = self.client.get(url.clone()).send().await.map_err(|error| {
                InfraError::CollaboratorUnavailable(format!(
                    "network error while fetching {action}: {error}"
                ))
            })?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                self.invalidate_session().await;
                continue;
            }

            let body = response.text().await.map_err(|error| {
                InfraError::CollaboratorUnavailable(format!(
                    "failed reading {action} response: {error}"
                ))
            })?;
            if !status.is_success() {
                return Err(Self::unavailable_http_error(&action, status, &body));
            }
            return parse_envelope(&body).map_err(InfraError::CollaboratorUnavailable);
        }

        Err(InfraError::CollaboratorUnavailable(format!(
            "controller rejected session while fetching {action}"
        )))
    }
}

fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<Vec<T>, String> {
    let envelope: Envelope<T> = serde_json::from_str(body)
        .map_err(|error| format!("invalid controller payload: {error}"))?;
    if envelope.meta.rc != "ok" {
        return Err(format!(
            "controller returned rc={} msg={}",
            envelope.meta.rc,
            envelope.meta.msg.unwrap_or_default()
        ));
    }
    Ok(envelope.data)
}

#[async_trait]
impl DeviceListing for ReqwestControllerClient {
    async fn list_connected_devices(
        &self,
        ssid_filter: &[String],
    ) -> Result<Vec<ListedDevice>, InfraError> {
        let stations: Vec<StationRecord> = self.get_records(&["stat", "sta"]).await?;
        Ok(stations
            .into_iter()
            .map(StationRecord::into_listed)
            .filter(|device| matches_ssid_filter(device.ssid.as_deref(), ssid_filter))
            .collect())
    }

    async fn list_known_devices(&self) -> Result<Vec<ListedDevice>, InfraError> {
        let users: Vec<StationRecord> = self.get_records(&["rest", "user"]).await?;
        Ok(users.into_iter().map(StationRecord::into_listed).collect())
    }
}

#[async_trait]
impl GroupDirectory for ReqwestControllerClient {
    async fn list_groups(&self) -> Result<Vec<DirectoryGroup>, InfraError> {
        let groups: Vec<UserGroupRecord> = self.get_records(&["list", "usergroup"]).await?;
        Ok(groups
            .into_iter()
            .map(|group| DirectoryGroup {
                id: group.id,
                name: group.name,
            })
            .collect())
    }
}

#[async_trait]
impl AccessControl for ReqwestControllerClient {
    async fn set_blocked(&self, mac: &str, blocked: bool) -> Result<(), InfraError> {
        let command = if blocked { "block-sta" } else { "unblock-sta" };
        self.ensure_session()
            .await
            .map_err(|error| InfraError::ActionFailed(error.to_string()))?;

        let response = self
            .client
            .post(self.site_endpoint(&["cmd", "stamgr"])?)
            .json(&serde_json::json!({ "cmd": command, "mac": normalize_mac(mac) }))
            .send()
            .await
            .map_err(|error| InfraError::ActionFailed(format!("{command} {mac}: {error}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_session().await;
        }
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(InfraError::ActionFailed(format!(
                "{command} {mac}: http {}; body={body}",
                status.as_u16()
            )));
        }
        parse_envelope::<serde_json::Value>(&body)
            .map(|_| ())
            .map_err(|error| InfraError::ActionFailed(format!("{command} {mac}: {error}")))
    }
}

/// Polls the connected-device list and reports connects and disconnects.
///
/// The first poll only seeds the baseline. Polling stops once the receiver is dropped.
pub fn spawn_connection_watcher(
    listing: std::sync::Arc<dyn DeviceListing>,
    interval: Duration,
    sender: mpsc::Sender<DeviceEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut previous: Option<HashMap<String, Option<String>>> = None;

        loop {
            ticker.tick().await;
            let current = match listing.list_connected_devices(&[]).await {
                Ok(devices) => devices
                    .into_iter()
                    .map(|device| (device.mac, device.ssid))
                    .collect::<HashMap<_, _>>(),
                Err(error) => {
                    tracing::debug!(%error, "connection watcher poll failed");
                    continue;
                }
            };

            if let Some(previous) = previous.as_ref() {
                for event in diff_connections(previous, &current) {
                    if sender.send(event).await.is_err() {
                        return;
                    }
                }
            }
            previous = Some(current);
        }
    })
}

pub fn diff_connections(
    previous: &HashMap<String, Option<String>>,
    current: &HashMap<String, Option<String>>,
) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    for (mac, ssid) in current {
        if !previous.contains_key(mac) {
            events.push(DeviceEvent::Connected {
                mac: mac.clone(),
                ssid: ssid.clone(),
            });
        }
    }
    for (mac, ssid) in previous {
        if !current.contains_key(mac) {
            events.push(DeviceEvent::Disconnected {
                mac: mac.clone(),
                ssid: ssid.clone(),
            });
        }
    }
    events
}

/// Scriptable controller used by tests and dry local runs.
#[derive(Debug, Default)]
pub struct InMemoryController {
    state: Mutex<InMemoryControllerState>,
}

#[derive(Debug, Default)]
struct InMemoryControllerState {
    connected: Vec<ListedDevice>,
    known: Vec<ListedDevice>,
    groups: Vec<DirectoryGroup>,
    blocked_calls: Vec<(String, bool)>,
    unavailable: bool,
    failing_macs: Vec<String>,
}

impl InMemoryController {
    fn with_state<R>(
        &self,
        apply: impl FnOnce(&mut InMemoryControllerState) -> R,
    ) -> Result<R, InfraError> {
        let mut state = self
            .state
            .lock()
            .map_err(|error| InfraError::lock_poisoned("in-memory controller", error))?;
        Ok(apply(&mut state))
    }

    pub fn set_connected(&self, devices: Vec<ListedDevice>) -> Result<(), InfraError> {
        self.with_state(|state| state.connected = devices)
    }

    pub fn set_known(&self, devices: Vec<ListedDevice>) -> Result<(), InfraError> {
        self.with_state(|state| state.known = devices)
    }

    pub fn set_groups(&self, groups: Vec<DirectoryGroup>) -> Result<(), InfraError> {
        self.with_state(|state| state.groups = groups)
    }

    pub fn set_unavailable(&self, unavailable: bool) -> Result<(), InfraError> {
        self.with_state(|state| state.unavailable = unavailable)
    }

    pub fn fail_commands_for(&self, mac: &str) -> Result<(), InfraError> {
        self.with_state(|state| state.failing_macs.push(normalize_mac(mac)))
    }

    /// Every `set_blocked` call seen so far, in order.
    pub fn blocked_calls(&self) -> Result<Vec<(String, bool)>, InfraError> {
        self.with_state(|state| state.blocked_calls.clone())
    }

    pub fn last_blocked(&self, mac: &str) -> Result<Option<bool>, InfraError> {
        let mac = normalize_mac(mac);
        self.with_state(|state| {
            state
                .blocked_calls
                .iter()
                .rev()
                .find(|(called, _)| *called == mac)
                .map(|(_, blocked)| *blocked)
        })
    }

    fn check_available(&self) -> Result<(), InfraError> {
        if self.with_state(|state| state.unavailable)? {
            return Err(InfraError::CollaboratorUnavailable(
                "in-memory controller offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceListing for InMemoryController {
    async fn list_connected_devices(
        &self,
        ssid_filter: &[String],
    ) -> Result<Vec<ListedDevice>, InfraError> {
        self.check_available()?;
        self.with_state(|state| {
            state
                .connected
                .iter()
                .filter(|device| matches_ssid_filter(device.ssid.as_deref(), ssid_filter))
                .cloned()
                .collect()
        })
    }

    async fn list_known_devices(&self) -> Result<Vec<ListedDevice>, InfraError> {
        self.check_available()?;
        self.with_state(|state| state.known.clone())
    }
}

#[async_trait]
impl GroupDirectory for InMemoryController {
    async fn list_groups(&self) -> Result<Vec<DirectoryGroup>, InfraError> {
        self.check_available()?;
        self.with_state(|state| state.groups.clone())
    }
}

#[async_trait]
impl AccessControl for InMemoryController {
    async fn set_blocked(&self, mac: &str, blocked: bool) -> Result<(), InfraError> {
        let mac = normalize_mac(mac);
        let failing = self.with_state(|state| {
            state.blocked_calls.push((mac.clone(), blocked));
            state.failing_macs.contains(&mac)
        })?;
        if failing {
            return Err(InfraError::ActionFailed(format!("controller refused {mac}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(mac: &str, ssid: Option<&str>) -> ListedDevice {
        ListedDevice {
            id: mac.to_string(),
            mac: mac.to_string(),
            ip: None,
            group_id: None,
            ssid: ssid.map(ToOwned::to_owned),
        }
    }

    #[test]
    fn station_payload_maps_to_listed_devices() {
        let body = r#"{
            "meta": { "rc": "ok" },
            "data": [
                { "_id": "s1", "user_id": "u1", "mac": "AA-BB-CC-00-11-22", "ip": "10.0.0.5",
                  "usergroup_id": "g1", "essid": "Home" },
                { "_id": "s2", "mac": "aa:bb:cc:00:11:33", "ip": "", "usergroup_id": "" }
            ]
        }"#;
        let stations = parse_envelope::<StationRecord>(body).expect("parse");
        let devices = stations
            .into_iter()
            .map(StationRecord::into_listed)
            .collect::<Vec<_>>();

        assert_eq!(devices[0].id, "u1");
        assert_eq!(devices[0].mac, "aa:bb:cc:00:11:22");
        assert_eq!(devices[0].group_id.as_deref(), Some("g1"));
        assert_eq!(devices[1].id, "s2");
        assert_eq!(devices[1].ip, None);
        assert_eq!(devices[1].group_id, None);
    }

    #[test]
    fn error_envelope_is_reported() {
        let body = r#"{ "meta": { "rc": "error", "msg": "api.err.LoginRequired" }, "data": [] }"#;
        let error = parse_envelope::<UserGroupRecord>(body).expect_err("must fail");
        assert!(error.contains("LoginRequired"));
    }

    #[test]
    fn ssid_filter_is_optional() {
        let managed = vec!["Kids".to_string()];
        assert!(matches_ssid_filter(Some("Guest"), &[]));
        assert!(matches_ssid_filter(Some("Kids"), &managed));
        assert!(!matches_ssid_filter(Some("Guest"), &managed));
        assert!(!matches_ssid_filter(None, &managed));
    }

    #[test]
    fn endpoints_are_built_under_the_site() {
        let config = ControllerConfig {
            url: "https://unifi.local:8443".to_string(),
            site: "home".to_string(),
            ..ControllerConfig::default()
        };
        let client = ReqwestControllerClient::new(&config, "secret".to_string()).expect("client");
        assert_eq!(
            client.site_endpoint(&["stat", "sta"]).expect("url").as_str(),
            "https://unifi.local:8443/api/s/home/stat/sta"
        );
    }

    #[test]
    fn connection_diff_reports_both_directions() {
        let previous = HashMap::from([
            ("aa".to_string(), Some("Home".to_string())),
            ("bb".to_string(), None),
        ]);
        let current = HashMap::from([
            ("bb".to_string(), None),
            ("cc".to_string(), Some("Kids".to_string())),
        ]);
        let events = diff_connections(&previous, &current);
        assert_eq!(events.len(), 2);
        assert!(events.contains(&DeviceEvent::Connected {
            mac: "cc".to_string(),
            ssid: Some("Kids".to_string())
        }));
        assert!(events.contains(&DeviceEvent::Disconnected {
            mac: "aa".to_string(),
            ssid: Some("Home".to_string())
        }));
    }

    #[tokio::test]
    async fn in_memory_controller_filters_and_records() {
        let controller = InMemoryController::default();
        controller
            .set_connected(vec![station("aa", Some("Kids")), station("bb", Some("Guest"))])
            .expect("seed");

        let kids = controller
            .list_connected_devices(&["Kids".to_string()])
            .await
            .expect("list");
        assert_eq!(kids.len(), 1);

        controller.set_blocked("AA", true).await.expect("block");
        assert_eq!(controller.last_blocked("aa").expect("calls"), Some(true));

        controller.set_unavailable(true).expect("toggle");
        assert!(matches!(
            controller.list_known_devices().await,
            Err(InfraError::CollaboratorUnavailable(_))
        ));
    }
}
