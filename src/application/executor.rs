use crate::domain::models::{normalize_mac, AccessAction};
use crate::domain::resolver::PlannedAction;
use crate::infrastructure::controller_client::AccessControl;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::filter_appliance::{ClientId, FilterAppliance};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Applied { client_id: ClientId, group_ids: Vec<i64> },
    DryRun,
    Disabled,
}

/// Applies access and filter-group actions to the external collaborators.
pub struct ActionExecutor {
    access: Arc<dyn AccessControl>,
    appliance: Option<Arc<dyn FilterAppliance>>,
    dry_run: AtomicBool,
    /// MAC -> (IP the id was resolved from, client id).
    client_ids: Mutex<HashMap<String, (String, ClientId)>>,
}

impl ActionExecutor {
    pub fn new(access: Arc<dyn AccessControl>, appliance: Option<Arc<dyn FilterAppliance>>) -> Self {
        Self {
            access,
            appliance,
            dry_run: AtomicBool::new(false),
            client_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_dry_run(self, dry_run: bool) -> Self {
        self.dry_run.store(dry_run, Ordering::Relaxed);
        self
    }

    pub fn set_dry_run(&self, dry_run: bool) {
        self.dry_run.store(dry_run, Ordering::Relaxed);
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }

    pub async fn apply_access(&self, mac: &str, action: AccessAction) -> Result<(), InfraError> {
        let mac = normalize_mac(mac);
        if self.is_dry_run() {
            tracing::info!(%mac, action = action.as_str(), "dry run: would apply access");
            return Ok(());
        }
        self.access.set_blocked(&mac, action.is_blocked()).await?;
        tracing::info!(%mac, action = action.as_str(), "access applied");
        Ok(())
    }

    /// Replaces the device's filter-group membership with `group_names`.
    ///
    /// Names the appliance does not know are skipped with a warning. Fails with
    /// `NoIdentifier` when the device has no client id and none can be provisioned.
    pub async fn apply_filter_groups(
        &self,
        mac: &str,
        ip: Option<&str>,
        group_names: &[String],
    ) -> Result<FilterOutcome, InfraError> {
        let mac = normalize_mac(mac);
        let Some(appliance) = self.appliance.as_ref() else {
            tracing::debug!(%mac, "filter appliance disabled; skipping filter groups");
            return Ok(FilterOutcome::Disabled);
        };
        if self.is_dry_run() {
            tracing::info!(%mac, groups = ?group_names, "dry run: would apply filter groups");
            return Ok(FilterOutcome::DryRun);
        }

        let client_id = self.client_id(appliance.as_ref(), &mac, ip).await?;
        let known = appliance
            .list_groups()
            .await?
            .into_iter()
            .map(|group| (group.name, group.id))
            .collect::<HashMap<_, _>>();

        let mut group_ids = Vec::with_capacity(group_names.len());
        for name in group_names {
            match known.get(name) {
                Some(id) if !group_ids.contains(id) => group_ids.push(*id),
                Some(_) => {}
                None => tracing::warn!(%mac, group = %name, "unknown filter group skipped"),
            }
        }

        appliance.replace_client_groups(client_id, &group_ids).await?;
        tracing::info!(%mac, client_id, groups = ?group_names, "filter groups applied");
        Ok(FilterOutcome::Applied { client_id, group_ids })
    }

    async fn client_id(
        &self,
        appliance: &dyn FilterAppliance,
        mac: &str,
        ip: Option<&str>,
    ) -> Result<ClientId, InfraError> {
        if let Some(id) = self.cached_client_id(mac, ip)? {
            return Ok(id);
        }
        let Some(ip) = ip else {
            return Err(InfraError::NoIdentifier(mac.to_string()));
        };

        let id = match appliance.resolve_client_id(ip).await? {
            Some(id) => id,
            None => appliance.provision_client(ip).await.map_err(|error| match error {
                InfraError::NoIdentifier(_) => InfraError::NoIdentifier(mac.to_string()),
                other => other,
            })?,
        };
        self.client_ids
            .lock()
            .map_err(|error| InfraError::lock_poisoned("client id cache", error))?
            .insert(mac.to_string(), (ip.to_string(), id));
        Ok(id)
    }

    /// Cached id for `mac`, valid only while the device keeps the IP it was resolved from.
    /// Without a current IP the last known id is used.
    fn cached_client_id(&self, mac: &str, ip: Option<&str>) -> Result<Option<ClientId>, InfraError> {
        let mut client_ids = self
            .client_ids
            .lock()
            .map_err(|error| InfraError::lock_poisoned("client id cache", error))?;
        match (client_ids.get(mac).cloned(), ip) {
            (Some((_, id)), None) => Ok(Some(id)),
            (Some((cached_ip, id)), Some(ip)) if cached_ip == ip => Ok(Some(id)),
            (Some(_), Some(ip)) => {
                tracing::info!(%mac, %ip, "device address changed; resolving filter client again");
                client_ids.remove(mac);
                Ok(None)
            }
            (None, _) => Ok(None),
        }
    }

    /// Runs an action on its own task. Failures are logged and not retried.
    pub fn dispatch(
        self: &Arc<Self>,
        mac: String,
        ip: Option<String>,
        planned: PlannedAction,
    ) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let result = match &planned {
                PlannedAction::Access(action) => executor.apply_access(&mac, *action).await,
                PlannedAction::FilterGroups(groups) => executor
                    .apply_filter_groups(&mac, ip.as_deref(), groups)
                    .await
                    .map(|_| ()),
            };
            match result {
                Ok(()) => {}
                Err(InfraError::NoIdentifier(_)) => {
                    tracing::warn!(%mac, "no filter client identifier; filter action skipped");
                }
                Err(error) => {
                    tracing::error!(%mac, action = ?planned, %error, "action application failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::controller_client::InMemoryController;
    use crate::infrastructure::filter_appliance::InMemoryFilterAppliance;

    const MAC: &str = "AA:BB:CC:00:11:22";

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn access_goes_to_the_controller_unless_dry_run() {
        let controller = Arc::new(InMemoryController::default());
        let executor = ActionExecutor::new(controller.clone(), None);
        executor.apply_access(MAC, AccessAction::Block).await.expect("block");
        assert_eq!(
            controller.blocked_calls().expect("calls"),
            vec![("aa:bb:cc:00:11:22".to_string(), true)]
        );

        executor.set_dry_run(true);
        executor.apply_access(MAC, AccessAction::Unblock).await.expect("dry run");
        assert_eq!(controller.blocked_calls().expect("calls").len(), 1);
    }

    #[tokio::test]
    async fn filter_groups_skip_unknown_names_in_one_replace() {
        let controller = Arc::new(InMemoryController::default());
        let appliance = Arc::new(InMemoryFilterAppliance::with_groups(&[
            (0, "default"),
            (3, "homework"),
        ]));
        appliance.register_client("10.0.0.5", 42).expect("register");
        let executor = ActionExecutor::new(controller, Some(appliance.clone()));

        let outcome = executor
            .apply_filter_groups(MAC, Some("10.0.0.5"), &names(&["homework", "games", "default"]))
            .await
            .expect("apply");

        assert_eq!(
            outcome,
            FilterOutcome::Applied { client_id: 42, group_ids: vec![3, 0] }
        );
        assert_eq!(appliance.replace_calls().expect("calls"), 1);
        assert_eq!(appliance.memberships_of(42).expect("read"), Some(vec![3, 0]));
    }

    #[tokio::test]
    async fn missing_ip_without_registration_is_no_identifier() {
        let controller = Arc::new(InMemoryController::default());
        let appliance = Arc::new(InMemoryFilterAppliance::with_groups(&[(0, "default")]));
        let executor = ActionExecutor::new(controller, Some(appliance.clone()));

        let result = executor
            .apply_filter_groups(MAC, None, &names(&["default"]))
            .await;
        assert!(matches!(result, Err(InfraError::NoIdentifier(_))));
        assert_eq!(appliance.replace_calls().expect("calls"), 0);
    }

    #[tokio::test]
    async fn unknown_client_is_provisioned_and_cached() {
        let controller = Arc::new(InMemoryController::default());
        let appliance = Arc::new(InMemoryFilterAppliance::with_groups(&[(0, "default")]));
        let executor = ActionExecutor::new(controller, Some(appliance.clone()));

        let first = executor
            .apply_filter_groups(MAC, Some("10.0.0.9"), &names(&["default"]))
            .await
            .expect("first");
        let second = executor
            .apply_filter_groups(MAC, None, &names(&["default"]))
            .await
            .expect("second uses cache");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn address_change_resolves_the_client_again() {
        let controller = Arc::new(InMemoryController::default());
        let appliance = Arc::new(InMemoryFilterAppliance::with_groups(&[
            (0, "default"),
            (3, "homework"),
        ]));
        appliance.register_client("10.0.0.5", 42).expect("register");
        appliance.register_client("10.0.0.6", 43).expect("register");
        let executor = ActionExecutor::new(controller, Some(appliance.clone()));

        executor
            .apply_filter_groups(MAC, Some("10.0.0.5"), &names(&["default"]))
            .await
            .expect("first");
        let moved = executor
            .apply_filter_groups(MAC, Some("10.0.0.6"), &names(&["homework"]))
            .await
            .expect("after address change");

        assert_eq!(
            moved,
            FilterOutcome::Applied { client_id: 43, group_ids: vec![3] }
        );
        assert_eq!(appliance.memberships_of(42).expect("read"), Some(vec![0]));
        assert_eq!(appliance.memberships_of(43).expect("read"), Some(vec![3]));
    }

    #[tokio::test]
    async fn dispatched_failures_are_swallowed() {
        let controller = Arc::new(InMemoryController::default());
        controller.fail_commands_for(MAC).expect("fail");
        let executor = Arc::new(ActionExecutor::new(controller.clone(), None));

        executor
            .dispatch(MAC.to_string(), None, PlannedAction::Access(AccessAction::Block))
            .await
            .expect("task completes");
        assert_eq!(controller.blocked_calls().expect("calls").len(), 1);
    }
}
