use crate::domain::models::{Override, OverrideCommand, OverrideExpiry};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::state_store::{StateStore, OVERRIDES_KEY};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRequest {
    pub group: String,
    pub command: OverrideCommand,
    pub until_next_trigger: bool,
    pub filter_groups: Option<Vec<String>>,
}

/// Group name -> manual override, written through to the state store on every change.
pub struct OverrideManager {
    store: Arc<dyn StateStore>,
    groups: BTreeSet<String>,
    overrides: Mutex<BTreeMap<String, Override>>,
}

impl OverrideManager {
    /// Creates the manager and loads whatever the store already holds.
    pub fn load(
        store: Arc<dyn StateStore>,
        groups: impl IntoIterator<Item = String>,
    ) -> Result<Self, InfraError> {
        let manager = Self {
            store,
            groups: groups.into_iter().collect(),
            overrides: Mutex::new(BTreeMap::new()),
        };
        manager.reload()?;
        Ok(manager)
    }

    fn read_store(&self) -> Result<BTreeMap<String, Override>, InfraError> {
        match self.store.get(OVERRIDES_KEY)? {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(BTreeMap::new()),
        }
    }

    fn persist(&self, overrides: &BTreeMap<String, Override>) -> Result<(), InfraError> {
        self.store
            .set(OVERRIDES_KEY, &serde_json::to_string(overrides)?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Override>>, InfraError> {
        self.overrides
            .lock()
            .map_err(|error| InfraError::lock_poisoned("override map", error))
    }

    /// Applies `change` to the stored map, not the cached one, so entries written by
    /// another process since the last reload survive. The cache ends up equal to the store.
    fn update<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, Override>) -> T,
    ) -> Result<T, InfraError> {
        let mut overrides = self.lock()?;
        let stored = self.read_store()?;
        let mut updated = stored.clone();
        let result = change(&mut updated);
        if updated != stored {
            self.persist(&updated)?;
        }
        *overrides = updated;
        Ok(result)
    }

    /// Re-reads the store. Returns true when the map changed.
    pub fn reload(&self) -> Result<bool, InfraError> {
        let mut overrides = self.lock()?;
        let stored = self.read_store()?;
        if *overrides == stored {
            return Ok(false);
        }
        *overrides = stored;
        Ok(true)
    }

    /// Validates and applies an administrative override request.
    ///
    /// `use-schedule` removes the group's override. Returns the override now in effect.
    pub fn set_override(&self, request: OverrideRequest) -> Result<Option<Override>, InfraError> {
        let group = request.group.trim();
        if !self.groups.contains(group) {
            return Err(InfraError::Validation(format!("unknown group '{group}'")));
        }

        let filter_groups = match request.filter_groups {
            Some(groups) => {
                if request.command != OverrideCommand::Unblock {
                    return Err(InfraError::Validation(
                        "filterGroups may only be given with unblock".to_string(),
                    ));
                }
                let groups = groups
                    .into_iter()
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect::<Vec<_>>();
                if groups.is_empty() {
                    return Err(InfraError::Validation(
                        "filterGroups must name at least one group".to_string(),
                    ));
                }
                Some(groups)
            }
            None => None,
        };

        let next = request.command.access().map(|action| Override {
            action,
            expiry: if request.until_next_trigger {
                OverrideExpiry::UntilNextTrigger
            } else {
                OverrideExpiry::Permanent
            },
            filter_groups,
        });

        self.update(|overrides| match &next {
            Some(value) => {
                overrides.insert(group.to_string(), value.clone());
            }
            None => {
                overrides.remove(group);
            }
        })?;

        match &next {
            Some(value) => tracing::info!(
                group,
                action = value.action.as_str(),
                expiry = ?value.expiry,
                filter_groups = ?value.filter_groups,
                "override set"
            ),
            None => tracing::info!(group, "override cleared; schedule in effect"),
        }
        Ok(next)
    }

    pub fn get(&self, group: &str) -> Result<Option<Override>, InfraError> {
        Ok(self.lock()?.get(group).cloned())
    }

    pub fn snapshot(&self) -> Result<BTreeMap<String, Override>, InfraError> {
        Ok(self.lock()?.clone())
    }

    /// Override in effect for a trigger firing for `group`, read from the store.
    ///
    /// An `until-next-trigger` override is deleted here and the firing falls back to its
    /// schedule action. Any other override stays and is returned.
    pub fn take_for_trigger(&self, group: &str) -> Result<Option<Override>, InfraError> {
        self.update(|overrides| {
            let consumed = overrides
                .get(group)
                .is_some_and(Override::consumed_by_next_trigger);
            if consumed {
                overrides.remove(group);
                tracing::info!(group, "until-next-trigger override consumed");
                return None;
            }
            overrides.get(group).cloned()
        })
    }
}
