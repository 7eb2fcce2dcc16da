use crate::infrastructure::config::FilterApplianceConfig;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub type ClientId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceGroup {
    pub id: i64,
    pub name: String,
}

#[async_trait]
pub trait FilterAppliance: Send + Sync {
    async fn resolve_client_id(&self, ip: &str) -> Result<Option<ClientId>, InfraError>;
    async fn provision_client(&self, ip: &str) -> Result<ClientId, InfraError>;
    async fn list_groups(&self) -> Result<Vec<ApplianceGroup>, InfraError>;
    /// Replaces the client's whole group membership in one step.
    async fn replace_client_groups(
        &self,
        client_id: ClientId,
        group_ids: &[i64],
    ) -> Result<(), InfraError>;
}

/// Executes a script on the appliance and returns its row-oriented stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, script: &str) -> Result<String, InfraError>;
}

#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    command: String,
    args: Vec<String>,
}

impl TokioCommandRunner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &FilterApplianceConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, script: &str) -> Result<String, InfraError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                InfraError::CollaboratorUnavailable(format!(
                    "failed to start appliance command '{}': {error}",
                    self.command
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InfraError::CollaboratorUnavailable(format!(
                "appliance command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Splits `|`-separated output into rows, dropping blank lines.
pub fn parse_rows(output: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| line.split('|').map(|field| field.trim().to_string()).collect())
        .collect()
}

fn parse_id(field: &str) -> Result<i64, InfraError> {
    field.parse::<i64>().map_err(|error| {
        InfraError::CollaboratorUnavailable(format!("appliance returned invalid id '{field}': {error}"))
    })
}

fn checked_ip(ip: &str) -> Result<String, InfraError> {
    ip.trim()
        .parse::<IpAddr>()
        .map(|address| address.to_string())
        .map_err(|_| InfraError::Validation(format!("'{ip}' is not an IP address")))
}

/// Filter appliance backed by a gravity-style SQLite database reached through a command runner.
pub struct SqlFilterAppliance<R> {
    runner: R,
}

impl<R> SqlFilterAppliance<R>
where
    R: CommandRunner,
{
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn first_id(&self, script: &str) -> Result<Option<ClientId>, InfraError> {
        let output = self.runner.run(script).await?;
        parse_rows(&output)
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .map(|field| parse_id(&field))
            .transpose()
    }
}

#[async_trait]
impl<R> FilterAppliance for SqlFilterAppliance<R>
where
    R: CommandRunner,
{
    async fn resolve_client_id(&self, ip: &str) -> Result<Option<ClientId>, InfraError> {
        let ip = checked_ip(ip)?;
        self.first_id(&format!("SELECT id FROM client WHERE ip = '{ip}';\n"))
            .await
    }

    async fn provision_client(&self, ip: &str) -> Result<ClientId, InfraError> {
        let ip = checked_ip(ip)?;
        let script = format!(
            "INSERT OR IGNORE INTO client (ip, comment) VALUES ('{ip}', 'netcurfew');\n\
             SELECT id FROM client WHERE ip = '{ip}';\n"
        );
        self.first_id(&script)
            .await?
            .ok_or_else(|| InfraError::NoIdentifier(ip))
    }

    async fn list_groups(&self) -> Result<Vec<ApplianceGroup>, InfraError> {
        let output = self
            .runner
            .run("SELECT id, name FROM \"group\";\n")
            .await?;
        parse_rows(&output)
            .into_iter()
            .filter(|row| row.len() >= 2)
            .map(|row| {
                Ok(ApplianceGroup {
                    id: parse_id(&row[0])?,
                    name: row[1].clone(),
                })
            })
            .collect()
    }

    async fn replace_client_groups(
        &self,
        client_id: ClientId,
        group_ids: &[i64],
    ) -> Result<(), InfraError> {
        self.runner
            .run(&replace_membership_script(client_id, group_ids))
            .await
            .map(|_| ())
            .map_err(|error| InfraError::ActionFailed(error.to_string()))
    }
}

pub fn replace_membership_script(client_id: ClientId, group_ids: &[i64]) -> String {
    let mut script = String::from("BEGIN TRANSACTION;\n");
    script.push_str(&format!(
        "DELETE FROM client_by_group WHERE client_id = {client_id};\n"
    ));
    for group_id in group_ids {
        script.push_str(&format!(
            "INSERT INTO client_by_group (client_id, group_id) VALUES ({client_id}, {group_id});\n"
        ));
    }
    script.push_str("COMMIT;\n");
    script
}

/// Appliance double keeping clients and memberships in memory.
#[derive(Debug, Default)]
pub struct InMemoryFilterAppliance {
    state: Mutex<InMemoryApplianceState>,
}

#[derive(Debug, Default)]
struct InMemoryApplianceState {
    groups: Vec<ApplianceGroup>,
    clients: HashMap<String, ClientId>,
    memberships: HashMap<ClientId, Vec<i64>>,
    replace_calls: usize,
}

impl InMemoryFilterAppliance {
    pub fn with_groups(groups: &[(i64, &str)]) -> Self {
        let appliance = Self::default();
        if let Ok(mut state) = appliance.state.lock() {
            state.groups = groups
                .iter()
                .map(|(id, name)| ApplianceGroup {
                    id: *id,
                    name: (*name).to_string(),
                })
                .collect();
        }
        appliance
    }

    fn with_state<T>(
        &self,
        apply: impl FnOnce(&mut InMemoryApplianceState) -> T,
    ) -> Result<T, InfraError> {
        let mut state = self
            .state
            .lock()
            .map_err(|error| InfraError::lock_poisoned("in-memory appliance", error))?;
        Ok(apply(&mut state))
    }

    pub fn register_client(&self, ip: &str, id: ClientId) -> Result<(), InfraError> {
        self.with_state(|state| {
            state.clients.insert(ip.to_string(), id);
        })
    }

    pub fn memberships_of(&self, client_id: ClientId) -> Result<Option<Vec<i64>>, InfraError> {
        self.with_state(|state| state.memberships.get(&client_id).cloned())
    }

    pub fn replace_calls(&self) -> Result<usize, InfraError> {
        self.with_state(|state| state.replace_calls)
    }
}

#[async_trait]
impl FilterAppliance for InMemoryFilterAppliance {
    async fn resolve_client_id(&self, ip: &str) -> Result<Option<ClientId>, InfraError> {
        self.with_state(|state| state.clients.get(ip).copied())
    }

    async fn provision_client(&self, ip: &str) -> Result<ClientId, InfraError> {
        self.with_state(|state| {
            let next = state.clients.values().copied().max().unwrap_or(0) + 1;
            *state.clients.entry(ip.to_string()).or_insert(next)
        })
    }

    async fn list_groups(&self) -> Result<Vec<ApplianceGroup>, InfraError> {
        self.with_state(|state| state.groups.clone())
    }

    async fn replace_client_groups(
        &self,
        client_id: ClientId,
        group_ids: &[i64],
    ) -> Result<(), InfraError> {
        self.with_state(|state| {
            state.replace_calls += 1;
            state.memberships.insert(client_id, group_ids.to_vec());
        })
    }
}
