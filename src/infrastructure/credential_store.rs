use crate::infrastructure::error::InfraError;
use std::sync::Mutex;

pub const PASSWORD_ENV: &str = "NETCURFEW_CONTROLLER_PASSWORD";

pub trait CredentialStore: Send + Sync {
    fn load_password(&self) -> Result<Option<String>, InfraError>;
    fn save_password(&self, password: &str) -> Result<(), InfraError>;
}

/// Controller password held in the OS keyring.
#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service_name: String,
    account_name: String,
}

impl KeyringCredentialStore {
    pub fn new(service_name: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            account_name: account_name.into(),
        }
    }

    pub fn for_controller(username: &str) -> Self {
        Self::new("netcurfew.controller", username)
    }

    fn entry(&self) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, &self.account_name)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load_password(&self) -> Result<Option<String>, InfraError> {
        match self.entry()?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }

    fn save_password(&self, password: &str) -> Result<(), InfraError> {
        self.entry()?
            .set_password(password)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    password: Mutex<Option<String>>,
}

impl InMemoryCredentialStore {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Mutex::new(Some(password.into())),
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn load_password(&self) -> Result<Option<String>, InfraError> {
        let guard = self
            .password
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        Ok(guard.clone())
    }

    fn save_password(&self, password: &str) -> Result<(), InfraError> {
        let mut guard = self
            .password
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = Some(password.to_string());
        Ok(())
    }
}

/// Resolves the controller password: config file, then environment, then credential store.
pub fn resolve_password(
    configured: Option<&str>,
    env_value: Option<String>,
    store: &dyn CredentialStore,
) -> Result<String, InfraError> {
    if let Some(password) = configured.filter(|value| !value.is_empty()) {
        return Ok(password.to_string());
    }
    if let Some(password) = env_value.filter(|value| !value.is_empty()) {
        return Ok(password);
    }
    store.load_password()?.ok_or_else(|| {
        InfraError::Credential(format!(
            "controller password not configured; set {PASSWORD_ENV} or store it in the keyring"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_sources_are_tried_in_order() {
        let store = InMemoryCredentialStore::with_password("from-keyring");
        assert_eq!(
            resolve_password(Some("from-file"), Some("from-env".into()), &store).expect("file"),
            "from-file"
        );
        assert_eq!(
            resolve_password(None, Some("from-env".into()), &store).expect("env"),
            "from-env"
        );
        assert_eq!(
            resolve_password(Some(""), None, &store).expect("keyring"),
            "from-keyring"
        );
    }

    #[test]
    fn missing_password_is_a_credential_error() {
        let store = InMemoryCredentialStore::default();
        assert!(matches!(
            resolve_password(None, None, &store),
            Err(InfraError::Credential(_))
        ));

        store.save_password("saved").expect("save");
        assert_eq!(resolve_password(None, None, &store).expect("saved"), "saved");
    }
}
