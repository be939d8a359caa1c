use anyhow::{anyhow, Result};
use keyring::Entry;

/// Reads broker credentials from the operating-system keyring.
pub struct KeyringSecretRepository {
    service_name: String,
}

impl KeyringSecretRepository {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }

    pub fn get_password(&self, account: &str) -> Result<String> {
        let entry = Entry::new(&self.service_name, account)
            .map_err(|e| anyhow!("Failed to create keyring entry: {}", e))?;
        entry
            .get_password()
            .map_err(|e| anyhow!("Failed to retrieve password for {} from keyring: {}", account, e))
    }
}
