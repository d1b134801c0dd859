use std::env;

use async_trait::async_trait;

use crate::error::Result;
use crate::providers::{BatchOutcome, EnvProviderConfig, SecretProvider};

/// Resolves ids as environment variables of the gateway process.
pub struct EnvProvider {
    alias: String,
    config: EnvProviderConfig,
}

impl EnvProvider {
    pub fn new(alias: &str, config: EnvProviderConfig) -> Self {
        Self {
            alias: alias.to_string(),
            config,
        }
    }

    fn lookup(&self, id: &str) -> std::result::Result<String, String> {
        self.lookup_with(id, |name| env::var(name).ok())
    }

    fn lookup_with(
        &self,
        id: &str,
        get: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<String, String> {
        if let Some(allowlist) = &self.config.allowlist {
            if !allowlist.iter().any(|name| name == id) {
                return Err(format!(
                    "variable {id} is not in the allowlist of provider '{}'",
                    self.alias
                ));
            }
        }
        match get(id) {
            Some(raw) => {
                let value = raw.trim();
                if value.is_empty() {
                    Err(format!("environment variable {id} is empty"))
                } else {
                    Ok(value.to_string())
                }
            }
            None => Err(format!("environment variable {id} is not set")),
        }
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    async fn resolve_batch(&self, ids: &[String]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            match self.lookup(id) {
                Ok(value) => {
                    outcome.values.insert(id.clone(), value.into());
                }
                Err(message) => {
                    outcome.errors.insert(id.clone(), message);
                }
            }
        }
        Ok(outcome)
    }
}
