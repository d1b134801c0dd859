use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::error::{Result, SecretsError};
use crate::providers::{BatchOutcome, FileMode, FileProviderConfig, SecretProvider};

/// Resolves ids out of a single secrets file, either as JSON pointers into
/// a JSON document or as the whole file in single-value mode.
pub struct FileProvider {
    alias: String,
    config: FileProviderConfig,
}

impl FileProvider {
    pub fn new(alias: &str, config: FileProviderConfig) -> Self {
        Self {
            alias: alias.to_string(),
            config,
        }
    }

    fn scoped(&self, message: impl Into<String>) -> SecretsError {
        SecretsError::ProviderScoped {
            provider: self.alias.clone(),
            message: message.into(),
        }
    }

    async fn read_contents(&self) -> Result<String> {
        let path = &self.config.path;
        if !path.is_absolute() {
            return Err(self.scoped(format!("path {} is not absolute", path.display())));
        }
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|err| self.scoped(format!("cannot stat {}: {err}", path.display())))?;
        if !metadata.is_file() {
            return Err(self.scoped(format!("{} is not a regular file", path.display())));
        }
        if metadata.len() > self.config.max_bytes {
            return Err(self.scoped(format!(
                "{} exceeds maxBytes ({} > {})",
                path.display(),
                metadata.len(),
                self.config.max_bytes
            )));
        }
        if self.config.check_permissions {
            check_private(&metadata, path).map_err(|message| self.scoped(message))?;
        }
        let read = tokio::fs::read_to_string(path);
        match timeout(Duration::from_millis(self.config.timeout_ms), read).await {
            Ok(Ok(contents)) => Ok(contents),
            Ok(Err(err)) => Err(self.scoped(format!("cannot read {}: {err}", path.display()))),
            Err(_) => Err(self.scoped(format!(
                "reading {} timed out after {}ms",
                path.display(),
                self.config.timeout_ms
            ))),
        }
    }
}

#[cfg(unix)]
fn check_private(
    metadata: &std::fs::Metadata,
    path: &std::path::Path,
) -> std::result::Result<(), String> {
    use std::os::unix::fs::MetadataExt;
    let euid = nix::unistd::geteuid().as_raw();
    if metadata.uid() != euid {
        return Err(format!(
            "{} is owned by uid {} (expected {})",
            path.display(),
            metadata.uid(),
            euid
        ));
    }
    if metadata.mode() & 0o077 != 0 {
        return Err(format!(
            "{} is group/other accessible (mode {:o}); chmod 600 it",
            path.display(),
            metadata.mode() & 0o777
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_private(
    _metadata: &std::fs::Metadata,
    _path: &std::path::Path,
) -> std::result::Result<(), String> {
    Ok(())
}

#[async_trait]
impl SecretProvider for FileProvider {
    async fn resolve_batch(&self, ids: &[String]) -> Result<BatchOutcome> {
        let contents = self.read_contents().await?;
        let mut outcome = BatchOutcome::default();
        match self.config.mode {
            FileMode::Json => {
                let document: Value = serde_json::from_str(&contents).map_err(|err| {
                    self.scoped(format!(
                        "{} is not valid JSON: {err}",
                        self.config.path.display()
                    ))
                })?;
                if !document.is_object() {
                    return Err(self.scoped(format!(
                        "{} must hold a JSON object at the top level",
                        self.config.path.display()
                    )));
                }
                for id in ids {
                    match document.pointer(id) {
                        Some(value) => {
                            outcome.values.insert(id.clone(), value.clone());
                        }
                        None => {
                            outcome
                                .errors
                                .insert(id.clone(), format!("pointer {id} not found"));
                        }
                    }
                }
            }
            FileMode::SingleValue => {
                let value = contents.trim_end_matches(['\r', '\n']).to_string();
                for id in ids {
                    if id == "value" {
                        outcome.values.insert(id.clone(), value.clone().into());
                    } else {
                        outcome.errors.insert(
                            id.clone(),
                            "single-value providers only resolve the id \"value\"".to_string(),
                        );
                    }
                }
            }
        }
        Ok(outcome)
    }
}
