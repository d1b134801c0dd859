use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{Instant, timeout};
use tracing::debug;

use crate::error::{Result, SecretsError};
use crate::providers::{BatchOutcome, ExecProviderConfig, SecretProvider};

pub const EXEC_PROTOCOL_VERSION: u64 = 1;

/// Resolves ids by spawning an untrusted helper process and speaking a
/// newline-terminated JSON batch protocol over stdin/stdout.
pub struct ExecProvider {
    alias: String,
    config: ExecProviderConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecResponse {
    protocol_version: u64,
    #[serde(default)]
    values: HashMap<String, Value>,
    #[serde(default)]
    errors: HashMap<String, ExecErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ExecErrorBody {
    message: String,
}

impl ExecProvider {
    pub fn new(alias: &str, config: ExecProviderConfig) -> Self {
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

    /// The command must be an absolute path to a regular file (or a symlink
    /// resolving to one when allowed) under a trusted directory.
    fn validate_command(&self) -> Result<()> {
        let command = &self.config.command;
        if !command.is_absolute() {
            return Err(self.scoped(format!("command {} is not absolute", command.display())));
        }
        let metadata = std::fs::symlink_metadata(command)
            .map_err(|err| self.scoped(format!("cannot stat {}: {err}", command.display())))?;
        if metadata.file_type().is_symlink() {
            if !self.config.allow_symlink_command {
                return Err(self.scoped(format!(
                    "command {} is a symlink (set allowSymlinkCommand to permit)",
                    command.display()
                )));
            }
            let resolved = std::fs::canonicalize(command).map_err(|err| {
                self.scoped(format!("cannot resolve {}: {err}", command.display()))
            })?;
            let resolved_meta = std::fs::metadata(&resolved).map_err(|err| {
                self.scoped(format!("cannot stat {}: {err}", resolved.display()))
            })?;
            if !resolved_meta.is_file() {
                return Err(self.scoped(format!(
                    "command {} resolves to a non-regular file",
                    command.display()
                )));
            }
        } else if !metadata.is_file() {
            return Err(self.scoped(format!(
                "command {} is not a regular file",
                command.display()
            )));
        }
        if self.config.allow_insecure_path {
            return Ok(());
        }
        let dir = command
            .parent()
            .ok_or_else(|| self.scoped("command has no containing directory"))?;
        let dir = std::fs::canonicalize(dir)
            .map_err(|err| self.scoped(format!("cannot resolve {}: {err}", dir.display())))?;
        let trusted = self.config.trusted_dirs.iter().any(|root| {
            std::fs::canonicalize(root)
                .map(|root| dir.starts_with(&root))
                .unwrap_or(false)
        });
        if !trusted {
            return Err(self.scoped(format!(
                "command directory {} is not under a trusted directory",
                dir.display()
            )));
        }
        Ok(())
    }

    fn child_env(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .config
            .pass_env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect();
        if let Some(fixed) = &self.config.env {
            for (name, value) in fixed {
                pairs.retain(|(existing, _)| existing != name);
                pairs.push((name.clone(), value.clone()));
            }
        }
        pairs
    }

    /// Run the child once, guarded by the total wall clock, the no-output
    /// idle timeout, and the stdout byte cap. Any violation kills the child
    /// and fails the batch.
    async fn run_child(&self, request: &[u8]) -> Result<String> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .env_clear()
            .envs(self.child_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                self.scoped(format!(
                    "cannot spawn {}: {err}",
                    self.config.command.display()
                ))
            })?;

        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);

        if let Some(mut stdin) = child.stdin.take() {
            // A helper may answer from its environment without ever reading
            // stdin; a broken pipe here is not an error.
            let _ = stdin.write_all(request).await;
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut captured = Vec::new();
                let _ = stderr.read_to_end(&mut captured).await;
                captured
            })
        });

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.scoped("child stdout is not piped"))?;
        let mut collected: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8_192];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = child.start_kill();
                return Err(self.scoped(format!(
                    "timed out after {}ms",
                    self.config.timeout_ms
                )));
            }
            let idle = Duration::from_millis(self.config.no_output_timeout_ms).min(remaining);
            match timeout(idle, stdout.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected.len() as u64 > self.config.max_output_bytes {
                        let _ = child.start_kill();
                        return Err(self.scoped(format!(
                            "output exceeded {} bytes",
                            self.config.max_output_bytes
                        )));
                    }
                }
                Ok(Err(err)) => {
                    let _ = child.start_kill();
                    return Err(self.scoped(format!("cannot read output: {err}")));
                }
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(self.scoped(format!(
                        "no output for {}ms",
                        self.config.no_output_timeout_ms
                    )));
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = match timeout(remaining, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(self.scoped(format!("cannot reap child: {err}"))),
            Err(_) => {
                let _ = child.start_kill();
                return Err(self.scoped(format!(
                    "timed out after {}ms",
                    self.config.timeout_ms
                )));
            }
        };
        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(self.scoped(format!(
                "exited with {status}: {}",
                stderr.trim().chars().take(512).collect::<String>()
            )));
        }

        String::from_utf8(collected)
            .map_err(|_| self.scoped("output is not valid UTF-8"))
    }

    fn parse_output(&self, ids: &[String], output: &str) -> Result<BatchOutcome> {
        let trimmed = output.trim();
        match serde_json::from_str::<ExecResponse>(trimmed) {
            Ok(response) => {
                if response.protocol_version != EXEC_PROTOCOL_VERSION {
                    return Err(self.scoped(format!(
                        "unsupported protocolVersion {}",
                        response.protocol_version
                    )));
                }
                let mut outcome = BatchOutcome::default();
                for id in ids {
                    if let Some(value) = response.values.get(id) {
                        outcome.values.insert(id.clone(), value.clone());
                    } else if let Some(error) = response.errors.get(id) {
                        outcome.errors.insert(id.clone(), error.message.clone());
                    } else {
                        outcome
                            .errors
                            .insert(id.clone(), "no value in response".to_string());
                    }
                }
                Ok(outcome)
            }
            Err(err) => {
                if self.config.json_only {
                    return Err(self.scoped(format!("stdout is not a JSON response: {err}")));
                }
                if ids.len() != 1 {
                    return Err(self.scoped(
                        "non-JSON output is only accepted for single-id batches",
                    ));
                }
                if trimmed.is_empty() {
                    return Err(self.scoped("empty output"));
                }
                let mut outcome = BatchOutcome::default();
                outcome
                    .values
                    .insert(ids[0].clone(), trimmed.to_string().into());
                Ok(outcome)
            }
        }
    }
}

#[async_trait]
impl SecretProvider for ExecProvider {
    async fn resolve_batch(&self, ids: &[String]) -> Result<BatchOutcome> {
        self.validate_command()?;
        let mut request = serde_json::to_vec(&json!({
            "protocolVersion": EXEC_PROTOCOL_VERSION,
            "provider": self.alias,
            "ids": ids,
        }))?;
        request.push(b'\n');
        debug!(provider = %self.alias, ids = ids.len(), "invoking exec provider");
        let output = self.run_child(&request).await?;
        self.parse_output(ids, &output)
    }
}
