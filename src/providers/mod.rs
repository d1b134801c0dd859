use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::error::{Result, SecretsError};
use crate::reference::{SecretDefaults, SecretRef, SecretSource};

pub mod env;
pub mod exec;
pub mod file;

pub use env::EnvProvider;
pub use exec::ExecProvider;
pub use file::FileProvider;

pub const DEFAULT_MAX_PROVIDER_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_REFS_PER_PROVIDER: usize = 512;
pub const DEFAULT_MAX_BATCH_BYTES: usize = 262_144;

/// Configuration for one provider alias, tagged by source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ProviderConfig {
    Env(EnvProviderConfig),
    File(FileProviderConfig),
    Exec(ExecProviderConfig),
}

impl ProviderConfig {
    pub fn source(&self) -> SecretSource {
        match self {
            ProviderConfig::Env(_) => SecretSource::Env,
            ProviderConfig::File(_) => SecretSource::File,
            ProviderConfig::Exec(_) => SecretSource::Exec,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvProviderConfig {
    /// When set, only these variable names may be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowlist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileMode {
    #[default]
    Json,
    SingleValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileProviderConfig {
    /// Absolute path of the secrets file.
    pub path: PathBuf,
    #[serde(default)]
    pub mode: FileMode,
    #[serde(default = "default_file_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_file_max_bytes")]
    pub max_bytes: u64,
    /// Require the file to be owned by the effective user with no
    /// group/other permission bits.
    #[serde(default = "default_true")]
    pub check_permissions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecProviderConfig {
    /// Absolute command path; never run through a shell.
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_exec_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_exec_idle_timeout_ms")]
    pub no_output_timeout_ms: u64,
    #[serde(default = "default_exec_max_output_bytes")]
    pub max_output_bytes: u64,
    /// Refuse non-JSON stdout even for single-id batches.
    #[serde(default)]
    pub json_only: bool,
    /// Variables copied from the gateway environment into the child.
    #[serde(default)]
    pub pass_env: Vec<String>,
    /// Directories the command is allowed to live under.
    #[serde(default)]
    pub trusted_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub allow_insecure_path: bool,
    #[serde(default)]
    pub allow_symlink_command: bool,
    /// Fixed variables always present in the child environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

fn default_true() -> bool {
    true
}

fn default_file_timeout_ms() -> u64 {
    2_000
}

fn default_file_max_bytes() -> u64 {
    1_048_576
}

fn default_exec_timeout_ms() -> u64 {
    10_000
}

fn default_exec_idle_timeout_ms() -> u64 {
    5_000
}

fn default_exec_max_output_bytes() -> u64 {
    1_048_576
}

/// The `secrets` section of the main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsSettings {
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,
    #[serde(default)]
    pub defaults: SecretDefaults,
    #[serde(default = "default_concurrency")]
    pub max_provider_concurrency: usize,
    #[serde(default = "default_refs_per_provider")]
    pub max_refs_per_provider: usize,
    #[serde(default = "default_batch_bytes")]
    pub max_batch_bytes: usize,
}

impl Default for SecretsSettings {
    fn default() -> Self {
        Self {
            providers: IndexMap::new(),
            defaults: SecretDefaults::default(),
            max_provider_concurrency: default_concurrency(),
            max_refs_per_provider: default_refs_per_provider(),
            max_batch_bytes: default_batch_bytes(),
        }
    }
}

fn default_concurrency() -> usize {
    DEFAULT_MAX_PROVIDER_CONCURRENCY
}

fn default_refs_per_provider() -> usize {
    DEFAULT_MAX_REFS_PER_PROVIDER
}

fn default_batch_bytes() -> usize {
    DEFAULT_MAX_BATCH_BYTES
}

impl SecretsSettings {
    /// Parse the `secrets` subtree of the main configuration; absent means
    /// all defaults.
    pub fn from_config(root: &Value) -> Result<Self> {
        let Some(section) = root.get("secrets") else {
            return Ok(Self::default());
        };
        let settings: SecretsSettings = serde_json::from_value(section.clone())
            .map_err(|err| SecretsError::Config(format!("invalid secrets section: {err}")))?;
        for alias in settings.providers.keys() {
            if !crate::reference::is_valid_provider_alias(alias) {
                return Err(SecretsError::Config(format!(
                    "invalid provider alias '{alias}'"
                )));
            }
        }
        Ok(settings)
    }
}

/// Result of one provider batch call, keyed by id.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub values: HashMap<String, Value>,
    pub errors: HashMap<String, String>,
}

/// A resolver for one configured provider alias.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn resolve_batch(&self, ids: &[String]) -> Result<BatchOutcome>;
}

fn build_provider(alias: &str, config: &ProviderConfig) -> Box<dyn SecretProvider> {
    match config {
        ProviderConfig::Env(cfg) => Box::new(EnvProvider::new(alias, cfg.clone())),
        ProviderConfig::File(cfg) => Box::new(FileProvider::new(alias, cfg.clone())),
        ProviderConfig::Exec(cfg) => Box::new(ExecProvider::new(alias, cfg.clone())),
    }
}

/// Aggregate resolution outcome keyed by `ref_key`.
#[derive(Debug, Default)]
pub struct ResolveOutcome {
    pub values: HashMap<String, Value>,
    pub errors: HashMap<String, String>,
}

impl ResolveOutcome {
    pub fn is_fully_resolved(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One resolution context: a provider set, the concurrency gate, and a
/// cache that lives exactly as long as one activation or audit.
pub struct ResolveContext {
    settings: SecretsSettings,
    semaphore: Arc<Semaphore>,
    cache: Mutex<HashMap<String, Value>>,
}

impl ResolveContext {
    pub fn new(settings: SecretsSettings) -> Self {
        let permits = settings.max_provider_concurrency.max(1);
        Self {
            settings,
            semaphore: Arc::new(Semaphore::new(permits)),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SecretsSettings {
        &self.settings
    }

    pub fn defaults(&self) -> &SecretDefaults {
        &self.settings.defaults
    }

    /// Resolve a set of refs, batching per `(source, provider)` with the
    /// configured caps. Provider-scoped failures poison every ref handed to
    /// that provider; other batch errors fall back to per-ref resolution.
    pub async fn resolve(&self, refs: &[SecretRef]) -> ResolveOutcome {
        let mut outcome = ResolveOutcome::default();
        let mut groups: BTreeMap<(SecretSource, String), Vec<&SecretRef>> = BTreeMap::new();
        {
            let cache = self.cache.lock().await;
            for reference in refs {
                let key = reference.ref_key();
                if let Some(value) = cache.get(&key) {
                    outcome.values.insert(key, value.clone());
                    continue;
                }
                let group = groups
                    .entry((reference.source, reference.provider.clone()))
                    .or_default();
                if !group.iter().any(|r| r.id == reference.id) {
                    group.push(reference);
                }
            }
        }

        let tasks = groups.into_iter().map(|((source, provider), group)| {
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let mut group_outcome = ResolveOutcome::default();
                match self.settings.providers.get(&provider) {
                    Some(config) if config.source() == source => {
                        let resolver = build_provider(&provider, config);
                        // Per-provider concurrency is 1: chunks of one group
                        // run in sequence, each under a global permit.
                        for chunk in self.chunk_ids(&group) {
                            // The semaphore is never closed; a failed acquire
                            // just runs the chunk ungated.
                            let permit = semaphore.acquire().await.ok();
                            let batch = resolver.resolve_batch(&chunk).await;
                            drop(permit);
                            self.fold_batch(
                                source,
                                &provider,
                                &chunk,
                                batch,
                                resolver.as_ref(),
                                &mut group_outcome,
                            )
                            .await;
                        }
                    }
                    Some(_) => {
                        let message = format!("provider '{provider}' is not a {source} provider");
                        for reference in &group {
                            group_outcome
                                .errors
                                .insert(reference.ref_key(), message.clone());
                        }
                    }
                    None => {
                        let message = format!("unknown provider alias '{provider}'");
                        for reference in &group {
                            group_outcome
                                .errors
                                .insert(reference.ref_key(), message.clone());
                        }
                    }
                }
                group_outcome
            }
        });

        for group_outcome in futures::future::join_all(tasks).await {
            outcome.values.extend(group_outcome.values);
            outcome.errors.extend(group_outcome.errors);
        }

        let mut cache = self.cache.lock().await;
        for (key, value) in &outcome.values {
            cache.insert(key.clone(), value.clone());
        }
        outcome
    }

    /// Split a group into batches respecting `max_refs_per_provider` and
    /// `max_batch_bytes` (measured over the serialized id list).
    fn chunk_ids(&self, group: &[&SecretRef]) -> Vec<Vec<String>> {
        let mut chunks = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_bytes = 0usize;
        for reference in group {
            let cost = reference.id.len() + 4;
            let over_refs = current.len() >= self.settings.max_refs_per_provider.max(1);
            let over_bytes =
                !current.is_empty() && current_bytes + cost > self.settings.max_batch_bytes;
            if over_refs || over_bytes {
                chunks.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += cost;
            current.push(reference.id.clone());
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    async fn fold_batch(
        &self,
        source: SecretSource,
        provider: &str,
        ids: &[String],
        batch: Result<BatchOutcome>,
        resolver: &dyn SecretProvider,
        outcome: &mut ResolveOutcome,
    ) {
        let key = |id: &str| format!("{source}:{provider}:{id}");
        match batch {
            Ok(result) => {
                for id in ids {
                    if let Some(value) = result.values.get(id) {
                        outcome.values.insert(key(id), value.clone());
                    } else if let Some(message) = result.errors.get(id) {
                        outcome.errors.insert(key(id), message.clone());
                    } else {
                        outcome
                            .errors
                            .insert(key(id), "provider returned no value".to_string());
                    }
                }
            }
            Err(err) if err.is_provider_scoped() => {
                let message = err.to_string();
                for id in ids {
                    outcome.errors.insert(key(id), message.clone());
                }
            }
            Err(err) => {
                debug!(provider, error = %err, "batch failed; retrying per ref");
                for id in ids {
                    match resolver.resolve_batch(std::slice::from_ref(id)).await {
                        Ok(result) => {
                            if let Some(value) = result.values.get(id) {
                                outcome.values.insert(key(id), value.clone());
                            } else if let Some(message) = result.errors.get(id) {
                                outcome.errors.insert(key(id), message.clone());
                            } else {
                                outcome
                                    .errors
                                    .insert(key(id), "provider returned no value".to_string());
                            }
                        }
                        Err(per_ref) => {
                            outcome.errors.insert(key(id), per_ref.to_string());
                        }
                    }
                }
            }
        }
    }
}
