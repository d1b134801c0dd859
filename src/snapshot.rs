use std::collections::BTreeSet;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::GatewayEnv;
use crate::error::{Result, SecretsError};
use crate::path::get_path;
use crate::reference::resolve_secret_input;
use crate::registry::registry;
use crate::resolver::{Snapshot, prepare_from_disk};
use crate::surfaces::inactive_surface_message;

/// Reloader lifecycle, tracked by the activator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloaderState {
    #[default]
    Uninitialized,
    Preparing,
    Ready,
    Degraded,
}

#[derive(Debug, Default)]
struct ActivatorInner {
    current: Option<Snapshot>,
    state: ReloaderState,
    was_ready: bool,
    degraded_emitted: bool,
}

/// Owns the active snapshot. Installation is a single swap under the lock;
/// readers receive defensive clones and never block writers for long.
#[derive(Default)]
pub struct SnapshotActivator {
    inner: RwLock<ActivatorInner>,
}

impl SnapshotActivator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ReloaderState {
        self.read().state
    }

    /// Clone of the active snapshot, if one was ever installed.
    pub fn current(&self) -> Option<Snapshot> {
        self.read().current.clone()
    }

    /// Install a snapshot directly, marking the reloader ready.
    pub fn activate(&self, snapshot: Snapshot) {
        let mut inner = self.write();
        inner.current = Some(snapshot);
        inner.state = ReloaderState::Ready;
        inner.was_ready = true;
    }

    /// First activation. A failure here is fatal to the gateway process.
    pub async fn startup(&self, env: &GatewayEnv) -> Result<usize> {
        self.write().state = ReloaderState::Preparing;
        match prepare_from_disk(env).await {
            Ok(snapshot) => {
                let warning_count = snapshot.warnings.len();
                self.activate(snapshot);
                info!(warnings = warning_count, "secrets snapshot activated");
                Ok(warning_count)
            }
            Err(err) => {
                self.write().state = ReloaderState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Re-run resolution against freshly loaded files. On failure the
    /// last-known-good snapshot stays installed and the reloader degrades,
    /// emitting a one-shot event.
    pub async fn reload(&self, env: &GatewayEnv) -> Result<usize> {
        let was_ready = {
            let mut inner = self.write();
            inner.state = ReloaderState::Preparing;
            inner.was_ready
        };
        match prepare_from_disk(env).await {
            Ok(snapshot) => {
                let warning_count = snapshot.warnings.len();
                let recovered = {
                    let mut inner = self.write();
                    let recovered = inner.degraded_emitted;
                    inner.current = Some(snapshot);
                    inner.state = ReloaderState::Ready;
                    inner.was_ready = true;
                    inner.degraded_emitted = false;
                    recovered
                };
                if recovered {
                    info!(event = "RELOADER_RECOVERED", "secrets reload recovered");
                }
                Ok(warning_count)
            }
            Err(err) if !was_ready => {
                // No last-known-good to fall back to: this is still startup.
                self.write().state = ReloaderState::Uninitialized;
                Err(err)
            }
            Err(err) => {
                let first = {
                    let mut inner = self.write();
                    inner.state = ReloaderState::Degraded;
                    let first = !inner.degraded_emitted;
                    inner.degraded_emitted = true;
                    first
                };
                if first {
                    warn!(
                        event = "RELOADER_DEGRADED",
                        error = %err,
                        "secrets reload failed; keeping last-known-good snapshot"
                    );
                }
                Err(err)
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ActivatorInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ActivatorInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One hydrated value returned to a command-line caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAssignment {
    pub path: String,
    pub path_segments: Vec<String>,
    pub value: Value,
}

/// Result of resolving a command's secret targets from a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResolution {
    pub assignments: Vec<CommandAssignment>,
    pub diagnostics: Vec<String>,
}

/// Read the already-resolved values for the requested target ids out of a
/// snapshot. Refs on inactive surfaces become diagnostics; any other
/// unresolved ref is fatal, naming the exact path.
pub fn resolve_command_secrets(
    snapshot: &Snapshot,
    command_name: &str,
    target_ids: &[String],
    extra_inactive: &BTreeSet<String>,
) -> Result<CommandResolution> {
    let filter: BTreeSet<String> = target_ids.iter().cloned().collect();
    let defaults = crate::providers::SecretsSettings::from_config(&snapshot.source_config)
        .map(|settings| settings.defaults)
        .unwrap_or_default();
    let inactive = snapshot.inactive_paths();
    let mut resolution = CommandResolution::default();

    for found in registry().discover_config_targets(&snapshot.source_config, Some(&filter)) {
        let input = resolve_secret_input(found.value.as_ref(), found.ref_value.as_ref(), &defaults);
        let Some(_reference) = input.effective else {
            continue;
        };
        let resolved = get_path(&snapshot.resolved_config, &found.path_segments);
        let is_resolved = resolved
            .map(|value| found.target.spec.expected.matches(value))
            .unwrap_or(false);
        if is_resolved {
            resolution.assignments.push(CommandAssignment {
                path: found.path.clone(),
                path_segments: found.path_segments.clone(),
                value: resolved.cloned().unwrap_or(Value::Null),
            });
            continue;
        }
        if inactive.contains(found.path.as_str()) || extra_inactive.contains(&found.path) {
            resolution
                .diagnostics
                .push(inactive_surface_message(&found.path, "skipped for this command"));
            continue;
        }
        return Err(SecretsError::RefResolution {
            ref_key: found.path.clone(),
            message: format!(
                "secret for '{command_name}' at {} is not resolved in the active snapshot",
                found.path
            ),
        });
    }

    Ok(resolution)
}
