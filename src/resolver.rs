use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info_span};

use crate::config::GatewayEnv;
use crate::error::{Result, SecretsError};
use crate::path::set_path_create_strict;
use crate::providers::{ResolveContext, SecretsSettings};
use crate::reference::{SecretRef, resolve_secret_input};
use crate::registry::{DiscoveredTarget, ExpectedValue, registry};
use crate::store;
use crate::surfaces::{inactive_surface_message, surface_decision, validate_referential_rules};

pub const WARN_REF_OVERRIDES_PLAINTEXT: &str = "SECRETS_REF_OVERRIDES_PLAINTEXT";
pub const WARN_REF_IGNORED_INACTIVE_SURFACE: &str = "SECRETS_REF_IGNORED_INACTIVE_SURFACE";
pub const WARN_UNKNOWN_DEFAULT_PROVIDER: &str = "SECRETS_UNKNOWN_DEFAULT_PROVIDER";

/// A structured warning attached to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub path: String,
    pub message: String,
}

/// One per-agent auth-profile store loaded into (or produced by) a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthStoreState {
    pub agent_id: String,
    pub store_path: PathBuf,
    pub store: Value,
}

/// The runtime view installed by the activator: the authored configuration,
/// the fully resolved copy, resolved auth stores, and warnings.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub source_config: Value,
    pub resolved_config: Value,
    pub auth_stores: Vec<AuthStoreState>,
    pub warnings: Vec<Diagnostic>,
}

impl Snapshot {
    pub fn inactive_paths(&self) -> HashSet<&str> {
        self.warnings
            .iter()
            .filter(|w| w.code == WARN_REF_IGNORED_INACTIVE_SURFACE)
            .map(|w| w.path.as_str())
            .collect()
    }
}

/// Where a resolved value is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssignTarget {
    ResolvedConfig,
    AuthStore(usize),
}

/// A planned write of one resolved value. Assignments are plain data and
/// applied through the path engine after the provider batch completes.
#[derive(Debug)]
struct Assignment {
    reference: SecretRef,
    path: String,
    path_segments: Vec<String>,
    expected: ExpectedValue,
    target: AssignTarget,
}

/// Collects warnings with `(code, path, message)` deduplication.
#[derive(Debug, Default)]
pub struct WarningSink {
    seen: HashSet<(String, String, String)>,
    warnings: Vec<Diagnostic>,
}

impl WarningSink {
    pub fn push(&mut self, code: &str, path: &str, message: String) {
        let key = (code.to_string(), path.to_string(), message.clone());
        if self.seen.insert(key) {
            self.warnings.push(Diagnostic {
                code: code.to_string(),
                path: path.to_string(),
                message,
            });
        }
    }

    pub fn into_warnings(self) -> Vec<Diagnostic> {
        self.warnings
    }
}

/// Resolve every active secret ref in `source_config` and the given auth
/// stores, producing an installable snapshot. Fails when any active ref does
/// not resolve to its expected shape.
pub async fn prepare_snapshot(
    source_config: &Value,
    auth_stores: Vec<AuthStoreState>,
) -> Result<Snapshot> {
    let span = info_span!("secrets_prepare");
    let _enter = span.enter();

    let settings = SecretsSettings::from_config(source_config)?;
    let defaults = settings.defaults.clone();
    validate_referential_rules(source_config, &defaults)?;
    let mut resolved_config = source_config.clone();
    let mut stores = auth_stores;
    let mut sink = WarningSink::default();
    let mut assignments: Vec<Assignment> = Vec::new();

    for (source, alias) in [
        ("env", defaults.env.as_deref()),
        ("file", defaults.file.as_deref()),
        ("exec", defaults.exec.as_deref()),
    ] {
        if let Some(alias) = alias {
            if !settings.providers.contains_key(alias) {
                let path = format!("secrets.defaults.{source}");
                sink.push(
                    WARN_UNKNOWN_DEFAULT_PROVIDER,
                    &path,
                    format!("{path}: default provider '{alias}' is not configured"),
                );
            }
        }
    }

    for found in registry().discover_config_targets(source_config, None) {
        let input = resolve_secret_input(found.value.as_ref(), found.ref_value.as_ref(), &defaults);
        note_plaintext_override(&found, input.explicit.is_some(), &mut sink);
        let Some(reference) = input.effective else {
            continue;
        };
        let decision = surface_decision(source_config, found.target, &found.path_segments, &defaults);
        if !decision.active {
            sink.push(
                WARN_REF_IGNORED_INACTIVE_SURFACE,
                &found.path,
                inactive_surface_message(&found.path, &decision.reason),
            );
            continue;
        }
        assignments.push(Assignment {
            reference,
            path: found.path,
            path_segments: found.path_segments,
            expected: found.target.spec.expected,
            target: AssignTarget::ResolvedConfig,
        });
    }

    for (index, state) in stores.iter().enumerate() {
        for found in registry().discover_auth_profile_targets(&state.store, None) {
            let input =
                resolve_secret_input(found.value.as_ref(), found.ref_value.as_ref(), &defaults);
            note_plaintext_override(&found, input.explicit.is_some(), &mut sink);
            let Some(reference) = input.effective else {
                continue;
            };
            assignments.push(Assignment {
                reference,
                path: found.path,
                path_segments: found.path_segments,
                expected: found.target.spec.expected,
                target: AssignTarget::AuthStore(index),
            });
        }
    }

    debug!(
        assignments = assignments.len(),
        "collected secret assignments"
    );

    let context = ResolveContext::new(settings);
    let refs: Vec<SecretRef> = assignments.iter().map(|a| a.reference.clone()).collect();
    let outcome = context.resolve(&refs).await;

    for assignment in &assignments {
        let key = assignment.reference.ref_key();
        let Some(value) = outcome.values.get(&key) else {
            let message = outcome
                .errors
                .get(&key)
                .cloned()
                .unwrap_or_else(|| "unresolved".to_string());
            return Err(SecretsError::RefResolution {
                ref_key: format!("{key} (at {})", assignment.path),
                message,
            });
        };
        if !assignment.expected.matches(value) {
            return Err(SecretsError::ShapeMismatch {
                path: assignment.path.clone(),
                expected: assignment.expected.as_str(),
            });
        }
        let target = match assignment.target {
            AssignTarget::ResolvedConfig => &mut resolved_config,
            AssignTarget::AuthStore(index) => &mut stores[index].store,
        };
        set_path_create_strict(target, &assignment.path_segments, value.clone())?;
    }

    Ok(Snapshot {
        source_config: source_config.clone(),
        resolved_config,
        auth_stores: stores,
        warnings: sink.into_warnings(),
    })
}

fn note_plaintext_override(found: &DiscoveredTarget<'_>, has_explicit: bool, sink: &mut WarningSink) {
    if !has_explicit {
        return;
    }
    let is_plaintext = matches!(found.value.as_ref(), Some(Value::String(s)) if !s.is_empty());
    if is_plaintext {
        sink.push(
            WARN_REF_OVERRIDES_PLAINTEXT,
            &found.path,
            format!(
                "{}: the sibling ref overrides the plaintext value; the plaintext is ignored at runtime",
                found.path
            ),
        );
    }
}

/// Load the main configuration and every agent's auth-profile store, then
/// prepare a snapshot from disk state.
pub async fn prepare_from_disk(env: &GatewayEnv) -> Result<Snapshot> {
    let config = store::load_main_config(env)?;
    let auth_stores = load_auth_stores(env, &config)?;
    prepare_snapshot(&config, auth_stores).await
}

/// Load every agent's auth-profile store for the given configuration.
pub fn load_auth_stores(env: &GatewayEnv, config: &Value) -> Result<Vec<AuthStoreState>> {
    let mut stores = Vec::new();
    for agent in store::list_agents(env, config) {
        let path = agent.store_path();
        if let Some(document) = store::load_auth_profiles(&path)? {
            stores.push(AuthStoreState {
                agent_id: agent.id,
                store_path: path,
                store: document,
            });
        }
    }
    Ok(stores)
}
