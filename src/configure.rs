use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde_json::Value;

use crate::config::GatewayEnv;
use crate::error::Result;
use crate::plan::{PLAN_PROTOCOL_VERSION, PLAN_VERSION, Plan, PlanOptions, PlanTarget};
use crate::providers::{EnvProviderConfig, ProviderConfig, SecretsSettings};
use crate::reference::{SecretRef, SecretSource};
use crate::registry::{ConfigFile, DiscoveredTarget, registry};
use crate::resolver::load_auth_stores;
use crate::store;

const DEFAULT_ENV_PROVIDER: &str = "default";

/// What the configure flow should cover.
#[derive(Debug, Clone, Default)]
pub struct ConfigureOptions {
    /// Only emit provider upserts.
    pub providers_only: bool,
    /// Do not synthesize a default env provider.
    pub skip_provider_setup: bool,
    /// Restrict auth-profile migration to one agent.
    pub agent: Option<String>,
}

/// Build a migration plan converting every discovered plaintext secret into
/// an environment ref. The plan is validated by the apply path; this builder
/// only proposes targets.
pub fn build_configure_plan(
    env: &GatewayEnv,
    config: &Value,
    options: &ConfigureOptions,
) -> Result<Plan> {
    let settings = SecretsSettings::from_config(config)?;
    let mut provider_upserts: BTreeMap<String, ProviderConfig> = BTreeMap::new();
    if !options.skip_provider_setup && !settings.providers.contains_key(DEFAULT_ENV_PROVIDER) {
        provider_upserts.insert(
            DEFAULT_ENV_PROVIDER.to_string(),
            ProviderConfig::Env(EnvProviderConfig::default()),
        );
    }

    let mut targets: Vec<PlanTarget> = Vec::new();
    if !options.providers_only {
        for found in registry().discover_config_targets(config, None) {
            if !found.target.spec.include_in_configure || !found.target.spec.include_in_plan {
                continue;
            }
            if !is_plaintext(found.value.as_ref()) {
                continue;
            }
            targets.push(PlanTarget {
                target_type: found.target.spec.target_type.to_string(),
                path: found.path.clone(),
                path_segments: Some(found.path_segments.clone()),
                reference: env_ref(suggest_env_var(&found.path_segments)),
                agent_id: None,
                provider_id: found.provider_id.clone(),
                account_id: found.account_id.clone(),
                auth_profile_provider: None,
            });
        }

        for state in load_auth_stores(env, config)? {
            if let Some(only) = &options.agent {
                if state.agent_id != *only {
                    continue;
                }
            }
            for found in registry().discover_auth_profile_targets(&state.store, None) {
                if !found.target.spec.include_in_configure || !found.target.spec.include_in_plan {
                    continue;
                }
                if !is_plaintext(found.value.as_ref()) {
                    continue;
                }
                targets.push(PlanTarget {
                    target_type: found.target.spec.target_type.to_string(),
                    path: found.path.clone(),
                    path_segments: Some(found.path_segments.clone()),
                    reference: env_ref(suggest_profile_env_var(&found)),
                    agent_id: Some(state.agent_id.clone()),
                    provider_id: None,
                    account_id: None,
                    auth_profile_provider: found.provider_id.clone(),
                });
            }
        }
    }

    Ok(Plan {
        version: PLAN_VERSION,
        protocol_version: PLAN_PROTOCOL_VERSION,
        generated_at: Some(Utc::now().to_rfc3339()),
        generated_by: Some("gatehouse secrets configure".to_string()),
        targets,
        provider_upserts,
        provider_deletes: Vec::new(),
        options: PlanOptions::default(),
    })
}

/// Serialize a plan to disk at mode 0600 (it names secret locations).
pub fn write_plan(path: &Path, plan: &Plan) -> Result<()> {
    store::write_json_atomic(path, &serde_json::to_value(plan)?)
}

fn is_plaintext(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::String(s)) if !s.trim().is_empty())
}

fn env_ref(id: String) -> SecretRef {
    SecretRef {
        source: SecretSource::Env,
        provider: DEFAULT_ENV_PROVIDER.to_string(),
        id,
    }
}

/// Derive an environment variable name from a config path:
/// `channels.telegram.botToken` becomes `CHANNELS_TELEGRAM_BOT_TOKEN`.
pub fn suggest_env_var(segments: &[String]) -> String {
    let mut out = String::new();
    for segment in segments {
        for ch in segment.chars() {
            if ch.is_ascii_uppercase() && !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            if ch.is_ascii_alphanumeric() {
                out.push(ch.to_ascii_uppercase());
            } else if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        }
        if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    let mut name = if trimmed.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("V_{trimmed}")
    } else {
        trimmed
    };
    name.truncate(128);
    if name.is_empty() {
        name.push_str("SECRET");
    }
    name
}

/// Auth-profile suggestions key off the provider: `OPENAI_API_KEY`,
/// `GITHUB_TOKEN`.
fn suggest_profile_env_var(found: &DiscoveredTarget<'_>) -> String {
    let provider = found
        .provider_id
        .as_deref()
        .unwrap_or("provider")
        .to_ascii_uppercase()
        .replace(|c: char| !c.is_ascii_alphanumeric(), "_");
    let suffix = match found.target.spec.auth_profile_type {
        Some("token") => "TOKEN",
        _ => "API_KEY",
    };
    debug_assert_eq!(found.target.spec.config_file, ConfigFile::AuthProfile);
    suggest_env_var(&[format!("{provider}_{suffix}")])
}
