use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info_span;

use crate::config::GatewayEnv;
use crate::error::Result;
use crate::providers::{ResolveContext, SecretsSettings};
use crate::reference::{SecretRef, resolve_secret_input};
use crate::registry::{ExpectedValue, registry};
use crate::resolver::load_auth_stores;
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingCode {
    PlaintextFound,
    RefUnresolved,
    RefShadowed,
    LegacyResidue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFinding {
    pub code: FindingCode,
    pub severity: Severity,
    pub file: String,
    pub json_path: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Clean,
    Findings,
    Unresolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub status: AuditStatus,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    /// Exit-code policy: unresolved refs always fail; `--check` turns any
    /// finding into a failure.
    pub fn exit_code(&self, check: bool) -> i32 {
        if self.status == AuditStatus::Unresolved {
            2
        } else if check && self.status != AuditStatus::Clean {
            1
        } else {
            0
        }
    }
}

/// A ref queued for the batch-resolution pass.
struct QueuedRef {
    reference: SecretRef,
    file: String,
    json_path: String,
    expected: ExpectedValue,
    /// Provider id tracked for the shadowing pass (main-config refs only).
    shadow_provider: Option<String>,
}

/// Scan every on-disk surface for plaintext, broken refs, shadowing, and
/// legacy residue.
pub async fn run_secrets_audit(env: &GatewayEnv) -> Result<AuditReport> {
    let span = info_span!("secrets_audit");
    let _enter = span.enter();

    let mut findings: Vec<AuditFinding> = Vec::new();
    let mut queued: Vec<QueuedRef> = Vec::new();

    let config = match store::load_main_config(env) {
        Ok(config) => config,
        Err(err) => {
            findings.push(AuditFinding {
                code: FindingCode::RefUnresolved,
                severity: Severity::Error,
                file: env.config_path.display().to_string(),
                json_path: String::new(),
                message: format!("configuration cannot be loaded: {err}"),
                provider: None,
                profile_id: None,
            });
            return Ok(AuditReport {
                status: AuditStatus::Unresolved,
                findings,
            });
        }
    };

    let settings = match SecretsSettings::from_config(&config) {
        Ok(settings) => settings,
        Err(err) => {
            findings.push(AuditFinding {
                code: FindingCode::RefUnresolved,
                severity: Severity::Error,
                file: env.config_path.display().to_string(),
                json_path: "secrets".to_string(),
                message: err.to_string(),
                provider: None,
                profile_id: None,
            });
            return Ok(AuditReport {
                status: AuditStatus::Unresolved,
                findings,
            });
        }
    };

    if let Err(err) = crate::surfaces::validate_referential_rules(&config, &settings.defaults) {
        findings.push(AuditFinding {
            code: FindingCode::RefUnresolved,
            severity: Severity::Error,
            file: env.config_path.display().to_string(),
            json_path: String::new(),
            message: err.to_string(),
            provider: None,
            profile_id: None,
        });
        return Ok(AuditReport {
            status: AuditStatus::Unresolved,
            findings,
        });
    }

    scan_main_config(env, &config, &settings, &mut findings, &mut queued);

    let auth_stores = load_auth_stores(env, &config)?;
    for state in &auth_stores {
        scan_auth_store(state, &settings, &mut findings, &mut queued);
    }

    scan_legacy_store(env, &mut findings)?;
    scan_env_file(env, &mut findings)?;

    // Resolve every discovered ref through the provider pipeline.
    let context = ResolveContext::new(settings);
    let refs: Vec<SecretRef> = queued.iter().map(|q| q.reference.clone()).collect();
    let outcome = context.resolve(&refs).await;
    for entry in &queued {
        let key = entry.reference.ref_key();
        let resolved = outcome
            .values
            .get(&key)
            .is_some_and(|value| entry.expected.matches(value));
        if !resolved {
            let message = outcome
                .errors
                .get(&key)
                .cloned()
                .unwrap_or_else(|| format!("resolved to an unexpected shape (want {})", entry.expected.as_str()));
            findings.push(AuditFinding {
                code: FindingCode::RefUnresolved,
                severity: Severity::Error,
                file: entry.file.clone(),
                json_path: entry.json_path.clone(),
                message,
                provider: None,
                profile_id: None,
            });
        }
    }

    // A config ref is shadowed when its provider still has usable
    // credentials in any auth-profile store.
    for entry in &queued {
        let Some(provider) = &entry.shadow_provider else {
            continue;
        };
        for state in &auth_stores {
            let Some(profiles) = state.store.get("profiles").and_then(Value::as_object) else {
                continue;
            };
            for (profile_id, profile) in profiles {
                if profile_provider(profile).as_deref() != Some(provider.as_str()) {
                    continue;
                }
                if has_usable_credentials(profile) {
                    findings.push(AuditFinding {
                        code: FindingCode::RefShadowed,
                        severity: Severity::Warning,
                        file: state.store_path.display().to_string(),
                        json_path: format!("profiles.{profile_id}"),
                        message: format!(
                            "config ref at {} is shadowed by auth profile '{profile_id}' for provider '{provider}'",
                            entry.json_path
                        ),
                        provider: Some(provider.clone()),
                        profile_id: Some(profile_id.clone()),
                    });
                }
            }
        }
    }

    let status = if findings
        .iter()
        .any(|f| f.code == FindingCode::RefUnresolved)
    {
        AuditStatus::Unresolved
    } else if findings.is_empty() {
        AuditStatus::Clean
    } else {
        AuditStatus::Findings
    };

    Ok(AuditReport { status, findings })
}

fn scan_main_config(
    env: &GatewayEnv,
    config: &Value,
    settings: &SecretsSettings,
    findings: &mut Vec<AuditFinding>,
    queued: &mut Vec<QueuedRef>,
) {
    let file = env.config_path.display().to_string();
    for found in registry().discover_config_targets(config, None) {
        if !found.target.spec.include_in_audit {
            continue;
        }
        let input = resolve_secret_input(
            found.value.as_ref(),
            found.ref_value.as_ref(),
            &settings.defaults,
        );
        if let Some(reference) = input.effective {
            let shadow_provider = found
                .target
                .spec
                .track_provider_shadowing
                .then(|| found.provider_id.clone().map(|p| p.to_ascii_lowercase()))
                .flatten();
            queued.push(QueuedRef {
                reference,
                file: file.clone(),
                json_path: found.path.clone(),
                expected: found.target.spec.expected,
                shadow_provider,
            });
        }
        if matches!(found.value.as_ref(), Some(Value::String(s)) if !s.trim().is_empty()) {
            findings.push(AuditFinding {
                code: FindingCode::PlaintextFound,
                severity: Severity::Warning,
                file: file.clone(),
                json_path: found.path.clone(),
                message: format!(
                    "plaintext secret at {}; migrate it to a secret ref",
                    found.path
                ),
                provider: found.provider_id.clone(),
                profile_id: None,
            });
        }
    }
}

fn scan_auth_store(
    state: &crate::resolver::AuthStoreState,
    settings: &SecretsSettings,
    findings: &mut Vec<AuditFinding>,
    queued: &mut Vec<QueuedRef>,
) {
    let file = state.store_path.display().to_string();
    for found in registry().discover_auth_profile_targets(&state.store, None) {
        if !found.target.spec.include_in_audit {
            continue;
        }
        let input = resolve_secret_input(
            found.value.as_ref(),
            found.ref_value.as_ref(),
            &settings.defaults,
        );
        if let Some(reference) = input.effective {
            queued.push(QueuedRef {
                reference,
                file: file.clone(),
                json_path: found.path.clone(),
                expected: found.target.spec.expected,
                shadow_provider: None,
            });
        }
        if matches!(found.value.as_ref(), Some(Value::String(s)) if !s.trim().is_empty()) {
            findings.push(AuditFinding {
                code: FindingCode::PlaintextFound,
                severity: Severity::Warning,
                file: file.clone(),
                json_path: found.path.clone(),
                message: format!(
                    "plaintext credential in auth profile at {}; migrate it to a secret ref",
                    found.path
                ),
                provider: found.provider_id.clone(),
                profile_id: found.profile_id.clone(),
            });
        }
    }

    // OAuth profiles are outside ref management; surface their presence.
    if let Some(profiles) = state.store.get("profiles").and_then(Value::as_object) {
        for (profile_id, profile) in profiles {
            if profile.get("type").and_then(Value::as_str) == Some("oauth") {
                findings.push(AuditFinding {
                    code: FindingCode::LegacyResidue,
                    severity: Severity::Info,
                    file: file.clone(),
                    json_path: format!("profiles.{profile_id}"),
                    message: format!(
                        "OAuth profile '{profile_id}' is not managed by secret refs"
                    ),
                    provider: profile_provider(profile),
                    profile_id: Some(profile_id.clone()),
                });
            }
        }
    }
}

fn scan_legacy_store(env: &GatewayEnv, findings: &mut Vec<AuditFinding>) -> Result<()> {
    let Some(legacy) = store::load_legacy_auth(env)? else {
        return Ok(());
    };
    let file = env.legacy_auth_path.display().to_string();
    if let Some(entries) = legacy.as_object() {
        for (provider_id, entry) in entries {
            let is_api_key = entry.get("type").and_then(Value::as_str) == Some("api_key");
            let has_key = matches!(entry.get("key"), Some(Value::String(s)) if !s.is_empty());
            if is_api_key && has_key {
                findings.push(AuditFinding {
                    code: FindingCode::LegacyResidue,
                    severity: Severity::Info,
                    file: file.clone(),
                    json_path: provider_id.clone(),
                    message: format!(
                        "legacy auth store still holds an api key for '{provider_id}'"
                    ),
                    provider: Some(provider_id.to_ascii_lowercase()),
                    profile_id: None,
                });
            }
        }
    }
    Ok(())
}

fn scan_env_file(env: &GatewayEnv, findings: &mut Vec<AuditFinding>) -> Result<()> {
    let Some(lines) = store::load_env_file(env)? else {
        return Ok(());
    };
    let file = env.env_file.display().to_string();
    for line in &lines {
        let (Some(key), Some(value)) = (&line.key, &line.value) else {
            continue;
        };
        if store::KNOWN_SECRET_ENV_VARS.contains(&key.as_str()) && !value.trim().is_empty() {
            findings.push(AuditFinding {
                code: FindingCode::PlaintextFound,
                severity: Severity::Warning,
                file: file.clone(),
                json_path: key.clone(),
                message: format!("{key} holds a plaintext secret in .env"),
                provider: None,
                profile_id: None,
            });
        }
    }
    Ok(())
}

fn profile_provider(profile: &Value) -> Option<String> {
    profile
        .get("provider")
        .and_then(Value::as_str)
        .map(|p| p.to_ascii_lowercase())
}

/// Static key/token material, or an OAuth grant, that would win over a
/// config-level ref for the same provider.
fn has_usable_credentials(profile: &Value) -> bool {
    let non_empty = |field: &str| {
        matches!(profile.get(field), Some(Value::String(s)) if !s.is_empty())
            || profile.get(field).is_some_and(Value::is_object)
    };
    match profile.get("type").and_then(Value::as_str) {
        Some("api_key") => non_empty("key") || non_empty("keyRef"),
        Some("token") => non_empty("token") || non_empty("tokenRef"),
        Some("oauth") => non_empty("access") || non_empty("accessToken") || non_empty("refreshToken"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: AuditStatus) -> AuditReport {
        AuditReport {
            status,
            findings: Vec::new(),
        }
    }

    #[test]
    fn exit_codes_follow_policy() {
        assert_eq!(report(AuditStatus::Unresolved).exit_code(false), 2);
        assert_eq!(report(AuditStatus::Unresolved).exit_code(true), 2);
        assert_eq!(report(AuditStatus::Findings).exit_code(true), 1);
        assert_eq!(report(AuditStatus::Findings).exit_code(false), 0);
        assert_eq!(report(AuditStatus::Clean).exit_code(true), 0);
        assert_eq!(report(AuditStatus::Clean).exit_code(false), 0);
    }

    #[test]
    fn usable_credentials_cover_value_and_ref_fields() {
        assert!(has_usable_credentials(&serde_json::json!({
            "type": "api_key", "provider": "openai", "key": "sk"
        })));
        assert!(has_usable_credentials(&serde_json::json!({
            "type": "token", "provider": "github",
            "tokenRef": {"source": "env", "provider": "default", "id": "T"}
        })));
        assert!(!has_usable_credentials(&serde_json::json!({
            "type": "api_key", "provider": "openai", "key": ""
        })));
        assert!(has_usable_credentials(&serde_json::json!({
            "type": "oauth", "provider": "anthropic", "accessToken": "at"
        })));
    }

    #[test]
    fn finding_serialization_uses_wire_names() {
        let finding = AuditFinding {
            code: FindingCode::RefShadowed,
            severity: Severity::Warning,
            file: "gatehouse.json".into(),
            json_path: "models.providers.openai.apiKey".into(),
            message: "m".into(),
            provider: Some("openai".into()),
            profile_id: None,
        };
        let raw = serde_json::to_value(&finding).expect("serialize");
        assert_eq!(raw["code"], "REF_SHADOWED");
        assert_eq!(raw["severity"], "warning");
        assert_eq!(raw["jsonPath"], "models.providers.openai.apiKey");
    }
}
