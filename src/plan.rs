use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SecretsError};
use crate::path::{join_path, split_path};
use crate::providers::ProviderConfig;
use crate::reference::{SecretRef, is_valid_provider_alias};
use crate::registry::{CompiledTarget, ConfigFile, PlanTargetQuery, registry};

pub const PLAN_VERSION: u64 = 1;
pub const PLAN_PROTOCOL_VERSION: u64 = 1;

/// Segments that would collide with prototype machinery in consumers that
/// deserialize plans into prototype-based objects.
const FORBIDDEN_SEGMENTS: &[&str] = &["__proto__", "prototype", "constructor"];

/// A migration plan: targets to convert to refs, provider changes, and
/// scrub options. Authored by the configure flow or by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Plan {
    pub version: u64,
    pub protocol_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
    pub targets: Vec<PlanTarget>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_upserts: BTreeMap<String, ProviderConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provider_deletes: Vec<String>,
    #[serde(default)]
    pub options: PlanOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanTarget {
    #[serde(rename = "type")]
    pub target_type: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_segments: Option<Vec<String>>,
    #[serde(rename = "ref")]
    pub reference: SecretRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Provider recorded on a newly created auth profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_profile_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanOptions {
    #[serde(default = "default_true")]
    pub scrub_env: bool,
    #[serde(default = "default_true")]
    pub scrub_auth_profiles_for_provider_targets: bool,
    #[serde(default = "default_true")]
    pub scrub_legacy_auth_json: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            scrub_env: true,
            scrub_auth_profiles_for_provider_targets: true,
            scrub_legacy_auth_json: true,
        }
    }
}

/// One plan target after strict validation against the registry.
#[derive(Debug)]
pub struct CheckedTarget<'p> {
    pub plan_target: &'p PlanTarget,
    pub target: &'static CompiledTarget,
    pub path_segments: Vec<String>,
    pub ref_path_segments: Option<Vec<String>>,
    pub provider_id: Option<String>,
    pub account_id: Option<String>,
}

/// Read a plan file and validate it.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| SecretsError::PlanInvalid(format!("cannot read {}: {err}", path.display())))?;
    let plan: Plan = serde_json::from_str(&raw)
        .map_err(|err| SecretsError::PlanInvalid(format!("{}: {err}", path.display())))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Strict, total validation of an incoming plan. Returns the resolved
/// targets so the apply engine never re-derives them.
pub fn validate_plan(plan: &Plan) -> Result<Vec<CheckedTarget<'_>>> {
    if plan.version != PLAN_VERSION {
        return Err(SecretsError::PlanInvalid(format!(
            "unsupported version {} (want {PLAN_VERSION})",
            plan.version
        )));
    }
    if plan.protocol_version != PLAN_PROTOCOL_VERSION {
        return Err(SecretsError::PlanInvalid(format!(
            "unsupported protocolVersion {} (want {PLAN_PROTOCOL_VERSION})",
            plan.protocol_version
        )));
    }

    let mut checked = Vec::with_capacity(plan.targets.len());
    for (index, plan_target) in plan.targets.iter().enumerate() {
        checked.push(validate_target(index, plan_target)?);
    }

    for (alias, _config) in &plan.provider_upserts {
        if !is_valid_provider_alias(alias) {
            return Err(SecretsError::PlanInvalid(format!(
                "providerUpserts alias '{alias}' is invalid"
            )));
        }
    }
    for alias in &plan.provider_deletes {
        if !is_valid_provider_alias(alias) {
            return Err(SecretsError::PlanInvalid(format!(
                "providerDeletes alias '{alias}' is invalid"
            )));
        }
    }

    Ok(checked)
}

fn validate_target<'p>(index: usize, plan_target: &'p PlanTarget) -> Result<CheckedTarget<'p>> {
    let at = |message: String| {
        SecretsError::PlanInvalid(format!("targets[{index}] ({}): {message}", plan_target.path))
    };

    if !registry().is_known_secret_target_type(&plan_target.target_type) {
        return Err(at(format!(
            "unknown target type '{}'",
            plan_target.target_type
        )));
    }
    if plan_target.path.is_empty() {
        return Err(at("path is empty".to_string()));
    }

    let path_segments = match &plan_target.path_segments {
        Some(segments) => {
            if join_path(segments) != plan_target.path {
                return Err(at("pathSegments do not serialize to path".to_string()));
            }
            segments.clone()
        }
        None => split_path(&plan_target.path),
    };
    for segment in &path_segments {
        if FORBIDDEN_SEGMENTS.contains(&segment.as_str()) {
            return Err(at(format!("forbidden path segment '{segment}'")));
        }
    }

    plan_target
        .reference
        .validate()
        .map_err(|err| at(err.to_string()))?;

    let resolved = registry()
        .resolve_plan_target(&PlanTargetQuery {
            target_type: &plan_target.target_type,
            path_segments: &path_segments,
            provider_id: plan_target.provider_id.as_deref(),
            account_id: plan_target.account_id.as_deref(),
        })
        .ok_or_else(|| {
            at("path does not match the registered pattern for this type".to_string())
        })?;

    if resolved.target.spec.config_file == ConfigFile::AuthProfile
        && plan_target.agent_id.as_deref().unwrap_or("").is_empty()
    {
        return Err(at("auth-profile targets require agentId".to_string()));
    }
    if let Some(provider) = &plan_target.auth_profile_provider {
        if provider.trim().is_empty() {
            return Err(at("authProfileProvider must be non-empty when set".to_string()));
        }
    }

    Ok(CheckedTarget {
        plan_target,
        target: resolved.target,
        path_segments,
        ref_path_segments: resolved.ref_path_segments,
        provider_id: resolved.provider_id,
        account_id: resolved.account_id,
    })
}
