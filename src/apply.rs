use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, info_span, warn};

use crate::config::GatewayEnv;
use crate::error::{Result, SecretsError};
use crate::path::{delete_path_strict, get_path, set_path_create_strict};
use crate::plan::{CheckedTarget, Plan, validate_plan};
use crate::providers::{ProviderConfig, ResolveContext, SecretsSettings};
use crate::reference::SecretRef;
use crate::registry::{ConfigFile, SecretShape};
use crate::resolver::{AuthStoreState, prepare_snapshot};
use crate::store;

/// Outcome of projecting (and optionally committing) a plan.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub changed_files: Vec<PathBuf>,
    pub warnings: Vec<String>,
    pub dry_run: bool,
}

/// Commit seam: writes one projected file. Tests inject failing committers
/// to exercise rollback.
pub trait FileCommitter {
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()>;
}

/// Production committer: temp file, chmod 0600, rename.
pub struct DefaultCommitter;

impl FileCommitter for DefaultCommitter {
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        store::write_bytes_atomic(path, bytes)
    }
}

/// One file's projected content, with the pre-apply bytes kept for rollback.
struct ProjectedFile {
    path: PathBuf,
    bytes: Vec<u8>,
    prior: Option<Vec<u8>>,
}

pub async fn apply_plan(env: &GatewayEnv, plan: &Plan, dry_run: bool) -> Result<ApplyOutcome> {
    apply_plan_with(env, plan, dry_run, &DefaultCommitter).await
}

/// Project the plan over every affected file, preflight the result through
/// the resolver, then commit all files with best-effort rollback.
pub async fn apply_plan_with(
    env: &GatewayEnv,
    plan: &Plan,
    dry_run: bool,
    committer: &dyn FileCommitter,
) -> Result<ApplyOutcome> {
    let span = info_span!("secrets_apply", dry_run);
    let _enter = span.enter();

    let checked = validate_plan(plan)?;
    let mut warnings: Vec<String> = Vec::new();

    // 1. Current main config is the projection base.
    let mut next_config = store::load_main_config(env)?;
    let mut config_changed = false;

    // 2. Provider upserts and deletes; deep-equal upserts are no-ops. The
    //    comparison is semantic, so a config that merely omits defaulted
    //    fields is not rewritten.
    for (alias, config) in &plan.provider_upserts {
        let segments = provider_segments(alias);
        let current = get_path(&next_config, &segments)
            .and_then(|value| serde_json::from_value::<ProviderConfig>(value.clone()).ok());
        if current.as_ref() != Some(config) {
            set_path_create_strict(&mut next_config, &segments, serde_json::to_value(config)?)?;
            config_changed = true;
        }
    }
    for alias in &plan.provider_deletes {
        let segments = provider_segments(alias);
        if delete_path_strict(&mut next_config, &segments)? {
            config_changed = true;
        }
    }

    // 3. Plan targets.
    let mut stores: BTreeMap<PathBuf, StoreProjection> = BTreeMap::new();
    let mut scrubbed_values: BTreeSet<String> = BTreeSet::new();
    let mut provider_targets: BTreeSet<String> = BTreeSet::new();
    for target in &checked {
        match target.target.spec.config_file {
            ConfigFile::Main => {
                config_changed |=
                    apply_main_target(&mut next_config, target, &mut scrubbed_values)?;
                if target.target.spec.track_provider_shadowing {
                    if let Some(provider) = &target.provider_id {
                        provider_targets.insert(provider.to_ascii_lowercase());
                    }
                }
            }
            ConfigFile::AuthProfile => {
                let agent_id = target
                    .plan_target
                    .agent_id
                    .as_deref()
                    .unwrap_or_default()
                    .to_string();
                let store_path = store::agent_store_path(env, &next_config, &agent_id);
                let projection = load_store_projection(&mut stores, &store_path)?;
                projection.changed |=
                    apply_auth_target(&mut projection.store, target, &mut scrubbed_values)?;
            }
        }
    }

    // 4. Strip redundant profile credentials for providers the config now
    //    owns; warn about OAuth residue that stays in place.
    if plan.options.scrub_auth_profiles_for_provider_targets && !provider_targets.is_empty() {
        for agent in store::list_agents(env, &next_config) {
            let store_path = agent.store_path();
            if !stores.contains_key(&store_path)
                && store::load_auth_profiles(&store_path)?.is_none()
            {
                continue;
            }
            let projection = load_store_projection(&mut stores, &store_path)?;
            projection.changed |= scrub_profiles_for_providers(
                &mut projection.store,
                &provider_targets,
                &mut scrubbed_values,
                &mut warnings,
                &store_path,
            );
        }
    }

    // 5. Legacy auth store scrub.
    let mut legacy_projection: Option<(Value, bool)> = None;
    if plan.options.scrub_legacy_auth_json {
        if let Some(mut legacy) = store::load_legacy_auth(env)? {
            let changed = scrub_legacy_store(&mut legacy, &mut scrubbed_values);
            legacy_projection = Some((legacy, changed));
        }
    }

    // 6. `.env` scrub: drop known secret variables whose value was captured
    //    as scrubbed plaintext.
    let mut env_projection: Option<(Vec<store::EnvLine>, bool)> = None;
    if plan.options.scrub_env {
        if let Some(lines) = store::load_env_file(env)? {
            let before = lines.len();
            let kept: Vec<store::EnvLine> = lines
                .into_iter()
                .filter(|line| {
                    let Some((key, value)) = line.key.as_deref().zip(line.value.as_deref()) else {
                        return true;
                    };
                    !(store::KNOWN_SECRET_ENV_VARS.contains(&key)
                        && scrubbed_values.contains(value))
                })
                .collect();
            let changed = kept.len() != before;
            env_projection = Some((kept, changed));
        }
    }

    // 7. Preflight: every plan ref must resolve to its expected shape, then
    //    the full resolver must activate the projected state end-to-end.
    preflight(&next_config, &checked).await?;
    let preflight_stores = preflight_auth_stores(env, &next_config, &stores)?;
    let snapshot = prepare_snapshot(&next_config, preflight_stores).await?;
    info!(
        warnings = snapshot.warnings.len(),
        "preflight activation succeeded"
    );

    // 8. Commit.
    let mut projected: Vec<ProjectedFile> = Vec::new();
    if config_changed {
        projected.push(project_json(&env.config_path, &next_config)?);
    }
    for (path, projection) in &stores {
        if projection.changed {
            projected.push(project_json(path, &projection.store)?);
        }
    }
    if let Some((legacy, true)) = &legacy_projection {
        projected.push(project_json(&env.legacy_auth_path, legacy)?);
    }
    if let Some((lines, true)) = &env_projection {
        projected.push(ProjectedFile {
            path: env.env_file.clone(),
            bytes: store::render_env_file(lines).into_bytes(),
            prior: read_prior(&env.env_file)?,
        });
    }

    let changed_files: Vec<PathBuf> = projected.iter().map(|f| f.path.clone()).collect();
    if dry_run {
        return Ok(ApplyOutcome {
            changed_files,
            warnings,
            dry_run: true,
        });
    }

    commit_all(&projected, committer)?;
    info!(files = changed_files.len(), "plan applied");
    Ok(ApplyOutcome {
        changed_files,
        warnings,
        dry_run: false,
    })
}

struct StoreProjection {
    store: Value,
    changed: bool,
}

fn load_store_projection<'s>(
    stores: &'s mut BTreeMap<PathBuf, StoreProjection>,
    store_path: &Path,
) -> Result<&'s mut StoreProjection> {
    use std::collections::btree_map::Entry;
    match stores.entry(store_path.to_path_buf()) {
        Entry::Occupied(occupied) => Ok(occupied.into_mut()),
        Entry::Vacant(vacant) => {
            let document =
                store::load_auth_profiles(store_path)?.unwrap_or_else(store::empty_auth_store);
            Ok(vacant.insert(StoreProjection {
                store: document,
                changed: false,
            }))
        }
    }
}

fn provider_segments(alias: &str) -> Vec<String> {
    vec![
        "secrets".to_string(),
        "providers".to_string(),
        alias.to_string(),
    ]
}

/// Write the ref into the main config. Sibling-ref targets park the ref at
/// the ref path and drop the plaintext; secret-input targets overwrite the
/// value slot in place.
fn apply_main_target(
    next_config: &mut Value,
    target: &CheckedTarget<'_>,
    scrubbed_values: &mut BTreeSet<String>,
) -> Result<bool> {
    let ref_value = serde_json::to_value(&target.plan_target.reference)?;
    let mut changed = false;
    capture_plaintext(next_config, &target.path_segments, scrubbed_values);
    match target.target.spec.shape {
        SecretShape::SecretInput => {
            changed |= set_path_create_strict(next_config, &target.path_segments, ref_value)?;
        }
        SecretShape::SiblingRef => {
            let ref_segments = target.ref_path_segments.as_ref().ok_or_else(|| {
                SecretsError::PlanInvalid(format!(
                    "target {} lacks a ref path",
                    target.plan_target.path
                ))
            })?;
            changed |= set_path_create_strict(next_config, ref_segments, ref_value)?;
            changed |= delete_path_strict(next_config, &target.path_segments)?;
        }
    }
    Ok(changed)
}

/// Write the ref into an auth-profile store, creating or checking the
/// profile scaffold first.
fn apply_auth_target(
    document: &mut Value,
    target: &CheckedTarget<'_>,
    scrubbed_values: &mut BTreeSet<String>,
) -> Result<bool> {
    let profile_id = target.path_segments.get(1).cloned().ok_or_else(|| {
        SecretsError::PlanInvalid(format!(
            "target {} has no profile segment",
            target.plan_target.path
        ))
    })?;
    if !store::is_valid_profile_id(&profile_id) {
        return Err(SecretsError::PlanInvalid(format!(
            "invalid profile id '{profile_id}'"
        )));
    }
    let expected_type = target.target.spec.auth_profile_type.unwrap_or("api_key");

    let mut changed = false;
    let profile_segments = vec!["profiles".to_string(), profile_id.clone()];
    match get_path(document, &profile_segments) {
        Some(profile) => {
            let existing_type = profile.get("type").and_then(Value::as_str);
            if existing_type != Some(expected_type) {
                return Err(SecretsError::PlanInvalid(format!(
                    "profile '{profile_id}' has type {existing_type:?}, target expects {expected_type}"
                )));
            }
        }
        None => {
            let provider = target
                .plan_target
                .auth_profile_provider
                .as_deref()
                .ok_or_else(|| {
                    SecretsError::PlanInvalid(format!(
                        "creating profile '{profile_id}' requires authProfileProvider"
                    ))
                })?;
            set_path_create_strict(
                document,
                &profile_segments,
                serde_json::json!({"type": expected_type, "provider": provider}),
            )?;
            changed = true;
        }
    }

    capture_plaintext(document, &target.path_segments, scrubbed_values);
    let ref_segments = target.ref_path_segments.as_ref().ok_or_else(|| {
        SecretsError::PlanInvalid(format!(
            "target {} lacks a ref path",
            target.plan_target.path
        ))
    })?;
    let ref_value = serde_json::to_value(&target.plan_target.reference)?;
    changed |= set_path_create_strict(document, ref_segments, ref_value)?;
    changed |= delete_path_strict(document, &target.path_segments)?;
    Ok(changed)
}

fn capture_plaintext(root: &Value, segments: &[String], scrubbed_values: &mut BTreeSet<String>) {
    if let Some(Value::String(prior)) = get_path(root, segments) {
        if !prior.is_empty() {
            scrubbed_values.insert(prior.clone());
        }
    }
}

/// Remove static credentials (value and ref fields alike) from api_key and
/// token profiles whose provider the config now owns.
fn scrub_profiles_for_providers(
    document: &mut Value,
    provider_targets: &BTreeSet<String>,
    scrubbed_values: &mut BTreeSet<String>,
    warnings: &mut Vec<String>,
    store_path: &Path,
) -> bool {
    let Some(profiles) = document.get_mut("profiles").and_then(Value::as_object_mut) else {
        return false;
    };
    let mut changed = false;
    for (profile_id, profile) in profiles.iter_mut() {
        let Some(provider) = profile
            .get("provider")
            .and_then(Value::as_str)
            .map(|p| p.to_ascii_lowercase())
        else {
            continue;
        };
        if !provider_targets.contains(&provider) {
            continue;
        }
        match profile.get("type").and_then(Value::as_str) {
            Some("api_key") => {
                changed |= strip_fields(profile, &["key", "keyRef"], scrubbed_values);
            }
            Some("token") => {
                changed |= strip_fields(profile, &["token", "tokenRef"], scrubbed_values);
            }
            Some("oauth") => {
                warnings.push(format!(
                    "{}: OAuth profile '{profile_id}' for provider '{provider}' left in place",
                    store_path.display()
                ));
            }
            _ => {}
        }
    }
    changed
}

fn strip_fields(
    profile: &mut Value,
    fields: &[&str],
    scrubbed_values: &mut BTreeSet<String>,
) -> bool {
    let Some(map) = profile.as_object_mut() else {
        return false;
    };
    let mut changed = false;
    for field in fields {
        if let Some(removed) = map.remove(*field) {
            if let Value::String(value) = &removed {
                if !value.is_empty() {
                    scrubbed_values.insert(value.clone());
                }
            }
            changed = true;
        }
    }
    changed
}

/// Drop static api-key entries from the legacy flat store.
fn scrub_legacy_store(legacy: &mut Value, scrubbed_values: &mut BTreeSet<String>) -> bool {
    let Some(entries) = legacy.as_object_mut() else {
        return false;
    };
    let stale: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.get("type").and_then(Value::as_str) == Some("api_key"))
        .map(|(provider_id, _)| provider_id.clone())
        .collect();
    let mut changed = false;
    for provider_id in stale {
        if let Some(entry) = entries.remove(&provider_id) {
            if let Some(Value::String(key)) = entry.get("key") {
                if !key.is_empty() {
                    scrubbed_values.insert(key.clone());
                }
            }
            changed = true;
        }
    }
    changed
}

/// Resolve every plan target's ref against the projected config; each must
/// produce its expected shape before anything is written.
async fn preflight(next_config: &Value, checked: &[CheckedTarget<'_>]) -> Result<()> {
    let settings = SecretsSettings::from_config(next_config)?;
    let context = ResolveContext::new(settings);
    let refs: Vec<SecretRef> = checked
        .iter()
        .map(|t| t.plan_target.reference.clone())
        .collect();
    let outcome = context.resolve(&refs).await;
    for target in checked {
        let key = target.plan_target.reference.ref_key();
        match outcome.values.get(&key) {
            Some(value) if target.target.spec.expected.matches(value) => {}
            Some(_) => {
                return Err(SecretsError::ShapeMismatch {
                    path: target.plan_target.path.clone(),
                    expected: target.target.spec.expected.as_str(),
                });
            }
            None => {
                return Err(SecretsError::RefResolution {
                    ref_key: format!("{key} (at {})", target.plan_target.path),
                    message: outcome
                        .errors
                        .get(&key)
                        .cloned()
                        .unwrap_or_else(|| "unresolved".to_string()),
                });
            }
        }
    }
    Ok(())
}

/// Auth stores for the preflight activation: projected content where the
/// plan touched a store, disk content elsewhere.
fn preflight_auth_stores(
    env: &GatewayEnv,
    next_config: &Value,
    projections: &BTreeMap<PathBuf, StoreProjection>,
) -> Result<Vec<AuthStoreState>> {
    let mut states = Vec::new();
    for agent in store::list_agents(env, next_config) {
        let path = agent.store_path();
        let document = match projections.get(&path) {
            Some(projection) => Some(projection.store.clone()),
            None => store::load_auth_profiles(&path)?,
        };
        if let Some(document) = document {
            states.push(AuthStoreState {
                agent_id: agent.id,
                store_path: path,
                store: document,
            });
        }
    }
    Ok(states)
}

fn project_json(path: &Path, value: &Value) -> Result<ProjectedFile> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(ProjectedFile {
        path: path.to_path_buf(),
        bytes,
        prior: read_prior(path)?,
    })
}

fn read_prior(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SecretsError::ApplyIo {
            path: path.to_path_buf(),
            message: format!("cannot snapshot prior content: {err}"),
        }),
    }
}

/// Write every projected file; on any failure restore the files already
/// written from their pre-apply snapshots and surface the original error.
fn commit_all(projected: &[ProjectedFile], committer: &dyn FileCommitter) -> Result<()> {
    let mut written: Vec<&ProjectedFile> = Vec::new();
    for file in projected {
        match committer.write(&file.path, &file.bytes) {
            Ok(()) => written.push(file),
            Err(err) => {
                for done in &written {
                    restore(done);
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

fn restore(file: &ProjectedFile) {
    let result = match &file.prior {
        Some(bytes) => fs::write(&file.path, bytes),
        None => match fs::remove_file(&file.path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        },
    };
    if let Err(err) = result {
        warn!(path = %file.path.display(), error = %err, "rollback failed for file");
    }
}
