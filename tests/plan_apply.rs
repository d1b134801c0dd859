use std::fs;
use std::path::{Path, PathBuf};

use gatehouse::apply::{ApplyOutcome, FileCommitter, apply_plan, apply_plan_with};
use gatehouse::config::GatewayEnv;
use gatehouse::error::{Result, SecretsError};
use gatehouse::plan::{PLAN_PROTOCOL_VERSION, PLAN_VERSION, Plan, PlanOptions, PlanTarget};
use gatehouse::reference::{SecretRef, SecretSource};
use serde_json::{Value, json};
use tempfile::TempDir;

fn test_env(dir: &Path) -> GatewayEnv {
    GatewayEnv {
        config_path: dir.join("gatehouse.json"),
        state_dir: dir.join("state"),
        env_file: dir.join(".env"),
        legacy_auth_path: dir.join("state/auth.json"),
    }
}

fn write_json(path: &Path, value: &Value) {
    fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
    fs::write(path, serde_json::to_string_pretty(value).unwrap()).expect("write");
}

/// A config whose secrets come from a mode-0600 JSON file, so plans can
/// preflight without touching the process environment.
fn seed_file_provider(dir: &TempDir, env: &GatewayEnv) -> String {
    let store_path = dir.path().join("secret-values.json");
    fs::write(
        &store_path,
        json!({"openai": "sk-new-from-file", "telegram": "123:new"}).to_string(),
    )
    .expect("write values");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&store_path, fs::Permissions::from_mode(0o600)).expect("chmod");
    }
    let config = json!({
        "secrets": {
            "providers": {"vals": {"source": "file", "path": store_path.display().to_string(), "mode": "json"}},
            "defaults": {"file": "vals"}
        },
        "agents": {"list": [{"id": "main"}]}
    });
    write_json(&env.config_path, &config);
    store_path.display().to_string()
}

fn file_ref(pointer: &str) -> SecretRef {
    SecretRef {
        source: SecretSource::File,
        provider: "vals".into(),
        id: pointer.into(),
    }
}

fn auth_key_plan(reference: SecretRef) -> Plan {
    Plan {
        version: PLAN_VERSION,
        protocol_version: PLAN_PROTOCOL_VERSION,
        generated_at: None,
        generated_by: Some("tests".into()),
        targets: vec![PlanTarget {
            target_type: "auth-profiles.api_key.key".into(),
            path: "profiles.openai:default.key".into(),
            path_segments: None,
            reference,
            agent_id: Some("main".into()),
            provider_id: None,
            account_id: None,
            auth_profile_provider: Some("openai".into()),
        }],
        provider_upserts: Default::default(),
        provider_deletes: Vec::new(),
        options: PlanOptions::default(),
    }
}

fn seed_auth_store(env: &GatewayEnv) -> PathBuf {
    let store_path = env.default_agent_dir("main").join("auth-profiles.json");
    write_json(
        &store_path,
        &json!({"version": 1, "profiles": {
            "openai:default": {"type": "api_key", "provider": "openai", "key": "sk-old-plain"}
        }}),
    );
    store_path
}

#[tokio::test]
async fn sibling_ref_migration_scrubs_plaintext_and_env() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    seed_file_provider(&dir, &env);
    let store_path = seed_auth_store(&env);
    fs::write(
        &env.env_file,
        "KEEP_ME=untouched\nOPENAI_API_KEY=sk-old-plain\n",
    )
    .expect("write .env");

    let outcome = apply_plan(&env, &auth_key_plan(file_ref("/openai")), false)
        .await
        .expect("apply succeeds");
    assert!(!outcome.dry_run);
    assert!(outcome.changed_files.contains(&store_path));
    assert!(outcome.changed_files.contains(&env.env_file));

    let store: Value =
        serde_json::from_str(&fs::read_to_string(&store_path).unwrap()).expect("json");
    assert!(store.pointer("/profiles/openai:default/key").is_none());
    let key_ref = store
        .pointer("/profiles/openai:default/keyRef")
        .expect("keyRef written");
    assert_eq!(key_ref["source"], "file");
    assert_eq!(key_ref["id"], "/openai");

    let env_file = fs::read_to_string(&env.env_file).expect(".env kept");
    assert!(env_file.contains("KEEP_ME=untouched"));
    assert!(!env_file.contains("sk-old-plain"));
}

#[tokio::test]
async fn dry_run_reports_changes_without_writing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    seed_file_provider(&dir, &env);
    let store_path = seed_auth_store(&env);
    let before = fs::read_to_string(&store_path).expect("read");

    let outcome = apply_plan(&env, &auth_key_plan(file_ref("/openai")), true)
        .await
        .expect("dry run succeeds");
    assert!(outcome.dry_run);
    assert!(outcome.changed_files.contains(&store_path));
    assert_eq!(fs::read_to_string(&store_path).expect("read"), before);
}

#[tokio::test]
async fn preflight_failure_prevents_any_write() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    seed_file_provider(&dir, &env);
    let store_path = seed_auth_store(&env);
    let before = fs::read_to_string(&store_path).expect("read");

    let err = apply_plan(&env, &auth_key_plan(file_ref("/no-such-pointer")), false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("/no-such-pointer"));
    assert_eq!(fs::read_to_string(&store_path).expect("read"), before);
}

#[tokio::test]
async fn profile_type_mismatch_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    seed_file_provider(&dir, &env);
    let store_path = env.default_agent_dir("main").join("auth-profiles.json");
    write_json(
        &store_path,
        &json!({"version": 1, "profiles": {
            "openai:default": {"type": "token", "provider": "openai", "token": "t"}
        }}),
    );

    let err = apply_plan(&env, &auth_key_plan(file_ref("/openai")), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::PlanInvalid(_)));
    assert!(err.to_string().contains("type"));
}

struct FailOn {
    needle: &'static str,
}

impl FileCommitter for FailOn {
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if path.display().to_string().contains(self.needle) {
            return Err(SecretsError::ApplyIo {
                path: path.to_path_buf(),
                message: "injected failure".into(),
            });
        }
        gatehouse::store::write_bytes_atomic(path, bytes)
    }
}

#[tokio::test]
async fn failed_commit_rolls_back_every_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    seed_file_provider(&dir, &env);
    let store_path = seed_auth_store(&env);

    let config_before = fs::read_to_string(&env.config_path).expect("read");
    let store_before = fs::read_to_string(&store_path).expect("read");

    // The plan changes the main config (provider upsert) and the auth
    // store; failing the auth-store write must restore the config too.
    let mut plan = auth_key_plan(file_ref("/openai"));
    plan.provider_upserts.insert(
        "extra".into(),
        gatehouse::providers::ProviderConfig::Env(Default::default()),
    );

    let err = apply_plan_with(
        &env,
        &plan,
        false,
        &FailOn {
            needle: "auth-profiles",
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("injected failure"));

    assert_eq!(fs::read_to_string(&env.config_path).expect("read"), config_before);
    assert_eq!(fs::read_to_string(&store_path).expect("read"), store_before);
}

#[tokio::test]
async fn provider_upsert_is_deep_equal_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    let store = seed_file_provider(&dir, &env);

    let mut plan = auth_key_plan(file_ref("/openai"));
    plan.targets.clear();
    plan.provider_upserts.insert(
        "vals".into(),
        serde_json::from_value(json!({
            "source": "file", "path": store, "mode": "json",
            "timeoutMs": 2000, "maxBytes": 1048576, "checkPermissions": true
        }))
        .expect("config parses"),
    );

    let outcome: ApplyOutcome = apply_plan(&env, &plan, false).await.expect("apply succeeds");
    assert!(
        outcome.changed_files.is_empty(),
        "deep-equal upsert must not rewrite the config: {:?}",
        outcome.changed_files
    );
}

#[tokio::test]
async fn legacy_auth_store_is_scrubbed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    seed_file_provider(&dir, &env);
    seed_auth_store(&env);
    write_json(
        &env.legacy_auth_path,
        &json!({
            "openai": {"type": "api_key", "key": "legacy-sk"},
            "anthropic": {"type": "oauth", "accessToken": "at"}
        }),
    );

    let outcome = apply_plan(&env, &auth_key_plan(file_ref("/openai")), false)
        .await
        .expect("apply succeeds");
    assert!(outcome.changed_files.contains(&env.legacy_auth_path));

    let legacy: Value =
        serde_json::from_str(&fs::read_to_string(&env.legacy_auth_path).unwrap()).expect("json");
    assert!(legacy.get("openai").is_none(), "api_key entry dropped");
    assert!(legacy.get("anthropic").is_some(), "oauth entry kept");
}
