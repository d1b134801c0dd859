use std::fs;
use std::path::Path;

use gatehouse::audit::{AuditStatus, FindingCode, run_secrets_audit};
use gatehouse::config::GatewayEnv;
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
    fs::write(path, value.to_string()).expect("write");
}

fn secrets_section(dir: &TempDir, values: &Value) -> Value {
    let path = dir.path().join("values.json");
    fs::write(&path, values.to_string()).expect("write values");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod");
    }
    json!({
        "providers": {"vals": {"source": "file", "path": path.display().to_string(), "mode": "json"}},
        "defaults": {"file": "vals"}
    })
}

#[tokio::test]
async fn clean_config_audits_clean() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    let mut config = json!({
        "talk": {"apiKey": {"source": "file", "provider": "vals", "id": "/talk"}}
    });
    config["secrets"] = secrets_section(&dir, &json!({"talk": "sk-talk"}));
    write_json(&env.config_path, &config);

    let report = run_secrets_audit(&env).await.expect("audit runs");
    assert_eq!(report.status, AuditStatus::Clean, "{:?}", report.findings);
    assert_eq!(report.exit_code(true), 0);
}

#[tokio::test]
async fn plaintext_everywhere_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    let mut config = json!({
        "talk": {"apiKey": "sk-plaintext"},
        "agents": {"list": [{"id": "main"}]}
    });
    config["secrets"] = secrets_section(&dir, &json!({}));
    write_json(&env.config_path, &config);

    let store_path = env.default_agent_dir("main").join("auth-profiles.json");
    write_json(
        &store_path,
        &json!({"version": 1, "profiles": {
            "openai:default": {"type": "api_key", "provider": "openai", "key": "sk-profile"}
        }}),
    );
    fs::write(&env.env_file, "OPENAI_API_KEY=sk-env\nNOT_A_SECRET=x\n").expect("write .env");

    let report = run_secrets_audit(&env).await.expect("audit runs");
    assert_eq!(report.status, AuditStatus::Findings);
    let plaintext: Vec<&str> = report
        .findings
        .iter()
        .filter(|f| f.code == FindingCode::PlaintextFound)
        .map(|f| f.json_path.as_str())
        .collect();
    assert!(plaintext.contains(&"talk.apiKey"));
    assert!(plaintext.contains(&"profiles.openai:default.key"));
    assert!(plaintext.contains(&"OPENAI_API_KEY"));
    assert!(!plaintext.contains(&"NOT_A_SECRET"));
    assert_eq!(report.exit_code(false), 0);
    assert_eq!(report.exit_code(true), 1);
}

#[tokio::test]
async fn unresolved_ref_forces_exit_code_two() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    let mut config = json!({
        "talk": {"apiKey": {"source": "file", "provider": "vals", "id": "/absent"}}
    });
    config["secrets"] = secrets_section(&dir, &json!({"talk": "sk"}));
    write_json(&env.config_path, &config);

    let report = run_secrets_audit(&env).await.expect("audit runs");
    assert_eq!(report.status, AuditStatus::Unresolved);
    assert!(
        report
            .findings
            .iter()
            .any(|f| f.code == FindingCode::RefUnresolved && f.json_path == "talk.apiKey")
    );
    assert_eq!(report.exit_code(false), 2);
}

#[tokio::test]
async fn missing_config_is_a_root_unresolved_finding() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());

    let report = run_secrets_audit(&env).await.expect("audit runs");
    assert_eq!(report.status, AuditStatus::Unresolved);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].json_path, "");
}

#[tokio::test]
async fn config_ref_shadowed_by_auth_profile() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    let mut config = json!({
        "models": {"providers": {"openai": {
            "apiKey": {"source": "file", "provider": "vals", "id": "/openai"}
        }}},
        "agents": {"list": [{"id": "main"}]}
    });
    config["secrets"] = secrets_section(&dir, &json!({"openai": "sk-config"}));
    write_json(&env.config_path, &config);

    let store_path = env.default_agent_dir("main").join("auth-profiles.json");
    write_json(
        &store_path,
        &json!({"version": 1, "profiles": {
            "openai:work": {"type": "api_key", "provider": "OpenAI", "key": "sk-shadow"}
        }}),
    );

    let report = run_secrets_audit(&env).await.expect("audit runs");
    let shadowed: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.code == FindingCode::RefShadowed)
        .collect();
    assert_eq!(shadowed.len(), 1);
    assert_eq!(shadowed[0].provider.as_deref(), Some("openai"));
    assert_eq!(shadowed[0].profile_id.as_deref(), Some("openai:work"));
}

#[tokio::test]
async fn legacy_store_and_oauth_profiles_are_residue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    let mut config = json!({"agents": {"list": [{"id": "main"}]}});
    config["secrets"] = secrets_section(&dir, &json!({}));
    write_json(&env.config_path, &config);

    write_json(
        &env.legacy_auth_path,
        &json!({"openai": {"type": "api_key", "key": "legacy-sk"}}),
    );
    let store_path = env.default_agent_dir("main").join("auth-profiles.json");
    write_json(
        &store_path,
        &json!({"version": 1, "profiles": {
            "anthropic:oauth": {"type": "oauth", "provider": "anthropic", "accessToken": "at"}
        }}),
    );

    let report = run_secrets_audit(&env).await.expect("audit runs");
    assert_eq!(report.status, AuditStatus::Findings);
    let residue: Vec<&str> = report
        .findings
        .iter()
        .filter(|f| f.code == FindingCode::LegacyResidue)
        .map(|f| f.json_path.as_str())
        .collect();
    assert!(residue.contains(&"openai"));
    assert!(residue.contains(&"profiles.anthropic:oauth"));
}
