use std::fs;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use gatehouse::config::GatewayEnv;
use gatehouse::resolver::Snapshot;
use gatehouse::rpc::{
    AppState, GatewayClient, build_app, resolve_command_secret_refs_via_gateway,
};
use gatehouse::snapshot::SnapshotActivator;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::util::ServiceExt;

fn test_env(dir: &Path) -> GatewayEnv {
    GatewayEnv {
        config_path: dir.join("gatehouse.json"),
        state_dir: dir.join("state"),
        env_file: dir.join(".env"),
        legacy_auth_path: dir.join("state/auth.json"),
    }
}

fn talk_snapshot() -> Snapshot {
    Snapshot {
        source_config: json!({
            "secrets": {"defaults": {"env": "default"}},
            "talk": {"apiKey": {"source": "env", "provider": "default", "id": "TALK_KEY"}}
        }),
        resolved_config: json!({
            "talk": {"apiKey": "sk-live"}
        }),
        auth_stores: Vec::new(),
        warnings: Vec::new(),
    }
}

fn state_with(snapshot: Option<Snapshot>, dir: &Path) -> AppState {
    let activator = Arc::new(SnapshotActivator::new());
    if let Some(snapshot) = snapshot {
        activator.activate(snapshot);
    }
    AppState {
        env: test_env(dir),
        activator,
    }
}

async fn rpc(state: AppState, body: Value) -> (StatusCode, Value) {
    let app = build_app(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rpc")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("request builds"),
        )
        .await
        .expect("handler runs");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value: Value = serde_json::from_slice(&bytes).expect("json body");
    (status, value)
}

#[tokio::test]
async fn resolve_returns_assignments_for_known_ids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (status, body) = rpc(
        state_with(Some(talk_snapshot()), dir.path()),
        json!({"method": "secrets.resolve", "params": {
            "commandName": "memory status",
            "targetIds": ["talk.apiKey"]
        }}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["assignments"][0]["path"], json!("talk.apiKey"));
    assert_eq!(
        body["assignments"][0]["pathSegments"],
        json!(["talk", "apiKey"])
    );
    assert_eq!(body["assignments"][0]["value"], json!("sk-live"));
    assert_eq!(body["diagnostics"], json!([]));
}

#[tokio::test]
async fn unknown_target_id_is_invalid_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (status, body) = rpc(
        state_with(Some(talk_snapshot()), dir.path()),
        json!({"method": "secrets.resolve", "params": {
            "commandName": "x",
            "targetIds": ["not.a.target"]
        }}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST"));
}

#[tokio::test]
async fn missing_snapshot_is_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (status, body) = rpc(
        state_with(None, dir.path()),
        json!({"method": "secrets.resolve", "params": {
            "commandName": "x",
            "targetIds": ["talk.apiKey"]
        }}),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], json!("UNAVAILABLE"));
}

#[tokio::test]
async fn malformed_params_fail_schema_validation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (status, body) = rpc(
        state_with(Some(talk_snapshot()), dir.path()),
        json!({"method": "secrets.resolve", "params": {"commandName": "x"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("schema")
    );
}

#[tokio::test]
async fn reload_failure_keeps_lkg_and_reports_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = test_env(dir.path());
    // A config whose only ref cannot resolve: reload must fail.
    fs::create_dir_all(env.config_path.parent().unwrap()).expect("mkdir");
    fs::write(
        &env.config_path,
        json!({
            "secrets": {"providers": {"default": {"source": "env"}}},
            "talk": {"apiKey": {"source": "env", "provider": "default", "id": "GATEHOUSE_RPC_ABSENT"}}
        })
        .to_string(),
    )
    .expect("write config");

    let state = state_with(Some(talk_snapshot()), dir.path());
    let activator = Arc::clone(&state.activator);
    let (status, body) = rpc(state, json!({"method": "secrets.reload", "params": {}})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], json!("UNAVAILABLE"));
    // Last-known-good stays installed.
    let current = activator.current().expect("snapshot retained");
    assert_eq!(current.resolved_config.pointer("/talk/apiKey"), Some(&json!("sk-live")));
}

#[tokio::test]
async fn unknown_method_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (status, body) = rpc(
        state_with(None, dir.path()),
        json!({"method": "secrets.rotate", "params": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!("METHOD_NOT_FOUND"));
}

#[tokio::test]
async fn cli_helper_hydrates_local_config_over_http() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = state_with(Some(talk_snapshot()), dir.path());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, build_app(state)).await;
    });

    let base_url = format!("http://{addr}");
    let hydrated = tokio::task::spawn_blocking(move || {
        let client = GatewayClient::new(base_url);
        let mut local = json!({
            "secrets": {"defaults": {"env": "default"}},
            "talk": {"apiKey": {"source": "env", "provider": "default", "id": "TALK_KEY"}}
        });
        let diagnostics = resolve_command_secret_refs_via_gateway(
            &client,
            &mut local,
            "memory status",
            &["talk.apiKey".to_string()],
        )?;
        Ok::<(Value, Vec<String>), gatehouse::SecretsError>((local, diagnostics))
    })
    .await
    .expect("join");

    let (local, diagnostics) = hydrated.expect("hydration succeeds");
    assert_eq!(local.pointer("/talk/apiKey"), Some(&json!("sk-live")));
    assert!(diagnostics.is_empty());
}

#[tokio::test]
async fn cli_helper_skips_rpc_when_no_local_ref() {
    // No gateway is listening on this address; the helper must not call it.
    let diagnostics = tokio::task::spawn_blocking(move || {
        let client = GatewayClient::new("http://127.0.0.1:9");
        let mut local = json!({"talk": {"apiKey": "already-plaintext"}});
        resolve_command_secret_refs_via_gateway(
            &client,
            &mut local,
            "memory status",
            &["talk.apiKey".to_string()],
        )
    })
    .await
    .expect("join")
    .expect("short-circuits without RPC");
    assert!(diagnostics.is_empty());
}
