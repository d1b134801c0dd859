use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::GatewayEnv;
use crate::error::{Result, SecretsError};
use crate::path::set_path_existing_strict;
use crate::reference::resolve_secret_input;
use crate::registry::registry;
use crate::resolver::Snapshot;
use crate::snapshot::{CommandResolution, SnapshotActivator, resolve_command_secrets};

/// Marker the hydration helper looks for to classify a diagnostic as an
/// inactive-surface skip.
pub const INACTIVE_SURFACE_SENTINEL: &str = ": secret ref is configured on an inactive surface;";

pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERROR_UNAVAILABLE: &str = "UNAVAILABLE";
pub const ERROR_METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";

#[derive(Clone)]
pub struct AppState {
    pub env: GatewayEnv,
    pub activator: Arc<SnapshotActivator>,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

struct ApiError {
    status: StatusCode,
    error: RpcError,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: RpcError {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ERROR_INVALID_REQUEST, message)
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, ERROR_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.error }));
        (self.status, body).into_response()
    }
}

/// Build the RPC router the gateway mounts.
pub fn build_app(state: AppState) -> Router {
    Router::new().route("/rpc", post(rpc_dispatch)).with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|err| SecretsError::Rpc(format!("cannot bind {host}:{port}: {err}")))?;
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| format!("{host}:{port}"));
    info!(addr = %local, "secrets RPC listening");
    axum::serve(listener, build_app(state))
        .await
        .map_err(|err| SecretsError::Rpc(err.to_string()))
}

async fn rpc_dispatch(
    State(state): State<AppState>,
    Json(request): Json<RpcRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    match request.method.as_str() {
        "secrets.reload" => secrets_reload(&state, &request.params).await,
        "secrets.resolve" => secrets_resolve(&state, &request.params),
        other => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            ERROR_METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        )),
    }
}

fn reload_schema() -> &'static JSONSchema {
    static SCHEMA: OnceLock<JSONSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        JSONSchema::compile(&json!({
            "type": "object",
            "additionalProperties": false
        }))
        .expect("reload params schema is valid")
    })
}

fn resolve_schema() -> &'static JSONSchema {
    static SCHEMA: OnceLock<JSONSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        JSONSchema::compile(&json!({
            "type": "object",
            "required": ["commandName", "targetIds"],
            "additionalProperties": false,
            "properties": {
                "commandName": {"type": "string", "minLength": 1},
                "targetIds": {
                    "type": "array",
                    "minItems": 1,
                    "items": {"type": "string", "minLength": 1}
                }
            }
        }))
        .expect("resolve params schema is valid")
    })
}

fn check_schema(schema: &JSONSchema, params: &Value) -> std::result::Result<(), ApiError> {
    let empty = Value::Object(serde_json::Map::new());
    let params = if params.is_null() { &empty } else { params };
    if let Err(errors) = schema.validate(params) {
        let detail: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(ApiError::invalid(format!(
            "params failed schema validation: {}",
            detail.join("; ")
        )));
    }
    Ok(())
}

async fn secrets_reload(
    state: &AppState,
    params: &Value,
) -> std::result::Result<Json<Value>, ApiError> {
    check_schema(reload_schema(), params)?;
    match state.activator.reload(&state.env).await {
        Ok(warning_count) => Ok(Json(json!({"ok": true, "warningCount": warning_count}))),
        Err(err) => {
            warn!(error = %err, "secrets.reload failed; keeping last-known-good snapshot");
            Err(ApiError::unavailable(err.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveParams {
    command_name: String,
    target_ids: Vec<String>,
}

fn secrets_resolve(state: &AppState, params: &Value) -> std::result::Result<Json<Value>, ApiError> {
    check_schema(resolve_schema(), params)?;
    let params: ResolveParams = serde_json::from_value(params.clone())
        .map_err(|err| ApiError::invalid(err.to_string()))?;
    for id in &params.target_ids {
        if !registry().is_known_secret_target_id(id) {
            return Err(ApiError::invalid(format!("unknown target id '{id}'")));
        }
    }
    let snapshot = state
        .activator
        .current()
        .ok_or_else(|| ApiError::unavailable("no snapshot is active"))?;
    let resolution = resolve_command_secrets(
        &snapshot,
        &params.command_name,
        &params.target_ids,
        &BTreeSet::new(),
    )
    .map_err(|err| ApiError::unavailable(err.to_string()))?;
    let mut body = serde_json::to_value(&resolution)
        .map_err(|err| ApiError::unavailable(err.to_string()))?;
    if let Some(map) = body.as_object_mut() {
        map.insert("ok".to_string(), Value::Bool(true));
    }
    Ok(Json(body))
}

/// Blocking client for command-line tools talking to a running gateway.
pub struct GatewayClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::blocking::Client::new(),
        }
    }

    pub fn call(&self, method: &str, params: Value) -> Result<Value> {
        let url = format!("{}/rpc", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&json!({"method": method, "params": params}))
            .send()
            .map_err(|err| SecretsError::Rpc(format!("{method}: {err}")))?;
        let status = response.status();
        let body: Value = response
            .json()
            .map_err(|err| SecretsError::Rpc(format!("{method}: malformed reply: {err}")))?;
        if let Some(error) = body.get("error") {
            let code = error.get("code").and_then(Value::as_str).unwrap_or("RPC");
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            if code == ERROR_UNAVAILABLE {
                return Err(SecretsError::Unavailable(message.to_string()));
            }
            return Err(SecretsError::Rpc(format!("{code}: {message}")));
        }
        if !status.is_success() {
            return Err(SecretsError::Rpc(format!("{method}: HTTP {status}")));
        }
        Ok(body)
    }

    pub fn reload(&self) -> Result<u64> {
        let body = self.call("secrets.reload", json!({}))?;
        Ok(body.get("warningCount").and_then(Value::as_u64).unwrap_or(0))
    }

    pub fn resolve(&self, command_name: &str, target_ids: &[String]) -> Result<CommandResolution> {
        let body = self.call(
            "secrets.resolve",
            json!({"commandName": command_name, "targetIds": target_ids}),
        )?;
        serde_json::from_value(body)
            .map_err(|err| SecretsError::Rpc(format!("secrets.resolve: malformed reply: {err}")))
    }
}

/// Hydrate a command's local config from the gateway's live snapshot.
///
/// When none of the requested target ids holds a configured ref locally the
/// config is returned unchanged and no RPC happens. Otherwise every gateway
/// assignment is written into the local tree at its exact path, and a final
/// local walk verifies nothing stayed unresolved outside inactive surfaces.
pub fn resolve_command_secret_refs_via_gateway(
    client: &GatewayClient,
    config: &mut Value,
    command_name: &str,
    target_ids: &[String],
) -> Result<Vec<String>> {
    let filter: BTreeSet<String> = target_ids.iter().cloned().collect();
    let defaults = crate::providers::SecretsSettings::from_config(config)
        .map(|settings| settings.defaults)
        .unwrap_or_default();
    let has_local_ref = registry()
        .discover_config_targets(config, Some(&filter))
        .iter()
        .any(|found| {
            resolve_secret_input(found.value.as_ref(), found.ref_value.as_ref(), &defaults)
                .effective
                .is_some()
        });
    if !has_local_ref {
        return Ok(Vec::new());
    }

    let source_config = config.clone();
    let resolution = client.resolve(command_name, target_ids)?;
    for assignment in &resolution.assignments {
        set_path_existing_strict(config, &assignment.path_segments, assignment.value.clone())?;
    }

    let inactive: BTreeSet<String> = resolution
        .diagnostics
        .iter()
        .filter_map(|diagnostic| {
            diagnostic
                .find(INACTIVE_SURFACE_SENTINEL)
                .map(|at| diagnostic[..at].to_string())
        })
        .collect();

    // Cross-check: the hydrated tree must satisfy the same walk locally.
    let local_view = Snapshot {
        source_config,
        resolved_config: config.clone(),
        auth_stores: Vec::new(),
        warnings: Vec::new(),
    };
    resolve_command_secrets(&local_view, command_name, target_ids, &inactive)?;
    Ok(resolution.diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemas_enforce_request_shapes() {
        assert!(check_schema(reload_schema(), &json!({})).is_ok());
        assert!(check_schema(reload_schema(), &Value::Null).is_ok());
        assert!(check_schema(reload_schema(), &json!({"extra": 1})).is_err());

        assert!(
            check_schema(
                resolve_schema(),
                &json!({"commandName": "memory status", "targetIds": ["talk.apiKey"]})
            )
            .is_ok()
        );
        assert!(check_schema(resolve_schema(), &json!({"commandName": "x"})).is_err());
        assert!(
            check_schema(
                resolve_schema(),
                &json!({"commandName": "", "targetIds": ["talk.apiKey"]})
            )
            .is_err()
        );
        assert!(
            check_schema(resolve_schema(), &json!({"commandName": "x", "targetIds": []})).is_err()
        );
    }

    #[test]
    fn sentinel_extraction_recovers_paths() {
        let diagnostic = crate::surfaces::inactive_surface_message(
            "channels.telegram.botToken",
            "channel telegram is disabled",
        );
        let at = diagnostic.find(INACTIVE_SURFACE_SENTINEL).expect("sentinel");
        assert_eq!(&diagnostic[..at], "channels.telegram.botToken");
    }
}
