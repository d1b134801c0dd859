use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::config::GatewayEnv;
use crate::error::{Result, SecretsError};

/// Environment variable names the gateway historically read secrets from.
/// Only these are candidates for `.env` scrubbing.
pub const KNOWN_SECRET_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GEMINI_API_KEY",
    "GROK_API_KEY",
    "KIMI_API_KEY",
    "PERPLEXITY_API_KEY",
    "ELEVENLABS_API_KEY",
    "TELEGRAM_BOT_TOKEN",
    "SLACK_BOT_TOKEN",
    "SLACK_APP_TOKEN",
    "SLACK_SIGNING_SECRET",
    "DISCORD_BOT_TOKEN",
    "PLURALKIT_TOKEN",
    "TLON_SHIP_CODE",
    "GATEWAY_PASSWORD",
    "GATEWAY_REMOTE_TOKEN",
];

/// Load and parse the main configuration; it must exist and hold a mapping.
pub fn load_main_config(env: &GatewayEnv) -> Result<Value> {
    let raw = fs::read_to_string(&env.config_path).map_err(|err| {
        SecretsError::Config(format!(
            "cannot read {}: {err}",
            env.config_path.display()
        ))
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|err| {
        SecretsError::Config(format!(
            "{} is not valid JSON: {err}",
            env.config_path.display()
        ))
    })?;
    if !value.is_object() {
        return Err(SecretsError::Config(format!(
            "{} must hold a JSON object",
            env.config_path.display()
        )));
    }
    Ok(value)
}

/// The standard writer for the main configuration.
pub fn write_main_config(env: &GatewayEnv, config: &Value) -> Result<()> {
    write_json_atomic(&env.config_path, config)
}

/// Serialize a JSON document and write it atomically at mode 0600.
pub fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_bytes_atomic(path, &bytes)
}

/// Write via a temp file in the target directory, chmod 0600, then rename.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| SecretsError::ApplyIo {
        path: path.to_path_buf(),
        message: format!("cannot create {}: {err}", parent.display()),
    })?;
    let io_err = |message: String| SecretsError::ApplyIo {
        path: path.to_path_buf(),
        message,
    };
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|err| io_err(format!("cannot create temp file: {err}")))?;
    std::io::Write::write_all(&mut temp, bytes)
        .map_err(|err| io_err(format!("cannot write temp file: {err}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))
            .map_err(|err| io_err(format!("cannot chmod temp file: {err}")))?;
    }
    temp.persist(path)
        .map_err(|err| io_err(format!("cannot rename into place: {err}")))?;
    Ok(())
}

/// `^[A-Za-z0-9:_\-]{1,128}$`
pub fn is_valid_profile_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b':' | b'_' | b'-'))
}

/// One agent known to the configuration, with its auth-profile directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRef {
    pub id: String,
    pub dir: PathBuf,
}

impl AgentRef {
    pub fn store_path(&self) -> PathBuf {
        self.dir.join("auth-profiles.json")
    }
}

/// List agents from `agents.list[]`; an `agentDir` entry overrides the
/// default location. Without any configured agents the gateway still runs
/// one implicit `main` agent.
pub fn list_agents(env: &GatewayEnv, config: &Value) -> Vec<AgentRef> {
    let mut agents = Vec::new();
    if let Some(Value::Array(list)) = config.pointer("/agents/list") {
        for entry in list {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                warn!("agents.list entry without an id; skipping");
                continue;
            };
            let dir = entry
                .get("agentDir")
                .and_then(Value::as_str)
                .map(PathBuf::from)
                .unwrap_or_else(|| env.default_agent_dir(id));
            agents.push(AgentRef {
                id: id.to_string(),
                dir,
            });
        }
    }
    if agents.is_empty() {
        agents.push(AgentRef {
            id: "main".to_string(),
            dir: env.default_agent_dir("main"),
        });
    }
    agents
}

/// Resolve the auth-profile store path for one agent id.
pub fn agent_store_path(env: &GatewayEnv, config: &Value, agent_id: &str) -> PathBuf {
    list_agents(env, config)
        .into_iter()
        .find(|agent| agent.id == agent_id)
        .map(|agent| agent.store_path())
        .unwrap_or_else(|| env.default_agent_dir(agent_id).join("auth-profiles.json"))
}

/// Load one auth-profile store; `None` when absent.
pub fn load_auth_profiles(path: &Path) -> Result<Option<Value>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(SecretsError::Config(format!(
                "cannot read {}: {err}",
                path.display()
            )));
        }
    };
    let value: Value = serde_json::from_str(&raw).map_err(|err| {
        SecretsError::Config(format!("{} is not valid JSON: {err}", path.display()))
    })?;
    validate_auth_store(&value, path)?;
    Ok(Some(value))
}

fn validate_auth_store(value: &Value, path: &Path) -> Result<()> {
    if value.get("version").and_then(Value::as_u64) != Some(1) {
        return Err(SecretsError::Config(format!(
            "{} has an unsupported version",
            path.display()
        )));
    }
    let Some(profiles) = value.get("profiles").and_then(Value::as_object) else {
        return Err(SecretsError::Config(format!(
            "{} lacks a profiles mapping",
            path.display()
        )));
    };
    for id in profiles.keys() {
        if !is_valid_profile_id(id) {
            return Err(SecretsError::Config(format!(
                "{} has an invalid profile id '{id}'",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Fresh, empty auth-profile store document.
pub fn empty_auth_store() -> Value {
    serde_json::json!({"version": 1, "profiles": {}})
}

/// Load the legacy flat auth store; `None` when absent.
pub fn load_legacy_auth(env: &GatewayEnv) -> Result<Option<Value>> {
    let raw = match fs::read_to_string(&env.legacy_auth_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(SecretsError::Config(format!(
                "cannot read {}: {err}",
                env.legacy_auth_path.display()
            )));
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value @ Value::Object(_)) => Ok(Some(value)),
        Ok(_) | Err(_) => {
            warn!(path = %env.legacy_auth_path.display(), "legacy auth store is malformed; ignoring");
            Ok(None)
        }
    }
}

/// One line of a `.env` file, kept verbatim for rewrite fidelity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLine {
    pub raw: String,
    pub key: Option<String>,
    pub value: Option<String>,
}

/// Parse `.env` content, preserving comments and blank lines. Values are
/// unquoted shell-style (matching single or double quotes stripped).
pub fn parse_env_file(contents: &str) -> Vec<EnvLine> {
    contents
        .lines()
        .map(|raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return EnvLine {
                    raw: raw.to_string(),
                    key: None,
                    value: None,
                };
            }
            let assignment = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            match assignment.split_once('=') {
                Some((key, value)) => EnvLine {
                    raw: raw.to_string(),
                    key: Some(key.trim().to_string()),
                    value: Some(unquote(value.trim()).to_string()),
                },
                None => EnvLine {
                    raw: raw.to_string(),
                    key: None,
                    value: None,
                },
            }
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Read the `.env` file next to the main configuration; `None` when absent.
pub fn load_env_file(env: &GatewayEnv) -> Result<Option<Vec<EnvLine>>> {
    match fs::read_to_string(&env.env_file) {
        Ok(contents) => Ok(Some(parse_env_file(&contents))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SecretsError::Config(format!(
            "cannot read {}: {err}",
            env.env_file.display()
        ))),
    }
}

/// Render `.env` lines back to file content.
pub fn render_env_file(lines: &[EnvLine]) -> String {
    let mut out = lines
        .iter()
        .map(|line| line.raw.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}
