use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SecretsError};

/// Where a secret reference is resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    Env,
    File,
    Exec,
}

impl SecretSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretSource::Env => "env",
            SecretSource::File => "file",
            SecretSource::Exec => "exec",
        }
    }
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical secret reference: `{source, provider, id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub source: SecretSource,
    pub provider: String,
    pub id: String,
}

impl SecretRef {
    /// Cache/batch key: `source:provider:id`.
    pub fn ref_key(&self) -> String {
        format!("{}:{}:{}", self.source, self.provider, self.id)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_provider_alias(&self.provider) {
            return Err(SecretsError::RefShape(format!(
                "provider alias '{}' is invalid (want lowercase alnum/_/-, max 64)",
                self.provider
            )));
        }
        let ok = match self.source {
            SecretSource::Env => is_valid_env_id(&self.id),
            SecretSource::File => is_valid_json_pointer(&self.id),
            SecretSource::Exec => is_valid_exec_id(&self.id),
        };
        if !ok {
            return Err(SecretsError::RefShape(format!(
                "id '{}' is invalid for source {}",
                self.id, self.source
            )));
        }
        Ok(())
    }
}

/// Per-source provider aliases used when a ref omits its provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
}

impl SecretDefaults {
    pub fn provider_for(&self, source: SecretSource) -> Option<&str> {
        match source {
            SecretSource::Env => self.env.as_deref(),
            SecretSource::File => self.file.as_deref(),
            SecretSource::Exec => self.exec.as_deref(),
        }
    }
}

/// `^[a-z][a-z0-9_-]{0,63}$`, checked without a regex engine.
pub fn is_valid_provider_alias(alias: &str) -> bool {
    let mut bytes = alias.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    alias.len() <= 64
        && first.is_ascii_lowercase()
        && bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// `^[A-Z][A-Z0-9_]{0,127}$`.
pub fn is_valid_env_id(id: &str) -> bool {
    let mut bytes = id.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    id.len() <= 128
        && first.is_ascii_uppercase()
        && bytes.all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Absolute RFC 6901 JSON pointer: begins with `/`, `~` only as `~0`/`~1`.
pub fn is_valid_json_pointer(id: &str) -> bool {
    if !id.starts_with('/') {
        return false;
    }
    let mut bytes = id.bytes().peekable();
    while let Some(b) = bytes.next() {
        if b == b'~' {
            match bytes.next() {
                Some(b'0') | Some(b'1') => {}
                _ => return false,
            }
        }
    }
    true
}

/// `^[A-Za-z0-9][A-Za-z0-9._:/-]{0,255}$`.
pub fn is_valid_exec_id(id: &str) -> bool {
    let mut bytes = id.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    id.len() <= 256
        && first.is_ascii_alphanumeric()
        && bytes.all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'/' | b'-')
        })
}

/// Interpret a config value as a secret ref if it has the ref shape.
///
/// The value must be a mapping with a recognized `source`, a string `id`,
/// and optionally a `provider` (filled from `defaults` when missing). Extra
/// keys or failed validation mean the value is not a ref.
pub fn coerce_secret_ref(value: &Value, defaults: &SecretDefaults) -> Option<SecretRef> {
    let map = value.as_object()?;
    if map.keys().any(|k| k != "source" && k != "provider" && k != "id") {
        return None;
    }
    let source: SecretSource = serde_json::from_value(map.get("source")?.clone()).ok()?;
    let id = map.get("id")?.as_str()?.to_string();
    let provider = match map.get("provider") {
        Some(Value::String(alias)) => alias.clone(),
        Some(_) => return None,
        None => defaults.provider_for(source)?.to_string(),
    };
    let reference = SecretRef {
        source,
        provider,
        id,
    };
    reference.validate().ok()?;
    Some(reference)
}

/// Outcome of reading a secret-bearing slot together with its sibling ref.
#[derive(Debug, Clone, Default)]
pub struct SecretInput {
    /// Ref taken from the sibling `*Ref` path, when present and valid.
    pub explicit: Option<SecretRef>,
    /// The ref that should drive resolution, explicit or inline.
    pub effective: Option<SecretRef>,
}

/// Compute `(explicit, effective)` for a target slot.
///
/// A sibling ref wins over anything stored at the value path; otherwise an
/// inline ref object at the value path is used; plaintext yields no ref.
pub fn resolve_secret_input(
    value: Option<&Value>,
    ref_value: Option<&Value>,
    defaults: &SecretDefaults,
) -> SecretInput {
    if let Some(raw) = ref_value {
        if let Some(reference) = coerce_secret_ref(raw, defaults) {
            return SecretInput {
                explicit: Some(reference.clone()),
                effective: Some(reference),
            };
        }
    }
    if let Some(raw) = value {
        if let Some(reference) = coerce_secret_ref(raw, defaults) {
            return SecretInput {
                explicit: None,
                effective: Some(reference),
            };
        }
    }
    SecretInput::default()
}

/// True when the slot holds a usable secret input: a non-empty plaintext
/// string or a valid ref.
pub fn has_configured_secret_input(value: Option<&Value>, defaults: &SecretDefaults) -> bool {
    match value {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(other) => coerce_secret_ref(other, defaults).is_some(),
        None => false,
    }
}
