use serde_json::Value;

use crate::path::get_path;
use crate::reference::{SecretDefaults, has_configured_secret_input};
use crate::registry::CompiledTarget;

/// Whether a discovered target is live at runtime, and why not when it
/// isn't. Refs on inactive surfaces are skipped with a diagnostic instead of
/// being resolved.
#[derive(Debug, Clone)]
pub struct SurfaceDecision {
    pub active: bool,
    pub reason: String,
}

impl SurfaceDecision {
    fn active() -> Self {
        Self {
            active: true,
            reason: String::new(),
        }
    }

    fn inactive(reason: impl Into<String>) -> Self {
        Self {
            active: false,
            reason: reason.into(),
        }
    }
}

/// Evaluate the activeness of one discovered target against the source
/// configuration. Auth-profile store targets are always active.
pub fn surface_decision(
    root: &Value,
    target: &CompiledTarget,
    segments: &[String],
    defaults: &SecretDefaults,
) -> SurfaceDecision {
    match target.id() {
        "models.providers.apiKey" => entry_enabled(root, &segments[..3], "model provider"),
        "skills.apiKey" => entry_enabled(root, &segments[..2], "skill"),
        "talk.apiKey" => entry_enabled(root, &segments[..1], "talk"),
        "tools.webSearch.apiKey" => entry_enabled(root, &segments[..2], "web search"),
        "tools.webSearch.providers.apiKey" => web_search_child(root, segments),
        "gateway.auth.password" => gateway_auth_password(root),
        "gateway.remote.token" | "gateway.remote.password" => gateway_remote(root, defaults),
        "agents.defaults.memorySearch.remote.apiKey" => memory_search_defaults(root, defaults),
        "agents.memorySearch.remote.apiKey" => agent_entry_enabled(root, segments),
        id if id.starts_with("channels.") => channel_surface(root, target, segments),
        _ => SurfaceDecision::active(),
    }
}

/// `enabled: false` disables the entry; anything else leaves it on.
fn flag_enabled(node: Option<&Value>) -> bool {
    !matches!(node.and_then(|n| n.get("enabled")), Some(Value::Bool(false)))
}

fn entry_enabled(root: &Value, entry_segments: &[String], what: &str) -> SurfaceDecision {
    let entry = get_path(root, entry_segments);
    if flag_enabled(entry) {
        SurfaceDecision::active()
    } else {
        SurfaceDecision::inactive(format!(
            "{what} '{}' is disabled",
            entry_segments.last().map(String::as_str).unwrap_or("")
        ))
    }
}

fn web_search_child(root: &Value, segments: &[String]) -> SurfaceDecision {
    let parent = get_path(root, &segments[..2]);
    if !flag_enabled(parent) {
        return SurfaceDecision::inactive("web search is disabled");
    }
    // Child providers inherit the parent flag; an explicit false wins.
    let child = get_path(root, &segments[..3]);
    if flag_enabled(child) {
        SurfaceDecision::active()
    } else {
        SurfaceDecision::inactive(format!("web search provider '{}' is disabled", segments[2]))
    }
}

fn gateway_auth_password(root: &Value) -> SurfaceDecision {
    let mode = root
        .pointer("/gateway/auth/mode")
        .and_then(Value::as_str)
        .unwrap_or("");
    if mode == "password" {
        SurfaceDecision::active()
    } else {
        SurfaceDecision::inactive("gateway auth mode is not \"password\"")
    }
}

fn gateway_remote(root: &Value, defaults: &SecretDefaults) -> SurfaceDecision {
    let remote = root.pointer("/gateway/remote");
    let enabled = remote
        .and_then(|r| r.get("enabled"))
        .and_then(Value::as_bool)
        == Some(true);
    let mode_configured = remote
        .and_then(|r| r.get("mode"))
        .and_then(Value::as_str)
        .is_some_and(|m| !m.is_empty());
    if !enabled && !mode_configured {
        return SurfaceDecision::inactive("gateway remote mode is not enabled");
    }
    let local_mode = root
        .pointer("/gateway/auth/mode")
        .and_then(Value::as_str)
        .unwrap_or("");
    let local_secret = root.pointer("/gateway/auth/password");
    if local_mode == "password" && has_configured_secret_input(local_secret, defaults) {
        return SurfaceDecision::inactive("a local gateway auth secret takes effect");
    }
    SurfaceDecision::active()
}

fn memory_search_defaults(root: &Value, defaults: &SecretDefaults) -> SurfaceDecision {
    let Some(Value::Array(agents)) = root.pointer("/agents/list") else {
        return SurfaceDecision::active();
    };
    let enabled: Vec<&Value> = agents.iter().filter(|a| flag_enabled(Some(*a))).collect();
    if enabled.is_empty() {
        return SurfaceDecision::active();
    }
    let all_override = enabled.iter().all(|agent| {
        has_configured_secret_input(agent.pointer("/memorySearch/remote/apiKey"), defaults)
    });
    if all_override {
        SurfaceDecision::inactive("every enabled agent overrides memorySearch.remote.apiKey")
    } else {
        SurfaceDecision::active()
    }
}

fn agent_entry_enabled(root: &Value, segments: &[String]) -> SurfaceDecision {
    let agent = get_path(root, &segments[..3]);
    if flag_enabled(agent) {
        SurfaceDecision::active()
    } else {
        let id = agent
            .and_then(|a| a.get("id"))
            .and_then(Value::as_str)
            .unwrap_or(&segments[2]);
        SurfaceDecision::inactive(format!("agent '{id}' is disabled"))
    }
}

/// The shared channel account-inheritance model plus per-channel gates.
fn channel_surface(root: &Value, target: &CompiledTarget, segments: &[String]) -> SurfaceDecision {
    let channel_name = &segments[1];
    let Some(channel) = get_path(root, &segments[..2]) else {
        return SurfaceDecision::active();
    };
    if !flag_enabled(Some(channel)) {
        return SurfaceDecision::inactive(format!("channel {channel_name} is disabled"));
    }

    let is_account = target.spec.account_id_segment.is_some();
    let (account, field_rel): (Option<&Value>, &[String]) = if is_account {
        (get_path(channel, &segments[2..4]), &segments[4..])
    } else {
        (None, &segments[2..])
    };

    if is_account {
        let account_id = &segments[3];
        let Some(account) = account else {
            return SurfaceDecision::active();
        };
        if !flag_enabled(Some(account)) {
            return SurfaceDecision::inactive(format!(
                "account {account_id} on channel {channel_name} is disabled"
            ));
        }
        return channel_field_gate(channel_name, channel, Some(account), field_rel);
    }

    // Top-level field: with a non-empty accounts mapping the field is only
    // live when some enabled account inherits it.
    if let Some(Value::Object(accounts)) = channel.get("accounts") {
        if !accounts.is_empty() {
            let inherited = accounts.values().any(|account| {
                flag_enabled(Some(account)) && get_path(account, field_rel).is_none()
            });
            if !inherited {
                return SurfaceDecision::inactive(format!(
                    "no enabled account on channel {channel_name} inherits {}",
                    field_rel.join(".")
                ));
            }
        }
    }
    channel_field_gate(channel_name, channel, None, field_rel)
}

/// Per-channel, per-field extra gates. `account` is the owning account for
/// account-level fields; account settings fall back to the channel.
fn channel_field_gate(
    channel_name: &str,
    channel: &Value,
    account: Option<&Value>,
    field_rel: &[String],
) -> SurfaceDecision {
    let field = field_rel.join(".");
    let setting = |key: &str| -> Option<&Value> {
        account
            .and_then(|a| a.get(key))
            .or_else(|| channel.get(key))
    };
    match (channel_name, field.as_str()) {
        ("telegram", "botToken") => {
            let token_file = setting("tokenFile").and_then(Value::as_str).unwrap_or("");
            if token_file.is_empty() {
                SurfaceDecision::active()
            } else {
                SurfaceDecision::inactive("a tokenFile is configured")
            }
        }
        ("telegram", "webhookSecret") => {
            let url = setting("webhookUrl").and_then(Value::as_str).unwrap_or("");
            if url.is_empty() {
                SurfaceDecision::inactive("no webhookUrl is configured")
            } else {
                SurfaceDecision::active()
            }
        }
        ("slack", "signingSecret") => {
            let mode = setting("mode").and_then(Value::as_str).unwrap_or("");
            if mode == "http" {
                SurfaceDecision::active()
            } else {
                SurfaceDecision::inactive("slack mode is not \"http\"")
            }
        }
        ("discord", "pluralkit.token") => {
            let pluralkit = account
                .and_then(|a| a.get("pluralkit"))
                .or_else(|| channel.get("pluralkit"));
            if flag_enabled(pluralkit) {
                SurfaceDecision::active()
            } else {
                SurfaceDecision::inactive("pluralkit is disabled")
            }
        }
        ("discord", field) if field.starts_with("voice.tts.") => {
            let voice = account
                .and_then(|a| a.get("voice"))
                .or_else(|| channel.get("voice"));
            if !flag_enabled(voice) {
                return SurfaceDecision::inactive("discord voice is disabled");
            }
            let tts_provider = field_rel[2].as_str();
            let provider = voice
                .and_then(|v| v.get("tts"))
                .and_then(|t| t.get(tts_provider));
            if flag_enabled(provider) {
                SurfaceDecision::active()
            } else {
                SurfaceDecision::inactive(format!("tts provider '{tts_provider}' is disabled"))
            }
        }
        _ => SurfaceDecision::active(),
    }
}

/// Render the canonical inactive-surface diagnostic message. The literal
/// sentinel between path and reason is matched by the CLI hydration helper.
pub fn inactive_surface_message(path: &str, reason: &str) -> String {
    format!("{path}: secret ref is configured on an inactive surface; {reason}")
}

/// Referential rules that make a configuration invalid outright (as opposed
/// to merely inactive): slack in HTTP mode must carry a signing secret.
pub fn validate_referential_rules(
    root: &Value,
    defaults: &SecretDefaults,
) -> crate::error::Result<()> {
    let Some(slack) = root.pointer("/channels/slack") else {
        return Ok(());
    };
    if !flag_enabled(Some(slack)) {
        return Ok(());
    }
    let channel_mode = slack.get("mode").and_then(Value::as_str).unwrap_or("");
    let top_secret = has_configured_secret_input(slack.get("signingSecret"), defaults);
    match slack.get("accounts").and_then(Value::as_object) {
        Some(accounts) if !accounts.is_empty() => {
            for (account_id, account) in accounts {
                if !flag_enabled(Some(account)) {
                    continue;
                }
                let mode = account
                    .get("mode")
                    .and_then(Value::as_str)
                    .unwrap_or(channel_mode);
                let own_secret =
                    has_configured_secret_input(account.get("signingSecret"), defaults);
                if mode == "http" && !own_secret && !top_secret {
                    return Err(crate::error::SecretsError::Config(format!(
                        "channels.slack.accounts.{account_id}.signingSecret is required in http mode"
                    )));
                }
            }
        }
        _ => {
            if channel_mode == "http" && !top_secret {
                return Err(crate::error::SecretsError::Config(
                    "channels.slack.signingSecret is required in http mode".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::registry;
    use serde_json::json;

    fn decide(root: &Value, target_id: &str, path: &str) -> SurfaceDecision {
        let target = registry()
            .main_targets()
            .find(|t| t.id() == target_id)
            .expect("target exists");
        let segments = crate::path::split_path(path);
        surface_decision(root, target, &segments, &SecretDefaults::default())
    }

    #[test]
    fn disabled_model_provider_is_inactive() {
        let cfg = json!({"models": {"providers": {"openai": {"enabled": false, "apiKey": "sk"}}}});
        let decision = decide(&cfg, "models.providers.apiKey", "models.providers.openai.apiKey");
        assert!(!decision.active);
        assert!(decision.reason.contains("disabled"));
    }

    #[test]
    fn channel_with_no_accounts_follows_channel_flag() {
        let on = json!({"channels": {"telegram": {"botToken": "t"}}});
        assert!(decide(&on, "channels.telegram.botToken", "channels.telegram.botToken").active);

        let off = json!({"channels": {"telegram": {"enabled": false, "botToken": "t"}}});
        assert!(!decide(&off, "channels.telegram.botToken", "channels.telegram.botToken").active);
    }

    #[test]
    fn top_level_field_inactive_when_every_enabled_account_overrides() {
        let cfg = json!({"channels": {"telegram": {
            "botToken": "top",
            "accounts": {
                "work": {"enabled": true, "botToken": "own"},
                "disabled": {"enabled": false}
            }
        }}});
        let decision = decide(&cfg, "channels.telegram.botToken", "channels.telegram.botToken");
        assert!(!decision.active);
        assert!(decision.reason.contains("inherits"));
    }

    #[test]
    fn top_level_field_active_when_an_enabled_account_inherits() {
        let cfg = json!({"channels": {"telegram": {
            "botToken": "top",
            "accounts": {"work": {"enabled": true}}
        }}});
        assert!(decide(&cfg, "channels.telegram.botToken", "channels.telegram.botToken").active);
    }

    #[test]
    fn account_field_requires_channel_and_account_enabled() {
        let cfg = json!({"channels": {"telegram": {"accounts": {
            "work": {"botToken": "t"},
            "off": {"enabled": false, "botToken": "t"}
        }}}});
        assert!(
            decide(
                &cfg,
                "channels.telegram.botToken.accounts",
                "channels.telegram.accounts.work.botToken"
            )
            .active
        );
        assert!(
            !decide(
                &cfg,
                "channels.telegram.botToken.accounts",
                "channels.telegram.accounts.off.botToken"
            )
            .active
        );
    }

    #[test]
    fn telegram_token_file_suppresses_bot_token() {
        let cfg = json!({"channels": {"telegram": {"botToken": "t", "tokenFile": "/run/tok"}}});
        let decision = decide(&cfg, "channels.telegram.botToken", "channels.telegram.botToken");
        assert!(!decision.active);
        assert!(decision.reason.contains("tokenFile"));
    }

    #[test]
    fn telegram_webhook_secret_needs_url_inherited_from_top() {
        let cfg = json!({"channels": {"telegram": {
            "webhookUrl": "https://gw.example/tg",
            "accounts": {"work": {"webhookSecret": "s"}}
        }}});
        assert!(
            decide(
                &cfg,
                "channels.telegram.webhookSecret.accounts",
                "channels.telegram.accounts.work.webhookSecret"
            )
            .active
        );

        let bare = json!({"channels": {"telegram": {"webhookSecret": "s"}}});
        assert!(
            !decide(&bare, "channels.telegram.webhookSecret", "channels.telegram.webhookSecret")
                .active
        );
    }

    #[test]
    fn slack_signing_secret_requires_http_mode() {
        let socket = json!({"channels": {"slack": {"mode": "socket", "signingSecret": "s"}}});
        assert!(
            !decide(&socket, "channels.slack.signingSecret", "channels.slack.signingSecret").active
        );

        let http = json!({"channels": {"slack": {"mode": "http", "signingSecret": "s"}}});
        assert!(
            decide(&http, "channels.slack.signingSecret", "channels.slack.signingSecret").active
        );
    }

    #[test]
    fn slack_account_inherits_channel_mode() {
        let cfg = json!({"channels": {"slack": {
            "mode": "http",
            "accounts": {"work": {"signingSecret": "s"}}
        }}});
        assert!(
            decide(
                &cfg,
                "channels.slack.signingSecret.accounts",
                "channels.slack.accounts.work.signingSecret"
            )
            .active
        );
    }

    #[test]
    fn discord_tts_key_gated_by_voice_and_provider_flags() {
        let cfg = json!({"channels": {"discord": {
            "voice": {"tts": {"elevenlabs": {"enabled": false, "apiKey": "k"}}}
        }}});
        let decision = decide(
            &cfg,
            "channels.discord.voice.tts.elevenlabs.apiKey",
            "channels.discord.voice.tts.elevenlabs.apiKey",
        );
        assert!(!decision.active);
        assert!(decision.reason.contains("elevenlabs"));

        let voice_off = json!({"channels": {"discord": {
            "voice": {"enabled": false, "tts": {"elevenlabs": {"apiKey": "k"}}}
        }}});
        assert!(
            !decide(
                &voice_off,
                "channels.discord.voice.tts.elevenlabs.apiKey",
                "channels.discord.voice.tts.elevenlabs.apiKey",
            )
            .active
        );
    }

    #[test]
    fn gateway_password_active_only_in_password_mode() {
        let cfg = json!({"gateway": {"auth": {"mode": "token", "password": "pw"}}});
        assert!(!decide(&cfg, "gateway.auth.password", "gateway.auth.password").active);

        let pw = json!({"gateway": {"auth": {"mode": "password", "password": "pw"}}});
        assert!(decide(&pw, "gateway.auth.password", "gateway.auth.password").active);
    }

    #[test]
    fn gateway_remote_suppressed_by_local_secret() {
        let cfg = json!({"gateway": {
            "auth": {"mode": "password", "password": "pw"},
            "remote": {"enabled": true, "token": "t"}
        }});
        let decision = decide(&cfg, "gateway.remote.token", "gateway.remote.token");
        assert!(!decision.active);
        assert!(decision.reason.contains("local"));

        let remote_only = json!({"gateway": {"remote": {"enabled": true, "token": "t"}}});
        assert!(decide(&remote_only, "gateway.remote.token", "gateway.remote.token").active);
    }

    #[test]
    fn memory_search_defaults_inactive_when_all_enabled_agents_override() {
        let cfg = json!({"agents": {
            "defaults": {"memorySearch": {"remote": {"apiKey": "top"}}},
            "list": [
                {"id": "main", "memorySearch": {"remote": {"apiKey": "own"}}},
                {"id": "off", "enabled": false}
            ]
        }});
        let decision = decide(
            &cfg,
            "agents.defaults.memorySearch.remote.apiKey",
            "agents.defaults.memorySearch.remote.apiKey",
        );
        assert!(!decision.active);

        let mixed = json!({"agents": {
            "defaults": {"memorySearch": {"remote": {"apiKey": "top"}}},
            "list": [{"id": "main"}]
        }});
        assert!(
            decide(
                &mixed,
                "agents.defaults.memorySearch.remote.apiKey",
                "agents.defaults.memorySearch.remote.apiKey",
            )
            .active
        );
    }

    #[test]
    fn slack_http_mode_without_signing_secret_is_invalid() {
        let defaults = SecretDefaults::default();
        let bare = json!({"channels": {"slack": {"mode": "http"}}});
        let err = validate_referential_rules(&bare, &defaults).unwrap_err();
        assert!(err.to_string().contains("channels.slack.signingSecret"));

        let ok = json!({"channels": {"slack": {"mode": "http", "signingSecret": "s"}}});
        validate_referential_rules(&ok, &defaults).expect("accepted");

        let socket = json!({"channels": {"slack": {"mode": "socket"}}});
        validate_referential_rules(&socket, &defaults).expect("non-http mode needs no secret");

        let account_inherits = json!({"channels": {"slack": {
            "mode": "http", "signingSecret": "s",
            "accounts": {"work": {}}
        }}});
        validate_referential_rules(&account_inherits, &defaults).expect("account inherits top");

        let account_bare = json!({"channels": {"slack": {
            "mode": "http",
            "accounts": {"work": {}}
        }}});
        let err = validate_referential_rules(&account_bare, &defaults).unwrap_err();
        assert!(err.to_string().contains("accounts.work.signingSecret"));
    }

    #[test]
    fn inactive_message_carries_the_sentinel() {
        let message = inactive_surface_message("channels.telegram.botToken", "reason");
        assert!(message.contains(": secret ref is configured on an inactive surface;"));
    }
}
