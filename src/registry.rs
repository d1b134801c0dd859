use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use serde_json::Value;

use crate::error::{Result, SecretsError};
use crate::path::{
    PathToken, dynamic_token_count, expand, join_path, match_segments, materialize, parse_pattern,
};

/// Which on-disk document a target lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFile {
    Main,
    AuthProfile,
}

/// How the secret is stored at the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretShape {
    /// The path itself holds either plaintext or an inline ref object.
    SecretInput,
    /// Plaintext lives at the path, the ref at a sibling `*Ref` path.
    SiblingRef,
}

/// Shape a resolved value must have after provider resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedValue {
    String,
    StringOrObject,
}

impl ExpectedValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpectedValue::String => "string",
            ExpectedValue::StringOrObject => "string-or-object",
        }
    }

    /// Post-resolution shape check: non-empty string, or a mapping when
    /// objects are allowed.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::String(s)) => !s.is_empty(),
            (ExpectedValue::StringOrObject, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// Declarative description of one secret-bearing location.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub id: &'static str,
    pub target_type: &'static str,
    pub aliases: &'static [&'static str],
    pub config_file: ConfigFile,
    pub path_pattern: &'static str,
    pub ref_path_pattern: Option<&'static str>,
    pub shape: SecretShape,
    pub expected: ExpectedValue,
    /// Index into the concrete path segments holding the provider id.
    pub provider_id_segment: Option<usize>,
    /// Index into the concrete path segments holding the account id.
    pub account_id_segment: Option<usize>,
    /// Profile `type` this target applies to (auth-profile targets only).
    pub auth_profile_type: Option<&'static str>,
    pub include_in_plan: bool,
    pub include_in_configure: bool,
    pub include_in_audit: bool,
    pub track_provider_shadowing: bool,
}

impl TargetSpec {
    const fn main(id: &'static str, target_type: &'static str, pattern: &'static str) -> Self {
        Self {
            id,
            target_type,
            aliases: &[],
            config_file: ConfigFile::Main,
            path_pattern: pattern,
            ref_path_pattern: None,
            shape: SecretShape::SecretInput,
            expected: ExpectedValue::String,
            provider_id_segment: None,
            account_id_segment: None,
            auth_profile_type: None,
            include_in_plan: true,
            include_in_configure: true,
            include_in_audit: true,
            track_provider_shadowing: false,
        }
    }
}

/// A registry entry with its patterns compiled to tokens.
#[derive(Debug)]
pub struct CompiledTarget {
    pub spec: TargetSpec,
    pub tokens: Vec<PathToken>,
    pub ref_tokens: Option<Vec<PathToken>>,
}

impl CompiledTarget {
    pub fn id(&self) -> &'static str {
        self.spec.id
    }
}

/// The complete catalog of secret-bearing locations.
#[derive(Debug)]
pub struct TargetRegistry {
    targets: Vec<CompiledTarget>,
    by_type: HashMap<&'static str, usize>,
    main_by_id: HashMap<&'static str, usize>,
    auth_by_id: HashMap<&'static str, usize>,
}

/// A concrete location found by expanding a registry pattern over a tree.
#[derive(Debug, Clone)]
pub struct DiscoveredTarget<'r> {
    pub target: &'r CompiledTarget,
    pub path: String,
    pub path_segments: Vec<String>,
    pub ref_path: Option<String>,
    pub ref_path_segments: Option<Vec<String>>,
    pub captures: Vec<String>,
    pub value: Option<Value>,
    pub ref_value: Option<Value>,
    pub provider_id: Option<String>,
    pub account_id: Option<String>,
    pub profile_id: Option<String>,
}

/// Query used to resolve a plan target against the registry.
#[derive(Debug, Clone)]
pub struct PlanTargetQuery<'a> {
    pub target_type: &'a str,
    pub path_segments: &'a [String],
    pub provider_id: Option<&'a str>,
    pub account_id: Option<&'a str>,
}

/// Successful plan-target resolution.
#[derive(Debug)]
pub struct ResolvedPlanTarget<'r> {
    pub target: &'r CompiledTarget,
    pub ref_path_segments: Option<Vec<String>>,
    pub provider_id: Option<String>,
    pub account_id: Option<String>,
}

impl TargetRegistry {
    /// Compile a catalog, checking the structural invariants: patterns must
    /// parse, sibling-ref entries need a ref pattern with the same dynamic
    /// token count, and ids/types must be unique per scope.
    pub fn compile(specs: Vec<TargetSpec>) -> Result<Self> {
        let mut targets = Vec::with_capacity(specs.len());
        let mut by_type = HashMap::new();
        let mut main_by_id = HashMap::new();
        let mut auth_by_id = HashMap::new();

        for spec in specs {
            let tokens = parse_pattern(spec.path_pattern);
            if tokens.is_empty() {
                return Err(SecretsError::Config(format!(
                    "target {} has an empty path pattern",
                    spec.id
                )));
            }
            let ref_tokens = spec.ref_path_pattern.map(parse_pattern);
            match (spec.shape, &ref_tokens) {
                (SecretShape::SiblingRef, None) => {
                    return Err(SecretsError::Config(format!(
                        "sibling-ref target {} lacks a ref path pattern",
                        spec.id
                    )));
                }
                (_, Some(ref_tokens))
                    if dynamic_token_count(ref_tokens) != dynamic_token_count(&tokens) =>
                {
                    return Err(SecretsError::Config(format!(
                        "target {} ref pattern dynamic token count mismatch",
                        spec.id
                    )));
                }
                _ => {}
            }

            let index = targets.len();
            for name in std::iter::once(spec.target_type).chain(spec.aliases.iter().copied()) {
                if by_type.insert(name, index).is_some() {
                    return Err(SecretsError::Config(format!(
                        "duplicate target type '{name}'"
                    )));
                }
            }
            let id_index = match spec.config_file {
                ConfigFile::Main => &mut main_by_id,
                ConfigFile::AuthProfile => &mut auth_by_id,
            };
            if id_index.insert(spec.id, index).is_some() {
                return Err(SecretsError::Config(format!(
                    "duplicate target id '{}'",
                    spec.id
                )));
            }

            targets.push(CompiledTarget {
                spec,
                tokens,
                ref_tokens,
            });
        }

        Ok(Self {
            targets,
            by_type,
            main_by_id,
            auth_by_id,
        })
    }

    pub fn is_known_secret_target_type(&self, target_type: &str) -> bool {
        self.by_type.contains_key(target_type)
    }

    pub fn is_known_secret_target_id(&self, id: &str) -> bool {
        self.main_by_id.contains_key(id) || self.auth_by_id.contains_key(id)
    }

    pub fn entry_for_type(&self, target_type: &str) -> Option<&CompiledTarget> {
        self.by_type.get(target_type).map(|&i| &self.targets[i])
    }

    pub fn main_entry(&self, id: &str) -> Option<&CompiledTarget> {
        self.main_by_id.get(id).map(|&i| &self.targets[i])
    }

    pub fn targets(&self) -> impl Iterator<Item = &CompiledTarget> {
        self.targets.iter()
    }

    pub fn main_targets(&self) -> impl Iterator<Item = &CompiledTarget> {
        self.targets
            .iter()
            .filter(|t| t.spec.config_file == ConfigFile::Main)
    }

    pub fn auth_profile_targets(&self) -> impl Iterator<Item = &CompiledTarget> {
        self.targets
            .iter()
            .filter(|t| t.spec.config_file == ConfigFile::AuthProfile)
    }

    /// Resolve a plan target's `(type, path)` pair to a registry entry,
    /// materializing the sibling ref path and extracting provider/account
    /// segments. Returns `None` when the path does not belong to the type or
    /// an extracted segment contradicts a caller-supplied value.
    pub fn resolve_plan_target<'r>(
        &'r self,
        query: &PlanTargetQuery<'_>,
    ) -> Option<ResolvedPlanTarget<'r>> {
        let target = self.entry_for_type(query.target_type)?;
        let captures = match_segments(&target.tokens, query.path_segments)?;
        let provider_id = extract_segment(target.spec.provider_id_segment, query.path_segments);
        let account_id = extract_segment(target.spec.account_id_segment, query.path_segments);
        if let (Some(supplied), Some(extracted)) = (query.provider_id, provider_id.as_deref()) {
            if supplied != extracted {
                return None;
            }
        }
        if let (Some(supplied), Some(extracted)) = (query.account_id, account_id.as_deref()) {
            if supplied != extracted {
                return None;
            }
        }
        let ref_path_segments = target
            .ref_tokens
            .as_ref()
            .and_then(|tokens| materialize(tokens, &captures));
        Some(ResolvedPlanTarget {
            target,
            ref_path_segments,
            provider_id,
            account_id,
        })
    }

    /// Expand every main-config pattern over `root`, deduplicating by
    /// `(id, path)`. `filter` restricts discovery to the given target ids.
    pub fn discover_config_targets<'r>(
        &'r self,
        root: &Value,
        filter: Option<&BTreeSet<String>>,
    ) -> Vec<DiscoveredTarget<'r>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for target in self.main_targets() {
            if let Some(ids) = filter {
                if !ids.contains(target.spec.id) {
                    continue;
                }
            }
            let mut hits = expand(root, &target.tokens);
            // A sibling-ref slot whose plaintext was already scrubbed only
            // exists through its ref path.
            if let Some(ref_tokens) = &target.ref_tokens {
                for ref_hit in expand(root, ref_tokens) {
                    if let Some(segments) = materialize(&target.tokens, &ref_hit.captures) {
                        if !hits.iter().any(|h| h.segments == segments) {
                            hits.push(crate::path::PatternHit {
                                segments,
                                captures: ref_hit.captures,
                                value: Value::Null,
                            });
                        }
                    }
                }
            }
            for hit in hits {
                let path = join_path(&hit.segments);
                if !seen.insert((target.spec.id, path.clone())) {
                    continue;
                }
                let ref_path_segments = target
                    .ref_tokens
                    .as_ref()
                    .and_then(|tokens| materialize(tokens, &hit.captures));
                let ref_value = ref_path_segments
                    .as_ref()
                    .and_then(|segments| crate::path::get_path(root, segments))
                    .cloned();
                let value = match &hit.value {
                    Value::Null => None,
                    other => Some(other.clone()),
                };
                out.push(DiscoveredTarget {
                    target,
                    ref_path: ref_path_segments.as_deref().map(join_path),
                    ref_path_segments,
                    provider_id: extract_segment(target.spec.provider_id_segment, &hit.segments),
                    account_id: extract_segment(target.spec.account_id_segment, &hit.segments),
                    profile_id: None,
                    path,
                    path_segments: hit.segments,
                    captures: hit.captures,
                    value,
                    ref_value,
                });
            }
        }
        out
    }

    /// Expand auth-profile patterns over one store document. The profile id
    /// is the first capture; the profile's `provider` and `type` fields gate
    /// which targets apply.
    pub fn discover_auth_profile_targets<'r>(
        &'r self,
        store: &Value,
        filter: Option<&BTreeSet<String>>,
    ) -> Vec<DiscoveredTarget<'r>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for target in self.auth_profile_targets() {
            if let Some(ids) = filter {
                if !ids.contains(target.spec.id) {
                    continue;
                }
            }
            // Expand over the ref pattern too: a profile holding only
            // `keyRef` (plaintext already scrubbed) must still be found.
            let mut hits = expand(store, &target.tokens);
            if let Some(ref_tokens) = &target.ref_tokens {
                for ref_hit in expand(store, ref_tokens) {
                    if let Some(segments) = materialize(&target.tokens, &ref_hit.captures) {
                        if !hits.iter().any(|h| h.segments == segments) {
                            hits.push(crate::path::PatternHit {
                                segments,
                                captures: ref_hit.captures,
                                value: Value::Null,
                            });
                        }
                    }
                }
            }
            for hit in hits {
                let profile_id = hit.captures.first().cloned();
                let profile = profile_id
                    .as_ref()
                    .and_then(|id| store.get("profiles").and_then(|p| p.get(id)));
                if let (Some(expected), Some(profile)) = (target.spec.auth_profile_type, profile) {
                    if profile.get("type").and_then(Value::as_str) != Some(expected) {
                        continue;
                    }
                }
                let path = join_path(&hit.segments);
                if !seen.insert((target.spec.id, path.clone())) {
                    continue;
                }
                let ref_path_segments = target
                    .ref_tokens
                    .as_ref()
                    .and_then(|tokens| materialize(tokens, &hit.captures));
                let ref_value = ref_path_segments
                    .as_ref()
                    .and_then(|segments| crate::path::get_path(store, segments))
                    .cloned();
                let provider_id = profile
                    .and_then(|p| p.get("provider"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_ascii_lowercase());
                let value = match &hit.value {
                    Value::Null => None,
                    other => Some(other.clone()),
                };
                out.push(DiscoveredTarget {
                    target,
                    ref_path: ref_path_segments.as_deref().map(join_path),
                    ref_path_segments,
                    provider_id,
                    account_id: None,
                    profile_id,
                    path,
                    path_segments: hit.segments,
                    captures: hit.captures,
                    value,
                    ref_value,
                });
            }
        }
        out
    }
}

fn extract_segment(index: Option<usize>, segments: &[String]) -> Option<String> {
    index.and_then(|i| segments.get(i)).cloned()
}

/// The process-wide registry compiled from the builtin catalog.
pub fn registry() -> &'static TargetRegistry {
    static REGISTRY: OnceLock<TargetRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        TargetRegistry::compile(builtin_targets()).expect("builtin target catalog is valid")
    })
}

/// Every location in the main configuration and the per-agent auth-profile
/// stores where a secret may live.
pub fn builtin_targets() -> Vec<TargetSpec> {
    let mut specs = vec![
        TargetSpec {
            aliases: &["model-api-key"],
            provider_id_segment: Some(2),
            track_provider_shadowing: true,
            ..TargetSpec::main(
                "models.providers.apiKey",
                "models.provider.api-key",
                "models.providers.*.apiKey",
            )
        },
        TargetSpec::main("talk.apiKey", "talk.api-key", "talk.apiKey"),
        TargetSpec::main(
            "gateway.auth.password",
            "gateway.auth.password",
            "gateway.auth.password",
        ),
        TargetSpec::main(
            "gateway.remote.token",
            "gateway.remote.token",
            "gateway.remote.token",
        ),
        TargetSpec::main(
            "gateway.remote.password",
            "gateway.remote.password",
            "gateway.remote.password",
        ),
        TargetSpec::main(
            "tools.webSearch.apiKey",
            "tools.web-search.api-key",
            "tools.webSearch.apiKey",
        ),
        TargetSpec {
            provider_id_segment: Some(2),
            ..TargetSpec::main(
                "tools.webSearch.providers.apiKey",
                "tools.web-search.provider.api-key",
                "tools.webSearch.*.apiKey",
            )
        },
        TargetSpec::main(
            "skills.apiKey",
            "skill.api-key",
            "skills.*.apiKey",
        ),
        TargetSpec::main(
            "agents.defaults.memorySearch.remote.apiKey",
            "agents.defaults.memory-search.api-key",
            "agents.defaults.memorySearch.remote.apiKey",
        ),
        TargetSpec::main(
            "agents.memorySearch.remote.apiKey",
            "agents.agent.memory-search.api-key",
            "agents.list[].memorySearch.remote.apiKey",
        ),
    ];

    // Channel surfaces: each exists at the channel top level and once per
    // account; the account id is always the segment after `accounts`.
    for (channel, field, id, target_type) in [
        (
            "telegram",
            "botToken",
            "channels.telegram.botToken",
            "channel.telegram.bot-token",
        ),
        (
            "telegram",
            "webhookSecret",
            "channels.telegram.webhookSecret",
            "channel.telegram.webhook-secret",
        ),
        (
            "slack",
            "botToken",
            "channels.slack.botToken",
            "channel.slack.bot-token",
        ),
        (
            "slack",
            "appToken",
            "channels.slack.appToken",
            "channel.slack.app-token",
        ),
        (
            "slack",
            "signingSecret",
            "channels.slack.signingSecret",
            "channel.slack.signing-secret",
        ),
        (
            "discord",
            "botToken",
            "channels.discord.botToken",
            "channel.discord.bot-token",
        ),
        (
            "discord",
            "pluralkit.token",
            "channels.discord.pluralkit.token",
            "channel.discord.pluralkit-token",
        ),
        (
            "discord",
            "voice.tts.elevenlabs.apiKey",
            "channels.discord.voice.tts.elevenlabs.apiKey",
            "channel.discord.tts-elevenlabs-api-key",
        ),
        (
            "discord",
            "voice.tts.openai.apiKey",
            "channels.discord.voice.tts.openai.apiKey",
            "channel.discord.tts-openai-api-key",
        ),
        (
            "tlon",
            "shipCode",
            "channels.tlon.shipCode",
            "channel.tlon.ship-code",
        ),
    ] {
        specs.push(TargetSpec::main(
            id,
            target_type,
            leak(format!("channels.{channel}.{field}")),
        ));
        specs.push(TargetSpec {
            account_id_segment: Some(3),
            ..TargetSpec::main(
                leak(format!("{id}.accounts")),
                leak(format!("{target_type}.account")),
                leak(format!("channels.{channel}.accounts.*.{field}")),
            )
        });
    }

    // Google Chat service accounts use the sibling-ref shape and may resolve
    // to a JSON object.
    specs.push(TargetSpec {
        ref_path_pattern: Some("channels.googlechat.serviceAccountRef"),
        shape: SecretShape::SiblingRef,
        expected: ExpectedValue::StringOrObject,
        ..TargetSpec::main(
            "channels.googlechat.serviceAccount",
            "channel.googlechat.service-account",
            "channels.googlechat.serviceAccount",
        )
    });
    specs.push(TargetSpec {
        ref_path_pattern: Some("channels.googlechat.accounts.*.serviceAccountRef"),
        shape: SecretShape::SiblingRef,
        expected: ExpectedValue::StringOrObject,
        account_id_segment: Some(3),
        ..TargetSpec::main(
            "channels.googlechat.serviceAccount.accounts",
            "channel.googlechat.service-account.account",
            "channels.googlechat.accounts.*.serviceAccount",
        )
    });

    // Per-agent auth-profile stores.
    specs.push(TargetSpec {
        aliases: &["auth-profile-api-key"],
        config_file: ConfigFile::AuthProfile,
        ref_path_pattern: Some("profiles.*.keyRef"),
        shape: SecretShape::SiblingRef,
        auth_profile_type: Some("api_key"),
        track_provider_shadowing: true,
        ..TargetSpec::main(
            "auth-profiles.api_key.key",
            "auth-profiles.api_key.key",
            "profiles.*.key",
        )
    });
    specs.push(TargetSpec {
        aliases: &["auth-profile-token"],
        config_file: ConfigFile::AuthProfile,
        ref_path_pattern: Some("profiles.*.tokenRef"),
        shape: SecretShape::SiblingRef,
        auth_profile_type: Some("token"),
        track_provider_shadowing: true,
        ..TargetSpec::main(
            "auth-profiles.token.token",
            "auth-profiles.token.token",
            "profiles.*.token",
        )
    });

    specs
}

/// Catalog strings are assembled at startup once; leaking keeps the spec
/// struct `&'static` like its hand-written entries.
fn leak(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_catalog_compiles() {
        let registry = registry();
        assert!(registry.is_known_secret_target_type("models.provider.api-key"));
        assert!(registry.is_known_secret_target_type("model-api-key"));
        assert!(registry.is_known_secret_target_id("talk.apiKey"));
        assert!(registry.is_known_secret_target_id("auth-profiles.api_key.key"));
        assert!(!registry.is_known_secret_target_type("nope"));
    }

    #[test]
    fn discovers_wildcard_provider_targets() {
        let cfg = json!({
            "models": {"providers": {
                "openai": {"apiKey": "sk-1"},
                "anthropic": {"apiKey": {"source": "env", "provider": "default", "id": "A_KEY"}}
            }}
        });
        let found = registry().discover_config_targets(&cfg, None);
        let providers: Vec<_> = found
            .iter()
            .filter(|t| t.target.id() == "models.providers.apiKey")
            .map(|t| t.provider_id.clone().unwrap())
            .collect();
        assert_eq!(providers.len(), 2);
        assert!(providers.contains(&"openai".to_string()));
        assert!(providers.contains(&"anthropic".to_string()));
    }

    #[test]
    fn discovery_filter_restricts_ids() {
        let cfg = json!({
            "talk": {"apiKey": "sk"},
            "gateway": {"auth": {"password": "pw"}}
        });
        let only_talk: BTreeSet<String> = ["talk.apiKey".to_string()].into();
        let found = registry().discover_config_targets(&cfg, Some(&only_talk));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "talk.apiKey");
    }

    #[test]
    fn resolves_plan_target_with_provider_extraction() {
        let segments: Vec<String> = ["models", "providers", "openai", "apiKey"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let resolved = registry()
            .resolve_plan_target(&PlanTargetQuery {
                target_type: "models.provider.api-key",
                path_segments: &segments,
                provider_id: Some("openai"),
                account_id: None,
            })
            .expect("resolves");
        assert_eq!(resolved.provider_id.as_deref(), Some("openai"));

        assert!(
            registry()
                .resolve_plan_target(&PlanTargetQuery {
                    target_type: "models.provider.api-key",
                    path_segments: &segments,
                    provider_id: Some("anthropic"),
                    account_id: None,
                })
                .is_none(),
            "supplied provider contradicting the path must not resolve"
        );
    }

    #[test]
    fn sibling_ref_target_materializes_ref_path() {
        let store = json!({
            "version": 1,
            "profiles": {
                "openai:default": {"type": "api_key", "provider": "OpenAI", "key": "sk-old"}
            }
        });
        let found = registry().discover_auth_profile_targets(&store, None);
        assert_eq!(found.len(), 1);
        let hit = &found[0];
        assert_eq!(hit.path, "profiles.openai:default.key");
        assert_eq!(hit.ref_path.as_deref(), Some("profiles.openai:default.keyRef"));
        assert_eq!(hit.provider_id.as_deref(), Some("openai"));
        assert_eq!(hit.profile_id.as_deref(), Some("openai:default"));
    }

    #[test]
    fn ref_only_sibling_target_is_discovered_in_main_config() {
        let cfg = json!({
            "channels": {"googlechat": {
                "serviceAccountRef": {"source": "env", "provider": "default", "id": "GC_SA"}
            }}
        });
        let found = registry().discover_config_targets(&cfg, None);
        let hit = found
            .iter()
            .find(|t| t.target.id() == "channels.googlechat.serviceAccount")
            .expect("discovered via ref path");
        assert!(hit.value.is_none());
        assert!(hit.ref_value.is_some());
        assert_eq!(hit.path, "channels.googlechat.serviceAccount");
    }

    #[test]
    fn ref_only_profile_is_discovered() {
        let store = json!({
            "version": 1,
            "profiles": {
                "anthropic:default": {
                    "type": "api_key",
                    "provider": "anthropic",
                    "keyRef": {"source": "env", "provider": "default", "id": "ANTHROPIC_API_KEY"}
                }
            }
        });
        let found = registry().discover_auth_profile_targets(&store, None);
        assert_eq!(found.len(), 1);
        assert!(found[0].value.is_none());
        assert!(found[0].ref_value.is_some());
    }

    #[test]
    fn token_profile_does_not_match_api_key_target() {
        let store = json!({
            "version": 1,
            "profiles": {
                "gh": {"type": "token", "provider": "github", "token": "ghp_x", "key": "stray"}
            }
        });
        let found = registry().discover_auth_profile_targets(&store, None);
        let ids: Vec<_> = found.iter().map(|t| t.target.id()).collect();
        assert_eq!(ids, vec!["auth-profiles.token.token"]);
    }

    #[test]
    fn account_targets_extract_account_id() {
        let cfg = json!({
            "channels": {"telegram": {"accounts": {"work": {"botToken": "t"}}}}
        });
        let found = registry().discover_config_targets(&cfg, None);
        let account = found
            .iter()
            .find(|t| t.target.id() == "channels.telegram.botToken.accounts")
            .expect("account target discovered");
        assert_eq!(account.account_id.as_deref(), Some("work"));
    }

    #[test]
    fn compile_rejects_token_count_mismatch() {
        let mut spec = TargetSpec::main("bad", "bad.type", "a.*.b");
        spec.ref_path_pattern = Some("a.bRef");
        spec.shape = SecretShape::SiblingRef;
        let err = TargetRegistry::compile(vec![spec]).unwrap_err();
        assert!(err.to_string().contains("token count mismatch"));
    }
}
