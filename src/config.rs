use std::env;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::error::{Result, SecretsError};

/// Flags shared by every `secrets` subcommand.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Path to the main gateway configuration file.
    #[arg(long, env = "GATEHOUSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// State directory holding agent data and the legacy auth store.
    #[arg(long, env = "GATEHOUSE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Emit machine-readable JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ReloadArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Gateway RPC base URL; when set, reload goes through the running gateway.
    #[arg(long, env = "GATEHOUSE_GATEWAY_URL")]
    pub gateway_url: Option<String>,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Exit non-zero when any finding is present, not only unresolved refs.
    #[arg(long)]
    pub check: bool,
}

#[derive(Debug, Args)]
pub struct ConfigureArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Only emit provider upserts; skip secret target migration.
    #[arg(long)]
    pub providers_only: bool,

    /// Do not synthesize default provider configuration for new refs.
    #[arg(long)]
    pub skip_provider_setup: bool,

    /// Restrict auth-profile migration to a single agent.
    #[arg(long)]
    pub agent: Option<String>,

    /// Write the generated plan to this path instead of stdout.
    #[arg(long)]
    pub plan_out: Option<PathBuf>,

    /// Apply the generated plan immediately.
    #[arg(long)]
    pub apply: bool,

    /// Skip interactive confirmation before applying.
    #[arg(long)]
    pub yes: bool,
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Plan file to apply.
    #[arg(long)]
    pub from: PathBuf,

    /// Project the plan and report changed files without writing anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Gateway RPC base URL.
    #[arg(long, env = "GATEHOUSE_GATEWAY_URL")]
    pub gateway_url: Option<String>,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Bind host for the RPC listener.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Bind port for the RPC listener.
    #[arg(long, default_value_t = 4780)]
    pub port: u16,
}

/// Secrets subcommands.
#[derive(Debug, Subcommand)]
pub enum SecretsCommand {
    /// Re-resolve all secret references and install a fresh snapshot.
    Reload(ReloadArgs),
    /// Scan configuration and on-disk stores for plaintext and broken refs.
    Audit(AuditArgs),
    /// Build (and optionally apply) a migration plan for plaintext secrets.
    Configure(ConfigureArgs),
    /// Apply a previously generated migration plan.
    Apply(ApplyArgs),
    /// Show the resolution state of the active snapshot (values redacted).
    Status(StatusArgs),
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Secret reference management.
    #[command(subcommand)]
    Secrets(SecretsCommand),
    /// Run the gateway secrets RPC listener.
    Serve(ServeArgs),
}

/// Top-level CLI structure.
#[derive(Debug, Parser)]
#[command(
    name = "gatehouse",
    version,
    about = "Secrets subsystem for a multi-channel agent gateway.",
    long_about = "Resolves {source, provider, id} secret references from the gateway \
configuration into an in-memory snapshot, audits on-disk surfaces for plaintext \
residue, and migrates plaintext into references via a validated plan."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Resolved filesystem layout the subsystem operates on.
#[derive(Debug, Clone)]
pub struct GatewayEnv {
    /// Main gateway configuration file.
    pub config_path: PathBuf,
    /// State directory (`<state_dir>/agents/<id>/agent/auth-profiles.json`).
    pub state_dir: PathBuf,
    /// `.env` file next to the main configuration.
    pub env_file: PathBuf,
    /// Legacy flat auth store, read-only except for scrubbing.
    pub legacy_auth_path: PathBuf,
}

impl GatewayEnv {
    pub fn from_args(common: &CommonArgs) -> Result<Self> {
        let state_dir = match &common.state_dir {
            Some(dir) => dir.clone(),
            None => default_state_dir()?,
        };
        let config_path = common
            .config
            .clone()
            .unwrap_or_else(|| state_dir.join("gatehouse.json"));
        let env_file = config_path
            .parent()
            .map(|dir| dir.join(".env"))
            .unwrap_or_else(|| PathBuf::from(".env"));
        let legacy_auth_path = state_dir.join("auth.json");
        Ok(Self {
            config_path,
            state_dir,
            env_file,
            legacy_auth_path,
        })
    }

    /// Directory a given agent keeps its auth-profile store in, unless the
    /// main configuration overrides it per agent.
    pub fn default_agent_dir(&self, agent_id: &str) -> PathBuf {
        self.state_dir.join("agents").join(agent_id).join("agent")
    }
}

fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var("GATEHOUSE_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = env::var("HOME")
        .map_err(|_| SecretsError::Config("HOME not set; pass --state-dir".into()))?;
    Ok(PathBuf::from(home).join(".gatehouse"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_audit_with_check() {
        let cli = CliArgs::parse_from([
            "gatehouse",
            "secrets",
            "audit",
            "--check",
            "--config",
            "/tmp/gatehouse.json",
        ]);
        match cli.command {
            Command::Secrets(SecretsCommand::Audit(args)) => {
                assert!(args.check);
                assert_eq!(
                    args.common.config.as_deref(),
                    Some(std::path::Path::new("/tmp/gatehouse.json"))
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn env_layout_derives_env_file_next_to_config() {
        let common = CommonArgs {
            config: Some(PathBuf::from("/srv/gw/gatehouse.json")),
            state_dir: Some(PathBuf::from("/srv/gw/state")),
            json: false,
        };
        let env = GatewayEnv::from_args(&common).expect("env builds");
        assert_eq!(env.env_file, PathBuf::from("/srv/gw/.env"));
        assert_eq!(env.legacy_auth_path, PathBuf::from("/srv/gw/state/auth.json"));
        assert_eq!(
            env.default_agent_dir("main"),
            PathBuf::from("/srv/gw/state/agents/main/agent")
        );
    }

    #[test]
    fn apply_requires_plan_path() {
        let err = CliArgs::try_parse_from(["gatehouse", "secrets", "apply"]);
        assert!(err.is_err());
    }
}
