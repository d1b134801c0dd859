use std::io::{self, Write};
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::apply::apply_plan;
use crate::audit::run_secrets_audit;
use crate::config::{
    ApplyArgs, AuditArgs, CliArgs, Command, ConfigureArgs, GatewayEnv, ReloadArgs, SecretsCommand,
    ServeArgs, StatusArgs,
};
use crate::configure::{ConfigureOptions, build_configure_plan, write_plan};
use crate::error::Result;
use crate::plan::{load_plan, validate_plan};
use crate::redact::redact;
use crate::reference::resolve_secret_input;
use crate::registry::registry;
use crate::resolver::prepare_from_disk;
use crate::rpc::{AppState, GatewayClient, serve};
use crate::snapshot::SnapshotActivator;

/// Dispatch a parsed command line; the returned code becomes the process
/// exit status.
pub async fn run(cli: CliArgs) -> Result<i32> {
    match cli.command {
        Command::Secrets(SecretsCommand::Reload(args)) => cmd_reload(args).await,
        Command::Secrets(SecretsCommand::Audit(args)) => cmd_audit(args).await,
        Command::Secrets(SecretsCommand::Configure(args)) => cmd_configure(args).await,
        Command::Secrets(SecretsCommand::Apply(args)) => cmd_apply(args).await,
        Command::Secrets(SecretsCommand::Status(args)) => cmd_status(args).await,
        Command::Serve(args) => cmd_serve(args).await,
    }
}

async fn cmd_reload(args: ReloadArgs) -> Result<i32> {
    let warning_count = match &args.gateway_url {
        Some(url) => {
            // The blocking HTTP client must stay off the async runtime.
            let url = url.clone();
            tokio::task::spawn_blocking(move || GatewayClient::new(url).reload())
                .await
                .map_err(|err| crate::error::SecretsError::Rpc(err.to_string()))?? as usize
        }
        None => {
            let env = GatewayEnv::from_args(&args.common)?;
            let snapshot = prepare_from_disk(&env).await?;
            snapshot.warnings.len()
        }
    };
    if args.common.json {
        println!("{}", json!({"ok": true, "warningCount": warning_count}));
    } else {
        println!("Reload succeeded ({warning_count} warnings).");
    }
    Ok(0)
}

async fn cmd_audit(args: AuditArgs) -> Result<i32> {
    let env = GatewayEnv::from_args(&args.common)?;
    let report = run_secrets_audit(&env).await?;
    if args.common.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Audit status: {:?}", report.status);
        for finding in &report.findings {
            println!(
                "- [{:?}] {} {}: {}",
                finding.code, finding.file, finding.json_path, finding.message
            );
        }
    }
    Ok(report.exit_code(args.check))
}

async fn cmd_configure(args: ConfigureArgs) -> Result<i32> {
    let env = GatewayEnv::from_args(&args.common)?;
    let config = crate::store::load_main_config(&env)?;
    let options = ConfigureOptions {
        providers_only: args.providers_only,
        skip_provider_setup: args.skip_provider_setup,
        agent: args.agent.clone(),
    };
    let plan = build_configure_plan(&env, &config, &options)?;
    validate_plan(&plan)?;

    if let Some(path) = &args.plan_out {
        write_plan(path, &plan)?;
        if !args.common.json {
            println!("Plan written to {}", path.display());
        }
    } else if !args.apply {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    }

    if !args.apply {
        return Ok(0);
    }
    if plan.targets.is_empty() && plan.provider_upserts.is_empty() {
        println!("Nothing to migrate.");
        return Ok(0);
    }
    if !args.yes && !confirm_or_cancel("apply the generated plan")? {
        return Ok(0);
    }
    let outcome = apply_plan(&env, &plan, false).await?;
    report_apply(&outcome, args.common.json)?;
    Ok(0)
}

async fn cmd_apply(args: ApplyArgs) -> Result<i32> {
    let env = GatewayEnv::from_args(&args.common)?;
    let plan = load_plan(&args.from)?;
    let outcome = apply_plan(&env, &plan, args.dry_run).await?;
    report_apply(&outcome, args.common.json)?;
    Ok(0)
}

fn report_apply(outcome: &crate::apply::ApplyOutcome, as_json: bool) -> Result<()> {
    if as_json {
        println!(
            "{}",
            json!({
                "ok": true,
                "dryRun": outcome.dry_run,
                "changedFiles": outcome
                    .changed_files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>(),
                "warnings": outcome.warnings,
            })
        );
        return Ok(());
    }
    if outcome.dry_run {
        println!("Dry run: {} file(s) would change.", outcome.changed_files.len());
    } else {
        println!("Applied: {} file(s) changed.", outcome.changed_files.len());
    }
    for path in &outcome.changed_files {
        println!("- {}", path.display());
    }
    for warning in &outcome.warnings {
        println!("warning: {warning}");
    }
    Ok(())
}

async fn cmd_status(args: StatusArgs) -> Result<i32> {
    let env = GatewayEnv::from_args(&args.common)?;
    let snapshot = prepare_from_disk(&env).await?;
    let defaults = crate::providers::SecretsSettings::from_config(&snapshot.source_config)
        .map(|settings| settings.defaults)
        .unwrap_or_default();

    let mut entries = Vec::new();
    for found in registry().discover_config_targets(&snapshot.source_config, None) {
        let input = resolve_secret_input(found.value.as_ref(), found.ref_value.as_ref(), &defaults);
        let Some(reference) = input.effective else {
            continue;
        };
        let resolved = crate::path::get_path(&snapshot.resolved_config, &found.path_segments);
        let preview = resolved
            .and_then(|value| value.as_str())
            .map(redact)
            .unwrap_or_else(|| "…".to_string());
        entries.push(json!({
            "path": found.path,
            "ref": reference.ref_key(),
            "value": preview,
        }));
    }

    if args.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "entries": entries,
                "warnings": snapshot.warnings,
            }))?
        );
    } else {
        println!("{} secret ref(s) configured.", entries.len());
        for entry in &entries {
            println!(
                "- {} <- {} ({})",
                entry["path"].as_str().unwrap_or(""),
                entry["ref"].as_str().unwrap_or(""),
                entry["value"].as_str().unwrap_or("")
            );
        }
        for warning in &snapshot.warnings {
            println!("warning [{}]: {}", warning.code, warning.message);
        }
    }
    Ok(0)
}

async fn cmd_serve(args: ServeArgs) -> Result<i32> {
    let env = GatewayEnv::from_args(&args.common)?;
    let activator = Arc::new(SnapshotActivator::new());
    // Startup activation failure aborts the gateway before it binds.
    let warning_count = activator.startup(&env).await?;
    info!(warnings = warning_count, "startup activation complete");
    serve(
        AppState {
            env,
            activator,
        },
        &args.host,
        args.port,
    )
    .await?;
    Ok(0)
}

fn confirm_or_cancel(action: &str) -> Result<bool> {
    print!("Confirm {}? [y/N]: ", action);
    io::stdout().flush()?;
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    let response = buf.trim().to_ascii_lowercase();
    if response == "y" || response == "yes" {
        Ok(true)
    } else {
        println!("Skipping {}.", action);
        Ok(false)
    }
}
