use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use drift_core::{
    cancellation, ChangeKind, ConfigValue, DesiredState, DriftConfig, EnvSecretSource, Plan,
    RandomKeySource, Reconciler, ReconciliationResult, SecretChain, TargetStateBuilder,
    WritePolicy,
};
use drift_http::{ControlPlane, HttpDatabaseEndpoints, HttpRegistryCredentials, HttpRemoteConfigClient, LivenessProbe};
use serde_json::json;
use tracing::{info, warn};

use crate::cli::{Cli, Command};

pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    if let Command::GenKey { bytes } = cli.command {
        println!("{}", RandomKeySource::new(bytes).generate().expose());
        return Ok(ExitCode::SUCCESS);
    }

    let config = DriftConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let plane = control_plane(&cli, &config)?;

    match cli.command {
        Command::Render => {
            let desired = builder(&config, plane.as_ref())?
                .build(&config.parameters())
                .await
                .context("building desired state")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&render_json(&desired))?);
            } else {
                for line in render_lines(&desired) {
                    println!("{line}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Plan => {
            let reconciler = reconciler(&config, plane)?;
            let (handle, signal) = cancellation();
            let ctrl_c = watch_ctrl_c(handle);
            let plan = reconciler
                .plan(&config.parameters(), signal)
                .await
                .context("planning")?;
            ctrl_c.abort();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&plan_json(&plan))?);
            } else {
                for line in plan_lines(&plan) {
                    println!("{line}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Apply => {
            let reconciler = reconciler(&config, plane)?;
            let (handle, signal) = cancellation();
            let ctrl_c = watch_ctrl_c(handle);
            let result = reconciler.run(&config.parameters(), signal).await;
            ctrl_c.abort();
            print_result(&result, cli.json)?;
            Ok(exit_code(&result))
        }
        Command::GenKey { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn control_plane(cli: &Cli, config: &DriftConfig) -> Result<Option<ControlPlane>> {
    let Some(url) = cli
        .control_plane_url
        .as_deref()
        .or(config.control_plane.url.as_deref())
    else {
        return Ok(None);
    };
    let var = &config.control_plane.token_env;
    let token = std::env::var(var)
        .ok()
        .filter(|t| !t.is_empty())
        .with_context(|| format!("control-plane token variable {var} is not set"))?;
    let timeout = Duration::from_secs(config.control_plane.request_timeout_secs);
    let plane = ControlPlane::new(url, ConfigValue::sensitive(token), timeout)?;
    info!(base = %plane.base(), "control plane configured");
    Ok(Some(plane))
}

fn builder(config: &DriftConfig, plane: Option<&ControlPlane>) -> Result<TargetStateBuilder> {
    let mut chain = SecretChain::new().with(EnvSecretSource::new().with_mappings(config.secret_mappings()?));
    if let Some(plane) = plane {
        chain = chain
            .with(HttpRegistryCredentials::new(plane.clone()))
            .with(HttpDatabaseEndpoints::new(plane.clone()));
    } else {
        warn!("no control plane configured, registry and database lookups use the environment only");
    }
    chain = chain.with(RandomKeySource::default());
    Ok(TargetStateBuilder::new(Arc::new(chain)))
}

fn reconciler(config: &DriftConfig, plane: Option<ControlPlane>) -> Result<Reconciler> {
    let Some(plane) = plane else {
        bail!(
            "no control-plane url: set control_plane.url or {}",
            drift_core::ControlPlaneConfig::URL_ENV
        );
    };
    let cp = &config.control_plane;
    let site = cp
        .site_url
        .as_deref()
        .context("control_plane.site_url is required to verify the target")?;
    let probe = LivenessProbe::new(site, &cp.health_path, Duration::from_secs(cp.poll_interval_secs))?;
    let builder = builder(config, Some(&plane))?;
    let client = HttpRemoteConfigClient::new(plane, config.target.name.clone(), probe);
    Ok(Reconciler::new(config.target.name.clone(), builder, Arc::new(client)).with_config(config.reconcile))
}

fn watch_ctrl_c(handle: drift_core::CancelHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after the current call");
            handle.cancel();
        }
    })
}

fn print_result(result: &ReconciliationResult, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        println!("{}", result.summary());
    }
    Ok(())
}

fn exit_code(result: &ReconciliationResult) -> ExitCode {
    ExitCode::from(u8::try_from(result.outcome.exit_code()).unwrap_or(1))
}

fn policy_label(policy: WritePolicy) -> &'static str {
    match policy {
        WritePolicy::Overwrite => "",
        WritePolicy::IfAbsent => " (seed once)",
    }
}

/// `KEY=value` lines, sensitive values redacted
pub(crate) fn render_lines(desired: &DesiredState) -> Vec<String> {
    let mut lines = vec![format!("image: {}", desired.artifact())];
    for (key, entry) in desired.settings() {
        lines.push(format!("{key}={}{}", entry.value, policy_label(entry.policy)));
    }
    lines
}

pub(crate) fn render_json(desired: &DesiredState) -> serde_json::Value {
    let settings: serde_json::Map<String, serde_json::Value> = desired
        .settings()
        .iter()
        .map(|(key, entry)| {
            (
                key.to_string(),
                json!({
                    "value": entry.value.to_string(),
                    "sensitive": entry.value.is_sensitive(),
                    "policy": entry.policy,
                }),
            )
        })
        .collect();
    json!({ "artifact": desired.artifact(), "settings": settings })
}

/// Terraform-style change list
pub(crate) fn plan_lines(plan: &Plan) -> Vec<String> {
    if plan.is_converged() {
        return vec!["no changes".to_string()];
    }
    let mut lines = Vec::new();
    if !plan.target_exists {
        lines.push("target does not exist yet and will be created".to_string());
    }
    if let Some(change) = &plan.artifact {
        match &change.from {
            Some(from) => lines.push(format!("~ image {from} -> {}", change.to)),
            None => lines.push(format!("+ image {}", change.to)),
        }
    }
    for (key, change) in plan.diff.iter() {
        let marker = match change.kind {
            ChangeKind::Added => '+',
            ChangeKind::Modified => '~',
        };
        lines.push(format!("{marker} {key}={}", change.value));
    }
    lines.push(format!(
        "{} setting(s), {} image change(s)",
        plan.diff.len(),
        usize::from(plan.artifact.is_some())
    ));
    lines
}

pub(crate) fn plan_json(plan: &Plan) -> serde_json::Value {
    let changes: Vec<serde_json::Value> = plan
        .diff
        .iter()
        .map(|(key, change)| {
            json!({
                "key": key,
                "kind": match change.kind {
                    ChangeKind::Added => "added",
                    ChangeKind::Modified => "modified",
                },
                "value": change.value.to_string(),
            })
        })
        .collect();
    json!({
        "target_exists": plan.target_exists,
        "converged": plan.is_converged(),
        "artifact": plan.artifact.as_ref().map(|c| json!({ "from": c.from, "to": c.to })),
        "changes": changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::ObservedState;
    use drift_test_utils::{scenario_builder, scenario_parameters};

    async fn desired() -> DesiredState {
        scenario_builder().build(&scenario_parameters()).await.unwrap()
    }

    #[tokio::test]
    async fn render_redacts_secrets() {
        let lines = render_lines(&desired().await);
        assert_eq!(lines[0], "image: reg.example.com/backend:latest");
        assert!(lines.iter().any(|l| l == "ALLOWED_ORIGINS=*"));
        assert!(lines.iter().any(|l| l.starts_with("SECRET_KEY=<redacted") && l.ends_with("(seed once)")));
        assert!(!lines.iter().any(|l| l.contains("dbpw") || l.contains("p@ss")));
    }

    #[tokio::test]
    async fn render_json_redacts_secrets() {
        let value = render_json(&desired().await);
        let text = value.to_string();
        assert!(!text.contains("dbpw"));
        assert_eq!(value["artifact"], "reg.example.com/backend:latest");
        assert_eq!(value["settings"]["DATABASE_URL"]["sensitive"], true);
        assert_eq!(value["settings"]["SECRET_KEY"]["policy"], "if_absent");
    }

    #[tokio::test]
    async fn plan_for_missing_target() {
        let plan = Plan::compute(&desired().await, &ObservedState::missing());
        let lines = plan_lines(&plan);
        assert_eq!(lines[0], "target does not exist yet and will be created");
        assert_eq!(lines[1], "+ image reg.example.com/backend:latest");
        assert!(!lines.iter().any(|l| l.contains("dbpw")));

        let json = plan_json(&plan);
        assert_eq!(json["target_exists"], false);
        assert_eq!(json["artifact"]["to"], "reg.example.com/backend:latest");
    }

    #[tokio::test]
    async fn plan_for_converged_target() {
        let desired = desired().await;
        let settings = desired
            .settings()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        let observed = ObservedState::new(settings, Some(desired.artifact().clone()));
        let plan = Plan::compute(&desired, &observed);
        assert_eq!(plan_lines(&plan), vec!["no changes".to_string()]);
    }
}
