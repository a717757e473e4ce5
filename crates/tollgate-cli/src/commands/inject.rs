//! Block and delay commands
//!
//! Both run the full lifecycle of one action: Prepare, Start, wait for the
//! duration or Ctrl-C, Stop.

use std::time::Duration;

use clap::Args;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use tollgate_ingress::action::{RESPONSE_DELAY, RESPONSE_STATUS_CODE};
use tollgate_ingress::{ExecutionId, PrepareRequest, RuleSubtype};

use super::{ConditionArgs, TargetArgs};
use crate::Result;

/// Block command arguments
#[derive(Args, Debug)]
pub struct BlockArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub conditions: ConditionArgs,

    /// Status code returned to matching requests
    #[arg(long, default_value_t = 503)]
    pub status: u16,

    /// How long the rule stays active (e.g., "30s", "5m")
    #[arg(long, short = 'd', default_value = "30s")]
    pub duration: String,

    /// Ingress class, used when the ingress does not name one
    #[arg(long)]
    pub class: Option<String>,
}

/// Delay command arguments
#[derive(Args, Debug)]
pub struct DelayArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub conditions: ConditionArgs,

    /// Milliseconds each matching request is held
    #[arg(long)]
    pub delay_ms: u64,

    /// How long the rule stays active (e.g., "30s", "5m")
    #[arg(long, short = 'd', default_value = "30s")]
    pub duration: String,

    /// Ingress class, used when the ingress does not name one
    #[arg(long)]
    pub class: Option<String>,

    /// Do not check NGINX controller pods for the sleep module
    #[arg(long)]
    pub skip_module_verification: bool,
}

/// Run the block command
pub async fn run_block(args: BlockArgs) -> Result<()> {
    let params = super::action_parameters(
        &args.conditions,
        &args.target.proxy,
        (RESPONSE_STATUS_CODE, json!(args.status)),
    )?;
    run_action(
        &args.target,
        args.class.as_deref(),
        RuleSubtype::Block,
        params,
        &args.duration,
        false,
    )
    .await
}

/// Run the delay command
pub async fn run_delay(args: DelayArgs) -> Result<()> {
    let params = super::action_parameters(
        &args.conditions,
        &args.target.proxy,
        (RESPONSE_DELAY, json!(args.delay_ms)),
    )?;
    run_action(
        &args.target,
        args.class.as_deref(),
        RuleSubtype::Delay,
        params,
        &args.duration,
        args.skip_module_verification,
    )
    .await
}

async fn run_action(
    target: &TargetArgs,
    class: Option<&str>,
    subtype: RuleSubtype,
    parameters: Map<String, Value>,
    duration: &str,
    skip_module_verification: bool,
) -> Result<()> {
    let duration = super::parse_duration(duration)?;
    let family = target.proxy.family()?;
    let shaper = super::traffic_shaper(target, skip_module_verification).await?;

    let execution_id = ExecutionId::new_v4();
    let state = shaper
        .prepare(PrepareRequest {
            family,
            subtype,
            attributes: super::target_attributes(target, class),
            parameters,
            execution_id,
        })
        .await?;

    if let Err(e) = shaper.start(&state).await {
        error!(error = %e, "Start failed, removing partial rule");
        if let Err(stop_err) = shaper.stop(&state).await {
            warn!(error = %stop_err, "Cleanup after failed start also failed");
        }
        return Err(e.into());
    }

    println!("{}", execution_id);
    info!(
        %execution_id,
        ingress = %format!("{}/{}", state.namespace, state.ingress),
        duration_secs = duration.as_secs(),
        "Rule active"
    );

    wait_for(duration).await;

    shaper.stop(&state).await?;
    Ok(())
}

/// Sleep for `duration`, returning early on Ctrl-C
async fn wait_for(duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Interrupted, removing rule"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, removing rule"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn block_defaults() {
        let cli = Cli::try_parse_from([
            "tollgate", "block", "-n", "shop", "-i", "frontend", "--proxy", "haproxy", "--path",
            "/api/.*",
        ])
        .unwrap();
        match cli.command {
            Commands::Block(args) => {
                assert_eq!(args.status, 503);
                assert_eq!(args.duration, "30s");
                assert_eq!(args.conditions.path.as_deref(), Some("/api/.*"));
                assert!(!args.target.proxy.enterprise);
            }
            other => panic!("Expected block, got {other:?}"),
        }
    }

    #[test]
    fn delay_requires_delay_ms() {
        let result = Cli::try_parse_from([
            "tollgate", "delay", "-n", "shop", "-i", "frontend", "--proxy", "nginx",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn delay_with_header_and_enterprise() {
        let cli = Cli::try_parse_from([
            "tollgate",
            "delay",
            "-n",
            "shop",
            "-i",
            "frontend",
            "--proxy",
            "nginx",
            "--enterprise",
            "--header",
            "X-Canary=yes",
            "--delay-ms",
            "750",
            "-d",
            "2m",
        ])
        .unwrap();
        match cli.command {
            Commands::Delay(args) => {
                assert_eq!(args.delay_ms, 750);
                assert_eq!(args.duration, "2m");
                assert!(args.target.proxy.enterprise);
                assert_eq!(args.conditions.header.as_deref(), Some("X-Canary=yes"));
            }
            other => panic!("Expected delay, got {other:?}"),
        }
    }
}
