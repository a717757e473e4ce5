//! Render command - print a rule without touching a cluster

use clap::Args;
use serde_json::json;

use tollgate_ingress::action::{RESPONSE_DELAY, RESPONSE_STATUS_CODE};
use tollgate_ingress::{render_rule, Dialect, ExecutionId, RuleSubtype};

use super::{ConditionArgs, ProxyArgs};
use crate::Result;

/// Render command arguments
#[derive(Args, Debug)]
pub struct RenderArgs {
    #[command(flatten)]
    pub proxy: ProxyArgs,

    #[command(flatten)]
    pub conditions: ConditionArgs,

    /// Render a block rule returning this status code
    #[arg(long, required_unless_present = "delay_ms", conflicts_with = "delay_ms")]
    pub status: Option<u16>,

    /// Render a delay rule holding requests for this many milliseconds
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Execution id to embed (random by default)
    #[arg(long)]
    pub execution_id: Option<String>,

    /// Print the annotation key and rule as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the render command
pub fn run(args: RenderArgs) -> Result<()> {
    let (subtype, action) = match (args.status, args.delay_ms) {
        (Some(status), _) => (RuleSubtype::Block, (RESPONSE_STATUS_CODE, json!(status))),
        (None, Some(ms)) => (RuleSubtype::Delay, (RESPONSE_DELAY, json!(ms))),
        (None, None) => {
            return Err(crate::Error::validation(
                "either --status or --delay-ms is required",
            ))
        }
    };
    let params = super::action_parameters(&args.conditions, &args.proxy, action)?;
    let dialect = Dialect::for_family(args.proxy.family()?, args.proxy.enterprise);
    let execution_id = match &args.execution_id {
        Some(id) => id.parse()?,
        None => ExecutionId::new_v4(),
    };

    let (_, rule) = render_rule(dialect, subtype, &params, execution_id)?;

    if args.json {
        let output = json!({
            "annotation": dialect.annotation_key(),
            "rule": rule,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("# {}", dialect.annotation_key());
        println!("{}", rule.fragment());
    }
    Ok(())
}
