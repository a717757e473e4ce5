//! List command - show rule blocks present on an ingress

use clap::Args;

use tollgate_ingress::Dialect;

use super::TargetArgs;
use crate::Result;

/// List command arguments
#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

/// Run the list command
pub async fn run(args: ListArgs) -> Result<()> {
    let dialect = Dialect::for_family(args.target.proxy.family()?, args.target.proxy.enterprise);
    let shaper = super::traffic_shaper(&args.target, false).await?;
    let rules = shaper
        .active_rules(&args.target.namespace, &args.target.ingress, dialect)
        .await?;

    if rules.is_empty() {
        println!(
            "No rules on {}/{} ({})",
            args.target.namespace,
            args.target.ingress,
            dialect.annotation_key()
        );
        return Ok(());
    }

    println!("{:<8} EXECUTION ID", "KIND");
    for rule in rules {
        println!("{:<8} {}", rule.subtype.to_string(), rule.execution_id);
    }
    Ok(())
}
