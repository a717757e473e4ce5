//! Clear command - remove a rule block whose execution never ran Stop

use clap::Args;

use tollgate_ingress::{Dialect, ExecutionId, RuleState, RuleSubtype};

use super::TargetArgs;
use crate::Result;

/// Clear command arguments
#[derive(Args, Debug)]
pub struct ClearArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Execution id from the block markers
    #[arg(long)]
    pub execution_id: String,

    /// Rule kind: block or delay
    #[arg(long)]
    pub kind: String,
}

/// Run the clear command
pub async fn run(args: ClearArgs) -> Result<()> {
    let dialect = Dialect::for_family(args.target.proxy.family()?, args.target.proxy.enterprise);
    let execution_id: ExecutionId = args.execution_id.parse()?;
    let subtype: RuleSubtype = args.kind.parse()?;

    let shaper = super::traffic_shaper(&args.target, false).await?;
    let state = RuleState::orphan(
        args.target.namespace.clone(),
        args.target.ingress.clone(),
        dialect,
        subtype,
        execution_id,
    );

    if shaper.stop(&state).await? {
        println!("Removed {} rule {}", subtype, execution_id);
    } else {
        println!("No {} rule {} found", subtype, execution_id);
    }
    Ok(())
}
