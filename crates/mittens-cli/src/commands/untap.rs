//! Untap command - remove the proxy sidecar and restore the Service.
//!
//! Runs unconditionally, so it also cleans up after an interrupted tap.

use clap::Args;

use super::connect;
use crate::{GlobalArgs, Result};

/// Remove a tap and everything it created
#[derive(Args, Debug)]
pub struct UntapArgs {
    /// Service to untap
    pub service: String,

    /// Namespace of the Service (defaults to the kubeconfig context's)
    #[arg(short, long)]
    pub namespace: Option<String>,
}

pub async fn run(args: UntapArgs, global: &GlobalArgs) -> Result<()> {
    let conn = connect(global, args.namespace.as_deref()).await?;
    conn.orchestrator
        .untap(&conn.namespace, &args.service)
        .await?;
    println!("Untapped Service {:?}", args.service);
    Ok(())
}
