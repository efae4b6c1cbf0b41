//! Tap command - redirect a Service through a proxy sidecar and attach to it.
//!
//! When stdout is not a terminal, or `--no-attach` is given, the command
//! returns right after the tap and leaves it in place.

use std::io::IsTerminal;
use std::sync::Arc;

use clap::Args;
use mittens_tap::{Coordinator, KubectlAttacher, Protocol, ProxyMode, TapOutcome, TapRequest};

use super::{cancel_on_signal, connect};
use crate::{GlobalArgs, Result};

/// Tap a Service and attach to the proxy
#[derive(Args, Debug)]
pub struct TapArgs {
    /// Service to tap
    pub service: String,

    /// Namespace of the Service (defaults to the kubeconfig context's)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Service port to tap; required when the Service exposes several
    #[arg(short, long)]
    pub port: Option<i32>,

    /// Sidecar image (defaults to the image for the protocol)
    #[arg(short, long)]
    pub image: Option<String>,

    /// The upstream container serves HTTPS
    #[arg(long)]
    pub https: bool,

    /// Comma-separated arguments for the sidecar command
    #[arg(long, value_delimiter = ',')]
    pub command_args: Option<Vec<String>>,

    /// Protocol to intercept (http, tcp, udp, grpc)
    #[arg(long, default_value = "http")]
    pub protocol: Protocol,

    /// Proxy mode
    #[arg(long, default_value = "reverse")]
    pub mode: ProxyMode,

    /// Leave the tap in place without waiting for the Pod or attaching
    #[arg(long)]
    pub no_attach: bool,
}

impl TapArgs {
    fn request(&self, namespace: String) -> TapRequest {
        TapRequest {
            service: self.service.clone(),
            namespace,
            port: self.port,
            protocol: self.protocol,
            mode: self.mode,
            upstream_https: self.https,
            image: self.image.clone(),
            command_args: self.command_args.clone(),
        }
    }
}

fn report(outcome: &TapOutcome, service: &str) {
    match outcome {
        TapOutcome::Tapped { port, .. } => {
            println!("Port {} of Service {:?} has been tapped!", port, service)
        }
        TapOutcome::AlreadyTapped { .. } => println!("Service {:?} is already tapped.", service),
    }
}

pub async fn run(args: TapArgs, global: &GlobalArgs) -> Result<()> {
    let conn = connect(global, args.namespace.as_deref()).await?;
    let request = args.request(conn.namespace);

    if args.no_attach || !std::io::stdout().is_terminal() {
        let outcome = conn.orchestrator.tap(&request).await?;
        report(&outcome, &request.service);
        println!("Run `mittens untap {}` to remove it.", request.service);
        return Ok(());
    }

    let attacher = Arc::new(KubectlAttacher::new(
        global.kubeconfig.clone(),
        global.context.clone(),
    ));
    let coordinator = Coordinator::new(conn.orchestrator, attacher);
    let cancel = cancel_on_signal();

    println!(
        "Tapping Service {:?}, waiting for the proxy to become ready...",
        request.service
    );
    match coordinator.run(&request, cancel).await {
        Ok(outcome) => {
            report(&outcome, &request.service);
            println!("Untapped Service {:?}", request.service);
            Ok(())
        }
        Err(e @ mittens_common::Error::ReadinessTimeout { .. }) => {
            eprintln!(
                "The tap was left in place. Run `mittens untap {}` to remove it.",
                request.service
            );
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
