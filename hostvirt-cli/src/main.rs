//! # hostvirt
//!
//! Operator command line for the hostvirt engine. Every subcommand runs one
//! engine operation against the configured host and prints the result as JSON.
//!
//! ## Usage
//! ```bash
//! hostvirt --config /etc/hostvirt/engine.yaml domain list
//! hostvirt --uri qemu+ssh://root@kvm-02/system volume from-image default \
//!     /var/lib/libvirt/images/base/rocky9.qcow2 --template-gb 10 --target-gb 40
//! hostvirt --dev pool ensure default /var/lib/libvirt/images
//! ```

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cli;
mod commands;
mod config;

use cli::Args;
use hostvirt_common::LogFormat;
use hostvirt_engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format: LogFormat = args.log_format.parse()?;
    hostvirt_common::init(&args.log_level, format)?;

    let config = config::load(&args)?;

    let engine = if args.dev {
        info!("Development mode: in-memory hypervisor");
        Engine::in_memory(config)
    } else {
        match Engine::connect(config).await {
            Ok(engine) => engine,
            Err(e) => {
                error!(error = %e, "Failed to connect to hypervisor");
                return Err(e.into());
            }
        }
    };

    // Ctrl-C stops provisioning; its cleanup still runs.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    commands::run(&engine, args.command, cancel).await
}
