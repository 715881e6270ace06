//! Subcommand dispatch. Results are printed to stdout as JSON.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use hostvirt_engine::*;

use crate::cli::*;

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn log_warnings(warnings: &[Warning]) {
    for warning in warnings {
        warn!(kind = ?warning.kind, "{}", warning.message);
    }
}

/// Print the value; warnings also go to the log.
fn print_outcome<T: Serialize>(outcome: Outcome<T>) -> Result<()> {
    log_warnings(&outcome.warnings);
    print(&outcome)
}

fn read_spec(path: &str) -> Result<DomainSpec> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read spec {}", path))?;
    let spec = match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).with_context(|| format!("Invalid JSON spec {}", path))?,
        _ => serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML spec {}", path))?,
    };
    Ok(spec)
}

pub async fn run(engine: &Engine, command: Command, cancel: CancellationToken) -> Result<()> {
    match command {
        Command::Domain(cmd) => domain(engine, cmd).await,
        Command::Pool(cmd) => pool(engine, cmd).await,
        Command::Volume(cmd) => volume(engine, cmd, cancel).await,
        Command::Snapshot(cmd) => snapshot(engine, cmd).await,
        Command::Host(cmd) => host(engine, cmd).await,
        Command::ResetPassword { disk, users } => {
            engine.passwords().reset(&disk, &users).await?;
            print(&serde_json::json!({ "disk": disk, "users": users.len() }))
        }
        Command::Config => {
            println!("{:#?}", engine.config());
            Ok(())
        }
    }
}

async fn domain(engine: &Engine, cmd: DomainCommand) -> Result<()> {
    let domains = engine.domains();
    match cmd {
        DomainCommand::Define { spec, start } => {
            let mut spec = read_spec(&spec)?;
            spec.auto_start |= start;
            print_outcome(domains.define(&spec).await?)
        }
        DomainCommand::Undefine { name, all } => {
            let flags = if all { UndefineFlags::all() } else { UndefineFlags::default() };
            domains.undefine(&name, flags).await?;
            print(&domains.list().await?)
        }
        DomainCommand::Start { name } => {
            log_warnings(&domains.start(&name).await?.warnings);
            print(&domains.state(&name).await?)
        }
        DomainCommand::Stop { name } => {
            domains.stop(&name).await?;
            print(&domains.state(&name).await?)
        }
        DomainCommand::Destroy { name } => {
            domains.destroy(&name).await?;
            print(&domains.state(&name).await?)
        }
        DomainCommand::Reboot { name } => {
            domains.reboot(&name).await?;
            print(&domains.state(&name).await?)
        }
        DomainCommand::Pause { name } => {
            domains.pause(&name).await?;
            print(&domains.state(&name).await?)
        }
        DomainCommand::Resume { name } => {
            domains.resume(&name).await?;
            print(&domains.state(&name).await?)
        }
        DomainCommand::Autostart { name, disable } => {
            domains.set_autostart(&name, !disable).await?;
            print(&serde_json::json!({ "domain": name, "autostart": !disable }))
        }
        DomainCommand::List => print(&domains.list().await?),
        DomainCommand::State { name } => print(&domains.state(&name).await?),
        DomainCommand::Console { name } => print(&domains.console_info(&name).await?),
        DomainCommand::Dump { name, inactive } => {
            let xml = engine.connection().domain_xml(&name, inactive).await?;
            println!("{}", xml);
            Ok(())
        }
        DomainCommand::SetMemory { name, kib, live } => print_outcome(domains.modify_memory(&name, kib, live).await?),
        DomainCommand::SetVcpus { name, count, live } => print_outcome(domains.modify_vcpus(&name, count, live).await?),
        DomainCommand::AttachDisk { name, path, target } => {
            print_outcome(domains.attach_disk(&name, &path, &target).await?)
        }
        DomainCommand::DetachDisk { name, target } => print_outcome(domains.detach_disk(&name, &target).await?),
    }
}

async fn pool(engine: &Engine, cmd: PoolCommand) -> Result<()> {
    let storage = engine.storage();
    match cmd {
        PoolCommand::Ensure { name, path, pool_type } => print_outcome(storage.ensure_pool(&name, pool_type, &path).await?),
        PoolCommand::List => print(&storage.list_pools().await?),
        PoolCommand::Info { name } => print(&storage.get_pool(&name).await?),
        PoolCommand::Delete { name, with_volumes } => print_outcome(storage.delete_pool(&name, with_volumes).await?),
    }
}

async fn volume(engine: &Engine, cmd: VolumeCommand, cancel: CancellationToken) -> Result<()> {
    let storage = engine.storage();
    match cmd {
        VolumeCommand::Create { pool, name, size_gb, format } => {
            print_outcome(storage.create_volume(&pool, &name, size_gb, format).await?)
        }
        VolumeCommand::FromImage(a) => print_outcome(
            storage
                .create_volume_from_image(&a.pool, &a.template, a.template_gb, a.target_gb, a.format, &cancel)
                .await?,
        ),
        VolumeCommand::CreateImage { path, size_gb, format } => {
            storage.create_image(&path, format, size_gb).await?;
            print(&serde_json::json!({ "path": path, "size_gb": size_gb, "format": format }))
        }
        VolumeCommand::List { pool } => print(&storage.list_volumes(&pool).await?),
        VolumeCommand::Info { pool, name } => print(&storage.get_volume(&pool, &name).await?),
        VolumeCommand::Resize { pool, name, size_gb } => print(&storage.resize_volume(&pool, &name, size_gb).await?),
        VolumeCommand::Delete { name } => {
            storage.delete_volume(&name).await?;
            print(&serde_json::json!({ "deleted": name }))
        }
    }
}

async fn snapshot(engine: &Engine, cmd: SnapshotCommand) -> Result<()> {
    let snapshots = engine.snapshots();
    match cmd {
        SnapshotCommand::Create { domain, name, description, disk_only, quiesce } => {
            let mut descriptor = SnapshotDescriptor::new(name.unwrap_or_default());
            descriptor.description = description;
            let flags = SnapshotCreateFlags { disk_only, quiesce, atomic: true, ..Default::default() };
            print(&snapshots.create(&domain, &descriptor, flags).await?)
        }
        SnapshotCommand::List { domain } => print_outcome(snapshots.list(&domain).await?),
        SnapshotCommand::Current { domain } => print(&snapshots.current(&domain).await?),
        SnapshotCommand::Info { domain, name } => print(&snapshots.get(&domain, &name).await?),
        SnapshotCommand::Revert { domain, name, running, paused } => {
            let flags = SnapshotRevertFlags { running, paused, ..Default::default() };
            snapshots.revert(&domain, &name, flags).await?;
            print(&engine.domains().state(&domain).await?)
        }
        SnapshotCommand::Delete { domain, name, children } => {
            let flags = SnapshotDeleteFlags { children, ..Default::default() };
            snapshots.delete(&domain, &name, flags).await?;
            print_outcome(snapshots.list(&domain).await?)
        }
    }
}

async fn host(engine: &Engine, cmd: HostCommand) -> Result<()> {
    let inspector = engine.host();
    match cmd {
        HostCommand::Capabilities => print(&inspector.capabilities().await?),
        HostCommand::Sysinfo => print(&inspector.sysinfo().await?),
        HostCommand::Devices { cap } => print_outcome(inspector.node_devices(cap.as_deref()).await?),
    }
}
