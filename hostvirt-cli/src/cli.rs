//! Command-line argument parsing.

use clap::{Args as ClapArgs, Parser, Subcommand};
use hostvirt_engine::{DiskFormat, PoolType};

/// hostvirt - domain and storage orchestration for a QEMU/KVM host
#[derive(Parser, Debug)]
#[command(name = "hostvirt")]
#[command(about = "hostvirt - domain and storage orchestration for a QEMU/KVM host")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (defaults used if not found)
    #[arg(short, long, env = "HOSTVIRT_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Log format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Libvirt connection URI, e.g. qemu+ssh://root@kvm-02/system
    #[arg(long, env = "HOSTVIRT_URI")]
    pub uri: Option<String>,

    /// Enable development mode (in-memory hypervisor)
    #[arg(long)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Virtual machine lifecycle
    #[command(subcommand)]
    Domain(DomainCommand),
    /// Storage pools
    #[command(subcommand)]
    Pool(PoolCommand),
    /// Storage volumes
    #[command(subcommand)]
    Volume(VolumeCommand),
    /// Domain snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Host inventory
    #[command(subcommand)]
    Host(HostCommand),
    /// Set guest passwords on an offline qcow2 disk
    ResetPassword {
        disk: String,
        /// `user=password`, repeatable
        #[arg(long = "user", required = true, value_parser = parse_credential)]
        users: Vec<(String, String)>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum DomainCommand {
    /// Define a domain from a YAML or JSON spec file
    Define {
        spec: String,
        /// Start right after definition
        #[arg(long)]
        start: bool,
    },
    Undefine {
        name: String,
        /// Also remove managed save, snapshot metadata and NVRAM
        #[arg(long)]
        all: bool,
    },
    Start { name: String },
    /// Graceful shutdown
    Stop { name: String },
    /// Hard power-off
    Destroy { name: String },
    Reboot { name: String },
    Pause { name: String },
    Resume { name: String },
    Autostart {
        name: String,
        #[arg(long)]
        disable: bool,
    },
    List,
    State { name: String },
    /// VNC socket and serial PTY
    Console { name: String },
    /// Print the domain document
    Dump {
        name: String,
        /// Persistent definition instead of the live one
        #[arg(long)]
        inactive: bool,
    },
    /// Change memory (KiB)
    SetMemory {
        name: String,
        kib: u64,
        #[arg(long)]
        live: bool,
    },
    SetVcpus {
        name: String,
        count: u32,
        #[arg(long)]
        live: bool,
    },
    AttachDisk {
        name: String,
        path: String,
        /// Target device, e.g. vdb
        target: String,
    },
    DetachDisk { name: String, target: String },
}

#[derive(Subcommand, Debug)]
pub enum PoolCommand {
    /// Create the pool if needed and make sure it is running
    Ensure {
        name: String,
        path: String,
        #[arg(long = "type", default_value = "dir")]
        pool_type: PoolType,
    },
    List,
    Info { name: String },
    Delete {
        name: String,
        /// Remove the volumes and the directory too
        #[arg(long)]
        with_volumes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    Create {
        pool: String,
        name: String,
        size_gb: u64,
        #[arg(long, default_value = "qcow2")]
        format: DiskFormat,
    },
    /// Provision a volume from a template image
    FromImage(FromImageArgs),
    /// Empty image at a path outside any pool
    CreateImage {
        path: String,
        size_gb: u64,
        #[arg(long, default_value = "qcow2")]
        format: DiskFormat,
    },
    List { pool: String },
    Info { pool: String, name: String },
    Resize { pool: String, name: String, size_gb: u64 },
    /// Delete by name from the default or images pool
    Delete { name: String },
}

#[derive(ClapArgs, Debug)]
pub struct FromImageArgs {
    pub pool: String,
    /// Template image path
    pub template: String,
    /// Virtual size of the template
    #[arg(long)]
    pub template_gb: u64,
    /// Virtual size of the new volume
    #[arg(long)]
    pub target_gb: u64,
    #[arg(long, default_value = "qcow2")]
    pub format: DiskFormat,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    Create {
        domain: String,
        /// Snapshot name (hypervisor picks one when omitted)
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        disk_only: bool,
        #[arg(long)]
        quiesce: bool,
    },
    List { domain: String },
    Current { domain: String },
    Info { domain: String, name: String },
    Revert {
        domain: String,
        name: String,
        #[arg(long, conflicts_with = "paused")]
        running: bool,
        #[arg(long)]
        paused: bool,
    },
    Delete {
        domain: String,
        name: String,
        /// Delete descendants too
        #[arg(long)]
        children: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum HostCommand {
    Capabilities,
    Sysinfo,
    /// Node devices, optionally filtered by capability (pci, net, ...)
    Devices {
        #[arg(long)]
        cap: Option<String>,
    },
}

fn parse_credential(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((user, password)) if !user.is_empty() => Ok((user.to_string(), password.to_string())),
        _ => Err(format!("expected user=password, got '{}'", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volume_from_image() {
        let args = Args::try_parse_from([
            "hostvirt",
            "--dev",
            "volume",
            "from-image",
            "default",
            "/var/lib/libvirt/images/base/base.qcow2",
            "--template-gb",
            "10",
            "--target-gb",
            "20",
        ])
        .unwrap();

        assert!(args.dev);
        match args.command {
            Command::Volume(VolumeCommand::FromImage(a)) => {
                assert_eq!(a.target_gb, 20);
                assert_eq!(a.format, DiskFormat::Qcow2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_credentials() {
        let args = Args::try_parse_from([
            "hostvirt",
            "reset-password",
            "/var/lib/libvirt/images/web-1.qcow2",
            "--user",
            "root=a=b",
        ])
        .unwrap();

        match args.command {
            Command::ResetPassword { users, .. } => {
                assert_eq!(users, vec![("root".to_string(), "a=b".to_string())]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(parse_credential("=pw").is_err());
        assert!(parse_credential("root").is_err());
    }

    #[test]
    fn test_pool_type_parsing() {
        assert!(Args::try_parse_from(["hostvirt", "pool", "ensure", "p", "/p", "--type", "zfs"]).is_err());
    }
}
