use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpalloc::{
    Allocator, Config, JsonLeaseStore, Lease, LeaseStore, MacAddress, Result, spawn_purge_sweeper,
};

#[derive(Parser)]
#[command(name = "dhcpalloc")]
#[command(author, version, about = "DHCP address-lease allocator", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "dhcpalloc.yaml")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    ShowConfig,
    #[command(flatten)]
    Store(StoreCommand),
}

/// Commands that operate on the lease store.
#[derive(Subcommand)]
enum StoreCommand {
    /// Run the periodic lease sweep until interrupted
    Run,
    ListLeases,
    PurgeLeases {
        /// Ignore the grace period
        #[arg(long)]
        aggressive: bool,
    },
    Allocate {
        mac: MacAddress,
        #[arg(long)]
        renew: bool,
        #[arg(long)]
        preferred: Option<Ipv4Addr>,
    },
    /// Bind a MAC to an address directly, bypassing the range scan
    SetLease {
        mac: MacAddress,
        ip: Ipv4Addr,
        #[arg(long)]
        persistent: bool,
    },
    RemoveLease {
        mac: MacAddress,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    let command = match cli.command.unwrap_or(Commands::Store(StoreCommand::Run)) {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        Commands::Store(command) => command,
    };

    let store = Arc::new(JsonLeaseStore::open(&config.db_file).await?);
    let result = execute(command, &config, &store).await;
    let closed = store.close().await;

    result.and(closed)
}

async fn execute(command: StoreCommand, config: &Config, store: &Arc<JsonLeaseStore>) -> Result<()> {
    match command {
        StoreCommand::Run => {
            info!(
                "Sweeping {} every {:?}",
                config.db_file.display(),
                config.sweep_interval
            );
            let sweeper = spawn_purge_sweeper(store.clone(), config.sweep_interval);

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping sweeper...");
            sweeper.abort();
            Ok(())
        }
        StoreCommand::ListLeases => {
            let leases = store.list_leases().await?;

            if leases.is_empty() {
                println!("No leases.");
                return Ok(());
            }

            println!(
                "{:<18} {:<16} {:<6} {:<24} {:<10}",
                "MAC Address", "IP Address", "Flags", "Lease End", "Remaining"
            );
            println!("{}", "-".repeat(78));

            for lease in leases {
                let remaining = lease.remaining_seconds();
                let remaining_str = if lease.persistent {
                    "pinned".to_string()
                } else if remaining > 0 {
                    format!("{}s", remaining)
                } else {
                    "expired".to_string()
                };
                let flags = format!(
                    "{}{}",
                    if lease.reserved { "R" } else { "-" },
                    if lease.persistent { "P" } else { "-" }
                );

                println!(
                    "{:<18} {:<16} {:<6} {:<24} {:<10}",
                    lease.mac.to_string(),
                    lease.ip.to_string(),
                    flags,
                    lease.lease_end.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    remaining_str
                );
            }
            Ok(())
        }
        StoreCommand::PurgeLeases { aggressive } => {
            let count = store.purge_leases(aggressive).await?;
            println!("Purged {} lease(s).", count);
            Ok(())
        }
        StoreCommand::Allocate {
            mac,
            renew,
            preferred,
        } => {
            let allocator = Allocator::new(store.clone(), config, None)?;
            let ip = allocator.allocate(mac, renew, preferred).await?;
            println!("{} -> {}", mac, ip);
            Ok(())
        }
        StoreCommand::SetLease {
            mac,
            ip,
            persistent,
        } => {
            let lease =
                Lease::starting_now(mac, ip, config.lease.duration, config.lease.grace_period)
                    .with_reserved(true)
                    .with_persistent(persistent);
            store.set_lease(lease).await?;
            println!("{} -> {}", mac, ip);
            Ok(())
        }
        StoreCommand::RemoveLease { mac } => {
            match store.remove_lease(mac).await? {
                Some(lease) => println!("Removed {} -> {}", lease.mac, lease.ip),
                None => println!("No lease for {}.", mac),
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_show_config_is_not_a_store_command() {
        let cli = Cli::try_parse_from(["dhcpalloc", "show-config"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::ShowConfig)));
    }

    #[test]
    fn test_store_commands_parse() {
        let cli = Cli::try_parse_from(["dhcpalloc", "purge-leases", "--aggressive"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Store(StoreCommand::PurgeLeases { aggressive: true }))
        ));

        let cli = Cli::try_parse_from([
            "dhcpalloc",
            "allocate",
            "aa:bb:cc:dd:ee:ff",
            "--preferred",
            "10.0.20.75",
        ])
        .unwrap();
        let Some(Commands::Store(StoreCommand::Allocate { mac, renew, preferred })) = cli.command
        else {
            panic!("expected allocate");
        };
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert!(!renew);
        assert_eq!(preferred, Some(Ipv4Addr::new(10, 0, 20, 75)));

        assert!(Cli::try_parse_from(["dhcpalloc", "allocate", "not-a-mac"]).is_err());
        assert!(Cli::try_parse_from(["dhcpalloc"]).unwrap().command.is_none());
    }
}
