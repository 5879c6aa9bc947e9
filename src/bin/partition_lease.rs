use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use partition_lease::{
    CancellationToken, Checkpoint, FsStore, LeaseConfig, LeaseManager, PartitionHost,
};

#[derive(Parser, Debug)]
#[command(name = "partition-lease")]
#[command(about = "Inspect and exercise partition leases kept in a directory-backed store")]
struct Cli {
    /// Store root directory (one sub-directory per container)
    #[arg(long, default_value = "./leases")]
    root: PathBuf,

    /// Container holding one lease object per partition
    #[arg(long, default_value = "leases")]
    container: String,

    /// Owner name written into acquired leases (default: pid-<pid>)
    #[arg(long)]
    owner: Option<String>,

    /// Lock duration in seconds
    #[arg(long, default_value_t = 30)]
    lease_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the container if it is missing
    Init,
    /// Create lease objects for partitions that have none
    Ensure { partitions: Vec<String> },
    /// Print the stored lease of each partition
    Show { partitions: Vec<String> },
    /// Acquire partitions and keep renewing them until Ctrl-C
    Hold {
        partitions: Vec<String>,

        /// Renew interval in milliseconds
        #[arg(long, default_value_t = 10_000)]
        renew_ms: u64,

        /// Advance each held checkpoint by one sequence number per renewal
        #[arg(long)]
        advance: bool,
    },
    /// Acquire a partition, write a checkpoint and release it
    Checkpoint {
        partition: String,
        offset: String,
        sequence: i64,
    },
    /// Delete a partition's lease object
    Delete { partition: String },
    /// Delete the whole container
    Destroy,
}

struct CliHost {
    name: String,
    partitions: Vec<String>,
}

impl PartitionHost for CliHost {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn partition_ids(&self) -> Vec<String> {
        self.partitions.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let owner = cli
        .owner
        .clone()
        .unwrap_or_else(|| format!("pid-{}", std::process::id()));
    let mut config = LeaseConfig::new(cli.container.clone());
    config.lease_duration = Duration::from_secs(cli.lease_secs);
    let store = Arc::new(FsStore::new(cli.root.clone()));
    let manager = LeaseManager::new(store, config).context("invalid lease configuration")?;

    match cli.command {
        Command::Init => {
            manager.ensure_store().await.context("create container")?;
            info!("container {} ready under {}", cli.container, cli.root.display());
        }
        Command::Ensure { partitions } => {
            for partition in &partitions {
                let lease = manager
                    .ensure(partition)
                    .await
                    .with_context(|| format!("ensure lease for partition {partition}"))?;
                println!("{lease}");
            }
        }
        Command::Show { partitions } => {
            let leases = manager
                .get_all(partitions, &CancellationToken::new())
                .await
                .context("read leases")?;
            for lease in leases {
                println!("{lease}");
            }
        }
        Command::Hold {
            partitions,
            renew_ms,
            advance,
        } => hold(&manager, owner, partitions, Duration::from_millis(renew_ms), advance).await?,
        Command::Checkpoint {
            partition,
            offset,
            sequence,
        } => {
            manager
                .attach(Arc::new(CliHost {
                    name: owner,
                    partitions: vec![partition.clone()],
                }))
                .context("attach host")?;
            manager
                .acquire(&partition)
                .await
                .with_context(|| format!("acquire partition {partition}"))?;
            manager
                .update_checkpoint(&partition, Checkpoint::new(offset, sequence, 0))
                .await?;
            let lease = manager
                .update(&partition)
                .await
                .with_context(|| format!("write checkpoint for partition {partition}"))?;
            manager.release(&partition).await?;
            manager.close().await;
            println!("{lease}");
        }
        Command::Delete { partition } => {
            manager
                .delete_lease(&partition)
                .await
                .with_context(|| format!("delete lease for partition {partition}"))?;
        }
        Command::Destroy => {
            manager.delete_store().await.context("delete container")?;
        }
    }
    Ok(())
}

async fn hold(
    manager: &LeaseManager,
    owner: String,
    partitions: Vec<String>,
    renew_every: Duration,
    advance: bool,
) -> Result<()> {
    if partitions.is_empty() {
        bail!("no partitions to hold");
    }
    manager.attach(Arc::new(CliHost {
        name: owner,
        partitions: partitions.clone(),
    }))?;
    for partition in &partitions {
        manager.ensure(partition).await?;
        let lease = manager
            .acquire(partition)
            .await
            .with_context(|| format!("acquire partition {partition}"))?;
        println!("{lease}");
    }

    let mut ticker = tokio::time::interval(renew_every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }
        for partition in manager.owned_partitions().await {
            match manager.renew(&partition).await {
                Ok(Some(_)) if advance => {
                    let current = manager.ensure_checkpoint(&partition).await;
                    let next = Checkpoint::new(
                        (current.sequence_number + 1).to_string(),
                        current.sequence_number + 1,
                        0,
                    );
                    manager.update_checkpoint(&partition, next).await?;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!("partition {partition} was taken over");
                    manager.forget(&partition).await;
                }
                Err(err) => warn!("renew of partition {partition} failed: {err}"),
            }
        }
        if manager.owned_partitions().await.is_empty() {
            warn!("no partitions left to hold");
            break;
        }
    }

    manager.close().await;
    for partition in manager.owned_partitions().await {
        // flush the latest checkpoint before giving the lease up
        if let Err(err) = manager.update(&partition).await {
            warn!("final checkpoint write for partition {partition} failed: {err}");
        }
        if let Err(err) = manager.release(&partition).await {
            warn!("release of partition {partition} failed: {err}");
        }
    }
    Ok(())
}
