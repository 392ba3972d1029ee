//! Subcommand implementations

use std::time::Duration;

use clap::Args;
use tether_client::Coordinator;
use tether_common::{ClientConfig, DEFAULT_LEASE_TTL, wait_for_shutdown_signal};
use tether_store::EventType;
use tracing::info;

#[derive(Args, Debug)]
pub struct LockArgs {
    /// Lock name; keys are derived as `<name>.sync/...` or `<name>.lease`.
    #[arg(long)]
    pub name: String,

    /// Use a lease lock instead of a session lock.
    #[arg(long)]
    pub lease: bool,

    /// Value stored under a lease lock key.
    #[arg(long, default_value = "")]
    pub value: String,

    /// Lease TTL in seconds. Only 3600 is honored; anything else means 5.
    #[arg(long, default_value_t = DEFAULT_LEASE_TTL)]
    pub ttl: i64,

    /// Release after this many seconds instead of waiting for a signal.
    #[arg(long)]
    pub hold: Option<u64>,
}

pub async fn ping(config: ClientConfig) -> anyhow::Result<()> {
    Coordinator::connect(config).await?;
    println!("ok");
    Ok(())
}

pub async fn put(config: ClientConfig, key: &str, value: &str) -> anyhow::Result<()> {
    let coordinator = Coordinator::connect(config).await?;
    let revision = coordinator.put(key, value).await?;
    println!("revision {}", revision);
    Ok(())
}

pub async fn get(config: ClientConfig, key: &str, prefix: bool) -> anyhow::Result<()> {
    let coordinator = Coordinator::connect(config).await?;
    let (revision, kvs) = coordinator.get(key, prefix).await?;

    let mut entries: Vec<_> = kvs.into_iter().collect();
    entries.sort();
    for (key, value) in entries {
        println!("{} = {}", key, value);
    }
    info!(revision, "Read complete");
    Ok(())
}

pub async fn del(config: ClientConfig, key: &str, prefix: bool) -> anyhow::Result<()> {
    let coordinator = Coordinator::connect(config).await?;
    let deleted = coordinator.delete(key, prefix).await?;
    println!("deleted {}", deleted);
    Ok(())
}

pub async fn lock(config: ClientConfig, args: LockArgs) -> anyhow::Result<()> {
    let coordinator = Coordinator::connect(config).await?;
    hold_lock(&coordinator, &args).await
}

/// Acquire, hold and release one lock. A shutdown signal at any point runs
/// the exit chain so queued or held keys are released.
async fn hold_lock(coordinator: &Coordinator, args: &LockArgs) -> anyhow::Result<()> {
    let created = if args.lease {
        coordinator
            .create_lease_locker(&args.name, &args.value, args.ttl)
            .await
    } else {
        coordinator.create_session_locker(&args.name).await
    };
    if !created {
        anyhow::bail!("failed to create locker {}", args.name);
    }
    coordinator.add_exit_unlock();

    let acquired = tokio::select! {
        result = coordinator.lock() => Some(result),
        signal = wait_for_shutdown_signal() => {
            info!(signal, "Shutdown requested while acquiring {}", args.name);
            None
        }
    };

    let outcome: anyhow::Result<()> = match acquired {
        Some(Ok(())) => {
            println!("acquired {}", args.name);
            hold(args.hold).await;
            Ok(())
        }
        Some(Err(e)) => Err(e.into()),
        None => Ok(()),
    };

    coordinator.exit_chain().run().await;
    if outcome.is_ok() {
        println!("released {}", args.name);
    }
    outcome
}

/// Keep the lock for `secs` seconds, or until a shutdown signal if unset.
async fn hold(secs: Option<u64>) {
    let elapsed = async {
        match secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = elapsed => {}
        signal = wait_for_shutdown_signal() => info!(signal, "Shutdown requested"),
    }
}

pub async fn watch(config: ClientConfig, prefixes: Vec<String>) -> anyhow::Result<()> {
    let coordinator = Coordinator::connect(config).await?;

    for prefix in prefixes {
        coordinator.watch_register(prefix, |op: EventType, key: &str, value: &str| {
            match op {
                EventType::Put => println!("{} {} = {}", op, key, value),
                EventType::Delete => println!("{} {}", op, key),
            }
            true
        });
    }
    let tasks = coordinator.do_watch();
    info!(roots = ?tasks.roots(), "Watching");

    wait_for_shutdown_signal().await;
    tasks.abort();
    coordinator.exit_chain().run().await;
    Ok(())
}
