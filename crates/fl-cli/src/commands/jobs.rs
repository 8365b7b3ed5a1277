//! `flowlink jobs` - list the jobs a daemon is tracking

use std::time::Duration;

use anyhow::{Context, Result};

use fl_client::ConnectionManager;
use fl_core::ClientConfig;

/// How long the job backlog may stay quiet before it is considered
/// fully delivered. The daemon streams its list with no end marker.
const SETTLE: Duration = Duration::from_millis(800);

pub async fn jobs(config: ClientConfig, address: &str) -> Result<()> {
    let manager = ConnectionManager::new(config);
    let mut events = manager.registry().subscribe();
    manager
        .connect(address)
        .await
        .with_context(|| format!("Failed to connect to '{address}'"))?;

    // login triggers the backlog; wait until it stops arriving
    while tokio::time::timeout(SETTLE, events.recv()).await.is_ok() {}

    let jobs = manager.registry().jobs_for(address);
    if jobs.is_empty() {
        println!("No jobs on '{address}'");
    } else {
        println!("{:<8} {:<10} {:<28} {}", "ID", "STATUS", "TITLE", "STARTED");
        for job in &jobs {
            let job = job.read().await;
            println!(
                "{:<8} {:<10} {:<28} {}",
                job.key.id, job.status, job.title, job.started_at
            );
        }
    }

    manager.disconnect(address).await;
    Ok(())
}
