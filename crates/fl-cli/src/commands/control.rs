//! `flowlink end` / `flowlink kill` - stop a running job

use anyhow::{Context, Result};

use fl_client::ConnectionManager;
use fl_core::{ClientConfig, JobKey};

pub async fn end(config: ClientConfig, address: &str, job_id: &str) -> Result<()> {
    let manager = ConnectionManager::new(config);
    manager
        .connect(address)
        .await
        .with_context(|| format!("Failed to connect to '{address}'"))?;

    let key = JobKey::new(address, job_id);
    manager
        .terminate_job(&key)
        .await
        .with_context(|| format!("Failed to end job {key}"))?;
    eprintln!("Asked '{address}' to end job {job_id}");

    manager.disconnect(address).await;
    Ok(())
}

pub async fn kill(config: ClientConfig, address: &str, job_id: &str) -> Result<()> {
    let manager = ConnectionManager::new(config);
    manager
        .connect(address)
        .await
        .with_context(|| format!("Failed to connect to '{address}'"))?;

    let key = JobKey::new(address, job_id);
    manager
        .kill_job(&key)
        .await
        .with_context(|| format!("Failed to kill job {key}"))?;
    eprintln!("Asked '{address}' to kill job {job_id}");

    manager.disconnect(address).await;
    Ok(())
}
