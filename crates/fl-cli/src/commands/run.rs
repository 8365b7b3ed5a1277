//! `flowlink run` - submit a flow and stream its output

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use fl_client::{ConnectionManager, JobEvent};
use fl_core::{ClientConfig, JobKey};

pub async fn run(config: ClientConfig, address: &str, flow: &Path, detach: bool) -> Result<()> {
    let serialized = std::fs::read_to_string(flow)
        .with_context(|| format!("Failed to read flow file {}", flow.display()))?;

    let ack_timeout = config.connect_timeout;
    let manager = ConnectionManager::new(config);
    tracing::info!(address, flow = %flow.display(), "connecting");
    let endpoint = manager
        .connect(address)
        .await
        .with_context(|| format!("Failed to connect to '{address}'"))?;

    // subscribe before submitting so no output event is missed
    let mut events = manager.registry().subscribe();
    let submission = manager
        .submit(address, &serialized)
        .await
        .with_context(|| format!("Failed to submit flow to '{address}'"))?;

    // The job id is daemon-assigned; the acknowledgement carries it.
    // Backlog jobs listed concurrently cannot be mistaken for ours.
    let key = tokio::time::timeout(ack_timeout, submission.acknowledged())
        .await
        .context("Daemon did not acknowledge the submission")?
        .context("Connection lost before the submission was acknowledged")?;
    eprintln!("Job {key} started");

    if detach {
        manager.disconnect(address).await;
        return Ok(());
    }

    let mut state = endpoint.subscribe_state();
    tokio::select! {
        result = stream_job(&manager, &mut events, &key) => result?,
        _ = wait_for_disconnect(&mut state) => {
            anyhow::bail!("Connection to '{address}' lost before job {key} finished");
        }
    }
    manager.disconnect(address).await;
    Ok(())
}

async fn wait_for_disconnect(state: &mut tokio::sync::watch::Receiver<fl_core::ConnectionState>) {
    use fl_core::ConnectionState;
    loop {
        if matches!(
            *state.borrow_and_update(),
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Receive the next event, riding out channel lag. Missed events are
/// fine: output is re-read from the job record by offset.
async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<JobEvent>,
) -> Result<JobEvent> {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(event) => return Ok(event),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => anyhow::bail!("Connection closed before the job finished"),
        }
    }
}

/// Print the job's output as it arrives, until a terminal status.
async fn stream_job(
    manager: &ConnectionManager,
    events: &mut tokio::sync::broadcast::Receiver<JobEvent>,
    key: &JobKey,
) -> Result<()> {
    let job = manager
        .registry()
        .find(key)
        .context("Submitted job vanished from the registry")?;

    let mut printed = {
        let job = job.read().await;
        print!("{}", job.output);
        std::io::stdout().flush().ok();
        if job.status.is_terminal() {
            eprintln!("Job {key} {}", job.status);
            return Ok(());
        }
        job.output.len()
    };

    loop {
        match next_event(events).await? {
            JobEvent::OutputAppended(k) if &k == key => {
                let job = job.read().await;
                print!("{}", &job.output[printed..]);
                std::io::stdout().flush().ok();
                printed = job.output.len();
            }
            JobEvent::StatusChanged(k, status) if &k == key && status.is_terminal() => {
                let job = job.read().await;
                print!("{}", &job.output[printed..]);
                std::io::stdout().flush().ok();
                eprintln!("Job {key} {status}");
                return Ok(());
            }
            _ => {}
        }
    }
}
