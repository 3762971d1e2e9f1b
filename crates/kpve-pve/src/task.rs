//! Waiting on hypervisor tasks

use kpve_common::poll::{poll_until, PollConfig};
use kpve_common::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{HypervisorClient, TaskId, TaskStatus};

/// Wait for a task to stop and return its final status, whatever the outcome
pub async fn wait_for_task_status(
    client: &dyn HypervisorClient,
    zone: &str,
    task: &TaskId,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> Result<TaskStatus, Error> {
    let operation = format!("task {}", task);
    poll_until(config, &operation, cancel, move || async move {
        let status = client.task_status(zone, task).await?;
        Ok(status.is_finished().then_some(status))
    })
    .await
}

/// Wait for a task to stop; anything but a successful exit is an error
pub async fn wait_for_task(
    client: &dyn HypervisorClient,
    zone: &str,
    task: &TaskId,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let status = wait_for_task_status(client, zone, task, config, cancel).await?;
    if status.is_success() {
        debug!(zone = %zone, task = %task, "task finished");
        return Ok(());
    }

    Err(Error::infrastructure(
        format!("task {}", task),
        status
            .exit_status
            .unwrap_or_else(|| "stopped without exit status".to_string()),
    ))
}
