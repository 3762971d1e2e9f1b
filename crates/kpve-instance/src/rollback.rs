//! Compensating actions for a partially launched node
//!
//! Every side effect of a launch pushes the step that undoes it right after
//! it succeeds. A launch that reaches the end commits the stack and nothing
//! runs; any earlier exit unwinds it in reverse order. Undo failures are
//! logged and swallowed so they never replace the error that caused the
//! unwind.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kpve_common::poll::PollConfig;
use kpve_common::Error;
use kpve_pve::{
    wait_for_task, BootstrapTokenProvider, CapacityProvider, HypervisorClient, VmResourceOptions,
};

/// One undo step
#[derive(Clone, Debug, PartialEq)]
pub enum Compensation {
    /// Return a capacity reservation
    ReleaseCapacity {
        /// Region of the reservation
        region: String,
        /// Zone of the reservation
        zone: String,
        /// The reservation as granted
        options: VmResourceOptions,
    },
    /// Stop and delete a VM; a VM that is already gone counts as deleted
    DeleteVm {
        /// Zone hosting the VM
        zone: String,
        /// VM id
        vmid: u32,
    },
    /// Revoke a join token
    DeleteToken {
        /// Token id
        token_id: String,
    },
}

/// Collaborators the undo steps act on
pub struct RollbackContext<'a> {
    /// Hypervisor of the launch's region
    pub client: &'a dyn HypervisorClient,
    /// Capacity bookkeeping
    pub capacity: &'a dyn CapacityProvider,
    /// Join token issuer
    pub tokens: &'a dyn BootstrapTokenProvider,
    /// Bound on waits for hypervisor tasks
    pub poll: &'a PollConfig,
}

/// Undo steps of one launch, most recent last
#[derive(Debug, Default)]
pub struct RollbackStack {
    steps: Vec<Compensation>,
}

impl RollbackStack {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the undo step of a side effect that just succeeded
    pub fn push(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    /// Number of recorded steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The launch succeeded; drop every step without running it
    pub fn commit(self) {
        debug!(steps = self.steps.len(), "launch committed");
    }

    /// Run every step in reverse push order; returns how many failed
    ///
    /// Waits use their own cancellation token: a cancelled launch still
    /// cleans up after itself.
    pub async fn unwind(self, ctx: &RollbackContext<'_>) -> usize {
        let cancel = CancellationToken::new();
        let mut failed = 0;

        for step in self.steps.into_iter().rev() {
            if let Err(e) = run_step(ctx, &step, &cancel).await {
                warn!(step = ?step, error = %e, "rollback step failed");
                failed += 1;
            }
        }
        failed
    }
}

async fn run_step(
    ctx: &RollbackContext<'_>,
    step: &Compensation,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    match step {
        Compensation::ReleaseCapacity {
            region,
            zone,
            options,
        } => {
            ctx.capacity
                .release_capacity_in_zone(region, zone, options)
                .await?;
            debug!(region = %region, zone = %zone, vmid = options.vmid, "released reservation");
        }
        Compensation::DeleteVm { zone, vmid } => {
            // A clone that never booted refuses to stop; that is fine
            match ctx.client.stop_vm(zone, *vmid).await {
                Ok(task) => {
                    if let Err(e) = wait_for_task(ctx.client, zone, &task, ctx.poll, cancel).await {
                        debug!(zone = %zone, vmid = *vmid, error = %e, "stop before delete failed");
                    }
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => debug!(zone = %zone, vmid = *vmid, error = %e, "stop before delete failed"),
            }

            match ctx.client.delete_vm(zone, *vmid).await {
                Ok(task) => wait_for_task(ctx.client, zone, &task, ctx.poll, cancel).await?,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            debug!(zone = %zone, vmid = *vmid, "deleted partial vm");
        }
        Compensation::DeleteToken { token_id } => {
            ctx.tokens.delete(token_id).await?;
            debug!(token_id = %token_id, "revoked join token");
        }
    }
    Ok(())
}
