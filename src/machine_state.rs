//! Machine-State Authority (spec §4.B).
//!
//! The single chokepoint for every mutation of `(Machine.status,
//! Machine.current_process_id)` and the sibling `MachineState` row. This
//! module is a thin typed wrapper over the three `Datastore::atomic_*` calls
//! — the actual all-or-nothing guarantee lives in the datastore (stored
//! procedures for `PostgresDatastore`, direct double-mutation under one lock
//! for `MemoryDatastore`) — plus the startup reconciliation pass spec §7
//! requires.

use crate::datastore::Datastore;
use crate::error::CoreResult;
use crate::model::{MachineStatus, ProcessStatus};
use tracing::warn;
use uuid::Uuid;

pub struct MachineStateAuthority<'a> {
    datastore: &'a dyn Datastore,
}

impl<'a> MachineStateAuthority<'a> {
    pub fn new(datastore: &'a dyn Datastore) -> Self {
        Self { datastore }
    }

    /// Accepted only when the machine is `{idle, offline}` with no bound
    /// process; re-checked inside the atomic section by the datastore
    /// (the race guard spec §4.B calls out explicitly).
    pub async fn to_processing(&self, machine_id: Uuid, process_id: Uuid) -> CoreResult<()> {
        self.datastore.atomic_to_processing(machine_id, process_id).await
    }

    pub async fn to_idle(&self, machine_id: Uuid) -> CoreResult<()> {
        self.datastore.atomic_to_idle(machine_id).await
    }

    pub async fn to_error(&self, machine_id: Uuid, description: &str) -> CoreResult<()> {
        self.datastore.atomic_to_error(machine_id, description).await
    }

    /// Startup reconciliation (spec §7): if `Machine` and `MachineState`
    /// disagree, or `status = processing` with no corresponding running
    /// `ProcessExecution`, force both rows to `idle`. No partial run is ever
    /// resumed — an orphaned `running` execution is marked `failed`.
    pub async fn reconcile_at_startup(&self, machine_id: Uuid) -> CoreResult<()> {
        let machine = self.datastore.get_machine(machine_id).await?;
        let state = self.datastore.get_machine_state(machine_id).await?;

        let rows_agree = machine.status == state.current_state
            && machine.current_process_id == state.process_id;

        let orphaned_process = if let Some(process_id) = machine.current_process_id {
            match self.datastore.get_process_execution(process_id).await {
                Ok(execution) if execution.status == ProcessStatus::Running => {
                    self.datastore
                        .fail_process_execution(process_id, "orphaned at process startup, no resumable state")
                        .await?;
                    true
                }
                _ => false,
            }
        } else {
            false
        };

        if !rows_agree || orphaned_process || machine.status == MachineStatus::Processing {
            warn!(
                machine_id = %machine_id,
                rows_agree,
                orphaned_process,
                "reconciling machine state to idle at startup"
            );
            self.datastore.atomic_to_idle(machine_id).await?;
        }

        Ok(())
    }
}
