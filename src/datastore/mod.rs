//! Datastore collaborator trait.
//!
//! The datastore is treated as an external collaborator
//! (spec.md §1, §6): a rowstore offering transactional single-table
//! inserts/updates, batched inserts, stored-procedure calls, and a
//! change-feed/poll subscription on `recipe_commands`. `Datastore` captures
//! exactly the operations the core depends on; credential/config loading and
//! realtime subscription plumbing are out of scope, so `subscribe_commands`
//! is specified as "poll on an interval", leaving a push-based
//! implementation as an internal detail of a concrete `Datastore`.

pub mod memory;
pub mod postgres;

use crate::error::CoreResult;
use crate::model::{
    AuditRecord, CommandStatus, Machine, MachineState, Parameter, ParameterDataPoint,
    ProcessExecution, ProcessExecutionState, ProcessStatus, PurgeStepConfig, Recipe,
    RecipeCommand, RecipeStep, SetParameterStepConfig, ValveStepConfig, LoopStepConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait Datastore: Send + Sync {
    // -- machines / machine_state (read-only here; all writes go through
    //    the three atomic_* calls, matching §4.B's single-writer rule) --
    async fn get_machine(&self, machine_id: Uuid) -> CoreResult<Machine>;
    async fn get_machine_state(&self, machine_id: Uuid) -> CoreResult<MachineState>;

    /// `atomic_processing_machine_state`: binds `process_id` to the machine
    /// and moves both rows to `processing`, re-checking `status` and
    /// `current_process_id` inside the atomic section. Fails with
    /// `CoreError::MachineBusy` if the machine is not `{idle, offline}` or
    /// already has a bound process.
    async fn atomic_to_processing(&self, machine_id: Uuid, process_id: Uuid) -> CoreResult<()>;

    /// `atomic_complete_machine_state`: clears the process binding and
    /// returns both rows to `idle`, clearing failure fields.
    async fn atomic_to_idle(&self, machine_id: Uuid) -> CoreResult<()>;

    /// `atomic_error_machine_state`: moves both rows to `error`, clears the
    /// process binding, records `failure_description`.
    async fn atomic_to_error(&self, machine_id: Uuid, description: &str) -> CoreResult<()>;

    // -- recipes / recipe_steps / sibling config tables --
    async fn get_recipe(&self, recipe_id: Uuid) -> CoreResult<Recipe>;
    async fn get_recipe_steps(&self, recipe_id: Uuid) -> CoreResult<Vec<RecipeStep>>;
    async fn get_valve_step_config(&self, step_id: Uuid) -> CoreResult<Option<ValveStepConfig>>;
    async fn get_purge_step_config(&self, step_id: Uuid) -> CoreResult<Option<PurgeStepConfig>>;
    async fn get_loop_step_config(&self, step_id: Uuid) -> CoreResult<Option<LoopStepConfig>>;
    async fn get_set_parameter_step_config(
        &self,
        step_id: Uuid,
    ) -> CoreResult<Option<SetParameterStepConfig>>;

    // -- process_executions / process_execution_state --
    async fn create_process_execution(&self, execution: ProcessExecution) -> CoreResult<()>;
    async fn get_process_execution(&self, process_id: Uuid) -> CoreResult<ProcessExecution>;
    async fn touch_process_execution(&self, process_id: Uuid) -> CoreResult<()>;
    async fn complete_process_execution(&self, process_id: Uuid, end_time: DateTime<Utc>) -> CoreResult<()>;
    async fn fail_process_execution(&self, process_id: Uuid, error_message: &str) -> CoreResult<()>;
    async fn stop_process_execution(&self, process_id: Uuid) -> CoreResult<()>;

    /// Creates the row if absent, tolerating a datastore trigger that may
    /// already have created it (spec §3 lifecycle note).
    async fn ensure_process_execution_state(&self, execution_id: Uuid) -> CoreResult<()>;
    async fn get_process_execution_state(
        &self,
        execution_id: Uuid,
    ) -> CoreResult<ProcessExecutionState>;
    async fn update_process_execution_state(
        &self,
        state: ProcessExecutionState,
    ) -> CoreResult<()>;

    // -- component_parameters --
    async fn get_parameter(&self, parameter_id: Uuid) -> CoreResult<Parameter>;
    async fn get_all_parameters(&self) -> CoreResult<Vec<Parameter>>;
    async fn find_parameter_by_name(&self, name: &str) -> CoreResult<Vec<Parameter>>;
    async fn find_parameter_by_write_address(&self, address: u16) -> CoreResult<Option<Parameter>>;
    async fn update_parameter_set_value(&self, parameter_id: Uuid, value: f64) -> CoreResult<()>;

    // -- recipe_commands --
    async fn fetch_pending_commands(&self, machine_id: Uuid) -> CoreResult<Vec<RecipeCommand>>;
    /// Idempotent claim: only the caller that wins the `pending -> processing`
    /// transition proceeds (spec §4.E).
    async fn try_claim_command(&self, command_id: Uuid) -> CoreResult<bool>;
    async fn finalize_command(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error_message: Option<String>,
        executed_at: DateTime<Utc>,
    ) -> CoreResult<()>;

    // -- parameter_control_commands (audit sibling) --
    async fn insert_audit_record(&self, record: AuditRecord) -> CoreResult<()>;

    // -- parameter_value_history / process_data_points --
    async fn insert_global_data_points(&self, points: &[ParameterDataPoint]) -> CoreResult<()>;
    async fn insert_process_data_points(&self, points: &[ParameterDataPoint]) -> CoreResult<()>;
}

/// Helper re-exported for callers that need to construct a fresh "running"
/// `ProcessExecution` and don't want to repeat its boilerplate defaults.
pub fn process_status_is_terminal(status: ProcessStatus) -> bool {
    matches!(
        status,
        ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Stopped
    )
}
