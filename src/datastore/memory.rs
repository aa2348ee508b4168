//! In-memory `Datastore` test double.
//!
//! Backs every table with a `Mutex<HashMap<..>>`. Used by the executor,
//! command intake, and logger unit tests in place of a Postgres instance;
//! not wired into `main.rs`.

use super::Datastore;
use crate::error::{CoreError, CoreResult};
use crate::model::{
    AuditRecord, CommandStatus, Machine, MachineState, MachineStatus, Parameter,
    ParameterDataPoint, ProcessExecution, ProcessExecutionState, ProcessStatus, PurgeStepConfig,
    Recipe, RecipeCommand, RecipeStep, SetParameterStepConfig, ValveStepConfig, LoopStepConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryDatastore {
    machines: Mutex<HashMap<Uuid, Machine>>,
    machine_states: Mutex<HashMap<Uuid, MachineState>>,
    recipes: Mutex<HashMap<Uuid, Recipe>>,
    recipe_steps: Mutex<HashMap<Uuid, Vec<RecipeStep>>>,
    valve_configs: Mutex<HashMap<Uuid, ValveStepConfig>>,
    purge_configs: Mutex<HashMap<Uuid, PurgeStepConfig>>,
    loop_configs: Mutex<HashMap<Uuid, LoopStepConfig>>,
    set_parameter_configs: Mutex<HashMap<Uuid, SetParameterStepConfig>>,
    process_executions: Mutex<HashMap<Uuid, ProcessExecution>>,
    process_execution_states: Mutex<HashMap<Uuid, ProcessExecutionState>>,
    parameters: Mutex<HashMap<Uuid, Parameter>>,
    commands: Mutex<HashMap<Uuid, RecipeCommand>>,
    audit_records: Mutex<Vec<AuditRecord>>,
    global_points: Mutex<Vec<ParameterDataPoint>>,
    process_points: Mutex<Vec<ParameterDataPoint>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_machine(&self, machine: Machine, state: MachineState) {
        let id = machine.machine_id;
        self.machines.lock().unwrap().insert(id, machine);
        self.machine_states.lock().unwrap().insert(id, state);
    }

    pub fn seed_recipe(&self, recipe: Recipe, steps: Vec<RecipeStep>) {
        let id = recipe.id;
        self.recipes.lock().unwrap().insert(id, recipe);
        self.recipe_steps.lock().unwrap().insert(id, steps);
    }

    pub fn seed_valve_config(&self, cfg: ValveStepConfig) {
        self.valve_configs.lock().unwrap().insert(cfg.step_id, cfg);
    }

    pub fn seed_purge_config(&self, cfg: PurgeStepConfig) {
        self.purge_configs.lock().unwrap().insert(cfg.step_id, cfg.clone());
    }

    pub fn seed_loop_config(&self, cfg: LoopStepConfig) {
        self.loop_configs.lock().unwrap().insert(cfg.step_id, cfg);
    }

    pub fn seed_set_parameter_config(&self, cfg: SetParameterStepConfig) {
        self.set_parameter_configs.lock().unwrap().insert(cfg.step_id, cfg);
    }

    pub fn seed_parameter(&self, parameter: Parameter) {
        self.parameters.lock().unwrap().insert(parameter.parameter_id, parameter);
    }

    pub fn seed_command(&self, command: RecipeCommand) {
        self.commands.lock().unwrap().insert(command.command_id, command);
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit_records.lock().unwrap().clone()
    }

    pub fn global_points(&self) -> Vec<ParameterDataPoint> {
        self.global_points.lock().unwrap().clone()
    }

    pub fn process_points(&self) -> Vec<ParameterDataPoint> {
        self.process_points.lock().unwrap().clone()
    }
}

fn not_found(what: &str, id: Uuid) -> CoreError {
    CoreError::DatastoreTransient(format!("{what} {id} not found"))
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get_machine(&self, machine_id: Uuid) -> CoreResult<Machine> {
        self.machines
            .lock()
            .unwrap()
            .get(&machine_id)
            .cloned()
            .ok_or_else(|| not_found("machine", machine_id))
    }

    async fn get_machine_state(&self, machine_id: Uuid) -> CoreResult<MachineState> {
        self.machine_states
            .lock()
            .unwrap()
            .get(&machine_id)
            .cloned()
            .ok_or_else(|| not_found("machine_state", machine_id))
    }

    async fn atomic_to_processing(&self, machine_id: Uuid, process_id: Uuid) -> CoreResult<()> {
        let mut machines = self.machines.lock().unwrap();
        let mut states = self.machine_states.lock().unwrap();
        let machine = machines
            .get_mut(&machine_id)
            .ok_or_else(|| not_found("machine", machine_id))?;
        let state = states
            .get_mut(&machine_id)
            .ok_or_else(|| not_found("machine_state", machine_id))?;

        if !matches!(machine.status, MachineStatus::Idle | MachineStatus::Offline)
            || machine.current_process_id.is_some()
        {
            return Err(CoreError::MachineBusy(machine_id.to_string()));
        }

        machine.status = MachineStatus::Processing;
        machine.current_process_id = Some(process_id);
        state.current_state = MachineStatus::Processing;
        state.process_id = Some(process_id);
        state.is_failure_mode = false;
        state.failure_description = None;
        Ok(())
    }

    async fn atomic_to_idle(&self, machine_id: Uuid) -> CoreResult<()> {
        let mut machines = self.machines.lock().unwrap();
        let mut states = self.machine_states.lock().unwrap();
        let machine = machines
            .get_mut(&machine_id)
            .ok_or_else(|| not_found("machine", machine_id))?;
        let state = states
            .get_mut(&machine_id)
            .ok_or_else(|| not_found("machine_state", machine_id))?;

        machine.status = MachineStatus::Idle;
        machine.current_process_id = None;
        state.current_state = MachineStatus::Idle;
        state.process_id = None;
        state.is_failure_mode = false;
        state.failure_description = None;
        Ok(())
    }

    async fn atomic_to_error(&self, machine_id: Uuid, description: &str) -> CoreResult<()> {
        let mut machines = self.machines.lock().unwrap();
        let mut states = self.machine_states.lock().unwrap();
        let machine = machines
            .get_mut(&machine_id)
            .ok_or_else(|| not_found("machine", machine_id))?;
        let state = states
            .get_mut(&machine_id)
            .ok_or_else(|| not_found("machine_state", machine_id))?;

        machine.status = MachineStatus::Error;
        machine.current_process_id = None;
        state.current_state = MachineStatus::Error;
        state.process_id = None;
        state.is_failure_mode = true;
        state.failure_description = Some(description.to_string());
        Ok(())
    }

    async fn get_recipe(&self, recipe_id: Uuid) -> CoreResult<Recipe> {
        self.recipes
            .lock()
            .unwrap()
            .get(&recipe_id)
            .cloned()
            .ok_or_else(|| not_found("recipe", recipe_id))
    }

    async fn get_recipe_steps(&self, recipe_id: Uuid) -> CoreResult<Vec<RecipeStep>> {
        Ok(self
            .recipe_steps
            .lock()
            .unwrap()
            .get(&recipe_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_valve_step_config(&self, step_id: Uuid) -> CoreResult<Option<ValveStepConfig>> {
        Ok(self.valve_configs.lock().unwrap().get(&step_id).copied())
    }

    async fn get_purge_step_config(&self, step_id: Uuid) -> CoreResult<Option<PurgeStepConfig>> {
        Ok(self.purge_configs.lock().unwrap().get(&step_id).cloned())
    }

    async fn get_loop_step_config(&self, step_id: Uuid) -> CoreResult<Option<LoopStepConfig>> {
        Ok(self.loop_configs.lock().unwrap().get(&step_id).copied())
    }

    async fn get_set_parameter_step_config(
        &self,
        step_id: Uuid,
    ) -> CoreResult<Option<SetParameterStepConfig>> {
        Ok(self.set_parameter_configs.lock().unwrap().get(&step_id).copied())
    }

    async fn create_process_execution(&self, execution: ProcessExecution) -> CoreResult<()> {
        let id = execution.process_id;
        self.process_executions.lock().unwrap().insert(id, execution);
        Ok(())
    }

    async fn get_process_execution(&self, process_id: Uuid) -> CoreResult<ProcessExecution> {
        self.process_executions
            .lock()
            .unwrap()
            .get(&process_id)
            .cloned()
            .ok_or_else(|| not_found("process_execution", process_id))
    }

    async fn touch_process_execution(&self, process_id: Uuid) -> CoreResult<()> {
        let mut executions = self.process_executions.lock().unwrap();
        let execution = executions
            .get_mut(&process_id)
            .ok_or_else(|| not_found("process_execution", process_id))?;
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_process_execution(
        &self,
        process_id: Uuid,
        end_time: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut executions = self.process_executions.lock().unwrap();
        let execution = executions
            .get_mut(&process_id)
            .ok_or_else(|| not_found("process_execution", process_id))?;
        execution.status = ProcessStatus::Completed;
        execution.end_time = Some(end_time);
        execution.updated_at = end_time;
        Ok(())
    }

    async fn fail_process_execution(&self, process_id: Uuid, error_message: &str) -> CoreResult<()> {
        let mut executions = self.process_executions.lock().unwrap();
        let execution = executions
            .get_mut(&process_id)
            .ok_or_else(|| not_found("process_execution", process_id))?;
        execution.status = ProcessStatus::Failed;
        execution.error_message = Some(error_message.to_string());
        execution.end_time = Some(Utc::now());
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn stop_process_execution(&self, process_id: Uuid) -> CoreResult<()> {
        let mut executions = self.process_executions.lock().unwrap();
        let execution = executions
            .get_mut(&process_id)
            .ok_or_else(|| not_found("process_execution", process_id))?;
        execution.status = ProcessStatus::Stopped;
        execution.end_time = Some(Utc::now());
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn ensure_process_execution_state(&self, execution_id: Uuid) -> CoreResult<()> {
        let mut states = self.process_execution_states.lock().unwrap();
        states.entry(execution_id).or_insert_with(|| ProcessExecutionState {
            execution_id,
            current_step_index: 0,
            current_overall_step: 0,
            total_overall_steps: 0,
            current_step_type: crate::model::CurrentStepType::Setup,
            current_step_name: String::new(),
            current_valve_number: None,
            current_valve_duration_ms: None,
            current_purge_duration_ms: None,
            current_loop_count: None,
            current_loop_iteration: None,
            current_parameter_id: None,
            current_parameter_value: None,
            progress: crate::model::Progress::default(),
            last_updated: Utc::now(),
        });
        Ok(())
    }

    async fn get_process_execution_state(
        &self,
        execution_id: Uuid,
    ) -> CoreResult<ProcessExecutionState> {
        self.process_execution_states
            .lock()
            .unwrap()
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| not_found("process_execution_state", execution_id))
    }

    async fn update_process_execution_state(&self, state: ProcessExecutionState) -> CoreResult<()> {
        self.process_execution_states
            .lock()
            .unwrap()
            .insert(state.execution_id, state);
        Ok(())
    }

    async fn get_parameter(&self, parameter_id: Uuid) -> CoreResult<Parameter> {
        self.parameters
            .lock()
            .unwrap()
            .get(&parameter_id)
            .cloned()
            .ok_or_else(|| not_found("parameter", parameter_id))
    }

    async fn get_all_parameters(&self) -> CoreResult<Vec<Parameter>> {
        Ok(self.parameters.lock().unwrap().values().cloned().collect())
    }

    async fn find_parameter_by_name(&self, name: &str) -> CoreResult<Vec<Parameter>> {
        Ok(self
            .parameters
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.name == name)
            .cloned()
            .collect())
    }

    async fn find_parameter_by_write_address(&self, address: u16) -> CoreResult<Option<Parameter>> {
        Ok(self
            .parameters
            .lock()
            .unwrap()
            .values()
            .find(|p| p.write_modbus_address == Some(address))
            .cloned())
    }

    async fn update_parameter_set_value(&self, parameter_id: Uuid, value: f64) -> CoreResult<()> {
        let mut parameters = self.parameters.lock().unwrap();
        let parameter = parameters
            .get_mut(&parameter_id)
            .ok_or_else(|| not_found("parameter", parameter_id))?;
        parameter.set_value = Some(value);
        Ok(())
    }

    async fn fetch_pending_commands(&self, machine_id: Uuid) -> CoreResult<Vec<RecipeCommand>> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.machine_id == machine_id && c.status == CommandStatus::Pending)
            .cloned()
            .collect())
    }

    async fn try_claim_command(&self, command_id: Uuid) -> CoreResult<bool> {
        let mut commands = self.commands.lock().unwrap();
        let command = commands
            .get_mut(&command_id)
            .ok_or_else(|| not_found("recipe_command", command_id))?;
        if command.status != CommandStatus::Pending {
            return Ok(false);
        }
        command.status = CommandStatus::Processing;
        Ok(true)
    }

    async fn finalize_command(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error_message: Option<String>,
        executed_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut commands = self.commands.lock().unwrap();
        let command = commands
            .get_mut(&command_id)
            .ok_or_else(|| not_found("recipe_command", command_id))?;
        command.status = status;
        command.error_message = error_message;
        command.executed_at = Some(executed_at);
        Ok(())
    }

    async fn insert_audit_record(&self, record: AuditRecord) -> CoreResult<()> {
        self.audit_records.lock().unwrap().push(record);
        Ok(())
    }

    async fn insert_global_data_points(&self, points: &[ParameterDataPoint]) -> CoreResult<()> {
        self.global_points.lock().unwrap().extend_from_slice(points);
        Ok(())
    }

    async fn insert_process_data_points(&self, points: &[ParameterDataPoint]) -> CoreResult<()> {
        self.process_points.lock().unwrap().extend_from_slice(points);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(id: Uuid) -> (Machine, MachineState) {
        (
            Machine { machine_id: id, status: MachineStatus::Idle, current_process_id: None, current_operator_id: None },
            MachineState { machine_id: id, current_state: MachineStatus::Idle, process_id: None, is_failure_mode: false, failure_description: None },
        )
    }

    #[tokio::test]
    async fn to_processing_rejects_when_already_bound() {
        let ds = MemoryDatastore::new();
        let machine_id = Uuid::new_v4();
        let (m, s) = machine(machine_id);
        ds.seed_machine(m, s);
        ds.atomic_to_processing(machine_id, Uuid::new_v4()).await.unwrap();
        let result = ds.atomic_to_processing(machine_id, Uuid::new_v4()).await;
        assert!(matches!(result, Err(CoreError::MachineBusy(_))));
    }

    #[tokio::test]
    async fn to_idle_clears_binding_and_failure_mode() {
        let ds = MemoryDatastore::new();
        let machine_id = Uuid::new_v4();
        let (m, s) = machine(machine_id);
        ds.seed_machine(m, s);
        let process_id = Uuid::new_v4();
        ds.atomic_to_processing(machine_id, process_id).await.unwrap();
        ds.atomic_to_error(machine_id, "boom").await.unwrap();
        ds.atomic_to_idle(machine_id).await.unwrap();
        let state = ds.get_machine_state(machine_id).await.unwrap();
        assert!(!state.is_failure_mode);
        assert!(state.process_id.is_none());
    }

    #[tokio::test]
    async fn claim_command_is_single_winner() {
        let ds = MemoryDatastore::new();
        let command_id = Uuid::new_v4();
        ds.seed_command(RecipeCommand {
            command_id,
            machine_id: Uuid::new_v4(),
            command_type: crate::model::CommandType::StartRecipe,
            parameters: serde_json::json!({}),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            executed_at: None,
            error_message: None,
        });
        assert!(ds.try_claim_command(command_id).await.unwrap());
        assert!(!ds.try_claim_command(command_id).await.unwrap());
    }
}
