//! Command Intake (spec §4.E).
//!
//! Polls `recipe_commands` for this machine on an interval (a push-based
//! change feed is a concrete `Datastore`'s internal detail — see
//! `crate::datastore`'s doc comment), claims each pending row with the
//! idempotent `pending -> processing` guard, then validates/authenticates/
//! executes/finalizes it. Every claimed command is handled on its own
//! `tokio::spawn`ed task so a `stop_recipe` is never serialized behind a
//! still-running `start_recipe` — the concurrency guarantee spec §4.E calls
//! out by name. Grounded on
//! `original_source/src/command_flow/processor.py`'s `process_command`
//! (route by type, `update_command_status` on success/failure) and
//! `validate_machine_available_for_recipe` (the race guard the
//! Machine-State Authority now closes atomically).

use crate::audit::AuditWriter;
use crate::cache::ParameterCache;
use crate::cancellation::CancellationRegistry;
use crate::datastore::Datastore;
use crate::error::{CoreError, CoreResult};
use crate::executor::{resolve_operator_id, RecipeExecutor, RecordOnce};
use crate::machine_state::MachineStateAuthority;
use crate::model::{CommandStatus, CommandType, RecipeCommand};
use crate::plc::Plc;
use crate::steps;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Operator-authentication collaborator (spec §4.E step 2). Real
/// authentication is out of scope (spec.md §1 Non-goals: "No opinion is
/// given on authentication"), so Command Intake calls through this seam
/// rather than assuming a provider; [`AllowAllAuthenticator`] is the only
/// implementation this crate ships.
#[async_trait]
pub trait OperatorAuthenticator: Send + Sync {
    async fn authenticate(&self, operator_id: Option<Uuid>) -> bool;
}

/// Every command proceeds regardless of `operator_id`. The default (and
/// only) implementation until a real operator-identity service is wired in.
pub struct AllowAllAuthenticator;

#[async_trait]
impl OperatorAuthenticator for AllowAllAuthenticator {
    async fn authenticate(&self, _operator_id: Option<Uuid>) -> bool {
        true
    }
}

/// Resolves a `set_parameter` command's target parameter by the priority
/// spec §6 requires: explicit `write_modbus_address`, then
/// `component_parameter_id`/`parameter_id`, then `name` (warning and first
/// match on multiple name matches).
async fn resolve_parameter_id(
    datastore: &dyn Datastore,
    payload: &serde_json::Value,
) -> CoreResult<Uuid> {
    if let Some(address) = payload.get("write_modbus_address").and_then(|v| v.as_u64()) {
        let address = address as u16;
        return datastore
            .find_parameter_by_write_address(address)
            .await?
            .map(|p| p.parameter_id)
            .ok_or_else(|| {
                CoreError::ValidationError(format!("no parameter with write_modbus_address {address}"))
            });
    }

    if let Some(id) = payload
        .get("component_parameter_id")
        .or_else(|| payload.get("parameter_id"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Uuid>().ok())
    {
        return Ok(id);
    }

    if let Some(name) = payload.get("name").and_then(|v| v.as_str()) {
        let matches = datastore.find_parameter_by_name(name).await?;
        return match matches.len() {
            0 => Err(CoreError::ValidationError(format!("no parameter named '{name}'"))),
            1 => Ok(matches[0].parameter_id),
            _ => {
                warn!(name, matches = matches.len(), "set_parameter name resolves to multiple parameters, using first");
                Ok(matches[0].parameter_id)
            }
        };
    }

    Err(CoreError::ValidationError(
        "set_parameter payload has no write_modbus_address/component_parameter_id/name".into(),
    ))
}

fn parse_uuid_field(payload: &serde_json::Value, field: &str) -> Option<Uuid> {
    payload.get(field).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

/// Poll/claim/dispatch loop for one machine's `recipe_commands`. Cheap to
/// clone: every field is an `Arc` or an already-`Clone` handle, so each
/// claimed command's `tokio::spawn`ed task owns an independent clone rather
/// than borrowing `self`.
#[derive(Clone)]
pub struct CommandIntake {
    datastore: Arc<dyn Datastore>,
    plc: Arc<dyn Plc>,
    cancellation: Arc<CancellationRegistry>,
    cache: Arc<ParameterCache>,
    audit: AuditWriter,
    authenticator: Arc<dyn OperatorAuthenticator>,
    recorder: Option<Arc<dyn RecordOnce>>,
    machine_id: Uuid,
}

impl CommandIntake {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        datastore: Arc<dyn Datastore>,
        plc: Arc<dyn Plc>,
        cancellation: Arc<CancellationRegistry>,
        cache: Arc<ParameterCache>,
        audit: AuditWriter,
        authenticator: Arc<dyn OperatorAuthenticator>,
        recorder: Option<Arc<dyn RecordOnce>>,
        machine_id: Uuid,
    ) -> Self {
        Self { datastore, plc, cancellation, cache, audit, authenticator, recorder, machine_id }
    }

    /// Runs forever, polling every `poll_interval_ms`. A failed poll is
    /// logged and retried on the next tick rather than aborting the loop.
    pub async fn run_forever(&self, poll_interval_ms: u64) -> ! {
        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "command intake poll failed");
            }
            tokio::time::sleep(std::time::Duration::from_millis(poll_interval_ms)).await;
        }
    }

    /// Fetches pending commands for this machine and spawns one task per
    /// command. Returns once every command has been handed off, not once
    /// they've finished — that's the point.
    pub async fn poll_once(&self) -> CoreResult<()> {
        let commands = self.datastore.fetch_pending_commands(self.machine_id).await?;
        for command in commands {
            let intake = self.clone();
            tokio::spawn(async move { intake.handle_command(command).await });
        }
        Ok(())
    }

    async fn handle_command(&self, command: RecipeCommand) {
        match self.datastore.try_claim_command(command.command_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(command_id = %command.command_id, error = %e, "failed to claim command");
                return;
            }
        }

        let result = self.process_claimed_command(&command).await;
        let (status, error_message) = match result {
            Ok(()) => (CommandStatus::Completed, None),
            Err(e) => {
                warn!(command_id = %command.command_id, error = %e, "command execution failed");
                (CommandStatus::Error, Some(e.to_string()))
            }
        };

        if let Err(e) = self
            .datastore
            .finalize_command(command.command_id, status, error_message, Utc::now())
            .await
        {
            error!(command_id = %command.command_id, error = %e, "failed to finalize command");
        }
    }

    async fn process_claimed_command(&self, command: &RecipeCommand) -> CoreResult<()> {
        let operator_id = parse_uuid_field(&command.parameters, "operator_id");
        if !self.authenticator.authenticate(operator_id).await {
            return Err(CoreError::ValidationError("operator authentication failed".into()));
        }

        match command.command_type {
            CommandType::StartRecipe => self.start_recipe(command, operator_id).await,
            CommandType::StopRecipe => self.stop_recipe(command).await,
            CommandType::SetParameter => self.set_parameter(command).await,
        }
    }

    async fn start_recipe(&self, command: &RecipeCommand, operator_id: Option<Uuid>) -> CoreResult<()> {
        let recipe_id = parse_uuid_field(&command.parameters, "recipe_id")
            .ok_or_else(|| CoreError::ValidationError("start_recipe missing recipe_id".into()))?;

        let parameters_override: HashMap<String, f64> = command
            .parameters
            .get("parameters_override")
            .and_then(|v| v.as_object())
            .map(|obj| obj.iter().filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f))).collect())
            .unwrap_or_default();

        let machine = self.datastore.get_machine(self.machine_id).await?;
        let resolved_operator_id = resolve_operator_id(operator_id, machine.current_operator_id);

        let process_id = Uuid::new_v4();
        let machine_state = MachineStateAuthority::new(self.datastore.as_ref());
        machine_state.to_processing(self.machine_id, process_id).await?;

        let executor = RecipeExecutor {
            datastore: self.datastore.as_ref(),
            plc: self.plc.as_ref(),
            cancellation: self.cancellation.as_ref(),
            cache: self.cache.as_ref(),
            audit: &self.audit,
            machine_state: &machine_state,
            recorder: self.recorder.clone(),
        };

        executor
            .start_recipe(self.machine_id, process_id, recipe_id, resolved_operator_id, None, parameters_override)
            .await
    }

    async fn stop_recipe(&self, command: &RecipeCommand) -> CoreResult<()> {
        let process_id = parse_uuid_field(&command.parameters, "process_id")
            .ok_or_else(|| CoreError::ValidationError("stop_recipe missing process_id".into()))?;
        self.cancellation.cancel(process_id);
        Ok(())
    }

    async fn set_parameter(&self, command: &RecipeCommand) -> CoreResult<()> {
        let value = command
            .parameters
            .get("value")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| CoreError::ValidationError("set_parameter missing value".into()))?;
        let parameter_id = resolve_parameter_id(self.datastore.as_ref(), &command.parameters).await?;

        steps::parameter::execute_standalone(self.plc.as_ref(), self.datastore.as_ref(), parameter_id, value)
            .await?;

        let refreshed = self.datastore.get_parameter(parameter_id).await?;
        self.cache.put(refreshed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit;
    use crate::datastore::memory::MemoryDatastore;
    use crate::model::{
        DataType, Machine, MachineStatus, MachineState, Parameter, Recipe, RecipeStep, StepType,
        ValveStepConfig,
    };
    use crate::plc::simulated::SimulatedPlc;
    use std::collections::HashMap as Hm;

    fn idle_machine() -> (Uuid, Machine, MachineState) {
        let id = Uuid::new_v4();
        (
            id,
            Machine { machine_id: id, status: MachineStatus::Idle, current_process_id: None, current_operator_id: None },
            MachineState { machine_id: id, current_state: MachineStatus::Idle, process_id: None, is_failure_mode: false, failure_description: None },
        )
    }

    fn seed_recipe(ds: &MemoryDatastore) -> Uuid {
        let recipe_id = Uuid::new_v4();
        let step = RecipeStep {
            id: Uuid::new_v4(),
            recipe_id,
            sequence_number: 0,
            parent_step_id: None,
            name: "pulse".into(),
            step_type: StepType::Valve,
            inline_parameters: Hm::new(),
        };
        ds.seed_valve_config(ValveStepConfig { step_id: step.id, valve_number: 1, duration_ms: 1 });
        ds.seed_recipe(
            Recipe {
                id: recipe_id,
                name: "one step".into(),
                version: "1".into(),
                chamber_temperature_set_point: None,
                pressure_set_point: None,
            },
            vec![step],
        );
        recipe_id
    }

    fn intake(ds: Arc<MemoryDatastore>) -> (CommandIntake, Uuid) {
        let plc = Arc::new(SimulatedPlc::new());
        let cancellation = Arc::new(CancellationRegistry::new());
        let cache = Arc::new(ParameterCache::default());
        let (writer, _handle) = audit::spawn(ds.clone(), 8);
        let (machine_id, machine, state) = idle_machine();
        ds.seed_machine(machine, state);
        let intake = CommandIntake::new(
            ds,
            plc,
            cancellation,
            cache,
            writer,
            Arc::new(AllowAllAuthenticator),
            None,
            machine_id,
        );
        (intake, machine_id)
    }

    #[tokio::test]
    async fn start_recipe_runs_to_completion_and_marks_command_completed() {
        let ds = Arc::new(MemoryDatastore::new());
        let (intake, machine_id) = intake(ds.clone());
        let recipe_id = seed_recipe(&ds);

        let command_id = Uuid::new_v4();
        ds.seed_command(RecipeCommand {
            command_id,
            machine_id,
            command_type: CommandType::StartRecipe,
            parameters: serde_json::json!({ "recipe_id": recipe_id.to_string() }),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            executed_at: None,
            error_message: None,
        });

        intake.poll_once().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let machine = ds.get_machine(machine_id).await.unwrap();
        assert_eq!(machine.status, MachineStatus::Idle);
    }

    #[tokio::test]
    async fn start_recipe_against_busy_machine_fails_the_command() {
        let ds = Arc::new(MemoryDatastore::new());
        let (intake, machine_id) = intake(ds.clone());
        let recipe_id = seed_recipe(&ds);

        let machine_state = MachineStateAuthority::new(ds.as_ref());
        machine_state.to_processing(machine_id, Uuid::new_v4()).await.unwrap();

        let command_id = Uuid::new_v4();
        ds.seed_command(RecipeCommand {
            command_id,
            machine_id,
            command_type: CommandType::StartRecipe,
            parameters: serde_json::json!({ "recipe_id": recipe_id.to_string() }),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            executed_at: None,
            error_message: None,
        });

        intake.poll_once().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let machine = ds.get_machine(machine_id).await.unwrap();
        assert_eq!(machine.status, MachineStatus::Processing);
    }

    #[tokio::test]
    async fn stop_recipe_cancels_the_registered_process() {
        let ds = Arc::new(MemoryDatastore::new());
        let (intake, machine_id) = intake(ds.clone());
        let process_id = Uuid::new_v4();
        intake.cancellation.register(process_id);

        let command_id = Uuid::new_v4();
        ds.seed_command(RecipeCommand {
            command_id,
            machine_id,
            command_type: CommandType::StopRecipe,
            parameters: serde_json::json!({ "process_id": process_id.to_string() }),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            executed_at: None,
            error_message: None,
        });

        intake.poll_once().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(intake.cancellation.is_cancelled(process_id));
    }

    #[tokio::test]
    async fn set_parameter_resolves_by_write_modbus_address() {
        let ds = Arc::new(MemoryDatastore::new());
        let (intake, machine_id) = intake(ds.clone());
        let parameter = Parameter {
            parameter_id: Uuid::new_v4(),
            name: "chamber_temp".into(),
            min_value: 0.0,
            max_value: 500.0,
            current_value: None,
            set_value: None,
            read_modbus_address: Some(10),
            write_modbus_address: Some(20),
            data_type: DataType::Float,
        };
        ds.seed_parameter(parameter.clone());

        let command_id = Uuid::new_v4();
        ds.seed_command(RecipeCommand {
            command_id,
            machine_id,
            command_type: CommandType::SetParameter,
            parameters: serde_json::json!({ "write_modbus_address": 20, "value": 200.0 }),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            executed_at: None,
            error_message: None,
        });

        intake.poll_once().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let stored = ds.get_parameter(parameter.parameter_id).await.unwrap();
        assert_eq!(stored.set_value, Some(200.0));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_handled_exactly_once() {
        let ds = Arc::new(MemoryDatastore::new());
        let (intake, machine_id) = intake(ds.clone());
        let process_id = Uuid::new_v4();

        let command_id = Uuid::new_v4();
        let command = RecipeCommand {
            command_id,
            machine_id,
            command_type: CommandType::StopRecipe,
            parameters: serde_json::json!({ "process_id": process_id.to_string() }),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            executed_at: None,
            error_message: None,
        };
        ds.seed_command(command.clone());

        let first = ds.try_claim_command(command_id).await.unwrap();
        let second = ds.try_claim_command(command_id).await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn resolve_parameter_id_prefers_write_address_over_name() {
        let ds = MemoryDatastore::new();
        let addressed = Uuid::new_v4();
        let named = Uuid::new_v4();
        ds.seed_parameter(Parameter {
            parameter_id: addressed,
            name: "pressure".into(),
            min_value: 0.0,
            max_value: 10.0,
            current_value: None,
            set_value: None,
            read_modbus_address: Some(1),
            write_modbus_address: Some(5),
            data_type: DataType::Float,
        });
        ds.seed_parameter(Parameter {
            parameter_id: named,
            name: "pressure".into(),
            min_value: 0.0,
            max_value: 10.0,
            current_value: None,
            set_value: None,
            read_modbus_address: Some(2),
            write_modbus_address: Some(6),
            data_type: DataType::Float,
        });

        let payload = serde_json::json!({ "write_modbus_address": 5, "name": "pressure" });
        let resolved = resolve_parameter_id(&ds, &payload).await.unwrap();
        assert_eq!(resolved, addressed);
    }
}
