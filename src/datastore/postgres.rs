//! `sqlx`-backed Postgres implementation of [`Datastore`].
//!
//! Row structs mirror the schema implied by spec.md §1/§6 rather than reusing
//! `crate::model` types directly with `#[derive(sqlx::FromRow)]`: several
//! model fields are enums stored as `text` columns, which reads more plainly
//! as an explicit row struct + conversion than as a blanket `sqlx::Type`
//! mapping. The three `atomic_*` Machine-State Authority transitions are
//! calls to stored procedures (`CALL atomic_processing_machine_state(...)`),
//! keeping the re-check-inside-the-transaction logic in the database where
//! the single-writer invariant (I2) is actually enforced.

use super::Datastore;
use crate::error::{CoreError, CoreResult};
use crate::model::{
    AuditRecord, CommandStatus, CommandType, CurrentStepType, LoopStepConfig, Machine,
    MachineState, MachineStatus, Parameter, ParameterDataPoint, ProcessExecution,
    ProcessExecutionState, ProcessStatus, Progress, PurgeStepConfig, Recipe, RecipeCommand,
    RecipeStep, SetParameterStepConfig, StepType, ValveStepConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PostgresDatastore {
    pool: PgPool,
}

impl PostgresDatastore {
    pub async fn connect(url: &str, max_connections: u32) -> CoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn machine_status_from_str(s: &str) -> CoreResult<MachineStatus> {
    match s {
        "idle" => Ok(MachineStatus::Idle),
        "processing" => Ok(MachineStatus::Processing),
        "error" => Ok(MachineStatus::Error),
        "offline" => Ok(MachineStatus::Offline),
        other => Err(CoreError::DatastoreTransient(format!(
            "unknown machine status: {other}"
        ))),
    }
}

fn machine_status_to_str(status: MachineStatus) -> &'static str {
    match status {
        MachineStatus::Idle => "idle",
        MachineStatus::Processing => "processing",
        MachineStatus::Error => "error",
        MachineStatus::Offline => "offline",
    }
}

fn process_status_from_str(s: &str) -> CoreResult<ProcessStatus> {
    match s {
        "running" => Ok(ProcessStatus::Running),
        "completed" => Ok(ProcessStatus::Completed),
        "failed" => Ok(ProcessStatus::Failed),
        "stopped" => Ok(ProcessStatus::Stopped),
        other => Err(CoreError::DatastoreTransient(format!(
            "unknown process status: {other}"
        ))),
    }
}

fn process_status_to_str(status: ProcessStatus) -> &'static str {
    match status {
        ProcessStatus::Running => "running",
        ProcessStatus::Completed => "completed",
        ProcessStatus::Failed => "failed",
        ProcessStatus::Stopped => "stopped",
    }
}

fn current_step_type_from_str(s: &str) -> CurrentStepType {
    match s {
        "valve" => CurrentStepType::Valve,
        "purge" => CurrentStepType::Purge,
        "loop" => CurrentStepType::Loop,
        "set_parameter" => CurrentStepType::SetParameter,
        "completed" => CurrentStepType::Completed,
        "error" => CurrentStepType::Error,
        _ => CurrentStepType::Setup,
    }
}

fn current_step_type_to_str(step_type: CurrentStepType) -> &'static str {
    match step_type {
        CurrentStepType::Valve => "valve",
        CurrentStepType::Purge => "purge",
        CurrentStepType::Loop => "loop",
        CurrentStepType::SetParameter => "set_parameter",
        CurrentStepType::Completed => "completed",
        CurrentStepType::Error => "error",
        CurrentStepType::Setup => "setup",
    }
}

fn command_status_from_str(s: &str) -> CoreResult<CommandStatus> {
    match s {
        "pending" => Ok(CommandStatus::Pending),
        "processing" => Ok(CommandStatus::Processing),
        "completed" => Ok(CommandStatus::Completed),
        "error" => Ok(CommandStatus::Error),
        other => Err(CoreError::DatastoreTransient(format!(
            "unknown command status: {other}"
        ))),
    }
}

fn command_status_to_str(status: CommandStatus) -> &'static str {
    match status {
        CommandStatus::Pending => "pending",
        CommandStatus::Processing => "processing",
        CommandStatus::Completed => "completed",
        CommandStatus::Error => "error",
    }
}

fn command_type_from_str(s: &str) -> CoreResult<CommandType> {
    match s {
        "start_recipe" => Ok(CommandType::StartRecipe),
        "stop_recipe" => Ok(CommandType::StopRecipe),
        "set_parameter" => Ok(CommandType::SetParameter),
        other => Err(CoreError::DatastoreTransient(format!(
            "unknown command type: {other}"
        ))),
    }
}

#[async_trait]
impl Datastore for PostgresDatastore {
    async fn get_machine(&self, machine_id: Uuid) -> CoreResult<Machine> {
        let row = sqlx::query(
            "SELECT machine_id, status, current_process_id, current_operator_id \
             FROM machines WHERE machine_id = $1",
        )
        .bind(machine_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Machine {
            machine_id: row.try_get("machine_id")?,
            status: machine_status_from_str(row.try_get::<String, _>("status")?.as_str())?,
            current_process_id: row.try_get("current_process_id")?,
            current_operator_id: row.try_get("current_operator_id")?,
        })
    }

    async fn get_machine_state(&self, machine_id: Uuid) -> CoreResult<MachineState> {
        let row = sqlx::query(
            "SELECT machine_id, current_state, process_id, is_failure_mode, failure_description \
             FROM machine_state WHERE machine_id = $1",
        )
        .bind(machine_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(MachineState {
            machine_id: row.try_get("machine_id")?,
            current_state: machine_status_from_str(row.try_get::<String, _>("current_state")?.as_str())?,
            process_id: row.try_get("process_id")?,
            is_failure_mode: row.try_get("is_failure_mode")?,
            failure_description: row.try_get("failure_description")?,
        })
    }

    async fn atomic_to_processing(&self, machine_id: Uuid, process_id: Uuid) -> CoreResult<()> {
        sqlx::query("CALL atomic_processing_machine_state($1, $2)")
            .bind(machine_id)
            .bind(process_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.message().contains("busy") => {
                    CoreError::MachineBusy(machine_id.to_string())
                }
                _ => CoreError::Sqlx(e),
            })?;
        Ok(())
    }

    async fn atomic_to_idle(&self, machine_id: Uuid) -> CoreResult<()> {
        sqlx::query("CALL atomic_complete_machine_state($1)")
            .bind(machine_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn atomic_to_error(&self, machine_id: Uuid, description: &str) -> CoreResult<()> {
        sqlx::query("CALL atomic_error_machine_state($1, $2)")
            .bind(machine_id)
            .bind(description)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_recipe(&self, recipe_id: Uuid) -> CoreResult<Recipe> {
        let row = sqlx::query(
            "SELECT id, name, version, chamber_temperature_set_point, pressure_set_point \
             FROM recipes WHERE id = $1",
        )
        .bind(recipe_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Recipe {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            chamber_temperature_set_point: row.try_get("chamber_temperature_set_point")?,
            pressure_set_point: row.try_get("pressure_set_point")?,
        })
    }

    async fn get_recipe_steps(&self, recipe_id: Uuid) -> CoreResult<Vec<RecipeStep>> {
        let rows = sqlx::query(
            "SELECT id, recipe_id, sequence_number, parent_step_id, name, type, parameters \
             FROM recipe_steps WHERE recipe_id = $1 ORDER BY sequence_number ASC",
        )
        .bind(recipe_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let raw_type: String = row.try_get("type")?;
                let step_type = StepType::parse(&raw_type).ok_or_else(|| {
                    CoreError::RecipeCompile(format!("unknown step type: {raw_type}"))
                })?;
                let inline: serde_json::Value = row.try_get("parameters")?;
                let inline_parameters = match inline {
                    serde_json::Value::Object(map) => map.into_iter().collect(),
                    _ => Default::default(),
                };
                Ok(RecipeStep {
                    id: row.try_get("id")?,
                    recipe_id: row.try_get("recipe_id")?,
                    sequence_number: row.try_get("sequence_number")?,
                    parent_step_id: row.try_get("parent_step_id")?,
                    name: row.try_get("name")?,
                    step_type,
                    inline_parameters,
                })
            })
            .collect()
    }

    async fn get_valve_step_config(&self, step_id: Uuid) -> CoreResult<Option<ValveStepConfig>> {
        let row = sqlx::query(
            "SELECT step_id, valve_number, duration_ms FROM valve_step_config WHERE step_id = $1",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ValveStepConfig {
                step_id: row.try_get("step_id")?,
                valve_number: row.try_get::<i32, _>("valve_number")? as u32,
                duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
            })
        })
        .transpose()
    }

    async fn get_purge_step_config(&self, step_id: Uuid) -> CoreResult<Option<PurgeStepConfig>> {
        let row = sqlx::query(
            "SELECT step_id, duration_ms, gas_type, flow_rate FROM purge_step_config WHERE step_id = $1",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(PurgeStepConfig {
                step_id: row.try_get("step_id")?,
                duration_ms: row
                    .try_get::<Option<i64>, _>("duration_ms")?
                    .map(|ms| ms as u64),
                gas_type: row.try_get("gas_type")?,
                flow_rate: row.try_get("flow_rate")?,
            })
        })
        .transpose()
    }

    async fn get_loop_step_config(&self, step_id: Uuid) -> CoreResult<Option<LoopStepConfig>> {
        let row = sqlx::query(
            "SELECT step_id, iteration_count FROM loop_step_config WHERE step_id = $1",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(LoopStepConfig {
                step_id: row.try_get("step_id")?,
                iteration_count: row.try_get::<i32, _>("iteration_count")? as u32,
            })
        })
        .transpose()
    }

    async fn get_set_parameter_step_config(
        &self,
        step_id: Uuid,
    ) -> CoreResult<Option<SetParameterStepConfig>> {
        let row = sqlx::query(
            "SELECT step_id, parameter_id, value FROM set_parameter_step_config WHERE step_id = $1",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SetParameterStepConfig {
                step_id: row.try_get("step_id")?,
                parameter_id: row.try_get("parameter_id")?,
                value: row.try_get("value")?,
            })
        })
        .transpose()
    }

    async fn create_process_execution(&self, execution: ProcessExecution) -> CoreResult<()> {
        let parameters = serde_json::to_value(&execution.parameters)
            .map_err(|e| CoreError::ValidationError(e.to_string()))?;
        sqlx::query(
            "INSERT INTO process_executions \
             (process_id, recipe_id, recipe_version, session_id, operator_id, status, \
              start_time, end_time, error_message, parameters, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(execution.process_id)
        .bind(execution.recipe_id)
        .bind(&execution.recipe_version)
        .bind(execution.session_id)
        .bind(execution.operator_id)
        .bind(process_status_to_str(execution.status))
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(&execution.error_message)
        .bind(parameters)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_process_execution(&self, process_id: Uuid) -> CoreResult<ProcessExecution> {
        let row = sqlx::query(
            "SELECT process_id, recipe_id, recipe_version, session_id, operator_id, status, \
             start_time, end_time, error_message, parameters, updated_at \
             FROM process_executions WHERE process_id = $1",
        )
        .bind(process_id)
        .fetch_one(&self.pool)
        .await?;

        let parameters_json: serde_json::Value = row.try_get("parameters")?;
        let parameters = match parameters_json {
            serde_json::Value::Object(map) => map
                .into_iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k, f)))
                .collect(),
            _ => Default::default(),
        };

        Ok(ProcessExecution {
            process_id: row.try_get("process_id")?,
            recipe_id: row.try_get("recipe_id")?,
            recipe_version: row.try_get("recipe_version")?,
            session_id: row.try_get("session_id")?,
            operator_id: row.try_get("operator_id")?,
            status: process_status_from_str(row.try_get::<String, _>("status")?.as_str())?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            error_message: row.try_get("error_message")?,
            parameters,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn touch_process_execution(&self, process_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE process_executions SET updated_at = now() WHERE process_id = $1")
            .bind(process_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_process_execution(
        &self,
        process_id: Uuid,
        end_time: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE process_executions SET status = 'completed', end_time = $2, updated_at = $2 \
             WHERE process_id = $1",
        )
        .bind(process_id)
        .bind(end_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_process_execution(&self, process_id: Uuid, error_message: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE process_executions SET status = 'failed', error_message = $2, \
             end_time = now(), updated_at = now() WHERE process_id = $1",
        )
        .bind(process_id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stop_process_execution(&self, process_id: Uuid) -> CoreResult<()> {
        sqlx::query(
            "UPDATE process_executions SET status = 'stopped', end_time = now(), updated_at = now() \
             WHERE process_id = $1",
        )
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_process_execution_state(&self, execution_id: Uuid) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO process_execution_state \
             (execution_id, current_step_index, current_overall_step, total_overall_steps, \
              current_step_type, current_step_name, last_updated) \
             VALUES ($1, 0, 0, 0, 'setup', '', now()) \
             ON CONFLICT (execution_id) DO NOTHING",
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_process_execution_state(
        &self,
        execution_id: Uuid,
    ) -> CoreResult<ProcessExecutionState> {
        let row = sqlx::query(
            "SELECT execution_id, current_step_index, current_overall_step, total_overall_steps, \
             current_step_type, current_step_name, current_valve_number, current_valve_duration_ms, \
             current_purge_duration_ms, current_loop_count, current_loop_iteration, \
             current_parameter_id, current_parameter_value, \
             total_steps, completed_steps, total_cycles, completed_cycles, last_updated \
             FROM process_execution_state WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ProcessExecutionState {
            execution_id: row.try_get("execution_id")?,
            current_step_index: row.try_get::<i32, _>("current_step_index")? as u32,
            current_overall_step: row.try_get::<i32, _>("current_overall_step")? as u32,
            total_overall_steps: row.try_get::<i32, _>("total_overall_steps")? as u32,
            current_step_type: current_step_type_from_str(
                row.try_get::<String, _>("current_step_type")?.as_str(),
            ),
            current_step_name: row.try_get("current_step_name")?,
            current_valve_number: row
                .try_get::<Option<i32>, _>("current_valve_number")?
                .map(|v| v as u32),
            current_valve_duration_ms: row
                .try_get::<Option<i64>, _>("current_valve_duration_ms")?
                .map(|v| v as u64),
            current_purge_duration_ms: row
                .try_get::<Option<i64>, _>("current_purge_duration_ms")?
                .map(|v| v as u64),
            current_loop_count: row
                .try_get::<Option<i32>, _>("current_loop_count")?
                .map(|v| v as u32),
            current_loop_iteration: row
                .try_get::<Option<i32>, _>("current_loop_iteration")?
                .map(|v| v as u32),
            current_parameter_id: row.try_get("current_parameter_id")?,
            current_parameter_value: row.try_get("current_parameter_value")?,
            progress: Progress {
                total_steps: row.try_get::<i32, _>("total_steps")? as u32,
                completed_steps: row.try_get::<i32, _>("completed_steps")? as u32,
                total_cycles: row.try_get::<i32, _>("total_cycles")? as u32,
                completed_cycles: row.try_get::<i32, _>("completed_cycles")? as u32,
            },
            last_updated: row.try_get("last_updated")?,
        })
    }

    async fn update_process_execution_state(&self, state: ProcessExecutionState) -> CoreResult<()> {
        sqlx::query(
            "UPDATE process_execution_state SET \
             current_step_index = $2, current_overall_step = $3, total_overall_steps = $4, \
             current_step_type = $5, current_step_name = $6, current_valve_number = $7, \
             current_valve_duration_ms = $8, current_purge_duration_ms = $9, \
             current_loop_count = $10, current_loop_iteration = $11, current_parameter_id = $12, \
             current_parameter_value = $13, total_steps = $14, completed_steps = $15, \
             total_cycles = $16, completed_cycles = $17, last_updated = $18 \
             WHERE execution_id = $1",
        )
        .bind(state.execution_id)
        .bind(state.current_step_index as i32)
        .bind(state.current_overall_step as i32)
        .bind(state.total_overall_steps as i32)
        .bind(current_step_type_to_str(state.current_step_type))
        .bind(&state.current_step_name)
        .bind(state.current_valve_number.map(|v| v as i32))
        .bind(state.current_valve_duration_ms.map(|v| v as i64))
        .bind(state.current_purge_duration_ms.map(|v| v as i64))
        .bind(state.current_loop_count.map(|v| v as i32))
        .bind(state.current_loop_iteration.map(|v| v as i32))
        .bind(state.current_parameter_id)
        .bind(state.current_parameter_value)
        .bind(state.progress.total_steps as i32)
        .bind(state.progress.completed_steps as i32)
        .bind(state.progress.total_cycles as i32)
        .bind(state.progress.completed_cycles as i32)
        .bind(state.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_parameter(&self, parameter_id: Uuid) -> CoreResult<Parameter> {
        let row = sqlx::query(
            "SELECT parameter_id, name, min_value, max_value, current_value, set_value, \
             read_modbus_address, write_modbus_address, data_type \
             FROM component_parameters WHERE parameter_id = $1",
        )
        .bind(parameter_id)
        .fetch_one(&self.pool)
        .await?;
        row_to_parameter(row)
    }

    async fn get_all_parameters(&self) -> CoreResult<Vec<Parameter>> {
        let rows = sqlx::query(
            "SELECT parameter_id, name, min_value, max_value, current_value, set_value, \
             read_modbus_address, write_modbus_address, data_type FROM component_parameters",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_parameter).collect()
    }

    async fn find_parameter_by_name(&self, name: &str) -> CoreResult<Vec<Parameter>> {
        let rows = sqlx::query(
            "SELECT parameter_id, name, min_value, max_value, current_value, set_value, \
             read_modbus_address, write_modbus_address, data_type \
             FROM component_parameters WHERE name = $1",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_parameter).collect()
    }

    async fn find_parameter_by_write_address(&self, address: u16) -> CoreResult<Option<Parameter>> {
        let row = sqlx::query(
            "SELECT parameter_id, name, min_value, max_value, current_value, set_value, \
             read_modbus_address, write_modbus_address, data_type \
             FROM component_parameters WHERE write_modbus_address = $1",
        )
        .bind(address as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_parameter).transpose()
    }

    async fn update_parameter_set_value(&self, parameter_id: Uuid, value: f64) -> CoreResult<()> {
        sqlx::query("UPDATE component_parameters SET set_value = $2 WHERE parameter_id = $1")
            .bind(parameter_id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_pending_commands(&self, machine_id: Uuid) -> CoreResult<Vec<RecipeCommand>> {
        let rows = sqlx::query(
            "SELECT command_id, machine_id, command_type, parameters, status, created_at, \
             executed_at, error_message FROM recipe_commands \
             WHERE machine_id = $1 AND status = 'pending' ORDER BY created_at ASC",
        )
        .bind(machine_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(RecipeCommand {
                    command_id: row.try_get("command_id")?,
                    machine_id: row.try_get("machine_id")?,
                    command_type: command_type_from_str(
                        row.try_get::<String, _>("command_type")?.as_str(),
                    )?,
                    parameters: row.try_get("parameters")?,
                    status: command_status_from_str(row.try_get::<String, _>("status")?.as_str())?,
                    created_at: row.try_get("created_at")?,
                    executed_at: row.try_get("executed_at")?,
                    error_message: row.try_get("error_message")?,
                })
            })
            .collect()
    }

    async fn try_claim_command(&self, command_id: Uuid) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE recipe_commands SET status = 'processing' \
             WHERE command_id = $1 AND status = 'pending'",
        )
        .bind(command_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finalize_command(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error_message: Option<String>,
        executed_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE recipe_commands SET status = $2, error_message = $3, executed_at = $4 \
             WHERE command_id = $1",
        )
        .bind(command_id)
        .bind(command_status_to_str(status))
        .bind(error_message)
        .bind(executed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_audit_record(&self, record: AuditRecord) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO parameter_control_commands \
             (machine_id, parameter_name, target_value, executed_at, completed_at, process_id) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.machine_id)
        .bind(&record.parameter_name)
        .bind(record.target_value)
        .bind(record.executed_at)
        .bind(record.completed_at)
        .bind(record.process_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_global_data_points(&self, points: &[ParameterDataPoint]) -> CoreResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for point in points {
            sqlx::query(
                "INSERT INTO parameter_value_history (parameter_id, value, set_point, timestamp) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(point.parameter_id)
            .bind(point.value)
            .bind(point.set_point)
            .bind(point.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_process_data_points(&self, points: &[ParameterDataPoint]) -> CoreResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for point in points {
            sqlx::query(
                "INSERT INTO process_data_points (parameter_id, value, set_point, timestamp, process_id) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(point.parameter_id)
            .bind(point.value)
            .bind(point.set_point)
            .bind(point.timestamp)
            .bind(point.process_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn row_to_parameter(row: sqlx::postgres::PgRow) -> CoreResult<Parameter> {
    let data_type_str: String = row.try_get("data_type")?;
    let data_type = match data_type_str.as_str() {
        "float" => crate::model::DataType::Float,
        "int16" => crate::model::DataType::Int16,
        "int32" => crate::model::DataType::Int32,
        "binary" => crate::model::DataType::Binary,
        other => {
            return Err(CoreError::DatastoreTransient(format!(
                "unknown data_type: {other}"
            )))
        }
    };
    Ok(Parameter {
        parameter_id: row.try_get("parameter_id")?,
        name: row.try_get("name")?,
        min_value: row.try_get("min_value")?,
        max_value: row.try_get("max_value")?,
        current_value: row.try_get("current_value")?,
        set_value: row.try_get("set_value")?,
        read_modbus_address: row
            .try_get::<Option<i32>, _>("read_modbus_address")?
            .map(|v| v as u16),
        write_modbus_address: row
            .try_get::<Option<i32>, _>("write_modbus_address")?
            .map(|v| v as u16),
        data_type,
    })
}
