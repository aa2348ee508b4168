//! Data model for the ALD control runtime.
//!
//! These types mirror the control runtime's datastore schema:
//! `machines`, `machine_state`, `process_executions`, `process_execution_state`,
//! `recipes`/`recipe_steps` (plus per-type sibling config tables),
//! `recipe_commands`, and `component_parameters`. The runtime never owns a
//! second source of truth for these rows — every field here round-trips
//! through the `Datastore` collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a `Machine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Idle,
    Processing,
    Error,
    Offline,
}

/// The physical tool this runtime controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: Uuid,
    pub status: MachineStatus,
    pub current_process_id: Option<Uuid>,
    pub current_operator_id: Option<Uuid>,
}

/// Sibling record to `Machine` carrying failure detail.
///
/// Invariant I2 (spec I2): `status == current_state` and
/// `current_process_id == process_id` must hold between atomic updates.
/// Only the Machine-State Authority writes this row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineState {
    pub machine_id: Uuid,
    pub current_state: MachineStatus,
    pub process_id: Option<Uuid>,
    pub is_failure_mode: bool,
    pub failure_description: Option<String>,
}

/// Status of a `ProcessExecution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

/// One run of a recipe on a machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExecution {
    pub process_id: Uuid,
    pub recipe_id: Uuid,
    /// Stable snapshot of the recipe body taken at start (see `RecipeVersion`).
    pub recipe_version: serde_json::Value,
    pub session_id: Option<Uuid>,
    pub operator_id: Option<Uuid>,
    pub status: ProcessStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub parameters: HashMap<String, f64>,
    pub updated_at: DateTime<Utc>,
}

/// Discriminates the step the `ProcessExecutionState` row is currently
/// describing. `Setup` covers the brief window between process-execution
/// creation and the first step preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentStepType {
    Valve,
    Purge,
    Loop,
    SetParameter,
    Completed,
    Error,
    Setup,
}

/// Monotonic progress counters. Invariant I4: `completed_steps <=
/// total_steps` and `completed_cycles <= total_cycles` at all times.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total_steps: u32,
    pub completed_steps: u32,
    pub total_cycles: u32,
    pub completed_cycles: u32,
}

impl Progress {
    pub fn is_consistent(&self) -> bool {
        self.completed_steps <= self.total_steps && self.completed_cycles <= self.total_cycles
    }
}

/// 1:1 sibling to `ProcessExecution` holding live progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExecutionState {
    pub execution_id: Uuid,
    pub current_step_index: u32,
    pub current_overall_step: u32,
    pub total_overall_steps: u32,
    pub current_step_type: CurrentStepType,
    pub current_step_name: String,
    pub current_valve_number: Option<u32>,
    pub current_valve_duration_ms: Option<u64>,
    pub current_purge_duration_ms: Option<u64>,
    pub current_loop_count: Option<u32>,
    pub current_loop_iteration: Option<u32>,
    pub current_parameter_id: Option<Uuid>,
    pub current_parameter_value: Option<f64>,
    pub progress: Progress,
    pub last_updated: DateTime<Utc>,
}

impl ProcessExecutionState {
    /// Truncates an error message to this row's display-length limit
    /// (the full message stays on `ProcessExecution`).
    pub fn truncated_error_name(message: &str) -> String {
        const MAX: usize = 100;
        if message.len() <= MAX {
            format!("Error: {message}")
        } else {
            let mut truncated: String = message.chars().take(MAX).collect();
            truncated.push('\u{2026}');
            format!("Error: {truncated}")
        }
    }
}

/// Recipe header metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub chamber_temperature_set_point: Option<f64>,
    pub pressure_set_point: Option<f64>,
}

/// `type` discriminator of a `RecipeStep`. `set parameter` (with a space) is
/// an accepted alias for `SetParameter`, resolved once at recipe-compile
/// time in [`crate::executor::compile`], never re-parsed on dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Valve,
    Purge,
    Loop,
    SetParameter,
}

impl StepType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "valve" => Some(Self::Valve),
            "purge" => Some(Self::Purge),
            "loop" => Some(Self::Loop),
            "set_parameter" | "set parameter" => Some(Self::SetParameter),
            _ => None,
        }
    }
}

/// A row in `recipe_steps`. `parent_step_id` is non-null for loop children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeStep {
    pub id: Uuid,
    pub recipe_id: Uuid,
    pub sequence_number: i64,
    pub parent_step_id: Option<Uuid>,
    pub name: String,
    pub step_type: StepType,
    /// Inline fallback parameters, used when the sibling config table has no
    /// row for this step (legacy rows).
    pub inline_parameters: HashMap<String, serde_json::Value>,
}

/// Sibling config for a `StepType::Valve` step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValveStepConfig {
    pub step_id: Uuid,
    pub valve_number: u32,
    pub duration_ms: u64,
}

/// Sibling config for a `StepType::Purge` step. `duration_ms` is `None` when
/// the row (and its inline fallback) supplied no usable value, in which case
/// the purge handler substitutes a 1-second default per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeStepConfig {
    pub step_id: Uuid,
    pub duration_ms: Option<u64>,
    pub gas_type: Option<String>,
    pub flow_rate: Option<f64>,
}

/// Sibling config for a `StepType::Loop` step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoopStepConfig {
    pub step_id: Uuid,
    pub iteration_count: u32,
}

/// Inline `{parameter_id, value}` pair carried on a `SetParameter` step row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SetParameterStepConfig {
    pub step_id: Uuid,
    pub parameter_id: Uuid,
    pub value: f64,
}

/// Modbus function-code family a parameter is read/written through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadType {
    Holding,
    Coil,
    Input,
    DiscreteInput,
}

/// Scalar encoding of a parameter's value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Int16,
    Int32,
    Binary,
}

impl DataType {
    /// `original_source/src/performance/high_performance_parameter_logger.py`'s
    /// `_infer_read_type`: binary parameters live in coils, everything else
    /// in holding registers.
    pub fn infer_read_type(self) -> ReadType {
        match self {
            DataType::Binary => ReadType::Coil,
            _ => ReadType::Holding,
        }
    }

    /// Number of consecutive Modbus addresses this data type occupies.
    pub fn register_span(self) -> u16 {
        match self {
            DataType::Float | DataType::Int32 => 2,
            DataType::Int16 | DataType::Binary => 1,
        }
    }
}

/// Sensor or actuator channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub parameter_id: Uuid,
    pub name: String,
    pub min_value: f64,
    pub max_value: f64,
    pub current_value: Option<f64>,
    pub set_value: Option<f64>,
    pub read_modbus_address: Option<u16>,
    pub write_modbus_address: Option<u16>,
    pub data_type: DataType,
}

impl Parameter {
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min_value && value <= self.max_value
    }
}

/// Status of a `RecipeCommand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// Unit of work ingested from outside the runtime via `recipe_commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeCommand {
    pub command_id: Uuid,
    pub machine_id: Uuid,
    pub command_type: CommandType,
    pub parameters: serde_json::Value,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    StartRecipe,
    StopRecipe,
    SetParameter,
}

/// Write-only audit sibling row. Never read back by the core; see
/// `original_source/src/step_flow/valve_step.py`'s
/// `_audit_log_valve_command` and [`crate::audit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub machine_id: Uuid,
    pub parameter_name: String,
    pub target_value: f64,
    pub executed_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub process_id: Option<Uuid>,
}

/// One sampled parameter value, written to the global history stream and,
/// when a process is active, additionally to the per-process stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDataPoint {
    pub parameter_id: Uuid,
    pub value: f64,
    pub set_point: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub process_id: Option<Uuid>,
}
