//! Parameter write (`set_parameter`) step handler (spec §4.C "Parameter
//! write").
//!
//! Loads parameter metadata, range-checks, writes to the PLC, then persists
//! `set_value` — in that order, and only on PLC success. A failed PLC write
//! must never be followed by a database update, or the stored value would
//! claim a change that never reached hardware.

use super::{StepContext, StepOutcome};
use crate::error::{CoreError, CoreResult};
use crate::model::{CurrentStepType, RecipeStep, SetParameterStepConfig};
use chrono::Utc;

fn resolve_config(
    step: &RecipeStep,
    sibling: Option<SetParameterStepConfig>,
) -> CoreResult<SetParameterStepConfig> {
    if let Some(cfg) = sibling {
        return Ok(cfg);
    }

    let parameter_id = step
        .inline_parameters
        .get("parameter_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok());
    let value = step.inline_parameters.get("value").and_then(|v| v.as_f64());

    match (parameter_id, value) {
        (Some(parameter_id), Some(value)) => {
            Ok(SetParameterStepConfig { step_id: step.id, parameter_id, value })
        }
        _ => Err(CoreError::StepConfigMissing(format!(
            "set_parameter step {} has no usable parameter_id/value",
            step.id
        ))),
    }
}

pub async fn execute(step: &RecipeStep, ctx: &StepContext<'_>) -> CoreResult<StepOutcome> {
    let sibling = ctx.datastore.get_set_parameter_step_config(step.id).await?;
    let config = resolve_config(step, sibling)?;

    let parameter = ctx.cache.get(ctx.datastore, config.parameter_id).await?;
    if !parameter.in_range(config.value) {
        return Err(CoreError::ParameterOutOfRange {
            parameter_id: config.parameter_id,
            value: config.value,
            min: parameter.min_value,
            max: parameter.max_value,
        });
    }

    let mut state = ctx
        .datastore
        .get_process_execution_state(ctx.process_id)
        .await?;
    state.current_step_type = CurrentStepType::SetParameter;
    state.current_step_name = step.name.clone();
    state.current_parameter_id = Some(config.parameter_id);
    state.current_parameter_value = Some(config.value);
    state.last_updated = Utc::now();
    ctx.datastore.update_process_execution_state(state).await?;

    if ctx.cancellation.is_cancelled(ctx.process_id) {
        return Ok(StepOutcome::Cancelled);
    }

    let write_address = parameter.write_modbus_address.ok_or_else(|| {
        CoreError::StepConfigMissing(format!(
            "parameter {} has no write_modbus_address",
            config.parameter_id
        ))
    })?;
    ctx.plc
        .write_parameter(write_address, parameter.data_type, config.value)
        .await?;

    ctx.datastore
        .update_parameter_set_value(config.parameter_id, config.value)
        .await?;
    let mut written = parameter;
    written.set_value = Some(config.value);
    ctx.cache.put(written);

    Ok(StepOutcome::Completed)
}

/// Standalone entry point used by Command Intake's `set_parameter` command,
/// which writes directly against the PLC and datastore without a process
/// context (spec §4.E).
pub async fn execute_standalone(
    plc: &dyn crate::plc::Plc,
    datastore: &dyn crate::datastore::Datastore,
    parameter_id: uuid::Uuid,
    value: f64,
) -> CoreResult<()> {
    let parameter = datastore.get_parameter(parameter_id).await?;
    if !parameter.in_range(value) {
        return Err(CoreError::ParameterOutOfRange {
            parameter_id,
            value,
            min: parameter.min_value,
            max: parameter.max_value,
        });
    }
    let write_address = parameter
        .write_modbus_address
        .ok_or_else(|| CoreError::StepConfigMissing(format!("parameter {parameter_id} has no write_modbus_address")))?;
    plc.write_parameter(write_address, parameter.data_type, value).await?;
    datastore.update_parameter_set_value(parameter_id, value).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit;
    use crate::cache::ParameterCache;
    use crate::cancellation::CancellationRegistry;
    use crate::datastore::memory::MemoryDatastore;
    use crate::datastore::Datastore;
    use crate::model::{DataType, Parameter, StepType};
    use crate::plc::simulated::SimulatedPlc;
    use std::collections::HashMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn seeded_parameter(ds: &MemoryDatastore) -> Parameter {
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
        parameter
    }

    fn step(parameter_id: Uuid, value: f64) -> RecipeStep {
        let mut inline = HashMap::new();
        inline.insert("parameter_id".into(), serde_json::json!(parameter_id.to_string()));
        inline.insert("value".into(), serde_json::json!(value));
        RecipeStep {
            id: Uuid::new_v4(),
            recipe_id: Uuid::new_v4(),
            sequence_number: 0,
            parent_step_id: None,
            name: "set chamber temp".into(),
            step_type: StepType::SetParameter,
            inline_parameters: inline,
        }
    }

    #[tokio::test]
    async fn out_of_range_value_is_rejected_before_plc_write() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = SimulatedPlc::new();
        let cancellation = CancellationRegistry::new();
        let cache = ParameterCache::default();
        let (writer, _handle) = audit::spawn(ds.clone(), 8);
        let parameter = seeded_parameter(&ds);
        let process_id = Uuid::new_v4();
        ds.ensure_process_execution_state(process_id).await.unwrap();

        let s = step(parameter.parameter_id, 9999.0);
        let ctx = StepContext {
            plc: &plc,
            datastore: ds.as_ref(),
            cancellation: &cancellation,
            cache: &cache,
            audit: &writer,
            machine_id: Uuid::new_v4(),
            process_id,
        };
        let result = execute(&s, &ctx).await;
        assert!(matches!(result, Err(CoreError::ParameterOutOfRange { .. })));
        let stored = ds.get_parameter(parameter.parameter_id).await.unwrap();
        assert!(stored.set_value.is_none());
    }

    #[tokio::test]
    async fn in_range_value_writes_plc_then_datastore() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = SimulatedPlc::new();
        let cancellation = CancellationRegistry::new();
        let cache = ParameterCache::default();
        let (writer, _handle) = audit::spawn(ds.clone(), 8);
        let parameter = seeded_parameter(&ds);
        let process_id = Uuid::new_v4();
        ds.ensure_process_execution_state(process_id).await.unwrap();

        let s = step(parameter.parameter_id, 250.0);
        let ctx = StepContext {
            plc: &plc,
            datastore: ds.as_ref(),
            cancellation: &cancellation,
            cache: &cache,
            audit: &writer,
            machine_id: Uuid::new_v4(),
            process_id,
        };
        execute(&s, &ctx).await.unwrap();

        let stored = ds.get_parameter(parameter.parameter_id).await.unwrap();
        assert_eq!(stored.set_value, Some(250.0));
        let on_plc = plc.read_parameter(20, DataType::Float).await.unwrap();
        assert!((on_plc - 250.0).abs() < 0.1);
        let cached = cache.get(ds.as_ref(), parameter.parameter_id).await.unwrap();
        assert_eq!(cached.set_value, Some(250.0));
    }
}
