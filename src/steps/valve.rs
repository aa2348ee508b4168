//! Valve pulse step handler (spec §4.C "Valve pulse").
//!
//! Config-first with a fatal miss: unlike purge, a valve step with no usable
//! `valve_number`/`duration_ms` cannot proceed at all, since there is no
//! sensible default for "which valve".

use super::{StepContext, StepOutcome};
use crate::error::{CoreError, CoreResult};
use crate::model::{AuditRecord, CurrentStepType, RecipeStep, ValveStepConfig};
use chrono::Utc;
use tracing::info;

/// Resolves the sibling `valve_step_config` row, falling back to the step's
/// inline parameters when absent. Fails with `StepConfigMissing` if neither
/// source yields a usable `valve_number > 0` and `duration_ms > 0`.
fn resolve_config(step: &RecipeStep, sibling: Option<ValveStepConfig>) -> CoreResult<ValveStepConfig> {
    if let Some(cfg) = sibling {
        if cfg.valve_number > 0 && cfg.duration_ms > 0 {
            return Ok(cfg);
        }
    }

    let valve_number = step
        .inline_parameters
        .get("valve_number")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);
    let duration_ms = step
        .inline_parameters
        .get("duration_ms")
        .and_then(|v| v.as_u64());

    match (valve_number, duration_ms) {
        (Some(valve_number), Some(duration_ms)) if valve_number > 0 && duration_ms > 0 => {
            Ok(ValveStepConfig { step_id: step.id, valve_number, duration_ms })
        }
        _ => Err(CoreError::StepConfigMissing(format!(
            "valve step {} has no usable valve_number/duration_ms",
            step.id
        ))),
    }
}

pub async fn execute(step: &RecipeStep, ctx: &StepContext<'_>) -> CoreResult<StepOutcome> {
    let sibling = ctx.datastore.get_valve_step_config(step.id).await?;
    let config = resolve_config(step, sibling)?;

    let mut state = ctx
        .datastore
        .get_process_execution_state(ctx.process_id)
        .await?;
    state.current_step_type = CurrentStepType::Valve;
    state.current_step_name = step.name.clone();
    state.current_valve_number = Some(config.valve_number);
    state.current_valve_duration_ms = Some(config.duration_ms);
    state.last_updated = Utc::now();
    ctx.datastore.update_process_execution_state(state).await?;

    if ctx.cancellation.is_cancelled(ctx.process_id) {
        return Ok(StepOutcome::Cancelled);
    }

    ctx.plc
        .control_valve(config.valve_number, true, Some(config.duration_ms))
        .await?;

    let completed_at = Utc::now();
    let audit = AuditRecord {
        machine_id: ctx.machine_id,
        parameter_name: format!("valve_{}", config.valve_number),
        target_value: config.duration_ms as f64,
        executed_at: completed_at,
        completed_at,
        process_id: Some(ctx.process_id),
    };
    // Enqueued, not awaited: the audit write must never block or fail the
    // step (spec §4.C). The drain task logs its own failures.
    ctx.audit.record(audit);
    info!(valve_number = config.valve_number, duration_ms = config.duration_ms, "valve pulse complete");

    Ok(StepOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit;
    use crate::cache::ParameterCache;
    use crate::cancellation::CancellationRegistry;
    use crate::datastore::memory::MemoryDatastore;
    use crate::datastore::Datastore;
    use crate::model::StepType;
    use crate::plc::simulated::SimulatedPlc;
    use std::collections::HashMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn step(inline: HashMap<String, serde_json::Value>) -> RecipeStep {
        RecipeStep {
            id: Uuid::new_v4(),
            recipe_id: Uuid::new_v4(),
            sequence_number: 0,
            parent_step_id: None,
            name: "open N2 valve".into(),
            step_type: StepType::Valve,
            inline_parameters: inline,
        }
    }

    #[tokio::test]
    async fn fatal_on_missing_config_and_inline() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = SimulatedPlc::new();
        let cancellation = CancellationRegistry::new();
        let cache = ParameterCache::default();
        let (writer, _handle) = audit::spawn(ds.clone(), 8);
        let machine_id = Uuid::new_v4();
        let process_id = Uuid::new_v4();
        ds.ensure_process_execution_state(process_id).await.unwrap();

        let s = step(HashMap::new());
        let ctx = StepContext {
            plc: &plc,
            datastore: ds.as_ref(),
            cancellation: &cancellation,
            cache: &cache,
            audit: &writer,
            machine_id,
            process_id,
        };
        let result = execute(&s, &ctx).await;
        assert!(matches!(result, Err(CoreError::StepConfigMissing(_))));
    }

    #[tokio::test]
    async fn inline_fallback_opens_and_closes_valve() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = SimulatedPlc::new();
        let cancellation = CancellationRegistry::new();
        let cache = ParameterCache::default();
        let (writer, _handle) = audit::spawn(ds.clone(), 8);
        let machine_id = Uuid::new_v4();
        let process_id = Uuid::new_v4();
        ds.ensure_process_execution_state(process_id).await.unwrap();

        let mut inline = HashMap::new();
        inline.insert("valve_number".into(), serde_json::json!(2));
        inline.insert("duration_ms".into(), serde_json::json!(5));
        let s = step(inline);

        let ctx = StepContext {
            plc: &plc,
            datastore: ds.as_ref(),
            cancellation: &cancellation,
            cache: &cache,
            audit: &writer,
            machine_id,
            process_id,
        };
        execute(&s, &ctx).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(ds.audit_records().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_before_side_effect_skips_plc_call() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = SimulatedPlc::new();
        let cancellation = CancellationRegistry::new();
        let cache = ParameterCache::default();
        let (writer, _handle) = audit::spawn(ds.clone(), 8);
        let machine_id = Uuid::new_v4();
        let process_id = Uuid::new_v4();
        ds.ensure_process_execution_state(process_id).await.unwrap();
        cancellation.cancel(process_id);

        let mut inline = HashMap::new();
        inline.insert("valve_number".into(), serde_json::json!(1));
        inline.insert("duration_ms".into(), serde_json::json!(10));
        let s = step(inline);

        let ctx = StepContext {
            plc: &plc,
            datastore: ds.as_ref(),
            cancellation: &cancellation,
            cache: &cache,
            audit: &writer,
            machine_id,
            process_id,
        };
        let outcome = execute(&s, &ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::Cancelled);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ds.audit_records().is_empty());
    }
}
