//! Purge wait step handler (spec §4.C "Purge wait", §3 recovery rule).
//!
//! Unlike valve/loop, a missing or non-positive `duration_ms` is recoverable
//! here: the handler substitutes a 1-second default rather than failing the
//! step, since a purge with no explicit duration is still safe to run
//! (it just idles). `gas_type`/`flow_rate` are informational only — no PLC
//! calls happen during a purge.

use super::{cancellable_sleep, StepContext, StepOutcome};
use crate::error::CoreResult;
use crate::model::{CurrentStepType, PurgeStepConfig, RecipeStep};
use chrono::Utc;
use tracing::warn;

const RECOVERABLE_DEFAULT_MS: u64 = 1000;

/// Resolves the purge duration, falling back to the sibling row's inline
/// parameters, then to [`RECOVERABLE_DEFAULT_MS`] if neither is usable.
fn resolve_duration_ms(step: &RecipeStep, sibling: &Option<PurgeStepConfig>) -> u64 {
    if let Some(cfg) = sibling {
        if let Some(ms) = cfg.duration_ms {
            if ms > 0 {
                return ms;
            }
        }
    }

    let inline_ms = step
        .inline_parameters
        .get("duration_ms")
        .and_then(|v| v.as_u64())
        .filter(|ms| *ms > 0);

    inline_ms.unwrap_or_else(|| {
        warn!(step_id = %step.id, "purge step missing usable duration_ms, substituting default");
        RECOVERABLE_DEFAULT_MS
    })
}

pub async fn execute(step: &RecipeStep, ctx: &StepContext<'_>) -> CoreResult<StepOutcome> {
    let sibling = ctx.datastore.get_purge_step_config(step.id).await?;
    let duration_ms = resolve_duration_ms(step, &sibling);
    let gas_type = sibling.as_ref().and_then(|c| c.gas_type.clone());

    let mut state = ctx
        .datastore
        .get_process_execution_state(ctx.process_id)
        .await?;
    state.current_step_type = CurrentStepType::Purge;
    state.current_step_name = step.name.clone();
    state.current_purge_duration_ms = Some(duration_ms);
    state.last_updated = Utc::now();
    ctx.datastore.update_process_execution_state(state).await?;

    if ctx.cancellation.is_cancelled(ctx.process_id) {
        return Ok(StepOutcome::Cancelled);
    }

    let _ = &gas_type; // informational only, no actuation
    Ok(cancellable_sleep(ctx.cancellation, ctx.process_id, duration_ms).await)
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
            name: "purge".into(),
            step_type: StepType::Purge,
            inline_parameters: inline,
        }
    }

    #[tokio::test]
    async fn missing_duration_substitutes_recoverable_default() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = SimulatedPlc::new();
        let cancellation = CancellationRegistry::new();
        let cache = ParameterCache::default();
        let (writer, _handle) = audit::spawn(ds.clone(), 8);
        let process_id = Uuid::new_v4();
        ds.ensure_process_execution_state(process_id).await.unwrap();

        let s = step(HashMap::new());
        let ctx = StepContext {
            plc: &plc,
            datastore: ds.as_ref(),
            cancellation: &cancellation,
            cache: &cache,
            audit: &writer,
            machine_id: Uuid::new_v4(),
            process_id,
        };
        let start = std::time::Instant::now();
        let outcome = execute(&s, &ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::Completed);
        assert!(start.elapsed().as_millis() >= RECOVERABLE_DEFAULT_MS as u128);
    }

    #[tokio::test]
    async fn zero_duration_from_inline_also_falls_back_to_default() {
        let ds = MemoryDatastore::new();
        let plc = SimulatedPlc::new();
        let cancellation = CancellationRegistry::new();
        let process_id = Uuid::new_v4();
        ds.ensure_process_execution_state(process_id).await.unwrap();

        let mut inline = HashMap::new();
        inline.insert("duration_ms".into(), serde_json::json!(0));
        let s = step(inline);
        assert_eq!(resolve_duration_ms(&s, &None), RECOVERABLE_DEFAULT_MS);
    }

    #[tokio::test]
    async fn cancellation_interrupts_long_purge_promptly() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = SimulatedPlc::new();
        let cancellation = Arc::new(CancellationRegistry::new());
        let cache = ParameterCache::default();
        let (writer, _handle) = audit::spawn(ds.clone(), 8);
        let process_id = Uuid::new_v4();
        ds.ensure_process_execution_state(process_id).await.unwrap();

        let mut inline = HashMap::new();
        inline.insert("duration_ms".into(), serde_json::json!(60_000));
        let s = step(inline);
        let ctx = StepContext {
            plc: &plc,
            datastore: ds.as_ref(),
            cancellation: cancellation.as_ref(),
            cache: &cache,
            audit: &writer,
            machine_id: Uuid::new_v4(),
            process_id,
        };

        let cancel_registry = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            cancel_registry.cancel(process_id);
        });

        let start = std::time::Instant::now();
        let outcome = execute(&s, &ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::Cancelled);
        assert!(start.elapsed().as_millis() < 1000);
    }
}
