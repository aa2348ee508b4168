//! Recipe Executor (spec §4.D).
//!
//! Compiles a recipe into a step tree and progress budget, then walks it
//! sequentially, dispatching to the step handlers in [`crate::steps`] and
//! recursing into loop children itself (the loop handler only resolves
//! config — see `crate::steps::loop_step`'s doc comment). Every terminal
//! path (complete/stop/fail) goes through [`MachineStateAuthority`]
//! exclusively; there is no direct write to `Machine`/`MachineState` left
//! anywhere in this module.

use crate::audit::AuditWriter;
use crate::cache::ParameterCache;
use crate::cancellation::CancellationRegistry;
use crate::datastore::Datastore;
use crate::error::{CoreError, CoreResult};
use crate::machine_state::MachineStateAuthority;
use crate::model::{
    CurrentStepType, Progress, ProcessExecution, ProcessExecutionState, ProcessStatus, RecipeStep,
    StepType,
};
use crate::plc::Plc;
use crate::steps::{self, StepContext, StepOutcome};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashMap as Map};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Entry point the executor calls after every step, letting the continuous
/// logger snapshot one data point into the per-process stream (spec §4.D
/// step 5). [`crate::logger::ContinuousParameterLogger`] is the only real
/// implementor; tests can stub it out.
#[async_trait]
pub trait RecordOnce: Send + Sync {
    async fn record_once(&self, process_id: Uuid) -> CoreResult<()>;
}

/// A recipe compiled into a dispatchable tree plus its total progress
/// budget. Grounded on `original_source/src/recipe_flow/executor.py`'s
/// compile-then-walk split.
pub struct CompiledRecipe {
    pub top_level_steps: Vec<RecipeStep>,
    pub children_of: Map<Uuid, Vec<RecipeStep>>,
    pub total_steps: u32,
    pub total_cycles: u32,
    pub recipe_version: serde_json::Value,
}

/// Builds the step tree for `recipe_id`: groups steps by `parent_step_id`,
/// orders each group by `sequence_number`, and expands the total step/cycle
/// budget recursively through any loop nesting (spec §4.D `expand`).
pub async fn compile(datastore: &dyn Datastore, recipe_id: Uuid) -> CoreResult<CompiledRecipe> {
    let recipe = datastore.get_recipe(recipe_id).await?;
    let mut steps = datastore.get_recipe_steps(recipe_id).await?;
    if steps.is_empty() {
        return Err(CoreError::RecipeCompile(format!("recipe {recipe_id} has no steps")));
    }
    steps.sort_by_key(|s| s.sequence_number);

    let mut children_of: Map<Uuid, Vec<RecipeStep>> = HashMap::new();
    let mut top_level_steps = Vec::new();
    for step in &steps {
        match step.parent_step_id {
            Some(parent) => children_of.entry(parent).or_default().push(step.clone()),
            None => top_level_steps.push(step.clone()),
        }
    }
    for children in children_of.values_mut() {
        children.sort_by_key(|s| s.sequence_number);
    }

    let mut total_steps = 0u32;
    let mut total_cycles = 0u32;
    for step in &top_level_steps {
        total_steps += expand_steps(datastore, step, &children_of).await?;
        total_cycles += expand_cycles(datastore, step, &children_of).await?;
    }

    let recipe_version = serde_json::json!({
        "id": recipe.id,
        "name": recipe.name,
        "version": recipe.version,
        "chamber_temperature_set_point": recipe.chamber_temperature_set_point,
        "pressure_set_point": recipe.pressure_set_point,
        "steps": steps,
    });

    Ok(CompiledRecipe { top_level_steps, children_of, total_steps, total_cycles, recipe_version })
}

/// `expand(leaf) = 1`, `expand(loop) = iteration_count * sum(expand(child))`.
fn expand_steps<'a>(
    datastore: &'a dyn Datastore,
    step: &'a RecipeStep,
    children_of: &'a Map<Uuid, Vec<RecipeStep>>,
) -> BoxFuture<'a, CoreResult<u32>> {
    Box::pin(async move {
        if step.step_type != StepType::Loop {
            return Ok(1);
        }
        let sibling = datastore.get_loop_step_config(step.id).await?;
        let cfg = steps::loop_step::resolve_config(step, sibling)?;
        let children = children_of.get(&step.id).cloned().unwrap_or_default();
        let mut sum = 0u32;
        for child in &children {
            sum += expand_steps(datastore, child, children_of).await?;
        }
        Ok(cfg.iteration_count * sum)
    })
}

/// Cycles contributed by a loop: the loop's own iterations, plus each
/// nested loop's iterations repeated once per outer iteration. Leaves
/// contribute nothing.
fn expand_cycles<'a>(
    datastore: &'a dyn Datastore,
    step: &'a RecipeStep,
    children_of: &'a Map<Uuid, Vec<RecipeStep>>,
) -> BoxFuture<'a, CoreResult<u32>> {
    Box::pin(async move {
        if step.step_type != StepType::Loop {
            return Ok(0);
        }
        let sibling = datastore.get_loop_step_config(step.id).await?;
        let cfg = steps::loop_step::resolve_config(step, sibling)?;
        let children = children_of.get(&step.id).cloned().unwrap_or_default();
        let mut child_sum = 0u32;
        for child in &children {
            child_sum += expand_cycles(datastore, child, children_of).await?;
        }
        Ok(cfg.iteration_count + cfg.iteration_count * child_sum)
    })
}

/// Resolves the operator bound to a new process execution: the command's
/// explicit `operator_id` if given, else the machine's currently bound
/// operator, else `None` — an operator-less run is allowed, not fatal (spec
/// §6 supplement).
pub fn resolve_operator_id(
    command_operator_id: Option<Uuid>,
    machine_current_operator_id: Option<Uuid>,
) -> Option<Uuid> {
    command_operator_id.or(machine_current_operator_id)
}

pub struct RecipeExecutor<'a> {
    pub datastore: &'a dyn Datastore,
    pub plc: &'a dyn Plc,
    pub cancellation: &'a CancellationRegistry,
    pub cache: &'a ParameterCache,
    pub audit: &'a AuditWriter,
    pub machine_state: &'a MachineStateAuthority<'a>,
    pub recorder: Option<Arc<dyn RecordOnce>>,
}

impl<'a> RecipeExecutor<'a> {
    /// Creates the `ProcessExecution`/`ProcessExecutionState` rows for a
    /// freshly compiled recipe and runs it to completion. The caller is
    /// expected to have already moved the machine to `processing` via
    /// `MachineStateAuthority::to_processing`; this only runs the steps and
    /// drives the terminal transition back out of `processing`.
    pub async fn start_recipe(
        &self,
        machine_id: Uuid,
        process_id: Uuid,
        recipe_id: Uuid,
        operator_id: Option<Uuid>,
        session_id: Option<Uuid>,
        parameters_override: HashMap<String, f64>,
    ) -> CoreResult<()> {
        let compiled = match compile(self.datastore, recipe_id).await {
            Ok(c) => c,
            Err(e) => {
                let _ = self.machine_state.to_error(machine_id, &e.to_string()).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let setup = async {
            self.datastore
                .create_process_execution(ProcessExecution {
                    process_id,
                    recipe_id,
                    recipe_version: compiled.recipe_version.clone(),
                    session_id,
                    operator_id,
                    status: ProcessStatus::Running,
                    start_time: now,
                    end_time: None,
                    error_message: None,
                    parameters: parameters_override,
                    updated_at: now,
                })
                .await?;
            self.datastore.ensure_process_execution_state(process_id).await?;
            let mut state = self.datastore.get_process_execution_state(process_id).await?;
            state.total_overall_steps = compiled.total_steps;
            state.progress = Progress {
                total_steps: compiled.total_steps,
                completed_steps: 0,
                total_cycles: compiled.total_cycles,
                completed_cycles: 0,
            };
            state.current_step_type = CurrentStepType::Setup;
            state.current_step_name = "starting".into();
            state.last_updated = Utc::now();
            self.datastore.update_process_execution_state(state).await?;
            Ok::<(), CoreError>(())
        };

        if let Err(e) = setup.await {
            let _ = self.machine_state.to_error(machine_id, &e.to_string()).await;
            return Err(e);
        }

        self.cancellation.register(process_id);
        self.run(machine_id, process_id, &compiled).await
    }

    async fn run(&self, machine_id: Uuid, process_id: Uuid, compiled: &CompiledRecipe) -> CoreResult<()> {
        let mut overall_step = 0u32;
        for (idx, step) in compiled.top_level_steps.iter().enumerate() {
            self.datastore.touch_process_execution(process_id).await?;

            let mut state = self.datastore.get_process_execution_state(process_id).await?;
            state.current_step_index = idx as u32;
            state.current_overall_step = overall_step;
            state.last_updated = Utc::now();
            self.datastore.update_process_execution_state(state).await?;

            if self.cancellation.is_cancelled(process_id) {
                return self.terminal_stop(machine_id, process_id).await;
            }

            let ctx = StepContext {
                plc: self.plc,
                datastore: self.datastore,
                cancellation: self.cancellation,
                cache: self.cache,
                audit: self.audit,
                machine_id,
                process_id,
            };

            let outcome = self.dispatch(step, &compiled.children_of, &ctx, &mut overall_step).await;
            match outcome {
                Ok(StepOutcome::Cancelled) => return self.terminal_stop(machine_id, process_id).await,
                Ok(StepOutcome::Completed) => {}
                Err(e) => return self.terminal_fail(machine_id, process_id, &e.to_string()).await,
            }

            if let Some(recorder) = &self.recorder {
                if let Err(e) = recorder.record_once(process_id).await {
                    warn!(error = %e, "continuous logger record-once hook failed");
                }
            }

            if self.cancellation.is_cancelled(process_id) {
                return self.terminal_stop(machine_id, process_id).await;
            }
        }

        self.terminal_complete(machine_id, process_id).await
    }

    fn dispatch<'b>(
        &'b self,
        step: &'b RecipeStep,
        children_of: &'b Map<Uuid, Vec<RecipeStep>>,
        ctx: &'b StepContext<'b>,
        overall_step: &'b mut u32,
    ) -> BoxFuture<'b, CoreResult<StepOutcome>> {
        Box::pin(async move {
            match step.step_type {
                StepType::Valve => {
                    let outcome = steps::valve::execute(step, ctx).await?;
                    if outcome == StepOutcome::Completed {
                        self.increment_completed_step(ctx.process_id).await?;
                    }
                    *overall_step += 1;
                    Ok(outcome)
                }
                StepType::Purge => {
                    let outcome = steps::purge::execute(step, ctx).await?;
                    if outcome == StepOutcome::Completed {
                        self.increment_completed_step(ctx.process_id).await?;
                    }
                    *overall_step += 1;
                    Ok(outcome)
                }
                StepType::SetParameter => {
                    let outcome = steps::parameter::execute(step, ctx).await?;
                    if outcome == StepOutcome::Completed {
                        self.increment_completed_step(ctx.process_id).await?;
                    }
                    *overall_step += 1;
                    Ok(outcome)
                }
                StepType::Loop => self.dispatch_loop(step, children_of, ctx, overall_step).await,
            }
        })
    }

    async fn dispatch_loop(
        &self,
        step: &RecipeStep,
        children_of: &Map<Uuid, Vec<RecipeStep>>,
        ctx: &StepContext<'_>,
        overall_step: &mut u32,
    ) -> CoreResult<StepOutcome> {
        let sibling = ctx.datastore.get_loop_step_config(step.id).await?;
        let cfg = steps::loop_step::resolve_config(step, sibling)?;
        let children = children_of.get(&step.id).cloned().unwrap_or_default();
        if children.is_empty() {
            return Err(CoreError::RecipeCompile(format!("loop step {} has no children", step.id)));
        }

        for iteration in 1..=cfg.iteration_count {
            let mut state = ctx.datastore.get_process_execution_state(ctx.process_id).await?;
            state.current_step_type = CurrentStepType::Loop;
            state.current_step_name = step.name.clone();
            state.current_loop_count = Some(cfg.iteration_count);
            state.current_loop_iteration = Some(iteration);
            state.last_updated = Utc::now();
            ctx.datastore.update_process_execution_state(state).await?;

            if ctx.cancellation.is_cancelled(ctx.process_id) {
                return Ok(StepOutcome::Cancelled);
            }

            for child in &children {
                let outcome = self.dispatch(child, children_of, ctx, overall_step).await?;
                if outcome.is_cancelled() {
                    return Ok(StepOutcome::Cancelled);
                }
            }

            self.increment_completed_cycle(ctx.process_id).await?;
        }

        Ok(StepOutcome::Completed)
    }

    async fn increment_completed_step(&self, process_id: Uuid) -> CoreResult<()> {
        let mut state = self.datastore.get_process_execution_state(process_id).await?;
        state.progress.completed_steps = (state.progress.completed_steps + 1).min(state.progress.total_steps);
        state.last_updated = Utc::now();
        self.datastore.update_process_execution_state(state).await
    }

    async fn increment_completed_cycle(&self, process_id: Uuid) -> CoreResult<()> {
        let mut state = self.datastore.get_process_execution_state(process_id).await?;
        state.progress.completed_cycles = (state.progress.completed_cycles + 1).min(state.progress.total_cycles);
        state.last_updated = Utc::now();
        self.datastore.update_process_execution_state(state).await
    }

    async fn terminal_complete(&self, machine_id: Uuid, process_id: Uuid) -> CoreResult<()> {
        let end_time = Utc::now();
        self.datastore.complete_process_execution(process_id, end_time).await?;
        self.finalize_state(process_id, CurrentStepType::Completed, "Recipe Completed").await?;
        self.cancellation.clear(process_id);
        self.machine_state.to_idle(machine_id).await
    }

    async fn terminal_stop(&self, machine_id: Uuid, process_id: Uuid) -> CoreResult<()> {
        self.datastore.stop_process_execution(process_id).await?;
        self.cancellation.clear(process_id);
        self.machine_state.to_idle(machine_id).await
    }

    async fn terminal_fail(&self, machine_id: Uuid, process_id: Uuid, message: &str) -> CoreResult<()> {
        self.datastore.fail_process_execution(process_id, message).await?;
        let truncated = ProcessExecutionState::truncated_error_name(message);
        self.finalize_state(process_id, CurrentStepType::Error, &truncated).await?;
        self.cancellation.clear(process_id);
        self.machine_state.to_error(machine_id, message).await
    }

    async fn finalize_state(
        &self,
        process_id: Uuid,
        step_type: CurrentStepType,
        name: &str,
    ) -> CoreResult<()> {
        let mut state = self.datastore.get_process_execution_state(process_id).await?;
        state.current_step_type = step_type;
        state.current_step_name = name.to_string();
        state.last_updated = Utc::now();
        self.datastore.update_process_execution_state(state).await
    }
}
