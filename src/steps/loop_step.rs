//! Loop step support (spec §4.C "Loop").
//!
//! A loop step carries no side effect of its own: it resolves its
//! `iteration_count` and ordered child steps, then the caller (the
//! executor's recursive step dispatcher) is responsible for the actual
//! iterate-and-dispatch-children walk, since that requires access to the
//! full step dispatch table rather than just this module's collaborators.

use crate::error::{CoreError, CoreResult};
use crate::model::{LoopStepConfig, RecipeStep};

/// Resolves the sibling `loop_step_config` row, falling back to the step's
/// inline parameters. Fatal on miss — there is no safe default iteration
/// count.
pub fn resolve_config(step: &RecipeStep, sibling: Option<LoopStepConfig>) -> CoreResult<LoopStepConfig> {
    if let Some(cfg) = sibling {
        if cfg.iteration_count > 0 {
            return Ok(cfg);
        }
    }

    let iteration_count = step
        .inline_parameters
        .get("iteration_count")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    match iteration_count {
        Some(iteration_count) if iteration_count > 0 => {
            Ok(LoopStepConfig { step_id: step.id, iteration_count })
        }
        _ => Err(CoreError::StepConfigMissing(format!(
            "loop step {} has no usable iteration_count",
            step.id
        ))),
    }
}

/// Total leaf-step expansion of a subtree rooted at a step with the given
/// resolved type, per spec §4.D's `expand`: `expand(loop) = iteration_count
/// × Σ expand(child)`, `expand(leaf) = 1`.
pub fn expand_leaf_count(iteration_count: u32, children_expansion: u32) -> u32 {
    iteration_count * children_expansion
}
