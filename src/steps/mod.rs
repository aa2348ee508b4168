//! Step handlers: the polymorphic per-step-type side effects the executor
//! dispatches to.
//!
//! Every handler obeys the same five-part contract (spec §4.C): config-first
//! with inline fallback, a state preamble before any side effect, a
//! cancellation check, the side effect itself, then a typed result. Grounded
//! on the validate/execute/verify shape of `procedures/step.rs`'s
//! `ProcedureStep`, generalized from instrument moves to valve/purge/
//! parameter/loop actuation.

pub mod loop_step;
pub mod parameter;
pub mod purge;
pub mod valve;

use crate::audit::AuditWriter;
use crate::cache::ParameterCache;
use crate::cancellation::CancellationRegistry;
use crate::datastore::Datastore;
use crate::error::CoreResult;
use crate::plc::Plc;
use uuid::Uuid;

/// Shared collaborators a step handler needs. Carries no per-step data; the
/// step row and its sibling config are passed into `execute` directly.
pub struct StepContext<'a> {
    pub plc: &'a dyn Plc,
    pub datastore: &'a dyn Datastore,
    pub cancellation: &'a CancellationRegistry,
    pub cache: &'a ParameterCache,
    pub audit: &'a AuditWriter,
    pub machine_id: Uuid,
    pub process_id: Uuid,
}

/// Result of dispatching one step. `Cancelled` short-circuits the caller
/// (executor or loop handler) without being an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Cancelled,
}

impl StepOutcome {
    pub fn is_cancelled(self) -> bool {
        matches!(self, StepOutcome::Cancelled)
    }
}

/// Polls the cancellation registry in a tight loop while sleeping for
/// `total_ms`, returning early the moment cancellation is observed. Used by
/// the purge handler and by the loop handler's between-iteration waits
/// (spec §4.A: "poll ... at every step boundary and inside long waits on a
/// tight interval (≤250 ms)").
pub(crate) async fn cancellable_sleep(
    cancellation: &CancellationRegistry,
    process_id: Uuid,
    total_ms: u64,
) -> StepOutcome {
    const POLL_INTERVAL_MS: u64 = 250;
    let mut remaining = total_ms;
    while remaining > 0 {
        if cancellation.is_cancelled(process_id) {
            return StepOutcome::Cancelled;
        }
        let slice = remaining.min(POLL_INTERVAL_MS);
        tokio::time::sleep(std::time::Duration::from_millis(slice)).await;
        remaining -= slice;
    }
    if cancellation.is_cancelled(process_id) {
        StepOutcome::Cancelled
    } else {
        StepOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellable_sleep_runs_to_completion_when_not_cancelled() {
        let registry = CancellationRegistry::new();
        let pid = Uuid::new_v4();
        let outcome = cancellable_sleep(&registry, pid, 10).await;
        assert_eq!(outcome, StepOutcome::Completed);
    }

    #[tokio::test]
    async fn cancellable_sleep_exits_early_once_cancelled() {
        let registry = CancellationRegistry::new();
        let pid = Uuid::new_v4();
        registry.cancel(pid);
        let outcome = cancellable_sleep(&registry, pid, 10_000).await;
        assert_eq!(outcome, StepOutcome::Cancelled);
    }
}
