//! Fire-and-forget audit log writer (spec §4.C/§9 design note).
//!
//! A step handler's audit write must never block or fail the step it
//! describes (spec §4.C: "MUST NOT block or fail the step"). Grounded on
//! `original_source/src/step_flow/valve_step.py`'s
//! `asyncio.create_task(_audit_log_valve_command(...))`: the handler hands
//! the record off and moves on, and a dedicated task drains the backlog
//! against the datastore. The queue is bounded; under sustained overflow it
//! drops the oldest queued record (not the newest) and logs once per drop,
//! since recent audit activity is more useful to a debugging operator than
//! stale activity from a backlog that was never going to catch up.

use crate::datastore::Datastore;
use crate::model::AuditRecord;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

struct Queue {
    records: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
    notify: Notify,
}

/// Handle passed to step handlers. Cheap to clone; all clones share the
/// same bounded queue and drain task.
#[derive(Clone)]
pub struct AuditWriter {
    queue: Arc<Queue>,
}

impl AuditWriter {
    /// Enqueues `record` for the drain task, dropping the oldest queued
    /// record first if the queue is already at capacity. Never awaits
    /// anything, so it is safe to call from inside a step handler's hot
    /// path without risking the step on a slow datastore.
    pub fn record(&self, record: AuditRecord) {
        let mut records = self.queue.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() >= self.queue.capacity {
            records.pop_front();
            warn!(capacity = self.queue.capacity, "audit queue full, dropping oldest record");
        }
        records.push_back(record);
        drop(records);
        self.queue.notify.notify_one();
    }
}

/// Spawns the drain task and returns a writer handle plus its `JoinHandle`
/// (the caller owns the task's lifetime; dropping the handle does not stop
/// the task, since `run` never checks it — shutdown is by process exit).
pub fn spawn(datastore: Arc<dyn Datastore>, capacity: usize) -> (AuditWriter, JoinHandle<()>) {
    let queue = Arc::new(Queue {
        records: Mutex::new(VecDeque::new()),
        capacity,
        notify: Notify::new(),
    });
    let writer = AuditWriter { queue: queue.clone() };
    let handle = tokio::spawn(run(queue, datastore));
    (writer, handle)
}

async fn run(queue: Arc<Queue>, datastore: Arc<dyn Datastore>) {
    loop {
        let next = queue.records.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match next {
            Some(record) => {
                if let Err(e) = datastore.insert_audit_record(record).await {
                    warn!(error = %e, "audit record write failed");
                }
            }
            None => queue.notify.notified().await,
        }
    }
}
