//! The body every pool worker thread runs (component J "getTask"
//! policy and the before/after-execute hooks).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::TaskFailure;

use super::{Job, Shared};

/// How often a worker below `core_pool_size` wakes up from an
/// otherwise-idle wait to re-check whether the pool has been shut down.
/// Since [`crate::queue::Queue::take`] has no built-in shutdown signal,
/// every worker polls with a timeout rather than blocking indefinitely
/// on the queue, even while under `core_pool_size` — the cost is a
/// periodic wakeup while idle, in exchange for a graceful shutdown that
/// does not depend on one more task arriving to unblock a `take()`.
const SHUTDOWN_POLL_TICK: Duration = Duration::from_millis(100);

pub(super) fn run_worker(shared: Arc<Shared>, name: String, first_task: Option<Job>) {
    trace!(worker = %name, "worker started");
    if let Some(job) = first_task {
        run_job(&shared, &name, job);
    }

    loop {
        let above_core = {
            let state = shared.state.lock();
            state.pool_size > shared.core_pool_size
        };
        let effective_timeout = if above_core {
            shared.keep_alive
        } else {
            SHUTDOWN_POLL_TICK
        };

        match shared.queue.poll_timeout(effective_timeout) {
            Some(job) => run_job(&shared, &name, job),
            None => {
                if !shared.is_running() && shared.queue.is_empty() {
                    trace!(worker = %name, "worker exiting: pool shut down and queue drained");
                    break;
                }
                if above_core {
                    // Idle past keep-alive with no work: retire back
                    // down toward core_pool_size.
                    trace!(worker = %name, "worker exiting: idle past keep-alive");
                    break;
                }
            }
        }
    }

    shared.note_retired();
}

fn run_job(shared: &Arc<Shared>, name: &str, job: Job) {
    shared.observer.before_execute(name);
    shared.note_active(1);
    let outcome = catch_unwind(AssertUnwindSafe(job));
    shared.note_active(-1);
    shared.note_completed();
    match outcome {
        Ok(()) => shared.observer.after_execute(name, None),
        Err(payload) => {
            let failure = TaskFailure::Panic(payload);
            shared.observer.after_execute(name, Some(&failure));
        }
    }
}
