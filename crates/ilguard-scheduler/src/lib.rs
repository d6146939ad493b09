//! Cancellable task scheduling on the tokio runtime.
//!
//! Every timer owned by the coordinator (session timeouts, settlement
//! retries, batch cycles, cleanup and expiry sweeps) is registered here so
//! shutdown can cancel all of them in one call.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("No tokio runtime available to schedule task")]
    NoRuntime,

    #[error("Periodic task period must be non-zero")]
    ZeroPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type TaskMap = Mutex<HashMap<TaskId, JoinHandle<()>>>;

/// Owner of spawned timers. Dropping the scheduler aborts everything it
/// still tracks.
pub struct TaskScheduler {
    name: &'static str,
    tasks: Arc<TaskMap>,
}

impl TaskScheduler {
    pub fn new(name: &'static str) -> Self {
        TaskScheduler {
            name,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `task` once after `delay`. The entry is released just before
    /// the task body runs, so cancelling a fired task returns `false`.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> Result<TaskId, SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let id = TaskId::new();
        let registry: Weak<TaskMap> = Arc::downgrade(&self.tasks);
        let name = self.name;

        // Hold the lock across spawn so the task cannot observe the map
        // before its own entry exists.
        let mut tasks = self.tasks.lock();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(registry) = registry.upgrade() {
                registry.lock().remove(&id);
            }
            trace!(scheduler = name, task = %id, "one-shot task fired");
            task.await;
        });
        tasks.insert(id, handle);
        debug!(scheduler = self.name, task = %id, delay_ms = delay.as_millis() as u64, "scheduled one-shot task");
        Ok(id)
    }

    /// Run `task` every `period`, first after one full period.
    pub fn schedule_periodic<F>(&self, period: Duration, mut task: F) -> Result<TaskId, SchedulerError>
    where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(SchedulerError::ZeroPeriod);
        }
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let id = TaskId::new();

        let mut tasks = self.tasks.lock();
        let handle = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        tasks.insert(id, handle);
        debug!(scheduler = self.name, task = %id, period_ms = period.as_millis() as u64, "scheduled periodic task");
        Ok(id)
    }

    /// Abort a pending task. Returns `false` if it already fired or was
    /// never scheduled here.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.tasks.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                trace!(scheduler = self.name, task = %id, "task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        let count = drained.len();
        for (_, handle) in drained {
            handle.abort();
        }
        if count > 0 {
            debug!(scheduler = self.name, cancelled = count, "cancelled all tasks");
        }
        count
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("name", &self.name)
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}
