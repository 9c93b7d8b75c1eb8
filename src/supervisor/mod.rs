// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Task Supervisor
//!
//! Runs named, cancellable background operations on the tokio runtime.
//!
//! * A name maps to at most one live task; starting a second one under the
//!   same name fails with [`BenchError::DuplicateTask`].
//! * Cancellation is cooperative. The operation receives a
//!   [`CancellationToken`] and must watch it at its suspension points, then
//!   run its own cleanup before returning.
//! * Whatever the way a task ends (normally, with an error, cancelled or by
//!   panicking) its registry entry is removed before its outcome is
//!   published, so the name can be reused as soon as a waiter wakes up.
//!
//! ## Usage
//!
//! ```no_run
//! use rust_ddii_bench::supervisor::{TaskSupervisor, TaskOutcome};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let supervisor = TaskSupervisor::new();
//! supervisor.create_task("measure", |cancel| async move {
//!     cancel.cancelled().await;
//!     Err(rust_ddii_bench::error::BenchError::Cancelled)
//! })?;
//! let outcome = supervisor.cancel_task("measure").await?;
//! assert_eq!(outcome, TaskOutcome::Cancelled);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{BenchError, BenchResult};

/// How a supervised task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Notifications published by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    TaskStarted(String),
    TaskFinished { name: String, outcome: TaskOutcome },
}

struct TaskEntry {
    id: u64,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

/// Reference to a task returned by [`TaskSupervisor::create_task`]
///
/// Unlike [`TaskSupervisor::await_task`], waiting on the handle works even
/// after the task has left the registry.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: String,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation without waiting
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the task has finished and its cleanup has run
    pub async fn wait(&self) -> TaskOutcome {
        wait_outcome(self.outcome.clone()).await
    }
}

async fn wait_outcome(mut rx: watch::Receiver<Option<TaskOutcome>>) -> TaskOutcome {
    match rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => outcome.clone().unwrap_or(TaskOutcome::Completed),
        Err(_) => TaskOutcome::Failed("task vanished without an outcome".to_string()),
    }
}

/// Registry of named background tasks
#[derive(Clone)]
pub struct TaskSupervisor {
    registry: Arc<Mutex<HashMap<String, TaskEntry>>>,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Names of the live tasks, sorted
    pub fn running_tasks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Start `operation` under `name`
    ///
    /// ### Errors
    ///
    /// `DuplicateTask` when a task with the same name is still live.
    pub fn create_task<F, Fut>(&self, name: &str, operation: F) -> BenchResult<TaskHandle>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = BenchResult<()>> + Send + 'static,
    {
        let mut registry = self.lock();
        if registry.contains_key(name) {
            return Err(BenchError::DuplicateTask(name.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        registry.insert(
            name.to_string(),
            TaskEntry {
                id,
                cancel: cancel.clone(),
                outcome: outcome_rx.clone(),
            },
        );
        drop(registry);

        info!("Task '{name}' started");
        let _ = self.events.send(SupervisorEvent::TaskStarted(name.to_string()));

        let fut = operation(cancel.clone());
        let token = cancel.clone();
        let task_name = name.to_string();
        let registry_ref = self.registry.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let outcome = match tokio::spawn(fut).await {
                Ok(Ok(())) if token.is_cancelled() => TaskOutcome::Cancelled,
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(BenchError::Cancelled)) => TaskOutcome::Cancelled,
                Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
                Err(join_err) => {
                    error!("Task '{task_name}' panicked: {join_err}");
                    TaskOutcome::Failed(format!("panicked: {join_err}"))
                }
            };

            {
                let mut registry = registry_ref
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if registry.get(&task_name).is_some_and(|e| e.id == id) {
                    registry.remove(&task_name);
                }
            }

            match &outcome {
                TaskOutcome::Failed(reason) => warn!("Task '{task_name}' failed: {reason}"),
                other => debug!("Task '{task_name}' finished: {other:?}"),
            }
            outcome_tx.send_replace(Some(outcome.clone()));
            let _ = events.send(SupervisorEvent::TaskFinished {
                name: task_name,
                outcome,
            });
        });

        Ok(TaskHandle {
            name: name.to_string(),
            cancel,
            outcome: outcome_rx,
        })
    }

    /// Cancel `name` and wait until its cleanup has finished
    ///
    /// ### Errors
    ///
    /// `NoSuchTask` when no live task has that name.
    pub async fn cancel_task(&self, name: &str) -> BenchResult<TaskOutcome> {
        let (cancel, rx) = {
            let registry = self.lock();
            let entry = registry
                .get(name)
                .ok_or_else(|| BenchError::NoSuchTask(name.to_string()))?;
            (entry.cancel.clone(), entry.outcome.clone())
        };
        info!("Cancelling task '{name}'");
        cancel.cancel();
        Ok(wait_outcome(rx).await)
    }

    /// Wait for `name` to finish
    ///
    /// ### Errors
    ///
    /// `NoSuchTask` when no live task has that name.
    pub async fn await_task(&self, name: &str) -> BenchResult<TaskOutcome> {
        let rx = {
            let registry = self.lock();
            registry
                .get(name)
                .map(|entry| entry.outcome.clone())
                .ok_or_else(|| BenchError::NoSuchTask(name.to_string()))?
        };
        Ok(wait_outcome(rx).await)
    }

    /// Cancel every live task and wait for all of them
    pub async fn cancel_all(&self) {
        for name in self.running_tasks() {
            if let Ok(outcome) = self.cancel_task(&name).await {
                debug!("Task '{name}' stopped: {outcome:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let supervisor = TaskSupervisor::new();
        supervisor
            .create_task("measure", |cancel| async move {
                cancel.cancelled().await;
                Ok(())
            })
            .unwrap();
        let second = supervisor.create_task("measure", |_| async { Ok(()) });
        assert!(matches!(second, Err(BenchError::DuplicateTask(name)) if name == "measure"));

        assert_eq!(
            supervisor.cancel_task("measure").await.unwrap(),
            TaskOutcome::Cancelled
        );
        // The name is free again right after cancellation
        let handle = supervisor.create_task("measure", |_| async { Ok(()) }).unwrap();
        assert_eq!(handle.wait().await, TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_cleanup() {
        let supervisor = TaskSupervisor::new();
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        supervisor
            .create_task("sweep", move |cancel| async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
                Err(BenchError::Cancelled)
            })
            .unwrap();

        supervisor.cancel_task("sweep").await.unwrap();
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(!supervisor.is_running("sweep"));
    }

    async fn explode() -> BenchResult<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_failures_and_panics_leave_no_entry() {
        let supervisor = TaskSupervisor::new();
        let failed = supervisor
            .create_task("bad", |_| async {
                Err(BenchError::DeviceNotReady("source".to_string()))
            })
            .unwrap();
        assert!(matches!(failed.wait().await, TaskOutcome::Failed(_)));

        let panicked = supervisor.create_task("worse", |_| explode()).unwrap();
        assert!(matches!(panicked.wait().await, TaskOutcome::Failed(_)));
        assert!(supervisor.running_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_names() {
        let supervisor = TaskSupervisor::new();
        assert!(matches!(
            supervisor.cancel_task("ghost").await,
            Err(BenchError::NoSuchTask(_))
        ));
        assert!(matches!(
            supervisor.await_task("ghost").await,
            Err(BenchError::NoSuchTask(_))
        ));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let supervisor = TaskSupervisor::new();
        let mut events = supervisor.subscribe();
        let handle = supervisor.create_task("probe", |_| async { Ok(()) }).unwrap();
        handle.wait().await;

        assert_eq!(
            events.recv().await.unwrap(),
            SupervisorEvent::TaskStarted("probe".to_string())
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SupervisorEvent::TaskFinished {
                name: "probe".to_string(),
                outcome: TaskOutcome::Completed
            }
        );
    }
}
