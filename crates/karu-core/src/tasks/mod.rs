//! Background task manager
//!
//! Typed registry of long-running jobs. Every admin operation that outlives
//! a request runs as a task: the handler spawns it, returns the id, and the
//! client polls. Jobs report progress through a shared handle and are
//! cancelled cooperatively via a `running` flag polled at loop boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

// ============================================================================
// TYPES
// ============================================================================

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A task record as returned to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    /// 0-100
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// MANAGER
// ============================================================================

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, TaskRecord>,
}

/// The background task manager.
pub struct TaskManager {
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// New task id: a short prefix plus a random tail.
    pub fn new_task_id(prefix: &str) -> String {
        let tail = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", prefix, &tail[..8])
    }

    /// Register a pending task and return its progress handle.
    pub fn register(&self, prefix: &str, message: impl Into<String>) -> TaskHandle {
        let id = Self::new_task_id(prefix);
        let record = TaskRecord {
            id: id.clone(),
            status: TaskStatus::Pending,
            progress: 0,
            message: message.into(),
            result: None,
            error: None,
            created_at: Utc::now(),
        };
        if let Ok(mut registry) = self.registry.lock() {
            registry.tasks.insert(id.clone(), record);
        }
        TaskHandle {
            id,
            registry: Arc::clone(&self.registry),
            running: Arc::clone(&self.running),
        }
    }

    /// Spawn a blocking job under a new task id. The closure receives the
    /// progress handle; its `Ok` value becomes the task result.
    pub fn spawn_blocking<F>(&self, prefix: &str, message: &str, job: F) -> String
    where
        F: FnOnce(&TaskHandle) -> Result<serde_json::Value, String> + Send + 'static,
    {
        let handle = self.register(prefix, message);
        let id = handle.id.clone();
        let _join: JoinHandle<()> = tokio::task::spawn_blocking(move || {
            handle.set_status(TaskStatus::Running);
            match job(&handle) {
                Ok(result) => handle.complete(result),
                Err(error) => handle.fail(error),
            }
        });
        id
    }

    /// Poll a task by id.
    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.registry.lock().ok()?.tasks.get(task_id).cloned()
    }

    /// Tasks that are pending or running.
    pub fn active_count(&self) -> usize {
        self.registry
            .lock()
            .map(|r| {
                r.tasks
                    .values()
                    .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop completed/failed records older than `max_age`.
    pub fn prune(&self, max_age: chrono::Duration) {
        let cutoff = Utc::now() - max_age;
        if let Ok(mut registry) = self.registry.lock() {
            registry.tasks.retain(|_, t| {
                matches!(t.status, TaskStatus::Pending | TaskStatus::Running)
                    || t.created_at > cutoff
            });
        }
    }

    /// Cooperative shutdown: jobs observe this at loop boundaries.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Progress reporter handed to a running job.
#[derive(Clone)]
pub struct TaskHandle {
    id: String,
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the manager still wants this job to run. Poll at loop
    /// boundaries.
    pub fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: TaskStatus) {
        if let Ok(mut registry) = self.registry.lock() {
            if let Some(task) = registry.tasks.get_mut(&self.id) {
                task.status = status;
            }
        }
    }

    /// Report progress as (current, total) with a message.
    pub fn update_progress(&self, current: u64, total: u64, message: impl Into<String>) {
        let percent = if total == 0 {
            100
        } else {
            ((current.min(total) * 100) / total) as u8
        };
        if let Ok(mut registry) = self.registry.lock() {
            if let Some(task) = registry.tasks.get_mut(&self.id) {
                task.progress = percent;
                task.message = message.into();
            }
        }
    }

    pub fn complete(&self, result: serde_json::Value) {
        if let Ok(mut registry) = self.registry.lock() {
            if let Some(task) = registry.tasks.get_mut(&self.id) {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.result = Some(result);
            }
        }
    }

    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        tracing::error!(task_id = %self.id, "task failed: {}", error);
        if let Ok(mut registry) = self.registry.lock() {
            if let Some(task) = registry.tasks.get_mut(&self.id) {
                task.status = TaskStatus::Failed;
                task.error = Some(error);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
