use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{JobId, JobStatus, SandboxKind};
use crate::privacy::AppliedPrivacy;
use crate::task::{TaskId, TaskStatus, TaskType, VerificationLevel};
use crate::worker::WorkerId;

/// Resultado de un job tal como lo reporta el worker. `output` y `error` son excluyentes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub success: bool,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub runtime_ms: u64,
    pub worker_id: WorkerId,
    pub attempt: u32,
    /// Backend que ejecutó el job, después de recorrer la cadena de fallback.
    #[serde(default)]
    pub sandbox: Option<SandboxKind>,
}

impl JobResult {
    pub fn ok(task_id: &str, job_id: &str, worker_id: &str, attempt: u32, output: Value, runtime_ms: u64) -> Self {
        Self {
            task_id: task_id.to_string(),
            job_id: job_id.to_string(),
            success: true,
            output: Some(output),
            error: None,
            runtime_ms,
            worker_id: worker_id.to_string(),
            attempt,
            sandbox: None,
        }
    }

    pub fn failed(task_id: &str, job_id: &str, worker_id: &str, attempt: u32, error: impl Into<String>, runtime_ms: u64) -> Self {
        Self {
            task_id: task_id.to_string(),
            job_id: job_id.to_string(),
            success: false,
            output: None,
            error: Some(error.into()),
            runtime_ms,
            worker_id: worker_id.to_string(),
            attempt,
            sandbox: None,
        }
    }
}

/// Transición registrada por el scheduler; la lista por tarea es cronológica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub at: DateTime<Utc>,
    pub task_id: TaskId,
    pub job_id: JobId,
    #[serde(default)]
    pub from: Option<JobStatus>,
    #[serde(default)]
    pub to: Option<JobStatus>,
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    pub attempt: u32,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounters {
    pub pending: u64,
    pub assigned: u64,
    pub acked: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
    pub duplicate_results: u64,
    pub penalties: u64,
}

impl StatusCounters {
    pub fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Assigned => self.assigned += 1,
            JobStatus::Acked => self.acked += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Expired => self.expired += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.assigned + self.acked + self.running + self.completed + self.failed + self.expired
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Jobs registrados al aceptar (primera capa en pipelines, sin réplicas).
    pub jobs: usize,
    pub privacy: Vec<AppliedPrivacy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub failure: Option<TaskFailure>,
    pub privacy: Vec<AppliedPrivacy>,
    pub verification: VerificationLevel,
    pub counters: StatusCounters,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}
