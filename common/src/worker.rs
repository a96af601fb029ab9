use serde::{Deserialize, Serialize};

use crate::protocol::MessageEnvelope;

pub type WorkerId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
    /// Id de nodo del coordinador, para el campo `dst_node` de los sobres.
    pub coordinator_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub mem_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxPollRequest {
    pub node_id: WorkerId,
    #[serde(default = "default_poll_max")]
    pub max: usize,
}

fn default_poll_max() -> usize {
    16
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailboxPollResponse {
    pub envelopes: Vec<MessageEnvelope>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub dead: bool,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub active_jobs: u32,
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub avg_job_ms: Option<f64>,
    pub reputation: f64,
    pub penalties: u32,
    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ClusterStats {
    pub tasks_total: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub jobs: crate::results::StatusCounters,
    pub workers_alive: u64,
    pub workers_dead: u64,
}
