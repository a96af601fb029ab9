use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use common::results::{JobResult, SchedulerEvent};
use common::{Job, JobId, JobStatus, TaskId, WorkerId};

/// Estado de un job. Sólo el scheduler lo modifica; hacia afuera salen copias.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job: Job,
    pub status: JobStatus,
    /// Intento en curso, empieza en 1.
    pub attempt: u32,
    pub max_attempts: u32,
    pub assigned_to: Option<WorkerId>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Motivo del FAILED definitivo.
    pub failure_reason: Option<String>,
    pub result: Option<JobResult>,
    pub duplicate_results: u32,
    /// Intento con el que se hizo la última asignación.
    pub assigned_attempt: Option<u32>,
    /// Workers que recibieron este job, en orden.
    pub tried_workers: Vec<WorkerId>,
    /// Workers a los que no se vuelve a asignar (rechazo o fallo permanente).
    pub excluded_workers: HashSet<WorkerId>,
    /// Orden de registro, para despachar de forma estable.
    pub seq: u64,
}

impl JobRecord {
    pub fn new(job: Job, seq: u64) -> Self {
        Self {
            status: JobStatus::Pending,
            attempt: 1,
            max_attempts: job.max_attempts.max(1),
            assigned_to: None,
            assigned_at: None,
            deadline: None,
            next_retry_at: None,
            last_error: None,
            failure_reason: None,
            result: None,
            duplicate_results: 0,
            assigned_attempt: None,
            tried_workers: Vec::new(),
            excluded_workers: HashSet::new(),
            seq,
            job,
        }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        self.result.as_ref().and_then(|r| r.output.as_ref())
    }
}

// Un lock envenenado no invalida los datos: cada transición deja el registro consistente.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

/// Almacén de registros de jobs: un mutex por job y eventos por tarea.
#[derive(Default)]
pub struct SchedulerState {
    records: RwLock<HashMap<JobId, Arc<Mutex<JobRecord>>>>,
    by_task: RwLock<HashMap<TaskId, Vec<JobId>>>,
    events: Mutex<HashMap<TaskId, Vec<SchedulerEvent>>>,
    seq: AtomicU64,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserta todos o ninguno. Devuelve el primer id repetido si lo hay.
    pub(crate) fn insert_all(&self, task_id: &str, jobs: &[Job]) -> Result<(), JobId> {
        let mut records = write(&self.records);
        let mut seen = HashSet::new();
        for job in jobs {
            if records.contains_key(&job.id) || !seen.insert(job.id.as_str()) {
                return Err(job.id.clone());
            }
        }
        let mut by_task = write(&self.by_task);
        let ids = by_task.entry(task_id.to_string()).or_default();
        for job in jobs {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            records.insert(job.id.clone(), Arc::new(Mutex::new(JobRecord::new(job.clone(), seq))));
            ids.push(job.id.clone());
        }
        Ok(())
    }

    pub(crate) fn get(&self, job_id: &str) -> Option<Arc<Mutex<JobRecord>>> {
        read(&self.records).get(job_id).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Mutex<JobRecord>>> {
        read(&self.records).values().cloned().collect()
    }

    pub(crate) fn of_task(&self, task_id: &str) -> Vec<Arc<Mutex<JobRecord>>> {
        let ids = read(&self.by_task).get(task_id).cloned().unwrap_or_default();
        let records = read(&self.records);
        ids.iter().filter_map(|id| records.get(id).cloned()).collect()
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobRecord> {
        self.get(job_id).map(|r| lock(&r).clone())
    }

    pub(crate) fn push_event(&self, event: SchedulerEvent) {
        lock(&self.events).entry(event.task_id.clone()).or_default().push(event);
    }

    pub fn events(&self, task_id: &str) -> Vec<SchedulerEvent> {
        lock(&self.events).get(task_id).cloned().unwrap_or_default()
    }

    /// Saca de la tabla todos los jobs y eventos de la tarea. Devuelve cuántos jobs había.
    pub(crate) fn remove_task(&self, task_id: &str) -> usize {
        let ids = write(&self.by_task).remove(task_id).unwrap_or_default();
        let mut records = write(&self.records);
        for id in &ids {
            records.remove(id);
        }
        drop(records);
        lock(&self.events).remove(task_id);
        ids.len()
    }

    pub fn len(&self) -> usize {
        read(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
