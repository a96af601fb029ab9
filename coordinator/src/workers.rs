use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use common::pricing::Budget;
use common::worker::{WorkerHeartbeatRequest, WorkerMetrics};
use common::WorkerId;

use crate::state::lock;
use crate::verification::ReputationStore;

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: DateTime<Utc>,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub total_job_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

#[derive(Default)]
struct Registry {
    workers: HashMap<WorkerId, WorkerMeta>,
    // orden de registro, para el round-robin
    order: Vec<WorkerId>,
    rr_cursor: usize,
}

/// Workers conocidos por el coordinador.
#[derive(Default)]
pub struct WorkerRegistry {
    inner: Mutex<Registry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hostname: &str, max_concurrency: u32, now: DateTime<Utc>) -> WorkerId {
        let worker_id = uuid::Uuid::new_v4().to_string();
        self.register_with_id(&worker_id, hostname, max_concurrency, now);
        worker_id
    }

    pub fn register_with_id(&self, worker_id: &str, hostname: &str, max_concurrency: u32, now: DateTime<Utc>) {
        let mut reg = lock(&self.inner);
        let meta = WorkerMeta {
            hostname: hostname.to_string(),
            last_heartbeat: now,
            dead: false,
            max_concurrency: max_concurrency.max(1),
            jobs_started: 0,
            jobs_succeeded: 0,
            jobs_failed: 0,
            total_job_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        };
        if reg.workers.insert(worker_id.to_string(), meta).is_none() {
            reg.order.push(worker_id.to_string());
        }
        info!(
            "worker registrado: {} ({}, max_concurrency={})",
            worker_id, hostname, max_concurrency
        );
    }

    /// Devuelve `false` si el worker no existe.
    pub fn heartbeat(&self, req: &WorkerHeartbeatRequest, now: DateTime<Utc>) -> bool {
        let mut reg = lock(&self.inner);
        let Some(meta) = reg.workers.get_mut(&req.worker_id) else {
            return false;
        };
        if meta.dead {
            info!("worker {} volvió a enviar heartbeat, se marca vivo", req.worker_id);
            meta.dead = false;
        }
        meta.last_heartbeat = now;
        meta.last_cpu_percent = req.cpu_percent.or(meta.last_cpu_percent);
        meta.last_mem_bytes = req.mem_bytes.or(meta.last_mem_bytes);
        true
    }

    /// Marca DEAD a los que no mandan heartbeat hace más de `timeout`. Devuelve los nuevos muertos.
    pub fn mark_dead_workers(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<WorkerId> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let mut reg = lock(&self.inner);
        let mut newly_dead = Vec::new();
        for (worker_id, meta) in reg.workers.iter_mut() {
            if meta.dead {
                continue;
            }
            let elapsed = now - meta.last_heartbeat;
            if elapsed > timeout {
                meta.dead = true;
                warn!(
                    "marcando worker {} como DEAD (sin heartbeat hace {}s)",
                    worker_id,
                    elapsed.num_seconds()
                );
                newly_dead.push(worker_id.clone());
            }
        }
        newly_dead.sort();
        newly_dead
    }

    /// Round-robin sobre workers vivos, con capacidad libre, no excluidos, con reputación
    /// suficiente y cuya cotización entre en el presupuesto del job.
    pub fn pick(
        &self,
        exclude: &HashSet<WorkerId>,
        load: &HashMap<WorkerId, u32>,
        reputation: &dyn ReputationStore,
        min_reputation: f64,
        budget: &Budget,
    ) -> Option<WorkerId> {
        let mut reg = lock(&self.inner);
        let n = reg.order.len();
        for step in 0..n {
            let idx = (reg.rr_cursor + step) % n;
            let candidate = &reg.order[idx];
            let Some(meta) = reg.workers.get(candidate) else {
                continue;
            };
            let active = load.get(candidate).copied().unwrap_or(0);
            let score = reputation.score(candidate);
            let eligible = !meta.dead
                && !exclude.contains(candidate)
                && active < meta.max_concurrency
                && score >= min_reputation
                && budget.admits(score);
            if eligible {
                let chosen = candidate.clone();
                reg.rr_cursor = (idx + 1) % n;
                return Some(chosen);
            }
        }
        None
    }

    /// Hay algún worker vivo, no excluido, con reputación suficiente y dentro del presupuesto,
    /// esté o no ocupado.
    pub fn has_candidate(
        &self,
        exclude: &HashSet<WorkerId>,
        reputation: &dyn ReputationStore,
        min_reputation: f64,
        budget: &Budget,
    ) -> bool {
        lock(&self.inner).workers.iter().any(|(id, meta)| {
            let score = reputation.score(id);
            !meta.dead && !exclude.contains(id) && score >= min_reputation && budget.admits(score)
        })
    }

    /// Olvida a los workers muertos cuyo último heartbeat es más viejo que `retention`.
    /// Un worker olvidado que vuelve tiene que registrarse de nuevo.
    pub fn forget_dead(&self, now: DateTime<Utc>, retention: Duration) -> Vec<WorkerId> {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut reg = lock(&self.inner);
        let mut forgotten: Vec<WorkerId> = reg
            .workers
            .iter()
            .filter(|(_, meta)| meta.dead && now - meta.last_heartbeat > retention)
            .map(|(id, _)| id.clone())
            .collect();
        if forgotten.is_empty() {
            return forgotten;
        }
        forgotten.sort();
        for id in &forgotten {
            reg.workers.remove(id);
            info!("worker {} olvidado tras {}s muerto", id, retention.num_seconds());
        }
        reg.order.retain(|id| !forgotten.contains(id));
        if reg.order.is_empty() {
            reg.rr_cursor = 0;
        } else {
            reg.rr_cursor %= reg.order.len();
        }
        forgotten
    }

    pub fn record_started(&self, worker_id: &str) {
        if let Some(meta) = lock(&self.inner).workers.get_mut(worker_id) {
            meta.jobs_started += 1;
        }
    }

    pub fn record_result(&self, worker_id: &str, success: bool, runtime_ms: u64) {
        if let Some(meta) = lock(&self.inner).workers.get_mut(worker_id) {
            meta.total_job_time_ms += runtime_ms;
            if success {
                meta.jobs_succeeded += 1;
            } else {
                meta.jobs_failed += 1;
            }
        }
    }

    pub fn is_known(&self, worker_id: &str) -> bool {
        lock(&self.inner).workers.contains_key(worker_id)
    }

    /// (vivos, muertos)
    pub fn counts(&self) -> (u64, u64) {
        let reg = lock(&self.inner);
        let dead = reg.workers.values().filter(|m| m.dead).count() as u64;
        (reg.workers.len() as u64 - dead, dead)
    }

    pub fn metrics(
        &self,
        now: DateTime<Utc>,
        load: &HashMap<WorkerId, u32>,
        reputation: &dyn ReputationStore,
    ) -> Vec<WorkerMetrics> {
        let reg = lock(&self.inner);
        reg.order
            .iter()
            .filter_map(|wid| reg.workers.get(wid).map(|meta| (wid, meta)))
            .map(|(wid, meta)| {
                let avg_ms = if meta.jobs_succeeded > 0 {
                    Some(meta.total_job_time_ms as f64 / meta.jobs_succeeded as f64)
                } else {
                    None
                };
                WorkerMetrics {
                    worker_id: wid.clone(),
                    hostname: meta.hostname.clone(),
                    dead: meta.dead,
                    max_concurrency: meta.max_concurrency,
                    last_heartbeat_secs_ago: (now - meta.last_heartbeat).num_seconds().max(0) as u64,
                    active_jobs: load.get(wid).copied().unwrap_or(0),
                    jobs_started: meta.jobs_started,
                    jobs_succeeded: meta.jobs_succeeded,
                    jobs_failed: meta.jobs_failed,
                    avg_job_ms: avg_ms,
                    reputation: reputation.score(wid),
                    penalties: reputation.penalties(wid),
                    last_cpu_percent: meta.last_cpu_percent,
                    last_mem_bytes: meta.last_mem_bytes,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::InMemoryReputation;

    fn registry(now: DateTime<Utc>) -> WorkerRegistry {
        let r = WorkerRegistry::new();
        r.register_with_id("w1", "h1", 1, now);
        r.register_with_id("w2", "h2", 1, now);
        r.register_with_id("w3", "h3", 2, now);
        r
    }

    #[test]
    fn round_robin_reparte_entre_workers() {
        let now = Utc::now();
        let r = registry(now);
        let rep = InMemoryReputation::new();
        let none = HashSet::new();
        let load = HashMap::new();
        let picks: Vec<_> = (0..4).filter_map(|_| r.pick(&none, &load, &rep, 0.2, &Budget::unlimited())).collect();
        assert_eq!(picks, vec!["w1", "w2", "w3", "w1"]);
    }

    #[test]
    fn pick_salta_excluidos_llenos_y_mal_reputados() {
        let now = Utc::now();
        let r = registry(now);
        let rep = InMemoryReputation::new();
        for _ in 0..5 {
            rep.penalize("w3", "output discrepante");
        }
        let exclude: HashSet<WorkerId> = ["w1".to_string()].into();
        let load: HashMap<WorkerId, u32> = [("w2".to_string(), 1)].into();
        assert_eq!(r.pick(&exclude, &load, &rep, 0.2, &Budget::unlimited()), None);

        let load = HashMap::new();
        assert_eq!(r.pick(&exclude, &load, &rep, 0.2, &Budget::unlimited()).as_deref(), Some("w2"));
    }

    #[test]
    fn sin_heartbeat_se_marca_muerto_y_revive_con_heartbeat() {
        let now = Utc::now();
        let r = registry(now);
        let later = now + chrono::Duration::seconds(30);
        r.heartbeat(
            &WorkerHeartbeatRequest {
                worker_id: "w2".into(),
                cpu_percent: Some(12.5),
                mem_bytes: Some(1024),
            },
            later,
        );
        let dead = r.mark_dead_workers(later, Duration::from_secs(20));
        assert_eq!(dead, vec!["w1".to_string(), "w3".to_string()]);
        assert_eq!(r.counts(), (1, 2));

        let rep = InMemoryReputation::new();
        let picks: Vec<_> = (0..2)
            .filter_map(|_| r.pick(&HashSet::new(), &HashMap::new(), &rep, 0.2, &Budget::unlimited()))
            .collect();
        assert_eq!(picks, vec!["w2", "w2"]);

        assert!(r.heartbeat(
            &WorkerHeartbeatRequest { worker_id: "w1".into(), cpu_percent: None, mem_bytes: None },
            later,
        ));
        assert_eq!(r.counts(), (2, 1));
        assert!(!r.heartbeat(
            &WorkerHeartbeatRequest { worker_id: "nadie".into(), cpu_percent: None, mem_bytes: None },
            later,
        ));
    }

    #[test]
    fn metricas_incluyen_reputacion_y_promedio() {
        let now = Utc::now();
        let r = registry(now);
        let rep = InMemoryReputation::new();
        rep.penalize("w1", "output discrepante");
        r.record_started("w1");
        r.record_result("w1", true, 30);
        r.record_result("w1", true, 10);
        r.record_result("w1", false, 5);
        let load: HashMap<WorkerId, u32> = [("w1".to_string(), 1)].into();
        let m = r.metrics(now, &load, &rep);
        assert_eq!(m.len(), 3);
        let w1 = &m[0];
        assert_eq!(w1.worker_id, "w1");
        assert_eq!((w1.jobs_succeeded, w1.jobs_failed, w1.active_jobs), (2, 1, 1));
        assert_eq!(w1.avg_job_ms, Some(22.5));
        assert_eq!(w1.penalties, 1);
        assert!((w1.reputation - 0.8).abs() < 1e-12);
    }

    #[test]
    fn presupuesto_deja_fuera_a_los_workers_caros() {
        use common::pricing::{self, Budget};
        use common::task::{Priority, ResourceRequirements};

        let now = Utc::now();
        let r = registry(now);
        let rep = InMemoryReputation::new();
        // w1 queda con 0.6 de reputación: multiplicador 1.0 en vez de 0.8
        rep.penalize("w1", "output discrepante");
        rep.penalize("w1", "output discrepante");

        let requirements = ResourceRequirements::default();
        let best = pricing::job_quote(&requirements, Priority::Normal, 1.0);
        let budget = Budget {
            requirements,
            priority: Priority::Normal,
            max_price: best * 1.05,
        };
        let none = HashSet::new();
        let load = HashMap::new();
        let picks: Vec<_> = (0..3).filter_map(|_| r.pick(&none, &load, &rep, 0.2, &budget)).collect();
        assert_eq!(picks, vec!["w2", "w3", "w2"]);

        let solo_w1: HashSet<WorkerId> = ["w2".to_string(), "w3".to_string()].into();
        assert!(!r.has_candidate(&solo_w1, &rep, 0.2, &budget));
        assert!(r.has_candidate(&solo_w1, &rep, 0.2, &Budget::unlimited()));
    }

    #[test]
    fn muertos_viejos_se_olvidan_y_el_round_robin_sigue() {
        let now = Utc::now();
        let r = registry(now);
        let later = now + chrono::Duration::seconds(30);
        for id in ["w2", "w3"] {
            r.heartbeat(
                &WorkerHeartbeatRequest { worker_id: id.into(), cpu_percent: None, mem_bytes: None },
                later,
            );
        }
        assert_eq!(r.mark_dead_workers(later, Duration::from_secs(20)), vec!["w1".to_string()]);

        // muerto pero todavía dentro de la retención
        assert!(r.forget_dead(later, Duration::from_secs(60)).is_empty());
        assert!(r.is_known("w1"));

        let much_later = now + chrono::Duration::seconds(120);
        assert_eq!(r.forget_dead(much_later, Duration::from_secs(60)), vec!["w1".to_string()]);
        assert!(!r.is_known("w1"));
        assert_eq!(r.counts(), (2, 0));
        assert!(!r.heartbeat(
            &WorkerHeartbeatRequest { worker_id: "w1".into(), cpu_percent: None, mem_bytes: None },
            much_later,
        ));

        let rep = InMemoryReputation::new();
        let picks: Vec<_> = (0..3)
            .filter_map(|_| r.pick(&HashSet::new(), &HashMap::new(), &rep, 0.2, &Budget::unlimited()))
            .collect();
        assert_eq!(picks.len(), 3);
        assert!(picks.iter().all(|p| p == "w2" || p == "w3"));
    }
}
