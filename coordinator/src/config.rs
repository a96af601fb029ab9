use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_WORKER_DEAD_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
pub const DEFAULT_FLOAT_TOLERANCE: f64 = 1e-9;
pub const DEFAULT_STRICT_REPLICA_BUDGET: u32 = 3;
pub const DEFAULT_VERIFICATION_ROUNDS: u32 = 2;
pub const DEFAULT_MIN_WORKER_REPUTATION: f64 = 0.2;
pub const DEFAULT_TASK_RETENTION_SECS: u64 = 3600;
pub const DEFAULT_WORKER_RETENTION_SECS: u64 = 3600;

/// Configuración del coordinador, leída una vez al arrancar.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub addr: String,
    /// Id de nodo usado como `src_node` en los sobres salientes.
    pub node_id: String,
    pub sweep_interval: Duration,
    pub worker_dead_timeout: Duration,
    /// Se multiplica por el número de intento antes de reencolar.
    pub retry_backoff: Duration,
    pub float_tolerance: f64,
    /// Réplicas extra que `strict` puede pedir por ronda.
    pub strict_replica_budget: u32,
    /// Rondas de verificación por job antes de fallar la tarea.
    pub verification_rounds: u32,
    pub min_worker_reputation: f64,
    /// Cuánto se conserva una tarea terminada (con sus jobs y eventos) antes de olvidarla.
    pub task_retention: Duration,
    /// Cuánto se conserva un worker muerto antes de sacarlo del registro.
    pub worker_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            node_id: "coordinator".to_string(),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            worker_dead_timeout: Duration::from_secs(DEFAULT_WORKER_DEAD_TIMEOUT_SECS),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            float_tolerance: DEFAULT_FLOAT_TOLERANCE,
            strict_replica_budget: DEFAULT_STRICT_REPLICA_BUDGET,
            verification_rounds: DEFAULT_VERIFICATION_ROUNDS,
            min_worker_reputation: DEFAULT_MIN_WORKER_REPUTATION,
            task_retention: Duration::from_secs(DEFAULT_TASK_RETENTION_SECS),
            worker_retention: Duration::from_secs(DEFAULT_WORKER_RETENTION_SECS),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            addr: env::var("COORDINATOR_ADDR").unwrap_or(d.addr),
            node_id: env::var("COORDINATOR_NODE_ID").unwrap_or(d.node_id),
            sweep_interval: Duration::from_millis(env_or("SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS)),
            worker_dead_timeout: Duration::from_secs(env_or(
                "WORKER_DEAD_TIMEOUT_SECS",
                DEFAULT_WORKER_DEAD_TIMEOUT_SECS,
            )),
            retry_backoff: Duration::from_millis(env_or("RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)),
            float_tolerance: env_or("FLOAT_TOLERANCE", DEFAULT_FLOAT_TOLERANCE),
            strict_replica_budget: env_or("STRICT_REPLICA_BUDGET", DEFAULT_STRICT_REPLICA_BUDGET).max(1),
            verification_rounds: env_or("VERIFICATION_ROUNDS", DEFAULT_VERIFICATION_ROUNDS).max(1),
            min_worker_reputation: env_or("MIN_WORKER_REPUTATION", DEFAULT_MIN_WORKER_REPUTATION),
            task_retention: Duration::from_secs(env_or("TASK_RETENTION_SECS", DEFAULT_TASK_RETENTION_SECS)),
            worker_retention: Duration::from_secs(env_or("WORKER_RETENTION_SECS", DEFAULT_WORKER_RETENTION_SECS)),
        }
    }
}
