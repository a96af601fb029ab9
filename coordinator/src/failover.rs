use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::coordinator::Coordinator;

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat) y expira sus jobs
/// - vence deadlines de jobs y de tareas
/// - olvida tareas terminadas y workers muertos tras la retención
/// - despacha lo que haya quedado pendiente
pub async fn run_failover_loop(coordinator: Arc<Coordinator>, interval: Duration) {
    loop {
        sleep(interval).await;

        let report = coordinator.sweep(Utc::now());
        if !report.dead_workers.is_empty() {
            warn!("workers caídos en esta pasada: {:?}", report.dead_workers);
        }
        if !report.requeued.is_empty() || !report.failed.is_empty() {
            info!(
                "failover: {} jobs reencolados, {} fallidos",
                report.requeued.len(),
                report.failed.len()
            );
        }
        for task_id in &report.expired_tasks {
            warn!("tarea {} superó su deadline", task_id);
        }
        if !report.evicted_tasks.is_empty() || !report.forgotten_workers.is_empty() {
            info!(
                "retención: {} tareas y {} workers olvidados",
                report.evicted_tasks.len(),
                report.forgotten_workers.len()
            );
        }
    }
}
