use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coordinator::failover::run_failover_loop;
use coordinator::handlers::{build_router, AppState};
use coordinator::transport::MailboxTransport;
use coordinator::verification::InMemoryReputation;
use coordinator::{Coordinator, CoordinatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=debug,tower_http=info")),
        )
        .init();

    let config = CoordinatorConfig::from_env();
    let addr = config.addr.clone();
    let sweep_interval = config.sweep_interval;

    let mailbox = Arc::new(MailboxTransport::new());
    let coordinator = Arc::new(Coordinator::new(
        config,
        mailbox.clone(),
        Arc::new(InMemoryReputation::new()),
    ));

    // barrido de failover en segundo plano
    tokio::spawn(run_failover_loop(coordinator.clone(), sweep_interval));

    let app = build_router(AppState {
        coordinator: coordinator.clone(),
        mailbox,
    });

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!(
        "coordinador {} escuchando en {}",
        coordinator.node_id(),
        listener.local_addr()?
    );

    axum::serve(listener, app).await?;
    Ok(())
}
