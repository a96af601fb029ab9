pub mod config;
pub mod coordinator;
pub mod failover;
pub mod handlers;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod verification;
pub mod workers;

pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorError};
