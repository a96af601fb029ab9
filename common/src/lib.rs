//! Tipos y lógica pura compartidos por coordinador, workers y cliente:
//! validación, privacidad, split, agregación, DAG de pipelines y protocolo de mensajes.

pub mod aggregate;
pub mod dag;
pub mod direct;
pub mod engine;
pub mod error;
pub mod job;
pub mod pricing;
pub mod privacy;
pub mod protocol;
pub mod results;
pub mod split;
pub mod task;
pub mod worker;

pub use job::{CodeRef, Job, JobId, JobInput, JobStatus, SandboxKind};
pub use protocol::{Message, MessageEnvelope, MessageType};
pub use results::{JobResult, SchedulerEvent, StatusCounters, TaskReport};
pub use task::{PrivacyMode, Task, TaskDeclaration, TaskId, TaskStatus, TaskType, VerificationLevel};
pub use worker::WorkerId;
