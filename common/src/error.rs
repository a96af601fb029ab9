use thiserror::Error;

use crate::job::JobId;
use crate::task::PrivacyMode;

/// Declaración rechazada en la entrada. Lista todas las violaciones, no sólo la primera.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("tarea inválida: {}", .violations.join("; "))]
pub struct InvalidTaskError {
    pub violations: Vec<String>,
}

impl InvalidTaskError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DagError {
    #[error("nodo duplicado en el pipeline: {0}")]
    DuplicateNode(String),

    #[error("el nodo {node} depende de un nodo desconocido: {dependency}")]
    UnknownDependency { node: String, dependency: String },

    #[error("ciclo en depends_on entre los nodos: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SplitError {
    #[error("{field} debe ser > 0 (recibido {value})")]
    NonPositive { field: &'static str, value: i64 },

    #[error("entrada vacía: {0}")]
    EmptyInput(&'static str),

    #[error("partición inválida: {0}")]
    InvalidPartition(String),

    #[error("la partición produciría {jobs} jobs (máximo {max})")]
    TooManyJobs { jobs: u64, max: u64 },

    #[error("un pipeline anidado no se puede particionar como nodo")]
    NestedPipeline,

    #[error(transparent)]
    Dag(#[from] DagError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PrivacyError {
    #[error("el modo efectivo {effective:?} es más débil que el mínimo tolerado {floor:?}")]
    BelowFloor {
        effective: PrivacyMode,
        floor: PrivacyMode,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("el job {0} no llegó a COMPLETED/verificado")]
    MissingJob(JobId),

    #[error("salida inesperada del job {job_id}: {reason}")]
    BadOutput { job_id: JobId, reason: String },

    #[error("no se pudo revertir la máscara: {0}")]
    Unmask(String),

    #[error("la reducción desbordó: {0}")]
    NonFinite(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("handler desconocido: {0}")]
    UnknownHandler(String),

    #[error("función desconocida: {0}")]
    UnknownFunction(String),

    #[error("entrada inválida: {0}")]
    BadInput(String),

    #[error("el sandbox {0} no se puede ejecutar en proceso")]
    UnsupportedSandbox(String),

    #[error("resultado no finito: {0}")]
    NonFinite(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload JSON inválido: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invariante del mensaje {msg_type} violada: {reason}")]
    Invariant { msg_type: String, reason: String },

    #[error("tipo de mensaje inesperado: {0}")]
    Unexpected(String),
}

/// Errores de la ejecución directa (un solo nodo de confianza).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Invalid(#[from] InvalidTaskError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}
