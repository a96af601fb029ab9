use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{Matrix, ReduceOp, Record};
use crate::task::TaskId;

pub type JobId = String;

/// Backend de ejecución pedido para un job. El worker lo trata como primer eslabón de su cadena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    Builtin,
    Process,
    Container,
    Wasm,
}

impl SandboxKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "builtin" => Some(Self::Builtin),
            "process" => Some(Self::Process),
            "container" => Some(Self::Container),
            "wasm" => Some(Self::Wasm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Process => "process",
            Self::Container => "container",
            Self::Wasm => "wasm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRef {
    #[serde(default)]
    pub sandbox: SandboxKind,
    pub handler: String,
    #[serde(default)]
    pub params: Value,
}

/// Porción de la tarea que ve un worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    /// Sub-rango `[start, end)`.
    Range {
        start: i64,
        end: i64,
        operation: ReduceOp,
    },
    /// Trozo contiguo de una colección; `offset` es la posición del primer elemento en la entrada.
    Chunk { offset: usize, items: Vec<Record> },
    /// Bloque de filas de `matrix_a` más el operando que necesite la operación.
    MatrixBlock {
        row_offset: usize,
        rows: Matrix,
        #[serde(default)]
        operand: Option<Matrix>,
    },
    /// Entrada completa, sin particionar.
    Whole { input: Value },
}

impl JobInput {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Range { .. } => "range",
            Self::Chunk { .. } => "chunk",
            Self::MatrixBlock { .. } => "matrix_block",
            Self::Whole { .. } => "whole",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_id: TaskId,
    /// Nodo del pipeline, si el job pertenece a uno.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Posición en el orden determinista del split.
    pub index: usize,
    pub input: JobInput,
    pub code_ref: CodeRef,
    /// Job original cuando éste es una réplica de verificación.
    #[serde(default)]
    pub replica_of: Option<JobId>,
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

impl Job {
    /// Réplica con la misma entrada y código: `{job}#r{n}`.
    pub fn replica(&self, n: u32) -> Job {
        let primary = self.primary_id().to_string();
        Job {
            id: format!("{primary}#r{n}"),
            replica_of: Some(primary),
            ..self.clone()
        }
    }

    pub fn primary_id(&self) -> &str {
        self.replica_of.as_deref().unwrap_or(&self.id)
    }

    pub fn is_replica(&self) -> bool {
        self.replica_of.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Assigned,
    Acked,
    Running,
    Completed,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Asignado a un worker y esperando respuesta.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Acked | Self::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replica_conserva_entrada_y_apunta_al_original() {
        let job = Job {
            id: "t1:0".into(),
            task_id: "t1".into(),
            node_id: None,
            index: 0,
            input: JobInput::Chunk { offset: 0, items: vec![json!(1)] },
            code_ref: CodeRef {
                sandbox: SandboxKind::Builtin,
                handler: "map".into(),
                params: json!({"function": "square"}),
            },
            replica_of: None,
            max_attempts: 3,
            timeout_secs: 30,
        };

        let r1 = job.replica(1);
        let r2 = r1.replica(2);

        assert_eq!(r1.id, "t1:0#r1");
        assert_eq!(r2.id, "t1:0#r2");
        assert_eq!(r2.primary_id(), "t1:0");
        assert_eq!(r2.input, job.input);
    }

    #[test]
    fn job_input_se_serializa_con_kind() {
        let v = serde_json::to_value(JobInput::Range {
            start: 0,
            end: 10,
            operation: ReduceOp::Sum,
        })
        .unwrap();
        assert_eq!(v, json!({"kind": "range", "start": 0, "end": 10, "operation": "sum"}));
    }
}
