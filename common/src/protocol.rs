use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::job::{CodeRef, JobId, JobInput, SandboxKind};
use crate::results::JobResult;
use crate::task::{ResourceRequirements, TaskId};
use crate::worker::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    JobAssign,
    JobAck,
    JobResult,
    JobFail,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobAssign => "JOB_ASSIGN",
            Self::JobAck => "JOB_ACK",
            Self::JobResult => "JOB_RESULT",
            Self::JobFail => "JOB_FAIL",
        }
    }
}

/// Sobre que transporta cualquier mensaje entre nodos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub msg_type: MessageType,
    pub msg_id: String,
    pub src_node: String,
    pub dst_node: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAssign {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub attempt: u32,
    pub code_ref: CodeRef,
    pub sandbox_type: SandboxKind,
    pub input_payload: JobInput,
    pub requirements: ResourceRequirements,
    pub deadline_ts: DateTime<Utc>,
    /// Modo de privacidad efectivo (informativo para el worker).
    pub privacy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Busy,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAck {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub status: AckStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    NoResources,
    InvalidCode,
    SandboxUnavailable,
    Timeout,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl FailReason {
    /// Fallos que no se deben reintentar en el mismo worker.
    pub fn excludes_worker(&self) -> bool {
        matches!(self, Self::NoResources | Self::InvalidCode)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoResources => "no_resources",
            Self::InvalidCode => "invalid_code",
            Self::SandboxUnavailable => "sandbox_unavailable",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFail {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub reason: FailReason,
    pub attempt: u32,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Mensaje ya decodificado y con sus invariantes verificadas.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Assign(JobAssign),
    Ack(JobAck),
    Result(JobResult),
    Fail(JobFail),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Assign(_) => MessageType::JobAssign,
            Self::Ack(_) => MessageType::JobAck,
            Self::Result(_) => MessageType::JobResult,
            Self::Fail(_) => MessageType::JobFail,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Assign(m) => &m.job_id,
            Self::Ack(m) => &m.job_id,
            Self::Result(m) => &m.job_id,
            Self::Fail(m) => &m.job_id,
        }
    }

    /// Empaqueta el mensaje en un sobre nuevo (msg_id v4, timestamp actual).
    pub fn into_envelope(self, src_node: &str, dst_node: &str) -> Result<MessageEnvelope, ProtocolError> {
        self.into_envelope_at(src_node, dst_node, Utc::now())
    }

    pub fn into_envelope_at(
        self,
        src_node: &str,
        dst_node: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<MessageEnvelope, ProtocolError> {
        let msg_type = self.msg_type();
        let payload = match self {
            Self::Assign(m) => serde_json::to_value(m)?,
            Self::Ack(m) => serde_json::to_value(m)?,
            Self::Result(m) => serde_json::to_value(m)?,
            Self::Fail(m) => serde_json::to_value(m)?,
        };
        Ok(MessageEnvelope {
            msg_type,
            msg_id: uuid::Uuid::new_v4().to_string(),
            src_node: src_node.to_string(),
            dst_node: dst_node.to_string(),
            timestamp,
            payload,
        })
    }
}

fn invariant(msg_type: MessageType, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Invariant {
        msg_type: msg_type.as_str().to_string(),
        reason: reason.into(),
    }
}

fn payload<T: DeserializeOwned>(env: &MessageEnvelope) -> Result<T, ProtocolError> {
    Ok(serde_json::from_value(env.payload.clone())?)
}

impl MessageEnvelope {
    /// Decodifica el payload según `msg_type` y verifica las invariantes del contrato.
    pub fn decode(&self) -> Result<Message, ProtocolError> {
        let t = self.msg_type;
        match t {
            MessageType::JobAssign => {
                let m: JobAssign = payload(self)?;
                if m.attempt < 1 {
                    return Err(invariant(t, "attempt debe ser >= 1"));
                }
                if m.deadline_ts <= self.timestamp {
                    return Err(invariant(t, "deadline_ts debe ser posterior al envío"));
                }
                Ok(Message::Assign(m))
            }
            MessageType::JobAck => Ok(Message::Ack(payload(self)?)),
            MessageType::JobResult => {
                let m: JobResult = payload(self)?;
                if m.attempt < 1 {
                    return Err(invariant(t, "attempt debe ser >= 1"));
                }
                let consistent = if m.success {
                    m.output.is_some() && m.error.is_none()
                } else {
                    m.error.is_some() && m.output.is_none()
                };
                if !consistent {
                    return Err(invariant(t, "success exige output y excluye error"));
                }
                Ok(Message::Result(m))
            }
            MessageType::JobFail => {
                let m: JobFail = payload(self)?;
                if m.attempt < 1 {
                    return Err(invariant(t, "attempt debe ser >= 1"));
                }
                Ok(Message::Fail(m))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn assign(deadline_in: i64) -> JobAssign {
        JobAssign {
            task_id: "t1".into(),
            job_id: "t1:0".into(),
            attempt: 1,
            code_ref: CodeRef {
                sandbox: SandboxKind::Builtin,
                handler: "map".into(),
                params: json!({"function": "square"}),
            },
            sandbox_type: SandboxKind::Builtin,
            input_payload: JobInput::Chunk { offset: 0, items: vec![json!(2)] },
            requirements: ResourceRequirements::default(),
            deadline_ts: Utc::now() + Duration::seconds(deadline_in),
            privacy: "none".into(),
        }
    }

    #[test]
    fn sobre_usa_nombres_de_tipo_en_mayusculas() {
        let env = Message::Assign(assign(30)).into_envelope("coord", "w1").unwrap();
        let raw = serde_json::to_value(&env).unwrap();
        assert_eq!(raw["msg_type"], json!("JOB_ASSIGN"));
        assert_eq!(raw["payload"]["job_id"], json!("t1:0"));
        assert_eq!(raw["src_node"], json!("coord"));
    }

    #[test]
    fn assign_con_deadline_vencido_se_rechaza() {
        let env = Message::Assign(assign(-5)).into_envelope("coord", "w1").unwrap();
        assert!(matches!(env.decode(), Err(ProtocolError::Invariant { .. })));
    }

    #[test]
    fn result_exitoso_con_error_se_rechaza() {
        let mut r = JobResult::ok("t1", "t1:0", "w1", 1, json!([4]), 3);
        r.error = Some("boom".into());
        let env = Message::Result(r).into_envelope("w1", "coord").unwrap();
        assert!(env.decode().is_err());
    }

    #[test]
    fn result_fallido_sin_error_se_rechaza() {
        let mut r = JobResult::failed("t1", "t1:0", "w1", 1, "x", 3);
        r.error = None;
        let env = Message::Result(r).into_envelope("w1", "coord").unwrap();
        assert!(env.decode().is_err());
    }

    #[test]
    fn ack_con_status_desconocido_no_decodifica() {
        let env = MessageEnvelope {
            msg_type: MessageType::JobAck,
            msg_id: "m1".into(),
            src_node: "w1".into(),
            dst_node: "coord".into(),
            timestamp: Utc::now(),
            payload: json!({"task_id": "t1", "job_id": "t1:0", "status": "maybe"}),
        };
        assert!(matches!(env.decode(), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn fail_reason_desconocido_cae_en_unknown() {
        let f: JobFail = serde_json::from_value(json!({
            "task_id": "t1", "job_id": "t1:0", "worker_id": "w1",
            "reason": "disk_on_fire", "attempt": 1
        }))
        .unwrap();
        assert_eq!(f.reason, FailReason::Unknown);
    }

    #[test]
    fn ida_y_vuelta_de_result() {
        let r = JobResult::ok("t1", "t1:0", "w1", 2, json!([1, 4]), 12);
        let env = Message::Result(r.clone()).into_envelope("w1", "coord").unwrap();
        assert_eq!(env.decode().unwrap(), Message::Result(r));
    }
}
