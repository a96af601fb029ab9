use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use common::MessageEnvelope;

use crate::state::lock;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("nodo desconocido: {0}")]
    UnknownNode(String),
}

/// Entrega de sobres hacia otros nodos. Al menos una vez, sin orden entre jobs distintos.
pub trait Transport: Send + Sync {
    fn send(&self, envelope: MessageEnvelope) -> Result<(), TransportError>;
}

/// Buzón por nodo: el coordinador encola y cada worker vacía el suyo por HTTP.
#[derive(Default)]
pub struct MailboxTransport {
    boxes: Mutex<HashMap<String, VecDeque<MessageEnvelope>>>,
}

impl MailboxTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crea el buzón si no existe.
    pub fn open(&self, node_id: &str) {
        lock(&self.boxes).entry(node_id.to_string()).or_default();
    }

    /// Saca hasta `max` sobres en orden de llegada.
    pub fn drain(&self, node_id: &str, max: usize) -> Result<Vec<MessageEnvelope>, TransportError> {
        let mut boxes = lock(&self.boxes);
        let queue = boxes
            .get_mut(node_id)
            .ok_or_else(|| TransportError::UnknownNode(node_id.to_string()))?;
        let n = max.min(queue.len());
        Ok(queue.drain(..n).collect())
    }

    pub fn pending(&self, node_id: &str) -> usize {
        lock(&self.boxes).get(node_id).map_or(0, VecDeque::len)
    }
}

impl Transport for MailboxTransport {
    fn send(&self, envelope: MessageEnvelope) -> Result<(), TransportError> {
        let mut boxes = lock(&self.boxes);
        let queue = boxes
            .get_mut(&envelope.dst_node)
            .ok_or_else(|| TransportError::UnknownNode(envelope.dst_node.clone()))?;
        debug!(
            "encolando {} {} para {}",
            envelope.msg_type.as_str(),
            envelope.msg_id,
            envelope.dst_node
        );
        queue.push_back(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::MessageType;
    use serde_json::json;

    fn env(dst: &str, id: &str) -> MessageEnvelope {
        MessageEnvelope {
            msg_type: MessageType::JobAck,
            msg_id: id.into(),
            src_node: "coordinator".into(),
            dst_node: dst.into(),
            timestamp: Utc::now(),
            payload: json!({}),
        }
    }

    #[test]
    fn buzon_entrega_en_orden_y_respeta_max() {
        let t = MailboxTransport::new();
        t.open("w1");
        for i in 0..3 {
            t.send(env("w1", &format!("m{i}"))).unwrap();
        }
        let first = t.drain("w1", 2).unwrap();
        assert_eq!(first.iter().map(|e| e.msg_id.as_str()).collect::<Vec<_>>(), vec!["m0", "m1"]);
        assert_eq!(t.pending("w1"), 1);
        assert_eq!(t.drain("w1", 10).unwrap().len(), 1);
        assert!(t.drain("w1", 10).unwrap().is_empty());
    }

    #[test]
    fn nodo_sin_buzon_es_error() {
        let t = MailboxTransport::new();
        assert_eq!(t.send(env("w9", "m0")), Err(TransportError::UnknownNode("w9".into())));
        assert!(t.drain("w9", 1).is_err());
    }
}
