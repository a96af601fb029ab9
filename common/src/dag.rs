use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DagError, InvalidTaskError};
use crate::task::{PrivacyDeclaration, Task, TaskDeclaration, TaskType};

/// Nodo de un pipeline: una tarea normal más sus dependencias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineNode {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Grafo explícito indexado por id de nodo. El orden de declaración desempata el orden topológico.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    pub nodes: Vec<PipelineNode>,
}

impl PipelineGraph {
    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Kahn: detecta nodos duplicados, dependencias desconocidas y ciclos.
    pub fn topological_order(&self) -> Result<Vec<String>, DagError> {
        let mut position: HashMap<&str, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if position.insert(node.id.as_str(), i).is_some() {
                return Err(DagError::DuplicateNode(node.id.clone()));
            }
        }

        let mut indegree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let &d = position.get(dep.as_str()).ok_or_else(|| DagError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                })?;
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: Vec<usize> = (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while !ready.is_empty() {
            // el menor índice primero para que el orden sea estable
            ready.sort_unstable_by(|a, b| b.cmp(a));
            let Some(i) = ready.pop() else { break };
            order.push(i);
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.push(j);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .filter(|i| indegree[*i] > 0)
                .map(|i| self.nodes[i].id.clone())
                .collect();
            return Err(DagError::Cycle(stuck));
        }

        Ok(order.into_iter().map(|i| self.nodes[i].id.clone()).collect())
    }

    /// Capa de un nodo = 1 + máxima capa de sus dependencias (las raíces están en la capa 0).
    pub fn layers(&self) -> Result<Vec<Vec<String>>, DagError> {
        let order = self.topological_order()?;
        let mut layer_of: HashMap<&str, usize> = HashMap::new();
        let mut layers: Vec<Vec<String>> = Vec::new();

        for id in &order {
            let Some(node) = self.node(id) else { continue };
            let layer = node
                .depends_on
                .iter()
                .filter_map(|d| layer_of.get(d.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            layer_of.insert(node.id.as_str(), layer);
            if layers.len() <= layer {
                layers.resize_with(layer + 1, Vec::new);
            }
            layers[layer].push(node.id.clone());
        }

        // dentro de cada capa, orden de declaración
        for layer in layers.iter_mut() {
            layer.sort_by_key(|id| self.nodes.iter().position(|n| &n.id == id));
        }
        Ok(layers)
    }

    /// Nodos sin dependientes, en orden de declaración.
    pub fn sinks(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !self.nodes.iter().any(|m| m.depends_on.contains(&n.id)))
            .map(|n| n.id.clone())
            .collect()
    }
}

/// Inyecta las salidas de las dependencias en el payload del nodo.
pub fn bind_inputs(node: &PipelineNode, outputs: &BTreeMap<String, Value>) -> Value {
    if node.depends_on.is_empty() {
        return node.payload.clone();
    }
    let mut payload = match &node.payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    let upstream: Vec<&Value> = node
        .depends_on
        .iter()
        .map(|d| outputs.get(d).unwrap_or(&Value::Null))
        .collect();

    let concat = |own: Option<&Value>| {
        let mut items: Vec<Value> = own.and_then(|v| v.as_array()).cloned().unwrap_or_default();
        for out in &upstream {
            match out {
                Value::Array(xs) => items.extend(xs.iter().cloned()),
                Value::Null => {}
                other => items.push((*other).clone()),
            }
        }
        Value::Array(items)
    };

    match TaskType::parse(&node.task_type) {
        Some(TaskType::Map | TaskType::MapReduce) => {
            let data = concat(payload.get("data"));
            payload.insert("data".into(), data);
        }
        Some(TaskType::MlInference) => {
            let data = concat(payload.get("input_data"));
            payload.insert("input_data".into(), data);
        }
        Some(TaskType::MlTrainStep) => {
            let data = concat(payload.get("training_data"));
            payload.insert("training_data".into(), data);
        }
        Some(TaskType::MatrixOps) => {
            if let Some(first) = upstream.first() {
                payload.insert("matrix_a".into(), (*first).clone());
            }
        }
        Some(TaskType::Generic) => {
            let input = if upstream.len() == 1 {
                upstream[0].clone()
            } else {
                Value::Object(
                    node.depends_on
                        .iter()
                        .zip(&upstream)
                        .map(|(d, v)| (d.clone(), (*v).clone()))
                        .collect(),
                )
            };
            payload.insert("input".into(), input);
        }
        Some(TaskType::RangeReduce) | Some(TaskType::Pipeline) | None => {}
    }

    Value::Object(payload)
}

/// Construye la sub-tarea de un nodo: hereda dueño, requisitos, configuración y privacidad del padre.
pub fn node_task(
    parent: &Task,
    node: &PipelineNode,
    outputs: &BTreeMap<String, Value>,
    now: DateTime<Utc>,
) -> Result<Task, InvalidTaskError> {
    let decl = TaskDeclaration {
        owner_id: parent.owner_id.clone(),
        task_type: node.task_type.clone(),
        payload: bind_inputs(node, outputs),
        requirements: parent.requirements.clone(),
        config: parent.config.clone(),
        privacy: PrivacyDeclaration::default(),
    };
    let mut task = decl.validate_node(parent.id.clone(), &node.id, now)?;
    task.privacy = parent.privacy;
    Ok(task)
}
