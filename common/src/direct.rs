use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::aggregate::aggregate;
use crate::dag::node_task;
use crate::engine::execute_builtin;
use crate::error::{EngineError, ExecutionError, SplitError};
use crate::job::SandboxKind;
use crate::privacy::ReversalToken;
use crate::split::{split, whole_job, SplitPlan};
use crate::task::{Task, TaskDeclaration};

/// Ejecuta la tarea en este proceso, sin split ni privacidad.
///
/// Es la referencia contra la que se compara la ejecución distribuida: el resultado
/// debe ser el mismo que el de agregar los jobs.
pub fn execute_direct(task: &Task) -> Result<Value, ExecutionError> {
    match split(task)? {
        SplitPlan::Jobs(_) => {
            let job = whole_job(task)?;
            if job.code_ref.sandbox != SandboxKind::Builtin {
                return Err(EngineError::UnsupportedSandbox(job.code_ref.sandbox.as_str().to_string()).into());
            }
            let output = execute_builtin(&job.code_ref, &job.input)?;
            let outputs = HashMap::from([(job.id.clone(), output)]);
            Ok(aggregate(task, std::slice::from_ref(&job), &outputs, &ReversalToken::identity())?)
        }
        SplitPlan::Pipeline(plan) => {
            let now = Utc::now();
            let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
            for layer in &plan.layers {
                for id in layer {
                    let node = plan
                        .graph
                        .node(id)
                        .ok_or_else(|| SplitError::InvalidPartition(format!("nodo {id} fuera del grafo")))?;
                    let sub = node_task(task, node, &outputs, now)?;
                    let value = execute_direct(&sub)?;
                    debug!(task_id = %task.id, node = %id, "nodo ejecutado en directo");
                    outputs.insert(id.clone(), value);
                }
            }
            let by_node: HashMap<String, Value> = outputs.into_iter().collect();
            Ok(aggregate(task, &[], &by_node, &ReversalToken::identity())?)
        }
    }
}

/// Valida la declaración y la ejecuta en directo.
pub fn execute_declaration(decl: TaskDeclaration) -> Result<Value, ExecutionError> {
    let task = decl.validate(uuid::Uuid::new_v4().to_string(), Utc::now())?;
    execute_direct(&task)
}
