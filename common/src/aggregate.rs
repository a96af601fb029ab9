use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::engine::{
    combine_partials, matrix_from_json, matrix_to_json, num, Matrix, MatrixOp, Partial, ReduceOp,
};
use crate::error::AggregationError;
use crate::job::{Job, JobId, JobInput};
use crate::privacy::ReversalToken;
use crate::task::{Task, TaskPayload};

fn bad(job: &Job, reason: impl Into<String>) -> AggregationError {
    AggregationError::BadOutput {
        job_id: job.id.clone(),
        reason: reason.into(),
    }
}

/// Pares (job primario, salida aceptada) en el orden del split.
fn contributions<'a>(
    jobs: &'a [Job],
    outputs: &'a HashMap<JobId, Value>,
) -> Result<Vec<(&'a Job, &'a Value)>, AggregationError> {
    let mut primaries: Vec<&Job> = jobs.iter().filter(|j| !j.is_replica()).collect();
    primaries.sort_by_key(|j| j.index);
    primaries
        .into_iter()
        .map(|job| {
            outputs
                .get(&job.id)
                .map(|out| (job, out))
                .ok_or_else(|| AggregationError::MissingJob(job.id.clone()))
        })
        .collect()
}

fn reduce(op: ReduceOp, parts: &[(&Job, &Value)]) -> Result<Value, AggregationError> {
    let partials = parts
        .iter()
        .map(|(job, out)| Partial::from_json(out).ok_or_else(|| bad(job, "parcial sin value/count")))
        .collect::<Result<Vec<_>, _>>()?;
    combine_partials(op, &partials)
}

/// map / ml_inference: cada salida vuelve a su offset.
fn reinsert(parts: &[(&Job, &Value)]) -> Result<Value, AggregationError> {
    let mut slots: Vec<Option<Value>> = Vec::new();
    for (job, out) in parts {
        let (offset, expected) = match &job.input {
            JobInput::Chunk { offset, items } => (*offset, items.len()),
            other => return Err(bad(job, format!("entrada {} no reinsertable", other.kind()))),
        };
        let items = out
            .as_array()
            .filter(|xs| xs.len() == expected)
            .ok_or_else(|| bad(job, format!("se esperaban {expected} elementos")))?;
        if slots.len() < offset + expected {
            slots.resize(offset + expected, None);
        }
        for (i, item) in items.iter().enumerate() {
            if slots[offset + i].replace(item.clone()).is_some() {
                return Err(bad(job, format!("posición {} cubierta dos veces", offset + i)));
            }
        }
    }
    let total = slots.len();
    let values: Vec<Value> = slots.into_iter().flatten().collect();
    if values.len() != total {
        return Err(AggregationError::BadOutput {
            job_id: String::new(),
            reason: "huecos en la salida reinsertada".into(),
        });
    }
    Ok(Value::Array(values))
}

fn matrix(transpose: bool, parts: &[(&Job, &Value)]) -> Result<Value, AggregationError> {
    let mut result: Matrix = Vec::new();
    for (job, out) in parts {
        let block = matrix_from_json(out).map_err(|e| bad(job, e.to_string()))?;
        if transpose {
            // cada bloque trae columnas × filas del bloque: se concatenan por columna
            if result.is_empty() {
                result = vec![Vec::new(); block.len()];
            }
            if block.len() != result.len() {
                return Err(bad(job, "bloque traspuesto con otra cantidad de columnas"));
            }
            for (dst, src) in result.iter_mut().zip(block) {
                dst.extend(src);
            }
        } else {
            let row_offset = match &job.input {
                JobInput::MatrixBlock { row_offset, .. } => *row_offset,
                other => return Err(bad(job, format!("entrada {} no matricial", other.kind()))),
            };
            if row_offset != result.len() {
                return Err(bad(job, "bloques fuera de orden"));
            }
            result.extend(block);
        }
    }
    Ok(matrix_to_json(&result))
}

fn train_step(task_weights: &[f64], bias: f64, lr: f64, parts: &[(&Job, &Value)]) -> Result<Value, AggregationError> {
    let mut grad = vec![0.0; task_weights.len()];
    let mut bias_grad = 0.0;
    let mut loss = 0.0;
    let mut count = 0u64;
    for (job, out) in parts {
        let g = out
            .get("gradient_sum")
            .and_then(|g| g.as_array())
            .filter(|g| g.len() == grad.len())
            .ok_or_else(|| bad(job, "gradient_sum inválido"))?;
        for (acc, x) in grad.iter_mut().zip(g) {
            *acc += x.as_f64().ok_or_else(|| bad(job, "gradiente no numérico"))?;
        }
        bias_grad += out.get("bias_gradient_sum").and_then(|x| x.as_f64()).unwrap_or(0.0);
        loss += out.get("loss_sum").and_then(|x| x.as_f64()).unwrap_or(0.0);
        count += out
            .get("count")
            .and_then(|x| x.as_u64())
            .ok_or_else(|| bad(job, "falta count"))?;
    }
    if count == 0 {
        return Err(AggregationError::BadOutput {
            job_id: String::new(),
            reason: "train step sin muestras".into(),
        });
    }
    let n = count as f64;
    let weights: Vec<Value> = task_weights
        .iter()
        .zip(&grad)
        .map(|(w, g)| num(w - lr * g / n))
        .collect();
    Ok(json!({
        "weights": weights,
        "bias": num(bias - lr * bias_grad / n),
        "loss": num(loss / n),
        "samples": count,
    }))
}

/// Combina las salidas aceptadas en el resultado final de la tarea y revierte la máscara.
///
/// Para pipelines `outputs` va indexado por id de nodo (salidas ya agregadas de cada nodo)
/// y `jobs` se ignora.
pub fn aggregate(
    task: &Task,
    jobs: &[Job],
    outputs: &HashMap<JobId, Value>,
    token: &ReversalToken,
) -> Result<Value, AggregationError> {
    let combined = match &task.payload {
        TaskPayload::RangeReduce(r) => reduce(r.operation, &contributions(jobs, outputs)?)?,
        TaskPayload::MapReduce(m) => reduce(m.reduce_function, &contributions(jobs, outputs)?)?,
        TaskPayload::Map(_) | TaskPayload::MlInference(_) => reinsert(&contributions(jobs, outputs)?)?,
        TaskPayload::MatrixOps(m) => {
            let transpose = matches!(m.operation, MatrixOp::Transpose);
            matrix(transpose, &contributions(jobs, outputs)?)?
        }
        TaskPayload::MlTrainStep(m) => train_step(
            &m.model.weights,
            m.model.bias,
            m.learning_rate,
            &contributions(jobs, outputs)?,
        )?,
        TaskPayload::Generic(_) => {
            let parts = contributions(jobs, outputs)?;
            match parts.as_slice() {
                [(_, out)] => (*out).clone(),
                _ => {
                    return Err(AggregationError::BadOutput {
                        job_id: task.job_prefix(),
                        reason: format!("generic espera un job, recibió {}", parts.len()),
                    })
                }
            }
        }
        TaskPayload::Pipeline(graph) => {
            let sinks = graph.sinks();
            let mut resolved = Map::new();
            for sink in &sinks {
                let out = outputs
                    .get(sink)
                    .ok_or_else(|| AggregationError::MissingJob(format!("{}:{sink}", task.id)))?;
                resolved.insert(sink.clone(), out.clone());
            }
            if sinks.len() == 1 {
                resolved.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
            } else {
                Value::Object(resolved)
            }
        }
    };
    token.invert(combined)
}
