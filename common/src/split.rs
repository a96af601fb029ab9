use serde_json::{json, Value};

use crate::dag::PipelineGraph;
use crate::engine::{MatrixOp, Record};
use crate::error::SplitError;
use crate::job::{CodeRef, Job, JobInput, SandboxKind};
use crate::task::{LinearModel, Task, TaskPayload};

/// Resultado del split: lista plana de jobs, o un plan por capas para pipelines.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitPlan {
    Jobs(Vec<Job>),
    Pipeline(PipelinePlan),
}

/// Las capas se registran de a una: la capa k sólo cuando la k-1 terminó.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePlan {
    pub graph: PipelineGraph,
    pub layers: Vec<Vec<String>>,
    pub sinks: Vec<String>,
}

/// Tope de jobs por tarea (o por nodo de pipeline). Se comprueba antes de crear ninguno.
pub const MAX_JOBS_PER_TASK: u64 = 10_000;

fn check_job_count(items: u64, chunk: usize) -> Result<(), SplitError> {
    let jobs = items.div_ceil(chunk as u64);
    if jobs > MAX_JOBS_PER_TASK {
        return Err(SplitError::TooManyJobs {
            jobs,
            max: MAX_JOBS_PER_TASK,
        });
    }
    Ok(())
}

fn positive(field: &'static str, value: i64) -> Result<usize, SplitError> {
    if value <= 0 {
        return Err(SplitError::NonPositive { field, value });
    }
    usize::try_from(value).map_err(|_| SplitError::InvalidPartition(format!("{field} fuera de rango")))
}

fn builtin(handler: &str, params: Value) -> CodeRef {
    CodeRef {
        sandbox: SandboxKind::Builtin,
        handler: handler.to_string(),
        params,
    }
}

fn model_params(model: &LinearModel) -> Value {
    json!({
        "model_path": model.model_path,
        "model_type": model.model_type,
        "weights": model.weights,
        "bias": model.bias,
    })
}

fn make_job(task: &Task, index: usize, input: JobInput, code_ref: &CodeRef) -> Job {
    Job {
        id: format!("{}:{}", task.job_prefix(), index),
        task_id: task.id.clone(),
        node_id: task.node_id.clone(),
        index,
        input,
        code_ref: code_ref.clone(),
        replica_of: None,
        max_attempts: task.max_attempts(),
        timeout_secs: task.requirements.timeout_seconds,
    }
}

/// Trozos contiguos de a lo sumo `chunk`, con el offset de cada uno.
fn chunk_jobs(
    task: &Task,
    data: &[Record],
    chunk: i64,
    what: &'static str,
    code_ref: &CodeRef,
) -> Result<Vec<Job>, SplitError> {
    let chunk = positive("chunk_size", chunk)?;
    if data.is_empty() {
        return Err(SplitError::EmptyInput(what));
    }
    check_job_count(data.len() as u64, chunk)?;
    Ok(data
        .chunks(chunk)
        .enumerate()
        .map(|(i, items)| {
            let input = JobInput::Chunk {
                offset: i * chunk,
                items: items.to_vec(),
            };
            make_job(task, i, input, code_ref)
        })
        .collect())
}

/// Descompone la tarea (ya transformada) en jobs, en un orden fijo.
pub fn split(task: &Task) -> Result<SplitPlan, SplitError> {
    let jobs = match &task.payload {
        TaskPayload::RangeReduce(r) => {
            let chunk = positive("chunk_size", r.chunk_size)?;
            if r.start >= r.end {
                return Err(SplitError::EmptyInput("rango"));
            }
            let span = r
                .end
                .checked_sub(r.start)
                .ok_or_else(|| SplitError::InvalidPartition("rango fuera de i64".into()))?;
            check_job_count(span as u64, chunk)?;
            let chunk = chunk as i64;
            let code = builtin("range_reduce", Value::Null);
            let mut jobs = Vec::new();
            let mut lo = r.start;
            while lo < r.end {
                let hi = lo.saturating_add(chunk).min(r.end);
                let input = JobInput::Range {
                    start: lo,
                    end: hi,
                    operation: r.operation,
                };
                jobs.push(make_job(task, jobs.len(), input, &code));
                lo = hi;
            }
            jobs
        }
        TaskPayload::Map(m) => {
            let mut params = json!({ "function": m.function.name() });
            if let Some(by) = m.function.increment() {
                params["increment"] = json!(by);
            }
            chunk_jobs(task, &m.data, m.chunk_size, "data", &builtin("map", params))?
        }
        TaskPayload::MapReduce(m) => {
            let mut params = json!({
                "map_function": m.map_function.name(),
                "reduce_function": m.reduce_function.name(),
            });
            if let Some(by) = m.map_function.increment() {
                params["increment"] = json!(by);
            }
            chunk_jobs(task, &m.data, m.chunk_size, "data", &builtin("map_reduce", params))?
        }
        TaskPayload::MatrixOps(m) => {
            let block = positive("block_rows", m.block_rows)?;
            if m.matrix_a.is_empty() {
                return Err(SplitError::EmptyInput("matrix_a"));
            }
            check_job_count(m.matrix_a.len() as u64, block)?;
            let code = builtin("matrix", json!({ "operation": m.operation.name() }));
            let mut jobs = Vec::new();
            for (i, rows) in m.matrix_a.chunks(block).enumerate() {
                let row_offset = i * block;
                let operand = match (m.operation, &m.matrix_b) {
                    (MatrixOp::Add, Some(b)) => {
                        let slice = b.get(row_offset..row_offset + rows.len()).ok_or_else(|| {
                            SplitError::InvalidPartition("matrix_b con menos filas que matrix_a".into())
                        })?;
                        Some(slice.to_vec())
                    }
                    (MatrixOp::Multiply, Some(b)) => Some(b.clone()),
                    (MatrixOp::Transpose, _) => None,
                    (op, None) => {
                        return Err(SplitError::InvalidPartition(format!(
                            "{} sin matrix_b",
                            op.name()
                        )))
                    }
                };
                let input = JobInput::MatrixBlock {
                    row_offset,
                    rows: rows.to_vec(),
                    operand,
                };
                jobs.push(make_job(task, i, input, &code));
            }
            jobs
        }
        TaskPayload::MlInference(m) => {
            let code = builtin("ml_inference", model_params(&m.model));
            chunk_jobs(task, &m.input_data, m.batch_size, "input_data", &code)?
        }
        TaskPayload::MlTrainStep(m) => {
            let mut params = model_params(&m.model);
            params["learning_rate"] = json!(m.learning_rate);
            let code = builtin("ml_train_step", params);
            chunk_jobs(task, &m.training_data, m.batch_size, "training_data", &code)?
        }
        TaskPayload::Generic(g) => {
            let input = JobInput::Whole {
                input: g.input.clone(),
            };
            vec![make_job(task, 0, input, &g.code_ref)]
        }
        TaskPayload::Pipeline(graph) => {
            if task.node_id.is_some() {
                return Err(SplitError::NestedPipeline);
            }
            let layers = graph.layers()?;
            return Ok(SplitPlan::Pipeline(PipelinePlan {
                graph: graph.clone(),
                layers,
                sinks: graph.sinks(),
            }));
        }
    };
    Ok(SplitPlan::Jobs(jobs))
}

/// Split de una tarea que no es pipeline.
pub fn split_jobs(task: &Task) -> Result<Vec<Job>, SplitError> {
    match split(task)? {
        SplitPlan::Jobs(jobs) => Ok(jobs),
        SplitPlan::Pipeline(_) => Err(SplitError::NestedPipeline),
    }
}

/// Un único job con toda la entrada, para ejecutar la tarea sin descomponer.
pub fn whole_job(task: &Task) -> Result<Job, SplitError> {
    let mut widened = task.clone();
    match &mut widened.payload {
        TaskPayload::RangeReduce(r) => {
            r.chunk_size = r
                .end
                .checked_sub(r.start)
                .ok_or_else(|| SplitError::InvalidPartition("rango fuera de i64".into()))?
                .max(1)
        }
        TaskPayload::Map(m) => m.chunk_size = m.data.len().max(1) as i64,
        TaskPayload::MapReduce(m) => m.chunk_size = m.data.len().max(1) as i64,
        TaskPayload::MatrixOps(m) => m.block_rows = m.matrix_a.len().max(1) as i64,
        TaskPayload::MlInference(m) => m.batch_size = m.input_data.len().max(1) as i64,
        TaskPayload::MlTrainStep(m) => m.batch_size = m.training_data.len().max(1) as i64,
        TaskPayload::Generic(_) => {}
        TaskPayload::Pipeline(_) => return Err(SplitError::NestedPipeline),
    }
    let mut jobs = split_jobs(&widened)?;
    match (jobs.pop(), jobs.is_empty()) {
        (Some(job), true) => Ok(job),
        _ => Err(SplitError::InvalidPartition("se esperaba un único job".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDeclaration;
    use chrono::Utc;

    fn task(task_type: &str, payload: Value) -> Task {
        let decl: TaskDeclaration = serde_json::from_value(json!({
            "owner_id": "alice",
            "task_type": task_type,
            "payload": payload,
        }))
        .unwrap();
        decl.validate("t1".into(), Utc::now()).unwrap()
    }

    #[test]
    fn map_de_n_elementos_genera_ceil_n_sobre_c_jobs() {
        for (n, c, expected) in [(10usize, 3i64, 4usize), (9, 3, 3), (1, 5, 1), (7, 1, 7)] {
            let data: Vec<i64> = (0..n as i64).collect();
            let t = task("map", json!({"data": data, "function": "square", "chunk_size": c}));
            let jobs = split_jobs(&t).unwrap();
            assert_eq!(jobs.len(), expected, "n={n} c={c}");

            // cubren la entrada exactamente una vez
            let mut seen = Vec::new();
            for job in &jobs {
                match &job.input {
                    JobInput::Chunk { offset, items } => {
                        assert_eq!(*offset, seen.len());
                        seen.extend(items.iter().cloned());
                    }
                    other => panic!("entrada inesperada {other:?}"),
                }
            }
            assert_eq!(seen, data.iter().map(|x| json!(x)).collect::<Vec<_>>());
        }
    }

    #[test]
    fn rango_0_a_100_con_chunk_10_da_diez_decenas() {
        let t = task("range_reduce", json!({"start": 0, "end": 100, "operation": "sum", "chunk_size": 10}));
        let jobs = split_jobs(&t).unwrap();
        assert_eq!(jobs.len(), 10);
        assert_eq!(jobs[3].id, "t1:3");
        assert_eq!(
            jobs[3].input,
            JobInput::Range { start: 30, end: 40, operation: crate::engine::ReduceOp::Sum }
        );
    }

    #[test]
    fn demasiados_jobs_se_rechazan_antes_de_crearlos() {
        let t = task(
            "range_reduce",
            json!({"start": 0, "end": 1_000_000_000_000_000i64, "operation": "sum", "chunk_size": 1}),
        );
        let err = split(&t).unwrap_err();
        assert_eq!(
            err,
            SplitError::TooManyJobs { jobs: 1_000_000_000_000_000, max: MAX_JOBS_PER_TASK }
        );

        let data: Vec<i64> = (0..=MAX_JOBS_PER_TASK as i64).collect();
        let t = task("map", json!({"data": data, "function": "double", "chunk_size": 1}));
        assert!(matches!(split(&t), Err(SplitError::TooManyJobs { .. })));

        // justo en el tope sigue siendo válido
        let t = task(
            "range_reduce",
            json!({"start": 0, "end": MAX_JOBS_PER_TASK, "operation": "count", "chunk_size": 1}),
        );
        assert_eq!(split_jobs(&t).unwrap().len() as u64, MAX_JOBS_PER_TASK);
    }

    #[test]
    fn rango_casi_completo_de_i64_se_parte_sin_desbordar() {
        let t = task(
            "range_reduce",
            json!({"start": -4_000_000_000_000_000_000i64, "end": 4_000_000_000_000_000_000i64,
                   "operation": "sum", "chunk_size": 4_000_000_000_000_000_000i64}),
        );
        let jobs = split_jobs(&t).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(whole_job(&t).is_ok());
    }

    #[test]
    fn split_es_determinista() {
        let t = task("map", json!({"data": [5, 4, 3, 2, 1], "function": "double", "chunk_size": 2}));
        assert_eq!(split(&t).unwrap(), split(&t).unwrap());
    }

    #[test]
    fn chunk_size_no_positivo_es_split_error() {
        let t = task("map", json!({"data": [1, 2], "function": "square", "chunk_size": 0}));
        assert_eq!(
            split_jobs(&t).unwrap_err(),
            SplitError::NonPositive { field: "chunk_size", value: 0 }
        );
    }

    #[test]
    fn matriz_add_lleva_las_filas_correspondientes_de_b() {
        let t = task(
            "matrix_ops",
            json!({
                "operation": "add",
                "matrix_a": [[1, 2], [3, 4], [5, 6]],
                "matrix_b": [[10, 20], [30, 40], [50, 60]],
                "block_rows": 2
            }),
        );
        let jobs = split_jobs(&t).unwrap();
        assert_eq!(jobs.len(), 2);
        match &jobs[1].input {
            JobInput::MatrixBlock { row_offset, rows, operand } => {
                assert_eq!(*row_offset, 2);
                assert_eq!(rows, &vec![vec![5.0, 6.0]]);
                assert_eq!(operand, &Some(vec![vec![50.0, 60.0]]));
            }
            other => panic!("entrada inesperada {other:?}"),
        }
    }

    #[test]
    fn generic_es_un_solo_job_con_toda_la_entrada() {
        let t = task("generic", json!({"code_ref": "echo", "input": {"a": 1}}));
        let jobs = split_jobs(&t).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].input, JobInput::Whole { input: json!({"a": 1}) });
    }

    #[test]
    fn pipeline_produce_plan_por_capas() {
        let t = task(
            "pipeline",
            json!({"nodes": [
                {"id": "src", "task_type": "map", "payload": {"data": [1, 2], "function": "square"}},
                {"id": "sum", "depends_on": ["src"], "task_type": "map_reduce",
                 "payload": {"map_function": "identity", "reduce_function": "sum"}}
            ]}),
        );
        match split(&t).unwrap() {
            SplitPlan::Pipeline(plan) => {
                assert_eq!(plan.layers, vec![vec!["src".to_string()], vec!["sum".to_string()]]);
                assert_eq!(plan.sinks, vec!["sum".to_string()]);
            }
            other => panic!("plan inesperado {other:?}"),
        }
    }

    #[test]
    fn whole_job_cubre_todo_en_un_solo_job() {
        let t = task("map", json!({"data": [1, 2, 3], "function": "square", "chunk_size": 1}));
        let job = whole_job(&t).unwrap();
        assert_eq!(job.input, JobInput::Chunk { offset: 0, items: vec![json!(1), json!(2), json!(3)] });
    }
}
