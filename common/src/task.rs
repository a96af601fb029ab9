use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{PipelineGraph, PipelineNode};
use crate::engine::{MapFunction, Matrix, MatrixOp, ReduceOp};
use crate::error::InvalidTaskError;
use crate::job::{CodeRef, SandboxKind};
use crate::pricing::{self, Budget};

pub type TaskId = String;

const DEFAULT_RANGE_CHUNK: i64 = 1000;
const DEFAULT_TRAIN_BATCH: i64 = 32;
const DEFAULT_LEARNING_RATE: f64 = 0.001;
/// Tope para timeouts y deadlines: una semana.
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 3600;

/* =========================
   Enumeraciones cerradas
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RangeReduce,
    Map,
    MapReduce,
    MatrixOps,
    MlInference,
    MlTrainStep,
    Generic,
    Pipeline,
}

impl TaskType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "range_reduce" => Some(Self::RangeReduce),
            "map" => Some(Self::Map),
            "map_reduce" => Some(Self::MapReduce),
            "matrix_ops" => Some(Self::MatrixOps),
            "ml_inference" => Some(Self::MlInference),
            "ml_train_step" => Some(Self::MlTrainStep),
            "generic" => Some(Self::Generic),
            "pipeline" => Some(Self::Pipeline),
            _ => None,
        }
    }
}

/// Modos de privacidad, ordenados de más débil a más fuerte (`Auto` es una negociación, no un nivel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMode {
    None,
    Shard,
    Mask,
    Mpc,
    Fhe,
    Auto,
}

impl PrivacyMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "shard" => Some(Self::Shard),
            "mask" => Some(Self::Mask),
            "mpc" => Some(Self::Mpc),
            "fhe" => Some(Self::Fhe),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Shard => "shard",
            Self::Mask => "mask",
            Self::Mpc => "mpc",
            Self::Fhe => "fhe",
            Self::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLevel {
    Off,
    Basic,
    Strict,
}

impl VerificationLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "basic" => Some(Self::Basic),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

/// El orden de declaración es el de urgencia: `High` se despacha antes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Accepted,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/* =========================
   Requisitos y configuración
   ========================= */

fn default_cpu() -> f64 {
    50.0
}
fn default_ram() -> f64 {
    1.0
}
fn default_timeout() -> u64 {
    300
}
fn default_max_price() -> f64 {
    0.1
}
fn default_retry() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default = "default_cpu")]
    pub cpu_percent: f64,
    #[serde(default = "default_ram")]
    pub ram_gb: f64,
    #[serde(default)]
    pub gpu_percent: f64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_percent: default_cpu(),
            ram_gb: default_ram(),
            gpu_percent: 0.0,
            timeout_seconds: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_max_price")]
    pub max_price: f64,
    #[serde(default)]
    pub priority: Priority,
    /// Intentos máximos por job (mínimo 1).
    #[serde(default = "default_retry")]
    pub retry_count: u32,
    #[serde(default = "default_true")]
    pub validation_required: bool,
    /// Deadline de la tarea completa, en segundos desde el envío.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_price: default_max_price(),
            priority: Priority::Normal,
            retry_count: default_retry(),
            validation_required: true,
            deadline_secs: None,
        }
    }
}

fn default_mode() -> String {
    "none".to_string()
}
fn default_verification() -> String {
    "off".to_string()
}

/// Privacidad tal como llega del usuario (strings sin validar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyDeclaration {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_verification")]
    pub verification: String,
    #[serde(default)]
    pub min_mode: Option<String>,
}

impl Default for PrivacyDeclaration {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            verification: default_verification(),
            min_mode: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacySpec {
    pub mode: PrivacyMode,
    pub verification: VerificationLevel,
    pub min_mode: Option<PrivacyMode>,
}

/* =========================
   Declaración y tarea normalizada
   ========================= */

/// Lo que envía el dueño de la tarea. Los campos con forma libre se validan en `validate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDeclaration {
    #[serde(default)]
    pub owner_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub requirements: ResourceRequirements,
    #[serde(default)]
    pub config: TaskConfig,
    #[serde(default)]
    pub privacy: PrivacyDeclaration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeSpec {
    pub start: i64,
    /// Exclusivo.
    pub end: i64,
    pub operation: ReduceOp,
    pub chunk_size: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapSpec {
    pub data: Vec<Value>,
    pub function: MapFunction,
    pub chunk_size: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapReduceSpec {
    pub data: Vec<Value>,
    pub map_function: MapFunction,
    pub reduce_function: ReduceOp,
    pub chunk_size: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSpec {
    pub operation: MatrixOp,
    pub matrix_a: Matrix,
    pub matrix_b: Option<Matrix>,
    pub block_rows: i64,
}

/// Modelo lineal de referencia: `w·x + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub model_path: String,
    pub model_type: String,
    pub weights: Vec<f64>,
    pub bias: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSpec {
    pub model: LinearModel,
    pub input_data: Vec<Value>,
    pub batch_size: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainStepSpec {
    pub model: LinearModel,
    pub training_data: Vec<Value>,
    pub batch_size: i64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenericSpec {
    pub code_ref: CodeRef,
    pub input: Value,
}

/// Payload tipado: una variante por tipo de tarea.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    RangeReduce(RangeSpec),
    Map(MapSpec),
    MapReduce(MapReduceSpec),
    MatrixOps(MatrixSpec),
    MlInference(InferenceSpec),
    MlTrainStep(TrainStepSpec),
    Generic(GenericSpec),
    Pipeline(PipelineGraph),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::RangeReduce(_) => TaskType::RangeReduce,
            Self::Map(_) => TaskType::Map,
            Self::MapReduce(_) => TaskType::MapReduce,
            Self::MatrixOps(_) => TaskType::MatrixOps,
            Self::MlInference(_) => TaskType::MlInference,
            Self::MlTrainStep(_) => TaskType::MlTrainStep,
            Self::Generic(_) => TaskType::Generic,
            Self::Pipeline(_) => TaskType::Pipeline,
        }
    }
}

/// Tarea aceptada. Inmutable: el estado vive en el coordinador.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    /// Nodo del pipeline al que pertenece, si es una sub-tarea.
    pub node_id: Option<String>,
    pub owner_id: String,
    pub requirements: ResourceRequirements,
    pub config: TaskConfig,
    pub privacy: PrivacySpec,
    pub payload: TaskPayload,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.retry_count.max(1)
    }

    /// Tope de precio que cada job de la tarea aplica al elegir worker.
    pub fn budget(&self) -> Budget {
        Budget {
            requirements: self.requirements.clone(),
            priority: self.config.priority,
            max_price: self.config.max_price,
        }
    }

    /// Prefijo de los ids de job: `task` o `task:nodo`.
    pub fn job_prefix(&self) -> String {
        match &self.node_id {
            Some(node) => format!("{}:{}", self.id, node),
            None => self.id.clone(),
        }
    }
}

/* =========================
   Validación
   ========================= */

impl TaskDeclaration {
    /// Valida y normaliza. Junta todas las violaciones antes de fallar.
    pub fn validate(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Task, InvalidTaskError> {
        let mut v = Violations::default();
        let task = self.validate_into(id, None, now, &mut v);
        match task {
            Some(task) if v.0.is_empty() => Ok(task),
            _ => Err(InvalidTaskError::new(v.0)),
        }
    }

    /// Valida la declaración de un nodo de pipeline cuyo input ya fue enlazado.
    pub fn validate_node(
        &self,
        id: TaskId,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, InvalidTaskError> {
        let mut v = Violations::default();
        let task = self.validate_into(id, Some(node_id.to_string()), now, &mut v);
        match task {
            Some(task) if v.0.is_empty() => Ok(task),
            _ => Err(InvalidTaskError::new(v.0)),
        }
    }

    fn validate_into(
        &self,
        id: TaskId,
        node_id: Option<String>,
        now: DateTime<Utc>,
        v: &mut Violations,
    ) -> Option<Task> {
        if self.owner_id.trim().is_empty() {
            v.push("owner_id es obligatorio");
        }

        let r = &self.requirements;
        if !(r.cpu_percent > 0.0 && r.cpu_percent <= 100.0) {
            v.push(format!("requirements.cpu_percent debe estar en (0, 100], recibido {}", r.cpu_percent));
        }
        if !(r.ram_gb > 0.0) {
            v.push(format!("requirements.ram_gb debe ser > 0, recibido {}", r.ram_gb));
        }
        if !(0.0..=100.0).contains(&r.gpu_percent) {
            v.push(format!("requirements.gpu_percent debe estar en [0, 100], recibido {}", r.gpu_percent));
        }
        if r.timeout_seconds == 0 || r.timeout_seconds > MAX_DURATION_SECS {
            v.push(format!(
                "requirements.timeout_seconds debe estar en [1, {MAX_DURATION_SECS}], recibido {}",
                r.timeout_seconds
            ));
        }
        if let Some(d) = self.config.deadline_secs {
            if d == 0 || d > MAX_DURATION_SECS {
                v.push(format!("config.deadline_secs debe estar en [1, {MAX_DURATION_SECS}], recibido {d}"));
            }
        }
        if !(self.config.max_price >= 0.0) {
            v.push("config.max_price no puede ser negativo");
        } else {
            // ni el worker de mejor reputación entraría en el tope
            let floor = pricing::job_quote(r, self.config.priority, 1.0);
            if floor > self.config.max_price {
                v.push(format!(
                    "config.max_price ({}) no cubre el precio mínimo por job ({floor:.6})",
                    self.config.max_price
                ));
            }
        }

        let privacy = self.privacy.validate(v);
        let payload = match TaskType::parse(&self.task_type) {
            Some(tt) => parse_payload(tt, &self.payload, false, v),
            None => {
                v.push(format!("task_type desconocido: {:?}", self.task_type));
                None
            }
        };

        Some(Task {
            id,
            node_id,
            owner_id: self.owner_id.clone(),
            requirements: self.requirements.clone(),
            config: self.config.clone(),
            privacy: privacy?,
            payload: payload?,
            submitted_at: now,
        })
    }
}

impl PrivacyDeclaration {
    fn validate(&self, v: &mut Violations) -> Option<PrivacySpec> {
        let mode = PrivacyMode::parse(&self.mode);
        if mode.is_none() {
            v.push(format!("privacy.mode desconocido: {:?}", self.mode));
        }
        let verification = VerificationLevel::parse(&self.verification);
        if verification.is_none() {
            v.push(format!("privacy.verification desconocido: {:?}", self.verification));
        }
        let min_mode = match self.min_mode.as_deref() {
            None => None,
            Some(m) => match PrivacyMode::parse(m) {
                Some(PrivacyMode::Auto) | None => {
                    v.push(format!("privacy.min_mode inválido: {m:?}"));
                    return None;
                }
                Some(m) => Some(m),
            },
        };
        Some(PrivacySpec {
            mode: mode?,
            verification: verification?,
            min_mode,
        })
    }
}

#[derive(Default)]
struct Violations(Vec<String>);

impl Violations {
    fn push(&mut self, msg: impl Into<String>) {
        self.0.push(msg.into());
    }
}

fn int_field(payload: &Value, name: &str, default: Option<i64>, v: &mut Violations) -> Option<i64> {
    match payload.get(name) {
        None | Some(Value::Null) => {
            if default.is_none() {
                v.push(format!("payload.{name} es obligatorio"));
            }
            default
        }
        Some(val) => match val.as_i64() {
            Some(n) => Some(n),
            None => {
                v.push(format!("payload.{name} debe ser entero"));
                None
            }
        },
    }
}

fn str_field<'a>(payload: &'a Value, name: &str, v: &mut Violations) -> Option<&'a str> {
    match payload.get(name).and_then(|x| x.as_str()) {
        Some(s) if !s.trim().is_empty() => Some(s),
        _ => {
            v.push(format!("payload.{name} es obligatorio"));
            None
        }
    }
}

fn list_field(payload: &Value, name: &str, allow_empty: bool, v: &mut Violations) -> Option<Vec<Value>> {
    match payload.get(name) {
        Some(Value::Array(items)) if !items.is_empty() || allow_empty => Some(items.clone()),
        Some(Value::Array(_)) => {
            v.push(format!("payload.{name} no puede estar vacío"));
            None
        }
        None | Some(Value::Null) if allow_empty => Some(Vec::new()),
        _ => {
            v.push(format!("payload.{name} debe ser una lista no vacía"));
            None
        }
    }
}

fn reduce_field(payload: &Value, name: &str, v: &mut Violations) -> Option<ReduceOp> {
    let raw = str_field(payload, name, v)?;
    let op = ReduceOp::parse(raw);
    if op.is_none() {
        v.push(format!("payload.{name}: operación de reducción desconocida {raw:?}"));
    }
    op
}

fn map_function_field(payload: &Value, name: &str, v: &mut Violations) -> Option<MapFunction> {
    let raw = str_field(payload, name, v)?;
    let params = payload.get("params").cloned().unwrap_or(Value::Null);
    let f = MapFunction::parse(raw, &params);
    if f.is_none() {
        v.push(format!("payload.{name}: función desconocida {raw:?}"));
    }
    f
}

fn matrix_field(payload: &Value, name: &str, required: bool, v: &mut Violations) -> Option<Matrix> {
    let raw = match payload.get(name) {
        None | Some(Value::Null) => {
            if required {
                v.push(format!("payload.{name} es obligatorio"));
            }
            return None;
        }
        Some(raw) => raw,
    };
    let parsed: Option<Matrix> = serde_json::from_value(raw.clone()).ok();
    match parsed {
        Some(m) if m.is_empty() || m[0].is_empty() => {
            v.push(format!("payload.{name} no puede estar vacía"));
            None
        }
        Some(m) if m.iter().any(|row| row.len() != m[0].len()) => {
            v.push(format!("payload.{name} debe ser rectangular"));
            None
        }
        Some(m) => Some(m),
        None => {
            v.push(format!("payload.{name} debe ser una matriz numérica"));
            None
        }
    }
}

fn model_field(payload: &Value, dims: Option<usize>, v: &mut Violations) -> Option<LinearModel> {
    let model_path = str_field(payload, "model_path", v)?.to_string();
    let model_type = payload
        .get("model_type")
        .and_then(|x| x.as_str())
        .unwrap_or("linear")
        .to_string();
    let weights: Vec<f64> = match payload.get("weights") {
        Some(w) => match serde_json::from_value(w.clone()) {
            Ok(w) => w,
            Err(_) => {
                v.push("payload.weights debe ser una lista de números");
                return None;
            }
        },
        None => vec![0.0; dims.unwrap_or(0)],
    };
    if let Some(d) = dims {
        if weights.len() != d {
            v.push(format!("payload.weights tiene {} elementos, se esperaban {d}", weights.len()));
        }
    }
    let bias = payload.get("bias").and_then(|b| b.as_f64()).unwrap_or(0.0);
    Some(LinearModel {
        model_path,
        model_type,
        weights,
        bias,
    })
}

fn parse_payload(
    tt: TaskType,
    payload: &Value,
    fed_by_dependencies: bool,
    v: &mut Violations,
) -> Option<TaskPayload> {
    match tt {
        TaskType::RangeReduce => {
            let start = int_field(payload, "start", None, v);
            let end = int_field(payload, "end", None, v);
            let operation = reduce_field(payload, "operation", v);
            let chunk_size = int_field(payload, "chunk_size", Some(DEFAULT_RANGE_CHUNK), v);
            if let (Some(s), Some(e)) = (start, end) {
                if s >= e {
                    v.push(format!("payload.start ({s}) debe ser menor que payload.end ({e})"));
                } else if e.checked_sub(s).is_none() {
                    v.push(format!("payload: el rango [{s}, {e}) no cabe en un entero de 64 bits"));
                }
            }
            Some(TaskPayload::RangeReduce(RangeSpec {
                start: start?,
                end: end?,
                operation: operation?,
                chunk_size: chunk_size?,
            }))
        }
        TaskType::Map => {
            let data = list_field(payload, "data", fed_by_dependencies, v);
            let function = map_function_field(payload, "function", v);
            let default_chunk = data.as_ref().map(|d| d.len().max(1) as i64);
            let chunk_size = int_field(payload, "chunk_size", default_chunk, v);
            Some(TaskPayload::Map(MapSpec {
                data: data?,
                function: function?,
                chunk_size: chunk_size?,
            }))
        }
        TaskType::MapReduce => {
            let data = list_field(payload, "data", fed_by_dependencies, v);
            let map_function = map_function_field(payload, "map_function", v);
            let reduce_function = reduce_field(payload, "reduce_function", v);
            let default_chunk = data.as_ref().map(|d| d.len().max(1) as i64);
            let chunk_size = int_field(payload, "chunk_size", default_chunk, v);
            Some(TaskPayload::MapReduce(MapReduceSpec {
                data: data?,
                map_function: map_function?,
                reduce_function: reduce_function?,
                chunk_size: chunk_size?,
            }))
        }
        TaskType::MatrixOps => {
            let operation = str_field(payload, "operation", v).and_then(|raw| {
                let op = MatrixOp::parse(raw);
                if op.is_none() {
                    v.push(format!("payload.operation: operación matricial desconocida {raw:?}"));
                }
                op
            });
            let a = matrix_field(payload, "matrix_a", true, v);
            let needs_b = matches!(operation, Some(MatrixOp::Add | MatrixOp::Multiply));
            let b = matrix_field(payload, "matrix_b", needs_b, v);
            if let (Some(op), Some(a), Some(b)) = (operation, a.as_ref(), b.as_ref()) {
                match op {
                    MatrixOp::Add if a.len() != b.len() || a[0].len() != b[0].len() => {
                        v.push("matrix_a y matrix_b deben tener la misma forma para add");
                    }
                    MatrixOp::Multiply if a[0].len() != b.len() => {
                        v.push("columnas de matrix_a deben coincidir con filas de matrix_b");
                    }
                    _ => {}
                }
            }
            let default_rows = a.as_ref().map(|a| a.len() as i64);
            let block_rows = int_field(payload, "block_rows", default_rows, v);
            Some(TaskPayload::MatrixOps(MatrixSpec {
                operation: operation?,
                matrix_a: a?,
                matrix_b: if needs_b { Some(b?) } else { None },
                block_rows: block_rows?,
            }))
        }
        TaskType::MlInference => {
            let input_data = list_field(payload, "input_data", fed_by_dependencies, v);
            let dims = input_data
                .as_ref()
                .and_then(|d| d.first())
                .and_then(|row| row.as_array())
                .map(|row| row.len());
            let model = model_field(payload, dims, v);
            let batch_size = int_field(payload, "batch_size", Some(1), v);
            Some(TaskPayload::MlInference(InferenceSpec {
                model: model?,
                input_data: input_data?,
                batch_size: batch_size?,
            }))
        }
        TaskType::MlTrainStep => {
            let training_data = list_field(payload, "training_data", fed_by_dependencies, v);
            let dims = training_data
                .as_ref()
                .and_then(|d| d.first())
                .and_then(|s| s.get("features"))
                .and_then(|f| f.as_array())
                .map(|f| f.len());
            let model = model_field(payload, dims, v);
            let batch_size = int_field(payload, "batch_size", Some(DEFAULT_TRAIN_BATCH), v);
            let learning_rate = payload
                .get("learning_rate")
                .and_then(|x| x.as_f64())
                .unwrap_or(DEFAULT_LEARNING_RATE);
            if !(learning_rate > 0.0) {
                v.push("payload.learning_rate debe ser > 0");
            }
            Some(TaskPayload::MlTrainStep(TrainStepSpec {
                model: model?,
                training_data: training_data?,
                batch_size: batch_size?,
                learning_rate,
            }))
        }
        TaskType::Generic => {
            let code_ref = match payload.get("code_ref") {
                Some(Value::String(handler)) if !handler.trim().is_empty() => Some(CodeRef {
                    sandbox: SandboxKind::Builtin,
                    handler: handler.clone(),
                    params: Value::Null,
                }),
                Some(obj @ Value::Object(_)) => match serde_json::from_value::<CodeRef>(obj.clone()) {
                    Ok(c) if !c.handler.trim().is_empty() => Some(c),
                    _ => {
                        v.push("payload.code_ref inválido: se esperaba {handler, sandbox, params}");
                        None
                    }
                },
                _ => {
                    v.push("payload.code_ref es obligatorio");
                    None
                }
            };
            let input = payload.get("input").cloned().unwrap_or(Value::Null);
            Some(TaskPayload::Generic(GenericSpec {
                code_ref: code_ref?,
                input,
            }))
        }
        TaskType::Pipeline => parse_pipeline(payload, v).map(TaskPayload::Pipeline),
    }
}

fn parse_pipeline(payload: &Value, v: &mut Violations) -> Option<PipelineGraph> {
    let nodes: Vec<PipelineNode> = match payload.get("nodes") {
        Some(raw @ Value::Array(items)) if !items.is_empty() => {
            match serde_json::from_value(raw.clone()) {
                Ok(nodes) => nodes,
                Err(e) => {
                    v.push(format!("payload.nodes inválido: {e}"));
                    return None;
                }
            }
        }
        _ => {
            v.push("payload.nodes debe ser una lista no vacía");
            return None;
        }
    };

    let graph = PipelineGraph { nodes };
    let before = v.0.len();

    for node in &graph.nodes {
        if node.id.trim().is_empty() {
            v.push("pipeline: todos los nodos necesitan id");
            continue;
        }
        match TaskType::parse(&node.task_type) {
            Some(TaskType::Pipeline) => {
                v.push(format!("pipeline: el nodo {} no puede ser otro pipeline", node.id));
            }
            Some(tt) => {
                let mut node_v = Violations::default();
                parse_payload(tt, &node.payload, !node.depends_on.is_empty(), &mut node_v);
                for msg in node_v.0 {
                    v.push(format!("pipeline.{}: {msg}", node.id));
                }
            }
            None => v.push(format!(
                "pipeline.{}: task_type desconocido {:?}",
                node.id, node.task_type
            )),
        }
    }

    if let Err(e) = graph.topological_order() {
        v.push(format!("pipeline: {e}"));
    }

    if v.0.len() == before {
        Some(graph)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(task_type: &str, payload: Value) -> TaskDeclaration {
        TaskDeclaration {
            owner_id: "alice".into(),
            task_type: task_type.into(),
            payload,
            requirements: ResourceRequirements::default(),
            config: TaskConfig::default(),
            privacy: PrivacyDeclaration::default(),
        }
    }

    #[test]
    fn declaracion_map_valida_se_normaliza() {
        let d = decl("map", json!({"data": [1, 2, 3], "function": "increment", "chunk_size": 2}));
        let task = d.validate("t1".into(), Utc::now()).unwrap();

        assert_eq!(task.task_type(), TaskType::Map);
        assert_eq!(task.max_attempts(), 3);
        match task.payload {
            TaskPayload::Map(m) => {
                assert_eq!(m.chunk_size, 2);
                assert_eq!(m.function, MapFunction::Increment(1.0));
            }
            other => panic!("payload inesperado: {other:?}"),
        }
    }

    #[test]
    fn validacion_lista_todas_las_violaciones() {
        let mut d = decl("map", json!({"data": [], "function": "nope"}));
        d.owner_id = String::new();
        d.requirements.cpu_percent = 150.0;
        d.requirements.ram_gb = 0.0;
        d.privacy.mode = "quantum".into();

        let err = d.validate("t1".into(), Utc::now()).unwrap_err();
        let all = err.violations.join("\n");

        assert!(all.contains("owner_id"));
        assert!(all.contains("cpu_percent"));
        assert!(all.contains("ram_gb"));
        assert!(all.contains("privacy.mode"));
        assert!(all.contains("payload.data"));
        assert!(all.contains("función desconocida"));
        assert!(err.violations.len() >= 6);
    }

    #[test]
    fn task_type_desconocido_es_violacion() {
        let err = decl("teleport", json!({}))
            .validate("t1".into(), Utc::now())
            .unwrap_err();
        assert!(err.violations[0].contains("task_type"));
    }

    #[test]
    fn rango_con_start_mayor_o_igual_a_end_es_invalido() {
        let err = decl("range_reduce", json!({"start": 5, "end": 5, "operation": "sum"}))
            .validate("t1".into(), Utc::now())
            .unwrap_err();
        assert!(err.violations.iter().any(|m| m.contains("menor que")));
    }

    #[test]
    fn rango_que_no_cabe_en_i64_es_invalido() {
        let err = decl(
            "range_reduce",
            json!({"start": -9_000_000_000_000_000_000i64, "end": 9_000_000_000_000_000_000i64, "operation": "sum"}),
        )
        .validate("t1".into(), Utc::now())
        .unwrap_err();
        assert!(err.violations.iter().any(|m| m.contains("no cabe")));
    }

    #[test]
    fn max_price_que_no_cubre_ni_al_mejor_worker_se_rechaza() {
        let mut d = decl("generic", json!({"code_ref": "echo"}));
        d.requirements.cpu_percent = 100.0;
        d.requirements.ram_gb = 64.0;
        d.requirements.timeout_seconds = 24 * 3600;
        let err = d.validate("t1".into(), Utc::now()).unwrap_err();
        assert!(err.violations.iter().any(|m| m.contains("config.max_price")));

        d.config.max_price = 100.0;
        let t = d.validate("t1".into(), Utc::now()).unwrap();
        assert!(t.budget().admits(1.0));
    }

    #[test]
    fn matrices_con_formas_incompatibles_se_rechazan() {
        let err = decl(
            "matrix_ops",
            json!({"operation": "multiply", "matrix_a": [[1, 2]], "matrix_b": [[1, 2]]}),
        )
        .validate("t1".into(), Utc::now())
        .unwrap_err();
        assert!(err.violations.iter().any(|m| m.contains("columnas")));
    }

    #[test]
    fn pipeline_con_ciclo_se_rechaza() {
        let d = decl(
            "pipeline",
            json!({"nodes": [
                {"id": "a", "depends_on": ["b"], "task_type": "map", "payload": {"function": "square"}},
                {"id": "b", "depends_on": ["a"], "task_type": "map", "payload": {"function": "square"}}
            ]}),
        );
        let err = d.validate("t1".into(), Utc::now()).unwrap_err();
        assert!(err.violations.iter().any(|m| m.contains("ciclo")));
    }

    #[test]
    fn pipeline_con_dependencia_desconocida_se_rechaza() {
        let d = decl(
            "pipeline",
            json!({"nodes": [
                {"id": "a", "depends_on": ["ghost"], "task_type": "map", "payload": {"function": "square"}}
            ]}),
        );
        let err = d.validate("t1".into(), Utc::now()).unwrap_err();
        assert!(err.violations.iter().any(|m| m.contains("ghost")));
    }

    #[test]
    fn nodo_raiz_de_pipeline_necesita_datos_propios() {
        let d = decl(
            "pipeline",
            json!({"nodes": [
                {"id": "a", "task_type": "map", "payload": {"function": "square"}}
            ]}),
        );
        let err = d.validate("t1".into(), Utc::now()).unwrap_err();
        assert!(err.violations.iter().any(|m| m.starts_with("pipeline.a:")));
    }

    #[test]
    fn generic_acepta_code_ref_como_string() {
        let task = decl("generic", json!({"code_ref": "echo", "input": {"x": 1}}))
            .validate("t1".into(), Utc::now())
            .unwrap();
        match task.payload {
            TaskPayload::Generic(g) => {
                assert_eq!(g.code_ref.handler, "echo");
                assert_eq!(g.code_ref.sandbox, SandboxKind::Builtin);
            }
            other => panic!("payload inesperado: {other:?}"),
        }
    }

    #[test]
    fn min_mode_auto_no_es_un_piso_valido() {
        let mut d = decl("map", json!({"data": [1], "function": "square"}));
        d.privacy.min_mode = Some("auto".into());
        assert!(d.validate("t1".into(), Utc::now()).is_err());
    }
}
