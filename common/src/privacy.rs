use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::engine::{num, MapFunction, ReduceOp};
use crate::error::{AggregationError, PrivacyError};
use crate::task::{PrivacyMode, Task, TaskPayload};

/// Orden de negociación de `auto`: del más fuerte al más débil.
pub const STRENGTH_ORDER: [PrivacyMode; 5] = [
    PrivacyMode::Fhe,
    PrivacyMode::Mpc,
    PrivacyMode::Mask,
    PrivacyMode::Shard,
    PrivacyMode::None,
];

/// Mayor entero que el offset de la máscara puede tocar sin perder exactitud en f64.
const MASK_SAFE_ABS: f64 = 1.0e12;

/// Lo que realmente se aplicó. Viaja en el reporte de la tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPrivacy {
    /// `task` o `task:nodo`.
    pub scope: String,
    pub requested: PrivacyMode,
    pub effective: PrivacyMode,
    pub degraded: bool,
    /// Estrategias probadas, en orden.
    pub tried: Vec<PrivacyMode>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Reversal {
    Identity,
    /// Salida por elemento: quitar corrección y deshacer la permutación.
    Elements { permutation: Vec<usize>, correction: f64 },
    /// Salida escalar de map_reduce: sólo la corrección del offset.
    Scalar { correction: f64 },
}

/// Inversa de la máscara. Nunca se envía a los workers.
#[derive(Debug, Clone, PartialEq)]
pub struct ReversalToken(Reversal);

impl ReversalToken {
    pub fn identity() -> Self {
        Self(Reversal::Identity)
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.0, Reversal::Identity)
    }

    /// Aplica la inversa sobre la salida ya agregada.
    pub fn invert(&self, output: Value) -> Result<Value, AggregationError> {
        match &self.0 {
            Reversal::Identity => Ok(output),
            Reversal::Scalar { correction } => {
                let y = output
                    .as_f64()
                    .ok_or_else(|| AggregationError::Unmask(format!("se esperaba escalar, recibido {output}")))?;
                Ok(num(y - correction))
            }
            Reversal::Elements { permutation, correction } => {
                let items = match output {
                    Value::Array(items) if items.len() == permutation.len() => items,
                    other => {
                        return Err(AggregationError::Unmask(format!(
                            "se esperaban {} elementos, recibido {other}",
                            permutation.len()
                        )))
                    }
                };
                let mut restored = vec![Value::Null; items.len()];
                for (masked_pos, item) in items.into_iter().enumerate() {
                    let y = item
                        .as_f64()
                        .ok_or_else(|| AggregationError::Unmask(format!("elemento no numérico: {item}")))?;
                    restored[permutation[masked_pos]] = num(y - correction);
                }
                Ok(Value::Array(restored))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transformed {
    pub task: Task,
    pub applied: AppliedPrivacy,
    pub token: ReversalToken,
}

fn implemented(mode: PrivacyMode) -> bool {
    matches!(mode, PrivacyMode::None | PrivacyMode::Shard | PrivacyMode::Mask)
}

fn item_count(payload: &TaskPayload) -> Option<usize> {
    match payload {
        TaskPayload::RangeReduce(r) => r.end.checked_sub(r.start).and_then(|n| usize::try_from(n).ok()),
        TaskPayload::Map(m) => Some(m.data.len()),
        TaskPayload::MapReduce(m) => Some(m.data.len()),
        TaskPayload::MatrixOps(m) => Some(m.matrix_a.len()),
        TaskPayload::MlInference(m) => Some(m.input_data.len()),
        TaskPayload::MlTrainStep(m) => Some(m.training_data.len()),
        TaskPayload::Generic(_) | TaskPayload::Pipeline(_) => None,
    }
}

fn applicable(mode: PrivacyMode, payload: &TaskPayload) -> bool {
    match mode {
        PrivacyMode::None => true,
        PrivacyMode::Shard => item_count(payload).is_some_and(|n| n >= 2),
        PrivacyMode::Mask => mask_correction(payload, 1.0).is_some(),
        PrivacyMode::Mpc | PrivacyMode::Fhe | PrivacyMode::Auto => false,
    }
}

/// Cadena de estrategias para un modo pedido; se prueba en orden.
pub fn fallback_chain(requested: PrivacyMode) -> Vec<PrivacyMode> {
    let start = match requested {
        PrivacyMode::Auto => 0,
        other => STRENGTH_ORDER.iter().position(|m| *m == other).unwrap_or(0),
    };
    STRENGTH_ORDER[start..].to_vec()
}

/// Reescribe la tarea según su modo de privacidad. Función pura: no toca estado.
pub fn apply(task: Task) -> Result<Transformed, PrivacyError> {
    let requested = task.privacy.mode;
    let mut tried = Vec::new();
    let mut effective = PrivacyMode::None;

    for mode in fallback_chain(requested) {
        tried.push(mode);
        let usable = match &task.payload {
            // los nodos se transforman uno por uno al activarse
            TaskPayload::Pipeline(_) => implemented(mode),
            payload => implemented(mode) && applicable(mode, payload),
        };
        if usable {
            effective = mode;
            break;
        }
    }

    let degraded = match requested {
        PrivacyMode::Auto => effective < PrivacyMode::Mask,
        other => effective != other,
    };
    let scope = task.job_prefix();
    if degraded {
        warn!(
            "privacidad degradada en {}: pedido {:?}, efectivo {:?} (probados {:?})",
            scope, requested, effective, tried
        );
    }

    if let Some(floor) = task.privacy.min_mode {
        if effective < floor {
            return Err(PrivacyError::BelowFloor { effective, floor });
        }
    }

    let mut applied = AppliedPrivacy {
        scope,
        requested,
        effective,
        degraded,
        tried,
        note: None,
    };

    let (task, token) = match effective {
        PrivacyMode::Shard => (shard(task), ReversalToken::identity()),
        PrivacyMode::Mask => {
            // la máscara también reparte: ningún job ve la colección entera
            let (task, token) = mask(shard(task));
            applied.note = Some("permutación + offset".to_string());
            (task, token)
        }
        _ => (task, ReversalToken::identity()),
    };

    Ok(Transformed { task, applied, token })
}

fn cap(chunk: &mut i64, n: usize) {
    let half = n.div_ceil(2) as i64;
    if *chunk > half {
        *chunk = half;
    }
}

/// Ningún job puede ver la colección completa: el tamaño de trozo queda en ⌈n/2⌉ como máximo.
fn shard(mut task: Task) -> Task {
    let Some(n) = item_count(&task.payload) else {
        return task;
    };
    match &mut task.payload {
        TaskPayload::RangeReduce(r) => cap(&mut r.chunk_size, n),
        TaskPayload::Map(m) => cap(&mut m.chunk_size, n),
        TaskPayload::MapReduce(m) => cap(&mut m.chunk_size, n),
        TaskPayload::MatrixOps(m) => cap(&mut m.block_rows, n),
        TaskPayload::MlInference(m) => cap(&mut m.batch_size, n),
        TaskPayload::MlTrainStep(m) => cap(&mut m.batch_size, n),
        TaskPayload::Generic(_) | TaskPayload::Pipeline(_) => {}
    }
    task
}

/* =========================
   Máscara
   ========================= */

struct SeededRng(u64);

impl SeededRng {
    /// FNV-1a sobre el alcance: la semilla no depende de la versión del compilador.
    fn for_task(scope: &str) -> Self {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in scope.bytes().chain(b"/mask".iter().copied()) {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        // xorshift no admite semilla 0
        Self(h | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut p: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = (self.next() % (i as u64 + 1)) as usize;
            p.swap(i, j);
        }
        p
    }
}

fn permute(data: &[Value], p: &[usize]) -> Vec<Value> {
    p.iter().map(|&i| data[i].clone()).collect()
}

fn exact_integers(data: &[Value]) -> bool {
    data.iter().all(|v| v.as_f64().is_some_and(|x| x.fract() == 0.0 && x.abs() < MASK_SAFE_ABS))
}

/// Corrección de salida para `f(x + k)` cuando `f` es afín y exacta en enteros.
fn affine_correction(f: MapFunction, k: f64) -> Option<f64> {
    match f {
        MapFunction::Identity => Some(k),
        MapFunction::Increment(by) if by.fract() == 0.0 => Some(k),
        MapFunction::Double => Some(2.0 * k),
        MapFunction::Negate => Some(-k),
        MapFunction::Increment(_) | MapFunction::Square => None,
    }
}

/// Corrección que deshace un offset `k` sobre la salida, o `None` si el offset no se puede
/// revertir con exactitud. Sin offset el worker vería los valores reales, así que `None`
/// significa que la tarea no admite máscara.
fn mask_correction(payload: &TaskPayload, k: f64) -> Option<f64> {
    match payload {
        TaskPayload::Map(m) if exact_integers(&m.data) => affine_correction(m.function, k),
        TaskPayload::MapReduce(m) if exact_integers(&m.data) => {
            let per_item = affine_correction(m.map_function, k)?;
            match m.reduce_function {
                ReduceOp::Sum => Some(m.data.len() as f64 * per_item),
                ReduceOp::Average | ReduceOp::Min | ReduceOp::Max => Some(per_item),
                ReduceOp::Count => Some(0.0),
                ReduceOp::Product => None,
            }
        }
        _ => None,
    }
}

fn shift(data: &mut [Value], k: f64) {
    for v in data.iter_mut() {
        if let Some(x) = v.as_f64() {
            *v = num(x + k);
        }
    }
}

/// Permuta y desplaza los datos. Sólo se llama si `mask_correction` admitió la tarea.
fn mask(mut task: Task) -> (Task, ReversalToken) {
    let mut rng = SeededRng::for_task(&task.job_prefix());
    let offset = (1 + rng.next() % 1000) as f64;
    let Some(correction) = mask_correction(&task.payload, offset) else {
        return (task, ReversalToken::identity());
    };

    match &mut task.payload {
        TaskPayload::Map(m) => {
            let permutation = rng.permutation(m.data.len());
            m.data = permute(&m.data, &permutation);
            shift(&mut m.data, offset);
            (task, ReversalToken(Reversal::Elements { permutation, correction }))
        }
        TaskPayload::MapReduce(m) => {
            let permutation = rng.permutation(m.data.len());
            m.data = permute(&m.data, &permutation);
            shift(&mut m.data, offset);
            (task, ReversalToken(Reversal::Scalar { correction }))
        }
        _ => (task, ReversalToken::identity()),
    }
}
