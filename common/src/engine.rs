use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AggregationError, EngineError};
use crate::job::{CodeRef, JobInput};

/// Tipo genérico de registro: JSON para poder representar cualquier elemento de entrada.
pub type Record = Value;

pub type Matrix = Vec<Vec<f64>>;

/* =========================
   Números
   ========================= */

/// Emite enteros cuando el valor es integral, para que `[1,2]` no se convierta en `[1.0,2.0]`.
pub fn num(x: f64) -> Value {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 9.0e15 {
        json!(x as i64)
    } else {
        json!(x)
    }
}

fn as_number(rec: &Record) -> Result<f64, EngineError> {
    rec.as_f64()
        .ok_or_else(|| EngineError::BadInput(format!("se esperaba un número, recibido {rec}")))
}

fn as_row(rec: &Record) -> Result<Vec<f64>, EngineError> {
    rec.as_array()
        .ok_or_else(|| EngineError::BadInput(format!("se esperaba una fila numérica, recibido {rec}")))?
        .iter()
        .map(as_number)
        .collect()
}

/* =========================
   Funciones map
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MapFunction {
    Identity,
    Square,
    Double,
    Negate,
    Increment(f64),
}

impl MapFunction {
    pub fn parse(name: &str, params: &Value) -> Option<Self> {
        match name {
            "identity" => Some(Self::Identity),
            "square" => Some(Self::Square),
            "double" => Some(Self::Double),
            "negate" => Some(Self::Negate),
            "increment" => {
                let by = params.get("increment").and_then(|v| v.as_f64()).unwrap_or(1.0);
                Some(Self::Increment(by))
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Square => "square",
            Self::Double => "double",
            Self::Negate => "negate",
            Self::Increment(_) => "increment",
        }
    }

    /// Lee la función desde los params de un code_ref (`{"function": .., "increment": ..}`).
    pub fn from_params(params: &Value, key: &str) -> Result<Self, EngineError> {
        let name = params
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::BadInput(format!("falta params.{key}")))?;
        Self::parse(name, params).ok_or_else(|| EngineError::UnknownFunction(name.to_string()))
    }

    pub fn increment(&self) -> Option<f64> {
        match self {
            Self::Increment(by) => Some(*by),
            _ => None,
        }
    }

    pub fn apply(&self, rec: &Record) -> Result<Record, EngineError> {
        if let Self::Identity = self {
            return Ok(rec.clone());
        }
        let x = as_number(rec)?;
        let y = match self {
            Self::Identity => x,
            Self::Square => x * x,
            Self::Double => 2.0 * x,
            Self::Negate => -x,
            Self::Increment(by) => x + by,
        };
        Ok(num(y))
    }
}

/// map: aplica una función a cada registro y devuelve una nueva colección.
pub fn op_map(input: &[Record], f: MapFunction) -> Result<Vec<Record>, EngineError> {
    input.iter().map(|rec| f.apply(rec)).collect()
}

/* =========================
   Reducciones
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
    Count,
    Average,
}

impl ReduceOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sum" => Some(Self::Sum),
            "product" => Some(Self::Product),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "count" => Some(Self::Count),
            "average" | "avg" | "mean" => Some(Self::Average),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Product => "product",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::Average => "average",
        }
    }

    fn fold(&self, acc: f64, x: f64) -> f64 {
        match self {
            Self::Sum | Self::Average => acc + x,
            Self::Product => acc * x,
            Self::Min => acc.min(x),
            Self::Max => acc.max(x),
            Self::Count => acc + 1.0,
        }
    }

    fn identity(&self) -> f64 {
        match self {
            Self::Sum | Self::Average | Self::Count => 0.0,
            Self::Product => 1.0,
            Self::Min => f64::INFINITY,
            Self::Max => f64::NEG_INFINITY,
        }
    }
}

/// Reducción parcial de un job. Para `average` el valor es la suma y `count` permite recombinar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Partial {
    pub value: f64,
    pub count: u64,
}

impl Partial {
    /// Un parcial desbordado (±inf, NaN) no tiene representación JSON: es error, no `null`.
    /// Un parcial vacío viaja con `value: null`.
    pub fn to_json(&self) -> Result<Value, EngineError> {
        if self.count == 0 {
            return Ok(json!({ "value": Value::Null, "count": 0 }));
        }
        if !self.value.is_finite() {
            return Err(EngineError::NonFinite(format!(
                "parcial {} sobre {} elementos",
                self.value, self.count
            )));
        }
        Ok(json!({ "value": num(self.value), "count": self.count }))
    }

    pub fn from_json(v: &Value) -> Option<Self> {
        let count = v.get("count")?.as_u64()?;
        let value = match v.get("value")? {
            Value::Null if count == 0 => f64::NAN,
            other => other.as_f64()?,
        };
        Some(Self { value, count })
    }
}

pub fn reduce_partial<I>(op: ReduceOp, values: I) -> Partial
where
    I: IntoIterator<Item = f64>,
{
    let mut acc = op.identity();
    let mut count = 0u64;
    for x in values {
        acc = op.fold(acc, x);
        count += 1;
    }
    Partial { value: acc, count }
}

/// Combina parciales con el mismo operador; `average` pondera por `count`.
/// Los parciales vacíos no aportan; sin elementos, `min`, `max` y `average` dan `null`.
pub fn combine_partials(op: ReduceOp, parts: &[Partial]) -> Result<Value, AggregationError> {
    let count: u64 = parts.iter().map(|p| p.count).sum();
    let filled = || parts.iter().filter(|p| p.count > 0).map(|p| p.value);
    let value = match op {
        ReduceOp::Count => count as f64,
        _ if count == 0 && matches!(op, ReduceOp::Min | ReduceOp::Max | ReduceOp::Average) => {
            return Ok(Value::Null);
        }
        ReduceOp::Sum => filled().sum(),
        ReduceOp::Product => filled().product(),
        ReduceOp::Min => filled().fold(f64::INFINITY, f64::min),
        ReduceOp::Max => filled().fold(f64::NEG_INFINITY, f64::max),
        ReduceOp::Average => filled().sum::<f64>() / count as f64,
    };
    if !value.is_finite() {
        return Err(AggregationError::NonFinite(format!("{} de {} parciales", op.name(), parts.len())));
    }
    Ok(num(value))
}

pub fn range_partial(start: i64, end: i64, op: ReduceOp) -> Partial {
    reduce_partial(op, (start..end).map(|i| i as f64))
}

/* =========================
   Matrices
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixOp {
    Add,
    Multiply,
    Transpose,
}

impl MatrixOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Self::Add),
            "multiply" => Some(Self::Multiply),
            "transpose" => Some(Self::Transpose),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Multiply => "multiply",
            Self::Transpose => "transpose",
        }
    }
}

/// Opera sobre un bloque de filas. `transpose` devuelve el bloque traspuesto (columnas × filas del bloque).
pub fn matrix_block(op: MatrixOp, rows: &Matrix, operand: Option<&Matrix>) -> Result<Matrix, EngineError> {
    let need = || EngineError::BadInput(format!("{} necesita operando", op.name()));
    match op {
        MatrixOp::Add => {
            let b = operand.ok_or_else(need)?;
            if b.len() != rows.len() {
                return Err(EngineError::BadInput("bloques de distinto tamaño".into()));
            }
            Ok(rows
                .iter()
                .zip(b)
                .map(|(ra, rb)| ra.iter().zip(rb).map(|(x, y)| x + y).collect())
                .collect())
        }
        MatrixOp::Multiply => {
            let b = operand.ok_or_else(need)?;
            let cols = b.first().map(|r| r.len()).unwrap_or(0);
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                if row.len() != b.len() {
                    return Err(EngineError::BadInput("dimensiones incompatibles".into()));
                }
                let mut acc = vec![0.0; cols];
                for (k, a) in row.iter().enumerate() {
                    for (j, slot) in acc.iter_mut().enumerate() {
                        *slot += a * b[k][j];
                    }
                }
                out.push(acc);
            }
            Ok(out)
        }
        MatrixOp::Transpose => {
            let cols = rows.first().map(|r| r.len()).unwrap_or(0);
            Ok((0..cols).map(|j| rows.iter().map(|r| r[j]).collect()).collect())
        }
    }
}

pub fn matrix_to_json(m: &Matrix) -> Value {
    Value::Array(
        m.iter()
            .map(|row| Value::Array(row.iter().map(|x| num(*x)).collect()))
            .collect(),
    )
}

pub fn matrix_from_json(v: &Value) -> Result<Matrix, EngineError> {
    v.as_array()
        .ok_or_else(|| EngineError::BadInput("se esperaba una matriz".into()))?
        .iter()
        .map(as_row)
        .collect()
}

/* =========================
   Modelos lineales (stubs deterministas de ML)
   ========================= */

fn model_params(params: &Value) -> Result<(Vec<f64>, f64), EngineError> {
    let weights = params
        .get("weights")
        .map(as_row)
        .transpose()?
        .ok_or_else(|| EngineError::BadInput("falta params.weights".into()))?;
    let bias = params.get("bias").and_then(|b| b.as_f64()).unwrap_or(0.0);
    Ok((weights, bias))
}

fn dot(w: &[f64], x: &[f64]) -> Result<f64, EngineError> {
    if w.len() != x.len() {
        return Err(EngineError::BadInput(format!(
            "fila de {} features para un modelo de {}",
            x.len(),
            w.len()
        )));
    }
    Ok(w.iter().zip(x).map(|(a, b)| a * b).sum())
}

pub fn linear_inference(params: &Value, rows: &[Record]) -> Result<Vec<Record>, EngineError> {
    let (w, b) = model_params(params)?;
    rows.iter()
        .map(|row| Ok(num(dot(&w, &as_row(row)?)? + b)))
        .collect()
}

/// Gradientes de MSE acumulados (sumas, no medias) para poder combinarlos por lotes.
pub fn linear_train_partial(params: &Value, samples: &[Record]) -> Result<Value, EngineError> {
    let (w, b) = model_params(params)?;
    let mut grad = vec![0.0; w.len()];
    let mut bias_grad = 0.0;
    let mut loss = 0.0;
    for s in samples {
        let x = s
            .get("features")
            .map(as_row)
            .transpose()?
            .ok_or_else(|| EngineError::BadInput("muestra sin features".into()))?;
        let y = s
            .get("label")
            .and_then(|l| l.as_f64())
            .ok_or_else(|| EngineError::BadInput("muestra sin label".into()))?;
        let err = dot(&w, &x)? + b - y;
        for (g, xi) in grad.iter_mut().zip(&x) {
            *g += 2.0 * err * xi;
        }
        bias_grad += 2.0 * err;
        loss += err * err;
    }
    Ok(json!({
        "gradient_sum": grad.iter().map(|g| num(*g)).collect::<Vec<_>>(),
        "bias_gradient_sum": num(bias_grad),
        "loss_sum": num(loss),
        "count": samples.len(),
    }))
}

/* =========================
   Handlers genéricos
   ========================= */

fn generic_handler(name: &str, input: &Value) -> Result<Value, EngineError> {
    match name {
        "echo" => Ok(input.clone()),
        "len" => match input {
            Value::Array(items) => Ok(json!(items.len())),
            Value::String(s) => Ok(json!(s.chars().count())),
            Value::Object(o) => Ok(json!(o.len())),
            _ => Err(EngineError::BadInput("len necesita lista, texto u objeto".into())),
        },
        "sum" => {
            let items = input
                .as_array()
                .ok_or_else(|| EngineError::BadInput("sum necesita una lista".into()))?;
            let values = items.iter().map(as_number).collect::<Result<Vec<_>, _>>()?;
            Ok(num(values.iter().sum()))
        }
        "sort" => {
            let items = input
                .as_array()
                .ok_or_else(|| EngineError::BadInput("sort necesita una lista".into()))?;
            let mut values = items.iter().map(as_number).collect::<Result<Vec<_>, _>>()?;
            values.sort_by(|a, b| a.total_cmp(b));
            Ok(Value::Array(values.into_iter().map(num).collect()))
        }
        other => Err(EngineError::UnknownHandler(other.to_string())),
    }
}

pub fn is_builtin_handler(name: &str) -> bool {
    matches!(
        name,
        "range_reduce"
            | "map"
            | "map_reduce"
            | "matrix"
            | "ml_inference"
            | "ml_train_step"
            | "echo"
            | "len"
            | "sum"
            | "sort"
    )
}

/* =========================
   Ejecución de un job
   ========================= */

fn unexpected(handler: &str, input: &JobInput) -> EngineError {
    EngineError::BadInput(format!("el handler {handler} no acepta entrada {}", input.kind()))
}

/// Ejecuta un job con los handlers incorporados y devuelve su salida parcial.
pub fn execute_builtin(code_ref: &CodeRef, input: &JobInput) -> Result<Value, EngineError> {
    let handler = code_ref.handler.as_str();
    let params = &code_ref.params;

    match (handler, input) {
        ("range_reduce", JobInput::Range { start, end, operation }) => {
            range_partial(*start, *end, *operation).to_json()
        }
        ("map", JobInput::Chunk { items, .. }) => {
            let f = MapFunction::from_params(params, "function")?;
            Ok(Value::Array(op_map(items, f)?))
        }
        ("map_reduce", JobInput::Chunk { items, .. }) => {
            let f = MapFunction::from_params(params, "map_function")?;
            let op_name = params
                .get("reduce_function")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EngineError::BadInput("falta params.reduce_function".into()))?;
            let op = ReduceOp::parse(op_name)
                .ok_or_else(|| EngineError::UnknownFunction(op_name.to_string()))?;
            let mapped = op_map(items, f)?;
            let values = mapped.iter().map(as_number).collect::<Result<Vec<_>, _>>()?;
            reduce_partial(op, values).to_json()
        }
        ("matrix", JobInput::MatrixBlock { rows, operand, .. }) => {
            let op_name = params.get("operation").and_then(|v| v.as_str()).unwrap_or("");
            let op = MatrixOp::parse(op_name)
                .ok_or_else(|| EngineError::UnknownFunction(op_name.to_string()))?;
            Ok(matrix_to_json(&matrix_block(op, rows, operand.as_ref())?))
        }
        ("ml_inference", JobInput::Chunk { items, .. }) => {
            Ok(Value::Array(linear_inference(params, items)?))
        }
        ("ml_train_step", JobInput::Chunk { items, .. }) => linear_train_partial(params, items),
        (name, JobInput::Whole { input }) => generic_handler(name, input),
        (name, other) if is_builtin_handler(name) => Err(unexpected(name, other)),
        (name, _) => Err(EngineError::UnknownHandler(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SandboxKind;

    fn code(handler: &str, params: Value) -> CodeRef {
        CodeRef {
            sandbox: SandboxKind::Builtin,
            handler: handler.into(),
            params,
        }
    }

    #[test]
    fn num_emite_enteros_si_el_valor_es_integral() {
        assert_eq!(num(3.0), json!(3));
        assert_eq!(num(2.5), json!(2.5));
    }

    #[test]
    fn increment_usa_param_y_por_defecto_uno() {
        let f = MapFunction::parse("increment", &Value::Null).unwrap();
        assert_eq!(f.apply(&json!(1)).unwrap(), json!(2));

        let f = MapFunction::parse("increment", &json!({"increment": 5})).unwrap();
        assert_eq!(f.apply(&json!(1)).unwrap(), json!(6));
    }

    #[test]
    fn op_map_aplica_funcion_a_cada_registro() {
        let out = op_map(&[json!(1), json!(2), json!(3)], MapFunction::Square).unwrap();
        assert_eq!(out, vec![json!(1), json!(4), json!(9)]);
    }

    #[test]
    fn map_sobre_texto_falla_con_bad_input() {
        let err = op_map(&[json!("a")], MapFunction::Double).unwrap_err();
        assert!(matches!(err, EngineError::BadInput(_)));
    }

    #[test]
    fn average_se_recombina_ponderando_por_count() {
        let a = reduce_partial(ReduceOp::Average, [1.0, 2.0, 3.0]);
        let b = reduce_partial(ReduceOp::Average, [10.0]);
        // media de medias sería 6.0; la correcta es 16/4
        assert_eq!(combine_partials(ReduceOp::Average, &[a, b]).unwrap(), json!(4));
    }

    #[test]
    fn min_max_count_product_combinan_bien() {
        let parts = [
            reduce_partial(ReduceOp::Min, [4.0, 2.0]),
            reduce_partial(ReduceOp::Min, [3.0]),
        ];
        assert_eq!(combine_partials(ReduceOp::Min, &parts).unwrap(), json!(2));

        let parts = [range_partial(1, 3, ReduceOp::Product), range_partial(3, 5, ReduceOp::Product)];
        assert_eq!(combine_partials(ReduceOp::Product, &parts).unwrap(), json!(24));

        let parts = [range_partial(0, 7, ReduceOp::Count), range_partial(7, 10, ReduceOp::Count)];
        assert_eq!(combine_partials(ReduceOp::Count, &parts).unwrap(), json!(10));
    }

    #[test]
    fn producto_desbordado_es_error_y_no_null() {
        let err = range_partial(1, 200, ReduceOp::Product).to_json().unwrap_err();
        assert!(matches!(err, EngineError::NonFinite(_)));

        // cada parte es finita, la combinación no
        let parts = [range_partial(1, 150, ReduceOp::Product), range_partial(150, 200, ReduceOp::Product)];
        assert!(parts[0].to_json().is_ok() && parts[1].to_json().is_ok());
        let err = combine_partials(ReduceOp::Product, &parts).unwrap_err();
        assert!(matches!(err, AggregationError::NonFinite(_)));
    }

    #[test]
    fn parcial_vacio_viaja_como_null_y_no_aporta() {
        let empty = reduce_partial(ReduceOp::Min, std::iter::empty());
        let wire = empty.to_json().unwrap();
        assert_eq!(wire, json!({"value": null, "count": 0}));
        let back = Partial::from_json(&wire).unwrap();

        let parts = [back, reduce_partial(ReduceOp::Min, [5.0, 3.0])];
        assert_eq!(combine_partials(ReduceOp::Min, &parts).unwrap(), json!(3));
        assert_eq!(combine_partials(ReduceOp::Max, &[back]).unwrap(), Value::Null);
        assert_eq!(combine_partials(ReduceOp::Sum, &[back]).unwrap(), json!(0));
    }

    #[test]
    fn matrix_block_multiplica_y_traspone() {
        let a = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let b = vec![vec![5.0, 6.0], vec![7.0, 8.0]];
        let prod = matrix_block(MatrixOp::Multiply, &a, Some(&b)).unwrap();
        assert_eq!(prod, vec![vec![19.0, 22.0], vec![43.0, 50.0]]);

        let t = matrix_block(MatrixOp::Transpose, &vec![vec![1.0, 2.0, 3.0]], None).unwrap();
        assert_eq!(t, vec![vec![1.0], vec![2.0], vec![3.0]]);
    }

    #[test]
    fn execute_builtin_map_reduce_devuelve_parcial() {
        let out = execute_builtin(
            &code("map_reduce", json!({"map_function": "square", "reduce_function": "sum"})),
            &JobInput::Chunk { offset: 0, items: vec![json!(1), json!(2), json!(3)] },
        )
        .unwrap();
        assert_eq!(out, json!({"value": 14, "count": 3}));
    }

    #[test]
    fn execute_builtin_rechaza_handler_desconocido() {
        let err = execute_builtin(
            &code("rm_rf", Value::Null),
            &JobInput::Whole { input: Value::Null },
        )
        .unwrap_err();
        assert_eq!(err, EngineError::UnknownHandler("rm_rf".into()));
    }

    #[test]
    fn train_partial_acumula_sumas_de_gradiente() {
        let out = linear_train_partial(
            &json!({"weights": [0.0], "bias": 0.0}),
            &[
                json!({"features": [1.0], "label": 1.0}),
                json!({"features": [2.0], "label": 2.0}),
            ],
        )
        .unwrap();
        // err = -y  →  grad = Σ 2·err·x = -2 - 8
        assert_eq!(out["gradient_sum"], json!([-10]));
        assert_eq!(out["bias_gradient_sum"], json!(-6));
        assert_eq!(out["loss_sum"], json!(5));
        assert_eq!(out["count"], json!(2));
    }

    #[test]
    fn generic_sort_ordena_numeros() {
        let out = execute_builtin(
            &code("sort", Value::Null),
            &JobInput::Whole { input: json!([3, 1, 2]) },
        )
        .unwrap();
        assert_eq!(out, json!([1, 2, 3]));
    }
}
