use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use common::engine::{execute_builtin, is_builtin_handler};
use common::error::EngineError;
use common::protocol::FailReason;
use common::{CodeRef, JobInput, SandboxKind};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox {} no disponible: {reason}", .kind.as_str())]
    Unavailable { kind: SandboxKind, reason: String },

    #[error("código inválido: {0}")]
    InvalidCode(String),

    #[error("tiempo agotado tras {0:?}")]
    Timeout(Duration),

    #[error("fallo de ejecución: {0}")]
    Execution(String),
}

impl SandboxError {
    /// Motivo de JOB_FAIL, o `None` si es un fallo del código que se informa como JOB_RESULT.
    pub fn fail_reason(&self) -> Option<FailReason> {
        match self {
            Self::Unavailable { .. } => Some(FailReason::SandboxUnavailable),
            Self::InvalidCode(_) => Some(FailReason::InvalidCode),
            Self::Timeout(_) => Some(FailReason::Timeout),
            Self::Execution(_) => None,
        }
    }
}

impl From<EngineError> for SandboxError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::UnknownHandler(_) | EngineError::UnsupportedSandbox(_) => Self::InvalidCode(e.to_string()),
            other => Self::Execution(other.to_string()),
        }
    }
}

/* =========================
   Límites
   ========================= */

pub const DEFAULT_CPU_SECS: u64 = 30;
pub const DEFAULT_MEMORY_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub cpu_secs: u64,
    pub memory_bytes: u64,
    pub file_size_bytes: u64,
    /// Tiempo de pared: lo que falta hasta el deadline del job.
    pub wall_time: Duration,
}

impl SandboxLimits {
    pub fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            cpu_secs: DEFAULT_CPU_SECS,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            file_size_bytes: DEFAULT_FILE_SIZE_BYTES,
            wall_time: (deadline - now).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

/* =========================
   Backends
   ========================= */

/// Un backend de ejecución aislada.
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> SandboxKind;

    /// `Err(Unavailable)` si el backend no puede correr este código en este host.
    fn check_available(&self, code_ref: &CodeRef) -> Result<(), SandboxError>;

    fn execute<'a>(
        &'a self,
        code_ref: &'a CodeRef,
        input: &'a JobInput,
        limits: &'a SandboxLimits,
    ) -> impl Future<Output = Result<Value, SandboxError>> + Send + 'a;
}

/// Handlers del engine, en un hilo de bloqueo.
pub struct BuiltinSandbox;

impl Sandbox for BuiltinSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Builtin
    }

    fn check_available(&self, _code_ref: &CodeRef) -> Result<(), SandboxError> {
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        code_ref: &'a CodeRef,
        input: &'a JobInput,
        limits: &'a SandboxLimits,
    ) -> impl Future<Output = Result<Value, SandboxError>> + Send + 'a {
        async move {
            if !is_builtin_handler(&code_ref.handler) {
                return Err(SandboxError::InvalidCode(format!(
                    "handler {} no es un handler incorporado",
                    code_ref.handler
                )));
            }
            let code_ref = code_ref.clone();
            let input = input.clone();
            let handle = tokio::task::spawn_blocking(move || execute_builtin(&code_ref, &input));
            match tokio::time::timeout(limits.wall_time, handle).await {
                Err(_) => Err(SandboxError::Timeout(limits.wall_time)),
                Ok(Err(e)) => Err(SandboxError::Execution(format!("join error: {e}"))),
                Ok(Ok(result)) => result.map_err(SandboxError::from),
            }
        }
    }
}

/// Corre `handler` como proceso: JSON por stdin, JSON por stdout, con rlimits y timeout de pared.
pub struct ProcessSandbox;

impl ProcessSandbox {
    fn stdin_payload(input: &JobInput) -> Result<Vec<u8>, SandboxError> {
        let value = match input {
            JobInput::Whole { input } => input.clone(),
            other => serde_json::to_value(other).map_err(|e| SandboxError::Execution(e.to_string()))?,
        };
        serde_json::to_vec(&value).map_err(|e| SandboxError::Execution(e.to_string()))
    }

    fn args(code_ref: &CodeRef) -> Vec<String> {
        code_ref
            .params
            .get("args")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }
}

impl Sandbox for ProcessSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Process
    }

    fn check_available(&self, code_ref: &CodeRef) -> Result<(), SandboxError> {
        let reason = if !cfg!(unix) || !Path::new("/bin/sh").exists() {
            "se necesita un host unix"
        } else if is_builtin_handler(&code_ref.handler) {
            "los handlers incorporados no son ejecutables"
        } else {
            return Ok(());
        };
        Err(SandboxError::Unavailable {
            kind: SandboxKind::Process,
            reason: reason.into(),
        })
    }

    fn execute<'a>(
        &'a self,
        code_ref: &'a CodeRef,
        input: &'a JobInput,
        limits: &'a SandboxLimits,
    ) -> impl Future<Output = Result<Value, SandboxError>> + Send + 'a {
        async move {
            let stdin = Self::stdin_payload(input)?;
            let mut cmd = Command::new(&code_ref.handler);
            cmd.args(Self::args(code_ref))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            attach_rlimits(&mut cmd, limits);

            let mut child = cmd.spawn().map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    SandboxError::InvalidCode(format!("no se pudo lanzar {}: {e}", code_ref.handler))
                }
                _ => SandboxError::Execution(format!("spawn: {e}")),
            })?;
            debug!("proceso {} lanzado (pid {:?})", code_ref.handler, child.id());

            if let Some(mut pipe) = child.stdin.take() {
                // un proceso que no lee su entrada no es un error
                if let Err(e) = pipe.write_all(&stdin).await {
                    debug!("stdin de {} cerrado antes de tiempo: {}", code_ref.handler, e);
                }
            }

            let output = match tokio::time::timeout(limits.wall_time, child.wait_with_output()).await {
                Err(_) => return Err(SandboxError::Timeout(limits.wall_time)),
                Ok(out) => out.map_err(|e| SandboxError::Execution(format!("wait: {e}")))?,
            };
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(SandboxError::Execution(format!(
                    "{} terminó con {}: {}",
                    code_ref.handler,
                    output.status,
                    stderr.trim()
                )));
            }
            serde_json::from_slice(&output.stdout)
                .map_err(|e| SandboxError::Execution(format!("salida no es JSON: {e}")))
        }
    }
}

/// Aplica los límites en el hijo, después del fork y antes del exec.
#[cfg(unix)]
fn attach_rlimits(cmd: &mut Command, limits: &SandboxLimits) {
    let cpu = limits.cpu_secs;
    let mem = limits.memory_bytes;
    let fsize = limits.file_size_bytes;
    unsafe {
        cmd.pre_exec(move || {
            // el tipo del recurso cambia entre plataformas; lo infiere setrlimit
            let apply = |resource, value: u64| {
                let rlim = libc::rlimit {
                    rlim_cur: value as libc::rlim_t,
                    rlim_max: value as libc::rlim_t,
                };
                if libc::setrlimit(resource, &rlim) != 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            };
            apply(libc::RLIMIT_CPU, cpu)?;
            apply(libc::RLIMIT_AS, mem)?;
            apply(libc::RLIMIT_FSIZE, fsize)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn attach_rlimits(_cmd: &mut Command, limits: &SandboxLimits) {
    warn!("rlimits pedidos en un host no unix, se ignoran: {:?}", limits);
}

/// Backend que este build no trae: siempre responde no disponible.
pub struct UnavailableSandbox {
    kind: SandboxKind,
    reason: &'static str,
}

impl Sandbox for UnavailableSandbox {
    fn kind(&self) -> SandboxKind {
        self.kind
    }

    fn check_available(&self, _code_ref: &CodeRef) -> Result<(), SandboxError> {
        Err(SandboxError::Unavailable {
            kind: self.kind,
            reason: self.reason.to_string(),
        })
    }

    fn execute<'a>(
        &'a self,
        code_ref: &'a CodeRef,
        _input: &'a JobInput,
        _limits: &'a SandboxLimits,
    ) -> impl Future<Output = Result<Value, SandboxError>> + Send + 'a {
        std::future::ready(self.check_available(code_ref).map(|_| Value::Null))
    }
}

/// Conjunto cerrado de backends, para poder guardarlos en la cadena.
pub enum Backend {
    Builtin(BuiltinSandbox),
    Process(ProcessSandbox),
    Unavailable(UnavailableSandbox),
}

impl Backend {
    pub fn for_kind(kind: SandboxKind) -> Self {
        match kind {
            SandboxKind::Builtin => Self::Builtin(BuiltinSandbox),
            SandboxKind::Process => Self::Process(ProcessSandbox),
            SandboxKind::Container => Self::Unavailable(UnavailableSandbox {
                kind,
                reason: "sin runtime de contenedores en este build",
            }),
            SandboxKind::Wasm => Self::Unavailable(UnavailableSandbox {
                kind,
                reason: "sin runtime wasm en este build",
            }),
        }
    }

    fn kind(&self) -> SandboxKind {
        match self {
            Self::Builtin(s) => s.kind(),
            Self::Process(s) => s.kind(),
            Self::Unavailable(s) => s.kind(),
        }
    }

    fn check_available(&self, code_ref: &CodeRef) -> Result<(), SandboxError> {
        match self {
            Self::Builtin(s) => s.check_available(code_ref),
            Self::Process(s) => s.check_available(code_ref),
            Self::Unavailable(s) => s.check_available(code_ref),
        }
    }

    async fn execute(&self, code_ref: &CodeRef, input: &JobInput, limits: &SandboxLimits) -> Result<Value, SandboxError> {
        match self {
            Self::Builtin(s) => s.execute(code_ref, input, limits).await,
            Self::Process(s) => s.execute(code_ref, input, limits).await,
            Self::Unavailable(s) => s.execute(code_ref, input, limits).await,
        }
    }
}

/* =========================
   Cadena de fallback
   ========================= */

pub const DEFAULT_CHAIN: &str = "container,wasm,process,builtin";

/// Backends en orden de preferencia. Un job arranca en el eslabón que pidió y baja
/// sólo si el backend no está disponible; los errores del código no caen al siguiente.
pub struct SandboxChain {
    backends: Vec<Backend>,
}

impl SandboxChain {
    pub fn from_names(names: &str) -> Self {
        let mut backends: Vec<Backend> = Vec::new();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match SandboxKind::parse(name) {
                Some(kind) if backends.iter().any(|b| b.kind() == kind) => {
                    warn!("sandbox {} repetido en la cadena, se ignora", name);
                }
                Some(kind) => backends.push(Backend::for_kind(kind)),
                None => warn!("sandbox desconocido en la cadena: {}", name),
            }
        }
        Self { backends }
    }

    pub fn kinds(&self) -> Vec<SandboxKind> {
        self.backends.iter().map(Backend::kind).collect()
    }

    /// Ejecuta y devuelve la salida junto con el backend que realmente corrió el job.
    pub async fn run(
        &self,
        code_ref: &CodeRef,
        input: &JobInput,
        limits: &SandboxLimits,
    ) -> Result<(Value, SandboxKind), SandboxError> {
        let requested = code_ref.sandbox;
        let Some(start) = self.backends.iter().position(|b| b.kind() == requested) else {
            return Err(SandboxError::Unavailable {
                kind: requested,
                reason: "no está en la cadena de este worker".into(),
            });
        };

        let mut tried = Vec::new();
        for backend in &self.backends[start..] {
            match backend.check_available(code_ref) {
                Ok(()) => {
                    if !tried.is_empty() {
                        warn!(
                            "sandbox {} no disponible, fallback a {} (probados: {:?})",
                            requested.as_str(),
                            backend.kind().as_str(),
                            tried
                        );
                    }
                    let output = backend.execute(code_ref, input, limits).await?;
                    return Ok((output, backend.kind()));
                }
                Err(e) => {
                    debug!("{}", e);
                    tried.push(backend.kind().as_str());
                }
            }
        }
        Err(SandboxError::Unavailable {
            kind: requested,
            reason: format!("ningún backend disponible (probados: {})", tried.join(", ")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::engine::ReduceOp;
    use serde_json::json;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            cpu_secs: 5,
            memory_bytes: 512 * 1024 * 1024,
            file_size_bytes: DEFAULT_FILE_SIZE_BYTES,
            wall_time: Duration::from_secs(5),
        }
    }

    fn code(sandbox: SandboxKind, handler: &str, params: Value) -> CodeRef {
        CodeRef {
            sandbox,
            handler: handler.into(),
            params,
        }
    }

    fn range() -> JobInput {
        JobInput::Range {
            start: 0,
            end: 10,
            operation: ReduceOp::Sum,
        }
    }

    #[test]
    fn limites_por_defecto_y_pared_hasta_el_deadline() {
        let now = Utc::now();
        let l = SandboxLimits::until(now + chrono::Duration::seconds(90), now);
        assert_eq!(l.cpu_secs, 30);
        assert_eq!(l.memory_bytes, 100 * 1024 * 1024);
        assert_eq!(l.file_size_bytes, 50 * 1024 * 1024);
        assert_eq!(l.wall_time, Duration::from_secs(90));
        assert_eq!(SandboxLimits::until(now, now + chrono::Duration::seconds(1)).wall_time, Duration::ZERO);
    }

    #[test]
    fn cadena_ignora_nombres_desconocidos_y_repetidos() {
        let chain = SandboxChain::from_names("wasm, gvisor,builtin,wasm");
        assert_eq!(chain.kinds(), vec![SandboxKind::Wasm, SandboxKind::Builtin]);
    }

    #[tokio::test]
    async fn builtin_ejecuta_con_el_engine() {
        let chain = SandboxChain::from_names(DEFAULT_CHAIN);
        let (out, kind) = chain
            .run(&code(SandboxKind::Builtin, "range_reduce", json!({})), &range(), &limits())
            .await
            .unwrap();
        assert_eq!(kind, SandboxKind::Builtin);
        assert_eq!(out, json!({"value": 45, "count": 10}));
    }

    #[tokio::test]
    async fn container_cae_a_builtin_y_lo_registra() {
        let chain = SandboxChain::from_names("container,wasm,builtin");
        let (_, kind) = chain
            .run(&code(SandboxKind::Container, "range_reduce", json!({})), &range(), &limits())
            .await
            .unwrap();
        assert_eq!(kind, SandboxKind::Builtin);
    }

    #[tokio::test]
    async fn sin_backend_disponible_es_sandbox_unavailable() {
        let chain = SandboxChain::from_names("container,wasm");
        let err = chain
            .run(&code(SandboxKind::Container, "range_reduce", json!({})), &range(), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.fail_reason(), Some(FailReason::SandboxUnavailable));

        let err = chain
            .run(&code(SandboxKind::Builtin, "range_reduce", json!({})), &range(), &limits())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable { kind: SandboxKind::Builtin, .. }));
    }

    #[tokio::test]
    async fn handler_desconocido_es_codigo_invalido() {
        let chain = SandboxChain::from_names("builtin");
        let err = chain
            .run(
                &code(SandboxKind::Builtin, "rm_rf", json!({})),
                &JobInput::Whole { input: json!(1) },
                &limits(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.fail_reason(), Some(FailReason::InvalidCode));
    }

    #[tokio::test]
    async fn error_del_engine_no_cae_al_siguiente_backend() {
        let chain = SandboxChain::from_names("builtin");
        let err = chain
            .run(
                &code(SandboxKind::Builtin, "sum", json!({})),
                &JobInput::Whole { input: json!("no es lista") },
                &limits(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution(_)));
        assert_eq!(err.fail_reason(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_pasa_json_por_stdin_y_stdout() {
        let chain = SandboxChain::from_names("process,builtin");
        let (out, kind) = chain
            .run(
                &code(SandboxKind::Process, "cat", json!({})),
                &JobInput::Whole { input: json!({"x": [1, 2, 3]}) },
                &limits(),
            )
            .await
            .unwrap();
        assert_eq!(kind, SandboxKind::Process);
        assert_eq!(out, json!({"x": [1, 2, 3]}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_que_excede_la_pared_es_timeout() {
        let chain = SandboxChain::from_names("process");
        let mut l = limits();
        l.wall_time = Duration::from_millis(200);
        let err = chain
            .run(
                &code(SandboxKind::Process, "sleep", json!({"args": ["5"]})),
                &JobInput::Whole { input: json!(null) },
                &l,
            )
            .await
            .unwrap_err();
        assert_eq!(err.fail_reason(), Some(FailReason::Timeout));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_inexistente_es_codigo_invalido() {
        let chain = SandboxChain::from_names("process");
        let err = chain
            .run(
                &code(SandboxKind::Process, "/no/existe/handler", json!({})),
                &JobInput::Whole { input: json!(1) },
                &limits(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.fail_reason(), Some(FailReason::InvalidCode));
    }
}
