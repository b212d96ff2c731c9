use async_trait::async_trait;
use rhai::{Dynamic, EvalAltResult, Scope, AST};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use taskflow_core::state::DEV_KEY;
use taskflow_core::{Error, Result, ValueMap};
use taskflow_providers::{parse_json_reply, CompletionRequest, LanguageModel};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::bundle::Bundle;
use crate::capability::{CapabilityContext, CapabilityHandler, CapabilityMeta};
use crate::convert::{dynamic_to_json, json_to_dynamic};
use crate::engine::{describe_error, ScriptLimits};

/// Turns a bundle body into a runnable handler.
pub trait CapabilityProvider: Send + Sync {
    fn kind(&self) -> &'static str;
    fn accepts(&self, bundle: &Bundle) -> bool;
    fn load(&self, bundle: &Bundle, meta: &CapabilityMeta) -> Result<Arc<dyn CapabilityHandler>>;
}

/// The state map handed to bundle bodies, with the prompt template attached.
fn body_state(ctx: &CapabilityContext<'_>) -> Value {
    let mut state = ctx.state.to_value();
    if let (Some(prompt), Value::Object(map)) = (ctx.prompt, &mut state) {
        map.insert("__prompt".to_string(), Value::String(prompt.to_string()));
    }
    state
}

/// A body may hand back a replacement dev context under `__dev`.
fn apply_dev(ctx: &mut CapabilityContext<'_>, output: &mut ValueMap) {
    if let Some(Value::Object(dev)) = output.remove(DEV_KEY) {
        ctx.state.replace_dev(dev);
    }
}

// ---------------------------------------------------------------- Rhai

pub struct RhaiProvider {
    limits: ScriptLimits,
}

impl RhaiProvider {
    pub fn new(limits: ScriptLimits) -> Self {
        Self { limits }
    }
}

impl Default for RhaiProvider {
    fn default() -> Self {
        Self::new(ScriptLimits::default())
    }
}

impl CapabilityProvider for RhaiProvider {
    fn kind(&self) -> &'static str {
        "rhai"
    }

    fn accepts(&self, bundle: &Bundle) -> bool {
        bundle.body_file_name() == Some("run.rhai")
    }

    fn load(&self, bundle: &Bundle, meta: &CapabilityMeta) -> Result<Arc<dyn CapabilityHandler>> {
        let path = bundle
            .body
            .as_ref()
            .ok_or_else(|| Error::execution(&meta.name, "bundle has no body"))?;
        let source = std::fs::read_to_string(path)?;
        let ast = self
            .limits
            .compiler()
            .compile(&source)
            .map_err(|e| Error::execution(&meta.name, format!("Compilation error: {}", e)))?;

        let has_entry = ast
            .iter_functions()
            .any(|f| f.name == "run" && f.params.len() == 2);
        if !has_entry {
            return Err(Error::execution(
                &meta.name,
                "script does not define fn run(state, params)",
            ));
        }

        Ok(Arc::new(RhaiHandler {
            name: meta.name.clone(),
            ast: Arc::new(ast),
            limits: self.limits.clone(),
        }))
    }
}

struct RhaiHandler {
    name: String,
    ast: Arc<AST>,
    limits: ScriptLimits,
}

struct ScriptOutcome {
    output: ValueMap,
    logs: String,
}

#[async_trait]
impl CapabilityHandler for RhaiHandler {
    async fn run(&self, ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap> {
        let state = body_state(ctx);
        let template = ctx.request(String::new());
        let model = ctx.model.clone();
        let ast = self.ast.clone();
        let limits = self.limits.clone();
        let name = self.name.clone();
        let handle = Handle::current();

        let outcome = tokio::task::spawn_blocking(move || {
            execute_script(&name, &ast, &limits, state, params, model, template, handle)
        })
        .await
        .map_err(|e| Error::execution(&self.name, format!("script task failed: {}", e)))??;

        let ScriptOutcome { mut output, logs } = outcome;
        let logs = logs.trim_end();
        if !logs.is_empty() {
            ctx.log(logs);
        }
        apply_dev(ctx, &mut output);
        Ok(output)
    }
}

#[allow(clippy::too_many_arguments)]
fn execute_script(
    name: &str,
    ast: &AST,
    limits: &ScriptLimits,
    state: Value,
    params: ValueMap,
    model: Arc<dyn LanguageModel>,
    template: CompletionRequest,
    handle: Handle,
) -> Result<ScriptOutcome> {
    let mut engine = limits.runner();
    let started = std::time::Instant::now();
    let captured: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));

    {
        let buf = captured.clone();
        engine.on_print(move |s| {
            let mut out = buf.lock().unwrap_or_else(PoisonError::into_inner);
            out.push_str(s);
            out.push('\n');
        });
    }
    {
        let buf = captured.clone();
        engine.on_debug(move |s, _source, _pos| {
            let mut out = buf.lock().unwrap_or_else(PoisonError::into_inner);
            out.push_str(s);
            out.push('\n');
        });
    }

    register_host_functions(&mut engine, model, template, handle, captured.clone());

    let mut scope = Scope::new();
    let result = engine.call_fn::<Dynamic>(
        &mut scope,
        ast,
        "run",
        (json_to_dynamic(&state), json_to_dynamic(&Value::Object(params))),
    );

    debug!(
        capability = %name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Rhai capability finished"
    );

    let logs = captured
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    let value = result.map_err(|e| Error::execution(name, describe_error(&e)))?;
    let output = match dynamic_to_json(&value) {
        Value::Null => ValueMap::new(),
        Value::Object(map) => map,
        other => {
            return Err(Error::execution(
                name,
                format!("run must return a map or (), got {}", other),
            ))
        }
    };
    Ok(ScriptOutcome { output, logs })
}

fn register_host_functions(
    engine: &mut rhai::Engine,
    model: Arc<dyn LanguageModel>,
    template: CompletionRequest,
    handle: Handle,
    captured: Arc<Mutex<String>>,
) {
    // Host calls block this worker thread until the model answers.
    let complete = Arc::new(
        move |prompt: &str,
              system: Option<&str>,
              json_mode: bool|
              -> std::result::Result<String, Box<EvalAltResult>> {
            let mut request = template.clone();
            request.prompt = prompt.to_string();
            if let Some(system) = system {
                request.system = Some(system.to_string()).filter(|s| !s.trim().is_empty());
            }
            let reply = if json_mode {
                handle.block_on(model.generate_json(&request))
            } else {
                handle.block_on(model.generate_text(&request))
            };
            reply.map_err(|e| e.to_string().into())
        },
    );

    {
        let c = complete.clone();
        engine.register_fn("llm_text", move |prompt: &str| c(prompt, None, false));
    }
    {
        let c = complete.clone();
        engine.register_fn("llm_text", move |prompt: &str, system: &str| {
            c(prompt, Some(system), false)
        });
    }
    {
        let c = complete.clone();
        engine.register_fn(
            "llm_json",
            move |prompt: &str| -> std::result::Result<Dynamic, Box<EvalAltResult>> {
                let raw = c(prompt, None, true)?;
                parse_json_reply(&raw)
                    .map(|v| json_to_dynamic(&v))
                    .map_err(|e| e.to_string().into())
            },
        );
    }
    {
        let c = complete;
        engine.register_fn(
            "llm_json",
            move |prompt: &str, system: &str| -> std::result::Result<Dynamic, Box<EvalAltResult>> {
                let raw = c(prompt, Some(system), true)?;
                parse_json_reply(&raw)
                    .map(|v| json_to_dynamic(&v))
                    .map_err(|e| e.to_string().into())
            },
        );
    }

    {
        let buf = captured;
        engine.register_fn("log", move |msg: &str| {
            info!(source = "run.rhai", "{}", msg);
            let mut out = buf.lock().unwrap_or_else(PoisonError::into_inner);
            out.push_str(msg);
            out.push('\n');
        });
    }

    engine.register_fn("to_json", |val: Dynamic| -> String {
        serde_json::to_string(&dynamic_to_json(&val)).unwrap_or_default()
    });

    engine.register_fn("from_json", |s: &str| -> Dynamic {
        match serde_json::from_str::<Value>(s) {
            Ok(v) => json_to_dynamic(&v),
            Err(_) => Dynamic::UNIT,
        }
    });

    engine.register_fn("timestamp", || -> i64 { chrono::Utc::now().timestamp() });
}

// ---------------------------------------------------------------- Process

/// Runs `run`, `run.sh` or `run.py` as a child process. The child reads
/// `{state, params}` as JSON on stdin; its last stdout line is the JSON
/// output and earlier lines are logs.
pub struct ProcessProvider;

impl ProcessProvider {
    fn interpreter(file_name: &str) -> Option<&'static str> {
        match file_name {
            "run.py" => Some("python3"),
            "run.sh" => Some("bash"),
            _ => None,
        }
    }
}

impl CapabilityProvider for ProcessProvider {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn accepts(&self, bundle: &Bundle) -> bool {
        matches!(bundle.body_file_name(), Some("run" | "run.sh" | "run.py"))
    }

    fn load(&self, bundle: &Bundle, meta: &CapabilityMeta) -> Result<Arc<dyn CapabilityHandler>> {
        let body = bundle
            .body
            .clone()
            .ok_or_else(|| Error::execution(&meta.name, "bundle has no body"))?;
        let file_name = bundle.body_file_name().unwrap_or_default();

        let (program, args) = match Self::interpreter(file_name) {
            Some(interpreter) => {
                let resolved = which::which(interpreter).map_err(|_| {
                    Error::execution(&meta.name, format!("interpreter '{}' not found", interpreter))
                })?;
                (resolved, vec![body.to_string_lossy().to_string()])
            }
            None => (body, Vec::new()),
        };

        Ok(Arc::new(ProcessHandler {
            name: meta.name.clone(),
            program,
            args,
            working_dir: bundle.dir.clone(),
        }))
    }
}

struct ProcessHandler {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
}

/// Splits child stdout into (output, log lines).
fn split_process_output(stdout: &str) -> (ValueMap, Vec<String>) {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    if let Some((last, earlier)) = lines.split_last() {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(last.trim()) {
            return (map, earlier.iter().map(|l| l.to_string()).collect());
        }
        let mut map = ValueMap::new();
        map.insert("output".to_string(), Value::String(stdout.trim().to_string()));
        return (map, Vec::new());
    }
    (ValueMap::new(), Vec::new())
}

#[async_trait]
impl CapabilityHandler for ProcessHandler {
    async fn run(&self, ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap> {
        use tokio::process::Command;

        let input = json!({ "state": body_state(ctx), "params": params });
        let input_str = serde_json::to_string(&input)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::execution(
                    &self.name,
                    format!("Failed to spawn '{}': {}", self.program.display(), e),
                )
            })?;

        // Fed concurrently with the stdout drain; a body may never read its input.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let written = stdin.write_all(input_str.as_bytes()).await;
                drop(stdin);
                written
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::execution(&self.name, format!("Process failed: {}", e)))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(capability = %self.name, "Body exited without reading all of stdin");
                }
                Ok(Err(e)) => {
                    return Err(Error::execution(
                        &self.name,
                        format!("Failed to write to stdin: {}", e),
                    ))
                }
                Err(e) => {
                    return Err(Error::execution(
                        &self.name,
                        format!("stdin writer aborted: {}", e),
                    ))
                }
            }
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(Error::execution(
                &self.name,
                format!("exited with code {:?}: {}", output.status.code(), stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (mut result, logs) = split_process_output(&stdout);
        if !logs.is_empty() {
            ctx.log(logs.join("\n"));
        }
        if !stderr.trim().is_empty() {
            ctx.log(stderr.trim().to_string());
        }
        apply_dev(ctx, &mut result);
        Ok(result)
    }
}
