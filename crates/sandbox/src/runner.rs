// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Compiles and runs content scripts in a pooled isolate, with the host
//! bridge installed and a hard wall-clock timeout. User code is wrapped
//! in an async IIFE so `return` and `await` work at the top level; the
//! resulting promise is settled by pumping microtasks.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::convert::{json_to_v8, v8_to_json};
use crate::hostfn::HostRegistry;
use crate::pool::{IsolatePool, MemoryCappedIsolate, PoolError};
use crate::watchdog::register_execution;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("compile error at {line}:{column}: {message}")]
    Compile {
        message: String,
        line: usize,
        column: usize,
    },
    #[error("script exceeded wall-clock limit of {limit:?}")]
    Timeout { limit: Duration },
    #[error("script exceeded isolate memory cap of {limit_mb} MB")]
    Memory { limit_mb: usize },
    #[error("script error: {message}")]
    Runtime {
        message: String,
        stack: Option<String>,
    },
    #[error("isolate worker terminated")]
    WorkerLost,
    #[error("isolate pool has been disposed")]
    PoolDisposed,
}

impl ScriptError {
    /// The wire-facing error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptError::Compile { .. } => "compile_error",
            ScriptError::Timeout { .. } => "timeout_error",
            ScriptError::Memory { .. } => "memory_error",
            ScriptError::Runtime { .. } => "runtime_error",
            ScriptError::WorkerLost | ScriptError::PoolDisposed => "runtime_error",
        }
    }
}

#[derive(Debug)]
pub struct ScriptOutcome {
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<ScriptError>,
    pub execution_time: Duration,
}

impl ScriptOutcome {
    pub(crate) fn ok(value: Value, execution_time: Duration) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            execution_time,
        }
    }

    pub(crate) fn failed(error: ScriptError, execution_time: Duration) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error),
            execution_time,
        }
    }
}

/// Runs scripts against a pool with a fixed host-function registry.
pub struct ScriptRunner {
    pool: Arc<IsolatePool>,
    registry: Arc<HostRegistry>,
}

impl ScriptRunner {
    pub fn new(pool: Arc<IsolatePool>, registry: Arc<HostRegistry>) -> Self {
        Self { pool, registry }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<IsolatePool> {
        &self.pool
    }

    /// Compile and run `code` with a hard wall-clock timeout. Blocking;
    /// callers on async runtimes wrap this in `spawn_blocking`. The
    /// isolate is released on every path.
    pub fn run(&self, code: &str, timeout: Duration) -> ScriptOutcome {
        let mut slot = match self.pool.acquire() {
            Ok(slot) => slot,
            Err(PoolError::Disposed) => {
                return ScriptOutcome::failed(ScriptError::PoolDisposed, Duration::ZERO);
            }
        };
        slot.execute(code.to_string(), timeout, self.registry.clone())
    }

    /// Run a module-shaped script and return the value of one named
    /// export, awaited if it is (or returns) a promise. Function exports
    /// are applied to `args`.
    pub fn run_module(
        &self,
        code: &str,
        export: &str,
        args: &[Value],
        timeout: Duration,
    ) -> ScriptOutcome {
        let export_lit = serde_json::to_string(export).unwrap_or_else(|_| "\"\"".to_string());
        let args_lit =
            serde_json::to_string(args).unwrap_or_else(|_| "[]".to_string());
        let adapter = format!(
            r#"const __module = {{ exports: {{}} }};
(function (module, exports) {{
{code}
}})(__module, __module.exports);
const __target = __module.exports[{export_lit}];
if (__target === undefined) {{
    throw new Error("module has no export " + {export_lit});
}}
const __args = {args_lit};
return typeof __target === "function" ? await __target(...__args) : await __target;"#
        );
        self.run(&adapter, timeout)
    }
}

/// The per-execution body, run on the slot's executor thread.
pub(crate) fn execute_source(
    capped: &mut MemoryCappedIsolate,
    source: &str,
    timeout: Duration,
    registry: Arc<HostRegistry>,
    memory_limit_mb: usize,
) -> ScriptOutcome {
    let start = Instant::now();
    let isolate_handle = capped.isolate().thread_safe_handle();
    let (watchdog_guard, expired) = register_execution(isolate_handle.clone(), timeout);

    // The bridge callback reads the registry through a raw pointer for
    // the duration of this execution only.
    let registry_ptr = Arc::into_raw(registry.clone());

    // All scope work happens in one block so every borrow ends before
    // the isolate goes back to its slot.
    let result = (|| {
        let isolate = capped.isolate();
        let scope = &mut v8::HandleScope::new(isolate);
        let context = v8::Context::new(scope, Default::default());
        let scope = &mut v8::ContextScope::new(scope, context);

        install_host_bridge(scope, registry_ptr, &registry);

        // Wrap user code in an async function to support top-level
        // return and await.
        let wrapped_source = format!("(async function() {{\n{source}\n}})();");

        let tc_scope = &mut v8::TryCatch::new(scope);
        let Some(source_str) = v8::String::new(tc_scope, &wrapped_source) else {
            return Err(ScriptError::Runtime {
                message: "source is not representable".to_string(),
                stack: None,
            });
        };

        let Some(script) = v8::Script::compile(tc_scope, source_str, None) else {
            // Compilation failed; pull position info off the message.
            let message = tc_scope
                .exception()
                .and_then(|e| e.to_string(tc_scope))
                .map(|s| s.to_rust_string_lossy(tc_scope))
                .unwrap_or_else(|| "compilation failed".to_string());
            let (line, column) = match tc_scope.message() {
                Some(msg) => {
                    // The async wrapper adds one line above user code.
                    let line = msg.get_line_number(tc_scope).unwrap_or(1).saturating_sub(1);
                    (line, msg.get_start_column())
                }
                None => (0, 0),
            };
            return Err(ScriptError::Compile {
                message,
                line,
                column,
            });
        };

        let Some(run_value) = script.run(tc_scope) else {
            if expired.load(Ordering::SeqCst) {
                return Err(ScriptError::Timeout { limit: timeout });
            }
            let Some(exception) = tc_scope.exception() else {
                // Terminated with no exception pending: the watchdog or
                // the memory guard pulled the plug. The caller
                // distinguishes which.
                return Err(ScriptError::Timeout { limit: timeout });
            };
            let message = exception
                .to_string(tc_scope)
                .map(|s| s.to_rust_string_lossy(tc_scope))
                .unwrap_or_else(|| "execution failed".to_string());
            let stack = tc_scope
                .stack_trace()
                .and_then(|st| st.to_string(tc_scope))
                .map(|s| s.to_rust_string_lossy(tc_scope));
            return Err(ScriptError::Runtime { message, stack });
        };

        // Settle the async wrapper's promise. Microtasks only; there
        // are no timers in the sandbox, so a promise that microtasks
        // can't settle sits pending until the watchdog fires.
        tc_scope.perform_microtask_checkpoint();
        if !run_value.is_promise() {
            return v8_to_json(tc_scope, run_value).map_err(|e| ScriptError::Runtime {
                message: e.to_string(),
                stack: None,
            });
        }

        let promise = v8::Local::<v8::Promise>::try_from(run_value).map_err(|_| {
            ScriptError::Runtime {
                message: "async wrapper did not yield a promise".to_string(),
                stack: None,
            }
        })?;

        loop {
            match promise.state() {
                v8::PromiseState::Fulfilled => {
                    let result_val = promise.result(tc_scope);
                    return v8_to_json(tc_scope, result_val).map_err(|e| {
                        ScriptError::Runtime {
                            message: e.to_string(),
                            stack: None,
                        }
                    });
                }
                v8::PromiseState::Rejected => {
                    let rejection = promise.result(tc_scope);
                    return Err(extract_rejection(tc_scope, rejection));
                }
                v8::PromiseState::Pending => {
                    if expired.load(Ordering::SeqCst) || start.elapsed() >= timeout {
                        return Err(ScriptError::Timeout { limit: timeout });
                    }
                    std::thread::sleep(Duration::from_millis(1));
                    tc_scope.perform_microtask_checkpoint();
                }
            }
        }
    })();

    // Reclaim the registry reference handed to the bridge.
    // Safety: the pointer came from Arc::into_raw above and the bridge
    // cannot be called again once the scopes above are gone.
    unsafe { Arc::decrement_strong_count(registry_ptr) };
    drop(watchdog_guard);

    let elapsed = start.elapsed();
    match result {
        Ok(value) => ScriptOutcome::ok(value, elapsed),
        Err(err) => {
            // The memory guard also terminates execution, so check it
            // before trusting a timeout-shaped abort.
            if capped.memory_exceeded() {
                isolate_handle.cancel_terminate_execution();
                return ScriptOutcome::failed(
                    ScriptError::Memory {
                        limit_mb: memory_limit_mb,
                    },
                    elapsed,
                );
            }
            if matches!(err, ScriptError::Timeout { .. }) {
                // Terminated executions leave the isolate in terminating
                // state; clear it so the slot stays usable.
                isolate_handle.cancel_terminate_execution();
            }
            ScriptOutcome::failed(err, elapsed)
        }
    }
}

fn extract_rejection(
    scope: &mut v8::HandleScope,
    rejection: v8::Local<v8::Value>,
) -> ScriptError {
    let mut stack = None;
    let message = if rejection.is_object() {
        let obj = rejection.to_object(scope).unwrap_or_else(|| {
            // is_object() held, so this cannot fail; fall back anyway.
            v8::Object::new(scope)
        });
        if let Some(stack_key) = v8::String::new(scope, "stack") {
            stack = obj
                .get(scope, stack_key.into())
                .filter(|v| v.is_string())
                .map(|v| v.to_rust_string_lossy(scope));
        }
        let message_key = v8::String::new(scope, "message");
        message_key
            .and_then(|k| obj.get(scope, k.into()))
            .filter(|v| !v.is_undefined())
            .map(|v| v.to_rust_string_lossy(scope))
            .unwrap_or_else(|| rejection.to_rust_string_lossy(scope))
    } else {
        rejection.to_rust_string_lossy(scope)
    };
    ScriptError::Runtime { message, stack }
}

/// Install `__host_invoke` plus one named forwarder per registered host
/// function. Host functions are referenced, not copied: the callback
/// indirects through the registry pointer for this execution.
fn install_host_bridge(
    scope: &mut v8::ContextScope<v8::HandleScope>,
    registry_ptr: *const HostRegistry,
    registry: &HostRegistry,
) {
    if registry.is_empty() {
        return;
    }

    let external = v8::External::new(scope, registry_ptr as *mut std::ffi::c_void);
    let Some(invoke_fn) = v8::Function::builder(host_invoke_callback)
        .data(external.into())
        .build(scope)
    else {
        debug!("could not build host bridge function");
        return;
    };
    let global = scope.get_current_context().global(scope);
    let Some(invoke_key) = v8::String::new(scope, "__host_invoke") else {
        return;
    };
    global.set(scope, invoke_key.into(), invoke_fn.into());

    // Named forwarders so scripts call `file_read(...)`, not the bridge.
    let mut prelude = String::new();
    for name in registry.names() {
        let name_lit = serde_json::to_string(&name).unwrap_or_default();
        prelude.push_str(&format!(
            "globalThis[{name_lit}] = (...args) => __host_invoke({name_lit}, ...args);\n"
        ));
    }
    let Some(prelude_str) = v8::String::new(scope, &prelude) else {
        return;
    };
    if let Some(prelude_script) = v8::Script::compile(scope, prelude_str, None) {
        prelude_script.run(scope);
    }
}

fn host_invoke_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let data = args.data();
    let Ok(external) = v8::Local::<v8::External>::try_from(data) else {
        return;
    };
    // Safety: installed by install_host_bridge for this execution; the
    // Arc it points to is kept alive until the scopes are torn down.
    let registry = unsafe { &*(external.value() as *const HostRegistry) };

    let name = args.get(0).to_rust_string_lossy(scope);
    let mut call_args = Vec::with_capacity(args.length().saturating_sub(1) as usize);
    for i in 1..args.length() {
        match v8_to_json(scope, args.get(i)) {
            Ok(v) => call_args.push(v),
            Err(e) => {
                throw_error(scope, &format!("argument {i} to {name}: {e}"));
                return;
            }
        }
    }

    match registry.invoke(&name, &call_args) {
        Ok(value) => {
            let v = json_to_v8(scope, &value);
            rv.set(v);
        }
        Err(e) => throw_error(scope, &e.to_string()),
    }
}

fn throw_error(scope: &mut v8::HandleScope, message: &str) {
    let Some(msg) = v8::String::new(scope, message) else {
        return;
    };
    let exception = v8::Exception::error(scope, msg);
    scope.throw_exception(exception);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostfn::HostError;
    use serde_json::json;
    use serial_test::serial;

    fn runner_with(cap: usize, registry: HostRegistry) -> ScriptRunner {
        ScriptRunner::new(Arc::new(IsolatePool::new(cap, 32)), Arc::new(registry))
    }

    fn runner() -> ScriptRunner {
        runner_with(2, HostRegistry::new())
    }

    #[test]
    #[serial]
    fn run_returns_value() {
        let r = runner();
        let outcome = r.run("return 40 + 2;", Duration::from_secs(5));
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.value, Some(json!(42)));
    }

    #[test]
    #[serial]
    fn structured_values_cross_the_boundary() {
        let r = runner();
        let outcome = r.run(
            r#"return { name: "deer", tags: ["npc", "animal"], hp: 12.5, alive: true, gone: null };"#,
            Duration::from_secs(5),
        );
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(
            outcome.value,
            Some(json!({
                "name": "deer",
                "tags": ["npc", "animal"],
                "hp": 12.5,
                "alive": true,
                "gone": null,
            }))
        );
    }

    #[test]
    #[serial]
    fn syntax_error_reports_line() {
        let r = runner();
        let outcome = r.run("const x = ;\nreturn x;", Duration::from_secs(5));
        assert!(!outcome.success);
        let Some(ScriptError::Compile { line, .. }) = outcome.error else {
            panic!("expected compile error, got {:?}", outcome.error);
        };
        assert_eq!(line, 1);
    }

    #[test]
    #[serial]
    fn runtime_error_carries_message() {
        let r = runner();
        let outcome = r.run(
            "throw new Error('the bridge is out');",
            Duration::from_secs(5),
        );
        assert!(!outcome.success);
        let Some(ScriptError::Runtime { message, .. }) = outcome.error else {
            panic!("expected runtime error, got {:?}", outcome.error);
        };
        assert!(message.contains("the bridge is out"), "{message}");
    }

    #[test]
    #[serial]
    fn infinite_loop_times_out_and_releases() {
        let r = runner();
        let outcome = r.run("while (true) {}", Duration::from_millis(50));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind(), "timeout_error");
        assert!(outcome.execution_time >= Duration::from_millis(50));

        let stats = r.pool().stats();
        assert_eq!(stats.in_use, 0);

        // The slot survived the termination and still runs code.
        let outcome = r.run("return 'alive';", Duration::from_secs(5));
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.value, Some(json!("alive")));
    }

    #[test]
    #[serial]
    fn pending_forever_await_times_out() {
        let r = runner();
        let outcome = r.run(
            "await new Promise(() => {});",
            Duration::from_millis(50),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind(), "timeout_error");
    }

    #[test]
    #[serial]
    fn memory_hog_reports_memory_error() {
        let r = runner();
        let outcome = r.run(
            "const hog = []; while (true) { hog.push(new Array(65536).fill(1)); }",
            Duration::from_secs(30),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind(), "memory_error");

        // The poisoned heap was replaced; the pool still serves.
        let outcome = r.run("return 7;", Duration::from_secs(5));
        assert!(outcome.success, "{:?}", outcome.error);
    }

    #[test]
    #[serial]
    fn host_function_bridge_round_trip() {
        let mut registry = HostRegistry::new();
        registry.register("add", |args| {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        });
        registry.register("time", |_| Ok(json!(1700000000000u64)));
        let r = runner_with(2, registry);

        let outcome = r.run("return add(20, 22) + (time() > 0 ? 0 : 1);", Duration::from_secs(5));
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.value, Some(json!(42)));
    }

    #[test]
    #[serial]
    fn host_function_error_becomes_script_exception() {
        let mut registry = HostRegistry::new();
        registry.register("file_read", |_| {
            Err(HostError::PathDenied("/etc/shadow".to_string()))
        });
        let r = runner_with(2, registry);

        let outcome = r.run(
            r#"try { file_read("/etc/shadow"); return "no error"; } catch (e) { return "caught: " + e.message; }"#,
            Duration::from_secs(5),
        );
        assert!(outcome.success, "{:?}", outcome.error);
        let value = outcome.value.unwrap();
        let s = value.as_str().unwrap();
        assert!(s.starts_with("caught:"), "{s}");
        assert!(s.contains("outside the permitted roots"), "{s}");
    }

    #[test]
    #[serial]
    fn unregistered_host_function_is_invisible() {
        let r = runner();
        let outcome = r.run("return typeof file_write;", Duration::from_secs(5));
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.value, Some(json!("undefined")));
    }

    #[test]
    #[serial]
    fn run_module_awaits_named_export() {
        let r = runner();
        let code = r#"
module.exports.greet = async function (name) {
    return "hello, " + name;
};
module.exports.answer = 42;
"#;
        let outcome = r.run_module(code, "greet", &[json!("ember")], Duration::from_secs(5));
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.value, Some(json!("hello, ember")));

        let outcome = r.run_module(code, "answer", &[], Duration::from_secs(5));
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.value, Some(json!(42)));

        let outcome = r.run_module(code, "missing", &[], Duration::from_secs(5));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind(), "runtime_error");
    }

    #[test]
    #[serial]
    fn functions_do_not_cross_the_boundary() {
        let r = runner();
        let outcome = r.run("return function () {};", Duration::from_secs(5));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind(), "runtime_error");
    }
}
