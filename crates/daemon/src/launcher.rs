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

//! The tokio-backed executor for world suspensions. The world thread
//! hands an operation and a token over; completion posts back through
//! the handle and never blocks the world loop. Scripts and persistence
//! run on the blocking pool; AI generation is a plain async HTTP call
//! with a per-operation timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

use ember_db::PersistenceAdapter;
use ember_kernel::dispatch::AsyncOp;
use ember_kernel::{AsyncLauncher, WorldHandle};
use ember_sandbox::ScriptRunner;

const AI_TIMEOUT: Duration = Duration::from_secs(30);
const AI_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const AI_MODEL: &str = "claude-3-5-haiku-latest";

pub struct TokioLauncher {
    tokio: tokio::runtime::Handle,
    runner: Arc<ScriptRunner>,
    adapter: Arc<dyn PersistenceAdapter>,
    http: reqwest::Client,
    ai_api_key: Option<String>,
    script_timeout: Duration,
    scripts_root: PathBuf,
}

impl TokioLauncher {
    pub fn new(
        tokio: tokio::runtime::Handle,
        runner: Arc<ScriptRunner>,
        adapter: Arc<dyn PersistenceAdapter>,
        ai_api_key: Option<String>,
        script_timeout: Duration,
        scripts_root: PathBuf,
    ) -> Self {
        Self {
            tokio,
            runner,
            adapter,
            http: reqwest::Client::new(),
            ai_api_key,
            script_timeout,
            scripts_root,
        }
    }
}

impl AsyncLauncher for TokioLauncher {
    fn launch(&self, token: u64, op: AsyncOp, handle: WorldHandle) {
        debug!(token, ?op, "launching async operation");
        match op {
            AsyncOp::RunScript {
                module,
                export,
                args,
            } => {
                let runner = self.runner.clone();
                let timeout = self.script_timeout;
                let root = self.scripts_root.clone();
                self.tokio.spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        run_script(&runner, &root, &module, &export, &args, timeout)
                    })
                    .await
                    .unwrap_or_else(|_| Err("script executor panicked".to_string()));
                    handle.async_complete(token, result);
                });
            }
            AsyncOp::SavePlayer { name, data } => {
                let adapter = self.adapter.clone();
                self.tokio.spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        adapter
                            .save_player(&name, &data)
                            .map(|()| Value::Bool(true))
                            .map_err(|e| e.to_string())
                    })
                    .await
                    .unwrap_or_else(|_| Err("persistence task panicked".to_string()));
                    handle.async_complete(token, result);
                });
            }
            AsyncOp::SaveData {
                namespace,
                key,
                value,
            } => {
                let adapter = self.adapter.clone();
                self.tokio.spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        adapter
                            .save_data(&namespace, &key, &value)
                            .map(|()| Value::Bool(true))
                            .map_err(|e| e.to_string())
                    })
                    .await
                    .unwrap_or_else(|_| Err("persistence task panicked".to_string()));
                    handle.async_complete(token, result);
                });
            }
            AsyncOp::LoadData { namespace, key } => {
                let adapter = self.adapter.clone();
                self.tokio.spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        adapter
                            .load_data(&namespace, &key)
                            .map(|v| v.unwrap_or(Value::Null))
                            .map_err(|e| e.to_string())
                    })
                    .await
                    .unwrap_or_else(|_| Err("persistence task panicked".to_string()));
                    handle.async_complete(token, result);
                });
            }
            AsyncOp::AiGenerate { prompt, system } => {
                let http = self.http.clone();
                let key = self.ai_api_key.clone();
                self.tokio.spawn(async move {
                    let result = ai_generate(&http, key.as_deref(), &prompt, system.as_deref())
                        .await;
                    handle.async_complete(token, result);
                });
            }
            AsyncOp::AwaitLine { .. } => {
                // The kernel routes awaited input through the handler
                // stack; it never reaches the launcher.
                handle.async_complete(token, Err("await-line cannot be launched".to_string()));
            }
        }
    }
}

fn run_script(
    runner: &ScriptRunner,
    root: &Path,
    module: &str,
    export: &str,
    args: &[Value],
    timeout: Duration,
) -> Result<Value, String> {
    let source = load_module(root, module)?;
    let outcome = runner.run_module(&source, export, args, timeout);
    if outcome.success {
        Ok(outcome.value.unwrap_or(Value::Null))
    } else {
        match outcome.error {
            Some(e) => Err(format!("{}: {e}", e.kind())),
            None => Err("script failed".to_string()),
        }
    }
}

/// Resolve a module path under the scripts root. Components are
/// restricted to a safe alphabet; there is no way to name a file
/// outside the root.
fn load_module(root: &Path, module: &str) -> Result<String, String> {
    if module.is_empty()
        || module.split('/').any(|part| {
            part.is_empty()
                || part.starts_with('.')
                || !part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        })
    {
        return Err(format!("invalid module path {module:?}"));
    }
    let path = root.join(format!("{module}.js"));
    std::fs::read_to_string(&path).map_err(|e| format!("module {module:?}: {e}"))
}

async fn ai_generate(
    http: &reqwest::Client,
    api_key: Option<&str>,
    prompt: &str,
    system: Option<&str>,
) -> Result<Value, String> {
    let Some(api_key) = api_key else {
        return Err("AI generation is not configured".to_string());
    };
    let mut body = json!({
        "model": AI_MODEL,
        "max_tokens": 1024,
        "messages": [{"role": "user", "content": prompt}],
    });
    if let Some(system) = system {
        body["system"] = Value::String(system.to_string());
    }

    let response = http
        .post(AI_ENDPOINT)
        .timeout(AI_TIMEOUT)
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("AI request failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("AI request failed: HTTP {}", response.status()));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| format!("AI response unreadable: {e}"))?;
    let text = body["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    Ok(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_paths_are_rooted() {
        let root = Path::new("/srv/ember/scripts");
        assert!(load_module(root, "../../../etc/passwd").is_err());
        assert!(load_module(root, "npcs/../../escape").is_err());
        assert!(load_module(root, ".hidden").is_err());
        assert!(load_module(root, "").is_err());
        // A valid path may still fail to read; it must not be rejected
        // for shape.
        let err = load_module(root, "npcs/deer").unwrap_err();
        assert!(err.contains("npcs/deer"), "{err}");
        assert!(!err.contains("invalid module path"), "{err}");
    }
}
