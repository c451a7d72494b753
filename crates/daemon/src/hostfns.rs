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

//! The standard host-function set installed into content sandboxes.
//! This is the entire surface scripts get: declared file roots, the
//! world queries, AI generation, time, and logging. No sockets, no
//! process spawn, no ambient filesystem.
//!
//! World-touching functions block on a reply from the world queue. The
//! world never waits on a script synchronously, so this cannot deadlock;
//! it just costs the script its place in line.

use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use ember_common::ObjId;
use ember_kernel::WorldHandle;
use ember_sandbox::{HostError, HostRegistry};

use crate::connections::ConnectionRegistry;

/// File roots scripts may read and write beneath, relative to the data
/// directory.
const FILE_ROOTS: &[&str] = &["scripts", "assets"];

pub fn standard_registry(
    world: WorldHandle,
    connections: ConnectionRegistry,
    data_path: PathBuf,
    ai_api_key: Option<String>,
) -> HostRegistry {
    let mut registry = HostRegistry::new();

    {
        let data_path = data_path.clone();
        registry.register("file_read", move |args| {
            let path = str_arg(args, 0, "path")?;
            let resolved = resolve_path(&data_path, path)?;
            std::fs::read_to_string(&resolved)
                .map(Value::String)
                .map_err(|e| HostError::Failed(format!("read {path:?}: {e}")))
        });
    }

    {
        let data_path = data_path.clone();
        registry.register("file_write", move |args| {
            let path = str_arg(args, 0, "path")?;
            let content = str_arg(args, 1, "content")?;
            let resolved = resolve_path(&data_path, path)?;
            if let Some(parent) = resolved.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| HostError::Failed(format!("write {path:?}: {e}")))?;
            }
            std::fs::write(&resolved, content)
                .map(|()| Value::Bool(true))
                .map_err(|e| HostError::Failed(format!("write {path:?}: {e}")))
        });
    }

    {
        let world = world.clone();
        registry.register("find_object", move |args| {
            let path = str_arg(args, 0, "path")?;
            let rx = world
                .find_object(path.to_string())
                .map_err(|e| HostError::Failed(e.to_string()))?;
            let found = rx
                .recv()
                .map_err(|_| HostError::Failed("world did not reply".to_string()))?;
            Ok(match found {
                Some(id) => json!(id),
                None => Value::Null,
            })
        });
    }

    {
        let world = world.clone();
        registry.register("clone_object", move |args| {
            let path = str_arg(args, 0, "path")?;
            let rx = world
                .clone_object(path.to_string())
                .map_err(|e| HostError::Failed(e.to_string()))?;
            let cloned = rx
                .recv()
                .map_err(|_| HostError::Failed("world did not reply".to_string()))?;
            cloned
                .map(|id| json!(id))
                .map_err(|e| HostError::Failed(e.to_string()))
        });
    }

    {
        let world = world.clone();
        registry.register("destruct", move |args| {
            let id: ObjId = args
                .first()
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .ok_or_else(|| HostError::Failed("destruct expects an object id".to_string()))?;
            let rx = world
                .destruct(id)
                .map_err(|e| HostError::Failed(e.to_string()))?;
            let destroyed = rx
                .recv()
                .map_err(|_| HostError::Failed("world did not reply".to_string()))?;
            Ok(Value::Bool(destroyed))
        });
    }

    // Backs who-style content commands: how long a player has been on
    // and how long since they last typed.
    registry.register("connection_seconds", move |args| {
        let player: ObjId = args
            .first()
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| {
                HostError::Failed("connection_seconds expects a player id".to_string())
            })?;
        Ok(match connections.seconds_for_player(player) {
            Some((connected, idle)) => json!({
                "connected_seconds": connected,
                "idle_seconds": idle,
            }),
            None => Value::Null,
        })
    });

    registry.register("ai_generate", move |args| {
        let prompt = str_arg(args, 0, "prompt")?;
        let system = args.get(1).and_then(Value::as_str);
        let Some(key) = ai_api_key.as_deref() else {
            return Err(HostError::Failed("AI generation is not configured".to_string()));
        };
        // Isolate workers are plain threads, so the blocking client is
        // safe here; the script's own wall-clock budget bounds the wait.
        ai_generate_blocking(key, prompt, system).map(Value::String)
    });

    registry.register("time", |_args| {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(json!(ms))
    });

    registry.register("log", |args| {
        let level = args.first().and_then(Value::as_str).unwrap_or("info");
        let msg = args.get(1).and_then(Value::as_str).unwrap_or_default();
        match level {
            "debug" => debug!(target: "script", "{msg}"),
            "warn" => warn!(target: "script", "{msg}"),
            "error" => error!(target: "script", "{msg}"),
            _ => info!(target: "script", "{msg}"),
        }
        Ok(Value::Null)
    });

    registry
}

/// Blocking AI call for scripts. V8 termination cannot interrupt a host
/// function, so the request carries its own timeout.
fn ai_generate_blocking(
    api_key: &str,
    prompt: &str,
    system: Option<&str>,
) -> Result<String, HostError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(20))
        .build()
        .map_err(|e| HostError::Failed(e.to_string()))?;
    let mut body = json!({
        "model": "claude-3-5-haiku-latest",
        "max_tokens": 1024,
        "messages": [{"role": "user", "content": prompt}],
    });
    if let Some(system) = system {
        body["system"] = Value::String(system.to_string());
    }
    let response = client
        .post("https://api.anthropic.com/v1/messages")
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .send()
        .map_err(|e| HostError::Failed(format!("AI request failed: {e}")))?;
    if !response.status().is_success() {
        return Err(HostError::Failed(format!(
            "AI request failed: HTTP {}",
            response.status()
        )));
    }
    let body: Value = response
        .json()
        .map_err(|e| HostError::Failed(format!("AI response unreadable: {e}")))?;
    Ok(body["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string())
}

fn str_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str, HostError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| HostError::Failed(format!("argument {name:?} must be a string")))
}

/// Normalize a script-supplied path and require it to sit under one of
/// the declared roots. Lexical only: no link chasing, no absolute paths,
/// no parent traversal.
fn resolve_path(data_path: &Path, path: &str) -> Result<PathBuf, HostError> {
    let candidate = Path::new(path);
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => return Err(HostError::PathDenied(path.to_string())),
        }
    }
    let permitted = FILE_ROOTS
        .iter()
        .any(|root| normalized.starts_with(root));
    if !permitted {
        return Err(HostError::PathDenied(path.to_string()));
    }
    Ok(data_path.join(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_outside_roots_denied() {
        let data = Path::new("/srv/ember/data");
        assert!(resolve_path(data, "scripts/npcs/deer.js").is_ok());
        assert!(resolve_path(data, "assets/map.json").is_ok());
        assert!(resolve_path(data, "./scripts/a.js").is_ok());

        assert!(matches!(
            resolve_path(data, "/etc/passwd"),
            Err(HostError::PathDenied(_))
        ));
        assert!(matches!(
            resolve_path(data, "scripts/../players/alice.json"),
            Err(HostError::PathDenied(_))
        ));
        assert!(matches!(
            resolve_path(data, "players/alice.json"),
            Err(HostError::PathDenied(_))
        ));
    }
}
