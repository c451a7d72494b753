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

//! The HTTP surface: `/ws`, liveness/readiness, the small read-only API
//! set, and static client assets.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use serde_json::{Value, json};
use tower_http::services::ServeDir;
use tracing::warn;

use crate::connections::ws::ws_handler;
use crate::state::AppState;

pub fn mk_routes(app: AppState, client_dir: PathBuf) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/api/config", get(config_handler))
        .route("/api/races", get(races_handler))
        .route("/api/announcements", get(announcements_handler))
        .fallback_service(ServeDir::new(client_dir))
        .with_state(app)
}

/// Always 200 while the process is up.
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// 200 only once daemon init has completed.
async fn ready_handler(State(app): State<AppState>) -> impl IntoResponse {
    if app.ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn config_handler(State(app): State<AppState>) -> Json<Value> {
    let public = blob(&app, "config", "public").await.unwrap_or(json!({}));
    Json(json!({
        "game_version": app.game_version,
        "config": public,
    }))
}

async fn races_handler(State(app): State<AppState>) -> Json<Value> {
    Json(blob(&app, "config", "races").await.unwrap_or(json!([])))
}

async fn announcements_handler(State(app): State<AppState>) -> Json<Value> {
    let adapter = app.adapter.clone();
    let result = tokio::task::spawn_blocking(move || {
        let keys = adapter.list_keys("announcements")?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = adapter.load_data("announcements", &key)? {
                entries.push(value);
            }
        }
        Ok::<_, ember_db::StorageError>(entries)
    })
    .await;

    match result {
        Ok(Ok(entries)) => Json(Value::Array(entries)),
        Ok(Err(e)) => {
            warn!(%e, "announcements unavailable");
            Json(json!([]))
        }
        Err(_) => Json(json!([])),
    }
}

async fn blob(app: &AppState, namespace: &str, key: &str) -> Option<Value> {
    let adapter = app.adapter.clone();
    let namespace = namespace.to_string();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || adapter.load_data(&namespace, &key))
        .await
        .ok()?
        .ok()?
}
