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

//! Remote store: a PostgREST-style tabular API plus an object bucket for
//! large binaries. Well-known namespaces get dedicated tables; everything
//! else lands in a generic `game_state` table keyed `"namespace.key"`.
//! `images-*` namespaces route payload bytes to the object bucket with a
//! metadata row beside them.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::debug;

use crate::keys::{normalize_player_name, validate_key, validate_namespace};
use crate::{PersistenceAdapter, StorageError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Base URL of the store, e.g. `https://db.example.net`.
    pub url: String,
    /// Service key; sent as both `apikey` and bearer token.
    pub key: String,
    /// Bucket for `images-*` namespaces.
    pub image_bucket: String,
}

pub struct RemoteAdapter {
    config: RemoteConfig,
    client: Client,
}

/// Namespaces with a dedicated table. Everything else goes to
/// `game_state`. (`portraits` holds metadata rows; the image bytes
/// themselves travel through the `images-*` namespaces and the bucket.)
fn dedicated_table(namespace: &str) -> Option<&'static str> {
    match namespace {
        "bots" => Some("bots"),
        "emotes" => Some("emotes"),
        "lore" => Some("lore_entries"),
        "announcements" => Some("announcements"),
        "grudges" => Some("grudges"),
        "portraits" => Some("portraits"),
        _ => None,
    }
}

fn is_image_namespace(namespace: &str) -> bool {
    namespace.starts_with("images-")
}

impl RemoteAdapter {
    pub fn new(config: RemoteConfig) -> Result<Self, StorageError> {
        let mut headers = HeaderMap::new();
        let Ok(key_value) = HeaderValue::from_str(&config.key) else {
            return Err(StorageError::Unavailable(
                "remote store key is not a valid header value".to_string(),
            ));
        };
        headers.insert("apikey", key_value.clone());
        let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {}", config.key)) else {
            return Err(StorageError::Unavailable(
                "remote store key is not a valid header value".to_string(),
            ));
        };
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(net_err)?;
        Ok(Self { config, client })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.config.url.trim_end_matches('/'))
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{path}",
            self.config.url.trim_end_matches('/'),
            self.config.image_bucket
        )
    }

    /// Upsert one row. The table's primary key is the `key` column (or
    /// `name` for players), so merge-duplicates makes this an atomic
    /// replace on the server side.
    fn upsert(&self, table: &str, row: Value) -> Result<(), StorageError> {
        let resp = self
            .client
            .post(self.rest_url(table))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&json!([row]))
            .send()
            .map_err(net_err)?;
        check_status(table, resp.status())
    }

    fn select_payload(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> Result<Option<Value>, StorageError> {
        let resp = self
            .client
            .get(self.rest_url(table))
            .query(&[
                (key_column, format!("eq.{key}")),
                ("select", "payload".to_string()),
            ])
            .send()
            .map_err(net_err)?;
        check_status(table, resp.status())?;
        let mut rows: Vec<Value> = resp.json().map_err(net_err)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let row = rows.remove(0);
        match row {
            Value::Object(mut map) => Ok(map.remove("payload")),
            _ => Err(StorageError::Unavailable(format!(
                "malformed row from table {table}"
            ))),
        }
    }

    fn delete_row(&self, table: &str, key_column: &str, key: &str) -> Result<bool, StorageError> {
        let resp = self
            .client
            .delete(self.rest_url(table))
            .query(&[(key_column, format!("eq.{key}"))])
            .header("Prefer", "return=representation")
            .send()
            .map_err(net_err)?;
        check_status(table, resp.status())?;
        let rows: Vec<Value> = resp.json().map_err(net_err)?;
        Ok(!rows.is_empty())
    }

    fn list_column(&self, table: &str, key_column: &str) -> Result<Vec<String>, StorageError> {
        let resp = self
            .client
            .get(self.rest_url(table))
            .query(&[("select", key_column)])
            .send()
            .map_err(net_err)?;
        check_status(table, resp.status())?;
        let rows: Vec<Value> = resp.json().map_err(net_err)?;
        let mut keys: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get(key_column).and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Store an image payload in the bucket, then write the metadata row
    /// pointing at it. The blob body is the JSON payload's `data` field
    /// (base64), or the raw serialized payload when absent.
    fn save_image(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StorageError> {
        let object_path = format!("{namespace}/{key}");
        let body = serde_json::to_vec(value)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let resp = self
            .client
            .post(self.object_url(&object_path))
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(net_err)?;
        check_status(&object_path, resp.status())?;

        debug!(namespace, key, "image payload stored, writing metadata row");
        self.upsert(
            "object_images",
            json!({
                "key": format!("{namespace}.{key}"),
                "bucket_path": object_path,
                "saved_at": unix_ms(),
            }),
        )
    }

    fn load_image(&self, namespace: &str, key: &str) -> Result<Option<Value>, StorageError> {
        let object_path = format!("{namespace}/{key}");
        let resp = self
            .client
            .get(self.object_url(&object_path))
            .send()
            .map_err(net_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(&object_path, resp.status())?;
        resp.json().map(Some).map_err(net_err)
    }
}

fn net_err(e: reqwest::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

fn check_status(what: &str, status: StatusCode) -> Result<(), StorageError> {
    if status == StatusCode::CONFLICT {
        return Err(StorageError::Conflict(what.to_string()));
    }
    if !status.is_success() {
        return Err(StorageError::Unavailable(format!("{what}: HTTP {status}")));
    }
    Ok(())
}

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl PersistenceAdapter for RemoteAdapter {
    fn save_player(&self, name: &str, data: &Value) -> Result<(), StorageError> {
        let name = normalize_player_name(name)?;
        self.upsert(
            "players",
            json!({"name": name, "payload": data, "saved_at": unix_ms()}),
        )
    }

    fn load_player(&self, name: &str) -> Result<Option<Value>, StorageError> {
        let name = normalize_player_name(name)?;
        self.select_payload("players", "name", &name)
    }

    fn player_exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.load_player(name)?.is_some())
    }

    fn list_players(&self) -> Result<Vec<String>, StorageError> {
        self.list_column("players", "name")
    }

    fn delete_player(&self, name: &str) -> Result<bool, StorageError> {
        let name = normalize_player_name(name)?;
        self.delete_row("players", "name", &name)
    }

    fn save_world(&self, state: &Value) -> Result<(), StorageError> {
        self.upsert(
            "world_state",
            json!({"key": "world", "payload": state, "saved_at": unix_ms()}),
        )
    }

    fn load_world(&self) -> Result<Option<Value>, StorageError> {
        self.select_payload("world_state", "key", "world")
    }

    fn save_permissions(&self, data: &Value) -> Result<(), StorageError> {
        self.upsert(
            "permissions",
            json!({"key": "permissions", "payload": data, "saved_at": unix_ms()}),
        )
    }

    fn load_permissions(&self) -> Result<Option<Value>, StorageError> {
        self.select_payload("permissions", "key", "permissions")
    }

    fn save_data(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StorageError> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        if is_image_namespace(namespace) {
            return self.save_image(namespace, key, value);
        }
        match dedicated_table(namespace) {
            Some(table) => self.upsert(table, json!({"key": key, "payload": value})),
            None => self.upsert(
                "game_state",
                json!({"key": format!("{namespace}.{key}"), "payload": value}),
            ),
        }
    }

    fn load_data(&self, namespace: &str, key: &str) -> Result<Option<Value>, StorageError> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        if is_image_namespace(namespace) {
            return self.load_image(namespace, key);
        }
        match dedicated_table(namespace) {
            Some(table) => self.select_payload(table, "key", key),
            None => self.select_payload("game_state", "key", &format!("{namespace}.{key}")),
        }
    }

    fn data_exists(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.load_data(namespace, key)?.is_some())
    }

    fn delete_data(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        if is_image_namespace(namespace) {
            let object_path = format!("{namespace}/{key}");
            let resp = self
                .client
                .delete(self.object_url(&object_path))
                .send()
                .map_err(net_err)?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(false);
            }
            check_status(&object_path, resp.status())?;
            self.delete_row("object_images", "key", &format!("{namespace}.{key}"))?;
            return Ok(true);
        }
        match dedicated_table(namespace) {
            Some(table) => self.delete_row(table, "key", key),
            None => self.delete_row("game_state", "key", &format!("{namespace}.{key}")),
        }
    }

    fn list_keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        validate_namespace(namespace)?;
        if is_image_namespace(namespace) {
            let prefix = format!("{namespace}.");
            let keys = self.list_column("object_images", "key")?;
            return Ok(keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                .collect());
        }
        match dedicated_table(namespace) {
            Some(table) => self.list_column(table, "key"),
            None => {
                let prefix = format!("{namespace}.");
                let keys = self.list_column("game_state", "key")?;
                Ok(keys
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                    .collect())
            }
        }
    }
}
