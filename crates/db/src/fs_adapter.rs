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

//! Embedded store: a directory tree of JSON documents, one per record.
//!
//! Layout:
//!   `<root>/players/<name_lower>.json`
//!   `<root>/world/state.json`
//!   `<root>/permissions/permissions.json`
//!   `<root>/<namespace>/<key>.json`
//!
//! Every write goes to `<path>.tmp`, is fsynced, then renamed over the
//! final path. A reader never observes a partial record.

use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

use crate::keys::{normalize_player_name, validate_key, validate_namespace};
use crate::{PersistenceAdapter, StorageError};

const WRITE_STRIPES: usize = 16;

pub struct FsAdapter {
    root: PathBuf,
    // Striped per-path write locks. Concurrent writers to the same key
    // serialize; independent keys usually proceed in parallel.
    stripes: [Mutex<()>; WRITE_STRIPES],
}

impl FsAdapter {
    pub fn new(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).map_err(io_err)?;
        Ok(Self {
            root,
            stripes: std::array::from_fn(|_| Mutex::new(())),
        })
    }

    fn stripe_for(&self, path: &Path) -> &Mutex<()> {
        let mut hasher = std::hash::DefaultHasher::new();
        path.hash(&mut hasher);
        &self.stripes[hasher.finish() as usize % WRITE_STRIPES]
    }

    fn write_document(&self, path: &Path, value: &Value) -> Result<(), StorageError> {
        let _guard = self.stripe_for(path).lock().unwrap();

        let Some(parent) = path.parent() else {
            return Err(StorageError::Unavailable(format!(
                "no parent directory for {}",
                path.display()
            )));
        };
        fs::create_dir_all(parent).map_err(io_err)?;

        // Temp file lives beside the target so the rename stays on one
        // filesystem and is atomic.
        let tmp_path = path.with_extension("json.tmp");
        let mut tmp = File::create(&tmp_path).map_err(io_err)?;
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        tmp.write_all(&body).map_err(io_err)?;
        tmp.sync_all().map_err(io_err)?;
        drop(tmp);

        if let Err(e) = fs::rename(&tmp_path, path) {
            // Leave no orphaned temp behind a failed rename.
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                warn!(?cleanup, path = %tmp_path.display(), "could not remove temp file");
            }
            return Err(io_err(e));
        }
        Ok(())
    }

    fn read_document(&self, path: &Path) -> Result<Option<Value>, StorageError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", path.display())))
    }

    fn remove_document(&self, path: &Path) -> Result<bool, StorageError> {
        let _guard = self.stripe_for(path).lock().unwrap();
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(e)),
        }
    }

    fn list_documents(&self, dir: &Path) -> Result<Vec<String>, StorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err(e)),
        };
        let mut keys = vec![];
        for entry in entries {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn player_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        let name = normalize_player_name(name)?;
        Ok(self.root.join("players").join(format!("{name}.json")))
    }

    fn data_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        Ok(self.root.join(namespace).join(format!("{key}.json")))
    }
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

impl PersistenceAdapter for FsAdapter {
    fn save_player(&self, name: &str, data: &Value) -> Result<(), StorageError> {
        self.write_document(&self.player_path(name)?, data)
    }

    fn load_player(&self, name: &str) -> Result<Option<Value>, StorageError> {
        self.read_document(&self.player_path(name)?)
    }

    fn player_exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.player_path(name)?.is_file())
    }

    fn list_players(&self) -> Result<Vec<String>, StorageError> {
        self.list_documents(&self.root.join("players"))
    }

    fn delete_player(&self, name: &str) -> Result<bool, StorageError> {
        self.remove_document(&self.player_path(name)?)
    }

    fn save_world(&self, state: &Value) -> Result<(), StorageError> {
        self.write_document(&self.root.join("world").join("state.json"), state)
    }

    fn load_world(&self) -> Result<Option<Value>, StorageError> {
        self.read_document(&self.root.join("world").join("state.json"))
    }

    fn save_permissions(&self, data: &Value) -> Result<(), StorageError> {
        self.write_document(
            &self.root.join("permissions").join("permissions.json"),
            data,
        )
    }

    fn load_permissions(&self) -> Result<Option<Value>, StorageError> {
        self.read_document(&self.root.join("permissions").join("permissions.json"))
    }

    fn save_data(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StorageError> {
        self.write_document(&self.data_path(namespace, key)?, value)
    }

    fn load_data(&self, namespace: &str, key: &str) -> Result<Option<Value>, StorageError> {
        self.read_document(&self.data_path(namespace, key)?)
    }

    fn data_exists(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.data_path(namespace, key)?.is_file())
    }

    fn delete_data(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        self.remove_document(&self.data_path(namespace, key)?)
    }

    fn list_keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        validate_namespace(namespace)?;
        self.list_documents(&self.root.join(namespace))
    }
}
