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

//! The persistence layer. Two backends behind one trait: an embedded
//! directory-of-JSON-files store, and a remote tabular store with an
//! object bucket for large binaries. Both give the same guarantees:
//! writes are atomic-visible or fail, a successful save is durable before
//! return, reads see the last successful write from this process, and
//! concurrent writers to one key are serialized. No cross-record
//! transactions.

use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

use ember_common::ErrorKind;

pub use fs_adapter::FsAdapter;
pub use remote::{RemoteAdapter, RemoteConfig};

mod fs_adapter;
mod keys;
mod remote;

/// Adapter failures. The adapter never retries; the caller decides.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage conflict on {0}")]
    Conflict(String),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

impl StorageError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Unavailable(_) => ErrorKind::StorageUnavailable,
            StorageError::Conflict(_) => ErrorKind::StorageConflict,
            // A rejected key is a caller bug, not a store outage, but it
            // surfaces through the same channel.
            StorageError::InvalidKey(_) => ErrorKind::StorageUnavailable,
        }
    }
}

/// Uniform store for players, world state, permissions, and namespaced
/// daemon blobs. Implementations are safe for concurrent callers;
/// serialization is per-key, ordering across independent keys undefined.
///
/// Callers on the world thread must not block on this directly; the
/// daemon wraps calls in `spawn_blocking`.
pub trait PersistenceAdapter: Send + Sync {
    fn save_player(&self, name: &str, data: &Value) -> Result<(), StorageError>;
    fn load_player(&self, name: &str) -> Result<Option<Value>, StorageError>;
    fn player_exists(&self, name: &str) -> Result<bool, StorageError>;
    fn list_players(&self) -> Result<Vec<String>, StorageError>;
    fn delete_player(&self, name: &str) -> Result<bool, StorageError>;

    fn save_world(&self, state: &Value) -> Result<(), StorageError>;
    fn load_world(&self) -> Result<Option<Value>, StorageError>;

    fn save_permissions(&self, data: &Value) -> Result<(), StorageError>;
    fn load_permissions(&self) -> Result<Option<Value>, StorageError>;

    fn save_data(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StorageError>;
    fn load_data(&self, namespace: &str, key: &str) -> Result<Option<Value>, StorageError>;
    fn data_exists(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;
    fn delete_data(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;
    fn list_keys(&self, namespace: &str) -> Result<Vec<String>, StorageError>;
}

/// Which backend to construct at boot, from `PERSISTENCE_ADAPTER`.
#[derive(Clone, Debug)]
pub enum AdapterConfig {
    Filesystem { data_path: PathBuf },
    Remote(RemoteConfig),
}

pub fn mk_adapter(
    config: &AdapterConfig,
) -> Result<Box<dyn PersistenceAdapter>, StorageError> {
    match config {
        AdapterConfig::Filesystem { data_path } => {
            Ok(Box::new(FsAdapter::new(data_path.clone())?))
        }
        AdapterConfig::Remote(remote) => Ok(Box::new(RemoteAdapter::new(remote.clone())?)),
    }
}
