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

//! Process-wide singletons with explicit, ordered lifecycles. The
//! registry is the only path to a daemon: declared registration order is
//! init order, shutdown serializes in reverse, and duplicate ids are
//! refused at registration, not discovered at lookup.

use std::any::Any;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use ember_db::PersistenceAdapter;

pub mod core;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon {0:?} is already registered")]
    DuplicateId(String),
    #[error("daemon {id:?} failed to restore: {cause}")]
    RestoreFailed { id: String, cause: String },
    #[error("daemon state for {0:?} could not be serialized")]
    SerializeFailed(String),
    #[error("storage: {0}")]
    Storage(#[from] ember_db::StorageError),
}

/// What to do when a daemon's persisted state won't restore.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestorePolicy {
    /// Surface the error and abort boot. For daemons whose state the
    /// world cannot run without (permissions).
    AbortBoot,
    /// Log, reset to a blank state, continue boot.
    ResetBlank,
}

pub trait Daemon: Send {
    /// Stable id; also the persistence namespace for its state blob.
    fn id(&self) -> &'static str;

    fn restore_policy(&self) -> RestorePolicy {
        RestorePolicy::ResetBlank
    }

    /// Rebuild from a previously serialized state.
    fn restore(&mut self, data: Value) -> Result<(), DaemonError>;

    /// Snapshot current state for persistence.
    fn serialize(&self) -> Value;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Default)]
pub struct DaemonRegistry {
    daemons: IndexMap<&'static str, Box<dyn Daemon>>,
    ready: bool,
}

impl DaemonRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry with the core daemon set in its declared boot
    /// order.
    pub fn with_core_daemons() -> Self {
        let mut registry = Self::new();
        for daemon in core::core_daemons() {
            registry
                .register(daemon)
                .expect("core daemon set contains a duplicate id");
        }
        registry
    }

    /// Register a daemon. Order of registration is init order.
    pub fn register(&mut self, daemon: Box<dyn Daemon>) -> Result<(), DaemonError> {
        let id = daemon.id();
        if self.daemons.contains_key(id) {
            return Err(DaemonError::DuplicateId(id.to_string()));
        }
        self.daemons.insert(id, daemon);
        Ok(())
    }

    /// Restore every daemon from the adapter, in registration order.
    /// Runs after persistence init and before the network opens.
    pub fn init(&mut self, adapter: &dyn PersistenceAdapter) -> Result<(), DaemonError> {
        for (id, daemon) in &mut self.daemons {
            let state = adapter.load_data(id, "state")?;
            match state {
                None => {
                    info!(daemon = id, "no saved state, starting blank");
                }
                Some(state) => {
                    if let Err(e) = daemon.restore(state) {
                        match daemon.restore_policy() {
                            RestorePolicy::AbortBoot => {
                                error!(daemon = id, ?e, "restore failed, aborting boot");
                                return Err(DaemonError::RestoreFailed {
                                    id: id.to_string(),
                                    cause: e.to_string(),
                                });
                            }
                            RestorePolicy::ResetBlank => {
                                warn!(daemon = id, ?e, "restore failed, resetting to blank state");
                            }
                        }
                    }
                }
            }
        }
        self.ready = true;
        info!(count = self.daemons.len(), "daemons ready");
        Ok(())
    }

    /// Serialize every daemon to the adapter, in reverse registration
    /// order. Failures are logged and do not stop the sweep: shutdown
    /// saves as much as it can.
    pub fn save_all(&self, adapter: &dyn PersistenceAdapter) {
        for (id, daemon) in self.daemons.iter().rev() {
            let state = daemon.serialize();
            if let Err(e) = adapter.save_data(id, "state", &state) {
                error!(daemon = id, ?e, "could not persist daemon state");
            }
        }
    }

    /// Serialize every daemon in reverse registration order, for a
    /// shutdown path that persists off the world thread.
    #[must_use]
    pub fn serialize_all(&self) -> Vec<(String, Value)> {
        self.daemons
            .iter()
            .rev()
            .map(|(id, daemon)| (id.to_string(), daemon.serialize()))
            .collect()
    }

    /// True once init has completed; gates the `/ready` endpoint.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub fn ids(&self) -> Vec<&'static str> {
        self.daemons.keys().copied().collect()
    }

    #[must_use]
    pub fn get<T: Daemon + 'static>(&self) -> Option<&T> {
        self.daemons
            .values()
            .find_map(|d| d.as_any().downcast_ref::<T>())
    }

    #[must_use]
    pub fn get_mut<T: Daemon + 'static>(&mut self) -> Option<&mut T> {
        self.daemons
            .values_mut()
            .find_map(|d| d.as_any_mut().downcast_mut::<T>())
    }

    #[must_use]
    pub fn get_by_id(&self, id: &str) -> Option<&dyn Daemon> {
        self.daemons.get(id).map(Box::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::core::{CombatDaemon, LoreDaemon, PermissionsDaemon};
    use super::*;
    use ember_db::FsAdapter;
    use serde_json::json;

    fn adapter() -> (tempfile::TempDir, FsAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FsAdapter::new(dir.path().to_path_buf()).unwrap();
        (dir, adapter)
    }

    #[test]
    fn duplicate_ids_refused() {
        let mut registry = DaemonRegistry::new();
        registry.register(Box::new(CombatDaemon::default())).unwrap();
        let err = registry
            .register(Box::new(CombatDaemon::default()))
            .unwrap_err();
        assert!(matches!(err, DaemonError::DuplicateId(_)));
    }

    #[test]
    fn core_boot_order_is_declared_order() {
        let registry = DaemonRegistry::with_core_daemons();
        assert_eq!(
            registry.ids(),
            vec![
                "config",
                "permissions",
                "channels",
                "map",
                "quest",
                "combat",
                "pet",
                "lore",
                "prompts"
            ]
        );
    }

    #[test]
    fn init_then_save_round_trips_state() {
        let (_dir, adapter) = adapter();
        let mut registry = DaemonRegistry::with_core_daemons();
        registry.init(&adapter).unwrap();
        assert!(registry.is_ready());

        registry
            .get_mut::<LoreDaemon>()
            .unwrap()
            .add_entry("sundering", json!({"title": "The Sundering"}));
        registry.save_all(&adapter);

        let mut fresh = DaemonRegistry::with_core_daemons();
        fresh.init(&adapter).unwrap();
        let lore = fresh.get::<LoreDaemon>().unwrap();
        assert!(lore.entry("sundering").is_some());
    }

    #[test]
    fn abort_boot_policy_fails_init_on_bad_state() {
        let (_dir, adapter) = adapter();
        // Permissions daemon declares AbortBoot; poison its state.
        adapter
            .save_data("permissions", "state", &json!("not an object"))
            .unwrap();

        let mut registry = DaemonRegistry::with_core_daemons();
        let err = registry.init(&adapter).unwrap_err();
        assert!(matches!(err, DaemonError::RestoreFailed { id, .. } if id == "permissions"));
        assert!(!registry.is_ready());
    }

    #[test]
    fn reset_blank_policy_survives_bad_state() {
        let (_dir, adapter) = adapter();
        adapter
            .save_data("lore", "state", &json!(42))
            .unwrap();

        let mut registry = DaemonRegistry::with_core_daemons();
        registry.init(&adapter).unwrap();
        assert!(registry.is_ready());
        assert!(registry.get::<LoreDaemon>().unwrap().entry("x").is_none());
    }

    #[test]
    fn typed_lookup_finds_registered_daemon() {
        let registry = DaemonRegistry::with_core_daemons();
        assert!(registry.get::<PermissionsDaemon>().is_some());
        assert!(registry.get_by_id("combat").is_some());
        assert!(registry.get_by_id("economy").is_none());
    }
}
