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

//! Boot and shutdown orchestration around the world: the data-directory
//! lock, the autosave tick, and the bounded shutdown sequence.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Report};
use fs2::FileExt;
use serde_json::Value;
use tracing::{error, info, warn};

use ember_common::DisconnectReason;
use ember_db::PersistenceAdapter;
use ember_kernel::WorldHandle;
use ember_sandbox::IsolatePool;

use crate::connections::ConnectionRegistry;
use crate::links::LinkAdapter;

/// Take an exclusive lock on the data directory so two daemons can't
/// operate on the same store.
pub fn acquire_data_directory_lock(data_dir: &Path) -> Result<File, Report> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let lock_path = data_dir.join(".ember-daemon.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&lock_path)
        .with_context(|| format!("opening lock file {}", lock_path.display()))?;
    lock_file.try_lock_exclusive().with_context(|| {
        format!(
            "another daemon holds the data directory lock at {}",
            lock_path.display()
        )
    })?;
    Ok(lock_file)
}

/// Write the world snapshot and every connected player's save. Used by
/// the autosave tick and the shutdown path; both kinds of write are
/// atomic in the adapter.
pub async fn save_world_and_players(
    world: &WorldHandle,
    adapter: &Arc<dyn PersistenceAdapter>,
) -> Result<(), String> {
    let snapshot = world
        .snapshot()
        .map_err(|e| e.to_string())?
        .await
        .map_err(|_| "world did not reply with snapshot".to_string())?;
    let saves = world
        .connected_saves()
        .map_err(|e| e.to_string())?
        .await
        .map_err(|_| "world did not reply with saves".to_string())?;

    let adapter = adapter.clone();
    tokio::task::spawn_blocking(move || {
        adapter.save_world(&snapshot).map_err(|e| e.to_string())?;
        for (name, data) in saves {
            adapter
                .save_player(&name, &data)
                .map_err(|e| e.to_string())?;
        }
        Ok::<(), String>(())
    })
    .await
    .map_err(|_| "save task panicked".to_string())?
}

/// The autosave tick: world snapshot plus all connected players, every
/// interval, until the world goes away.
pub async fn autosave_loop(
    world: WorldHandle,
    adapter: Arc<dyn PersistenceAdapter>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick would re-save what boot just loaded.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match save_world_and_players(&world, &adapter).await {
            Ok(()) => info!("autosave complete"),
            Err(e) => {
                if e.contains("not running") {
                    return;
                }
                error!(%e, "autosave failed");
            }
        }
    }
}

/// Orderly shutdown, after the accept socket has closed:
/// final save, world stop (which drains and serializes daemons),
/// daemon-state persistence, link close, isolate pool disposal, then
/// force-termination of whatever connections remain. The caller bounds
/// the whole sequence with the shutdown deadline.
pub async fn run_shutdown(
    world: WorldHandle,
    registry: ConnectionRegistry,
    links: Vec<Arc<dyn LinkAdapter>>,
    pool: Arc<IsolatePool>,
    adapter: Arc<dyn PersistenceAdapter>,
) {
    info!("shutdown: saving world and players");
    if let Err(e) = save_world_and_players(&world, &adapter).await {
        error!(%e, "final save failed");
    }

    info!("shutdown: stopping world");
    let daemon_states: Vec<(String, Value)> = match world.shutdown() {
        Some(rx) => rx.await.unwrap_or_default(),
        None => vec![],
    };

    if !daemon_states.is_empty() {
        let adapter = adapter.clone();
        let result = tokio::task::spawn_blocking(move || {
            for (id, state) in daemon_states {
                if let Err(e) = adapter.save_data(&id, "state", &state) {
                    error!(daemon = %id, %e, "could not persist daemon state");
                }
            }
        })
        .await;
        if result.is_err() {
            error!("daemon persistence task panicked");
        }
    }

    info!("shutdown: closing external links");
    for link in links {
        link.close();
    }

    info!("shutdown: disposing isolate pool");
    pool.dispose();

    let remaining = registry.snapshot();
    if !remaining.is_empty() {
        warn!(count = remaining.len(), "force-terminating remaining connections");
        for conn in remaining {
            conn.terminate(DisconnectReason::Shutdown);
            registry.remove(conn.connection_id);
        }
    }
    info!("shutdown complete");
}
