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

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use ember_db::PersistenceAdapter;
use ember_kernel::WorldHandle;

use crate::connections::ConnectionRegistry;
use crate::sessions::SessionManager;

/// Shared state behind the axum router and the connection tasks.
#[derive(Clone)]
pub struct AppState {
    pub world: WorldHandle,
    pub registry: ConnectionRegistry,
    pub sessions: Arc<SessionManager>,
    pub adapter: Arc<dyn PersistenceAdapter>,
    /// Flips true once daemon init completes; gates `/ready`.
    pub ready: Arc<AtomicBool>,
    pub session_ttl: Duration,
    pub game_version: String,
}
