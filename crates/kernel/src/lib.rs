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

//! The world runtime. Logically single-threaded: all object mutation,
//! command handling, heartbeat ticking, and daemon callbacks happen on
//! one thread, fed by a message queue. The network layer, persistence,
//! and script isolates run beside it and re-enter through that queue.

pub mod daemons;
pub mod dispatch;
pub mod gametime;
pub mod heartbeat;
pub mod object;
pub mod runtime;
pub mod session;
pub mod world;

pub use daemons::{Daemon, DaemonError, DaemonRegistry, RestorePolicy};
pub use object::{Effect, WorldObject};
pub use runtime::{
    AsyncLauncher, KernelConfig, RuntimeError, WorldHandle, WorldMessage, WorldRuntime,
};
pub use session::{MockSession, NoopSession, Session, SessionBinder, SessionError};
pub use world::{World, WorldError};
