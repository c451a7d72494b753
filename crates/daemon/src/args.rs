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

//! Command-line arguments. Every knob is also bound to its environment
//! variable; the env set is closed and documented, and command-line
//! values win over the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::ValueHint;
use clap_derive::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PersistenceKind {
    Filesystem,
    Remote,
}

#[derive(Parser, Debug)]
#[command(name = "ember-daemon", about = "The ember world server")]
pub struct Args {
    #[arg(
        long,
        env = "HOST",
        value_name = "host",
        help = "Listen address",
        default_value = "0.0.0.0"
    )]
    pub host: String,

    #[arg(
        long,
        env = "PORT",
        value_name = "port",
        help = "Listen port",
        default_value_t = 4000
    )]
    pub port: u16,

    #[arg(
        long,
        env = "DATA_PATH",
        value_name = "data-path",
        help = "Data directory for the embedded store, the directory lock, and script file roots",
        value_hint = ValueHint::DirPath,
        default_value = "data"
    )]
    pub data_path: PathBuf,

    #[arg(
        long,
        env = "PERSISTENCE_ADAPTER",
        value_enum,
        value_name = "persistence-adapter",
        help = "Which persistence backend to use",
        default_value = "filesystem"
    )]
    pub persistence_adapter: PersistenceKind,

    #[arg(
        long,
        env = "REMOTE_STORE_URL",
        value_name = "remote-store-url",
        help = "Base URL of the remote table store (remote adapter only)"
    )]
    pub remote_store_url: Option<String>,

    #[arg(
        long,
        env = "REMOTE_STORE_KEY",
        value_name = "remote-store-key",
        help = "Service key for the remote table store (remote adapter only)"
    )]
    pub remote_store_key: Option<String>,

    #[arg(
        long,
        env = "AI_API_KEY",
        value_name = "ai-api-key",
        help = "API key for the ai_generate host function; generation is disabled without it"
    )]
    pub ai_api_key: Option<String>,

    #[arg(
        long,
        env = "SESSION_SECRET",
        value_name = "session-secret",
        help = "HMAC secret for session tokens. Generated per-process when absent, which disables resume across restarts"
    )]
    pub session_secret: Option<String>,

    #[arg(
        long,
        env = "SESSION_TTL_MS",
        value_name = "session-ttl-ms",
        help = "Resumable session lifetime in milliseconds",
        default_value_t = 900_000
    )]
    pub session_ttl_ms: u64,

    #[arg(
        long,
        env = "HEARTBEAT_INTERVAL_MS",
        value_name = "heartbeat-interval-ms",
        help = "Connection heartbeat sweep interval in milliseconds",
        default_value_t = 10_000
    )]
    pub heartbeat_interval_ms: u64,

    #[arg(
        long,
        env = "MAX_MISSED_PONGS",
        value_name = "max-missed-pongs",
        help = "Missed pongs tolerated before a connection is closed",
        default_value_t = 18
    )]
    pub max_missed_pongs: u32,

    #[arg(
        long,
        env = "ISOLATE_POOL_SIZE",
        value_name = "isolate-pool-size",
        help = "Fixed cap on concurrently-held script isolates",
        default_value_t = 4
    )]
    pub isolate_pool_size: usize,

    #[arg(
        long,
        env = "ISOLATE_MEMORY_MB",
        value_name = "isolate-memory-mb",
        help = "Heap cap per script isolate, in megabytes",
        default_value_t = 128
    )]
    pub isolate_memory_mb: usize,

    #[arg(
        long,
        env = "SCRIPT_TIMEOUT_MS",
        value_name = "script-timeout-ms",
        help = "Wall-clock limit per script execution, in milliseconds",
        default_value_t = 5_000
    )]
    pub script_timeout_ms: u64,

    #[arg(
        long,
        env = "TICK_PERIOD_MS",
        value_name = "tick-period-ms",
        help = "Heartbeat scheduler tick period, in milliseconds",
        default_value_t = 1_000
    )]
    pub tick_period_ms: u64,

    #[arg(
        long,
        env = "AUTOSAVE_INTERVAL_MS",
        value_name = "autosave-interval-ms",
        help = "World snapshot and player autosave interval, in milliseconds",
        default_value_t = 300_000
    )]
    pub autosave_interval_ms: u64,

    #[arg(
        long,
        env = "SHUTDOWN_DEADLINE_MS",
        value_name = "shutdown-deadline-ms",
        help = "Grace period for orderly shutdown before remaining connections are dropped",
        default_value_t = 30_000
    )]
    pub shutdown_deadline_ms: u64,

    #[arg(
        long,
        value_name = "client-dir",
        help = "Directory of static client assets to serve",
        value_hint = ValueHint::DirPath,
        default_value = "client"
    )]
    pub client_dir: PathBuf,

    #[arg(
        long,
        value_name = "start-room",
        help = "Singleton blueprint path players enter the world at"
    )]
    pub start_room: Option<String>,
}

impl Args {
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    #[must_use]
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    #[must_use]
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }

    #[must_use]
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}
