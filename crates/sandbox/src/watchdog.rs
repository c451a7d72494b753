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

//! Script execution watchdog. Monitors running executions and interrupts
//! any that exceed their wall-clock budget; the executing thread then
//! observes a terminated run and reports `timeout_error`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use tracing::{debug, warn};

const WATCHDOG_POLL: Duration = Duration::from_millis(10);

pub type ExecutionId = u64;

lazy_static! {
    static ref WATCHDOG: Watchdog = Watchdog::new();
}

static NEXT_EXECUTION_ID: AtomicU64 = AtomicU64::new(1);

struct ExecutionState {
    handle: v8::IsolateHandle,
    deadline: Instant,
    /// Set when the watchdog fired, so the executor can distinguish a
    /// timeout from a script's own exception.
    expired: Arc<AtomicBool>,
}

struct Watchdog {
    executions: Mutex<HashMap<ExecutionId, ExecutionState>>,
    shutdown: Arc<AtomicBool>,
}

impl Watchdog {
    fn new() -> Self {
        let watchdog = Self {
            executions: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        let shutdown_flag = watchdog.shutdown.clone();
        std::thread::Builder::new()
            .name("script-watchdog".to_string())
            .spawn(move || {
                debug!("script watchdog thread started");
                Self::watchdog_loop(shutdown_flag);
            })
            .expect("Failed to spawn script watchdog thread");

        watchdog
    }

    fn watchdog_loop(shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(WATCHDOG_POLL);

            let executions = WATCHDOG.executions.lock().unwrap();
            let now = Instant::now();
            for (&execution_id, state) in executions.iter() {
                if now < state.deadline {
                    continue;
                }
                if state.expired.swap(true, Ordering::SeqCst) {
                    // Already interrupted; the executor just hasn't
                    // unregistered yet.
                    continue;
                }
                warn!(execution_id, "script exceeded wall-clock budget, terminating");
                state.handle.terminate_execution();
            }
        }
    }
}

/// Register an execution. The returned guard unregisters on drop, on
/// every return path.
pub fn register_execution(
    handle: v8::IsolateHandle,
    timeout: Duration,
) -> (WatchdogGuard, Arc<AtomicBool>) {
    let execution_id = NEXT_EXECUTION_ID.fetch_add(1, Ordering::Relaxed);
    let expired = Arc::new(AtomicBool::new(false));
    let state = ExecutionState {
        handle,
        deadline: Instant::now() + timeout,
        expired: expired.clone(),
    };

    let mut executions = WATCHDOG.executions.lock().unwrap();
    executions.insert(execution_id, state);
    (WatchdogGuard { execution_id }, expired)
}

fn unregister_execution(execution_id: ExecutionId) {
    let mut executions = WATCHDOG.executions.lock().unwrap();
    executions.remove(&execution_id);
}

pub struct WatchdogGuard {
    execution_id: ExecutionId,
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        unregister_execution(self.execution_id);
    }
}
