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

//! Fixed-cap pool of script isolates.
//!
//! V8 isolates must only ever be entered from one thread, so each pool
//! slot owns an executor thread with its own isolate, and what the pool
//! hands out is the slot. `acquire` returns an idle slot if one exists,
//! spawns a new one up to the cap, and otherwise joins a FIFO queue with
//! no timeout (callers set their own deadlines). `release` hands the slot
//! directly to the longest-waiting caller rather than parking it, so a
//! loaded pool never round-trips through the idle state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::hostfn::HostRegistry;
use crate::platform::initialize_v8;
use crate::runner::{ScriptError, ScriptOutcome, execute_source};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("isolate pool has been disposed")]
    Disposed,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
    pub waiting: usize,
}

pub(crate) struct Job {
    pub source: String,
    pub timeout: Duration,
    pub registry: Arc<HostRegistry>,
    pub result_tx: oneshot::Sender<ScriptOutcome>,
}

/// One pool slot: the channel into its executor thread plus accounting.
struct Worker {
    id: usize,
    job_tx: flume::Sender<Job>,
    executions: u64,
}

struct PoolInner {
    idle: VecDeque<Worker>,
    waiters: VecDeque<oneshot::Sender<Worker>>,
    total: usize,
    in_use: usize,
    next_worker_id: usize,
    disposed: bool,
}

pub struct IsolatePool {
    inner: Arc<Mutex<PoolInner>>,
    cap: usize,
    memory_limit_mb: usize,
}

impl IsolatePool {
    #[must_use]
    pub fn new(cap: usize, memory_limit_mb: usize) -> Self {
        initialize_v8();
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                total: 0,
                in_use: 0,
                next_worker_id: 0,
                disposed: false,
            })),
            cap,
            memory_limit_mb,
        }
    }

    /// Acquire an isolate slot. Blocks with FIFO fairness when the pool
    /// is saturated; errors only after `dispose`.
    pub fn acquire(&self) -> Result<PooledIsolate, PoolError> {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.disposed {
                return Err(PoolError::Disposed);
            }
            if let Some(worker) = inner.idle.pop_front() {
                inner.in_use += 1;
                return Ok(PooledIsolate::held(self.inner.clone(), worker));
            }
            if inner.total < self.cap {
                let worker_id = inner.next_worker_id;
                inner.next_worker_id += 1;
                inner.total += 1;
                inner.in_use += 1;
                let worker = spawn_worker(worker_id, self.memory_limit_mb);
                debug!(worker_id, total = inner.total, "spawned isolate worker");
                return Ok(PooledIsolate::held(self.inner.clone(), worker));
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };

        // Saturated: wait for a releasing holder to hand us its slot.
        match rx.recv() {
            Ok(worker) => Ok(PooledIsolate::held(self.inner.clone(), worker)),
            Err(_) => Err(PoolError::Disposed),
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            total: inner.total,
            in_use: inner.in_use,
            available: inner.idle.len(),
            waiting: inner.waiters.len(),
        }
    }

    /// Cancel all waiters and destroy idle isolates. Outstanding holders
    /// finish their current execution; their slots are destroyed on
    /// release. Further acquires fail.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disposed = true;
        let cancelled = inner.waiters.len();
        inner.waiters.clear();
        let destroyed = inner.idle.len();
        inner.total -= destroyed;
        // Dropping a Worker drops its job channel; the executor thread
        // sees the closed channel and exits, taking its isolate with it.
        inner.idle.clear();
        if cancelled > 0 || destroyed > 0 {
            debug!(cancelled, destroyed, "isolate pool disposed");
        }
    }
}

impl Drop for IsolatePool {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// An exclusive hold on one pool slot. Released on drop: handed straight
/// to the longest waiter if any, parked idle otherwise.
pub struct PooledIsolate {
    inner: Arc<Mutex<PoolInner>>,
    worker: Option<Worker>,
    dead: bool,
}

impl PooledIsolate {
    fn held(inner: Arc<Mutex<PoolInner>>, worker: Worker) -> Self {
        Self {
            inner,
            worker: Some(worker),
            dead: false,
        }
    }

    /// Ship source to this slot's executor and wait for the outcome.
    pub fn execute(
        &mut self,
        source: String,
        timeout: Duration,
        registry: Arc<HostRegistry>,
    ) -> ScriptOutcome {
        let Some(worker) = &mut self.worker else {
            return ScriptOutcome::failed(ScriptError::WorkerLost, Duration::ZERO);
        };
        let (result_tx, result_rx) = oneshot::channel();
        let job = Job {
            source,
            timeout,
            registry,
            result_tx,
        };
        if worker.job_tx.send(job).is_err() {
            warn!(worker_id = worker.id, "isolate worker thread is gone");
            self.dead = true;
            return ScriptOutcome::failed(ScriptError::WorkerLost, Duration::ZERO);
        }
        match result_rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(worker_id = worker.id, "isolate worker died mid-execution");
                self.dead = true;
                ScriptOutcome::failed(ScriptError::WorkerLost, Duration::ZERO)
            }
        }
    }
}

impl Drop for PooledIsolate {
    fn drop(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        worker.executions += 1;

        let mut inner = self.inner.lock().unwrap();
        inner.in_use -= 1;
        if self.dead || inner.disposed {
            inner.total -= 1;
            return;
        }
        // Hand off directly; a cancelled waiter hands back and we try the
        // next one.
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(worker) {
                Ok(()) => {
                    inner.in_use += 1;
                    return;
                }
                Err(send_err) => worker = send_err.into_inner(),
            }
        }
        inner.idle.push_back(worker);
    }
}

fn spawn_worker(worker_id: usize, memory_limit_mb: usize) -> Worker {
    let (job_tx, job_rx) = flume::unbounded::<Job>();
    std::thread::Builder::new()
        .name(format!("isolate-{worker_id}"))
        .spawn(move || worker_loop(worker_id, job_rx, memory_limit_mb))
        .expect("Failed to spawn isolate worker thread");
    Worker {
        id: worker_id,
        job_tx,
        executions: 0,
    }
}

/// Executor thread body. Owns one isolate at a time; an isolate that hit
/// its memory cap is poisoned and replaced with a fresh heap rather than
/// re-entered.
fn worker_loop(worker_id: usize, job_rx: flume::Receiver<Job>, memory_limit_mb: usize) {
    'replace: loop {
        let mut isolate = MemoryCappedIsolate::new(memory_limit_mb);
        loop {
            let Ok(job) = job_rx.recv() else {
                // Pool dropped the channel; this slot is done.
                return;
            };
            let outcome = execute_source(
                &mut isolate,
                &job.source,
                job.timeout,
                job.registry,
                memory_limit_mb,
            );
            // A raised heap limit is poison even when the run itself
            // succeeded; never re-enter that heap.
            let poisoned = matches!(outcome.error, Some(ScriptError::Memory { .. }))
                || isolate.memory_exceeded();
            // Receiver gone just means the caller stopped caring.
            let _ = job.result_tx.send(outcome);
            if poisoned {
                warn!(worker_id, "isolate heap poisoned, replacing");
                continue 'replace;
            }
        }
    }
}

/// An owned isolate with its heap capped and a near-heap-limit callback
/// that terminates execution instead of letting V8 abort the process.
pub(crate) struct MemoryCappedIsolate {
    // Declared before `guard` so the isolate is destroyed before the
    // callback state it points at.
    isolate: v8::OwnedIsolate,
    guard: Box<MemoryGuard>,
}

pub(crate) struct MemoryGuard {
    pub exceeded: std::sync::atomic::AtomicBool,
    handle: Option<v8::IsolateHandle>,
}

impl MemoryCappedIsolate {
    fn new(memory_limit_mb: usize) -> Self {
        let params = v8::CreateParams::default().heap_limits(0, memory_limit_mb * 1024 * 1024);
        let mut isolate = v8::Isolate::new(params);
        let mut guard = Box::new(MemoryGuard {
            exceeded: std::sync::atomic::AtomicBool::new(false),
            handle: None,
        });
        guard.handle = Some(isolate.thread_safe_handle());
        let guard_ptr: *mut MemoryGuard = &mut *guard;
        isolate.add_near_heap_limit_callback(near_heap_limit_callback, guard_ptr.cast());
        Self { isolate, guard }
    }

    pub fn isolate(&mut self) -> &mut v8::OwnedIsolate {
        &mut self.isolate
    }

    pub fn memory_exceeded(&self) -> bool {
        self.guard
            .exceeded
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Called by V8 when the heap approaches its cap. Raising the returned
/// limit gives the terminating script room to unwind; the isolate is
/// replaced afterwards, so the raised limit never outlives this run.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // Safety: `data` points at the MemoryGuard boxed alongside the
    // isolate, which outlives every execution on it.
    let guard = unsafe { &*(data as *const MemoryGuard) };
    guard
        .exceeded
        .store(true, std::sync::atomic::Ordering::SeqCst);
    if let Some(handle) = &guard.handle {
        handle.terminate_execution();
    }
    current_heap_limit * 4
}
