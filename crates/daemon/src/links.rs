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

//! Outbound federation links: clients for pre-existing off-MUD
//! protocols. Each link owns its own task and socket. Connection loss
//! reconnects with exponential backoff and jitter; outbound events
//! buffer up to a cap while the link is down, after which the oldest is
//! dropped and counted. Link failures are reported, never propagated
//! into the world loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Per-operation bound on connect attempts and writes.
const OP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUFFER_CAP: usize = 1024;

pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Outbound client for one off-MUD network.
pub trait LinkAdapter: Send + Sync {
    fn name(&self) -> &str;
    /// Queue an event for delivery. Never blocks; buffered while the
    /// link is down, with the oldest dropped past the cap.
    fn send(&self, event: Value);
    fn on_event(&self, callback: EventCallback);
    /// Events dropped to the buffer cap so far.
    fn dropped(&self) -> u64;
    fn close(&self);
}

/// A JSON-lines-over-TCP channel link: one JSON event per line, both
/// directions.
pub struct TcpJsonLink {
    name: String,
    addr: String,
    state: Arc<LinkState>,
}

struct LinkState {
    outbound: Mutex<VecDeque<Value>>,
    buffer_cap: usize,
    dropped: AtomicU64,
    callbacks: Mutex<Vec<EventCallback>>,
    wake: Notify,
    generation: AtomicUsize,
}

impl TcpJsonLink {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, buffer_cap: usize) -> Arc<Self> {
        let link = Arc::new(Self {
            name: name.into(),
            addr: addr.into(),
            state: Arc::new(LinkState {
                outbound: Mutex::new(VecDeque::new()),
                buffer_cap,
                dropped: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
                wake: Notify::new(),
                generation: AtomicUsize::new(0),
            }),
        });
        let task_link = link.clone();
        tokio::spawn(async move { task_link.run().await });
        link
    }

    async fn run(self: Arc<Self>) {
        let my_generation = self.state.generation.load(Ordering::SeqCst);
        let mut backoff = BACKOFF_START;
        loop {
            if self.closed(my_generation) {
                return;
            }
            match tokio::time::timeout(OP_TIMEOUT, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => {
                    info!(link = %self.name, addr = %self.addr, "link connected");
                    backoff = BACKOFF_START;
                    self.serve(stream, my_generation).await;
                    if self.closed(my_generation) {
                        return;
                    }
                    warn!(link = %self.name, "link lost, reconnecting");
                }
                Ok(Err(e)) => {
                    debug!(link = %self.name, %e, "link connect failed");
                }
                Err(_) => {
                    debug!(link = %self.name, "link connect timed out");
                }
            }

            tokio::time::sleep(jittered(backoff)).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn serve(&self, stream: TcpStream, my_generation: usize) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            // Drain anything buffered before waiting for more.
            while let Some(event) = self.pop_outbound() {
                let mut line = match serde_json::to_vec(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(link = %self.name, %e, "unserializable event dropped");
                        continue;
                    }
                };
                line.push(b'\n');
                match tokio::time::timeout(OP_TIMEOUT, write_half.write_all(&line)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        // Write failed; put it back for the next
                        // connection.
                        self.state.outbound.lock().unwrap().push_front(event);
                        return;
                    }
                }
            }

            tokio::select! {
                _ = self.state.wake.notified() => {
                    if self.closed(my_generation) {
                        return;
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.deliver(&line),
                        Ok(None) => return,
                        Err(e) => {
                            debug!(link = %self.name, %e, "link read error");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn deliver(&self, line: &str) {
        let event: Value = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(link = %self.name, %e, "unparseable event from link");
                return;
            }
        };
        let callbacks = self.state.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            callback(event.clone());
        }
    }

    fn pop_outbound(&self) -> Option<Value> {
        self.state.outbound.lock().unwrap().pop_front()
    }

    fn closed(&self, my_generation: usize) -> bool {
        self.state.generation.load(Ordering::SeqCst) != my_generation
    }
}

impl LinkAdapter for TcpJsonLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, event: Value) {
        {
            let mut outbound = self.state.outbound.lock().unwrap();
            if outbound.len() >= self.state.buffer_cap {
                outbound.pop_front();
                let dropped = self.state.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(link = %self.name, dropped, "link buffer full, oldest event dropped");
            }
            outbound.push_back(event);
        }
        self.state.wake.notify_one();
    }

    fn on_event(&self, callback: EventCallback) {
        self.state.callbacks.lock().unwrap().push(callback);
    }

    fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state.wake.notify_one();
    }
}

/// Backoff with ±25% jitter, so a fleet of links doesn't thunder back
/// in lockstep.
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as f64;
    let factor = rand::rng().random_range(0.75..=1.25);
    Duration::from_millis((base_ms * factor) as u64)
}
