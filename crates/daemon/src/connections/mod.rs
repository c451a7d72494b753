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

//! Connection lifecycle and outbound discipline.
//!
//! Every connection owns an outbound queue drained by a writer task;
//! each frame or line is one atomic write. `buffered_bytes` tracks what
//! sits between the world and the socket: past the soft watermark we
//! warn once, past the hard watermark pings stop (data still queues),
//! and past the critical watermark the client is considered unable to
//! receive and the connection is terminated with `buffer_backlog`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ember_common::{DisconnectReason, ObjId};
use ember_kernel::WorldHandle;

pub mod writer;
pub mod ws;

pub const SOFT_WATERMARK: usize = 64 * 1024;
pub const HARD_WATERMARK: usize = 256 * 1024;
pub const CRITICAL_WATERMARK: usize = 512 * 1024;
/// Payloads above this compress before hitting the socket.
pub const COMPRESSION_THRESHOLD: usize = 128;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum ConnState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Opening,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

pub enum OutboundMsg {
    Data(Bytes),
    Ping,
    Close(DisconnectReason),
}

/// One live connection. Created on accept, destroyed on close, never
/// reused.
pub struct Connection {
    pub connection_id: Uuid,
    pub remote: SocketAddr,
    state: AtomicU8,
    /// Taken by `close_outbound` so the writer can observe end-of-queue
    /// and drain to completion.
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<OutboundMsg>>>,
    buffered_bytes: AtomicUsize,
    missed_pongs: AtomicU32,
    connected_ms: u64,
    last_activity_ms: AtomicU64,
    soft_warned: AtomicBool,
    player: Mutex<Option<ObjId>>,
    /// Cancelled to tear the connection down without a close frame: the
    /// reader and writer tasks both select on it, so a wedged writer
    /// cannot keep the socket alive.
    shutdown: CancellationToken,
}

impl Connection {
    pub fn new(
        remote: SocketAddr,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<OutboundMsg>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            connection_id: Uuid::new_v4(),
            remote,
            state: AtomicU8::new(ConnState::Opening as u8),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            buffered_bytes: AtomicUsize::new(0),
            missed_pongs: AtomicU32::new(0),
            connected_ms: now_ms(),
            last_activity_ms: AtomicU64::new(now_ms()),
            soft_warned: AtomicBool::new(false),
            player: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        (conn, outbound_rx)
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn player(&self) -> Option<ObjId> {
        *self.player.lock().unwrap()
    }

    pub fn bind_player(&self, player: ObjId) {
        *self.player.lock().unwrap() = Some(player);
    }

    /// Enqueue one atomic write. Returns false when the connection no
    /// longer accepts output (closing, closed, or writer gone); the
    /// bytes are discarded, which is the contract for writes racing a
    /// close.
    pub fn send_bytes(&self, bytes: Bytes) -> bool {
        if self.state() >= ConnState::Closing {
            return false;
        }
        let len = bytes.len();
        let buffered = self.buffered_bytes.fetch_add(len, Ordering::SeqCst) + len;
        if buffered > SOFT_WATERMARK && !self.soft_warned.swap(true, Ordering::SeqCst) {
            warn!(
                connection_id = %self.connection_id,
                buffered, "outbound buffer past soft watermark"
            );
        }
        if !self.enqueue(OutboundMsg::Data(bytes)) {
            self.buffered_bytes.fetch_sub(len, Ordering::SeqCst);
            self.set_state(ConnState::Closed);
            return false;
        }
        true
    }

    fn enqueue(&self, msg: OutboundMsg) -> bool {
        let tx = self.outbound_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Drop the outbound sender. The writer drains whatever is already
    /// queued (close frames included) and then exits on its own.
    pub fn close_outbound(&self) {
        self.outbound_tx.lock().unwrap().take();
    }

    pub(crate) fn drained(&self, len: usize) {
        let now = self.buffered_bytes.fetch_sub(len, Ordering::SeqCst) - len;
        if now <= SOFT_WATERMARK {
            self.soft_warned.store(false, Ordering::SeqCst);
        }
    }

    pub fn send_ping(&self) {
        self.enqueue(OutboundMsg::Ping);
    }

    /// Close with a reason. Idempotent; later writes are discarded.
    ///
    /// Clean reasons queue a close frame for the writer to flush.
    /// Abrupt reasons (`buffer_backlog`) skip the frame entirely and
    /// cancel the shutdown token instead: the writer may be wedged
    /// behind a full socket, so the socket is dropped and the peer
    /// observes an abnormal closure (1006).
    pub fn terminate(&self, reason: DisconnectReason) {
        if self.state() >= ConnState::Closing {
            return;
        }
        self.set_state(ConnState::Closing);
        info!(connection_id = %self.connection_id, %reason, "terminating connection");
        if reason.is_abrupt() {
            self.shutdown.cancel();
            return;
        }
        if !self.enqueue(OutboundMsg::Close(reason)) {
            // Writer already gone; make sure the reader unblocks too.
            self.shutdown.cancel();
        }
    }

    /// Token the reader and writer tasks select on; cancelled when the
    /// connection must die without waiting for in-flight writes.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Any inbound pong or message resets the miss counter.
    pub fn touch(&self) {
        self.missed_pongs.store(0, Ordering::SeqCst);
        self.last_activity_ms.store(now_ms(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    /// Seconds this connection has been open.
    #[must_use]
    pub fn connected_seconds(&self) -> f64 {
        now_ms().saturating_sub(self.connected_ms) as f64 / 1000.0
    }

    /// Seconds since the last inbound activity.
    #[must_use]
    pub fn idle_seconds(&self) -> f64 {
        now_ms().saturating_sub(self.last_activity_ms()) as f64 / 1000.0
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// All live connections, keyed by connection id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Connection>>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.inner
            .lock()
            .unwrap()
            .insert(conn.connection_id, conn);
    }

    pub fn remove(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        self.inner.lock().unwrap().remove(&connection_id)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Connected and idle seconds for the connection bound to a player,
    /// if any. Backs who-style queries and the `connection_seconds`
    /// host function.
    #[must_use]
    pub fn seconds_for_player(&self, player: ObjId) -> Option<(f64, f64)> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .find(|conn| conn.player() == Some(player))
            .map(|conn| (conn.connected_seconds(), conn.idle_seconds()))
    }
}

/// One heartbeat sweep over all connections. For each live connection:
/// detach the dead, terminate the critically backlogged, count a missed
/// pong and terminate past tolerance, and otherwise send one ping plus
/// one `TIME` frame (the data frame keeps intermediaries that ignore
/// ping frames from idling the link out).
pub fn heartbeat_sweep(
    registry: &ConnectionRegistry,
    world: &WorldHandle,
    max_missed: u32,
    game_version: &str,
) {
    for conn in registry.snapshot() {
        match conn.state() {
            ConnState::Closing | ConnState::Closed => {
                debug!(connection_id = %conn.connection_id, "detaching dead connection");
                registry.remove(conn.connection_id);
                if let Some(player) = conn.player() {
                    let _ = world.disconnect(player);
                }
                continue;
            }
            ConnState::Opening | ConnState::Open => {}
        }

        if conn.buffered_bytes() > CRITICAL_WATERMARK {
            conn.terminate(DisconnectReason::BufferBacklog);
            registry.remove(conn.connection_id);
            if let Some(player) = conn.player() {
                let _ = world.disconnect(player);
            }
            continue;
        }

        let missed = conn.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1;
        if missed > max_missed {
            conn.terminate(DisconnectReason::HeartbeatTimeout);
            registry.remove(conn.connection_id);
            if let Some(player) = conn.player() {
                let _ = world.disconnect(player);
            }
            continue;
        }

        // Past the hard watermark the client isn't draining; adding
        // pings just grows the backlog.
        if conn.buffered_bytes() > HARD_WATERMARK {
            continue;
        }
        conn.send_ping();
        let time = ember_common::proto::payloads::TimePayload {
            server_ms: now_ms(),
            game_version: game_version.to_string(),
        };
        if let Ok(bytes) = ember_common::encode_frame(ember_common::FrameType::Time, &time) {
            conn.send_bytes(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    #[test]
    fn send_accounts_buffered_bytes() {
        let (conn, mut rx) = Connection::new(addr());
        conn.set_state(ConnState::Open);
        assert!(conn.send_bytes(Bytes::from_static(b"hello")));
        assert_eq!(conn.buffered_bytes(), 5);

        let Some(OutboundMsg::Data(bytes)) = rx.try_recv().ok() else {
            panic!("expected queued data");
        };
        conn.drained(bytes.len());
        assert_eq!(conn.buffered_bytes(), 0);
    }

    #[test]
    fn writes_after_close_are_discarded() {
        let (conn, _rx) = Connection::new(addr());
        conn.set_state(ConnState::Open);
        conn.terminate(DisconnectReason::Quit);
        assert!(!conn.send_bytes(Bytes::from_static(b"late")));
        assert_eq!(conn.buffered_bytes(), 0);
    }

    #[test]
    fn terminate_is_idempotent() {
        let (conn, mut rx) = Connection::new(addr());
        conn.set_state(ConnState::Open);
        conn.terminate(DisconnectReason::HeartbeatTimeout);
        conn.terminate(DisconnectReason::Quit);

        let mut closes = 0;
        while let Ok(msg) = rx.try_recv() {
            if let OutboundMsg::Close(reason) = msg {
                closes += 1;
                assert_eq!(reason, DisconnectReason::HeartbeatTimeout);
            }
        }
        assert_eq!(closes, 1);
    }

    #[test]
    fn abrupt_terminate_skips_the_close_frame() {
        let (conn, mut rx) = Connection::new(addr());
        conn.set_state(ConnState::Open);
        conn.terminate(DisconnectReason::BufferBacklog);

        // No close frame queued; the shutdown token tears the socket
        // down and the peer observes 1006.
        assert!(conn.is_shutdown());
        assert_eq!(conn.state(), ConnState::Closing);
        while let Ok(msg) = rx.try_recv() {
            assert!(!matches!(msg, OutboundMsg::Close(_)));
        }

        // Still idempotent: a later clean terminate is a no-op.
        conn.terminate(DisconnectReason::Quit);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn touch_resets_missed_pongs() {
        let (conn, _rx) = Connection::new(addr());
        conn.missed_pongs.store(7, Ordering::SeqCst);
        conn.touch();
        assert_eq!(conn.missed_pongs(), 0);
    }

    #[test]
    fn concurrent_writers_never_split_a_frame() {
        use std::sync::Barrier;
        use std::thread;

        let (conn, mut rx) = Connection::new(addr());
        conn.set_state(ConnState::Open);

        let num_threads = 8;
        let per_thread = 50;
        let barrier = std::sync::Arc::new(Barrier::new(num_threads));
        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let conn = conn.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..per_thread {
                        let frame = format!("\u{0}[COMM]{{\"writer\":{t},\"seq\":{i}}}\n");
                        conn.send_bytes(Bytes::from(frame.into_bytes()));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Every queued write is one whole frame: starts with NUL, ends
        // with newline, parses as a single envelope.
        let mut count = 0;
        while let Ok(OutboundMsg::Data(bytes)) = rx.try_recv() {
            count += 1;
            assert_eq!(bytes[0], 0);
            assert_eq!(*bytes.last().unwrap(), b'\n');
            assert_eq!(bytes.iter().filter(|&&b| b == 0).count(), 1);
        }
        assert_eq!(count, num_threads * per_thread);
    }

    #[test]
    fn registry_count_tracks_lifecycle() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = Connection::new(addr());
        let (b, _rx_b) = Connection::new(addr());
        registry.insert(a.clone());
        registry.insert(b.clone());
        assert_eq!(registry.count(), 2);

        registry.remove(a.connection_id);
        assert_eq!(registry.count(), 1);
        assert!(registry.remove(a.connection_id).is_none());
    }
}
