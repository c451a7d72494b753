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

//! The per-connection writer task: sole owner of the socket sink, so
//! every enqueued frame goes out as exactly one WebSocket message and
//! frames from concurrent world-side writers never interleave.
//!
//! A client that stops reading eventually stalls `sink.send` on the OS
//! socket buffer, which is exactly the condition backpressure
//! termination fires under. Every send therefore runs under a write
//! deadline, and the loop selects on the connection's shutdown token,
//! so an abrupt termination never waits behind a stuck write: the task
//! drops the sink without a close frame and the peer observes an
//! abnormal closure (1006).
//!
//! Messages above the compression threshold go out deflated as binary
//! messages; the web client inflates on the `binary` path. Small
//! messages stay as text, where permessage overhead would outweigh the
//! savings.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{COMPRESSION_THRESHOLD, ConnState, Connection, OutboundMsg};

/// Bound on any single socket write. A send that cannot complete within
/// this is a client that stopped reading; the socket is abandoned.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

pub async fn writer_task(
    conn: Arc<Connection>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundMsg>,
) {
    let shutdown = conn.shutdown_token();
    loop {
        let msg = tokio::select! {
            // Biased: an abrupt termination must win over a backlog of
            // queued data, or a stuffed queue delays the teardown.
            biased;
            () = shutdown.cancelled() => break,
            msg = outbound_rx.recv() => match msg {
                // Sender taken by close_outbound and queue drained.
                Some(msg) => msg,
                None => break,
            },
        };
        match msg {
            OutboundMsg::Data(bytes) => {
                let len = bytes.len();
                let message = encode_message(bytes);
                let sent = tokio::time::timeout(WRITE_DEADLINE, sink.send(message)).await;
                conn.drained(len);
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        debug!(connection_id = %conn.connection_id, "socket gone mid-write");
                        break;
                    }
                    Err(_) => {
                        warn!(
                            connection_id = %conn.connection_id,
                            "write deadline exceeded, abandoning socket"
                        );
                        break;
                    }
                }
            }
            OutboundMsg::Ping => {
                match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Ping(Bytes::new())))
                    .await
                {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            OutboundMsg::Close(reason) => {
                // Abrupt reasons never queue a close frame; belt and
                // braces in case one slips through.
                if !reason.is_abrupt() {
                    let frame = CloseFrame {
                        code: reason.close_code(),
                        reason: reason.to_string().into(),
                    };
                    let _ = tokio::time::timeout(
                        WRITE_DEADLINE,
                        sink.send(Message::Close(Some(frame))),
                    )
                    .await;
                }
                break;
            }
        }
    }
    conn.set_state(ConnState::Closed);
    // Unblock the reader; dropping the sink here closes our half.
    shutdown.cancel();
}

fn encode_message(bytes: Bytes) -> Message {
    if bytes.len() > COMPRESSION_THRESHOLD {
        match deflate(&bytes) {
            Ok(compressed) => return Message::Binary(Bytes::from(compressed)),
            Err(e) => debug!(?e, "compression failed, sending uncompressed"),
        }
    }
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        // Protocol bytes are always UTF-8; anything else ships binary
        // uncompressed.
        Err(_) => Message::Binary(bytes),
    }
}

fn deflate(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}
