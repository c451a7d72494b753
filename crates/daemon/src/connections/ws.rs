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

//! The `/ws` endpoint: upgrade, authentication handshake, then the
//! read loop feeding the world. Authentication failures get exactly one
//! line with no introspection; protocol errors drop the frame, warn
//! once, and keep the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ember_common::proto::payloads::{AuthResultPayload, SessionPayload};
use ember_common::{
    CodecError, DisconnectReason, FrameType, Inbound, MAX_FRAME_PAYLOAD, ObjId, decode_inbound,
    encode_frame, encode_text,
};
use ember_db::PersistenceAdapter;
use ember_kernel::{Session, SessionError};

use crate::sessions::AuthError;
use crate::state::AppState;

use super::writer::writer_task;
use super::{ConnState, Connection};

/// Kernel-facing session backed by a connection's atomic writer.
pub struct WsSession {
    conn: Arc<Connection>,
}

impl WsSession {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }
}

impl Session for WsSession {
    fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.conn.send_bytes(encode_text(text));
        Ok(())
    }

    fn send_frame(&self, ty: FrameType, payload: Value) -> Result<(), SessionError> {
        let bytes = encode_frame(ty, &payload).map_err(|_| SessionError::DeliveryError)?;
        self.conn.send_bytes(bytes);
        Ok(())
    }

    fn disconnect(&self, reason: DisconnectReason) -> Result<(), SessionError> {
        self.conn.terminate(reason);
        Ok(())
    }

    fn connection_id(&self) -> Uuid {
        self.conn.connection_id
    }

    fn connected_seconds(&self) -> f64 {
        self.conn.connected_seconds()
    }

    fn idle_seconds(&self) -> f64 {
        self.conn.idle_seconds()
    }
}

pub async fn ws_handler(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_PAYLOAD)
        .on_upgrade(move |socket| handle_socket(socket, addr, app))
}

/// How long the cleanup path waits for the writer to flush and exit
/// before pulling the plug on its task.
const WRITER_EXIT_GRACE: Duration = Duration::from_secs(5);

async fn handle_socket(socket: WebSocket, addr: SocketAddr, app: AppState) {
    let (sink, mut stream) = socket.split();
    let (conn, outbound_rx) = Connection::new(addr);
    app.registry.insert(conn.clone());
    let mut writer = tokio::spawn(writer_task(conn.clone(), sink, outbound_rx));
    conn.set_state(ConnState::Open);
    info!(connection_id = %conn.connection_id, %addr, "connection open");

    match authenticate(&mut stream, &conn, &addr, &app).await {
        Some((player, name)) => {
            conn.bind_player(player);
            debug!(connection_id = %conn.connection_id, %player, name, "authenticated");
            read_loop(&mut stream, &conn, player, &app).await;
            let _ = app.world.disconnect(player);
        }
        None => {
            conn.terminate(DisconnectReason::Quit);
        }
    }

    app.registry.remove(conn.connection_id);

    // Supervise the writer out of existence. Dropping the outbound
    // sender lets it drain queued output (close frames included) and
    // exit; a writer stuck past its own write deadline gets cancelled,
    // then aborted. Dropping both halves here is what actually closes
    // the socket, so an abrupt termination reaches the peer as 1006.
    conn.close_outbound();
    if tokio::time::timeout(WRITER_EXIT_GRACE, &mut writer)
        .await
        .is_err()
    {
        conn.shutdown_token().cancel();
        if tokio::time::timeout(WRITER_EXIT_GRACE, &mut writer)
            .await
            .is_err()
        {
            warn!(connection_id = %conn.connection_id, "writer wedged, aborting task");
            writer.abort();
        }
    }
    conn.set_state(ConnState::Closed);
    info!(connection_id = %conn.connection_id, "connection closed");
}

/// Run the authentication handshake. Returns the bound player on
/// success; `None` means the socket closed or gave up.
async fn authenticate(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    conn: &Arc<Connection>,
    addr: &SocketAddr,
    app: &AppState,
) -> Option<(ObjId, String)> {
    let shutdown = conn.shutdown_token();
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => return None,
            message = stream.next() => message?.ok()?,
        };
        let bytes = match &message {
            Message::Text(t) => t.as_bytes().to_vec(),
            Message::Binary(b) => b.to_vec(),
            Message::Close(_) => return None,
            _ => continue,
        };
        let inbound = match decode_inbound(&bytes) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(connection_id = %conn.connection_id, %e, "bad frame during auth");
                continue;
            }
        };

        let attempt = match inbound {
            Inbound::Auth(req) => match (req.session_token, req.name, req.password) {
                (Some(token), _, _) => try_resume(conn, addr, app, &token).await,
                (None, Some(name), Some(password)) => {
                    try_credentials(conn, addr, app, name, password).await
                }
                _ => Err("Malformed auth request".to_string()),
            },
            Inbound::Session(resume) => try_resume(conn, addr, app, &resume.token).await,
            Inbound::Pong | Inbound::Ping => {
                conn.touch();
                continue;
            }
            _ => Err("Authenticate first".to_string()),
        };

        match attempt {
            Ok((player, name)) => {
                return Some((player, name));
            }
            Err(message) => {
                // One line, no introspection.
                send_auth_result(conn, AuthResultPayload {
                    ok: false,
                    name: None,
                    message: Some(message),
                });
            }
        }
    }
}

async fn try_resume(
    conn: &Arc<Connection>,
    addr: &SocketAddr,
    app: &AppState,
    token: &str,
) -> Result<(ObjId, String), String> {
    let resumed = app
        .sessions
        .resume(token, addr.ip())
        .map_err(|e: AuthError| {
            debug!(%e, "session resume refused");
            "Invalid or expired session".to_string()
        })?;
    // The player may have been unloaded (process restart inside the
    // TTL window does not keep sessions, but a crashed world might);
    // bring the save along just in case.
    let save = load_save(app, &resumed.name).await?;
    finish_enter(conn, addr, app, resumed.name, save, None).await
}

async fn try_credentials(
    conn: &Arc<Connection>,
    addr: &SocketAddr,
    app: &AppState,
    name: String,
    password: String,
) -> Result<(ObjId, String), String> {
    if !valid_player_name(&name) {
        return Err("Invalid name".to_string());
    }
    let adapter = app.adapter.clone();
    let check_name = name.clone();
    let check = tokio::task::spawn_blocking(move || {
        check_credentials(adapter.as_ref(), &check_name, &password)
    })
    .await
    .map_err(|_| "Authentication failed".to_string())??;

    finish_enter(conn, addr, app, name, check.save, check.fresh_hash).await
}

async fn finish_enter(
    conn: &Arc<Connection>,
    addr: &SocketAddr,
    app: &AppState,
    name: String,
    save: Option<Value>,
    fresh_hash: Option<String>,
) -> Result<(ObjId, String), String> {
    let session = Arc::new(WsSession::new(conn.clone()));
    let player = app
        .world
        .enter_world(name.clone(), save, fresh_hash, session)
        .map_err(|e| e.to_string())?
        .await
        .map_err(|_| "The world is not available".to_string())?
        .map_err(|e| e.to_string())?;

    send_auth_result(conn, AuthResultPayload {
        ok: true,
        name: Some(name.clone()),
        message: None,
    });
    match app.sessions.mint(&name, conn.connection_id, addr.ip()) {
        Ok(token) => {
            let payload = SessionPayload {
                token,
                expires_ms: super::now_ms() + app.session_ttl.as_millis() as u64,
            };
            if let Ok(bytes) = encode_frame(FrameType::Session, &payload) {
                conn.send_bytes(bytes);
            }
        }
        Err(e) => warn!(%e, "could not mint session token"),
    }
    Ok((player, name))
}

async fn read_loop(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    conn: &Arc<Connection>,
    player: ObjId,
    app: &AppState,
) {
    let shutdown = conn.shutdown_token();
    let mut warned_unknown_type = false;
    loop {
        let message = tokio::select! {
            // Termination (clean after the close frame flushes, abrupt
            // immediately) unblocks the reader even on a silent socket.
            () = shutdown.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(message)) => message,
                _ => break,
            },
        };
        let bytes = match &message {
            Message::Text(t) => t.as_bytes().to_vec(),
            Message::Binary(b) => b.to_vec(),
            Message::Pong(_) | Message::Ping(_) => {
                conn.touch();
                continue;
            }
            Message::Close(_) => break,
        };
        conn.touch();

        match decode_inbound(&bytes) {
            Ok(Inbound::Command(line)) | Ok(Inbound::Text(line)) => {
                if app.world.submit_input(player, line).is_err() {
                    break;
                }
            }
            Ok(Inbound::Ide(request)) => {
                if app.world.submit_ide(player, request).is_err() {
                    break;
                }
            }
            Ok(Inbound::Pong) => {}
            Ok(Inbound::Ping) | Ok(Inbound::Close) => {}
            Ok(Inbound::Auth(_)) | Ok(Inbound::Session(_)) => {
                debug!(connection_id = %conn.connection_id, "re-auth on live session ignored");
            }
            Err(CodecError::UnknownType(ty)) => {
                if !warned_unknown_type {
                    warned_unknown_type = true;
                    warn!(connection_id = %conn.connection_id, ty, "unknown frame type from client");
                }
            }
            Err(e) => {
                warn!(connection_id = %conn.connection_id, %e, "dropping malformed frame");
            }
        }
    }
}

fn send_auth_result(conn: &Arc<Connection>, payload: AuthResultPayload) {
    if let Ok(bytes) = encode_frame(FrameType::Auth, &payload) {
        conn.send_bytes(bytes);
    }
}

fn valid_player_name(name: &str) -> bool {
    let len = name.chars().count();
    (2..=20).contains(&len) && name.chars().all(|c| c.is_ascii_alphanumeric())
}

struct CredCheck {
    save: Option<Value>,
    fresh_hash: Option<String>,
}

async fn load_save(app: &AppState, name: &str) -> Result<Option<Value>, String> {
    let adapter = app.adapter.clone();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || adapter.load_player(&name))
        .await
        .map_err(|_| "The world is not available".to_string())?
        .map_err(|e| {
            warn!(%e, "player load failed");
            "The world is not available".to_string()
        })
}

/// Verify a password against the stored save, or mint a credential for
/// a brand-new name. Runs on the blocking pool: argon2 is deliberately
/// slow.
fn check_credentials(
    adapter: &dyn PersistenceAdapter,
    name: &str,
    password: &str,
) -> Result<CredCheck, String> {
    use argon2::password_hash::{PasswordHash, SaltString, rand_core::OsRng};
    use argon2::{Argon2, PasswordHasher, PasswordVerifier};

    let save = adapter.load_player(name).map_err(|e| {
        warn!(%e, "credential lookup failed");
        "Authentication failed".to_string()
    })?;

    match save {
        Some(save) => {
            let stored = save
                .pointer("/object/capabilities/player/credential_hash")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let parsed =
                PasswordHash::new(stored).map_err(|_| "Authentication failed".to_string())?;
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .map_err(|_| "Authentication failed".to_string())?;
            Ok(CredCheck {
                save: Some(save),
                fresh_hash: None,
            })
        }
        None => {
            // First connect under this name creates the character.
            let salt = SaltString::generate(&mut OsRng);
            let hash = Argon2::default()
                .hash_password(password.as_bytes(), &salt)
                .map_err(|_| "Authentication failed".to_string())?
                .to_string();
            Ok(CredCheck {
                save: None,
                fresh_hash: Some(hash),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_names_validated() {
        assert!(valid_player_name("alice"));
        assert!(valid_player_name("Bob2"));
        assert!(!valid_player_name("a"));
        assert!(!valid_player_name("name with spaces"));
        assert!(!valid_player_name("semi;colon"));
        assert!(!valid_player_name(&"x".repeat(21)));
    }
}
