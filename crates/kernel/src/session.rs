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

//! The seam between the world and a client connection.
//!
//! The world side only ever talks to a `Session`; the network host
//! implements it over the connection's atomic writer. Implementations
//! live in the daemon crate; the Noop and Mock versions here serve tests
//! and background execution.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use ember_common::{DisconnectReason, FrameType, ObjId};

use crate::object::PlayerState;
use crate::world::World;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is detached")]
    Detached,
    #[error("could not deliver to connection")]
    DeliveryError,
}

pub trait Session: Send + Sync {
    /// Narrative output, no trailing newline added.
    fn send_text(&self, text: &str) -> Result<(), SessionError>;

    /// Narrative output as one line.
    fn send_line(&self, line: &str) -> Result<(), SessionError> {
        self.send_text(&format!("{line}\r\n"))
    }

    /// One typed frame, written atomically.
    fn send_frame(&self, ty: FrameType, payload: Value) -> Result<(), SessionError>;

    /// Ask the connection layer to close with the given reason.
    fn disconnect(&self, reason: DisconnectReason) -> Result<(), SessionError>;

    fn connection_id(&self) -> Uuid;

    /// Seconds this session's connection has been open. Sessions with
    /// no real connection behind them report zero.
    fn connected_seconds(&self) -> f64 {
        0.0
    }

    /// Seconds since the last inbound activity on the connection.
    fn idle_seconds(&self) -> f64 {
        0.0
    }
}

/// Binds players to live sessions. Non-destructive on unbind: the player
/// object survives and may be rebound (session resume). Output addressed
/// to an unbound player is silently discarded, which is exactly the
/// contract for writes racing a disconnect.
#[derive(Default)]
pub struct SessionBinder {
    bindings: HashMap<ObjId, Binding>,
}

struct Binding {
    session: Arc<dyn Session>,
    since: Instant,
}

impl SessionBinder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a player to a session, returning the previously bound
    /// session if there was one (resume closes it).
    pub fn bind(&mut self, player: ObjId, session: Arc<dyn Session>) -> Option<Arc<dyn Session>> {
        let prev = self.bindings.insert(
            player,
            Binding {
                session,
                since: Instant::now(),
            },
        );
        prev.map(|b| b.session)
    }

    /// Drop the binding and return the session span for play-time
    /// accounting.
    pub fn unbind(&mut self, player: ObjId) -> Option<Duration> {
        self.bindings.remove(&player).map(|b| b.since.elapsed())
    }

    #[must_use]
    pub fn session(&self, player: ObjId) -> Option<&Arc<dyn Session>> {
        self.bindings.get(&player).map(|b| &b.session)
    }

    #[must_use]
    pub fn is_bound(&self, player: ObjId) -> bool {
        self.bindings.contains_key(&player)
    }

    pub fn bound_players(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.bindings.keys().copied()
    }

    /// Send a line; detached players swallow it.
    pub fn send_line(&self, player: ObjId, line: &str) {
        if let Some(session) = self.session(player) {
            let _ = session.send_line(line);
        }
    }

    pub fn send_text(&self, player: ObjId, text: &str) {
        if let Some(session) = self.session(player) {
            let _ = session.send_text(text);
        }
    }

    pub fn send_frame(&self, player: ObjId, ty: FrameType, payload: Value) {
        if let Some(session) = self.session(player) {
            let _ = session.send_frame(ty, payload);
        }
    }

    /// Build and send the player's STATS frame from their current world
    /// state.
    pub fn emit_stats(&self, world: &World, player: ObjId) {
        let Some(obj) = world.get(player) else {
            return;
        };
        let (Some(ps), Some(living)) = (
            obj.capabilities.player.as_ref(),
            obj.capabilities.living.as_ref(),
        ) else {
            return;
        };
        let payload = stats_payload(ps, living);
        self.send_frame(
            player,
            FrameType::Stats,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        );
    }
}

fn stats_payload(
    ps: &PlayerState,
    living: &crate::object::LivingState,
) -> ember_common::proto::payloads::StatsPayload {
    let max_carry = 10.0 + living.effective_stats().strength as f32 * 5.0;
    ember_common::proto::payloads::StatsPayload {
        level: ps.level,
        hp: living.hp,
        max_hp: living.max_hp,
        mp: living.mp,
        max_mp: living.max_mp,
        xp: ps.experience,
        xp_to_level: xp_to_level(ps.level),
        gold: ps.gold,
        banked_gold: ps.banked_gold,
        avatar: None,
        profile_portrait: None,
        encumbrance_percent: if max_carry > 0.0 {
            (living.encumbrance / max_carry * 100.0).min(100.0)
        } else {
            0.0
        },
        carried_weight: living.encumbrance,
        max_carry_weight: max_carry,
    }
}

/// Experience required to finish the given level.
#[must_use]
pub fn xp_to_level(level: u32) -> u64 {
    // Quadratic curve, tuned to feel close to the classic table.
    let l = level as u64 + 1;
    l * l * 100
}

/// No-op session for background or test execution.
#[derive(Default)]
pub struct NoopSession {
    id: Uuid,
}

impl NoopSession {
    #[must_use]
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Session for NoopSession {
    fn send_text(&self, _text: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn send_frame(&self, _ty: FrameType, _payload: Value) -> Result<(), SessionError> {
        Ok(())
    }

    fn disconnect(&self, _reason: DisconnectReason) -> Result<(), SessionError> {
        Ok(())
    }

    fn connection_id(&self) -> Uuid {
        self.id
    }
}

/// Collects everything sent through it, so tests can assert on output.
pub struct MockSession {
    id: Uuid,
    inner: RwLock<MockInner>,
}

#[derive(Default)]
struct MockInner {
    text: Vec<String>,
    frames: Vec<(FrameType, Value)>,
    disconnected: Option<DisconnectReason>,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: RwLock::new(MockInner::default()),
        }
    }

    #[must_use]
    pub fn text(&self) -> Vec<String> {
        self.inner.read().unwrap().text.clone()
    }

    /// All narrative output joined, for substring assertions.
    #[must_use]
    pub fn transcript(&self) -> String {
        self.inner.read().unwrap().text.join("")
    }

    #[must_use]
    pub fn frames(&self) -> Vec<(FrameType, Value)> {
        self.inner.read().unwrap().frames.clone()
    }

    #[must_use]
    pub fn disconnected(&self) -> Option<DisconnectReason> {
        self.inner.read().unwrap().disconnected
    }
}

impl Session for MockSession {
    fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.inner.write().unwrap().text.push(text.to_string());
        Ok(())
    }

    fn send_frame(&self, ty: FrameType, payload: Value) -> Result<(), SessionError> {
        self.inner.write().unwrap().frames.push((ty, payload));
        Ok(())
    }

    fn disconnect(&self, reason: DisconnectReason) -> Result<(), SessionError> {
        self.inner.write().unwrap().disconnected = Some(reason);
        Ok(())
    }

    fn connection_id(&self) -> Uuid {
        self.id
    }
}
