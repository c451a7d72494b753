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

//! The Player capability. A player is a Living with a credential, a
//! permission level, progression state, and the connection-facing
//! machinery: the input-handler stack and the throttled input queue.
//! The bound connection itself lives in the session binder, not here;
//! the player object survives disconnection and may be rebound.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ember_common::PermissionLevel;

/// Cap on queued-but-unprocessed input lines per player. Overflow drops
/// the oldest line and warns the player.
pub const INPUT_QUEUE_CAP: usize = 64;

/// An entry on the player's input-handler stack. The top entry sees each
/// input line before normal command parsing; a handler pops itself to
/// yield control back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputHandlerEntry {
    /// A suspended command awaiting one line (confirmation prompts,
    /// interactive questions). Consumes exactly one line, then pops.
    LineRequest { request_id: Uuid, prompt: String },
    /// An IDE editor session. IDE frames address it; plain lines pass
    /// through to command parsing.
    Editor { path: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlayerState {
    pub name: String,
    /// Argon2 PHC string; verified at the connection layer during AUTH.
    pub credential_hash: String,
    pub permission: PermissionLevel,
    pub experience: u64,
    pub level: u32,
    pub gold: i64,
    pub banked_gold: i64,
    /// Accumulated across sessions; the live session's span is added at
    /// unbind time.
    #[serde(with = "millis")]
    pub play_time: Duration,
    /// Opt-in heartbeat UI stream: a STATS frame after each tick pass.
    #[serde(default)]
    pub monitor: bool,

    // Runtime-only state, rebuilt empty at bind time.
    #[serde(skip)]
    pub input_stack: Vec<InputHandlerEntry>,
    #[serde(skip)]
    pub input_queue: VecDeque<String>,
    /// One in-flight command per player; further input queues.
    #[serde(skip)]
    pub command_in_flight: bool,
    #[serde(skip)]
    pub prompt_enabled: bool,
}

mod millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

impl PlayerState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt_enabled: true,
            ..Default::default()
        }
    }

    /// Queue one input line. Returns the dropped oldest line when the
    /// queue was full, so the caller can warn the player.
    pub fn queue_input(&mut self, line: String) -> Option<String> {
        let dropped = if self.input_queue.len() >= INPUT_QUEUE_CAP {
            self.input_queue.pop_front()
        } else {
            None
        };
        self.input_queue.push_back(line);
        dropped
    }

    pub fn push_input_handler(&mut self, entry: InputHandlerEntry) {
        self.input_stack.push(entry);
    }

    pub fn pop_input_handler(&mut self) -> Option<InputHandlerEntry> {
        self.input_stack.pop()
    }

    #[must_use]
    pub fn top_input_handler(&self) -> Option<&InputHandlerEntry> {
        self.input_stack.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_queue_drops_oldest_on_overflow() {
        let mut p = PlayerState::new("alice");
        for i in 0..INPUT_QUEUE_CAP {
            assert_eq!(p.queue_input(format!("cmd {i}")), None);
        }
        let dropped = p.queue_input("one too many".into());
        assert_eq!(dropped.as_deref(), Some("cmd 0"));
        assert_eq!(p.input_queue.len(), INPUT_QUEUE_CAP);
        assert_eq!(p.input_queue.back().map(String::as_str), Some("one too many"));
    }

    #[test]
    fn runtime_state_not_persisted() {
        let mut p = PlayerState::new("alice");
        p.push_input_handler(InputHandlerEntry::Editor {
            path: "areas/glade.js".into(),
        });
        p.queue_input("look".into());
        p.command_in_flight = true;

        let json = serde_json::to_value(&p).unwrap();
        let back: PlayerState = serde_json::from_value(json).unwrap();
        assert!(back.input_stack.is_empty());
        assert!(back.input_queue.is_empty());
        assert!(!back.command_in_flight);
    }

    #[test]
    fn play_time_round_trips_as_millis() {
        let mut p = PlayerState::new("alice");
        p.play_time = Duration::from_secs(3600);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["play_time"], 3_600_000);
        let back: PlayerState = serde_json::from_value(json).unwrap();
        assert_eq!(back.play_time, p.play_time);
    }
}
