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

//! Typed payloads for the registered frame set. Field names here are the
//! wire contract with the web client; renames are coordinated changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ObjId;

// Inbound ---------------------------------------------------------------

/// `AUTH` body: either name+password or a resumable session token.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionResume {
    pub token: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdeAction {
    Open,
    Save,
    Close,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdeRequest {
    pub action: IdeAction,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

// Outbound --------------------------------------------------------------

/// Heartbeat data frame. Exists specifically to satisfy intermediary idle
/// timeouts that ignore WebSocket ping frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimePayload {
    pub server_ms: u64,
    pub game_version: String,
}

/// In-world clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameTimePayload {
    pub epoch: u64,
    pub day: u32,
    pub hour: u8,
    pub minute: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    pub level: u32,
    pub hp: i64,
    pub max_hp: i64,
    pub mp: i64,
    pub max_mp: i64,
    pub xp: u64,
    pub xp_to_level: u64,
    pub gold: i64,
    pub banked_gold: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_portrait: Option<String>,
    pub encumbrance_percent: f32,
    pub carried_weight: f32,
    pub max_carry_weight: f32,
}

/// `MAP` union. Data-heavy bodies (world geometry, biome grids) stay as
/// JSON values; the core routes them, content defines them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapPayload {
    AreaChange {
        area: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    Move {
        x: i32,
        y: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        z: Option<i32>,
    },
    WorldData {
        data: Value,
    },
    BiomeArea {
        data: Value,
    },
    BiomeWorld {
        data: Value,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CombatPayload {
    TargetUpdate {
        target: ObjId,
        name: String,
        hp_percent: f32,
    },
    TargetClear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub token: String,
    pub expires_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthResultPayload {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdeSaveResultPayload {
    pub path: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Visible-verb set for client tab completion.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionPayload {
    pub verbs: Vec<String>,
}

/// Worn equipment by slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EquipmentPayload {
    pub slots: std::collections::BTreeMap<String, EquipmentEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquipmentEntry {
    pub id: ObjId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SoundPayload {
    pub sound: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(default)]
    pub looped: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommPayload {
    pub channel: String,
    pub from: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stats_wire_names_are_camel_case() {
        let stats = StatsPayload {
            level: 3,
            hp: 40,
            max_hp: 50,
            mp: 10,
            max_mp: 20,
            xp: 900,
            xp_to_level: 1200,
            gold: 17,
            banked_gold: 400,
            avatar: None,
            profile_portrait: None,
            encumbrance_percent: 12.5,
            carried_weight: 10.0,
            max_carry_weight: 80.0,
        };
        let v = serde_json::to_value(&stats).unwrap();
        assert_eq!(v["maxHp"], 50);
        assert_eq!(v["xpToLevel"], 1200);
        assert_eq!(v["bankedGold"], 400);
        assert_eq!(v["encumbrancePercent"], 12.5);
        assert!(v.get("avatar").is_none());
    }

    #[test]
    fn map_union_tags() {
        let m = MapPayload::AreaChange {
            area: "emberfall/glade".into(),
            display_name: Some("The Glade".into()),
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["type"], "area_change");

        let m = MapPayload::Move { x: 3, y: -1, z: None };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["type"], "move");
        assert!(v.get("z").is_none());
    }

    #[test]
    fn combat_union_tags() {
        let c = CombatPayload::TargetClear;
        assert_eq!(serde_json::to_value(&c).unwrap()["type"], "target_clear");
    }
}
