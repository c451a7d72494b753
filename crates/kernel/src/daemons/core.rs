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

//! The core daemon set. Each carries the state shape and the
//! serialize/restore contract; the deep business logic on top (economy
//! rules, dialogue trees, biome generation) belongs to content, which
//! reaches these through the registry.

use std::any::Any;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ember_common::{ObjId, PermissionLevel};

use super::{Daemon, DaemonError, RestorePolicy};

/// The declared boot order. Network opens only after all of these are
/// ready; shutdown serializes them in reverse.
pub fn core_daemons() -> Vec<Box<dyn Daemon>> {
    vec![
        Box::new(ConfigDaemon::default()),
        Box::new(PermissionsDaemon::default()),
        Box::new(ChannelsDaemon::default()),
        Box::new(MapDaemon::default()),
        Box::new(QuestDaemon::default()),
        Box::new(CombatDaemon::default()),
        Box::new(PetDaemon::default()),
        Box::new(LoreDaemon::default()),
        Box::new(PromptsDaemon::default()),
    ]
}

fn restore_typed<T: for<'de> Deserialize<'de>>(
    id: &'static str,
    data: Value,
) -> Result<T, DaemonError> {
    serde_json::from_value(data).map_err(|e| DaemonError::RestoreFailed {
        id: id.to_string(),
        cause: e.to_string(),
    })
}

macro_rules! daemon_boilerplate {
    ($ty:ty, $id:literal) => {
        fn id(&self) -> &'static str {
            $id
        }

        fn serialize(&self) -> Value {
            serde_json::to_value(&self.state).unwrap_or(Value::Null)
        }

        fn restore(&mut self, data: Value) -> Result<(), DaemonError> {
            self.state = restore_typed($id, data)?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    };
}

// config ----------------------------------------------------------------

/// Server-wide configuration values exposed to content and to the
/// `/api/config` endpoint.
#[derive(Default)]
pub struct ConfigDaemon {
    state: ConfigState,
}

#[derive(Default, Serialize, Deserialize)]
struct ConfigState {
    values: Map<String, Value>,
}

impl ConfigDaemon {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.state.values.insert(key.to_string(), value);
    }

    #[must_use]
    pub fn all(&self) -> &Map<String, Value> {
        &self.state.values
    }
}

impl Daemon for ConfigDaemon {
    daemon_boilerplate!(ConfigDaemon, "config");
}

// permissions -----------------------------------------------------------

/// Permission levels by player name. The world cannot run with this
/// state unreadable, so a bad restore aborts boot.
#[derive(Default)]
pub struct PermissionsDaemon {
    state: PermissionsState,
}

#[derive(Default, Serialize, Deserialize)]
struct PermissionsState {
    levels: HashMap<String, PermissionLevel>,
}

impl PermissionsDaemon {
    #[must_use]
    pub fn level_for(&self, name: &str) -> PermissionLevel {
        self.state
            .levels
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or_default()
    }

    pub fn set_level(&mut self, name: &str, level: PermissionLevel) {
        self.state.levels.insert(name.to_lowercase(), level);
    }
}

impl Daemon for PermissionsDaemon {
    daemon_boilerplate!(PermissionsDaemon, "permissions");

    fn restore_policy(&self) -> RestorePolicy {
        RestorePolicy::AbortBoot
    }
}

// channels --------------------------------------------------------------

/// Chat channel membership, by player name.
#[derive(Default)]
pub struct ChannelsDaemon {
    state: ChannelsState,
}

#[derive(Default, Serialize, Deserialize)]
struct ChannelsState {
    members: HashMap<String, HashSet<String>>,
}

impl ChannelsDaemon {
    pub fn join(&mut self, channel: &str, player: &str) {
        self.state
            .members
            .entry(channel.to_string())
            .or_default()
            .insert(player.to_lowercase());
    }

    pub fn leave(&mut self, channel: &str, player: &str) {
        if let Some(members) = self.state.members.get_mut(channel) {
            members.remove(&player.to_lowercase());
            if members.is_empty() {
                self.state.members.remove(channel);
            }
        }
    }

    #[must_use]
    pub fn members(&self, channel: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .state
            .members
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }
}

impl Daemon for ChannelsDaemon {
    daemon_boilerplate!(ChannelsDaemon, "channels");
}

// map -------------------------------------------------------------------

/// Area geometry registered by content; serves MAP world_data frames.
#[derive(Default)]
pub struct MapDaemon {
    state: MapState,
}

#[derive(Default, Serialize, Deserialize)]
struct MapState {
    areas: Map<String, Value>,
}

impl MapDaemon {
    pub fn set_area(&mut self, area: &str, data: Value) {
        self.state.areas.insert(area.to_string(), data);
    }

    #[must_use]
    pub fn area(&self, area: &str) -> Option<&Value> {
        self.state.areas.get(area)
    }
}

impl Daemon for MapDaemon {
    daemon_boilerplate!(MapDaemon, "map");
}

// quest -----------------------------------------------------------------

/// Quest progression per player, keyed by quest id.
#[derive(Default)]
pub struct QuestDaemon {
    state: QuestState,
}

#[derive(Default, Serialize, Deserialize)]
struct QuestState {
    progress: HashMap<String, HashMap<String, u32>>,
}

impl QuestDaemon {
    #[must_use]
    pub fn stage(&self, player: &str, quest: &str) -> u32 {
        self.state
            .progress
            .get(&player.to_lowercase())
            .and_then(|q| q.get(quest))
            .copied()
            .unwrap_or(0)
    }

    /// Advance only forward; a stale write can't regress a quest.
    pub fn advance(&mut self, player: &str, quest: &str, stage: u32) -> u32 {
        let entry = self
            .state
            .progress
            .entry(player.to_lowercase())
            .or_default()
            .entry(quest.to_string())
            .or_insert(0);
        *entry = (*entry).max(stage);
        *entry
    }
}

impl Daemon for QuestDaemon {
    daemon_boilerplate!(QuestDaemon, "quest");
}

// combat ----------------------------------------------------------------

/// Active engagements. Pure runtime state, but serialized anyway so a
/// snapshot taken mid-fight restores the pairing.
#[derive(Default)]
pub struct CombatDaemon {
    state: CombatState,
}

#[derive(Default, Serialize, Deserialize)]
struct CombatState {
    engagements: Vec<(ObjId, ObjId)>,
}

impl CombatDaemon {
    pub fn engage(&mut self, attacker: ObjId, defender: ObjId) {
        if !self.is_engaged(attacker, defender) {
            self.state.engagements.push((attacker, defender));
        }
    }

    pub fn disengage(&mut self, a: ObjId, b: ObjId) {
        self.state
            .engagements
            .retain(|&(x, y)| !((x == a && y == b) || (x == b && y == a)));
    }

    /// Drop every engagement involving a destroyed combatant.
    pub fn drop_combatant(&mut self, obj: ObjId) {
        self.state
            .engagements
            .retain(|&(x, y)| x != obj && y != obj);
    }

    #[must_use]
    pub fn is_engaged(&self, a: ObjId, b: ObjId) -> bool {
        self.state
            .engagements
            .iter()
            .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

impl Daemon for CombatDaemon {
    daemon_boilerplate!(CombatDaemon, "combat");
}

// pet -------------------------------------------------------------------

/// Pet ownership: pet object path by owner name. The live pet objects
/// are world state; this records who gets theirs respawned at login.
#[derive(Default)]
pub struct PetDaemon {
    state: PetState,
}

#[derive(Default, Serialize, Deserialize)]
struct PetState {
    pets: HashMap<String, String>,
}

impl PetDaemon {
    pub fn set_pet(&mut self, owner: &str, object_path: &str) {
        self.state
            .pets
            .insert(owner.to_lowercase(), object_path.to_string());
    }

    #[must_use]
    pub fn pet_of(&self, owner: &str) -> Option<&str> {
        self.state.pets.get(&owner.to_lowercase()).map(String::as_str)
    }
}

impl Daemon for PetDaemon {
    daemon_boilerplate!(PetDaemon, "pet");
}

// lore ------------------------------------------------------------------

/// World lore entries, content-authored and AI-augmented.
#[derive(Default)]
pub struct LoreDaemon {
    state: LoreState,
}

#[derive(Default, Serialize, Deserialize)]
struct LoreState {
    entries: Map<String, Value>,
}

impl LoreDaemon {
    pub fn add_entry(&mut self, key: &str, entry: Value) {
        self.state.entries.insert(key.to_string(), entry);
    }

    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&Value> {
        self.state.entries.get(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.state.entries.keys().map(String::as_str).collect()
    }
}

impl Daemon for LoreDaemon {
    daemon_boilerplate!(LoreDaemon, "lore");
}

// prompts ---------------------------------------------------------------

/// Prompt templates for AI generation calls.
#[derive(Default)]
pub struct PromptsDaemon {
    state: PromptsState,
}

#[derive(Default, Serialize, Deserialize)]
struct PromptsState {
    templates: Map<String, Value>,
}

impl PromptsDaemon {
    pub fn set_template(&mut self, name: &str, template: &str) {
        self.state
            .templates
            .insert(name.to_string(), Value::String(template.to_string()));
    }

    #[must_use]
    pub fn template(&self, name: &str) -> Option<&str> {
        self.state.templates.get(name).and_then(Value::as_str)
    }
}

impl Daemon for PromptsDaemon {
    daemon_boilerplate!(PromptsDaemon, "prompts");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn combat_engagement_is_symmetric() {
        let mut combat = CombatDaemon::default();
        let (a, b) = (ObjId(1), ObjId(2));
        combat.engage(a, b);
        assert!(combat.is_engaged(a, b));
        assert!(combat.is_engaged(b, a));

        // Re-engaging doesn't duplicate.
        combat.engage(b, a);
        combat.disengage(a, b);
        assert!(!combat.is_engaged(a, b));
    }

    #[test]
    fn quest_progress_never_regresses() {
        let mut quest = QuestDaemon::default();
        quest.advance("Alice", "fetch-herbs", 3);
        assert_eq!(quest.advance("alice", "fetch-herbs", 1), 3);
        assert_eq!(quest.stage("ALICE", "fetch-herbs"), 3);
    }

    #[test]
    fn channels_membership_round_trip() {
        let mut channels = ChannelsDaemon::default();
        channels.join("gossip", "Alice");
        channels.join("gossip", "bob");
        assert_eq!(channels.members("gossip"), vec!["alice", "bob"]);

        channels.leave("gossip", "ALICE");
        assert_eq!(channels.members("gossip"), vec!["bob"]);
    }

    #[test]
    fn serialize_restore_round_trip() {
        let mut lore = LoreDaemon::default();
        lore.add_entry("sundering", json!({"title": "The Sundering"}));
        let state = Daemon::serialize(&lore);

        let mut restored = LoreDaemon::default();
        restored.restore(state).unwrap();
        assert_eq!(
            restored.entry("sundering").unwrap()["title"],
            "The Sundering"
        );
    }
}
