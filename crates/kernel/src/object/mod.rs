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

//! The universal world node. Content describes rooms, items, NPCs,
//! weapons, containers and so on by specialization; here that becomes a
//! set of capabilities an object carries rather than a class hierarchy.
//! Code asks "does this object have the Container capability" instead of
//! probing for property names.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ember_common::ObjId;

pub use living::{Effect, EffectTick, LivingState, Posture, Stats};
pub use player::{INPUT_QUEUE_CAP, InputHandlerEntry, PlayerState};

mod living;
mod player;

/// What happens to an object's inventory when it is destroyed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyPolicy {
    /// Children are moved to the destroyed object's environment (or the
    /// void when it had none).
    #[default]
    ReparentInventory,
    /// Children are destroyed with it (corpses, temporary containers).
    DestroyInventory,
}

/// How an action/hook on an object is carried out when dispatched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionHandler {
    /// A content script, run in the sandbox against the named export.
    Script { module: String, export: String },
    /// A handler built into the server, dispatched by name.
    Builtin { name: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContainerState {
    pub is_open: bool,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EquippableState {
    pub slot: String,
}

/// The capability set an object implements. The "class" of a content
/// object is exactly this set plus its property bag.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equippable: Option<EquippableState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub living: Option<LivingState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerState>,
    /// Process-wide singleton, owned jointly by the daemon registry.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub daemon: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorldObject {
    pub id: ObjId,
    /// Blueprint id this object was materialized from.
    pub object_path: String,
    pub short_desc: String,
    pub long_desc: String,
    /// Canonical name; always matched by `id()`.
    canonical_name: String,
    /// Aliases, stored lowercased.
    names: Vec<String>,
    /// Ordered children. Invariant: `env(child) == Some(self.id)`.
    pub inventory: Vec<ObjId>,
    /// The one object containing this one.
    pub environment: Option<ObjId>,
    pub props: Map<String, Value>,
    /// Per-object action table, verb -> handler. Missing hooks are
    /// no-ops, never errors.
    pub actions: IndexMap<String, ActionHandler>,
    pub capabilities: Capabilities,
    pub destroy_policy: DestroyPolicy,
    /// Mirror of membership in the scheduler's opt-in set.
    pub heartbeat_enabled: bool,
}

impl WorldObject {
    pub fn new(object_path: impl Into<String>, canonical_name: impl Into<String>) -> Self {
        let canonical_name = canonical_name.into();
        Self {
            id: ObjId::NONE,
            object_path: object_path.into(),
            short_desc: canonical_name.clone(),
            long_desc: String::new(),
            canonical_name,
            names: vec![],
            inventory: vec![],
            environment: None,
            props: Map::new(),
            actions: IndexMap::new(),
            capabilities: Capabilities::default(),
            destroy_policy: DestroyPolicy::default(),
            heartbeat_enabled: false,
        }
    }

    #[must_use]
    pub fn canonical_name(&self) -> &str {
        &self.canonical_name
    }

    pub fn add_alias(&mut self, alias: &str) {
        let alias = alias.to_lowercase();
        if !self.names.contains(&alias) {
            self.names.push(alias);
        }
    }

    /// All names this object answers to, lowercased, canonical first.
    pub fn match_names(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.canonical_name.to_lowercase()).chain(self.names.iter().cloned())
    }

    /// Case-insensitive id matching against the canonical name and all
    /// aliases. Always true for the canonical name.
    #[must_use]
    pub fn id_match(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.canonical_name.to_lowercase() == name || self.names.iter().any(|n| *n == name)
    }

    #[must_use]
    pub fn is_living(&self) -> bool {
        self.capabilities.living.is_some()
    }

    #[must_use]
    pub fn is_player(&self) -> bool {
        self.capabilities.player.is_some()
    }

    /// Whether this object admits `_incoming` into its inventory. Rooms
    /// and open containers admit; closed or locked containers refuse.
    /// Objects with neither capability admit by default (the void rule).
    #[must_use]
    pub fn admits(&self, _incoming: ObjId) -> bool {
        match &self.capabilities.container {
            Some(container) => container.is_open && !container.locked,
            None => true,
        }
    }

    pub fn set_prop(&mut self, key: &str, value: Value) {
        self.props.insert(key.to_string(), value);
    }

    #[must_use]
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_match_is_case_insensitive_and_reflexive() {
        let mut deer = WorldObject::new("npcs/deer", "Deer");
        deer.add_alias("stag");

        assert!(deer.id_match("deer"));
        assert!(deer.id_match("DEER"));
        assert!(deer.id_match("Deer"));
        assert!(deer.id_match("stag"));
        assert!(deer.id_match("STAG"));
        assert!(!deer.id_match("wolf"));
        // Reflexivity over the canonical name, exactly as stored.
        assert!(deer.id_match(deer.canonical_name()));
    }

    #[test]
    fn closed_container_refuses_admission() {
        let mut chest = WorldObject::new("items/chest", "chest");
        chest.capabilities.container = Some(ContainerState {
            is_open: false,
            locked: false,
            capacity: None,
        });
        assert!(!chest.admits(ObjId(5)));

        chest.capabilities.container.as_mut().unwrap().is_open = true;
        assert!(chest.admits(ObjId(5)));

        chest.capabilities.container.as_mut().unwrap().locked = true;
        assert!(!chest.admits(ObjId(5)));
    }

    #[test]
    fn plain_objects_admit() {
        let room = WorldObject::new("areas/glade", "glade");
        assert!(room.admits(ObjId(9)));
    }

    #[test]
    fn aliases_dedupe() {
        let mut o = WorldObject::new("items/sword", "sword");
        o.add_alias("Blade");
        o.add_alias("blade");
        assert_eq!(o.match_names().collect::<Vec<_>>(), vec!["sword", "blade"]);
    }
}
