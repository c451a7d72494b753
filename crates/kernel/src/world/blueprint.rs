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

//! Blueprints: the content-side description an object is materialized
//! from. A singleton blueprint (rooms, daemons) yields one instance that
//! `find_object`/`load_object` resolve to; non-singletons (mobs, loot)
//! are stamped out by `clone_object`.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::object::{ActionHandler, Capabilities, DestroyPolicy, WorldObject};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Blueprint {
    pub object_path: String,
    #[serde(default)]
    pub singleton: bool,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub short_desc: String,
    #[serde(default)]
    pub long_desc: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub actions: IndexMap<String, ActionHandler>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub destroy_policy: DestroyPolicy,
    #[serde(default)]
    pub heartbeat: bool,
}

impl Blueprint {
    pub fn materialize(&self) -> WorldObject {
        let mut obj = WorldObject::new(&self.object_path, &self.name);
        for alias in &self.aliases {
            obj.add_alias(alias);
        }
        obj.short_desc = if self.short_desc.is_empty() {
            self.name.clone()
        } else {
            self.short_desc.clone()
        };
        obj.long_desc = self.long_desc.clone();
        obj.props = self.props.clone();
        obj.actions = self.actions.clone();
        obj.capabilities = self.capabilities.clone();
        obj.destroy_policy = self.destroy_policy;
        obj
    }
}

#[derive(Default)]
pub struct BlueprintRegistry {
    by_path: HashMap<String, Blueprint>,
}

impl BlueprintRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the blueprint at its object path.
    pub fn register(&mut self, blueprint: Blueprint) {
        self.by_path
            .insert(blueprint.object_path.clone(), blueprint);
    }

    #[must_use]
    pub fn get(&self, object_path: &str) -> Option<&Blueprint> {
        self.by_path.get(object_path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}
