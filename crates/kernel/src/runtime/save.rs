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

//! Player save extraction and restoration. A save is the player object
//! plus its carried subtree; runtime ids are process-local, so saves
//! carry structure, not ids, and restoration assigns fresh ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ember_common::ObjId;

use crate::object::WorldObject;
use crate::world::{World, WorldError};

#[derive(Serialize, Deserialize)]
struct SaveNode {
    object: WorldObject,
    #[serde(default)]
    children: Vec<SaveNode>,
}

fn subtree(world: &World, id: ObjId) -> Option<SaveNode> {
    let obj = world.get(id)?;
    let mut node = SaveNode {
        object: obj.clone(),
        children: vec![],
    };
    // Structure travels via the children list; the id fields in the
    // stored copy are dead weight, zeroed for cleanliness.
    node.object.id = ObjId::NONE;
    node.object.environment = None;
    node.object.inventory.clear();
    for &child in &obj.inventory {
        if let Some(child_node) = subtree(world, child) {
            node.children.push(child_node);
        }
    }
    Some(node)
}

/// Extract a player's save document: `(lowercased name, payload)`.
#[must_use]
pub fn player_to_save(world: &World, player: ObjId) -> Option<(String, Value)> {
    let obj = world.get(player)?;
    let name = obj.capabilities.player.as_ref()?.name.to_lowercase();
    let node = subtree(world, player)?;
    let payload = serde_json::to_value(&node).ok()?;
    Some((name, payload))
}

fn restore_node(world: &mut World, node: SaveNode) -> Result<ObjId, WorldError> {
    let id = world.register(node.object);
    for child in node.children {
        let child_id = restore_node(world, child)?;
        world.move_to(child_id, Some(id))?;
    }
    Ok(id)
}

/// Restore a player (and carried items) from a save document. The player
/// lands in the void; entering the world places them.
pub fn player_from_save(world: &mut World, payload: &Value) -> Result<ObjId, WorldError> {
    let node: SaveNode = serde_json::from_value(payload.clone())
        .map_err(|e| WorldError::InvariantViolation(format!("unreadable player save: {e}")))?;
    if node.object.capabilities.player.is_none() {
        return Err(WorldError::InvariantViolation(
            "player save does not contain a player".to_string(),
        ));
    }
    restore_node(world, node)
}
