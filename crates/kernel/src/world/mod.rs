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

//! The object registry and environment/inventory graph.
//!
//! The world exclusively owns every registered object. Containment is a
//! DAG maintained under two invariants: `env(o) = p` iff `o` is in
//! `inventory(p)`, and no object transitively contains itself. All other
//! cross-object references are id-indexed and validated on use, so a
//! destroyed object leaves no dangling pointer, only lookups that miss.

use std::collections::HashMap;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::warn;

use ember_common::ObjId;

use crate::object::{ActionHandler, WorldObject};

pub use blueprint::{Blueprint, BlueprintRegistry};
pub use matching::{TargetResolution, resolve_target};

mod blueprint;
mod matching;

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("no such object: {0}")]
    NotFound(ObjId),
    #[error("no blueprint at {0:?}")]
    BlueprintNotFound(String),
    #[error("cannot move an object into itself")]
    SelfContainment,
    #[error("move would create a containment cycle")]
    WouldCycle,
    #[error("{0} refused admission")]
    AdmissionRefused(ObjId),
    #[error("world state invariant broken: {0}")]
    InvariantViolation(String),
}

/// A hook that fell due during a graph mutation. Dispatch is the
/// runtime's job; missing hooks never get this far.
#[derive(Clone, Debug, PartialEq)]
pub struct HookInvocation {
    /// The object whose action table held the hook.
    pub target: ObjId,
    pub hook: String,
    pub handler: ActionHandler,
    pub args: Vec<Value>,
}

/// The ordered hook fallout of one `move_to`.
pub type MoveHooks = SmallVec<[HookInvocation; 4]>;

#[derive(Default)]
pub struct World {
    objects: HashMap<ObjId, WorldObject>,
    next_id: u64,
    /// object_path -> instance, for singleton blueprints only.
    path_index: HashMap<String, ObjId>,
    /// lowercased name -> instances answering to it.
    name_index: HashMap<String, Vec<ObjId>>,
    /// Heartbeat opt-in set, in insertion order.
    heartbeat: IndexSet<ObjId>,
    pub blueprints: BlueprintRegistry,
}

/// Serialized world snapshot.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    next_id: u64,
    objects: Vec<WorldObject>,
    heartbeat: Vec<ObjId>,
}

impl World {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // Id 0 is the reserved "none" sentinel.
            next_id: 1,
            ..Default::default()
        }
    }

    /// Register an object, assigning its runtime id. Ids are never
    /// reused within a process lifetime.
    pub fn register(&mut self, mut obj: WorldObject) -> ObjId {
        let id = ObjId(self.next_id);
        self.next_id += 1;
        obj.id = id;
        for name in obj.match_names() {
            self.name_index.entry(name).or_default().push(id);
        }
        if let Some(bp) = self.blueprints.get(&obj.object_path) {
            if bp.singleton {
                self.path_index.insert(obj.object_path.clone(), id);
            }
        }
        if obj.heartbeat_enabled {
            self.heartbeat.insert(id);
        }
        self.objects.insert(id, obj);
        id
    }

    #[must_use]
    pub fn get(&self, id: ObjId) -> Option<&WorldObject> {
        self.objects.get(&id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut WorldObject> {
        self.objects.get_mut(&id)
    }

    #[must_use]
    pub fn contains(&self, id: ObjId) -> bool {
        self.objects.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.objects.keys().copied()
    }

    /// The loaded instance for a singleton blueprint path, if any.
    #[must_use]
    pub fn find_object(&self, object_path: &str) -> Option<ObjId> {
        self.path_index.get(object_path).copied()
    }

    /// Resolve a singleton path to its instance, materializing it from
    /// its blueprint on first use.
    pub fn load_object(&mut self, object_path: &str) -> Result<ObjId, WorldError> {
        if let Some(id) = self.find_object(object_path) {
            return Ok(id);
        }
        let Some(bp) = self.blueprints.get(object_path) else {
            return Err(WorldError::BlueprintNotFound(object_path.to_string()));
        };
        let mut obj = bp.materialize();
        obj.heartbeat_enabled = bp.heartbeat;
        let singleton = bp.singleton;
        let id = self.register(obj);
        if singleton {
            self.path_index.insert(object_path.to_string(), id);
        }
        Ok(id)
    }

    /// Stamp a fresh instance out of a blueprint, singleton or not.
    pub fn clone_object(&mut self, object_path: &str) -> Result<ObjId, WorldError> {
        let Some(bp) = self.blueprints.get(object_path) else {
            return Err(WorldError::BlueprintNotFound(object_path.to_string()));
        };
        let mut obj = bp.materialize();
        obj.heartbeat_enabled = bp.heartbeat;
        Ok(self.register(obj))
    }

    /// True when `ancestor` transitively contains `obj`.
    #[must_use]
    pub fn is_descendant_of(&self, obj: ObjId, ancestor: ObjId) -> bool {
        let mut cursor = self.get(obj).and_then(|o| o.environment);
        while let Some(env) = cursor {
            if env == ancestor {
                return true;
            }
            cursor = self.get(env).and_then(|o| o.environment);
        }
        false
    }

    /// Move `obj` into `target`'s inventory, or into the void. Atomic:
    /// on any refusal nothing has changed. Hook order on success:
    /// `on_leave(prev)` then `on_enter(new)` on the object, with mirror
    /// notifications on the two environments.
    pub fn move_to(
        &mut self,
        obj: ObjId,
        target: Option<ObjId>,
    ) -> Result<MoveHooks, WorldError> {
        if !self.contains(obj) {
            return Err(WorldError::NotFound(obj));
        }
        if let Some(target) = target {
            if target == obj {
                return Err(WorldError::SelfContainment);
            }
            let Some(target_obj) = self.get(target) else {
                return Err(WorldError::NotFound(target));
            };
            if self.is_descendant_of(target, obj) {
                return Err(WorldError::WouldCycle);
            }
            if !target_obj.admits(obj) {
                return Err(WorldError::AdmissionRefused(target));
            }
        }

        let prev = self.get(obj).and_then(|o| o.environment);
        if let Some(prev) = prev {
            if let Some(prev_obj) = self.objects.get_mut(&prev) {
                prev_obj.inventory.retain(|&child| child != obj);
            }
        }
        if let Some(target) = target {
            let target_obj = self
                .objects
                .get_mut(&target)
                .ok_or(WorldError::NotFound(target))?;
            target_obj.inventory.push(obj);
        }
        if let Some(o) = self.objects.get_mut(&obj) {
            o.environment = target;
        }

        let mut hooks = MoveHooks::new();
        self.collect_hook(&mut hooks, obj, "on_leave", vec![opt_id(prev)]);
        self.collect_hook(&mut hooks, obj, "on_enter", vec![opt_id(target)]);
        if let Some(prev) = prev {
            self.collect_hook(&mut hooks, prev, "on_object_left", vec![id_value(obj)]);
        }
        if let Some(target) = target {
            self.collect_hook(&mut hooks, target, "on_object_entered", vec![id_value(obj)]);
        }
        Ok(hooks)
    }

    fn collect_hook(&self, out: &mut MoveHooks, target: ObjId, hook: &str, args: Vec<Value>) {
        let Some(obj) = self.get(target) else {
            return;
        };
        let Some(handler) = obj.actions.get(hook) else {
            return;
        };
        out.push(HookInvocation {
            target,
            hook: hook.to_string(),
            handler: handler.clone(),
            args,
        });
    }

    /// Destroy an object. Idempotent: a second destroy of the same id is
    /// a no-op. Detaches from its environment, disposes of its inventory
    /// per its policy, cancels heartbeat, and drops it from the indexes.
    /// Afterwards the id is observably inert.
    pub fn destroy(&mut self, id: ObjId) -> MoveHooks {
        let Some(obj) = self.objects.get(&id) else {
            return MoveHooks::new();
        };
        let mut hooks = MoveHooks::new();
        self.collect_hook(&mut hooks, id, "on_destroy", vec![]);

        let env = obj.environment;
        let children = obj.inventory.clone();
        let policy = obj.destroy_policy;

        match policy {
            crate::object::DestroyPolicy::ReparentInventory => {
                for child in children {
                    match self.move_to(child, env) {
                        Ok(child_hooks) => hooks.extend(child_hooks),
                        Err(e) => warn!(?child, ?e, "could not reparent child of destroyed object"),
                    }
                }
            }
            crate::object::DestroyPolicy::DestroyInventory => {
                for child in children {
                    hooks.extend(self.destroy(child));
                }
            }
        }

        if let Some(env) = env {
            if let Some(env_obj) = self.objects.get_mut(&env) {
                env_obj.inventory.retain(|&child| child != id);
            }
        }

        let obj = self
            .objects
            .remove(&id)
            .expect("object vanished during destroy");
        for name in obj.match_names() {
            if let Some(ids) = self.name_index.get_mut(&name) {
                ids.retain(|&other| other != id);
                if ids.is_empty() {
                    self.name_index.remove(&name);
                }
            }
        }
        if self.path_index.get(&obj.object_path) == Some(&id) {
            self.path_index.remove(&obj.object_path);
        }
        self.heartbeat.shift_remove(&id);
        hooks
    }

    /// Idempotent heartbeat opt-in management. Destroying an object
    /// implicitly opts it out.
    pub fn set_heartbeat(&mut self, id: ObjId, enable: bool) {
        if !self.contains(id) {
            return;
        }
        if enable {
            self.heartbeat.insert(id);
        } else {
            self.heartbeat.shift_remove(&id);
        }
        if let Some(obj) = self.objects.get_mut(&id) {
            obj.heartbeat_enabled = enable;
        }
    }

    /// Opted-in objects, in insertion order.
    #[must_use]
    pub fn heartbeat_members(&self) -> Vec<ObjId> {
        self.heartbeat.iter().copied().collect()
    }

    /// All instances answering to a lowercased name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> &[ObjId] {
        self.name_index
            .get(&name.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The id-matching scope for a player: themselves, their inventory,
    /// their environment, and the environment's inventory.
    #[must_use]
    pub fn scope_of(&self, player: ObjId) -> Vec<ObjId> {
        let mut scope = vec![];
        let Some(obj) = self.get(player) else {
            return scope;
        };
        scope.push(player);
        scope.extend(obj.inventory.iter().copied());
        if let Some(env) = obj.environment {
            scope.push(env);
            if let Some(env_obj) = self.get(env) {
                scope.extend(
                    env_obj
                        .inventory
                        .iter()
                        .copied()
                        .filter(|&other| other != player),
                );
            }
        }
        scope
    }

    /// Verify the duality invariant over the whole graph; used by tests
    /// and the pre-snapshot sanity check.
    pub fn check_integrity(&self) -> Result<(), WorldError> {
        for (id, obj) in &self.objects {
            if let Some(env) = obj.environment {
                let Some(env_obj) = self.get(env) else {
                    return Err(WorldError::InvariantViolation(format!(
                        "{id} has dangling environment {env}"
                    )));
                };
                if !env_obj.inventory.contains(id) {
                    return Err(WorldError::InvariantViolation(format!(
                        "{id} not in inventory of its environment {env}"
                    )));
                }
            }
            for child in &obj.inventory {
                let Some(child_obj) = self.get(*child) else {
                    return Err(WorldError::InvariantViolation(format!(
                        "{id} holds dangling child {child}"
                    )));
                };
                if child_obj.environment != Some(*id) {
                    return Err(WorldError::InvariantViolation(format!(
                        "{child} in inventory of {id} but env is {:?}",
                        child_obj.environment
                    )));
                }
            }
            if self.is_descendant_of(*id, *id) {
                return Err(WorldError::InvariantViolation(format!(
                    "{id} transitively contains itself"
                )));
            }
        }
        Ok(())
    }

    /// Serialize the full graph for the world snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let mut objects: Vec<&WorldObject> = self.objects.values().collect();
        objects.sort_by_key(|o| o.id);
        let snap = Snapshot {
            next_id: self.next_id,
            objects: objects.into_iter().cloned().collect(),
            heartbeat: self.heartbeat_members(),
        };
        serde_json::to_value(&snap).unwrap_or(Value::Null)
    }

    /// Restore a graph from a snapshot, replacing current contents.
    /// Blueprints are not part of the snapshot and must already be
    /// registered.
    pub fn restore(&mut self, snapshot: &Value) -> Result<(), WorldError> {
        let snap: Snapshot = serde_json::from_value(snapshot.clone())
            .map_err(|e| WorldError::InvariantViolation(format!("unreadable snapshot: {e}")))?;
        self.objects.clear();
        self.path_index.clear();
        self.name_index.clear();
        self.heartbeat.clear();
        self.next_id = snap.next_id;

        for obj in snap.objects {
            let id = obj.id;
            for name in obj.match_names() {
                self.name_index.entry(name).or_default().push(id);
            }
            if let Some(bp) = self.blueprints.get(&obj.object_path) {
                if bp.singleton {
                    self.path_index.insert(obj.object_path.clone(), id);
                }
            }
            self.objects.insert(id, obj);
        }
        for id in snap.heartbeat {
            if self.contains(id) {
                self.heartbeat.insert(id);
            }
        }
        self.check_integrity()
    }
}

fn id_value(id: ObjId) -> Value {
    serde_json::to_value(id).unwrap_or(Value::Null)
}

fn opt_id(id: Option<ObjId>) -> Value {
    id.map(id_value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ContainerState, DestroyPolicy};

    fn world_with_room() -> (World, ObjId) {
        let mut world = World::new();
        let room = world.register(WorldObject::new("areas/glade", "glade"));
        (world, room)
    }

    #[test]
    fn register_assigns_monotonic_ids() {
        let mut world = World::new();
        let a = world.register(WorldObject::new("x/a", "a"));
        let b = world.register(WorldObject::new("x/b", "b"));
        assert!(b > a);
        assert!(!a.is_none());
    }

    #[test]
    fn move_maintains_duality() {
        let (mut world, room) = world_with_room();
        let apple = world.register(WorldObject::new("items/apple", "apple"));

        world.move_to(apple, Some(room)).unwrap();
        assert_eq!(world.get(apple).unwrap().environment, Some(room));
        assert!(world.get(room).unwrap().inventory.contains(&apple));
        world.check_integrity().unwrap();

        world.move_to(apple, None).unwrap();
        assert_eq!(world.get(apple).unwrap().environment, None);
        assert!(!world.get(room).unwrap().inventory.contains(&apple));
        world.check_integrity().unwrap();
    }

    #[test]
    fn move_is_atomic_under_refusal() {
        let (mut world, room) = world_with_room();
        let sack = world.register(WorldObject::new("items/sack", "sack"));
        let apple = world.register(WorldObject::new("items/apple", "apple"));
        world.move_to(sack, Some(room)).unwrap();
        world.move_to(apple, Some(room)).unwrap();

        // Close the sack; admission refused, nothing moves.
        world.get_mut(sack).unwrap().capabilities.container = Some(ContainerState {
            is_open: false,
            locked: false,
            capacity: None,
        });
        let err = world.move_to(apple, Some(sack)).unwrap_err();
        assert!(matches!(err, WorldError::AdmissionRefused(_)));
        assert_eq!(world.get(apple).unwrap().environment, Some(room));
        world.check_integrity().unwrap();
    }

    #[test]
    fn containment_cycle_refused() {
        let (mut world, room) = world_with_room();
        let a = world.register(WorldObject::new("items/a", "a"));
        let b = world.register(WorldObject::new("items/b", "b"));

        // R contains A, A contains B.
        world.move_to(a, Some(room)).unwrap();
        world.move_to(b, Some(a)).unwrap();

        // B into itself, A into B: both refused, A stays in R.
        assert!(matches!(
            world.move_to(b, Some(b)),
            Err(WorldError::SelfContainment)
        ));
        assert!(matches!(
            world.move_to(a, Some(b)),
            Err(WorldError::WouldCycle)
        ));
        assert_eq!(world.get(a).unwrap().environment, Some(room));
        world.check_integrity().unwrap();
    }

    #[test]
    fn env_chain_always_terminates() {
        let (mut world, room) = world_with_room();
        let mut parent = room;
        for i in 0..32 {
            let next = world.register(WorldObject::new(format!("items/box{i}"), "box"));
            world.move_to(next, Some(parent)).unwrap();
            parent = next;
        }
        // Walking up from the deepest object must terminate without
        // revisiting it.
        assert!(!world.is_descendant_of(parent, parent));
        world.check_integrity().unwrap();
    }

    #[test]
    fn move_hooks_fire_in_order() {
        let (mut world, room) = world_with_room();
        let cave = world.register(WorldObject::new("areas/cave", "cave"));
        let wolf = world.register(WorldObject::new("npcs/wolf", "wolf"));
        world.move_to(wolf, Some(room)).unwrap();

        let script = |module: &str| ActionHandler::Script {
            module: module.to_string(),
            export: "run".to_string(),
        };
        world
            .get_mut(wolf)
            .unwrap()
            .actions
            .insert("on_leave".into(), script("wolf"));
        world
            .get_mut(wolf)
            .unwrap()
            .actions
            .insert("on_enter".into(), script("wolf"));
        world
            .get_mut(room)
            .unwrap()
            .actions
            .insert("on_object_left".into(), script("room"));
        world
            .get_mut(cave)
            .unwrap()
            .actions
            .insert("on_object_entered".into(), script("cave"));

        let hooks = world.move_to(wolf, Some(cave)).unwrap();
        let sequence: Vec<_> = hooks.iter().map(|h| h.hook.as_str()).collect();
        assert_eq!(
            sequence,
            vec!["on_leave", "on_enter", "on_object_left", "on_object_entered"]
        );
    }

    #[test]
    fn missing_hooks_are_noops() {
        let (mut world, room) = world_with_room();
        let apple = world.register(WorldObject::new("items/apple", "apple"));
        let hooks = world.move_to(apple, Some(room)).unwrap();
        assert!(hooks.is_empty());
    }

    #[test]
    fn destroy_is_idempotent_and_inert() {
        let (mut world, room) = world_with_room();
        let apple = world.register(WorldObject::new("items/apple", "apple"));
        world.move_to(apple, Some(room)).unwrap();

        world.destroy(apple);
        assert!(!world.contains(apple));
        assert!(!world.get(room).unwrap().inventory.contains(&apple));
        assert!(world.by_name("apple").is_empty());

        // Second destroy: no-op, no panic.
        world.destroy(apple);

        // A destroyed reference is inert.
        assert!(world.get(apple).is_none());
        assert!(matches!(
            world.move_to(apple, Some(room)),
            Err(WorldError::NotFound(_))
        ));
    }

    #[test]
    fn destroy_reparents_inventory_by_default() {
        let (mut world, room) = world_with_room();
        let sack = world.register(WorldObject::new("items/sack", "sack"));
        let apple = world.register(WorldObject::new("items/apple", "apple"));
        world.move_to(sack, Some(room)).unwrap();
        world.move_to(apple, Some(sack)).unwrap();

        world.destroy(sack);
        assert_eq!(world.get(apple).unwrap().environment, Some(room));
        world.check_integrity().unwrap();
    }

    #[test]
    fn destroy_policy_can_cascade() {
        let (mut world, room) = world_with_room();
        let corpse = {
            let mut o = WorldObject::new("items/corpse", "corpse");
            o.destroy_policy = DestroyPolicy::DestroyInventory;
            world.register(o)
        };
        let loot = world.register(WorldObject::new("items/loot", "loot"));
        world.move_to(corpse, Some(room)).unwrap();
        world.move_to(loot, Some(corpse)).unwrap();

        world.destroy(corpse);
        assert!(!world.contains(loot));
        world.check_integrity().unwrap();
    }

    #[test]
    fn destroy_cancels_heartbeat() {
        let (mut world, _room) = world_with_room();
        let wolf = world.register(WorldObject::new("npcs/wolf", "wolf"));
        world.set_heartbeat(wolf, true);
        assert_eq!(world.heartbeat_members(), vec![wolf]);

        world.destroy(wolf);
        assert!(world.heartbeat_members().is_empty());
    }

    #[test]
    fn set_heartbeat_is_idempotent_and_ordered() {
        let (mut world, _room) = world_with_room();
        let a = world.register(WorldObject::new("npcs/a", "a"));
        let b = world.register(WorldObject::new("npcs/b", "b"));
        world.set_heartbeat(a, true);
        world.set_heartbeat(b, true);
        world.set_heartbeat(a, true);
        assert_eq!(world.heartbeat_members(), vec![a, b]);

        world.set_heartbeat(a, false);
        world.set_heartbeat(a, false);
        assert_eq!(world.heartbeat_members(), vec![b]);
    }

    #[test]
    fn singleton_load_and_clone() {
        let mut world = World::new();
        world.blueprints.register(Blueprint {
            object_path: "areas/glade".into(),
            singleton: true,
            name: "glade".into(),
            ..Default::default()
        });
        world.blueprints.register(Blueprint {
            object_path: "npcs/deer".into(),
            singleton: false,
            name: "deer".into(),
            ..Default::default()
        });

        let glade = world.load_object("areas/glade").unwrap();
        assert_eq!(world.load_object("areas/glade").unwrap(), glade);
        assert_eq!(world.find_object("areas/glade"), Some(glade));

        let d1 = world.clone_object("npcs/deer").unwrap();
        let d2 = world.clone_object("npcs/deer").unwrap();
        assert_ne!(d1, d2);
        assert_eq!(world.find_object("npcs/deer"), None);

        assert!(matches!(
            world.load_object("areas/nowhere"),
            Err(WorldError::BlueprintNotFound(_))
        ));
    }

    #[test]
    fn snapshot_round_trip() {
        let (mut world, room) = world_with_room();
        let sack = world.register(WorldObject::new("items/sack", "sack"));
        let apple = world.register(WorldObject::new("items/apple", "apple"));
        world.move_to(sack, Some(room)).unwrap();
        world.move_to(apple, Some(sack)).unwrap();
        world.set_heartbeat(sack, true);

        let snap = world.snapshot();

        let mut restored = World::new();
        restored.restore(&snap).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.get(apple).unwrap().environment, Some(sack));
        assert_eq!(restored.heartbeat_members(), vec![sack]);
        restored.check_integrity().unwrap();

        // New registrations after restore don't collide with old ids.
        let next = restored.register(WorldObject::new("items/new", "new"));
        assert!(next > apple);
    }

    #[test]
    fn scope_covers_self_inventory_env_and_siblings() {
        let (mut world, room) = world_with_room();
        let player = world.register(WorldObject::new("players/alice", "alice"));
        let sword = world.register(WorldObject::new("items/sword", "sword"));
        let deer = world.register(WorldObject::new("npcs/deer", "deer"));
        world.move_to(player, Some(room)).unwrap();
        world.move_to(sword, Some(player)).unwrap();
        world.move_to(deer, Some(room)).unwrap();

        let scope = world.scope_of(player);
        assert_eq!(scope, vec![player, sword, room, deer]);
    }
}
