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

//! The heartbeat pass: one logical tick over every opted-in object, in
//! insertion order, between command handlers. Per object: effect
//! durations run down, interval effects fire and rearm, expired effects
//! are removed with their expiry hooks, regen applies, and the object's
//! own `on_tick` action is collected for dispatch.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use ember_common::ObjId;

use crate::object::Effect;
use crate::world::{HookInvocation, World};

/// Everything one tick pass produced. Hooks are dispatched by the
/// runtime after the pass, outside the graph borrow.
#[derive(Debug, Default)]
pub struct TickReport {
    pub processed: usize,
    pub hooks: Vec<HookInvocation>,
    /// Effects that expired this tick, paired with their owner.
    pub expired: Vec<(ObjId, Effect)>,
}

/// Run one tick over the opted-in set. `skip` holds objects opted out
/// for exactly this pass (a handler failed last tick); they are consumed,
/// not kept.
pub fn run_tick(world: &mut World, skip: &mut HashSet<ObjId>, period: Duration) -> TickReport {
    let mut report = TickReport::default();

    for id in world.heartbeat_members() {
        if skip.remove(&id) {
            debug!(%id, "skipping heartbeat for one tick after failure");
            continue;
        }
        tick_object(world, id, period, &mut report);
        report.processed += 1;
    }

    report
}

fn tick_object(world: &mut World, id: ObjId, period: Duration, report: &mut TickReport) {
    // Effects first, collecting what fired and what drained.
    let mut fired: Vec<Effect> = vec![];
    let mut expired: Vec<Effect> = vec![];
    {
        let Some(obj) = world.get_mut(id) else {
            return;
        };
        if let Some(living) = obj.capabilities.living.as_mut() {
            let mut kept = Vec::with_capacity(living.effects.len());
            for mut effect in living.effects.drain(..) {
                let tick = effect.advance(period);
                if tick.fired {
                    fired.push(effect.clone());
                }
                if tick.expired {
                    expired.push(effect);
                } else {
                    kept.push(effect);
                }
            }
            living.effects = kept;
            living.apply_regen();
        }
    }

    for effect in fired {
        collect_effect_hook(world, id, "on_effect_tick", &effect, report);
    }
    for effect in expired {
        collect_effect_hook(world, id, "on_effect_expire", &effect, report);
        report.expired.push((id, effect));
    }

    // The object's own tick action, when it has one.
    if let Some(obj) = world.get(id) {
        if let Some(handler) = obj.actions.get("on_tick") {
            report.hooks.push(HookInvocation {
                target: id,
                hook: "on_tick".to_string(),
                handler: handler.clone(),
                args: vec![],
            });
        }
    }
}

fn collect_effect_hook(
    world: &World,
    id: ObjId,
    hook: &str,
    effect: &Effect,
    report: &mut TickReport,
) {
    let Some(obj) = world.get(id) else {
        return;
    };
    let Some(handler) = obj.actions.get(hook) else {
        return;
    };
    report.hooks.push(HookInvocation {
        target: id,
        hook: hook.to_string(),
        handler: handler.clone(),
        args: vec![serde_json::to_value(effect).unwrap_or(Value::Null)],
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ActionHandler, LivingState, WorldObject};
    use pretty_assertions::assert_eq;

    const TICK: Duration = Duration::from_secs(1);

    fn living_object(world: &mut World, name: &str) -> ObjId {
        let mut o = WorldObject::new(format!("npcs/{name}"), name);
        o.capabilities.living = Some(LivingState {
            hp: 10,
            max_hp: 20,
            hp_regen: 1,
            ..Default::default()
        });
        let id = world.register(o);
        world.set_heartbeat(id, true);
        id
    }

    fn effect(remaining_ms: Option<u64>, interval_ms: Option<u64>) -> Effect {
        Effect {
            id: "e".into(),
            kind: "poison".into(),
            remaining: remaining_ms.map(Duration::from_millis),
            tick_interval: interval_ms.map(Duration::from_millis),
            next_tick: None,
            magnitude: 1.0,
            category: "damage".into(),
            hidden: false,
        }
    }

    #[test]
    fn fairness_every_member_ticks_once_per_pass() {
        let mut world = World::new();
        let ids: Vec<_> = (0..5)
            .map(|i| living_object(&mut world, &format!("mob{i}")))
            .collect();

        let mut skip = HashSet::new();
        for _ in 0..7 {
            let report = run_tick(&mut world, &mut skip, TICK);
            assert_eq!(report.processed, ids.len());
        }
        // 7 ticks x 1 hp regen each.
        for id in &ids {
            let hp = world
                .get(*id)
                .unwrap()
                .capabilities
                .living
                .as_ref()
                .unwrap()
                .hp;
            assert_eq!(hp, 17);
        }
    }

    #[test]
    fn skip_set_is_consumed_after_one_tick() {
        let mut world = World::new();
        let a = living_object(&mut world, "a");
        let b = living_object(&mut world, "b");

        let mut skip = HashSet::from([a]);
        let report = run_tick(&mut world, &mut skip, TICK);
        assert_eq!(report.processed, 1);
        assert!(skip.is_empty());

        let report = run_tick(&mut world, &mut skip, TICK);
        assert_eq!(report.processed, 2);

        let hp = |world: &World, id| {
            world
                .get(id)
                .unwrap()
                .capabilities
                .living
                .as_ref()
                .unwrap()
                .hp
        };
        assert_eq!(hp(&world, a), 11);
        assert_eq!(hp(&world, b), 12);
    }

    #[test]
    fn expired_effects_are_removed_with_hooks() {
        let mut world = World::new();
        let a = living_object(&mut world, "a");
        world.get_mut(a).unwrap().actions.insert(
            "on_effect_expire".into(),
            ActionHandler::Builtin {
                name: "noop".into(),
            },
        );
        world
            .get_mut(a)
            .unwrap()
            .capabilities
            .living
            .as_mut()
            .unwrap()
            .effects
            .push(effect(Some(1500), None));

        let mut skip = HashSet::new();
        let report = run_tick(&mut world, &mut skip, TICK);
        assert!(report.expired.is_empty());

        let report = run_tick(&mut world, &mut skip, TICK);
        assert_eq!(report.expired.len(), 1);
        assert_eq!(report.hooks.len(), 1);
        assert_eq!(report.hooks[0].hook, "on_effect_expire");

        let effects = &world
            .get(a)
            .unwrap()
            .capabilities
            .living
            .as_ref()
            .unwrap()
            .effects;
        assert!(effects.is_empty());
    }

    #[test]
    fn permanent_effects_survive_every_tick() {
        let mut world = World::new();
        let a = living_object(&mut world, "a");
        world
            .get_mut(a)
            .unwrap()
            .capabilities
            .living
            .as_mut()
            .unwrap()
            .effects
            .push(effect(None, None));

        let mut skip = HashSet::new();
        for _ in 0..100 {
            run_tick(&mut world, &mut skip, TICK);
        }
        let effects = &world
            .get(a)
            .unwrap()
            .capabilities
            .living
            .as_ref()
            .unwrap()
            .effects;
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn interval_effect_fires_hook_each_interval() {
        let mut world = World::new();
        let a = living_object(&mut world, "a");
        world.get_mut(a).unwrap().actions.insert(
            "on_effect_tick".into(),
            ActionHandler::Builtin {
                name: "noop".into(),
            },
        );
        world
            .get_mut(a)
            .unwrap()
            .capabilities
            .living
            .as_mut()
            .unwrap()
            .effects
            .push(effect(Some(10_000), Some(2000)));

        let mut skip = HashSet::new();
        let mut fired = 0;
        for _ in 0..8 {
            let report = run_tick(&mut world, &mut skip, TICK);
            fired += report
                .hooks
                .iter()
                .filter(|h| h.hook == "on_effect_tick")
                .count();
        }
        assert_eq!(fired, 4);
    }

    #[test]
    fn on_tick_action_is_collected() {
        let mut world = World::new();
        let a = living_object(&mut world, "wanderer");
        world.get_mut(a).unwrap().actions.insert(
            "on_tick".into(),
            ActionHandler::Script {
                module: "npcs/wanderer".into(),
                export: "on_tick".into(),
            },
        );

        let mut skip = HashSet::new();
        let report = run_tick(&mut world, &mut skip, TICK);
        assert_eq!(report.hooks.len(), 1);
        assert_eq!(report.hooks[0].hook, "on_tick");
        assert_eq!(report.hooks[0].target, a);
    }
}
