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

//! The built-in command table. Game content brings its own verbs through
//! object action tables; what lives here is the driver-level set every
//! world gets: orientation, communication, combat engagement, session
//! control, and the admin commands.

use serde_json::Value;
use uuid::Uuid;

use ember_common::proto::payloads::{CombatPayload, EquipmentEntry, EquipmentPayload};
use ember_common::{FrameType, ObjId, PermissionLevel};

use crate::daemons::core::CombatDaemon;
use crate::world::{TargetResolution, World, resolve_target};

use super::{
    AsyncOp, CommandDef, CommandError, CommandInput, CommandOutcome, DispatchCtx,
};

pub fn core_commands() -> Vec<CommandDef> {
    vec![
        CommandDef {
            verb: "look",
            aliases: &["l"],
            min_level: PermissionLevel::Player,
            handler: cmd_look,
        },
        CommandDef {
            verb: "say",
            aliases: &["'"],
            min_level: PermissionLevel::Player,
            handler: cmd_say,
        },
        CommandDef {
            verb: "who",
            aliases: &[],
            min_level: PermissionLevel::Player,
            handler: cmd_who,
        },
        CommandDef {
            verb: "stats",
            aliases: &["score"],
            min_level: PermissionLevel::Player,
            handler: cmd_stats,
        },
        CommandDef {
            verb: "monitor",
            aliases: &[],
            min_level: PermissionLevel::Player,
            handler: cmd_monitor,
        },
        CommandDef {
            verb: "get",
            aliases: &["take"],
            min_level: PermissionLevel::Player,
            handler: cmd_get,
        },
        CommandDef {
            verb: "drop",
            aliases: &[],
            min_level: PermissionLevel::Player,
            handler: cmd_drop,
        },
        CommandDef {
            verb: "inventory",
            aliases: &["i", "inv"],
            min_level: PermissionLevel::Player,
            handler: cmd_inventory,
        },
        CommandDef {
            verb: "kill",
            aliases: &["attack", "k"],
            min_level: PermissionLevel::Player,
            handler: cmd_kill,
        },
        CommandDef {
            verb: "wear",
            aliases: &["wield", "equip"],
            min_level: PermissionLevel::Player,
            handler: cmd_wear,
        },
        CommandDef {
            verb: "remove",
            aliases: &["unwield"],
            min_level: PermissionLevel::Player,
            handler: cmd_remove,
        },
        CommandDef {
            verb: "tell",
            aliases: &["whisper"],
            min_level: PermissionLevel::Player,
            handler: cmd_tell,
        },
        CommandDef {
            verb: "emote",
            aliases: &[":"],
            min_level: PermissionLevel::Player,
            handler: cmd_emote,
        },
        CommandDef {
            verb: "quit",
            aliases: &[],
            min_level: PermissionLevel::Player,
            handler: cmd_quit,
        },
        CommandDef {
            verb: "@save",
            aliases: &[],
            min_level: PermissionLevel::Player,
            handler: cmd_save,
        },
        CommandDef {
            verb: "@shutdown",
            aliases: &[],
            min_level: PermissionLevel::Admin,
            handler: cmd_shutdown,
        },
    ]
}

fn cmd_look(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    let player = input.player;
    let target = if input.args.is_empty() {
        match ctx.world.get(player).and_then(|p| p.environment) {
            Some(env) => env,
            None => {
                ctx.binder
                    .send_line(player, "You float in a featureless void.");
                return Ok(CommandOutcome::Complete);
            }
        }
    } else {
        resolve_one(ctx, player, &input.args)?
    };

    let Some(obj) = ctx.world.get(target) else {
        return Err(CommandError::NotFound(format!(
            "You don't see {} here.",
            input.args
        )));
    };

    let mut out = String::new();
    out.push_str(obj.short_desc.as_str());
    if !obj.long_desc.is_empty() {
        out.push_str("\r\n");
        out.push_str(obj.long_desc.as_str());
    }
    let visible: Vec<String> = obj
        .inventory
        .iter()
        .filter(|&&child| child != player)
        .filter_map(|&child| ctx.world.get(child))
        .map(|child| child.short_desc.clone())
        .collect();
    if !visible.is_empty() {
        out.push_str("\r\nYou see: ");
        out.push_str(&visible.join(", "));
    }
    ctx.binder.send_line(player, &out);
    Ok(CommandOutcome::Complete)
}

fn cmd_say(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    if input.args.is_empty() {
        return Err(CommandError::NotFound("Say what?".to_string()));
    }
    let player = input.player;
    let speaker = ctx
        .world
        .get(player)
        .map(|o| o.short_desc.clone())
        .unwrap_or_else(|| "someone".to_string());

    let Some(env) = ctx.world.get(player).and_then(|p| p.environment) else {
        ctx.binder.send_line(player, "No one can hear you here.");
        return Ok(CommandOutcome::Complete);
    };
    let audience: Vec<ObjId> = ctx
        .world
        .get(env)
        .map(|room| room.inventory.clone())
        .unwrap_or_default();

    for listener in audience {
        if listener == player {
            ctx.binder
                .send_line(player, &format!("You say, \"{}\"", input.args));
        } else {
            ctx.binder
                .send_line(listener, &format!("{speaker} says, \"{}\"", input.args));
        }
    }
    Ok(CommandOutcome::Complete)
}

fn cmd_who(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    let entries: Vec<String> = ctx
        .binder
        .bound_players()
        .filter_map(|id| {
            let obj = ctx.world.get(id)?;
            let session = ctx.binder.session(id)?;
            Some(format!(
                "  {:<20} on {}, idle {}",
                obj.short_desc,
                fmt_seconds(session.connected_seconds()),
                fmt_seconds(session.idle_seconds()),
            ))
        })
        .collect();
    if entries.is_empty() {
        ctx.binder.send_line(input.player, "No one is connected.");
        return Ok(CommandOutcome::Complete);
    }
    let mut out = format!("Connected ({}):", entries.len());
    for entry in entries {
        out.push_str("\r\n");
        out.push_str(&entry);
    }
    ctx.binder.send_line(input.player, &out);
    Ok(CommandOutcome::Complete)
}

fn fmt_seconds(seconds: f64) -> String {
    let seconds = seconds as u64;
    if seconds >= 3600 {
        format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds >= 60 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

fn cmd_stats(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    ctx.binder.emit_stats(ctx.world, input.player);
    Ok(CommandOutcome::Complete)
}

fn cmd_monitor(
    ctx: &mut DispatchCtx,
    input: &CommandInput,
) -> Result<CommandOutcome, CommandError> {
    let Some(ps) = ctx
        .world
        .get_mut(input.player)
        .and_then(|o| o.capabilities.player.as_mut())
    else {
        return Err(CommandError::Failed("not a player".to_string()));
    };
    ps.monitor = !ps.monitor;
    let state = if ps.monitor { "on" } else { "off" };
    ctx.binder
        .send_line(input.player, &format!("Monitor is now {state}."));
    Ok(CommandOutcome::Complete)
}

fn cmd_get(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    if input.args.is_empty() {
        return Err(CommandError::NotFound("Get what?".to_string()));
    }
    let player = input.player;
    let target = resolve_one(ctx, player, &input.args)?;
    if target == player {
        return Err(CommandError::NotFound("You already have yourself.".to_string()));
    }
    let Some(target_obj) = ctx.world.get(target) else {
        return Err(CommandError::NotFound(format!(
            "You don't see {} here.",
            input.args
        )));
    };
    if target_obj.environment == Some(player) {
        return Err(CommandError::NotFound(
            "You're already carrying that.".to_string(),
        ));
    }
    if target_obj.is_living() {
        return Err(CommandError::NotFound(format!(
            "The {} objects strenuously.",
            target_obj.short_desc
        )));
    }
    let name = target_obj.short_desc.clone();
    let hooks = ctx
        .world
        .move_to(target, Some(player))
        .map_err(|e| CommandError::Failed(e.to_string()))?;
    ctx.pending_hooks.extend(hooks);
    ctx.binder
        .send_line(player, &format!("You take the {name}."));
    Ok(CommandOutcome::Complete)
}

fn cmd_drop(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    if input.args.is_empty() {
        return Err(CommandError::NotFound("Drop what?".to_string()));
    }
    let player = input.player;
    let target = resolve_one(ctx, player, &input.args)?;
    let carried = ctx
        .world
        .get(target)
        .map(|o| o.environment == Some(player))
        .unwrap_or(false);
    if !carried {
        return Err(CommandError::NotFound(
            "You're not carrying that.".to_string(),
        ));
    }
    let env = ctx.world.get(player).and_then(|p| p.environment);
    let name = ctx
        .world
        .get(target)
        .map(|o| o.short_desc.clone())
        .unwrap_or_default();
    let hooks = ctx
        .world
        .move_to(target, env)
        .map_err(|e| CommandError::Failed(e.to_string()))?;
    ctx.pending_hooks.extend(hooks);
    ctx.binder
        .send_line(player, &format!("You drop the {name}."));
    Ok(CommandOutcome::Complete)
}

fn cmd_inventory(
    ctx: &mut DispatchCtx,
    input: &CommandInput,
) -> Result<CommandOutcome, CommandError> {
    let carried: Vec<String> = ctx
        .world
        .get(input.player)
        .map(|p| {
            p.inventory
                .iter()
                .filter_map(|&id| ctx.world.get(id))
                .map(|o| o.short_desc.clone())
                .collect()
        })
        .unwrap_or_default();
    let line = if carried.is_empty() {
        "You are carrying nothing.".to_string()
    } else {
        format!("You are carrying: {}", carried.join(", "))
    };
    ctx.binder.send_line(input.player, &line);
    Ok(CommandOutcome::Complete)
}

fn cmd_kill(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    if input.args.is_empty() {
        return Err(CommandError::NotFound("Kill what?".to_string()));
    }
    let player = input.player;
    let target = resolve_one(ctx, player, &input.args)?;
    if target == player {
        return Err(CommandError::NotFound(
            "You can't bring yourself to do that.".to_string(),
        ));
    }
    let Some(target_obj) = ctx.world.get(target) else {
        return Err(CommandError::NotFound(format!(
            "You don't see {} here.",
            input.args
        )));
    };
    if !target_obj.is_living() {
        return Err(CommandError::NotFound(format!(
            "The {} is in no state to fight.",
            target_obj.short_desc
        )));
    }
    let target_name = target_obj.short_desc.clone();
    let hp_percent = target_obj
        .capabilities
        .living
        .as_ref()
        .map(|l| {
            if l.max_hp > 0 {
                (l.hp as f32 / l.max_hp as f32) * 100.0
            } else {
                100.0
            }
        })
        .unwrap_or(100.0);

    // Both sides acquire combat targets; the combat daemon tracks the
    // engagement for its round scheduling.
    if let Some(living) = ctx
        .world
        .get_mut(player)
        .and_then(|o| o.capabilities.living.as_mut())
    {
        living.combat_target = Some(target);
    }
    if let Some(living) = ctx
        .world
        .get_mut(target)
        .and_then(|o| o.capabilities.living.as_mut())
    {
        living.combat_target = Some(player);
    }
    if let Some(combat) = ctx.daemons.get_mut::<CombatDaemon>() {
        combat.engage(player, target);
    }

    let payload = CombatPayload::TargetUpdate {
        target,
        name: target_name.clone(),
        hp_percent,
    };
    ctx.binder.send_frame(
        player,
        FrameType::Combat,
        serde_json::to_value(payload).unwrap_or(Value::Null),
    );
    ctx.binder
        .send_line(player, &format!("You attack the {target_name}!"));
    Ok(CommandOutcome::Complete)
}

/// Worn items carry an `equipped` property; the worn set is derived by
/// scanning the player's inventory, so it survives save and restore
/// without an id-keyed side table.
fn worn_equipment(world: &World, player: ObjId) -> EquipmentPayload {
    let mut payload = EquipmentPayload::default();
    let Some(p) = world.get(player) else {
        return payload;
    };
    for &item in &p.inventory {
        let Some(obj) = world.get(item) else {
            continue;
        };
        let equipped = obj
            .prop("equipped")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !equipped {
            continue;
        }
        if let Some(equippable) = &obj.capabilities.equippable {
            payload.slots.insert(
                equippable.slot.clone(),
                EquipmentEntry {
                    id: item,
                    name: obj.short_desc.clone(),
                },
            );
        }
    }
    payload
}

fn emit_equipment(ctx: &mut DispatchCtx, player: ObjId) {
    let payload = worn_equipment(ctx.world, player);
    ctx.binder.send_frame(
        player,
        FrameType::Equipment,
        serde_json::to_value(payload).unwrap_or(Value::Null),
    );
}

fn cmd_wear(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    if input.args.is_empty() {
        return Err(CommandError::NotFound("Wear what?".to_string()));
    }
    let player = input.player;
    let target = resolve_one(ctx, player, &input.args)?;
    let Some(obj) = ctx.world.get(target) else {
        return Err(CommandError::NotFound(format!(
            "You don't see {} here.",
            input.args
        )));
    };
    if obj.environment != Some(player) {
        return Err(CommandError::NotFound(
            "You have to be carrying that first.".to_string(),
        ));
    }
    let Some(equippable) = obj.capabilities.equippable.clone() else {
        return Err(CommandError::NotFound(format!(
            "You can't wear the {}.",
            obj.short_desc
        )));
    };
    let name = obj.short_desc.clone();

    let worn = worn_equipment(ctx.world, player);
    if let Some(occupied) = worn.slots.get(&equippable.slot) {
        return Err(CommandError::NotFound(format!(
            "You're already wearing the {} there.",
            occupied.name
        )));
    }

    if let Some(obj) = ctx.world.get_mut(target) {
        obj.set_prop("equipped", Value::Bool(true));
    }
    ctx.binder
        .send_line(player, &format!("You wear the {name}."));
    emit_equipment(ctx, player);
    Ok(CommandOutcome::Complete)
}

fn cmd_remove(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    if input.args.is_empty() {
        return Err(CommandError::NotFound("Remove what?".to_string()));
    }
    let player = input.player;
    let target = resolve_one(ctx, player, &input.args)?;
    let worn = ctx
        .world
        .get(target)
        .map(|o| {
            o.environment == Some(player)
                && o.prop("equipped").and_then(Value::as_bool).unwrap_or(false)
        })
        .unwrap_or(false);
    if !worn {
        return Err(CommandError::NotFound(
            "You're not wearing that.".to_string(),
        ));
    }
    let name = ctx
        .world
        .get(target)
        .map(|o| o.short_desc.clone())
        .unwrap_or_default();
    if let Some(obj) = ctx.world.get_mut(target) {
        obj.set_prop("equipped", Value::Bool(false));
    }
    ctx.binder
        .send_line(player, &format!("You remove the {name}."));
    emit_equipment(ctx, player);
    Ok(CommandOutcome::Complete)
}

fn cmd_tell(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    let Some((target_name, message)) = input.args.split_once(char::is_whitespace) else {
        return Err(CommandError::NotFound("Tell whom what?".to_string()));
    };
    let message = message.trim();
    if message.is_empty() {
        return Err(CommandError::NotFound("Tell whom what?".to_string()));
    }
    let player = input.player;
    let target = ctx
        .world
        .by_name(target_name)
        .iter()
        .copied()
        .find(|&id| {
            ctx.world
                .get(id)
                .map(|o| o.is_player())
                .unwrap_or(false)
                && ctx.binder.is_bound(id)
        });
    let Some(target) = target else {
        return Err(CommandError::NotFound(format!(
            "{target_name} isn't here right now."
        )));
    };
    if target == player {
        ctx.binder
            .send_line(player, "You mutter to yourself.");
        return Ok(CommandOutcome::Complete);
    }
    let speaker = ctx
        .world
        .get(player)
        .map(|o| o.short_desc.clone())
        .unwrap_or_else(|| "someone".to_string());
    ctx.binder
        .send_line(target, &format!("{speaker} tells you, \"{message}\""));
    ctx.binder.send_line(
        player,
        &format!(
            "You tell {}, \"{message}\"",
            ctx.world
                .get(target)
                .map(|o| o.short_desc.clone())
                .unwrap_or_default()
        ),
    );
    Ok(CommandOutcome::Complete)
}

fn cmd_emote(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    if input.args.is_empty() {
        return Err(CommandError::NotFound("Emote what?".to_string()));
    }
    let player = input.player;
    let actor = ctx
        .world
        .get(player)
        .map(|o| o.short_desc.clone())
        .unwrap_or_else(|| "someone".to_string());
    let Some(env) = ctx.world.get(player).and_then(|p| p.environment) else {
        ctx.binder.send_line(player, "No one can see you here.");
        return Ok(CommandOutcome::Complete);
    };
    let audience: Vec<ObjId> = ctx
        .world
        .get(env)
        .map(|room| room.inventory.clone())
        .unwrap_or_default();
    for watcher in audience {
        ctx.binder
            .send_line(watcher, &format!("{actor} {}", input.args));
    }
    Ok(CommandOutcome::Complete)
}

/// Quit saves before the connection closes; a player dropped by the
/// network instead stays resumable and is saved by the autosave tick.
fn cmd_quit(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    ctx.binder.send_line(input.player, "Goodbye.");
    if let Some(obj) = ctx.world.get_mut(input.player) {
        obj.set_prop("clean_quit", Value::Bool(true));
    }
    match crate::runtime::save::player_to_save(ctx.world, input.player) {
        Some((name, data)) => Ok(CommandOutcome::Suspend {
            op: AsyncOp::SavePlayer { name, data },
            resume: resume_quit,
        }),
        None => Ok(CommandOutcome::Quit),
    }
}

fn resume_quit(
    _ctx: &mut DispatchCtx,
    _input: &CommandInput,
    _saved: Value,
) -> Result<CommandOutcome, CommandError> {
    Ok(CommandOutcome::Quit)
}

/// Player-initiated save. The write happens off the world thread; the
/// resume confirms it.
fn cmd_save(ctx: &mut DispatchCtx, input: &CommandInput) -> Result<CommandOutcome, CommandError> {
    let Some((name, data)) = crate::runtime::save::player_to_save(ctx.world, input.player) else {
        return Err(CommandError::Failed("nothing to save".to_string()));
    };
    Ok(CommandOutcome::Suspend {
        op: AsyncOp::SavePlayer { name, data },
        resume: resume_saved,
    })
}

fn resume_saved(
    ctx: &mut DispatchCtx,
    input: &CommandInput,
    _result: Value,
) -> Result<CommandOutcome, CommandError> {
    ctx.binder.send_line(input.player, "Saved.");
    Ok(CommandOutcome::Complete)
}

/// Shutdown wants a confirmation line, routed through the input-handler
/// stack: the next line this admin types goes to the resume, not the
/// parser.
fn cmd_shutdown(
    _ctx: &mut DispatchCtx,
    _input: &CommandInput,
) -> Result<CommandOutcome, CommandError> {
    Ok(CommandOutcome::Suspend {
        op: AsyncOp::AwaitLine {
            request_id: Uuid::new_v4(),
            prompt: "Really shut down the server? Type \"yes\" to confirm: ".to_string(),
        },
        resume: resume_shutdown,
    })
}

fn resume_shutdown(
    ctx: &mut DispatchCtx,
    input: &CommandInput,
    answer: Value,
) -> Result<CommandOutcome, CommandError> {
    let confirmed = answer
        .as_str()
        .map(|s| s.trim().eq_ignore_ascii_case("yes"))
        .unwrap_or(false);
    if confirmed {
        Ok(CommandOutcome::Shutdown)
    } else {
        ctx.binder.send_line(input.player, "Shutdown aborted.");
        Ok(CommandOutcome::Complete)
    }
}

/// Resolve a phrase to exactly one target, mapping the miss cases to
/// their player-facing phrasings.
fn resolve_one(
    ctx: &DispatchCtx,
    player: ObjId,
    phrase: &str,
) -> Result<ObjId, CommandError> {
    match resolve_target(ctx.world, player, phrase) {
        TargetResolution::One(id) => Ok(id),
        TargetResolution::Many(_) => Err(CommandError::NotFound(
            "One thing at a time.".to_string(),
        )),
        TargetResolution::NotFound(name) => Err(CommandError::NotFound(format!(
            "You don't see {name} here."
        ))),
        TargetResolution::OutOfRange { name, count } => Err(CommandError::NotFound(format!(
            "There are only {count} {name} here."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemons::DaemonRegistry;
    use crate::dispatch::Dispatcher;
    use crate::object::{LivingState, PlayerState, WorldObject};
    use crate::session::{MockSession, SessionBinder};
    use crate::world::World;
    use std::sync::Arc;

    struct Fixture {
        world: World,
        binder: SessionBinder,
        daemons: DaemonRegistry,
        player: ObjId,
        session: Arc<MockSession>,
        deer: Vec<ObjId>,
    }

    fn fixture() -> Fixture {
        let mut world = World::new();
        let room = world.register(WorldObject::new("areas/glade", "glade"));
        let mut player_obj = WorldObject::new("players/alice", "alice");
        player_obj.capabilities.player = Some(PlayerState::new("alice"));
        player_obj.capabilities.living = Some(LivingState {
            hp: 50,
            max_hp: 50,
            ..Default::default()
        });
        let player = world.register(player_obj);
        world.move_to(player, Some(room)).unwrap();

        let mut deer = vec![];
        for _ in 0..3 {
            let mut d = WorldObject::new("npcs/deer", "deer");
            d.capabilities.living = Some(LivingState {
                hp: 12,
                max_hp: 16,
                ..Default::default()
            });
            let id = world.register(d);
            world.move_to(id, Some(room)).unwrap();
            deer.push(id);
        }

        let mut binder = SessionBinder::new();
        let session = Arc::new(MockSession::new());
        binder.bind(player, session.clone());

        let mut daemons = DaemonRegistry::new();
        daemons
            .register(Box::new(CombatDaemon::default()))
            .unwrap();

        Fixture {
            world,
            binder,
            daemons,
            player,
            session,
            deer,
        }
    }

    fn run(fx: &mut Fixture, line: &str) -> Result<CommandOutcome, CommandError> {
        let dispatcher = Dispatcher::default();
        let mut ctx = DispatchCtx::new(&mut fx.world, &mut fx.binder, &mut fx.daemons);
        let input = CommandInput::parse(fx.player, line).unwrap();
        dispatcher.dispatch(&mut ctx, &input)
    }

    #[test]
    fn kill_indexed_target_engages_second_deer() {
        let mut fx = fixture();
        let outcome = run(&mut fx, "kill deer 2").unwrap();
        assert!(matches!(outcome, CommandOutcome::Complete));

        let second = fx.deer[1];
        let living = fx
            .world
            .get(fx.player)
            .unwrap()
            .capabilities
            .living
            .as_ref()
            .unwrap();
        assert_eq!(living.combat_target, Some(second));
        let target_living = fx
            .world
            .get(second)
            .unwrap()
            .capabilities
            .living
            .as_ref()
            .unwrap();
        assert_eq!(target_living.combat_target, Some(fx.player));

        let combat = fx.daemons.get::<CombatDaemon>().unwrap();
        assert!(combat.is_engaged(fx.player, second));

        let frames = fx.session.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, FrameType::Combat);
        assert_eq!(frames[0].1["type"], "target_update");
    }

    #[test]
    fn kill_out_of_range_index_reports_count() {
        let mut fx = fixture();
        let err = run(&mut fx, "kill deer 5").unwrap_err();
        assert_eq!(err.player_message(), "There are only 3 deer here.");

        // And no combat started.
        let living = fx
            .world
            .get(fx.player)
            .unwrap()
            .capabilities
            .living
            .as_ref()
            .unwrap();
        assert_eq!(living.combat_target, None);
        assert!(fx.session.frames().is_empty());
    }

    #[test]
    fn look_describes_room_and_contents() {
        let mut fx = fixture();
        run(&mut fx, "look").unwrap();
        let transcript = fx.session.transcript();
        assert!(transcript.contains("glade"));
        assert!(transcript.contains("deer"));
    }

    #[test]
    fn say_reaches_the_room_not_the_void() {
        let mut fx = fixture();
        // Bind a second player in the same room and one in the void.
        let mut bob_obj = WorldObject::new("players/bob", "bob");
        bob_obj.capabilities.player = Some(PlayerState::new("bob"));
        let bob = fx.world.register(bob_obj);
        let room = fx.world.get(fx.player).unwrap().environment.unwrap();
        fx.world.move_to(bob, Some(room)).unwrap();
        let bob_session = Arc::new(MockSession::new());
        fx.binder.bind(bob, bob_session.clone());

        run(&mut fx, "say hello all").unwrap();
        assert!(fx.session.transcript().contains("You say, \"hello all\""));
        assert!(bob_session.transcript().contains("alice says, \"hello all\""));
    }

    #[test]
    fn get_drop_inventory_round_trip() {
        let mut fx = fixture();
        let room = fx.world.get(fx.player).unwrap().environment.unwrap();
        let apple = fx.world.register(WorldObject::new("items/apple", "apple"));
        fx.world.move_to(apple, Some(room)).unwrap();

        run(&mut fx, "get apple").unwrap();
        assert_eq!(fx.world.get(apple).unwrap().environment, Some(fx.player));
        run(&mut fx, "inventory").unwrap();
        assert!(fx.session.transcript().contains("You are carrying: apple"));

        run(&mut fx, "drop apple").unwrap();
        assert_eq!(fx.world.get(apple).unwrap().environment, Some(room));

        let err = run(&mut fx, "drop apple").unwrap_err();
        assert_eq!(err.player_message(), "You're not carrying that.");
        let err = run(&mut fx, "get deer").unwrap_err();
        assert!(err.player_message().contains("objects strenuously"));
    }

    #[test]
    fn quit_and_shutdown_outcomes() {
        let mut fx = fixture();
        // Quit saves first, then closes.
        let outcome = run(&mut fx, "quit").unwrap();
        let CommandOutcome::Suspend {
            op: AsyncOp::SavePlayer { name, .. },
            resume,
        } = outcome
        else {
            panic!("expected save-then-quit suspension");
        };
        assert_eq!(name, "alice");
        {
            let input = CommandInput::parse(fx.player, "quit").unwrap();
            let mut ctx = DispatchCtx::new(&mut fx.world, &mut fx.binder, &mut fx.daemons);
            let done = resume(&mut ctx, &input, Value::Bool(true)).unwrap();
            assert!(matches!(done, CommandOutcome::Quit));
        }

        fx.world
            .get_mut(fx.player)
            .unwrap()
            .capabilities
            .player
            .as_mut()
            .unwrap()
            .permission = PermissionLevel::Admin;
        let outcome = run(&mut fx, "@shutdown").unwrap();
        let CommandOutcome::Suspend { resume, .. } = outcome else {
            panic!("expected confirmation suspension");
        };

        // "no" aborts; "yes" shuts down.
        let input = CommandInput::parse(fx.player, "@shutdown").unwrap();
        let mut ctx = DispatchCtx::new(&mut fx.world, &mut fx.binder, &mut fx.daemons);
        let aborted = resume(&mut ctx, &input, Value::String("no".into())).unwrap();
        assert!(matches!(aborted, CommandOutcome::Complete));
        let confirmed = resume(&mut ctx, &input, Value::String("YES".into())).unwrap();
        assert!(matches!(confirmed, CommandOutcome::Shutdown));
        assert!(fx.session.transcript().contains("Shutdown aborted."));
    }

    #[test]
    fn wear_remove_round_trip() {
        let mut fx = fixture();
        let mut helm = WorldObject::new("items/helm", "helm");
        helm.capabilities.equippable = Some(crate::object::EquippableState {
            slot: "head".into(),
        });
        let helm = fx.world.register(helm);
        fx.world.move_to(helm, Some(fx.player)).unwrap();

        run(&mut fx, "wear helm").unwrap();
        let frames = fx.session.frames();
        let (ty, payload) = frames.last().unwrap();
        assert_eq!(*ty, FrameType::Equipment);
        assert_eq!(payload["slots"]["head"]["name"], "helm");

        // A second item in the same slot is refused.
        let mut cap = WorldObject::new("items/cap", "cap");
        cap.capabilities.equippable = Some(crate::object::EquippableState {
            slot: "head".into(),
        });
        let cap = fx.world.register(cap);
        fx.world.move_to(cap, Some(fx.player)).unwrap();
        let err = run(&mut fx, "wear cap").unwrap_err();
        assert!(err.player_message().contains("already wearing"));

        run(&mut fx, "remove helm").unwrap();
        let frames = fx.session.frames();
        let (_, payload) = frames.last().unwrap();
        assert!(payload["slots"].get("head").is_none());
    }

    #[test]
    fn who_lists_connection_spans() {
        let mut fx = fixture();
        run(&mut fx, "who").unwrap();
        let transcript = fx.session.transcript();
        assert!(transcript.contains("Connected (1):"), "{transcript}");
        assert!(transcript.contains("alice"), "{transcript}");
        // Mock sessions report zero-length spans.
        assert!(transcript.contains("on 0s, idle 0s"), "{transcript}");
    }

    #[test]
    fn seconds_format() {
        assert_eq!(fmt_seconds(12.9), "12s");
        assert_eq!(fmt_seconds(61.0), "1m1s");
        assert_eq!(fmt_seconds(3725.0), "1h2m");
    }

    #[test]
    fn tell_reaches_a_bound_player_only() {
        let mut fx = fixture();
        let mut bob_obj = WorldObject::new("players/bob", "bob");
        bob_obj.capabilities.player = Some(PlayerState::new("bob"));
        let bob = fx.world.register(bob_obj);
        let bob_session = Arc::new(MockSession::new());
        fx.binder.bind(bob, bob_session.clone());

        run(&mut fx, "tell bob meet me at the glade").unwrap();
        assert!(
            bob_session
                .transcript()
                .contains("alice tells you, \"meet me at the glade\"")
        );

        fx.binder.unbind(bob);
        let err = run(&mut fx, "tell bob still there?").unwrap_err();
        assert!(err.player_message().contains("isn't here right now"));
    }

    #[test]
    fn save_suspends_into_persistence() {
        let mut fx = fixture();
        let outcome = run(&mut fx, "@save").unwrap();
        let CommandOutcome::Suspend {
            op: AsyncOp::SavePlayer { name, data },
            ..
        } = outcome
        else {
            panic!("expected save suspension");
        };
        assert_eq!(name, "alice");
        assert!(data.get("object").is_some());
    }
}
