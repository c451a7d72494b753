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

//! Verb resolution and command execution.
//!
//! Lookup order is fixed: player-bound verbs, then the environment's
//! verbs, then actions on objects in scope, then the global command
//! table gated by permission level. First match wins. Commands above a
//! player's level are invisible at lookup, so they can never collide
//! with content verbs.

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use ember_common::{ObjId, PermissionLevel};

use crate::daemons::DaemonRegistry;
use crate::object::ActionHandler;
use crate::session::SessionBinder;
use crate::world::World;

pub use commands::core_commands;

mod commands;

/// One parsed input line: first whitespace-delimited token is the verb,
/// the remainder is the argument string.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandInput {
    pub player: ObjId,
    pub verb: String,
    pub args: String,
    pub line: String,
}

impl CommandInput {
    #[must_use]
    pub fn parse(player: ObjId, line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let (verb, args) = match trimmed.split_once(char::is_whitespace) {
            Some((v, rest)) => (v, rest.trim()),
            None => (trimmed, ""),
        };
        Some(Self {
            player,
            verb: verb.to_lowercase(),
            args: args.to_string(),
            line: trimmed.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    /// Unknown verb; the player sees `What?`.
    #[error("What?")]
    Unknown,
    #[error("Permission denied")]
    PermissionDenied,
    /// Target resolution failed; the message is domain-phrased.
    #[error("{0}")]
    NotFound(String),
    /// Handler failed; the player sees `Error: <message>`.
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// The single line the player sees for this failure.
    #[must_use]
    pub fn player_message(&self) -> String {
        match self {
            CommandError::Unknown => "What?".to_string(),
            CommandError::PermissionDenied => "Permission denied".to_string(),
            CommandError::NotFound(msg) => msg.clone(),
            CommandError::Failed(msg) => format!("Error: {msg}"),
        }
    }
}

/// Asynchronous work a handler suspends on. Launched off the world
/// thread; completion re-enters the queue and resumes the handler.
#[derive(Clone, Debug, PartialEq)]
pub enum AsyncOp {
    /// Run a content script module in the sandbox.
    RunScript {
        module: String,
        export: String,
        args: Vec<Value>,
    },
    /// Outbound AI generation call.
    AiGenerate {
        prompt: String,
        system: Option<String>,
    },
    /// Persist a player save.
    SavePlayer { name: String, data: Value },
    /// Load a namespaced blob.
    LoadData { namespace: String, key: String },
    /// Persist a namespaced blob.
    SaveData {
        namespace: String,
        key: String,
        value: Value,
    },
    /// Wait for one line of input from the player (confirmation
    /// prompts). Handled by the input-handler stack, not the executor.
    AwaitLine { request_id: Uuid, prompt: String },
}

/// Called when a suspended command's async operation completes. Errors
/// surface to the player as a single `Error:` line.
pub type ResumeFn = fn(&mut DispatchCtx, &CommandInput, Value) -> Result<CommandOutcome, CommandError>;

#[derive(Debug)]
pub enum CommandOutcome {
    Complete,
    Suspend { op: AsyncOp, resume: ResumeFn },
    /// Player asked to leave cleanly: save, mark clean, close.
    Quit,
    /// Admin requested orderly process shutdown.
    Shutdown,
}

/// Everything a handler may touch. All world mutation inside a handler's
/// synchronous segment is observed atomically by later handlers.
pub struct DispatchCtx<'a> {
    pub world: &'a mut World,
    pub binder: &'a mut SessionBinder,
    pub daemons: &'a mut DaemonRegistry,
    /// Hooks raised by graph mutations inside the handler; the runtime
    /// dispatches them after the synchronous segment ends.
    pub pending_hooks: Vec<crate::world::HookInvocation>,
}

impl<'a> DispatchCtx<'a> {
    pub fn new(
        world: &'a mut World,
        binder: &'a mut SessionBinder,
        daemons: &'a mut DaemonRegistry,
    ) -> Self {
        Self {
            world,
            binder,
            daemons,
            pending_hooks: vec![],
        }
    }
}

pub type BuiltinCommandFn = fn(&mut DispatchCtx, &CommandInput) -> Result<CommandOutcome, CommandError>;

pub struct CommandDef {
    pub verb: &'static str,
    pub aliases: &'static [&'static str],
    pub min_level: PermissionLevel,
    pub handler: BuiltinCommandFn,
}

impl CommandDef {
    fn matches(&self, verb: &str) -> bool {
        self.verb == verb || self.aliases.contains(&verb)
    }
}

pub struct Dispatcher {
    global: Vec<CommandDef>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(core_commands())
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(global: Vec<CommandDef>) -> Self {
        Self { global }
    }

    /// Resolve and run one command line for a player.
    pub fn dispatch(
        &self,
        ctx: &mut DispatchCtx,
        input: &CommandInput,
    ) -> Result<CommandOutcome, CommandError> {
        let verb = input.verb.as_str();
        let player = input.player;

        // (a) player-bound verbs.
        if let Some(handler) = object_verb(ctx.world, player, verb) {
            return run_action(ctx, input, player, handler);
        }

        // (b) environment (room) verbs.
        let env = ctx.world.get(player).and_then(|p| p.environment);
        if let Some(env) = env {
            if let Some(handler) = object_verb(ctx.world, env, verb) {
                return run_action(ctx, input, env, handler);
            }
        }

        // (c) actions on objects in scope: inventory plus the
        // environment's inventory.
        for candidate in scope_objects(ctx.world, player, env) {
            if let Some(handler) = object_verb(ctx.world, candidate, verb) {
                return run_action(ctx, input, candidate, handler);
            }
        }

        // (d) the global table, scoped by permission level.
        let level = player_level(ctx.world, player);
        if let Some(def) = self
            .global
            .iter()
            .find(|def| def.matches(verb) && level.satisfies(def.min_level))
        {
            return (def.handler)(ctx, input);
        }

        Err(CommandError::Unknown)
    }

    /// The verbs visible to a player right now: content verbs in scope
    /// plus permitted global commands. Drives `COMPLETION` frames.
    #[must_use]
    pub fn visible_verbs(&self, world: &World, player: ObjId) -> Vec<String> {
        let mut verbs: Vec<String> = vec![];
        let env = world.get(player).and_then(|p| p.environment);

        let mut collect_from = |id: ObjId| {
            if let Some(obj) = world.get(id) {
                verbs.extend(
                    obj.actions
                        .keys()
                        .filter(|k| !k.starts_with("on_"))
                        .cloned(),
                );
            }
        };
        collect_from(player);
        if let Some(env) = env {
            collect_from(env);
        }
        for candidate in scope_objects(world, player, env) {
            collect_from(candidate);
        }

        let level = player_level(world, player);
        verbs.extend(
            self.global
                .iter()
                .filter(|def| level.satisfies(def.min_level))
                .map(|def| def.verb.to_string()),
        );
        verbs.sort();
        verbs.dedup();
        verbs
    }
}

/// A verb entry on one object's action table. Hook entries (`on_*`) are
/// never verbs.
fn object_verb(world: &World, id: ObjId, verb: &str) -> Option<ActionHandler> {
    let obj = world.get(id)?;
    if verb.starts_with("on_") {
        return None;
    }
    obj.actions.get(verb).cloned()
}

fn scope_objects(world: &World, player: ObjId, env: Option<ObjId>) -> Vec<ObjId> {
    let mut out = vec![];
    if let Some(p) = world.get(player) {
        out.extend(p.inventory.iter().copied());
    }
    if let Some(env_obj) = env.and_then(|e| world.get(e)) {
        out.extend(
            env_obj
                .inventory
                .iter()
                .copied()
                .filter(|&other| other != player),
        );
    }
    out
}

fn player_level(world: &World, player: ObjId) -> PermissionLevel {
    world
        .get(player)
        .and_then(|o| o.capabilities.player.as_ref())
        .map(|ps| ps.permission)
        .unwrap_or_default()
}

fn run_action(
    ctx: &mut DispatchCtx,
    input: &CommandInput,
    target: ObjId,
    handler: ActionHandler,
) -> Result<CommandOutcome, CommandError> {
    match handler {
        ActionHandler::Script { module, export } => Ok(CommandOutcome::Suspend {
            op: AsyncOp::RunScript {
                module,
                export,
                args: vec![
                    serde_json::to_value(input.player).unwrap_or(Value::Null),
                    serde_json::to_value(target).unwrap_or(Value::Null),
                    Value::String(input.verb.clone()),
                    Value::String(input.args.clone()),
                ],
            },
            resume: resume_script_verb,
        }),
        ActionHandler::Builtin { name } => {
            // A content object delegating to a built-in by name.
            let def = core_commands();
            let Some(def) = def.iter().find(|d| d.verb == name) else {
                return Err(CommandError::Failed(format!(
                    "object action references unknown builtin {name:?}"
                )));
            };
            (def.handler)(ctx, input)
        }
    }
}

/// A scripted verb finished. A string result is narrative output; null
/// and other shapes are swallowed.
fn resume_script_verb(
    ctx: &mut DispatchCtx,
    input: &CommandInput,
    result: Value,
) -> Result<CommandOutcome, CommandError> {
    if let Value::String(text) = result {
        ctx.binder.send_line(input.player, &text);
    }
    Ok(CommandOutcome::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::WorldObject;
    use crate::object::{LivingState, PlayerState};

    fn fixture() -> (World, SessionBinder, DaemonRegistry, ObjId, ObjId) {
        let mut world = World::new();
        let room = world.register(WorldObject::new("areas/glade", "glade"));
        let mut player_obj = WorldObject::new("players/alice", "alice");
        player_obj.capabilities.player = Some(PlayerState::new("alice"));
        player_obj.capabilities.living = Some(LivingState::default());
        let player = world.register(player_obj);
        world.move_to(player, Some(room)).unwrap();
        (world, SessionBinder::new(), DaemonRegistry::new(), room, player)
    }

    #[test]
    fn parse_splits_verb_and_args() {
        let input = CommandInput::parse(ObjId(1), "  KILL deer 2  ").unwrap();
        assert_eq!(input.verb, "kill");
        assert_eq!(input.args, "deer 2");
        assert!(CommandInput::parse(ObjId(1), "   ").is_none());
    }

    #[test]
    fn unknown_verb_is_what() {
        let (mut world, mut binder, mut daemons, _room, player) = fixture();
        let dispatcher = Dispatcher::default();
        let mut ctx = DispatchCtx::new(&mut world, &mut binder, &mut daemons);
        let input = CommandInput::parse(player, "frobnicate").unwrap();
        let err = dispatcher.dispatch(&mut ctx, &input).unwrap_err();
        assert!(matches!(err, CommandError::Unknown));
        assert_eq!(err.player_message(), "What?");
    }

    #[test]
    fn player_verbs_shadow_room_verbs_shadow_global() {
        let (mut world, mut binder, mut daemons, room, player) = fixture();

        // A room verb named `look` shadows the global one.
        world.get_mut(room).unwrap().actions.insert(
            "look".into(),
            ActionHandler::Script {
                module: "areas/glade".into(),
                export: "look".into(),
            },
        );
        // And a player-bound `look` shadows the room's.
        world.get_mut(player).unwrap().actions.insert(
            "look".into(),
            ActionHandler::Script {
                module: "players/custom".into(),
                export: "look".into(),
            },
        );

        let dispatcher = Dispatcher::default();
        let mut ctx = DispatchCtx::new(&mut world, &mut binder, &mut daemons);
        let input = CommandInput::parse(player, "look").unwrap();
        let outcome = dispatcher.dispatch(&mut ctx, &input).unwrap();
        let CommandOutcome::Suspend {
            op: AsyncOp::RunScript { module, .. },
            ..
        } = outcome
        else {
            panic!("expected suspension into script");
        };
        assert_eq!(module, "players/custom");
    }

    #[test]
    fn admin_commands_invisible_to_players() {
        let (mut world, mut binder, mut daemons, _room, player) = fixture();
        let dispatcher = Dispatcher::default();

        {
            let mut ctx = DispatchCtx::new(&mut world, &mut binder, &mut daemons);
            let input = CommandInput::parse(player, "@shutdown").unwrap();
            // Invisible, not denied: reads as an unknown verb.
            let err = dispatcher.dispatch(&mut ctx, &input).unwrap_err();
            assert!(matches!(err, CommandError::Unknown));
        }

        world
            .get_mut(player)
            .unwrap()
            .capabilities
            .player
            .as_mut()
            .unwrap()
            .permission = PermissionLevel::Admin;
        let mut ctx = DispatchCtx::new(&mut world, &mut binder, &mut daemons);
        let input = CommandInput::parse(player, "@shutdown").unwrap();
        let outcome = dispatcher.dispatch(&mut ctx, &input).unwrap();
        // Visible to admins; asks for confirmation via the input stack.
        assert!(matches!(
            outcome,
            CommandOutcome::Suspend {
                op: AsyncOp::AwaitLine { .. },
                ..
            }
        ));
    }

    #[test]
    fn visible_verbs_reflect_permissions_and_scope() {
        let (mut world, _binder, _daemons, room, player) = fixture();
        world.get_mut(room).unwrap().actions.insert(
            "pray".into(),
            ActionHandler::Script {
                module: "areas/glade".into(),
                export: "pray".into(),
            },
        );
        world.get_mut(room).unwrap().actions.insert(
            "on_enter".into(),
            ActionHandler::Script {
                module: "areas/glade".into(),
                export: "on_enter".into(),
            },
        );

        let dispatcher = Dispatcher::default();
        let verbs = dispatcher.visible_verbs(&world, player);
        assert!(verbs.contains(&"pray".to_string()));
        assert!(verbs.contains(&"look".to_string()));
        // Hooks and over-level commands stay invisible.
        assert!(!verbs.contains(&"on_enter".to_string()));
        assert!(!verbs.contains(&"@shutdown".to_string()));
    }
}
