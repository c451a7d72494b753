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

//! The world loop: one OS thread owning the object graph, fed by a
//! message queue. Commands execute serially; heartbeat ticks interleave
//! between messages, never inside one. Handlers that need async work
//! (scripts, persistence, AI calls, awaited input) suspend; completions
//! re-enter the queue and resume them, so the world keeps ticking while
//! a player waits.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use ember_common::proto::payloads::{IdeAction, IdeRequest, IdeSaveResultPayload};
use ember_common::{DisconnectReason, FrameType, ObjId};

use crate::daemons::DaemonRegistry;
use crate::daemons::core::PermissionsDaemon;
use crate::dispatch::{
    AsyncOp, CommandError, CommandInput, CommandOutcome, DispatchCtx, Dispatcher, ResumeFn,
};
use crate::heartbeat;
use crate::object::{InputHandlerEntry, LivingState, PlayerState, WorldObject};
use crate::session::{Session, SessionBinder};
use crate::world::{HookInvocation, World};

pub mod save;

#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// One heartbeat pass per this period.
    pub tick_period: Duration,
    pub prompt: String,
    /// Singleton blueprint path players enter the world at.
    pub start_room: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(1),
            prompt: "> ".to_string(),
            start_room: None,
        }
    }
}

#[derive(Clone, Debug, Error)]
pub enum RuntimeError {
    #[error("the world is not running")]
    WorldGone,
    #[error("could not restore player: {0}")]
    RestoreFailed(String),
}

/// Messages into the world thread. Everything the outside touches goes
/// through these; replies ride oneshot channels.
pub enum WorldMessage {
    SubmitInput {
        player: ObjId,
        line: String,
    },
    SubmitIde {
        player: ObjId,
        request: IdeRequest,
    },
    /// Bind (or rebind) a named player to a session, materializing the
    /// player from a save document on first entry.
    EnterWorld {
        name: String,
        save: Option<Value>,
        /// Set on first-time creation; ignored for existing players.
        credential_hash: Option<String>,
        session: Arc<dyn Session>,
        reply: oneshot::Sender<Result<ObjId, RuntimeError>>,
    },
    /// Resolve a singleton object path (sandbox `find_object`).
    FindObject {
        path: String,
        reply: oneshot::Sender<Option<ObjId>>,
    },
    /// Stamp an instance from a blueprint (sandbox `clone_object`).
    CloneObject {
        path: String,
        reply: oneshot::Sender<Result<ObjId, RuntimeError>>,
    },
    /// Destroy an object (sandbox `destruct`). Replies whether the id
    /// was live.
    Destruct {
        id: ObjId,
        reply: oneshot::Sender<bool>,
    },
    /// Connection dropped; player stays, eligible for resume.
    Disconnect {
        player: ObjId,
    },
    /// An async operation launched for a suspension finished.
    AsyncComplete {
        token: u64,
        result: Result<Value, String>,
    },
    Snapshot {
        reply: oneshot::Sender<Value>,
    },
    /// Save documents for every connected player, for the autosave tick.
    ConnectedSaves {
        reply: oneshot::Sender<Vec<(String, Value)>>,
    },
    VisibleVerbs {
        player: ObjId,
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Close every session and stop the loop. Replies with each daemon's
    /// serialized state, reverse registration order, for persistence.
    Shutdown {
        reply: oneshot::Sender<Vec<(String, Value)>>,
    },
}

/// Cloneable client handle to the world thread.
#[derive(Clone)]
pub struct WorldHandle {
    tx: flume::Sender<WorldMessage>,
}

impl WorldHandle {
    pub fn submit_input(&self, player: ObjId, line: String) -> Result<(), RuntimeError> {
        self.tx
            .send(WorldMessage::SubmitInput { player, line })
            .map_err(|_| RuntimeError::WorldGone)
    }

    pub fn submit_ide(&self, player: ObjId, request: IdeRequest) -> Result<(), RuntimeError> {
        self.tx
            .send(WorldMessage::SubmitIde { player, request })
            .map_err(|_| RuntimeError::WorldGone)
    }

    pub fn enter_world(
        &self,
        name: String,
        save: Option<Value>,
        credential_hash: Option<String>,
        session: Arc<dyn Session>,
    ) -> Result<oneshot::Receiver<Result<ObjId, RuntimeError>>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorldMessage::EnterWorld {
                name,
                save,
                credential_hash,
                session,
                reply,
            })
            .map_err(|_| RuntimeError::WorldGone)?;
        Ok(rx)
    }

    pub fn find_object(&self, path: String) -> Result<oneshot::Receiver<Option<ObjId>>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorldMessage::FindObject { path, reply })
            .map_err(|_| RuntimeError::WorldGone)?;
        Ok(rx)
    }

    pub fn clone_object(
        &self,
        path: String,
    ) -> Result<oneshot::Receiver<Result<ObjId, RuntimeError>>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorldMessage::CloneObject { path, reply })
            .map_err(|_| RuntimeError::WorldGone)?;
        Ok(rx)
    }

    pub fn destruct(&self, id: ObjId) -> Result<oneshot::Receiver<bool>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorldMessage::Destruct { id, reply })
            .map_err(|_| RuntimeError::WorldGone)?;
        Ok(rx)
    }

    pub fn disconnect(&self, player: ObjId) -> Result<(), RuntimeError> {
        self.tx
            .send(WorldMessage::Disconnect { player })
            .map_err(|_| RuntimeError::WorldGone)
    }

    pub fn async_complete(&self, token: u64, result: Result<Value, String>) {
        // The world going away mid-operation just discards the result.
        let _ = self.tx.send(WorldMessage::AsyncComplete { token, result });
    }

    pub fn snapshot(&self) -> Result<oneshot::Receiver<Value>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorldMessage::Snapshot { reply })
            .map_err(|_| RuntimeError::WorldGone)?;
        Ok(rx)
    }

    pub fn connected_saves(
        &self,
    ) -> Result<oneshot::Receiver<Vec<(String, Value)>>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorldMessage::ConnectedSaves { reply })
            .map_err(|_| RuntimeError::WorldGone)?;
        Ok(rx)
    }

    pub fn visible_verbs(
        &self,
        player: ObjId,
    ) -> Result<oneshot::Receiver<Vec<String>>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorldMessage::VisibleVerbs { player, reply })
            .map_err(|_| RuntimeError::WorldGone)?;
        Ok(rx)
    }

    pub fn shutdown(&self) -> Option<oneshot::Receiver<Vec<(String, Value)>>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(WorldMessage::Shutdown { reply }).ok()?;
        Some(rx)
    }
}

/// Launches a suspension's async operation off the world thread and
/// posts the result back through the handle. The daemon provides the
/// tokio-backed implementation; tests use inline ones.
pub trait AsyncLauncher: Send {
    fn launch(&self, token: u64, op: AsyncOp, handle: WorldHandle);
}

enum Suspension {
    Command {
        player: ObjId,
        input: CommandInput,
        resume: ResumeFn,
    },
    /// Fire-and-forget hook; a failure opts the object out of heartbeat
    /// for one tick.
    Hook { target: ObjId, hook: String },
}

pub struct WorldRuntime {
    world: World,
    dispatcher: Dispatcher,
    daemons: DaemonRegistry,
    binder: SessionBinder,
    config: KernelConfig,
    launcher: Box<dyn AsyncLauncher>,
    rx: flume::Receiver<WorldMessage>,
    handle: WorldHandle,
    /// Objects skipping exactly the next tick after a failed handler.
    skip_ticks: HashSet<ObjId>,
    /// Players who already ran a command since the last tick; further
    /// input queues until the tick turns over.
    ran_this_tick: HashSet<ObjId>,
    suspensions: HashMap<u64, Suspension>,
    next_token: u64,
    /// Outstanding input requests: request id -> suspension token.
    line_requests: HashMap<Uuid, u64>,
    /// Signaled when an in-world admin requests shutdown.
    shutdown_requests: Option<flume::Sender<()>>,
    clock: crate::gametime::GameClock,
    last_game_minute: Option<(u32, u8, u8)>,
    ticks: u64,
}

impl WorldRuntime {
    pub fn new(
        world: World,
        daemons: DaemonRegistry,
        config: KernelConfig,
        launcher: Box<dyn AsyncLauncher>,
        shutdown_requests: Option<flume::Sender<()>>,
    ) -> (Self, WorldHandle) {
        let (tx, rx) = flume::unbounded();
        let handle = WorldHandle { tx };
        let runtime = Self {
            world,
            dispatcher: Dispatcher::default(),
            daemons,
            binder: SessionBinder::new(),
            config,
            launcher,
            rx,
            handle: handle.clone(),
            skip_ticks: HashSet::new(),
            ran_this_tick: HashSet::new(),
            suspensions: HashMap::new(),
            next_token: 1,
            line_requests: HashMap::new(),
            shutdown_requests,
            clock: crate::gametime::GameClock::default(),
            last_game_minute: None,
            ticks: 0,
        };
        (runtime, handle)
    }

    /// Run the loop on the current thread until shutdown.
    pub fn run(mut self) {
        info!("world loop starting");
        let mut next_tick = Instant::now() + self.config.tick_period;
        loop {
            match self.rx.recv_deadline(next_tick) {
                Ok(msg) => {
                    if self.handle_message(msg) {
                        break;
                    }
                    // A busy queue must not starve the heartbeat.
                    if Instant::now() >= next_tick {
                        self.tick();
                        next_tick = Instant::now() + self.config.tick_period;
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    self.tick();
                    next_tick = Instant::now() + self.config.tick_period;
                }
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("world loop done");
    }

    /// Spawn the loop on its own named thread.
    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("world".to_string())
            .spawn(move || self.run())
            .expect("Failed to spawn world thread")
    }

    fn alloc_token(&mut self, suspension: Suspension) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.suspensions.insert(token, suspension);
        token
    }

    /// Returns true when the loop should exit.
    fn handle_message(&mut self, msg: WorldMessage) -> bool {
        match msg {
            WorldMessage::SubmitInput { player, line } => {
                self.process_input(player, line);
                false
            }
            WorldMessage::SubmitIde { player, request } => {
                self.process_ide(player, request);
                false
            }
            WorldMessage::EnterWorld {
                name,
                save,
                credential_hash,
                session,
                reply,
            } => {
                let result = self.enter_world(&name, save, credential_hash, session);
                let _ = reply.send(result);
                false
            }
            WorldMessage::FindObject { path, reply } => {
                let _ = reply.send(self.world.find_object(&path));
                false
            }
            WorldMessage::CloneObject { path, reply } => {
                let result = self
                    .world
                    .clone_object(&path)
                    .map_err(|e| RuntimeError::RestoreFailed(e.to_string()));
                let _ = reply.send(result);
                false
            }
            WorldMessage::Destruct { id, reply } => {
                let was_live = self.world.contains(id);
                let hooks = self.world.destroy(id);
                self.dispatch_hooks(hooks.into_vec());
                let _ = reply.send(was_live);
                false
            }
            WorldMessage::Disconnect { player } => {
                self.disconnect(player);
                false
            }
            WorldMessage::AsyncComplete { token, result } => {
                self.async_complete(token, result);
                false
            }
            WorldMessage::Snapshot { reply } => {
                if let Err(e) = self.world.check_integrity() {
                    error!(?e, "world failed integrity check before snapshot");
                }
                let _ = reply.send(self.world.snapshot());
                false
            }
            WorldMessage::ConnectedSaves { reply } => {
                let saves: Vec<(String, Value)> = self
                    .binder
                    .bound_players()
                    .filter_map(|p| save::player_to_save(&self.world, p))
                    .collect();
                let _ = reply.send(saves);
                false
            }
            WorldMessage::VisibleVerbs { player, reply } => {
                let _ = reply.send(self.dispatcher.visible_verbs(&self.world, player));
                false
            }
            WorldMessage::Shutdown { reply } => {
                for player in self.binder.bound_players().collect::<Vec<_>>() {
                    self.binder
                        .send_line(player, "The world is shutting down.");
                    if let Some(session) = self.binder.session(player) {
                        let _ = session.disconnect(DisconnectReason::Shutdown);
                    }
                }
                let _ = reply.send(self.daemons.serialize_all());
                true
            }
        }
    }

    // Input ------------------------------------------------------------

    fn process_input(&mut self, player: ObjId, line: String) {
        // The input-handler stack sees the line first.
        let top = self
            .world
            .get(player)
            .and_then(|o| o.capabilities.player.as_ref())
            .and_then(|ps| ps.top_input_handler().cloned());
        match top {
            Some(InputHandlerEntry::LineRequest { request_id, .. }) => {
                self.resume_line_request(player, request_id, line);
                return;
            }
            // Editor sessions consume IDE frames, not plain lines.
            Some(InputHandlerEntry::Editor { .. }) | None => {}
        }

        // One command per player per tick; one in flight at a time.
        let in_flight = self
            .world
            .get(player)
            .and_then(|o| o.capabilities.player.as_ref())
            .map(|ps| ps.command_in_flight)
            .unwrap_or(false);
        if in_flight || self.ran_this_tick.contains(&player) {
            let dropped = self
                .world
                .get_mut(player)
                .and_then(|o| o.capabilities.player.as_mut())
                .and_then(|ps| ps.queue_input(line));
            if dropped.is_some() {
                self.binder
                    .send_line(player, "You're typing too fast; oldest input dropped.");
            }
            return;
        }
        self.ran_this_tick.insert(player);
        self.run_command(player, line);
    }

    fn process_ide(&mut self, player: ObjId, request: IdeRequest) {
        let editing = matches!(
            self.world
                .get(player)
                .and_then(|o| o.capabilities.player.as_ref())
                .and_then(|ps| ps.top_input_handler()),
            Some(InputHandlerEntry::Editor { .. })
        );
        match request.action {
            IdeAction::Open => {
                if let Some(ps) = self
                    .world
                    .get_mut(player)
                    .and_then(|o| o.capabilities.player.as_mut())
                {
                    ps.push_input_handler(InputHandlerEntry::Editor {
                        path: request.path.clone(),
                    });
                }
            }
            IdeAction::Save => {
                if !editing {
                    self.binder.send_frame(
                        player,
                        FrameType::Ide,
                        serde_json::to_value(IdeSaveResultPayload {
                            path: request.path.clone(),
                            ok: false,
                            error: Some("no editor session".to_string()),
                        })
                        .unwrap_or(Value::Null),
                    );
                    return;
                }
                // The write itself is content-gated through the sandbox
                // host functions; here we persist through the blob store.
                let token = self.alloc_token(Suspension::Hook {
                    target: player,
                    hook: "ide_save".to_string(),
                });
                self.launcher.launch(
                    token,
                    AsyncOp::SaveData {
                        namespace: "ide".to_string(),
                        key: sanitize_ide_key(&request.path),
                        value: Value::String(request.content.unwrap_or_default()),
                    },
                    self.handle.clone(),
                );
                self.binder.send_frame(
                    player,
                    FrameType::Ide,
                    serde_json::to_value(IdeSaveResultPayload {
                        path: request.path.clone(),
                        ok: true,
                        error: None,
                    })
                    .unwrap_or(Value::Null),
                );
            }
            IdeAction::Close => {
                if editing {
                    if let Some(ps) = self
                        .world
                        .get_mut(player)
                        .and_then(|o| o.capabilities.player.as_mut())
                    {
                        ps.pop_input_handler();
                    }
                }
            }
        }
    }

    fn resume_line_request(&mut self, player: ObjId, request_id: Uuid, line: String) {
        if let Some(ps) = self
            .world
            .get_mut(player)
            .and_then(|o| o.capabilities.player.as_mut())
        {
            ps.pop_input_handler();
        }
        let Some(token) = self.line_requests.remove(&request_id) else {
            warn!(%player, %request_id, "input for unknown request");
            return;
        };
        self.async_complete(token, Ok(Value::String(line)));
    }

    // Commands ---------------------------------------------------------

    fn run_command(&mut self, player: ObjId, line: String) {
        let Some(input) = CommandInput::parse(player, &line) else {
            self.send_prompt(player);
            return;
        };
        if let Some(ps) = self
            .world
            .get_mut(player)
            .and_then(|o| o.capabilities.player.as_mut())
        {
            ps.command_in_flight = true;
        }

        let (result, raised) = {
            let mut ctx = DispatchCtx::new(&mut self.world, &mut self.binder, &mut self.daemons);
            let dispatcher = &self.dispatcher;
            let result = catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(&mut ctx, &input)));
            (result, ctx.pending_hooks)
        };
        self.dispatch_hooks(raised);
        match result {
            Ok(outcome) => self.apply_outcome(player, input, outcome),
            Err(panic) => {
                error!(%player, verb = %input.verb, ?panic, "command handler panicked");
                self.binder
                    .send_line(player, "Error: internal error in command handler");
                self.finish_command(player);
            }
        }
    }

    fn apply_outcome(
        &mut self,
        player: ObjId,
        input: CommandInput,
        outcome: Result<CommandOutcome, CommandError>,
    ) {
        match outcome {
            Err(e) => {
                self.binder.send_line(player, &e.player_message());
                self.finish_command(player);
            }
            Ok(CommandOutcome::Complete) => self.finish_command(player),
            Ok(CommandOutcome::Quit) => self.quit_player(player),
            Ok(CommandOutcome::Shutdown) => {
                info!(%player, "in-world shutdown requested");
                if let Some(tx) = &self.shutdown_requests {
                    let _ = tx.send(());
                } else {
                    warn!("no shutdown listener registered, ignoring");
                }
                self.finish_command(player);
            }
            Ok(CommandOutcome::Suspend {
                op: AsyncOp::AwaitLine { request_id, prompt },
                resume,
            }) => {
                let token = self.alloc_token(Suspension::Command {
                    player,
                    input,
                    resume,
                });
                self.line_requests.insert(request_id, token);
                if let Some(ps) = self
                    .world
                    .get_mut(player)
                    .and_then(|o| o.capabilities.player.as_mut())
                {
                    ps.push_input_handler(InputHandlerEntry::LineRequest {
                        request_id,
                        prompt: prompt.clone(),
                    });
                }
                self.binder.send_text(player, &prompt);
            }
            Ok(CommandOutcome::Suspend { op, resume }) => {
                let token = self.alloc_token(Suspension::Command {
                    player,
                    input,
                    resume,
                });
                self.launcher.launch(token, op, self.handle.clone());
            }
        }
    }

    fn async_complete(&mut self, token: u64, result: Result<Value, String>) {
        let Some(suspension) = self.suspensions.remove(&token) else {
            warn!(token, "completion for unknown suspension");
            return;
        };
        match suspension {
            Suspension::Command {
                player,
                input,
                resume,
            } => match result {
                Ok(value) => {
                    let (outcome, raised) = {
                        let mut ctx = DispatchCtx::new(&mut self.world, &mut self.binder, &mut self.daemons);
                        let outcome =
                            catch_unwind(AssertUnwindSafe(|| resume(&mut ctx, &input, value)));
                        (outcome, ctx.pending_hooks)
                    };
                    self.dispatch_hooks(raised);
                    match outcome {
                        Ok(outcome) => self.apply_outcome(player, input, outcome),
                        Err(panic) => {
                            error!(%player, ?panic, "command resume panicked");
                            self.binder
                                .send_line(player, "Error: internal error in command handler");
                            self.finish_command(player);
                        }
                    }
                }
                Err(msg) => {
                    self.binder.send_line(player, &format!("Error: {msg}"));
                    self.finish_command(player);
                }
            },
            Suspension::Hook { target, hook } => {
                if let Err(msg) = result {
                    warn!(%target, hook, %msg, "hook failed, skipping object one tick");
                    self.skip_ticks.insert(target);
                }
            }
        }
    }

    fn finish_command(&mut self, player: ObjId) {
        if let Some(ps) = self
            .world
            .get_mut(player)
            .and_then(|o| o.capabilities.player.as_mut())
        {
            ps.command_in_flight = false;
        }
        self.send_prompt(player);
    }

    fn send_prompt(&self, player: ObjId) {
        let enabled = self
            .world
            .get(player)
            .and_then(|o| o.capabilities.player.as_ref())
            .map(|ps| ps.prompt_enabled)
            .unwrap_or(false);
        if enabled {
            self.binder.send_text(player, &self.config.prompt);
        }
    }

    // Session lifecycle -------------------------------------------------

    fn enter_world(
        &mut self,
        name: &str,
        save: Option<Value>,
        credential_hash: Option<String>,
        session: Arc<dyn Session>,
    ) -> Result<ObjId, RuntimeError> {
        // An existing player object of this name is rebound (resume, or
        // login while the old link lingers).
        let existing = self.find_player(name);
        let player = match existing {
            Some(id) => id,
            None => match save {
                Some(payload) => save::player_from_save(&mut self.world, &payload)
                    .map_err(|e| RuntimeError::RestoreFailed(e.to_string()))?,
                None => {
                    let id = self.create_player(name);
                    if let Some(hash) = credential_hash {
                        if let Some(ps) = self
                            .world
                            .get_mut(id)
                            .and_then(|o| o.capabilities.player.as_mut())
                        {
                            ps.credential_hash = hash;
                        }
                    }
                    id
                }
            },
        };

        // Permission level follows the permissions daemon.
        let level = self
            .daemons
            .get::<PermissionsDaemon>()
            .map(|p| p.level_for(name))
            .unwrap_or_default();
        if let Some(ps) = self
            .world
            .get_mut(player)
            .and_then(|o| o.capabilities.player.as_mut())
        {
            ps.permission = level;
            ps.input_stack.clear();
            ps.input_queue.clear();
            ps.command_in_flight = false;
            ps.prompt_enabled = true;
        }

        if let Some(obj) = self.world.get_mut(player) {
            obj.set_prop("clean_quit", Value::Bool(false));
        }

        // Into the start room on first entry; stay put on rebind.
        let in_void = self
            .world
            .get(player)
            .map(|o| o.environment.is_none())
            .unwrap_or(false);
        if in_void {
            if let Some(start) = self.config.start_room.clone() {
                match self.world.load_object(&start) {
                    Ok(room) => match self.world.move_to(player, Some(room)) {
                        Ok(hooks) => self.dispatch_hooks(hooks.into_vec()),
                        Err(e) => warn!(?e, "could not place player in start room"),
                    },
                    Err(e) => warn!(?e, start, "start room unavailable"),
                }
            }
        }

        if let Some(prev) = self.binder.bind(player, session) {
            let _ = prev.disconnect(DisconnectReason::ResumedElsewhere);
        }
        self.binder.send_line(player, "** Connected **");
        self.binder.emit_stats(&self.world, player);
        let completion = ember_common::proto::payloads::CompletionPayload {
            verbs: self.dispatcher.visible_verbs(&self.world, player),
        };
        self.binder.send_frame(
            player,
            FrameType::Completion,
            serde_json::to_value(completion).unwrap_or(Value::Null),
        );

        // The player's own connect hook, when content defines one.
        if let Some(obj) = self.world.get(player) {
            if let Some(handler) = obj.actions.get("on_connect") {
                self.dispatch_hooks(vec![HookInvocation {
                    target: player,
                    hook: "on_connect".to_string(),
                    handler: handler.clone(),
                    args: vec![],
                }]);
            }
        }
        Ok(player)
    }

    fn find_player(&self, name: &str) -> Option<ObjId> {
        self.world
            .by_name(&name.to_lowercase())
            .iter()
            .copied()
            .find(|&id| {
                self.world
                    .get(id)
                    .and_then(|o| o.capabilities.player.as_ref())
                    .map(|ps| ps.name.eq_ignore_ascii_case(name))
                    .unwrap_or(false)
            })
    }

    fn create_player(&mut self, name: &str) -> ObjId {
        let mut obj = WorldObject::new(format!("players/{}", name.to_lowercase()), name);
        obj.short_desc = name.to_string();
        obj.capabilities.player = Some(PlayerState::new(name));
        obj.capabilities.living = Some(LivingState {
            hp: 20,
            max_hp: 20,
            mp: 10,
            max_mp: 10,
            hp_regen: 1,
            mp_regen: 1,
            ..Default::default()
        });
        let id = self.world.register(obj);
        self.world.set_heartbeat(id, true);
        id
    }

    fn disconnect(&mut self, player: ObjId) {
        let Some(span) = self.binder.unbind(player) else {
            return;
        };
        if let Some(ps) = self
            .world
            .get_mut(player)
            .and_then(|o| o.capabilities.player.as_mut())
        {
            ps.play_time += span;
        }
        info!(%player, ?span, "player disconnected, eligible for resume");
    }

    fn quit_player(&mut self, player: ObjId) {
        if let Some(session) = self.binder.session(player) {
            let _ = session.disconnect(DisconnectReason::Quit);
        }
        self.disconnect(player);
        if let Some(ps) = self
            .world
            .get_mut(player)
            .and_then(|o| o.capabilities.player.as_mut())
        {
            ps.command_in_flight = false;
        }
    }

    // Heartbeat --------------------------------------------------------

    fn tick(&mut self) {
        let started = Instant::now();
        self.ticks += 1;

        let report = heartbeat::run_tick(
            &mut self.world,
            &mut self.skip_ticks,
            self.config.tick_period,
        );
        self.dispatch_hooks(report.hooks);

        // The tick turned over; drain one queued command per player.
        self.ran_this_tick.clear();
        let players: Vec<ObjId> = self.binder.bound_players().collect();
        for player in players {
            let next = self
                .world
                .get_mut(player)
                .and_then(|o| o.capabilities.player.as_mut())
                .filter(|ps| !ps.command_in_flight)
                .and_then(|ps| ps.input_queue.pop_front());
            if let Some(line) = next {
                self.ran_this_tick.insert(player);
                self.run_command(player, line);
            }
        }

        // Monitor streams get a STATS frame per pass.
        let monitors: Vec<ObjId> = self
            .binder
            .bound_players()
            .filter(|&p| {
                self.world
                    .get(p)
                    .and_then(|o| o.capabilities.player.as_ref())
                    .map(|ps| ps.monitor)
                    .unwrap_or(false)
            })
            .collect();
        for player in monitors {
            self.binder.emit_stats(&self.world, player);
        }

        // Broadcast the in-world clock when its minute turns over.
        let game_time = self.clock.now();
        let minute = (game_time.day, game_time.hour, game_time.minute);
        if self.last_game_minute != Some(minute) {
            self.last_game_minute = Some(minute);
            let payload = serde_json::to_value(&game_time).unwrap_or(Value::Null);
            for player in self.binder.bound_players().collect::<Vec<_>>() {
                self.binder
                    .send_frame(player, FrameType::Gametime, payload.clone());
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.tick_period * 3 {
            warn!(
                ?elapsed,
                period = ?self.config.tick_period,
                "heartbeat pass is running away"
            );
        }
    }

    fn dispatch_hooks(&mut self, hooks: Vec<HookInvocation>) {
        for hook in hooks {
            match hook.handler {
                crate::object::ActionHandler::Script { module, export } => {
                    let mut args =
                        vec![serde_json::to_value(hook.target).unwrap_or(Value::Null)];
                    args.extend(hook.args);
                    let token = self.alloc_token(Suspension::Hook {
                        target: hook.target,
                        hook: hook.hook,
                    });
                    self.launcher.launch(
                        token,
                        AsyncOp::RunScript {
                            module,
                            export,
                            args,
                        },
                        self.handle.clone(),
                    );
                }
                crate::object::ActionHandler::Builtin { name } => {
                    // Builtin hooks are driver-internal; "noop" is the
                    // only one today and exists for tests.
                    if name != "noop" {
                        warn!(hook = %hook.hook, builtin = %name, "unknown builtin hook");
                    }
                }
            }
        }
    }
}

fn sanitize_ide_key(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
