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

//! End-to-end exercises of the world loop over its message queue: enter,
//! command dispatch, suspension and resume, per-player serialization,
//! quit, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use ember_common::{DisconnectReason, FrameType, ObjId};
use ember_kernel::dispatch::AsyncOp;
use ember_kernel::world::{Blueprint, World};
use ember_kernel::{
    AsyncLauncher, DaemonRegistry, KernelConfig, MockSession, WorldHandle, WorldRuntime,
};

const TICK: Duration = Duration::from_millis(10);
const WAIT: Duration = Duration::from_secs(5);

/// Completes every operation inline with a canned result, like a
/// perfectly fast executor.
struct InstantLauncher;

impl AsyncLauncher for InstantLauncher {
    fn launch(&self, token: u64, op: AsyncOp, handle: WorldHandle) {
        let result = match op {
            AsyncOp::RunScript { module, .. } => Ok(json!({"module": module})),
            AsyncOp::SavePlayer { .. } => Ok(Value::Bool(true)),
            AsyncOp::SaveData { .. } => Ok(Value::Bool(true)),
            AsyncOp::LoadData { .. } => Ok(Value::Null),
            AsyncOp::AiGenerate { .. } => Ok(Value::String("generated".to_string())),
            AsyncOp::AwaitLine { .. } => unreachable!("await-line never reaches the launcher"),
        };
        handle.async_complete(token, result);
    }
}

fn boot() -> (WorldHandle, std::thread::JoinHandle<()>) {
    let mut world = World::new();
    world.blueprints.register(Blueprint {
        object_path: "areas/glade".into(),
        singleton: true,
        name: "glade".into(),
        long_desc: "Sunlight leaks through the canopy.".into(),
        ..Default::default()
    });

    let daemons = DaemonRegistry::with_core_daemons();
    let config = KernelConfig {
        tick_period: TICK,
        prompt: "> ".into(),
        start_room: Some("areas/glade".into()),
    };
    let (runtime, handle) = WorldRuntime::new(world, daemons, config, Box::new(InstantLauncher), None);
    let join = runtime.spawn();
    (handle, join)
}

fn enter(handle: &WorldHandle, name: &str, session: Arc<MockSession>) -> ObjId {
    handle
        .enter_world(name.to_string(), None, None, session)
        .unwrap()
        .recv_timeout(WAIT)
        .expect("world did not reply")
        .expect("enter failed")
}

fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = std::time::Instant::now() + WAIT;
    while !f() {
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn enter_world_connects_and_look_works() {
    let (handle, _join) = boot();
    let session = Arc::new(MockSession::new());
    let alice = enter(&handle, "alice", session.clone());
    assert!(!alice.is_none());

    wait_for("connect banner", || {
        session.transcript().contains("** Connected **")
    });
    // Stats frame arrives on entry.
    assert!(
        session
            .frames()
            .iter()
            .any(|(ty, _)| *ty == FrameType::Stats)
    );

    handle.submit_input(alice, "look".to_string()).unwrap();
    wait_for("room description", || {
        session.transcript().contains("Sunlight leaks through the canopy.")
    });
}

#[test]
fn unknown_verb_yields_what() {
    let (handle, _join) = boot();
    let session = Arc::new(MockSession::new());
    let alice = enter(&handle, "alice", session.clone());

    handle.submit_input(alice, "frobnicate".to_string()).unwrap();
    wait_for("What?", || session.transcript().contains("What?"));
}

#[test]
fn commands_processed_in_input_order() {
    let (handle, _join) = boot();
    let session = Arc::new(MockSession::new());
    let alice = enter(&handle, "alice", session.clone());

    for i in 0..5 {
        handle
            .submit_input(alice, format!("say message {i}"))
            .unwrap();
    }
    wait_for("all five lines", || {
        session.transcript().contains("message 4")
    });
    let transcript = session.transcript();
    let positions: Vec<_> = (0..5)
        .map(|i| {
            transcript
                .find(&format!("message {i}"))
                .unwrap_or_else(|| panic!("message {i} missing from {transcript}"))
        })
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted, "commands ran out of input order");
}

#[test]
fn save_suspends_and_resumes_with_confirmation() {
    let (handle, _join) = boot();
    let session = Arc::new(MockSession::new());
    let alice = enter(&handle, "alice", session.clone());

    handle.submit_input(alice, "@save".to_string()).unwrap();
    wait_for("save confirmation", || session.transcript().contains("Saved."));
}

#[test]
fn quit_disconnects_cleanly_and_player_survives() {
    let (handle, _join) = boot();
    let session = Arc::new(MockSession::new());
    let alice = enter(&handle, "alice", session.clone());

    handle.submit_input(alice, "quit".to_string()).unwrap();
    wait_for("quit close", || {
        session.disconnected() == Some(DisconnectReason::Quit)
    });

    // Re-entry rebinds the same player object.
    let session2 = Arc::new(MockSession::new());
    let again = enter(&handle, "alice", session2.clone());
    assert_eq!(again, alice);
}

#[test]
fn rebind_closes_previous_session_as_resumed_elsewhere() {
    let (handle, _join) = boot();
    let first = Arc::new(MockSession::new());
    let alice = enter(&handle, "alice", first.clone());

    let second = Arc::new(MockSession::new());
    let rebound = enter(&handle, "alice", second.clone());
    assert_eq!(rebound, alice);
    wait_for("old session closed", || {
        first.disconnected() == Some(DisconnectReason::ResumedElsewhere)
    });
}

#[test]
fn monitor_streams_stats_each_tick() {
    let (handle, _join) = boot();
    let session = Arc::new(MockSession::new());
    let alice = enter(&handle, "alice", session.clone());

    handle.submit_input(alice, "monitor".to_string()).unwrap();
    wait_for("monitor ack", || session.transcript().contains("Monitor is now on."));

    let before = session
        .frames()
        .iter()
        .filter(|(ty, _)| *ty == FrameType::Stats)
        .count();
    wait_for("streamed stats", || {
        let now = session
            .frames()
            .iter()
            .filter(|(ty, _)| *ty == FrameType::Stats)
            .count();
        now >= before + 3
    });
}

#[test]
fn connected_saves_cover_bound_players() {
    let (handle, _join) = boot();
    let a = Arc::new(MockSession::new());
    let b = Arc::new(MockSession::new());
    enter(&handle, "alice", a);
    enter(&handle, "bob", b);

    let saves = handle
        .connected_saves()
        .unwrap()
        .recv_timeout(WAIT)
        .unwrap();
    let mut names: Vec<_> = saves.iter().map(|(n, _)| n.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["alice", "bob"]);
}

#[test]
fn shutdown_closes_sessions_and_stops_loop() {
    let (handle, join) = boot();
    let session = Arc::new(MockSession::new());
    enter(&handle, "alice", session.clone());

    handle
        .shutdown()
        .expect("world gone early")
        .recv_timeout(WAIT)
        .unwrap();
    wait_for("shutdown close", || {
        session.disconnected() == Some(DisconnectReason::Shutdown)
    });
    join.join().unwrap();
}

#[test]
fn admin_shutdown_asks_for_confirmation() {
    let mut world = World::new();
    world.blueprints.register(Blueprint {
        object_path: "areas/glade".into(),
        singleton: true,
        name: "glade".into(),
        ..Default::default()
    });
    let mut daemons = DaemonRegistry::with_core_daemons();
    daemons
        .get_mut::<ember_kernel::daemons::core::PermissionsDaemon>()
        .unwrap()
        .set_level("root", ember_common::PermissionLevel::Admin);

    let (shutdown_tx, shutdown_rx) = flume::unbounded::<()>();
    let config = KernelConfig {
        tick_period: TICK,
        prompt: "> ".into(),
        start_room: Some("areas/glade".into()),
    };
    let (runtime, handle) = WorldRuntime::new(
        world,
        daemons,
        config,
        Box::new(InstantLauncher),
        Some(shutdown_tx),
    );
    runtime.spawn();

    let session = Arc::new(MockSession::new());
    let root = enter(&handle, "root", session.clone());

    handle.submit_input(root, "@shutdown".to_string()).unwrap();
    wait_for("confirmation prompt", || {
        session.transcript().contains("Really shut down the server?")
    });

    // Deny first; the next line goes to the pending request, not the
    // parser.
    handle.submit_input(root, "no".to_string()).unwrap();
    wait_for("abort notice", || {
        session.transcript().contains("Shutdown aborted.")
    });
    assert!(shutdown_rx.try_recv().is_err());

    handle.submit_input(root, "@shutdown".to_string()).unwrap();
    wait_for("second prompt", || {
        session
            .transcript()
            .matches("Really shut down the server?")
            .count()
            >= 2
    });
    handle.submit_input(root, "yes".to_string()).unwrap();
    shutdown_rx
        .recv_timeout(WAIT)
        .expect("shutdown request not raised");
}

#[test]
fn snapshot_reflects_entered_players() {
    let (handle, _join) = boot();
    let session = Arc::new(MockSession::new());
    enter(&handle, "alice", session);

    let snapshot = handle.snapshot().unwrap().recv_timeout(WAIT).unwrap();
    let objects = snapshot["objects"].as_array().unwrap();
    // The glade and the player at minimum.
    assert!(objects.len() >= 2);
    assert!(
        objects
            .iter()
            .any(|o| o["object_path"] == "players/alice")
    );
}
