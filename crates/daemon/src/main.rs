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

//! The ember server process. Boot order is fixed: persistence first,
//! then the world (snapshot restore and blueprints), then daemons, and
//! the network only once everything behind it is ready. Shutdown runs
//! the same order in reverse under a bounded deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use eyre::{Context, Report, bail};
use rand::RngCore;
use tracing::{error, info, warn};

use ember_common::build;
use ember_db::{AdapterConfig, PersistenceAdapter, RemoteConfig, mk_adapter};
use ember_kernel::dispatch::AsyncOp;
use ember_kernel::world::{Blueprint, World};
use ember_kernel::{AsyncLauncher, DaemonRegistry, KernelConfig, WorldHandle, WorldRuntime};
use ember_sandbox::{IsolatePool, ScriptRunner};

use ember_daemon::args::{Args, PersistenceKind};
use ember_daemon::launcher::TokioLauncher;
use ember_daemon::sessions::{DEFAULT_SESSION_CAP, SessionManager};
use ember_daemon::links::LinkAdapter;
use ember_daemon::state::AppState;
use ember_daemon::{connections, hostfns, lifecycle, links, web};

/// Delegates to the real executor once it exists. The world thread needs
/// a launcher at construction, but the executor needs the world handle;
/// this breaks the cycle.
#[derive(Clone, Default)]
struct LateLauncher {
    inner: Arc<std::sync::OnceLock<TokioLauncher>>,
}

impl AsyncLauncher for LateLauncher {
    fn launch(&self, token: u64, op: AsyncOp, handle: WorldHandle) {
        match self.inner.get() {
            Some(launcher) => launcher.launch(token, op, handle),
            None => handle.async_complete(token, Err("executor not ready".to_string())),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Report> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    info!(version = build::PKG_VERSION, "ember daemon starting");

    // Boot failures from here down are fatal and loud.
    let _lock = lifecycle::acquire_data_directory_lock(&args.data_path)?;

    let adapter: Arc<dyn PersistenceAdapter> = mk_adapter(&adapter_config(&args)?)
        .context("initializing persistence adapter")?
        .into();

    // World: blueprints from the store, then the last snapshot.
    let mut world = World::new();
    load_blueprints(adapter.as_ref(), &mut world)?;
    let world_loaded = adapter
        .load_world()
        .context("reading world snapshot")?;
    if let Some(snapshot) = world_loaded {
        world
            .restore(&snapshot)
            .map_err(|e| eyre::eyre!("world snapshot unusable: {e}"))?;
        info!("world snapshot restored");
    } else {
        info!("no world snapshot, starting fresh");
    }

    // Daemons restore before the network opens; a restore failure under
    // an abort-boot policy stops us here.
    let mut daemons = DaemonRegistry::with_core_daemons();
    daemons
        .init(adapter.as_ref())
        .context("initializing daemons")?;

    let (shutdown_requests_tx, shutdown_requests_rx) = flume::unbounded::<()>();
    let kernel_config = KernelConfig {
        tick_period: args.tick_period(),
        prompt: "> ".to_string(),
        start_room: args.start_room.clone(),
    };
    let late_launcher = LateLauncher::default();
    let (runtime, world_handle) = WorldRuntime::new(
        world,
        daemons,
        kernel_config,
        Box::new(late_launcher.clone()),
        Some(shutdown_requests_tx),
    );
    let world_thread = runtime.spawn();

    // Script execution: pool, host bridge, executor. The connection
    // registry exists already so the bridge can answer who-style
    // queries.
    let registry = connections::ConnectionRegistry::new();
    let pool = Arc::new(IsolatePool::new(
        args.isolate_pool_size,
        args.isolate_memory_mb,
    ));
    let host_registry = hostfns::standard_registry(
        world_handle.clone(),
        registry.clone(),
        args.data_path.clone(),
        args.ai_api_key.clone(),
    );
    let runner = Arc::new(ScriptRunner::new(pool.clone(), Arc::new(host_registry)));
    let executor = TokioLauncher::new(
        tokio::runtime::Handle::current(),
        runner,
        adapter.clone(),
        args.ai_api_key.clone(),
        args.script_timeout(),
        args.data_path.join("scripts"),
    );
    if late_launcher.inner.set(executor).is_err() {
        bail!("executor initialized twice");
    }

    let sessions = Arc::new(SessionManager::new(
        session_secret(&args),
        args.session_ttl(),
        DEFAULT_SESSION_CAP,
        false,
    ));
    let ready = Arc::new(AtomicBool::new(true));
    let app = AppState {
        world: world_handle.clone(),
        registry: registry.clone(),
        sessions,
        adapter: adapter.clone(),
        ready: ready.clone(),
        session_ttl: args.session_ttl(),
        game_version: build::version_string(),
    };

    // Heartbeat sweep and autosave run beside the listener.
    {
        let registry = registry.clone();
        let world = world_handle.clone();
        let interval = args.heartbeat_interval();
        let max_missed = args.max_missed_pongs;
        let game_version = build::version_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                connections::heartbeat_sweep(&registry, &world, max_missed, &game_version);
            }
        });
    }
    tokio::spawn(lifecycle::autosave_loop(
        world_handle.clone(),
        adapter.clone(),
        args.autosave_interval(),
    ));

    let links = spawn_links(adapter.as_ref());

    let router = web::mk_routes(app, args.client_dir.clone());
    let listen = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(%listen, "accepting connections");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_requests_rx))
    .await
    .context("server error")?;

    // Accept socket is closed; run the bounded shutdown sequence.
    ready.store(false, Ordering::SeqCst);
    let deadline = args.shutdown_deadline();
    let shutdown = lifecycle::run_shutdown(
        world_handle,
        registry,
        links,
        pool,
        adapter,
    );
    if tokio::time::timeout(deadline, shutdown).await.is_err() {
        error!(?deadline, "shutdown deadline exceeded, exiting hard");
        std::process::exit(1);
    }

    if world_thread.join().is_err() {
        warn!("world thread panicked during shutdown");
    }
    info!("goodbye");
    Ok(())
}

fn adapter_config(args: &Args) -> Result<AdapterConfig, Report> {
    match args.persistence_adapter {
        PersistenceKind::Filesystem => Ok(AdapterConfig::Filesystem {
            data_path: args.data_path.clone(),
        }),
        PersistenceKind::Remote => {
            let (Some(url), Some(key)) = (
                args.remote_store_url.clone(),
                args.remote_store_key.clone(),
            ) else {
                bail!("remote adapter requires REMOTE_STORE_URL and REMOTE_STORE_KEY");
            };
            Ok(AdapterConfig::Remote(RemoteConfig {
                url,
                key,
                image_bucket: "images".to_string(),
            }))
        }
    }
}

fn session_secret(args: &Args) -> Vec<u8> {
    match &args.session_secret {
        Some(secret) => secret.as_bytes().to_vec(),
        None => {
            warn!("SESSION_SECRET not set; sessions will not survive a restart");
            let mut secret = vec![0u8; 32];
            rand::rng().fill_bytes(&mut secret);
            secret
        }
    }
}

/// Register content blueprints from the `blueprints` namespace.
fn load_blueprints(adapter: &dyn PersistenceAdapter, world: &mut World) -> Result<(), Report> {
    let keys = adapter
        .list_keys("blueprints")
        .context("listing blueprints")?;
    let mut loaded = 0usize;
    for key in keys {
        let Some(value) = adapter
            .load_data("blueprints", &key)
            .with_context(|| format!("reading blueprint {key}"))?
        else {
            continue;
        };
        match serde_json::from_value::<Blueprint>(value) {
            Ok(blueprint) => {
                world.blueprints.register(blueprint);
                loaded += 1;
            }
            Err(e) => warn!(key, %e, "skipping unreadable blueprint"),
        }
    }
    info!(loaded, "blueprints registered");
    Ok(())
}

/// Spawn outbound federation links declared in the `links` namespace:
/// `{name, addr, buffer_cap?}` per entry. Inbound events surface to the
/// channel daemons through content; the core just keeps the links
/// alive.
fn spawn_links(adapter: &dyn PersistenceAdapter) -> Vec<Arc<dyn links::LinkAdapter>> {
    let mut spawned: Vec<Arc<dyn links::LinkAdapter>> = vec![];
    let keys = match adapter.list_keys("links") {
        Ok(keys) => keys,
        Err(e) => {
            warn!(%e, "link configuration unavailable");
            return spawned;
        }
    };
    for key in keys {
        let Ok(Some(config)) = adapter.load_data("links", &key) else {
            continue;
        };
        let Some(addr) = config.get("addr").and_then(serde_json::Value::as_str) else {
            warn!(key, "link config missing addr");
            continue;
        };
        let buffer_cap = config
            .get("buffer_cap")
            .and_then(serde_json::Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(links::DEFAULT_BUFFER_CAP);
        let link = links::TcpJsonLink::new(key.clone(), addr.to_string(), buffer_cap);
        let link_name = key.clone();
        link.on_event(Arc::new(move |event| {
            info!(link = %link_name, ?event, "link event");
        }));
        info!(link = key, addr, "link spawned");
        spawned.push(link);
    }
    spawned
}

/// Resolves when any shutdown trigger fires: SIGINT, SIGTERM, or an
/// in-world admin request.
async fn shutdown_signal(admin: flume::Receiver<()>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("SIGINT received"),
        () = terminate => info!("SIGTERM received"),
        _ = admin.recv_async() => info!("admin shutdown requested"),
    }
}
