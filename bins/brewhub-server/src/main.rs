use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use dmr_config::{KvBackend, SharedConfig, toml_config};
use dmr_core::debug;
use dmr_entities::calls::CallTracker;
use dmr_entities::hbrp_server::HbrpServer;
use dmr_entities::instance::InstanceRegistry;
use dmr_entities::ipsc::IpscEntity;
use dmr_entities::parrot::{ParrotEngine, ParrotStore};
use dmr_entities::repeater::SessionClient;
use dmr_entities::router::Router;
use dmr_entities::store::{Db, KvStore, MemoryBus, MemoryKv, PubSub, RedisBus, RedisKv};

/// Load configuration file
fn load_config_from_toml(cfg_path: &str) -> SharedConfig {
    match toml_config::from_file(cfg_path) {
        Ok(c) => c,
        Err(e) => {
            println!("Failed to load configuration from {}: {}", cfg_path, e);
            std::process::exit(1);
        }
    }
}

/// Open the shared KV and bus per the configured backend
fn build_shared_state(cfg: &SharedConfig) -> (Arc<dyn KvStore>, Arc<dyn PubSub>) {
    match cfg.config().kv.backend {
        KvBackend::Memory => {
            eprintln!(" -> In-process KV/bus (single instance)");
            (
                Arc::new(MemoryKv::new()) as Arc<dyn KvStore>,
                Arc::new(MemoryBus::new()) as Arc<dyn PubSub>,
            )
        }
        KvBackend::Redis => {
            let url = cfg
                .config()
                .kv
                .redis_url
                .clone()
                .expect("validated at config load");
            eprintln!(" -> Shared Redis at {}", url);
            let kv = match RedisKv::connect(&url) {
                Ok(kv) => kv,
                Err(e) => {
                    println!("Failed to connect KV at {}: {}", url, e);
                    std::process::exit(1);
                }
            };
            let bus = match RedisBus::connect(&url) {
                Ok(bus) => bus,
                Err(e) => {
                    println!("Failed to connect bus at {}: {}", url, e);
                    std::process::exit(1);
                }
            };
            (Arc::new(kv) as Arc<dyn KvStore>, Arc::new(bus) as Arc<dyn PubSub>)
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "BrewHub DMR network server",
    long_about = "Runs the Homebrew/MMDVM DMR network server using the provided TOML configuration file"
)]
struct Args {
    /// Config file (required)
    #[arg(help = "TOML config with network/storage parameters")]
    config: String,
}

fn main() {
    eprintln!("░█▀▄░█▀▄░█▀▀░█░█░█░█░█░█░█▀▄");
    eprintln!("░█▀▄░█▀▄░█▀▀░█▄█░█▀█░█░█░█▀▄");
    eprintln!("░▀▀░░▀░▀░▀▀▀░▀░▀░▀░▀░▀▀▀░▀▀░\n");
    eprintln!("    BrewHub {}", dmr_core::SERVER_VERSION);

    let args = Args::parse();
    let cfg = load_config_from_toml(&args.config);
    let _log_guard = debug::setup_logging_default(cfg.config().debug_log.clone());

    // Storage: startup failures are fatal, the hot path never is
    let db = match Db::open(&cfg.config().db.path) {
        Ok(db) => db,
        Err(e) => {
            println!("Failed to open database {}: {}", cfg.config().db.path, e);
            std::process::exit(1);
        }
    };
    let (kv, bus) = build_shared_state(&cfg);
    let sessions = SessionClient::new(kv.clone());

    let stopped = Arc::new(AtomicBool::new(false));

    // Instance registry: heartbeat for multi-replica handoff
    let registry = InstanceRegistry::new(kv.clone());
    if let Err(e) = registry.register() {
        tracing::error!("instance registration failed: {}", e);
    }
    let heartbeat = registry.spawn_heartbeat(stopped.clone());

    // Call tracker and its inactivity sweeper
    let tracker = Arc::new(CallTracker::new(db.clone()));
    let sweeper = CallTracker::spawn_sweeper(tracker.clone(), stopped.clone());

    // One outgoing queue; a single sender thread owns the socket writes
    let (out_tx, out_rx) = crossbeam_channel::bounded::<(Vec<u8>, SocketAddr)>(cfg.config().hbrp.outgoing_queue);

    let parrot = if cfg.config().parrot.enabled {
        eprintln!(" -> Parrot loopback enabled");
        Some(Arc::new(ParrotEngine::new(
            ParrotStore::new(kv.clone()),
            sessions.clone(),
            tracker.clone(),
            out_tx.clone(),
        )))
    } else {
        None
    };

    let router = Arc::new(Router::new(
        db.clone(),
        sessions.clone(),
        tracker,
        parrot,
        bus.clone(),
    ));

    let server = Arc::new(HbrpServer::new(
        cfg.clone(),
        db,
        sessions,
        router.clone(),
        bus,
        registry.clone(),
        stopped.clone(),
        out_tx,
        out_rx,
    ));
    if let Err(e) = server.start() {
        println!("Failed to start server: {}", e);
        std::process::exit(1);
    }

    // Optional IPSC ingress
    let mut ipsc_worker = None;
    if let Some(ipsc_cfg) = cfg.config().ipsc.clone() {
        eprintln!(" -> IPSC ingress enabled (peer id {})", ipsc_cfg.peer_id);
        let entity = IpscEntity::new(ipsc_cfg, router, stopped.clone());
        match entity.start() {
            Ok(handle) => ipsc_worker = Some(handle),
            Err(e) => {
                println!("Failed to start IPSC ingress: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Ctrl+C requests a graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl+C handler");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("shutdown requested");
    server.stop();
    let _ = heartbeat.join();
    let _ = sweeper.join();
    if let Some(handle) = ipsc_worker {
        let _ = handle.join();
    }
    if let Err(e) = registry.deregister() {
        tracing::warn!("instance deregistration failed: {}", e);
    }
    tracing::info!("bye");
}
