//! objmapper daemon entry point.
//!
//! Registers a memory tier (ephemeral + cache) and a persistent tier,
//! scans both, starts the cache promoter, and serves the FD-passing
//! protocol on a Unix socket until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use serde::Serialize;

use objmapper_core::backend::{
    self, BackendKind, BackendManager, PromoterConfig,
};
use objmapper_core::server::{Server, ServerConfig};

/// Tiered object-mapper daemon serving kernel descriptors over a Unix
/// socket.
#[derive(Debug, Parser)]
#[command(name = "objmapper")]
#[command(about = "FD-passing object store with tiered backends")]
struct Cli {
    /// Unix socket path to listen on.
    #[arg(long, default_value = "/tmp/objmapper.sock")]
    socket: PathBuf,

    /// Mount directory for the memory (tmpfs) backend.
    #[arg(long, default_value = "/dev/shm/objmapper")]
    memory_dir: PathBuf,

    /// Memory backend capacity in bytes.
    #[arg(long, default_value_t = 1 << 30)]
    memory_capacity: u64,

    /// Mount directory for the persistent backend.
    #[arg(long, default_value = "/var/tmp/objmapper")]
    persistent_dir: PathBuf,

    /// Persistent backend capacity in bytes.
    #[arg(long, default_value_t = 10 << 30)]
    persistent_capacity: u64,

    /// Global index bucket count (rounded up to a power of two).
    #[arg(long, default_value_t = 8192)]
    buckets: usize,

    /// Cache promoter polling interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    promote_interval_ms: u64,

    /// Minimum hotness for promotion into the cache tier.
    #[arg(long, default_value_t = 0.7)]
    promote_threshold: f64,

    /// Disable the background cache promoter.
    #[arg(long)]
    no_promoter: bool,

    /// Print a JSON status report on shutdown.
    #[arg(long)]
    dump_status: bool,
}

#[derive(Serialize)]
struct BackendReport {
    id: u32,
    name: String,
    kind: &'static str,
    mount: PathBuf,
    capacity_bytes: u64,
    used_bytes: u64,
    object_count: usize,
    utilization: f64,
    reads: u64,
    writes: u64,
    migrations_in: u64,
    migrations_out: u64,
}

#[derive(Serialize)]
struct StatusReport {
    total_objects: usize,
    total_bytes: u64,
    index_lookups: u64,
    index_hits: u64,
    index_misses: u64,
    requests_total: u64,
    gets: u64,
    puts: u64,
    deletes: u64,
    errors: u64,
    backends: Vec<BackendReport>,
}

static RUNNING_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_signal: libc::c_int) {
    if let Some(flag) = RUNNING_FLAG.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

fn install_signal_handlers() {
    #[allow(unsafe_code)]
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn init_backends(cli: &Cli, manager: &Arc<BackendManager>) -> Result<(), String> {
    let memory = manager
        .register(
            BackendKind::Memory,
            cli.memory_dir.clone(),
            "memory0",
            cli.memory_capacity,
            backend::FLAG_EPHEMERAL_ONLY | backend::FLAG_MIGRATION_SRC | backend::FLAG_MIGRATION_DST,
        )
        .map_err(|err| format!("memory backend registration failed: {err}"))?;
    let persistent = manager
        .register(
            BackendKind::Ssd,
            cli.persistent_dir.clone(),
            "persistent0",
            cli.persistent_capacity,
            backend::FLAG_PERSISTENT | backend::FLAG_MIGRATION_SRC | backend::FLAG_MIGRATION_DST,
        )
        .map_err(|err| format!("persistent backend registration failed: {err}"))?;

    manager
        .set_ephemeral(memory)
        .map_err(|err| err.to_string())?;
    manager.set_cache(memory).map_err(|err| err.to_string())?;
    manager
        .set_default(persistent)
        .map_err(|err| err.to_string())?;

    for id in [memory, persistent] {
        if let Err(err) = manager.scan_backend(id) {
            return Err(format!("scan of backend {id} failed: {err}"));
        }
    }
    Ok(())
}

fn status_report(manager: &BackendManager, server: &Server) -> StatusReport {
    let index = manager.index_stats();
    let (requests_total, gets, puts, deletes, errors, _active) = server.stats().snapshot();
    let backends = manager
        .backends()
        .iter()
        .map(|backend| {
            let status = backend.status();
            let stats = backend.stats();
            BackendReport {
                id: backend.id(),
                name: backend.name().to_owned(),
                kind: backend.kind().name(),
                mount: backend.mount().to_owned(),
                capacity_bytes: status.capacity_bytes,
                used_bytes: status.used_bytes,
                object_count: status.object_count,
                utilization: status.utilization,
                reads: stats.reads,
                writes: stats.writes,
                migrations_in: stats.migrations_in,
                migrations_out: stats.migrations_out,
            }
        })
        .collect();

    StatusReport {
        total_objects: manager.total_objects(),
        total_bytes: manager.total_bytes(),
        index_lookups: index.lookups,
        index_hits: index.hits,
        index_misses: index.misses,
        requests_total,
        gets,
        puts,
        deletes,
        errors,
        backends,
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let manager = Arc::new(BackendManager::new(cli.buckets));
    if let Err(message) = init_backends(&cli, &manager) {
        error!("{message}");
        return ExitCode::FAILURE;
    }

    if !cli.no_promoter {
        let config = PromoterConfig {
            interval: Duration::from_millis(cli.promote_interval_ms.max(1)),
            threshold: cli.promote_threshold.clamp(0.0, 1.0),
            ..PromoterConfig::default()
        };
        if let Err(err) = manager.start_caching(config) {
            error!("failed to start cache promoter: {err}");
            return ExitCode::FAILURE;
        }
    }

    let server = Server::new(
        Arc::clone(&manager),
        ServerConfig {
            socket_path: cli.socket.clone(),
            ..ServerConfig::default()
        },
    );

    let _ = RUNNING_FLAG.set(server.running_handle());
    install_signal_handlers();

    let outcome = server.run();

    info!("shutting down");
    manager.shutdown();

    if cli.dump_status {
        let report = status_report(&manager, &server);
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => error!("status report serialization failed: {err}"),
        }
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("server failed: {err}");
            ExitCode::FAILURE
        }
    }
}
