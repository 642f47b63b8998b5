//! The daemon server: accept loop and per-connection request dispatch.
//!
//! Each accepted client runs on its own OS thread. The URI space carries
//! the operation for V1 compatibility: `/delete/<uri>` deletes, `/list`
//! and `/backend/...` answer `UNSUPPORTED_OP`, and anything else is a
//! single-FD request whose polarity is resolved by existence: an indexed
//! URI is a GET, an unknown one is a PUT (create and hand back the
//! writable descriptor).

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::backend::{BackendManager, CreateRequest};
use crate::error::{MapperError, Result, Status};
use crate::protocol::{
    Hello, Received, Request, Response, ServerConnection, CAP_OOO_REPLIES, CAP_PIPELINING,
    CAP_SEGMENTED_DELIVERY, MODE_FDPASS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Capabilities declared in the V2 hello-ack.
    pub capabilities: u16,
    pub max_pipeline: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            socket_path: PathBuf::from("/tmp/objmapper.sock"),
            capabilities: CAP_OOO_REPLIES | CAP_PIPELINING | CAP_SEGMENTED_DELIVERY,
            max_pipeline: 64,
        }
    }
}

/// Daemon-wide request counters.
#[derive(Debug, Default)]
pub struct DaemonStats {
    pub requests_total: AtomicU64,
    pub gets: AtomicU64,
    pub puts: AtomicU64,
    pub deletes: AtomicU64,
    pub errors: AtomicU64,
    pub active_connections: AtomicU64,
}

impl DaemonStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64, u64) {
        (
            self.requests_total.load(Ordering::Relaxed),
            self.gets.load(Ordering::Relaxed),
            self.puts.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
            self.active_connections.load(Ordering::Relaxed),
        )
    }
}

pub struct Server {
    manager: Arc<BackendManager>,
    config: ServerConfig,
    stats: Arc<DaemonStats>,
    running: Arc<AtomicBool>,
}

impl Server {
    pub fn new(manager: Arc<BackendManager>, config: ServerConfig) -> Server {
        Server {
            manager,
            config,
            stats: Arc::new(DaemonStats::default()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stats(&self) -> Arc<DaemonStats> {
        Arc::clone(&self.stats)
    }

    /// Shared flag a signal handler can clear to stop the accept loop.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Bind the socket and serve until the running flag clears. Active
    /// connections are drained before the socket path is unlinked.
    pub fn run(&self) -> Result<()> {
        let path = &self.config.socket_path;
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        listener.set_nonblocking(true)?;
        info!("listening on {}", path.display());

        let mut workers: Vec<std::thread::JoinHandle<()>> = Vec::new();

        while self.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let manager = Arc::clone(&self.manager);
                    let stats = Arc::clone(&self.stats);
                    let running = Arc::clone(&self.running);
                    let capabilities = self.config.capabilities;
                    let max_pipeline = self.config.max_pipeline;
                    workers.push(std::thread::spawn(move || {
                        handle_client(stream, manager, stats, running, capabilities, max_pipeline);
                    }));
                    workers.retain(|worker| !worker.is_finished());
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    if self.running.load(Ordering::Acquire) {
                        error!("accept failed: {err}");
                    }
                    break;
                }
            }
        }

        for worker in workers {
            let _ = worker.join();
        }

        let _ = std::fs::remove_file(path);
        info!("server stopped");
        Ok(())
    }
}

fn handle_client(
    stream: UnixStream,
    manager: Arc<BackendManager>,
    stats: Arc<DaemonStats>,
    running: Arc<AtomicBool>,
    capabilities: u16,
    max_pipeline: u16,
) {
    stats.active_connections.fetch_add(1, Ordering::Relaxed);
    let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));

    let mut conn = ServerConnection::new(stream);
    let hello = Hello {
        capabilities,
        max_pipeline,
        backend_parallelism: manager.enabled_persistent_count().min(255) as u8,
    };

    let params = loop {
        match conn.handshake(&hello) {
            Ok(params) => break params,
            Err(MapperError::Io(err)) if is_timeout(&err) => {
                if !running.load(Ordering::Acquire) {
                    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            }
            Err(err) => {
                debug!("handshake failed: {err}");
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }
    };
    debug!("client connected (v{})", params.version.wire_byte());

    while running.load(Ordering::Acquire) {
        let request = match conn.recv_request() {
            Ok(Received::Request(request)) => request,
            Ok(Received::Close { reason }) => {
                debug!(
                    "client close, reason {}",
                    crate::protocol::close_reason_name(reason)
                );
                let _ = conn.send_close_ack(0);
                break;
            }
            Err(MapperError::Io(err)) if is_timeout(&err) => continue,
            Err(MapperError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("client disconnected");
                break;
            }
            Err(err) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!("request receive failed: {err}");
                let _ = conn.send_error(0, err.status(), &err.to_string());
                break;
            }
        };

        stats.requests_total.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = dispatch(&mut conn, &manager, &stats, &request) {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!("connection dropped while answering {}: {err}", request.uri);
            break;
        }
    }

    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
}

/// `/delete/<uri>` carries the real URI after the seven-byte `/delete`
/// prefix, so `/delete/x` addresses `/x`.
fn delete_target(uri: &str) -> Option<&str> {
    uri.starts_with("/delete/").then(|| &uri["/delete".len()..])
}

/// Handle one request. `Err` means the connection is unusable; an error
/// answered with a status frame returns `Ok`.
fn dispatch(
    conn: &mut ServerConnection,
    manager: &BackendManager,
    stats: &DaemonStats,
    request: &Request,
) -> Result<()> {
    if let Some(target) = delete_target(&request.uri) {
        return handle_delete(conn, manager, stats, request, target);
    }
    if request.uri == "/list" || request.uri.starts_with("/backend/") {
        stats.errors.fetch_add(1, Ordering::Relaxed);
        return conn.send_error(
            request.id,
            Status::UnsupportedOp,
            "LIST is disabled - use management API",
        );
    }

    if manager.object_exists(&request.uri) {
        handle_get(conn, manager, stats, request)
    } else {
        handle_put(conn, manager, stats, request)
    }
}

fn handle_get(
    conn: &mut ServerConnection,
    manager: &BackendManager,
    stats: &DaemonStats,
    request: &Request,
) -> Result<()> {
    let handle = match manager.get_object(&request.uri) {
        Ok(handle) => handle,
        Err(_) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return conn.send_error(request.id, Status::NotFound, "Object not found");
        }
    };

    if request.mode != MODE_FDPASS {
        stats.errors.fetch_add(1, Ordering::Relaxed);
        return conn.send_error(
            request.id,
            Status::UnsupportedOp,
            "Only FD pass mode supported for GET",
        );
    }

    let fd = match handle.dup_fd() {
        Ok(fd) => fd,
        Err(err) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return conn.send_error(request.id, Status::StorageError, &err.to_string());
        }
    };

    // The response owns the server-side duplicate; dropping it after the
    // send closes it, leaving the client's kernel copy as the only one.
    let response = Response::ok_fd(request.id, fd);
    conn.send_response(&response)?;
    stats.gets.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn handle_put(
    conn: &mut ServerConnection,
    manager: &BackendManager,
    stats: &DaemonStats,
    request: &Request,
) -> Result<()> {
    if request.mode != MODE_FDPASS {
        stats.errors.fetch_add(1, Ordering::Relaxed);
        return conn.send_error(
            request.id,
            Status::UnsupportedOp,
            "Only FD pass mode supported for PUT",
        );
    }

    // Replace any object that appeared since the existence check;
    // duplicate index insertion is a hard error.
    if manager.object_exists(&request.uri) {
        let _ = manager.delete_object(&request.uri);
    }

    // The wire carries no placement selector; objects created over the
    // socket are persistent and land on the default backend. Ephemeral
    // placement is a management-API concern.
    let create = CreateRequest::new(&request.uri);

    let handle = match manager.create_object(&create) {
        Ok(handle) => handle,
        Err(err) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return conn.send_error(request.id, err.status(), &err.to_string());
        }
    };

    let fd = match handle.dup_fd() {
        Ok(fd) => fd,
        Err(err) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return conn.send_error(request.id, Status::StorageError, &err.to_string());
        }
    };

    let response = Response::ok_fd(request.id, fd);
    conn.send_response(&response)?;
    stats.puts.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn handle_delete(
    conn: &mut ServerConnection,
    manager: &BackendManager,
    stats: &DaemonStats,
    request: &Request,
    target: &str,
) -> Result<()> {
    match manager.delete_object(target) {
        Ok(()) => {
            let response = Response {
                // Non-zero content length tells V1 peers not to expect a
                // descriptor.
                content_len: 1,
                ..Response::new(request.id, Status::Ok)
            };
            conn.send_response(&response)?;
            stats.deletes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(err) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            conn.send_error(request.id, err.status(), "Object not found")
        }
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
