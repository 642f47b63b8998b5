//! Migration: move one object between two tiers preserving its identity.
//!
//! The copy is staged at the destination before any index state changes,
//! so a crash mid-migration leaves at worst an orphaned destination file
//! (reclaimed by the next scan) while the object stays findable on the
//! source tier. The index swap happens under both backends' write locks,
//! taken in ascending-id order.

use std::fs::OpenOptions;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use log::{debug, warn};
use nix::sys::sendfile::sendfile;

use crate::backend::manager::BackendManager;
use crate::error::{MapperError, Result};
use crate::index::FLAG_EPHEMERAL as OBJ_EPHEMERAL;

impl BackendManager {
    /// Move `uri`'s body to `target_backend_id`.
    ///
    /// Preconditions, each with its own error: the destination must
    /// differ from the source; ephemeral objects may not leave the
    /// volatile tier (and persistent objects may not enter it); the
    /// source must allow migration out and the destination migration in.
    ///
    /// Outstanding handles keep reading the old descriptor until they
    /// release; the next `get` opens the file at the new location.
    pub fn migrate_object(&self, uri: &str, target_backend_id: u32) -> Result<()> {
        let handle = self
            .global_index()
            .lookup(uri)
            .ok_or(MapperError::NotFound)?;
        let source_backend_id = handle.backend_id();

        if source_backend_id == target_backend_id {
            return Err(MapperError::InvalidRequest(
                "source and destination backends are the same".into(),
            ));
        }

        let destination = self
            .backend(target_backend_id)
            .ok_or_else(|| MapperError::Unavailable(format!("no backend {target_backend_id}")))?;
        let source = self
            .backend(source_backend_id)
            .ok_or_else(|| MapperError::Unavailable(format!("no backend {source_backend_id}")))?;

        let ephemeral = handle.flags() & OBJ_EPHEMERAL != 0;
        if ephemeral && !destination.is_ephemeral_only() {
            return Err(MapperError::Storage(
                "ephemeral objects cannot leave the volatile tier".into(),
            ));
        }
        if !ephemeral && destination.is_ephemeral_only() {
            return Err(MapperError::Storage(
                "persistent objects cannot enter an ephemeral-only tier".into(),
            ));
        }

        if !source.can_migrate_out() {
            return Err(MapperError::UnsupportedOp(
                "source backend does not permit migration out",
            ));
        }
        if !destination.can_migrate_in() {
            return Err(MapperError::UnsupportedOp(
                "destination backend does not permit migration in",
            ));
        }

        let size_bytes = handle.size_bytes();
        let source_path = handle.path();
        let destination_path = destination.object_path(uri);

        // Stage the copy before touching any index state.
        if let Some(parent) = destination_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let destination_file: OwnedFd = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&destination_path)?
            .into();

        // A dup survives concurrent slot invalidation for the whole copy.
        let source_fd = handle.dup_fd()?;
        if let Err(err) = copy_object(&source_fd, &destination_file, size_bytes) {
            let _ = std::fs::remove_file(&destination_path);
            return Err(err);
        }
        drop(source_fd);
        drop(destination_file);

        // Both backend write locks, ascending id, then the index swap.
        {
            let (first, second) = if source_backend_id < target_backend_id {
                (&source, &destination)
            } else {
                (&destination, &source)
            };
            let _first_guard = first.state_lock().write();
            let _second_guard = second.state_lock().write();

            source.index.remove(uri);
            source.remove_object(size_bytes);
            source.count_migration_out();

            // Bumps the descriptor generation and closes the cached fd.
            handle
                .entry()
                .set_location(target_backend_id, destination_path.clone());

            if destination.index.insert(handle.entry_ptr()).is_err() {
                warn!("destination index already held {uri} during migration");
            }
            destination.add_object(size_bytes);
            destination.count_migration_in();
        }

        if let Err(err) = std::fs::remove_file(&source_path) {
            warn!("failed to unlink migrated source {}: {err}", source_path.display());
        }

        debug!(
            "migrated {uri}: backend {source_backend_id} -> {target_backend_id} ({size_bytes} bytes)"
        );
        Ok(())
    }

    /// Promote `uri` into the cache backend. A no-op when it is already
    /// cached.
    pub fn cache_object(&self, uri: &str) -> Result<()> {
        let cache_id = self
            .cache_backend_id()
            .ok_or_else(|| MapperError::Unavailable("no cache backend designated".into()))?;

        let current = {
            let handle = self
                .global_index()
                .lookup(uri)
                .ok_or(MapperError::NotFound)?;
            handle.backend_id()
        };
        if current == cache_id {
            return Ok(());
        }
        self.migrate_object(uri, cache_id)
    }

    /// Evict `uri` from the cache back to the default backend. A no-op
    /// when it is not cached.
    pub fn evict_object(&self, uri: &str) -> Result<()> {
        let default_id = self
            .default_backend_id()
            .ok_or_else(|| MapperError::Unavailable("no default backend designated".into()))?;

        let current = {
            let handle = self
                .global_index()
                .lookup(uri)
                .ok_or(MapperError::NotFound)?;
            handle.backend_id()
        };
        if current != self.cache_backend_id().unwrap_or(u32::MAX) {
            return Ok(());
        }
        self.migrate_object(uri, default_id)
    }
}

/// Kernel-side copy of `size_bytes` from `source` to `destination`.
/// A short transfer is an error; the caller unlinks the staged file.
fn copy_object(source: &OwnedFd, destination: &OwnedFd, size_bytes: u64) -> Result<()> {
    let mut offset: libc::off_t = 0;
    let mut remaining = size_bytes as usize;

    while remaining > 0 {
        let sent = sendfile(
            destination.as_fd(),
            source.as_fd(),
            Some(&mut offset),
            remaining,
        )?;
        if sent == 0 {
            break;
        }
        remaining -= sent;
    }

    if remaining > 0 {
        return Err(MapperError::Storage(format!(
            "short copy: {} of {size_bytes} bytes transferred",
            size_bytes as usize - remaining
        )));
    }
    Ok(())
}
