//! The backend manager: registry of tiers plus the object lifecycle.
//!
//! All daemon-wide state lives here (the global index, the backend
//! array, the designated default/ephemeral/cache backends, and the
//! promoter task handle) and is passed explicitly to every caller; there
//! are no module-level statics.

#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::backend::{BackendInfo, BackendKind};
use crate::clock;
use crate::error::{MapperError, Result};
use crate::index::{
    snapshot, GlobalIndex, IndexEntry, IndexStats, ObjectHandle, FLAG_EPHEMERAL as OBJ_EPHEMERAL,
    FLAG_PERSISTENT as OBJ_PERSISTENT,
};
use crate::payload::PayloadDescriptor;
use crate::protocol::MAX_URI_LEN;

/// Object creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct CreateRequest<'a> {
    pub uri: &'a str,
    /// Explicit target backend; `None` selects by the ephemeral flag.
    pub backend_hint: Option<u32>,
    pub ephemeral: bool,
    /// Advisory; reserved for preallocation.
    pub size_hint: u64,
    /// Extra object flag bits (pinned, compressed, ...).
    pub flags: u32,
}

impl<'a> CreateRequest<'a> {
    pub fn new(uri: &'a str) -> CreateRequest<'a> {
        CreateRequest {
            uri,
            backend_hint: None,
            ephemeral: false,
            size_hint: 0,
            flags: 0,
        }
    }
}

/// Point-in-time description of one object.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub uri: String,
    pub backend_id: u32,
    pub fs_path: PathBuf,
    pub size_bytes: u64,
    pub mtime: u64,
    pub flags: u32,
    pub hotness: f64,
    pub access_count: u64,
    pub payload: Option<PayloadDescriptor>,
}

pub struct BackendManager {
    global_index: GlobalIndex,

    backends: RwLock<Vec<Arc<BackendInfo>>>,

    default_backend: AtomicI64,
    ephemeral_backend: AtomicI64,
    cache_backend: AtomicI64,

    total_objects: AtomicUsize,
    total_bytes: AtomicU64,

    pub(super) cache_running: Arc<AtomicBool>,
    pub(super) cache_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BackendManager {
    pub fn new(global_buckets: usize) -> BackendManager {
        BackendManager {
            global_index: GlobalIndex::new(global_buckets),
            backends: RwLock::new(Vec::new()),
            default_backend: AtomicI64::new(-1),
            ephemeral_backend: AtomicI64::new(-1),
            cache_backend: AtomicI64::new(-1),
            total_objects: AtomicUsize::new(0),
            total_bytes: AtomicU64::new(0),
            cache_running: Arc::new(AtomicBool::new(false)),
            cache_thread: Mutex::new(None),
        }
    }

    pub fn global_index(&self) -> &GlobalIndex {
        &self.global_index
    }

    // -- registration and designation --------------------------------------

    /// Register a tier. The mount directory is created if missing and the
    /// on-disk index snapshot, if present, is loaded into the indexes.
    /// Returns the new backend id.
    pub fn register(
        &self,
        kind: BackendKind,
        mount: impl Into<PathBuf>,
        name: &str,
        capacity_bytes: u64,
        flags: u32,
    ) -> Result<u32> {
        let mount = mount.into();
        std::fs::create_dir_all(&mount)?;

        let mut backends = self.backends.write();
        let id = backends.len() as u32;
        let backend = Arc::new(BackendInfo::new(
            id,
            kind,
            mount,
            name.to_owned(),
            capacity_bytes,
            flags,
        ));

        let snapshot_path = backend.index.snapshot_path().cloned();
        if let Some(path) = snapshot_path {
            if path.exists() {
                match snapshot::load(&path) {
                    Ok(loaded) => {
                        let count = self.materialize_snapshot(&backend, loaded.records);
                        info!(
                            "loaded {count} objects from snapshot for backend {id} ({name})"
                        );
                    }
                    Err(err) => {
                        warn!("backend {id} ({name}): snapshot load failed: {err}");
                    }
                }
            }
        }

        backends.push(backend.clone());
        drop(backends);

        info!(
            "registered backend {id}: {name} ({}) at {}, capacity={} bytes",
            kind.name(),
            backend.mount().display(),
            capacity_bytes
        );
        Ok(id)
    }

    pub fn backend(&self, backend_id: u32) -> Option<Arc<BackendInfo>> {
        self.backends.read().get(backend_id as usize).cloned()
    }

    pub fn backends(&self) -> Vec<Arc<BackendInfo>> {
        self.backends.read().clone()
    }

    /// Count of enabled persistent backends; reported to clients as the
    /// backend parallelism.
    pub fn enabled_persistent_count(&self) -> usize {
        self.backends
            .read()
            .iter()
            .filter(|backend| backend.is_enabled() && backend.is_persistent())
            .count()
    }

    /// Default backend for persistent objects; must not be ephemeral-only.
    pub fn set_default(&self, backend_id: u32) -> Result<()> {
        let backend = self
            .backend(backend_id)
            .ok_or_else(|| MapperError::Unavailable(format!("no backend {backend_id}")))?;
        if backend.is_ephemeral_only() {
            return Err(MapperError::InvalidRequest(
                "default backend must not be ephemeral-only".into(),
            ));
        }
        self.default_backend
            .store(i64::from(backend_id), Ordering::Release);
        Ok(())
    }

    /// Ephemeral backend; must carry the ephemeral-only flag.
    pub fn set_ephemeral(&self, backend_id: u32) -> Result<()> {
        let backend = self
            .backend(backend_id)
            .ok_or_else(|| MapperError::Unavailable(format!("no backend {backend_id}")))?;
        if !backend.is_ephemeral_only() {
            return Err(MapperError::InvalidRequest(
                "ephemeral backend must be ephemeral-only".into(),
            ));
        }
        self.ephemeral_backend
            .store(i64::from(backend_id), Ordering::Release);
        Ok(())
    }

    /// Cache backend; must be memory-typed.
    pub fn set_cache(&self, backend_id: u32) -> Result<()> {
        let backend = self
            .backend(backend_id)
            .ok_or_else(|| MapperError::Unavailable(format!("no backend {backend_id}")))?;
        if backend.kind() != BackendKind::Memory {
            return Err(MapperError::InvalidRequest(
                "cache backend must be of type memory".into(),
            ));
        }
        self.cache_backend
            .store(i64::from(backend_id), Ordering::Release);
        Ok(())
    }

    pub fn default_backend_id(&self) -> Option<u32> {
        designated(&self.default_backend)
    }

    pub fn ephemeral_backend_id(&self) -> Option<u32> {
        designated(&self.ephemeral_backend)
    }

    pub fn cache_backend_id(&self) -> Option<u32> {
        designated(&self.cache_backend)
    }

    // -- object lifecycle --------------------------------------------------

    /// Create a new object and return a handle holding its writable
    /// descriptor.
    pub fn create_object(&self, request: &CreateRequest<'_>) -> Result<ObjectHandle> {
        if request.uri.is_empty() {
            return Err(MapperError::InvalidRequest("empty URI".into()));
        }
        if request.uri.len() > MAX_URI_LEN {
            return Err(MapperError::UriTooLong(request.uri.len()));
        }

        let backend_id = match request.backend_hint {
            Some(id) => id,
            None => {
                let slot = if request.ephemeral {
                    self.ephemeral_backend_id()
                } else {
                    self.default_backend_id()
                };
                slot.ok_or_else(|| {
                    MapperError::Unavailable(
                        if request.ephemeral {
                            "no ephemeral backend designated"
                        } else {
                            "no default backend designated"
                        }
                        .into(),
                    )
                })?
            }
        };

        let backend = self
            .backend(backend_id)
            .ok_or_else(|| MapperError::Unavailable(format!("no backend {backend_id}")))?;
        if !backend.is_enabled() {
            return Err(MapperError::Unavailable(format!(
                "backend {backend_id} is disabled"
            )));
        }
        if backend.is_readonly() {
            return Err(MapperError::Storage(format!(
                "backend {backend_id} is read-only"
            )));
        }
        // Ephemeral objects live only on ephemeral-only backends, and
        // vice versa.
        if request.ephemeral != backend.is_ephemeral_only() {
            return Err(MapperError::Storage(if request.ephemeral {
                "ephemeral object requires an ephemeral-only backend".into()
            } else {
                "persistent object not allowed on an ephemeral-only backend".into()
            }));
        }

        let _backend_guard = backend.state_lock().read();

        let fs_path = backend.object_path(request.uri);
        if let Some(parent) = fs_path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&fs_path)?;
        let created: OwnedFd = file.into();
        let handle_fd = created.as_fd().try_clone_to_owned()?;

        let entry = IndexEntry::alloc(request.uri, backend_id, fs_path.clone());
        {
            // SAFETY: freshly allocated; we own the initial reference.
            let entry_ref = unsafe { entry.as_ref() };
            let mut flags = request.flags;
            flags |= if request.ephemeral {
                OBJ_EPHEMERAL
            } else {
                OBJ_PERSISTENT
            };
            entry_ref.set_flags(flags);
            entry_ref.set_mtime(clock::wall_secs());
            entry_ref.install_fd(created);
        }

        if let Err(err) = self.global_index.insert(entry) {
            // SAFETY: insert failed, so we still own the initial reference.
            unsafe { IndexEntry::release(entry) };
            let _ = std::fs::remove_file(&fs_path);
            return Err(err);
        }
        if let Err(err) = backend.index.insert(entry) {
            warn!(
                "backend {} index insert failed for {}: {err}",
                backend_id, request.uri
            );
        }

        backend.add_object(0);
        backend.count_write();
        self.total_objects.fetch_add(1, Ordering::AcqRel);

        Ok(ObjectHandle::new_with_fd(entry, handle_fd))
    }

    /// Look up an existing object. Records the access and bumps the
    /// backend's read counter.
    pub fn get_object(&self, uri: &str) -> Result<ObjectHandle> {
        let handle = self.global_index.lookup(uri).ok_or(MapperError::NotFound)?;
        if let Some(backend) = self.backend(handle.backend_id()) {
            backend.count_read();
        }
        Ok(handle)
    }

    /// True if `uri` is currently indexed (no access recorded).
    pub fn object_exists(&self, uri: &str) -> bool {
        self.global_index.contains(uri)
    }

    /// Delete an object: unlink the file, drop both index memberships,
    /// roll back the counters. Outstanding handles keep working until
    /// released.
    pub fn delete_object(&self, uri: &str) -> Result<()> {
        let handle = self.global_index.lookup(uri).ok_or(MapperError::NotFound)?;
        let backend = self
            .backend(handle.backend_id())
            .ok_or_else(|| MapperError::Unavailable("owning backend vanished".into()))?;

        let size = handle.size_bytes();
        {
            let _backend_guard = backend.state_lock().write();
            let _ = std::fs::remove_file(handle.path());
            backend.remove_object(size);
            self.total_objects.fetch_sub(1, Ordering::AcqRel);
            self.total_bytes.fetch_sub(size, Ordering::AcqRel);
            backend.index.remove(uri);
            self.global_index.remove(uri);
        }
        Ok(())
    }

    /// Adjust the recorded size after a write; maintains the advisory
    /// capacity counters and seeds an identity payload descriptor on the
    /// first size-bearing write.
    pub fn update_size(&self, uri: &str, new_size: u64) -> Result<()> {
        let handle = self.global_index.lookup(uri).ok_or(MapperError::NotFound)?;
        let backend = self
            .backend(handle.backend_id())
            .ok_or_else(|| MapperError::Unavailable("owning backend vanished".into()))?;

        let entry = handle.entry();
        let old_size = entry.size_bytes();
        entry.set_size_bytes(new_size);
        entry.set_mtime(clock::wall_secs());

        let delta = new_size as i64 - old_size as i64;
        if delta != 0 {
            backend.adjust_used(delta);
            if delta >= 0 {
                self.total_bytes.fetch_add(delta as u64, Ordering::AcqRel);
            } else {
                self.total_bytes
                    .fetch_sub(delta.unsigned_abs(), Ordering::AcqRel);
            }
        }

        let seeded = entry.seed_identity_payload(new_size);
        if delta != 0 || seeded {
            backend.index.mark_dirty();
        }
        Ok(())
    }

    /// Validate and store a payload descriptor on the object.
    pub fn set_payload(&self, uri: &str, payload: &PayloadDescriptor) -> Result<()> {
        payload
            .validate()
            .map_err(MapperError::InvalidRequest)?;

        let handle = self.global_index.lookup(uri).ok_or(MapperError::NotFound)?;
        handle.entry().set_payload(payload);
        if let Some(backend) = self.backend(handle.backend_id()) {
            backend.index.mark_dirty();
        }
        Ok(())
    }

    pub fn get_payload(&self, uri: &str) -> Result<Option<PayloadDescriptor>> {
        let handle = self.global_index.lookup(uri).ok_or(MapperError::NotFound)?;
        Ok(handle.payload())
    }

    /// Full metadata view of one object.
    pub fn metadata(&self, uri: &str) -> Result<ObjectMetadata> {
        let handle = self.global_index.lookup(uri).ok_or(MapperError::NotFound)?;
        let entry = handle.entry();
        let halflife = self
            .backend(entry.backend_id())
            .map(|backend| backend.hotness_halflife_secs())
            .unwrap_or(crate::index::DEFAULT_HOTNESS_HALFLIFE_SECS);
        Ok(ObjectMetadata {
            uri: entry.uri().to_owned(),
            backend_id: entry.backend_id(),
            fs_path: entry.path(),
            size_bytes: entry.size_bytes(),
            mtime: entry.mtime(),
            flags: entry.flags(),
            hotness: entry.hotness(clock::monotonic_us(), halflife),
            access_count: entry.access_count(),
            payload: entry.payload(),
        })
    }

    // -- scanning and persistence ------------------------------------------

    /// Cold-start population: walk the backend's mount recursively and
    /// index every regular file, deriving each URI from the path relative
    /// to the mount. Returns the number of objects indexed.
    pub fn scan_backend(&self, backend_id: u32) -> Result<usize> {
        let backend = self
            .backend(backend_id)
            .ok_or_else(|| MapperError::Unavailable(format!("no backend {backend_id}")))?;
        if !backend.is_enabled() {
            return Err(MapperError::Unavailable(format!(
                "backend {backend_id} is disabled"
            )));
        }

        let _backend_guard = backend.state_lock().write();
        let mut count = 0usize;
        self.scan_dir(&backend, backend.mount(), &mut count)?;
        info!("scanned backend {backend_id}: {count} objects indexed");
        Ok(count)
    }

    fn scan_dir(&self, backend: &Arc<BackendInfo>, dir: &Path, count: &mut usize) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            let Ok(file_type) = dir_entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                self.scan_dir(backend, &path, count)?;
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            // The index snapshot is bookkeeping, not an object.
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                if name.starts_with(super::SNAPSHOT_FILE_NAME) {
                    continue;
                }
            }

            let Ok(meta) = dir_entry.metadata() else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(backend.mount()) else {
                continue;
            };
            let uri = format!("/{}", relative.display());

            let entry = IndexEntry::alloc(&uri, backend.id(), path.clone());
            {
                // SAFETY: freshly allocated; we own the initial reference.
                let entry_ref = unsafe { entry.as_ref() };
                entry_ref.set_size_bytes(meta.len());
                entry_ref.set_mtime(
                    meta.modified()
                        .ok()
                        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|duration| duration.as_secs())
                        .unwrap_or(0),
                );
                entry_ref.set_flags(if backend.is_ephemeral_only() {
                    OBJ_EPHEMERAL
                } else {
                    OBJ_PERSISTENT
                });
            }

            if self.global_index.insert(entry).is_err() {
                // Already indexed (snapshot load beat the scan).
                // SAFETY: insert failed, so we still own the reference.
                unsafe { IndexEntry::release(entry) };
                continue;
            }
            let _ = backend.index.insert(entry);

            backend.add_object(meta.len());
            self.total_objects.fetch_add(1, Ordering::AcqRel);
            self.total_bytes.fetch_add(meta.len(), Ordering::AcqRel);
            *count += 1;
        }
        Ok(())
    }

    fn materialize_snapshot(
        &self,
        backend: &Arc<BackendInfo>,
        records: Vec<snapshot::SnapshotRecord>,
    ) -> usize {
        let mut count = 0usize;
        for record in records {
            let entry = IndexEntry::alloc(&record.uri, backend.id(), record.path);
            {
                // SAFETY: freshly allocated; we own the initial reference.
                let entry_ref = unsafe { entry.as_ref() };
                entry_ref.set_size_bytes(record.size_bytes);
                entry_ref.set_mtime(record.mtime);
                entry_ref.set_flags(record.flags);
            }

            if self.global_index.insert(entry).is_err() {
                // SAFETY: insert failed, so we still own the reference.
                unsafe { IndexEntry::release(entry) };
                continue;
            }
            let _ = backend.index.insert(entry);

            backend.add_object(record.size_bytes);
            self.total_objects.fetch_add(1, Ordering::AcqRel);
            self.total_bytes.fetch_add(record.size_bytes, Ordering::AcqRel);
            count += 1;
        }
        count
    }

    /// Persist every dirty per-backend index (graceful shutdown path).
    pub fn save_indexes(&self) {
        for backend in self.backends() {
            if backend.index.is_dirty() && backend.index.snapshot_path().is_some() {
                match snapshot::save(&backend.index) {
                    Ok(count) => info!(
                        "backend {}: saved {count} entries to index snapshot",
                        backend.id()
                    ),
                    Err(err) => warn!("backend {}: snapshot save failed: {err}", backend.id()),
                }
            }
        }
    }

    // -- management queries ------------------------------------------------

    /// URIs currently resident on one backend.
    pub fn list_objects(&self, backend_id: u32) -> Result<Vec<String>> {
        let backend = self
            .backend(backend_id)
            .ok_or_else(|| MapperError::Unavailable(format!("no backend {backend_id}")))?;
        let mut uris = Vec::with_capacity(backend.index.len());
        backend.index.for_each(|entry| uris.push(entry.uri().to_owned()));
        Ok(uris)
    }

    /// `(uri, hotness)` for every object on one backend, evaluated fresh
    /// against the current clock.
    pub fn hotness_map(&self, backend_id: u32) -> Result<Vec<(String, f64)>> {
        let backend = self
            .backend(backend_id)
            .ok_or_else(|| MapperError::Unavailable(format!("no backend {backend_id}")))?;
        let now = clock::monotonic_us();
        let halflife = backend.hotness_halflife_secs();
        let mut map = Vec::with_capacity(backend.index.len());
        backend.index.for_each(|entry| {
            map.push((entry.uri().to_owned(), entry.hotness(now, halflife)));
        });
        Ok(map)
    }

    pub fn total_objects(&self) -> usize {
        self.total_objects.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn index_stats(&self) -> IndexStats {
        self.global_index.stats()
    }

    /// Stop background work and persist state.
    pub fn shutdown(&self) {
        self.stop_caching();
        self.save_indexes();
    }
}

fn designated(slot: &AtomicI64) -> Option<u32> {
    let value = slot.load(Ordering::Acquire);
    (value >= 0).then_some(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        FLAG_EPHEMERAL_ONLY, FLAG_MIGRATION_DST, FLAG_MIGRATION_SRC,
        FLAG_PERSISTENT as B_PERSISTENT,
    };
    use std::io::{Read, Seek, SeekFrom, Write};

    fn two_tier_manager(root: &Path) -> BackendManager {
        let manager = BackendManager::new(1024);
        let memory = manager
            .register(
                BackendKind::Memory,
                root.join("mem"),
                "mem0",
                1 << 20,
                FLAG_EPHEMERAL_ONLY | FLAG_MIGRATION_SRC | FLAG_MIGRATION_DST,
            )
            .unwrap();
        let ssd = manager
            .register(
                BackendKind::Ssd,
                root.join("ssd"),
                "ssd0",
                1 << 30,
                B_PERSISTENT | FLAG_MIGRATION_SRC | FLAG_MIGRATION_DST,
            )
            .unwrap();
        manager.set_ephemeral(memory).unwrap();
        manager.set_cache(memory).unwrap();
        manager.set_default(ssd).unwrap();
        manager
    }

    #[test]
    fn test_designation_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackendManager::new(64);
        let memory = manager
            .register(
                BackendKind::Memory,
                dir.path().join("mem"),
                "mem0",
                1 << 20,
                FLAG_EPHEMERAL_ONLY,
            )
            .unwrap();
        let ssd = manager
            .register(
                BackendKind::Ssd,
                dir.path().join("ssd"),
                "ssd0",
                1 << 30,
                B_PERSISTENT,
            )
            .unwrap();

        // Default must not be ephemeral-only.
        assert!(manager.set_default(memory).is_err());
        assert!(manager.set_default(ssd).is_ok());
        // Ephemeral must be ephemeral-only.
        assert!(manager.set_ephemeral(ssd).is_err());
        assert!(manager.set_ephemeral(memory).is_ok());
        // Cache must be memory-typed.
        assert!(manager.set_cache(ssd).is_err());
        assert!(manager.set_cache(memory).is_ok());
    }

    #[test]
    fn test_create_write_get_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_tier_manager(dir.path());

        let handle = manager
            .create_object(&CreateRequest::new("/test/object1.txt"))
            .unwrap();
        // Persistent objects land on the default (SSD) backend.
        assert_eq!(handle.backend_id(), 1);

        let mut file = std::fs::File::from(handle.dup_fd().unwrap());
        file.write_all(b"Hello, objmapper!").unwrap();
        drop(file);
        drop(handle);
        manager.update_size("/test/object1.txt", 17).unwrap();

        let handle = manager.get_object("/test/object1.txt").unwrap();
        assert_eq!(handle.size_bytes(), 17);
        let mut file = std::fs::File::from(handle.dup_fd().unwrap());
        let mut body = String::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut body).unwrap();
        assert_eq!(body, "Hello, objmapper!");

        let ssd = manager.backend(1).unwrap();
        assert_eq!(ssd.object_count(), 1);
        assert_eq!(ssd.used_bytes(), 17);
        assert_eq!(ssd.stats().writes, 1);
        assert_eq!(ssd.stats().reads, 1);
    }

    #[test]
    fn test_ephemeral_placement_rules() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_tier_manager(dir.path());

        // Ephemeral object lands on the memory backend.
        let mut request = CreateRequest::new("/tmp/eph.dat");
        request.ephemeral = true;
        let handle = manager.create_object(&request).unwrap();
        assert_eq!(handle.backend_id(), 0);
        assert!(handle.flags() & OBJ_EPHEMERAL != 0);
        drop(handle);

        // Ephemeral object on a persistent backend is rejected.
        let mut request = CreateRequest::new("/tmp/eph2.dat");
        request.ephemeral = true;
        request.backend_hint = Some(1);
        assert!(matches!(
            manager.create_object(&request),
            Err(MapperError::Storage(_))
        ));

        // Persistent object on the ephemeral backend is rejected too.
        let mut request = CreateRequest::new("/tmp/not-eph.dat");
        request.backend_hint = Some(0);
        assert!(matches!(
            manager.create_object(&request),
            Err(MapperError::Storage(_))
        ));
    }

    #[test]
    fn test_delete_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_tier_manager(dir.path());

        let handle = manager
            .create_object(&CreateRequest::new("/test/object1.txt"))
            .unwrap();
        let path = handle.path();
        drop(handle);

        manager.delete_object("/test/object1.txt").unwrap();
        assert!(!path.exists());
        assert!(matches!(
            manager.get_object("/test/object1.txt"),
            Err(MapperError::NotFound)
        ));
        assert!(matches!(
            manager.delete_object("/test/object1.txt"),
            Err(MapperError::NotFound)
        ));
        assert_eq!(manager.total_objects(), 0);
    }

    #[test]
    fn test_duplicate_create_is_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_tier_manager(dir.path());

        let first = manager.create_object(&CreateRequest::new("/dup")).unwrap();
        drop(first);
        assert!(matches!(
            manager.create_object(&CreateRequest::new("/dup")),
            Err(MapperError::Duplicate)
        ));
    }

    #[test]
    fn test_update_size_accounting_and_payload_seed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_tier_manager(dir.path());

        drop(manager.create_object(&CreateRequest::new("/sized")).unwrap());
        manager.update_size("/sized", 1000).unwrap();
        assert_eq!(manager.total_bytes(), 1000);
        assert_eq!(manager.backend(1).unwrap().used_bytes(), 1000);

        manager.update_size("/sized", 400).unwrap();
        assert_eq!(manager.total_bytes(), 400);
        assert_eq!(manager.backend(1).unwrap().used_bytes(), 400);

        // First size-bearing write seeded an identity descriptor.
        let payload = manager.get_payload("/sized").unwrap().unwrap();
        assert_eq!(payload.variant_count, 1);
        assert_eq!(payload.variants[0].logical_length, 1000);
    }

    #[test]
    fn test_set_payload_validates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_tier_manager(dir.path());
        drop(manager.create_object(&CreateRequest::new("/p")).unwrap());

        let bogus = PayloadDescriptor::default(); // zero variants
        assert!(matches!(
            manager.set_payload("/p", &bogus),
            Err(MapperError::InvalidRequest(_))
        ));

        let good = PayloadDescriptor::identity(64);
        manager.set_payload("/p", &good).unwrap();
        assert_eq!(manager.get_payload("/p").unwrap(), Some(good));
    }

    #[test]
    fn test_metadata_view() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_tier_manager(dir.path());
        drop(manager.create_object(&CreateRequest::new("/meta")).unwrap());
        manager.update_size("/meta", 5).unwrap();

        let metadata = manager.metadata("/meta").unwrap();
        assert_eq!(metadata.uri, "/meta");
        assert_eq!(metadata.backend_id, 1);
        assert_eq!(metadata.size_bytes, 5);
        assert!(metadata.flags & OBJ_PERSISTENT != 0);
        assert!(metadata.access_count >= 1);
    }

    #[test]
    fn test_scan_indexes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_tier_manager(dir.path());

        // Drop files behind the manager's back.
        let mount = dir.path().join("ssd");
        std::fs::create_dir_all(mount.join("pre")).unwrap();
        std::fs::write(mount.join("pre/a.bin"), b"aaaa").unwrap();
        std::fs::write(mount.join("top.bin"), b"bb").unwrap();

        let count = manager.scan_backend(1).unwrap();
        assert_eq!(count, 2);

        let handle = manager.get_object("/pre/a.bin").unwrap();
        assert_eq!(handle.size_bytes(), 4);
        assert!(handle.flags() & OBJ_PERSISTENT != 0);
        assert_eq!(manager.backend(1).unwrap().used_bytes(), 6);
    }

    #[test]
    fn test_index_membership_matches_counters() {
        let dir = tempfile::tempdir().unwrap();
        let manager = two_tier_manager(dir.path());

        for i in 0..6 {
            drop(
                manager
                    .create_object(&CreateRequest::new(&format!("/bulk/{i}")))
                    .unwrap(),
            );
        }
        let mut request = CreateRequest::new("/bulk/eph");
        request.ephemeral = true;
        drop(manager.create_object(&request).unwrap());

        manager.delete_object("/bulk/0").unwrap();
        manager.delete_object("/bulk/3").unwrap();

        // Every object in the global index sits in exactly one backend
        // index, and the counters agree with the memberships.
        let global = manager.global_index().len();
        let per_backend: usize = manager
            .backends()
            .iter()
            .map(|backend| backend.index.len())
            .sum();
        assert_eq!(global, 5);
        assert_eq!(per_backend, 5);
        assert_eq!(manager.total_objects(), 5);
        for backend in manager.backends() {
            assert_eq!(backend.object_count(), backend.index.len());
        }
    }

    #[test]
    fn test_concurrent_create_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = std::sync::Arc::new(two_tier_manager(dir.path()));

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let manager = std::sync::Arc::clone(&manager);
                scope.spawn(move || {
                    for i in 0..50 {
                        let uri = format!("/w{worker}/obj{i}");
                        drop(manager.create_object(&CreateRequest::new(&uri)).unwrap());
                        manager.update_size(&uri, 10).unwrap();
                        drop(manager.get_object(&uri).unwrap());
                        manager.delete_object(&uri).unwrap();
                    }
                });
            }
        });

        assert_eq!(manager.total_objects(), 0);
        assert_eq!(manager.total_bytes(), 0);
        assert_eq!(manager.global_index().len(), 0);
        assert_eq!(manager.backend(1).unwrap().object_count(), 0);
        assert_eq!(manager.backend(1).unwrap().used_bytes(), 0);
    }

    #[test]
    fn test_snapshot_round_trips_through_registration() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = two_tier_manager(dir.path());
            drop(
                manager
                    .create_object(&CreateRequest::new("/persisted/one"))
                    .unwrap(),
            );
            manager.update_size("/persisted/one", 11).unwrap();
            manager.save_indexes();
        }

        // A fresh manager over the same mounts finds the object again.
        let manager = two_tier_manager(dir.path());
        let handle = manager.get_object("/persisted/one").unwrap();
        assert_eq!(handle.size_bytes(), 11);
        assert_eq!(handle.backend_id(), 1);
        assert_eq!(manager.total_objects(), 1);
    }
}
