//! Lock-free URI indexes.
//!
//! Both the global index and the per-backend indexes are chained hash
//! tables with power-of-two bucket counts. Readers traverse bucket heads
//! and `next` links with atomic loads and never block; all structural
//! mutation is serialized on one write mutex per table. Entries are freed
//! only after their reference count reaches zero, which can only happen
//! after they have been unlinked from every chain and all outstanding
//! lookup handles have been released; no hazard pointers or epochs are
//! needed because handles hold strong references.
//!
//! # Safety
//!
//! Chain pointers are raw. The rules from [`entry`]'s module docs apply:
//! a pointer loaded from a live chain is dereferenceable, unlink happens
//! under the write mutex before the owning reference is dropped, and each
//! acquired reference is released exactly once.

pub mod entry;
pub mod snapshot;

pub use entry::{
    hash_uri, IndexEntry, Location, ObjectHandle, ACCESS_NORMALIZATION,
    DEFAULT_HOTNESS_HALFLIFE_SECS, FLAG_COMPRESSED, FLAG_ENCRYPTED, FLAG_EPHEMERAL, FLAG_PINNED,
    FLAG_PERSISTENT,
};

use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{MapperError, Result};

/// Default bucket count for the global index.
pub const GLOBAL_DEFAULT_BUCKETS: usize = 1 << 20;

/// Default bucket count for a per-backend index.
pub const BACKEND_DEFAULT_BUCKETS: usize = 1 << 18;

// ---------------------------------------------------------------------------
// Chain table
// ---------------------------------------------------------------------------

/// The shared hash-table shape: atomic chain heads, one write mutex.
struct ChainTable {
    buckets: Box<[AtomicPtr<IndexEntry>]>,
    mask: u64,
    num_entries: AtomicUsize,
    write_lock: Mutex<()>,
}

impl ChainTable {
    fn new(num_buckets: usize) -> ChainTable {
        let count = num_buckets.max(2).next_power_of_two();
        let buckets = (0..count)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ChainTable {
            buckets,
            mask: (count - 1) as u64,
            num_entries: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        }
    }

    fn bucket(&self, hash: u64) -> &AtomicPtr<IndexEntry> {
        &self.buckets[(hash & self.mask) as usize]
    }

    fn len(&self) -> usize {
        self.num_entries.load(Ordering::Acquire)
    }

    /// Lock-free chain walk. The returned pointer is only guaranteed alive
    /// while the caller can rule out a concurrent remove-and-release; take
    /// a reference before letting it escape.
    fn find(&self, uri: &str) -> Option<NonNull<IndexEntry>> {
        let hash = hash_uri(uri);
        let mut cursor = self.bucket(hash).load(Ordering::Acquire);
        while let Some(ptr) = NonNull::new(cursor) {
            // SAFETY: see module docs; chain members are kept alive by
            // their index reference until unlinked.
            let entry = unsafe { ptr.as_ref() };
            if entry.uri_hash() == hash && entry.uri() == uri {
                return Some(ptr);
            }
            cursor = entry.next.load(Ordering::Acquire);
        }
        None
    }

    /// Splice `entry` at its bucket head. Fails (false) on duplicate URI.
    fn insert(&self, ptr: NonNull<IndexEntry>) -> bool {
        let _guard = self.write_lock.lock();
        // SAFETY: caller owns a reference to `ptr`.
        let entry = unsafe { ptr.as_ref() };
        let head = self.bucket(entry.uri_hash());

        let mut cursor = head.load(Ordering::Relaxed);
        while let Some(existing) = NonNull::new(cursor) {
            // SAFETY: chain members are alive under the write mutex.
            let other = unsafe { existing.as_ref() };
            if other.uri_hash() == entry.uri_hash() && other.uri() == entry.uri() {
                return false;
            }
            cursor = other.next.load(Ordering::Relaxed);
        }

        // Relaxed store of `next` then release store of the head makes the
        // fully-linked entry visible to lock-free readers.
        entry.next.store(head.load(Ordering::Relaxed), Ordering::Relaxed);
        head.store(ptr.as_ptr(), Ordering::Release);
        self.num_entries.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Unlink the entry for `uri` and hand it back; the caller releases
    /// the table's reference.
    fn remove(&self, uri: &str) -> Option<NonNull<IndexEntry>> {
        let _guard = self.write_lock.lock();
        let hash = hash_uri(uri);
        let head = self.bucket(hash);

        let mut prev: Option<NonNull<IndexEntry>> = None;
        let mut cursor = head.load(Ordering::Acquire);
        while let Some(ptr) = NonNull::new(cursor) {
            // SAFETY: chain members are alive under the write mutex.
            let entry = unsafe { ptr.as_ref() };
            if entry.uri_hash() == hash && entry.uri() == uri {
                let next = entry.next.load(Ordering::Acquire);
                match prev {
                    // SAFETY: predecessor is a live chain member.
                    Some(p) => unsafe { p.as_ref() }.next.store(next, Ordering::Release),
                    None => head.store(next, Ordering::Release),
                }
                self.num_entries.fetch_sub(1, Ordering::AcqRel);
                return Some(ptr);
            }
            prev = Some(ptr);
            cursor = entry.next.load(Ordering::Acquire);
        }
        None
    }

    /// Lock-free visit of every entry.
    fn for_each(&self, mut visit: impl FnMut(&IndexEntry)) {
        for bucket in self.buckets.iter() {
            let mut cursor = bucket.load(Ordering::Acquire);
            while let Some(ptr) = NonNull::new(cursor) {
                // SAFETY: chain members are alive while linked.
                let entry = unsafe { ptr.as_ref() };
                visit(entry);
                cursor = entry.next.load(Ordering::Acquire);
            }
        }
    }

    /// Unlink everything and release the table's references (teardown).
    fn drain(&self) {
        let _guard = self.write_lock.lock();
        for bucket in self.buckets.iter() {
            let mut cursor = bucket.swap(std::ptr::null_mut(), Ordering::AcqRel);
            while let Some(ptr) = NonNull::new(cursor) {
                // Read the link before dropping our reference; the entry
                // may be freed by the release.
                // SAFETY: we still own the table's reference here.
                cursor = unsafe { ptr.as_ref() }.next.load(Ordering::Acquire);
                // SAFETY: exactly the table's reference is released.
                unsafe { IndexEntry::release(ptr) };
            }
        }
        self.num_entries.store(0, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Global index
// ---------------------------------------------------------------------------

/// Point-in-time view of index counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStats {
    pub num_entries: u64,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub fd_opens: u64,
    pub hit_rate: f64,
}

/// The daemon-wide URI-to-entry table.
pub struct GlobalIndex {
    table: ChainTable,
    stat_lookups: AtomicU64,
    stat_hits: AtomicU64,
    stat_misses: AtomicU64,
    stat_fd_opens: AtomicU64,
}

impl GlobalIndex {
    pub fn new(num_buckets: usize) -> GlobalIndex {
        GlobalIndex {
            table: ChainTable::new(num_buckets),
            stat_lookups: AtomicU64::new(0),
            stat_hits: AtomicU64::new(0),
            stat_misses: AtomicU64::new(0),
            stat_fd_opens: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Lock-free lookup. On a hit the returned handle holds one entry
    /// reference and, when the backing file could be opened, a private
    /// duplicate of the entry's cached descriptor, counted in the
    /// entry's `fd_refcount`. Access is recorded on every hit.
    pub fn lookup(&self, uri: &str) -> Option<ObjectHandle> {
        self.stat_lookups.fetch_add(1, Ordering::Relaxed);

        let Some(ptr) = self.table.find(uri) else {
            self.stat_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        // SAFETY: found under the liveness rules in the module docs; the
        // reference below pins the entry for the handle's lifetime.
        let entry = unsafe { ptr.as_ref() };
        entry.get_ref();

        let (fd, generation) = match entry.acquire_handle_fd() {
            Ok((fd, generation)) => {
                self.stat_fd_opens.fetch_add(1, Ordering::Relaxed);
                (Some(fd), generation)
            }
            // The body may be momentarily unopenable (e.g. mid-migration
            // unlink); the handle still pins the entry.
            Err(_) => (None, entry.fd_generation()),
        };

        entry.record_access();
        self.stat_hits.fetch_add(1, Ordering::Relaxed);
        Some(ObjectHandle::from_parts(ptr, fd, generation))
    }

    /// True if `uri` is currently indexed. Takes no references.
    pub fn contains(&self, uri: &str) -> bool {
        self.table.find(uri).is_some()
    }

    /// Insert a freshly allocated entry, transferring the caller's
    /// reference to the index. Duplicate URIs are a hard error; on error
    /// the caller still owns its reference.
    pub fn insert(&self, ptr: NonNull<IndexEntry>) -> Result<()> {
        if self.table.insert(ptr) {
            Ok(())
        } else {
            Err(MapperError::Duplicate)
        }
    }

    /// Unlink `uri`, discard the entry's cached descriptor, and release
    /// the index's reference. Outstanding handles keep working until they
    /// drop.
    pub fn remove(&self, uri: &str) -> bool {
        match self.table.remove(uri) {
            Some(ptr) => {
                // SAFETY: we own the reference being released.
                unsafe { ptr.as_ref() }.invalidate_fd();
                unsafe { IndexEntry::release(ptr) };
                true
            }
            None => false,
        }
    }

    /// Rewrite the location of `uri`'s entry (migration). The entry itself
    /// is shared with the per-backend indexes, so no re-insert happens.
    pub fn update_backend(&self, uri: &str, backend_id: u32, path: PathBuf) -> bool {
        match self.table.find(uri) {
            Some(ptr) => {
                // SAFETY: entry alive while linked; set_location takes the
                // entry's own publication lock.
                unsafe { ptr.as_ref() }.set_location(backend_id, path);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> IndexStats {
        let lookups = self.stat_lookups.load(Ordering::Relaxed);
        let hits = self.stat_hits.load(Ordering::Relaxed);
        IndexStats {
            num_entries: self.table.len() as u64,
            lookups,
            hits,
            misses: self.stat_misses.load(Ordering::Relaxed),
            fd_opens: self.stat_fd_opens.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

impl Drop for GlobalIndex {
    fn drop(&mut self) {
        self.table.drain();
    }
}

// ---------------------------------------------------------------------------
// Per-backend index
// ---------------------------------------------------------------------------

/// URI-to-entry table scoped to one backend; the source of truth for what
/// lives on that tier, and the unit of snapshot persistence.
pub struct BackendIndex {
    backend_id: u32,
    table: ChainTable,
    snapshot_path: Option<PathBuf>,
    dirty: AtomicBool,
    stat_lookups: AtomicU64,
    stat_hits: AtomicU64,
}

impl BackendIndex {
    pub fn new(backend_id: u32, snapshot_path: Option<PathBuf>, num_buckets: usize) -> BackendIndex {
        BackendIndex {
            backend_id,
            table: ChainTable::new(num_buckets),
            snapshot_path,
            dirty: AtomicBool::new(false),
            stat_lookups: AtomicU64::new(0),
            stat_hits: AtomicU64::new(0),
        }
    }

    pub fn backend_id(&self) -> u32 {
        self.backend_id
    }

    pub fn snapshot_path(&self) -> Option<&PathBuf> {
        self.snapshot_path.as_ref()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Add the entry to this backend's membership, taking one additional
    /// entry reference. Fails on duplicate (reference not taken).
    pub fn insert(&self, ptr: NonNull<IndexEntry>) -> Result<()> {
        // SAFETY: caller owns a reference to `ptr`.
        unsafe { ptr.as_ref() }.get_ref();
        if self.table.insert(ptr) {
            self.mark_dirty();
            Ok(())
        } else {
            // SAFETY: undo the membership reference taken above.
            unsafe { IndexEntry::release(ptr) };
            Err(MapperError::Duplicate)
        }
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.stat_lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.table.find(uri).is_some();
        if found {
            self.stat_hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Drop `uri` from this backend's membership, releasing the index's
    /// reference.
    pub fn remove(&self, uri: &str) -> bool {
        match self.table.remove(uri) {
            Some(ptr) => {
                // SAFETY: releasing exactly the membership reference.
                unsafe { IndexEntry::release(ptr) };
                self.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Lock-free visit of every member entry.
    pub fn for_each(&self, visit: impl FnMut(&IndexEntry)) {
        self.table.for_each(visit);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

impl Drop for BackendIndex {
    fn drop(&mut self) {
        self.table.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    fn make_object(dir: &tempfile::TempDir, uri: &str, body: &[u8]) -> NonNull<IndexEntry> {
        let rel = uri.trim_start_matches('/');
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body).unwrap();
        IndexEntry::alloc(uri, 0, path)
    }

    #[test]
    fn test_insert_lookup_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = GlobalIndex::new(16);

        let entry = make_object(&dir, "/a/b.dat", b"hello");
        index.insert(entry).unwrap();
        assert_eq!(index.len(), 1);

        let handle = index.lookup("/a/b.dat").unwrap();
        assert_eq!(handle.uri(), "/a/b.dat");
        assert!(handle.fd().is_some());
        drop(handle);

        assert!(index.lookup("/missing").is_none());
        assert!(index.remove("/a/b.dat"));
        assert!(!index.remove("/a/b.dat"));
        assert!(index.lookup("/a/b.dat").is_none());
        assert_eq!(index.len(), 0);

        let stats = index.stats();
        assert_eq!(stats.lookups, 4);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = GlobalIndex::new(16);

        let first = make_object(&dir, "/dup", b"1");
        index.insert(first).unwrap();

        let second = make_object(&dir, "/dup", b"2");
        assert!(matches!(index.insert(second), Err(MapperError::Duplicate)));
        // We still own the rejected entry's reference.
        unsafe { IndexEntry::release(second) };
    }

    #[test]
    fn test_colliding_bucket_chains() {
        let dir = tempfile::tempdir().unwrap();
        // Two buckets force collisions.
        let index = GlobalIndex::new(2);

        for i in 0..16 {
            let entry = make_object(&dir, &format!("/chain/{i}"), b"x");
            index.insert(entry).unwrap();
        }
        assert_eq!(index.len(), 16);

        for i in 0..16 {
            assert!(index.lookup(&format!("/chain/{i}")).is_some());
        }

        // Remove from the middle of chains.
        for i in (0..16).step_by(2) {
            assert!(index.remove(&format!("/chain/{i}")));
        }
        for i in 0..16 {
            assert_eq!(index.contains(&format!("/chain/{i}")), i % 2 == 1);
        }
    }

    #[test]
    fn test_removed_entry_survives_outstanding_handle() {
        let dir = tempfile::tempdir().unwrap();
        let index = GlobalIndex::new(16);

        let entry = make_object(&dir, "/held", b"still here");
        index.insert(entry).unwrap();

        let handle = index.lookup("/held").unwrap();
        assert!(index.remove("/held"));
        assert!(index.lookup("/held").is_none());

        // The handle still reads the (now unlinked) entry.
        assert_eq!(handle.uri(), "/held");
        assert_eq!(handle.backend_id(), 0);
        drop(handle);
    }

    #[test]
    fn test_update_backend_rewrites_location() {
        let dir = tempfile::tempdir().unwrap();
        let index = GlobalIndex::new(16);

        let entry = make_object(&dir, "/move-me", b"body");
        index.insert(entry).unwrap();

        let new_path = dir.path().join("tier1/move-me");
        assert!(index.update_backend("/move-me", 3, new_path.clone()));

        let handle = index.lookup("/move-me").unwrap();
        assert_eq!(handle.backend_id(), 3);
        assert_eq!(handle.path(), new_path);
    }

    #[test]
    fn test_backend_index_membership_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        let global = GlobalIndex::new(16);
        let backend = BackendIndex::new(0, None, 16);

        let entry = make_object(&dir, "/obj", b"z");
        global.insert(entry).unwrap();
        backend.insert(entry).unwrap();
        assert!(backend.is_dirty());

        // One ref for each index membership.
        assert_eq!(unsafe { entry.as_ref() }.refcount(), 2);

        assert!(backend.remove("/obj"));
        assert_eq!(unsafe { entry.as_ref() }.refcount(), 1);
        assert!(global.remove("/obj"));
    }

    #[test]
    fn test_concurrent_lookups_restore_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(GlobalIndex::new(64));

        let entry = make_object(&dir, "/contended", b"data");
        index.insert(entry).unwrap();
        let baseline = unsafe { entry.as_ref() }.refcount();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let index = Arc::clone(&index);
                scope.spawn(move || {
                    for _ in 0..200 {
                        let handle = index.lookup("/contended").unwrap();
                        assert_eq!(handle.uri(), "/contended");
                        drop(handle);
                    }
                });
            }
        });

        assert_eq!(unsafe { entry.as_ref() }.refcount(), baseline);
        assert_eq!(unsafe { entry.as_ref() }.fd_refcount(), 0);
    }
}
