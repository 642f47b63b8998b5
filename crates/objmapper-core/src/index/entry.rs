//! The index entry: one refcounted record per object, shared between the
//! global index and the owning per-backend index.
//!
//! Two independent lifetimes are tracked per entry:
//!
//! - `entry_refcount`: the record itself. One reference per index
//!   membership plus one per outstanding [`ObjectHandle`]. The entry is
//!   freed on the 1-to-0 transition, which can only happen after it has
//!   been unlinked from every chain.
//! - `fd_refcount`: holders of the cached descriptor slot. Acquisition
//!   duplicates the slot's descriptor into private handle ownership, so
//!   a handle's I/O never depends on the slot staying open; the refcount
//!   exists to keep the slot descriptor valid across the duplication
//!   itself. While it is non-zero, invalidation retires the old slot
//!   descriptor instead of closing it; the last holder to release closes
//!   anything retired.
//!
//! # Safety
//!
//! Entries are heap records managed through raw pointers so the collision
//! chains can be traversed lock-free. The invariants are:
//!
//! - an entry pointer read from a chain is dereferenceable because entries
//!   are unlinked (under the table's write mutex) before their last
//!   reference can be released, and freeing waits for `entry_refcount` to
//!   reach zero;
//! - `release` is called exactly once per acquired reference;
//! - `uri` and `uri_hash` are immutable after construction, so lock-free
//!   key comparisons never race with writers.

use std::fs::OpenOptions;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::clock;
use crate::error::Result;
use crate::payload::PayloadDescriptor;

/// Object flag bits (persisted in snapshots; do not renumber).
pub const FLAG_EPHEMERAL: u32 = 0x01;
pub const FLAG_PERSISTENT: u32 = 0x02;
pub const FLAG_PINNED: u32 = 0x04;
pub const FLAG_ENCRYPTED: u32 = 0x08;
pub const FLAG_COMPRESSED: u32 = 0x10;

/// Default hotness decay half-life in seconds.
pub const DEFAULT_HOTNESS_HALFLIFE_SECS: u64 = 3600;

/// Access count at which the frequency component of the hotness score
/// saturates to 1.0.
pub const ACCESS_NORMALIZATION: f64 = 1000.0;

/// 64-bit FNV-1a over the URI bytes.
pub fn hash_uri(uri: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in uri.as_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

/// Where an object's body currently lives.
#[derive(Debug, Clone)]
pub struct Location {
    pub backend_id: u32,
    pub path: PathBuf,
}

/// One object record. See the module docs for the lifetime rules.
pub struct IndexEntry {
    uri: Box<str>,
    uri_hash: u64,

    location: RwLock<Location>,

    /// Cached descriptor slot, -1 when closed. Handle acquisition
    /// duplicates from here; a populated slot saves the open on every
    /// subsequent lookup.
    fd: AtomicI32,
    fd_refcount: AtomicU32,
    fd_generation: AtomicU64,
    /// Slot descriptors displaced while holders were active; closed by
    /// the last release (or entry teardown).
    retired_fds: Mutex<Vec<RawFd>>,

    size_bytes: AtomicU64,
    mtime: AtomicU64,
    flags: AtomicU32,

    access_count: AtomicU64,
    /// Monotonic microseconds; zero means never accessed.
    last_access: AtomicU64,
    /// Last computed hotness, stored as f32 bits.
    hotness_score: AtomicU32,

    entry_refcount: AtomicU32,

    /// Collision chain link; owned by the chain table's write path.
    pub(super) next: AtomicPtr<IndexEntry>,

    /// `variant_count == 0` means no descriptor has been set.
    payload: Mutex<PayloadDescriptor>,
}

impl IndexEntry {
    /// Allocate a new entry with `entry_refcount == 1`. The initial
    /// reference belongs to whichever index the entry is first inserted
    /// into; until then the caller is responsible for releasing it.
    pub fn alloc(uri: &str, backend_id: u32, path: PathBuf) -> NonNull<IndexEntry> {
        let entry = Box::new(IndexEntry {
            uri_hash: hash_uri(uri),
            uri: uri.into(),
            location: RwLock::new(Location { backend_id, path }),
            fd: AtomicI32::new(-1),
            fd_refcount: AtomicU32::new(0),
            fd_generation: AtomicU64::new(0),
            retired_fds: Mutex::new(Vec::new()),
            size_bytes: AtomicU64::new(0),
            mtime: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            access_count: AtomicU64::new(0),
            last_access: AtomicU64::new(0),
            hotness_score: AtomicU32::new(0),
            entry_refcount: AtomicU32::new(1),
            next: AtomicPtr::new(std::ptr::null_mut()),
            payload: Mutex::new(PayloadDescriptor {
                variant_count: 0,
                ..PayloadDescriptor::default()
            }),
        });
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(entry)) }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn uri_hash(&self) -> u64 {
        self.uri_hash
    }

    pub fn location(&self) -> Location {
        self.location.read().clone()
    }

    pub fn backend_id(&self) -> u32 {
        self.location.read().backend_id
    }

    pub fn path(&self) -> PathBuf {
        self.location.read().path.clone()
    }

    /// Swap backend id and path under the entry's publication lock and
    /// discard the cached descriptor so the next open targets the new
    /// path. Callers hold the owning backends' write locks.
    pub fn set_location(&self, backend_id: u32, path: PathBuf) {
        {
            let mut location = self.location.write();
            location.backend_id = backend_id;
            location.path = path;
        }
        self.invalidate_fd();
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }

    pub fn set_size_bytes(&self, size: u64) {
        self.size_bytes.store(size, Ordering::Release);
    }

    pub fn mtime(&self) -> u64 {
        self.mtime.load(Ordering::Acquire)
    }

    pub fn set_mtime(&self, mtime: u64) {
        self.mtime.store(mtime, Ordering::Release);
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Release);
    }

    pub fn is_ephemeral(&self) -> bool {
        self.flags() & FLAG_EPHEMERAL != 0
    }

    pub fn is_pinned(&self) -> bool {
        self.flags() & FLAG_PINNED != 0
    }

    // -- entry lifetime ----------------------------------------------------

    /// Take one strong reference.
    pub fn get_ref(&self) {
        self.entry_refcount.fetch_add(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> u32 {
        self.entry_refcount.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn retired_count(&self) -> usize {
        self.retired_fds.lock().len()
    }

    /// Drop one strong reference, freeing the entry on the last release.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`IndexEntry::alloc`], the caller must own one
    /// reference, and must not touch the entry afterwards.
    pub(crate) unsafe fn release(ptr: NonNull<IndexEntry>) {
        let prev = unsafe { ptr.as_ref() }
            .entry_refcount
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1);
        if prev == 1 {
            let entry = unsafe { Box::from_raw(ptr.as_ptr()) };
            // No holders can remain on the last reference, so the polite
            // close always succeeds.
            let closed = entry.close_fd();
            debug_assert!(closed);
            entry.drain_retired_fds();
            drop(entry);
        }
    }

    // -- cached descriptor slot --------------------------------------------

    /// Open the backend file into the cached slot if it is empty. Races
    /// between concurrent openers are resolved by CAS; the loser closes
    /// its descriptor.
    pub fn open_fd(&self) -> Result<()> {
        if self.fd.load(Ordering::Acquire) >= 0 {
            return Ok(());
        }
        let fd = open_rw_fallback(&self.path())?;
        let raw = std::os::fd::AsRawFd::as_raw_fd(&fd);
        match self
            .fd
            .compare_exchange(-1, raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // Slot owns the descriptor now.
                std::mem::forget(fd);
                Ok(())
            }
            Err(_) => {
                // Someone else opened first; ours closes on drop.
                Ok(())
            }
        }
    }

    /// Install a freshly created descriptor into the slot (creation path;
    /// the entry is not yet published).
    pub fn install_fd(&self, fd: OwnedFd) {
        let raw = std::os::fd::AsRawFd::as_raw_fd(&fd);
        let old = self.fd.swap(raw, Ordering::AcqRel);
        debug_assert_eq!(old, -1);
        std::mem::forget(fd);
    }

    /// Close the cached descriptor if no handle currently holds one.
    /// Returns false (and leaves the slot alone) while `fd_refcount > 0`.
    pub fn close_fd(&self) -> bool {
        if self.fd_refcount.load(Ordering::Acquire) > 0 {
            return false;
        }
        self.invalidate_fd();
        true
    }

    /// Unconditionally discard the cached descriptor and bump the
    /// generation so stale handles can detect the change. Handles keep
    /// working: each owns a private descriptor. While an acquisition is
    /// in flight (`fd_refcount > 0`) the displaced descriptor is retired
    /// rather than closed, so a concurrent duplication never touches a
    /// dead descriptor number.
    pub fn invalidate_fd(&self) {
        let old = self.fd.swap(-1, Ordering::SeqCst);
        if old < 0 {
            return;
        }
        self.fd_generation.fetch_add(1, Ordering::AcqRel);

        let mut retired = self.retired_fds.lock();
        if self.fd_refcount.load(Ordering::SeqCst) == 0 {
            // SAFETY: the swap removed the slot's sole ownership of
            // `old` and no holder is mid-acquisition; adopting and
            // dropping closes it exactly once.
            drop(unsafe { OwnedFd::from_raw_fd(old) });
        } else {
            retired.push(old);
        }
    }

    fn drain_retired_fds(&self) {
        for raw in self.retired_fds.lock().drain(..) {
            // SAFETY: each retired descriptor was displaced from the slot
            // with ownership intact and is closed exactly once here.
            drop(unsafe { OwnedFd::from_raw_fd(raw) });
        }
    }

    pub fn fd_generation(&self) -> u64 {
        self.fd_generation.load(Ordering::Acquire)
    }

    pub fn fd_refcount(&self) -> u32 {
        self.fd_refcount.load(Ordering::Acquire)
    }

    /// Acquire a descriptor for a handle against the cached slot,
    /// counting the holder in `fd_refcount`. The fast path duplicates
    /// the slot's descriptor; an empty slot goes through
    /// [`open_fd`](Self::open_fd) first, and a close racing in between
    /// backs off and retries. Returns the descriptor and the generation
    /// observed at acquisition.
    pub(super) fn acquire_handle_fd(&self) -> Result<(OwnedFd, u64)> {
        loop {
            let raw = self.fd.load(Ordering::SeqCst);
            if raw < 0 {
                self.open_fd()?;
                continue;
            }

            self.fd_refcount.fetch_add(1, Ordering::SeqCst);
            // Re-load to defeat close races: once the holder count is up
            // and the slot still carries `raw`, any later invalidation
            // retires `raw` instead of closing it.
            if self.fd.load(Ordering::SeqCst) != raw {
                self.release_handle_fd();
                continue;
            }

            // SAFETY: `raw` stays open for the duration of the dup; see
            // the holder-count argument above.
            let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
            match borrowed.try_clone_to_owned() {
                Ok(fd) => return Ok((fd, self.fd_generation.load(Ordering::Acquire))),
                Err(err) => {
                    self.release_handle_fd();
                    return Err(err.into());
                }
            }
        }
    }

    pub(super) fn release_handle_fd(&self) {
        let prev = self.fd_refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1);
        if prev == 1 {
            self.drain_retired_fds();
        }
    }

    // -- access tracking ---------------------------------------------------

    pub fn record_access(&self) {
        self.access_count.fetch_add(1, Ordering::AcqRel);
        self.last_access
            .store(clock::monotonic_us(), Ordering::Release);
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Acquire)
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    /// Hotness in `[0, 1]`: 70% recency (exponential decay over
    /// `halflife_secs`), 30% frequency (access count normalized by
    /// [`ACCESS_NORMALIZATION`]). An entry never accessed scores zero.
    pub fn hotness(&self, now_us: u64, halflife_secs: u64) -> f64 {
        let last = self.last_access();
        if last == 0 {
            return 0.0;
        }

        let age_secs = now_us.saturating_sub(last) as f64 / 1_000_000.0;
        let halflife = halflife_secs.max(1) as f64;
        let time_factor = (-std::f64::consts::LN_2 * age_secs / halflife).exp();

        let access_factor = (self.access_count() as f64 / ACCESS_NORMALIZATION).min(1.0);

        let score = (0.7 * time_factor + 0.3 * access_factor).clamp(0.0, 1.0);
        self.hotness_score
            .store((score as f32).to_bits(), Ordering::Release);
        score
    }

    pub fn cached_hotness(&self) -> f32 {
        f32::from_bits(self.hotness_score.load(Ordering::Acquire))
    }

    // -- payload descriptor ------------------------------------------------

    /// Copy a validated descriptor into the entry.
    pub fn set_payload(&self, descriptor: &PayloadDescriptor) {
        *self.payload.lock() = *descriptor;
    }

    /// The current descriptor, or `None` if never set.
    pub fn payload(&self) -> Option<PayloadDescriptor> {
        let payload = self.payload.lock();
        (payload.variant_count > 0).then_some(*payload)
    }

    /// Seed a single identity variant on the first size-bearing write, if
    /// no descriptor was set explicitly. Returns true if seeded.
    pub fn seed_identity_payload(&self, size_bytes: u64) -> bool {
        if size_bytes == 0 {
            return false;
        }
        let mut payload = self.payload.lock();
        if payload.variant_count > 0 {
            return false;
        }
        *payload = PayloadDescriptor::identity(size_bytes);
        true
    }
}

/// Open `path` read-write, falling back to read-only when the filesystem
/// rejects RW (read-only backend mounts).
fn open_rw_fallback(path: &Path) -> Result<OwnedFd> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Ok(file.into()),
        Err(_) => {
            let file = OpenOptions::new().read(true).open(path)?;
            Ok(file.into())
        }
    }
}

/// Scoped reference to one object: guarantees the entry stays allocated
/// and (when present) that the handle's descriptor stays open for the
/// handle's lifetime. Dropping releases the descriptor reference and then
/// the entry reference, in that order.
pub struct ObjectHandle {
    entry: NonNull<IndexEntry>,
    fd: Option<OwnedFd>,
    generation: u64,
}

// SAFETY: the handle owns one entry reference (the record cannot be freed
// underneath it) and an optionally-owned descriptor; both are safe to move
// or share across threads.
unsafe impl Send for ObjectHandle {}
unsafe impl Sync for ObjectHandle {}

impl ObjectHandle {
    /// Wrap an entry the caller has already referenced (and, when `fd` is
    /// set, counted in `fd_refcount`).
    pub(super) fn from_parts(
        entry: NonNull<IndexEntry>,
        fd: Option<OwnedFd>,
        generation: u64,
    ) -> ObjectHandle {
        ObjectHandle {
            entry,
            fd,
            generation,
        }
    }

    /// Creation path: take a fresh entry reference and adopt an
    /// already-open descriptor for it, counting it in `fd_refcount`.
    pub(crate) fn new_with_fd(entry: NonNull<IndexEntry>, fd: OwnedFd) -> ObjectHandle {
        // SAFETY: the caller owns at least one reference to `entry`.
        let entry_ref = unsafe { entry.as_ref() };
        entry_ref.get_ref();
        entry_ref.fd_refcount.fetch_add(1, Ordering::AcqRel);
        let generation = entry_ref.fd_generation();
        ObjectHandle {
            entry,
            fd: Some(fd),
            generation,
        }
    }

    pub(crate) fn entry_ptr(&self) -> NonNull<IndexEntry> {
        self.entry
    }

    pub(crate) fn entry(&self) -> &IndexEntry {
        // SAFETY: the handle holds a strong reference, so the entry is
        // alive for the handle's lifetime.
        unsafe { self.entry.as_ref() }
    }

    pub fn uri(&self) -> &str {
        self.entry().uri()
    }

    pub fn backend_id(&self) -> u32 {
        self.entry().backend_id()
    }

    pub fn path(&self) -> PathBuf {
        self.entry().path()
    }

    pub fn size_bytes(&self) -> u64 {
        self.entry().size_bytes()
    }

    pub fn mtime(&self) -> u64 {
        self.entry().mtime()
    }

    pub fn flags(&self) -> u32 {
        self.entry().flags()
    }

    pub fn payload(&self) -> Option<PayloadDescriptor> {
        self.entry().payload()
    }

    /// The handle's private descriptor, if one could be opened.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Duplicate the descriptor for ownership outside the refcount scheme
    /// (e.g. to transmit over SCM_RIGHTS and close after the send).
    pub fn dup_fd(&self) -> Result<OwnedFd> {
        match &self.fd {
            Some(fd) => Ok(fd.as_fd().try_clone_to_owned()?),
            None => Err(crate::error::MapperError::Storage(
                "handle holds no descriptor".into(),
            )),
        }
    }

    /// True when the entry's descriptor generation moved past the one this
    /// handle was acquired at (the object migrated or was re-targeted).
    pub fn is_stale(&self) -> bool {
        self.entry().fd_generation() != self.generation
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            drop(fd);
            self.entry().release_handle_fd();
        }
        // SAFETY: the handle owns exactly one entry reference.
        unsafe { IndexEntry::release(self.entry) };
    }
}
