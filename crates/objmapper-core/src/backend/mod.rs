//! Tiered storage backends.
//!
//! A backend is a directory on the host filesystem plus its metadata:
//! type, capacity, watermarks, and feature flags. The registry designates
//! at most one default, one ephemeral, and one cache backend, and the
//! object lifecycle (create/get/delete), the migration engine, and the
//! cache promoter all live here.

pub mod manager;
pub mod migrate;
pub mod promoter;

pub use manager::{BackendManager, CreateRequest, ObjectMetadata};
pub use promoter::PromoterConfig;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::{MapperError, Result};
use crate::index::{BackendIndex, BACKEND_DEFAULT_BUCKETS, DEFAULT_HOTNESS_HALFLIFE_SECS};

/// Backend feature flags.
pub const FLAG_EPHEMERAL_ONLY: u32 = 1 << 0;
pub const FLAG_PERSISTENT: u32 = 1 << 1;
pub const FLAG_ENABLED: u32 = 1 << 2;
pub const FLAG_READONLY: u32 = 1 << 3;
pub const FLAG_MIGRATION_SRC: u32 = 1 << 4;
pub const FLAG_MIGRATION_DST: u32 = 1 << 5;

/// Per-backend snapshot file name, at the mount root.
pub const SNAPSHOT_FILE_NAME: &str = ".objmapper.idx";

/// Backend types, ordered fastest to slowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// tmpfs; volatile, ephemeral objects only.
    Memory,
    Nvme,
    Ssd,
    Hdd,
    Network,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Nvme => "nvme",
            BackendKind::Ssd => "ssd",
            BackendKind::Hdd => "hdd",
            BackendKind::Network => "network",
        }
    }

    /// Relative performance, 1.0 = baseline SSD.
    pub fn default_perf_factor(self) -> f64 {
        match self {
            BackendKind::Memory => 100.0,
            BackendKind::Nvme => 10.0,
            BackendKind::Ssd => 1.0,
            BackendKind::Hdd => 0.1,
            BackendKind::Network => 0.01,
        }
    }

    /// Expected single-operation latency.
    pub fn expected_latency_us(self) -> u64 {
        match self {
            BackendKind::Memory => 1,
            BackendKind::Nvme => 100,
            BackendKind::Ssd => 500,
            BackendKind::Hdd => 10_000,
            BackendKind::Network => 50_000,
        }
    }
}

/// Automatic-migration policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationPolicy {
    None,
    Hotness,
    Capacity,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    /// Utilization above this triggers migration out.
    pub high: f64,
    /// Migration out stops once utilization falls below this.
    pub low: f64,
}

impl Default for Watermarks {
    fn default() -> Self {
        Watermarks {
            high: 0.85,
            low: 0.70,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MigrationConfig {
    policy: MigrationPolicy,
    hotness_threshold: f64,
}

/// Capacity view of one backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendStatus {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub object_count: usize,
    pub utilization: f64,
}

/// Operation counters of one backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendStats {
    pub reads: u64,
    pub writes: u64,
    pub migrations_in: u64,
    pub migrations_out: u64,
}

/// One registered tier.
pub struct BackendInfo {
    id: u32,
    kind: BackendKind,
    mount: PathBuf,
    name: String,
    flags: AtomicU32,

    perf_factor: f64,
    expected_latency_us: u64,

    capacity_bytes: u64,
    used_bytes: AtomicU64,
    object_count: AtomicUsize,

    watermarks: RwLock<Watermarks>,
    migration: RwLock<MigrationConfig>,
    hotness_halflife_secs: u64,

    /// Source of truth for what lives on this tier.
    pub index: BackendIndex,

    reads: AtomicU64,
    writes: AtomicU64,
    migrations_in: AtomicU64,
    migrations_out: AtomicU64,

    /// Per-backend write lock; migration takes source and destination in
    /// ascending-id order.
    state_lock: RwLock<()>,
}

impl BackendInfo {
    pub(crate) fn new(
        id: u32,
        kind: BackendKind,
        mount: PathBuf,
        name: String,
        capacity_bytes: u64,
        flags: u32,
    ) -> BackendInfo {
        let snapshot_path = mount.join(SNAPSHOT_FILE_NAME);
        BackendInfo {
            id,
            kind,
            mount,
            name,
            flags: AtomicU32::new(flags | FLAG_ENABLED),
            perf_factor: kind.default_perf_factor(),
            expected_latency_us: kind.expected_latency_us(),
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            object_count: AtomicUsize::new(0),
            watermarks: RwLock::new(Watermarks::default()),
            migration: RwLock::new(MigrationConfig {
                policy: MigrationPolicy::Hybrid,
                hotness_threshold: 0.5,
            }),
            hotness_halflife_secs: DEFAULT_HOTNESS_HALFLIFE_SECS,
            index: BackendIndex::new(id, Some(snapshot_path), BACKEND_DEFAULT_BUCKETS),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            migrations_in: AtomicU64::new(0),
            migrations_out: AtomicU64::new(0),
            state_lock: RwLock::new(()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn perf_factor(&self) -> f64 {
        self.perf_factor
    }

    pub fn expected_latency_us(&self) -> u64 {
        self.expected_latency_us
    }

    pub fn hotness_halflife_secs(&self) -> u64 {
        self.hotness_halflife_secs
    }

    // -- flags -------------------------------------------------------------

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub fn is_enabled(&self) -> bool {
        self.has_flag(FLAG_ENABLED)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.flags.fetch_or(FLAG_ENABLED, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!FLAG_ENABLED, Ordering::AcqRel);
        }
    }

    pub fn is_ephemeral_only(&self) -> bool {
        self.has_flag(FLAG_EPHEMERAL_ONLY)
    }

    pub fn is_persistent(&self) -> bool {
        self.has_flag(FLAG_PERSISTENT)
    }

    pub fn is_readonly(&self) -> bool {
        self.has_flag(FLAG_READONLY)
    }

    pub fn can_migrate_out(&self) -> bool {
        self.has_flag(FLAG_MIGRATION_SRC)
    }

    pub fn can_migrate_in(&self) -> bool {
        self.has_flag(FLAG_MIGRATION_DST)
    }

    // -- capacity accounting (advisory) ------------------------------------

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn object_count(&self) -> usize {
        self.object_count.load(Ordering::Acquire)
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 / self.capacity_bytes as f64
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            capacity_bytes: self.capacity_bytes,
            used_bytes: self.used_bytes(),
            object_count: self.object_count(),
            utilization: self.utilization(),
        }
    }

    pub(crate) fn add_object(&self, size_bytes: u64) {
        self.object_count.fetch_add(1, Ordering::AcqRel);
        self.used_bytes.fetch_add(size_bytes, Ordering::AcqRel);
    }

    pub(crate) fn remove_object(&self, size_bytes: u64) {
        self.object_count.fetch_sub(1, Ordering::AcqRel);
        self.used_bytes.fetch_sub(size_bytes, Ordering::AcqRel);
    }

    pub(crate) fn adjust_used(&self, delta: i64) {
        if delta >= 0 {
            self.used_bytes.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.used_bytes
                .fetch_sub(delta.unsigned_abs(), Ordering::AcqRel);
        }
    }

    // -- watermarks and migration policy -----------------------------------

    pub fn watermarks(&self) -> Watermarks {
        *self.watermarks.read()
    }

    pub fn set_watermarks(&self, low: f64, high: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
            return Err(MapperError::InvalidRequest(format!(
                "watermarks must satisfy 0 <= low < high <= 1 (got low={low}, high={high})"
            )));
        }
        *self.watermarks.write() = Watermarks { high, low };
        Ok(())
    }

    pub fn migration_policy(&self) -> (MigrationPolicy, f64) {
        let config = self.migration.read();
        (config.policy, config.hotness_threshold)
    }

    pub fn set_migration_policy(&self, policy: MigrationPolicy, hotness_threshold: f64) {
        *self.migration.write() = MigrationConfig {
            policy,
            hotness_threshold: hotness_threshold.clamp(0.0, 1.0),
        };
    }

    // -- statistics --------------------------------------------------------

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            migrations_in: self.migrations_in.load(Ordering::Relaxed),
            migrations_out: self.migrations_out.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn count_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_migration_in(&self) {
        self.migrations_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_migration_out(&self) {
        self.migrations_out.fetch_add(1, Ordering::Relaxed);
    }

    // -- paths and locking -------------------------------------------------

    /// Filesystem path for a URI on this backend: the URI maps directly
    /// under the mount: `/a/b.dat` on `/srv/b0` maps to `/srv/b0/a/b.dat`.
    pub fn object_path(&self, uri: &str) -> PathBuf {
        self.mount.join(uri.trim_start_matches('/'))
    }

    pub(crate) fn state_lock(&self) -> &RwLock<()> {
        &self.state_lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(kind: BackendKind, flags: u32) -> BackendInfo {
        BackendInfo::new(
            0,
            kind,
            PathBuf::from("/srv/backend0"),
            "test".into(),
            1 << 30,
            flags,
        )
    }

    #[test]
    fn test_registration_implies_enabled() {
        let info = backend(BackendKind::Ssd, FLAG_PERSISTENT);
        assert!(info.is_enabled());
        assert!(info.is_persistent());
        assert!(!info.is_ephemeral_only());

        info.set_enabled(false);
        assert!(!info.is_enabled());
        info.set_enabled(true);
        assert!(info.is_enabled());
    }

    #[test]
    fn test_object_path_maps_uri_under_mount() {
        let info = backend(BackendKind::Ssd, FLAG_PERSISTENT);
        assert_eq!(
            info.object_path("/a/b.dat"),
            PathBuf::from("/srv/backend0/a/b.dat")
        );
    }

    #[test]
    fn test_capacity_accounting() {
        let info = backend(BackendKind::Memory, FLAG_EPHEMERAL_ONLY);
        info.add_object(512);
        info.add_object(512);
        assert_eq!(info.object_count(), 2);
        assert_eq!(info.used_bytes(), 1024);

        info.adjust_used(476);
        assert_eq!(info.used_bytes(), 1500);
        info.adjust_used(-500);
        assert_eq!(info.used_bytes(), 1000);

        info.remove_object(500);
        assert_eq!(info.object_count(), 1);
        let status = info.status();
        assert_eq!(status.used_bytes, 500);
        assert!(status.utilization > 0.0);
    }

    #[test]
    fn test_watermark_validation() {
        let info = backend(BackendKind::Ssd, FLAG_PERSISTENT);
        assert!(info.set_watermarks(0.5, 0.9).is_ok());
        assert!(info.set_watermarks(0.9, 0.5).is_err());
        assert!(info.set_watermarks(0.5, 0.5).is_err());
        assert!(info.set_watermarks(-0.1, 0.5).is_err());
        assert!(info.set_watermarks(0.5, 1.5).is_err());

        let marks = info.watermarks();
        assert_eq!(marks.low, 0.5);
        assert_eq!(marks.high, 0.9);
    }

    #[test]
    fn test_kind_tables() {
        assert!(BackendKind::Memory.default_perf_factor() > BackendKind::Hdd.default_perf_factor());
        assert!(BackendKind::Memory.expected_latency_us() < BackendKind::Network.expected_latency_us());
        assert_eq!(BackendKind::Nvme.name(), "nvme");
    }
}
