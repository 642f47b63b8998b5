//! Durable per-backend index snapshots.
//!
//! On-disk layout (all integers little-endian, unlike the wire):
//!
//! ```text
//! header { magic:"OBJIDX", version:u16=2, backend_id:u32,
//!          num_entries:u64, num_buckets:u64 }
//! entry  { uri_len:u16, uri, path_len:u16, path,
//!          size:u64, mtime:u64, flags:u32 }
//! ```
//!
//! Saves go to `<snapshot>.tmp` and are atomically renamed into place.
//! Loads hard-fail on an unknown magic or version; a truncated record
//! aborts the load but keeps everything read so far.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{MapperError, Result};
use crate::index::BackendIndex;

pub const SNAPSHOT_MAGIC: &[u8; 6] = b"OBJIDX";
pub const SNAPSHOT_VERSION: u16 = 2;

/// One persisted object record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub uri: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mtime: u64,
    pub flags: u32,
}

/// A loaded snapshot file.
#[derive(Debug)]
pub struct Snapshot {
    pub backend_id: u32,
    pub num_buckets: u64,
    pub records: Vec<SnapshotRecord>,
}

/// Write the backend index to its snapshot path. Records are emitted in
/// URI order so repeated saves of the same membership are byte-identical.
/// Clears the dirty flag on success.
pub fn save(index: &BackendIndex) -> Result<usize> {
    let Some(path) = index.snapshot_path() else {
        return Err(MapperError::Storage(
            "snapshot persistence disabled for this index".into(),
        ));
    };

    let mut records = Vec::with_capacity(index.len());
    index.for_each(|entry| {
        records.push(SnapshotRecord {
            uri: entry.uri().to_owned(),
            path: entry.path(),
            size_bytes: entry.size_bytes(),
            mtime: entry.mtime(),
            flags: entry.flags(),
        });
    });
    records.sort_by(|a, b| a.uri.cmp(&b.uri));

    let tmp_path = tmp_path_for(path);
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
        writer.write_all(&index.backend_id().to_le_bytes())?;
        writer.write_all(&(records.len() as u64).to_le_bytes())?;
        writer.write_all(&(index.len() as u64).to_le_bytes())?;

        for record in &records {
            let uri = record.uri.as_bytes();
            let path_bytes = record.path.as_os_str().as_bytes();
            writer.write_all(&(uri.len() as u16).to_le_bytes())?;
            writer.write_all(uri)?;
            writer.write_all(&(path_bytes.len() as u16).to_le_bytes())?;
            writer.write_all(path_bytes)?;
            writer.write_all(&record.size_bytes.to_le_bytes())?;
            writer.write_all(&record.mtime.to_le_bytes())?;
            writer.write_all(&record.flags.to_le_bytes())?;
        }
        writer.flush()?;
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }

    index.clear_dirty();
    debug!(
        "saved index snapshot for backend {}: {} entries",
        index.backend_id(),
        records.len()
    );
    Ok(records.len())
}

/// Load a snapshot file. See the module docs for the failure rules.
pub fn load(path: &Path) -> Result<Snapshot> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(MapperError::Storage(format!(
            "bad snapshot magic in {}",
            path.display()
        )));
    }

    let version = read_u16(&mut reader)?;
    if version != SNAPSHOT_VERSION {
        return Err(MapperError::Storage(format!(
            "unsupported snapshot version {version} in {}",
            path.display()
        )));
    }

    let backend_id = read_u32(&mut reader)?;
    let num_entries = read_u64(&mut reader)?;
    let num_buckets = read_u64(&mut reader)?;

    let mut records = Vec::new();
    for _ in 0..num_entries {
        match read_record(&mut reader) {
            Ok(record) => records.push(record),
            Err(_) => {
                warn!(
                    "truncated snapshot {}: kept {} of {} records",
                    path.display(),
                    records.len(),
                    num_entries
                );
                break;
            }
        }
    }

    Ok(Snapshot {
        backend_id,
        num_buckets,
        records,
    })
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn read_record(reader: &mut impl Read) -> Result<SnapshotRecord> {
    let uri_len = read_u16(reader)? as usize;
    let mut uri = vec![0u8; uri_len];
    reader.read_exact(&mut uri)?;
    let uri = String::from_utf8(uri)
        .map_err(|_| MapperError::Storage("snapshot record URI is not UTF-8".into()))?;

    let path_len = read_u16(reader)? as usize;
    let mut path = vec![0u8; path_len];
    reader.read_exact(&mut path)?;
    let path = PathBuf::from(std::ffi::OsString::from_vec(path));

    Ok(SnapshotRecord {
        uri,
        path,
        size_bytes: read_u64(reader)?,
        mtime: read_u64(reader)?,
        flags: read_u32(reader)?,
    })
}

fn read_u16(reader: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexEntry, FLAG_PERSISTENT};

    fn populated_index(dir: &Path, uris: &[&str]) -> BackendIndex {
        let index = BackendIndex::new(7, Some(dir.join(".objmapper.idx")), 64);
        for (i, uri) in uris.iter().enumerate() {
            let entry = IndexEntry::alloc(uri, 7, dir.join(uri.trim_start_matches('/')));
            {
                // SAFETY: freshly allocated, we own the initial reference.
                let entry_ref = unsafe { entry.as_ref() };
                entry_ref.set_size_bytes((i as u64 + 1) * 100);
                entry_ref.set_mtime(1_700_000_000 + i as u64);
                entry_ref.set_flags(FLAG_PERSISTENT);
            }
            index.insert(entry).unwrap();
            // The index holds its membership reference; drop ours.
            unsafe { IndexEntry::release(entry) };
        }
        index
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = populated_index(dir.path(), &["/b", "/a", "/c/d"]);

        let saved = save(&index).unwrap();
        assert_eq!(saved, 3);
        assert!(!index.is_dirty());

        let snapshot = load(index.snapshot_path().unwrap()).unwrap();
        assert_eq!(snapshot.backend_id, 7);
        assert_eq!(snapshot.records.len(), 3);
        // Sorted by URI.
        assert_eq!(snapshot.records[0].uri, "/a");
        assert_eq!(snapshot.records[1].uri, "/b");
        assert_eq!(snapshot.records[2].uri, "/c/d");
        assert_eq!(snapshot.records[1].flags, FLAG_PERSISTENT);
    }

    #[test]
    fn test_second_save_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let index = populated_index(dir.path(), &["/x", "/y", "/z"]);

        save(&index).unwrap();
        let first = std::fs::read(index.snapshot_path().unwrap()).unwrap();
        save(&index).unwrap();
        let second = std::fs::read(index.snapshot_path().unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".objmapper.idx");
        std::fs::write(&path, b"NOTIDXxxxxxxxxxxxxxxxxxxxxxxxx").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = populated_index(dir.path(), &["/v"]);
        save(&index).unwrap();

        let path = index.snapshot_path().unwrap().clone();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6] = 9; // version low byte
        std::fs::write(&path, &bytes).unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_truncated_record_keeps_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let index = populated_index(dir.path(), &["/one", "/two"]);
        save(&index).unwrap();

        let path = index.snapshot_path().unwrap().clone();
        let bytes = std::fs::read(&path).unwrap();
        // Chop the file mid-way through the second record.
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let snapshot = load(&path).unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].uri, "/one");
    }
}
