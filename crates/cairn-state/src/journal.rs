//! Journal-backed persistence.
//!
//! Every successful `store` appends one framed [`ChangeRecord`] to a journal
//! file before it is applied to the in-memory table. Opening a journal
//! replays it front to back.
//!
//! On-disk format of one record:
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized ChangeRecord)]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cairn_types::{ItemId, NodeId};

use crate::changelog::ChangeLog;
use crate::error::{StateError, StateResult};
use crate::item::PersistedItem;
use crate::record::{ChangeRecord, ItemTable};
use crate::references::NodeReferences;
use crate::traits::PersistenceManager;

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Flush/sync strategy for journal appends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every record.
    EveryWrite,
    /// Flush to the OS and rely on its page cache.
    #[default]
    OsDefault,
}

struct JournalWriter {
    writer: BufWriter<File>,
    offset: u64,
}

/// Persistence manager that keeps all records in memory and logs every
/// change to an append-only journal.
///
/// A torn or corrupt record ends replay: later records depend on it and are
/// discarded, and the file is truncated to the last good record.
pub struct JournalPersistenceManager {
    path: PathBuf,
    sync_mode: SyncMode,
    table: RwLock<ItemTable>,
    writer: Mutex<JournalWriter>,
}

impl JournalPersistenceManager {
    /// Open (or create) a journal and replay it.
    pub fn open(path: &Path, sync_mode: SyncMode) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut table = ItemTable::default();
        let valid_len = if path.exists() {
            replay(path, &mut table)?
        } else {
            0
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() > valid_len {
            warn!(path = %path.display(), valid_len, "truncating journal after last good record");
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        info!(path = %path.display(), items = table.len(), "journal opened");
        Ok(Self {
            path: path.to_path_buf(),
            sync_mode,
            table: RwLock::new(table),
            writer: Mutex::new(JournalWriter {
                writer: BufWriter::new(file),
                offset: valid_len,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current journal length in bytes.
    pub fn offset(&self) -> u64 {
        self.writer.lock().expect("journal mutex poisoned").offset
    }

    pub fn len(&self) -> usize {
        self.table.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the journal as a single record holding the current state.
    pub fn compact(&self) -> StateResult<()> {
        let table = self.table.read().expect("lock poisoned");
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        let record = ChangeRecord {
            added: table
                .sorted()
                .into_iter()
                .map(|(id, item)| (id.clone(), item.clone()))
                .collect(),
            ..ChangeRecord::default()
        };

        let tmp = self.path.with_extension("compact");
        let mut out = BufWriter::new(File::create(&tmp)?);
        let written = if record.is_empty() {
            0
        } else {
            write_record(&mut out, &record)?
        };
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = written;
        debug!(bytes = written, items = table.len(), "journal compacted");
        Ok(())
    }

    fn append(&self, record: &ChangeRecord) -> StateResult<()> {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        let written = write_record(&mut w.writer, record)?;
        w.writer.flush()?;
        if self.sync_mode == SyncMode::EveryWrite {
            w.writer.get_ref().sync_all()?;
        }
        debug!(offset = w.offset, len = written, "journal append");
        w.offset += written;
        Ok(())
    }
}

fn write_record(out: &mut impl Write, record: &ChangeRecord) -> StateResult<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| StateError::Serialization(e.to_string()))?;
    let crc = crc32fast::hash(&payload);
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&crc.to_le_bytes())?;
    out.write_all(&payload)?;
    Ok((HEADER_SIZE + payload.len()) as u64)
}

/// Apply every intact record; returns the byte length of the intact prefix.
fn replay(path: &Path, table: &mut ItemTable) -> StateResult<u64> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut offset: u64 = 0;
    let mut records = 0usize;

    loop {
        let mut header = [0u8; HEADER_SIZE];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if offset + (HEADER_SIZE as u64) + u64::from(length) > file_len {
            warn!(offset, length, file_len, "torn journal record; stopping replay");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        file.read_exact(&mut payload)?;

        let actual_crc = crc32fast::hash(&payload);
        if length == 0 || actual_crc != expected_crc {
            warn!(offset, expected = expected_crc, actual = actual_crc, "corrupt journal record; stopping replay");
            break;
        }
        let record: ChangeRecord = match bincode::deserialize(&payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(offset, error = %e, "undecodable journal record; stopping replay");
                break;
            }
        };
        table.apply(&record);
        records += 1;
        offset += (HEADER_SIZE + payload.len()) as u64;
    }

    debug!(records, bytes = offset, "journal replay complete");
    Ok(offset)
}

impl PersistenceManager for JournalPersistenceManager {
    fn load(&self, id: &ItemId) -> StateResult<Option<PersistedItem>> {
        Ok(self.table.read().expect("lock poisoned").get(id).cloned())
    }

    fn exists(&self, id: &ItemId) -> StateResult<bool> {
        Ok(self.table.read().expect("lock poisoned").contains(id))
    }

    fn load_references(&self, target: &NodeId) -> StateResult<NodeReferences> {
        Ok(self.table.read().expect("lock poisoned").references(target))
    }

    fn store(&self, changes: &ChangeLog) -> StateResult<()> {
        let mut table = self.table.write().expect("lock poisoned");
        let record = table.validate(changes)?;
        if record.is_empty() {
            return Ok(());
        }
        self.append(&record)?;
        table.apply(&record);
        Ok(())
    }
}

impl std::fmt::Debug for JournalPersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalPersistenceManager")
            .field("path", &self.path)
            .field("record_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::item::{ItemState, NodeData};
    use crate::status::Status;
    use cairn_types::{well_known, Name};

    fn add_node(pm: &JournalPersistenceManager, name: &str) -> ItemId {
        let state = ItemState::new_node(
            NodeId::new(),
            NodeData::new(None, Name::local(name).unwrap(), well_known::NT_UNSTRUCTURED),
            Status::New,
        );
        let id = state.id().clone();
        let mut log = ChangeLog::new();
        log.added(state);
        pm.store(&log).unwrap();
        id
    }

    #[test]
    fn replay_restores_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.journal");
        let pm = JournalPersistenceManager::open(&path, SyncMode::EveryWrite).unwrap();
        let a = add_node(&pm, "a");
        let b = add_node(&pm, "b");

        let mut state = ItemState::from_persisted(a.clone(), pm.load(&a).unwrap().unwrap()).unwrap();
        state.mark_modified().unwrap();
        let mut log = ChangeLog::new();
        log.modified(state);
        pm.store(&log).unwrap();
        drop(pm);

        let reopened = JournalPersistenceManager::open(&path, SyncMode::default()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.load(&a).unwrap().unwrap().modcount, 2);
        assert!(reopened.exists(&b).unwrap());
    }

    #[test]
    fn corrupt_record_ends_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.journal");
        let pm = JournalPersistenceManager::open(&path, SyncMode::default()).unwrap();
        let a = add_node(&pm, "a");
        let first_len = pm.offset();
        let b = add_node(&pm, "b");
        drop(pm);

        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let at = first_len + HEADER_SIZE as u64;
            file.seek(SeekFrom::Start(at)).unwrap();
            let mut buf = [0u8; 1];
            file.read_exact(&mut buf).unwrap();
            buf[0] ^= 0xFF;
            file.seek(SeekFrom::Start(at)).unwrap();
            file.write_all(&buf).unwrap();
        }

        let reopened = JournalPersistenceManager::open(&path, SyncMode::default()).unwrap();
        assert!(reopened.exists(&a).unwrap());
        assert!(!reopened.exists(&b).unwrap());
        assert_eq!(reopened.offset(), first_len);

        let c = add_node(&reopened, "c");
        drop(reopened);
        let again = JournalPersistenceManager::open(&path, SyncMode::default()).unwrap();
        assert!(again.exists(&c).unwrap());
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.journal");
        let pm = JournalPersistenceManager::open(&path, SyncMode::default()).unwrap();
        add_node(&pm, "a");
        let good = pm.offset();
        drop(pm);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let reopened = JournalPersistenceManager::open(&path, SyncMode::default()).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), good);
    }

    #[test]
    fn compact_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.journal");
        let pm = JournalPersistenceManager::open(&path, SyncMode::default()).unwrap();
        let ids: Vec<ItemId> = (0..5).map(|i| add_node(&pm, &format!("n{i}"))).collect();
        pm.compact().unwrap();
        let extra = add_node(&pm, "extra");
        drop(pm);

        let reopened = JournalPersistenceManager::open(&path, SyncMode::default()).unwrap();
        assert_eq!(reopened.len(), 6);
        for id in ids.iter().chain(std::iter::once(&extra)) {
            assert!(reopened.exists(id).unwrap());
        }
    }
}
