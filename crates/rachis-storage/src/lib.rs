//! # rachis-storage
//!
//! why: provide durable persistence for rachis nodes using standard rust fs apis
//! relations: implements the rachis-core LogStore and SnapshotStore contracts; used by rachis-runtime
//! what: FileStorage (vote + log), FileSnapshotStore (latest snapshot), atomic file replacement

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use rachis_core::storage::check_contiguous;
use rachis_core::{LogEntry, LogIndex, LogStore, Snapshot, SnapshotStore, StorageError, Term, Vote};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// open both stores of a node rooted at `dir`
pub fn open(dir: impl AsRef<Path>) -> Result<(FileStorage, FileSnapshotStore), StorageError> {
    let dir = dir.as_ref();
    Ok((FileStorage::new(dir)?, FileSnapshotStore::new(dir)?))
}

// -- file storage implementation --

/// file-based log store using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term, voted_for and the purge point
/// - log.json: array of log entries after the purge point
///
/// the files are read once on open and kept in memory; every change is
/// written through before the call returns.
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    meta: MetaData,
    entries: VecDeque<LogEntry>,
}

/// metadata structure for term, vote and purge point
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct MetaData {
    term: Term,
    voted_for: Option<u64>,
    #[serde(default)]
    purged_index: LogIndex,
    #[serde(default)]
    purged_term: Term,
}

impl FileStorage {
    /// open the store at the given directory, creating it if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let meta: MetaData = read_json(&dir.join(META_FILE))?.unwrap_or_default();
        let stored: Vec<LogEntry> = read_json(&dir.join(LOG_FILE))?.unwrap_or_default();

        // a crash between the meta and log writes of a purge leaves entries
        // the meta already covers; they are dropped here
        let mut entries: VecDeque<LogEntry> = stored.into_iter().filter(|e| e.index > meta.purged_index).collect();
        check_contiguous(meta.purged_index, entries.make_contiguous())
            .map_err(|e| StorageError::Corrupt(format!("log.json: {e}")))?;

        info!(
            dir = %dir.display(),
            term = meta.term,
            purged = meta.purged_index,
            entries = entries.len(),
            "opened file storage"
        );
        Ok(Self { dir, meta, entries })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.meta.purged_index {
            return None;
        }
        let pos = (index - self.meta.purged_index - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    fn write_meta(&self) -> Result<(), StorageError> {
        write_atomic(&self.dir, META_FILE, &serde_json::to_vec_pretty(&self.meta)?)
    }

    /// write entire log (simple approach - could optimize with append-only file)
    fn write_log(&self) -> Result<(), StorageError> {
        let (front, back) = self.entries.as_slices();
        let all: Vec<&LogEntry> = front.iter().chain(back).collect();
        write_atomic(&self.dir, LOG_FILE, &serde_json::to_vec(&all)?)
    }
}

impl LogStore for FileStorage {
    fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError> {
        let previous = self.meta;
        self.meta.term = vote.term;
        self.meta.voted_for = vote.voted_for;
        if let Err(e) = self.write_meta() {
            self.meta = previous;
            return Err(e);
        }
        Ok(())
    }

    fn load_vote(&self) -> Result<Vote, StorageError> {
        Ok(Vote { term: self.meta.term, voted_for: self.meta.voted_for })
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        check_contiguous(self.last_index_and_term()?.0, entries)?;
        self.entries.extend(entries.iter().cloned());
        if let Err(e) = self.write_log() {
            let keep = self.entries.len() - entries.len();
            self.entries.truncate(keep);
            return Err(e);
        }
        Ok(())
    }

    fn entries_from(&self, index: LogIndex, max: u64) -> Result<Vec<LogEntry>, StorageError> {
        let Some(start) = self.position(index) else {
            return Ok(Vec::new());
        };
        Ok(self.entries.iter().skip(start).take(max as usize).cloned().collect())
    }

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError> {
        Ok(self.position(index).map(|pos| self.entries[pos].clone()))
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        let keep = index.saturating_sub(self.meta.purged_index + 1) as usize;
        if keep >= self.entries.len() {
            return Ok(());
        }
        debug!(dir = %self.dir.display(), index, "truncating log");
        self.entries.truncate(keep);
        self.write_log()
    }

    fn purge_to(&mut self, index: LogIndex, term: Term) -> Result<(), StorageError> {
        if index <= self.meta.purged_index {
            return Ok(());
        }
        // meta first: entries it covers are ignored on open
        let previous = self.meta;
        self.meta.purged_index = index;
        self.meta.purged_term = term;
        if let Err(e) = self.write_meta() {
            self.meta = previous;
            return Err(e);
        }
        while self.entries.front().is_some_and(|e| e.index <= index) {
            self.entries.pop_front();
        }
        // purging past our last entry (snapshot install) leaves an empty log
        if self.entries.front().is_some_and(|e| e.index != index + 1) {
            self.entries.clear();
        }
        debug!(dir = %self.dir.display(), index, "purged log prefix");
        self.write_log()
    }

    fn last_index_and_term(&self) -> Result<(LogIndex, Term), StorageError> {
        Ok(self
            .entries
            .back()
            .map_or((self.meta.purged_index, self.meta.purged_term), |e| (e.index, e.term)))
    }

    fn purged(&self) -> (LogIndex, Term) {
        (self.meta.purged_index, self.meta.purged_term)
    }
}

// -- snapshot storage implementation --

/// file-based snapshot store: snapshot.json holds the latest snapshot only
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        debug!(dir = %self.dir.display(), index = snapshot.last_included_index, "saving snapshot");
        write_atomic(&self.dir, SNAPSHOT_FILE, &serde_json::to_vec(snapshot)?)
    }

    fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        read_json(&self.dir.join(SNAPSHOT_FILE))
    }
}

// -- file helpers --

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// atomic write: write to temp file then rename
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    Ok(())
}

/// read and parse a json file; `None` if it doesn't exist yet
fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StorageError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(Some(serde_json::from_str(&contents)?))
}
