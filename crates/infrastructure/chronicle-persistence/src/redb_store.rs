use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use chronicle_core::{
    EndpointId, Fact, NaturalKey, RecordId, Target, TargetId, Timestamp, Tracker, Update,
};
use redb::{Database, ReadableTable, Table, TableDefinition};

use crate::api::{DbState, FinishOutcome, CHRONICLE_REDB_FILENAME, CURRENT_SCHEMA};
use crate::codec::{
    decode_fact, decode_target, decode_tracker, encode_fact, encode_target, encode_tracker,
};
use crate::maintenance::quarantine_corrupt_file;
use crate::record_key::RecordKey;
use crate::{RecordStore, StorageError, TargetDirectory, TrackerStore};

const META: TableDefinition<&str, &str> = TableDefinition::new("meta");
const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");
const TRACKERS_OPEN: TableDefinition<&[u8], &[u8]> = TableDefinition::new("trackers_open");
const TRACKER_HISTORY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tracker_history");
const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");
const RECORD_VERSIONS: TableDefinition<&[u8], u64> = TableDefinition::new("record_versions");

const META_FORMAT_KEY: &str = "format";
const META_FORMAT_VALUE: &str = "chronicle-redb";
const META_SCHEMA_VERSION: &str = "schema_version";
const META_CREATED_AT: &str = "created_at";
const META_NEXT_RECORD_ID: &str = "next_record_id";
const META_NEXT_HISTORY_SEQ: &str = "next_history_seq";

type MetaTable<'txn> = Table<'txn, &'static str, &'static str>;
type BytesTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;
type VersionTable<'txn> = Table<'txn, &'static [u8], u64>;

/// redb-backed store for targets, trackers and versioned records.
///
/// Cloning is cheap; clones share one open database.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    path: Option<Utf8PathBuf>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").field("path", &self.path).finish()
    }
}

impl RedbStore {
    fn is_corrupt_open_error(err: &redb::DatabaseError) -> bool {
        match err {
            redb::DatabaseError::Storage(storage) => match storage {
                redb::StorageError::Corrupted(_) => true,
                redb::StorageError::Io(ioe) => matches!(
                    ioe.kind(),
                    std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
                ),
                _ => false,
            },
            _ => false,
        }
    }

    pub fn path_for_root(root: &Utf8Path) -> Utf8PathBuf {
        root.join(CHRONICLE_REDB_FILENAME)
    }

    /// Opens (or creates) the database file at `path`.
    pub fn open(path: &Utf8Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path.exists() {
            match Database::open(path.as_std_path()) {
                Ok(db) => db,
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(StorageError::DatabaseAlreadyOpen);
                }
                Err(e) if Self::is_corrupt_open_error(&e) => {
                    let _ = quarantine_corrupt_file(path);
                    return Err(StorageError::Corrupt);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            Database::create(path.as_std_path())?
        };

        if let Err(e) = Self::ensure_schema(&db) {
            drop(db);
            if matches!(e, StorageError::Corrupt) {
                let _ = quarantine_corrupt_file(path);
            }
            return Err(e);
        }
        tracing::debug!("opened chronicle store at {}", path);
        Ok(Self {
            db: Arc::new(db),
            path: Some(path.to_path_buf()),
        })
    }

    /// A throwaway store backed by memory.
    pub fn in_memory() -> Result<Self, StorageError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::ensure_schema(&db)?;
        Ok(Self {
            db: Arc::new(db),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Classifies the file at `path` without keeping it open.
    pub fn validate(path: &Utf8Path) -> Result<DbState, StorageError> {
        if !path.exists() {
            return Ok(DbState::Missing);
        }
        match Database::open(path.as_std_path()) {
            Ok(db) => match Self::ensure_schema(&db) {
                Ok(()) => Ok(DbState::Valid),
                Err(StorageError::NewerSchema { found, supported }) => {
                    Ok(DbState::NewerSchema { found, supported })
                }
                Err(StorageError::DatabaseAlreadyOpen) => Ok(DbState::Busy),
                Err(StorageError::Corrupt) => {
                    drop(db);
                    let _ = quarantine_corrupt_file(path);
                    Ok(DbState::Corrupt)
                }
                Err(e) => Err(e),
            },
            Err(redb::DatabaseError::DatabaseAlreadyOpen) => Ok(DbState::Busy),
            Err(e) if Self::is_corrupt_open_error(&e) => {
                let _ = quarantine_corrupt_file(path);
                Ok(DbState::Corrupt)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_schema(db: &Database) -> Result<(), StorageError> {
        // Create tables and required meta keys on first open.
        let write_tx = db.begin_write()?;
        {
            let mut meta = write_tx.open_table(META)?;
            let format: Option<String> = meta.get(META_FORMAT_KEY)?.map(|g| g.value().to_string());
            if format.is_none() {
                let schema_version = CURRENT_SCHEMA.to_string();
                let created_at = Utc::now().to_rfc3339();
                meta.insert(META_FORMAT_KEY, META_FORMAT_VALUE)?;
                meta.insert(META_SCHEMA_VERSION, schema_version.as_str())?;
                meta.insert(META_CREATED_AT, created_at.as_str())?;
            } else if format.as_deref() != Some(META_FORMAT_VALUE) {
                return Err(StorageError::Corrupt);
            }
        }
        let _ = write_tx.open_table(TARGETS)?;
        let _ = write_tx.open_table(TRACKERS_OPEN)?;
        let _ = write_tx.open_table(TRACKER_HISTORY)?;
        let _ = write_tx.open_table(RECORDS)?;
        let _ = write_tx.open_table(RECORD_VERSIONS)?;
        write_tx.commit()?;

        let read_tx = db.begin_read()?;
        let meta = read_tx.open_table(META)?;
        let schema_version = meta
            .get(META_SCHEMA_VERSION)?
            .and_then(|g| g.value().parse::<u32>().ok())
            .unwrap_or(0);
        if schema_version == 0 {
            return Err(StorageError::Corrupt);
        }
        if schema_version > CURRENT_SCHEMA {
            return Err(StorageError::NewerSchema {
                found: schema_version,
                supported: CURRENT_SCHEMA,
            });
        }
        if schema_version != CURRENT_SCHEMA {
            return Err(StorageError::Corrupt);
        }
        Ok(())
    }

    /// Returns the counter's current value and advances it.
    fn next_counter(meta: &mut MetaTable<'_>, name: &str) -> Result<u64, StorageError> {
        let current = meta
            .get(name)?
            .and_then(|g| g.value().parse::<u64>().ok())
            .unwrap_or(1);
        let next = (current + 1).to_string();
        meta.insert(name, next.as_str())?;
        Ok(current)
    }

    fn load_fact<T>(
        records: &T,
        kind: &str,
        target: TargetId,
        id: RecordId,
    ) -> Result<Option<Fact>, StorageError>
    where
        T: ReadableTable<&'static [u8], &'static [u8]>,
    {
        let key = RecordKey::record(kind, target, id)?;
        let fact = records
            .get(key.as_slice())?
            .map(|g| decode_fact(g.value()))
            .transpose()?;
        Ok(fact)
    }

    /// Record ids of every version of one natural key, oldest first.
    fn version_ids<T>(
        versions: &T,
        kind: &str,
        target: TargetId,
        natural: &NaturalKey,
    ) -> Result<Vec<RecordId>, StorageError>
    where
        T: ReadableTable<&'static [u8], u64>,
    {
        let prefix = RecordKey::versions_prefix(kind, target, natural)?;
        let end = RecordKey::prefix_end(&prefix);
        let mut ids = Vec::new();
        for row in versions.range(prefix.as_slice()..end.as_slice())? {
            let (_, v) = row?;
            ids.push(RecordId(v.value()));
        }
        Ok(ids)
    }

    fn latest_version<R, V>(
        records: &R,
        versions: &V,
        fact: &Fact,
    ) -> Result<Option<Fact>, StorageError>
    where
        R: ReadableTable<&'static [u8], &'static [u8]>,
        V: ReadableTable<&'static [u8], u64>,
    {
        let prefix = RecordKey::versions_prefix(&fact.kind, fact.target, &fact.key)?;
        let end = RecordKey::prefix_end(&prefix);
        let latest = match versions.range(prefix.as_slice()..end.as_slice())?.next_back() {
            Some(row) => {
                let (_, v) = row?;
                RecordId(v.value())
            }
            None => return Ok(None),
        };
        Self::load_fact(records, &fact.kind, fact.target, latest)
    }

    fn close_version(
        records: &mut BytesTable<'_>,
        versions: &VersionTable<'_>,
        closed: &Fact,
    ) -> Result<(), StorageError> {
        let current = Self::latest_version(&*records, versions, closed)?.ok_or_else(|| {
            StorageError::Conflict(format!(
                "{} {} has no version to close",
                closed.kind, closed.key
            ))
        })?;
        if !current.life.is_live() {
            return Err(StorageError::Conflict(format!(
                "{} {} is already retired",
                closed.kind, closed.key
            )));
        }
        if closed.id.is_some() && closed.id != current.id {
            return Err(StorageError::Conflict(format!(
                "{} {} was superseded by another writer",
                closed.kind, closed.key
            )));
        }
        if closed.life.end < current.life.start {
            return Err(StorageError::Conflict(format!(
                "{} {} closed before it started",
                closed.kind, closed.key
            )));
        }

        let id = current.id.ok_or(StorageError::Corrupt)?;
        let mut updated = current;
        updated.life.end = closed.life.end;
        let key = RecordKey::record(&updated.kind, updated.target, id)?;
        let value = encode_fact(&updated)?;
        records.insert(key.as_slice(), value.as_slice())?;
        Ok(())
    }

    fn open_version(
        meta: &mut MetaTable<'_>,
        records: &mut BytesTable<'_>,
        versions: &mut VersionTable<'_>,
        opened: &Fact,
    ) -> Result<RecordId, StorageError> {
        if let Some(previous) = Self::latest_version(&*records, &*versions, opened)? {
            if previous.life.is_live() {
                return Err(StorageError::Conflict(format!(
                    "{} {} already has a live version",
                    opened.kind, opened.key
                )));
            }
            if opened.life.start < previous.life.end {
                return Err(StorageError::Conflict(format!(
                    "{} {} would overlap its previous version",
                    opened.kind, opened.key
                )));
            }
        }

        let id = RecordId(Self::next_counter(meta, META_NEXT_RECORD_ID)?);
        let mut stored = opened.clone();
        stored.id = Some(id);
        let key = RecordKey::record(&stored.kind, stored.target, id)?;
        let value = encode_fact(&stored)?;
        records.insert(key.as_slice(), value.as_slice())?;
        let version_key =
            RecordKey::version(&stored.kind, stored.target, &stored.key, stored.life.start, id)?;
        versions.insert(version_key.as_slice(), id.0)?;
        Ok(id)
    }
}

impl TargetDirectory for RedbStore {
    fn resolve(&self, id: TargetId) -> Result<Option<Target>, StorageError> {
        let read_tx = self.db.begin_read()?;
        let targets = read_tx.open_table(TARGETS)?;
        let key = id.to_string();
        let target = targets
            .get(key.as_str())?
            .map(|g| decode_target(g.value()))
            .transpose()?;
        Ok(target)
    }

    fn upsert_target(&self, target: &Target) -> Result<(), StorageError> {
        let key = target.id.to_string();
        let value = encode_target(target)?;
        let write_tx = self.db.begin_write()?;
        {
            let mut targets = write_tx.open_table(TARGETS)?;
            targets.insert(key.as_str(), value.as_slice())?;
        }
        write_tx.commit()?;
        Ok(())
    }

    fn remove_target(&self, id: TargetId) -> Result<bool, StorageError> {
        let key = id.to_string();
        let write_tx = self.db.begin_write()?;
        let removed = {
            let mut targets = write_tx.open_table(TARGETS)?;
            let removed = targets.remove(key.as_str())?.is_some();
            removed
        };
        write_tx.commit()?;
        Ok(removed)
    }

    fn list_targets(&self) -> Result<Vec<Target>, StorageError> {
        let read_tx = self.db.begin_read()?;
        let targets = read_tx.open_table(TARGETS)?;
        let mut out = Vec::new();
        for row in targets.iter()? {
            let (_, v) = row?;
            out.push(decode_target(v.value())?);
        }
        Ok(out)
    }
}

impl TrackerStore for RedbStore {
    fn create_scheduled(
        &self,
        target: TargetId,
        endpoint: &EndpointId,
        scheduled_at: Timestamp,
        continuation: Option<String>,
    ) -> Result<Tracker, StorageError> {
        let key = RecordKey::pair(target, endpoint)?;
        let write_tx = self.db.begin_write()?;
        let tracker = {
            let mut open = write_tx.open_table(TRACKERS_OPEN)?;
            let existing = open
                .get(key.as_slice())?
                .map(|g| decode_tracker(g.value()))
                .transpose()?;
            match existing {
                Some(existing) => existing,
                None => {
                    let tracker =
                        Tracker::scheduled(target, endpoint.clone(), scheduled_at, continuation);
                    let value = encode_tracker(&tracker)?;
                    open.insert(key.as_slice(), value.as_slice())?;
                    tracker
                }
            }
        };
        write_tx.commit()?;
        Ok(tracker)
    }

    fn unfinished(
        &self,
        target: TargetId,
        endpoint: &EndpointId,
    ) -> Result<Option<Tracker>, StorageError> {
        let key = RecordKey::pair(target, endpoint)?;
        let read_tx = self.db.begin_read()?;
        let open = read_tx.open_table(TRACKERS_OPEN)?;
        let tracker = open
            .get(key.as_slice())?
            .map(|g| decode_tracker(g.value()))
            .transpose()?;
        Ok(tracker)
    }

    fn list_unfinished(&self) -> Result<Vec<Tracker>, StorageError> {
        let read_tx = self.db.begin_read()?;
        let open = read_tx.open_table(TRACKERS_OPEN)?;
        let mut out = Vec::new();
        for row in open.iter()? {
            let (_, v) = row?;
            out.push(decode_tracker(v.value())?);
        }
        Ok(out)
    }

    fn start_tracker(
        &self,
        tracker: &Tracker,
        now: Timestamp,
    ) -> Result<Option<Tracker>, StorageError> {
        let key = RecordKey::pair(tracker.target, &tracker.endpoint)?;
        let write_tx = self.db.begin_write()?;
        let started = {
            let mut open = write_tx.open_table(TRACKERS_OPEN)?;
            let current = open
                .get(key.as_slice())?
                .map(|g| decode_tracker(g.value()))
                .transpose()?;
            match current {
                Some(mut current) if current.id == tracker.id => {
                    if current.start(now) {
                        let value = encode_tracker(&current)?;
                        open.insert(key.as_slice(), value.as_slice())?;
                    }
                    Some(current)
                }
                _ => None,
            }
        };
        write_tx.commit()?;
        Ok(started)
    }

    fn finish_tracker(&self, finished: &Tracker) -> Result<FinishOutcome, StorageError> {
        if !finished.is_finished() {
            return Err(StorageError::Conflict(format!(
                "tracker {} is still {}",
                finished.id, finished.status
            )));
        }
        let key = RecordKey::pair(finished.target, &finished.endpoint)?;
        let write_tx = self.db.begin_write()?;
        {
            let mut open = write_tx.open_table(TRACKERS_OPEN)?;
            let current = open
                .get(key.as_slice())?
                .map(|g| decode_tracker(g.value()))
                .transpose()?;
            let same_attempt = current.map(|t| t.id == finished.id).unwrap_or(false);
            if !same_attempt {
                drop(open);
                write_tx.abort()?;
                return Ok(FinishOutcome::RaceLost);
            }
            open.remove(key.as_slice())?;

            let mut meta = write_tx.open_table(META)?;
            let seq = Self::next_counter(&mut meta, META_NEXT_HISTORY_SEQ)?;
            let mut history = write_tx.open_table(TRACKER_HISTORY)?;
            let history_key = RecordKey::history(finished.target, &finished.endpoint, seq)?;
            let value = encode_tracker(finished)?;
            history.insert(history_key.as_slice(), value.as_slice())?;
        }
        write_tx.commit()?;
        Ok(FinishOutcome::Finished(finished.clone()))
    }

    fn history(
        &self,
        target: TargetId,
        endpoint: &EndpointId,
        limit: usize,
    ) -> Result<Vec<Tracker>, StorageError> {
        let prefix = RecordKey::pair(target, endpoint)?;
        let end = RecordKey::prefix_end(&prefix);
        let read_tx = self.db.begin_read()?;
        let history = read_tx.open_table(TRACKER_HISTORY)?;
        let mut out = Vec::new();
        for row in history.range(prefix.as_slice()..end.as_slice())?.rev() {
            if out.len() >= limit {
                break;
            }
            let (_, v) = row?;
            out.push(decode_tracker(v.value())?);
        }
        Ok(out)
    }
}

impl RecordStore for RedbStore {
    fn get(
        &self,
        kind: &str,
        target: TargetId,
        key: &NaturalKey,
        at: Timestamp,
    ) -> Result<Option<Fact>, StorageError> {
        let read_tx = self.db.begin_read()?;
        let records = read_tx.open_table(RECORDS)?;
        let versions = read_tx.open_table(RECORD_VERSIONS)?;
        for id in Self::version_ids(&versions, kind, target, key)?.into_iter().rev() {
            if let Some(fact) = Self::load_fact(&records, kind, target, id)? {
                if fact.life.contains(at) {
                    return Ok(Some(fact));
                }
                if fact.life.start <= at {
                    // Older versions all ended before this one started.
                    break;
                }
            }
        }
        Ok(None)
    }

    fn live_page(
        &self,
        kind: &str,
        target: TargetId,
        at: Timestamp,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<Fact>, StorageError> {
        let prefix = RecordKey::records_prefix(kind, target)?;
        let start = match after {
            Some(id) => RecordKey::record(kind, target, RecordId(id.0.saturating_add(1)))?,
            None => prefix.clone(),
        };
        let end = RecordKey::prefix_end(&prefix);
        let read_tx = self.db.begin_read()?;
        let records = read_tx.open_table(RECORDS)?;
        let mut out = Vec::new();
        for row in records.range(start.as_slice()..end.as_slice())? {
            if out.len() >= limit {
                break;
            }
            let (_, v) = row?;
            let fact = decode_fact(v.value())?;
            if fact.life.contains(at) {
                out.push(fact);
            }
        }
        Ok(out)
    }

    fn versions(
        &self,
        kind: &str,
        target: TargetId,
        key: &NaturalKey,
    ) -> Result<Vec<Fact>, StorageError> {
        let read_tx = self.db.begin_read()?;
        let records = read_tx.open_table(RECORDS)?;
        let versions = read_tx.open_table(RECORD_VERSIONS)?;
        let mut out = Vec::new();
        for id in Self::version_ids(&versions, kind, target, key)? {
            if let Some(fact) = Self::load_fact(&records, kind, target, id)? {
                out.push(fact);
            }
        }
        Ok(out)
    }

    fn apply(&self, updates: &[Update<Fact>]) -> Result<(), StorageError> {
        if updates.is_empty() {
            return Ok(());
        }
        let write_tx = self.db.begin_write()?;
        {
            let mut meta = write_tx.open_table(META)?;
            let mut records = write_tx.open_table(RECORDS)?;
            let mut versions = write_tx.open_table(RECORD_VERSIONS)?;
            for update in updates {
                // Close before open so a supersede never sees two live versions.
                if let Some(closed) = update.closed() {
                    Self::close_version(&mut records, &versions, closed)?;
                }
                if let Some(opened) = update.opened() {
                    Self::open_version(&mut meta, &mut records, &mut versions, opened)?;
                }
            }
        }
        write_tx.commit()?;
        Ok(())
    }

    fn retire_target(&self, target: TargetId, at: Timestamp) -> Result<usize, StorageError> {
        let write_tx = self.db.begin_write()?;
        let retired = {
            let mut records = write_tx.open_table(RECORDS)?;
            let mut live = Vec::new();
            for row in records.iter()? {
                let (k, v) = row?;
                let fact = decode_fact(v.value())?;
                if fact.target == target && fact.life.is_live() {
                    live.push((k.value().to_vec(), fact));
                }
            }
            for (key, mut fact) in live.iter().cloned() {
                fact.life = fact.life.closed_at(at.max(fact.life.start));
                let value = encode_fact(&fact)?;
                records.insert(key.as_slice(), value.as_slice())?;
            }
            live.len()
        };
        write_tx.commit()?;
        tracing::info!("retired {} live records of {}", retired, target);
        Ok(retired)
    }
}
