use camino::Utf8PathBuf;
use chronicle_persistence::{DbState, RedbStore, StorageError, CURRENT_SCHEMA};
use redb::TableDefinition;

const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

fn temp_db() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let db_path = RedbStore::path_for_root(&root);
    (dir, db_path)
}

#[test]
fn validate_reports_missing_then_valid() {
    let (_dir, db_path) = temp_db();

    assert_eq!(RedbStore::validate(&db_path).unwrap(), DbState::Missing);
    drop(RedbStore::open(&db_path).unwrap());
    assert_eq!(RedbStore::validate(&db_path).unwrap(), DbState::Valid);
}

#[test]
fn validate_reports_busy_when_database_is_locked() {
    let (_dir, db_path) = temp_db();

    let _lock = RedbStore::open(&db_path).unwrap();
    assert_eq!(RedbStore::validate(&db_path).unwrap(), DbState::Busy);

    let err = RedbStore::open(&db_path).unwrap_err();
    assert!(matches!(err, StorageError::DatabaseAlreadyOpen));
}

#[test]
fn validate_reports_newer_schema_without_quarantine() {
    let (_dir, db_path) = temp_db();

    let db = redb::Database::create(db_path.as_std_path()).unwrap();
    let write_tx = db.begin_write().unwrap();
    {
        let mut meta = write_tx.open_table(META).unwrap();
        let schema_version = (CURRENT_SCHEMA + 1).to_string();
        meta.insert("format", "chronicle-redb").unwrap();
        meta.insert("schema_version", schema_version.as_str()).unwrap();
        meta.insert("created_at", "2020-01-01T00:00:00Z").unwrap();
    }
    write_tx.commit().unwrap();
    drop(db);

    assert_eq!(
        RedbStore::validate(&db_path).unwrap(),
        DbState::NewerSchema {
            found: CURRENT_SCHEMA + 1,
            supported: CURRENT_SCHEMA
        }
    );
    assert!(db_path.exists(), "newer schema should not be quarantined");

    let err = RedbStore::open(&db_path).unwrap_err();
    assert!(matches!(err, StorageError::NewerSchema { .. }));
}

#[test]
fn corrupt_redb_is_quarantined_and_reopen_recreates() {
    let (dir, db_path) = temp_db();

    std::fs::write(&db_path, b"definitely-not-a-redb-database").unwrap();
    assert_eq!(RedbStore::validate(&db_path).unwrap(), DbState::Corrupt);

    assert!(!db_path.exists());
    let quarantines: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("chronicle.redb.corrupt."))
        .collect();
    assert_eq!(quarantines.len(), 1, "expected exactly one quarantine");

    let store = RedbStore::open(&db_path).unwrap();
    assert_eq!(store.path(), Some(db_path.as_path()));
}
