/// Failures of the record store. [`StorageError::kind`] groups them for callers
/// that only need to branch on the category.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("chronicle.redb schema is invalid or corrupt")]
    Corrupt,
    #[error("chronicle.redb is from a newer build (schema_version={found}, supported={supported})")]
    NewerSchema { found: u32, supported: u32 },
    #[error("chronicle.redb is already open in this process")]
    DatabaseAlreadyOpen,
    #[error("write refused: {0}")]
    Conflict(String),
    #[error("invalid key component: {0:?}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("redb error: {0}")]
    Redb(Box<redb::Error>),
    #[error("redb database error: {0}")]
    RedbDatabase(Box<redb::DatabaseError>),
    #[error("redb transaction error: {0}")]
    RedbTransaction(Box<redb::TransactionError>),
    #[error("redb table error: {0}")]
    RedbTable(Box<redb::TableError>),
    #[error("redb storage error: {0}")]
    RedbStorage(Box<redb::StorageError>),
    #[error("redb commit error: {0}")]
    RedbCommit(Box<redb::CommitError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Corrupt,
    NewerSchema,
    Busy,
    Conflict,
    InvalidKey,
    Io,
    Codec,
    Backend,
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::Corrupt => StorageErrorKind::Corrupt,
            StorageError::NewerSchema { .. } => StorageErrorKind::NewerSchema,
            StorageError::DatabaseAlreadyOpen => StorageErrorKind::Busy,
            StorageError::Conflict(_) => StorageErrorKind::Conflict,
            StorageError::InvalidKey(_) => StorageErrorKind::InvalidKey,
            StorageError::Io(_) => StorageErrorKind::Io,
            StorageError::Serde(_) => StorageErrorKind::Codec,
            StorageError::Redb(_)
            | StorageError::RedbDatabase(_)
            | StorageError::RedbTransaction(_)
            | StorageError::RedbTable(_)
            | StorageError::RedbStorage(_)
            | StorageError::RedbCommit(_) => StorageErrorKind::Backend,
        }
    }
}

macro_rules! boxed_backend_error {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for StorageError {
                fn from(value: $source) -> Self {
                    Self::$variant(Box::new(value))
                }
            }
        )*
    };
}

boxed_backend_error! {
    redb::Error => Redb,
    redb::TransactionError => RedbTransaction,
    redb::TableError => RedbTable,
    redb::StorageError => RedbStorage,
    redb::CommitError => RedbCommit,
}

// An already-open file is a busy store, not a backend fault.
impl From<redb::DatabaseError> for StorageError {
    fn from(value: redb::DatabaseError) -> Self {
        match value {
            redb::DatabaseError::DatabaseAlreadyOpen => Self::DatabaseAlreadyOpen,
            other => Self::RedbDatabase(Box::new(other)),
        }
    }
}
