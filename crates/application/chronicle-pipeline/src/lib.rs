pub mod adapter;
pub mod scheduler;
pub mod sync;
pub mod tracker;

// Re-export core engine components
pub use adapter::{EndpointAdapter, JsonEndpointAdapter, ProcessContext, ProcessingError};
pub use scheduler::{AdapterRegistry, RunSummary, Scheduler};
pub use sync::{
    BatchCommitter, Clock, CommitError, CommitStats, SyncEngine, SyncError, SyncOptions,
    SyncOutcome, SystemClock,
};
pub use tracker::TrackerManager;

// Re-export fetch types adapters deal in
pub use chronicle_infra::{ErrorInfo, FetchError, Fetched, RawData};
