use chronicle_core::{Fact, Update};
use chronicle_persistence::{RecordStore, StorageError};

#[derive(Debug, thiserror::Error)]
#[error(
    "chunk {} of {total_chunks} failed after {committed_chunks} committed: {source}",
    .committed_chunks + 1
)]
pub struct CommitError {
    pub committed_chunks: usize,
    pub total_chunks: usize,
    #[source]
    pub source: StorageError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub chunks: usize,
    pub updates: usize,
    /// Row writes, counting a supersede twice.
    pub writes: usize,
}

/// Splits an update list into contiguous chunks, one transaction each.
///
/// A failed chunk stops the run; earlier chunks stay committed.
#[derive(Debug, Clone, Copy)]
pub struct BatchCommitter {
    batch_size: usize,
}

impl BatchCommitter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn chunk_count(&self, updates: usize) -> usize {
        updates.div_ceil(self.batch_size)
    }

    pub fn commit(
        &self,
        store: &dyn RecordStore,
        updates: &[Update<Fact>],
    ) -> Result<CommitStats, CommitError> {
        let total_chunks = self.chunk_count(updates.len());
        let mut stats = CommitStats::default();
        for chunk in updates.chunks(self.batch_size) {
            store.apply(chunk).map_err(|source| CommitError {
                committed_chunks: stats.chunks,
                total_chunks,
                source,
            })?;
            stats.chunks += 1;
            stats.updates += chunk.len();
            stats.writes += chunk.iter().map(Update::write_count).sum::<usize>();
        }
        Ok(stats)
    }
}

impl Default for BatchCommitter {
    fn default() -> Self {
        Self::new(chronicle_config::DEFAULT_BATCH_SIZE)
    }
}
