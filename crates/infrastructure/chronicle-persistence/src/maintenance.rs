use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;

use crate::api::CHRONICLE_REDB_FILENAME;

static QUARANTINED: AtomicU64 = AtomicU64::new(0);

/// Where a quarantined copy of `path` goes: `<name>.corrupt.<utc>.<pid>.<n>`.
fn quarantine_path(path: &Utf8Path) -> Utf8PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let seq = QUARANTINED.fetch_add(1, Ordering::Relaxed);
    let name = path.file_name().unwrap_or(CHRONICLE_REDB_FILENAME);
    path.with_file_name(format!("{name}.corrupt.{stamp}.{}.{seq}", std::process::id()))
}

/// Renames an unreadable store aside so the next open starts empty.
/// Returns where it went, or `None` when there was nothing to move.
pub fn quarantine_corrupt_file(path: &Utf8Path) -> std::io::Result<Option<Utf8PathBuf>> {
    if !path.is_file() {
        return Ok(None);
    }
    let target = quarantine_path(path);
    std::fs::rename(path, &target)?;
    tracing::warn!(from = %path, to = %target, "quarantined unreadable record store");
    Ok(Some(target))
}
