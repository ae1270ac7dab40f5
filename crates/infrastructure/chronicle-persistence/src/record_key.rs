use chronicle_core::{EndpointId, NaturalKey, RecordId, TargetId, Timestamp};

use crate::StorageError;

pub const KEY_SEPARATOR: u8 = 0;
pub const HOLDER_SEPARATOR: u8 = 0x1f;

/// Byte keys for the redb tables. Every variable component is terminated by
/// [`KEY_SEPARATOR`], so a prefix never matches a longer sibling name.
pub struct RecordKey;

impl RecordKey {
    fn push_component(buf: &mut Vec<u8>, value: &str) -> Result<(), StorageError> {
        if value.is_empty() || value.bytes().any(|b| b == KEY_SEPARATOR || b == HOLDER_SEPARATOR) {
            return Err(StorageError::InvalidKey(value.to_string()));
        }
        buf.extend_from_slice(value.as_bytes());
        buf.push(KEY_SEPARATOR);
        Ok(())
    }

    /// `target ␀ endpoint ␀`: unfinished tracker key and history prefix.
    pub fn pair(target: TargetId, endpoint: &EndpointId) -> Result<Vec<u8>, StorageError> {
        let mut key = Vec::with_capacity(32);
        Self::push_component(&mut key, &target.to_string())?;
        Self::push_component(&mut key, endpoint.as_str())?;
        Ok(key)
    }

    pub fn history(
        target: TargetId,
        endpoint: &EndpointId,
        seq: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let mut key = Self::pair(target, endpoint)?;
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key)
    }

    /// `kind ␀ target ␀`: prefix of every version of a kind for one target.
    pub fn records_prefix(kind: &str, target: TargetId) -> Result<Vec<u8>, StorageError> {
        let mut key = Vec::with_capacity(32);
        Self::push_component(&mut key, kind)?;
        Self::push_component(&mut key, &target.to_string())?;
        Ok(key)
    }

    pub fn record(kind: &str, target: TargetId, id: RecordId) -> Result<Vec<u8>, StorageError> {
        let mut key = Self::records_prefix(kind, target)?;
        key.extend_from_slice(&id.0.to_be_bytes());
        Ok(key)
    }

    /// `kind ␀ target ␀ holder ␟ id ␀`: prefix of one natural key's versions.
    pub fn versions_prefix(
        kind: &str,
        target: TargetId,
        natural: &NaturalKey,
    ) -> Result<Vec<u8>, StorageError> {
        let mut key = Self::records_prefix(kind, target)?;
        if let Some(holder) = &natural.holder {
            if holder.bytes().any(|b| b == KEY_SEPARATOR || b == HOLDER_SEPARATOR) {
                return Err(StorageError::InvalidKey(holder.clone()));
            }
            key.extend_from_slice(holder.as_bytes());
        }
        key.push(HOLDER_SEPARATOR);
        Self::push_component(&mut key, &natural.id)?;
        Ok(key)
    }

    pub fn version(
        kind: &str,
        target: TargetId,
        natural: &NaturalKey,
        life_start: Timestamp,
        id: RecordId,
    ) -> Result<Vec<u8>, StorageError> {
        // The id breaks ties between a zero-length version and its successor.
        let mut key = Self::versions_prefix(kind, target, natural)?;
        key.extend_from_slice(&sortable_timestamp(life_start));
        key.extend_from_slice(&id.0.to_be_bytes());
        Ok(key)
    }

    /// Smallest key greater than every key starting with `prefix`.
    pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
        let mut end = prefix.to_vec();
        while let Some(last) = end.pop() {
            if last < u8::MAX {
                end.push(last + 1);
                return end;
            }
        }
        // All 0xff: no finite upper bound; callers never build such prefixes.
        vec![u8::MAX; prefix.len() + 1]
    }
}

/// Big-endian encoding that sorts signed timestamps numerically.
pub fn sortable_timestamp(ts: Timestamp) -> [u8; 8] {
    ((ts as u64) ^ (1 << 63)).to_be_bytes()
}
