use chronicle_core::{Fact, Target, Tracker};

use crate::StorageError;

pub fn encode_tracker(tracker: &Tracker) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(tracker)?)
}

pub fn decode_tracker(bytes: &[u8]) -> Result<Tracker, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_target(target: &Target) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(target)?)
}

pub fn decode_target(bytes: &[u8]) -> Result<Target, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_fact(fact: &Fact) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(fact)?)
}

pub fn decode_fact(bytes: &[u8]) -> Result<Fact, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}
