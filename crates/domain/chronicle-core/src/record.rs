//! Bitemporal record model.
//!
//! A version is a fact about a target valid over `[life.start, life.end)`.
//! Versions are never edited in place: [`setup`] opens the first version of a
//! key and [`evolve`] closes the live version, optionally opening a successor at
//! the same instant. Applying only these two shapes keeps the intervals of a
//! natural key contiguous and non-overlapping.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Lifetime, TargetId, Timestamp};

/// Observed mutable attributes of a [`Fact`], ordered by name.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// A record type with a stable natural key and a validity interval.
pub trait Versioned: Clone {
    type Key: Ord + Clone + fmt::Debug;

    fn natural_key(&self) -> Self::Key;

    /// True iff the mutable attributes match. Key and interval are ignored.
    fn equivalent(&self, other: &Self) -> bool;

    fn life(&self) -> Lifetime;

    fn set_life(&mut self, life: Lifetime);
}

/// One change to the versioned store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Update<R> {
    /// First version of a key, open from its `life.start`.
    Insert(R),
    /// The live version closed at its `life.end`, with no successor.
    Retire(R),
    /// The live version closed and its successor opened at the same instant.
    Supersede { retired: R, successor: R },
}

impl<R> Update<R> {
    /// Number of row writes this update costs.
    pub fn write_count(&self) -> usize {
        match self {
            Update::Insert(_) | Update::Retire(_) => 1,
            Update::Supersede { .. } => 2,
        }
    }

    /// The version left open by this update, if any.
    pub fn opened(&self) -> Option<&R> {
        match self {
            Update::Insert(r) => Some(r),
            Update::Supersede { successor, .. } => Some(successor),
            Update::Retire(_) => None,
        }
    }

    /// The version closed by this update, if any.
    pub fn closed(&self) -> Option<&R> {
        match self {
            Update::Retire(r) => Some(r),
            Update::Supersede { retired, .. } => Some(retired),
            Update::Insert(_) => None,
        }
    }
}

/// Opens the first version of a key at `at`.
pub fn setup<R: Versioned>(mut record: R, at: Timestamp) -> Update<R> {
    record.set_life(Lifetime::open_at(at));
    Update::Insert(record)
}

/// Closes `existing` at `at`; opens `next` at `at` when given.
pub fn evolve<R: Versioned>(mut existing: R, next: Option<R>, at: Timestamp) -> Update<R> {
    existing.set_life(existing.life().closed_at(at));
    match next {
        Some(mut successor) => {
            debug_assert!(successor.natural_key() == existing.natural_key());
            successor.set_life(Lifetime::open_at(at));
            Update::Supersede {
                retired: existing,
                successor,
            }
        }
        None => Update::Retire(existing),
    }
}

/// Store-assigned internal id, monotonic per store. Used as the pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Business identity of a fact. `holder` carries the enclosing container's id
/// for facts observed inside a hierarchical snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    pub id: String,
}

impl NaturalKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            holder: None,
            id: id.into(),
        }
    }

    pub fn held_by(holder: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            holder: Some(holder.into()),
            id: id.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.holder {
            Some(holder) => write!(f, "{holder}/{}", self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// The generic persisted record: one version of one observed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Record type; one logical table per kind.
    pub kind: String,
    pub target: TargetId,
    pub key: NaturalKey,
    pub attributes: Attributes,
    pub life: Lifetime,
}

impl Fact {
    /// A freshly observed fact. Its interval is assigned by [`setup`] or [`evolve`].
    pub fn observed(
        kind: impl Into<String>,
        target: TargetId,
        key: NaturalKey,
        attributes: Attributes,
    ) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            target,
            key,
            attributes,
            life: Lifetime::open_at(0),
        }
    }
}

impl Versioned for Fact {
    type Key = NaturalKey;

    fn natural_key(&self) -> NaturalKey {
        self.key.clone()
    }

    fn equivalent(&self, other: &Self) -> bool {
        self.attributes == other.attributes
    }

    fn life(&self) -> Lifetime {
        self.life
    }

    fn set_life(&mut self, life: Lifetime) {
        self.life = life;
    }
}
