use std::collections::{BTreeMap, BTreeSet};

use crate::record::{evolve, setup, Update, Versioned};
use crate::Timestamp;

/// Diff a fresh snapshot against the live versions of one target at `at`.
///
/// `candidates` must already be in walk order (see [`crate::Snapshot::flatten`]).
/// The result, once applied, makes the store agree with the snapshot at `at`:
/// new keys are inserted, changed keys superseded, unchanged keys left alone and
/// keys missing from the snapshot retired.
///
/// Duplicate keys within one snapshot are not merged: each occurrence is
/// compared against the live version independently.
pub fn reconcile<R, L, C>(live: L, candidates: C, at: Timestamp) -> Vec<Update<R>>
where
    R: Versioned,
    L: IntoIterator<Item = R>,
    C: IntoIterator<Item = R>,
{
    let live_set: BTreeMap<R::Key, R> = live
        .into_iter()
        .map(|r| (r.natural_key(), r))
        .collect();
    let mut unseen: BTreeSet<R::Key> = live_set.keys().cloned().collect();
    let mut updates = Vec::new();

    for candidate in candidates {
        let key = candidate.natural_key();
        match live_set.get(&key) {
            Some(existing) => {
                if !existing.equivalent(&candidate) {
                    updates.push(evolve(existing.clone(), Some(candidate), at));
                }
                unseen.remove(&key);
            }
            None => updates.push(setup(candidate, at)),
        }
    }

    // Whatever was live but not observed disappeared upstream.
    let mut live_set = live_set;
    for key in unseen {
        if let Some(existing) = live_set.remove(&key) {
            updates.push(evolve(existing, None, at));
        }
    }

    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Attributes, Fact, NaturalKey};
    use crate::{Lifetime, TargetId};
    use serde_json::json;

    fn fact(id: &str, v: i64, start: i64) -> Fact {
        let mut attrs = Attributes::new();
        attrs.insert("v".into(), json!(v));
        let mut f = Fact::observed("k", TargetId::Reference, NaturalKey::new(id), attrs);
        f.life = Lifetime::open_at(start);
        f
    }

    #[test]
    fn empty_inputs_produce_no_updates() {
        let updates: Vec<Update<Fact>> = reconcile(Vec::new(), Vec::new(), 10);
        assert!(updates.is_empty());
    }

    #[test]
    fn retirements_follow_the_walk() {
        let live = vec![fact("b", 1, 0), fact("a", 1, 0)];
        let snapshot = vec![fact("c", 1, 0)];
        let updates = reconcile(live, snapshot, 10);
        assert!(matches!(updates[0], Update::Insert(_)));
        let retired: Vec<&str> = updates[1..]
            .iter()
            .map(|u| u.closed().unwrap().key.id.as_str())
            .collect();
        assert_eq!(retired, vec!["a", "b"]);
    }
}
