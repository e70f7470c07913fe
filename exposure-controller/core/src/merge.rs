//! Partial ownership of a shared collection.
//!
//! Many contributors write disjoint slices of one collection (the ports of a
//! NetworkPolicy, of a LoadBalancer Service, the entries of a forwarding
//! table). Each contributor only ever removes what it previously owned and
//! never touches entries claimed by someone else.

use ahash::AHashSet as HashSet;
use std::{fmt, hash::Hash};

/// An element of a shared collection.
pub trait Entry: Clone + PartialEq {
    /// Two entries with the same id cannot both be materialized.
    type Id: Clone + Eq + Hash + fmt::Debug;

    fn id(&self) -> Self::Id;
}

/// The result of merging one contributor's entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Merged<E> {
    /// The new content of the shared collection.
    pub entries: Vec<E>,

    /// The desired entries that are now materialized on behalf of the
    /// contributor.
    pub owned: Vec<E>,

    /// Desired entries that were skipped because another contributor already
    /// materialized a different entry with the same id.
    pub collisions: Vec<E>,
}

/// What has to be written to converge a shared resource.
#[derive(Clone, Debug, PartialEq)]
pub enum Change<T> {
    Unchanged,
    Create(T),
    Replace(T),
    Delete,
}

/// Merges `desired` into `current`.
///
/// `prior` holds the entries the contributor owned before; ids in `claimed`
/// belong to other contributors (or to no known contributor) and are never
/// removed or overwritten.
pub fn merge<E: Entry>(
    current: &[E],
    prior: &[E],
    desired: &[E],
    claimed: &HashSet<E::Id>,
) -> Merged<E> {
    let desired = dedup(desired);
    let desired_ids = desired.iter().map(Entry::id).collect::<HashSet<_>>();
    let stale = prior
        .iter()
        .map(Entry::id)
        .filter(|id| !desired_ids.contains(id) && !claimed.contains(id))
        .collect::<HashSet<_>>();

    let mut entries = current
        .iter()
        .filter(|e| !stale.contains(&e.id()))
        .cloned()
        .collect::<Vec<_>>();

    let mut owned = Vec::with_capacity(desired.len());
    let mut collisions = Vec::new();
    for entry in desired {
        let id = entry.id();
        let existing = entries.iter().position(|e| e.id() == id);
        if claimed.contains(&id) {
            match existing {
                // Another contributor materialized the very same entry.
                Some(i) if entries[i] == entry => owned.push(entry),
                Some(_) => collisions.push(entry),
                // Claimed but not materialized: the claim is stale.
                None => {
                    entries.push(entry.clone());
                    owned.push(entry);
                }
            }
            continue;
        }

        match existing {
            Some(i) => entries[i] = entry.clone(),
            None => entries.push(entry.clone()),
        }
        owned.push(entry);
    }

    Merged {
        entries,
        owned,
        collisions,
    }
}

/// Keeps the last of several entries with the same id.
fn dedup<E: Entry>(entries: &[E]) -> Vec<E> {
    let mut out: Vec<E> = Vec::with_capacity(entries.len());
    for entry in entries {
        match out.iter_mut().find(|e| e.id() == entry.id()) {
            Some(e) => *e = entry.clone(),
            None => out.push(entry.clone()),
        }
    }
    out
}

impl<T> Change<T> {
    /// Builds the change that turns `current` into `desired`.
    pub fn between(current: Option<&T>, desired: Option<T>) -> Self
    where
        T: PartialEq,
    {
        match (current, desired) {
            (None, None) => Self::Unchanged,
            (None, Some(desired)) => Self::Create(desired),
            (Some(_), None) => Self::Delete,
            (Some(current), Some(desired)) if *current == desired => Self::Unchanged,
            (Some(_), Some(desired)) => Self::Replace(desired),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Clone, Debug, PartialEq)]
    struct Fwd(u16, &'static str);

    impl Entry for Fwd {
        type Id = u16;
        fn id(&self) -> u16 {
            self.0
        }
    }

    fn claimed(ids: &[u16]) -> HashSet<u16> {
        ids.iter().copied().collect()
    }

    #[test]
    fn adds_into_empty() {
        let merged = merge(&[], &[], &[Fwd(22, "a"), Fwd(80, "a")], &claimed(&[]));
        assert_eq!(merged.entries, vec![Fwd(22, "a"), Fwd(80, "a")]);
        assert_eq!(merged.owned, merged.entries);
        assert!(merged.collisions.is_empty());
    }

    #[test]
    fn removes_only_prior_entries() {
        let current = [Fwd(22, "a"), Fwd(80, "b"), Fwd(443, "legacy")];
        let merged = merge(&current, &[Fwd(22, "a")], &[], &claimed(&[80, 443]));
        assert_eq!(merged.entries, vec![Fwd(80, "b"), Fwd(443, "legacy")]);
        assert!(merged.owned.is_empty());
    }

    #[test]
    fn replaces_updated_entries_in_place() {
        let current = [Fwd(22, "a1"), Fwd(80, "b")];
        let merged = merge(&current, &[Fwd(22, "a1")], &[Fwd(22, "a2")], &claimed(&[80]));
        assert_eq!(merged.entries, vec![Fwd(22, "a2"), Fwd(80, "b")]);
    }

    #[test]
    fn skips_collisions() {
        let current = [Fwd(22, "b")];
        let merged = merge(&current, &[], &[Fwd(22, "a"), Fwd(23, "a")], &claimed(&[22]));
        assert_eq!(merged.entries, vec![Fwd(22, "b"), Fwd(23, "a")]);
        assert_eq!(merged.owned, vec![Fwd(23, "a")]);
        assert_eq!(merged.collisions, vec![Fwd(22, "a")]);
    }

    #[test]
    fn identical_claims_are_shared() {
        let current = [Fwd(22, "same")];
        let merged = merge(&current, &[], &[Fwd(22, "same")], &claimed(&[22]));
        assert_eq!(merged.entries, vec![Fwd(22, "same")]);
        assert_eq!(merged.owned, vec![Fwd(22, "same")]);

        // Removing the shared entry keeps it for the other owner.
        let merged = merge(&current, &[Fwd(22, "same")], &[], &claimed(&[22]));
        assert_eq!(merged.entries, vec![Fwd(22, "same")]);
    }

    #[test]
    fn ownership_isolation() {
        let a = [Fwd(22, "a")];
        let b = [Fwd(80, "b")];

        let after_a = merge(&[], &[], &a, &claimed(&[])).entries;
        let after_b = merge(&after_a, &[], &b, &claimed(&[22])).entries;
        let after_remove = merge(&after_b, &a, &[], &claimed(&[80])).entries;
        assert_eq!(after_remove, b.to_vec());
    }

    #[test]
    fn change_between() {
        assert_eq!(Change::<u8>::between(None, None), Change::Unchanged);
        assert_eq!(Change::between(None, Some(1)), Change::Create(1));
        assert_eq!(Change::between(Some(&1), Some(1)), Change::Unchanged);
        assert_eq!(Change::between(Some(&1), Some(2)), Change::Replace(2));
        assert_eq!(Change::<u8>::between(Some(&1), None), Change::Delete);
    }
}
