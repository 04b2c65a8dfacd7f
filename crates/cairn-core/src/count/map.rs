use std::collections::BTreeMap;

use cairn_types::Digest;

/// In-memory digest -> reference count map for one shard.
///
/// A present entry with count 0 is meaningful: the object exists in the pool
/// but nothing references it, which makes it a reclamation candidate. Callers
/// must distinguish "absent" (`get` returns `None`) from "zero".
///
/// Backed by a `BTreeMap` keyed on the raw digest bytes, so iteration is
/// ordered and stable; the on-disk table relies on that.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountMap {
    entries: BTreeMap<Digest, i64>,
}

impl CountMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries.contains_key(digest)
    }

    pub fn get(&self, digest: &Digest) -> Option<i64> {
        self.entries.get(digest).copied()
    }

    /// Add `delta` to the digest's count; a missing key is defined to `delta`.
    pub fn incr(&mut self, digest: &Digest, delta: i64) {
        match self.entries.get_mut(digest) {
            Some(count) => *count += delta,
            None => {
                self.entries.insert(digest.clone(), delta);
            }
        }
    }

    pub fn set(&mut self, digest: &Digest, count: i64) {
        self.entries.insert(digest.clone(), count);
    }

    pub fn delete(&mut self, digest: &Digest) -> Option<i64> {
        self.entries.remove(digest)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Digest, i64)> {
        self.entries.iter().map(|(d, &c)| (d, c))
    }

    /// Digests only, cloned: for callers that mutate while scanning.
    pub fn digests(&self) -> Vec<Digest> {
        self.entries.keys().cloned().collect()
    }
}

impl FromIterator<(Digest, i64)> for CountMap {
    fn from_iter<T: IntoIterator<Item = (Digest, i64)>>(iter: T) -> Self {
        CountMap {
            entries: iter.into_iter().collect(),
        }
    }
}
