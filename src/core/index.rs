use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::PathBuf;

use super::identity::CanonicalIdentity;
use super::key::IdentityKey;

/// One discovered location claiming to hold images of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub key: IdentityKey,
    pub identity: CanonicalIdentity,
    pub location: PathBuf,
    pub asset_count: usize,
    pub total_bytes: Option<u64>,
}

impl SourceCandidate {
    pub fn avg_bytes(&self) -> Option<u64> {
        match (self.total_bytes, self.asset_count) {
            (Some(total), count) if count > 0 => Some(total / count as u64),
            _ => None,
        }
    }
}

/// Outcome of best-candidate selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Exactly one winner per key, in key order.
    pub winners: BTreeMap<IdentityKey, SourceCandidate>,
    /// Candidates that lost to a winner with more assets (or an earlier tie).
    pub superseded: Vec<SourceCandidate>,
    /// Candidates with no eligible images; never winners.
    pub empty: Vec<SourceCandidate>,
}

impl Selection {
    pub fn winner(&self, key: &IdentityKey) -> Option<&SourceCandidate> {
        self.winners.get(key)
    }

    pub fn len(&self) -> usize {
        self.winners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.winners.is_empty()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&IdentityKey) -> bool) {
        self.winners.retain(|key, _| keep(key));
    }
}

/// Groups candidates by key and keeps the best source per key.
pub struct SourceIndex;

impl SourceIndex {
    /// Picks the candidate with the strictly greatest `asset_count` for each key.
    ///
    /// Ties go to whichever candidate came first, so the result depends on
    /// input order; callers pass candidates in lexicographic location order
    /// (see [`SourceIndex::select_sorted`]).
    pub fn select(candidates: impl IntoIterator<Item = SourceCandidate>) -> Selection {
        let mut selection = Selection::default();

        for candidate in candidates {
            if candidate.asset_count == 0 {
                selection.empty.push(candidate);
                continue;
            }

            match selection.winners.entry(candidate.key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
                Entry::Occupied(mut slot) => {
                    if candidate.asset_count > slot.get().asset_count {
                        let loser = slot.insert(candidate);
                        selection.superseded.push(loser);
                    } else {
                        selection.superseded.push(candidate);
                    }
                }
            }
        }

        selection
    }

    /// [`SourceIndex::select`] after ordering candidates by location.
    pub fn select_sorted(mut candidates: Vec<SourceCandidate>) -> Selection {
        candidates.sort_by(|a, b| a.location.cmp(&b.location));
        Self::select(candidates)
    }
}
