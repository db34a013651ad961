//! Catalog-to-archive reconciliation.
//!
//! Exact key equality is the baseline. Near matches are only suggested when a
//! similarity cutoff is configured, and never count as ready.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::catalog::{CatalogSheet, RowDefect};
use super::identity::{IdentityNormalizer, RawIdentity};
use super::index::Selection;
use super::key::{IdentityKey, KeyBuilder};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchStatus {
    Ready {
        location: PathBuf,
        asset_count: usize,
    },
    NearMatch {
        suggested: IdentityKey,
        similarity: f64,
        location: PathBuf,
    },
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileEntry {
    pub row_number: usize,
    pub raw: RawIdentity,
    pub key: IdentityKey,
    /// The row normalized to a sentinel name or size and needs fixing at the source.
    pub sentinel: bool,
    #[serde(flatten)]
    pub status: MatchStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub entries: Vec<ReconcileEntry>,
    /// Keys requested by more than one catalog row, with those rows.
    pub duplicate_rows: BTreeMap<IdentityKey, Vec<usize>>,
    /// Archive keys no catalog row asks for.
    pub archive_only: Vec<IdentityKey>,
    pub defects: Vec<RowDefect>,
}

impl ReconcileReport {
    pub fn ready_count(&self) -> usize {
        self.count(|status| matches!(status, MatchStatus::Ready { .. }))
    }

    pub fn near_match_count(&self) -> usize {
        self.count(|status| matches!(status, MatchStatus::NearMatch { .. }))
    }

    pub fn missing_count(&self) -> usize {
        self.count(|status| matches!(status, MatchStatus::Missing))
    }

    /// Keys with an exact archive match.
    pub fn ready_keys(&self) -> BTreeSet<IdentityKey> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.status, MatchStatus::Ready { .. }))
            .map(|entry| entry.key.clone())
            .collect()
    }

    fn count(&self, predicate: impl Fn(&MatchStatus) -> bool) -> usize {
        self.entries.iter().filter(|entry| predicate(&entry.status)).count()
    }
}

pub struct Reconciler<'a> {
    normalizer: &'a IdentityNormalizer,
    fuzzy_cutoff: Option<f64>,
}

impl<'a> Reconciler<'a> {
    pub fn new(normalizer: &'a IdentityNormalizer, fuzzy_cutoff: Option<f64>) -> Self {
        Self {
            normalizer,
            fuzzy_cutoff,
        }
    }

    pub fn reconcile(&self, sheet: &CatalogSheet, selection: &Selection) -> ReconcileReport {
        let mut report = ReconcileReport {
            defects: sheet.defects.clone(),
            ..Default::default()
        };
        let mut rows_by_key: BTreeMap<IdentityKey, Vec<usize>> = BTreeMap::new();

        for row in &sheet.rows {
            let identity = self.normalizer.normalize(&row.raw);
            let key = KeyBuilder::build(&identity);
            rows_by_key.entry(key.clone()).or_default().push(row.row_number);

            let status = match selection.winner(&key) {
                Some(winner) => MatchStatus::Ready {
                    location: winner.location.clone(),
                    asset_count: winner.asset_count,
                },
                None => self
                    .fuzzy_cutoff
                    .and_then(|cutoff| best_near_match(&key, selection.winners.keys(), cutoff))
                    .and_then(|(suggested, similarity)| {
                        let location = selection.winner(&suggested)?.location.clone();
                        Some(MatchStatus::NearMatch {
                            suggested,
                            similarity,
                            location,
                        })
                    })
                    .unwrap_or(MatchStatus::Missing),
            };

            if identity.has_sentinel() {
                tracing::warn!("Catalog row {} normalizes to sentinel key {}", row.row_number, key);
            }

            report.entries.push(ReconcileEntry {
                row_number: row.row_number,
                raw: row.raw.clone(),
                key,
                sentinel: identity.has_sentinel(),
                status,
            });
        }

        report.archive_only = selection
            .winners
            .keys()
            .filter(|key| !rows_by_key.contains_key(*key))
            .cloned()
            .collect();
        report.duplicate_rows = rows_by_key
            .into_iter()
            .filter(|(_, rows)| rows.len() > 1)
            .collect();

        tracing::info!(
            "Reconciled {} rows: {} ready, {} near, {} missing",
            report.entries.len(),
            report.ready_count(),
            report.near_match_count(),
            report.missing_count()
        );
        report
    }
}

/// Most similar candidate key at or above `cutoff`; earlier candidates win ties.
pub fn best_near_match<'k>(
    key: &IdentityKey,
    candidates: impl IntoIterator<Item = &'k IdentityKey>,
    cutoff: f64,
) -> Option<(IdentityKey, f64)> {
    let mut best: Option<(&IdentityKey, f64)> = None;
    for candidate in candidates {
        let similarity = strsim::normalized_levenshtein(key.as_str(), candidate.as_str());
        if similarity < cutoff {
            continue;
        }
        if best.is_none_or(|(_, score)| similarity > score) {
            best = Some((candidate, similarity));
        }
    }
    best.map(|(candidate, similarity)| (candidate.clone(), similarity))
}
