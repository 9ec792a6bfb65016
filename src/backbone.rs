use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::KiraError;
use crate::gbif::NameMatchClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchType {
    Exact,
    Fuzzy,
    HigherRank,
    Variant,
    None,
    #[serde(other)]
    Other,
}

impl MatchType {
    pub fn is_rejected(self) -> bool {
        matches!(self, MatchType::HigherRank | MatchType::None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneMatch {
    pub query_index: usize,
    pub candidate_key: Option<i64>,
    pub scientific_name: Option<String>,
    pub match_type: MatchType,
    pub taxonomic_status: Option<String>,
    pub rank: Option<String>,
    pub confidence: i64,
    pub is_synonym: bool,
}

impl BackboneMatch {
    /// Confidence with a one-point penalty for synonym and doubtful names,
    /// so an accepted name wins a tie of raw confidence.
    pub fn adjusted_confidence(&self) -> i64 {
        let doubtful = self
            .taxonomic_status
            .as_deref()
            .is_some_and(|status| {
                let status = status.trim().to_ascii_uppercase();
                status == "DOUBTFUL" || status.ends_with("SYNONYM")
            });
        if self.is_synonym || doubtful {
            self.confidence - 1
        } else {
            self.confidence
        }
    }

    pub fn is_acceptable(&self) -> bool {
        !self.match_type.is_rejected()
            && self.candidate_key.is_some()
            && self.rank.as_deref() == Some("SPECIES")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub start: usize,
    pub len: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub matches: Vec<BackboneMatch>,
    pub raw_rows: usize,
    /// Queries from successful chunks with no acceptable match.
    pub unmatched: Vec<usize>,
    pub chunk_failures: Vec<ChunkFailure>,
}

impl Reconciliation {
    pub fn taxon_keys(&self) -> BTreeSet<i64> {
        taxon_key_universe(&self.matches)
    }
}

/// Keeps, per query index, every acceptable match tied at the highest
/// adjusted confidence. Queries without an acceptable match contribute no
/// rows.
pub fn select_best(rows: Vec<BackboneMatch>) -> Vec<BackboneMatch> {
    let mut by_query: BTreeMap<usize, Vec<BackboneMatch>> = BTreeMap::new();
    for row in rows.into_iter().filter(BackboneMatch::is_acceptable) {
        by_query.entry(row.query_index).or_default().push(row);
    }
    let mut retained = Vec::new();
    for (_, candidates) in by_query {
        let Some(best) = candidates.iter().map(BackboneMatch::adjusted_confidence).max() else {
            continue;
        };
        retained.extend(
            candidates
                .into_iter()
                .filter(|candidate| candidate.adjusted_confidence() == best),
        );
    }
    retained
}

/// Distinct candidate keys of retained matches; ties that point at the same
/// backbone taxon collapse here.
pub fn taxon_key_universe(matches: &[BackboneMatch]) -> BTreeSet<i64> {
    matches
        .iter()
        .filter_map(|row| row.candidate_key)
        .collect()
}

pub struct BackboneMatcher<'a, C: NameMatchClient + ?Sized> {
    client: &'a C,
    chunk_size: usize,
}

impl<'a, C: NameMatchClient + ?Sized> BackboneMatcher<'a, C> {
    pub fn new(client: &'a C, chunk_size: usize) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Matches `names` chunk by chunk. A failing chunk is recorded in
    /// `chunk_failures` and contributes nothing; other chunks proceed.
    pub fn reconcile(&self, names: &[String]) -> Reconciliation {
        let mut raw_rows = 0usize;
        let mut retained = Vec::new();
        let mut unmatched = Vec::new();
        let mut chunk_failures = Vec::new();

        for (chunk_number, chunk) in names.chunks(self.chunk_size).enumerate() {
            let start = chunk_number * self.chunk_size;
            match self.match_chunk(start, chunk) {
                Ok(rows) => {
                    raw_rows += rows.len();
                    let best = select_best(rows);
                    let matched = best.iter().map(|row| row.query_index).collect::<BTreeSet<_>>();
                    unmatched.extend((start..start + chunk.len()).filter(|idx| !matched.contains(idx)));
                    info!(start, names = chunk.len(), retained = best.len(), "backbone chunk matched");
                    retained.extend(best);
                }
                Err(err) => {
                    warn!(start, names = chunk.len(), error = %err, "backbone chunk failed");
                    chunk_failures.push(ChunkFailure {
                        start,
                        len: chunk.len(),
                        message: err.to_string(),
                    });
                }
            }
        }

        Reconciliation {
            matches: retained,
            raw_rows,
            unmatched,
            chunk_failures,
        }
    }

    fn match_chunk(&self, start: usize, chunk: &[String]) -> Result<Vec<BackboneMatch>, KiraError> {
        let rows = self
            .client
            .match_names(chunk)
            .map_err(|err| KiraError::ChunkFailed {
                start,
                message: err.to_string(),
            })?;
        rows.into_iter()
            .map(|mut row| {
                if row.query_index >= chunk.len() {
                    return Err(KiraError::ChunkFailed {
                        start,
                        message: format!(
                            "service returned index {} for a chunk of {}",
                            row.query_index,
                            chunk.len()
                        ),
                    });
                }
                row.query_index += start;
                Ok(row)
            })
            .collect()
    }
}
