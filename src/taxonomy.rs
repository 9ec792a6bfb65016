use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::status_priority;
use crate::error::KiraError;
use crate::paging::Page;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonRecord {
    pub external_id: i64,
    pub scientific_name: String,
    pub authority: Option<String>,
    pub kingdom: Option<String>,
    pub rank: Option<String>,
    pub taxonomic_status: Option<String>,
    pub valid_external_id: Option<i64>,
    pub is_marine: Option<bool>,
    pub is_extinct: Option<bool>,
}

impl TaxonRecord {
    /// Parses one raw WoRMS `AphiaRecord` object.
    pub fn from_worms(value: &Value) -> Result<Self, KiraError> {
        let external_id = value
            .get("AphiaID")
            .and_then(Value::as_i64)
            .ok_or_else(|| KiraError::Table(format!("record without AphiaID: {value}")))?;
        let scientific_name = text(value, "scientificname").ok_or_else(|| {
            KiraError::Table(format!("record {external_id} has no scientific name"))
        })?;
        Ok(Self {
            external_id,
            scientific_name,
            authority: text(value, "authority"),
            kingdom: text(value, "kingdom"),
            rank: text(value, "rank"),
            taxonomic_status: text(value, "status"),
            valid_external_id: value.get("valid_AphiaID").and_then(Value::as_i64),
            is_marine: flag(value, "isMarine"),
            is_extinct: flag(value, "isExtinct"),
        })
    }

    /// Name string sent to the backbone matcher: scientific name followed by
    /// the authority, when one is known.
    pub fn query_name(&self) -> String {
        match self.authority.as_deref().map(str::trim) {
            Some(authority) if !authority.is_empty() => {
                format!("{} {}", self.scientific_name.trim(), authority)
            }
            _ => self.scientific_name.trim().to_string(),
        }
    }
}

fn text(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn flag(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Shortlist predicates in evaluation order. Evaluation stops at the first
/// rejecting predicate, which is the one charged with the rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxonPredicate {
    Marine,
    NotExtinct,
    Status,
    Kingdom,
    SelfCanonical,
    SpeciesRank,
}

impl TaxonPredicate {
    pub const ORDER: [TaxonPredicate; 6] = [
        TaxonPredicate::Marine,
        TaxonPredicate::NotExtinct,
        TaxonPredicate::Status,
        TaxonPredicate::Kingdom,
        TaxonPredicate::SelfCanonical,
        TaxonPredicate::SpeciesRank,
    ];

    pub fn accepts(self, record: &TaxonRecord, species_ranks: &BTreeSet<String>) -> bool {
        match self {
            TaxonPredicate::Marine => record.is_marine != Some(false),
            TaxonPredicate::NotExtinct => record.is_extinct != Some(true),
            TaxonPredicate::Status => match record.taxonomic_status.as_deref() {
                None => true,
                Some(status) => matches!(
                    status.to_ascii_lowercase().as_str(),
                    "accepted" | "alternate representation"
                ),
            },
            TaxonPredicate::Kingdom => match record.kingdom.as_deref() {
                None => true,
                Some(kingdom) => matches!(kingdom, "Animalia" | "Plantae" | "Protozoa"),
            },
            TaxonPredicate::SelfCanonical => record.valid_external_id == Some(record.external_id),
            TaxonPredicate::SpeciesRank => match record.rank.as_deref() {
                None => true,
                Some(rank) => species_ranks.contains(rank),
            },
        }
    }

    /// First predicate rejecting `record`, if any.
    pub fn first_rejection(
        record: &TaxonRecord,
        species_ranks: &BTreeSet<String>,
    ) -> Option<TaxonPredicate> {
        Self::ORDER
            .into_iter()
            .find(|predicate| !predicate.accepts(record, species_ranks))
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CurationReport {
    pub raw_records: usize,
    pub rejected: BTreeMap<TaxonPredicate, usize>,
    pub duplicates_collapsed: usize,
    pub retained: usize,
}

#[derive(Debug, Clone)]
pub struct Curation {
    pub shortlist: Vec<TaxonRecord>,
    pub report: CurationReport,
}

/// Parses raw pages in offset order into records.
pub fn records_from_pages(pages: &[Page]) -> Result<Vec<TaxonRecord>, KiraError> {
    let mut records = Vec::new();
    for page in pages {
        for value in &page.records {
            let record = TaxonRecord::from_worms(value).map_err(|err| {
                KiraError::Table(format!("page at offset {}: {err}", page.offset))
            })?;
            records.push(record);
        }
    }
    Ok(records)
}

/// Filters raw records down to valid marine species-level taxa and keeps one
/// record per valid id.
///
/// Within a valid-id group the survivor is the minimum under
/// (status priority, scientific name, authority, input position), so the
/// choice does not depend on sort stability.
pub fn curate(records: Vec<TaxonRecord>, species_ranks: &BTreeSet<String>) -> Curation {
    let mut report = CurationReport {
        raw_records: records.len(),
        ..CurationReport::default()
    };

    let mut groups: BTreeMap<i64, Vec<(usize, TaxonRecord)>> = BTreeMap::new();
    for (position, record) in records.into_iter().enumerate() {
        if let Some(predicate) = TaxonPredicate::first_rejection(&record, species_ranks) {
            *report.rejected.entry(predicate).or_default() += 1;
            continue;
        }
        // SelfCanonical guarantees the valid id is present and equal.
        groups
            .entry(record.external_id)
            .or_default()
            .push((position, record));
    }

    let mut shortlist = Vec::with_capacity(groups.len());
    for (valid_id, mut group) in groups {
        if group.len() > 1 {
            debug!(valid_id, members = group.len(), "collapsing duplicate valid id");
            report.duplicates_collapsed += group.len() - 1;
        }
        group.sort_by(|(pos_a, a), (pos_b, b)| {
            status_priority(a.taxonomic_status.as_deref())
                .cmp(&status_priority(b.taxonomic_status.as_deref()))
                .then_with(|| a.scientific_name.cmp(&b.scientific_name))
                .then_with(|| a.authority.cmp(&b.authority))
                .then_with(|| pos_a.cmp(pos_b))
        });
        if let Some((_, keep)) = group.into_iter().next() {
            shortlist.push(keep);
        }
    }
    report.retained = shortlist.len();

    Curation { shortlist, report }
}
