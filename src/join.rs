use crate::types::{AttributeRecord, GeoFeature};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Outcome counts of a join pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinSummary {
    pub matched_features: usize,
    pub unmatched_features: usize,
    pub unused_records: usize,
}

/// Parses a table cell to a number. Blank or non-numeric cells become NaN.
pub fn parse_value(raw: &str) -> f64 {
    raw.trim().parse::<f64>().unwrap_or(f64::NAN)
}

/// Copies `fields` from each record onto every feature with the same identifier.
///
/// Records are indexed by identifier once, so a later record with a repeated
/// identifier replaces an earlier one. Every feature sharing an identifier
/// receives the values. Features without a match are left untouched, and a
/// matched record missing one of the fields contributes NaN for it.
pub fn join_attributes(
    records: &[AttributeRecord],
    features: &mut [GeoFeature],
    fields: &[String],
) -> JoinSummary {
    let lookup: HashMap<&str, &AttributeRecord> =
        records.iter().map(|r| (r.id.as_str(), r)).collect();

    let matched_ids: Vec<Option<&str>> = features
        .par_iter_mut()
        .map(|feature| {
            let record = feature.id.as_deref().and_then(|id| lookup.get(id).copied())?;
            for field in fields {
                let value = record
                    .fields
                    .get(field)
                    .map_or(f64::NAN, |raw| parse_value(raw));
                feature.attributes.insert(field.clone(), value);
            }
            Some(record.id.as_str())
        })
        .collect();

    let used: HashSet<&str> = matched_ids.iter().flatten().copied().collect();
    let matched_features = matched_ids.iter().filter(|m| m.is_some()).count();
    let summary = JoinSummary {
        matched_features,
        unmatched_features: features.len() - matched_features,
        unused_records: lookup.len() - used.len(),
    };

    info!(
        matched = summary.matched_features,
        unmatched = summary.unmatched_features,
        unused_records = summary.unused_records,
        "Joined attribute table onto features"
    );
    if summary.unmatched_features > 0 {
        warn!(
            "{} features have no attribute record and will render as no data",
            summary.unmatched_features
        );
    }

    summary
}
