//! Confidence aggregation and the review-status workflow.
//!
//! The score combines extractor self-reports with provenance: more linked
//! reports and more distinct source kinds raise confidence, capped at 0.99.
//! Store backends call [`derive_incident_state`] inside their atomic
//! link-and-recompute step so readers always see a consistent
//! (derived fields, review_status) pair.

use std::collections::BTreeSet;

use crate::types::{ReviewStatus, SourceType};

/// Ceiling for aggregated confidence.
pub const CONFIDENCE_CAP: f64 = 0.99;

/// Per-extra-report bonus, counted up to [`MAX_REPORT_BONUS_STEPS`].
pub const REPORT_BONUS: f64 = 0.05;
pub const MAX_REPORT_BONUS_STEPS: i64 = 3;

/// Per-extra-source-kind bonus, counted up to [`MAX_SOURCE_BONUS_STEPS`].
pub const SOURCE_KIND_BONUS: f64 = 0.10;
pub const MAX_SOURCE_BONUS_STEPS: i64 = 2;

/// Workflow routing thresholds.
pub const AUTO_PUBLISH_THRESHOLD: f64 = 0.9;
pub const UNVERIFIED_THRESHOLD: f64 = 0.6;

/// The derived tuple an incident carries as its only summary of the linked
/// report set.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedState {
    pub report_count: i64,
    pub source_types: Vec<SourceType>,
    pub confidence_score: f64,
}

/// Recompute the derived fields from the current set of linked reports,
/// given each report's (extraction_confidence, source_type).
///
/// Pure function of the linked set; an empty set yields zero confidence.
pub fn derive_incident_state(reports: &[(f64, SourceType)]) -> DerivedState {
    if reports.is_empty() {
        return DerivedState {
            report_count: 0,
            source_types: Vec::new(),
            confidence_score: 0.0,
        };
    }

    let n = reports.len() as i64;
    let avg_ec: f64 = reports.iter().map(|(ec, _)| ec).sum::<f64>() / n as f64;

    // BTreeSet keeps source_types in a stable order across recomputes.
    let kinds: BTreeSet<String> = reports.iter().map(|(_, st)| st.to_string()).collect();
    let n_kinds = kinds.len() as i64;

    let confidence = (avg_ec
        + REPORT_BONUS * (n - 1).min(MAX_REPORT_BONUS_STEPS) as f64
        + SOURCE_KIND_BONUS * (n_kinds - 1).min(MAX_SOURCE_BONUS_STEPS) as f64)
        .min(CONFIDENCE_CAP);

    let source_types = kinds
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    DerivedState {
        report_count: n,
        source_types,
        confidence_score: confidence,
    }
}

/// Status the workflow would assign for a given confidence.
pub fn proposed_status(confidence: f64) -> ReviewStatus {
    if confidence >= AUTO_PUBLISH_THRESHOLD {
        ReviewStatus::AutoPublished
    } else if confidence >= UNVERIFIED_THRESHOLD {
        ReviewStatus::Unverified
    } else {
        ReviewStatus::NeedsReview
    }
}

/// Apply the override rule: an operator decision (approved/rejected) is
/// sticky; anything else moves to the proposed status.
pub fn next_review_status(current: ReviewStatus, confidence: f64) -> ReviewStatus {
    if current.is_operator_decision() {
        current
    } else {
        proposed_status(confidence)
    }
}
