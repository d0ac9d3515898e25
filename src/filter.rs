//! Validation filter.
//!
//! Turns a [`QualityScore`] into a dataset decision. Rejection rules are
//! checked first so that a physically impossible growth claim can never be
//! accepted regardless of the total score.

use tracing::debug;

use crate::models::record::{Classification, QualityScore, ValidationStatus};

/// Decide what happens to one scored caption.
///
/// Rejected: Poor classification, wrong/missing phase mention, or a growth
/// claim outside [0, 100]. Accepted: Excellent or Good with a phase match.
/// Everything else needs another look.
pub fn classify(score: &QualityScore) -> ValidationStatus {
    let impossible_growth = score
        .growth_value
        .map(|v| !(0.0..=100.0).contains(&v))
        .unwrap_or(false);

    if score.classification == Classification::Poor || !score.phase_match || impossible_growth {
        return ValidationStatus::Rejected;
    }

    if matches!(
        score.classification,
        Classification::Excellent | Classification::Good
    ) {
        ValidationStatus::Accepted
    } else {
        ValidationStatus::NeedsReview
    }
}

/// Final disposition for entries still NeedsReview after the regeneration
/// budget is spent.
pub fn resolve_needs_review(include_needs_review: bool) -> ValidationStatus {
    if include_needs_review {
        debug!("keeping needs_review entries per output policy");
        ValidationStatus::NeedsReview
    } else {
        ValidationStatus::Rejected
    }
}
