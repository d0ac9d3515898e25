//! Caption quality scoring.
//!
//! Pure and deterministic: the same caption, phase label and rule set always
//! produce the same [`QualityScore`]. No IO, no provider calls. Malformed or
//! empty captions are not errors, they just score low and fall out in the
//! validation filter.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::config::ScoringConfig;
use crate::models::record::{Classification, QualityScore};

fn growth_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "Growth: ~10%", "crystal growth progress: 34.5%". A range like
    // "growth 5-15%" must NOT match: the first captured number would not be
    // the one the percent sign belongs to.
    RE.get_or_init(|| {
        Regex::new(r"(?i)growth[^\d%]*?(\d{1,3}(?:\.\d+)?)\s*%").expect("growth regex is valid")
    })
}

/// Extract the first explicit growth percentage from a caption.
pub fn extract_growth(caption: &str) -> Option<f64> {
    growth_regex()
        .captures(caption)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Score one caption against its ground-truth phase label.
pub fn score(caption: &str, phase_label: &str, rules: &ScoringConfig) -> QualityScore {
    let lower = caption.to_lowercase();
    let label = phase_label.to_lowercase();
    let weights = &rules.weights;
    let mut breakdown = std::collections::BTreeMap::new();

    // Phase mention: the label itself or a configured synonym.
    let phase_match = lower.contains(&label)
        || rules
            .synonyms
            .get(&label)
            .map(|syns| syns.iter().any(|s| lower.contains(&s.to_lowercase())))
            .unwrap_or(false);
    breakdown.insert(
        "phase_match".to_string(),
        if phase_match { weights.phase_match } else { 0 },
    );

    // Growth claim inside the expected band (closed interval, endpoints
    // count).
    let growth_value = extract_growth(caption);
    let growth_in_range = match (growth_value, rules.bands.get(&label)) {
        (Some(v), Some(band)) => v >= band[0] && v <= band[1],
        _ => false,
    };
    breakdown.insert(
        "growth_in_range".to_string(),
        if growth_in_range { weights.growth_in_range } else { 0 },
    );

    let has_any = |terms: &[String]| terms.iter().any(|t| lower.contains(&t.to_lowercase()));

    breakdown.insert(
        "visual_description".to_string(),
        if has_any(&rules.visual_terms) { weights.visual_description } else { 0 },
    );
    breakdown.insert(
        "process_stage".to_string(),
        if has_any(&rules.stage_terms) { weights.process_stage } else { 0 },
    );
    breakdown.insert(
        "technical_terms".to_string(),
        if has_any(&rules.technical_terms) { weights.technical_terms } else { 0 },
    );

    let len = caption.chars().count();
    let length_in_range = len >= rules.length_band[0] && len <= rules.length_band[1];
    breakdown.insert(
        "length_in_range".to_string(),
        if length_in_range { weights.length_in_range } else { 0 },
    );

    let contradicted = rules
        .contradictions
        .get(&label)
        .map(|terms| terms.iter().any(|t| lower.contains(&t.to_lowercase())))
        .unwrap_or(false);
    breakdown.insert(
        "no_contradictions".to_string(),
        if contradicted { 0 } else { weights.no_contradictions },
    );

    let total: u32 = breakdown.values().sum();
    let classification = classify_total(total, rules);

    QualityScore {
        phase_match,
        growth_value,
        growth_in_range,
        criteria_breakdown: breakdown,
        total,
        classification,
    }
}

fn classify_total(total: u32, rules: &ScoringConfig) -> Classification {
    let t = &rules.thresholds;
    if total >= t.excellent {
        Classification::Excellent
    } else if total >= t.good {
        Classification::Good
    } else if total >= t.acceptable {
        Classification::Acceptable
    } else {
        Classification::Poor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ScoringConfig {
        ScoringConfig::default()
    }

    #[test]
    fn scoring_is_deterministic() {
        let caption = "LABILE phase: tiny seeds visible across the field. Growth: ~10%. \
                       Stage: nucleation begins as supersaturation peaks in the solution.";
        let a = score(caption, "labile", &rules());
        let b = score(caption, "labile", &rules());
        assert_eq!(a.total, b.total);
        assert_eq!(a.criteria_breakdown, b.criteria_breakdown);
    }

    #[test]
    fn well_formed_caption_scores_at_least_good() {
        let caption = "LABILE phase: tiny seeds visible across the field. Growth: ~10%. \
                       Stage: nucleation begins as supersaturation peaks in the solution.";
        let s = score(caption, "labile", &rules());
        assert!(s.phase_match);
        assert_eq!(s.growth_value, Some(10.0));
        assert!(s.growth_in_range);
        assert!(s.total >= 80, "total was {}", s.total);
        assert!(matches!(
            s.classification,
            Classification::Excellent | Classification::Good
        ));
    }

    #[test]
    fn vague_caption_scores_poor() {
        let s = score("Some crystals are forming", "intermediate", &rules());
        assert!(!s.phase_match);
        assert_eq!(s.growth_value, None);
        assert!(!s.growth_in_range);
        assert_eq!(s.classification, Classification::Poor);
    }

    #[test]
    fn empty_caption_scores_poor_not_error() {
        let s = score("", "labile", &rules());
        assert_eq!(s.classification, Classification::Poor);
        assert!(!s.phase_match);
    }

    #[test]
    fn band_endpoints_are_inclusive() {
        let r = rules();
        let at_low = score("labile sample, growth: 5%", "labile", &r);
        assert!(at_low.growth_in_range);
        let at_high = score("labile sample, growth: 15%", "labile", &r);
        assert!(at_high.growth_in_range);
        let above = score("labile sample, growth: 16%", "labile", &r);
        assert!(!above.growth_in_range);
    }

    #[test]
    fn zero_band_accepts_only_zero() {
        let r = rules();
        assert!(score("unsaturated, growth: 0%", "unsaturated", &r).growth_in_range);
        assert!(!score("unsaturated, growth: 1%", "unsaturated", &r).growth_in_range);
    }

    #[test]
    fn growth_extraction_variants() {
        assert_eq!(extract_growth("Growth: ~10%"), Some(10.0));
        assert_eq!(extract_growth("crystal growth progress: 34.5%"), Some(34.5));
        assert_eq!(extract_growth("GROWTH:7%"), Some(7.0));
        assert_eq!(extract_growth("no percentage here"), None);
        // A band statement is not an estimate.
        assert_eq!(extract_growth("growth between 5-15% expected"), None);
    }

    #[test]
    fn synonym_counts_as_phase_mention() {
        let s = score(
            "Active growth underway, crystals visible, growth: 30%",
            "intermediate",
            &rules(),
        );
        assert!(s.phase_match);
    }

    #[test]
    fn contradiction_zeroes_only_that_criterion() {
        let caption = "Unsaturated solution, clear view, faceted crystals everywhere. Growth: 0%. \
                       Charging stage with saturation still building in the pan mixture.";
        let s = score(caption, "unsaturated", &rules());
        assert_eq!(s.criteria_breakdown["no_contradictions"], 0);
        assert!(s.phase_match);
        assert!(s.growth_in_range);
    }

    #[test]
    fn classification_boundaries() {
        let r = rules();
        assert_eq!(classify_total(90, &r), Classification::Excellent);
        assert_eq!(classify_total(89, &r), Classification::Good);
        assert_eq!(classify_total(80, &r), Classification::Good);
        assert_eq!(classify_total(79, &r), Classification::Acceptable);
        assert_eq!(classify_total(70, &r), Classification::Acceptable);
        assert_eq!(classify_total(69, &r), Classification::Poor);
        assert_eq!(classify_total(0, &r), Classification::Poor);
    }
}
