//! The Ranking parser (§4.6): extracts an ordered label list, per-response
//! quality ratings, and per-criterion rubric scores from a Stage-2
//! evaluator's free-form text.
//!
//! Regex patterns are ported verbatim from
//! `original_source/backend/council/ranking.py`.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref FINAL_RANKING_RE: Regex =
        Regex::new(r"(?is)FINAL RANKING[:\s]*(.+)").expect("valid regex");
    static ref RANKING_LINE_RE: Regex =
        Regex::new(r"(?im)(?:^|\n)\s*\d+\.\s*(?:Response\s+)?([A-Z])").expect("valid regex");
    static ref QUALITY_RATING_RE: Regex =
        Regex::new(r"(?i)(?:Response\s+)?([A-Z])\s*[:\(]\s*(\d+(?:\.\d+)?)\s*/\s*(?:5|10)")
            .expect("valid regex");
}

/// A parsed response label, `"Response A"` style, matching the reference
/// implementation's string keys so downstream maps are directly comparable.
pub type Label = String;

/// Result of parsing one evaluator's free-form ranking text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRanking {
    /// Ordered, deduplicated labels extracted from the "FINAL RANKING"
    /// section (or the whole text if that marker is absent).
    pub order: Vec<Label>,
    /// `label -> score` on a `[0, 5]` scale.
    pub quality_ratings: HashMap<Label, f64>,
    /// `label -> {criterion -> score}` on a `[1, 10]` scale.
    pub rubric_scores: HashMap<Label, HashMap<String, f64>>,
}

fn format_label(letter: &str) -> Label {
    format!("Response {}", letter.to_uppercase())
}

/// Parse the ordered label list from `text` (§4.6 "Parsed ranking").
pub fn parse_ranking_from_text(text: &str) -> Vec<Label> {
    let search_text: &str = match FINAL_RANKING_RE.captures(text) {
        Some(caps) => {
            return extract_ordered_labels(caps.get(1).map(|m| m.as_str()).unwrap_or(""));
        }
        None => text,
    };
    extract_ordered_labels(search_text)
}

fn extract_ordered_labels(text: &str) -> Vec<Label> {
    let mut labels = Vec::new();
    for caps in RANKING_LINE_RE.captures_iter(text) {
        let label = format_label(&caps[1]);
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}

/// Parse per-response quality ratings, normalized to `[0, 5]` (§4.6
/// "Quality ratings").
pub fn extract_quality_ratings(text: &str) -> HashMap<Label, f64> {
    let mut ratings = HashMap::new();
    for caps in QUALITY_RATING_RE.captures_iter(text) {
        let label = format_label(&caps[1]);
        let mut score: f64 = caps[2].parse().unwrap_or(0.0);
        if score > 5.0 {
            score /= 2.0;
        }
        ratings.insert(label, score);
    }
    ratings
}

/// Parse per-criterion rubric scores for each criterion name in `rubric_criteria`
/// (§4.6 "Rubric scores").
pub fn extract_rubric_scores(
    text: &str,
    rubric_criteria: &[String],
) -> HashMap<Label, HashMap<String, f64>> {
    let mut scores: HashMap<Label, HashMap<String, f64>> = HashMap::new();
    for criterion in rubric_criteria {
        let pattern = format!(
            r"(?i){}\s*[:\-]\s*(?:Response\s+)?([A-Z])\s*[:\(]\s*(\d+(?:\.\d+)?)",
            regex::escape(criterion)
        );
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(_) => continue,
        };
        for caps in re.captures_iter(text) {
            let label = format_label(&caps[1]);
            let score: f64 = caps[2].parse().unwrap_or(0.0);
            scores.entry(label).or_default().insert(criterion.clone(), score);
        }
    }
    scores
}

/// Parse all three facets of an evaluator's text in one pass.
pub fn parse(text: &str, rubric_criteria: &[String]) -> ParsedRanking {
    ParsedRanking {
        order: parse_ranking_from_text(text),
        quality_ratings: extract_quality_ratings(text),
        rubric_scores: extract_rubric_scores(text, rubric_criteria),
    }
}
