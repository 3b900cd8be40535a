//! Aggregation of Stage-2 rankings into a winner, a conflict list, and
//! minority-opinion flags (§4.7).
//!
//! Grounded in `original_source/backend/analysis.py`: Borda-count scoring
//! (`calculate_weighted_rankings`), `detect_ranking_conflicts`, and
//! `detect_minority_opinions`. Rubric weights are carried on
//! [`crate::council::RubricCriterion`] but not consumed here: scoring is
//! unweighted Borda count (§9 open question, resolved).

use std::collections::HashMap;

use crate::ranking::{Label, ParsedRanking};

/// One evaluator's parsed ranking, tagged with the evaluator and the
/// backend it ran on (its own Stage-1 response may itself be one of the
/// labels, which is what mutual-opposition detection keys on).
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub evaluator_id: String,
    pub backend_id: String,
    pub ranking: ParsedRanking,
}

/// Severity of a detected conflict, carried through to the analysis
/// summary shown to Stage-3 and the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A detected disagreement in how evaluators ranked one or two responses.
#[derive(Debug, Clone, PartialEq)]
pub enum Conflict {
    /// A single label's rank position spreads widely across evaluators.
    RankingSpread { label: Label, min_pos: usize, max_pos: usize, severity: Severity },
    /// Two evaluators each rank the other's own response near the bottom.
    MutualOpposition {
        evaluator_a: String,
        evaluator_b: String,
        position_of_b_by_a: usize,
        position_of_a_by_b: usize,
        severity: Severity,
    },
}

/// A response whose rank position is a statistical outlier relative to its
/// own cross-evaluator average.
#[derive(Debug, Clone, PartialEq)]
pub struct MinorityOpinion {
    pub label: Label,
    pub average_position: f64,
    /// Evaluators who ranked this response far better than their peers.
    pub dissenters_high: Vec<String>,
    /// Evaluators who ranked this response far worse than their peers.
    pub dissenters_low: Vec<String>,
}

/// The full analysis bundle produced by aggregating one round of Stage-2
/// evaluations (§3 "Analysis bundle").
#[derive(Debug, Clone, Default)]
pub struct AnalysisBundle {
    /// Borda scores by label, highest first, ties broken by label letter.
    pub scores: Vec<(Label, f64)>,
    pub conflicts: Vec<Conflict>,
    pub minority_opinions: Vec<MinorityOpinion>,
    /// The winning label, if any evaluator produced a non-empty ranking.
    pub winner: Option<Label>,
    /// `backend_id -> averaged Borda score`, across every label that
    /// backend authored (§4.7 "Leaderboard update").
    pub backend_scores: HashMap<String, f64>,
    /// `backend_id -> {criterion -> averaged rubric score}`, across every
    /// label that backend authored (§4.10 "per-criterion bounded queues").
    pub backend_criterion_scores: HashMap<String, HashMap<String, f64>>,
}

const SPREAD_HIGH_THRESHOLD: usize = 4;
const SPREAD_MEDIUM_THRESHOLD: usize = 3;
const SPREAD_LOW_THRESHOLD: usize = 2;
const MINORITY_DEVIATION_THRESHOLD: f64 = 1.5;
const MINORITY_FRACTION: f64 = 0.3;

/// Borda-count positions: label at 0-indexed position `i` in a ranking of
/// length `n` scores `n - i`. Labels absent from an evaluator's ranking
/// score 0 from that evaluator.
fn borda_scores(evaluations: &[Evaluation]) -> HashMap<Label, f64> {
    let mut scores: HashMap<Label, f64> = HashMap::new();
    for eval in evaluations {
        let n = eval.ranking.order.len();
        for (i, label) in eval.ranking.order.iter().enumerate() {
            *scores.entry(label.clone()).or_insert(0.0) += (n - i) as f64;
        }
    }
    scores
}

fn positions_by_label(evaluations: &[Evaluation]) -> HashMap<Label, HashMap<String, usize>> {
    let mut positions: HashMap<Label, HashMap<String, usize>> = HashMap::new();
    for eval in evaluations {
        for (i, label) in eval.ranking.order.iter().enumerate() {
            positions.entry(label.clone()).or_default().insert(eval.evaluator_id.clone(), i);
        }
    }
    positions
}

fn spread_severity(spread: usize) -> Option<Severity> {
    if spread >= SPREAD_HIGH_THRESHOLD {
        Some(Severity::High)
    } else if spread == SPREAD_MEDIUM_THRESHOLD {
        Some(Severity::Medium)
    } else if spread == SPREAD_LOW_THRESHOLD {
        Some(Severity::Low)
    } else {
        None
    }
}

/// Detect per-label ranking spread and evaluator-pair mutual-opposition
/// conflicts (§4.7).
pub fn detect_ranking_conflicts(
    evaluations: &[Evaluation],
    label_to_backend: &HashMap<Label, String>,
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    let positions = positions_by_label(evaluations);
    let mut spread_labels: Vec<&Label> = positions.keys().collect();
    spread_labels.sort();
    for label in spread_labels {
        let by_evaluator = &positions[label];
        if by_evaluator.len() < 2 {
            continue;
        }
        let min_pos = *by_evaluator.values().min().unwrap();
        let max_pos = *by_evaluator.values().max().unwrap();
        let spread = max_pos - min_pos;
        if let Some(severity) = spread_severity(spread) {
            conflicts.push(Conflict::RankingSpread { label: label.clone(), min_pos, max_pos, severity });
        }
    }

    let backend_to_label: HashMap<&str, &Label> =
        label_to_backend.iter().map(|(label, backend)| (backend.as_str(), label)).collect();

    for i in 0..evaluations.len() {
        for j in (i + 1)..evaluations.len() {
            let a = &evaluations[i];
            let b = &evaluations[j];
            let own_label_b = match backend_to_label.get(b.backend_id.as_str()) {
                Some(l) => *l,
                None => continue,
            };
            let own_label_a = match backend_to_label.get(a.backend_id.as_str()) {
                Some(l) => *l,
                None => continue,
            };
            // 1-indexed positions: a last-place finish in an n-panel is
            // position n, which is what the fixed threshold compares against.
            let pos_of_b_by_a = a.ranking.order.iter().position(|l| l == own_label_b).map(|p| p + 1);
            let pos_of_a_by_b = b.ranking.order.iter().position(|l| l == own_label_a).map(|p| p + 1);
            if let (Some(pos_of_b_by_a), Some(pos_of_a_by_b)) = (pos_of_b_by_a, pos_of_a_by_b) {
                let n = a.ranking.order.len().max(b.ranking.order.len());
                let threshold = n.saturating_sub(1).max(3);
                if n >= 3 && pos_of_b_by_a >= threshold && pos_of_a_by_b >= threshold {
                    conflicts.push(Conflict::MutualOpposition {
                        evaluator_a: a.evaluator_id.clone(),
                        evaluator_b: b.evaluator_id.clone(),
                        position_of_b_by_a: pos_of_b_by_a,
                        position_of_a_by_b: pos_of_a_by_b,
                        severity: Severity::High,
                    });
                }
            }
        }
    }

    conflicts
}

/// Flag responses whose rank position deviates sharply, for a fraction of
/// evaluators at or above [`MINORITY_FRACTION`], from that response's own
/// cross-evaluator average (§4.7).
pub fn detect_minority_opinions(evaluations: &[Evaluation]) -> Vec<MinorityOpinion> {
    let positions = positions_by_label(evaluations);
    let num_evaluators = evaluations.len();
    let threshold_count = ((MINORITY_FRACTION * num_evaluators as f64).floor() as usize).max(1);

    let mut opinions = Vec::new();
    let mut labels: Vec<&Label> = positions.keys().collect();
    labels.sort();
    for label in labels {
        let by_evaluator = &positions[label];
        if by_evaluator.len() < 2 {
            continue;
        }
        let avg: f64 =
            by_evaluator.values().sum::<usize>() as f64 / by_evaluator.len() as f64;

        let mut dissenters_high = Vec::new();
        let mut dissenters_low = Vec::new();
        for (evaluator, pos) in by_evaluator {
            let pos = *pos as f64;
            if pos <= avg - MINORITY_DEVIATION_THRESHOLD {
                dissenters_high.push(evaluator.clone());
            } else if pos >= avg + MINORITY_DEVIATION_THRESHOLD {
                dissenters_low.push(evaluator.clone());
            }
        }
        dissenters_high.sort();
        dissenters_low.sort();

        if dissenters_high.len() >= threshold_count || dissenters_low.len() >= threshold_count {
            opinions.push(MinorityOpinion {
                label: label.clone(),
                average_position: avg,
                dissenters_high,
                dissenters_low,
            });
        }
    }

    opinions
}

/// The top-scoring label, ties broken by earliest label letter.
pub fn get_top_response(scores: &HashMap<Label, f64>) -> Option<Label> {
    scores
        .iter()
        .max_by(|(label_a, score_a), (label_b, score_b)| {
            score_a
                .partial_cmp(score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| label_b.cmp(label_a))
        })
        .map(|(label, _)| label.clone())
}

/// Average a backend's Borda score across every label it authored (§4.7
/// "Leaderboard update").
fn backend_scores(
    scores: &HashMap<Label, f64>,
    label_to_backend: &HashMap<Label, String>,
) -> HashMap<String, f64> {
    let mut sums: HashMap<String, (f64, u32)> = HashMap::new();
    for (label, score) in scores {
        if let Some(backend_id) = label_to_backend.get(label) {
            let entry = sums.entry(backend_id.clone()).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
    }
    sums.into_iter().map(|(backend, (sum, count))| (backend, sum / count as f64)).collect()
}

/// Average each label's per-criterion rubric scores across the evaluators
/// that scored it, then average those per-label averages across every
/// label a backend authored (§4.10 "per-criterion bounded queues").
fn backend_criterion_scores(
    evaluations: &[Evaluation],
    label_to_backend: &HashMap<Label, String>,
) -> HashMap<String, HashMap<String, f64>> {
    let mut label_criterion_sums: HashMap<Label, HashMap<String, (f64, u32)>> = HashMap::new();
    for eval in evaluations {
        for (label, criteria) in &eval.ranking.rubric_scores {
            let entry = label_criterion_sums.entry(label.clone()).or_default();
            for (criterion, score) in criteria {
                let e = entry.entry(criterion.clone()).or_insert((0.0, 0));
                e.0 += score;
                e.1 += 1;
            }
        }
    }

    let mut backend_sums: HashMap<String, HashMap<String, (f64, u32)>> = HashMap::new();
    for (label, criteria) in &label_criterion_sums {
        let backend_id = match label_to_backend.get(label) {
            Some(id) => id.clone(),
            None => continue,
        };
        let entry = backend_sums.entry(backend_id).or_default();
        for (criterion, (sum, count)) in criteria {
            let avg = sum / *count as f64;
            let e = entry.entry(criterion.clone()).or_insert((0.0, 0));
            e.0 += avg;
            e.1 += 1;
        }
    }

    backend_sums
        .into_iter()
        .map(|(backend, criteria)| {
            (backend, criteria.into_iter().map(|(c, (sum, count))| (c, sum / count as f64)).collect())
        })
        .collect()
}

/// Aggregate a full round of Stage-2 evaluations into an [`AnalysisBundle`].
pub fn aggregate(
    evaluations: &[Evaluation],
    label_to_backend: &HashMap<Label, String>,
) -> AnalysisBundle {
    let scores = borda_scores(evaluations);
    let winner = get_top_response(&scores);

    let mut ranked_scores: Vec<(Label, f64)> = scores.iter().map(|(l, s)| (l.clone(), *s)).collect();
    ranked_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));

    AnalysisBundle {
        scores: ranked_scores,
        conflicts: detect_ranking_conflicts(evaluations, label_to_backend),
        minority_opinions: detect_minority_opinions(evaluations),
        winner,
        backend_scores: backend_scores(&scores, label_to_backend),
        backend_criterion_scores: backend_criterion_scores(evaluations, label_to_backend),
    }
}
