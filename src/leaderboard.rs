//! The Leaderboard (§4.10): a durable per-`(council_id, backend_id)`
//! performance record, updated after each finished deliberation.
//!
//! Grounded in `original_source/backend/leaderboard.py`. A file-backed
//! store is out of scope (§1); the in-memory `Leaderboard` here, guarded
//! by `tokio::sync::Mutex`, is the crate's concrete, tested deliverable.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

const WINDOW_CAPACITY: usize = 50;

/// A bounded FIFO window: oldest entries drop once `capacity` is exceeded.
#[derive(Debug, Clone, Default)]
struct BoundedWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl BoundedWindow {
    fn new(capacity: usize) -> Self {
        BoundedWindow { values: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.values.iter().sum::<f64>() / self.values.len() as f64
        }
    }
}

/// One `(council_id, backend_id)` performance record (§3 "Leaderboard
/// entry").
#[derive(Debug, Clone)]
pub struct LeaderboardRecord {
    pub backend_id: String,
    pub wins: u64,
    pub participations: u64,
    pub cumulative_score: f64,
    position_window: BoundedWindow,
    avg_position: f64,
    criterion_windows: HashMap<String, BoundedWindow>,
}

impl LeaderboardRecord {
    fn new(backend_id: String) -> Self {
        LeaderboardRecord {
            backend_id,
            wins: 0,
            participations: 0,
            cumulative_score: 0.0,
            position_window: BoundedWindow::new(WINDOW_CAPACITY),
            avg_position: 0.0,
            criterion_windows: HashMap::new(),
        }
    }
}

/// Read-facing snapshot of a record with the reference implementation's
/// reporting precision: `win_rate` to 1 decimal place, `avg_score` and
/// `avg_position` to 2 (§4.10 "Read protocol").
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderboardEntry {
    pub backend_id: String,
    pub wins: u64,
    pub participations: u64,
    pub win_rate: f64,
    pub avg_score: f64,
    pub avg_position: f64,
    pub per_criterion: HashMap<String, f64>,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

impl LeaderboardRecord {
    fn to_entry(&self) -> LeaderboardEntry {
        let win_rate = if self.participations == 0 {
            0.0
        } else {
            self.wins as f64 / self.participations as f64 * 100.0
        };
        let avg_score = if self.participations == 0 {
            0.0
        } else {
            self.cumulative_score / self.participations as f64
        };
        LeaderboardEntry {
            backend_id: self.backend_id.clone(),
            wins: self.wins,
            participations: self.participations,
            win_rate: round_to(win_rate, 1),
            avg_score: round_to(avg_score, 2),
            avg_position: round_to(self.avg_position, 2),
            per_criterion: self
                .criterion_windows
                .iter()
                .map(|(name, window)| (name.clone(), round_to(window.mean(), 2)))
                .collect(),
        }
    }
}

/// One participant's result from a finished deliberation, as input to
/// [`Leaderboard::record_result`].
#[derive(Debug, Clone)]
pub struct ParticipantResult {
    pub backend_id: String,
    pub score: f64,
    pub criterion_scores: HashMap<String, f64>,
}

/// Per-council leaderboard state, keyed by backend id.
#[derive(Default)]
struct CouncilLeaderboard {
    records: HashMap<String, LeaderboardRecord>,
}

/// The durable per-council, per-backend performance store (§4.10).
#[derive(Default)]
pub struct Leaderboard {
    councils: Mutex<HashMap<String, CouncilLeaderboard>>,
}

impl Leaderboard {
    pub fn new() -> Self {
        Leaderboard { councils: Mutex::new(HashMap::new()) }
    }

    /// Record one finished deliberation's results for `council_id` (§4.10
    /// "Per-record update protocol").
    ///
    /// `participants` need not be pre-sorted; positions are assigned here
    /// by descending score. `winner_backend_id` increments that backend's
    /// `wins`.
    pub async fn record_result(
        &self,
        council_id: &str,
        participants: &[ParticipantResult],
        winner_backend_id: Option<&str>,
    ) {
        let mut councils = self.councils.lock().await;
        let council = councils.entry(council_id.to_string()).or_default();

        let mut ordered: Vec<&ParticipantResult> = participants.iter().collect();
        ordered.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        for (i, participant) in ordered.iter().enumerate() {
            let position = i + 1;
            let record = council
                .records
                .entry(participant.backend_id.clone())
                .or_insert_with(|| LeaderboardRecord::new(participant.backend_id.clone()));

            record.position_window.push(position as f64);
            record.participations += 1;
            record.cumulative_score += participant.score;
            if Some(participant.backend_id.as_str()) == winner_backend_id {
                record.wins += 1;
            }
            record.avg_position = record.position_window.mean();

            for (criterion, score) in &participant.criterion_scores {
                record
                    .criterion_windows
                    .entry(criterion.clone())
                    .or_insert_with(|| BoundedWindow::new(WINDOW_CAPACITY))
                    .push(*score);
            }
        }
    }

    /// Every record for `council_id`, sorted by `win_rate` descending
    /// (§4.10 "Read protocol").
    pub async fn council_leaderboard(&self, council_id: &str) -> Vec<LeaderboardEntry> {
        let councils = self.councils.lock().await;
        let mut entries: Vec<LeaderboardEntry> = councils
            .get(council_id)
            .map(|council| council.records.values().map(LeaderboardRecord::to_entry).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| b.win_rate.partial_cmp(&a.win_rate).unwrap_or(std::cmp::Ordering::Equal));
        entries
    }

    /// Every council's leaderboard, keyed by council id.
    pub async fn all_leaderboards(&self) -> HashMap<String, Vec<LeaderboardEntry>> {
        let councils = self.councils.lock().await;
        councils
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .map(|id| {
                let entries = councils
                    .get(&id)
                    .map(|council| council.records.values().map(LeaderboardRecord::to_entry).collect::<Vec<_>>())
                    .unwrap_or_default();
                (id, entries)
            })
            .collect()
    }
}
