//! Retrieval Learner
//!
//! Tracks which retrieval sources produce useful context per query type. A
//! running EMA of response quality when a source was used vs not used drives
//! data-driven source recommendations, so the pipeline can stop running
//! every source on every turn.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use super::Result;
use crate::storage::Database;

/// EMA weight for new observations
const ALPHA: f64 = 0.3;

/// Response score at or above which a used source counts as helpful
const HELPFUL_THRESHOLD: f64 = 3.0;

/// Below this many observations a source is recommended exploratively
const MIN_OBSERVATIONS: u32 = 3;

/// Sources tracked by the learner.
pub const RETRIEVAL_SOURCES: &[&str] =
    &["memory", "graph", "web_search", "rag", "hybrid_search", "notes"];

/// One observation: did a source contribute to a good response?
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// Query classification key, e.g. `factual/definition`
    pub query_type: String,
    /// Source name
    pub source: String,
    /// Was this source activated?
    pub was_used: bool,
    /// Did it return any results?
    pub had_results: bool,
    /// Overall response quality (1-5, from the evaluator; 3.0 neutral when
    /// no evaluation completed this turn)
    pub response_score: f64,
    /// Query snippet
    pub query_text: String,
    /// Observation time
    pub timestamp: DateTime<Utc>,
}

/// Aggregated stats for one (query_type, source) bucket.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalStatsRow {
    /// Query type key
    pub query_type: String,
    /// Source name
    pub source: String,
    /// Times the source was used with results
    pub times_used: u32,
    /// Times the response scored ≥ 3.0 with the source active
    pub times_helpful: u32,
    /// EMA of response score when used
    pub avg_score_with: f64,
    /// EMA of response score when not used
    pub avg_score_without: f64,
    /// helpful / used
    pub usefulness: f64,
}

/// Learns which retrieval sources are most effective per query type.
#[derive(Clone)]
pub struct RetrievalLearner {
    db: Arc<Database>,
}

impl RetrievalLearner {
    /// Create the learner.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record an outcome and fold it into the running stats.
    pub fn record_outcome(&self, outcome: &RetrievalOutcome) -> Result<()> {
        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO retrieval_outcomes
                   (query_type, source, was_used, had_results, response_score, query_text, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    outcome.query_type,
                    outcome.source,
                    outcome.was_used as i64,
                    outcome.had_results as i64,
                    outcome.response_score,
                    outcome.query_text,
                    outcome.timestamp,
                ],
            )?;

            let existing: Option<(u32, u32, f64, f64)> = tx
                .query_row(
                    "SELECT times_used, times_helpful, avg_score_with, avg_score_without
                     FROM retrieval_stats WHERE query_type = ?1 AND source = ?2",
                    params![outcome.query_type, outcome.source],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let used_with_results = outcome.was_used && outcome.had_results;
            let helpful_delta = u32::from(outcome.response_score >= HELPFUL_THRESHOLD);

            match existing {
                Some((used, helpful, avg_with, avg_without)) => {
                    if used_with_results {
                        let new_avg = avg_with * (1.0 - ALPHA) + outcome.response_score * ALPHA;
                        tx.execute(
                            "UPDATE retrieval_stats
                             SET times_used = ?3, times_helpful = ?4, avg_score_with = ?5,
                                 last_updated = ?6
                             WHERE query_type = ?1 AND source = ?2",
                            params![
                                outcome.query_type,
                                outcome.source,
                                used + 1,
                                helpful + helpful_delta,
                                new_avg,
                                Utc::now(),
                            ],
                        )?;
                    } else {
                        let new_avg = avg_without * (1.0 - ALPHA) + outcome.response_score * ALPHA;
                        tx.execute(
                            "UPDATE retrieval_stats
                             SET avg_score_without = ?3, last_updated = ?4
                             WHERE query_type = ?1 AND source = ?2",
                            params![outcome.query_type, outcome.source, new_avg, Utc::now()],
                        )?;
                    }
                }
                None => {
                    let (used, helpful, avg_with, avg_without) = if used_with_results {
                        (1u32, helpful_delta, outcome.response_score, 0.0)
                    } else {
                        (0, 0, 0.0, outcome.response_score)
                    };
                    tx.execute(
                        "INSERT INTO retrieval_stats
                           (query_type, source, times_used, times_helpful,
                            avg_score_with, avg_score_without, last_updated)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            outcome.query_type,
                            outcome.source,
                            used,
                            helpful,
                            avg_with,
                            avg_without,
                            Utc::now(),
                        ],
                    )?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Recommended sources for a query type as `source -> score (0-1)`.
    ///
    /// `0.6·help_ratio + 0.4·clamp((avg_with − avg_without)/5, 0, 1)`;
    /// sources below [`MIN_OBSERVATIONS`] get an explorative 0.7.
    pub fn recommended_sources(&self, query_type: &str) -> Result<HashMap<String, f64>> {
        let rows: Vec<(String, u32, u32, f64, f64)> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source, times_used, times_helpful, avg_score_with, avg_score_without
                 FROM retrieval_stats WHERE query_type = ?1",
            )?;
            let mapped = stmt.query_map([query_type], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            mapped.collect()
        })?;

        let mut recommendations = HashMap::new();
        for (source, used, helpful, avg_with, avg_without) in rows {
            if used < MIN_OBSERVATIONS {
                recommendations.insert(source, 0.7);
                continue;
            }
            let help_ratio = f64::from(helpful) / f64::from(used.max(1));
            let improvement = if avg_without > 0.0 {
                avg_with - avg_without
            } else {
                0.0
            };
            let score = help_ratio * 0.6 + (improvement / 5.0).clamp(0.0, 1.0) * 0.4;
            recommendations.insert(source, (score * 1000.0).round() / 1000.0);
        }
        Ok(recommendations)
    }

    /// Full stats dump for introspection.
    pub fn stats_summary(&self) -> Result<Vec<RetrievalStatsRow>> {
        Ok(self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT query_type, source, times_used, times_helpful,
                        avg_score_with, avg_score_without
                 FROM retrieval_stats ORDER BY query_type, source",
            )?;
            let mapped = stmt.query_map([], |row| {
                let times_used: u32 = row.get(2)?;
                let times_helpful: u32 = row.get(3)?;
                Ok(RetrievalStatsRow {
                    query_type: row.get(0)?,
                    source: row.get(1)?,
                    times_used,
                    times_helpful,
                    avg_score_with: row.get(4)?,
                    avg_score_without: row.get(5)?,
                    usefulness: f64::from(times_helpful) / f64::from(times_used.max(1)),
                })
            })?;
            mapped.collect()
        })?)
    }

    /// Total observations recorded.
    pub fn total_observations(&self) -> Result<u64> {
        let n: i64 = self.db.read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM retrieval_outcomes", [], |row| {
                row.get(0)
            })
        })?;
        Ok(n as u64)
    }
}

// ============================================================================
// TESTS
// ============================================================================
