//! Action execution
//!
//! Executes parsed markers: notes become memory notes, schedule and expense
//! entries land in their SQLite tables, email goes through the gateway
//! trait (a no-op unless wired to a real SMTP/IMAP integration). Datetime
//! heads accept ISO, relative (`in 2 hours`), and simple natural forms
//! (`tomorrow at 3pm`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::params;

use crate::storage::{Database, Result, StorageError};

// ============================================================================
// DATETIME PARSING
// ============================================================================

/// Parse a schedule datetime: ISO (`2026-02-08 15:00`), relative
/// (`in N minutes|hours|days`), or natural (`tomorrow at 3pm`, `today at
/// 14:30`). Returns `None` for anything unintelligible.
pub fn parse_scheduled_time(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    let lower = trimmed.to_lowercase();

    // ISO forms first
    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date.and_hms_opt(9, 0, 0)?.and_utc());
    }

    // Relative: "in N minutes|hours|days"
    if let Some(rest) = lower.strip_prefix("in ") {
        let mut parts = rest.split_whitespace();
        let amount: i64 = parts.next()?.parse().ok()?;
        let unit = parts.next()?;
        let delta = if unit.starts_with("minute") || unit == "min" || unit == "mins" {
            Duration::minutes(amount)
        } else if unit.starts_with("hour") || unit == "hr" || unit == "hrs" {
            Duration::hours(amount)
        } else if unit.starts_with("day") {
            Duration::days(amount)
        } else {
            return None;
        };
        return Some(now + delta);
    }

    // Natural: "tomorrow [at TIME]", "today at TIME"
    let (base_day, time_part) = if let Some(rest) = lower.strip_prefix("tomorrow") {
        (now.date_naive() + Duration::days(1), rest.trim())
    } else if let Some(rest) = lower.strip_prefix("today") {
        (now.date_naive(), rest.trim())
    } else {
        return None;
    };
    let time_part = time_part.strip_prefix("at ").unwrap_or(time_part).trim();
    let time = if time_part.is_empty() {
        NaiveTime::from_hms_opt(9, 0, 0)?
    } else {
        parse_clock_time(time_part)?
    };
    Some(base_day.and_time(time).and_utc())
}

fn parse_clock_time(input: &str) -> Option<NaiveTime> {
    let lower = input.to_lowercase();
    let (body, pm) = if let Some(b) = lower.strip_suffix("pm") {
        (b.trim(), true)
    } else if let Some(b) = lower.strip_suffix("am") {
        (b.trim(), false)
    } else {
        (lower.as_str(), false)
    };

    let (hour, minute) = match body.split_once(':') {
        Some((h, m)) => (h.trim().parse::<u32>().ok()?, m.trim().parse::<u32>().ok()?),
        None => (body.trim().parse::<u32>().ok()?, 0),
    };
    let hour = if pm && hour < 12 { hour + 12 } else { hour };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

// ============================================================================
// SCHEDULE & EXPENSE STORES
// ============================================================================

/// A calendar event.
#[derive(Debug, Clone)]
pub struct ScheduleEvent {
    /// Unique identifier
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Event title
    pub title: String,
    /// Optional description
    pub description: String,
    /// Start time
    pub starts_at: DateTime<Utc>,
}

/// SQLite-backed schedule store.
#[derive(Clone)]
pub struct ScheduleStore {
    db: Arc<Database>,
}

impl ScheduleStore {
    /// Create the store.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Add an event.
    pub fn add(&self, user_id: &str, title: &str, description: &str, starts_at: DateTime<Utc>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO schedule_events (id, user_id, title, description, starts_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, user_id, title, description, starts_at, Utc::now()],
            )
            .map(|_| ())
        })?;
        Ok(id)
    }

    /// Events from now forward, soonest first.
    pub fn upcoming(&self, user_id: &str, limit: usize) -> Result<Vec<ScheduleEvent>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, title, description, starts_at FROM schedule_events
                 WHERE user_id = ?1 AND starts_at >= ?2
                 ORDER BY starts_at LIMIT ?3",
            )?;
            let mapped = stmt.query_map(params![user_id, Utc::now(), limit as i64], |row| {
                Ok(ScheduleEvent {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                    starts_at: row.get(4)?,
                })
            })?;
            mapped.collect()
        })
    }
}

/// A tracked expense.
#[derive(Debug, Clone)]
pub struct Expense {
    /// Unique identifier
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Amount spent
    pub amount: f64,
    /// Lowercase freeform category
    pub category: String,
    /// Description
    pub description: String,
    /// When the expense was logged
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed expense tracker.
#[derive(Clone)]
pub struct ExpenseStore {
    db: Arc<Database>,
}

impl ExpenseStore {
    /// Create the store.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Log an expense. Amount strings accept `$` and thousands commas.
    pub fn add(&self, user_id: &str, amount_raw: &str, category: &str, description: &str) -> Result<String> {
        let amount: f64 = amount_raw
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse()
            .map_err(|_| StorageError::Init(format!("unparsable amount: {amount_raw:?}")))?;
        let id = uuid::Uuid::new_v4().to_string();
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO expenses (id, user_id, amount, category, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    user_id,
                    amount,
                    category.trim().to_lowercase(),
                    description.trim(),
                    Utc::now(),
                ],
            )
            .map(|_| ())
        })?;
        Ok(id)
    }

    /// Recent expenses, newest first.
    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<Expense>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, amount, category, description, created_at FROM expenses
                 WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![user_id, limit as i64], |row| {
                Ok(Expense {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    amount: row.get(2)?,
                    category: row.get(3)?,
                    description: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?;
            mapped.collect()
        })
    }
}

// ============================================================================
// EMAIL GATEWAY
// ============================================================================

/// Outbound/inbound mail integration. SMTP/IMAP wiring lives outside the
/// core; the default implementation does nothing and reports unavailable.
#[async_trait]
pub trait EmailGateway: Send + Sync {
    /// Whether a real mail backend is wired in.
    fn is_available(&self) -> bool {
        false
    }

    /// Send a message now. Recipient `None` means the user themselves.
    async fn send(&self, _user_id: &str, _subject: &str, _recipient: Option<&str>, _body: &str) -> Result<()> {
        Ok(())
    }

    /// Schedule a message for later delivery.
    async fn schedule(
        &self,
        _user_id: &str,
        _subject: &str,
        _deliver_at: DateTime<Utc>,
        _body: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Search the user's inbox; returns formatted result text.
    async fn search(&self, _user_id: &str, _query: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// The default gateway: reports unavailable, executes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmailGateway;

#[async_trait]
impl EmailGateway for NullEmailGateway {}

// ============================================================================
// TESTS
// ============================================================================
