//! Database Migrations
//!
//! Versioned schema definitions, tracked through `PRAGMA user_version`.

use rusqlite::Connection;

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Conversations, messages, FTS index, kv table",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Zettelkasten memory notes with links and evolution",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Temporal knowledge graph nodes and edges",
        up: MIGRATION_V3_UP,
    },
    Migration {
        version: 4,
        description: "Skill library, evaluations, corrections, retrieval stats",
        up: MIGRATION_V4_UP,
    },
    Migration {
        version: 5,
        description: "Playbooks, outcomes, patterns, solutions",
        up: MIGRATION_V5_UP,
    },
    Migration {
        version: 6,
        description: "Per-user LLM settings, schedule events, expenses",
        up: MIGRATION_V6_UP,
    },
];

/// Apply all pending migrations on the writer connection.
pub fn apply_migrations(conn: &Connection) -> rusqlite::Result<()> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for migration in MIGRATIONS {
        if migration.version > current {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            conn.pragma_update(None, "user_version", migration.version)?;
        }
    }

    Ok(())
}

/// V1: conversation plumbing
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    extracted_file_text TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id, timestamp);

-- FTS5 index over message content for hybrid history search
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    id UNINDEXED,
    conversation_id UNINDEXED,
    user_id UNINDEXED,
    role UNINDEXED,
    content,
    tokenize = 'porter unicode61'
);

-- Generic key/value store (planner learning data, engine state)
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// V2: memory notes
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memory_notes (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    context_description TEXT NOT NULL DEFAULT '',
    linked_memories TEXT NOT NULL DEFAULT '[]',
    evolution_count INTEGER NOT NULL DEFAULT 0,
    source_conversation_id TEXT NOT NULL DEFAULT '',
    confidence REAL NOT NULL DEFAULT 0.8,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notes_user ON memory_notes(user_id, updated_at);

CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
    id UNINDEXED,
    user_id UNINDEXED,
    content,
    context,
    tokenize = 'porter unicode61'
);

-- Embedding blobs for the optional vector index
CREATE TABLE IF NOT EXISTS note_embeddings (
    note_id TEXT PRIMARY KEY REFERENCES memory_notes(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// V3: knowledge graph
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS graph_nodes (
    name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    node_type TEXT NOT NULL DEFAULT '',
    properties TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    PRIMARY KEY (name, user_id)
);

CREATE INDEX IF NOT EXISTS idx_graph_nodes_seen ON graph_nodes(user_id, last_seen);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_type ON graph_nodes(user_id, node_type);

CREATE TABLE IF NOT EXISTS graph_edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_name TEXT NOT NULL,
    to_name TEXT NOT NULL,
    label TEXT NOT NULL,
    user_id TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.8,
    properties TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    source_conversation_id TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    invalidated_at TEXT,
    UNIQUE (from_name, to_name, label, user_id)
);

CREATE INDEX IF NOT EXISTS idx_graph_edges_from ON graph_edges(user_id, from_name);
CREATE INDEX IF NOT EXISTS idx_graph_edges_to ON graph_edges(user_id, to_name);
"#;

/// V4: skill voyager
const MIGRATION_V4_UP: &str = r#"
CREATE TABLE IF NOT EXISTS skills (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL DEFAULT 'system',
    name TEXT NOT NULL,
    skill_type TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    strategy TEXT NOT NULL,
    trigger_patterns TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 0.5,
    times_used INTEGER NOT NULL DEFAULT 0,
    times_succeeded INTEGER NOT NULL DEFAULT 0,
    times_failed INTEGER NOT NULL DEFAULT 0,
    parent_skill_ids TEXT NOT NULL DEFAULT '[]',
    child_skill_ids TEXT NOT NULL DEFAULT '[]',
    state TEXT NOT NULL DEFAULT 'candidate',
    source TEXT NOT NULL DEFAULT 'observed',
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    last_evaluated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_skills_type ON skills(skill_type);
CREATE INDEX IF NOT EXISTS idx_skills_state ON skills(state);
CREATE INDEX IF NOT EXISTS idx_skills_confidence ON skills(confidence DESC);

CREATE TABLE IF NOT EXISTS evaluations (
    id TEXT PRIMARY KEY,
    skill_id TEXT NOT NULL,
    message_id TEXT NOT NULL DEFAULT '',
    conversation_id TEXT NOT NULL DEFAULT '',
    score REAL NOT NULL,
    reasoning TEXT NOT NULL DEFAULT '',
    query_text TEXT NOT NULL DEFAULT '',
    response_snippet TEXT NOT NULL DEFAULT '',
    evaluated_at TEXT NOT NULL,
    FOREIGN KEY (skill_id) REFERENCES skills(id)
);

CREATE INDEX IF NOT EXISTS idx_evals_skill ON evaluations(skill_id);

CREATE TABLE IF NOT EXISTS composition_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_ids TEXT NOT NULL,
    child_id TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT 'auto',
    reasoning TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reflections (
    id TEXT PRIMARY KEY,
    skill_id TEXT NOT NULL,
    evaluation_id TEXT NOT NULL,
    failure_diagnosis TEXT NOT NULL DEFAULT '',
    root_cause TEXT NOT NULL DEFAULT 'wrong_approach',
    improved_strategy TEXT NOT NULL DEFAULT '',
    confidence_in_fix REAL NOT NULL DEFAULT 0.5,
    applied INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS skill_revisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    skill_id TEXT NOT NULL,
    revision_number INTEGER NOT NULL,
    strategy_before TEXT NOT NULL,
    strategy_after TEXT NOT NULL,
    reflection_id TEXT NOT NULL DEFAULT '',
    reason TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_revisions_skill ON skill_revisions(skill_id);

CREATE TABLE IF NOT EXISTS corrections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    correction_type TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    message_id TEXT NOT NULL DEFAULT '',
    original_snippet TEXT NOT NULL DEFAULT '',
    corrected_snippet TEXT NOT NULL DEFAULT '',
    skill_name TEXT NOT NULL DEFAULT '',
    skill_id TEXT NOT NULL DEFAULT '',
    query_type TEXT NOT NULL DEFAULT '',
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS correction_stats (
    skill_id TEXT PRIMARY KEY,
    skill_name TEXT NOT NULL,
    times_corrected INTEGER NOT NULL DEFAULT 0,
    times_edited INTEGER NOT NULL DEFAULT 0,
    times_regenerated INTEGER NOT NULL DEFAULT 0,
    times_thumbs_down INTEGER NOT NULL DEFAULT 0,
    last_correction TEXT
);

CREATE TABLE IF NOT EXISTS retrieval_outcomes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_type TEXT NOT NULL,
    source TEXT NOT NULL,
    was_used INTEGER NOT NULL DEFAULT 0,
    had_results INTEGER NOT NULL DEFAULT 0,
    response_score REAL NOT NULL DEFAULT 0.0,
    query_text TEXT NOT NULL DEFAULT '',
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS retrieval_stats (
    query_type TEXT NOT NULL,
    source TEXT NOT NULL,
    times_used INTEGER NOT NULL DEFAULT 0,
    times_helpful INTEGER NOT NULL DEFAULT 0,
    avg_score_with REAL NOT NULL DEFAULT 0.0,
    avg_score_without REAL NOT NULL DEFAULT 0.0,
    last_updated TEXT,
    PRIMARY KEY (query_type, source)
);
"#;

/// V5: playbooks and outcome learning
const MIGRATION_V5_UP: &str = r#"
CREATE TABLE IF NOT EXISTS outcomes (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL DEFAULT 'system',
    task_description TEXT NOT NULL,
    solution_applied TEXT NOT NULL DEFAULT '',
    outcome_type TEXT NOT NULL DEFAULT 'unknown',
    feedback_source TEXT NOT NULL DEFAULT '',
    skills_used TEXT NOT NULL DEFAULT '[]',
    technologies TEXT NOT NULL DEFAULT '[]',
    error_if_failed TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outcomes_type ON outcomes(outcome_type);

CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    pattern_hash TEXT UNIQUE NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    technologies TEXT NOT NULL DEFAULT '[]',
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    skill_generated INTEGER NOT NULL DEFAULT 0,
    skill_id TEXT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS solutions (
    id TEXT PRIMARY KEY,
    problem TEXT NOT NULL,
    solution TEXT NOT NULL,
    code_after TEXT NOT NULL DEFAULT '',
    technologies TEXT NOT NULL DEFAULT '[]',
    keywords TEXT NOT NULL DEFAULT '[]',
    success_count INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS playbooks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    task_type TEXT NOT NULL DEFAULT 'general',
    difficulty TEXT NOT NULL DEFAULT 'medium',
    steps TEXT NOT NULL DEFAULT '[]',
    decision_tree TEXT NOT NULL DEFAULT '{}',
    code_templates TEXT NOT NULL DEFAULT '{}',
    prerequisites TEXT NOT NULL DEFAULT '[]',
    examples TEXT NOT NULL DEFAULT '[]',
    guardrails TEXT NOT NULL DEFAULT '[]',
    technologies TEXT NOT NULL DEFAULT '[]',
    keywords TEXT NOT NULL DEFAULT '[]',
    generated_by TEXT NOT NULL DEFAULT 'smart_model',
    times_used INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.7,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_playbooks_type ON playbooks(task_type);
"#;

/// V6: settings and live-data stores
const MIGRATION_V6_UP: &str = r#"
CREATE TABLE IF NOT EXISTS llm_settings (
    user_id TEXT PRIMARY KEY,
    settings TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedule_events (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    starts_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedule_user ON schedule_events(user_id, starts_at);

CREATE TABLE IF NOT EXISTS expenses (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    amount REAL NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_expenses_user ON expenses(user_id, created_at);
"#;
