//! Message persistence and hybrid history search
//!
//! Messages are append-only. Each write also lands in the FTS5 index so the
//! assembler's history-search source can fuse keyword hits with recency.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{Database, Result};
use crate::context::{ChatMessage, Role};
use crate::search::{reciprocal_rank_fusion, sanitize_fts5_query};

/// A hit from hybrid history search.
#[derive(Debug, Clone)]
pub struct HistoryHit {
    /// Message id
    pub id: String,
    /// Conversation the hit came from
    pub conversation_id: String,
    /// Title of that conversation (empty if untitled)
    pub conversation_title: String,
    /// user / assistant
    pub role: Role,
    /// Message text
    pub content: String,
    /// When the message was written
    pub timestamp: DateTime<Utc>,
    /// Fused relevance score
    pub score: f32,
}

/// Store for conversations and messages.
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    /// Create a store over the shared database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist a message and index it for search. Bumps the conversation's
    /// `updated_at` in the same transaction.
    pub fn save(&self, msg: &ChatMessage) -> Result<()> {
        let now = Utc::now();
        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO messages (id, conversation_id, user_id, role, content, timestamp, extracted_file_text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    msg.id,
                    msg.conversation_id,
                    msg.user_id,
                    msg.role.as_str(),
                    msg.content,
                    msg.timestamp,
                    msg.extracted_file_text,
                ],
            )?;
            tx.execute(
                "INSERT INTO messages_fts (id, conversation_id, user_id, role, content)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    msg.id,
                    msg.conversation_id,
                    msg.user_id,
                    msg.role.as_str(),
                    msg.content,
                ],
            )?;
            tx.execute(
                "INSERT INTO conversations (id, user_id, title, created_at, updated_at)
                 VALUES (?1, ?2, '', ?3, ?3)
                 ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
                params![msg.conversation_id, msg.user_id, now],
            )?;
            Ok(())
        })
    }

    /// Update the stored content of a message in-place after outlet
    /// post-processing stripped action markers. The id stays stable.
    pub fn replace_content(&self, message_id: &str, content: &str) -> Result<()> {
        self.db.transaction(|tx| {
            tx.execute(
                "UPDATE messages SET content = ?2 WHERE id = ?1",
                params![message_id, content],
            )?;
            tx.execute(
                "UPDATE messages_fts SET content = ?2 WHERE id = ?1",
                params![message_id, content],
            )?;
            Ok(())
        })
    }

    /// Last `limit` messages of a conversation, oldest first.
    pub fn conversation_tail(
        &self,
        conversation_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let mut rows: Vec<ChatMessage> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, user_id, role, content, timestamp, extracted_file_text
                 FROM messages
                 WHERE conversation_id = ?1 AND user_id = ?2
                 ORDER BY timestamp DESC LIMIT ?3",
            )?;
            let mapped = stmt.query_map(
                params![conversation_id, user_id, limit as i64],
                Self::row_to_message,
            )?;
            mapped.collect()
        })?;
        rows.reverse();
        Ok(rows)
    }

    /// Count messages in a conversation.
    pub fn count(&self, conversation_id: &str, user_id: &str) -> Result<usize> {
        let n: i64 = self.db.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id],
                |row| row.get(0),
            )
        })?;
        Ok(n as usize)
    }

    /// Conversation title, if one has been set.
    pub fn conversation_title(&self, conversation_id: &str) -> Result<Option<String>> {
        self.db.read(|conn| {
            conn.query_row(
                "SELECT title FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Set the conversation title.
    pub fn set_conversation_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE conversations SET title = ?2 WHERE id = ?1",
                params![conversation_id, title],
            )
            .map(|_| ())
        })
    }

    /// Hybrid search over past conversations: FTS5 keyword hits fused with a
    /// recency list via RRF, so recently-discussed topics surface even when
    /// the keyword match is weak.
    pub fn search_history(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<HistoryHit>> {
        let fts_query = sanitize_fts5_query(query);
        if fts_query.is_empty() {
            return Ok(vec![]);
        }
        let fetch = (limit * 2).max(10) as i64;

        let keyword_hits: Vec<(String, f32)> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, rank FROM messages_fts
                 WHERE messages_fts MATCH ?1 AND user_id = ?2
                 ORDER BY rank LIMIT ?3",
            )?;
            let mapped = stmt.query_map(params![fts_query, user_id, fetch], |row| {
                let id: String = row.get(0)?;
                let rank: f64 = row.get(1)?;
                // FTS5 rank is more-negative-is-better; flip for fusion
                Ok((id, -rank as f32))
            })?;
            mapped.collect()
        })?;

        if keyword_hits.is_empty() {
            return Ok(vec![]);
        }

        let recent_ids: Vec<(String, f32)> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages WHERE user_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![user_id, fetch], |row| {
                Ok((row.get::<_, String>(0)?, 1.0f32))
            })?;
            mapped.collect()
        })?;

        let fused = reciprocal_rank_fusion(&keyword_hits, &recent_ids, 60.0);
        let keyword_set: std::collections::HashSet<&str> =
            keyword_hits.iter().map(|(id, _)| id.as_str()).collect();

        let mut hits = Vec::with_capacity(limit);
        for (id, score) in fused {
            // Recency alone is not relevance; only fetch actual matches
            if !keyword_set.contains(id.as_str()) {
                continue;
            }
            if let Some(mut hit) = self.load_hit(&id)? {
                hit.score = score;
                hits.push(hit);
            }
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    fn load_hit(&self, message_id: &str) -> Result<Option<HistoryHit>> {
        self.db.read(|conn| {
            conn.query_row(
                "SELECT m.id, m.conversation_id, COALESCE(c.title, ''), m.role, m.content, m.timestamp
                 FROM messages m LEFT JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.id = ?1",
                [message_id],
                |row| {
                    Ok(HistoryHit {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        conversation_title: row.get(2)?,
                        role: Role::parse_name(&row.get::<_, String>(3)?),
                        content: row.get(4)?,
                        timestamp: row.get(5)?,
                        score: 0.0,
                    })
                },
            )
            .optional()
        })
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
        Ok(ChatMessage {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            user_id: row.get(2)?,
            role: Role::parse_name(&row.get::<_, String>(3)?),
            content: row.get(4)?,
            timestamp: row.get(5)?,
            extracted_file_text: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::storage::test_support::scratch_db;

    fn store() -> (MessageStore, tempfile::TempDir) {
        let (db, dir) = scratch_db();
        (MessageStore::new(db), dir)
    }

    #[test]
    fn test_save_and_tail_order() {
        let (store, _dir) = store();
        let ctx = RequestContext::new("u1", "c1");
        for text in ["first", "second", "third"] {
            store
                .save(&ChatMessage::new(&ctx, Role::User, text))
                .unwrap();
        }
        let tail = store.conversation_tail("c1", "u1", 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].content, "third");
        assert_eq!(store.count("c1", "u1").unwrap(), 3);
    }

    #[test]
    fn test_history_search_is_user_scoped() {
        let (store, _dir) = store();
        let mine = RequestContext::new("u1", "c1");
        let theirs = RequestContext::new("u2", "c2");
        store
            .save(&ChatMessage::new(&mine, Role::User, "deploying fastapi with docker"))
            .unwrap();
        store
            .save(&ChatMessage::new(&theirs, Role::User, "fastapi deployment secrets"))
            .unwrap();

        let hits = store.search_history("u1", "fastapi docker", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].conversation_id, "c1");
    }

    #[test]
    fn test_replace_content_updates_index() {
        let (store, _dir) = store();
        let ctx = RequestContext::new("u1", "c1");
        let msg = ChatMessage::new(&ctx, Role::Assistant, "zebra marker text");
        store.save(&msg).unwrap();
        store.replace_content(&msg.id, "clean text").unwrap();

        let hits = store.search_history("u1", "zebra", 5).unwrap();
        assert!(hits.is_empty());
        let tail = store.conversation_tail("c1", "u1", 1).unwrap();
        assert_eq!(tail[0].content, "clean text");
    }
}
