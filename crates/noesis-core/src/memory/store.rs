//! Memory persistence, linking, and evolution
//!
//! The add pipeline: enrich (LLM or heuristic), find nearest candidates,
//! validate links (LLM, defaulting to link on parse failure), write both
//! sides of every link in one transaction, then let the LLM evolve the
//! context of linked notes.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::{MemoryNote, Result};
use crate::llm::{LlmProvider, parse_json_from_text};
use crate::search::{keyword_overlap_similarity, sanitize_fts5_query};
use crate::storage::Database;

#[cfg(feature = "embeddings")]
use crate::embeddings::EmbeddingService;
#[cfg(all(feature = "embeddings", feature = "vector-search"))]
use crate::embeddings::{embedding_from_bytes, embedding_to_bytes};
#[cfg(feature = "vector-search")]
use crate::search::VectorIndex;

/// Candidates examined for linking
const LINK_CANDIDATES: usize = 5;

/// Similarity floor for the vector path (mapped from L2 as 1/(1+d))
#[cfg(feature = "vector-search")]
const MIN_LINK_SIMILARITY: f32 = 0.7;

/// Similarity floor for the keyword-overlap fallback path
const MIN_LINK_OVERLAP: f32 = 0.3;

/// Keyword cap after evolution merges
const MAX_KEYWORDS: usize = 10;

/// Evolved context cap (chars)
const MAX_CONTEXT_CHARS: usize = 300;

const ENRICHMENT_PROMPT: &str = "Analyze this memory content and extract structured metadata.

Content: {content}

Respond in this exact JSON format:
{\"keywords\": [\"keyword1\", \"keyword2\"], \"tags\": [\"tag1\", \"tag2\"], \"context_description\": \"A rich one-sentence description of what this memory represents\"}

Keywords should be specific technical terms, names, or concepts.
Tags should be broad categories like: code, error, solution, preference, fact, decision, tool, library.";

const LINK_PROMPT: &str = "Analyze if these two memories should be linked.

Memory A: {content_a}
Keywords A: {keywords_a}

Memory B: {content_b}
Keywords B: {keywords_b}

Consider shared concepts, cause/effect, and problem/solution pairs.
Respond in JSON:
{\"should_link\": true, \"relationship_type\": \"related|supplements|contradicts|solves|causes\", \"reason\": \"brief explanation\"}";

const EVOLUTION_PROMPT: &str = "Given an existing memory and a new related memory, determine if the existing memory should be updated.

Existing Memory:
- Content: {existing_content}
- Context: {existing_context}
- Keywords: {existing_keywords}

New Related Memory:
- Content: {new_content}
- Context: {new_context}

Respond in JSON:
{\"should_update\": false, \"updated_context\": \"\", \"new_keywords\": [], \"reason\": \"brief explanation\"}";

/// What an `add_memory` call did.
#[derive(Debug, Clone, Default)]
pub struct AddMemoryOutcome {
    /// The created note (with links populated)
    pub note: Option<MemoryNote>,
    /// Ids the new note was linked to
    pub linked: Vec<String>,
    /// How many existing notes were evolved
    pub evolved: usize,
}

/// Store for memory notes.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Database>,
    llm: Option<Arc<dyn LlmProvider>>,
    #[cfg(feature = "embeddings")]
    embeddings: EmbeddingService,
    #[cfg(feature = "vector-search")]
    index: Arc<std::sync::Mutex<VectorIndex>>,
}

impl MemoryStore {
    /// Create a store; with `llm = None` every LLM-guided step falls back to
    /// its heuristic path.
    pub fn new(db: Arc<Database>, llm: Option<Arc<dyn LlmProvider>>) -> Result<Self> {
        #[cfg(feature = "vector-search")]
        let index = {
            let index = VectorIndex::new()
                .map_err(|e| crate::storage::StorageError::Init(e.to_string()))?;
            Arc::new(std::sync::Mutex::new(index))
        };

        let store = Self {
            db,
            llm,
            #[cfg(feature = "embeddings")]
            embeddings: EmbeddingService::new(),
            #[cfg(feature = "vector-search")]
            index,
        };

        #[cfg(all(feature = "embeddings", feature = "vector-search"))]
        store.load_embeddings_into_index()?;

        Ok(store)
    }

    #[cfg(all(feature = "embeddings", feature = "vector-search"))]
    fn load_embeddings_into_index(&self) -> Result<()> {
        let rows: Vec<(String, Vec<u8>)> = self.db.read(|conn| {
            let mut stmt = conn.prepare("SELECT note_id, embedding FROM note_embeddings")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect()
        })?;
        let mut index = self.index.lock().expect("vector index lock");
        for (note_id, bytes) in rows {
            if let Some(vector) = embedding_from_bytes(&bytes) {
                if let Err(e) = index.add(&note_id, &vector) {
                    tracing::warn!("Failed to load embedding for {note_id}: {e}");
                }
            }
        }
        Ok(())
    }

    // ── Enrichment ────────────────────────────────────────────

    /// Fill keywords, tags, and a context description. LLM when available;
    /// otherwise top long words become the keywords.
    pub async fn enrich_memory(&self, content: &str, user_id: &str) -> MemoryNote {
        let mut note = MemoryNote::new(content, user_id);

        if let Some(llm) = &self.llm {
            let prompt = ENRICHMENT_PROMPT.replace("{content}", &clip(content, 1500));
            match llm
                .complete(&prompt, 300, std::time::Duration::from_secs(15))
                .await
            {
                Ok(text) => {
                    if let Some(value) = parse_json_from_text(&text) {
                        note.keywords = string_array(&value["keywords"]);
                        note.tags = string_array(&value["tags"]);
                        note.context_description = value["context_description"]
                            .as_str()
                            .unwrap_or("")
                            .to_string();
                    }
                }
                Err(e) => tracing::debug!("Memory enrichment failed: {e}, using fallback"),
            }
        }

        if note.keywords.is_empty() {
            note.keywords = heuristic_keywords(content);
        }
        if note.tags.is_empty() {
            note.tags = vec!["general".to_string()];
        }
        if note.context_description.is_empty() {
            note.context_description = clip(content, 200);
        }
        note
    }

    // ── Add pipeline ──────────────────────────────────────────

    /// Full pipeline: enrich, find related notes, create bidirectional
    /// links, evolve linked notes, persist.
    pub async fn add_memory(
        &self,
        content: &str,
        user_id: &str,
        source_conversation_id: &str,
    ) -> Result<AddMemoryOutcome> {
        let mut note = self.enrich_memory(content, user_id).await;
        note.source_conversation_id = source_conversation_id.to_string();

        let candidates = self.find_related(&note)?;
        let mut outcome = AddMemoryOutcome::default();

        // Link validation: the LLM can veto a candidate, but parse failures
        // default to linking (similarity already cleared the bar)
        let mut linked: Vec<MemoryNote> = Vec::new();
        for candidate in candidates {
            if self.should_link(&note, &candidate).await {
                linked.push(candidate);
            }
        }

        self.persist(&note)?;
        for related in &linked {
            self.link_pair(&note.id, &related.id)?;
            note.linked_memories.insert(related.id.clone());
            outcome.linked.push(related.id.clone());
        }

        // Evolution: newer information can rewrite the context of the notes
        // it landed next to
        for related in &linked {
            if self.evolve_note(&note, related).await? {
                outcome.evolved += 1;
            }
        }

        if !linked.is_empty() {
            tracing::info!(
                "Memory added with {} links, {} evolved",
                outcome.linked.len(),
                outcome.evolved
            );
        }

        self.index_note(&note)?;
        outcome.note = Some(note);
        Ok(outcome)
    }

    async fn should_link(&self, note: &MemoryNote, candidate: &MemoryNote) -> bool {
        let Some(llm) = &self.llm else {
            return true;
        };
        let prompt = LINK_PROMPT
            .replace("{content_a}", &clip(&note.content, 500))
            .replace("{keywords_a}", &note.keywords.join(", "))
            .replace("{content_b}", &clip(&candidate.content, 500))
            .replace("{keywords_b}", &candidate.keywords.join(", "));
        match llm
            .complete(&prompt, 200, std::time::Duration::from_secs(15))
            .await
        {
            Ok(text) => parse_json_from_text(&text)
                .and_then(|v| v["should_link"].as_bool())
                .unwrap_or(true),
            Err(e) => {
                tracing::debug!("Link analysis failed, defaulting to link: {e}");
                true
            }
        }
    }

    async fn evolve_note(&self, new_note: &MemoryNote, existing: &MemoryNote) -> Result<bool> {
        let Some(llm) = &self.llm else {
            return Ok(false);
        };
        let prompt = EVOLUTION_PROMPT
            .replace("{existing_content}", &clip(&existing.content, 500))
            .replace("{existing_context}", &existing.context_description)
            .replace("{existing_keywords}", &existing.keywords.join(", "))
            .replace("{new_content}", &clip(&new_note.content, 500))
            .replace("{new_context}", &new_note.context_description);

        let text = match llm
            .complete(&prompt, 300, std::time::Duration::from_secs(15))
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!("Evolution check failed for {}: {e}", existing.id);
                return Ok(false);
            }
        };
        let Some(value) = parse_json_from_text(&text) else {
            return Ok(false);
        };
        if !value["should_update"].as_bool().unwrap_or(false) {
            return Ok(false);
        }

        // Reload: the link pass may have updated this note since it was read
        let Some(mut evolved) = self.get_note(&existing.id)? else {
            return Ok(false);
        };
        if let Some(updated) = value["updated_context"].as_str() {
            if !updated.is_empty() {
                evolved.context_description = clip(updated, MAX_CONTEXT_CHARS);
            }
        }
        let new_keywords = string_array(&value["new_keywords"]);
        if !new_keywords.is_empty() {
            for kw in new_keywords {
                if !evolved.keywords.contains(&kw) {
                    evolved.keywords.push(kw);
                }
            }
            evolved.keywords.truncate(MAX_KEYWORDS);
        }
        evolved.evolution_count += 1;
        evolved.updated_at = Utc::now();
        self.persist(&evolved)?;
        tracing::debug!(
            "Evolved memory {}: {}",
            evolved.id,
            value["reason"].as_str().unwrap_or("no reason")
        );
        Ok(true)
    }

    // ── Candidate search ──────────────────────────────────────

    fn find_related(&self, note: &MemoryNote) -> Result<Vec<MemoryNote>> {
        #[cfg(all(feature = "embeddings", feature = "vector-search"))]
        {
            let search_text = format!("{} {}", note.content, note.context_description);
            if let Ok(vector) = self.embeddings.embed(&search_text) {
                let index = self.index.lock().expect("vector index lock");
                if let Ok(hits) = index.search(&vector, LINK_CANDIDATES + 1) {
                    let mut related = Vec::new();
                    for (id, similarity) in hits {
                        if id == note.id || similarity < MIN_LINK_SIMILARITY {
                            continue;
                        }
                        if let Some(candidate) = self.get_note(&id)? {
                            if candidate.user_id == note.user_id {
                                related.push(candidate);
                            }
                        }
                    }
                    related.truncate(LINK_CANDIDATES);
                    return Ok(related);
                }
            }
        }

        // Keyword path: FTS candidates re-scored by token overlap
        let query = sanitize_fts5_query(&format!("{} {}", note.content, note.context_description));
        if query.is_empty() {
            return Ok(vec![]);
        }
        let ids: Vec<String> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM memory_fts
                 WHERE memory_fts MATCH ?1 AND user_id = ?2
                 ORDER BY rank LIMIT ?3",
            )?;
            let mapped = stmt.query_map(
                params![query, note.user_id, (LINK_CANDIDATES * 3) as i64],
                |row| row.get(0),
            )?;
            mapped.collect()
        })?;

        let mut scored: Vec<(MemoryNote, f32)> = Vec::new();
        for id in ids {
            if id == note.id {
                continue;
            }
            if let Some(candidate) = self.get_note(&id)? {
                let similarity = keyword_overlap_similarity(&note.content, &candidate.content);
                if similarity >= MIN_LINK_OVERLAP {
                    scored.push((candidate, similarity));
                }
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(LINK_CANDIDATES)
            .map(|(n, _)| n)
            .collect())
    }

    // ── Retrieval ─────────────────────────────────────────────

    /// Load a note by id.
    pub fn get_note(&self, id: &str) -> Result<Option<MemoryNote>> {
        Ok(self.db.read(|conn| {
            conn.query_row(
                "SELECT id, user_id, content, keywords, tags, context_description,
                        linked_memories, evolution_count, source_conversation_id,
                        confidence, created_at, updated_at
                 FROM memory_notes WHERE id = ?1",
                [id],
                row_to_note,
            )
            .optional()
        })?)
    }

    /// Rank notes for a query (FTS + overlap re-score), best first.
    pub fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryNote>> {
        let fts = sanitize_fts5_query(query);
        if fts.is_empty() {
            return Ok(vec![]);
        }
        let ids: Vec<String> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM memory_fts
                 WHERE memory_fts MATCH ?1 AND user_id = ?2
                 ORDER BY rank LIMIT ?3",
            )?;
            let mapped = stmt.query_map(params![fts, user_id, (limit * 2) as i64], |row| {
                row.get(0)
            })?;
            mapped.collect()
        })?;

        let mut notes = Vec::new();
        for id in ids {
            if let Some(note) = self.get_note(&id)? {
                notes.push(note);
            }
            if notes.len() >= limit {
                break;
            }
        }
        Ok(notes)
    }

    /// Most recently updated notes for a user.
    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryNote>> {
        Ok(self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, content, keywords, tags, context_description,
                        linked_memories, evolution_count, source_conversation_id,
                        confidence, created_at, updated_at
                 FROM memory_notes WHERE user_id = ?1
                 ORDER BY updated_at DESC LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![user_id, limit as i64], row_to_note)?;
            mapped.collect()
        })?)
    }

    /// BFS over `linked_memories` up to `max_depth` hops, starting note
    /// included. Visited-set guarded against cycles.
    pub fn get_linked_context(&self, memory_id: &str, max_depth: usize) -> Result<Vec<MemoryNote>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut result = Vec::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((memory_id.to_string(), 0));

        while let Some((id, depth)) = queue.pop_front() {
            if depth > max_depth || !visited.insert(id.clone()) {
                continue;
            }
            if let Some(note) = self.get_note(&id)? {
                for linked in &note.linked_memories {
                    queue.push_back((linked.clone(), depth + 1));
                }
                result.push(note);
            }
        }
        Ok(result)
    }

    /// Update a note's tags in place (content and links untouched).
    pub fn retag(&self, note: &MemoryNote) -> Result<()> {
        let Some(mut current) = self.get_note(&note.id)? else {
            return Ok(());
        };
        current.tags = note.tags.clone();
        current.updated_at = Utc::now();
        self.persist(&current)
    }

    // ── Persistence internals ─────────────────────────────────

    fn persist(&self, note: &MemoryNote) -> Result<()> {
        let keywords = serde_json::to_string(&note.keywords).unwrap_or_else(|_| "[]".into());
        let tags = serde_json::to_string(&note.tags).unwrap_or_else(|_| "[]".into());
        let linked: Vec<&String> = note.linked_memories.iter().collect();
        let linked = serde_json::to_string(&linked).unwrap_or_else(|_| "[]".into());

        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO memory_notes
                   (id, user_id, content, keywords, tags, context_description,
                    linked_memories, evolution_count, source_conversation_id,
                    confidence, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                   content = excluded.content,
                   keywords = excluded.keywords,
                   tags = excluded.tags,
                   context_description = excluded.context_description,
                   linked_memories = excluded.linked_memories,
                   evolution_count = excluded.evolution_count,
                   confidence = excluded.confidence,
                   updated_at = excluded.updated_at",
                params![
                    note.id,
                    note.user_id,
                    note.content,
                    keywords,
                    tags,
                    note.context_description,
                    linked,
                    note.evolution_count,
                    note.source_conversation_id,
                    note.confidence,
                    note.created_at,
                    note.updated_at,
                ],
            )?;
            tx.execute("DELETE FROM memory_fts WHERE id = ?1", [&note.id])?;
            tx.execute(
                "INSERT INTO memory_fts (id, user_id, content, context)
                 VALUES (?1, ?2, ?3, ?4)",
                params![note.id, note.user_id, note.content, note.context_description],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Add each id to the other's link set, atomically.
    fn link_pair(&self, a: &str, b: &str) -> Result<()> {
        self.db.transaction(|tx| {
            for (this, other) in [(a, b), (b, a)] {
                let current: Option<String> = tx
                    .query_row(
                        "SELECT linked_memories FROM memory_notes WHERE id = ?1",
                        [this],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(current) = current else { continue };
                let mut set: HashSet<String> =
                    serde_json::from_str(&current).unwrap_or_default();
                if set.insert(other.to_string()) {
                    let linked: Vec<&String> = set.iter().collect();
                    tx.execute(
                        "UPDATE memory_notes SET linked_memories = ?2, updated_at = ?3
                         WHERE id = ?1",
                        params![
                            this,
                            serde_json::to_string(&linked).unwrap_or_else(|_| "[]".into()),
                            Utc::now(),
                        ],
                    )?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    #[allow(unused_variables)]
    fn index_note(&self, note: &MemoryNote) -> Result<()> {
        #[cfg(all(feature = "embeddings", feature = "vector-search"))]
        {
            let text = format!("{} {}", note.content, note.context_description);
            if let Ok(vector) = self.embeddings.embed(&text) {
                self.db.write(|conn| {
                    conn.execute(
                        "INSERT INTO note_embeddings (note_id, embedding, dimensions, model, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(note_id) DO UPDATE SET
                           embedding = excluded.embedding,
                           dimensions = excluded.dimensions",
                        params![
                            note.id,
                            embedding_to_bytes(&vector),
                            vector.len() as i64,
                            "nomic-embed-text-v1.5",
                            Utc::now(),
                        ],
                    )
                    .map(|_| ())
                })?;
                if let Err(e) = self.index.lock().expect("vector index lock").add(&note.id, &vector)
                {
                    tracing::warn!("Vector index add failed for {}: {e}", note.id);
                }
            }
        }
        Ok(())
    }
}

fn row_to_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryNote> {
    Ok(MemoryNote {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        keywords: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
        tags: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
        context_description: row.get(5)?,
        linked_memories: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        evolution_count: row.get(7)?,
        source_conversation_id: row.get(8)?,
        confidence: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn heuristic_keywords(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 4)
        .filter(|w| seen.insert(w.to_string()))
        .take(5)
        .map(String::from)
        .collect()
}

fn string_array(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

// ============================================================================
// TESTS
// ============================================================================
