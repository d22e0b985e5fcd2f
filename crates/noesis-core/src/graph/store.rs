//! Graph persistence and multi-hop search
//!
//! GraphRAG-style retrieval: entity linking finds entry points, a two-hop
//! expansion collects relationship paths, recency weights the entry ranking,
//! and union-find groups the results into topic communities.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};

use super::community::detect_communities;
use super::extract::EntityExtractor;
use super::{GraphNode, GraphRelationship, Result, is_valid_entity, sanitize_label};
use crate::storage::Database;

/// Node types that make good fallback entry points when nothing matches.
const SALIENT_TYPES: &[&str] = &[
    "technology",
    "framework",
    "programming_language",
    "tool",
    "error_type",
    "project",
    "decision",
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "can",
    "this", "that", "these", "those", "i", "you", "he", "she", "it", "we", "they", "what",
    "which", "who", "whom", "how", "when", "where", "why", "if", "then", "else", "and", "or",
    "but", "not", "no", "yes", "all", "any", "some", "my", "your", "his", "her", "its", "our",
    "their", "with", "about", "into", "from", "for", "on", "in", "at", "to", "of", "by", "as",
];

// ============================================================================
// RESULT TYPES
// ============================================================================

/// A relationship path reachable from a search entry point.
#[derive(Debug, Clone)]
pub struct GraphPath {
    /// Rendered path, e.g. `fastapi -[USES]-> python`
    pub path: String,
    /// Final node on the path
    pub target: String,
    /// Type of the final node
    pub target_type: String,
    /// Confidence (multiplied across hops)
    pub confidence: f64,
    /// When the first edge was learned
    pub created_at: Option<DateTime<Utc>>,
    /// Conversation the first edge came from
    pub source_conversation_id: Option<String>,
    /// False when the first edge has been invalidated
    pub is_active: bool,
    /// Path length (1 or 2)
    pub hops: u8,
}

/// A one-hop neighbor shown when no deeper paths exist.
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    /// Neighbor name
    pub name: String,
    /// Neighbor type
    pub node_type: String,
    /// Edge label
    pub label: String,
}

/// One entity's worth of search context.
#[derive(Debug, Clone)]
pub struct EntityContext {
    /// Entry-point entity
    pub entity: String,
    /// Entity type
    pub node_type: String,
    /// Entry relevance (match score x recency)
    pub relevance: f64,
    /// Relationship paths, best first
    pub paths: Vec<GraphPath>,
    /// Direct neighbors (fallback display)
    pub direct_relations: Vec<RelatedEntity>,
    /// Topic cluster label (`{type}_topic`)
    pub community: String,
    /// All entities in the same cluster
    pub community_members: Vec<String>,
}

/// A path between two named entities.
#[derive(Debug, Clone)]
pub struct PathBetween {
    /// Rendered path string
    pub path_string: String,
    /// Node names along the path
    pub nodes: Vec<String>,
    /// Relationship labels along the path
    pub relationships: Vec<String>,
    /// Edge count
    pub length: usize,
}

/// Result of a pruning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Stale orphans removed
    pub orphaned_removed: usize,
    /// Nodes removed by the retroactive validity sweep
    pub invalid_removed: usize,
    /// Nodes remaining for the user
    pub total_remaining: usize,
}

/// Recent-activity summary grouped by entity type.
#[derive(Debug, Clone, Default)]
pub struct ActivitySummary {
    /// type -> entities, most recent first
    pub by_type: HashMap<String, Vec<ActivityEntity>>,
    /// Flat entity list
    pub all_entities: Vec<String>,
    /// Window in days
    pub period_days: i64,
}

/// One entity in an activity summary.
#[derive(Debug, Clone)]
pub struct ActivityEntity {
    /// Entity name
    pub name: String,
    /// Degree (total relationships)
    pub connections: usize,
    /// A few recent neighbors
    pub recent_relations: Vec<RelatedEntity>,
}

// Internal row shape for edges touching a node
struct EdgeRow {
    neighbor: String,
    neighbor_type: String,
    label: String,
    confidence: f64,
    created_at: DateTime<Utc>,
    source_conversation_id: Option<String>,
    is_active: bool,
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed temporal knowledge graph.
#[derive(Clone)]
pub struct GraphStore {
    db: Arc<Database>,
    extractor: Arc<dyn EntityExtractor>,
}

impl GraphStore {
    /// Create a store with the given entity extractor.
    pub fn new(db: Arc<Database>, extractor: Arc<dyn EntityExtractor>) -> Self {
        Self { db, extractor }
    }

    // ── Writes ────────────────────────────────────────────────

    /// Add or refresh a node. Returns false (and writes nothing) when the
    /// name fails the validity filter. Re-adding bumps `last_seen` only.
    pub fn add_node(&self, node: &GraphNode) -> Result<bool> {
        if !is_valid_entity(&node.name) {
            tracing::debug!("Rejected invalid entity: {:?}", node.name);
            return Ok(false);
        }
        let properties = serde_json::to_string(&node.properties).unwrap_or_else(|_| "{}".into());
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO graph_nodes (name, user_id, node_type, properties, created_at, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(name, user_id) DO UPDATE SET last_seen = excluded.last_seen",
                params![
                    node.name,
                    node.user_id,
                    node.node_type,
                    properties,
                    node.created_at,
                    node.last_seen,
                ],
            )
            .map(|_| ())
        })?;
        Ok(true)
    }

    /// Add a relationship with a free-form semantic label.
    ///
    /// The label is sanitized to `[A-Z0-9_]+` (fallback `RELATES_TO`);
    /// endpoint nodes are created on demand; the write is idempotent on
    /// `(from, to, label, user_id)` — re-asserting an edge never resurrects
    /// an invalidated one.
    pub fn add_relationship_dynamic(
        &self,
        from: &str,
        to: &str,
        label: &str,
        user_id: &str,
        confidence: f64,
        source_conversation_id: Option<&str>,
        properties: Option<&serde_json::Value>,
    ) -> Result<bool> {
        if !is_valid_entity(from) || !is_valid_entity(to) {
            tracing::debug!("Rejected relationship with invalid endpoint: {from:?} -> {to:?}");
            return Ok(false);
        }
        let safe_label = sanitize_label(label);
        let props = properties
            .map(|p| serde_json::to_string(p).unwrap_or_else(|_| "{}".into()))
            .unwrap_or_else(|| "{}".to_string());
        let now = Utc::now();

        self.db.transaction(|tx| {
            for name in [from, to] {
                tx.execute(
                    "INSERT INTO graph_nodes (name, user_id, node_type, properties, created_at, last_seen)
                     VALUES (?1, ?2, '', '{}', ?3, ?3)
                     ON CONFLICT(name, user_id) DO UPDATE SET last_seen = excluded.last_seen",
                    params![name, user_id, now],
                )?;
            }
            tx.execute(
                "INSERT INTO graph_edges
                   (from_name, to_name, label, user_id, confidence, properties,
                    created_at, source_conversation_id, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
                 ON CONFLICT(from_name, to_name, label, user_id) DO NOTHING",
                params![
                    from,
                    to,
                    safe_label,
                    user_id,
                    confidence,
                    props,
                    now,
                    source_conversation_id,
                ],
            )?;
            Ok(())
        })?;
        tracing::debug!("Added relationship: {from} -[{safe_label}]-> {to}");
        Ok(true)
    }

    /// Mark an entity's outgoing relationships of one label inactive.
    ///
    /// Temporal conflict resolution: contradicted facts are kept with
    /// `is_active = false` and an invalidation timestamp instead of being
    /// deleted. Returns the number of edges invalidated.
    pub fn invalidate_relationships(
        &self,
        entity_name: &str,
        label: &str,
        user_id: &str,
    ) -> Result<usize> {
        let safe_label = sanitize_label(label);
        let now = Utc::now();
        let count = self.db.write(|conn| {
            conn.execute(
                "UPDATE graph_edges
                 SET is_active = 0, invalidated_at = ?4
                 WHERE from_name = ?1 AND label = ?2 AND user_id = ?3 AND is_active = 1",
                params![entity_name, safe_label, user_id, now],
            )
        })?;
        if count > 0 {
            tracing::debug!("Invalidated {count} {safe_label} relationships from {entity_name}");
        }
        Ok(count)
    }

    // ── Point reads ───────────────────────────────────────────

    /// Load a node by name.
    pub fn get_node(&self, name: &str, user_id: &str) -> Result<Option<GraphNode>> {
        Ok(self.db.read(|conn| {
            conn.query_row(
                "SELECT name, user_id, node_type, properties, created_at, last_seen
                 FROM graph_nodes WHERE name = ?1 AND user_id = ?2",
                params![name, user_id],
                |row| {
                    Ok(GraphNode {
                        name: row.get(0)?,
                        user_id: row.get(1)?,
                        node_type: row.get(2)?,
                        properties: serde_json::from_str(&row.get::<_, String>(3)?)
                            .unwrap_or(serde_json::Value::Null),
                        created_at: row.get(4)?,
                        last_seen: row.get(5)?,
                    })
                },
            )
            .optional()
        })?)
    }

    /// All relationships touching an entity (active and invalidated).
    pub fn get_relationships(&self, name: &str, user_id: &str) -> Result<Vec<GraphRelationship>> {
        Ok(self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT from_name, to_name, label, confidence, created_at,
                        source_conversation_id, is_active, invalidated_at
                 FROM graph_edges
                 WHERE user_id = ?1 AND (from_name = ?2 OR to_name = ?2)
                 ORDER BY created_at DESC",
            )?;
            let mapped = stmt.query_map(params![user_id, name], |row| {
                Ok(GraphRelationship {
                    from: row.get(0)?,
                    to: row.get(1)?,
                    label: row.get(2)?,
                    confidence: row.get(3)?,
                    created_at: row.get(4)?,
                    source_conversation_id: row.get(5)?,
                    is_active: row.get::<_, i64>(6)? != 0,
                    invalidated_at: row.get(7)?,
                })
            })?;
            mapped.collect()
        })?)
    }

    // ── Multi-hop search ──────────────────────────────────────

    /// GraphRAG search: entity linking, recency-weighted entry selection,
    /// two-hop expansion, community detection.
    pub fn search_by_query(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<EntityContext>> {
        // Entity linking first, keyword tokens as fallback entry signals
        let entity_names: Vec<String> = self
            .extractor
            .extract(query)
            .into_iter()
            .map(|e| e.name.to_lowercase())
            .collect();
        let mut words: Vec<String> = entity_names.clone();
        for token in query.split_whitespace() {
            let w = token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if w.len() > 2 && !STOPWORDS.contains(&w.as_str()) && !words.contains(&w) {
                words.push(w);
            }
        }

        let entry_points = self.select_entry_points(user_id, &entity_names, &words, limit)?;

        let mut results: Vec<EntityContext> = Vec::new();
        for (name, node_type, relevance) in entry_points {
            let ctx = self.expand_entry(&name, &node_type, relevance, user_id)?;
            results.push(ctx);
        }

        // Graph-aware fallback: most-connected recent nodes of salient types
        if results.is_empty() {
            results = self.fallback_neighborhood(user_id, limit)?;
        }

        let results = detect_communities(results);
        tracing::info!(
            "Graph search found {} entities with {} paths",
            results.len(),
            results.iter().map(|c| c.paths.len()).sum::<usize>()
        );
        Ok(results)
    }

    fn select_entry_points(
        &self,
        user_id: &str,
        entity_names: &[String],
        words: &[String],
        limit: usize,
    ) -> Result<Vec<(String, String, f64)>> {
        if words.is_empty() {
            return Ok(vec![]);
        }
        let candidates: Vec<(String, String, DateTime<Utc>)> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, node_type, last_seen FROM graph_nodes
                 WHERE user_id = ?1 AND node_type != ''
                 ORDER BY last_seen DESC LIMIT 5000",
            )?;
            let mapped = stmt.query_map([user_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            mapped.collect()
        })?;

        let now = Utc::now();
        let mut scored: Vec<(String, String, f64)> = Vec::new();
        for (name, node_type, last_seen) in candidates {
            let lower = name.to_lowercase();
            let exact = if entity_names.contains(&lower) { 3.0 } else { 0.0 };
            let contains = words.iter().filter(|w| lower.contains(w.as_str())).count() as f64;
            let match_score = exact + contains;
            if match_score <= 0.0 {
                continue;
            }
            let relevance = match_score * recency_factor(last_seen, now);
            scored.push((name, node_type, relevance));
        }
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    fn expand_entry(
        &self,
        entry: &str,
        entry_type: &str,
        relevance: f64,
        user_id: &str,
    ) -> Result<EntityContext> {
        let mut hop1 = self.edges_touching(entry, user_id)?;
        hop1.retain(|e| !e.neighbor_type.is_empty() && is_valid_entity(&e.neighbor));
        hop1.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut seen = HashSet::new();
        hop1.retain(|e| seen.insert(e.neighbor.clone()));

        let mut paths: Vec<GraphPath> = Vec::new();
        let mut direct_relations: Vec<RelatedEntity> = Vec::new();

        for edge in hop1.iter().take(5) {
            paths.push(GraphPath {
                path: format!("{} -[{}]-> {}", entry, edge.label, edge.neighbor),
                target: edge.neighbor.clone(),
                target_type: edge.neighbor_type.clone(),
                confidence: edge.confidence,
                created_at: Some(edge.created_at),
                source_conversation_id: edge.source_conversation_id.clone(),
                is_active: edge.is_active,
                hops: 1,
            });
            direct_relations.push(RelatedEntity {
                name: edge.neighbor.clone(),
                node_type: edge.neighbor_type.clone(),
                label: edge.label.clone(),
            });
        }

        // Second hop through each first-hop neighbor
        let mut hop2_count = 0usize;
        'outer: for edge in hop1.iter().take(5) {
            let mut second = self.edges_touching(&edge.neighbor, user_id)?;
            second.retain(|e| {
                e.neighbor != entry && !e.neighbor_type.is_empty() && is_valid_entity(&e.neighbor)
            });
            second.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for hop in second {
                if paths.iter().any(|p| p.target == hop.neighbor) {
                    continue;
                }
                paths.push(GraphPath {
                    path: format!(
                        "{} -[{}]-> {} -[{}]-> {}",
                        entry, edge.label, edge.neighbor, hop.label, hop.neighbor
                    ),
                    target: hop.neighbor.clone(),
                    target_type: hop.neighbor_type.clone(),
                    confidence: edge.confidence * hop.confidence,
                    created_at: Some(edge.created_at),
                    source_conversation_id: edge.source_conversation_id.clone(),
                    is_active: edge.is_active,
                    hops: 2,
                });
                hop2_count += 1;
                if hop2_count >= 3 {
                    break 'outer;
                }
            }
        }

        Ok(EntityContext {
            entity: entry.to_string(),
            node_type: entry_type.to_string(),
            relevance,
            paths,
            direct_relations,
            community: String::new(),
            community_members: vec![],
        })
    }

    fn fallback_neighborhood(&self, user_id: &str, limit: usize) -> Result<Vec<EntityContext>> {
        let salient: Vec<(String, String)> = self.db.read(|conn| {
            let placeholders = SALIENT_TYPES
                .iter()
                .map(|_| "?")
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT name, node_type FROM graph_nodes
                 WHERE user_id = ? AND node_type IN ({placeholders})
                 ORDER BY last_seen DESC,
                          (SELECT COUNT(*) FROM graph_edges e
                           WHERE e.user_id = graph_nodes.user_id
                             AND (e.from_name = graph_nodes.name
                                  OR e.to_name = graph_nodes.name)) DESC
                 LIMIT ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bindings: Vec<&dyn rusqlite::ToSql> = vec![&user_id];
            for t in SALIENT_TYPES {
                bindings.push(t);
            }
            let limit_i64 = limit as i64;
            bindings.push(&limit_i64);
            let mapped = stmt.query_map(&bindings[..], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect()
        })?;

        let mut results = Vec::new();
        for (name, node_type) in salient {
            if !is_valid_entity(&name) {
                continue;
            }
            let mut edges = self.edges_touching(&name, user_id)?;
            edges.retain(|e| !e.neighbor_type.is_empty() && is_valid_entity(&e.neighbor));
            edges.truncate(3);

            let paths = edges
                .iter()
                .map(|e| GraphPath {
                    path: format!("{} -[{}]-> {}", name, e.label, e.neighbor),
                    target: e.neighbor.clone(),
                    target_type: e.neighbor_type.clone(),
                    confidence: 0.5,
                    created_at: None,
                    source_conversation_id: None,
                    is_active: true,
                    hops: 1,
                })
                .collect();
            let direct_relations = edges
                .iter()
                .map(|e| RelatedEntity {
                    name: e.neighbor.clone(),
                    node_type: e.neighbor_type.clone(),
                    label: e.label.clone(),
                })
                .collect();

            results.push(EntityContext {
                entity: name,
                node_type,
                relevance: 0.3,
                paths,
                direct_relations,
                community: String::new(),
                community_members: vec![],
            });
        }
        Ok(results)
    }

    fn edges_touching(&self, name: &str, user_id: &str) -> Result<Vec<EdgeRow>> {
        Ok(self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.from_name, e.to_name, e.label, e.confidence, e.created_at,
                        e.source_conversation_id, e.is_active,
                        COALESCE(n.node_type, '')
                 FROM graph_edges e
                 LEFT JOIN graph_nodes n
                   ON n.user_id = e.user_id
                  AND n.name = CASE WHEN e.from_name = ?2 THEN e.to_name ELSE e.from_name END
                 WHERE e.user_id = ?1 AND (e.from_name = ?2 OR e.to_name = ?2)",
            )?;
            let mapped = stmt.query_map(params![user_id, name], |row| {
                let from: String = row.get(0)?;
                let to: String = row.get(1)?;
                Ok(EdgeRow {
                    neighbor: if from == name { to } else { from },
                    neighbor_type: row.get(7)?,
                    label: row.get(2)?,
                    confidence: row.get(3)?,
                    created_at: row.get(4)?,
                    source_conversation_id: row.get(5)?,
                    is_active: row.get::<_, i64>(6)? != 0,
                })
            })?;
            mapped.collect()
        })?)
    }

    // ── Deep reads ────────────────────────────────────────────

    /// Full relationship context for one entity, up to `max_hops` out.
    pub fn get_entity_context(
        &self,
        entity_name: &str,
        user_id: &str,
        max_hops: usize,
    ) -> Result<Option<EntityContext>> {
        let Some(node) = self.get_node(entity_name, user_id)? else {
            return Ok(None);
        };

        let mut ctx = self.expand_entry(&node.name, &node.node_type, 1.0, user_id)?;
        if max_hops < 2 {
            ctx.paths.retain(|p| p.hops <= max_hops as u8);
        }
        Ok(Some(ctx))
    }

    /// Shortest relationship paths between two entities (up to 3).
    pub fn find_paths_between(
        &self,
        entity1: &str,
        entity2: &str,
        user_id: &str,
        max_hops: usize,
    ) -> Result<Vec<PathBetween>> {
        // BFS over paths: shorter paths surface first, capped to avoid blowups
        let mut queue: VecDeque<(Vec<String>, Vec<String>)> = VecDeque::new();
        queue.push_back((vec![entity1.to_string()], vec![]));
        let mut found: Vec<PathBetween> = Vec::new();
        let mut explored = 0usize;

        while let Some((nodes, labels)) = queue.pop_front() {
            explored += 1;
            if explored > 2000 || found.len() >= 3 {
                break;
            }
            let current = nodes.last().cloned().unwrap_or_default();
            if nodes.len() > max_hops + 1 {
                continue;
            }
            for edge in self.edges_touching(&current, user_id)? {
                if nodes.contains(&edge.neighbor) {
                    continue;
                }
                let mut next_nodes = nodes.clone();
                next_nodes.push(edge.neighbor.clone());
                let mut next_labels = labels.clone();
                next_labels.push(edge.label.clone());

                if edge.neighbor == entity2 {
                    let mut parts: Vec<String> = Vec::new();
                    for (i, n) in next_nodes.iter().enumerate() {
                        parts.push(n.clone());
                        if i < next_labels.len() {
                            parts.push(format!("-[{}]->", next_labels[i]));
                        }
                    }
                    found.push(PathBetween {
                        path_string: parts.join(" "),
                        nodes: next_nodes,
                        relationships: next_labels,
                        length: labels.len() + 1,
                    });
                    if found.len() >= 3 {
                        break;
                    }
                } else if next_nodes.len() <= max_hops {
                    queue.push_back((next_nodes, next_labels));
                }
            }
        }
        Ok(found)
    }

    /// Entities active within the last `days`, grouped by type.
    pub fn get_recent_activity_summary(
        &self,
        user_id: &str,
        days: i64,
        limit: usize,
    ) -> Result<ActivitySummary> {
        let cutoff = Utc::now() - Duration::days(days);
        let recent: Vec<(String, String)> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, node_type FROM graph_nodes
                 WHERE user_id = ?1 AND node_type != '' AND last_seen > ?2
                 ORDER BY last_seen DESC LIMIT ?3",
            )?;
            let mapped = stmt.query_map(params![user_id, cutoff, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            mapped.collect()
        })?;

        let mut summary = ActivitySummary {
            period_days: days,
            ..Default::default()
        };
        for (name, node_type) in recent {
            if !is_valid_entity(&name) {
                continue;
            }
            let edges = self.edges_touching(&name, user_id)?;
            let connections = edges.len();
            let recent_relations = edges
                .into_iter()
                .filter(|e| !e.neighbor_type.is_empty() && is_valid_entity(&e.neighbor))
                .take(3)
                .map(|e| RelatedEntity {
                    name: e.neighbor,
                    node_type: e.neighbor_type,
                    label: e.label,
                })
                .collect();

            summary.all_entities.push(name.clone());
            summary
                .by_type
                .entry(node_type)
                .or_default()
                .push(ActivityEntity {
                    name,
                    connections,
                    recent_relations,
                });
        }
        Ok(summary)
    }

    // ── Pruning ───────────────────────────────────────────────

    /// Periodic cleanup: remove stale orphans and retroactively-invalid
    /// nodes. A node is an orphan when it has `min_degree` or fewer
    /// relationships (strictly fewer than `min_degree + 1`).
    pub fn prune_stale_nodes(
        &self,
        user_id: &str,
        max_age_days: i64,
        min_degree: usize,
    ) -> Result<PruneStats> {
        let cutoff = Utc::now() - Duration::days(max_age_days);

        let orphaned_removed = self.db.write(|conn| {
            conn.execute(
                "DELETE FROM graph_nodes
                 WHERE user_id = ?1 AND last_seen < ?2
                   AND (SELECT COUNT(*) FROM graph_edges e
                        WHERE e.user_id = graph_nodes.user_id
                          AND (e.from_name = graph_nodes.name OR e.to_name = graph_nodes.name))
                       <= ?3",
                params![user_id, cutoff, min_degree as i64],
            )
        })?;

        // Retroactive validity sweep in batches of 50
        let all_names: Vec<String> = self.db.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM graph_nodes WHERE user_id = ?1")?;
            let mapped = stmt.query_map([user_id], |row| row.get(0))?;
            mapped.collect()
        })?;
        let invalid: Vec<String> = all_names
            .into_iter()
            .filter(|n| !is_valid_entity(n))
            .collect();

        for batch in invalid.chunks(50) {
            self.db.transaction(|tx| {
                for name in batch {
                    tx.execute(
                        "DELETE FROM graph_edges
                         WHERE user_id = ?1 AND (from_name = ?2 OR to_name = ?2)",
                        params![user_id, name],
                    )?;
                    tx.execute(
                        "DELETE FROM graph_nodes WHERE user_id = ?1 AND name = ?2",
                        params![user_id, name],
                    )?;
                }
                Ok(())
            })?;
        }

        let total_remaining: i64 = self.db.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM graph_nodes WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
        })?;

        let stats = PruneStats {
            orphaned_removed,
            invalid_removed: invalid.len(),
            total_remaining: total_remaining as usize,
        };
        tracing::info!("Graph pruned for user {user_id}: {stats:?}");
        Ok(stats)
    }

    // ── Formatting ────────────────────────────────────────────

    /// Format search results for LLM prompt injection, grouped by community.
    pub fn format_context_for_prompt(&self, results: &[EntityContext]) -> String {
        if results.is_empty() {
            return String::new();
        }

        let mut lines = vec![
            "[Knowledge Graph Context]".to_string(),
            "The following entities and relationships are relevant to this conversation:"
                .to_string(),
            String::new(),
        ];

        // Preserve result order while grouping by community
        let mut communities: Vec<(String, Vec<&EntityContext>)> = Vec::new();
        for ctx in results {
            match communities.iter_mut().find(|(c, _)| *c == ctx.community) {
                Some((_, members)) => members.push(ctx),
                None => communities.push((ctx.community.clone(), vec![ctx])),
            }
        }
        let multiple = communities.len() > 1;

        for (community, members) in &communities {
            if multiple {
                let topic = community.trim_end_matches("_topic").replace('_', " ");
                lines.push(format!("── {} ──", title_case(&topic)));
            }
            for ctx in members {
                lines.push(format!("• {} ({})", ctx.entity, ctx.node_type));

                if !ctx.paths.is_empty() {
                    let mut sorted: Vec<&GraphPath> = ctx.paths.iter().collect();
                    sorted.sort_by(|a, b| {
                        b.confidence
                            .partial_cmp(&a.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    for path in sorted.iter().take(5) {
                        let indicator = if path.confidence > 0.7 {
                            "●"
                        } else if path.confidence > 0.4 {
                            "○"
                        } else {
                            "◌"
                        };
                        let mut citation = String::new();
                        if let Some(created) = path.created_at {
                            citation = format!(" (learned {})", created.format("%b %d"));
                        }
                        if !path.is_active {
                            citation.push_str(" [NO LONGER TRUE]");
                        }
                        lines.push(format!("  {} {}{}", indicator, path.path, citation));
                    }
                } else {
                    for rel in ctx.direct_relations.iter().take(3) {
                        lines.push(format!("  → {} {} ({})", rel.label, rel.name, rel.node_type));
                    }
                }
                lines.push(String::new());
            }
        }

        lines.push(
            "Use these relationships to inform your response with contextual awareness."
                .to_string(),
        );
        lines.join("\n")
    }

    /// Format an activity summary for LLM context.
    pub fn format_activity_summary(&self, summary: &ActivitySummary) -> String {
        if summary.by_type.is_empty() {
            return String::new();
        }
        let mut lines = vec![
            "[Recent Activity Summary]".to_string(),
            format!(
                "Topics discussed in the last {} days:",
                summary.period_days
            ),
            String::new(),
        ];
        for (etype, entities) in &summary.by_type {
            let label = match etype.as_str() {
                "technology" => "Technologies".to_string(),
                "framework" => "Frameworks".to_string(),
                "programming_language" => "Languages".to_string(),
                "tool" => "Tools".to_string(),
                "project" => "Projects".to_string(),
                "error_type" => "Issues/Errors".to_string(),
                "decision" => "Decisions".to_string(),
                "person" => "People".to_string(),
                "concept" => "Concepts".to_string(),
                other => title_case(&other.replace('_', " ")),
            };
            let names: Vec<&str> = entities.iter().take(5).map(|e| e.name.as_str()).collect();
            if !names.is_empty() {
                lines.push(format!("• {}: {}", label, names.join(", ")));
            }
        }
        lines.join("\n")
    }
}

/// Bucketed exponential recency decay.
fn recency_factor(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age = now - last_seen;
    if age <= Duration::days(1) {
        1.0
    } else if age <= Duration::days(3) {
        0.85
    } else if age <= Duration::days(7) {
        0.7
    } else if age <= Duration::days(14) {
        0.5
    } else if age <= Duration::days(30) {
        0.4
    } else {
        0.2
    }
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// TESTS
// ============================================================================
