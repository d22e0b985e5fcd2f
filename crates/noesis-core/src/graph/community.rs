//! Community detection
//!
//! Groups the entities returned by a single search into topic clusters.
//! Entities sharing at least one neighbor land in the same community
//! (connected components over the shared-neighbor relation, via union-find);
//! each community is labeled by its dominant node type as `{type}_topic`.

use std::collections::{HashMap, HashSet};

use super::store::EntityContext;

struct UnionFind {
    parent: HashMap<String, String>,
}

impl UnionFind {
    fn new(keys: impl Iterator<Item = String>) -> Self {
        Self {
            parent: keys.map(|k| (k.clone(), k)).collect(),
        }
    }

    fn find(&mut self, key: &str) -> String {
        let mut current = key.to_string();
        while let Some(parent) = self.parent.get(&current) {
            if *parent == current {
                break;
            }
            // Path halving
            let grandparent = self.parent.get(parent).cloned().unwrap_or(parent.clone());
            self.parent.insert(current.clone(), grandparent.clone());
            current = grandparent;
        }
        current
    }

    fn union(&mut self, a: &str, b: &str) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            self.parent.insert(root_a, root_b);
        }
    }
}

/// Attach `community` and `community_members` to each search result.
pub fn detect_communities(mut results: Vec<EntityContext>) -> Vec<EntityContext> {
    if results.is_empty() {
        return results;
    }

    // Adjacency: entity -> neighbor names from its paths and direct relations
    let mut neighbors: HashMap<String, HashSet<String>> = HashMap::new();
    for ctx in &results {
        let mut set = HashSet::new();
        for path in &ctx.paths {
            set.insert(path.target.clone());
        }
        for rel in &ctx.direct_relations {
            set.insert(rel.name.clone());
        }
        neighbors.insert(ctx.entity.clone(), set);
    }

    let entities: Vec<String> = neighbors.keys().cloned().collect();
    let mut uf = UnionFind::new(entities.iter().cloned());

    for (i, a) in entities.iter().enumerate() {
        for b in entities.iter().skip(i + 1) {
            let shared = neighbors[a].intersection(&neighbors[b]).next().is_some();
            if shared {
                uf.union(a, b);
            }
        }
    }

    // Group members per root
    let mut members: HashMap<String, Vec<String>> = HashMap::new();
    for entity in &entities {
        let root = uf.find(entity);
        members.entry(root).or_default().push(entity.clone());
    }

    // Label each community by its dominant node type
    let type_of: HashMap<&str, &str> = results
        .iter()
        .map(|ctx| (ctx.entity.as_str(), ctx.node_type.as_str()))
        .collect();
    let mut labels: HashMap<String, String> = HashMap::new();
    for (root, group) in &members {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for member in group {
            let t = type_of.get(member.as_str()).copied().unwrap_or("unknown");
            *counts.entry(t).or_default() += 1;
        }
        let dominant = counts
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .map(|(t, _)| t)
            .unwrap_or("general");
        labels.insert(root.clone(), format!("{}_topic", dominant));
    }

    for ctx in &mut results {
        let root = uf.find(&ctx.entity);
        ctx.community = labels
            .get(&root)
            .cloned()
            .unwrap_or_else(|| "general_topic".to_string());
        ctx.community_members = members
            .get(&root)
            .cloned()
            .unwrap_or_else(|| vec![ctx.entity.clone()]);
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::{EntityContext, GraphPath};

    fn ctx(entity: &str, node_type: &str, targets: &[&str]) -> EntityContext {
        EntityContext {
            entity: entity.to_string(),
            node_type: node_type.to_string(),
            relevance: 1.0,
            paths: targets
                .iter()
                .map(|t| GraphPath {
                    path: format!("{} -[USES]-> {}", entity, t),
                    target: t.to_string(),
                    target_type: "technology".to_string(),
                    confidence: 0.8,
                    created_at: None,
                    source_conversation_id: None,
                    is_active: true,
                    hops: 1,
                })
                .collect(),
            direct_relations: vec![],
            community: String::new(),
            community_members: vec![],
        }
    }

    #[test]
    fn test_shared_neighbor_joins_community() {
        let results = detect_communities(vec![
            ctx("fastapi", "framework", &["python"]),
            ctx("django", "framework", &["python"]),
            ctx("docker", "tool", &["containerd"]),
        ]);

        let fastapi = results.iter().find(|c| c.entity == "fastapi").unwrap();
        let django = results.iter().find(|c| c.entity == "django").unwrap();
        let docker = results.iter().find(|c| c.entity == "docker").unwrap();

        assert_eq!(fastapi.community, django.community);
        assert!(fastapi.community_members.contains(&"django".to_string()));
        assert_ne!(fastapi.community, docker.community);
        assert_eq!(fastapi.community, "framework_topic");
    }

    #[test]
    fn test_singleton_community() {
        let results = detect_communities(vec![ctx("redis", "technology", &["cache"])]);
        assert_eq!(results[0].community, "technology_topic");
        assert_eq!(results[0].community_members, vec!["redis".to_string()]);
    }

    #[test]
    fn test_empty_input() {
        assert!(detect_communities(vec![]).is_empty());
    }
}
