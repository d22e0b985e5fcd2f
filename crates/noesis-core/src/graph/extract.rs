//! Entity extraction
//!
//! Entry-point linking for graph search and entity harvesting for the outlet
//! pipeline. The extractor is a trait so a model-backed implementation (a
//! GLiNER-class NER service) can be plugged in; the built-in implementation
//! is lexicon + capitalization heuristics and runs without any model.

use std::collections::HashSet;

use super::is_valid_entity;

/// An entity found in free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntity {
    /// Surface form as written
    pub name: String,
    /// Best-guess semantic type
    pub entity_type: String,
}

/// Named-entity extraction over arbitrary text.
pub trait EntityExtractor: Send + Sync {
    /// Extract entities, best candidates first. Implementations filter
    /// through [`is_valid_entity`] themselves.
    fn extract(&self, text: &str) -> Vec<ExtractedEntity>;
}

/// Technologies recognized by name regardless of capitalization.
const TECH_LEXICON: &[(&str, &str)] = &[
    ("python", "programming_language"),
    ("rust", "programming_language"),
    ("javascript", "programming_language"),
    ("typescript", "programming_language"),
    ("go", "programming_language"),
    ("sql", "programming_language"),
    ("react", "framework"),
    ("vue", "framework"),
    ("angular", "framework"),
    ("django", "framework"),
    ("flask", "framework"),
    ("fastapi", "framework"),
    ("axum", "framework"),
    ("express", "framework"),
    ("tokio", "framework"),
    ("postgres", "technology"),
    ("postgresql", "technology"),
    ("mongodb", "technology"),
    ("sqlite", "technology"),
    ("redis", "technology"),
    ("neo4j", "technology"),
    ("kafka", "technology"),
    ("docker", "tool"),
    ("kubernetes", "tool"),
    ("git", "tool"),
    ("terraform", "tool"),
    ("aws", "technology"),
    ("gcp", "technology"),
    ("azure", "technology"),
    ("graphql", "technology"),
    ("grpc", "technology"),
    ("linux", "technology"),
];

/// Lexicon + capitalization extractor.
///
/// Two passes: known technology names (typed from the lexicon), then
/// capitalized tokens that are not sentence-initial (typed `concept`).
#[derive(Debug, Default, Clone)]
pub struct HeuristicEntityExtractor;

impl HeuristicEntityExtractor {
    /// Create the extractor.
    pub fn new() -> Self {
        Self
    }
}

impl EntityExtractor for HeuristicEntityExtractor {
    fn extract(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut entities = Vec::new();

        // Pass 1: lexicon matches
        for word in text.split(|c: char| !c.is_alphanumeric() && c != '.' && c != '+') {
            let lower = word.to_lowercase();
            if let Some((canonical, etype)) = TECH_LEXICON.iter().find(|(t, _)| *t == lower) {
                if seen.insert(canonical.to_string()) && is_valid_entity(word) {
                    entities.push(ExtractedEntity {
                        name: word.to_string(),
                        entity_type: etype.to_string(),
                    });
                }
            }
        }

        // Pass 2: capitalized tokens that aren't sentence starts
        let mut sentence_start = true;
        for raw in text.split_whitespace() {
            let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
            let starts_upper = word.chars().next().is_some_and(|c| c.is_uppercase());
            if starts_upper && !sentence_start && word.len() > 2 {
                let lower = word.to_lowercase();
                if !seen.contains(&lower) && seen.insert(lower) && is_valid_entity(word) {
                    entities.push(ExtractedEntity {
                        name: word.to_string(),
                        entity_type: "concept".to_string(),
                    });
                }
            }
            sentence_start = raw.ends_with('.') || raw.ends_with('?') || raw.ends_with('!');
        }

        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicon_extraction() {
        let extractor = HeuristicEntityExtractor::new();
        let entities = extractor.extract("our project uses FastAPI and Postgres behind Docker");
        let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"FastAPI"));
        assert!(names.contains(&"Postgres"));
        assert!(names.contains(&"Docker"));

        let fastapi = entities.iter().find(|e| e.name == "FastAPI").unwrap();
        assert_eq!(fastapi.entity_type, "framework");
    }

    #[test]
    fn test_capitalized_mid_sentence() {
        let extractor = HeuristicEntityExtractor::new();
        let entities = extractor.extract("we migrated Orion to the new cluster");
        assert!(entities.iter().any(|e| e.name == "Orion"));
        // Sentence-initial "We" must not become an entity
        assert!(!entities.iter().any(|e| e.name.eq_ignore_ascii_case("we")));
    }

    #[test]
    fn test_noise_is_filtered() {
        let extractor = HeuristicEntityExtractor::new();
        let entities = extractor.extract("I think You should fix it");
        assert!(entities.is_empty());
    }

    #[test]
    fn test_dedup() {
        let extractor = HeuristicEntityExtractor::new();
        let entities = extractor.extract("Docker docker DOCKER");
        assert_eq!(entities.len(), 1);
    }
}
