//! Skill Extractor
//!
//! Watches the outlet pipeline and turns good, novel exchanges into
//! candidate skills. When no existing skill was applied and the response
//! looks worth learning from, the extractor asks the LLM for a reusable
//! strategy, or infers one from the response's structure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{QueryClassification, Result, Skill, SkillSource, SkillType, SkillStore};
use crate::llm::{LlmProvider, parse_json_from_text};

/// Recently extracted type keys kept for dedup
const MAX_RECENT: usize = 50;

/// LLM extraction deadline
const EXTRACT_DEADLINE: Duration = Duration::from_secs(20);

const EXTRACT_PROMPT: &str = "Analyze this successful conversation exchange and extract a reusable response strategy.

USER QUERY: {query}
QUERY TYPE: {query_type}
AI RESPONSE (first 1000 chars): {response_snippet}

Extract a reusable strategy that could be applied to similar queries.
Respond with ONLY this JSON:
{
  \"name\": \"<short_snake_case_name>\",
  \"description\": \"<one sentence description>\",
  \"strategy\": \"<2-4 sentence instruction for handling this type of query>\",
  \"trigger_patterns\": [\"<pattern1>\", \"<pattern2>\", \"<pattern3>\"]
}";

/// Extracts new skill candidates from successful conversations.
pub struct SkillExtractor {
    skill_store: SkillStore,
    llm: Option<Arc<dyn LlmProvider>>,
    recent_extractions: Mutex<Vec<String>>,
}

impl SkillExtractor {
    /// Create an extractor.
    pub fn new(skill_store: SkillStore, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            skill_store,
            llm,
            recent_extractions: Mutex::new(Vec::new()),
        }
    }

    /// Maybe extract a new skill from this exchange.
    ///
    /// Skips when a skill was already applied (that path goes to
    /// evaluation), the classification is weak, the query is conversational
    /// noise, the response doesn't look good, or a similar skill was
    /// extracted recently.
    pub async fn maybe_extract(
        &self,
        query: &str,
        response: &str,
        classification: &QueryClassification,
        skill_was_applied: bool,
    ) -> Result<Option<Skill>> {
        if skill_was_applied {
            return Ok(None);
        }
        if classification.confidence < 0.5 {
            return Ok(None);
        }
        if classification.primary_type == "conversational"
            && matches!(classification.sub_type.as_str(), "follow_up" | "meta")
        {
            return Ok(None);
        }
        if !response_looks_good(query, response) {
            return Ok(None);
        }

        let dedup_key = classification.type_key();
        {
            let recent = self.recent_extractions.lock().expect("extractor lock");
            if recent.contains(&dedup_key) {
                return Ok(None);
            }
        }

        let mut skill = None;
        if let Some(llm) = &self.llm {
            skill = self.llm_extract(llm.as_ref(), query, response, classification).await;
        }
        let Some(skill) = skill.or_else(|| template_extract(response, classification)) else {
            return Ok(None);
        };

        // Near-duplicate check against the library
        let existing = self.skill_store.find_matching_skills(query, 0.0, 1)?;
        if let Some(existing) = existing.first() {
            if is_duplicate(&skill, existing) {
                tracing::debug!("Skipping duplicate skill extraction: {}", skill.name);
                return Ok(None);
            }
        }

        if !self.skill_store.add_skill(&skill) {
            return Ok(None);
        }
        {
            let mut recent = self.recent_extractions.lock().expect("extractor lock");
            recent.push(dedup_key);
            if recent.len() > MAX_RECENT {
                recent.remove(0);
            }
        }
        tracing::info!(
            "Extracted new skill: {} (type={}, source=observed)",
            skill.name,
            skill.skill_type.as_str(),
        );
        Ok(Some(skill))
    }

    async fn llm_extract(
        &self,
        llm: &dyn LlmProvider,
        query: &str,
        response: &str,
        classification: &QueryClassification,
    ) -> Option<Skill> {
        let prompt = EXTRACT_PROMPT
            .replace("{query}", &clip(query, 400))
            .replace("{query_type}", &classification.type_key())
            .replace("{response_snippet}", &clip(response, 1000));

        let text = match llm.complete(&prompt, 300, EXTRACT_DEADLINE).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("LLM skill extraction failed: {e}");
                return None;
            }
        };
        let value = parse_json_from_text(&text)?;
        let name = value["name"].as_str().unwrap_or("").trim().to_string();
        if name.len() < 3 {
            return None;
        }
        let triggers: Vec<String> = value["trigger_patterns"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut skill = Skill::new(
            name,
            classify_to_skill_type(classification),
            value["strategy"].as_str().unwrap_or("").to_string(),
            triggers,
            SkillSource::Observed,
        );
        skill.description = value["description"]
            .as_str()
            .unwrap_or("LLM-extracted skill")
            .to_string();
        Some(skill)
    }
}

/// Infer a strategy from the response structure when no LLM is available.
fn template_extract(response: &str, classification: &QueryClassification) -> Option<Skill> {
    let has_headers = response.lines().any(|l| l.trim_start().starts_with('#'));
    let has_bullets = response.lines().any(|l| {
        let t = l.trim_start();
        t.starts_with("- ") || t.starts_with("* ") || t.starts_with("• ")
    });
    let has_numbered = response.lines().any(|l| {
        let t = l.trim_start();
        t.chars().next().is_some_and(|c| c.is_ascii_digit())
            && (t.contains(". ") || t.contains(") "))
    });
    let has_code = response.contains("```");
    let has_citations =
        response.contains("[1]") || response.to_lowercase().contains("source:");
    let has_table = response.contains('|') && response.contains("---");

    let mut strategy_parts: Vec<&str> = Vec::new();
    let mut name_parts: Vec<String> = vec![classification.sub_type.clone()];

    if has_headers {
        strategy_parts.push("Use markdown headers to organize sections");
    }
    if has_bullets {
        strategy_parts.push("Use bullet points for key items");
    }
    if has_numbered {
        strategy_parts.push("Use numbered steps for sequential information");
        name_parts.push("step_by_step".into());
    }
    if has_code {
        strategy_parts.push("Include code blocks with syntax highlighting");
        name_parts.push("with_code".into());
    }
    if has_citations {
        strategy_parts.push("Cite sources with numbered references");
        name_parts.push("cited".into());
    }
    if has_table {
        strategy_parts.push("Use tables for structured comparisons");
        name_parts.push("tabular".into());
    }

    if strategy_parts.is_empty() {
        return None;
    }

    let name = format!(
        "{}_{}",
        name_parts.join("_"),
        &uuid::Uuid::new_v4().simple().to_string()[..6]
    );
    let strategy = format!(
        "For {} queries: {}.",
        classification.type_key(),
        strategy_parts.join(". ")
    );

    let mut triggers: Vec<String> = classification.keywords.iter().take(3).cloned().collect();
    if !triggers.contains(&classification.sub_type) {
        triggers.insert(0, classification.sub_type.clone());
    }

    let mut skill = Skill::new(
        name,
        classify_to_skill_type(classification),
        strategy,
        triggers,
        SkillSource::Observed,
    );
    skill.description = format!("Observed pattern for {}", classification.type_key());
    // Slightly below the matching threshold: one success verifies it
    skill.confidence = 0.45;
    Some(skill)
}

/// Quick heuristic: is this response worth extracting from?
fn response_looks_good(query: &str, response: &str) -> bool {
    let response_words = response.split_whitespace().count();
    let query_words = query.split_whitespace().count();

    if response_words < 30 {
        return false;
    }
    if query_words <= 5 && response_words > 100 {
        return true;
    }
    let has_structure = response.lines().any(|l| {
        let t = l.trim_start();
        t.starts_with('#')
            || t.starts_with("- ")
            || t.starts_with("* ")
            || t.chars().next().is_some_and(|c| c.is_ascii_digit())
    }) || response.contains("```");
    if has_structure && response_words > 50 {
        return true;
    }
    response_words >= 80
}

fn is_duplicate(new_skill: &Skill, existing: &Skill) -> bool {
    if new_skill.name == existing.name {
        return true;
    }
    let new_triggers: std::collections::HashSet<String> = new_skill
        .trigger_patterns
        .iter()
        .map(|t| t.to_lowercase())
        .collect();
    let existing_triggers: std::collections::HashSet<String> = existing
        .trigger_patterns
        .iter()
        .map(|t| t.to_lowercase())
        .collect();
    if new_triggers.is_empty() || existing_triggers.is_empty() {
        return false;
    }
    let overlap = new_triggers.intersection(&existing_triggers).count();
    overlap as f64 / new_triggers.len().max(1) as f64 > 0.6
}

fn classify_to_skill_type(classification: &QueryClassification) -> SkillType {
    match classification.primary_type.as_str() {
        "research" => SkillType::RetrievalCombo,
        "creative" | "technical" => SkillType::ResponseFormat,
        "conversational" => SkillType::ConversationPattern,
        _ => SkillType::SearchStrategy,
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::QueryClassifier;
    use crate::storage::test_support::scratch_db;

    fn setup() -> (SkillExtractor, SkillStore, tempfile::TempDir) {
        let (db, dir) = scratch_db();
        let store = SkillStore::new(db);
        (SkillExtractor::new(store.clone(), None), store, dir)
    }

    const STRUCTURED_RESPONSE: &str = "Here is the full breakdown of the migration plan.\n\
        1. Snapshot the current schema and back up the data directory first.\n\
        2. Apply the new migrations in a transaction so failures roll back.\n\
        3. Re-run the integration suite against the migrated database.\n\
        ```sql\nALTER TABLE users ADD COLUMN tier TEXT;\n```\n\
        Each step is reversible, and the code block above shows the only \
        destructive statement involved in the whole process.";

    #[tokio::test]
    async fn test_extracts_from_structured_response() {
        let (extractor, store, _dir) = setup();
        let classifier = QueryClassifier::new();
        let classification =
            classifier.classify("implement a script for safe database migration", 0);

        let skill = extractor
            .maybe_extract(
                "implement a script for safe database migration",
                STRUCTURED_RESPONSE,
                &classification,
                false,
            )
            .await
            .unwrap()
            .expect("skill extracted");

        assert_eq!(skill.source, SkillSource::Observed);
        assert!((skill.confidence - 0.45).abs() < f64::EPSILON);
        assert!(skill.name.contains("step_by_step") || skill.name.contains("with_code"));
        assert!(store.get_skill(&skill.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_extraction_when_skill_applied() {
        let (extractor, _store, _dir) = setup();
        let classifier = QueryClassifier::new();
        let classification = classifier.classify("how do I implement a migration", 0);
        let result = extractor
            .maybe_extract("q", STRUCTURED_RESPONSE, &classification, true)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_no_extraction_from_weak_classification() {
        let (extractor, _store, _dir) = setup();
        let classification = QueryClassification {
            primary_type: "factual".into(),
            sub_type: "definition".into(),
            confidence: 0.2,
            signals: vec![],
            keywords: vec![],
        };
        let result = extractor
            .maybe_extract("q", STRUCTURED_RESPONSE, &classification, false)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_no_extraction_from_short_response() {
        let (extractor, _store, _dir) = setup();
        let classifier = QueryClassifier::new();
        let classification = classifier.classify("implement a function to migrate the data", 0);
        let result = extractor
            .maybe_extract("q", "Just run the migrations.", &classification, false)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_recent_type_dedup() {
        let (extractor, store, _dir) = setup();
        let classifier = QueryClassifier::new();
        let classification =
            classifier.classify("implement a script for deploying to staging", 0);

        let first = extractor
            .maybe_extract("first question", STRUCTURED_RESPONSE, &classification, false)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = extractor
            .maybe_extract("second question", STRUCTURED_RESPONSE, &classification, false)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.get_skill_stats().unwrap().total_skills, 1);
    }
}
