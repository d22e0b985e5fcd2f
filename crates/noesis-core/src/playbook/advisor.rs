//! Outcome-driven advice: smart context, difficulty assessment, and
//! auto-generation of skills and playbooks from recorded outcomes.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::store::{Outcome, OutcomeType, Playbook, PlaybookStep, PlaybookStore, Solution};
use super::{Difficulty, Result, extract_keywords};
use crate::skills::{Skill, SkillSource, SkillStore, SkillType};

/// Auto-playbook generation requires a solution longer than this
const MIN_SOLUTION_LEN: usize = 100;

/// No auto-playbook when a similar one matches at or above this score
const SIMILAR_PLAYBOOK_THRESHOLD: f64 = 0.5;

/// Pattern → skill conversion thresholds
const PATTERN_MIN_SUCCESSES: u32 = 3;
const PATTERN_MIN_RATE: f64 = 0.7;

/// Auto-skill creations allowed per hour
const MAX_AUTO_SKILLS_PER_HOUR: usize = 5;

/// Model names treated as high-capability (substring match).
const SMART_MODELS: &[&str] = &[
    "claude-3-opus", "claude-3.5-sonnet", "claude-3.5-haiku", "claude-4", "gpt-4", "gpt-4o",
    "gpt-4-turbo", "gpt-4.1", "gpt-5", "o1", "o3", "o4-mini", "gemini-pro", "gemini-ultra",
    "gemini-2.0", "gemini-2.5-pro", "deepseek-v3", "deepseek-r1", "codex",
];

/// Model names treated as low-capability (substring match).
const WEAK_MODELS: &[&str] = &[
    "llama-3", "llama-3.1", "llama-3.2", "llama-3.3", "llama-4", "mistral", "mistral-7b",
    "mistral-small", "mixtral", "gemma", "gemma-2", "gemma-3", "phi-3", "phi-4", "phi-4-mini",
    "qwen-2.5", "qwen-3", "codellama", "starcoder", "starcoder2", "tinyllama", "orca-mini",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor", "architect", "design", "migrate", "optimize", "security", "authentication",
    "deploy", "scale", "debug complex",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "add", "create", "fix typo", "update", "rename", "style", "format", "comment", "log", "print",
];

/// Detect whether a model is smart, weak, or unknown from its name.
pub fn detect_model_tier(model_name: &str) -> &'static str {
    if model_name.is_empty() {
        return "unknown";
    }
    let lower = model_name.to_lowercase();
    if SMART_MODELS.iter().any(|m| lower.contains(m)) {
        return "smart";
    }
    if WEAK_MODELS.iter().any(|m| lower.contains(m)) {
        return "weak";
    }
    "unknown"
}

/// Best-available support for a task: playbooks, skills, solutions, and a
/// recommendation for the executing model.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SmartContext {
    /// Matching playbooks, best first
    pub playbooks: Vec<Playbook>,
    /// Matching skills
    pub skills: Vec<Skill>,
    /// Matching solutions
    pub solutions: Vec<Solution>,
    /// Deduped guardrails from every matching playbook
    pub guardrails: Vec<String>,
    /// Whether any playbook matched
    pub has_playbook: bool,
    /// Natural-language guidance
    pub recommendation: String,
}

/// Difficulty assessment for a task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DifficultyAssessment {
    /// easy / medium / hard
    pub difficulty: Difficulty,
    /// Whether a weak model should attempt it
    pub can_weak_model_handle: bool,
    /// smart / weak / unknown
    pub model_tier: &'static str,
    /// Natural-language guidance
    pub recommendation: String,
    /// Support counts (playbooks, skills, solutions)
    pub support_available: (usize, usize, usize),
}

/// What `record_outcome` did.
#[derive(Debug, Clone, Default)]
pub struct RecordedOutcome {
    /// The stored outcome id
    pub outcome_id: String,
    /// Auto-generated playbook, if any
    pub auto_playbook_id: Option<String>,
    /// Auto-generated skills from ready patterns
    pub auto_skills_created: usize,
}

/// Outcome recording and smart→weak knowledge transfer.
pub struct PlaybookAdvisor {
    store: PlaybookStore,
    skills: SkillStore,
    auto_skill_times: Arc<Mutex<Vec<Instant>>>,
}

impl PlaybookAdvisor {
    /// Create the advisor.
    pub fn new(store: PlaybookStore, skills: SkillStore) -> Self {
        Self {
            store,
            skills,
            auto_skill_times: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The underlying playbook store.
    pub fn store(&self) -> &PlaybookStore {
        &self.store
    }

    // ── Outcome recording ─────────────────────────────────────

    /// Record a task outcome and run the learning cascade: skill EMA
    /// updates, pattern clustering with rate-limited auto-skill generation,
    /// and auto-playbook synthesis for substantial successes.
    pub fn record_outcome(&self, outcome: &Outcome) -> Result<RecordedOutcome> {
        self.store.add_outcome(outcome)?;
        let mut recorded = RecordedOutcome {
            outcome_id: outcome.id.clone(),
            ..Default::default()
        };
        let is_success = outcome.outcome_type == OutcomeType::Success;

        // 1. Matched-skill confidence updates
        for skill_id in &outcome.skills_used {
            if let Err(e) = self.skills.update_confidence(skill_id, is_success) {
                tracing::debug!("Skill confidence update skipped: {e}");
            }
        }

        // 2. Pattern clustering + auto-skill conversion
        let keywords = extract_keywords(&outcome.task_description);
        self.store
            .record_pattern(&keywords, &outcome.technologies, is_success)?;
        recorded.auto_skills_created = self.convert_ready_patterns()?;

        // 3. Auto-playbook synthesis. The length predicate gates
        // generation; step parsing only shapes the result.
        if is_success && outcome.solution_applied.len() > MIN_SOLUTION_LEN {
            recorded.auto_playbook_id =
                self.maybe_generate_playbook(&outcome.task_description, &outcome.solution_applied, &keywords, &outcome.technologies)?;
        }

        Ok(recorded)
    }

    fn convert_ready_patterns(&self) -> Result<usize> {
        let ready = self
            .store
            .patterns_ready_for_skill(PATTERN_MIN_SUCCESSES, PATTERN_MIN_RATE)?;
        let mut created = 0;
        for (pattern_id, keywords, technologies, successes) in ready {
            if !self.can_auto_create_skill() {
                tracing::debug!("Auto-skill creation rate limit reached");
                break;
            }
            let name = format!(
                "auto_{}",
                keywords
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("_")
            );
            let mut skill = Skill::new(
                name,
                SkillType::SearchStrategy,
                format!(
                    "This pattern succeeded {successes} times. Apply the approach that worked \
                     for tasks involving: {}.",
                    keywords.join(", ")
                ),
                keywords.clone(),
                SkillSource::Observed,
            );
            skill.description = format!(
                "Auto-generated from a recurring successful pattern ({})",
                technologies.join(", ")
            );
            if self.skills.add_skill(&skill) {
                self.store.mark_pattern_converted(&pattern_id, &skill.id)?;
                self.auto_skill_times
                    .lock()
                    .expect("auto-skill lock")
                    .push(Instant::now());
                created += 1;
            }
        }
        Ok(created)
    }

    fn can_auto_create_skill(&self) -> bool {
        let mut times = self.auto_skill_times.lock().expect("auto-skill lock");
        times.retain(|t| t.elapsed().as_secs() < 3600);
        times.len() < MAX_AUTO_SKILLS_PER_HOUR
    }

    fn maybe_generate_playbook(
        &self,
        task: &str,
        solution: &str,
        keywords: &[String],
        technologies: &[String],
    ) -> Result<Option<String>> {
        // A good existing playbook means no new one
        let existing = self.store.find_playbooks(task, 1)?;
        if existing
            .first()
            .is_some_and(|p| p.match_score >= SIMILAR_PLAYBOOK_THRESHOLD)
        {
            return Ok(None);
        }

        let steps = parse_solution_steps(solution);
        let difficulty = match steps.len() {
            0..=3 => Difficulty::Easy,
            4..=7 => Difficulty::Medium,
            _ => Difficulty::Hard,
        };

        let name = if keywords.is_empty() {
            "auto-playbook".to_string()
        } else {
            format!(
                "auto-{}",
                keywords.iter().take(3).cloned().collect::<Vec<_>>().join("-")
            )
        };
        let mut playbook = Playbook::new(name, "auto-generated", steps);
        playbook.description = clip(task, 200);
        playbook.difficulty = difficulty;
        playbook.guardrails = vec![
            "Follow each step in order".to_string(),
            "Do not skip steps".to_string(),
            "If a step fails, stop and report the error".to_string(),
        ];
        playbook.technologies = technologies.to_vec();
        playbook.generated_by = "auto_from_outcome".to_string();
        playbook.confidence = 0.5;

        let id = self.store.add_playbook(&playbook)?;
        tracing::info!("Auto-generated playbook {id} from outcome");
        Ok(Some(id))
    }

    // ── Smart context ─────────────────────────────────────────

    /// Everything the library knows that could help with a task.
    pub fn get_smart_context(&self, task: &str, technologies: &[String]) -> Result<SmartContext> {
        let mut context = SmartContext::default();
        let query = if technologies.is_empty() {
            task.to_string()
        } else {
            format!("{task} {}", technologies.join(" "))
        };

        context.playbooks = self.store.find_playbooks(&query, 3)?;
        context.has_playbook = !context.playbooks.is_empty();
        for playbook in &context.playbooks {
            for guardrail in &playbook.guardrails {
                if !context.guardrails.contains(guardrail) {
                    context.guardrails.push(guardrail.clone());
                }
            }
        }
        context.skills = self.skills.find_matching_skills(&query, 0.3, 3)?;
        context.solutions = self.store.search_solutions(&query, 3)?;

        context.recommendation = if let Some(best) = context.playbooks.first() {
            format!(
                "FOLLOW THE PLAYBOOK '{}' step by step. It has {} steps and {:.0}% confidence. \
                 Do NOT skip steps. Do NOT improvise.",
                best.name,
                best.steps.len(),
                best.confidence * 100.0,
            )
        } else if !context.skills.is_empty() {
            "No playbook found, but matching skills exist. Apply the skill strategy, then \
             record the outcome to help build playbooks for next time."
                .to_string()
        } else {
            "No playbooks or skills found for this task. This may need a smart model session. \
             If you proceed, record the outcome so a playbook can be generated."
                .to_string()
        };
        Ok(context)
    }

    // ── Difficulty assessment ─────────────────────────────────

    /// Blend playbook availability, keyword classes, and model tier into a
    /// difficulty estimate.
    pub fn assess_task_difficulty(&self, task: &str, current_model: &str) -> Result<DifficultyAssessment> {
        let model_tier = detect_model_tier(current_model);
        let playbooks = self.store.find_playbooks(task, 3)?;
        let skills = self.skills.find_matching_skills(task, 0.3, 3)?;
        let solutions = self.store.search_solutions(task, 3)?;

        let mut easy = 0i32;
        let mut medium = 0i32;
        let mut hard = 0i32;

        // Playbook availability is the strongest signal
        if let Some(best) = playbooks.first().filter(|p| p.match_score > 0.3) {
            match best.difficulty {
                Difficulty::Easy => easy += 3,
                Difficulty::Medium => {
                    medium += 2;
                    easy += 1;
                }
                Difficulty::Hard => hard += 2,
            }
            if best.confidence > 0.8 {
                easy += 2;
            }
        }
        if !skills.is_empty() {
            easy += 1;
            medium += 1;
        }
        if !solutions.is_empty() {
            easy += 1;
        }

        let task_lower = task.to_lowercase();
        for kw in COMPLEX_KEYWORDS {
            if task_lower.contains(kw) {
                hard += 1;
            }
        }
        for kw in SIMPLE_KEYWORDS {
            if task_lower.contains(kw) {
                easy += 1;
            }
        }
        if playbooks.is_empty() && skills.is_empty() && solutions.is_empty() {
            hard += 2;
            medium += 1;
        }

        let (difficulty, can_weak_model_handle, recommendation) = if easy > medium && easy > hard {
            (
                Difficulty::Easy,
                true,
                "A weak/free model can handle this task.".to_string(),
            )
        } else if hard > easy && hard > medium {
            (
                Difficulty::Hard,
                false,
                "This task likely needs a smart model. Consider switching or creating a \
                 playbook first."
                    .to_string(),
            )
        } else {
            let supported = !playbooks.is_empty() || !skills.is_empty();
            (
                Difficulty::Medium,
                supported,
                if supported {
                    "A weak model can handle this WITH playbook/skill support.".to_string()
                } else {
                    "Consider using a smart model for this task.".to_string()
                },
            )
        };

        Ok(DifficultyAssessment {
            difficulty,
            can_weak_model_handle,
            model_tier,
            recommendation,
            support_available: (playbooks.len(), skills.len(), solutions.len()),
        })
    }
}

/// Parse a solution's lines into ordered steps: numbered items, `Step N:`
/// prefixes, and dash bullets all count; anything else collapses into a
/// single-step playbook.
fn parse_solution_steps(solution: &str) -> Vec<PlaybookStep> {
    let mut steps = Vec::new();
    let mut step_num = 1u32;

    for line in solution.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(action) = strip_step_prefix(trimmed) {
            steps.push(PlaybookStep {
                step: step_num,
                action: action.to_string(),
                template: None,
                verify: String::new(),
            });
            step_num += 1;
        } else if steps.is_empty() {
            // First unnumbered line becomes step 1
            steps.push(PlaybookStep {
                step: step_num,
                action: trimmed.to_string(),
                template: None,
                verify: String::new(),
            });
            step_num += 1;
        }
    }

    if steps.is_empty() {
        steps.push(PlaybookStep {
            step: 1,
            action: clip(solution, 500),
            template: None,
            verify: String::new(),
        });
    }
    steps
}

/// `1. x` / `2) x` / `Step 3: x` / `- x` → `x`
fn strip_step_prefix(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("- ") {
        return Some(rest.trim());
    }
    let lower = line.to_lowercase();
    if lower.starts_with("step ") {
        let after = &line[5..];
        let rest = after.trim_start_matches(|c: char| c.is_ascii_digit());
        if let Some(rest) = rest.strip_prefix(':').or_else(|| rest.strip_prefix('.')) {
            return Some(rest.trim());
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return Some(rest.trim());
        }
    }
    None
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
    use chrono::Utc;

    use crate::storage::test_support::scratch_db;

    fn advisor() -> (PlaybookAdvisor, tempfile::TempDir) {
        let (db, dir) = scratch_db();
        (
            PlaybookAdvisor::new(PlaybookStore::new(db.clone()), SkillStore::new(db)),
            dir,
        )
    }

    fn success_outcome(task: &str, solution: &str) -> Outcome {
        Outcome {
            id: uuid::Uuid::new_v4().to_string(),
            task_description: task.to_string(),
            solution_applied: solution.to_string(),
            outcome_type: OutcomeType::Success,
            feedback_source: "test".into(),
            skills_used: vec![],
            technologies: vec!["docker".into()],
            error_if_failed: None,
            timestamp: Utc::now(),
        }
    }

    const NUMBERED_SOLUTION: &str = "1. Build the image with the updated Dockerfile\n\
        2. Push it to the registry under the release tag\n\
        3. Roll the deployment with kubectl set image\n\
        4. Watch the rollout status until it converges\n\
        5. Smoke-test the health endpoint from outside the cluster";

    #[test]
    fn test_model_tier_detection() {
        assert_eq!(detect_model_tier("claude-3.5-sonnet-20241022"), "smart");
        assert_eq!(detect_model_tier("gpt-4o-2024-05-13"), "smart");
        assert_eq!(detect_model_tier("llama-3.1-8b-instruct"), "weak");
        assert_eq!(detect_model_tier("phi-4-mini"), "weak");
        assert_eq!(detect_model_tier("mystery-model"), "unknown");
        assert_eq!(detect_model_tier(""), "unknown");
    }

    #[test]
    fn test_step_parsing() {
        let steps = parse_solution_steps(NUMBERED_SOLUTION);
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[0].action, "Build the image with the updated Dockerfile");
        assert_eq!(steps[4].step, 5);

        let dash = parse_solution_steps("- first\n- second");
        assert_eq!(dash.len(), 2);

        let prose = parse_solution_steps("Restart the service and it recovers.");
        assert_eq!(prose.len(), 1);
    }

    #[test]
    fn test_auto_playbook_from_successful_outcome() {
        let (advisor, _dir) = advisor();
        let outcome = success_outcome("deploy the docker image to production", NUMBERED_SOLUTION);
        let recorded = advisor.record_outcome(&outcome).unwrap();

        let playbook_id = recorded.auto_playbook_id.expect("playbook generated");
        let playbook = advisor.store().get_playbook(&playbook_id).unwrap().unwrap();
        assert_eq!(playbook.generated_by, "auto_from_outcome");
        assert_eq!(playbook.difficulty, Difficulty::Medium);
        assert_eq!(playbook.steps.len(), 5);
        assert!((playbook.confidence - 0.5).abs() < f64::EPSILON);
        assert!(!playbook.guardrails.is_empty());
    }

    #[test]
    fn test_short_solution_generates_nothing() {
        let (advisor, _dir) = advisor();
        let outcome = success_outcome("restart the service", "Just restart it.");
        let recorded = advisor.record_outcome(&outcome).unwrap();
        assert!(recorded.auto_playbook_id.is_none());
    }

    #[test]
    fn test_failure_generates_nothing() {
        let (advisor, _dir) = advisor();
        let mut outcome = success_outcome("deploy the docker image", NUMBERED_SOLUTION);
        outcome.outcome_type = OutcomeType::Failure;
        let recorded = advisor.record_outcome(&outcome).unwrap();
        assert!(recorded.auto_playbook_id.is_none());
    }

    #[test]
    fn test_no_duplicate_playbook_for_similar_task() {
        let (advisor, _dir) = advisor();
        let first = advisor
            .record_outcome(&success_outcome(
                "deploy the docker image to production",
                NUMBERED_SOLUTION,
            ))
            .unwrap();
        assert!(first.auto_playbook_id.is_some());

        let second = advisor
            .record_outcome(&success_outcome(
                "deploy the docker image to production",
                NUMBERED_SOLUTION,
            ))
            .unwrap();
        assert!(second.auto_playbook_id.is_none());
    }

    #[test]
    fn test_auto_skill_from_recurring_pattern() {
        let (advisor, _dir) = advisor();
        let mut total_skills = 0;
        for _ in 0..3 {
            let recorded = advisor
                .record_outcome(&success_outcome(
                    "configure the docker registry mirror",
                    "Point the daemon at the internal mirror and restart. The mirror caches \
                     upstream layers so pulls stay fast even when the upstream registry is slow.",
                ))
                .unwrap();
            total_skills += recorded.auto_skills_created;
        }
        assert_eq!(total_skills, 1);
    }

    #[test]
    fn test_smart_context_recommendation_ladder() {
        let (advisor, _dir) = advisor();

        // Nothing known yet
        let empty = advisor.get_smart_context("publish the helm chart", &[]).unwrap();
        assert!(!empty.has_playbook);
        assert!(empty.recommendation.contains("smart model"));

        // With a playbook
        advisor
            .record_outcome(&success_outcome(
                "deploy the docker image to production",
                NUMBERED_SOLUTION,
            ))
            .unwrap();
        let with_playbook = advisor
            .get_smart_context("deploy the docker image to production", &[])
            .unwrap();
        assert!(with_playbook.has_playbook);
        assert!(with_playbook.recommendation.contains("FOLLOW THE PLAYBOOK"));
        assert!(!with_playbook.guardrails.is_empty());
    }

    #[test]
    fn test_difficulty_assessment() {
        let (advisor, _dir) = advisor();

        // Nothing known + complex keyword: hard
        let hard = advisor
            .assess_task_difficulty("refactor the authentication architecture", "llama-3.1-8b")
            .unwrap();
        assert_eq!(hard.difficulty, Difficulty::Hard);
        assert!(!hard.can_weak_model_handle);
        assert_eq!(hard.model_tier, "weak");

        // With a high-confidence playbook the same shape of task eases
        advisor
            .record_outcome(&success_outcome(
                "add a prometheus scrape target",
                "1. Add the job to the scrape config list first\n2. Reload the prometheus \
                 configuration and confirm the target shows up healthy",
            ))
            .unwrap();
        let assisted = advisor
            .assess_task_difficulty("add a prometheus scrape target", "llama-3.1-8b")
            .unwrap();
        assert!(assisted.can_weak_model_handle);
        assert_ne!(assisted.difficulty, Difficulty::Hard);
    }
}
