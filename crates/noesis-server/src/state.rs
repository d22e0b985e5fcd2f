//! Application wiring
//!
//! Every store and engine is constructed once at startup and shared through
//! an immutable context value. There is no late dependency injection: a
//! component that needs a store receives it here or not at all.

use std::path::PathBuf;
use std::sync::Arc;

use noesis_core::prelude::*;
use noesis_core::{
    CorrectionLearner, CurriculumEngine, HeuristicEntityExtractor, NullDocumentSource,
    NullEmailGateway, PlaybookStore, QueryClassifier, ReflectionEngine, ResponseEvaluator,
    RetrievalLearner, SkillExtractor as VoyagerSkillExtractor,
};

/// Shared application context.
#[derive(Clone)]
pub struct AppContext {
    /// Message persistence + hybrid history search
    pub messages: MessageStore,
    /// Memory notes
    pub memory: MemoryStore,
    /// Per-user LLM settings
    pub settings: SettingsStore,
    /// Prompt assembly
    pub assembler: Arc<ContextAssembler>,
    /// Post-response processing
    pub outlet: OutletPipeline,
    /// Skill learning
    pub voyager: SkillVoyager,
    /// Correction feedback
    pub corrections: CorrectionLearner,
    /// Outcome recording and smart context
    pub advisor: Arc<PlaybookAdvisor>,
    /// Background task tracking
    pub runner: TaskRunner,
}

impl AppContext {
    /// Open the database and wire every component.
    pub fn build(db_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let db = Arc::new(Database::open(db_path)?);

        let messages = MessageStore::new(db.clone());
        let memory = MemoryStore::new(db.clone(), None)?;
        let entity_extractor = Arc::new(HeuristicEntityExtractor::new());
        let graph = GraphStore::new(db.clone(), entity_extractor.clone());
        let settings = SettingsStore::new(db.clone());
        let schedule = noesis_core::ScheduleStore::new(db.clone());
        let expenses = noesis_core::ExpenseStore::new(db.clone());
        let email = Arc::new(NullEmailGateway);
        let runner = TaskRunner::new();

        let planner = Arc::new(RetrievalPlanner::new(db.clone()));
        let assembler = Arc::new(ContextAssembler::new(
            planner,
            messages.clone(),
            memory.clone(),
            graph.clone(),
            schedule.clone(),
            expenses.clone(),
            email.clone(),
            Arc::new(NullDocumentSource),
        ));

        let skill_store = SkillStore::new(db.clone());
        let voyager = SkillVoyager::new(
            QueryClassifier::new(),
            skill_store.clone(),
            ResponseEvaluator::new(skill_store.clone(), None),
            ReflectionEngine::new(db.clone(), skill_store.clone(), None),
            VoyagerSkillExtractor::new(skill_store.clone(), None),
            CurriculumEngine::new(skill_store.clone()),
            RetrievalLearner::new(db.clone()),
            runner.clone(),
        );
        let seeded = voyager.initialize()?;
        if seeded > 0 {
            tracing::info!("Seeded {seeded} curriculum skills into an empty library");
        }

        let outlet = OutletPipeline::new(
            memory.clone(),
            graph.clone(),
            messages.clone(),
            schedule,
            expenses,
            email,
            entity_extractor,
            None,
            runner.clone(),
        );

        let corrections = CorrectionLearner::new(db.clone(), skill_store.clone());
        let advisor = Arc::new(PlaybookAdvisor::new(PlaybookStore::new(db), skill_store));

        Ok(Self {
            messages,
            memory,
            settings,
            assembler,
            outlet,
            voyager,
            corrections,
            advisor,
            runner,
        })
    }

    /// Build the configured provider for a user, if their settings name one.
    pub fn provider_for(&self, settings: &LlmSettings) -> Option<Arc<dyn LlmProvider>> {
        let (name, provider_settings) = settings.active_provider()?;
        let base_url = provider_settings
            .base_url
            .clone()
            .unwrap_or_else(|| match name {
                "ollama" => "http://localhost:11434/v1".to_string(),
                "lmstudio" => "http://localhost:1234/v1".to_string(),
                _ => "https://api.openai.com/v1".to_string(),
            });
        let model = settings
            .default_model
            .clone()
            .or_else(|| provider_settings.default_model.clone())
            .unwrap_or_else(|| "local-model".to_string());
        Some(Arc::new(noesis_core::OpenAiCompatProvider::new(
            name,
            provider_settings.api_key.clone(),
            base_url,
            model,
        )))
    }
}
