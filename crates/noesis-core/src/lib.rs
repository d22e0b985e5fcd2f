//! # Noesis Core
//!
//! Cognitive augmentation engine for LLM-backed chat assistants. Wraps the
//! model with a retrieval/assembly/learning pipeline:
//!
//! - **Adaptive Retrieval Planner**: classifies each query and decides which
//!   stores to consult, with outcome-driven learning
//! - **Parallel Context Assembler**: gathers from heterogeneous stores
//!   concurrently and composes a budget-capped prompt with a cached-prefix /
//!   dynamic-suffix split
//! - **Temporal Knowledge Graph**: typed entities, dynamically-labeled
//!   relationships, multi-hop GraphRAG search, invalidation instead of
//!   deletion, community detection
//! - **Evolving Memory Store**: enriched Zettelkasten notes with
//!   bidirectional links and LLM-guided evolution
//! - **Skill Voyager**: a persistent, evaluated skill library with
//!   asymmetric-EMA confidence, reflection-driven strategy evolution, and a
//!   curriculum engine
//! - **Outlet Pipeline**: post-response action markers, injection defense,
//!   and background learning (memories, graph facts, negative knowledge)
//! - **Playbooks**: smart→weak knowledge transfer with auto-generation from
//!   recorded outcomes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use noesis_core::prelude::*;
//!
//! let db = Arc::new(Database::open(None)?);
//! let planner = RetrievalPlanner::new(db.clone());
//! let plan = planner.analyze("like I said, our project uses FastAPI", &[]);
//! assert_eq!(plan.decision, RetrievalDecision::Memory);
//! ```
//!
//! ## Feature Flags
//!
//! - `embeddings`: local embedding generation with fastembed
//! - `vector-search`: HNSW vector search with USearch
//! - `full`: both
//!
//! Without the features, retrieval runs on SQLite FTS5 with keyword-overlap
//! similarity; every pipeline stage has that degraded path built in.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod assembler;
pub mod config;
pub mod context;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod outlet;
pub mod planner;
pub mod playbook;
pub mod runtime;
pub mod search;
pub mod skills;
pub mod storage;
pub mod websearch;

#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
pub mod embeddings;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use assembler::{AssembledContext, ContextAssembler, DocumentSource, NullDocumentSource, PreflightCache};
pub use config::{BraveSearchSettings, LlmSettings, OptimizationSettings, ProviderSettings, SettingsStore};
pub use context::{ChatMessage, ImageAttachment, RequestContext, Role};
pub use graph::{
    EntityContext, EntityExtractor, GraphNode, GraphRelationship, GraphStore,
    HeuristicEntityExtractor, PruneStats, is_valid_entity, sanitize_label,
};
pub use llm::{
    LlmError, LlmProvider, LlmResponse, ModelInfo, OpenAiCompatProvider, ProviderMessage,
    StreamChunk, TokenUsage, extract_json_object, parse_json_from_text,
};
pub use llm::prompt::{CACHE_BREAK, PromptContext, format_messages_with_context, inject_images_into_messages};
pub use memory::{MemoryNote, MemoryStore};
pub use outlet::{
    EmailGateway, ExpenseStore, NullEmailGateway, OutletOutcome, OutletPipeline, ScheduleStore,
};
pub use planner::{
    QueryComplexity, RetrievalDecision, RetrievalPlan, RetrievalPlanner, RetrievalSources,
};
pub use playbook::{
    Difficulty, DifficultyAssessment, Outcome, OutcomeType, Playbook, PlaybookAdvisor,
    PlaybookStep, PlaybookStore, SmartContext, detect_model_tier,
};
pub use runtime::TaskRunner;
pub use skills::{
    CorrectionEvent, CorrectionLearner, CorrectionType, CurriculumEngine, QueryClassification,
    QueryClassifier, Reflection, ReflectionEngine, ResponseEvaluator, RetrievalLearner,
    RetrievalOutcome, RootCause, Skill, SkillEvaluation, SkillExtractor, SkillSource, SkillState,
    SkillStats, SkillStore, SkillType, SkillVoyager,
};
pub use skills::voyager::{RetrievalActivity, TurnLearningState};
pub use storage::{Database, HistoryHit, MessageStore, StorageError};
pub use websearch::{BraveSearchClient, WebResult, should_web_search};

#[cfg(feature = "embeddings")]
pub use embeddings::{EmbeddingService, EMBEDDING_DIMENSIONS};

#[cfg(feature = "vector-search")]
pub use search::VectorIndex;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{
        ChatMessage, ContextAssembler, Database, GraphStore, LlmProvider, LlmSettings,
        MemoryStore, MessageStore, OutletPipeline, PlaybookAdvisor, RequestContext,
        RetrievalDecision, RetrievalPlanner, Role, SettingsStore, Skill, SkillStore,
        SkillVoyager, TaskRunner,
    };
}
