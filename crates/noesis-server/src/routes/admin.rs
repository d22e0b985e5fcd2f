//! Health, feedback, and introspection routes

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use serde::Deserialize;

use noesis_core::{CorrectionEvent, CorrectionType, Outcome, OutcomeType};

use crate::state::AppContext;

/// `GET /api/health`
pub async fn health(State(app): State<AppContext>) -> Json<serde_json::Value> {
    let skill_stats = app.voyager.store().get_skill_stats().ok();
    Json(serde_json::json!({
        "status": "ok",
        "version": noesis_core::VERSION,
        "skills": skill_stats.map(|s| s.total_skills),
    }))
}

/// Feedback request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    /// edit / regenerate / thumbs_down / explicit
    pub feedback_type: String,
    /// Conversation the feedback applies to
    pub conversation_id: String,
    /// Message the feedback applies to
    pub message_id: String,
    /// Original response snippet
    #[serde(default)]
    pub original_snippet: String,
    /// Corrected text (for edits)
    #[serde(default)]
    pub corrected_snippet: String,
    /// Classification of the original query, if known
    #[serde(default)]
    pub query_type: String,
}

/// `POST /api/feedback` — negative user signals decay the confidence of the
/// skill that produced the rejected response.
pub async fn feedback(
    State(app): State<AppContext>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let Some(correction_type) = CorrectionType::parse_name(&request.feedback_type) else {
        return Err(StatusCode::BAD_REQUEST);
    };

    let skill_id = app
        .corrections
        .skill_for_message(&request.message_id)
        .ok()
        .flatten()
        .unwrap_or_default();
    let skill_name = if skill_id.is_empty() {
        String::new()
    } else {
        app.voyager
            .store()
            .get_skill(&skill_id)
            .ok()
            .flatten()
            .map(|s| s.name)
            .unwrap_or_default()
    };

    let event = CorrectionEvent {
        correction_type,
        conversation_id: request.conversation_id,
        message_id: request.message_id,
        original_snippet: request.original_snippet,
        corrected_snippet: request.corrected_snippet,
        skill_id,
        skill_name,
        query_type: request.query_type,
        timestamp: Utc::now(),
    };

    match app.corrections.record_correction(&event) {
        Ok(result) => Ok(Json(serde_json::json!({
            "recorded": true,
            "confidenceChange": result.confidence_change,
            "newConfidence": result.new_confidence,
        }))),
        Err(e) => {
            tracing::error!("Failed to record correction: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `GET /api/skills/stats`
pub async fn skill_stats(
    State(app): State<AppContext>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let stats = app
        .voyager
        .store()
        .get_skill_stats()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!(stats)))
}

/// `GET /api/learning/stats`
pub async fn learning_stats(
    State(app): State<AppContext>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let retrieval = app
        .voyager
        .retrieval_learner()
        .stats_summary()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let planner = app.assembler.planner().learning_stats();
    let corrections = app
        .corrections
        .correction_stats()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({
        "retrieval": retrieval,
        "planner": planner,
        "corrections": corrections,
        "exploration": app.voyager.reflection().exploration_map(),
    })))
}

/// Outcome recording body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRequest {
    /// What was attempted
    pub task_description: String,
    /// The applied solution
    #[serde(default)]
    pub solution_applied: String,
    /// success / partial_success / failure / unknown
    pub outcome_type: String,
    /// Who judged it
    #[serde(default)]
    pub feedback_source: String,
    /// Skills that were applied
    #[serde(default)]
    pub skills_used: Vec<String>,
    /// Technologies involved
    #[serde(default)]
    pub technologies: Vec<String>,
    /// Error text for failures
    #[serde(default)]
    pub error_if_failed: Option<String>,
}

/// `POST /api/outcomes` — feeds the playbook/skill learning cascade.
pub async fn record_outcome(
    State(app): State<AppContext>,
    Json(request): Json<OutcomeRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let outcome = Outcome {
        id: uuid::Uuid::new_v4().to_string(),
        task_description: request.task_description,
        solution_applied: request.solution_applied,
        outcome_type: OutcomeType::parse_name(&request.outcome_type),
        feedback_source: request.feedback_source,
        skills_used: request.skills_used,
        technologies: request.technologies,
        error_if_failed: request.error_if_failed,
        timestamp: Utc::now(),
    };
    match app.advisor.record_outcome(&outcome) {
        Ok(recorded) => Ok(Json(serde_json::json!({
            "success": true,
            "outcomeId": recorded.outcome_id,
            "autoPlaybookId": recorded.auto_playbook_id,
            "autoSkillsCreated": recorded.auto_skills_created,
        }))),
        Err(e) => {
            tracing::error!("Failed to record outcome: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Smart-context request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartContextRequest {
    /// The task to find support for
    pub task_description: String,
    /// Technologies involved
    #[serde(default)]
    pub technologies: Vec<String>,
    /// Model that will execute the task, for difficulty assessment
    #[serde(default)]
    pub current_model: String,
}

/// `POST /api/smart-context` — playbooks, skills, solutions, and a
/// difficulty assessment for a task.
pub async fn smart_context(
    State(app): State<AppContext>,
    Json(request): Json<SmartContextRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let context = app
        .advisor
        .get_smart_context(&request.task_description, &request.technologies)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let assessment = app
        .advisor
        .assess_task_difficulty(&request.task_description, &request.current_model)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({
        "context": context,
        "assessment": assessment,
    })))
}
