//! Cross-cutting invariants exercised through the public API

use noesis_core::llm::prompt::{
    PromptContext, WEB_SEARCH_MAX_BUDGET, estimate_tokens, format_messages_with_context,
};
use noesis_core::prelude::*;
use noesis_core::{
    CACHE_BREAK, ImageAttachment, ProviderMessage, RetrievalDecision, inject_images_into_messages,
    is_valid_entity, outlet,
};
use noesis_e2e::harness::TestEngine;

fn section(word: &str, tokens: usize) -> String {
    // Each line is 15 chars + newline = 16 chars ≈ 4 tokens
    (0..tokens / 4)
        .map(|i| format!("{:<15}", format!("{word} {i:05}")))
        .collect::<Vec<_>>()
        .join("\n")
}

// Property 1 + S3: the dynamic context respects the budget; web search has
// its own sub-budget; lowest-priority sections drop first
#[test]
fn budget_overflow_truncates_in_priority_order() {
    let ctx = PromptContext {
        web_search_context: Some(section("web", 3500)),
        notes_context: Some(section("note", 4000)),
        rag_context: Some(section("doc", 3000)),
        memories: (0..1500).map(|i| format!("memory number {i}")).collect(),
        graph_context: Some(section("graph", 500)),
        context_budget: 8000,
        has_web_search: true,
        ..Default::default()
    };
    let formatted = format_messages_with_context(&[], &ctx);
    let system = formatted[0].content_text().unwrap();
    let (_, dynamic) = system.split_once(CACHE_BREAK).unwrap();

    // Web injected fully (3500 ≤ 4000), notes and docs fully
    assert!(dynamic.contains("web 00000"));
    assert!(dynamic.contains("note 00000"));
    assert!(dynamic.contains("doc 00000"));
    // Memories truncated with the marker; graph dropped entirely
    assert!(dynamic.contains("memory number 0"));
    assert!(dynamic.contains("[...truncated to fit context budget]"));
    assert!(!dynamic.contains("graph 00000"));

    // Budget math: non-web sections fit in the budget, web in its own
    let web_len = dynamic
        .split("\n\n")
        .filter(|part| part.contains("web 00000"))
        .map(estimate_tokens)
        .sum::<usize>();
    assert!(web_len <= WEB_SEARCH_MAX_BUDGET + 16);
    let non_web: usize = dynamic
        .split("\n\n")
        .filter(|part| {
            part.contains("note 00000") || part.contains("doc 00000") || part.contains("memory number")
        })
        .map(estimate_tokens)
        .sum();
    assert!(non_web <= 8000 + 16, "non-web context was {non_web} tokens");
}

// Property 2: no-vision image injection leaves exactly one user message
// carrying the attachment note
#[test]
fn image_note_for_text_only_models() {
    let messages = vec![
        ProviderMessage::text("system", "persona"),
        ProviderMessage::text("user", "what's in the picture?"),
    ];
    let images = vec![ImageAttachment {
        filename: "photo.jpg".into(),
        content_type: "image/jpeg".into(),
        data_base64: "aGVsbG8=".into(),
    }];
    let result = inject_images_into_messages(messages, &images, false, "openai");

    let user_messages: Vec<&ProviderMessage> =
        result.iter().filter(|m| m.role == "user").collect();
    assert_eq!(user_messages.len(), 1);
    let text = user_messages[0].content_text().unwrap();
    assert!(text.contains("[User attached image(s): photo.jpg"));
    assert!(text.ends_with("]"));
}

// Property 3: link symmetry holds after every add_memory call
#[tokio::test]
async fn memory_links_are_symmetric() {
    let engine = TestEngine::new();
    let first = engine
        .memory
        .add_memory("The staging cluster runs Kubernetes 1.30", "u1", "c1")
        .await
        .unwrap()
        .note
        .unwrap();
    let second = engine
        .memory
        .add_memory("Kubernetes 1.30 staging cluster upgrade notes", "u1", "c2")
        .await
        .unwrap();

    for linked_id in &second.linked {
        let linked_note = engine.memory.get_note(linked_id).unwrap().unwrap();
        let new_note = second.note.as_ref().unwrap();
        assert!(linked_note.linked_memories.contains(&new_note.id));
        assert!(new_note.linked_memories.contains(linked_id));
    }
    assert!(second.linked.contains(&first.id));
}

// Property 6: entity validity is idempotent and rejects the documented junk
#[test]
fn entity_validity_filter() {
    let rejected = [
        "i", "you", "he", "we", "1.", "1-2", "def foo", "x => y", "print(value)",
        "AddinConfig", "MessageRouter", "RequestHandler", "line\nbreak",
    ];
    for name in rejected {
        assert!(!is_valid_entity(name), "{name:?} should be rejected");
        assert_eq!(is_valid_entity(name), is_valid_entity(name));
    }
    let long = "x".repeat(81);
    assert!(!is_valid_entity(&long));
    for name in ["Python", "Neo4j", "my team's roadmap"] {
        assert!(is_valid_entity(name), "{name:?} should pass");
    }
}

// Property 7: memory triggers never plan `none`
#[test]
fn memory_triggers_always_retrieve() {
    let engine = TestEngine::new();
    for query in [
        "remember what we chose for the cache?",
        "as I mentioned, the deadline moved",
        "what did we decide about sharding",
        "my setup needs the dark theme",
    ] {
        let plan = engine.assembler.planner().analyze(query, &[]);
        assert_ne!(plan.decision, RetrievalDecision::None, "{query}");
    }
}

// Property 8: marker extraction → reinsertion → re-extraction is lossless
#[test]
fn marker_roundtrip() {
    let original = "preamble\n\
        [SAVE_NOTE: Q3 Plan]\nShip the migration\n[/SAVE_NOTE]\n\
        middle text\n\
        [SEND_EMAIL: Status | boss@example.com]\nAll on track.\n[/SEND_EMAIL]\n\
        tail";
    let first = outlet::scan(original);
    assert_eq!(first.markers.len(), 2);

    let reinserted = first
        .markers
        .iter()
        .map(outlet::markers::render)
        .collect::<Vec<_>>()
        .join("\n");
    let second = outlet::scan(&reinserted);

    let summary = |markers: &[outlet::ActionMarker]| {
        markers
            .iter()
            .map(|m| {
                (
                    m.kind,
                    m.head.clone(),
                    m.extra.clone(),
                    m.body.clone(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(summary(&first.markers), summary(&second.markers));
}

// Property 10: pruning is idempotent
#[tokio::test]
async fn graph_pruning_idempotent() {
    let engine = TestEngine::new();
    let mut stale = noesis_core::GraphNode::new("forgotten topic", "u1", "concept");
    stale.last_seen = chrono::Utc::now() - chrono::Duration::days(200);
    engine.graph.add_node(&stale).unwrap();

    let first = engine.graph.prune_stale_nodes("u1", 90, 0).unwrap();
    assert_eq!(first.orphaned_removed, 1);
    let second = engine.graph.prune_stale_nodes("u1", 90, 0).unwrap();
    assert_eq!(second.orphaned_removed, 0);
    assert_eq!(second.invalid_removed, 0);
}

// Background learning tolerates later turns starting first
#[tokio::test]
async fn learning_completes_after_later_turns() {
    let engine = TestEngine::new();
    let ctx1 = RequestContext::new("u1", "c1");
    let ctx2 = RequestContext::new("u1", "c2");

    // Two turns' learning spawned back to back, drained once
    engine
        .outlet
        .spawn_learning(
            ctx1,
            "I prefer explicit error types in my code".to_string(),
            "Noted, explicit error types it is.".to_string(),
        )
        .await;
    engine
        .outlet
        .spawn_learning(
            ctx2,
            "we use terraform for all infrastructure".to_string(),
            "Terraform everywhere, got it.".to_string(),
        )
        .await;
    engine.outlet.drain_learning().await;

    let first = engine.memory.search("u1", "explicit error types", 5).unwrap();
    let second = engine.memory.search("u1", "terraform infrastructure", 5).unwrap();
    assert!(!first.is_empty());
    assert!(!second.is_empty());
}
