//! End-to-end exercises of the generation pipeline: dispatcher → lane →
//! gateway, with ledger and memory bookkeeping observed from outside.

use async_trait::async_trait;
use kotoba::config::ReliabilityConfig;
use kotoba::error::{GatewayError, WorkerError};
use kotoba::ledger::ConversationLedger;
use kotoba::memory::{MemoryFilter, NewMemory, SqliteMemoryStore};
use kotoba::providers::{Completion, GeminiGateway, ImageAttachment, ModelGateway};
use kotoba::worker::RequestDispatcher;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

struct ScriptedGateway {
    calls: Arc<AtomicUsize>,
    fail_first: usize,
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn invoke(
        &self,
        prompt: &str,
        _history: &[String],
        _image: Option<&ImageAttachment>,
    ) -> Result<Completion, GatewayError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(GatewayError::ServiceUnavailable("scripted outage".into()));
        }
        Ok(Completion::text_only(format!("answer: {prompt}")))
    }
}

fn fast_reliability() -> ReliabilityConfig {
    ReliabilityConfig {
        max_retries: 3,
        base_delay_ms: 1,
        queue_submissions: false,
    }
}

#[tokio::test]
async fn n_successful_generations_sum_into_the_ledger_total() {
    let gateway = Arc::new(ScriptedGateway {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first: 0,
    });
    let dispatcher = RequestDispatcher::new(gateway, &fast_reliability(), None);
    let ledger = ConversationLedger::new();

    let mut expected_total = 0;
    for prompt in ["one", "two words here", "three little words now"] {
        let reply = dispatcher
            .submit("s", &ledger, prompt, None, None)
            .await
            .unwrap();
        expected_total += reply.tokens_used;
    }

    let (total, history) = ledger.usage_snapshot();
    assert_eq!(total, expected_total);
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().map(|r| r.tokens).sum::<u64>(), total);
    dispatcher.shutdown();
}

#[tokio::test]
async fn reset_between_generations_counts_only_the_later_one() {
    let gateway = Arc::new(ScriptedGateway {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first: 0,
    });
    let dispatcher = RequestDispatcher::new(gateway, &fast_reliability(), None);
    let ledger = ConversationLedger::new();

    dispatcher
        .submit("s", &ledger, "first generation", None, None)
        .await
        .unwrap();
    ledger.reset_token_usage();
    let reply = dispatcher
        .submit("s", &ledger, "second generation", None, None)
        .await
        .unwrap();

    assert_eq!(ledger.current_total(), reply.tokens_used);
    let (_, history) = ledger.usage_snapshot();
    assert_eq!(history.len(), 1);
    dispatcher.shutdown();
}

#[tokio::test]
async fn retry_recovers_within_the_attempt_budget() {
    let calls = Arc::new(AtomicUsize::new(0));
    let gateway = Arc::new(ScriptedGateway {
        calls: Arc::clone(&calls),
        fail_first: 2,
    });
    let dispatcher = RequestDispatcher::new(gateway, &fast_reliability(), None);
    let ledger = ConversationLedger::new();

    let reply = dispatcher
        .submit("s", &ledger, "eventually works", None, None)
        .await
        .unwrap();
    assert_eq!(reply.text, "answer: eventually works");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(ledger.message_count(), 1);
    dispatcher.shutdown();
}

#[tokio::test]
async fn exhausted_retries_surface_the_wrapped_cause_and_leave_no_trace() {
    let gateway = Arc::new(ScriptedGateway {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first: usize::MAX,
    });
    let dispatcher = RequestDispatcher::new(gateway, &fast_reliability(), None);
    let ledger = ConversationLedger::new();

    let error = dispatcher
        .submit("s", &ledger, "never works", None, None)
        .await
        .unwrap_err();
    match error {
        WorkerError::RetryExhausted { source, attempts } => {
            assert!(matches!(source, GatewayError::ServiceUnavailable(_)));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
    assert!(ledger.history_snapshot().is_empty());
    assert_eq!(ledger.current_total(), 0);
    dispatcher.shutdown();
}

#[tokio::test]
async fn saved_conversation_restores_without_duplication() {
    let gateway = Arc::new(ScriptedGateway {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first: 0,
    });
    let dispatcher = RequestDispatcher::new(gateway, &fast_reliability(), None);
    let ledger = ConversationLedger::new();
    let dir = tempfile::TempDir::new().unwrap();
    let store = SqliteMemoryStore::open(&dir.path().join("kotoba.db")).unwrap();

    dispatcher
        .submit("s", &ledger, "what is rust", None, None)
        .await
        .unwrap();

    // Save the live conversation as a memory.
    let id = store
        .create(NewMemory {
            title: "Rust chat".into(),
            content: "a chat about rust".into(),
            character_id: "default".into(),
            character_name: "Kotoba".into(),
            conversation: ledger.history_snapshot(),
            category: Default::default(),
            tags: vec!["rust".into()],
            importance: Default::default(),
        })
        .unwrap();

    // Resume it in a fresh ledger and continue the conversation.
    let resumed = ConversationLedger::new();
    let memory = store.get(&id).unwrap().unwrap();
    resumed.replace_history(memory.conversation.clone());
    dispatcher
        .submit("s2", &resumed, "tell me more", None, None)
        .await
        .unwrap();

    let turns = resumed.history_snapshot();
    assert_eq!(turns.len(), memory.conversation.len() + 2);
    assert_eq!(turns[..2], memory.conversation[..]);

    // And the catalog can find it again by keyword, case-insensitively.
    let hits = store
        .search(&MemoryFilter {
            keyword: Some("RUST".into()),
            ..MemoryFilter::default()
        })
        .unwrap();
    assert_eq!(hits.len(), 1);
    dispatcher.shutdown();
}

#[tokio::test]
async fn real_http_gateway_retries_transient_errors_through_the_lane() {
    let server = MockServer::start().await;
    // Two outages, then a good answer — the lane's three attempts land
    // exactly one success.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "recovered" }] } }]
        })))
        .mount(&server)
        .await;

    let gateway = Arc::new(GeminiGateway::with_base_url(
        "test-key",
        "gemini-2.5-flash",
        5,
        Some(&server.uri()),
    ));
    let dispatcher = RequestDispatcher::new(gateway, &fast_reliability(), None);
    let ledger = ConversationLedger::new();

    let reply = dispatcher
        .submit("s", &ledger, "are you there", None, None)
        .await
        .unwrap();
    assert_eq!(reply.text, "recovered");
    assert_eq!(ledger.message_count(), 1);
    dispatcher.shutdown();
}
