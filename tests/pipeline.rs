use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use mail_harness::assistant::{ContextRef, RetrievalMode};
use mail_harness::cancel::Cancellation;
use mail_harness::config::{Config, SyncConfig};
use mail_harness::embedding::HashProvider;
use mail_harness::index::VectorIndex;
use mail_harness::intent::Intent;
use mail_harness::llm::{Generation, LlmClient, LlmError};
use mail_harness::models::{Provenance, Sentiment, User};
use mail_harness::pipeline::Pipeline;
use mail_harness::provider::{MailProvider, MessagePage, ProviderError, RawBody, RawMessage};
use mail_harness::store::MessageStore;
use mail_harness::sync::{SyncEngine, SyncError};
use mail_harness::vector_store::memory::InMemoryVectorStore;
use mail_harness::vector_store::{VectorFilter, VectorHit, VectorRecord, VectorStore};
use mail_harness::{db, migrate, threads};

// ============ Collaborators ============

/// Serves whatever it currently holds as a single page with no cursor.
#[derive(Default)]
struct MailboxProvider {
    messages: Mutex<Vec<RawMessage>>,
}

impl MailboxProvider {
    fn set(&self, messages: Vec<RawMessage>) {
        *self.messages.lock().unwrap() = messages;
    }
}

#[async_trait]
impl MailProvider for MailboxProvider {
    fn name(&self) -> &str {
        "mailbox"
    }

    async fn list_messages(
        &self,
        _cursor: Option<&str>,
        _folder: &str,
        _limit: usize,
    ) -> Result<MessagePage, ProviderError> {
        Ok(MessagePage {
            messages: self.messages.lock().unwrap().clone(),
            next_cursor: None,
        })
    }

    async fn get_message_body(&self, provider_id: &str) -> Result<RawBody, ProviderError> {
        Err(ProviderError::NotFound(provider_id.to_string()))
    }
}

/// Serves a fixed mailbox in pages addressed by offset cursors.
struct PagedMailbox {
    messages: Vec<RawMessage>,
    calls: Mutex<usize>,
    /// Page size used instead of the requested limit.
    fixed_page: Option<usize>,
    /// 1-based call that fails with expired credentials.
    fail_on_call: Option<usize>,
    /// 1-based call on which the given token gets cancelled.
    cancel_on_call: Option<(usize, Cancellation)>,
}

impl PagedMailbox {
    fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages,
            calls: Mutex::new(0),
            fixed_page: None,
            fail_on_call: None,
            cancel_on_call: None,
        }
    }
}

#[async_trait]
impl MailProvider for PagedMailbox {
    fn name(&self) -> &str {
        "paged"
    }

    async fn list_messages(
        &self,
        cursor: Option<&str>,
        _folder: &str,
        limit: usize,
    ) -> Result<MessagePage, ProviderError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if self.fail_on_call == Some(call) {
            return Err(ProviderError::AuthExpired("token revoked".into()));
        }
        if let Some((at, cancel)) = &self.cancel_on_call {
            if *at == call {
                cancel.cancel();
            }
        }

        let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let end = (start + self.fixed_page.unwrap_or(limit)).min(self.messages.len());
        Ok(MessagePage {
            messages: self.messages[start..end].to_vec(),
            next_cursor: (end < self.messages.len()).then(|| end.to_string()),
        })
    }

    async fn get_message_body(&self, provider_id: &str) -> Result<RawBody, ProviderError> {
        Err(ProviderError::NotFound(provider_id.to_string()))
    }
}

fn weekly_updates(count: usize) -> Vec<RawMessage> {
    (1..=count)
        .map(|i| {
            raw(
                &format!("p{}", i),
                &format!("c{}", i),
                &format!("Update {}", i),
                "Status report for the week",
                i as u32,
                false,
            )
        })
        .collect()
}

/// Echoes the assistant prompt back; refuses enrichment prompts.
struct EchoLlm;

#[async_trait]
impl LlmClient for EchoLlm {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, prompt: &str, system: &str) -> Result<Generation, LlmError> {
        if system.starts_with("You are an AI assistant helping") {
            Ok(Generation {
                text: format!("Here is what I found.\n{}", prompt),
                done: true,
            })
        } else {
            Err(LlmError::Unavailable("enrichment model offline".into()))
        }
    }
}

struct SlowLlm;

#[async_trait]
impl LlmClient for SlowLlm {
    fn model_name(&self) -> &str {
        "slow"
    }

    async fn generate(&self, _prompt: &str, _system: &str) -> Result<Generation, LlmError> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(Generation {
            text: r#"{"summary": "late", "tags": [], "sentiment": "positive", "priority_score": 1}"#
                .into(),
            done: true,
        })
    }
}

/// In-memory vector store that can be switched off.
#[derive(Default)]
struct SwitchableStore {
    inner: InMemoryVectorStore,
    down: AtomicBool,
}

impl SwitchableStore {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("vector store connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for SwitchableStore {
    async fn upsert(&self, records: &[VectorRecord]) -> anyhow::Result<()> {
        self.check()?;
        self.inner.upsert(records).await
    }

    async fn query(
        &self,
        vector: &[f32],
        user_id: i64,
        k: usize,
        exclude_message: Option<i64>,
    ) -> anyhow::Result<Vec<VectorHit>> {
        self.check()?;
        self.inner.query(vector, user_id, k, exclude_message).await
    }

    async fn get_vector(&self, user_id: i64, message_id: i64) -> anyhow::Result<Option<Vec<f32>>> {
        self.check()?;
        self.inner.get_vector(user_id, message_id).await
    }

    async fn delete(&self, filter: &VectorFilter) -> anyhow::Result<usize> {
        self.check()?;
        self.inner.delete(filter).await
    }
}

// ============ Fixtures ============

struct Harness<P = MailboxProvider> {
    _tmp: TempDir,
    pipeline: Pipeline,
    provider: Arc<P>,
    vectors: Arc<SwitchableStore>,
}

async fn harness(llm: Arc<dyn LlmClient>) -> Harness {
    harness_with(llm, Arc::new(MailboxProvider::default()), 50).await
}

async fn harness_with<P: MailProvider + 'static>(
    llm: Arc<dyn LlmClient>,
    provider: Arc<P>,
    page_size: usize,
) -> Harness<P> {
    let tmp = TempDir::new().unwrap();
    let config: Config = toml::from_str(&format!(
        r#"
[db]
path = "{}/mail.sqlite"

[llm]
timeout_secs = 1

[sync]
retry_base_ms = 1
page_size = {}
"#,
        tmp.path().display(),
        page_size
    ))
    .unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();

    let vectors = Arc::new(SwitchableStore::default());
    let index = Arc::new(VectorIndex::new(
        vectors.clone(),
        Arc::new(HashProvider::new(256)),
        2000,
        Duration::from_secs(5),
    ));

    let shared = provider.clone();
    let pipeline = Pipeline::new(
        config,
        MessageStore::new(pool),
        Arc::new(
            move |_: &Config, _: &User| -> anyhow::Result<Arc<dyn MailProvider>> {
                Ok(shared.clone())
            },
        ),
        llm,
        Some(index),
    );

    Harness {
        _tmp: tmp,
        pipeline,
        provider,
        vectors,
    }
}

fn raw(id: &str, conversation: &str, subject: &str, body: &str, day: u32, is_read: bool) -> RawMessage {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "conversationId": conversation,
        "subject": subject,
        "sender": { "emailAddress": { "address": "ana@example.com", "name": "Ana" } },
        "toRecipients": [ { "emailAddress": { "address": "me@example.com", "name": "Me" } } ],
        "body": { "contentType": "text", "content": body },
        "receivedDateTime": format!("2024-03-{:02}T09:00:00Z", day),
        "isRead": is_read
    }))
    .unwrap()
}

async fn user<P>(h: &Harness<P>, email: &str) -> User {
    h.pipeline.store().ensure_user(email, Some("Me"), None).await.unwrap()
}

async fn message_rows<P>(h: &Harness<P>, user_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(h.pipeline.store().pool())
        .await
        .unwrap()
}

async fn assert_thread_invariant<P>(h: &Harness<P>, user_id: i64) {
    let mismatched: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM threads t
        WHERE t.user_id = ?
          AND t.message_count != (
            SELECT COUNT(*) FROM messages m
            WHERE m.user_id = t.user_id AND m.conversation_key = t.conversation_key
          )
        "#,
    )
    .bind(user_id)
    .fetch_one(h.pipeline.store().pool())
    .await
    .unwrap();
    assert_eq!(mismatched, 0, "thread message_count out of sync with members");
}

// ============ Sync ============

#[tokio::test]
async fn scenario_a_new_and_changed_messages() {
    let h = harness(Arc::new(EchoLlm)).await;
    let me = user(&h, "me@example.com").await;

    h.provider.set(vec![raw("p1", "c1", "Kickoff", "Agenda attached", 1, false)]);
    let first = h
        .pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(first.sync.new_count, 1);

    h.provider.set(vec![
        raw("p1", "c1", "Kickoff", "Agenda attached", 1, true),
        raw("p2", "c1", "RE: Kickoff", "Sounds good", 2, false),
        raw("p3", "c2", "Invoice", "Payment due", 3, false),
    ]);
    let second = h
        .pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();

    assert_eq!(second.sync.new_count, 2);
    assert_eq!(second.sync.updated_count, 1);
    assert_eq!(second.sync.new_message_ids.len(), 2);
    assert_eq!(message_rows(&h, me.id).await, 3);

    let p1 = h
        .pipeline
        .store()
        .get_message_by_provider_id(me.id, "p1")
        .await
        .unwrap()
        .unwrap();
    assert!(p1.is_read);
    assert_thread_invariant(&h, me.id).await;

    let view = h.pipeline.get_thread(me.id, "c1").await.unwrap().unwrap();
    assert_eq!(view.thread.message_count, 2);
    assert_eq!(view.thread.unread_count, 1);
    assert_eq!(view.thread.subject.as_deref(), Some("Kickoff"));
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let h = harness(Arc::new(EchoLlm)).await;
    let me = user(&h, "me@example.com").await;
    h.provider.set(vec![
        raw("p1", "c1", "One", "first", 1, false),
        raw("p2", "c1", "Two", "second", 2, false),
    ]);

    let cancel = Cancellation::new();
    h.pipeline.trigger_sync(me.id, None, None, &cancel).await.unwrap();
    let again = h.pipeline.trigger_sync(me.id, None, None, &cancel).await.unwrap();

    assert_eq!(again.sync.new_count, 0);
    assert_eq!(again.sync.unchanged_count, 2);
    assert_eq!(again.enrichment.enriched, 0);
    assert_eq!(message_rows(&h, me.id).await, 2);
    assert_eq!(h.vectors.inner.len(), 2);
    assert_thread_invariant(&h, me.id).await;
}

#[tokio::test]
async fn provider_failure_still_enriches_committed_pages() {
    let mut provider = PagedMailbox::new(weekly_updates(4));
    provider.fail_on_call = Some(2);
    let h = harness_with(Arc::new(EchoLlm), Arc::new(provider), 2).await;
    let me = user(&h, "me@example.com").await;

    let err = h
        .pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap_err();
    let partial = match err {
        SyncError::Provider {
            error: ProviderError::AuthExpired(_),
            partial,
        } => partial,
        other => panic!("expected an auth failure, got {:?}", other),
    };

    assert_eq!(partial.new_message_ids.len(), 2);
    assert_eq!(message_rows(&h, me.id).await, 2);
    assert!(h.pipeline.store().unenriched_message_ids(me.id, 100).await.unwrap().is_empty());
    assert_eq!(h.vectors.inner.len(), 2);
    assert_thread_invariant(&h, me.id).await;
}

#[tokio::test]
async fn cancelled_sync_still_enriches_committed_pages() {
    let cancel = Cancellation::new();
    let mut provider = PagedMailbox::new(weekly_updates(4));
    provider.cancel_on_call = Some((2, cancel.clone()));
    let h = harness_with(Arc::new(EchoLlm), Arc::new(provider), 2).await;
    let me = user(&h, "me@example.com").await;

    let report = h.pipeline.trigger_sync(me.id, None, None, &cancel).await.unwrap();

    assert!(report.sync.cancelled);
    assert_eq!(report.sync.new_count, 2);
    assert_eq!(report.enrichment.enriched, 2);
    assert_eq!(message_rows(&h, me.id).await, 2);
    assert!(h.pipeline.store().unenriched_message_ids(me.id, 100).await.unwrap().is_empty());
    assert_eq!(h.vectors.inner.len(), 2);

    // The next run resumes after the committed page
    let resumed = h
        .pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(resumed.sync.new_count, 2);
    assert_eq!(message_rows(&h, me.id).await, 4);
}

#[tokio::test]
async fn oversized_provider_pages_lose_nothing() {
    let mut provider = PagedMailbox::new(weekly_updates(6));
    provider.fixed_page = Some(4);
    let h = harness_with(Arc::new(EchoLlm), Arc::new(provider), 2).await;
    let me = user(&h, "me@example.com").await;

    let first = h
        .pipeline
        .trigger_sync(me.id, None, Some(3), &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(first.sync.new_count, 4);

    h.pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();

    assert_eq!(message_rows(&h, me.id).await, 6);
    assert_eq!(*h.provider.calls.lock().unwrap(), 2);
    assert_eq!(h.vectors.inner.len(), 6);
    assert_thread_invariant(&h, me.id).await;
}

#[tokio::test]
async fn deactivated_user_cannot_sync_or_ask() {
    let h = harness(Arc::new(EchoLlm)).await;
    let me = user(&h, "me@example.com").await;
    assert!(h.pipeline.deactivate_user(me.id).await.unwrap());

    let err = h
        .pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownUser(id) if id == me.id));
    assert!(h.pipeline.ask(me.id, "hello", None).await.is_err());
    assert!(h.pipeline.ask(9999, "hello", None).await.is_err());
}

// ============ Enrichment ============

#[tokio::test]
async fn scenario_c_llm_timeout_falls_back_to_heuristics() {
    let h = harness(Arc::new(SlowLlm)).await;
    let me = user(&h, "me@example.com").await;
    h.provider.set(vec![raw(
        "p1",
        "c1",
        "URGENT: deadline today",
        "The build has a problem, please fix it.",
        1,
        false,
    )]);

    let report = h
        .pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(report.enrichment.enriched, 1);
    assert_eq!(report.enrichment.heuristic_derived, 1);

    let msg = h
        .pipeline
        .store()
        .get_message_by_provider_id(me.id, "p1")
        .await
        .unwrap()
        .unwrap();
    let enrichment = msg.enrichment.unwrap();
    assert_eq!(enrichment.provenance, Provenance::Heuristic);
    assert!(enrichment.fields.tags.contains(&"urgent".to_string()));
    assert!(enrichment.fields.priority >= 8);
    assert_eq!(enrichment.fields.sentiment, Sentiment::Negative);

    let thread = threads::find_thread(h.pipeline.store(), me.id, "c1")
        .await
        .unwrap()
        .unwrap();
    assert!(thread.action_required);
    assert_eq!(thread.ai_sentiment, Some(Sentiment::Negative));
}

#[tokio::test]
async fn enrich_pending_and_reenrich_keep_one_vector() {
    let h = harness(Arc::new(EchoLlm)).await;
    let me = user(&h, "me@example.com").await;
    h.provider.set(vec![
        raw("p1", "c1", "Budget", "Q3 numbers", 1, false),
        raw("p2", "c2", "Lunch", "Tacos", 2, false),
    ]);

    // Store the mailbox without enriching it.
    let engine = SyncEngine::new(
        h.pipeline.store().clone(),
        h.provider.clone(),
        SyncConfig::default(),
    );
    let synced = engine
        .sync(me.id, "inbox", 100, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(synced.new_count, 2);
    assert_eq!(h.pipeline.store().unenriched_message_ids(me.id, 100).await.unwrap().len(), 2);

    let pending = h
        .pipeline
        .enrich_pending(me.id, 100, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(pending.enriched, 2);
    assert_eq!(pending.indexed, 2);
    assert_eq!(h.vectors.inner.len(), 2);

    let id = h
        .pipeline
        .store()
        .get_message_by_provider_id(me.id, "p1")
        .await
        .unwrap()
        .unwrap()
        .id;

    assert!(h.pipeline.reenrich(me.id, id).await.unwrap().is_some());
    assert!(h.pipeline.reenrich(me.id, id).await.unwrap().is_some());
    assert_eq!(h.vectors.inner.len(), 2);
    assert!(h.pipeline.reenrich(me.id, 424242).await.unwrap().is_none());

    let again = h
        .pipeline
        .enrich_pending(me.id, 100, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(again.enriched, 0);
}

// ============ Index ============

#[tokio::test]
async fn index_isolation_between_users() {
    let h = harness(Arc::new(EchoLlm)).await;
    let alice = user(&h, "alice@example.com").await;
    let bob = user(&h, "bob@example.com").await;
    let mailbox = vec![
        raw("p1", "c1", "Quarterly budget", "Budget figures for Q3", 1, false),
        raw("p2", "c2", "Team lunch", "Tacos on Friday", 2, false),
    ];

    h.provider.set(mailbox.clone());
    h.pipeline
        .trigger_sync(alice.id, None, None, &Cancellation::new())
        .await
        .unwrap();
    h.pipeline
        .trigger_sync(bob.id, None, None, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(h.vectors.inner.len(), 4);

    let index = h.pipeline.index().unwrap();
    for (owner, other) in [(alice.id, bob.id), (bob.id, alice.id)] {
        let hits = index.search(owner, "quarterly budget figures", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| hit.metadata.user_id == owner));
        assert!(hits.iter().all(|hit| hit.metadata.user_id != other));
        assert!(hits[0].score >= hits[1].score);
        assert_eq!(hits[0].metadata.subject, "Quarterly budget");
    }

    let answer = h.pipeline.ask(alice.id, "quarterly budget", None).await.unwrap();
    let owned: Vec<i64> = h
        .pipeline
        .store()
        .recent_messages(alice.id, 10, mail_harness::store::RecentOrder::Newest)
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert!(answer.cited_message_ids.iter().all(|id| owned.contains(id)));
}

#[tokio::test]
async fn delete_message_removes_vectors_and_refreshes_thread() {
    let h = harness(Arc::new(EchoLlm)).await;
    let me = user(&h, "me@example.com").await;
    h.provider.set(vec![
        raw("p1", "c1", "Plan", "Draft plan", 1, false),
        raw("p2", "c1", "RE: Plan", "Looks fine", 2, false),
        raw("p3", "c2", "Solo", "Only message", 3, false),
    ]);
    h.pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();

    let store = h.pipeline.store();
    let p2 = store.get_message_by_provider_id(me.id, "p2").await.unwrap().unwrap();
    let p3 = store.get_message_by_provider_id(me.id, "p3").await.unwrap().unwrap();

    assert!(h.pipeline.mark_read(me.id, p2.id, true).await.unwrap());
    let view = h.pipeline.get_thread(me.id, "c1").await.unwrap().unwrap();
    assert_eq!(view.thread.unread_count, 1);

    assert!(h.pipeline.delete_message(me.id, p2.id).await.unwrap());
    assert!(h.pipeline.delete_message(me.id, p3.id).await.unwrap());
    assert!(!h.pipeline.delete_message(me.id, p3.id).await.unwrap());

    assert_eq!(h.vectors.inner.len(), 1);
    let view = h.pipeline.get_thread(me.id, "c1").await.unwrap().unwrap();
    assert_eq!(view.thread.message_count, 1);
    assert!(h.pipeline.get_thread(me.id, "c2").await.unwrap().is_none());
    assert_thread_invariant(&h, me.id).await;

    let hits = h.pipeline.index().unwrap().search(me.id, "plan solo", 10).await.unwrap();
    assert!(hits.iter().all(|hit| hit.message_id != p2.id && hit.message_id != p3.id));
}

#[tokio::test]
async fn similar_messages_exclude_the_source() {
    let h = harness(Arc::new(EchoLlm)).await;
    let me = user(&h, "me@example.com").await;
    h.provider.set(vec![
        raw("p1", "c1", "Budget review", "budget numbers", 1, false),
        raw("p2", "c2", "Budget follow-up", "budget numbers again", 2, false),
        raw("p3", "c3", "Lunch", "tacos", 3, false),
    ]);
    h.pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();

    let p1 = h
        .pipeline
        .store()
        .get_message_by_provider_id(me.id, "p1")
        .await
        .unwrap()
        .unwrap();
    let similar = h.pipeline.similar(me.id, p1.id, 5).await.unwrap();
    assert_eq!(similar.len(), 2);
    assert!(similar.iter().all(|s| s.message_id != p1.id));
    assert_eq!(similar[0].metadata.subject, "Budget follow-up");
}

// ============ Retrieval ============

#[tokio::test]
async fn scenario_b_summarize_unread() {
    let h = harness(Arc::new(EchoLlm)).await;
    let me = user(&h, "me@example.com").await;
    let mailbox: Vec<RawMessage> = (1..=10)
        .map(|n| {
            raw(
                &format!("p{}", n),
                &format!("c{}", n),
                &format!("Status update {}", n),
                "Weekly status of the migration project",
                n,
                n > 3,
            )
        })
        .collect();
    h.provider.set(mailbox);
    h.pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();

    let answer = h
        .pipeline
        .ask(me.id, "summarize my unread emails", None)
        .await
        .unwrap();

    assert_eq!(answer.intent, Intent::Summarize);
    assert_eq!(answer.retrieval, RetrievalMode::Vector);
    assert!(!answer.cited_message_ids.is_empty());
    assert!(answer.cited_message_ids.len() <= 5);
    assert!(!answer.degraded);
    assert!(answer.response_text.contains("3 unread"));
    assert_eq!(answer.suggestions[0], "You have 3 unread messages");
    assert_eq!(answer.suggestions.len(), 4);

    let log = h.pipeline.recent_exchanges(me.id, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].intent, "summarize");
    assert_eq!(log[0].cited_message_ids, answer.cited_message_ids);
    assert!(log[0].context_snapshot.contains("Mailbox: 10 messages, 3 unread"));
}

#[tokio::test]
async fn scenario_d_index_down_falls_back_to_keyword() {
    let h = harness(Arc::new(EchoLlm)).await;
    let me = user(&h, "me@example.com").await;
    h.provider.set(vec![
        raw("p1", "c1", "Budget numbers", "Q3 budget attached", 1, false),
        raw("p2", "c2", "Lunch", "Tacos on Friday", 2, false),
    ]);

    h.vectors.set_down(true);
    let report = h
        .pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(report.enrichment.enriched, 2);
    assert_eq!(report.enrichment.index_failures, 2);

    let answer = h.pipeline.ask(me.id, "what about the budget?", None).await.unwrap();
    assert_eq!(answer.retrieval, RetrievalMode::Keyword);
    assert_eq!(answer.cited_message_ids.len(), 1);
    assert!(!answer.response_text.is_empty());
    assert!(answer.response_text.contains("Budget numbers"));

    // Once the store is back, the backlog can be indexed.
    h.vectors.set_down(false);
    let indexed = h.pipeline.index_pending(me.id, 100).await.unwrap();
    assert_eq!(indexed.indexed, 2);
    assert_eq!(indexed.failed, 0);
    assert_eq!(h.pipeline.index_pending(me.id, 100).await.unwrap().indexed, 0);

    let answer = h.pipeline.ask(me.id, "what about the budget?", None).await.unwrap();
    assert_eq!(answer.retrieval, RetrievalMode::Vector);
}

#[tokio::test]
async fn degraded_answer_when_llm_unavailable() {
    let h = harness(Arc::new(SlowLlm)).await;
    let me = user(&h, "me@example.com").await;
    h.provider.set(vec![
        raw("p1", "c1", "Budget numbers", "Q3 budget attached", 1, false),
        raw("p2", "c2", "Lunch", "Tacos on Friday", 2, true),
    ]);
    h.pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();

    let answer = h.pipeline.ask(me.id, "any news on the budget", None).await.unwrap();
    assert!(answer.degraded);
    assert!(answer.response_text.contains("You have 1 unread message."));
    assert!(answer.response_text.contains("Budget numbers"));
    assert_eq!(answer.suggestions[0], "You have 1 unread messages");

    let log = h.pipeline.recent_exchanges(me.id, 10).await.unwrap();
    assert!(log[0].degraded);
}

#[tokio::test]
async fn explicit_context_reference_wins() {
    let h = harness(Arc::new(EchoLlm)).await;
    let me = user(&h, "me@example.com").await;
    let other = user(&h, "other@example.com").await;
    h.provider.set(vec![
        raw("p1", "c1", "Plan", "Draft plan", 1, false),
        raw("p2", "c1", "RE: Plan", "Looks fine", 2, false),
        raw("p3", "c2", "Budget", "Numbers", 3, false),
    ]);
    h.pipeline
        .trigger_sync(me.id, None, None, &Cancellation::new())
        .await
        .unwrap();
    h.pipeline
        .trigger_sync(other.id, None, None, &Cancellation::new())
        .await
        .unwrap();

    let thread_ref = ContextRef::Thread("c1".into());
    let answer = h
        .pipeline
        .ask(me.id, "reply to this thread about the budget", Some(&thread_ref))
        .await
        .unwrap();
    assert_eq!(answer.intent, Intent::ReplySuggestion);
    assert_eq!(answer.retrieval, RetrievalMode::Reference);
    assert_eq!(answer.cited_message_ids.len(), 2);

    // Someone else's message is not a valid reference; search takes over.
    let foreign = h
        .pipeline
        .store()
        .get_message_by_provider_id(other.id, "p3")
        .await
        .unwrap()
        .unwrap();
    let answer = h
        .pipeline
        .ask(me.id, "budget", Some(&ContextRef::Message(foreign.id)))
        .await
        .unwrap();
    assert_ne!(answer.retrieval, RetrievalMode::Reference);
    assert!(!answer.cited_message_ids.contains(&foreign.id));
}
