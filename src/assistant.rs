//! Retrieval & context assembly for the conversational assistant.
//!
//! One turn runs four steps:
//!
//! 1. **Classify**: keyword rules pick an [`Intent`].
//! 2. **Gather**: an explicit message/thread reference wins; otherwise the
//!    vector index is searched, then keyword search over stored messages,
//!    then (for summarize/priority) the newest messages. At most
//!    `context_k` messages are rendered.
//! 3. **Generate**: intent-specific system prompt plus the context go to the
//!    LLM. If inference fails, a templated answer built from local facts is
//!    returned instead.
//! 4. **Persist**: the exchange is appended to the audit log. A failed
//!    write is logged and does not affect the answer.
//!
//! Turns only read pipeline state, so any number may run concurrently.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::extract::preview;
use crate::index::VectorIndex;
use crate::intent::Intent;
use crate::llm::{LlmClient, LlmError};
use crate::models::{format_ts, ChatExchange, Message, User};
use crate::stats;
use crate::store::{MessageStore, RecentOrder};
use crate::threads;

const ANALYTICS_WINDOW_DAYS: u32 = 30;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "about", "from", "that", "this", "what", "which", "have", "has",
    "are", "was", "were", "you", "your", "all", "any", "can", "how", "who", "when", "where", "why",
    "please", "show", "find", "search", "look", "tell", "give", "get", "list", "email", "emails",
    "message", "messages", "mail", "inbox", "recent", "last", "some", "there", "into", "does",
];

/// Explicit context named by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextRef {
    Message(i64),
    Thread(String),
}

/// Where the context of a turn came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Reference,
    Vector,
    Keyword,
    Recent,
    None,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Reference => "reference",
            RetrievalMode::Vector => "vector",
            RetrievalMode::Keyword => "keyword",
            RetrievalMode::Recent => "recent",
            RetrievalMode::None => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub response_text: String,
    pub cited_message_ids: Vec<i64>,
    pub suggestions: Vec<String>,
    pub intent: Intent,
    /// True when the response is the local template instead of LLM output.
    pub degraded: bool,
    pub retrieval: RetrievalMode,
}

/// Messages selected as context, in rank order.
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub messages: Vec<Message>,
    pub mode: RetrievalMode,
}

pub struct Assistant {
    store: MessageStore,
    llm: Arc<dyn LlmClient>,
    index: Option<Arc<VectorIndex>>,
    config: RetrievalConfig,
    llm_timeout: Duration,
}

impl Assistant {
    pub fn new(
        store: MessageStore,
        llm: Arc<dyn LlmClient>,
        index: Option<Arc<VectorIndex>>,
        config: RetrievalConfig,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            store,
            llm,
            index,
            config,
            llm_timeout,
        }
    }

    /// Answer one query. Always produces a response; failures of the
    /// index, the LLM, or the audit log only degrade it.
    pub async fn answer(
        &self,
        user: &User,
        query: &str,
        context_ref: Option<&ContextRef>,
    ) -> AnswerResult {
        let intent = Intent::classify(query);

        let counts = match self.store.message_counts(user.id).await {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(user_id = user.id, error = %e, "Could not read message counts");
                None
            }
        };
        let unread = counts.map(|(_, unread)| unread);

        let gathered = self.retrieve(user.id, query, intent, context_ref).await;
        let context = self.render_context(user, intent, counts, &gathered.messages).await;

        let (response_text, degraded) = match self.generate(user, query, intent, &context).await {
            Some(text) => (text, false),
            None => (degraded_response(unread, &gathered.messages), true),
        };

        let mut suggestions = Vec::new();
        if let Some(n) = unread.filter(|n| *n > 0) {
            suggestions.push(format!("You have {} unread messages", n));
        }
        suggestions.extend(intent.suggestions().iter().map(|s| s.to_string()));

        let cited_message_ids: Vec<i64> = gathered.messages.iter().map(|m| m.id).collect();

        let exchange = ChatExchange {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.id,
            query: query.to_string(),
            intent: intent.as_str().to_string(),
            context_snapshot: context,
            response: response_text.clone(),
            cited_message_ids: cited_message_ids.clone(),
            retrieval_mode: gathered.mode.as_str().to_string(),
            degraded,
            created_at: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = self.store.insert_chat_exchange(&exchange).await {
            warn!(user_id = user.id, error = %e, "Failed to record chat exchange");
        }

        info!(
            user_id = user.id,
            intent = intent.as_str(),
            retrieval = gathered.mode.as_str(),
            cited = cited_message_ids.len(),
            degraded,
            "Answered query"
        );

        AnswerResult {
            response_text,
            cited_message_ids,
            suggestions,
            intent,
            degraded,
            retrieval: gathered.mode,
        }
    }

    /// Context selection without generation: reference, vector, keyword,
    /// then recency for intents that want it.
    pub async fn retrieve(
        &self,
        user_id: i64,
        query: &str,
        intent: Intent,
        context_ref: Option<&ContextRef>,
    ) -> Retrieved {
        let k = self.config.context_k;

        if let Some(reference) = context_ref {
            let loaded = match reference {
                ContextRef::Message(id) => self
                    .store
                    .get_message(user_id, *id)
                    .await
                    .map(|m| m.into_iter().collect::<Vec<_>>()),
                ContextRef::Thread(key) => self.thread_context(user_id, key, k).await,
            };
            match loaded {
                Ok(messages) if !messages.is_empty() => {
                    return Retrieved {
                        messages,
                        mode: RetrievalMode::Reference,
                    }
                }
                Ok(_) => debug!(user_id, ?reference, "Context reference not found; searching"),
                Err(e) => warn!(user_id, error = %e, "Failed to load context reference"),
            }
        }

        if let Some(index) = &self.index {
            match index.search(user_id, query, k).await {
                Ok(hits) if !hits.is_empty() => {
                    let ids: Vec<i64> = hits.iter().map(|h| h.message_id).collect();
                    match self.store.messages_by_ids(user_id, &ids).await {
                        Ok(messages) if !messages.is_empty() => {
                            return Retrieved {
                                messages,
                                mode: RetrievalMode::Vector,
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(user_id, error = %e, "Failed to load vector hits"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(user_id, error = %e, "Vector index unavailable; using keyword search")
                }
            }
        }

        let terms = keyword_terms(query);
        let limit = self.config.keyword_limit.min(k);
        match self.store.keyword_search(user_id, &terms, limit).await {
            Ok(messages) if !messages.is_empty() => {
                return Retrieved {
                    messages,
                    mode: RetrievalMode::Keyword,
                }
            }
            Ok(_) => {}
            Err(e) => warn!(user_id, error = %e, "Keyword search failed"),
        }

        if intent.wants_recent_fallback() {
            let order = if intent == Intent::Priority {
                RecentOrder::PriorityFirst
            } else {
                RecentOrder::UnreadFirst
            };
            match self.store.recent_messages(user_id, k, order).await {
                Ok(messages) if !messages.is_empty() => {
                    return Retrieved {
                        messages,
                        mode: RetrievalMode::Recent,
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(user_id, error = %e, "Failed to load recent messages"),
            }
        }

        Retrieved {
            messages: Vec::new(),
            mode: RetrievalMode::None,
        }
    }

    /// The newest `k` members of a thread, oldest first.
    async fn thread_context(&self, user_id: i64, key: &str, k: usize) -> anyhow::Result<Vec<Message>> {
        let Some(thread) = threads::find_thread(&self.store, user_id, key).await? else {
            return Ok(Vec::new());
        };
        let mut members = threads::thread_messages(&self.store, user_id, thread.id).await?;
        if members.len() > k {
            members.drain(..members.len() - k);
        }
        Ok(members)
    }

    async fn render_context(
        &self,
        user: &User,
        intent: Intent,
        counts: Option<(i64, i64)>,
        messages: &[Message],
    ) -> String {
        let mut parts = vec![format!(
            "User: {} ({})",
            user.greeting_name(),
            user.email
        )];
        if let Some((total, unread)) = counts {
            parts.push(format!("Mailbox: {} messages, {} unread", total, unread));
        }

        if intent == Intent::Analytics {
            let now = chrono::Utc::now().timestamp();
            match stats::mailbox_stats(&self.store, user.id, ANALYTICS_WINDOW_DAYS, now).await {
                Ok(s) => parts.push(s.render()),
                Err(e) => warn!(user_id = user.id, error = %e, "Failed to compute mailbox stats"),
            }
        }

        if !messages.is_empty() {
            let rendered: Vec<String> = messages
                .iter()
                .take(self.config.context_k)
                .enumerate()
                .map(|(i, m)| render_message(i + 1, m, self.config.preview_chars))
                .collect();
            parts.push(format!("Relevant emails:\n{}", rendered.join("\n---\n")));
        }

        parts.join("\n\n")
    }

    async fn generate(&self, user: &User, query: &str, intent: Intent, context: &str) -> Option<String> {
        let prompt = if context.is_empty() {
            query.to_string()
        } else {
            format!("Context:\n{}\n\nUser question: {}", context, query)
        };
        let system = intent.system_prompt(user.greeting_name());

        let result = match tokio::time::timeout(self.llm_timeout, self.llm.generate(&prompt, &system)).await {
            Ok(r) => r,
            Err(_) => Err(LlmError::Timeout),
        };
        match result {
            Ok(generation) if !generation.text.trim().is_empty() => Some(generation.text.trim().to_string()),
            Ok(_) => {
                warn!(user_id = user.id, "LLM returned an empty response");
                None
            }
            Err(LlmError::Disabled) => {
                debug!(user_id = user.id, "LLM disabled; using templated response");
                None
            }
            Err(e) => {
                warn!(user_id = user.id, error = %e, "LLM generation failed; using templated response");
                None
            }
        }
    }
}

fn render_message(n: usize, m: &Message, preview_chars: usize) -> String {
    let body = if m.body_preview.trim().is_empty() {
        &m.body_text
    } else {
        &m.body_preview
    };
    format!(
        "[{}] From: {}\nSubject: {}\nDate: {}\nPreview: {}",
        n,
        m.sender.display(),
        m.subject,
        format_ts(m.received_at),
        preview(body, preview_chars)
    )
}

/// Answer built only from local facts, used when inference is unavailable.
fn degraded_response(unread: Option<i64>, messages: &[Message]) -> String {
    let mut out = String::from("I can't reach the assistant model right now, but here is what I know.");
    if let Some(n) = unread {
        out.push_str(&format!(
            " You have {} unread message{}.",
            n,
            if n == 1 { "" } else { "s" }
        ));
    }
    if !messages.is_empty() {
        out.push_str("\n\nRelevant messages:");
        for m in messages {
            out.push_str(&format!(
                "\n- {} (from {}, {})",
                m.subject,
                m.sender.short(),
                format_ts(m.received_at)
            ));
        }
    }
    out
}

/// Lowercased query terms of at least three characters, minus stop words.
pub fn keyword_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !c.is_alphanumeric() && c != '@' && c != '.')
        .map(|t| t.trim_matches('.').to_lowercase())
        .filter(|t| t.chars().count() >= 3 && !STOP_WORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_terms_drop_short_and_stop_words() {
        assert_eq!(
            keyword_terms("Find the emails about Budget, budget and Q3 from bob@example.com."),
            vec!["budget", "bob@example.com"]
        );
        assert!(keyword_terms("show me all of it").is_empty());
    }

    #[test]
    fn degraded_template_reports_unread() {
        let text = degraded_response(Some(3), &[]);
        assert!(text.contains("3 unread messages"));
        assert!(!degraded_response(None, &[]).contains("unread"));
        assert!(degraded_response(Some(1), &[]).contains("1 unread message."));
    }
}
