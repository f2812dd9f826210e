//! Enrichment Engine: summary, tags, sentiment, priority, category and
//! action items for each message.
//!
//! [`Enricher::enrich`] asks the LLM first and falls back to a deterministic
//! keyword heuristic whenever the call fails, times out, or returns text that
//! does not parse. It never returns an error.
//!
//! [`EnrichmentEngine`] persists results, forwards them to the vector index,
//! and runs batches on a bounded worker pool. Enrichment is append-once:
//! batches skip messages that already carry an enrichment, and only an
//! explicit [`EnrichmentEngine::reenrich`] overwrites one.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::extract::truncate_chars;
use crate::index::VectorIndex;
use crate::llm::{LlmClient, LlmError};
use crate::models::{
    format_ts, Enrichment, EnrichmentFields, Message, Sentiment, StoredEnrichment,
};
use crate::store::MessageStore;

const SYSTEM_PROMPT: &str = "You are an assistant that analyzes emails. For the email provided, return:\n\
1. summary: a brief summary (1-2 sentences)\n\
2. tags: 3-5 relevant keywords\n\
3. sentiment: positive, negative, or neutral\n\
4. priority_score: 1-10, where 10 is most urgent\n\
5. category: one word such as meeting, project, financial, report, or general\n\
6. action_items: requests the recipient must act on (may be empty)\n\n\
Respond with a single JSON object with keys summary, tags, sentiment, priority_score, category, action_items. No other text.";

const URGENT_WORDS: &[&str] = &["urgent", "asap", "immediately", "critical"];
const MEETING_WORDS: &[&str] = &["meeting", "call", "schedule", "calendar"];
const PROJECT_WORDS: &[&str] = &["project", "task", "deadline", "deliverable"];
const FINANCIAL_WORDS: &[&str] = &["invoice", "payment", "bill", "cost"];
const REPORT_WORDS: &[&str] = &["report", "analysis", "data", "results"];
const POSITIVE_WORDS: &[&str] = &["thank", "great", "excellent", "good", "happy"];
const NEGATIVE_WORDS: &[&str] = &["problem", "issue", "error", "wrong", "bad"];
const HIGH_PRIORITY_WORDS: &[&str] = &["urgent", "asap", "critical", "immediate"];
const LOW_PRIORITY_WORDS: &[&str] = &["fyi", "info", "notification"];
const REQUEST_CUES: &[&str] = &[
    "please",
    "could you",
    "can you",
    "need to",
    "needs to",
    "action required",
    "let me know",
];

const MAX_TAGS: usize = 10;
const MAX_HEURISTIC_ACTIONS: usize = 3;

/// Why LLM output could not be used. Always recovered with the heuristic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrichmentParseError {
    #[error("no JSON object in model output")]
    NoJson,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing or empty field '{0}'")]
    MissingField(&'static str),
    #[error("unrecognised sentiment '{0}'")]
    InvalidSentiment(String),
}

pub struct Enricher {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
    preview_chars: usize,
}

impl Enricher {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration, preview_chars: usize) -> Self {
        Self {
            llm,
            timeout,
            preview_chars,
        }
    }

    /// Enrich one message. Infallible: every failure degrades to [`heuristic`].
    pub async fn enrich(&self, msg: &Message) -> Enrichment {
        let prompt = build_prompt(msg, self.preview_chars);

        let generated = tokio::time::timeout(self.timeout, self.llm.generate(&prompt, SYSTEM_PROMPT))
            .await
            .unwrap_or(Err(LlmError::Timeout));

        match generated {
            Ok(generation) => match parse_llm_output(&generation.text) {
                Ok(fields) => return Enrichment::LlmDerived(fields),
                Err(e) => {
                    warn!(message_id = msg.id, error = %e, "Unusable LLM enrichment, using heuristic")
                }
            },
            Err(LlmError::Disabled) => {}
            Err(e) => warn!(message_id = msg.id, error = %e, "LLM enrichment failed, using heuristic"),
        }

        heuristic(msg)
    }
}

fn build_prompt(msg: &Message, preview_chars: usize) -> String {
    let content = if msg.body_text.is_empty() {
        &msg.body_preview
    } else {
        &msg.body_text
    };
    format!(
        "Analyze this email:\n\nSubject: {}\nFrom: {}\nDate: {}\nContent: {}",
        msg.subject,
        msg.sender.display(),
        format_ts(msg.received_at),
        truncate_chars(content, preview_chars)
    )
}

/// Extract enrichment fields from raw model output.
///
/// Accepts the first balanced JSON object anywhere in the text, so code
/// fences and chatter around it are tolerated.
pub fn parse_llm_output(text: &str) -> Result<EnrichmentFields, EnrichmentParseError> {
    let json_text = first_json_object(text).ok_or(EnrichmentParseError::NoJson)?;
    let value: serde_json::Value = serde_json::from_str(json_text)
        .map_err(|e| EnrichmentParseError::InvalidJson(e.to_string()))?;

    let summary = value
        .get("summary")
        .and_then(|s| s.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(EnrichmentParseError::MissingField("summary"))?
        .to_string();

    let sentiment_raw = value
        .get("sentiment")
        .and_then(|s| s.as_str())
        .ok_or(EnrichmentParseError::MissingField("sentiment"))?;
    let sentiment = Sentiment::parse(sentiment_raw)
        .ok_or_else(|| EnrichmentParseError::InvalidSentiment(sentiment_raw.to_string()))?;

    let priority = value
        .get("priority_score")
        .and_then(|p| match p {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|p| p.is_finite())
        .ok_or(EnrichmentParseError::MissingField("priority_score"))?;

    let mut tags: Vec<String> = Vec::new();
    for tag in string_list(value.get("tags")) {
        let tag = tag.to_lowercase();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags.truncate(MAX_TAGS);

    let category = value
        .get("category")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "general".to_string());

    Ok(EnrichmentFields {
        summary,
        tags,
        sentiment,
        priority: priority.round().clamp(1.0, 10.0) as u8,
        category,
        action_items: string_list(value.get("action_items")),
    })
}

/// Array of strings, or one comma-separated string.
fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    let items: Vec<String> = match value {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.as_str())
            .map(str::to_string)
            .collect(),
        Some(serde_json::Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Deterministic keyword enrichment. Cannot fail.
pub fn heuristic(msg: &Message) -> Enrichment {
    let text = format!("{} {}", msg.subject, msg.body_preview).to_lowercase();
    let has_any = |words: &[&str]| words.iter().any(|w| text.contains(w));

    let mut tags = Vec::new();
    for (tag, words) in [
        ("urgent", URGENT_WORDS),
        ("meeting", MEETING_WORDS),
        ("project", PROJECT_WORDS),
        ("financial", FINANCIAL_WORDS),
        ("report", REPORT_WORDS),
    ] {
        if has_any(words) {
            tags.push(tag.to_string());
        }
    }

    let sentiment = if has_any(POSITIVE_WORDS) {
        Sentiment::Positive
    } else if has_any(NEGATIVE_WORDS) {
        Sentiment::Negative
    } else {
        Sentiment::Neutral
    };

    let priority = if has_any(HIGH_PRIORITY_WORDS) {
        8
    } else if has_any(LOW_PRIORITY_WORDS) {
        3
    } else {
        5
    };

    let category = tags
        .iter()
        .find(|t| t.as_str() != "urgent")
        .cloned()
        .unwrap_or_else(|| "general".to_string());

    let sender = msg.sender.short();
    let summary = format!(
        "Email from {} about {}",
        if sender.is_empty() { "unknown sender" } else { sender },
        if msg.subject.is_empty() { "(no subject)" } else { &msg.subject }
    );

    Enrichment::HeuristicDerived(EnrichmentFields {
        summary,
        tags,
        sentiment,
        priority,
        category,
        action_items: heuristic_action_items(&msg.body_preview),
    })
}

fn heuristic_action_items(body: &str) -> Vec<String> {
    body.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| {
            let lower = s.to_lowercase();
            REQUEST_CUES.iter().any(|cue| lower.contains(cue))
        })
        .take(MAX_HEURISTIC_ACTIONS)
        .map(str::to_string)
        .collect()
}

// ============ Engine ============

/// Counts from one [`EnrichmentEngine::enrich_batch`] run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichBatchResult {
    pub enriched: usize,
    pub llm_derived: usize,
    pub heuristic_derived: usize,
    pub skipped: usize,
    pub indexed: usize,
    pub index_failures: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

enum UnitOutcome {
    Enriched { provenance_llm: bool, indexed: Option<bool> },
    Skipped,
}

#[derive(Clone)]
pub struct EnrichmentEngine {
    store: MessageStore,
    enricher: Arc<Enricher>,
    index: Option<Arc<VectorIndex>>,
    concurrency: usize,
}

impl EnrichmentEngine {
    pub fn new(
        store: MessageStore,
        enricher: Arc<Enricher>,
        index: Option<Arc<VectorIndex>>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            enricher,
            index,
            concurrency: concurrency.max(1),
        }
    }

    /// Enrich the given messages with bounded concurrency.
    ///
    /// Messages that are missing, owned by another user, or already enriched
    /// are skipped. Cancellation is checked before each unit starts; units
    /// already running finish and stay committed.
    pub async fn enrich_batch(
        &self,
        user_id: i64,
        message_ids: &[i64],
        cancel: &Cancellation,
    ) -> Result<EnrichBatchResult> {
        let mut result = EnrichBatchResult::default();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for &message_id in message_ids {
            let permit = semaphore.clone().acquire_owned().await?;
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let engine = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (message_id, engine.enrich_unit(user_id, message_id, false).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(UnitOutcome::Skipped))) => result.skipped += 1,
                Ok((_, Ok(UnitOutcome::Enriched { provenance_llm, indexed }))) => {
                    result.enriched += 1;
                    if provenance_llm {
                        result.llm_derived += 1;
                    } else {
                        result.heuristic_derived += 1;
                    }
                    match indexed {
                        Some(true) => result.indexed += 1,
                        Some(false) => result.index_failures += 1,
                        None => {}
                    }
                }
                Ok((message_id, Err(e))) => {
                    warn!(message_id, error = %e, "Enrichment unit failed");
                    result.errors.push(format!("message {}: {:#}", message_id, e));
                }
                Err(e) => result.errors.push(format!("enrichment task aborted: {}", e)),
            }
        }

        info!(
            user_id,
            enriched = result.enriched,
            llm = result.llm_derived,
            heuristic = result.heuristic_derived,
            skipped = result.skipped,
            index_failures = result.index_failures,
            cancelled = result.cancelled,
            "Enrichment batch finished"
        );
        Ok(result)
    }

    /// Explicit re-enrichment: overwrites the stored enrichment and re-indexes.
    /// Returns `None` when the message is not the user's.
    pub async fn reenrich(&self, user_id: i64, message_id: i64) -> Result<Option<Enrichment>> {
        let Some(msg) = self.store.get_message(user_id, message_id).await? else {
            return Ok(None);
        };
        let (enrichment, _) = self.apply(msg).await?;
        Ok(Some(enrichment))
    }

    async fn enrich_unit(&self, user_id: i64, message_id: i64, force: bool) -> Result<UnitOutcome> {
        let Some(msg) = self.store.get_message(user_id, message_id).await? else {
            return Ok(UnitOutcome::Skipped);
        };
        if msg.enrichment.is_some() && !force {
            debug!(message_id, "Already enriched, skipping");
            return Ok(UnitOutcome::Skipped);
        }
        let (enrichment, indexed) = self.apply(msg).await?;
        Ok(UnitOutcome::Enriched {
            provenance_llm: matches!(enrichment, Enrichment::LlmDerived(_)),
            indexed,
        })
    }

    /// Enrich, persist, then hand the message to the index.
    /// Index failures are logged and leave the message pending for `index_pending`.
    async fn apply(&self, mut msg: Message) -> Result<(Enrichment, Option<bool>)> {
        let enrichment = self.enricher.enrich(&msg).await;
        let enriched_at = self.store.save_enrichment(msg.id, &enrichment).await?;
        msg.enrichment = Some(StoredEnrichment {
            fields: enrichment.fields().clone(),
            provenance: enrichment.provenance(),
            enriched_at,
        });

        let indexed = match &self.index {
            None => None,
            Some(index) => match index.upsert(&msg).await {
                Ok(()) => {
                    self.store
                        .mark_indexed(msg.id, chrono::Utc::now().timestamp())
                        .await?;
                    Some(true)
                }
                Err(e) => {
                    warn!(message_id = msg.id, error = %e, "Indexing failed; message left pending");
                    Some(false)
                }
            },
        };
        Ok((enrichment, indexed))
    }
}
