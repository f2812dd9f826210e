//! Core data models used throughout the mail pipeline.
//!
//! These types represent the users, messages, threads, enrichments, and
//! assistant exchanges that flow through sync, enrichment, indexing, and
//! retrieval. Timestamps are Unix seconds (UTC).

use serde::{Deserialize, Serialize};

/// Mailbox owner. Never hard-deleted; `is_active` is cleared instead.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub display_name: Option<String>,
    pub timezone: String,
    pub preferences: serde_json::Value,
    pub is_active: bool,
    /// Opaque upstream pagination token; `None` means sync from the start.
    pub last_sync_cursor: Option<String>,
    pub last_synced_at: Option<i64>,
    pub created_at: i64,
}

impl User {
    /// Name used when addressing the user in prompts.
    pub fn greeting_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Normal,
    High,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::Low => "low",
            Importance::Normal => "normal",
            Importance::High => "high",
        }
    }

    /// Lenient parse; anything unrecognised is `Normal`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Importance::Low,
            "high" => Importance::High,
            _ => Importance::Normal,
        }
    }
}

/// An email address with its display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub name: String,
}

impl Address {
    /// `Name <addr>`, or whichever half is present.
    pub fn display(&self) -> String {
        match (self.name.trim().is_empty(), self.address.trim().is_empty()) {
            (false, false) => format!("{} <{}>", self.name, self.address),
            (false, true) => self.name.clone(),
            (true, false) => self.address.clone(),
            (true, true) => "(unknown sender)".to_string(),
        }
    }

    /// Display name if set, else address.
    pub fn short(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.address
        } else {
            &self.name
        }
    }
}

/// A normalized message ready to be written by the sync engine.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub provider_id: String,
    pub conversation_key: Option<String>,
    pub subject: String,
    pub sender: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub body_content_type: String,
    pub body_html: Option<String>,
    pub body_text: String,
    pub body_preview: String,
    pub importance: Importance,
    pub is_read: bool,
    pub is_draft: bool,
    pub has_attachments: bool,
    pub is_sent_item: bool,
    pub folder: String,
    pub categories: Vec<String>,
    pub received_at: i64,
    pub sent_at: Option<i64>,
}

/// A stored message with its enrichment, if any.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub user_id: i64,
    pub provider_id: String,
    pub conversation_key: Option<String>,
    pub thread_id: Option<i64>,
    pub subject: String,
    pub sender: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub body_html: Option<String>,
    pub body_text: String,
    pub body_preview: String,
    pub importance: Importance,
    pub is_read: bool,
    pub is_draft: bool,
    pub has_attachments: bool,
    pub is_sent_item: bool,
    pub folder: String,
    pub categories: Vec<String>,
    pub received_at: i64,
    pub sent_at: Option<i64>,
    pub enrichment: Option<StoredEnrichment>,
    pub indexed_at: Option<i64>,
}

impl Message {
    /// Sender plus every recipient address, lowercased.
    pub fn participant_addresses(&self) -> Vec<String> {
        std::iter::once(&self.sender)
            .chain(self.to.iter())
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(|a| a.address.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Some(Sentiment::Positive),
            "negative" => Some(Sentiment::Negative),
            "neutral" => Some(Sentiment::Neutral),
            _ => None,
        }
    }
}

/// Normalized enrichment fields, identical whatever produced them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentFields {
    pub summary: String,
    pub tags: Vec<String>,
    pub sentiment: Sentiment,
    /// 1 (ignore) ..= 10 (drop everything).
    pub priority: u8,
    pub category: String,
    pub action_items: Vec<String>,
}

/// Where an enrichment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Llm,
    Heuristic,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Llm => "llm",
            Provenance::Heuristic => "heuristic",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "llm" {
            Provenance::Llm
        } else {
            Provenance::Heuristic
        }
    }
}

/// Result of enriching one message.
///
/// Both variants carry the same normalized fields, so downstream code
/// reads [`Enrichment::fields`] and never branches on provenance.
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    LlmDerived(EnrichmentFields),
    HeuristicDerived(EnrichmentFields),
}

impl Enrichment {
    pub fn fields(&self) -> &EnrichmentFields {
        match self {
            Enrichment::LlmDerived(f) | Enrichment::HeuristicDerived(f) => f,
        }
    }

    pub fn provenance(&self) -> Provenance {
        match self {
            Enrichment::LlmDerived(_) => Provenance::Llm,
            Enrichment::HeuristicDerived(_) => Provenance::Heuristic,
        }
    }
}

/// Enrichment as persisted on a message row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEnrichment {
    pub fields: EnrichmentFields,
    pub provenance: Provenance,
    pub enriched_at: i64,
}

/// Conversation thread. Statistics are derived from member messages.
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: i64,
    pub user_id: i64,
    pub conversation_key: String,
    pub subject: Option<String>,
    pub participants: Vec<String>,
    pub message_count: i64,
    pub unread_count: i64,
    pub first_message_at: Option<i64>,
    pub last_message_at: Option<i64>,
    pub ai_summary: Option<String>,
    pub ai_sentiment: Option<Sentiment>,
    pub action_required: bool,
}

/// Compact message row for thread views and listings.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub id: i64,
    pub subject: String,
    pub sender: Address,
    pub received_at: i64,
    pub is_read: bool,
    pub preview: String,
    pub summary: Option<String>,
    pub priority: Option<u8>,
}

impl From<&Message> for MessageSummary {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            subject: m.subject.clone(),
            sender: m.sender.clone(),
            received_at: m.received_at,
            is_read: m.is_read,
            preview: m.body_preview.clone(),
            summary: m.enrichment.as_ref().map(|e| e.fields.summary.clone()),
            priority: m.enrichment.as_ref().map(|e| e.fields.priority),
        }
    }
}

/// A thread with its member messages, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    pub thread: Thread,
    pub messages: Vec<MessageSummary>,
}

/// One assistant turn, as written to the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct ChatExchange {
    pub id: String,
    pub user_id: i64,
    pub query: String,
    pub intent: String,
    pub context_snapshot: String,
    pub response: String,
    pub cited_message_ids: Vec<i64>,
    pub retrieval_mode: String,
    pub degraded: bool,
    pub created_at: i64,
}

/// Format a Unix timestamp as `YYYY-MM-DD HH:MM` (UTC).
pub fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_parse_is_lenient() {
        assert_eq!(Importance::parse("HIGH"), Importance::High);
        assert_eq!(Importance::parse("low"), Importance::Low);
        assert_eq!(Importance::parse("whatever"), Importance::Normal);
    }

    #[test]
    fn sentiment_parse_rejects_unknown() {
        assert_eq!(Sentiment::parse(" Positive "), Some(Sentiment::Positive));
        assert_eq!(Sentiment::parse("mixed"), None);
    }

    #[test]
    fn address_display_variants() {
        let full = Address {
            address: "ana@example.com".into(),
            name: "Ana".into(),
        };
        assert_eq!(full.display(), "Ana <ana@example.com>");
        assert_eq!(full.short(), "Ana");

        let bare = Address {
            address: "ops@example.com".into(),
            name: String::new(),
        };
        assert_eq!(bare.display(), "ops@example.com");
        assert_eq!(bare.short(), "ops@example.com");
        assert_eq!(Address::default().display(), "(unknown sender)");
    }
}
