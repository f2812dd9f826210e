//! Thread Aggregator: groups messages into conversations.
//!
//! Thread rows are a derived cache. Statistics are always recomputed from
//! member messages and never edited directly. A thread is "touched" when a
//! message was newly assigned to it or when something marked it `stale`
//! (read-state change, new enrichment, deletion of a member).

use anyhow::Result;
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::models::{Message, MessageSummary, Sentiment, Thread, ThreadView};
use crate::store::{message_from_row, MessageStore};

/// Counts from one [`rebuild_threads`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RebuildStats {
    pub assigned: usize,
    pub created: usize,
    pub recomputed: usize,
}

/// Assign unthreaded messages and refresh every touched thread. Idempotent.
pub async fn rebuild_threads(store: &MessageStore, user_id: i64) -> Result<RebuildStats> {
    let pool = store.pool();
    let mut stats = RebuildStats::default();
    let mut touched = BTreeSet::new();

    let unthreaded = sqlx::query(
        r#"
        SELECT id, conversation_key, subject FROM messages
        WHERE user_id = ? AND thread_id IS NULL AND conversation_key IS NOT NULL
        ORDER BY received_at, id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut known: HashMap<String, i64> = HashMap::new();
    for row in &unthreaded {
        let message_id: i64 = row.get("id");
        let key: String = row.get("conversation_key");
        let subject: String = row.get("subject");

        let thread_id = match known.get(&key) {
            Some(id) => *id,
            None => {
                let (id, created) = find_or_create_thread(store, user_id, &key, &subject).await?;
                if created {
                    stats.created += 1;
                }
                known.insert(key.clone(), id);
                id
            }
        };

        sqlx::query("UPDATE messages SET thread_id = ? WHERE id = ?")
            .bind(thread_id)
            .bind(message_id)
            .execute(pool)
            .await?;
        stats.assigned += 1;
        touched.insert(thread_id);
    }

    let stale: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM threads WHERE user_id = ? AND stale = 1")
            .bind(user_id)
            .fetch_all(pool)
            .await?;
    touched.extend(stale);

    for thread_id in touched {
        refresh_thread(store, thread_id).await?;
        stats.recomputed += 1;
    }

    if stats.assigned > 0 || stats.recomputed > 0 {
        info!(
            user_id,
            assigned = stats.assigned,
            created = stats.created,
            recomputed = stats.recomputed,
            "Threads rebuilt"
        );
    }
    Ok(stats)
}

async fn find_or_create_thread(
    store: &MessageStore,
    user_id: i64,
    conversation_key: &str,
    subject: &str,
) -> Result<(i64, bool)> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM threads WHERE user_id = ? AND conversation_key = ?")
            .bind(user_id)
            .bind(conversation_key)
            .fetch_optional(store.pool())
            .await?;
    if let Some(id) = existing {
        return Ok((id, false));
    }

    let subject = strip_reply_prefixes(subject);
    let result = sqlx::query(
        r#"
        INSERT INTO threads (user_id, conversation_key, subject, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(user_id, conversation_key) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(conversation_key)
    .bind(if subject.is_empty() { None } else { Some(subject) })
    .bind(chrono::Utc::now().timestamp())
    .execute(store.pool())
    .await?;

    let id: i64 =
        sqlx::query_scalar("SELECT id FROM threads WHERE user_id = ? AND conversation_key = ?")
            .bind(user_id)
            .bind(conversation_key)
            .fetch_one(store.pool())
            .await?;
    Ok((id, result.rows_affected() > 0))
}

/// Recompute one thread from its members. A thread left without members is removed.
pub async fn refresh_thread(store: &MessageStore, thread_id: i64) -> Result<()> {
    let members = thread_members(store, thread_id).await?;

    if members.is_empty() {
        sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(thread_id)
            .execute(store.pool())
            .await?;
        debug!(thread_id, "Removed empty thread");
        return Ok(());
    }

    let summary = ThreadSummary::from_members(&members);
    sqlx::query(
        r#"
        UPDATE threads SET
            participants_json = ?, message_count = ?, unread_count = ?,
            first_message_at = ?, last_message_at = ?,
            ai_summary = ?, ai_sentiment = ?, action_required = ?,
            stale = 0, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(serde_json::to_string(&summary.participants)?)
    .bind(summary.message_count)
    .bind(summary.unread_count)
    .bind(summary.first_message_at)
    .bind(summary.last_message_at)
    .bind(&summary.ai_summary)
    .bind(summary.ai_sentiment.map(|s| s.as_str()))
    .bind(summary.action_required)
    .bind(chrono::Utc::now().timestamp())
    .bind(thread_id)
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Statistics derived from a thread's member messages.
#[derive(Debug, Clone, PartialEq)]
struct ThreadSummary {
    participants: Vec<String>,
    message_count: i64,
    unread_count: i64,
    first_message_at: Option<i64>,
    last_message_at: Option<i64>,
    ai_summary: Option<String>,
    ai_sentiment: Option<Sentiment>,
    action_required: bool,
}

impl ThreadSummary {
    fn from_members(members: &[Message]) -> Self {
        let participants: BTreeSet<String> = members
            .iter()
            .flat_map(|m| m.participant_addresses())
            .collect();

        let enriched: Vec<&Message> = members.iter().filter(|m| m.enrichment.is_some()).collect();
        let ai_summary = enriched
            .iter()
            .max_by_key(|m| (m.received_at, m.id))
            .and_then(|m| m.enrichment.as_ref())
            .map(|e| e.fields.summary.clone());

        let ai_sentiment = if enriched.is_empty() {
            None
        } else {
            let mut tally: HashMap<Sentiment, usize> = HashMap::new();
            for m in &enriched {
                if let Some(e) = &m.enrichment {
                    *tally.entry(e.fields.sentiment).or_default() += 1;
                }
            }
            let best = tally.values().copied().max().unwrap_or(0);
            let leaders: Vec<Sentiment> = tally
                .iter()
                .filter(|(_, n)| **n == best)
                .map(|(s, _)| *s)
                .collect();
            // Ties go to neutral
            Some(if leaders.len() == 1 {
                leaders[0]
            } else {
                Sentiment::Neutral
            })
        };

        let action_required = enriched.iter().any(|m| {
            m.enrichment
                .as_ref()
                .is_some_and(|e| !e.fields.action_items.is_empty() || e.fields.priority >= 8)
        });

        Self {
            participants: participants.into_iter().collect(),
            message_count: members.len() as i64,
            unread_count: members.iter().filter(|m| !m.is_read).count() as i64,
            first_message_at: members.iter().map(|m| m.received_at).min(),
            last_message_at: members.iter().map(|m| m.received_at).max(),
            ai_summary,
            ai_sentiment,
            action_required,
        }
    }
}

async fn thread_members(store: &MessageStore, thread_id: i64) -> Result<Vec<Message>> {
    let ids: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM messages WHERE thread_id = ? ORDER BY received_at, id")
            .bind(thread_id)
            .fetch_all(store.pool())
            .await?;
    let user_id: Option<i64> = sqlx::query_scalar("SELECT user_id FROM threads WHERE id = ?")
        .bind(thread_id)
        .fetch_optional(store.pool())
        .await?;
    match user_id {
        Some(user_id) => store.messages_by_ids(user_id, &ids).await,
        None => Ok(Vec::new()),
    }
}

/// Thread with its members, oldest first. `None` when the user has no such conversation.
pub async fn get_thread(
    store: &MessageStore,
    user_id: i64,
    conversation_key: &str,
) -> Result<Option<ThreadView>> {
    let Some(thread) = find_thread(store, user_id, conversation_key).await? else {
        return Ok(None);
    };

    let messages = thread_messages(store, user_id, thread.id).await?;
    Ok(Some(ThreadView {
        thread,
        messages: messages.iter().map(MessageSummary::from).collect(),
    }))
}

/// Full member messages of a thread, oldest first.
pub async fn thread_messages(
    store: &MessageStore,
    user_id: i64,
    thread_id: i64,
) -> Result<Vec<Message>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM messages WHERE user_id = ? AND thread_id = ? ORDER BY received_at, id",
        crate::store::MESSAGE_COLUMNS
    ))
    .bind(user_id)
    .bind(thread_id)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(message_from_row).collect()
}

pub async fn find_thread(
    store: &MessageStore,
    user_id: i64,
    conversation_key: &str,
) -> Result<Option<Thread>> {
    let row = sqlx::query("SELECT * FROM threads WHERE user_id = ? AND conversation_key = ?")
        .bind(user_id)
        .bind(conversation_key)
        .fetch_optional(store.pool())
        .await?;
    Ok(row.as_ref().map(thread_from_row))
}

/// Most recently active threads first.
pub async fn list_threads(store: &MessageStore, user_id: i64, limit: usize) -> Result<Vec<Thread>> {
    let rows = sqlx::query(
        "SELECT * FROM threads WHERE user_id = ? ORDER BY last_message_at DESC, id DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit as i64)
    .fetch_all(store.pool())
    .await?;
    Ok(rows.iter().map(thread_from_row).collect())
}

fn thread_from_row(row: &sqlx::sqlite::SqliteRow) -> Thread {
    let participants: String = row.get("participants_json");
    let sentiment: Option<String> = row.get("ai_sentiment");
    Thread {
        id: row.get("id"),
        user_id: row.get("user_id"),
        conversation_key: row.get("conversation_key"),
        subject: row.get("subject"),
        participants: serde_json::from_str(&participants).unwrap_or_default(),
        message_count: row.get("message_count"),
        unread_count: row.get("unread_count"),
        first_message_at: row.get("first_message_at"),
        last_message_at: row.get("last_message_at"),
        ai_summary: row.get("ai_summary"),
        ai_sentiment: sentiment.as_deref().and_then(Sentiment::parse),
        action_required: row.get("action_required"),
    }
}

/// Drop `Re:`/`Fw:`/`Fwd:` prefixes so the thread carries the original subject.
fn strip_reply_prefixes(subject: &str) -> &str {
    let mut s = subject.trim();
    loop {
        let lower = s.to_ascii_lowercase();
        let cut = ["re:", "fw:", "fwd:"]
            .iter()
            .find(|p| lower.starts_with(*p))
            .map(|p| p.len());
        match cut {
            Some(n) => s = s[n..].trim_start(),
            None => return s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Enrichment, EnrichmentFields};
    use crate::store::test_support::{insert, new_message, temp_store};

    fn fields(sentiment: Sentiment, priority: u8, summary: &str) -> Enrichment {
        Enrichment::HeuristicDerived(EnrichmentFields {
            summary: summary.to_string(),
            tags: Vec::new(),
            sentiment,
            priority,
            category: "general".into(),
            action_items: Vec::new(),
        })
    }

    #[tokio::test]
    async fn groups_by_conversation_and_counts() {
        let (_tmp, store) = temp_store().await;
        let user = store.ensure_user("me@example.com", None, None).await.unwrap();

        let mut a = new_message("a", Some("c1"), 100);
        a.subject = "RE: Budget".into();
        a.cc = vec![crate::models::Address {
            address: "Bob@Example.com".into(),
            name: "Bob".into(),
        }];
        let mut b = new_message("b", Some("c1"), 200);
        b.is_read = true;
        insert(&store, user.id, &a).await;
        insert(&store, user.id, &b).await;
        insert(&store, user.id, &new_message("c", Some("c2"), 300)).await;
        insert(&store, user.id, &new_message("d", None, 400)).await;

        let stats = rebuild_threads(&store, user.id).await.unwrap();
        assert_eq!(stats.assigned, 3);
        assert_eq!(stats.created, 2);

        let view = get_thread(&store, user.id, "c1").await.unwrap().unwrap();
        assert_eq!(view.thread.message_count, 2);
        assert_eq!(view.thread.unread_count, 1);
        assert_eq!(view.thread.first_message_at, Some(100));
        assert_eq!(view.thread.last_message_at, Some(200));
        assert_eq!(view.thread.subject.as_deref(), Some("Budget"));
        assert_eq!(
            view.thread.participants,
            vec!["ana@example.com", "bob@example.com", "me@example.com"]
        );
        assert_eq!(view.messages.len(), 2);
        assert_eq!(view.messages[0].received_at, 100);

        // Second run is a no-op
        let again = rebuild_threads(&store, user.id).await.unwrap();
        assert_eq!(again, RebuildStats::default());
    }

    #[tokio::test]
    async fn read_state_change_refreshes_unread_count() {
        let (_tmp, store) = temp_store().await;
        let user = store.ensure_user("me@example.com", None, None).await.unwrap();
        let id = insert(&store, user.id, &new_message("a", Some("c1"), 100)).await;
        rebuild_threads(&store, user.id).await.unwrap();

        store.set_read(user.id, id, true).await.unwrap();
        let stats = rebuild_threads(&store, user.id).await.unwrap();
        assert_eq!(stats.recomputed, 1);

        let thread = find_thread(&store, user.id, "c1").await.unwrap().unwrap();
        assert_eq!(thread.unread_count, 0);
    }

    #[tokio::test]
    async fn ai_fields_follow_enriched_members() {
        let (_tmp, store) = temp_store().await;
        let user = store.ensure_user("me@example.com", None, None).await.unwrap();
        let a = insert(&store, user.id, &new_message("a", Some("c1"), 100)).await;
        let b = insert(&store, user.id, &new_message("b", Some("c1"), 200)).await;
        rebuild_threads(&store, user.id).await.unwrap();

        store
            .save_enrichment(a, &fields(Sentiment::Negative, 9, "older"))
            .await
            .unwrap();
        store
            .save_enrichment(b, &fields(Sentiment::Positive, 4, "newer"))
            .await
            .unwrap();
        rebuild_threads(&store, user.id).await.unwrap();

        let thread = find_thread(&store, user.id, "c1").await.unwrap().unwrap();
        assert_eq!(thread.ai_summary.as_deref(), Some("newer"));
        assert_eq!(thread.ai_sentiment, Some(Sentiment::Neutral));
        assert!(thread.action_required);
    }

    #[tokio::test]
    async fn unknown_conversation_is_none() {
        let (_tmp, store) = temp_store().await;
        let user = store.ensure_user("me@example.com", None, None).await.unwrap();
        assert!(get_thread(&store, user.id, "missing").await.unwrap().is_none());
    }

    #[test]
    fn reply_prefixes_are_stripped() {
        assert_eq!(strip_reply_prefixes("Re: Fwd: RE: Plan"), "Plan");
        assert_eq!(strip_reply_prefixes("Regarding plan"), "Regarding plan");
    }
}
