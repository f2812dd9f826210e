//! Message Store: durable relational storage for users, messages, and the
//! assistant audit log.
//!
//! Thread bookkeeping lives in [`crate::threads`] and mailbox analytics in
//! [`crate::stats`]; both run their SQL against [`MessageStore::pool`].
//!
//! Every read is scoped by `user_id`. A message that exists but belongs to
//! someone else is indistinguishable from a missing one.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::models::{
    Address, ChatExchange, Enrichment, EnrichmentFields, Importance, Message, NewMessage,
    Provenance, Sentiment, StoredEnrichment, User,
};

/// Columns selected for every [`Message`] read.
pub(crate) const MESSAGE_COLUMNS: &str = r#"
    id, user_id, provider_id, conversation_key, thread_id, subject,
    sender_address, sender_name, to_json, cc_json, bcc_json,
    body_html, body_text, body_preview, importance,
    is_read, is_draft, has_attachments, is_sent_item, folder, categories_json,
    received_at, sent_at,
    ai_summary, ai_tags_json, ai_sentiment, ai_priority, ai_category,
    ai_action_items_json, ai_provenance, enriched_at, indexed_at
"#;

/// Outcome of writing one synced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    /// Existing row whose mutable flags changed.
    Updated(i64),
    /// Existing row, nothing to change.
    Unchanged(i64),
}

impl UpsertOutcome {
    pub fn message_id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => *id,
        }
    }
}

/// Ordering for [`MessageStore::recent_messages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecentOrder {
    Newest,
    UnreadFirst,
    PriorityFirst,
}

#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Users ============

    /// Create the user on first login, or refresh profile fields.
    pub async fn ensure_user(
        &self,
        email: &str,
        display_name: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<User> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            anyhow::bail!("user email must not be empty");
        }
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO users (email, display_name, timezone, created_at, updated_at)
            VALUES (?, ?, COALESCE(?, 'UTC'), ?, ?)
            ON CONFLICT(email) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, users.display_name),
                timezone = CASE WHEN ? IS NULL THEN users.timezone ELSE excluded.timezone END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&email)
        .bind(display_name)
        .bind(timezone)
        .bind(now)
        .bind(now)
        .bind(timezone)
        .execute(&self.pool)
        .await?;

        self.find_user_by_email(&email)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user {} vanished after upsert", email))
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?")
            .bind(email.trim().to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// Soft-deactivate. Returns false when the user does not exist.
    pub async fn deactivate_user(&self, user_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============ Messages ============

    pub async fn get_message(&self, user_id: i64, message_id: i64) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE user_id = ? AND id = ?",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn get_message_by_provider_id(
        &self,
        user_id: i64,
        provider_id: &str,
    ) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE user_id = ? AND provider_id = ?",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Load messages by id for one user, preserving the order of `ids`.
    /// Ids that are missing or owned by someone else are skipped.
    pub async fn messages_by_ids(&self, user_id: i64, ids: &[i64]) -> Result<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM messages WHERE user_id = ? AND id IN ({})",
            MESSAGE_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql).bind(user_id);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut found = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        found.sort_by_key(|m| ids.iter().position(|id| *id == m.id).unwrap_or(usize::MAX));
        Ok(found)
    }

    pub async fn recent_messages(
        &self,
        user_id: i64,
        limit: usize,
        order: RecentOrder,
    ) -> Result<Vec<Message>> {
        let order_by = match order {
            RecentOrder::Newest => "received_at DESC, id DESC",
            RecentOrder::UnreadFirst => "is_read ASC, received_at DESC, id DESC",
            RecentOrder::PriorityFirst => "COALESCE(ai_priority, 0) DESC, received_at DESC, id DESC",
        };
        let sql = format!(
            "SELECT {} FROM messages WHERE user_id = ? ORDER BY {} LIMIT ?",
            MESSAGE_COLUMNS, order_by
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Substring search over subject, preview, and sender for one user.
    ///
    /// A message matches when any term occurs; results are ranked by the
    /// number of matching terms, then by recency.
    pub async fn keyword_search(
        &self,
        user_id: i64,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Message>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let haystack = "LOWER(subject || ' ' || body_preview || ' ' || sender_name || ' ' || sender_address)";
        let hit_expr = terms
            .iter()
            .map(|_| format!("(INSTR({}, ?) > 0)", haystack))
            .collect::<Vec<_>>()
            .join(" + ");
        let sql = format!(
            "SELECT {cols}, ({hits}) AS hits FROM messages \
             WHERE user_id = ? AND ({hits}) > 0 \
             ORDER BY hits DESC, received_at DESC, id DESC LIMIT ?",
            cols = MESSAGE_COLUMNS,
            hits = hit_expr
        );

        let mut query = sqlx::query(&sql);
        for term in terms {
            query = query.bind(term.to_lowercase());
        }
        query = query.bind(user_id);
        for term in terms {
            query = query.bind(term.to_lowercase());
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;
        rows.iter().map(message_from_row).collect()
    }

    /// `(total, unread)` message counts for a user.
    pub async fn message_counts(&self, user_id: i64) -> Result<(i64, i64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0) AS unread \
             FROM messages WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get("total"), row.get("unread")))
    }

    /// Messages that have never been enriched, oldest first.
    pub async fn unenriched_message_ids(&self, user_id: i64, limit: usize) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM messages WHERE user_id = ? AND enriched_at IS NULL ORDER BY received_at, id LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Enriched messages whose index entry is missing or older than the enrichment.
    pub async fn unindexed_message_ids(&self, user_id: i64, limit: usize) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM messages
            WHERE user_id = ? AND enriched_at IS NOT NULL
              AND (indexed_at IS NULL OR indexed_at < enriched_at)
            ORDER BY received_at, id
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Overwrite the enrichment of a message. Returns the stored timestamp.
    pub async fn save_enrichment(&self, message_id: i64, enrichment: &Enrichment) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let fields = enrichment.fields();
        sqlx::query(
            r#"
            UPDATE messages SET
                ai_summary = ?, ai_tags_json = ?, ai_sentiment = ?, ai_priority = ?,
                ai_category = ?, ai_action_items_json = ?, ai_provenance = ?,
                enriched_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&fields.summary)
        .bind(serde_json::to_string(&fields.tags)?)
        .bind(fields.sentiment.as_str())
        .bind(fields.priority as i64)
        .bind(&fields.category)
        .bind(serde_json::to_string(&fields.action_items)?)
        .bind(enrichment.provenance().as_str())
        .bind(now)
        .bind(now)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving enrichment for message {}", message_id))?;

        // Member enrichment feeds thread-level AI fields
        mark_thread_stale_for_message(&self.pool, message_id).await?;
        Ok(now)
    }

    pub async fn mark_indexed(&self, message_id: i64, indexed_at: i64) -> Result<()> {
        sqlx::query("UPDATE messages SET indexed_at = ? WHERE id = ?")
            .bind(indexed_at)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Direct user action. Returns false when the message is not the user's.
    pub async fn set_read(&self, user_id: i64, message_id: i64, is_read: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = ?, updated_at = ? WHERE user_id = ? AND id = ? AND is_read != ?",
        )
        .bind(is_read)
        .bind(chrono::Utc::now().timestamp())
        .bind(user_id)
        .bind(message_id)
        .bind(is_read)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            mark_thread_stale_for_message(&self.pool, message_id).await?;
            return Ok(true);
        }
        // Already in the requested state still counts as success when the row exists
        Ok(self.get_message(user_id, message_id).await?.is_some())
    }

    /// Hard-delete one message row (user action only).
    pub async fn delete_message(&self, user_id: i64, message_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============ Chat log ============

    pub async fn insert_chat_exchange(&self, exchange: &ChatExchange) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_exchanges
                (id, user_id, query, intent, context_snapshot, response, cited_json, retrieval_mode, degraded, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&exchange.id)
        .bind(exchange.user_id)
        .bind(&exchange.query)
        .bind(&exchange.intent)
        .bind(&exchange.context_snapshot)
        .bind(&exchange.response)
        .bind(serde_json::to_string(&exchange.cited_message_ids)?)
        .bind(&exchange.retrieval_mode)
        .bind(exchange.degraded)
        .bind(exchange.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent exchanges first.
    pub async fn recent_exchanges(&self, user_id: i64, limit: usize) -> Result<Vec<ChatExchange>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_exchanges WHERE user_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let cited: String = row.get("cited_json");
                ChatExchange {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    query: row.get("query"),
                    intent: row.get("intent"),
                    context_snapshot: row.get("context_snapshot"),
                    response: row.get("response"),
                    cited_message_ids: serde_json::from_str(&cited).unwrap_or_default(),
                    retrieval_mode: row.get("retrieval_mode"),
                    degraded: row.get("degraded"),
                    created_at: row.get("created_at"),
                }
            })
            .collect())
    }
}

// ============ Sync writes (run inside the sync transaction) ============

/// Insert a new message or refresh the mutable flags of an existing one.
///
/// Identity fields (provider id, conversation key, sender, recipients,
/// bodies, timestamps) are written once and never touched again.
pub async fn upsert_message(
    conn: &mut SqliteConnection,
    user_id: i64,
    msg: &NewMessage,
) -> Result<UpsertOutcome> {
    let now = chrono::Utc::now().timestamp();
    let categories_json = serde_json::to_string(&msg.categories)?;

    let existing = sqlx::query(
        "SELECT id, is_read, categories_json, thread_id FROM messages WHERE user_id = ? AND provider_id = ?",
    )
    .bind(user_id)
    .bind(&msg.provider_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = existing {
        let id: i64 = row.get("id");
        let is_read: bool = row.get("is_read");
        let categories: String = row.get("categories_json");
        let thread_id: Option<i64> = row.get("thread_id");

        if is_read == msg.is_read && categories == categories_json {
            return Ok(UpsertOutcome::Unchanged(id));
        }

        sqlx::query("UPDATE messages SET is_read = ?, categories_json = ?, updated_at = ? WHERE id = ?")
            .bind(msg.is_read)
            .bind(&categories_json)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;

        if let Some(thread_id) = thread_id {
            sqlx::query("UPDATE threads SET stale = 1 WHERE id = ?")
                .bind(thread_id)
                .execute(&mut *conn)
                .await?;
        }
        return Ok(UpsertOutcome::Updated(id));
    }

    let result = sqlx::query(
        r#"
        INSERT INTO messages (
            user_id, provider_id, conversation_key, subject, sender_address, sender_name,
            to_json, cc_json, bcc_json, body_content_type, body_html, body_text, body_preview,
            importance, is_read, is_draft, has_attachments, is_sent_item, folder, categories_json,
            received_at, sent_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(&msg.provider_id)
    .bind(&msg.conversation_key)
    .bind(&msg.subject)
    .bind(&msg.sender.address)
    .bind(&msg.sender.name)
    .bind(serde_json::to_string(&msg.to)?)
    .bind(serde_json::to_string(&msg.cc)?)
    .bind(serde_json::to_string(&msg.bcc)?)
    .bind(&msg.body_content_type)
    .bind(&msg.body_html)
    .bind(&msg.body_text)
    .bind(&msg.body_preview)
    .bind(msg.importance.as_str())
    .bind(msg.is_read)
    .bind(msg.is_draft)
    .bind(msg.has_attachments)
    .bind(msg.is_sent_item)
    .bind(&msg.folder)
    .bind(&categories_json)
    .bind(msg.received_at)
    .bind(msg.sent_at)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(UpsertOutcome::Inserted(result.last_insert_rowid()))
}

/// Persist the provider cursor and sync time for a user.
pub async fn advance_cursor(
    conn: &mut SqliteConnection,
    user_id: i64,
    cursor: Option<&str>,
    synced_at: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE users SET last_sync_cursor = ?, last_synced_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(cursor)
    .bind(synced_at)
    .bind(synced_at)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn mark_thread_stale_for_message(pool: &SqlitePool, message_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE threads SET stale = 1 WHERE id = (SELECT thread_id FROM messages WHERE id = ?)",
    )
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Row mapping ============

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let preferences: String = row.get("preferences_json");
    Ok(User {
        id: row.get("id"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        timezone: row.get("timezone"),
        preferences: serde_json::from_str(&preferences).unwrap_or(serde_json::json!({})),
        is_active: row.get("is_active"),
        last_sync_cursor: row.get("last_sync_cursor"),
        last_synced_at: row.get("last_synced_at"),
        created_at: row.get("created_at"),
    })
}

pub(crate) fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let addresses = |col: &str| -> Vec<Address> {
        let raw: String = row.get(col);
        serde_json::from_str(&raw).unwrap_or_default()
    };
    let categories: String = row.get("categories_json");
    let importance: String = row.get("importance");

    let enriched_at: Option<i64> = row.get("enriched_at");
    let enrichment = match enriched_at {
        Some(enriched_at) => {
            let tags: Option<String> = row.get("ai_tags_json");
            let actions: Option<String> = row.get("ai_action_items_json");
            let sentiment: Option<String> = row.get("ai_sentiment");
            let priority: Option<i64> = row.get("ai_priority");
            let provenance: Option<String> = row.get("ai_provenance");
            Some(StoredEnrichment {
                fields: EnrichmentFields {
                    summary: row.get::<Option<String>, _>("ai_summary").unwrap_or_default(),
                    tags: tags
                        .and_then(|t| serde_json::from_str(&t).ok())
                        .unwrap_or_default(),
                    sentiment: sentiment
                        .as_deref()
                        .and_then(Sentiment::parse)
                        .unwrap_or(Sentiment::Neutral),
                    priority: priority.unwrap_or(5).clamp(1, 10) as u8,
                    category: row
                        .get::<Option<String>, _>("ai_category")
                        .unwrap_or_else(|| "general".to_string()),
                    action_items: actions
                        .and_then(|a| serde_json::from_str(&a).ok())
                        .unwrap_or_default(),
                },
                provenance: Provenance::parse(provenance.as_deref().unwrap_or("heuristic")),
                enriched_at,
            })
        }
        None => None,
    };

    Ok(Message {
        id: row.get("id"),
        user_id: row.get("user_id"),
        provider_id: row.get("provider_id"),
        conversation_key: row.get("conversation_key"),
        thread_id: row.get("thread_id"),
        subject: row.get("subject"),
        sender: Address {
            address: row.get("sender_address"),
            name: row.get("sender_name"),
        },
        to: addresses("to_json"),
        cc: addresses("cc_json"),
        bcc: addresses("bcc_json"),
        body_html: row.get("body_html"),
        body_text: row.get("body_text"),
        body_preview: row.get("body_preview"),
        importance: Importance::parse(&importance),
        is_read: row.get("is_read"),
        is_draft: row.get("is_draft"),
        has_attachments: row.get("has_attachments"),
        is_sent_item: row.get("is_sent_item"),
        folder: row.get("folder"),
        categories: serde_json::from_str(&categories).unwrap_or_default(),
        received_at: row.get("received_at"),
        sent_at: row.get("sent_at"),
        enrichment,
        indexed_at: row.get("indexed_at"),
    })
}
