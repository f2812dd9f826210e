use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Users: sync cursor lives on the user row and is written with the page it represents
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            display_name TEXT,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            preferences_json TEXT NOT NULL DEFAULT '{}',
            is_active INTEGER NOT NULL DEFAULT 1,
            last_sync_cursor TEXT,
            last_synced_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Threads: stats are a derived cache recomputed from member messages
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS threads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            conversation_key TEXT NOT NULL,
            subject TEXT,
            participants_json TEXT NOT NULL DEFAULT '[]',
            message_count INTEGER NOT NULL DEFAULT 0,
            unread_count INTEGER NOT NULL DEFAULT 0,
            first_message_at INTEGER,
            last_message_at INTEGER,
            ai_summary TEXT,
            ai_sentiment TEXT,
            action_required INTEGER NOT NULL DEFAULT 0,
            stale INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            UNIQUE(user_id, conversation_key),
            FOREIGN KEY (user_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Messages: one enrichment per message, stored inline
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            provider_id TEXT NOT NULL,
            conversation_key TEXT,
            thread_id INTEGER,
            subject TEXT NOT NULL DEFAULT '',
            sender_address TEXT NOT NULL DEFAULT '',
            sender_name TEXT NOT NULL DEFAULT '',
            to_json TEXT NOT NULL DEFAULT '[]',
            cc_json TEXT NOT NULL DEFAULT '[]',
            bcc_json TEXT NOT NULL DEFAULT '[]',
            body_content_type TEXT NOT NULL DEFAULT 'text',
            body_html TEXT,
            body_text TEXT NOT NULL DEFAULT '',
            body_preview TEXT NOT NULL DEFAULT '',
            importance TEXT NOT NULL DEFAULT 'normal',
            is_read INTEGER NOT NULL DEFAULT 0,
            is_draft INTEGER NOT NULL DEFAULT 0,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            is_sent_item INTEGER NOT NULL DEFAULT 0,
            folder TEXT NOT NULL DEFAULT 'inbox',
            categories_json TEXT NOT NULL DEFAULT '[]',
            received_at INTEGER NOT NULL,
            sent_at INTEGER,
            ai_summary TEXT,
            ai_tags_json TEXT,
            ai_sentiment TEXT,
            ai_priority INTEGER,
            ai_category TEXT,
            ai_action_items_json TEXT,
            ai_provenance TEXT,
            enriched_at INTEGER,
            indexed_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(user_id, provider_id),
            FOREIGN KEY (user_id) REFERENCES users(id),
            FOREIGN KEY (thread_id) REFERENCES threads(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only log of assistant turns
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_exchanges (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            query TEXT NOT NULL,
            intent TEXT NOT NULL,
            context_snapshot TEXT NOT NULL,
            response TEXT NOT NULL,
            cited_json TEXT NOT NULL DEFAULT '[]',
            retrieval_mode TEXT NOT NULL,
            degraded INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-user sync leases (single writer per mailbox)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_leases (
            user_id INTEGER PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector collection, logically partitioned by user_id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_vectors (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            message_id INTEGER NOT NULL,
            subject TEXT NOT NULL DEFAULT '',
            sender TEXT NOT NULL DEFAULT '',
            received_at INTEGER NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_user_received ON messages(user_id, received_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_unthreaded ON messages(user_id, conversation_key) WHERE thread_id IS NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chat_user_created ON chat_exchanges(user_id, created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_user ON message_vectors(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_message ON message_vectors(message_id)")
        .execute(pool)
        .await?;

    Ok(())
}
