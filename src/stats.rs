//! Mailbox analytics over a trailing window.
//!
//! [`mailbox_stats`] aggregates one user's messages received in the last
//! N days: volume, unread share, sent vs. received, top senders, sentiment
//! distribution, average priority, and a per-day histogram. The assistant
//! renders it as context for analytics questions; `mailctx stats` prints it.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::models::{format_ts, User};
use crate::store::MessageStore;

const TOP_SENDERS: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct SenderCount {
    pub address: String,
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayCount {
    /// `YYYY-MM-DD` (UTC).
    pub day: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MailboxStats {
    pub window_days: u32,
    pub since: i64,
    pub total: i64,
    pub unread: i64,
    pub sent: i64,
    pub received: i64,
    pub unread_pct: f64,
    pub top_senders: Vec<SenderCount>,
    /// Keyed by sentiment name; only enriched messages are counted.
    pub sentiment: BTreeMap<String, i64>,
    pub average_priority: Option<f64>,
    pub per_day: Vec<DayCount>,
}

pub async fn mailbox_stats(
    store: &MessageStore,
    user_id: i64,
    window_days: u32,
    now: i64,
) -> Result<MailboxStats> {
    let since = now - i64::from(window_days) * 86_400;
    let pool = store.pool();

    let totals = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0) AS unread,
            COALESCE(SUM(CASE WHEN is_sent_item = 1 THEN 1 ELSE 0 END), 0) AS sent,
            AVG(ai_priority) AS avg_priority
        FROM messages
        WHERE user_id = ? AND received_at >= ?
        "#,
    )
    .bind(user_id)
    .bind(since)
    .fetch_one(pool)
    .await?;

    let total: i64 = totals.get("total");
    let unread: i64 = totals.get("unread");
    let sent: i64 = totals.get("sent");
    let average_priority: Option<f64> = totals.get("avg_priority");

    let top_senders = sqlx::query(
        r#"
        SELECT LOWER(sender_address) AS address, MAX(sender_name) AS name, COUNT(*) AS n
        FROM messages
        WHERE user_id = ? AND received_at >= ? AND is_sent_item = 0 AND sender_address != ''
        GROUP BY LOWER(sender_address)
        ORDER BY n DESC, address ASC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(since)
    .bind(TOP_SENDERS)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| SenderCount {
        address: row.get("address"),
        name: row.get("name"),
        count: row.get("n"),
    })
    .collect();

    let sentiment = sqlx::query(
        r#"
        SELECT ai_sentiment AS sentiment, COUNT(*) AS n
        FROM messages
        WHERE user_id = ? AND received_at >= ? AND ai_sentiment IS NOT NULL
        GROUP BY ai_sentiment
        "#,
    )
    .bind(user_id)
    .bind(since)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| (row.get::<String, _>("sentiment"), row.get::<i64, _>("n")))
    .collect();

    let per_day = sqlx::query(
        r#"
        SELECT strftime('%Y-%m-%d', received_at, 'unixepoch') AS day, COUNT(*) AS n
        FROM messages
        WHERE user_id = ? AND received_at >= ?
        GROUP BY day
        ORDER BY day ASC
        "#,
    )
    .bind(user_id)
    .bind(since)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| DayCount {
        day: row.get("day"),
        count: row.get("n"),
    })
    .collect();

    Ok(MailboxStats {
        window_days,
        since,
        total,
        unread,
        sent,
        received: total - sent,
        unread_pct: if total > 0 {
            unread as f64 * 100.0 / total as f64
        } else {
            0.0
        },
        top_senders,
        sentiment,
        average_priority,
        per_day,
    })
}

impl MailboxStats {
    /// Plain-text rendering used as assistant context.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Email statistics for the last {} days:\n\
             Total: {} (received {}, sent {})\n\
             Unread: {} ({:.1}%)\n",
            self.window_days, self.total, self.received, self.sent, self.unread, self.unread_pct
        );
        if let Some(avg) = self.average_priority {
            out.push_str(&format!("Average priority: {:.1}\n", avg));
        }
        if !self.sentiment.is_empty() {
            let parts: Vec<String> = self
                .sentiment
                .iter()
                .map(|(s, n)| format!("{} {}", s, n))
                .collect();
            out.push_str(&format!("Sentiment: {}\n", parts.join(", ")));
        }
        if !self.top_senders.is_empty() {
            out.push_str("Top senders:\n");
            for s in &self.top_senders {
                if s.name.is_empty() {
                    out.push_str(&format!("- {}: {}\n", s.address, s.count));
                } else {
                    out.push_str(&format!("- {} <{}>: {}\n", s.name, s.address, s.count));
                }
            }
        }
        out
    }
}

/// Print stats for `mailctx stats`.
pub fn print_stats(user: &User, stats: &MailboxStats) {
    println!("Mailbox Stats: {}", user.email);
    println!("================================");
    println!();
    println!(
        "  Window:      last {} days (since {})",
        stats.window_days,
        format_ts(stats.since)
    );
    println!(
        "  Last sync:   {}",
        user.last_synced_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  Messages:    {}", stats.total);
    println!("  Received:    {}", stats.received);
    println!("  Sent:        {}", stats.sent);
    println!("  Unread:      {} ({:.1}%)", stats.unread, stats.unread_pct);
    if let Some(avg) = stats.average_priority {
        println!("  Avg prio:    {:.1}", avg);
    }

    if !stats.sentiment.is_empty() {
        println!();
        println!("  Sentiment:");
        for (sentiment, n) in &stats.sentiment {
            println!("  {:<12} {:>6}", sentiment, n);
        }
    }

    if !stats.top_senders.is_empty() {
        println!();
        println!("  {:<40} {:>6}", "TOP SENDERS", "COUNT");
        println!("  {}", "-".repeat(47));
        for s in &stats.top_senders {
            println!("  {:<40} {:>6}", s.address, s.count);
        }
    }

    if !stats.per_day.is_empty() {
        println!();
        println!("  Per day:");
        for d in &stats.per_day {
            println!("  {}  {:>4}", d.day, d.count);
        }
    }
    println!();
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts(ts)
    }
}
