//! # Mail Harness CLI (`mailctx`)
//!
//! Drives the mail pipeline from the command line: create users, sync a
//! mailbox, inspect threads, backfill enrichment and vectors, search, and
//! ask the assistant.
//!
//! ## Usage
//!
//! ```bash
//! mailctx --config ./config/mail.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mailctx init` | Create the SQLite database and run schema migrations |
//! | `mailctx user add <email>` | Register a mailbox owner |
//! | `mailctx sync --user <email>` | Sync, thread, enrich, and index new messages |
//! | `mailctx threads --user <email>` | List conversations, most recent first |
//! | `mailctx thread --user <email> <key>` | Show one conversation |
//! | `mailctx enrich pending --user <email>` | Enrich messages that never were |
//! | `mailctx index pending --user <email>` | Re-index messages with missing or stale vectors |
//! | `mailctx search --user <email> "<query>"` | Show the context the assistant would use |
//! | `mailctx ask --user <email> "<query>"` | One assistant turn |
//! | `mailctx stats --user <email>` | Mailbox analytics |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); results go to stdout.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mail_harness::assistant::ContextRef;
use mail_harness::cancel::Cancellation;
use mail_harness::config::{self, Config};
use mail_harness::migrate;
use mail_harness::models::{format_ts, User};
use mail_harness::pipeline::Pipeline;
use mail_harness::stats;
use mail_harness::sync::SyncError;
use mail_harness::threads;

/// Mail Harness CLI: mailbox ingestion, enrichment, and grounded retrieval.
#[derive(Parser)]
#[command(
    name = "mailctx",
    about = "Mail Harness: mailbox ingestion, enrichment, and grounded retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mail.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Manage mailbox owners.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Sync one folder, then thread, enrich, and index what arrived.
    Sync {
        #[arg(long)]
        user: String,
        /// Provider folder (defaults to `[sync] default_folder`).
        #[arg(long)]
        folder: Option<String>,
        /// Maximum messages fetched in this run.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List conversations, most recently active first.
    Threads {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one conversation and its messages.
    Thread {
        #[arg(long)]
        user: String,
        /// Conversation key.
        key: String,
    },

    /// Enrichment backfill and forced re-enrichment.
    Enrich {
        #[command(subcommand)]
        action: EnrichAction,
    },

    /// Vector index maintenance.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Show the messages the assistant would use as context for a query.
    Search {
        #[arg(long)]
        user: String,
        query: String,
    },

    /// Messages most similar to a given one.
    Similar {
        #[arg(long)]
        user: String,
        message_id: i64,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Ask the assistant.
    Ask {
        #[arg(long)]
        user: String,
        query: String,
        /// Use this message as the context.
        #[arg(long, conflicts_with = "thread")]
        message: Option<i64>,
        /// Use this conversation as the context.
        #[arg(long)]
        thread: Option<String>,
        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Mark a message read (or unread with `--unread`).
    Read {
        #[arg(long)]
        user: String,
        message_id: i64,
        #[arg(long)]
        unread: bool,
    },

    /// Delete a message and its vectors.
    Delete {
        #[arg(long)]
        user: String,
        message_id: i64,
    },

    /// Recent assistant exchanges, newest first.
    History {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Mailbox analytics over a trailing window.
    Stats {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Register a user (or update their name/timezone).
    Add {
        email: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
    },
    /// Soft-deactivate a user.
    Deactivate { email: String },
}

#[derive(Subcommand)]
enum EnrichAction {
    /// Enrich messages that were never enriched.
    Pending {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Re-enrich one message, overwriting its enrichment.
    Message {
        #[arg(long)]
        user: String,
        message_id: i64,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Index enriched messages whose vector is missing or stale.
    Pending {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let pipeline = Pipeline::from_config(&cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::User { action } => match action {
            UserAction::Add {
                email,
                name,
                timezone,
            } => {
                let user = pipeline
                    .store()
                    .ensure_user(&email, name.as_deref(), timezone.as_deref())
                    .await?;
                println!("User {} ({})", user.id, user.email);
            }
            UserAction::Deactivate { email } => {
                let user = resolve_user(&pipeline, &email).await?;
                pipeline.deactivate_user(user.id).await?;
                println!("Deactivated {}", user.email);
            }
        },
        Commands::Sync {
            user,
            folder,
            limit,
        } => {
            let user = resolve_user(&pipeline, &user).await?;
            run_sync(&pipeline, &cfg, &user, folder.as_deref(), limit).await?;
        }
        Commands::Threads { user, limit } => {
            let user = resolve_user(&pipeline, &user).await?;
            let list = threads::list_threads(pipeline.store(), user.id, limit).await?;
            if list.is_empty() {
                println!("No threads.");
            }
            for t in list {
                println!(
                    "{}  {:>3} msgs {:>3} unread{}  {}",
                    t.last_message_at.map(format_ts).unwrap_or_default(),
                    t.message_count,
                    t.unread_count,
                    if t.action_required { "  [action]" } else { "" },
                    t.subject.as_deref().unwrap_or("(no subject)"),
                );
                println!("    key: {}", t.conversation_key);
            }
        }
        Commands::Thread { user, key } => {
            let user = resolve_user(&pipeline, &user).await?;
            match pipeline.get_thread(user.id, &key).await? {
                Some(view) => {
                    let t = &view.thread;
                    println!("{}", t.subject.as_deref().unwrap_or("(no subject)"));
                    println!("Participants: {}", t.participants.join(", "));
                    println!(
                        "Messages: {} ({} unread)",
                        t.message_count, t.unread_count
                    );
                    if let Some(summary) = &t.ai_summary {
                        println!("Summary: {}", summary);
                    }
                    if let Some(sentiment) = t.ai_sentiment {
                        println!("Sentiment: {}", sentiment.as_str());
                    }
                    println!();
                    for m in &view.messages {
                        println!(
                            "#{} {}  {}  {}{}",
                            m.id,
                            format_ts(m.received_at),
                            m.sender.display(),
                            m.subject,
                            if m.is_read { "" } else { "  (unread)" }
                        );
                        if let Some(summary) = &m.summary {
                            println!("    {}", summary);
                        }
                    }
                }
                None => println!("No thread with key {}", key),
            }
        }
        Commands::Enrich { action } => match action {
            EnrichAction::Pending { user, limit } => {
                let user = resolve_user(&pipeline, &user).await?;
                let cancel = cancel_on_ctrl_c();
                let result = pipeline.enrich_pending(user.id, limit, &cancel).await?;
                println!(
                    "Enriched {} ({} llm, {} heuristic), skipped {}, indexed {}, index failures {}",
                    result.enriched,
                    result.llm_derived,
                    result.heuristic_derived,
                    result.skipped,
                    result.indexed,
                    result.index_failures
                );
            }
            EnrichAction::Message { user, message_id } => {
                let user = resolve_user(&pipeline, &user).await?;
                match pipeline.reenrich(user.id, message_id).await? {
                    Some(e) => println!("{}", serde_json::to_string_pretty(e.fields())?),
                    None => println!("No message #{}", message_id),
                }
            }
        },
        Commands::Index { action } => match action {
            IndexAction::Pending { user, limit } => {
                let user = resolve_user(&pipeline, &user).await?;
                let report = pipeline.index_pending(user.id, limit).await?;
                println!("Indexed {}, failed {}", report.indexed, report.failed);
            }
        },
        Commands::Search { user, query } => {
            let user = resolve_user(&pipeline, &user).await?;
            let found = pipeline.search(user.id, &query).await?;
            println!("Retrieval: {}", found.mode.as_str());
            if found.messages.is_empty() {
                println!("No results.");
            }
            for (i, m) in found.messages.iter().enumerate() {
                println!(
                    "{}. #{} {}  {}  {}",
                    i + 1,
                    m.id,
                    format_ts(m.received_at),
                    m.sender.short(),
                    m.subject
                );
            }
        }
        Commands::Similar {
            user,
            message_id,
            limit,
        } => {
            let user = resolve_user(&pipeline, &user).await?;
            let hits = pipeline.similar(user.id, message_id, limit).await?;
            if hits.is_empty() {
                println!("No similar messages.");
            }
            for h in hits {
                println!(
                    "{:.3}  #{}  {}  {}",
                    h.score, h.message_id, h.metadata.sender, h.metadata.subject
                );
            }
        }
        Commands::Ask {
            user,
            query,
            message,
            thread,
            json,
        } => {
            let user = resolve_user(&pipeline, &user).await?;
            let context_ref = match (message, thread) {
                (Some(id), _) => Some(ContextRef::Message(id)),
                (None, Some(key)) => Some(ContextRef::Thread(key)),
                (None, None) => None,
            };
            let answer = pipeline.ask(user.id, &query, context_ref.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("{}", answer.response_text);
                println!();
                if !answer.cited_message_ids.is_empty() {
                    let cited: Vec<String> = answer
                        .cited_message_ids
                        .iter()
                        .map(|id| format!("#{}", id))
                        .collect();
                    println!("Sources: {}", cited.join(" "));
                }
                println!("Suggestions:");
                for s in &answer.suggestions {
                    println!("  - {}", s);
                }
            }
        }
        Commands::Read {
            user,
            message_id,
            unread,
        } => {
            let user = resolve_user(&pipeline, &user).await?;
            if pipeline.mark_read(user.id, message_id, !unread).await? {
                println!(
                    "Marked #{} {}",
                    message_id,
                    if unread { "unread" } else { "read" }
                );
            } else {
                println!("No message #{}", message_id);
            }
        }
        Commands::Delete { user, message_id } => {
            let user = resolve_user(&pipeline, &user).await?;
            if pipeline.delete_message(user.id, message_id).await? {
                println!("Deleted #{}", message_id);
            } else {
                println!("No message #{}", message_id);
            }
        }
        Commands::History { user, limit } => {
            let user = resolve_user(&pipeline, &user).await?;
            for ex in pipeline.recent_exchanges(user.id, limit).await? {
                println!(
                    "{}  [{}{}] {}",
                    format_ts(ex.created_at),
                    ex.intent,
                    if ex.degraded { ", degraded" } else { "" },
                    ex.query
                );
            }
        }
        Commands::Stats { user, days } => {
            let user = resolve_user(&pipeline, &user).await?;
            let now = chrono::Utc::now().timestamp();
            let s = stats::mailbox_stats(pipeline.store(), user.id, days, now).await?;
            stats::print_stats(&user, &s);
        }
    }

    Ok(())
}

async fn resolve_user(pipeline: &Pipeline, email: &str) -> Result<User> {
    match pipeline.store().find_user_by_email(email).await? {
        Some(user) => Ok(user),
        None => bail!("Unknown user {}; run `mailctx user add {}` first", email, email),
    }
}

async fn run_sync(
    pipeline: &Pipeline,
    cfg: &Config,
    user: &User,
    folder: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let report = match pipeline.trigger_sync(user.id, folder, limit, &cancel).await {
        Ok(report) => report,
        Err(SyncError::Provider { error, partial }) => {
            println!(
                "Sync stopped after {} new messages: {}",
                partial.new_count, error
            );
            return Err(SyncError::Provider { error, partial }.into());
        }
        Err(e) => return Err(e.into()),
    };

    let s = &report.sync;
    println!(
        "Synced {} ({}): {} new, {} updated, {} unchanged, {} errors, {} pages{}",
        user.email,
        folder.unwrap_or(&cfg.sync.default_folder),
        s.new_count,
        s.updated_count,
        s.unchanged_count,
        s.errors.len(),
        s.pages,
        if s.cancelled { " (cancelled)" } else { "" }
    );
    for e in &s.errors {
        println!(
            "  error: {}: {}",
            e.provider_id.as_deref().unwrap_or("(no id)"),
            e.reason
        );
    }
    println!(
        "Threads: {} assigned, {} created, {} recomputed",
        report.threads.assigned, report.threads.created, report.threads.recomputed
    );
    println!(
        "Enriched {} ({} llm, {} heuristic), indexed {}",
        report.enrichment.enriched,
        report.enrichment.llm_derived,
        report.enrichment.heuristic_derived,
        report.enrichment.indexed
    );
    Ok(())
}

fn cancel_on_ctrl_c() -> Cancellation {
    let cancel = Cancellation::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    cancel
}
