//! offsync: keep recording writes while offline, reconcile them later.
//!
//! Producers queue mutations (create / merge-update / delete of one document) in
//! a durable local log whenever a write cannot be applied immediately. When
//! connectivity returns, a flush replays the log against the remote document
//! store in bounded, ordered, atomic batches, and clears the log only once
//! every batch has been confirmed.
//!
//! # Architecture
//!
//! - **Mutation log** ([`sync::log`]): SQLite-backed queue with ascending ids,
//!   one lazily-opened connection per file, shared process-wide through
//!   [`core::pool::shared_log`].
//! - **Normalizer** ([`sync::normalize`]): dates to timestamps, absent entries
//!   dropped, containers normalized recursively.
//! - **Sync engine** ([`sync::engine`]): snapshot, chunk (490 per batch by
//!   default), commit sequentially, retire the snapshot on full success.
//! - **Remote stores** ([`sync::remote`]): the [`sync::RemoteStore`] contract,
//!   an in-memory store and a SQLite replica.
//!
//! # Examples
//!
//! ```bash
//! offsync enqueue --action add --collection customers --payload '{"id":"c1","name":"Ana"}'
//! offsync list
//! offsync flush --user u1
//! offsync docs --collection users/u1/customers
//! ```

pub mod core;
pub mod sync;

use crate::core::{config::SyncConfig, db, pool, time};
use crate::sync::remote::SqliteStore;
use crate::sync::{Mutation, QueuedMutation, SyncEngine, Value};
use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "offsync",
    version = env!("CARGO_PKG_VERSION"),
    about = "Offline mutation queue and sync reconciliation"
)]
struct Cli {
    /// Directory holding mutations.db, replica.db and offsync.toml.
    #[clap(long, global = true, default_value = ".offsync")]
    data_dir: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ActionArg {
    Add,
    Update,
    Delete,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a mutation for the next flush
    Enqueue {
        #[clap(long, value_enum)]
        action: ActionArg,
        /// Collection path relative to the owning user, e.g. `customers`.
        #[clap(long)]
        collection: String,
        /// Target document; required for update and delete.
        #[clap(long)]
        doc_id: Option<String>,
        /// JSON object. `{"$date": "<rfc3339>"}` values are queued as dates.
        #[clap(long)]
        payload: Option<String>,
        /// Owning user, if not the one that will flush.
        #[clap(long)]
        target_user: Option<String>,
    },
    /// Show pending mutations in queue order
    List {
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show queue size, paths and effective configuration
    Status,
    /// Replay pending mutations into the replica store
    Flush {
        /// Owning user for records without their own target.
        #[clap(long)]
        user: String,
        /// Replica database (defaults to <data-dir>/replica.db).
        #[clap(long)]
        remote: Option<PathBuf>,
        /// Print the commit plan without committing anything.
        #[clap(long)]
        dry_run: bool,
    },
    /// Drop every pending mutation
    Clear,
    /// List documents of a replica collection
    Docs {
        /// Fully-qualified collection, e.g. `users/u1/customers`.
        #[clap(long)]
        collection: String,
        #[clap(long)]
        remote: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "offsync=debug" } else { "offsync=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_mutation(
    action: ActionArg,
    collection: String,
    doc_id: Option<String>,
    payload: Option<String>,
    target_user: Option<String>,
) -> anyhow::Result<QueuedMutation> {
    let payload = payload
        .map(|raw| serde_json::from_str::<serde_json::Value>(&raw).map(Value::from))
        .transpose()
        .context("--payload is not valid JSON")?;
    let require_doc_id = || {
        doc_id
            .clone()
            .ok_or_else(|| anyhow!("--doc-id is required for {:?}", action))
    };

    let mutation = match action {
        ActionArg::Add => Mutation::Add {
            doc_id: doc_id.clone(),
            payload: payload.unwrap_or_else(|| Value::Map(Default::default())),
        },
        ActionArg::Update => Mutation::Update {
            doc_id: require_doc_id()?,
            payload: payload.ok_or_else(|| anyhow!("--payload is required for update"))?,
        },
        ActionArg::Delete => Mutation::Delete {
            doc_id: require_doc_id()?,
        },
    };

    let mut record = QueuedMutation::new(collection, mutation);
    if let Some(user) = target_user {
        record = record.for_user(user);
    }
    Ok(record)
}

fn print_json(value: &serde_json::Value) {
    println!("{}", value);
}

fn print_records_text(records: &[QueuedMutation]) {
    use colored::Colorize;

    if records.is_empty() {
        println!("No pending mutations.");
        return;
    }
    for record in records {
        let action = match record.action() {
            sync::Action::Add => "add".bright_green(),
            sync::Action::Update => "update".bright_yellow(),
            sync::Action::Delete => "delete".bright_red(),
        };
        let target = record
            .target_user_id
            .as_deref()
            .map(|u| format!(" (user {})", u))
            .unwrap_or_default();
        println!(
            "{} {:<6} {}/{}{}",
            format!("#{}", record.id.unwrap_or_default()).bright_cyan(),
            action,
            record.collection_path,
            record.doc_id().unwrap_or("?"),
            target
        );
    }
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let data_dir = cli.data_dir;
    let config = SyncConfig::load(&data_dir)
        .with_context(|| format!("loading configuration from {}", data_dir.display()))?;
    let log = pool::shared_log(&db::mutation_log_path(&data_dir))?;
    let envelope = |cmd: &str, status: &str, body: serde_json::Value| {
        time::command_envelope(cmd, status, &data_dir, body)
    };

    match cli.command {
        Command::Enqueue {
            action,
            collection,
            doc_id,
            payload,
            target_user,
        } => {
            let record = build_mutation(action, collection, doc_id, payload, target_user)?;
            let id = log.enqueue(record).context("mutation was not queued")?;
            print_json(&envelope(
                "enqueue",
                "ok",
                serde_json::json!({ "id": id }),
            ));
        }
        Command::List { format } => {
            let snapshot = log.snapshot()?;
            match format {
                OutputFormat::Text => print_records_text(&snapshot.entries),
                OutputFormat::Json => print_json(&envelope(
                    "list",
                    "ok",
                    serde_json::json!({
                        "mutations": snapshot.entries,
                        "rejected": snapshot.rejected,
                    }),
                )),
            }
        }
        Command::Status => {
            print_json(&envelope(
                "status",
                "ok",
                serde_json::json!({
                    "pending": log.pending_count()?,
                    "log_path": log.path().display().to_string(),
                    "replica_path": db::replica_db_path(&data_dir).display().to_string(),
                    "config": config,
                }),
            ));
        }
        Command::Flush {
            user,
            remote,
            dry_run,
        } => {
            let replica_path = remote.unwrap_or_else(|| db::replica_db_path(&data_dir));
            let replica = SqliteStore::open(&replica_path)
                .with_context(|| format!("opening replica {}", replica_path.display()))?;
            let engine = SyncEngine::with_config(&log, &replica, config)?;

            if dry_run {
                let plan = engine.preview(Some(&user))?;
                let chunks: Vec<serde_json::Value> = plan
                    .chunks
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "index": c.index,
                            "ops": c.len(),
                            "first_id": c.first_id,
                            "last_id": c.last_id,
                        })
                    })
                    .collect();
                print_json(&envelope(
                    "flush",
                    "planned",
                    serde_json::json!({ "chunks": chunks, "skipped": plan.skipped }),
                ));
            } else {
                let report = engine
                    .flush(Some(&user))
                    .context("flush failed; pending mutations were kept for retry")?;
                print_json(&envelope(
                    "flush",
                    "ok",
                    serde_json::json!({
                        "applied": report.applied,
                        "chunks": report.chunks_committed,
                        "skipped": report.skipped,
                    }),
                ));
            }
        }
        Command::Clear => {
            let removed = log.clear()?;
            print_json(&envelope(
                "clear",
                "ok",
                serde_json::json!({ "removed": removed }),
            ));
        }
        Command::Docs { collection, remote } => {
            let replica_path = remote.unwrap_or_else(|| db::replica_db_path(&data_dir));
            let replica = SqliteStore::open(&replica_path)?;
            let docs: Vec<serde_json::Value> = replica
                .documents_in(&collection)?
                .into_iter()
                .map(|(id, data)| {
                    serde_json::json!({
                        "id": id,
                        "data": sync::WireValue::Map(data).to_json(),
                    })
                })
                .collect();
            print_json(&envelope(
                "docs",
                "ok",
                serde_json::json!({ "collection": collection, "documents": docs }),
            ));
        }
    }
    Ok(())
}
