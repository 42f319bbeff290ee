//! Database schema definitions for the offsync data directory.
//!
//! Two SQLite files live side by side:
//! 1. mutations.db: the durable queue of pending writes.
//! 2. replica.db: a local replica of the remote document store, used as the
//!    flush target by the CLI.

pub const CONFIG_FILE_NAME: &str = "offsync.toml";

// --- 1. Mutation log ---
pub const MUTATION_LOG_DB_NAME: &str = "mutations.db";

// AUTOINCREMENT keeps ids monotonic across clears; a plain rowid could be reused.
pub const MUTATION_LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS mutations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        collection_path TEXT NOT NULL,
        doc_id TEXT,
        payload TEXT,
        target_user_id TEXT,
        content_hash TEXT NOT NULL,
        queued_at TEXT NOT NULL
    )
";

// --- 2. Replica ---
pub const REPLICA_DB_NAME: &str = "replica.db";

pub const REPLICA_DOCUMENTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        path TEXT PRIMARY KEY,
        collection TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        data TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";
pub const REPLICA_DOCUMENTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection)";

pub const REPLICA_COMMITS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS commits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        op_count INTEGER NOT NULL,
        committed_at TEXT NOT NULL
    )
";
