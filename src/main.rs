//! CLI entry point for the realm-ledger backend.
//!
//! # Architecture Flow
//!
//! ```text
//! main.rs (Runtime + tracing initialization)
//!     |
//! CLI Layer (src/cli.rs)
//!     |
//! 1. Config Layer (src/config.rs)       -> Load environment variables
//! 2. DB Layer (src/db)                  -> Pool, migrations, repository
//! 3. Chain Layer (src/chain)            -> Multi-endpoint RPC clients
//! 4. Indexers (src/indexer)             -> Checkpointed event ingestion
//! 5. Payments (src/payments)            -> Transfer-to-request matching
//! 6. Pricing/Valuation                  -> USD resolution and TVL
//! 7. Scheduler (src/scheduler.rs)       -> Jobs + task lifecycle
//! 8. API (src/api)                      -> REST read models
//! ```
//!
//! main.rs owns only the async runtime and logging bootstrap; all layer
//! orchestration happens inside `cli::run()`.

use realm_ledger::{cli, observability};

/// Entry point: initialize tracing, then delegate to the CLI.
#[tokio::main]
async fn main() {
    let (level, file, json) = observability::logging_from_env();
    if let Err(e) = observability::init_tracing(level, file, json) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = cli::run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
