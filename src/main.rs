//! Drop-folder gateway binary.
//!
//! Watches an inbox directory for raw message files named
//! `<kind-code>-<anything>.txt` (e.g. `760-guarantee.txt`), ingests
//! them into the engine, and moves them into `processed/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use guaranty_engine::alert::TracingAlertSink;
use guaranty_engine::config::EngineConfig;
use guaranty_engine::engine::ProcessingEngine;
use guaranty_engine::guarantee::MemoryGuaranteeStore;
use guaranty_engine::message::MessageKind;
use guaranty_engine::refs::CounterReferenceGenerator;
use guaranty_engine::store::{LibSqlMessageStore, MessageStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();
    let db_path =
        std::env::var("GUARANTY_DB_PATH").unwrap_or_else(|_| "./data/guaranty.db".to_string());
    let inbox: PathBuf = std::env::var("GUARANTY_INBOX_DIR")
        .unwrap_or_else(|_| "./data/inbox".to_string())
        .into();
    let poll_secs: u64 = std::env::var("GUARANTY_INBOX_POLL_SECS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()
        .unwrap_or(5);

    eprintln!("Guaranty engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {db_path}");
    eprintln!("   Inbox:    {}", inbox.display());
    eprintln!("   Workers:  {}", config.workers);

    let store: Arc<dyn MessageStore> =
        Arc::new(LibSqlMessageStore::new_local(Path::new(&db_path)).await?);
    let engine = ProcessingEngine::new(
        store,
        Arc::new(MemoryGuaranteeStore::new()),
        Arc::new(CounterReferenceGenerator::new()),
        Arc::new(TracingAlertSink),
        config,
    );

    let _workers = engine.spawn_workers();
    let _retry_loop = engine.spawn_retry_loop();
    let _stuck_sweep = engine.spawn_stuck_sweep();

    info!(poll_secs, "Inbox poll loop started");
    let mut tick = tokio::time::interval(Duration::from_secs(poll_secs));
    loop {
        tick.tick().await;
        if let Err(e) = ingest_inbox(&engine, &inbox).await {
            warn!(error = %e, "Inbox sweep failed");
        }
    }
}

/// Ingest every recognizable file in the inbox, moving each into
/// `processed/` once the engine has persisted it.
async fn ingest_inbox(engine: &Arc<ProcessingEngine>, inbox: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(inbox)?;
    let processed_dir = inbox.join("processed");
    std::fs::create_dir_all(&processed_dir)?;

    for entry in std::fs::read_dir(inbox)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(kind) = kind_for_file(name) else {
            warn!(file = name, "No kind code in file name, skipping");
            continue;
        };

        let raw = std::fs::read_to_string(&path)?;
        match engine.receive(&raw, kind).await {
            Ok(message) => {
                info!(
                    file = name,
                    reference = %message.reference,
                    kind = %kind,
                    "File ingested"
                );
                std::fs::rename(&path, processed_dir.join(name))?;
            }
            Err(e) => warn!(file = name, error = %e, "Ingestion failed, leaving file in place"),
        }
    }
    Ok(())
}

/// Resolve the message kind from a `<code>-...` file name.
fn kind_for_file(name: &str) -> Option<MessageKind> {
    let code = name.split('-').next()?;
    MessageKind::from_code(code)
}
