//! Command implementations.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use sigtrail_core::audit::{AuditEvent, AuditEventWriter};
use sigtrail_core::cancel::Cancellation;
use sigtrail_core::config::EngineConfig;
use sigtrail_core::digest::SignatureComputer;
use sigtrail_core::entity::{EntityAccessor, TableEntityAccessor};
use sigtrail_core::executor::RelationalExecutor;
use sigtrail_core::executor::sqlite::SqliteExecutor;
use sigtrail_core::payload::canonical_timestamp;
use sigtrail_core::schema::{self, SchemaGeneration};
use sigtrail_core::session::SessionContext;
use sigtrail_core::signer::SignatureService;
use sigtrail_core::store::{RevokeOutcome, SignatureRecord, SignatureStore};
use sigtrail_core::verify::SignatureVerifier;
use tracing::info;

/// Arguments for `sigtrail sign`.
#[derive(Args, Debug)]
pub struct SignArgs {
    /// Table of the record to sign
    #[arg(long)]
    pub table: String,

    /// Primary key of the record to sign
    #[arg(long)]
    pub record: i64,

    /// Signing user id
    #[arg(long)]
    pub user: i64,

    /// Login session identifier
    #[arg(long)]
    pub session: Option<String>,

    /// Device description
    #[arg(long)]
    pub device: Option<String>,

    /// Client address
    #[arg(long)]
    pub ip: Option<String>,

    /// Authentication method used to confirm the signature
    #[arg(long, default_value = "pin")]
    pub method: String,

    /// Free-form note stored with the signature
    #[arg(long)]
    pub note: Option<String>,
}

/// Everything a command needs, wired over one database.
pub struct Engine {
    store: SignatureStore,
    writer: AuditEventWriter,
    accessor: Arc<TableEntityAccessor>,
    service: SignatureService,
    verifier: SignatureVerifier,
    cancel: Cancellation,
}

impl Engine {
    /// Opens the configured database.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let executor = SqliteExecutor::open(
            &config.database.path,
            SchemaGeneration::Current,
            config.database.busy_timeout(),
        )
        .with_context(|| format!("failed to open {}", config.database.path.display()))?;
        Ok(Self::with_executor(Arc::new(executor), config))
    }

    fn with_executor(executor: Arc<dyn RelationalExecutor>, config: &EngineConfig) -> Self {
        let store = SignatureStore::new(executor.clone());
        let writer = AuditEventWriter::new(executor.clone(), config);
        let accessor = Arc::new(TableEntityAccessor::new(executor));
        Self {
            service: SignatureService::new(store.clone(), writer.clone()),
            verifier: SignatureVerifier::new(
                store.clone(),
                writer.clone(),
                accessor.clone(),
                config,
            ),
            store,
            writer,
            accessor,
            cancel: Cancellation::new(),
        }
    }
}

/// Creates the database and its tables.
pub fn init(config: &EngineConfig, legacy_audit: bool, out: &mut dyn Write) -> Result<()> {
    let generation = if legacy_audit {
        SchemaGeneration::Legacy
    } else {
        SchemaGeneration::Current
    };
    let executor = SqliteExecutor::open(
        &config.database.path,
        generation,
        config.database.busy_timeout(),
    )
    .with_context(|| format!("failed to open {}", config.database.path.display()))?;

    let conn = executor.connection();
    let conn = conn
        .lock()
        .map_err(|_| anyhow::anyhow!("database connection is poisoned"))?;
    schema::install_entity_tables(&conn).context("failed to create reference tables")?;
    let has_signature_columns =
        schema::has_column(&conn, "system_event_log", "digital_signature_id")
            .context("failed to inspect audit table")?;

    info!(path = %config.database.path.display(), ?generation, "database initialised");
    writeln!(
        out,
        "initialised {} (audit signature columns: {})",
        config.database.path.display(),
        if has_signature_columns { "yes" } else { "no" }
    )?;
    Ok(())
}

pub async fn sign(engine: &Engine, args: &SignArgs, out: &mut dyn Write) -> Result<()> {
    let Some(entity) = engine
        .accessor
        .load(&args.table, args.record, &engine.cancel)
        .await?
    else {
        bail!("no {} record with id {}", args.table, args.record);
    };

    let mut ctx = SessionContext::new(args.user);
    ctx.session_id.clone_from(&args.session);
    ctx.device_info.clone_from(&args.device);
    ctx.ip_address.clone_from(&args.ip);

    let record = engine
        .service
        .sign(&entity, &ctx, &args.method, args.note.as_deref(), &engine.cancel)
        .await?;
    writeln!(out, "signature {} created", record.id)?;
    write_record(out, &record)
}

/// Prints the outcome and returns `true` when the signature is valid.
pub async fn verify(
    engine: &Engine,
    id: i64,
    user: Option<i64>,
    out: &mut dyn Write,
) -> Result<bool> {
    let outcome = match user {
        Some(user) => {
            engine
                .verifier
                .verify_as(id, &SessionContext::new(user), &engine.cancel)
                .await?
        },
        None => engine.verifier.verify(id, &engine.cancel).await?,
    };
    writeln!(out, "{outcome}")?;
    Ok(outcome.is_valid())
}

pub async fn revoke(
    engine: &Engine,
    id: i64,
    reason: &str,
    actor: i64,
    out: &mut dyn Write,
) -> Result<()> {
    let outcome = engine
        .service
        .revoke(id, reason, &SessionContext::new(actor), &engine.cancel)
        .await?;
    match outcome {
        RevokeOutcome::Revoked => writeln!(out, "signature {id} revoked")?,
        RevokeOutcome::AlreadyRevoked => writeln!(out, "signature {id} was already revoked")?,
    }
    Ok(())
}

pub async fn show(engine: &Engine, id: i64, out: &mut dyn Write) -> Result<()> {
    let record = engine.store.get_by_id(id, &engine.cancel).await?;
    write_record(out, &record)
}

pub async fn latest(engine: &Engine, table: &str, record_id: i64, out: &mut dyn Write) -> Result<()> {
    match engine
        .store
        .get_latest_for(table, record_id, &engine.cancel)
        .await?
    {
        Some(record) => write_record(out, &record),
        None => {
            writeln!(out, "no signatures for {table}#{record_id}")?;
            Ok(())
        },
    }
}

pub async fn list(engine: &Engine, out: &mut dyn Write) -> Result<()> {
    for record in engine.store.list_all(&engine.cancel).await? {
        writeln!(
            out,
            "{} {}#{} user={} {} {}",
            record.id,
            record.table_name,
            record.record_id,
            record.user_id,
            record.status,
            canonical_timestamp(&record.signed_at)
        )?;
    }
    Ok(())
}

pub fn hash_file(path: &Path, out: &mut dyn Write) -> Result<()> {
    let digest = SignatureComputer::compute_file_signature(path)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    writeln!(out, "{} {}  {}", digest.algorithm, digest.hash, path.display())?;
    Ok(())
}

pub async fn events(
    engine: &Engine,
    limit: u32,
    signature: Option<i64>,
    out: &mut dyn Write,
) -> Result<()> {
    let events = match signature {
        Some(id) => engine.writer.for_signature(id, &engine.cancel).await?,
        None => engine.writer.recent(limit, &engine.cancel).await?,
    };
    for event in events.iter().take(limit as usize) {
        write_event(out, event)?;
    }
    Ok(())
}

fn write_record(out: &mut dyn Write, record: &SignatureRecord) -> Result<()> {
    writeln!(out, "id:        {}", record.id)?;
    writeln!(out, "record:    {}#{}", record.table_name, record.record_id)?;
    writeln!(out, "user:      {}", record.user_id)?;
    writeln!(out, "method:    {}", record.method)?;
    writeln!(out, "status:    {}", record.status)?;
    writeln!(out, "signed_at: {}", canonical_timestamp(&record.signed_at))?;
    writeln!(out, "hash:      {}", record.signature_hash)?;
    for (label, value) in [
        ("session:   ", &record.session_id),
        ("device:    ", &record.device_info),
        ("ip:        ", &record.ip_address),
        ("note:      ", &record.note),
    ] {
        if let Some(value) = value {
            writeln!(out, "{label}{value}")?;
        }
    }
    Ok(())
}

fn write_event(out: &mut dyn Write, event: &AuditEvent) -> Result<()> {
    let time = event
        .timestamp
        .as_ref()
        .map_or_else(|| "-".to_string(), canonical_timestamp);
    let severity = event.severity.map_or("-", |s| s.as_str());
    let record = event
        .record_id
        .map_or_else(String::new, |id| format!("#{id}"));
    writeln!(
        out,
        "{} {time} {severity:<8} {:<16} {}{record} {}",
        event.id.unwrap_or_default(),
        event.event_type,
        event.table_name,
        event.description.as_deref().unwrap_or("")
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.database.path = dir.path().join("sigtrail.db");
        config
    }

    fn insert_machine(config: &EngineConfig, code: &str) {
        let exec = SqliteExecutor::open(
            &config.database.path,
            SchemaGeneration::Current,
            config.database.busy_timeout(),
        )
        .unwrap();
        exec.connection()
            .lock()
            .unwrap()
            .execute(
                "INSERT OR REPLACE INTO machines (id, code) VALUES (7, ?1)",
                [code],
            )
            .unwrap();
    }

    #[tokio::test]
    async fn sign_verify_tamper_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let mut out = Vec::new();

        init(&config, false, &mut out).unwrap();
        insert_machine(&config, "MX-7");

        let engine = Engine::open(&config).unwrap();
        let args = SignArgs {
            table: "machines".into(),
            record: 7,
            user: 42,
            session: Some("sess-1".into()),
            device: Some("Device-A".into()),
            ip: None,
            method: "pin".into(),
            note: None,
        };
        sign(&engine, &args, &mut out).await.unwrap();
        assert!(verify(&engine, 1, None, &mut out).await.unwrap());

        insert_machine(&config, "MX-7X");
        assert!(!verify(&engine, 1, Some(3), &mut out).await.unwrap());

        let mut listing = Vec::new();
        list(&engine, &mut listing).await.unwrap();
        assert!(String::from_utf8(listing).unwrap().starts_with("1 machines#7 user=42 valid "));

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("signature 1 created"));
        assert!(text.contains("signature 1 failed: hash_mismatch"));
    }

    #[tokio::test]
    async fn signing_a_missing_record_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let mut out = Vec::new();
        init(&config, true, &mut out).unwrap();

        let engine = Engine::open(&config).unwrap();
        let args = SignArgs {
            table: "parts".into(),
            record: 1,
            user: 1,
            session: None,
            device: None,
            ip: None,
            method: "pin".into(),
            note: None,
        };
        let err = sign(&engine, &args, &mut out).await.unwrap_err();
        assert!(err.to_string().contains("no parts record with id 1"));
        assert!(String::from_utf8(out).unwrap().contains("audit signature columns: no"));
    }

    #[test]
    fn hash_file_prints_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, "abc").unwrap();

        let mut out = Vec::new();
        hash_file(&path, &mut out).unwrap();
        assert!(
            String::from_utf8(out)
                .unwrap()
                .starts_with("SHA-256 ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=  ")
        );
        assert!(hash_file(&dir.path().join("missing"), &mut Vec::new()).is_err());
    }
}
