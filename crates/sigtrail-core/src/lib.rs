#![allow(clippy::doc_markdown)]

//! sigtrail-core - Electronic signature and schema-resilient audit engine.
//!
//! This library binds business records to the user, session and device that
//! signed them, re-verifies those bindings later to detect tampering or
//! revocation, and persists signatures and audit events through a write path
//! that degrades gracefully when the backing schema predates newer tracking
//! columns.
//!
//! # Modules
//!
//! - [`payload`]: Canonical, locale-independent payload encoding
//! - [`digest`]: SHA-256 signature tokens
//! - [`executor`]: Relational executor contract, schema-adaptive execution and
//!   the `SQLite` reference adapter
//! - [`store`]: Signature persistence (insert, fetch, conditional revoke)
//! - [`verify`]: Signature verification state machine
//! - [`audit`]: Append-only audit event writer
//! - [`signer`]: Sign and revoke workflows with their audit side effects
//! - [`entity`]: Signable entity kinds and the entity accessor contract
//! - [`session`]: Explicit signing context
//! - [`cancel`]: Cooperative cancellation token
//! - [`schema`]: Embedded DDL for the supported schema generations
//! - [`config`]: TOML configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sigtrail_core::audit::AuditEventWriter;
//! use sigtrail_core::cancel::Cancellation;
//! use sigtrail_core::config::EngineConfig;
//! use sigtrail_core::entity::{InMemoryEntityAccessor, Machine};
//! use sigtrail_core::executor::sqlite::SqliteExecutor;
//! use sigtrail_core::schema::SchemaGeneration;
//! use sigtrail_core::session::SessionContext;
//! use sigtrail_core::signer::SignatureService;
//! use sigtrail_core::store::SignatureStore;
//! use sigtrail_core::verify::SignatureVerifier;
//!
//! # async fn example() -> Result<(), sigtrail_core::EngineError> {
//! let config = EngineConfig::default();
//! let executor = Arc::new(SqliteExecutor::in_memory(SchemaGeneration::Current)?);
//! let store = SignatureStore::new(executor.clone());
//! let writer = AuditEventWriter::new(executor.clone(), &config);
//! let accessor = Arc::new(InMemoryEntityAccessor::new());
//!
//! let machine = Machine::new(7, "MX-7");
//! accessor.put(&machine);
//!
//! let service = SignatureService::new(store.clone(), writer.clone());
//! let ctx = SessionContext::new(42).with_session("sess-1").with_device("Device-A");
//! let cancel = Cancellation::new();
//! let record = service.sign(&machine, &ctx, "pin", None, &cancel).await?;
//!
//! let verifier = SignatureVerifier::new(store, writer, accessor, &config);
//! let outcome = verifier.verify(record.id, &cancel).await?;
//! assert!(outcome.is_valid());
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod cancel;
pub mod config;
pub mod digest;
pub mod entity;
mod error;
pub mod executor;
pub mod payload;
pub mod schema;
pub mod session;
pub mod signer;
pub mod store;
pub mod verify;

pub use error::EngineError;
