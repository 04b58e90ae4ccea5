//! tasklog-core: crash-safe storage for an agent's per-task conversation logs.
//!
//! Each task owns a directory holding an API-format log and a UI log. Files
//! are replaced atomically, readers coordinate through advisory heartbeat
//! locks, and history left in legacy files or interrupted writes is picked up
//! transparently.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tasklog_core::{ConversationStore, LockManager, Record, StoreConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), tasklog_core::StoreError> {
//!     let locks = Arc::new(LockManager::new());
//!     let store = ConversationStore::api("/var/lib/agent", StoreConfig::default(), locks);
//!
//!     let mut history = store.read_records("task-1").await?;
//!     history.push(Record::message("user", "Hello!"));
//!     store.write("task-1", &history).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod paths;
pub mod record;
pub mod recovery;
pub mod safe_io;
pub mod store;

pub use config::{LockConfig, RecoveryConfig, RetryConfig, StoreConfig};
pub use error::{FileRole, LockError, StoreError};
pub use lock::{LockGuard, LockManager, LockState, LockStatus};
pub use paths::{TaskDirectoryResolver, TasksDirResolver};
pub use record::{LogKind, Record};
pub use recovery::TempArtifact;
pub use store::{ConversationStore, HistorySource, ReadOutcome};
