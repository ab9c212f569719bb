//! Transactional note-rename engine for Obsidian-style Markdown vaults.
//!
//! Renaming a note means rewriting every wikilink that points at it, and
//! doing both atomically enough to survive a crash mid-rename. The pieces:
//! a single-source-of-truth wikilink grammar ([`wiki_links`]), a scanner and
//! updater built on top of it, a write-ahead-logged transaction manager, and
//! a boot-time recovery pass that rolls back whatever a prior crash left
//! half-finished.

mod cache;
mod cancel;
mod config;
mod coordinator;
mod error;
mod manifest;
mod recovery;
mod scanner;
mod transaction;
mod updater;
mod wal;

pub use cache::{CachedNote, FsNoteCache, NoteCache};
pub use cancel::CancellationToken;
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{RenameCoordinator, RenameFailure, RenameInput, RenameMetrics, RenameOutput};
pub use error::RenameError;
pub use manifest::{LinkUpdateEntry, Manifest, ManifestPhase, NoteRenameEntry};
pub use recovery::{recover_pending, RecoveryReport};
pub use scanner::{LinkScanner, Reference, ScanOptions, ScanResult};
pub use transaction::{TransactionManager, TransactionState};
pub use updater::{LinkUpdater, Rewrite, UpdateResult};
pub use wal::{WALManager, WalEntry};
