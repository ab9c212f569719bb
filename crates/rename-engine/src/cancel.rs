//! Cooperative cancellation (spec §5 "Cancellation").
//!
//! A caller-imposed timeout is treated the same way as an explicit cancel:
//! race `rename_note` against a `tokio::time::sleep` (or any other deadline)
//! in a `tokio::select!` and call `cancel()` on the losing branch. The engine
//! itself only ever checks the flag; it doesn't need to know why it was set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheap, cloneable flag a caller can set to ask an in-flight `rename_note`
/// to stop at the next phase boundary. Checked between `plan`/`prepare`;
/// ignored once `commit` begins, so a rename that has started installing
/// files always finishes (spec §5: "preserve atomicity").
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
