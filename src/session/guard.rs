//! Session validity token.
//!
//! Teardown happens concurrently with in-flight audio callbacks and network
//! completions. Every callback captures the guard's token at session start
//! and checks it before acting; teardown bumps the epoch before releasing
//! any resource, so a late-arriving completion can never revive a
//! torn-down session's state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generation counter shared by everything a session spawns.
#[derive(Debug, Default)]
pub struct SessionGuard {
    epoch: AtomicU64,
}

impl SessionGuard {
    /// Create a guard for a new session.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current epoch, captured by callbacks at session start.
    pub fn token(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Whether a captured token is still the live epoch.
    pub fn is_current(&self, token: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == token
    }

    /// Invalidate all outstanding tokens. Must be the first step of
    /// teardown.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}
