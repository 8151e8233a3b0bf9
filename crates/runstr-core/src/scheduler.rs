//! Priority admission for network operations.
//!
//! Four operation classes compete for the relays. A class may start only
//! while every class above it is idle, except `Auth` which always proceeds.
//! The scheduler never blocks: a denied caller ends its attempt and polls
//! again later, see [`OperationScheduler::admit`].

use nostr_client::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Operation classes, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Auth,
    Group,
    Feed,
    Background,
}

impl OperationClass {
    /// Precedence table. Adding a class means adding it here.
    pub const ALL: [OperationClass; 4] = [
        OperationClass::Auth,
        OperationClass::Group,
        OperationClass::Feed,
        OperationClass::Background,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Classes that take precedence over this one.
    pub fn outranked_by(self) -> &'static [OperationClass] {
        &Self::ALL[..self.index()]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::Auth => "auth",
            OperationClass::Group => "group",
            OperationClass::Feed => "feed",
            OperationClass::Background => "background",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown operation class: {0}")]
pub struct UnknownClass(pub String);

impl FromStr for OperationClass {
    type Err = UnknownClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| UnknownClass(s.to_string()))
    }
}

/// Process-wide active counters, one per class.
///
/// Construct once and share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct OperationScheduler {
    counters: [AtomicUsize; OperationClass::ALL.len()],
}

impl OperationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation and report whether it may proceed now.
    ///
    /// The counter is incremented either way, so every `start` needs a
    /// matching [`end`](Self::end).
    pub fn start(&self, class: OperationClass) -> bool {
        self.counters[class.index()].fetch_add(1, Ordering::SeqCst);
        let admitted = !self.should_yield(class);
        if admitted {
            debug!(class = %class, "Operation admitted");
        } else {
            debug!(class = %class, "Operation deferred by higher-priority work");
        }
        admitted
    }

    /// Finish an operation. Ending an idle class is a no-op.
    pub fn end(&self, class: OperationClass) {
        let result = self.counters[class.index()]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if result.is_err() {
            trace!(class = %class, "end() on idle class ignored");
        }
    }

    /// Whether a running operation of `class` should stop early because a
    /// higher class has started.
    pub fn should_yield(&self, class: OperationClass) -> bool {
        class
            .outranked_by()
            .iter()
            .any(|higher| self.is_active(*higher))
    }

    pub fn is_active(&self, class: OperationClass) -> bool {
        self.active_count(class) > 0
    }

    pub fn active_count(&self, class: OperationClass) -> usize {
        self.counters[class.index()].load(Ordering::SeqCst)
    }

    /// [`start`](Self::start) by name. Unknown names are refused.
    pub fn start_named(&self, name: &str) -> bool {
        match name.parse() {
            Ok(class) => self.start(class),
            Err(e) => {
                warn!("Refusing to start operation: {}", e);
                false
            }
        }
    }

    /// [`end`](Self::end) by name. Unknown names are ignored.
    pub fn end_named(&self, name: &str) {
        match name.parse() {
            Ok(class) => self.end(class),
            Err(e) => warn!("Ignoring end of operation: {}", e),
        }
    }

    /// [`should_yield`](Self::should_yield) by name; unknown names never yield.
    pub fn should_yield_named(&self, name: &str) -> bool {
        name.parse().is_ok_and(|class| self.should_yield(class))
    }

    /// Start an operation whose `end` runs when the guard drops.
    pub fn enter(self: &Arc<Self>, class: OperationClass) -> OperationGuard {
        let admitted = self.start(class);
        OperationGuard {
            scheduler: Arc::clone(self),
            class,
            admitted,
        }
    }

    /// Poll for admission, sleeping between attempts as `backoff` dictates.
    ///
    /// Returns `None` once the backoff is exhausted.
    pub async fn admit(
        self: &Arc<Self>,
        class: OperationClass,
        backoff: &mut ExponentialBackoff,
    ) -> Option<OperationGuard> {
        loop {
            let guard = self.enter(class);
            if guard.admitted() {
                return Some(guard);
            }
            drop(guard);

            match backoff.next_delay() {
                Some(delay) => {
                    trace!(class = %class, ?delay, "Waiting before re-polling admission");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        class = %class,
                        attempts = backoff.attempt(),
                        "Gave up waiting for admission"
                    );
                    return None;
                }
            }
        }
    }
}

/// Active operation registration. Dropping it ends the operation.
#[derive(Debug)]
pub struct OperationGuard {
    scheduler: Arc<OperationScheduler>,
    class: OperationClass,
    admitted: bool,
}

impl OperationGuard {
    pub fn class(&self) -> OperationClass {
        self.class
    }

    /// Whether the scheduler let this operation proceed when it started.
    pub fn admitted(&self) -> bool {
        self.admitted
    }

    /// Whether higher-priority work has started since.
    pub fn should_yield(&self) -> bool {
        self.scheduler.should_yield(self.class)
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.scheduler.end(self.class);
    }
}
