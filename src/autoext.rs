use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::error::{Error, codes};
use crate::handle::DbHandle;
use crate::provider::Sqlite3Hooks;
use crate::registry::panic_message;

/// Startup routine run against every newly opened connection.
pub type AutoExtensionFn<P> = dyn Fn(&Bridge<P>, DbHandle) -> crate::Result<()> + Send + Sync;

/// Shared auto-extension; identity is the shared allocation.
pub struct AutoExtension<P: Sqlite3Hooks>(Arc<AutoExtensionFn<P>>);

impl<P: Sqlite3Hooks> AutoExtension<P> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Bridge<P>, DbHandle) -> crate::Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn ptr_eq(&self, other: &AutoExtension<P>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<P: Sqlite3Hooks> Clone for AutoExtension<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Sqlite3Hooks> fmt::Debug for AutoExtension<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AutoExtension({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Ordered list of auto-extensions.
///
/// Extensions run in registration order after each successful open. The list
/// may not change while a traversal is running, on any thread.
pub struct AutoExtensionList<P: Sqlite3Hooks> {
    entries: Mutex<Vec<AutoExtension<P>>>,
    traversals: AtomicUsize,
}

impl<P: Sqlite3Hooks> AutoExtensionList<P> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            traversals: AtomicUsize::new(0),
        }
    }

    /// Append `extension` unless it is already present.
    pub fn register(&self, extension: AutoExtension<P>) -> i32 {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_traversing() {
            return codes::SQLITE_MISUSE;
        }
        if !entries.iter().any(|e| e.ptr_eq(&extension)) {
            entries.push(extension);
        }
        codes::SQLITE_OK
    }

    /// Remove `extension`; `false` when absent or while a traversal runs.
    pub fn cancel(&self, extension: &AutoExtension<P>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_traversing() {
            warn!("auto-extension cancelled during traversal");
            return false;
        }
        let before = entries.len();
        entries.retain(|e| !e.ptr_eq(extension));
        entries.len() != before
    }

    /// Remove every extension.
    pub fn reset(&self) -> i32 {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_traversing() {
            return codes::SQLITE_MISUSE;
        }
        entries.clear();
        codes::SQLITE_OK
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_traversing(&self) -> bool {
        self.traversals.load(Ordering::Acquire) > 0
    }

    /// Run every extension against `db`, stopping at the first failure.
    pub fn run(&self, bridge: &Bridge<P>, db: DbHandle) -> crate::Result<()> {
        let snapshot = {
            let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            self.traversals.fetch_add(1, Ordering::AcqRel);
            entries.clone()
        };
        let _traversal = Traversal(&self.traversals);
        for (index, extension) in snapshot.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| (extension.0)(bridge, db)));
            let err = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(payload) => Error::user(format!(
                    "panic in auto-extension: {}",
                    panic_message(payload.as_ref())
                )),
            };
            warn!(%db, index, error = %err, "auto-extension failed");
            return Err(err);
        }
        if !snapshot.is_empty() {
            debug!(%db, count = snapshot.len(), "auto-extensions ran");
        }
        Ok(())
    }
}

impl<P: Sqlite3Hooks> Default for AutoExtensionList<P> {
    fn default() -> Self {
        Self::new()
    }
}

struct Traversal<'a>(&'a AtomicUsize);

impl Drop for Traversal<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
