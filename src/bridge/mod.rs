mod core;
mod function;
mod hooks;

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::autoext::AutoExtensionList;
use crate::error::{Error, codes};
use crate::handle::{DbHandle, Handle, HandleArena, StmtHandle, stale_message};
use crate::registry::{CallbackSlot, SlotCell};
use crate::provider::Sqlite3Hooks;
use crate::thread::ThreadCache;

pub use self::function::FunctionCall;
pub use self::hooks::{
    Authorization, AuthorizerAction, AuthorizerEvent, PreUpdateEvent, TraceEvent, TraceMask,
    UpdateEvent, UpdateOp, authorizer,
};

pub(crate) use self::hooks::LogCell;

/// Book-keeping for one open connection.
pub(crate) struct ConnectionRecord<P: Sqlite3Hooks> {
    pub(crate) raw: usize,
    pub(crate) cells: Mutex<HashMap<CallbackSlot, Arc<SlotCell<P>>>>,
    pub(crate) last_callback_error: Mutex<Option<String>>,
}

impl<P: Sqlite3Hooks> ConnectionRecord<P> {
    fn new(raw: NonNull<P::Db>) -> Self {
        Self {
            raw: raw.as_ptr() as usize,
            cells: Mutex::new(HashMap::new()),
            last_callback_error: Mutex::new(None),
        }
    }

    pub(crate) fn db_ptr(&self) -> Option<NonNull<P::Db>> {
        NonNull::new(self.raw as *mut P::Db)
    }

    fn release_cells(&self) -> usize {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        let count = cells.len();
        for cell in cells.values() {
            cell.replace(None);
        }
        cells.clear();
        count
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct StmtRecord {
    pub(crate) raw: usize,
    pub(crate) db: DbHandle,
}

/// Boundary surface over a native SQLite engine.
///
/// A `Bridge` owns every piece of state the binding layer keeps: the handle
/// arenas, the per-connection callback registrations, the auto-extension list
/// and the per-thread cache. Engine-facing callback contexts reach it through
/// weak references only.
///
/// Boundary operations return raw SQLite result codes. Operations that
/// produce a value by side effect take an [`OutBox`](crate::OutBox) and clear
/// it on entry.
pub struct Bridge<P: Sqlite3Hooks> {
    api: &'static P,
    this: Weak<Bridge<P>>,
    connections: HandleArena<DbHandle, Arc<ConnectionRecord<P>>>,
    statements: HandleArena<StmtHandle, StmtRecord>,
    threads: ThreadCache,
    auto_extensions: AutoExtensionList<P>,
    log: Arc<LogCell>,
    shutdown_lock: Mutex<()>,
}

impl<P: Sqlite3Hooks> Bridge<P> {
    /// Build a bridge over `api`.
    pub fn new(api: &'static P) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            api,
            this: this.clone(),
            connections: HandleArena::new(),
            statements: HandleArena::new(),
            threads: ThreadCache::new(),
            auto_extensions: AutoExtensionList::new(),
            log: Arc::new(LogCell::default()),
            shutdown_lock: Mutex::new(()),
        })
    }

    /// Provider the bridge forwards to.
    pub fn api(&self) -> &'static P {
        self.api
    }

    /// Per-thread cache.
    pub fn threads(&self) -> &ThreadCache {
        &self.threads
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live prepared statements.
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Whether `db` names an open connection.
    pub fn is_open(&self, db: DbHandle) -> bool {
        self.connections.contains(db)
    }

    /// Number of callback slots currently registered on `db`.
    pub fn registration_count(&self, db: DbHandle) -> usize {
        self.connections
            .get(db)
            .map(|record| record.cells.lock().unwrap_or_else(|p| p.into_inner()).len())
            .unwrap_or(0)
    }

    /// Last boundary error recorded on the calling thread.
    pub fn last_error_message(&self) -> Option<String> {
        self.threads.last_error()
    }

    /// Message of the last handler failure contained on `db`.
    pub fn last_callback_error(&self, db: DbHandle) -> Option<String> {
        let record = self.connections.get(db)?;
        record
            .last_callback_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub(crate) fn weak(&self) -> Weak<Bridge<P>> {
        self.this.clone()
    }

    pub(crate) fn auto_extensions(&self) -> &AutoExtensionList<P> {
        &self.auto_extensions
    }

    pub(crate) fn connection(
        &self,
        db: DbHandle,
    ) -> Option<(Arc<ConnectionRecord<P>>, NonNull<P::Db>)> {
        let record = self.connections.get(db)?;
        let raw = record.db_ptr()?;
        Some((record, raw))
    }

    pub(crate) fn db_ptr(&self, db: DbHandle) -> Option<NonNull<P::Db>> {
        self.connections.get(db).and_then(|record| record.db_ptr())
    }

    pub(crate) fn stmt_ptr(&self, stmt: StmtHandle) -> Option<NonNull<P::Stmt>> {
        self.statements
            .get(stmt)
            .and_then(|record| NonNull::new(record.raw as *mut P::Stmt))
    }

    /// Statement handle for a native statement address, if the bridge prepared it.
    pub(crate) fn statement_for_raw(&self, raw: usize) -> Option<StmtHandle> {
        self.statements
            .handles_where(|record| record.raw == raw)
            .into_iter()
            .next()
    }

    /// Reject a handle that names no live resource.
    pub(crate) fn stale<H: Handle>(&self, handle: H) -> i32 {
        self.misuse(stale_message(handle))
    }

    pub(crate) fn misuse(&self, message: String) -> i32 {
        warn!(%message, "rejected misuse");
        self.threads.set_last_error(Some(message));
        codes::SQLITE_MISUSE
    }

    /// Record `err` as the thread's last error and return its result code.
    pub(crate) fn fail(&self, err: &Error) -> i32 {
        self.threads.set_last_error(Some(err.to_string()));
        match err.result_code() {
            codes::SQLITE_OK => codes::SQLITE_ERROR,
            code => code,
        }
    }

    pub(crate) fn record_callback_error(&self, db: DbHandle, slot: &CallbackSlot, err: &Error) {
        warn!(%db, %slot, error = %err, "callback failed");
        if let Some(record) = self.connections.get(db) {
            *record
                .last_callback_error
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = Some(err.to_string());
        }
    }

    /// Finalize every statement and close every connection this bridge opened.
    ///
    /// Registrations of a connection the engine refuses to close are leaked,
    /// since the engine may still call through them.
    fn release_all(&self) -> usize {
        for (stmt, record) in self.statements.drain() {
            if let Some(raw) = NonNull::new(record.raw as *mut P::Stmt) {
                if let Err(err) = unsafe { self.api.finalize(raw) } {
                    debug!(%stmt, error = %err, "finalize during release failed");
                }
            }
        }
        let mut closed = 0;
        for (db, record) in self.connections.drain() {
            let Some(raw) = record.db_ptr() else { continue };
            match unsafe { self.api.close(raw) } {
                Ok(()) => {
                    record.release_cells();
                    closed += 1;
                }
                Err(err) => {
                    warn!(
                        %db,
                        error = %err,
                        "close during release failed; keeping registrations alive"
                    );
                    std::mem::forget(record);
                }
            }
        }
        closed
    }
}

impl<P: Sqlite3Hooks> Drop for Bridge<P> {
    fn drop(&mut self) {
        let closed = self.release_all();
        if self.log.is_set() {
            if unsafe { self.api.config_log(None, std::ptr::null_mut()) }.is_ok() {
                self.log.replace(None);
            } else {
                std::mem::forget(Arc::clone(&self.log));
            }
        }
        debug!(closed, "bridge dropped");
    }
}
