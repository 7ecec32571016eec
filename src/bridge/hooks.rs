use core::cmp::Ordering;
use core::ffi::{c_char, c_void};
use core::ptr::NonNull;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::encoding::{self, TextRep};
use crate::error::codes::{SQLITE_DENY, SQLITE_IGNORE, SQLITE_OK};
use crate::error::{Error, ErrorCode, Result};
use crate::handle::{DbHandle, StmtHandle};
use crate::provider::{FunctionFlags, Sqlite3Hooks};
use crate::registry::{
    AggregateFns, CallbackSlot, Handler, LogFn, SlotCell, WindowFns, invoke, panic_message,
};
use crate::value::Value;

use super::function::{
    aggregate_final_trampoline, aggregate_step_trampoline, scalar_trampoline,
    window_inverse_trampoline, window_value_trampoline,
};
use super::{Bridge, ConnectionRecord, FunctionCall};

/// Bitmask for trace_v2 callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceMask {
    bits: u32,
}

impl TraceMask {
    /// Trace SQL text before execution.
    pub const STMT: TraceMask = TraceMask { bits: 0x01 };
    /// Trace statement execution timing samples.
    pub const PROFILE: TraceMask = TraceMask { bits: 0x02 };
    /// Trace each produced row.
    pub const ROW: TraceMask = TraceMask { bits: 0x04 };
    /// Trace connection close events.
    pub const CLOSE: TraceMask = TraceMask { bits: 0x08 };

    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub const fn all() -> Self {
        Self { bits: 0x0f }
    }

    /// Raw SQLite mask bits.
    pub const fn bits(self) -> u32 {
        self.bits
    }

    pub const fn contains(self, other: TraceMask) -> bool {
        (self.bits & other.bits) == other.bits
    }
}

impl core::ops::BitOr for TraceMask {
    type Output = TraceMask;

    fn bitor(self, rhs: TraceMask) -> TraceMask {
        TraceMask {
            bits: self.bits | rhs.bits,
        }
    }
}

/// Decoded trace event.
///
/// Statements the bridge did not prepare itself (for instance ones compiled
/// inside the engine) are reported with `stmt: None`.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceEvent {
    /// A statement started running.
    Stmt {
        stmt: Option<StmtHandle>,
        /// Unexpanded SQL text.
        sql: String,
    },
    /// A statement finished; `nanos` is its wall-clock run time.
    Profile { stmt: Option<StmtHandle>, nanos: i64 },
    /// A statement produced a row.
    Row { stmt: Option<StmtHandle> },
    /// The connection is closing.
    Close { db: DbHandle },
    /// Event kind this layer does not decode.
    Other { mask: u32 },
}

/// Authorizer action codes (SQLite values).
pub mod authorizer {
    pub const CREATE_INDEX: i32 = 1;
    pub const CREATE_TABLE: i32 = 2;
    pub const CREATE_TEMP_INDEX: i32 = 3;
    pub const CREATE_TEMP_TABLE: i32 = 4;
    pub const CREATE_TEMP_TRIGGER: i32 = 5;
    pub const CREATE_TEMP_VIEW: i32 = 6;
    pub const CREATE_TRIGGER: i32 = 7;
    pub const CREATE_VIEW: i32 = 8;
    pub const DELETE: i32 = 9;
    pub const DROP_INDEX: i32 = 10;
    pub const DROP_TABLE: i32 = 11;
    pub const DROP_TEMP_INDEX: i32 = 12;
    pub const DROP_TEMP_TABLE: i32 = 13;
    pub const DROP_TEMP_TRIGGER: i32 = 14;
    pub const DROP_TEMP_VIEW: i32 = 15;
    pub const DROP_TRIGGER: i32 = 16;
    pub const DROP_VIEW: i32 = 17;
    pub const INSERT: i32 = 18;
    pub const PRAGMA: i32 = 19;
    pub const READ: i32 = 20;
    pub const SELECT: i32 = 21;
    pub const TRANSACTION: i32 = 22;
    pub const UPDATE: i32 = 23;
    pub const ATTACH: i32 = 24;
    pub const DETACH: i32 = 25;
    pub const ALTER_TABLE: i32 = 26;
    pub const REINDEX: i32 = 27;
    pub const ANALYZE: i32 = 28;
    pub const CREATE_VTABLE: i32 = 29;
    pub const DROP_VTABLE: i32 = 30;
    pub const FUNCTION: i32 = 31;
    pub const SAVEPOINT: i32 = 32;
    pub const RECURSIVE: i32 = 33;
}

/// Authorizer action decoded from the SQLite action code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorizerAction {
    CreateIndex,
    CreateTable,
    CreateTempIndex,
    CreateTempTable,
    CreateTempTrigger,
    CreateTempView,
    CreateTrigger,
    CreateView,
    Delete,
    DropIndex,
    DropTable,
    DropTempIndex,
    DropTempTable,
    DropTempTrigger,
    DropTempView,
    DropTrigger,
    DropView,
    Insert,
    Pragma,
    Read,
    Select,
    Transaction,
    Update,
    Attach,
    Detach,
    AlterTable,
    Reindex,
    Analyze,
    CreateVTable,
    DropVTable,
    Function,
    Savepoint,
    Recursive,
    Unknown(i32),
}

impl AuthorizerAction {
    /// Decode a raw SQLite authorizer action code.
    pub fn from_code(code: i32) -> Self {
        use authorizer as a;
        match code {
            a::CREATE_INDEX => Self::CreateIndex,
            a::CREATE_TABLE => Self::CreateTable,
            a::CREATE_TEMP_INDEX => Self::CreateTempIndex,
            a::CREATE_TEMP_TABLE => Self::CreateTempTable,
            a::CREATE_TEMP_TRIGGER => Self::CreateTempTrigger,
            a::CREATE_TEMP_VIEW => Self::CreateTempView,
            a::CREATE_TRIGGER => Self::CreateTrigger,
            a::CREATE_VIEW => Self::CreateView,
            a::DELETE => Self::Delete,
            a::DROP_INDEX => Self::DropIndex,
            a::DROP_TABLE => Self::DropTable,
            a::DROP_TEMP_INDEX => Self::DropTempIndex,
            a::DROP_TEMP_TABLE => Self::DropTempTable,
            a::DROP_TEMP_TRIGGER => Self::DropTempTrigger,
            a::DROP_TEMP_VIEW => Self::DropTempView,
            a::DROP_TRIGGER => Self::DropTrigger,
            a::DROP_VIEW => Self::DropView,
            a::INSERT => Self::Insert,
            a::PRAGMA => Self::Pragma,
            a::READ => Self::Read,
            a::SELECT => Self::Select,
            a::TRANSACTION => Self::Transaction,
            a::UPDATE => Self::Update,
            a::ATTACH => Self::Attach,
            a::DETACH => Self::Detach,
            a::ALTER_TABLE => Self::AlterTable,
            a::REINDEX => Self::Reindex,
            a::ANALYZE => Self::Analyze,
            a::CREATE_VTABLE => Self::CreateVTable,
            a::DROP_VTABLE => Self::DropVTable,
            a::FUNCTION => Self::Function,
            a::SAVEPOINT => Self::Savepoint,
            a::RECURSIVE => Self::Recursive,
            other => Self::Unknown(other),
        }
    }
}

/// Verdict of an authorizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authorization {
    /// Allow the action.
    Allow,
    /// Allow the statement but treat the column as NULL / skip the action.
    Ignore,
    /// Fail the statement with `SQLITE_AUTH`.
    Deny,
}

impl Authorization {
    pub const fn into_code(self) -> i32 {
        match self {
            Self::Allow => SQLITE_OK,
            Self::Ignore => SQLITE_IGNORE,
            Self::Deny => SQLITE_DENY,
        }
    }
}

/// Arguments passed to the authorizer.
#[derive(Debug)]
pub struct AuthorizerEvent<'a> {
    pub action: AuthorizerAction,
    /// Raw numeric action code.
    pub code: i32,
    pub arg1: Option<&'a str>,
    pub arg2: Option<&'a str>,
    pub db_name: Option<&'a str>,
    /// Innermost trigger or view responsible for the access.
    pub trigger_or_view: Option<&'a str>,
}

/// Row change kind reported by update and pre-update hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOp {
    Insert,
    Update,
    Delete,
    Other(i32),
}

impl UpdateOp {
    pub const fn from_code(code: i32) -> Self {
        match code {
            authorizer::INSERT => UpdateOp::Insert,
            authorizer::UPDATE => UpdateOp::Update,
            authorizer::DELETE => UpdateOp::Delete,
            other => UpdateOp::Other(other),
        }
    }
}

/// A row changed in a rowid table.
#[derive(Debug)]
pub struct UpdateEvent<'a> {
    pub op: UpdateOp,
    pub db_name: &'a str,
    pub table: &'a str,
    pub rowid: i64,
}

/// A row is about to change.
///
/// Old and new column values can be read while the hook runs.
pub struct PreUpdateEvent<'a, P: Sqlite3Hooks> {
    bridge: &'a Bridge<P>,
    raw_db: NonNull<P::Db>,
    pub db: DbHandle,
    pub op: UpdateOp,
    pub db_name: &'a str,
    pub table: &'a str,
    pub old_rowid: i64,
    pub new_rowid: i64,
}

impl<P: Sqlite3Hooks> PreUpdateEvent<'_, P> {
    /// Number of columns in the changing row.
    pub fn column_count(&self) -> i32 {
        unsafe { self.bridge.api().preupdate_count(self.raw_db) }
    }

    /// Column value before the change (UPDATE and DELETE only).
    pub fn old(&self, col: i32) -> Result<Value> {
        let raw = unsafe { self.bridge.api().preupdate_old(self.raw_db, col)? };
        Ok(unsafe { self.bridge.read_value(raw) })
    }

    /// Column value after the change (INSERT and UPDATE only).
    pub fn new(&self, col: i32) -> Result<Value> {
        let raw = unsafe { self.bridge.api().preupdate_new(self.raw_db, col)? };
        Ok(unsafe { self.bridge.read_value(raw) })
    }
}

/// Process-wide log handler cell handed to the engine.
#[derive(Default)]
pub(crate) struct LogCell {
    handler: RwLock<Option<Arc<LogFn>>>,
}

impl LogCell {
    pub(crate) fn is_set(&self) -> bool {
        self.handler.read().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    pub(crate) fn replace(&self, handler: Option<Arc<LogFn>>) {
        *self.handler.write().unwrap_or_else(|p| p.into_inner()) = handler;
    }

    fn current(&self) -> Option<Arc<LogFn>> {
        self.handler.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

pub(crate) unsafe extern "C" fn log_trampoline(ctx: *mut c_void, code: i32, msg: *const c_char) {
    if ctx.is_null() {
        return;
    }
    let cell = unsafe { &*(ctx as *const LogCell) };
    let Some(handler) = cell.current() else { return };
    let message = unsafe { encoding::c_str_lossy(msg) }.unwrap_or_default();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(code, &message))) {
        warn!(panic = %panic_message(payload.as_ref()), "log handler panicked");
    }
}

unsafe extern "C" fn busy_trampoline<P: Sqlite3Hooks>(ctx: *mut c_void, count: i32) -> i32 {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return 0;
    };
    let outcome = invoke(&cell, |_, handler| match handler {
        Handler::Busy(callback) => callback(count),
        _ => Ok(false),
    });
    match outcome {
        Some(Ok(true)) => 1,
        _ => 0,
    }
}

unsafe extern "C" fn trace_trampoline<P: Sqlite3Hooks>(
    mask: u32,
    ctx: *mut c_void,
    p: *mut c_void,
    x: *mut c_void,
) -> i32 {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return 0;
    };
    let db = cell.db;
    invoke(&cell, |bridge, handler| {
        let Handler::Trace { callback, .. } = handler else {
            return Ok(());
        };
        let event = unsafe { decode_trace(bridge, db, mask, p, x) };
        callback(&event)
    });
    0
}

unsafe fn decode_trace<P: Sqlite3Hooks>(
    bridge: &Bridge<P>,
    db: DbHandle,
    mask: u32,
    p: *mut c_void,
    x: *mut c_void,
) -> TraceEvent {
    let stmt = || bridge.statement_for_raw(p as usize);
    match mask {
        m if m == TraceMask::STMT.bits() => TraceEvent::Stmt {
            stmt: stmt(),
            sql: unsafe { encoding::c_str_lossy(x as *const c_char) }.unwrap_or_default(),
        },
        m if m == TraceMask::PROFILE.bits() && !x.is_null() => TraceEvent::Profile {
            stmt: stmt(),
            nanos: unsafe { *(x as *const i64) },
        },
        m if m == TraceMask::ROW.bits() => TraceEvent::Row { stmt: stmt() },
        m if m == TraceMask::CLOSE.bits() => TraceEvent::Close { db },
        other => TraceEvent::Other { mask: other },
    }
}

unsafe extern "C" fn progress_trampoline<P: Sqlite3Hooks>(ctx: *mut c_void) -> i32 {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return 0;
    };
    let outcome = invoke(&cell, |_, handler| match handler {
        Handler::Progress { callback, .. } => callback(),
        _ => Ok(false),
    });
    match outcome {
        None | Some(Ok(false)) => 0,
        Some(Ok(true)) | Some(Err(_)) => 1,
    }
}

unsafe extern "C" fn commit_trampoline<P: Sqlite3Hooks>(ctx: *mut c_void) -> i32 {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return 0;
    };
    let outcome = invoke(&cell, |_, handler| match handler {
        Handler::Commit(callback) => callback(),
        _ => Ok(false),
    });
    match outcome {
        None | Some(Ok(false)) => 0,
        Some(Ok(true)) | Some(Err(_)) => 1,
    }
}

unsafe extern "C" fn rollback_trampoline<P: Sqlite3Hooks>(ctx: *mut c_void) {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return;
    };
    invoke(&cell, |_, handler| match handler {
        Handler::Rollback(callback) => callback(),
        _ => Ok(()),
    });
}

unsafe extern "C" fn update_trampoline<P: Sqlite3Hooks>(
    ctx: *mut c_void,
    op: i32,
    db_name: *const c_char,
    table: *const c_char,
    rowid: i64,
) {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return;
    };
    let db_name = unsafe { encoding::c_str_lossy(db_name) }.unwrap_or_default();
    let table = unsafe { encoding::c_str_lossy(table) }.unwrap_or_default();
    invoke(&cell, |_, handler| {
        let Handler::Update(callback) = handler else {
            return Ok(());
        };
        callback(&UpdateEvent {
            op: UpdateOp::from_code(op),
            db_name: &db_name,
            table: &table,
            rowid,
        })
    });
}

unsafe extern "C" fn preupdate_trampoline<P: Sqlite3Hooks>(
    ctx: *mut c_void,
    db: *mut P::Db,
    op: i32,
    db_name: *const c_char,
    table: *const c_char,
    old_rowid: i64,
    new_rowid: i64,
) {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return;
    };
    let Some(raw_db) = NonNull::new(db) else { return };
    let db_name = unsafe { encoding::c_str_lossy(db_name) }.unwrap_or_default();
    let table = unsafe { encoding::c_str_lossy(table) }.unwrap_or_default();
    let handle = cell.db;
    invoke(&cell, |bridge, handler| {
        let Handler::PreUpdate(callback) = handler else {
            return Ok(());
        };
        callback(&PreUpdateEvent {
            bridge,
            raw_db,
            db: handle,
            op: UpdateOp::from_code(op),
            db_name: &db_name,
            table: &table,
            old_rowid,
            new_rowid,
        })
    });
}

unsafe extern "C" fn collation_needed_trampoline<P: Sqlite3Hooks>(
    ctx: *mut c_void,
    _db: *mut P::Db,
    text_rep: i32,
    name: *const c_char,
) {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return;
    };
    let name = unsafe { encoding::c_str_lossy(name) }.unwrap_or_default();
    let db = cell.db;
    invoke(&cell, |bridge, handler| {
        let Handler::CollationNeeded(callback) = handler else {
            return Ok(());
        };
        callback(bridge, db, &name, TextRep::from_code(text_rep))
    });
}

unsafe extern "C" fn authorizer_trampoline<P: Sqlite3Hooks>(
    ctx: *mut c_void,
    action: i32,
    arg1: *const c_char,
    arg2: *const c_char,
    db_name: *const c_char,
    trigger_or_view: *const c_char,
) -> i32 {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return SQLITE_DENY;
    };
    let arg1 = unsafe { encoding::c_str_lossy(arg1) };
    let arg2 = unsafe { encoding::c_str_lossy(arg2) };
    let db_name = unsafe { encoding::c_str_lossy(db_name) };
    let trigger_or_view = unsafe { encoding::c_str_lossy(trigger_or_view) };
    let outcome = invoke(&cell, |_, handler| {
        let Handler::Authorizer(callback) = handler else {
            return Ok(Authorization::Allow);
        };
        callback(&AuthorizerEvent {
            action: AuthorizerAction::from_code(action),
            code: action,
            arg1: arg1.as_deref(),
            arg2: arg2.as_deref(),
            db_name: db_name.as_deref(),
            trigger_or_view: trigger_or_view.as_deref(),
        })
    });
    match outcome {
        None => SQLITE_OK,
        Some(Ok(verdict)) => verdict.into_code(),
        Some(Err(_)) => SQLITE_DENY,
    }
}

unsafe extern "C" fn compare_trampoline<P: Sqlite3Hooks>(
    ctx: *mut c_void,
    lhs_len: i32,
    lhs: *const c_void,
    rhs_len: i32,
    rhs: *const c_void,
) -> i32 {
    let Some(cell) = (unsafe { SlotCell::<P>::from_context(ctx) }) else {
        return 0;
    };
    let lhs = unsafe { text_arg(lhs, lhs_len) };
    let rhs = unsafe { text_arg(rhs, rhs_len) };
    let outcome = invoke(&cell, |_, handler| match handler {
        Handler::Collation(callback) => Ok(callback(&lhs, &rhs)),
        _ => Ok(Ordering::Equal),
    });
    match outcome {
        Some(Ok(Ordering::Less)) => -1,
        Some(Ok(Ordering::Greater)) => 1,
        _ => 0,
    }
}

unsafe fn text_arg(ptr: *const c_void, len: i32) -> String {
    if ptr.is_null() || len <= 0 {
        return String::new();
    }
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) };
    String::from_utf8_lossy(bytes).into_owned()
}

impl<P: Sqlite3Hooks> Bridge<P> {
    /// Install, replace, or (with `None`) remove the handler for `slot` on `db`.
    ///
    /// Once a replacement returns, no later engine event reaches the previous
    /// handler. If the engine rejects a registration, the previous handler
    /// stays in place and the engine's code is returned.
    pub fn register_callback(
        &self,
        db: DbHandle,
        slot: CallbackSlot,
        handler: Option<Handler<P>>,
    ) -> i32 {
        self.threads.attach();
        if let Some(handler) = &handler {
            if handler.kind() != slot.kind() {
                let kind = handler.kind();
                return self.misuse(format!("{kind:?} handler cannot serve the {slot} slot"));
            }
        }
        let Some((record, raw)) = self.connection(db) else {
            return self.stale(db);
        };
        match handler {
            Some(handler) => self.install(db, &record, raw, slot, handler),
            None => self.uninstall(db, &record, raw, slot),
        }
    }

    /// Remove whatever handler is registered for `slot` on `db`.
    pub fn clear_callback(&self, db: DbHandle, slot: CallbackSlot) -> i32 {
        self.register_callback(db, slot, None)
    }

    fn install(
        &self,
        db: DbHandle,
        record: &ConnectionRecord<P>,
        raw: NonNull<P::Db>,
        slot: CallbackSlot,
        handler: Handler<P>,
    ) -> i32 {
        let (cell, created) = {
            let mut cells = record.cells.lock().unwrap_or_else(|p| p.into_inner());
            match cells.get(&slot) {
                Some(cell) => (Arc::clone(cell), false),
                None => {
                    let cell = Arc::new(SlotCell::new(self.weak(), db, record.raw, slot.clone()));
                    cells.insert(slot.clone(), Arc::clone(&cell));
                    (cell, true)
                }
            }
        };
        let previous = cell.replace(Some(handler.clone()));
        match unsafe { self.attach_to_engine(raw, &cell, &handler) } {
            Ok(()) => {
                debug!(%db, %slot, replaced = previous.is_some(), "callback registered");
                SQLITE_OK
            }
            Err(err) => {
                cell.replace(previous);
                if created {
                    let mut cells = record.cells.lock().unwrap_or_else(|p| p.into_inner());
                    cells.remove(&slot);
                }
                debug!(%db, %slot, error = %err, "engine rejected callback");
                self.fail(&err)
            }
        }
    }

    fn uninstall(
        &self,
        db: DbHandle,
        record: &ConnectionRecord<P>,
        raw: NonNull<P::Db>,
        slot: CallbackSlot,
    ) -> i32 {
        if let Err(err) = unsafe { self.detach_from_engine(raw, &slot) } {
            return self.fail(&err);
        }
        let removed = {
            let mut cells = record.cells.lock().unwrap_or_else(|p| p.into_inner());
            cells.remove(&slot)
        };
        if let Some(cell) = removed {
            cell.replace(None);
            debug!(%db, %slot, "callback unregistered");
        }
        SQLITE_OK
    }

    unsafe fn attach_to_engine(
        &self,
        raw: NonNull<P::Db>,
        cell: &Arc<SlotCell<P>>,
        handler: &Handler<P>,
    ) -> Result<()> {
        let api = self.api;
        let ctx = SlotCell::context_ptr(cell);
        unsafe {
            match handler {
                Handler::Busy(_) => api.busy_handler(raw, Some(busy_trampoline::<P>), ctx),
                Handler::Trace { mask, .. } => {
                    api.trace_v2(raw, mask.bits(), Some(trace_trampoline::<P>), ctx)
                }
                Handler::Progress { period, .. } => {
                    api.progress_handler(raw, *period, Some(progress_trampoline::<P>), ctx)
                }
                Handler::Commit(_) => api.commit_hook(raw, Some(commit_trampoline::<P>), ctx),
                Handler::Rollback(_) => api.rollback_hook(raw, Some(rollback_trampoline::<P>), ctx),
                Handler::Update(_) => api.update_hook(raw, Some(update_trampoline::<P>), ctx),
                Handler::PreUpdate(_) => {
                    api.preupdate_hook(raw, Some(preupdate_trampoline::<P>), ctx)
                }
                Handler::CollationNeeded(_) => {
                    api.collation_needed(raw, Some(collation_needed_trampoline::<P>), ctx)
                }
                Handler::Authorizer(_) => {
                    api.set_authorizer(raw, Some(authorizer_trampoline::<P>), ctx)
                }
                Handler::Collation(_) => {
                    let CallbackSlot::Collation(name) = &cell.slot else {
                        return Err(Error::new(ErrorCode::Misuse));
                    };
                    api.create_collation_v2(raw, name, ctx, Some(compare_trampoline::<P>), None)
                }
                Handler::Scalar { flags, .. } => {
                    let CallbackSlot::Function { name, n_args } = &cell.slot else {
                        return Err(Error::new(ErrorCode::Misuse));
                    };
                    api.create_function_v2(
                        raw,
                        name,
                        *n_args,
                        *flags,
                        ctx,
                        Some(scalar_trampoline::<P>),
                        None,
                        None,
                        None,
                    )
                }
                Handler::Aggregate { flags, .. } => {
                    let CallbackSlot::Function { name, n_args } = &cell.slot else {
                        return Err(Error::new(ErrorCode::Misuse));
                    };
                    api.create_function_v2(
                        raw,
                        name,
                        *n_args,
                        *flags,
                        ctx,
                        None,
                        Some(aggregate_step_trampoline::<P>),
                        Some(aggregate_final_trampoline::<P>),
                        None,
                    )
                }
                Handler::Window { flags, .. } => {
                    let CallbackSlot::Function { name, n_args } = &cell.slot else {
                        return Err(Error::new(ErrorCode::Misuse));
                    };
                    api.create_window_function(
                        raw,
                        name,
                        *n_args,
                        *flags,
                        ctx,
                        Some(aggregate_step_trampoline::<P>),
                        Some(aggregate_final_trampoline::<P>),
                        Some(window_value_trampoline::<P>),
                        Some(window_inverse_trampoline::<P>),
                        None,
                    )
                }
            }
        }
    }

    unsafe fn detach_from_engine(&self, raw: NonNull<P::Db>, slot: &CallbackSlot) -> Result<()> {
        let api = self.api;
        let null = core::ptr::null_mut();
        unsafe {
            match slot {
                CallbackSlot::Busy => api.busy_handler(raw, None, null),
                CallbackSlot::Trace => api.trace_v2(raw, 0, None, null),
                CallbackSlot::Progress => api.progress_handler(raw, 0, None, null),
                CallbackSlot::Commit => api.commit_hook(raw, None, null),
                CallbackSlot::Rollback => api.rollback_hook(raw, None, null),
                CallbackSlot::Update => api.update_hook(raw, None, null),
                CallbackSlot::PreUpdate => api.preupdate_hook(raw, None, null),
                CallbackSlot::CollationNeeded => api.collation_needed(raw, None, null),
                CallbackSlot::Authorizer => api.set_authorizer(raw, None, null),
                CallbackSlot::Collation(name) => {
                    api.create_collation_v2(raw, name, null, None, None)
                }
                CallbackSlot::Function { name, n_args } => api.create_function_v2(
                    raw,
                    name,
                    *n_args,
                    FunctionFlags::empty(),
                    null,
                    None,
                    None,
                    None,
                    None,
                ),
            }
        }
    }

    /// Set a busy timeout. Replaces any registered busy handler.
    pub fn busy_timeout(&self, db: DbHandle, ms: i32) -> i32 {
        self.threads.attach();
        let Some((record, raw)) = self.connection(db) else {
            return self.stale(db);
        };
        if let Err(err) = unsafe { self.api.busy_timeout(raw, ms) } {
            return self.fail(&err);
        }
        let removed = record
            .cells
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&CallbackSlot::Busy);
        if let Some(cell) = removed {
            cell.replace(None);
            debug!(%db, "busy handler replaced by timeout");
        }
        SQLITE_OK
    }

    /// Busy handler; `f` gets the retry count and returns whether to retry.
    pub fn busy_handler<F>(&self, db: DbHandle, f: F) -> i32
    where
        F: Fn(i32) -> Result<bool> + Send + Sync + 'static,
    {
        self.register_callback(db, CallbackSlot::Busy, Some(Handler::Busy(Arc::new(f))))
    }

    pub fn trace<F>(&self, db: DbHandle, mask: TraceMask, f: F) -> i32
    where
        F: Fn(&TraceEvent) -> Result<()> + Send + Sync + 'static,
    {
        let handler = Handler::Trace {
            mask,
            callback: Arc::new(f),
        };
        self.register_callback(db, CallbackSlot::Trace, Some(handler))
    }

    /// Progress handler run every `period` virtual machine steps; `true` interrupts.
    pub fn progress_handler<F>(&self, db: DbHandle, period: i32, f: F) -> i32
    where
        F: Fn() -> Result<bool> + Send + Sync + 'static,
    {
        let handler = Handler::Progress {
            period,
            callback: Arc::new(f),
        };
        self.register_callback(db, CallbackSlot::Progress, Some(handler))
    }

    /// Commit hook; returning `true` turns the commit into a rollback.
    pub fn commit_hook<F>(&self, db: DbHandle, f: F) -> i32
    where
        F: Fn() -> Result<bool> + Send + Sync + 'static,
    {
        self.register_callback(db, CallbackSlot::Commit, Some(Handler::Commit(Arc::new(f))))
    }

    pub fn rollback_hook<F>(&self, db: DbHandle, f: F) -> i32
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.register_callback(db, CallbackSlot::Rollback, Some(Handler::Rollback(Arc::new(f))))
    }

    pub fn update_hook<F>(&self, db: DbHandle, f: F) -> i32
    where
        F: Fn(&UpdateEvent<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register_callback(db, CallbackSlot::Update, Some(Handler::Update(Arc::new(f))))
    }

    /// Pre-update hook; fails with `SQLITE_ERROR` when the engine lacks it.
    pub fn preupdate_hook<F>(&self, db: DbHandle, f: F) -> i32
    where
        F: Fn(&PreUpdateEvent<'_, P>) -> Result<()> + Send + Sync + 'static,
    {
        self.register_callback(db, CallbackSlot::PreUpdate, Some(Handler::PreUpdate(Arc::new(f))))
    }

    pub fn collation_needed<F>(&self, db: DbHandle, f: F) -> i32
    where
        F: Fn(&Bridge<P>, DbHandle, &str, TextRep) -> Result<()> + Send + Sync + 'static,
    {
        let handler = Handler::CollationNeeded(Arc::new(f));
        self.register_callback(db, CallbackSlot::CollationNeeded, Some(handler))
    }

    /// Authorizer; a failing or panicking authorizer denies the action.
    pub fn set_authorizer<F>(&self, db: DbHandle, f: F) -> i32
    where
        F: Fn(&AuthorizerEvent<'_>) -> Result<Authorization> + Send + Sync + 'static,
    {
        self.register_callback(db, CallbackSlot::Authorizer, Some(Handler::Authorizer(Arc::new(f))))
    }

    /// UTF-8 collation named `name`.
    pub fn create_collation<F>(&self, db: DbHandle, name: &str, f: F) -> i32
    where
        F: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
    {
        let handler = Handler::Collation(Arc::new(f));
        self.register_callback(db, CallbackSlot::collation(name), Some(handler))
    }

    /// Scalar SQL function; `n_args` of -1 accepts any argument count.
    pub fn create_function<F>(
        &self,
        db: DbHandle,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        f: F,
    ) -> i32
    where
        F: Fn(&FunctionCall<'_, P>) -> Result<Value> + Send + Sync + 'static,
    {
        let handler = Handler::Scalar {
            flags,
            callback: Arc::new(f),
        };
        self.register_callback(db, CallbackSlot::function(name, n_args), Some(handler))
    }

    /// Aggregate SQL function over per-group state `S`.
    ///
    /// `init` builds the state for a group (also for an empty group at
    /// finalization), `step` folds one row into it and `finalize` produces the
    /// result.
    pub fn create_aggregate<S, I, St, Fi>(
        &self,
        db: DbHandle,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        init: I,
        step: St,
        finalize: Fi,
    ) -> i32
    where
        S: Send + 'static,
        I: Fn() -> S + Send + Sync + 'static,
        St: Fn(&mut S, &FunctionCall<'_, P>) -> Result<()> + Send + Sync + 'static,
        Fi: Fn(S, &FunctionCall<'_, P>) -> Result<Value> + Send + Sync + 'static,
    {
        let handler = Handler::Aggregate {
            flags,
            callbacks: AggregateFns::typed(init, step, finalize),
        };
        self.register_callback(db, CallbackSlot::function(name, n_args), Some(handler))
    }

    /// Aggregate window function; build `callbacks` with [`WindowFns::typed`].
    ///
    /// Shares the function slot of `name`/`n_args` with scalars and
    /// aggregates. Needs [`crate::FeatureSet::WINDOW_FUNCTIONS`].
    pub fn create_window_function(
        &self,
        db: DbHandle,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        callbacks: WindowFns<P>,
    ) -> i32 {
        let handler = Handler::Window { flags, callbacks };
        self.register_callback(db, CallbackSlot::function(name, n_args), Some(handler))
    }
}
