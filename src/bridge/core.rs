use core::ptr::NonNull;
use std::sync::Arc;

use tracing::debug;

use crate::autoext::AutoExtension;
use crate::encoding::{self, EncodedText, Encoding};
use crate::error::codes::{SQLITE_DONE, SQLITE_MISUSE, SQLITE_OK, SQLITE_ROW};
use crate::handle::{DbHandle, StmtHandle};
use crate::outbox::{OutDb, OutStmt, OutTail};
use crate::provider::{
    ApiVersion, HOST_OBJECT_TAG, OpenOptions, Prepared, RawBytes, Sqlite3Hooks, StepResult,
    ThreadingMode, ValueType,
};
use crate::registry::LogFn;
use crate::value::{HostObject, Value, ValueRef};

use super::function::{drop_host_object, into_host_object_ptr};
use super::hooks::log_trampoline;
use super::{Bridge, ConnectionRecord, StmtRecord};

impl<P: Sqlite3Hooks> Bridge<P> {
    /// Open `filename` read-write, creating it when missing.
    pub fn open(&self, filename: &str, out: &mut OutDb) -> i32 {
        self.open_v2(filename, OpenOptions::default(), out)
    }

    /// Open a connection and run the auto-extensions against it.
    ///
    /// `out` is cleared first and only receives a handle when the open and
    /// every auto-extension succeeded. A failing extension closes the new
    /// connection and its code is returned.
    pub fn open_v2(&self, filename: &str, options: OpenOptions<'_>, out: &mut OutDb) -> i32 {
        out.clear();
        self.threads.attach();
        let raw = match unsafe { self.api.open(filename, options) } {
            Ok(raw) => raw,
            Err(err) => {
                debug!(filename, error = %err, "open failed");
                return self.fail(&err);
            }
        };
        let db = self.connections.insert(Arc::new(ConnectionRecord::new(raw)));
        if let Err(err) = self.auto_extensions.run(self, db) {
            if let Some(record) = self.connections.remove(db) {
                for stmt in self.statements.handles_where(|r| r.db == db) {
                    if let Some(stmt_record) = self.statements.remove(stmt) {
                        if let Some(stmt_raw) = NonNull::new(stmt_record.raw as *mut P::Stmt) {
                            let _ = unsafe { self.api.finalize(stmt_raw) };
                        }
                    }
                }
                match unsafe { self.api.close(raw) } {
                    Ok(()) => {
                        record.release_cells();
                    }
                    Err(close_err) => {
                        debug!(%db, error = %close_err, "close after failed auto-extension failed");
                        std::mem::forget(record);
                    }
                }
            }
            return self.fail(&err);
        }
        debug!(%db, filename, "connection opened");
        out.set(db);
        SQLITE_OK
    }

    /// Close `db`.
    ///
    /// Callback registrations are released only once the engine accepted the
    /// close; on failure the connection stays usable and registered.
    pub fn close(&self, db: DbHandle) -> i32 {
        self.threads.attach();
        let Some((record, raw)) = self.connection(db) else {
            return self.stale(db);
        };
        if let Err(err) = unsafe { self.api.close(raw) } {
            debug!(%db, error = %err, "close refused");
            return self.fail(&err);
        }
        self.connections.remove(db);
        for stmt in self.statements.handles_where(|r| r.db == db) {
            self.statements.remove(stmt);
        }
        let released = record.release_cells();
        debug!(%db, released, "connection closed");
        SQLITE_OK
    }

    /// Compile the first statement of `sql`.
    ///
    /// Empty or comment-only input succeeds with `out_stmt` left empty.
    /// `out_tail` receives the byte offset of the first unconsumed byte.
    pub fn prepare(
        &self,
        db: DbHandle,
        sql: &str,
        out_stmt: &mut OutStmt,
        out_tail: Option<&mut OutTail>,
    ) -> i32 {
        self.prepare_with(db, sql.as_bytes(), None, out_stmt, out_tail)
    }

    /// Like [`Bridge::prepare`] over raw UTF-8 bytes.
    pub fn prepare_bytes(
        &self,
        db: DbHandle,
        sql: &[u8],
        out_stmt: &mut OutStmt,
        out_tail: Option<&mut OutTail>,
    ) -> i32 {
        self.prepare_with(db, sql, None, out_stmt, out_tail)
    }

    /// Like [`Bridge::prepare`] with `prepare_v3` flags.
    pub fn prepare_v3(
        &self,
        db: DbHandle,
        sql: &str,
        flags: u32,
        out_stmt: &mut OutStmt,
        out_tail: Option<&mut OutTail>,
    ) -> i32 {
        self.prepare_with(db, sql.as_bytes(), Some(flags), out_stmt, out_tail)
    }

    fn prepare_with(
        &self,
        db: DbHandle,
        sql: &[u8],
        flags: Option<u32>,
        out_stmt: &mut OutStmt,
        mut out_tail: Option<&mut OutTail>,
    ) -> i32 {
        out_stmt.clear();
        if let Some(tail) = out_tail.as_deref_mut() {
            tail.clear();
        }
        self.threads.attach();
        let Some(raw) = self.db_ptr(db) else {
            return self.stale(db);
        };
        let prepared: crate::Result<Prepared<P::Stmt>> = match flags {
            Some(flags) => unsafe { self.api.prepare_v3(raw, sql, flags) },
            None => unsafe { self.api.prepare_v2(raw, sql) },
        };
        match prepared {
            Ok(prepared) => {
                if let Some(tail) = out_tail {
                    tail.set(prepared.tail);
                }
                if let Some(stmt) = prepared.stmt {
                    let handle = self.statements.insert(StmtRecord {
                        raw: stmt.as_ptr() as usize,
                        db,
                    });
                    out_stmt.set(handle);
                }
                SQLITE_OK
            }
            Err(err) => {
                debug!(%db, error = %err, "prepare failed");
                self.fail(&err)
            }
        }
    }

    /// Advance `stmt`: `SQLITE_ROW`, `SQLITE_DONE`, or an error code.
    pub fn step(&self, stmt: StmtHandle) -> i32 {
        self.threads.attach();
        let Some(raw) = self.stmt_ptr(stmt) else {
            return self.stale(stmt);
        };
        match unsafe { self.api.step(raw) } {
            Ok(StepResult::Row) => SQLITE_ROW,
            Ok(StepResult::Done) => SQLITE_DONE,
            Err(err) => self.fail(&err),
        }
    }

    pub fn reset(&self, stmt: StmtHandle) -> i32 {
        self.with_stmt(stmt, |api, raw| unsafe { api.reset(raw) })
    }

    pub fn clear_bindings(&self, stmt: StmtHandle) -> i32 {
        self.with_stmt(stmt, |api, raw| unsafe { api.clear_bindings(raw) })
    }

    /// Release `stmt`. The handle is invalid afterwards whatever the engine reports.
    pub fn finalize(&self, stmt: StmtHandle) -> i32 {
        self.threads.attach();
        let Some(record) = self.statements.remove(stmt) else {
            return self.stale(stmt);
        };
        let Some(raw) = NonNull::new(record.raw as *mut P::Stmt) else {
            return SQLITE_OK;
        };
        match unsafe { self.api.finalize(raw) } {
            Ok(()) => SQLITE_OK,
            Err(err) => self.fail(&err),
        }
    }

    fn with_stmt(
        &self,
        stmt: StmtHandle,
        f: impl FnOnce(&'static P, NonNull<P::Stmt>) -> crate::Result<()>,
    ) -> i32 {
        self.threads.attach();
        let Some(raw) = self.stmt_ptr(stmt) else {
            return self.stale(stmt);
        };
        match f(self.api, raw) {
            Ok(()) => SQLITE_OK,
            Err(err) => self.fail(&err),
        }
    }

    /// Bind `value` to the 1-based parameter `idx`.
    pub fn bind(&self, stmt: StmtHandle, idx: i32, value: &Value) -> i32 {
        self.bind_ref(stmt, idx, value.as_value_ref())
    }

    /// Bind a borrowed value; the engine copies text and blob payloads.
    pub fn bind_ref(&self, stmt: StmtHandle, idx: i32, value: ValueRef<'_>) -> i32 {
        self.with_stmt(stmt, |api, raw| unsafe {
            match value {
                ValueRef::Null => api.bind_null(raw, idx),
                ValueRef::Integer(v) => api.bind_int64(raw, idx, v),
                ValueRef::Float(v) => api.bind_double(raw, idx, v),
                ValueRef::Text(v) => api.bind_text(raw, idx, v.as_bytes()),
                ValueRef::Blob(v) => api.bind_blob(raw, idx, v),
                ValueRef::ZeroBlob(n) => api.bind_zeroblob(raw, idx, n),
                ValueRef::Object(object) => api.bind_pointer(
                    raw,
                    idx,
                    into_host_object_ptr(object),
                    HOST_OBJECT_TAG,
                    Some(drop_host_object),
                ),
            }
        })
    }

    pub fn bind_null(&self, stmt: StmtHandle, idx: i32) -> i32 {
        self.bind_ref(stmt, idx, ValueRef::Null)
    }

    pub fn bind_int(&self, stmt: StmtHandle, idx: i32, v: i32) -> i32 {
        self.bind_ref(stmt, idx, ValueRef::Integer(i64::from(v)))
    }

    pub fn bind_int64(&self, stmt: StmtHandle, idx: i32, v: i64) -> i32 {
        self.bind_ref(stmt, idx, ValueRef::Integer(v))
    }

    pub fn bind_double(&self, stmt: StmtHandle, idx: i32, v: f64) -> i32 {
        self.bind_ref(stmt, idx, ValueRef::Float(v))
    }

    pub fn bind_text(&self, stmt: StmtHandle, idx: i32, v: &str) -> i32 {
        self.bind_ref(stmt, idx, ValueRef::Text(v))
    }

    /// Bind `v` as native-order UTF-16.
    pub fn bind_text16(&self, stmt: StmtHandle, idx: i32, v: &str) -> i32 {
        self.bind_encoded(stmt, idx, &EncodedText::new(v, Encoding::Utf16))
    }

    /// Bind pre-encoded text; its byte length excludes any terminator.
    pub fn bind_encoded(&self, stmt: StmtHandle, idx: i32, text: &EncodedText) -> i32 {
        self.with_stmt(stmt, |api, raw| unsafe {
            match text.encoding() {
                Encoding::Utf8 => api.bind_text(raw, idx, text.payload()),
                Encoding::Utf16 => api.bind_text16(raw, idx, text.payload()),
            }
        })
    }

    pub fn bind_blob(&self, stmt: StmtHandle, idx: i32, v: &[u8]) -> i32 {
        self.bind_ref(stmt, idx, ValueRef::Blob(v))
    }

    pub fn bind_zeroblob(&self, stmt: StmtHandle, idx: i32, n: i32) -> i32 {
        self.bind_ref(stmt, idx, ValueRef::ZeroBlob(n))
    }

    /// Bind a host object; SQL sees NULL, functions can read the object back.
    pub fn bind_object(&self, stmt: StmtHandle, idx: i32, object: HostObject) -> i32 {
        self.bind_ref(stmt, idx, ValueRef::Object(&object))
    }

    pub fn bind_parameter_count(&self, stmt: StmtHandle) -> i32 {
        self.threads.attach();
        match self.stmt_ptr(stmt) {
            Some(raw) => unsafe { self.api.bind_parameter_count(raw) },
            None => {
                self.stale(stmt);
                0
            }
        }
    }

    /// 1-based index of a named parameter such as `:name`, or 0.
    pub fn bind_parameter_index(&self, stmt: StmtHandle, name: &str) -> i32 {
        self.threads.attach();
        match self.stmt_ptr(stmt) {
            Some(raw) => unsafe { self.api.bind_parameter_index(raw, name) },
            None => {
                self.stale(stmt);
                0
            }
        }
    }

    /// Run `f` against a live statement; stale handles record misuse and yield `default`.
    fn read_stmt<T>(
        &self,
        stmt: StmtHandle,
        default: T,
        f: impl FnOnce(&'static P, NonNull<P::Stmt>) -> T,
    ) -> T {
        self.threads.attach();
        match self.stmt_ptr(stmt) {
            Some(raw) => f(self.api, raw),
            None => {
                self.stale(stmt);
                default
            }
        }
    }

    pub fn column_count(&self, stmt: StmtHandle) -> i32 {
        self.read_stmt(stmt, 0, |api, raw| unsafe { api.column_count(raw) })
    }

    pub fn column_type(&self, stmt: StmtHandle, col: i32) -> ValueType {
        self.read_stmt(stmt, ValueType::Null, |api, raw| unsafe { api.column_type(raw, col) })
    }

    pub fn column_int(&self, stmt: StmtHandle, col: i32) -> i32 {
        self.column_int64(stmt, col) as i32
    }

    pub fn column_int64(&self, stmt: StmtHandle, col: i32) -> i64 {
        self.read_stmt(stmt, 0, |api, raw| unsafe { api.column_int64(raw, col) })
    }

    pub fn column_double(&self, stmt: StmtHandle, col: i32) -> f64 {
        self.read_stmt(stmt, 0.0, |api, raw| unsafe { api.column_double(raw, col) })
    }

    /// Column text, `None` for SQL NULL.
    pub fn column_text(&self, stmt: StmtHandle, col: i32) -> Option<String> {
        self.read_stmt(stmt, None, |api, raw| unsafe {
            copy_text(api.column_text(raw, col), Encoding::Utf8)
        })
    }

    /// Column text read through the engine's UTF-16 conversion.
    pub fn column_text16(&self, stmt: StmtHandle, col: i32) -> Option<String> {
        self.read_stmt(stmt, None, |api, raw| unsafe {
            match api.column_text16(raw, col) {
                Some(bytes) => copy_text(bytes, Encoding::Utf16),
                None => copy_text(api.column_text(raw, col), Encoding::Utf8),
            }
        })
    }

    /// Column bytes, `None` for SQL NULL.
    pub fn column_blob(&self, stmt: StmtHandle, col: i32) -> Option<Vec<u8>> {
        self.read_stmt(stmt, None, |api, raw| unsafe {
            match api.column_type(raw, col) {
                ValueType::Null => None,
                _ => Some(api.column_blob(raw, col).to_vec()),
            }
        })
    }

    /// Size in bytes of the column's text or blob form.
    pub fn column_bytes(&self, stmt: StmtHandle, col: i32) -> i32 {
        self.read_stmt(stmt, 0, |api, raw| unsafe {
            let len = match api.column_type(raw, col) {
                ValueType::Null => 0,
                ValueType::Blob => api.column_blob(raw, col).len,
                _ => api.column_text(raw, col).len,
            };
            i32::try_from(len).unwrap_or(i32::MAX)
        })
    }

    pub fn column_name(&self, stmt: StmtHandle, col: i32) -> Option<String> {
        self.read_stmt(stmt, None, |api, raw| unsafe {
            api.column_name(raw, col)
                .and_then(|bytes| copy_text(bytes, Encoding::Utf8))
        })
    }

    /// Owned copy of a column of the current row.
    pub fn column_value(&self, stmt: StmtHandle, col: i32) -> Value {
        self.read_stmt(stmt, Value::Null, |api, raw| unsafe {
            match api.column_type(raw, col) {
                ValueType::Null => Value::Null,
                ValueType::Integer => Value::Integer(api.column_int64(raw, col)),
                ValueType::Float => Value::Float(api.column_double(raw, col)),
                ValueType::Text => {
                    let text = copy_text(api.column_text(raw, col), Encoding::Utf8);
                    Value::Text(text.unwrap_or_default())
                }
                ValueType::Blob => Value::Blob(api.column_blob(raw, col).to_vec()),
            }
        })
    }

    /// Primary or extended result code of the most recent failure on `db`.
    pub fn errcode(&self, db: DbHandle) -> i32 {
        self.threads.attach();
        match self.db_ptr(db) {
            Some(raw) => unsafe { self.api.errcode(raw) },
            None => self.stale(db),
        }
    }

    pub fn extended_errcode(&self, db: DbHandle) -> i32 {
        self.threads.attach();
        match self.db_ptr(db) {
            Some(raw) => unsafe {
                self.api
                    .extended_errcode(raw)
                    .unwrap_or_else(|| self.api.errcode(raw))
            },
            None => self.stale(db),
        }
    }

    /// Engine error message for `db`; for a stale handle, the misuse diagnostic.
    pub fn errmsg(&self, db: DbHandle) -> String {
        self.threads.attach();
        match self.db_ptr(db) {
            Some(raw) => unsafe { encoding::c_str_lossy(self.api.errmsg(raw)) }.unwrap_or_default(),
            None => {
                self.stale(db);
                self.last_error_message().unwrap_or_default()
            }
        }
    }

    pub fn changes(&self, db: DbHandle) -> i64 {
        self.threads.attach();
        match self.db_ptr(db) {
            Some(raw) => unsafe { self.api.changes(raw) },
            None => {
                self.stale(db);
                0
            }
        }
    }

    pub fn last_insert_rowid(&self, db: DbHandle) -> i64 {
        self.threads.attach();
        match self.db_ptr(db) {
            Some(raw) => unsafe { self.api.last_insert_rowid(raw) },
            None => {
                self.stale(db);
                0
            }
        }
    }

    /// Ask the statements running on `db` to stop. Safe from any thread.
    pub fn interrupt(&self, db: DbHandle) -> i32 {
        match self.db_ptr(db) {
            Some(raw) => {
                unsafe { self.api.interrupt(raw) };
                SQLITE_OK
            }
            None => self.stale(db),
        }
    }

    /// Add an extension to run after each successful open.
    pub fn auto_extension(&self, extension: AutoExtension<P>) -> i32 {
        self.threads.attach();
        match self.auto_extensions.register(extension) {
            SQLITE_MISUSE => self.misuse("auto-extension list changed during traversal".to_owned()),
            rc => rc,
        }
    }

    pub fn cancel_auto_extension(&self, extension: &AutoExtension<P>) -> bool {
        self.threads.attach();
        self.auto_extensions.cancel(extension)
    }

    pub fn reset_auto_extension(&self) -> i32 {
        self.threads.attach();
        match self.auto_extensions.reset() {
            SQLITE_MISUSE => self.misuse("auto-extension list changed during traversal".to_owned()),
            rc => rc,
        }
    }

    /// Version of the engine behind the provider.
    pub fn libversion(&self) -> ApiVersion {
        self.api.api_version()
    }

    /// Initialize the engine. Repeating it is harmless; after
    /// [`Bridge::shutdown`] it must run again before the engine is reused.
    pub fn initialize(&self) -> i32 {
        let _serial = self.shutdown_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.threads.attach();
        match unsafe { self.api.initialize() } {
            Ok(()) => {
                debug!(version = ?self.api.api_version(), "engine initialized");
                SQLITE_OK
            }
            Err(err) => self.fail(&err),
        }
    }

    /// Select the engine threading mode; valid only before initialization or after
    /// shutdown.
    pub fn config_threading(&self, mode: ThreadingMode) -> i32 {
        self.threads.attach();
        match unsafe { self.api.config_threading(mode) } {
            Ok(()) => {
                debug!(?mode, "threading mode configured");
                SQLITE_OK
            }
            Err(err) => self.fail(&err),
        }
    }

    /// Install or clear the process-wide engine error log.
    pub fn config_log(&self, handler: Option<Arc<LogFn>>) -> i32 {
        self.threads.attach();
        let result = match &handler {
            Some(_) => unsafe {
                let context = Arc::as_ptr(&self.log) as *mut core::ffi::c_void;
                self.api.config_log(Some(log_trampoline), context)
            },
            None => unsafe { self.api.config_log(None, core::ptr::null_mut()) },
        };
        match result {
            Ok(()) => {
                self.log.replace(handler);
                SQLITE_OK
            }
            Err(err) => self.fail(&err),
        }
    }

    /// Forget the calling thread's cache entry.
    ///
    /// Every thread should call this before it stops using the layer. Calling it
    /// again, or from a thread that never used the layer, is harmless; the
    /// return value only reports whether an entry existed.
    pub fn thread_cleanup(&self) -> bool {
        self.threads.detach()
    }

    /// Release every resource and shut the engine down.
    ///
    /// All statements are finalized, all connections closed, every callback
    /// registration and auto-extension dropped, and every thread entry cleared.
    pub fn shutdown(&self) -> i32 {
        let _serial = self.shutdown_lock.lock().unwrap_or_else(|p| p.into_inner());
        let closed = self.release_all();
        let _ = self.auto_extensions.reset();
        let rc = match unsafe { self.api.shutdown() } {
            Ok(()) => SQLITE_OK,
            Err(err) => self.fail(&err),
        };
        if rc == SQLITE_OK
            && self.log.is_set()
            && unsafe { self.api.config_log(None, core::ptr::null_mut()) }.is_ok()
        {
            self.log.replace(None);
        }
        let threads = self.threads.clear();
        debug!(closed, threads, rc, "shutdown complete");
        rc
    }
}

/// Copy engine text out of its buffer; a null pointer is SQL NULL.
pub(crate) unsafe fn copy_text(bytes: RawBytes, encoding: Encoding) -> Option<String> {
    if bytes.ptr.is_null() {
        return None;
    }
    Some(encoding::decode(unsafe { bytes.as_slice() }, encoding))
}
