//! Dynamic `libsqlite3` backend for `sqlite-bridge`.
//!
//! The library is located with `dlopen` at runtime. Optional entry points
//! (UTF-16 text, pointer passing, pre-update hooks, `sqlite3_config`) are
//! probed one by one and reported through [`FeatureSet`].

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uchar, c_void};
use sqlite_bridge::{
    ApiVersion, AuthorizerCallback, BusyCallback, CompareCallback, DestroyCallback, Error,
    ErrorCode, FeatureSet, FunctionFlags, InterruptCallback, OpenFlags, RawBytes, Result,
    RollbackCallback, TraceCallback, UpdateCallback,
};
use std::ffi::{CStr, CString};
use std::ptr::{NonNull, null, null_mut};
use std::sync::OnceLock;

use tracing::debug;

mod core_impl;
mod extensions_impl;

#[cfg(target_os = "linux")]
#[link(name = "dl")]
unsafe extern "C" {}

const SQLITE_OK: i32 = 0;
const SQLITE_ROW: i32 = 100;
const SQLITE_DONE: i32 = 101;

const SQLITE_OPEN_READONLY: i32 = 0x0000_0001;
const SQLITE_OPEN_READWRITE: i32 = 0x0000_0002;
const SQLITE_OPEN_CREATE: i32 = 0x0000_0004;
const SQLITE_OPEN_URI: i32 = 0x0000_0040;
const SQLITE_OPEN_MEMORY: i32 = 0x0000_0080;
const SQLITE_OPEN_NOMUTEX: i32 = 0x0000_8000;
const SQLITE_OPEN_FULLMUTEX: i32 = 0x0001_0000;
const SQLITE_OPEN_EXRESCODE: i32 = 0x0200_0000;

const SQLITE_UTF8: i32 = 0x0000_0001;
const SQLITE_DETERMINISTIC: i32 = 0x0000_0800;
const SQLITE_INNOCUOUS: i32 = 0x0002_0000;
const SQLITE_DIRECTONLY: i32 = 0x0008_0000;

const SQLITE_CONFIG_SINGLETHREAD: i32 = 1;
const SQLITE_CONFIG_MULTITHREAD: i32 = 2;
const SQLITE_CONFIG_SERIALIZED: i32 = 3;
const SQLITE_CONFIG_LOG: i32 = 16;

const EMPTY_BYTE: u8 = 0;

type sqlite3 = c_void;
type sqlite3_stmt = c_void;
type sqlite3_value = c_void;
type sqlite3_context = c_void;

type sqlite3_destructor_type = Option<DestroyCallback>;
type ScalarCallback = unsafe extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value);
type FinalCallback = unsafe extern "C" fn(*mut sqlite3_context);
type CollationNeededCallback =
    unsafe extern "C" fn(*mut c_void, *mut sqlite3, c_int, *const c_char);
type PreUpdateCallback =
    unsafe extern "C" fn(*mut c_void, *mut sqlite3, c_int, *const c_char, *const c_char, i64, i64);

type OpenV2 = unsafe extern "C" fn(*const c_char, *mut *mut sqlite3, c_int, *const c_char) -> c_int;
type Close = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type PrepareV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut *mut sqlite3_stmt,
    *mut *const c_char,
) -> c_int;
type PrepareV3 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    u32,
    *mut *mut sqlite3_stmt,
    *mut *const c_char,
) -> c_int;
type StmtFn = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type DbHandleFn = unsafe extern "C" fn(*mut sqlite3_stmt) -> *mut sqlite3;

type BindNull = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type BindInt64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, i64) -> c_int;
type BindDouble = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, f64) -> c_int;
type BindBytes = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_void,
    c_int,
    sqlite3_destructor_type,
) -> c_int;
type BindZeroblob = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, c_int) -> c_int;
type BindPointer = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *mut c_void,
    *const c_char,
    sqlite3_destructor_type,
) -> c_int;
type BindParameterIndex = unsafe extern "C" fn(*mut sqlite3_stmt, *const c_char) -> c_int;

type ColumnInt = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type ColumnInt64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> i64;
type ColumnDouble = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> f64;
type ColumnText = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_uchar;
type ColumnPtr = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_void;
type ColumnName = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_char;

type DbInt = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type DbInt64 = unsafe extern "C" fn(*mut sqlite3) -> i64;
type ErrMsg = unsafe extern "C" fn(*mut sqlite3) -> *const c_char;
type Interrupt = unsafe extern "C" fn(*mut sqlite3);

type CreateFunctionV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    c_int,
    *mut c_void,
    Option<ScalarCallback>,
    Option<ScalarCallback>,
    Option<FinalCallback>,
    sqlite3_destructor_type,
) -> c_int;
type CreateWindowFunction = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    c_int,
    *mut c_void,
    Option<ScalarCallback>,
    Option<FinalCallback>,
    Option<FinalCallback>,
    Option<ScalarCallback>,
    sqlite3_destructor_type,
) -> c_int;
type CreateCollationV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut c_void,
    Option<CompareCallback>,
    sqlite3_destructor_type,
) -> c_int;

type AggregateContext = unsafe extern "C" fn(*mut sqlite3_context, c_int) -> *mut c_void;
type ResultNull = unsafe extern "C" fn(*mut sqlite3_context);
type ResultInt64 = unsafe extern "C" fn(*mut sqlite3_context, i64);
type ResultDouble = unsafe extern "C" fn(*mut sqlite3_context, f64);
type ResultBytes =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_void, c_int, sqlite3_destructor_type);
type ResultInt = unsafe extern "C" fn(*mut sqlite3_context, c_int);
type ResultPointer =
    unsafe extern "C" fn(*mut sqlite3_context, *mut c_void, *const c_char, sqlite3_destructor_type);
type ResultError = unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int);
type UserData = unsafe extern "C" fn(*mut sqlite3_context) -> *mut c_void;

type ValueInt = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
type ValueInt64 = unsafe extern "C" fn(*mut sqlite3_value) -> i64;
type ValueDouble = unsafe extern "C" fn(*mut sqlite3_value) -> f64;
type ValuePtr = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_void;
type ValuePointer = unsafe extern "C" fn(*mut sqlite3_value, *const c_char) -> *mut c_void;

type Config = unsafe extern "C" fn(c_int, ...) -> c_int;
type NoArgs = unsafe extern "C" fn() -> c_int;
type Malloc = unsafe extern "C" fn(c_int) -> *mut c_void;
type Free = unsafe extern "C" fn(*mut c_void);

type TraceV2 = unsafe extern "C" fn(*mut sqlite3, u32, Option<TraceCallback>, *mut c_void) -> c_int;
type ProgressHandler =
    unsafe extern "C" fn(*mut sqlite3, c_int, Option<InterruptCallback>, *mut c_void);
type BusyTimeout = unsafe extern "C" fn(*mut sqlite3, c_int) -> c_int;
type BusyHandler = unsafe extern "C" fn(*mut sqlite3, Option<BusyCallback>, *mut c_void) -> c_int;
type SetAuthorizer =
    unsafe extern "C" fn(*mut sqlite3, Option<AuthorizerCallback>, *mut c_void) -> c_int;
type CommitHook =
    unsafe extern "C" fn(*mut sqlite3, Option<InterruptCallback>, *mut c_void) -> *mut c_void;
type RollbackHook =
    unsafe extern "C" fn(*mut sqlite3, Option<RollbackCallback>, *mut c_void) -> *mut c_void;
type UpdateHook =
    unsafe extern "C" fn(*mut sqlite3, Option<UpdateCallback>, *mut c_void) -> *mut c_void;
type CollationNeeded =
    unsafe extern "C" fn(*mut sqlite3, *mut c_void, Option<CollationNeededCallback>) -> c_int;
type PreUpdateHook =
    unsafe extern "C" fn(*mut sqlite3, Option<PreUpdateCallback>, *mut c_void) -> *mut c_void;
type PreUpdateValue = unsafe extern "C" fn(*mut sqlite3, c_int, *mut *mut sqlite3_value) -> c_int;

struct LibHandle {
    handle: *mut c_void,
}

unsafe impl Send for LibHandle {}
unsafe impl Sync for LibHandle {}

impl LibHandle {
    unsafe fn open() -> Option<Self> {
        for name in lib_names() {
            let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
            if !handle.is_null() {
                return Some(Self { handle });
            }
        }
        None
    }

    unsafe fn symbol<T: Copy>(&self, name: &CStr) -> Option<T> {
        let sym = unsafe { libc::dlsym(self.handle, name.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            debug_assert_eq!(size_of::<T>(), size_of::<*mut c_void>());
            Some(unsafe { std::mem::transmute_copy(&sym) })
        }
    }
}

/// Entry points resolved from the loaded library.
struct LibSqlite3Fns {
    open_v2: OpenV2,
    close: Close,
    prepare_v2: PrepareV2,
    prepare_v3: Option<PrepareV3>,
    step: StmtFn,
    reset: StmtFn,
    clear_bindings: StmtFn,
    finalize: StmtFn,
    db_handle: DbHandleFn,
    bind_null: BindNull,
    bind_int64: BindInt64,
    bind_double: BindDouble,
    bind_text: BindBytes,
    bind_text16: Option<BindBytes>,
    bind_blob: BindBytes,
    bind_zeroblob: BindZeroblob,
    bind_pointer: Option<BindPointer>,
    bind_parameter_count: StmtFn,
    bind_parameter_index: BindParameterIndex,
    column_count: StmtFn,
    column_type: ColumnInt,
    column_int64: ColumnInt64,
    column_double: ColumnDouble,
    column_text: ColumnText,
    column_text16: Option<ColumnPtr>,
    column_blob: ColumnPtr,
    column_bytes: ColumnInt,
    column_bytes16: Option<ColumnInt>,
    column_name: ColumnName,
    errcode: DbInt,
    errmsg: ErrMsg,
    extended_errcode: Option<DbInt>,
    changes: DbInt,
    changes64: Option<DbInt64>,
    last_insert_rowid: DbInt64,
    interrupt: Interrupt,
    create_function_v2: CreateFunctionV2,
    create_window_function: Option<CreateWindowFunction>,
    create_collation_v2: Option<CreateCollationV2>,
    aggregate_context: AggregateContext,
    result_null: ResultNull,
    result_int64: ResultInt64,
    result_double: ResultDouble,
    result_text: ResultBytes,
    result_text16: Option<ResultBytes>,
    result_blob: ResultBytes,
    result_zeroblob: Option<ResultInt>,
    result_pointer: Option<ResultPointer>,
    result_error: ResultError,
    result_error_code: Option<ResultInt>,
    user_data: UserData,
    value_type: ValueInt,
    value_int64: ValueInt64,
    value_double: ValueDouble,
    value_text: ValuePtr,
    value_text16: Option<ValuePtr>,
    value_blob: ValuePtr,
    value_bytes: ValueInt,
    value_bytes16: Option<ValueInt>,
    value_pointer: Option<ValuePointer>,
    config: Option<Config>,
    initialize: NoArgs,
    shutdown: NoArgs,
    threadsafe: NoArgs,
    libversion_number: NoArgs,
    malloc: Malloc,
    free: Free,
    trace_v2: Option<TraceV2>,
    progress_handler: Option<ProgressHandler>,
    busy_timeout: Option<BusyTimeout>,
    busy_handler: Option<BusyHandler>,
    set_authorizer: Option<SetAuthorizer>,
    commit_hook: Option<CommitHook>,
    rollback_hook: Option<RollbackHook>,
    update_hook: Option<UpdateHook>,
    collation_needed: Option<CollationNeeded>,
    preupdate_hook: Option<PreUpdateHook>,
    preupdate_count: Option<DbInt>,
    preupdate_old: Option<PreUpdateValue>,
    preupdate_new: Option<PreUpdateValue>,
}

impl LibSqlite3Fns {
    unsafe fn load(lib: &LibHandle) -> Option<Self> {
        unsafe {
            Some(Self {
                open_v2: lib.symbol(c"sqlite3_open_v2")?,
                close: lib.symbol(c"sqlite3_close")?,
                prepare_v2: lib.symbol(c"sqlite3_prepare_v2")?,
                prepare_v3: lib.symbol(c"sqlite3_prepare_v3"),
                step: lib.symbol(c"sqlite3_step")?,
                reset: lib.symbol(c"sqlite3_reset")?,
                clear_bindings: lib.symbol(c"sqlite3_clear_bindings")?,
                finalize: lib.symbol(c"sqlite3_finalize")?,
                db_handle: lib.symbol(c"sqlite3_db_handle")?,
                bind_null: lib.symbol(c"sqlite3_bind_null")?,
                bind_int64: lib.symbol(c"sqlite3_bind_int64")?,
                bind_double: lib.symbol(c"sqlite3_bind_double")?,
                bind_text: lib.symbol(c"sqlite3_bind_text")?,
                bind_text16: lib.symbol(c"sqlite3_bind_text16"),
                bind_blob: lib.symbol(c"sqlite3_bind_blob")?,
                bind_zeroblob: lib.symbol(c"sqlite3_bind_zeroblob")?,
                bind_pointer: lib.symbol(c"sqlite3_bind_pointer"),
                bind_parameter_count: lib.symbol(c"sqlite3_bind_parameter_count")?,
                bind_parameter_index: lib.symbol(c"sqlite3_bind_parameter_index")?,
                column_count: lib.symbol(c"sqlite3_column_count")?,
                column_type: lib.symbol(c"sqlite3_column_type")?,
                column_int64: lib.symbol(c"sqlite3_column_int64")?,
                column_double: lib.symbol(c"sqlite3_column_double")?,
                column_text: lib.symbol(c"sqlite3_column_text")?,
                column_text16: lib.symbol(c"sqlite3_column_text16"),
                column_blob: lib.symbol(c"sqlite3_column_blob")?,
                column_bytes: lib.symbol(c"sqlite3_column_bytes")?,
                column_bytes16: lib.symbol(c"sqlite3_column_bytes16"),
                column_name: lib.symbol(c"sqlite3_column_name")?,
                errcode: lib.symbol(c"sqlite3_errcode")?,
                errmsg: lib.symbol(c"sqlite3_errmsg")?,
                extended_errcode: lib.symbol(c"sqlite3_extended_errcode"),
                changes: lib.symbol(c"sqlite3_changes")?,
                changes64: lib.symbol(c"sqlite3_changes64"),
                last_insert_rowid: lib.symbol(c"sqlite3_last_insert_rowid")?,
                interrupt: lib.symbol(c"sqlite3_interrupt")?,
                create_function_v2: lib.symbol(c"sqlite3_create_function_v2")?,
                create_window_function: lib.symbol(c"sqlite3_create_window_function"),
                create_collation_v2: lib.symbol(c"sqlite3_create_collation_v2"),
                aggregate_context: lib.symbol(c"sqlite3_aggregate_context")?,
                result_null: lib.symbol(c"sqlite3_result_null")?,
                result_int64: lib.symbol(c"sqlite3_result_int64")?,
                result_double: lib.symbol(c"sqlite3_result_double")?,
                result_text: lib.symbol(c"sqlite3_result_text")?,
                result_text16: lib.symbol(c"sqlite3_result_text16"),
                result_blob: lib.symbol(c"sqlite3_result_blob")?,
                result_zeroblob: lib.symbol(c"sqlite3_result_zeroblob"),
                result_pointer: lib.symbol(c"sqlite3_result_pointer"),
                result_error: lib.symbol(c"sqlite3_result_error")?,
                result_error_code: lib.symbol(c"sqlite3_result_error_code"),
                user_data: lib.symbol(c"sqlite3_user_data")?,
                value_type: lib.symbol(c"sqlite3_value_type")?,
                value_int64: lib.symbol(c"sqlite3_value_int64")?,
                value_double: lib.symbol(c"sqlite3_value_double")?,
                value_text: lib.symbol(c"sqlite3_value_text")?,
                value_text16: lib.symbol(c"sqlite3_value_text16"),
                value_blob: lib.symbol(c"sqlite3_value_blob")?,
                value_bytes: lib.symbol(c"sqlite3_value_bytes")?,
                value_bytes16: lib.symbol(c"sqlite3_value_bytes16"),
                value_pointer: lib.symbol(c"sqlite3_value_pointer"),
                config: lib.symbol(c"sqlite3_config"),
                initialize: lib.symbol(c"sqlite3_initialize")?,
                shutdown: lib.symbol(c"sqlite3_shutdown")?,
                threadsafe: lib.symbol(c"sqlite3_threadsafe")?,
                libversion_number: lib.symbol(c"sqlite3_libversion_number")?,
                malloc: lib.symbol(c"sqlite3_malloc")?,
                free: lib.symbol(c"sqlite3_free")?,
                trace_v2: lib.symbol(c"sqlite3_trace_v2"),
                progress_handler: lib.symbol(c"sqlite3_progress_handler"),
                busy_timeout: lib.symbol(c"sqlite3_busy_timeout"),
                busy_handler: lib.symbol(c"sqlite3_busy_handler"),
                set_authorizer: lib.symbol(c"sqlite3_set_authorizer"),
                commit_hook: lib.symbol(c"sqlite3_commit_hook"),
                rollback_hook: lib.symbol(c"sqlite3_rollback_hook"),
                update_hook: lib.symbol(c"sqlite3_update_hook"),
                collation_needed: lib.symbol(c"sqlite3_collation_needed"),
                preupdate_hook: lib.symbol(c"sqlite3_preupdate_hook"),
                preupdate_count: lib.symbol(c"sqlite3_preupdate_count"),
                preupdate_old: lib.symbol(c"sqlite3_preupdate_old"),
                preupdate_new: lib.symbol(c"sqlite3_preupdate_new"),
            })
        }
    }

    fn features(&self) -> FeatureSet {
        let mut features = FeatureSet::CREATE_FUNCTION_V2;
        if self.prepare_v3.is_some() {
            features |= FeatureSet::PREPARE_V3;
        }
        if self.extended_errcode.is_some() {
            features |= FeatureSet::EXTENDED_ERRCODES;
        }
        if self.bind_text16.is_some()
            && self.column_text16.is_some()
            && self.result_text16.is_some()
            && self.value_text16.is_some()
        {
            features |= FeatureSet::UTF16;
        }
        if self.bind_pointer.is_some()
            && self.result_pointer.is_some()
            && self.value_pointer.is_some()
        {
            features |= FeatureSet::POINTER_PASSING;
        }
        if self.preupdate_hook.is_some()
            && self.preupdate_count.is_some()
            && self.preupdate_old.is_some()
            && self.preupdate_new.is_some()
        {
            features |= FeatureSet::PREUPDATE_HOOK;
        }
        if self.config.is_some() {
            features |= FeatureSet::CONFIG;
        }
        if self.create_window_function.is_some() {
            features |= FeatureSet::WINDOW_FUNCTIONS;
        }
        features
    }
}

static USER_DATA_FN: OnceLock<UserData> = OnceLock::new();
static INSTANCE: OnceLock<Option<&'static LibSqlite3>> = OnceLock::new();

/// `libsqlite3` provider loaded via `dlopen`.
pub struct LibSqlite3 {
    fns: LibSqlite3Fns,
    features: FeatureSet,
    api_version: ApiVersion,
    _lib: LibHandle,
}

impl LibSqlite3 {
    /// Load `libsqlite3` once and return the process-wide provider.
    ///
    /// Returns `None` if the library or a required symbol is unavailable.
    pub fn load() -> Option<&'static LibSqlite3> {
        *INSTANCE.get_or_init(|| unsafe {
            let lib = LibHandle::open()?;
            let fns = LibSqlite3Fns::load(&lib)?;
            let api_version = ApiVersion::from_number((fns.libversion_number)());
            let features = fns.features();
            let _ = USER_DATA_FN.set(fns.user_data);
            debug!(?api_version, ?features, "libsqlite3 loaded");
            let adapter = LibSqlite3 {
                fns,
                features,
                api_version,
                _lib: lib,
            };
            Some(&*Box::leak(Box::new(adapter)))
        })
    }

    fn check(&self, rc: i32, db: Option<NonNull<sqlite3>>) -> Result<()> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, db))
        }
    }

    fn error_from_rc(&self, rc: i32, db: Option<NonNull<sqlite3>>) -> Error {
        let message = db
            .and_then(|db| unsafe { raw_cstr((self.fns.errmsg)(db.as_ptr())) })
            .map(|c| c.to_string_lossy().into_owned());
        let extended = db.and_then(|db| {
            self.fns
                .extended_errcode
                .map(|f| unsafe { f(db.as_ptr()) })
        });
        Error::from_code(rc, message, extended)
    }

    /// Connection owning `stmt`, for error messages.
    fn stmt_db(&self, stmt: NonNull<sqlite3_stmt>) -> Option<NonNull<sqlite3>> {
        NonNull::new(unsafe { (self.fns.db_handle)(stmt.as_ptr()) })
    }

    // Allocate with sqlite3_malloc so SQLite can free via sqlite3_free.
    fn alloc_copy(&self, bytes: &[u8]) -> Result<(*const c_void, sqlite3_destructor_type)> {
        if bytes.is_empty() {
            return Ok((&EMPTY_BYTE as *const u8 as *const c_void, None));
        }
        if bytes.len() > i32::MAX as usize {
            return Err(Error::with_message(ErrorCode::TooBig, "value too large"));
        }
        let ptr = unsafe { (self.fns.malloc)(bytes.len() as i32) };
        if ptr.is_null() {
            return Err(Error::new(ErrorCode::NoMem));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        }
        Ok((ptr, Some(self.fns.free)))
    }
}

fn map_open_flags(flags: OpenFlags) -> i32 {
    let mut out = 0;
    if flags.contains(OpenFlags::READ_ONLY) {
        out |= SQLITE_OPEN_READONLY;
    }
    if flags.contains(OpenFlags::READ_WRITE) {
        out |= SQLITE_OPEN_READWRITE;
    }
    if flags.contains(OpenFlags::CREATE) {
        out |= SQLITE_OPEN_CREATE;
    }
    if flags.contains(OpenFlags::URI) {
        out |= SQLITE_OPEN_URI;
    }
    if flags.contains(OpenFlags::MEMORY) {
        out |= SQLITE_OPEN_MEMORY;
    }
    if flags.contains(OpenFlags::NO_MUTEX) {
        out |= SQLITE_OPEN_NOMUTEX;
    }
    if flags.contains(OpenFlags::FULL_MUTEX) {
        out |= SQLITE_OPEN_FULLMUTEX;
    }
    if flags.contains(OpenFlags::EXRESCODE) {
        out |= SQLITE_OPEN_EXRESCODE;
    }
    out
}

fn map_function_flags(flags: FunctionFlags) -> i32 {
    let mut out = SQLITE_UTF8;
    if flags.contains(FunctionFlags::DETERMINISTIC) {
        out |= SQLITE_DETERMINISTIC;
    }
    if flags.contains(FunctionFlags::DIRECT_ONLY) {
        out |= SQLITE_DIRECTONLY;
    }
    if flags.contains(FunctionFlags::INNOCUOUS) {
        out |= SQLITE_INNOCUOUS;
    }
    out
}

fn clamp_len(len: usize) -> i32 {
    if len > i32::MAX as usize {
        i32::MAX
    } else {
        len as i32
    }
}

unsafe fn raw_cstr<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) })
    }
}

fn raw_bytes_from_cstr(cstr: &CStr) -> RawBytes {
    RawBytes {
        ptr: cstr.as_ptr() as *const u8,
        len: cstr.to_bytes().len(),
    }
}

fn raw_bytes(ptr: *const c_void, len: c_int) -> RawBytes {
    if ptr.is_null() {
        return RawBytes::empty();
    }
    RawBytes {
        ptr: ptr as *const u8,
        len: len.max(0) as usize,
    }
}

fn lib_names() -> &'static [&'static CStr] {
    #[cfg(target_os = "macos")]
    const NAMES: [&CStr; 3] = [c"libsqlite3.dylib", c"libsqlite3.so.0", c"libsqlite3.so"];
    #[cfg(not(target_os = "macos"))]
    const NAMES: [&CStr; 2] = [c"libsqlite3.so.0", c"libsqlite3.so"];
    &NAMES
}

#[cfg(test)]
mod tests {
    use super::{
        SQLITE_DETERMINISTIC, SQLITE_OPEN_CREATE, SQLITE_OPEN_MEMORY, SQLITE_OPEN_READWRITE,
        SQLITE_UTF8,
    };
    use super::{clamp_len, map_function_flags, map_open_flags, raw_bytes};
    use sqlite_bridge::{FunctionFlags, OpenFlags};

    #[test]
    fn open_flags_map_to_sqlite_bits() {
        let flags = map_open_flags(OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::MEMORY);
        assert_eq!(flags, SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE | SQLITE_OPEN_MEMORY);
    }

    #[test]
    fn function_flags_always_request_utf8() {
        assert_eq!(map_function_flags(FunctionFlags::empty()), SQLITE_UTF8);
        assert_eq!(
            map_function_flags(FunctionFlags::DETERMINISTIC),
            SQLITE_UTF8 | SQLITE_DETERMINISTIC
        );
    }

    #[test]
    fn lengths_clamp_to_c_int() {
        assert_eq!(clamp_len(5), 5);
        assert_eq!(clamp_len(usize::MAX), i32::MAX);
    }

    #[test]
    fn null_pointers_become_empty_views() {
        let bytes = raw_bytes(std::ptr::null(), 12);
        assert!(bytes.ptr.is_null());
        assert_eq!(bytes.len, 0);
    }
}
