use core::ffi::{CStr, c_char, c_void};
use core::ptr::NonNull;

use crate::error::{Error, Result};

/// Engine version as `major.minor.patch`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ApiVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Decode `sqlite3_libversion_number()` (`X*1000000 + Y*1000 + Z`).
    pub const fn from_number(number: i32) -> Self {
        let major = (number / 1_000_000) as u16;
        let minor = ((number / 1000) % 1000) as u16;
        let patch = (number % 1000) as u16;
        Self::new(major, minor, patch)
    }
}

macro_rules! bit_flags {
    ($name:ident, $bits:ty) => {
        impl $name {
            /// Build an empty flag set.
            pub const fn empty() -> Self {
                Self { bits: 0 }
            }

            /// Build a flag set from raw bits.
            pub const fn from_bits(bits: $bits) -> Self {
                Self { bits }
            }

            /// Return the raw bit representation.
            pub const fn bits(self) -> $bits {
                self.bits
            }

            /// Return whether `other` is fully contained in this set.
            pub const fn contains(self, other: $name) -> bool {
                (self.bits & other.bits) == other.bits
            }
        }

        impl core::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name {
                    bits: self.bits | rhs.bits,
                }
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.bits |= rhs.bits;
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = $name;

            fn bitand(self, rhs: $name) -> $name {
                $name {
                    bits: self.bits & rhs.bits,
                }
            }
        }
    };
}

/// Optional engine entry points a provider found at load time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureSet {
    bits: u64,
}

impl FeatureSet {
    pub const PREPARE_V3: FeatureSet = FeatureSet { bits: 1 << 0 };
    pub const CREATE_FUNCTION_V2: FeatureSet = FeatureSet { bits: 1 << 1 };
    /// `sqlite3_extended_errcode` is available.
    pub const EXTENDED_ERRCODES: FeatureSet = FeatureSet { bits: 1 << 3 };
    /// UTF-16 text entry points (`*_text16`) are available.
    pub const UTF16: FeatureSet = FeatureSet { bits: 1 << 6 };
    /// Pointer-passing interfaces (`bind_pointer` & co.) are available.
    pub const POINTER_PASSING: FeatureSet = FeatureSet { bits: 1 << 7 };
    /// The pre-update hook is compiled into the engine.
    pub const PREUPDATE_HOOK: FeatureSet = FeatureSet { bits: 1 << 8 };
    /// Process configuration (`sqlite3_config`) is reachable.
    pub const CONFIG: FeatureSet = FeatureSet { bits: 1 << 9 };
    /// `sqlite3_create_window_function` is available.
    pub const WINDOW_FUNCTIONS: FeatureSet = FeatureSet { bits: 1 << 10 };
}

bit_flags!(FeatureSet, u64);

/// `SQLITE_OPEN_*` flags in bridge-local bit positions; providers translate them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    bits: u32,
}

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags { bits: 1 << 0 };
    pub const READ_WRITE: OpenFlags = OpenFlags { bits: 1 << 1 };
    pub const CREATE: OpenFlags = OpenFlags { bits: 1 << 2 };
    pub const URI: OpenFlags = OpenFlags { bits: 1 << 3 };
    pub const NO_MUTEX: OpenFlags = OpenFlags { bits: 1 << 4 };
    pub const FULL_MUTEX: OpenFlags = OpenFlags { bits: 1 << 5 };
    /// Open an in-memory database regardless of the filename.
    pub const MEMORY: OpenFlags = OpenFlags { bits: 1 << 6 };
    /// Report extended result codes from the start.
    pub const EXRESCODE: OpenFlags = OpenFlags { bits: 1 << 8 };
}

bit_flags!(OpenFlags, u32);

/// Per-connection open configuration.
#[derive(Clone, Copy, Debug)]
pub struct OpenOptions<'a> {
    pub flags: OpenFlags,
    /// VFS module name; `None` selects the default.
    pub vfs: Option<&'a str>,
}

impl Default for OpenOptions<'_> {
    fn default() -> Self {
        Self {
            flags: OpenFlags::READ_WRITE | OpenFlags::CREATE,
            vfs: None,
        }
    }
}

/// Threading mode selected through the single process configuration call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadingMode {
    /// All mutexes disabled; one thread at a time in the whole library.
    SingleThread,
    /// Connections may be used from several threads, never concurrently.
    MultiThread,
    /// Every connection is guarded by its own mutex.
    Serialized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    Row,
    Done,
}

/// Outcome of a prepare call.
#[derive(Debug)]
pub struct Prepared<S> {
    /// Compiled statement, or `None` when the input held only whitespace or comments.
    pub stmt: Option<NonNull<S>>,
    /// Byte offset of the first unconsumed byte of the SQL input.
    pub tail: usize,
}

/// Fundamental datatype (storage class) of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Integer,
    Float,
    Text,
    Blob,
}

impl ValueType {
    /// `SQLITE_INTEGER` .. `SQLITE_NULL`; anything unknown reads as NULL.
    pub const fn from_code(code: i32) -> ValueType {
        match code {
            1 => ValueType::Integer,
            2 => ValueType::Float,
            3 => ValueType::Text,
            4 => ValueType::Blob,
            _ => ValueType::Null,
        }
    }

    pub const fn to_code(self) -> i32 {
        match self {
            ValueType::Null => 5,
            ValueType::Integer => 1,
            ValueType::Float => 2,
            ValueType::Text => 3,
            ValueType::Blob => 4,
        }
    }
}

/// Borrowed engine buffer.
///
/// Valid only until the engine next touches the row or value it came from:
/// the next `step`, `reset` or `finalize`, or the return of the callback that
/// received the value. Anything kept longer is copied out first.
#[derive(Clone, Copy, Debug)]
pub struct RawBytes {
    pub ptr: *const u8,
    pub len: usize,
}

impl RawBytes {
    /// Null view; text readers treat it as SQL NULL.
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
        }
    }

    /// # Safety
    /// The view must still be live; see the type docs.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Copy the bytes out of the engine's buffer.
    ///
    /// # Safety
    /// Caller must ensure the pointer/length are still valid.
    pub unsafe fn to_vec(self) -> Vec<u8> {
        unsafe { self.as_slice() }.to_vec()
    }
}

/// Function flags passed to `create_function_v2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionFlags {
    bits: u32,
}

impl FunctionFlags {
    /// `SQLITE_DETERMINISTIC`.
    pub const DETERMINISTIC: FunctionFlags = FunctionFlags { bits: 1 << 0 };
    /// `SQLITE_DIRECTONLY`.
    pub const DIRECT_ONLY: FunctionFlags = FunctionFlags { bits: 1 << 1 };
    /// `SQLITE_INNOCUOUS`.
    pub const INNOCUOUS: FunctionFlags = FunctionFlags { bits: 1 << 2 };
}

bit_flags!(FunctionFlags, u32);

/// Type tag under which host objects cross the pointer-passing interfaces.
pub const HOST_OBJECT_TAG: &CStr = c"sqlite-bridge.host-object";

/// `xDestroy`-style destructor for engine-owned user data.
pub type DestroyCallback = unsafe extern "C" fn(*mut c_void);
/// `sqlite3_busy_handler` callback: `(context, prior_invocations) -> retry`.
pub type BusyCallback = unsafe extern "C" fn(*mut c_void, i32) -> i32;
/// `sqlite3_trace_v2` callback: `(mask, context, p, x) -> 0`.
pub type TraceCallback = unsafe extern "C" fn(u32, *mut c_void, *mut c_void, *mut c_void) -> i32;
/// Progress and commit-hook callback: non-zero aborts.
pub type InterruptCallback = unsafe extern "C" fn(*mut c_void) -> i32;
/// Rollback-hook callback.
pub type RollbackCallback = unsafe extern "C" fn(*mut c_void);
/// Update-hook callback: `(context, op, db_name, table, rowid)`.
pub type UpdateCallback = unsafe extern "C" fn(*mut c_void, i32, *const c_char, *const c_char, i64);
/// Authorizer callback: `(context, action, arg1, arg2, db_name, trigger_or_view) -> verdict`.
pub type AuthorizerCallback = unsafe extern "C" fn(
    *mut c_void,
    i32,
    *const c_char,
    *const c_char,
    *const c_char,
    *const c_char,
) -> i32;
/// Collation compare callback: `(context, lhs_len, lhs, rhs_len, rhs) -> ordering`.
pub type CompareCallback =
    unsafe extern "C" fn(*mut c_void, i32, *const c_void, i32, *const c_void) -> i32;
/// `SQLITE_CONFIG_LOG` callback: `(context, code, message)`.
pub type LogCallback = unsafe extern "C" fn(*mut c_void, i32, *const c_char);

/// Core engine entry points the bridge is built on.
///
/// The binding layer reaches the native engine exclusively through this
/// trait; the engine itself stays an opaque capability set.
///
/// # Safety
/// Every method forwards raw pointers to the engine; implementors uphold its ABI.
#[allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
pub unsafe trait Sqlite3Api: Send + Sync + 'static {
    /// Opaque connection object (`sqlite3`).
    type Db;
    /// Opaque prepared statement (`sqlite3_stmt`).
    type Stmt;
    /// Opaque protected or unprotected value (`sqlite3_value`).
    type Value;
    /// Opaque function-call context (`sqlite3_context`).
    type Context;

    /// Version of the loaded engine.
    fn api_version(&self) -> ApiVersion;
    /// Optional entry points found when the backend loaded.
    fn feature_set(&self) -> FeatureSet;
    /// `sqlite3_threadsafe()`; 0 means the engine was built without mutexes.
    fn threadsafe(&self) -> i32 {
        0
    }

    /// Select the engine threading mode. Valid only before initialization.
    unsafe fn config_threading(&self, _mode: ThreadingMode) -> Result<()> {
        Err(Error::feature_unavailable("sqlite3_config unsupported"))
    }
    /// Install or clear the process-wide error log callback.
    unsafe fn config_log(
        &self,
        _callback: Option<LogCallback>,
        _context: *mut c_void,
    ) -> Result<()> {
        Err(Error::feature_unavailable("SQLITE_CONFIG_LOG unsupported"))
    }
    /// Initialize the engine (idempotent).
    unsafe fn initialize(&self) -> Result<()> {
        Ok(())
    }
    /// Tear down process-wide engine state.
    unsafe fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// `sqlite3_open_v2`; on failure the half-open handle is already closed.
    unsafe fn open(&self, filename: &str, options: OpenOptions<'_>) -> Result<NonNull<Self::Db>>;
    /// Close `db`; a busy connection stays open and reports `SQLITE_BUSY`.
    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()>;

    /// Prepare UTF-8 SQL using `prepare_v2` behavior.
    unsafe fn prepare_v2(&self, db: NonNull<Self::Db>, sql: &[u8]) -> Result<Prepared<Self::Stmt>>;
    /// Prepare UTF-8 SQL with `prepare_v3` flags.
    unsafe fn prepare_v3(
        &self,
        _db: NonNull<Self::Db>,
        _sql: &[u8],
        _flags: u32,
    ) -> Result<Prepared<Self::Stmt>> {
        Err(Error::feature_unavailable("prepare_v3 unsupported"))
    }

    /// Advance to the next row.
    unsafe fn step(&self, stmt: NonNull<Self::Stmt>) -> Result<StepResult>;
    unsafe fn reset(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;
    /// Reset every bound parameter to NULL.
    unsafe fn clear_bindings(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;
    /// Destroy `stmt`; reports the error of its most recent step.
    unsafe fn finalize(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;

    /// Parameter indices are 1-based throughout.
    unsafe fn bind_null(&self, stmt: NonNull<Self::Stmt>, idx: i32) -> Result<()>;
    unsafe fn bind_int64(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i64) -> Result<()>;
    unsafe fn bind_double(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: f64) -> Result<()>;
    /// Bind UTF-8 text bytes; `v.len()` is the explicit byte length.
    ///
    /// `v` is borrowed for the call only; the engine must take a copy.
    unsafe fn bind_text(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()>;
    /// Bind native-endian UTF-16 text bytes; `v.len()` is the explicit byte length.
    unsafe fn bind_text16(&self, _stmt: NonNull<Self::Stmt>, _idx: i32, _v: &[u8]) -> Result<()> {
        Err(Error::feature_unavailable("bind_text16 unsupported"))
    }
    /// Blob payload; copied by the engine.
    ///
    /// `v` is borrowed for the call only; the engine must take a copy.
    unsafe fn bind_blob(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()>;
    /// Bind a blob of `n` zero bytes.
    unsafe fn bind_zeroblob(&self, stmt: NonNull<Self::Stmt>, idx: i32, n: i32) -> Result<()> {
        unsafe { self.bind_blob(stmt, idx, &vec![0_u8; n.max(0) as usize]) }
    }
    /// Bind an opaque pointer under `tag`; `destroy` runs once the engine drops it.
    ///
    /// If binding fails the provider must still invoke `destroy` exactly once.
    unsafe fn bind_pointer(
        &self,
        _stmt: NonNull<Self::Stmt>,
        _idx: i32,
        ptr: *mut c_void,
        _tag: &'static CStr,
        destroy: Option<DestroyCallback>,
    ) -> Result<()> {
        if let Some(destroy) = destroy {
            unsafe { destroy(ptr) };
        }
        Err(Error::feature_unavailable("bind_pointer unsupported"))
    }
    /// Number of SQL parameters in the statement.
    unsafe fn bind_parameter_count(&self, stmt: NonNull<Self::Stmt>) -> i32;
    /// Index of a named parameter, or 0 when absent.
    unsafe fn bind_parameter_index(&self, stmt: NonNull<Self::Stmt>, name: &str) -> i32;

    unsafe fn column_count(&self, stmt: NonNull<Self::Stmt>) -> i32;
    /// Column accessors read the row produced by the last `step`.
    unsafe fn column_type(&self, stmt: NonNull<Self::Stmt>, col: i32) -> ValueType;
    unsafe fn column_int64(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i64;
    unsafe fn column_double(&self, stmt: NonNull<Self::Stmt>, col: i32) -> f64;
    /// UTF-8 text bytes for `col` in the current row snapshot.
    unsafe fn column_text(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    /// Native-endian UTF-16 text bytes for `col` in the current row snapshot.
    unsafe fn column_text16(&self, _stmt: NonNull<Self::Stmt>, _col: i32) -> Option<RawBytes> {
        None
    }
    unsafe fn column_blob(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    /// Output column name for `col`.
    unsafe fn column_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes>;

    unsafe fn errcode(&self, db: NonNull<Self::Db>) -> i32;
    /// Engine-owned, NUL-terminated UTF-8 message; valid until the next call on `db`.
    unsafe fn errmsg(&self, db: NonNull<Self::Db>) -> *const c_char;
    unsafe fn extended_errcode(&self, db: NonNull<Self::Db>) -> Option<i32>;
    /// Rows modified by the most recent statement.
    unsafe fn changes(&self, db: NonNull<Self::Db>) -> i64;
    /// Rowid of the most recent successful insert.
    unsafe fn last_insert_rowid(&self, db: NonNull<Self::Db>) -> i64;
    /// Ask any running statement on `db` to abort at its next checkpoint.
    unsafe fn interrupt(&self, db: NonNull<Self::Db>);

    /// Register, replace, or (with all callbacks `None`) remove a function.
    ///
    /// # Ownership contract
    /// `user_data` and `drop_user_data` belong to the provider from call entry.
    /// `drop_user_data` runs exactly once: when the definition is later
    /// dropped by the engine, or before returning if registration fails.
    unsafe fn create_function_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        user_data: *mut c_void,
        x_func: Option<unsafe extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_step: Option<unsafe extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_final: Option<unsafe extern "C" fn(*mut Self::Context)>,
        drop_user_data: Option<DestroyCallback>,
    ) -> Result<()>;

    /// Register or replace an aggregate window function.
    ///
    /// Follows the ownership contract of [`Sqlite3Api::create_function_v2`];
    /// removal goes through that method with every callback `None`.
    unsafe fn create_window_function(
        &self,
        _db: NonNull<Self::Db>,
        _name: &str,
        _n_args: i32,
        _flags: FunctionFlags,
        user_data: *mut c_void,
        _x_step: Option<unsafe extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        _x_final: Option<unsafe extern "C" fn(*mut Self::Context)>,
        _x_value: Option<unsafe extern "C" fn(*mut Self::Context)>,
        _x_inverse: Option<unsafe extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        drop_user_data: Option<DestroyCallback>,
    ) -> Result<()> {
        if let Some(destroy) = drop_user_data {
            unsafe { destroy(user_data) };
        }
        Err(Error::feature_unavailable("create_window_function unsupported"))
    }

    /// Register, replace, or (with `cmp == None`) remove a UTF-8 collation.
    unsafe fn create_collation_v2(
        &self,
        _db: NonNull<Self::Db>,
        _name: &str,
        _context: *mut c_void,
        _cmp: Option<CompareCallback>,
        _destroy: Option<DestroyCallback>,
    ) -> Result<()> {
        Err(Error::feature_unavailable("create_collation_v2 unsupported"))
    }

    /// Per-group scratch memory; `bytes == 0` only looks it up.
    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void;
    /// Context pointer given at function registration.
    ///
    /// An associated function so trampolines can recover their state before
    /// they have a provider reference.
    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void;

    /// Result setters act on the function call behind `ctx`.
    unsafe fn result_null(&self, ctx: NonNull<Self::Context>);
    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64);
    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64);
    /// UTF-8 result; providers must ensure SQLite copies the buffer.
    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &[u8]);
    /// Native-endian UTF-16 result; providers must ensure SQLite copies the buffer.
    unsafe fn result_text16(&self, ctx: NonNull<Self::Context>, _v: &[u8]) {
        unsafe { self.result_error(ctx, "result_text16 unsupported") }
    }
    /// The engine must copy `v`.
    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]);
    /// Blob of `n` zero bytes.
    unsafe fn result_zeroblob(&self, ctx: NonNull<Self::Context>, n: i32) {
        unsafe { self.result_blob(ctx, &vec![0_u8; n.max(0) as usize]) }
    }
    /// Opaque pointer result under `tag`; `destroy` runs once the engine drops it.
    unsafe fn result_pointer(
        &self,
        ctx: NonNull<Self::Context>,
        ptr: *mut c_void,
        _tag: &'static CStr,
        destroy: Option<DestroyCallback>,
    ) {
        if let Some(destroy) = destroy {
            unsafe { destroy(ptr) };
        }
        unsafe { self.result_null(ctx) }
    }
    /// Fail the call with `msg` and `SQLITE_ERROR`.
    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str);
    /// Override the result code reported for an error result.
    unsafe fn result_error_code(&self, _ctx: NonNull<Self::Context>, _code: i32) {}

    /// Value accessors read function arguments and pre-update values.
    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType;
    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64;
    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64;
    /// UTF-8 text bytes view of a UDF argument value.
    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes;
    /// Native-endian UTF-16 text bytes view of a UDF argument value.
    unsafe fn value_text16(&self, _v: NonNull<Self::Value>) -> Option<RawBytes> {
        None
    }
    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes;
    /// Pointer bound under `tag`, or null.
    unsafe fn value_pointer(&self, _v: NonNull<Self::Value>, _tag: &'static CStr) -> *mut c_void {
        core::ptr::null_mut()
    }
}

/// Backend extension for connection hooks.
///
/// Every registration replaces the previous callback for the same slot at the
/// engine level; passing `None` clears it.
///
/// # Safety
/// The context pointer is owned by the caller and outlives the registration.
/// Providers pass it through untouched.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Sqlite3Hooks: Sqlite3Api {
    /// `mask` is ignored when `callback` is `None`.
    unsafe fn trace_v2(
        &self,
        db: NonNull<Self::Db>,
        mask: u32,
        callback: Option<TraceCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// Invoke `callback` every `n` virtual-machine instructions.
    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        n: i32,
        callback: Option<InterruptCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// Set busy timeout in milliseconds (replaces any busy handler).
    unsafe fn busy_timeout(&self, db: NonNull<Self::Db>, ms: i32) -> Result<()>;
    /// Register or clear a busy handler (replaces any busy timeout).
    unsafe fn busy_handler(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<BusyCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    unsafe fn set_authorizer(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<AuthorizerCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// Register or clear the commit hook.
    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<InterruptCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// Register or clear the rollback hook.
    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// Register or clear the update hook.
    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    /// Register or clear the collation-needed callback.
    unsafe fn collation_needed(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<unsafe extern "C" fn(*mut c_void, *mut Self::Db, i32, *const c_char)>,
        context: *mut c_void,
    ) -> Result<()>;
    /// Register or clear the pre-update hook.
    unsafe fn preupdate_hook(
        &self,
        _db: NonNull<Self::Db>,
        _callback: Option<
            unsafe extern "C" fn(
                *mut c_void,
                *mut Self::Db,
                i32,
                *const c_char,
                *const c_char,
                i64,
                i64,
            ),
        >,
        _context: *mut c_void,
    ) -> Result<()> {
        Err(Error::feature_unavailable("preupdate hook not compiled in"))
    }
    /// Column count of the row being changed (pre-update hook only).
    unsafe fn preupdate_count(&self, _db: NonNull<Self::Db>) -> i32 {
        0
    }
    /// Old value of column `col` (pre-update hook only).
    unsafe fn preupdate_old(
        &self,
        _db: NonNull<Self::Db>,
        _col: i32,
    ) -> Result<NonNull<Self::Value>> {
        Err(Error::feature_unavailable("preupdate hook not compiled in"))
    }
    /// New value of column `col` (pre-update hook only).
    unsafe fn preupdate_new(
        &self,
        _db: NonNull<Self::Db>,
        _col: i32,
    ) -> Result<NonNull<Self::Value>> {
        Err(Error::feature_unavailable("preupdate hook not compiled in"))
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiVersion, FeatureSet, OpenFlags, OpenOptions, ValueType};

    #[test]
    fn api_version_from_libversion_number() {
        assert_eq!(ApiVersion::from_number(3_046_001), ApiVersion::new(3, 46, 1));
    }

    #[test]
    fn flag_sets_combine() {
        let features = FeatureSet::UTF16 | FeatureSet::POINTER_PASSING;
        assert!(features.contains(FeatureSet::UTF16));
        assert!(!features.contains(FeatureSet::PREUPDATE_HOOK));
        assert_eq!((features & FeatureSet::UTF16), FeatureSet::UTF16);
    }

    #[test]
    fn default_open_options_create_read_write() {
        let options = OpenOptions::default();
        assert!(options.flags.contains(OpenFlags::READ_WRITE | OpenFlags::CREATE));
        assert!(options.vfs.is_none());
    }

    #[test]
    fn value_type_codes_round_trip() {
        for ty in [
            ValueType::Null,
            ValueType::Integer,
            ValueType::Float,
            ValueType::Text,
            ValueType::Blob,
        ] {
            assert_eq!(ValueType::from_code(ty.to_code()), ty);
        }
    }
}
