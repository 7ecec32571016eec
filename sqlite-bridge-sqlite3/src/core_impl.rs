use super::*;

use sqlite_bridge::{
    LogCallback, OpenOptions, Prepared, Sqlite3Api, StepResult, ThreadingMode, ValueType,
};

fn drop_registration_user_data(user_data: *mut c_void, drop_user_data: Option<DestroyCallback>) {
    if let Some(drop_user_data) = drop_user_data {
        unsafe { drop_user_data(user_data) };
    }
}

fn registration_name_or_drop(
    name: &str,
    user_data: *mut c_void,
    drop_user_data: Option<DestroyCallback>,
    error_message: &'static str,
) -> Result<CString> {
    match CString::new(name) {
        Ok(name) => Ok(name),
        Err(_) => {
            drop_registration_user_data(user_data, drop_user_data);
            Err(Error::with_message(ErrorCode::Misuse, error_message))
        }
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
impl LibSqlite3 {
    unsafe fn prepare_with(
        &self,
        db: NonNull<sqlite3>,
        sql: &[u8],
        flags: Option<u32>,
    ) -> Result<Prepared<sqlite3_stmt>> {
        let mut stmt = null_mut();
        let mut tail = null();
        let sql_ptr = sql.as_ptr() as *const c_char;
        let sql_len = clamp_len(sql.len());
        let rc = match (flags, self.fns.prepare_v3) {
            (Some(flags), Some(prepare)) => {
                prepare(db.as_ptr(), sql_ptr, sql_len, flags, &mut stmt, &mut tail)
            }
            (Some(_), None) => return Err(Error::feature_unavailable("prepare_v3 not available")),
            (None, _) => (self.fns.prepare_v2)(db.as_ptr(), sql_ptr, sql_len, &mut stmt, &mut tail),
        };
        if rc != SQLITE_OK {
            return Err(self.error_from_rc(rc, Some(db)));
        }
        let tail = if tail.is_null() {
            sql.len()
        } else {
            (tail as usize).saturating_sub(sql_ptr as usize).min(sql.len())
        };
        Ok(Prepared {
            stmt: NonNull::new(stmt),
            tail,
        })
    }

    unsafe fn bind_bytes(
        &self,
        bind: BindBytes,
        stmt: NonNull<sqlite3_stmt>,
        idx: i32,
        v: &[u8],
    ) -> Result<()> {
        let (ptr, dtor) = self.alloc_copy(v)?;
        // SQLite runs `dtor` itself when the bind fails.
        let rc = bind(stmt.as_ptr(), idx, ptr, clamp_len(v.len()), dtor);
        self.check(rc, self.stmt_db(stmt))
    }

    unsafe fn result_bytes(&self, result: ResultBytes, ctx: NonNull<sqlite3_context>, v: &[u8]) {
        match self.alloc_copy(v) {
            Ok((ptr, dtor)) => result(ctx.as_ptr(), ptr, clamp_len(v.len()), dtor),
            Err(err) => {
                let msg = err.to_string();
                let len = clamp_len(msg.len());
                (self.fns.result_error)(ctx.as_ptr(), msg.as_ptr() as *const c_char, len);
            }
        }
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Api for LibSqlite3 {
    type Db = sqlite3;
    type Stmt = sqlite3_stmt;
    type Value = sqlite3_value;
    type Context = sqlite3_context;

    fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    fn threadsafe(&self) -> i32 {
        unsafe { (self.fns.threadsafe)() }
    }

    unsafe fn config_threading(&self, mode: ThreadingMode) -> Result<()> {
        let config = match self.fns.config {
            Some(config) => config,
            None => return Err(Error::feature_unavailable("sqlite3_config not available")),
        };
        let op = match mode {
            ThreadingMode::SingleThread => SQLITE_CONFIG_SINGLETHREAD,
            ThreadingMode::MultiThread => SQLITE_CONFIG_MULTITHREAD,
            ThreadingMode::Serialized => SQLITE_CONFIG_SERIALIZED,
        };
        self.check(config(op), None)
    }

    unsafe fn config_log(&self, callback: Option<LogCallback>, context: *mut c_void) -> Result<()> {
        let config = match self.fns.config {
            Some(config) => config,
            None => return Err(Error::feature_unavailable("sqlite3_config not available")),
        };
        let callback = match callback {
            Some(callback) => callback as *const () as *mut c_void,
            None => null_mut(),
        };
        self.check(config(SQLITE_CONFIG_LOG, callback, context), None)
    }

    unsafe fn initialize(&self) -> Result<()> {
        self.check((self.fns.initialize)(), None)
    }

    unsafe fn shutdown(&self) -> Result<()> {
        self.check((self.fns.shutdown)(), None)
    }

    unsafe fn open(&self, filename: &str, options: OpenOptions<'_>) -> Result<NonNull<Self::Db>> {
        let misuse = |msg: &'static str| Error::with_message(ErrorCode::Misuse, msg);
        let filename = CString::new(filename).map_err(|_| misuse("filename contains NUL"))?;
        let vfs = match options.vfs {
            Some(vfs) => Some(CString::new(vfs).map_err(|_| misuse("vfs contains NUL"))?),
            None => None,
        };
        let mut db = null_mut();
        let flags = map_open_flags(options.flags);
        let vfs_ptr = vfs.as_ref().map(|s| s.as_ptr()).unwrap_or(null());
        let rc = (self.fns.open_v2)(filename.as_ptr(), &mut db, flags, vfs_ptr);
        if rc != SQLITE_OK {
            let err = self.error_from_rc(rc, NonNull::new(db));
            if !db.is_null() {
                let _ = (self.fns.close)(db);
            }
            return Err(err);
        }
        NonNull::new(db).ok_or_else(|| Error::new(ErrorCode::NoMem))
    }

    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()> {
        let rc = (self.fns.close)(db.as_ptr());
        self.check(rc, Some(db))
    }

    unsafe fn prepare_v2(&self, db: NonNull<Self::Db>, sql: &[u8]) -> Result<Prepared<Self::Stmt>> {
        self.prepare_with(db, sql, None)
    }

    unsafe fn prepare_v3(
        &self,
        db: NonNull<Self::Db>,
        sql: &[u8],
        flags: u32,
    ) -> Result<Prepared<Self::Stmt>> {
        self.prepare_with(db, sql, Some(flags))
    }

    unsafe fn step(&self, stmt: NonNull<Self::Stmt>) -> Result<StepResult> {
        match (self.fns.step)(stmt.as_ptr()) {
            SQLITE_ROW => Ok(StepResult::Row),
            SQLITE_DONE => Ok(StepResult::Done),
            rc => Err(self.error_from_rc(rc, self.stmt_db(stmt))),
        }
    }

    unsafe fn reset(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        let rc = (self.fns.reset)(stmt.as_ptr());
        self.check(rc, self.stmt_db(stmt))
    }

    unsafe fn clear_bindings(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        self.check((self.fns.clear_bindings)(stmt.as_ptr()), None)
    }

    unsafe fn finalize(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        let db = self.stmt_db(stmt);
        let rc = (self.fns.finalize)(stmt.as_ptr());
        self.check(rc, db)
    }

    unsafe fn bind_null(&self, stmt: NonNull<Self::Stmt>, idx: i32) -> Result<()> {
        let rc = (self.fns.bind_null)(stmt.as_ptr(), idx);
        self.check(rc, self.stmt_db(stmt))
    }

    unsafe fn bind_int64(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i64) -> Result<()> {
        let rc = (self.fns.bind_int64)(stmt.as_ptr(), idx, v);
        self.check(rc, self.stmt_db(stmt))
    }

    unsafe fn bind_double(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: f64) -> Result<()> {
        let rc = (self.fns.bind_double)(stmt.as_ptr(), idx, v);
        self.check(rc, self.stmt_db(stmt))
    }

    unsafe fn bind_text(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()> {
        self.bind_bytes(self.fns.bind_text, stmt, idx, v)
    }

    unsafe fn bind_text16(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()> {
        match self.fns.bind_text16 {
            Some(bind) => self.bind_bytes(bind, stmt, idx, v),
            None => Err(Error::feature_unavailable("bind_text16 not available")),
        }
    }

    unsafe fn bind_blob(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()> {
        self.bind_bytes(self.fns.bind_blob, stmt, idx, v)
    }

    unsafe fn bind_zeroblob(&self, stmt: NonNull<Self::Stmt>, idx: i32, n: i32) -> Result<()> {
        let rc = (self.fns.bind_zeroblob)(stmt.as_ptr(), idx, n);
        self.check(rc, self.stmt_db(stmt))
    }

    unsafe fn bind_pointer(
        &self,
        stmt: NonNull<Self::Stmt>,
        idx: i32,
        ptr: *mut c_void,
        tag: &'static CStr,
        destroy: Option<DestroyCallback>,
    ) -> Result<()> {
        let Some(bind) = self.fns.bind_pointer else {
            drop_registration_user_data(ptr, destroy);
            return Err(Error::feature_unavailable("bind_pointer not available"));
        };
        let rc = bind(stmt.as_ptr(), idx, ptr, tag.as_ptr(), destroy);
        self.check(rc, self.stmt_db(stmt))
    }

    unsafe fn bind_parameter_count(&self, stmt: NonNull<Self::Stmt>) -> i32 {
        (self.fns.bind_parameter_count)(stmt.as_ptr())
    }

    unsafe fn bind_parameter_index(&self, stmt: NonNull<Self::Stmt>, name: &str) -> i32 {
        match CString::new(name) {
            Ok(name) => (self.fns.bind_parameter_index)(stmt.as_ptr(), name.as_ptr()),
            Err(_) => 0,
        }
    }

    unsafe fn column_count(&self, stmt: NonNull<Self::Stmt>) -> i32 {
        (self.fns.column_count)(stmt.as_ptr())
    }

    unsafe fn column_type(&self, stmt: NonNull<Self::Stmt>, col: i32) -> ValueType {
        ValueType::from_code((self.fns.column_type)(stmt.as_ptr(), col))
    }

    unsafe fn column_int64(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i64 {
        (self.fns.column_int64)(stmt.as_ptr(), col)
    }

    unsafe fn column_double(&self, stmt: NonNull<Self::Stmt>, col: i32) -> f64 {
        (self.fns.column_double)(stmt.as_ptr(), col)
    }

    unsafe fn column_text(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        // The pointer must be fetched before the length.
        let ptr = (self.fns.column_text)(stmt.as_ptr(), col) as *const c_void;
        raw_bytes(ptr, (self.fns.column_bytes)(stmt.as_ptr(), col))
    }

    unsafe fn column_text16(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes> {
        let (text16, bytes16) = (self.fns.column_text16?, self.fns.column_bytes16?);
        let ptr = text16(stmt.as_ptr(), col);
        Some(raw_bytes(ptr, bytes16(stmt.as_ptr(), col)))
    }

    unsafe fn column_blob(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        let ptr = (self.fns.column_blob)(stmt.as_ptr(), col);
        raw_bytes(ptr, (self.fns.column_bytes)(stmt.as_ptr(), col))
    }

    unsafe fn column_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> Option<RawBytes> {
        let ptr = (self.fns.column_name)(stmt.as_ptr(), col);
        raw_cstr(ptr).map(raw_bytes_from_cstr)
    }

    unsafe fn errcode(&self, db: NonNull<Self::Db>) -> i32 {
        (self.fns.errcode)(db.as_ptr())
    }

    unsafe fn errmsg(&self, db: NonNull<Self::Db>) -> *const c_char {
        (self.fns.errmsg)(db.as_ptr())
    }

    unsafe fn extended_errcode(&self, db: NonNull<Self::Db>) -> Option<i32> {
        self.fns.extended_errcode.map(|f| f(db.as_ptr()))
    }

    unsafe fn changes(&self, db: NonNull<Self::Db>) -> i64 {
        match self.fns.changes64 {
            Some(changes64) => changes64(db.as_ptr()),
            None => i64::from((self.fns.changes)(db.as_ptr())),
        }
    }

    unsafe fn last_insert_rowid(&self, db: NonNull<Self::Db>) -> i64 {
        (self.fns.last_insert_rowid)(db.as_ptr())
    }

    unsafe fn interrupt(&self, db: NonNull<Self::Db>) {
        (self.fns.interrupt)(db.as_ptr())
    }

    unsafe fn create_function_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        user_data: *mut c_void,
        x_func: Option<ScalarCallback>,
        x_step: Option<ScalarCallback>,
        x_final: Option<FinalCallback>,
        drop_user_data: Option<DestroyCallback>,
    ) -> Result<()> {
        let name = registration_name_or_drop(
            name,
            user_data,
            drop_user_data,
            "function name contains NUL",
        )?;
        let rc = (self.fns.create_function_v2)(
            db.as_ptr(),
            name.as_ptr(),
            n_args,
            map_function_flags(flags),
            user_data,
            x_func,
            x_step,
            x_final,
            drop_user_data,
        );
        self.check(rc, Some(db))
    }

    unsafe fn create_window_function(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        user_data: *mut c_void,
        x_step: Option<ScalarCallback>,
        x_final: Option<FinalCallback>,
        x_value: Option<FinalCallback>,
        x_inverse: Option<ScalarCallback>,
        drop_user_data: Option<DestroyCallback>,
    ) -> Result<()> {
        let Some(create) = self.fns.create_window_function else {
            drop_registration_user_data(user_data, drop_user_data);
            return Err(Error::feature_unavailable("create_window_function not available"));
        };
        let name = registration_name_or_drop(
            name,
            user_data,
            drop_user_data,
            "function name contains NUL",
        )?;
        let rc = create(
            db.as_ptr(),
            name.as_ptr(),
            n_args,
            map_function_flags(flags),
            user_data,
            x_step,
            x_final,
            x_value,
            x_inverse,
            drop_user_data,
        );
        self.check(rc, Some(db))
    }

    unsafe fn create_collation_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        context: *mut c_void,
        cmp: Option<CompareCallback>,
        destroy: Option<DestroyCallback>,
    ) -> Result<()> {
        let Some(create) = self.fns.create_collation_v2 else {
            drop_registration_user_data(context, destroy);
            return Err(Error::feature_unavailable("create_collation_v2 not available"));
        };
        let name =
            registration_name_or_drop(name, context, destroy, "collation name contains NUL")?;
        let rc = create(db.as_ptr(), name.as_ptr(), SQLITE_UTF8, context, cmp, destroy);
        self.check(rc, Some(db))
    }

    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void {
        (self.fns.aggregate_context)(ctx.as_ptr(), clamp_len(bytes))
    }

    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void {
        match USER_DATA_FN.get() {
            Some(f) => f(ctx.as_ptr()),
            None => null_mut(),
        }
    }

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>) {
        (self.fns.result_null)(ctx.as_ptr());
    }

    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64) {
        (self.fns.result_int64)(ctx.as_ptr(), v);
    }

    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64) {
        (self.fns.result_double)(ctx.as_ptr(), v);
    }

    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        self.result_bytes(self.fns.result_text, ctx, v)
    }

    unsafe fn result_text16(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        match self.fns.result_text16 {
            Some(result) => self.result_bytes(result, ctx, v),
            None => self.result_error(ctx, "result_text16 not available"),
        }
    }

    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        self.result_bytes(self.fns.result_blob, ctx, v)
    }

    unsafe fn result_zeroblob(&self, ctx: NonNull<Self::Context>, n: i32) {
        match self.fns.result_zeroblob {
            Some(result) => result(ctx.as_ptr(), n),
            None => self.result_blob(ctx, &vec![0_u8; n.max(0) as usize]),
        }
    }

    unsafe fn result_pointer(
        &self,
        ctx: NonNull<Self::Context>,
        ptr: *mut c_void,
        tag: &'static CStr,
        destroy: Option<DestroyCallback>,
    ) {
        match self.fns.result_pointer {
            Some(result) => result(ctx.as_ptr(), ptr, tag.as_ptr(), destroy),
            None => {
                drop_registration_user_data(ptr, destroy);
                self.result_null(ctx);
            }
        }
    }

    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str) {
        (self.fns.result_error)(ctx.as_ptr(), msg.as_ptr() as *const c_char, clamp_len(msg.len()));
    }

    unsafe fn result_error_code(&self, ctx: NonNull<Self::Context>, code: i32) {
        if let Some(result) = self.fns.result_error_code {
            result(ctx.as_ptr(), code);
        }
    }

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType {
        ValueType::from_code((self.fns.value_type)(v.as_ptr()))
    }

    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64 {
        (self.fns.value_int64)(v.as_ptr())
    }

    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64 {
        (self.fns.value_double)(v.as_ptr())
    }

    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_text)(v.as_ptr());
        raw_bytes(ptr, (self.fns.value_bytes)(v.as_ptr()))
    }

    unsafe fn value_text16(&self, v: NonNull<Self::Value>) -> Option<RawBytes> {
        let (text16, bytes16) = (self.fns.value_text16?, self.fns.value_bytes16?);
        let ptr = text16(v.as_ptr());
        Some(raw_bytes(ptr, bytes16(v.as_ptr())))
    }

    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_blob)(v.as_ptr());
        raw_bytes(ptr, (self.fns.value_bytes)(v.as_ptr()))
    }

    unsafe fn value_pointer(&self, v: NonNull<Self::Value>, tag: &'static CStr) -> *mut c_void {
        match self.fns.value_pointer {
            Some(pointer) => pointer(v.as_ptr(), tag.as_ptr()),
            None => null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{drop_registration_user_data, registration_name_or_drop};
    use sqlite_bridge::ErrorCode;
    use std::ffi::c_void;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DROP_CALLS: AtomicUsize = AtomicUsize::new(0);
    static DROP_TEST_LOCK: Mutex<()> = Mutex::new(());

    unsafe extern "C" fn drop_counting_box(ptr: *mut c_void) {
        DROP_CALLS.fetch_add(1, Ordering::SeqCst);
        if !ptr.is_null() {
            unsafe { drop(Box::from_raw(ptr as *mut usize)) };
        }
    }

    #[test]
    fn interior_nul_name_releases_user_data() {
        let _guard = DROP_TEST_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        DROP_CALLS.store(0, Ordering::SeqCst);
        let user_data = Box::into_raw(Box::new(7usize)) as *mut c_void;
        let result = registration_name_or_drop(
            "bad\0name",
            user_data,
            Some(drop_counting_box),
            "function name contains NUL",
        );
        let err = result.expect_err("interior NUL should fail");
        assert_eq!(err.code, ErrorCode::Misuse);
        assert_eq!(DROP_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn valid_name_keeps_user_data() {
        let _guard = DROP_TEST_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        DROP_CALLS.store(0, Ordering::SeqCst);
        let user_data = Box::into_raw(Box::new(9usize)) as *mut c_void;
        let msg = "function name contains NUL";
        let name = registration_name_or_drop("half", user_data, Some(drop_counting_box), msg)
            .expect("valid name should pass");
        assert_eq!(name.to_str().expect("ascii"), "half");
        assert_eq!(DROP_CALLS.load(Ordering::SeqCst), 0);
        drop_registration_user_data(user_data, Some(drop_counting_box));
        assert_eq!(DROP_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_destructor_is_noop() {
        let _guard = DROP_TEST_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        drop_registration_user_data(std::ptr::null_mut(), None);
    }
}
