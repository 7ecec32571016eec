use super::*;

use sqlite_bridge::Sqlite3Hooks;

fn missing(name: &'static str) -> Error {
    Error::feature_unavailable(name)
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Hooks for LibSqlite3 {
    unsafe fn trace_v2(
        &self,
        db: NonNull<Self::Db>,
        mask: u32,
        callback: Option<TraceCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let trace = self.fns.trace_v2.ok_or_else(|| missing("trace_v2 not available"))?;
        let mask = if callback.is_some() { mask } else { 0 };
        self.check(trace(db.as_ptr(), mask, callback, context), Some(db))
    }

    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        n: i32,
        callback: Option<InterruptCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let progress = self
            .fns
            .progress_handler
            .ok_or_else(|| missing("progress_handler not available"))?;
        progress(db.as_ptr(), n, callback, context);
        Ok(())
    }

    unsafe fn busy_timeout(&self, db: NonNull<Self::Db>, ms: i32) -> Result<()> {
        let timeout = self.fns.busy_timeout.ok_or_else(|| missing("busy_timeout not available"))?;
        self.check(timeout(db.as_ptr(), ms), Some(db))
    }

    unsafe fn busy_handler(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<BusyCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let busy = self.fns.busy_handler.ok_or_else(|| missing("busy_handler not available"))?;
        self.check(busy(db.as_ptr(), callback, context), Some(db))
    }

    unsafe fn set_authorizer(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<AuthorizerCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let authorizer = self
            .fns
            .set_authorizer
            .ok_or_else(|| missing("set_authorizer not available"))?;
        self.check(authorizer(db.as_ptr(), callback, context), Some(db))
    }

    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<InterruptCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let hook = self.fns.commit_hook.ok_or_else(|| missing("commit_hook not available"))?;
        // The previous context is owned by the caller's registry.
        let _previous = hook(db.as_ptr(), callback, context);
        Ok(())
    }

    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let hook = self.fns.rollback_hook.ok_or_else(|| missing("rollback_hook not available"))?;
        let _previous = hook(db.as_ptr(), callback, context);
        Ok(())
    }

    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let hook = self.fns.update_hook.ok_or_else(|| missing("update_hook not available"))?;
        let _previous = hook(db.as_ptr(), callback, context);
        Ok(())
    }

    unsafe fn collation_needed(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<CollationNeededCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let needed = self
            .fns
            .collation_needed
            .ok_or_else(|| missing("collation_needed not available"))?;
        self.check(needed(db.as_ptr(), context, callback), Some(db))
    }

    unsafe fn preupdate_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<PreUpdateCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let hook = self
            .fns
            .preupdate_hook
            .ok_or_else(|| missing("preupdate hook not compiled in"))?;
        let _previous = hook(db.as_ptr(), callback, context);
        Ok(())
    }

    unsafe fn preupdate_count(&self, db: NonNull<Self::Db>) -> i32 {
        match self.fns.preupdate_count {
            Some(count) => count(db.as_ptr()),
            None => 0,
        }
    }

    unsafe fn preupdate_old(
        &self,
        db: NonNull<Self::Db>,
        col: i32,
    ) -> Result<NonNull<Self::Value>> {
        let old = self
            .fns
            .preupdate_old
            .ok_or_else(|| missing("preupdate hook not compiled in"))?;
        self.preupdate_value(old, db, col)
    }

    unsafe fn preupdate_new(
        &self,
        db: NonNull<Self::Db>,
        col: i32,
    ) -> Result<NonNull<Self::Value>> {
        let new = self
            .fns
            .preupdate_new
            .ok_or_else(|| missing("preupdate hook not compiled in"))?;
        self.preupdate_value(new, db, col)
    }
}

impl LibSqlite3 {
    unsafe fn preupdate_value(
        &self,
        read: PreUpdateValue,
        db: NonNull<sqlite3>,
        col: i32,
    ) -> Result<NonNull<sqlite3_value>> {
        let mut value = null_mut();
        let rc = unsafe { read(db.as_ptr(), col, &mut value) };
        self.check(rc, Some(db))?;
        NonNull::new(value)
            .ok_or_else(|| Error::with_message(ErrorCode::Range, "no value for column"))
    }
}
