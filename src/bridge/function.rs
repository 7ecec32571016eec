use core::ffi::c_void;
use core::ptr::NonNull;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::warn;

use crate::encoding::{self, Encoding};
use crate::error::codes::{SQLITE_ERROR, SQLITE_NOMEM, SQLITE_OK};
use crate::error::{Error, Result};
use crate::handle::{ContextHandle, DbHandle, ValueHandle};
use crate::provider::{HOST_OBJECT_TAG, Sqlite3Hooks, ValueType};
use crate::registry::{AggregateState, Handler, SlotCell, invoke, panic_message};
use crate::thread::CallFrame;
use crate::value::{HostObject, Value, ValueRef};

use super::Bridge;
use super::core::copy_text;

/// One invocation of a user-defined function.
///
/// The context and argument handles are valid on the calling thread until
/// the handler returns.
pub struct FunctionCall<'a, P: Sqlite3Hooks> {
    bridge: &'a Bridge<P>,
    db: DbHandle,
    context: ContextHandle,
    args: &'a [ValueHandle],
}

impl<'a, P: Sqlite3Hooks> FunctionCall<'a, P> {
    pub fn bridge(&self) -> &'a Bridge<P> {
        self.bridge
    }

    /// Connection the function was registered on.
    pub fn db(&self) -> DbHandle {
        self.db
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn args(&self) -> &'a [ValueHandle] {
        self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Owned copy of argument `i`; `Null` when out of range.
    pub fn arg(&self, i: usize) -> Value {
        match self.args.get(i) {
            Some(handle) => self.bridge.value(*handle),
            None => Value::Null,
        }
    }

    pub fn arg_i64(&self, i: usize) -> i64 {
        self.args.get(i).map(|h| self.bridge.value_int64(*h)).unwrap_or(0)
    }

    pub fn arg_f64(&self, i: usize) -> f64 {
        self.args.get(i).map(|h| self.bridge.value_double(*h)).unwrap_or(0.0)
    }

    pub fn arg_text(&self, i: usize) -> Option<String> {
        self.args.get(i).and_then(|h| self.bridge.value_text(*h))
    }

    /// Host object passed as argument `i`, if it carries one.
    pub fn arg_object(&self, i: usize) -> Option<HostObject> {
        self.args.get(i).and_then(|h| self.bridge.value_object(*h))
    }
}

/// Heap copy of `object` handed to the engine under [`HOST_OBJECT_TAG`].
pub(crate) fn into_host_object_ptr(object: &HostObject) -> *mut c_void {
    Box::into_raw(Box::new(object.clone())) as *mut c_void
}

/// Destructor the engine calls once it drops a host object pointer.
pub(crate) unsafe extern "C" fn drop_host_object(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let ptr = ptr as *mut HostObject;
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| drop(unsafe { Box::from_raw(ptr) }))) {
        warn!(panic = %panic_message(payload.as_ref()), "host object drop panicked");
    }
}

unsafe fn raw_args<P: Sqlite3Hooks>(argc: i32, argv: *mut *mut P::Value) -> Vec<usize> {
    if argv.is_null() || argc <= 0 {
        return Vec::new();
    }
    let slice = unsafe { core::slice::from_raw_parts(argv, argc as usize) };
    slice.iter().map(|value| *value as usize).collect()
}

unsafe fn cell_for<P: Sqlite3Hooks>(
    ctx: NonNull<P::Context>,
) -> Option<std::sync::Arc<SlotCell<P>>> {
    unsafe { SlotCell::<P>::from_context(P::user_data(ctx)) }
}

/// What a handler left behind for the engine.
enum Outcome {
    Value(Value, bool),
    Failed(Error),
    Unregistered,
}

impl Outcome {
    fn from_invoke(outcome: Option<Result<(Value, bool)>>) -> Self {
        match outcome {
            Some(Ok((value, explicit))) => Outcome::Value(value, explicit),
            Some(Err(err)) => Outcome::Failed(err),
            None => Outcome::Unregistered,
        }
    }
}

pub(crate) unsafe extern "C" fn scalar_trampoline<P: Sqlite3Hooks>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
) {
    let Some(ctx) = NonNull::new(ctx) else { return };
    let Some(cell) = (unsafe { cell_for::<P>(ctx) }) else { return };
    let Some(bridge) = cell.bridge.upgrade() else { return };
    let args = unsafe { raw_args::<P>(argc, argv) };
    let db = cell.db;
    let outcome = invoke(&cell, |bridge, handler| {
        let Handler::Scalar { callback, .. } = handler else {
            return Err(Error::user("function slot holds a non-scalar handler"));
        };
        let (result, explicit) = bridge.with_frame(db, ctx, &args, |call| callback(call));
        result.map(|value| (value, explicit))
    });
    unsafe { bridge.finish_call(ctx, Outcome::from_invoke(outcome)) };
}

/// Slot inside the engine's aggregate memory that holds the boxed state.
unsafe fn state_slot<P: Sqlite3Hooks>(
    bridge: &Bridge<P>,
    ctx: NonNull<P::Context>,
    alloc: bool,
) -> *mut *mut AggregateState {
    let bytes = if alloc {
        core::mem::size_of::<*mut AggregateState>()
    } else {
        0
    };
    unsafe { bridge.api().aggregate_context(ctx, bytes) as *mut *mut AggregateState }
}

/// Which state-mutating stage a row drives.
#[derive(Clone, Copy)]
enum Stage {
    Step,
    Inverse,
}

unsafe fn accumulate<P: Sqlite3Hooks>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
    stage: Stage,
) {
    let Some(ctx) = NonNull::new(ctx) else { return };
    let Some(cell) = (unsafe { cell_for::<P>(ctx) }) else { return };
    let Some(bridge) = cell.bridge.upgrade() else { return };
    let slot = unsafe { state_slot(&bridge, ctx, true) };
    if slot.is_null() {
        unsafe { bridge.api().result_error_code(ctx, SQLITE_NOMEM) };
        return;
    }
    let args = unsafe { raw_args::<P>(argc, argv) };
    let db = cell.db;
    let outcome = invoke(&cell, |bridge, handler| {
        let Some(callbacks) = handler.aggregate_fns() else {
            return Err(Error::user("function slot holds a non-aggregate handler"));
        };
        let apply = match (stage, handler) {
            (Stage::Step, _) => &callbacks.step,
            (Stage::Inverse, Handler::Window { callbacks, .. }) => &callbacks.inverse,
            (Stage::Inverse, _) => {
                return Err(Error::user("function slot holds a non-window handler"));
            }
        };
        // SAFETY: the engine zero-fills aggregate memory and hands the same
        // block to every stage of one group or window.
        let state = unsafe {
            if (*slot).is_null() {
                *slot = Box::into_raw(Box::new((callbacks.init)()));
            }
            &mut **slot
        };
        let (result, _) = bridge.with_frame(db, ctx, &args, |call| apply(state, call));
        result
    });
    if let Some(Err(err)) = outcome {
        unsafe { bridge.apply_error(ctx, &err) };
    }
}

pub(crate) unsafe extern "C" fn aggregate_step_trampoline<P: Sqlite3Hooks>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
) {
    unsafe { accumulate::<P>(ctx, argc, argv, Stage::Step) }
}

/// Removes the row leaving a window frame from the shared state.
pub(crate) unsafe extern "C" fn window_inverse_trampoline<P: Sqlite3Hooks>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
) {
    unsafe { accumulate::<P>(ctx, argc, argv, Stage::Inverse) }
}

/// Reports the current window result and leaves the state in place.
pub(crate) unsafe extern "C" fn window_value_trampoline<P: Sqlite3Hooks>(ctx: *mut P::Context) {
    let Some(ctx) = NonNull::new(ctx) else { return };
    let Some(cell) = (unsafe { cell_for::<P>(ctx) }) else { return };
    let Some(bridge) = cell.bridge.upgrade() else { return };
    let slot = unsafe { state_slot(&bridge, ctx, false) };
    let current = unsafe {
        if slot.is_null() || (*slot).is_null() {
            None
        } else {
            Some(*slot as *const AggregateState)
        }
    };
    let db = cell.db;
    let outcome = invoke(&cell, |bridge, handler| {
        let Handler::Window { callbacks, .. } = handler else {
            return Err(Error::user("function slot holds a non-window handler"));
        };
        let empty;
        let state = match current {
            Some(ptr) => unsafe { &*ptr },
            None => {
                empty = (callbacks.aggregate.init)();
                &empty
            }
        };
        let (result, explicit) =
            bridge.with_frame(db, ctx, &[], |call| (callbacks.value)(state, call));
        result.map(|value| (value, explicit))
    });
    unsafe { bridge.finish_call(ctx, Outcome::from_invoke(outcome)) };
}

pub(crate) unsafe extern "C" fn aggregate_final_trampoline<P: Sqlite3Hooks>(ctx: *mut P::Context) {
    let Some(ctx) = NonNull::new(ctx) else { return };
    let Some(cell) = (unsafe { cell_for::<P>(ctx) }) else { return };
    let Some(bridge) = cell.bridge.upgrade() else { return };
    let slot = unsafe { state_slot(&bridge, ctx, false) };
    let state = unsafe {
        if slot.is_null() || (*slot).is_null() {
            None
        } else {
            let state = Box::from_raw(*slot);
            *slot = core::ptr::null_mut();
            Some(*state)
        }
    };
    let db = cell.db;
    let outcome = invoke(&cell, |bridge, handler| {
        let Some(callbacks) = handler.aggregate_fns() else {
            return Err(Error::user("function slot holds a non-aggregate handler"));
        };
        let state = match state {
            Some(state) => state,
            None => (callbacks.init)(),
        };
        let (result, explicit) =
            bridge.with_frame(db, ctx, &[], |call| (callbacks.finalize)(state, call));
        result.map(|value| (value, explicit))
    });
    unsafe { bridge.finish_call(ctx, Outcome::from_invoke(outcome)) };
}

impl<P: Sqlite3Hooks> Bridge<P> {
    /// Publish transient handles for one invocation and run `f` with them.
    ///
    /// Returns `f`'s output and whether a result was written explicitly
    /// through the context handle.
    fn with_frame<R>(
        &self,
        db: DbHandle,
        ctx: NonNull<P::Context>,
        argv: &[usize],
        f: impl FnOnce(&FunctionCall<'_, P>) -> R,
    ) -> (R, bool) {
        let frame = CallFrame::new(ctx.as_ptr() as usize, argv.iter().copied());
        let context = frame.context;
        let args: Vec<ValueHandle> = frame.values.iter().map(|(handle, _)| *handle).collect();
        let _frame = self.threads.push_frame(frame);
        let call = FunctionCall {
            bridge: self,
            db,
            context,
            args: &args,
        };
        let output = f(&call);
        (output, self.threads.result_set(context))
    }

    unsafe fn finish_call(&self, ctx: NonNull<P::Context>, outcome: Outcome) {
        match outcome {
            // An explicit result survives a handler that returns NULL.
            Outcome::Value(Value::Null, true) => {}
            Outcome::Value(value, _) => unsafe { self.apply_result(ctx, value.as_value_ref()) },
            Outcome::Failed(err) => unsafe { self.apply_error(ctx, &err) },
            Outcome::Unregistered => unsafe {
                self.api.result_error(ctx, "function is no longer registered")
            },
        }
    }

    unsafe fn apply_result(&self, ctx: NonNull<P::Context>, value: ValueRef<'_>) {
        let api = self.api;
        unsafe {
            match value {
                ValueRef::Null => api.result_null(ctx),
                ValueRef::Integer(v) => api.result_int64(ctx, v),
                ValueRef::Float(v) => api.result_double(ctx, v),
                ValueRef::Text(v) => api.result_text(ctx, v.as_bytes()),
                ValueRef::Blob(v) => api.result_blob(ctx, v),
                ValueRef::ZeroBlob(n) => api.result_zeroblob(ctx, n),
                ValueRef::Object(object) => api.result_pointer(
                    ctx,
                    into_host_object_ptr(object),
                    HOST_OBJECT_TAG,
                    Some(drop_host_object),
                ),
            }
        }
    }

    unsafe fn apply_error(&self, ctx: NonNull<P::Context>, err: &Error) {
        unsafe {
            self.api.result_error(ctx, &err.to_string());
            match err.result_code() {
                SQLITE_ERROR | SQLITE_OK => {}
                code => self.api.result_error_code(ctx, code),
            }
        }
    }

    fn with_context(
        &self,
        ctx: ContextHandle,
        f: impl FnOnce(&'static P, NonNull<P::Context>),
    ) -> i32 {
        self.threads.attach();
        let raw = self
            .threads
            .claim_context(ctx)
            .and_then(|raw| NonNull::new(raw as *mut P::Context));
        match raw {
            Some(raw) => {
                f(self.api, raw);
                SQLITE_OK
            }
            None => self.stale(ctx),
        }
    }

    /// Set the result of the running function.
    pub fn result(&self, ctx: ContextHandle, value: &Value) -> i32 {
        self.with_context(ctx, |_, raw| unsafe { self.apply_result(raw, value.as_value_ref()) })
    }

    pub fn result_null(&self, ctx: ContextHandle) -> i32 {
        self.result(ctx, &Value::Null)
    }

    pub fn result_int(&self, ctx: ContextHandle, v: i32) -> i32 {
        self.result(ctx, &Value::Integer(i64::from(v)))
    }

    pub fn result_int64(&self, ctx: ContextHandle, v: i64) -> i32 {
        self.result(ctx, &Value::Integer(v))
    }

    pub fn result_double(&self, ctx: ContextHandle, v: f64) -> i32 {
        self.result(ctx, &Value::Float(v))
    }

    pub fn result_text(&self, ctx: ContextHandle, v: &str) -> i32 {
        self.with_context(ctx, |api, raw| unsafe { api.result_text(raw, v.as_bytes()) })
    }

    /// UTF-16 text result in native byte order.
    pub fn result_text16(&self, ctx: ContextHandle, v: &str) -> i32 {
        let bytes = encoding::encode(v, Encoding::Utf16);
        self.with_context(ctx, |api, raw| unsafe { api.result_text16(raw, &bytes) })
    }

    pub fn result_blob(&self, ctx: ContextHandle, v: &[u8]) -> i32 {
        self.with_context(ctx, |api, raw| unsafe { api.result_blob(raw, v) })
    }

    pub fn result_zeroblob(&self, ctx: ContextHandle, n: i32) -> i32 {
        self.with_context(ctx, |api, raw| unsafe { api.result_zeroblob(raw, n) })
    }

    pub fn result_object(&self, ctx: ContextHandle, object: HostObject) -> i32 {
        self.result(ctx, &Value::Object(object))
    }

    /// Fail the running function with `msg`.
    pub fn result_error(&self, ctx: ContextHandle, msg: &str) -> i32 {
        self.with_context(ctx, |api, raw| unsafe { api.result_error(raw, msg) })
    }

    pub fn result_error_code(&self, ctx: ContextHandle, code: i32) -> i32 {
        self.with_context(ctx, |api, raw| unsafe { api.result_error_code(raw, code) })
    }

    fn read_arg<T>(
        &self,
        v: ValueHandle,
        default: T,
        f: impl FnOnce(&'static P, NonNull<P::Value>) -> T,
    ) -> T {
        self.threads.attach();
        match self
            .threads
            .resolve_value(v)
            .and_then(|raw| NonNull::new(raw as *mut P::Value))
        {
            Some(raw) => f(self.api, raw),
            None => {
                self.stale(v);
                default
            }
        }
    }

    pub fn value_type(&self, v: ValueHandle) -> ValueType {
        self.read_arg(v, ValueType::Null, |api, raw| unsafe { api.value_type(raw) })
    }

    pub fn value_int(&self, v: ValueHandle) -> i32 {
        self.value_int64(v) as i32
    }

    pub fn value_int64(&self, v: ValueHandle) -> i64 {
        self.read_arg(v, 0, |api, raw| unsafe { api.value_int64(raw) })
    }

    pub fn value_double(&self, v: ValueHandle) -> f64 {
        self.read_arg(v, 0.0, |api, raw| unsafe { api.value_double(raw) })
    }

    pub fn value_text(&self, v: ValueHandle) -> Option<String> {
        self.read_arg(v, None, |api, raw| unsafe { copy_text(api.value_text(raw), Encoding::Utf8) })
    }

    /// Text read through the engine's UTF-16 conversion when available.
    pub fn value_text16(&self, v: ValueHandle) -> Option<String> {
        self.read_arg(v, None, |api, raw| unsafe {
            match api.value_text16(raw) {
                Some(bytes) => copy_text(bytes, Encoding::Utf16),
                None => copy_text(api.value_text(raw), Encoding::Utf8),
            }
        })
    }

    pub fn value_blob(&self, v: ValueHandle) -> Option<Vec<u8>> {
        self.read_arg(v, None, |api, raw| unsafe {
            let bytes = api.value_blob(raw);
            if bytes.ptr.is_null() {
                None
            } else {
                Some(bytes.to_vec())
            }
        })
    }

    pub fn value_object(&self, v: ValueHandle) -> Option<HostObject> {
        self.read_arg(v, None, |api, raw| unsafe { host_object(api, raw) })
    }

    /// Owned copy of an argument value.
    pub fn value(&self, v: ValueHandle) -> Value {
        self.read_arg(v, Value::Null, |_, raw| unsafe { self.read_value(raw) })
    }

    pub(crate) unsafe fn read_value(&self, raw: NonNull<P::Value>) -> Value {
        let api = self.api;
        unsafe {
            match api.value_type(raw) {
                ValueType::Integer => Value::Integer(api.value_int64(raw)),
                ValueType::Float => Value::Float(api.value_double(raw)),
                ValueType::Text => {
                    Value::Text(copy_text(api.value_text(raw), Encoding::Utf8).unwrap_or_default())
                }
                ValueType::Blob => Value::Blob(api.value_blob(raw).to_vec()),
                ValueType::Null => match host_object(api, raw) {
                    Some(object) => Value::Object(object),
                    None => Value::Null,
                },
            }
        }
    }
}

unsafe fn host_object<P: Sqlite3Hooks>(api: &P, raw: NonNull<P::Value>) -> Option<HostObject> {
    let ptr = unsafe { api.value_pointer(raw, HOST_OBJECT_TAG) } as *const HostObject;
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { (*ptr).clone() })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{drop_host_object, into_host_object_ptr};
    use crate::value::HostObject;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn host_object_pointer_keeps_object_alive_until_destroyed() {
        let drops = Arc::new(AtomicUsize::new(0));
        let object = HostObject::new(Tracked(Arc::clone(&drops)));
        let ptr = into_host_object_ptr(&object);
        drop(object);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        unsafe { drop_host_object(ptr) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn null_host_object_pointer_is_ignored() {
        unsafe { drop_host_object(core::ptr::null_mut()) };
    }
}
