use core::any::Any;
use core::cmp::Ordering;
use core::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock, Weak};

use tracing::trace;

use crate::bridge::{
    Authorization, AuthorizerEvent, Bridge, FunctionCall, PreUpdateEvent, TraceEvent, TraceMask,
    UpdateEvent,
};
use crate::encoding::TextRep;
use crate::error::{Error, Result};
use crate::handle::DbHandle;
use crate::provider::{FunctionFlags, Sqlite3Hooks};
use crate::value::Value;

/// Kind of engine callback a handler serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Busy,
    Trace,
    Progress,
    Commit,
    Rollback,
    Update,
    PreUpdate,
    CollationNeeded,
    Authorizer,
    Collation,
    Function,
    /// Process-wide error log.
    Log,
}

impl CallbackKind {
    pub const fn name(self) -> &'static str {
        match self {
            CallbackKind::Busy => "busy",
            CallbackKind::Trace => "trace",
            CallbackKind::Progress => "progress",
            CallbackKind::Commit => "commit",
            CallbackKind::Rollback => "rollback",
            CallbackKind::Update => "update",
            CallbackKind::PreUpdate => "preupdate",
            CallbackKind::CollationNeeded => "collation-needed",
            CallbackKind::Authorizer => "authorizer",
            CallbackKind::Collation => "collation",
            CallbackKind::Function => "function",
            CallbackKind::Log => "log",
        }
    }
}

/// Identity of a callback slot on one connection.
///
/// Hooks occupy one slot each; collations are keyed by name and functions by
/// name and arity. Names are ASCII case-folded the way the engine looks them up.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallbackSlot {
    Busy,
    Trace,
    Progress,
    Commit,
    Rollback,
    Update,
    PreUpdate,
    CollationNeeded,
    Authorizer,
    Collation(String),
    Function { name: String, n_args: i32 },
}

impl CallbackSlot {
    pub fn collation(name: &str) -> Self {
        CallbackSlot::Collation(name.to_ascii_lowercase())
    }

    /// Function slot; `n_args` of -1 accepts any argument count.
    pub fn function(name: &str, n_args: i32) -> Self {
        CallbackSlot::Function {
            name: name.to_ascii_lowercase(),
            n_args,
        }
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            CallbackSlot::Busy => CallbackKind::Busy,
            CallbackSlot::Trace => CallbackKind::Trace,
            CallbackSlot::Progress => CallbackKind::Progress,
            CallbackSlot::Commit => CallbackKind::Commit,
            CallbackSlot::Rollback => CallbackKind::Rollback,
            CallbackSlot::Update => CallbackKind::Update,
            CallbackSlot::PreUpdate => CallbackKind::PreUpdate,
            CallbackSlot::CollationNeeded => CallbackKind::CollationNeeded,
            CallbackSlot::Authorizer => CallbackKind::Authorizer,
            CallbackSlot::Collation(_) => CallbackKind::Collation,
            CallbackSlot::Function { .. } => CallbackKind::Function,
        }
    }
}

impl fmt::Display for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackSlot::Collation(name) => write!(f, "collation {name}"),
            CallbackSlot::Function { name, n_args } => write!(f, "function {name}/{n_args}"),
            other => f.write_str(other.kind().name()),
        }
    }
}

/// Busy handler: receives the number of prior retries, returns whether to retry.
pub type BusyFn = dyn Fn(i32) -> Result<bool> + Send + Sync;
pub type TraceFn = dyn Fn(&TraceEvent) -> Result<()> + Send + Sync;
/// Progress handler: return `true` to interrupt the running statement.
pub type ProgressFn = dyn Fn() -> Result<bool> + Send + Sync;
/// Commit hook: return `true` to turn the commit into a rollback.
pub type CommitFn = dyn Fn() -> Result<bool> + Send + Sync;
pub type RollbackFn = dyn Fn() -> Result<()> + Send + Sync;
pub type UpdateFn = dyn Fn(&UpdateEvent<'_>) -> Result<()> + Send + Sync;
pub type PreUpdateFn<P> = dyn Fn(&PreUpdateEvent<'_, P>) -> Result<()> + Send + Sync;
/// Collation-needed: receives the bridge, the connection, the collation name and
/// the text representation the engine asked for.
pub type CollationNeededFn<P> =
    dyn Fn(&Bridge<P>, DbHandle, &str, TextRep) -> Result<()> + Send + Sync;
pub type AuthorizerFn = dyn Fn(&AuthorizerEvent<'_>) -> Result<Authorization> + Send + Sync;
pub type CollationFn = dyn Fn(&str, &str) -> Ordering + Send + Sync;
pub type ScalarFn<P> = dyn Fn(&FunctionCall<'_, P>) -> Result<Value> + Send + Sync;
/// Process-wide error log callback: `(result_code, message)`.
pub type LogFn = dyn Fn(i32, &str) + Send + Sync;

/// Type-erased aggregate state.
pub type AggregateState = Box<dyn Any + Send>;

/// The three stages of an aggregate function.
pub struct AggregateFns<P: Sqlite3Hooks> {
    pub init: Arc<dyn Fn() -> AggregateState + Send + Sync>,
    pub step: Arc<dyn Fn(&mut AggregateState, &FunctionCall<'_, P>) -> Result<()> + Send + Sync>,
    pub finalize: Arc<dyn Fn(AggregateState, &FunctionCall<'_, P>) -> Result<Value> + Send + Sync>,
}

impl<P: Sqlite3Hooks> Clone for AggregateFns<P> {
    fn clone(&self) -> Self {
        Self {
            init: Arc::clone(&self.init),
            step: Arc::clone(&self.step),
            finalize: Arc::clone(&self.finalize),
        }
    }
}

impl<P: Sqlite3Hooks> AggregateFns<P> {
    /// Build the erased stages from typed closures over state `S`.
    pub fn typed<S, I, St, Fi>(init: I, step: St, finalize: Fi) -> Self
    where
        S: Send + 'static,
        I: Fn() -> S + Send + Sync + 'static,
        St: Fn(&mut S, &FunctionCall<'_, P>) -> Result<()> + Send + Sync + 'static,
        Fi: Fn(S, &FunctionCall<'_, P>) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            init: Arc::new(move || Box::new(init()) as AggregateState),
            step: Arc::new(move |state: &mut AggregateState, call: &FunctionCall<'_, P>| {
                match state.downcast_mut::<S>() {
                    Some(state) => step(state, call),
                    None => Err(Error::user("aggregate state has unexpected type")),
                }
            }),
            finalize: Arc::new(move |state: AggregateState, call: &FunctionCall<'_, P>| {
                match state.downcast::<S>() {
                    Ok(state) => finalize(*state, call),
                    Err(_) => Err(Error::user("aggregate state has unexpected type")),
                }
            }),
        }
    }
}

/// An aggregate that can also slide its frame: `inverse` removes the oldest
/// row and `value` reports the current result without consuming the state.
pub struct WindowFns<P: Sqlite3Hooks> {
    pub aggregate: AggregateFns<P>,
    pub inverse: Arc<dyn Fn(&mut AggregateState, &FunctionCall<'_, P>) -> Result<()> + Send + Sync>,
    pub value: Arc<dyn Fn(&AggregateState, &FunctionCall<'_, P>) -> Result<Value> + Send + Sync>,
}

impl<P: Sqlite3Hooks> Clone for WindowFns<P> {
    fn clone(&self) -> Self {
        Self {
            aggregate: self.aggregate.clone(),
            inverse: Arc::clone(&self.inverse),
            value: Arc::clone(&self.value),
        }
    }
}

impl<P: Sqlite3Hooks> WindowFns<P> {
    pub fn typed<S, I, St, Inv, Val, Fi>(
        init: I,
        step: St,
        inverse: Inv,
        value: Val,
        finalize: Fi,
    ) -> Self
    where
        S: Send + 'static,
        I: Fn() -> S + Send + Sync + 'static,
        St: Fn(&mut S, &FunctionCall<'_, P>) -> Result<()> + Send + Sync + 'static,
        Inv: Fn(&mut S, &FunctionCall<'_, P>) -> Result<()> + Send + Sync + 'static,
        Val: Fn(&S, &FunctionCall<'_, P>) -> Result<Value> + Send + Sync + 'static,
        Fi: Fn(S, &FunctionCall<'_, P>) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            aggregate: AggregateFns::typed(init, step, finalize),
            inverse: Arc::new(move |state: &mut AggregateState, call: &FunctionCall<'_, P>| {
                match state.downcast_mut::<S>() {
                    Some(state) => inverse(state, call),
                    None => Err(Error::user("aggregate state has unexpected type")),
                }
            }),
            value: Arc::new(move |state: &AggregateState, call: &FunctionCall<'_, P>| {
                match state.downcast_ref::<S>() {
                    Some(state) => value(state, call),
                    None => Err(Error::user("aggregate state has unexpected type")),
                }
            }),
        }
    }
}

/// Caller-supplied handler for one callback slot.
pub enum Handler<P: Sqlite3Hooks> {
    Busy(Arc<BusyFn>),
    Trace {
        mask: TraceMask,
        callback: Arc<TraceFn>,
    },
    /// `period` is the number of virtual machine steps between invocations.
    Progress {
        period: i32,
        callback: Arc<ProgressFn>,
    },
    Commit(Arc<CommitFn>),
    Rollback(Arc<RollbackFn>),
    Update(Arc<UpdateFn>),
    PreUpdate(Arc<PreUpdateFn<P>>),
    CollationNeeded(Arc<CollationNeededFn<P>>),
    Authorizer(Arc<AuthorizerFn>),
    Collation(Arc<CollationFn>),
    Scalar {
        flags: FunctionFlags,
        callback: Arc<ScalarFn<P>>,
    },
    Aggregate {
        flags: FunctionFlags,
        callbacks: AggregateFns<P>,
    },
    Window {
        flags: FunctionFlags,
        callbacks: WindowFns<P>,
    },
}

impl<P: Sqlite3Hooks> Handler<P> {
    /// Aggregate stages shared by aggregate and window functions.
    pub(crate) fn aggregate_fns(&self) -> Option<&AggregateFns<P>> {
        match self {
            Handler::Aggregate { callbacks, .. } => Some(callbacks),
            Handler::Window { callbacks, .. } => Some(&callbacks.aggregate),
            _ => None,
        }
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            Handler::Busy(_) => CallbackKind::Busy,
            Handler::Trace { .. } => CallbackKind::Trace,
            Handler::Progress { .. } => CallbackKind::Progress,
            Handler::Commit(_) => CallbackKind::Commit,
            Handler::Rollback(_) => CallbackKind::Rollback,
            Handler::Update(_) => CallbackKind::Update,
            Handler::PreUpdate(_) => CallbackKind::PreUpdate,
            Handler::CollationNeeded(_) => CallbackKind::CollationNeeded,
            Handler::Authorizer(_) => CallbackKind::Authorizer,
            Handler::Collation(_) => CallbackKind::Collation,
            Handler::Scalar { .. } | Handler::Aggregate { .. } | Handler::Window { .. } => {
                CallbackKind::Function
            }
        }
    }
}

impl<P: Sqlite3Hooks> Clone for Handler<P> {
    fn clone(&self) -> Self {
        match self {
            Handler::Busy(cb) => Handler::Busy(Arc::clone(cb)),
            Handler::Trace { mask, callback } => Handler::Trace {
                mask: *mask,
                callback: Arc::clone(callback),
            },
            Handler::Progress { period, callback } => Handler::Progress {
                period: *period,
                callback: Arc::clone(callback),
            },
            Handler::Commit(cb) => Handler::Commit(Arc::clone(cb)),
            Handler::Rollback(cb) => Handler::Rollback(Arc::clone(cb)),
            Handler::Update(cb) => Handler::Update(Arc::clone(cb)),
            Handler::PreUpdate(cb) => Handler::PreUpdate(Arc::clone(cb)),
            Handler::CollationNeeded(cb) => Handler::CollationNeeded(Arc::clone(cb)),
            Handler::Authorizer(cb) => Handler::Authorizer(Arc::clone(cb)),
            Handler::Collation(cb) => Handler::Collation(Arc::clone(cb)),
            Handler::Scalar { flags, callback } => Handler::Scalar {
                flags: *flags,
                callback: Arc::clone(callback),
            },
            Handler::Aggregate { flags, callbacks } => Handler::Aggregate {
                flags: *flags,
                callbacks: callbacks.clone(),
            },
            Handler::Window { flags, callbacks } => Handler::Window {
                flags: *flags,
                callbacks: callbacks.clone(),
            },
        }
    }
}

impl<P: Sqlite3Hooks> fmt::Debug for Handler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{}", self.kind().name())
    }
}

/// Registration cell for one (connection, slot) pair.
///
/// The cell's address is the context pointer the engine hands back to the
/// trampolines, so it must stay allocated for as long as the engine may call
/// through it: until a null registration, a successful close, or shutdown.
pub(crate) struct SlotCell<P: Sqlite3Hooks> {
    pub(crate) bridge: Weak<Bridge<P>>,
    pub(crate) db: DbHandle,
    pub(crate) raw_db: usize,
    pub(crate) slot: CallbackSlot,
    handler: RwLock<Option<Handler<P>>>,
}

impl<P: Sqlite3Hooks> SlotCell<P> {
    pub(crate) fn new(
        bridge: Weak<Bridge<P>>,
        db: DbHandle,
        raw_db: usize,
        slot: CallbackSlot,
    ) -> Self {
        Self {
            bridge,
            db,
            raw_db,
            slot,
            handler: RwLock::new(None),
        }
    }

    pub(crate) fn current(&self) -> Option<Handler<P>> {
        self.handler.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Swap in `handler`, returning the one it replaces.
    pub(crate) fn replace(&self, handler: Option<Handler<P>>) -> Option<Handler<P>> {
        let mut guard = self.handler.write().unwrap_or_else(|p| p.into_inner());
        core::mem::replace(&mut *guard, handler)
    }

    /// Engine context pointer for `cell`.
    pub(crate) fn context_ptr(cell: &Arc<SlotCell<P>>) -> *mut core::ffi::c_void {
        Arc::as_ptr(cell) as *mut core::ffi::c_void
    }

    /// Take a strong reference to the cell behind an engine context pointer.
    ///
    /// The extra reference keeps the cell alive even if the handler it runs
    /// unregisters itself.
    ///
    /// # Safety
    /// `ctx` must come from [`SlotCell::context_ptr`] on a cell that is still registered.
    pub(crate) unsafe fn from_context(ctx: *mut core::ffi::c_void) -> Option<Arc<SlotCell<P>>> {
        if ctx.is_null() {
            return None;
        }
        let ptr = ctx as *const SlotCell<P>;
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }
}

/// Run the handler registered in `cell` with error containment.
///
/// Returns `None` when nothing is registered (or the bridge is gone), and the
/// handler's outcome otherwise. Failures and panics are recorded on the owning
/// connection and logged before being returned; they never unwind further.
pub(crate) fn invoke<P, R>(
    cell: &SlotCell<P>,
    f: impl FnOnce(&Bridge<P>, &Handler<P>) -> Result<R>,
) -> Option<Result<R>>
where
    P: Sqlite3Hooks,
{
    let bridge = cell.bridge.upgrade()?;
    bridge.threads().attach();
    let _depth = bridge.threads().enter();
    let handler = cell.current()?;
    trace!(db = %cell.db, slot = %cell.slot, "dispatching callback");
    let outcome = match catch_unwind(AssertUnwindSafe(|| f(&bridge, &handler))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(Error::user(format!(
            "panic in {} callback: {}",
            cell.slot,
            panic_message(payload.as_ref())
        ))),
    };
    if let Err(err) = &outcome {
        bridge.record_callback_error(cell.db, &cell.slot, err);
    }
    Some(outcome)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return (*msg).to_owned();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_owned()
}

#[cfg(test)]
mod tests {
    use super::{CallbackKind, CallbackSlot, panic_message};

    #[test]
    fn slot_names_are_case_folded() {
        assert_eq!(CallbackSlot::function("MyFunc", 2), CallbackSlot::function("myfunc", 2));
        assert_ne!(CallbackSlot::function("f", 1), CallbackSlot::function("f", 2));
        assert_eq!(CallbackSlot::collation("NoCase2"), CallbackSlot::Collation("nocase2".into()));
        assert_eq!(CallbackSlot::function("f", -1).kind(), CallbackKind::Function);
    }

    #[test]
    fn slot_display() {
        assert_eq!(CallbackSlot::Busy.to_string(), "busy");
        assert_eq!(CallbackSlot::function("Half", 1).to_string(), "function half/1");
        assert_eq!(CallbackSlot::collation("rev").to_string(), "collation rev");
    }

    #[test]
    fn panic_payloads_render() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).expect_err("panics");
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
        let payload = std::panic::catch_unwind(|| std::panic::panic_any(5_u8)).expect_err("panics");
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
