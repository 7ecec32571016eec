//! Marshaling layer between host code and the SQLite3 C API.
//!
//! The engine is reached only through the [`Sqlite3Api`] / [`Sqlite3Hooks`]
//! provider traits. A [`Bridge`] turns native pointers into opaque handles,
//! routes engine callbacks to registered handlers, and converts text between
//! host strings and the engine's UTF-8 / UTF-16 encodings.

mod autoext;
mod bridge;
mod encoding;
mod error;
mod handle;
mod outbox;
mod provider;
mod registry;
mod thread;
mod value;

pub use crate::autoext::{AutoExtension, AutoExtensionFn, AutoExtensionList};
pub use crate::bridge::{
    Authorization, AuthorizerAction, AuthorizerEvent, Bridge, FunctionCall, PreUpdateEvent,
    TraceEvent, TraceMask, UpdateEvent, UpdateOp, authorizer,
};
pub use crate::encoding::{EncodedText, Encoding, TextRep, decode, encode, encode_terminated};
pub use crate::error::{Error, ErrorCode, Result, codes};
pub use crate::handle::{
    ContextHandle, DbHandle, Handle, HandleArena, HandleKey, ResourceKind, StmtHandle, ValueHandle,
};
pub use crate::outbox::{OutBox, OutDb, OutStmt, OutTail};
pub use crate::provider::{
    ApiVersion, AuthorizerCallback, BusyCallback, CompareCallback, DestroyCallback, FeatureSet,
    FunctionFlags, HOST_OBJECT_TAG, InterruptCallback, LogCallback, OpenFlags, OpenOptions,
    Prepared, RawBytes, RollbackCallback, Sqlite3Api, Sqlite3Hooks, StepResult, ThreadingMode,
    TraceCallback, UpdateCallback, ValueType,
};
pub use crate::registry::{
    AggregateFns, AggregateState, AuthorizerFn, BusyFn, CallbackKind, CallbackSlot, CollationFn,
    CollationNeededFn, CommitFn, Handler, LogFn, PreUpdateFn, ProgressFn, RollbackFn, ScalarFn,
    TraceFn, UpdateFn, WindowFns,
};
pub use crate::thread::{ThreadCache, ThreadEntry};
pub use crate::value::{HostObject, Value, ValueRef};
