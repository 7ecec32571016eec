use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::num::NonZeroU64;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a native resource as seen by callers.
///
/// Keys come from one process-wide counter and are never reused, so a key
/// that was released can never name a later resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleKey(NonZeroU64);

impl HandleKey {
    pub(crate) fn next() -> Self {
        let raw = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and would need 2^64 allocations to wrap.
        HandleKey(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Raw key value.
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Rebuild a key from its raw value; zero is never a valid key.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(HandleKey(raw)),
            None => None,
        }
    }
}

/// Kind of native resource a handle names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// `sqlite3*`.
    Connection,
    /// `sqlite3_stmt*`.
    Statement,
    /// `sqlite3_value*` handed to a user-defined function.
    Value,
    /// `sqlite3_context*` of a running user-defined function.
    Context,
}

impl ResourceKind {
    pub const fn name(self) -> &'static str {
        match self {
            ResourceKind::Connection => "connection",
            ResourceKind::Statement => "statement",
            ResourceKind::Value => "value",
            ResourceKind::Context => "context",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed handle over a [`HandleKey`].
pub trait Handle: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Resource kind this handle type names.
    const KIND: ResourceKind;

    fn key(self) -> HandleKey;

    /// Wrap a raw key. Unknown keys are rejected at lookup time.
    fn from_key(key: HandleKey) -> Self;
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(HandleKey);

        impl Handle for $name {
            const KIND: ResourceKind = $kind;

            fn key(self) -> HandleKey {
                self.0
            }

            fn from_key(key: HandleKey) -> Self {
                $name(key)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", Self::KIND, self.0.get())
            }
        }
    };
}

handle_type!(
    /// Open database connection.
    DbHandle,
    ResourceKind::Connection
);
handle_type!(
    /// Prepared statement.
    StmtHandle,
    ResourceKind::Statement
);
handle_type!(
    /// Argument value of a running user-defined function; valid only during that call.
    ValueHandle,
    ResourceKind::Value
);
handle_type!(
    /// Result context of a running user-defined function; valid only during that call.
    ContextHandle,
    ResourceKind::Context
);

/// Diagnostic text for a handle that names no live resource.
pub(crate) fn stale_message<H: Handle>(handle: H) -> String {
    format!("{} handle #{} is closed or unknown", H::KIND, handle.key().get())
}

/// Key to record table for one resource kind.
///
/// A record is inserted once when its resource is created and removed once
/// when the resource is released. Lookups hand out clones so no lock is held
/// while the caller talks to the engine.
pub struct HandleArena<H, T> {
    records: Mutex<HashMap<HandleKey, T>>,
    _kind: PhantomData<fn() -> H>,
}

impl<H: Handle, T: Clone> HandleArena<H, T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            _kind: PhantomData,
        }
    }

    /// Store `record` under a fresh key.
    pub fn insert(&self, record: T) -> H {
        let key = HandleKey::next();
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.insert(key, record);
        H::from_key(key)
    }

    /// Clone of the record for `handle`, if still live.
    pub fn get(&self, handle: H) -> Option<T> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.get(&handle.key()).cloned()
    }

    /// Release `handle`, returning its record the first time only.
    pub fn remove(&self, handle: H) -> Option<T> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.remove(&handle.key())
    }

    pub fn contains(&self, handle: H) -> bool {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.contains_key(&handle.key())
    }

    pub fn len(&self) -> usize {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live handles whose record matches `pred`.
    pub fn handles_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<H> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records
            .iter()
            .filter(|(_, record)| pred(record))
            .map(|(key, _)| H::from_key(*key))
            .collect()
    }

    /// Remove every record.
    pub fn drain(&self) -> Vec<(H, T)> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.drain().map(|(key, record)| (H::from_key(key), record)).collect()
    }
}

impl<H: Handle, T: Clone> Default for HandleArena<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{DbHandle, Handle, HandleArena, HandleKey, ResourceKind, StmtHandle, stale_message};

    #[test]
    fn keys_are_never_reused() {
        let arena: HandleArena<DbHandle, usize> = HandleArena::new();
        let first = arena.insert(1);
        assert_eq!(arena.remove(first), Some(1));
        let second = arena.insert(2);
        assert_ne!(first, second);
        assert!(second.key() > first.key());
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.get(second), Some(2));
    }

    #[test]
    fn release_happens_once() {
        let arena: HandleArena<StmtHandle, &'static str> = HandleArena::new();
        let stmt = arena.insert("select 1");
        assert!(arena.contains(stmt));
        assert_eq!(arena.remove(stmt), Some("select 1"));
        assert_eq!(arena.remove(stmt), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn drain_and_filter() {
        let arena: HandleArena<StmtHandle, u8> = HandleArena::new();
        let a = arena.insert(1);
        let _b = arena.insert(2);
        assert_eq!(arena.handles_where(|v| *v == 1), vec![a]);
        assert_eq!(arena.drain().len(), 2);
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn stale_message_names_kind_and_key() {
        let handle = DbHandle::from_key(HandleKey::from_raw(9).expect("non-zero"));
        assert_eq!(DbHandle::KIND, ResourceKind::Connection);
        assert_eq!(stale_message(handle), "connection handle #9 is closed or unknown");
        assert_eq!(handle.to_string(), "connection#9");
        assert!(HandleKey::from_raw(0).is_none());
    }
}
