use std::thread::{self, ThreadId};
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use crate::handle::{ContextHandle, Handle, HandleKey, ValueHandle};

/// Transient handles minted for one user-defined function invocation.
#[derive(Debug)]
pub(crate) struct CallFrame {
    pub(crate) context: ContextHandle,
    pub(crate) context_raw: usize,
    pub(crate) values: Vec<(ValueHandle, usize)>,
    pub(crate) result_set: bool,
}

impl CallFrame {
    pub(crate) fn new(context_raw: usize, value_raws: impl IntoIterator<Item = usize>) -> Self {
        Self {
            context: ContextHandle::from_key(HandleKey::next()),
            context_raw,
            values: value_raws
                .into_iter()
                .map(|raw| (ValueHandle::from_key(HandleKey::next()), raw))
                .collect(),
            result_set: false,
        }
    }
}

/// Bookkeeping the layer keeps for one calling thread.
#[derive(Debug)]
pub struct ThreadEntry {
    attached_at: Instant,
    depth: usize,
    frames: Vec<CallFrame>,
    last_error: Option<String>,
}

impl ThreadEntry {
    fn new() -> Self {
        Self {
            attached_at: Instant::now(),
            depth: 0,
            frames: Vec::new(),
            last_error: None,
        }
    }

    pub fn attached_at(&self) -> Instant {
        self.attached_at
    }

    /// Number of engine callbacks currently running on this thread.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Per-thread cache keyed by [`ThreadId`].
///
/// Entries appear on a thread's first boundary call or first callback dispatch
/// and go away through [`ThreadCache::detach`] (that thread) or
/// [`ThreadCache::clear`] (every thread). Map guards are never held across
/// calls into the engine or into user handlers.
#[derive(Default)]
pub struct ThreadCache {
    entries: DashMap<ThreadId, ThreadEntry>,
}

impl ThreadCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Make sure the calling thread has an entry; returns `true` if it was created.
    pub fn attach(&self) -> bool {
        let id = thread::current().id();
        if self.entries.contains_key(&id) {
            return false;
        }
        let mut created = false;
        self.entries.entry(id).or_insert_with(|| {
            created = true;
            ThreadEntry::new()
        });
        if created {
            debug!(thread = ?id, "thread attached");
        }
        created
    }

    /// Drop the calling thread's entry; `false` when there was none.
    pub fn detach(&self) -> bool {
        let id = thread::current().id();
        let removed = self.entries.remove(&id).is_some();
        if removed {
            debug!(thread = ?id, "thread detached");
        }
        removed
    }

    /// Drop every entry, returning how many were present.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn is_attached(&self) -> bool {
        self.entries.contains_key(&thread::current().id())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispatch depth of the calling thread, zero when detached.
    pub fn depth(&self) -> usize {
        self.entries
            .get(&thread::current().id())
            .map(|entry| entry.depth)
            .unwrap_or(0)
    }

    /// Last boundary error message recorded on the calling thread.
    pub fn last_error(&self) -> Option<String> {
        self.entries
            .get(&thread::current().id())
            .and_then(|entry| entry.last_error.clone())
    }

    pub(crate) fn set_last_error(&self, message: Option<String>) {
        self.with_entry(|entry| entry.last_error = message);
    }

    /// Mark the calling thread as running an engine callback until the guard drops.
    pub(crate) fn enter(&self) -> DispatchGuard<'_> {
        self.with_entry(|entry| entry.depth += 1);
        DispatchGuard { cache: self }
    }

    /// Publish `frame` on the calling thread until the guard drops.
    pub(crate) fn push_frame(&self, frame: CallFrame) -> FrameGuard<'_> {
        self.with_entry(|entry| entry.frames.push(frame));
        FrameGuard { cache: self }
    }

    fn pop_frame(&self) -> Option<CallFrame> {
        self.entries
            .get_mut(&thread::current().id())
            .and_then(|mut entry| entry.frames.pop())
    }

    /// Native address behind a context handle minted on this thread.
    pub(crate) fn resolve_context(&self, handle: ContextHandle) -> Option<usize> {
        let entry = self.entries.get(&thread::current().id())?;
        entry
            .frames
            .iter()
            .rev()
            .find(|frame| frame.context == handle)
            .map(|frame| frame.context_raw)
    }

    /// Resolve a context handle for writing a result and remember that one was set.
    pub(crate) fn claim_context(&self, handle: ContextHandle) -> Option<usize> {
        let mut entry = self.entries.get_mut(&thread::current().id())?;
        let frame = entry.frames.iter_mut().rev().find(|frame| frame.context == handle)?;
        frame.result_set = true;
        Some(frame.context_raw)
    }

    /// Whether a result was written through `handle` since its frame was pushed.
    pub(crate) fn result_set(&self, handle: ContextHandle) -> bool {
        self.entries
            .get(&thread::current().id())
            .and_then(|entry| {
                entry
                    .frames
                    .iter()
                    .rev()
                    .find(|frame| frame.context == handle)
                    .map(|frame| frame.result_set)
            })
            .unwrap_or(false)
    }

    /// Native address behind a value handle minted on this thread.
    pub(crate) fn resolve_value(&self, handle: ValueHandle) -> Option<usize> {
        let entry = self.entries.get(&thread::current().id())?;
        entry
            .frames
            .iter()
            .rev()
            .flat_map(|frame| frame.values.iter())
            .find(|(value, _)| *value == handle)
            .map(|(_, raw)| *raw)
    }

    fn with_entry(&self, f: impl FnOnce(&mut ThreadEntry)) {
        let mut entry = self
            .entries
            .entry(thread::current().id())
            .or_insert_with(ThreadEntry::new);
        f(entry.value_mut());
    }
}

pub(crate) struct DispatchGuard<'a> {
    cache: &'a ThreadCache,
}

pub(crate) struct FrameGuard<'a> {
    cache: &'a ThreadCache,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.cache.pop_frame();
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        // The handler may have run thread_cleanup; nothing to undo then.
        if let Some(mut entry) = self.cache.entries.get_mut(&thread::current().id()) {
            entry.depth = entry.depth.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::{CallFrame, ThreadCache};

    #[test]
    fn attach_detach_cycle() {
        let cache = ThreadCache::new();
        assert!(!cache.is_attached());
        assert!(cache.attach());
        assert!(!cache.attach());
        assert!(cache.is_attached());
        assert!(cache.detach());
        assert!(!cache.detach());
        assert!(!cache.is_attached());
    }

    #[test]
    fn entries_are_per_thread() {
        let cache = Arc::new(ThreadCache::new());
        cache.attach();
        let other = Arc::clone(&cache);
        thread::spawn(move || {
            assert!(!other.is_attached());
            other.attach();
            other.set_last_error(Some("worker".into()));
        })
        .join()
        .expect("worker thread");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.last_error(), None);
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn frames_resolve_only_on_owning_thread() {
        let cache = Arc::new(ThreadCache::new());
        let frame = CallFrame::new(0x10, [0x20, 0x30]);
        let ctx = frame.context;
        let second = frame.values[1].0;
        let guard = cache.push_frame(frame);
        assert_eq!(cache.resolve_context(ctx), Some(0x10));
        assert_eq!(cache.resolve_value(second), Some(0x30));

        let other = Arc::clone(&cache);
        thread::spawn(move || assert_eq!(other.resolve_value(second), None))
            .join()
            .expect("worker thread");

        assert!(!cache.result_set(ctx));
        assert_eq!(cache.claim_context(ctx), Some(0x10));
        assert!(cache.result_set(ctx));

        drop(guard);
        assert_eq!(cache.resolve_context(ctx), None);
        assert!(!cache.result_set(ctx));
        assert!(cache.pop_frame().is_none());
    }

    #[test]
    fn dispatch_depth_tracks_guards() {
        let cache = ThreadCache::new();
        {
            let _outer = cache.enter();
            let _inner = cache.enter();
            assert_eq!(cache.depth(), 2);
        }
        assert_eq!(cache.depth(), 0);
    }
}
