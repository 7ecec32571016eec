use crate::handle::{DbHandle, StmtHandle};

/// Single-slot container receiving a value produced by a boundary call.
///
/// Boundary operations clear the boxes they are handed before doing anything
/// else, so a box only ever holds the result of the most recent call.
/// [`OutBox::take`] moves the value out and leaves the box empty.
#[derive(Debug)]
pub struct OutBox<T> {
    slot: Option<T>,
}

impl<T> OutBox<T> {
    /// Empty box.
    pub const fn new() -> Self {
        Self { slot: None }
    }

    /// Move the value out, leaving the box empty.
    pub fn take(&mut self) -> Option<T> {
        self.slot.take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.is_some()
    }

    /// Borrow the value without taking it.
    pub fn peek(&self) -> Option<&T> {
        self.slot.as_ref()
    }

    /// Drop any held value.
    pub fn clear(&mut self) {
        self.slot = None;
    }

    pub(crate) fn set(&mut self, value: T) {
        self.slot = Some(value);
    }
}

impl<T> Default for OutBox<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives a freshly opened connection.
pub type OutDb = OutBox<DbHandle>;
/// Receives a freshly prepared statement.
pub type OutStmt = OutBox<StmtHandle>;
/// Receives the byte offset of unparsed SQL.
pub type OutTail = OutBox<usize>;

#[cfg(test)]
mod tests {
    use super::OutBox;

    #[test]
    fn take_empties_the_box() {
        let mut out = OutBox::new();
        out.set(7_i64);
        assert!(out.is_set());
        assert_eq!(out.peek(), Some(&7));
        assert_eq!(out.take(), Some(7));
        assert_eq!(out.take(), None);
        assert!(!out.is_set());
    }

    #[test]
    fn clear_discards_stale_value() {
        let mut out = OutBox::<i32>::default();
        out.set(1);
        out.clear();
        assert_eq!(out.take(), None);
    }
}
