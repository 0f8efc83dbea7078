//! Observed ordered sequences
//!
//! [`RecordList`] carries an entity's rows: an ordered sequence of records
//! plus a cursor side-channel pointing at the current element. Structural
//! mutations fire one normalized `spliced` notification each; insertion
//! listeners may substitute replacement records, and the sequence keeps the
//! replacements. Reordering fires an empty splice. The cursor follows the
//! last touched element on insertion and fires its own change notification
//! whenever it moves to a different element.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::observe::{log_listener_error, ListListener, ListenerHandle, ListenerSet};
use crate::record::Record;

pub struct RecordList {
    items: RefCell<Vec<Record>>,
    cursor: RefCell<Option<Record>>,
    listeners: ListenerSet<dyn ListListener>,
}

impl RecordList {
    pub fn new() -> Self {
        Self {
            items: RefCell::new(Vec::new()),
            cursor: RefCell::new(None),
            listeners: ListenerSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Record> {
        self.items.borrow().get(index).cloned()
    }

    /// Snapshot of the current sequence.
    pub fn records(&self) -> Vec<Record> {
        self.items.borrow().clone()
    }

    pub fn index_of(&self, record: &Record) -> Option<usize> {
        self.items.borrow().iter().position(|r| r == record)
    }

    pub fn cursor(&self) -> Option<Record> {
        self.cursor.borrow().clone()
    }

    pub fn listen(&self, listener: Rc<dyn ListListener>) -> ListenerHandle {
        self.listeners.attach(listener)
    }

    pub fn unlisten(&self, handle: ListenerHandle) -> bool {
        self.listeners.detach(handle)
    }

    /// Move the cursor. Fires a cursor notification only when the target is
    /// a different element (by identity) than the current one.
    pub fn scroll_to(&self, target: Option<Record>) {
        let old = self.cursor.borrow().clone();
        let same = match (&old, &target) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if same {
            return;
        }
        *self.cursor.borrow_mut() = target.clone();
        for listener in self.listeners.snapshot() {
            if let Err(err) = listener.cursor_changed(old.as_ref(), target.as_ref()) {
                log_listener_error("cursor", &err);
            }
        }
    }

    /// Append records; the cursor lands on the last one appended. Returns the
    /// new length.
    pub fn push(&self, added: Vec<Record>) -> usize {
        if added.is_empty() {
            return self.len();
        }
        let at = self.items.borrow().len();
        self.items.borrow_mut().extend(added.iter().cloned());
        let added = self.fire_spliced(added, Vec::new(), Some(at));
        self.scroll_to(added.last().cloned());
        self.len()
    }

    /// Prepend records; the cursor lands on the last one prepended. Returns
    /// the new length.
    pub fn unshift(&self, added: Vec<Record>) -> usize {
        if added.is_empty() {
            return self.len();
        }
        {
            let mut items = self.items.borrow_mut();
            for (i, record) in added.iter().enumerate() {
                items.insert(i, record.clone());
            }
        }
        let added = self.fire_spliced(added, Vec::new(), Some(0));
        self.scroll_to(added.last().cloned());
        self.len()
    }

    pub fn pop(&self) -> Option<Record> {
        let removed = self.items.borrow_mut().pop();
        if let Some(record) = removed.clone() {
            self.fire_spliced(Vec::new(), vec![record], None);
        }
        removed
    }

    pub fn shift(&self) -> Option<Record> {
        let removed = {
            let mut items = self.items.borrow_mut();
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        };
        if let Some(record) = removed.clone() {
            self.fire_spliced(Vec::new(), vec![record], None);
        }
        removed
    }

    /// Remove one record by identity via a single-element splice.
    pub fn remove(&self, record: &Record) -> bool {
        match self.index_of(record) {
            Some(index) => {
                self.splice(index, 1, Vec::new());
                true
            }
            None => false,
        }
    }

    /// Delete `delete_count` records starting at `start` (clamped) and insert
    /// `added` in their place. Fires one spliced notification and moves the
    /// cursor to the last inserted element, or to the element preceding the
    /// deletion point for a pure deletion. Returns the deleted records.
    pub fn splice(&self, start: usize, delete_count: usize, added: Vec<Record>) -> Vec<Record> {
        let from = start.min(self.items.borrow().len());

        let removed: Vec<Record> = {
            let mut items = self.items.borrow_mut();
            let until = (from + delete_count).min(items.len());
            items.splice(from..until, added.iter().cloned()).collect()
        };

        let added = self.fire_spliced(added, removed.clone(), Some(from));
        // An insertion parks the cursor on the last adopted instance even
        // when its start overshot the old end or its slot collapsed into a
        // held record; a pure deletion parks it on the element preceding the
        // deletion point, clamped against the post-splice sequence.
        let target = if added.is_empty() {
            let items = self.items.borrow();
            start
                .min(items.len().saturating_sub(1))
                .checked_sub(1)
                .and_then(|index| items.get(index))
                .cloned()
        } else {
            added.last().cloned()
        };
        self.scroll_to(target);
        removed
    }

    /// Reverse in place; signals the reorder with an empty splice.
    pub fn reverse(&self) {
        let was_empty = {
            let mut items = self.items.borrow_mut();
            items.reverse();
            items.is_empty()
        };
        if !was_empty {
            self.fire_spliced(Vec::new(), Vec::new(), None);
        }
    }

    /// Sort in place; signals the reorder with an empty splice.
    pub fn sort_by<F>(&self, mut compare: F)
    where
        F: FnMut(&Record, &Record) -> Ordering,
    {
        let was_empty = {
            let mut items = self.items.borrow_mut();
            items.sort_by(|a, b| compare(a, b));
            items.is_empty()
        };
        if !was_empty {
            self.fire_spliced(Vec::new(), Vec::new(), None);
        }
    }

    /// Fire `spliced` on every listener with the snapshot discipline. An
    /// insertion listener may return one replacement per added record; the
    /// replacements feed the next listener and are written back into the
    /// slots starting at `insert_at`. A replacement aliasing a record the
    /// sequence already holds elsewhere collapses into it and its slot is
    /// dropped, so no instance ever appears twice. Returns the final added
    /// set, one entry per original addition.
    fn fire_spliced(
        &self,
        added: Vec<Record>,
        removed: Vec<Record>,
        insert_at: Option<usize>,
    ) -> Vec<Record> {
        let mut current = added;
        for listener in self.listeners.snapshot() {
            match listener.spliced(&current, &removed) {
                Ok(replacements)
                    if !current.is_empty() && replacements.len() == current.len() =>
                {
                    current = replacements;
                }
                Ok(_) => {}
                Err(err) => log_listener_error("spliced", &err),
            }
        }
        if let Some(at) = insert_at {
            let mut items = self.items.borrow_mut();
            let mut kept = 0;
            for (processed, record) in current.iter().enumerate() {
                let slot = at + kept;
                // Slots past this one still hold raw inputs awaiting their
                // own turn; a hit anywhere else is an alias.
                let pending = current.len() - processed - 1;
                let aliased = items
                    .iter()
                    .enumerate()
                    .any(|(i, held)| held == record && (i < slot || i > slot + pending));
                if aliased {
                    items.remove(slot);
                } else if let Some(held) = items.get_mut(slot) {
                    *held = record.clone();
                    kept += 1;
                }
            }
        }
        current
    }
}

impl Default for RecordList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use mirage_core_types::{field_map, Value};
    use std::cell::RefCell as StdRefCell;

    fn record(n: f64) -> Record {
        Record::new(field_map([("n", Value::from(n))]))
    }

    #[derive(Default)]
    struct SpliceLog {
        splices: StdRefCell<Vec<(usize, usize)>>,
        cursor_moves: StdRefCell<usize>,
    }

    impl ListListener for Rc<SpliceLog> {
        fn spliced(&self, added: &[Record], removed: &[Record]) -> Result<Vec<Record>> {
            self.splices.borrow_mut().push((added.len(), removed.len()));
            Ok(Vec::new())
        }
        fn cursor_changed(&self, _old: Option<&Record>, _new: Option<&Record>) -> Result<()> {
            *self.cursor_moves.borrow_mut() += 1;
            Ok(())
        }
    }

    fn observed() -> (RecordList, Rc<SpliceLog>) {
        let list = RecordList::new();
        let log = Rc::new(SpliceLog::default());
        list.listen(Rc::new(log.clone()));
        (list, log)
    }

    #[test]
    fn test_push_fires_splice_and_scrolls_to_last() {
        let (list, log) = observed();
        let (a, b) = (record(1.0), record(2.0));

        let len = list.push(vec![a, b.clone()]);

        assert_eq!(len, 2);
        assert_eq!(*log.splices.borrow(), vec![(2, 0)]);
        assert_eq!(list.cursor(), Some(b));
        assert_eq!(*log.cursor_moves.borrow(), 1);
    }

    #[test]
    fn test_push_nothing_is_silent() {
        let (list, log) = observed();
        list.push(Vec::new());
        assert!(log.splices.borrow().is_empty());
        assert!(list.cursor().is_none());
    }

    #[test]
    fn test_unshift_prepends_and_scrolls_to_last_prepended() {
        let (list, log) = observed();
        list.push(vec![record(3.0)]);

        let (a, b) = (record(1.0), record(2.0));
        list.unshift(vec![a.clone(), b.clone()]);

        assert_eq!(list.get(0), Some(a));
        assert_eq!(list.get(1), Some(b.clone()));
        assert_eq!(list.cursor(), Some(b));
        assert_eq!(*log.splices.borrow(), vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn test_pop_and_shift_fire_removal_only_when_nonempty() {
        let (list, log) = observed();
        assert!(list.pop().is_none());
        assert!(list.shift().is_none());
        assert!(log.splices.borrow().is_empty());

        let (a, b) = (record(1.0), record(2.0));
        list.push(vec![a.clone(), b.clone()]);

        assert_eq!(list.pop(), Some(b));
        assert_eq!(list.shift(), Some(a));
        assert!(list.is_empty());
        assert_eq!(*log.splices.borrow(), vec![(2, 0), (0, 1), (0, 1)]);
    }

    #[test]
    fn test_splice_returns_deleted_and_moves_cursor_back() {
        let (list, _log) = observed();
        let (a, b, c) = (record(1.0), record(2.0), record(3.0));
        list.push(vec![a.clone(), b.clone(), c.clone()]);

        let deleted = list.splice(1, 1, Vec::new());

        assert_eq!(deleted, vec![b]);
        assert_eq!(list.records(), vec![a.clone(), c]);
        // Pure deletion at index 1 parks the cursor on the element before it.
        assert_eq!(list.cursor(), Some(a));
    }

    #[test]
    fn test_splice_insertion_scrolls_to_last_inserted() {
        let (list, _log) = observed();
        let (a, b) = (record(1.0), record(2.0));
        list.push(vec![a.clone(), b.clone()]);

        let (x, y) = (record(10.0), record(11.0));
        let deleted = list.splice(1, 0, vec![x.clone(), y.clone()]);

        assert!(deleted.is_empty());
        assert_eq!(list.records(), vec![a, x, y.clone(), b]);
        assert_eq!(list.cursor(), Some(y));
    }

    #[test]
    fn test_splice_start_is_clamped() {
        let (list, _log) = observed();
        let a = record(1.0);
        list.push(vec![a.clone()]);

        let added = record(2.0);
        list.splice(99, 5, vec![added.clone()]);
        assert_eq!(list.records(), vec![a, added.clone()]);
        // The clamped insertion still parks the cursor on the inserted
        // element, not on the one it landed behind.
        assert_eq!(list.cursor(), Some(added));
    }

    #[test]
    fn test_remove_by_identity() {
        let (list, _log) = observed();
        let (a, b) = (record(1.0), record(2.0));
        list.push(vec![a.clone(), b.clone()]);

        let stranger = record(1.0);
        assert!(!list.remove(&stranger));
        assert!(list.remove(&a));
        assert_eq!(list.records(), vec![b]);
    }

    #[test]
    fn test_reverse_and_sort_signal_reorder() {
        let (list, log) = observed();
        list.reverse();
        assert!(log.splices.borrow().is_empty());

        let (a, b) = (record(2.0), record(1.0));
        list.push(vec![a.clone(), b.clone()]);
        list.reverse();
        assert_eq!(list.records(), vec![b.clone(), a.clone()]);

        list.sort_by(|x, y| {
            let (x, y) = (x.get("n"), y.get("n"));
            match (x, y) {
                (Value::Number(x), Value::Number(y)) => x.partial_cmp(&y).unwrap(),
                _ => Ordering::Equal,
            }
        });
        assert_eq!(list.records(), vec![b, a]);
        assert_eq!(*log.splices.borrow(), vec![(2, 0), (0, 0), (0, 0)]);
    }

    #[test]
    fn test_insertion_listener_replaces_added_records() {
        struct Replacer {
            substitute: Record,
        }
        impl ListListener for Replacer {
            fn spliced(&self, added: &[Record], _removed: &[Record]) -> Result<Vec<Record>> {
                Ok(added.iter().map(|_| self.substitute.clone()).collect())
            }
        }

        let list = RecordList::new();
        let substitute = record(42.0);
        list.listen(Rc::new(Replacer {
            substitute: substitute.clone(),
        }));

        list.push(vec![record(1.0)]);

        assert_eq!(list.records(), vec![substitute.clone()]);
        assert_eq!(list.cursor(), Some(substitute));
    }

    #[test]
    fn test_replacement_count_mismatch_is_ignored() {
        struct Shrinker;
        impl ListListener for Shrinker {
            fn spliced(&self, _added: &[Record], _removed: &[Record]) -> Result<Vec<Record>> {
                Ok(vec![record(0.0)])
            }
        }

        let list = RecordList::new();
        list.listen(Rc::new(Shrinker));

        let (a, b) = (record(1.0), record(2.0));
        list.push(vec![a.clone(), b.clone()]);
        assert_eq!(list.records(), vec![a, b]);
    }

    #[test]
    fn test_replacement_aliasing_held_record_drops_its_slot() {
        struct Reuser {
            held: Record,
        }
        impl ListListener for Reuser {
            fn spliced(&self, added: &[Record], _removed: &[Record]) -> Result<Vec<Record>> {
                Ok(added.iter().map(|_| self.held.clone()).collect())
            }
        }

        let list = RecordList::new();
        let held = record(1.0);
        list.push(vec![held.clone()]);
        list.listen(Rc::new(Reuser { held: held.clone() }));

        // The substituted instance is already in the sequence; the fresh
        // slot collapses into it instead of duplicating it.
        list.push(vec![record(2.0)]);

        assert_eq!(list.records(), vec![held.clone()]);
        assert_eq!(list.cursor(), Some(held));
    }

    #[test]
    fn test_scroll_to_same_element_is_silent() {
        let (list, log) = observed();
        let a = record(1.0);
        list.push(vec![a.clone()]);
        assert_eq!(*log.cursor_moves.borrow(), 1);

        list.scroll_to(Some(a));
        assert_eq!(*log.cursor_moves.borrow(), 1);

        list.scroll_to(None);
        assert_eq!(*log.cursor_moves.borrow(), 2);
    }
}
