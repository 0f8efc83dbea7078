//! Change-observation primitives
//!
//! Turns bare records and sequences into observable ones without embedding
//! entity semantics. Listeners are explicit trait objects attached through
//! identity-based subscription handles; there is no reflective property
//! interception anywhere in the engine.
//!
//! Firing always snapshots the listener set first, so a listener may detach
//! itself (or others) mid-callback. A failing listener is logged and skipped;
//! it never aborts its siblings and never corrupts the caller.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use mirage_core_types::Value;

use crate::errors::{MirageError, Result};
use crate::record::Record;

/// Opaque state produced by a `before_change` callback and handed back to the
/// same listener's `on_change` after the write has landed. Lets a listener
/// snapshot whatever it needs while the old value is still visible.
pub type BeforeState = Box<dyn Any>;

/// Immutable property-change payload.
///
/// Built once per mutation and shared by reference with every listener.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    pub property: String,
    pub old_value: Value,
    pub new_value: Value,
}

impl PropertyChange {
    pub fn new(property: impl Into<String>, old_value: Value, new_value: Value) -> Self {
        Self {
            property: property.into(),
            old_value,
            new_value,
        }
    }
}

/// Listener attached to an observed record.
///
/// Every method has a no-op default so implementations pick what they need.
pub trait RecordListener {
    /// Fired before a changed value is written. The returned state is handed
    /// back to this listener's [`RecordListener::on_change`]. Synthetic
    /// notifications (navigation properties and the like) skip this phase.
    fn before_change(&self, _change: &PropertyChange) -> Result<Option<BeforeState>> {
        Ok(None)
    }

    /// Fired after the write landed. `before` is the state this listener
    /// returned from `before_change`, or `None` for synthetic notifications.
    fn on_change(&self, _change: &PropertyChange, _before: Option<BeforeState>) -> Result<()> {
        Ok(())
    }
}

/// Listener attached to an observed ordered sequence.
pub trait ListListener {
    /// Fired once per structural mutation with the normalized added/removed
    /// sets. For insertions the listener may return replacements, one per
    /// added element; a count mismatch keeps the inputs unchanged.
    fn spliced(&self, _added: &[Record], _removed: &[Record]) -> Result<Vec<Record>> {
        Ok(Vec::new())
    }

    /// Fired when the cursor side-channel moves to a different element.
    fn cursor_changed(&self, _old: Option<&Record>, _new: Option<&Record>) -> Result<()> {
        Ok(())
    }

    /// Fired for property-style notifications on the sequence itself
    /// (currently the collection `length` changes).
    fn on_change(&self, _change: &PropertyChange) -> Result<()> {
        Ok(())
    }
}

/// Identity token for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// A set of listeners with stable identity-based detach.
pub struct ListenerSet<L: ?Sized> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<(u64, Rc<L>)>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn attach(&self, listener: Rc<L>) -> ListenerHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().push((id, listener));
        ListenerHandle(id)
    }

    pub fn detach(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(id, _)| *id != handle.0);
        entries.len() != before
    }

    /// Clone out the current listeners; firing iterates the snapshot so
    /// callbacks may attach/detach freely.
    pub fn snapshot(&self) -> Vec<Rc<L>> {
        self.entries
            .borrow()
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Isolate a failed listener: log it and move on.
pub(crate) fn log_listener_error(event: &str, err: &MirageError) {
    tracing::warn!(
        component = module_path!(),
        event = event,
        err_kind = ?err.kind(),
        err_code = err.code(),
        "listener failed; continuing with remaining listeners: {err}"
    );
}
