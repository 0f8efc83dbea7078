//! Observed records
//!
//! A [`Record`] is a shared handle over one mutable field map. All mutation
//! goes through [`Record::set`], which runs the full notification pipeline:
//! loose-equality suppression, write-guard validation, `before_change`,
//! write, `on_change`. Two handles are equal iff they observe the same
//! underlying record (identity semantics).

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use mirage_core_types::{FieldMap, Value};

use crate::errors::Result;
use crate::observe::{
    log_listener_error, BeforeState, ListenerHandle, ListenerSet, PropertyChange, RecordListener,
};

/// Validates a pending write before any notification fires. An error rejects
/// the write entirely: the field keeps its old value and no listener runs.
pub trait WriteGuard {
    fn check_set(&self, record: &Record, field: &str, value: &Value) -> Result<()>;
}

/// Stable identity token of one record, usable as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(usize);

struct RecordInner {
    fields: RefCell<FieldMap>,
    listeners: ListenerSet<dyn RecordListener>,
    guard: RefCell<Option<Rc<dyn WriteGuard>>>,
}

/// Shared handle over one observed record.
#[derive(Clone)]
pub struct Record {
    inner: Rc<RecordInner>,
}

impl Record {
    pub fn new(fields: FieldMap) -> Self {
        Self {
            inner: Rc::new(RecordInner {
                fields: RefCell::new(fields),
                listeners: ListenerSet::new(),
                guard: RefCell::new(None),
            }),
        }
    }

    /// Identity of the underlying record, shared by all clones of this handle.
    pub fn id(&self) -> RecordId {
        RecordId(Rc::as_ptr(&self.inner) as usize)
    }

    /// Current value of `field`; absent fields read as null.
    pub fn get(&self, field: &str) -> Value {
        self.inner
            .fields
            .borrow()
            .get(field)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Snapshot of the full field map.
    pub fn fields(&self) -> FieldMap {
        self.inner.fields.borrow().clone()
    }

    /// Write `field`, running the full notification pipeline.
    ///
    /// A new value loosely equal to the old one is suppressed: nothing is
    /// written and nothing fires. A guard rejection leaves the record
    /// untouched and propagates the error.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let new_value = value.into();
        let old_value = self.get(field);
        if old_value.loosely_equals(&new_value) {
            return Ok(());
        }

        let guard = self.inner.guard.borrow().clone();
        if let Some(guard) = guard {
            guard.check_set(self, field, &new_value)?;
        }

        let change = PropertyChange::new(field, old_value, new_value.clone());
        let listeners = self.inner.listeners.snapshot();
        let mut states: Vec<Option<BeforeState>> = Vec::with_capacity(listeners.len());
        for listener in &listeners {
            match listener.before_change(&change) {
                Ok(state) => states.push(state),
                Err(err) => {
                    log_listener_error("before_change", &err);
                    states.push(None);
                }
            }
        }

        self.inner
            .fields
            .borrow_mut()
            .insert(field.to_string(), new_value);

        for (listener, before) in listeners.iter().zip(states) {
            if let Err(err) = listener.on_change(&change, before) {
                log_listener_error("change", &err);
            }
        }
        Ok(())
    }

    /// Write without suppression, guard or notification. Bulk-ingestion path.
    pub(crate) fn set_raw(&self, field: &str, value: Value) {
        self.inner
            .fields
            .borrow_mut()
            .insert(field.to_string(), value);
    }

    /// Replace the whole field map without notification. Bulk-refresh path.
    pub(crate) fn replace_fields(&self, fields: FieldMap) {
        *self.inner.fields.borrow_mut() = fields;
    }

    /// Fire a synthetic property notification. Skips suppression, guard and
    /// the `before_change` phase; listeners receive `before = None`.
    pub(crate) fn notify_property(&self, change: &PropertyChange) {
        for listener in self.inner.listeners.snapshot() {
            if let Err(err) = listener.on_change(change, None) {
                log_listener_error("change", &err);
            }
        }
    }

    pub fn listen(&self, listener: Rc<dyn RecordListener>) -> ListenerHandle {
        self.inner.listeners.attach(listener)
    }

    pub fn unlisten(&self, handle: ListenerHandle) -> bool {
        self.inner.listeners.detach(handle)
    }

    pub(crate) fn install_guard(&self, guard: Rc<dyn WriteGuard>) {
        *self.inner.guard.borrow_mut() = Some(guard);
    }

    pub(crate) fn clear_guard(&self) {
        *self.inner.guard.borrow_mut() = None;
    }

    /// Non-owning handle; lets observers reference their record without
    /// keeping it alive.
    pub fn downgrade(&self) -> WeakRecord {
        WeakRecord {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

/// Weak counterpart of [`Record`].
#[derive(Clone)]
pub struct WeakRecord {
    inner: Weak<RecordInner>,
}

impl WeakRecord {
    pub fn upgrade(&self) -> Option<Record> {
        self.inner.upgrade().map(|inner| Record { inner })
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("fields", &*self.inner.fields.borrow())
            .finish()
    }
}

impl From<FieldMap> for Record {
    fn from(fields: FieldMap) -> Self {
        Record::new(fields)
    }
}
