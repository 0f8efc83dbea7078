//! Observable entities
//!
//! An [`Entity`] is one named query materialized as an observed record
//! sequence. It owns the per-entity load-state machine (invalid, pending,
//! valid), ad-hoc composite indexes over its rows, the transactional change
//! log feeding the model's aggregate log, and the writable navigation
//! properties installed by reference relations.
//!
//! Records become observed the moment they enter the rows, whether appended
//! locally or ingested from a fetch: an ingestion hook fills blank key
//! fields, installs the entity's write guard and field listener, registers
//! the record in every index, and logs the structural change. Ingestion is
//! idempotent by key: a row whose full key already belongs to the entity
//! resolves to the existing record instance.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use mirage_core_types::{ChangeRecord, FieldMap, Value};

use crate::backend::{IdGenerator, SequentialIds};
use crate::errors::{MirageError, Result};
use crate::index::{CompositeIndex, KEY_DELIMITER};
use crate::model::ModelInner;
use crate::observe::{
    BeforeState, ListListener, ListenerHandle, ListenerSet, PropertyChange, RecordListener,
};
use crate::record::{Record, RecordId, WeakRecord, WriteGuard};
use crate::relation::{CollectionNavigation, RelationSource, ScalarNavigation};
use crate::rows::RecordList;
use crate::{log_op_end, log_op_error, log_op_start};

/// Property name used by collection-length notifications.
pub const LENGTH_PROPERTY: &str = "length";

/// Per-entity load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Stale; eligible for the next requery round once its dependencies are
    /// valid.
    Invalid,
    /// A fetch is in flight.
    Pending,
    /// Up to date; a fresh start() is rejected until invalidated.
    Valid,
}

/// One change-log entry, shared between the entity log and the model's
/// aggregate log so later coalescing mutates both in place.
pub(crate) type SharedChange = Rc<RefCell<ChangeRecord>>;

pub(crate) fn materialize_changes(log: &[SharedChange]) -> Vec<ChangeRecord> {
    log.iter().map(|change| change.borrow().clone()).collect()
}

pub(crate) struct EntityInner {
    name: String,
    key_fields: Vec<String>,
    key_index_name: Option<String>,
    rows: RecordList,
    indexes: RefCell<HashMap<String, Rc<CompositeIndex>>>,
    scalars: RefCell<HashMap<String, ScalarNavigation>>,
    collections: RefCell<HashMap<String, CollectionNavigation>>,
    views: RefCell<HashMap<(RecordId, String), CollectionView>>,
    record_hooks: RefCell<HashMap<RecordId, ListenerHandle>>,
    state: Cell<LoadState>,
    parameters: RefCell<FieldMap>,
    change_log: RefCell<Vec<SharedChange>>,
    pending_inserts: RefCell<HashMap<RecordId, SharedChange>>,
    snapshot: RefCell<Vec<FieldMap>>,
    ids: RefCell<Rc<dyn IdGenerator>>,
    model: RefCell<Weak<ModelInner>>,
    op_token: RefCell<Option<CancellationToken>>,
    requeried_hooks: ListenerSet<dyn Fn(&Entity)>,
    ingesting: Cell<bool>,
    weak_self: Weak<EntityInner>,
}

/// Shared handle over one entity.
#[derive(Clone)]
pub struct Entity {
    inner: Rc<EntityInner>,
}

impl Entity {
    /// A keyed entity over the named query. Key fields are deduplicated and
    /// keep their declaration order; at least one is required.
    pub fn new<N, I, S>(name: N, key_fields: I) -> Result<Self>
    where
        N: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(MirageError::EmptyQueryName);
        }
        let mut keys: Vec<String> = Vec::new();
        for field in key_fields {
            let field = field.into();
            if !keys.contains(&field) {
                keys.push(field);
            }
        }
        if keys.is_empty() {
            return Err(MirageError::MissingKeyFields { entity: name });
        }
        Ok(Self::build(name, keys))
    }

    /// A keyless command entity: no rows of its own, used to enqueue or send
    /// parameterized commands.
    pub fn command(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(MirageError::EmptyQueryName);
        }
        Ok(Self::build(name, Vec::new()))
    }

    fn build(name: String, key_fields: Vec<String>) -> Self {
        let key_index_name = if key_fields.is_empty() {
            None
        } else {
            Some(CompositeIndex::canonical_name_of(key_fields.iter().cloned()))
        };
        let default_ids: Rc<dyn IdGenerator> = Rc::new(SequentialIds::new());
        let inner = Rc::new_cyclic(|weak| EntityInner {
            name,
            key_fields,
            key_index_name,
            rows: RecordList::new(),
            indexes: RefCell::new(HashMap::new()),
            scalars: RefCell::new(HashMap::new()),
            collections: RefCell::new(HashMap::new()),
            views: RefCell::new(HashMap::new()),
            record_hooks: RefCell::new(HashMap::new()),
            state: Cell::new(LoadState::Invalid),
            parameters: RefCell::new(FieldMap::new()),
            change_log: RefCell::new(Vec::new()),
            pending_inserts: RefCell::new(HashMap::new()),
            snapshot: RefCell::new(Vec::new()),
            ids: RefCell::new(default_ids),
            model: RefCell::new(Weak::new()),
            op_token: RefCell::new(None),
            requeried_hooks: ListenerSet::new(),
            ingesting: Cell::new(false),
            weak_self: weak.clone(),
        });
        if let Some(index_name) = &inner.key_index_name {
            inner.indexes.borrow_mut().insert(
                index_name.clone(),
                Rc::new(CompositeIndex::new(inner.key_fields.iter().cloned())),
            );
        }
        inner.rows.listen(Rc::new(EntityRowsHook {
            entity: Rc::downgrade(&inner),
        }));
        Entity { inner }
    }

    pub fn name(&self) -> String {
        self.inner.name.clone()
    }

    pub fn key_fields(&self) -> Vec<String> {
        self.inner.key_fields.clone()
    }

    pub fn state(&self) -> LoadState {
        self.inner.state.get()
    }

    /// The observed row sequence. Mutating it directly runs the same
    /// ingestion pipeline as [`Entity::append`].
    pub fn rows(&self) -> &RecordList {
        &self.inner.rows
    }

    pub fn len(&self) -> usize {
        self.inner.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Record> {
        self.inner.rows.get(index)
    }

    pub fn records(&self) -> Vec<Record> {
        self.inner.rows.records()
    }

    pub fn cursor(&self) -> Option<Record> {
        self.inner.rows.cursor()
    }

    pub fn scroll_to(&self, record: Option<Record>) {
        self.inner.rows.scroll_to(record);
    }

    pub fn listen_rows(&self, listener: Rc<dyn ListListener>) -> ListenerHandle {
        self.inner.rows.listen(listener)
    }

    pub fn unlisten_rows(&self, handle: ListenerHandle) -> bool {
        self.inner.rows.unlisten(handle)
    }

    // ----- retrieval -----

    /// All records matching the criteria, through the index over the
    /// criteria's field set (built lazily on first use). Empty criteria
    /// return every record.
    pub fn find_by(&self, criteria: &FieldMap) -> Vec<Record> {
        if criteria.is_empty() {
            return self.records();
        }
        self.inner
            .index_for(criteria.keys().cloned())
            .find(criteria)
    }

    /// The single record with the given key values, positionally matching
    /// the configured key fields.
    pub fn find_by_key(&self, key: &[Value]) -> Result<Option<Record>> {
        if self.inner.key_fields.is_empty() {
            return Err(MirageError::KeylessEntity { entity: self.name() });
        }
        if key.len() != self.inner.key_fields.len() {
            return Err(MirageError::KeyArityMismatch {
                entity: self.name(),
                expected: self.inner.key_fields.len(),
                supplied: key.len(),
            });
        }
        let criteria: FieldMap = self
            .inner
            .key_fields
            .iter()
            .cloned()
            .zip(key.iter().cloned())
            .collect();
        let mut matches = self.find_by(&criteria);
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => Err(MirageError::DuplicateKey {
                entity: self.name(),
                key: key
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(KEY_DELIMITER),
            }),
        }
    }

    // ----- local mutation -----

    /// Ingest raw rows locally. Blank key fields are filled from the id
    /// generator, each record is observed and indexed, and one insert change
    /// per genuinely new record lands in the logs. Returns the adopted
    /// records; a row whose key already belongs to the entity yields the
    /// existing instance and leaves the sequence unchanged.
    pub fn append(&self, rows: Vec<FieldMap>) -> Vec<Record> {
        if rows.is_empty() {
            return Vec::new();
        }
        let records: Vec<Record> = rows.into_iter().map(Record::new).collect();
        self.inner.rows.push(records.clone());
        // The ingestion hook fills blank keys in place and collapses rows
        // whose key is already held, so each input resolves by key to its
        // adopted instance.
        records
            .into_iter()
            .map(|record| self.inner.existing_by_key(&record).unwrap_or(record))
            .collect()
    }

    /// Remove one record by identity, logging a delete change.
    pub fn remove(&self, record: &Record) -> bool {
        self.inner.rows.remove(record)
    }

    /// Remove every record, logging one delete change each.
    pub fn clear(&self) {
        let len = self.inner.rows.len();
        if len > 0 {
            self.inner.rows.splice(0, len, Vec::new());
        }
    }

    // ----- parameters -----

    pub fn set_parameter(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .parameters
            .borrow_mut()
            .insert(name.into(), value.into());
    }

    pub fn parameter(&self, name: &str) -> Value {
        self.inner
            .parameters
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn parameters(&self) -> FieldMap {
        self.inner.parameters.borrow().clone()
    }

    // ----- load-state machine -----

    /// Mark stale. The next requery round picks the entity up once its
    /// dependencies are valid.
    pub fn invalidate(&self) {
        self.inner.state.set(LoadState::Invalid);
    }

    /// Cancel the in-flight fetch if pending; otherwise settle an invalid
    /// entity as valid so a stuck schedule can terminate.
    pub fn cancel(&self) {
        match self.inner.state.get() {
            LoadState::Pending => {
                let token = self.inner.op_token.borrow().clone();
                if let Some(token) = token {
                    token.cancel();
                }
            }
            LoadState::Invalid => self.inner.state.set(LoadState::Valid),
            LoadState::Valid => {}
        }
    }

    /// True when every dependency edge pointing at this entity has a valid
    /// left entity. Edges from unknown entities do not block.
    pub fn in_related_valid(&self) -> bool {
        let Some(model) = self.inner.model.borrow().upgrade() else {
            return true;
        };
        model.relations_into(&self.inner.name).iter().all(|relation| {
            model
                .entity(&relation.left_entity)
                .map(|left| left.state() == LoadState::Valid)
                .unwrap_or(true)
        })
    }

    /// Run one fetch cycle: bind inbound parameters, fetch, replace contents,
    /// rebaseline the revert snapshot and fire requery hooks. Rejected unless
    /// currently invalid. The entity settles valid whatever the outcome;
    /// a cancellation observed after the fetch completed keeps the data and
    /// still reports [`MirageError::Cancelled`].
    pub async fn start(&self, token: &CancellationToken) -> Result<()> {
        let name = self.name();
        match self.inner.state.get() {
            LoadState::Pending => return Err(MirageError::AlreadyPending { entity: name }),
            LoadState::Valid => return Err(MirageError::AlreadyValid { entity: name }),
            LoadState::Invalid => {}
        }
        if token.is_cancelled() {
            return Err(MirageError::Cancelled {
                op: format!("fetch '{name}'"),
            });
        }
        let model = self
            .inner
            .model
            .borrow()
            .upgrade()
            .ok_or_else(|| MirageError::DetachedEntity {
                entity: name.clone(),
            })?;
        if self.inner.key_fields.is_empty() {
            tracing::warn!(
                component = module_path!(),
                entity = %name,
                "keyless entity has no instances; dependents bind null parameters"
            );
        }
        self.inner.bind_parameters(&model);
        let parameters = self.inner.parameters.borrow().clone();

        let op = token.child_token();
        *self.inner.op_token.borrow_mut() = Some(op.clone());
        self.inner.state.set(LoadState::Pending);
        log_op_start!("entity_start", entity = %name);
        let started = Instant::now();

        let backend = model.backend();
        let outcome = tokio::select! {
            biased;
            result = backend.fetch(&name, &parameters, &op) => result,
            _ = op.cancelled() => Err(MirageError::Cancelled {
                op: format!("fetch '{name}'"),
            }),
        };

        let result = match outcome {
            Ok(rows) => {
                let row_count = rows.len();
                self.inner.ingest_remote(rows);
                self.fire_requeried();
                if op.is_cancelled() {
                    Err(MirageError::Cancelled {
                        op: format!("fetch '{name}'"),
                    })
                } else {
                    log_op_end!(
                        "entity_start",
                        duration_ms = started.elapsed().as_millis() as u64,
                        entity = %name,
                        row_count = row_count
                    );
                    Ok(())
                }
            }
            Err(err) => Err(err),
        };

        *self.inner.op_token.borrow_mut() = None;
        self.inner.state.set(LoadState::Valid);
        if let Err(err) = &result {
            log_op_error!(
                "entity_start",
                err,
                duration_ms = started.elapsed().as_millis() as u64,
                entity = %name
            );
        }
        result
    }

    /// Invalidate this entity (and everything depending on it) and run the
    /// model's requery schedule.
    pub async fn requery(&self, token: &CancellationToken) -> Result<()> {
        let model = self
            .inner
            .model
            .borrow()
            .upgrade()
            .ok_or_else(|| MirageError::DetachedEntity { entity: self.name() })?;
        model.start(&[self.inner.name.clone()], token).await
    }

    /// Register a hook fired after each successful ingestion, while the
    /// entity is still pending. Hooks run in registration order.
    pub fn on_requeried(&self, hook: impl Fn(&Entity) + 'static) -> ListenerHandle {
        self.inner.requeried_hooks.attach(Rc::new(hook))
    }

    pub fn remove_requeried(&self, handle: ListenerHandle) -> bool {
        self.inner.requeried_hooks.detach(handle)
    }

    fn fire_requeried(&self) {
        for hook in self.inner.requeried_hooks.snapshot() {
            hook(self);
        }
    }

    // ----- ad-hoc backend calls -----

    /// Fetch this entity's query under explicit parameters without touching
    /// the entity's contents or state.
    pub async fn query(
        &self,
        parameters: FieldMap,
        token: &CancellationToken,
    ) -> Result<Vec<FieldMap>> {
        let model = self
            .inner
            .model
            .borrow()
            .upgrade()
            .ok_or_else(|| MirageError::DetachedEntity { entity: self.name() })?;
        let backend = model.backend();
        backend.fetch(&self.inner.name, &parameters, token).await
    }

    /// Send one parameterized command immediately, outside the change log.
    /// Returns the affected-row count.
    pub async fn update(&self, parameters: FieldMap, token: &CancellationToken) -> Result<u64> {
        let model = self
            .inner
            .model
            .borrow()
            .upgrade()
            .ok_or_else(|| MirageError::DetachedEntity { entity: self.name() })?;
        let change = ChangeRecord::Command {
            entity: self.name(),
            parameters,
        };
        let backend = model.backend();
        backend.commit(std::slice::from_ref(&change), token).await
    }

    /// Append one parameterized command to the change logs, to be applied by
    /// the next save.
    pub fn enqueue_update(&self, parameters: FieldMap) {
        self.inner.push_change(ChangeRecord::Command {
            entity: self.inner.name.clone(),
            parameters,
        });
    }

    // ----- change log -----

    pub fn modified(&self) -> bool {
        !self.inner.change_log.borrow().is_empty()
    }

    /// Materialized snapshot of this entity's pending changes, in order.
    pub fn change_log(&self) -> Vec<ChangeRecord> {
        materialize_changes(&self.inner.change_log.borrow())
    }

    /// Accept the current contents as the new baseline: rebaseline the
    /// revert snapshot and drop this entity's pending changes from both logs.
    pub fn commit(&self) {
        let snapshot: Vec<FieldMap> = self
            .inner
            .rows
            .records()
            .iter()
            .map(Record::fields)
            .collect();
        *self.inner.snapshot.borrow_mut() = snapshot;
        self.inner.drop_logged_changes();
    }

    /// Restore the last baseline contents and drop this entity's pending
    /// changes from both logs.
    pub fn revert(&self) {
        let rows: Vec<FieldMap> = self.inner.snapshot.borrow().clone();
        self.inner.replace_contents(rows);
        self.inner.drop_logged_changes();
    }

    // ----- navigation -----

    /// Resolve a scalar navigation on one of this entity's records. Blank
    /// foreign values resolve to `None`; a non-blank value matching nothing
    /// is an unresolved reference.
    pub fn scalar(&self, record: &Record, property: &str) -> Result<Option<Record>> {
        let nav = self
            .inner
            .scalars
            .borrow()
            .get(property)
            .cloned()
            .ok_or_else(|| MirageError::UnknownNavigation {
                entity: self.name(),
                property: property.to_string(),
            })?;
        let model = self
            .inner
            .model
            .borrow()
            .upgrade()
            .ok_or_else(|| MirageError::DetachedEntity { entity: self.name() })?;
        let target = model
            .entity(&nav.target_entity)
            .ok_or_else(|| MirageError::UnknownEntity {
                entity: nav.target_entity.clone(),
            })?;
        let values: Vec<Value> = nav.fields.iter().map(|f| record.get(f)).collect();
        if values.iter().any(Value::is_blank) {
            return Ok(None);
        }
        let criteria: FieldMap = nav
            .target_fields
            .iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect();
        match target.find_by(&criteria).into_iter().next() {
            Some(found) => Ok(Some(found)),
            None => Err(MirageError::UnresolvedReference {
                entity: self.name(),
                field: nav.fields.join(", "),
                target: nav.target_entity.clone(),
                value: values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(KEY_DELIMITER),
            }),
        }
    }

    /// Assign a scalar navigation by writing the underlying foreign-key
    /// fields through the regular mutation pipeline. `None` clears them.
    pub fn set_scalar(&self, record: &Record, property: &str, target: Option<&Record>) -> Result<()> {
        let nav = self
            .inner
            .scalars
            .borrow()
            .get(property)
            .cloned()
            .ok_or_else(|| MirageError::UnknownNavigation {
                entity: self.name(),
                property: property.to_string(),
            })?;
        for (field, target_field) in nav.fields.iter().zip(&nav.target_fields) {
            let value = match target {
                Some(target) => target.get(target_field),
                None => Value::Null,
            };
            record.set(field, value)?;
        }
        Ok(())
    }

    /// The live collection navigation view owned by one of this entity's
    /// records. Views are cached per record and property; repeated calls
    /// return the same view instance.
    pub fn collection(&self, record: &Record, property: &str) -> Result<CollectionView> {
        let nav = self
            .inner
            .collections
            .borrow()
            .get(property)
            .cloned()
            .ok_or_else(|| MirageError::UnknownNavigation {
                entity: self.name(),
                property: property.to_string(),
            })?;
        let key = (record.id(), property.to_string());
        if let Some(view) = self.inner.views.borrow().get(&key) {
            return Ok(view.clone());
        }
        let view = CollectionView {
            inner: Rc::new(ViewInner {
                owner: record.clone(),
                nav,
                model: self.inner.model.borrow().clone(),
                listeners: ListenerSet::new(),
            }),
        };
        self.inner.views.borrow_mut().insert(key, view.clone());
        Ok(view)
    }

    pub(crate) fn cached_view(&self, owner: &Record, property: &str) -> Option<CollectionView> {
        self.inner
            .views
            .borrow()
            .get(&(owner.id(), property.to_string()))
            .cloned()
    }

    // ----- model wiring -----

    pub(crate) fn attach(&self, model: Weak<ModelInner>, ids: Rc<dyn IdGenerator>) {
        *self.inner.model.borrow_mut() = model;
        *self.inner.ids.borrow_mut() = ids;
    }

    pub(crate) fn install_scalar(&self, nav: ScalarNavigation) {
        self.inner.scalars.borrow_mut().insert(nav.name.clone(), nav);
    }

    pub(crate) fn install_collection(&self, nav: CollectionNavigation) {
        self.inner
            .collections
            .borrow_mut()
            .insert(nav.name.clone(), nav);
    }

    pub(crate) fn clear_navigations(&self) {
        self.inner.scalars.borrow_mut().clear();
        self.inner.collections.borrow_mut().clear();
        self.inner.views.borrow_mut().clear();
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.get())
            .field("rows", &self.inner.rows.len())
            .finish()
    }
}

impl EntityInner {
    /// The shared index over a field set, built from the current rows on
    /// first use.
    fn index_for<I>(&self, fields: I) -> Rc<CompositeIndex>
    where
        I: IntoIterator<Item = String>,
    {
        let fields = CompositeIndex::canonical_fields(fields);
        let name = fields.join(KEY_DELIMITER);
        if let Some(index) = self.indexes.borrow().get(&name) {
            return index.clone();
        }
        let index = Rc::new(CompositeIndex::new(fields));
        for record in self.rows.records() {
            index.add(&record);
        }
        self.indexes.borrow_mut().insert(name, index.clone());
        index
    }

    fn push_change(&self, change: ChangeRecord) -> SharedChange {
        let shared: SharedChange = Rc::new(RefCell::new(change));
        self.change_log.borrow_mut().push(shared.clone());
        if let Some(model) = self.model.borrow().upgrade() {
            model.push_shared_change(shared.clone());
        }
        shared
    }

    /// Clear this entity's log, removing the same shared entries from the
    /// model's aggregate log so both stay consistent.
    fn drop_logged_changes(&self) {
        let entries: Vec<SharedChange> = std::mem::take(&mut *self.change_log.borrow_mut());
        self.pending_inserts.borrow_mut().clear();
        if let Some(model) = self.model.borrow().upgrade() {
            model.remove_shared_changes(&entries);
        }
    }

    /// Make an incoming record this entity's own: fill blank keys, install
    /// observation, index it, and log the insert. A record whose full key
    /// already belongs to the entity short-circuits to the existing
    /// instance.
    fn adopt_record(self: &Rc<Self>, record: &Record, log: bool) -> Record {
        if let Some(existing) = self.existing_by_key(record) {
            return existing;
        }
        for field in &self.key_fields {
            if record.get(field).is_null() {
                let id = self.ids.borrow().next_id();
                record.set_raw(field, id);
            }
        }
        let hook = Rc::new(EntityRecordHook {
            entity: self.weak_self.clone(),
            record: record.downgrade(),
        });
        record.install_guard(hook.clone());
        let handle = record.listen(hook);
        self.record_hooks.borrow_mut().insert(record.id(), handle);

        let indexes: Vec<Rc<CompositeIndex>> = self.indexes.borrow().values().cloned().collect();
        for index in &indexes {
            index.add(record);
        }

        if log {
            let change = ChangeRecord::Insert {
                entity: self.name.clone(),
                data: record.fields(),
            };
            let shared = self.push_change(change);
            self.pending_inserts.borrow_mut().insert(record.id(), shared);
        }
        record.clone()
    }

    fn existing_by_key(&self, record: &Record) -> Option<Record> {
        let index_name = self.key_index_name.as_ref()?;
        if self.key_fields.iter().any(|f| record.get(f).is_null()) {
            return None;
        }
        let index = self.indexes.borrow().get(index_name).cloned()?;
        let criteria: FieldMap = self
            .key_fields
            .iter()
            .map(|f| (f.clone(), record.get(f)))
            .collect();
        index.find(&criteria).into_iter().next()
    }

    /// Undo everything [`EntityInner::adopt_record`] did, logging the delete.
    /// A record about to be readopted in the same splice is released with
    /// `retire = false`, keeping its cached views and its insert-coalescing
    /// entry alive across the turnaround.
    fn release_record(&self, record: &Record, log: bool, retire: bool) {
        let indexes: Vec<Rc<CompositeIndex>> = self.indexes.borrow().values().cloned().collect();
        for index in &indexes {
            index.purge(record);
        }
        if let Some(handle) = self.record_hooks.borrow_mut().remove(&record.id()) {
            record.unlisten(handle);
        }
        record.clear_guard();
        if retire {
            let id = record.id();
            self.pending_inserts.borrow_mut().remove(&id);
            self.views.borrow_mut().retain(|(rid, _), _| *rid != id);
        }
        if log {
            let keys: FieldMap = self
                .key_fields
                .iter()
                .map(|f| (f.clone(), record.get(f)))
                .collect();
            self.push_change(ChangeRecord::Delete {
                entity: self.name.clone(),
                keys,
            });
        }
    }

    /// Full-contents replacement with change logging suppressed. Incoming
    /// rows whose key already belongs to the entity keep their record
    /// instance, refreshed in place.
    fn replace_contents(self: &Rc<Self>, raw_rows: Vec<FieldMap>) {
        self.ingesting.set(true);
        let records: Vec<Record> = raw_rows
            .into_iter()
            .map(|raw| self.reuse_or_create(raw))
            .collect();
        let len = self.rows.len();
        if len > 0 || !records.is_empty() {
            self.rows.splice(0, len, records);
        }
        self.ingesting.set(false);
    }

    fn reuse_or_create(&self, raw: FieldMap) -> Record {
        let probe = Record::new(raw);
        match self.existing_by_key(&probe) {
            Some(existing) => {
                existing.replace_fields(probe.fields());
                existing
            }
            None => probe,
        }
    }

    fn ingest_remote(self: &Rc<Self>, raw_rows: Vec<FieldMap>) {
        self.replace_contents(raw_rows);
        let snapshot: Vec<FieldMap> = self.rows.records().iter().map(Record::fields).collect();
        *self.snapshot.borrow_mut() = snapshot;
    }

    /// Refresh inbound parameter bindings from the current upstream cursors
    /// and parameters. Absent upstream instances bind null.
    fn bind_parameters(&self, model: &Rc<ModelInner>) {
        for relation in model.relations_into(&self.name) {
            let value = match model.entity(&relation.left_entity) {
                Some(left) => match &relation.left_source {
                    RelationSource::Field(field) => left
                        .cursor()
                        .map(|record| record.get(field))
                        .unwrap_or(Value::Null),
                    RelationSource::Parameter(parameter) => left.parameter(parameter),
                },
                None => Value::Null,
            };
            self.parameters
                .borrow_mut()
                .insert(relation.right_parameter.clone(), value);
        }
    }

    /// Reference-integrity check for foreign-key writes: a non-blank value
    /// on a single-field scalar navigation must resolve in the target
    /// entity, or the write is rejected before anything fires.
    fn check_reference_write(&self, field: &str, value: &Value) -> Result<()> {
        if value.is_blank() {
            return Ok(());
        }
        let guarded: Vec<ScalarNavigation> = self
            .scalars
            .borrow()
            .values()
            .filter(|nav| nav.fields.len() == 1 && nav.fields[0] == field)
            .cloned()
            .collect();
        if guarded.is_empty() {
            return Ok(());
        }
        let Some(model) = self.model.borrow().upgrade() else {
            return Ok(());
        };
        for nav in guarded {
            let Some(target) = model.entity(&nav.target_entity) else {
                continue;
            };
            let criteria: FieldMap =
                std::iter::once((nav.target_fields[0].clone(), value.clone())).collect();
            if target.find_by(&criteria).is_empty() {
                return Err(MirageError::UnresolvedReference {
                    entity: self.name.clone(),
                    field: field.to_string(),
                    target: nav.target_entity.clone(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Snapshot the navigation consequences of a pending write while the old
    /// value is still in place: the referenced records on both sides of the
    /// flip and the lengths of their cached collection views.
    fn capture_nav_before(&self, record: &Record, change: &PropertyChange) -> NavBefore {
        let mut entries = Vec::new();
        let affected: Vec<ScalarNavigation> = self
            .scalars
            .borrow()
            .values()
            .filter(|nav| nav.fields.iter().any(|f| f == &change.property))
            .cloned()
            .collect();
        if affected.is_empty() {
            return NavBefore { entries };
        }
        let Some(model) = self.model.borrow().upgrade() else {
            return NavBefore { entries };
        };
        for nav in affected {
            let Some(target) = model.entity(&nav.target_entity) else {
                continue;
            };
            let old_values: Vec<Value> = nav.fields.iter().map(|f| record.get(f)).collect();
            let new_values: Vec<Value> = nav
                .fields
                .iter()
                .map(|f| {
                    if *f == change.property {
                        change.new_value.clone()
                    } else {
                        record.get(f)
                    }
                })
                .collect();
            let old_target = resolve_reference(&target, &nav.target_fields, &old_values);
            let new_target = resolve_reference(&target, &nav.target_fields, &new_values);
            let old_view_len = nav.paired_collection.as_ref().and_then(|paired| {
                let owner = old_target.as_ref()?;
                target.cached_view(owner, paired).map(|view| view.len())
            });
            let new_view_len = nav.paired_collection.as_ref().and_then(|paired| {
                let owner = new_target.as_ref()?;
                target.cached_view(owner, paired).map(|view| view.len())
            });
            entries.push(NavBeforeEntry {
                nav,
                old_target,
                new_target,
                old_view_len,
                new_view_len,
            });
        }
        NavBefore { entries }
    }

    /// After a foreign-key write landed: fire the scalar-property change on
    /// the source record and length changes on the cached collection views
    /// of both affected owners.
    fn propagate_navigation(&self, record: &Record, change: &PropertyChange, before: &NavBefore) {
        if before.entries.is_empty() {
            return;
        }
        let Some(model) = self.model.borrow().upgrade() else {
            return;
        };
        for entry in &before.entries {
            let notification = PropertyChange::new(
                entry.nav.name.clone(),
                change.old_value.clone(),
                change.new_value.clone(),
            );
            record.notify_property(&notification);

            let same_owner = match (&entry.old_target, &entry.new_target) {
                (Some(old), Some(new)) => old == new,
                (None, None) => true,
                _ => false,
            };
            if same_owner {
                continue;
            }
            let Some(paired) = &entry.nav.paired_collection else {
                continue;
            };
            let Some(target) = model.entity(&entry.nav.target_entity) else {
                continue;
            };
            if let (Some(owner), Some(old_len)) = (&entry.old_target, entry.old_view_len) {
                if let Some(view) = target.cached_view(owner, paired) {
                    view.notify_length(old_len, view.len());
                }
            }
            if let (Some(owner), Some(new_len)) = (&entry.new_target, entry.new_view_len) {
                if let Some(view) = target.cached_view(owner, paired) {
                    view.notify_length(new_len, view.len());
                }
            }
        }
    }

    /// Append or coalesce the change-log entry for one field write. A write
    /// to a record with a pending insert folds into the insert's data; a key
    /// field rename keys the update by the pre-change value.
    fn log_field_change(&self, record: &Record, change: &PropertyChange) {
        let pending = self.pending_inserts.borrow().get(&record.id()).cloned();
        if let Some(shared) = pending {
            if let ChangeRecord::Insert { data, .. } = &mut *shared.borrow_mut() {
                data.insert(change.property.clone(), change.new_value.clone());
                return;
            }
        }
        let keys: FieldMap = self
            .key_fields
            .iter()
            .map(|f| {
                let value = if *f == change.property {
                    change.old_value.clone()
                } else {
                    record.get(f)
                };
                (f.clone(), value)
            })
            .collect();
        let data: FieldMap =
            std::iter::once((change.property.clone(), change.new_value.clone())).collect();
        self.push_change(ChangeRecord::Update {
            entity: self.name.clone(),
            keys,
            data,
        });
    }
}

fn resolve_reference(target: &Entity, target_fields: &[String], values: &[Value]) -> Option<Record> {
    if values.iter().any(Value::is_blank) {
        return None;
    }
    let criteria: FieldMap = target_fields
        .iter()
        .cloned()
        .zip(values.iter().cloned())
        .collect();
    target.find_by(&criteria).into_iter().next()
}

/// Ingestion hook installed on the entity's rows: adopts additions, releases
/// removals, suppresses change logging during full-replace ingestion.
struct EntityRowsHook {
    entity: Weak<EntityInner>,
}

impl ListListener for EntityRowsHook {
    fn spliced(&self, added: &[Record], removed: &[Record]) -> Result<Vec<Record>> {
        let Some(inner) = self.entity.upgrade() else {
            return Ok(Vec::new());
        };
        let log = !inner.ingesting.get();
        let readded: HashSet<RecordId> = added.iter().map(Record::id).collect();
        for record in removed {
            let retire = !readded.contains(&record.id());
            inner.release_record(record, log, retire);
        }
        let adopted: Vec<Record> = added
            .iter()
            .map(|record| inner.adopt_record(record, log))
            .collect();
        Ok(adopted)
    }
}

/// Per-record observation installed on adoption. One hook serves as both the
/// write guard and the field listener of its record.
struct EntityRecordHook {
    entity: Weak<EntityInner>,
    record: WeakRecord,
}

impl WriteGuard for EntityRecordHook {
    fn check_set(&self, _record: &Record, field: &str, value: &Value) -> Result<()> {
        match self.entity.upgrade() {
            Some(inner) => inner.check_reference_write(field, value),
            None => Ok(()),
        }
    }
}

impl RecordListener for EntityRecordHook {
    fn before_change(&self, change: &PropertyChange) -> Result<Option<BeforeState>> {
        let (Some(inner), Some(record)) = (self.entity.upgrade(), self.record.upgrade()) else {
            return Ok(None);
        };
        // Navigation state first, while every index still matches the old
        // value; then deregister from the indexes covering the field.
        let nav_before = inner.capture_nav_before(&record, change);
        let affected: Vec<Rc<CompositeIndex>> = inner
            .indexes
            .borrow()
            .values()
            .filter(|index| index.contains_field(&change.property))
            .cloned()
            .collect();
        for index in &affected {
            index.remove(&record);
        }
        Ok(Some(Box::new(nav_before)))
    }

    fn on_change(&self, change: &PropertyChange, before: Option<BeforeState>) -> Result<()> {
        // Synthetic notifications carry no before-state; engine bookkeeping
        // only follows a real field write.
        let Some(before) = before else {
            return Ok(());
        };
        let (Some(inner), Some(record)) = (self.entity.upgrade(), self.record.upgrade()) else {
            return Ok(());
        };
        let affected: Vec<Rc<CompositeIndex>> = inner
            .indexes
            .borrow()
            .values()
            .filter(|index| index.contains_field(&change.property))
            .cloned()
            .collect();
        for index in &affected {
            index.add(&record);
        }
        if !inner.ingesting.get() {
            inner.log_field_change(&record, change);
        }
        if let Ok(nav_before) = before.downcast::<NavBefore>() {
            inner.propagate_navigation(&record, change, &nav_before);
        }
        Ok(())
    }
}

struct NavBefore {
    entries: Vec<NavBeforeEntry>,
}

struct NavBeforeEntry {
    nav: ScalarNavigation,
    old_target: Option<Record>,
    new_target: Option<Record>,
    old_view_len: Option<usize>,
    new_view_len: Option<usize>,
}

struct ViewInner {
    owner: Record,
    nav: CollectionNavigation,
    model: Weak<ModelInner>,
    listeners: ListenerSet<dyn ListListener>,
}

/// Live collection navigation owned by one record: the source-entity records
/// whose foreign-key fields match the owner. Membership is computed through
/// the source entity's index on every read, so the view never goes stale.
#[derive(Clone)]
pub struct CollectionView {
    inner: Rc<ViewInner>,
}

impl CollectionView {
    pub fn name(&self) -> &str {
        &self.inner.nav.name
    }

    pub fn records(&self) -> Vec<Record> {
        let Some(model) = self.inner.model.upgrade() else {
            return Vec::new();
        };
        let Some(source) = model.entity(&self.inner.nav.source_entity) else {
            return Vec::new();
        };
        source.find_by(&self.criteria())
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Record> {
        self.records().into_iter().nth(index)
    }

    pub fn contains(&self, record: &Record) -> bool {
        self.records().iter().any(|r| r == record)
    }

    /// Adopt a source-entity record into this collection by pointing its
    /// foreign-key fields at the owner.
    pub fn push(&self, record: &Record) -> Result<()> {
        for (source_field, local_field) in self
            .inner
            .nav
            .source_fields
            .iter()
            .zip(&self.inner.nav.local_fields)
        {
            record.set(source_field, self.inner.owner.get(local_field))?;
        }
        Ok(())
    }

    /// Release a member from this collection by clearing its foreign-key
    /// fields. Nonmembers are left untouched.
    pub fn remove(&self, record: &Record) -> Result<()> {
        if !self.contains(record) {
            return Ok(());
        }
        for source_field in &self.inner.nav.source_fields {
            record.set(source_field, Value::Null)?;
        }
        Ok(())
    }

    /// Release every member.
    pub fn clear(&self) -> Result<()> {
        for record in self.records() {
            for source_field in &self.inner.nav.source_fields {
                record.set(source_field, Value::Null)?;
            }
        }
        Ok(())
    }

    pub fn listen(&self, listener: Rc<dyn ListListener>) -> ListenerHandle {
        self.inner.listeners.attach(listener)
    }

    pub fn unlisten(&self, handle: ListenerHandle) -> bool {
        self.inner.listeners.detach(handle)
    }

    pub(crate) fn notify_length(&self, old: usize, new: usize) {
        if old == new {
            return;
        }
        let change = PropertyChange::new(
            LENGTH_PROPERTY,
            Value::from(old as f64),
            Value::from(new as f64),
        );
        for listener in self.inner.listeners.snapshot() {
            if let Err(err) = listener.on_change(&change) {
                crate::observe::log_listener_error("change", &err);
            }
        }
    }

    fn criteria(&self) -> FieldMap {
        self.inner
            .nav
            .source_fields
            .iter()
            .cloned()
            .zip(
                self.inner
                    .nav
                    .local_fields
                    .iter()
                    .map(|f| self.inner.owner.get(f)),
            )
            .collect()
    }
}

impl fmt::Debug for CollectionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionView")
            .field("name", &self.inner.nav.name)
            .field("source", &self.inner.nav.source_entity)
            .finish()
    }
}
