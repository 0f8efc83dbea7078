//! The entity graph
//!
//! A [`Model`] ties entities together: it owns the backend handle, the
//! parameter-bound dependency edges driving the cascading requery, the
//! reference relations projected onto navigation properties, and one
//! aggregate change log spanning every member entity.
//!
//! The requery schedule runs in rounds to a fixed point: each round starts
//! every invalid entity whose dependencies are valid and awaits the whole
//! round before rescheduling, so downstream entities always bind parameters
//! against freshly loaded upstream cursors. Entities that can never become
//! eligible, for instance under a dependency cycle of invalid entities, are
//! settled as valid and reported rather than spun on forever.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use mirage_core_types::{ChangeRecord, RequestId};

use crate::backend::{Backend, IdGenerator, SequentialIds};
use crate::entity::{materialize_changes, Entity, LoadState, SharedChange};
use crate::errors::{MirageError, Result};
use crate::relation::{
    CollectionNavigation, ReferenceRelation, Relation, ScalarNavigation,
};
use crate::{log_op_end, log_op_error, log_op_start};

pub(crate) struct ModelInner {
    backend: Rc<dyn Backend>,
    ids: Rc<dyn IdGenerator>,
    entities: RefCell<BTreeMap<String, Entity>>,
    relations: RefCell<Vec<Relation>>,
    reference_relations: RefCell<Vec<ReferenceRelation>>,
    change_log: RefCell<Vec<SharedChange>>,
}

/// Shared handle over one entity graph.
#[derive(Clone)]
pub struct Model {
    inner: Rc<ModelInner>,
}

impl Model {
    /// A model over the given backend, filling blank key fields from a
    /// process-local sequence.
    pub fn new(backend: Rc<dyn Backend>) -> Self {
        Self::with_ids(backend, Rc::new(SequentialIds::new()))
    }

    /// A model with an explicit id generator for blank key fields.
    pub fn with_ids(backend: Rc<dyn Backend>, ids: Rc<dyn IdGenerator>) -> Self {
        Model {
            inner: Rc::new(ModelInner {
                backend,
                ids,
                entities: RefCell::new(BTreeMap::new()),
                relations: RefCell::new(Vec::new()),
                reference_relations: RefCell::new(Vec::new()),
                change_log: RefCell::new(Vec::new()),
            }),
        }
    }

    // ----- membership -----

    /// Register an entity under its query name and wire it to this model's
    /// backend, id generator and aggregate change log.
    pub fn add_entity(&self, entity: Entity) -> Result<()> {
        let name = entity.name();
        {
            let mut entities = self.inner.entities.borrow_mut();
            if entities.contains_key(&name) {
                return Err(MirageError::DuplicateEntity { entity: name });
            }
            entities.insert(name, entity.clone());
        }
        entity.attach(Rc::downgrade(&self.inner), self.inner.ids.clone());
        self.inner.reproject_navigations();
        Ok(())
    }

    pub fn entity(&self, name: &str) -> Option<Entity> {
        self.inner.entity(name)
    }

    /// Every registered entity, in name order.
    pub fn entities(&self) -> Vec<Entity> {
        self.inner.entities.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entities.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entities.borrow().is_empty()
    }

    // ----- dependency edges -----

    /// Add a parameter-bound dependency edge. Both endpoints must already be
    /// registered.
    pub fn add_relation(&self, relation: Relation) -> Result<()> {
        self.inner.require_entity(&relation.left_entity)?;
        self.inner.require_entity(&relation.right_entity)?;
        self.inner.relations.borrow_mut().push(relation);
        Ok(())
    }

    /// Remove one previously added edge. Returns whether anything matched.
    pub fn remove_relation(&self, relation: &Relation) -> bool {
        let mut relations = self.inner.relations.borrow_mut();
        match relations.iter().position(|r| r == relation) {
            Some(at) => {
                relations.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn relations(&self) -> Vec<Relation> {
        self.inner.relations.borrow().clone()
    }

    /// Add a reference relation and project its navigation properties onto
    /// the endpoint entities.
    pub fn add_association(&self, relation: ReferenceRelation) -> Result<()> {
        relation.validate()?;
        self.inner.require_entity(&relation.left_entity)?;
        self.inner.require_entity(&relation.right_entity)?;
        self.inner.reference_relations.borrow_mut().push(relation);
        self.inner.reproject_navigations();
        Ok(())
    }

    /// Remove one reference relation and its navigation properties. Returns
    /// whether anything matched.
    pub fn remove_association(&self, relation: &ReferenceRelation) -> bool {
        let removed = {
            let mut relations = self.inner.reference_relations.borrow_mut();
            match relations.iter().position(|r| r == relation) {
                Some(at) => {
                    relations.remove(at);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.inner.reproject_navigations();
        }
        removed
    }

    pub fn associations(&self) -> Vec<ReferenceRelation> {
        self.inner.reference_relations.borrow().clone()
    }

    // ----- graph loading -----

    /// Invalidate every entity and run the requery schedule to its fixed
    /// point.
    pub async fn requery(&self, token: &CancellationToken) -> Result<()> {
        let names: Vec<String> = self.inner.entities.borrow().keys().cloned().collect();
        self.inner.start(&names, token).await
    }

    /// Invalidate the named entities plus everything downstream of them and
    /// run the requery schedule.
    pub async fn start(&self, names: &[&str], token: &CancellationToken) -> Result<()> {
        let names: Vec<String> = names.iter().map(|n| (*n).to_string()).collect();
        self.inner.start(&names, token).await
    }

    /// Cancel whatever is in flight and settle every invalid entity as
    /// valid, so the running schedule can terminate.
    pub fn cancel(&self) {
        for entity in self.entities() {
            entity.cancel();
        }
    }

    // ----- transaction -----

    pub fn modified(&self) -> bool {
        !self.inner.change_log.borrow().is_empty()
    }

    /// Materialized snapshot of the aggregate change log, in append order.
    pub fn change_log(&self) -> Vec<ChangeRecord> {
        materialize_changes(&self.inner.change_log.borrow())
    }

    /// Send the accumulated changes as one batch. On success the log is
    /// cleared and every entity rebaselines its revert snapshot; on failure
    /// the log is kept intact for retry or revert.
    pub async fn save(&self, token: &CancellationToken) -> Result<u64> {
        let changes = { materialize_changes(&self.inner.change_log.borrow()) };
        let request = RequestId::new();
        log_op_start!(
            "save",
            request_id = %request,
            change_count = changes.len()
        );
        let started = Instant::now();

        if token.is_cancelled() {
            let err = MirageError::Cancelled {
                op: "commit".to_string(),
            };
            log_op_error!(
                "save",
                err,
                duration_ms = started.elapsed().as_millis() as u64,
                request_id = %request
            );
            return Err(err);
        }

        let backend = self.inner.backend.clone();
        let outcome = tokio::select! {
            biased;
            result = backend.commit(&changes, token) => result,
            _ = token.cancelled() => Err(MirageError::Cancelled {
                op: "commit".to_string(),
            }),
        };

        match outcome {
            Ok(affected) => {
                self.committed();
                log_op_end!(
                    "save",
                    duration_ms = started.elapsed().as_millis() as u64,
                    request_id = %request,
                    affected = affected
                );
                Ok(affected)
            }
            Err(err) => {
                log_op_error!(
                    "save",
                    err,
                    duration_ms = started.elapsed().as_millis() as u64,
                    request_id = %request
                );
                Err(err)
            }
        }
    }

    /// Restore every entity to its last baseline and clear both log levels.
    pub fn revert(&self) {
        self.inner.change_log.borrow_mut().clear();
        for entity in self.entities() {
            entity.revert();
        }
    }

    fn committed(&self) {
        self.inner.change_log.borrow_mut().clear();
        for entity in self.entities() {
            entity.commit();
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("entities", &self.inner.entities.borrow().len())
            .field("relations", &self.inner.relations.borrow().len())
            .field("modified", &!self.inner.change_log.borrow().is_empty())
            .finish()
    }
}

impl ModelInner {
    pub(crate) fn backend(&self) -> Rc<dyn Backend> {
        self.backend.clone()
    }

    pub(crate) fn entity(&self, name: &str) -> Option<Entity> {
        self.entities.borrow().get(name).cloned()
    }

    fn require_entity(&self, name: &str) -> Result<Entity> {
        self.entity(name).ok_or_else(|| MirageError::UnknownEntity {
            entity: name.to_string(),
        })
    }

    /// Dependency edges whose right side is the named entity.
    pub(crate) fn relations_into(&self, name: &str) -> Vec<Relation> {
        self.relations
            .borrow()
            .iter()
            .filter(|relation| relation.right_entity == name)
            .cloned()
            .collect()
    }

    pub(crate) fn push_shared_change(&self, change: SharedChange) {
        self.change_log.borrow_mut().push(change);
    }

    /// Drop the given shared entries from the aggregate log, by identity.
    pub(crate) fn remove_shared_changes(&self, entries: &[SharedChange]) {
        if entries.is_empty() {
            return;
        }
        self.change_log
            .borrow_mut()
            .retain(|change| !entries.iter().any(|entry| Rc::ptr_eq(entry, change)));
    }

    /// Rebuild every entity's navigation properties from the reference
    /// relations whose endpoints are both registered.
    fn reproject_navigations(&self) {
        for entity in self.entities.borrow().values() {
            entity.clear_navigations();
        }
        for relation in self.reference_relations.borrow().iter() {
            let (Some(left), Some(right)) = (
                self.entity(&relation.left_entity),
                self.entity(&relation.right_entity),
            ) else {
                continue;
            };
            if let Some(property) = &relation.scalar_property {
                left.install_scalar(ScalarNavigation {
                    name: property.clone(),
                    fields: relation.left_fields.clone(),
                    target_entity: relation.right_entity.clone(),
                    target_fields: relation.right_fields.clone(),
                    paired_collection: relation.collection_property.clone(),
                });
            }
            if let Some(property) = &relation.collection_property {
                right.install_collection(CollectionNavigation {
                    name: property.clone(),
                    source_entity: relation.left_entity.clone(),
                    source_fields: relation.left_fields.clone(),
                    local_fields: relation.right_fields.clone(),
                });
            }
        }
    }

    /// The named entities plus everything reachable over dependency edges,
    /// in name order.
    fn dependents_closure(&self, names: &[String]) -> Vec<Entity> {
        let mut seen: BTreeSet<String> = names.iter().cloned().collect();
        let mut queue: VecDeque<String> = names.iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            for relation in self.relations.borrow().iter() {
                if relation.left_entity == name && !seen.contains(&relation.right_entity) {
                    seen.insert(relation.right_entity.clone());
                    queue.push_back(relation.right_entity.clone());
                }
            }
        }
        seen.iter().filter_map(|name| self.entity(name)).collect()
    }

    /// Run the requery schedule over the named entities and their
    /// dependents. Rejected outright while any entity is pending. Per-entity
    /// failures do not stop the schedule; they are collected and reported
    /// together once it terminates.
    pub(crate) async fn start(
        self: &Rc<Self>,
        names: &[String],
        token: &CancellationToken,
    ) -> Result<()> {
        for name in names {
            self.require_entity(name)?;
        }
        let pending = self
            .entities
            .borrow()
            .values()
            .find(|entity| entity.state() == LoadState::Pending)
            .cloned();
        if let Some(entity) = pending {
            return Err(MirageError::RequeryInProgress {
                entity: entity.name(),
            });
        }

        let request = RequestId::new();
        let targets = self.dependents_closure(names);
        for target in &targets {
            target.invalidate();
        }
        log_op_start!(
            "requery",
            request_id = %request,
            target_count = targets.len()
        );
        let started = Instant::now();

        let mut reasons: Vec<MirageError> = Vec::new();
        loop {
            if token.is_cancelled() {
                self.settle_invalid();
                if reasons.is_empty() {
                    reasons.push(MirageError::Cancelled {
                        op: "requery".to_string(),
                    });
                }
                break;
            }
            let eligible: Vec<Entity> = self
                .entities
                .borrow()
                .values()
                .filter(|entity| {
                    entity.state() == LoadState::Invalid && entity.in_related_valid()
                })
                .cloned()
                .collect();
            if eligible.is_empty() {
                let stuck: Vec<String> = self
                    .entities
                    .borrow()
                    .values()
                    .filter(|entity| entity.state() == LoadState::Invalid)
                    .map(|entity| entity.name())
                    .collect();
                if stuck.is_empty() {
                    break;
                }
                self.settle_invalid();
                reasons.push(MirageError::UnsatisfiableDependencies { entities: stuck });
                break;
            }
            let round = futures::future::join_all(
                eligible.iter().map(|entity| entity.start(token)),
            )
            .await;
            reasons.extend(round.into_iter().filter_map(Result::err));
        }

        let result = if reasons.is_empty() {
            Ok(())
        } else {
            Err(MirageError::RequeryFailed { reasons })
        };
        match &result {
            Ok(()) => {
                log_op_end!(
                    "requery",
                    duration_ms = started.elapsed().as_millis() as u64,
                    request_id = %request
                );
            }
            Err(err) => {
                log_op_error!(
                    "requery",
                    err,
                    duration_ms = started.elapsed().as_millis() as u64,
                    request_id = %request
                );
            }
        }
        result
    }

    fn settle_invalid(&self) {
        let entities: Vec<Entity> = self.entities.borrow().values().cloned().collect();
        for entity in entities {
            if entity.state() == LoadState::Invalid {
                entity.cancel();
            }
        }
    }
}
