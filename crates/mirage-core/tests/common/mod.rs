use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mirage_core::{
    field_map, Backend, ChangeRecord, Entity, EntityDescriptor, FieldDescriptor, FieldMap,
    MirageError, Model, ReferenceRelation, Relation, Result, SchemaSource, Value,
};

/// In-memory store double over a small pet-clinic dataset.
///
/// Fetches are counted per query name, commits are recorded and applied to
/// the datasets, and individual queries can be made to hang until the
/// operation token is cancelled.
pub struct MockServer {
    owners: RefCell<Vec<FieldMap>>,
    pets: RefCell<Vec<FieldMap>>,
    pet_types: RefCell<Vec<FieldMap>>,
    fetch_counts: RefCell<HashMap<String, usize>>,
    commits: RefCell<Vec<Vec<ChangeRecord>>>,
    fail_commits: Cell<bool>,
    hang_commits: Cell<bool>,
    hung_queries: RefCell<Vec<String>>,
    describe_counts: RefCell<HashMap<String, usize>>,
    next_pet_id: Cell<i64>,
}

fn owner(id: f64, name: &str) -> FieldMap {
    field_map([("id", Value::from(id)), ("name", Value::from(name))])
}

fn pet(id: f64, owner_id: f64, type_id: f64, name: &str) -> FieldMap {
    field_map([
        ("id", Value::from(id)),
        ("owner_id", Value::from(owner_id)),
        ("type_id", Value::from(type_id)),
        ("name", Value::from(name)),
    ])
}

fn pet_type(id: f64, name: &str) -> FieldMap {
    field_map([("id", Value::from(id)), ("name", Value::from(name))])
}

#[allow(dead_code)]
impl MockServer {
    pub fn new() -> Self {
        Self {
            owners: RefCell::new(vec![
                owner(1.0, "Sophia"),
                owner(2.0, "Oliver"),
                owner(3.0, "Mia"),
            ]),
            pets: RefCell::new(vec![
                pet(101.0, 1.0, 10.0, "Whiskers"),
                pet(102.0, 1.0, 20.0, "Rex"),
                pet(103.0, 2.0, 30.0, "Kesha"),
                pet(104.0, 3.0, 10.0, "Tom"),
            ]),
            pet_types: RefCell::new(vec![
                pet_type(10.0, "Cat"),
                pet_type(20.0, "Dog"),
                pet_type(30.0, "Parrot"),
            ]),
            fetch_counts: RefCell::new(HashMap::new()),
            commits: RefCell::new(Vec::new()),
            fail_commits: Cell::new(false),
            hang_commits: Cell::new(false),
            hung_queries: RefCell::new(Vec::new()),
            describe_counts: RefCell::new(HashMap::new()),
            next_pet_id: Cell::new(900),
        }
    }

    /// Number of fetches issued for one query name so far.
    pub fn fetch_count(&self, query: &str) -> usize {
        self.fetch_counts.borrow().get(query).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetch_counts.borrow().values().sum()
    }

    /// Make every subsequent commit fail with a store error.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.set(fail);
    }

    /// Make every subsequent commit hang until cancelled.
    pub fn hang_commits(&self) {
        self.hang_commits.set(true);
    }

    /// Make fetches of the named query hang until cancelled.
    pub fn hang(&self, query: &str) {
        self.hung_queries.borrow_mut().push(query.to_string());
    }

    /// Number of schema lookups issued for one query name so far.
    pub fn describe_count(&self, query: &str) -> usize {
        self.describe_counts
            .borrow()
            .get(query)
            .copied()
            .unwrap_or(0)
    }

    pub fn committed_batches(&self) -> usize {
        self.commits.borrow().len()
    }

    pub fn last_commit(&self) -> Option<Vec<ChangeRecord>> {
        self.commits.borrow().last().cloned()
    }

    /// Current server-side owners dataset.
    pub fn owners(&self) -> Vec<FieldMap> {
        self.owners.borrow().clone()
    }

    /// Current server-side pets dataset.
    pub fn pets(&self) -> Vec<FieldMap> {
        self.pets.borrow().clone()
    }

    fn filtered_pets(&self, bindings: &[(&str, &str)], parameters: &FieldMap) -> Vec<FieldMap> {
        self.pets
            .borrow()
            .iter()
            .filter(|row| {
                bindings.iter().all(|(field, parameter)| {
                    let bound = parameters.get(*parameter).cloned().unwrap_or(Value::Null);
                    row.get(*field)
                        .cloned()
                        .unwrap_or(Value::Null)
                        .loosely_equals(&bound)
                })
            })
            .cloned()
            .collect()
    }

    fn dataset_for(&self, entity: &str) -> Result<&RefCell<Vec<FieldMap>>> {
        match entity {
            "owners" | "all-owners" => Ok(&self.owners),
            "pets" | "pets-of-owner" | "pet-of-owner" => Ok(&self.pets),
            "pet-types" | "all-pet-types" => Ok(&self.pet_types),
            other => Err(MirageError::QueryNotFound {
                query: other.to_string(),
            }),
        }
    }

    fn keys_match(row: &FieldMap, keys: &FieldMap) -> bool {
        keys.iter().all(|(field, value)| {
            row.get(field)
                .cloned()
                .unwrap_or(Value::Null)
                .loosely_equals(value)
        })
    }

    fn apply(&self, change: &ChangeRecord) -> Result<u64> {
        match change {
            ChangeRecord::Insert { entity, data } => {
                self.dataset_for(entity)?.borrow_mut().push(data.clone());
                Ok(1)
            }
            ChangeRecord::Update { entity, keys, data } => {
                let dataset = self.dataset_for(entity)?;
                let mut affected = 0;
                for row in dataset.borrow_mut().iter_mut() {
                    if Self::keys_match(row, keys) {
                        for (field, value) in data {
                            row.insert(field.clone(), value.clone());
                        }
                        affected += 1;
                    }
                }
                Ok(affected)
            }
            ChangeRecord::Delete { entity, keys } => {
                let dataset = self.dataset_for(entity)?;
                let before = dataset.borrow().len();
                dataset
                    .borrow_mut()
                    .retain(|row| !Self::keys_match(row, keys));
                Ok((before - dataset.borrow().len()) as u64)
            }
            ChangeRecord::Command { entity, parameters } => match entity.as_str() {
                "add-pet" => {
                    let bound = |name: &str| parameters.get(name).cloned().unwrap_or(Value::Null);
                    let id = self.next_pet_id.get();
                    self.next_pet_id.set(id + 1);
                    let mut row = FieldMap::new();
                    row.insert("id".to_string(), Value::from(id as f64));
                    row.insert("owner_id".to_string(), bound("ownerKey"));
                    row.insert("type_id".to_string(), bound("typeKey"));
                    row.insert("name".to_string(), bound("name"));
                    self.pets.borrow_mut().push(row);
                    Ok(1)
                }
                other => Err(MirageError::QueryNotFound {
                    query: other.to_string(),
                }),
            },
        }
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Backend for MockServer {
    async fn fetch(
        &self,
        query: &str,
        parameters: &FieldMap,
        _token: &CancellationToken,
    ) -> Result<Vec<FieldMap>> {
        *self
            .fetch_counts
            .borrow_mut()
            .entry(query.to_string())
            .or_insert(0) += 1;
        if self.hung_queries.borrow().iter().any(|q| q == query) {
            // Never responds; the caller is expected to abort the fetch.
            std::future::pending::<()>().await;
        }
        match query {
            "all-owners" => Ok(self.owners.borrow().clone()),
            "all-pet-types" => Ok(self.pet_types.borrow().clone()),
            "pets-of-owner" => Ok(self.filtered_pets(&[("owner_id", "ownerKey")], parameters)),
            "pet-of-owner" => Ok(self.filtered_pets(
                &[("owner_id", "ownerKey"), ("id", "petKey")],
                parameters,
            )),
            other => Err(MirageError::QueryNotFound {
                query: other.to_string(),
            }),
        }
    }

    async fn commit(&self, changes: &[ChangeRecord], _token: &CancellationToken) -> Result<u64> {
        if self.hang_commits.get() {
            std::future::pending::<()>().await;
        }
        if self.fail_commits.get() {
            return Err(MirageError::CommitFailed {
                message: "injected store failure".to_string(),
            });
        }
        let mut affected = 0;
        for change in changes {
            affected += self.apply(change)?;
        }
        self.commits.borrow_mut().push(changes.to_vec());
        Ok(affected)
    }
}

#[async_trait(?Send)]
impl SchemaSource for MockServer {
    async fn describe(
        &self,
        query: &str,
        _token: &CancellationToken,
    ) -> Result<EntityDescriptor> {
        *self
            .describe_counts
            .borrow_mut()
            .entry(query.to_string())
            .or_insert(0) += 1;
        match query {
            "all-owners" => Ok(EntityDescriptor::new("all-owners")
                .with_field(FieldDescriptor::new("id").primary_key())
                .with_field(FieldDescriptor::new("name").described("Owner's display name"))),
            "all-pet-types" => Ok(EntityDescriptor::new("all-pet-types")
                .with_field(FieldDescriptor::new("id").primary_key())
                .with_field(FieldDescriptor::new("name"))),
            "pets-of-owner" => Ok(EntityDescriptor::new("pets-of-owner")
                .with_field(FieldDescriptor::new("id").primary_key())
                .with_field(FieldDescriptor::new("owner_id"))
                .with_field(FieldDescriptor::new("type_id"))
                .with_field(FieldDescriptor::new("name"))
                .with_parameter("ownerKey")),
            "pet-of-owner" => Ok(EntityDescriptor::new("pet-of-owner")
                .with_field(FieldDescriptor::new("id").primary_key())
                .with_field(FieldDescriptor::new("owner_id"))
                .with_field(FieldDescriptor::new("type_id"))
                .with_field(FieldDescriptor::new("name"))
                .with_parameter("ownerKey")
                .with_parameter("petKey")),
            "add-pet" => Ok(EntityDescriptor::new("add-pet")
                .with_parameter("ownerKey")
                .with_parameter("typeKey")
                .with_parameter("name")),
            other => Err(MirageError::QueryNotFound {
                query: other.to_string(),
            }),
        }
    }
}

/// The three-level dependency graph most scenarios run on:
/// `all-owners` feeds `pets-of-owner` (by owner cursor), and both feed
/// `pet-of-owner`.
#[allow(dead_code)]
pub fn pets_graph_model(server: Rc<MockServer>) -> Model {
    let model = Model::new(server);
    model
        .add_entity(Entity::new("all-owners", ["id"]).expect("entity"))
        .expect("add all-owners");
    model
        .add_entity(Entity::new("pets-of-owner", ["id"]).expect("entity"))
        .expect("add pets-of-owner");
    model
        .add_entity(Entity::new("pet-of-owner", ["id"]).expect("entity"))
        .expect("add pet-of-owner");
    model
        .add_relation(Relation::from_field(
            "all-owners",
            "id",
            "pets-of-owner",
            "ownerKey",
        ))
        .expect("owners -> pets");
    model
        .add_relation(Relation::from_field(
            "all-owners",
            "id",
            "pet-of-owner",
            "ownerKey",
        ))
        .expect("owners -> pet-of-owner");
    model
        .add_relation(Relation::from_field(
            "pets-of-owner",
            "id",
            "pet-of-owner",
            "petKey",
        ))
        .expect("pets -> pet-of-owner");
    model
}

/// A purely local two-entity model with a writable owner/pets association.
/// Returns `(model, owners, pets)`.
#[allow(dead_code)]
pub fn local_pets_model(server: Rc<MockServer>) -> (Model, Entity, Entity) {
    let model = Model::new(server);
    let owners = Entity::new("owners", ["id"]).expect("entity");
    let pets = Entity::new("pets", ["id"]).expect("entity");
    model.add_entity(owners.clone()).expect("add owners");
    model.add_entity(pets.clone()).expect("add pets");
    model
        .add_association(
            ReferenceRelation::new("pets", "owner_id", "owners", "id")
                .scalar("owner")
                .collection("pets"),
        )
        .expect("associate");
    (model, owners, pets)
}
