use thiserror::Error;

/// Result type alias using MirageError
pub type Result<T> = std::result::Result<T, MirageError>;

/// Canonical error kind taxonomy
///
/// Every error classifies into one of these kinds. Configuration errors are
/// fatal to the detecting call and never retried; integrity errors report a
/// caller/data fault on the triggering operation; transport errors are
/// recovered locally (state machines settle) and re-surfaced; cancellations
/// are transport-shaped but distinguishable; listener errors are isolated and
/// logged, never propagated past the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Integrity,
    Transport,
    Cancellation,
    Listener,
    Internal,
}

/// Comprehensive error taxonomy for engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MirageError {
    // ===== Configuration Errors =====
    /// Entity constructed without a query name
    #[error("Entity query name must not be empty")]
    EmptyQueryName,

    /// Keyed entity constructed without key fields
    #[error("Entity '{entity}' requires at least one key field")]
    MissingKeyFields { entity: String },

    /// Key-based retrieval attempted on an entity with no key fields
    #[error("Entity '{entity}' has no key fields; key lookups are unsupported")]
    KeylessEntity { entity: String },

    /// Supplied key values do not match the configured key fields
    #[error("Key arity mismatch on entity '{entity}': {expected} key field(s), {supplied} value(s) supplied")]
    KeyArityMismatch {
        entity: String,
        expected: usize,
        supplied: usize,
    },

    /// Reference relation with unequal left/right field counts
    #[error("Reference arity mismatch between '{left_entity}' and '{right_entity}': {left_fields} left field(s) vs {right_fields} right field(s)")]
    ReferenceArityMismatch {
        left_entity: String,
        right_entity: String,
        left_fields: usize,
        right_fields: usize,
    },

    /// Entity registered twice under one name
    #[error("Entity already registered: {entity}")]
    DuplicateEntity { entity: String },

    /// Relation or operation names an entity the model does not own
    #[error("Unknown entity: {entity}")]
    UnknownEntity { entity: String },

    /// Navigation property name not installed on the entity
    #[error("Unknown navigation '{property}' on entity '{entity}'")]
    UnknownNavigation { entity: String, property: String },

    /// start() called while a fetch is already in flight
    #[error("Entity '{entity}' is already pending; await or cancel the current operation first")]
    AlreadyPending { entity: String },

    /// start() called on a valid entity without invalidating first
    #[error("Entity '{entity}' is already valid; invalidate it before starting")]
    AlreadyValid { entity: String },

    /// Graph-wide operation requested while another is still in progress
    #[error("Cannot start a new data querying process while entity '{entity}' is pending")]
    RequeryInProgress { entity: String },

    /// Operation requires the entity to be registered with a model
    #[error("Entity '{entity}' is not attached to a model")]
    DetachedEntity { entity: String },

    /// Configured key fields disagree with the declared schema
    #[error("Key fields of entity '{entity}' disagree with its schema: configured {configured:?}, declared {declared:?}")]
    KeyFieldMismatch {
        entity: String,
        configured: Vec<String>,
        declared: Vec<String>,
    },

    /// Invalid entities remained but none became eligible (dependency cycle)
    #[error("Entities with unsatisfiable dependencies: {entities:?}")]
    UnsatisfiableDependencies { entities: Vec<String> },

    // ===== Integrity Errors =====
    /// More than one record matched a full key lookup
    #[error("Duplicate key in entity '{entity}': {key}")]
    DuplicateKey { entity: String, key: String },

    /// Non-null foreign value resolving to zero target records
    #[error("Unresolved reference '{target} ({value})' in entity '{entity}', field '{field}'")]
    UnresolvedReference {
        entity: String,
        field: String,
        target: String,
        value: String,
    },

    // ===== Transport Errors =====
    /// The fetch collaborator does not know the query name
    #[error("Query not found: {query}")]
    QueryNotFound { query: String },

    /// Fetch collaborator failure for one entity
    #[error("Fetch failed for entity '{entity}': {message}")]
    FetchFailed { entity: String, message: String },

    /// Commit collaborator failure
    #[error("Commit failed: {message}")]
    CommitFailed { message: String },

    /// Cooperative cancellation observed by an in-flight operation
    #[error("Operation '{op}' was cancelled")]
    Cancelled { op: String },

    /// Composite failure aggregating every per-entity failure of a requery
    #[error("Requery completed with {} failure(s)", reasons.len())]
    RequeryFailed { reasons: Vec<MirageError> },

    // ===== Listener Errors =====
    /// Raised by a change/before-change/spliced listener; isolated and logged
    #[error("Listener failed during '{event}': {detail}")]
    ListenerFailed { event: String, detail: String },

    // ===== Internal Errors =====
    /// Serialization failure crossing the collaborator boundary
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Invariant breakage that has no external cause
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MirageError {
    /// Classify this error into the canonical taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            MirageError::EmptyQueryName
            | MirageError::MissingKeyFields { .. }
            | MirageError::KeylessEntity { .. }
            | MirageError::KeyArityMismatch { .. }
            | MirageError::ReferenceArityMismatch { .. }
            | MirageError::DuplicateEntity { .. }
            | MirageError::UnknownEntity { .. }
            | MirageError::UnknownNavigation { .. }
            | MirageError::AlreadyPending { .. }
            | MirageError::AlreadyValid { .. }
            | MirageError::RequeryInProgress { .. }
            | MirageError::DetachedEntity { .. }
            | MirageError::KeyFieldMismatch { .. }
            | MirageError::UnsatisfiableDependencies { .. } => ErrorKind::Configuration,

            MirageError::DuplicateKey { .. } | MirageError::UnresolvedReference { .. } => {
                ErrorKind::Integrity
            }

            MirageError::QueryNotFound { .. }
            | MirageError::FetchFailed { .. }
            | MirageError::CommitFailed { .. }
            | MirageError::RequeryFailed { .. } => ErrorKind::Transport,

            MirageError::Cancelled { .. } => ErrorKind::Cancellation,

            MirageError::ListenerFailed { .. } => ErrorKind::Listener,

            MirageError::Serialization { .. } | MirageError::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Get the stable error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            MirageError::EmptyQueryName => "ERR_EMPTY_QUERY_NAME",
            MirageError::MissingKeyFields { .. } => "ERR_MISSING_KEY_FIELDS",
            MirageError::KeylessEntity { .. } => "ERR_KEYLESS_ENTITY",
            MirageError::KeyArityMismatch { .. } => "ERR_KEY_ARITY_MISMATCH",
            MirageError::ReferenceArityMismatch { .. } => "ERR_REFERENCE_ARITY_MISMATCH",
            MirageError::DuplicateEntity { .. } => "ERR_DUPLICATE_ENTITY",
            MirageError::UnknownEntity { .. } => "ERR_UNKNOWN_ENTITY",
            MirageError::UnknownNavigation { .. } => "ERR_UNKNOWN_NAVIGATION",
            MirageError::AlreadyPending { .. } => "ERR_ALREADY_PENDING",
            MirageError::AlreadyValid { .. } => "ERR_ALREADY_VALID",
            MirageError::RequeryInProgress { .. } => "ERR_REQUERY_IN_PROGRESS",
            MirageError::DetachedEntity { .. } => "ERR_DETACHED_ENTITY",
            MirageError::KeyFieldMismatch { .. } => "ERR_KEY_FIELD_MISMATCH",
            MirageError::UnsatisfiableDependencies { .. } => "ERR_UNSATISFIABLE_DEPENDENCIES",
            MirageError::DuplicateKey { .. } => "ERR_DUPLICATE_KEY",
            MirageError::UnresolvedReference { .. } => "ERR_UNRESOLVED_REFERENCE",
            MirageError::QueryNotFound { .. } => "ERR_QUERY_NOT_FOUND",
            MirageError::FetchFailed { .. } => "ERR_FETCH_FAILED",
            MirageError::CommitFailed { .. } => "ERR_COMMIT_FAILED",
            MirageError::Cancelled { .. } => "ERR_CANCELLED",
            MirageError::RequeryFailed { .. } => "ERR_REQUERY_FAILED",
            MirageError::ListenerFailed { .. } => "ERR_LISTENER_FAILED",
            MirageError::Serialization { .. } => "ERR_SERIALIZATION",
            MirageError::Internal { .. } => "ERR_INTERNAL",
        }
    }

    /// True when the error (or, for a composite, any aggregated reason)
    /// carries a cancellation
    pub fn is_cancellation(&self) -> bool {
        match self {
            MirageError::Cancelled { .. } => true,
            MirageError::RequeryFailed { reasons } => {
                reasons.iter().any(MirageError::is_cancellation)
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for MirageError {
    fn from(err: serde_json::Error) -> Self {
        MirageError::Serialization {
            message: err.to_string(),
        }
    }
}
