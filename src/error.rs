use serde::Serialize;
use thiserror::Error;

use crate::model::SyncSummary;

/// Problems with declared entity metadata. Always fatal and raised before
/// any data is loaded or persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("entity type `{0}` is not registered")]
    UnknownType(String),
    #[error("entity type `{0}` is registered twice")]
    DuplicateType(String),
    #[error("entity type `{0}` declares no identifier fields")]
    NoIdentifiers(String),
    #[error("field `{field}` of `{entity_type}` is declared as both identifier and attribute")]
    IdentifierAttributeOverlap { entity_type: String, field: String },
    #[error("field `{field}` of `{entity_type}` is declared as both {first} and {second}")]
    OverlappingRelation {
        entity_type: String,
        field: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("field `{field}` used by `{entity_type}` is not a declared identifier or attribute")]
    UndeclaredField { entity_type: String, field: String },
    #[error("`{entity_type}` references unregistered entity type `{target}`")]
    UnknownReference { entity_type: String, target: String },
    #[error("`{parent}` does not declare `{child}` as a child type")]
    UndeclaredChild { parent: String, child: String },
    #[error("entity type `{0}` has no persistence table configured")]
    NoPersistenceTarget(String),
    #[error("dependency cycle between entity types: {0}")]
    DependencyCycle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagScope {
    Global,
    Model,
}

impl std::fmt::Display for FlagScope {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FlagScope::Global => write!(f, "global"),
            FlagScope::Model => write!(f, "model"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("there was an attempt to set a non-existing {scope} flag `{name}`")]
pub struct UnknownFlagError {
    pub scope: FlagScope,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error(transparent)]
    UnknownFlag(#[from] UnknownFlagError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity_type} `{unique_id}` is already registered")]
pub struct DuplicateEntityError {
    pub entity_type: String,
    pub unique_id: String,
}

/// A source could not be turned into a complete graph. The partial graph
/// must not be used.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{entity_type} record is missing identifier field `{field}`")]
    MissingIdentifier { entity_type: String, field: String },
    #[error("malformed {entity_type} record: {reason}")]
    Malformed { entity_type: String, reason: String },
    #[error("unknown entity type `{0}` in source data")]
    UnknownType(String),
    #[error("adapter `{0}` was already loaded; build a fresh adapter for every run")]
    AlreadyLoaded(String),
    #[error("failed to fetch source data: {0}")]
    Fetch(#[source] anyhow::Error),
    #[error(transparent)]
    Duplicate(#[from] DuplicateEntityError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Nothing with that identifier or label exists in the graph.
    NotFound,
    /// A short label matched more than one entity.
    Ambiguous,
    /// The entity exists but was never persisted.
    NotPersisted,
}

impl std::fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            UnresolvedReason::NotFound => write!(f, "no such entity"),
            UnresolvedReason::Ambiguous => write!(f, "label matches several entities"),
            UnresolvedReason::NotPersisted => write!(f, "entity has no primary key yet"),
        }
    }
}

/// A relation target could not be mapped to a primary key. Signals that the
/// instruction stream violated its parents-first ordering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot resolve `{field}` of {entity_type} `{unique_id}` to {target_type} `{value}`: {reason}")]
pub struct UnresolvedReferenceError {
    pub entity_type: String,
    pub unique_id: String,
    pub field: String,
    pub target_type: String,
    pub value: String,
    pub reason: UnresolvedReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity_type} `{unique_id}` was rejected by `{table}`: {message}")]
pub struct ValidationError {
    pub entity_type: String,
    pub unique_id: String,
    pub table: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity_type} `{unique_id}`: {reason}")]
pub struct StaleReferenceError {
    pub entity_type: String,
    pub unique_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity_type} `{unique_id}` references {dependency_type} `{dependency}` whose create failed")]
pub struct DependencyFailedError {
    pub entity_type: String,
    pub unique_id: String,
    pub dependency_type: String,
    pub dependency: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table `{0}` is not registered with the store")]
    UnknownTable(String),
    #[error("validation failed on `{table}`: {message}")]
    Validation { table: String, message: String },
    #[error("more than one `{table}` record matches the lookup")]
    MultipleMatches { table: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Duplicate(#[from] DuplicateEntityError),
    #[error(transparent)]
    UnresolvedReference(#[from] UnresolvedReferenceError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    StaleReference(#[from] StaleReferenceError),
    #[error(transparent)]
    DependencyFailed(#[from] DependencyFailedError),
    #[error("persistence backend failure: {0}")]
    Store(#[source] StoreError),
}

impl From<SchemaError> for SyncError {
    fn from(err: SchemaError) -> Self {
        SyncError::Configuration(ConfigurationError::Schema(err))
    }
}

impl SyncError {
    /// Per-record problems that are logged against the entity while the run
    /// carries on with the next instruction.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_) | SyncError::StaleReference(_) | SyncError::DependencyFailed(_)
        )
    }
}

/// A run stopped on a fatal error. Anything applied before the failure
/// stays applied; `summary` lists it.
#[derive(Debug, Error)]
#[error("sync {sync_id} aborted: {error}", sync_id = .summary.sync_id)]
pub struct SyncFailure {
    pub error: SyncError,
    pub summary: Box<SyncSummary>,
}
