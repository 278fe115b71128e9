//! Error types for rowgraph operations.

use std::fmt;

use crate::object_id::ObjectId;
use crate::state::PersistenceState;

/// The primary error type for all rowgraph operations.
#[derive(Debug)]
pub enum Error {
    /// A DENY delete rule blocked a delete
    DeleteDenied(DeleteDeniedError),
    /// A hollow object could not be resolved to exactly one row
    Fault(FaultError),
    /// The parent channel rejected a commit
    Commit(CommitError),
    /// Static mapping problems (unknown entity, property, prefetch semantics)
    Mapping(MappingError),
    /// Configuration errors
    Config(ConfigError),
    /// Identity map misuse (foreign context, unregistered object)
    Identity(IdentityError),
    /// Illegal lifecycle transition or operation in the wrong state
    State(StateError),
    /// Select execution errors reported by the data source
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Validation errors
    Validation(ValidationError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct DeleteDeniedError {
    pub object_id: ObjectId,
    pub relationship: String,
    pub related_count: usize,
}

#[derive(Debug)]
pub struct FaultError {
    pub object_id: ObjectId,
    pub kind: FaultErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultErrorKind {
    /// No row matched the id
    Missing,
    /// More than one row matched the id
    Ambiguous(usize),
}

#[derive(Debug)]
pub struct CommitError {
    pub kind: CommitErrorKind,
    pub message: String,
    /// Failed row ids, when the data source can tell
    pub failed_ids: Vec<ObjectId>,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitErrorKind {
    /// An update or delete matched no row under its optimistic lock qualifier
    OptimisticLock,
    /// Constraint violation reported by the data source
    Constraint,
    /// Transaction could not be started or finished
    Transaction,
    /// Any other failure
    Failed,
}

#[derive(Debug)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    UnknownEntity,
    UnknownProperty,
    UnknownRelationship,
    /// Prefetch node whose semantics are undefined
    UnknownPrefetchSemantics,
    MissingPrimaryKey,
    InvalidName,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct IdentityError {
    pub kind: IdentityErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityErrorKind {
    /// Object has no id or is not in the identity map
    NotRegistered,
    /// Object belongs to another context
    ForeignContext,
    /// A permanent id was required
    TemporaryId,
}

#[derive(Debug)]
pub struct StateError {
    pub object_id: Option<ObjectId>,
    pub from: PersistenceState,
    pub to: Option<PersistenceState>,
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

/// Validation error for object-level validation before commit.
#[derive(Debug, Clone, Default)]
pub struct ValidationError {
    pub errors: Vec<ValidationFailure>,
}

/// A single failed validation rule.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    /// The object that failed validation
    pub object_id: ObjectId,
    /// Property name, or "__object__" for object-level failures
    pub property: String,
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Mandatory attribute or to-one relationship is null
    Required,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add(
        &mut self,
        object_id: &ObjectId,
        property: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(ValidationFailure {
            object_id: object_id.clone(),
            property: property.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a required property error.
    pub fn add_required(&mut self, object_id: &ObjectId, property: impl Into<String>) {
        self.add(object_id, property, ValidationErrorKind::Required, "is required");
    }

    /// Move all failures of `other` into this container.
    pub fn merge(&mut self, other: ValidationError) {
        self.errors.extend(other.errors);
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Error {
    /// Only optimistic-lock commit failures may succeed when retried after a refresh.
    pub fn is_retryable(&self) -> bool {
        match self.unwind() {
            Error::Commit(c) => c.kind == CommitErrorKind::OptimisticLock,
            _ => false,
        }
    }

    /// Is this a static mapping or configuration bug?
    pub fn is_fatal_mapping(&self) -> bool {
        matches!(self, Error::Mapping(_) | Error::Config(_))
    }

    /// Innermost error of a chain of commit failures.
    pub fn unwind(&self) -> &Error {
        let mut current = self;
        while let Error::Commit(CommitError {
            source: Some(inner),
            ..
        }) = current
        {
            current = inner;
        }
        current
    }

    /// Wrap this error as a commit failure, unless it already is one.
    pub fn into_commit_error(self) -> Error {
        match self {
            Error::Commit(_) => self,
            other => Error::Commit(CommitError {
                kind: CommitErrorKind::Failed,
                message: "commit failed".to_string(),
                failed_ids: Vec::new(),
                source: Some(Box::new(other)),
            }),
        }
    }

    pub fn mapping(kind: MappingErrorKind, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            kind,
            message: message.into(),
        })
    }

    pub fn identity(kind: IdentityErrorKind, message: impl Into<String>) -> Self {
        Error::Identity(IdentityError {
            kind,
            message: message.into(),
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    pub fn illegal_transition(
        object_id: Option<ObjectId>,
        from: PersistenceState,
        to: PersistenceState,
    ) -> Self {
        Error::State(StateError {
            object_id,
            from,
            to: Some(to),
            message: format!("illegal transition {from} -> {to}"),
        })
    }

    pub fn commit(kind: CommitErrorKind, message: impl Into<String>) -> Self {
        Error::Commit(CommitError {
            kind,
            message: message.into(),
            failed_ids: Vec::new(),
            source: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DeleteDenied(e) => write!(f, "Delete denied: {}", e),
            Error::Fault(e) => write!(f, "Fault error: {}", e),
            Error::Commit(e) => write!(f, "Commit error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Identity(e) => write!(f, "Identity error: {}", e.message),
            Error::State(e) => write!(f, "State error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Commit(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for DeleteDeniedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has {} related object(s) in relationship '{}'",
            self.object_id, self.related_count, self.relationship
        )
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FaultErrorKind::Missing => write!(f, "no row found for {}", self.object_id),
            FaultErrorKind::Ambiguous(n) => {
                write!(f, "expected one row for {}, found {}", self.object_id, n)
            }
        }
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(inner) => write!(f, "{}: {}", self.message, inner),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object_id {
            Some(id) => write!(f, "{} ({})", self.message, id),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(
                f,
                "validation error on {}.{}: {}",
                err.object_id, err.property, err.message
            )
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}.{}: {}", err.object_id, err.property, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<DeleteDeniedError> for Error {
    fn from(err: DeleteDeniedError) -> Self {
        Error::DeleteDenied(err)
    }
}

impl From<FaultError> for Error {
    fn from(err: FaultError) -> Self {
        Error::Fault(err)
    }
}

impl From<CommitError> for Error {
    fn from(err: CommitError) -> Self {
        Error::Commit(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for rowgraph operations.
pub type Result<T> = std::result::Result<T, Error>;
