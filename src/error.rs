use ulid::Ulid;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Internal,
}

#[derive(Debug)]
pub enum Error {
    /// Malformed input, business rule violation or authorization failure.
    Validation(String),
    NotFound { entity: &'static str, id: String },
    /// Candidate range overlaps the given confirmed reservation.
    Overlap(Ulid),
    Conflict(String),
    /// Lost an insert race on a unique value. Retried internally.
    UniqueViolation(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::LimitExceeded(_) => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Overlap(_) | Error::Conflict(_) | Error::UniqueViolation(_) => ErrorKind::Conflict,
            Error::WalError(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_overlap(&self) -> bool {
        matches!(self, Error::Overlap(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "validation failed: {msg}"),
            Error::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Error::Overlap(id) => write!(f, "overlaps confirmed reservation: {id}"),
            Error::Conflict(msg) => write!(f, "conflict: {msg}"),
            Error::UniqueViolation(what) => write!(f, "unique value already taken: {what}"),
            Error::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            Error::WalError(e) => write!(f, "WAL error: {e}"),
            Error::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for Error {}
