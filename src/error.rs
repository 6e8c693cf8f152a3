//! Unified error handling for the street-matcher library.
//!
//! Lookups and geometry slicing report absence through `Option` so callers can
//! probe speculatively. The variants here cover the failures that abort a call:
//! bad queries, graph lifecycle violations, build failures and I/O.

use std::fmt;
use std::sync::PoisonError;

/// Unified error type for street-matcher operations.
#[derive(Debug, Clone)]
pub enum MatchError {
    /// Unknown object id
    NotFound { kind: String, id: String },
    /// Spatial query issued against an object type that has no spatial index
    InvalidQuery { message: String },
    /// Match or route query before the graph reached `Ready`
    GraphNotBuilt { identity: String, state: String },
    /// Slice bounds outside the reference
    GeometrySliceOutOfRange {
        reference_id: String,
        start: f64,
        end: f64,
    },
    /// Routing engine build/open/match failure
    RoutingEngineFailure {
        identity: String,
        path: String,
        message: String,
    },
    /// Bridge store entry could not be read or parsed
    CacheCorruption { key: String, message: String },
    /// Tile could not be fetched
    TileFetch { path: String, message: String },
    /// Tile bytes could not be decoded
    TileDecode { path: String, message: String },
    /// Persistence/storage error
    Persistence { message: String },
    /// Configuration error
    Config { message: String },
    /// Malformed probe input
    InvalidInput { message: String },
    /// Generic internal error
    Internal { message: String },
}

impl fmt::Display for MatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchError::NotFound { kind, id } => write!(f, "Unknown {} '{}'", kind, id),
            MatchError::InvalidQuery { message } => write!(f, "Invalid query: {}", message),
            MatchError::GraphNotBuilt { identity, state } => {
                write!(f, "Graph '{}' is not built (state: {})", identity, state)
            }
            MatchError::GeometrySliceOutOfRange {
                reference_id,
                start,
                end,
            } => {
                write!(
                    f,
                    "Slice [{:.2}, {:.2}] is out of range for reference '{}'",
                    start, end, reference_id
                )
            }
            MatchError::RoutingEngineFailure {
                identity,
                path,
                message,
            } => {
                write!(
                    f,
                    "Routing engine failed for graph '{}' at {}: {}",
                    identity, path, message
                )
            }
            MatchError::CacheCorruption { key, message } => {
                write!(f, "Corrupt cache entry '{}': {}", key, message)
            }
            MatchError::TileFetch { path, message } => {
                write!(f, "Failed to fetch tile {}: {}", path, message)
            }
            MatchError::TileDecode { path, message } => {
                write!(f, "Failed to decode tile {}: {}", path, message)
            }
            MatchError::Persistence { message } => write!(f, "Persistence error: {}", message),
            MatchError::Config { message } => write!(f, "Configuration error: {}", message),
            MatchError::InvalidInput { message } => write!(f, "Invalid input: {}", message),
            MatchError::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for MatchError {}

impl From<std::io::Error> for MatchError {
    fn from(e: std::io::Error) -> Self {
        MatchError::Persistence {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for MatchError {
    fn from(e: serde_json::Error) -> Self {
        MatchError::InvalidInput {
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for MatchError {
    fn from(e: rusqlite::Error) -> Self {
        MatchError::Persistence {
            message: e.to_string(),
        }
    }
}

/// Result type alias for street-matcher operations.
pub type Result<T> = std::result::Result<T, MatchError>;

/// Extension trait for converting Option to MatchError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a not-found error.
    fn ok_or_not_found(self, kind: &str, id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, kind: &str, id: &str) -> Result<T> {
        self.ok_or_else(|| MatchError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        })
    }
}

/// Extension trait for lock results: poisoning becomes an internal error.
pub trait LockResultExt<T> {
    fn or_poisoned(self, lock: &str) -> Result<T>;
}

impl<T, G> LockResultExt<T> for std::result::Result<T, PoisonError<G>> {
    fn or_poisoned(self, lock: &str) -> Result<T> {
        self.map_err(|_| MatchError::Internal {
            message: format!("{} lock poisoned", lock),
        })
    }
}
