use serde::{Deserialize, Serialize};

use crate::models::Library;

/// The client-visible error taxonomy of the query service.
///
/// Every fallible operation of the engine resolves to one of these kinds;
/// the HTTP surface maps them onto status codes. The budget effect of each
/// kind is fixed: `InvalidQuery` and `Unauthorized` never debit,
/// `ExternalLib` on execution is compensated, `Internal` keeps the debit.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryError {
    /// User input is invalid: malformed payload, unknown dataset, or a
    /// budget pre-check failure.
    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    /// A DP backend rejected or failed on the request.
    #[error("{library} rejected the request: {message}")]
    ExternalLib { library: Library, message: String },

    /// Unknown user, missing access grant, or `may_query = false`.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// The service is at its in-flight or queue capacity; the caller may
    /// retry after a short delay. Never debits.
    #[error("server busy: {message}")]
    Busy { message: String },

    /// Store failure, worker crash, broker fault or timeout. The message is
    /// logged server-side and not exposed to clients.
    #[error("internal server error")]
    Internal { message: String },
}

impl QueryError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    pub fn external(library: Library, message: impl Into<String>) -> Self {
        Self::ExternalLib {
            library,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kind_tag() {
        let err = QueryError::invalid("no such dataset");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "invalid_query");
        assert_eq!(json["message"], "no such dataset");
    }

    #[test]
    fn external_lib_carries_library() {
        let err = QueryError::external(Library::Opendp, "not a measurement");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["library"], "opendp");
    }
}
