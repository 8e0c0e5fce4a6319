//! Error types and handling
//!
//! One variant family per bucket of the error taxonomy: schema, parameter,
//! credential, driver, output, and persistence errors. A `Driver` error means
//! the driver could not attempt execution at all; a container that ran and
//! failed is reported through `OperationResult::error` and a `failed` claim
//! result, not through this enum.

use thiserror::Error;

/// Domain errors for the CNAB runtime core.
#[derive(Error, Debug)]
pub enum CnabError {
    /// Malformed bundle document, invalid semver, or a type mismatch caught
    /// at parse/validate time.
    #[error("schema error: {message}")]
    Schema { message: String },

    /// I/O failure while reading or writing a bundle document.
    #[error("failed to read bundle: {source}")]
    SchemaIo {
        #[from]
        source: std::io::Error,
    },

    /// Missing required parameter, immutable violation, coercion failure, or
    /// definition-validation failure.
    #[error("parameter error: {message}")]
    Parameter { message: String },

    /// Missing required credential for a non-stateless action.
    #[error("credential error: {message}")]
    Credential { message: String },

    /// Daemon unreachable, image pull failure, container start failure,
    /// timeout, or digest mismatch — surfaced when the driver could not
    /// attempt (or complete attempting) execution.
    #[error("driver error: {message}")]
    Driver { message: String },

    /// Required output missing with no default, or output type-validation
    /// failure.
    #[error("output error: {message}")]
    Output { message: String },

    /// Claim-store read/write failure.
    #[error("claim store error: {message}")]
    StoreCorrupt { message: String },
}

/// Convenience type alias for Results with [`CnabError`].
pub type Result<T> = std::result::Result<T, CnabError>;

impl CnabError {
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub fn parameter(message: impl Into<String>) -> Self {
        Self::Parameter {
            message: message.into(),
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential {
            message: message.into(),
        }
    }

    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    pub fn output(message: impl Into<String>) -> Self {
        Self::Output {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreCorrupt {
            message: message.into(),
        }
    }
}
