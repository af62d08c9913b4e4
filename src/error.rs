//! Error types for the schema-driven chat client.
//!
//! Four error kinds map directly onto the failure points of the engine:
//! a bad or missing schema, a request that violates the schema's own
//! constraints, a transport-level failure, and a response that doesn't
//! match the schema's extraction paths.

use thiserror::Error;

/// Errors raised while loading or validating a [`crate::schema::SchemaDoc`].
#[derive(Error, Debug)]
pub enum SchemaError {
    /// No schema file could be found for the requested provider.
    #[error("schema not found for provider: {0}")]
    NotFound(String),
    /// The schema file exists but isn't valid JSON.
    #[error("malformed schema JSON for provider {provider}: {source}")]
    MalformedJson {
        /// Provider the schema was loaded for.
        provider: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// The schema parsed but failed structural validation.
    #[error("schema validation failed for provider {provider}: {reason}")]
    Invalid {
        /// Provider the schema was loaded for.
        provider: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Filesystem I/O failure while reading a schema file.
    #[error("failed to read schema file {path}: {source}")]
    Io {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised synchronously by [`crate::context::Context`] mutation and
/// request-synthesis operations.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// A parameter name is not declared in the schema.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    /// A parameter value violates its declared kind, range, or enum.
    #[error("parameter {name} out of range or wrong kind: {reason}")]
    ParameterConstraint {
        /// Parameter name.
        name: String,
        /// Human-readable reason.
        reason: String,
    },
    /// A required parameter was set to null.
    #[error("required parameter {0} cannot be null")]
    RequiredParameterNull(String),
    /// A message role is not declared in the schema's role set.
    #[error("unknown message role: {0}")]
    UnknownRole(String),
    /// A model name is not in the schema's available or deprecated lists.
    #[error("unknown model: {0}")]
    UnknownModel(String),
    /// A system message was set but the schema doesn't support one.
    #[error("schema does not support a system message")]
    SystemMessageUnsupported,
    /// An image content part was added but the schema forbids multimodal content.
    #[error("schema does not support multimodal content")]
    MultimodalUnsupported,
    /// The conversation violates the schema's alternating-role rule.
    #[error("consecutive messages with role {0} violate alternating-role constraint")]
    AlternatingRoleViolation(String),
    /// `build_request` was asked to synthesize a request with no messages.
    #[error("cannot build a request with an empty message list")]
    EmptyMessageList,
    /// The schema requires the last message to have a specific role.
    #[error("last message must have role {0}")]
    LastMessageRole(String),
    /// A required field in the request template was left unpopulated.
    #[error("required field missing from request: {0}")]
    MissingRequiredField(String),
    /// `import_state` was given a snapshot for a different provider.
    #[error("state snapshot is for provider {snapshot}, context is bound to {context}")]
    ProviderMismatch {
        /// Provider named in the snapshot.
        snapshot: String,
        /// Provider the context is bound to.
        context: String,
    },
}

/// Errors raised by the HTTP [`crate::sink::HttpSink`] or surfaced from a
/// non-2xx response.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The send was cancelled via the caller's cancellation predicate.
    #[error("request cancelled")]
    Cancelled,
    /// The request exceeded its configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// A non-2xx HTTP status was returned; `message` prefers the schema's
    /// extracted error string over the raw body.
    #[error("transport error (status {status:?}): {message}")]
    Http {
        /// HTTP status code, if one was received.
        status: Option<u16>,
        /// Extracted or raw error message.
        message: String,
    },
    /// The underlying HTTP client failed (DNS, TLS, connection reset, ...).
    #[error("sink error: {0}")]
    Sink(String),
}

/// Errors raised when a successful transport response doesn't match the
/// schema's declared extraction paths.
#[derive(Error, Debug)]
pub enum ResponseShapeError {
    /// A path element could not be resolved against the response JSON.
    #[error("extraction path {path:?} could not be resolved: missing field {missing}")]
    PathNotFound {
        /// The full extraction path that was being walked.
        path: Vec<String>,
        /// The specific segment that failed to resolve.
        missing: String,
    },
    /// The terminal value at the path wasn't a string or content-item array.
    #[error("value at path {0:?} is neither a string nor a content-item array")]
    UnexpectedLeafType(Vec<String>),
    /// A streaming response produced a run of malformed frames longer than
    /// the tolerance threshold.
    #[error("streaming response exceeded malformed-frame tolerance ({0} consecutive)")]
    TooManyMalformedFrames(usize),
}

/// Top-level error type returned from the crate's public API.
#[derive(Error, Debug)]
pub enum Error {
    /// See [`SchemaError`].
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// See [`ValidationError`].
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// See [`ResponseShapeError`].
    #[error(transparent)]
    ResponseShape(#[from] ResponseShapeError),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
