//! Error types for the Book API client.
//!
//! # Design
//! A single `ApiError` travels through every operation. The server reports
//! failures in-band (`status != "ok"`), so most variants carry the server's
//! own message or the raw payload. Lookups over the session cache get
//! dedicated variants because callers frequently distinguish "the code does
//! not exist" from "the server said no." Transport failures pass through
//! unchanged.

use thiserror::Error;

/// Errors returned by `BookClient` parse methods and `Book` operations.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The server answered with a non-"ok" status and an `errorMsg`.
    #[error("{0}")]
    Server(String),

    /// The server answered with a non-"ok" status; the raw payload is kept.
    #[error("request rejected by server: {0}")]
    Rejected(String),

    /// A metadata lookup ran before `fetch_tables`.
    #[error("no tables yet. please use fetch_tables before {0}")]
    TablesNotFetched(&'static str),

    #[error("no table found with code {0}")]
    TableNotFound(String),

    #[error("no field found with code {field_code} for table with code {table_code}")]
    FieldNotFound {
        table_code: String,
        field_code: String,
    },

    /// A filter clause names a field code the table does not have.
    #[error("could not find a filter config for field {0}")]
    FilterFieldNotFound(String),

    /// More than one row matched a key that should be unique.
    #[error("found {count} records for key {key}")]
    AmbiguousMatch { count: usize, key: String },

    /// A single-row write did not come back with exactly one row.
    #[error("unable to identify new row id")]
    UnidentifiedRow,

    #[error("gave up after {attempts} deadlock retries: {payload}")]
    DeadlockRetriesExhausted { attempts: u32, payload: String },

    #[error("could not resolve user mapping")]
    UserMappingUnresolved,

    #[error("call get_user_mapping before calling get_mapped_user")]
    UserMappingNotLoaded,

    #[error("could not find a mapped id for user {0}")]
    MappedUserNotFound(String),

    #[error("attempt to upload an empty file: {0}")]
    EmptyFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP round-trip itself failed (connect, timeout, TLS, ...).
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server returned a non-2xx HTTP status.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body could not be deserialized into the expected type.
    #[error("deserialization failed: {0}")]
    DeserializationError(String),

    /// A request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    SerializationError(String),
}
