//! Async client for the Book API, a tabular-data web service.
//!
//! # Overview
//! A `Book` wraps one authenticated session: it fetches table and field
//! metadata, reads (optionally filtered) row data, creates or updates rows
//! singly or in pages, and uploads file attachments.
//!
//! # Design
//! - `BookClient` is stateless: `build_*` produces an `HttpRequest`,
//!   `parse_*` consumes an `HttpResponse`. It never touches the network.
//! - `Transport` executes requests; `ReqwestTransport` is the HTTP one.
//! - `Book` owns the client, the transport and the session caches
//!   (tables, table values, user mapping). Caches are read-through and never
//!   invalidated; start a new `Book` for fresh data.
//! - Batched writes go out in pages of `WRITE_BATCH_SIZE`; a page rejected
//!   with a server deadlock is resent unchanged per `RetryPolicy`.

pub mod book;
pub mod client;
pub mod error;
pub mod filter;
pub mod http;
pub mod session;
pub mod transport;
pub mod types;

pub use book::{Book, WRITE_BATCH_SIZE};
pub use client::{BookClient, PageOutcome};
pub use error::ApiError;
pub use filter::{FilterClause, FilterConfig, ViewFilter};
pub use http::{FilePart, HttpRequest, HttpResponse, RequestBody};
pub use session::{AdminOverride, RetryPolicy, Session};
pub use transport::{ReqwestTransport, Transport};
pub use types::{
    BatchReport, Field, FieldValues, FileUpload, RowBatch, RowId, RowUpsert, Table, TableValues,
    UserMapping,
};
