//! Session object for one authenticated book connection.
//!
//! # Design
//! `Book` pairs a stateless `BookClient` with a `Transport` and owns the
//! session caches: table metadata, per-table values and the user mapping.
//! The caches are read-through and never invalidated; a caller that needs
//! fresh data starts a new `Book`. Operations that fill a cache take
//! `&mut self`, so calls against one instance are serialized by the borrow
//! checker.
//!
//! Batched writes are the only looping operation: pages of at most
//! `WRITE_BATCH_SIZE` rows go out one at a time, and a page the server
//! rejects with a deadlock is resent unchanged according to the
//! `RetryPolicy`.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::{BookClient, PageOutcome, UploadRequest, UPLOAD_FILE_FIELD};
use crate::error::ApiError;
use crate::filter::{build_filter_config, FilterClause, FilterConfig, ViewFilter};
use crate::http::{FilePart, HttpRequest};
use crate::session::{RetryPolicy, Session};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{
    is_truthy, value_to_key, BatchReport, Field, FieldValues, FileUpload, RowBatch, RowId,
    RowUpsert, Table, TableValues, UserMapping,
};

/// Maximum number of rows sent in one `createOrUpdateTableRows` call.
pub const WRITE_BATCH_SIZE: usize = 200;

/// One authenticated connection to a book, with its session caches.
pub struct Book<T: Transport = ReqwestTransport> {
    client: BookClient,
    transport: T,
    retry: RetryPolicy,
    tables: Option<Vec<Table>>,
    table_values: HashMap<i64, TableValues>,
    user_mapping: Option<UserMapping>,
}

impl Book<ReqwestTransport> {
    /// Session over HTTP with the default timeout and retry policy.
    pub fn connect(session: Session) -> Result<Self, ApiError> {
        Ok(Self::with_transport(session, ReqwestTransport::new()?))
    }
}

impl<T: Transport> Book<T> {
    pub fn with_transport(session: Session, transport: T) -> Self {
        Self {
            client: BookClient::new(session),
            transport,
            retry: RetryPolicy::default(),
            tables: None,
            table_values: HashMap::new(),
            user_mapping: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn session(&self) -> &Session {
        self.client.session()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Cached table metadata, if `fetch_tables` has run.
    pub fn tables(&self) -> Option<&[Table]> {
        self.tables.as_deref()
    }

    pub fn cached_table_values(&self, table_id: i64) -> Option<&TableValues> {
        self.table_values.get(&table_id)
    }

    pub fn user_mapping(&self) -> Option<&UserMapping> {
        self.user_mapping.as_ref()
    }

    /// Load the book's user tables (system and pivot categories excluded)
    /// into the metadata cache.
    pub async fn fetch_tables(&mut self) -> Result<&[Table], ApiError> {
        let request = self.client.build_get_book_tables();
        let response = self.transport.execute(request).await?;
        let tables = self.client.parse_get_book_tables(response)?;
        debug!(count = tables.len(), "fetched tables");
        let tables: &[Table] = self.tables.insert(tables);
        Ok(tables)
    }

    /// First cached table whose code is `code`.
    pub fn get_table_with_code(&self, code: &str) -> Result<&Table, ApiError> {
        let tables = self
            .tables
            .as_ref()
            .ok_or(ApiError::TablesNotFetched("get_table_with_code"))?;
        tables
            .iter()
            .find(|t| t.code.as_deref() == Some(code))
            .ok_or_else(|| ApiError::TableNotFound(code.to_string()))
    }

    pub fn get_field_with_fixed_code(&self, table_code: &str, field_code: &str) -> Result<&Field, ApiError> {
        self.get_table_with_code(table_code)?
            .field_with_fixed_code(field_code)
            .ok_or_else(|| ApiError::FieldNotFound {
                table_code: table_code.to_string(),
                field_code: field_code.to_string(),
            })
    }

    /// Row data of a table.
    ///
    /// Without a filter a cached entry is returned as is. A filtered fetch
    /// always goes to the server and replaces the cached entry for the table.
    pub async fn fetch_table_values(
        &mut self,
        table_id: i64,
        filter: Option<&ViewFilter>,
    ) -> Result<&TableValues, ApiError> {
        if filter.is_some() || !self.table_values.contains_key(&table_id) {
            let request = self.client.build_get_table_values(table_id, filter)?;
            let response = self.transport.execute(request).await?;
            let values = self.client.parse_get_table_values(response)?;
            debug!(table_id, filtered = filter.is_some(), "fetched table values");
            self.table_values.insert(table_id, values);
        } else {
            debug!(table_id, "table values served from cache");
        }
        Ok(&self.table_values[&table_id])
    }

    /// Filter over `table` built from fixed-code clauses.
    pub fn get_filter_config(
        &self,
        table: &Table,
        clauses: &[FilterClause],
        operator: Option<&str>,
    ) -> Result<FilterConfig, ApiError> {
        build_filter_config(table, clauses, operator)
    }

    /// Write `upsert.field_values` to the row whose key field equals the key
    /// value, creating the row when none matches. Returns the server row id.
    pub async fn create_or_update_row(&mut self, upsert: RowUpsert) -> Result<RowId, ApiError> {
        let RowUpsert {
            table_id,
            key_field_id,
            key_value,
            field_values,
        } = upsert;
        debug!(table_id, key_field_id, key = %value_to_key(&key_value), "create_or_update_row");

        let filter = ViewFilter::equals(key_field_id, key_value.clone());
        let values = self.fetch_table_values(table_id, Some(&filter)).await?;
        let row_id = resolve_row_id(values, &key_value)?;
        self.create_or_update_row_with_id(&row_id, field_values).await
    }

    /// Write `field_values` to `row_id`; a temporary id creates a new row.
    pub async fn create_or_update_row_with_id(
        &self,
        row_id: &RowId,
        mut field_values: FieldValues,
    ) -> Result<RowId, ApiError> {
        field_values.remove("rowId");
        let request = self.client.build_create_or_update_row(row_id, &field_values)?;
        let response = self.transport.execute(request).await?;
        let id = self.client.parse_create_or_update_row(response)?;
        debug!(requested = %row_id, written = %id, "row written");
        Ok(id)
    }

    /// Write every entry of `rows` in pages of up to `WRITE_BATCH_SIZE`.
    ///
    /// Committed pages are removed from `rows` as the loop progresses, so on
    /// error `rows` holds exactly the entries that were not written.
    pub async fn create_or_update_rows(&self, rows: &mut RowBatch) -> Result<BatchReport, ApiError> {
        info!(rows = rows.len(), "create_or_update_rows");
        let mut report = BatchReport::default();

        while !rows.is_empty() {
            let page_len = rows.len().min(WRITE_BATCH_SIZE);
            let page: RowBatch = rows
                .iter()
                .take(page_len)
                .map(|(id, values)| (id.clone(), values.clone()))
                .collect();
            debug!(remaining = rows.len(), page = page_len, "sending page");

            let request = self.client.build_create_or_update_rows(&page)?;
            report.deadlock_retries += self.send_page(request).await?;

            rows.drain(..page_len);
            report.pages += 1;
            report.rows += page_len;
        }

        info!(pages = report.pages, rows = report.rows, retries = report.deadlock_retries, "rows written");
        Ok(report)
    }

    /// Send one page until the server commits it. Returns the number of
    /// deadlock retries it took.
    async fn send_page(&self, request: HttpRequest) -> Result<u32, ApiError> {
        let mut retries = 0u32;
        loop {
            let response = self.transport.execute(request.clone()).await?;
            match self.client.parse_create_or_update_rows(response)? {
                PageOutcome::Committed => return Ok(retries),
                PageOutcome::Deadlock(payload) => {
                    if !self.retry.allows(retries + 1) {
                        return Err(ApiError::DeadlockRetriesExhausted {
                            attempts: retries,
                            payload,
                        });
                    }
                    retries += 1;
                    let delay = self.retry.backoff(retries);
                    warn!(attempt = retries, delay_ms = delay.as_millis() as u64, "server deadlock, resending page");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Attach a file to one field of one row. Returns the server response.
    ///
    /// The whole file is read into memory before the request is built, so
    /// peak memory grows with the file size.
    pub async fn upload_file(&self, upload: FileUpload) -> Result<Value, ApiError> {
        let metadata = tokio::fs::metadata(&upload.path).await?;
        if metadata.len() == 0 {
            return Err(ApiError::EmptyFile(upload.path.display().to_string()));
        }
        let field_id = self
            .get_field_with_fixed_code(&upload.table_code, &upload.field_fixed_code)?
            .id;

        let file_name = upload.file_name.unwrap_or_else(|| {
            upload
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string())
        });
        let content_type = upload.content_type.unwrap_or_else(|| {
            mime_guess::from_path(&upload.path)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });
        let uuid = upload.uuid.unwrap_or_else(uuid::Uuid::new_v4);
        let bytes = tokio::fs::read(&upload.path).await?;

        info!(
            file = %upload.path.display(),
            size = bytes.len(),
            row_id = %upload.row_id,
            field_id,
            %uuid,
            "uploading file"
        );

        let request = self.client.build_file_upload(UploadRequest {
            uuid,
            row_id: upload.row_id,
            field_id,
            file: FilePart {
                name: UPLOAD_FILE_FIELD.to_string(),
                file_name,
                content_type,
                bytes,
            },
        });
        let response = self.transport.execute(request).await?;
        self.client.parse_file_upload(response)
    }

    /// Mapping from `mapped_user_field_code` values to `user_field_code`
    /// values in the table `mapping_table_code`, computed once per session.
    pub async fn get_user_mapping(
        &mut self,
        mapping_table_code: &str,
        user_field_code: &str,
        mapped_user_field_code: &str,
    ) -> Result<&UserMapping, ApiError> {
        if self.user_mapping.is_none() {
            let table_id = self.get_table_with_code(mapping_table_code)?.id;
            let values = self.fetch_table_values(table_id, None).await?;
            let mapping = build_user_mapping(values, user_field_code, mapped_user_field_code)?;
            debug!(entries = mapping.len(), "user mapping resolved");
            self.user_mapping = Some(mapping);
        }
        self.user_mapping.as_ref().ok_or(ApiError::UserMappingUnresolved)
    }

    /// Key of the mapping entry whose value is `user_code` (the session user
    /// when `None`), compared case-insensitively.
    pub fn get_mapped_user(&self, user_code: Option<&str>) -> Result<&str, ApiError> {
        let user_code = user_code.unwrap_or(&self.session().u_c);
        let mapping = self.user_mapping.as_ref().ok_or(ApiError::UserMappingNotLoaded)?;
        let wanted = user_code.to_lowercase();
        mapping
            .iter()
            .find(|(_, value)| matches!(value, Value::String(s) if s.to_lowercase() == wanted))
            .map(|(key, _)| key.as_str())
            .ok_or_else(|| ApiError::MappedUserNotFound(user_code.to_string()))
    }
}

/// Pick the row an upsert targets from the filtered values of its table.
///
/// The first column decides: no values means a new row (temporary id built
/// from `key`), one value means that row, more is ambiguous.
pub fn resolve_row_id(values: &TableValues, key: &Value) -> Result<RowId, ApiError> {
    let matches = values
        .fields
        .first()
        .map(|column| column.values.as_slice())
        .unwrap_or_default();
    match matches {
        [] => Ok(RowId::temp_for(key)),
        [row] => Ok(row.id.clone()),
        _ => Err(ApiError::AmbiguousMatch {
            count: matches.len(),
            key: value_to_key(key),
        }),
    }
}

/// Zip the `mapped_user_field_code` column (keys) with the `user_field_code`
/// column (values). Rows with an empty key are skipped.
pub fn build_user_mapping(
    values: &TableValues,
    user_field_code: &str,
    mapped_user_field_code: &str,
) -> Result<UserMapping, ApiError> {
    let users = values
        .column_with_fixed_code(user_field_code)
        .map(|c| c.values.as_slice())
        .unwrap_or_default();
    let keys = values
        .column_with_fixed_code(mapped_user_field_code)
        .map(|c| c.values.as_slice())
        .unwrap_or_default();
    if users.is_empty() || keys.len() != users.len() {
        return Err(ApiError::UserMappingUnresolved);
    }
    Ok(keys
        .iter()
        .zip(users)
        .filter(|(key, _)| is_truthy(Some(&key.value)))
        .map(|(key, user)| (value_to_key(&key.value), user.value.clone()))
        .collect())
}
