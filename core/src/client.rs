//! Stateless request builder and response parser for the Book API.
//!
//! # Design
//! `BookClient` holds only the `Session` and carries no mutable state between
//! calls. Each remote operation is split into a `build_*` method that produces
//! an `HttpRequest` and a `parse_*` method that consumes an `HttpResponse`.
//! `Book` drives the two halves through a `Transport` and owns the caches.
//!
//! Every request is a POST to the session endpoint with a `req` field naming
//! the operation plus the identity fields `version`, `o_u`, `u_c`, `sesskey`.
//! Nested payloads travel as JSON text inside their form field.

use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::filter::ViewFilter;
use crate::http::{FilePart, HttpRequest, HttpResponse, RequestBody};
use crate::session::Session;
use crate::types::{value_to_key, FieldValues, RowBatch, RowId, Table, TableValues, WrittenRow};

pub const REQ_GET_TABLES: &str = "getBookTables";
pub const REQ_GET_VALUES: &str = "getTableValues";
pub const REQ_CREATE_OR_UPDATE_ROW: &str = "createOrUpdateTableRow";
pub const REQ_CREATE_OR_UPDATE_ROWS: &str = "createOrUpdateTableRows";
pub const REQ_FILE_UPLOAD: &str = "fileUpload";

/// Multipart field the server reads an uploaded file from.
pub const UPLOAD_FILE_FIELD: &str = "qqfile";

const STATUS_OK: &str = "ok";
const DEADLOCK_MARKER: &str = "Deadlock";

/// Result of sending one page of a batched write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Every row of the page was written.
    Committed,
    /// The server hit a deadlock; the page should be resent unchanged.
    /// Carries the raw payload.
    Deadlock(String),
}

/// Everything `build_file_upload` needs once the field id is known.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub uuid: uuid::Uuid,
    pub row_id: RowId,
    pub field_id: i64,
    pub file: FilePart,
}

/// Status envelope shared by every response. Read loosely: a status or
/// message of an unexpected JSON type still yields the server-failure error.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Value,
    #[serde(rename = "errorMsg", default)]
    error_msg: Value,
    #[serde(default)]
    error: Option<Value>,
}

impl Envelope {
    fn is_ok(&self) -> bool {
        self.status.as_str() == Some(STATUS_OK)
    }

    fn server_error(&self) -> ApiError {
        match &self.error_msg {
            Value::Null => ApiError::Server(format!(
                "server reported status {}",
                match &self.status {
                    Value::Null => "<missing>".to_string(),
                    status => value_to_key(status),
                }
            )),
            msg => ApiError::Server(value_to_key(msg)),
        }
    }

    fn is_deadlock(&self) -> bool {
        match &self.error {
            Some(Value::String(s)) => s.contains(DEADLOCK_MARKER),
            _ => false,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTablesBody {
    book_tables: BookTables,
}

#[derive(Deserialize)]
struct BookTables {
    #[serde(default)]
    categories: Vec<Table>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableValuesBody {
    table_values: TableValues,
}

#[derive(Deserialize)]
struct RowsBody {
    #[serde(default)]
    rows: Option<Vec<WrittenRow>>,
}

/// Stateless client for the Book API.
///
/// Builds `HttpRequest` values and parses `HttpResponse` values without
/// touching the network.
#[derive(Debug, Clone)]
pub struct BookClient {
    session: Session,
}

impl BookClient {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// `req` plus the identity fields common to every operation.
    fn base_fields(&self, req: &str) -> Vec<(String, String)> {
        let user = self.session.effective_user();
        vec![
            ("req".to_string(), req.to_string()),
            ("version".to_string(), self.session.version.clone()),
            ("o_u".to_string(), user.to_string()),
            ("u_c".to_string(), user.to_string()),
            ("sesskey".to_string(), self.session.effective_sesskey().to_string()),
        ]
    }

    fn form(&self, fields: Vec<(String, String)>) -> HttpRequest {
        HttpRequest {
            url: self.session.endpoint.clone(),
            body: RequestBody::Form(fields),
        }
    }

    pub fn build_get_book_tables(&self) -> HttpRequest {
        let mut fields = self.base_fields(REQ_GET_TABLES);
        fields.push(("b_c".to_string(), self.session.effective_book_code().to_string()));
        fields.push(("b_o".to_string(), self.session.effective_book_owner().to_string()));
        fields.push(("includeFields".to_string(), "true".to_string()));
        self.form(fields)
    }

    pub fn build_get_table_values(
        &self,
        table_id: i64,
        filter: Option<&ViewFilter>,
    ) -> Result<HttpRequest, ApiError> {
        let mut fields = self.base_fields(REQ_GET_VALUES);
        fields.push(("catId".to_string(), table_id.to_string()));
        if let Some(filter) = filter {
            fields.push(("filterRowIds".to_string(), to_json(filter)?));
        }
        Ok(self.form(fields))
    }

    pub fn build_create_or_update_row(
        &self,
        row_id: &RowId,
        field_values: &FieldValues,
    ) -> Result<HttpRequest, ApiError> {
        let mut fields = self.base_fields(REQ_CREATE_OR_UPDATE_ROW);
        fields.push(("rowId".to_string(), row_id.to_string()));
        fields.push(("fieldValues".to_string(), to_json(field_values)?));
        fields.push(("bypassUrlTrigger".to_string(), "false".to_string()));
        Ok(self.form(fields))
    }

    pub fn build_create_or_update_rows(&self, page: &RowBatch) -> Result<HttpRequest, ApiError> {
        let mut fields = self.base_fields(REQ_CREATE_OR_UPDATE_ROWS);
        fields.push(("rows".to_string(), to_json(page)?));
        Ok(self.form(fields))
    }

    pub fn build_file_upload(&self, upload: UploadRequest) -> HttpRequest {
        let mut fields = self.base_fields(REQ_FILE_UPLOAD);
        fields.push(("uuid".to_string(), upload.uuid.to_string()));
        fields.push(("rowId".to_string(), upload.row_id.to_string()));
        fields.push(("fieldId".to_string(), upload.field_id.to_string()));
        HttpRequest {
            url: self.session.endpoint.clone(),
            body: RequestBody::Multipart {
                fields,
                file: upload.file,
            },
        }
    }

    /// Categories of the book, minus system and pivot categories.
    pub fn parse_get_book_tables(&self, response: HttpResponse) -> Result<Vec<Table>, ApiError> {
        let (envelope, body) = read_envelope(&response)?;
        if !envelope.is_ok() {
            return Err(envelope.server_error());
        }
        let parsed: BookTablesBody = from_value(body)?;
        Ok(parsed
            .book_tables
            .categories
            .into_iter()
            .filter(Table::is_user_table)
            .collect())
    }

    pub fn parse_get_table_values(&self, response: HttpResponse) -> Result<TableValues, ApiError> {
        let (envelope, body) = read_envelope(&response)?;
        if !envelope.is_ok() {
            return Err(envelope.server_error());
        }
        let parsed: TableValuesBody = from_value(body)?;
        Ok(parsed.table_values)
    }

    /// Id of the single row the server wrote.
    pub fn parse_create_or_update_row(&self, response: HttpResponse) -> Result<RowId, ApiError> {
        let (envelope, body) = read_envelope(&response)?;
        if !envelope.is_ok() {
            return Err(ApiError::Rejected(response.body));
        }
        let parsed: RowsBody = from_value(body)?;
        match parsed.rows.as_deref() {
            Some([row]) => Ok(row.id.clone()),
            _ => Err(ApiError::UnidentifiedRow),
        }
    }

    pub fn parse_create_or_update_rows(&self, response: HttpResponse) -> Result<PageOutcome, ApiError> {
        let (envelope, _) = read_envelope(&response)?;
        if envelope.is_ok() {
            Ok(PageOutcome::Committed)
        } else if envelope.is_deadlock() {
            Ok(PageOutcome::Deadlock(response.body))
        } else {
            Err(ApiError::Rejected(response.body))
        }
    }

    /// The full server response of an accepted upload.
    pub fn parse_file_upload(&self, response: HttpResponse) -> Result<Value, ApiError> {
        let (envelope, body) = read_envelope(&response)?;
        if !envelope.is_ok() {
            return Err(ApiError::Rejected(response.body));
        }
        Ok(body)
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string(value).map_err(|e| ApiError::SerializationError(e.to_string()))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::DeserializationError(e.to_string()))
}

/// Reject non-2xx statuses, then split the body into its status envelope and
/// the full JSON value.
fn read_envelope(response: &HttpResponse) -> Result<(Envelope, Value), ApiError> {
    if !(200..300).contains(&response.status) {
        return Err(ApiError::HttpError {
            status: response.status,
            body: response.body.clone(),
        });
    }
    let body: Value = serde_json::from_str(&response.body)
        .map_err(|e| ApiError::DeserializationError(e.to_string()))?;
    let envelope: Envelope = from_value(body.clone())?;
    Ok((envelope, body))
}
