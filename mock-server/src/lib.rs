//! In-memory stand-in for the Book API.
//!
//! Serves the five `req` operations at `POST /api.php` over a `MockBook`:
//! form-encoded requests for everything except `fileUpload`, which is
//! multipart. Every response is a JSON envelope with `status`; failures use
//! `errorMsg` (or `error` for injected deadlocks), as the real service does.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    routing::post,
    Form, Json, Router,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, warn};

pub const ENDPOINT_PATH: &str = "/api.php";
pub const SESSION_KEY: &str = "mock-sesskey";
pub const DEADLOCK_ERROR: &str = "Deadlock found when trying to get lock; try restarting transaction";

#[derive(Clone, Debug, Serialize)]
pub struct MockField {
    pub id: i64,
    pub fixed_code: String,
}

#[derive(Clone, Debug, Default)]
pub struct MockRow {
    pub id: i64,
    pub values: HashMap<i64, Value>,
}

#[derive(Clone, Debug)]
pub struct MockTable {
    pub id: i64,
    pub code: String,
    pub sys_func: Option<String>,
    pub pivot_id: Option<i64>,
    pub fields: Vec<MockField>,
    pub rows: Vec<MockRow>,
}

impl MockTable {
    fn new(id: i64, code: &str, fields: &[(i64, &str)]) -> Self {
        Self {
            id,
            code: code.to_string(),
            sys_func: None,
            pivot_id: None,
            fields: fields
                .iter()
                .map(|(id, code)| MockField {
                    id: *id,
                    fixed_code: code.to_string(),
                })
                .collect(),
            rows: Vec::new(),
        }
    }

    fn to_category(&self) -> Value {
        let mut category = json!({
            "id": self.id,
            "code": self.code,
            "name": self.code,
            "fields": self.fields,
        });
        if let Some(sys_func) = &self.sys_func {
            category["sysFunc"] = json!(sys_func);
        }
        if let Some(pivot_id) = self.pivot_id {
            category["pivot_id"] = json!(pivot_id);
        }
        category
    }
}

/// A file received by `fileUpload`.
#[derive(Clone, Debug)]
pub struct StoredUpload {
    pub uuid: String,
    pub row_id: i64,
    pub field_id: i64,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// State of the mock service.
#[derive(Clone, Debug)]
pub struct MockBook {
    pub sesskey: String,
    pub tables: Vec<MockTable>,
    pub next_row_id: i64,
    /// Number of upcoming `createOrUpdateTableRows` calls to fail with a deadlock.
    pub deadlocks_remaining: u32,
    /// Row count of every `createOrUpdateTableRows` call received, deadlocked ones included.
    pub batch_pages: Vec<usize>,
    pub uploads: Vec<StoredUpload>,
}

impl MockBook {
    /// A book with a system table, a pivot table, an `items` table with two
    /// rows and a `users` mapping table.
    pub fn seeded() -> Self {
        let mut contacts = MockTable::new(1, "contacts", &[(100, "email")]);
        contacts.sys_func = Some("contacts".to_string());

        let mut items = MockTable::new(
            2,
            "test_code",
            &[(201, "description"), (202, "quantity"), (203, "attachment")],
        );
        items.rows = vec![
            row(5001, &[(201, json!("First item")), (202, json!(3))]),
            row(5002, &[(201, json!("Second item")), (202, json!(5))]),
        ];

        let mut pivot = MockTable::new(3, "items_by_quantity", &[(301, "quantity")]);
        pivot.pivot_id = Some(2);

        let mut users = MockTable::new(4, "users", &[(401, "login"), (402, "external_id")]);
        users.rows = vec![
            row(6001, &[(401, json!("ttcapitester")), (402, json!("EXT-1"))]),
            row(6002, &[(401, json!("someone")), (402, json!("EXT-2"))]),
        ];

        Self {
            sesskey: SESSION_KEY.to_string(),
            tables: vec![contacts, items, pivot, users],
            next_row_id: 9000,
            deadlocks_remaining: 0,
            batch_pages: Vec::new(),
            uploads: Vec::new(),
        }
    }

    pub fn with_deadlocks(mut self, count: u32) -> Self {
        self.deadlocks_remaining = count;
        self
    }

    pub fn table(&self, code: &str) -> Option<&MockTable> {
        self.tables.iter().find(|t| t.code == code)
    }

    fn table_of_field(&self, field_id: i64) -> Option<usize> {
        self.tables
            .iter()
            .position(|t| t.fields.iter().any(|f| f.id == field_id))
    }

    fn locate_row(&self, row_id: i64) -> Option<(usize, usize)> {
        self.tables.iter().enumerate().find_map(|(t, table)| {
            table
                .rows
                .iter()
                .position(|r| r.id == row_id)
                .map(|r| (t, r))
        })
    }

    /// Create (temporary id) or update one row. Returns the row id written.
    fn write_row(&mut self, row_id: &str, field_values: &Map<String, Value>) -> Result<i64, String> {
        let mut values = HashMap::new();
        for (field, value) in field_values {
            let field_id: i64 = field
                .parse()
                .map_err(|_| format!("invalid field id {field}"))?;
            values.insert(field_id, value.clone());
        }

        if row_id.starts_with("tmp") {
            let table = values
                .keys()
                .find_map(|field_id| self.table_of_field(*field_id))
                .ok_or_else(|| format!("cannot create row {row_id} without known fields"))?;
            let id = self.next_row_id;
            self.next_row_id += 1;
            self.tables[table].rows.push(MockRow { id, values });
            return Ok(id);
        }

        let id: i64 = row_id
            .parse()
            .map_err(|_| format!("invalid row id {row_id}"))?;
        let (table, position) = self
            .locate_row(id)
            .ok_or_else(|| format!("row {id} not found"))?;
        self.tables[table].rows[position].values.extend(values);
        Ok(id)
    }
}

fn row(id: i64, values: &[(i64, Value)]) -> MockRow {
    MockRow {
        id,
        values: values.iter().cloned().collect(),
    }
}

pub type Db = Arc<RwLock<MockBook>>;

pub fn app() -> Router {
    app_with(Arc::new(RwLock::new(MockBook::seeded())))
}

pub fn app_with(db: Db) -> Router {
    Router::new()
        .route(ENDPOINT_PATH, post(dispatch))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub async fn run_with(listener: TcpListener, db: Db) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with(db)).await
}

fn failure(message: impl Into<String>) -> Json<Value> {
    Json(json!({"status": "nok", "errorMsg": message.into()}))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn dispatch(State(db): State<Db>, request: Request) -> Result<Json<Value>, (StatusCode, String)> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if is_multipart {
        let multipart = Multipart::from_request(request, &db)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        return Ok(file_upload(&db, multipart).await);
    }

    let Form(fields) = Form::<Vec<(String, String)>>::from_request(request, &db)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let fields: HashMap<String, String> = fields.into_iter().collect();
    let req = fields.get("req").map(String::as_str).unwrap_or("");
    debug!(req, "dispatch");

    let mut book = db.write().await;
    if fields.get("sesskey") != Some(&book.sesskey) {
        return Ok(failure("invalid session key"));
    }

    let response = match req {
        "getBookTables" => get_book_tables(&book),
        "getTableValues" => get_table_values(&book, &fields),
        "createOrUpdateTableRow" => create_or_update_row(&mut book, &fields),
        "createOrUpdateTableRows" => create_or_update_rows(&mut book, &fields),
        other => failure(format!("unknown request {other}")),
    };
    Ok(response)
}

fn get_book_tables(book: &MockBook) -> Json<Value> {
    let categories: Vec<Value> = book.tables.iter().map(MockTable::to_category).collect();
    Json(json!({"status": "ok", "bookTables": {"categories": categories}}))
}

fn row_matches(row: &MockRow, clause: &Value) -> bool {
    let field_id = clause["field_id"].as_i64().unwrap_or_default();
    let predicate = clause["json"]["predicate"].as_str().unwrap_or("is");
    let operand = render(&clause["json"]["operand"]);
    let actual = row.values.get(&field_id).map(render).unwrap_or_default();
    match predicate {
        "is" => actual == operand,
        "is_not" => actual != operand,
        "contains" => actual.contains(&operand),
        _ => false,
    }
}

fn get_table_values(book: &MockBook, fields: &HashMap<String, String>) -> Json<Value> {
    let Some(table_id) = fields.get("catId").and_then(|id| id.parse::<i64>().ok()) else {
        return failure("missing catId");
    };
    let Some(table) = book.tables.iter().find(|t| t.id == table_id) else {
        return failure(format!("unknown table {table_id}"));
    };

    let filter = match fields.get("filterRowIds") {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(filter) => Some(filter),
            Err(e) => return failure(format!("invalid filter: {e}")),
        },
        None => None,
    };
    let rows: Vec<&MockRow> = table
        .rows
        .iter()
        .filter(|row| {
            let Some(filter) = &filter else {
                return true;
            };
            let group = &filter["applyViewFilters"]["filterGroup"];
            let clauses = group["filters"].as_array().map(Vec::as_slice).unwrap_or_default();
            if group["operator"].as_str() == Some("or") {
                clauses.iter().any(|c| row_matches(row, c))
            } else {
                clauses.iter().all(|c| row_matches(row, c))
            }
        })
        .collect();

    let columns: Vec<Value> = table
        .fields
        .iter()
        .map(|field| {
            let values: Vec<Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "id": row.id,
                        "value": row.values.get(&field.id).cloned().unwrap_or(Value::Null),
                    })
                })
                .collect();
            json!({"id": field.id, "fixed_code": field.fixed_code, "values": values})
        })
        .collect();

    Json(json!({"status": "ok", "tableValues": {"id": table.id, "fields": columns}}))
}

fn parse_json_field(fields: &HashMap<String, String>, name: &str) -> Result<Map<String, Value>, String> {
    let raw = fields.get(name).ok_or_else(|| format!("missing {name}"))?;
    serde_json::from_str(raw).map_err(|e| format!("invalid {name}: {e}"))
}

fn create_or_update_row(book: &mut MockBook, fields: &HashMap<String, String>) -> Json<Value> {
    let Some(row_id) = fields.get("rowId") else {
        return failure("missing rowId");
    };
    let result = parse_json_field(fields, "fieldValues").and_then(|values| book.write_row(row_id, &values));
    match result {
        Ok(id) => Json(json!({"status": "ok", "rows": [{"id": id}]})),
        Err(msg) => failure(msg),
    }
}

fn create_or_update_rows(book: &mut MockBook, fields: &HashMap<String, String>) -> Json<Value> {
    let rows = match parse_json_field(fields, "rows") {
        Ok(rows) => rows,
        Err(msg) => return failure(msg),
    };
    book.batch_pages.push(rows.len());

    if book.deadlocks_remaining > 0 {
        book.deadlocks_remaining -= 1;
        warn!(page = rows.len(), "injecting deadlock");
        return Json(json!({"status": "nok", "error": DEADLOCK_ERROR}));
    }

    let mut written = Vec::with_capacity(rows.len());
    for (row_id, values) in &rows {
        let Some(values) = values.as_object() else {
            return failure(format!("invalid field values for row {row_id}"));
        };
        match book.write_row(row_id, values) {
            Ok(id) => written.push(json!({"id": id})),
            Err(msg) => return failure(msg),
        }
    }
    Json(json!({"status": "ok", "rows": written}))
}

async fn file_upload(db: &Db, mut multipart: Multipart) -> Json<Value> {
    let mut fields = HashMap::new();
    let mut file = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return failure(e.to_string()),
        };
        let name = field.name().unwrap_or_default().to_string();
        if name == "qqfile" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().unwrap_or_default().to_string();
            match field.bytes().await {
                Ok(bytes) => file = Some((file_name, content_type, bytes.to_vec())),
                Err(e) => return failure(e.to_string()),
            }
        } else {
            match field.text().await {
                Ok(text) => {
                    fields.insert(name, text);
                }
                Err(e) => return failure(e.to_string()),
            }
        }
    }

    let mut book = db.write().await;
    if fields.get("sesskey") != Some(&book.sesskey) {
        return failure("invalid session key");
    }
    if fields.get("req").map(String::as_str) != Some("fileUpload") {
        return failure("multipart is only accepted for fileUpload");
    }
    let Some((file_name, content_type, bytes)) = file else {
        return failure("missing qqfile");
    };
    let Some(row_id) = fields.get("rowId").and_then(|id| id.parse::<i64>().ok()) else {
        return failure("invalid rowId");
    };
    let Some(field_id) = fields.get("fieldId").and_then(|id| id.parse::<i64>().ok()) else {
        return failure("invalid fieldId");
    };
    if book.locate_row(row_id).is_none() {
        return failure(format!("row {row_id} not found"));
    }
    if book.table_of_field(field_id).is_none() {
        return failure(format!("field {field_id} not found"));
    }

    let uuid = fields.get("uuid").cloned().unwrap_or_default();
    let size = bytes.len();
    book.uploads.push(StoredUpload {
        uuid: uuid.clone(),
        row_id,
        field_id,
        file_name: file_name.clone(),
        content_type,
        bytes,
    });
    Json(json!({"status": "ok", "uuid": uuid, "fileName": file_name, "size": size}))
}
