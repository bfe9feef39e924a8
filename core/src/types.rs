//! Domain DTOs for the Book API.
//!
//! # Design
//! The server returns far more keys per category and field than this client
//! interprets. Each DTO names the keys the client needs and keeps the rest in
//! a flattened `extra` map so cached metadata can be handed back to callers
//! without loss.

use std::fmt;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Field values for one row write, keyed by field id.
pub type FieldValues = Map<String, Value>;

/// Rows for a batched write, keyed by row id or temporary placeholder.
/// Iteration order is the order pages are sent in.
pub type RowBatch = IndexMap<String, FieldValues>;

/// A field definition belonging to a table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    #[serde(deserialize_with = "lenient_id")]
    pub id: i64,
    #[serde(default)]
    pub fixed_code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A category (table) within a book.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Table {
    #[serde(deserialize_with = "lenient_id")]
    pub id: i64,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(rename = "sysFunc", default, skip_serializing_if = "Option::is_none")]
    pub sys_func: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_id: Option<Value>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Table {
    /// System and pivot categories are never exposed to callers.
    pub fn is_user_table(&self) -> bool {
        !is_truthy(self.sys_func.as_ref()) && !is_truthy(self.pivot_id.as_ref())
    }

    pub fn field_with_fixed_code(&self, code: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.fixed_code.as_deref() == Some(code))
    }
}

/// One cell: the row it belongs to and its value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellValue {
    pub id: RowId,
    #[serde(default)]
    pub value: Value,
}

/// One column of a `TableValues` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldValuesColumn {
    #[serde(deserialize_with = "lenient_id")]
    pub id: i64,
    #[serde(default)]
    pub fixed_code: Option<String>,
    #[serde(default)]
    pub values: Vec<CellValue>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Row data of one table, organized column by column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableValues {
    #[serde(deserialize_with = "lenient_id")]
    pub id: i64,
    #[serde(default)]
    pub fields: Vec<FieldValuesColumn>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableValues {
    pub fn column_with_fixed_code(&self, code: &str) -> Option<&FieldValuesColumn> {
        self.fields
            .iter()
            .find(|f| f.fixed_code.as_deref() == Some(code))
    }
}

/// Address of a row: assigned by the server, or temporary for a row that
/// does not exist yet.
///
/// The server is not consistent about id types, so a numeric string reads as
/// `Id` and any other string as `Temp`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RowId {
    Id(i64),
    Temp(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(i64),
    Text(String),
}

impl<'de> Deserialize<'de> for RowId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Int(id) => RowId::Id(id),
            RawId::Text(text) => match text.trim().parse() {
                Ok(id) => RowId::Id(id),
                Err(_) => RowId::Temp(text),
            },
        })
    }
}

/// Table and field ids: a JSON integer or a string holding one.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match RawId::deserialize(deserializer)? {
        RawId::Int(id) => Ok(id),
        RawId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid id {text:?}"))),
    }
}

impl RowId {
    /// Temporary id derived from an external key value.
    pub fn temp_for(key: &Value) -> Self {
        RowId::Temp(format!("tmp{}", value_to_key(key)))
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, RowId::Temp(_))
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Id(id) => write!(f, "{id}"),
            RowId::Temp(tmp) => f.write_str(tmp),
        }
    }
}

impl From<i64> for RowId {
    fn from(id: i64) -> Self {
        RowId::Id(id)
    }
}

/// Row id returned by the server for a write.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WrittenRow {
    pub id: RowId,
}

/// Single-key upsert: find the row whose `key_field_id` equals `key_value`,
/// then write `field_values` to it, creating the row when none matches.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpsert {
    pub table_id: i64,
    pub key_field_id: i64,
    pub key_value: Value,
    pub field_values: FieldValues,
}

/// Outcome of `Book::create_or_update_rows`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub pages: usize,
    pub rows: usize,
    pub deadlock_retries: u32,
}

/// File attachment destined for one field of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub table_code: String,
    pub field_fixed_code: String,
    pub row_id: RowId,
    pub path: std::path::PathBuf,
    /// Idempotency token; a random one is generated when absent.
    pub uuid: Option<uuid::Uuid>,
    /// Defaults to the path's file name.
    pub file_name: Option<String>,
    /// Defaults to a guess from the path's extension.
    pub content_type: Option<String>,
}

impl FileUpload {
    pub fn new(
        table_code: impl Into<String>,
        field_fixed_code: impl Into<String>,
        row_id: impl Into<RowId>,
        path: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            table_code: table_code.into(),
            field_fixed_code: field_fixed_code.into(),
            row_id: row_id.into(),
            path: path.into(),
            uuid: None,
            file_name: None,
            content_type: None,
        }
    }
}

/// Mapping from the "mapped user" column to the "user" column of a mapping
/// table, in row order.
pub type UserMapping = IndexMap<String, Value>;

/// Render a JSON value the way it appears inside a form field or a map key:
/// strings bare, everything else as JSON text.
pub fn value_to_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loose truthiness used by the server for flag-like keys.
pub(crate) fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_keeps_unknown_keys() {
        let table: Table = serde_json::from_value(json!({
            "id": 12,
            "code": "items",
            "name": "Items",
            "fields": [{"id": 3, "fixed_code": "description", "name": "Description"}]
        }))
        .unwrap();
        assert_eq!(table.extra["name"], "Items");
        assert_eq!(table.fields[0].extra["name"], "Description");
        let back = serde_json::to_value(&table).unwrap();
        assert_eq!(back["name"], "Items");
        assert!(back.get("sysFunc").is_none());
    }

    #[test]
    fn system_and_pivot_tables_are_not_user_tables() {
        let sys: Table = serde_json::from_value(json!({"id": 1, "sysFunc": "contacts"})).unwrap();
        let pivot: Table = serde_json::from_value(json!({"id": 2, "pivot_id": 9})).unwrap();
        let plain: Table =
            serde_json::from_value(json!({"id": 3, "sysFunc": "", "pivot_id": null})).unwrap();
        assert!(!sys.is_user_table());
        assert!(!pivot.is_user_table());
        assert!(plain.is_user_table());
    }

    #[test]
    fn row_id_is_untagged() {
        let id: RowId = serde_json::from_value(json!(42)).unwrap();
        let tmp: RowId = serde_json::from_value(json!("tmpX")).unwrap();
        assert_eq!(id, RowId::Id(42));
        assert!(tmp.is_temp());
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn numeric_string_ids_are_accepted() {
        let id: RowId = serde_json::from_value(json!("700")).unwrap();
        assert_eq!(id, RowId::Id(700));

        let values: TableValues = serde_json::from_value(json!({
            "id": "2",
            "fields": [{"id": "20", "fixed_code": "description", "values": [{"id": "700", "value": "x"}]}]
        }))
        .unwrap();
        assert_eq!(values.id, 2);
        assert_eq!(values.fields[0].id, 20);
        assert_eq!(values.fields[0].values[0].id, RowId::Id(700));

        let table: Table = serde_json::from_value(json!({"id": "12", "fields": [{"id": "3"}]})).unwrap();
        assert_eq!((table.id, table.fields[0].id), (12, 3));
        assert!(serde_json::from_value::<Table>(json!({"id": "twelve"})).is_err());
    }

    #[test]
    fn temp_row_id_uses_bare_key() {
        assert_eq!(RowId::temp_for(&json!("ext-7")).to_string(), "tmpext-7");
        assert_eq!(RowId::temp_for(&json!(7)).to_string(), "tmp7");
    }

    #[test]
    fn truthiness_matches_server_flags() {
        assert!(!is_truthy(Some(&json!(0))));
        assert!(is_truthy(Some(&json!(1))));
        assert!(!is_truthy(Some(&json!(false))));
        assert!(is_truthy(Some(&json!("x"))));
        assert!(!is_truthy(None));
    }
}
