//! View filters for `getTableValues`.
//!
//! # Design
//! The server expects a filter group wrapped in `applyViewFilters`. Callers
//! describe clauses by field fixed code (`FilterClause`); `build_filter_config`
//! resolves those codes against a table's metadata into the wire shape.
//! Row resolution skips the code lookup and builds its single equality clause
//! straight from a field id with `ViewFilter::equals`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::types::Table;

pub const DEFAULT_OPERATOR: &str = "and";
pub const DEFAULT_PREDICATE: &str = "is";
pub const DEFAULT_FILTER_TYPE: &str = "text";

/// Id given to a clause when it is the only one in its group.
const SINGLE_CLAUSE_ID: &str = "tmpId";

/// A filter condition expressed against a field's fixed code.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterClause {
    pub key: String,
    pub value: Value,
    pub predicate: String,
    pub filter_type: String,
}

impl FilterClause {
    /// `key is value`, compared as text.
    pub fn is(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            predicate: DEFAULT_PREDICATE.to_string(),
            filter_type: DEFAULT_FILTER_TYPE.to_string(),
        }
    }

    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = predicate.into();
        self
    }

    pub fn with_filter_type(mut self, filter_type: impl Into<String>) -> Self {
        self.filter_type = filter_type.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterCondition {
    pub predicate: String,
    pub operand: Value,
}

/// One resolved clause, as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterEntry {
    pub id: String,
    pub json: FilterCondition,
    pub field_id: i64,
    pub filter_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterGroup {
    pub operator: String,
    pub filters: Vec<FilterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplyViewFilters {
    pub filter_group: FilterGroup,
}

/// Payload of the `filterRowIds` form field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewFilter {
    pub apply_view_filters: ApplyViewFilters,
}

impl ViewFilter {
    pub fn new(operator: impl Into<String>, filters: Vec<FilterEntry>) -> Self {
        Self {
            apply_view_filters: ApplyViewFilters {
                filter_group: FilterGroup {
                    operator: operator.into(),
                    filters,
                },
            },
        }
    }

    /// Single text equality on `field_id`.
    pub fn equals(field_id: i64, operand: Value) -> Self {
        Self::new(
            DEFAULT_OPERATOR,
            vec![FilterEntry {
                id: SINGLE_CLAUSE_ID.to_string(),
                json: FilterCondition {
                    predicate: DEFAULT_PREDICATE.to_string(),
                    operand,
                },
                field_id,
                filter_type: DEFAULT_FILTER_TYPE.to_string(),
            }],
        )
    }

    pub fn clauses(&self) -> &[FilterEntry] {
        &self.apply_view_filters.filter_group.filters
    }
}

/// A filter bound to the table it applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    pub table_id: i64,
    pub filter: ViewFilter,
}

/// Resolve `clauses` against `table` and combine them with `operator`
/// (`and` when `None`).
pub fn build_filter_config(
    table: &Table,
    clauses: &[FilterClause],
    operator: Option<&str>,
) -> Result<FilterConfig, ApiError> {
    let mut filters = Vec::with_capacity(clauses.len());
    for (i, clause) in clauses.iter().enumerate() {
        let field = table
            .field_with_fixed_code(&clause.key)
            .ok_or_else(|| ApiError::FilterFieldNotFound(clause.key.clone()))?;
        let id = if clauses.len() == 1 {
            SINGLE_CLAUSE_ID.to_string()
        } else {
            format!("tmp{i}")
        };
        filters.push(FilterEntry {
            id,
            json: FilterCondition {
                predicate: clause.predicate.clone(),
                operand: clause.value.clone(),
            },
            field_id: field.id,
            filter_type: clause.filter_type.clone(),
        });
    }
    Ok(FilterConfig {
        table_id: table.id,
        filter: ViewFilter::new(operator.unwrap_or(DEFAULT_OPERATOR), filters),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items_table() -> Table {
        serde_json::from_value(json!({
            "id": 101,
            "code": "test_code",
            "fields": [
                {"id": 1001, "fixed_code": "description"},
                {"id": 1002, "fixed_code": "quantity"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn single_clause_matches_wire_shape() {
        let config =
            build_filter_config(&items_table(), &[FilterClause::is("description", "First item")], None).unwrap();
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({
                "tableId": 101,
                "filter": {"applyViewFilters": {"filterGroup": {
                    "operator": "and",
                    "filters": [{
                        "id": "tmpId",
                        "json": {"predicate": "is", "operand": "First item"},
                        "field_id": 1001,
                        "filter_type": "text"
                    }]
                }}}
            })
        );
    }

    #[test]
    fn multiple_clauses_are_numbered() {
        let clauses = [
            FilterClause::is("description", "a"),
            FilterClause::is("quantity", 3)
                .with_predicate("greater")
                .with_filter_type("numeric"),
        ];
        let config = build_filter_config(&items_table(), &clauses, Some("or")).unwrap();
        let group = &config.filter.apply_view_filters.filter_group;
        assert_eq!(group.operator, "or");
        assert_eq!(group.filters[0].id, "tmp0");
        assert_eq!(group.filters[1].id, "tmp1");
        assert_eq!(group.filters[1].field_id, 1002);
        assert_eq!(group.filters[1].json.predicate, "greater");
        assert_eq!(group.filters[1].filter_type, "numeric");
    }

    #[test]
    fn unknown_field_code_fails() {
        let err = build_filter_config(&items_table(), &[FilterClause::is("nope", "x")], None).unwrap_err();
        assert!(matches!(err, ApiError::FilterFieldNotFound(ref key) if key == "nope"));
        assert_eq!(err.to_string(), "could not find a filter config for field nope");
    }

    #[test]
    fn equals_builds_one_text_clause() {
        let filter = ViewFilter::equals(55, json!("ext-1"));
        assert_eq!(filter.clauses().len(), 1);
        assert_eq!(filter.clauses()[0].field_id, 55);
        assert_eq!(filter.clauses()[0].json.operand, "ext-1");
        assert_eq!(filter.apply_view_filters.filter_group.operator, "and");
    }
}
