//! Table models and the request/response shapes of data browsing.
//!
//! Filters and sorts are tagged predicates over column names. They are
//! checked against the introspected [`DataModel`] before any SQL is built,
//! so unknown columns never reach the engine.

use crate::error::{SluiceError, SluiceResult};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDetail {
    /// Column name.
    pub name: String,
    /// Data type (e.g., "integer", "character varying(255)").
    pub data_type: String,
    /// Data type without modifiers (e.g., "character varying").
    pub base_type: String,
    /// Whether the column allows NULL values.
    pub is_nullable: bool,
    /// Whether this column is part of the primary key.
    pub is_primary_key: bool,
    /// Default value expression, if any.
    pub default_value: Option<String>,
    /// Column position (1-based ordinal).
    pub ordinal_position: i32,
}

/// A table with its columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataModel {
    /// Schema name containing this table.
    pub schema: String,
    /// Table name.
    pub name: String,
    /// Table owner.
    pub owner: String,
    /// Estimated row count from catalog statistics.
    pub estimated_rows: i64,
    /// Columns in ordinal order. Empty in listings.
    pub columns: Vec<ColumnDetail>,
}

impl DataModel {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDetail> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a column, failing with a validation error when absent.
    pub fn require_column(&self, name: &str) -> SluiceResult<&ColumnDetail> {
        self.column(name).ok_or_else(|| {
            SluiceError::validation(format!(
                "column '{name}' does not exist on {}.{}",
                self.schema, self.name
            ))
        })
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Comparison used by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `LIKE` (compared as text)
    Like,
    /// `ILIKE` (compared as text)
    ILike,
    /// `IS NULL`
    IsNull,
    /// `IS NOT NULL`
    IsNotNull,
}

impl FilterOp {
    /// SQL operator text.
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Like => "LIKE",
            Self::ILike => "ILIKE",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }

    /// Whether the operator compares against a value.
    pub fn takes_value(&self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }

    /// Whether the comparison is done on the text form of the column.
    pub fn is_pattern(&self) -> bool {
        matches!(self, Self::Like | Self::ILike)
    }
}

/// A predicate on one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Column name
    pub column: String,
    /// Comparison
    pub op: FilterOp,
    /// Comparison operand (ignored for null checks)
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Filter {
    /// Build a filter.
    pub fn new(column: impl Into<String>, op: FilterOp, value: serde_json::Value) -> Self {
        Self { column: column.into(), op, value }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending
    #[default]
    Asc,
    /// Descending
    Desc,
}

impl SortDirection {
    /// SQL keyword.
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Ordering on one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    /// Column name
    pub column: String,
    /// Direction
    #[serde(default)]
    pub direction: SortDirection,
}

/// A bounded read of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Schema name
    pub schema: String,
    /// Table name
    pub table: String,
    /// Page size
    pub limit: i64,
    /// Rows to skip
    pub offset: i64,
    /// Also compute the filtered row count
    #[serde(default)]
    pub fetch_count: bool,
    /// Predicates, combined with AND
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// Ordering
    #[serde(default)]
    pub sort: Option<Sort>,
}

impl DataRequest {
    /// Start a request for the first page of a table.
    pub fn new(schema: impl Into<String>, table: impl Into<String>, limit: i64) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            limit,
            offset: 0,
            fetch_count: false,
            filters: Vec::new(),
            sort: None,
        }
    }

    /// Check the request against the table model and clamp the page size.
    pub fn validated(mut self, model: &DataModel, max_page_rows: i64) -> SluiceResult<Self> {
        if self.offset < 0 {
            return Err(SluiceError::validation("offset cannot be negative"));
        }
        if self.limit <= 0 {
            return Err(SluiceError::validation("limit must be positive"));
        }
        self.limit = self.limit.min(max_page_rows.max(1));

        for filter in &self.filters {
            model.require_column(&filter.column)?;
            if filter.op.takes_value() && filter.value.is_null() {
                return Err(SluiceError::validation(format!(
                    "filter on '{}' needs a value; use is_null to match NULL",
                    filter.column
                )));
            }
        }
        if let Some(sort) = &self.sort {
            model.require_column(&sort.column)?;
        }
        Ok(self)
    }
}

/// Opaque engine-specific row identity (Postgres: `ctid` text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub String);

impl RowId {
    /// Wrap an identity string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row with its identity; values follow the table's column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataRow {
    /// Row identity usable in later mutations
    pub row_id: RowId,
    /// Cell values
    pub values: Vec<serde_json::Value>,
}

/// One page of table data.
#[derive(Debug, Clone, Serialize)]
pub struct DataPage {
    /// Column names in ordinal order
    pub columns: Vec<String>,
    /// Rows of this page
    pub rows: Vec<DataRow>,
    /// Filtered row count, when requested
    pub total_count: Option<i64>,
}

/// Column name to value, for inserts.
pub type ColumnValues = BTreeMap<String, serde_json::Value>;

/// Render a JSON operand as the text bound to a `CAST($n::text AS type)` parameter.
pub fn value_as_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
