//! Parameterized SQL for table reads and row mutations.
//!
//! Identifiers are always quoted; every value travels as a text parameter
//! cast to the column's base type, so callers never splice values into
//! statement text. Length and precision modifiers are left to assignment,
//! where an oversized value is an error rather than silently clipped. Builders assume the request was validated against the
//! table model first.

use crate::error::{SluiceError, SluiceResult};
use crate::models::data::{value_as_text, ColumnValues, DataModel, DataRequest, FilterOp};

/// Alias of the row identity column in every generated select list.
pub const ROW_ID_ALIAS: &str = "__sluice_row_id";

/// A statement with its positional text parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// SQL text with `$n` placeholders
    pub sql: String,
    /// Parameter values in placeholder order (`None` binds NULL)
    pub params: Vec<Option<String>>,
}

impl Statement {
    fn new() -> Self {
        Self { sql: String::new(), params: Vec::new() }
    }

    /// Bind a text value, returning its placeholder.
    fn bind(&mut self, value: Option<String>) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }
}

/// Quote an identifier.
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quote a schema-qualified table name.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// `ctid::text` plus every model column, in ordinal order.
fn select_list(model: &DataModel) -> String {
    let mut list = vec![format!("ctid::text AS {}", quote_ident(ROW_ID_ALIAS))];
    list.extend(model.columns.iter().map(|c| quote_ident(&c.name)));
    list.join(", ")
}

fn cast_param(stmt: &mut Statement, value: Option<String>, base_type: &str) -> String {
    let placeholder = stmt.bind(value);
    format!("CAST({placeholder}::text AS {base_type})")
}

fn where_clause(stmt: &mut Statement, model: &DataModel, request: &DataRequest) -> SluiceResult<String> {
    let mut predicates = Vec::with_capacity(request.filters.len());
    for filter in &request.filters {
        let column = model.require_column(&filter.column)?;
        let ident = quote_ident(&column.name);
        let predicate = match filter.op {
            FilterOp::IsNull | FilterOp::IsNotNull => format!("{ident} {}", filter.op.sql()),
            op if op.is_pattern() => {
                let placeholder = stmt.bind(value_as_text(&filter.value));
                format!("{ident}::text {} {placeholder}::text", op.sql())
            }
            op => {
                let operand = cast_param(stmt, value_as_text(&filter.value), &column.base_type);
                format!("{ident} {} {operand}", op.sql())
            }
        };
        predicates.push(predicate);
    }

    Ok(if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    })
}

/// Page of rows for a validated request.
pub fn select_page(model: &DataModel, request: &DataRequest) -> SluiceResult<Statement> {
    let mut stmt = Statement::new();
    let filter = where_clause(&mut stmt, model, request)?;

    let order = match &request.sort {
        Some(sort) => {
            let column = model.require_column(&sort.column)?;
            format!(" ORDER BY {} {}, ctid", quote_ident(&column.name), sort.direction.sql())
        }
        None => " ORDER BY ctid".to_string(),
    };

    stmt.sql = format!(
        "SELECT {} FROM {}{filter}{order} LIMIT {} OFFSET {}",
        select_list(model),
        qualified(&model.schema, &model.name),
        request.limit,
        request.offset,
    );
    Ok(stmt)
}

/// Filtered row count for a validated request.
pub fn count_rows(model: &DataModel, request: &DataRequest) -> SluiceResult<Statement> {
    let mut stmt = Statement::new();
    let filter = where_clause(&mut stmt, model, request)?;
    stmt.sql = format!("SELECT COUNT(*) FROM {}{filter}", qualified(&model.schema, &model.name));
    Ok(stmt)
}

/// Single-row insert returning the stored row.
pub fn insert_row(model: &DataModel, values: &ColumnValues) -> SluiceResult<Statement> {
    let mut stmt = Statement::new();
    let table = qualified(&model.schema, &model.name);

    if values.is_empty() {
        stmt.sql = format!("INSERT INTO {table} DEFAULT VALUES RETURNING {}", select_list(model));
        return Ok(stmt);
    }

    let mut columns = Vec::with_capacity(values.len());
    let mut operands = Vec::with_capacity(values.len());
    for (name, value) in values {
        let column = model.require_column(name)?;
        columns.push(quote_ident(&column.name));
        operands.push(cast_param(&mut stmt, value_as_text(value), &column.base_type));
    }

    stmt.sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}) RETURNING {}",
        columns.join(", "),
        operands.join(", "),
        select_list(model),
    );
    Ok(stmt)
}

/// Delete by row identities.
pub fn delete_rows(model: &DataModel, row_ids: &[String]) -> SluiceResult<Statement> {
    if row_ids.is_empty() {
        return Err(SluiceError::validation("no rows selected for deletion"));
    }
    let mut stmt = Statement::new();
    let placeholders: Vec<String> =
        row_ids.iter().map(|id| format!("{}::text::tid", stmt.bind(Some(id.clone())))).collect();

    stmt.sql = format!(
        "DELETE FROM {} WHERE ctid IN ({})",
        qualified(&model.schema, &model.name),
        placeholders.join(", ")
    );
    Ok(stmt)
}

/// Update one column of one row, returning the updated row.
pub fn update_cell(
    model: &DataModel,
    row_id: &str,
    column: &str,
    value: &serde_json::Value,
) -> SluiceResult<Statement> {
    let column = model.require_column(column)?;
    let mut stmt = Statement::new();
    let operand = cast_param(&mut stmt, value_as_text(value), &column.base_type);
    let row = stmt.bind(Some(row_id.to_string()));

    stmt.sql = format!(
        "UPDATE {} SET {} = {operand} WHERE ctid = {row}::text::tid RETURNING {}",
        qualified(&model.schema, &model.name),
        quote_ident(&column.name),
        select_list(model),
    );
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::data::{ColumnDetail, Filter, Sort, SortDirection};
    use serde_json::json;

    fn model() -> DataModel {
        let column = |name: &str, data_type: &str, base_type: &str, pos| ColumnDetail {
            name: name.into(),
            data_type: data_type.into(),
            base_type: base_type.into(),
            is_nullable: true,
            is_primary_key: false,
            default_value: None,
            ordinal_position: pos,
        };
        DataModel {
            schema: "public".into(),
            name: "Order \"Items\"".into(),
            owner: "postgres".into(),
            estimated_rows: 0,
            columns: vec![
                column("id", "integer", "integer", 1),
                column("note", "character varying(20)", "character varying", 2),
            ],
        }
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(qualified("s", "t"), "\"s\".\"t\"");
    }

    #[test]
    fn test_select_page_binds_filters() {
        let mut request = DataRequest::new("public", "Order \"Items\"", 10);
        request.offset = 20;
        request.filters = vec![
            Filter::new("id", FilterOp::Gte, json!(5)),
            Filter::new("note", FilterOp::ILike, json!("%x%")),
            Filter::new("note", FilterOp::IsNotNull, serde_json::Value::Null),
        ];
        request.sort = Some(Sort { column: "id".into(), direction: SortDirection::Desc });

        let stmt = select_page(&model(), &request).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT ctid::text AS \"__sluice_row_id\", \"id\", \"note\" \
             FROM \"public\".\"Order \"\"Items\"\"\" \
             WHERE \"id\" >= CAST($1::text AS integer) AND \"note\"::text ILIKE $2::text AND \"note\" IS NOT NULL \
             ORDER BY \"id\" DESC, ctid LIMIT 10 OFFSET 20"
        );
        assert_eq!(stmt.params, vec![Some("5".to_string()), Some("%x%".to_string())]);

        let count = count_rows(&model(), &request).unwrap();
        assert!(count.sql.starts_with("SELECT COUNT(*) FROM"));
        assert_eq!(count.params.len(), 2);
    }

    #[test]
    fn test_insert_and_update_cast_without_length_modifier() {
        let mut values = ColumnValues::new();
        values.insert("note".into(), json!("hello"));
        values.insert("id".into(), json!(7));
        let stmt = insert_row(&model(), &values).unwrap();
        assert!(stmt.sql.contains("(\"id\", \"note\") VALUES (CAST($1::text AS integer), CAST($2::text AS character varying))"));
        assert!(stmt.sql.ends_with("RETURNING ctid::text AS \"__sluice_row_id\", \"id\", \"note\""));

        let stmt = update_cell(&model(), "(0,1)", "note", &serde_json::Value::Null).unwrap();
        assert!(stmt.sql.contains("SET \"note\" = CAST($1::text AS character varying) WHERE ctid = $2::text::tid"));
        assert_eq!(stmt.params, vec![None, Some("(0,1)".to_string())]);
    }

    #[test]
    fn test_equality_filter_keeps_full_operand() {
        let mut request = DataRequest::new("public", "Order \"Items\"", 10);
        request.filters = vec![Filter::new("note", FilterOp::Eq, json!("abcdeZZZZ"))];

        let stmt = select_page(&model(), &request).unwrap();
        assert!(stmt.sql.contains("WHERE \"note\" = CAST($1::text AS character varying) ORDER BY ctid"));
        assert!(!stmt.sql.contains("character varying(20)"));
        assert_eq!(stmt.params, vec![Some("abcdeZZZZ".to_string())]);
    }

    #[test]
    fn test_unknown_columns_never_reach_sql() {
        let mut values = ColumnValues::new();
        values.insert("id) VALUES (1); --".into(), json!(1));
        assert!(insert_row(&model(), &values).is_err());
        assert!(update_cell(&model(), "(0,1)", "nope", &json!(1)).is_err());
        assert!(delete_rows(&model(), &[]).is_err());
    }
}
