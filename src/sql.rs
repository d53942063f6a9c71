//! Statement construction for materialized tables.
//!
//! Builders accept table and column names only as [`Identifier`]s and never
//! take caller-supplied strings; every value travels as a bound parameter.

use crate::catalog::ColumnSchema;
use crate::sanitize::Identifier;
use crate::value::{DataType, Value};

/// SQLite caps function arguments at 127 by default, so the row projection
/// is split into nested `json_array` chunks below that limit.
const PROJECTION_CHUNK: usize = 100;

/// `json_array` renders REAL with 15 significant digits; 17 round-trip every f64.
const REAL_TEXT_FORMAT: &str = "'%!.17g'";

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub(crate) sql: String,
    pub(crate) params: Vec<Value>,
}

impl Statement {
    fn new(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }

    fn bind(mut self, value: Value) -> Self {
        self.params.push(value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn keyword(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        }
    }
}

pub fn storage_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Text => "TEXT",
        DataType::Integer => "INTEGER",
        DataType::Float => "REAL",
        DataType::Boolean => "BOOLEAN",
        DataType::Date => "DATE",
        DataType::Datetime => "DATETIME",
    }
}

fn column_definition(column: &ColumnSchema) -> String {
    let mut definition = format!(
        "{} {} {}",
        column.field_name.quoted(),
        storage_type(column.data_type),
        if column.nullable { "NULL" } else { "NOT NULL" }
    );
    if column.unique {
        definition.push_str(" UNIQUE");
    }
    definition
}

pub fn create_table(table: &Identifier, columns: &[ColumnSchema]) -> Statement {
    let mut definitions = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        Identifier::system_id().quoted()
    )];
    definitions.extend(columns.iter().map(column_definition));

    Statement::new(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.quoted(),
        definitions.join(", ")
    ))
}

pub fn drop_table(table: &Identifier) -> Statement {
    Statement::new(format!("DROP TABLE IF EXISTS {}", table.quoted()))
}

/// Column layout of an existing table, one row per column.
pub fn table_info(table: &Identifier) -> Statement {
    Statement::new(
        "SELECT name, type AS declared_type, \"notnull\" AS not_null, pk \
         FROM pragma_table_info(?) ORDER BY cid"
            .to_string(),
    )
    .bind(Value::Text(table.as_str().to_string()))
}

pub fn select_one() -> Statement {
    Statement::new("SELECT 1 AS count".to_string())
}

pub fn table_exists(table: &Identifier) -> Statement {
    Statement::new(
        "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?"
            .to_string(),
    )
    .bind(Value::Text(table.as_str().to_string()))
}

/// Row projection: `json_array(json_array("id", "a", ...), ...) AS record`.
/// Flattened, the chunks yield `id` followed by the columns in position order.
/// REAL columns are projected as text and decoded by [`Value::from_stored`].
fn record_projection(columns: &[ColumnSchema]) -> String {
    let expressions: Vec<String> = std::iter::once(Identifier::system_id().quoted())
        .chain(columns.iter().map(projected_column))
        .collect();
    let chunks: Vec<String> = expressions
        .chunks(PROJECTION_CHUNK)
        .map(|chunk| format!("json_array({})", chunk.join(", ")))
        .collect();
    format!("json_array({}) AS record", chunks.join(", "))
}

fn projected_column(column: &ColumnSchema) -> String {
    let name = column.field_name.quoted();
    match column.data_type {
        DataType::Float => format!(
            "CASE WHEN {0} IS NULL THEN NULL ELSE printf({1}, {0}) END",
            name, REAL_TEXT_FORMAT
        ),
        _ => name,
    }
}

fn where_clause(statement: &mut Statement, filters: &[(&Identifier, Value)]) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let conditions: Vec<String> = filters
        .iter()
        .map(|(field, value)| {
            if value.is_null() {
                format!("{} IS NULL", field.quoted())
            } else {
                statement.params.push(value.clone());
                format!("{} = ?", field.quoted())
            }
        })
        .collect();
    format!(" WHERE {}", conditions.join(" AND "))
}

pub fn select_page(
    table: &Identifier,
    columns: &[ColumnSchema],
    filters: &[(&Identifier, Value)],
    ordering: Option<(&Identifier, Direction)>,
    limit: i64,
    offset: i64,
) -> Statement {
    let mut statement = Statement::new(String::new());
    let where_sql = where_clause(&mut statement, filters);
    let id = Identifier::system_id();
    let order_sql = match ordering {
        Some((field, direction)) => format!(
            "{} {}, {} ASC",
            field.quoted(),
            direction.keyword(),
            id.quoted()
        ),
        None => format!("{} ASC", id.quoted()),
    };
    statement.sql = format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
        record_projection(columns),
        table.quoted(),
        where_sql,
        order_sql
    );
    statement
        .bind(Value::Integer(limit))
        .bind(Value::Integer(offset))
}

pub fn count(table: &Identifier, filters: &[(&Identifier, Value)]) -> Statement {
    let mut statement = Statement::new(String::new());
    let where_sql = where_clause(&mut statement, filters);
    statement.sql = format!("SELECT COUNT(*) AS count FROM {}{}", table.quoted(), where_sql);
    statement
}

pub fn select_by_id(table: &Identifier, columns: &[ColumnSchema], id: i64) -> Statement {
    Statement::new(format!(
        "SELECT {} FROM {} WHERE {} = ?",
        record_projection(columns),
        table.quoted(),
        Identifier::system_id().quoted()
    ))
    .bind(Value::Integer(id))
}

pub fn insert(
    table: &Identifier,
    columns: &[ColumnSchema],
    assignments: Vec<(&Identifier, Value)>,
) -> Statement {
    let returning = record_projection(columns);
    if assignments.is_empty() {
        return Statement::new(format!(
            "INSERT INTO {} DEFAULT VALUES RETURNING {}",
            table.quoted(),
            returning
        ));
    }
    let names: Vec<String> = assignments.iter().map(|(f, _)| f.quoted()).collect();
    let placeholders = vec!["?"; assignments.len()].join(", ");
    Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table.quoted(),
            names.join(", "),
            placeholders,
            returning
        ),
        params: assignments.into_iter().map(|(_, v)| v).collect(),
    }
}

/// Plain insert without a returning clause, used for bulk loads.
pub fn insert_row(table: &Identifier, columns: &[ColumnSchema], row: Vec<Value>) -> Statement {
    let names: Vec<String> = columns.iter().map(|c| c.field_name.quoted()).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.quoted(),
            names.join(", "),
            placeholders
        ),
        params: row,
    }
}

pub fn update(
    table: &Identifier,
    columns: &[ColumnSchema],
    id: i64,
    assignments: Vec<(&Identifier, Value)>,
) -> Statement {
    let set_clause: Vec<String> = assignments
        .iter()
        .map(|(f, _)| format!("{} = ?", f.quoted()))
        .collect();
    let mut params: Vec<Value> = assignments.into_iter().map(|(_, v)| v).collect();
    params.push(Value::Integer(id));
    Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {} = ? RETURNING {}",
            table.quoted(),
            set_clause.join(", "),
            Identifier::system_id().quoted(),
            record_projection(columns)
        ),
        params,
    }
}

pub fn delete(table: &Identifier, id: i64) -> Statement {
    Statement::new(format!(
        "DELETE FROM {} WHERE {} = ?",
        table.quoted(),
        Identifier::system_id().quoted()
    ))
    .bind(Value::Integer(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{infer_schema, InferencePolicy};
    use crate::sanitize::{sanitize_field_names, table_name_for_slug};
    use crate::value::RawValue;

    fn schema(headers: &[&str]) -> Vec<ColumnSchema> {
        let headers: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        let row: Vec<RawValue> = headers.iter().map(|_| RawValue::text("1.5")).collect();
        infer_schema(&InferencePolicy::default(), &headers, &[row], &[])
    }

    #[test]
    fn create_table_carries_constraints() {
        let mut columns = schema(&["price", "note"]);
        columns[1].data_type = DataType::Text;
        columns[1].nullable = true;
        columns[0].unique = true;
        let statement = create_table(&table_name_for_slug("sales"), &columns);
        assert_eq!(
            statement.sql,
            "CREATE TABLE IF NOT EXISTS \"ds_sales\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \
             \"price\" REAL NOT NULL UNIQUE, \"note\" TEXT NULL)"
        );
        assert!(statement.params.is_empty());
    }

    #[test]
    fn hostile_header_never_reaches_sql_text() {
        let hostile = "Robert'); DROP TABLE x;--";
        let columns = schema(&[hostile]);
        let table = table_name_for_slug("people");
        let filters = vec![(&columns[0].field_name, Value::Text(hostile.to_string()))];
        let statements = vec![
            create_table(&table, &columns),
            select_page(&table, &columns, &filters, None, 25, 0),
            count(&table, &filters),
            insert(
                &table,
                &columns,
                vec![(&columns[0].field_name, Value::Text(hostile.to_string()))],
            ),
        ];
        for statement in statements {
            let sql = statement.sql.replace(REAL_TEXT_FORMAT, "");
            assert!(!sql.contains(hostile));
            assert!(!sql.contains('\''));
            assert!(!sql.contains(';'));
        }
    }

    #[test]
    fn filters_and_ordering_are_parameterized() {
        let columns = schema(&["price", "qty"]);
        let table = table_name_for_slug("sales");
        let filters = vec![
            (&columns[1].field_name, Value::Float(3.0)),
            (&columns[0].field_name, Value::Null),
        ];
        let statement = select_page(
            &table,
            &columns,
            &filters,
            Some((&columns[0].field_name, Direction::Descending)),
            25,
            50,
        );
        assert_eq!(
            statement.sql,
            "SELECT json_array(json_array(\"id\", \
             CASE WHEN \"price\" IS NULL THEN NULL ELSE printf('%!.17g', \"price\") END, \
             CASE WHEN \"qty\" IS NULL THEN NULL ELSE printf('%!.17g', \"qty\") END)) \
             AS record FROM \"ds_sales\" WHERE \"qty\" = ? AND \"price\" IS NULL ORDER BY \"price\" DESC, \"id\" ASC \
             LIMIT ? OFFSET ?"
        );
        assert_eq!(
            statement.params,
            vec![Value::Float(3.0), Value::Integer(25), Value::Integer(50)]
        );
    }

    #[test]
    fn wide_tables_split_the_projection() {
        let headers: Vec<String> = (0..150).map(|i| format!("c{}", i)).collect();
        let names = sanitize_field_names(&headers);
        let columns: Vec<ColumnSchema> = names
            .into_iter()
            .enumerate()
            .map(|(position, field_name)| ColumnSchema {
                name: field_name.to_string(),
                field_name,
                data_type: DataType::Integer,
                nullable: true,
                unique: false,
                max_length: None,
                position,
                sample_values: Vec::new(),
            })
            .collect();
        let statement = select_by_id(&table_name_for_slug("wide"), &columns, 1);
        assert_eq!(statement.sql.matches("json_array(").count(), 3);
    }

    #[test]
    fn empty_insert_uses_default_values() {
        let columns = schema(&["price"]);
        let statement = insert(&table_name_for_slug("t"), &columns, Vec::new());
        assert!(statement.sql.starts_with("INSERT INTO \"ds_t\" DEFAULT VALUES RETURNING"));
    }

    #[test]
    fn update_binds_id_last() {
        let columns = schema(&["price"]);
        let statement = update(
            &table_name_for_slug("t"),
            &columns,
            7,
            vec![(&columns[0].field_name, Value::Float(29.99))],
        );
        assert!(statement.sql.starts_with("UPDATE \"ds_t\" SET \"price\" = ? WHERE \"id\" = ?"));
        assert_eq!(statement.params, vec![Value::Float(29.99), Value::Integer(7)]);
    }
}
