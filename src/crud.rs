//! Generic CRUD executor.
//!
//! One implementation serves every dataset: the table and its columns are
//! passed in as a [`TableView`] on each call. Field names coming from a
//! request are only ever used to look up a [`ColumnSchema`]; the SQL is built
//! from the column's sanitized identifier, and values are bound parameters.

use std::collections::BTreeMap;

use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::debug;

use crate::catalog::{find_column, ColumnSchema};
use crate::error::EngineError;
use crate::sanitize::Identifier;
use crate::sql::{self, Direction};
use crate::storage::TableStore;
use crate::value::{DataType, ParsePolicy, RawValue, Value};

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 100;

pub const PAGE_PARAM: &str = "page";
pub const PAGE_SIZE_PARAM: &str = "page_size";
pub const ORDERING_PARAM: &str = "ordering";

pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Physical table plus the columns that shape its records.
#[derive(Debug, Clone, Copy)]
pub struct TableView<'a> {
    pub table: &'a Identifier,
    pub columns: &'a [ColumnSchema],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub page: usize,
    pub page_size: usize,
    /// Field name, prefixed with `-` for descending order.
    pub ordering: Option<String>,
    /// Exact-match filters keyed by field name, values as received.
    pub filters: BTreeMap<String, String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            ordering: None,
            filters: BTreeMap::new(),
        }
    }
}

impl ListQuery {
    /// Builds a query from flat transport parameters. `page`, `page_size` and
    /// `ordering` are reserved; every other parameter is a filter.
    pub fn from_params<I, K, V>(params: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut query = ListQuery::default();
        let mut errors = BTreeMap::new();

        for (key, value) in params {
            let key = key.as_ref();
            let value: String = value.into();
            match key {
                PAGE_PARAM => match value.trim().parse::<usize>() {
                    Ok(page) => query.page = page,
                    Err(_) => {
                        errors.insert(key.to_string(), "expected a positive integer".to_string());
                    }
                },
                PAGE_SIZE_PARAM => match value.trim().parse::<usize>() {
                    Ok(size) => query.page_size = size,
                    Err(_) => {
                        errors.insert(key.to_string(), "expected a positive integer".to_string());
                    }
                },
                ORDERING_PARAM => {
                    let ordering = value.trim();
                    query.ordering = (!ordering.is_empty()).then(|| ordering.to_string());
                }
                _ => {
                    query.filters.insert(key.to_string(), value);
                }
            }
        }

        if !errors.is_empty() {
            return Err(EngineError::invalid_fields(errors));
        }
        Ok(query)
    }

    pub fn order_by(mut self, ordering: impl Into<String>) -> Self {
        self.ordering = Some(ordering.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn paginate(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: i64,
    /// Values in column position order.
    pub fields: Vec<(Identifier, Value)>,
}

impl Record {
    pub fn get(&self, field_name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name.as_str() == field_name)
            .map(|(_, value)| value)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert("id".to_string(), serde_json::Value::from(self.id));
        for (name, value) in &self.fields {
            object.insert(name.as_str().to_string(), value.to_json());
        }
        serde_json::Value::Object(object)
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("id", &self.id)?;
        for (name, value) in &self.fields {
            map.serialize_entry(name.as_str(), value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Page {
    pub count: i64,
    pub next: Option<usize>,
    pub previous: Option<usize>,
    pub results: Vec<Record>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadMode {
    /// Every non-nullable field must be present; absent fields become null.
    Full,
    /// Only the provided fields are validated and written.
    Partial,
}

#[derive(Clone)]
pub struct CrudExecutor {
    store: TableStore,
    policy: ParsePolicy,
}

impl CrudExecutor {
    pub fn new(store: TableStore, policy: ParsePolicy) -> Self {
        Self { store, policy }
    }

    pub async fn list(&self, view: TableView<'_>, query: &ListQuery) -> Result<Page, EngineError> {
        let (page, page_size) = resolve_pagination(query)?;
        let filters = parse_filters(&self.policy, view.columns, &query.filters)?;
        let ordering = parse_ordering(view.columns, query.ordering.as_deref())?;

        let offset = (page - 1)
            .checked_mul(page_size)
            .and_then(|o| i64::try_from(o).ok())
            .ok_or_else(|| EngineError::validation("page is out of range"))?;

        let count = self.store.fetch_count(sql::count(view.table, &filters)).await?;
        let rows = self
            .store
            .fetch_records(sql::select_page(
                view.table,
                view.columns,
                &filters,
                ordering,
                page_size as i64,
                offset,
            ))
            .await?;
        let results = rows
            .iter()
            .map(|row| decode_record(view.columns, row))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Listed {} of {} rows from {} (page {})",
            results.len(),
            count,
            view.table,
            page
        );

        let shown = offset.saturating_add(page_size as i64);
        Ok(Page {
            count,
            next: (shown < count).then_some(page + 1),
            previous: (page > 1).then(|| page - 1),
            results,
        })
    }

    pub async fn get(&self, view: TableView<'_>, id: i64) -> Result<Record, EngineError> {
        let rows = self
            .store
            .fetch_records(sql::select_by_id(view.table, view.columns, id))
            .await?;
        first_record(view.columns, &rows).ok_or_else(|| record_not_found(id))?
    }

    pub async fn create(&self, view: TableView<'_>, payload: &Payload) -> Result<Record, EngineError> {
        let assignments = validate_payload(&self.policy, view.columns, payload, PayloadMode::Full)?;
        let rows = self
            .store
            .fetch_records(sql::insert(view.table, view.columns, assignments))
            .await?;
        first_record(view.columns, &rows)
            .ok_or_else(|| EngineError::internal("insert returned no row"))?
    }

    pub async fn replace(
        &self,
        view: TableView<'_>,
        id: i64,
        payload: &Payload,
    ) -> Result<Record, EngineError> {
        let assignments = validate_payload(&self.policy, view.columns, payload, PayloadMode::Full)?;
        self.update(view, id, assignments).await
    }

    pub async fn patch(
        &self,
        view: TableView<'_>,
        id: i64,
        payload: &Payload,
    ) -> Result<Record, EngineError> {
        let assignments =
            validate_payload(&self.policy, view.columns, payload, PayloadMode::Partial)?;
        self.update(view, id, assignments).await
    }

    async fn update(
        &self,
        view: TableView<'_>,
        id: i64,
        assignments: Vec<(&Identifier, Value)>,
    ) -> Result<Record, EngineError> {
        if assignments.is_empty() {
            return self.get(view, id).await;
        }
        let rows = self
            .store
            .fetch_records(sql::update(view.table, view.columns, id, assignments))
            .await?;
        first_record(view.columns, &rows).ok_or_else(|| record_not_found(id))?
    }

    pub async fn delete(&self, view: TableView<'_>, id: i64) -> Result<(), EngineError> {
        let affected = self.store.execute(sql::delete(view.table, id)).await?;
        if affected == 0 {
            return Err(record_not_found(id));
        }
        Ok(())
    }
}

fn record_not_found(id: i64) -> EngineError {
    EngineError::not_found(format!("record {} not found", id))
}

fn first_record(
    columns: &[ColumnSchema],
    rows: &[Vec<serde_json::Value>],
) -> Option<Result<Record, EngineError>> {
    rows.first().map(|row| decode_record(columns, row))
}

fn resolve_pagination(query: &ListQuery) -> Result<(usize, usize), EngineError> {
    let mut errors = BTreeMap::new();
    if query.page == 0 {
        errors.insert(PAGE_PARAM.to_string(), "must be at least 1".to_string());
    }
    if query.page_size == 0 {
        errors.insert(PAGE_SIZE_PARAM.to_string(), "must be at least 1".to_string());
    }
    if !errors.is_empty() {
        return Err(EngineError::invalid_fields(errors));
    }
    Ok((query.page, query.page_size.min(MAX_PAGE_SIZE)))
}

fn parse_ordering<'a>(
    columns: &'a [ColumnSchema],
    ordering: Option<&str>,
) -> Result<Option<(&'a Identifier, Direction)>, EngineError> {
    let Some(ordering) = ordering else {
        return Ok(None);
    };
    let (name, direction) = match ordering.strip_prefix('-') {
        Some(name) => (name, Direction::Descending),
        None => (ordering, Direction::Ascending),
    };
    match find_column(columns, name) {
        Some(column) => Ok(Some((&column.field_name, direction))),
        None => {
            let mut errors = BTreeMap::new();
            errors.insert(ORDERING_PARAM.to_string(), format!("unknown field {:?}", name));
            Err(EngineError::invalid_fields(errors))
        }
    }
}

fn parse_filters<'a>(
    policy: &ParsePolicy,
    columns: &'a [ColumnSchema],
    filters: &BTreeMap<String, String>,
) -> Result<Vec<(&'a Identifier, Value)>, EngineError> {
    let mut parsed = Vec::with_capacity(filters.len());
    let mut errors = BTreeMap::new();

    for (name, raw) in filters {
        let Some(column) = find_column(columns, name) else {
            errors.insert(name.clone(), "unknown field".to_string());
            continue;
        };
        let value = if raw.is_empty() {
            if column.data_type == DataType::Text {
                Value::Text(String::new())
            } else {
                Value::Null
            }
        } else {
            match policy.parse(column.data_type, &RawValue::text(raw.as_str())) {
                Some(value) => value,
                None => {
                    errors.insert(name.clone(), type_error(column.data_type).to_string());
                    continue;
                }
            }
        };
        parsed.push((&column.field_name, value));
    }

    if !errors.is_empty() {
        return Err(EngineError::invalid_fields(errors));
    }
    Ok(parsed)
}

fn type_error(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Text => "expected a string",
        DataType::Integer => "expected an integer",
        DataType::Float => "expected a number",
        DataType::Boolean => "expected a boolean",
        DataType::Date => "expected a date (YYYY-MM-DD)",
        DataType::Datetime => "expected an ISO 8601 datetime",
    }
}

/// Converts one payload value into the column's typed value.
fn convert_field(
    policy: &ParsePolicy,
    column: &ColumnSchema,
    input: &serde_json::Value,
) -> Result<Value, String> {
    if input.is_array() || input.is_object() {
        return Err("expected a scalar value".to_string());
    }
    let raw = RawValue::from(input);
    if column.data_type != DataType::Text && matches!(&raw, RawValue::Text(s) if s.is_empty()) {
        return Ok(Value::Null);
    }
    if column.data_type == DataType::Integer && matches!(raw, RawValue::Float(f) if f.fract() != 0.0)
    {
        return Err(type_error(DataType::Integer).to_string());
    }

    let value = policy
        .parse(column.data_type, &raw)
        .ok_or_else(|| type_error(column.data_type).to_string())?;

    if let (Value::Text(text), Some(max)) = (&value, column.max_length) {
        if text.chars().count() > max {
            return Err(format!("ensure this field has no more than {} characters", max));
        }
    }
    Ok(value)
}

fn validate_payload<'a>(
    policy: &ParsePolicy,
    columns: &'a [ColumnSchema],
    payload: &Payload,
    mode: PayloadMode,
) -> Result<Vec<(&'a Identifier, Value)>, EngineError> {
    let mut errors = BTreeMap::new();
    for key in payload.keys() {
        if find_column(columns, key).is_none() {
            errors.insert(key.clone(), "unknown field".to_string());
        }
    }

    let mut assignments = Vec::with_capacity(columns.len());
    for column in columns {
        let name = column.field_name.as_str();
        let value = match payload.get(name) {
            Some(input) => match convert_field(policy, column, input) {
                Ok(value) => value,
                Err(message) => {
                    errors.insert(name.to_string(), message);
                    continue;
                }
            },
            None if mode == PayloadMode::Partial => continue,
            None if !column.nullable => {
                errors.insert(name.to_string(), "this field is required".to_string());
                continue;
            }
            None => Value::Null,
        };
        if value.is_null() && !column.nullable {
            errors.insert(name.to_string(), "this field may not be null".to_string());
            continue;
        }
        assignments.push((&column.field_name, value));
    }

    if !errors.is_empty() {
        return Err(EngineError::invalid_fields(errors));
    }
    Ok(assignments)
}

/// Decodes a flattened `[id, column_0, ...]` row into a [`Record`].
fn decode_record(
    columns: &[ColumnSchema],
    row: &[serde_json::Value],
) -> Result<Record, EngineError> {
    if row.len() != columns.len() + 1 {
        return Err(EngineError::internal(format!(
            "row has {} values, expected {}",
            row.len(),
            columns.len() + 1
        )));
    }
    let id = row[0]
        .as_i64()
        .ok_or_else(|| EngineError::internal("row id is not an integer"))?;

    let fields = columns
        .iter()
        .zip(&row[1..])
        .map(|(column, stored)| {
            Value::from_stored(column.data_type, stored)
                .map(|value| (column.field_name.clone(), value))
                .ok_or_else(|| {
                    EngineError::internal(format!(
                        "stored value for {} does not decode as {}",
                        column.field_name, column.data_type
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Record { id, fields })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::sanitize_field_names;
    use serde_json::json;

    fn columns() -> Vec<ColumnSchema> {
        let specs = [
            ("Date", DataType::Date, false, None),
            ("Price", DataType::Float, false, None),
            ("Qty", DataType::Integer, true, None),
            ("Note", DataType::Text, true, Some(10)),
            ("Active", DataType::Boolean, true, None),
        ];
        let names = sanitize_field_names(&specs.iter().map(|s| s.0).collect::<Vec<_>>());
        specs
            .iter()
            .zip(names)
            .enumerate()
            .map(|(position, ((name, data_type, nullable, max_length), field_name))| ColumnSchema {
                name: name.to_string(),
                field_name,
                data_type: *data_type,
                nullable: *nullable,
                unique: false,
                max_length: *max_length,
                position,
                sample_values: Vec::new(),
            })
            .collect()
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn field_errors(err: EngineError) -> BTreeMap<String, String> {
        match err {
            EngineError::Validation { fields, .. } => fields,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn list_query_from_params() {
        let query = ListQuery::from_params(vec![
            ("page", "2"),
            ("page_size", "500"),
            ("ordering", "-price"),
            ("qty", "3"),
        ])
        .unwrap();
        assert_eq!(query.page, 2);
        assert_eq!(query.ordering.as_deref(), Some("-price"));
        assert_eq!(query.filters.get("qty").map(String::as_str), Some("3"));
        assert_eq!(resolve_pagination(&query).unwrap(), (2, MAX_PAGE_SIZE));

        let err = ListQuery::from_params(vec![("page", "two")]).unwrap_err();
        assert!(field_errors(err).contains_key("page"));
    }

    #[test]
    fn zero_page_is_rejected() {
        let err = resolve_pagination(&ListQuery::default().paginate(0, 0)).unwrap_err();
        let fields = field_errors(err);
        assert!(fields.contains_key("page"));
        assert!(fields.contains_key("page_size"));
    }

    #[test]
    fn unknown_ordering_and_filter_fields_are_rejected() {
        let cols = columns();
        assert!(parse_ordering(&cols, Some("-bogus")).is_err());
        let (field, direction) = parse_ordering(&cols, Some("-price")).unwrap().unwrap();
        assert_eq!(field.as_str(), "price");
        assert_eq!(direction, Direction::Descending);

        let mut filters = BTreeMap::new();
        filters.insert("bogus".to_string(), "1".to_string());
        let err = parse_filters(&ParsePolicy::default(), &cols, &filters).unwrap_err();
        assert!(field_errors(err).contains_key("bogus"));
    }

    #[test]
    fn filters_are_typed_by_column() {
        let cols = columns();
        let mut filters = BTreeMap::new();
        filters.insert("qty".to_string(), "3".to_string());
        filters.insert("note".to_string(), String::new());
        filters.insert("active".to_string(), String::new());
        let parsed = parse_filters(&ParsePolicy::default(), &cols, &filters).unwrap();
        let parsed: Vec<(&str, Value)> = parsed.into_iter().map(|(f, v)| (f.as_str(), v)).collect();
        assert_eq!(
            parsed,
            vec![
                ("active", Value::Null),
                ("note", Value::Text(String::new())),
                ("qty", Value::Integer(3)),
            ]
        );

        filters.insert("qty".to_string(), "three".to_string());
        let err = parse_filters(&ParsePolicy::default(), &cols, &filters).unwrap_err();
        assert_eq!(field_errors(err)["qty"], "expected an integer");
    }

    #[test]
    fn full_payload_requires_non_nullable_fields() {
        let cols = columns();
        let err = validate_payload(
            &ParsePolicy::default(),
            &cols,
            &payload(json!({"price": "19.99"})),
            PayloadMode::Full,
        )
        .unwrap_err();
        let fields = field_errors(err);
        assert_eq!(fields["date"], "this field is required");
        assert!(!fields.contains_key("qty"));

        let assignments = validate_payload(
            &ParsePolicy::default(),
            &cols,
            &payload(json!({"date": "2024-01-01", "price": 19.99})),
            PayloadMode::Full,
        )
        .unwrap();
        assert_eq!(assignments.len(), cols.len());
        assert_eq!(assignments[2].1, Value::Null);
    }

    #[test]
    fn partial_payload_only_touches_given_fields() {
        let cols = columns();
        let assignments = validate_payload(
            &ParsePolicy::default(),
            &cols,
            &payload(json!({"price": "29.99"})),
            PayloadMode::Partial,
        )
        .unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].0.as_str(), "price");
        assert_eq!(assignments[0].1, Value::Float(29.99));
    }

    #[test]
    fn payload_values_are_checked_per_column() {
        let cols = columns();
        let err = validate_payload(
            &ParsePolicy::default(),
            &cols,
            &payload(json!({
                "id": 5,
                "price": "",
                "qty": 2.5,
                "note": "far too long for this column",
                "active": "maybe",
            })),
            PayloadMode::Partial,
        )
        .unwrap_err();
        let fields = field_errors(err);
        assert_eq!(fields["id"], "unknown field");
        assert_eq!(fields["price"], "this field may not be null");
        assert_eq!(fields["qty"], "expected an integer");
        assert!(fields["note"].contains("10 characters"));
        assert_eq!(fields["active"], "expected a boolean");
    }

    #[test]
    fn text_columns_accept_scalars() {
        let cols = columns();
        let assignments = validate_payload(
            &ParsePolicy::default(),
            &cols,
            &payload(json!({"note": 42, "qty": "7", "active": true})),
            PayloadMode::Partial,
        )
        .unwrap();
        assert_eq!(assignments[0].1, Value::Integer(7));
        assert_eq!(assignments[1].1, Value::Text("42".to_string()));
        assert_eq!(assignments[2].1, Value::Boolean(true));
    }

    #[test]
    fn records_decode_and_serialize_with_id_first() {
        let cols = columns();
        let row = vec![
            json!(7),
            json!("2024-01-01"),
            json!(19.99),
            json!(3),
            serde_json::Value::Null,
            json!(1),
        ];
        let record = decode_record(&cols, &row).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.get("qty"), Some(&Value::Integer(3)));
        assert_eq!(record.get("active"), Some(&Value::Boolean(true)));

        let text = serde_json::to_string(&record).unwrap();
        assert!(text.starts_with("{\"id\":7,\"date\":\"2024-01-01\""));
        assert_eq!(record.to_json()["price"], json!(19.99));

        assert!(decode_record(&cols, &row[..3]).is_err());
    }
}
