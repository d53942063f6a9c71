use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;

use crate::catalog::{ColumnSchema, DatasetSchema, DatasetStatus};
use crate::error::EngineError;
use crate::sanitize::Identifier;
use crate::schema::{dataset_columns, datasets};
use crate::value::DataType;

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = datasets)]
#[diesel(primary_key(slug))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DatasetRow {
    pub slug: String,
    pub name: String,
    pub original_filename: String,
    pub table_name: String,
    pub status: String,
    pub error_message: String,
    pub row_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = datasets)]
pub struct NewDatasetRow<'a> {
    pub slug: &'a str,
    pub name: &'a str,
    pub original_filename: &'a str,
    pub table_name: &'a str,
    pub status: &'a str,
    pub error_message: &'a str,
    pub row_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone)]
#[diesel(table_name = dataset_columns)]
#[diesel(belongs_to(DatasetRow, foreign_key = dataset_slug))]
#[diesel(primary_key(dataset_slug, position))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ColumnRow {
    pub dataset_slug: String,
    pub position: i32,
    pub name: String,
    pub field_name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_unique: bool,
    pub max_length: Option<i32>,
    pub sample_values: String,
}

#[derive(Insertable)]
#[diesel(table_name = dataset_columns)]
pub struct NewColumnRow<'a> {
    pub dataset_slug: &'a str,
    pub position: i32,
    pub name: &'a str,
    pub field_name: &'a str,
    pub data_type: &'a str,
    pub nullable: bool,
    pub is_unique: bool,
    pub max_length: Option<i32>,
    pub sample_values: String,
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::internal(format!("invalid stored timestamp {:?}: {}", value, e)))
}

fn to_i32(value: usize, what: &str) -> Result<i32, EngineError> {
    i32::try_from(value).map_err(|_| EngineError::internal(format!("{} {} out of range", what, value)))
}

impl<'a> NewDatasetRow<'a> {
    pub fn from_schema(schema: &'a DatasetSchema) -> Self {
        Self {
            slug: &schema.slug,
            name: &schema.name,
            original_filename: &schema.original_filename,
            table_name: schema.table_name.as_str(),
            status: schema.status.as_str(),
            error_message: &schema.error_message,
            row_count: schema.row_count,
            created_at: format_timestamp(&schema.created_at),
            updated_at: format_timestamp(&schema.updated_at),
        }
    }
}

impl<'a> NewColumnRow<'a> {
    pub fn from_column(slug: &'a str, column: &'a ColumnSchema) -> Result<Self, EngineError> {
        Ok(Self {
            dataset_slug: slug,
            position: to_i32(column.position, "column position")?,
            name: &column.name,
            field_name: column.field_name.as_str(),
            data_type: column.data_type.as_str(),
            nullable: column.nullable,
            is_unique: column.unique,
            max_length: column
                .max_length
                .map(|len| to_i32(len, "max length"))
                .transpose()?,
            sample_values: serde_json::to_string(&column.sample_values)?,
        })
    }
}

impl TryFrom<ColumnRow> for ColumnSchema {
    type Error = EngineError;

    fn try_from(row: ColumnRow) -> Result<Self, Self::Error> {
        let data_type = DataType::parse_name(&row.data_type).ok_or_else(|| {
            EngineError::internal(format!("unknown stored data type {:?}", row.data_type))
        })?;
        let sample_values: Vec<serde_json::Value> =
            serde_json::from_str(&row.sample_values).unwrap_or_default();

        Ok(ColumnSchema {
            name: row.name,
            field_name: Identifier::from_stored(&row.field_name)?,
            data_type,
            nullable: row.nullable,
            unique: row.is_unique,
            max_length: row.max_length.and_then(|len| usize::try_from(len).ok()),
            position: usize::try_from(row.position).map_err(|_| {
                EngineError::internal(format!("negative stored position {}", row.position))
            })?,
            sample_values,
        })
    }
}

impl DatasetRow {
    pub fn into_schema(self, columns: Vec<ColumnRow>) -> Result<DatasetSchema, EngineError> {
        let status = DatasetStatus::parse(&self.status).ok_or_else(|| {
            EngineError::internal(format!("unknown stored status {:?}", self.status))
        })?;
        let columns = columns
            .into_iter()
            .map(ColumnSchema::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DatasetSchema {
            table_name: Identifier::from_stored(&self.table_name)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            slug: self.slug,
            name: self.name,
            original_filename: self.original_filename,
            columns,
            row_count: self.row_count,
            status,
            error_message: self.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_row(field_name: &str) -> ColumnRow {
        ColumnRow {
            dataset_slug: "sales".to_string(),
            position: 0,
            name: "Price".to_string(),
            field_name: field_name.to_string(),
            data_type: "float".to_string(),
            nullable: false,
            is_unique: true,
            max_length: None,
            sample_values: "[19.99, 5.0]".to_string(),
        }
    }

    #[test]
    fn stored_columns_convert_back() {
        let column = ColumnSchema::try_from(column_row("price")).unwrap();
        assert_eq!(column.field_name.as_str(), "price");
        assert_eq!(column.data_type, DataType::Float);
        assert!(column.unique);
        assert_eq!(column.sample_values.len(), 2);
    }

    #[test]
    fn tampered_field_names_are_rejected() {
        let err = ColumnSchema::try_from(column_row("price\"; DROP TABLE x")).unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }));
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(&now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
