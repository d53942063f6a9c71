use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use crate::error::EngineError;
use crate::value::{DataType, RawValue};

pub const DEFAULT_MAX_ROWS: usize = 100_000;
pub const DEFAULT_MAX_COLUMNS: usize = 100;

/// Rows and headers as handed to inference. Rows are padded or truncated to
/// the header width.
#[derive(Debug, Clone, PartialEq)]
pub struct TabularData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<RawValue>>,
    /// Per-column type hints from the source container, when it has any.
    pub hints: Vec<Option<DataType>>,
}

impl TabularData {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<RawValue>>) -> Self {
        let hints = vec![None; headers.len()];
        Self {
            headers,
            rows,
            hints,
        }
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileParser {
    max_rows: usize,
    max_columns: usize,
}

impl Default for FileParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROWS, DEFAULT_MAX_COLUMNS)
    }
}

impl FileParser {
    pub fn new(max_rows: usize, max_columns: usize) -> Self {
        Self {
            max_rows,
            max_columns,
        }
    }

    /// `(max_rows, max_columns)`
    pub fn limits(&self) -> (usize, usize) {
        (self.max_rows, self.max_columns)
    }

    pub fn parse_file(&self, path: &Path) -> Result<TabularData, EngineError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if extension != "csv" {
            return Err(EngineError::Ingestion {
                message: format!("Unsupported file format: .{}", extension),
            });
        }
        info!("Parsing file: {}", path.display());
        let bytes = std::fs::read(path)?;
        self.parse_csv(&bytes)
    }

    /// Parses CSV bytes. Invalid UTF-8 sequences are replaced rather than
    /// rejected.
    pub fn parse_csv(&self, bytes: &[u8]) -> Result<TabularData, EngineError> {
        let text = String::from_utf8_lossy(bytes);
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let raw_headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let width = raw_headers.len();

        let mut rows: Vec<Vec<Option<String>>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut row: Vec<Option<String>> = record
                .iter()
                .take(width)
                .map(|cell| (!cell.trim().is_empty()).then(|| cell.to_string()))
                .collect();
            if row.iter().all(Option::is_none) {
                continue;
            }
            row.resize(width, None);
            rows.push(row);
            if rows.len() > self.max_rows {
                return Err(EngineError::Ingestion {
                    message: format!("Too many rows. Maximum is {}.", self.max_rows),
                });
            }
        }

        let kept: Vec<usize> = (0..width)
            .filter(|&i| rows.iter().any(|row| row[i].is_some()))
            .collect();
        if kept.len() < width {
            debug!("Dropping {} empty columns", width - kept.len());
        }

        if kept.len() > self.max_columns {
            return Err(EngineError::Ingestion {
                message: format!(
                    "Too many columns ({}). Maximum is {}.",
                    kept.len(),
                    self.max_columns
                ),
            });
        }
        if rows.is_empty() {
            return Err(EngineError::Ingestion {
                message: "File contains no data rows.".to_string(),
            });
        }
        if kept.is_empty() {
            return Err(EngineError::Ingestion {
                message: "File contains no columns.".to_string(),
            });
        }

        let headers = normalize_headers(kept.iter().map(|&i| raw_headers[i].as_str()));
        let rows = rows
            .into_iter()
            .map(|row| {
                kept.iter()
                    .map(|&i| match &row[i] {
                        Some(cell) => RawValue::Text(cell.clone()),
                        None => RawValue::Null,
                    })
                    .collect()
            })
            .collect();

        let data = TabularData::new(headers, rows);
        info!(
            "Parsed {} rows, {} columns",
            data.row_count(),
            data.column_count()
        );
        Ok(data)
    }
}

/// Blank headers become `column_<i>`; repeated headers get `_1`, `_2`, ...
fn normalize_headers<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    headers
        .enumerate()
        .map(|(i, header)| {
            if header.is_empty() {
                format!("column_{}", i)
            } else {
                header.to_string()
            }
        })
        .map(|header| match seen.get_mut(&header) {
            Some(count) => {
                *count += 1;
                format!("{}_{}", header, count)
            }
            None => {
                seen.insert(header.clone(), 0);
                header
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_rows() {
        let data = FileParser::default()
            .parse_csv(b"date,price,qty\n2024-01-01,19.99,3\n2024-01-02,5.00,\n")
            .unwrap();
        assert_eq!(data.headers, vec!["date", "price", "qty"]);
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[1][2], RawValue::Null);
        assert_eq!(data.rows[0][1], RawValue::text("19.99"));
        assert_eq!(data.hints, vec![None, None, None]);
    }

    #[test]
    fn drops_empty_rows_and_columns() {
        let data = FileParser::default()
            .parse_csv(b"a,empty,b\n1,,2\n,,\n3,,\n")
            .unwrap();
        assert_eq!(data.headers, vec!["a", "b"]);
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[1], vec![RawValue::text("3"), RawValue::Null]);
    }

    #[test]
    fn renames_blank_and_duplicate_headers() {
        let data = FileParser::default()
            .parse_csv(b"name,,name,name\nx,y,z,w\n")
            .unwrap();
        assert_eq!(data.headers, vec!["name", "column_1", "name_1", "name_2"]);
    }

    #[test]
    fn enforces_limits() {
        let parser = FileParser::new(1, 2);
        let err = parser.parse_csv(b"a\n1\n2\n").unwrap_err();
        assert!(matches!(err, EngineError::Ingestion { .. }));
        let err = parser.parse_csv(b"a,b,c\n1,2,3\n").unwrap_err();
        assert!(err.to_string().contains("Too many columns"));
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = FileParser::default().parse_csv(b"a,b\n").unwrap_err();
        assert!(err.to_string().contains("no data rows"));
        assert!(FileParser::default().parse_csv(b"").is_err());
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let data = FileParser::default()
            .parse_csv(b"name\ncaf\xe9\n")
            .unwrap();
        assert_eq!(data.rows[0][0], RawValue::text("caf\u{fffd}"));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = FileParser::default()
            .parse_file(Path::new("data.xlsx"))
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported file format"));
    }
}
