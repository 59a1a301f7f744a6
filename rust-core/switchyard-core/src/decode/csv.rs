//! # CSV Decoder
//!
//! Tabular decoding on top of the `csv` crate with optional per-field
//! predicates. Validation is fail-fast: the first cell rejected by a
//! predicate aborts the whole decode and no partial table is returned.

use crate::decode::Format;
use crate::error::DecodeError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Default maximum number of data rows
pub const DEFAULT_MAX_ROWS: usize = 10_000;

/// Predicate applied to every value of one column
pub type FieldPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// CSV decode settings
#[derive(Clone)]
pub struct CsvOptions {
    /// Field delimiter
    pub delimiter: u8,
    /// Whether the first record names the columns
    ///
    /// Without a header row columns are named by zero-based index (`"0"`, `"1"`, ...).
    pub has_headers: bool,
    /// Maximum number of data rows
    pub max_rows: usize,
    /// Column name to predicate
    pub validators: HashMap<String, FieldPredicate>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_headers: true,
            max_rows: DEFAULT_MAX_ROWS,
            validators: HashMap::new(),
        }
    }
}

impl fmt::Debug for CsvOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<&String> = self.validators.keys().collect();
        fields.sort();
        f.debug_struct("CsvOptions")
            .field("delimiter", &char::from(self.delimiter))
            .field("has_headers", &self.has_headers)
            .field("max_rows", &self.max_rows)
            .field("validators", &fields)
            .finish()
    }
}

impl CsvOptions {
    /// Create options with defaults (comma, header row)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the field delimiter
    #[must_use]
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Treat the first record as data
    #[must_use]
    pub fn without_headers(mut self) -> Self {
        self.has_headers = false;
        self
    }

    /// Set the row ceiling
    #[must_use]
    pub fn max_rows(mut self, rows: usize) -> Self {
        self.max_rows = rows;
        self
    }

    /// Register a predicate for a column
    #[must_use]
    pub fn validate<F>(mut self, field: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.validators.insert(field.into(), Arc::new(predicate));
        self
    }
}

/// Decoded table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvTable {
    /// Column names
    pub headers: Vec<String>,
    /// Data rows, each with one value per column
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    /// Value at `row` for column `field`
    #[must_use]
    pub fn get(&self, row: usize, field: &str) -> Option<&str> {
        let col = self.headers.iter().position(|h| h == field)?;
        self.rows.get(row)?.get(col).map(String::as_str)
    }

    /// Number of data rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no data rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Decode CSV bytes
///
/// Validators for columns the table does not have are evaluated against the
/// empty string, so a predicate can express "required".
///
/// # Errors
///
/// - `MalformedPayload` for invalid UTF-8 or rows whose width differs from the header
/// - `PayloadTooLarge` (scope `rows`) past `max_rows`
/// - `SchemaValidationFailed` with the first offending field and zero-based row
pub fn decode(bytes: &[u8], options: &CsvOptions) -> Result<CsvTable, DecodeError> {
    let mut reader = ::csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(options.has_headers)
        .flexible(false)
        .from_reader(bytes);

    let mut headers: Vec<String> = if options.has_headers {
        reader
            .headers()
            .map_err(|e| DecodeError::malformed(Format::Csv, e))?
            .iter()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let mut rows = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| DecodeError::malformed(Format::Csv, e))?;
        if row >= options.max_rows {
            return Err(DecodeError::PayloadTooLarge {
                scope: "rows",
                limit: options.max_rows,
                actual: row + 1,
            });
        }
        if headers.is_empty() {
            headers = (0..record.len()).map(|i| i.to_string()).collect();
        }

        let values: Vec<String> = record.iter().map(str::to_string).collect();
        validate_row(&headers, &values, row, options)?;
        rows.push(values);
    }

    Ok(CsvTable { headers, rows })
}

fn validate_row(
    headers: &[String],
    values: &[String],
    row: usize,
    options: &CsvOptions,
) -> Result<(), DecodeError> {
    if options.validators.is_empty() {
        return Ok(());
    }

    for (field, value) in headers.iter().zip(values) {
        if let Some(predicate) = options.validators.get(field) {
            if !predicate(value.as_str()) {
                return Err(DecodeError::SchemaValidationFailed {
                    field: field.clone(),
                    row,
                });
            }
        }
    }

    let mut missing: Vec<(&String, &FieldPredicate)> = options
        .validators
        .iter()
        .filter(|(field, _)| !headers.contains(*field))
        .collect();
    missing.sort_by(|a, b| a.0.cmp(b.0));
    for (field, predicate) in missing {
        if !predicate("") {
            return Err(DecodeError::SchemaValidationFailed {
                field: field.clone(),
                row,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEOPLE: &[u8] = b"name,age\nada,36\ngrace,45\n";

    #[test]
    fn test_decode_with_headers() {
        let table = decode(PEOPLE, &CsvOptions::default()).unwrap();
        assert_eq!(table.headers, vec!["name", "age"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1, "name"), Some("grace"));
        assert_eq!(table.get(0, "age"), Some("36"));
        assert_eq!(table.get(0, "email"), None);
    }

    #[test]
    fn test_custom_delimiter_without_headers() {
        let options = CsvOptions::new().delimiter(b';').without_headers();
        let table = decode(b"a;b\nc;d\n", &options).unwrap();
        assert_eq!(table.headers, vec!["0", "1"]);
        assert_eq!(table.get(1, "1"), Some("d"));
    }

    #[test]
    fn test_validation_reports_first_offending_row() {
        let options = CsvOptions::new()
            .validate("age", |v| v.parse::<u8>().is_ok())
            .validate("name", |v| !v.is_empty());
        let err = decode(b"name,age\nada,36\nbob,old\n,x\n", &options).unwrap_err();
        assert_eq!(
            err,
            DecodeError::SchemaValidationFailed {
                field: "age".to_string(),
                row: 1,
            }
        );
    }

    #[test]
    fn test_validation_checks_columns_in_order() {
        let options = CsvOptions::new()
            .validate("age", |v| v.parse::<u8>().is_ok())
            .validate("name", |v| !v.is_empty());
        let err = decode(b"name,age\n,x\n", &options).unwrap_err();
        assert_eq!(
            err,
            DecodeError::SchemaValidationFailed {
                field: "name".to_string(),
                row: 0,
            }
        );
    }

    #[test]
    fn test_validator_for_missing_column() {
        let options = CsvOptions::new().validate("email", |v| !v.is_empty());
        let err = decode(PEOPLE, &options).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::SchemaValidationFailed { ref field, row: 0 } if field == "email"
        ));
    }

    #[test]
    fn test_ragged_rows_are_malformed() {
        let err = decode(b"a,b\n1,2,3\n", &CsvOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedPayload {
                format: Format::Csv,
                ..
            }
        ));
    }

    #[test]
    fn test_row_ceiling() {
        let options = CsvOptions::new().max_rows(1);
        let err = decode(PEOPLE, &options).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PayloadTooLarge { scope: "rows", limit: 1, .. }
        ));
    }
}
