//! Data loaders for IFCB instrument and classifier files.
//!
//! This module provides parsers for:
//! - `.hdr` header files (`key: value` lines, including the `ADCFileFormat` column list)
//! - `.adc` data files (headerless numeric CSV, one row per ROI)
//! - Classifier score CSV files (a `pid` column plus one score column per class)

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use thiserror::Error;

/// Key of the header line listing the ADC columns.
pub const ADC_FORMAT_KEY: &str = "ADCFileFormat";

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Empty file: {0}")]
    EmptyFile(PathBuf),

    #[error("ADCFileFormat not found in header file: {0}")]
    MissingAdcFormat(PathBuf),

    #[error("Missing required columns: {0}")]
    MissingColumns(String),

    #[error("Row {line} has {found} columns but only {expected} headers are defined")]
    ColumnCount {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Parsed `.hdr` file.
#[derive(Debug, Clone, Default)]
pub struct HdrFile {
    /// `key: value` pairs in file order.
    pub fields: Vec<(String, String)>,
    /// Column names from the `ADCFileFormat` line.
    pub adc_headers: Vec<String>,
}

impl HdrFile {
    /// Value of the first field with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Rows of an `.adc` file with column names taken from the header file.
#[derive(Debug, Clone, Default)]
pub struct AdcTable {
    /// Column names, at most as many as the widest row.
    pub headers: Vec<String>,
    /// Numeric rows; row `i` describes ROI number `i + 1`.
    pub rows: Vec<Vec<f64>>,
}

impl AdcTable {
    /// Returns the number of ROI rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a named column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Value of a column for a 1-based ROI number, if both exist.
    pub fn value(&self, roi: u32, column: usize) -> Option<f64> {
        let row = self.rows.get((roi as usize).checked_sub(1)?)?;
        row.get(column).copied()
    }
}

/// Classifier output: one row per ROI with a score per class.
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    /// ROI identifiers in file order.
    pub pids: Vec<String>,
    /// Names of the score columns.
    pub class_names: Vec<String>,
    /// Scores, shape [rows][class_names].
    pub scores: Vec<Vec<f64>>,
}

impl ClassTable {
    #[inline]
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Indices of score columns whose name contains `pattern`.
    pub fn columns_matching(&self, pattern: &str) -> Vec<usize> {
        self.class_names
            .iter()
            .enumerate()
            .filter(|(_, name)| name.contains(pattern))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Split a header line into key and value on the first colon.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((key.trim(), value.trim()))
}

fn parse_column_list(value: &str) -> Vec<String> {
    value.split(',').map(|h| h.trim().to_string()).collect()
}

/// Extract the ADC column names from a `.hdr` file.
///
/// The first line starting with `ADCFileFormat:` is used; its value is split
/// on commas and each name trimmed.
///
/// # Errors
///
/// Returns [`LoaderError::MissingAdcFormat`] if no such line exists.
pub fn extract_adc_headers<P: AsRef<Path>>(hdr_path: P) -> Result<Vec<String>> {
    let path = hdr_path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let prefix = format!("{}:", ADC_FORMAT_KEY);

    for line in reader.lines() {
        let line = line?;
        if let Some(rest) = line.strip_prefix(&prefix) {
            return Ok(parse_column_list(rest.trim()));
        }
    }

    Err(LoaderError::MissingAdcFormat(path.to_path_buf()))
}

/// Load every `key: value` field of a `.hdr` file.
///
/// Lines without a colon are ignored.
///
/// # Errors
///
/// Returns an error if the file cannot be read or has no `ADCFileFormat` line.
pub fn load_hdr<P: AsRef<Path>>(hdr_path: P) -> Result<HdrFile> {
    let path = hdr_path.as_ref();
    let reader = BufReader::new(File::open(path)?);

    let mut hdr = HdrFile::default();
    let mut found_format = false;

    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = split_field(&line) else {
            continue;
        };
        if key == ADC_FORMAT_KEY && !found_format && line.starts_with(ADC_FORMAT_KEY) {
            hdr.adc_headers = parse_column_list(value);
            found_format = true;
        }
        hdr.fields.push((key.to_string(), value.to_string()));
    }

    if !found_format {
        return Err(LoaderError::MissingAdcFormat(path.to_path_buf()));
    }

    Ok(hdr)
}

/// Load a headerless `.adc` file and label its columns.
///
/// Columns are named from the front of `headers`; extra header names beyond
/// the widest row are dropped. Empty fields load as NaN.
///
/// # Errors
///
/// Returns an error if a row is wider than `headers`, a field is not numeric,
/// or the file has no rows.
pub fn load_adc_data<P: AsRef<Path>>(adc_path: P, headers: &[String]) -> Result<AdcTable> {
    let path = adc_path.as_ref();
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let mut rows = Vec::with_capacity(1024);
    let mut width = 0;

    for (line_idx, result) in reader.records().enumerate() {
        let record = result?;
        let line = line_idx + 1;

        if record.len() > headers.len() {
            return Err(LoaderError::ColumnCount {
                line,
                expected: headers.len(),
                found: record.len(),
            });
        }

        let mut row = Vec::with_capacity(record.len());
        for (col, field) in record.iter().enumerate() {
            let field = field.trim();
            let value = if field.is_empty() {
                f64::NAN
            } else {
                field.parse::<f64>().map_err(|_| {
                    LoaderError::ParseError(format!(
                        "{}: line {}, column {}: invalid number '{}'",
                        path.display(),
                        line,
                        headers[col],
                        field
                    ))
                })?
            };
            row.push(value);
        }

        width = width.max(row.len());
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(AdcTable {
        headers: headers[..width].to_vec(),
        rows,
    })
}

/// Load a classifier score CSV.
///
/// The `pid` column is required; all other columns are treated as class
/// scores, with unparseable values loaded as NaN.
///
/// # Errors
///
/// Returns an error if the file cannot be read or lacks a `pid` column.
pub fn load_class_data<P: AsRef<Path>>(class_path: P) -> Result<ClassTable> {
    let path = class_path.as_ref();
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let headers = reader.headers()?.clone();
    let col_map: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim(), i))
        .collect();

    let pid_idx = col_map
        .get("pid")
        .copied()
        .ok_or_else(|| LoaderError::MissingColumns("pid".to_string()))?;

    let score_cols: Vec<usize> = (0..headers.len()).filter(|&i| i != pid_idx).collect();
    let class_names: Vec<String> = score_cols
        .iter()
        .map(|&i| headers[i].trim().to_string())
        .collect();

    let mut table = ClassTable {
        pids: Vec::with_capacity(1024),
        class_names,
        scores: Vec::with_capacity(1024),
    };

    for result in reader.records() {
        let record = result?;
        let pid = record.get(pid_idx).unwrap_or_default().trim().to_string();

        let scores: Vec<f64> = score_cols
            .iter()
            .map(|&i| {
                record
                    .get(i)
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(f64::NAN)
            })
            .collect();

        table.pids.push(pid);
        table.scores.push(scores);
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extract_adc_headers() -> Result<()> {
        let file = write_temp(&[
            "softwareVersion: Imaging FlowCytobot Acquire 3.0",
            "runTime: 1200.5",
            "ADCFileFormat: trigger#, ADC_time, PMTA, RunTime, InhibitTime",
            "ADCFileFormat: ignored, second",
        ]);

        let names = extract_adc_headers(file.path())?;
        assert_eq!(names, headers(&["trigger#", "ADC_time", "PMTA", "RunTime", "InhibitTime"]));
        Ok(())
    }

    #[test]
    fn test_extract_adc_headers_missing() {
        let file = write_temp(&["runTime: 1200.5", "inhibitTime: 30.1"]);
        let err = extract_adc_headers(file.path()).unwrap_err();
        assert!(matches!(err, LoaderError::MissingAdcFormat(_)));
    }

    #[test]
    fn test_load_hdr_fields() -> Result<()> {
        let file = write_temp(&[
            "softwareVersion: Imaging FlowCytobot Acquire 3.0",
            "no colon here",
            "runTime: 1200.5",
            "ADCFileFormat: trigger#, RunTime, InhibitTime",
        ]);

        let hdr = load_hdr(file.path())?;
        assert_eq!(hdr.get("runTime"), Some("1200.5"));
        assert_eq!(hdr.get("softwareVersion"), Some("Imaging FlowCytobot Acquire 3.0"));
        assert_eq!(hdr.adc_headers, headers(&["trigger#", "RunTime", "InhibitTime"]));
        assert_eq!(hdr.fields.len(), 3);
        Ok(())
    }

    #[test]
    fn test_load_adc_data_truncates_headers() -> Result<()> {
        let file = write_temp(&["1,10.5,2.0", "2,20.5,4.0"]);
        let names = headers(&["trigger#", "RunTime", "InhibitTime", "Unused"]);

        let table = load_adc_data(file.path(), &names)?;
        assert_eq!(table.len(), 2);
        assert_eq!(table.headers, headers(&["trigger#", "RunTime", "InhibitTime"]));
        assert_eq!(table.column_index("RunTime"), Some(1));
        assert_eq!(table.value(2, 1), Some(20.5));
        assert_eq!(table.value(3, 1), None);
        assert_eq!(table.value(0, 1), None);
        Ok(())
    }

    #[test]
    fn test_load_adc_data_empty_field_is_nan() -> Result<()> {
        let file = write_temp(&["1,,2.0"]);
        let table = load_adc_data(file.path(), &headers(&["a", "b", "c"]))?;
        assert!(table.rows[0][1].is_nan());
        Ok(())
    }

    #[test]
    fn test_load_adc_data_too_many_columns() {
        let file = write_temp(&["1,2,3"]);
        let err = load_adc_data(file.path(), &headers(&["a", "b"])).unwrap_err();
        assert!(matches!(
            err,
            LoaderError::ColumnCount { line: 1, expected: 2, found: 3 }
        ));
    }

    #[test]
    fn test_load_adc_data_invalid_number() {
        let file = write_temp(&["1,abc"]);
        let err = load_adc_data(file.path(), &headers(&["a", "b"])).unwrap_err();
        assert!(matches!(err, LoaderError::ParseError(_)));
    }

    #[test]
    fn test_load_class_data() -> Result<()> {
        let file = write_temp(&[
            "pid,Alexandrium_catenella,Dinophysis,detritus",
            "D20240418T084427_IFCB124_00001,0.97,0.01,0.02",
            "D20240418T084427_IFCB124_00002,0.10,,0.90",
        ]);

        let table = load_class_data(file.path())?;
        assert_eq!(table.len(), 2);
        assert_eq!(table.class_names, headers(&["Alexandrium_catenella", "Dinophysis", "detritus"]));
        assert_eq!(table.scores[0][0], 0.97);
        assert!(table.scores[1][1].is_nan());
        assert_eq!(table.columns_matching("Alexandrium"), vec![0]);
        Ok(())
    }

    #[test]
    fn test_load_class_data_requires_pid() {
        let file = write_temp(&["roi,score", "1,0.5"]);
        let err = load_class_data(file.path()).unwrap_err();
        assert!(matches!(err, LoaderError::MissingColumns(_)));
    }
}
