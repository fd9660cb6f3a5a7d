//! CSV and text writers for pipeline outputs.
//!
//! This module writes:
//! - ADC tables with their header row restored
//! - Merged Alexandrium rows (per sample or combined batch output)
//! - Settling distance profiles
//! - Annotation exports and their PID lists

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use super::loaders::AdcTable;
use crate::processors::alexandrium::MergedRow;
use crate::processors::annotations::{Annotation, EXPORT_COLUMNS};

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// Mismatched array lengths.
    #[error("array length mismatch: times has {times_len} elements, distances has {distances_len} elements")]
    LengthMismatch { times_len: usize, distances_len: usize },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

/// CSV writer that tags every error with the output path.
struct CsvOutput {
    path: String,
    writer: csv::Writer<BufWriter<File>>,
}

impl CsvOutput {
    fn create(path: &Path) -> Result<Self> {
        ensure_parent_dirs(path)?;
        let buf_writer = create_buffered_writer(path)?;
        Ok(Self {
            path: path.display().to_string(),
            writer: csv::Writer::from_writer(buf_writer),
        })
    }

    fn record<I, T>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer
            .write_record(fields)
            .map_err(|e| WriteError::CsvError {
                path: self.path.clone(),
                source: e,
            })
    }

    fn finish(mut self) -> Result<()> {
        self.writer.flush().map_err(|e| WriteError::WriteFile {
            path: self.path,
            source: e,
        })
    }
}

/// Empty for `None` and NaN, the way a missing join value reads in a table.
fn format_optional(value: Option<f64>) -> String {
    match value {
        Some(v) if !v.is_nan() => v.to_string(),
        _ => String::new(),
    }
}

/// Write an ADC table as CSV with its column names as the header row.
///
/// # Errors
///
/// Returns an error if the file or its parent directories cannot be created
/// or written.
pub fn write_adc_csv(path: &Path, table: &AdcTable) -> Result<()> {
    let mut out = CsvOutput::create(path)?;
    out.record(&table.headers)?;

    for row in &table.rows {
        out.record(row.iter().map(|&v| format_optional(Some(v))))?;
    }

    out.finish()
}

/// Write merged Alexandrium rows.
///
/// Columns are `pid, RoiNumber, RunTime, InhibitTime, VolumeAnalyzed,
/// isAlexandrium, TotalAlexandrium`, followed by `AlexandriumConcentration,
/// Source` when `with_batch_columns` is set.
///
/// # Example
///
/// ```no_run
/// use plankton_pipeline::core::writers::write_merged_csv;
/// use std::path::Path;
///
/// write_merged_csv(Path::new("merged.csv"), &[], false).unwrap();
/// ```
pub fn write_merged_csv(path: &Path, rows: &[MergedRow], with_batch_columns: bool) -> Result<()> {
    let mut out = CsvOutput::create(path)?;

    let mut header = vec![
        "pid",
        "RoiNumber",
        "RunTime",
        "InhibitTime",
        "VolumeAnalyzed",
        "isAlexandrium",
        "TotalAlexandrium",
    ];
    if with_batch_columns {
        header.extend(["AlexandriumConcentration", "Source"]);
    }
    out.record(&header)?;

    for row in rows {
        let mut record = vec![
            row.pid.clone(),
            row.roi_number.to_string(),
            format_optional(row.run_time),
            format_optional(row.inhibit_time),
            format_optional(row.volume_analyzed),
            u8::from(row.is_alexandrium).to_string(),
            row.total_alexandrium.to_string(),
        ];
        if with_batch_columns {
            record.push(format_optional(row.concentration));
            record.push(row.source.clone().unwrap_or_default());
        }
        out.record(&record)?;
    }

    out.finish()
}

/// Write a settling profile with `time_s,distance_m` columns.
///
/// # Errors
///
/// Returns [`WriteError::LengthMismatch`] if the slices differ in length.
pub fn write_settling_csv(path: &Path, times: &[f64], distances: &[f64]) -> Result<()> {
    if times.len() != distances.len() {
        return Err(WriteError::LengthMismatch {
            times_len: times.len(),
            distances_len: distances.len(),
        });
    }

    let mut out = CsvOutput::create(path)?;
    out.record(["time_s", "distance_m"])?;
    for (t, d) in times.iter().zip(distances.iter()) {
        out.record([t.to_string(), format!("{:.9e}", d)])?;
    }
    out.finish()
}

/// Write normalized annotations with the export column layout.
pub fn write_annotations_csv(path: &Path, rows: &[Annotation]) -> Result<()> {
    let mut out = CsvOutput::create(path)?;
    out.record(EXPORT_COLUMNS)?;

    for row in rows {
        out.record([
            &row.pid,
            &row.classname,
            &row.raw_tag,
            &row.class_tag,
            &row.last_event_time,
            &row.created_at,
            &row.dataset,
        ])?;
    }

    out.finish()
}

/// Write one PID per line.
pub fn write_pid_list<S: AsRef<str>>(path: &Path, pids: &[S]) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;
    let path_str = path.display().to_string();

    for pid in pids {
        writeln!(writer, "{}", pid.as_ref()).map_err(|e| WriteError::WriteFile {
            path: path_str.clone(),
            source: e,
        })?;
    }

    writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn merged_row(pid: &str, roi: u32, volume: Option<f64>, total: u64) -> MergedRow {
        MergedRow {
            pid: pid.to_string(),
            roi_number: roi,
            run_time: volume.map(|v| v * 240.0),
            inhibit_time: volume.map(|_| 0.0),
            volume_analyzed: volume,
            is_alexandrium: total > 0,
            total_alexandrium: total,
            concentration: volume.map(|v| total as f64 / v),
            source: Some("D20240418T084427_IFCB124".to_string()),
        }
    }

    #[test]
    fn test_write_adc_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("adc.csv");
        let table = AdcTable {
            headers: vec!["trigger#".into(), "RunTime".into()],
            rows: vec![vec![1.0, 2.5], vec![2.0, f64::NAN]],
        };

        write_adc_csv(&path, &table).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["trigger#,RunTime", "1,2.5", "2,"]);
    }

    #[test]
    fn test_write_merged_csv_sample_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("merged.csv");
        let rows = vec![
            merged_row("bin_00001", 1, Some(0.5), 1),
            merged_row("bin_00009", 9, None, 1),
        ];

        write_merged_csv(&path, &rows, false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "pid,RoiNumber,RunTime,InhibitTime,VolumeAnalyzed,isAlexandrium,TotalAlexandrium"
        );
        assert_eq!(lines[1], "bin_00001,1,120,0,0.5,1,1");
        assert_eq!(lines[2], "bin_00009,9,,,,1,1");
    }

    #[test]
    fn test_write_merged_csv_batch_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("combined.csv");
        let rows = vec![merged_row("bin_00001", 1, Some(0.5), 1)];

        write_merged_csv(&path, &rows, true).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].ends_with(",AlexandriumConcentration,Source"));
        assert!(lines[1].ends_with(",2,D20240418T084427_IFCB124"));
    }

    #[test]
    fn test_write_settling_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settling.csv");

        write_settling_csv(&path, &[0.0, 60.0], &[0.0, 0.5]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "time_s,distance_m");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("60,5.0"));
    }

    #[test]
    fn test_write_settling_csv_length_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settling.csv");

        let result = write_settling_csv(&path, &[0.0, 1.0], &[0.0]);

        match result.unwrap_err() {
            WriteError::LengthMismatch {
                times_len,
                distances_len,
            } => {
                assert_eq!(times_len, 2);
                assert_eq!(distances_len, 1);
            }
            _ => panic!("Expected LengthMismatch error"),
        }
    }

    #[test]
    fn test_write_annotations_and_pids() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("export.csv");
        let pid_path = dir.path().join("export_pids.txt");
        let rows = vec![Annotation {
            pid: "bin_00001".to_string(),
            classname: "Dinophysis".to_string(),
            raw_tag: "dividing".to_string(),
            class_tag: "Dinophysis_TAG_dividing".to_string(),
            last_event_time: "2024-04-18 08:44:27+00:00".to_string(),
            created_at: String::new(),
            dataset: "mvco".to_string(),
        }];

        write_annotations_csv(&csv_path, &rows).unwrap();
        write_pid_list(&pid_path, &["bin_00001", "bin_00002"]).unwrap();

        let content = fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "pid,classname,raw_tag,class_tag,last_event_time,created_at,dataset");
        assert_eq!(
            lines[1],
            "bin_00001,Dinophysis,dividing,Dinophysis_TAG_dividing,2024-04-18 08:44:27+00:00,,mvco"
        );

        let pids = fs::read_to_string(&pid_path).unwrap();
        assert_eq!(pids, "bin_00001\nbin_00002\n");
    }
}
