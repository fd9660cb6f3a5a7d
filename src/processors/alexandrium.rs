//! Alexandrium counts against analyzed volume.
//!
//! Classifier rows are joined to the ADC rows of the same bin by ROI number,
//! giving each ROI the run and inhibit time at which it was imaged. From
//! those the analyzed volume and a running count of target detections are
//! derived.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use thiserror::Error;

use crate::config::IfcbConfig;
use crate::core::loaders::{extract_adc_headers, load_adc_data, load_class_data, AdcTable, ClassTable};
use crate::core::pid::roi_number;
use crate::processors::discovery::SamplePair;

/// Errors that can occur while merging classifier and ADC data.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Cannot extract ROI number from pid '{pid}' (row {row})")]
    InvalidPid { pid: String, row: usize },

    #[error("ADC table is missing required column '{0}'")]
    MissingColumn(String),

    #[error("Flow divisor must be positive, got {0}")]
    InvalidDivisor(f64),
}

/// One classified ROI joined with its ADC timing.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub pid: String,
    pub roi_number: u32,
    /// Run time when the ROI was triggered; `None` without a matching ADC row.
    pub run_time: Option<f64>,
    pub inhibit_time: Option<f64>,
    /// Sample volume analyzed so far, in mL.
    pub volume_analyzed: Option<f64>,
    pub is_alexandrium: bool,
    /// Running count of target detections up to and including this row.
    pub total_alexandrium: u64,
    /// `total_alexandrium / volume_analyzed`, set for batch output.
    pub concentration: Option<f64>,
    /// Bin stem the row came from, set for batch output.
    pub source: Option<String>,
}

/// A processed sample.
#[derive(Debug, Clone)]
pub struct SampleResult {
    pub pair: SamplePair,
    pub rows: Vec<MergedRow>,
}

impl SampleResult {
    /// Target detections in the whole sample.
    pub fn total_alexandrium(&self) -> u64 {
        self.rows.last().map_or(0, |r| r.total_alexandrium)
    }
}

/// Outcome of a batch run.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub samples: Vec<SampleResult>,
    pub failures: Vec<(PathBuf, String)>,
}

/// Join classifier rows to ADC rows and compute volume and cumulative counts.
///
/// ROI numbers come from the trailing token of each `pid`; ADC row `i`
/// (0-based) is ROI `i + 1`. Classifier rows without a matching ADC row keep
/// their counts but have no timing or volume.
///
/// # Errors
///
/// Returns an error if a pid has no ROI number, the configured timing columns
/// are absent from the ADC table, or the flow divisor is not positive.
pub fn process_pair(
    adc: &AdcTable,
    class: &ClassTable,
    config: &IfcbConfig,
) -> std::result::Result<Vec<MergedRow>, MergeError> {
    if config.flow_divisor <= 0.0 || config.flow_divisor.is_nan() {
        return Err(MergeError::InvalidDivisor(config.flow_divisor));
    }

    let run_idx = adc
        .column_index(&config.run_time_column)
        .ok_or_else(|| MergeError::MissingColumn(config.run_time_column.clone()))?;
    let inhibit_idx = adc
        .column_index(&config.inhibit_time_column)
        .ok_or_else(|| MergeError::MissingColumn(config.inhibit_time_column.clone()))?;

    let target_cols = class.columns_matching(&config.target_pattern);
    if target_cols.is_empty() {
        warn!(
            "No score columns match '{}'; every ROI counts as non-target",
            config.target_pattern
        );
    }

    let mut rows = Vec::with_capacity(class.len());
    let mut total = 0u64;

    for (row_idx, (pid, scores)) in class.pids.iter().zip(class.scores.iter()).enumerate() {
        let roi = roi_number(pid).ok_or_else(|| MergeError::InvalidPid {
            pid: pid.clone(),
            row: row_idx + 1,
        })?;

        let run_time = adc.value(roi, run_idx);
        let inhibit_time = adc.value(roi, inhibit_idx);
        let volume_analyzed = match (run_time, inhibit_time) {
            (Some(run), Some(inhibit)) => Some((run - inhibit) / config.flow_divisor),
            _ => None,
        };

        let is_alexandrium = target_cols
            .iter()
            .any(|&c| scores.get(c).is_some_and(|&s| s > config.score_threshold));
        if is_alexandrium {
            total += 1;
        }

        rows.push(MergedRow {
            pid: pid.clone(),
            roi_number: roi,
            run_time,
            inhibit_time,
            volume_analyzed,
            is_alexandrium,
            total_alexandrium: total,
            concentration: None,
            source: None,
        });
    }

    Ok(rows)
}

/// Tag rows with their source and compute counts per mL analyzed.
///
/// Concentration is left unset where the volume is zero or unknown.
pub fn with_concentration(rows: &mut [MergedRow], source: &str) {
    for row in rows.iter_mut() {
        row.source = Some(source.to_string());
        row.concentration = row
            .volume_analyzed
            .filter(|&v| v != 0.0 && !v.is_nan())
            .map(|v| row.total_alexandrium as f64 / v);
    }
}

/// Load the three files of a sample and merge them.
pub fn process_sample(pair: &SamplePair, config: &IfcbConfig) -> Result<SampleResult> {
    let headers = extract_adc_headers(&pair.hdr)
        .with_context(|| format!("Failed to read ADC headers from {}", pair.hdr.display()))?;
    let adc = load_adc_data(&pair.adc, &headers)
        .with_context(|| format!("Failed to load ADC data from {}", pair.adc.display()))?;
    let class = load_class_data(&pair.class)
        .with_context(|| format!("Failed to load class scores from {}", pair.class.display()))?;

    let mut rows = process_pair(&adc, &class, config)
        .with_context(|| format!("Failed to merge sample {}", pair.stem))?;
    with_concentration(&mut rows, &pair.stem);

    Ok(SampleResult {
        pair: pair.clone(),
        rows,
    })
}

/// Process samples in parallel, collecting failures instead of aborting.
///
/// Successful samples keep the order of `pairs`.
pub fn process_batch(pairs: &[SamplePair], config: &IfcbConfig) -> BatchResult {
    let outcomes: Vec<(usize, Result<SampleResult>)> = pairs
        .par_iter()
        .enumerate()
        .map(|(idx, pair)| {
            info!("Processing: {}", pair.stem);
            (idx, process_sample(pair, config))
        })
        .collect();

    let mut batch = BatchResult::default();
    for (idx, outcome) in outcomes {
        match outcome {
            Ok(sample) => batch.samples.push(sample),
            Err(e) => {
                warn!("{}: {:#}", pairs[idx].stem, e);
                batch.failures.push((pairs[idx].hdr.clone(), format!("{:#}", e)));
            }
        }
    }

    batch
}

/// Rows of all samples in one list, in sample order.
pub fn combine_rows(samples: &[SampleResult]) -> Vec<MergedRow> {
    let total: usize = samples.iter().map(|s| s.rows.len()).sum();
    let mut rows = Vec::with_capacity(total);
    for sample in samples {
        rows.extend(sample.rows.iter().cloned());
    }
    rows
}

/// Default output path of a sample plot: `<dir>/<stem>_alexandrium_plot.png`.
pub fn sample_plot_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{}_alexandrium_plot.png", stem))
}
