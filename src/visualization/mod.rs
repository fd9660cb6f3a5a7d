//! Time-series plots of Alexandrium counts and analyzed volume.
//!
//! The primary axis carries counts or concentration, the secondary axis
//! carries the analyzed volume, both against instrument run time.
//!
//! Charts have no title, axis labels or legend. The crate builds plotters
//! without a font backend, so nothing is drawn as text; series identity is
//! carried by color only (green count / blue volume per sample, palette
//! order = sample order in combined plots). Pair a plot with its CSV to
//! read values.

use std::path::Path;

use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

use crate::config::PlotConfig;
use crate::processors::alexandrium::{MergedRow, SampleResult};

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plotting error: {0}")]
    PlottingError(String),

    #[error("No plottable points")]
    EmptySeries,
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

/// Color palette for per-source series.
const SOURCE_COLORS: &[(u8, u8, u8)] = &[
    (31, 119, 180),  // Blue
    (255, 127, 14),  // Orange
    (44, 160, 44),   // Green
    (214, 39, 40),   // Red
    (148, 103, 189), // Purple
    (140, 86, 75),   // Brown
    (227, 119, 194), // Pink
    (127, 127, 127), // Gray
    (188, 189, 34),  // Olive
    (23, 190, 207),  // Cyan
];

/// Count series color for single-sample plots.
const COUNT_COLOR: RGBColor = RGBColor(0, 128, 0);

/// Volume series color for single-sample plots.
const VOLUME_COLOR: RGBColor = RGBColor(0, 0, 255);

fn plot_err<E: std::fmt::Display>(e: E) -> VisualizationError {
    VisualizationError::PlottingError(e.to_string())
}

/// Color for the `index`-th source, cycling through the palette.
pub fn source_color(index: usize) -> RGBColor {
    let c = SOURCE_COLORS[index % SOURCE_COLORS.len()];
    RGBColor(c.0, c.1, c.2)
}

/// Points `(run_time, value)` where both are known and finite.
fn series<F>(rows: &[MergedRow], value: F) -> Vec<(f64, f64)>
where
    F: Fn(&MergedRow) -> Option<f64>,
{
    rows.iter()
        .filter_map(|row| Some((row.run_time?, value(row)?)))
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect()
}

/// Min/max of one coordinate, widened when degenerate.
fn axis_range<'a, I>(values: I) -> (f64, f64)
where
    I: IntoIterator<Item = &'a f64>,
{
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
    }

    if min > max {
        return (0.0, 1.0);
    }
    if (max - min).abs() < f64::EPSILON {
        min -= 1.0;
        max += 1.0;
    }
    (min, max)
}

fn padded(range: (f64, f64)) -> std::ops::Range<f64> {
    let pad = (range.1 - range.0) * 0.05;
    (range.0 - pad)..(range.1 + pad)
}

/// One line per source on each axis.
struct DualSeries {
    primary: Vec<Vec<(f64, f64)>>,
    secondary: Vec<Vec<(f64, f64)>>,
    colors: Vec<(RGBColor, RGBColor)>,
}

fn draw_dual_axis(output_path: &Path, data: &DualSeries, config: &PlotConfig) -> Result<()> {
    let has_points = data.primary.iter().chain(data.secondary.iter()).any(|s| !s.is_empty());
    if !has_points {
        return Err(VisualizationError::EmptySeries);
    }

    let all_points = || data.primary.iter().chain(data.secondary.iter()).flatten();
    let x_range = axis_range(all_points().map(|(x, _)| x));
    let y_range = axis_range(data.primary.iter().flatten().map(|(_, y)| y));
    let y2_range = axis_range(data.secondary.iter().flatten().map(|(_, y)| y));

    let root = BitMapBackend::new(output_path, (config.width, config.height)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(padded(x_range), padded(y_range))
        .map_err(plot_err)?
        .set_secondary_coord(padded(x_range), padded(y2_range));

    chart
        .configure_mesh()
        .disable_x_mesh()
        .disable_y_mesh()
        .draw()
        .map_err(plot_err)?;

    for (points, (color, _)) in data.primary.iter().zip(data.colors.iter()) {
        chart
            .draw_series(LineSeries::new(points.iter().copied(), color.stroke_width(2)))
            .map_err(plot_err)?;
    }

    for (points, (_, color)) in data.secondary.iter().zip(data.colors.iter()) {
        chart
            .draw_secondary_series(LineSeries::new(points.iter().copied(), color.mix(0.6).stroke_width(1)))
            .map_err(plot_err)?;
    }

    root.present().map_err(plot_err)?;

    Ok(())
}

/// Plot cumulative Alexandrium count and volume analyzed against run time.
///
/// # Arguments
///
/// * `output_path` - Path to save the PNG image
/// * `rows` - Merged rows of one sample
/// * `config` - Image size
pub fn plot_sample(output_path: &Path, rows: &[MergedRow], config: &PlotConfig) -> Result<()> {
    let data = DualSeries {
        primary: vec![series(rows, |r| Some(r.total_alexandrium as f64))],
        secondary: vec![series(rows, |r| r.volume_analyzed)],
        colors: vec![(COUNT_COLOR, VOLUME_COLOR)],
    };
    draw_dual_axis(output_path, &data, config)
}

/// Plot concentration (primary axis) and volume (secondary axis) of every
/// sample, one palette color per source.
pub fn plot_combined(output_path: &Path, samples: &[SampleResult], config: &PlotConfig) -> Result<()> {
    let mut data = DualSeries {
        primary: Vec::with_capacity(samples.len()),
        secondary: Vec::with_capacity(samples.len()),
        colors: Vec::with_capacity(samples.len()),
    };

    for (i, sample) in samples.iter().enumerate() {
        let color = source_color(i);
        data.primary.push(series(&sample.rows, |r| r.concentration));
        data.secondary.push(series(&sample.rows, |r| r.volume_analyzed));
        data.colors.push((color, color));
    }

    draw_dual_axis(output_path, &data, config)
}
