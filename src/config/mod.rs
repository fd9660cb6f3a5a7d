//! Configuration types for the plankton pipeline.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for the terminal velocity solver and the syringe settling profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlingConfig {
    /// Convergence tolerance for the drag iteration
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Iteration cap for the drag iteration
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Stokes Reynolds number at or below which the closed form is used
    #[serde(default = "default_re_threshold")]
    pub re_threshold: f64,

    /// Fail instead of returning a best-effort velocity when the cap is hit
    #[serde(default)]
    pub require_convergence: bool,

    /// Fluid density in kg/m^3 (seawater)
    #[serde(default = "default_fluid_density")]
    pub fluid_density: f64,

    /// Dynamic viscosity in Pa*s
    #[serde(default = "default_viscosity")]
    pub viscosity: f64,

    /// Depth in the syringe where particles start, in m
    #[serde(default)]
    pub start_depth_m: f64,

    /// Depth of the syringe bottom, in m
    #[serde(default = "default_bottom_depth")]
    pub bottom_depth_m: f64,

    /// Length of the settling profile, in s
    #[serde(default = "default_duration")]
    pub duration_s: f64,

    /// Sampling interval of the settling profile, in s
    #[serde(default = "default_time_step")]
    pub time_step_s: f64,
}

fn default_tolerance() -> f64 {
    crate::settling::DEFAULT_TOLERANCE
}

fn default_max_iter() -> usize {
    crate::settling::DEFAULT_MAX_ITER
}

fn default_re_threshold() -> f64 {
    crate::settling::DEFAULT_RE_THRESHOLD
}

fn default_fluid_density() -> f64 {
    1025.0
}

fn default_viscosity() -> f64 {
    0.001
}

fn default_bottom_depth() -> f64 {
    0.1
}

fn default_duration() -> f64 {
    3600.0
}

fn default_time_step() -> f64 {
    60.0
}

impl Default for SettlingConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            max_iter: default_max_iter(),
            re_threshold: default_re_threshold(),
            require_convergence: false,
            fluid_density: default_fluid_density(),
            viscosity: default_viscosity(),
            start_depth_m: 0.0,
            bottom_depth_m: default_bottom_depth(),
            duration_s: default_duration(),
            time_step_s: default_time_step(),
        }
    }
}

/// Settings for IFCB file pairing and the Alexandrium merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfcbConfig {
    /// Suffix appended to a bin stem to find its classifier output
    #[serde(default = "default_class_suffix")]
    pub class_suffix: String,

    /// ADC column holding the run time
    #[serde(default = "default_run_time_column")]
    pub run_time_column: String,

    /// ADC column holding the inhibit time
    #[serde(default = "default_inhibit_time_column")]
    pub inhibit_time_column: String,

    /// Divisor turning (run - inhibit) time into analyzed volume in mL
    #[serde(default = "default_flow_divisor")]
    pub flow_divisor: f64,

    /// Substring identifying target class score columns
    #[serde(default = "default_target_pattern")]
    pub target_pattern: String,

    /// Score above which an ROI counts as the target class
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
}

fn default_class_suffix() -> String {
    "_class_vNone.csv".to_string()
}

fn default_run_time_column() -> String {
    "RunTime".to_string()
}

fn default_inhibit_time_column() -> String {
    "InhibitTime".to_string()
}

fn default_flow_divisor() -> f64 {
    240.0
}

fn default_target_pattern() -> String {
    "Alexandrium_catenella".to_string()
}

fn default_score_threshold() -> f64 {
    0.95
}

impl Default for IfcbConfig {
    fn default() -> Self {
        Self {
            class_suffix: default_class_suffix(),
            run_time_column: default_run_time_column(),
            inhibit_time_column: default_inhibit_time_column(),
            flow_divisor: default_flow_divisor(),
            target_pattern: default_target_pattern(),
            score_threshold: default_score_threshold(),
        }
    }
}

/// Settings for PNG plots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotConfig {
    #[serde(default = "default_plot_width")]
    pub width: u32,

    #[serde(default = "default_plot_height")]
    pub height: u32,

    /// Write a PNG for each sample during batch runs
    #[serde(default = "default_per_sample")]
    pub per_sample: bool,
}

fn default_plot_width() -> u32 {
    1000
}

fn default_plot_height() -> u32 {
    600
}

fn default_per_sample() -> bool {
    true
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            width: default_plot_width(),
            height: default_plot_height(),
            per_sample: default_per_sample(),
        }
    }
}

/// Settings for the human annotation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationConfig {
    /// Datasets exported when none are given on the command line
    #[serde(default = "default_datasets")]
    pub datasets: Vec<String>,
}

fn default_datasets() -> Vec<String> {
    [
        "NESLTER_broadscale", "SKQ202309T", "SKQ202310S", "SKQ202311S", "SKQ202312S",
        "SKQ2024_12S", "SurfsideBeach", "afsc", "arctic", "azmp", "baystatehatchery",
        "bowdoin_class", "buddinlet", "dmc", "dy169", "dy184", "dy184_discrete", "ecoa",
        "fiddlers", "globalhab", "gom", "gsodock", "harpswell", "hly2401", "jamestown",
        "lombos", "mdibl", "mook", "mvco", "nauset", "newpass", "oceanalliance",
        "old_fort_pond", "pie", "radbot", "radbot_ios", "radbot_jeffreys_basin",
        "radbot_mvco", "tangosund", "tioga", "vimspier",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            datasets: default_datasets(),
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub settling: SettlingConfig,

    #[serde(default)]
    pub ifcb: IfcbConfig,

    #[serde(default)]
    pub plot: PlotConfig,

    #[serde(default)]
    pub annotations: AnnotationConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_settling_config() {
        let config = SettlingConfig::default();
        assert_eq!(config.tolerance, 1e-9);
        assert_eq!(config.max_iter, 200);
        assert_eq!(config.re_threshold, 0.5);
        assert!(!config.require_convergence);
    }

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.ifcb.flow_divisor, 240.0);
        assert_eq!(config.ifcb.class_suffix, "_class_vNone.csv");
        assert_eq!(config.ifcb.score_threshold, 0.95);
        assert!(config.annotations.datasets.contains(&"mvco".to_string()));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "settling:\n  max_iter: 50\nifcb:\n  target_pattern: Dinophysis\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.settling.max_iter, 50);
        assert_eq!(config.settling.tolerance, 1e-9);
        assert_eq!(config.ifcb.target_pattern, "Dinophysis");
        assert_eq!(config.ifcb.run_time_column, "RunTime");
        assert_eq!(config.plot.width, 1000);
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");

        let mut config = PipelineConfig::default();
        config.settling.require_convergence = true;
        config.annotations.datasets = vec!["mvco".to_string()];
        config.to_yaml(&path).unwrap();

        let loaded = PipelineConfig::from_yaml(&path).unwrap();
        assert!(loaded.settling.require_convergence);
        assert_eq!(loaded.annotations.datasets, vec!["mvco".to_string()]);
    }
}
