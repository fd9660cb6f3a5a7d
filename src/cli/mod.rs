//! Command-line interface for the plankton pipeline.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::processors::annotations::ExportFilters;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "plankton-pipeline")]
#[command(about = "IFCB plankton imaging analysis pipeline", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute terminal settling velocity and a syringe settling profile
    Settle {
        /// Particle diameter in m
        #[arg(short, long)]
        diameter: f64,
        /// Particle density in kg/m^3
        #[arg(short = 'p', long)]
        particle_density: f64,
        /// Fluid density in kg/m^3
        #[arg(long)]
        fluid_density: Option<f64>,
        /// Dynamic viscosity in Pa*s
        #[arg(long)]
        viscosity: Option<f64>,
        /// Starting depth in m
        #[arg(long)]
        start_depth: Option<f64>,
        /// Bottom depth in m
        #[arg(long)]
        bottom_depth: Option<f64>,
        /// Profile length in s
        #[arg(long)]
        duration: Option<f64>,
        /// Profile sampling interval in s
        #[arg(long)]
        step: Option<f64>,
        /// Write the settling profile to this CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Fail if the drag iteration does not converge
        #[arg(long)]
        strict: bool,
    },

    /// Parse an .hdr/.adc pair into a CSV with named columns
    ParseAdc {
        /// Header file (.hdr)
        hdr_file: PathBuf,
        /// Output CSV file
        output: PathBuf,
        /// ADC file (defaults to the .hdr path with .adc extension)
        #[arg(long)]
        adc_file: Option<PathBuf>,
    },

    /// Merge one sample's classifier scores with its ADC timing
    Merge {
        /// Header file (.hdr) of the sample
        hdr_file: PathBuf,
        /// Classifier CSV (defaults to <stem><class_suffix> next to the .hdr)
        #[arg(long)]
        class_file: Option<PathBuf>,
        /// Output CSV (defaults to <stem>_alexandrium.csv next to the .hdr)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also write the count/volume plot
        #[arg(long)]
        plot: bool,
    },

    /// Process every complete sample under a directory
    Batch {
        /// Directory searched recursively for .hdr files
        directory: PathBuf,
        /// Output directory (defaults to the input directory)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Skip the per-sample plots
        #[arg(long)]
        no_sample_plots: bool,
    },

    /// Print the human annotation export query and its parameters
    ExportQuery {
        /// Dataset name(s)
        #[arg(long = "datasets")]
        datasets: Vec<String>,
        /// Text file with dataset names
        #[arg(long)]
        datasets_file: Option<PathBuf>,
        /// Restrict to the bins named in this file (bins or PIDs)
        #[arg(long)]
        bins_file: Option<PathBuf>,
        /// Filter by tag substring
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Filter by classification author username
        #[arg(long = "user")]
        users: Vec<String>,
        /// Lower bound ISO timestamp
        #[arg(long)]
        since: Option<String>,
        /// Upper bound ISO timestamp
        #[arg(long)]
        until: Option<String>,
        /// Row limit
        #[arg(long)]
        limit: Option<usize>,
        /// Write the SQL to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Normalize export query results into the annotation CSV
    NormalizeAnnotations {
        /// Query results saved as CSV
        input: PathBuf,
        /// Output CSV path
        #[arg(long)]
        out: PathBuf,
        /// Also write the PID list alongside the CSV
        #[arg(long)]
        emit_pids: bool,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<60} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 37 {
            let head: String = value.chars().take(34).collect();
            format!("{}...", head)
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<37} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Log the error and exit with status 1.
fn fail(context: &str, e: impl std::fmt::Display) -> ! {
    error!("{}: {:#}", context, e);
    std::process::exit(1);
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    // Load config
    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    // Dispatch to subcommands
    match cli.command {
        Commands::Settle {
            diameter,
            particle_density,
            fluid_density,
            viscosity,
            start_depth,
            bottom_depth,
            duration,
            step,
            output,
            strict,
        } => {
            let mut settling = config.settling.clone();
            settling.fluid_density = fluid_density.unwrap_or(settling.fluid_density);
            settling.viscosity = viscosity.unwrap_or(settling.viscosity);
            settling.start_depth_m = start_depth.unwrap_or(settling.start_depth_m);
            settling.bottom_depth_m = bottom_depth.unwrap_or(settling.bottom_depth_m);
            settling.duration_s = duration.unwrap_or(settling.duration_s);
            settling.time_step_s = step.unwrap_or(settling.time_step_s);
            settling.require_convergence |= strict;
            cmd_settle(diameter, particle_density, output, &settling);
        }
        Commands::ParseAdc { hdr_file, output, adc_file } => {
            cmd_parse_adc(&hdr_file, adc_file, &output);
        }
        Commands::Merge { hdr_file, class_file, output, plot } => {
            cmd_merge(&hdr_file, class_file, output, plot, &config);
        }
        Commands::Batch { directory, output_dir, no_sample_plots } => {
            cmd_batch(&directory, output_dir, no_sample_plots, &config);
        }
        Commands::ExportQuery {
            datasets,
            datasets_file,
            bins_file,
            tags,
            users,
            since,
            until,
            limit,
            output,
        } => {
            let filters = ExportFilters {
                datasets,
                datasets_file,
                bins_file,
                tags,
                users,
                since,
                until,
                limit,
            };
            cmd_export_query(filters, output, &config);
        }
        Commands::NormalizeAnnotations { input, out, emit_pids } => {
            cmd_normalize_annotations(&input, &out, emit_pids);
        }
    }
}

fn cmd_settle(
    diameter: f64,
    particle_density: f64,
    output: Option<PathBuf>,
    settling: &crate::config::SettlingConfig,
) {
    use crate::core::writers::write_settling_csv;
    use crate::settling::{distance_over_time, elapsed_times, SettlingProblem};

    let start = Instant::now();

    let problem = SettlingProblem::new(
        diameter,
        particle_density,
        settling.fluid_density,
        settling.viscosity,
    );

    let solution = match problem.solve(settling) {
        Ok(s) => s,
        Err(e) => fail("Settling calculation failed", e),
    };

    let times = match elapsed_times(settling.duration_s, settling.time_step_s) {
        Ok(t) => t,
        Err(e) => fail("Invalid settling profile", e),
    };
    let distances = distance_over_time(
        solution.velocity,
        &times,
        settling.start_depth_m,
        settling.bottom_depth_m,
    );

    if let Some(path) = &output {
        if let Err(e) = write_settling_csv(path, &times, &distances) {
            fail("Failed to write settling profile", e);
        }
        info!("Settling profile -> {}", path.display());
    }

    let final_distance = distances.last().copied().unwrap_or(0.0);

    print_summary(
        "Settling Velocity",
        &[
            ("Diameter (m)", format!("{:e}", diameter)),
            ("Particle density", particle_density.to_string()),
            ("Fluid density", settling.fluid_density.to_string()),
            ("Viscosity (Pa*s)", settling.viscosity.to_string()),
            ("Regime", solution.regime.to_string()),
            ("Stokes Re", format!("{:.4e}", solution.stokes_reynolds)),
            ("Iterations", solution.iterations.to_string()),
            ("Converged", solution.converged.to_string()),
            ("Velocity (m/s)", format!("{:.6e}", solution.velocity)),
            ("Distance (m)", format!("{:.6e} after {} s", final_distance, settling.duration_s)),
            (
                "Profile CSV",
                output.map_or_else(|| "-".to_string(), |p| p.display().to_string()),
            ),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
}

fn cmd_parse_adc(hdr_file: &Path, adc_file: Option<PathBuf>, output: &Path) {
    use crate::core::loaders::{load_adc_data, load_hdr};
    use crate::core::writers::write_adc_csv;

    let start = Instant::now();
    let adc_file = adc_file.unwrap_or_else(|| hdr_file.with_extension("adc"));

    let spinner = create_spinner("Parsing ADC file...");

    let hdr = match load_hdr(hdr_file) {
        Ok(h) => h,
        Err(e) => {
            spinner.finish_and_clear();
            fail("Failed to read header file", e);
        }
    };

    let table = match load_adc_data(&adc_file, &hdr.adc_headers) {
        Ok(t) => t,
        Err(e) => {
            spinner.finish_and_clear();
            fail("Failed to load ADC data", e);
        }
    };

    if let Err(e) = write_adc_csv(output, &table) {
        spinner.finish_and_clear();
        fail("Failed to write ADC table", e);
    }

    spinner.finish_and_clear();

    print_summary(
        "ADC Parse Complete",
        &[
            ("Header file", hdr_file.display().to_string()),
            ("ADC file", adc_file.display().to_string()),
            ("Output CSV", output.display().to_string()),
            ("Header fields", hdr.fields.len().to_string()),
            ("Columns", table.headers.len().to_string()),
            ("ROIs", table.len().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
}

fn cmd_merge(
    hdr_file: &Path,
    class_file: Option<PathBuf>,
    output: Option<PathBuf>,
    plot: bool,
    config: &PipelineConfig,
) {
    use crate::core::writers::write_merged_csv;
    use crate::processors::alexandrium::{process_sample, sample_plot_path};
    use crate::processors::discovery::SamplePair;
    use crate::visualization;

    let start = Instant::now();

    let mut pair = SamplePair::for_hdr(hdr_file, &config.ifcb.class_suffix);
    if let Some(class_file) = class_file {
        pair.class = class_file;
    }

    let dir = hdr_file.parent().unwrap_or(Path::new(".")).to_path_buf();
    let output = output.unwrap_or_else(|| dir.join(format!("{}_alexandrium.csv", pair.stem)));

    let spinner = create_spinner("Merging classifier scores with ADC timing...");

    let sample = match process_sample(&pair, &config.ifcb) {
        Ok(s) => s,
        Err(e) => {
            spinner.finish_and_clear();
            fail("Merge failed", e);
        }
    };

    if let Err(e) = write_merged_csv(&output, &sample.rows, false) {
        spinner.finish_and_clear();
        fail("Failed to write merged CSV", e);
    }

    let plot_path = sample_plot_path(&dir, &pair.stem);
    if plot {
        spinner.set_message("Generating plot...");
        if let Err(e) = visualization::plot_sample(&plot_path, &sample.rows, &config.plot) {
            spinner.finish_and_clear();
            fail("Plot failed", e);
        }
    }

    spinner.finish_and_clear();

    print_summary(
        "Merge Complete",
        &[
            ("Sample", pair.stem.clone()),
            ("Class file", pair.class.display().to_string()),
            ("ROIs classified", sample.rows.len().to_string()),
            ("Alexandrium", sample.total_alexandrium().to_string()),
            ("Output CSV", output.display().to_string()),
            (
                "Plot",
                if plot { plot_path.display().to_string() } else { "-".to_string() },
            ),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
}

fn cmd_batch(
    directory: &Path,
    output_dir: Option<PathBuf>,
    no_sample_plots: bool,
    config: &PipelineConfig,
) {
    use crate::core::writers::write_merged_csv;
    use crate::processors::alexandrium::{combine_rows, process_batch, sample_plot_path};
    use crate::processors::discovery::discover_samples;
    use crate::visualization;

    let start = Instant::now();
    let output_dir = output_dir.unwrap_or_else(|| directory.to_path_buf());

    println!("Processing samples under: {}", directory.display());
    println!("Output directory: {}", output_dir.display());

    let spinner = create_spinner("Scanning for sample files...");

    let discovery = match discover_samples(directory, &config.ifcb.class_suffix) {
        Ok(d) => d,
        Err(e) => {
            spinner.finish_and_clear();
            fail("Discovery failed", e);
        }
    };

    for skipped in &discovery.skipped {
        println!("Skipping incomplete set for: {}", skipped.stem);
    }

    if discovery.complete.is_empty() {
        spinner.finish_and_clear();
        println!("No valid data files found.");
        return;
    }

    spinner.set_message(format!("Processing {} samples...", discovery.complete.len()));
    let batch = process_batch(&discovery.complete, &config.ifcb);

    if config.plot.per_sample && !no_sample_plots {
        spinner.set_message("Generating sample plots...");
        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            spinner.finish_and_clear();
            fail("Cannot create output directory", e);
        }
        for sample in &batch.samples {
            let path = sample_plot_path(&output_dir, &sample.pair.stem);
            if let Err(e) = visualization::plot_sample(&path, &sample.rows, &config.plot) {
                warn!("{}: plot failed: {}", sample.pair.stem, e);
            }
        }
    }

    let combined_csv = output_dir.join("combined_alexandrium.csv");
    let combined_png = output_dir.join("combined_alexandrium_plot.png");

    if !batch.samples.is_empty() {
        spinner.set_message("Writing combined output...");
        let rows = combine_rows(&batch.samples);
        if let Err(e) = write_merged_csv(&combined_csv, &rows, true) {
            spinner.finish_and_clear();
            fail("Failed to write combined CSV", e);
        }
        if let Err(e) = visualization::plot_combined(&combined_png, &batch.samples, &config.plot) {
            warn!("Combined plot failed: {}", e);
        }
    }

    spinner.finish_and_clear();

    for (path, reason) in &batch.failures {
        println!("Failed: {} ({})", path.display(), reason);
    }

    let total_alexandrium: u64 = batch.samples.iter().map(|s| s.total_alexandrium()).sum();

    print_summary(
        "Batch Complete",
        &[
            ("Directory", directory.display().to_string()),
            ("Samples processed", batch.samples.len().to_string()),
            ("Samples failed", batch.failures.len().to_string()),
            ("Samples skipped", discovery.skipped.len().to_string()),
            ("Alexandrium total", total_alexandrium.to_string()),
            ("Combined CSV", combined_csv.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
}

fn cmd_export_query(filters: ExportFilters, output: Option<PathBuf>, config: &PipelineConfig) {
    let query = match filters.resolve(&config.annotations.datasets) {
        Ok(q) => q,
        Err(e) => fail("Cannot build export query", e),
    };

    let sql = query.build_sql();
    match &output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &sql) {
                fail("Failed to write SQL", e);
            }
            info!("Query -> {}", path.display());
        }
        None => println!("{}", sql),
    }

    // Parameters go to stderr so stdout stays valid SQL
    for (name, value) in query.params() {
        eprintln!("-- :{} = {}", name, value);
    }
}

fn cmd_normalize_annotations(input: &Path, out: &Path, emit_pids: bool) {
    use crate::core::writers::{write_annotations_csv, write_pid_list};
    use crate::processors::annotations::{load_raw_annotations, normalize, pid_list_path};

    let start = Instant::now();

    let raw = match load_raw_annotations(input) {
        Ok(r) => r,
        Err(e) => fail("Failed to read query results", e),
    };

    let rows: Vec<_> = raw.iter().map(normalize).collect();

    if let Err(e) = write_annotations_csv(out, &rows) {
        fail("Failed to write annotation export", e);
    }
    println!("OK: wrote {} rows -> {}", rows.len(), out.display());

    let mut pid_file = "-".to_string();
    if emit_pids && !rows.is_empty() {
        let path = pid_list_path(out);
        let pids: Vec<&str> = rows.iter().map(|r| r.pid.as_str()).collect();
        if let Err(e) = write_pid_list(&path, &pids) {
            fail("Failed to write PID list", e);
        }
        println!("OK: wrote PID list -> {}", path.display());
        pid_file = path.display().to_string();
    }

    let tagged = rows.iter().filter(|r| !r.raw_tag.is_empty()).count();

    print_summary(
        "Annotation Export Complete",
        &[
            ("Input", input.display().to_string()),
            ("Rows", rows.len().to_string()),
            ("Tagged rows", tagged.to_string()),
            ("Output CSV", out.display().to_string()),
            ("PID list", pid_file),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
}
