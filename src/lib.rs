//! Analysis pipeline for IFCB plankton imaging data.
//!
//! This crate provides tools for:
//! - Parsing instrument `.hdr`/`.adc` file pairs into tables
//! - Merging classifier scores with run-time metadata to track Alexandrium
//!   counts against analyzed volume (parallelized across samples)
//! - Composing and normalizing human annotation exports
//! - Estimating particle settling velocity (Stokes / Schiller-Naumann)
//!
//! # Example
//!
//! ```no_run
//! use plankton_pipeline::core::loaders::{extract_adc_headers, load_adc_data};
//!
//! let headers = extract_adc_headers("D20240418T084427_IFCB124.hdr").unwrap();
//! let adc = load_adc_data("D20240418T084427_IFCB124.adc", &headers).unwrap();
//! println!("{} ROIs", adc.len());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;
pub mod settling;
pub mod visualization;

pub use config::{AnnotationConfig, IfcbConfig, PipelineConfig, PlotConfig, SettlingConfig};
pub use core::loaders::{AdcTable, ClassTable};
pub use settling::{terminal_velocity, SettlingProblem, SettlingSolution};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
