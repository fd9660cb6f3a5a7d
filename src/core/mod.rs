//! Core data types and I/O operations.

pub mod loaders;
pub mod pid;
pub mod writers;

pub use loaders::{AdcTable, ClassTable, HdrFile, LoaderError};
pub use writers::{
    write_adc_csv, write_annotations_csv, write_merged_csv, write_pid_list, write_settling_csv,
    WriteError,
};
