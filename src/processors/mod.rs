//! Data processing modules.

pub mod alexandrium;
pub mod annotations;
pub mod discovery;

// Re-export key types for convenience
pub use alexandrium::{
    combine_rows, process_batch, process_pair, process_sample, with_concentration, BatchResult,
    MergeError, MergedRow, SampleResult,
};
pub use annotations::{
    load_bins_from_file, load_list_file, normalize, resolve_datasets, AnnotationError, Annotation,
    ExportFilters, ExportQuery, RawAnnotation,
};
pub use discovery::{discover_samples, Discovery, DiscoveryError, SamplePair};
