use thiserror::Error;

/// Failure classes surfaced by the pipeline, one variant per cause so
/// callers can report which threshold or option was responsible.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid table at line {line}: {reason}")]
    InvalidTable { line: usize, reason: String },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unknown similarity metric: {0} (supported: binomial)")]
    UnknownMetric(String),
    #[error("Unknown clustering method: {0} (supported: matlab, hierarchy)")]
    UnknownMethod(String),
    #[error("Unknown linkage: {0} (supported: average, complete)")]
    UnknownLinkage(String),
    #[error("No genotype qualifies as a background at any frequency breakpoint {breakpoints:?}")]
    NoBackground { breakpoints: Vec<f64> },
    #[error("{stage} did not stabilize within {limit} iterations")]
    NoConvergence { stage: &'static str, limit: usize },
}
