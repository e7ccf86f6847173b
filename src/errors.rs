//! Crate-wide error taxonomy.
//!
//! Partitions the failure modes named by the design's error-handling model
//! into typed categories instead of a single catch-all:
//!
//! - [`ConfigError`]: malformed/missing configuration. Unrecoverable.
//! - [`SearchError`]: a single saddle-point attempt failed. Recoverable by
//!   the calling [`crate::mechanism::find_mechanisms`] loop (bump the
//!   failure streak, try again).
//! - [`KmcError`]: the kinetic engine hit a state it cannot recover from
//!   internally (an empty basin, a corrupted superbasin). Unrecoverable.
//! - [`DriverError`]: aggregates the above at the top-level loop, plus
//!   catalogue persistence and reconstruction failures.

/// Errors produced while loading or validating a TOML configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required field [{section}].{field}")]
    MissingField { section: &'static str, field: &'static str },
    #[error("invalid value for [{section}].{field}: {reason}")]
    InvalidValue {
        section: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// A single saddle-point search attempt failed in a recoverable way.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("saddle search did not converge")]
    NotConverged,
    #[error("dimer nudge landed back in the initial basin (distance {0:.3e} < basin_tol)")]
    DegenerateMinimum(f64),
    #[error("minimiser failed to converge: {0}")]
    MinimiseFailed(String),
    #[error("bounded runtime error from potential evaluator: {0}")]
    PotentialFault(String),
    #[error("vineyard Hessian at the saddle had {0} eigenvalues below -zero_tol (need exactly 1)")]
    BadSaddleOrder(usize),
}

/// An unrecoverable failure inside the kinetic engine.
#[derive(Debug, thiserror::Error)]
pub enum KmcError {
    #[error("basin has zero-sum or empty exit-mechanism rates (rate_sum = {0})")]
    EmptyBasin(f64),
    #[error("n-fold-way cumulative sum never crossed the random draw (scanned {0} mechanisms)")]
    ChoiceOverrun(usize),
    #[error("superbasin residence-time solve failed: {0}")]
    TauSolveFailed(String),
}

/// Top-level driver failure: aggregates lower layers and adds driver-specific cases.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Kmc(#[from] KmcError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("catalogue persistence failed: {0}")]
    Persist(String),
    #[error(
        "reconstruction inconsistency: re-classification after apply+minimise disagreed with \
         the expected environment, even after a retry with jitter"
    )]
    ReconstructionInconsistent,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
