//! Error taxonomy for the diagrammatic amplitude solver.

use thiserror::Error;

/// Catch-all error for this crate.
///
/// Fatal variants propagate all the way to the top-level driver and abort the run with a
/// single-line diagnostic. `DiisSingular` is deliberately absent here: a singular Pulay matrix is
/// recovered locally by disabling DIIS for the rest of the sector, it never becomes a `Result::Err`.
#[derive(Debug, Error)]
pub enum Error {
    /// An option or model tag is unknown or two options are mutually incompatible.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A diagram or integral required by a kernel or catalogue routine does not exist.
    #[error("diagram not found: {0}")]
    NotFound(String),
    /// `reorder`/`mult`/`add` were given incompatible ranks or a permutation that wasn't a
    /// permutation of `1..=rank`.
    #[error("shape mismatch in {op}: {detail}")]
    ShapeMismatch {
        /// Name of the kernel call where the mismatch was detected.
        op: &'static str,
        /// Human-readable detail (operand shapes, diagram names).
        detail: String,
    },
    /// `mult` was asked to contract lines whose class letters cannot pair (e.g. hole with particle).
    #[error("incompatible classes in mult({a}, {b}): {detail}")]
    IncompatibleClasses {
        /// First operand name.
        a: String,
        /// Second operand name.
        b: String,
        /// Human-readable detail.
        detail: String,
    },
    /// `mult` was asked to contract more lines than an operand has.
    #[error("rank underflow: tried to contract {k} lines of a rank-{rank} diagram")]
    RankUnderflow {
        /// Number of lines requested for contraction.
        k: usize,
        /// Rank of the operand.
        rank: usize,
    },
    /// Reading or writing a diagram's backing file failed.
    #[error("storage error for {path}: {source}")]
    Storage {
        /// Path of the file that could not be read or written.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A (de)serialization error while reading or writing a diagram file.
    #[error("(de)serialization error for {path}: {source}")]
    Codec {
        /// Path of the file being encoded or decoded.
        path: String,
        /// Underlying codec error.
        #[source]
        source: bincode::Error,
    },
    /// An amplitude element exceeded the divergence threshold (`|t| > 1`) during an iteration.
    #[error("sector {sector} diverged at iteration {iteration}: max amplitude {max_amplitude}")]
    NumericalDivergence {
        /// Sector in which the divergence was observed.
        sector: String,
        /// Iteration at which it was observed.
        iteration: usize,
        /// The offending amplitude magnitude.
        max_amplitude: f64,
    },
    /// `maxiter` was exhausted without the residual falling below tolerance.
    #[error("sector {sector} did not converge within {maxiter} iterations (residual {residual:e})")]
    NotConverged {
        /// Sector that failed to converge.
        sector: String,
        /// Iteration budget that was exhausted.
        maxiter: usize,
        /// The residual `diffmax` at the last iteration.
        residual: f64,
    },
    /// A diagram with this name already exists in the registry.
    #[error("diagram '{0}' already exists")]
    AlreadyExists(String),
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
