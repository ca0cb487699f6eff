//! Error taxonomy of the solver.
//!
//! Only input validation failures are reported as errors: they abort
//! before any computation. Numerical warnings (ill-conditioning) and
//! convergence failures are status data carried in the per-sweep
//! records, not errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid domain: name not found: {0}")]
    UnknownDomain(String),

    #[error("invalid domain: duplicate voxel indices: {0}")]
    DuplicateIndices(String),

    #[error("invalid domain: voxel index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("electric and magnetic domains can only overlap for electromagnetic materials")]
    MaterialOverlap,

    #[error("the geometry does not include any electric voxel")]
    NoElectricVoxel,

    #[error("the geometry does not include any source voxel")]
    NoSource,

    #[error("source voxels should overlap with electric voxels")]
    SourceOutsideElectric,

    #[error("electric components should include at least one source")]
    ComponentWithoutSource,

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("vector length does not match the number of voxels: {0}")]
    LengthMismatch(String),

    #[error("missing values for the material domain: {0}")]
    MissingMaterial(String),

    #[error("missing values for the source domain: {0}")]
    MissingSource(String),

    #[error("cannot solve the sweep dependencies: {0}")]
    InvalidSweep(String),
}

pub type Result<T> = std::result::Result<T, Error>;
