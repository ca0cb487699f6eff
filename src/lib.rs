//! A Rust implementation of a quasi-magnetostatic PEEC field solver.
//!
//! The solver works on a rectilinear voxel grid with piecewise
//! homogeneous electric conductors and linear magnetic materials,
//! excited by lumped current/voltage sources at a single frequency
//! (or DC). The coupled electric-magnetic equation system is solved
//! matrix-free: the dense inductance/potential/coupling operators are
//! applied through FFT-accelerated circulant tensors while a sparse
//! Schur-complement factorization acts as the preconditioner for the
//! Krylov iterations.
//!
//! The entry point is [`sweep::run_sweeps`], which takes the voxel
//! geometry, the problem definition (materials, sources, sweeps), and
//! the numerical options, and returns one solution record per sweep.

use num_complex::Complex;

pub mod condition;
pub mod constants;
pub mod domain;
pub mod driver;
pub mod error;
pub mod extract;
pub mod fft;
pub mod green;
pub mod krylov;
pub mod operators;
pub mod options;
pub mod solve;
pub mod sweep;
pub mod system;
pub mod voxel;

// convenience type for complex arithmetic
pub type C64 = Complex<f64>;

pub use driver::{SolverContext, SweepResult};
pub use error::{Error, Result};
pub use options::Tolerance;
pub use sweep::{run_sweeps, SweepDef, SweepParam};
pub use voxel::{Geometry, VoxelGrid};
