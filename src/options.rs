//! Numerical options controlling the solver.
//!
//! The defaults are chosen for well-conditioned conductor problems;
//! strongly coupled magnetic problems typically need the segregated
//! coupling and/or looser relaxation factors.

/// Top-level numerical options.
#[derive(Debug, Clone)]
pub struct Tolerance {
    /// Normalized center distance above which the analytical integrals
    /// are replaced by their monopole approximation.
    pub integral_simplify: f64,
    pub factorization_options: FactorizationOptions,
    pub condition_options: ConditionOptions,
    pub solver_options: SolverOptions,
    pub parallel_sweep: ParallelSweep,
    /// Compute the magnetic field at the cloud points.
    pub biot_savart: bool,
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance {
            integral_simplify: 20.,
            factorization_options: FactorizationOptions::default(),
            condition_options: ConditionOptions::default(),
            solver_options: SolverOptions::default(),
            parallel_sweep: ParallelSweep::default(),
            biot_savart: true,
        }
    }
}

/// Backend used to factorize the sparse preconditioner matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorizationLibrary {
    SparseLu,
}

#[derive(Debug, Clone)]
pub struct FactorizationOptions {
    pub library: FactorizationLibrary,
}

impl Default for FactorizationOptions {
    fn default() -> Self {
        FactorizationOptions {
            library: FactorizationLibrary::SparseLu,
        }
    }
}

/// Options for the condition number check of the preconditioner.
#[derive(Debug, Clone)]
pub struct ConditionOptions {
    pub check: bool,
    pub tolerance_electric: f64,
    pub tolerance_magnetic: f64,
    pub norm_options: NormOptions,
}

impl Default for ConditionOptions {
    fn default() -> Self {
        ConditionOptions {
            check: true,
            tolerance_electric: 1e15,
            tolerance_magnetic: 1e15,
            norm_options: NormOptions::default(),
        }
    }
}

/// Options for the 1-norm estimate of the inverse matrices.
#[derive(Debug, Clone)]
pub struct NormOptions {
    /// Number of start vectors for the norm estimator.
    pub t_accuracy: usize,
    /// Iteration cap for the norm estimator.
    pub n_iter_max: usize,
}

impl Default for NormOptions {
    fn default() -> Self {
        NormOptions {
            t_accuracy: 2,
            n_iter_max: 10,
        }
    }
}

/// Coupling scheme between the electric and magnetic equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    /// Monolithic solve of the coupled system.
    Direct,
    /// Fixed-point iteration over relaxed per-domain solves.
    Segregated,
}

/// Options for the equation system solver.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub coupling: Coupling,
    pub status_options: StatusOptions,
    pub power_options: PowerOptions,
    pub direct_options: IterOptions,
    pub segregated_options: SegregatedOptions,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            coupling: Coupling::Direct,
            status_options: StatusOptions::default(),
            power_options: PowerOptions::default(),
            direct_options: IterOptions::default(),
            segregated_options: SegregatedOptions::default(),
        }
    }
}

/// Options for the final residuum check and status handling.
#[derive(Debug, Clone)]
pub struct StatusOptions {
    /// Ignore the convergence status reported by the Krylov solver.
    pub ignore_status: bool,
    /// Ignore the final residuum check.
    pub ignore_res: bool,
    pub rel_tol: f64,
    pub abs_tol: f64,
}

impl Default for StatusOptions {
    fn default() -> Self {
        StatusOptions {
            ignore_status: false,
            ignore_res: false,
            rel_tol: 1e-6,
            abs_tol: 1e-12,
        }
    }
}

/// Options for the early stop on the terminal complex power.
#[derive(Debug, Clone)]
pub struct PowerOptions {
    /// Abort the iteration once the power is stable.
    pub stop: bool,
    /// Minimum number of iterations before a power stop.
    pub n_min: usize,
    /// Number of previous iterations the power is compared against.
    pub n_cmp: usize,
    pub rel_tol: f64,
    pub abs_tol: f64,
}

impl Default for PowerOptions {
    fn default() -> Self {
        PowerOptions {
            stop: false,
            n_min: 4,
            n_cmp: 3,
            rel_tol: 1e-8,
            abs_tol: 1e-12,
        }
    }
}

/// Krylov method used for a single equation system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KrylovSolver {
    Gmres,
    Gcrot,
}

/// Options for a single Krylov solve.
#[derive(Debug, Clone)]
pub struct IterOptions {
    pub solver: KrylovSolver,
    pub rel_tol: f64,
    pub abs_tol: f64,
    /// Size of a restart cycle (GMRES) or of the inner space (GCROT).
    pub n_inner: usize,
    /// Number of restart cycles (GMRES) or outer iterations (GCROT).
    pub n_outer: usize,
}

impl Default for IterOptions {
    fn default() -> Self {
        IterOptions {
            solver: KrylovSolver::Gmres,
            rel_tol: 1e-6,
            abs_tol: 1e-12,
            n_inner: 40,
            n_outer: 100,
        }
    }
}

/// Options for the segregated electric/magnetic fixed-point loop.
#[derive(Debug, Clone)]
pub struct SegregatedOptions {
    pub rel_tol: f64,
    pub abs_tol: f64,
    pub n_min: usize,
    pub n_max: usize,
    pub relax_electric: f64,
    pub relax_magnetic: f64,
    pub iter_electric_options: IterOptions,
    pub iter_magnetic_options: IterOptions,
}

impl Default for SegregatedOptions {
    fn default() -> Self {
        SegregatedOptions {
            rel_tol: 1e-6,
            abs_tol: 1e-12,
            n_min: 2,
            n_max: 25,
            relax_electric: 1.0,
            relax_magnetic: 1.0,
            iter_electric_options: IterOptions::default(),
            iter_magnetic_options: IterOptions::default(),
        }
    }
}

/// Process-level parallelism across independent sweeps.
#[derive(Debug, Clone)]
pub struct ParallelSweep {
    /// Number of parallel workers (0 disables parallelism).
    pub n_jobs: usize,
    /// Inner thread count hint for the numerical libraries.
    pub n_threads: usize,
}

impl Default for ParallelSweep {
    fn default() -> Self {
        ParallelSweep {
            n_jobs: 0,
            n_threads: 1,
        }
    }
}
