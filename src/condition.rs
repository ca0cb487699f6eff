//! Condition number estimation for the preconditioner matrices.
//!
//! The 1-norm of the sparse Schur complement is exact (maximum column
//! sum); the 1-norm of its inverse is estimated with the classic
//! Hager power iteration driven by the LU solves of the matrix and
//! of its adjoint. A quasi-singular matrix is reported through a
//! non-fatal status flag; the solve may still be attempted.

use faer::sparse::Triplet;
use faer::{Col, ColRef};

use crate::options::{ConditionOptions, FactorizationOptions, NormOptions};
use crate::system::{factorize, SchurMatrix, SolveFn};
use crate::C64;

/// Outcome of the condition check.
#[derive(Debug, Clone)]
pub struct ConditionStatus {
    pub check: bool,
    pub cond_electric: f64,
    pub cond_magnetic: f64,
    pub status: bool,
}

/// Exact 1-norm of the sparse matrix (maximum column sum).
fn norm_one(mat: &SchurMatrix) -> f64 {
    let mut col_sum = vec![0.; mat.n];
    for t in &mat.triplets {
        col_sum[t.col] += t.val.norm();
    }
    col_sum.into_iter().fold(0., f64::max)
}

/// Adjoint of the sparse matrix as triplets.
fn adjoint(mat: &SchurMatrix) -> SchurMatrix {
    SchurMatrix {
        n: mat.n,
        triplets: mat
            .triplets
            .iter()
            .map(|t| Triplet {
                row: t.col,
                col: t.row,
                val: t.val.conj(),
            })
            .collect(),
    }
}

fn norm_l1(x: ColRef<C64>) -> f64 {
    (0..x.nrows()).map(|i| x[i].norm()).sum()
}

/// Hager estimate of `norm1(inv(A))` from one start vector.
fn norm_inv_estimate(
    n: usize,
    solve: &SolveFn,
    solve_adj: &SolveFn,
    start: Col<C64>,
    n_iter_max: usize,
) -> f64 {
    let mut x = start;
    let mut est = 0.;

    for iter in 0..n_iter_max {
        let y = solve(x.as_ref());
        let est_new = norm_l1(y.as_ref());
        if iter > 0 && est_new <= est {
            break;
        }
        est = est_new;

        // subgradient direction: the complex sign of y
        let xi = Col::<C64>::from_fn(n, |i| {
            let v = y[i];
            if v.norm() == 0. {
                C64::new(1., 0.)
            } else {
                v / v.norm()
            }
        });
        let z = solve_adj(xi.as_ref());

        // move to the coordinate direction of the largest component
        let (mut j, mut z_max) = (0, 0.);
        for i in 0..n {
            if z[i].norm() > z_max {
                z_max = z[i].norm();
                j = i;
            }
        }
        let overlap = (0..n).map(|i| (z[i].conj() * x[i]).re).sum::<f64>();
        if z_max <= overlap {
            break;
        }
        x = Col::<C64>::zeros(n);
        x[j] = C64::new(1., 0.);
    }
    est
}

/// Estimate the condition number (1-norm) of a sparse matrix.
fn condition_estimate(
    mat: &SchurMatrix,
    norm_options: &NormOptions,
    factorization_options: &FactorizationOptions,
) -> f64 {
    let n = mat.n;
    if n == 0 {
        return 0.;
    }

    let solve = factorize("condition", mat, factorization_options);
    let solve_adj = factorize("condition adjoint", &adjoint(mat), factorization_options);
    let (solve, solve_adj) = match (solve, solve_adj) {
        (Some(a), Some(b)) => (a, b),
        _ => return f64::INFINITY,
    };

    // several deterministic start vectors bound the underestimate
    let n_start = norm_options.t_accuracy.max(1);
    let mut nrm_inv: f64 = 0.;
    for k in 0..n_start {
        let start = if k == 0 {
            Col::<C64>::from_fn(n, |_| C64::new(1. / n as f64, 0.))
        } else {
            let mut e = Col::<C64>::zeros(n);
            e[(k * n) / n_start] = C64::new(1., 0.);
            e
        };
        let est = norm_inv_estimate(n, &solve, &solve_adj, start, norm_options.n_iter_max);
        nrm_inv = nrm_inv.max(est);
    }

    norm_one(mat) * nrm_inv
}

/// Check the condition numbers of the electric and magnetic
/// preconditioner matrices against the tolerances.
pub fn check_condition(
    mat_c: &SchurMatrix,
    mat_m: &SchurMatrix,
    options: &ConditionOptions,
    factorization_options: &FactorizationOptions,
) -> ConditionStatus {
    if !options.check {
        log::debug!("matrix condition check is disabled");
        return ConditionStatus {
            check: false,
            cond_electric: f64::NAN,
            cond_magnetic: f64::NAN,
            status: true,
        };
    }

    let cond_electric =
        condition_estimate(mat_c, &options.norm_options, factorization_options);
    let cond_magnetic =
        condition_estimate(mat_m, &options.norm_options, factorization_options);

    let status = (cond_electric < options.tolerance_electric)
        && (cond_magnetic < options.tolerance_magnetic);

    log::debug!("cond_electric = {cond_electric:.2e}");
    log::debug!("cond_magnetic = {cond_magnetic:.2e}");
    if status {
        log::debug!("matrix condition is good");
    } else {
        log::warn!("matrix condition is problematic");
    }

    ConditionStatus {
        check: true,
        cond_electric,
        cond_magnetic,
        status,
    }
}
