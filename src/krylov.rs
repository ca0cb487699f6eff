//! Iterative Krylov kernels: restarted GMRES and GCROT(m,k).
//!
//! Both methods are matrix-free and left-preconditioned: they iterate
//! on `M*A*x = M*b` where `M` is the (approximate inverse)
//! preconditioner operator. Convergence is tested on the
//! preconditioned residual against `max(rel_tol*|M*b|, abs_tol)`.
//!
//! An observer receives every iterate; it can abort the iteration
//! early (used for the complex-power stability stop).

use faer::{Col, ColRef};

use crate::options::{IterOptions, KrylovSolver};
use crate::C64;

/// Reason for an observer-driven early stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    PowerStable,
}

/// Decision returned by the iteration observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterControl {
    Continue,
    Stop(StopReason),
}

/// Observer of the Krylov iterates.
pub trait IterObserver {
    fn on_iterate(&mut self, sol: ColRef<C64>) -> IterControl;
}

/// Observer that never stops the iteration.
pub struct NullObserver;

impl IterObserver for NullObserver {
    fn on_iterate(&mut self, _sol: ColRef<C64>) -> IterControl {
        IterControl::Continue
    }
}

/// Outcome of a Krylov solve.
pub struct KrylovResult {
    pub sol: Col<C64>,
    /// Residual tolerance reached.
    pub converged: bool,
    /// Aborted by the observer.
    pub stopped: bool,
    /// Total number of inner iterations.
    pub n_iter: usize,
}

fn dot(a: ColRef<C64>, b: ColRef<C64>) -> C64 {
    (0..a.nrows()).map(|i| a[i].conj() * b[i]).sum()
}

fn axpy(y: &mut Col<C64>, alpha: C64, x: ColRef<C64>) {
    for i in 0..y.nrows() {
        y[i] += alpha * x[i];
    }
}

fn scaled(x: ColRef<C64>, factor: f64) -> Col<C64> {
    Col::<C64>::from_fn(x.nrows(), |i| factor * x[i])
}

/// Complex Givens rotation zeroing `b` against `a`:
/// `[c, s; -conj(s), c] * [a; b] = [r; 0]` with real `c`.
fn givens(a: C64, b: C64) -> (f64, C64, C64) {
    if a.norm() == 0. {
        (0., C64::new(1., 0.), b)
    } else {
        let t = (a.norm() * a.norm() + b.norm() * b.norm()).sqrt();
        let phase = a / a.norm();
        let c = a.norm() / t;
        let s = phase * b.conj() / t;
        (c, s, phase * t)
    }
}

/// Solve one equation system with the selected Krylov method.
pub fn solve_krylov<S, P>(
    sys: &S,
    pcd: &P,
    rhs: ColRef<C64>,
    x0: Option<ColRef<C64>>,
    options: &IterOptions,
    observer: &mut dyn IterObserver,
) -> KrylovResult
where
    S: Fn(ColRef<C64>) -> Col<C64>,
    P: Fn(ColRef<C64>) -> Col<C64>,
{
    match options.solver {
        KrylovSolver::Gmres => gmres(sys, pcd, rhs, x0, options, observer),
        KrylovSolver::Gcrot => gcrot(sys, pcd, rhs, x0, options, observer),
    }
}

/// Preconditioned residual `M*(b - A*x)`.
fn residual<S, P>(sys: &S, pcd: &P, rhs: ColRef<C64>, x: ColRef<C64>) -> Col<C64>
where
    S: Fn(ColRef<C64>) -> Col<C64>,
    P: Fn(ColRef<C64>) -> Col<C64>,
{
    let ax = sys(x);
    let mut r = Col::<C64>::from_fn(rhs.nrows(), |i| rhs[i] - ax[i]);
    r = pcd(r.as_ref());
    r
}

/// Restarted GMRES with the modified Gram-Schmidt Arnoldi process
/// and a Givens-rotation least-squares update.
fn gmres<S, P>(
    sys: &S,
    pcd: &P,
    rhs: ColRef<C64>,
    x0: Option<ColRef<C64>>,
    options: &IterOptions,
    observer: &mut dyn IterObserver,
) -> KrylovResult
where
    S: Fn(ColRef<C64>) -> Col<C64>,
    P: Fn(ColRef<C64>) -> Col<C64>,
{
    let n = rhs.nrows();
    let m = options.n_inner.max(1);

    let mut x = match x0 {
        Some(x0) => x0.to_owned(),
        None => Col::<C64>::zeros(n),
    };

    let b_pcd = pcd(rhs);
    let tol = f64::max(options.rel_tol * b_pcd.norm_l2(), options.abs_tol);

    let mut n_iter = 0;
    let mut converged = false;
    let mut stopped = false;

    'outer: for _ in 0..options.n_outer.max(1) {
        let r = residual(sys, pcd, rhs, x.as_ref());
        let beta = r.norm_l2();
        if beta <= tol {
            converged = true;
            break;
        }

        // Arnoldi basis and Hessenberg factors
        let mut basis: Vec<Col<C64>> = vec![scaled(r.as_ref(), 1. / beta)];
        let mut h = vec![Vec::<C64>::new(); m];
        let mut cs = Vec::<f64>::new();
        let mut sn = Vec::<C64>::new();
        let mut g = vec![C64::new(0., 0.); m + 1];
        g[0] = C64::new(beta, 0.);

        for j in 0..m {
            // expand the basis (modified Gram-Schmidt)
            let mut w = pcd(sys(basis[j].as_ref()).as_ref());
            let mut col = Vec::with_capacity(j + 2);
            for v in basis.iter().take(j + 1) {
                let hij = dot(v.as_ref(), w.as_ref());
                axpy(&mut w, -hij, v.as_ref());
                col.push(hij);
            }
            let h_next = w.norm_l2();
            col.push(C64::new(h_next, 0.));

            // apply the previous rotations to the new column
            for (i, (&c, s)) in cs.iter().zip(sn.iter()).enumerate() {
                let tmp = c * col[i] + *s * col[i + 1];
                col[i + 1] = -s.conj() * col[i] + c * col[i + 1];
                col[i] = tmp;
            }

            // new rotation zeroing the subdiagonal entry
            let (c, s, r_entry) = givens(col[j], col[j + 1]);
            col[j] = r_entry;
            col[j + 1] = C64::new(0., 0.);
            g[j + 1] = -s.conj() * g[j];
            g[j] = c * g[j];
            cs.push(c);
            sn.push(s);
            h[j] = col;

            let res = g[j + 1].norm();
            n_iter += 1;

            // current iterate (needed for the observer each step)
            let y = solve_upper(&h, &g, j + 1);
            let mut x_cur = x.clone();
            for (i, &yi) in y.iter().enumerate() {
                axpy(&mut x_cur, yi, basis[i].as_ref());
            }

            if let IterControl::Stop(_) = observer.on_iterate(x_cur.as_ref()) {
                x = x_cur;
                stopped = true;
                break 'outer;
            }

            if res <= tol {
                x = x_cur;
                converged = true;
                break 'outer;
            }

            if h_next <= f64::EPSILON * beta {
                // lucky breakdown: the Krylov space is exhausted
                x = x_cur;
                break;
            }
            basis.push(scaled(w.as_ref(), 1. / h_next));

            if j == m - 1 {
                x = x_cur;
            }
        }
    }

    KrylovResult {
        sol: x,
        converged,
        stopped,
        n_iter,
    }
}

/// Back-substitution of the rotated Hessenberg least-squares system.
fn solve_upper(h: &[Vec<C64>], g: &[C64], size: usize) -> Vec<C64> {
    let mut y = vec![C64::new(0., 0.); size];
    for i in (0..size).rev() {
        let mut acc = g[i];
        for k in i + 1..size {
            acc -= h[k][i] * y[k];
        }
        y[i] = acc / h[i][i];
    }
    y
}

/// GCROT(m,k): a restarted inner process deflated against a recycled
/// outer subspace. The outer pairs `(c, u)` satisfy `M*A*u = c` with
/// orthonormal `c`; they are carried across restarts, which typically
/// beats plain restarted GMRES on stagnating problems.
fn gcrot<S, P>(
    sys: &S,
    pcd: &P,
    rhs: ColRef<C64>,
    x0: Option<ColRef<C64>>,
    options: &IterOptions,
    observer: &mut dyn IterObserver,
) -> KrylovResult
where
    S: Fn(ColRef<C64>) -> Col<C64>,
    P: Fn(ColRef<C64>) -> Col<C64>,
{
    let n = rhs.nrows();
    let m = options.n_inner.max(1);
    let k_max = options.n_inner.max(1);

    let mut x = match x0 {
        Some(x0) => x0.to_owned(),
        None => Col::<C64>::zeros(n),
    };

    let b_pcd = pcd(rhs);
    let tol = f64::max(options.rel_tol * b_pcd.norm_l2(), options.abs_tol);

    let mut outer_c: Vec<Col<C64>> = Vec::new();
    let mut outer_u: Vec<Col<C64>> = Vec::new();

    let mut n_iter = 0;
    let mut converged = false;
    let mut stopped = false;

    'outer: for _ in 0..options.n_outer.max(1) {
        let r = residual(sys, pcd, rhs, x.as_ref());
        let beta = r.norm_l2();
        if beta <= tol {
            converged = true;
            break;
        }

        let mut basis: Vec<Col<C64>> = vec![scaled(r.as_ref(), 1. / beta)];
        let mut h = vec![Vec::<C64>::new(); m];
        // coefficients of the outer-space deflation per inner column
        let mut b_coef = vec![Vec::<C64>::new(); m];
        let mut cs = Vec::<f64>::new();
        let mut sn = Vec::<C64>::new();
        let mut g = vec![C64::new(0., 0.); m + 1];
        g[0] = C64::new(beta, 0.);

        // raw Hessenberg columns for the recycled-vector update
        let mut h_raw = vec![Vec::<C64>::new(); m];

        let mut n_cols = 0;
        let mut y_final = Vec::new();
        for j in 0..m {
            let mut w = pcd(sys(basis[j].as_ref()).as_ref());

            // deflate against the recycled outer space
            let mut bc = Vec::with_capacity(outer_c.len());
            for c in &outer_c {
                let coef = dot(c.as_ref(), w.as_ref());
                axpy(&mut w, -coef, c.as_ref());
                bc.push(coef);
            }
            b_coef[j] = bc;

            // Arnoldi step
            let mut col = Vec::with_capacity(j + 2);
            for v in basis.iter().take(j + 1) {
                let hij = dot(v.as_ref(), w.as_ref());
                axpy(&mut w, -hij, v.as_ref());
                col.push(hij);
            }
            let h_next = w.norm_l2();
            col.push(C64::new(h_next, 0.));
            h_raw[j] = col.clone();

            for (i, (&c, s)) in cs.iter().zip(sn.iter()).enumerate() {
                let tmp = c * col[i] + *s * col[i + 1];
                col[i + 1] = -s.conj() * col[i] + c * col[i + 1];
                col[i] = tmp;
            }
            let (c, s, r_entry) = givens(col[j], col[j + 1]);
            col[j] = r_entry;
            col[j + 1] = C64::new(0., 0.);
            g[j + 1] = -s.conj() * g[j];
            g[j] = c * g[j];
            cs.push(c);
            sn.push(s);
            h[j] = col;

            n_cols = j + 1;
            let res = g[j + 1].norm();
            n_iter += 1;

            let y = solve_upper(&h, &g, n_cols);
            let x_cur = gcrot_combine(&x, &basis, &outer_u, &b_coef, &y);

            if let IterControl::Stop(_) = observer.on_iterate(x_cur.as_ref()) {
                x = x_cur;
                stopped = true;
                break 'outer;
            }
            if res <= tol {
                y_final = y;
                converged = true;
                break;
            }
            if h_next <= f64::EPSILON * beta {
                y_final = y;
                break;
            }
            basis.push(scaled(w.as_ref(), 1. / h_next));
            y_final = y;
        }

        // apply the inner correction
        x = gcrot_combine(&x, &basis, &outer_u, &b_coef, &y_final);

        // recycle the correction direction: c_hat spans the reached
        // residual decrease, u_hat is its pre-image
        let mut c_hat = Col::<C64>::zeros(n);
        for (j, col) in h_raw.iter().take(n_cols).enumerate() {
            for (i, &hij) in col.iter().enumerate() {
                if i < basis.len() {
                    axpy(&mut c_hat, hij * y_final[j], basis[i].as_ref());
                }
            }
        }
        let alpha = c_hat.norm_l2();
        if alpha > 0. {
            let c_new = scaled(c_hat.as_ref(), 1. / alpha);
            let delta = gcrot_delta(&basis, &outer_u, &b_coef, &y_final);
            let u_new = scaled(delta.as_ref(), 1. / alpha);
            outer_c.push(c_new);
            outer_u.push(u_new);
            if outer_c.len() > k_max {
                outer_c.remove(0);
                outer_u.remove(0);
            }
        }

        if converged {
            break;
        }
    }

    KrylovResult {
        sol: x,
        converged,
        stopped,
        n_iter,
    }
}

/// Inner correction `V*y - U*(B*y)` of the deflated process.
fn gcrot_delta(
    basis: &[Col<C64>],
    outer_u: &[Col<C64>],
    b_coef: &[Vec<C64>],
    y: &[C64],
) -> Col<C64> {
    let n = basis[0].nrows();
    let mut delta = Col::<C64>::zeros(n);
    for (j, &yj) in y.iter().enumerate() {
        axpy(&mut delta, yj, basis[j].as_ref());
        for (i, &coef) in b_coef[j].iter().enumerate() {
            axpy(&mut delta, -(coef * yj), outer_u[i].as_ref());
        }
    }
    delta
}

fn gcrot_combine(
    x: &Col<C64>,
    basis: &[Col<C64>],
    outer_u: &[Col<C64>],
    b_coef: &[Vec<C64>],
    y: &[C64],
) -> Col<C64> {
    let mut out = x.clone();
    let delta = gcrot_delta(basis, outer_u, b_coef, y);
    for i in 0..out.nrows() {
        out[i] += delta[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // dense reference system: a diagonally dominant complex matrix
    fn test_system(n: usize) -> impl Fn(ColRef<C64>) -> Col<C64> {
        move |x: ColRef<C64>| {
            Col::<C64>::from_fn(n, |i| {
                let mut acc = C64::new(4. + i as f64, 0.5) * x[i];
                if i > 0 {
                    acc += C64::new(1., -0.25) * x[i - 1];
                }
                if i + 1 < n {
                    acc += C64::new(0.5, 0.5) * x[i + 1];
                }
                acc
            })
        }
    }

    fn identity_pcd() -> impl Fn(ColRef<C64>) -> Col<C64> {
        |x: ColRef<C64>| x.to_owned()
    }

    fn check_solution<S: Fn(ColRef<C64>) -> Col<C64>>(sys: &S, rhs: ColRef<C64>, sol: ColRef<C64>) {
        let ax = sys(sol);
        let mut res = 0.;
        for i in 0..rhs.nrows() {
            res += (ax[i] - rhs[i]).norm();
        }
        assert!(res < 1e-6 * rhs.norm_l2(), "residual too large: {res}");
    }

    #[test]
    fn gmres_solves_dense_system() {
        let n = 20;
        let sys = test_system(n);
        let rhs = Col::<C64>::from_fn(n, |i| C64::new(1. + i as f64, -0.5));
        let options = IterOptions::default();

        let out = solve_krylov(&sys, &identity_pcd(), rhs.as_ref(), None, &options, &mut NullObserver);
        assert!(out.converged);
        check_solution(&sys, rhs.as_ref(), out.sol.as_ref());
    }

    #[test]
    fn gmres_restarted_converges() {
        let n = 25;
        let sys = test_system(n);
        let rhs = Col::<C64>::from_fn(n, |i| C64::new((i % 3) as f64, 1.));
        let options = IterOptions {
            n_inner: 5,
            n_outer: 50,
            ..IterOptions::default()
        };

        let out = solve_krylov(&sys, &identity_pcd(), rhs.as_ref(), None, &options, &mut NullObserver);
        assert!(out.converged);
        check_solution(&sys, rhs.as_ref(), out.sol.as_ref());
    }

    #[test]
    fn gcrot_solves_dense_system() {
        let n = 25;
        let sys = test_system(n);
        let rhs = Col::<C64>::from_fn(n, |i| C64::new(1., 0.1 * i as f64));
        let options = IterOptions {
            solver: KrylovSolver::Gcrot,
            n_inner: 6,
            n_outer: 50,
            ..IterOptions::default()
        };

        let out = solve_krylov(&sys, &identity_pcd(), rhs.as_ref(), None, &options, &mut NullObserver);
        assert!(out.converged);
        check_solution(&sys, rhs.as_ref(), out.sol.as_ref());
    }

    #[test]
    fn zero_rhs_returns_zero() {
        let n = 10;
        let sys = test_system(n);
        let rhs = Col::<C64>::zeros(n);
        let out = solve_krylov(
            &sys,
            &identity_pcd(),
            rhs.as_ref(),
            None,
            &IterOptions::default(),
            &mut NullObserver,
        );
        assert!(out.converged);
        assert_eq!(out.n_iter, 0);
        assert_relative_eq!(out.sol.norm_l2(), 0.);
    }

    #[test]
    fn warm_start_skips_iterations() {
        let n = 15;
        let sys = test_system(n);
        let rhs = Col::<C64>::from_fn(n, |i| C64::new(1. + i as f64, 0.));
        let options = IterOptions::default();

        let first = solve_krylov(&sys, &identity_pcd(), rhs.as_ref(), None, &options, &mut NullObserver);
        assert!(first.converged);

        let second = solve_krylov(
            &sys,
            &identity_pcd(),
            rhs.as_ref(),
            Some(first.sol.as_ref()),
            &options,
            &mut NullObserver,
        );
        assert!(second.converged);
        assert!(second.n_iter <= 1);
    }

    #[test]
    fn observer_stops_iteration() {
        struct StopAfter(usize, usize);
        impl IterObserver for StopAfter {
            fn on_iterate(&mut self, _sol: ColRef<C64>) -> IterControl {
                self.1 += 1;
                if self.1 >= self.0 {
                    IterControl::Stop(StopReason::PowerStable)
                } else {
                    IterControl::Continue
                }
            }
        }

        let n = 20;
        let sys = test_system(n);
        let rhs = Col::<C64>::from_fn(n, |i| C64::new(1. + i as f64, 0.));
        let mut observer = StopAfter(3, 0);
        let options = IterOptions {
            rel_tol: 1e-14,
            ..IterOptions::default()
        };

        let out = solve_krylov(&sys, &identity_pcd(), rhs.as_ref(), None, &options, &mut observer);
        assert!(out.stopped);
        assert_eq!(out.n_iter, 3);
    }
}
