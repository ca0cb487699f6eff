//! Drivers for the coupled equation system.
//!
//! Two coupling schemes are available:
//!   - `direct`: one Krylov solve over the concatenated
//!     electric+magnetic system with block-diagonal preconditioning
//!   - `segregated`: a fixed-point loop of relaxed per-domain Krylov
//!     solves, useful when the preconditioner is weak (strong
//!     magnetic coupling)
//!
//! The terminal complex power is evaluated at every iterate; with the
//! power stop enabled, a stable power aborts the iteration before the
//! residual tolerance is met.

use std::cell::Cell;

use faer::{Col, ColRef};

use crate::krylov::{solve_krylov, IterControl, IterObserver, NullObserver, StopReason};
use crate::options::{Coupling, PowerOptions, SolverOptions};
use crate::system::SolutionLayout;
use crate::C64;

/// Boxed matrix-free operator.
pub type OpFn<'a> = Box<dyn Fn(ColRef<C64>) -> Col<C64> + 'a>;

/// Pin the higher-ranked signature of an operator closure so it can
/// be passed through the generic Krylov kernels.
fn op_fn<F>(f: F) -> F
where
    F: for<'r> Fn(ColRef<'r, C64>) -> Col<C64>,
{
    f
}

/// The assembled equation system: per-domain operators, coupling
/// operators, preconditioners, and right-hand sides.
pub struct EquationSystem<'a> {
    pub layout: SolutionLayout,
    pub sys_c: OpFn<'a>,
    pub sys_m: OpFn<'a>,
    /// Magnetic-to-electric coupling (input: magnetic solution).
    pub cpl_c: OpFn<'a>,
    /// Electric-to-magnetic coupling (input: electric solution).
    pub cpl_m: OpFn<'a>,
    pub pcd_c: OpFn<'a>,
    pub pcd_m: OpFn<'a>,
    pub rhs_c: Col<C64>,
    pub rhs_m: Col<C64>,
}

impl EquationSystem<'_> {
    fn n_dof_c(&self) -> usize {
        self.rhs_c.nrows()
    }

    fn n_dof_m(&self) -> usize {
        self.rhs_m.nrows()
    }

    fn rhs_all(&self) -> Col<C64> {
        concat(self.rhs_c.as_ref(), self.rhs_m.as_ref())
    }

    /// Full coupled system product.
    fn sys_all(&self, sol: ColRef<C64>) -> Col<C64> {
        let (n_c, n_m) = (self.n_dof_c(), self.n_dof_m());
        let sol_c = sol.subrows(0, n_c);
        let sol_m = sol.subrows(n_c, n_m);
        let mut out_c = (self.sys_c)(sol_c);
        let cpl_c = (self.cpl_c)(sol_m);
        for i in 0..n_c {
            out_c[i] += cpl_c[i];
        }
        let mut out_m = (self.sys_m)(sol_m);
        let cpl_m = (self.cpl_m)(sol_c);
        for i in 0..n_m {
            out_m[i] += cpl_m[i];
        }
        concat(out_c.as_ref(), out_m.as_ref())
    }
}

fn concat(a: ColRef<C64>, b: ColRef<C64>) -> Col<C64> {
    Col::<C64>::from_fn(a.nrows() + b.nrows(), |i| {
        if i < a.nrows() {
            a[i]
        } else {
            b[i - a.nrows()]
        }
    })
}

/// Counters for the operator evaluations.
#[derive(Default)]
struct OpCounter {
    n_sys: Cell<usize>,
    n_pcd: Cell<usize>,
}

/// Observer monitoring the terminal complex power.
struct PowerMonitor<'a> {
    fct_conv: &'a dyn Fn(ColRef<C64>) -> C64,
    options: PowerOptions,
    n_iter: usize,
    power_vec: Vec<C64>,
}

impl PowerMonitor<'_> {
    fn new<'a>(fct_conv: &'a dyn Fn(ColRef<C64>) -> C64, options: PowerOptions) -> PowerMonitor<'a> {
        PowerMonitor {
            fct_conv,
            options,
            n_iter: 0,
            power_vec: Vec::new(),
        }
    }
}

impl IterObserver for PowerMonitor<'_> {
    fn on_iterate(&mut self, sol: ColRef<C64>) -> IterControl {
        self.n_iter += 1;
        let power = (self.fct_conv)(sol);
        self.power_vec.push(power);
        log::debug!("iter = {} / S = {:.2e}{:+.2e}j VA", self.n_iter, power.re, power.im);

        let n_iter_min = 2usize.max(self.options.n_cmp + 1).max(self.options.n_min);
        if self.options.stop && self.n_iter >= n_iter_min {
            let power_ref = *self.power_vec.last().unwrap();
            let start = self.power_vec.len() - 1 - self.options.n_cmp;
            let power_err = self.power_vec[start..self.power_vec.len() - 1]
                .iter()
                .map(|p| (power_ref - p).norm())
                .fold(0., f64::max);
            let power_thr = f64::max(
                self.options.rel_tol * power_ref.norm(),
                self.options.abs_tol,
            );
            if power_err <= power_thr {
                return IterControl::Stop(StopReason::PowerStable);
            }
        }
        IterControl::Continue
    }
}

/// Convergence history of one solve.
#[derive(Debug, Clone)]
pub struct SolverConvergence {
    pub power_init: C64,
    pub power_final: C64,
    pub power_vec: Vec<C64>,
    pub residuum: f64,
}

/// Statistics and status of one solve.
#[derive(Debug, Clone)]
pub struct SolverStatus {
    pub n_dof_electric: usize,
    pub n_dof_magnetic: usize,
    pub n_dof_total: usize,
    pub n_iter: usize,
    pub n_sys_eval: usize,
    pub n_pcd_eval: usize,
    pub residuum_val: f64,
    pub residuum_thr: f64,
    /// Combined solver/residuum status.
    pub status: bool,
    /// The iteration was aborted by the power stop.
    pub power: bool,
}

/// Solve the coupled equation system.
pub fn solve_equation_system(
    eq: &EquationSystem,
    sol_init: Option<ColRef<C64>>,
    fct_conv: &dyn Fn(ColRef<C64>) -> C64,
    options: &SolverOptions,
) -> (Col<C64>, bool, SolverConvergence, SolverStatus) {
    let n_dof_c = eq.n_dof_c();
    let n_dof_m = eq.n_dof_m();
    let n_dof = n_dof_c + n_dof_m;

    let sol_init = match sol_init {
        Some(sol) => sol.to_owned(),
        None => Col::<C64>::zeros(n_dof),
    };

    let counter = OpCounter::default();
    let mut monitor = PowerMonitor::new(fct_conv, options.power_options.clone());
    let power_init = fct_conv(sol_init.as_ref());
    log::debug!("init / S = {:.2e}{:+.2e}j VA", power_init.re, power_init.im);

    let (krylov_ok, power, sol) = match options.coupling {
        Coupling::Direct => solve_direct(eq, sol_init, &counter, &mut monitor, options),
        Coupling::Segregated => solve_segregated(eq, sol_init, &counter, &mut monitor, options),
    };

    let power_final = fct_conv(sol.as_ref());
    log::debug!("final / S = {:.2e}{:+.2e}j VA", power_final.re, power_final.im);

    // final status on the unpreconditioned system
    let status_options = &options.status_options;
    let rhs = eq.rhs_all();
    let out = eq.sys_all(sol.as_ref());
    let mut residuum = 0.;
    for i in 0..n_dof {
        residuum += (out[i] - rhs[i]).norm().powi(2);
    }
    let residuum_val = residuum.sqrt();
    let residuum_thr = f64::max(
        status_options.rel_tol * rhs.norm_l2(),
        status_options.abs_tol,
    );

    let status_solver = status_options.ignore_status || krylov_ok;
    let status_residuum = status_options.ignore_res || (residuum_val < residuum_thr);
    let status = status_solver && status_residuum;

    let solver_status = SolverStatus {
        n_dof_electric: n_dof_c,
        n_dof_magnetic: n_dof_m,
        n_dof_total: n_dof,
        n_iter: monitor.n_iter,
        n_sys_eval: counter.n_sys.get(),
        n_pcd_eval: counter.n_pcd.get(),
        residuum_val,
        residuum_thr,
        status,
        power,
    };

    let solver_convergence = SolverConvergence {
        power_init,
        power_final,
        power_vec: monitor.power_vec.clone(),
        residuum: residuum_val,
    };

    log::debug!("n_dof_total = {n_dof}");
    log::debug!("n_iter = {}", solver_status.n_iter);
    log::debug!("n_sys_eval = {}", solver_status.n_sys_eval);
    log::debug!("n_pcd_eval = {}", solver_status.n_pcd_eval);
    log::debug!("residuum_val = {residuum_val:.2e}");
    log::debug!("residuum_thr = {residuum_thr:.2e}");
    if status {
        log::debug!("convergence achieved");
    } else {
        log::warn!("convergence issues");
    }

    (sol, status, solver_convergence, solver_status)
}

fn solve_direct(
    eq: &EquationSystem,
    sol_init: Col<C64>,
    counter: &OpCounter,
    monitor: &mut PowerMonitor,
    options: &SolverOptions,
) -> (bool, bool, Col<C64>) {
    let sys = op_fn(|sol| {
        counter.n_sys.set(counter.n_sys.get() + 1);
        eq.sys_all(sol)
    });
    let pcd = op_fn(|rhs| {
        counter.n_pcd.set(counter.n_pcd.get() + 1);
        let rhs_c = rhs.subrows(0, eq.n_dof_c());
        let rhs_m = rhs.subrows(eq.n_dof_c(), eq.n_dof_m());
        let sol_c = (eq.pcd_c)(rhs_c);
        let sol_m = (eq.pcd_m)(rhs_m);
        concat(sol_c.as_ref(), sol_m.as_ref())
    });

    let rhs = eq.rhs_all();
    let out = solve_krylov(
        &sys,
        &pcd,
        rhs.as_ref(),
        Some(sol_init.as_ref()),
        &options.direct_options,
        monitor,
    );

    // a power stop is a successful termination
    let krylov_ok = out.converged || out.stopped;
    (krylov_ok, out.stopped, out.sol)
}

fn solve_segregated(
    eq: &EquationSystem,
    sol_init: Col<C64>,
    counter: &OpCounter,
    monitor: &mut PowerMonitor,
    options: &SolverOptions,
) -> (bool, bool, Col<C64>) {
    let seg = &options.segregated_options;
    let (n_c, n_m) = (eq.n_dof_c(), eq.n_dof_m());

    let mut sol_c = sol_init.subrows(0, n_c).to_owned();
    let mut sol_m = sol_init.subrows(n_c, n_m).to_owned();

    let sys_c = op_fn(|sol| {
        counter.n_sys.set(counter.n_sys.get() + 1);
        (eq.sys_c)(sol)
    });
    let sys_m = op_fn(|sol| {
        counter.n_sys.set(counter.n_sys.get() + 1);
        (eq.sys_m)(sol)
    });
    let pcd_c = op_fn(|rhs| {
        counter.n_pcd.set(counter.n_pcd.get() + 1);
        (eq.pcd_c)(rhs)
    });
    let pcd_m = op_fn(|rhs| {
        counter.n_pcd.set(counter.n_pcd.get() + 1);
        (eq.pcd_m)(rhs)
    });

    let rhs_norm = eq.rhs_all().norm_l2();
    let res_thr = f64::max(seg.rel_tol * rhs_norm, seg.abs_tol);

    let mut status = false;
    let mut power = false;
    let mut n_iter = 0;

    loop {
        // relaxed electric sub-solve with the magnetic coupling fixed
        let cpl = (eq.cpl_c)(sol_m.as_ref());
        let rhs_c = Col::<C64>::from_fn(n_c, |i| eq.rhs_c[i] - cpl[i]);
        let out_c = solve_krylov(
            &sys_c,
            &pcd_c,
            rhs_c.as_ref(),
            Some(sol_c.as_ref()),
            &seg.iter_electric_options,
            &mut NullObserver,
        );
        for i in 0..n_c {
            sol_c[i] = (1. - seg.relax_electric) * sol_c[i] + seg.relax_electric * out_c.sol[i];
        }

        // relaxed magnetic sub-solve with the electric coupling fixed
        let cpl = (eq.cpl_m)(sol_c.as_ref());
        let rhs_m = Col::<C64>::from_fn(n_m, |i| eq.rhs_m[i] - cpl[i]);
        let out_m = solve_krylov(
            &sys_m,
            &pcd_m,
            rhs_m.as_ref(),
            Some(sol_m.as_ref()),
            &seg.iter_magnetic_options,
            &mut NullObserver,
        );
        for i in 0..n_m {
            sol_m[i] = (1. - seg.relax_magnetic) * sol_m[i] + seg.relax_magnetic * out_m.sol[i];
        }

        // global residuum of the coupled system
        let sol = concat(sol_c.as_ref(), sol_m.as_ref());
        let out = eq.sys_all(sol.as_ref());
        let rhs = eq.rhs_all();
        let mut res = 0.;
        for i in 0..n_c + n_m {
            res += (out[i] - rhs[i]).norm().powi(2);
        }
        let res = res.sqrt();

        if let IterControl::Stop(_) = monitor.on_iterate(sol.as_ref()) {
            power = true;
            status = true;
            break;
        }
        n_iter += 1;

        let status_res = res <= res_thr;
        status = out_c.converged && out_m.converged && status_res;

        if (n_iter >= seg.n_max) || (status && n_iter >= seg.n_min) {
            break;
        }
    }

    (status, power, concat(sol_c.as_ref(), sol_m.as_ref()))
}
