//! Sweep driver with warm-start interdependencies.
//!
//! The sweeps form a forest: each sweep can name another sweep whose
//! solution seeds its own Krylov solve (warm start). The forest is
//! validated (no cycles, no dangling references), then walked from
//! the roots; the sweeps of one ready batch are independent and can
//! run in parallel workers.

use std::collections::BTreeMap;

use faer::Col;
use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::domain::{MaterialDef, MaterialValue, SourceDef, SourceValue};
use crate::driver::{SolverContext, SweepResult};
use crate::error::{Error, Result};
use crate::options::Tolerance;
use crate::voxel::Geometry;
use crate::C64;

/// Parameters of one sweep.
#[derive(Debug, Clone)]
pub struct SweepParam {
    pub freq: f64,
    pub material_val: BTreeMap<String, MaterialValue>,
    pub source_val: BTreeMap<String, SourceValue>,
}

/// One sweep of the solver: its parameters and the optional name of
/// the sweep providing the warm-start solution.
#[derive(Debug, Clone)]
pub struct SweepDef {
    pub init: Option<String>,
    pub param: SweepParam,
}

/// Check that the warm-start references form a forest reachable from
/// the roots (no cycles, no unknown names).
fn check_forest(sweep_solver: &BTreeMap<String, SweepDef>) -> Result<()> {
    for (tag, def) in sweep_solver {
        if let Some(init) = &def.init {
            if !sweep_solver.contains_key(init) {
                return Err(Error::InvalidSweep(format!(
                    "unknown init reference: {tag} -> {init}"
                )));
            }
        }
    }

    // walk from the virtual root and count the reachable sweeps
    let mut reached: Vec<&String> = sweep_solver
        .iter()
        .filter(|(_, def)| def.init.is_none())
        .map(|(tag, _)| tag)
        .collect();
    let mut n_reached = 0;
    while let Some(tag) = reached.pop() {
        n_reached += 1;
        for (child, def) in sweep_solver {
            if def.init.as_ref() == Some(tag) {
                reached.push(child);
            }
        }
    }

    if n_reached != sweep_solver.len() {
        return Err(Error::InvalidSweep(
            "cyclic or unreachable dependencies".to_string(),
        ));
    }
    Ok(())
}

/// Run a batch of independent sweeps (serial or parallel workers).
fn run_batch(
    ctx: &SolverContext,
    batch: Vec<(String, SweepParam, Option<Col<C64>>)>,
    n_jobs: usize,
) -> Vec<(String, Result<SweepResult>)> {
    if n_jobs == 0 || batch.len() == 1 {
        batch
            .into_iter()
            .map(|(tag, param, warm)| {
                log::info!("sweep run: {tag}");
                let out = ctx.run_sweep(&param, warm.as_ref().map(|w| w.as_ref()));
                (tag, out)
            })
            .collect()
    } else {
        let n = batch.len() as u64;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_jobs)
            .build()
            .expect("worker pool creation failed");
        pool.install(|| {
            batch
                .into_par_iter()
                .progress_with(ProgressBar::new(n))
                .map(|(tag, param, warm)| {
                    log::info!("sweep run: {tag}");
                    let out = ctx.run_sweep(&param, warm.as_ref().map(|w| w.as_ref()));
                    (tag, out)
                })
                .collect()
        })
    }
}

/// Solve all the sweeps of a problem.
///
/// Dependent sweeps wait for their parent; a failed parent solution
/// is never consumed as a warm start (the dependents run cold).
pub fn run_sweeps(
    geometry: Geometry,
    material_def: &BTreeMap<String, MaterialDef>,
    source_def: &BTreeMap<String, SourceDef>,
    sweep_solver: &BTreeMap<String, SweepDef>,
    tolerance: Tolerance,
) -> Result<BTreeMap<String, SweepResult>> {
    check_forest(sweep_solver)?;

    let n_jobs = tolerance.parallel_sweep.n_jobs;
    let ctx = SolverContext::new(geometry, material_def, source_def, tolerance)?;

    let mut output: BTreeMap<String, SweepResult> = BTreeMap::new();
    let mut pending: BTreeMap<&String, &SweepDef> = sweep_solver.iter().collect();

    while !pending.is_empty() {
        // sweeps whose parent (if any) is already computed
        let ready: Vec<String> = pending
            .iter()
            .filter(|(_, def)| match &def.init {
                None => true,
                Some(init) => output.contains_key(init),
            })
            .map(|(tag, _)| (*tag).clone())
            .collect();

        let batch: Vec<(String, SweepParam, Option<Col<C64>>)> = ready
            .iter()
            .map(|tag| {
                let def = pending[tag];
                let warm = def.init.as_ref().and_then(|init| {
                    let parent = &output[init];
                    if parent.solution_ok {
                        Some(parent.sol.clone())
                    } else {
                        log::warn!("parent sweep failed, cold start: {tag}");
                        None
                    }
                });
                (tag.clone(), def.param.clone(), warm)
            })
            .collect();

        for (tag, out) in run_batch(&ctx, batch, n_jobs) {
            let result = out?;
            if !result.solution_ok {
                log::warn!("sweep failed: {tag}");
            }
            pending.remove(&tag);
            output.insert(tag, result);
        }
    }

    Ok(output)
}
