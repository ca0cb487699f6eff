//! Per-sweep solver pipeline.
//!
//! The geometry-level data (incidence, Green/coupling tensors) is
//! built once and shared across the sweeps; each sweep resolves its
//! material/source values, assembles the operators and the
//! preconditioner, runs the Krylov solve, and extracts the
//! observables. The phases are strictly sequential.

use std::collections::BTreeMap;

use faer::{Col, ColRef};

use crate::condition::{check_condition, ConditionStatus};
use crate::domain::{
    build_indexing, material_vectors, source_vectors, MaterialDef, ProblemIndexing, SourceDef,
};
use crate::error::Result;
use crate::extract::{
    self, FieldBundle, Integral, MaterialLosses, Terminal,
};
use crate::fft::Tensor4;
use crate::green;
use crate::operators::{
    inductance_matrix, potential_matrix, resistance_vector, CouplingOperators,
};
use crate::options::Tolerance;
use crate::solve::{solve_equation_system, EquationSystem, SolverConvergence, SolverStatus};
use crate::sweep::SweepParam;
use crate::system::{
    electric_preconditioner, magnetic_preconditioner, source_rhs, CouplingSystem, ElectricSystem,
    MagneticSystem, SolutionLayout, SourceCoupling,
};
use crate::voxel::{FaceTopology, Geometry};
use crate::C64;

/// Pin the higher-ranked signature of the convergence-metric closure.
fn conv_fn<F>(f: F) -> F
where
    F: for<'r> Fn(faer::ColRef<'r, C64>) -> C64,
{
    f
}

/// Summary of the problem size.
#[derive(Debug, Clone)]
pub struct ProblemStatus {
    pub n_voxel_total: usize,
    pub n_face_total: usize,
    pub n_voxel_electric: usize,
    pub n_voxel_magnetic: usize,
    pub n_face_electric: usize,
    pub n_face_magnetic: usize,
    pub n_src_current: usize,
    pub n_src_voltage: usize,
    pub ratio_voxel: f64,
    pub ratio_face: f64,
}

/// Output record of one sweep.
#[derive(Debug, Clone)]
pub struct SweepResult {
    pub freq: f64,
    pub solution_ok: bool,
    pub solver_ok: bool,
    pub condition_ok: bool,
    pub solver_status: SolverStatus,
    pub condition_status: ConditionStatus,
    pub solver_convergence: SolverConvergence,
    pub integral_total: Integral,
    pub material_losses: BTreeMap<String, MaterialLosses>,
    pub source_values: BTreeMap<String, Terminal>,
    pub field_values: FieldBundle,
    /// Raw solution vector (warm-start seed for dependent sweeps).
    pub sol: Col<C64>,
}

/// Geometry-level solver state, shared across the sweeps.
pub struct SolverContext {
    pub geometry: Geometry,
    pub indexing: ProblemIndexing,
    pub topo_c: FaceTopology,
    pub topo_m: FaceTopology,
    pub layout: SolutionLayout,
    pub problem_status: ProblemStatus,
    pub tolerance: Tolerance,
    g_self: f64,
    g_tensor: Tensor4,
    k_tensor: Option<Tensor4>,
    pts_vc: Vec<[f64; 3]>,
    pts_vm: Vec<[f64; 3]>,
}

impl SolverContext {
    /// Validate the problem and build the geometry-level data.
    pub fn new(
        geometry: Geometry,
        material_def: &BTreeMap<String, MaterialDef>,
        source_def: &BTreeMap<String, SourceDef>,
        tolerance: Tolerance,
    ) -> Result<Self> {
        let indexing = build_indexing(&geometry, material_def, source_def)?;
        let grid = &geometry.grid;

        log::debug!("voxel geometry");
        let topo_c = FaceTopology::build(grid, &indexing.idx_vc);
        let topo_m = FaceTopology::build(grid, &indexing.idx_vm);

        log::debug!("green tensors");
        let g_self = green::green_self(grid.d);
        let g_tensor = green::green_tensor(grid, tolerance.integral_simplify);
        let k_tensor = if indexing.has_coupling() {
            Some(green::coupling_tensor(grid, tolerance.integral_simplify))
        } else {
            None
        };

        let pts_vc = indexing.idx_vc.iter().map(|&i| grid.voxel_center(i)).collect();
        let pts_vm = indexing.idx_vm.iter().map(|&i| grid.voxel_center(i)).collect();

        let layout = SolutionLayout {
            n_fc: topo_c.n_f(),
            n_vc: topo_c.n_v(),
            n_src: indexing.n_src(),
            n_fm: topo_m.n_f(),
            n_vm: topo_m.n_v(),
        };

        let n_voxel_total = grid.voxel_count();
        let n_face_total = grid.face_count();
        let n_voxel_used = topo_c.n_v() + topo_m.n_v();
        let n_face_used = topo_c.n_f() + topo_m.n_f();
        let problem_status = ProblemStatus {
            n_voxel_total,
            n_face_total,
            n_voxel_electric: topo_c.n_v(),
            n_voxel_magnetic: topo_m.n_v(),
            n_face_electric: topo_c.n_f(),
            n_face_magnetic: topo_m.n_f(),
            n_src_current: indexing.idx_src_c.len(),
            n_src_voltage: indexing.idx_src_v.len(),
            ratio_voxel: n_voxel_used as f64 / n_voxel_total as f64,
            ratio_face: n_face_used as f64 / n_face_total as f64,
        };
        log::debug!("n_voxel_total = {}", problem_status.n_voxel_total);
        log::debug!("n_voxel_electric = {}", problem_status.n_voxel_electric);
        log::debug!("n_voxel_magnetic = {}", problem_status.n_voxel_magnetic);
        log::debug!("n_face_electric = {}", problem_status.n_face_electric);
        log::debug!("n_face_magnetic = {}", problem_status.n_face_magnetic);
        log::debug!("ratio_voxel = {:.2e}", problem_status.ratio_voxel);

        Ok(SolverContext {
            geometry,
            indexing,
            topo_c,
            topo_m,
            layout,
            problem_status,
            tolerance,
            g_self,
            g_tensor,
            k_tensor,
            pts_vc,
            pts_vm,
        })
    }

    /// Assemble, solve, and extract one sweep.
    pub fn run_sweep(
        &self,
        param: &SweepParam,
        warm_start: Option<ColRef<C64>>,
    ) -> Result<SweepResult> {
        let grid = &self.geometry.grid;
        let freq = param.freq;
        let has_magnetic = self.indexing.has_magnetic();

        // resolve the per-sweep values
        let mat = material_vectors(&self.indexing, &param.material_val)?;
        let src = source_vectors(&self.indexing, &param.source_val)?;

        // operator assembly
        log::debug!("operator assembly");
        let r_vec_c = resistance_vector(grid, &self.topo_c, &mat.rho_vc);
        let r_vec_m = resistance_vector(grid, &self.topo_m, &mat.rho_vm);
        let (l_vec, l_op) = inductance_matrix(grid, &self.topo_c, self.g_self, &self.g_tensor);
        let potential = if has_magnetic {
            Some(potential_matrix(grid, &self.topo_m, self.g_self, &self.g_tensor))
        } else {
            None
        };
        let coupling = self.k_tensor.as_ref().map(|k_tsr| {
            CouplingOperators::build(grid, &self.topo_c, &self.topo_m, k_tsr)
        });

        let src_coupling = SourceCoupling::build(&self.indexing, &src);
        let (rhs_c, rhs_m) = source_rhs(&self.layout, &src);

        // preconditioner factorization
        log::debug!("preconditioner factorization");
        let (pcd_c, mat_c) = electric_preconditioner(
            freq,
            &self.topo_c,
            &r_vec_c,
            &l_vec,
            &src_coupling,
            &self.tolerance.factorization_options,
        );
        let p_vec = match &potential {
            Some((p_vec, _)) => p_vec.clone(),
            None => Col::<C64>::zeros(0),
        };
        let (pcd_m, mat_m) = magnetic_preconditioner(
            &self.topo_m,
            &r_vec_m,
            &p_vec,
            &self.tolerance.factorization_options,
        );

        // condition check
        let condition_status = check_condition(
            &mat_c,
            &mat_m,
            &self.tolerance.condition_options,
            &self.tolerance.factorization_options,
        );
        let condition_ok = condition_status.status;

        // matrix-free system operators
        let sys_c = ElectricSystem {
            freq,
            topo: &self.topo_c,
            r_vec: &r_vec_c,
            l_op: &l_op,
            src: &src_coupling,
        };
        let sys_m = MagneticSystem {
            topo: &self.topo_m,
            r_vec: &r_vec_m,
            p_op: potential.as_ref().map(|(_, op)| op),
        };
        let cpl = CouplingSystem {
            freq,
            layout: self.layout,
            ops: coupling.as_ref(),
        };

        let eq = EquationSystem {
            layout: self.layout,
            sys_c: Box::new(move |sol| sys_c.apply(sol)),
            sys_m: Box::new(move |sol| sys_m.apply(sol)),
            cpl_c: Box::new(move |sol| cpl.apply_electric(sol)),
            cpl_m: Box::new(move |sol| cpl.apply_magnetic(sol)),
            pcd_c: Box::new(move |rhs| pcd_c.apply(rhs)),
            pcd_m: Box::new(move |rhs| pcd_m.apply(rhs)),
            rhs_c,
            rhs_m,
        };

        // Krylov solve
        log::debug!("equation solver");
        let layout = self.layout;
        let source_pos = &self.indexing.source_pos;
        let fct_conv = conv_fn(move |sol| extract::total_power(freq, &layout, source_pos, sol));
        let (sol, solver_ok, solver_convergence, solver_status) = solve_equation_system(
            &eq,
            warm_start,
            &fct_conv,
            &self.tolerance.solver_options,
        );

        // extraction
        log::debug!("extract solution");
        let split = extract::split_solution(&self.layout, sol.as_ref());
        let (p_fc, p_fm) = extract::face_losses(freq, split.i_fc, &r_vec_c, split.i_fm, &r_vec_m);
        let (w_fc, w_fm) =
            extract::face_energy(freq, split.i_fc, split.i_fm, &l_op, coupling.as_ref());
        let integral_total = extract::integral_quantities(&p_fc, &p_fm, &w_fc, &w_fm);
        let material_losses =
            extract::material_losses(&self.indexing, &self.topo_c, &self.topo_m, &p_fc, &p_fm);
        let source_values =
            extract::terminal_values(freq, &self.indexing, split.v_vc, split.i_src);

        let j_vc = extract::vector_density(grid, &self.topo_c, split.i_fc);
        let b_vm = extract::vector_density(grid, &self.topo_m, split.i_fm);
        let s_vc = extract::divergence_density(grid, &self.topo_c, split.i_fc);
        let q_vm = extract::divergence_density(grid, &self.topo_m, split.i_fm);
        let p_vc = extract::scalar_density(grid, &self.topo_c, &p_fc);
        let p_vm = extract::scalar_density(grid, &self.topo_m, &p_fm);

        let h_cloud = if self.tolerance.biot_savart && !self.geometry.pts_cloud.is_empty() {
            extract::magnetic_field_cloud(
                grid,
                &self.geometry.pts_cloud,
                &self.pts_vc,
                &j_vc,
                &self.pts_vm,
                &q_vm,
            )
        } else {
            Vec::new()
        };

        let field_values = FieldBundle {
            n_voxel: grid.voxel_count(),
            idx_vc: self.indexing.idx_vc.clone(),
            idx_vm: self.indexing.idx_vm.clone(),
            v_vc: (0..self.layout.n_vc).map(|i| split.v_vc[i]).collect(),
            v_vm: (0..self.layout.n_vm).map(|i| split.v_vm[i]).collect(),
            j_vc,
            b_vm,
            p_vc,
            p_vm,
            s_vc,
            q_vm,
            h_cloud,
        };

        Ok(SweepResult {
            freq,
            solution_ok: solver_ok && condition_ok,
            solver_ok,
            condition_ok,
            solver_status,
            condition_status,
            solver_convergence,
            integral_total,
            material_losses,
            source_values,
            field_values,
            sol,
        })
    }
}
