//! Extraction of the observables from the solution vector.
//!
//! The solution is split into the face currents/fluxes, the voxel
//! potentials, and the source currents. Face variables are projected
//! onto voxel densities, losses and energies are integrated, the
//! terminal quantities are parsed per source, and the magnetic field
//! is evaluated at the cloud points with lumped variables
//! (Biot-Savart and magnetic charges).

use std::collections::BTreeMap;

use faer::{Col, ColRef};

use crate::constants::{laplace_s, MU_0};
use crate::domain::{ProblemIndexing, SourcePos, SourceType};
use crate::fft::CirculantOperator;
use crate::operators::CouplingOperators;
use crate::system::SolutionLayout;
use crate::voxel::{FaceTopology, VoxelGrid};
use crate::C64;

/// Views into the solution vector `[I_fc | V_vc | I_src | I_fm | V_vm]`.
pub struct SolutionSplit<'a> {
    pub i_fc: ColRef<'a, C64>,
    pub v_vc: ColRef<'a, C64>,
    pub i_src: ColRef<'a, C64>,
    pub i_fm: ColRef<'a, C64>,
    pub v_vm: ColRef<'a, C64>,
}

pub fn split_solution<'a>(layout: &SolutionLayout, sol: ColRef<'a, C64>) -> SolutionSplit<'a> {
    let mut offset = 0;
    let mut take = |n: usize| {
        let view = sol.subrows(offset, n);
        offset += n;
        view
    };
    SolutionSplit {
        i_fc: take(layout.n_fc),
        v_vc: take(layout.n_vc),
        i_src: take(layout.n_src),
        i_fm: take(layout.n_fm),
        v_vm: take(layout.n_vm),
    }
}

/// Time-averaging factor of quadratic quantities (peak phasors).
fn power_factor(freq: f64) -> f64 {
    if freq == 0. {
        1.
    } else {
        0.5
    }
}

/// Face area perpendicular to the axis `a`.
fn face_area(d: [f64; 3], a: usize) -> f64 {
    let (b, c) = ((a + 1) % 3, (a + 2) % 3);
    d[b] * d[c]
}

/// Project a face variable onto per-voxel vector densities
/// (`0.5*|A|*v_f` scaled with the face areas).
pub fn vector_density(grid: &VoxelGrid, topo: &FaceTopology, var_f: ColRef<C64>) -> Vec<[C64; 3]> {
    let mut out = vec![[C64::new(0., 0.); 3]; topo.n_v()];
    for k in 0..topo.n_f() {
        let a = topo.axis[k];
        let val = 0.5 * var_f[k] / face_area(grid.d, a);
        out[topo.pos[k]][a] += val;
        out[topo.neg[k]][a] += val;
    }
    out
}

/// Project a face variable onto per-voxel scalar densities
/// (`0.5*|A|*v_f` scaled with the voxel volume).
pub fn scalar_density(grid: &VoxelGrid, topo: &FaceTopology, var_f: &[f64]) -> Vec<f64> {
    let vol = grid.voxel_volume();
    let mut out = vec![0.; topo.n_v()];
    for k in 0..topo.n_f() {
        let val = 0.5 * var_f[k] / vol;
        out[topo.pos[k]] += val;
        out[topo.neg[k]] += val;
    }
    out
}

/// Divergence of a face variable (`A*v_f` scaled with the volume).
pub fn divergence_density(grid: &VoxelGrid, topo: &FaceTopology, var_f: ColRef<C64>) -> Vec<C64> {
    let vol = grid.voxel_volume();
    let div = topo.apply(var_f);
    (0..topo.n_v()).map(|i| div[i] / vol).collect()
}

/// Per-face losses of the electric and magnetic domains.
pub fn face_losses(
    freq: f64,
    i_fc: ColRef<C64>,
    r_c: &Col<C64>,
    i_fm: ColRef<C64>,
    r_m: &Col<C64>,
) -> (Vec<f64>, Vec<f64>) {
    let fact = power_factor(freq);
    let s = laplace_s(freq);

    let p_fc = (0..i_fc.nrows())
        .map(|k| (fact * i_fc[k].conj() * r_c[k] * i_fc[k]).re)
        .collect();
    // the magnetic face variable is a flux: the loss involves its
    // time derivative
    let p_fm = (0..i_fm.nrows())
        .map(|k| (fact * (s * i_fm[k]).conj() * r_m[k] * i_fm[k]).re)
        .collect();
    (p_fc, p_fm)
}

/// Per-face magnetic energies of the electric and magnetic domains.
pub fn face_energy(
    freq: f64,
    i_fc: ColRef<C64>,
    i_fm: ColRef<C64>,
    l_op: &CirculantOperator,
    coupling: Option<&CouplingOperators>,
) -> (Vec<f64>, Vec<f64>) {
    let fact = if freq == 0. { 0.5 } else { 0.25 };

    let l_i = l_op.apply(i_fc);
    let w_fc = (0..i_fc.nrows())
        .map(|k| (fact * i_fc[k].conj() * l_i[k]).re)
        .collect();

    let w_fm = match coupling {
        Some(ops) if i_fm.nrows() > 0 => {
            let k_i = ops.apply_electric(i_fm);
            (0..i_fc.nrows())
                .map(|k| (fact * i_fc[k].conj() * k_i[k]).re)
                .collect()
        }
        _ => vec![0.; i_fc.nrows()],
    };
    (w_fc, w_fm)
}

/// Integral quantities of one sweep.
#[derive(Debug, Clone, Default)]
pub struct Integral {
    pub p_electric: f64,
    pub p_magnetic: f64,
    pub p_total: f64,
    pub w_electric: f64,
    pub w_magnetic: f64,
    pub w_total: f64,
}

pub fn integral_quantities(p_fc: &[f64], p_fm: &[f64], w_fc: &[f64], w_fm: &[f64]) -> Integral {
    let p_electric: f64 = p_fc.iter().sum();
    let p_magnetic: f64 = p_fm.iter().sum();
    let w_electric: f64 = w_fc.iter().sum();
    let w_magnetic: f64 = w_fm.iter().sum();

    let integral = Integral {
        p_electric,
        p_magnetic,
        p_total: p_electric + p_magnetic,
        w_electric,
        w_magnetic,
        w_total: w_electric + w_magnetic,
    };

    log::debug!("integral: P_tot = {:.3e} W", integral.p_total);
    log::debug!("integral: W_tot = {:.3e} J", integral.w_total);
    integral
}

/// Losses of one material domain.
#[derive(Debug, Clone)]
pub struct MaterialLosses {
    pub p_electric: f64,
    pub p_magnetic: f64,
    pub p_total: f64,
}

/// Split the face losses per material domain.
pub fn material_losses(
    indexing: &ProblemIndexing,
    topo_c: &FaceTopology,
    topo_m: &FaceTopology,
    p_fc: &[f64],
    p_fm: &[f64],
) -> BTreeMap<String, MaterialLosses> {
    // face losses averaged onto the voxels
    let project = |topo: &FaceTopology, p_f: &[f64]| -> Vec<f64> {
        let mut out = vec![0.; topo.n_v()];
        for k in 0..topo.n_f() {
            out[topo.pos[k]] += 0.5 * p_f[k];
            out[topo.neg[k]] += 0.5 * p_f[k];
        }
        out
    };
    let p_vc = project(topo_c, p_fc);
    let p_vm = project(topo_m, p_fm);

    let mut out = BTreeMap::new();
    for (tag, pos) in &indexing.material_pos {
        let p_electric: f64 = pos.pos_vc.iter().map(|&row| p_vc[row]).sum();
        let p_magnetic: f64 = pos.pos_vm.iter().map(|&row| p_vm[row]).sum();
        log::debug!("domain {tag}: P = {:.3e} W", p_electric + p_magnetic);
        out.insert(
            tag.clone(),
            MaterialLosses {
                p_electric,
                p_magnetic,
                p_total: p_electric + p_magnetic,
            },
        );
    }
    out
}

/// Terminal quantities of one source domain.
#[derive(Debug, Clone)]
pub struct Terminal {
    pub source_type: SourceType,
    pub v: C64,
    pub i: C64,
    pub s: C64,
}

/// Parse the terminal voltages and currents of the sources.
///
/// The sources carry internal elements, so the terminal values can
/// differ from the excitation values: the voltage is the average over
/// the terminal voxels, the current the sum.
pub fn terminal_values(
    freq: f64,
    indexing: &ProblemIndexing,
    v_vc: ColRef<C64>,
    i_src: ColRef<C64>,
) -> BTreeMap<String, Terminal> {
    let fact = power_factor(freq);
    let mut out = BTreeMap::new();

    for (tag, pos) in &indexing.source_pos {
        let (v, i) = if pos.idx.is_empty() {
            (C64::new(0., 0.), C64::new(0., 0.))
        } else {
            let v: C64 = pos.pos_vc.iter().map(|&row| v_vc[row]).sum::<C64>()
                / pos.pos_vc.len() as f64;
            let i: C64 = pos.pos_src.iter().map(|&row| i_src[row]).sum();
            (v, i)
        };
        let s = fact * v * i.conj();
        log::debug!("terminal {tag}: V = {:+.3e}{:+.3e}j V", v.re, v.im);
        log::debug!("terminal {tag}: I = {:+.3e}{:+.3e}j A", i.re, i.im);
        out.insert(
            tag.clone(),
            Terminal {
                source_type: pos.source_type,
                v,
                i,
                s,
            },
        );
    }
    out
}

/// Total terminal complex power of a solution (convergence metric).
pub fn total_power(
    freq: f64,
    layout: &SolutionLayout,
    source_pos: &BTreeMap<String, SourcePos>,
    sol: ColRef<C64>,
) -> C64 {
    let fact = power_factor(freq);
    let split = split_solution(layout, sol);

    let mut power = C64::new(0., 0.);
    for pos in source_pos.values() {
        for (i, &row_vc) in pos.pos_vc.iter().enumerate() {
            let v = split.v_vc[row_vc];
            let c = split.i_src[pos.pos_src[i]];
            power += fact * v * c.conj();
        }
    }
    power
}

/// Magnetic field at the cloud points.
///
/// The electric contribution is the Biot-Savart sum over the voxel
/// current densities; the magnetic contribution is the charge sum
/// over the voxel flux divergences. Lumped voxel variables are used,
/// so the field is only accurate away from the voxel structure.
pub fn magnetic_field_cloud(
    grid: &VoxelGrid,
    pts_cloud: &[[f64; 3]],
    pts_vc: &[[f64; 3]],
    j_vc: &[[C64; 3]],
    pts_vm: &[[f64; 3]],
    q_vm: &[C64],
) -> Vec<[C64; 3]> {
    let vol = grid.voxel_volume();
    let mut out = Vec::with_capacity(pts_cloud.len());

    for pts in pts_cloud {
        let mut h = [C64::new(0., 0.); 3];

        // Biot-Savart over the electric voxel currents
        for (p_v, j) in pts_vc.iter().zip(j_vc.iter()) {
            let vec = [pts[0] - p_v[0], pts[1] - p_v[1], pts[2] - p_v[2]];
            let nrm = (vec[0] * vec[0] + vec[1] * vec[1] + vec[2] * vec[2]).sqrt();
            let scale = vol / (4. * std::f64::consts::PI * nrm.powi(3));
            h[0] += scale * (j[1] * vec[2] - j[2] * vec[1]);
            h[1] += scale * (j[2] * vec[0] - j[0] * vec[2]);
            h[2] += scale * (j[0] * vec[1] - j[1] * vec[0]);
        }

        // magnetic charges over the magnetic voxel divergences
        for (p_v, q) in pts_vm.iter().zip(q_vm.iter()) {
            let vec = [p_v[0] - pts[0], p_v[1] - pts[1], p_v[2] - pts[2]];
            let nrm = (vec[0] * vec[0] + vec[1] * vec[1] + vec[2] * vec[2]).sqrt();
            let scale = vol / (4. * std::f64::consts::PI * MU_0 * nrm.powi(3));
            for a in 0..3 {
                h[a] += scale * q * vec[a];
            }
        }

        out.push(h);
    }
    out
}

/// Extend a reduced per-voxel array to the complete voxel grid.
///
/// The reduced entries are scattered at their global voxel indices;
/// the empty voxels keep the provided zero value.
pub fn extend_to_grid<T: Copy>(n_voxel: usize, idx: &[usize], var: &[T], zero: T) -> Vec<T> {
    let mut out = vec![zero; n_voxel];
    for (&g, &v) in idx.iter().zip(var.iter()) {
        out[g] = v;
    }
    out
}

/// Category of an extracted field quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCategory {
    ScalarElectric,
    ScalarMagnetic,
    VectorElectric,
    VectorMagnetic,
    Cloud,
}

/// Extracted field quantities of one sweep.
///
/// The per-voxel arrays are aligned with the reduced index sets
/// (`idx_vc` for electric, `idx_vm` for magnetic quantities). The
/// index sets are carried along so any array can be zero-padded back
/// to the complete voxel grid with [`FieldBundle::extend_electric`]
/// and [`FieldBundle::extend_magnetic`].
#[derive(Debug, Clone, Default)]
pub struct FieldBundle {
    /// Total number of grid voxels.
    pub n_voxel: usize,
    /// Global voxel indices of the electric entries.
    pub idx_vc: Vec<usize>,
    /// Global voxel indices of the magnetic entries.
    pub idx_vm: Vec<usize>,
    /// Electric voxel potentials.
    pub v_vc: Vec<C64>,
    /// Magnetic voxel potentials.
    pub v_vm: Vec<C64>,
    /// Electric current densities.
    pub j_vc: Vec<[C64; 3]>,
    /// Magnetic flux densities.
    pub b_vm: Vec<[C64; 3]>,
    /// Electric loss densities.
    pub p_vc: Vec<f64>,
    /// Magnetic loss densities.
    pub p_vm: Vec<f64>,
    /// Electric charge densities (current divergence).
    pub s_vc: Vec<C64>,
    /// Magnetic charge densities (flux divergence).
    pub q_vm: Vec<C64>,
    /// Magnetic field at the cloud points.
    pub h_cloud: Vec<[C64; 3]>,
}

impl FieldBundle {
    /// Extend a reduced electric array to the full grid (empty
    /// voxels take the zero value).
    pub fn extend_electric<T: Copy>(&self, var: &[T], zero: T) -> Vec<T> {
        extend_to_grid(self.n_voxel, &self.idx_vc, var, zero)
    }

    /// Extend a reduced magnetic array to the full grid (empty
    /// voxels take the zero value).
    pub fn extend_magnetic<T: Copy>(&self, var: &[T], zero: T) -> Vec<T> {
        extend_to_grid(self.n_voxel, &self.idx_vm, var, zero)
    }

    /// Names and categories of the carried quantities.
    pub fn categories() -> &'static [(&'static str, FieldCategory)] {
        &[
            ("V_vc", FieldCategory::ScalarElectric),
            ("V_vm", FieldCategory::ScalarMagnetic),
            ("J_vc", FieldCategory::VectorElectric),
            ("B_vm", FieldCategory::VectorMagnetic),
            ("P_vc", FieldCategory::ScalarElectric),
            ("P_vm", FieldCategory::ScalarMagnetic),
            ("S_vc", FieldCategory::ScalarElectric),
            ("Q_vm", FieldCategory::ScalarMagnetic),
            ("H_cloud", FieldCategory::Cloud),
        ]
    }
}
