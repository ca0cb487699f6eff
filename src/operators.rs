//! Assembly of the resistance, inductance, potential, and coupling
//! operators from the Green and coupling tensors.
//!
//! The diagonal resistance and the self coefficients are plain
//! vectors; the mutual inductance/potential/coupling terms act
//! through FFT circulant operators built once per sweep.

use faer::{Col, ColRef};

use crate::constants::MU_0;
use crate::fft::{CirculantOperator, Tensor4, TensorKind};
use crate::voxel::{FaceTopology, VoxelGrid};
use crate::C64;

/// Squared cross-section scaling `d_b^2*d_c^2` of the axis `a`.
#[inline]
fn axis_scale(d: [f64; 3], a: usize) -> f64 {
    let (b, c) = ((a + 1) % 3, (a + 2) % 3);
    d[b] * d[b] * d[c] * d[c]
}

/// Diagonal resistance vector of the internal faces.
///
/// The face resistivity is the arithmetic mean of its two endpoint
/// voxels (axis component for anisotropic materials), scaled with the
/// face geometry `d_a/(d_b*d_c)`.
pub fn resistance_vector(grid: &VoxelGrid, topo: &FaceTopology, rho_v: &[[C64; 3]]) -> Col<C64> {
    let d = grid.d;
    Col::<C64>::from_fn(topo.n_f(), |k| {
        let a = topo.axis[k];
        let (b, c) = ((a + 1) % 3, (a + 2) % 3);
        let rho = 0.5 * (rho_v[topo.pos[k]][a] + rho_v[topo.neg[k]][a]);
        (d[a] / (d[b] * d[c])) * rho
    })
}

/// Inductance of the electric faces: the self vector feeds the
/// preconditioner, the circulant operator the full system.
pub fn inductance_matrix(
    grid: &VoxelGrid,
    topo: &FaceTopology,
    g_self: f64,
    g_tensor: &Tensor4,
) -> (Col<C64>, CirculantOperator) {
    let d = grid.d;

    let l_vec = Col::<C64>::from_fn(topo.n_f(), |k| {
        C64::new(MU_0 * g_self / axis_scale(d, topo.axis[k]), 0.)
    });

    let mut l_tsr = Tensor4::zeros(g_tensor.nx, g_tensor.ny, g_tensor.nz, 3);
    for a in 0..3 {
        let scale = MU_0 / axis_scale(d, a);
        for iz in 0..g_tensor.nz {
            for iy in 0..g_tensor.ny {
                for ix in 0..g_tensor.nx {
                    l_tsr.set(ix, iy, iz, a, scale * g_tensor.at(ix, iy, iz, 0));
                }
            }
        }
    }

    let op = CirculantOperator::new(
        &l_tsr,
        TensorKind::Diag,
        topo.idx_f.clone(),
        topo.idx_f.clone(),
    );
    (l_vec, op)
}

/// Magnetic potential of the voxels: the self vector feeds the
/// preconditioner, the circulant operator the full system.
pub fn potential_matrix(
    grid: &VoxelGrid,
    topo: &FaceTopology,
    g_self: f64,
    g_tensor: &Tensor4,
) -> (Col<C64>, CirculantOperator) {
    let vol = grid.voxel_volume();
    let p_self = g_self / (MU_0 * vol * vol);
    let p_vec = Col::<C64>::from_fn(topo.n_v(), |_| C64::new(p_self, 0.));

    let mut p_tsr = Tensor4::zeros(g_tensor.nx, g_tensor.ny, g_tensor.nz, 1);
    let scale = 1. / (MU_0 * vol * vol);
    for (dst, src) in p_tsr.data.iter_mut().zip(g_tensor.data.iter()) {
        *dst = scale * src;
    }

    let op = CirculantOperator::new(
        &p_tsr,
        TensorKind::Single,
        topo.idx_v.clone(),
        topo.idx_v.clone(),
    );
    (p_vec, op)
}

/// Projection between face variables and per-axis voxel components.
///
/// A face variable is averaged onto its two endpoint voxels with the
/// weight 1/2, yielding one value per voxel and axis; only the voxels
/// touching at least one face of the axis are kept. The transposed
/// projection retrieves a face variable from the voxel components.
#[derive(Debug, Clone)]
pub struct FaceVoxelProjection {
    /// Kept voxel-component indices in the global `voxel + a*nv`
    /// space (axis-major order).
    pub idx_fv: Vec<usize>,
    face_pos: Vec<usize>,
    face_neg: Vec<usize>,
}

impl FaceVoxelProjection {
    pub fn build(grid: &VoxelGrid, topo: &FaceTopology) -> Self {
        let nv = grid.voxel_count();
        let n_v = topo.n_v();

        let mut idx_fv = Vec::new();
        let mut comp_row = vec![[usize::MAX; 3]; n_v];

        for a in 0..3 {
            let mut kept = vec![false; n_v];
            for k in 0..topo.n_f() {
                if topo.axis[k] == a {
                    kept[topo.pos[k]] = true;
                    kept[topo.neg[k]] = true;
                }
            }
            for (row, &flag) in kept.iter().enumerate() {
                if flag {
                    comp_row[row][a] = idx_fv.len();
                    idx_fv.push(a * nv + topo.idx_v[row]);
                }
            }
        }

        let face_pos = (0..topo.n_f())
            .map(|k| comp_row[topo.pos[k]][topo.axis[k]])
            .collect();
        let face_neg = (0..topo.n_f())
            .map(|k| comp_row[topo.neg[k]][topo.axis[k]])
            .collect();

        FaceVoxelProjection {
            idx_fv,
            face_pos,
            face_neg,
        }
    }

    pub fn n_comp(&self) -> usize {
        self.idx_fv.len()
    }

    /// Face variable to voxel components: `0.5*|A|*x`.
    pub fn apply(&self, x: ColRef<C64>) -> Col<C64> {
        let mut out = Col::<C64>::zeros(self.n_comp());
        for k in 0..x.nrows() {
            out[self.face_pos[k]] += 0.5 * x[k];
            out[self.face_neg[k]] += 0.5 * x[k];
        }
        out
    }

    /// Voxel components to face variable: `0.5*|A|^T*v`.
    pub fn apply_transpose(&self, v: ColRef<C64>) -> Col<C64> {
        Col::<C64>::from_fn(self.face_pos.len(), |k| {
            0.5 * (v[self.face_pos[k]] + v[self.face_neg[k]])
        })
    }
}

/// Electric-magnetic coupling operators.
///
/// The face-to-face coupling matrix is not Toeplitz, so the face
/// variables are first projected onto voxel components, multiplied
/// with the cross circulant tensor, and projected back. The
/// projection costs some accuracy but keeps the FFT acceleration.
pub struct CouplingOperators {
    proj_c: FaceVoxelProjection,
    proj_m: FaceVoxelProjection,
    op_c: CirculantOperator,
    op_m: CirculantOperator,
}

impl CouplingOperators {
    pub fn build(
        grid: &VoxelGrid,
        topo_c: &FaceTopology,
        topo_m: &FaceTopology,
        k_tensor: &Tensor4,
    ) -> Self {
        let proj_c = FaceVoxelProjection::build(grid, topo_c);
        let proj_m = FaceVoxelProjection::build(grid, topo_m);

        let mut k_neg = k_tensor.clone();
        for v in k_neg.data.iter_mut() {
            *v = -*v;
        }

        // magnetic to electric faces
        let op_c = CirculantOperator::new(
            k_tensor,
            TensorKind::Cross,
            proj_c.idx_fv.clone(),
            proj_m.idx_fv.clone(),
        );
        // electric to magnetic faces
        let op_m = CirculantOperator::new(
            &k_neg,
            TensorKind::Cross,
            proj_m.idx_fv.clone(),
            proj_c.idx_fv.clone(),
        );

        CouplingOperators {
            proj_c,
            proj_m,
            op_c,
            op_m,
        }
    }

    /// Coupling from the magnetic face fluxes to the electric faces.
    pub fn apply_electric(&self, i_fm: ColRef<C64>) -> Col<C64> {
        let v_m = self.proj_m.apply(i_fm);
        let v_c = self.op_c.apply(v_m.as_ref());
        self.proj_c.apply_transpose(v_c.as_ref())
    }

    /// Coupling from the electric face currents to the magnetic faces.
    pub fn apply_magnetic(&self, i_fc: ColRef<C64>) -> Col<C64> {
        let v_c = self.proj_c.apply(i_fc);
        let v_m = self.op_m.apply(v_c.as_ref());
        self.proj_m.apply_transpose(v_m.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::green;
    use approx::assert_relative_eq;

    fn grid() -> VoxelGrid {
        VoxelGrid {
            n: [3, 2, 2],
            d: [1e-3, 2e-3, 3e-3],
            c: [0., 0., 0.],
        }
    }

    fn full_topo(grid: &VoxelGrid) -> FaceTopology {
        let idx_v: Vec<usize> = (0..grid.voxel_count()).collect();
        FaceTopology::build(grid, &idx_v)
    }

    #[test]
    fn resistance_averages_endpoints() {
        let g = VoxelGrid {
            n: [2, 1, 1],
            d: [1e-3, 2e-3, 4e-3],
            c: [0., 0., 0.],
        };
        let topo = FaceTopology::build(&g, &[0, 1]);
        assert_eq!(topo.n_f(), 1);

        let rho = vec![
            [C64::new(1e-8, 0.); 3],
            [C64::new(3e-8, 0.); 3],
        ];
        let r = resistance_vector(&g, &topo, &rho);
        // mean resistivity 2e-8, geometry dx/(dy*dz)
        let expected = 2e-8 * 1e-3 / (2e-3 * 4e-3);
        assert_relative_eq!(r[0].re, expected, max_relative = 1e-12);
        assert_eq!(r[0].im, 0.);
    }

    #[test]
    fn inductance_self_terms() {
        let g = grid();
        let topo = full_topo(&g);
        let g_self = green::green_self(g.d);
        let g_tsr = green::green_tensor(&g, 20.);
        let (l_vec, _) = inductance_matrix(&g, &topo, g_self, &g_tsr);

        for k in 0..topo.n_f() {
            let a = topo.axis[k];
            let expected = MU_0 * g_self / axis_scale(g.d, a);
            assert_relative_eq!(l_vec[k].re, expected, max_relative = 1e-12);
        }
    }

    #[test]
    fn inductance_operator_diagonal_matches_self() {
        // applying the operator to a unit vector recovers the
        // diagonal entry, which is the self-inductance
        let g = grid();
        let topo = full_topo(&g);
        let g_self = green::green_self(g.d);
        let g_tsr = green::green_tensor(&g, 20.);
        let (l_vec, l_op) = inductance_matrix(&g, &topo, g_self, &g_tsr);

        let mut x = Col::<C64>::zeros(topo.n_f());
        x[0] = C64::new(1., 0.);
        let y = l_op.apply(x.as_ref());
        assert_relative_eq!(y[0].re, l_vec[0].re, max_relative = 1e-10);
    }

    #[test]
    fn projection_distributes_face_value() {
        let g = VoxelGrid {
            n: [2, 1, 1],
            d: [1e-3; 3],
            c: [0.; 3],
        };
        let topo = FaceTopology::build(&g, &[0, 1]);
        let proj = FaceVoxelProjection::build(&g, &topo);

        // one x-face: both voxels keep an x component
        assert_eq!(proj.n_comp(), 2);
        let mut x = Col::<C64>::zeros(1);
        x[0] = C64::new(2., 0.);
        let v = proj.apply(x.as_ref());
        assert_eq!(v[0], C64::new(1., 0.));
        assert_eq!(v[1], C64::new(1., 0.));

        let back = proj.apply_transpose(v.as_ref());
        assert_eq!(back[0], C64::new(1., 0.));
    }
}
