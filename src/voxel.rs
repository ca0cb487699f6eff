//! Voxel grid geometry: coordinates and the voxel-face incidence.
//!
//! Each voxel owns three outgoing faces (+x, +y, +z). The global face
//! index space has the size `3*nx*ny*nz` and is partitioned by the
//! face direction: face `a*nv + i` connects voxel `i` to its neighbor
//! in the direction `a`. The signed incidence carries `+1` on the
//! owning voxel and `-1` on the neighbor.

use std::collections::BTreeMap;

use faer::{Col, ColRef};

use crate::C64;

/// Uniform voxel grid: `n` cells of the size `d` centered at `c`.
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    pub n: [usize; 3],
    pub d: [f64; 3],
    pub c: [f64; 3],
}

impl VoxelGrid {
    /// Total number of voxels.
    pub fn voxel_count(&self) -> usize {
        self.n[0] * self.n[1] * self.n[2]
    }

    /// Total number of faces (three per voxel).
    pub fn face_count(&self) -> usize {
        3 * self.voxel_count()
    }

    /// Volume of a single voxel.
    pub fn voxel_volume(&self) -> f64 {
        self.d[0] * self.d[1] * self.d[2]
    }

    /// Decompose a linear voxel index into the grid subscripts.
    #[inline]
    pub fn subscripts(&self, idx: usize) -> [usize; 3] {
        let [nx, ny, _] = self.n;
        [idx % nx, (idx / nx) % ny, idx / (nx * ny)]
    }

    /// Linear voxel index from the grid subscripts.
    #[inline]
    pub fn linear(&self, sub: [usize; 3]) -> usize {
        let [nx, ny, _] = self.n;
        sub[0] + nx * sub[1] + nx * ny * sub[2]
    }

    /// Center coordinate of a single voxel.
    pub fn voxel_center(&self, idx: usize) -> [f64; 3] {
        let sub = self.subscripts(idx);
        let mut pts = [0.; 3];
        for a in 0..3 {
            let origin = self.c[a] - (self.n[a] as f64 * self.d[a]) / 2.;
            pts[a] = origin + self.d[a] / 2. + self.d[a] * sub[a] as f64;
        }
        pts
    }

    /// Center coordinates of all the voxels.
    pub fn voxel_coordinates(&self) -> Vec<[f64; 3]> {
        (0..self.voxel_count()).map(|i| self.voxel_center(i)).collect()
    }
}

/// Voxel geometry as delivered by the mesher.
#[derive(Debug, Clone, Default)]
pub struct Geometry {
    pub grid: VoxelGrid,
    /// Named voxel domains (sorted unique indices).
    pub domain_def: BTreeMap<String, Vec<usize>>,
    /// Connected components of the voxel structure.
    pub graph_def: Vec<Vec<usize>>,
    /// Points where the magnetic field is evaluated.
    pub pts_cloud: Vec<[f64; 3]>,
}

impl Default for VoxelGrid {
    fn default() -> Self {
        VoxelGrid {
            n: [1, 1, 1],
            d: [1., 1., 1.],
            c: [0., 0., 0.],
        }
    }
}

/// Reduced voxel-face incidence for one material class.
///
/// Only the faces with two non-empty endpoint voxels are kept
/// (internal faces). For the face `k`, `pos[k]`/`neg[k]` are the local
/// rows (into `idx_v`) of the voxels entered with `+1`/`-1` in the
/// signed incidence, and `axis[k]` is the face direction.
#[derive(Debug, Clone, Default)]
pub struct FaceTopology {
    /// Global indices of the non-empty voxels (sorted).
    pub idx_v: Vec<usize>,
    /// Global indices of the internal faces (sorted).
    pub idx_f: Vec<usize>,
    pub pos: Vec<usize>,
    pub neg: Vec<usize>,
    pub axis: Vec<usize>,
}

impl FaceTopology {
    /// Build the reduced incidence for a set of non-empty voxels.
    ///
    /// The full incidence is never materialized: a face `a*nv + i` is
    /// internal exactly when both `i` and its `a`-neighbor belong to
    /// `idx_v`, so the reduction is done while scanning the set.
    pub fn build(grid: &VoxelGrid, idx_v: &[usize]) -> Self {
        let nv = grid.voxel_count();
        let step = [1, grid.n[0], grid.n[0] * grid.n[1]];

        // local row of each non-empty voxel
        let mut local = vec![usize::MAX; nv];
        for (row, &idx) in idx_v.iter().enumerate() {
            local[idx] = row;
        }

        let mut idx_f = Vec::new();
        let mut pos = Vec::new();
        let mut neg = Vec::new();
        let mut axis = Vec::new();

        // scan in global face order (direction-major, then voxel)
        for a in 0..3 {
            for &idx in idx_v {
                if grid.subscripts(idx)[a] + 1 >= grid.n[a] {
                    continue;
                }
                let adj = idx + step[a];
                if local[adj] == usize::MAX {
                    continue;
                }
                idx_f.push(a * nv + idx);
                pos.push(local[idx]);
                neg.push(local[adj]);
                axis.push(a);
            }
        }

        FaceTopology {
            idx_v: idx_v.to_vec(),
            idx_f,
            pos,
            neg,
            axis,
        }
    }

    /// Number of non-empty voxels.
    pub fn n_v(&self) -> usize {
        self.idx_v.len()
    }

    /// Number of internal faces.
    pub fn n_f(&self) -> usize {
        self.idx_f.len()
    }

    /// Signed incidence product `A*x` (face variable to voxel sums).
    pub fn apply(&self, x: ColRef<C64>) -> Col<C64> {
        let mut out = Col::<C64>::zeros(self.n_v());
        for k in 0..self.n_f() {
            out[self.pos[k]] += x[k];
            out[self.neg[k]] -= x[k];
        }
        out
    }

    /// Transposed incidence product `A^T*v` (voxel differences).
    pub fn apply_transpose(&self, v: ColRef<C64>) -> Col<C64> {
        Col::<C64>::from_fn(self.n_f(), |k| v[self.pos[k]] - v[self.neg[k]])
    }

    /// Unsigned incidence product `|A|*x`.
    pub fn apply_abs(&self, x: ColRef<C64>) -> Col<C64> {
        let mut out = Col::<C64>::zeros(self.n_v());
        for k in 0..self.n_f() {
            out[self.pos[k]] += x[k];
            out[self.neg[k]] += x[k];
        }
        out
    }

    /// Transposed unsigned incidence product `|A|^T*v`.
    pub fn apply_abs_transpose(&self, v: ColRef<C64>) -> Col<C64> {
        Col::<C64>::from_fn(self.n_f(), |k| v[self.pos[k]] + v[self.neg[k]])
    }
}
